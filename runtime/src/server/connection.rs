use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::dispatch::Dispatcher;
use crate::protocol::{ProtocolError, Reply, ServerCodec};

/// One client connection. Requests are handled strictly in order, so replies
/// to pipelined requests queue behind a pending `run`.
pub(crate) struct Connection {
    id: u64,
    framed: Framed<UnixStream, ServerCodec>,
    dispatcher: Dispatcher,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        stream: UnixStream,
        dispatcher: Dispatcher,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            id,
            framed: Framed::new(stream, ServerCodec::default()),
            dispatcher,
            _permit: permit,
        }
    }

    pub(crate) async fn serve(mut self) {
        debug!(conn = self.id, "connection opened");
        while let Some(frame) = self.framed.next().await {
            let request = match frame {
                Ok(request) => request,
                Err(ProtocolError::Io(err)) => {
                    debug!(conn = self.id, error = %err, "connection read failed");
                    break;
                }
                Err(err) => {
                    // The stream cannot be resynchronized after a framing error.
                    warn!(conn = self.id, error = %err, "closing connection after framing error");
                    let _ = self
                        .framed
                        .send(Reply::error(format!("protocol error: {err}")))
                        .await;
                    break;
                }
            };

            let reply = self.dispatcher.dispatch(request).await;
            if let Err(err) = self.framed.send(reply).await {
                debug!(conn = self.id, error = %err, "dropping reply for departed client");
                break;
            }
        }
        debug!(conn = self.id, "connection closed");
    }
}
