//! Async client for the control protocol.

use std::path::{Path, PathBuf};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::protocol::{ClientCodec, ProtocolError, Reply, Request};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(ProtocolError),
    /// Error reply from the daemon, without the `ERR ` prefix.
    #[error("server error: {0}")]
    Server(String),
    #[error("connection closed by daemon")]
    Closed,
    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(Reply),
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(err) => ClientError::Io(err),
            other => ClientError::Protocol(other),
        }
    }
}

/// Result of a `run` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_status: i64,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

pub struct Client {
    framed: Framed<UnixStream, ClientCodec>,
}

impl Client {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self {
            framed: Framed::new(stream, ClientCodec),
        })
    }

    /// Queue a request without waiting for its reply.
    pub async fn send(&mut self, request: Request) -> Result<(), ClientError> {
        self.framed.send(request).await?;
        Ok(())
    }

    /// Write bytes verbatim, bypassing the encoder.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Next reply in request order. Error replies are returned as values.
    pub async fn read(&mut self) -> Result<Reply, ClientError> {
        match self.framed.next().await {
            Some(reply) => Ok(reply?),
            None => Err(ClientError::Closed),
        }
    }

    pub async fn call(&mut self, args: &[&str]) -> Result<Reply, ClientError> {
        self.send(Request::from_strs(args)).await?;
        self.read().await
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        match into_result(self.call(&["ping"]).await?)? {
            Reply::Status(status) if status == "pong" => Ok(()),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    pub async fn create(&mut self) -> Result<String, ClientError> {
        let reply = into_result(self.call(&["create"]).await?)?;
        if let Reply::Bulk(bytes) = &reply {
            if let Ok(handle) = std::str::from_utf8(bytes) {
                return Ok(handle.to_string());
            }
        }
        Err(ClientError::UnexpectedReply(reply))
    }

    pub async fn destroy(&mut self, handle: &str) -> Result<(), ClientError> {
        match into_result(self.call(&["destroy", handle]).await?)? {
            Reply::Status(status) if status == "ok" => Ok(()),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    pub async fn run(&mut self, handle: &str, command_line: &str) -> Result<RunOutput, ClientError> {
        let reply = into_result(self.call(&["run", handle, command_line]).await?)?;
        if let Reply::Array(items) = &reply {
            if let [Reply::Integer(code), Reply::Bulk(stdout), Reply::Bulk(stderr)] = items.as_slice() {
                return Ok(RunOutput {
                    exit_status: *code,
                    stdout: bytes_to_path(stdout),
                    stderr: bytes_to_path(stderr),
                });
            }
        }
        Err(ClientError::UnexpectedReply(reply))
    }
}

fn into_result(reply: Reply) -> Result<Reply, ClientError> {
    match reply {
        Reply::Error(message) => {
            let message = message
                .strip_prefix("ERR ")
                .map(str::to_string)
                .unwrap_or(message);
            Err(ClientError::Server(message))
        }
        other => Ok(other),
    }
}

#[cfg(unix)]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}
