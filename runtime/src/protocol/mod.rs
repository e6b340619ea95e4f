//! Wire protocol: arrays of bulk strings in, RESP-style replies out.

mod codec;
mod frame;

pub use codec::{ClientCodec, ProtocolError, ServerCodec, MAX_ARGS, MAX_BULK_LEN};
pub use frame::{Reply, Request};
