//! Warden daemon core: container registry, job supervision, the control
//! protocol and its Unix socket server.

pub mod client;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{Client, ClientError, RunOutput};
pub use container::{Handle, Registry, RunSettings};
pub use dispatch::{Command, Dispatcher};
pub use error::{WardenError, WardenResult};
pub use server::{Server, ServerSettings};
