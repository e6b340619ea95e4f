//! Isolation backend for warden containers.
//!
//! The daemon core only talks to [`IsolationBackend`] and [`ProcessHandle`];
//! [`LocalBackend`] is the implementation shipped with the daemon. It gives
//! every container its own working directory under a depot and runs commands
//! through a shell in a dedicated process group so they can be torn down as a
//! unit.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod local;

pub use local::{LocalBackend, LocalBackendConfig, LocalProcess};

/// A command to start inside a container, with its output sinks.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub command_line: String,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, or `128 + signal` when the process was killed by a signal.
    pub code: i32,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Prepare the environment for a freshly allocated container.
    async fn provision(&self, handle: &str) -> Result<(), BackendError>;

    /// Start `request.command_line` inside the container. Both output sinks are
    /// created (or truncated) before the process starts.
    async fn spawn(
        &self,
        handle: &str,
        request: SpawnRequest,
    ) -> Result<Box<dyn ProcessHandle>, BackendError>;

    /// Remove whatever `provision` created. Best effort.
    async fn teardown(&self, handle: &str) -> Result<(), BackendError>;
}

#[async_trait]
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Resolve once the process has exited. Cancel safe.
    async fn wait(&mut self) -> Result<ExitReport, BackendError>;

    /// Ask the process to stop, escalating to a hard kill after `grace`.
    /// A process that is already gone is not an error.
    async fn terminate(&mut self, grace: Duration) -> Result<(), BackendError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

impl BackendError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BackendError::Io {
            context: context.into(),
            source,
        }
    }
}
