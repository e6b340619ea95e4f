//! Command dispatch: turns a decoded request into registry operations and a reply.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error};

use crate::container::{Handle, JobState, Registry};
use crate::error::{WardenError, WardenResult};
use crate::protocol::{Reply, Request};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Create,
    Destroy { handle: Handle },
    Run { handle: Handle, command_line: String },
}

impl Command {
    pub fn parse(request: &Request) -> WardenResult<Command> {
        let (name, args) = request
            .args()
            .split_first()
            .ok_or_else(|| WardenError::protocol("empty request"))?;
        let name = String::from_utf8_lossy(name).to_ascii_lowercase();

        let arity = |expected: usize| {
            if args.len() == expected {
                Ok(())
            } else {
                Err(WardenError::protocol(format!(
                    "wrong number of arguments for '{name}' command"
                )))
            }
        };

        match name.as_str() {
            "ping" => {
                arity(0)?;
                Ok(Command::Ping)
            }
            "create" => {
                arity(0)?;
                Ok(Command::Create)
            }
            "destroy" => {
                arity(1)?;
                Ok(Command::Destroy {
                    handle: parse_handle(&args[0])?,
                })
            }
            "run" => {
                arity(2)?;
                let handle = parse_handle(&args[0])?;
                let command_line = String::from_utf8(args[1].to_vec())
                    .map_err(|_| WardenError::protocol("command line is not valid UTF-8"))?;
                Ok(Command::Run {
                    handle,
                    command_line,
                })
            }
            _ => Err(WardenError::protocol(format!("unknown command '{name}'"))),
        }
    }
}

/// Anything that could not have been issued resolves like a destroyed handle.
fn parse_handle(raw: &Bytes) -> WardenResult<Handle> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(Handle::parse)
        .ok_or(WardenError::UnknownHandle)
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Never fails: every error becomes an error reply.
    pub async fn dispatch(&self, request: Request) -> Reply {
        let result = match Command::parse(&request) {
            Ok(command) => self.execute(command).await,
            Err(err) => Err(err),
        };
        result.unwrap_or_else(|err| {
            if err.is_internal() {
                error!(error = %err, "request failed");
            }
            err.to_reply()
        })
    }

    pub async fn execute(&self, command: Command) -> WardenResult<Reply> {
        match command {
            Command::Ping => Ok(Reply::status("pong")),
            Command::Create => {
                let handle = self.registry.create().await?;
                Ok(Reply::bulk(handle.to_string()))
            }
            Command::Destroy { handle } => {
                self.registry.destroy(&handle).await?;
                Ok(Reply::status("ok"))
            }
            Command::Run {
                handle,
                command_line,
            } => {
                let job = self.registry.spawn_job(&handle, command_line).await?;
                match job.wait().await {
                    JobState::Completed(code) => Ok(Reply::Array(vec![
                        Reply::Integer(i64::from(code)),
                        Reply::bulk(path_bytes(job.stdout_path())),
                        Reply::bulk(path_bytes(job.stderr_path())),
                    ])),
                    JobState::Aborted => {
                        debug!(handle = %handle, job = %job.id(), "run aborted by destroy");
                        Err(WardenError::ExecutionAborted)
                    }
                    JobState::Failed(message) => Err(WardenError::Internal(message)),
                    JobState::Running => Err(WardenError::internal("job ended without a result")),
                }
            }
        }
    }
}

#[cfg(unix)]
fn path_bytes(path: &std::path::Path) -> Bytes {
    use std::os::unix::ffi::OsStrExt;
    Bytes::copy_from_slice(path.as_os_str().as_bytes())
}

#[cfg(not(unix))]
fn path_bytes(path: &std::path::Path) -> Bytes {
    Bytes::from(path.to_string_lossy().into_owned())
}
