//! Unix socket control server.

mod connection;

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use capsules_container_exec::IsolationBackend;
use config_loader::WardenConfig;
use tokio::net::UnixListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::container::{Registry, RunSettings};
use crate::dispatch::Dispatcher;
use connection::Connection;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    pub max_connections: usize,
    pub run: RunSettings,
}

impl From<&WardenConfig> for ServerSettings {
    fn from(config: &WardenConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            socket_mode: config.socket_mode,
            max_connections: config.max_connections,
            run: RunSettings {
                capture_path: config.capture_path.clone(),
                kill_grace: config.kill_grace,
            },
        }
    }
}

pub struct Server {
    settings: ServerSettings,
    listener: UnixListener,
    dispatcher: Dispatcher,
    connections: Arc<Semaphore>,
}

impl Server {
    /// Bind the control socket, replacing a stale socket file left behind by a
    /// previous daemon.
    #[instrument(skip_all, fields(socket = %settings.socket_path.display()))]
    pub fn bind(settings: ServerSettings, backend: Arc<dyn IsolationBackend>) -> Result<Self> {
        let path = &settings.socket_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
        }
        remove_stale_socket(path)?;

        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        set_socket_mode(path, settings.socket_mode)?;

        let registry = Arc::new(Registry::new(backend, settings.run.clone()));
        info!(
            mode = format_args!("{:o}", settings.socket_mode),
            max_connections = settings.max_connections,
            "control socket bound"
        );
        Ok(Self {
            connections: Arc::new(Semaphore::new(settings.max_connections.max(1))),
            dispatcher: Dispatcher::new(registry),
            listener,
            settings,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.settings.socket_path
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.dispatcher.registry()
    }

    /// Serve until `shutdown` resolves, then destroy every container and
    /// remove the socket file.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut next_id: u64 = 0;

        loop {
            let permit = tokio::select! {
                biased;
                permit = self.connections.clone().acquire_owned() => {
                    permit.context("connection semaphore closed")?
                }
                _ = &mut shutdown => break,
            };

            // Connections already queued are served before shutdown is honoured.
            let stream = tokio::select! {
                biased;
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            next_id += 1;
            let connection = Connection::new(next_id, stream, self.dispatcher.clone(), permit);
            tokio::spawn(connection.serve());
        }

        info!("shutting down");
        self.registry().shutdown().await;
        drop(self.listener);
        match std::fs::remove_file(&self.settings.socket_path) {
            Ok(()) => debug!(socket = %self.settings.socket_path.display(), "socket removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(error = %err, "failed to remove socket"),
        }
        Ok(())
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("failed to stat {}", path.display())),
    };
    if !is_socket(&metadata) {
        bail!("{} exists and is not a socket", path.display());
    }
    debug!(socket = %path.display(), "removing stale socket");
    std::fs::remove_file(path)
        .with_context(|| format!("failed to remove stale socket {}", path.display()))
}

#[cfg(unix)]
fn is_socket(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    metadata.file_type().is_socket()
}

#[cfg(not(unix))]
fn is_socket(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_socket_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_socket_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
