#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use capsules_container_exec::{LocalBackend, LocalBackendConfig};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use warden_runtime::{Client, Registry, RunSettings, Server, ServerSettings};

/// A daemon serving on a socket inside its own temporary directory.
pub struct TestDaemon {
    dir: TempDir,
    socket: PathBuf,
    registry: Arc<Registry>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestDaemon {
    pub async fn start() -> Self {
        Self::start_with(16).await
    }

    pub async fn start_with(max_connections: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("warden.sock");
        let settings = ServerSettings {
            socket_path: socket.clone(),
            socket_mode: 0o600,
            max_connections,
            run: RunSettings {
                capture_path: dir.path().join("captures"),
                kill_grace: Duration::from_millis(500),
            },
        };
        let backend = LocalBackend::new(LocalBackendConfig {
            depot_path: dir.path().join("depot"),
            ..LocalBackendConfig::default()
        });

        let server = Server::bind(settings, Arc::new(backend)).unwrap();
        let registry = server.registry().clone();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async {
            let _ = rx.await;
        }));

        Self {
            dir,
            socket,
            registry,
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    pub async fn client(&self) -> Client {
        Client::connect(&self.socket).await.unwrap()
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn depot(&self) -> PathBuf {
        self.dir.path().join("depot")
    }

    pub fn captures(&self) -> PathBuf {
        self.dir.path().join("captures")
    }

    /// Trigger graceful shutdown and wait for the server loop to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("server did not shut down")
                .unwrap()
                .unwrap();
        }
    }
}

/// Poll until `probe` holds or a few seconds pass.
pub async fn eventually<F, Fut>(mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Wait until the container named by `handle` has a job in flight.
pub async fn wait_for_job(registry: &Registry, handle: &str) {
    let handle = warden_runtime::Handle::parse(handle).unwrap();
    let running = eventually(|| {
        let handle = handle.clone();
        async move {
            match registry.lookup(&handle).await {
                Ok(container) => container.job_count().await > 0,
                Err(_) => false,
            }
        }
    })
    .await;
    assert!(running, "job never started in {handle}");
}
