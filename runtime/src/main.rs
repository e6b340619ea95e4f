use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use capsules_container_exec::{LocalBackend, LocalBackendConfig};
use clap::Parser;
use config_loader::{ConfigLoader, WardenConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use warden_runtime::{Server, ServerSettings};

#[derive(Parser)]
#[command(name = "warden", version, about = "Container control daemon")]
struct Cli {
    /// YAML or JSON config file
    #[arg(long, value_name = "FILE", env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,
    /// Control socket path
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,
    /// Directory holding container environments
    #[arg(long, value_name = "DIR")]
    depot: Option<PathBuf>,
    /// Directory receiving captured job output
    #[arg(long, value_name = "DIR")]
    captures: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut WardenConfig) {
        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        if let Some(depot) = &self.depot {
            config.depot_path = depot.clone();
        }
        if let Some(captures) = &self.captures {
            config.capture_path = captures.clone();
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load().context("failed to load configuration")?;
    cli.apply(&mut config);

    let backend = LocalBackend::new(LocalBackendConfig {
        depot_path: config.depot_path.clone(),
        shell: config.shell.clone(),
    });
    std::fs::create_dir_all(&config.capture_path).with_context(|| {
        format!(
            "failed to create capture directory {}",
            config.capture_path.display()
        )
    })?;

    let server = Server::bind(ServerSettings::from(&config), Arc::new(backend))?;
    info!(
        socket = %config.socket_path.display(),
        depot = %config.depot_path.display(),
        captures = %config.capture_path.display(),
        "warden listening"
    );
    server.run(shutdown_signal()).await
}
