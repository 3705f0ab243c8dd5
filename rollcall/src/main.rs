use clap::Parser;
use tokio::signal;

use rollcall::config::RuntimeConfig;
use rollcall::server::Server;

/// Replicated student roster node.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path of the TOML runtime config.
    #[arg(long, default_value = "config.toml")]
    config: String,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = RuntimeConfig::from_toml(&args.config);
    log::info!("starting {} with {:?}", config.node_id, config);

    let mut server = Server::new(config);
    server.start().await?;
    shutdown_signal().await;
    server.stop();
    Ok(())
}
