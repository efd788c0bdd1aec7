use clap::Parser;
use duet_core::{DuetConfig, init_observability};
use duet_server::{AppState, router};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "duet-server", about = "Serve the Gemini + Claude generate-then-review pipeline over HTTP")]
struct Args {
    /// Address to bind.
    #[arg(long, env = "DUET_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "DUET_PORT", default_value_t = 3001)]
    port: u16,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining connections");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_observability();
    let args = Args::parse();

    let config = DuetConfig::from_env()?;
    info!(
        workspace_dir = %config.workspace_dir.display(),
        gemini = %config.commands.gemini,
        claude = %config.commands.claude,
        timeout_ms = config.timeout_ms(),
        "loaded configuration"
    );

    let app = router(AppState::from_config(&config));
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "duet server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown complete");
    Ok(())
}
