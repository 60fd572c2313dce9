use anyhow::{Context, Result};
use sni_router::{App, AppConfig, logging};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    // Load config first (before logging init) to get logging config
    let config = AppConfig::load_or_default(&config_path);

    config
        .validate()
        .context("Configuration validation failed")?;

    let _guard =
        logging::init_logging(&config.logging).context("Failed to initialize logging system")?;

    info!("SNI router starting with config {}", config_path);
    info!(
        "Logging initialized - level: {}, file: {:?}, json: {}",
        config.logging.level, config.logging.file, config.logging.json
    );

    let mut app = App::new(config);
    if let Some(status) = app.start().await.context("Failed to start SNI router")? {
        for proxy in status.proxies.iter().filter(|p| p.running) {
            info!("127.0.0.1:{} -> {}", proxy.local_port, proxy.authority());
        }
    }

    info!("SNI router started. Press Ctrl+C to shutdown.");
    wait_for_shutdown(&mut app, &config_path).await?;

    info!("Shutdown signal received, shutting down gracefully...");
    app.shutdown().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(app: &mut App, config_path: &str) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                return result.context("Failed to listen for shutdown signal");
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading {}", config_path);
                match AppConfig::from_file(config_path) {
                    Ok(config) => {
                        if let Err(e) = app.reload(config).await {
                            error!("Reload failed: {:#}", e);
                        }
                    }
                    Err(e) => error!("Reload failed: {:#}", e),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_app: &mut App, _config_path: &str) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")
}
