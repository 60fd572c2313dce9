use crate::config::{AppConfig, ConfigSource};
use crate::events::FleetEvent;
use crate::fleet::{FleetSettings, ProxyFleet, ProxyStatus};
use crate::status::StatusServer;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct App {
    config: AppConfig,
    fleet: Arc<ProxyFleet>,
    status_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        let fleet = Arc::new(ProxyFleet::new(FleetSettings::from(&config)));
        Self {
            config,
            fleet,
            status_addr: None,
            tasks: Vec::new(),
        }
    }

    pub fn fleet(&self) -> &Arc<ProxyFleet> {
        &self.fleet
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Address the status server is bound to, once started.
    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status_addr
    }

    /// Start the status server, the traffic log task and (with
    /// `auto_start`) the proxy fleet.
    pub async fn start(&mut self) -> Result<Option<ProxyStatus>> {
        info!("Starting SNI router...");

        self.tasks.push(spawn_traffic_logger(&self.fleet));

        if self.config.status.enabled {
            let server = StatusServer::bind(&self.config.status, Arc::clone(&self.fleet)).await?;
            self.status_addr = Some(server.local_addr()?);
            self.tasks.push(tokio::spawn(server.run()));
        } else {
            info!("Status server is disabled");
        }

        if !self.config.proxy.auto_start {
            info!("Auto start disabled, proxy fleet left stopped");
            return Ok(None);
        }

        let status = self.start_fleet(&self.config).await?;
        Ok(Some(status))
    }

    async fn start_fleet(&self, source: &dyn ConfigSource) -> Result<ProxyStatus> {
        let proxy = source.proxy_config();
        self.fleet
            .start(&proxy, &source.rules())
            .await
            .context("Failed to start proxy fleet")
    }

    /// Apply a new configuration.
    ///
    /// Rules and the default action are swapped in place. Listeners are only
    /// rebuilt when the proxy list, start port, bind address or `[tunnel]`
    /// settings changed. `[events]`, `[logging]` and `[status]` changes are
    /// reported and kept for the next process start.
    pub async fn reload(&mut self, config: AppConfig) -> Result<()> {
        config
            .validate()
            .context("Reloaded configuration is invalid")?;

        let tunnel_changed = self.config.tunnel != config.tunnel;
        let restart = self.config.proxy.needs_restart(&config.proxy) || tunnel_changed;
        self.fleet.update_default_action(config.proxy.default_action);
        self.fleet.update_rules(&config.rules);
        if tunnel_changed {
            self.fleet
                .update_tunnel_settings(config.tunnel.sniff_config(), config.tunnel.port_retry_limit)
                .await;
        }

        let pending = self.config.process_restart_sections(&config);
        if !pending.is_empty() {
            warn!(
                sections = ?pending,
                "Changed settings take effect after a process restart"
            );
        }

        if restart && self.fleet.is_running().await {
            info!("Proxy list, ports or tunnel settings changed, restarting proxy fleet");
            let status = self
                .fleet
                .restart(&config.proxy_config(), &config.rules())
                .await
                .context("Failed to restart proxy fleet")?;
            info!(
                "Proxy fleet restarted: {}/{} running",
                status.running_count(),
                status.total_count()
            );
        } else {
            info!("Rules reloaded ({} enabled)", self.fleet.router().rule_count());
        }

        self.config = config;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        self.fleet.stop().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("SNI router stopped");
    }
}

fn spawn_traffic_logger(fleet: &ProxyFleet) -> JoinHandle<()> {
    let mut events = fleet.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(FleetEvent::Traffic(event)) if event.is_closed() => {
                    info!(
                        method = %event.method,
                        host = %event.effective_hostname(),
                        url = %event.url,
                        action = %event.action,
                        rule = event.matched_rule.as_deref().unwrap_or("-"),
                        local_port = event.local_port,
                        bytes_in = event.bytes_in,
                        bytes_out = event.bytes_out,
                        "Traffic"
                    );
                }
                Ok(FleetEvent::ListenerError {
                    local_port,
                    message,
                }) => {
                    warn!(local_port, "Listener error: {}", message);
                }
                Ok(other) => debug!("Fleet event: {:?}", other),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Traffic logger lagging, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
