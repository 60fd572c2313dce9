//! The set of local listeners built from one proxy list.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ProxyConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::events::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_TRAFFIC_LOG_CAPACITY, EventBus, FleetEvent, TrafficEvent,
    TrafficLog, TrafficSink,
};
use crate::listener::{ListenerOptions, ProxyListener};
use crate::metrics::Metrics;
use crate::proxy::RouteDecider;
use crate::rules::{Action, PatternValidation, Rule, RuleRouter};
use crate::sni::SniffConfig;
use crate::upstream::{UpstreamProxyEntry, parse_proxy_list};

/// Snapshot of the fleet for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyStatus {
    pub running: bool,
    pub proxies: Vec<UpstreamProxyEntry>,
    pub local_ips: Vec<String>,
}

impl ProxyStatus {
    pub fn running_count(&self) -> usize {
        self.proxies.iter().filter(|p| p.running).count()
    }

    pub fn total_count(&self) -> usize {
        self.proxies.len()
    }
}

/// Fleet tunables. Tunnel settings can be replaced with
/// [`ProxyFleet::update_tunnel_settings`]; the event capacities are fixed.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub sniff: SniffConfig,
    pub port_retry_limit: usize,
    pub traffic_log_capacity: usize,
    pub channel_capacity: usize,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            sniff: SniffConfig::default(),
            port_retry_limit: 100,
            traffic_log_capacity: DEFAULT_TRAFFIC_LOG_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl From<&AppConfig> for FleetSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            sniff: config.tunnel.sniff_config(),
            port_retry_limit: config.tunnel.port_retry_limit,
            traffic_log_capacity: config.events.traffic_log_capacity,
            channel_capacity: config.events.channel_capacity,
        }
    }
}

/// Shared sink for every listener in the fleet.
struct FleetHub {
    bus: EventBus,
    log: TrafficLog,
    metrics: Metrics,
    next_id: AtomicU64,
}

impl TrafficSink for FleetHub {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record(&self, event: TrafficEvent) {
        self.log.push(event.clone());
        self.metrics.record_traffic(&event);
        self.bus.publish(FleetEvent::Traffic(event));
    }

    fn listener_error(&self, local_port: u16, message: String) {
        warn!(local_port, error = %message, "Listener error");
        self.bus
            .publish(FleetEvent::ListenerError { local_port, message });
    }

    fn upstream_error(&self, local_port: u16, message: String) {
        debug!(local_port, error = %message, "Upstream error recorded");
        self.metrics.record_upstream_error();
    }
}

struct FleetState {
    running: bool,
    entries: Vec<UpstreamProxyEntry>,
    listeners: Vec<ProxyListener>,
    /// Applied to listeners at the next start
    sniff: SniffConfig,
    port_retry_limit: usize,
}

/// Owns the listeners, the rule router and the traffic history.
///
/// Lifecycle operations are serialized; rule updates and traffic queries do
/// not wait for them.
pub struct ProxyFleet {
    router: Arc<RuleRouter>,
    hub: Arc<FleetHub>,
    state: Mutex<FleetState>,
}

impl Default for ProxyFleet {
    fn default() -> Self {
        Self::new(FleetSettings::default())
    }
}

impl ProxyFleet {
    pub fn new(settings: FleetSettings) -> Self {
        let hub = FleetHub {
            bus: EventBus::new(settings.channel_capacity),
            log: TrafficLog::new(settings.traffic_log_capacity),
            metrics: Metrics::new(),
            next_id: AtomicU64::new(0),
        };
        Self {
            router: Arc::new(RuleRouter::new()),
            hub: Arc::new(hub),
            state: Mutex::new(FleetState {
                running: false,
                entries: Vec::new(),
                listeners: Vec::new(),
                sniff: settings.sniff,
                port_retry_limit: settings.port_retry_limit,
            }),
        }
    }

    /// Parse the proxy list and bring up one listener per entry.
    ///
    /// A running fleet is stopped first and its entries are dropped, even
    /// when the new configuration turns out to be unusable. Entry `n` asks for
    /// `start_port + n`; ports that are taken are skipped, up to the
    /// configured retry limit. Fails only if no listener could be started.
    pub async fn start(&self, config: &ProxyConfig, rules: &[Rule]) -> ProxyResult<ProxyStatus> {
        let mut state = self.state.lock().await;
        if state.running {
            self.stop_locked(&mut state).await;
        }
        state.entries.clear();

        self.router.set_default_action(config.default_action);
        self.router.load_rules(rules);

        let bind_ip = config.bind_ip()?;
        let mut entries = parse_proxy_list(&config.proxy_list, config.start_port);
        if entries.is_empty() {
            return Err(ProxyError::NoValidProxies);
        }

        let sniff = state.sniff.clone();
        let retry_limit = state.port_retry_limit;
        let mut claimed = HashSet::new();
        let mut listeners = Vec::with_capacity(entries.len());
        for entry in entries.iter_mut() {
            if let Some(listener) = self
                .bind_entry(bind_ip, entry, &sniff, retry_limit, &mut claimed)
                .await
            {
                listeners.push(listener);
            }
        }

        if listeners.is_empty() {
            let attempted = entries.len();
            state.entries = entries;
            return Err(ProxyError::NoListenerStarted { attempted });
        }

        state.running = true;
        state.entries = entries;
        state.listeners = listeners;
        self.hub.metrics.set_listeners_running(state.listeners.len());

        let status = self.status_of(&state);
        info!(
            running = status.running_count(),
            total = status.total_count(),
            "Proxy fleet started"
        );
        self.hub.bus.publish(FleetEvent::Started(status.clone()));
        Ok(status)
    }

    /// Find a free port for one entry, starting at its assigned port.
    async fn bind_entry(
        &self,
        bind_ip: IpAddr,
        entry: &mut UpstreamProxyEntry,
        sniff: &SniffConfig,
        retry_limit: usize,
        claimed: &mut HashSet<u16>,
    ) -> Option<ProxyListener> {
        let mut candidate = Some(entry.local_port);

        for _ in 0..retry_limit {
            let mut port = candidate?;
            while claimed.contains(&port) {
                port = port.checked_add(1)?;
            }

            let mut with_port = entry.clone();
            with_port.local_port = port;
            with_port.running = true;
            let decider: Arc<dyn RouteDecider> = self.router.clone();
            let sink: Arc<dyn TrafficSink> = self.hub.clone();
            let mut listener = ProxyListener::new(
                ListenerOptions {
                    bind_address: bind_ip,
                    port,
                    upstream: with_port,
                    sniff: sniff.clone(),
                },
                decider,
                sink,
            );

            match listener.start().await {
                Ok(_) => {
                    claimed.insert(port);
                    entry.local_port = port;
                    entry.running = true;
                    return Some(listener);
                }
                Err(e) if e.is_addr_in_use() => {
                    debug!(id = %entry.id, port, "Port in use, trying next");
                    claimed.insert(port);
                    candidate = port.checked_add(1);
                }
                Err(e) => {
                    warn!(id = %entry.id, port, error = %e, "Failed to start listener");
                    self.hub.listener_error(port, e.to_string());
                    return None;
                }
            }
        }

        warn!(
            id = %entry.id,
            limit = retry_limit,
            "No free port found for proxy"
        );
        None
    }

    /// Stop every listener and wait for their sockets to close.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state).await;
    }

    async fn stop_locked(&self, state: &mut FleetState) {
        let mut listeners = std::mem::take(&mut state.listeners);
        futures::future::join_all(listeners.iter_mut().map(|l| l.stop())).await;

        for entry in state.entries.iter_mut() {
            entry.running = false;
        }
        if state.running {
            info!(listeners = listeners.len(), "Proxy fleet stopped");
        }
        state.running = false;
        self.hub.metrics.set_listeners_running(0);
        self.hub.bus.publish(FleetEvent::Stopped);
    }

    pub async fn restart(&self, config: &ProxyConfig, rules: &[Rule]) -> ProxyResult<ProxyStatus> {
        self.stop().await;
        self.start(config, rules).await
    }

    /// Swap the rule set; live connections pick it up on their next decision.
    pub fn update_rules(&self, rules: &[Rule]) {
        self.router.load_rules(rules);
    }

    pub fn update_default_action(&self, action: Action) {
        self.router.set_default_action(action);
    }

    /// Replace the sniff and port retry settings used by the next start.
    /// Running listeners keep the settings they were started with.
    pub async fn update_tunnel_settings(&self, sniff: SniffConfig, port_retry_limit: usize) {
        let mut state = self.state.lock().await;
        state.sniff = sniff;
        state.port_retry_limit = port_retry_limit;
    }

    /// Sniff settings the next start will hand to listeners.
    pub async fn sniff_config(&self) -> SniffConfig {
        self.state.lock().await.sniff.clone()
    }

    pub async fn get_status(&self) -> ProxyStatus {
        let state = self.state.lock().await;
        self.status_of(&state)
    }

    fn status_of(&self, state: &FleetState) -> ProxyStatus {
        ProxyStatus {
            running: state.running,
            proxies: state.entries.clone(),
            local_ips: local_ipv4_addresses(),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Most recent traffic, newest first.
    pub fn traffic_logs(&self, limit: usize) -> Vec<TrafficEvent> {
        self.hub.log.recent(limit)
    }

    pub fn clear_traffic_logs(&self) {
        self.hub.log.clear();
        self.hub.bus.publish(FleetEvent::TrafficCleared);
    }

    pub fn test_rule(&self, pattern: &str, hostname: &str) -> bool {
        self.router.test_rule(pattern, hostname)
    }

    pub fn validate_pattern(&self, pattern: &str) -> PatternValidation {
        self.router.validate_pattern(pattern)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.hub.bus.subscribe()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.hub.metrics
    }

    pub fn router(&self) -> &RuleRouter {
        &self.router
    }
}

/// Non-loopback IPv4 addresses of this host, for display.
pub fn local_ipv4_addresses() -> Vec<String> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.ip() {
                IpAddr::V4(v4) => Some(v4.to_string()),
                IpAddr::V6(_) => None,
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "Failed to list network interfaces");
            Vec::new()
        }
    }
}
