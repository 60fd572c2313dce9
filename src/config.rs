use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{ProxyError, ProxyResult};
use crate::events::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_TRAFFIC_LOG_CAPACITY};
use crate::rules::{Action, Rule, check_pattern};
use crate::sni::{DEFAULT_MAX_SNIFF_BYTES, DEFAULT_SNIFF_TIMEOUT, SniffConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default = "default_rules")]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            rules: default_rules(),
            tunnel: TunnelConfig::default(),
            events: EventsConfig::default(),
            logging: LoggingConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

/// What the fleet runs: upstream list, local ports and the fallback action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// First local port; entry `n` of the proxy list asks for `start_port + n`
    pub start_port: u16,
    pub bind_address: String,
    /// Action for hostnames no rule matches
    pub default_action: Action,
    /// Start the fleet as soon as the daemon is up
    pub auto_start: bool,
    /// One upstream per line: `user:pass:host:port` or `host:port`
    pub proxy_list: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            start_port: 8080,
            bind_address: "0.0.0.0".to_string(),
            default_action: Action::Proxy,
            auto_start: true,
            proxy_list: String::new(),
        }
    }
}

impl ProxyConfig {
    pub fn bind_ip(&self) -> ProxyResult<IpAddr> {
        self.bind_address.parse().map_err(|_| {
            ProxyError::Config(format!("Invalid bind address: {}", self.bind_address))
        })
    }

    /// Whether switching to `other` needs the listeners rebuilt.
    pub fn needs_restart(&self, other: &ProxyConfig) -> bool {
        self.proxy_list != other.proxy_list
            || self.start_port != other.start_port
            || self.bind_address != other.bind_address
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// How long a new tunnel waits for a TLS ClientHello
    pub sniff_timeout_ms: u64,
    /// Maximum bytes buffered while waiting for it
    pub max_sniff_bytes: usize,
    /// Ports tried per entry when the assigned one is taken
    pub port_retry_limit: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            sniff_timeout_ms: DEFAULT_SNIFF_TIMEOUT.as_millis() as u64,
            max_sniff_bytes: DEFAULT_MAX_SNIFF_BYTES,
            port_retry_limit: 100,
        }
    }
}

impl TunnelConfig {
    pub fn sniff_config(&self) -> SniffConfig {
        SniffConfig {
            timeout: Duration::from_millis(self.sniff_timeout_ms),
            max_bytes: self.max_sniff_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub traffic_log_capacity: usize,
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            traffic_log_capacity: DEFAULT_TRAFFIC_LOG_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path (optional, logs to stderr if not set)
    #[serde(default)]
    pub file: Option<String>,
    /// Enable JSON format logging
    #[serde(default)]
    pub json: bool,
    /// Enable daily log rotation
    #[serde(default = "default_rotation")]
    pub rotation: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            json: false,
            rotation: default_rotation(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> bool {
    true
}

/// Read-only status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

pub fn default_rules() -> Vec<Rule> {
    vec![Rule {
        id: "local".to_string(),
        name: "Local addresses".to_string(),
        pattern: "*.local, localhost, 127.0.0.1".to_string(),
        action: Action::Direct,
        enabled: true,
        priority: 10,
    }]
}

/// Supplies the fleet with its proxy settings and rules.
pub trait ConfigSource {
    fn proxy_config(&self) -> ProxyConfig;
    fn rules(&self) -> Vec<Rule>;
}

impl ConfigSource for AppConfig {
    fn proxy_config(&self) -> ProxyConfig {
        self.proxy.clone()
    }

    fn rules(&self) -> Vec<Rule> {
        self.rules.clone()
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: AppConfig =
            toml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration from file or use default
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config file, using defaults: {}", e);
            Self::default()
        })
    }

    /// Sections of `other` that differ from `self` and can only be applied
    /// by restarting the process.
    pub fn process_restart_sections(&self, other: &AppConfig) -> Vec<&'static str> {
        let mut sections = Vec::new();
        if self.events != other.events {
            sections.push("events");
        }
        if self.logging != other.logging {
            sections.push("logging");
        }
        if self.status != other.status {
            sections.push("status");
        }
        sections
    }

    /// Check settings the daemon cannot run with
    pub fn validate(&self) -> ProxyResult<()> {
        if self.proxy.start_port == 0 {
            return Err(ProxyError::Config("start_port must be non-zero".to_string()));
        }
        self.proxy.bind_ip()?;

        if self.tunnel.sniff_timeout_ms == 0 {
            return Err(ProxyError::Config(
                "sniff_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.tunnel.max_sniff_bytes < 6 {
            return Err(ProxyError::Config(
                "max_sniff_bytes must be at least 6".to_string(),
            ));
        }
        if self.tunnel.port_retry_limit == 0 {
            return Err(ProxyError::Config(
                "port_retry_limit must be non-zero".to_string(),
            ));
        }
        if self.events.traffic_log_capacity == 0 {
            return Err(ProxyError::Config(
                "traffic_log_capacity must be non-zero".to_string(),
            ));
        }

        if self.status.enabled {
            if self.status.port == self.proxy.start_port {
                return Err(ProxyError::Config(format!(
                    "status port {} collides with start_port",
                    self.status.port
                )));
            }
            self.status.bind_address.parse::<IpAddr>().map_err(|_| {
                ProxyError::Config(format!(
                    "Invalid status bind address: {}",
                    self.status.bind_address
                ))
            })?;
        }

        for rule in &self.rules {
            check_pattern(&rule.pattern).map_err(|e| {
                ProxyError::Config(format!("Rule '{}' has an invalid pattern: {}", rule.name, e))
            })?;
        }

        Ok(())
    }
}
