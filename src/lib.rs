pub mod app;
pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod rules;
pub mod sni;
pub mod status;
pub mod upstream;

// Re-export commonly used types for convenience
pub use app::App;
pub use config::{AppConfig, ConfigSource, ProxyConfig};
pub use error::{ListenerError, PatternError, ProxyError, ProxyResult, UpstreamError};
pub use events::{FleetEvent, TrafficEvent, TrafficPhase};
pub use fleet::{FleetSettings, ProxyFleet, ProxyStatus};
pub use rules::{Action, Rule, RuleRouter};
pub use upstream::UpstreamProxyEntry;
