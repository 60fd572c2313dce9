//! Traffic records and fleet lifecycle events.
//!
//! The core pushes immutable values out through a bounded broadcast
//! channel. Consumers subscribe and unsubscribe by dropping their receiver;
//! a slow consumer loses its oldest events instead of stalling connections.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::fleet::ProxyStatus;
use crate::rules::Action;

/// Default number of traffic records kept for inspection.
pub const DEFAULT_TRAFFIC_LOG_CAPACITY: usize = 1000;

/// Default broadcast channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle of a traffic record.
///
/// CONNECT tunnels publish `Open` with provisional byte counts as soon as
/// they are routed, then `Closed` with the final totals under the same id.
/// Plain HTTP requests only publish `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficPhase {
    Open,
    Closed,
}

/// One routed connection or request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficEvent {
    pub id: u64,
    pub timestamp_ms: u64,
    /// Hostname from the CONNECT line or the request target / Host header.
    pub hostname: String,
    /// Hostname from the TLS ClientHello, when one was seen.
    pub sni_hostname: Option<String>,
    /// HTTP method, `CONNECT` for tunnels.
    pub method: String,
    /// `host:port` as requested.
    pub url: String,
    pub action: Action,
    pub matched_rule: Option<String>,
    pub local_port: u16,
    /// Bytes forwarded to the client.
    pub bytes_in: u64,
    /// Bytes forwarded to the destination.
    pub bytes_out: u64,
    pub phase: TrafficPhase,
}

impl TrafficEvent {
    /// The name routing was decided on.
    pub fn effective_hostname(&self) -> &str {
        self.sni_hostname.as_deref().unwrap_or(&self.hostname)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_in + self.bytes_out
    }

    pub fn is_closed(&self) -> bool {
        self.phase == TrafficPhase::Closed
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Events published by the fleet.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    Started(ProxyStatus),
    Stopped,
    Traffic(TrafficEvent),
    ListenerError { local_port: u16, message: String },
    TrafficCleared,
}

/// Receiving side handed to listeners.
///
/// Called synchronously from connection tasks, so implementations must not
/// block.
pub trait TrafficSink: Send + Sync {
    /// Allocate an id for a new traffic record, unique across listeners.
    fn next_id(&self) -> u64;
    fn record(&self, event: TrafficEvent);
    fn listener_error(&self, local_port: u16, message: String);
    /// A dial to an upstream proxy or origin failed.
    fn upstream_error(&self, local_port: u16, message: String);
}

/// Bounded history of recent traffic, newest first.
#[derive(Debug)]
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEvent>>,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 4096))),
        }
    }

    /// Add an event; a `Closed` event replaces the `Open` entry with its id.
    pub fn push(&self, event: TrafficEvent) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if event.is_closed()
            && let Some(existing) = entries.iter_mut().find(|e| e.id == event.id)
        {
            *existing = event;
            return;
        }
        entries.push_front(event);
        entries.truncate(self.capacity);
    }

    /// Up to `limit` most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<TrafficEvent> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().take(limit).cloned().collect()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Fan-out of fleet events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }

    /// Publish without waiting; having no subscribers is not an error.
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
