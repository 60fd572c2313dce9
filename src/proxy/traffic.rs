//! Byte accounting for a single connection or request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::events::{TrafficEvent, TrafficPhase, TrafficSink};

/// Shared byte counter, updated as data is forwarded.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn add(&self, n: usize) {
        self.0.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Publishes the final traffic record when dropped.
///
/// Dropping happens on every exit path: normal completion, errors, client
/// aborts and listener shutdown cancelling the owning task. Counts reflect
/// whatever was forwarded up to that point.
pub struct TrafficRecorder {
    event: TrafficEvent,
    sink: Arc<dyn TrafficSink>,
    bytes_in: ByteCounter,
    bytes_out: ByteCounter,
}

impl TrafficRecorder {
    /// `event` is used as the template; its id, byte counts and phase are
    /// filled in here.
    pub fn new(sink: Arc<dyn TrafficSink>, mut event: TrafficEvent) -> Self {
        event.id = sink.next_id();
        event.bytes_in = 0;
        event.bytes_out = 0;
        Self {
            event,
            sink,
            bytes_in: ByteCounter::default(),
            bytes_out: ByteCounter::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.event.id
    }

    /// Counter for bytes travelling towards the client.
    pub fn bytes_in(&self) -> ByteCounter {
        self.bytes_in.clone()
    }

    /// Counter for bytes travelling towards the destination.
    pub fn bytes_out(&self) -> ByteCounter {
        self.bytes_out.clone()
    }

    /// Publish a provisional record with the counts so far.
    pub fn publish_open(&self) {
        self.sink.record(self.snapshot(TrafficPhase::Open));
    }

    fn snapshot(&self, phase: TrafficPhase) -> TrafficEvent {
        TrafficEvent {
            bytes_in: self.bytes_in.get(),
            bytes_out: self.bytes_out.get(),
            phase,
            ..self.event.clone()
        }
    }
}

impl Drop for TrafficRecorder {
    fn drop(&mut self) {
        self.sink.record(self.snapshot(TrafficPhase::Closed));
    }
}
