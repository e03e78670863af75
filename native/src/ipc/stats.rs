// Per-transport and per-channel counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default, Debug)]
pub struct TransportStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    malformed: AtomicU64,
}

impl TransportStats {
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub malformed: u64,
}

/// Counters owned by one channel end.
#[derive(Default, Debug)]
pub struct ChannelCounters {
    pub commands_dispatched: AtomicU64,
    pub handler_faults: AtomicU64,
    pub transport_fallbacks: AtomicU64,
    pub commands_rejected: AtomicU64,
}

impl ChannelCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    pub state: String,
    /// `None` when the transport never came up.
    pub shared_memory: Option<TransportStatsSnapshot>,
    pub pipe: Option<TransportStatsSnapshot>,
    pub commands_dispatched: u64,
    pub handler_faults: u64,
    pub transport_fallbacks: u64,
    pub commands_rejected: u64,
    pub queue_depth: usize,
}

impl ChannelStatsSnapshot {
    pub fn from_counters(
        state: String,
        counters: &ChannelCounters,
        shared_memory: Option<TransportStatsSnapshot>,
        pipe: Option<TransportStatsSnapshot>,
        queue_depth: usize,
    ) -> Self {
        Self {
            state,
            shared_memory,
            pipe,
            commands_dispatched: counters.commands_dispatched.load(Ordering::Relaxed),
            handler_faults: counters.handler_faults.load(Ordering::Relaxed),
            transport_fallbacks: counters.transport_fallbacks.load(Ordering::Relaxed),
            commands_rejected: counters.commands_rejected.load(Ordering::Relaxed),
            queue_depth,
        }
    }
}
