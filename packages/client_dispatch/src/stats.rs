//! Dispatch counters
//!
//! Cheap atomic counters describing what the fan-out path did with the
//! events it received.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Batches handed to the manager
    pub batches_received: AtomicU64,
    /// Responses matched to a registered handler
    pub responses_delivered: AtomicU64,
    /// Update events delivered to an update handler
    pub updates_delivered: AtomicU64,
    /// Events nobody could take: unknown client or unknown query id
    pub events_dropped: AtomicU64,
    /// "Request aborted" leftovers for clients that already closed
    pub aborts_suppressed: AtomicU64,
    /// Handler calls that returned an error or panicked
    pub handler_failures: AtomicU64,
    /// Requests resolved with the synthetic close error
    pub requests_force_closed: AtomicU64,

    pub clients_registered: AtomicU64,
    pub clients_closed: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_received(&self) {
        self.batches_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_delivered(&self) {
        self.responses_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn updates_delivered(&self, count: usize) {
        self.updates_delivered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn events_dropped(&self, count: usize) {
        self.events_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn aborts_suppressed(&self, count: usize) {
        self.aborts_suppressed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_force_closed(&self) {
        self.requests_force_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_registered(&self) {
        self.clients_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_closed(&self) {
        self.clients_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_received: self.batches_received.load(Ordering::Relaxed),
            responses_delivered: self.responses_delivered.load(Ordering::Relaxed),
            updates_delivered: self.updates_delivered.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            aborts_suppressed: self.aborts_suppressed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            requests_force_closed: self.requests_force_closed.load(Ordering::Relaxed),
            clients_registered: self.clients_registered.load(Ordering::Relaxed),
            clients_closed: self.clients_closed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub batches_received: u64,
    pub responses_delivered: u64,
    pub updates_delivered: u64,
    pub events_dropped: u64,
    pub aborts_suppressed: u64,
    pub handler_failures: u64,
    pub requests_force_closed: u64,
    pub clients_registered: u64,
    pub clients_closed: u64,
}

impl StatsSnapshot {
    pub fn clients_open(&self) -> u64 {
        self.clients_registered.saturating_sub(self.clients_closed)
    }
}
