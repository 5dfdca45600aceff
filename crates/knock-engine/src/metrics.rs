//! Ingress counters.
//!
//! All fields use `Relaxed` ordering — these are operator-facing tallies,
//! not synchronization.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

/// Counters maintained by the packet ingress loop.
#[derive(Default)]
pub struct IngressMetrics {
    /// UDP frames delivered by the kernel filter.
    pub frames_received: AtomicU64,
    /// Events handed to the state machine.
    pub events_queued: AtomicU64,
    /// Events lost to a full ring buffer.
    pub events_dropped: AtomicU64,
    /// Frames skipped as unparsable.
    pub frames_skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct IngressSnapshot {
    pub frames_received: u64,
    pub events_queued: u64,
    pub events_dropped: u64,
    pub frames_skipped: u64,
}

impl IngressMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> IngressSnapshot {
        IngressSnapshot {
            frames_received: self.frames_received.load(Relaxed),
            events_queued: self.events_queued.load(Relaxed),
            events_dropped: self.events_dropped.load(Relaxed),
            frames_skipped: self.frames_skipped.load(Relaxed),
        }
    }
}
