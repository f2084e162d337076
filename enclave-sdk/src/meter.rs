//! Guest-side resource accounting sampled by the telemetry reporter.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Busy time and tracked heap of one guest.
///
/// Busy time accumulates around lifecycle hooks and exported API calls.
/// Heap is what the plugin reports through [`ResourceMeter::track_allocation`]
/// plus the retained size of its document.
#[derive(Debug, Default)]
pub struct ResourceMeter {
    busy_nanos: AtomicU64,
    heap_bytes: AtomicU64,
}

impl ResourceMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_allocation(&self, bytes: u64) {
        self.heap_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn release(&self, bytes: u64) {
        let _ = self
            .heap_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    pub fn heap_bytes(&self) -> u64 {
        self.heap_bytes.load(Ordering::Relaxed)
    }

    pub fn add_busy(&self, nanos: u64) {
        self.busy_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn busy_nanos(&self) -> u64 {
        self.busy_nanos.load(Ordering::Relaxed)
    }

    /// Runs `fut`, charging its wall time as busy time.
    pub async fn time<F: Future>(&self, fut: F) -> F::Output {
        let start = Instant::now();
        let out = fut.await;
        self.add_busy(start.elapsed().as_nanos() as u64);
        out
    }
}
