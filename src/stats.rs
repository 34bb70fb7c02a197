use std::time::Duration;

use serde::Serialize;

use crate::render::CacheCounters;

/// Counters kept by a preview render target.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PreviewStats {
    pub render_passes: u64,
    pub coalesced_requests: u64,
    pub gate_waits: u64,
    pub skipped_pages: u64,
    pub surface_allocations: u64,
    pub bitmap_cache_hits: u64,
    pub bitmap_cache_misses: u64,
    pub bitmap_evictions: u64,
    pub bitmap_cache_bytes: usize,
    pub last_render_ms: f64,
}

impl PreviewStats {
    pub fn record_render(&mut self, elapsed: Duration) {
        self.last_render_ms = elapsed.as_secs_f64() * 1000.0;
        self.render_passes += 1;
    }

    pub fn record_coalesced(&mut self) {
        self.coalesced_requests += 1;
    }

    pub fn record_wait(&mut self) {
        self.gate_waits += 1;
    }

    pub fn record_skipped(&mut self) {
        self.skipped_pages += 1;
    }

    pub fn record_surface_allocation(&mut self) {
        self.surface_allocations += 1;
    }

    /// Copies the page bitmap cache counters in.
    pub fn record_cache(&mut self, counters: CacheCounters, bytes: usize) {
        self.bitmap_cache_hits = counters.hits;
        self.bitmap_cache_misses = counters.misses;
        self.bitmap_evictions = counters.evictions;
        self.bitmap_cache_bytes = bytes;
    }
}
