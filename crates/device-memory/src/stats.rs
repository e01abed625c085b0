// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Cumulative allocator metrics.
//!
//! [`PoolStats`] is a plain snapshot struct; the pool keeps the live copy
//! behind a lock and hands out clones on request.

/// Cumulative metrics for a [`DevicePool`](crate::DevicePool).
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of successful allocations.
    pub allocations: u64,
    /// Total number of buffers returned to the pool.
    pub releases: u64,
    /// Allocations served from the free list.
    pub reuse_hits: u64,
    /// Allocations that had to grab fresh memory.
    pub reuse_misses: u64,
    /// Allocations rejected because the budget was exhausted.
    pub oom_count: u64,
    /// Highest number of live bytes observed.
    pub peak_live_bytes: usize,
    /// Sum of all requested bytes over the pool's lifetime.
    pub total_requested_bytes: u64,
}

impl PoolStats {
    pub(crate) fn record_hit(&mut self, size_bytes: usize) {
        self.allocations += 1;
        self.reuse_hits += 1;
        self.total_requested_bytes += size_bytes as u64;
    }

    pub(crate) fn record_miss(&mut self, size_bytes: usize) {
        self.allocations += 1;
        self.reuse_misses += 1;
        self.total_requested_bytes += size_bytes as u64;
    }

    pub(crate) fn record_release(&mut self) {
        self.releases += 1;
    }

    pub(crate) fn record_oom(&mut self) {
        self.oom_count += 1;
    }

    pub(crate) fn update_peak(&mut self, live_bytes: usize) {
        if live_bytes > self.peak_live_bytes {
            self.peak_live_bytes = live_bytes;
        }
    }

    /// Fraction of allocations served from the free list, in `[0, 1]`.
    pub fn reuse_ratio(&self) -> f64 {
        if self.allocations == 0 {
            return 0.0;
        }
        self.reuse_hits as f64 / self.allocations as f64
    }

    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "allocs={} releases={} reuse={:.0}% peak={:.2}MB oom={}",
            self.allocations,
            self.releases,
            self.reuse_ratio() * 100.0,
            self.peak_live_bytes as f64 / (1024.0 * 1024.0),
            self.oom_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_ratio() {
        let mut stats = PoolStats::default();
        assert_eq!(stats.reuse_ratio(), 0.0);

        stats.record_miss(100);
        stats.record_hit(100);
        stats.record_hit(100);
        assert!((stats.reuse_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_peak_tracking() {
        let mut stats = PoolStats::default();
        stats.update_peak(1000);
        stats.update_peak(500);
        stats.update_peak(2000);
        assert_eq!(stats.peak_live_bytes, 2000);
    }

    #[test]
    fn test_summary_contains_fields() {
        let mut stats = PoolStats::default();
        stats.record_miss(4096);
        let s = stats.summary();
        assert!(s.contains("allocs=1"));
        assert!(s.contains("oom=0"));
    }
}
