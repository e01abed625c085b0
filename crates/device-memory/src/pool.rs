// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Budget-enforced pool for the device-visible region.
//!
//! The [`DevicePool`] is the single allocator for memory that accelerator
//! cores can address directly. It:
//!
//! 1. Enforces the region ceiling: allocations that would exceed the
//!    budget return `Err(OutOfMemory)`.
//! 2. Maintains a free list of reclaimed buffers, binned by size class,
//!    so steady-state frame loops stop hitting the heap entirely.
//! 3. Tracks allocation statistics for profiling.
//!
//! # Thread Safety
//! `DevicePool` is `Send + Sync`; the engine shares it via `Arc` between
//! the executor, the pipelines, and the driver.
//!
//! # Size Classes
//! Reclaimed buffers are binned by size class (the request rounded up to a
//! power of two). A fresh request first checks its class bin; only on a
//! miss does the pool allocate new memory. Frame buffers recur at a handful
//! of sizes, so the bins converge after the first pipeline iteration.

use crate::{HostBuffer, MemoryError, PoolStats, RegionBudget};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Minimum size class: 4 KB. Anything smaller is rounded up.
const MIN_SIZE_CLASS: usize = 4096;

/// Internal pool state, shared with every live [`HostBuffer`] via `Arc`
/// so buffers can reclaim themselves without a reference to the pool.
pub struct PoolShared {
    /// The region ceiling.
    budget: RegionBudget,
    /// Live bytes (allocated, not yet reclaimed).
    live_bytes: AtomicUsize,
    /// Free buffer cache: size_class → reclaimed byte vectors.
    free_lists: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    /// Bytes currently parked in the free lists.
    free_bytes: AtomicUsize,
    /// Cumulative metrics.
    stats: Mutex<PoolStats>,
}

impl PoolShared {
    /// Called when the last handle to a buffer drops.
    pub(crate) fn reclaim(&self, bytes: Vec<u8>, size_bytes: usize) {
        self.live_bytes.fetch_sub(size_bytes, Ordering::Release);
        self.stats.lock().record_release();

        let size_class = size_class_for(size_bytes);
        self.free_bytes.fetch_add(bytes.len(), Ordering::Release);
        self.free_lists.lock().entry(size_class).or_default().push(bytes);
    }
}

/// The allocator for device-visible host buffers.
///
/// # Example
/// ```
/// use device_memory::{DevicePool, RegionBudget};
///
/// let pool = DevicePool::new(RegionBudget::from_mb(8));
///
/// let heap = pool.allocate(64 * 1024).unwrap();
/// assert!(heap.is_device_visible());
/// assert_eq!(pool.live_bytes(), 64 * 1024);
///
/// drop(heap);
/// assert_eq!(pool.live_bytes(), 0);
/// ```
pub struct DevicePool {
    shared: Arc<PoolShared>,
}

impl DevicePool {
    /// Creates a pool over a device-visible region of the given size.
    pub fn new(budget: RegionBudget) -> Self {
        tracing::debug!(budget = %budget, "device-visible pool created");
        Self {
            shared: Arc::new(PoolShared {
                budget,
                live_bytes: AtomicUsize::new(0),
                free_lists: Mutex::new(HashMap::new()),
                free_bytes: AtomicUsize::new(0),
                stats: Mutex::new(PoolStats::default()),
            }),
        }
    }

    /// Allocates a zeroed, device-visible buffer of `size_bytes`.
    ///
    /// Returns `Err(OutOfMemory)` when the allocation would exceed the
    /// region budget. Reuses a free-listed buffer of the same size class
    /// when one is available.
    pub fn allocate(&self, size_bytes: usize) -> Result<HostBuffer, MemoryError> {
        if size_bytes == 0 {
            return Err(MemoryError::ZeroSizedAllocation);
        }

        let current = self.shared.live_bytes.load(Ordering::Acquire);
        let budget = self.shared.budget.as_bytes();
        if current + size_bytes > budget {
            self.shared.stats.lock().record_oom();
            return Err(MemoryError::OutOfMemory {
                requested_bytes: size_bytes,
                available_bytes: budget.saturating_sub(current),
                budget_bytes: budget,
            });
        }

        // Try the free list first.
        let size_class = size_class_for(size_bytes);
        let reused = {
            let mut free = self.shared.free_lists.lock();
            free.get_mut(&size_class).and_then(|bin| bin.pop())
        };

        let is_hit = reused.is_some();
        let bytes = match reused {
            Some(mut bytes) => {
                self.shared
                    .free_bytes
                    .fetch_sub(bytes.len(), Ordering::Release);
                // Trim to the exact request and hand out zeroed memory.
                bytes.resize(size_bytes, 0);
                bytes.fill(0);
                bytes
            }
            None => vec![0u8; size_bytes],
        };

        self.shared.live_bytes.fetch_add(size_bytes, Ordering::Release);

        {
            let mut stats = self.shared.stats.lock();
            if is_hit {
                stats.record_hit(size_bytes);
            } else {
                stats.record_miss(size_bytes);
            }
            let live = self.shared.live_bytes.load(Ordering::Acquire);
            stats.update_peak(live);
        }

        Ok(HostBuffer::new_pooled(
            bytes,
            Arc::clone(&self.shared),
            size_bytes,
        ))
    }

    /// Bytes currently allocated and not yet reclaimed.
    pub fn live_bytes(&self) -> usize {
        self.shared.live_bytes.load(Ordering::Acquire)
    }

    /// Bytes remaining before the budget is hit.
    pub fn available_bytes(&self) -> usize {
        self.shared
            .budget
            .as_bytes()
            .saturating_sub(self.live_bytes())
    }

    /// The region budget.
    pub fn budget(&self) -> RegionBudget {
        self.shared.budget
    }

    /// Snapshot of cumulative metrics.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats.lock().clone()
    }

    /// Clears the free lists, releasing parked memory back to the OS.
    ///
    /// Live buffers are unaffected.
    pub fn shrink(&self) {
        self.shared.free_lists.lock().clear();
        self.shared.free_bytes.store(0, Ordering::Release);
    }

    /// Approximate bytes parked in the free lists.
    pub fn free_bytes(&self) -> usize {
        self.shared.free_bytes.load(Ordering::Acquire)
    }
}

/// Smallest power of two that is ≥ `size` and ≥ [`MIN_SIZE_CLASS`].
fn size_class_for(size: usize) -> usize {
    size.max(MIN_SIZE_CLASS).next_power_of_two()
}

impl std::fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePool")
            .field("budget", &self.shared.budget)
            .field("live_bytes", &self.live_bytes())
            .field("available_bytes", &self.available_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_drop() {
        let pool = DevicePool::new(RegionBudget::from_mb(1));

        let buf = pool.allocate(1024).unwrap();
        assert_eq!(pool.live_bytes(), 1024);
        assert_eq!(buf.len(), 1024);
        assert!(buf.is_device_visible());

        drop(buf);
        assert_eq!(pool.live_bytes(), 0);
    }

    #[test]
    fn test_clone_keeps_allocation_live() {
        let pool = DevicePool::new(RegionBudget::from_mb(1));

        let buf = pool.allocate(2048).unwrap();
        let held_by_kernel = buf.clone();
        drop(buf);
        // The clone still holds the allocation.
        assert_eq!(pool.live_bytes(), 2048);

        drop(held_by_kernel);
        assert_eq!(pool.live_bytes(), 0);
    }

    #[test]
    fn test_fresh_buffer_is_zeroed() {
        let pool = DevicePool::new(RegionBudget::from_mb(1));
        let buf = pool.allocate(16).unwrap();
        assert!(buf.read().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_oom() {
        let pool = DevicePool::new(RegionBudget::from_bytes(1024));

        let _a = pool.allocate(512).unwrap();
        let _b = pool.allocate(512).unwrap();

        let result = pool.allocate(1);
        assert!(matches!(result, Err(MemoryError::OutOfMemory { .. })));
    }

    #[test]
    fn test_zero_allocation() {
        let pool = DevicePool::new(RegionBudget::from_mb(1));
        let result = pool.allocate(0);
        assert!(matches!(result, Err(MemoryError::ZeroSizedAllocation)));
    }

    #[test]
    fn test_free_list_reuse() {
        let pool = DevicePool::new(RegionBudget::from_mb(1));

        let buf = pool.allocate(4096).unwrap();
        drop(buf);

        let _buf2 = pool.allocate(4096).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.reuse_hits, 1);
        assert_eq!(stats.reuse_misses, 1);
    }

    #[test]
    fn test_reclaimed_buffer_is_zeroed() {
        let pool = DevicePool::new(RegionBudget::from_mb(1));

        let buf = pool.allocate(4096).unwrap();
        buf.fill(0xFF);
        drop(buf);

        let buf2 = pool.allocate(4096).unwrap();
        assert!(buf2.read().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_multiple_allocations() {
        let pool = DevicePool::new(RegionBudget::from_mb(10));

        let mut bufs = Vec::new();
        for _ in 0..10 {
            bufs.push(pool.allocate(1024 * 100).unwrap());
        }
        assert_eq!(pool.live_bytes(), 10 * 100 * 1024);

        bufs.clear();
        assert_eq!(pool.live_bytes(), 0);
    }

    #[test]
    fn test_available_bytes() {
        let pool = DevicePool::new(RegionBudget::from_bytes(10000));

        assert_eq!(pool.available_bytes(), 10000);
        let _b = pool.allocate(3000).unwrap();
        assert_eq!(pool.available_bytes(), 7000);
    }

    #[test]
    fn test_shrink() {
        let pool = DevicePool::new(RegionBudget::from_mb(1));

        let buf = pool.allocate(8192).unwrap();
        drop(buf);
        assert!(pool.free_bytes() > 0);

        pool.shrink();
        assert_eq!(pool.free_bytes(), 0);
    }

    #[test]
    fn test_stats_peak() {
        let pool = DevicePool::new(RegionBudget::from_mb(1));

        let a = pool.allocate(1000).unwrap();
        let b = pool.allocate(2000).unwrap();
        drop(a);
        drop(b);

        let stats = pool.stats();
        assert_eq!(stats.peak_live_bytes, 3000);
        assert_eq!(stats.releases, 2);
    }

    #[test]
    fn test_stats_oom_count() {
        let pool = DevicePool::new(RegionBudget::from_bytes(100));
        let _ = pool.allocate(200);
        let _ = pool.allocate(200);

        assert_eq!(pool.stats().oom_count, 2);
    }

    #[test]
    fn test_size_class() {
        assert_eq!(size_class_for(1), MIN_SIZE_CLASS);
        assert_eq!(size_class_for(4096), 4096);
        assert_eq!(size_class_for(5000), 8192);
        assert_eq!(size_class_for(1024 * 1024), 1024 * 1024);
    }

    #[test]
    fn test_debug_format() {
        let pool = DevicePool::new(RegionBudget::from_mb(64));
        let debug = format!("{pool:?}");
        assert!(debug.contains("DevicePool"));
        assert!(debug.contains("budget"));
    }
}
