// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # device-memory
//!
//! A budget-enforced pool of *device-visible* host buffers: the contiguous
//! memory region that both the host application and the accelerator cores
//! can reach without an intermediate copy.
//!
//! # Key Components
//!
//! - [`RegionBudget`]: the hard ceiling on the shared region, with
//!   human-readable parsing (`"64M"`, `"1G"`, etc.).
//! - [`DevicePool`]: the allocator. Enforces the budget, maintains a free
//!   list binned by size class, and tracks statistics.
//! - [`HostBuffer`]: a shared handle to one allocation. Handles are cheap
//!   to clone; the backing bytes return to the pool when the last handle
//!   drops. Buffers allocated here report [`HostBuffer::is_device_visible`]
//!   `== true`, which the engine's buffer-binding policy turns into a
//!   zero-copy device binding.
//! - [`PoolStats`]: cumulative allocator metrics (peak usage, reuse hit
//!   ratio, out-of-memory count).
//!
//! # Ownership Model
//!
//! ```text
//! DevicePool::allocate(size)
//!       │
//!       ▼
//!   HostBuffer ─ clone ─ HostBuffer     (both point at one BufferInner)
//!       │                    │
//!       └───── last drop ────┘
//!                 │
//!                 ▼
//!   PoolShared::reclaim()  ──► free list
//! ```
//!
//! A buffer handed to an in-flight kernel is kept alive by the kernel's
//! clone of the handle, so host code can drop its own handle at any time
//! without invalidating device access. Interior access goes through a
//! read/write lock; the engine's calling discipline (one in-flight compute
//! per execution object) keeps contention at zero in practice.
//!
//! # Example
//! ```
//! use device_memory::{DevicePool, RegionBudget};
//!
//! let pool = DevicePool::new(RegionBudget::from_mb(16));
//!
//! let frame = pool.allocate(28 * 28).unwrap();
//! frame.write_at(0, &[7u8; 28]).unwrap();
//! assert_eq!(pool.live_bytes(), 28 * 28);
//!
//! drop(frame);
//! assert_eq!(pool.live_bytes(), 0);
//! ```

mod budget;
mod buffer;
mod error;
pub mod pool;
mod stats;

pub use budget::RegionBudget;
pub use buffer::{BufferReadGuard, BufferWriteGuard, HostBuffer};
pub use error::MemoryError;
pub use pool::DevicePool;
pub use stats::PoolStats;
