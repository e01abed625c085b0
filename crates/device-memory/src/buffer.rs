// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Shared handles to device-visible allocations.
//!
//! [`HostBuffer`] is the unit of exchange between the host application and
//! the driver: frame inputs, frame outputs, the network descriptor, the
//! weights blob, and the parameter heap all travel as `HostBuffer`s. A
//! handle is a cheap `Arc` clone; the backing bytes are reclaimed by the
//! pool when the last handle drops, so a buffer bound to an in-flight
//! kernel stays valid until the driver releases its clone.

use crate::pool::PoolShared;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct BufferInner {
    /// Process-unique identity, stable across handle clones.
    id: u64,
    /// Logical length in bytes (the backing Vec is kept at exactly this len).
    len: usize,
    /// Whether the bytes live in the device-visible region.
    device_visible: bool,
    bytes: RwLock<Vec<u8>>,
    /// Present only for pool allocations; `None` for plain host memory.
    pool: Option<Arc<PoolShared>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let bytes = std::mem::take(self.bytes.get_mut());
            pool.reclaim(bytes, self.len);
        }
    }
}

/// A shared handle to one host-side allocation.
///
/// Clones share the same bytes and identity. Interior access is guarded by
/// a read/write lock so the software driver's queue workers and the host
/// thread can never observe a torn buffer, whatever the caller does.
///
/// # Example
/// ```
/// use device_memory::HostBuffer;
///
/// let buf = HostBuffer::from_vec(vec![0u8; 8]);
/// buf.write_at(2, &[0xAB, 0xCD]).unwrap();
/// assert_eq!(buf.read()[2], 0xAB);
/// assert!(!buf.is_device_visible());
/// ```
#[derive(Clone)]
pub struct HostBuffer {
    inner: Arc<BufferInner>,
}

impl HostBuffer {
    pub(crate) fn new_pooled(bytes: Vec<u8>, pool: Arc<PoolShared>, len: usize) -> Self {
        debug_assert_eq!(bytes.len(), len);
        Self {
            inner: Arc::new(BufferInner {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                len,
                device_visible: true,
                bytes: RwLock::new(bytes),
                pool: Some(pool),
            }),
        }
    }

    /// Wraps plain host memory that is *not* device-visible.
    ///
    /// The engine can still bind such a buffer to a kernel, but the binding
    /// degrades to copy-in/copy-out instead of zero-copy.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            inner: Arc::new(BufferInner {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                len,
                device_visible: false,
                bytes: RwLock::new(bytes),
                pool: None,
            }),
        }
    }

    /// Process-unique identity, stable across clones.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Length in bytes. Fixed for the lifetime of the allocation.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// `true` when the bytes live in the device-visible region and a kernel
    /// binding can be zero-copy.
    pub fn is_device_visible(&self) -> bool {
        self.inner.device_visible
    }

    /// `true` when both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Locks the buffer for reading.
    pub fn read(&self) -> BufferReadGuard<'_> {
        BufferReadGuard {
            guard: self.inner.bytes.read(),
        }
    }

    /// Locks the buffer for writing.
    pub fn write(&self) -> BufferWriteGuard<'_> {
        BufferWriteGuard {
            guard: self.inner.bytes.write(),
        }
    }

    /// Copies `src` into the buffer at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<(), crate::MemoryError> {
        let mut bytes = self.inner.bytes.write();
        let end = offset.checked_add(src.len()).unwrap_or(usize::MAX);
        if end > bytes.len() {
            return Err(crate::MemoryError::OutOfRange {
                offset,
                len: src.len(),
                buffer_len: bytes.len(),
            });
        }
        bytes[offset..end].copy_from_slice(src);
        Ok(())
    }

    /// Copies bytes from `offset` into `dst`.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<(), crate::MemoryError> {
        let bytes = self.inner.bytes.read();
        let end = offset.checked_add(dst.len()).unwrap_or(usize::MAX);
        if end > bytes.len() {
            return Err(crate::MemoryError::OutOfRange {
                offset,
                len: dst.len(),
                buffer_len: bytes.len(),
            });
        }
        dst.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    /// Overwrites every byte with `value`.
    pub fn fill(&self, value: u8) {
        self.inner.bytes.write().fill(value);
    }

    /// Copies the whole buffer out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.bytes.read().clone()
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("id", &self.inner.id)
            .field("len", &self.inner.len)
            .field("device_visible", &self.inner.device_visible)
            .finish()
    }
}

/// Read guard dereferencing to the buffer's bytes.
pub struct BufferReadGuard<'a> {
    guard: RwLockReadGuard<'a, Vec<u8>>,
}

impl Deref for BufferReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Write guard dereferencing to the buffer's bytes.
pub struct BufferWriteGuard<'a> {
    guard: RwLockWriteGuard<'a, Vec<u8>>,
}

impl Deref for BufferWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for BufferWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}
