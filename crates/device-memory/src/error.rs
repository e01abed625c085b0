// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the device-visible memory pool.

/// Errors that can occur during pool operations.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The allocation would exceed the shared-region budget.
    #[error("device-visible region exhausted: requested {requested_bytes} bytes, but only {available_bytes} available (budget: {budget_bytes})")]
    OutOfMemory {
        requested_bytes: usize,
        available_bytes: usize,
        budget_bytes: usize,
    },

    /// Zero-sized allocations are rejected; a buffer must back at least one byte.
    #[error("cannot allocate zero-sized device-visible buffer")]
    ZeroSizedAllocation,

    /// A read or write fell outside the buffer.
    #[error("buffer access out of range: offset {offset} + len {len} exceeds buffer of {buffer_len} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        buffer_len: usize,
    },

    /// A budget string could not be parsed.
    #[error("invalid region budget '{input}' (expected forms: 64M, 1G, 2048K, or raw bytes)")]
    InvalidBudget { input: String },
}
