// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The driver trait every accelerator backend implements.

use crate::{
    Completion, ContextHandle, DeviceKind, DriverError, KernelArg, KernelHandle, ProgramHandle,
    ProgramSource,
};

/// Low-level access to one platform's accelerator cores.
///
/// The trait mirrors the command-queue model of the underlying runtimes:
/// a context spans a set of same-class units, a program is built once per
/// context, and each unit is driven through its own in-order queue. Calls
/// enqueued on one queue run FIFO; calls on different queues run
/// concurrently.
///
/// Implementations must be shareable across threads behind an `Arc`; the
/// engine issues work from whatever thread holds an execution object.
pub trait AcceleratorDriver: Send + Sync {
    /// Backend name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Number of usable units of `kind`. Zero when the platform lacks the
    /// class entirely.
    fn unit_count(&self, kind: DeviceKind) -> usize;

    /// Clock frequency of `kind` units, for converting device cycles into
    /// wall time.
    fn frequency_mhz(&self, kind: DeviceKind) -> u64;

    /// Opens a context over the given units of one class and starts their
    /// queues. Queue index `i` drives `units[i]`.
    fn open_context(&self, kind: DeviceKind, units: &[u8])
        -> Result<ContextHandle, DriverError>;

    /// Tears the context down, draining and joining its queues. In-flight
    /// calls finish first.
    fn close_context(&self, context: ContextHandle) -> Result<(), DriverError>;

    /// Builds a program on the context.
    fn build_program(
        &self,
        context: ContextHandle,
        source: &ProgramSource,
    ) -> Result<ProgramHandle, DriverError>;

    /// Looks up a kernel entry by name.
    fn create_kernel(&self, program: ProgramHandle, name: &str)
        -> Result<KernelHandle, DriverError>;

    /// Releases a kernel handle. Calls already enqueued are unaffected.
    fn release_kernel(&self, kernel: KernelHandle) -> Result<(), DriverError>;

    /// Submits one kernel call on a queue of the kernel's context.
    ///
    /// Returns immediately with a [`Completion`] that is signalled exactly
    /// once, after the device has finished the call and written back any
    /// output buffers.
    fn enqueue(
        &self,
        kernel: KernelHandle,
        queue: u8,
        args: Vec<KernelArg>,
    ) -> Result<Completion, DriverError>;
}
