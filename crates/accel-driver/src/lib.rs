// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Accelerator device abstraction for the offload runtime.
//!
//! The engine never talks to a vendor runtime directly; it goes through
//! the [`AcceleratorDriver`] trait, which exposes the command-queue model
//! common to those runtimes:
//!
//! ```text
//!   engine ──► AcceleratorDriver
//!                ├── context over N same-class units
//!                ├── program built once per context
//!                ├── kernels looked up by entry name
//!                └── per-unit in-order queues ──► Completion events
//! ```
//!
//! [`SoftDriver`] is the in-process implementation: worker threads stand
//! in for cores and an interpreter supplies the device-side semantics of
//! the built-in network kernels (`configure`, `setup`, `process`,
//! `teardown`). It exists so the whole engine, including its concurrency
//! behaviour, runs and tests on machines without the accelerator silicon.
//!
//! Host-side failures surface as [`DriverError`]; failures inside a call
//! come back through the status buffer as [`net_format::DeviceErrorCode`]s.

mod completion;
mod driver;
mod error;
mod interp;
mod soft;
mod types;

pub use completion::Completion;
pub use driver::AcceleratorDriver;
pub use error::DriverError;
pub use soft::{SoftDriver, SoftTopology, MAX_UNITS_PER_CLASS};
pub use types::{
    ArgAccess, ContextHandle, DeviceKind, KernelArg, KernelHandle, ProgramHandle, ProgramSource,
    BUILTIN_KERNELS, KERNEL_CONFIGURE, KERNEL_PROCESS, KERNEL_SETUP, KERNEL_TEARDOWN,
};
