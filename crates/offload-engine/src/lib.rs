// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # offload-engine
//!
//! Host-side orchestration for running compiled layer-group networks on
//! fixed-function accelerator cores.
//!
//! The engine takes:
//! - A network descriptor and weights blob in the `net-format` layout.
//! - An [`AcceleratorDriver`] giving command-queue access to the cores.
//! - A [`Configuration`] naming the artifacts and runtime knobs.
//!
//! And builds the ladder the demos and CLI drive:
//! ```text
//! Executor            one device class, network configured once
//!   └─ ExecutionObject  one layers group on one unit (setup/compute/teardown)
//!        └─ ExecutionObjectPipeline  groups chained into frame-level work
//! ```
//!
//! # Split-Call Protocol
//! Every device call is issued with a `*_start_async`/`run_async` and
//! resolved with a `wait`. Waits on phases with nothing in flight report
//! `Ok(false)`, so drain loops need no bookkeeping. Device-reported
//! failures surface as [`EngineError::DeviceReported`] with the device's
//! error code; every engine error carries the host source location that
//! raised it.
//!
//! # Double Buffering
//! Pipelines own their frame buffers and rebind stage kernels per frame,
//! so two pipelines over the same execution objects keep a unit busy
//! while the host fills the next frame.

mod config;
mod device;
mod error;
mod execution_object;
mod executor;
mod pipeline;
pub mod timestamp;
mod version;

pub use accel_driver::{
    AcceleratorDriver, DeviceKind, DriverError, SoftDriver, SoftTopology,
};
pub use config::{Configuration, DEFAULT_POOL_BUDGET_MB};
pub use device::{ContextSlot, Device, Kernel};
pub use error::{EngineError, Origin};
pub use execution_object::{CallType, EoHandle, ExecutionObject, LayerOutput};
pub use executor::Executor;
pub use pipeline::ExecutionObjectPipeline;
pub use version::{api_version, API_MAJOR, API_MINOR, API_PATCH};
