// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Driver-level error type.
//!
//! These are host-side failures: bad handles, unknown kernels, malformed
//! argument lists. Errors the device program reports during a call travel
//! through its status block instead, as [`net_format::DeviceErrorCode`]s.

use crate::DeviceKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no {kind} unit {unit} on this platform")]
    UnknownDeviceUnit { kind: DeviceKind, unit: u8 },

    #[error("context opened with no units")]
    NoUnitsRequested,

    #[error("stale or foreign {what} handle")]
    InvalidHandle { what: &'static str },

    #[error("program build failed: {detail}")]
    ProgramBuildFailed { detail: String },

    #[error("program exports no kernel named '{name}'")]
    UnknownKernel { name: String },

    #[error("kernel '{kernel}': {detail}")]
    InvalidKernelArgs { kernel: String, detail: String },

    #[error("queue {queue} out of range for this context")]
    QueueOutOfRange { queue: u8 },

    #[error("failed to start queue worker: {source}")]
    QueueStartFailed {
        #[source]
        source: std::io::Error,
    },
}
