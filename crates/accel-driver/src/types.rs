// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Core driver vocabulary: device classes, handles, and kernel arguments.

use device_memory::HostBuffer;
use std::fmt;

/// The two accelerator classes a platform can expose.
///
/// DSP cores share one context that is sub-partitioned into single-core
/// queues; NPU cores each get a dedicated context. The driver hides the
/// difference behind per-unit queues either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Dsp,
    Npu,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dsp => "dsp",
            Self::Npu => "npu",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "dsp" => Some(Self::Dsp),
            "npu" | "eve" => Some(Self::Npu),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle to an open device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub(crate) u64);

/// Opaque handle to a program built on a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub(crate) u64);

/// Opaque handle to a kernel created from a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub(crate) u64);

/// Where a context gets its device program from.
#[derive(Debug, Clone)]
pub enum ProgramSource {
    /// The device firmware's built-in network kernels.
    BuiltIns,
    /// A pre-compiled program image handed to the device verbatim.
    Binary(Vec<u8>),
}

/// Entry names the built-in program exports.
pub const KERNEL_CONFIGURE: &str = "configure";
pub const KERNEL_SETUP: &str = "setup";
pub const KERNEL_PROCESS: &str = "process";
pub const KERNEL_TEARDOWN: &str = "teardown";

pub const BUILTIN_KERNELS: [&str; 4] = [
    KERNEL_CONFIGURE,
    KERNEL_SETUP,
    KERNEL_PROCESS,
    KERNEL_TEARDOWN,
];

/// Host-visible access direction of a buffer argument, from the device's
/// point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// One positional kernel argument.
#[derive(Debug, Clone)]
pub enum KernelArg {
    /// Shared host/device buffer. Cloning the [`HostBuffer`] keeps the
    /// allocation alive for the duration of the call.
    Buffer {
        buffer: HostBuffer,
        access: ArgAccess,
    },
    /// Raw little-endian scalar bytes, copied at enqueue time.
    Scalar(Vec<u8>),
    /// Device-local scratch with no host backing.
    Local { bytes: usize },
}

impl KernelArg {
    pub fn buffer(buffer: HostBuffer, access: ArgAccess) -> Self {
        Self::Buffer { buffer, access }
    }

    /// Packs any plain-old-data value into a scalar argument.
    pub fn scalar<T: bytemuck::Pod>(value: &T) -> Self {
        Self::Scalar(bytemuck::bytes_of(value).to_vec())
    }

    pub fn scalar_u32(value: u32) -> Self {
        Self::Scalar(value.to_le_bytes().to_vec())
    }

    pub fn local(bytes: usize) -> Self {
        Self::Local { bytes }
    }
}
