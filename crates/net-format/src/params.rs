// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Packed parameter blocks exchanged with the device program.
//!
//! These cross the host/device boundary as raw bytes, so they follow the
//! same rules as the descriptor structs: `repr(C)`, fixed-width fields,
//! no padding. [`ConfigureParams`] repeats the host's idea of the struct
//! sizes so the device can refuse a build whose layout drifted.

use crate::descriptor::{DescriptorHeader, DESCRIPTOR_ABI_VERSION};
use std::fmt;

/// Arguments of the one-time `configure` call.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ConfigureParams {
    /// Host's `size_of::<DescriptorHeader>()`.
    pub header_bytes: u32,
    /// Host's `size_of::<LayerRecord>()`.
    pub record_bytes: u32,
    /// Parameter heap the device must carve out, in bytes.
    pub heap_bytes: u32,
    /// Share of weights the compiler forced to zero, 0..=100. Purely
    /// informational for the device-side scheduler.
    pub zero_weight_percent: u32,
    /// Calibration history weights for quantization statistics.
    pub quant_history_1: u32,
    pub quant_history_2: u32,
    /// Margin applied on top of observed activation ranges.
    pub quant_margin: u32,
    pub abi_version: u32,
}

impl ConfigureParams {
    /// Builds configure arguments matching `header`, reserving `heap_bytes`
    /// on the device. Quantization knobs start at their neutral values.
    pub fn from_header(header: &DescriptorHeader, heap_bytes: u32) -> Self {
        Self {
            header_bytes: header.header_bytes,
            record_bytes: header.record_bytes,
            heap_bytes,
            zero_weight_percent: 0,
            quant_history_1: 20,
            quant_history_2: 5,
            quant_margin: 0,
            abi_version: DESCRIPTOR_ABI_VERSION,
        }
    }
}

/// Per-frame arguments of the `process` call.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ProcessParams {
    pub frame_index: u32,
    /// Non-zero when the device should fill the layer-trace buffer.
    pub trace_enabled: u32,
}

/// Status block the device writes back after every call.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DeviceStatus {
    /// Raw [`DeviceErrorCode`] value.
    pub error_code: u32,
    /// Parameter-heap bytes in use after the call.
    pub heap_used_bytes: u32,
    /// Device cycle count consumed by the call.
    pub cycles: u64,
}

impl DeviceStatus {
    pub fn error(&self) -> DeviceErrorCode {
        DeviceErrorCode::from_u32(self.error_code)
    }

    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

/// Error codes the device program reports through its status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    Success,
    GeneralFailure,
    /// Parameter heap could not satisfy a reservation.
    HeapAllocFailure,
    /// Memory-record table for a layer group could not be allocated.
    MemRecAllocFailure,
    /// A `process` call failed partway through the chain.
    ProcessFailure,
    /// Host and device disagree on struct layout or ABI version.
    CreateParamsMismatch,
    Unknown(u32),
}

impl DeviceErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Success,
            1 => Self::GeneralFailure,
            2 => Self::HeapAllocFailure,
            3 => Self::MemRecAllocFailure,
            4 => Self::ProcessFailure,
            5 => Self::CreateParamsMismatch,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::GeneralFailure => 1,
            Self::HeapAllocFailure => 2,
            Self::MemRecAllocFailure => 3,
            Self::ProcessFailure => 4,
            Self::CreateParamsMismatch => 5,
            Self::Unknown(v) => v,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::GeneralFailure => write!(f, "general failure"),
            Self::HeapAllocFailure => write!(f, "parameter heap allocation failure"),
            Self::MemRecAllocFailure => write!(f, "memory record allocation failure"),
            Self::ProcessFailure => write!(f, "process call failure"),
            Self::CreateParamsMismatch => write!(f, "host/device create-params mismatch"),
            Self::Unknown(v) => write!(f, "unknown device error {}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_sizes() {
        assert_eq!(std::mem::size_of::<ConfigureParams>(), 32);
        assert_eq!(std::mem::size_of::<ProcessParams>(), 8);
        assert_eq!(std::mem::size_of::<DeviceStatus>(), 16);
    }

    #[test]
    fn test_error_code_round_trip() {
        for v in 0..=6u32 {
            assert_eq!(DeviceErrorCode::from_u32(v).as_u32(), v);
        }
        assert!(DeviceErrorCode::Success.is_success());
        assert!(!DeviceErrorCode::ProcessFailure.is_success());
    }

    #[test]
    fn test_status_error_view() {
        let status = DeviceStatus {
            error_code: 5,
            heap_used_bytes: 0,
            cycles: 0,
        };
        assert_eq!(status.error(), DeviceErrorCode::CreateParamsMismatch);
        assert!(!status.is_success());
    }

    #[test]
    fn test_configure_from_header() {
        let header = DescriptorHeader {
            magic: crate::DESCRIPTOR_MAGIC,
            abi_version: DESCRIPTOR_ABI_VERSION,
            header_bytes: std::mem::size_of::<DescriptorHeader>() as u32,
            record_bytes: 48,
            layer_count: 1,
            input_channels: 1,
            input_height: 4,
            input_width: 4,
            param_heap_bytes: 1024,
            scratch_l1_bytes: 0,
            scratch_l2_bytes: 0,
            scratch_l3_bytes: 0,
        };
        let params = ConfigureParams::from_header(&header, 2048);
        assert_eq!(params.heap_bytes, 2048);
        assert_eq!(params.header_bytes, header.header_bytes);
        assert_eq!(params.abi_version, DESCRIPTOR_ABI_VERSION);
    }
}
