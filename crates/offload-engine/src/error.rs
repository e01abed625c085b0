// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Engine error type and the two-tier failure model.
//!
//! Fatal faults (device missing, build failure, allocation failure, an
//! error code reported by the device) come back as [`EngineError`] values
//! carrying the source location that raised them. Sequencing slips (a
//! `wait` with nothing in flight) are *not* errors; they return
//! `Ok(false)` so pipeline drain loops can use them as control flow.
//! Platform absence is not an error either: the device-count query just
//! returns zero.

use accel_driver::{DeviceKind, DriverError};
use device_memory::MemoryError;
use net_format::{DeviceErrorCode, FormatError};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Source location an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub file: &'static str,
    pub line: u32,
}

impl Origin {
    #[track_caller]
    pub(crate) fn here() -> Self {
        let location = std::panic::Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Fatal engine errors. See the module docs for what is *not* one.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no usable {kind} device: {detail} [{origin}]")]
    DeviceNotFound {
        kind: DeviceKind,
        detail: String,
        origin: Origin,
    },

    #[error("program build failed: {detail} [{origin}]")]
    ProgramBuildFailure { detail: String, origin: Origin },

    #[error("kernel '{name}' not found in device program [{origin}]")]
    KernelNotFound { name: String, origin: Origin },

    #[error("device-visible allocation failed: {source} [{origin}]")]
    AllocationFailure {
        #[source]
        source: MemoryError,
        origin: Origin,
    },

    #[error("network artifact error: {source} [{origin}]")]
    ArtifactError {
        #[source]
        source: FormatError,
        origin: Origin,
    },

    #[error("configuration error: {detail} [{origin}]")]
    ConfigError { detail: String, origin: Origin },

    #[error("device reported {code} during {call} [{origin}]")]
    DeviceReported {
        code: DeviceErrorCode,
        call: &'static str,
        origin: Origin,
    },

    #[error("driver call failed: {source} [{origin}]")]
    Driver {
        #[source]
        source: DriverError,
        origin: Origin,
    },

    #[error("buffer size mismatch: expected {expected} bytes, got {found} [{origin}]")]
    BufferSizeMismatch {
        expected: usize,
        found: usize,
        origin: Origin,
    },

    #[error("all kernel context slots are in flight [{origin}]")]
    ContextSlotsExhausted { origin: Origin },

    #[error("layer trace is not enabled on this execution object [{origin}]")]
    TraceDisabled { origin: Origin },

    #[error("i/o error on {path}: {source} [{origin}]")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
        origin: Origin,
    },
}

impl EngineError {
    #[track_caller]
    pub(crate) fn device_not_found(kind: DeviceKind, detail: impl Into<String>) -> Self {
        Self::DeviceNotFound {
            kind,
            detail: detail.into(),
            origin: Origin::here(),
        }
    }

    #[track_caller]
    pub(crate) fn program_build(detail: impl Into<String>) -> Self {
        Self::ProgramBuildFailure {
            detail: detail.into(),
            origin: Origin::here(),
        }
    }

    #[track_caller]
    pub(crate) fn kernel_not_found(name: impl Into<String>) -> Self {
        Self::KernelNotFound {
            name: name.into(),
            origin: Origin::here(),
        }
    }

    #[track_caller]
    pub(crate) fn allocation(source: MemoryError) -> Self {
        Self::AllocationFailure {
            source,
            origin: Origin::here(),
        }
    }

    #[track_caller]
    pub(crate) fn artifact(source: FormatError) -> Self {
        Self::ArtifactError {
            source,
            origin: Origin::here(),
        }
    }

    #[track_caller]
    pub(crate) fn config(detail: impl Into<String>) -> Self {
        Self::ConfigError {
            detail: detail.into(),
            origin: Origin::here(),
        }
    }

    #[track_caller]
    pub(crate) fn device_reported(code: DeviceErrorCode, call: &'static str) -> Self {
        Self::DeviceReported {
            code,
            call,
            origin: Origin::here(),
        }
    }

    #[track_caller]
    pub(crate) fn driver(source: DriverError) -> Self {
        Self::Driver {
            source,
            origin: Origin::here(),
        }
    }

    #[track_caller]
    pub(crate) fn buffer_size(expected: usize, found: usize) -> Self {
        Self::BufferSizeMismatch {
            expected,
            found,
            origin: Origin::here(),
        }
    }

    #[track_caller]
    pub(crate) fn slots_exhausted() -> Self {
        Self::ContextSlotsExhausted {
            origin: Origin::here(),
        }
    }

    #[track_caller]
    pub(crate) fn trace_disabled() -> Self {
        Self::TraceDisabled {
            origin: Origin::here(),
        }
    }

    #[track_caller]
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
            origin: Origin::here(),
        }
    }

    /// The device error code, when this error wraps one.
    pub fn device_code(&self) -> Option<DeviceErrorCode> {
        match self {
            Self::DeviceReported { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_points_at_raise_site() {
        let err = EngineError::config("bad");
        match err {
            EngineError::ConfigError { origin, .. } => {
                assert!(origin.file.ends_with("error.rs"));
                assert!(origin.line > 0);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_display_carries_location() {
        let err = EngineError::device_reported(DeviceErrorCode::HeapAllocFailure, "setup");
        let text = err.to_string();
        assert!(text.contains("heap allocation failure"));
        assert!(text.contains("setup"));
        assert!(text.contains("error.rs"));
    }

    #[test]
    fn test_device_code_accessor() {
        let err = EngineError::device_reported(DeviceErrorCode::ProcessFailure, "process");
        assert_eq!(err.device_code(), Some(DeviceErrorCode::ProcessFailure));
        assert!(EngineError::config("x").device_code().is_none());
    }
}
