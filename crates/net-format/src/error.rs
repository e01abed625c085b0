// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for descriptor, manifest, and weights-blob handling.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while reading, writing, or validating network artifacts.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("failed to read {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest JSON: {0}")]
    ManifestParse(#[from] serde_json::Error),

    #[error("invalid manifest: {detail}")]
    InvalidManifest { detail: String },

    #[error("bad descriptor magic 0x{found:08x}")]
    BadMagic { found: u32 },

    #[error("descriptor ABI version mismatch: expected {expected}, found {found}")]
    AbiMismatch { expected: u32, found: u32 },

    #[error("descriptor layout mismatch in {field}: expected {expected}, found {found}")]
    LayoutMismatch {
        field: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("descriptor blob truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("descriptor contains no layers")]
    EmptyNetwork,

    #[error("invalid layer {index}: {detail}")]
    InvalidLayer { index: u32, detail: String },

    #[error("layer group {group_id} does not exist in this network")]
    UnknownGroup { group_id: u32 },

    #[error(
        "layer {index} weight range [{offset}, {offset}+{len}) exceeds weights blob of {blob_len} bytes"
    )]
    WeightsOutOfRange {
        index: u32,
        offset: u32,
        len: u32,
        blob_len: usize,
    },
}
