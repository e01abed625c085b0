// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # net-format
//!
//! The binary contract between the host engine and the accelerator cores:
//! a pre-compiled network travels as two artifacts, and their byte layout
//! **is** the ABI.
//!
//! - **Network descriptor** (`net.bin`): a packed, host-endian blob,
//!   [`DescriptorHeader`] followed by one [`LayerRecord`] per layer. The
//!   header carries the struct sizes and ABI version the host was built
//!   with; the device re-checks them at configure time and reports a
//!   layout mismatch instead of corrupting memory.
//! - **Weights blob** (`params.bin`): raw parameter bytes, addressed by
//!   `(weight_offset, weight_bytes)` ranges in the layer records. Opened
//!   with memory-mapped I/O ([`WeightsBlob`]); the engine copies it into
//!   device-visible memory once per executor.
//!
//! For authoring (demos, tests, the `offload pack` command) the crate
//! also provides [`NetManifest`], a small JSON description that compiles
//! into the two artifacts with deterministic synthetic weights.
//!
//! ```text
//! model.json ──NetManifest::build()──► (NetDescriptor, weights Vec<u8>)
//!                                            │              │
//!                                     net.bin (packed)  params.bin (raw)
//! ```
//!
//! Layer kinds are deliberately minimal (`data`, `identity`, `scale`,
//! `dense` over 8-bit tensors): enough for the execution engine's contract
//! to be exercised end to end; richer operator semantics are outside this
//! system's scope.

mod blob;
mod descriptor;
mod error;
mod manifest;
mod params;

pub use blob::WeightsBlob;
pub use descriptor::{
    DescriptorHeader, LayerKind, LayerRecord, NetDescriptor, TensorDims, DEFAULT_LAYERS_GROUP,
    DENSE_ACCUM_SHIFT, DESCRIPTOR_ABI_VERSION, DESCRIPTOR_MAGIC,
};
pub use error::FormatError;
pub use manifest::{ManifestLayer, NetManifest};
pub use params::{ConfigureParams, DeviceErrorCode, DeviceStatus, ProcessParams};
