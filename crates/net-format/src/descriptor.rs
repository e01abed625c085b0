// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Packed network-descriptor structs and the host-side descriptor view.
//!
//! The descriptor is a linear chain of layers (the offline compiler has
//! already scheduled any graph structure away). Every struct here is
//! `repr(C)` with exclusively `u32` fields so the blob has no padding and
//! a single layout on every supported target. [`DescriptorHeader`] carries
//! the sizes the host was compiled with; the device cross-checks them at
//! configure time, which is what turns a silent ABI drift into a
//! `CreateParamsMismatch` error code.
//!
//! # Dense weight layout
//! A `dense` layer's weight range is a row-major `i8` matrix
//! `[out_len][in_len]` followed by one little-endian `i32` bias per output.
//! The accumulator is shifted right by [`DENSE_ACCUM_SHIFT`] and clamped
//! to `u8`. A `scale` layer's weight range is two bytes: `mul: i8`,
//! `shift: u8`.

use crate::FormatError;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// `"OFLD"` little-endian; first word of every descriptor blob.
pub const DESCRIPTOR_MAGIC: u32 = u32::from_le_bytes(*b"OFLD");

/// Bumped whenever a packed struct changes shape.
pub const DESCRIPTOR_ABI_VERSION: u32 = 3;

/// Group id assigned to non-data layers when the compiler does not split
/// the network.
pub const DEFAULT_LAYERS_GROUP: u32 = 1;

/// Right shift applied to dense accumulators before clamping to `u8`.
pub const DENSE_ACCUM_SHIFT: u32 = 7;

/// Fixed-size prologue of the descriptor blob.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DescriptorHeader {
    pub magic: u32,
    pub abi_version: u32,
    /// `size_of::<DescriptorHeader>()` on the producing host.
    pub header_bytes: u32,
    /// `size_of::<LayerRecord>()` on the producing host.
    pub record_bytes: u32,
    pub layer_count: u32,
    pub input_channels: u32,
    pub input_height: u32,
    pub input_width: u32,
    /// On-device parameter heap the network needs, in bytes.
    pub param_heap_bytes: u32,
    /// Per-core scratch limits handed through to the device.
    pub scratch_l1_bytes: u32,
    pub scratch_l2_bytes: u32,
    pub scratch_l3_bytes: u32,
}

/// One layer of the compiled chain.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LayerRecord {
    pub index: u32,
    /// Discriminant of [`LayerKind`].
    pub kind: u32,
    /// Layer group this layer is scheduled into. Data layers stay in
    /// group 0; compute layers are grouped 1..N.
    pub group_id: u32,
    pub in_channels: u32,
    pub in_height: u32,
    pub in_width: u32,
    pub out_channels: u32,
    pub out_height: u32,
    pub out_width: u32,
    /// Byte range of this layer's parameters in the weights blob.
    pub weight_offset: u32,
    pub weight_bytes: u32,
    /// Parameter-heap bytes the device reserves for this layer at setup.
    pub param_bytes: u32,
}

impl LayerRecord {
    pub fn layer_kind(&self) -> Option<LayerKind> {
        LayerKind::from_u32(self.kind)
    }

    pub fn in_dims(&self) -> TensorDims {
        TensorDims::new(self.in_channels, self.in_height, self.in_width)
    }

    pub fn out_dims(&self) -> TensorDims {
        TensorDims::new(self.out_channels, self.out_height, self.out_width)
    }
}

/// The computation a layer performs on its 8-bit tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Frame injection point; carries the external input into the chain.
    Data,
    /// Byte-for-byte passthrough.
    Identity,
    /// Per-tensor fixed-point multiply: `clamp((x * mul) >> shift)`.
    Scale,
    /// Fully connected over the flattened input, quantized to `u8`.
    Dense,
}

impl LayerKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Data),
            1 => Some(Self::Identity),
            2 => Some(Self::Scale),
            3 => Some(Self::Dense),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Data => 0,
            Self::Identity => 1,
            Self::Scale => 2,
            Self::Dense => 3,
        }
    }

    /// Parses a manifest string. Accepts common aliases.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "data" | "input" => Some(Self::Data),
            "identity" | "passthrough" | "copy" => Some(Self::Identity),
            "scale" | "mul" => Some(Self::Scale),
            "dense" | "fc" | "linear" | "inner_product" => Some(Self::Dense),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Identity => "identity",
            Self::Scale => "scale",
            Self::Dense => "dense",
        }
    }

    pub fn is_data(self) -> bool {
        matches!(self, Self::Data)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channels × height × width of an 8-bit tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TensorDims {
    pub channels: u32,
    pub height: u32,
    pub width: u32,
}

impl TensorDims {
    pub fn new(channels: u32, height: u32, width: u32) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Number of bytes a tensor of these dimensions occupies.
    pub fn byte_len(&self) -> usize {
        self.channels as usize * self.height as usize * self.width as usize
    }
}

impl fmt::Display for TensorDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.channels, self.height, self.width)
    }
}

/// Host-side parsed view of one descriptor blob.
///
/// # Example
/// ```
/// use net_format::NetManifest;
///
/// let (descriptor, _weights) = NetManifest::identity_chain("demo", 1, 8, 8, 1)
///     .build()
///     .unwrap();
/// assert_eq!(descriptor.groups(), vec![1]);
/// assert_eq!(descriptor.group_input_bytes(1).unwrap(), 64);
/// ```
#[derive(Debug, Clone)]
pub struct NetDescriptor {
    pub header: DescriptorHeader,
    pub layers: Vec<LayerRecord>,
}

impl NetDescriptor {
    /// Serializes header + records into the packed blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            std::mem::size_of::<DescriptorHeader>()
                + self.layers.len() * std::mem::size_of::<LayerRecord>(),
        );
        out.extend_from_slice(bytemuck::bytes_of(&self.header));
        for layer in &self.layers {
            out.extend_from_slice(bytemuck::bytes_of(layer));
        }
        out
    }

    /// Parses and structurally validates a packed blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let header_len = std::mem::size_of::<DescriptorHeader>();
        if bytes.len() < header_len {
            return Err(FormatError::Truncated {
                expected: header_len,
                found: bytes.len(),
            });
        }

        let header: DescriptorHeader = bytemuck::pod_read_unaligned(&bytes[..header_len]);

        if header.magic != DESCRIPTOR_MAGIC {
            return Err(FormatError::BadMagic {
                found: header.magic,
            });
        }
        if header.abi_version != DESCRIPTOR_ABI_VERSION {
            return Err(FormatError::AbiMismatch {
                expected: DESCRIPTOR_ABI_VERSION,
                found: header.abi_version,
            });
        }
        if header.header_bytes as usize != header_len {
            return Err(FormatError::LayoutMismatch {
                field: "header_bytes",
                expected: header_len as u32,
                found: header.header_bytes,
            });
        }
        let record_len = std::mem::size_of::<LayerRecord>();
        if header.record_bytes as usize != record_len {
            return Err(FormatError::LayoutMismatch {
                field: "record_bytes",
                expected: record_len as u32,
                found: header.record_bytes,
            });
        }

        let expected_total = header_len + header.layer_count as usize * record_len;
        if bytes.len() != expected_total {
            return Err(FormatError::Truncated {
                expected: expected_total,
                found: bytes.len(),
            });
        }

        let mut layers = Vec::with_capacity(header.layer_count as usize);
        for i in 0..header.layer_count as usize {
            let start = header_len + i * record_len;
            let record: LayerRecord =
                bytemuck::pod_read_unaligned(&bytes[start..start + record_len]);
            layers.push(record);
        }

        let descriptor = Self { header, layers };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Reads and parses a descriptor file.
    pub fn read_file(path: &Path) -> Result<Self, FormatError> {
        let bytes = std::fs::read(path).map_err(|source| FormatError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let descriptor = Self::from_bytes(&bytes)?;
        tracing::debug!(
            path = %path.display(),
            layers = descriptor.layers.len(),
            "descriptor loaded"
        );
        Ok(descriptor)
    }

    /// Writes the packed blob to a file.
    pub fn write_file(&self, path: &Path) -> Result<(), FormatError> {
        std::fs::write(path, self.to_bytes()).map_err(|source| FormatError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Structural validation: kinds, dims, chain consistency, grouping.
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.layers.is_empty() {
            return Err(FormatError::EmptyNetwork);
        }
        if self.layers.len() != self.header.layer_count as usize {
            return Err(FormatError::LayoutMismatch {
                field: "layer_count",
                expected: self.layers.len() as u32,
                found: self.header.layer_count,
            });
        }

        for (i, layer) in self.layers.iter().enumerate() {
            if layer.index as usize != i {
                return Err(FormatError::InvalidLayer {
                    index: i as u32,
                    detail: format!("record index {} out of order", layer.index),
                });
            }
            let kind = layer.layer_kind().ok_or_else(|| FormatError::InvalidLayer {
                index: i as u32,
                detail: format!("unknown layer kind {}", layer.kind),
            })?;

            if layer.in_dims().byte_len() == 0 || layer.out_dims().byte_len() == 0 {
                return Err(FormatError::InvalidLayer {
                    index: i as u32,
                    detail: "zero-sized tensor dimensions".into(),
                });
            }

            match kind {
                LayerKind::Data => {
                    if layer.in_dims() != layer.out_dims() {
                        return Err(FormatError::InvalidLayer {
                            index: i as u32,
                            detail: "data layer must not reshape".into(),
                        });
                    }
                    if layer.group_id != 0 {
                        return Err(FormatError::InvalidLayer {
                            index: i as u32,
                            detail: format!("data layer in group {}", layer.group_id),
                        });
                    }
                    if layer.weight_bytes != 0 {
                        return Err(FormatError::InvalidLayer {
                            index: i as u32,
                            detail: "data layer carries weights".into(),
                        });
                    }
                }
                LayerKind::Identity => {
                    if layer.in_dims() != layer.out_dims() {
                        return Err(FormatError::InvalidLayer {
                            index: i as u32,
                            detail: "identity layer must not reshape".into(),
                        });
                    }
                    if layer.weight_bytes != 0 {
                        return Err(FormatError::InvalidLayer {
                            index: i as u32,
                            detail: "identity layer carries weights".into(),
                        });
                    }
                }
                LayerKind::Scale => {
                    if layer.in_dims() != layer.out_dims() {
                        return Err(FormatError::InvalidLayer {
                            index: i as u32,
                            detail: "scale layer must not reshape".into(),
                        });
                    }
                    if layer.weight_bytes != 2 {
                        return Err(FormatError::InvalidLayer {
                            index: i as u32,
                            detail: format!(
                                "scale layer needs 2 weight bytes, has {}",
                                layer.weight_bytes
                            ),
                        });
                    }
                }
                LayerKind::Dense => {
                    let expected = dense_weight_bytes(layer.in_dims(), layer.out_dims());
                    if layer.weight_bytes as usize != expected {
                        return Err(FormatError::InvalidLayer {
                            index: i as u32,
                            detail: format!(
                                "dense layer needs {} weight bytes, has {}",
                                expected, layer.weight_bytes
                            ),
                        });
                    }
                }
            }

            if !kind.is_data() && layer.group_id == 0 {
                return Err(FormatError::InvalidLayer {
                    index: i as u32,
                    detail: "compute layer in data group 0".into(),
                });
            }

            // The chain must connect: every layer after the first consumes
            // its predecessor's output shape.
            if i > 0 {
                let prev = &self.layers[i - 1];
                if layer.in_dims() != prev.out_dims() {
                    return Err(FormatError::InvalidLayer {
                        index: i as u32,
                        detail: format!(
                            "input {} does not chain from previous output {}",
                            layer.in_dims(),
                            prev.out_dims()
                        ),
                    });
                }
            }
        }

        if self.layers[0].layer_kind() != Some(LayerKind::Data) {
            return Err(FormatError::InvalidLayer {
                index: 0,
                detail: "network must start with a data layer".into(),
            });
        }

        // Groups must form contiguous runs along the chain; a pipeline
        // stage is one run.
        let mut seen: Vec<u32> = Vec::new();
        for layer in self.layers.iter().filter(|l| l.group_id != 0) {
            match seen.last() {
                Some(&last) if last == layer.group_id => {}
                _ => {
                    if seen.contains(&layer.group_id) {
                        return Err(FormatError::InvalidLayer {
                            index: layer.index,
                            detail: format!("group {} is not contiguous", layer.group_id),
                        });
                    }
                    seen.push(layer.group_id);
                }
            }
        }

        if self.total_param_bytes() > self.header.param_heap_bytes as usize {
            tracing::warn!(
                needed = self.total_param_bytes(),
                heap = self.header.param_heap_bytes,
                "descriptor parameter demand exceeds declared heap; device setup will fail"
            );
        }

        Ok(())
    }

    /// Distinct compute-layer groups, in chain order.
    pub fn groups(&self) -> Vec<u32> {
        let mut out: Vec<u32> = Vec::new();
        for layer in &self.layers {
            if layer.group_id != 0 && !out.contains(&layer.group_id) {
                out.push(layer.group_id);
            }
        }
        out
    }

    fn group_layers(&self, group_id: u32) -> impl Iterator<Item = &LayerRecord> {
        self.layers.iter().filter(move |l| l.group_id == group_id)
    }

    /// Input dimensions of a group's first layer.
    pub fn group_input_dims(&self, group_id: u32) -> Result<TensorDims, FormatError> {
        self.group_layers(group_id)
            .next()
            .map(|l| l.in_dims())
            .ok_or(FormatError::UnknownGroup { group_id })
    }

    /// Output dimensions of a group's last layer.
    pub fn group_output_dims(&self, group_id: u32) -> Result<TensorDims, FormatError> {
        self.group_layers(group_id)
            .last()
            .map(|l| l.out_dims())
            .ok_or(FormatError::UnknownGroup { group_id })
    }

    /// Byte size of a group's external input buffer.
    pub fn group_input_bytes(&self, group_id: u32) -> Result<usize, FormatError> {
        Ok(self.group_input_dims(group_id)?.byte_len())
    }

    /// Byte size of a group's external output buffer.
    pub fn group_output_bytes(&self, group_id: u32) -> Result<usize, FormatError> {
        Ok(self.group_output_dims(group_id)?.byte_len())
    }

    /// Full-network override: schedule every compute layer into `group_id`.
    pub fn force_layers_group(&mut self, group_id: u32) {
        for layer in &mut self.layers {
            if layer.group_id != 0 {
                layer.group_id = group_id;
            }
        }
    }

    /// Applies per-layer group overrides (layer index → group id).
    pub fn apply_group_overrides(
        &mut self,
        overrides: &BTreeMap<u32, u32>,
    ) -> Result<(), FormatError> {
        for (&index, &group) in overrides {
            let layer = self
                .layers
                .get_mut(index as usize)
                .ok_or(FormatError::InvalidLayer {
                    index,
                    detail: "group override targets a layer that does not exist".into(),
                })?;
            if layer.group_id == 0 {
                return Err(FormatError::InvalidLayer {
                    index,
                    detail: "group override targets a data layer".into(),
                });
            }
            if group == 0 {
                return Err(FormatError::InvalidLayer {
                    index,
                    detail: "cannot move a compute layer into data group 0".into(),
                });
            }
            layer.group_id = group;
        }
        Ok(())
    }

    /// Total parameter-heap bytes this network reserves at setup.
    pub fn total_param_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.param_bytes as usize).sum()
    }

    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "{} layers, {} group(s), input {}, heap {} B",
            self.layers.len(),
            self.groups().len(),
            TensorDims::new(
                self.header.input_channels,
                self.header.input_height,
                self.header.input_width
            ),
            self.header.param_heap_bytes,
        )
    }
}

/// Weight bytes a dense layer occupies: `i8` matrix + `i32` bias row.
pub(crate) fn dense_weight_bytes(in_dims: TensorDims, out_dims: TensorDims) -> usize {
    let in_len = in_dims.byte_len();
    let out_len = out_dims.byte_len();
    out_len * in_len + 4 * out_len
}
