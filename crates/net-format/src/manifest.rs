// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! JSON network manifest: the authoring format behind the packed blobs.
//!
//! A manifest describes the compute chain only; the builder prepends the
//! data layer that injects the external frame. Packing a manifest yields
//! the descriptor blob plus a weights blob, which is what the engine and
//! the device actually consume.
//!
//! # Format
//! ```json
//! {
//!   "name": "mnist-lite",
//!   "input": { "channels": 1, "height": 28, "width": 28 },
//!   "layers": [
//!     { "kind": "scale", "scale_mul": 1, "scale_shift": 0 },
//!     { "kind": "dense", "output": { "channels": 10, "height": 1, "width": 1 } }
//!   ]
//! }
//! ```
//!
//! Layers without trained parameters get deterministic synthesized
//! weights, so a packed network behaves identically on every run.

use crate::descriptor::{
    dense_weight_bytes, DescriptorHeader, LayerKind, LayerRecord, NetDescriptor, TensorDims,
    DEFAULT_LAYERS_GROUP, DESCRIPTOR_ABI_VERSION, DESCRIPTOR_MAGIC,
};
use crate::FormatError;
use std::path::Path;

/// Heap bytes the device reserves per compute layer on top of its weights.
const LAYER_PARAM_OVERHEAD_BYTES: u32 = 16;

/// Top-level network manifest, deserialized from JSON.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NetManifest {
    /// Human-readable network name (e.g., `"mnist-lite"`).
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// External input dimensions; also the data layer's shape.
    pub input: TensorDims,
    /// Parameter-heap override in bytes. Defaults to the summed per-layer
    /// demand rounded up to the next KiB.
    #[serde(default)]
    pub param_heap_bytes: Option<u32>,
    /// Per-core scratch limits forwarded to the device untouched.
    #[serde(default)]
    pub scratch_l1_bytes: u32,
    #[serde(default)]
    pub scratch_l2_bytes: u32,
    #[serde(default)]
    pub scratch_l3_bytes: u32,
    /// Compute layers in chain order. The data layer is implicit.
    pub layers: Vec<ManifestLayer>,
}

/// A single compute layer entry in the manifest.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ManifestLayer {
    /// Layer kind string (e.g., `"identity"`, `"scale"`, `"dense"`).
    pub kind: String,
    /// Layer group this layer is scheduled into. Defaults to group 1.
    #[serde(default)]
    pub group: Option<u32>,
    /// Output dimensions. Required for `dense`; others inherit their input.
    #[serde(default)]
    pub output: Option<TensorDims>,
    /// Fixed-point multiplier for `scale` layers.
    #[serde(default = "default_scale_mul")]
    pub scale_mul: i8,
    /// Right shift for `scale` layers.
    #[serde(default)]
    pub scale_shift: u8,
}

fn default_scale_mul() -> i8 {
    1
}

impl NetManifest {
    /// Loads a manifest from a JSON file path.
    pub fn from_file(path: &Path) -> Result<Self, FormatError> {
        let content = std::fs::read_to_string(path).map_err(|source| FormatError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parses a manifest from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, FormatError> {
        let manifest: Self = serde_json::from_str(json)?;
        Ok(manifest)
    }

    /// Serializes the manifest to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, FormatError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the manifest to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), FormatError> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|source| FormatError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// A chain of `layers` identity layers over a fixed-shape tensor.
    pub fn identity_chain(name: &str, layers: u32, height: u32, width: u32, channels: u32) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            input: TensorDims::new(channels, height, width),
            param_heap_bytes: None,
            scratch_l1_bytes: 0,
            scratch_l2_bytes: 0,
            scratch_l3_bytes: 0,
            layers: (0..layers)
                .map(|_| ManifestLayer {
                    kind: "identity".to_string(),
                    group: None,
                    output: None,
                    scale_mul: 1,
                    scale_shift: 0,
                })
                .collect(),
        }
    }

    /// A scale + dense classifier head over a `height`×`width`×`channels`
    /// frame, emitting one score byte per class.
    pub fn classifier(name: &str, height: u32, width: u32, channels: u32, classes: u32) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            input: TensorDims::new(channels, height, width),
            param_heap_bytes: None,
            scratch_l1_bytes: 0,
            scratch_l2_bytes: 0,
            scratch_l3_bytes: 0,
            layers: vec![
                ManifestLayer {
                    kind: "scale".to_string(),
                    group: None,
                    output: None,
                    scale_mul: 1,
                    scale_shift: 0,
                },
                ManifestLayer {
                    kind: "dense".to_string(),
                    group: None,
                    output: Some(TensorDims::new(classes, 1, 1)),
                    scale_mul: 1,
                    scale_shift: 0,
                },
            ],
        }
    }

    /// Assigns layer groups to the compute layers in chain order.
    pub fn with_groups(mut self, groups: &[u32]) -> Self {
        for (layer, &group) in self.layers.iter_mut().zip(groups) {
            layer.group = Some(group);
        }
        self
    }

    /// Validates that the manifest is internally consistent.
    ///
    /// Checks:
    /// - At least one compute layer is defined.
    /// - All layer kind strings are recognised and none names the
    ///   implicit data layer.
    /// - Input and output dimensions are non-zero.
    /// - `dense` layers declare an output shape; other kinds do not reshape.
    /// - No compute layer targets the data group 0.
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.layers.is_empty() {
            return Err(FormatError::InvalidManifest {
                detail: "manifest contains no compute layers".into(),
            });
        }
        if self.input.byte_len() == 0 {
            return Err(FormatError::InvalidManifest {
                detail: "input dimensions must be non-zero".into(),
            });
        }

        let mut dims = self.input;
        for (i, layer) in self.layers.iter().enumerate() {
            let kind = LayerKind::from_str_loose(&layer.kind).ok_or_else(|| {
                FormatError::InvalidManifest {
                    detail: format!("layer {}: unrecognised kind '{}'", i, layer.kind),
                }
            })?;
            if kind.is_data() {
                return Err(FormatError::InvalidManifest {
                    detail: format!("layer {}: the data layer is implicit", i),
                });
            }
            if layer.group == Some(0) {
                return Err(FormatError::InvalidManifest {
                    detail: format!("layer {}: group 0 is reserved for the data layer", i),
                });
            }

            match kind {
                LayerKind::Dense => {
                    let out = layer.output.ok_or_else(|| FormatError::InvalidManifest {
                        detail: format!("layer {}: dense requires an output shape", i),
                    })?;
                    if out.byte_len() == 0 {
                        return Err(FormatError::InvalidManifest {
                            detail: format!("layer {}: zero-sized output shape", i),
                        });
                    }
                    dims = out;
                }
                _ => {
                    if let Some(out) = layer.output {
                        if out != dims {
                            return Err(FormatError::InvalidManifest {
                                detail: format!(
                                    "layer {}: kind '{}' must not reshape",
                                    i, layer.kind
                                ),
                            });
                        }
                    }
                    if kind == LayerKind::Scale && layer.scale_shift > 15 {
                        return Err(FormatError::InvalidManifest {
                            detail: format!(
                                "layer {}: scale shift {} out of range",
                                i, layer.scale_shift
                            ),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Packs the manifest into a descriptor and a weights blob.
    ///
    /// The result passes [`NetDescriptor::validate`]; use
    /// [`build_unchecked`](Self::build_unchecked) to construct deliberately
    /// malformed descriptors in tests.
    pub fn build(&self) -> Result<(NetDescriptor, Vec<u8>), FormatError> {
        let (descriptor, weights) = self.build_unchecked()?;
        descriptor.validate()?;
        Ok((descriptor, weights))
    }

    /// Packs without the final descriptor validation pass.
    pub fn build_unchecked(&self) -> Result<(NetDescriptor, Vec<u8>), FormatError> {
        self.validate()?;

        let mut layers = Vec::with_capacity(self.layers.len() + 1);
        let mut weights: Vec<u8> = Vec::new();

        layers.push(LayerRecord {
            index: 0,
            kind: LayerKind::Data.as_u32(),
            group_id: 0,
            in_channels: self.input.channels,
            in_height: self.input.height,
            in_width: self.input.width,
            out_channels: self.input.channels,
            out_height: self.input.height,
            out_width: self.input.width,
            weight_offset: 0,
            weight_bytes: 0,
            param_bytes: 0,
        });

        let mut dims = self.input;
        for (i, layer) in self.layers.iter().enumerate() {
            let index = (i + 1) as u32;
            // validate() already vetted the kind strings.
            let kind = LayerKind::from_str_loose(&layer.kind).ok_or_else(|| {
                FormatError::InvalidManifest {
                    detail: format!("layer {}: unrecognised kind '{}'", i, layer.kind),
                }
            })?;
            let in_dims = dims;
            let out_dims = match kind {
                LayerKind::Dense => layer.output.unwrap_or(in_dims),
                _ => in_dims,
            };

            let weight_offset = weights.len() as u32;
            match kind {
                LayerKind::Scale => {
                    weights.push(layer.scale_mul as u8);
                    weights.push(layer.scale_shift);
                }
                LayerKind::Dense => {
                    synthesize_dense_weights(index, in_dims, out_dims, &mut weights);
                }
                LayerKind::Data | LayerKind::Identity => {}
            }
            let weight_bytes = weights.len() as u32 - weight_offset;

            layers.push(LayerRecord {
                index,
                kind: kind.as_u32(),
                group_id: layer.group.unwrap_or(DEFAULT_LAYERS_GROUP),
                in_channels: in_dims.channels,
                in_height: in_dims.height,
                in_width: in_dims.width,
                out_channels: out_dims.channels,
                out_height: out_dims.height,
                out_width: out_dims.width,
                weight_offset,
                weight_bytes,
                param_bytes: weight_bytes + LAYER_PARAM_OVERHEAD_BYTES,
            });
            dims = out_dims;
        }

        let demand: u32 = layers.iter().map(|l| l.param_bytes).sum();
        let param_heap_bytes = self
            .param_heap_bytes
            .unwrap_or_else(|| demand.next_multiple_of(1024));

        let header = DescriptorHeader {
            magic: DESCRIPTOR_MAGIC,
            abi_version: DESCRIPTOR_ABI_VERSION,
            header_bytes: std::mem::size_of::<DescriptorHeader>() as u32,
            record_bytes: std::mem::size_of::<LayerRecord>() as u32,
            layer_count: layers.len() as u32,
            input_channels: self.input.channels,
            input_height: self.input.height,
            input_width: self.input.width,
            param_heap_bytes,
            scratch_l1_bytes: self.scratch_l1_bytes,
            scratch_l2_bytes: self.scratch_l2_bytes,
            scratch_l3_bytes: self.scratch_l3_bytes,
        };

        Ok((NetDescriptor { header, layers }, weights))
    }
}

/// Deterministic placeholder parameters for a dense layer.
///
/// Real deployments pack trained weights; synthesized ones keep packed
/// networks reproducible without a training pipeline. The pattern mixes
/// the layer index so stacked dense layers do not collapse into the same
/// matrix.
fn synthesize_dense_weights(
    layer_index: u32,
    in_dims: TensorDims,
    out_dims: TensorDims,
    weights: &mut Vec<u8>,
) {
    let in_len = in_dims.byte_len();
    let out_len = out_dims.byte_len();
    weights.reserve(dense_weight_bytes(in_dims, out_dims));

    for o in 0..out_len {
        for i in 0..in_len {
            let v = ((layer_index as usize * 11 + o * 7 + i * 3) % 15) as i8 - 7;
            weights.push(v as u8);
        }
    }
    for o in 0..out_len {
        let bias = ((layer_index as usize * 5 + o * 13) % 29) as i32 - 14;
        weights.extend_from_slice(&bias.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest_json() -> &'static str {
        r#"{
            "name": "mnist-lite",
            "description": "scale + dense classifier head",
            "input": { "channels": 1, "height": 28, "width": 28 },
            "layers": [
                { "kind": "scale", "scale_mul": 1, "scale_shift": 0 },
                { "kind": "dense", "output": { "channels": 10, "height": 1, "width": 1 } }
            ]
        }"#
    }

    #[test]
    fn test_parse_manifest() {
        let m = NetManifest::from_json(sample_manifest_json()).unwrap();
        assert_eq!(m.name, "mnist-lite");
        assert_eq!(m.input, TensorDims::new(1, 28, 28));
        assert_eq!(m.layers.len(), 2);
        assert_eq!(m.layers[1].output, Some(TensorDims::new(10, 1, 1)));
    }

    #[test]
    fn test_build_prepends_data_layer() {
        let m = NetManifest::from_json(sample_manifest_json()).unwrap();
        let (descriptor, weights) = m.build().unwrap();

        assert_eq!(descriptor.layers.len(), 3);
        assert_eq!(descriptor.layers[0].layer_kind(), Some(LayerKind::Data));
        assert_eq!(descriptor.layers[0].group_id, 0);
        assert_eq!(descriptor.layers[1].layer_kind(), Some(LayerKind::Scale));
        assert_eq!(descriptor.layers[2].layer_kind(), Some(LayerKind::Dense));

        // scale: 2 bytes; dense: 10*784 matrix + 10 i32 biases.
        assert_eq!(weights.len(), 2 + 10 * 784 + 40);
        assert_eq!(descriptor.layers[2].weight_offset, 2);
    }

    #[test]
    fn test_build_is_deterministic() {
        let m = NetManifest::classifier("t", 8, 8, 1, 4);
        let (_, w1) = m.build().unwrap();
        let (_, w2) = m.build().unwrap();
        assert_eq!(w1, w2);
    }

    #[test]
    fn test_heap_default_covers_demand() {
        let m = NetManifest::from_json(sample_manifest_json()).unwrap();
        let (descriptor, _) = m.build().unwrap();
        assert!(descriptor.header.param_heap_bytes as usize >= descriptor.total_param_bytes());
        assert_eq!(descriptor.header.param_heap_bytes % 1024, 0);
    }

    #[test]
    fn test_heap_override() {
        let mut m = NetManifest::identity_chain("t", 1, 4, 4, 1);
        m.param_heap_bytes = Some(4096);
        let (descriptor, _) = m.build().unwrap();
        assert_eq!(descriptor.header.param_heap_bytes, 4096);
    }

    #[test]
    fn test_validate_empty_layers() {
        let json = r#"{
            "name": "empty",
            "input": { "channels": 1, "height": 4, "width": 4 },
            "layers": []
        }"#;
        let m = NetManifest::from_json(json).unwrap();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_validate_bad_kind() {
        let json = r#"{
            "name": "bad",
            "input": { "channels": 1, "height": 4, "width": 4 },
            "layers": [{ "kind": "bogus" }]
        }"#;
        let m = NetManifest::from_json(json).unwrap();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_validate_explicit_data_rejected() {
        let json = r#"{
            "name": "bad",
            "input": { "channels": 1, "height": 4, "width": 4 },
            "layers": [{ "kind": "data" }]
        }"#;
        let m = NetManifest::from_json(json).unwrap();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_validate_dense_needs_output() {
        let json = r#"{
            "name": "bad",
            "input": { "channels": 1, "height": 4, "width": 4 },
            "layers": [{ "kind": "dense" }]
        }"#;
        let m = NetManifest::from_json(json).unwrap();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_validate_group_zero_rejected() {
        let m = NetManifest::identity_chain("t", 1, 4, 4, 1).with_groups(&[0]);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");

        let m = NetManifest::classifier("t", 8, 8, 1, 4);
        m.to_file(&path).unwrap();

        let back = NetManifest::from_file(&path).unwrap();
        assert_eq!(back.name, m.name);
        assert_eq!(back.layers.len(), m.layers.len());
    }

    #[test]
    fn test_with_groups() {
        let m = NetManifest::identity_chain("t", 3, 4, 4, 1).with_groups(&[1, 2, 2]);
        let (descriptor, _) = m.build().unwrap();
        assert_eq!(descriptor.groups(), vec![1, 2]);
    }
}
