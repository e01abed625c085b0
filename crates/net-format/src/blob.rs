// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Read-only access to the compiled weights blob.
//!
//! Weights files can reach tens of megabytes, so the blob is memory-mapped
//! rather than copied. The mapping is immutable for the lifetime of the
//! [`WeightsBlob`]; the engine stages layer ranges into device-visible
//! buffers from here.

use crate::{FormatError, LayerRecord, NetDescriptor};
use std::path::Path;

enum Backing {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

/// The network's parameter bytes, file-backed when possible.
pub struct WeightsBlob {
    backing: Backing,
}

impl WeightsBlob {
    /// Opens a weights file, preferring a memory mapping.
    ///
    /// Falls back to an owned read when the platform refuses to map the
    /// file (some network filesystems do).
    pub fn open(path: &Path) -> Result<Self, FormatError> {
        let file = std::fs::File::open(path).map_err(|source| FormatError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;

        let backing = match unsafe { memmap2::Mmap::map(&file) } {
            Ok(mmap) => {
                tracing::info!(
                    "weights: mmap'd {} ({:.2} MB)",
                    path.display(),
                    mmap.len() as f64 / (1024.0 * 1024.0),
                );
                Backing::Mapped(mmap)
            }
            Err(e) => {
                tracing::warn!(
                    "weights: mmap of '{}' failed ({e}), reading into memory",
                    path.display(),
                );
                let bytes = std::fs::read(path).map_err(|source| FormatError::ReadError {
                    path: path.to_path_buf(),
                    source,
                })?;
                Backing::Owned(bytes)
            }
        };

        Ok(Self { backing })
    }

    /// Wraps an in-memory blob. Used by the manifest builder and tests.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            backing: Backing::Owned(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Returns `true` when the blob is file-backed via mmap.
    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(mmap) => mmap,
            Backing::Owned(bytes) => bytes,
        }
    }

    /// The weight bytes of one layer.
    pub fn layer_weights(&self, layer: &LayerRecord) -> Result<&[u8], FormatError> {
        let offset = layer.weight_offset as usize;
        let len = layer.weight_bytes as usize;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.len())
            .ok_or(FormatError::WeightsOutOfRange {
                index: layer.index,
                offset: layer.weight_offset,
                len: layer.weight_bytes,
                blob_len: self.len(),
            })?;
        Ok(&self.as_slice()[offset..end])
    }

    /// Checks that every layer's weight range fits inside this blob.
    pub fn validate_against(&self, descriptor: &NetDescriptor) -> Result<(), FormatError> {
        for layer in &descriptor.layers {
            self.layer_weights(layer)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WeightsBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightsBlob")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetManifest;

    #[test]
    fn test_open_maps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        std::fs::write(&path, [7u8; 256]).unwrap();

        let blob = WeightsBlob::open(&path).unwrap();
        assert_eq!(blob.len(), 256);
        assert!(blob.is_mapped());
        assert!(blob.as_slice().iter().all(|&b| b == 7));
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.bin");
        assert!(matches!(
            WeightsBlob::open(&path),
            Err(FormatError::ReadError { .. })
        ));
    }

    #[test]
    fn test_layer_range_check() {
        let (descriptor, weights) = NetManifest::classifier("t", 4, 4, 1, 3).build().unwrap();
        let blob = WeightsBlob::from_vec(weights);
        blob.validate_against(&descriptor).unwrap();

        // A truncated blob must fail the range check.
        let short = WeightsBlob::from_vec(blob.as_slice()[..blob.len() - 1].to_vec());
        assert!(matches!(
            short.validate_against(&descriptor),
            Err(FormatError::WeightsOutOfRange { .. })
        ));
    }

    #[test]
    fn test_debug_format() {
        let blob = WeightsBlob::from_vec(vec![0u8; 32]);
        let s = format!("{:?}", blob);
        assert!(s.contains("WeightsBlob"));
        assert!(s.contains("32"));
    }
}
