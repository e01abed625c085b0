// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Shared-region budget configuration and parsing.
//!
//! A [`RegionBudget`] is the hard ceiling on the device-visible region.
//! On the target platforms this region is a fixed carve-out negotiated at
//! boot, so exceeding it is a configuration error, not a transient state.

use crate::MemoryError;
use std::fmt;

/// A hard ceiling on the device-visible shared region.
///
/// # Parsing
/// Supports human-readable strings with SI-style suffixes:
/// - `"64M"` or `"64MB"` → 64 × 1024² bytes
/// - `"1G"` or `"1GB"` → 1 × 1024³ bytes
/// - `"2048K"` or `"2048KB"` → 2048 × 1024 bytes
/// - `"1073741824"` → raw byte count
///
/// # Examples
/// ```
/// use device_memory::RegionBudget;
///
/// let b = RegionBudget::from_mb(64);
/// assert_eq!(b.as_mb(), 64);
///
/// let b = RegionBudget::parse("1G").unwrap();
/// assert_eq!(b.as_mb(), 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RegionBudget {
    /// Budget in bytes.
    bytes: usize,
}

impl RegionBudget {
    /// Creates a budget from a byte count.
    pub fn from_bytes(bytes: usize) -> Self {
        Self { bytes }
    }

    /// Creates a budget from megabytes.
    pub fn from_mb(mb: usize) -> Self {
        Self {
            bytes: mb * 1024 * 1024,
        }
    }

    /// Creates a budget from gigabytes.
    pub fn from_gb(gb: usize) -> Self {
        Self {
            bytes: gb * 1024 * 1024 * 1024,
        }
    }

    /// Returns the budget in bytes.
    pub fn as_bytes(&self) -> usize {
        self.bytes
    }

    /// Returns the budget in megabytes (truncated).
    pub fn as_mb(&self) -> usize {
        self.bytes / (1024 * 1024)
    }

    /// Parses a human-readable budget string.
    ///
    /// Accepted formats: `"64M"`, `"64MB"`, `"1G"`, `"1GB"`, `"2048K"`,
    /// `"2048KB"`, or a plain byte count like `"1073741824"`.
    /// Case-insensitive.
    pub fn parse(s: &str) -> Result<Self, MemoryError> {
        let raw = s;
        let s = s.trim();
        if s.is_empty() {
            return Err(MemoryError::InvalidBudget { input: raw.into() });
        }

        let s_upper = s.to_uppercase();

        let (num_str, multiplier) = if s_upper.ends_with("GB") {
            (&s[..s.len() - 2], 1024 * 1024 * 1024)
        } else if s_upper.ends_with('G') {
            (&s[..s.len() - 1], 1024 * 1024 * 1024)
        } else if s_upper.ends_with("MB") {
            (&s[..s.len() - 2], 1024 * 1024)
        } else if s_upper.ends_with('M') {
            (&s[..s.len() - 1], 1024 * 1024)
        } else if s_upper.ends_with("KB") {
            (&s[..s.len() - 2], 1024)
        } else if s_upper.ends_with('K') {
            (&s[..s.len() - 1], 1024)
        } else {
            (s, 1)
        };

        let value: usize = num_str
            .trim()
            .parse()
            .map_err(|_| MemoryError::InvalidBudget { input: raw.into() })?;

        if value == 0 {
            return Err(MemoryError::InvalidBudget { input: raw.into() });
        }

        Ok(Self {
            bytes: value * multiplier,
        })
    }
}

impl fmt::Display for RegionBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bytes >= 1024 * 1024 * 1024 && self.bytes % (1024 * 1024 * 1024) == 0 {
            write!(f, "{}G", self.bytes / (1024 * 1024 * 1024))
        } else if self.bytes >= 1024 * 1024 && self.bytes % (1024 * 1024) == 0 {
            write!(f, "{}M", self.bytes / (1024 * 1024))
        } else if self.bytes >= 1024 && self.bytes % 1024 == 0 {
            write!(f, "{}K", self.bytes / 1024)
        } else {
            write!(f, "{}B", self.bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_mb() {
        let b = RegionBudget::from_mb(64);
        assert_eq!(b.as_bytes(), 64 * 1024 * 1024);
        assert_eq!(b.as_mb(), 64);
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(RegionBudget::parse("64M").unwrap().as_mb(), 64);
        assert_eq!(RegionBudget::parse("64MB").unwrap().as_mb(), 64);
        assert_eq!(RegionBudget::parse("1G").unwrap().as_mb(), 1024);
        assert_eq!(RegionBudget::parse("1gb").unwrap().as_mb(), 1024);
        assert_eq!(RegionBudget::parse("2048K").unwrap().as_bytes(), 2048 * 1024);
        assert_eq!(RegionBudget::parse("4096").unwrap().as_bytes(), 4096);
    }

    #[test]
    fn test_parse_whitespace() {
        assert_eq!(RegionBudget::parse("  128M  ").unwrap().as_mb(), 128);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(RegionBudget::parse("").is_err());
        assert!(RegionBudget::parse("abc").is_err());
        assert!(RegionBudget::parse("0M").is_err());
        assert!(RegionBudget::parse("12X").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["64M", "1G", "512K"] {
            let b = RegionBudget::parse(s).unwrap();
            assert_eq!(format!("{b}"), s);
        }
    }
}
