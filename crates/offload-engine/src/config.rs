// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Engine configuration loaded from TOML files or constructed programmatically.
//!
//! # TOML Format
//! ```toml
//! network_file = "./nets/classifier.net"
//! weights_file = "./nets/classifier.params"
//! num_frames = 16
//! run_full_net = false
//! enable_layer_trace = false
//! host_pool_budget = "64M"
//!
//! [layer_groups]
//! 3 = 2
//! 4 = 2
//! ```
//!
//! Input dimensions default to `0`, meaning "take them from the network
//! descriptor"; setting them explicitly lets a caller reject a descriptor
//! that does not match the frames it plans to feed. `layer_groups`
//! reassigns individual layers to a different layers group before the
//! device is configured (keys are layer indices).

use crate::EngineError;
use device_memory::RegionBudget;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default host pool budget when the config does not name one.
pub const DEFAULT_POOL_BUDGET_MB: usize = 64;

/// Everything the executor needs to know to bring a network up on a
/// device class.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Configuration {
    /// Path to the compiled network descriptor.
    pub network_file: PathBuf,
    /// Path to the weights blob referenced by the descriptor.
    pub weights_file: PathBuf,
    /// Expected input channels; `0` takes the descriptor's value.
    #[serde(default)]
    pub input_channels: u32,
    /// Expected input height; `0` takes the descriptor's value.
    #[serde(default)]
    pub input_height: u32,
    /// Expected input width; `0` takes the descriptor's value.
    #[serde(default)]
    pub input_width: u32,
    /// Number of frames a demo loop should process.
    #[serde(default = "default_num_frames")]
    pub num_frames: u32,
    /// Collapse every compute layer into a single layers group.
    #[serde(default)]
    pub run_full_net: bool,
    /// Device parameter heap override in bytes; `None` sizes it from the
    /// descriptor's declared demand.
    pub param_heap_bytes: Option<u32>,
    /// Host pool budget (human-readable, e.g. `"64M"`).
    pub host_pool_budget: Option<String>,
    /// Capture every layer's output on the device for host readback.
    #[serde(default)]
    pub enable_layer_trace: bool,
    /// Record API start/end timestamps for offline visualization.
    #[serde(default)]
    pub enable_api_timestamps: bool,
    /// Frames of calibration history kept by the device quantizer.
    #[serde(default = "default_quant_history_1")]
    pub quant_history_1: u32,
    /// Frames of slow-moving calibration history.
    #[serde(default = "default_quant_history_2")]
    pub quant_history_2: u32,
    /// Extra headroom applied to quantization ranges, in percent.
    #[serde(default)]
    pub quant_margin: u32,
    /// Per-layer group reassignments applied before configure
    /// (layer index, as a string key, to group id).
    #[serde(default)]
    pub layer_groups: BTreeMap<String, u32>,
}

fn default_num_frames() -> u32 {
    1
}

fn default_quant_history_1() -> u32 {
    20
}

fn default_quant_history_2() -> u32 {
    5
}

impl Configuration {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| EngineError::io(path, source))?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| EngineError::config(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> Result<String, EngineError> {
        toml::to_string_pretty(self)
            .map_err(|e| EngineError::config(format!("TOML serialise error: {e}")))
    }

    /// Checks the fields that can be wrong independent of any descriptor.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.network_file.as_os_str().is_empty() {
            return Err(EngineError::config("network_file must not be empty"));
        }
        if self.weights_file.as_os_str().is_empty() {
            return Err(EngineError::config("weights_file must not be empty"));
        }
        if self.num_frames == 0 {
            return Err(EngineError::config("num_frames must be at least 1"));
        }
        if self.quant_margin > 100 {
            return Err(EngineError::config(format!(
                "quant_margin is a percentage, got {}",
                self.quant_margin
            )));
        }
        self.group_overrides()?;
        Ok(())
    }

    /// Parses `layer_groups` keys into layer indices.
    pub fn group_overrides(&self) -> Result<BTreeMap<u32, u32>, EngineError> {
        let mut overrides = BTreeMap::new();
        for (key, &group) in &self.layer_groups {
            let index: u32 = key.parse().map_err(|_| {
                EngineError::config(format!("layer_groups key '{key}' is not a layer index"))
            })?;
            if group == 0 {
                return Err(EngineError::config(format!(
                    "layer_groups[{key}] assigns reserved group 0"
                )));
            }
            overrides.insert(index, group);
        }
        Ok(overrides)
    }

    /// Resolves the host pool budget, falling back to
    /// [`DEFAULT_POOL_BUDGET_MB`].
    pub fn pool_budget(&self) -> Result<RegionBudget, EngineError> {
        match &self.host_pool_budget {
            Some(text) => RegionBudget::parse(text)
                .map_err(|e| EngineError::config(format!("invalid host_pool_budget: {e}"))),
            None => Ok(RegionBudget::from_mb(DEFAULT_POOL_BUDGET_MB)),
        }
    }

    /// One-line summary for startup logging.
    pub fn summary(&self) -> String {
        format!(
            "net={} weights={} frames={} full_net={} trace={}",
            self.network_file.display(),
            self.weights_file.display(),
            self.num_frames,
            self.run_full_net,
            self.enable_layer_trace,
        )
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            network_file: PathBuf::new(),
            weights_file: PathBuf::new(),
            input_channels: 0,
            input_height: 0,
            input_width: 0,
            num_frames: 1,
            run_full_net: false,
            param_heap_bytes: None,
            host_pool_budget: None,
            enable_layer_trace: false,
            enable_api_timestamps: false,
            quant_history_1: default_quant_history_1(),
            quant_history_2: default_quant_history_2(),
            quant_margin: 0,
            layer_groups: BTreeMap::new(),
        }
    }
}
