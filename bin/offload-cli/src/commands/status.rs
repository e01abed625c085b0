// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `offload status` command: display the accelerator platform state.
//!
//! Probes the driver for each device class and reports unit counts and
//! clocks. A class with zero units is reported, not an error, so the
//! command works on hosts without accelerators.

use offload_engine::{api_version, AcceleratorDriver, DeviceKind, Executor, SoftDriver};
use std::sync::Arc;

pub async fn execute() -> anyhow::Result<()> {
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║           offload · Accelerator Status              ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();

    let driver: Arc<dyn AcceleratorDriver> = Arc::new(SoftDriver::new());

    // ── Platform ───────────────────────────────────────────────
    println!("  Platform");
    println!("   Driver:       {}", driver.name());
    println!("   Engine API:   {}", api_version());
    println!();

    // ── Device Classes ─────────────────────────────────────────
    let mut available: Vec<DeviceKind> = Vec::new();
    for kind in [DeviceKind::Npu, DeviceKind::Dsp] {
        let units = Executor::num_devices(driver.as_ref(), kind);
        println!("  {}", kind.as_str().to_uppercase());
        if units == 0 {
            println!("   Units:        none detected");
            println!();
            continue;
        }
        available.push(kind);
        println!("   Units:        {units}  {}", unit_bar(units));
        println!("   Frequency:    {} MHz", driver.frequency_mhz(kind));
        let names: Vec<String> = (0..units).map(|i| format!("{}{i}", kind.as_str())).collect();
        println!("   Queues:       {}", names.join(", "));
        println!();
    }

    // ── Assessment ─────────────────────────────────────────────
    println!("  Assessment");
    match available.as_slice() {
        [] => {
            println!("   Status:       NO ACCELERATOR UNITS");
            println!("   Note:         `offload run` will exit with an error");
        }
        [kind] => {
            println!("   Status:       {} class online", kind.as_str().to_uppercase());
            println!("   Recommended:  offload run --device {}", kind.as_str());
        }
        _ => {
            println!("   Status:       Heterogeneous platform online");
            println!("   Recommended:  offload run --device both (split by layer group)");
        }
    }
    println!();

    Ok(())
}

/// Creates a visual unit-count bar (one mark per unit, capped at 16).
fn unit_bar(units: usize) -> String {
    let filled = units.min(16);
    format!("[{}{}]", "#".repeat(filled), ".".repeat(16 - filled))
}
