// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `offload inspect` command: display a compiled network's structure.
//!
//! Parses the descriptor blob and prints the header, a per-layer table,
//! and the layer groups with their boundary tensors. With `--weights`
//! the parameter image is cross-checked against the descriptor.

use net_format::{NetDescriptor, WeightsBlob};
use std::path::PathBuf;

pub async fn execute(network: PathBuf, weights: Option<PathBuf>) -> anyhow::Result<()> {
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║            offload · Network Inspector              ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();

    let descriptor = NetDescriptor::read_file(&network)
        .map_err(|e| anyhow::anyhow!("failed to load '{}': {e}", network.display()))?;
    descriptor
        .validate()
        .map_err(|e| anyhow::anyhow!("descriptor fails validation: {e}"))?;

    // ── Summary ────────────────────────────────────────────────
    let header = &descriptor.header;
    println!("  Network: {}", network.display());
    println!("  ABI version: {}", header.abi_version);
    println!("  Layers: {}", header.layer_count);
    println!(
        "  Input: {}x{}x{} ({} bytes/frame)",
        header.input_channels,
        header.input_height,
        header.input_width,
        header.input_channels as usize * header.input_height as usize * header.input_width as usize,
    );
    println!(
        "  Parameter heap: {:.1} KB",
        header.param_heap_bytes as f64 / 1024.0,
    );
    if header.scratch_l1_bytes + header.scratch_l2_bytes + header.scratch_l3_bytes > 0 {
        println!(
            "  Scratch: L1 {} / L2 {} / L3 {} bytes",
            header.scratch_l1_bytes, header.scratch_l2_bytes, header.scratch_l3_bytes,
        );
    }
    println!();

    // ── Per-Layer Detail ───────────────────────────────────────
    println!(
        "  {:<4} {:<10} {:>6} {:>12} {:>12} {:>10} {:>8}",
        "Idx", "Kind", "Group", "In", "Out", "Weights", "Heap",
    );
    println!("  {}", "-".repeat(70));

    for layer in &descriptor.layers {
        let kind = layer
            .layer_kind()
            .map(|k| k.as_str())
            .unwrap_or("unknown");
        println!(
            "  {:<4} {:<10} {:>6} {:>12} {:>12} {:>8.1} KB {:>6} B",
            layer.index,
            kind,
            layer.group_id,
            format!("{}", layer.in_dims()),
            format!("{}", layer.out_dims()),
            layer.weight_bytes as f64 / 1024.0,
            layer.param_bytes,
        );
    }
    println!();

    // ── Layer Groups ───────────────────────────────────────────
    let groups = descriptor.groups();
    println!("  Layer groups: {}", groups.len());
    for &group in &groups {
        let members = descriptor
            .layers
            .iter()
            .filter(|l| l.group_id == group)
            .count();
        let input = descriptor
            .group_input_dims(group)
            .map_err(|e| anyhow::anyhow!("group {group}: {e}"))?;
        let output = descriptor
            .group_output_dims(group)
            .map_err(|e| anyhow::anyhow!("group {group}: {e}"))?;
        println!(
            "   group {group}: {members} layer(s), {input} ({} B) -> {output} ({} B)",
            input.byte_len(),
            output.byte_len(),
        );
    }
    println!();

    // ── Weights Cross-Check ────────────────────────────────────
    if let Some(weights_path) = weights {
        let blob = WeightsBlob::open(&weights_path)
            .map_err(|e| anyhow::anyhow!("failed to open '{}': {e}", weights_path.display()))?;
        let declared: u64 = descriptor.layers.iter().map(|l| l.weight_bytes as u64).sum();
        println!("  Weights: {}", weights_path.display());
        println!(
            "   Image: {} bytes ({})",
            blob.len(),
            if blob.is_mapped() { "memory-mapped" } else { "heap-backed" },
        );
        println!("   Declared by descriptor: {declared} bytes");
        match blob.validate_against(&descriptor) {
            Ok(()) => println!("   Cross-check: OK"),
            Err(e) => {
                println!("   Cross-check: FAILED ({e})");
                anyhow::bail!("weights image does not match the descriptor");
            }
        }
        println!();
    }

    Ok(())
}
