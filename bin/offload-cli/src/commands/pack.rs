// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `offload pack` command: compile a JSON manifest into device artifacts.
//!
//! Produces the `.net` descriptor and `.params` weights image that
//! `offload run` loads. The manifest format is documented on
//! [`net_format::NetManifest`]. A missing manifest path scaffolds the
//! built-in demo classifier instead, writing its manifest next to the
//! artifacts as a starting point.

use anyhow::Context;
use net_format::NetManifest;
use std::path::PathBuf;

pub async fn execute(manifest_path: PathBuf, out: PathBuf) -> anyhow::Result<()> {
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║             offload · Network Packer                ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();

    let manifest = if manifest_path.exists() {
        println!("  Manifest: {}", manifest_path.display());
        NetManifest::from_file(&manifest_path)
            .map_err(|e| anyhow::anyhow!("failed to load '{}': {e}", manifest_path.display()))?
    } else {
        println!("  Manifest not found. Packing the built-in demo classifier...");
        let template = NetManifest::classifier("demo-classifier", 28, 28, 1, 10).with_groups(&[1, 2]);
        let json = template
            .to_json()
            .map_err(|e| anyhow::anyhow!("serializing template: {e}"))?;
        std::fs::create_dir_all(&out)
            .with_context(|| format!("creating output directory '{}'", out.display()))?;
        let template_path = out.join(format!("{}.json", template.name));
        std::fs::write(&template_path, json)
            .with_context(|| format!("writing '{}'", template_path.display()))?;
        println!("  Template: {}", template_path.display());
        template
    };

    println!("  Network:  {}", manifest.name);
    if !manifest.description.is_empty() {
        println!("  About:    {}", manifest.description);
    }
    println!();

    let (descriptor, weights) = manifest
        .build()
        .map_err(|e| anyhow::anyhow!("manifest does not build: {e}"))?;

    std::fs::create_dir_all(&out)
        .with_context(|| format!("creating output directory '{}'", out.display()))?;
    let net_path = out.join(format!("{}.net", manifest.name));
    let params_path = out.join(format!("{}.params", manifest.name));

    descriptor
        .write_file(&net_path)
        .map_err(|e| anyhow::anyhow!("writing '{}': {e}", net_path.display()))?;
    std::fs::write(&params_path, &weights)
        .with_context(|| format!("writing '{}'", params_path.display()))?;

    // ── Artifact Summary ───────────────────────────────────────
    let header = &descriptor.header;
    println!("  Packed:");
    println!(
        "   Layers:         {} in {} group(s)",
        header.layer_count,
        descriptor.groups().len(),
    );
    println!(
        "   Input:          {}x{}x{}",
        header.input_channels, header.input_height, header.input_width,
    );
    println!(
        "   Parameter heap: {:.1} KB",
        header.param_heap_bytes as f64 / 1024.0,
    );
    println!(
        "   Descriptor:     {}  ({} bytes)",
        net_path.display(),
        descriptor.to_bytes().len(),
    );
    println!(
        "   Weights:        {}  ({} bytes)",
        params_path.display(),
        weights.len(),
    );
    println!();
    println!("  Inspect with: offload inspect {}", net_path.display());
    println!();

    Ok(())
}
