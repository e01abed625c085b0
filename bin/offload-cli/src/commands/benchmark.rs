// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `offload benchmark` command: sweep unit counts and buffer factors.
//!
//! Runs the same frame loop serialized (one pipeline per execution
//! object, buffer factor 1) and double-buffered (factor 2), across unit
//! counts, and prints a comparison table. The factor-2 rows show how
//! much host I/O the extra pipelines hide.

use anyhow::{bail, Context};
use net_format::NetManifest;
use offload_engine::{
    AcceleratorDriver, Configuration, DeviceKind, ExecutionObjectPipeline, Executor, SoftDriver,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub async fn execute(config_path: PathBuf, device: String, frames: u32) -> anyhow::Result<()> {
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║            offload · Benchmark Suite                ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();

    let mut config = Configuration::from_file(&config_path)
        .with_context(|| format!("loading '{}'", config_path.display()))?;
    config.run_full_net = true;

    // Benchmarks compare device classes on the same net, so a missing
    // net falls back to the demo classifier like `offload run` does.
    let _demo_dir = if config.network_file.exists() {
        None
    } else {
        println!("  Network artifacts not found. Benchmarking the demo classifier...");
        println!();
        Some(synthesize_artifacts(&mut config)?)
    };

    let kind = DeviceKind::from_str_loose(&device)
        .ok_or_else(|| anyhow::anyhow!("unknown device class '{device}'; expected npu or dsp"))?;

    let driver: Arc<dyn AcceleratorDriver> = Arc::new(SoftDriver::new());
    let available = Executor::num_devices(driver.as_ref(), kind);
    if available == 0 {
        bail!("no {} units detected on this platform", kind.as_str());
    }

    println!("  Device:  {} ({available} unit(s))", kind.as_str());
    println!("  Net:     {}", config.network_file.display());
    println!("  Frames:  {frames} per run");
    println!();

    // ── Results Table ──────────────────────────────────────────
    println!(
        "  {:<8} {:>6} {:>6} {:>10} {:>10} {:>10} {:>10}",
        "Factor", "Units", "EOPs", "Wall ms", "ms/frame", "Dev ms/f", "FPS",
    );
    println!("  {}", "-".repeat(67));

    let mut results: Vec<BenchResult> = Vec::new();
    let unit_counts: Vec<usize> = if available > 1 { vec![1, available] } else { vec![1] };

    for &units in &unit_counts {
        for factor in [1usize, 2] {
            match run_single(&driver, kind, units, factor, &config, frames).await {
                Ok(r) => {
                    println!(
                        "  {:<8} {:>6} {:>6} {:>10.1} {:>10.3} {:>10.3} {:>10.1}",
                        r.buffer_factor,
                        r.units,
                        r.num_eops,
                        r.wall_ms,
                        r.ms_per_frame,
                        r.device_ms_per_frame,
                        r.fps,
                    );
                    results.push(r);
                }
                Err(e) => {
                    println!("  {:<8} {:>6}     FAILED: {e}", factor, units);
                }
            }
        }
    }
    println!();

    // ── Summary ────────────────────────────────────────────────
    if results.is_empty() {
        println!("  No successful benchmark runs.");
        return Ok(());
    }

    let fastest = results
        .iter()
        .max_by(|a, b| a.fps.partial_cmp(&b.fps).unwrap())
        .unwrap();
    println!("  Summary:");
    println!(
        "   Fastest:  factor {} on {} unit(s) ({:.1} FPS)",
        fastest.buffer_factor, fastest.units, fastest.fps,
    );

    for &units in &unit_counts {
        let serial = results
            .iter()
            .find(|r| r.units == units && r.buffer_factor == 1);
        let buffered = results
            .iter()
            .find(|r| r.units == units && r.buffer_factor == 2);
        if let (Some(serial), Some(buffered)) = (serial, buffered) {
            println!(
                "   Overlap:  {:.2}x on {} unit(s) (factor 2 vs 1)",
                serial.wall_ms / buffered.wall_ms.max(1e-9),
                units,
            );
        }
    }
    println!();

    Ok(())
}

#[derive(Debug)]
struct BenchResult {
    buffer_factor: usize,
    units: usize,
    num_eops: usize,
    wall_ms: f64,
    ms_per_frame: f64,
    device_ms_per_frame: f64,
    fps: f64,
}

/// Brings the net up on `units` units and times one frame loop.
async fn run_single(
    driver: &Arc<dyn AcceleratorDriver>,
    kind: DeviceKind,
    units: usize,
    buffer_factor: usize,
    config: &Configuration,
    frames: u32,
) -> anyhow::Result<BenchResult> {
    let unit_ids: Vec<u8> = (0..units as u8).collect();
    let executor = Executor::new(
        Arc::clone(driver),
        kind,
        &unit_ids,
        config,
        net_format::DEFAULT_LAYERS_GROUP,
    )?;

    let mut eops = Vec::with_capacity(units * buffer_factor);
    for _ in 0..buffer_factor {
        for i in 0..executor.num_execution_objects() {
            let eo = executor
                .execution_object(i)
                .context("executor lost an execution object")?;
            eops.push(ExecutionObjectPipeline::new(vec![eo], executor.pool())?);
        }
    }
    let num_eops = eops.len();

    // Warm up one frame per pipeline.
    for eop in &mut eops {
        eop.input_buffer().fill(0);
        eop.process_frame_start_async()?;
    }
    for eop in &mut eops {
        eop.process_frame_wait()?;
    }

    let started = Instant::now();
    let mut device_ms = 0.0f64;
    for i in 0..frames as usize + num_eops {
        let eop = &mut eops[i % num_eops];
        if eop.process_frame_wait()? {
            device_ms += eop.process_time_ms();
        }
        if i < frames as usize {
            eop.set_frame_index(i as u32);
            {
                let buffer = eop.input_buffer();
                let mut guard = buffer.write();
                for (j, b) in guard.iter_mut().enumerate() {
                    *b = (i * 31 + j * 7) as u8;
                }
            }
            eop.process_frame_start_async()?;
        }
    }
    let wall = started.elapsed();

    let wall_ms = wall.as_secs_f64() * 1e3;
    Ok(BenchResult {
        buffer_factor,
        units,
        num_eops,
        wall_ms,
        ms_per_frame: wall_ms / frames.max(1) as f64,
        device_ms_per_frame: device_ms / frames.max(1) as f64,
        fps: frames as f64 / wall.as_secs_f64().max(1e-9),
    })
}

/// Builds the demo classifier into a temp directory and points the
/// configuration at it.
fn synthesize_artifacts(config: &mut Configuration) -> anyhow::Result<tempfile::TempDir> {
    let dir = tempfile::tempdir().context("creating demo directory")?;
    let manifest = NetManifest::classifier("demo-classifier", 28, 28, 1, 10);
    let (descriptor, weights) = manifest
        .build()
        .map_err(|e| anyhow::anyhow!("building demo net: {e}"))?;

    let network_file = dir.path().join("demo.net");
    let weights_file = dir.path().join("demo.params");
    descriptor
        .write_file(&network_file)
        .map_err(|e| anyhow::anyhow!("writing demo net: {e}"))?;
    std::fs::write(&weights_file, &weights).context("writing demo weights")?;

    config.network_file = network_file;
    config.weights_file = weights_file;
    Ok(dir)
}
