// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `offload run` command: drive a configured network at frame rate.
//!
//! Builds the executor/pipeline ladder for the requested device classes
//! and runs the canonical double-buffered loop:
//! ```text
//! for i in 0..frames + |eops| {
//!     eop = eops[i % |eops|]
//!     if eop.wait()  { emit frame }
//!     if i < frames  { fill input; eop.start_async() }
//! }
//! ```
//! The trailing `|eops|` iterations flush frames still in flight.

use anyhow::{bail, Context};
use net_format::NetManifest;
use offload_engine::{
    api_version, AcceleratorDriver, Configuration, DeviceKind, ExecutionObjectPipeline, Executor,
    SoftDriver,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Extra pipelines per execution object, hiding host I/O behind compute.
const BUFFER_FACTOR: usize = 2;

pub async fn execute(
    config_path: PathBuf,
    input: Option<PathBuf>,
    device: String,
    num_devices: Option<usize>,
    frames: Option<u32>,
    timestamps: Option<PathBuf>,
) -> anyhow::Result<()> {
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║             offload · Frame Runner                  ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();

    // ── Configuration ──────────────────────────────────────────
    let mut config = Configuration::from_file(&config_path)
        .with_context(|| format!("loading '{}'", config_path.display()))?;
    let num_frames = frames.unwrap_or(config.num_frames);

    // Keep a synthetic net alive for the whole run when falling back.
    let _demo_dir = if config.network_file.exists() {
        None
    } else {
        tracing::warn!(net = %config.network_file.display(), "network artifacts not found");
        println!("  Network artifacts not found. Running synthetic classifier demo...");
        println!();
        Some(synthesize_artifacts(&mut config)?)
    };

    println!("  Config:   {}", config.summary());
    println!("  Engine:   api {}", api_version());
    println!("  Frames:   {num_frames}");
    println!();

    let driver: Arc<dyn AcceleratorDriver> = Arc::new(SoftDriver::new());

    // ── Executors ──────────────────────────────────────────────
    println!("  [1/3] Bringing the network up...");
    let mut executors: Vec<Executor> = Vec::new();
    match device.to_lowercase().as_str() {
        "npu" | "dsp" => {
            let kind = parse_kind(&device)?;
            // A single class runs the whole network as one group.
            config.run_full_net = true;
            executors.push(build_executor(
                &driver,
                kind,
                num_devices,
                &config,
                net_format::DEFAULT_LAYERS_GROUP,
            )?);
        }
        "both" => {
            // Group 1 on the NPU class, group 2 on the DSP class.
            executors.push(build_executor(&driver, DeviceKind::Npu, num_devices, &config, 1)?);
            executors.push(build_executor(&driver, DeviceKind::Dsp, num_devices, &config, 2)?);
        }
        other => bail!("unknown device class '{other}'; expected npu, dsp, or both"),
    }
    for executor in &executors {
        println!(
            "        {:?}: {} execution object(s), group {}",
            executor.kind(),
            executor.num_execution_objects(),
            executor.group_id(),
        );
    }
    println!();

    // ── Pipelines ──────────────────────────────────────────────
    println!("  [2/3] Assembling pipelines (buffer factor {BUFFER_FACTOR})...");
    let mut eops = assemble_pipelines(&executors)?;
    println!("        {} pipeline(s): {}", eops.len(), eops[0].device_name());
    println!();

    let frame_bytes = eops[0].input_size_bytes();
    let frame = load_frame(input.as_deref(), frame_bytes)?;

    // ── Frame loop ─────────────────────────────────────────────
    println!("  [3/3] Processing {num_frames} frame(s)...");
    println!();

    let num_eops = eops.len();
    let started = Instant::now();
    let mut device_ms_total = 0.0f64;

    for i in 0..num_frames as usize + num_eops {
        let eop = &mut eops[i % num_eops];

        if eop.process_frame_wait()? {
            let scores = eop.output_buffer().to_vec();
            let winner = argmax(&scores);
            device_ms_total += eop.process_time_ms();
            println!(
                "   frame {:04}  →  class {:2}  (score {:3})  {:7.3} ms  [{}]",
                eop.frame_index(),
                winner,
                scores[winner],
                eop.process_time_ms(),
                eop.device_name(),
            );
        }

        if i < num_frames as usize {
            eop.set_frame_index(i as u32);
            fill_input(eop, &frame, i as u32)?;
            eop.process_frame_start_async()?;
        }
    }

    let wall = started.elapsed();
    println!();
    println!("  Results:");
    println!("   Frames:        {num_frames}");
    println!("   Wall time:     {:.1} ms", wall.as_secs_f64() * 1e3);
    println!(
        "   Throughput:    {:.1} frames/s",
        num_frames as f64 / wall.as_secs_f64().max(1e-9),
    );
    println!(
        "   Device time:   {:.3} ms/frame (sum over stages)",
        device_ms_total / num_frames.max(1) as f64,
    );
    for executor in &executors {
        println!(
            "   Pool ({}):    {}",
            executor.kind().as_str(),
            executor.pool_stats().summary(),
        );
    }

    if let Some(path) = timestamps {
        offload_engine::timestamp::write_csv(&path)?;
        println!("   Timestamps:    {}", path.display());
    }

    Ok(())
}

/// Opens one executor over the first `requested` units of `kind`.
fn build_executor(
    driver: &Arc<dyn AcceleratorDriver>,
    kind: DeviceKind,
    requested: Option<usize>,
    config: &Configuration,
    group_id: u32,
) -> anyhow::Result<Executor> {
    let available = Executor::num_devices(driver.as_ref(), kind);
    if available == 0 {
        bail!("no {} units detected on this platform", kind.as_str());
    }
    let take = requested.unwrap_or(available).min(available);
    if take == 0 {
        bail!("zero {} units requested", kind.as_str());
    }
    let units: Vec<u8> = (0..take as u8).collect();
    Ok(Executor::new(
        Arc::clone(driver),
        kind,
        &units,
        config,
        group_id,
    )?)
}

/// Chains one execution object per executor into each pipeline,
/// `BUFFER_FACTOR` pipelines per chain.
fn assemble_pipelines(
    executors: &[Executor],
) -> anyhow::Result<Vec<ExecutionObjectPipeline>> {
    let chains = executors
        .iter()
        .map(Executor::num_execution_objects)
        .min()
        .unwrap_or(0);
    if chains == 0 {
        bail!("no execution objects to assemble");
    }

    let mut eops = Vec::with_capacity(chains * BUFFER_FACTOR);
    for round in 0..BUFFER_FACTOR {
        for chain in 0..chains {
            let stages = executors
                .iter()
                .map(|e| {
                    e.execution_object(chain)
                        .context("executor lost an execution object")
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let pool = executors[0].pool();
            let eop = ExecutionObjectPipeline::new(stages, pool)?;
            tracing::debug!(round, chain, name = %eop.device_name(), "pipeline assembled");
            eops.push(eop);
        }
    }
    Ok(eops)
}

/// Writes the frame bytes (or a synthetic pattern) into the pipeline's
/// input buffer.
fn fill_input(
    eop: &ExecutionObjectPipeline,
    frame: &Option<Vec<u8>>,
    index: u32,
) -> anyhow::Result<()> {
    let buffer = eop.input_buffer();
    match frame {
        Some(bytes) => buffer
            .write_at(0, bytes)
            .map_err(|e| anyhow::anyhow!("frame upload failed: {e}"))?,
        None => {
            let mut guard = buffer.write();
            for (i, b) in guard.iter_mut().enumerate() {
                *b = (index as usize * 31 + i * 7) as u8;
            }
        }
    }
    Ok(())
}

/// Reads one raw frame from `path`, checking it covers the network's
/// input size.
fn load_frame(path: Option<&std::path::Path>, frame_bytes: usize) -> anyhow::Result<Option<Vec<u8>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let mut bytes =
        std::fs::read(path).with_context(|| format!("reading frame '{}'", path.display()))?;
    if bytes.len() < frame_bytes {
        bail!(
            "input frame is {} bytes, network expects {}",
            bytes.len(),
            frame_bytes
        );
    }
    bytes.truncate(frame_bytes);
    Ok(Some(bytes))
}

/// Builds the demo classifier into a temp directory and points the
/// configuration at it.
fn synthesize_artifacts(config: &mut Configuration) -> anyhow::Result<tempfile::TempDir> {
    let dir = tempfile::tempdir().context("creating demo directory")?;
    let manifest = NetManifest::classifier("demo-classifier", 28, 28, 1, 10).with_groups(&[1, 2]);
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

fn parse_kind(s: &str) -> anyhow::Result<DeviceKind> {
    DeviceKind::from_str_loose(s)
        .ok_or_else(|| anyhow::anyhow!("unknown device class '{s}'; expected npu or dsp"))
}

fn argmax(bytes: &[u8]) -> usize {
    let mut best = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if b > bytes[best] {
            best = i;
        }
    }
    best
}
