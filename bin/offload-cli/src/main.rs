// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # offload
//!
//! Command-line interface for the offload execution engine.
//!
//! ## Usage
//! ```bash
//! # Pack a manifest into device artifacts
//! offload pack --manifest ./nets/classifier.json --out ./nets
//!
//! # Run a network over a frame stream
//! offload run --config ./offload.toml --frames 16
//!
//! # Compare serialized vs double-buffered throughput
//! offload benchmark --config ./offload.toml --frames 64
//!
//! # Inspect a compiled network descriptor
//! offload inspect --network ./nets/classifier.net
//! ```

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "offload",
    about = "Layer-grouped network offload to fixed-function accelerator cores",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging (repeat for more: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a configured network over a stream of frames.
    Run {
        /// Path to a TOML engine configuration.
        #[arg(short, long)]
        config: std::path::PathBuf,

        /// Raw input frame file (repeated for every frame); synthetic
        /// frames when omitted.
        #[arg(short, long)]
        input: Option<std::path::PathBuf>,

        /// Device class to run on: npu, dsp, or both (one group each).
        #[arg(short, long, default_value = "npu")]
        device: String,

        /// Units per class to use (all available when omitted).
        #[arg(short, long)]
        num_devices: Option<usize>,

        /// Frame count override (config's num_frames when omitted).
        #[arg(short, long)]
        frames: Option<u32>,

        /// Write API timestamps to this CSV after the run.
        #[arg(long)]
        timestamps: Option<std::path::PathBuf>,
    },

    /// Compare serialized against double-buffered frame throughput.
    Benchmark {
        /// Path to a TOML engine configuration.
        #[arg(short, long)]
        config: std::path::PathBuf,

        /// Device class to benchmark: npu or dsp.
        #[arg(short, long, default_value = "npu")]
        device: String,

        /// Frames per measured loop.
        #[arg(short, long, default_value_t = 64)]
        frames: u32,
    },

    /// Inspect a compiled network descriptor: header, groups, layers.
    Inspect {
        /// Path to the network descriptor file.
        #[arg(short, long)]
        network: std::path::PathBuf,

        /// Weights blob to cross-check against the descriptor.
        #[arg(short, long)]
        weights: Option<std::path::PathBuf>,
    },

    /// Display detected accelerator units and engine version.
    Status,

    /// Pack a JSON network manifest into descriptor + weights artifacts.
    Pack {
        /// Path to the manifest JSON.
        #[arg(short, long)]
        manifest: std::path::PathBuf,

        /// Output directory for the `.net` and `.params` files.
        #[arg(short, long, default_value = ".")]
        out: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    commands::init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            input,
            device,
            num_devices,
            frames,
            timestamps,
        } => commands::run::execute(config, input, device, num_devices, frames, timestamps).await,
        Commands::Benchmark {
            config,
            device,
            frames,
        } => commands::benchmark::execute(config, device, frames).await,
        Commands::Inspect { network, weights } => {
            commands::inspect::execute(network, weights).await
        }
        Commands::Status => commands::status::execute().await,
        Commands::Pack { manifest, out } => commands::pack::execute(manifest, out).await,
    }
}
