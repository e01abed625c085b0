// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Pipelines chaining execution objects across layers groups.
//!
//! An [`ExecutionObjectPipeline`] strings the execution objects of
//! consecutive layers groups into one frame-level unit of work: the
//! frame enters the pipeline's own input buffer, flows through a
//! junction buffer between each pair of stages, and lands in the
//! pipeline's own output buffer. `process_frame_start_async` walks the
//! chain, waiting for each stage before issuing the next, and returns
//! with only the final stage in flight; `process_frame_wait` resolves
//! that final stage.
//!
//! Pipelines own their frame and junction buffers and rebind each
//! stage's kernels on every start, so several pipelines can share the
//! same execution objects to double-buffer a device. Stages complete in
//! issue order on any shared execution object; a driving loop that
//! starts and waits its pipelines round-robin preserves that order.
//!
//! At most one frame is in flight per pipeline. Waiting on an idle
//! pipeline reports `Ok(false)`.

use crate::execution_object::{CallType, EoHandle};
use crate::timestamp::{self, Api, Phase};
use crate::EngineError;
use accel_driver::DeviceKind;
use device_memory::{DevicePool, HostBuffer};

/// A chain of execution objects processing one frame end to end.
pub struct ExecutionObjectPipeline {
    stages: Vec<EoHandle>,
    stage_units: Vec<(DeviceKind, u8)>,
    input: HostBuffer,
    output: HostBuffer,
    /// `junctions[i]` carries stage `i` output into stage `i + 1`.
    junctions: Vec<HostBuffer>,
    frame_index: u32,
    in_flight: bool,
    stage_cycles: Vec<u64>,
    stage_times_ms: Vec<f64>,
}

impl ExecutionObjectPipeline {
    /// Builds a pipeline over `stages`, allocating its frame and
    /// junction buffers from `pool`.
    ///
    /// Stage output and input sizes must match pairwise along the
    /// chain.
    pub fn new(stages: Vec<EoHandle>, pool: &DevicePool) -> Result<Self, EngineError> {
        if stages.is_empty() {
            return Err(EngineError::config("a pipeline needs at least one stage"));
        }

        let mut stage_units = Vec::with_capacity(stages.len());
        let mut sizes = Vec::with_capacity(stages.len());
        for handle in &stages {
            let eo = handle.lock();
            stage_units.push((eo.device_kind(), eo.unit_id()));
            sizes.push((eo.input_size_bytes(), eo.output_size_bytes()));
        }
        for window in sizes.windows(2) {
            let (_, out_bytes) = window[0];
            let (in_bytes, _) = window[1];
            if out_bytes != in_bytes {
                return Err(EngineError::buffer_size(in_bytes, out_bytes));
            }
        }

        let input = pool.allocate(sizes[0].0).map_err(EngineError::allocation)?;
        let output = pool
            .allocate(sizes[sizes.len() - 1].1)
            .map_err(EngineError::allocation)?;
        let mut junctions = Vec::with_capacity(stages.len().saturating_sub(1));
        for &(_, out_bytes) in &sizes[..sizes.len() - 1] {
            junctions.push(pool.allocate(out_bytes).map_err(EngineError::allocation)?);
        }

        let stage_count = stages.len();
        Ok(Self {
            stages,
            stage_units,
            input,
            output,
            junctions,
            frame_index: 0,
            in_flight: false,
            stage_cycles: vec![0; stage_count],
            stage_times_ms: vec![0.0; stage_count],
        })
    }

    /// Pushes the current input frame through the chain.
    ///
    /// Blocks through all but the last stage and returns with the last
    /// stage issued; pair with [`process_frame_wait`]. The pipeline's
    /// frame index is stamped onto every stage.
    ///
    /// [`process_frame_wait`]: Self::process_frame_wait
    pub fn process_frame_start_async(&mut self) -> Result<(), EngineError> {
        if self.in_flight {
            return Err(EngineError::config(
                "pipeline already has a frame in flight",
            ));
        }
        let frame = self.frame_index;
        timestamp::record_eop(frame, Api::ProcessFrameStartAsync, Phase::Start);

        let last = self.stages.len() - 1;
        for i in 0..self.stages.len() {
            if i > 0 {
                self.wait_stage(i - 1)?;
            }

            let stage_in = if i == 0 {
                self.input.clone()
            } else {
                self.junctions[i - 1].clone()
            };
            let stage_out = if i == last {
                self.output.clone()
            } else {
                self.junctions[i].clone()
            };

            let (kind, unit) = self.stage_units[i];
            timestamp::record_eo(frame, i, Api::ProcessFrameStartAsync, Phase::Start, kind, unit);
            {
                let mut eo = self.stages[i].lock();
                eo.set_input_output_buffer(stage_in, stage_out)?;
                eo.set_frame_index(frame);
                eo.run_async(CallType::Compute)?;
            }
            timestamp::record_eo(frame, i, Api::ProcessFrameStartAsync, Phase::End, kind, unit);
        }

        self.in_flight = true;
        timestamp::record_eop(frame, Api::ProcessFrameStartAsync, Phase::End);
        Ok(())
    }

    /// Blocks until the in-flight frame has fully left the chain.
    /// Returns `Ok(false)` when no frame is in flight.
    pub fn process_frame_wait(&mut self) -> Result<bool, EngineError> {
        if !self.in_flight {
            return Ok(false);
        }
        let frame = self.frame_index;
        timestamp::record_eop(frame, Api::ProcessFrameWait, Phase::Start);

        self.in_flight = false;
        self.wait_stage(self.stages.len() - 1)?;

        timestamp::record_eop(frame, Api::ProcessFrameWait, Phase::End);
        Ok(true)
    }

    fn wait_stage(&mut self, stage: usize) -> Result<(), EngineError> {
        let (kind, unit) = self.stage_units[stage];
        let frame = self.frame_index;
        timestamp::record_eo(frame, stage, Api::ProcessFrameWait, Phase::Start, kind, unit);

        let mut eo = self.stages[stage].lock();
        eo.process_frame_wait()?;
        self.stage_cycles[stage] = eo.process_cycles();
        self.stage_times_ms[stage] = eo.process_time_ms();
        drop(eo);

        timestamp::record_eo(frame, stage, Api::ProcessFrameWait, Phase::End, kind, unit);
        Ok(())
    }

    // ── Buffers ────────────────────────────────────────────────────────

    /// The pipeline's frame input buffer.
    pub fn input_buffer(&self) -> HostBuffer {
        self.input.clone()
    }

    /// The pipeline's frame output buffer, valid after a successful
    /// wait.
    pub fn output_buffer(&self) -> HostBuffer {
        self.output.clone()
    }

    pub fn input_size_bytes(&self) -> usize {
        self.input.len()
    }

    pub fn output_size_bytes(&self) -> usize {
        self.output.len()
    }

    // ── Identity and accounting ────────────────────────────────────────

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn set_frame_index(&mut self, frame_index: u32) {
        self.frame_index = frame_index;
    }

    /// Unit names along the chain, e.g. `npu0+dsp1`.
    pub fn device_name(&self) -> String {
        self.stage_units
            .iter()
            .map(|(kind, unit)| format!("{}{}", kind.as_str(), unit))
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Total device cycles of the last completed frame, summed over
    /// stages. Stages on different device classes tick at different
    /// rates; prefer [`process_time_ms`] for comparisons.
    ///
    /// [`process_time_ms`]: Self::process_time_ms
    pub fn process_cycles(&self) -> u64 {
        self.stage_cycles.iter().sum()
    }

    /// Total device time of the last completed frame, summed over
    /// stages. With one frame in flight at a time this is the frame's
    /// cost; overlapping pipelines hide part of it.
    pub fn process_time_ms(&self) -> f64 {
        self.stage_times_ms.iter().sum()
    }

    /// Per-stage device times of the last completed frame.
    pub fn stage_times_ms(&self) -> &[f64] {
        &self.stage_times_ms
    }
}

impl std::fmt::Debug for ExecutionObjectPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionObjectPipeline")
            .field("stages", &self.device_name())
            .field("frame_index", &self.frame_index)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}
