// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Execution objects: one layers group running on one accelerator unit.
//!
//! An [`ExecutionObject`] owns the kernels and frame buffers for running
//! a single layers group of a configured network on a single unit's
//! queue. Each of its three phases (setup, compute, teardown) follows
//! the same split protocol: `run_async` issues the device call and
//! returns immediately, `wait` blocks for it and surfaces the device's
//! status. Waiting on a phase that has nothing in flight reports
//! `Ok(false)` instead of blocking, which lets callers drain pipelines
//! without tracking what they issued.
//!
//! The compute phase may have several calls in flight at once; the
//! execution object hands each one a free context slot and waits for
//! them in issue order, matching the FIFO order of the unit's queue.

use crate::device::{ContextSlot, Device, Kernel};
use crate::EngineError;
use accel_driver::{
    ArgAccess, DeviceKind, KernelArg, KERNEL_PROCESS, KERNEL_SETUP, KERNEL_TEARDOWN,
};
use device_memory::{DevicePool, HostBuffer};
use net_format::{DeviceStatus, NetDescriptor, ProcessParams, TensorDims};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

/// Shared handle under which execution objects move between pipelines.
pub type EoHandle = Arc<Mutex<ExecutionObject>>;

/// The three device-call phases of an execution object's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    Setup,
    Compute,
    Teardown,
}

impl CallType {
    fn call_name(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Compute => "process",
            Self::Teardown => "teardown",
        }
    }
}

/// Snapshot of one layer's output taken from the trace buffer.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    pub layer_index: u32,
    pub dims: TensorDims,
    pub bytes: Vec<u8>,
}

/// One layers group bound to one unit of an open device context.
pub struct ExecutionObject {
    device: Arc<Device>,
    queue: u8,
    descriptor: Arc<NetDescriptor>,
    group_id: u32,

    input: HostBuffer,
    output: HostBuffer,
    input_bytes: usize,
    output_bytes: usize,

    setup_kernel: Kernel,
    compute_kernel: Kernel,
    teardown_kernel: Kernel,
    setup_status: HostBuffer,
    teardown_status: HostBuffer,
    /// One status block per context slot; rebound as compute arg 0 at
    /// each issue so overlapping calls never share a write target.
    compute_status: [HostBuffer; ContextSlot::COUNT],
    /// Position of the `ProcessParams` scalar in the compute args.
    params_index: usize,

    free_slots: Vec<ContextSlot>,
    in_flight: VecDeque<(ContextSlot, u32)>,

    trace: Option<HostBuffer>,
    frame_index: u32,
    completed_frame: u32,
    last_cycles: u64,
}

impl ExecutionObject {
    pub(crate) fn new(
        device: Arc<Device>,
        queue: u8,
        descriptor: Arc<NetDescriptor>,
        group_id: u32,
        pool: &DevicePool,
        trace_enabled: bool,
    ) -> Result<Self, EngineError> {
        let input_bytes = descriptor
            .group_input_bytes(group_id)
            .map_err(EngineError::artifact)?;
        let output_bytes = descriptor
            .group_output_bytes(group_id)
            .map_err(EngineError::artifact)?;

        let input = pool.allocate(input_bytes).map_err(EngineError::allocation)?;
        let output = pool
            .allocate(output_bytes)
            .map_err(EngineError::allocation)?;

        let status_bytes = std::mem::size_of::<DeviceStatus>();
        let alloc_status = || pool.allocate(status_bytes).map_err(EngineError::allocation);
        let setup_status = alloc_status()?;
        let teardown_status = alloc_status()?;
        let compute_status = [
            alloc_status()?,
            alloc_status()?,
            alloc_status()?,
            alloc_status()?,
        ];

        let trace = if trace_enabled {
            let trace_bytes: usize = descriptor
                .layers
                .iter()
                .filter(|l| l.group_id == group_id)
                .map(|l| l.out_dims().byte_len())
                .sum();
            Some(pool.allocate(trace_bytes).map_err(EngineError::allocation)?)
        } else {
            None
        };

        let mut setup_args = vec![
            KernelArg::buffer(setup_status.clone(), ArgAccess::ReadWrite),
            KernelArg::scalar_u32(group_id),
        ];
        let scratch_l1 = descriptor.header.scratch_l1_bytes;
        if scratch_l1 > 0 {
            // The device refuses a setup whose L1 reservation falls short
            // of what the descriptor declares.
            setup_args.push(KernelArg::local(scratch_l1 as usize));
        }
        let setup_kernel = device.create_kernel(KERNEL_SETUP, queue, setup_args)?;
        let teardown_kernel = device.create_kernel(
            KERNEL_TEARDOWN,
            queue,
            vec![
                KernelArg::buffer(teardown_status.clone(), ArgAccess::ReadWrite),
                KernelArg::scalar_u32(group_id),
            ],
        )?;

        let mut compute_args = vec![
            KernelArg::buffer(compute_status[0].clone(), ArgAccess::ReadWrite),
            KernelArg::buffer(input.clone(), ArgAccess::ReadOnly),
            KernelArg::buffer(output.clone(), ArgAccess::WriteOnly),
        ];
        if let Some(trace_buf) = &trace {
            compute_args.push(KernelArg::buffer(trace_buf.clone(), ArgAccess::WriteOnly));
        }
        let params_index = compute_args.len();
        compute_args.push(KernelArg::scalar(&ProcessParams {
            frame_index: 0,
            trace_enabled: trace.is_some() as u32,
        }));
        compute_args.push(KernelArg::scalar_u32(group_id));
        let compute_kernel = device.create_kernel(KERNEL_PROCESS, queue, compute_args)?;

        // Slots are handed out low-to-high.
        let mut free_slots: Vec<ContextSlot> = ContextSlot::ALL.to_vec();
        free_slots.reverse();

        tracing::debug!(
            unit = %device.unit_name(queue),
            group_id,
            input_bytes,
            output_bytes,
            trace = trace.is_some(),
            "execution object ready"
        );

        Ok(Self {
            device,
            queue,
            descriptor,
            group_id,
            input,
            output,
            input_bytes,
            output_bytes,
            setup_kernel,
            compute_kernel,
            teardown_kernel,
            setup_status,
            teardown_status,
            compute_status,
            params_index,
            free_slots,
            in_flight: VecDeque::new(),
            trace,
            frame_index: 0,
            completed_frame: 0,
            last_cycles: 0,
        })
    }

    // ── Phase protocol ─────────────────────────────────────────────────

    /// Issues one device call of `call` and returns without waiting.
    pub fn run_async(&mut self, call: CallType) -> Result<(), EngineError> {
        match call {
            CallType::Setup => self.setup_kernel.run_async(ContextSlot::C0),
            CallType::Teardown => self.teardown_kernel.run_async(ContextSlot::C0),
            CallType::Compute => {
                let slot = self
                    .free_slots
                    .pop()
                    .ok_or_else(|| EngineError::slots_exhausted())?;
                let issue = (|| {
                    self.compute_kernel.set_arg(
                        0,
                        KernelArg::buffer(
                            self.compute_status[slot.index()].clone(),
                            ArgAccess::ReadWrite,
                        ),
                    )?;
                    self.compute_kernel.set_arg(
                        self.params_index,
                        KernelArg::scalar(&ProcessParams {
                            frame_index: self.frame_index,
                            trace_enabled: self.trace.is_some() as u32,
                        }),
                    )?;
                    self.compute_kernel.run_async(slot)
                })();
                match issue {
                    Ok(()) => {
                        self.in_flight.push_back((slot, self.frame_index));
                        Ok(())
                    }
                    Err(e) => {
                        self.free_slots.push(slot);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Blocks until the oldest in-flight call of `call` finishes.
    ///
    /// Returns `Ok(false)` when nothing of that phase is in flight. A
    /// non-success device status is surfaced as
    /// [`EngineError::DeviceReported`].
    pub fn wait(&mut self, call: CallType) -> Result<bool, EngineError> {
        match call {
            CallType::Setup => {
                if !self.setup_kernel.wait(ContextSlot::C0)? {
                    return Ok(false);
                }
                self.check_status(&self.setup_status.clone(), call)?;
                Ok(true)
            }
            CallType::Teardown => {
                if !self.teardown_kernel.wait(ContextSlot::C0)? {
                    return Ok(false);
                }
                self.check_status(&self.teardown_status.clone(), call)?;
                Ok(true)
            }
            CallType::Compute => {
                let Some((slot, frame)) = self.in_flight.pop_front() else {
                    return Ok(false);
                };
                self.compute_kernel.wait(slot)?;
                self.free_slots.push(slot);
                self.completed_frame = frame;
                let status = self.read_status(&self.compute_status[slot.index()])?;
                self.last_cycles = status.cycles;
                if !status.is_success() {
                    return Err(EngineError::device_reported(status.error(), call.call_name()));
                }
                Ok(true)
            }
        }
    }

    /// Issues a compute call for the current frame index.
    pub fn process_frame_start_async(&mut self) -> Result<(), EngineError> {
        self.run_async(CallType::Compute)
    }

    /// Waits for the oldest in-flight compute call; `Ok(false)` when
    /// none is.
    pub fn process_frame_wait(&mut self) -> Result<bool, EngineError> {
        self.wait(CallType::Compute)
    }

    /// Registers `callback` to run when the oldest in-flight compute
    /// call finishes. Returns `false` when none is in flight.
    pub fn add_callback(&mut self, callback: impl FnOnce() + Send + 'static) -> bool {
        match self.in_flight.front() {
            Some((slot, _)) => self.compute_kernel.add_callback(*slot, callback),
            None => false,
        }
    }

    fn read_status(&self, buffer: &HostBuffer) -> Result<DeviceStatus, EngineError> {
        let mut raw = [0u8; std::mem::size_of::<DeviceStatus>()];
        buffer
            .read_at(0, &mut raw)
            .map_err(EngineError::allocation)?;
        Ok(*bytemuck::from_bytes::<DeviceStatus>(&raw))
    }

    fn check_status(&mut self, buffer: &HostBuffer, call: CallType) -> Result<(), EngineError> {
        let status = self.read_status(buffer)?;
        self.last_cycles = status.cycles;
        if !status.is_success() {
            return Err(EngineError::device_reported(status.error(), call.call_name()));
        }
        Ok(())
    }

    // ── Buffers ────────────────────────────────────────────────────────

    /// Rebinds the frame input and output buffers.
    ///
    /// Sizes must match the group's tensors exactly. Calls already in
    /// flight keep the buffers they were issued with.
    pub fn set_input_output_buffer(
        &mut self,
        input: HostBuffer,
        output: HostBuffer,
    ) -> Result<(), EngineError> {
        if input.len() != self.input_bytes {
            return Err(EngineError::buffer_size(self.input_bytes, input.len()));
        }
        if output.len() != self.output_bytes {
            return Err(EngineError::buffer_size(self.output_bytes, output.len()));
        }
        self.compute_kernel
            .set_buffer_arg(1, input.clone(), ArgAccess::ReadOnly)?;
        self.compute_kernel
            .set_buffer_arg(2, output.clone(), ArgAccess::WriteOnly)?;
        self.input = input;
        self.output = output;
        Ok(())
    }

    pub fn input_buffer(&self) -> HostBuffer {
        self.input.clone()
    }

    pub fn output_buffer(&self) -> HostBuffer {
        self.output.clone()
    }

    pub fn input_size_bytes(&self) -> usize {
        self.input_bytes
    }

    pub fn output_size_bytes(&self) -> usize {
        self.output_bytes
    }

    // ── Identity and accounting ────────────────────────────────────────

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn set_frame_index(&mut self, frame_index: u32) {
        self.frame_index = frame_index;
    }

    /// Short name of the unit this object runs on, e.g. `npu1`.
    pub fn device_name(&self) -> String {
        self.device.unit_name(self.queue)
    }

    pub fn device_kind(&self) -> DeviceKind {
        self.device.kind()
    }

    pub fn unit_id(&self) -> u8 {
        self.device.unit_id(self.queue).unwrap_or(0)
    }

    /// Device cycles consumed by the most recently waited call.
    pub fn process_cycles(&self) -> u64 {
        self.last_cycles
    }

    /// Wall time of the most recently waited call, from device cycles
    /// and the unit's clock.
    pub fn process_time_ms(&self) -> f64 {
        self.last_cycles as f64 / (self.device.frequency_mhz() as f64 * 1000.0)
    }

    // ── Layer trace ────────────────────────────────────────────────────

    pub fn trace_enabled(&self) -> bool {
        self.trace.is_some()
    }

    /// Snapshots every layer output the device captured for the most
    /// recently completed frame.
    pub fn layer_outputs(&self) -> Result<Vec<LayerOutput>, EngineError> {
        let Some(trace_buf) = &self.trace else {
            return Err(EngineError::trace_disabled());
        };

        let mut outputs = Vec::new();
        let mut offset = 0usize;
        for layer in self
            .descriptor
            .layers
            .iter()
            .filter(|l| l.group_id == self.group_id)
        {
            let dims = layer.out_dims();
            let mut bytes = vec![0u8; dims.byte_len()];
            trace_buf
                .read_at(offset, &mut bytes)
                .map_err(EngineError::allocation)?;
            offset += bytes.len();
            outputs.push(LayerOutput {
                layer_index: layer.index,
                dims,
                bytes,
            });
        }
        Ok(outputs)
    }

    /// Snapshots one layer's output by its descriptor index. `None` when
    /// the layer is not in this object's group.
    pub fn output_from_layer(&self, layer_index: u32) -> Result<Option<LayerOutput>, EngineError> {
        Ok(self
            .layer_outputs()?
            .into_iter()
            .find(|out| out.layer_index == layer_index))
    }

    /// Writes each traced layer output to its own file under `dir`,
    /// named after the frame, layer and tensor shape. Returns the number
    /// of files written.
    pub fn write_layer_outputs_to_files(&self, dir: &Path) -> Result<usize, EngineError> {
        let outputs = self.layer_outputs()?;
        std::fs::create_dir_all(dir).map_err(|source| EngineError::io(dir, source))?;
        for out in &outputs {
            let name = format!(
                "trace_dump_{:04}_{:03}_{}x{}x{}.bin",
                self.completed_frame,
                out.layer_index,
                out.dims.channels,
                out.dims.height,
                out.dims.width
            );
            let path = dir.join(name);
            std::fs::write(&path, &out.bytes).map_err(|source| EngineError::io(path, source))?;
        }
        Ok(outputs.len())
    }
}

impl std::fmt::Debug for ExecutionObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionObject")
            .field("unit", &self.device_name())
            .field("group_id", &self.group_id)
            .field("frame_index", &self.frame_index)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_driver::{
        AcceleratorDriver, ProgramSource, SoftDriver, SoftTopology, KERNEL_CONFIGURE,
    };
    use device_memory::RegionBudget;
    use net_format::{ConfigureParams, NetManifest};

    fn open_device(kind: DeviceKind) -> Arc<Device> {
        let driver: Arc<dyn AcceleratorDriver> = Arc::new(SoftDriver::with_topology(SoftTopology {
            dsp_units: 1,
            npu_units: 1,
            ..Default::default()
        }));
        Device::open(driver, kind, &[0], &ProgramSource::BuiltIns).unwrap()
    }

    fn configure(device: &Arc<Device>, descriptor: &NetDescriptor, weights: &[u8]) {
        let status = HostBuffer::from_vec(vec![0u8; 16]);
        let descriptor_buf = HostBuffer::from_vec(descriptor.to_bytes());
        let weights_buf = HostBuffer::from_vec(weights.to_vec());
        let params = ConfigureParams::from_header(&descriptor.header, 64 * 1024);

        let mut kernel = device
            .create_kernel(
                KERNEL_CONFIGURE,
                0,
                vec![
                    KernelArg::buffer(status.clone(), ArgAccess::ReadWrite),
                    KernelArg::buffer(descriptor_buf, ArgAccess::ReadOnly),
                    KernelArg::buffer(weights_buf, ArgAccess::ReadOnly),
                    KernelArg::scalar(&params),
                ],
            )
            .unwrap();
        kernel.run_async(ContextSlot::C0).unwrap();
        kernel.wait(ContextSlot::C0).unwrap();

        let mut raw = [0u8; 16];
        status.read_at(0, &mut raw).unwrap();
        let status = bytemuck::from_bytes::<DeviceStatus>(&raw);
        assert!(status.is_success(), "configure failed: {:?}", status.error());
    }

    fn ready_eo(trace: bool) -> (ExecutionObject, DevicePool) {
        let (descriptor, weights) = NetManifest::identity_chain("t", 2, 4, 4, 1)
            .build()
            .unwrap();
        let device = open_device(DeviceKind::Npu);
        configure(&device, &descriptor, &weights);

        let pool = DevicePool::new(RegionBudget::from_mb(4));
        let mut eo = ExecutionObject::new(
            device,
            0,
            Arc::new(descriptor),
            net_format::DEFAULT_LAYERS_GROUP,
            &pool,
            trace,
        )
        .unwrap();

        eo.run_async(CallType::Setup).unwrap();
        assert!(eo.wait(CallType::Setup).unwrap());
        (eo, pool)
    }

    #[test]
    fn test_wait_with_nothing_in_flight() {
        let (descriptor, _) = NetManifest::identity_chain("t", 1, 4, 4, 1).build().unwrap();
        let device = open_device(DeviceKind::Dsp);
        let pool = DevicePool::new(RegionBudget::from_mb(4));
        let mut eo = ExecutionObject::new(
            device,
            0,
            Arc::new(descriptor),
            net_format::DEFAULT_LAYERS_GROUP,
            &pool,
            false,
        )
        .unwrap();

        assert!(!eo.wait(CallType::Setup).unwrap());
        assert!(!eo.wait(CallType::Compute).unwrap());
        assert!(!eo.wait(CallType::Teardown).unwrap());
        assert!(!eo.process_frame_wait().unwrap());
    }

    #[test]
    fn test_setup_reserves_declared_scratch() {
        let mut manifest = NetManifest::identity_chain("t", 1, 4, 4, 1);
        manifest.scratch_l1_bytes = 16 * 1024;
        let (descriptor, weights) = manifest.build().unwrap();
        let device = open_device(DeviceKind::Npu);
        configure(&device, &descriptor, &weights);

        let pool = DevicePool::new(RegionBudget::from_mb(4));
        let mut eo = ExecutionObject::new(
            device,
            0,
            Arc::new(descriptor),
            net_format::DEFAULT_LAYERS_GROUP,
            &pool,
            false,
        )
        .unwrap();

        // Setup fails on the device if the object forgets the local
        // scratch reservation.
        eo.run_async(CallType::Setup).unwrap();
        assert!(eo.wait(CallType::Setup).unwrap());
    }

    #[test]
    fn test_identity_frame_round_trip() {
        let (mut eo, _pool) = ready_eo(false);

        eo.input_buffer().write().copy_from_slice(&[7u8; 16]);
        eo.set_frame_index(3);
        eo.process_frame_start_async().unwrap();
        assert!(eo.process_frame_wait().unwrap());

        assert_eq!(eo.output_buffer().to_vec(), vec![7u8; 16]);
        assert!(eo.process_cycles() > 0);
        assert!(eo.process_time_ms() > 0.0);

        eo.run_async(CallType::Teardown).unwrap();
        assert!(eo.wait(CallType::Teardown).unwrap());
    }

    #[test]
    fn test_overlapping_computes_complete_in_order() {
        let (mut eo, _pool) = ready_eo(false);

        for frame in 0..3 {
            eo.set_frame_index(frame);
            eo.input_buffer().fill(frame as u8 + 1);
            eo.process_frame_start_async().unwrap();
        }
        for _ in 0..3 {
            assert!(eo.process_frame_wait().unwrap());
        }
        // Last issued frame wrote last on the shared output.
        assert_eq!(eo.output_buffer().to_vec(), vec![3u8; 16]);
        assert!(!eo.process_frame_wait().unwrap());
    }

    #[test]
    fn test_slots_exhausted_after_four_starts() {
        let (mut eo, _pool) = ready_eo(false);
        for _ in 0..ContextSlot::COUNT {
            eo.process_frame_start_async().unwrap();
        }
        assert!(matches!(
            eo.process_frame_start_async(),
            Err(EngineError::ContextSlotsExhausted { .. })
        ));
        for _ in 0..ContextSlot::COUNT {
            eo.process_frame_wait().unwrap();
        }
    }

    #[test]
    fn test_process_before_setup_reports_device_error() {
        let (descriptor, weights) = NetManifest::identity_chain("t", 1, 4, 4, 1).build().unwrap();
        let device = open_device(DeviceKind::Npu);
        configure(&device, &descriptor, &weights);

        let pool = DevicePool::new(RegionBudget::from_mb(4));
        let mut eo = ExecutionObject::new(
            device,
            0,
            Arc::new(descriptor),
            net_format::DEFAULT_LAYERS_GROUP,
            &pool,
            false,
        )
        .unwrap();

        eo.process_frame_start_async().unwrap();
        let err = eo.process_frame_wait().unwrap_err();
        assert!(matches!(err, EngineError::DeviceReported { .. }));
    }

    #[test]
    fn test_buffer_rebind_validates_sizes() {
        let (mut eo, pool) = ready_eo(false);

        let wrong = pool.allocate(8).unwrap();
        let right_in = pool.allocate(eo.input_size_bytes()).unwrap();
        let right_out = pool.allocate(eo.output_size_bytes()).unwrap();

        assert!(eo
            .set_input_output_buffer(wrong.clone(), right_out.clone())
            .is_err());
        assert!(eo.set_input_output_buffer(right_in.clone(), wrong).is_err());
        eo.set_input_output_buffer(right_in.clone(), right_out.clone())
            .unwrap();
        assert!(eo.input_buffer().same_allocation(&right_in));

        right_in.fill(9);
        eo.process_frame_start_async().unwrap();
        eo.process_frame_wait().unwrap();
        assert_eq!(right_out.to_vec(), vec![9u8; 16]);
    }

    #[test]
    fn test_layer_trace_snapshot() {
        let (mut eo, _pool) = ready_eo(true);

        eo.input_buffer().fill(5);
        eo.process_frame_start_async().unwrap();
        eo.process_frame_wait().unwrap();

        let outputs = eo.layer_outputs().unwrap();
        assert_eq!(outputs.len(), 2);
        for out in &outputs {
            assert_eq!(out.bytes, vec![5u8; 16]);
        }

        let single = eo.output_from_layer(outputs[0].layer_index).unwrap();
        assert_eq!(single.unwrap().bytes, vec![5u8; 16]);
        // The data layer lives in group 0, outside this object's group.
        assert!(eo.output_from_layer(0).unwrap().is_none());

        let dir = tempfile::tempdir().unwrap();
        let written = eo.write_layer_outputs_to_files(dir.path()).unwrap();
        assert_eq!(written, 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_trace_disabled_is_an_error() {
        let (eo, _pool) = ready_eo(false);
        assert!(matches!(
            eo.layer_outputs(),
            Err(EngineError::TraceDisabled { .. })
        ));
    }

    #[test]
    fn test_callback_on_compute() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let (mut eo, _pool) = ready_eo(false);
        let hits = Arc::new(AtomicU32::new(0));

        assert!(!eo.add_callback(|| {}));
        eo.process_frame_start_async().unwrap();
        let hits2 = Arc::clone(&hits);
        assert!(eo.add_callback(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        eo.process_frame_wait().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
