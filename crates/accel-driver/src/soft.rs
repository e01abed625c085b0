// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Software device: a full [`AcceleratorDriver`] with no hardware under it.
//!
//! Every queue gets a dedicated worker thread, so the concurrency shape
//! matches a real platform: calls on one queue run FIFO, calls on
//! different queues overlap. The interpreter in [`crate::interp`] supplies
//! the device-side semantics, including a synthetic cycle model that the
//! workers use to pace calls.
//!
//! ```text
//!             SoftDriver
//!   ┌────────────┴────────────┐
//!   │ context (dsp, units 0,1)│
//!   │  ├─ queue 0 ── worker 0 │   FIFO per queue,
//!   │  ├─ queue 1 ── worker 1 │   concurrent across queues
//!   │  └─ net state (RwLock)  │
//!   └─────────────────────────┘
//! ```
//!
//! Topology comes from [`SoftTopology::probe`], which honours the
//! `OFFLOAD_SOFT_DSP_UNITS` and `OFFLOAD_SOFT_NPU_UNITS` environment
//! variables. Setting both to `0` models a platform without accelerators.

use crate::types::BUILTIN_KERNELS;
use crate::{
    interp, AcceleratorDriver, Completion, ContextHandle, DeviceKind, DriverError, KernelArg,
    KernelHandle, ProgramHandle, ProgramSource,
};
use device_memory::HostBuffer;
use net_format::{DeviceStatus, NetDescriptor};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

/// Units a single class can expose; matches the completion-slot width of
/// the engine's kernels.
pub const MAX_UNITS_PER_CLASS: usize = 4;

/// Longest pause a single call may simulate, in microseconds.
const MAX_PACE_MICROS: u64 = 20_000;

/// Unit counts and per-class characteristics of the simulated platform.
#[derive(Debug, Clone)]
pub struct SoftTopology {
    pub dsp_units: usize,
    pub npu_units: usize,
    pub dsp_freq_mhz: u64,
    pub npu_freq_mhz: u64,
    /// On-device global heap capacity available to one context.
    pub heap_capacity_bytes: u32,
    /// Memory-record table entries available to one context.
    pub max_mem_records: usize,
}

impl Default for SoftTopology {
    fn default() -> Self {
        Self {
            dsp_units: 2,
            npu_units: 2,
            dsp_freq_mhz: 750,
            npu_freq_mhz: 650,
            heap_capacity_bytes: 64 * 1024 * 1024,
            max_mem_records: 128,
        }
    }
}

impl SoftTopology {
    /// Default topology adjusted by the `OFFLOAD_SOFT_*_UNITS` variables.
    pub fn probe() -> Self {
        let defaults = Self::default();
        Self {
            dsp_units: env_units("OFFLOAD_SOFT_DSP_UNITS", defaults.dsp_units),
            npu_units: env_units("OFFLOAD_SOFT_NPU_UNITS", defaults.npu_units),
            ..defaults
        }
    }

    /// A platform without accelerators.
    pub fn none() -> Self {
        Self {
            dsp_units: 0,
            npu_units: 0,
            ..Self::default()
        }
    }

    pub fn unit_count(&self, kind: DeviceKind) -> usize {
        match kind {
            DeviceKind::Dsp => self.dsp_units,
            DeviceKind::Npu => self.npu_units,
        }
    }

    pub fn frequency_mhz(&self, kind: DeviceKind) -> u64 {
        match kind {
            DeviceKind::Dsp => self.dsp_freq_mhz,
            DeviceKind::Npu => self.npu_freq_mhz,
        }
    }
}

fn env_units(var: &str, default: usize) -> usize {
    match std::env::var(var) {
        Ok(s) => match s.trim().parse::<usize>() {
            Ok(n) if n <= MAX_UNITS_PER_CLASS => n,
            Ok(n) => {
                tracing::warn!(var, n, "unit count capped at {MAX_UNITS_PER_CLASS}");
                MAX_UNITS_PER_CLASS
            }
            Err(_) => {
                tracing::warn!(var, value = %s, "unparseable unit count ignored");
                default
            }
        },
        Err(_) => default,
    }
}

struct WorkItem {
    kernel: &'static str,
    args: Vec<KernelArg>,
    completion: Completion,
}

struct QueueSlot {
    tx: Mutex<Option<mpsc::Sender<WorkItem>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Device-side network state, established by `configure`.
pub(crate) struct NetState {
    pub(crate) descriptor: NetDescriptor,
    pub(crate) weights: HostBuffer,
    pub(crate) heap_capacity: u32,
    pub(crate) heap_used: u32,
    pub(crate) mem_records: usize,
    pub(crate) ready_groups: HashSet<u32>,
}

/// One open context: a class, its units, and their queues.
pub(crate) struct ContextState {
    pub(crate) kind: DeviceKind,
    pub(crate) heap_capacity_bytes: u32,
    pub(crate) max_mem_records: usize,
    pub(crate) net: RwLock<Option<NetState>>,
    queues: Vec<QueueSlot>,
}

struct ProgramState {
    context: u64,
}

struct KernelState {
    context: u64,
    name: &'static str,
}

/// The in-process software device.
pub struct SoftDriver {
    topology: SoftTopology,
    next_id: AtomicU64,
    contexts: Mutex<HashMap<u64, Arc<ContextState>>>,
    programs: Mutex<HashMap<u64, ProgramState>>,
    kernels: Mutex<HashMap<u64, KernelState>>,
}

impl SoftDriver {
    /// A driver over the probed topology.
    pub fn new() -> Self {
        Self::with_topology(SoftTopology::probe())
    }

    pub fn with_topology(topology: SoftTopology) -> Self {
        tracing::info!(
            dsp = topology.dsp_units,
            npu = topology.npu_units,
            "software device online"
        );
        Self {
            topology,
            next_id: AtomicU64::new(1),
            contexts: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
        }
    }

    pub fn topology(&self) -> &SoftTopology {
        &self.topology
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn context(&self, handle: ContextHandle) -> Result<Arc<ContextState>, DriverError> {
        self.contexts
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or(DriverError::InvalidHandle { what: "context" })
    }
}

impl Default for SoftDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorDriver for SoftDriver {
    fn name(&self) -> &str {
        "soft"
    }

    fn unit_count(&self, kind: DeviceKind) -> usize {
        self.topology.unit_count(kind)
    }

    fn frequency_mhz(&self, kind: DeviceKind) -> u64 {
        self.topology.frequency_mhz(kind)
    }

    fn open_context(
        &self,
        kind: DeviceKind,
        units: &[u8],
    ) -> Result<ContextHandle, DriverError> {
        if units.is_empty() {
            return Err(DriverError::NoUnitsRequested);
        }
        let available = self.topology.unit_count(kind);
        for &unit in units {
            if (unit as usize) >= available {
                return Err(DriverError::UnknownDeviceUnit { kind, unit });
            }
        }

        let ctx = Arc::new(ContextState {
            kind,
            heap_capacity_bytes: self.topology.heap_capacity_bytes,
            max_mem_records: self.topology.max_mem_records,
            net: RwLock::new(None),
            queues: units
                .iter()
                .map(|_| QueueSlot {
                    tx: Mutex::new(None),
                    join: Mutex::new(None),
                })
                .collect(),
        });

        let freq = self.topology.frequency_mhz(kind);
        for (queue_index, &unit) in units.iter().enumerate() {
            let (tx, rx) = mpsc::channel::<WorkItem>();
            let worker_ctx = Arc::clone(&ctx);
            let spawned = std::thread::Builder::new()
                .name(format!("soft-{}-q{}", kind.as_str(), unit))
                .spawn(move || {
                    while let Ok(item) = rx.recv() {
                        let cycles = interp::run_kernel(&worker_ctx, item.kernel, &item.args);
                        pace(cycles, freq);
                        item.completion.signal();
                    }
                });
            match spawned {
                Ok(join) => {
                    *ctx.queues[queue_index].tx.lock() = Some(tx);
                    *ctx.queues[queue_index].join.lock() = Some(join);
                }
                Err(source) => {
                    shutdown_context(&ctx);
                    return Err(DriverError::QueueStartFailed { source });
                }
            }
        }

        let id = self.next_id();
        self.contexts.lock().insert(id, ctx);
        tracing::debug!(%kind, units = units.len(), context = id, "context opened");
        Ok(ContextHandle(id))
    }

    fn close_context(&self, context: ContextHandle) -> Result<(), DriverError> {
        let ctx = self
            .contexts
            .lock()
            .remove(&context.0)
            .ok_or(DriverError::InvalidHandle { what: "context" })?;
        shutdown_context(&ctx);
        self.programs.lock().retain(|_, p| p.context != context.0);
        self.kernels.lock().retain(|_, k| k.context != context.0);
        tracing::debug!(context = context.0, "context closed");
        Ok(())
    }

    fn build_program(
        &self,
        context: ContextHandle,
        source: &ProgramSource,
    ) -> Result<ProgramHandle, DriverError> {
        self.context(context)?;
        if let ProgramSource::Binary(image) = source {
            if image.is_empty() {
                return Err(DriverError::ProgramBuildFailed {
                    detail: "empty program image".into(),
                });
            }
            tracing::debug!(bytes = image.len(), "program image accepted verbatim");
        }
        let id = self.next_id();
        self.programs.lock().insert(
            id,
            ProgramState {
                context: context.0,
            },
        );
        Ok(ProgramHandle(id))
    }

    fn create_kernel(
        &self,
        program: ProgramHandle,
        name: &str,
    ) -> Result<KernelHandle, DriverError> {
        let context = self
            .programs
            .lock()
            .get(&program.0)
            .map(|p| p.context)
            .ok_or(DriverError::InvalidHandle { what: "program" })?;
        let canonical = BUILTIN_KERNELS
            .iter()
            .find(|k| **k == name)
            .copied()
            .ok_or_else(|| DriverError::UnknownKernel { name: name.into() })?;

        let id = self.next_id();
        self.kernels.lock().insert(
            id,
            KernelState {
                context,
                name: canonical,
            },
        );
        Ok(KernelHandle(id))
    }

    fn release_kernel(&self, kernel: KernelHandle) -> Result<(), DriverError> {
        self.kernels
            .lock()
            .remove(&kernel.0)
            .map(|_| ())
            .ok_or(DriverError::InvalidHandle { what: "kernel" })
    }

    fn enqueue(
        &self,
        kernel: KernelHandle,
        queue: u8,
        args: Vec<KernelArg>,
    ) -> Result<Completion, DriverError> {
        let (context, name) = {
            let kernels = self.kernels.lock();
            let state = kernels
                .get(&kernel.0)
                .ok_or(DriverError::InvalidHandle { what: "kernel" })?;
            (state.context, state.name)
        };
        let ctx = self.context(ContextHandle(context))?;

        let slot = ctx
            .queues
            .get(queue as usize)
            .ok_or(DriverError::QueueOutOfRange { queue })?;

        // Every built-in reports through a status buffer at argument 0.
        match args.first() {
            Some(KernelArg::Buffer { buffer, .. })
                if buffer.len() >= std::mem::size_of::<DeviceStatus>() => {}
            _ => {
                return Err(DriverError::InvalidKernelArgs {
                    kernel: name.into(),
                    detail: "argument 0 must be a status buffer".into(),
                })
            }
        }

        let completion = Completion::new();
        let item = WorkItem {
            kernel: name,
            args,
            completion: completion.clone(),
        };

        let tx = slot.tx.lock();
        match tx.as_ref() {
            Some(tx) if tx.send(item).is_ok() => Ok(completion),
            _ => Err(DriverError::InvalidHandle { what: "context" }),
        }
    }
}

impl Drop for SoftDriver {
    fn drop(&mut self) {
        let contexts: Vec<_> = self.contexts.lock().drain().map(|(_, c)| c).collect();
        for ctx in contexts {
            shutdown_context(&ctx);
        }
    }
}

/// Stops a context's workers: drop the senders, then join. In-flight
/// calls drain first.
fn shutdown_context(ctx: &ContextState) {
    for slot in &ctx.queues {
        slot.tx.lock().take();
    }
    for slot in &ctx.queues {
        if let Some(join) = slot.join.lock().take() {
            if join.join().is_err() {
                tracing::error!("queue worker panicked during shutdown");
            }
        }
    }
}

/// Sleeps for roughly the simulated duration of a call.
fn pace(cycles: u64, freq_mhz: u64) {
    if freq_mhz == 0 {
        return;
    }
    let micros = (cycles / freq_mhz).min(MAX_PACE_MICROS);
    if micros > 0 {
        std::thread::sleep(std::time::Duration::from_micros(micros));
    }
}
