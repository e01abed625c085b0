// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Device and kernel wrappers over the raw accelerator driver.
//!
//! A [`Device`] owns one driver context spanning a set of same-class
//! units, with the network program built on it and one in-order queue
//! per unit. A [`Kernel`] is a named entry of that program bound to one
//! queue, carrying its argument list and a small fixed array of
//! completion slots so the same kernel can have several calls in flight
//! at once.

use crate::EngineError;
use accel_driver::{
    AcceleratorDriver, ArgAccess, Completion, ContextHandle, DeviceKind, KernelArg, KernelHandle,
    ProgramSource,
};
use device_memory::HostBuffer;
use std::fmt;
use std::sync::Arc;

// ── Context slots ──────────────────────────────────────────────────────

/// Index into a kernel's completion-slot array.
///
/// Callers pick a slot per in-flight call and pass the same slot to the
/// matching wait. Four slots cover the deepest pipelining the engine
/// produces (double buffering on both sides of a shared stage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextSlot {
    C0,
    C1,
    C2,
    C3,
}

impl ContextSlot {
    pub const COUNT: usize = 4;
    pub const ALL: [ContextSlot; Self::COUNT] =
        [Self::C0, Self::C1, Self::C2, Self::C3];

    pub fn index(self) -> usize {
        match self {
            Self::C0 => 0,
            Self::C1 => 1,
            Self::C2 => 2,
            Self::C3 => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for ContextSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.index())
    }
}

// ── Device ─────────────────────────────────────────────────────────────

/// One open accelerator context: a set of same-class units, the program
/// built for them, and a queue per unit.
pub struct Device {
    driver: Arc<dyn AcceleratorDriver>,
    kind: DeviceKind,
    context: ContextHandle,
    program: accel_driver::ProgramHandle,
    unit_ids: Vec<u8>,
    frequency_mhz: u64,
}

impl Device {
    /// Opens a context over `units` and builds `source` on it.
    pub fn open(
        driver: Arc<dyn AcceleratorDriver>,
        kind: DeviceKind,
        units: &[u8],
        source: &ProgramSource,
    ) -> Result<Arc<Self>, EngineError> {
        let context = driver
            .open_context(kind, units)
            .map_err(EngineError::driver)?;

        let program = match driver.build_program(context, source) {
            Ok(program) => program,
            Err(e) => {
                // The context is useless without its program.
                if let Err(close_err) = driver.close_context(context) {
                    tracing::warn!(error = %close_err, "context close after failed build");
                }
                return Err(EngineError::program_build(e.to_string()));
            }
        };

        let frequency_mhz = driver.frequency_mhz(kind);
        tracing::info!(
            kind = kind.as_str(),
            units = ?units,
            frequency_mhz,
            "device context open"
        );

        Ok(Arc::new(Self {
            driver,
            kind,
            context,
            program,
            unit_ids: units.to_vec(),
            frequency_mhz,
        }))
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Number of units (and therefore queues) in this context.
    pub fn num_units(&self) -> usize {
        self.unit_ids.len()
    }

    /// Platform unit id behind queue `queue`.
    pub fn unit_id(&self, queue: u8) -> Option<u8> {
        self.unit_ids.get(queue as usize).copied()
    }

    pub fn frequency_mhz(&self) -> u64 {
        self.frequency_mhz
    }

    /// Short name of the unit behind a queue, e.g. `dsp1`.
    pub fn unit_name(&self, queue: u8) -> String {
        match self.unit_id(queue) {
            Some(unit) => format!("{}{}", self.kind.as_str(), unit),
            None => format!("{}?", self.kind.as_str()),
        }
    }

    /// Creates a kernel bound to one queue of this context.
    pub fn create_kernel(
        self: &Arc<Self>,
        name: &'static str,
        queue: u8,
        args: Vec<KernelArg>,
    ) -> Result<Kernel, EngineError> {
        let handle = self
            .driver
            .create_kernel(self.program, name)
            .map_err(|_| EngineError::kernel_not_found(name))?;
        Ok(Kernel {
            device: Arc::clone(self),
            handle,
            name,
            queue,
            args,
            slots: Default::default(),
        })
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.driver.close_context(self.context) {
            tracing::warn!(kind = self.kind.as_str(), error = %e, "context close failed");
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind)
            .field("units", &self.unit_ids)
            .field("frequency_mhz", &self.frequency_mhz)
            .finish()
    }
}

// ── Kernel ─────────────────────────────────────────────────────────────

/// A named program entry with bound arguments and per-call completion
/// slots.
///
/// `run_async` snapshots the current arguments, so rebinding them after
/// a call is issued never affects that call. Waiting on a slot that has
/// no call in flight reports `Ok(false)` rather than an error; the
/// higher layers use that to make wait-before-start a no-op.
pub struct Kernel {
    device: Arc<Device>,
    handle: KernelHandle,
    name: &'static str,
    queue: u8,
    args: Vec<KernelArg>,
    slots: [Option<Completion>; ContextSlot::COUNT],
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn queue(&self) -> u8 {
        self.queue
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Replaces one bound argument.
    pub fn set_arg(&mut self, index: usize, arg: KernelArg) -> Result<(), EngineError> {
        let len = self.args.len();
        match self.args.get_mut(index) {
            Some(slot) => {
                *slot = arg;
                Ok(())
            }
            None => Err(EngineError::config(format!(
                "kernel '{}' has {len} args, index {index} out of range",
                self.name
            ))),
        }
    }

    /// Convenience for the common buffer-argument case.
    pub fn set_buffer_arg(
        &mut self,
        index: usize,
        buffer: HostBuffer,
        access: ArgAccess,
    ) -> Result<(), EngineError> {
        self.set_arg(index, KernelArg::buffer(buffer, access))
    }

    pub fn slot_in_flight(&self, slot: ContextSlot) -> bool {
        self.slots[slot.index()].is_some()
    }

    /// Issues one call of this kernel on its queue, tracked in `slot`.
    ///
    /// The slot must be free; reusing a slot whose call has not been
    /// waited for would lose its completion.
    pub fn run_async(&mut self, slot: ContextSlot) -> Result<(), EngineError> {
        if self.slot_in_flight(slot) {
            return Err(EngineError::slots_exhausted());
        }
        let completion = self
            .device
            .driver
            .enqueue(self.handle, self.queue, self.args.clone())
            .map_err(EngineError::driver)?;
        self.slots[slot.index()] = Some(completion);
        Ok(())
    }

    /// Blocks until the call in `slot` finishes. Returns `Ok(false)`
    /// when the slot has no call in flight.
    pub fn wait(&mut self, slot: ContextSlot) -> Result<bool, EngineError> {
        match self.slots[slot.index()].take() {
            Some(completion) => {
                completion.wait();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Registers `callback` to run when the call in `slot` finishes
    /// (immediately, if it already has). Returns `false` when the slot
    /// has no call in flight; the slot stays occupied either way until
    /// it is waited on.
    pub fn add_callback(
        &self,
        slot: ContextSlot,
        callback: impl FnOnce() + Send + 'static,
    ) -> bool {
        match &self.slots[slot.index()] {
            Some(completion) => {
                completion.on_complete(callback);
                true
            }
            None => false,
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        // Outstanding calls keep running; only the handle is released.
        if let Err(e) = self.device.driver.release_kernel(self.handle) {
            tracing::debug!(kernel = self.name, error = %e, "kernel release failed");
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self.slots.iter().filter(|s| s.is_some()).count();
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("args", &self.args.len())
            .field("in_flight", &in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_driver::{SoftDriver, SoftTopology, KERNEL_SETUP};

    fn small_driver() -> Arc<dyn AcceleratorDriver> {
        Arc::new(SoftDriver::with_topology(SoftTopology {
            dsp_units: 1,
            npu_units: 1,
            ..Default::default()
        }))
    }

    fn status_arg() -> KernelArg {
        let status = HostBuffer::from_vec(vec![0u8; 16]);
        KernelArg::buffer(status, ArgAccess::ReadWrite)
    }

    #[test]
    fn test_slot_indices() {
        for (i, slot) in ContextSlot::ALL.iter().enumerate() {
            assert_eq!(slot.index(), i);
            assert_eq!(ContextSlot::from_index(i), Some(*slot));
        }
        assert_eq!(ContextSlot::from_index(4), None);
        assert_eq!(ContextSlot::C2.to_string(), "C2");
    }

    #[test]
    fn test_open_and_unit_names() {
        let device = Device::open(
            small_driver(),
            DeviceKind::Dsp,
            &[0],
            &ProgramSource::BuiltIns,
        )
        .unwrap();
        assert_eq!(device.num_units(), 1);
        assert_eq!(device.unit_name(0), "dsp0");
        assert_eq!(device.unit_name(5), "dsp?");
        assert!(device.frequency_mhz() > 0);
    }

    #[test]
    fn test_wait_on_empty_slot_is_false() {
        let device = Device::open(
            small_driver(),
            DeviceKind::Npu,
            &[0],
            &ProgramSource::BuiltIns,
        )
        .unwrap();
        let mut kernel = device
            .create_kernel(KERNEL_SETUP, 0, vec![status_arg(), KernelArg::scalar_u32(1)])
            .unwrap();
        assert!(!kernel.wait(ContextSlot::C0).unwrap());
    }

    #[test]
    fn test_run_wait_and_slot_reuse() {
        let device = Device::open(
            small_driver(),
            DeviceKind::Npu,
            &[0],
            &ProgramSource::BuiltIns,
        )
        .unwrap();
        // Teardown with no configured net succeeds on the soft driver.
        let mut kernel = device
            .create_kernel(
                accel_driver::KERNEL_TEARDOWN,
                0,
                vec![status_arg(), KernelArg::scalar_u32(1)],
            )
            .unwrap();

        kernel.run_async(ContextSlot::C1).unwrap();
        assert!(kernel.slot_in_flight(ContextSlot::C1));
        assert!(matches!(
            kernel.run_async(ContextSlot::C1),
            Err(EngineError::ContextSlotsExhausted { .. })
        ));
        assert!(kernel.wait(ContextSlot::C1).unwrap());
        assert!(!kernel.slot_in_flight(ContextSlot::C1));

        // Slot is reusable after the wait.
        kernel.run_async(ContextSlot::C1).unwrap();
        assert!(kernel.wait(ContextSlot::C1).unwrap());
    }

    #[test]
    fn test_callback_fires() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let device = Device::open(
            small_driver(),
            DeviceKind::Dsp,
            &[0],
            &ProgramSource::BuiltIns,
        )
        .unwrap();
        let mut kernel = device
            .create_kernel(
                accel_driver::KERNEL_TEARDOWN,
                0,
                vec![status_arg(), KernelArg::scalar_u32(1)],
            )
            .unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        assert!(!kernel.add_callback(ContextSlot::C0, || {}));

        kernel.run_async(ContextSlot::C0).unwrap();
        let fired2 = Arc::clone(&fired);
        assert!(kernel.add_callback(ContextSlot::C0, move || {
            fired2.store(true, Ordering::SeqCst);
        }));
        kernel.wait(ContextSlot::C0).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_set_arg_out_of_range() {
        let device = Device::open(
            small_driver(),
            DeviceKind::Dsp,
            &[0],
            &ProgramSource::BuiltIns,
        )
        .unwrap();
        let mut kernel = device
            .create_kernel(KERNEL_SETUP, 0, vec![status_arg(), KernelArg::scalar_u32(1)])
            .unwrap();
        assert!(kernel.set_arg(2, KernelArg::scalar_u32(9)).is_err());
        kernel.set_arg(1, KernelArg::scalar_u32(2)).unwrap();
    }
}
