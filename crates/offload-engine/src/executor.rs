// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Executors: one configured network group on one device class.
//!
//! An [`Executor`] brings a compiled network up on a set of same-class
//! units and hands out one [`ExecutionObject`] per unit, all running the
//! executor's layers group. Construction is all-or-nothing: the
//! descriptor and weights are staged into device-visible memory, the
//! device is configured once for the whole network, and every unit's
//! setup call must succeed before `new` returns. Dropping the executor
//! tears the group down on every unit.
//!
//! A network whose layers are split across several groups takes one
//! executor per group; their execution objects are then chained with an
//! [`ExecutionObjectPipeline`].
//!
//! [`ExecutionObject`]: crate::ExecutionObject
//! [`ExecutionObjectPipeline`]: crate::ExecutionObjectPipeline

use crate::config::Configuration;
use crate::device::{ContextSlot, Device};
use crate::execution_object::{CallType, EoHandle, ExecutionObject};
use crate::{timestamp, EngineError};
use accel_driver::{
    AcceleratorDriver, ArgAccess, DeviceKind, KernelArg, ProgramSource, KERNEL_CONFIGURE,
};
use device_memory::{DevicePool, HostBuffer, PoolStats};
use net_format::{ConfigureParams, DeviceStatus, NetDescriptor, WeightsBlob};
use parking_lot::Mutex;
use std::sync::Arc;

/// One device class configured with a network, exposing an execution
/// object per unit.
pub struct Executor {
    device: Arc<Device>,
    descriptor: Arc<NetDescriptor>,
    pool: DevicePool,
    eos: Vec<EoHandle>,
    group_id: u32,
    // Staged network images; the device may read them for the context's
    // lifetime.
    descriptor_buf: HostBuffer,
    weights_buf: HostBuffer,
}

impl Executor {
    /// Number of usable units of `kind`, zero when the platform has
    /// none.
    pub fn num_devices(driver: &dyn AcceleratorDriver, kind: DeviceKind) -> usize {
        driver.unit_count(kind)
    }

    /// Configures `config`'s network on `units` of `kind` and sets up
    /// `layers_group_id` on every unit.
    pub fn new(
        driver: Arc<dyn AcceleratorDriver>,
        kind: DeviceKind,
        units: &[u8],
        config: &Configuration,
        layers_group_id: u32,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if config.enable_api_timestamps {
            timestamp::enable();
        }

        let available = driver.unit_count(kind);
        if available == 0 {
            return Err(EngineError::device_not_found(
                kind,
                format!("driver '{}' reports no units", driver.name()),
            ));
        }
        if units.is_empty() {
            return Err(EngineError::device_not_found(kind, "no units requested"));
        }
        for &unit in units {
            if unit as usize >= available {
                return Err(EngineError::device_not_found(
                    kind,
                    format!("unit {unit} out of range, {available} available"),
                ));
            }
        }

        let mut descriptor =
            NetDescriptor::read_file(&config.network_file).map_err(EngineError::artifact)?;
        check_input_dims(config, &descriptor)?;

        if config.run_full_net {
            descriptor.force_layers_group(net_format::DEFAULT_LAYERS_GROUP);
        } else {
            let overrides = config.group_overrides()?;
            if !overrides.is_empty() {
                descriptor
                    .apply_group_overrides(&overrides)
                    .map_err(EngineError::artifact)?;
            }
        }
        descriptor.validate().map_err(EngineError::artifact)?;

        if !descriptor.groups().contains(&layers_group_id) {
            return Err(EngineError::config(format!(
                "layers group {layers_group_id} not present in {}",
                config.network_file.display()
            )));
        }

        let weights = WeightsBlob::open(&config.weights_file).map_err(EngineError::artifact)?;
        weights
            .validate_against(&descriptor)
            .map_err(EngineError::artifact)?;

        let pool = DevicePool::new(config.pool_budget()?);
        let descriptor_bytes = descriptor.to_bytes();
        let descriptor_buf = stage(&pool, &descriptor_bytes)?;
        let weights_buf = stage(&pool, weights.as_slice())?;

        let device = Device::open(Arc::clone(&driver), kind, units, &ProgramSource::BuiltIns)?;
        tracing::info!(
            kind = kind.as_str(),
            group_id = layers_group_id,
            net = %descriptor.summary(),
            "bringing network up"
        );

        let descriptor = Arc::new(descriptor);
        configure_device(&device, config, &descriptor, &descriptor_buf, &weights_buf, &pool)?;

        let mut eos = Vec::with_capacity(units.len());
        for queue in 0..units.len() as u8 {
            eos.push(Arc::new(Mutex::new(ExecutionObject::new(
                Arc::clone(&device),
                queue,
                Arc::clone(&descriptor),
                layers_group_id,
                &pool,
                config.enable_layer_trace,
            )?)));
        }

        // Setup runs on every unit before anyone computes; issue the
        // whole batch, then collect.
        for handle in &eos {
            handle.lock().run_async(CallType::Setup)?;
        }
        for handle in &eos {
            handle.lock().wait(CallType::Setup)?;
        }

        tracing::info!(
            kind = kind.as_str(),
            group_id = layers_group_id,
            units = eos.len(),
            "executor ready"
        );

        Ok(Self {
            device,
            descriptor,
            pool,
            eos,
            group_id: layers_group_id,
            descriptor_buf,
            weights_buf,
        })
    }

    pub fn num_execution_objects(&self) -> usize {
        self.eos.len()
    }

    /// Shared handle to the execution object behind unit index `index`.
    pub fn execution_object(&self, index: usize) -> Option<EoHandle> {
        self.eos.get(index).cloned()
    }

    pub fn execution_objects(&self) -> &[EoHandle] {
        &self.eos
    }

    /// The pool frame and pipeline buffers should come from.
    pub fn pool(&self) -> &DevicePool {
        &self.pool
    }

    /// Snapshot of the host pool's allocator metrics.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn descriptor(&self) -> &Arc<NetDescriptor> {
        &self.descriptor
    }

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn kind(&self) -> DeviceKind {
        self.device.kind()
    }

    /// Bytes staged into device-visible memory for the network images.
    pub fn staged_bytes(&self) -> usize {
        self.descriptor_buf.len() + self.weights_buf.len()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        for handle in &self.eos {
            let mut eo = handle.lock();
            if let Err(e) = eo.run_async(CallType::Teardown) {
                tracing::warn!(unit = %eo.device_name(), error = %e, "teardown issue failed");
                continue;
            }
            if let Err(e) = eo.wait(CallType::Teardown) {
                tracing::warn!(unit = %eo.device_name(), error = %e, "teardown failed");
            }
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("kind", &self.device.kind())
            .field("group_id", &self.group_id)
            .field("execution_objects", &self.eos.len())
            .finish()
    }
}

fn check_input_dims(config: &Configuration, descriptor: &NetDescriptor) -> Result<(), EngineError> {
    let configured = [
        (config.input_channels, descriptor.header.input_channels, "channels"),
        (config.input_height, descriptor.header.input_height, "height"),
        (config.input_width, descriptor.header.input_width, "width"),
    ];
    for (wanted, actual, what) in configured {
        if wanted != 0 && wanted != actual {
            return Err(EngineError::config(format!(
                "configured input {what} {wanted} does not match network's {actual}"
            )));
        }
    }
    Ok(())
}

fn stage(pool: &DevicePool, bytes: &[u8]) -> Result<HostBuffer, EngineError> {
    // A net with no parameters has an empty weights image; the device
    // still expects a buffer argument.
    let buffer = pool
        .allocate(bytes.len().max(1))
        .map_err(EngineError::allocation)?;
    buffer.write_at(0, bytes).map_err(EngineError::allocation)?;
    Ok(buffer)
}

/// Runs the one-time whole-network `configure` call and checks the
/// device's verdict.
fn configure_device(
    device: &Arc<Device>,
    config: &Configuration,
    descriptor: &NetDescriptor,
    descriptor_buf: &HostBuffer,
    weights_buf: &HostBuffer,
    pool: &DevicePool,
) -> Result<(), EngineError> {
    let heap_bytes = config
        .param_heap_bytes
        .unwrap_or(descriptor.header.param_heap_bytes);
    let mut params = ConfigureParams::from_header(&descriptor.header, heap_bytes);
    params.quant_history_1 = config.quant_history_1;
    params.quant_history_2 = config.quant_history_2;
    params.quant_margin = config.quant_margin;

    let status = pool
        .allocate(std::mem::size_of::<DeviceStatus>())
        .map_err(EngineError::allocation)?;
    let mut kernel = device.create_kernel(
        KERNEL_CONFIGURE,
        0,
        vec![
            KernelArg::buffer(status.clone(), ArgAccess::ReadWrite),
            KernelArg::buffer(descriptor_buf.clone(), ArgAccess::ReadOnly),
            KernelArg::buffer(weights_buf.clone(), ArgAccess::ReadOnly),
            KernelArg::scalar(&params),
        ],
    )?;
    kernel.run_async(ContextSlot::C0)?;
    kernel.wait(ContextSlot::C0)?;

    let mut raw = [0u8; std::mem::size_of::<DeviceStatus>()];
    status.read_at(0, &mut raw).map_err(EngineError::allocation)?;
    let verdict = *bytemuck::from_bytes::<DeviceStatus>(&raw);
    if !verdict.is_success() {
        return Err(EngineError::device_reported(verdict.error(), "configure"));
    }
    tracing::debug!(
        heap_bytes,
        heap_used = verdict.heap_used_bytes,
        "network configured"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_driver::{SoftDriver, SoftTopology};
    use net_format::NetManifest;
    use std::path::Path;

    fn soft_driver() -> Arc<dyn AcceleratorDriver> {
        Arc::new(SoftDriver::with_topology(SoftTopology {
            dsp_units: 2,
            npu_units: 2,
            ..Default::default()
        }))
    }

    fn write_net(dir: &Path, manifest: NetManifest) -> Configuration {
        let (descriptor, weights) = manifest.build().unwrap();
        let network_file = dir.join("net.bin");
        let weights_file = dir.join("net.params");
        descriptor.write_file(&network_file).unwrap();
        std::fs::write(&weights_file, &weights).unwrap();
        Configuration {
            network_file,
            weights_file,
            ..Default::default()
        }
    }

    #[test]
    fn test_num_devices_matches_topology() {
        let driver = soft_driver();
        assert_eq!(Executor::num_devices(driver.as_ref(), DeviceKind::Dsp), 2);
        assert_eq!(Executor::num_devices(driver.as_ref(), DeviceKind::Npu), 2);

        let none: Arc<dyn AcceleratorDriver> = Arc::new(SoftDriver::with_topology(SoftTopology::none()));
        assert_eq!(Executor::num_devices(none.as_ref(), DeviceKind::Npu), 0);
    }

    #[test]
    fn test_bring_up_and_frame() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_net(dir.path(), NetManifest::identity_chain("t", 2, 4, 4, 1));

        let executor = Executor::new(
            soft_driver(),
            DeviceKind::Npu,
            &[0, 1],
            &config,
            net_format::DEFAULT_LAYERS_GROUP,
        )
        .unwrap();
        assert_eq!(executor.num_execution_objects(), 2);
        assert!(executor.staged_bytes() > 0);

        let handle = executor.execution_object(0).unwrap();
        let mut eo = handle.lock();
        eo.input_buffer().fill(4);
        eo.process_frame_start_async().unwrap();
        assert!(eo.process_frame_wait().unwrap());
        assert_eq!(eo.output_buffer().to_vec(), vec![4u8; 16]);
    }

    #[test]
    fn test_no_units_is_device_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_net(dir.path(), NetManifest::identity_chain("t", 1, 4, 4, 1));

        let none: Arc<dyn AcceleratorDriver> = Arc::new(SoftDriver::with_topology(SoftTopology::none()));
        let err = Executor::new(none, DeviceKind::Dsp, &[0], &config, 1).unwrap_err();
        assert!(matches!(err, EngineError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_unit_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_net(dir.path(), NetManifest::identity_chain("t", 1, 4, 4, 1));

        let err =
            Executor::new(soft_driver(), DeviceKind::Dsp, &[5], &config, 1).unwrap_err();
        assert!(matches!(err, EngineError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_unknown_group_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_net(dir.path(), NetManifest::identity_chain("t", 2, 4, 4, 1));

        let err = Executor::new(soft_driver(), DeviceKind::Npu, &[0], &config, 7).unwrap_err();
        assert!(matches!(err, EngineError::ConfigError { .. }));
    }

    #[test]
    fn test_input_dims_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_net(dir.path(), NetManifest::identity_chain("t", 1, 4, 4, 1));
        config.input_height = 8;

        let err = Executor::new(soft_driver(), DeviceKind::Npu, &[0], &config, 1).unwrap_err();
        assert!(matches!(err, EngineError::ConfigError { .. }));
    }

    #[test]
    fn test_run_full_net_collapses_groups() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_net(
            dir.path(),
            NetManifest::identity_chain("t", 2, 4, 4, 1).with_groups(&[1, 2]),
        );
        config.run_full_net = true;

        // Group 2 no longer exists once the net is collapsed.
        let err = Executor::new(soft_driver(), DeviceKind::Npu, &[0], &config, 2).unwrap_err();
        assert!(matches!(err, EngineError::ConfigError { .. }));

        let executor = Executor::new(
            soft_driver(),
            DeviceKind::Npu,
            &[0],
            &config,
            net_format::DEFAULT_LAYERS_GROUP,
        )
        .unwrap();
        let handle = executor.execution_object(0).unwrap();
        // Both layers ran in a single group's compute.
        assert_eq!(handle.lock().input_size_bytes(), 16);
        assert_eq!(handle.lock().output_size_bytes(), 16);
    }

    #[test]
    fn test_group_override_moves_layer() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_net(dir.path(), NetManifest::identity_chain("t", 2, 4, 4, 1));
        // Move the second compute layer (descriptor index 2, after the
        // data layer) to its own group.
        config.layer_groups.insert("2".into(), 2);

        let executor = Executor::new(
            soft_driver(),
            DeviceKind::Npu,
            &[0],
            &config,
            2,
        )
        .unwrap();
        assert_eq!(executor.descriptor().groups(), vec![1, 2]);
        assert_eq!(executor.group_id(), 2);
    }

    #[test]
    fn test_configure_failure_reports_device_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_net(dir.path(), NetManifest::identity_chain("t", 1, 4, 4, 1));
        // A heap far beyond the soft topology's capacity.
        config.param_heap_bytes = Some(u32::MAX);

        let err = Executor::new(soft_driver(), DeviceKind::Dsp, &[0], &config, 1).unwrap_err();
        match err {
            EngineError::DeviceReported { code, call, .. } => {
                assert_eq!(call, "configure");
                assert!(!code.is_success());
            }
            other => panic!("expected device error, got {other}"),
        }
    }

    #[test]
    fn test_missing_network_file() {
        let config = Configuration {
            network_file: "/nonexistent/net.bin".into(),
            weights_file: "/nonexistent/net.params".into(),
            ..Default::default()
        };
        let err = Executor::new(soft_driver(), DeviceKind::Npu, &[0], &config, 1).unwrap_err();
        assert!(matches!(err, EngineError::ArtifactError { .. }));
    }
}
