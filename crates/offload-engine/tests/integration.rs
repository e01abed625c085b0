// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Integration tests: executors, pipelines and the frame loop end to end.
//!
//! These tests bring networks up through the full stack (manifest →
//! descriptor file → executor → execution objects → pipelines) on the
//! software driver, and drive the same steady-state loops an application
//! would.

use net_format::{NetManifest, DEFAULT_LAYERS_GROUP};
use offload_engine::{
    api_version, AcceleratorDriver, Configuration, DeviceKind, EngineError,
    ExecutionObjectPipeline, Executor, SoftDriver, SoftTopology,
};
use std::path::Path;
use std::sync::Arc;

// ── Helpers ────────────────────────────────────────────────────

fn soft_driver(dsp_units: u8, npu_units: u8) -> Arc<dyn AcceleratorDriver> {
    Arc::new(SoftDriver::with_topology(SoftTopology {
        dsp_units: dsp_units.into(),
        npu_units: npu_units.into(),
        ..Default::default()
    }))
}

/// Writes a manifest's artifacts into `dir` and points a fresh
/// configuration at them.
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

fn frame_pattern(frame: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (frame as usize * 31 + i * 7) as u8).collect()
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

// ── Executor construction ──────────────────────────────────────

#[test]
fn test_executor_yields_one_eo_per_unit() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_net(dir.path(), NetManifest::identity_chain("id", 2, 8, 8, 1));

    for units in [&[0u8][..], &[0, 1][..]] {
        let executor = Executor::new(
            soft_driver(2, 2),
            DeviceKind::Dsp,
            units,
            &config,
            DEFAULT_LAYERS_GROUP,
        )
        .unwrap();
        assert_eq!(executor.num_execution_objects(), units.len());
        assert!(executor.execution_object(units.len()).is_none());
    }
}

#[test]
fn test_failed_setup_never_yields_an_executor() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = write_net(dir.path(), NetManifest::identity_chain("id", 2, 8, 8, 1));
    // Enough heap to pass configure, too little for the group's layer
    // parameters at setup.
    config.param_heap_bytes = Some(1040);

    let err = Executor::new(
        soft_driver(1, 1),
        DeviceKind::Dsp,
        &[0],
        &config,
        DEFAULT_LAYERS_GROUP,
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::DeviceReported { .. }));
}

#[test]
fn test_num_devices_is_zero_on_bare_platform() {
    let bare: Arc<dyn AcceleratorDriver> = Arc::new(SoftDriver::with_topology(SoftTopology::none()));
    assert_eq!(Executor::num_devices(bare.as_ref(), DeviceKind::Dsp), 0);
    assert_eq!(Executor::num_devices(bare.as_ref(), DeviceKind::Npu), 0);
}

// ── Wait-before-start ──────────────────────────────────────────

#[test]
fn test_wait_without_start_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_net(dir.path(), NetManifest::identity_chain("id", 1, 4, 4, 1));
    let executor = Executor::new(
        soft_driver(1, 1),
        DeviceKind::Npu,
        &[0],
        &config,
        DEFAULT_LAYERS_GROUP,
    )
    .unwrap();

    let handle = executor.execution_object(0).unwrap();
    {
        let mut eo = handle.lock();
        assert!(!eo.process_frame_wait().unwrap());
        assert!(!eo.process_frame_wait().unwrap());
    }

    let mut eop = ExecutionObjectPipeline::new(vec![handle], executor.pool()).unwrap();
    assert!(!eop.process_frame_wait().unwrap());

    // The no-op waits left everything usable.
    eop.input_buffer().fill(1);
    eop.process_frame_start_async().unwrap();
    assert!(eop.process_frame_wait().unwrap());
    assert_eq!(eop.output_buffer().to_vec(), vec![1u8; 16]);
}

// ── Frame round trips ──────────────────────────────────────────

#[test]
fn test_identity_round_trip_through_executor() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_net(dir.path(), NetManifest::identity_chain("id", 3, 16, 16, 1));
    let executor = Executor::new(
        soft_driver(1, 1),
        DeviceKind::Npu,
        &[0],
        &config,
        DEFAULT_LAYERS_GROUP,
    )
    .unwrap();

    let handle = executor.execution_object(0).unwrap();
    let mut eo = handle.lock();
    let pattern = frame_pattern(0, eo.input_size_bytes());
    eo.input_buffer().write().copy_from_slice(&pattern);
    eo.process_frame_start_async().unwrap();
    assert!(eo.process_frame_wait().unwrap());
    assert_eq!(eo.output_buffer().to_vec(), pattern);
    assert!(eo.process_cycles() > 0);
}

#[test]
fn test_two_class_chain_aggregates_stage_times() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = NetManifest::classifier("clf", 8, 8, 1, 10).with_groups(&[1, 2]);
    let config = write_net(dir.path(), manifest);

    let driver = soft_driver(1, 1);
    let front = Executor::new(Arc::clone(&driver), DeviceKind::Npu, &[0], &config, 1).unwrap();
    let back = Executor::new(Arc::clone(&driver), DeviceKind::Dsp, &[0], &config, 2).unwrap();

    let mut eop = ExecutionObjectPipeline::new(
        vec![
            front.execution_object(0).unwrap(),
            back.execution_object(0).unwrap(),
        ],
        front.pool(),
    )
    .unwrap();
    assert_eq!(eop.input_size_bytes(), 64);
    assert_eq!(eop.output_size_bytes(), 10);
    assert_eq!(eop.device_name(), "npu0+dsp0");

    eop.input_buffer().fill(128);
    eop.process_frame_start_async().unwrap();
    assert!(eop.process_frame_wait().unwrap());

    // The chain's wait exposes the final stage's output.
    let direct = {
        let full = Executor::new(
            soft_driver(1, 1),
            DeviceKind::Npu,
            &[0],
            &{
                let mut c = config.clone();
                c.run_full_net = true;
                c
            },
            DEFAULT_LAYERS_GROUP,
        )
        .unwrap();
        let handle = full.execution_object(0).unwrap();
        let mut eo = handle.lock();
        eo.input_buffer().fill(128);
        eo.process_frame_start_async().unwrap();
        eo.process_frame_wait().unwrap();
        eo.output_buffer().to_vec()
    };
    assert_eq!(eop.output_buffer().to_vec(), direct);

    let total = eop.process_time_ms();
    let max_stage = eop
        .stage_times_ms()
        .iter()
        .fold(0.0f64, |a, &b| a.max(b));
    assert!(total >= max_stage);
    let sum: f64 = eop.stage_times_ms().iter().sum();
    assert!((total - sum).abs() < f64::EPSILON);
}

// ── Double-buffered steady state ───────────────────────────────

#[test]
fn test_double_buffered_loop_emits_every_frame_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_net(dir.path(), NetManifest::identity_chain("id", 1, 4, 4, 1));
    let executor = Executor::new(
        soft_driver(1, 2),
        DeviceKind::Npu,
        &[0, 1],
        &config,
        DEFAULT_LAYERS_GROUP,
    )
    .unwrap();

    // Two units, buffer factor two: four pipelines, pairs sharing a
    // unit's execution object.
    let buffer_factor = 2;
    let mut eops = Vec::new();
    for i in 0..executor.num_execution_objects() * buffer_factor {
        let eo = executor
            .execution_object(i % executor.num_execution_objects())
            .unwrap();
        eops.push(ExecutionObjectPipeline::new(vec![eo], executor.pool()).unwrap());
    }
    let num_eops = eops.len();
    assert_eq!(num_eops, 4);

    let num_frames = 8usize;
    let frame_bytes = eops[0].input_size_bytes();
    let mut emitted = Vec::new();

    for i in 0..num_frames + num_eops {
        let eop = &mut eops[i % num_eops];

        if eop.process_frame_wait().unwrap() {
            let frame = eop.frame_index();
            assert_eq!(
                eop.output_buffer().to_vec(),
                frame_pattern(frame, frame_bytes),
                "frame {frame} came back corrupted"
            );
            emitted.push(frame);
        }

        if i < num_frames {
            let frame = i as u32;
            eop.set_frame_index(frame);
            eop.input_buffer()
                .write()
                .copy_from_slice(&frame_pattern(frame, frame_bytes));
            eop.process_frame_start_async().unwrap();
        }
    }

    let expected: Vec<u32> = (0..num_frames as u32).collect();
    assert_eq!(emitted, expected);
}

// ── Classifier scenario ────────────────────────────────────────

#[test]
fn test_classifier_28x28_to_10_classes() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_net(dir.path(), NetManifest::classifier("mnist", 28, 28, 1, 10));
    let executor = Executor::new(
        soft_driver(1, 1),
        DeviceKind::Npu,
        &[0],
        &config,
        DEFAULT_LAYERS_GROUP,
    )
    .unwrap();

    let handle = executor.execution_object(0).unwrap();
    let mut eo = handle.lock();
    assert_eq!(eo.input_size_bytes(), 28 * 28);
    assert_eq!(eo.output_size_bytes(), 10);

    // All-zero frame: the output is still a well-formed score vector.
    eo.input_buffer().fill(0);
    eo.process_frame_start_async().unwrap();
    assert!(eo.process_frame_wait().unwrap());
    let scores = eo.output_buffer().to_vec();
    assert_eq!(scores.len(), 10);
    let winner = argmax(&scores);
    assert!(winner < 10);
    assert!(scores.iter().all(|&s| s <= scores[winner]));

    // Same frame twice: scores are deterministic.
    eo.input_buffer().fill(200);
    eo.process_frame_start_async().unwrap();
    assert!(eo.process_frame_wait().unwrap());
    let first = eo.output_buffer().to_vec();
    eo.process_frame_start_async().unwrap();
    assert!(eo.process_frame_wait().unwrap());
    assert_eq!(eo.output_buffer().to_vec(), first);
}

// ── Layer trace and timestamps ─────────────────────────────────

#[test]
fn test_layer_trace_via_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = write_net(dir.path(), NetManifest::identity_chain("id", 2, 4, 4, 1));
    config.enable_layer_trace = true;

    let executor = Executor::new(
        soft_driver(1, 1),
        DeviceKind::Npu,
        &[0],
        &config,
        DEFAULT_LAYERS_GROUP,
    )
    .unwrap();
    let handle = executor.execution_object(0).unwrap();
    let mut eo = handle.lock();

    eo.input_buffer().fill(6);
    eo.process_frame_start_async().unwrap();
    assert!(eo.process_frame_wait().unwrap());

    let outputs = eo.layer_outputs().unwrap();
    assert_eq!(outputs.len(), 2);
    for out in &outputs {
        assert_eq!(out.dims.byte_len(), 16);
        assert_eq!(out.bytes, vec![6u8; 16]);
    }

    let trace_dir = dir.path().join("trace");
    assert_eq!(eo.write_layer_outputs_to_files(&trace_dir).unwrap(), 2);
}

#[test]
fn test_api_timestamps_written_as_csv() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = write_net(dir.path(), NetManifest::identity_chain("id", 1, 4, 4, 1));
    config.enable_api_timestamps = true;

    let executor = Executor::new(
        soft_driver(1, 1),
        DeviceKind::Npu,
        &[0],
        &config,
        DEFAULT_LAYERS_GROUP,
    )
    .unwrap();
    let mut eop = ExecutionObjectPipeline::new(
        vec![executor.execution_object(0).unwrap()],
        executor.pool(),
    )
    .unwrap();

    eop.set_frame_index(2);
    eop.input_buffer().fill(1);
    eop.process_frame_start_async().unwrap();
    assert!(eop.process_frame_wait().unwrap());

    let csv = dir.path().join("stamps.csv");
    offload_engine::timestamp::write_csv(&csv).unwrap();
    let text = std::fs::read_to_string(&csv).unwrap();
    assert!(text.contains("2,eop:PFSA:Start,"));
    assert!(text.contains("2,eop:PFW:End,"));
    assert!(text.lines().any(|l| l.contains("eo1:PFSA:")));
}

// ── Version string ─────────────────────────────────────────────

#[test]
fn test_api_version_shape() {
    let version = api_version();
    assert_eq!(version.split('.').count(), 4);
    assert!(version.starts_with("1.3.0."));
}
