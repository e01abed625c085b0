// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Kernel interpreter of the software device.
//!
//! Queue workers call into here to run one kernel call against a
//! context's network state. Outcomes are reported exclusively through
//! the status buffer every built-in kernel takes as argument 0; the
//! return value is the cycle count, which the worker also uses to pace
//! the call like a real core would.
//!
//! # Built-in kernel ABI
//! ```text
//! configure(status RW, descriptor RO, weights RO, ConfigureParams)
//! setup    (status RW, group_id: u32 [, l1 scratch])
//! process  (status RW, input RO, output WO, [trace WO,] ProcessParams, group_id: u32)
//! teardown (status RW, group_id: u32)
//! ```
//!
//! A network whose descriptor declares L1 scratch demands a local
//! reservation of at least that size on every `setup` call.

use crate::soft::{ContextState, NetState};
use crate::types::{
    KernelArg, KERNEL_CONFIGURE, KERNEL_PROCESS, KERNEL_SETUP, KERNEL_TEARDOWN,
};
use crate::DeviceKind;
use device_memory::HostBuffer;
use net_format::{
    ConfigureParams, DeviceErrorCode, DeviceStatus, FormatError, LayerKind, LayerRecord,
    NetDescriptor, ProcessParams, DENSE_ACCUM_SHIFT, DESCRIPTOR_ABI_VERSION,
};
use std::collections::HashSet;

// Synthetic cost model, in device cycles.
const CONFIGURE_BASE_CYCLES: u64 = 24_000;
const CONFIGURE_PER_LAYER_CYCLES: u64 = 1_500;
const SETUP_BASE_CYCLES: u64 = 9_000;
const SETUP_PER_LAYER_CYCLES: u64 = 3_000;
const PROCESS_BASE_CYCLES: u64 = 2_000;
const TEARDOWN_BASE_CYCLES: u64 = 1_200;

/// Heap bytes the device reserves for its own network tables.
const DEVICE_HEAP_OVERHEAD_BYTES: u32 = 1_024;
/// Memory records the network tables themselves occupy.
const NET_TABLE_MEM_RECORDS: usize = 4;
/// Memory records each layer of a group occupies once set up.
const MEM_RECORDS_PER_LAYER: usize = 2;

/// Runs one kernel call. Returns the cycles charged to the call.
pub(crate) fn run_kernel(ctx: &ContextState, kernel: &'static str, args: &[KernelArg]) -> u64 {
    let Some(status) = buffer_arg(args, 0) else {
        // Enqueue pre-checks make this unreachable for built-ins.
        tracing::error!(kernel, "kernel call without status buffer");
        return 0;
    };

    let (code, heap_used, cycles) = match kernel {
        KERNEL_CONFIGURE => run_configure(ctx, args),
        KERNEL_SETUP => run_setup(ctx, args),
        KERNEL_PROCESS => run_process(ctx, args),
        KERNEL_TEARDOWN => run_teardown(ctx, args),
        other => {
            tracing::error!(kernel = other, "unknown kernel reached the device");
            (DeviceErrorCode::GeneralFailure, 0, 0)
        }
    };

    if !code.is_success() {
        tracing::debug!(kernel, %code, "kernel call failed on device");
    }
    write_status(status, code, heap_used, cycles);
    cycles
}

fn run_configure(ctx: &ContextState, args: &[KernelArg]) -> (DeviceErrorCode, u32, u64) {
    let Some(params) = scalar_arg::<ConfigureParams>(args, 3) else {
        return (DeviceErrorCode::CreateParamsMismatch, 0, 0);
    };

    if params.header_bytes as usize != std::mem::size_of::<net_format::DescriptorHeader>()
        || params.record_bytes as usize != std::mem::size_of::<LayerRecord>()
        || params.abi_version != DESCRIPTOR_ABI_VERSION
    {
        return (DeviceErrorCode::CreateParamsMismatch, 0, 0);
    }

    let (Some(descriptor_buf), Some(weights)) = (buffer_arg(args, 1), buffer_arg(args, 2)) else {
        return (DeviceErrorCode::GeneralFailure, 0, 0);
    };

    let descriptor = {
        let guard = descriptor_buf.read();
        match NetDescriptor::from_bytes(&guard) {
            Ok(d) => d,
            Err(FormatError::AbiMismatch { .. }) | Err(FormatError::LayoutMismatch { .. }) => {
                return (DeviceErrorCode::CreateParamsMismatch, 0, 0);
            }
            Err(_) => return (DeviceErrorCode::GeneralFailure, 0, 0),
        }
    };

    // Every weight range must land inside the staged blob.
    let blob_len = weights.len();
    for layer in &descriptor.layers {
        let end = layer.weight_offset as usize + layer.weight_bytes as usize;
        if end > blob_len {
            return (DeviceErrorCode::GeneralFailure, 0, 0);
        }
    }

    if params.heap_bytes == 0
        || params.heap_bytes > ctx.heap_capacity_bytes
        || params.heap_bytes < DEVICE_HEAP_OVERHEAD_BYTES
    {
        return (DeviceErrorCode::HeapAllocFailure, 0, 0);
    }
    if NET_TABLE_MEM_RECORDS > ctx.max_mem_records {
        return (DeviceErrorCode::MemRecAllocFailure, 0, 0);
    }

    let cycles =
        CONFIGURE_BASE_CYCLES + CONFIGURE_PER_LAYER_CYCLES * descriptor.layers.len() as u64;
    let state = NetState {
        descriptor,
        weights: weights.clone(),
        heap_capacity: params.heap_bytes,
        heap_used: DEVICE_HEAP_OVERHEAD_BYTES,
        mem_records: NET_TABLE_MEM_RECORDS,
        ready_groups: HashSet::new(),
    };
    let heap_used = state.heap_used;

    let mut net = ctx.net.write();
    if net.is_some() {
        tracing::debug!("reconfigure replaces existing network state");
    }
    *net = Some(state);

    (DeviceErrorCode::Success, heap_used, cycles)
}

fn run_setup(ctx: &ContextState, args: &[KernelArg]) -> (DeviceErrorCode, u32, u64) {
    let Some(group_id) = scalar_arg::<u32>(args, 1) else {
        return (DeviceErrorCode::GeneralFailure, 0, 0);
    };

    let mut net = ctx.net.write();
    let Some(net) = net.as_mut() else {
        return (DeviceErrorCode::GeneralFailure, 0, 0);
    };

    let layers: Vec<&LayerRecord> = net
        .descriptor
        .layers
        .iter()
        .filter(|l| l.group_id == group_id)
        .collect();
    if layers.is_empty() {
        return (DeviceErrorCode::GeneralFailure, net.heap_used, 0);
    }
    if net.ready_groups.contains(&group_id) {
        tracing::debug!(group_id, "group already set up");
        return (DeviceErrorCode::Success, net.heap_used, SETUP_BASE_CYCLES);
    }

    let scratch_l1 = net.descriptor.header.scratch_l1_bytes;
    if scratch_l1 > 0 {
        match local_arg_bytes(args) {
            Some(bytes) if bytes >= scratch_l1 as usize => {}
            _ => return (DeviceErrorCode::GeneralFailure, net.heap_used, 0),
        }
    }

    let heap_needed: u32 = layers.iter().map(|l| l.param_bytes).sum();
    if net.heap_used.saturating_add(heap_needed) > net.heap_capacity {
        return (DeviceErrorCode::HeapAllocFailure, net.heap_used, 0);
    }
    let records_needed = layers.len() * MEM_RECORDS_PER_LAYER;
    if net.mem_records + records_needed > ctx.max_mem_records {
        return (DeviceErrorCode::MemRecAllocFailure, net.heap_used, 0);
    }

    net.heap_used += heap_needed;
    net.mem_records += records_needed;
    net.ready_groups.insert(group_id);

    let cycles = SETUP_BASE_CYCLES + SETUP_PER_LAYER_CYCLES * layers.len() as u64;
    (DeviceErrorCode::Success, net.heap_used, cycles)
}

fn run_process(ctx: &ContextState, args: &[KernelArg]) -> (DeviceErrorCode, u32, u64) {
    // Two arities: with and without the trace buffer at index 3.
    let (trace, params_idx) = match args.len() {
        5 => (None, 3),
        6 => (buffer_arg(args, 3).cloned(), 4),
        _ => return (DeviceErrorCode::ProcessFailure, 0, 0),
    };
    if args.len() == 6 && trace.is_none() {
        return (DeviceErrorCode::ProcessFailure, 0, 0);
    }

    let (Some(params), Some(group_id)) = (
        scalar_arg::<ProcessParams>(args, params_idx),
        scalar_arg::<u32>(args, params_idx + 1),
    ) else {
        return (DeviceErrorCode::ProcessFailure, 0, 0);
    };

    let net = ctx.net.read();
    let Some(net) = net.as_ref() else {
        return (DeviceErrorCode::GeneralFailure, 0, 0);
    };
    let heap_used = net.heap_used;

    if !net.ready_groups.contains(&group_id) {
        return (DeviceErrorCode::ProcessFailure, heap_used, 0);
    }
    let layers: Vec<&LayerRecord> = net
        .descriptor
        .layers
        .iter()
        .filter(|l| l.group_id == group_id)
        .collect();

    let (Some(input), Some(output)) = (buffer_arg(args, 1), buffer_arg(args, 2)) else {
        return (DeviceErrorCode::ProcessFailure, heap_used, 0);
    };
    if input.len() != layers[0].in_dims().byte_len()
        || output.len() != layers[layers.len() - 1].out_dims().byte_len()
    {
        return (DeviceErrorCode::ProcessFailure, heap_used, 0);
    }

    tracing::trace!(
        frame_index = params.frame_index,
        group_id,
        layers = layers.len(),
        "process"
    );

    let mut cur = input.to_vec();
    let mut cycles = PROCESS_BASE_CYCLES;
    let mut trace_cursor = 0usize;
    {
        let weights = net.weights.read();
        for layer in &layers {
            let next = match apply_layer(layer, &cur, &weights) {
                Some(v) => v,
                None => return (DeviceErrorCode::ProcessFailure, heap_used, 0),
            };
            cycles += layer_cycles(layer, &cur, &next);

            if params.trace_enabled != 0 {
                if let Some(trace) = &trace {
                    if trace.write_at(trace_cursor, &next).is_err() {
                        return (DeviceErrorCode::ProcessFailure, heap_used, 0);
                    }
                    trace_cursor += next.len();
                }
            }
            cur = next;
        }
    }

    if output.write_at(0, &cur).is_err() {
        return (DeviceErrorCode::ProcessFailure, heap_used, 0);
    }

    cycles *= kind_cost_factor(ctx.kind);
    (DeviceErrorCode::Success, heap_used, cycles)
}

fn run_teardown(ctx: &ContextState, args: &[KernelArg]) -> (DeviceErrorCode, u32, u64) {
    let Some(group_id) = scalar_arg::<u32>(args, 1) else {
        return (DeviceErrorCode::GeneralFailure, 0, 0);
    };

    let mut net = ctx.net.write();
    // Teardown runs from drop paths; stay tolerant of half-built state.
    let Some(net) = net.as_mut() else {
        tracing::debug!(group_id, "teardown without network state");
        return (DeviceErrorCode::Success, 0, TEARDOWN_BASE_CYCLES);
    };
    if !net.ready_groups.remove(&group_id) {
        tracing::debug!(group_id, "teardown of a group that was never set up");
        return (DeviceErrorCode::Success, net.heap_used, TEARDOWN_BASE_CYCLES);
    }

    let layers: Vec<&LayerRecord> = net
        .descriptor
        .layers
        .iter()
        .filter(|l| l.group_id == group_id)
        .collect();
    let heap_freed: u32 = layers.iter().map(|l| l.param_bytes).sum();
    net.heap_used = net.heap_used.saturating_sub(heap_freed);
    net.mem_records = net
        .mem_records
        .saturating_sub(layers.len() * MEM_RECORDS_PER_LAYER);

    (DeviceErrorCode::Success, net.heap_used, TEARDOWN_BASE_CYCLES)
}

/// Runs one layer over `input`, reading parameters from the weights blob.
fn apply_layer(layer: &LayerRecord, input: &[u8], weights: &[u8]) -> Option<Vec<u8>> {
    let kind = layer.layer_kind()?;
    let off = layer.weight_offset as usize;

    match kind {
        LayerKind::Data | LayerKind::Identity => Some(input.to_vec()),
        LayerKind::Scale => {
            let w = weights.get(off..off + 2)?;
            let mul = w[0] as i8 as i32;
            let shift = w[1] as u32;
            Some(
                input
                    .iter()
                    .map(|&x| ((x as i32 * mul) >> shift).clamp(0, 255) as u8)
                    .collect(),
            )
        }
        LayerKind::Dense => {
            let in_len = layer.in_dims().byte_len();
            let out_len = layer.out_dims().byte_len();
            let matrix = weights.get(off..off + out_len * in_len)?;
            let biases = weights.get(off + out_len * in_len..off + layer.weight_bytes as usize)?;

            let mut out = Vec::with_capacity(out_len);
            for o in 0..out_len {
                let row = &matrix[o * in_len..(o + 1) * in_len];
                let mut acc: i32 = i32::from_le_bytes([
                    biases[o * 4],
                    biases[o * 4 + 1],
                    biases[o * 4 + 2],
                    biases[o * 4 + 3],
                ]);
                for (x, w) in input.iter().zip(row) {
                    acc += *x as i32 * (*w as i8 as i32);
                }
                out.push((acc >> DENSE_ACCUM_SHIFT).clamp(0, 255) as u8);
            }
            Some(out)
        }
    }
}

fn layer_cycles(layer: &LayerRecord, input: &[u8], output: &[u8]) -> u64 {
    match layer.layer_kind() {
        Some(LayerKind::Scale) => 2 * input.len() as u64,
        Some(LayerKind::Dense) => 2 * input.len() as u64 * output.len() as u64,
        _ => input.len() as u64,
    }
}

/// DSP cores run the generic code path; NPU cores have the fixed-function
/// fast path.
fn kind_cost_factor(kind: DeviceKind) -> u64 {
    match kind {
        DeviceKind::Dsp => 2,
        DeviceKind::Npu => 1,
    }
}

fn buffer_arg(args: &[KernelArg], index: usize) -> Option<&HostBuffer> {
    match args.get(index) {
        Some(KernelArg::Buffer { buffer, .. }) => Some(buffer),
        _ => None,
    }
}

fn local_arg_bytes(args: &[KernelArg]) -> Option<usize> {
    args.iter().find_map(|arg| match arg {
        KernelArg::Local { bytes } => Some(*bytes),
        _ => None,
    })
}

fn scalar_arg<T: bytemuck::Pod>(args: &[KernelArg], index: usize) -> Option<T> {
    match args.get(index) {
        Some(KernelArg::Scalar(bytes)) if bytes.len() == std::mem::size_of::<T>() => {
            Some(bytemuck::pod_read_unaligned(bytes))
        }
        _ => None,
    }
}

fn write_status(buf: &HostBuffer, code: DeviceErrorCode, heap_used: u32, cycles: u64) {
    let status = DeviceStatus {
        error_code: code.as_u32(),
        heap_used_bytes: heap_used,
        cycles,
    };
    if let Err(e) = buf.write_at(0, bytemuck::bytes_of(&status)) {
        tracing::error!(error = %e, "status buffer write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use net_format::TensorDims;

    fn record(kind: LayerKind, dims: TensorDims, weight_offset: u32, weight_bytes: u32) -> LayerRecord {
        LayerRecord {
            index: 0,
            kind: kind.as_u32(),
            group_id: 1,
            in_channels: dims.channels,
            in_height: dims.height,
            in_width: dims.width,
            out_channels: dims.channels,
            out_height: dims.height,
            out_width: dims.width,
            weight_offset,
            weight_bytes,
            param_bytes: weight_bytes,
        }
    }

    #[test]
    fn test_identity_layer() {
        let r = record(LayerKind::Identity, TensorDims::new(1, 2, 2), 0, 0);
        let out = apply_layer(&r, &[1, 2, 3, 4], &[]).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_scale_layer_clamps() {
        let r = record(LayerKind::Scale, TensorDims::new(1, 1, 4), 0, 2);
        // mul = 3, shift = 1: x -> (3x) >> 1, clamped to u8.
        let out = apply_layer(&r, &[0, 10, 100, 200], &[3, 1]).unwrap();
        assert_eq!(out, vec![0, 15, 150, 255]);
    }

    #[test]
    fn test_scale_negative_mul_clamps_to_zero() {
        let r = record(LayerKind::Scale, TensorDims::new(1, 1, 2), 0, 2);
        let out = apply_layer(&r, &[5, 200], &[(-1i8) as u8, 0]).unwrap();
        assert_eq!(out, vec![0, 0]);
    }

    #[test]
    fn test_dense_layer() {
        // 2 inputs -> 1 output, weights [1, 2], bias 128.
        let mut r = record(LayerKind::Dense, TensorDims::new(1, 1, 2), 0, 2 + 4);
        r.out_channels = 1;
        r.out_height = 1;
        r.out_width = 1;

        let mut weights = vec![1u8, 2u8];
        weights.extend_from_slice(&128i32.to_le_bytes());

        // acc = 10*1 + 20*2 + 128 = 178; 178 >> 7 = 1.
        let out = apply_layer(&r, &[10, 20], &weights).unwrap();
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn test_dense_out_of_range_weights() {
        let mut r = record(LayerKind::Dense, TensorDims::new(1, 1, 2), 0, 6);
        r.out_channels = 1;
        r.out_height = 1;
        r.out_width = 1;
        assert!(apply_layer(&r, &[1, 2], &[0u8; 3]).is_none());
    }

    #[test]
    fn test_cost_factor_orders_classes() {
        assert!(kind_cost_factor(DeviceKind::Dsp) > kind_cost_factor(DeviceKind::Npu));
    }
}
