// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! API-call timestamping for offline pipeline visualization.
//!
//! When enabled, the engine records a start and end stamp around every
//! pipeline-level and stage-level `ProcessFrameStartAsync` / `Wait` call.
//! The log is written as CSV, one event per line:
//!
//! ```text
//! frame_index,COMPONENT:API:PHASE,micros[,eo_type,eo_id]
//! 4,eop:PFSA:Start,18734
//! 4,eo1:PFSA:End,18761,0,1
//! ```
//!
//! `COMPONENT` is `eop` or `eoN` (1-based stage number), `API` is `PFSA`
//! or `PFW`, `PHASE` is `Start` or `End`. Stage lines append the device
//! class (`0` = dsp, `1` = npu) and unit id. Timestamps are microseconds
//! relative to the moment recording was enabled.
//!
//! Recording is process-global and off by default; the record calls
//! reduce to a single atomic load when disabled.

use crate::EngineError;
use accel_driver::DeviceKind;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Api {
    ProcessFrameStartAsync,
    ProcessFrameWait,
}

impl Api {
    fn tag(self) -> &'static str {
        match self {
            Self::ProcessFrameStartAsync => "PFSA",
            Self::ProcessFrameWait => "PFW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    End,
}

impl Phase {
    fn tag(self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::End => "End",
        }
    }
}

struct Entry {
    frame: u32,
    label: String,
    micros: u64,
}

struct Recorder {
    epoch: Instant,
    entries: Mutex<Vec<Entry>>,
}

static RECORDER: OnceLock<Recorder> = OnceLock::new();

/// Turns recording on for the rest of the process. Returns `false` when
/// it was already on.
pub fn enable() -> bool {
    RECORDER
        .set(Recorder {
            epoch: Instant::now(),
            entries: Mutex::new(Vec::new()),
        })
        .is_ok()
}

pub fn is_enabled() -> bool {
    RECORDER.get().is_some()
}

/// Number of events recorded so far.
pub fn event_count() -> usize {
    RECORDER.get().map_or(0, |r| r.entries.lock().len())
}

pub(crate) fn record_eop(frame: u32, api: Api, phase: Phase) {
    if let Some(recorder) = RECORDER.get() {
        recorder.push(frame, format!("eop:{}:{}", api.tag(), phase.tag()));
    }
}

pub(crate) fn record_eo(
    frame: u32,
    stage: usize,
    api: Api,
    phase: Phase,
    kind: DeviceKind,
    unit: u8,
) {
    if let Some(recorder) = RECORDER.get() {
        let class = match kind {
            DeviceKind::Dsp => 0,
            DeviceKind::Npu => 1,
        };
        recorder.push(
            frame,
            format!(
                "eo{}:{}:{},{},{}",
                stage + 1,
                api.tag(),
                phase.tag(),
                class,
                unit
            ),
        );
    }
}

impl Recorder {
    fn push(&self, frame: u32, label: String) {
        let micros = self.epoch.elapsed().as_micros() as u64;
        self.entries.lock().push(Entry {
            frame,
            label,
            micros,
        });
    }
}

/// Writes every recorded event to `path` as CSV.
///
/// A no-op returning `Ok` when recording was never enabled, so callers
/// can flush unconditionally on shutdown.
pub fn write_csv(path: &Path) -> Result<(), EngineError> {
    let Some(recorder) = RECORDER.get() else {
        return Ok(());
    };

    let mut out = String::new();
    {
        let entries = recorder.entries.lock();
        for entry in entries.iter() {
            // The label already carries the optional trailing columns.
            let (tag, extra) = match entry.label.split_once(',') {
                Some((tag, extra)) => (tag, Some(extra)),
                None => (entry.label.as_str(), None),
            };
            out.push_str(&format!("{},{},{}", entry.frame, tag, entry.micros));
            if let Some(extra) = extra {
                out.push(',');
                out.push_str(extra);
            }
            out.push('\n');
        }
    }

    std::fs::write(path, out).map_err(|source| EngineError::io(path, source))?;
    tracing::info!(path = %path.display(), "api timestamps written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_write() {
        enable();
        record_eop(3, Api::ProcessFrameStartAsync, Phase::Start);
        record_eop(3, Api::ProcessFrameStartAsync, Phase::End);
        record_eo(3, 0, Api::ProcessFrameWait, Phase::End, DeviceKind::Dsp, 1);
        assert!(event_count() >= 3);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stamps.csv");
        write_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("3,eop:PFSA:Start,"));
        assert!(text.lines().any(|l| l.starts_with("3,eo1:PFW:End,") && l.ends_with(",0,1")));
    }

    #[test]
    fn test_enable_is_idempotent() {
        enable();
        assert!(!enable());
        assert!(is_enabled());
    }
}
