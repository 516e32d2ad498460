//! GPU timing around compute dispatches.
//!
//! Timestamps are written in pairs: the first mark of a pair opens a scope under
//! its label, the second closes it. Results are read back one frame slot at a
//! time, once the slot comes around again.

use crate::device::{CommandList, Device, DeviceError, QueryPoolHandle};
use log::debug;
use std::collections::BTreeMap;
use std::fmt;

// Resolve destinations must be 256 byte aligned, 32 timestamps of 8 bytes.
const QUERY_ALIGNMENT: u32 = 32;

pub trait Profiler: Send {
    fn begin_frame(&mut self, frame_slot: usize, commands: &mut CommandList);

    fn write_timestamp(&mut self, commands: &mut CommandList, label: &str);

    fn end_frame(&mut self, commands: &mut CommandList);

    /// The frame recorded since `begin_frame` was never submitted.
    fn abandon_frame(&mut self);

    /// Reads back results for `frame_slot` if it holds a submitted frame.
    fn collect(&mut self, device: &dyn Device, frame_slot: usize) -> Result<(), DeviceError>;

    fn draw_ui(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScopeTiming {
    pub last_ms: f64,
    pub average_ms: f64,
    pub samples: u64,
}

impl ScopeTiming {
    fn record(&mut self, ms: f64) {
        self.last_ms = ms;
        self.samples += 1;
        // Running mean for the first few samples, then exponential smoothing.
        let weight = (1.0 / self.samples as f64).max(0.05);
        self.average_ms += (ms - self.average_ms) * weight;
    }
}

#[derive(Debug, Default)]
struct FrameQueries {
    labels: Vec<String>,
    pending: bool,
}

pub struct TimestampProfiler {
    pool: QueryPoolHandle,
    queries_per_frame: u32,
    period_ns: f64,
    frames: Vec<FrameQueries>,
    current: usize,
    scopes: BTreeMap<String, ScopeTiming>,
    dropped_samples: u64,
    overflowed_marks: u64,
}

impl TimestampProfiler {
    pub fn new(device: &dyn Device, frame_slots: usize, queries_per_frame: u32) -> Result<Self, DeviceError> {
        let queries_per_frame = queries_per_frame.max(2).next_multiple_of(QUERY_ALIGNMENT);
        let frame_slots = frame_slots.max(1);
        let pool = device.create_timestamp_pool(queries_per_frame * frame_slots as u32)?;
        debug!(
            "Timestamp profiler: {} slots x {} queries",
            frame_slots, queries_per_frame
        );
        Ok(TimestampProfiler {
            pool,
            queries_per_frame,
            period_ns: device.timestamp_period() as f64,
            frames: (0..frame_slots).map(|_| FrameQueries::default()).collect(),
            current: 0,
            scopes: BTreeMap::new(),
            dropped_samples: 0,
            overflowed_marks: 0,
        })
    }

    pub fn scope(&self, label: &str) -> Option<&ScopeTiming> {
        self.scopes.get(label)
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    fn base_query(&self, frame_slot: usize) -> u32 {
        frame_slot as u32 * self.queries_per_frame
    }
}

impl Profiler for TimestampProfiler {
    fn begin_frame(&mut self, frame_slot: usize, _commands: &mut CommandList) {
        self.current = frame_slot % self.frames.len();
        let frame = &mut self.frames[self.current];
        if frame.pending {
            // Never collected, the slot is being reused.
            self.dropped_samples += 1;
        }
        frame.labels.clear();
        frame.pending = false;
    }

    fn write_timestamp(&mut self, commands: &mut CommandList, label: &str) {
        let base = self.base_query(self.current);
        let frame = &mut self.frames[self.current];
        let used = frame.labels.len() as u32;
        if used >= self.queries_per_frame {
            self.overflowed_marks += 1;
            return;
        }
        commands.write_timestamp(self.pool, base + used);
        frame.labels.push(label.to_string());
    }

    fn end_frame(&mut self, commands: &mut CommandList) {
        let base = self.base_query(self.current);
        let frame = &mut self.frames[self.current];
        let used = frame.labels.len() as u32;
        if used > 0 {
            commands.resolve_timestamps(self.pool, base..base + used);
            frame.pending = true;
        }
    }

    fn abandon_frame(&mut self) {
        let frame = &mut self.frames[self.current];
        if !frame.labels.is_empty() {
            self.dropped_samples += 1;
        }
        frame.labels.clear();
        frame.pending = false;
    }

    fn collect(&mut self, device: &dyn Device, frame_slot: usize) -> Result<(), DeviceError> {
        let slot = frame_slot % self.frames.len();
        if !self.frames[slot].pending {
            return Ok(());
        }
        self.frames[slot].pending = false;
        let base = self.base_query(slot);
        let used = self.frames[slot].labels.len() as u32;
        let stamps = match device.read_timestamps(self.pool, base..base + used) {
            Ok(stamps) => stamps,
            Err(e) => {
                self.dropped_samples += 1;
                return Err(e);
            }
        };
        let labels = &self.frames[slot].labels;
        for (pair, label) in stamps.chunks_exact(2).zip(labels.iter().step_by(2)) {
            let ticks = pair[1].saturating_sub(pair[0]);
            let ms = ticks as f64 * self.period_ns / 1.0e6;
            self.scopes.entry(label.clone()).or_default().record(ms);
        }
        Ok(())
    }

    fn draw_ui(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "GPU timings")?;
        for (label, timing) in &self.scopes {
            writeln!(
                out,
                "  {}: {:.3} ms (avg {:.3} ms)",
                label, timing.last_ms, timing.average_ms
            )?;
        }
        if self.dropped_samples > 0 {
            writeln!(out, "  dropped samples: {}", self.dropped_samples)?;
        }
        if self.overflowed_marks > 0 {
            writeln!(out, "  timestamps over budget: {}", self.overflowed_marks)?;
        }
        Ok(())
    }
}
