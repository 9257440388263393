//! Per-channel fixed-capacity, non-overlapping sample accumulation.

use crate::types::{Sample, SensorId};

/// A completed window handed to the conditioner.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSnapshot {
    pub values: Vec<f64>,
    /// Timestamp of the first sample
    pub start: f64,
    /// Timestamp of the last sample
    pub end: f64,
}

impl WindowSnapshot {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowStatus {
    Filling,
    Full(WindowSnapshot),
}

/// Append-only accumulator that hands over its contents the instant it
/// reaches `capacity` samples and starts again empty.
pub struct ChannelWindow {
    capacity: usize,
    values: Vec<f64>,
    start: f64,
    end: f64,
    /// Missing or non-finite readings skipped so far
    pub skipped: u64,
}

impl ChannelWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            values: Vec::with_capacity(capacity),
            start: 0.0,
            end: 0.0,
            skipped: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Accept one reading. `None` and non-finite values are transient faults:
    /// they are counted and skipped without touching the accumulated samples.
    pub fn push(&mut self, sample: Option<Sample>) -> WindowStatus {
        let sample = match sample {
            Some(s) if s.value.is_finite() => s,
            _ => {
                self.skipped += 1;
                return WindowStatus::Filling;
            }
        };

        if self.values.is_empty() {
            self.start = sample.timestamp;
        }
        self.end = sample.timestamp;
        self.values.push(sample.value);

        if self.values.len() >= self.capacity {
            let values = std::mem::replace(&mut self.values, Vec::with_capacity(self.capacity));
            WindowStatus::Full(WindowSnapshot {
                values,
                start: self.start,
                end: self.end,
            })
        } else {
            WindowStatus::Filling
        }
    }
}

/// Running sums of auxiliary sensor readings over the current window.
pub struct AuxAccumulator {
    sums: Vec<(SensorId, f64, u32)>,
}

impl AuxAccumulator {
    pub fn new(sensors: &[SensorId]) -> Self {
        Self {
            sums: sensors.iter().map(|&s| (s, 0.0, 0)).collect(),
        }
    }

    pub fn sensors(&self) -> impl Iterator<Item = SensorId> + '_ {
        self.sums.iter().map(|(s, _, _)| *s)
    }

    pub fn add(&mut self, sensor: SensorId, value: f64) {
        if !value.is_finite() {
            return;
        }
        if let Some(entry) = self.sums.iter_mut().find(|(s, _, _)| *s == sensor) {
            entry.1 += value;
            entry.2 += 1;
        }
    }

    /// Means for every sensor that saw at least one reading, then reset.
    pub fn take_means(&mut self) -> Vec<(SensorId, f64)> {
        let means = self
            .sums
            .iter()
            .filter(|(_, _, n)| *n > 0)
            .map(|(s, sum, n)| (*s, sum / *n as f64))
            .collect();
        for entry in &mut self.sums {
            entry.1 = 0.0;
            entry.2 = 0;
        }
        means
    }
}
