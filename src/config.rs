//! Pipeline configuration: filter design, peak thresholds, timing and the action table.
//!
//! Supplied once at startup (built-in defaults or a JSON file) and immutable
//! thereafter. `validate()` must pass before any worker is started.

use crate::conditioner::min_window_len;
use crate::types::{Action, ChannelId, SensorId};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on samples per window (about 35 minutes at 500 Hz).
pub const MAX_WINDOW_LEN: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid filter: need 0 < low_cutoff ({low}) < high_cutoff ({high}) < sampling_rate / 2 ({nyquist})")]
    InvalidFilter { low: f64, high: f64, nyquist: f64 },
    #[error("invalid envelope cutoff {cutoff} Hz: must lie in (0, {nyquist})")]
    InvalidEnvelopeCutoff { cutoff: f64, nyquist: f64 },
    #[error("filter order must be at least 1")]
    InvalidOrder,
    #[error("window of {len} samples is too short; the filters need at least {min} (raise window_duration or sampling_rate)")]
    WindowTooShort { len: usize, min: usize },
    #[error("window of {len} samples is too long; at most {max} are allowed (lower window_duration)")]
    WindowTooLong { len: usize, max: usize },
    #[error("{name} of {value} s is out of range")]
    DurationOutOfRange { name: &'static str, value: f64 },
    #[error("{name} must be positive (got {value})")]
    NonPositive { name: &'static str, value: f64 },
    #[error("{name} must not be negative (got {value})")]
    Negative { name: &'static str, value: f64 },
    #[error("channel A{0} is bound more than once")]
    DuplicateChannel(ChannelId),
    #[error("sensor A{0} is listed more than once")]
    DuplicateSensor(SensorId),
    #[error("pin A{0} is bound both as a channel and as an auxiliary sensor")]
    PinConflict(u8),
    #[error("channel A{channel} gates on sensor A{sensor}, which is not in the sensor table")]
    UnknownSensor { channel: ChannelId, sensor: SensorId },
    #[error("pin A{0} is bound to Neutral; bind a real action or remove it")]
    NeutralBinding(u8),
    #[error("the action table has no channels")]
    NoChannels,
    #[error("channel A{0} is not in the action table")]
    UnknownChannel(ChannelId),
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Band-pass design parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub low_cutoff: f64,
    pub high_cutoff: f64,
    pub sampling_rate: f64,
    pub order: usize,
}

impl FilterSpec {
    pub fn nyquist(&self) -> f64 {
        self.sampling_rate / 2.0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.order == 0 {
            return Err(ConfigError::InvalidOrder);
        }
        let ok = self.low_cutoff > 0.0
            && self.low_cutoff < self.high_cutoff
            && self.high_cutoff < self.nyquist();
        if !ok {
            return Err(ConfigError::InvalidFilter {
                low: self.low_cutoff,
                high: self.high_cutoff,
                nyquist: self.nyquist(),
            });
        }
        Ok(())
    }
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self {
            low_cutoff: 74.5,
            high_cutoff: 149.5,
            sampling_rate: 500.0,
            order: 4,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_emg_scale() -> f64 {
    1000.0
}

fn default_flex_scale() -> f64 {
    1.0
}

/// An EMG channel: one worker, one bound action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub channel: ChannelId,
    #[serde(default)]
    pub name: String,
    pub action: Action,
    /// Peaks on a primary channel trigger `action` (rule 1 of the ladder)
    #[serde(default = "default_true")]
    pub primary: bool,
    /// Sensor whose mean must stay below its threshold for rule 1 to fire
    #[serde(default)]
    pub gate: Option<SensorId>,
    /// Whether this channel's worker evaluates the sensor rules (rule 2)
    #[serde(default = "default_true")]
    pub sensor_rules: bool,
    /// Multiplier applied to the raw 0.0–1.0 board reading
    #[serde(default = "default_emg_scale")]
    pub scale: f64,
}

/// An auxiliary (flex) sensor. Order in the table is priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorBinding {
    pub sensor: SensorId,
    #[serde(default)]
    pub name: String,
    /// Window mean above this fires `action`
    pub threshold: f64,
    pub action: Action,
    #[serde(default = "default_flex_scale")]
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTable {
    pub channels: Vec<ChannelBinding>,
    /// Priority order: the first sensor over threshold wins
    pub sensors: Vec<SensorBinding>,
}

impl ActionTable {
    pub fn sensor(&self, id: SensorId) -> Option<&SensorBinding> {
        self.sensors.iter().find(|s| s.sensor == id)
    }

    pub fn channel(&self, id: ChannelId) -> Option<&ChannelBinding> {
        self.channels.iter().find(|c| c.channel == id)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        let mut channels = HashSet::new();
        for c in &self.channels {
            if !channels.insert(c.channel) {
                return Err(ConfigError::DuplicateChannel(c.channel));
            }
            if c.action.is_neutral() {
                return Err(ConfigError::NeutralBinding(c.channel));
            }
        }
        let mut sensors = HashSet::new();
        for s in &self.sensors {
            if !sensors.insert(s.sensor) {
                return Err(ConfigError::DuplicateSensor(s.sensor));
            }
            if channels.contains(&s.sensor) {
                return Err(ConfigError::PinConflict(s.sensor));
            }
            if s.action.is_neutral() {
                return Err(ConfigError::NeutralBinding(s.sensor));
            }
        }
        for c in &self.channels {
            if let Some(gate) = c.gate {
                if !sensors.contains(&gate) {
                    return Err(ConfigError::UnknownSensor {
                        channel: c.channel,
                        sensor: gate,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for ActionTable {
    /// Two forearm electrodes steer, three finger flex sensors jump / walk.
    fn default() -> Self {
        let flex = |sensor, name: &str, action| SensorBinding {
            sensor,
            name: name.into(),
            threshold: 0.1,
            action,
            scale: 1.0,
        };
        Self {
            channels: vec![
                ChannelBinding {
                    channel: 0,
                    name: "left-forearm".into(),
                    action: Action::TurnLeft,
                    primary: true,
                    gate: Some(3),
                    sensor_rules: true,
                    scale: 1000.0,
                },
                ChannelBinding {
                    channel: 1,
                    name: "right-forearm".into(),
                    action: Action::TurnRight,
                    primary: true,
                    gate: Some(3),
                    sensor_rules: false,
                    scale: 1000.0,
                },
            ],
            sensors: vec![
                flex(3, "right-middle", Action::Jump),
                flex(4, "right-index", Action::MoveForward),
                flex(5, "left-hand", Action::MoveBack),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub filter: FilterSpec,
    /// Envelope low-pass cutoff (Hz)
    pub envelope_cutoff: f64,
    pub prominence: f64,
    pub min_height: f64,
    /// Minimum peak width in seconds (converted to samples at the sampling rate)
    pub min_width: f64,
    /// Window length in seconds; N = round(sampling_rate × window_duration)
    pub window_duration: f64,
    /// Press duration, also the per-channel cooldown (seconds)
    pub hold_duration: f64,
    /// Longest a worker waits for a sample before re-checking shutdown (seconds)
    pub idle_wait: f64,
    /// Per-channel sample queue between acquisition and worker
    pub queue_capacity: usize,
    pub action_table: ActionTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            filter: FilterSpec::default(),
            envelope_cutoff: 7.0,
            prominence: 0.005,
            min_height: 1.25,
            min_width: 0.0025,
            window_duration: 0.2,
            hold_duration: 0.3,
            idle_wait: 0.005,
            queue_capacity: 1024,
            action_table: ActionTable::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file. Missing fields fall back to the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn to_json(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Samples per analysis window.
    pub fn window_len(&self) -> usize {
        (self.filter.sampling_rate * self.window_duration).round() as usize
    }

    pub fn min_width_samples(&self) -> f64 {
        self.min_width * self.filter.sampling_rate
    }

    pub fn hold(&self) -> Duration {
        Duration::from_secs_f64(self.hold_duration)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs_f64(self.idle_wait)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.filter.validate()?;

        let nyquist = self.filter.nyquist();
        if !(self.envelope_cutoff > 0.0 && self.envelope_cutoff < nyquist) {
            return Err(ConfigError::InvalidEnvelopeCutoff {
                cutoff: self.envelope_cutoff,
                nyquist,
            });
        }

        for (name, value) in [
            ("window_duration", self.window_duration),
            ("hold_duration", self.hold_duration),
            ("idle_wait", self.idle_wait),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        for (name, value) in [("hold_duration", self.hold_duration), ("idle_wait", self.idle_wait)] {
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(ConfigError::DurationOutOfRange { name, value });
            }
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::NonPositive {
                name: "queue_capacity",
                value: 0.0,
            });
        }
        for (name, value) in [
            ("prominence", self.prominence),
            ("min_height", self.min_height),
            ("min_width", self.min_width),
        ] {
            if value < 0.0 || value.is_nan() {
                return Err(ConfigError::Negative { name, value });
            }
        }

        let len = self.window_len();
        let min = min_window_len(self.filter.order);
        if len < min {
            return Err(ConfigError::WindowTooShort { len, min });
        }
        if len > MAX_WINDOW_LEN {
            return Err(ConfigError::WindowTooLong {
                len,
                max: MAX_WINDOW_LEN,
            });
        }

        self.action_table.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.window_len(), 100);
        assert!((cfg.min_width_samples() - 1.25).abs() < 1e-12);
    }

    #[test]
    fn test_nyquist_violation_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.filter.high_cutoff = 250.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidFilter { .. })));

        let mut cfg = PipelineConfig::default();
        cfg.filter.low_cutoff = 0.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidFilter { .. })));

        let mut cfg = PipelineConfig::default();
        cfg.filter.low_cutoff = 150.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidFilter { .. })));
    }

    #[test]
    fn test_short_window_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.window_duration = 0.05; // 25 samples, band-pass needs 28
        match cfg.validate() {
            Err(ConfigError::WindowTooShort { len, min }) => {
                assert_eq!(len, 25);
                assert_eq!(min, 28);
            }
            other => panic!("expected WindowTooShort, got {:?}", other),
        }
    }

    #[test]
    fn test_huge_window_rejected() {
        let cfg: PipelineConfig = serde_json::from_str(r#"{ "window_duration": 1e17 }"#).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::WindowTooLong { max: MAX_WINDOW_LEN, .. })
        ));
    }

    #[test]
    fn test_unrepresentable_durations_rejected() {
        let cfg: PipelineConfig = serde_json::from_str(r#"{ "hold_duration": 1e20 }"#).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DurationOutOfRange { name: "hold_duration", .. })
        ));

        let cfg: PipelineConfig = serde_json::from_str(r#"{ "idle_wait": 1e20 }"#).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DurationOutOfRange { name: "idle_wait", .. })
        ));

        let mut cfg = PipelineConfig::default();
        cfg.hold_duration = f64::INFINITY;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_gate_must_reference_sensor() {
        let mut cfg = PipelineConfig::default();
        cfg.action_table.channels[0].gate = Some(9);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownSensor { channel: 0, sensor: 9 })
        ));
    }

    #[test]
    fn test_pin_conflict_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.action_table.sensors[0].sensor = 1;
        cfg.action_table.channels[0].gate = None;
        cfg.action_table.channels[1].gate = None;
        assert!(matches!(cfg.validate(), Err(ConfigError::PinConflict(1))));
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.action_table.channels[1].channel = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateChannel(0))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "envelope_cutoff": 5.0, "filter": { "low_cutoff": 20.0, "high_cutoff": 200.0, "sampling_rate": 1000.0, "order": 4 } }"#;
        let cfg: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.envelope_cutoff, 5.0);
        assert_eq!(cfg.window_len(), 200);
        assert_eq!(cfg.action_table, ActionTable::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_channel_binding_field_defaults() {
        let json = r#"{ "channel": 2, "action": "Jump" }"#;
        let b: ChannelBinding = serde_json::from_str(json).unwrap();
        assert!(b.primary);
        assert!(b.sensor_rules);
        assert_eq!(b.gate, None);
        assert_eq!(b.scale, 1000.0);
    }

    #[test]
    fn test_dump_is_loadable() {
        let cfg = PipelineConfig::default();
        let back: PipelineConfig = serde_json::from_str(&cfg.to_json()).unwrap();
        assert_eq!(back.window_len(), 100);
        assert_eq!(back.action_table.sensors.len(), 3);
        assert_eq!(back.action_table.channels[1].action, Action::TurnRight);
        back.validate().unwrap();
    }
}
