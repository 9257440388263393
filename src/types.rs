use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ─── Identifiers ────────────────────────────────────────────────────────────

/// Analog pin index on the acquisition board (A0 = 0).
pub type ChannelId = u8;

/// Auxiliary (flex) sensors are analog pins too; the alias keeps call sites readable.
pub type SensorId = u8;

// ─── Samples ────────────────────────────────────────────────────────────────

/// One reading from the acquisition board.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub channel: ChannelId,
    /// Scaled reading (EMG pins are usually ×1000, flex pins 0.0–1.0)
    pub value: f64,
    /// Seconds since session start
    pub timestamp: f64,
}

impl Sample {
    pub fn new(channel: ChannelId, value: f64, timestamp: f64) -> Self {
        Self {
            channel,
            value,
            timestamp,
        }
    }
}

// ─── Actions ────────────────────────────────────────────────────────────────

/// Discrete output symbol. Each non-neutral action is bound to exactly one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    MoveForward,
    MoveBack,
    TurnLeft,
    TurnRight,
    Jump,
    /// No action this cycle
    Neutral,
}

impl Action {
    pub fn is_neutral(self) -> bool {
        self == Action::Neutral
    }

    /// Host key bound to the action; `None` for `Neutral`.
    pub fn key(self) -> Option<Key> {
        match self {
            Action::MoveForward => Some(Key::W),
            Action::MoveBack => Some(Key::S),
            Action::TurnLeft => Some(Key::A),
            Action::TurnRight => Some(Key::D),
            Action::Jump => Some(Key::Space),
            Action::Neutral => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::MoveForward => "forward",
            Action::MoveBack => "back",
            Action::TurnLeft => "left",
            Action::TurnRight => "right",
            Action::Jump => "jump",
            Action::Neutral => "neutral",
        };
        f.write_str(name)
    }
}

/// Keys the pipeline can press on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    W,
    A,
    S,
    D,
    Space,
}

impl Key {
    pub fn name(self) -> &'static str {
        match self {
            Key::W => "w",
            Key::A => "a",
            Key::S => "s",
            Key::D => "d",
            Key::Space => "space",
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Detection output ───────────────────────────────────────────────────────

/// A qualifying onset peak in one envelope window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub index_in_window: usize,
    /// Seconds since session start
    pub timestamp: f64,
    /// Envelope height at the peak
    pub amplitude: f64,
    pub prominence: f64,
    /// Width in samples at half prominence
    pub width: f64,
}

/// One line of the session log: what a worker saw and decided for one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowReport {
    pub channel: ChannelId,
    /// Timestamp of the last sample in the window
    pub t: f64,
    pub events: Vec<Event>,
    pub aux_means: Vec<(SensorId, f64)>,
    pub decided: Action,
    pub forwarded: bool,
}

/// Request from a channel worker to the action dispatcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionRequest {
    pub channel: ChannelId,
    pub action: Action,
    pub timestamp: f64,
}

// ─── Session clock ──────────────────────────────────────────────────────────

/// Monotonic clock for the session.
#[derive(Clone)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Shutdown ───────────────────────────────────────────────────────────────

/// Shared cancellation flag observed by every thread at its cycle boundary.
#[derive(Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for up to `total`, waking early once shutdown is triggered.
    /// Returns true if shutdown was observed.
    pub fn sleep(&self, total: Duration) -> bool {
        let step = Duration::from_millis(10);
        let deadline = Instant::now() + total;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(step.min(deadline - now));
        }
    }
}
