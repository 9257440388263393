use crate::source::BoardPublisher;
use crate::types::*;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::thread;
use std::time::{Duration, Instant};

/// Resting level of a raw EMG pin (mid-rail, 0.0–1.0 like a 10-bit read / 1023).
const EMG_BASELINE: f64 = 0.5;
/// Raw noise amplitude; ×1000 channel scale puts it well under the detection height.
const EMG_NOISE: f64 = 0.0004;
/// Raw amplitude of a full contraction burst.
const EMG_BURST: f64 = 0.006;
/// Dominant frequency of a contraction burst, inside the 74.5–149.5 Hz pass band.
const BURST_HZ: f64 = 110.0;
const FLEX_NOISE: f64 = 0.005;

/// How the simulator spaces its ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// One tick per sampling period of wall time
    Realtime,
    /// As fast as the workers consume; each tick waits for every queue to drain
    Lockstep,
    /// As fast as possible; slow consumers drop samples
    Burst,
}

/// How long lockstep waits on a stalled queue before moving on.
const LOCKSTEP_PATIENCE: Duration = Duration::from_millis(100);

/// Generates synthetic EMG and flex-sensor readings that exercise the whole
/// pipeline without hardware, and publishes them on the board.
pub struct Simulator {
    clock: SessionClock,
    publisher: BoardPublisher,
    sampling_rate: f64,
    shutdown: Shutdown,
    rng: StdRng,
    emg: Vec<ChannelId>,
    flex: Vec<SensorId>,
    /// Sample counter for phase-continuous bursts and sample timestamps
    tick: u64,
    /// Session time of the current run's first tick
    t0: f64,
    pacing: Pacing,
    looping: bool,
}

/// Mutable state that evolves as gestures are applied.
#[derive(Default)]
struct SimState {
    /// Contraction strength 0.0–1.0 per EMG channel
    contraction: BTreeMap<ChannelId, f64>,
    /// Bend level 0.0–1.0 per flex sensor
    flex: BTreeMap<SensorId, f64>,
}

impl Simulator {
    pub fn new(
        clock: SessionClock,
        publisher: BoardPublisher,
        emg: &[ChannelId],
        flex: &[SensorId],
        sampling_rate: f64,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            clock,
            publisher,
            emg: emg.to_vec(),
            flex: flex.to_vec(),
            sampling_rate,
            shutdown,
            rng: StdRng::seed_from_u64(0x5eed),
            tick: 0,
            t0: 0.0,
            pacing: Pacing::Realtime,
            looping: true,
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Repeat the script until shutdown (default). Off, the run ends after one pass.
    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Play `script`. Returns the number of ticks produced so far. Dropping the
    /// simulator afterwards disconnects every worker. Blocks the calling thread.
    pub fn run(&mut self, script: &[Gesture]) -> u64 {
        info!("Simulator starting ({} gestures, {} Hz)", script.len(), self.sampling_rate);
        let mut state = SimState {
            contraction: self.emg.iter().map(|&c| (c, 0.0)).collect(),
            flex: self.flex.iter().map(|&s| (s, 0.0)).collect(),
        };
        let started = Instant::now();
        let first_tick = self.tick;
        self.t0 = self.clock.now_secs();

        'outer: loop {
            for gesture in script {
                if !self.execute(gesture, &mut state, started, first_tick) {
                    break 'outer;
                }
            }
            if !self.looping {
                break;
            }
            debug!("Simulator: script finished, repeating");
        }

        info!(
            "Simulator stopping after {} ticks ({} samples dropped by slow workers)",
            self.tick,
            self.publisher.overruns()
        );
        self.tick
    }

    /// Apply one gesture. Returns false once shutdown is requested.
    fn execute(&mut self, gesture: &Gesture, state: &mut SimState, started: Instant, first_tick: u64) -> bool {
        match *gesture {
            Gesture::Rest { ms } => {
                debug!("  rest {}ms", ms);
                for _ in 0..self.ticks(ms) {
                    if !self.emit_tick(state, started, first_tick) {
                        return false;
                    }
                }
            }

            Gesture::Contract { channel, ms } => {
                debug!("  contract A{} for {}ms", channel, ms);
                let ticks = self.ticks(ms);
                let ramp = self.ticks(20).max(1);
                for i in 0..ticks {
                    let edge = i.min(ticks - 1 - i) as f64 / ramp as f64;
                    state.contraction.insert(channel, smoothstep(edge));
                    if !self.emit_tick(state, started, first_tick) {
                        return false;
                    }
                }
                state.contraction.insert(channel, 0.0);
            }

            Gesture::Bend { sensor, level, ms } => {
                let from = state.flex.get(&sensor).copied().unwrap_or(0.0);
                debug!("  flex A{} {:.2} → {:.2} over {}ms", sensor, from, level, ms);
                let ticks = self.ticks(ms);
                for i in 0..ticks {
                    let t = i as f64 / ticks as f64;
                    state.flex.insert(sensor, lerp(from, level, smoothstep(t)));
                    if !self.emit_tick(state, started, first_tick) {
                        return false;
                    }
                }
                state.flex.insert(sensor, level);
            }
        }
        true
    }

    fn ticks(&self, ms: u32) -> u64 {
        (ms as f64 * self.sampling_rate / 1000.0).round() as u64
    }

    /// Publish one reading per pin. Returns false once shutdown is requested.
    fn emit_tick(&mut self, state: &SimState, started: Instant, first_tick: u64) -> bool {
        if self.shutdown.is_triggered() {
            return false;
        }
        // Tick-derived timestamps stay on the sample grid even when not paced.
        let ts = self.t0 + (self.tick - first_tick) as f64 / self.sampling_rate;
        let phase = 2.0 * PI * BURST_HZ * self.tick as f64 / self.sampling_rate;

        for (&channel, &strength) in &state.contraction {
            let noise = self.rng.gen_range(-1.0f64..1.0) * EMG_NOISE;
            let value = EMG_BASELINE + noise + strength * EMG_BURST * phase.sin();
            self.publisher.publish(Sample::new(channel, value, ts));
        }
        for (&sensor, &level) in &state.flex {
            let noise = self.rng.gen_range(-1.0f64..1.0) * FLEX_NOISE;
            let value = (level + noise).clamp(0.0, 1.0);
            self.publisher.publish(Sample::new(sensor, value, ts));
        }

        self.tick += 1;
        match self.pacing {
            Pacing::Realtime => {
                let due = started + Duration::from_secs_f64((self.tick - first_tick) as f64 / self.sampling_rate);
                let now = Instant::now();
                if due > now {
                    thread::sleep(due - now);
                }
            }
            Pacing::Lockstep => {
                // Flex registers only hold the latest value; wait so workers
                // read them in step with their own samples.
                let since = Instant::now();
                while self.publisher.backlog() > 0 && since.elapsed() < LOCKSTEP_PATIENCE {
                    if self.shutdown.is_triggered() {
                        return false;
                    }
                    thread::yield_now();
                }
            }
            Pacing::Burst => {}
        }
        true
    }
}

// ─── Gesture types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gesture {
    /// Hold the current state
    Rest { ms: u32 },
    /// Muscle contraction burst on one EMG channel
    Contract { channel: ChannelId, ms: u32 },
    /// Move a flex sensor to `level` (0.0 straight, 1.0 fully bent)
    Bend { sensor: SensorId, level: f64, ms: u32 },
}

/// About 6.4 seconds touching every rung of the default action table:
/// left and right turns, forward, jump (gate bent while contracting) and back.
/// Contractions sit inside 200 ms windows when replayed from tick 0.
pub fn demo_sequence() -> Vec<Gesture> {
    vec![
        Gesture::Rest { ms: 650 },
        // Turn left, then right
        Gesture::Contract { channel: 0, ms: 100 },
        Gesture::Rest { ms: 500 },
        Gesture::Contract { channel: 1, ms: 100 },
        Gesture::Rest { ms: 450 },
        // Walk forward
        Gesture::Bend { sensor: 4, level: 0.5, ms: 150 },
        Gesture::Rest { ms: 800 },
        Gesture::Bend { sensor: 4, level: 0.0, ms: 150 },
        Gesture::Rest { ms: 400 },
        // Gate bent: a contraction on A0 no longer turns, the bend jumps
        Gesture::Bend { sensor: 3, level: 0.6, ms: 100 },
        Gesture::Rest { ms: 50 },
        Gesture::Contract { channel: 0, ms: 100 },
        Gesture::Rest { ms: 250 },
        Gesture::Bend { sensor: 3, level: 0.0, ms: 100 },
        Gesture::Rest { ms: 400 },
        // Back up
        Gesture::Bend { sensor: 5, level: 0.5, ms: 150 },
        Gesture::Rest { ms: 800 },
        Gesture::Bend { sensor: 5, level: 0.0, ms: 150 },
        Gesture::Rest { ms: 1000 },
    ]
}

// ─── Math helpers ───────────────────────────────────────────────────────────

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Smooth interpolation (ease in/out)
fn smoothstep(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{board, SampleSource};

    fn offline(publisher: BoardPublisher, emg: &[ChannelId], flex: &[SensorId]) -> Simulator {
        Simulator::new(SessionClock::new(), publisher, emg, flex, 500.0, Shutdown::new())
            .with_pacing(Pacing::Burst)
            .with_looping(false)
    }

    #[test]
    fn test_smoothstep_bounds() {
        assert_eq!(smoothstep(-1.0), 0.0);
        assert_eq!(smoothstep(2.0), 1.0);
        assert!((smoothstep(0.5) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_script_length_in_ticks() {
        let (publisher, _taps) = board(&[0], &[3], 4096);
        let mut sim = offline(publisher, &[0], &[3]);
        let ticks = sim.run(&[Gesture::Rest { ms: 100 }, Gesture::Contract { channel: 0, ms: 200 }]);
        assert_eq!(ticks, 150);
    }

    #[test]
    fn test_contraction_raises_spread() {
        let (publisher, mut taps) = board(&[0], &[], 4096);
        let mut sim = offline(publisher, &[0], &[]);
        sim.run(&[Gesture::Rest { ms: 200 }, Gesture::Contract { channel: 0, ms: 200 }]);

        let mut values = Vec::new();
        while let Ok(Some(s)) = taps[0].read(0) {
            values.push(s.value);
        }
        assert_eq!(values.len(), 200);
        let spread = |xs: &[f64]| {
            let hi = xs.iter().cloned().fold(f64::MIN, f64::max);
            let lo = xs.iter().cloned().fold(f64::MAX, f64::min);
            hi - lo
        };
        assert!(spread(&values[..100]) <= 2.0 * EMG_NOISE);
        assert!(spread(&values[100..]) > EMG_BURST);
    }

    #[test]
    fn test_bend_reaches_level() {
        let (publisher, mut taps) = board(&[0], &[4], 4096);
        let mut sim = offline(publisher, &[0], &[4]);
        sim.run(&[Gesture::Bend { sensor: 4, level: 0.5, ms: 100 }]);
        let level = taps[0].read(4).unwrap().unwrap().value;
        assert!((level - 0.5).abs() <= FLEX_NOISE, "level {}", level);

        drop(sim);
        assert!(taps[0].read(4).is_err(), "board closes with the simulator");
    }

    #[test]
    fn test_shutdown_stops_run() {
        let (publisher, _taps) = board(&[0], &[], 16);
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut sim = Simulator::new(SessionClock::new(), publisher, &[0], &[], 500.0, shutdown);
        assert_eq!(sim.run(&demo_sequence()), 0);
    }
}
