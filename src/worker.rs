use crate::conditioner::SignalConditioner;
use crate::config::{ConfigError, PipelineConfig};
use crate::detector::{EventDetector, PeakCriteria};
use crate::mapper::{ActionMapper, ChannelState, Decision};
use crate::source::{SampleSource, SourceError};
use crate::types::*;
use crate::window::{AuxAccumulator, ChannelWindow, WindowSnapshot, WindowStatus};
use crossbeam_channel::{Sender, TrySendError};
use log::{debug, error, info, trace, warn};
use std::time::Duration;

/// Everything one worker exclusively owns or shares, handed over at construction.
pub struct ChannelContext {
    pub channel: ChannelId,
    pub source: Box<dyn SampleSource>,
    pub actions: Sender<ActionRequest>,
    pub reports: Option<Sender<WindowReport>>,
    pub shutdown: Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Filling,
    Conditioning,
    Detecting,
    Mapping,
}

#[derive(Debug)]
pub enum WorkerExit {
    Shutdown,
    Fault(SourceError),
    Panicked,
}

/// Summary returned when a worker stops.
#[derive(Debug)]
pub struct WorkerReport {
    pub channel: ChannelId,
    pub windows: u64,
    pub forwarded: u64,
    pub suppressed: u64,
    /// Transient sample faults skipped
    pub skipped: u64,
    /// Session-log lines lost to a full logger queue
    pub log_dropped: u64,
    pub exit: WorkerExit,
}

/// Drives one channel: sample → window → condition → detect → map → dispatch request.
pub struct ChannelWorker {
    channel: ChannelId,
    name: String,
    source: Box<dyn SampleSource>,
    scale: f64,
    aux_scales: Vec<(SensorId, f64)>,
    window: ChannelWindow,
    aux: AuxAccumulator,
    conditioner: SignalConditioner,
    detector: EventDetector,
    mapper: ActionMapper,
    state: ChannelState,
    phase: Phase,
    idle: Duration,
    actions: Sender<ActionRequest>,
    reports: Option<Sender<WindowReport>>,
    shutdown: Shutdown,
    sink_gone: bool,
    log_dropped: u64,
}

impl ChannelWorker {
    pub fn new(config: &PipelineConfig, ctx: ChannelContext) -> Result<Self, ConfigError> {
        let table = &config.action_table;
        let binding = table.channel(ctx.channel).ok_or(ConfigError::UnknownChannel(ctx.channel))?;
        let mapper = ActionMapper::new(ctx.channel, table, config.hold_duration)
            .ok_or(ConfigError::UnknownChannel(ctx.channel))?;

        let aux_sensors = mapper.aux_sensors();
        let aux_scales = aux_sensors
            .iter()
            .map(|&s| (s, table.sensor(s).map(|b| b.scale).unwrap_or(1.0)))
            .collect();

        let conditioner = SignalConditioner::new(config.filter, config.envelope_cutoff)?;
        let detector = EventDetector::new(
            PeakCriteria {
                prominence: config.prominence,
                min_height: config.min_height,
                min_width: config.min_width_samples(),
            },
            config.filter.sampling_rate,
        );

        Ok(Self {
            channel: ctx.channel,
            name: binding.name.clone(),
            source: ctx.source,
            scale: binding.scale,
            aux_scales,
            window: ChannelWindow::new(config.window_len()),
            aux: AuxAccumulator::new(&aux_sensors),
            conditioner,
            detector,
            mapper,
            state: ChannelState::default(),
            phase: Phase::Filling,
            idle: config.idle(),
            actions: ctx.actions,
            reports: ctx.reports,
            shutdown: ctx.shutdown,
            sink_gone: false,
            log_dropped: 0,
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    /// Run until shutdown or until the source disconnects. Blocks the calling thread.
    pub fn run(mut self) -> WorkerReport {
        info!(
            "A{} ({}) worker running: window {} samples, aux {:?}",
            self.channel,
            self.name,
            self.window.capacity(),
            self.aux.sensors().collect::<Vec<_>>()
        );

        let exit = loop {
            if self.shutdown.is_triggered() {
                break WorkerExit::Shutdown;
            }
            match self.source.read_timeout(self.channel, self.idle) {
                Ok(Some(sample)) => self.on_sample(sample),
                Ok(None) => continue,
                Err(e) => {
                    error!("A{} ({}) stopped: {}", self.channel, self.name, e);
                    break WorkerExit::Fault(e);
                }
            }
        };

        let report = WorkerReport {
            channel: self.channel,
            windows: self.state.windows,
            forwarded: self.state.forwarded,
            suppressed: self.state.suppressed,
            skipped: self.window.skipped,
            log_dropped: self.log_dropped,
            exit,
        };
        info!(
            "A{} worker exiting: {} windows, {} forwarded, {} suppressed, {} skipped samples, {} log lines dropped",
            report.channel, report.windows, report.forwarded, report.suppressed, report.skipped, report.log_dropped
        );
        report
    }

    fn on_sample(&mut self, sample: Sample) {
        let scaled = Sample {
            value: sample.value * self.scale,
            ..sample
        };
        self.sample_aux();
        if let WindowStatus::Full(snapshot) = self.window.push(Some(scaled)) {
            self.process(snapshot);
        }
    }

    /// Latest reading of every aux sensor, taken in step with the channel's own sample.
    fn sample_aux(&mut self) {
        for &(sensor, scale) in &self.aux_scales {
            // Missing or unavailable aux readings only thin out the mean.
            if let Ok(Some(s)) = self.source.read(sensor) {
                self.aux.add(sensor, s.value * scale);
            }
        }
    }

    /// One full cycle for a completed window. Returns the mapper's decision.
    pub fn process(&mut self, snapshot: WindowSnapshot) -> Decision {
        self.phase = Phase::Conditioning;
        let envelope = match self.conditioner.condition(&snapshot.values) {
            Ok(env) => env,
            Err(e) => {
                // Config validation rules this out; skip the window rather than stall.
                warn!("A{}: {}", self.channel, e);
                Vec::new()
            }
        };

        self.phase = Phase::Detecting;
        let events = self.detector.detect(&envelope, snapshot.start);

        self.phase = Phase::Mapping;
        let means = self.aux.take_means();
        let decision = self.mapper.map(&events, &mut self.state, means, snapshot.end);
        trace!(
            "A{} t={:.3}s: {} events, aux {:?} → {} ({})",
            self.channel,
            snapshot.end,
            events.len(),
            self.state.aux_means,
            decision.decided,
            if decision.forwarded() { "forwarded" } else { "held" }
        );

        if decision.forwarded() {
            self.forward(decision.output, snapshot.end);
        }

        if self.reports.is_some() {
            let report = WindowReport {
                channel: self.channel,
                t: snapshot.end,
                events,
                aux_means: self.state.aux_means.clone(),
                decided: decision.decided,
                forwarded: decision.forwarded(),
            };
            self.log_window(report);
        }

        if self.state.windows % 50 == 0 {
            debug!(
                "A{}: {} windows, {} forwarded, {} suppressed",
                self.channel, self.state.windows, self.state.forwarded, self.state.suppressed
            );
        }

        self.phase = Phase::Filling;
        decision
    }

    fn log_window(&mut self, report: WindowReport) {
        let Some(tx) = &self.reports else {
            return;
        };
        match tx.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(r)) => {
                self.log_dropped += 1;
                debug!("A{}: logger busy, dropping window at t={:.3}s", self.channel, r.t);
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("A{}: session logger is gone; window logging stops", self.channel);
                self.reports = None;
            }
        }
    }

    fn forward(&mut self, action: Action, timestamp: f64) {
        let req = ActionRequest {
            channel: self.channel,
            action,
            timestamp,
        };
        match self.actions.try_send(req) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("A{}: dispatcher busy, dropping {}", self.channel, action);
            }
            Err(TrySendError::Disconnected(_)) => {
                if !self.sink_gone {
                    warn!("A{}: action sink is gone; actions will be dropped", self.channel);
                    self.sink_gone = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::test_helpers::sine_burst;
    use crate::source::board;
    use crossbeam_channel::{bounded, Receiver};

    fn worker(channel: ChannelId) -> (ChannelWorker, Receiver<ActionRequest>) {
        let config = PipelineConfig::default();
        let (_publisher, taps) = board(&[channel], &[3, 4, 5], 16);
        let tap = taps.into_iter().next().unwrap();
        let (tx, rx) = bounded(8);
        let ctx = ChannelContext {
            channel,
            source: Box::new(tap),
            actions: tx,
            reports: None,
            shutdown: Shutdown::new(),
        };
        (ChannelWorker::new(&config, ctx).unwrap(), rx)
    }

    fn snapshot(values: Vec<f64>, start: f64) -> WindowSnapshot {
        let end = start + (values.len().max(1) - 1) as f64 / 500.0;
        WindowSnapshot { values, start, end }
    }

    #[test]
    fn test_burst_window_forwards_channel_action() {
        let (mut w, rx) = worker(0);
        let d = w.process(snapshot(sine_burst(100, 150.0, 10.0, 500.0, 40, 60), 0.0));
        assert_eq!(d.output, Action::TurnLeft);
        let req = rx.try_recv().unwrap();
        assert_eq!(req.channel, 0);
        assert_eq!(req.action, Action::TurnLeft);
        assert_eq!(w.phase(), Phase::Filling);
    }

    #[test]
    fn test_quiet_window_is_neutral() {
        let (mut w, rx) = worker(1);
        let d = w.process(snapshot(vec![0.0; 100], 0.0));
        assert_eq!(d.output, Action::Neutral);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_window_is_neutral() {
        let (mut w, rx) = worker(0);
        let d = w.process(snapshot(Vec::new(), 0.0));
        assert_eq!(d.decided, Action::Neutral);
        assert!(rx.try_recv().is_err());
        assert_eq!(w.state().windows, 1);
    }

    #[test]
    fn test_back_to_back_bursts_dispatch_once() {
        let (mut w, rx) = worker(0);
        let burst = sine_burst(100, 150.0, 10.0, 500.0, 40, 60);
        w.process(snapshot(burst.clone(), 0.0));
        w.process(snapshot(burst, 0.2));
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(w.state().suppressed, 1);
    }

    #[test]
    fn test_disconnect_ends_worker() {
        let config = PipelineConfig::default();
        let (publisher, taps) = board(&[0], &[3], 16);
        let (tx, _rx) = bounded(8);
        let ctx = ChannelContext {
            channel: 0,
            source: Box::new(taps.into_iter().next().unwrap()),
            actions: tx,
            reports: None,
            shutdown: Shutdown::new(),
        };
        let w = ChannelWorker::new(&config, ctx).unwrap();
        drop(publisher);
        let report = w.run();
        assert!(matches!(report.exit, WorkerExit::Fault(SourceError::Disconnected { channel: 0 })));
    }

    #[test]
    fn test_full_logger_queue_counts_dropped_lines() {
        let config = PipelineConfig::default();
        let (publisher, taps) = board(&[1], &[3], 16);
        let (tx, _rx) = bounded(8);
        let (log_tx, log_rx) = bounded(1);
        let ctx = ChannelContext {
            channel: 1,
            source: Box::new(taps.into_iter().next().unwrap()),
            actions: tx,
            reports: Some(log_tx),
            shutdown: Shutdown::new(),
        };
        let mut w = ChannelWorker::new(&config, ctx).unwrap();
        for i in 0..3 {
            w.process(snapshot(vec![0.0; 100], i as f64 * 0.2));
        }
        drop(publisher);
        let report = w.run();
        assert_eq!(log_rx.try_iter().count(), 1);
        assert_eq!(report.windows, 3);
        assert_eq!(report.log_dropped, 2);
    }
}
