use crate::config::{ConfigError, PipelineConfig};
use crate::sink::{ActionSink, DispatchStats, Dispatcher, KeyDriver};
use crate::source::{board, BoardPublisher, BoardTap, SampleSource};
use crate::types::*;
use crate::worker::{ChannelContext, ChannelWorker, WorkerExit, WorkerReport};
use crossbeam_channel::{bounded, Sender};
use log::{error, info, warn};
use std::io;
use std::thread::{self, JoinHandle};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no source for channel A{0}")]
    MissingSource(ChannelId),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Owns the validated configuration and wires workers, sources and the
/// dispatcher together.
///
/// One worker thread per configured channel, one dispatcher thread shared by
/// all of them. Workers only ever talk to the dispatcher through a bounded
/// queue, so a slow key driver never stalls sample intake.
pub struct Coordinator {
    config: PipelineConfig,
    shutdown: Shutdown,
}

impl Coordinator {
    /// Fails fast on an invalid configuration, before anything is spawned.
    pub fn new(config: PipelineConfig, shutdown: Shutdown) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, shutdown })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Board hub sized for this configuration: one queue per channel,
    /// one register per auxiliary sensor.
    pub fn board(&self) -> (BoardPublisher, Vec<BoardTap>) {
        let table = &self.config.action_table;
        let streamed: Vec<ChannelId> = table.channels.iter().map(|c| c.channel).collect();
        let sampled: Vec<SensorId> = table.sensors.iter().map(|s| s.sensor).collect();
        board(&streamed, &sampled, self.config.queue_capacity)
    }

    /// Start a worker for every configured channel and the dispatcher.
    /// `sources` must hold one source per channel.
    pub fn start(
        &self,
        sources: Vec<(ChannelId, Box<dyn SampleSource>)>,
        driver: Box<dyn KeyDriver>,
        reports: Option<Sender<WindowReport>>,
    ) -> Result<Running, PipelineError> {
        let mut sources = sources;
        let (action_tx, action_rx) = bounded::<ActionRequest>(self.config.queue_capacity);

        let mut prepared = Vec::new();
        for binding in &self.config.action_table.channels {
            let pos = sources
                .iter()
                .position(|(c, _)| *c == binding.channel)
                .ok_or(PipelineError::MissingSource(binding.channel))?;
            let (channel, source) = sources.swap_remove(pos);
            let ctx = ChannelContext {
                channel,
                source,
                actions: action_tx.clone(),
                reports: reports.clone(),
                shutdown: self.shutdown.clone(),
            };
            prepared.push(ChannelWorker::new(&self.config, ctx)?);
        }

        let mut workers = Vec::new();
        for worker in prepared {
            let channel = worker.channel();
            let handle = thread::Builder::new()
                .name(format!("worker-A{}", channel))
                .spawn(move || worker.run())?;
            workers.push((channel, handle));
        }
        // Dispatcher sees a disconnect once every worker has exited.
        drop(action_tx);

        let sink = ActionSink::new(driver, self.config.hold(), self.shutdown.clone());
        let dispatcher = Dispatcher::new(action_rx, sink, self.shutdown.clone());
        let dispatcher = thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || dispatcher.run())?;

        info!("Pipeline started: {} channel workers", workers.len());
        Ok(Running {
            workers,
            dispatcher,
            shutdown: self.shutdown.clone(),
        })
    }

    /// [`start`](Self::start) with every worker reading from a board tap.
    pub fn start_on_board(
        &self,
        taps: Vec<BoardTap>,
        driver: Box<dyn KeyDriver>,
        reports: Option<Sender<WindowReport>>,
    ) -> Result<Running, PipelineError> {
        let sources = taps
            .into_iter()
            .map(|t| (t.channel(), Box::new(t) as Box<dyn SampleSource>))
            .collect();
        self.start(sources, driver, reports)
    }
}

/// What a run produced, per channel and for the sink.
#[derive(Debug)]
pub struct RunReport {
    pub workers: Vec<WorkerReport>,
    pub dispatch: DispatchStats,
}

impl RunReport {
    pub fn worker(&self, channel: ChannelId) -> Option<&WorkerReport> {
        self.workers.iter().find(|w| w.channel == channel)
    }
}

/// Handles of a started pipeline.
pub struct Running {
    workers: Vec<(ChannelId, JoinHandle<WorkerReport>)>,
    dispatcher: JoinHandle<DispatchStats>,
    shutdown: Shutdown,
}

impl Running {
    /// Ask every thread to stop. Keys held by the sink are still released.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    /// True once every worker has exited (shutdown, or all sources gone).
    pub fn workers_finished(&self) -> bool {
        self.workers.iter().all(|(_, h)| h.is_finished())
    }

    /// Wait for every thread. Returns once workers have stopped and the
    /// dispatcher has drained or been shut down.
    pub fn join(self) -> RunReport {
        let mut reports = Vec::with_capacity(self.workers.len());
        for (channel, handle) in self.workers {
            match handle.join() {
                Ok(report) => reports.push(report),
                Err(_) => {
                    error!("A{} worker panicked", channel);
                    reports.push(WorkerReport {
                        channel,
                        windows: 0,
                        forwarded: 0,
                        suppressed: 0,
                        skipped: 0,
                        log_dropped: 0,
                        exit: WorkerExit::Panicked,
                    });
                }
            }
        }

        let faulted = reports
            .iter()
            .filter(|r| !matches!(r.exit, WorkerExit::Shutdown))
            .count();
        if faulted > 0 {
            warn!("{} of {} channel workers stopped on a fault", faulted, reports.len());
        }

        let dispatch = self.dispatcher.join().unwrap_or_else(|_| {
            error!("Dispatcher panicked");
            DispatchStats::default()
        });

        RunReport {
            workers: reports,
            dispatch,
        }
    }
}
