//! Action delivery: the single serialized executor between all channel
//! workers and the host input mechanism.
//!
//! Workers never touch the host directly. They send an [`ActionRequest`] to the
//! [`Dispatcher`], which runs each press-hold-release to completion before
//! starting the next, so two key sequences can never interleave.

use crate::types::{Action, ActionRequest, Key, Shutdown};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("key driver failed: {0}")]
    Driver(String),
    /// The key went down but the driver refused the release.
    #[error("{key} was pressed but not released: {source}")]
    Release {
        key: Key,
        #[source]
        source: Box<SinkError>,
    },
}

impl SinkError {
    /// Whether pressing again is safe. A failed release is not: the host
    /// already saw the key go down.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SinkError::Release { .. })
    }
}

/// Host-side key injection.
pub trait KeyDriver: Send {
    fn key_down(&mut self, key: Key) -> Result<(), SinkError>;
    fn key_up(&mut self, key: Key) -> Result<(), SinkError>;
}

/// Logs key events instead of injecting them.
#[derive(Default)]
pub struct LogDriver;

impl KeyDriver for LogDriver {
    fn key_down(&mut self, key: Key) -> Result<(), SinkError> {
        info!("key ▼ {}", key);
        Ok(())
    }

    fn key_up(&mut self, key: Key) -> Result<(), SinkError> {
        info!("key ▲ {}", key);
        Ok(())
    }
}

/// A key held down. Released by `release`, or on drop along any other path
/// (early return, unwinding).
pub struct KeyPress<'a> {
    driver: &'a mut dyn KeyDriver,
    key: Key,
    down: bool,
}

impl<'a> KeyPress<'a> {
    pub fn down(driver: &'a mut dyn KeyDriver, key: Key) -> Result<Self, SinkError> {
        driver.key_down(key)?;
        Ok(Self {
            driver,
            key,
            down: true,
        })
    }

    pub fn release(mut self) -> Result<(), SinkError> {
        self.down = false;
        self.driver.key_up(self.key)
    }
}

impl Drop for KeyPress<'_> {
    fn drop(&mut self) {
        if self.down {
            if let Err(e) = self.driver.key_up(self.key) {
                warn!("Failed to release {}: {}", self.key, e);
            }
        }
    }
}

/// Press-hold-release of one action at a time.
pub struct ActionSink {
    driver: Box<dyn KeyDriver>,
    hold: Duration,
    shutdown: Shutdown,
}

impl ActionSink {
    pub fn new(driver: Box<dyn KeyDriver>, hold: Duration, shutdown: Shutdown) -> Self {
        Self {
            driver,
            hold,
            shutdown,
        }
    }

    /// Press the action's key, hold it, release it. `Neutral` is a no-op.
    /// The hold is cut short by shutdown; the release still happens.
    pub fn dispatch(&mut self, action: Action) -> Result<(), SinkError> {
        let Some(key) = action.key() else {
            return Ok(());
        };
        let press = KeyPress::down(self.driver.as_mut(), key)?;
        self.shutdown.sleep(self.hold);
        press.release().map_err(|e| SinkError::Release {
            key,
            source: Box::new(e),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub retried: u64,
    pub failed: u64,
    pub abandoned: u64,
}

/// Drains action requests from every worker and executes them in arrival order.
pub struct Dispatcher {
    rx: Receiver<ActionRequest>,
    sink: ActionSink,
    shutdown: Shutdown,
}

impl Dispatcher {
    pub fn new(rx: Receiver<ActionRequest>, sink: ActionSink, shutdown: Shutdown) -> Self {
        Self { rx, sink, shutdown }
    }

    /// Run until shutdown or until every worker has hung up. Blocks the calling thread.
    pub fn run(mut self) -> DispatchStats {
        info!("Dispatcher running");
        let mut stats = DispatchStats::default();

        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(req) => self.handle(req, &mut stats),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        stats.abandoned = self.rx.try_iter().count() as u64;
        info!(
            "Dispatcher stopping: {} dispatched, {} retried, {} failed, {} abandoned",
            stats.dispatched, stats.retried, stats.failed, stats.abandoned
        );
        stats
    }

    fn handle(&mut self, req: ActionRequest, stats: &mut DispatchStats) {
        debug!("A{} → {} (t={:.3}s)", req.channel, req.action, req.timestamp);
        match self.sink.dispatch(req.action) {
            Ok(()) => stats.dispatched += 1,
            Err(e) if !e.is_retryable() => {
                warn!("Dropping {} from A{}: {}", req.action, req.channel, e);
                stats.failed += 1;
            }
            Err(first) => {
                warn!("Dispatch of {} from A{} failed: {}; retrying once", req.action, req.channel, first);
                stats.retried += 1;
                match self.sink.dispatch(req.action) {
                    Ok(()) => stats.dispatched += 1,
                    Err(e) => {
                        warn!("Dropping {} from A{}: {}", req.action, req.channel, e);
                        stats.failed += 1;
                    }
                }
            }
        }
    }
}
