//! Sample acquisition boundary.
//!
//! Workers read through [`SampleSource`]. The production implementation is a
//! [`Board`]: one acquisition thread (serial reader or simulator) publishes
//! readings through a [`BoardPublisher`], and each worker holds a [`BoardTap`].
//!
//! Streamed pins (EMG electrodes) get a bounded queue per pin, so every sample
//! is consumed exactly once by its worker. Sampled pins (flex sensors) keep only
//! their latest value, which any worker can read alongside its own samples.

use crate::types::{ChannelId, Sample};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source for A{channel} disconnected")]
    Disconnected { channel: ChannelId },
    #[error("source I/O error: {0}")]
    Io(String),
}

pub trait SampleSource: Send {
    /// Next reading for `channel`, or `Ok(None)` if nothing new is available yet.
    fn read(&mut self, channel: ChannelId) -> Result<Option<Sample>, SourceError>;

    /// Like `read`, but may wait up to `timeout` for a value to arrive.
    fn read_timeout(&mut self, channel: ChannelId, timeout: Duration) -> Result<Option<Sample>, SourceError> {
        let sample = self.read(channel)?;
        if sample.is_none() {
            std::thread::sleep(timeout);
        }
        Ok(sample)
    }
}

/// Latest value of every sampled pin, shared by publisher and taps.
#[derive(Default)]
struct Registers {
    latest: Mutex<HashMap<u8, Sample>>,
    closed: AtomicBool,
    overruns: AtomicU64,
}

/// Write side of the board, owned by the acquisition thread.
/// Dropping it disconnects every tap.
pub struct BoardPublisher {
    streams: HashMap<ChannelId, Sender<Sample>>,
    registers: Arc<Registers>,
}

impl BoardPublisher {
    /// Route one reading. Unknown pins are ignored; a full queue drops the sample.
    pub fn publish(&self, sample: Sample) {
        if let Some(tx) = self.streams.get(&sample.channel) {
            match tx.try_send(sample) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let n = self.registers.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                    if n.is_power_of_two() {
                        debug!("Board: A{} queue full, {} samples dropped so far", sample.channel, n);
                    }
                }
                // Worker already gone (fatal fault on that channel); keep feeding the rest.
                Err(TrySendError::Disconnected(_)) => {}
            }
            return;
        }
        if let Ok(mut latest) = self.registers.latest.lock() {
            if latest.contains_key(&sample.channel) {
                latest.insert(sample.channel, sample);
            }
        }
    }

    /// Samples dropped because a worker fell behind.
    pub fn overruns(&self) -> u64 {
        self.registers.overruns.load(Ordering::Relaxed)
    }

    /// Samples queued but not yet taken by the slowest worker.
    pub fn backlog(&self) -> usize {
        self.streams.values().map(|tx| tx.len()).max().unwrap_or(0)
    }

    /// Every pin this board routes, streamed first.
    pub fn pins(&self) -> Vec<u8> {
        let mut pins: Vec<u8> = self.streams.keys().copied().collect();
        pins.sort_unstable();
        if let Ok(latest) = self.registers.latest.lock() {
            let mut sampled: Vec<u8> = latest.keys().copied().collect();
            sampled.sort_unstable();
            pins.extend(sampled);
        }
        pins
    }
}

impl Drop for BoardPublisher {
    fn drop(&mut self) {
        self.registers.closed.store(true, Ordering::SeqCst);
    }
}

/// Read side of the board for one streamed channel.
pub struct BoardTap {
    channel: ChannelId,
    rx: Receiver<Sample>,
    registers: Arc<Registers>,
}

impl BoardTap {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    fn read_register(&self, pin: u8) -> Result<Option<Sample>, SourceError> {
        if self.registers.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Disconnected { channel: pin });
        }
        let latest = self
            .registers
            .latest
            .lock()
            .map_err(|_| SourceError::Io("register lock poisoned".into()))?;
        Ok(latest.get(&pin).copied().filter(|s| s.timestamp >= 0.0))
    }
}

impl SampleSource for BoardTap {
    fn read(&mut self, channel: ChannelId) -> Result<Option<Sample>, SourceError> {
        if channel != self.channel {
            return self.read_register(channel);
        }
        match self.rx.try_recv() {
            Ok(s) => Ok(Some(s)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SourceError::Disconnected { channel }),
        }
    }

    fn read_timeout(&mut self, channel: ChannelId, timeout: Duration) -> Result<Option<Sample>, SourceError> {
        if channel != self.channel {
            return self.read_register(channel);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(s) => Ok(Some(s)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SourceError::Disconnected { channel }),
        }
    }
}

/// Build a board with one queue per streamed channel and a register per sampled pin.
/// Returns the publisher and one tap per streamed channel, in the given order.
pub fn board(streamed: &[ChannelId], sampled: &[u8], capacity: usize) -> (BoardPublisher, Vec<BoardTap>) {
    let registers = Arc::new(Registers::default());
    if let Ok(mut latest) = registers.latest.lock() {
        for &pin in sampled {
            // Negative timestamp marks "never reported".
            latest.insert(pin, Sample::new(pin, 0.0, -1.0));
        }
    }

    let mut streams = HashMap::new();
    let mut taps = Vec::with_capacity(streamed.len());
    for &channel in streamed {
        let (tx, rx) = bounded(capacity);
        streams.insert(channel, tx);
        taps.push(BoardTap {
            channel,
            rx,
            registers: Arc::clone(&registers),
        });
    }

    (BoardPublisher { streams, registers }, taps)
}
