use crate::firmata::{self, FirmataMessage, FirmataParser};
use crate::source::{BoardPublisher, SourceError};
use crate::types::*;
use log::{debug, error, info};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Firmata's StandardFirmata baud rate.
pub const BAUD_RATE: u32 = 57600;

/// Reads analog pins from a Firmata board and publishes them on the board hub.
///
/// Readings are published normalised to 0.0–1.0; channel scaling happens in
/// the workers. Any read error other than a timeout ends the reader, and the
/// dropped publisher surfaces as a disconnect in every worker.
pub struct SerialReader {
    port_name: String,
    pins: Vec<u8>,
    interval_ms: u16,
    publisher: BoardPublisher,
    clock: SessionClock,
    shutdown: Shutdown,
}

impl SerialReader {
    pub fn new(port_name: String, publisher: BoardPublisher, clock: SessionClock, shutdown: Shutdown) -> Self {
        let pins = publisher.pins();
        Self {
            port_name,
            pins,
            interval_ms: 2,
            publisher,
            clock,
            shutdown,
        }
    }

    /// Board-side sampling interval, normally `1000 / sampling_rate`.
    pub fn with_interval_ms(mut self, ms: u16) -> Self {
        self.interval_ms = ms.max(1);
        self
    }

    /// Run the serial reader loop. Blocks the calling thread.
    pub fn run(self) -> Result<(), SourceError> {
        info!("Opening serial port: {} @ {}", self.port_name, BAUD_RATE);

        let mut port = serialport::new(&self.port_name, BAUD_RATE)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| {
                error!("Failed to open serial port {}: {}", self.port_name, e);
                error!("Is the board running StandardFirmata? Run with --simulate for dev mode.");
                SourceError::Io(e.to_string())
            })?;

        let mut setup = firmata::sampling_interval(self.interval_ms).to_vec();
        for &pin in &self.pins {
            setup.extend(firmata::report_analog(pin, true));
        }
        port.write_all(&setup).map_err(|e| SourceError::Io(e.to_string()))?;
        info!(
            "Serial port opened. Reporting pins {:?} every {}ms",
            self.pins, self.interval_ms
        );

        let mut parser = FirmataParser::new();
        let mut buf = [0u8; 256];
        let mut count: u64 = 0;

        let result = loop {
            if self.shutdown.is_triggered() {
                break Ok(());
            }
            match port.read(&mut buf) {
                Ok(n) => {
                    for msg in parser.feed(&buf[..n]) {
                        match msg {
                            FirmataMessage::Analog { pin, value } if self.pins.contains(&pin) => {
                                let ts = self.clock.now_secs();
                                self.publisher.publish(Sample::new(pin, firmata::normalize(value), ts));
                                count += 1;
                                if count.is_multiple_of(5000) {
                                    info!("Serial: {} readings, {} dropped", count, self.publisher.overruns());
                                }
                            }
                            FirmataMessage::Version { major, minor } => {
                                info!("Firmata protocol version {}.{}", major, minor);
                            }
                            other => debug!("Serial: ignoring {:?}", other),
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    error!("Serial read error on {}: {}", self.port_name, e);
                    break Err(SourceError::Io(e.to_string()));
                }
            }
        };

        // Best effort: stop the board streaming before the port closes.
        let mut teardown = Vec::new();
        for &pin in &self.pins {
            teardown.extend(firmata::report_analog(pin, false));
        }
        let _ = port.write_all(&teardown);

        info!("Serial reader stopping after {} readings", count);
        result
    }
}
