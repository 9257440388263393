//! Firmata wire protocol, the subset an analog-sampling host needs.
//!
//! Every message starts with a command byte (high bit set) followed by 7-bit
//! data bytes. Multi-byte values are sent LSB first, 7 bits per byte.
//!
//! | Message            | Bytes                               |
//! |--------------------|-------------------------------------|
//! | analog I/O         | `0xE0\|pin, lsb, msb`               |
//! | digital I/O        | `0x90\|port, lsb, msb`              |
//! | report analog pin  | `0xC0\|pin, 0/1`                    |
//! | report version     | `0xF9, major, minor`                |
//! | sysex              | `0xF0, id, payload…, 0xF7`          |

pub const ANALOG_MESSAGE: u8 = 0xE0;
pub const DIGITAL_MESSAGE: u8 = 0x90;
pub const REPORT_ANALOG: u8 = 0xC0;
pub const REPORT_DIGITAL: u8 = 0xD0;
pub const REPORT_VERSION: u8 = 0xF9;
pub const START_SYSEX: u8 = 0xF0;
pub const END_SYSEX: u8 = 0xF7;
pub const SAMPLING_INTERVAL: u8 = 0x7A;

/// Full-scale reading of the 10-bit ADC.
pub const ANALOG_MAX: u16 = 1023;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmataMessage {
    Analog { pin: u8, value: u16 },
    Digital { port: u8, mask: u16 },
    Version { major: u8, minor: u8 },
    Sysex(Vec<u8>),
}

/// Byte-at-a-time decoder. Tolerates joining mid-stream: stray data bytes
/// are dropped until the next command byte.
#[derive(Debug, Default)]
pub struct FirmataParser {
    command: Option<u8>,
    needed: usize,
    data: Vec<u8>,
    sysex: Option<Vec<u8>>,
}

impl FirmataParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode every complete message in `bytes`.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<FirmataMessage> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }

    pub fn push(&mut self, byte: u8) -> Option<FirmataMessage> {
        if let Some(payload) = self.sysex.as_mut() {
            if byte == END_SYSEX {
                return self.sysex.take().map(FirmataMessage::Sysex);
            }
            if byte & 0x80 == 0 {
                payload.push(byte);
                return None;
            }
            // Unterminated sysex; resynchronise on this command.
            self.sysex = None;
        }

        if byte & 0x80 != 0 {
            self.start(byte);
            return None;
        }

        let command = self.command?;
        self.data.push(byte);
        if self.data.len() < self.needed {
            return None;
        }
        self.command = None;
        let (lo, hi) = (self.data[0], self.data.get(1).copied().unwrap_or(0));
        match command & 0xF0 {
            ANALOG_MESSAGE => Some(FirmataMessage::Analog {
                pin: command & 0x0F,
                value: join7(lo, hi),
            }),
            DIGITAL_MESSAGE => Some(FirmataMessage::Digital {
                port: command & 0x0F,
                mask: join7(lo, hi),
            }),
            _ if command == REPORT_VERSION => Some(FirmataMessage::Version { major: lo, minor: hi }),
            _ => None,
        }
    }

    fn start(&mut self, command: u8) {
        self.data.clear();
        self.command = None;
        if command == START_SYSEX {
            self.sysex = Some(Vec::new());
            return;
        }
        self.needed = match command & 0xF0 {
            ANALOG_MESSAGE | DIGITAL_MESSAGE => 2,
            REPORT_ANALOG | REPORT_DIGITAL => 1,
            0xF0 if command == REPORT_VERSION => 2,
            _ => return,
        };
        self.command = Some(command);
    }
}

fn join7(lsb: u8, msb: u8) -> u16 {
    (lsb as u16 & 0x7F) | ((msb as u16 & 0x7F) << 7)
}

/// Enable or disable streaming of one analog pin.
pub fn report_analog(pin: u8, enable: bool) -> [u8; 2] {
    [REPORT_ANALOG | (pin & 0x0F), enable as u8]
}

/// Set how often the board reports analog pins, in milliseconds.
pub fn sampling_interval(ms: u16) -> [u8; 5] {
    [
        START_SYSEX,
        SAMPLING_INTERVAL,
        (ms & 0x7F) as u8,
        ((ms >> 7) & 0x7F) as u8,
        END_SYSEX,
    ]
}

/// Normalise a raw analog reading to 0.0–1.0.
pub fn normalize(value: u16) -> f64 {
    value.min(ANALOG_MAX) as f64 / ANALOG_MAX as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analog(pin: u8, value: u16) -> [u8; 3] {
        [ANALOG_MESSAGE | pin, (value & 0x7F) as u8, (value >> 7) as u8]
    }

    #[test]
    fn test_analog_message() {
        let mut p = FirmataParser::new();
        assert_eq!(p.feed(&analog(3, 1023)), vec![FirmataMessage::Analog { pin: 3, value: 1023 }]);
        assert_eq!(p.feed(&analog(0, 512)), vec![FirmataMessage::Analog { pin: 0, value: 512 }]);
    }

    #[test]
    fn test_message_split_across_reads() {
        let mut p = FirmataParser::new();
        let bytes = analog(1, 700);
        assert!(p.feed(&bytes[..1]).is_empty());
        assert!(p.feed(&bytes[1..2]).is_empty());
        assert_eq!(p.feed(&bytes[2..]), vec![FirmataMessage::Analog { pin: 1, value: 700 }]);
    }

    #[test]
    fn test_skips_digital_version_and_sysex() {
        let mut p = FirmataParser::new();
        let mut stream = vec![DIGITAL_MESSAGE | 2, 0x05, 0x01];
        stream.extend([REPORT_VERSION, 2, 5]);
        stream.extend([START_SYSEX, 0x79, 2, 5, b'S', 0, END_SYSEX]);
        stream.extend(analog(5, 100));
        let msgs = p.feed(&stream);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0], FirmataMessage::Digital { port: 2, mask: 0x85 });
        assert_eq!(msgs[1], FirmataMessage::Version { major: 2, minor: 5 });
        assert_eq!(msgs[2], FirmataMessage::Sysex(vec![0x79, 2, 5, b'S', 0]));
        assert_eq!(msgs[3], FirmataMessage::Analog { pin: 5, value: 100 });
    }

    #[test]
    fn test_resyncs_mid_stream() {
        let mut p = FirmataParser::new();
        // Joined after the command byte of a previous message
        let mut stream = vec![0x12, 0x34];
        stream.extend(analog(2, 300));
        assert_eq!(p.feed(&stream), vec![FirmataMessage::Analog { pin: 2, value: 300 }]);
    }

    #[test]
    fn test_interrupted_message_is_dropped() {
        let mut p = FirmataParser::new();
        let mut stream = vec![ANALOG_MESSAGE | 4, 0x10];
        stream.extend(analog(4, 9));
        assert_eq!(p.feed(&stream), vec![FirmataMessage::Analog { pin: 4, value: 9 }]);
    }

    #[test]
    fn test_unterminated_sysex_resyncs() {
        let mut p = FirmataParser::new();
        let mut stream = vec![START_SYSEX, 0x71, 0x01];
        stream.extend(analog(0, 42));
        assert_eq!(p.feed(&stream), vec![FirmataMessage::Analog { pin: 0, value: 42 }]);
    }

    #[test]
    fn test_host_commands() {
        assert_eq!(report_analog(3, true), [0xC3, 1]);
        assert_eq!(report_analog(0, false), [0xC0, 0]);
        assert_eq!(sampling_interval(2), [0xF0, 0x7A, 2, 0, 0xF7]);
        assert_eq!(sampling_interval(1000), [0xF0, 0x7A, 0x68, 0x07, 0xF7]);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(0), 0.0);
        assert_eq!(normalize(1023), 1.0);
        assert_eq!(normalize(4000), 1.0);
    }
}
