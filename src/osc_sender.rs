use crate::sink::{KeyDriver, SinkError};
use crate::types::Key;
use log::{debug, info};
use rosc::{OscMessage, OscPacket, OscType};
use std::net::UdpSocket;

/// Delivers key events to an external application over OSC.
///
/// Each press sends `/emg/key/<key> 1.0`, each release `/emg/key/<key> 0.0`.
pub struct OscSender {
    socket: UdpSocket,
    target: String,
}

impl OscSender {
    pub fn new(target: String) -> Result<Self, SinkError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| SinkError::Driver(format!("bind UDP socket: {}", e)))?;
        info!("OSC key driver → {}", target);
        Ok(Self { socket, target })
    }

    fn send_float(&self, addr: &str, val: f32) -> Result<(), SinkError> {
        let buf = encode_key(addr, val)?;
        self.socket
            .send_to(&buf, &self.target)
            .map_err(|e| SinkError::Driver(format!("OSC send to {}: {}", self.target, e)))?;
        debug!("OSC {} {}", addr, val);
        Ok(())
    }
}

pub fn key_address(key: Key) -> String {
    format!("/emg/key/{}", key.name())
}

fn encode_key(addr: &str, val: f32) -> Result<Vec<u8>, SinkError> {
    let msg = OscPacket::Message(OscMessage {
        addr: addr.to_string(),
        args: vec![OscType::Float(val)],
    });
    rosc::encoder::encode(&msg).map_err(|e| SinkError::Driver(format!("OSC encode: {:?}", e)))
}

impl KeyDriver for OscSender {
    fn key_down(&mut self, key: Key) -> Result<(), SinkError> {
        self.send_float(&key_address(key), 1.0)
    }

    fn key_up(&mut self, key: Key) -> Result<(), SinkError> {
        self.send_float(&key_address(key), 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recv_message(socket: &UdpSocket) -> OscMessage {
        let mut buf = [0u8; 256];
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        match rosc::decoder::decode_udp(&buf[..n]).unwrap().1 {
            OscPacket::Message(m) => m,
            OscPacket::Bundle(_) => panic!("expected a message"),
        }
    }

    #[test]
    fn test_key_address() {
        assert_eq!(key_address(Key::Space), format!("/emg/key/{}", Key::Space.name()));
    }

    #[test]
    fn test_press_and_release_reach_target() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let target = listener.local_addr().unwrap().to_string();

        let mut driver = OscSender::new(target).unwrap();
        driver.key_down(Key::W).unwrap();
        driver.key_up(Key::W).unwrap();

        let down = recv_message(&listener);
        assert_eq!(down.addr, key_address(Key::W));
        assert_eq!(down.args, vec![OscType::Float(1.0)]);
        let up = recv_message(&listener);
        assert_eq!(up.args, vec![OscType::Float(0.0)]);
    }
}
