//! # Milur Meter Protocol
//!
//! Milur electricity meters speak a session-oriented protocol over RS-485:
//!
//! | Command | Request payload | Reply payload |
//! |---------|-----------------|---------------|
//! | 0x08 login | `[access_level, password x6]` | `[access_level]` |
//! | 0x01 read | `[address]` | `[address, size, data ...]` |
//!
//! Data bytes come least significant first. Energy counters are BCD with
//! the nibbles of each byte swapped: decimal 87654321 arrives as
//! `12 34 56 78`.
//!
//! Error replies are `[slave][cmd | 0x80][code][service][CRC lo][CRC hi]`.
//! Code 0x08 means the session was closed.

use tracing::debug;

use crate::error::{SerialError, SerialResult, TransientError};
use crate::port::Port;
use crate::register::MilurKind;
use crate::session::{ErrorClass, SessionDevice, SessionProtocol, SessionRequest};

/// Login command.
pub const CMD_LOGIN: u8 = 0x08;

/// Register read command.
pub const CMD_READ: u8 = 0x01;

/// Error code for a closed session.
pub const ERROR_SESSION_CLOSED: u8 = 0x08;

/// Password length in bytes.
pub const PASSWORD_LEN: usize = 6;

const WAKE_UP: [u8; 1] = [0xFF];

/// Login parameters of a Milur meter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MilurProtocol {
    access_level: u8,
    password: [u8; PASSWORD_LEN],
}

impl MilurProtocol {
    /// Create the protocol for one meter.
    ///
    /// An empty password means the factory default (all `0xFF`); any other
    /// password must be exactly six bytes.
    pub fn new(access_level: u8, password: &[u8]) -> SerialResult<Self> {
        let password = match password.len() {
            0 => [0xFF; PASSWORD_LEN],
            PASSWORD_LEN => {
                let mut bytes = [0u8; PASSWORD_LEN];
                bytes.copy_from_slice(password);
                bytes
            }
            n => {
                return Err(SerialError::config(format!(
                    "invalid password size: {n} bytes, {PASSWORD_LEN} expected"
                )))
            }
        };
        Ok(Self {
            access_level,
            password,
        })
    }

    #[inline]
    pub fn access_level(&self) -> u8 {
        self.access_level
    }
}

impl SessionProtocol for MilurProtocol {
    fn name(&self) -> &'static str {
        "milur"
    }

    fn connection_setup(&self) -> SessionRequest {
        let mut payload = Vec::with_capacity(1 + PASSWORD_LEN);
        payload.push(self.access_level);
        payload.extend_from_slice(&self.password);
        SessionRequest {
            command: CMD_LOGIN,
            payload,
            response_len: 1,
        }
    }

    fn accept_setup(&self, payload: &[u8]) -> bool {
        if payload != [self.access_level] {
            debug!("milur: login answered with access level {:02X?}", payload);
            return false;
        }
        true
    }

    fn classify_error(&self, frame: &[u8]) -> ErrorClass {
        if frame.len() != self.error_frame_len() || frame[1] & 0x80 == 0 {
            return ErrorClass::NoError;
        }
        let code = frame[2];
        let message = error_message(code).to_string();
        match code {
            ERROR_SESSION_CLOSED => ErrorClass::NoOpenSession,
            0x01..=0x03 => ErrorClass::Permanent(message),
            _ => ErrorClass::Other(message),
        }
    }

    fn error_frame_len(&self) -> usize {
        6
    }

    fn wake_up(&self) -> Option<&[u8]> {
        Some(&WAKE_UP)
    }
}

fn error_message(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal function",
        0x02 => "Illegal data address",
        0x03 => "Illegal data value",
        0x04 => "Slave device failure",
        0x05 => "Acknowledge",
        0x06 => "Slave device busy",
        0x07 => "EEPROM access error",
        0x08 => "Session closed",
        0x09 => "Access denied",
        0x0A => "CRC error",
        0x0B => "Frame incorrect",
        0x0C => "Jumper absent",
        0x0D => "Password incorrect",
        _ => "Unknown error",
    }
}

/// Data size of a register type in bytes.
#[inline]
pub fn value_size(kind: MilurKind) -> usize {
    match kind {
        MilurKind::Param => 3,
        MilurKind::Power | MilurKind::Energy => 4,
        MilurKind::Frequency | MilurKind::PowerFactor => 2,
    }
}

/// Little-endian integer of up to 8 bytes.
#[inline]
fn le_value(data: &[u8]) -> u64 {
    data.iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Decode the data bytes of a read reply.
pub fn decode_value(kind: MilurKind, data: &[u8]) -> u64 {
    match kind {
        MilurKind::Energy => {
            let swapped: Vec<u8> = data.iter().map(|b| b.rotate_left(4)).collect();
            le_value(&swapped)
        }
        _ => le_value(data),
    }
}

/// A Milur meter on the bus.
pub type MilurDevice = SessionDevice<MilurProtocol>;

impl SessionDevice<MilurProtocol> {
    /// Read one register.
    pub async fn read_register<P: Port>(&mut self, port: &mut P, kind: MilurKind, address: u32) -> SerialResult<u64> {
        let register = u8::try_from(address)
            .map_err(|_| SerialError::config(format!("milur address {address} out of range")))?;
        let size = value_size(kind);

        let payload = self
            .talk(
                port,
                &SessionRequest {
                    command: CMD_READ,
                    payload: vec![register],
                    response_len: size + 2,
                },
            )
            .await?;

        if payload[0] != register {
            return Err(TransientError::Device {
                message: "bad register address in the response".to_string(),
            }
            .into());
        }
        if usize::from(payload[1]) != size {
            return Err(TransientError::Device {
                message: "bad register size in the response".to_string(),
            }
            .into());
        }
        Ok(decode_value(kind, &payload[2..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;
    use crate::port::{FrameTimeouts, LinkTiming};
    use std::time::Duration;

    const LOGIN_REQUEST: [u8; 11] = [
        0xFF, 0x08, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x5F, 0xED,
    ];
    const LOGIN_REPLY: [u8; 5] = [0xFF, 0x08, 0x01, 0x87, 0xF0];
    const NO_SESSION_REPLY: [u8; 6] = [0xFF, 0x81, 0x08, 0x00, 0x67, 0xD8];

    fn meter() -> MilurDevice {
        let timing = LinkTiming {
            timeouts: FrameTimeouts::new(Duration::from_millis(500), Duration::from_millis(20)),
            guard_interval: Duration::ZERO,
        };
        SessionDevice::new(
            MilurProtocol::new(1, &[]).unwrap(),
            0xFF,
            timing,
            Duration::from_millis(100),
        )
    }

    async fn open_port() -> MockPort {
        let mut port = MockPort::new();
        port.open().await.unwrap();
        port
    }

    #[test]
    fn test_password_size() {
        assert!(MilurProtocol::new(1, &[1, 2, 3]).unwrap_err().is_fatal());
        let protocol = MilurProtocol::new(2, &[2, 3, 4, 5, 6, 7]).unwrap();
        assert_eq!(
            protocol.connection_setup().payload,
            vec![0x02, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]
        );
    }

    #[test]
    fn test_decode_values() {
        assert_eq!(decode_value(MilurKind::Param, &[0x6F, 0x94, 0x03]), 0x03946F);
        assert_eq!(decode_value(MilurKind::Param, &[0xF0, 0xD8, 0xFF]), 0xFFD8F0);
        assert_eq!(
            decode_value(MilurKind::Energy, &[0x44, 0x11, 0x10, 0x00]),
            0x11144
        );
        assert_eq!(decode_value(MilurKind::Frequency, &[0xA0, 0xC3]), 50080);
    }

    #[test]
    fn test_classify_error() {
        let protocol = MilurProtocol::new(1, &[]).unwrap();
        assert_eq!(
            protocol.classify_error(&NO_SESSION_REPLY),
            ErrorClass::NoOpenSession
        );
        assert!(matches!(
            protocol.classify_error(&[0xFF, 0x81, 0x07, 0x00, 0x62, 0x28]),
            ErrorClass::Other(_)
        ));
        assert!(matches!(
            protocol.classify_error(&[0xFF, 0x81, 0x02, 0x00, 0x00, 0x00]),
            ErrorClass::Permanent(_)
        ));
        assert_eq!(protocol.classify_error(&LOGIN_REPLY), ErrorClass::NoError);
    }

    #[tokio::test]
    async fn test_query() {
        let mut port = open_port().await;
        port.reply(LOGIN_REPLY);
        port.reply([0xFF, 0x01, 0x66, 0x03, 0x6F, 0x94, 0x03, 0x03, 0x4E]);
        port.reply([0xFF, 0x01, 0x76, 0x04, 0x44, 0x11, 0x10, 0x00, 0xAC, 0x6C]);

        let mut dev = meter();
        let voltage = dev.read_register(&mut port, MilurKind::Param, 102).await.unwrap();
        assert_eq!(voltage, 0x03946F);
        let energy = dev.read_register(&mut port, MilurKind::Energy, 118).await.unwrap();
        assert_eq!(energy, 0x11144);

        let written = port.written();
        assert_eq!(written[0], LOGIN_REQUEST);
        assert_eq!(written[1], [0xFF, 0x01, 0x66, 0xC0, 0x4A]);
        assert_eq!(written[2], [0xFF, 0x01, 0x76, 0xC1, 0x86]);
    }

    #[tokio::test]
    async fn test_reconnect() {
        let mut port = open_port().await;
        port.reply(LOGIN_REPLY);
        port.reply(NO_SESSION_REPLY);
        port.reply(LOGIN_REPLY);
        port.reply([0xFF, 0x01, 0x66, 0x03, 0x6F, 0x94, 0x03, 0x03, 0x4E]);

        let mut dev = meter();
        let voltage = dev.read_register(&mut port, MilurKind::Param, 102).await.unwrap();
        assert_eq!(voltage, 0x03946F);

        let written = port.written();
        assert_eq!(written.len(), 4);
        assert_eq!(written[2], LOGIN_REQUEST);
    }

    #[tokio::test]
    async fn test_device_error_is_transient() {
        let mut port = open_port().await;
        port.reply(LOGIN_REPLY);
        port.reply([0xFF, 0x81, 0x07, 0x00, 0x62, 0x28]);

        let mut dev = meter();
        let err = dev
            .read_register(&mut port, MilurKind::Param, 102)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!dev.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_sends_wake_up() {
        let mut port = open_port().await;
        let mut dev = meter();
        dev.prepare(&mut port).await.unwrap();

        assert_eq!(port.written(), vec![vec![0xFF]]);
        assert_eq!(port.noise_skips(), 1);
    }
}
