//! # Session-Oriented Devices
//!
//! Some meters only answer after a login handshake and drop the session
//! after a period of silence. [`SessionDevice`] runs the connection state
//! machine for such protocols; the protocol itself only describes its
//! frames through [`SessionProtocol`].
//!
//! ## Frame layout
//!
//! ```text
//! [slave][command][payload ...][CRC lo][CRC hi]
//! ```
//!
//! An error reply sets the high bit of the command byte; what the code
//! means is up to [`SessionProtocol::classify_error`].
//!
//! ## States
//!
//! ```text
//! Disconnected --ensure_connected--> ConnectionSetup --accepted--> Connected
//!       ^                                   |                         |
//!       +------------- failure -------------+---- transient error ----+
//! ```
//!
//! When a connected device reports that no session is open, the request is
//! retried exactly once after a forced reconnect.

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tracing::{debug, info, warn};

use crate::error::{PermanentError, SerialError, SerialResult, TransientError};
use crate::port::{LinkTiming, Port};
use crate::rtu::{append_crc, check_crc};

/// Largest frame a session protocol exchanges.
pub const MAX_SESSION_FRAME: usize = 256;

/// Connection state of a session device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    ConnectionSetup,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::ConnectionSetup => "connection setup",
            Self::Connected => "connected",
        })
    }
}

/// Verdict on a received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    NoError,
    /// Device wants a new handshake
    NoOpenSession,
    /// Device rejected the request; retrying is pointless
    Permanent(String),
    /// Any other error reply
    Other(String),
}

/// One request of a session protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub command: u8,
    pub payload: Vec<u8>,
    /// Payload length of the expected reply
    pub response_len: usize,
}

/// Frame vocabulary of a session-oriented protocol.
pub trait SessionProtocol: Send + Sync {
    /// Protocol name for logs.
    fn name(&self) -> &'static str;

    /// Login request.
    fn connection_setup(&self) -> SessionRequest;

    /// Check the login reply payload.
    fn accept_setup(&self, payload: &[u8]) -> bool;

    /// Classify a frame with a valid CRC and slave id.
    fn classify_error(&self, frame: &[u8]) -> ErrorClass;

    /// Length of a complete error reply.
    fn error_frame_len(&self) -> usize {
        5
    }

    /// Frame sent to wake the bus before talking to this device.
    fn wake_up(&self) -> Option<&[u8]> {
        None
    }
}

/// Connection state machine of one session-oriented slave.
#[derive(Debug)]
pub struct SessionDevice<S> {
    protocol: S,
    slave_id: u8,
    state: SessionState,
    timing: LinkTiming,
    /// Pause after the wake-up frame
    delay: Duration,
}

impl<S: SessionProtocol> SessionDevice<S> {
    pub fn new(protocol: S, slave_id: u8, timing: LinkTiming, delay: Duration) -> Self {
        Self {
            protocol,
            slave_id,
            state: SessionState::Disconnected,
            timing,
            delay,
        }
    }

    #[inline]
    pub fn protocol(&self) -> &S {
        &self.protocol
    }

    #[inline]
    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Forget the session; the next request logs in again.
    pub fn disconnect(&mut self) {
        if self.state != SessionState::Disconnected {
            debug!("{} slave {}: session dropped", self.protocol.name(), self.slave_id);
        }
        self.state = SessionState::Disconnected;
    }

    /// Wake the bus when switching to this device.
    pub async fn prepare<P: Port>(&mut self, port: &mut P) -> SerialResult<()> {
        let Some(frame) = self.protocol.wake_up() else {
            return Ok(());
        };
        port.write_bytes(frame).await?;
        tokio::time::sleep(self.delay).await;
        port.skip_noise().await?;
        Ok(())
    }

    /// Run the login handshake unless a session is already open.
    pub async fn ensure_connected<P: Port>(&mut self, port: &mut P, force: bool) -> SerialResult<()> {
        if self.state == SessionState::Connected && !force {
            return Ok(());
        }

        self.state = SessionState::Disconnected;
        port.skip_noise().await?;
        self.state = SessionState::ConnectionSetup;

        let setup = self.protocol.connection_setup();
        let accepted = match self.exchange(port, &setup).await {
            Ok(Some(payload)) => self.protocol.accept_setup(&payload),
            Ok(None) => false,
            Err(e) => {
                warn!(
                    "{} slave {}: handshake failed: {}",
                    self.protocol.name(),
                    self.slave_id,
                    e
                );
                false
            }
        };

        if !accepted {
            self.state = SessionState::Disconnected;
            return Err(TransientError::SessionSetup {
                message: "failed to establish meter connection".to_string(),
            }
            .into());
        }

        info!("{} slave {}: session open", self.protocol.name(), self.slave_id);
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Send a request and return the reply payload.
    ///
    /// Logs in first if needed. On "no open session" the session is
    /// re-established once and the request resent once. A transient failure
    /// drains the line and drops the session.
    pub async fn talk<P: Port>(&mut self, port: &mut P, request: &SessionRequest) -> SerialResult<Vec<u8>> {
        let result = self.talk_once(port, request).await;
        if let Err(e) = &result {
            if e.is_transient() {
                if let Err(noise) = port.skip_noise().await {
                    debug!("skip_noise after error failed: {}", noise);
                }
                self.disconnect();
            }
        }
        result
    }

    async fn talk_once<P: Port>(&mut self, port: &mut P, request: &SessionRequest) -> SerialResult<Vec<u8>> {
        self.ensure_connected(port, false).await?;
        if let Some(payload) = self.exchange(port, request).await? {
            return Ok(payload);
        }

        debug!(
            "{} slave {}: no open session, reconnecting",
            self.protocol.name(),
            self.slave_id
        );
        self.ensure_connected(port, true).await?;
        self.exchange(port, request)
            .await?
            .ok_or_else(|| TransientError::NoOpenSession.into())
    }

    async fn exchange<P: Port>(&mut self, port: &mut P, request: &SessionRequest) -> SerialResult<Option<Vec<u8>>> {
        self.write_command(port, request.command, &request.payload).await?;
        self.read_response(port, request.command, request.response_len)
            .await
    }

    /// Send `[slave][command][payload][crc]`.
    pub async fn write_command<P: Port>(&mut self, port: &mut P, command: u8, payload: &[u8]) -> SerialResult<()> {
        let mut frame = BytesMut::with_capacity(payload.len() + 4);
        frame.put_u8(self.slave_id);
        frame.put_u8(command);
        frame.put_slice(payload);
        append_crc(&mut frame);

        self.timing.guard().await;
        port.write_bytes(&frame).await
    }

    /// Read and validate a reply.
    ///
    /// Returns `Ok(None)` when the device reports that no session is open.
    pub async fn read_response<P: Port>(
        &mut self,
        port: &mut P,
        expected_command: u8,
        expected_len: usize,
    ) -> SerialResult<Option<Vec<u8>>> {
        let mut buf = [0u8; MAX_SESSION_FRAME];
        let error_len = self.protocol.error_frame_len();
        let complete = move |frame: &[u8]| {
            if frame.len() >= 2 && frame[1] & 0x80 != 0 {
                frame.len() >= error_len
            } else {
                frame.len() >= expected_len + 4
            }
        };
        let n = port
            .read_frame(&mut buf, self.timing.timeouts, complete)
            .await?;
        let frame = &buf[..n];

        if n < 4 {
            return Err(SerialError::malformed("frame too short"));
        }
        check_crc(frame)?;
        if frame[0] != self.slave_id {
            return Err(TransientError::SlaveMismatch {
                expected: self.slave_id,
                actual: frame[0],
            }
            .into());
        }

        match self.protocol.classify_error(frame) {
            ErrorClass::NoError => {}
            ErrorClass::NoOpenSession => return Ok(None),
            ErrorClass::Permanent(message) => {
                return Err(PermanentError::Rejected { message }.into())
            }
            ErrorClass::Other(message) => return Err(TransientError::Device { message }.into()),
        }

        if frame[1] != expected_command {
            return Err(TransientError::FunctionMismatch {
                expected: expected_command,
                actual: frame[1],
            }
            .into());
        }
        let payload = &frame[2..n - 2];
        if payload.len() != expected_len {
            return Err(SerialError::malformed(format!(
                "unexpected frame size: payload {} bytes, expected {}",
                payload.len(),
                expected_len
            )));
        }
        Ok(Some(payload.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;
    use crate::port::FrameTimeouts;

    const LOGIN: u8 = 0x08;
    const READ: u8 = 0x01;

    /// Minimal protocol: error replies carry code 0x08 for "no session",
    /// 0x02 for a rejected request.
    struct TestProtocol;

    impl SessionProtocol for TestProtocol {
        fn name(&self) -> &'static str {
            "test"
        }

        fn connection_setup(&self) -> SessionRequest {
            SessionRequest {
                command: LOGIN,
                payload: vec![0x01],
                response_len: 1,
            }
        }

        fn accept_setup(&self, payload: &[u8]) -> bool {
            payload == [0x01]
        }

        fn classify_error(&self, frame: &[u8]) -> ErrorClass {
            if frame[1] & 0x80 == 0 {
                return ErrorClass::NoError;
            }
            match frame[2] {
                0x08 => ErrorClass::NoOpenSession,
                0x02 => ErrorClass::Permanent("bad address".to_string()),
                code => ErrorClass::Other(format!("code {code}")),
            }
        }
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut frame = BytesMut::from(body);
        append_crc(&mut frame);
        frame.to_vec()
    }

    fn device() -> SessionDevice<TestProtocol> {
        let timing = LinkTiming {
            timeouts: FrameTimeouts::new(Duration::from_millis(100), Duration::from_millis(10)),
            guard_interval: Duration::ZERO,
        };
        SessionDevice::new(TestProtocol, 7, timing, Duration::from_millis(5))
    }

    async fn open_port() -> MockPort {
        let mut port = MockPort::new();
        port.open().await.unwrap();
        port
    }

    fn read_request() -> SessionRequest {
        SessionRequest {
            command: READ,
            payload: vec![0x10],
            response_len: 2,
        }
    }

    #[tokio::test]
    async fn test_login_then_read() {
        let mut port = open_port().await;
        port.reply(frame(&[7, LOGIN, 0x01]));
        port.reply(frame(&[7, READ, 0xAB, 0xCD]));

        let mut dev = device();
        let payload = dev.talk(&mut port, &read_request()).await.unwrap();
        assert_eq!(payload, vec![0xAB, 0xCD]);
        assert!(dev.is_connected());

        let written = port.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0], frame(&[7, LOGIN, 0x01]));
        assert_eq!(written[1], frame(&[7, READ, 0x10]));
    }

    #[tokio::test]
    async fn test_reconnect_on_no_session() {
        let mut port = open_port().await;
        port.reply(frame(&[7, LOGIN, 0x01]));
        port.reply(frame(&[7, READ | 0x80, 0x08]));
        port.reply(frame(&[7, LOGIN, 0x01]));
        port.reply(frame(&[7, READ, 0x00, 0x2A]));

        let mut dev = device();
        let payload = dev.talk(&mut port, &read_request()).await.unwrap();
        assert_eq!(payload, vec![0x00, 0x2A]);

        let commands: Vec<u8> = port.written().iter().map(|f| f[1]).collect();
        assert_eq!(commands, vec![LOGIN, READ, LOGIN, READ]);
    }

    #[tokio::test]
    async fn test_second_no_session_is_final() {
        let mut port = open_port().await;
        port.reply(frame(&[7, LOGIN, 0x01]));
        port.reply(frame(&[7, READ | 0x80, 0x08]));
        port.reply(frame(&[7, LOGIN, 0x01]));
        port.reply(frame(&[7, READ | 0x80, 0x08]));

        let mut dev = device();
        let err = dev.talk(&mut port, &read_request()).await.unwrap_err();
        assert_eq!(err, SerialError::Transient(TransientError::NoOpenSession));
        assert!(!dev.is_connected());

        // exactly one forced reconnect and one resend
        let commands: Vec<u8> = port.written().iter().map(|f| f[1]).collect();
        assert_eq!(commands, vec![LOGIN, READ, LOGIN, READ]);
    }

    #[tokio::test]
    async fn test_failed_login() {
        let mut port = open_port().await;
        port.reply(frame(&[7, LOGIN, 0x00]));

        let mut dev = device();
        let err = dev.talk(&mut port, &read_request()).await.unwrap_err();
        assert!(matches!(
            err,
            SerialError::Transient(TransientError::SessionSetup { .. })
        ));
        assert_eq!(dev.state(), SessionState::Disconnected);
        assert_eq!(port.written().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_rejection_keeps_session() {
        let mut port = open_port().await;
        port.reply(frame(&[7, LOGIN, 0x01]));
        port.reply(frame(&[7, READ | 0x80, 0x02]));

        let mut dev = device();
        let err = dev.talk(&mut port, &read_request()).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(dev.is_connected());
    }

    #[tokio::test]
    async fn test_response_checks() {
        let mut port = open_port().await;
        let mut dev = device();

        port.reply(vec![7, READ, 0x00]);
        let err = dev.read_response(&mut port, READ, 2).await.unwrap_err();
        assert_eq!(err, SerialError::malformed("frame too short"));

        let mut bad = frame(&[7, READ, 0x00, 0x2A]);
        bad[2] ^= 0x01;
        port.reply(bad);
        let err = dev.read_response(&mut port, READ, 2).await.unwrap_err();
        assert!(matches!(
            err,
            SerialError::Transient(TransientError::InvalidCrc { .. })
        ));

        port.reply(frame(&[8, READ, 0x00, 0x2A]));
        let err = dev.read_response(&mut port, READ, 2).await.unwrap_err();
        assert!(matches!(
            err,
            SerialError::Transient(TransientError::SlaveMismatch { .. })
        ));

        port.reply(frame(&[7, 0x02, 0x00, 0x2A]));
        let err = dev.read_response(&mut port, READ, 2).await.unwrap_err();
        assert!(matches!(
            err,
            SerialError::Transient(TransientError::FunctionMismatch { .. })
        ));

        port.reply(frame(&[7, READ, 0x00]));
        let err = dev.read_response(&mut port, READ, 2).await.unwrap_err();
        assert!(matches!(
            err,
            SerialError::Transient(TransientError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_drops_session() {
        let mut port = open_port().await;
        port.reply(frame(&[7, LOGIN, 0x01]));

        let mut dev = device();
        let err = dev.talk(&mut port, &read_request()).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!dev.is_connected());
        assert!(port.noise_skips() >= 2);
    }
}
