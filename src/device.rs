//! # Devices
//!
//! A [`Device`] is one slave on the port. It hides the protocol behind the
//! contract the scheduler relies on:
//!
//! | Operation | Meaning |
//! |-----------|---------|
//! | [`Device::prepare`] | bus is switching to this device |
//! | [`Device::read_range`] | read one range into the register arena |
//! | [`Device::write_registers`] | write consecutive registers |
//! | [`Device::end_poll_cycle`] | cycle finished, update connection tracking |
//!
//! ## Connection tracking
//!
//! A device counts as disconnected after a transient failure or after
//! `device_timeout` without a successful exchange. The next success marks it
//! connected again and the device's setup items are written before anything
//! else.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::MAX_ADU_SIZE;
use crate::device_limits::DeviceLimits;
use crate::error::{SerialError, SerialResult, TransientError};
use crate::milur::MilurDevice;
use crate::pdu::{read_request, unpack_bits, unpack_words, write_echo, write_request, ModbusFunction};
use crate::port::{LinkTiming, Port};
use crate::range::RegisterRange;
use crate::register::{DeviceId, ModbusKind, RegisterArena, RegisterKind};
use crate::rtu::{compose_adu, expected_response_len, frame_complete, parse_response, RtuResponse};

// ============================================================================
// Modbus RTU device
// ============================================================================

/// A Modbus RTU slave.
#[derive(Debug, Clone)]
pub struct ModbusDevice {
    slave_id: u8,
    timing: LinkTiming,
    /// Pause when the bus switches to this device
    delay: Duration,
}

impl ModbusDevice {
    pub fn new(slave_id: u8, timing: LinkTiming, delay: Duration) -> Self {
        Self {
            slave_id,
            timing,
            delay,
        }
    }

    #[inline]
    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    /// Wait out the device-switch delay.
    pub async fn prepare(&mut self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    /// Read `count` consecutive registers.
    pub async fn read<P: Port>(
        &mut self,
        port: &mut P,
        kind: ModbusKind,
        start_address: u32,
        count: u16,
    ) -> SerialResult<Vec<u64>> {
        let function = ModbusFunction::for_read(kind);
        let pdu = read_request(kind, start_address, count)?;
        let adu = compose_adu(self.slave_id, &pdu);
        let slave_id = self.slave_id;

        self.transact(port, &adu, function, count, |response| match response {
            RtuResponse::Read(data) if function.is_bit_access() => {
                Ok(unpack_bits(data, usize::from(count)))
            }
            RtuResponse::Read(data) => Ok(unpack_words(data, usize::from(count))),
            RtuResponse::Write { .. } => Err(SerialError::malformed(format!(
                "slave {slave_id}: write echo in reply to a read"
            ))),
        })
        .await
    }

    /// Write consecutive registers and check the echo.
    pub async fn write<P: Port>(
        &mut self,
        port: &mut P,
        kind: ModbusKind,
        start_address: u32,
        values: &[u64],
    ) -> SerialResult<()> {
        let function = ModbusFunction::for_write(kind, values.len())?;
        let pdu = write_request(kind, start_address, values)?;
        let echo = write_echo(kind, start_address, values)?;
        let adu = compose_adu(self.slave_id, &pdu);

        self.transact(port, &adu, function, 0, |response| match response {
            RtuResponse::Write { address, value } if [address, value] == echo => Ok(()),
            RtuResponse::Write { address, value } => Err(SerialError::malformed(format!(
                "write echo {address}/{value:#06X}, expected {}/{:#06X}",
                echo[0], echo[1]
            ))),
            RtuResponse::Read(_) => Err(SerialError::malformed("read payload in reply to a write")),
        })
        .await
    }

    async fn transact<P, T, F>(
        &mut self,
        port: &mut P,
        adu: &[u8],
        function: ModbusFunction,
        count: u16,
        handle: F,
    ) -> SerialResult<T>
    where
        P: Port,
        F: FnOnce(RtuResponse<'_>) -> SerialResult<T>,
    {
        let result = self.exchange(port, adu, function, count, handle).await;
        if let Err(e) = &result {
            if e.is_transient() {
                if let Err(noise) = port.skip_noise().await {
                    debug!("skip_noise after error failed: {}", noise);
                }
            }
        }
        result
    }

    async fn exchange<P, T, F>(
        &mut self,
        port: &mut P,
        adu: &[u8],
        function: ModbusFunction,
        count: u16,
        handle: F,
    ) -> SerialResult<T>
    where
        P: Port,
        F: FnOnce(RtuResponse<'_>) -> SerialResult<T>,
    {
        port.check_open()?;
        self.timing.guard().await;
        port.write_bytes(adu).await?;

        let mut buf = [0u8; MAX_ADU_SIZE];
        let complete = frame_complete(expected_response_len(function, count));
        let n = port
            .read_frame(&mut buf, self.timing.timeouts, complete)
            .await?;
        let response = parse_response(self.slave_id, function, count, &buf[..n])?;
        handle(response)
    }
}

// ============================================================================
// Protocol dispatch
// ============================================================================

/// Protocol engine of a device.
#[derive(Debug)]
pub enum DeviceProtocol {
    Modbus(ModbusDevice),
    Milur(MilurDevice),
}

impl DeviceProtocol {
    /// Protocol name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Modbus(_) => "modbus",
            Self::Milur(_) => "milur",
        }
    }
}

/// A register written after each (re)connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupItem {
    pub name: String,
    pub kind: RegisterKind,
    pub address: u32,
    pub value: u64,
}

/// Reachability of a device as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not talked to yet
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        })
    }
}

/// One slave on the port.
#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    name: String,
    protocol: DeviceProtocol,
    limits: DeviceLimits,
    setup: Vec<SetupItem>,
    device_timeout: Duration,
    connection: ConnectionState,
    last_success: Option<Instant>,
    needs_setup: bool,
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>, protocol: DeviceProtocol, limits: DeviceLimits) -> Self {
        Self {
            id,
            name: name.into(),
            protocol,
            limits,
            setup: Vec::new(),
            device_timeout: crate::constants::DEFAULT_DEVICE_TIMEOUT,
            connection: ConnectionState::Unknown,
            last_success: None,
            needs_setup: true,
        }
    }

    /// Set the registers written after each connection.
    pub fn with_setup(mut self, setup: Vec<SetupItem>) -> Self {
        self.setup = setup;
        self
    }

    /// Set the silence after which the device counts as disconnected.
    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    #[inline]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn protocol(&self) -> &DeviceProtocol {
        &self.protocol
    }

    #[inline]
    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    #[inline]
    pub fn setup_items(&self) -> &[SetupItem] {
        &self.setup
    }

    #[inline]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// Slave id on the bus.
    pub fn slave_id(&self) -> u8 {
        match &self.protocol {
            DeviceProtocol::Modbus(dev) => dev.slave_id(),
            DeviceProtocol::Milur(dev) => dev.slave_id(),
        }
    }

    /// Called when the bus switches to this device.
    pub async fn prepare<P: Port>(&mut self, port: &mut P) -> SerialResult<()> {
        match &mut self.protocol {
            DeviceProtocol::Modbus(dev) => {
                dev.prepare().await;
                Ok(())
            }
            DeviceProtocol::Milur(dev) => dev.prepare(port).await,
        }
    }

    /// Read a range and store the requested registers in the arena.
    pub async fn read_range<P: Port>(
        &mut self,
        port: &mut P,
        range: &RegisterRange,
        arena: &mut RegisterArena,
    ) -> SerialResult<()> {
        let result = self.read_range_inner(port, range, arena).await;
        self.track(&result);
        result
    }

    async fn read_range_inner<P: Port>(
        &mut self,
        port: &mut P,
        range: &RegisterRange,
        arena: &mut RegisterArena,
    ) -> SerialResult<()> {
        self.run_setup(port).await?;

        match (&mut self.protocol, range.kind) {
            (DeviceProtocol::Modbus(dev), RegisterKind::Modbus(kind)) => {
                let values = dev.read(port, kind, range.start_address, range.count).await?;
                for candidate in &range.registers {
                    let value = range
                        .offset_of(candidate.address)
                        .and_then(|offset| values.get(offset));
                    if let Some(&value) = value {
                        arena.set_read_value(candidate.register, value);
                    }
                }
                Ok(())
            }
            (DeviceProtocol::Milur(dev), RegisterKind::Milur(kind)) => {
                for candidate in &range.registers {
                    let value = dev.read_register(port, kind, candidate.address).await?;
                    arena.set_read_value(candidate.register, value);
                }
                Ok(())
            }
            (protocol, kind) => Err(SerialError::config(format!(
                "{} device cannot read {} registers",
                protocol.name(),
                kind
            ))),
        }
    }

    /// Write consecutive registers, split by the device's write limit.
    pub async fn write_registers<P: Port>(
        &mut self,
        port: &mut P,
        kind: RegisterKind,
        start_address: u32,
        values: &[u64],
    ) -> SerialResult<()> {
        let mut result = self.run_setup(port).await;
        if result.is_ok() {
            result = self.write_raw(port, kind, start_address, values).await;
        }
        self.track(&result);
        result
    }

    async fn write_raw<P: Port>(
        &mut self,
        port: &mut P,
        kind: RegisterKind,
        start_address: u32,
        values: &[u64],
    ) -> SerialResult<()> {
        let chunk_size = usize::from(self.limits.max_write_for(kind).max(1));
        match (&mut self.protocol, kind) {
            (DeviceProtocol::Modbus(dev), RegisterKind::Modbus(table)) => {
                let mut address = start_address;
                for chunk in values.chunks(chunk_size) {
                    dev.write(port, table, address, chunk).await?;
                    address += chunk.len() as u32;
                }
                Ok(())
            }
            (protocol, kind) => Err(SerialError::unsupported(format!(
                "write {} registers on {} device",
                kind,
                protocol.name()
            ))),
        }
    }

    async fn run_setup<P: Port>(&mut self, port: &mut P) -> SerialResult<()> {
        if !self.needs_setup {
            return Ok(());
        }
        let items = self.setup.clone();
        for item in &items {
            debug!(
                "device '{}': setup '{}' {}@{} = {}",
                self.name, item.name, item.kind, item.address, item.value
            );
            self.write_raw(port, item.kind, item.address, &[item.value])
                .await?;
        }
        if !items.is_empty() {
            info!("device '{}': {} setup items written", self.name, items.len());
        }
        self.needs_setup = false;
        Ok(())
    }

    /// Update connection tracking from an exchange result.
    ///
    /// A permanent error still proves that the device answers.
    fn track<T>(&mut self, result: &SerialResult<T>) {
        match result {
            Ok(_) | Err(SerialError::Permanent(_)) => self.mark_connected(),
            Err(e) if e.is_transient() => self.mark_disconnected(e),
            Err(_) => {}
        }
    }

    fn mark_connected(&mut self) {
        self.last_success = Some(Instant::now());
        if self.connection != ConnectionState::Connected {
            info!("device '{}' (slave {}) connected", self.name, self.slave_id());
            self.connection = ConnectionState::Connected;
        }
    }

    fn mark_disconnected(&mut self, reason: &SerialError) {
        if self.connection != ConnectionState::Disconnected {
            warn!(
                "device '{}' (slave {}) disconnected: {}",
                self.name,
                self.slave_id(),
                reason
            );
        }
        self.disconnect();
    }

    fn disconnect(&mut self) {
        self.connection = ConnectionState::Disconnected;
        self.needs_setup = true;
        if let DeviceProtocol::Milur(dev) = &mut self.protocol {
            dev.disconnect();
        }
    }

    /// Close the poll cycle: a connected device that stayed silent for
    /// longer than its device timeout is marked disconnected.
    pub fn end_poll_cycle(&mut self, now: Instant) {
        if self.connection != ConnectionState::Connected {
            return;
        }
        let silent = self
            .last_success
            .is_some_and(|at| now.saturating_duration_since(at) > self.device_timeout);
        if silent {
            let reason: SerialError = TransientError::Timeout {
                operation: format!("no successful exchange with '{}'", self.name),
                timeout_ms: self.device_timeout.as_millis() as u64,
            }
            .into();
            self.mark_disconnected(&reason);
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' ({} slave {})",
            self.name,
            self.protocol.name(),
            self.slave_id()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milur::MilurProtocol;
    use crate::port::mock::MockPort;
    use crate::port::FrameTimeouts;
    use crate::range::RangeCandidate;
    use crate::register::{MilurKind, RegisterId};
    use crate::session::SessionDevice;

    fn timing() -> LinkTiming {
        LinkTiming {
            timeouts: FrameTimeouts::new(Duration::from_millis(500), Duration::from_millis(20)),
            guard_interval: Duration::ZERO,
        }
    }

    fn modbus_device() -> Device {
        Device::new(
            DeviceId(0),
            "io",
            DeviceProtocol::Modbus(ModbusDevice::new(1, timing(), Duration::ZERO)),
            DeviceLimits::new(),
        )
    }

    async fn open_port() -> MockPort {
        let mut port = MockPort::new();
        port.open().await.unwrap();
        port
    }

    fn holding_range(arena: &mut RegisterArena, addresses: &[u32], start: u32, count: u16) -> RegisterRange {
        RegisterRange {
            device: DeviceId(0),
            kind: RegisterKind::HOLDING,
            start_address: start,
            count,
            poll_interval: Duration::from_millis(100),
            registers: addresses
                .iter()
                .map(|&address| RangeCandidate {
                    register: arena.intern(DeviceId(0), RegisterKind::HOLDING, address),
                    kind: RegisterKind::HOLDING,
                    address,
                    poll_interval: Duration::from_millis(100),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_read_range_fills_arena() {
        let mut port = open_port().await;
        // 3 words: 0x0001, 0x0002 (hole), 0x0003
        port.reply([0x01, 0x03, 0x06, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0xFD, 0x74]);

        let mut arena = RegisterArena::new();
        let range = holding_range(&mut arena, &[0, 2], 0, 3);
        let mut dev = modbus_device();
        dev.read_range(&mut port, &range, &mut arena).await.unwrap();

        assert_eq!(port.written()[0], [0x01, 0x03, 0x00, 0x00, 0x00, 0x03, 0x05, 0xCB]);
        assert_eq!(arena.value(range.registers[0].register), 1);
        assert_eq!(arena.value(range.registers[1].register), 3);
        assert!(arena.lookup(DeviceId(0), RegisterKind::HOLDING, 1).is_none());
        assert!(dev.is_connected());
    }

    #[tokio::test]
    async fn test_timeout_disconnects() {
        let mut port = open_port().await;
        let mut arena = RegisterArena::new();
        let range = holding_range(&mut arena, &[0], 0, 1);
        let mut dev = modbus_device();

        let err = dev.read_range(&mut port, &range, &mut arena).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(dev.connection_state(), ConnectionState::Disconnected);
        assert_eq!(port.noise_skips(), 1);
    }

    #[tokio::test]
    async fn test_write_single_register() {
        let mut port = open_port().await;
        port.reply([0x01, 0x06, 0x00, 0x01, 0x00, 0x03, 0x98, 0x0B]);

        let mut dev = modbus_device();
        dev.write_registers(&mut port, RegisterKind::HOLDING, 1, &[3])
            .await
            .unwrap();
        assert_eq!(port.written()[0], [0x01, 0x06, 0x00, 0x01, 0x00, 0x03, 0x98, 0x0B]);
    }

    #[tokio::test]
    async fn test_write_echo_mismatch_is_transient() {
        let mut port = open_port().await;
        // echo carries value 0x0004 instead of 0x0003
        let mut reply = bytes::BytesMut::from(&[0x01u8, 0x06, 0x00, 0x01, 0x00, 0x04][..]);
        crate::rtu::append_crc(&mut reply);
        port.reply(reply.to_vec());

        let mut dev = modbus_device();
        let err = dev
            .write_registers(&mut port, RegisterKind::HOLDING, 1, &[3])
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_write_input_register_is_permanent() {
        let mut port = open_port().await;
        let mut dev = modbus_device();
        let err = dev
            .write_registers(&mut port, RegisterKind::INPUT, 1, &[3])
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert!(port.written().is_empty());
    }

    #[tokio::test]
    async fn test_setup_items_written_after_reconnect() {
        let mut port = open_port().await;
        let setup_echo = [0x01, 0x06, 0x00, 0x01, 0x00, 0x03, 0x98, 0x0B];
        let read_reply = [0x01, 0x03, 0x02, 0x00, 0x2A, 0x39, 0x9B];

        let mut arena = RegisterArena::new();
        let range = holding_range(&mut arena, &[0], 0, 1);
        let mut dev = modbus_device().with_setup(vec![SetupItem {
            name: "mode".to_string(),
            kind: RegisterKind::HOLDING,
            address: 1,
            value: 3,
        }]);

        port.reply(setup_echo);
        port.reply(read_reply);
        dev.read_range(&mut port, &range, &mut arena).await.unwrap();
        assert_eq!(arena.value(range.registers[0].register), 42);

        // already set up: plain read
        port.reply(read_reply);
        dev.read_range(&mut port, &range, &mut arena).await.unwrap();
        assert_eq!(port.written().len(), 3);

        // silence, then the setup item goes out again
        assert!(dev.read_range(&mut port, &range, &mut arena).await.is_err());
        port.reply(setup_echo);
        port.reply(read_reply);
        dev.read_range(&mut port, &range, &mut arena).await.unwrap();

        let written = port.written();
        assert_eq!(written.len(), 6);
        assert_eq!(written[4], setup_echo);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_timeout() {
        let mut port = open_port().await;
        port.reply([0x01, 0x03, 0x02, 0x00, 0x2A, 0x39, 0x9B]);

        let mut arena = RegisterArena::new();
        let range = holding_range(&mut arena, &[0], 0, 1);
        let mut dev = modbus_device().with_device_timeout(Duration::from_secs(3));
        dev.read_range(&mut port, &range, &mut arena).await.unwrap();

        dev.end_poll_cycle(Instant::now() + Duration::from_secs(2));
        assert!(dev.is_connected());
        dev.end_poll_cycle(Instant::now() + Duration::from_secs(4));
        assert_eq!(dev.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_milur_range() {
        let mut port = open_port().await;
        port.reply([0xFF, 0x08, 0x01, 0x87, 0xF0]);
        port.reply([0xFF, 0x01, 0x09, 0x02, 0xA0, 0xC3, 0xB3, 0xD9]);

        let protocol = MilurProtocol::new(1, &[]).unwrap();
        let mut dev = Device::new(
            DeviceId(1),
            "meter",
            DeviceProtocol::Milur(SessionDevice::new(protocol, 0xFF, timing(), Duration::ZERO)),
            DeviceLimits::single_register(),
        );

        let kind = RegisterKind::Milur(MilurKind::Frequency);
        let mut arena = RegisterArena::new();
        let register = arena.intern(DeviceId(1), kind, 9);
        let range = RegisterRange::single(
            DeviceId(1),
            RangeCandidate {
                register,
                kind,
                address: 9,
                poll_interval: Duration::from_millis(100),
            },
        );

        dev.read_range(&mut port, &range, &mut arena).await.unwrap();
        assert_eq!(arena.value(register), 50080);
        assert_eq!(register, RegisterId(0));

        let err = dev
            .write_registers(&mut port, kind, 9, &[1])
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
