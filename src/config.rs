//! # Configuration
//!
//! Plain structs with builder-style setters. Loading them from files is left
//! to the application; everything here is already typed.
//!
//! ```rust
//! use std::time::Duration;
//! use voltage_serial::{DeviceConfig, PortConfig, RegisterConfig, ValueFormat};
//!
//! let config = PortConfig::new()
//!     .with_response_timeout(Duration::from_millis(300))
//!     .with_device(
//!         DeviceConfig::new("io1", 1, "modbus")
//!             .with_max_reg_hole(4)
//!             .with_register(
//!                 RegisterConfig::new("temperature", "input", 10)
//!                     .with_format(ValueFormat::S16)
//!                     .with_scale(0.1),
//!             ),
//!     );
//!
//! assert_eq!(config.devices.len(), 1);
//! ```

use std::time::Duration;

use crate::bytes::WordOrder;
use crate::constants::{
    DEFAULT_DEVICE_TIMEOUT, DEFAULT_FRAME_TIMEOUT, DEFAULT_INTER_DEVICE_DELAY,
    DEFAULT_POLL_INTERVAL, DEFAULT_RESPONSE_TIMEOUT,
};
use crate::port::{FrameTimeouts, LinkTiming};
use crate::value::{Scaling, ValueFormat};

// ============================================================================
// Port
// ============================================================================

/// Settings of one port and the devices behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct PortConfig {
    /// Poll interval of channels without their own, and the idle wait when
    /// nothing is scheduled
    pub poll_interval: Duration,
    pub response_timeout: Duration,
    pub frame_timeout: Duration,
    /// Quiet time before each request
    pub guard_interval: Duration,
    pub devices: Vec<DeviceConfig>,
}

impl PortConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn with_guard_interval(mut self, interval: Duration) -> Self {
        self.guard_interval = interval;
        self
    }

    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.devices.push(device);
        self
    }

    /// Timing of a device on this port, device overrides applied.
    pub fn link_timing(&self, device: &DeviceConfig) -> LinkTiming {
        LinkTiming {
            timeouts: FrameTimeouts::new(
                device.response_timeout.unwrap_or(self.response_timeout),
                device.frame_timeout.unwrap_or(self.frame_timeout),
            ),
            guard_interval: device.guard_interval.unwrap_or(self.guard_interval),
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            guard_interval: Duration::ZERO,
            devices: Vec::new(),
        }
    }
}

// ============================================================================
// Device
// ============================================================================

/// A register written every time the device (re)connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupItemConfig {
    pub name: String,
    /// Register type name, resolved by the device's protocol
    pub kind: String,
    pub address: u32,
    /// Raw register value
    pub value: u64,
}

impl SetupItemConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, address: u32, value: u64) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            address,
            value,
        }
    }
}

/// Settings of one slave.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub slave_id: u8,
    /// Protocol name, looked up in the protocol registry
    pub protocol: String,
    /// Pause after switching to this device
    pub delay: Duration,
    pub access_level: u8,
    pub password: Vec<u8>,
    pub max_reg_hole: u16,
    pub max_bit_hole: u16,
    pub max_read_registers: Option<u16>,
    pub response_timeout: Option<Duration>,
    pub frame_timeout: Option<Duration>,
    pub guard_interval: Option<Duration>,
    /// Silence after which the device counts as disconnected
    pub device_timeout: Duration,
    pub setup: Vec<SetupItemConfig>,
    pub registers: Vec<RegisterConfig>,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, slave_id: u8, protocol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slave_id,
            protocol: protocol.into(),
            delay: DEFAULT_INTER_DEVICE_DELAY,
            access_level: 1,
            password: Vec::new(),
            max_reg_hole: 0,
            max_bit_hole: 0,
            max_read_registers: None,
            response_timeout: None,
            frame_timeout: None,
            guard_interval: None,
            device_timeout: DEFAULT_DEVICE_TIMEOUT,
            setup: Vec::new(),
            registers: Vec::new(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_access_level(mut self, level: u8) -> Self {
        self.access_level = level;
        self
    }

    pub fn with_password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_max_reg_hole(mut self, hole: u16) -> Self {
        self.max_reg_hole = hole;
        self
    }

    pub fn with_max_bit_hole(mut self, hole: u16) -> Self {
        self.max_bit_hole = hole;
        self
    }

    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = Some(count);
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = Some(timeout);
        self
    }

    pub fn with_guard_interval(mut self, interval: Duration) -> Self {
        self.guard_interval = Some(interval);
        self
    }

    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    pub fn with_setup_item(mut self, item: SetupItemConfig) -> Self {
        self.setup.push(item);
        self
    }

    pub fn with_register(mut self, register: RegisterConfig) -> Self {
        self.registers.push(register);
        self
    }
}

// ============================================================================
// Register
// ============================================================================

/// Settings of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterConfig {
    pub name: String,
    /// Register type name, resolved by the device's protocol
    pub kind: String,
    pub address: u32,
    /// `None` picks the register type's default
    pub format: Option<ValueFormat>,
    pub scaling: Scaling,
    pub word_order: WordOrder,
    pub bit_offset: u16,
    /// `None` uses the rest of the format width
    pub bit_width: Option<u16>,
    /// Raw value the device reports instead of a reading
    pub error_value: Option<u64>,
    pub poll: bool,
    /// `None` uses the port's poll interval
    pub poll_interval: Option<Duration>,
    pub readonly: bool,
}

impl RegisterConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, address: u32) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            address,
            format: None,
            scaling: Scaling::default(),
            word_order: WordOrder::BigEndian,
            bit_offset: 0,
            bit_width: None,
            error_value: None,
            poll: true,
            poll_interval: None,
            readonly: false,
        }
    }

    pub fn with_format(mut self, format: ValueFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scaling.scale = scale;
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.scaling.offset = offset;
        self
    }

    pub fn with_round_to(mut self, round_to: f64) -> Self {
        self.scaling.round_to = round_to;
        self
    }

    pub fn with_word_order(mut self, order: WordOrder) -> Self {
        self.word_order = order;
        self
    }

    /// Use only bits `[offset, offset + width)` of the format.
    pub fn with_bits(mut self, offset: u16, width: u16) -> Self {
        self.bit_offset = offset;
        self.bit_width = Some(width);
        self
    }

    pub fn with_error_value(mut self, raw: u64) -> Self {
        self.error_value = Some(raw);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Never poll; the channel is only written.
    pub fn write_only(mut self) -> Self {
        self.poll = false;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }
}
