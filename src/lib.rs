//! # Voltage Serial - Field-Device Polling Engine
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! Polls meters and I/O modules that share one serial line (or a TCP serial
//! gateway) and publishes their registers as typed, scaled channels.
//!
//! ## Features
//!
//! - **Register binding**: a channel may use any bit window of one or more
//!   device registers; writes preserve the bits of neighbouring channels
//! - **Range merging**: registers are read in as few requests as the device
//!   allows, bridging configurable address holes
//! - **Shared-bus scheduling**: one task owns the port, polls by interval and
//!   flushes queued writes while waiting
//! - **Error classes**: transient, permanent and fatal errors lead to retry,
//!   register exclusion and device exclusion respectively
//! - **Protocols**: Modbus RTU and Milur electricity meters, with a registry
//!   for more
//!
//! ## Supported Modbus Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x02 | Read Discrete Inputs |
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x05 | Write Single Coil |
//! | 0x06 | Write Single Register |
//! | 0x0F | Write Multiple Coils |
//! | 0x10 | Write Multiple Registers |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_serial::{
//!     DeviceConfig, PortConfig, ProtocolRegistry, RegisterConfig, SerialClient, TcpPort,
//!     ValueFormat, WordOrder,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PortConfig::new().with_device(
//!         DeviceConfig::new("pump", 3, "modbus")
//!             .with_max_reg_hole(2)
//!             .with_register(
//!                 RegisterConfig::new("flow", "holding", 100)
//!                     .with_format(ValueFormat::Float)
//!                     .with_word_order(WordOrder::LittleEndian),
//!             )
//!             .with_register(RegisterConfig::new("running", "coil", 0)),
//!     );
//!
//!     let mut client = SerialClient::new(
//!         TcpPort::new("192.168.1.20:4001"),
//!         &config,
//!         &ProtocolRegistry::with_builtin(),
//!     );
//!     client.on_value(|channel, value| println!("{}: {}", channel.name(), value));
//!
//!     let writer = client.write_handle();
//!     if let Some(running) = writer.find("running") {
//!         writer.set_text_value(running, "1").expect("valid value");
//!     }
//!
//!     client.run().await;
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Error classes and result handling
pub mod error;

/// Protocol constants and timing defaults
pub mod constants;

/// Logging helpers for wire frames
pub mod logging;

// ============================================================================
// Values and registers
// ============================================================================

/// Value formats and text conversion
pub mod value;

/// Word order of multi-register values
pub mod bytes;

/// Bit-window allocation across protocol registers
pub mod bind;

/// Protocol registers and their arena
pub mod register;

/// Channels bound to protocol registers
pub mod virtual_register;

/// Per-device request limits
pub mod device_limits;

/// Grouping registers into read ranges
pub mod range;

// ============================================================================
// Wire protocols
// ============================================================================

/// Stack-allocated Modbus PDU
pub mod pdu;

/// Modbus RTU framing and CRC
pub mod rtu;

/// Byte transports
pub mod port;

/// Session state machine for meters that require a login
pub mod session;

/// Milur electricity meters
pub mod milur;

// ============================================================================
// Engine
// ============================================================================

/// Devices and protocol dispatch
pub mod device;

/// Protocol descriptors by name
pub mod registry;

/// Port, device and channel configuration
pub mod config;

/// Poll schedule
pub mod poll_plan;

/// The polling scheduler
pub mod client;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime ===
pub use tokio;

// === Engine ===
pub use client::{ClientStats, ErrorCallback, SerialClient, ValueCallback, WriteHandle};
pub use config::{DeviceConfig, PortConfig, RegisterConfig, SetupItemConfig};
pub use device::{ConnectionState, Device, DeviceProtocol, ModbusDevice, SetupItem};
pub use poll_plan::{PollEntry, PollPlan};
pub use registry::{ProtocolDescriptor, ProtocolRegistry};

// === Error handling ===
pub use error::{FatalError, PermanentError, SerialError, SerialResult, TransientError};

// === Values and registers ===
pub use bind::{bind, BindInfo};
pub use bytes::WordOrder;
pub use device_limits::DeviceLimits;
pub use range::{split_register_list, RangeCandidate, RegisterRange};
pub use register::{DeviceId, MilurKind, ModbusKind, ProtocolRegister, RegisterArena, RegisterId, RegisterKind};
pub use value::{decode, encode, Scaling, ValueFormat};
pub use virtual_register::{ErrorState, ValueSpec, VirtualRegister, VirtualRegisterId};

// === Wire ===
pub use milur::{MilurDevice, MilurProtocol};
pub use pdu::{ModbusFunction, ModbusPdu};
pub use port::{FrameTimeouts, LinkTiming, Port, PortStats, TcpPort};
pub use session::{ErrorClass, SessionDevice, SessionProtocol, SessionRequest, SessionState};

#[cfg(feature = "rtu")]
pub use port::SerialPort;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Serial v{} - field-device polling engine by Evan Liu",
        VERSION
    )
}
