//! # Protocol Registry
//!
//! Maps protocol names to descriptors. A registry is an ordinary value built
//! at startup and handed to [`SerialClient::new`](crate::SerialClient::new);
//! applications may add their own descriptors next to the built-in ones.
//!
//! ```rust
//! use voltage_serial::{ProtocolRegistry, RegisterKind};
//!
//! let registry = ProtocolRegistry::with_builtin();
//! let modbus = registry.get("modbus").unwrap();
//! assert_eq!(modbus.kind("holding").unwrap(), RegisterKind::HOLDING);
//! assert!(registry.get("dlms").is_err());
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::config::{DeviceConfig, PortConfig};
use crate::device::{Device, DeviceProtocol, ModbusDevice, SetupItem};
use crate::device_limits::DeviceLimits;
use crate::error::{FatalError, SerialResult};
use crate::milur::MilurProtocol;
use crate::port::LinkTiming;
use crate::register::{DeviceId, MilurKind, RegisterKind};
use crate::session::SessionDevice;

/// Builds the protocol engine of one device.
pub type DeviceFactory = fn(&DeviceConfig, LinkTiming) -> SerialResult<DeviceProtocol>;

/// Everything the engine knows about one protocol.
#[derive(Clone, Copy)]
pub struct ProtocolDescriptor {
    pub name: &'static str,
    /// Register types, addressed by [`RegisterKind::name`]
    pub kinds: &'static [RegisterKind],
    /// Protocol ceilings before device configuration
    pub limits: DeviceLimits,
    pub factory: DeviceFactory,
}

impl ProtocolDescriptor {
    /// Resolve a register type name.
    pub fn kind(&self, name: &str) -> SerialResult<RegisterKind> {
        self.kinds
            .iter()
            .copied()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| {
                FatalError::UnknownRegisterKind {
                    protocol: self.name.to_string(),
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Protocol ceilings narrowed by the device configuration.
    pub fn limits_for(&self, config: &DeviceConfig) -> DeviceLimits {
        let mut limits = self
            .limits
            .with_max_reg_hole(config.max_reg_hole)
            .with_max_bit_hole(config.max_bit_hole);
        if let Some(count) = config.max_read_registers.filter(|&n| n > 0) {
            limits = limits.with_max_read_registers(count);
        }
        limits
    }

    /// Build a device from its configuration.
    pub fn create(&self, id: DeviceId, port: &PortConfig, config: &DeviceConfig) -> SerialResult<Device> {
        let protocol = (self.factory)(config, port.link_timing(config))?;
        let setup = config
            .setup
            .iter()
            .map(|item| {
                Ok(SetupItem {
                    name: item.name.clone(),
                    kind: self.kind(&item.kind)?,
                    address: item.address,
                    value: item.value,
                })
            })
            .collect::<SerialResult<Vec<_>>>()?;

        Ok(Device::new(id, config.name.clone(), protocol, self.limits_for(config))
            .with_setup(setup)
            .with_device_timeout(config.device_timeout))
    }
}

impl fmt::Debug for ProtocolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolDescriptor")
            .field("name", &self.name)
            .field("kinds", &self.kinds)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

const MODBUS_KINDS: &[RegisterKind] = &[
    RegisterKind::COIL,
    RegisterKind::DISCRETE,
    RegisterKind::HOLDING,
    RegisterKind::INPUT,
];

const MILUR_KINDS: &[RegisterKind] = &[
    RegisterKind::Milur(MilurKind::Param),
    RegisterKind::Milur(MilurKind::Power),
    RegisterKind::Milur(MilurKind::Energy),
    RegisterKind::Milur(MilurKind::Frequency),
    RegisterKind::Milur(MilurKind::PowerFactor),
];

fn create_modbus(config: &DeviceConfig, timing: LinkTiming) -> SerialResult<DeviceProtocol> {
    Ok(DeviceProtocol::Modbus(ModbusDevice::new(
        config.slave_id,
        timing,
        config.delay,
    )))
}

fn create_milur(config: &DeviceConfig, timing: LinkTiming) -> SerialResult<DeviceProtocol> {
    let protocol = MilurProtocol::new(config.access_level, &config.password)?;
    Ok(DeviceProtocol::Milur(SessionDevice::new(
        protocol,
        config.slave_id,
        timing,
        config.delay,
    )))
}

/// Modbus RTU.
pub const MODBUS: ProtocolDescriptor = ProtocolDescriptor {
    name: "modbus",
    kinds: MODBUS_KINDS,
    limits: DeviceLimits {
        max_read_registers: crate::constants::MAX_READ_REGISTERS as u16,
        max_read_bits: crate::constants::MAX_READ_COILS as u16,
        max_write_registers: crate::constants::MAX_WRITE_REGISTERS as u16,
        max_write_bits: crate::constants::MAX_WRITE_COILS as u16,
        max_reg_hole: 0,
        max_bit_hole: 0,
    },
    factory: create_modbus,
};

/// Milur electricity meters.
pub const MILUR: ProtocolDescriptor = ProtocolDescriptor {
    name: "milur",
    kinds: MILUR_KINDS,
    limits: DeviceLimits {
        max_read_registers: 1,
        max_read_bits: 1,
        max_write_registers: 1,
        max_write_bits: 1,
        max_reg_hole: 0,
        max_bit_hole: 0,
    },
    factory: create_milur,
};

/// Protocol descriptors by name.
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    protocols: HashMap<&'static str, ProtocolDescriptor>,
}

impl ProtocolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the protocols shipped with the crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(MODBUS);
        registry.register(MILUR);
        registry
    }

    /// Add or replace a protocol.
    pub fn register(&mut self, descriptor: ProtocolDescriptor) {
        self.protocols.insert(descriptor.name, descriptor);
    }

    /// Look up a protocol by name.
    pub fn get(&self, name: &str) -> SerialResult<&ProtocolDescriptor> {
        self.protocols.get(name).ok_or_else(|| {
            FatalError::UnknownProtocol {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Registered protocol names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.protocols.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
