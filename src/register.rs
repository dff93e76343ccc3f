//! # Protocol Registers
//!
//! Raw, device-addressable storage slots. All protocol registers live in a
//! [`RegisterArena`] and are addressed by a stable [`RegisterId`]; virtual
//! registers hold ids, never owning references.
//!
//! The arena interns registers by `(device, kind, address)`: asking for the
//! same physical word twice yields the same id, so several channels that
//! share a word share one last-known value.

use std::collections::HashMap;
use std::fmt;

use crate::value::ValueFormat;

/// Index of a device inside a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u16);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Stable index of a protocol register inside a [`RegisterArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterId(pub u32);

// ============================================================================
// Register kinds
// ============================================================================

/// Modbus data tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModbusKind {
    /// Read/write single bit (FC01, FC05, FC15)
    Coil,
    /// Read-only single bit (FC02)
    Discrete,
    /// Read/write 16-bit word (FC03, FC06, FC16)
    Holding,
    /// Read-only 16-bit word (FC04)
    Input,
}

/// Register types of Milur electricity meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MilurKind {
    /// Instantaneous parameter, 3 bytes
    Param,
    /// Power, 4 bytes
    Power,
    /// Energy counter, 4 bytes BCD
    Energy,
    /// Grid frequency, 2 bytes
    Frequency,
    /// Power factor, 2 bytes
    PowerFactor,
}

/// Type of a protocol register.
///
/// Each protocol brings its own table; ordering sorts by protocol first,
/// then by the table order, which is what range building relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegisterKind {
    Modbus(ModbusKind),
    Milur(MilurKind),
}

impl RegisterKind {
    pub const COIL: Self = Self::Modbus(ModbusKind::Coil);
    pub const DISCRETE: Self = Self::Modbus(ModbusKind::Discrete);
    pub const HOLDING: Self = Self::Modbus(ModbusKind::Holding);
    pub const INPUT: Self = Self::Modbus(ModbusKind::Input);

    /// Width of one register in bits.
    #[inline]
    pub fn width_bits(&self) -> u16 {
        match self {
            Self::Modbus(ModbusKind::Coil | ModbusKind::Discrete) => 1,
            Self::Modbus(ModbusKind::Holding | ModbusKind::Input) => 16,
            Self::Milur(MilurKind::Param) => 24,
            Self::Milur(MilurKind::Power | MilurKind::Energy) => 32,
            Self::Milur(MilurKind::Frequency | MilurKind::PowerFactor) => 16,
        }
    }

    /// Check if one register holds a single bit.
    #[inline]
    pub fn is_bit(&self) -> bool {
        self.width_bits() == 1
    }

    /// Check if the register type cannot be written.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        !matches!(
            self,
            Self::Modbus(ModbusKind::Coil) | Self::Modbus(ModbusKind::Holding)
        )
    }

    /// Format used when a channel does not name one.
    pub fn default_format(&self) -> ValueFormat {
        match self {
            Self::Modbus(ModbusKind::Coil | ModbusKind::Discrete) => ValueFormat::U8,
            Self::Modbus(ModbusKind::Holding | ModbusKind::Input) => ValueFormat::U16,
            Self::Milur(MilurKind::Param) => ValueFormat::U24,
            Self::Milur(MilurKind::Power) => ValueFormat::S32,
            Self::Milur(MilurKind::Energy) => ValueFormat::Bcd32,
            Self::Milur(MilurKind::Frequency) => ValueFormat::U16,
            Self::Milur(MilurKind::PowerFactor) => ValueFormat::S16,
        }
    }

    /// Configuration name of the type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Modbus(ModbusKind::Coil) => "coil",
            Self::Modbus(ModbusKind::Discrete) => "discrete",
            Self::Modbus(ModbusKind::Holding) => "holding",
            Self::Modbus(ModbusKind::Input) => "input",
            Self::Milur(MilurKind::Param) => "param",
            Self::Milur(MilurKind::Power) => "power",
            Self::Milur(MilurKind::Energy) => "energy",
            Self::Milur(MilurKind::Frequency) => "freq",
            Self::Milur(MilurKind::PowerFactor) => "power_factor",
        }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Protocol register
// ============================================================================

/// One raw device word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolRegister {
    pub device: DeviceId,
    pub kind: RegisterKind,
    pub address: u32,
    pub width_bits: u16,
    /// Last value read from or written to the device
    pub last_value: u64,
    /// Set when the register was read in the current cycle
    pub was_read: bool,
    /// Set once any read of the register succeeded
    pub has_value: bool,
}

impl ProtocolRegister {
    /// Create a register with the kind's natural width.
    pub fn new(device: DeviceId, kind: RegisterKind, address: u32) -> Self {
        Self {
            device,
            kind,
            address,
            width_bits: kind.width_bits(),
            last_value: 0,
            was_read: false,
            has_value: false,
        }
    }
}

impl fmt::Display for ProtocolRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.device, self.kind, self.address)
    }
}

type RegisterKey = (DeviceId, RegisterKind, u32);

/// Owner of all protocol registers.
#[derive(Debug, Default)]
pub struct RegisterArena {
    registers: Vec<ProtocolRegister>,
    index: HashMap<RegisterKey, RegisterId>,
}

impl RegisterArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the register at `(device, kind, address)`, creating it if needed.
    pub fn intern(&mut self, device: DeviceId, kind: RegisterKind, address: u32) -> RegisterId {
        if let Some(&id) = self.index.get(&(device, kind, address)) {
            return id;
        }
        let id = RegisterId(self.registers.len() as u32);
        self.registers
            .push(ProtocolRegister::new(device, kind, address));
        self.index.insert((device, kind, address), id);
        id
    }

    /// Look up an existing register.
    pub fn lookup(&self, device: DeviceId, kind: RegisterKind, address: u32) -> Option<RegisterId> {
        self.index.get(&(device, kind, address)).copied()
    }

    /// Get a register by id.
    #[inline]
    pub fn get(&self, id: RegisterId) -> Option<&ProtocolRegister> {
        self.registers.get(id.0 as usize)
    }

    /// Get a register by id, mutably.
    #[inline]
    pub fn get_mut(&mut self, id: RegisterId) -> Option<&mut ProtocolRegister> {
        self.registers.get_mut(id.0 as usize)
    }

    /// Last value of a register, 0 for unknown ids.
    #[inline]
    pub fn value(&self, id: RegisterId) -> u64 {
        self.get(id).map(|r| r.last_value).unwrap_or(0)
    }

    /// Store a value read from the device.
    pub fn set_read_value(&mut self, id: RegisterId, value: u64) {
        if let Some(register) = self.get_mut(id) {
            register.last_value = value;
            register.was_read = true;
            register.has_value = true;
        }
    }

    /// Store a value written to the device.
    pub fn set_written_value(&mut self, id: RegisterId, value: u64) {
        if let Some(register) = self.get_mut(id) {
            register.last_value = value;
        }
    }

    /// Check if the register was read in the current cycle.
    #[inline]
    pub fn was_read(&self, id: RegisterId) -> bool {
        self.get(id).is_some_and(|r| r.was_read)
    }

    /// Check if the register holds a value read from the device.
    #[inline]
    pub fn has_value(&self, id: RegisterId) -> bool {
        self.get(id).is_some_and(|r| r.has_value)
    }

    /// Clear the per-cycle read flags.
    pub fn begin_cycle(&mut self) {
        for register in &mut self.registers {
            register.was_read = false;
        }
    }

    /// Iterate over all registers with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (RegisterId, &ProtocolRegister)> {
        self.registers
            .iter()
            .enumerate()
            .map(|(i, r)| (RegisterId(i as u32), r))
    }

    /// Number of registers.
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    /// Check if the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_returns_same_register() {
        let mut arena = RegisterArena::new();
        let a = arena.intern(DeviceId(0), RegisterKind::HOLDING, 10);
        let b = arena.intern(DeviceId(0), RegisterKind::HOLDING, 10);
        let c = arena.intern(DeviceId(0), RegisterKind::INPUT, 10);
        let d = arena.intern(DeviceId(1), RegisterKind::HOLDING, 10);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_read_flags() {
        let mut arena = RegisterArena::new();
        let id = arena.intern(DeviceId(0), RegisterKind::HOLDING, 0);
        assert!(!arena.has_value(id));

        // a write alone does not make the register readable
        arena.set_written_value(id, 3);
        assert!(!arena.has_value(id));

        arena.set_read_value(id, 0x1234);
        let reg = arena.get(id).unwrap();
        assert_eq!(reg.last_value, 0x1234);
        assert!(reg.was_read);

        arena.begin_cycle();
        assert!(!arena.was_read(id));
        assert!(arena.has_value(id));
        assert_eq!(arena.value(id), 0x1234);

        arena.set_written_value(id, 7);
        assert_eq!(arena.value(id), 7);
        assert!(!arena.get(id).unwrap().was_read);
    }

    #[test]
    fn test_kind_properties() {
        assert!(RegisterKind::COIL.is_bit());
        assert!(!RegisterKind::COIL.is_read_only());
        assert!(RegisterKind::DISCRETE.is_read_only());
        assert_eq!(RegisterKind::HOLDING.width_bits(), 16);
        assert_eq!(RegisterKind::Milur(MilurKind::Param).width_bits(), 24);
        assert!(RegisterKind::Milur(MilurKind::Energy).is_read_only());
        assert!(RegisterKind::COIL < RegisterKind::HOLDING);
    }
}
