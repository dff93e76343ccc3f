//! # Device Limits
//!
//! Per-device bounds used when grouping registers into read ranges and
//! when splitting writes.
//!
//! ## Protocol Limits
//!
//! - **Read Holding/Input Registers (FC03/04)**: max 125 registers per request
//! - **Read Coils/Discrete Inputs (FC01/02)**: max 2000 bits per request
//! - **Write Multiple Registers (FC16)**: max 123 registers per request
//! - **Write Multiple Coils (FC15)**: max 1968 coils per request
//! - **Milur meters**: one register per request
//!
//! A device may lower the read limit further; the protocol maximum always
//! wins over a larger configured value.
//!
//! ## Holes
//!
//! Two requested addresses may be merged into one range when at most
//! `max_*_hole` unrequested addresses lie between them. Larger holes waste
//! bandwidth; smaller ones cost extra round trips.

use crate::constants::{MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS};
use crate::register::RegisterKind;

/// Read and write bounds of one device.
///
/// # Example
///
/// ```rust
/// use voltage_serial::{DeviceLimits, RegisterKind};
///
/// // A device that answers at most 16 words per request
/// let limits = DeviceLimits::new()
///     .with_max_read_registers(16)
///     .with_max_reg_hole(4);
///
/// assert_eq!(limits.max_read_for(RegisterKind::HOLDING), 16);
/// assert_eq!(limits.max_hole_for(RegisterKind::HOLDING), 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum word registers per read request
    pub max_read_registers: u16,
    /// Maximum bits per read request
    pub max_read_bits: u16,
    /// Maximum word registers per write request
    pub max_write_registers: u16,
    /// Maximum bits per write request
    pub max_write_bits: u16,
    /// Largest gap of unrequested word registers inside one range
    pub max_reg_hole: u16,
    /// Largest gap of unrequested bits inside one range
    pub max_bit_hole: u16,
}

impl DeviceLimits {
    /// Limits of a standard Modbus device, no holes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits of a device that reads one register per request.
    pub fn single_register() -> Self {
        Self {
            max_read_registers: 1,
            max_read_bits: 1,
            max_write_registers: 1,
            max_write_bits: 1,
            max_reg_hole: 0,
            max_bit_hole: 0,
        }
    }

    /// Set maximum word registers per read, capped at the protocol maximum.
    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count.clamp(1, self.max_read_registers.max(1));
        self
    }

    /// Set maximum bits per read, capped at the protocol maximum.
    pub fn with_max_read_bits(mut self, count: u16) -> Self {
        self.max_read_bits = count.clamp(1, self.max_read_bits.max(1));
        self
    }

    /// Set the largest word gap inside one range.
    pub fn with_max_reg_hole(mut self, hole: u16) -> Self {
        self.max_reg_hole = hole;
        self
    }

    /// Set the largest bit gap inside one range.
    pub fn with_max_bit_hole(mut self, hole: u16) -> Self {
        self.max_bit_hole = hole;
        self
    }

    /// Maximum number of registers of `kind` in one read.
    #[inline]
    pub fn max_read_for(&self, kind: RegisterKind) -> u16 {
        if kind.is_bit() {
            self.max_read_bits
        } else {
            self.max_read_registers
        }
    }

    /// Maximum number of registers of `kind` in one write.
    #[inline]
    pub fn max_write_for(&self, kind: RegisterKind) -> u16 {
        if kind.is_bit() {
            self.max_write_bits
        } else {
            self.max_write_registers
        }
    }

    /// Largest hole allowed inside a range of `kind`.
    #[inline]
    pub fn max_hole_for(&self, kind: RegisterKind) -> u16 {
        if kind.is_bit() {
            self.max_bit_hole
        } else {
            self.max_reg_hole
        }
    }

    /// Number of read requests needed for `count` consecutive registers.
    pub fn read_request_count(&self, kind: RegisterKind, count: u16) -> u16 {
        if count == 0 {
            return 0;
        }
        count.div_ceil(self.max_read_for(kind))
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_read_registers: MAX_READ_REGISTERS as u16,
            max_read_bits: MAX_READ_COILS as u16,
            max_write_registers: MAX_WRITE_REGISTERS as u16,
            max_write_bits: MAX_WRITE_COILS as u16,
            max_reg_hole: 0,
            max_bit_hole: 0,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
