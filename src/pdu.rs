//! Modbus PDU composition and payload decoding
//!
//! The PDU lives in a fixed-size stack array; requests never touch the heap
//! until they are wrapped into an ADU.

use tracing::debug;

use crate::constants::{
    FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE, WRITE_RESPONSE_PDU_SIZE,
};
use crate::error::{SerialError, SerialResult};
use crate::register::ModbusKind;

// ============================================================================
// Function codes
// ============================================================================

/// Function codes used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusFunction {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl ModbusFunction {
    /// Read function for a data table.
    pub fn for_read(kind: ModbusKind) -> Self {
        match kind {
            ModbusKind::Coil => Self::ReadCoils,
            ModbusKind::Discrete => Self::ReadDiscreteInputs,
            ModbusKind::Holding => Self::ReadHoldingRegisters,
            ModbusKind::Input => Self::ReadInputRegisters,
        }
    }

    /// Write function for `count` registers of a data table.
    ///
    /// Single values use FC05/FC06, several use FC15/FC16. Discrete inputs
    /// and input registers cannot be written.
    pub fn for_write(kind: ModbusKind, count: usize) -> SerialResult<Self> {
        match (kind, count) {
            (_, 0) => Err(SerialError::malformed("empty write request")),
            (ModbusKind::Coil, 1) => Ok(Self::WriteSingleCoil),
            (ModbusKind::Coil, _) => Ok(Self::WriteMultipleCoils),
            (ModbusKind::Holding, 1) => Ok(Self::WriteSingleRegister),
            (ModbusKind::Holding, _) => Ok(Self::WriteMultipleRegisters),
            (ModbusKind::Discrete, _) => Err(SerialError::unsupported("write discrete input")),
            (ModbusKind::Input, _) => Err(SerialError::unsupported("write input register")),
        }
    }

    /// Wire code.
    #[inline]
    pub fn code(&self) -> u8 {
        match self {
            Self::ReadCoils => FC_READ_COILS,
            Self::ReadDiscreteInputs => FC_READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters => FC_READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters => FC_READ_INPUT_REGISTERS,
            Self::WriteSingleCoil => FC_WRITE_SINGLE_COIL,
            Self::WriteSingleRegister => FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultipleCoils => FC_WRITE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    /// Check if the function reads data.
    #[inline]
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    /// Check if the function carries one bit per register.
    #[inline]
    pub fn is_bit_access(&self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::WriteSingleCoil
                | Self::WriteMultipleCoils
        )
    }

    /// PDU length of a normal response to a request for `count` registers.
    pub fn response_pdu_len(&self, count: u16) -> usize {
        if !self.is_read() {
            return WRITE_RESPONSE_PDU_SIZE;
        }
        2 + payload_len(self.is_bit_access(), count)
    }

    /// Human-readable description.
    pub fn description(&self) -> &'static str {
        function_code_description(self.code())
    }
}

/// Human-readable description of a function code, exception bit ignored.
pub fn function_code_description(fc: u8) -> &'static str {
    match fc & 0x7F {
        FC_READ_COILS => "Read Coils",
        FC_READ_DISCRETE_INPUTS => "Read Discrete Inputs",
        FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
        FC_READ_INPUT_REGISTERS => "Read Input Registers",
        FC_WRITE_SINGLE_COIL => "Write Single Coil",
        FC_WRITE_SINGLE_REGISTER => "Write Single Register",
        FC_WRITE_MULTIPLE_COILS => "Write Multiple Coils",
        FC_WRITE_MULTIPLE_REGISTERS => "Write Multiple Registers",
        _ => "Unknown Function",
    }
}

/// Byte count of a read payload.
#[inline]
pub fn payload_len(bits: bool, count: u16) -> usize {
    if bits {
        usize::from(count).div_ceil(8)
    } else {
        usize::from(count) * 2
    }
}

// ============================================================================
// PDU buffer
// ============================================================================

/// Stack-allocated PDU.
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Append a byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> SerialResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(SerialError::malformed("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Append a big-endian word
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> SerialResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)
    }

    /// Append a byte slice
    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> SerialResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(SerialError::malformed(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Requests
// ============================================================================

fn wire_address(address: u32) -> SerialResult<u16> {
    u16::try_from(address)
        .map_err(|_| SerialError::config(format!("address {address} outside of Modbus range")))
}

/// Compose a read request PDU (FC01-04).
///
/// # Arguments
/// * `kind` - Data table to read
/// * `start_address` - First address
/// * `count` - Number of bits (coils, discrete inputs) or words
pub fn read_request(kind: ModbusKind, start_address: u32, count: u16) -> SerialResult<ModbusPdu> {
    let function = ModbusFunction::for_read(kind);
    let mut pdu = ModbusPdu::new();
    pdu.push(function.code())?;
    pdu.push_u16(wire_address(start_address)?)?;
    pdu.push_u16(count)?;

    debug!(
        "PDU built: FC={:02X} ({}), address={}, count={}",
        function.code(),
        function.description(),
        start_address,
        count
    );
    Ok(pdu)
}

/// Compose a write request PDU for consecutive registers.
///
/// The function code is chosen from the table and the number of values,
/// see [`ModbusFunction::for_write`]. Coil values are non-zero for ON.
pub fn write_request(kind: ModbusKind, start_address: u32, values: &[u64]) -> SerialResult<ModbusPdu> {
    let function = ModbusFunction::for_write(kind, values.len())?;
    let address = wire_address(start_address)?;
    let mut pdu = ModbusPdu::new();
    pdu.push(function.code())?;
    pdu.push_u16(address)?;

    match function {
        ModbusFunction::WriteSingleCoil => {
            pdu.push_u16(if values[0] != 0 { 0xFF00 } else { 0x0000 })?;
        }
        ModbusFunction::WriteSingleRegister => {
            pdu.push_u16(values[0] as u16)?;
        }
        ModbusFunction::WriteMultipleCoils => {
            let packed = pack_bits(values);
            pdu.push_u16(values.len() as u16)?;
            pdu.push(packed.len() as u8)?;
            pdu.extend(&packed)?;
        }
        ModbusFunction::WriteMultipleRegisters => {
            pdu.push_u16(values.len() as u16)?;
            pdu.push((values.len() * 2) as u8)?;
            for &value in values {
                pdu.push_u16(value as u16)?;
            }
        }
        read => return Err(SerialError::unsupported(read.description())),
    }

    debug!(
        "PDU built: FC={:02X} ({}), address={}, values={}",
        function.code(),
        function.description(),
        start_address,
        values.len()
    );
    Ok(pdu)
}

/// Echo of a write request's address/value (or address/quantity) words.
pub fn write_echo(kind: ModbusKind, start_address: u32, values: &[u64]) -> SerialResult<[u16; 2]> {
    let function = ModbusFunction::for_write(kind, values.len())?;
    let address = wire_address(start_address)?;
    let second = match function {
        ModbusFunction::WriteSingleCoil => {
            if values[0] != 0 {
                0xFF00
            } else {
                0x0000
            }
        }
        ModbusFunction::WriteSingleRegister => values[0] as u16,
        _ => values.len() as u16,
    };
    Ok([address, second])
}

// ============================================================================
// Payload packing
// ============================================================================

/// Pack bit values LSB-first into bytes.
pub fn pack_bits(values: &[u64]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value != 0 {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack LSB-first bits, clipped to `count`.
pub fn unpack_bits(data: &[u8], count: usize) -> Vec<u64> {
    (0..count)
        .map(|i| {
            data.get(i / 8)
                .map(|byte| u64::from((byte >> (i % 8)) & 1))
                .unwrap_or(0)
        })
        .collect()
}

/// Unpack big-endian 16-bit words.
pub fn unpack_words(data: &[u8], count: usize) -> Vec<u64> {
    data.chunks_exact(2)
        .take(count)
        .map(|pair| u64::from(u16::from_be_bytes([pair[0], pair[1]])))
        .collect()
}
