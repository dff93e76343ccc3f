//! Protocol constants and engine timing defaults
//!
//! Modbus limits follow the official specification:
//! - Maximum PDU size: 253 bytes (RS485 ADU limit of 256 bytes minus slave id and CRC)
//! - Register/coil limits are calculated to fit within the PDU size constraint

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum PDU (Protocol Data Unit) size
///
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum RTU ADU size (slave id + PDU + CRC)
pub const MAX_ADU_SIZE: usize = MAX_PDU_SIZE + 3;

/// Bytes of an RTU ADU that are not part of the PDU: slave id (1) + CRC (2)
pub const ADU_OVERHEAD: usize = 3;

/// PDU length of a write response (function + address echo + value/quantity echo)
pub const WRITE_RESPONSE_PDU_SIZE: usize = 5;

/// PDU length of an exception response (function | 0x80 + exception code)
pub const EXCEPTION_PDU_SIZE: usize = 2;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04
///
/// 1 (function) + 1 (byte count) + N × 2 ≤ 253 → N ≤ 125
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16
///
/// 1 + 2 + 2 + 1 + N × 2 ≤ 253 → N ≤ 123
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Maximum number of coils for FC01/FC02
pub const MAX_READ_COILS: usize = 2000;

/// Maximum number of coils for FC15
pub const MAX_WRITE_COILS: usize = 1968;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Acknowledge
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Memory Parity Error
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;

/// Gateway Path Unavailable
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed to Respond
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

// ============================================================================
// Timing Defaults
// ============================================================================

/// Idle wait of the scheduler when nothing is scheduled
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Time to wait for the first byte of a response
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Silence that ends a frame once it has started
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(20);

/// Guard delay applied when the bus switches to another device
pub const DEFAULT_INTER_DEVICE_DELAY: Duration = Duration::from_millis(100);

/// Time without a successful read after which a device counts as disconnected
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(3);

/// Silence that ends noise skipping
pub const NOISE_TIMEOUT: Duration = Duration::from_millis(10);

/// Upper bound on bytes discarded by a single noise skip
pub const MAX_NOISE_BYTES: usize = 1024;

/// Dirty registers flushed per wake-up before the poll deadline is re-checked
pub const MAX_FLUSHES_PER_WAKE: usize = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_ADU_SIZE, 256);
        assert_eq!(ADU_OVERHEAD + WRITE_RESPONSE_PDU_SIZE, 8);
    }

    #[test]
    fn test_register_limits() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);

        let write_pdu_size = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS * 2);
        assert!(write_pdu_size <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_coil_limits() {
        let read_coil_pdu = 1 + 1 + MAX_READ_COILS.div_ceil(8);
        assert!(read_coil_pdu <= MAX_PDU_SIZE);

        let write_coil_pdu = 1 + 2 + 2 + 1 + MAX_WRITE_COILS.div_ceil(8);
        assert!(write_coil_pdu <= MAX_PDU_SIZE);
    }
}
