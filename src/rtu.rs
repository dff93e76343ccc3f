//! # Modbus RTU Framing
//!
//! ADU layout: `[slave][PDU][CRC lo][CRC hi]`. The CRC is CRC-16/MODBUS
//! (reflected polynomial 0xA001, init 0xFFFF) over every preceding byte and
//! goes on the wire low byte first.
//!
//! ## Response validation
//!
//! Checks run in this order, the first failure wins:
//!
//! 1. Frame length: an exception PDU is 2 bytes, a read response
//!    `2 + byte_count`, a write echo 5 bytes
//! 2. CRC
//! 3. Echoed slave id, then function code (exception bit masked)
//! 4. Exception code: illegal function/address/value are permanent,
//!    everything else transient
//! 5. Byte count of reads

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use tracing::debug;

use crate::constants::{
    ADU_OVERHEAD, EXCEPTION_ACKNOWLEDGE, EXCEPTION_GATEWAY_PATH_UNAVAILABLE,
    EXCEPTION_GATEWAY_TARGET_FAILED, EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_VALUE,
    EXCEPTION_ILLEGAL_FUNCTION, EXCEPTION_MEMORY_PARITY_ERROR, EXCEPTION_PDU_SIZE,
    EXCEPTION_SERVER_DEVICE_BUSY, EXCEPTION_SERVER_DEVICE_FAILURE, WRITE_RESPONSE_PDU_SIZE,
};
use crate::error::{PermanentError, SerialError, SerialResult, TransientError};
use crate::pdu::{function_code_description, payload_len, ModbusFunction, ModbusPdu};

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Smallest frame that can be validated (exception response).
pub const MIN_RESPONSE_LEN: usize = 1 + EXCEPTION_PDU_SIZE + 2;

// ============================================================================
// CRC
// ============================================================================

/// CRC-16/MODBUS of `data`.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC of the buffer, low byte first.
#[inline]
pub fn append_crc(frame: &mut BytesMut) {
    let crc = crc16(frame);
    frame.put_u16_le(crc);
}

/// Check the trailing CRC of a complete frame.
pub fn check_crc(frame: &[u8]) -> SerialResult<()> {
    if frame.len() < 3 {
        return Err(SerialError::malformed(format!(
            "frame too short for CRC: {} bytes",
            frame.len()
        )));
    }
    let body = frame.len() - 2;
    let received = u16::from_le_bytes([frame[body], frame[body + 1]]);
    let calculated = crc16(&frame[..body]);
    if received != calculated {
        return Err(SerialError::invalid_crc(calculated, received));
    }
    Ok(())
}

/// Check if the trailing CRC of a complete frame is valid.
#[inline]
pub fn is_crc_valid(frame: &[u8]) -> bool {
    check_crc(frame).is_ok()
}

// ============================================================================
// Requests
// ============================================================================

/// Wrap a PDU into an RTU frame.
pub fn compose_adu(slave: u8, pdu: &ModbusPdu) -> Bytes {
    let mut frame = BytesMut::with_capacity(pdu.len() + ADU_OVERHEAD);
    frame.put_u8(slave);
    frame.put_slice(pdu.as_slice());
    append_crc(&mut frame);
    frame.freeze()
}

/// Length of a complete normal response frame.
#[inline]
pub fn expected_response_len(function: ModbusFunction, count: u16) -> usize {
    1 + function.response_pdu_len(count) + 2
}

/// Completion test for a response frame.
///
/// An exception frame is complete after 5 bytes, anything else after
/// `expected_len` bytes.
pub fn frame_complete(expected_len: usize) -> impl Fn(&[u8]) -> bool + Send + Sync + Copy {
    move |buf: &[u8]| {
        if buf.len() >= 2 && buf[1] & 0x80 != 0 {
            buf.len() >= MIN_RESPONSE_LEN
        } else {
            buf.len() >= expected_len
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Body of a validated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtuResponse<'a> {
    /// Payload of a read, byte count stripped
    Read(&'a [u8]),
    /// Echoed address and value/quantity of a write
    Write { address: u16, value: u16 },
}

/// Map a Modbus exception code onto the error taxonomy.
pub fn exception_error(function: u8, code: u8) -> SerialError {
    let message = exception_message(code).to_string();
    let function = function & 0x7F;
    match code {
        EXCEPTION_ILLEGAL_FUNCTION | EXCEPTION_ILLEGAL_DATA_ADDRESS | EXCEPTION_ILLEGAL_DATA_VALUE => {
            PermanentError::Exception {
                function,
                code,
                message,
            }
            .into()
        }
        _ => TransientError::Exception {
            function,
            code,
            message,
        }
        .into(),
    }
}

fn exception_message(code: u8) -> &'static str {
    match code {
        EXCEPTION_ILLEGAL_FUNCTION => "Illegal function",
        EXCEPTION_ILLEGAL_DATA_ADDRESS => "Illegal data address",
        EXCEPTION_ILLEGAL_DATA_VALUE => "Illegal data value",
        EXCEPTION_SERVER_DEVICE_FAILURE => "Server device failure",
        EXCEPTION_ACKNOWLEDGE => "Acknowledge",
        EXCEPTION_SERVER_DEVICE_BUSY => "Server device busy",
        EXCEPTION_MEMORY_PARITY_ERROR => "Memory parity error",
        EXCEPTION_GATEWAY_PATH_UNAVAILABLE => "Gateway path unavailable",
        EXCEPTION_GATEWAY_TARGET_FAILED => "Gateway target device failed to respond",
        _ => "Unknown exception",
    }
}

/// Validate a response frame against its request.
///
/// # Arguments
/// * `slave` - Slave id of the request
/// * `function` - Function of the request
/// * `count` - Number of registers requested (reads only)
/// * `frame` - Received bytes
pub fn parse_response<'a>(
    slave: u8,
    function: ModbusFunction,
    count: u16,
    frame: &'a [u8],
) -> SerialResult<RtuResponse<'a>> {
    if frame.len() < MIN_RESPONSE_LEN {
        return Err(SerialError::malformed(format!(
            "response too short: {} bytes",
            frame.len()
        )));
    }

    let exception = frame[1] & 0x80 != 0;
    let pdu_len = if exception {
        EXCEPTION_PDU_SIZE
    } else if function.is_read() {
        2 + usize::from(frame[2])
    } else {
        WRITE_RESPONSE_PDU_SIZE
    };
    let expected = pdu_len + ADU_OVERHEAD;
    if frame.len() != expected {
        let what = if frame.len() < expected {
            "incomplete"
        } else {
            "oversized"
        };
        return Err(SerialError::malformed(format!(
            "{what} response: {} of {expected} bytes",
            frame.len()
        )));
    }

    check_crc(frame)?;

    if frame[0] != slave {
        return Err(TransientError::SlaveMismatch {
            expected: slave,
            actual: frame[0],
        }
        .into());
    }
    if frame[1] & 0x7F != function.code() {
        return Err(TransientError::FunctionMismatch {
            expected: function.code(),
            actual: frame[1] & 0x7F,
        }
        .into());
    }

    if exception {
        debug!(
            "Exception response: FC={:02X} ({}), code={:02X}",
            frame[1],
            function_code_description(frame[1]),
            frame[2]
        );
        return Err(exception_error(frame[1], frame[2]));
    }

    if function.is_read() {
        let expected = payload_len(function.is_bit_access(), count);
        let actual = usize::from(frame[2]);
        if actual != expected {
            return Err(SerialError::malformed(format!(
                "byte count {actual}, expected {expected}"
            )));
        }
        return Ok(RtuResponse::Read(&frame[3..3 + actual]));
    }

    Ok(RtuResponse::Write {
        address: u16::from_be_bytes([frame[2], frame[3]]),
        value: u16::from_be_bytes([frame[4], frame[5]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::read_request;
    use crate::register::ModbusKind;

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = BytesMut::from(body);
        append_crc(&mut frame);
        frame.to_vec()
    }

    #[test]
    fn test_crc_wire_order() {
        let pdu = read_request(ModbusKind::Holding, 0, 10).unwrap();
        let adu = compose_adu(1, &pdu);
        assert_eq!(
            adu.as_ref(),
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]
        );
        assert_eq!(crc16(&adu[..6]), 0xCDC5);
    }

    #[test]
    fn test_crc_validity() {
        let frame = [0x01, 0x03, 0x02, 0x00, 0x2A, 0x39, 0x9B];
        assert!(is_crc_valid(&frame));

        for bit in 0..8 {
            let mut corrupt = frame;
            corrupt[3] ^= 1 << bit;
            assert!(!is_crc_valid(&corrupt));
        }
        assert!(!is_crc_valid(&[0x01, 0x02]));
    }

    #[test]
    fn test_read_response() {
        let frame = [0x01, 0x03, 0x02, 0x00, 0x2A, 0x39, 0x9B];
        let response =
            parse_response(1, ModbusFunction::ReadHoldingRegisters, 1, &frame).unwrap();
        assert_eq!(response, RtuResponse::Read(&[0x00, 0x2A]));
    }

    #[test]
    fn test_write_response() {
        let frame = with_crc(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]);
        let response = parse_response(1, ModbusFunction::WriteSingleRegister, 1, &frame).unwrap();
        assert_eq!(
            response,
            RtuResponse::Write {
                address: 1,
                value: 3
            }
        );
    }

    #[test]
    fn test_corrupt_crc() {
        let mut frame = [0x01, 0x03, 0x02, 0x00, 0x2A, 0x39, 0x9B];
        frame[4] = 0x2B;
        let err = parse_response(1, ModbusFunction::ReadHoldingRegisters, 1, &frame).unwrap_err();
        assert!(matches!(
            err,
            SerialError::Transient(TransientError::InvalidCrc { .. })
        ));
    }

    #[test]
    fn test_mismatches() {
        let frame = with_crc(&[0x11, 0x03, 0x02, 0x00, 0x2A]);
        let err = parse_response(1, ModbusFunction::ReadHoldingRegisters, 1, &frame).unwrap_err();
        assert!(matches!(
            err,
            SerialError::Transient(TransientError::SlaveMismatch {
                expected: 1,
                actual: 0x11
            })
        ));

        let frame = with_crc(&[0x01, 0x04, 0x02, 0x00, 0x2A]);
        let err = parse_response(1, ModbusFunction::ReadHoldingRegisters, 1, &frame).unwrap_err();
        assert!(matches!(
            err,
            SerialError::Transient(TransientError::FunctionMismatch { .. })
        ));
    }

    #[test]
    fn test_byte_count_mismatch() {
        let frame = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        let err = parse_response(1, ModbusFunction::ReadHoldingRegisters, 2, &frame).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_short_and_truncated() {
        let err = parse_response(1, ModbusFunction::ReadCoils, 1, &[0x01, 0x01]).unwrap_err();
        assert!(err.is_transient());

        // byte count promises more than arrived
        let err = parse_response(
            1,
            ModbusFunction::ReadHoldingRegisters,
            2,
            &[0x01, 0x03, 0x04, 0x00, 0x01, 0x00],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SerialError::Transient(TransientError::Malformed { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = vec![0x01, 0x03, 0x02, 0x00, 0x2A, 0x39, 0x9B];
        frame.push(0x00);
        let err = parse_response(1, ModbusFunction::ReadHoldingRegisters, 1, &frame).unwrap_err();
        assert!(matches!(
            err,
            SerialError::Transient(TransientError::Malformed { .. })
        ));

        let mut echo = vec![0x01, 0x06, 0x00, 0x05, 0x00, 0x07, 0xD8, 0x09];
        echo.extend_from_slice(&[0xD8, 0x09]);
        let err = parse_response(1, ModbusFunction::WriteSingleRegister, 1, &echo).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_exception_classes() {
        let frame = [0x01, 0x83, 0x02, 0xC0, 0xF1];
        let err = parse_response(1, ModbusFunction::ReadHoldingRegisters, 1, &frame).unwrap_err();
        assert!(err.is_permanent());

        let frame = with_crc(&[0x01, 0x83, 0x06]);
        let err = parse_response(1, ModbusFunction::ReadHoldingRegisters, 1, &frame).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_frame_complete() {
        let complete = frame_complete(expected_response_len(
            ModbusFunction::ReadHoldingRegisters,
            2,
        ));
        assert!(!complete(&[0x01, 0x03, 0x04, 0x00]));
        assert!(complete(&[0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00]));
        assert!(!complete(&[0x01, 0x83, 0x02]));
        assert!(complete(&[0x01, 0x83, 0x02, 0xC0, 0xF1]));
    }
}
