//! Error types for the polling engine
//!
//! Every wire operation returns a [`SerialResult`]. The error carries its
//! class as the outer variant so callers match on what to do next rather
//! than on what went wrong:
//!
//! | Class | Typical cause | Engine reaction |
//! |-------|---------------|-----------------|
//! | [`SerialError::Transient`] | CRC mismatch, timeout, wrong echo, closed session | range left unread this cycle, device marked disconnected |
//! | [`SerialError::Permanent`] | device rejects address or parameter | register skipped until reconfiguration |
//! | [`SerialError::Fatal`] | misconfiguration | device initialization aborted |
//! | [`SerialError::InvalidValue`] | malformed text from a producer | returned to the producer |

use thiserror::Error;

/// Result type for all engine operations
pub type SerialResult<T> = Result<T, SerialError>;

/// Retryable communication faults.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransientError {
    /// No (complete) response within the allowed time
    #[error("Timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// CRC of the received frame does not match
    #[error("Invalid CRC: expected 0x{expected:04X}, got 0x{actual:04X}")]
    InvalidCrc { expected: u16, actual: u16 },

    /// Short, truncated or otherwise malformed frame
    #[error("Malformed frame: {message}")]
    Malformed { message: String },

    /// Response came from another slave
    #[error("Slave id mismatch: expected {expected}, got {actual}")]
    SlaveMismatch { expected: u8, actual: u8 },

    /// Response carries another function/command code
    #[error("Function mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    FunctionMismatch { expected: u8, actual: u8 },

    /// Session-oriented device reports that no session is open
    #[error("No open session")]
    NoOpenSession,

    /// Session handshake failed
    #[error("Session setup failed: {message}")]
    SessionSetup { message: String },

    /// Retryable Modbus exception (busy, gateway, ...)
    #[error("Modbus exception: function=0x{function:02X}, code=0x{code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Device-specific error reply that is worth retrying
    #[error("Device error: {message}")]
    Device { message: String },

    /// Port I/O failure
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Operation attempted on a closed port
    #[error("Port is not open")]
    PortClosed,
}

/// Faults where the device explicitly rejected the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PermanentError {
    /// Illegal function, address or value
    #[error("Modbus exception: function=0x{function:02X}, code=0x{code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Device-specific rejection
    #[error("Rejected by device: {message}")]
    Rejected { message: String },

    /// The protocol cannot perform this operation
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },
}

/// Structural setup faults.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// Generic configuration problem
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No protocol registered under this name
    #[error("Unknown protocol: {name}")]
    UnknownProtocol { name: String },

    /// Protocol has no register type with this name
    #[error("Unknown register type '{name}' for protocol {protocol}")]
    UnknownRegisterKind { protocol: String, name: String },

    /// Value format name not recognized
    #[error("Unsupported value format: {name}")]
    UnsupportedFormat { name: String },

    /// Bit offset/width do not fit the format
    #[error("Invalid bit layout: {message}")]
    BitLayout { message: String },
}

/// Engine error, tagged with its class.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerialError {
    #[error("transient: {0}")]
    Transient(#[from] TransientError),

    #[error("permanent: {0}")]
    Permanent(#[from] PermanentError),

    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),

    /// Text could not be converted to a raw register value
    #[error("Invalid value '{text}' for {format}: {message}")]
    InvalidValue {
        text: String,
        format: String,
        message: String,
    },
}

impl SerialError {
    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        TransientError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
        .into()
    }

    /// Create a malformed frame error
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        TransientError::Malformed {
            message: message.into(),
        }
        .into()
    }

    /// Create a CRC mismatch error
    pub fn invalid_crc(expected: u16, actual: u16) -> Self {
        TransientError::InvalidCrc { expected, actual }.into()
    }

    /// Create an I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        TransientError::Io {
            message: message.into(),
        }
        .into()
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        FatalError::Configuration {
            message: message.into(),
        }
        .into()
    }

    /// Create a bit layout error
    pub fn bit_layout<S: Into<String>>(message: S) -> Self {
        FatalError::BitLayout {
            message: message.into(),
        }
        .into()
    }

    /// Create an unsupported-operation error
    pub fn unsupported<S: Into<String>>(operation: S) -> Self {
        PermanentError::Unsupported {
            operation: operation.into(),
        }
        .into()
    }

    /// Create an invalid value error
    pub fn invalid_value<T, F, M>(text: T, format: F, message: M) -> Self
    where
        T: Into<String>,
        F: ToString,
        M: Into<String>,
    {
        SerialError::InvalidValue {
            text: text.into(),
            format: format.to_string(),
            message: message.into(),
        }
    }

    /// Check if the error may go away on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, SerialError::Transient(_))
    }

    /// Check if the device rejected the operation
    pub fn is_permanent(&self) -> bool {
        matches!(self, SerialError::Permanent(_))
    }

    /// Check if the error is a setup-time misconfiguration
    pub fn is_fatal(&self) -> bool {
        matches!(self, SerialError::Fatal(_))
    }

    /// Check if this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, SerialError::Transient(TransientError::Timeout { .. }))
    }
}

impl From<std::io::Error> for SerialError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => SerialError::timeout("I/O operation", 0),
            _ => SerialError::io(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for SerialError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SerialError::timeout("operation", 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SerialError::invalid_crc(0x1234, 0x4321).is_transient());
        assert!(SerialError::unsupported("write").is_permanent());
        assert!(SerialError::config("bad").is_fatal());
        assert!(SerialError::timeout("read", 500).is_timeout());
        assert!(!SerialError::malformed("short").is_timeout());
    }

    #[test]
    fn test_display() {
        let err = SerialError::invalid_crc(0xCDC5, 0x0000);
        assert_eq!(
            err.to_string(),
            "transient: Invalid CRC: expected 0xCDC5, got 0x0000"
        );

        let err = SerialError::invalid_value("abc", "u16", "not a number");
        assert_eq!(err.to_string(), "Invalid value 'abc' for u16: not a number");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: SerialError = io.into();
        assert!(matches!(err, SerialError::Transient(TransientError::Io { .. })));

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let err: SerialError = io.into();
        assert!(err.is_timeout());
    }
}
