//! Codec error types

use std::fmt;
use thiserror::Error;

/// Modbus exception code returned by a slave in an exception response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    /// Code outside the standard table
    Other(u8),
}

impl ExceptionCode {
    /// Raw wire value
    pub fn code(self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::ServerDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::ServerDeviceBusy => 0x06,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetFailedToRespond => 0x0B,
            ExceptionCode::Other(code) => code,
        }
    }

    /// Gateway exceptions mean the device behind the gateway did not answer
    pub fn is_gateway_fault(self) -> bool {
        matches!(
            self,
            ExceptionCode::GatewayPathUnavailable | ExceptionCode::GatewayTargetFailedToRespond
        )
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::ServerDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::ServerDeviceBusy,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailedToRespond,
            other => ExceptionCode::Other(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionCode::IllegalFunction => "illegal function",
            ExceptionCode::IllegalDataAddress => "illegal data address",
            ExceptionCode::IllegalDataValue => "illegal data value",
            ExceptionCode::ServerDeviceFailure => "server device failure",
            ExceptionCode::Acknowledge => "acknowledge",
            ExceptionCode::ServerDeviceBusy => "server device busy",
            ExceptionCode::MemoryParityError => "memory parity error",
            ExceptionCode::GatewayPathUnavailable => "gateway path unavailable",
            ExceptionCode::GatewayTargetFailedToRespond => "gateway target failed to respond",
            ExceptionCode::Other(_) => "unknown exception",
        };
        write!(f, "{} (0x{:02X})", name, self.code())
    }
}

/// Errors raised while building or parsing Modbus TCP frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame too short: {len} bytes (min {min})")]
    FrameTooShort { len: usize, min: usize },

    #[error("Invalid protocol ID: expected 0, got {0}")]
    InvalidProtocolId(u16),

    #[error("MBAP length mismatch: header says {declared}, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Invalid MBAP length field: {0}")]
    InvalidLength(usize),

    #[error("PDU too large: {len} bytes (max {max})")]
    PduTooLarge { len: usize, max: usize },

    #[error("Empty PDU")]
    EmptyPdu,

    #[error("Unit ID mismatch: expected {expected}, got {actual}")]
    UnitMismatch { expected: u8, actual: u8 },

    #[error("Function code mismatch: expected {expected:02X}, got {actual:02X}")]
    FunctionMismatch { expected: u8, actual: u8 },

    #[error("Modbus exception for FC{function_code:02X}: {exception}")]
    Exception {
        function_code: u8,
        exception: ExceptionCode,
    },

    #[error("Unsupported function code: {0:02X}")]
    UnsupportedFunction(u8),

    #[error("Invalid quantity {quantity} for FC{function_code:02X} (allowed 1..={max})")]
    InvalidQuantity {
        function_code: u8,
        quantity: usize,
        max: u16,
    },

    #[error("Address range overflow: start {address} + quantity {quantity}")]
    AddressOverflow { address: u16, quantity: u16 },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl ProtocolError {
    /// Exception code carried by an exception response, if any
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            ProtocolError::Exception { exception, .. } => Some(*exception),
            _ => None,
        }
    }
}

/// Result alias for codec operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_code_roundtrip() {
        for raw in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x08, 0x0A, 0x0B, 0x42] {
            assert_eq!(ExceptionCode::from(raw).code(), raw);
        }
        assert_eq!(ExceptionCode::from(0x42), ExceptionCode::Other(0x42));
    }

    #[test]
    fn test_exception_display() {
        let text = ExceptionCode::IllegalDataAddress.to_string();
        assert_eq!(text, "illegal data address (0x02)");
    }

    #[test]
    fn test_protocol_error_exposes_exception_code() {
        let err = ProtocolError::Exception {
            function_code: 0x03,
            exception: ExceptionCode::ServerDeviceBusy,
        };
        assert_eq!(err.exception_code(), Some(ExceptionCode::ServerDeviceBusy));
        assert!(err.to_string().contains("server device busy"));
        assert_eq!(ProtocolError::EmptyPdu.exception_code(), None);
    }

    #[test]
    fn test_gateway_fault_detection() {
        assert!(ExceptionCode::GatewayTargetFailedToRespond.is_gateway_fault());
        assert!(!ExceptionCode::IllegalFunction.is_gateway_fault());
    }
}
