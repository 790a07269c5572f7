//! Error handling for the gateway service
//!
//! Four categories, matching how each failure is handled:
//!
//! | Variant      | Raised by                         | Handling                    |
//! |--------------|-----------------------------------|-----------------------------|
//! | `Config`     | config loading, registry          | fatal at startup            |
//! | `Connection` | connection workers, dispatch      | reconnect with backoff      |
//! | `Protocol`   | frame/PDU decoding, exceptions    | frame dropped, logged       |
//! | `Timeout`    | scheduler deadline                | counted, next poll proceeds |

use ems_modbus::{ExceptionCode, ProtocolError};
use thiserror::Error;

/// Gateway service error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GwError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, GwError>;

impl GwError {
    pub fn config(msg: impl Into<String>) -> Self {
        GwError::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        GwError::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        GwError::Timeout(msg.into())
    }

    pub fn not_connected() -> Self {
        GwError::Connection("Not connected".to_string())
    }

    /// Only configuration errors stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, GwError::Config(_))
    }

    /// Modbus exception code, when the slave answered with an exception
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            GwError::Protocol(e) => e.exception_code(),
            _ => None,
        }
    }

    /// Short category name used in logs and health reports
    pub fn kind(&self) -> &'static str {
        match self {
            GwError::Config(_) => "config",
            GwError::Connection(_) => "connection",
            GwError::Protocol(e) if e.exception_code().is_some() => "exception",
            GwError::Protocol(_) => "protocol",
            GwError::Timeout(_) => "timeout",
        }
    }
}

impl From<std::io::Error> for GwError {
    fn from(err: std::io::Error) -> Self {
        GwError::Connection(err.to_string())
    }
}

impl From<figment::Error> for GwError {
    fn from(err: figment::Error) -> Self {
        GwError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for GwError {
    fn from(err: serde_yaml::Error) -> Self {
        GwError::Config(format!("YAML: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_is_fatal() {
        assert!(GwError::config("bad").is_fatal());
        assert!(!GwError::not_connected().is_fatal());
        assert!(!GwError::timeout("3s").is_fatal());
        assert!(!GwError::from(ProtocolError::EmptyPdu).is_fatal());
    }

    #[test]
    fn test_exception_surfaces_code() {
        let err = GwError::from(ProtocolError::Exception {
            function_code: 0x03,
            exception: ExceptionCode::IllegalDataAddress,
        });
        assert_eq!(err.exception_code(), Some(ExceptionCode::IllegalDataAddress));
        assert_eq!(err.kind(), "exception");
        assert_eq!(GwError::from(ProtocolError::EmptyPdu).kind(), "protocol");
    }

    #[test]
    fn test_io_error_maps_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = GwError::from(io);
        assert!(matches!(err, GwError::Connection(ref m) if m.contains("reset by peer")));
    }
}
