//! Error types for the Modbus gateway service
//!
//! One enum per module boundary. Every enum implements
//! [`errors::ServiceError`] so the HTTP surface can derive status codes and
//! payloads without knowing the domain.

use std::net::SocketAddr;

use errors::{ErrorCategory, ServiceError};
use thiserror::Error;

use crate::store::Table;

/// Framing errors raised while decoding an inbound ADU.
///
/// Connection-local: the offending connection is closed, nothing is sent back.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("unsupported protocol id: {0:#06x}")]
    ProtocolId(u16),

    #[error("length field {0} outside 2..=254")]
    LengthOutOfRange(u16),

    #[error("length field {declared} does not match unit id + PDU size {actual}")]
    LengthMismatch { declared: u16, actual: usize },

    #[error("PDU too large: {0} bytes")]
    PduTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Modbus exception codes answered on the wire
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    #[error("illegal function")]
    IllegalFunction = 0x01,

    #[error("illegal data address")]
    IllegalDataAddress = 0x02,

    #[error("illegal data value")]
    IllegalDataValue = 0x03,
}

impl ExceptionCode {
    /// Wire value of the exception code
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<StoreError> for ExceptionCode {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OutOfRange { .. } => ExceptionCode::IllegalDataAddress,
            StoreError::NotWritable(_) => ExceptionCode::IllegalFunction,
        }
    }
}

/// Register store access errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{table} range {start}+{count} outside table size {size}")]
    OutOfRange {
        table: Table,
        start: u16,
        count: usize,
        size: usize,
    },

    #[error("{0} is read-only")]
    NotWritable(Table),
}

/// Point lookup and value conversion errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PointError {
    #[error("point '{0}' not found")]
    NotFound(String),

    #[error("point '{name}': {reason}")]
    TypeMismatch { name: String, reason: String },

    #[error("point '{name}': {reason}")]
    OutOfRange { name: String, reason: String },

    #[error("point '{0}' is read-only")]
    NotWritable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration errors, fatal at startup
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("duplicate point name '{0}'")]
    DuplicatePoint(String),

    #[error("invalid point '{name}': {reason}")]
    InvalidPoint { name: String, reason: String },

    #[error("points '{first}' and '{second}' overlap with different data types")]
    PointOverlap { first: String, second: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_point(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPoint {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Driver lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watchdog: {0}")]
    Watchdog(String),

    #[error("invalid listen address '{0}'")]
    Address(String),
}

impl LifecycleError {
    pub fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}

// ============================================================================
// ServiceError implementations (HTTP mapping)
// ============================================================================

impl ServiceError for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::OutOfRange { .. } => "ADDRESS_OUT_OF_RANGE",
            Self::NotWritable(_) => "NOT_WRITABLE",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::OutOfRange { .. } => ErrorCategory::Validation,
            Self::NotWritable(_) => ErrorCategory::Permission,
        }
    }
}

impl ServiceError for PointError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "POINT_NOT_FOUND",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::OutOfRange { .. } => "VALUE_OUT_OF_RANGE",
            Self::NotWritable(_) => "NOT_WRITABLE",
            Self::Store(e) => e.error_code(),
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::TypeMismatch { .. } | Self::OutOfRange { .. } => ErrorCategory::Validation,
            Self::NotWritable(_) => ErrorCategory::Permission,
            Self::Store(e) => e.category(),
        }
    }
}

impl ServiceError for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Load(_) => "CONFIG_LOAD",
            Self::Invalid { .. } => "CONFIG_INVALID",
            Self::DuplicatePoint(_) => "DUPLICATE_POINT",
            Self::InvalidPoint { .. } => "INVALID_POINT",
            Self::PointOverlap { .. } => "POINT_OVERLAP",
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}

impl ServiceError for LifecycleError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "BIND_FAILED",
            Self::Io(_) => "IO_ERROR",
            Self::Watchdog(_) => "WATCHDOG",
            Self::Address(_) => "INVALID_ADDRESS",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            // Port already taken or driver busy: conflicting resource state
            Self::Bind { .. } => ErrorCategory::Conflict,
            Self::Address(_) => ErrorCategory::Configuration,
            Self::Io(_) | Self::Watchdog(_) => ErrorCategory::Internal,
        }
    }
}

impl ServiceError for FrameError {
    fn error_code(&self) -> &'static str {
        "MALFORMED_FRAME"
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Protocol
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_store_error_to_exception() {
        let oor = StoreError::OutOfRange {
            table: Table::HoldingRegisters,
            start: 9,
            count: 2,
            size: 10,
        };
        assert_eq!(
            ExceptionCode::from(oor),
            ExceptionCode::IllegalDataAddress
        );
        assert_eq!(
            ExceptionCode::from(StoreError::NotWritable(Table::InputRegisters)),
            ExceptionCode::IllegalFunction
        );
    }

    #[test]
    fn test_exception_wire_values() {
        assert_eq!(ExceptionCode::IllegalFunction.code(), 0x01);
        assert_eq!(ExceptionCode::IllegalDataAddress.code(), 0x02);
        assert_eq!(ExceptionCode::IllegalDataValue.code(), 0x03);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(PointError::NotFound("x".into()).status_code(), 404);
        assert_eq!(
            PointError::TypeMismatch {
                name: "x".into(),
                reason: "expected bool".into()
            }
            .status_code(),
            400
        );
        assert_eq!(PointError::NotWritable("x".into()).status_code(), 403);
        assert_eq!(
            PointError::Store(StoreError::NotWritable(Table::DiscreteInputs)).status_code(),
            403
        );
        assert_eq!(ConfigError::Load("boom".into()).status_code(), 500);

        let bind = LifecycleError::Bind {
            addr: "127.0.0.1:502".into(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert_eq!(bind.status_code(), 409);
    }
}
