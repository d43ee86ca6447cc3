//! Error types for the elastic runtime.

use shoal_types::ErrorCode;
use thiserror::Error;

use crate::transport::TransportError;

/// Main error type for core operations.
///
/// Every variant maps onto exactly one stable [`ErrorCode`]; callers at the
/// RPC and gateway boundary serialize `code()` plus the display string and
/// nothing else — never a backtrace.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("unavailable: {message}")]
    Unavailable { message: String },

    #[error("deadline exceeded during {operation}")]
    DeadlineExceeded { operation: String },

    #[error("unauthenticated: {message}")]
    Unauthenticated { message: String },

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("capacity exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("connection closed: {message}")]
    ConnectionClosed { message: String },

    #[error("unsupported protocol version '{version}' for {transport} transport")]
    UnsupportedProtocol { version: String, transport: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl CoreError {
    /// Stable code for the RPC/gateway boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::NotFound { .. } => ErrorCode::NotFound,
            CoreError::InvalidArgument { .. } | CoreError::Config(_) => ErrorCode::InvalidArgument,
            CoreError::Unavailable { .. } => ErrorCode::Unavailable,
            CoreError::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            CoreError::Unauthenticated { .. } => ErrorCode::Unauthenticated,
            CoreError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            CoreError::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            CoreError::ConnectionClosed { .. } => ErrorCode::ConnectionClosed,
            CoreError::UnsupportedProtocol { .. } => ErrorCode::UnsupportedProtocol,
            CoreError::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Create an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    /// Create a deadline-exceeded error.
    pub fn deadline(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded { operation: operation.into() }
    }

    /// Create a permission-denied error.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied { message: message.into() }
    }

    /// Create a capacity-exhausted (busy) error.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::ResourceExhausted { message: message.into() }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Create an unsupported-protocol error.
    pub fn unsupported_protocol(version: impl Into<String>, transport: impl Into<String>) -> Self {
        Self::UnsupportedProtocol {
            version: version.into(),
            transport: transport.into(),
        }
    }
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionClosed { message } => CoreError::ConnectionClosed { message },
            TransportError::Unavailable { message } => CoreError::Unavailable { message },
            TransportError::TimedOut { operation } => CoreError::DeadlineExceeded { operation },
            TransportError::Protocol { message } => CoreError::Internal { message },
        }
    }
}

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::not_found("tool 'x'").code(), ErrorCode::NotFound);
        assert_eq!(CoreError::busy("saturated").code(), ErrorCode::ResourceExhausted);
        assert_eq!(
            CoreError::unsupported_protocol("2020-01-01", "stdio").code(),
            ErrorCode::UnsupportedProtocol
        );
    }

    #[test]
    fn transport_errors_map_onto_core_codes() {
        let err: CoreError = TransportError::closed("pipe broke").into();
        assert_eq!(err.code(), ErrorCode::ConnectionClosed);
        let err: CoreError = TransportError::timed_out("call").into();
        assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
    }
}
