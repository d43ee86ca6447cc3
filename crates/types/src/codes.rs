//! Stable, machine-readable error codes.
//!
//! Every user-visible failure in the control plane carries exactly one of
//! these codes plus a one-line human message. The set is part of the control
//! RPC contract and must not be extended casually.

use serde::{Deserialize, Serialize};

/// Stable error code set propagated over the control RPC and the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The named entity (spec, tool, resource, prompt, task, client) does
    /// not exist or is not visible to the caller.
    NotFound,
    /// The request was structurally invalid.
    InvalidArgument,
    /// The downstream instance or a required collaborator is unavailable.
    Unavailable,
    /// The per-request deadline elapsed.
    DeadlineExceeded,
    /// The caller is not authenticated.
    Unauthenticated,
    /// The caller is authenticated but not allowed.
    PermissionDenied,
    /// Capacity is saturated; the caller may retry.
    ResourceExhausted,
    /// An unexpected internal failure, contained at the request boundary.
    Internal,
    /// The transport connection closed mid-exchange.
    ConnectionClosed,
    /// The spec's declared protocol version is unsupported or did not match
    /// the negotiated one.
    UnsupportedProtocol,
}

impl ErrorCode {
    /// Wire representation used in RPC error frames and reject payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::ResourceExhausted => "resource_exhausted",
            ErrorCode::Internal => "internal",
            ErrorCode::ConnectionClosed => "connection_closed",
            ErrorCode::UnsupportedProtocol => "unsupported_protocol",
        }
    }

    /// Whether a caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Unavailable | ErrorCode::ResourceExhausted | ErrorCode::ConnectionClosed
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_representation_is_snake_case() {
        let json = serde_json::to_string(&ErrorCode::UnsupportedProtocol).unwrap();
        assert_eq!(json, "\"unsupported_protocol\"");
        assert_eq!(ErrorCode::UnsupportedProtocol.as_str(), "unsupported_protocol");
    }

    #[test]
    fn retryable_classification() {
        assert!(ErrorCode::Unavailable.is_retryable());
        assert!(ErrorCode::ConnectionClosed.is_retryable());
        assert!(!ErrorCode::PermissionDenied.is_retryable());
        assert!(!ErrorCode::NotFound.is_retryable());
    }
}
