//! Governance seam.
//!
//! The router hands every request (and response) to a [`Governor`] before
//! and after dispatch. The real pipeline with out-of-process plugins lives
//! in the `shoal-governance` crate; the core only defines the envelope, the
//! decision shape, and a pass-through default.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shoal_types::ErrorCode;

/// Direction of a governed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceFlow {
    Request,
    Response,
}

/// The envelope carried through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceEnvelope {
    /// Which flow this evaluation is for.
    pub flow: GovernanceFlow,
    /// MCP method (`tools/call`, `resources/read`, ...).
    pub method: String,
    /// Namespaced tool name for tool calls.
    pub tool_name: Option<String>,
    /// Caller metadata (client name, tags, transport).
    pub metadata: std::collections::BTreeMap<String, String>,
    /// Request payload as JSON.
    pub request_json: serde_json::Value,
    /// Response payload as JSON, present on the response flow.
    pub response_json: Option<serde_json::Value>,
}

/// A rejection produced by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceReject {
    /// Stable reject code (plugin-supplied or the category default).
    pub code: String,
    /// One-line human message.
    pub message: String,
}

impl GovernanceReject {
    /// Map the reject code onto the control-plane error code set.
    pub fn error_code(&self) -> ErrorCode {
        match self.code.as_str() {
            "unauthenticated" => ErrorCode::Unauthenticated,
            "unauthorized" => ErrorCode::PermissionDenied,
            "rate_limited" => ErrorCode::ResourceExhausted,
            "invalid_request" => ErrorCode::InvalidArgument,
            "unavailable" => ErrorCode::Unavailable,
            _ => ErrorCode::PermissionDenied,
        }
    }
}

/// Pipeline outcome: pass (with possible content mutations) or reject.
pub type GovernanceResult = Result<GovernanceEnvelope, GovernanceReject>;

/// The governance seam the router calls into.
#[async_trait]
pub trait Governor: Send + Sync {
    /// Evaluate the request flow. The returned envelope carries any content
    /// mutations forward.
    async fn check_request(&self, envelope: GovernanceEnvelope) -> GovernanceResult;

    /// Evaluate the response flow.
    async fn check_response(&self, envelope: GovernanceEnvelope) -> GovernanceResult;
}

/// Pass-through governor used when no plugins are configured.
#[derive(Debug, Default)]
pub struct NoopGovernor;

#[async_trait]
impl Governor for NoopGovernor {
    async fn check_request(&self, envelope: GovernanceEnvelope) -> GovernanceResult {
        Ok(envelope)
    }

    async fn check_response(&self, envelope: GovernanceEnvelope) -> GovernanceResult {
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_codes_map_to_error_codes() {
        let reject = |code: &str| GovernanceReject {
            code: code.into(),
            message: "request rejected".into(),
        };
        assert_eq!(reject("unauthenticated").error_code(), ErrorCode::Unauthenticated);
        assert_eq!(reject("unauthorized").error_code(), ErrorCode::PermissionDenied);
        assert_eq!(reject("rate_limited").error_code(), ErrorCode::ResourceExhausted);
        assert_eq!(reject("invalid_request").error_code(), ErrorCode::InvalidArgument);
        assert_eq!(reject("rejected").error_code(), ErrorCode::PermissionDenied);
    }
}
