//! Plugin RPC wire types: newline-delimited JSON over a Unix socket.

use serde::{Deserialize, Serialize};
use shoal_core::governance::GovernanceEnvelope;

/// Plugin categories, in pipeline evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginCategory {
    Observability,
    Authentication,
    Authorization,
    RateLimiting,
    Validation,
    Content,
    Audit,
}

impl PluginCategory {
    /// All categories in evaluation order.
    pub const ORDER: [PluginCategory; 7] = [
        PluginCategory::Observability,
        PluginCategory::Authentication,
        PluginCategory::Authorization,
        PluginCategory::RateLimiting,
        PluginCategory::Validation,
        PluginCategory::Content,
        PluginCategory::Audit,
    ];

    /// Parse from the config string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "observability" => Some(Self::Observability),
            "authentication" => Some(Self::Authentication),
            "authorization" => Some(Self::Authorization),
            "rate_limiting" => Some(Self::RateLimiting),
            "validation" => Some(Self::Validation),
            "content" => Some(Self::Content),
            "audit" => Some(Self::Audit),
            _ => None,
        }
    }

    /// Default reject code when a plugin denies without supplying one.
    pub fn default_reject_code(&self) -> &'static str {
        match self {
            PluginCategory::Authentication => "unauthenticated",
            PluginCategory::Authorization => "unauthorized",
            PluginCategory::RateLimiting => "rate_limited",
            PluginCategory::Validation => "invalid_request",
            // Observability denials are ignored unless required; content and
            // audit fall back to the coarse code.
            _ => "rejected",
        }
    }

    /// Whether payload mutations from this category are applied.
    pub fn may_mutate(&self) -> bool {
        matches!(self, PluginCategory::Content)
    }
}

/// Flow a plugin participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginFlow {
    Request,
    Response,
}

impl PluginFlow {
    /// Parse from the config string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            _ => None,
        }
    }
}

/// Identity reported by a plugin during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub category: PluginCategory,
    #[serde(default)]
    pub commit_hash: Option<String>,
    pub flows: Vec<PluginFlow>,
}

/// One frame from host to plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum PluginRequest {
    GetMetadata,
    Configure { config: serde_json::Value },
    CheckReady,
    HandleRequest { envelope: GovernanceEnvelope },
    HandleResponse { envelope: GovernanceEnvelope },
    Shutdown,
}

/// Decision returned for `HandleRequest`/`HandleResponse`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDecision {
    /// Whether the pipeline continues.
    #[serde(rename = "continue")]
    pub continue_: bool,
    /// Reject code when `continue` is false.
    #[serde(default)]
    pub reject_code: Option<String>,
    /// Human message when `continue` is false.
    #[serde(default)]
    pub reject_message: Option<String>,
    /// Mutated request payload (content category only).
    #[serde(default)]
    pub request_json: Option<serde_json::Value>,
    /// Mutated response payload (content category only).
    #[serde(default)]
    pub response_json: Option<serde_json::Value>,
}

impl PluginDecision {
    /// A pass-through decision.
    pub fn allow() -> Self {
        Self {
            continue_: true,
            reject_code: None,
            reject_message: None,
            request_json: None,
            response_json: None,
        }
    }

    /// A denial with an explicit code.
    pub fn deny(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            continue_: false,
            reject_code: Some(code.into()),
            reject_message: Some(message.into()),
            request_json: None,
            response_json: None,
        }
    }
}

/// One frame from plugin to host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum PluginResponse {
    Metadata(PluginMetadata),
    Ready { ok: bool },
    Decision(PluginDecision),
    Ack,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_order_is_fixed() {
        let labels: Vec<&str> = PluginCategory::ORDER
            .iter()
            .map(|c| match c {
                PluginCategory::Observability => "observability",
                PluginCategory::Authentication => "authentication",
                PluginCategory::Authorization => "authorization",
                PluginCategory::RateLimiting => "rate_limiting",
                PluginCategory::Validation => "validation",
                PluginCategory::Content => "content",
                PluginCategory::Audit => "audit",
            })
            .collect();
        assert_eq!(
            labels,
            vec![
                "observability",
                "authentication",
                "authorization",
                "rate_limiting",
                "validation",
                "content",
                "audit"
            ]
        );
    }

    #[test]
    fn decision_wire_format_uses_continue() {
        let json = serde_json::to_string(&PluginDecision::allow()).unwrap();
        assert!(json.contains("\"continue\":true"));

        let decision: PluginDecision =
            serde_json::from_str(r#"{"continue":false,"reject_code":"unauthorized"}"#).unwrap();
        assert!(!decision.continue_);
        assert_eq!(decision.reject_code.as_deref(), Some("unauthorized"));
    }

    #[test]
    fn only_content_may_mutate() {
        for category in PluginCategory::ORDER {
            assert_eq!(category.may_mutate(), category == PluginCategory::Content);
        }
    }

    #[test]
    fn default_reject_codes() {
        assert_eq!(
            PluginCategory::Authentication.default_reject_code(),
            "unauthenticated"
        );
        assert_eq!(
            PluginCategory::Authorization.default_reject_code(),
            "unauthorized"
        );
        assert_eq!(
            PluginCategory::RateLimiting.default_reject_code(),
            "rate_limited"
        );
        assert_eq!(
            PluginCategory::Validation.default_reject_code(),
            "invalid_request"
        );
        assert_eq!(PluginCategory::Content.default_reject_code(), "rejected");
    }
}
