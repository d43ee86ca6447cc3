//! Request router: resolve, govern, acquire, call, release.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rmcp::model::{CallToolRequestParams, GetPromptRequestParams};
use serde_json::Value;
use shoal_types::StartCause;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::catalog::SpecKey;
use crate::config::Strategy;
use crate::error::{CoreError, CoreResult};
use crate::events::IndexKind;
use crate::governance::{GovernanceEnvelope, GovernanceFlow, GovernanceReject, Governor};
use crate::registry::ClientRegistry;
use crate::scheduler::{Lease, Scheduler, SharedCatalog};
use crate::transport::TransportError;

/// A decoded request entering the router.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Caller identity; `None` routes with full visibility (internal use).
    pub client_id: Option<Uuid>,
    /// MCP method: `tools/call`, `resources/read`, or `prompts/get`.
    pub method: String,
    /// Namespaced tool/prompt name, or resource URI.
    pub target: String,
    /// Session affinity token for stateful specs.
    pub routing_key: Option<String>,
    /// Method payload (tool arguments, prompt arguments).
    pub payload: Value,
}

/// The single public entry for dispatching a decoded request.
pub struct Router {
    scheduler: Arc<Scheduler>,
    aggregator: Arc<Aggregator>,
    registry: Arc<ClientRegistry>,
    governor: Arc<dyn Governor>,
    catalog: SharedCatalog,
}

impl Router {
    /// Wire a router over its collaborators.
    pub fn new(
        scheduler: Arc<Scheduler>,
        aggregator: Arc<Aggregator>,
        registry: Arc<ClientRegistry>,
        governor: Arc<dyn Governor>,
        catalog: SharedCatalog,
    ) -> Self {
        Self {
            scheduler,
            aggregator,
            registry,
            governor,
            catalog,
        }
    }

    fn route_budget(&self) -> Duration {
        let secs = self
            .catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .runtime()
            .route_timeout_seconds
            .max(1);
        Duration::from_secs(secs)
    }

    async fn visible_keys(&self, client_id: Option<Uuid>) -> CoreResult<Vec<SpecKey>> {
        match client_id {
            Some(id) => self.registry.resolve_visible(id),
            None => Ok(self
                .catalog
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .enabled_keys()),
        }
    }

    /// Resolve the spec and original item name for a request. Hidden and
    /// unknown targets are indistinguishable.
    async fn resolve_target(
        &self,
        req: &RouteRequest,
        visible: &[SpecKey],
    ) -> CoreResult<(SpecKey, String)> {
        let not_found = || CoreError::not_found(format!("'{}'", req.target));
        let (kind, by_uri) = match req.method.as_str() {
            "tools/call" => (IndexKind::Tools, false),
            "resources/read" => (IndexKind::Resources, true),
            "prompts/get" => (IndexKind::Prompts, false),
            other => {
                return Err(CoreError::invalid_argument(format!(
                    "method '{other}' is not routable"
                )))
            }
        };
        let snapshot = self.aggregator.snapshot(kind).await;
        let item = if by_uri {
            snapshot.resolve_uri(&req.target)
        } else {
            snapshot.resolve(&req.target)
        }
        .ok_or_else(not_found)?;
        if !visible.contains(&item.spec) {
            return Err(not_found());
        }
        let dispatch_name = if by_uri {
            item.uri.clone().unwrap_or_else(|| item.name.clone())
        } else {
            item.name.clone()
        };
        Ok((item.spec.clone(), dispatch_name))
    }

    fn client_metadata(
        &self,
        client_id: Option<Uuid>,
    ) -> std::collections::BTreeMap<String, String> {
        let mut metadata = std::collections::BTreeMap::new();
        if let Some(id) = client_id {
            if let Ok(record) = self.registry.get(id) {
                metadata.insert("client_name".to_string(), record.name);
                metadata.insert("client_tags".to_string(), record.tags.join(","));
            }
        }
        metadata
    }

    /// Route one request to an instance of the owning spec.
    ///
    /// The route budget covers acquire plus call. On a connection loss the
    /// instance is failed and the call retried once on a fresh instance,
    /// for non-stateful strategies only.
    pub async fn route(&self, req: RouteRequest) -> CoreResult<Value> {
        let started = Instant::now();
        let deadline = started + self.route_budget();

        let visible = self.visible_keys(req.client_id).await?;
        let (spec_key, item_name) = self.resolve_target(&req, &visible).await?;

        let envelope = GovernanceEnvelope {
            flow: GovernanceFlow::Request,
            method: req.method.clone(),
            tool_name: (req.method == "tools/call").then(|| req.target.clone()),
            metadata: self.client_metadata(req.client_id),
            request_json: req.payload.clone(),
            response_json: None,
        };
        let envelope = self
            .governor
            .check_request(envelope)
            .await
            .map_err(reject_to_error)?;
        let payload = envelope.request_json.clone();

        let strategy = {
            let catalog = self.catalog.read().unwrap_or_else(|e| e.into_inner());
            catalog
                .get(&spec_key)
                .map(|s| s.strategy)
                .unwrap_or(Strategy::Stateless)
        };
        let retry_allowed = strategy != Strategy::Stateful;

        let mut attempt = 0u32;
        let response = loop {
            attempt += 1;
            let lease = self
                .acquire_within(&req, &spec_key, deadline)
                .await?;
            match self
                .dispatch(&req.method, &item_name, &payload, &lease, deadline)
                .await
            {
                Ok(response) => {
                    lease.pool().record_call(started.elapsed(), false);
                    self.scheduler.release(lease, None);
                    break response;
                }
                Err(err) => {
                    lease.pool().record_call(started.elapsed(), true);
                    let core_err: CoreError = err;
                    let connection_lost =
                        matches!(core_err, CoreError::ConnectionClosed { .. });
                    self.scheduler.release(lease, Some(&core_err));
                    if connection_lost && retry_allowed && attempt == 1 {
                        debug!(spec = %spec_key, "connection lost; retrying on a fresh instance");
                        continue;
                    }
                    return Err(core_err);
                }
            }
        };

        let envelope = GovernanceEnvelope {
            flow: GovernanceFlow::Response,
            method: req.method,
            tool_name: envelope.tool_name,
            metadata: envelope.metadata,
            request_json: payload,
            response_json: Some(response),
        };
        let envelope = self
            .governor
            .check_response(envelope)
            .await
            .map_err(reject_to_error)?;
        envelope
            .response_json
            .ok_or_else(|| CoreError::internal("governance dropped the response payload"))
    }

    async fn acquire_within(
        &self,
        req: &RouteRequest,
        spec_key: &SpecKey,
        deadline: Instant,
    ) -> CoreResult<Lease> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CoreError::deadline("instance acquisition"));
        }
        let cause = StartCause::ToolCall(req.target.clone());
        match timeout(
            remaining,
            self.scheduler
                .acquire(spec_key, req.routing_key.as_deref(), cause),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::deadline("instance acquisition")),
        }
    }

    async fn dispatch(
        &self,
        method: &str,
        item_name: &str,
        payload: &Value,
        lease: &Lease,
        deadline: Instant,
    ) -> CoreResult<Value> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CoreError::deadline("downstream call"));
        }
        let conn = lease.conn();
        let call = async {
            match method {
                "tools/call" => {
                    let arguments = match payload {
                        Value::Object(map) => Some(map.clone()),
                        Value::Null => None,
                        other => {
                            let mut map = serde_json::Map::new();
                            map.insert("value".to_string(), other.clone());
                            Some(map)
                        }
                    };
                    let params = CallToolRequestParams {
                        name: item_name.to_string().into(),
                        arguments,
                        task: None,
                        meta: None,
                    };
                    conn.call_tool(params)
                        .await
                        .and_then(|r| to_json(&r))
                }
                "resources/read" => conn
                    .read_resource(item_name)
                    .await
                    .and_then(|r| to_json(&r)),
                "prompts/get" => {
                    let arguments = payload.as_object().cloned();
                    let params = GetPromptRequestParams {
                        meta: None,
                        name: item_name.to_string(),
                        arguments,
                    };
                    conn.get_prompt(params).await.and_then(|r| to_json(&r))
                }
                other => Err(TransportError::protocol(format!(
                    "method '{other}' is not dispatchable"
                ))),
            }
        };
        match timeout(remaining, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(CoreError::deadline("downstream call")),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, TransportError> {
    serde_json::to_value(value)
        .map_err(|err| TransportError::protocol(format!("response serialization failed: {err}")))
}

/// Map a governance rejection onto a core error, preserving the plugin's
/// code in the message prefix so it survives to the RPC boundary.
fn reject_to_error(reject: GovernanceReject) -> CoreError {
    use shoal_types::ErrorCode;
    let message = format!("{}: {}", reject.code, reject.message);
    match reject.error_code() {
        ErrorCode::Unauthenticated => CoreError::Unauthenticated { message },
        ErrorCode::ResourceExhausted => CoreError::ResourceExhausted { message },
        ErrorCode::InvalidArgument => CoreError::InvalidArgument { message },
        ErrorCode::Unavailable => CoreError::Unavailable { message },
        _ => CoreError::PermissionDenied { message },
    }
}
