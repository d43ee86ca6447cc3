//! The rmcp `ServerHandler` bridging MCP sessions into the core.

use std::sync::Arc;

use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult,
    Implementation, ListPromptsResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParams, Prompt, ProtocolVersion, ReadResourceRequestParams,
    ReadResourceResult, Resource, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{ErrorData as McpError, ServerHandler};
use shoal_core::aggregator::Item;
use shoal_core::catalog::SpecKey;
use shoal_core::error::CoreError;
use shoal_core::Core;
use shoal_types::ErrorCode;
use tracing::{debug, warn};
use uuid::Uuid;

/// How a gateway session scopes the catalog.
#[derive(Debug, Clone, Default)]
pub enum GatewayMode {
    /// Aggregate every spec the session's tags allow (empty tags: all).
    #[default]
    Aggregate,
    /// Aggregate specs carrying any of these tags.
    TagScoped(Vec<String>),
    /// Bypass aggregation; forward under one fixed spec.
    SingleServer(String),
}

/// One MCP session bridged into the core.
pub struct GatewayService {
    core: Arc<Core>,
    client_id: Uuid,
    notifier_started: std::sync::atomic::AtomicBool,
}

impl GatewayService {
    /// Register a caller for this session and build the handler.
    pub fn new(core: Arc<Core>, mode: GatewayMode) -> Result<Self, CoreError> {
        let (tags, pin) = match mode {
            GatewayMode::Aggregate => (Vec::new(), None),
            GatewayMode::TagScoped(tags) => (tags, None),
            GatewayMode::SingleServer(name) => (Vec::new(), Some(SpecKey::new(name))),
        };
        let session = Uuid::new_v4();
        let client_id = core.register_client(
            &format!("gateway-{session}"),
            std::process::id(),
            tags,
            pin,
        )?;
        Ok(Self {
            core,
            client_id,
            notifier_started: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// The registered caller behind this session.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Start the list-changed notifier for this session's peer, once.
    fn ensure_notifier(&self, peer: &rmcp::service::Peer<RoleServer>) {
        if self
            .notifier_started
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        crate::notify::spawn_notifier(Arc::clone(&self.core), self.client_id, peer.clone());
    }

    fn map_error(err: CoreError) -> McpError {
        let message = err.to_string();
        match err.code() {
            ErrorCode::NotFound | ErrorCode::InvalidArgument => {
                McpError::invalid_params(message, None)
            }
            ErrorCode::Unauthenticated | ErrorCode::PermissionDenied => {
                McpError::invalid_request(message, None)
            }
            _ => McpError::internal_error(message, None),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, McpError> {
        serde_json::from_value(value)
            .map_err(|err| McpError::internal_error(format!("malformed core payload: {err}"), None))
    }
}

impl Drop for GatewayService {
    fn drop(&mut self) {
        self.core.deregister_client(self.client_id);
    }
}

impl ServerHandler for GatewayService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .enable_resources()
                .enable_prompts()
                .build(),
            protocol_version: ProtocolVersion::LATEST,
            server_info: Implementation {
                name: "shoal".to_string(),
                title: Some("Shoal MCP Control Plane".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: None,
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        // The session peer first becomes reachable here; hand it to the
        // notifier so ETag changes flow back as list_changed notifications.
        self.ensure_notifier(&context.peer);
        let (items, _etag) = self
            .core
            .list_tools(Some(self.client_id), None)
            .await
            .map_err(Self::map_error)?;
        let tools: Vec<Tool> = items
            .into_iter()
            .filter_map(|item| match item.item {
                Item::Tool(mut tool) => {
                    tool.name = item.namespaced_name.into();
                    Some(tool)
                }
                _ => None,
            })
            .collect();
        Ok(ListToolsResult {
            meta: None,
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_notifier(&context.peer);
        let arguments = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Null);
        debug!(tool = %request.name, "gateway tool call");
        let value = self
            .core
            .call_tool(Some(self.client_id), &request.name, arguments, None)
            .await
            .map_err(Self::map_error)?;
        Self::decode(value)
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let (items, _etag) = self
            .core
            .list_resources(Some(self.client_id))
            .await
            .map_err(Self::map_error)?;
        let resources: Vec<Resource> = items
            .into_iter()
            .filter_map(|item| match item.item {
                Item::Resource(mut resource) => {
                    resource.name = item.namespaced_name;
                    Some(resource)
                }
                _ => None,
            })
            .collect();
        Ok(ListResourcesResult {
            meta: None,
            resources,
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let value = self
            .core
            .read_resource(Some(self.client_id), &request.uri)
            .await
            .map_err(Self::map_error)?;
        Self::decode(value)
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        let (items, _etag) = self
            .core
            .list_prompts(Some(self.client_id))
            .await
            .map_err(Self::map_error)?;
        let prompts: Vec<Prompt> = items
            .into_iter()
            .filter_map(|item| match item.item {
                Item::Prompt(mut prompt) => {
                    prompt.name = item.namespaced_name;
                    Some(prompt)
                }
                _ => None,
            })
            .collect();
        Ok(ListPromptsResult {
            meta: None,
            prompts,
            next_cursor: None,
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        let arguments = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Null);
        let value = self
            .core
            .get_prompt(Some(self.client_id), &request.name, arguments)
            .await
            .map_err(Self::map_error)?;
        Self::decode(value)
    }
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Log-and-continue helper for session construction in per-session
/// factories.
pub(crate) fn build_or_log(core: &Arc<Core>, mode: &GatewayMode) -> Option<GatewayService> {
    match GatewayService::new(Arc::clone(core), mode.clone()) {
        Ok(service) => Some(service),
        Err(err) => {
            warn!(error = %err, "failed to build gateway session");
            None
        }
    }
}
