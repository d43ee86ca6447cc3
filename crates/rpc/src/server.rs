//! Control RPC server hosting a [`shoal_core::Core`].

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use shoal_core::aggregator::{AggregatedItem, Item};
use shoal_core::catalog::SpecKey;
use shoal_core::error::CoreError;
use shoal_core::events::CoreEvent;
use shoal_core::tasks::TaskOptions;
use shoal_core::Core;
use shoal_types::ErrorCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::wire::{codec, RpcMethod, RpcRequest, RpcResponse};

/// The control RPC server.
pub struct RpcServer {
    core: Arc<Core>,
    cancel: CancellationToken,
}

impl RpcServer {
    /// Create a server over a core.
    pub fn new(core: Arc<Core>, cancel: CancellationToken) -> Self {
        Self { core, cancel }
    }

    /// Bind per the runtime's RPC config and serve until cancelled.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let rpc = self.core.catalog().runtime().rpc.clone();
        if rpc.tls.as_ref().is_some_and(|tls| tls.enabled) {
            bail!("rpc.tls is configured but TLS termination is not built in; front the listener with a TLS proxy");
        }
        if rpc.is_unix() {
            self.serve_unix(&rpc).await
        } else {
            self.serve_tcp(&rpc).await
        }
    }

    #[cfg(unix)]
    async fn serve_unix(self: Arc<Self>, rpc: &shoal_core::config::RpcConfig) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path = std::path::PathBuf::from(&rpc.listen_address);
        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let listener = tokio::net::UnixListener::bind(&path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(rpc.socket_mode))
            .await?;
        info!(path = %path.display(), "control RPC listening");

        let max_frame = rpc.max_recv_msg_size.max(rpc.max_send_msg_size);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { continue };
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, max_frame).await;
                    });
                }
            }
        }
        let _ = tokio::fs::remove_file(&path).await;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn serve_unix(self: Arc<Self>, _rpc: &shoal_core::config::RpcConfig) -> Result<()> {
        bail!("unix socket listeners require a unix platform")
    }

    async fn serve_tcp(self: Arc<Self>, rpc: &shoal_core::config::RpcConfig) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&rpc.listen_address)
            .await
            .with_context(|| format!("failed to bind {}", rpc.listen_address))?;
        info!(addr = %rpc.listen_address, "control RPC listening");

        let max_frame = rpc.max_recv_msg_size.max(rpc.max_send_msg_size);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { continue };
                    stream.set_nodelay(true).ok();
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, max_frame).await;
                    });
                }
            }
        }
        Ok(())
    }

    async fn handle_connection<S>(self: Arc<Self>, stream: S, max_frame: usize)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let framed = Framed::new(Box::pin(stream), codec(max_frame));
        let (mut sink, mut source) = framed.split();
        let (out_tx, mut out_rx) = mpsc::channel::<RpcResponse>(64);

        let writer = tokio::spawn(async move {
            while let Some(response) = out_rx.recv().await {
                let Ok(bytes) = serde_json::to_vec(&response) else {
                    continue;
                };
                if sink.send(bytes.into()).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = source.next().await {
            let Ok(frame) = frame else { break };
            let request: RpcRequest = match serde_json::from_slice(&frame) {
                Ok(request) => request,
                Err(err) => {
                    debug!(error = %err, "malformed RPC frame");
                    let _ = out_tx
                        .send(RpcResponse::err(
                            0,
                            ErrorCode::InvalidArgument,
                            format!("malformed frame: {err}"),
                        ))
                        .await;
                    continue;
                }
            };
            let server = Arc::clone(&self);
            let out = out_tx.clone();
            tokio::spawn(async move {
                server.dispatch(request, out).await;
            });
        }
        drop(out_tx);
        let _ = writer.await;
    }

    async fn dispatch(self: Arc<Self>, request: RpcRequest, out: mpsc::Sender<RpcResponse>) {
        let id = request.id;
        if request.method.is_streaming() {
            self.dispatch_stream(id, request.method, out).await;
            return;
        }
        let response = match self.handle_unary(request.method).await {
            Ok(result) => RpcResponse::ok(id, result),
            Err(err) => RpcResponse::err(id, err.code(), err.to_string()),
        };
        let _ = out.send(response).await;
    }

    async fn handle_unary(&self, method: RpcMethod) -> Result<Value, CoreError> {
        match method {
            RpcMethod::RegisterClient {
                name,
                pid,
                tags,
                server,
            } => {
                let pin = server.map(SpecKey::new);
                let client_id = self.core.register_client(&name, pid, tags, pin)?;
                Ok(serde_json::json!({ "client_id": client_id.to_string() }))
            }
            RpcMethod::Heartbeat { client_id } => {
                self.core.heartbeat(parse_client(&client_id)?)?;
                Ok(serde_json::json!({ "ok": true }))
            }
            RpcMethod::ListTools { client_id, intent } => {
                let id = parse_client(&client_id)?;
                let (items, etag) = self.core.list_tools(Some(id), intent.as_deref()).await?;
                Ok(serde_json::json!({
                    "etag": etag,
                    "tools": items.iter().map(tool_json).collect::<Vec<_>>(),
                }))
            }
            RpcMethod::CallTool {
                client_id,
                name,
                arguments,
                routing_key,
            } => {
                let id = parse_client(&client_id)?;
                self.core
                    .call_tool(Some(id), &name, arguments, routing_key)
                    .await
            }
            RpcMethod::ListResources { client_id } => {
                let id = parse_client(&client_id)?;
                let (items, etag) = self.core.list_resources(Some(id)).await?;
                Ok(serde_json::json!({
                    "etag": etag,
                    "resources": items.iter().map(resource_json).collect::<Vec<_>>(),
                }))
            }
            RpcMethod::ReadResource { client_id, uri } => {
                let id = parse_client(&client_id)?;
                self.core.read_resource(Some(id), &uri).await
            }
            RpcMethod::ListPrompts { client_id } => {
                let id = parse_client(&client_id)?;
                let (items, etag) = self.core.list_prompts(Some(id)).await?;
                Ok(serde_json::json!({
                    "etag": etag,
                    "prompts": items.iter().map(prompt_json).collect::<Vec<_>>(),
                }))
            }
            RpcMethod::GetPrompt {
                client_id,
                name,
                arguments,
            } => {
                let id = parse_client(&client_id)?;
                self.core.get_prompt(Some(id), &name, arguments).await
            }
            RpcMethod::CreateTask {
                client_id,
                name,
                arguments,
                routing_key,
                ttl_ms,
                poll_interval_ms,
            } => {
                let id = parse_client(&client_id)?;
                let owner = self.core.client(id)?.name;
                let core = Arc::clone(&self.core);
                let tool = name.clone();
                let descriptor = self.core.tasks().create(
                    &owner,
                    TaskOptions {
                        ttl_ms,
                        poll_interval_ms,
                        status_message: Some(format!("calling {tool}")),
                    },
                    async move {
                        core.call_tool(Some(id), &tool, arguments, routing_key)
                            .await
                            .map_err(|err| err.to_string())
                    },
                );
                serde_json::to_value(descriptor)
                    .map_err(|err| CoreError::internal(err.to_string()))
            }
            RpcMethod::GetTask { client_id, task_id } => {
                let owner = self.owner_of(&client_id)?;
                let descriptor = self.core.tasks().get(&owner, &task_id)?;
                serde_json::to_value(descriptor)
                    .map_err(|err| CoreError::internal(err.to_string()))
            }
            RpcMethod::CancelTask { client_id, task_id } => {
                let owner = self.owner_of(&client_id)?;
                let descriptor = self.core.tasks().cancel(&owner, &task_id)?;
                serde_json::to_value(descriptor)
                    .map_err(|err| CoreError::internal(err.to_string()))
            }
            RpcMethod::ListTasks {
                client_id,
                cursor,
                limit,
            } => {
                let owner = self.owner_of(&client_id)?;
                let (tasks, next) =
                    self.core
                        .tasks()
                        .list(&owner, cursor.as_deref(), limit.unwrap_or(50));
                Ok(serde_json::json!({
                    "tasks": tasks,
                    "next_cursor": next,
                }))
            }
            streaming => Err(CoreError::internal(format!(
                "streaming method dispatched as unary: {streaming:?}"
            ))),
        }
    }

    fn owner_of(&self, client_id: &str) -> Result<String, CoreError> {
        Ok(self.core.client(parse_client(client_id)?)?.name)
    }

    async fn dispatch_stream(
        self: Arc<Self>,
        id: u64,
        method: RpcMethod,
        out: mpsc::Sender<RpcResponse>,
    ) {
        match method {
            RpcMethod::StreamLogs {
                source,
                follow,
                tail,
            } => {
                let logs = Arc::clone(self.core.logs());
                for entry in logs.tail(source.as_deref(), tail.unwrap_or(100)) {
                    if send_item(&out, id, &entry).await.is_err() {
                        return;
                    }
                }
                if !follow {
                    let _ = out.send(RpcResponse::end(id)).await;
                    return;
                }
                let mut rx = logs.follow();
                loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        entry = rx.recv() => match entry {
                            Ok(entry) => {
                                if source.as_deref().is_some_and(|s| s != entry.source) {
                                    continue;
                                }
                                if send_item(&out, id, &entry).await.is_err() {
                                    return;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "log follower lagged");
                            }
                            Err(_) => break,
                        }
                    }
                }
                let _ = out.send(RpcResponse::end(id)).await;
            }
            RpcMethod::WatchRuntimeStatus => {
                let mut events = self.core.events().subscribe();
                if send_item(&out, id, &self.core.pool_statuses()).await.is_err() {
                    return;
                }
                loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(
                                CoreEvent::InstanceStarted { .. }
                                | CoreEvent::InstanceStopped { .. }
                                | CoreEvent::ReloadApplied { .. },
                            ) => {
                                if send_item(&out, id, &self.core.pool_statuses()).await.is_err() {
                                    return;
                                }
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(_) => break,
                        }
                    }
                }
                let _ = out.send(RpcResponse::end(id)).await;
            }
            RpcMethod::WatchServerInitStatus => {
                let mut events = self.core.events().subscribe();
                if send_item(&out, id, &self.core.init_statuses()).await.is_err() {
                    return;
                }
                loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(CoreEvent::ServerInit(status)) => {
                                if send_item(&out, id, &status).await.is_err() {
                                    return;
                                }
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(_) => break,
                        }
                    }
                }
                let _ = out.send(RpcResponse::end(id)).await;
            }
            other => {
                let _ = out
                    .send(RpcResponse::err(
                        id,
                        ErrorCode::Internal,
                        format!("unary method dispatched as stream: {other:?}"),
                    ))
                    .await;
            }
        }
    }
}

async fn send_item<T: serde::Serialize>(
    out: &mpsc::Sender<RpcResponse>,
    id: u64,
    item: &T,
) -> Result<(), ()> {
    let Ok(value) = serde_json::to_value(item) else {
        return Err(());
    };
    out.send(RpcResponse::item(id, value)).await.map_err(|_| ())
}

fn parse_client(raw: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(raw)
        .map_err(|_| CoreError::invalid_argument(format!("malformed client id '{raw}'")))
}

/// Projection of an aggregated tool for the wire.
fn tool_json(item: &AggregatedItem) -> Value {
    let Item::Tool(tool) = &item.item else {
        return Value::Null;
    };
    serde_json::json!({
        "name": item.namespaced_name,
        "description": tool.description,
        "inputSchema": tool.input_schema,
        "server": item.spec.name(),
    })
}

fn resource_json(item: &AggregatedItem) -> Value {
    let Item::Resource(resource) = &item.item else {
        return Value::Null;
    };
    serde_json::json!({
        "name": item.namespaced_name,
        "uri": resource.uri,
        "description": resource.description,
        "mimeType": resource.mime_type,
        "server": item.spec.name(),
    })
}

fn prompt_json(item: &AggregatedItem) -> Value {
    let Item::Prompt(prompt) = &item.item else {
        return Value::Null;
    };
    serde_json::json!({
        "name": item.namespaced_name,
        "description": prompt.description,
        "arguments": prompt.arguments,
        "server": item.spec.name(),
    })
}
