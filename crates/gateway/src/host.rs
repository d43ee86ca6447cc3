//! Gateway hosts: stdio and streamable HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use rmcp::ServiceExt as _;
use shoal_core::Core;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::service::{build_or_log, GatewayMode, GatewayService};

/// Serve one MCP session over this process's stdio and wait for it to end.
pub async fn serve_stdio(core: Arc<Core>, mode: GatewayMode) -> Result<()> {
    let service = GatewayService::new(core, mode).context("failed to register gateway session")?;
    let transport = (tokio::io::stdin(), tokio::io::stdout());
    let running = service
        .serve(transport)
        .await
        .context("stdio gateway handshake failed")?;
    info!("stdio gateway session established");
    running.waiting().await.context("stdio gateway session failed")?;
    Ok(())
}

/// Handle for a running HTTP gateway.
pub struct RunningHttpGateway {
    /// Bound address (useful with port 0).
    pub bound_address: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningHttpGateway {
    /// Stop the listener and wait for the serve task.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.handle.await.context("http gateway task failed")?;
        Ok(())
    }
}

/// Serve MCP-over-streamable-HTTP at `/mcp` on the given address. Each HTTP
/// session gets its own registered caller.
pub async fn serve_http(
    core: Arc<Core>,
    mode: GatewayMode,
    address: SocketAddr,
) -> Result<RunningHttpGateway> {
    let cancel = CancellationToken::new();
    let session_manager = Arc::new(LocalSessionManager::default());

    let factory_core = Arc::clone(&core);
    let factory_mode = mode.clone();
    let service: StreamableHttpService<GatewayService, LocalSessionManager> =
        StreamableHttpService::new(
            move || {
                build_or_log(&factory_core, &factory_mode).ok_or_else(|| {
                    std::io::Error::other("failed to register gateway session")
                })
            },
            Arc::clone(&session_manager),
            StreamableHttpServerConfig {
                stateful_mode: true,
                sse_keep_alive: Some(std::time::Duration::from_secs(15)),
                ..Default::default()
            },
        );

    let router = Router::new().nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind gateway address {address}"))?;
    let bound_address = listener.local_addr()?;
    info!(addr = %bound_address, "http gateway listening");

    let shutdown = cancel.child_token();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .await;
    });

    Ok(RunningHttpGateway {
        bound_address,
        cancel,
        handle,
    })
}
