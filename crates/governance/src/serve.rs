//! Plugin-side serve loop.
//!
//! A plugin binary calls [`serve_plugin`] with its metadata and a handler;
//! the loop connects to the socket named by `MCPV_PLUGIN_SOCKET` (or the
//! `MCPD_PLUGIN_SOCKET` alias), then answers host frames until `Shutdown`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shoal_core::governance::GovernanceEnvelope;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::proto::{PluginDecision, PluginMetadata, PluginRequest, PluginResponse};
use crate::{socket, PLUGIN_SOCKET_ENV, PLUGIN_SOCKET_ENV_ALIAS};

/// Behavior supplied by a plugin binary.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    /// Apply configuration. Errors fail the handshake.
    async fn configure(&self, config: serde_json::Value) -> Result<()>;

    /// Whether the plugin can serve traffic yet.
    async fn ready(&self) -> bool {
        true
    }

    /// Evaluate the request flow.
    async fn handle_request(&self, envelope: GovernanceEnvelope) -> PluginDecision;

    /// Evaluate the response flow.
    async fn handle_response(&self, envelope: GovernanceEnvelope) -> PluginDecision {
        let _ = envelope;
        PluginDecision::allow()
    }
}

/// Resolve the socket path from the environment.
pub fn socket_path_from_env() -> Result<PathBuf> {
    std::env::var_os(PLUGIN_SOCKET_ENV)
        .or_else(|| std::env::var_os(PLUGIN_SOCKET_ENV_ALIAS))
        .map(PathBuf::from)
        .context("plugin socket path not set in environment")
}

/// Connect to the host and serve until shutdown.
pub async fn serve_plugin(metadata: PluginMetadata, handler: impl PluginHandler) -> Result<()> {
    let path = socket_path_from_env()?;
    serve_plugin_at(&path, metadata, handler).await
}

/// Serve against an explicit socket path (used by tests).
pub async fn serve_plugin_at(
    path: &std::path::Path,
    metadata: PluginMetadata,
    handler: impl PluginHandler,
) -> Result<()> {
    let stream = socket::connect(path).await?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            debug!("host closed the plugin socket");
            return Ok(());
        }
        let request: PluginRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_frame(
                    &mut writer,
                    &PluginResponse::Error {
                        message: format!("malformed frame: {err}"),
                    },
                )
                .await?;
                continue;
            }
        };

        let response = match request {
            PluginRequest::GetMetadata => PluginResponse::Metadata(metadata.clone()),
            PluginRequest::Configure { config } => match handler.configure(config).await {
                Ok(()) => PluginResponse::Ack,
                Err(err) => PluginResponse::Error {
                    message: err.to_string(),
                },
            },
            PluginRequest::CheckReady => PluginResponse::Ready {
                ok: handler.ready().await,
            },
            PluginRequest::HandleRequest { envelope } => {
                PluginResponse::Decision(handler.handle_request(envelope).await)
            }
            PluginRequest::HandleResponse { envelope } => {
                PluginResponse::Decision(handler.handle_response(envelope).await)
            }
            PluginRequest::Shutdown => {
                write_frame(&mut writer, &PluginResponse::Ack).await?;
                return Ok(());
            }
        };
        write_frame(&mut writer, &response).await?;
    }
}

async fn write_frame(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &PluginResponse,
) -> Result<()> {
    let mut frame = serde_json::to_string(response)?;
    frame.push('\n');
    writer.write_all(frame.as_bytes()).await?;
    Ok(())
}
