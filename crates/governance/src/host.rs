//! Plugin host: process supervision, handshake, and the live RPC channel.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shoal_core::config::PluginSpec;
use shoal_core::governance::GovernanceEnvelope;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::pipeline::PluginEndpoint;
use crate::proto::{PluginDecision, PluginFlow, PluginRequest, PluginResponse};
use crate::{socket, PluginError};
use crate::{
    PLUGIN_CATEGORY_ENV, PLUGIN_COMMIT_HASH_ENV, PLUGIN_FLOWS_ENV, PLUGIN_NAME_ENV,
    PLUGIN_SOCKET_ENV, PLUGIN_SOCKET_ENV_ALIAS,
};

/// Overall budget for the startup handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Spacing between `CheckReady` attempts.
const READY_RETRY_SPACING: Duration = Duration::from_millis(250);
/// Per-call deadline on the plugin channel.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Delay before a crashed plugin is restarted.
const RESTART_DELAY: Duration = Duration::from_secs(1);
/// Restart attempts before the plugin is parked.
const MAX_RESTARTS: u32 = 5;

struct Channel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Channel {
    async fn call(&mut self, name: &str, request: &PluginRequest) -> Result<PluginResponse, PluginError> {
        let mut frame = serde_json::to_string(request)
            .map_err(|err| PluginError::protocol(name, err.to_string()))?;
        frame.push('\n');
        self.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|err| PluginError::io(name, err.to_string()))?;

        let mut line = String::new();
        let read = timeout(CALL_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| PluginError::io(name, "call timed out"))?
            .map_err(|err| PluginError::io(name, err.to_string()))?;
        if read == 0 {
            return Err(PluginError::io(name, "plugin closed the socket"));
        }
        serde_json::from_str(&line).map_err(|err| PluginError::protocol(name, err.to_string()))
    }
}

struct Live {
    channel: Channel,
    child: Child,
}

/// One supervised plugin process.
pub struct PluginHost {
    spec: PluginSpec,
    flows: Vec<PluginFlow>,
    socket_path: PathBuf,
    live: Mutex<Option<Live>>,
    restarting: AtomicBool,
    restarts: AtomicU32,
}

impl PluginHost {
    /// Launch and handshake a plugin process.
    pub async fn start(spec: PluginSpec, socket_dir: &Path) -> Result<Arc<Self>, PluginError> {
        let flows: Vec<PluginFlow> = spec
            .flows
            .iter()
            .filter_map(|f| PluginFlow::parse(f))
            .collect();
        let socket_path = socket_dir.join(format!("plugin-{}.sock", spec.name));
        let host = Arc::new(Self {
            spec,
            flows,
            socket_path,
            live: Mutex::new(None),
            restarting: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
        });
        let live = host.spawn_and_handshake().await?;
        *host.live.lock().await = Some(live);
        info!(plugin = %host.spec.name, "plugin ready");
        Ok(host)
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Whether the request path must block when this plugin is down.
    pub fn required(&self) -> bool {
        self.spec.required
    }

    async fn spawn_and_handshake(&self) -> Result<Live, PluginError> {
        let name = &self.spec.name;
        let listener = socket::bind_listener(&self.socket_path)
            .await
            .map_err(|err| PluginError::io(name, err.to_string()))?;

        let mut cmd = tokio::process::Command::new(&self.spec.cmd[0]);
        cmd.args(&self.spec.cmd[1..])
            .env(PLUGIN_SOCKET_ENV, &self.socket_path)
            .env(PLUGIN_SOCKET_ENV_ALIAS, &self.socket_path)
            .env(PLUGIN_NAME_ENV, name)
            .env(PLUGIN_CATEGORY_ENV, &self.spec.category)
            .env(PLUGIN_FLOWS_ENV, self.spec.flows.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(hash) = &self.spec.commit_hash {
            cmd.env(PLUGIN_COMMIT_HASH_ENV, hash);
        }
        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }
        let child = cmd
            .spawn()
            .map_err(|err| PluginError::io(name, format!("spawn failed: {err}")))?;

        let handshake = async {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|err| PluginError::io(name, err.to_string()))?;
            let (read_half, write_half) = stream.into_split();
            let mut channel = Channel {
                reader: BufReader::new(read_half),
                writer: write_half,
            };

            match channel.call(name, &PluginRequest::GetMetadata).await? {
                PluginResponse::Metadata(metadata) => {
                    if metadata.name != *name {
                        return Err(PluginError::handshake(
                            name,
                            format!("reported name '{}' does not match", metadata.name),
                        ));
                    }
                    let expected = crate::proto::PluginCategory::parse(&self.spec.category);
                    if expected != Some(metadata.category) {
                        return Err(PluginError::handshake(
                            name,
                            format!("reported category {:?} does not match", metadata.category),
                        ));
                    }
                    if let Some(pinned) = &self.spec.commit_hash {
                        if metadata.commit_hash.as_deref() != Some(pinned.as_str()) {
                            return Err(PluginError::handshake(name, "commit hash mismatch"));
                        }
                    }
                    for flow in &self.flows {
                        if !metadata.flows.contains(flow) {
                            return Err(PluginError::handshake(
                                name,
                                format!("declared flows do not cover {flow:?}"),
                            ));
                        }
                    }
                }
                other => {
                    return Err(PluginError::protocol(
                        name,
                        format!("expected metadata, got {other:?}"),
                    ))
                }
            }

            match channel
                .call(
                    name,
                    &PluginRequest::Configure {
                        config: self.spec.config.clone(),
                    },
                )
                .await?
            {
                PluginResponse::Ack => {}
                PluginResponse::Error { message } => {
                    return Err(PluginError::handshake(name, message))
                }
                other => {
                    return Err(PluginError::protocol(
                        name,
                        format!("expected ack, got {other:?}"),
                    ))
                }
            }

            loop {
                match channel.call(name, &PluginRequest::CheckReady).await? {
                    PluginResponse::Ready { ok: true } => break,
                    PluginResponse::Ready { ok: false } => sleep(READY_RETRY_SPACING).await,
                    other => {
                        return Err(PluginError::protocol(
                            name,
                            format!("expected ready, got {other:?}"),
                        ))
                    }
                }
            }
            Ok(channel)
        };

        match timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(channel)) => Ok(Live { channel, child }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PluginError::handshake(name, "handshake timed out")),
        }
    }

    /// Tear the dead channel down and schedule a supervised restart.
    fn schedule_restart(self: &Arc<Self>) {
        if self.restarting.swap(true, Ordering::SeqCst) {
            return;
        }
        let restarts = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        if restarts > MAX_RESTARTS {
            warn!(plugin = %self.spec.name, "restart budget exhausted; plugin parked");
            return;
        }
        let host = Arc::clone(self);
        tokio::spawn(async move {
            sleep(RESTART_DELAY).await;
            match host.spawn_and_handshake().await {
                Ok(live) => {
                    *host.live.lock().await = Some(live);
                    host.restarts.store(0, Ordering::SeqCst);
                    info!(plugin = %host.spec.name, "plugin restarted");
                }
                Err(err) => {
                    warn!(plugin = %host.spec.name, error = %err, "plugin restart failed");
                }
            }
            host.restarting.store(false, Ordering::SeqCst);
        });
    }

    /// Politely stop the plugin process.
    pub async fn shutdown(&self) {
        let mut live = self.live.lock().await;
        if let Some(mut live) = live.take() {
            let _ = live
                .channel
                .call(&self.spec.name, &PluginRequest::Shutdown)
                .await;
            let _ = live.child.start_kill();
        }
        let _ = tokio::fs::remove_file(&self.socket_path).await;
        debug!(plugin = %self.spec.name, "plugin stopped");
    }
}

#[async_trait::async_trait]
impl PluginEndpoint for Arc<PluginHost> {
    async fn handle(
        &self,
        flow: PluginFlow,
        envelope: &GovernanceEnvelope,
    ) -> Result<PluginDecision, PluginError> {
        let request = match flow {
            PluginFlow::Request => PluginRequest::HandleRequest {
                envelope: envelope.clone(),
            },
            PluginFlow::Response => PluginRequest::HandleResponse {
                envelope: envelope.clone(),
            },
        };
        let mut live = self.live.lock().await;
        let Some(active) = live.as_mut() else {
            return Err(PluginError::unavailable(&self.spec.name));
        };
        match active.channel.call(&self.spec.name, &request).await {
            Ok(PluginResponse::Decision(decision)) => Ok(decision),
            Ok(PluginResponse::Error { message }) => {
                Err(PluginError::protocol(&self.spec.name, message))
            }
            Ok(other) => Err(PluginError::protocol(
                &self.spec.name,
                format!("expected decision, got {other:?}"),
            )),
            Err(err) => {
                // The channel is gone; drop it and bring the process back.
                *live = None;
                drop(live);
                self.schedule_restart();
                Err(err)
            }
        }
    }

    fn flows(&self) -> &[PluginFlow] {
        &self.flows
    }
}
