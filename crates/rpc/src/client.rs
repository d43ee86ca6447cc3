//! Control RPC client.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::wire::{codec, RpcErrorBody, RpcMethod, RpcRequest, RpcResponse};

/// Default frame cap for clients.
const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// An error returned by the remote control plane.
#[derive(Debug, Error)]
#[error("{}: {}", .0.code, .0.message)]
pub struct RemoteError(pub RpcErrorBody);

/// One frame of a streaming response.
pub type StreamItem = Result<Value, RemoteError>;

struct Pending {
    tx: mpsc::UnboundedSender<RpcResponse>,
}

/// Control RPC client over a Unix socket or TCP.
pub struct RpcClient {
    out_tx: mpsc::UnboundedSender<RpcRequest>,
    pending: Arc<Mutex<HashMap<u64, Pending>>>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Connect over a Unix socket.
    #[cfg(unix)]
    pub async fn connect_unix(path: &Path) -> Result<Self> {
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .with_context(|| format!("failed to connect {}", path.display()))?;
        Ok(Self::from_stream(stream))
    }

    /// Connect over TCP.
    pub async fn connect_tcp(addr: &str) -> Result<Self> {
        let stream = tokio::net::TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect {addr}"))?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream))
    }

    fn from_stream<S>(stream: S) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let framed = Framed::new(Box::pin(stream), codec(DEFAULT_MAX_FRAME));
        let (mut sink, mut source) = framed.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RpcRequest>();
        let pending: Arc<Mutex<HashMap<u64, Pending>>> = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(request) = out_rx.recv().await {
                let Ok(bytes) = serde_json::to_vec(&request) else {
                    continue;
                };
                if sink.send(bytes.into()).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let Ok(frame) = frame else { break };
                let Ok(response) = serde_json::from_slice::<RpcResponse>(&frame) else {
                    debug!("dropping malformed response frame");
                    continue;
                };
                let eos = response.eos;
                let id = response.id;
                let sender = {
                    let pending = reader_pending.lock().unwrap_or_else(|e| e.into_inner());
                    pending.get(&id).map(|p| p.tx.clone())
                };
                if let Some(tx) = sender {
                    let _ = tx.send(response);
                }
                if eos {
                    reader_pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&id);
                }
            }
            // Connection gone: wake every waiter with a closed channel.
            reader_pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        });

        Self {
            out_tx,
            pending,
            next_id: AtomicU64::new(1),
        }
    }

    fn begin(&self, method: RpcMethod) -> Result<(u64, mpsc::UnboundedReceiver<RpcResponse>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Pending { tx });
        self.out_tx
            .send(RpcRequest { id, method })
            .context("connection closed")?;
        Ok((id, rx))
    }

    /// Issue a unary request.
    pub async fn request(&self, method: RpcMethod) -> Result<Value> {
        let (_, mut rx) = self.begin(method)?;
        let response = rx.recv().await.context("connection closed mid-request")?;
        if let Some(error) = response.error {
            return Err(RemoteError(error).into());
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Open a server stream; items arrive on the returned channel until the
    /// end-of-stream frame.
    pub fn stream(&self, method: RpcMethod) -> Result<mpsc::UnboundedReceiver<StreamItem>> {
        let (_, mut rx) = self.begin(method)?;
        let (items_tx, items_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                if let Some(error) = response.error {
                    let _ = items_tx.send(Err(RemoteError(error)));
                    return;
                }
                if let Some(result) = response.result {
                    if items_tx.send(Ok(result)).is_err() {
                        return;
                    }
                }
                if response.eos {
                    return;
                }
            }
        });
        Ok(items_rx)
    }
}
