//! Wire types and framing for the control RPC.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shoal_types::ErrorCode;
use tokio_util::codec::LengthDelimitedCodec;

/// One request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Caller-chosen id; response frames echo it.
    pub id: u64,
    /// Method and parameters.
    #[serde(flatten)]
    pub method: RpcMethod,
}

/// Control API methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcMethod {
    RegisterClient {
        name: String,
        pid: u32,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        server: Option<String>,
    },
    Heartbeat {
        client_id: String,
    },
    ListTools {
        client_id: String,
        #[serde(default)]
        intent: Option<String>,
    },
    CallTool {
        client_id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default)]
        routing_key: Option<String>,
    },
    ListResources {
        client_id: String,
    },
    ReadResource {
        client_id: String,
        uri: String,
    },
    ListPrompts {
        client_id: String,
    },
    GetPrompt {
        client_id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    StreamLogs {
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        follow: bool,
        #[serde(default)]
        tail: Option<usize>,
    },
    WatchRuntimeStatus,
    WatchServerInitStatus,
    CreateTask {
        client_id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default)]
        routing_key: Option<String>,
        #[serde(default)]
        ttl_ms: Option<u64>,
        #[serde(default)]
        poll_interval_ms: Option<u64>,
    },
    GetTask {
        client_id: String,
        task_id: String,
    },
    CancelTask {
        client_id: String,
        task_id: String,
    },
    ListTasks {
        client_id: String,
        #[serde(default)]
        cursor: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl RpcMethod {
    /// Whether the method streams multiple frames.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            RpcMethod::StreamLogs { .. }
                | RpcMethod::WatchRuntimeStatus
                | RpcMethod::WatchServerInitStatus
        )
    }
}

/// Error body carried in a response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Stable machine-readable code.
    pub code: ErrorCode,
    /// One-line human message; never a stack trace.
    pub message: String,
}

/// One response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Request id this frame answers.
    pub id: u64,
    /// Payload for success frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error for failure frames; terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
    /// End-of-stream marker. Unary responses always set it.
    #[serde(default)]
    pub eos: bool,
}

impl RpcResponse {
    /// A unary success frame.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
            eos: true,
        }
    }

    /// A stream item frame.
    pub fn item(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
            eos: false,
        }
    }

    /// A bare end-of-stream frame.
    pub fn end(id: u64) -> Self {
        Self {
            id,
            result: None,
            error: None,
            eos: true,
        }
    }

    /// A terminal error frame.
    pub fn err(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcErrorBody {
                code,
                message: message.into(),
            }),
            eos: true,
        }
    }
}

/// Build the length-delimited codec with the configured frame caps.
pub fn codec(max_frame: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let request = RpcRequest {
            id: 7,
            method: RpcMethod::CallTool {
                client_id: "c1".into(),
                name: "alpha__echo".into(),
                arguments: serde_json::json!({"msg": "hi"}),
                routing_key: None,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "call_tool");
        assert_eq!(json["params"]["name"], "alpha__echo");

        let parsed: RpcRequest = serde_json::from_value(json).unwrap();
        assert!(matches!(parsed.method, RpcMethod::CallTool { .. }));
    }

    #[test]
    fn streaming_classification() {
        assert!(RpcMethod::WatchRuntimeStatus.is_streaming());
        assert!(RpcMethod::StreamLogs {
            source: None,
            follow: true,
            tail: None
        }
        .is_streaming());
        assert!(!RpcMethod::Heartbeat {
            client_id: "x".into()
        }
        .is_streaming());
    }

    #[test]
    fn response_frames() {
        let ok = RpcResponse::ok(1, serde_json::json!({"x": 1}));
        assert!(ok.eos && ok.error.is_none());
        let item = RpcResponse::item(1, serde_json::Value::Null);
        assert!(!item.eos);
        let err = RpcResponse::err(1, ErrorCode::NotFound, "nope");
        assert!(err.eos && err.result.is_none());
    }

    #[test]
    fn codec_round_trip() {
        use tokio_util::bytes::BytesMut;
        use tokio_util::codec::{Decoder, Encoder};

        let mut framing = codec(4096);
        let frame = serde_json::to_vec(&RpcResponse::ok(9, serde_json::json!({"ok": true})))
            .unwrap();
        let mut buf = BytesMut::new();
        framing.encode(frame.into(), &mut buf).unwrap();

        let decoded = framing.decode(&mut buf).unwrap().expect("one whole frame");
        let parsed: RpcResponse = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(parsed.id, 9);
        assert!(parsed.eos);
        assert!(buf.is_empty(), "no trailing bytes after the frame");
    }

    #[test]
    fn oversized_frames_are_rejected() {
        use tokio_util::bytes::BytesMut;
        use tokio_util::codec::{Decoder, Encoder};

        let mut framing = codec(64);
        let oversized = vec![0u8; 256];

        // Outbound: the encoder refuses to emit a frame over the cap.
        let mut buf = BytesMut::new();
        assert!(framing.encode(oversized.clone().into(), &mut buf).is_err());

        // Inbound: a length header over the cap fails the decode.
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&(oversized.len() as u32).to_be_bytes());
        wire.extend_from_slice(&oversized);
        assert!(framing.decode(&mut wire).is_err());

        // A frame within the cap still decodes.
        let mut framing = codec(64);
        let mut buf = BytesMut::new();
        framing.encode(vec![7u8; 16].into(), &mut buf).unwrap();
        let decoded = framing.decode(&mut buf).unwrap().expect("frame under cap");
        assert_eq!(decoded.len(), 16);
    }
}
