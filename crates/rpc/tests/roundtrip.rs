//! Control RPC round-trip against an in-process core.

#![cfg(unix)]

use std::sync::Arc;

use shoal_core::config::ShoalConfig;
use shoal_core::core::CoreOptions;
use shoal_core::Core;
use shoal_rpc::wire::RpcMethod;
use shoal_rpc::{RpcClient, RpcServer};
use tokio_util::sync::CancellationToken;

async fn serve_core(socket: &std::path::Path) -> (Arc<Core>, CancellationToken) {
    let yaml = format!(
        r#"
servers: []
runtime:
  rpc:
    listenAddress: "{}"
"#,
        socket.display()
    );
    let config: ShoalConfig = serde_yaml::from_str(&yaml).unwrap();
    let core = Core::new(config, CoreOptions::default());
    core.start().await;

    let cancel = CancellationToken::new();
    let server = Arc::new(RpcServer::new(Arc::clone(&core), cancel.clone()));
    tokio::spawn(async move {
        let _ = server.serve().await;
    });
    // Give the listener a beat to bind.
    for _ in 0..50 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    (core, cancel)
}

#[tokio::test]
async fn register_heartbeat_list_and_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control.sock");
    let (_core, cancel) = serve_core(&socket).await;

    let client = RpcClient::connect_unix(&socket).await.unwrap();

    let registered = client
        .request(RpcMethod::RegisterClient {
            name: "cli".into(),
            pid: std::process::id(),
            tags: vec![],
            server: None,
        })
        .await
        .unwrap();
    let client_id = registered["client_id"].as_str().unwrap().to_string();

    let hb = client
        .request(RpcMethod::Heartbeat {
            client_id: client_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(hb["ok"], true);

    let tools = client
        .request(RpcMethod::ListTools {
            client_id: client_id.clone(),
            intent: None,
        })
        .await
        .unwrap();
    assert!(tools["tools"].as_array().unwrap().is_empty());
    assert!(tools["etag"].is_string());

    // Unknown tool fails with a stable code, not a transport error.
    let err = client
        .request(RpcMethod::CallTool {
            client_id: client_id.clone(),
            name: "ghost__tool".into(),
            arguments: serde_json::json!({}),
            routing_key: None,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("not_found"));

    let (page, _) = {
        let listed = client
            .request(RpcMethod::ListTasks {
                client_id: client_id.clone(),
                cursor: None,
                limit: None,
            })
            .await
            .unwrap();
        (
            listed["tasks"].as_array().unwrap().clone(),
            listed["next_cursor"].clone(),
        )
    };
    assert!(page.is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn malformed_client_id_is_invalid_argument() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control2.sock");
    let (_core, cancel) = serve_core(&socket).await;

    let client = RpcClient::connect_unix(&socket).await.unwrap();
    let err = client
        .request(RpcMethod::Heartbeat {
            client_id: "not-a-uuid".into(),
        })
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("invalid_argument"));
    cancel.cancel();
}
