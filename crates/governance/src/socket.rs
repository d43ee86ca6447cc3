//! Unix socket plumbing for the plugin RPC.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};

pub(crate) async fn bind_listener(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create socket parent: {}", parent.display()))?;
    }
    if socket_path.exists() {
        tokio::fs::remove_file(socket_path)
            .await
            .with_context(|| format!("failed to remove stale socket: {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind unix socket: {}", socket_path.display()))?;
    set_permissions(socket_path, 0o600).await?;
    Ok(listener)
}

pub(crate) async fn connect(socket_path: &Path) -> Result<UnixStream> {
    UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect unix socket: {}", socket_path.display()))
}

async fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("failed to chmod {:o}: {}", mode, path.display()))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn bind_and_connect_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("plugin.sock");
        let listener = super::bind_listener(&socket_path).await?;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept client");
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.expect("read request");
            write_half
                .write_all(b"{\"kind\":\"ack\"}\n")
                .await
                .expect("write response");
        });

        let mut client = super::connect(&socket_path).await?;
        client.write_all(b"{\"method\":\"check_ready\"}\n").await?;

        let mut response = String::new();
        let mut reader = BufReader::new(client);
        reader.read_line(&mut response).await?;
        server.await?;
        assert_eq!(response.trim(), "{\"kind\":\"ack\"}");
        Ok(())
    }

    #[tokio::test]
    async fn socket_file_is_private() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("plugin.sock");
        let _listener = super::bind_listener(&socket_path).await?;
        let mode = std::fs::metadata(&socket_path)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        Ok(())
    }
}
