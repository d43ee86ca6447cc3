//! rmcp-backed connection establishment for stdio and streamable HTTP.
//!
//! The launcher (child spawn) and the handshake are separate operations so
//! the lifecycle manager can report and time them individually.

use std::future::Future;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rmcp::model::{
    CallToolRequestParams, CallToolResult, ClientCapabilities, ClientInfo, GetPromptRequestParams,
    GetPromptResult, Implementation, InitializeResult, Prompt, ReadResourceRequestParams,
    ReadResourceResult, Resource, ServerCapabilities, Tool,
};
use rmcp::service::{NotificationContext, RoleClient, RunningService};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::ServiceExt as _;
use shoal_types::LogEntry;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::{classify_rmcp_error, Connection, ListChangedNotice, TransportError};
use crate::catalog::SpecKey;
use crate::config::validation::RESERVED_HEADERS;
use crate::config::{ProxyMode, ServerSpec};
use crate::events::IndexKind;
use crate::logbuf::{sanitize_log_text, LogBuffer};

/// Internal deadline for the liveness probe request.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Initial delay between HTTP connect retries.
const HTTP_RETRY_BASE: Duration = Duration::from_millis(500);

/// Ceiling for the HTTP connect retry backoff.
const HTTP_RETRY_MAX: Duration = Duration::from_secs(10);

/// Client handler attached to every downstream connection.
///
/// Declares the spec's protocol version during the handshake and forwards
/// list-changed notifications to the aggregator, gated on the capability the
/// server actually negotiated. Sampling and elicitation capabilities are
/// declared only when handlers exist; none are registered today, so the
/// capability set stays empty.
#[derive(Clone)]
pub struct InstanceHandler {
    spec: SpecKey,
    protocol_version: String,
    notify_tx: mpsc::UnboundedSender<ListChangedNotice>,
    negotiated: Arc<OnceLock<ServerCapabilities>>,
}

impl InstanceHandler {
    /// Build a handler for one connection attempt.
    pub fn new(
        spec: SpecKey,
        protocol_version: String,
        notify_tx: mpsc::UnboundedSender<ListChangedNotice>,
    ) -> Self {
        Self {
            spec,
            protocol_version,
            notify_tx,
            negotiated: Arc::new(OnceLock::new()),
        }
    }

    fn forward(&self, kind: IndexKind) {
        if !self.capability_declares(kind) {
            debug!(
                spec = %self.spec,
                kind = kind.label(),
                "dropping list_changed notification: capability not declared"
            );
            return;
        }
        let _ = self.notify_tx.send(ListChangedNotice {
            spec: self.spec.clone(),
            kind,
        });
    }

    fn capability_declares(&self, kind: IndexKind) -> bool {
        let Some(caps) = self.negotiated.get() else {
            return false;
        };
        match kind {
            IndexKind::Tools => caps
                .tools
                .as_ref()
                .and_then(|c| c.list_changed)
                .unwrap_or(false),
            IndexKind::Resources => caps
                .resources
                .as_ref()
                .and_then(|c| c.list_changed)
                .unwrap_or(false),
            IndexKind::Prompts => caps
                .prompts
                .as_ref()
                .and_then(|c| c.list_changed)
                .unwrap_or(false),
        }
    }
}

impl rmcp::ClientHandler for InstanceHandler {
    fn get_info(&self) -> ClientInfo {
        let protocol_version = serde_json::from_value(serde_json::json!(self.protocol_version))
            .unwrap_or_default();
        ClientInfo {
            protocol_version,
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "shoal".to_string(),
                title: Some("Shoal MCP Control Plane".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.forward(IndexKind::Tools);
    }

    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.forward(IndexKind::Resources);
    }

    async fn on_prompt_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.forward(IndexKind::Prompts);
    }
}

/// Env var that disables the login-shell PATH augmentation.
pub const SKIP_PATH_PATCH_ENV: &str = "MCPV_SKIP_PATH_PATCH";

/// PATH as a login shell would see it, resolved once per process.
///
/// GUI-launched processes inherit a minimal PATH; children spawned for
/// stdio specs routinely need toolchain shims (nvm, asdf) that only a login
/// shell puts on PATH.
fn login_shell_path() -> Option<&'static str> {
    static LOGIN_PATH: OnceLock<Option<String>> = OnceLock::new();
    LOGIN_PATH
        .get_or_init(|| {
            if std::env::var_os(SKIP_PATH_PATCH_ENV).is_some() {
                return None;
            }
            #[cfg(unix)]
            {
                let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
                let output = std::process::Command::new(shell)
                    .args(["-lc", "echo $PATH"])
                    .output()
                    .ok()?;
                if !output.status.success() {
                    return None;
                }
                let path = String::from_utf8(output.stdout).ok()?;
                let path = path.trim();
                (!path.is_empty()).then(|| path.to_string())
            }
            #[cfg(not(unix))]
            {
                None
            }
        })
        .as_deref()
}

/// A spawned-but-not-yet-handshaken stdio child.
pub struct StdioLaunch {
    transport: TokioChildProcess,
    /// Child pid, when the runtime exposes it.
    pub pid: Option<u32>,
}

/// Spawn the child process for a stdio spec with redirected pipes.
///
/// The child enters its own process group so teardown can signal the whole
/// tree; on Linux it additionally dies with its parent.
pub fn launch_stdio(
    key: &SpecKey,
    spec: &ServerSpec,
    logs: &Arc<LogBuffer>,
) -> Result<StdioLaunch, TransportError> {
    let mut cmd = tokio::process::Command::new(&spec.cmd[0]);
    cmd.args(&spec.cmd[1..]);
    if !spec.env.contains_key("PATH") {
        if let Some(path) = login_shell_path() {
            cmd.env("PATH", path);
        }
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    configure_child(&mut cmd);

    let (transport, stderr) = TokioChildProcess::builder(cmd)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| TransportError::unavailable(format!("failed to spawn process: {err}")))?;
    let pid = transport.id();

    if let Some(stderr) = stderr {
        spawn_stderr_logger(key.clone(), Arc::clone(logs), stderr);
    }

    Ok(StdioLaunch { transport, pid })
}

/// Complete the MCP handshake over a spawned child.
pub async fn handshake_stdio(
    key: &SpecKey,
    handler: InstanceHandler,
    launch: StdioLaunch,
) -> Result<RmcpConnection, TransportError> {
    let negotiated = handler.negotiated.clone();
    let service = handler
        .serve(launch.transport)
        .await
        .map_err(|err| TransportError::unavailable(format!("handshake failed: {err}")))?;
    if let Some(info) = service.peer_info() {
        let _ = negotiated.set(info.capabilities.clone());
    }
    RmcpConnection::new(key.clone(), service, launch.pid)
}

/// Open a streamable HTTP session and complete the MCP handshake. Session
/// negotiation and `Last-Event-Id` replay are handled by the rmcp transport.
///
/// Connection establishment retries per the spec's `max_retries` budget with
/// exponential backoff; `-1` disables retries entirely.
pub async fn handshake_http(
    key: &SpecKey,
    spec: &ServerSpec,
    handler: InstanceHandler,
) -> Result<RmcpConnection, TransportError> {
    let endpoint = spec
        .endpoint
        .as_ref()
        .ok_or_else(|| TransportError::protocol("endpoint required for streamable_http"))?
        .to_string();

    let client = build_http_client(spec)?;
    with_connect_retries(spec.max_retries, HTTP_RETRY_BASE, || {
        let key = key.clone();
        let endpoint = endpoint.clone();
        let client = client.clone();
        let handler = handler.clone();
        async move {
            let config = StreamableHttpClientTransportConfig::with_uri(endpoint);
            let transport = StreamableHttpClientTransport::with_client(client, config);
            let negotiated = handler.negotiated.clone();
            let service = handler
                .serve(transport)
                .await
                .map_err(|err| TransportError::unavailable(format!("handshake failed: {err}")))?;
            if let Some(info) = service.peer_info() {
                let _ = negotiated.set(info.capabilities.clone());
            }
            RmcpConnection::new(key, service, None)
        }
    })
    .await
}

/// Run a connect attempt under a retry budget. `max_retries` counts retries
/// after the first attempt; `-1` disables retries. Backoff doubles from
/// `base` up to [`HTTP_RETRY_MAX`]. Protocol errors are never retried.
async fn with_connect_retries<T, F, Fut>(
    max_retries: i32,
    base: Duration,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = if max_retries < 0 {
        1
    } else {
        max_retries as u64 + 1
    };
    let mut delay = base;
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ TransportError::Protocol { .. }) => return Err(err),
            Err(err) => {
                debug!(attempt, attempts, error = %err, "http connect attempt failed");
                last = Some(err);
                if attempt < attempts {
                    sleep(delay).await;
                    delay = (delay * 2).min(HTTP_RETRY_MAX);
                }
            }
        }
    }
    // attempts >= 1, so at least one error was recorded.
    Err(last.unwrap_or_else(|| TransportError::unavailable("no connect attempt ran")))
}

/// rmcp-backed implementation of [`Connection`].
pub struct RmcpConnection {
    spec: SpecKey,
    service: Mutex<Option<RunningService<RoleClient, InstanceHandler>>>,
    peer: rmcp::service::Peer<RoleClient>,
    info: InitializeResult,
    child_pid: Option<u32>,
}

impl RmcpConnection {
    fn new(
        spec: SpecKey,
        service: RunningService<RoleClient, InstanceHandler>,
        child_pid: Option<u32>,
    ) -> Result<Self, TransportError> {
        let info = service
            .peer_info()
            .cloned()
            .ok_or_else(|| TransportError::protocol("handshake produced no server info"))?;
        let peer = service.peer().clone();
        Ok(Self {
            spec,
            service: Mutex::new(Some(service)),
            peer,
            info,
            child_pid,
        })
    }

    /// Spec this connection belongs to.
    pub fn spec(&self) -> &SpecKey {
        &self.spec
    }
}

#[async_trait::async_trait]
impl Connection for RmcpConnection {
    async fn list_tools(&self) -> Result<Vec<Tool>, TransportError> {
        self.peer.list_all_tools().await.map_err(classify_rmcp_error)
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParams,
    ) -> Result<CallToolResult, TransportError> {
        self.peer.call_tool(params).await.map_err(classify_rmcp_error)
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, TransportError> {
        self.peer
            .list_all_resources()
            .await
            .map_err(classify_rmcp_error)
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, TransportError> {
        self.peer
            .read_resource(ReadResourceRequestParams {
                meta: None,
                uri: uri.to_string(),
            })
            .await
            .map_err(classify_rmcp_error)
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>, TransportError> {
        self.peer
            .list_all_prompts()
            .await
            .map_err(classify_rmcp_error)
    }

    async fn get_prompt(
        &self,
        params: GetPromptRequestParams,
    ) -> Result<GetPromptResult, TransportError> {
        self.peer.get_prompt(params).await.map_err(classify_rmcp_error)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        // rmcp exposes no dedicated client ping; a bounded tool listing
        // doubles as the liveness probe.
        match timeout(PING_TIMEOUT, self.peer.list_all_tools()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(classify_rmcp_error(err)),
            Err(_) => Err(TransportError::timed_out("ping")),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(service) = self.service.lock().await.take() {
            service
                .cancel()
                .await
                .map(|_| ())
                .map_err(|err| TransportError::closed(err.to_string()))?;
        }
        Ok(())
    }

    fn server_info(&self) -> Option<InitializeResult> {
        Some(self.info.clone())
    }

    fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }
}

/// Build the reqwest client carrying spec headers and proxy policy.
///
/// Reserved headers are rejected at validation time; they are filtered again
/// here because specs can reach this point through in-place reload.
fn build_http_client(spec: &ServerSpec) -> Result<reqwest::Client, TransportError> {
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

    let mut headers = HeaderMap::new();
    for (key, value) in &spec.headers {
        if RESERVED_HEADERS.contains(&key.to_ascii_lowercase().as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(key.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.insert(name, value);
        } else {
            warn!(header = %key, "skipping malformed header value");
        }
    }

    let mut builder = reqwest::Client::builder().default_headers(headers);
    match spec.proxy.as_ref().map(|p| p.mode).unwrap_or(ProxyMode::None) {
        ProxyMode::None => builder = builder.no_proxy(),
        ProxyMode::Env => {}
        ProxyMode::Url => {
            let url = spec
                .proxy
                .as_ref()
                .and_then(|p| p.url.as_ref())
                .ok_or_else(|| TransportError::protocol("proxy.url missing"))?;
            let proxy = reqwest::Proxy::all(url.as_str())
                .map_err(|err| TransportError::protocol(format!("invalid proxy: {err}")))?;
            builder = builder.proxy(proxy);
        }
    }

    builder
        .build()
        .map_err(|err| TransportError::unavailable(format!("http client build failed: {err}")))
}

/// Platform setup for spawned children: own process group so teardown can
/// signal the whole tree, and on Linux a parent-death signal.
fn configure_child(cmd: &mut tokio::process::Command) {
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    #[cfg(target_os = "linux")]
    {
        // SAFETY: prctl with PR_SET_PDEATHSIG is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0);
                Ok(())
            });
        }
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// Stream a child's stderr lines into the shared log buffer.
pub fn spawn_stderr_logger(
    spec: SpecKey,
    logs: Arc<LogBuffer>,
    stderr: tokio::process::ChildStderr,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            logs.push(LogEntry::now(
                spec.name(),
                "stderr",
                sanitize_log_text(&line),
            ));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spec_yaml(yaml: &str) -> ServerSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn failing_op(
        calls: &Arc<AtomicU32>,
        succeed_after: u32,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, TransportError>> + Send>>
    {
        let calls = Arc::clone(calls);
        move || {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n > succeed_after {
                    Ok(n)
                } else {
                    Err(TransportError::unavailable("connection refused"))
                }
            })
        }
    }

    #[tokio::test]
    async fn connect_retries_until_success_within_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let result =
            with_connect_retries(3, Duration::from_millis(1), failing_op(&calls, 2)).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connect_retry_budget_is_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let result =
            with_connect_retries(2, Duration::from_millis(1), failing_op(&calls, u32::MAX)).await;
        assert!(matches!(result, Err(TransportError::Unavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "one attempt plus two retries");
    }

    #[tokio::test]
    async fn negative_max_retries_disables_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let result =
            with_connect_retries(-1, Duration::from_millis(1), failing_op(&calls, u32::MAX)).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_max_retries_tries_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let result =
            with_connect_retries(0, Duration::from_millis(1), failing_op(&calls, u32::MAX)).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn protocol_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = with_connect_retries(5, Duration::from_millis(1), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::protocol("bad handshake payload"))
            }
        })
        .await;
        assert!(matches!(result, Err(TransportError::Protocol { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn http_client_skips_reserved_headers() {
        let spec = spec_yaml(
            r#"
name: remote
transport: streamable_http
endpoint: "https://example.com/mcp"
headers:
  X-Custom: "1"
"#,
        );
        assert!(build_http_client(&spec).is_ok());
    }

    #[test]
    fn proxy_url_mode_requires_url() {
        let mut spec = spec_yaml(
            r#"
name: remote
transport: streamable_http
endpoint: "https://example.com/mcp"
"#,
        );
        spec.proxy = Some(crate::config::ProxyConfig {
            mode: ProxyMode::Url,
            url: None,
        });
        assert!(build_http_client(&spec).is_err());
    }
}
