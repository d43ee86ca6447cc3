//! `shoal` binary: serve and validate.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shoal_core::config::{load_config_from_dir, validate_config};
use shoal_core::core::CoreOptions;
use shoal_core::governance::Governor;
use shoal_core::Core;
use shoal_gateway::GatewayMode;
use shoal_rpc::RpcServer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "shoal", version, about = "Elastic control plane for MCP servers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Serve {
        /// Directory containing shoal.yaml.
        #[arg(long)]
        config: PathBuf,
        /// Also terminate one MCP session on this process's stdio.
        #[arg(long)]
        stdio: bool,
        /// Serve MCP over streamable HTTP on this address.
        #[arg(long)]
        mcp_listen: Option<SocketAddr>,
        /// Scope gateway sessions to specs carrying any of these tags.
        #[arg(long)]
        tag: Vec<String>,
        /// Single-server mode: forward every gateway session to one spec.
        #[arg(long)]
        server: Option<String>,
    },
    /// Validate the configuration and exit.
    Validate {
        /// Directory containing shoal.yaml.
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { config } => validate(&config),
        Command::Serve {
            config,
            stdio,
            mcp_listen,
            tag,
            server,
        } => serve(&config, stdio, mcp_listen, tag, server).await,
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn validate(config_dir: &PathBuf) -> Result<()> {
    let config = load_config_from_dir(config_dir)
        .with_context(|| format!("configuration in {} is invalid", config_dir.display()))?;
    // load_config_from_dir validates; run again explicitly so a future
    // split of parse and validate keeps this command honest.
    validate_config(&config).context("configuration failed validation")?;
    println!(
        "configuration OK: {} server(s), {} plugin(s)",
        config.servers.len(),
        config.runtime.plugins.len()
    );
    Ok(())
}

async fn serve(
    config_dir: &PathBuf,
    stdio: bool,
    mcp_listen: Option<SocketAddr>,
    tags: Vec<String>,
    server: Option<String>,
) -> Result<()> {
    let config = load_config_from_dir(config_dir)
        .with_context(|| format!("configuration in {} is invalid", config_dir.display()))?;

    let governor = build_governor(&config).await?;
    let core = Core::new(config, CoreOptions {
        governor,
        ..Default::default()
    });

    let report = core.start().await;
    if !report.failed.is_empty() {
        for (spec, error) in &report.failed {
            warn!(spec = %spec, error, "spec failed to warm during bootstrap");
        }
    }

    let rpc_cancel = core.cancel_token().child_token();
    let rpc = Arc::new(RpcServer::new(Arc::clone(&core), rpc_cancel));
    let rpc_handle = tokio::spawn(async move {
        if let Err(err) = rpc.serve().await {
            error!(error = %err, "control RPC server exited");
        }
    });

    if let Some(address) = core
        .catalog()
        .runtime()
        .observability
        .listen_address
        .clone()
    {
        spawn_observability(&core, &address);
    }

    let mode = match server {
        Some(name) => GatewayMode::SingleServer(name),
        None if !tags.is_empty() => GatewayMode::TagScoped(tags),
        None => GatewayMode::Aggregate,
    };

    let http_gateway = match mcp_listen {
        Some(address) => Some(shoal_gateway::serve_http(Arc::clone(&core), mode.clone(), address).await?),
        None => None,
    };

    if stdio {
        // The stdio session is the foreground work; signals still drain.
        tokio::select! {
            result = shoal_gateway::serve_stdio(Arc::clone(&core), mode) => {
                if let Err(err) = result {
                    error!(error = %err, "stdio gateway failed");
                }
            }
            _ = wait_for_shutdown_signal() => {}
        }
    } else {
        wait_for_shutdown_signal().await;
    }

    info!("draining");
    core.shutdown().await;
    if let Some(gateway) = http_gateway {
        let _ = gateway.stop().await;
    }
    rpc_handle.abort();
    Ok(())
}

/// Build the governance pipeline when plugins are configured.
async fn build_governor(
    config: &shoal_core::config::ShoalConfig,
) -> Result<Arc<dyn Governor>> {
    if config.runtime.plugins.is_empty() {
        return Ok(Arc::new(shoal_core::governance::NoopGovernor));
    }
    #[cfg(unix)]
    {
        let socket_dir = std::env::temp_dir().join(format!("shoal-plugins-{}", std::process::id()));
        tokio::fs::create_dir_all(&socket_dir).await?;
        let pipeline = shoal_governance::GovernancePipeline::start(
            config.runtime.plugins.clone(),
            &socket_dir,
        )
        .await
        .context("failed to start governance plugins")?;
        Ok(Arc::new(pipeline))
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("governance plugins require unix domain sockets")
    }
}

fn spawn_observability(core: &Arc<Core>, address: &str) {
    use axum::routing::get;

    let status_core = Arc::clone(core);
    let app = axum::Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/status",
            get(move || {
                let core = Arc::clone(&status_core);
                async move {
                    axum::Json(serde_json::json!({
                        "catalog_version": core.catalog().version(),
                        "pools": core.pool_statuses(),
                        "init": core.init_statuses(),
                    }))
                }
            }),
        );
    let address = address.to_string();
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(&address).await {
            Ok(listener) => {
                info!(addr = %address, "observability listening");
                let _ = axum::serve(listener, app).await;
            }
            Err(err) => warn!(addr = %address, error = %err, "observability bind failed"),
        }
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
