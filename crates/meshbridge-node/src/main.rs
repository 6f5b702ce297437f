//! Meshbridge -- Atlas Command over a Meshtastic-class radio mesh.
//!
//! Usage:
//!   meshbridge gateway                         # Bridge the mesh to the HTTP API
//!   meshbridge client --command test_echo      # One-shot request over the mesh
//!   meshbridge config                          # Print the effective config
//!
//! Exit codes: 0 success, 2 configuration error, 3 transport failure,
//! 4 timeout, 5 payload too large.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use meshbridge_node::config::BridgeConfig;
use meshbridge_node::status_api::{self, AppState};
use meshbridge_node::{
    Client, Dispatcher, Gateway, HttpExecutor, NodeError, Radio, SimBus,
};
use meshbridge_protocol::ProtocolError;
use meshbridge_reliability::{DedupeCache, Reassembler, Strategy};
use meshbridge_spool::{Spool, SpoolConfig};

#[derive(Parser)]
#[command(name = "meshbridge", about = "Atlas Command bridge over a radio mesh")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.meshbridge/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as the gateway bridging the mesh to the Atlas HTTP API
    Gateway,
    /// Send one request as a client and print the response
    Client {
        /// Command name, e.g. test_echo or list_entities
        #[arg(long)]
        command: String,
        /// JSON payload for the command
        #[arg(long, default_value = "{}")]
        data: String,
        /// Override the configured wait timeout (seconds)
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshbridge=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let result = run(cli.command, &config_path).await;

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(exit_code(&err));
    }
}

async fn run(command: Commands, config_path: &std::path::Path) -> Result<(), NodeError> {
    let mut cfg = BridgeConfig::load_or_default(config_path)?;
    // The CLI (not the core) may pull the API token from the environment.
    if cfg.node.api_token.is_none() {
        cfg.node.api_token = std::env::var("ATLAS_API_TOKEN").ok();
    }

    match command {
        Commands::Config => {
            let rendered = toml::to_string_pretty(&cfg)
                .map_err(|e| NodeError::Config(e.to_string()))?;
            println!("{rendered}");
            Ok(())
        }
        Commands::Gateway => run_gateway(cfg).await,
        Commands::Client {
            command,
            data,
            timeout,
        } => run_client(cfg, &command, &data, timeout).await,
    }
}

fn build_radio(cfg: &BridgeConfig) -> Result<Arc<dyn Radio>, NodeError> {
    if cfg.node.simulate {
        tracing::warn!("simulated radio: peers must share this process's bus");
        let bus = SimBus::new();
        return Ok(Arc::new(bus.attach(&cfg.node.node_id)));
    }

    #[cfg(feature = "serial")]
    if let Some(port) = &cfg.node.radio_port {
        let radio = meshbridge_node::radio::serial::SerialRadio::open(port, 115_200)
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        tracing::info!(port, "serial radio opened");
        return Ok(Arc::new(radio));
    }
    #[cfg(not(feature = "serial"))]
    if cfg.node.radio_port.is_some() {
        return Err(NodeError::Config(
            "radio_port set but this build lacks the `serial` feature".into(),
        ));
    }

    Err(NodeError::Config(
        "no radio configured: set simulate = true or a radio_port".into(),
    ))
}

struct NodeStack {
    dispatcher: Arc<Dispatcher>,
    dedupe: Arc<DedupeCache>,
    requests: tokio::sync::mpsc::Receiver<meshbridge_node::InboundRequest>,
}

fn build_stack(cfg: &BridgeConfig) -> Result<NodeStack, NodeError> {
    let radio = build_radio(cfg)?;

    let mut spool_cfg = SpoolConfig::new(expand_tilde(&cfg.spool.spool_path));
    spool_cfg.retries = cfg.spool.retries;
    spool_cfg.clear_on_open = cfg.spool.clear_spool;
    let spool = Arc::new(Spool::open(spool_cfg)?);
    tracing::info!(depth = spool.depth(), "spool opened");

    let dedupe = Arc::new(DedupeCache::new(cfg.dedupe_config()));
    let strategy = Strategy::new(cfg.method()?);
    let reassembler = Reassembler::new(cfg.reassembly_config());

    let (dispatcher, requests) = Dispatcher::new(
        cfg.dispatcher_config(),
        radio,
        strategy,
        reassembler,
        spool,
        Some(Arc::clone(&dedupe)),
    );
    Ok(NodeStack {
        dispatcher,
        dedupe,
        requests,
    })
}

async fn run_gateway(cfg: BridgeConfig) -> Result<(), NodeError> {
    let stack = build_stack(&cfg)?;
    let dispatcher = Arc::clone(&stack.dispatcher);
    tracing::info!(
        node_id = %cfg.node.node_id,
        api = %cfg.node.api_base_url,
        method = %cfg.reliability.method,
        "starting gateway"
    );

    let executor = Arc::new(HttpExecutor::new(
        cfg.node.api_base_url.clone(),
        cfg.node.api_token.clone(),
    ));
    let gateway = Gateway::new(
        Arc::clone(&dispatcher),
        Arc::clone(&stack.dedupe),
        executor,
    );

    if let Some(addr) = &cfg.status.status_addr {
        let addr: std::net::SocketAddr = addr
            .parse()
            .map_err(|e| NodeError::Config(format!("status_addr: {e}")))?;
        let state = Arc::new(AppState {
            role: "gateway",
            dispatcher: Arc::clone(&dispatcher),
            dedupe: Some(Arc::clone(&stack.dedupe)),
        });
        let shutdown = dispatcher.shutdown_handle().subscribe();
        tokio::spawn(async move {
            if let Err(err) = status_api::serve(addr, state, shutdown).await {
                tracing::error!(%err, "status API failed");
            }
        });
    }

    let run_handle = tokio::spawn(Arc::clone(&dispatcher).run());
    let shutdown_rx = dispatcher.shutdown_handle().subscribe();
    let gateway_handle = tokio::spawn(async move {
        gateway.run(stack.requests, shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| NodeError::Transport(e.to_string()))?;
    tracing::info!("shutting down");
    dispatcher.shutdown();
    let _ = run_handle.await;
    let _ = gateway_handle.await;
    Ok(())
}

async fn run_client(
    cfg: BridgeConfig,
    command: &str,
    data: &str,
    timeout: Option<f64>,
) -> Result<(), NodeError> {
    let payload: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| NodeError::Config(format!("--data is not valid JSON: {e}")))?;

    let stack = build_stack(&cfg)?;
    let dispatcher = Arc::clone(&stack.dispatcher);
    let run_handle = tokio::spawn(Arc::clone(&dispatcher).run());

    let mut client_cfg = cfg.client_config();
    if let Some(secs) = timeout {
        client_cfg.timeout = std::time::Duration::from_secs_f64(secs);
    }
    let client = Client::new(Arc::clone(&dispatcher), client_cfg);

    let result = client.send_request(command, payload).await;
    dispatcher.shutdown();
    let _ = run_handle.await;

    let response = result?;
    let rendered = serde_json::to_string_pretty(&response)
        .map_err(|e| NodeError::Transport(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn exit_code(err: &NodeError) -> i32 {
    match err {
        NodeError::Config(_) => 2,
        NodeError::Timeout { .. } => 4,
        NodeError::Protocol(ProtocolError::PayloadTooLarge { .. }) => 5,
        _ => 3,
    }
}
