//! Mesh call peer binary
//!
//! Connects to a call-signaling server as one peer and either waits for
//! incoming calls or places a call.
//!
//! # Usage
//!
//! ```bash
//! # Wait for calls as "bob", answering automatically
//! cargo run --bin meshcall -- \
//!   --signaling-url ws://localhost:8080 \
//!   --peer-id bob \
//!   --auto-answer
//!
//! # Call bob and carol from "alice"
//! cargo run --bin meshcall -- \
//!   --peer-id alice \
//!   --call bob,carol --video
//!
//! # Configure STUN/TURN servers
//! cargo run --bin meshcall -- \
//!   --stun-servers stun:stun.l.google.com:19302 \
//!   --turn-servers turn:turn.example.com:3478:user:secret
//! ```

use anyhow::Context;
use clap::Parser;
use meshcall_webrtc::media::StaticMediaDevices;
use meshcall_webrtc::peer::RtcConnectionFactory;
use meshcall_webrtc::signaling::WebSocketTransport;
use meshcall_webrtc::{CallConfig, CallOrchestrator, CallPhase, DataChannelMode, TurnServerConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8080";

/// Mesh call peer
///
/// Joins a signaling server and places or answers WebRTC mesh calls.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket signaling URL [default: ws://localhost:8080]
    #[arg(long, env = "MESHCALL_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Local peer id (random when omitted)
    #[arg(long, env = "MESHCALL_PEER_ID")]
    peer_id: Option<String>,

    /// JSON configuration file; command line flags override it
    #[arg(long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Configuration preset
    #[arg(long, env = "MESHCALL_PRESET")]
    preset: Option<ConfigPreset>,

    /// STUN server URLs (comma-separated)
    #[arg(long, value_delimiter = ',', env = "MESHCALL_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// TURN servers as turn:host:port:username:password (comma-separated)
    #[arg(long, value_delimiter = ',', env = "MESHCALL_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Maximum remote participants per call (1-16)
    #[arg(long, env = "MESHCALL_MAX_PEERS")]
    max_peers: Option<u32>,

    /// Disable the per-peer control data channel
    #[arg(long, env = "MESHCALL_NO_DATA_CHANNEL")]
    no_data_channel: bool,

    /// Data channel delivery mode
    #[arg(long, env = "MESHCALL_DATA_CHANNEL_MODE")]
    data_channel_mode: Option<DataChannelModeArg>,

    /// Statistics sampling interval in milliseconds
    #[arg(long, env = "MESHCALL_STATS_INTERVAL_MS")]
    stats_interval_ms: Option<u64>,

    /// Seconds before an unanswered call gives up (0 disables)
    #[arg(long, env = "MESHCALL_RING_TIMEOUT_SECS")]
    ring_timeout_secs: Option<u64>,

    /// Peers to call on startup (comma-separated)
    #[arg(long, value_delimiter = ',')]
    call: Vec<String>,

    /// Request video when calling; answers follow the caller's choice
    #[arg(long)]
    video: bool,

    /// Answer incoming calls without prompting
    #[arg(long, env = "MESHCALL_AUTO_ANSWER")]
    auto_answer: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "MESHCALL_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ConfigPreset {
    /// Faster stats feedback, unreliable data channel
    LowLatency,
    /// Backup STUN server, smaller mesh, longer ring timeout
    MobileNetwork,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum DataChannelModeArg {
    Reliable,
    Unreliable,
}

impl From<DataChannelModeArg> for DataChannelMode {
    fn from(mode: DataChannelModeArg) -> Self {
        match mode {
            DataChannelModeArg::Reliable => DataChannelMode::Reliable,
            DataChannelModeArg::Unreliable => DataChannelMode::Unreliable,
        }
    }
}

/// Parse TURN server string: turn:host:port:username:password
fn parse_turn_server(s: &str) -> anyhow::Result<TurnServerConfig> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        anyhow::bail!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        );
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        anyhow::bail!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        );
    }

    // Password may contain colons
    Ok(TurnServerConfig {
        url: format!("{}:{}:{}", protocol, parts[1], parts[2]),
        username: parts[3].to_string(),
        credential: parts[4..].join(":"),
    })
}

/// Build CallConfig from file, preset and CLI overrides
fn build_config_from_args(args: &Args) -> anyhow::Result<CallConfig> {
    let signaling_url = args
        .signaling_url
        .as_deref()
        .unwrap_or(DEFAULT_SIGNALING_URL);

    let mut config = match (&args.config, args.preset) {
        (Some(path), _) => CallConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        (None, Some(ConfigPreset::LowLatency)) => {
            info!("Using low_latency preset");
            CallConfig::low_latency_preset(signaling_url)
        }
        (None, Some(ConfigPreset::MobileNetwork)) => {
            info!("Using mobile_network preset");
            CallConfig::mobile_network_preset(signaling_url)
        }
        (None, None) => CallConfig {
            signaling_url: signaling_url.to_string(),
            ..Default::default()
        },
    };

    if let Some(url) = &args.signaling_url {
        config.signaling_url = url.clone();
    }
    if !args.stun_servers.is_empty() {
        config.stun_servers = args.stun_servers.clone();
    }
    if let Some(max_peers) = args.max_peers {
        config.max_peers = max_peers;
    }
    if args.no_data_channel {
        config.enable_data_channel = false;
    }
    if let Some(mode) = args.data_channel_mode {
        config.data_channel_mode = mode.into();
    }
    if let Some(interval) = args.stats_interval_ms {
        config.stats_interval_ms = interval;
    }
    if let Some(timeout) = args.ring_timeout_secs {
        config.ring_timeout_secs = timeout;
    }
    if let Some(peer_id) = &args.peer_id {
        config.local_peer_id = Some(peer_id.clone());
    }

    let mut turn_servers = Vec::new();
    for turn_str in &args.turn_servers {
        let turn_config = parse_turn_server(turn_str).context("Failed to parse TURN server")?;
        info!(
            "Adding TURN server: {} (user: {})",
            turn_config.url, turn_config.username
        );
        turn_servers.push(turn_config);
    }
    if !turn_servers.is_empty() {
        config.turn_servers = turn_servers;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, hanging up...");

        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }

        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_secs(3));
            eprintln!("Graceful shutdown timeout (3s), forcing exit");
            std::process::exit(0);
        });
    })
    .context("Failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("meshcall-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing(args.json_logs)?;

    info!(
        version = meshcall_webrtc::version(),
        preset = ?args.preset,
        "meshcall starting"
    );

    let config = build_config_from_args(&args)?;
    info!(
        signaling_url = %config.signaling_url,
        max_peers = config.max_peers,
        stun_servers = config.stun_servers.len(),
        turn_servers = config.turn_servers.len(),
        enable_data_channel = config.enable_data_channel,
        data_channel_mode = ?config.data_channel_mode,
        stats_interval_ms = config.stats_interval_ms,
        ring_timeout_secs = config.ring_timeout_secs,
        "Configuration loaded"
    );

    let transport = Arc::new(
        WebSocketTransport::connect(&config.signaling_url, config.event_channel_capacity)
            .await
            .context("Failed to reach signaling server")?,
    );
    let factory = Arc::new(RtcConnectionFactory::new(&config));
    let devices = Arc::new(StaticMediaDevices::with_default_devices());

    let orchestrator = CallOrchestrator::new(config, transport.clone(), factory, devices)?;
    orchestrator.start()?;
    info!(peer_id = orchestrator.local_peer_id(), "Ready for calls");

    let watcher = tokio::spawn(watch_calls(Arc::clone(&orchestrator), args.auto_answer));

    if !args.call.is_empty() {
        let call_id = orchestrator.initiate_call(&args.call, args.video).await?;
        info!(call_id = %call_id, peers = ?args.call, "Calling");
    }

    info!("Running. Press Ctrl+C to hang up and exit.");
    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    info!("Shutdown signal received, cleaning up...");
    watcher.abort();
    orchestrator.shutdown().await;
    transport.close();
    info!("meshcall shut down gracefully");

    Ok(())
}

/// Log call state changes and answer calls when asked to
async fn watch_calls(orchestrator: Arc<CallOrchestrator>, auto_answer: bool) {
    let mut states = orchestrator.subscribe();
    let mut last_phase = CallPhase::Idle;

    while states.changed().await.is_ok() {
        let state = states.borrow_and_update().clone();

        if state.phase != last_phase {
            info!(
                phase = ?state.phase,
                call_id = ?state.call_id,
                signaling = ?state.signaling_state,
                error = ?state.error,
                "Call phase changed"
            );
            last_phase = state.phase;
        }

        if let Some(incoming) = &state.incoming {
            if !auto_answer {
                continue;
            }
            info!(from = %incoming.from_peer_id, call_id = %incoming.call_id, "Auto-answering");
            if let Err(e) = orchestrator.answer_call().await {
                warn!("Failed to answer {}: {}", incoming.call_id, e);
            }
        }
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    // RUST_LOG wins over the default level
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}
