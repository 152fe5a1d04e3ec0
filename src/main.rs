//! meshcall - Signaling and session protocols for small mesh rooms

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshcall::client::{ClientEvent, Collaborators, MeshClient};
use meshcall::clock::SystemClock;
use meshcall::config::{self, MeshConfig};
use meshcall::media::{
    DescriptionKind, IceCandidate, MediaError, MediaEventSender, MediaTransportFactory,
    PeerStats, PeerTransport, SessionDescription, TrackKind,
};
use meshcall::network::HealthEvent;
use meshcall::protocol::PeerId;
use meshcall::session::{
    AudioRouter, InstallOutcome, InstallState, ModerationEvent, RemoteMicEvent, RoomEvent,
    RoutingMode, VirtualDeviceInstaller,
};

#[derive(Parser)]
#[command(name = "meshcall")]
#[command(about = "Signaling and session protocols for small mesh rooms")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and chat from stdin
    Join {
        /// Room id (4-64 characters of A-Z, a-z, 0-9, '-' or '_')
        #[arg(short, long)]
        room: String,

        /// Display name shown to other peers
        #[arg(short, long, default_value = "Anonymous")]
        name: String,

        /// Configuration file (defaults to the per-user config)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Broker WebSocket URL, overriding the configuration
        #[arg(long, env = "MESHCALL_BROKER")]
        broker: Option<String>,
    },

    /// Show the effective configuration
    Config {
        /// Only print the configuration file path
        #[arg(long)]
        path: bool,

        /// Write the defaults to the configuration file
        #[arg(long)]
        init: bool,
    },
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Signaling-only peer transport: negotiates placeholder descriptions and
/// never carries media
struct SignalingOnlyTransport;

#[async_trait]
impl PeerTransport for SignalingOnlyTransport {
    async fn create_local_description(
        &mut self,
        kind: DescriptionKind,
        _ice_restart: bool,
    ) -> Result<SessionDescription, MediaError> {
        let sdp = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=meshcall\r\nt=0 0\r\n";
        Ok(match kind {
            DescriptionKind::Offer => SessionDescription::offer(sdp),
            DescriptionKind::Answer => SessionDescription::answer(sdp),
        })
    }

    async fn apply_remote_description(
        &mut self,
        _description: &SessionDescription,
    ) -> Result<(), MediaError> {
        Ok(())
    }

    async fn add_remote_candidate(&mut self, _candidate: &IceCandidate) -> Result<(), MediaError> {
        Ok(())
    }

    async fn replace_outgoing_track(
        &mut self,
        _kind: TrackKind,
        _source: Option<&str>,
    ) -> Result<bool, MediaError> {
        Ok(false)
    }

    async fn get_stats(&mut self) -> Result<PeerStats, MediaError> {
        Err(MediaError("no media in signaling-only mode".to_string()))
    }

    async fn close(&mut self) {}
}

struct SignalingOnlyMedia;

impl MediaTransportFactory for SignalingOnlyMedia {
    fn create(&self, _peer_id: &PeerId, _events: MediaEventSender) -> Box<dyn PeerTransport> {
        Box::new(SignalingOnlyTransport)
    }
}

/// Logs routing changes instead of applying them
struct LoggingRouter;

impl AudioRouter for LoggingRouter {
    fn virtual_device_ready(&self) -> bool {
        true
    }

    fn set_routing(&self, mode: &RoutingMode) {
        info!("Audio routing: {:?}", mode);
    }
}

struct NoInstaller;

#[async_trait]
impl VirtualDeviceInstaller for NoInstaller {
    async fn install_virtual_audio_driver(
        &self,
        provider: &str,
        _correlation_id: &str,
    ) -> InstallOutcome {
        InstallOutcome {
            state: InstallState::Unsupported,
            message: Some(format!("{} cannot be installed from the CLI", provider)),
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<MeshConfig> {
    let config = match path {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => config::load_default_config().context("Failed to load configuration")?,
    };
    Ok(config)
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Room(RoomEvent::StateChanged(state)) => println!("* room {:?}", state),
        ClientEvent::Room(RoomEvent::PeerJoined {
            peer_id,
            display_name,
            platform,
        }) => println!("* {} joined ({}, {})", display_name, peer_id, platform),
        ClientEvent::Room(RoomEvent::PeerLeft { peer_id, reason }) => {
            println!("* {} left ({:?})", peer_id, reason)
        }
        ClientEvent::Room(RoomEvent::PeerMuteChanged {
            peer_id,
            mute_state,
        }) => println!(
            "* {} muted={} video={}",
            peer_id, mute_state.muted, mute_state.video_enabled
        ),
        ClientEvent::Room(RoomEvent::PeerConnectionChanged { peer_id, state }) => {
            println!("* {} connection {:?}", peer_id, state)
        }
        ClientEvent::Room(RoomEvent::ChatMessage {
            display_name, text, ..
        }) => println!("{}: {}", display_name, text),
        ClientEvent::Room(RoomEvent::RemoteTrack { .. }) => {}
        ClientEvent::RemoteMic(RemoteMicEvent::IncomingRequest { source_name, .. }) => println!(
            "* {} wants to use your speakers as their mic: /accept or /reject",
            source_name
        ),
        ClientEvent::RemoteMic(event) => println!("* remote mic: {:?}", event),
        ClientEvent::Moderation(ModerationEvent::MuteAllRequested(request)) => println!(
            "* {} asks everyone to mute: /muteok or /mutedeny",
            request.requested_by_name
        ),
        ClientEvent::Moderation(ModerationEvent::HandQueueChanged(queue)) => {
            let names: Vec<String> = queue.iter().map(|(peer, _)| peer.to_string()).collect();
            println!("* raised hands: [{}]", names.join(", "));
        }
        ClientEvent::Moderation(event) => println!("* moderation: {:?}", event),
        ClientEvent::Health(HealthEvent::NetworkChanged(status)) => println!(
            "* network online={} reconnect attempts={}",
            status.is_online, status.reconnect_attempts
        ),
        ClientEvent::Health(HealthEvent::QualityChanged { peer_id, quality }) => {
            println!("* {} quality {:?}", peer_id, quality.quality)
        }
        ClientEvent::Error(message) => println!("! {}", message),
    }
}

/// Handle one line of input; returns false to quit
async fn handle_line(client: &MeshClient, line: &str, hand_raised: &mut bool) -> Result<bool> {
    let mut parts = line.splitn(2, ' ');
    let command = parts.next().unwrap_or_default();
    let argument = parts.next().map(str::trim).unwrap_or_default();

    match command {
        "/quit" => return Ok(false),
        "/mute" => client.set_muted(true)?,
        "/unmute" => client.set_muted(false)?,
        "/hand" => {
            *hand_raised = !*hand_raised;
            client.set_hand_raised(*hand_raised)?;
        }
        "/lock" => client.set_room_locked(true).await?,
        "/unlock" => client.set_room_locked(false).await?,
        "/muteall" => {
            let request_id = client.request_mute_all().await?;
            info!("Mute-all request {}", request_id);
        }
        "/muteok" => client.respond_mute_all(true).await?,
        "/mutedeny" => client.respond_mute_all(false).await?,
        "/mic" => {
            if argument.is_empty() {
                bail!("usage: /mic <peer id>");
            }
            let request_id = client.request_remote_mic(&PeerId::new(argument)).await?;
            info!("Remote mic request {}", request_id);
        }
        "/accept" => client.respond_remote_mic_request(true).await?,
        "/reject" => client.respond_remote_mic_request(false).await?,
        "/stopmic" => client.stop_remote_mic()?,
        "/reconnect" => {
            if !client.manual_reconnect().await? {
                println!("* already online");
            }
        }
        "/peers" => {
            let snapshot = client.snapshot().await?;
            for (peer_id, member) in &snapshot.members {
                println!("  {} {} ({})", peer_id, member.display_name, member.platform);
            }
        }
        _ if command.starts_with('/') => bail!("unknown command {}", command),
        _ => client.send_chat_message(line).await?,
    }
    Ok(true)
}

async fn run_join(
    room: String,
    name: String,
    config_path: Option<PathBuf>,
    broker: Option<String>,
) -> Result<()> {
    let mut config = load_config(config_path.as_ref())?;
    if let Some(url) = broker {
        config.broker.url = url;
    }
    config.validate()?;

    let client = MeshClient::start(
        config,
        Collaborators {
            media: Arc::new(SignalingOnlyMedia),
            router: Arc::new(LoggingRouter),
            installer: Arc::new(NoInstaller),
            clock: Arc::new(SystemClock),
            probe: None,
        },
    );

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let _subscription = client.on(move |event| {
        let _ = event_tx.send(event.clone());
    });

    client.join_room(&room, &name).await?;
    info!("Joined room {} as {}", room, client.local_peer_id());

    let mut stdin_reader = BufReader::new(tokio::io::stdin()).lines();
    let mut hand_raised = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            Some(event) = event_rx.recv() => print_event(&event),
            line_result = stdin_reader.next_line() => {
                match line_result {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match handle_line(&client, line, &mut hand_raised).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => warn!("{}", e),
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

fn run_config(path_only: bool, init: bool) -> Result<()> {
    let path = config::default_config_path().context("No configuration directory available")?;

    if path_only {
        println!("{}", path.display());
        return Ok(());
    }

    if init {
        config::save_config(&MeshConfig::default(), &path)?;
        println!("Wrote defaults to {}", path.display());
        return Ok(());
    }

    let config = config::load_default_config()?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Join {
            room,
            name,
            config,
            broker,
        } => run_join(room, name, config, broker).await?,
        Commands::Config { path, init } => run_config(path, init)?,
    }

    Ok(())
}
