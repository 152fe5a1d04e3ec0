//! Mesh client
//!
//! [`MeshClient`] is the handle the user interface talks to. All protocol
//! state lives in a single driver task which is the only place anything is
//! mutated: UI commands, broker traffic, media transport notifications,
//! installer completions and timer ticks are all serialized through its
//! `select!` loop. Results are reported through an [`EventBus`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::MeshConfig;
use crate::events::{EventBus, Subscription};
use crate::media::{MediaTransportFactory, PeerMediaEvent, TrackKind};
use crate::network::{
    FrameTransport, HealthEvent, HealthMonitor, LinkProbe, NetworkProbe, NetworkStatus,
    PresenceChannel, TransportError, TransportEvent, TransportOptions,
};
use crate::protocol::{Envelope, Message, PeerId, RemoteMicReason};
use crate::session::{
    validate_room_id, AudioRouter, InstallOutcome, LocalPeer, MemberInfo, ModerationError,
    ModerationEvent, ModerationProtocol, ModerationState, MuteState, RemoteMicAction,
    RemoteMicError, RemoteMicEvent, RemoteMicProtocol, RemoteMicSession, RoomCoordinator,
    RoomEvent, RoomState, ValidationError, VirtualDeviceInstaller,
};

/// How often protocol deadlines are checked
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Errors returned by [`MeshClient`] operations
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Conflict(#[from] RemoteMicError),

    #[error(transparent)]
    Moderation(#[from] ModerationError),

    #[error("Not in a room")]
    NotInRoom,

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("A join is already in progress")]
    JoinInProgress,

    #[error("Join cancelled by leaving the room")]
    JoinCancelled,

    #[error("Client is shut down")]
    Closed,
}

/// Everything reported to the user interface
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Room(RoomEvent),
    RemoteMic(RemoteMicEvent),
    Moderation(ModerationEvent),
    Health(HealthEvent),
    Error(String),
}

/// Point-in-time view of the client state
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub local_peer_id: PeerId,
    pub room_id: Option<String>,
    pub room_state: RoomState,
    pub members: HashMap<PeerId, MemberInfo>,
    pub mute_state: MuteState,
    pub remote_mic: RemoteMicSession,
    pub moderation: ModerationState,
    pub network: NetworkStatus,
}

/// Implementations of the external boundaries
pub struct Collaborators {
    pub media: Arc<dyn MediaTransportFactory>,
    pub router: Arc<dyn AudioRouter>,
    pub installer: Arc<dyn VirtualDeviceInstaller>,
    pub clock: Arc<dyn Clock>,
    /// Reachability source; the broker link state when `None`
    pub probe: Option<Arc<dyn NetworkProbe>>,
}

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

enum Command {
    Join {
        room_id: String,
        display_name: String,
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
    Chat {
        text: String,
        reply: Reply<()>,
    },
    SetMuted(bool),
    SetVideoEnabled(bool),
    ReplaceTrack {
        kind: TrackKind,
        source: Option<String>,
    },
    RequestRemoteMic {
        target: PeerId,
        reply: Reply<String>,
    },
    RespondRemoteMic {
        accept: bool,
        reply: Reply<()>,
    },
    CancelInstall,
    StopRemoteMic,
    SetRemoteMicEnabled(bool),
    SetRoomLocked {
        locked: bool,
        reply: Reply<()>,
    },
    RequestMuteAll {
        reply: Reply<String>,
    },
    RespondMuteAll {
        accept: bool,
        reply: Reply<()>,
    },
    SetHandRaised(bool),
    ManualReconnect {
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<ClientSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running mesh client
///
/// Dropping the handle leaves the room and closes the broker connection.
pub struct MeshClient {
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus<ClientEvent>,
    local_id: PeerId,
}

impl MeshClient {
    /// Start the driver task; nothing connects until [`Self::join_room`]
    pub fn start(config: MeshConfig, collaborators: Collaborators) -> Self {
        let local_id = PeerId::random();
        let events = EventBus::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let driver = Driver::new(
            config,
            collaborators,
            local_id.clone(),
            events.clone(),
            command_rx,
        );
        tokio::spawn(driver.run());
        info!("Mesh client started as {}", local_id);

        Self {
            commands: command_tx,
            events,
            local_id,
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn events(&self) -> &EventBus<ClientEvent> {
        &self.events
    }

    /// Register an event handler
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.events.on(handler)
    }

    /// Join `room_id`, connecting to the broker first if needed
    ///
    /// The room id is validated before anything touches the network.
    pub async fn join_room(&self, room_id: &str, display_name: &str) -> Result<(), ClientError> {
        validate_room_id(room_id)?;
        if display_name.trim().is_empty() {
            return Err(ValidationError::EmptyDisplayName.into());
        }
        self.call(|reply| Command::Join {
            room_id: room_id.to_string(),
            display_name: display_name.trim().to_string(),
            reply,
        })
        .await
    }

    pub async fn leave_room(&self) -> Result<(), ClientError> {
        self.call(|reply| Command::Leave { reply }).await
    }

    pub async fn send_chat_message(&self, text: &str) -> Result<(), ClientError> {
        self.call(|reply| Command::Chat {
            text: text.to_string(),
            reply,
        })
        .await
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), ClientError> {
        self.send(Command::SetMuted(muted))
    }

    pub fn set_video_enabled(&self, enabled: bool) -> Result<(), ClientError> {
        self.send(Command::SetVideoEnabled(enabled))
    }

    /// Switch the outgoing track of `kind` to another local source
    pub fn replace_track(&self, kind: TrackKind, source: Option<&str>) -> Result<(), ClientError> {
        self.send(Command::ReplaceTrack {
            kind,
            source: source.map(str::to_string),
        })
    }

    /// Ask `target` to play our microphone; returns the request id
    pub async fn request_remote_mic(&self, target: &PeerId) -> Result<String, ClientError> {
        self.call(|reply| Command::RequestRemoteMic {
            target: target.clone(),
            reply,
        })
        .await
    }

    pub async fn respond_remote_mic_request(&self, accept: bool) -> Result<(), ClientError> {
        self.call(|reply| Command::RespondRemoteMic { accept, reply })
            .await
    }

    pub fn cancel_virtual_device_install(&self) -> Result<(), ClientError> {
        self.send(Command::CancelInstall)
    }

    pub fn stop_remote_mic(&self) -> Result<(), ClientError> {
        self.send(Command::StopRemoteMic)
    }

    pub fn set_remote_mic_enabled(&self, enabled: bool) -> Result<(), ClientError> {
        self.send(Command::SetRemoteMicEnabled(enabled))
    }

    pub async fn set_room_locked(&self, locked: bool) -> Result<(), ClientError> {
        self.call(|reply| Command::SetRoomLocked { locked, reply })
            .await
    }

    /// Ask every member to mute; returns the request id
    pub async fn request_mute_all(&self) -> Result<String, ClientError> {
        self.call(|reply| Command::RequestMuteAll { reply }).await
    }

    pub async fn respond_mute_all(&self, accept: bool) -> Result<(), ClientError> {
        self.call(|reply| Command::RespondMuteAll { accept, reply })
            .await
    }

    pub fn set_hand_raised(&self, raised: bool) -> Result<(), ClientError> {
        self.send(Command::SetHandRaised(raised))
    }

    /// Reconnect to the broker now; returns false when already online
    pub async fn manual_reconnect(&self) -> Result<bool, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ManualReconnect { reply })?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub async fn snapshot(&self) -> Result<ClientSnapshot, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Leave the room, close the broker connection and stop the driver
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        rx.await.map_err(|_| ClientError::Closed)?
    }
}

type ConnectResult = Result<(FrameTransport, mpsc::Receiver<TransportEvent>), TransportError>;

struct PendingJoin {
    room_id: String,
    reply: Reply<()>,
}

/// Owner of all protocol state
struct Driver {
    config: MeshConfig,
    clock: Arc<dyn Clock>,
    router: Arc<dyn AudioRouter>,
    installer: Arc<dyn VirtualDeviceInstaller>,
    probe: Option<Arc<dyn NetworkProbe>>,
    local_id: PeerId,

    room: RoomCoordinator,
    remote_mic: RemoteMicProtocol,
    moderation: ModerationProtocol,
    health: HealthMonitor,

    presence: Option<PresenceChannel>,
    link_probe: Option<LinkProbe>,
    pending_join: Option<PendingJoin>,
    /// A broker connect is in flight
    connecting: bool,
    locked_out: bool,

    commands: mpsc::UnboundedReceiver<Command>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    media_events: mpsc::UnboundedReceiver<PeerMediaEvent>,
    install_tx: mpsc::UnboundedSender<(String, InstallOutcome)>,
    install_rx: mpsc::UnboundedReceiver<(String, InstallOutcome)>,
    connect_tx: mpsc::UnboundedSender<ConnectResult>,
    connect_rx: mpsc::UnboundedReceiver<ConnectResult>,

    events: EventBus<ClientEvent>,
}

impl Driver {
    fn new(
        config: MeshConfig,
        collaborators: Collaborators,
        local_id: PeerId,
        events: EventBus<ClientEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (media_tx, media_events) = mpsc::unbounded_channel();
        let (install_tx, install_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();

        let local = LocalPeer {
            id: local_id.clone(),
            display_name: String::new(),
            platform: config.presence.platform.clone(),
        };
        let room = RoomCoordinator::new(
            local,
            &config.presence,
            &config.negotiation,
            collaborators.media,
            media_tx,
        );
        let remote_mic = RemoteMicProtocol::new(local_id.clone(), "", config.remote_mic.clone());
        let moderation = ModerationProtocol::new(local_id.clone(), "");
        let health = HealthMonitor::new(config.health.max_reconnect_attempts);

        Self {
            config,
            clock: collaborators.clock,
            router: collaborators.router,
            installer: collaborators.installer,
            probe: collaborators.probe,
            local_id,
            room,
            remote_mic,
            moderation,
            health,
            presence: None,
            link_probe: None,
            pending_join: None,
            connecting: false,
            locked_out: false,
            commands,
            transport_events: None,
            media_events,
            install_tx,
            install_rx,
            connect_tx,
            connect_rx,
            events,
        }
    }

    async fn run(mut self) {
        let mut tick = interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = interval(self.config.health.stats_interval());
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut network = interval(self.config.health.network_interval());
        network.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            return;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }

                event = recv_optional(&mut self.transport_events) => {
                    match event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => {
                            debug!("Transport event stream ended");
                            self.transport_events = None;
                        }
                    }
                }

                Some(event) = self.media_events.recv() => {
                    let now = self.clock.now();
                    self.room.handle_media_event(event, now).await;
                }

                Some((correlation_id, outcome)) = self.install_rx.recv() => {
                    let now = self.clock.now();
                    self.remote_mic.on_install_result(&correlation_id, outcome, now);
                }

                Some(result) = self.connect_rx.recv() => self.finish_connect(result),

                _ = tick.tick() => {
                    let now = self.clock.now();
                    self.room.tick(now).await;
                    self.remote_mic.tick(now);
                }

                _ = stats.tick() => self.poll_stats().await,

                _ = network.tick() => self.poll_network(),
            }

            self.flush();
            if std::mem::take(&mut self.locked_out) {
                self.leave_room().await;
                self.emit(ClientEvent::Error("Room is locked".to_string()));
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        let now = self.clock.now();

        match command {
            Command::Join {
                room_id,
                display_name,
                reply,
            } => self.join(room_id, display_name, reply).await,
            Command::Leave { reply } => {
                self.cancel_pending_join();
                self.leave_room().await;
                let _ = reply.send(Ok(()));
            }
            Command::Chat { text, reply } => {
                let ts = self.clock.unix_millis();
                let result = self.room.send_chat(&text, ts).map_err(ClientError::from);
                let _ = reply.send(result);
            }
            Command::SetMuted(muted) => self.room.set_muted(muted),
            Command::SetVideoEnabled(enabled) => self.room.set_video_enabled(enabled),
            Command::ReplaceTrack { kind, source } => {
                self.room.replace_track(kind, source.as_deref(), now).await;
            }
            Command::RequestRemoteMic { target, reply } => {
                let result = if !self.room.is_member(&target) {
                    Err(ClientError::UnknownPeer(target))
                } else {
                    self.remote_mic.request(&target, now).map_err(ClientError::from)
                };
                let _ = reply.send(result);
            }
            Command::RespondRemoteMic { accept, reply } => {
                let ready = self.router.virtual_device_ready();
                let result = self
                    .remote_mic
                    .respond(accept, ready, now)
                    .map_err(ClientError::from);
                let _ = reply.send(result);
            }
            Command::CancelInstall => self.remote_mic.cancel_install(now),
            Command::StopRemoteMic => self.remote_mic.stop(RemoteMicReason::UserStopped),
            Command::SetRemoteMicEnabled(enabled) => self.remote_mic.set_enabled(enabled),
            Command::SetRoomLocked { locked, reply } => {
                let result = if self.room.in_room() {
                    self.moderation
                        .set_room_locked(locked)
                        .map_err(ClientError::from)
                } else {
                    Err(ClientError::NotInRoom)
                };
                let _ = reply.send(result);
            }
            Command::RequestMuteAll { reply } => {
                let result = if self.room.in_room() {
                    Ok(self.moderation.request_mute_all())
                } else {
                    Err(ClientError::NotInRoom)
                };
                let _ = reply.send(result);
            }
            Command::RespondMuteAll { accept, reply } => {
                let result = self
                    .moderation
                    .respond_mute_all(accept)
                    .map_err(ClientError::from);
                let _ = reply.send(result);
            }
            Command::SetHandRaised(raised) => {
                if self.room.in_room() {
                    let ts = self.clock.unix_millis();
                    self.moderation.set_hand_raised(raised, ts);
                }
            }
            Command::ManualReconnect { reply } => {
                let reconnecting = self.health.should_manual_reconnect()
                    && self
                        .presence
                        .as_ref()
                        .is_some_and(|presence| presence.transport().reconnect_now().is_ok());
                if reconnecting {
                    info!("Manual reconnect requested");
                }
                let _ = reply.send(reconnecting);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    async fn join(&mut self, room_id: String, display_name: String, reply: Reply<()>) {
        if self.pending_join.is_some() {
            let _ = reply.send(Err(ClientError::JoinInProgress));
            return;
        }
        if self.room.room_id() == Some(room_id.as_str()) {
            let _ = reply.send(Ok(()));
            return;
        }
        if self.room.in_room() {
            self.leave_room().await;
        }

        self.room.set_display_name(display_name.as_str());
        self.remote_mic.set_local_name(display_name.as_str());
        self.moderation.set_local_name(display_name);

        if self.presence.is_some() {
            let result = self.enter_room(&room_id);
            let _ = reply.send(result);
            return;
        }

        if !self.connecting {
            info!("Connecting to broker {}", self.config.broker.url);
            let options = TransportOptions::from(&self.config.broker);
            let connect_tx = self.connect_tx.clone();
            tokio::spawn(async move {
                let _ = connect_tx.send(FrameTransport::connect(options).await);
            });
            self.connecting = true;
        }
        self.pending_join = Some(PendingJoin { room_id, reply });
    }

    /// Fail a join still waiting for the broker; the connection itself is
    /// kept for the next join
    fn cancel_pending_join(&mut self) {
        if let Some(PendingJoin { room_id, reply }) = self.pending_join.take() {
            debug!("Cancelling join of room {}", room_id);
            let _ = reply.send(Err(ClientError::JoinCancelled));
        }
    }

    fn finish_connect(&mut self, result: ConnectResult) {
        self.connecting = false;
        let pending = self.pending_join.take();

        match result {
            Ok((transport, events)) => {
                self.link_probe = Some(LinkProbe::new(transport.state_watch()));
                self.presence = Some(PresenceChannel::new(
                    transport,
                    self.local_id.clone(),
                    self.config.broker.topic_prefix.clone(),
                ));
                self.transport_events = Some(events);

                if let Some(PendingJoin { room_id, reply }) = pending {
                    let result = self.enter_room(&room_id);
                    let _ = reply.send(result);
                }
            }
            Err(e) => {
                warn!("Failed to connect to broker: {}", e);
                self.emit(ClientEvent::Error(format!("Failed to connect: {}", e)));
                if let Some(PendingJoin { reply, .. }) = pending {
                    let _ = reply.send(Err(e.into()));
                }
            }
        }
    }

    /// Subscribe to the room topic and announce
    fn enter_room(&mut self, room_id: &str) -> Result<(), ClientError> {
        let presence = self.presence.as_mut().ok_or(TransportError::NotConnected)?;
        presence.join(room_id)?;
        self.room.join(room_id, self.clock.now())?;
        Ok(())
    }

    async fn leave_room(&mut self) {
        if !self.room.in_room() {
            return;
        }

        self.remote_mic.reset();
        self.moderation.reset();
        self.flush();

        self.room.leave().await;
        self.flush();

        if let Some(presence) = self.presence.as_mut() {
            if let Err(e) = presence.leave() {
                debug!("Unsubscribing from room: {}", e);
            }
        }
        self.health.forget_all();
    }

    async fn shutdown(&mut self) {
        info!("Shutting down mesh client");
        self.cancel_pending_join();
        self.leave_room().await;
        if let Some(presence) = self.presence.take() {
            presence.close().await;
        }
        self.transport_events = None;
        self.link_probe = None;
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        let in_room = self.room.in_room();

        match event {
            TransportEvent::Message { topic, payload } => {
                let envelope = self
                    .presence
                    .as_ref()
                    .and_then(|presence| presence.decode(&topic, &payload));
                if let Some(envelope) = envelope {
                    self.dispatch_envelope(envelope).await;
                }
            }
            TransportEvent::Disconnected { reason } => {
                debug!("Broker link down: {}", reason);
                self.record_network(false, in_room);
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                debug!("Broker reconnect attempt {} in {:?}", attempt, delay);
                let event = self.health.on_reconnect_attempt();
                self.emit_health(event);
            }
            TransportEvent::Connected => {
                self.record_network(true, in_room);
                self.room.reannounce(self.clock.now());
            }
        }
    }

    /// Route an inbound envelope to the protocol that owns its type
    async fn dispatch_envelope(&mut self, envelope: Envelope) {
        let now = self.clock.now();
        let sender = envelope.sender_id.clone();
        self.room.touch(&sender, now);

        let route = match envelope.message {
            Message::Announce { .. }
                if !self.room.is_member(&sender) && !self.moderation.admits() =>
            {
                Route::Refused
            }
            Message::Announce { .. }
            | Message::Leave
            | Message::Signal { .. }
            | Message::MuteStatus { .. }
            | Message::Chat { .. } => Route::Room,
            Message::RoomLock { .. }
            | Message::RoomLockedNotice { .. }
            | Message::MuteAllRequest { .. }
            | Message::MuteAllResponse { .. }
            | Message::HandRaise { .. } => Route::Moderation,
            Message::RmRequest { .. }
            | Message::RmResponse { .. }
            | Message::RmStart { .. }
            | Message::RmHeartbeat { .. }
            | Message::RmStop { .. } => Route::RemoteMic,
        };

        match route {
            Route::Refused => self.moderation.on_unadmitted_announce(&sender),
            Route::Room => self.room.handle_envelope(envelope, now).await,
            Route::Moderation => {
                let is_member = self.room.is_member(&sender);
                self.moderation
                    .handle_message(&sender, is_member, &envelope.message)
            }
            Route::RemoteMic => self
                .remote_mic
                .handle_message(&sender, &envelope.message, now),
        }
    }

    async fn poll_stats(&mut self) {
        for (peer_id, stats, connection_state) in self.room.collect_stats().await {
            let event = self.health.record_stats(&peer_id, &stats, connection_state);
            self.emit_health(event);
        }
    }

    fn poll_network(&mut self) {
        let link_connected = match (&self.probe, &self.link_probe) {
            (_, Some(link)) => link.is_online(),
            // No broker link to lose yet
            (Some(_), None) => true,
            (None, None) => return,
        };
        self.record_network(link_connected, self.room.in_room());
    }

    /// Combine the reachability probe with the broker link state
    fn record_network(&mut self, link_connected: bool, in_room: bool) {
        let reachable = self
            .probe
            .as_ref()
            .map_or(link_connected, |probe| probe.is_online());
        let event = self
            .health
            .on_network_sample(reachable, link_connected, in_room);
        self.emit_health(event);
    }

    /// Publish queued messages and apply queued side effects until every
    /// protocol is drained
    fn flush(&mut self) {
        loop {
            let mut progressed = false;

            while let Some(message) = self.room.poll_outgoing() {
                self.publish(message);
                progressed = true;
            }
            while let Some(event) = self.room.poll_event() {
                self.on_room_event(&event);
                self.emit(ClientEvent::Room(event));
                progressed = true;
            }
            while let Some(action) = self.remote_mic.poll_action() {
                self.apply_remote_mic(action);
                progressed = true;
            }
            while let Some(message) = self.moderation.poll_outgoing() {
                self.publish(message);
                progressed = true;
            }
            while let Some(event) = self.moderation.poll_event() {
                self.on_moderation_event(&event);
                self.emit(ClientEvent::Moderation(event));
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
    }

    fn on_room_event(&mut self, event: &RoomEvent) {
        match event {
            RoomEvent::PeerJoined { peer_id, .. } => self.moderation.on_peer_joined(peer_id),
            RoomEvent::PeerLeft { peer_id, .. } => {
                self.remote_mic.on_peer_left(peer_id);
                let present = self.room.peer_ids();
                self.moderation.on_presence_changed(present.iter());
                self.health.forget_peer(peer_id);
            }
            _ => {}
        }
    }

    fn on_moderation_event(&mut self, event: &ModerationEvent) {
        match event {
            ModerationEvent::LocalMuteRequested => {
                info!("Muting for mute-all request");
                self.room.set_muted(true);
            }
            ModerationEvent::RoomLocked => self.locked_out = true,
            _ => {}
        }
    }

    fn apply_remote_mic(&mut self, action: RemoteMicAction) {
        match action {
            RemoteMicAction::Send(message) => self.publish(message),
            RemoteMicAction::SetRouting(mode) => {
                debug!("Audio routing {:?}", mode);
                self.router.set_routing(&mode);
            }
            RemoteMicAction::InstallDriver {
                provider,
                correlation_id,
            } => {
                let installer = self.installer.clone();
                let install_tx = self.install_tx.clone();
                tokio::spawn(async move {
                    let outcome = installer
                        .install_virtual_audio_driver(&provider, &correlation_id)
                        .await;
                    let _ = install_tx.send((correlation_id, outcome));
                });
            }
            RemoteMicAction::Event(event) => self.emit(ClientEvent::RemoteMic(event)),
        }
    }

    fn publish(&self, message: Message) {
        let Some(presence) = self.presence.as_ref() else {
            debug!("Not connected, dropping {}", message.kind());
            return;
        };
        let kind = message.kind();
        if let Err(e) = presence.publish(message) {
            warn!("Failed to publish {}: {}", kind, e);
        }
    }

    fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            local_peer_id: self.local_id.clone(),
            room_id: self.room.room_id().map(str::to_string),
            room_state: self.room.room_state(),
            members: self
                .room
                .presence()
                .map(|presence| presence.members.clone())
                .unwrap_or_default(),
            mute_state: self.room.mute_state(),
            remote_mic: self.remote_mic.session().clone(),
            moderation: self.moderation.state().clone(),
            network: self.health.network(),
        }
    }

    fn emit_health(&self, event: Option<HealthEvent>) {
        if let Some(event) = event {
            self.emit(ClientEvent::Health(event));
        }
    }

    fn emit(&self, event: ClientEvent) {
        self.events.emit(&event);
    }
}

enum Route {
    Refused,
    Room,
    Moderation,
    RemoteMic,
}

async fn recv_optional<T>(receiver: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
