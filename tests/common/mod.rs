//! Shared test helpers: an in-process broker and fake collaborators

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use meshcall::client::{ClientEvent, Collaborators, MeshClient};
use meshcall::clock::{Clock, SystemClock};
use meshcall::config::MeshConfig;
use meshcall::events::Subscription;
use meshcall::media::{
    DescriptionKind, IceCandidate, MediaError, MediaEventSender, MediaTransportFactory,
    PeerStats, PeerTransport, SessionDescription, TrackKind,
};
use meshcall::protocol::{FrameDecoder, Packet, PeerId, Publish, QoS, CONNACK_ACCEPTED};
use meshcall::session::{
    AudioRouter, InstallOutcome, InstallState, RoutingMode, VirtualDeviceInstaller,
};

/// Outbound queue of one broker connection; `None` closes the socket
type Outbox = mpsc::UnboundedSender<Option<Vec<u8>>>;

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    connections: HashMap<u64, (BTreeSet<String>, Outbox)>,
    received: Vec<(u64, Packet)>,
    accepted: usize,
    ignore_pings: bool,
}

/// Minimal publish/subscribe broker speaking the frame protocol over a
/// WebSocket with the `mqtt` subprotocol
#[derive(Clone)]
pub struct StubBroker {
    pub url: String,
    state: Arc<Mutex<BrokerState>>,
}

impl StubBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind broker");
        let port = listener.local_addr().expect("No local address").port();
        let state = Arc::new(Mutex::new(BrokerState::default()));

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.lock().accepted += 1;
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self {
            url: format!("ws://127.0.0.1:{}/mqtt", port),
            state,
        }
    }

    /// TCP connections accepted so far
    pub fn accepted(&self) -> usize {
        self.state.lock().accepted
    }

    /// Every packet received from clients, in arrival order
    pub fn received(&self) -> Vec<Packet> {
        self.state
            .lock()
            .received
            .iter()
            .map(|(_, packet)| packet.clone())
            .collect()
    }

    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.received()
            .iter()
            .filter(|packet| {
                matches!(packet, Packet::Subscribe { topics, .. }
                    if topics.iter().any(|(t, _)| t == topic))
            })
            .count()
    }

    /// Stop (or resume) answering PINGREQ
    pub fn ignore_pings(&self, ignore: bool) {
        self.state.lock().ignore_pings = ignore;
    }

    /// Write raw bytes to every client socket
    pub fn send_raw(&self, bytes: &[u8]) {
        for (_, outbox) in self.state.lock().connections.values() {
            let _ = outbox.send(Some(bytes.to_vec()));
        }
    }

    /// Close every client socket
    pub fn kick_all(&self) {
        for (_, outbox) in self.state.lock().connections.values() {
            let _ = outbox.send(None);
        }
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<BrokerState>>) {
    let callback = |_request: &Request, mut response: Response| {
        response
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
        Ok::<Response, ErrorResponse>(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    let (outbox, mut outgoing) = mpsc::unbounded_channel::<Option<Vec<u8>>>();
    let id = {
        let mut state = state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.connections.insert(id, (BTreeSet::new(), outbox.clone()));
        id
    };

    let writer = tokio::spawn(async move {
        while let Some(item) = outgoing.recv().await {
            match item {
                Some(bytes) => {
                    if sink.send(WsMessage::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    let mut decoder = FrameDecoder::new();
    'socket: while let Some(Ok(message)) = source.next().await {
        let WsMessage::Binary(data) = message else {
            continue;
        };
        decoder.push(&data);

        while let Ok(Some(frame)) = decoder.next_frame() {
            let Ok(packet) = Packet::from_frame(&frame) else {
                break 'socket;
            };
            if !handle_packet(id, packet, &outbox, &state) {
                break 'socket;
            }
        }
    }

    state.lock().connections.remove(&id);
    writer.abort();
}

/// Returns false when the client disconnected
fn handle_packet(
    id: u64,
    packet: Packet,
    outbox: &Outbox,
    state: &Arc<Mutex<BrokerState>>,
) -> bool {
    let mut state = state.lock();
    state.received.push((id, packet.clone()));

    let reply = |packet: Packet| {
        if let Ok(bytes) = packet.to_bytes() {
            let _ = outbox.send(Some(bytes));
        }
    };

    match packet {
        Packet::Connect(_) => reply(Packet::ConnAck {
            session_present: false,
            return_code: CONNACK_ACCEPTED,
        }),
        Packet::Subscribe { packet_id, topics } => {
            if let Some((subscriptions, _)) = state.connections.get_mut(&id) {
                subscriptions.extend(topics.iter().map(|(topic, _)| topic.clone()));
            }
            reply(Packet::SubAck {
                packet_id,
                return_codes: vec![0; topics.len()],
            });
        }
        Packet::Unsubscribe { packet_id, topics } => {
            if let Some((subscriptions, _)) = state.connections.get_mut(&id) {
                for topic in &topics {
                    subscriptions.remove(topic);
                }
            }
            reply(Packet::UnsubAck { packet_id });
        }
        Packet::Publish(publish) => {
            if let Some(packet_id) = publish.packet_id {
                reply(Packet::PubAck { packet_id });
            }
            let forwarded = Packet::Publish(Publish::new(publish.topic.clone(), publish.payload));
            if let Ok(bytes) = forwarded.to_bytes() {
                for (subscriptions, target) in state.connections.values() {
                    if subscriptions.contains(&publish.topic) {
                        let _ = target.send(Some(bytes.clone()));
                    }
                }
            }
        }
        Packet::PingReq if !state.ignore_pings => reply(Packet::PingResp),
        Packet::Disconnect => return false,
        _ => {}
    }
    true
}

/// Peer transport that negotiates placeholder descriptions and carries
/// no media
pub struct NullTransport;

#[async_trait]
impl PeerTransport for NullTransport {
    async fn create_local_description(
        &mut self,
        kind: DescriptionKind,
        _ice_restart: bool,
    ) -> Result<SessionDescription, MediaError> {
        Ok(match kind {
            DescriptionKind::Offer => SessionDescription::offer("v=0 offer"),
            DescriptionKind::Answer => SessionDescription::answer("v=0 answer"),
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
        Ok(PeerStats::default())
    }

    async fn close(&mut self) {}
}

pub struct NullMedia;

impl MediaTransportFactory for NullMedia {
    fn create(&self, _peer_id: &PeerId, _events: MediaEventSender) -> Box<dyn PeerTransport> {
        Box::new(NullTransport)
    }
}

/// Router that records every routing change
#[derive(Default)]
pub struct RecordingRouter {
    pub device_ready: bool,
    pub routes: Mutex<Vec<RoutingMode>>,
}

impl AudioRouter for RecordingRouter {
    fn virtual_device_ready(&self) -> bool {
        self.device_ready
    }

    fn set_routing(&self, mode: &RoutingMode) {
        self.routes.lock().push(mode.clone());
    }
}

pub struct InstantInstaller(pub InstallState);

#[async_trait]
impl VirtualDeviceInstaller for InstantInstaller {
    async fn install_virtual_audio_driver(
        &self,
        _provider: &str,
        _correlation_id: &str,
    ) -> InstallOutcome {
        InstallOutcome::new(self.0)
    }
}

/// Configuration pointing at `broker` with fast reconnects
pub fn test_config(broker: &StubBroker) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.broker.url = broker.url.clone();
    config.broker.reconnect_initial_ms = 50;
    config.broker.reconnect_max_ms = 200;
    config.broker.reconnect_jitter = false;
    config
}

pub fn start_client(config: MeshConfig, clock: Arc<dyn Clock>) -> MeshClient {
    MeshClient::start(
        config,
        Collaborators {
            media: Arc::new(NullMedia),
            router: Arc::new(RecordingRouter {
                device_ready: true,
                ..Default::default()
            }),
            installer: Arc::new(InstantInstaller(InstallState::Installed)),
            clock,
            probe: None,
        },
    )
}

pub fn start_system_client(broker: &StubBroker) -> MeshClient {
    start_client(test_config(broker), Arc::new(SystemClock))
}

/// Events recorded from a client
pub struct EventLog {
    events: Arc<Mutex<Vec<ClientEvent>>>,
    _subscription: Subscription,
}

impl EventLog {
    pub fn attach(client: &MeshClient) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscription = client.on(move |event| sink.lock().push(event.clone()));
        Self {
            events,
            _subscription: subscription,
        }
    }

    pub fn snapshot(&self) -> Vec<ClientEvent> {
        self.events.lock().clone()
    }

    /// Wait until an event matching `predicate` was recorded
    pub async fn wait_for<F>(&self, what: &str, predicate: F) -> ClientEvent
    where
        F: Fn(&ClientEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(event) = self.events.lock().iter().find(|e| predicate(e)) {
                return event.clone();
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("Timed out waiting for {}: {:?}", what, self.snapshot());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub fn qos_of(packet: &Packet) -> Option<QoS> {
    match packet {
        Packet::Publish(publish) => Some(publish.qos),
        _ => None,
    }
}
