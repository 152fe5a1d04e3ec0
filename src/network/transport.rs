//! Broker transport over a WebSocket
//!
//! [`FrameTransport`] owns one logical connection to the publish/subscribe
//! broker. A background task runs the socket: it completes the CONNECT /
//! CONNACK handshake, feeds every received chunk through a
//! [`FrameDecoder`], sends PINGREQ on a fixed interval, and rebuilds the
//! connection with capped exponential backoff when it drops. Subscriptions
//! and unacknowledged QoS 1 publishes survive reconnects.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::protocol::{
    ConnectOptions, FrameDecoder, Packet, Publish, QoS, CONNACK_ACCEPTED, SUBACK_FAILURE,
};

use super::backoff::ReconnectionPolicy;
use super::error::TransportError;

/// Capacity of the inbound event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Settings for one broker connection
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// ws:// or wss:// URL
    pub url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub max_missed_pings: u32,
    pub reconnect: ReconnectionPolicy,
}

impl TransportOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self::from(&BrokerConfig {
            url: url.into(),
            ..Default::default()
        })
    }

    fn connect_packet(&self) -> Packet {
        Packet::Connect(ConnectOptions {
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive_secs: self.keepalive_interval.as_secs().min(u16::MAX as u64) as u16,
            clean_session: true,
        })
    }
}

impl From<&BrokerConfig> for TransportOptions {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            url: config.url.clone(),
            client_id: generate_client_id(),
            username: config.username.clone(),
            password: config.password.clone(),
            connect_timeout: config.connect_timeout(),
            keepalive_interval: config.keepalive_interval(),
            max_missed_pings: config.max_missed_pings,
            reconnect: ReconnectionPolicy::from(config),
        }
    }
}

/// Client id with a random suffix
pub fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("meshcall_{}", &id[..12])
}

/// State of the underlying link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Reconnecting,
    Closed,
}

/// Something that happened on the broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake completed after a reconnect
    Connected,
    /// The link dropped; a reconnect is about to be scheduled
    Disconnected { reason: String },
    /// Waiting `delay` before attempt number `attempt`
    Reconnecting { attempt: u32, delay: Duration },
    /// A PUBLISH arrived on a subscribed topic
    Message { topic: String, payload: Bytes },
}

enum Command {
    Publish(Publish),
    Subscribe(String),
    Unsubscribe(String),
    ReconnectNow,
    Disconnect(oneshot::Sender<()>),
}

/// Handle to the broker connection
///
/// Dropping the handle stops the background task.
pub struct FrameTransport {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
}

impl FrameTransport {
    /// Open the connection and complete the handshake
    ///
    /// Fails with [`TransportError::ConnectTimeout`] when no CONNACK arrives
    /// within `options.connect_timeout`.
    pub async fn connect(
        options: TransportOptions,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let link = open_link(&options).await?;
        info!("Connected to broker {} as {}", options.url, options.client_id);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LinkState::Connected);

        let session = LinkSession {
            options,
            subscriptions: BTreeSet::new(),
            inflight: BTreeMap::new(),
            next_packet_id: 0,
            outstanding_pings: 0,
            events: event_tx,
            state: state_tx,
        };
        tokio::spawn(session.run(link, command_rx));

        Ok((
            Self {
                commands: command_tx,
                state: state_rx,
            },
            event_rx,
        ))
    }

    /// Publish `payload` on `topic`
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<(), TransportError> {
        let mut publish = Publish::new(topic, payload);
        publish.qos = qos;
        self.send(Command::Publish(publish))
    }

    /// Subscribe to `topic`; kept across reconnects
    pub fn subscribe(&self, topic: impl Into<String>) -> Result<(), TransportError> {
        self.send(Command::Subscribe(topic.into()))
    }

    pub fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), TransportError> {
        self.send(Command::Unsubscribe(topic.into()))
    }

    /// Drop the current socket (if any) and reconnect without waiting out
    /// the backoff delay
    pub fn reconnect_now(&self) -> Result<(), TransportError> {
        self.send(Command::ReconnectNow)
    }

    /// Send DISCONNECT and stop the background task
    pub async fn disconnect(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Watch the link state from elsewhere (health monitoring)
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    fn send(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Closed)
    }
}

/// One live socket plus any bytes already read from it
struct Link {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    decoder: FrameDecoder,
}

impl Link {
    async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        let bytes = packet.to_bytes()?;
        trace!("Sending {} bytes", bytes.len());
        self.sink.send(Message::Binary(bytes)).await?;
        Ok(())
    }
}

/// Open the socket and wait for CONNACK, bounded by the connect timeout
async fn open_link(options: &TransportOptions) -> Result<Link, TransportError> {
    timeout(options.connect_timeout, handshake(options))
        .await
        .map_err(|_| TransportError::ConnectTimeout(options.connect_timeout))?
}

async fn handshake(options: &TransportOptions) -> Result<Link, TransportError> {
    let mut request = options
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", options.url, e)))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));

    let (ws_stream, _) = connect_async(request).await?;
    let (sink, stream) = ws_stream.split();
    let mut link = Link {
        sink,
        stream,
        decoder: FrameDecoder::new(),
    };

    link.send(&options.connect_packet()).await?;

    loop {
        if let Some(frame) = link.decoder.next_frame()? {
            return match Packet::from_frame(&frame)? {
                Packet::ConnAck { return_code, .. } if return_code == CONNACK_ACCEPTED => Ok(link),
                Packet::ConnAck { return_code, .. } => {
                    Err(TransportError::ConnectionRefused(return_code))
                }
                other => Err(TransportError::UnexpectedPacket(format!("{:?}", other))),
            };
        }

        match link.stream.next().await {
            Some(Ok(Message::Binary(data))) => link.decoder.push(&data),
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Why a link stopped being driven
enum LinkOutcome {
    Lost(String),
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Connection state that outlives individual sockets
struct LinkSession {
    options: TransportOptions,
    subscriptions: BTreeSet<String>,
    inflight: BTreeMap<u16, Publish>,
    next_packet_id: u16,
    outstanding_pings: u32,
    events: mpsc::Sender<TransportEvent>,
    state: watch::Sender<LinkState>,
}

impl LinkSession {
    async fn run(mut self, first: Link, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut link = first;

        loop {
            let outcome = match self.resume(&mut link).await {
                Ok(()) => self.drive(&mut link, &mut commands).await,
                Err(e) => LinkOutcome::Lost(e.to_string()),
            };

            match outcome {
                LinkOutcome::Shutdown(ack) => {
                    let _ = link.send(&Packet::Disconnect).await;
                    let _ = link.sink.close().await;
                    self.state.send_replace(LinkState::Closed);
                    info!("Broker connection closed");
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
                LinkOutcome::Lost(reason) => {
                    warn!("Broker connection lost: {}", reason);
                    let _ = link.sink.close().await;
                    self.state.send_replace(LinkState::Reconnecting);
                    self.emit(TransportEvent::Disconnected { reason }).await;
                }
            }

            match self.reconnect(&mut commands).await {
                Some(next) => {
                    link = next;
                    self.state.send_replace(LinkState::Connected);
                    self.emit(TransportEvent::Connected).await;
                }
                None => {
                    self.state.send_replace(LinkState::Closed);
                    info!("Broker connection closed while reconnecting");
                    return;
                }
            }
        }
    }

    /// Restore subscriptions and in-flight publishes on a fresh link
    async fn resume(&mut self, link: &mut Link) -> Result<(), TransportError> {
        self.outstanding_pings = 0;

        if !self.subscriptions.is_empty() {
            let packet_id = self.next_packet_id();
            let topics = self
                .subscriptions
                .iter()
                .map(|topic| (topic.clone(), QoS::AtMostOnce))
                .collect::<Vec<_>>();
            debug!("Subscribing to {} topic(s)", topics.len());
            link.send(&Packet::Subscribe { packet_id, topics }).await?;
        }

        for publish in self.inflight.values_mut() {
            publish.dup = true;
        }
        let pending: Vec<Publish> = self.inflight.values().cloned().collect();
        for publish in pending {
            debug!("Retransmitting publish {:?}", publish.packet_id);
            link.send(&Packet::Publish(publish)).await?;
        }

        Ok(())
    }

    async fn drive(
        &mut self,
        link: &mut Link,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> LinkOutcome {
        // Frames that arrived in the same chunk as CONNACK
        if let Err(e) = self.drain_frames(link).await {
            return LinkOutcome::Lost(e.to_string());
        }

        let period = self.options.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = link.stream.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            trace!("Received {} bytes", data.len());
                            link.decoder.push(&data);
                            if let Err(e) = self.drain_frames(link).await {
                                if e.forces_reconnect() {
                                    warn!("Dropping connection after malformed frame");
                                }
                                return LinkOutcome::Lost(e.to_string());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return LinkOutcome::Lost("socket closed".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return LinkOutcome::Lost(e.to_string()),
                    }
                }

                command = commands.recv() => {
                    match command {
                        None => return LinkOutcome::Shutdown(None),
                        Some(Command::Disconnect(ack)) => return LinkOutcome::Shutdown(Some(ack)),
                        Some(Command::ReconnectNow) => {
                            return LinkOutcome::Lost("manual reconnect".to_string());
                        }
                        Some(command) => {
                            if let Err(e) = self.apply(command, Some(&mut *link)).await {
                                return LinkOutcome::Lost(e.to_string());
                            }
                        }
                    }
                }

                _ = keepalive.tick() => {
                    if self.outstanding_pings >= self.options.max_missed_pings {
                        return LinkOutcome::Lost(
                            TransportError::KeepaliveTimeout(self.outstanding_pings).to_string(),
                        );
                    }
                    if let Err(e) = link.send(&Packet::PingReq).await {
                        return LinkOutcome::Lost(e.to_string());
                    }
                    self.outstanding_pings += 1;
                }
            }
        }
    }

    /// Wait out the backoff and reopen the link; `None` means shut down
    async fn reconnect(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Option<Link> {
        let mut attempt = 0u32;

        loop {
            let delay = self.options.reconnect.calculate_backoff(attempt);
            attempt += 1;
            info!("Reconnecting to broker in {:?} (attempt {})", delay, attempt);
            self.emit(TransportEvent::Reconnecting { attempt, delay }).await;

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = commands.recv() => {
                        match command {
                            None => return None,
                            Some(Command::Disconnect(ack)) => {
                                let _ = ack.send(());
                                return None;
                            }
                            Some(Command::ReconnectNow) => break,
                            Some(command) => {
                                // No socket: only bookkeeping happens here
                                let _ = self.apply(command, None).await;
                            }
                        }
                    }
                }
            }

            match open_link(&self.options).await {
                Ok(link) => {
                    info!("Reconnected to broker after {} attempt(s)", attempt);
                    return Some(link);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }

    /// Apply a command; with no link, only local state changes
    async fn apply(
        &mut self,
        command: Command,
        link: Option<&mut Link>,
    ) -> Result<(), TransportError> {
        match command {
            Command::Publish(mut publish) => {
                if publish.qos == QoS::AtLeastOnce {
                    let packet_id = self.next_packet_id();
                    publish.packet_id = Some(packet_id);
                    self.inflight.insert(packet_id, publish.clone());
                }
                match link {
                    Some(link) => link.send(&Packet::Publish(publish)).await?,
                    None if publish.qos == QoS::AtMostOnce => {
                        debug!("Dropping QoS 0 publish on {} while offline", publish.topic);
                    }
                    None => {}
                }
            }
            Command::Subscribe(topic) => {
                if self.subscriptions.insert(topic.clone()) {
                    if let Some(link) = link {
                        let packet_id = self.next_packet_id();
                        debug!("Subscribing to {}", topic);
                        link.send(&Packet::Subscribe {
                            packet_id,
                            topics: vec![(topic, QoS::AtMostOnce)],
                        })
                        .await?;
                    }
                }
            }
            Command::Unsubscribe(topic) => {
                if self.subscriptions.remove(&topic) {
                    if let Some(link) = link {
                        let packet_id = self.next_packet_id();
                        debug!("Unsubscribing from {}", topic);
                        link.send(&Packet::Unsubscribe {
                            packet_id,
                            topics: vec![topic],
                        })
                        .await?;
                    }
                }
            }
            Command::ReconnectNow | Command::Disconnect(_) => {}
        }
        Ok(())
    }

    /// Dispatch every complete frame in the decoder, in arrival order
    async fn drain_frames(&mut self, link: &mut Link) -> Result<(), TransportError> {
        while let Some(frame) = link.decoder.next_frame()? {
            let packet = Packet::from_frame(&frame)?;
            trace!("Received {:?}", frame.packet_type);

            match packet {
                Packet::PingResp => self.outstanding_pings = 0,
                Packet::PubAck { packet_id } => {
                    if self.inflight.remove(&packet_id).is_none() {
                        debug!("PUBACK for unknown packet id {}", packet_id);
                    }
                }
                Packet::Publish(publish) => {
                    if let (QoS::AtLeastOnce, Some(packet_id)) = (publish.qos, publish.packet_id) {
                        link.send(&Packet::PubAck { packet_id }).await?;
                    }
                    self.emit(TransportEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload,
                    })
                    .await;
                }
                Packet::SubAck { return_codes, .. } => {
                    if return_codes.contains(&SUBACK_FAILURE) {
                        warn!("Broker refused a subscription");
                    }
                }
                Packet::UnsubAck { .. } => {}
                Packet::Disconnect => return Err(TransportError::Closed),
                other => debug!("Ignoring unexpected packet {:?}", other),
            }
        }
        Ok(())
    }

    fn next_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Transport event receiver dropped");
        }
    }
}
