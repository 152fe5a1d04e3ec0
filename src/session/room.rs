//! Room presence and the mesh of peer sessions
//!
//! [`RoomCoordinator`] owns every [`PeerSession`] of the joined room in an
//! id-indexed map. It reacts to presence envelopes (announce, leave,
//! mute-status, chat, signal), runs presence timeouts, and queues the
//! messages to publish and the events to report. Publishing is left to the
//! caller: drain [`RoomCoordinator::poll_outgoing`] and
//! [`RoomCoordinator::poll_event`] after every call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{NegotiationConfig, PresenceConfig};
use crate::media::{
    IceCandidate, MediaEvent, MediaEventSender, MediaTransportFactory, PeerConnectionState,
    PeerMediaEvent, PeerStats, RemoteTrack, SessionDescription, TrackKind,
};
use crate::protocol::{Envelope, Message, PeerId, SignalKind};

use super::error::{NegotiationError, ValidationError, MAX_CHAT_LENGTH};
use super::negotiation::{NegotiationEngine, NegotiationState};

const MIN_ROOM_ID_LEN: usize = 4;
const MAX_ROOM_ID_LEN: usize = 64;

/// Check a room id: 4-64 characters of `[A-Za-z0-9_-]`
pub fn validate_room_id(room_id: &str) -> Result<(), ValidationError> {
    let valid_len = (MIN_ROOM_ID_LEN..=MAX_ROOM_ID_LEN).contains(&room_id.len());
    let valid_chars = room_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid_len && valid_chars {
        Ok(())
    } else {
        Err(ValidationError::InvalidRoomId(room_id.to_string()))
    }
}

/// Check a chat message before it is broadcast
pub fn validate_chat_message(text: &str) -> Result<(), ValidationError> {
    let len = text.chars().count();
    if text.trim().is_empty() {
        Err(ValidationError::EmptyMessage)
    } else if len > MAX_CHAT_LENGTH {
        Err(ValidationError::MessageTooLong {
            len,
            max: MAX_CHAT_LENGTH,
        })
    } else {
        Ok(())
    }
}

/// Identity of the local participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeer {
    pub id: PeerId,
    pub display_name: String,
    pub platform: String,
}

/// Microphone / camera state broadcast to the room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MuteState {
    pub muted: bool,
    pub video_enabled: bool,
}

/// What the room knows about one member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub display_name: String,
    pub platform: String,
    pub mute_state: MuteState,
}

/// Who is in the joined room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPresence {
    pub room_id: String,
    pub local_peer_id: PeerId,
    pub members: HashMap<PeerId, MemberInfo>,
}

/// Room connection state shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Idle,
    /// In a room with nobody else
    Searching,
    /// At least one peer present
    Connected,
}

/// Why a peer left the room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// The peer sent `leave`
    Left,
    /// Not heard from within the presence timeout
    TimedOut,
    /// We left the room ourselves
    RoomClosed,
}

/// Something the UI should know about
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    StateChanged(RoomState),
    PeerJoined {
        peer_id: PeerId,
        display_name: String,
        platform: String,
    },
    PeerLeft {
        peer_id: PeerId,
        reason: LeaveReason,
    },
    PeerMuteChanged {
        peer_id: PeerId,
        mute_state: MuteState,
    },
    PeerConnectionChanged {
        peer_id: PeerId,
        state: NegotiationState,
    },
    RemoteTrack {
        peer_id: PeerId,
        track: RemoteTrack,
    },
    ChatMessage {
        peer_id: PeerId,
        display_name: String,
        text: String,
        ts: i64,
    },
}

/// One remote participant and its negotiation
pub struct PeerSession {
    pub peer_id: PeerId,
    pub display_name: String,
    pub platform: String,
    pub last_seen: Instant,
    engine: NegotiationEngine,
}

impl PeerSession {
    pub fn is_initiator(&self) -> bool {
        self.engine.is_initiator()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.engine.state()
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.engine.connection_state()
    }

    pub fn engine(&self) -> &NegotiationEngine {
        &self.engine
    }
}

struct ActiveRoom {
    presence: RoomPresence,
    sessions: HashMap<PeerId, PeerSession>,
    state: RoomState,
    next_announce: Instant,
}

/// Coordinates presence and negotiations for one room at a time
pub struct RoomCoordinator {
    local: LocalPeer,
    announce_interval: Duration,
    peer_timeout: Duration,
    negotiation: NegotiationConfig,
    media: Arc<dyn MediaTransportFactory>,
    media_events: MediaEventSender,
    room: Option<ActiveRoom>,
    mute: MuteState,
    outgoing: VecDeque<Message>,
    events: VecDeque<RoomEvent>,
}

impl RoomCoordinator {
    pub fn new(
        local: LocalPeer,
        presence: &PresenceConfig,
        negotiation: &NegotiationConfig,
        media: Arc<dyn MediaTransportFactory>,
        media_events: MediaEventSender,
    ) -> Self {
        Self {
            local,
            announce_interval: presence.announce_interval(),
            peer_timeout: presence.peer_timeout(),
            negotiation: negotiation.clone(),
            media,
            media_events,
            room: None,
            mute: MuteState::default(),
            outgoing: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn local(&self) -> &LocalPeer {
        &self.local
    }

    pub fn set_display_name(&mut self, display_name: impl Into<String>) {
        self.local.display_name = display_name.into();
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room.as_ref().map(|room| room.presence.room_id.as_str())
    }

    pub fn in_room(&self) -> bool {
        self.room.is_some()
    }

    pub fn room_state(&self) -> RoomState {
        self.room.as_ref().map_or(RoomState::Idle, |room| room.state)
    }

    pub fn presence(&self) -> Option<&RoomPresence> {
        self.room.as_ref().map(|room| &room.presence)
    }

    pub fn is_member(&self, peer_id: &PeerId) -> bool {
        self.room
            .as_ref()
            .is_some_and(|room| room.sessions.contains_key(peer_id))
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.room
            .as_ref()
            .map(|room| room.sessions.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn session(&self, peer_id: &PeerId) -> Option<&PeerSession> {
        self.room.as_ref()?.sessions.get(peer_id)
    }

    pub fn mute_state(&self) -> MuteState {
        self.mute
    }

    /// Enter `room_id` and announce ourselves
    pub fn join(&mut self, room_id: &str, now: Instant) -> Result<(), ValidationError> {
        validate_room_id(room_id)?;
        if self.room_id() == Some(room_id) {
            return Ok(());
        }

        info!("Joining room {} as {}", room_id, self.local.id);
        self.room = Some(ActiveRoom {
            presence: RoomPresence {
                room_id: room_id.to_string(),
                local_peer_id: self.local.id.clone(),
                members: HashMap::new(),
            },
            sessions: HashMap::new(),
            state: RoomState::Searching,
            next_announce: now + self.announce_interval,
        });
        self.outgoing.push_back(self.announce());
        self.events
            .push_back(RoomEvent::StateChanged(RoomState::Searching));
        Ok(())
    }

    /// Leave the room, closing every peer session
    pub async fn leave(&mut self) {
        let Some(mut room) = self.room.take() else {
            return;
        };
        info!("Leaving room {}", room.presence.room_id);

        self.outgoing.push_back(Message::Leave);
        for (peer_id, mut session) in room.sessions.drain() {
            session.engine.close().await;
            self.events.push_back(RoomEvent::PeerLeft {
                peer_id,
                reason: LeaveReason::RoomClosed,
            });
        }
        self.events.push_back(RoomEvent::StateChanged(RoomState::Idle));
    }

    /// Announce again, e.g. after the broker connection came back
    pub fn reannounce(&mut self, now: Instant) {
        if let Some(room) = self.room.as_mut() {
            room.next_announce = now + self.announce_interval;
            self.outgoing.push_back(self.announce());
        }
    }

    /// Refresh presence for any envelope from a known peer
    pub fn touch(&mut self, peer_id: &PeerId, now: Instant) {
        if let Some(session) = self
            .room
            .as_mut()
            .and_then(|room| room.sessions.get_mut(peer_id))
        {
            session.last_seen = now;
        }
    }

    /// Handle a room envelope (announce, leave, signal, mute-status, chat)
    pub async fn handle_envelope(&mut self, envelope: Envelope, now: Instant) {
        if self.room.is_none() {
            debug!("Ignoring {} outside of a room", envelope.message.kind());
            return;
        }
        let sender = envelope.sender_id;

        match envelope.message {
            Message::Announce {
                display_name,
                platform,
            } => self.on_announce(sender, display_name, platform, now).await,
            Message::Leave => {
                if self.is_member(&sender) {
                    info!("Peer {} left", sender);
                    self.remove_peer(&sender, LeaveReason::Left).await;
                }
            }
            Message::Signal {
                kind,
                sdp,
                candidate,
                sdp_mid,
                sdp_m_line_index,
                restart,
                ..
            } => {
                let signal = match (kind, sdp, candidate) {
                    (SignalKind::Offer, Some(sdp), _) => {
                        Signal::Offer(SessionDescription::offer(sdp), restart)
                    }
                    (SignalKind::Answer, Some(sdp), _) => {
                        Signal::Answer(SessionDescription::answer(sdp))
                    }
                    (SignalKind::Candidate, _, Some(candidate)) => {
                        Signal::Candidate(IceCandidate {
                            candidate,
                            sdp_mid,
                            sdp_m_line_index,
                        })
                    }
                    (kind, _, _) => {
                        warn!("Dropping {:?} signal from {} without payload", kind, sender);
                        return;
                    }
                };
                self.on_signal(&sender, signal, now).await;
            }
            Message::MuteStatus {
                muted,
                video_enabled,
            } => {
                let mute_state = MuteState {
                    muted,
                    video_enabled,
                };
                self.on_mute_status(sender, mute_state);
            }
            Message::Chat { text, ts } => {
                let display_name = self
                    .presence()
                    .and_then(|presence| presence.members.get(&sender))
                    .map(|member| member.display_name.clone())
                    .unwrap_or_default();
                self.events.push_back(RoomEvent::ChatMessage {
                    peer_id: sender,
                    display_name,
                    text,
                    ts,
                });
            }
            other => debug!("Room coordinator ignoring {}", other.kind()),
        }
    }

    /// Handle a notification from a peer's media transport
    pub async fn handle_media_event(&mut self, event: PeerMediaEvent, now: Instant) {
        let PeerMediaEvent { peer_id, event } = event;
        let Some(session) = self
            .room
            .as_mut()
            .and_then(|room| room.sessions.get_mut(&peer_id))
        else {
            debug!("Media event for unknown peer {}", peer_id);
            return;
        };

        let before = session.engine.state();
        let result = match event {
            MediaEvent::LocalCandidate(candidate) => {
                Ok(vec![session.engine.local_candidate(candidate)])
            }
            MediaEvent::ConnectionState(state) => {
                session.engine.on_connection_state(state, now).await
            }
            MediaEvent::NegotiationNeeded => session.engine.renegotiate(now).await,
            MediaEvent::Track(track) => {
                self.events.push_back(RoomEvent::RemoteTrack {
                    peer_id: peer_id.clone(),
                    track,
                });
                Ok(Vec::new())
            }
        };
        self.finish_negotiation(&peer_id, before, result);
    }

    /// Broadcast a new local mute state
    pub fn set_muted(&mut self, muted: bool) {
        self.mute.muted = muted;
        self.broadcast_mute_state();
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.mute.video_enabled = enabled;
        self.broadcast_mute_state();
    }

    /// Validate and broadcast a chat message
    pub fn send_chat(&mut self, text: &str, ts: i64) -> Result<(), ValidationError> {
        if !self.in_room() {
            return Err(ValidationError::NotInRoom);
        }
        validate_chat_message(text)?;
        self.outgoing.push_back(Message::Chat {
            text: text.to_string(),
            ts,
        });
        Ok(())
    }

    /// Switch an outgoing track on every peer connection
    pub async fn replace_track(&mut self, kind: TrackKind, source: Option<&str>, now: Instant) {
        for peer_id in self.peer_ids() {
            let Some(session) = self
                .room
                .as_mut()
                .and_then(|room| room.sessions.get_mut(&peer_id))
            else {
                continue;
            };
            let before = session.engine.state();
            let result = session.engine.replace_track(kind, source, now).await;
            self.finish_negotiation(&peer_id, before, result);
        }
    }

    /// Re-announce, expire silent peers and negotiation deadlines
    pub async fn tick(&mut self, now: Instant) {
        let Some(room) = self.room.as_mut() else {
            return;
        };

        if now >= room.next_announce {
            room.next_announce = now + self.announce_interval;
            self.outgoing.push_back(self.announce());
        }

        let Some(room) = self.room.as_mut() else {
            return;
        };
        let mut timed_out = Vec::new();
        let mut live = Vec::new();
        for (peer_id, session) in room.sessions.iter() {
            if now.saturating_duration_since(session.last_seen) >= self.peer_timeout {
                timed_out.push(peer_id.clone());
            } else {
                live.push(peer_id.clone());
            }
        }

        for peer_id in live {
            let Some(session) = self
                .room
                .as_mut()
                .and_then(|room| room.sessions.get_mut(&peer_id))
            else {
                continue;
            };
            let before = session.engine.state();
            let result = session.engine.tick(now).await;
            self.finish_negotiation(&peer_id, before, result);
        }
        for peer_id in timed_out {
            warn!("Peer {} timed out", peer_id);
            self.remove_peer(&peer_id, LeaveReason::TimedOut).await;
        }
    }

    /// Current transport stats of every peer
    pub async fn collect_stats(&mut self) -> Vec<(PeerId, PeerStats, PeerConnectionState)> {
        let mut collected = Vec::new();
        if let Some(room) = self.room.as_mut() {
            for (peer_id, session) in room.sessions.iter_mut() {
                if let Some(stats) = session.engine.stats().await {
                    collected.push((peer_id.clone(), stats, session.engine.connection_state()));
                }
            }
        }
        collected
    }

    pub fn poll_outgoing(&mut self) -> Option<Message> {
        self.outgoing.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<RoomEvent> {
        self.events.pop_front()
    }

    async fn on_announce(
        &mut self,
        sender: PeerId,
        display_name: String,
        platform: String,
        now: Instant,
    ) {
        let Some(room) = self.room.as_mut() else {
            return;
        };

        if let Some(session) = room.sessions.get_mut(&sender) {
            session.last_seen = now;
            if session.display_name != display_name {
                debug!("Peer {} renamed to {}", sender, display_name);
                session.display_name = display_name.clone();
                if let Some(member) = room.presence.members.get_mut(&sender) {
                    member.display_name = display_name;
                }
            }
            return;
        }

        let is_initiator = sender > self.local.id;
        info!(
            "Peer {} ({}) joined room {}, initiator: {}",
            sender, display_name, room.presence.room_id, is_initiator
        );

        let transport = self.media.create(&sender, self.media_events.clone());
        let engine = NegotiationEngine::new(
            sender.clone(),
            is_initiator,
            transport,
            &self.negotiation,
        );
        room.sessions.insert(
            sender.clone(),
            PeerSession {
                peer_id: sender.clone(),
                display_name: display_name.clone(),
                platform: platform.clone(),
                last_seen: now,
                engine,
            },
        );
        room.presence.members.insert(
            sender.clone(),
            MemberInfo {
                display_name: display_name.clone(),
                platform: platform.clone(),
                mute_state: MuteState::default(),
            },
        );
        let was_searching = room.state == RoomState::Searching;
        room.state = RoomState::Connected;

        // The newcomer learns about us before our offer reaches it
        self.outgoing.push_back(self.announce());
        if self.mute != MuteState::default() {
            self.broadcast_mute_state();
        }

        self.events.push_back(RoomEvent::PeerJoined {
            peer_id: sender.clone(),
            display_name,
            platform,
        });
        if was_searching {
            self.events
                .push_back(RoomEvent::StateChanged(RoomState::Connected));
        }

        if is_initiator {
            if let Some(session) = self
                .room
                .as_mut()
                .and_then(|room| room.sessions.get_mut(&sender))
            {
                let before = session.engine.state();
                let result = session.engine.create_offer(now).await;
                self.finish_negotiation(&sender, before, result);
            }
        }
    }

    async fn on_signal(&mut self, sender: &PeerId, signal: Signal, now: Instant) {
        let Some(session) = self
            .room
            .as_mut()
            .and_then(|room| room.sessions.get_mut(sender))
        else {
            debug!("Signal from unknown peer {}", sender);
            return;
        };

        let before = session.engine.state();
        let result = match signal {
            Signal::Offer(description, restart) => {
                session.engine.handle_offer(description, restart, now).await
            }
            Signal::Answer(description) => session.engine.handle_answer(description).await,
            Signal::Candidate(candidate) => session
                .engine
                .handle_candidate(candidate)
                .await
                .map(|()| Vec::new()),
        };
        self.finish_negotiation(sender, before, result);
    }

    fn on_mute_status(&mut self, sender: PeerId, mute_state: MuteState) {
        let Some(member) = self
            .room
            .as_mut()
            .and_then(|room| room.presence.members.get_mut(&sender))
        else {
            return;
        };
        if member.mute_state != mute_state {
            member.mute_state = mute_state;
            self.events.push_back(RoomEvent::PeerMuteChanged {
                peer_id: sender,
                mute_state,
            });
        }
    }

    /// Queue produced signals and report negotiation state changes
    fn finish_negotiation(
        &mut self,
        peer_id: &PeerId,
        before: NegotiationState,
        result: Result<Vec<Message>, NegotiationError>,
    ) {
        match result {
            Ok(signals) => self.outgoing.extend(signals),
            Err(NegotiationError::Protocol(e)) => debug!("Ignoring signal from {}: {}", peer_id, e),
            Err(NegotiationError::Media(e)) => warn!("Media error with {}: {}", peer_id, e),
        }

        let after = self
            .session(peer_id)
            .map_or(NegotiationState::Closed, PeerSession::negotiation_state);
        if after != before {
            self.events.push_back(RoomEvent::PeerConnectionChanged {
                peer_id: peer_id.clone(),
                state: after,
            });
        }
    }

    async fn remove_peer(&mut self, peer_id: &PeerId, reason: LeaveReason) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        let Some(mut session) = room.sessions.remove(peer_id) else {
            return;
        };
        room.presence.members.remove(peer_id);
        let now_empty = room.sessions.is_empty();
        if now_empty {
            room.state = RoomState::Searching;
        }

        session.engine.close().await;
        self.events.push_back(RoomEvent::PeerLeft {
            peer_id: peer_id.clone(),
            reason,
        });
        if now_empty {
            self.events
                .push_back(RoomEvent::StateChanged(RoomState::Searching));
        }
    }

    fn broadcast_mute_state(&mut self) {
        if self.in_room() {
            self.outgoing.push_back(Message::MuteStatus {
                muted: self.mute.muted,
                video_enabled: self.mute.video_enabled,
            });
        }
    }

    fn announce(&self) -> Message {
        Message::Announce {
            display_name: self.local.display_name.clone(),
            platform: self.local.platform.clone(),
        }
    }
}

enum Signal {
    Offer(SessionDescription, bool),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}
