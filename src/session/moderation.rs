//! Room moderation: lock, mute-all, raised hands
//!
//! Everything here is advisory and peer-to-peer: the lock owner turns away
//! newcomers, a mute-all request asks every member to mute themselves, and
//! raised hands form a queue ordered by the time they were raised.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::{Message, PeerId};

use super::error::ModerationError;

/// A mute-all request waiting for the local decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteAllRequest {
    pub request_id: String,
    pub requested_by_peer_id: PeerId,
    pub requested_by_name: String,
}

/// Moderation view of the room
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModerationState {
    pub room_locked: bool,
    pub room_lock_owner: Option<PeerId>,
    /// Raised hands and when they were raised (ms since epoch)
    pub raised_hands: HashMap<PeerId, i64>,
    pub local_hand_raised: bool,
    pub pending_mute_all_request: Option<MuteAllRequest>,
}

impl ModerationState {
    /// Raised hands, earliest first
    pub fn hand_queue(&self) -> Vec<(PeerId, i64)> {
        let mut queue: Vec<(PeerId, i64)> = self
            .raised_hands
            .iter()
            .map(|(peer, ts)| (peer.clone(), *ts))
            .collect();
        queue.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        queue
    }
}

/// Reported to the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationEvent {
    RoomLockChanged {
        locked: bool,
        owner: Option<PeerId>,
    },
    /// The room turned us away
    RoomLocked,
    MuteAllRequested(MuteAllRequest),
    MuteAllResponse {
        request_id: String,
        peer_id: PeerId,
        accepted: bool,
    },
    /// We accepted a mute-all request; the microphone must be muted
    LocalMuteRequested,
    HandQueueChanged(Vec<(PeerId, i64)>),
}

/// Moderation protocol for one client
pub struct ModerationProtocol {
    local_id: PeerId,
    local_name: String,
    state: ModerationState,
    /// Mute-all requests we sent, for matching responses
    sent_requests: HashSet<String>,
    outgoing: VecDeque<Message>,
    events: VecDeque<ModerationEvent>,
}

impl ModerationProtocol {
    pub fn new(local_id: PeerId, local_name: impl Into<String>) -> Self {
        Self {
            local_id,
            local_name: local_name.into(),
            state: ModerationState::default(),
            sent_requests: HashSet::new(),
            outgoing: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &ModerationState {
        &self.state
    }

    pub fn set_local_name(&mut self, name: impl Into<String>) {
        self.local_name = name.into();
    }

    pub fn poll_outgoing(&mut self) -> Option<Message> {
        self.outgoing.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<ModerationEvent> {
        self.events.pop_front()
    }

    /// Whether an unseen peer may join the room
    pub fn admits(&self) -> bool {
        !self.state.room_locked
    }

    /// An unseen peer announced while the room is locked
    pub fn on_unadmitted_announce(&mut self, peer_id: &PeerId) {
        if self.state.room_lock_owner.as_ref() == Some(&self.local_id) {
            info!("Room is locked, turning away {}", peer_id);
            self.outgoing.push_back(Message::RoomLockedNotice {
                to: peer_id.clone(),
            });
        } else {
            debug!("Room is locked, ignoring announce from {}", peer_id);
        }
    }

    /// Lock or unlock the room
    pub fn set_room_locked(&mut self, locked: bool) -> Result<(), ModerationError> {
        if let Some(owner) = &self.state.room_lock_owner {
            if self.state.room_locked && *owner != self.local_id {
                return Err(ModerationError::LockedByOther);
            }
        }

        let owner = locked.then(|| self.local_id.clone());
        info!("Room {}", if locked { "locked" } else { "unlocked" });
        self.outgoing.push_back(Message::RoomLock {
            locked,
            locked_by_peer_id: owner.clone(),
        });
        self.apply_lock(locked, owner);
        Ok(())
    }

    /// Ask everyone to mute; returns the request id
    pub fn request_mute_all(&mut self) -> String {
        let request_id = Uuid::new_v4().to_string();
        info!("Requesting mute-all ({})", request_id);
        self.sent_requests.insert(request_id.clone());
        self.outgoing.push_back(Message::MuteAllRequest {
            request_id: request_id.clone(),
            requested_by_peer_id: self.local_id.clone(),
            requested_by_name: self.local_name.clone(),
        });
        request_id
    }

    /// Answer the pending mute-all request
    pub fn respond_mute_all(&mut self, accept: bool) -> Result<(), ModerationError> {
        let request = self
            .state
            .pending_mute_all_request
            .take()
            .ok_or(ModerationError::NoPendingRequest)?;

        self.outgoing.push_back(Message::MuteAllResponse {
            request_id: request.request_id,
            accepted: accept,
        });
        if accept {
            self.events.push_back(ModerationEvent::LocalMuteRequested);
        }
        Ok(())
    }

    /// Raise or lower the local hand
    pub fn set_hand_raised(&mut self, raised: bool, ts: i64) {
        self.state.local_hand_raised = raised;
        self.outgoing.push_back(Message::HandRaise {
            peer_id: self.local_id.clone(),
            raised,
            ts,
        });
        self.update_hand(self.local_id.clone(), raised, ts);
    }

    /// Handle a `mod_*` message
    ///
    /// Lock state and lock notices are taken from anyone on the topic; hand
    /// raises and mute-all traffic only from room members.
    pub fn handle_message(&mut self, from: &PeerId, is_member: bool, message: &Message) {
        let members_only = matches!(
            message,
            Message::HandRaise { .. }
                | Message::MuteAllRequest { .. }
                | Message::MuteAllResponse { .. }
        );
        if members_only && !is_member {
            debug!("Ignoring {} from non-member {}", message.kind(), from);
            return;
        }

        match message {
            Message::RoomLock {
                locked,
                locked_by_peer_id,
            } => {
                info!("Room lock set to {} by {}", locked, from);
                let owner = locked_by_peer_id.clone().or_else(|| locked.then(|| from.clone()));
                self.apply_lock(*locked, owner);
            }
            Message::RoomLockedNotice { .. } => {
                info!("Room is locked by {}", from);
                self.events.push_back(ModerationEvent::RoomLocked);
            }
            Message::MuteAllRequest {
                request_id,
                requested_by_peer_id,
                requested_by_name,
            } => {
                let request = MuteAllRequest {
                    request_id: request_id.clone(),
                    requested_by_peer_id: requested_by_peer_id.clone(),
                    requested_by_name: requested_by_name.clone(),
                };
                self.state.pending_mute_all_request = Some(request.clone());
                self.events.push_back(ModerationEvent::MuteAllRequested(request));
            }
            Message::MuteAllResponse {
                request_id,
                accepted,
            } => {
                if self.sent_requests.contains(request_id) {
                    self.events.push_back(ModerationEvent::MuteAllResponse {
                        request_id: request_id.clone(),
                        peer_id: from.clone(),
                        accepted: *accepted,
                    });
                }
            }
            Message::HandRaise {
                peer_id,
                raised,
                ts,
            } => {
                if peer_id != from {
                    debug!("Ignoring hand raise for {} sent by {}", peer_id, from);
                    return;
                }
                self.update_hand(peer_id.clone(), *raised, *ts);
            }
            other => debug!("Moderation ignoring {}", other.kind()),
        }
    }

    /// Presence changed: prune hands and release a departed owner's lock
    pub fn on_presence_changed<'a>(&mut self, present: impl IntoIterator<Item = &'a PeerId>) {
        let mut present: HashSet<&PeerId> = present.into_iter().collect();
        present.insert(&self.local_id);

        let before = self.state.raised_hands.len();
        self.state
            .raised_hands
            .retain(|peer_id, _| present.contains(peer_id));
        let hands_changed = self.state.raised_hands.len() != before;

        let owner_left = self
            .state
            .room_lock_owner
            .as_ref()
            .is_some_and(|owner| !present.contains(owner));

        if hands_changed {
            self.events
                .push_back(ModerationEvent::HandQueueChanged(self.state.hand_queue()));
        }
        if owner_left {
            info!("Lock owner left, unlocking room");
            self.apply_lock(false, None);
        }
    }

    /// A new member joined: tell them about our raised hand
    pub fn on_peer_joined(&mut self, _peer_id: &PeerId) {
        if self.state.local_hand_raised {
            if let Some(ts) = self.state.raised_hands.get(&self.local_id) {
                self.outgoing.push_back(Message::HandRaise {
                    peer_id: self.local_id.clone(),
                    raised: true,
                    ts: *ts,
                });
            }
        }
    }

    /// Forget everything (room left)
    pub fn reset(&mut self) {
        self.state = ModerationState::default();
        self.sent_requests.clear();
    }

    fn apply_lock(&mut self, locked: bool, owner: Option<PeerId>) {
        let owner = if locked { owner } else { None };
        if self.state.room_locked == locked && self.state.room_lock_owner == owner {
            return;
        }
        self.state.room_locked = locked;
        self.state.room_lock_owner = owner.clone();
        self.events
            .push_back(ModerationEvent::RoomLockChanged { locked, owner });
    }

    fn update_hand(&mut self, peer_id: PeerId, raised: bool, ts: i64) {
        let changed = if raised {
            self.state.raised_hands.insert(peer_id, ts) != Some(ts)
        } else {
            self.state.raised_hands.remove(&peer_id).is_some()
        };
        if changed {
            self.events
                .push_back(ModerationEvent::HandQueueChanged(self.state.hand_queue()));
        }
    }
}
