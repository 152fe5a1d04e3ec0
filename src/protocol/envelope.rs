//! Application envelopes carried in PUBLISH bodies
//!
//! Every envelope is a flat JSON object with a `type` discriminator and a
//! `senderId`. Envelopes meant for a single peer carry `to`; everyone else
//! ignores them.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one participant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which half of the negotiation a `signal` carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// Reason codes used by the remote-mic protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteMicReason {
    Busy,
    Declined,
    RequestTimeout,
    VirtualDeviceInstallFailed,
    InstallTimeout,
    RebootRequired,
    InstallCancelled,
    Unsupported,
    HeartbeatTimeout,
    PeerDisconnected,
    UserStopped,
    FeatureDisabled,
    RoomLeft,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for RemoteMicReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RemoteMicReason::Busy => "busy",
            RemoteMicReason::Declined => "declined",
            RemoteMicReason::RequestTimeout => "request-timeout",
            RemoteMicReason::VirtualDeviceInstallFailed => "virtual-device-install-failed",
            RemoteMicReason::InstallTimeout => "install-timeout",
            RemoteMicReason::RebootRequired => "reboot-required",
            RemoteMicReason::InstallCancelled => "install-cancelled",
            RemoteMicReason::Unsupported => "unsupported",
            RemoteMicReason::HeartbeatTimeout => "heartbeat-timeout",
            RemoteMicReason::PeerDisconnected => "peer-disconnected",
            RemoteMicReason::UserStopped => "user-stopped",
            RemoteMicReason::FeatureDisabled => "feature-disabled",
            RemoteMicReason::RoomLeft => "room-left",
            RemoteMicReason::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Envelope body, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "announce", rename_all = "camelCase")]
    Announce {
        display_name: String,
        platform: String,
    },

    #[serde(rename = "leave")]
    Leave,

    #[serde(rename = "signal", rename_all = "camelCase")]
    Signal {
        to: PeerId,
        kind: SignalKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidate: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_m_line_index: Option<u16>,
        #[serde(default)]
        restart: bool,
    },

    #[serde(rename = "mute-status", rename_all = "camelCase")]
    MuteStatus { muted: bool, video_enabled: bool },

    #[serde(rename = "chat")]
    Chat { text: String, ts: i64 },

    #[serde(rename = "mod_room_lock", rename_all = "camelCase")]
    RoomLock {
        locked: bool,
        locked_by_peer_id: Option<PeerId>,
    },

    #[serde(rename = "mod_room_locked_notice")]
    RoomLockedNotice { to: PeerId },

    #[serde(rename = "mod_mute_all_request", rename_all = "camelCase")]
    MuteAllRequest {
        request_id: String,
        requested_by_peer_id: PeerId,
        requested_by_name: String,
    },

    #[serde(rename = "mod_mute_all_response", rename_all = "camelCase")]
    MuteAllResponse { request_id: String, accepted: bool },

    #[serde(rename = "mod_hand_raise", rename_all = "camelCase")]
    HandRaise {
        peer_id: PeerId,
        raised: bool,
        ts: i64,
    },

    #[serde(rename = "rm_request", rename_all = "camelCase")]
    RmRequest {
        request_id: String,
        to: PeerId,
        #[serde(default)]
        source_name: String,
    },

    #[serde(rename = "rm_response", rename_all = "camelCase")]
    RmResponse {
        request_id: String,
        to: PeerId,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<RemoteMicReason>,
    },

    #[serde(rename = "rm_start", rename_all = "camelCase")]
    RmStart { request_id: String, to: PeerId },

    #[serde(rename = "rm_heartbeat", rename_all = "camelCase")]
    RmHeartbeat { request_id: String, to: PeerId },

    #[serde(rename = "rm_stop", rename_all = "camelCase")]
    RmStop {
        request_id: String,
        to: PeerId,
        reason: RemoteMicReason,
    },
}

impl Message {
    /// The single recipient of an addressed message
    pub fn addressed_to(&self) -> Option<&PeerId> {
        match self {
            Message::Signal { to, .. }
            | Message::RoomLockedNotice { to }
            | Message::RmRequest { to, .. }
            | Message::RmResponse { to, .. }
            | Message::RmStart { to, .. }
            | Message::RmHeartbeat { to, .. }
            | Message::RmStop { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Announce { .. } => "announce",
            Message::Leave => "leave",
            Message::Signal { .. } => "signal",
            Message::MuteStatus { .. } => "mute-status",
            Message::Chat { .. } => "chat",
            Message::RoomLock { .. } => "mod_room_lock",
            Message::RoomLockedNotice { .. } => "mod_room_locked_notice",
            Message::MuteAllRequest { .. } => "mod_mute_all_request",
            Message::MuteAllResponse { .. } => "mod_mute_all_response",
            Message::HandRaise { .. } => "mod_hand_raise",
            Message::RmRequest { .. } => "rm_request",
            Message::RmResponse { .. } => "rm_response",
            Message::RmStart { .. } => "rm_start",
            Message::RmHeartbeat { .. } => "rm_heartbeat",
            Message::RmStop { .. } => "rm_stop",
        }
    }
}

/// A message stamped with its sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub sender_id: PeerId,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(sender_id: PeerId, message: Message) -> Self {
        Self { sender_id, message }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
