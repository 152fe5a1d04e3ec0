//! Media transport boundary
//!
//! The crate never moves media itself. Each peer gets a [`PeerTransport`]
//! (typically a WebRTC peer connection) created by a
//! [`MediaTransportFactory`]; negotiation drives it through
//! description/candidate operations, and it reports back through a
//! [`MediaEventSender`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::PeerId;

/// Error reported by the media transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Media transport error: {0}")]
pub struct MediaError(pub String);

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Opaque session description produced/consumed by the media transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One ICE candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Connection state reported by the media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Kind of media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A track received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub track_id: String,
    pub stream_id: String,
}

/// Transport statistics for one peer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerStats {
    /// Round-trip time in milliseconds
    pub rtt_ms: f32,
    /// Packet loss rate (0.0 - 1.0)
    pub packet_loss: f32,
    /// Jitter in milliseconds
    pub jitter_ms: f32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Callback-style notifications from a peer transport
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(PeerConnectionState),
    Track(RemoteTrack),
    NegotiationNeeded,
}

/// A [`MediaEvent`] tagged with the peer it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMediaEvent {
    pub peer_id: PeerId,
    pub event: MediaEvent,
}

pub type MediaEventSender = mpsc::UnboundedSender<PeerMediaEvent>;

/// Per-peer media transport primitive
#[async_trait]
pub trait PeerTransport: Send {
    /// Create and set the local description
    async fn create_local_description(
        &mut self,
        kind: DescriptionKind,
        ice_restart: bool,
    ) -> Result<SessionDescription, MediaError>;

    async fn apply_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MediaError>;

    /// Only valid once a remote description has been applied
    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Swap the outgoing track of `kind` to `source` (`None` stops sending).
    /// Returns `true` when the change needs a renegotiation.
    async fn replace_outgoing_track(
        &mut self,
        kind: TrackKind,
        source: Option<&str>,
    ) -> Result<bool, MediaError>;

    async fn get_stats(&mut self) -> Result<PeerStats, MediaError>;

    async fn close(&mut self);
}

/// Creates one [`PeerTransport`] per remote peer
pub trait MediaTransportFactory: Send + Sync {
    fn create(&self, peer_id: &PeerId, events: MediaEventSender) -> Box<dyn PeerTransport>;
}
