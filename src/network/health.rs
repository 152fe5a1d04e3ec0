//! Connection health monitoring
//!
//! Per-peer quality is derived from transport stats polled on an interval
//! and only reported when something visible changed. Network status tracks
//! whether the broker link is up and how many reconnect attempts have been
//! made while we were in a room.

use std::collections::HashMap;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::media::{PeerConnectionState, PeerStats};
use crate::protocol::PeerId;

use super::transport::LinkState;

/// Quality bucket shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Quality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl Quality {
    /// Classify rtt (ms), packet loss (0.0 - 1.0) and jitter (ms)
    pub fn derive(rtt_ms: f32, packet_loss: f32, jitter_ms: f32) -> Self {
        let loss_percent = packet_loss * 100.0;
        if rtt_ms < 100.0 && loss_percent < 1.0 && jitter_ms < 30.0 {
            Quality::Excellent
        } else if rtt_ms < 200.0 && loss_percent < 3.0 && jitter_ms < 50.0 {
            Quality::Good
        } else if rtt_ms < 400.0 && loss_percent < 8.0 && jitter_ms < 100.0 {
            Quality::Fair
        } else {
            Quality::Poor
        }
    }
}

/// Health snapshot of one peer connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionQuality {
    pub rtt_ms: f32,
    pub packet_loss: f32,
    pub jitter_ms: f32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub quality: Quality,
    pub connection_state: PeerConnectionState,
}

impl ConnectionQuality {
    pub fn from_stats(stats: &PeerStats, connection_state: PeerConnectionState) -> Self {
        Self {
            rtt_ms: stats.rtt_ms,
            packet_loss: stats.packet_loss,
            jitter_ms: stats.jitter_ms,
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            quality: Quality::derive(stats.rtt_ms, stats.packet_loss, stats.jitter_ms),
            connection_state,
        }
    }

    /// Whether anything worth showing differs; byte counters are not
    fn differs_from(&self, other: &ConnectionQuality) -> bool {
        round(self.rtt_ms, 1.0) != round(other.rtt_ms, 1.0)
            || round(self.packet_loss, 1000.0) != round(other.packet_loss, 1000.0)
            || round(self.jitter_ms, 1.0) != round(other.jitter_ms, 1.0)
            || self.quality != other.quality
            || self.connection_state != other.connection_state
    }
}

fn round(value: f32, scale: f32) -> i64 {
    (value * scale).round() as i64
}

/// Broker reachability while in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub is_online: bool,
    pub was_in_room_when_offline: bool,
    pub reconnect_attempts: u32,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            is_online: true,
            was_in_room_when_offline: false,
            reconnect_attempts: 0,
        }
    }
}

impl NetworkStatus {
    pub fn is_reconnecting(&self) -> bool {
        self.was_in_room_when_offline && self.reconnect_attempts > 0
    }
}

/// Reported to the UI
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    QualityChanged {
        peer_id: PeerId,
        quality: ConnectionQuality,
    },
    NetworkChanged(NetworkStatus),
}

/// Network reachability boundary
pub trait NetworkProbe: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Reachability of the broker link itself
pub struct LinkProbe {
    state: watch::Receiver<LinkState>,
}

impl LinkProbe {
    pub fn new(state: watch::Receiver<LinkState>) -> Self {
        Self { state }
    }
}

impl NetworkProbe for LinkProbe {
    fn is_online(&self) -> bool {
        *self.state.borrow() == LinkState::Connected
    }
}

/// Tracks peer quality and network status, reporting changes only
pub struct HealthMonitor {
    max_reconnect_attempts: u32,
    snapshots: HashMap<PeerId, ConnectionQuality>,
    network: NetworkStatus,
}

impl HealthMonitor {
    pub fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            max_reconnect_attempts,
            snapshots: HashMap::new(),
            network: NetworkStatus::default(),
        }
    }

    pub fn network(&self) -> NetworkStatus {
        self.network
    }

    pub fn quality(&self, peer_id: &PeerId) -> Option<&ConnectionQuality> {
        self.snapshots.get(peer_id)
    }

    /// Record a stats sample; returns an event if the peer's health changed
    pub fn record_stats(
        &mut self,
        peer_id: &PeerId,
        stats: &PeerStats,
        connection_state: PeerConnectionState,
    ) -> Option<HealthEvent> {
        let quality = ConnectionQuality::from_stats(stats, connection_state);
        let changed = self
            .snapshots
            .get(peer_id)
            .map_or(true, |previous| quality.differs_from(previous));

        if !changed {
            // Keep the byte counters current without reporting
            self.snapshots.insert(peer_id.clone(), quality);
            return None;
        }

        debug!("Peer {} quality {:?}", peer_id, quality.quality);
        self.snapshots.insert(peer_id.clone(), quality.clone());
        Some(HealthEvent::QualityChanged {
            peer_id: peer_id.clone(),
            quality,
        })
    }

    pub fn forget_peer(&mut self, peer_id: &PeerId) {
        self.snapshots.remove(peer_id);
    }

    pub fn forget_all(&mut self) {
        self.snapshots.clear();
    }

    /// Record a reachability sample
    ///
    /// The network only counts as back when the broker link is up as well.
    pub fn on_network_sample(
        &mut self,
        reachable: bool,
        link_connected: bool,
        in_room: bool,
    ) -> Option<HealthEvent> {
        let mut next = self.network;
        next.is_online = reachable && link_connected;
        if next.is_online {
            next.was_in_room_when_offline = false;
            next.reconnect_attempts = 0;
        } else if in_room {
            next.was_in_room_when_offline = true;
        }
        self.update_network(next)
    }

    /// The transport scheduled another reconnect attempt
    pub fn on_reconnect_attempt(&mut self) -> Option<HealthEvent> {
        let mut next = self.network;
        next.is_online = false;
        next.reconnect_attempts = (next.reconnect_attempts + 1).min(self.max_reconnect_attempts);
        self.update_network(next)
    }

    /// A manual reconnect only makes sense while offline
    pub fn should_manual_reconnect(&self) -> bool {
        !self.network.is_online
    }

    fn update_network(&mut self, next: NetworkStatus) -> Option<HealthEvent> {
        if next == self.network {
            return None;
        }
        if next.is_online != self.network.is_online {
            info!("Network {}", if next.is_online { "online" } else { "offline" });
        }
        self.network = next;
        Some(HealthEvent::NetworkChanged(next))
    }
}
