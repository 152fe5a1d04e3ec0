//! Remote microphone mapping
//!
//! One participant (the source) routes its microphone exclusively to
//! another participant (the target), who plays it through a virtual audio
//! device. The exchange is `rm_request` -> `rm_response` -> `rm_start`,
//! then `rm_heartbeat` from the source until either side sends `rm_stop`.
//!
//! [`RemoteMicProtocol`] holds the single session of this client. It does
//! no I/O: every call may queue [`RemoteMicAction`]s which the caller
//! drains with [`RemoteMicProtocol::poll_action`]. All deadlines live in
//! the session value, so resetting the session cancels them.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RemoteMicConfig;
use crate::protocol::{Message, PeerId, RemoteMicReason};

use super::error::RemoteMicError;

/// Where local audio goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingMode {
    /// Normal mesh: microphone to everyone
    Broadcast,
    /// Source side: microphone only to this peer
    ExclusiveTo(PeerId),
    /// Target side: play this peer into the virtual device
    PlaybackFrom(PeerId),
}

/// Local audio routing boundary
pub trait AudioRouter: Send + Sync {
    /// Whether the virtual audio device is installed and usable
    fn virtual_device_ready(&self) -> bool;

    fn set_routing(&self, mode: &RoutingMode);
}

/// Result state of a driver install
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallState {
    Installed,
    Failed,
    Unsupported,
    RebootRequired,
    UserCancelled,
}

/// Result of [`VirtualDeviceInstaller::install_virtual_audio_driver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub state: InstallState,
    pub message: Option<String>,
}

impl InstallOutcome {
    pub fn new(state: InstallState) -> Self {
        Self {
            state,
            message: None,
        }
    }
}

/// OS virtual audio driver installer boundary
#[async_trait]
pub trait VirtualDeviceInstaller: Send + Sync {
    async fn install_virtual_audio_driver(
        &self,
        provider: &str,
        correlation_id: &str,
    ) -> InstallOutcome;
}

/// Which end of the mapping this client is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMicRole {
    Source,
    Target,
}

/// Coarse session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMicState {
    Idle,
    PendingOutgoing,
    PendingIncoming,
    Active,
    Rejected,
    Expired,
}

impl fmt::Display for RemoteMicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteMicState::Idle => "idle",
            RemoteMicState::PendingOutgoing => "pending-outgoing",
            RemoteMicState::PendingIncoming => "pending-incoming",
            RemoteMicState::Active => "active",
            RemoteMicState::Rejected => "rejected",
            RemoteMicState::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// The single remote-mic session
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteMicSession {
    Idle,
    PendingOutgoing {
        request_id: String,
        target: PeerId,
        expires_at: Instant,
    },
    PendingIncoming {
        request_id: String,
        source: PeerId,
        source_name: String,
        expires_at: Instant,
        /// We replied `accepted: true` and wait for `rm_start`
        accepted: bool,
        needs_virtual_device_setup: bool,
        is_installing_virtual_device: bool,
    },
    Active {
        request_id: String,
        role: RemoteMicRole,
        source: PeerId,
        target: PeerId,
        started_at: Instant,
        /// Next heartbeat (source) or watchdog expiry (target)
        deadline: Instant,
    },
    Rejected {
        request_id: String,
        reason: RemoteMicReason,
        revert_at: Instant,
    },
    Expired {
        request_id: String,
        reason: RemoteMicReason,
        revert_at: Instant,
    },
}

impl RemoteMicSession {
    pub fn state(&self) -> RemoteMicState {
        match self {
            RemoteMicSession::Idle => RemoteMicState::Idle,
            RemoteMicSession::PendingOutgoing { .. } => RemoteMicState::PendingOutgoing,
            RemoteMicSession::PendingIncoming { .. } => RemoteMicState::PendingIncoming,
            RemoteMicSession::Active { .. } => RemoteMicState::Active,
            RemoteMicSession::Rejected { .. } => RemoteMicState::Rejected,
            RemoteMicSession::Expired { .. } => RemoteMicState::Expired,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            RemoteMicSession::Idle => None,
            RemoteMicSession::PendingOutgoing { request_id, .. }
            | RemoteMicSession::PendingIncoming { request_id, .. }
            | RemoteMicSession::Active { request_id, .. }
            | RemoteMicSession::Rejected { request_id, .. }
            | RemoteMicSession::Expired { request_id, .. } => Some(request_id),
        }
    }

    /// The other participant of a pending or active session
    pub fn counterpart(&self) -> Option<&PeerId> {
        match self {
            RemoteMicSession::PendingOutgoing { target, .. } => Some(target),
            RemoteMicSession::PendingIncoming { source, .. } => Some(source),
            RemoteMicSession::Active {
                role: RemoteMicRole::Source,
                target,
                ..
            } => Some(target),
            RemoteMicSession::Active { source, .. } => Some(source),
            _ => None,
        }
    }

    /// The earliest armed deadline, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        match self {
            RemoteMicSession::Idle => None,
            RemoteMicSession::PendingOutgoing { expires_at, .. }
            | RemoteMicSession::PendingIncoming { expires_at, .. } => Some(*expires_at),
            RemoteMicSession::Active { deadline, .. } => Some(*deadline),
            RemoteMicSession::Rejected { revert_at, .. }
            | RemoteMicSession::Expired { revert_at, .. } => Some(*revert_at),
        }
    }
}

/// Reported to the UI
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteMicEvent {
    IncomingRequest {
        request_id: String,
        from: PeerId,
        source_name: String,
    },
    InstallingVirtualDevice {
        request_id: String,
    },
    Started {
        request_id: String,
        role: RemoteMicRole,
        peer_id: PeerId,
    },
    Rejected {
        request_id: String,
        reason: RemoteMicReason,
    },
    Expired {
        request_id: String,
        reason: RemoteMicReason,
    },
    Stopped {
        request_id: String,
        reason: RemoteMicReason,
    },
    /// Back to idle after a rejected/expired result was shown
    Cleared,
}

/// Side effect requested by the protocol
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteMicAction {
    Send(Message),
    SetRouting(RoutingMode),
    InstallDriver {
        provider: String,
        correlation_id: String,
    },
    Event(RemoteMicEvent),
}

/// Remote microphone session state machine
pub struct RemoteMicProtocol {
    local_id: PeerId,
    local_name: String,
    config: RemoteMicConfig,
    session: RemoteMicSession,
    actions: VecDeque<RemoteMicAction>,
}

impl RemoteMicProtocol {
    pub fn new(local_id: PeerId, local_name: impl Into<String>, config: RemoteMicConfig) -> Self {
        Self {
            local_id,
            local_name: local_name.into(),
            config,
            session: RemoteMicSession::Idle,
            actions: VecDeque::new(),
        }
    }

    pub fn session(&self) -> &RemoteMicSession {
        &self.session
    }

    pub fn state(&self) -> RemoteMicState {
        self.session.state()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_local_name(&mut self, name: impl Into<String>) {
        self.local_name = name.into();
    }

    pub fn poll_action(&mut self) -> Option<RemoteMicAction> {
        self.actions.pop_front()
    }

    /// Ask `target` to play our microphone
    pub fn request(&mut self, target: &PeerId, now: Instant) -> Result<String, RemoteMicError> {
        if !self.config.enabled {
            return Err(RemoteMicError::Disabled);
        }
        if *target == self.local_id {
            return Err(RemoteMicError::SelfTarget);
        }
        if self.state() != RemoteMicState::Idle {
            return Err(RemoteMicError::Busy);
        }

        let request_id = Uuid::new_v4().to_string();
        let expires_at = now + self.request_timeout() + self.install_timeout();
        info!("Requesting remote mic to {} ({})", target, request_id);

        self.send(Message::RmRequest {
            request_id: request_id.clone(),
            to: target.clone(),
            source_name: self.local_name.clone(),
        });
        self.session = RemoteMicSession::PendingOutgoing {
            request_id: request_id.clone(),
            target: target.clone(),
            expires_at,
        };
        Ok(request_id)
    }

    /// Answer the pending incoming request
    ///
    /// `device_ready` tells whether the virtual audio device is usable;
    /// when it is not, accepting starts the driver install first.
    pub fn respond(
        &mut self,
        accept: bool,
        device_ready: bool,
        now: Instant,
    ) -> Result<(), RemoteMicError> {
        let RemoteMicSession::PendingIncoming {
            request_id,
            source,
            accepted: false,
            is_installing_virtual_device,
            ..
        } = &self.session
        else {
            return Err(RemoteMicError::NoPendingRequest);
        };
        let (request_id, source) = (request_id.clone(), source.clone());

        if *is_installing_virtual_device {
            if !accept {
                self.cancel_install(now);
            }
            return Ok(());
        }

        if !accept {
            info!("Declined remote mic request {}", request_id);
            self.send(Message::RmResponse {
                request_id,
                to: source,
                accepted: false,
                reason: Some(RemoteMicReason::Declined),
            });
            self.session = RemoteMicSession::Idle;
            return Ok(());
        }

        if device_ready {
            self.accept_request(now);
        } else {
            info!("Installing virtual audio device for request {}", request_id);
            let install_deadline = now + self.install_timeout();
            if let RemoteMicSession::PendingIncoming {
                expires_at,
                needs_virtual_device_setup,
                is_installing_virtual_device,
                ..
            } = &mut self.session
            {
                *expires_at = install_deadline;
                *needs_virtual_device_setup = true;
                *is_installing_virtual_device = true;
            }
            self.actions.push_back(RemoteMicAction::InstallDriver {
                provider: self.config.driver_provider.clone(),
                correlation_id: request_id.clone(),
            });
            self.emit(RemoteMicEvent::InstallingVirtualDevice { request_id });
        }
        Ok(())
    }

    /// Completion of the driver install started by [`Self::respond`]
    pub fn on_install_result(
        &mut self,
        correlation_id: &str,
        outcome: InstallOutcome,
        now: Instant,
    ) {
        let installing = matches!(
            &self.session,
            RemoteMicSession::PendingIncoming {
                request_id,
                is_installing_virtual_device: true,
                ..
            } if request_id == correlation_id
        );
        if !installing {
            debug!("Ignoring stale install result for {}", correlation_id);
            return;
        }

        let reason = match outcome.state {
            InstallState::Installed => {
                info!("Virtual audio device installed");
                if let RemoteMicSession::PendingIncoming {
                    is_installing_virtual_device,
                    ..
                } = &mut self.session
                {
                    *is_installing_virtual_device = false;
                }
                self.accept_request(now);
                return;
            }
            InstallState::Failed => RemoteMicReason::VirtualDeviceInstallFailed,
            InstallState::Unsupported => RemoteMicReason::Unsupported,
            InstallState::RebootRequired => RemoteMicReason::RebootRequired,
            InstallState::UserCancelled => RemoteMicReason::InstallCancelled,
        };
        warn!(
            "Virtual audio device install ended with {:?}: {}",
            outcome.state,
            outcome.message.as_deref().unwrap_or("no details")
        );
        self.reject_incoming(reason, now);
    }

    /// Abort the driver install of the pending request
    pub fn cancel_install(&mut self, now: Instant) {
        if matches!(
            self.session,
            RemoteMicSession::PendingIncoming {
                is_installing_virtual_device: true,
                ..
            }
        ) {
            info!("Virtual audio device install cancelled");
            self.reject_incoming(RemoteMicReason::InstallCancelled, now);
        }
    }

    /// End the session from this side
    pub fn stop(&mut self, reason: RemoteMicReason) {
        match &self.session {
            RemoteMicSession::Idle => return,
            RemoteMicSession::Rejected { .. } | RemoteMicSession::Expired { .. } => {
                self.session = RemoteMicSession::Idle;
                self.emit(RemoteMicEvent::Cleared);
                return;
            }
            _ => {}
        }

        let current = (self.session.request_id(), self.session.counterpart());
        if let (Some(request_id), Some(peer)) = current {
            info!("Stopping remote mic {} ({})", request_id, reason);
            let message = Message::RmStop {
                request_id: request_id.to_string(),
                to: peer.clone(),
                reason,
            };
            self.send(message);
        }
        self.end_session(reason);
    }

    /// Enable or disable the feature; disabling ends any session
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        if !enabled {
            self.stop(RemoteMicReason::FeatureDisabled);
            self.session = RemoteMicSession::Idle;
        }
    }

    /// Drop the session (room left); deadlines go with it
    pub fn reset(&mut self) {
        self.stop(RemoteMicReason::RoomLeft);
        self.session = RemoteMicSession::Idle;
    }

    /// The counterpart left the room
    pub fn on_peer_left(&mut self, peer_id: &PeerId) {
        if self.session.counterpart() == Some(peer_id) {
            info!("Remote mic counterpart {} left", peer_id);
            self.end_session(RemoteMicReason::PeerDisconnected);
        }
    }

    /// Handle an `rm_*` message from `from`
    pub fn handle_message(&mut self, from: &PeerId, message: &Message, now: Instant) {
        match message {
            Message::RmRequest {
                request_id,
                source_name,
                ..
            } => self.on_request(from, request_id, source_name, now),
            Message::RmResponse {
                request_id,
                accepted,
                reason,
                ..
            } => self.on_response(from, request_id, *accepted, *reason, now),
            Message::RmStart { request_id, .. } => self.on_start(from, request_id, now),
            Message::RmHeartbeat { request_id, .. } => self.on_heartbeat(from, request_id, now),
            Message::RmStop {
                request_id, reason, ..
            } => self.on_stop(from, request_id, *reason),
            other => debug!("Remote mic ignoring {}", other.kind()),
        }
    }

    /// Fire expired deadlines
    pub fn tick(&mut self, now: Instant) {
        match &mut self.session {
            RemoteMicSession::Idle => {}
            RemoteMicSession::PendingOutgoing {
                request_id,
                target,
                expires_at,
            } => {
                if now >= *expires_at {
                    let (request_id, target) = (request_id.clone(), target.clone());
                    info!("Remote mic request {} timed out", request_id);
                    self.send(Message::RmStop {
                        request_id: request_id.clone(),
                        to: target,
                        reason: RemoteMicReason::RequestTimeout,
                    });
                    self.expire(request_id, RemoteMicReason::RequestTimeout, now);
                }
            }
            RemoteMicSession::PendingIncoming {
                expires_at,
                is_installing_virtual_device,
                accepted,
                ..
            } => {
                if now >= *expires_at {
                    if *is_installing_virtual_device {
                        warn!("Virtual audio device install timed out");
                        self.reject_incoming(RemoteMicReason::InstallTimeout, now);
                    } else if *accepted {
                        self.stop(RemoteMicReason::RequestTimeout);
                    } else {
                        self.expire_incoming(now);
                    }
                }
            }
            RemoteMicSession::Active {
                request_id,
                role: RemoteMicRole::Source,
                target,
                deadline,
                ..
            } => {
                if now >= *deadline {
                    let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
                    *deadline = (*deadline + interval).max(now);
                    let message = Message::RmHeartbeat {
                        request_id: request_id.clone(),
                        to: target.clone(),
                    };
                    self.send(message);
                }
            }
            RemoteMicSession::Active {
                role: RemoteMicRole::Target,
                deadline,
                ..
            } => {
                if now >= *deadline {
                    warn!("Remote mic heartbeat timed out");
                    self.stop(RemoteMicReason::HeartbeatTimeout);
                }
            }
            RemoteMicSession::Rejected { revert_at, .. }
            | RemoteMicSession::Expired { revert_at, .. } => {
                if now >= *revert_at {
                    self.session = RemoteMicSession::Idle;
                    self.emit(RemoteMicEvent::Cleared);
                }
            }
        }
    }

    fn on_request(&mut self, from: &PeerId, request_id: &str, source_name: &str, now: Instant) {
        let busy = if !self.config.enabled {
            Some(RemoteMicReason::FeatureDisabled)
        } else if self.state() != RemoteMicState::Idle {
            Some(RemoteMicReason::Busy)
        } else {
            None
        };
        if let Some(reason) = busy {
            debug!("Refusing remote mic request {} from {}: {}", request_id, from, reason);
            self.send(Message::RmResponse {
                request_id: request_id.to_string(),
                to: from.clone(),
                accepted: false,
                reason: Some(reason),
            });
            return;
        }

        info!("Remote mic request {} from {}", request_id, from);
        self.session = RemoteMicSession::PendingIncoming {
            request_id: request_id.to_string(),
            source: from.clone(),
            source_name: source_name.to_string(),
            expires_at: now + self.request_timeout(),
            accepted: false,
            needs_virtual_device_setup: false,
            is_installing_virtual_device: false,
        };
        self.emit(RemoteMicEvent::IncomingRequest {
            request_id: request_id.to_string(),
            from: from.clone(),
            source_name: source_name.to_string(),
        });
    }

    fn on_response(
        &mut self,
        from: &PeerId,
        request_id: &str,
        accepted: bool,
        reason: Option<RemoteMicReason>,
        now: Instant,
    ) {
        let RemoteMicSession::PendingOutgoing {
            request_id: current,
            target,
            ..
        } = &self.session
        else {
            debug!("Unexpected rm_response in state {}", self.state());
            return;
        };
        if current != request_id || target != from {
            debug!("Ignoring rm_response for {}", request_id);
            return;
        }
        let target = target.clone();

        if !accepted {
            let reason = reason.unwrap_or(RemoteMicReason::Declined);
            info!("Remote mic request {} rejected: {}", request_id, reason);
            self.session = RemoteMicSession::Rejected {
                request_id: request_id.to_string(),
                reason,
                revert_at: now + self.result_display(),
            };
            self.emit(RemoteMicEvent::Rejected {
                request_id: request_id.to_string(),
                reason,
            });
            return;
        }

        info!("Remote mic to {} active", target);
        self.actions
            .push_back(RemoteMicAction::SetRouting(RoutingMode::ExclusiveTo(target.clone())));
        self.send(Message::RmStart {
            request_id: request_id.to_string(),
            to: target.clone(),
        });
        self.session = RemoteMicSession::Active {
            request_id: request_id.to_string(),
            role: RemoteMicRole::Source,
            source: self.local_id.clone(),
            target: target.clone(),
            started_at: now,
            deadline: now + self.heartbeat_interval(),
        };
        self.emit(RemoteMicEvent::Started {
            request_id: request_id.to_string(),
            role: RemoteMicRole::Source,
            peer_id: target,
        });
    }

    fn on_start(&mut self, from: &PeerId, request_id: &str, now: Instant) {
        let RemoteMicSession::PendingIncoming {
            request_id: current,
            source,
            accepted: true,
            ..
        } = &self.session
        else {
            debug!("Unexpected rm_start in state {}", self.state());
            return;
        };
        if current != request_id || source != from {
            debug!("Ignoring rm_start for {}", request_id);
            return;
        }
        let source = source.clone();

        info!("Playing remote mic from {}", source);
        self.actions
            .push_back(RemoteMicAction::SetRouting(RoutingMode::PlaybackFrom(source.clone())));
        self.session = RemoteMicSession::Active {
            request_id: request_id.to_string(),
            role: RemoteMicRole::Target,
            source: source.clone(),
            target: self.local_id.clone(),
            started_at: now,
            deadline: now + self.heartbeat_timeout(),
        };
        self.emit(RemoteMicEvent::Started {
            request_id: request_id.to_string(),
            role: RemoteMicRole::Target,
            peer_id: source,
        });
    }

    fn on_heartbeat(&mut self, from: &PeerId, request_id: &str, now: Instant) {
        let timeout = self.heartbeat_timeout();
        match &mut self.session {
            RemoteMicSession::Active {
                request_id: current,
                role: RemoteMicRole::Target,
                source,
                deadline,
                ..
            } if current == request_id && source == from => {
                *deadline = now + timeout;
            }
            _ => debug!("Ignoring rm_heartbeat for {}", request_id),
        }
    }

    fn on_stop(&mut self, from: &PeerId, request_id: &str, reason: RemoteMicReason) {
        let matches = self.session.request_id() == Some(request_id)
            && self.session.counterpart() == Some(from);
        if !matches {
            debug!("Ignoring rm_stop for {}", request_id);
            return;
        }
        info!("Remote mic {} stopped by {}: {}", request_id, from, reason);
        self.end_session(reason);
    }

    /// Reply accepted and wait for `rm_start`
    fn accept_request(&mut self, now: Instant) {
        let request_timeout = self.request_timeout();
        let RemoteMicSession::PendingIncoming {
            request_id,
            source,
            expires_at,
            accepted,
            ..
        } = &mut self.session
        else {
            return;
        };
        *accepted = true;
        *expires_at = now + request_timeout;
        let message = Message::RmResponse {
            request_id: request_id.clone(),
            to: source.clone(),
            accepted: true,
            reason: None,
        };
        info!("Accepted remote mic request {}", request_id);
        self.send(message);
    }

    /// Refuse the pending incoming request with `reason`
    fn reject_incoming(&mut self, reason: RemoteMicReason, now: Instant) {
        let RemoteMicSession::PendingIncoming {
            request_id, source, ..
        } = &self.session
        else {
            return;
        };
        let request_id = request_id.clone();
        self.send(Message::RmResponse {
            request_id: request_id.clone(),
            to: source.clone(),
            accepted: false,
            reason: Some(reason),
        });
        self.session = RemoteMicSession::Rejected {
            request_id: request_id.clone(),
            reason,
            revert_at: now + self.result_display(),
        };
        self.emit(RemoteMicEvent::Rejected { request_id, reason });
    }

    fn expire_incoming(&mut self, now: Instant) {
        let RemoteMicSession::PendingIncoming {
            request_id, source, ..
        } = &self.session
        else {
            return;
        };
        let request_id = request_id.clone();
        info!("Remote mic request {} expired", request_id);
        self.send(Message::RmResponse {
            request_id: request_id.clone(),
            to: source.clone(),
            accepted: false,
            reason: Some(RemoteMicReason::RequestTimeout),
        });
        self.expire(request_id, RemoteMicReason::RequestTimeout, now);
    }

    fn expire(&mut self, request_id: String, reason: RemoteMicReason, now: Instant) {
        self.session = RemoteMicSession::Expired {
            request_id: request_id.clone(),
            reason,
            revert_at: now + self.result_display(),
        };
        self.emit(RemoteMicEvent::Expired { request_id, reason });
    }

    /// Go idle, restoring broadcast routing if audio was rerouted
    fn end_session(&mut self, reason: RemoteMicReason) {
        let session = std::mem::replace(&mut self.session, RemoteMicSession::Idle);
        let Some(request_id) = session.request_id().map(str::to_string) else {
            return;
        };
        if session.state() == RemoteMicState::Active {
            self.actions
                .push_back(RemoteMicAction::SetRouting(RoutingMode::Broadcast));
        }
        self.emit(RemoteMicEvent::Stopped { request_id, reason });
    }

    fn send(&mut self, message: Message) {
        self.actions.push_back(RemoteMicAction::Send(message));
    }

    fn emit(&mut self, event: RemoteMicEvent) {
        self.actions.push_back(RemoteMicAction::Event(event));
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.config.install_timeout_ms)
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat_interval_ms)
    }

    fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat_timeout_ms)
    }

    fn result_display(&self) -> Duration {
        Duration::from_millis(self.config.result_display_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol(id: &str) -> RemoteMicProtocol {
        RemoteMicProtocol::new(PeerId::new(id), id.to_uppercase(), RemoteMicConfig::default())
    }

    fn drain(protocol: &mut RemoteMicProtocol) -> Vec<RemoteMicAction> {
        std::iter::from_fn(|| protocol.poll_action()).collect()
    }

    fn sent(actions: &[RemoteMicAction]) -> Vec<Message> {
        actions
            .iter()
            .filter_map(|action| match action {
                RemoteMicAction::Send(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_request_sets_pending_with_combined_expiry() {
        let mut a = protocol("a");
        let now = Instant::now();
        let request_id = a.request(&PeerId::new("b"), now).unwrap();

        match a.session() {
            RemoteMicSession::PendingOutgoing {
                request_id: id,
                expires_at,
                ..
            } => {
                assert_eq!(id, &request_id);
                assert_eq!(*expires_at, now + Duration::from_millis(150_000));
            }
            other => panic!("Expected pending outgoing, got {:?}", other),
        }
        let messages = sent(&drain(&mut a));
        assert!(matches!(
            &messages[0],
            Message::RmRequest { source_name, .. } if source_name == "A"
        ));
    }

    #[test]
    fn test_second_request_is_busy_and_does_not_mutate() {
        let mut a = protocol("a");
        let now = Instant::now();
        a.request(&PeerId::new("b"), now).unwrap();
        let before = a.session().clone();
        drain(&mut a);

        assert_eq!(a.request(&PeerId::new("c"), now), Err(RemoteMicError::Busy));
        assert_eq!(a.session(), &before);
        assert!(drain(&mut a).is_empty());
    }

    #[test]
    fn test_request_rejected_when_disabled_or_self() {
        let mut a = protocol("a");
        assert_eq!(
            a.request(&PeerId::new("a"), Instant::now()),
            Err(RemoteMicError::SelfTarget)
        );
        a.set_enabled(false);
        assert_eq!(
            a.request(&PeerId::new("b"), Instant::now()),
            Err(RemoteMicError::Disabled)
        );
    }

    #[test]
    fn test_outgoing_request_expires_then_clears() {
        let mut a = protocol("a");
        let now = Instant::now();
        a.request(&PeerId::new("b"), now).unwrap();
        drain(&mut a);

        a.tick(now + Duration::from_millis(149_999));
        assert_eq!(a.state(), RemoteMicState::PendingOutgoing);

        let expiry = now + Duration::from_millis(150_000);
        a.tick(expiry);
        assert_eq!(a.state(), RemoteMicState::Expired);
        let messages = sent(&drain(&mut a));
        assert!(matches!(
            &messages[0],
            Message::RmStop {
                reason: RemoteMicReason::RequestTimeout,
                ..
            }
        ));

        a.tick(expiry + Duration::from_millis(3_000));
        assert_eq!(a.state(), RemoteMicState::Idle);
    }

    #[test]
    fn test_decline() {
        let mut b = protocol("b");
        let now = Instant::now();
        let request = Message::RmRequest {
            request_id: "r1".to_string(),
            to: PeerId::new("b"),
            source_name: "A".to_string(),
        };
        b.handle_message(&PeerId::new("a"), &request, now);
        assert_eq!(b.state(), RemoteMicState::PendingIncoming);
        drain(&mut b);

        b.respond(false, true, now).unwrap();
        assert_eq!(b.state(), RemoteMicState::Idle);
        let messages = sent(&drain(&mut b));
        assert!(matches!(
            &messages[0],
            Message::RmResponse {
                accepted: false,
                reason: Some(RemoteMicReason::Declined),
                ..
            }
        ));
        assert_eq!(b.respond(true, true, now), Err(RemoteMicError::NoPendingRequest));
    }

    #[test]
    fn test_install_failure_rejects_with_reason() {
        let mut b = protocol("b");
        let now = Instant::now();
        let request = Message::RmRequest {
            request_id: "r1".to_string(),
            to: PeerId::new("b"),
            source_name: "A".to_string(),
        };
        b.handle_message(&PeerId::new("a"), &request, now);
        b.respond(true, false, now).unwrap();
        let actions = drain(&mut b);
        assert!(actions.contains(&RemoteMicAction::InstallDriver {
            provider: RemoteMicConfig::default().driver_provider,
            correlation_id: "r1".to_string(),
        }));

        b.on_install_result("other", InstallOutcome::new(InstallState::Installed), now);
        assert_eq!(b.state(), RemoteMicState::PendingIncoming);

        b.on_install_result("r1", InstallOutcome::new(InstallState::RebootRequired), now);
        assert_eq!(b.state(), RemoteMicState::Rejected);
        let messages = sent(&drain(&mut b));
        assert!(matches!(
            &messages[0],
            Message::RmResponse {
                accepted: false,
                reason: Some(RemoteMicReason::RebootRequired),
                ..
            }
        ));
    }

    #[test]
    fn test_install_timeout() {
        let mut b = protocol("b");
        let now = Instant::now();
        let request = Message::RmRequest {
            request_id: "r1".to_string(),
            to: PeerId::new("b"),
            source_name: "A".to_string(),
        };
        b.handle_message(&PeerId::new("a"), &request, now);
        b.respond(true, false, now).unwrap();
        drain(&mut b);

        b.tick(now + Duration::from_millis(120_000));
        assert!(matches!(
            b.session(),
            RemoteMicSession::Rejected {
                reason: RemoteMicReason::InstallTimeout,
                ..
            }
        ));
    }

    #[test]
    fn test_mismatched_request_id_is_ignored() {
        let mut b = protocol("b");
        let now = Instant::now();
        let request = Message::RmRequest {
            request_id: "r1".to_string(),
            to: PeerId::new("b"),
            source_name: "A".to_string(),
        };
        b.handle_message(&PeerId::new("a"), &request, now);
        b.respond(true, true, now).unwrap();
        drain(&mut b);

        let stale_start = Message::RmStart {
            request_id: "r0".to_string(),
            to: PeerId::new("b"),
        };
        b.handle_message(&PeerId::new("a"), &stale_start, now);
        assert_eq!(b.state(), RemoteMicState::PendingIncoming);
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn test_peer_left_stops_active_session() {
        let mut b = protocol("b");
        let now = Instant::now();
        let a = PeerId::new("a");
        b.handle_message(
            &a,
            &Message::RmRequest {
                request_id: "r1".to_string(),
                to: PeerId::new("b"),
                source_name: "A".to_string(),
            },
            now,
        );
        b.respond(true, true, now).unwrap();
        b.handle_message(
            &a,
            &Message::RmStart {
                request_id: "r1".to_string(),
                to: PeerId::new("b"),
            },
            now,
        );
        assert_eq!(b.state(), RemoteMicState::Active);
        drain(&mut b);

        b.on_peer_left(&a);
        assert_eq!(b.state(), RemoteMicState::Idle);
        let actions = drain(&mut b);
        assert!(actions.contains(&RemoteMicAction::SetRouting(RoutingMode::Broadcast)));
        assert!(actions.contains(&RemoteMicAction::Event(RemoteMicEvent::Stopped {
            request_id: "r1".to_string(),
            reason: RemoteMicReason::PeerDisconnected,
        })));
    }

    #[test]
    fn test_reset_clears_deadlines() {
        let mut a = protocol("a");
        let now = Instant::now();
        a.request(&PeerId::new("b"), now).unwrap();
        a.reset();
        assert_eq!(a.session().next_deadline(), None);
        drain(&mut a);

        a.tick(now + Duration::from_secs(3600));
        assert_eq!(a.state(), RemoteMicState::Idle);
        assert!(drain(&mut a).is_empty());
    }
}
