//! Per-peer offer/answer/candidate negotiation
//!
//! One [`NegotiationEngine`] exists per remote peer. It drives the peer's
//! [`PeerTransport`] through the description exchange and returns the
//! `signal` messages that must be published in response. Remote candidates
//! that arrive before the remote description are queued and applied, in
//! arrival order, right after it.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::NegotiationConfig;
use crate::media::{
    DescriptionKind, IceCandidate, PeerConnectionState, PeerStats, PeerTransport,
    SessionDescription, TrackKind,
};
use crate::protocol::{Message, PeerId, SignalKind};

use super::error::{NegotiationError, ProtocolError};

/// Negotiation state of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    fn name(self) -> &'static str {
        match self {
            NegotiationState::New => "new",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::OfferReceived => "offer-received",
            NegotiationState::Answered => "answered",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        }
    }

    /// A description exchange has completed at least once
    pub fn is_stable(self) -> bool {
        matches!(self, NegotiationState::Answered | NegotiationState::Connected)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bookkeeping for the single ICE restart attempt
#[derive(Debug, Default)]
struct IceRestart {
    attempted: bool,
    deadline: Option<Instant>,
}

/// Deadline for the answer to our latest offer
#[derive(Debug, Default)]
struct OfferTimer {
    deadline: Option<Instant>,
    resent: bool,
    ice_restart: bool,
}

/// Negotiation with one remote peer
pub struct NegotiationEngine {
    peer_id: PeerId,
    is_initiator: bool,
    state: NegotiationState,
    transport: Box<dyn PeerTransport>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: VecDeque<IceCandidate>,
    connection_state: PeerConnectionState,
    restart: IceRestart,
    restart_timeout: Duration,
    offer: OfferTimer,
    offer_timeout: Duration,
}

impl NegotiationEngine {
    pub fn new(
        peer_id: PeerId,
        is_initiator: bool,
        transport: Box<dyn PeerTransport>,
        config: &NegotiationConfig,
    ) -> Self {
        Self {
            peer_id,
            is_initiator,
            state: NegotiationState::New,
            transport,
            local_description: None,
            remote_description: None,
            pending_candidates: VecDeque::new(),
            connection_state: PeerConnectionState::New,
            restart: IceRestart::default(),
            restart_timeout: config.ice_restart_timeout(),
            offer: OfferTimer::default(),
            offer_timeout: config.offer_timeout(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.connection_state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    /// Remote candidates waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Deadline of an ICE restart in progress
    pub fn restart_deadline(&self) -> Option<Instant> {
        self.restart.deadline
    }

    /// Deadline for the answer to the offer in flight
    pub fn offer_deadline(&self) -> Option<Instant> {
        self.offer.deadline
    }

    /// Send the initial offer; only valid from `New`
    pub async fn create_offer(&mut self, now: Instant) -> Result<Vec<Message>, NegotiationError> {
        if self.state != NegotiationState::New {
            return Err(self.unexpected("create-offer"));
        }
        self.send_offer(false, now).await
    }

    /// Apply a remote offer and answer it
    pub async fn handle_offer(
        &mut self,
        description: SessionDescription,
        restart: bool,
        now: Instant,
    ) -> Result<Vec<Message>, NegotiationError> {
        match self.state {
            NegotiationState::New
            | NegotiationState::OfferReceived
            | NegotiationState::Answered
            | NegotiationState::Connected => {}
            NegotiationState::OfferSent if self.is_initiator => {
                debug!("Offer collision with {}, keeping local offer", self.peer_id);
                return Err(ProtocolError::OfferCollision.into());
            }
            NegotiationState::OfferSent => {
                debug!("Offer collision with {}, accepting remote offer", self.peer_id);
            }
            NegotiationState::Failed | NegotiationState::Closed => {
                return Err(self.unexpected("offer"));
            }
        }

        self.state = NegotiationState::OfferReceived;
        if restart {
            debug!("ICE restart offer from {}", self.peer_id);
            self.restart.attempted = true;
            self.restart.deadline.get_or_insert(now + self.restart_timeout);
        }

        if let Err(e) = self.apply_remote(description).await {
            return Err(self.fail(e));
        }

        let answer = match self
            .transport
            .create_local_description(DescriptionKind::Answer, false)
            .await
        {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(e.into())),
        };
        let signal = description_signal(&self.peer_id, &answer, false);
        self.local_description = Some(answer);
        self.settle();

        Ok(vec![signal])
    }

    /// Apply the remote answer to our offer
    pub async fn handle_answer(
        &mut self,
        description: SessionDescription,
    ) -> Result<Vec<Message>, NegotiationError> {
        if self.state != NegotiationState::OfferSent {
            return Err(self.unexpected("answer"));
        }

        if let Err(e) = self.apply_remote(description).await {
            return Err(self.fail(e));
        }
        self.settle();

        Ok(Vec::new())
    }

    /// Apply or queue a remote candidate
    pub async fn handle_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        if matches!(self.state, NegotiationState::Failed | NegotiationState::Closed) {
            return Err(self.unexpected("candidate"));
        }

        if self.remote_description.is_none() {
            debug!("Queueing candidate from {} until remote description", self.peer_id);
            self.pending_candidates.push_back(candidate);
            return Ok(());
        }

        if let Err(e) = self.transport.add_remote_candidate(&candidate).await {
            warn!("Failed to add candidate from {}: {}", self.peer_id, e);
        }
        Ok(())
    }

    /// Wrap a locally gathered candidate for sending
    pub fn local_candidate(&self, candidate: IceCandidate) -> Message {
        Message::Signal {
            to: self.peer_id.clone(),
            kind: SignalKind::Candidate,
            sdp: None,
            candidate: Some(candidate.candidate),
            sdp_mid: candidate.sdp_mid,
            sdp_m_line_index: candidate.sdp_m_line_index,
            restart: false,
        }
    }

    /// Send a fresh offer after the first exchange (negotiation-needed)
    pub async fn renegotiate(&mut self, now: Instant) -> Result<Vec<Message>, NegotiationError> {
        if !self.state.is_stable() {
            // The exchange in progress will carry the change
            debug!("Skipping renegotiation with {} in state {}", self.peer_id, self.state);
            return Ok(Vec::new());
        }
        debug!("Renegotiating with {}", self.peer_id);
        self.send_offer(false, now).await
    }

    /// Switch an outgoing track, renegotiating when the transport needs it
    pub async fn replace_track(
        &mut self,
        kind: TrackKind,
        source: Option<&str>,
        now: Instant,
    ) -> Result<Vec<Message>, NegotiationError> {
        if matches!(self.state, NegotiationState::Failed | NegotiationState::Closed) {
            return Err(self.unexpected("replace-track"));
        }

        let needs_renegotiation = self.transport.replace_outgoing_track(kind, source).await?;
        if needs_renegotiation {
            self.renegotiate(now).await
        } else {
            Ok(Vec::new())
        }
    }

    /// React to a connection state change reported by the transport
    pub async fn on_connection_state(
        &mut self,
        connection_state: PeerConnectionState,
        now: Instant,
    ) -> Result<Vec<Message>, NegotiationError> {
        if self.state == NegotiationState::Closed {
            return Ok(Vec::new());
        }
        debug!("Peer {} connection state {:?}", self.peer_id, connection_state);
        self.connection_state = connection_state;

        match connection_state {
            PeerConnectionState::Connected => {
                if self.state.is_stable() {
                    if self.state != NegotiationState::Connected {
                        info!("Peer {} connected", self.peer_id);
                    }
                    self.state = NegotiationState::Connected;
                    self.restart = IceRestart::default();
                }
                Ok(Vec::new())
            }
            PeerConnectionState::Failed if self.state != NegotiationState::Failed => {
                if self.restart.attempted {
                    warn!("Peer {} failed again after ICE restart", self.peer_id);
                    self.state = NegotiationState::Failed;
                    self.restart.deadline = None;
                    return Ok(Vec::new());
                }

                self.restart.attempted = true;
                self.restart.deadline = Some(now + self.restart_timeout);

                if self.is_initiator {
                    info!("Peer {} failed, attempting ICE restart", self.peer_id);
                    self.send_offer(true, now).await
                } else {
                    info!("Peer {} failed, waiting for ICE restart offer", self.peer_id);
                    Ok(Vec::new())
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Expire the ICE restart and offer deadlines
    ///
    /// An unanswered offer is sent once more; a second miss fails the peer.
    pub async fn tick(&mut self, now: Instant) -> Result<Vec<Message>, NegotiationError> {
        if let Some(deadline) = self.restart.deadline {
            if now >= deadline {
                warn!("ICE restart with {} timed out", self.peer_id);
                self.restart.deadline = None;
                self.offer = OfferTimer::default();
                self.state = NegotiationState::Failed;
                return Ok(Vec::new());
            }
        }

        match self.offer.deadline {
            Some(deadline) if now >= deadline && self.state == NegotiationState::OfferSent => {
                if self.offer.resent {
                    warn!("No answer from {} after resending the offer", self.peer_id);
                    self.offer = OfferTimer::default();
                    self.restart.deadline = None;
                    self.state = NegotiationState::Failed;
                    return Ok(Vec::new());
                }
                info!("No answer from {}, resending offer", self.peer_id);
                self.offer.resent = true;
                let ice_restart = self.offer.ice_restart;
                self.send_offer(ice_restart, now).await
            }
            _ => Ok(Vec::new()),
        }
    }

    pub async fn stats(&mut self) -> Option<PeerStats> {
        if self.state == NegotiationState::Closed {
            return None;
        }
        match self.transport.get_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!("No stats for {}: {}", self.peer_id, e);
                None
            }
        }
    }

    /// Close the transport; terminal
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.transport.close().await;
        self.state = NegotiationState::Closed;
        self.connection_state = PeerConnectionState::Closed;
        self.pending_candidates.clear();
        self.restart.deadline = None;
        self.offer = OfferTimer::default();
    }

    async fn send_offer(
        &mut self,
        ice_restart: bool,
        now: Instant,
    ) -> Result<Vec<Message>, NegotiationError> {
        let offer = match self
            .transport
            .create_local_description(DescriptionKind::Offer, ice_restart)
            .await
        {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(e.into())),
        };
        let signal = description_signal(&self.peer_id, &offer, ice_restart);
        self.local_description = Some(offer);
        self.state = NegotiationState::OfferSent;
        self.offer.deadline = Some(now + self.offer_timeout);
        self.offer.ice_restart = ice_restart;
        Ok(vec![signal])
    }

    /// Apply the remote description, then every queued candidate in order
    async fn apply_remote(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.transport.apply_remote_description(&description).await?;
        self.remote_description = Some(description);

        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.transport.add_remote_candidate(&candidate).await {
                warn!("Failed to add queued candidate from {}: {}", self.peer_id, e);
            }
        }
        Ok(())
    }

    /// Finish an exchange; a link that never dropped stays connected
    fn settle(&mut self) {
        self.offer = OfferTimer::default();
        self.state = if self.connection_state == PeerConnectionState::Connected {
            NegotiationState::Connected
        } else {
            NegotiationState::Answered
        };
    }

    fn fail(&mut self, error: NegotiationError) -> NegotiationError {
        warn!("Negotiation with {} failed: {}", self.peer_id, error);
        self.state = NegotiationState::Failed;
        self.restart.deadline = None;
        self.offer = OfferTimer::default();
        error
    }

    fn unexpected(&self, message: &'static str) -> NegotiationError {
        ProtocolError::UnexpectedMessage {
            message,
            state: self.state.name(),
        }
        .into()
    }
}

fn description_signal(to: &PeerId, description: &SessionDescription, restart: bool) -> Message {
    let kind = match description.kind {
        DescriptionKind::Offer => SignalKind::Offer,
        DescriptionKind::Answer => SignalKind::Answer,
    };
    Message::Signal {
        to: to.clone(),
        kind,
        sdp: Some(description.sdp.clone()),
        candidate: None,
        sdp_mid: None,
        sdp_m_line_index: None,
        restart,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    struct FakeTransport {
        recorder: Arc<Recorder>,
        fail_apply: bool,
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn create_local_description(
            &mut self,
            kind: DescriptionKind,
            ice_restart: bool,
        ) -> Result<SessionDescription, MediaError> {
            self.recorder
                .calls
                .lock()
                .push(format!("create {:?} restart={}", kind, ice_restart));
            Ok(SessionDescription {
                kind,
                sdp: "v=0".to_string(),
            })
        }

        async fn apply_remote_description(
            &mut self,
            description: &SessionDescription,
        ) -> Result<(), MediaError> {
            if self.fail_apply {
                return Err(MediaError("bad sdp".to_string()));
            }
            self.recorder
                .calls
                .lock()
                .push(format!("remote {:?}", description.kind));
            Ok(())
        }

        async fn add_remote_candidate(
            &mut self,
            candidate: &IceCandidate,
        ) -> Result<(), MediaError> {
            self.recorder
                .calls
                .lock()
                .push(format!("candidate {}", candidate.candidate));
            Ok(())
        }

        async fn replace_outgoing_track(
            &mut self,
            _kind: TrackKind,
            _source: Option<&str>,
        ) -> Result<bool, MediaError> {
            Ok(true)
        }

        async fn get_stats(&mut self) -> Result<PeerStats, MediaError> {
            Ok(PeerStats::default())
        }

        async fn close(&mut self) {
            self.recorder.calls.lock().push("close".to_string());
        }
    }

    fn engine(initiator: bool) -> (NegotiationEngine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let transport = FakeTransport {
            recorder: recorder.clone(),
            fail_apply: false,
        };
        let engine = NegotiationEngine::new(
            PeerId::new("remote"),
            initiator,
            Box::new(transport),
            &NegotiationConfig::default(),
        );
        (engine, recorder)
    }

    fn signal_kind(message: &Message) -> (SignalKind, bool) {
        match message {
            Message::Signal { kind, restart, .. } => (*kind, *restart),
            other => panic!("Expected signal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offer_then_answer() {
        let (mut engine, _) = engine(true);

        let out = engine.create_offer(Instant::now()).await.unwrap();
        assert_eq!(signal_kind(&out[0]), (SignalKind::Offer, false));
        assert_eq!(engine.state(), NegotiationState::OfferSent);

        engine
            .handle_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(engine.state(), NegotiationState::Answered);

        engine
            .on_connection_state(PeerConnectionState::Connected, Instant::now())
            .await
            .unwrap();
        assert_eq!(engine.state(), NegotiationState::Connected);
    }

    /// Given candidates that arrive before the offer
    /// When the offer is applied
    /// Then the candidates are added after it, in arrival order
    #[tokio::test]
    async fn test_early_candidates_follow_description() {
        let (mut engine, recorder) = engine(false);

        engine.handle_candidate(IceCandidate::new("c1")).await.unwrap();
        engine.handle_candidate(IceCandidate::new("c2")).await.unwrap();
        assert_eq!(engine.pending_candidates(), 2);

        let out = engine
            .handle_offer(SessionDescription::offer("v=0"), false, Instant::now())
            .await
            .unwrap();
        assert_eq!(signal_kind(&out[0]), (SignalKind::Answer, false));
        assert_eq!(engine.pending_candidates(), 0);

        let calls = recorder.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                "remote Offer".to_string(),
                "candidate c1".to_string(),
                "candidate c2".to_string(),
                "create Answer restart=false".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_answer_in_wrong_state_is_ignored() {
        let (mut engine, _) = engine(false);
        let err = engine
            .handle_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Protocol(_)));
        assert_eq!(engine.state(), NegotiationState::New);
    }

    #[tokio::test]
    async fn test_offer_collision() {
        let (mut initiator, _) = engine(true);
        initiator.create_offer(Instant::now()).await.unwrap();
        let err = initiator
            .handle_offer(SessionDescription::offer("v=0"), false, Instant::now())
            .await
            .unwrap_err();
        assert_eq!(err, NegotiationError::Protocol(ProtocolError::OfferCollision));
        assert_eq!(initiator.state(), NegotiationState::OfferSent);

        let (mut responder, _) = engine(false);
        responder
            .handle_offer(SessionDescription::offer("v=0"), false, Instant::now())
            .await
            .unwrap();
        responder.renegotiate(Instant::now()).await.unwrap();
        assert_eq!(responder.state(), NegotiationState::OfferSent);
        let out = responder
            .handle_offer(SessionDescription::offer("v=1"), false, Instant::now())
            .await
            .unwrap();
        assert_eq!(signal_kind(&out[0]), (SignalKind::Answer, false));
    }

    #[tokio::test]
    async fn test_initiator_restarts_once_then_fails() {
        let (mut engine, _) = engine(true);
        let now = Instant::now();
        engine.create_offer(Instant::now()).await.unwrap();
        engine.handle_answer(SessionDescription::answer("v=0")).await.unwrap();

        let out = engine
            .on_connection_state(PeerConnectionState::Failed, now)
            .await
            .unwrap();
        assert_eq!(signal_kind(&out[0]), (SignalKind::Offer, true));
        assert_eq!(engine.restart_deadline(), Some(now + Duration::from_secs(15)));

        engine.handle_answer(SessionDescription::answer("v=0")).await.unwrap();
        let out = engine
            .on_connection_state(PeerConnectionState::Failed, now)
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(engine.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_restart_deadline_fails_peer() {
        let (mut engine, _) = engine(false);
        let now = Instant::now();
        engine
            .handle_offer(SessionDescription::offer("v=0"), false, now)
            .await
            .unwrap();

        let out = engine
            .on_connection_state(PeerConnectionState::Failed, now)
            .await
            .unwrap();
        assert!(out.is_empty(), "non-initiator waits for the restart offer");

        assert!(engine.tick(now + Duration::from_secs(14)).await.unwrap().is_empty());
        assert_eq!(engine.state(), NegotiationState::Answered);
        assert!(engine.tick(now + Duration::from_secs(15)).await.unwrap().is_empty());
        assert_eq!(engine.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_media_failure_marks_failed() {
        let recorder = Arc::new(Recorder::default());
        let transport = FakeTransport {
            recorder,
            fail_apply: true,
        };
        let mut engine = NegotiationEngine::new(
            PeerId::new("remote"),
            false,
            Box::new(transport),
            &NegotiationConfig::default(),
        );
        let err = engine
            .handle_offer(SessionDescription::offer("v=0"), false, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Media(_)));
        assert_eq!(engine.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_close_clears_everything() {
        let (mut engine, recorder) = engine(false);
        engine.handle_candidate(IceCandidate::new("c1")).await.unwrap();
        engine.close().await;

        assert_eq!(engine.state(), NegotiationState::Closed);
        assert_eq!(engine.pending_candidates(), 0);
        assert!(engine
            .tick(Instant::now() + Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(engine.state(), NegotiationState::Closed);
        assert_eq!(recorder.calls.lock().last().map(String::as_str), Some("close"));
    }

    /// Given an offer that is never answered
    /// When the offer timeout passes twice
    /// Then the offer is sent once more and the peer then fails
    #[tokio::test]
    async fn test_unanswered_offer_is_resent_then_fails() {
        let (mut engine, recorder) = engine(true);
        let now = Instant::now();
        engine.create_offer(now).await.unwrap();
        assert_eq!(engine.offer_deadline(), Some(now + Duration::from_secs(10)));

        let out = engine.tick(now + Duration::from_secs(9)).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(engine.state(), NegotiationState::OfferSent);

        let out = engine.tick(now + Duration::from_secs(10)).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(signal_kind(&out[0]), (SignalKind::Offer, false));
        assert_eq!(engine.state(), NegotiationState::OfferSent);
        assert_eq!(engine.offer_deadline(), Some(now + Duration::from_secs(20)));

        let out = engine.tick(now + Duration::from_secs(3600)).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(engine.state(), NegotiationState::Failed);
        assert_eq!(engine.offer_deadline(), None);

        let offers = recorder
            .calls
            .lock()
            .iter()
            .filter(|call| call.starts_with("create Offer"))
            .count();
        assert_eq!(offers, 2);
    }

    /// Given a resent offer
    /// When the answer arrives
    /// Then the deadline is cleared and later ticks change nothing
    #[tokio::test]
    async fn test_answer_after_resend_clears_deadline() {
        let (mut engine, _) = engine(true);
        let now = Instant::now();
        engine.create_offer(now).await.unwrap();
        engine.tick(now + Duration::from_secs(10)).await.unwrap();

        engine
            .handle_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(engine.state(), NegotiationState::Answered);
        assert_eq!(engine.offer_deadline(), None);

        let out = engine.tick(now + Duration::from_secs(3600)).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(engine.state(), NegotiationState::Answered);
    }
}
