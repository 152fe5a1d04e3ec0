//! Room topic publish/subscribe
//!
//! A room is one broker topic, `{prefix}/{room_id}`. Every envelope is
//! published there as JSON; addressed envelopes carry `to` and are dropped
//! by everyone else on receipt. The broker echoes our own publishes back,
//! so envelopes from the local peer id are dropped too.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::protocol::{Envelope, Message, PeerId, QoS};

use super::error::TransportError;
use super::transport::FrameTransport;

/// Topic of a room
pub fn room_topic(prefix: &str, room_id: &str) -> String {
    format!("{}/{}", prefix, room_id)
}

/// Delivery guarantee used for a message
///
/// Presence refreshes and mute/video state are fire-and-forget; everything
/// that drives a state machine on the other side is acknowledged.
pub fn qos_for(message: &Message) -> QoS {
    match message {
        Message::Announce { .. } | Message::MuteStatus { .. } => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Decode an inbound publish into an envelope meant for `local_id`
///
/// Returns `None` for other topics, own echoes, envelopes addressed to
/// someone else and payloads that do not parse.
pub fn decode_inbound(
    local_id: &PeerId,
    room_topic: &str,
    topic: &str,
    payload: &[u8],
) -> Option<Envelope> {
    if topic != room_topic {
        debug!("Ignoring publish on {}", topic);
        return None;
    }

    let envelope = match Envelope::from_json(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Dropping undecodable envelope on {}: {}", topic, e);
            return None;
        }
    };

    if envelope.sender_id == *local_id {
        return None;
    }
    if let Some(to) = envelope.message.addressed_to() {
        if to != local_id {
            return None;
        }
    }
    Some(envelope)
}

/// Presence channel of the local peer on top of the broker transport
pub struct PresenceChannel {
    transport: FrameTransport,
    local_id: PeerId,
    topic_prefix: String,
    room_topic: Option<String>,
}

impl PresenceChannel {
    pub fn new(
        transport: FrameTransport,
        local_id: PeerId,
        topic_prefix: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            local_id,
            topic_prefix: topic_prefix.into(),
            room_topic: None,
        }
    }

    pub fn transport(&self) -> &FrameTransport {
        &self.transport
    }

    pub fn room_topic(&self) -> Option<&str> {
        self.room_topic.as_deref()
    }

    /// Subscribe to the room topic, leaving any previous room
    pub fn join(&mut self, room_id: &str) -> Result<(), TransportError> {
        let topic = room_topic(&self.topic_prefix, room_id);
        if self.room_topic.as_deref() == Some(topic.as_str()) {
            return Ok(());
        }
        self.leave()?;
        self.transport.subscribe(topic.clone())?;
        self.room_topic = Some(topic);
        Ok(())
    }

    pub fn leave(&mut self) -> Result<(), TransportError> {
        if let Some(topic) = self.room_topic.take() {
            self.transport.unsubscribe(topic)?;
        }
        Ok(())
    }

    /// Publish `message` to the room as the local peer
    pub fn publish(&self, message: Message) -> Result<(), TransportError> {
        let Some(topic) = self.room_topic.as_deref() else {
            return Err(TransportError::NotConnected);
        };
        let qos = qos_for(&message);
        let envelope = Envelope::new(self.local_id.clone(), message);
        let payload = Bytes::from(envelope.to_json()?);
        self.transport.publish(topic, payload, qos)
    }

    /// Decode a publish received on the transport
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Option<Envelope> {
        let room_topic = self.room_topic.as_deref()?;
        decode_inbound(&self.local_id, room_topic, topic, payload)
    }

    /// Unsubscribe and close the broker connection
    pub async fn close(mut self) {
        if let Err(e) = self.leave() {
            debug!("Leaving room on close: {}", e);
        }
        self.transport.disconnect().await;
    }
}
