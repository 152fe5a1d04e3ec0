//! Broker networking
//!
//! The binary frame transport over a WebSocket, reconnection backoff, the
//! room presence channel and connection health tracking.

mod backoff;
mod error;
pub mod health;
pub mod presence;
pub mod transport;

pub use backoff::ReconnectionPolicy;
pub use error::TransportError;
pub use health::{
    ConnectionQuality, HealthEvent, HealthMonitor, LinkProbe, NetworkProbe, NetworkStatus, Quality,
};
pub use presence::{decode_inbound, qos_for, room_topic, PresenceChannel};
pub use transport::{
    generate_client_id, FrameTransport, LinkState, TransportEvent, TransportOptions,
};
