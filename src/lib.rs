//! meshcall - Signaling and session protocols for small mesh rooms
//!
//! Peers find each other through a room topic on a publish/subscribe
//! broker, negotiate one media connection per pair of peers, and run the
//! remote microphone and moderation protocols on top of the same channel.
//! Media capture and the peer connection itself sit behind
//! [`media::PeerTransport`].

pub mod client;
pub mod clock;
pub mod config;
pub mod events;
pub mod media;
pub mod network;
pub mod protocol;
pub mod session;

pub use client::{ClientError, ClientEvent, ClientSnapshot, Collaborators, MeshClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MeshConfig;
pub use events::{EventBus, Subscription};
pub use protocol::{Envelope, Message, PeerId};
