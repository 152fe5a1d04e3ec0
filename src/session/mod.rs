//! Session protocols
//!
//! Room presence, per-peer negotiation, remote microphone mapping and
//! moderation. These are synchronous state machines driven by
//! [`crate::client::MeshClient`]; none of them touches the network.

mod error;
pub mod moderation;
pub mod negotiation;
pub mod remote_mic;
pub mod room;

pub use error::{
    ModerationError, NegotiationError, ProtocolError, RemoteMicError, ValidationError,
    MAX_CHAT_LENGTH,
};
pub use moderation::{ModerationEvent, ModerationProtocol, ModerationState, MuteAllRequest};
pub use negotiation::{NegotiationEngine, NegotiationState};
pub use remote_mic::{
    AudioRouter, InstallOutcome, InstallState, RemoteMicAction, RemoteMicEvent, RemoteMicProtocol,
    RemoteMicRole, RemoteMicSession, RemoteMicState, RoutingMode, VirtualDeviceInstaller,
};
pub use room::{
    validate_chat_message, validate_room_id, LeaveReason, LocalPeer, MemberInfo, MuteState,
    PeerSession, RoomCoordinator, RoomEvent, RoomPresence, RoomState,
};
