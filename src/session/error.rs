//! Session error types

use thiserror::Error;

use crate::media::MediaError;

/// Maximum chat message length in characters
pub const MAX_CHAT_LENGTH: usize = 1000;

/// Input rejected before anything is sent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid room id: {0:?} (4-64 characters of A-Z, a-z, 0-9, '-' or '_')")]
    InvalidRoomId(String),

    #[error("Display name must not be empty")]
    EmptyDisplayName,

    #[error("Message must not be empty")]
    EmptyMessage,

    #[error("Message too long: {len} characters (max {max})")]
    MessageTooLong { len: usize, max: usize },

    #[error("Not in a room")]
    NotInRoom,
}

/// A message that does not fit the current state; logged and dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unexpected {message} in state {state}")]
    UnexpectedMessage {
        message: &'static str,
        state: &'static str,
    },

    #[error("Offer collision, keeping local offer")]
    OfferCollision,

    #[error("Signal without description payload")]
    MissingPayload,
}

/// Failure inside one peer negotiation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Remote microphone requests that cannot proceed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteMicError {
    #[error("Remote mic session busy")]
    Busy,

    #[error("Remote mic is disabled")]
    Disabled,

    #[error("Cannot map the local microphone to itself")]
    SelfTarget,

    #[error("No pending remote mic request")]
    NoPendingRequest,
}

/// Moderation operations that cannot proceed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModerationError {
    #[error("No pending mute-all request")]
    NoPendingRequest,

    #[error("Room is locked by another peer")]
    LockedByOther,
}
