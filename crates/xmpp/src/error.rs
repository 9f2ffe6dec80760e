use thiserror::Error;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::bytestream::BytestreamState;

/// Failure to hand a stanza to the outbound wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("outbound stanza channel is closed")]
    Closed,

    #[error("outbound stanza channel is full")]
    Full,

    #[error("failed to serialize stanza: {0}")]
    Serialization(String),
}

#[derive(Debug, Error)]
pub enum BytestreamError {
    #[error("bytestream is not open (state: {state:?})")]
    NotOpen { state: BytestreamState },

    #[error("bytestream is not in the initiating state (state: {state:?})")]
    NotInitiating { state: BytestreamState },

    #[error("an open request is already waiting for a reply")]
    OpenAlreadyRequested,

    #[error("invalid peer address: {0}")]
    InvalidPeer(String),

    #[error("an offered bytestream needs the id of the offer it answers")]
    MissingStreamInitId,

    #[error("invalid bytestream configuration: {0}")]
    InvalidConfig(String),

    #[error("a bytestream with id {sid} is already registered for {peer}")]
    DuplicateStream { peer: String, sid: String },

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Conditions reported back to the remote peer as stanza errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    NotOpen,
    DecodeFailed,
    BufferFull,
    StreamGone,
    UnknownStream,
    UnexpectedOpen,
    MalformedRequest(String),
}

impl ProtocolError {
    pub fn to_stanza_error(&self) -> StanzaError {
        let (type_, condition, text) = match self {
            ProtocolError::NotOpen => (
                ErrorType::Cancel,
                DefinedCondition::BadRequest,
                "IBB bytestream isn't open".to_string(),
            ),
            ProtocolError::DecodeFailed => (
                ErrorType::Modify,
                DefinedCondition::BadRequest,
                "base64 decoding failed".to_string(),
            ),
            ProtocolError::BufferFull => (
                ErrorType::Cancel,
                DefinedCondition::NotAcceptable,
                "buffer is full".to_string(),
            ),
            ProtocolError::StreamGone => {
                (ErrorType::Cancel, DefinedCondition::ItemNotFound, String::new())
            }
            ProtocolError::UnknownStream => (
                ErrorType::Cancel,
                DefinedCondition::ItemNotFound,
                "unknown bytestream".to_string(),
            ),
            ProtocolError::UnexpectedOpen => (
                ErrorType::Cancel,
                DefinedCondition::NotAcceptable,
                "no accepted offer for this bytestream".to_string(),
            ),
            ProtocolError::MalformedRequest(detail) => {
                (ErrorType::Modify, DefinedCondition::BadRequest, detail.clone())
            }
        };

        StanzaError::new(type_, condition, "en", text)
    }
}
