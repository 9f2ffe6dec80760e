pub mod bytestream;
pub mod channel;
pub mod error;

pub use bytestream::{
    BytestreamConfig, BytestreamEvent, BytestreamParams, BytestreamRegistry, BytestreamState,
    IbbBytestream, IqRouting, StreamKey,
};
pub use channel::{StanzaChannel, StanzaReceiver, StanzaSender, WireChannel, stanza_channel};
pub use error::{BytestreamError, ChannelError, ProtocolError};
