//! XEP-0047 in-band bytestreams.
//!
//! An [`IbbBytestream`] turns IQ request/reply exchanges into an ordered,
//! flow-controlled byte stream. It is sans-io: the owner feeds it inbound
//! stanzas and replies, and drains [`BytestreamEvent`]s after each call.
//! [`BytestreamRegistry`] routes inbound stanzas to the right instance.

mod ibb;
mod registry;
mod stanza;
mod state;

#[cfg(test)]
pub(crate) mod testing;

use xmpp_parsers::jid::Jid;

pub use ibb::IbbBytestream;
pub use registry::{BytestreamRegistry, IqRouting, StreamKey};
pub use stanza::{
    DataFragment, IbbRequest, NS_IBB, NS_SI, OpenRequest, parse_message_data, parse_request,
};
pub use state::BytestreamState;
pub use waddle_core::config::BytestreamConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum BytestreamEvent {
    StateChanged(BytestreamState),
    WriteBlockedChanged(bool),
    DataReceived { from: Jid, data: Vec<u8> },
}

/// Construction parameters shared by initiated and offered streams.
#[derive(Debug, Clone)]
pub struct BytestreamParams {
    /// Bare address of the remote contact.
    pub peer: String,
    /// Resource the peer used during negotiation, if any.
    pub peer_resource: Option<String>,
    pub stream_id: String,
    /// Id of the stream-initiation offer this stream answers.
    pub stream_init_id: Option<String>,
    pub config: BytestreamConfig,
}

impl BytestreamParams {
    pub fn new(peer: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            peer_resource: None,
            stream_id: stream_id.into(),
            stream_init_id: None,
            config: BytestreamConfig::default(),
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.peer_resource = Some(resource.into());
        self
    }

    pub fn with_stream_init_id(mut self, id: impl Into<String>) -> Self {
        self.stream_init_id = Some(id.into());
        self
    }

    pub fn with_config(mut self, config: BytestreamConfig) -> Self {
        self.config = config;
        self
    }
}
