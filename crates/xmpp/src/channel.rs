use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::minidom::Element;
use xmpp_parsers::stanza_error::StanzaError;

use crate::error::ChannelError;

pub type StanzaSender = mpsc::Sender<Vec<u8>>;

pub type StanzaReceiver = mpsc::Receiver<Vec<u8>>;

pub fn stanza_channel(buffer: usize) -> (StanzaSender, StanzaReceiver) {
    mpsc::channel(buffer)
}

/// Outbound half of the request/response messaging channel.
///
/// Replies to requests submitted with [`StanzaChannel::send_with_reply`] are
/// delivered back to whoever owns the request (for bytestreams, through
/// `IbbBytestream::handle_reply`); the channel itself only transmits.
#[cfg_attr(test, mockall::automock)]
pub trait StanzaChannel {
    fn send(&mut self, stanza: Element) -> Result<(), ChannelError>;

    fn send_with_reply(&mut self, request: Iq) -> Result<(), ChannelError> {
        self.send(request.into())
    }

    fn send_error_reply(&mut self, original: &Iq, error: StanzaError) -> Result<(), ChannelError> {
        self.send(build_error_reply(original, error).into())
    }

    fn ack_request(&mut self, original: &Iq) -> Result<(), ChannelError> {
        self.send(build_ack(original).into())
    }
}

/// Build an empty result IQ acknowledging `original`.
pub fn build_ack(original: &Iq) -> Iq {
    Iq {
        from: original.to.clone(),
        to: original.from.clone(),
        id: original.id.clone(),
        payload: IqType::Result(None),
    }
}

/// Build an error IQ answering `original`.
pub fn build_error_reply(original: &Iq, error: StanzaError) -> Iq {
    Iq {
        from: original.to.clone(),
        to: original.from.clone(),
        id: original.id.clone(),
        payload: IqType::Error(error),
    }
}

/// [`StanzaChannel`] writing serialized stanzas into the connection's wire
/// queue without waiting for capacity.
#[derive(Debug, Clone)]
pub struct WireChannel {
    sender: StanzaSender,
}

impl WireChannel {
    pub fn new(sender: StanzaSender) -> Self {
        Self { sender }
    }
}

impl StanzaChannel for WireChannel {
    fn send(&mut self, stanza: Element) -> Result<(), ChannelError> {
        let mut payload = Vec::new();
        stanza
            .write_to(&mut payload)
            .map_err(|error| ChannelError::Serialization(error.to_string()))?;

        match self.sender.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!(name = stanza.name(), "wire queue full, stanza rejected");
                Err(ChannelError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }
}
