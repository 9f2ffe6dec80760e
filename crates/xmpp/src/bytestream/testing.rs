use std::str::FromStr;

use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::jid::Jid;
use xmpp_parsers::minidom::Element;
use xmpp_parsers::stanza_error::{DefinedCondition, StanzaError};

use super::stanza::{self, NS_IBB};
use crate::channel::StanzaChannel;
use crate::error::ChannelError;

pub(crate) const PEER: &str = "romeo@montague.lit/orchard";
pub(crate) const LOCAL: &str = "juliet@capulet.lit/balcony";

/// What a [`RecordingChannel`] saw, other than requests expecting a reply.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Sent {
    Ack(String),
    Error(String, DefinedCondition),
    Stanza(Element),
}

/// In-memory channel recording everything it is asked to transmit. Requests
/// are kept apart so tests can answer them.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingChannel {
    pub sent: Vec<Sent>,
    pub requests: Vec<Iq>,
    pub closes: usize,
    pub fail: bool,
}

impl RecordingChannel {
    pub fn take_requests(&mut self) -> Vec<Iq> {
        std::mem::take(&mut self.requests)
    }

    pub fn clear(&mut self) {
        self.sent.clear();
        self.requests.clear();
        self.closes = 0;
    }

    pub fn close_requests(&self) -> usize {
        self.closes
    }

    pub fn declines(&self) -> Vec<Iq> {
        self.stanza_iqs()
            .filter(|iq| matches!(iq.payload, IqType::Error(_)))
            .collect()
    }

    pub fn offer_replies(&self) -> Vec<Iq> {
        self.stanza_iqs()
            .filter(|iq| matches!(iq.payload, IqType::Result(_)))
            .collect()
    }

    fn stanza_iqs(&self) -> impl Iterator<Item = Iq> + '_ {
        self.sent.iter().filter_map(|sent| match sent {
            Sent::Stanza(element) => Iq::try_from(element.clone()).ok(),
            _ => None,
        })
    }

    /// Sequence number and decoded bytes of a data request.
    pub fn data_payload(request: &Iq) -> Option<(u16, Vec<u8>)> {
        let IqType::Set(payload) = &request.payload else {
            return None;
        };
        if !payload.is("data", NS_IBB) {
            return None;
        }
        let fragment = stanza::parse_data(payload).ok()?;
        Some((fragment.seq, fragment.decode().ok()?))
    }

    pub fn data_message(sid: &str, seq: u16, bytes: &[u8]) -> Element {
        let IqType::Set(data) = stanza::build_data(&peer(), "unused", sid, seq, bytes).payload
        else {
            unreachable!("data requests are set IQs");
        };
        Element::builder("message", "jabber:client")
            .attr("from", PEER)
            .append(data)
            .build()
    }

    fn guard(&self) -> Result<(), ChannelError> {
        if self.fail {
            Err(ChannelError::Closed)
        } else {
            Ok(())
        }
    }
}

impl StanzaChannel for RecordingChannel {
    fn send(&mut self, stanza: Element) -> Result<(), ChannelError> {
        self.guard()?;
        self.sent.push(Sent::Stanza(stanza));
        Ok(())
    }

    fn send_with_reply(&mut self, request: Iq) -> Result<(), ChannelError> {
        self.guard()?;
        if let IqType::Set(payload) = &request.payload {
            if payload.is("close", NS_IBB) {
                self.closes += 1;
            }
        }
        self.requests.push(request);
        Ok(())
    }

    fn send_error_reply(&mut self, original: &Iq, error: StanzaError) -> Result<(), ChannelError> {
        self.guard()?;
        self.sent
            .push(Sent::Error(original.id.clone(), error.defined_condition));
        Ok(())
    }

    fn ack_request(&mut self, original: &Iq) -> Result<(), ChannelError> {
        self.guard()?;
        self.sent.push(Sent::Ack(original.id.clone()));
        Ok(())
    }
}

pub(crate) fn peer() -> Jid {
    Jid::from_str(PEER).unwrap()
}

fn local() -> Jid {
    Jid::from_str(LOCAL).unwrap()
}

fn inbound(id: &str, payload: Element) -> Iq {
    Iq {
        from: Some(peer()),
        to: Some(local()),
        id: id.to_string(),
        payload: IqType::Set(payload),
    }
}

pub(crate) fn data_iq(id: &str, sid: &str, seq: u16, bytes: &[u8]) -> Iq {
    let mut iq = stanza::build_data(&local(), id, sid, seq, bytes);
    iq.from = Some(peer());
    iq
}

pub(crate) fn peer_open_iq(id: &str, sid: &str, block_size: u16) -> Iq {
    let open = Element::builder("open", NS_IBB)
        .attr("sid", sid)
        .attr("block-size", block_size.to_string())
        .build();
    inbound(id, open)
}

pub(crate) fn peer_close_iq(id: &str, sid: &str) -> Iq {
    inbound(id, Element::builder("close", NS_IBB).attr("sid", sid).build())
}

/// The peer's successful answer to one of our requests.
pub(crate) fn reply_result(request: &Iq) -> Iq {
    Iq {
        from: request.to.clone(),
        to: request.from.clone(),
        id: request.id.clone(),
        payload: IqType::Result(None),
    }
}

pub(crate) fn reply_error(request: &Iq) -> Iq {
    Iq {
        from: request.to.clone(),
        to: request.from.clone(),
        id: request.id.clone(),
        payload: IqType::Error(StanzaError::new(
            xmpp_parsers::stanza_error::ErrorType::Cancel,
            DefinedCondition::NotAcceptable,
            "en",
            "",
        )),
    }
}
