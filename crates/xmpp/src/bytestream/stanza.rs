//! Wire shapes for XEP-0047 in-band bytestreams and the XEP-0095 offer reply.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::jid::Jid;
use xmpp_parsers::minidom::Element;
use xmpp_parsers::stanza_error::StanzaError;

use crate::error::ProtocolError;

pub const NS_IBB: &str = "http://jabber.org/protocol/ibb";
pub const NS_SI: &str = "http://jabber.org/protocol/si";
const NS_FEATURE_NEG: &str = "http://jabber.org/protocol/feature-neg";
const NS_DATA_FORMS: &str = "jabber:x:data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub sid: String,
    pub block_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFragment {
    pub sid: String,
    pub seq: u16,
    encoded: String,
}

impl DataFragment {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        let compact: String = self
            .encoded
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        STANDARD.decode(compact)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IbbRequest {
    Open(OpenRequest),
    Data(DataFragment),
    Close { sid: String },
}

impl IbbRequest {
    pub fn sid(&self) -> &str {
        match self {
            IbbRequest::Open(open) => &open.sid,
            IbbRequest::Data(data) => &data.sid,
            IbbRequest::Close { sid } => sid,
        }
    }
}

pub fn build_open(to: &Jid, id: &str, sid: &str, block_size: u16) -> Iq {
    let open = Element::builder("open", NS_IBB)
        .attr("sid", sid)
        .attr("block-size", block_size.to_string())
        .attr("stanza", "iq")
        .build();
    set_iq(to, id, open)
}

pub fn build_data(to: &Jid, id: &str, sid: &str, seq: u16, chunk: &[u8]) -> Iq {
    let data = Element::builder("data", NS_IBB)
        .attr("sid", sid)
        .attr("seq", seq.to_string())
        .append(STANDARD.encode(chunk))
        .build();
    set_iq(to, id, data)
}

pub fn build_close(to: &Jid, id: &str, sid: &str) -> Iq {
    let close = Element::builder("close", NS_IBB).attr("sid", sid).build();
    set_iq(to, id, close)
}

/// The `<si/>` answer selecting IBB as the stream method.
pub fn build_si_accept() -> Element {
    let value = Element::builder("value", NS_DATA_FORMS)
        .append(NS_IBB)
        .build();
    let field = Element::builder("field", NS_DATA_FORMS)
        .attr("var", "stream-method")
        .append(value)
        .build();
    let form = Element::builder("x", NS_DATA_FORMS)
        .attr("type", "submit")
        .append(field)
        .build();
    let feature = Element::builder("feature", NS_FEATURE_NEG)
        .append(form)
        .build();
    Element::builder("si", NS_SI).append(feature).build()
}

pub fn build_offer_reply(to: &Jid, stream_init_id: &str, si: Element) -> Iq {
    Iq {
        from: None,
        to: Some(to.clone()),
        id: stream_init_id.to_string(),
        payload: IqType::Result(Some(si)),
    }
}

pub fn build_decline(to: &Jid, stream_init_id: &str, error: StanzaError) -> Iq {
    Iq {
        from: None,
        to: Some(to.clone()),
        id: stream_init_id.to_string(),
        payload: IqType::Error(error),
    }
}

/// Parse the IBB payload of a `set` IQ.
///
/// `Ok(None)` means the IQ is not an IBB request; `Err` means it is one but
/// is malformed.
pub fn parse_request(iq: &Iq) -> Result<Option<IbbRequest>, ProtocolError> {
    let IqType::Set(payload) = &iq.payload else {
        return Ok(None);
    };
    if payload.ns() != NS_IBB {
        return Ok(None);
    }

    let request = match payload.name() {
        "open" => IbbRequest::Open(parse_open(payload)?),
        "data" => IbbRequest::Data(parse_data(payload)?),
        "close" => IbbRequest::Close {
            sid: required_attr(payload, "sid")?.to_string(),
        },
        other => {
            return Err(ProtocolError::MalformedRequest(format!(
                "unsupported IBB element <{other}/>"
            )));
        }
    };
    Ok(Some(request))
}

/// Find and parse the IBB `<data/>` carried by a `<message/>`.
pub fn parse_message_data(message: &Element) -> Option<Result<DataFragment, ProtocolError>> {
    if message.name() != "message" {
        return None;
    }
    message.get_child("data", NS_IBB).map(parse_data)
}

pub fn parse_data(element: &Element) -> Result<DataFragment, ProtocolError> {
    let sid = required_attr(element, "sid")?.to_string();
    let seq = required_attr(element, "seq")?
        .parse::<u16>()
        .map_err(|_| ProtocolError::MalformedRequest("invalid seq attribute".to_string()))?;

    Ok(DataFragment {
        sid,
        seq,
        encoded: element.text(),
    })
}

fn parse_open(element: &Element) -> Result<OpenRequest, ProtocolError> {
    let sid = required_attr(element, "sid")?.to_string();
    let block_size = required_attr(element, "block-size")?
        .parse::<u16>()
        .ok()
        .filter(|size| *size > 0)
        .ok_or_else(|| ProtocolError::MalformedRequest("invalid block-size attribute".to_string()))?;

    Ok(OpenRequest { sid, block_size })
}

fn required_attr<'a>(element: &'a Element, name: &str) -> Result<&'a str, ProtocolError> {
    element.attr(name).ok_or_else(|| {
        ProtocolError::MalformedRequest(format!(
            "<{}/> is missing the {name} attribute",
            element.name()
        ))
    })
}

fn set_iq(to: &Jid, id: &str, payload: Element) -> Iq {
    Iq {
        from: None,
        to: Some(to.clone()),
        id: id.to_string(),
        payload: IqType::Set(payload),
    }
}
