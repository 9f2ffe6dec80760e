use std::collections::HashMap;

use tracing::{debug, warn};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::jid::Jid;
use xmpp_parsers::minidom::Element;

use super::stanza::{self, IbbRequest};
use super::{BytestreamEvent, BytestreamParams, IbbBytestream};
use crate::channel::StanzaChannel;
use crate::error::{BytestreamError, ProtocolError};

/// Identifies one bytestream: the peer address it was registered with and
/// its stream id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub peer: String,
    pub sid: String,
}

impl StreamKey {
    pub fn new(peer: impl Into<String>, sid: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            sid: sid.into(),
        }
    }
}

/// Outcome of offering an IQ to the registry.
#[derive(Debug)]
pub enum IqRouting {
    Handled,
    /// Not an in-band bytestream stanza; handed back to the caller.
    Unhandled(Iq),
}

/// Owns every live bytestream of a connection and routes inbound stanzas to
/// them.
pub struct BytestreamRegistry<C: StanzaChannel + Clone> {
    channel: C,
    streams: HashMap<StreamKey, IbbBytestream<C>>,
}

impl<C: StanzaChannel + Clone> BytestreamRegistry<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            streams: HashMap::new(),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Create a stream towards the peer and send its open request.
    pub fn initiate(&mut self, params: BytestreamParams) -> Result<StreamKey, BytestreamError> {
        let mut stream = IbbBytestream::initiator(self.channel.clone(), params)?;
        self.check_free(&stream)?;
        stream.initiate()?;
        Ok(self.insert(stream))
    }

    /// Register a stream the peer offered; it waits for `accept` or `close`.
    pub fn offer(&mut self, params: BytestreamParams) -> Result<StreamKey, BytestreamError> {
        let stream = IbbBytestream::offered(self.channel.clone(), params)?;
        self.check_free(&stream)?;
        Ok(self.insert(stream))
    }

    /// A sid may only be used once per contact, whatever resource it was
    /// registered with: request ids are derived from the sid, so two such
    /// streams could not tell their replies apart.
    fn check_free(&self, stream: &IbbBytestream<C>) -> Result<(), BytestreamError> {
        let key = key_of(stream);
        let contact = bare_address(&key.peer);
        let taken = self
            .streams
            .keys()
            .any(|existing| existing.sid == key.sid && bare_address(&existing.peer) == contact);
        if taken {
            return Err(BytestreamError::DuplicateStream {
                peer: key.peer,
                sid: key.sid,
            });
        }
        Ok(())
    }

    fn insert(&mut self, stream: IbbBytestream<C>) -> StreamKey {
        let key = key_of(&stream);
        debug!(peer = %key.peer, sid = %key.sid, state = ?stream.state(), "bytestream registered");
        self.streams.insert(key.clone(), stream);
        key
    }

    pub fn get(&self, key: &StreamKey) -> Option<&IbbBytestream<C>> {
        self.streams.get(key)
    }

    pub fn get_mut(&mut self, key: &StreamKey) -> Option<&mut IbbBytestream<C>> {
        self.streams.get_mut(key)
    }

    pub fn remove(&mut self, key: &StreamKey) -> Option<IbbBytestream<C>> {
        self.streams.remove(key)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Route an inbound IQ. Requests for streams this registry does not know
    /// are answered with an error here.
    pub fn handle_iq(&mut self, iq: Iq) -> IqRouting {
        if matches!(iq.payload, IqType::Result(_) | IqType::Error(_)) {
            return self.handle_reply(iq);
        }

        let request = match stanza::parse_request(&iq) {
            Ok(Some(request)) => request,
            Ok(None) => return IqRouting::Unhandled(iq),
            Err(error) => {
                debug!(id = %iq.id, ?error, "malformed IBB request");
                self.reply_error(&iq, &error);
                return IqRouting::Handled;
            }
        };

        let Some(key) = self.lookup(iq.from.as_ref(), request.sid()) else {
            let error = match request {
                IbbRequest::Open(_) => ProtocolError::UnexpectedOpen,
                _ => ProtocolError::UnknownStream,
            };
            debug!(id = %iq.id, sid = %request.sid(), "IBB request for an unknown bytestream");
            self.reply_error(&iq, &error);
            return IqRouting::Handled;
        };

        if let Some(stream) = self.streams.get_mut(&key) {
            stream.receive_iq(iq);
        }
        IqRouting::Handled
    }

    fn handle_reply(&mut self, reply: Iq) -> IqRouting {
        let Some(from) = reply.from.as_ref().map(Jid::to_string) else {
            return IqRouting::Unhandled(reply);
        };

        let consumed = self
            .streams
            .iter_mut()
            .filter(|(key, _)| peer_matches(&key.peer, &from))
            .any(|(_, stream)| stream.handle_reply(&reply));

        if consumed {
            IqRouting::Handled
        } else {
            IqRouting::Unhandled(reply)
        }
    }

    /// Route IBB data carried by a message. Returns whether a stream took it.
    pub fn handle_message(&mut self, message: &Element) -> bool {
        let Some(Ok(fragment)) = stanza::parse_message_data(message) else {
            return false;
        };
        let from = message.attr("from").and_then(|from| from.parse::<Jid>().ok());

        match self.lookup(from.as_ref(), &fragment.sid) {
            Some(key) => {
                if let Some(stream) = self.streams.get_mut(&key) {
                    stream.receive_message_data(message);
                }
                true
            }
            None => {
                debug!(sid = %fragment.sid, "dropping message data for an unknown bytestream");
                false
            }
        }
    }

    pub fn drain_events(&mut self) -> Vec<(StreamKey, BytestreamEvent)> {
        let mut events = Vec::new();
        for (key, stream) in &mut self.streams {
            events.extend(stream.drain_events().into_iter().map(|event| (key.clone(), event)));
        }
        events
    }

    /// Drop closed streams that no longer wait for any reply.
    ///
    /// A closed stream is kept until the peer answers its close request and
    /// every data fragment still in flight, whether the answer is a result
    /// or an error. If the peer never answers, the stream stays registered
    /// until the owner calls [`BytestreamRegistry::remove`].
    pub fn reap_closed(&mut self) -> Vec<StreamKey> {
        let finished: Vec<StreamKey> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.state().is_closed() && stream.outstanding_requests() == 0)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &finished {
            self.streams.remove(key);
            debug!(peer = %key.peer, sid = %key.sid, "bytestream removed");
        }
        finished
    }

    /// Registered key for a request from `from`: a stream registered with
    /// the full address wins over one registered with the bare address.
    fn lookup(&self, from: Option<&Jid>, sid: &str) -> Option<StreamKey> {
        let from = from?.to_string();
        [from.as_str(), bare_address(&from)]
            .into_iter()
            .map(|peer| StreamKey::new(peer, sid))
            .find(|key| self.streams.contains_key(key))
    }

    fn reply_error(&mut self, request: &Iq, error: &ProtocolError) {
        if let Err(send_error) = self
            .channel
            .send_error_reply(request, error.to_stanza_error())
        {
            warn!(id = %request.id, error = %send_error, "failed to send IBB error reply");
        }
    }
}

fn key_of<C: StanzaChannel>(stream: &IbbBytestream<C>) -> StreamKey {
    StreamKey::new(stream.peer_jid().to_string(), stream.stream_id())
}

fn bare_address(address: &str) -> &str {
    address.split_once('/').map_or(address, |(bare, _)| bare)
}

fn peer_matches(registered: &str, from: &str) -> bool {
    registered == from || registered == bare_address(from)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use xmpp_parsers::stanza_error::DefinedCondition;

    use super::*;
    use crate::bytestream::BytestreamState;
    use crate::bytestream::testing::{
        PEER, RecordingChannel, Sent, data_iq, peer_close_iq, peer_open_iq, reply_error,
        reply_result,
    };

    fn registry() -> BytestreamRegistry<RecordingChannel> {
        BytestreamRegistry::new(RecordingChannel::default())
    }

    fn full_params(sid: &str) -> BytestreamParams {
        BytestreamParams::new("romeo@montague.lit", sid).with_resource("orchard")
    }

    fn open_request(registry: &mut BytestreamRegistry<RecordingChannel>, key: &StreamKey) -> Iq {
        let stream = registry.get_mut(key).unwrap();
        stream.channel_mut().take_requests().remove(0)
    }

    #[test]
    fn initiated_stream_opens_on_routed_reply() {
        let mut registry = registry();
        let key = registry.initiate(full_params("s1")).unwrap();
        assert_eq!(key, StreamKey::new(PEER, "s1"));

        let open = open_request(&mut registry, &key);
        assert_matches!(
            registry.handle_iq(reply_result(&open)),
            IqRouting::Handled
        );

        assert_eq!(registry.get(&key).unwrap().state(), BytestreamState::Open);
        assert_eq!(
            registry.drain_events(),
            vec![(key, BytestreamEvent::StateChanged(BytestreamState::Open))]
        );
    }

    #[test]
    fn duplicate_stream_is_refused() {
        let mut registry = registry();
        registry.initiate(full_params("s1")).unwrap();

        assert_matches!(
            registry.initiate(full_params("s1")),
            Err(BytestreamError::DuplicateStream { .. })
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_sid_for_same_contact_is_refused_across_resources() {
        let mut registry = registry();
        let key = registry.initiate(full_params("s1")).unwrap();

        assert_matches!(
            registry.initiate(BytestreamParams::new("romeo@montague.lit", "s1")),
            Err(BytestreamError::DuplicateStream { .. })
        );
        assert_matches!(
            registry.offer(
                BytestreamParams::new("romeo@montague.lit", "s1")
                    .with_resource("garden")
                    .with_stream_init_id("si-2")
            ),
            Err(BytestreamError::DuplicateStream { .. })
        );
        assert_eq!(registry.len(), 1);

        let open = open_request(&mut registry, &key);
        registry.handle_iq(reply_result(&open));
        assert_eq!(registry.get(&key).unwrap().state(), BytestreamState::Open);
    }

    #[test]
    fn same_sid_for_different_contacts_is_allowed() {
        let mut registry = registry();
        let romeo = registry.initiate(full_params("s1")).unwrap();
        let mercutio = registry
            .initiate(BytestreamParams::new("mercutio@verona.lit", "s1").with_resource("street"))
            .unwrap();

        let open = open_request(&mut registry, &romeo);
        registry.handle_iq(reply_result(&open));

        assert_eq!(registry.get(&romeo).unwrap().state(), BytestreamState::Open);
        assert_eq!(
            registry.get(&mercutio).unwrap().state(),
            BytestreamState::Initiating
        );
    }

    #[test]
    fn reply_from_another_peer_is_not_consumed() {
        let mut registry = registry();
        let key = registry.initiate(full_params("s1")).unwrap();
        let mut reply = reply_result(&open_request(&mut registry, &key));
        reply.from = Some("mercutio@verona.lit/street".parse().unwrap());

        assert_matches!(registry.handle_iq(reply), IqRouting::Unhandled(_));
        assert_eq!(
            registry.get(&key).unwrap().state(),
            BytestreamState::Initiating
        );
    }

    #[test]
    fn data_for_unknown_stream_gets_item_not_found() {
        let mut registry = registry();

        assert_matches!(
            registry.handle_iq(data_iq("d1", "nope", 0, b"x")),
            IqRouting::Handled
        );
        assert_eq!(
            registry.channel().sent,
            vec![Sent::Error("d1".to_string(), DefinedCondition::ItemNotFound)]
        );
    }

    #[test]
    fn unsolicited_open_gets_not_acceptable() {
        let mut registry = registry();
        registry.handle_iq(peer_open_iq("o1", "s9", 4096));

        assert_eq!(
            registry.channel().sent,
            vec![Sent::Error("o1".to_string(), DefinedCondition::NotAcceptable)]
        );
    }

    #[test]
    fn malformed_request_gets_bad_request() {
        let mut registry = registry();
        let mut iq = peer_close_iq("c1", "s1");
        if let IqType::Set(payload) = &mut iq.payload {
            *payload = Element::builder("close", stanza::NS_IBB).build();
        }

        registry.handle_iq(iq);
        assert_eq!(
            registry.channel().sent,
            vec![Sent::Error("c1".to_string(), DefinedCondition::BadRequest)]
        );
    }

    #[test]
    fn foreign_iq_is_handed_back() {
        let mut registry = registry();
        let mut iq = data_iq("p1", "s1", 0, b"");
        iq.payload = IqType::Set(Element::builder("ping", "urn:xmpp:ping").build());

        assert_matches!(registry.handle_iq(iq), IqRouting::Unhandled(iq) if iq.id == "p1");
        assert!(registry.channel().sent.is_empty());
    }

    #[test]
    fn accepted_offer_registered_by_bare_address_receives_open() {
        let mut registry = registry();
        let key = registry
            .offer(BytestreamParams::new("romeo@montague.lit", "s1").with_stream_init_id("si-1"))
            .unwrap();
        registry.get_mut(&key).unwrap().accept(|_| {}).unwrap();

        registry.handle_iq(peer_open_iq("o1", "s1", 4096));
        registry.handle_iq(data_iq("d1", "s1", 0, b"payload"));

        let stream = registry.get(&key).unwrap();
        assert_eq!(stream.state(), BytestreamState::Open);
        assert!(stream.channel().sent.contains(&Sent::Ack("d1".to_string())));
        let data: Vec<_> = registry
            .drain_events()
            .into_iter()
            .filter_map(|(_, event)| match event {
                BytestreamEvent::DataReceived { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(data, vec![b"payload".to_vec()]);
    }

    #[test]
    fn message_data_is_routed() {
        let mut registry = registry();
        let key = registry.initiate(full_params("s1")).unwrap();
        let open = open_request(&mut registry, &key);
        registry.handle_iq(reply_result(&open));
        registry.drain_events();

        assert!(registry.handle_message(&RecordingChannel::data_message("s1", 0, b"hi")));
        assert!(!registry.handle_message(&RecordingChannel::data_message("s2", 0, b"hi")));
        assert_eq!(registry.drain_events().len(), 1);
    }

    #[test]
    fn reap_waits_for_close_reply() {
        let mut registry = registry();
        let key = registry.initiate(full_params("s1")).unwrap();
        let open = open_request(&mut registry, &key);
        registry.handle_iq(reply_result(&open));

        registry.get_mut(&key).unwrap().close(None);
        assert!(registry.reap_closed().is_empty());

        let close = open_request(&mut registry, &key);
        registry.handle_iq(reply_result(&close));
        assert_eq!(registry.reap_closed(), vec![key]);
        assert!(registry.is_empty());
    }

    #[test]
    fn close_answered_with_error_is_reaped() {
        let mut registry = registry();
        let key = registry.initiate(full_params("s1")).unwrap();
        let open = open_request(&mut registry, &key);
        registry.handle_iq(reply_result(&open));

        registry.get_mut(&key).unwrap().close(None);
        let close = open_request(&mut registry, &key);
        registry.handle_iq(reply_error(&close));

        assert_eq!(registry.reap_closed(), vec![key]);
    }

    #[test]
    fn peer_close_is_routed_and_stream_reaped() {
        let mut registry = registry();
        let key = registry.initiate(full_params("s1")).unwrap();
        let open = open_request(&mut registry, &key);
        registry.handle_iq(reply_result(&open));

        registry.handle_iq(peer_close_iq("c1", "s1"));

        let stream = registry.get(&key).unwrap();
        assert_eq!(stream.state(), BytestreamState::Closed);
        assert!(stream.channel().sent.contains(&Sent::Ack("c1".to_string())));
        assert_eq!(registry.reap_closed(), vec![key]);
    }
}
