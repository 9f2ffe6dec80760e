use std::collections::VecDeque;
use std::str::FromStr;

use tracing::{debug, info, warn};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::jid::Jid;
use xmpp_parsers::minidom::Element;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use super::stanza::{self, DataFragment, IbbRequest, OpenRequest};
use super::{BytestreamConfig, BytestreamEvent, BytestreamParams, BytestreamState};
use crate::channel::StanzaChannel;
use crate::error::{BytestreamError, ChannelError, ProtocolError};

/// A data fragment sent to the peer and not yet answered.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InFlight {
    request_id: String,
    seq: u16,
    len: usize,
}

#[derive(Debug)]
pub struct IbbBytestream<C: StanzaChannel> {
    channel: C,
    stream_id: String,
    stream_init_id: Option<String>,
    peer_jid: Jid,
    state: BytestreamState,
    config: BytestreamConfig,

    send_sequence: u16,
    next_request: u64,
    last_seq_received: Option<u16>,
    pending_open: Option<String>,
    close_request: Option<String>,

    outstanding: VecDeque<InFlight>,
    write_buffer: Option<Vec<u8>>,
    write_blocked: bool,

    read_buffer: Option<Vec<u8>>,
    read_blocked: bool,
    deferred_acks: VecDeque<Iq>,
    pending_close_ack: Option<Iq>,

    events: VecDeque<BytestreamEvent>,
}

impl<C: StanzaChannel> IbbBytestream<C> {
    /// A stream we will open ourselves with [`IbbBytestream::initiate`].
    pub fn initiator(channel: C, params: BytestreamParams) -> Result<Self, BytestreamError> {
        Self::new(channel, params, BytestreamState::Initiating)
    }

    /// A stream offered by the peer, waiting for [`IbbBytestream::accept`]
    /// or a decline through [`IbbBytestream::close`].
    pub fn offered(channel: C, params: BytestreamParams) -> Result<Self, BytestreamError> {
        if params.stream_init_id.is_none() {
            return Err(BytestreamError::MissingStreamInitId);
        }
        Self::new(channel, params, BytestreamState::LocalPending)
    }

    fn new(
        channel: C,
        params: BytestreamParams,
        state: BytestreamState,
    ) -> Result<Self, BytestreamError> {
        params
            .config
            .validate()
            .map_err(|error| BytestreamError::InvalidConfig(error.to_string()))?;
        let peer_jid = peer_address(&params.peer, params.peer_resource.as_deref())?;

        Ok(Self {
            channel,
            stream_id: params.stream_id,
            stream_init_id: params.stream_init_id,
            peer_jid,
            state,
            config: params.config,
            send_sequence: 0,
            next_request: 0,
            last_seq_received: None,
            pending_open: None,
            close_request: None,
            outstanding: VecDeque::new(),
            write_buffer: None,
            write_blocked: false,
            read_buffer: None,
            read_blocked: false,
            deferred_acks: VecDeque::new(),
            pending_close_ack: None,
            events: VecDeque::new(),
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn stream_init_id(&self) -> Option<&str> {
        self.stream_init_id.as_deref()
    }

    pub fn peer_jid(&self) -> &Jid {
        &self.peer_jid
    }

    pub fn state(&self) -> BytestreamState {
        self.state
    }

    pub fn block_size(&self) -> u16 {
        self.config.block_size
    }

    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    pub fn is_write_blocked(&self) -> bool {
        self.write_blocked
    }

    pub fn is_read_blocked(&self) -> bool {
        self.read_blocked
    }

    /// Data fragments currently occupying the send window.
    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    /// Every request still waiting for a reply: data, open and close.
    pub fn outstanding_requests(&self) -> usize {
        self.outstanding.len()
            + usize::from(self.pending_open.is_some())
            + usize::from(self.close_request.is_some())
    }

    pub fn buffered_write_len(&self) -> usize {
        self.write_buffer.as_ref().map_or(0, Vec::len)
    }

    pub fn buffered_read_len(&self) -> usize {
        self.read_buffer.as_ref().map_or(0, Vec::len)
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn poll_event(&mut self) -> Option<BytestreamEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<BytestreamEvent> {
        self.events.drain(..).collect()
    }

    /// Send the `<open/>` request. The stream becomes open once the peer
    /// answers it (see [`IbbBytestream::handle_reply`]).
    pub fn initiate(&mut self) -> Result<(), BytestreamError> {
        if self.state != BytestreamState::Initiating {
            debug!(sid = %self.stream_id, state = ?self.state, "bytestream is not initiating");
            return Err(BytestreamError::NotInitiating { state: self.state });
        }
        if self.pending_open.is_some() {
            return Err(BytestreamError::OpenAlreadyRequested);
        }

        let request_id = self.next_request_id();
        let open = stanza::build_open(
            &self.peer_jid,
            &request_id,
            &self.stream_id,
            self.config.block_size,
        );

        if let Err(error) = self.channel.send_with_reply(open) {
            warn!(sid = %self.stream_id, %error, "failed to send IBB open request");
            self.set_state(BytestreamState::Closed);
            return Err(error.into());
        }

        debug!(sid = %self.stream_id, peer = %self.peer_jid, "IBB open request sent");
        self.pending_open = Some(request_id);
        Ok(())
    }

    /// Queue `data` for transmission.
    ///
    /// Returns `Ok` when every byte was either handed to the channel or
    /// buffered behind a full window. A channel failure closes the stream
    /// and discards whatever was not yet transmitted.
    pub fn send(&mut self, data: &[u8]) -> Result<(), BytestreamError> {
        if self.state != BytestreamState::Open {
            debug!(sid = %self.stream_id, state = ?self.state, "can't send through a bytestream that isn't open");
            return Err(BytestreamError::NotOpen { state: self.state });
        }

        if let Some(buffer) = self.write_buffer.as_mut() {
            debug!(sid = %self.stream_id, "write buffer is not empty, buffering data");
            buffer.extend_from_slice(data);
            return Ok(());
        }

        let (sent, failure) = self.send_chunks(data);
        if let Some(error) = failure {
            self.abort(&error);
            return Err(error.into());
        }

        if sent < data.len() {
            let remaining = data[sent..].to_vec();
            debug!(
                sid = %self.stream_id,
                buffered = remaining.len(),
                "window is full, write-blocking the bytestream"
            );
            self.write_buffer = Some(remaining);
            self.set_write_blocked(true);
        }

        Ok(())
    }

    /// Accept a `LocalPending` offer. `augment` receives the `<si/>` element
    /// of the reply so profile-specific data can be attached. A no-op in any
    /// other state.
    pub fn accept<F>(&mut self, augment: F) -> Result<(), BytestreamError>
    where
        F: FnOnce(&mut Element),
    {
        if self.state != BytestreamState::LocalPending {
            debug!(sid = %self.stream_id, state = ?self.state, "stream was already accepted or closed");
            return Ok(());
        }
        let Some(stream_init_id) = self.stream_init_id.clone() else {
            return Err(BytestreamError::MissingStreamInitId);
        };

        let mut si = stanza::build_si_accept();
        augment(&mut si);
        let reply = stanza::build_offer_reply(&self.peer_jid, &stream_init_id, si);
        self.channel.send(reply.into())?;

        info!(sid = %self.stream_id, peer = %self.peer_jid, "bytestream accepted");
        self.set_state(BytestreamState::Accepted);
        Ok(())
    }

    /// Mark an accepted stream as open when the open handshake was confirmed
    /// outside this instance. Returns whether the stream moved to `Open`.
    pub fn confirm_open(&mut self) -> bool {
        if self.state != BytestreamState::Accepted {
            return false;
        }
        self.set_state(BytestreamState::Open);
        true
    }

    /// Close the stream, declining it if the offer was never accepted.
    ///
    /// `reason` is only sent to the peer when declining. Closing an already
    /// closed stream does nothing.
    pub fn close(&mut self, reason: Option<StanzaError>) {
        if self.state.is_closed() {
            debug!(sid = %self.stream_id, "bytestream already closed");
            return;
        }

        self.reject_deferred_acks();
        if let Some(discarded) = self.read_buffer.take() {
            debug!(sid = %self.stream_id, bytes = discarded.len(), "discarding undelivered read buffer");
        }

        match self.state {
            BytestreamState::LocalPending => self.decline(reason),
            _ if self.write_buffer.is_some() => {
                debug!(sid = %self.stream_id, "write buffer is not empty, deferring close");
                self.set_state(BytestreamState::Closing);
            }
            _ => {
                self.send_close_handshake();
                self.set_state(BytestreamState::Closed);
            }
        }
    }

    /// Pause or resume delivery of inbound data. Resuming flushes everything
    /// buffered as one event and acknowledges the deferred requests in the
    /// order they arrived.
    pub fn set_read_blocked(&mut self, blocked: bool) {
        if self.read_blocked == blocked {
            return;
        }
        self.read_blocked = blocked;
        debug!(sid = %self.stream_id, blocked, "read blocking changed");

        if blocked {
            return;
        }

        if let Some(buffer) = self.read_buffer.take() {
            if !buffer.is_empty() {
                debug!(sid = %self.stream_id, bytes = buffer.len(), "flushing read buffer");
                self.events.push_back(BytestreamEvent::DataReceived {
                    from: self.peer_jid.clone(),
                    data: buffer,
                });
            }
        }

        while let Some(request) = self.deferred_acks.pop_front() {
            if let Err(error) = self.channel.ack_request(&request) {
                warn!(sid = %self.stream_id, id = %request.id, %error, "failed to acknowledge IBB data");
            }
        }
    }

    /// Handle an IBB request addressed to this stream.
    pub fn receive_iq(&mut self, iq: Iq) {
        let request = match stanza::parse_request(&iq) {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(sid = %self.stream_id, id = %iq.id, "ignoring non-IBB IQ");
                return;
            }
            Err(error) => {
                self.reply_error(&iq, &error);
                return;
            }
        };

        if request.sid() != self.stream_id {
            self.reply_error(&iq, &ProtocolError::UnknownStream);
            return;
        }

        match request {
            IbbRequest::Open(open) => self.receive_open(iq, &open),
            IbbRequest::Data(fragment) => self.receive_fragment(fragment, Some(iq)),
            IbbRequest::Close { .. } => self.receive_close(iq),
        }
    }

    /// Handle IBB data carried by a `<message/>`; such data is never acked.
    pub fn receive_message_data(&mut self, message: &Element) {
        match stanza::parse_message_data(message) {
            Some(Ok(fragment)) if fragment.sid == self.stream_id => {
                self.receive_fragment(fragment, None)
            }
            Some(Ok(fragment)) => {
                debug!(sid = %self.stream_id, other = %fragment.sid, "dropping message data for another stream")
            }
            Some(Err(error)) => {
                debug!(sid = %self.stream_id, ?error, "dropping malformed message data")
            }
            None => {}
        }
    }

    /// Consume the reply to one of our requests. Returns `false` when the
    /// reply does not belong to this stream.
    pub fn handle_reply(&mut self, reply: &Iq) -> bool {
        let accepted = match &reply.payload {
            IqType::Result(_) => true,
            IqType::Error(_) => false,
            IqType::Get(_) | IqType::Set(_) => return false,
        };
        let id = reply.id.as_str();

        if self.pending_open.as_deref() == Some(id) {
            self.pending_open = None;
            self.open_replied(accepted);
            return true;
        }

        if self.close_request.as_deref() == Some(id) {
            self.close_request = None;
            debug!(sid = %self.stream_id, accepted, "peer answered IBB close");
            return true;
        }

        let Some(index) = self.find_outstanding(id) else {
            return false;
        };
        if let Some(fragment) = self.outstanding.remove(index) {
            if !accepted {
                warn!(
                    sid = %self.stream_id,
                    seq = fragment.seq,
                    bytes = fragment.len,
                    "peer rejected an IBB data fragment"
                );
            }
        }

        self.flush_write_buffer();
        true
    }

    fn open_replied(&mut self, accepted: bool) {
        if self.state != BytestreamState::Initiating {
            debug!(sid = %self.stream_id, state = ?self.state, "ignoring late reply to IBB open");
            return;
        }

        if accepted {
            info!(sid = %self.stream_id, peer = %self.peer_jid, "IBB stream initiated");
            self.set_state(BytestreamState::Open);
        } else {
            info!(sid = %self.stream_id, peer = %self.peer_jid, "peer refused IBB stream");
            self.set_state(BytestreamState::Closed);
        }
    }

    fn receive_open(&mut self, iq: Iq, open: &OpenRequest) {
        if self.state != BytestreamState::Accepted {
            debug!(sid = %self.stream_id, state = ?self.state, "unexpected IBB open");
            self.reply_error(&iq, &ProtocolError::UnexpectedOpen);
            return;
        }

        debug!(sid = %self.stream_id, block_size = open.block_size, "peer opened the bytestream");
        // Never send chunks larger than the opener asked for.
        if open.block_size < self.config.block_size {
            debug!(
                sid = %self.stream_id,
                configured = self.config.block_size,
                requested = open.block_size,
                "lowering block size to the peer's limit"
            );
            self.config.block_size = open.block_size;
        }
        if let Err(error) = self.channel.ack_request(&iq) {
            self.abort(&error);
            return;
        }
        self.set_state(BytestreamState::Open);
    }

    fn receive_close(&mut self, iq: Iq) {
        if self.state.is_closed() || self.pending_close_ack.is_some() {
            self.ack(&iq);
            return;
        }

        debug!(sid = %self.stream_id, "received IBB close, closing the bytestream");
        self.pending_close_ack = Some(iq);
        self.close(None);

        // A declined offer has no close handshake of its own.
        if self.state.is_closed() {
            if let Some(close) = self.pending_close_ack.take() {
                self.ack(&close);
            }
        }
    }

    fn receive_fragment(&mut self, fragment: DataFragment, request: Option<Iq>) {
        if self.state != BytestreamState::Open {
            debug!(sid = %self.stream_id, state = ?self.state, "can't receive data through a bytestream that isn't open");
            if let Some(iq) = request {
                self.reply_error(&iq, &ProtocolError::NotOpen);
            }
            return;
        }

        let data = match fragment.decode() {
            Ok(data) => data,
            Err(error) => {
                debug!(sid = %self.stream_id, %error, "base64 decoding failed");
                if let Some(iq) = request {
                    self.reply_error(&iq, &ProtocolError::DecodeFailed);
                }
                return;
            }
        };
        self.track_sequence(fragment.seq);

        if self.read_blocked {
            let buffered = self.buffered_read_len();
            if buffered + data.len() > self.config.read_buffer_capacity {
                warn!(
                    sid = %self.stream_id,
                    buffered,
                    incoming = data.len(),
                    capacity = self.config.read_buffer_capacity,
                    "read buffer is full, closing the bytestream"
                );
                if let Some(iq) = request {
                    self.reply_error(&iq, &ProtocolError::BufferFull);
                }
                self.close(None);
                return;
            }

            debug!(sid = %self.stream_id, bytes = data.len(), "bytestream is read-blocked, buffering data");
            self.read_buffer.get_or_insert_with(Vec::new).extend_from_slice(&data);
            if let Some(iq) = request {
                self.deferred_acks.push_back(iq);
            }
            return;
        }

        self.events.push_back(BytestreamEvent::DataReceived {
            from: self.peer_jid.clone(),
            data,
        });
        if let Some(iq) = request {
            self.ack(&iq);
        }
    }

    /// Sequence numbers are advisory: gaps and repeats are logged, and the
    /// fragment is delivered anyway.
    fn track_sequence(&mut self, seq: u16) {
        let expected = self.last_seq_received.map_or(0, |last| last.wrapping_add(1));
        if seq != expected {
            warn!(sid = %self.stream_id, expected, received = seq, "unexpected IBB sequence number");
        }
        self.last_seq_received = Some(seq);
    }

    /// Send as much of `data` as the window allows. Returns the number of
    /// bytes handed to the channel and the failure that stopped the loop, if
    /// any.
    fn send_chunks(&mut self, data: &[u8]) -> (usize, Option<ChannelError>) {
        let block_size = usize::from(self.config.block_size);
        let mut sent = 0;
        let mut fragments = 0;

        while sent < data.len() {
            if self.outstanding.len() >= self.config.window_size {
                debug!(sid = %self.stream_id, window = self.outstanding.len(), "window is full, stop sending");
                break;
            }

            let end = data.len().min(sent + block_size);
            let chunk = &data[sent..end];
            let seq = self.send_sequence;
            let request_id = self.next_request_id();
            let iq = stanza::build_data(&self.peer_jid, &request_id, &self.stream_id, seq, chunk);

            if let Err(error) = self.channel.send_with_reply(iq) {
                return (sent, Some(error));
            }

            self.outstanding.push_back(InFlight {
                request_id,
                seq,
                len: chunk.len(),
            });
            self.send_sequence = seq.wrapping_add(1);
            sent = end;
            fragments += 1;
        }

        debug!(sid = %self.stream_id, sent, fragments, "sent IBB data");
        (sent, None)
    }

    fn flush_write_buffer(&mut self) {
        let Some(mut buffer) = self.write_buffer.take() else {
            return;
        };

        debug!(sid = %self.stream_id, "a fragment has been acked, flushing the write buffer");
        let (sent, failure) = self.send_chunks(&buffer);
        if let Some(error) = failure {
            self.abort(&error);
            return;
        }

        if sent < buffer.len() {
            buffer.drain(..sent);
            debug!(sid = %self.stream_id, remaining = buffer.len(), "write buffer not completely flushed");
            self.write_buffer = Some(buffer);
            return;
        }

        debug!(sid = %self.stream_id, "write buffer flushed, unblocking writes");
        self.set_write_blocked(false);

        if self.state == BytestreamState::Closing {
            debug!(sid = %self.stream_id, "write buffer drained, completing deferred close");
            self.send_close_handshake();
            self.set_state(BytestreamState::Closed);
        }
    }

    /// The channel can no longer carry our data: drop what is buffered and
    /// tear the stream down.
    fn abort(&mut self, error: &ChannelError) {
        warn!(sid = %self.stream_id, %error, "error sending IBB stanza, closing the bytestream");
        if let Some(discarded) = self.write_buffer.take() {
            debug!(sid = %self.stream_id, bytes = discarded.len(), "discarding write buffer");
        }
        self.set_write_blocked(false);
        self.close(None);
    }

    fn decline(&mut self, reason: Option<StanzaError>) {
        let error = reason.unwrap_or_else(|| {
            StanzaError::new(
                ErrorType::Cancel,
                DefinedCondition::Forbidden,
                "en",
                "Offer Declined",
            )
        });

        match self.stream_init_id.as_deref() {
            Some(stream_init_id) => {
                let decline = stanza::build_decline(&self.peer_jid, stream_init_id, error);
                if let Err(error) = self.channel.send(decline.into()) {
                    warn!(sid = %self.stream_id, %error, "failed to send decline");
                }
            }
            None => warn!(sid = %self.stream_id, "no offer id to decline"),
        }

        info!(sid = %self.stream_id, peer = %self.peer_jid, "bytestream offer declined");
        self.set_state(BytestreamState::Closed);
    }

    fn send_close_handshake(&mut self) {
        if let Some(close) = self.pending_close_ack.take() {
            debug!(sid = %self.stream_id, "acknowledging the peer's IBB close");
            self.ack(&close);
            return;
        }

        debug!(sid = %self.stream_id, "sending IBB close");
        let request_id = self.next_request_id();
        let close = stanza::build_close(&self.peer_jid, &request_id, &self.stream_id);
        match self.channel.send_with_reply(close) {
            Ok(()) => self.close_request = Some(request_id),
            Err(error) => warn!(sid = %self.stream_id, %error, "failed to send IBB close"),
        }
    }

    fn reject_deferred_acks(&mut self) {
        while let Some(request) = self.deferred_acks.pop_front() {
            self.reply_error(&request, &ProtocolError::StreamGone);
        }
    }

    fn ack(&mut self, request: &Iq) {
        if let Err(error) = self.channel.ack_request(request) {
            warn!(sid = %self.stream_id, id = %request.id, %error, "failed to acknowledge IBB request");
        }
    }

    fn reply_error(&mut self, request: &Iq, error: &ProtocolError) {
        debug!(sid = %self.stream_id, id = %request.id, ?error, "answering IBB request with an error");
        if let Err(send_error) = self
            .channel
            .send_error_reply(request, error.to_stanza_error())
        {
            warn!(sid = %self.stream_id, id = %request.id, error = %send_error, "failed to send IBB error reply");
        }
    }

    fn find_outstanding(&self, id: &str) -> Option<usize> {
        // Replies normally arrive in send order.
        match self.outstanding.front() {
            Some(front) if front.request_id == id => Some(0),
            _ => self
                .outstanding
                .iter()
                .position(|fragment| fragment.request_id == id),
        }
    }

    fn next_request_id(&mut self) -> String {
        let id = format!("ibb-{}-{}", self.stream_id, self.next_request);
        self.next_request += 1;
        id
    }

    fn set_write_blocked(&mut self, blocked: bool) {
        if self.write_blocked == blocked {
            return;
        }
        self.write_blocked = blocked;
        self.events
            .push_back(BytestreamEvent::WriteBlockedChanged(blocked));
    }

    fn set_state(&mut self, next: BytestreamState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            debug_assert!(false, "illegal bytestream transition {:?} -> {next:?}", self.state);
            warn!(sid = %self.stream_id, from = ?self.state, to = ?next, "ignoring illegal state transition");
            return;
        }

        debug!(sid = %self.stream_id, from = ?self.state, to = ?next, "bytestream state changed");
        self.state = next;
        self.events.push_back(BytestreamEvent::StateChanged(next));
    }
}

fn peer_address(peer: &str, resource: Option<&str>) -> Result<Jid, BytestreamError> {
    let address = match resource {
        Some(resource) => format!("{peer}/{resource}"),
        None => peer.to_string(),
    };
    Jid::from_str(&address)
        .map_err(|error| BytestreamError::InvalidPeer(format!("{address}: {error}")))
}
