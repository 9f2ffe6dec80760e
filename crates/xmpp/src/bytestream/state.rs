#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BytestreamState {
    /// Created locally; the open request has not been answered yet.
    Initiating,
    /// Offered by the peer and not yet accepted or declined.
    LocalPending,
    /// Offer accepted; waiting for the peer's open request.
    Accepted,
    Open,
    /// Close requested while the write buffer was still draining.
    Closing,
    Closed,
}

impl BytestreamState {
    /// Whether moving from `self` to `next` is a legal step forward.
    pub fn can_transition_to(self, next: BytestreamState) -> bool {
        use BytestreamState::*;

        matches!(
            (self, next),
            (Initiating, Open)
                | (Initiating, Closed)
                | (LocalPending, Accepted)
                | (LocalPending, Closed)
                | (Accepted, Open)
                | (Accepted, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        matches!(self, BytestreamState::Closed)
    }
}
