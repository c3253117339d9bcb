//! The RFC 793 connection state diagram.

/// TCP connection states (RFC 793).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TcpState {
    #[default]
    Closed = 0,
    Listen = 1,
    SynSent = 2,
    SynRcvd = 3,
    Established = 4,
    FinWait1 = 5,
    FinWait2 = 6,
    CloseWait = 7,
    Closing = 8,
    LastAck = 9,
    TimeWait = 10,
}

/// Events driving the state diagram, derived from user calls, arriving
/// segments and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpEvent {
    PassiveOpen,
    ActiveOpen,
    SynReceived,
    SynAckReceived,
    AckReceived,
    FinReceived,
    Close,
    Timeout,
    RstReceived,
}

/// Applies one event to a state.
///
/// Events not listed for the current state leave it unchanged; the caller
/// can detect an ignored event by comparing the result against the input.
#[must_use]
pub fn transition(state: TcpState, event: TcpEvent) -> TcpState {
    use TcpEvent::*;
    use TcpState::*;

    match (state, event) {
        (Closed, PassiveOpen) => Listen,
        (Closed, ActiveOpen) => SynSent,

        (Listen, SynReceived) => SynRcvd,
        (Listen, Close) => Closed,

        (SynSent, SynAckReceived) => Established,
        (SynSent, SynReceived) => SynRcvd,
        (SynSent, Close | Timeout | RstReceived) => Closed,

        (SynRcvd, AckReceived) => Established,
        (SynRcvd, Close | RstReceived) => Closed,

        (Established, Close) => FinWait1,
        (Established, FinReceived) => CloseWait,
        (Established, RstReceived) => Closed,

        (FinWait1, AckReceived) => FinWait2,
        (FinWait1, FinReceived) => Closing,
        (FinWait1, RstReceived) => Closed,

        (FinWait2, FinReceived) => TimeWait,
        (FinWait2, RstReceived) => Closed,

        (CloseWait, Close) => LastAck,
        (CloseWait, RstReceived) => Closed,

        (Closing, AckReceived) => TimeWait,
        (Closing, RstReceived) => Closed,

        (LastAck, AckReceived | RstReceived) => Closed,

        (TimeWait, Timeout | RstReceived) => Closed,

        _ => state,
    }
}

impl TcpState {
    /// Data may be handed to the send path in these states.
    #[must_use]
    pub fn can_send_data(self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    /// Inbound payload is accepted in these states.
    #[must_use]
    pub fn can_receive_data(self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    }

    /// True once the receive side of the stream cannot produce more data,
    /// because the peer's FIN was processed or the connection died.
    #[must_use]
    pub fn rx_done(self) -> bool {
        matches!(
            self,
            TcpState::CloseWait
                | TcpState::Closing
                | TcpState::LastAck
                | TcpState::TimeWait
                | TcpState::Closed
        )
    }
}
