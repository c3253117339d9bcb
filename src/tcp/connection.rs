//! Per-connection state machine and reliability engine.

use std::collections::VecDeque;
use std::io::{Error, ErrorKind, Result};
use std::time::Instant;

use super::{transition, Config, Quad, RttEstimator, TcpEvent, TcpFlags, TcpPacket, TcpState};

/// State of the send sequence space (RFC 793 S3.2).
///
/// ```text
///        1         2          3          4
///   ----------|----------|----------|----------
///          SND.UNA    SND.NXT    SND.UNA
///                               +SND.WND
/// ```
///
/// `[una, nxt)` is the data in flight; everything in that range is covered
/// by an entry of the unacknowledged-segment list.
#[derive(Debug, Clone, Copy)]
pub struct SendSeqSpace {
    /// initial send sequence number
    pub iss: u32,
    /// send unacknowledged
    pub una: u32,
    /// send next
    pub nxt: u32,
    /// peer's advertised receive window
    pub wnd: u16,
}

/// State of the receive sequence space (RFC 793 S3.2).
#[derive(Debug, Clone, Copy)]
pub struct RecvSeqSpace {
    /// receive next
    pub nxt: u32,
    /// advertised receive window
    pub wnd: u16,
}

/// What an unacknowledged entry re-frames to when it is retransmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Syn,
    SynAck,
    Data,
    Fin,
}

/// An entry of the unacknowledged-segment list.
///
/// SYN, SYN|ACK and FIN ride this list next to data, so the retransmission
/// sweep and the failure ceiling cover the whole connection lifecycle with
/// one mechanism.
#[derive(Debug)]
struct TxSegment {
    kind: SegmentKind,
    seq_no: u32,
    content: Vec<u8>,
    first_sent: Instant,
    last_sent: Instant,
    retransmits: u8,
}

impl TxSegment {
    fn seq_len(&self) -> u32 {
        let virtual_byte = !matches!(self.kind, SegmentKind::Data) as u32;
        self.content.len() as u32 + virtual_byte
    }

    fn end(&self) -> u32 {
        self.seq_no.wrapping_add(self.seq_len())
    }
}

/// One TCP connection: RFC 793 state, sequence spaces, the
/// unacknowledged-segment list and the in-order receive buffer.
///
/// The connection never touches the network itself; segments it wants to
/// transmit are queued on `outgoing` and drained by the connection manager
/// (or by a test harness).
pub struct Connection {
    pub quad: Quad,
    pub state: TcpState,
    pub send: SendSeqSpace,
    pub recv: RecvSeqSpace,
    pub last_activity: Instant,

    unacked: VecDeque<TxSegment>,
    rx_buffer: VecDeque<u8>,
    rtt: RttEstimator,
    /// Sequence number our FIN consumed, once one was sent.
    fin_seq_no: Option<u32>,
    time_wait_since: Option<Instant>,
    /// Why the connection died, if it did not close cleanly.
    reset: Option<ErrorKind>,

    pub(crate) outgoing: VecDeque<TcpPacket>,
    cfg: Config,
}

impl Connection {
    /// Actively opens a connection: CLOSED -> SYN_SENT, SYN on the wire.
    pub fn connect(quad: Quad, cfg: Config) -> Connection {
        let iss = cfg.initial_seq_no();
        let mut c = Connection::with_state(quad, iss, cfg);
        c.set_state(transition(TcpState::Closed, TcpEvent::ActiveOpen));
        c.enqueue_segment(SegmentKind::Syn, Vec::new());
        c
    }

    /// Passively opens a connection from a SYN that matched a listener:
    /// LISTEN -> SYN_RECEIVED, SYN|ACK on the wire.
    pub fn accept(quad: Quad, syn: &TcpPacket, cfg: Config) -> Connection {
        debug_assert!(syn.flags.contains(TcpFlags::SYN));

        let iss = cfg.initial_seq_no();
        let mut c = Connection::with_state(quad, iss, cfg);
        c.state = TcpState::Listen;
        c.recv.nxt = syn.seq_no.wrapping_add(1);
        c.send.wnd = syn.window;
        c.set_state(transition(TcpState::Listen, TcpEvent::SynReceived));
        c.enqueue_segment(SegmentKind::SynAck, Vec::new());
        c
    }

    fn with_state(quad: Quad, iss: u32, cfg: Config) -> Connection {
        let now = cfg.now();
        Connection {
            quad,
            state: TcpState::Closed,
            send: SendSeqSpace {
                iss,
                una: iss,
                nxt: iss,
                wnd: 0,
            },
            recv: RecvSeqSpace {
                nxt: 0,
                wnd: cfg.recv_buffer_cap.min(u16::MAX as usize) as u16,
            },
            last_activity: now,
            unacked: VecDeque::new(),
            rx_buffer: VecDeque::new(),
            rtt: RttEstimator::new(cfg.initial_rto),
            fin_seq_no: None,
            time_wait_since: None,
            reset: None,
            outgoing: VecDeque::new(),
            cfg,
        }
    }

    // # Queries

    pub fn is_established(&self) -> bool {
        self.state == TcpState::Established
    }

    /// The error a dead connection reports to the application, if any.
    pub fn reset_error(&self) -> Option<ErrorKind> {
        self.reset
    }

    pub fn readable(&self) -> bool {
        !self.rx_buffer.is_empty()
    }

    /// True once no further data can reach the receive buffer.
    pub fn rx_closed(&self) -> bool {
        self.reset.is_some() || self.state.rx_done()
    }

    /// Unacknowledged sequence footprint, `snd.nxt - snd.una`.
    pub fn bytes_in_flight(&self) -> u32 {
        self.send.nxt.wrapping_sub(self.send.una)
    }

    /// min(own capacity, peer's advertised window)
    pub fn effective_window(&self) -> u32 {
        self.cfg.send_window_cap.min(u32::from(self.send.wnd))
    }

    /// The current retransmission timeout.
    pub fn rto(&self) -> std::time::Duration {
        self.rtt.rto()
    }

    fn recv_window(&self) -> u16 {
        (self.cfg.recv_buffer_cap - self.rx_buffer.len()).min(u16::MAX as usize) as u16
    }

    // # Application surface

    /// Frames as much of `buf` as the effective window allows and returns the
    /// number of bytes committed to the wire. Never blocks.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if let Some(kind) = self.reset {
            return Err(Error::new(kind, "connection is dead"));
        }
        if !self.state.can_send_data() {
            return Err(Error::new(ErrorKind::NotConnected, "peer unreachable in this state"));
        }

        let mut written = 0;
        while written < buf.len() {
            let space = self.effective_window().saturating_sub(self.bytes_in_flight());
            if space == 0 {
                break;
            }
            let chunk = (buf.len() - written)
                .min(self.cfg.mss as usize)
                .min(space as usize);
            self.enqueue_segment(SegmentKind::Data, buf[written..written + chunk].to_vec());
            written += chunk;
        }

        tracing::trace!(
            "write committed {}/{} bytes (in flight {})",
            written,
            buf.len(),
            self.bytes_in_flight()
        );
        Ok(written)
    }

    /// Moves in-order data out of the receive buffer. Returns 0 when the
    /// buffer is empty; blocking is the socket layer's business.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let was_full = self.rx_buffer.len() >= self.cfg.recv_buffer_cap;

        let n = buf.len().min(self.rx_buffer.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx_buffer.drain(..n)) {
            *slot = byte;
        }

        if n > 0 {
            self.recv.wnd = self.recv_window();
            // a sender stalled on a closed window learns of the free space
            if was_full && self.reset.is_none() && !self.state.rx_done() {
                self.push_ack();
            }
        }
        n
    }

    /// Initiates the local half of the teardown. Idempotent; events not
    /// accepted in the current state are ignored.
    pub fn close(&mut self) {
        let next = transition(self.state, TcpEvent::Close);
        if next == self.state {
            return;
        }

        if matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            self.fin_seq_no = Some(self.send.nxt);
            self.enqueue_segment(SegmentKind::Fin, Vec::new());
        }
        self.set_state(next);
    }

    // # Segment ingress

    /// Drives the state machine with one validated, demultiplexed segment.
    pub fn on_segment(&mut self, pkt: TcpPacket) {
        self.last_activity = self.cfg.now();

        if pkt.flags.contains(TcpFlags::RST) {
            self.on_rst();
            return;
        }

        if pkt.flags.contains(TcpFlags::SYN) {
            if pkt.flags.contains(TcpFlags::ACK) {
                self.on_syn_ack(&pkt);
            } else {
                self.on_syn(&pkt);
            }
            return;
        }

        if pkt.flags.contains(TcpFlags::ACK) {
            self.on_ack(&pkt);
        }

        if !pkt.content.is_empty() {
            self.on_data(&pkt);
        }

        if pkt.flags.contains(TcpFlags::FIN) {
            self.on_fin(&pkt);
        }
    }

    fn on_rst(&mut self) {
        let next = transition(self.state, TcpEvent::RstReceived);
        if next == self.state {
            return;
        }
        tracing::debug!("{:?} received RST, aborting", self.quad);
        self.abort(ErrorKind::ConnectionReset);
    }

    fn on_syn_ack(&mut self, pkt: &TcpPacket) {
        match self.state {
            TcpState::SynSent => {
                if pkt.ack_no != self.send.iss.wrapping_add(1) {
                    tracing::debug!(
                        "{:?} SYN|ACK acks {} instead of our SYN, dropped",
                        self.quad,
                        pkt.ack_no
                    );
                    return;
                }
                self.recv.nxt = pkt.seq_no.wrapping_add(1);
                self.send.wnd = pkt.window;
                self.process_ack(pkt.ack_no);
                self.set_state(transition(self.state, TcpEvent::SynAckReceived));
                self.push_ack();
            }
            // our handshake ACK was lost; answer the repeated SYN|ACK
            TcpState::Established => self.push_ack(),
            _ => {}
        }
    }

    fn on_syn(&mut self, pkt: &TcpPacket) {
        match self.state {
            TcpState::SynSent => {
                // crossing SYNs; the state diagram falls back to the
                // passive-side handshake
                self.recv.nxt = pkt.seq_no.wrapping_add(1);
                self.send.wnd = pkt.window;
                if let Some(front) = self.unacked.front_mut() {
                    if front.kind == SegmentKind::Syn {
                        front.kind = SegmentKind::SynAck;
                    }
                }
                self.set_state(transition(self.state, TcpEvent::SynReceived));
                self.push_front_frame(SegmentKind::SynAck);
            }
            TcpState::SynRcvd => {
                // our SYN|ACK was lost, repeat it
                self.push_front_frame(SegmentKind::SynAck);
            }
            _ => {}
        }
    }

    /// Re-emits the front handshake segment without touching its timers.
    fn push_front_frame(&mut self, kind: SegmentKind) {
        let pkt = match self.unacked.front() {
            Some(front) if front.kind == kind => self.frame_for(front),
            _ => return,
        };
        self.outgoing.push_back(pkt);
    }

    fn on_ack(&mut self, pkt: &TcpPacket) {
        // the most recent segment overrides the peer window
        self.send.wnd = pkt.window;

        if !self.process_ack(pkt.ack_no) {
            return;
        }

        match self.state {
            TcpState::SynRcvd => {
                if self.send.una == self.send.iss.wrapping_add(1) {
                    self.set_state(transition(self.state, TcpEvent::AckReceived));
                }
            }
            TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck => {
                // only the acknowledgment covering our FIN moves the state
                if let Some(fin_seq) = self.fin_seq_no {
                    if self.send.una == fin_seq.wrapping_add(1) {
                        self.set_state(transition(self.state, TcpEvent::AckReceived));
                    }
                }
            }
            _ => {}
        }
    }

    /// Cumulative acknowledgment processing. Returns whether `snd.una`
    /// advanced; duplicate and stale ACKs are no-ops.
    fn process_ack(&mut self, ack_no: u32) -> bool {
        if !wrapping_lt(self.send.una, ack_no) {
            return false;
        }
        if wrapping_lt(self.send.nxt, ack_no) {
            tracing::debug!("{:?} ACK {} beyond snd.nxt, dropped", self.quad, ack_no);
            return false;
        }

        let now = self.cfg.now();
        let mut sample = None;
        while let Some(seg) = self.unacked.front() {
            if !wrapping_le(seg.end(), ack_no) {
                break;
            }
            // Karn's rule: only segments sent exactly once yield a sample
            if seg.retransmits == 0 {
                sample = Some(now.duration_since(seg.first_sent));
            }
            self.unacked.pop_front();
        }
        if let Some(rtt) = sample {
            self.rtt.sample(rtt);
        }

        self.send.una = ack_no;
        tracing::trace!(
            "{:?} ack {} leaves {} bytes in flight (rto {:?})",
            self.quad,
            ack_no,
            self.bytes_in_flight(),
            self.rtt.rto()
        );
        self.check_invariants();
        true
    }

    fn on_data(&mut self, pkt: &TcpPacket) {
        if !self.state.can_receive_data() {
            return;
        }

        if pkt.seq_no != self.recv.nxt {
            tracing::debug!(
                "{:?} out-of-order segment (seq {}, expected {}), dropped",
                self.quad,
                pkt.seq_no,
                self.recv.nxt
            );
            // solicit the retransmission of the contiguous stream
            self.push_ack();
            return;
        }

        let room = self.cfg.recv_buffer_cap - self.rx_buffer.len();
        let taken = room.min(pkt.content.len());
        self.rx_buffer.extend(&pkt.content[..taken]);
        self.recv.nxt = self.recv.nxt.wrapping_add(taken as u32);
        self.recv.wnd = self.recv_window();
        self.push_ack();
    }

    fn on_fin(&mut self, pkt: &TcpPacket) {
        let fin_end = pkt
            .seq_no
            .wrapping_add(pkt.content.len() as u32)
            .wrapping_add(1);

        if self.recv.nxt == fin_end {
            // retransmitted FIN whose ACK was lost
            self.push_ack();
            return;
        }
        if self.recv.nxt != pkt.seq_no.wrapping_add(pkt.content.len() as u32) {
            tracing::debug!("{:?} FIN ahead of missing data, dropped", self.quad);
            return;
        }

        let next = transition(self.state, TcpEvent::FinReceived);
        if next == self.state {
            return;
        }

        self.recv.nxt = fin_end;
        self.push_ack();
        self.set_state(next);
    }

    // # Timers

    /// One sweep of the retransmission and TIME_WAIT timers.
    pub fn on_tick(&mut self) {
        let now = self.cfg.now();

        if self.state == TcpState::TimeWait {
            if let Some(since) = self.time_wait_since {
                if now.duration_since(since) >= self.cfg.time_wait {
                    self.set_state(transition(self.state, TcpEvent::Timeout));
                }
            }
            return;
        }
        if self.state == TcpState::Closed {
            return;
        }

        let rto = self.rtt.rto();
        let mut frames = Vec::new();
        let mut exhausted = false;
        for i in 0..self.unacked.len() {
            if now.duration_since(self.unacked[i].last_sent) < rto {
                continue;
            }
            if self.unacked[i].retransmits >= self.cfg.max_retransmits {
                exhausted = true;
                break;
            }
            self.unacked[i].retransmits += 1;
            self.unacked[i].last_sent = now;
            tracing::debug!(
                "{:?} retransmitting seq {} (attempt {})",
                self.quad,
                self.unacked[i].seq_no,
                self.unacked[i].retransmits
            );
            frames.push(self.frame_for(&self.unacked[i]));
        }
        self.outgoing.extend(frames);

        if exhausted {
            tracing::warn!("{:?} retransmission ceiling reached", self.quad);
            self.fail_retransmit();
        }
    }

    /// The retransmission ceiling abandoned the connection.
    ///
    /// SYN_SENT closes through the diagram's TIMEOUT edge; in synchronized
    /// states the give-up is an abort, which lands in CLOSED as well.
    fn fail_retransmit(&mut self) {
        self.abort(ErrorKind::TimedOut);
    }

    fn abort(&mut self, kind: ErrorKind) {
        self.reset = Some(kind);
        self.unacked.clear();
        self.outgoing.clear();
        self.set_state(TcpState::Closed);
    }

    // # Egress

    /// The single place where sequence numbers are assigned: one per payload
    /// byte, one virtual byte for SYN and FIN.
    fn enqueue_segment(&mut self, kind: SegmentKind, content: Vec<u8>) {
        let now = self.cfg.now();
        let seg = TxSegment {
            kind,
            seq_no: self.send.nxt,
            content,
            first_sent: now,
            last_sent: now,
            retransmits: 0,
        };
        self.send.nxt = self.send.nxt.wrapping_add(seg.seq_len());
        self.last_activity = now;

        let pkt = self.frame_for(&seg);
        self.unacked.push_back(seg);
        self.outgoing.push_back(pkt);
        self.check_invariants();
    }

    fn frame_for(&self, seg: &TxSegment) -> TcpPacket {
        let src_port = self.quad.src.port();
        let dst_port = self.quad.dst.port();
        let window = self.recv_window();
        match seg.kind {
            SegmentKind::Syn => TcpPacket::syn(src_port, dst_port, seg.seq_no, window),
            SegmentKind::SynAck => TcpPacket {
                src_port,
                dst_port,
                seq_no: seg.seq_no,
                ack_no: self.recv.nxt,
                flags: TcpFlags::SYN | TcpFlags::ACK,
                window,
                urgent_ptr: 0,
                content: Vec::new(),
            },
            SegmentKind::Data => TcpPacket::data(
                src_port,
                dst_port,
                seg.seq_no,
                self.recv.nxt,
                window,
                seg.content.clone(),
            ),
            SegmentKind::Fin => {
                TcpPacket::fin(src_port, dst_port, seg.seq_no, self.recv.nxt, window)
            }
        }
    }

    fn push_ack(&mut self) {
        self.outgoing.push_back(TcpPacket::ack(
            self.quad.src.port(),
            self.quad.dst.port(),
            self.send.nxt,
            self.recv.nxt,
            self.recv_window(),
        ));
    }

    /// Next segment waiting for the wire, if any.
    pub(crate) fn pop_outgoing(&mut self) -> Option<TcpPacket> {
        self.outgoing.pop_front()
    }

    fn set_state(&mut self, next: TcpState) {
        if next == self.state {
            return;
        }
        tracing::trace!("{:?} {:?} -> {:?}", self.quad, self.state, next);
        self.state = next;
        if next == TcpState::TimeWait {
            self.time_wait_since = Some(self.cfg.now());
        }
        if next == TcpState::Closed {
            self.unacked.clear();
        }
    }

    fn check_invariants(&self) {
        debug_assert!(wrapping_le(self.send.una, self.send.nxt));
        for seg in &self.unacked {
            debug_assert!(wrapping_le(self.send.una, seg.seq_no));
            debug_assert!(wrapping_le(seg.end(), self.send.nxt));
        }
    }
}

/// `lhs < rhs` in sequence-number space (RFC 1323 wrap rule).
fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    lhs.wrapping_sub(rhs) > (1 << 31)
}

fn wrapping_le(lhs: u32, rhs: u32) -> bool {
    lhs == rhs || wrapping_lt(lhs, rhs)
}

#[cfg(test)]
mod wrap_tests {
    use super::*;

    #[test]
    fn sequence_comparison_handles_wraparound() {
        assert!(wrapping_lt(1, 2));
        assert!(!wrapping_lt(2, 1));
        assert!(wrapping_lt(u32::MAX, 1));
        assert!(!wrapping_lt(1, u32::MAX));
        assert!(wrapping_le(7, 7));
    }
}
