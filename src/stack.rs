//! Connection manager and dispatcher.
//!
//! The [`Stack`] owns the raw endpoint, the listener table and the
//! connection table. Inbound datagrams are validated layer by layer and
//! demultiplexed by 4-tuple; a SYN that matches a listener births a new
//! connection. Outbound segments queued by connections are framed into IPv4
//! packets here and handed to the endpoint.
//!
//! Socket handles hold [`Weak`] references into the connection table; the
//! table's `Arc` is the single owner, so a handle must cope with its
//! connection having been destroyed.

use std::io::{ErrorKind, Result};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::ip::Ipv4Packet;
use crate::raw::{RawIo, RawSocket};
use crate::tcp::{Config, Connection, Quad, TcpFlags, TcpPacket, TcpState, PROTO_TCP};
use crate::{FromBytestream, ToBytestream};

/// A passive opener: SYNs whose destination matches are turned into
/// connections.
#[derive(Debug, Clone)]
struct Listener {
    addr: SocketAddrV4,
    backlog: usize,
}

impl Listener {
    fn matches(&self, dst: SocketAddrV4) -> bool {
        listener_matches(self.addr, dst)
    }
}

/// Whether a listener bound to `addr` services segments aimed at `dst`.
fn listener_matches(addr: SocketAddrV4, dst: SocketAddrV4) -> bool {
    addr.port() == dst.port() && (*addr.ip() == Ipv4Addr::UNSPECIFIED || addr.ip() == dst.ip())
}

/// A connection slot shared between the manager, the worker threads and the
/// socket handles.
///
/// The mutex is the coarse per-connection lock; the condvar wakes receivers
/// blocked on the buffer and openers blocked on the handshake.
pub struct ConnSlot {
    pub(crate) quad: Quad,
    pub(crate) from_listener: bool,
    pub(crate) dispensed: AtomicBool,
    pub(crate) inner: Mutex<Connection>,
    pub(crate) cv: Condvar,
}

impl ConnSlot {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock().unwrap()
    }
}

struct Tables {
    listeners: Vec<Listener>,
    conns: Vec<Arc<ConnSlot>>,
}

/// The connection manager: endpoint, listener table, connection table.
///
/// There is no process-wide instance; sockets receive their `Arc<Stack>`
/// explicitly.
pub struct Stack {
    endpoint: Box<dyn RawIo + Send + Sync>,
    tables: Mutex<Tables>,
    ident: AtomicU16,
    ephemeral: AtomicU16,
    config: Config,
}

impl Stack {
    /// Builds a stack over an arbitrary endpoint, usually a
    /// [`LoopbackIo`](crate::raw::LoopbackIo) in tests.
    pub fn new(endpoint: Box<dyn RawIo + Send + Sync>, config: Config) -> Arc<Stack> {
        Arc::new(Stack {
            endpoint,
            tables: Mutex::new(Tables {
                listeners: Vec::new(),
                conns: Vec::new(),
            }),
            ident: AtomicU16::new(1),
            ephemeral: AtomicU16::new(0),
            config,
        })
    }

    /// Opens a raw socket endpoint. Fails without the privileges raw
    /// sockets require.
    pub fn open(config: Config) -> Result<Arc<Stack>> {
        let endpoint = RawSocket::new()?;
        Ok(Stack::new(Box::new(endpoint), config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ports handed out to unbound active openers.
    pub(crate) fn alloc_ephemeral_port(&self) -> u16 {
        let n = self.ephemeral.fetch_add(1, Ordering::Relaxed);
        49152 + n % 16384
    }

    // # Listeners

    pub(crate) fn listen(&self, addr: SocketAddrV4, backlog: usize) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.listeners.iter().any(|l| l.addr.port() == addr.port()) {
            return Err(std::io::Error::new(ErrorKind::AddrInUse, "port already listened on"));
        }
        tracing::debug!("listening on {addr}");
        tables.listeners.push(Listener { addr, backlog });
        Ok(())
    }

    pub(crate) fn unlisten(&self, addr: SocketAddrV4) {
        let mut tables = self.tables.lock().unwrap();
        tables.listeners.retain(|l| l.addr != addr);
    }

    // # Active and passive open

    /// Creates an actively-opening connection and puts its SYN on the wire.
    pub(crate) fn connect(&self, local: SocketAddrV4, peer: SocketAddrV4) -> Arc<ConnSlot> {
        let quad = Quad {
            src: local,
            dst: peer,
        };
        let conn = Connection::connect(quad, self.config.clone());
        let slot = Arc::new(ConnSlot {
            quad,
            from_listener: false,
            dispensed: AtomicBool::new(true),
            inner: Mutex::new(conn),
            cv: Condvar::new(),
        });

        {
            let mut tables = self.tables.lock().unwrap();
            // a lingering CLOSED record under the same 4-tuple gives way
            tables
                .conns
                .retain(|s| !(s.quad == quad && s.lock().state == TcpState::Closed));
            tables.conns.push(slot.clone());
        }

        self.flush(&slot);
        slot
    }

    /// Hands out one ESTABLISHED listener-born connection, at most once.
    pub(crate) fn accept_ready(&self, addr: SocketAddrV4) -> Option<Arc<ConnSlot>> {
        let tables = self.tables.lock().unwrap();
        for slot in &tables.conns {
            if !slot.from_listener || !listener_matches(addr, slot.quad.src) {
                continue;
            }
            if !slot.lock().is_established() {
                continue;
            }
            if slot.dispensed.swap(true, Ordering::SeqCst) {
                continue;
            }
            return Some(slot.clone());
        }
        None
    }

    /// Drops a record the application is done with. Lingering CLOSED records
    /// are legal, so this is garbage collection rather than teardown.
    pub(crate) fn remove(&self, slot: &Arc<ConnSlot>) {
        let mut tables = self.tables.lock().unwrap();
        tables.conns.retain(|s| !Arc::ptr_eq(s, slot));
    }

    // # Dispatch

    /// One dispatcher iteration: drain the endpoint, deliver segments, run
    /// every connection's timer sweep, flush what queued up and wake
    /// sleepers whose connection left a waiting state.
    pub fn poll(&self) {
        loop {
            match self.endpoint.recv() {
                Ok((datagram, _src)) => self.process_inbound(&datagram),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!("raw endpoint receive failed: {e}");
                    break;
                }
            }
        }

        let conns: Vec<_> = self.tables.lock().unwrap().conns.clone();
        for slot in &conns {
            let mut conn = slot.lock();
            let before = conn.state;
            conn.on_tick();
            self.flush_locked(&mut conn);
            if conn.state != before || conn.readable() || conn.rx_closed() {
                slot.cv.notify_all();
            }
        }

        // reap listener-born records nobody will ever accept
        let mut tables = self.tables.lock().unwrap();
        tables.conns.retain(|s| {
            let dead = s.from_listener
                && !s.dispensed.load(Ordering::SeqCst)
                && s.lock().state == TcpState::Closed;
            !dead
        });
    }

    /// Validates one raw datagram and routes the segment it carries.
    fn process_inbound(&self, datagram: &[u8]) {
        let packet = match Ipv4Packet::from_slice(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("malformed ip packet dropped: {e}");
                return;
            }
        };
        if packet.proto != PROTO_TCP {
            return;
        }
        if !TcpPacket::verify_checksum(packet.src, packet.dst, &packet.content) {
            tracing::debug!("tcp checksum mismatch, segment dropped");
            return;
        }
        let segment = match TcpPacket::from_slice(&packet.content) {
            Ok(segment) => segment,
            Err(e) => {
                tracing::debug!("malformed tcp segment dropped: {e}");
                return;
            }
        };

        let quad = Quad {
            src: SocketAddrV4::new(packet.dst, segment.dst_port),
            dst: SocketAddrV4::new(packet.src, segment.src_port),
        };

        // (1) an existing connection under this 4-tuple
        let known = {
            let tables = self.tables.lock().unwrap();
            tables
                .conns
                .iter()
                .find(|s| s.quad == quad && s.lock().state != TcpState::Closed)
                .cloned()
        };
        if let Some(slot) = known {
            let mut conn = slot.lock();
            let before = conn.state;
            conn.on_segment(segment);
            self.flush_locked(&mut conn);
            if conn.state != before || conn.readable() || conn.rx_closed() {
                slot.cv.notify_all();
            }
            return;
        }

        // (2) a SYN for a listener births a connection
        if segment.flags.contains(TcpFlags::SYN) && !segment.flags.contains(TcpFlags::ACK) {
            if let Some(slot) = self.try_birth(quad, &segment) {
                self.flush(&slot);
                return;
            }
            if self.config.rst_on_syn {
                tracing::trace!("no listener for SYN to {}, answering RST", quad.src);
                self.transmit(quad.src, quad.dst, TcpPacket::rst_for_syn(&segment));
                return;
            }
        }

        // (3) no matching connection, no listener: silently ignored
        tracing::trace!("unmatched segment for {} dropped", quad.src);
    }

    fn try_birth(&self, quad: Quad, syn: &TcpPacket) -> Option<Arc<ConnSlot>> {
        let mut tables = self.tables.lock().unwrap();
        let listener = tables.listeners.iter().find(|l| l.matches(quad.src))?.clone();

        let pending = tables
            .conns
            .iter()
            .filter(|s| s.from_listener && listener.matches(s.quad.src))
            .filter(|s| !s.dispensed.load(Ordering::SeqCst))
            .filter(|s| s.lock().state != TcpState::Closed)
            .count();
        if pending >= listener.backlog {
            tracing::debug!("backlog of {} full, SYN ignored", listener.addr);
            return None;
        }

        tracing::debug!("incoming connection to {} from {}", quad.src, quad.dst);
        let conn = Connection::accept(quad, syn, self.config.clone());
        let slot = Arc::new(ConnSlot {
            quad,
            from_listener: true,
            dispensed: AtomicBool::new(false),
            inner: Mutex::new(conn),
            cv: Condvar::new(),
        });
        tables
            .conns
            .retain(|s| !(s.quad == quad && s.lock().state == TcpState::Closed));
        tables.conns.push(slot.clone());
        Some(slot)
    }

    // # Egress

    /// Frames and transmits everything the connection queued.
    pub(crate) fn flush(&self, slot: &Arc<ConnSlot>) {
        let mut conn = slot.lock();
        self.flush_locked(&mut conn);
    }

    fn flush_locked(&self, conn: &mut Connection) {
        while let Some(segment) = conn.pop_outgoing() {
            self.transmit(conn.quad.src, conn.quad.dst, segment);
        }
    }

    fn transmit(&self, src: SocketAddrV4, dst: SocketAddrV4, segment: TcpPacket) {
        let bytes = match segment.to_vec_with_checksum(*src.ip(), *dst.ip()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("failed to serialize segment: {e}");
                return;
            }
        };
        let packet = Ipv4Packet::tcp_segment(
            self.ident.fetch_add(1, Ordering::Relaxed),
            self.config.ttl,
            *src.ip(),
            *dst.ip(),
            bytes,
        );
        let datagram = match packet.to_vec() {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::error!("failed to frame ip packet: {e}");
                return;
            }
        };
        if let Err(e) = self.endpoint.send(&datagram, *dst.ip()) {
            // transient failures are healed by the retransmission sweep
            tracing::warn!("raw endpoint send failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::LoopbackIo;
    use std::io::ErrorKind;

    const SERVER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 9000);
    const CLIENT: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 5555);

    fn fixture(config: Config) -> (Arc<LoopbackIo>, Arc<Stack>) {
        let io = Arc::new(LoopbackIo::new());
        let stack = Stack::new(Box::new(io.clone()), config);
        (io, stack)
    }

    fn fixed_iss_config() -> Config {
        Config {
            iss: Some(4000),
            ..Config::default()
        }
    }

    fn datagram(src: SocketAddrV4, dst: SocketAddrV4, pkt: TcpPacket) -> Vec<u8> {
        let segment = pkt.to_vec_with_checksum(*src.ip(), *dst.ip()).unwrap();
        Ipv4Packet::tcp_segment(9, 64, *src.ip(), *dst.ip(), segment)
            .to_vec()
            .unwrap()
    }

    fn recv_segment(io: &LoopbackIo) -> TcpPacket {
        let (raw, _) = io.recv().expect("expected an emitted datagram");
        let ip = Ipv4Packet::from_slice(&raw).unwrap();
        assert!(TcpPacket::verify_checksum(ip.src, ip.dst, &ip.content));
        TcpPacket::from_slice(&ip.content).unwrap()
    }

    #[test]
    fn orphan_syn_is_silently_ignored() {
        let (io, stack) = fixture(Config::default());

        stack.process_inbound(&datagram(CLIENT, SERVER, TcpPacket::syn(5555, 9000, 77, 1024)));

        assert_eq!(io.recv().unwrap_err().kind(), ErrorKind::WouldBlock);
        assert!(stack.tables.lock().unwrap().conns.is_empty());
    }

    #[test]
    fn orphan_syn_answered_with_rst_when_enabled() {
        let (io, stack) = fixture(Config {
            rst_on_syn: true,
            ..Config::default()
        });

        let syn = TcpPacket::syn(5555, 9000, 77, 1024);
        stack.process_inbound(&datagram(CLIENT, SERVER, syn.clone()));

        let rst = recv_segment(&io);
        assert!(rst.flags.contains(TcpFlags::RST));
        assert_eq!(rst.ack_no, 78);
        assert_eq!(rst.dst_port, 5555);
        assert!(stack.tables.lock().unwrap().conns.is_empty());
    }

    #[test]
    fn corrupted_tcp_checksum_is_dropped() {
        let (io, stack) = fixture(fixed_iss_config());
        stack.listen(SERVER, 4).unwrap();

        let mut raw = datagram(CLIENT, SERVER, TcpPacket::syn(5555, 9000, 77, 1024));
        let payload_start = crate::ip::IPV4_HEADER_LEN;
        raw[payload_start + 4] ^= 0xff; // corrupt the sequence number
        stack.process_inbound(&raw);

        assert_eq!(io.recv().unwrap_err().kind(), ErrorKind::WouldBlock);
        assert!(stack.tables.lock().unwrap().conns.is_empty());
    }

    #[test]
    fn corrupted_ip_header_is_dropped() {
        let (io, stack) = fixture(fixed_iss_config());
        stack.listen(SERVER, 4).unwrap();

        let mut raw = datagram(CLIENT, SERVER, TcpPacket::syn(5555, 9000, 77, 1024));
        raw[10] ^= 0xff; // break the header checksum
        stack.process_inbound(&raw);

        assert_eq!(io.recv().unwrap_err().kind(), ErrorKind::WouldBlock);
        assert!(stack.tables.lock().unwrap().conns.is_empty());
    }

    #[test]
    fn syn_to_listener_births_connection_dispensed_once() {
        let (io, stack) = fixture(fixed_iss_config());
        stack.listen(SERVER, 4).unwrap();

        stack.process_inbound(&datagram(CLIENT, SERVER, TcpPacket::syn(5555, 9000, 77, 1024)));
        let syn_ack = recv_segment(&io);
        assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(syn_ack.seq_no, 4000);
        assert_eq!(syn_ack.ack_no, 78);

        // not established yet, nothing to accept
        assert!(stack.accept_ready(SERVER).is_none());

        stack.process_inbound(&datagram(CLIENT, SERVER, TcpPacket::ack(5555, 9000, 78, 4001, 1024)));
        let slot = stack.accept_ready(SERVER).expect("established connection");
        assert!(slot.lock().is_established());

        // dispense-once
        assert!(stack.accept_ready(SERVER).is_none());
    }

    #[test]
    fn reopening_a_quad_with_lingering_closed_record() {
        let (_io, stack) = fixture(fixed_iss_config());

        let first = stack.connect(CLIENT, SERVER);
        stack.process_inbound(&datagram(
            SERVER,
            CLIENT,
            TcpPacket::rst_for_syn(&TcpPacket::syn(5555, 9000, 4000, 1024)),
        ));
        assert_eq!(first.lock().state, TcpState::Closed);
        assert_eq!(stack.tables.lock().unwrap().conns.len(), 1);

        // the dead record lingers; a new connection under the same 4-tuple
        // replaces it
        let second = stack.connect(CLIENT, SERVER);
        assert_eq!(stack.tables.lock().unwrap().conns.len(), 1);
        assert_eq!(second.lock().state, TcpState::SynSent);
    }
}
