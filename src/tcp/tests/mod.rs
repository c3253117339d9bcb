//! Packet-level connection tests.
//!
//! A [`TcpTestUnit`] owns one connection, a fake clock and the queue of
//! segments the connection wants on the wire; tests inject segments with
//! [`incoming`](TcpTestUnit::incoming) and inspect the queue, or pipe two
//! units into each other for full exchanges.

mod rst;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::tcp::{Config, Connection, Quad, TcpFlags, TcpPacket};

pub(crate) const WIN_64K: u16 = 65535;

pub(crate) struct TcpTestUnit {
    pub quad: Quad,
    pub con: Option<Connection>,
    pub cfg: Config,
    clock: Arc<Mutex<Instant>>,
    base: Instant,
}

impl TcpTestUnit {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        let base = Instant::now();
        let clock = Arc::new(Mutex::new(base));
        let reader = clock.clone();
        Self {
            quad: Quad { src, dst },
            con: None,
            cfg: Config {
                iss: Some(0),
                clock: Arc::new(move || *reader.lock().unwrap()),
                ..Config::default()
            },
            clock,
            base,
        }
    }

    /// Advances the fake clock to `base + offset`.
    pub fn set_time(&self, offset: Duration) {
        *self.clock.lock().unwrap() = self.base + offset;
    }

    pub fn connect(&mut self) {
        assert!(self.con.is_none());
        self.con = Some(Connection::connect(self.quad, self.cfg.clone()));
    }

    /// Feeds one segment; the first SYN births the connection passively.
    pub fn incoming(&mut self, pkt: TcpPacket) {
        match self.con.as_mut() {
            Some(con) => con.on_segment(pkt),
            None => {
                assert!(pkt.flags.contains(TcpFlags::SYN), "first segment must be a SYN");
                self.con = Some(Connection::accept(self.quad, &pkt, self.cfg.clone()));
            }
        }
    }

    pub fn tick(&mut self) {
        self.con.as_mut().expect("no connection to tick").on_tick();
    }

    pub fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.con.as_mut().expect("no connection to write to").write(buf)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.con.as_mut().expect("no connection to read from").read(buf)
    }

    pub fn close(&mut self) {
        self.con.as_mut().expect("no connection to close").close();
    }

    pub fn outgoing(&mut self) -> Vec<TcpPacket> {
        let con = self.con.as_mut().expect("no connection exists");
        std::mem::take(&mut con.outgoing).into_iter().collect()
    }

    pub fn clear_outgoing(&mut self) {
        self.outgoing();
    }

    pub fn assert_outgoing_eq(&mut self, expected: &[TcpPacket]) {
        assert_eq!(self.outgoing(), expected);
    }

    /// Moves the first `n` queued segments into the peer; the rest stay
    /// queued.
    pub fn pipe(&mut self, peer: &mut TcpTestUnit, n: usize) {
        let con = self.con.as_mut().expect("no connection exists");
        assert!(
            con.outgoing.len() >= n,
            "only {} segments queued, wanted {n}",
            con.outgoing.len()
        );
        let pkts: Vec<_> = con.outgoing.drain(..n).collect();
        for pkt in pkts {
            peer.incoming(pkt);
        }
    }

    /// The SYN|ACK the remote side would answer our SYN with.
    pub fn peer_syn_ack(&self, peer_iss: u32, peer_window: u16) -> TcpPacket {
        TcpPacket {
            src_port: self.quad.dst.port(),
            dst_port: self.quad.src.port(),
            seq_no: peer_iss,
            ack_no: self.send.iss.wrapping_add(1),
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: peer_window,
            urgent_ptr: 0,
            content: Vec::new(),
        }
    }

    /// Passive-side establishment: SYN in, SYN|ACK discarded, final ACK in.
    pub fn handshake(&mut self, remote_seq: u32, remote_window: u16) {
        self.incoming(TcpPacket::syn(
            self.quad.dst.port(),
            self.quad.src.port(),
            remote_seq,
            remote_window,
        ));
        self.clear_outgoing();

        self.incoming(TcpPacket::ack(
            self.quad.dst.port(),
            self.quad.src.port(),
            remote_seq.wrapping_add(1),
            self.send.iss.wrapping_add(1),
            remote_window,
        ));
        self.clear_outgoing();
        assert!(self.is_established());
    }

    /// Active-side establishment: SYN out, SYN|ACK in, final ACK discarded.
    pub fn handshake_active(&mut self, peer_iss: u32, peer_window: u16) {
        self.connect();
        self.clear_outgoing();
        let syn_ack = self.peer_syn_ack(peer_iss, peer_window);
        self.incoming(syn_ack);
        self.clear_outgoing();
        assert!(self.is_established());
    }

    /// Full three-way handshake between two piped units.
    pub fn handshake_pipe(&mut self, server: &mut TcpTestUnit) {
        self.connect();
        self.pipe(server, 1);
        server.pipe(self, 1);
        self.pipe(server, 1);

        assert!(self.is_established());
        assert!(server.is_established());
    }

    /// The §8 bookkeeping that must hold at any time.
    pub fn assert_invariants(&self) {
        let con = self.con.as_ref().expect("no connection exists");
        assert!(con.send.una.wrapping_sub(con.send.iss) <= con.send.nxt.wrapping_sub(con.send.iss));
        assert_eq!(con.bytes_in_flight(), con.send.nxt.wrapping_sub(con.send.una));
        if con.is_established() {
            assert!(con.bytes_in_flight() <= con.effective_window());
        }
    }
}

impl Deref for TcpTestUnit {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.con.as_ref().expect("deref needs an existing connection")
    }
}

/// The address pair most tests run on.
pub(crate) fn unit() -> TcpTestUnit {
    TcpTestUnit::new(
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 104), 80),
        SocketAddrV4::new(Ipv4Addr::new(20, 0, 2, 204), 1808),
    )
}

pub(crate) fn pipe_pair() -> (TcpTestUnit, TcpTestUnit) {
    let a = SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 104), 80);
    let b = SocketAddrV4::new(Ipv4Addr::new(20, 0, 2, 204), 1808);
    (TcpTestUnit::new(a, b), TcpTestUnit::new(b, a))
}
