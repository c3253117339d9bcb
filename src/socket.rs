//! The application-facing socket surface.
//!
//! A [`TcpSocket`] drives the stack the way the BSD calls do: bind, listen,
//! accept, connect, send, recv, close. Every socket owns a worker thread
//! that keeps polling the dispatcher (~10 ms cadence) so handshakes,
//! retransmissions and teardowns make progress while the application sits in
//! a blocking call.

use std::io::{Error, ErrorKind, Result};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::stack::{ConnSlot, Stack};
use crate::tcp::TcpState;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(stack: Arc<Stack>) -> Worker {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                stack.poll();
                thread::sleep(POLL_INTERVAL);
            }
        });
        Worker { stop, handle }
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

/// A TCP socket backed by the user-space stack.
///
/// Handles hold a weak reference to their connection record; the connection
/// manager owns it, and operations on a record that was torn down report a
/// disconnect instead of extending its lifetime.
pub struct TcpSocket {
    stack: Arc<Stack>,
    local: Option<SocketAddrV4>,
    conn: Option<Weak<ConnSlot>>,
    listening: bool,
    blocking: bool,
    recv_timeout: Option<Duration>,
    /// Accepted for API parity; the send path never blocks.
    send_timeout: Option<Duration>,
    worker: Option<Worker>,
    closed: bool,
}

impl TcpSocket {
    #[must_use]
    pub fn new(stack: Arc<Stack>) -> TcpSocket {
        TcpSocket {
            stack,
            local: None,
            conn: None,
            listening: false,
            blocking: true,
            recv_timeout: None,
            send_timeout: None,
            worker: None,
            closed: false,
        }
    }

    fn slot(&self) -> Option<Arc<ConnSlot>> {
        self.conn.as_ref()?.upgrade()
    }

    fn ensure_worker(&mut self) {
        if self.worker.is_none() {
            self.worker = Some(Worker::spawn(self.stack.clone()));
        }
    }

    // # Setup

    /// Binds to a dotted-quad address. Port 0 means "unspecified"; a
    /// concrete port must be set before `listen`.
    pub fn bind(&mut self, ip: &str, port: u16) -> Result<()> {
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "invalid ipv4 address"))?;
        self.local = Some(SocketAddrV4::new(ip, port));
        Ok(())
    }

    /// Moves the socket into passive mode.
    pub fn listen(&mut self, backlog: usize) -> Result<()> {
        let local = match self.local {
            Some(addr) if addr.port() != 0 => addr,
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "socket must be bound to a concrete port before listen",
                ))
            }
        };

        self.stack.listen(local, backlog.max(1))?;
        self.listening = true;
        self.ensure_worker();
        Ok(())
    }

    /// Non-blocking accept: pumps the dispatcher once and hands out an
    /// ESTABLISHED connection if one is ready.
    pub fn accept(&mut self) -> Result<Option<TcpSocket>> {
        if !self.listening {
            return Err(Error::new(ErrorKind::InvalidInput, "socket is not listening"));
        }
        let local = self.local.unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

        self.stack.poll();
        let Some(slot) = self.stack.accept_ready(local) else {
            return Ok(None);
        };

        let mut socket = TcpSocket::new(self.stack.clone());
        socket.local = Some(slot.quad.src);
        socket.conn = Some(Arc::downgrade(&slot));
        socket.ensure_worker();
        Ok(Some(socket))
    }

    /// Actively opens a connection and blocks until the handshake completes
    /// or fails.
    pub fn connect(&mut self, ip: &str, port: u16) -> Result<()> {
        if self.listening || self.conn.is_some() {
            return Err(Error::new(ErrorKind::InvalidInput, "socket already in use"));
        }
        let peer_ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "invalid ipv4 address"))?;
        let peer = SocketAddrV4::new(peer_ip, port);

        let mut local = self
            .local
            .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        if local.port() == 0 {
            local.set_port(self.stack.alloc_ephemeral_port());
        }
        self.local = Some(local);

        let slot = self.stack.connect(local, peer);
        self.conn = Some(Arc::downgrade(&slot));
        self.ensure_worker();

        let deadline = Instant::now() + self.stack.config().handshake_timeout;
        let mut conn = slot.lock();
        loop {
            if conn.is_established() {
                tracing::debug!("{local} connected to {peer}");
                return Ok(());
            }
            if let Some(kind) = conn.reset_error() {
                return Err(Error::new(kind, "connect failed"));
            }
            if conn.state == TcpState::Closed {
                return Err(Error::new(ErrorKind::ConnectionReset, "connection refused"));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::new(ErrorKind::TimedOut, "handshake timed out"));
            }
            let (guard, _) = slot.cv.wait_timeout(conn, deadline - now).unwrap();
            conn = guard;
        }
    }

    // # Data transfer

    /// Submits as much of `buf` as the effective window allows; returns the
    /// byte count actually framed. Never blocks.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let slot = self
            .slot()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "socket is not connected"))?;

        let written = {
            let mut conn = slot.lock();
            conn.write(buf)?
        };
        self.stack.flush(&slot);
        Ok(written)
    }

    /// Copies received bytes out of the connection's receive buffer.
    ///
    /// Returns `Ok(0)` on a clean close or an elapsed receive timeout and an
    /// error on a dead connection; with blocking disabled an empty buffer is
    /// reported as [`ErrorKind::WouldBlock`].
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let Some(slot) = self.slot() else {
            // the record is gone, the stream cannot produce more data
            return Ok(0);
        };

        let deadline = self.recv_timeout.map(|t| Instant::now() + t);
        let mut conn = slot.lock();
        loop {
            if let Some(kind) = conn.reset_error() {
                return Err(Error::new(kind, "connection is dead"));
            }

            let n = conn.read(buf);
            if n > 0 {
                return Ok(n);
            }
            if conn.rx_closed() {
                return Ok(0);
            }
            if !self.blocking {
                return Err(Error::new(ErrorKind::WouldBlock, "receive buffer empty"));
            }

            conn = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(0);
                    }
                    let (guard, _) = slot.cv.wait_timeout(conn, deadline - now).unwrap();
                    guard
                }
                None => slot.cv.wait(conn).unwrap(),
            };
        }
    }

    // # Teardown

    /// Initiates the orderly teardown and releases the socket's resources.
    /// Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.listening {
            if let Some(local) = self.local {
                self.stack.unlisten(local);
            }
            self.listening = false;
        }

        if let Some(slot) = self.slot() {
            {
                let mut conn = slot.lock();
                conn.close();
            }
            self.stack.flush(&slot);

            // let the worker drive the four-way teardown to CLOSED, bounded
            let deadline = Instant::now() + self.stack.config().linger;
            let mut conn = slot.lock();
            while conn.state != TcpState::Closed {
                let now = Instant::now();
                if now >= deadline {
                    tracing::debug!("{:?} close lingered out in {:?}", slot.quad, conn.state);
                    break;
                }
                let (guard, _) = slot.cv.wait_timeout(conn, deadline - now).unwrap();
                conn = guard;
            }
            drop(conn);

            slot.cv.notify_all();
            self.stack.remove(&slot);
        }
        self.conn = None;

        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
        Ok(())
    }

    // # Options and queries

    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) {
        self.recv_timeout = timeout;
    }

    pub fn set_send_timeout(&mut self, timeout: Option<Duration>) {
        self.send_timeout = timeout;
    }

    #[must_use]
    pub fn receive_timeout(&self) -> Option<Duration> {
        self.recv_timeout
    }

    #[must_use]
    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.slot().map(|s| s.quad.src).or(self.local)
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.slot().map(|s| s.quad.dst)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.slot().map(|s| s.lock().is_established()).unwrap_or(false)
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
