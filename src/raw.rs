//! Raw datagram endpoints.
//!
//! [`RawIo`] is the seam between the stack and the host: one implementation
//! ([`RawSocket`]) talks to a real `SOCK_RAW` socket, the other
//! ([`LoopbackIo`]) keeps every packet in memory the way a raw socket on
//! 127.0.0.1 sees its own traffic. Receive is non-blocking on both; a
//! would-block result is not an error, the dispatcher polls.

use std::collections::VecDeque;
use std::io::{Error, ErrorKind, Result};
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

/// Largest IP datagram the endpoint accepts or returns.
pub const MAX_DATAGRAM_LEN: usize = 65535;

/// A non-blocking endpoint exchanging whole IP packets.
pub trait RawIo {
    /// Writes one fully-formed IP packet to `dst` in a single operation.
    fn send(&self, packet: &[u8], dst: Ipv4Addr) -> Result<usize>;

    /// Returns one full datagram and its source address.
    ///
    /// Fails with [`ErrorKind::WouldBlock`] when nothing is queued.
    fn recv(&self) -> Result<(Vec<u8>, Ipv4Addr)>;
}

impl<T: RawIo + ?Sized> RawIo for std::sync::Arc<T> {
    fn send(&self, packet: &[u8], dst: Ipv4Addr) -> Result<usize> {
        (**self).send(packet, dst)
    }

    fn recv(&self) -> Result<(Vec<u8>, Ipv4Addr)> {
        (**self).recv()
    }
}

/// A raw IPv4 socket bound to the TCP protocol number.
///
/// The kernel is told that the caller supplies the IP header
/// (`IP_HDRINCL`) and the descriptor is switched to non-blocking mode.
/// Opening it requires elevated privileges.
#[derive(Debug)]
pub struct RawSocket {
    fd: RawFd,
}

impl RawSocket {
    pub fn new() -> Result<RawSocket> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_TCP) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }

        let socket = RawSocket { fd };
        socket.configure()?;
        Ok(socket)
    }

    fn configure(&self) -> Result<()> {
        let one: libc::c_int = 1;
        let res = unsafe {
            libc::setsockopt(
                self.fd,
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                &one as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if res < 0 {
            return Err(Error::last_os_error());
        }
        self.set_nonblocking(true)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        let res = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) };
        if res < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl RawIo for RawSocket {
    fn send(&self, packet: &[u8], dst: Ipv4Addr) -> Result<usize> {
        if packet.len() > MAX_DATAGRAM_LEN {
            return Err(Error::new(ErrorKind::InvalidInput, "packet exceeds 65535 bytes"));
        }

        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr = libc::in_addr {
            s_addr: u32::from(dst).to_be(),
        };

        let sent = unsafe {
            libc::sendto(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(Error::last_os_error());
        }
        Ok(sent as usize)
    }

    fn recv(&self) -> Result<(Vec<u8>, Ipv4Addr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let received = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if received < 0 {
            return Err(Error::last_os_error());
        }

        buf.truncate(received as usize);
        let src = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        Ok((buf, src))
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// An in-memory endpoint where every sent packet loops back into the own
/// receive queue.
///
/// This matches what a raw socket observes when both peers live on
/// 127.0.0.1: each transmitted packet comes right back in as an inbound
/// datagram, and the connection manager demultiplexes it from there.
#[derive(Debug, Default)]
pub struct LoopbackIo {
    queue: Mutex<VecDeque<(Vec<u8>, Ipv4Addr)>>,
}

impl LoopbackIo {
    #[must_use]
    pub fn new() -> LoopbackIo {
        LoopbackIo::default()
    }

    fn src_of(packet: &[u8]) -> Ipv4Addr {
        if packet.len() >= 16 {
            Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15])
        } else {
            Ipv4Addr::UNSPECIFIED
        }
    }
}

impl RawIo for LoopbackIo {
    fn send(&self, packet: &[u8], _dst: Ipv4Addr) -> Result<usize> {
        if packet.len() > MAX_DATAGRAM_LEN {
            return Err(Error::new(ErrorKind::InvalidInput, "packet exceeds 65535 bytes"));
        }
        let src = Self::src_of(packet);
        self.queue
            .lock()
            .expect("loopback queue poisoned")
            .push_back((packet.to_vec(), src));
        Ok(packet.len())
    }

    fn recv(&self) -> Result<(Vec<u8>, Ipv4Addr)> {
        self.queue
            .lock()
            .expect("loopback queue poisoned")
            .pop_front()
            .ok_or_else(|| Error::new(ErrorKind::WouldBlock, "no datagram queued"))
    }
}
