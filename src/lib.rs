//! A user-space TCP/IPv4 stack on top of a raw datagram socket.
//!
//! The crate reimplements the core of TCP (RFC 793) and its retransmission
//! timer (RFC 6298) without touching the kernel TCP stack: IP packets are
//! framed and parsed in user space and exchanged through a raw socket opened
//! with `IP_HDRINCL`. On top of that sit a per-connection state machine and
//! reliability engine, a connection manager that demultiplexes inbound
//! segments by 4-tuple, and a blocking socket API
//! ([`TcpSocket`](socket::TcpSocket)).
//!
//! Opening the raw endpoint requires elevated privileges, and ports serviced
//! by the host kernel's own TCP stack should be avoided. The
//! [`LoopbackIo`](raw::LoopbackIo) endpoint runs the whole stack in memory
//! instead, which is how the integration tests exercise it.

use std::io::Write;

pub mod checksum;
pub mod ip;
pub mod raw;
pub mod socket;
pub mod stack;
pub mod tcp;

pub use socket::TcpSocket;
pub use stack::Stack;

/// Serialisation into the exact byte sequence that travels the wire.
///
/// Implementations write every field explicitly in network byte order;
/// nothing relies on in-memory structure layout.
pub trait ToBytestream {
    type Error;
    /// Appends the wire representation of `self` to the stream.
    fn to_bytestream(&self, stream: &mut impl Write) -> Result<(), Self::Error>;

    /// Serialises `self` into a fresh byte vector.
    fn to_vec(&self) -> Result<Vec<u8>, Self::Error> {
        let mut buf = Vec::new();
        self.to_bytestream(&mut buf)?;
        Ok(buf)
    }
}

/// Parsing from a byte slice in wire representation.
pub trait FromBytestream: Sized {
    type Error;
    /// Reads a value from the given slice, validating each field.
    fn from_slice(slice: &[u8]) -> Result<Self, Self::Error>;
}
