//! IPv4 packet framing and parsing.
//!
//! Only the 20-byte option-less header is produced or accepted; IP options
//! are neither generated nor interpreted.

use std::io::{Error, ErrorKind, Result, Write};
use std::net::Ipv4Addr;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::checksum;
use crate::{FromBytestream, ToBytestream};

/// Length of the option-less IPv4 header.
pub const IPV4_HEADER_LEN: usize = 20;

/// An IPv4 packet with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub tos: u8,
    pub identification: u16,
    pub flags: Ipv4Flags,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,

    pub content: Vec<u8>,
}

/// Flags of an [`Ipv4Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Flags {
    pub df: bool,
    pub mf: bool,
}

impl Ipv4Flags {
    fn as_word(self) -> u16 {
        let bits = u16::from(self.df) << 1 | u16::from(self.mf) << 2;
        bits << 13
    }
}

impl Ipv4Packet {
    /// Frames a TCP segment between the given endpoints.
    ///
    /// DF set, MF clear, offset zero; the identification is supplied by the
    /// sender's wrapping counter.
    pub fn tcp_segment(
        identification: u16,
        ttl: u8,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        content: Vec<u8>,
    ) -> Ipv4Packet {
        Ipv4Packet {
            tos: 0,
            identification,
            flags: Ipv4Flags { df: true, mf: false },
            fragment_offset: 0,
            ttl,
            proto: crate::tcp::PROTO_TCP,
            src,
            dst,
            content,
        }
    }
}

impl ToBytestream for Ipv4Packet {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut impl Write) -> Result<()> {
        // version = 4, ihl = 5
        stream.write_u8(0b0100_0101)?;
        stream.write_u8(self.tos)?;
        stream.write_u16::<BE>((IPV4_HEADER_LEN + self.content.len()) as u16)?;
        stream.write_u16::<BE>(self.identification)?;
        stream.write_u16::<BE>(self.flags.as_word() | (self.fragment_offset & 0x1fff))?;
        stream.write_u8(self.ttl)?;
        stream.write_u8(self.proto)?;
        // checksum, patched in by to_vec
        stream.write_u16::<BE>(0)?;
        stream.write_all(&self.src.octets())?;
        stream.write_all(&self.dst.octets())?;
        stream.write_all(&self.content)?;
        Ok(())
    }

    fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(IPV4_HEADER_LEN + self.content.len());
        self.to_bytestream(&mut buf)?;
        let ck = checksum::checksum(&buf[..IPV4_HEADER_LEN]);
        buf[10..12].copy_from_slice(&ck.to_be_bytes());
        Ok(buf)
    }
}

impl FromBytestream for Ipv4Packet {
    type Error = Error;
    fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() < IPV4_HEADER_LEN {
            return Err(Error::new(ErrorKind::InvalidData, "ipv4 header truncated"));
        }

        let version = slice[0] >> 4;
        if version != 4 {
            return Err(Error::new(ErrorKind::InvalidData, "not an ipv4 packet"));
        }
        let ihl = slice[0] & 0x0f;
        if ihl != 5 {
            return Err(Error::new(ErrorKind::InvalidData, "ipv4 options not supported"));
        }

        let total_length = u16::from_be_bytes([slice[2], slice[3]]) as usize;
        if total_length < IPV4_HEADER_LEN || total_length > slice.len() {
            return Err(Error::new(ErrorKind::InvalidData, "ipv4 total length inconsistent"));
        }

        if checksum::checksum(&slice[..IPV4_HEADER_LEN]) != 0 {
            return Err(Error::new(ErrorKind::InvalidData, "ipv4 header checksum mismatch"));
        }

        let mut stream = &slice[1..];
        let tos = stream.read_u8()?;
        let _total_length = stream.read_u16::<BE>()?;
        let identification = stream.read_u16::<BE>()?;

        let fword = stream.read_u16::<BE>()?;
        let flags = Ipv4Flags {
            df: fword >> 13 & 0b010 != 0,
            mf: fword >> 13 & 0b100 != 0,
        };
        let fragment_offset = fword & 0x1fff;

        let ttl = stream.read_u8()?;
        let proto = stream.read_u8()?;
        let _checksum = stream.read_u16::<BE>()?;

        let src = Ipv4Addr::from(stream.read_u32::<BE>()?);
        let dst = Ipv4Addr::from(stream.read_u32::<BE>()?);

        let content = slice[IPV4_HEADER_LEN..total_length].to_vec();

        Ok(Self {
            tos,
            identification,
            flags,
            fragment_offset,
            ttl,
            proto,
            src,
            dst,
            content,
        })
    }
}
