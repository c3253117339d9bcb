//! TCP segment codec.

use std::fmt;
use std::io::{Error, ErrorKind, Result, Write};
use std::net::Ipv4Addr;

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::checksum;
use crate::{FromBytestream, ToBytestream};

pub const PROTO_TCP: u8 = 0x06;

/// Length of the option-less TCP header.
pub const TCP_HEADER_LEN: usize = 20;

bitflags! {
    /// The flag byte of a TCP header, CWR to FIN from MSB to LSB.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        const CWR = 0b1000_0000;
        const ECE = 0b0100_0000;
        const URG = 0b0010_0000;
        const ACK = 0b0001_0000;
        const PSH = 0b0000_1000;
        const RST = 0b0000_0100;
        const SYN = 0b0000_0010;
        const FIN = 0b0000_0001;
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{name}")?;
            first = false;
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// A TCP segment associated with an end-to-end connection.
///
/// The checksum is not part of the in-memory representation: it is computed
/// over the serialised bytes on egress and verified over the received bytes
/// on ingress, so the value covered is always the value transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPacket {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_no: u32,
    pub ack_no: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent_ptr: u16,

    pub content: Vec<u8>,
}

impl TcpPacket {
    #[must_use]
    pub fn syn(src_port: u16, dst_port: u16, seq_no: u32, window: u16) -> TcpPacket {
        TcpPacket {
            src_port,
            dst_port,
            seq_no,
            ack_no: 0,
            flags: TcpFlags::SYN,
            window,
            urgent_ptr: 0,
            content: Vec::new(),
        }
    }

    /// The answer of a passive opener to `syn`.
    #[must_use]
    pub fn syn_ack(syn: &TcpPacket, seq_no: u32, window: u16) -> TcpPacket {
        TcpPacket {
            src_port: syn.dst_port,
            dst_port: syn.src_port,
            seq_no,
            ack_no: syn.seq_no.wrapping_add(1),
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window,
            urgent_ptr: 0,
            content: Vec::new(),
        }
    }

    #[must_use]
    pub fn ack(src_port: u16, dst_port: u16, seq_no: u32, ack_no: u32, window: u16) -> TcpPacket {
        TcpPacket {
            src_port,
            dst_port,
            seq_no,
            ack_no,
            flags: TcpFlags::ACK,
            window,
            urgent_ptr: 0,
            content: Vec::new(),
        }
    }

    #[must_use]
    pub fn data(
        src_port: u16,
        dst_port: u16,
        seq_no: u32,
        ack_no: u32,
        window: u16,
        content: Vec<u8>,
    ) -> TcpPacket {
        TcpPacket {
            src_port,
            dst_port,
            seq_no,
            ack_no,
            flags: TcpFlags::PSH | TcpFlags::ACK,
            window,
            urgent_ptr: 0,
            content,
        }
    }

    #[must_use]
    pub fn fin(src_port: u16, dst_port: u16, seq_no: u32, ack_no: u32, window: u16) -> TcpPacket {
        TcpPacket {
            src_port,
            dst_port,
            seq_no,
            ack_no,
            flags: TcpFlags::FIN | TcpFlags::ACK,
            window,
            urgent_ptr: 0,
            content: Vec::new(),
        }
    }

    /// The reset answering a SYN that reached no listener.
    #[must_use]
    pub fn rst_for_syn(syn: &TcpPacket) -> TcpPacket {
        TcpPacket {
            src_port: syn.dst_port,
            dst_port: syn.src_port,
            seq_no: 0,
            ack_no: syn.seq_no.wrapping_add(1),
            flags: TcpFlags::RST | TcpFlags::ACK,
            window: 0,
            urgent_ptr: 0,
            content: Vec::new(),
        }
    }

    /// Sequence-number footprint of the segment: one per payload byte, plus
    /// one virtual byte for SYN and FIN each.
    #[must_use]
    pub fn seq_len(&self) -> u32 {
        let mut len = self.content.len() as u32;
        if self.flags.contains(TcpFlags::SYN) {
            len += 1;
        }
        if self.flags.contains(TcpFlags::FIN) {
            len += 1;
        }
        len
    }

    /// Serialises the segment and fills in the checksum over the exact bytes
    /// that will travel the wire between `src` and `dst`.
    pub fn to_vec_with_checksum(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Result<Vec<u8>> {
        let mut buf = self.to_vec()?;
        let ck = checksum::tcp_checksum(src, dst, &buf);
        buf[16..18].copy_from_slice(&ck.to_be_bytes());
        Ok(buf)
    }

    /// Verifies the checksum of a received segment against the pseudo-header
    /// derived from the enclosing IP packet.
    #[must_use]
    pub fn verify_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
        segment.len() >= TCP_HEADER_LEN && checksum::tcp_checksum(src, dst, segment) == 0
    }
}

impl ToBytestream for TcpPacket {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut impl Write) -> Result<()> {
        stream.write_u16::<BE>(self.src_port)?;
        stream.write_u16::<BE>(self.dst_port)?;
        stream.write_u32::<BE>(self.seq_no)?;
        stream.write_u32::<BE>(self.ack_no)?;
        // data offset 5, reserved and NS clear
        stream.write_u8(5 << 4)?;
        stream.write_u8(self.flags.bits())?;
        stream.write_u16::<BE>(self.window)?;
        // checksum, filled in by to_vec_with_checksum
        stream.write_u16::<BE>(0)?;
        stream.write_u16::<BE>(self.urgent_ptr)?;
        stream.write_all(&self.content)?;
        Ok(())
    }
}

impl FromBytestream for TcpPacket {
    type Error = Error;
    fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() < TCP_HEADER_LEN {
            return Err(Error::new(ErrorKind::InvalidData, "tcp header truncated"));
        }

        let mut stream = slice;
        let src_port = stream.read_u16::<BE>()?;
        let dst_port = stream.read_u16::<BE>()?;
        let seq_no = stream.read_u32::<BE>()?;
        let ack_no = stream.read_u32::<BE>()?;

        let data_offset = (stream.read_u8()? >> 4) as usize;
        if data_offset < 5 || data_offset * 4 > slice.len() {
            return Err(Error::new(ErrorKind::InvalidData, "tcp data offset out of range"));
        }

        let flags = TcpFlags::from_bits_truncate(stream.read_u8()?);
        let window = stream.read_u16::<BE>()?;
        let _checksum = stream.read_u16::<BE>()?;
        let urgent_ptr = stream.read_u16::<BE>()?;

        // option bytes of peers that send them are skipped, never interpreted
        let content = slice[data_offset * 4..].to_vec();

        Ok(TcpPacket {
            src_port,
            dst_port,
            seq_no,
            ack_no,
            flags,
            window,
            urgent_ptr,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let pkt = TcpPacket::data(4321, 80, 0xdead_beef, 0x0102_0304, 1024, vec![1, 2, 3]);
        let buf = pkt.to_vec().unwrap();
        assert_eq!(buf.len(), TCP_HEADER_LEN + 3);
        assert_eq!(TcpPacket::from_slice(&buf).unwrap(), pkt);
    }

    #[test]
    fn field_byte_order() {
        let pkt = TcpPacket::syn(0x0102, 0x0304, 0x0506_0708, 0x1112);
        let buf = pkt.to_vec().unwrap();
        assert_eq!(&buf[0..2], &[0x01, 0x02]);
        assert_eq!(&buf[2..4], &[0x03, 0x04]);
        assert_eq!(&buf[4..8], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(buf[12], 0x50);
        assert_eq!(buf[13], 0x02); // SYN
        assert_eq!(&buf[14..16], &[0x11, 0x12]);
    }

    #[test]
    fn checksum_verifies_and_detects_corruption() {
        let src = Ipv4Addr::new(127, 0, 0, 1);
        let dst = Ipv4Addr::new(127, 0, 0, 2);
        let pkt = TcpPacket::data(1000, 2000, 1, 2, 512, b"PING".to_vec());

        let mut buf = pkt.to_vec_with_checksum(src, dst).unwrap();
        assert!(TcpPacket::verify_checksum(src, dst, &buf));

        // flipping the addresses breaks the pseudo-header
        assert!(!TcpPacket::verify_checksum(dst, Ipv4Addr::new(10, 0, 0, 1), &buf));

        buf[22] ^= 0x01;
        assert!(!TcpPacket::verify_checksum(src, dst, &buf));
    }

    #[test]
    fn odd_payload_checksums() {
        let src = Ipv4Addr::new(127, 0, 0, 1);
        let dst = Ipv4Addr::new(127, 0, 0, 1);
        let pkt = TcpPacket::data(1, 2, 3, 4, 5, vec![0xff]);
        let buf = pkt.to_vec_with_checksum(src, dst).unwrap();
        assert!(TcpPacket::verify_checksum(src, dst, &buf));
    }

    #[test]
    fn seq_len_counts_virtual_bytes() {
        assert_eq!(TcpPacket::syn(1, 2, 0, 0).seq_len(), 1);
        assert_eq!(TcpPacket::fin(1, 2, 0, 0, 0).seq_len(), 1);
        assert_eq!(TcpPacket::ack(1, 2, 0, 0, 0).seq_len(), 0);
        assert_eq!(TcpPacket::data(1, 2, 0, 0, 0, vec![0; 7]).seq_len(), 7);
    }

    #[test]
    fn options_of_foreign_peers_are_skipped() {
        let pkt = TcpPacket::data(1, 2, 10, 20, 512, vec![9, 9]);
        let mut buf = pkt.to_vec().unwrap();
        // splice an MSS option in front of the payload, data offset 6
        buf[12] = 6 << 4;
        let with_option: Vec<u8> = buf[..TCP_HEADER_LEN]
            .iter()
            .chain([2u8, 4, 0x04, 0x00].iter())
            .chain(buf[TCP_HEADER_LEN..].iter())
            .copied()
            .collect();

        let parsed = TcpPacket::from_slice(&with_option).unwrap();
        assert_eq!(parsed.content, vec![9, 9]);
        assert_eq!(parsed.seq_no, 10);
    }
}
