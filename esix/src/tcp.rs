//! TCP segment wire format and checksum. The connection state machine
//! itself lives in [`crate::socket`], which owns per-socket TCP state
//! (§4.6 describes the state machine in terms of socket operations).

use alloc::vec::Vec;

use crate::ipv6::{upper_layer_checksum, Ipv6Address, NEXT_HEADER_TCP};

bitflags::bitflags! {
    /// TCP control flags. This stack never sends or interprets TCP
    /// options (§1 Non-goals), so the header is always the fixed 20 bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// A parsed TCP segment: fixed 20-byte header plus payload.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    pub const HEADER_SIZE: usize = 20;

    /// Parses a segment. No TCP options are supported; any `data offset`
    /// greater than 5 (20 bytes) has its extra header bytes treated as
    /// opaque padding ahead of the payload, matching a base-header-only
    /// implementation.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::HEADER_SIZE {
            return None;
        }
        let src_port = u16::from_be_bytes([data[0], data[1]]);
        let dst_port = u16::from_be_bytes([data[2], data[3]]);
        let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ack = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let data_offset = ((data[12] >> 4) as usize) * 4;
        let flags = TcpFlags::from_bits_truncate(data[13]);
        let window = u16::from_be_bytes([data[14], data[15]]);
        let offset = data_offset.max(Self::HEADER_SIZE);
        if data.len() < offset {
            return None;
        }
        Some(Self {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            window,
            payload: data[offset..].to_vec(),
        })
    }

    /// Builds wire bytes with the pseudo-header checksum filled in.
    pub fn build(
        src: &Ipv6Address,
        dst: &Ipv6Address,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        window: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&src_port.to_be_bytes());
        bytes.extend_from_slice(&dst_port.to_be_bytes());
        bytes.extend_from_slice(&seq.to_be_bytes());
        bytes.extend_from_slice(&ack.to_be_bytes());
        bytes.push(5 << 4); // data offset: 5 words, no options
        bytes.push(flags.bits());
        bytes.extend_from_slice(&window.to_be_bytes());
        bytes.extend_from_slice(&[0, 0]); // checksum placeholder
        bytes.extend_from_slice(&[0, 0]); // urgent pointer, unused
        bytes.extend_from_slice(payload);

        let csum = upper_layer_checksum(src, dst, NEXT_HEADER_TCP, &bytes);
        bytes[16..18].copy_from_slice(&csum.to_be_bytes());
        bytes
    }

    pub fn checksum_ok(&self, src: &Ipv6Address, dst: &Ipv6Address, wire: &[u8]) -> bool {
        upper_layer_checksum(src, dst, NEXT_HEADER_TCP, wire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_roundtrips() {
        let src = Ipv6Address([0xfe80_0000, 0, 0, 1]);
        let dst = Ipv6Address([0xfe80_0000, 0, 0, 2]);
        let wire = TcpSegment::build(
            &src,
            &dst,
            49152,
            80,
            1000,
            0,
            TcpFlags::SYN,
            1400,
            &[],
        );
        let seg = TcpSegment::parse(&wire).unwrap();
        assert_eq!(seg.seq, 1000);
        assert_eq!(seg.flags, TcpFlags::SYN);
        assert!(seg.checksum_ok(&src, &dst, &wire));
    }

    #[test]
    fn payload_after_fixed_header_is_preserved() {
        let src = Ipv6Address([0xfe80_0000, 0, 0, 1]);
        let dst = Ipv6Address([0xfe80_0000, 0, 0, 2]);
        let wire = TcpSegment::build(
            &src,
            &dst,
            49152,
            80,
            1000,
            500,
            TcpFlags::PSH | TcpFlags::ACK,
            1400,
            b"GET",
        );
        let seg = TcpSegment::parse(&wire).unwrap();
        assert_eq!(seg.payload, b"GET");
    }
}
