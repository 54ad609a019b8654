//! UDP: stateless datagram parse/build and pseudo-header checksum (§4.5).

use alloc::vec::Vec;

use crate::ipv6::{upper_layer_checksum, Ipv6Address, NEXT_HEADER_UDP};

/// An 8-byte UDP header plus payload.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub checksum: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    pub const HEADER_SIZE: usize = 8;

    /// Parses a datagram from an IPv6 payload. Returns `None` if shorter
    /// than the header or the declared length mismatches.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::HEADER_SIZE {
            return None;
        }
        let src_port = u16::from_be_bytes([data[0], data[1]]);
        let dst_port = u16::from_be_bytes([data[2], data[3]]);
        let length = u16::from_be_bytes([data[4], data[5]]) as usize;
        let checksum = u16::from_be_bytes([data[6], data[7]]);
        if length < Self::HEADER_SIZE || data.len() < length {
            return None;
        }
        Some(Self {
            src_port,
            dst_port,
            checksum,
            payload: data[Self::HEADER_SIZE..length].to_vec(),
        })
    }

    /// Verifies the pseudo-header checksum is zero over the full datagram.
    pub fn checksum_ok(&self, src: &Ipv6Address, dst: &Ipv6Address, wire: &[u8]) -> bool {
        upper_layer_checksum(src, dst, NEXT_HEADER_UDP, wire) == 0
    }

    /// Builds a datagram ready for IPv6 transmit, with the pseudo-header
    /// checksum filled in (§4.5 "Send").
    pub fn build(src: &Ipv6Address, dst: &Ipv6Address, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let length = (Self::HEADER_SIZE + payload.len()) as u16;
        let mut bytes = Vec::with_capacity(length as usize);
        bytes.extend_from_slice(&src_port.to_be_bytes());
        bytes.extend_from_slice(&dst_port.to_be_bytes());
        bytes.extend_from_slice(&length.to_be_bytes());
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(payload);

        let csum = upper_layer_checksum(src, dst, NEXT_HEADER_UDP, &bytes);
        bytes[6..8].copy_from_slice(&csum.to_be_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_roundtrips_and_checksum_is_zero() {
        let src = Ipv6Address([0xfe80_0000, 0, 0, 1]);
        let dst = Ipv6Address([0xfe80_0000, 0, 0, 2]);
        let wire = UdpDatagram::build(&src, &dst, 5353, 5353, b"hi");
        let dgram = UdpDatagram::parse(&wire).unwrap();
        assert_eq!(dgram.payload, b"hi");
        assert!(dgram.checksum_ok(&src, &dst, &wire));
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        assert!(UdpDatagram::parse(&[0u8; 4]).is_none());
    }
}
