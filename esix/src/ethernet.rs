//! Ethernet frame parsing, construction, and EtherType dispatch.

use alloc::vec::Vec;

/// EtherType for IPv6. This is the only EtherType esix forwards upward.
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

/// A 48-bit Ethernet (link-layer) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// The all-zero address.
    pub const ZERO: Self = Self([0, 0, 0, 0, 0, 0]);
    /// The broadcast address.
    pub const BROADCAST: Self = Self([0xff; 6]);

    /// Builds an address from six bytes.
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Parses an address out of a byte slice's first six bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 6 {
            return None;
        }
        let mut arr = [0u8; 6];
        arr.copy_from_slice(&bytes[..6]);
        Some(Self(arr))
    }

    /// Returns the address as a byte array.
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Equality tested as three 16-bit words, per the wire representation.
    pub fn words(&self) -> [u16; 3] {
        [
            u16::from_be_bytes([self.0[0], self.0[1]]),
            u16::from_be_bytes([self.0[2], self.0[3]]),
            u16::from_be_bytes([self.0[4], self.0[5]]),
        ]
    }

    /// True for the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// True for any multicast address (low bit of the first octet set),
    /// including the IPv6-multicast-derived `33:33:xx:xx:xx:xx` range whose
    /// first word is `0x3333`.
    pub fn is_multicast(&self) -> bool {
        (self.0[0] & 0x01) != 0
    }
}

impl core::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// A parsed (or to-be-built) Ethernet frame.
#[derive(Debug, Clone)]
pub struct EthernetFrame {
    pub dest_mac: MacAddress,
    pub src_mac: MacAddress,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    /// Header size: two addresses plus the EtherType field.
    pub const HEADER_SIZE: usize = 14;
    /// Minimum total frame size, including padding, excluding the FCS.
    pub const MIN_SIZE: usize = 60;

    /// Parses a frame out of raw bytes as handed up by the link driver.
    /// Returns `None` on anything shorter than a header; malformed frames
    /// are the caller's (ingress pipeline's) responsibility to drop.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::HEADER_SIZE {
            return None;
        }
        let dest_mac = MacAddress::from_bytes(&data[0..6])?;
        let src_mac = MacAddress::from_bytes(&data[6..12])?;
        let ethertype = u16::from_be_bytes([data[12], data[13]]);
        let payload = data[Self::HEADER_SIZE..].to_vec();
        Some(Self {
            dest_mac,
            src_mac,
            ethertype,
            payload,
        })
    }

    /// Serializes the frame, padding the total size to the Ethernet minimum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.dest_mac.0);
        bytes.extend_from_slice(&self.src_mac.0);
        bytes.extend_from_slice(&self.ethertype.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        while bytes.len() < Self::MIN_SIZE {
            bytes.push(0);
        }
        bytes
    }

    /// Builds a new frame ready for `to_bytes`.
    pub fn new(dest_mac: MacAddress, src_mac: MacAddress, ethertype: u16, payload: Vec<u8>) -> Self {
        Self {
            dest_mac,
            src_mac,
            ethertype,
            payload,
        }
    }

    /// True if this frame should be passed up to the IPv6 handler: the
    /// destination matches our own address, or it is a multicast frame
    /// (first word `0x3333`, the IPv6-multicast-derived range).
    pub fn is_for_us(&self, our_mac: &MacAddress) -> bool {
        self.dest_mac == *our_mac || self.dest_mac.words()[0] == 0x3333 || self.dest_mac.is_broadcast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;
    use alloc::vec;

    #[test]
    fn mac_address_display() {
        let mac = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(format!("{}", mac), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn frame_roundtrip() {
        let frame = EthernetFrame::new(
            MacAddress::BROADCAST,
            MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            ETHERTYPE_IPV6,
            vec![1, 2, 3, 4],
        );
        let bytes = frame.to_bytes();
        let parsed = EthernetFrame::parse(&bytes).unwrap();
        assert_eq!(parsed.dest_mac, frame.dest_mac);
        assert_eq!(parsed.src_mac, frame.src_mac);
        assert_eq!(parsed.ethertype, frame.ethertype);
    }

    #[test]
    fn multicast_frame_is_for_us() {
        let frame = EthernetFrame::new(
            MacAddress::new([0x33, 0x33, 0, 0, 0, 1]),
            MacAddress::ZERO,
            ETHERTYPE_IPV6,
            vec![],
        );
        let our_mac = MacAddress::new([0x00, 0x80, 0xc5, 0x80, 0xc5, 0x3a]);
        assert!(frame.is_for_us(&our_mac));
    }

    #[test]
    fn unicast_frame_for_other_host_is_dropped() {
        let frame = EthernetFrame::new(
            MacAddress::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
            MacAddress::ZERO,
            ETHERTYPE_IPV6,
            vec![],
        );
        let our_mac = MacAddress::new([0x00, 0x80, 0xc5, 0x80, 0xc5, 0x3a]);
        assert!(!frame.is_for_us(&our_mac));
    }
}
