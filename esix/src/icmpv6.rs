//! ICMPv6 and Neighbor Discovery (RFC 4443 / RFC 4861): RS/RA, NS/NA, echo,
//! TTL-exceeded, destination-unreachable, Duplicate Address Detection, and
//! MLDv1 membership reports.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::{ICMP_ERROR_QUOTE_MAX, ND_HOP_LIMIT, NEIGHBOR_TIMEOUT, NEW_NEIGHBOR_TIMEOUT};
use crate::ethernet::MacAddress;
use crate::interface::{Interface, NeighborStatus};
use crate::ipv6::{upper_layer_checksum, AddrType, Ipv6Address, NEXT_HEADER_ICMPV6};

/// ICMPv6 message type bytes (§4.3.1).
pub mod msg_type {
    pub const DEST_UNREACHABLE: u8 = 0x01;
    pub const PACKET_TOO_BIG: u8 = 0x02;
    pub const TIME_EXCEEDED: u8 = 0x03;
    pub const PARAMETER_PROBLEM: u8 = 0x04;
    pub const ECHO_REQUEST: u8 = 0x80;
    pub const ECHO_REPLY: u8 = 0x81;
    pub const MLD_QUERY: u8 = 0x82;
    pub const MLD_REPORT: u8 = 0x83;
    pub const MLD_DONE: u8 = 0x84;
    pub const ROUTER_SOLICITATION: u8 = 0x85;
    pub const ROUTER_ADVERTISEMENT: u8 = 0x86;
    pub const NEIGHBOR_SOLICITATION: u8 = 0x87;
    pub const NEIGHBOR_ADVERTISEMENT: u8 = 0x88;
    pub const MLDV2_REPORT: u8 = 0x8f;
}

/// Destination-unreachable codes (§4.3.1).
pub mod unreach_code {
    pub const NO_ROUTE: u8 = 0;
    pub const ADMIN_PROHIBITED: u8 = 1;
    pub const ADDRESS_UNREACHABLE: u8 = 3;
    pub const PORT_UNREACHABLE: u8 = 4;
}

/// Neighbor Discovery option types.
pub mod opt_type {
    pub const SOURCE_LLA: u8 = 0x01;
    pub const TARGET_LLA: u8 = 0x02;
    pub const PREFIX_INFO: u8 = 0x03;
    pub const MTU: u8 = 0x05;
}

const NA_FLAG_ROUTER: u8 = 0x80;
const NA_FLAG_SOLICITED: u8 = 0x40;
const NA_FLAG_OVERRIDE: u8 = 0x20;

/// A parsed Neighbor Discovery option.
#[derive(Debug, Clone)]
pub enum NdOption {
    SourceLla(MacAddress),
    TargetLla(MacAddress),
    Mtu(u32),
    PrefixInfo {
        prefix_len: u8,
        valid_lifetime: u32,
        preferred_lifetime: u32,
        prefix: Ipv6Address,
    },
    /// An option type this stack does not interpret; `length` is the raw
    /// 8-octet-unit length field so the walker can still skip past it.
    Unknown { option_type: u8, length: u8 },
}

/// Walks a TLV option stream. A zero-length option is malformed per §4.3
/// and aborts the walk, returning everything parsed so far along with a
/// flag indicating truncation.
pub fn parse_options(mut data: &[u8]) -> (Vec<NdOption>, bool) {
    let mut options = Vec::new();
    while data.len() >= 8 {
        let option_type = data[0];
        let length = data[1];
        if length == 0 {
            return (options, true);
        }
        let total = length as usize * 8;
        if data.len() < total {
            return (options, true);
        }
        let payload = &data[2..total];
        let option = match option_type {
            opt_type::SOURCE_LLA if payload.len() >= 6 => {
                NdOption::SourceLla(MacAddress::from_bytes(&payload[0..6]).unwrap())
            }
            opt_type::TARGET_LLA if payload.len() >= 6 => {
                NdOption::TargetLla(MacAddress::from_bytes(&payload[0..6]).unwrap())
            }
            opt_type::MTU if payload.len() >= 6 => {
                NdOption::Mtu(u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]))
            }
            opt_type::PREFIX_INFO if payload.len() >= 30 => {
                let prefix_len = payload[0];
                let valid_lifetime =
                    u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]);
                let preferred_lifetime =
                    u32::from_be_bytes([payload[6], payload[7], payload[8], payload[9]]);
                let prefix = Ipv6Address::from_bytes(&payload[14..30]).unwrap();
                NdOption::PrefixInfo {
                    prefix_len,
                    valid_lifetime,
                    preferred_lifetime,
                    prefix,
                }
            }
            other => NdOption::Unknown {
                option_type: other,
                length,
            },
        };
        options.push(option);
        data = &data[total..];
    }
    (options, false)
}

fn encode_lla_option(option_type: u8, mac: &MacAddress) -> Vec<u8> {
    let mut out = vec![option_type, 1];
    out.extend_from_slice(mac.as_bytes());
    out
}

/// A fully-built ICMPv6 message ready for IPv6 transmit: destination
/// address, hop limit, and serialized ICMPv6 payload (type/code/checksum
/// placeholder already zeroed, filled by [`finish`]).
pub struct IcmpMessage {
    pub dst: Ipv6Address,
    pub hop_limit: u8,
    pub bytes: Vec<u8>,
}

/// Fills in the ICMPv6 checksum field (bytes 2..4) given the source the
/// packet will ultimately be sent from.
pub fn finish(mut bytes: Vec<u8>, src: &Ipv6Address, dst: &Ipv6Address) -> Vec<u8> {
    bytes[2] = 0;
    bytes[3] = 0;
    let csum = upper_layer_checksum(src, dst, NEXT_HEADER_ICMPV6, &bytes);
    bytes[2..4].copy_from_slice(&csum.to_be_bytes());
    bytes
}

/// Verifies the ICMPv6 pseudo-header checksum is zero over the full message.
pub fn checksum_ok(src: &Ipv6Address, dst: &Ipv6Address, payload: &[u8]) -> bool {
    upper_layer_checksum(src, dst, NEXT_HEADER_ICMPV6, payload) == 0
}

/// Builds a Router Solicitation: destination `ff02::2`, hop limit 255,
/// Source LLA option.
pub fn build_router_solicitation(our_lla: &MacAddress) -> IcmpMessage {
    let mut bytes = vec![msg_type::ROUTER_SOLICITATION, 0, 0, 0, 0, 0, 0, 0];
    bytes.extend_from_slice(&encode_lla_option(opt_type::SOURCE_LLA, our_lla));
    IcmpMessage {
        dst: Ipv6Address::ALL_ROUTERS,
        hop_limit: ND_HOP_LIMIT,
        bytes,
    }
}

/// Builds a Neighbor Solicitation for `target`, from `src` (the
/// unspecified address `::` during DAD, or an assigned unicast address
/// otherwise) toward the solicited-node multicast of `target`.
pub fn build_neighbor_solicitation(target: &Ipv6Address, our_lla: Option<&MacAddress>) -> IcmpMessage {
    let mut bytes = vec![msg_type::NEIGHBOR_SOLICITATION, 0, 0, 0, 0, 0, 0, 0];
    bytes.extend_from_slice(&target.to_bytes());
    if let Some(lla) = our_lla {
        bytes.extend_from_slice(&encode_lla_option(opt_type::SOURCE_LLA, lla));
    }
    IcmpMessage {
        dst: target.solicited_node(),
        hop_limit: ND_HOP_LIMIT,
        bytes,
    }
}

/// Builds a Neighbor Advertisement for `target`, addressed to `dst`
/// (the original solicitor, or `ff02::1` for an unsolicited gratuitous NA).
pub fn build_neighbor_advertisement(
    target: &Ipv6Address,
    dst: Ipv6Address,
    our_lla: &MacAddress,
    solicited: bool,
) -> IcmpMessage {
    let mut flags = NA_FLAG_OVERRIDE;
    if solicited {
        flags |= NA_FLAG_SOLICITED;
    }
    let _ = NA_FLAG_ROUTER; // this host never acts as a router
    let mut bytes = vec![msg_type::NEIGHBOR_ADVERTISEMENT, 0, 0, 0, flags, 0, 0, 0];
    bytes.extend_from_slice(&target.to_bytes());
    bytes.extend_from_slice(&encode_lla_option(opt_type::TARGET_LLA, our_lla));
    IcmpMessage {
        dst,
        hop_limit: ND_HOP_LIMIT,
        bytes,
    }
}

/// Builds an Echo Reply carrying the same identifier, sequence and payload
/// as the Echo Request it answers.
pub fn build_echo_reply(dst: Ipv6Address, identifier: u16, sequence: u16, payload: &[u8]) -> IcmpMessage {
    let mut bytes = vec![msg_type::ECHO_REPLY, 0, 0, 0];
    bytes.extend_from_slice(&identifier.to_be_bytes());
    bytes.extend_from_slice(&sequence.to_be_bytes());
    bytes.extend_from_slice(payload);
    IcmpMessage {
        dst,
        hop_limit: crate::config::DEFAULT_HOP_LIMIT,
        bytes,
    }
}

/// Builds a Time Exceeded (hop-limit-exceeded) reply quoting up to
/// `ICMP_ERROR_QUOTE_MAX` bytes of the original packet.
pub fn build_time_exceeded(dst: Ipv6Address, original_packet: &[u8]) -> IcmpMessage {
    build_error(msg_type::TIME_EXCEEDED, 0, dst, original_packet)
}

/// Builds a Destination Unreachable reply.
pub fn build_dest_unreachable(code: u8, dst: Ipv6Address, original_packet: &[u8]) -> IcmpMessage {
    build_error(msg_type::DEST_UNREACHABLE, code, dst, original_packet)
}

fn build_error(icmp_type: u8, code: u8, dst: Ipv6Address, original_packet: &[u8]) -> IcmpMessage {
    let quote_len = original_packet.len().min(ICMP_ERROR_QUOTE_MAX);
    let mut bytes = vec![icmp_type, code, 0, 0, 0, 0, 0, 0];
    bytes.extend_from_slice(&original_packet[..quote_len]);
    IcmpMessage {
        dst,
        hop_limit: crate::config::DEFAULT_HOP_LIMIT,
        bytes,
    }
}

/// Builds an MLDv1 report for a single joined multicast address.
pub fn build_mld_report(group: Ipv6Address) -> IcmpMessage {
    let mut bytes = vec![msg_type::MLD_REPORT, 0, 0, 0, 0, 0, 0, 0];
    bytes.extend_from_slice(&group.to_bytes());
    IcmpMessage {
        dst: group,
        hop_limit: ND_HOP_LIMIT,
        bytes,
    }
}

/// Outcome of processing a received ICMPv6 message: zero or more reply
/// messages to transmit, plus any interface-table side effects already
/// applied by the caller (NS/NA/RA handlers mutate `iface` directly).
pub struct IcmpOutcome {
    pub replies: Vec<IcmpMessage>,
}

impl IcmpOutcome {
    fn none() -> Self {
        Self { replies: Vec::new() }
    }
    fn one(msg: IcmpMessage) -> Self {
        Self { replies: vec![msg] }
    }
}

/// Result of a Router Advertisement parse: an address installation the
/// caller should perform via `Engine::add_addr` (to run DAD), expressed as
/// a value since `iface` is borrowed immutably while options are walked.
pub struct RaEffects {
    pub default_route: Option<RouteUpdate>,
    pub prefix_addr: Option<AddrUpdate>,
}

pub struct RouteUpdate {
    pub next_hop: Ipv6Address,
    pub ttl: u8,
    pub mtu: u32,
    pub lifetime: u32,
}

pub struct AddrUpdate {
    pub addr: Ipv6Address,
    pub masklen: u8,
    pub valid_lifetime: u32,
    pub install: bool,
}

/// Receive-side sanity checks shared by NS/NA/RA (§4.3).
fn nd_sanity_ok(src: &Ipv6Address, hop_limit: u8, payload: &[u8], min_len: usize) -> bool {
    hop_limit == ND_HOP_LIMIT && payload.len() >= min_len && !src.is_multicast()
}

/// Handles a received Router Advertisement. `src` must be link-local
/// (§4.3); the header's hop limit became `cur_hlim` carried in the RA body
/// at offset 4.
pub fn handle_router_advertisement(src: &Ipv6Address, payload: &[u8]) -> Option<RaEffects> {
    if payload.len() < 16 || !src.is_link_local() {
        return None;
    }
    let cur_hlim = payload[4];
    let router_lifetime = u16::from_be_bytes([payload[6], payload[7]]) as u32;
    let (options, malformed) = parse_options(&payload[16..]);
    if malformed {
        return None;
    }

    let mut mtu = crate::config::DEFAULT_MTU;
    let mut prefix_addr = None;
    for opt in &options {
        match opt {
            NdOption::Mtu(m) => mtu = *m,
            NdOption::PrefixInfo {
                prefix_len,
                valid_lifetime,
                prefix,
                ..
            } if *prefix_len == 64 => {
                prefix_addr = Some(AddrUpdate {
                    addr: *prefix,
                    masklen: *prefix_len,
                    valid_lifetime: *valid_lifetime,
                    install: *valid_lifetime != 0,
                });
            }
            _ => {}
        }
    }

    let default_route = Some(RouteUpdate {
        next_hop: *src,
        ttl: cur_hlim,
        mtu,
        lifetime: router_lifetime,
    });

    Some(RaEffects {
        default_route,
        prefix_addr,
    })
}

/// Handles a received Neighbor Solicitation: §4.3 "if target is assigned
/// to this interface, record the sender ... then send a solicited NA".
/// Also serves DAD conflict detection: if `target` matches a tentative
/// address of ours and `src` is not `::`, the caller should treat this as
/// a duplicate (someone else is soliciting the address we're probing,
/// meaning at minimum two hosts contend for it).
pub fn handle_neighbor_solicitation(
    iface: &mut Interface,
    src: &Ipv6Address,
    hop_limit: u8,
    payload: &[u8],
    now: u64,
) -> IcmpOutcome {
    if !nd_sanity_ok(src, hop_limit, payload, 24) {
        return IcmpOutcome::none();
    }
    let target = match Ipv6Address::from_bytes(&payload[8..24]) {
        Some(t) if !t.is_multicast() => t,
        _ => return IcmpOutcome::none(),
    };
    if !iface.owns_addr(&target) {
        return IcmpOutcome::none();
    }
    if src.is_unspecified() {
        // DAD probe from another host; we never learn their LLA from this,
        // only from the Source LLA option on their own NS to us, which a
        // `::`-sourced probe does not carry. No NA is sent per RFC 4861 §7.2.4.
        return IcmpOutcome::none();
    }

    let (options, _) = parse_options(&payload[24..]);
    for opt in options {
        if let NdOption::SourceLla(mac) = opt {
            let _ = iface.add_neighbor(*src, mac, now + NEW_NEIGHBOR_TIMEOUT);
            if let Some(n) = iface.get_neighbor_mut(src) {
                n.status = NeighborStatus::Stale;
            }
        }
    }

    let na = build_neighbor_advertisement(&target, *src, &iface.lla, true);
    IcmpOutcome::one(na)
}

/// Handles a received Neighbor Advertisement (§3, §4.3): updates or
/// creates the neighbor entry for the target, honoring the solicited-flag
/// cache-poisoning defense.
pub fn handle_neighbor_advertisement(iface: &mut Interface, src: &Ipv6Address, hop_limit: u8, payload: &[u8], now: u64) {
    if !nd_sanity_ok(src, hop_limit, payload, 24) {
        return;
    }
    let flags = payload[4];
    let solicited = flags & NA_FLAG_SOLICITED != 0;
    let target = match Ipv6Address::from_bytes(&payload[8..24]) {
        Some(t) => t,
        None => return,
    };
    let (options, _) = parse_options(&payload[24..]);
    let mac = options.into_iter().find_map(|o| match o {
        NdOption::TargetLla(m) => Some(m),
        _ => None,
    });
    let Some(mac) = mac else { return };

    match iface.get_neighbor_mut(&target) {
        Some(existing) => {
            if !existing.is_solicited && !solicited {
                // defensive: an unconfirmed entry is not overwritten by a
                // further unsolicited NA (§4.3 cache-poisoning check).
                return;
            }
            existing.eth = mac;
            existing.is_solicited = solicited;
            if solicited {
                existing.status = NeighborStatus::Reachable;
                existing.expiration = now + NEIGHBOR_TIMEOUT;
            }
        }
        None => {
            if let Ok(entry) = iface.add_neighbor(target, mac, if solicited { now + NEIGHBOR_TIMEOUT } else { now + NEW_NEIGHBOR_TIMEOUT }) {
                entry.is_solicited = solicited;
                entry.status = if solicited {
                    NeighborStatus::Reachable
                } else {
                    NeighborStatus::Stale
                };
            }
        }
    }
}

/// Handles a received Echo Request.
pub fn handle_echo_request(src: &Ipv6Address, payload: &[u8]) -> IcmpOutcome {
    if payload.len() < 4 {
        return IcmpOutcome::none();
    }
    let identifier = u16::from_be_bytes([payload[0], payload[1]]);
    let sequence = u16::from_be_bytes([payload[2], payload[3]]);
    IcmpOutcome::one(build_echo_reply(*src, identifier, sequence, &payload[4..]))
}

/// Handles an MLDv1 query (§4.3): general queries (target `::`) get a
/// report per joined group excluding all-nodes; specific queries get a
/// report only if that group is joined.
pub fn handle_mld_query(iface: &Interface, payload: &[u8]) -> IcmpOutcome {
    if payload.len() < 20 {
        return IcmpOutcome::none();
    }
    let target = Ipv6Address::from_bytes(&payload[4..20]).unwrap_or(Ipv6Address::UNSPECIFIED);
    let mut replies = Vec::new();
    if target.is_unspecified() {
        for group in iface.joined_multicast() {
            if *group != Ipv6Address::ALL_NODES {
                replies.push(build_mld_report(*group));
            }
        }
    } else if iface.joined_multicast().contains(&target) {
        replies.push(build_mld_report(target));
    }
    IcmpOutcome { replies }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::MacAddress;

    fn mac() -> MacAddress {
        MacAddress::new([0x00, 0x80, 0xc5, 0x80, 0xc5, 0x3a])
    }

    #[test]
    fn neighbor_solicitation_for_our_address_yields_solicited_na() {
        let mut iface = Interface::new(mac());
        let lla = Ipv6Address::link_local_from_mac(&mac());
        iface.add_addr(lla, 64, 0, AddrType::LinkLocal).unwrap();
        iface.confirm_addr(&lla);

        let peer = Ipv6Address([0xfe80_0000, 0, 0, 0x1234]);
        let mut payload = vec![0u8; 8];
        payload.extend_from_slice(&lla.to_bytes());
        payload.extend_from_slice(&encode_lla_option(
            opt_type::SOURCE_LLA,
            &MacAddress::new([0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]),
        ));

        let outcome = handle_neighbor_solicitation(&mut iface, &peer, ND_HOP_LIMIT, &payload, 0);
        assert_eq!(outcome.replies.len(), 1);
        assert_eq!(outcome.replies[0].dst, peer);
        assert_eq!(outcome.replies[0].bytes[0], msg_type::NEIGHBOR_ADVERTISEMENT);
        assert_ne!(outcome.replies[0].bytes[4] & NA_FLAG_SOLICITED, 0);

        let neighbor = iface.get_neighbor(&peer).unwrap();
        assert_eq!(
            neighbor.eth,
            MacAddress::new([0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee])
        );
    }

    #[test]
    fn ra_with_prefix_info_yields_route_and_addr_update() {
        let src = Ipv6Address([0xfe80_0000, 0, 0, 0xfeed]);
        let mut payload = vec![0u8; 16];
        payload[4] = 64; // cur_hlim
        payload[6..8].copy_from_slice(&1800u16.to_be_bytes());

        let mut prefix_opt = vec![opt_type::PREFIX_INFO, 4]; // length=4*8=32 bytes
        prefix_opt.push(64); // prefix length
        prefix_opt.push(0); // flags
        prefix_opt.extend_from_slice(&3600u32.to_be_bytes()); // valid lifetime
        prefix_opt.extend_from_slice(&3600u32.to_be_bytes()); // preferred lifetime
        prefix_opt.extend_from_slice(&[0u8; 4]); // reserved
        prefix_opt.extend_from_slice(&Ipv6Address([0x2001_0db8, 0, 0, 0]).to_bytes());
        assert_eq!(prefix_opt.len(), 32);
        payload.extend_from_slice(&prefix_opt);

        let effects = handle_router_advertisement(&src, &payload).unwrap();
        let route = effects.default_route.unwrap();
        assert_eq!(route.next_hop, src);
        assert_eq!(route.lifetime, 1800);
        let addr = effects.prefix_addr.unwrap();
        assert_eq!(addr.valid_lifetime, 3600);
        assert!(addr.install);
    }

    #[test]
    fn malformed_option_length_drops_the_packet() {
        let src = Ipv6Address([0xfe80_0000, 0, 0, 0xfeed]);
        let mut payload = vec![0u8; 16];
        payload.extend_from_slice(&[opt_type::MTU, 0, 0, 0, 0, 0, 0, 0]);
        assert!(handle_router_advertisement(&src, &payload).is_none());
    }

    #[test]
    fn echo_request_reply_carries_same_id_seq_and_payload() {
        let src = Ipv6Address([0x2001_0db8, 0, 0, 1]);
        let mut payload = vec![0x12, 0x34, 0x00, 0x05];
        payload.extend_from_slice(b"ping");
        let outcome = handle_echo_request(&src, &payload);
        assert_eq!(outcome.replies.len(), 1);
        let reply = &outcome.replies[0].bytes;
        assert_eq!(reply[0], msg_type::ECHO_REPLY);
        assert_eq!(&reply[4..8], &payload[0..4]);
        assert_eq!(&reply[8..], b"ping");
    }
}
