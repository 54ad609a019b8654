//! `std`-only test scaffolding: an in-memory loopback queue plus a thin
//! `Harness` that drives an [`Engine`] without a real NIC or async runtime
//! so end-to-end scenarios can be written as ordinary `#[test]` functions.

use std::vec::Vec;

use spin::Mutex;

use crate::engine::Engine;
use crate::error::EsixError;
use crate::ethernet::MacAddress;
use crate::ipv6::Ipv6Address;

/// An in-memory frame queue standing in for a NIC: `send` appends, `drain`
/// empties.
pub struct LoopbackDevice {
    queue: Mutex<Vec<Vec<u8>>>,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self { queue: Mutex::new(Vec::new()) }
    }

    /// Hands a frame to the device, as a driver would on egress.
    pub fn send(&self, frame: Vec<u8>) {
        self.queue.lock().push(frame);
    }

    /// Takes every queued frame, leaving the device empty.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut *self.queue.lock())
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Bundles an [`Engine`] with an egress sink so a test can call `deliver`
/// and `tick` without separately threading an egress vector through every
/// call, mirroring how a real driver loop would pair the engine with a
/// device.
pub struct Harness {
    pub engine: Engine,
    pub egress: Vec<Vec<u8>>,
}

impl Harness {
    /// Builds a harness and runs `init`, returning any autoconfiguration
    /// traffic (the Router Solicitation) already drained from `egress`.
    pub fn new(lla: MacAddress) -> Result<Self, EsixError> {
        let mut engine = Engine::new(lla);
        let mut egress = Vec::new();
        engine.init(&mut egress)?;
        Ok(Self { engine, egress })
    }

    /// Delivers one inbound Ethernet frame and runs the ingress pipeline.
    pub fn deliver(&mut self, frame: Vec<u8>) {
        self.engine.enqueue(frame);
        self.engine.process_ingress(&mut self.egress);
    }

    /// Advances the clock by one tick, running aging/DAD/retransmit sweeps.
    pub fn tick(&mut self) {
        self.engine.periodic_callback(&mut self.egress);
    }

    /// Advances the clock by `n` ticks.
    pub fn tick_n(&mut self, n: u32) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Drains and returns everything queued in `egress` so far.
    pub fn drain_egress(&mut self) -> Vec<Vec<u8>> {
        core::mem::take(&mut self.egress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_HOP_LIMIT;
    use crate::ethernet::{EthernetFrame, ETHERTYPE_IPV6};
    use crate::icmpv6;
    use crate::ipv6::{Ipv6Packet, NEXT_HEADER_ICMPV6, NEXT_HEADER_TCP};
    use crate::socket::{self, Protocol};
    use crate::tcp::{TcpFlags, TcpSegment};

    fn mac() -> MacAddress {
        MacAddress::new([0x00, 0x80, 0xc5, 0x80, 0xc5, 0x3a])
    }

    fn router_mac() -> MacAddress {
        MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55])
    }

    /// Surfaces `trace!`/`debug!` drop and state-transition logging when a
    /// single test is run with `--nocapture`; a no-op on repeat calls.
    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Scenario 3 (§8): an RA carrying a Prefix Information option and a
    /// nonzero router lifetime installs both a global address and a
    /// default route, both bearing the advertised lifetimes.
    #[test]
    fn ra_installs_global_prefix_and_default_route() {
        init_logging();
        let mut h = Harness::new(mac()).unwrap();
        h.tick(); // let link-local DAD resolve
        h.drain_egress();

        let router = Ipv6Address([0xfe80_0000, 0, 0, 0xfeed]);
        let ll = Ipv6Address::link_local_from_mac(&mac());
        let prefix = Ipv6Address([0x2001_0db8, 0, 0, 0]);

        let mut ra = vec![0u8; 16];
        ra[0] = icmpv6::msg_type::ROUTER_ADVERTISEMENT;
        ra[4] = DEFAULT_HOP_LIMIT;
        ra[6..8].copy_from_slice(&1800u16.to_be_bytes());

        let mut prefix_opt = vec![icmpv6::opt_type::PREFIX_INFO, 4];
        prefix_opt.push(64); // prefix length
        prefix_opt.push(0); // flags
        prefix_opt.extend_from_slice(&3600u32.to_be_bytes()); // valid lifetime
        prefix_opt.extend_from_slice(&3600u32.to_be_bytes()); // preferred lifetime
        prefix_opt.extend_from_slice(&[0u8; 4]); // reserved
        prefix_opt.extend_from_slice(&prefix.to_bytes());
        ra.extend_from_slice(&prefix_opt);

        let ra_bytes = icmpv6::finish(ra, &router, &ll);
        let ip_pkt = Ipv6Packet::new(NEXT_HEADER_ICMPV6, 255, router, ll, ra_bytes);
        let frame = EthernetFrame::new(mac(), router_mac(), ETHERTYPE_IPV6, ip_pkt.to_bytes());

        h.deliver(frame.to_bytes());
        h.tick(); // let the newly installed global address's DAD resolve

        let global = Ipv6Address::global_from_prefix(&prefix, &mac());
        assert!(h.engine.iface().owns_addr(&global));
        let route = h
            .engine
            .iface()
            .routes()
            .iter()
            .find(|r| r.next_hop == router)
            .expect("default route via advertised router");
        assert_eq!(route.expiration, 1801);
    }

    /// Scenario 5 (§8): a full 3-way handshake followed by one acknowledged
    /// data segment leaves the retransmit queue empty.
    #[test]
    fn tcp_handshake_and_ack_clears_retransmit_queue() {
        init_logging();
        let mut h = Harness::new(mac()).unwrap();
        h.tick(); // let link-local DAD resolve
        h.drain_egress();

        let peer = Ipv6Address([0xfe80_0000, 0, 0, 0x1234]);
        let peer_mac = MacAddress::new([0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
        h.engine.iface_mut().add_neighbor(peer, peer_mac, 0).unwrap();

        let id = h.engine.socket(Protocol::Stream).unwrap();
        h.engine.connect(id, peer, 80, &mut h.egress).unwrap();
        let syn_frame = EthernetFrame::parse(&h.egress[0]).unwrap();
        let syn_pkt = Ipv6Packet::parse(&syn_frame.payload).unwrap();
        let syn = TcpSegment::parse(&syn_pkt.payload).unwrap();
        h.drain_egress();

        let ll = Ipv6Address::link_local_from_mac(&mac());
        let synack = TcpSegment::build(&peer, &ll, 80, syn.src_port, 1000, syn.seq.wrapping_add(1), TcpFlags::SYN | TcpFlags::ACK, 1400, &[]);
        let ip_pkt = Ipv6Packet::new(NEXT_HEADER_TCP, 64, peer, ll, synack);
        let frame = EthernetFrame::new(mac(), peer_mac, ETHERTYPE_IPV6, ip_pkt.to_bytes());
        h.deliver(frame.to_bytes());
        assert_eq!(h.engine.socket_state(id), Some(socket::State::Established));
        h.drain_egress();

        h.engine.send(id, None, b"GET", &mut h.egress).unwrap();
        let data_frame = EthernetFrame::parse(&h.egress[0]).unwrap();
        let data_pkt = Ipv6Packet::parse(&data_frame.payload).unwrap();
        let data_seg = TcpSegment::parse(&data_pkt.payload).unwrap();
        h.drain_egress();

        let ack = TcpSegment::build(&peer, &ll, 80, syn.src_port, 1001, data_seg.seq.wrapping_add(data_seg.payload.len() as u32), TcpFlags::ACK, 1400, &[]);
        let ip_pkt = Ipv6Packet::new(NEXT_HEADER_TCP, 64, peer, ll, ack);
        let frame = EthernetFrame::new(mac(), peer_mac, ETHERTYPE_IPV6, ip_pkt.to_bytes());
        h.deliver(frame.to_bytes());

        assert_eq!(h.engine.socket_queue_len(id), 0);
        assert_eq!(h.engine.socket_state(id), Some(socket::State::Established));
    }
}
