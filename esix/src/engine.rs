//! The core: interface autoconfiguration, the ingress/egress pipeline,
//! and the timer-driven sweeps (DAD, ND aging, TCP retransmission).
//!
//! Per §5, the ingress queue is the only structure touched from more than
//! one execution context (a link-driver callback pushing frames, and the
//! worker draining them), so it alone is `spin::Mutex`-guarded; every
//! other field here is only ever touched from the worker.

use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{DAD_TIMEOUT_SECS, DEFAULT_HOP_LIMIT, DEFAULT_MTU, DUP_ADDR_DETECT_TRANSMITS};
use crate::error::EsixError;
use crate::ethernet::{EthernetFrame, MacAddress, ETHERTYPE_IPV6};
use crate::icmpv6;
use crate::interface::{Interface, RouteEntry};
use crate::ipv6::{self, AddrType, Ipv6Address, Ipv6Packet, NEXT_HEADER_ICMPV6, NEXT_HEADER_TCP, NEXT_HEADER_UDP};
use crate::socket::{self, Protocol, SocketId, SocketTable};
use crate::tcp::{TcpFlags, TcpSegment};
use crate::udp::UdpDatagram;

/// Tracks an in-progress Duplicate Address Detection probe for a tentative
/// address added via [`Engine::add_addr`] (§4.3, §9.1 DAD async-completion
/// note: `add_addr` only *queues* DAD; the outcome lands on a later
/// `periodic_callback`/ingress turn, not synchronously).
struct DadState {
    addr: Ipv6Address,
    masklen: u8,
    addr_type: AddrType,
    remaining_transmits: u32,
    deadline: u64,
}

/// The IPv6 engine: interface state, the socket table, the clock, and the
/// cross-thread ingress queue (§2, §5).
pub struct Engine {
    iface: Interface,
    sockets: SocketTable,
    now: u64,
    dad_pending: Vec<DadState>,
    ingress: Mutex<Vec<Vec<u8>>>,
}

impl Engine {
    /// Constructs an engine with an empty interface; call [`Engine::init`]
    /// to run autoconfiguration before processing any traffic.
    pub fn new(lla: MacAddress) -> Self {
        Self {
            iface: Interface::new(lla),
            sockets: SocketTable::new(),
            now: 0,
            dad_pending: Vec::new(),
            ingress: Mutex::new(Vec::new()),
        }
    }

    pub fn iface(&self) -> &Interface {
        &self.iface
    }

    pub fn iface_mut(&mut self) -> &mut Interface {
        &mut self.iface
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// `init(lla)` (§6, exact sequence per §12): derives and installs the
    /// link-local address (triggering DAD), pins a permanent neighbor
    /// entry for self-addressed traffic, joins all-nodes, installs the
    /// default on-link routes, and emits a Router Solicitation.
    pub fn init(&mut self, egress: &mut Vec<Vec<u8>>) -> Result<(), EsixError> {
        let lla = self.iface.lla;
        let link_local = Ipv6Address::link_local_from_mac(&lla);

        self.add_addr(link_local, 128, 0, AddrType::LinkLocal, egress)?;
        self.iface.add_neighbor(link_local, lla, 0)?;

        self.add_addr(Ipv6Address::ALL_NODES, 128, 0, AddrType::Multicast, egress)?;

        let fe80_mask = RouteEntry::mask_for_len(64);
        self.iface.add_route(
            Ipv6Address([0xfe80_0000, 0, 0, 0]).masked_by(&fe80_mask),
            fe80_mask,
            Ipv6Address::UNSPECIFIED,
            0,
            DEFAULT_HOP_LIMIT,
            DEFAULT_MTU,
        )?;
        let ff00_mask = RouteEntry::mask_for_len(8);
        self.iface.add_route(
            Ipv6Address([0xff00_0000, 0, 0, 0]).masked_by(&ff00_mask),
            ff00_mask,
            Ipv6Address::UNSPECIFIED,
            0,
            DEFAULT_HOP_LIMIT,
            DEFAULT_MTU,
        )?;

        let rs = icmpv6::build_router_solicitation(&lla);
        let bytes = icmpv6::finish(rs.bytes, &link_local, &rs.dst);
        ipv6::send_payload(&mut self.iface, link_local, rs.dst, NEXT_HEADER_ICMPV6, rs.hop_limit, bytes, egress);
        Ok(())
    }

    /// Installs an address. Multicast addresses are installed immediately
    /// (no DAD). Unicast addresses are installed tentatively together with
    /// their solicited-node multicast entry (§3 invariant (a)), and a DAD
    /// probe is queued; the address becomes usable once
    /// `periodic_callback` runs the probe to completion.
    pub fn add_addr(
        &mut self,
        addr: Ipv6Address,
        masklen: u8,
        expiration: u64,
        addr_type: AddrType,
        egress: &mut Vec<Vec<u8>>,
    ) -> Result<(), EsixError> {
        if addr_type == AddrType::Multicast {
            self.iface.add_addr(addr, masklen, expiration, addr_type)?;
            self.iface.join_multicast(addr);
            return Ok(());
        }

        self.iface.add_addr(addr, masklen, expiration, addr_type)?;
        let solicited_node = addr.solicited_node();
        self.iface.add_addr(solicited_node, 128, 0, AddrType::Multicast)?;
        self.iface.join_multicast(solicited_node);

        self.dad_pending.push(DadState {
            addr,
            masklen,
            addr_type,
            remaining_transmits: DUP_ADDR_DETECT_TRANSMITS,
            deadline: 0,
        });
        let idx = self.dad_pending.len() - 1;
        self.send_dad_probe(idx, egress);
        Ok(())
    }

    fn send_dad_probe(&mut self, idx: usize, egress: &mut Vec<Vec<u8>>) {
        let target = self.dad_pending[idx].addr;
        let msg = icmpv6::build_neighbor_solicitation(&target, None);
        let bytes = icmpv6::finish(msg.bytes, &Ipv6Address::UNSPECIFIED, &msg.dst);
        ipv6::send_payload(&mut self.iface, Ipv6Address::UNSPECIFIED, msg.dst, NEXT_HEADER_ICMPV6, msg.hop_limit, bytes, egress);
        let dad = &mut self.dad_pending[idx];
        dad.remaining_transmits -= 1;
        dad.deadline = self.now + DAD_TIMEOUT_SECS;
    }

    /// Called when a Neighbor Advertisement resolves `target`: if a DAD
    /// probe is outstanding for that address, another host already holds
    /// it (§4.3 "fail the add if a neighbor for that address appears").
    fn check_dad_conflict(&mut self, target: Ipv6Address) {
        if let Some(idx) = self.dad_pending.iter().position(|d| d.addr == target) {
            let dad = self.dad_pending.remove(idx);
            self.iface.remove_addr(&dad.addr, dad.addr_type, dad.masklen);
            let sn = dad.addr.solicited_node();
            self.iface.remove_addr(&sn, AddrType::Multicast, 128);
            log::warn!("duplicate address detected for {}", dad.addr);
        }
    }

    fn run_dad(&mut self, egress: &mut Vec<Vec<u8>>) {
        let mut i = 0;
        while i < self.dad_pending.len() {
            if self.now < self.dad_pending[i].deadline {
                i += 1;
                continue;
            }
            if self.dad_pending[i].remaining_transmits > 0 {
                self.send_dad_probe(i, egress);
                i += 1;
            } else {
                let dad = self.dad_pending.remove(i);
                self.iface.confirm_addr(&dad.addr);
                log::debug!("DAD completed for {}", dad.addr);
            }
        }
    }

    // ---- driver-facing API ---------------------------------------------

    /// `enqueue(frame, len)`: called by the link driver on each received
    /// frame. The only method safe to call from a different thread/ISR
    /// than the worker.
    pub fn enqueue(&self, frame: Vec<u8>) {
        self.ingress.lock().push(frame);
    }

    /// Drains and processes every frame currently queued, pushing any
    /// resulting Ethernet frames onto `egress`. A host's driver loop (or
    /// the test harness) calls this once per wake-up.
    pub fn process_ingress(&mut self, egress: &mut Vec<Vec<u8>>) {
        let frames = core::mem::take(&mut *self.ingress.lock());
        for frame in frames {
            self.handle_frame(&frame, egress);
        }
    }

    /// `periodic_callback()`: advances the one-second clock and runs every
    /// timer-driven sweep (ND aging, DAD, TCP retransmission).
    pub fn periodic_callback(&mut self, egress: &mut Vec<Vec<u8>>) {
        self.now += 1;
        self.iface.age(self.now);
        self.run_dad(egress);
        self.sockets.retransmit_sweep(&mut self.iface, self.now, egress);
    }

    /// Runs the worker loop: blocks on `glue` until either a frame arrives
    /// or the next second boundary is due, then drains ingress and runs
    /// the periodic sweep, handing every produced frame to `send_callback`.
    /// Exits when `shutdown` returns true between turns (§5 "cancellation").
    pub fn worker(
        &mut self,
        glue: &impl crate::glue::OsGlue,
        mut send_callback: impl FnMut(&[u8]),
        mut shutdown: impl FnMut() -> bool,
    ) {
        let mut egress = Vec::new();
        let mut last_tick = glue.now_secs();
        while !shutdown() {
            glue.wait(1_000_000_000);
            self.process_ingress(&mut egress);
            let elapsed_secs = glue.now_secs();
            while last_tick < elapsed_secs {
                last_tick += 1;
                self.periodic_callback(&mut egress);
            }
            for frame in egress.drain(..) {
                send_callback(&frame);
            }
        }
    }

    fn handle_frame(&mut self, data: &[u8], egress: &mut Vec<Vec<u8>>) {
        let Some(frame) = EthernetFrame::parse(data) else {
            log::trace!("dropping frame shorter than an Ethernet header");
            return;
        };
        if !frame.is_for_us(&self.iface.lla) {
            return;
        }
        if frame.ethertype != ETHERTYPE_IPV6 {
            return;
        }
        let Some(mut pkt) = Ipv6Packet::parse(&frame.payload) else {
            log::trace!("dropping frame with a malformed IPv6 header");
            return;
        };
        if pkt.hop_limit == 0 {
            let msg = icmpv6::build_time_exceeded(pkt.src, &frame.payload);
            self.send_icmp_error(msg, egress);
            return;
        }
        // Padding to the 60-byte Ethernet minimum leaves trailing zero
        // bytes past the declared IPv6 payload; trim rather than demand
        // an exact match the way a single validation pass over raw wire
        // bytes would.
        if frame.payload.len() < Ipv6Packet::HEADER_SIZE + pkt.payload_len as usize {
            log::trace!("dropping IPv6 packet shorter than its declared payload length");
            return;
        }
        pkt.payload.truncate(pkt.payload_len as usize);

        if !self.iface.owns_addr(&pkt.dst) && !pkt.dst.is_multicast() {
            return;
        }

        match pkt.next_header {
            NEXT_HEADER_ICMPV6 => self.handle_icmpv6(&pkt, egress),
            NEXT_HEADER_UDP => self.handle_udp(&pkt, egress),
            NEXT_HEADER_TCP => self.handle_tcp(&pkt, egress),
            other => log::trace!("dropping packet with unsupported next header {}", other),
        }
    }

    fn send_icmp_error(&mut self, msg: icmpv6::IcmpMessage, egress: &mut Vec<Vec<u8>>) {
        let Some(src) = self.iface.select_source(&msg.dst) else {
            return;
        };
        let bytes = icmpv6::finish(msg.bytes, &src, &msg.dst);
        ipv6::send_payload(&mut self.iface, src, msg.dst, NEXT_HEADER_ICMPV6, msg.hop_limit, bytes, egress);
    }

    fn handle_icmpv6(&mut self, pkt: &Ipv6Packet, egress: &mut Vec<Vec<u8>>) {
        if pkt.payload.len() < 4 || !icmpv6::checksum_ok(&pkt.src, &pkt.dst, &pkt.payload) {
            log::trace!("dropping ICMPv6 message with bad checksum or length");
            return;
        }

        let outcome = match pkt.payload[0] {
            icmpv6::msg_type::ROUTER_ADVERTISEMENT => {
                if let Some(effects) = icmpv6::handle_router_advertisement(&pkt.src, &pkt.payload) {
                    self.apply_ra_effects(pkt.src, effects, egress);
                }
                None
            }
            icmpv6::msg_type::NEIGHBOR_SOLICITATION => {
                Some(icmpv6::handle_neighbor_solicitation(&mut self.iface, &pkt.src, pkt.hop_limit, &pkt.payload, self.now))
            }
            icmpv6::msg_type::NEIGHBOR_ADVERTISEMENT => {
                icmpv6::handle_neighbor_advertisement(&mut self.iface, &pkt.src, pkt.hop_limit, &pkt.payload, self.now);
                if let Some(target) = Ipv6Address::from_bytes(&pkt.payload[8..24]) {
                    self.check_dad_conflict(target);
                }
                None
            }
            icmpv6::msg_type::ECHO_REQUEST if pkt.payload.len() >= 4 => {
                Some(icmpv6::handle_echo_request(&pkt.src, &pkt.payload[4..]))
            }
            icmpv6::msg_type::MLD_QUERY => Some(icmpv6::handle_mld_query(&self.iface, &pkt.payload)),
            other => {
                log::trace!("dropping unhandled ICMPv6 message type {:#x}", other);
                None
            }
        };

        if let Some(outcome) = outcome {
            for msg in outcome.replies {
                self.send_icmp_error(msg, egress);
            }
        }
    }

    fn apply_ra_effects(&mut self, src: Ipv6Address, effects: icmpv6::RaEffects, egress: &mut Vec<Vec<u8>>) {
        if let Some(route) = effects.default_route {
            if route.lifetime == 0 {
                self.iface.remove_route(&Ipv6Address::UNSPECIFIED, &Ipv6Address::UNSPECIFIED);
            } else {
                let expiration = self.now + route.lifetime as u64;
                let _ = self.iface.add_route(
                    Ipv6Address::UNSPECIFIED,
                    Ipv6Address::UNSPECIFIED,
                    route.next_hop,
                    expiration,
                    route.ttl,
                    route.mtu,
                );
            }
        }
        if let Some(addr_update) = effects.prefix_addr {
            let global = Ipv6Address::global_from_prefix(&addr_update.addr, &self.iface.lla);
            if addr_update.install {
                let expiration = self.now + addr_update.valid_lifetime as u64;
                let _ = self.add_addr(global, addr_update.masklen, expiration, AddrType::Global, egress);
                let prefix_mask = RouteEntry::mask_for_len(addr_update.masklen);
                let _ = self.iface.add_route(
                    addr_update.addr.masked_by(&prefix_mask),
                    prefix_mask,
                    Ipv6Address::UNSPECIFIED,
                    expiration,
                    DEFAULT_HOP_LIMIT,
                    DEFAULT_MTU,
                );
            } else {
                self.iface.remove_addr(&global, AddrType::Global, addr_update.masklen);
                let prefix_mask = RouteEntry::mask_for_len(addr_update.masklen);
                self.iface.remove_route(&addr_update.addr.masked_by(&prefix_mask), &prefix_mask);
            }
        }
    }

    fn handle_udp(&mut self, pkt: &Ipv6Packet, egress: &mut Vec<Vec<u8>>) {
        let Some(dgram) = UdpDatagram::parse(&pkt.payload) else {
            log::trace!("dropping truncated UDP datagram");
            return;
        };
        if !dgram.checksum_ok(&pkt.src, &pkt.dst, &pkt.payload) {
            log::trace!("dropping UDP datagram with bad checksum");
            return;
        }
        match self.sockets.find_udp(pkt.dst, dgram.dst_port, pkt.src, dgram.src_port) {
            Some(id) => {
                if self.sockets.deliver_udp(id, dgram.payload, pkt.src, dgram.src_port).is_err() {
                    log::warn!("dropping UDP datagram, receive queue full");
                }
            }
            None => {
                let bytes = pkt.to_bytes();
                socket::unreachable_reply_for_udp(&mut self.iface, pkt.dst.is_multicast(), pkt.src, &bytes, egress);
            }
        }
    }

    fn handle_tcp(&mut self, pkt: &Ipv6Packet, egress: &mut Vec<Vec<u8>>) {
        let Some(seg) = TcpSegment::parse(&pkt.payload) else {
            log::trace!("dropping truncated TCP segment");
            return;
        };
        if !seg.checksum_ok(&pkt.src, &pkt.dst, &pkt.payload) {
            log::trace!("dropping TCP segment with bad checksum");
            return;
        }
        match self.sockets.find_tcp(pkt.dst, seg.dst_port, pkt.src, seg.src_port) {
            Some(id) => {
                let _ = self.sockets.process_tcp_segment(id, &mut self.iface, pkt.src, &seg, self.now, egress);
            }
            None => {
                if !seg.flags.contains(TcpFlags::RST) {
                    let ack = seg.seq.wrapping_add(seg.payload.len().max(1) as u32);
                    let wire = TcpSegment::build(
                        &pkt.dst, &pkt.src, seg.dst_port, seg.src_port, 0, ack, TcpFlags::RST | TcpFlags::ACK, 0, &[],
                    );
                    ipv6::send_payload(&mut self.iface, pkt.dst, pkt.src, NEXT_HEADER_TCP, DEFAULT_HOP_LIMIT, wire, egress);
                }
            }
        }
    }

    // ---- socket-layer API (§4.7, delegates to crate::socket) ------------

    pub fn socket(&mut self, protocol: Protocol) -> Result<SocketId, EsixError> {
        self.sockets.create(protocol)
    }

    pub fn bind(&mut self, id: SocketId, addr: Ipv6Address, port: u16) -> Result<(), EsixError> {
        self.sockets.bind(id, &mut self.iface, addr, port)
    }

    pub fn listen(&mut self, id: SocketId, backlog: usize) -> Result<(), EsixError> {
        self.sockets.listen(id, backlog)
    }

    pub fn accept(&mut self, id: SocketId) -> Result<SocketId, EsixError> {
        self.sockets.accept(id)
    }

    pub fn connect(
        &mut self,
        id: SocketId,
        remote_addr: Ipv6Address,
        remote_port: u16,
        egress: &mut Vec<Vec<u8>>,
    ) -> Result<(), EsixError> {
        self.sockets.connect(id, &mut self.iface, remote_addr, remote_port, self.now, egress)
    }

    pub fn send(
        &mut self,
        id: SocketId,
        dest: Option<(Ipv6Address, u16)>,
        data: &[u8],
        egress: &mut Vec<Vec<u8>>,
    ) -> Result<usize, EsixError> {
        self.sockets.send(id, &mut self.iface, dest, data, self.now, egress)
    }

    pub fn recv(&mut self, id: SocketId, peek: bool) -> Result<(Vec<u8>, Ipv6Address, u16), EsixError> {
        self.sockets.recv(id, peek)
    }

    pub fn close(&mut self, id: SocketId, egress: &mut Vec<Vec<u8>>) -> Result<(), EsixError> {
        self.sockets.close(id, &mut self.iface, self.now, egress)
    }

    pub fn abort(&mut self, id: SocketId, egress: &mut Vec<Vec<u8>>) -> Result<(), EsixError> {
        self.sockets.abort(id, &mut self.iface, egress)
    }

    pub fn socket_state(&self, id: SocketId) -> Option<socket::State> {
        self.sockets.get(id).map(|s| s.state)
    }

    pub fn socket_queue_len(&self, id: SocketId) -> usize {
        self.sockets.get(id).map(|s| s.queue().len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddress {
        MacAddress::new([0x00, 0x80, 0xc5, 0x80, 0xc5, 0x3a])
    }

    /// Scenario 1 (§8): after `init`, the address and route tables hold
    /// exactly the entries autoconfiguration installs.
    #[test]
    fn init_autoconfigures_addresses_and_routes() {
        let mut engine = Engine::new(mac());
        let mut egress = Vec::new();
        engine.init(&mut egress).unwrap();

        let ll = Ipv6Address::link_local_from_mac(&mac());
        assert!(engine.iface().get_addr(&ll, AddrType::LinkLocal, None).is_some());
        assert!(engine.iface().get_addr(&Ipv6Address::ALL_NODES, AddrType::Multicast, None).is_some());
        assert!(engine.iface().get_addr(&ll.solicited_node(), AddrType::Multicast, None).is_some());

        let fe80_mask = RouteEntry::mask_for_len(64);
        assert!(engine.iface().routes().iter().any(|r| r.mask == fe80_mask));
        let ff00_mask = RouteEntry::mask_for_len(8);
        assert!(engine.iface().routes().iter().any(|r| r.mask == ff00_mask));

        // The RS is queued immediately, destined for the all-routers address.
        assert!(!egress.is_empty());
    }

    /// Scenario 2 (§8): a solicited NA is sent in reply to an NS targeting
    /// our link-local address, and the sender is learned as a neighbor.
    #[test]
    fn neighbor_solicitation_yields_solicited_na_and_neighbor_entry() {
        let mut engine = Engine::new(mac());
        let mut egress = Vec::new();
        engine.init(&mut egress).unwrap();
        engine.iface.confirm_addr(&Ipv6Address::link_local_from_mac(&mac()));
        egress.clear();

        let ll = Ipv6Address::link_local_from_mac(&mac());
        let peer = Ipv6Address([0xfe80_0000, 0, 0, 0x1234]);
        let peer_mac = MacAddress::new([0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);

        let mut icmp = alloc::vec![icmpv6::msg_type::NEIGHBOR_SOLICITATION, 0, 0, 0, 0, 0, 0, 0];
        icmp.extend_from_slice(&ll.to_bytes());
        icmp.extend_from_slice(&[icmpv6::opt_type::SOURCE_LLA, 1]);
        icmp.extend_from_slice(peer_mac.as_bytes());
        let icmp = icmpv6::finish(icmp, &peer, &ll);
        let ip_pkt = Ipv6Packet::new(NEXT_HEADER_ICMPV6, 255, peer, ll, icmp);
        let frame = EthernetFrame::new(mac(), peer_mac, ETHERTYPE_IPV6, ip_pkt.to_bytes());

        engine.enqueue(frame.to_bytes());
        engine.process_ingress(&mut egress);

        assert_eq!(egress.len(), 1);
        let reply_frame = EthernetFrame::parse(&egress[0]).unwrap();
        let reply_pkt = Ipv6Packet::parse(&reply_frame.payload).unwrap();
        assert_eq!(reply_pkt.dst, peer);
        assert_eq!(reply_pkt.payload[0], icmpv6::msg_type::NEIGHBOR_ADVERTISEMENT);

        let neighbor = engine.iface().get_neighbor(&peer).unwrap();
        assert_eq!(neighbor.eth, peer_mac);
    }

    /// Scenario 4 (§8): a UDP datagram delivered to a bound socket is
    /// retrievable via `recv` with the sender's address and port.
    #[test]
    fn udp_echo_delivers_to_bound_socket() {
        let mut engine = Engine::new(mac());
        let mut egress = Vec::new();
        engine.init(&mut egress).unwrap();
        egress.clear();

        let id = engine.socket(Protocol::Dgram).unwrap();
        engine.bind(id, Ipv6Address::UNSPECIFIED, 5353).unwrap();

        let ll = Ipv6Address::link_local_from_mac(&mac());
        let peer = Ipv6Address([0xfe80_0000, 0, 0, 0x1234]);
        let peer_mac = MacAddress::new([0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);

        let udp = UdpDatagram::build(&peer, &ll, 40000, 5353, b"hi");
        let ip_pkt = Ipv6Packet::new(NEXT_HEADER_UDP, 64, peer, ll, udp);
        let frame = EthernetFrame::new(mac(), peer_mac, ETHERTYPE_IPV6, ip_pkt.to_bytes());

        engine.enqueue(frame.to_bytes());
        engine.process_ingress(&mut egress);

        let (data, from_addr, from_port) = engine.recv(id, false).unwrap();
        assert_eq!(data, b"hi");
        assert_eq!(from_addr, peer);
        assert_eq!(from_port, 40000);
    }

    /// Scenario 6 (§8): withholding the ACK after a data send eventually
    /// aborts the connection with RST once `MAX_RETX_TIME` elapses.
    #[test]
    fn tcp_retransmission_exhaustion_aborts_with_rst() {
        let mut engine = Engine::new(mac());
        let mut egress = Vec::new();
        engine.init(&mut egress).unwrap();
        engine.periodic_callback(&mut egress); // let link-local DAD resolve
        egress.clear();

        let peer = Ipv6Address([0xfe80_0000, 0, 0, 0x1234]);
        let peer_mac = MacAddress::new([0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
        engine.iface.add_neighbor(peer, peer_mac, 0).unwrap();

        let id = engine.socket(Protocol::Stream).unwrap();
        engine.connect(id, peer, 80, &mut egress).unwrap();
        let syn_frame = EthernetFrame::parse(&egress[0]).unwrap();
        let syn_pkt = Ipv6Packet::parse(&syn_frame.payload).unwrap();
        let syn = TcpSegment::parse(&syn_pkt.payload).unwrap();
        egress.clear();

        let ll = Ipv6Address::link_local_from_mac(&mac());
        let synack = TcpSegment::build(&peer, &ll, 80, syn.src_port, 0x1000, syn.seq.wrapping_add(1), TcpFlags::SYN | TcpFlags::ACK, 1400, &[]);
        let ip_pkt = Ipv6Packet::new(NEXT_HEADER_TCP, 64, peer, ll, synack);
        let frame = EthernetFrame::new(mac(), peer_mac, ETHERTYPE_IPV6, ip_pkt.to_bytes());
        engine.enqueue(frame.to_bytes());
        engine.process_ingress(&mut egress);
        assert_eq!(engine.socket_state(id), Some(socket::State::Established));
        egress.clear();

        engine.send(id, None, b"GET", &mut egress).unwrap();
        egress.clear();

        for _ in 0..61 {
            engine.periodic_callback(&mut egress);
        }

        assert_eq!(engine.socket_state(id), Some(socket::State::Closed));
        assert!(egress.iter().any(|bytes| {
            let frame = EthernetFrame::parse(bytes).unwrap();
            let pkt = Ipv6Packet::parse(&frame.payload).unwrap();
            TcpSegment::parse(&pkt.payload).map(|s| s.flags.contains(TcpFlags::RST)).unwrap_or(false)
        }));
    }
}
