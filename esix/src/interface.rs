//! Interface state: the address, route, and neighbor tables and the
//! lifecycle rules that keep them coherent as RAs, NS/NA and aging run.
//!
//! Ownership is exclusive to this module (§9 "source of cyclic
//! references"): other modules query it by value each turn and never
//! cache a reference across pipeline turns.

use alloc::vec::Vec;

use crate::config::{MAX_ADDRESSES, MAX_NEIGHBORS, MAX_ROUTES, STALE_DURATION};
use crate::error::EsixError;
use crate::ethernet::MacAddress;
use crate::ipv6::{AddrType, Ipv6Address};

/// An assigned interface address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressEntry {
    pub addr: Ipv6Address,
    pub masklen: u8,
    /// 0 = never expires.
    pub expiration: u64,
    /// Informational; not enforced against traffic.
    pub preferred_lifetime: u64,
    pub addr_type: AddrType,
    /// Cleared while Duplicate Address Detection is outstanding.
    pub tentative: bool,
}

/// A routing table entry. The mask is carried as a full address rather
/// than a prefix length, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub dest: Ipv6Address,
    pub mask: Ipv6Address,
    /// All-zero means on-link.
    pub next_hop: Ipv6Address,
    pub expiration: u64,
    pub ttl: u8,
    pub mtu: u32,
}

impl RouteEntry {
    /// Builds the full mask address for a prefix length.
    pub fn mask_for_len(masklen: u8) -> Ipv6Address {
        Ipv6Address::mask_from_len(masklen)
    }

    fn matches(&self, addr: &Ipv6Address) -> bool {
        addr.masked_by(&self.mask) == self.dest
    }

    /// Number of leading one-bits in the mask; used to break ties between
    /// routes by specificity.
    pub fn prefix_len(&self) -> u32 {
        self.mask.0.iter().map(|w| w.leading_ones()).take_while(|&n| n > 0).sum::<u32>().min(128)
    }
}

/// Reachability status of a neighbor cache entry, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborStatus {
    Reachable,
    Stale,
    Delay,
    Unreachable,
}

/// A neighbor (Ethernet resolution) cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborEntry {
    pub ip: Ipv6Address,
    pub eth: MacAddress,
    pub expiration: u64,
    pub is_solicited: bool,
    pub status: NeighborStatus,
}

/// The address, route, and neighbor tables for the (single) interface,
/// plus the joined-multicast-address set MLD reports against.
pub struct Interface {
    pub lla: MacAddress,
    addresses: Vec<AddressEntry>,
    routes: Vec<RouteEntry>,
    neighbors: Vec<NeighborEntry>,
    /// Multicast addresses this host has joined (distinct from unicast
    /// solicited-node addresses in `addresses`); consulted by MLD §4.3.
    joined_multicast: Vec<Ipv6Address>,
}

impl Interface {
    pub fn new(lla: MacAddress) -> Self {
        Self {
            lla,
            addresses: Vec::new(),
            routes: Vec::new(),
            neighbors: Vec::new(),
            joined_multicast: Vec::new(),
        }
    }

    // ---- addresses ----------------------------------------------------

    /// Inserts or refreshes an address entry. If the address is already
    /// present, only the expiration is updated (§3 invariant (b) idempotence).
    /// Otherwise inserts the entry tentatively; the caller (DAD in
    /// `icmpv6`) is responsible for clearing `tentative` before the
    /// address is usable as a source, and for installing the matching
    /// solicited-node multicast entry for unicast types.
    pub fn add_addr(
        &mut self,
        addr: Ipv6Address,
        masklen: u8,
        expiration: u64,
        addr_type: AddrType,
    ) -> Result<(), EsixError> {
        if let Some(existing) = self
            .addresses
            .iter_mut()
            .find(|e| e.addr == addr && e.masklen == masklen)
        {
            existing.expiration = expiration;
            return Ok(());
        }
        if self.addresses.len() >= MAX_ADDRESSES {
            return Err(EsixError::TableFull);
        }
        self.addresses.push(AddressEntry {
            addr,
            masklen,
            expiration,
            preferred_lifetime: expiration,
            addr_type,
            tentative: !matches!(addr_type, AddrType::Multicast),
        });
        Ok(())
    }

    /// Clears the tentative flag on an address once DAD has passed.
    pub fn confirm_addr(&mut self, addr: &Ipv6Address) {
        if let Some(e) = self.addresses.iter_mut().find(|e| e.addr == *addr) {
            e.tentative = false;
        }
    }

    pub fn remove_addr(&mut self, addr: &Ipv6Address, addr_type: AddrType, masklen: u8) {
        self.addresses.retain(|e| {
            !(e.addr == *addr
                && e.masklen == masklen
                && (addr_type == AddrType::Any || e.addr_type == addr_type))
        });
    }

    /// Looks up an address by value, optionally filtering by type and mask
    /// length (`AddrType::Any` / `None` act as wildcards).
    pub fn get_addr(
        &self,
        addr: &Ipv6Address,
        addr_type: AddrType,
        masklen: Option<u8>,
    ) -> Option<&AddressEntry> {
        self.addresses.iter().find(|e| {
            e.addr == *addr
                && (addr_type == AddrType::Any || e.addr_type == addr_type)
                && masklen.map(|m| m == e.masklen).unwrap_or(true)
        })
    }

    /// First address entry of a given type, used for source-address
    /// selection.
    pub fn get_addr_for_type(&self, addr_type: AddrType) -> Option<&AddressEntry> {
        self.addresses
            .iter()
            .find(|e| e.addr_type == addr_type && !e.tentative)
    }

    /// True if `addr` is assigned to this interface (any type, not tentative).
    pub fn owns_addr(&self, addr: &Ipv6Address) -> bool {
        self.addresses.iter().any(|e| e.addr == *addr && !e.tentative)
    }

    pub fn addresses(&self) -> &[AddressEntry] {
        &self.addresses
    }

    /// Source address selection per §4.2: link-local destinations use a
    /// link-local source; everything else prefers a global source.
    pub fn select_source(&self, dst: &Ipv6Address) -> Option<Ipv6Address> {
        if dst.is_link_local() {
            self.get_addr_for_type(AddrType::LinkLocal).map(|e| e.addr)
        } else {
            self.get_addr_for_type(AddrType::Global)
                .or_else(|| self.get_addr_for_type(AddrType::LinkLocal))
                .map(|e| e.addr)
        }
    }

    // ---- routes ---------------------------------------------------------

    pub fn add_route(
        &mut self,
        dest: Ipv6Address,
        mask: Ipv6Address,
        next_hop: Ipv6Address,
        expiration: u64,
        ttl: u8,
        mtu: u32,
    ) -> Result<(), EsixError> {
        if let Some(existing) = self
            .routes
            .iter_mut()
            .find(|r| r.dest == dest && r.mask == mask)
        {
            existing.next_hop = next_hop;
            existing.expiration = expiration;
            existing.ttl = ttl;
            existing.mtu = mtu;
            return Ok(());
        }
        if self.routes.len() >= MAX_ROUTES {
            return Err(EsixError::TableFull);
        }
        self.routes.push(RouteEntry {
            dest,
            mask,
            next_hop,
            expiration,
            ttl,
            mtu,
        });
        Ok(())
    }

    pub fn remove_route(&mut self, dest: &Ipv6Address, mask: &Ipv6Address) {
        self.routes.retain(|r| !(r.dest == *dest && r.mask == *mask));
    }

    /// Longest-prefix match over the full route table; ties keep the
    /// earliest-inserted entry (§9.1 open-question (c)).
    pub fn get_route_for_addr(&self, addr: &Ipv6Address) -> Option<&RouteEntry> {
        let mut best: Option<&RouteEntry> = None;
        for route in &self.routes {
            if route.matches(addr) {
                best = match best {
                    Some(b) if b.prefix_len() >= route.prefix_len() => Some(b),
                    _ => Some(route),
                };
            }
        }
        best
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    // ---- neighbors --------------------------------------------------------

    pub fn add_neighbor(
        &mut self,
        ip: Ipv6Address,
        eth: MacAddress,
        expiration: u64,
    ) -> Result<&mut NeighborEntry, EsixError> {
        if let Some(idx) = self.neighbors.iter().position(|n| n.ip == ip) {
            let n = &mut self.neighbors[idx];
            n.eth = eth;
            n.expiration = expiration;
            return Ok(&mut self.neighbors[idx]);
        }
        if self.neighbors.len() >= MAX_NEIGHBORS {
            return Err(EsixError::TableFull);
        }
        self.neighbors.push(NeighborEntry {
            ip,
            eth,
            expiration,
            is_solicited: false,
            status: NeighborStatus::Stale,
        });
        let idx = self.neighbors.len() - 1;
        Ok(&mut self.neighbors[idx])
    }

    pub fn get_neighbor(&self, ip: &Ipv6Address) -> Option<&NeighborEntry> {
        self.neighbors.iter().find(|n| n.ip == *ip)
    }

    pub fn get_neighbor_mut(&mut self, ip: &Ipv6Address) -> Option<&mut NeighborEntry> {
        self.neighbors.iter_mut().find(|n| n.ip == *ip)
    }

    pub fn remove_neighbor(&mut self, ip: &Ipv6Address) {
        self.neighbors.retain(|n| n.ip != *ip);
    }

    pub fn neighbors(&self) -> &[NeighborEntry] {
        &self.neighbors
    }

    // ---- MLD membership -----------------------------------------------

    pub fn join_multicast(&mut self, addr: Ipv6Address) {
        if !self.joined_multicast.contains(&addr) {
            self.joined_multicast.push(addr);
        }
    }

    pub fn leave_multicast(&mut self, addr: &Ipv6Address) {
        self.joined_multicast.retain(|a| a != addr);
    }

    pub fn joined_multicast(&self) -> &[Ipv6Address] {
        &self.joined_multicast
    }

    // ---- aging ----------------------------------------------------------

    /// Evicts expired addresses, routes, and neighbors. `now` is the
    /// monotonic second counter. Entries with `expiration == 0` are never
    /// evicted (§3 invariant (b)). Confirmed neighbor entries additionally
    /// transition `reachable -> stale -> unreachable` against the
    /// dedicated ND timers rather than their own `expiration` field, which
    /// only governs provisional (never-confirmed) entries.
    pub fn age(&mut self, now: u64) {
        self.addresses
            .retain(|e| e.expiration == 0 || e.expiration > now);
        self.routes.retain(|r| r.expiration == 0 || r.expiration > now);
        self.age_neighbors(now);
    }

    /// Drives the neighbor status timers (§3 transitions): a `reachable`
    /// entry whose timeout has elapsed drops to `stale`; a `stale` entry
    /// given no refresh before its own timeout becomes `unreachable` and is
    /// evicted outright, since an unreachable entry is functionally
    /// equivalent to no entry at all for next-hop resolution (§4.4).
    fn age_neighbors(&mut self, now: u64) {
        for n in self.neighbors.iter_mut() {
            match n.status {
                NeighborStatus::Reachable if n.expiration != 0 && now >= n.expiration => {
                    n.status = NeighborStatus::Stale;
                    n.expiration = now + STALE_DURATION;
                }
                NeighborStatus::Stale if n.expiration != 0 && now >= n.expiration => {
                    n.status = NeighborStatus::Unreachable;
                }
                _ => {}
            }
        }
        self.neighbors.retain(|n| n.status != NeighborStatus::Unreachable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddress {
        MacAddress::new([0x00, 0x80, 0xc5, 0x80, 0xc5, 0x3a])
    }

    #[test]
    fn add_addr_is_idempotent_except_expiration() {
        let mut iface = Interface::new(mac());
        let addr = Ipv6Address::link_local_from_mac(&mac());
        iface.add_addr(addr, 64, 0, AddrType::LinkLocal).unwrap();
        iface.add_addr(addr, 64, 100, AddrType::LinkLocal).unwrap();
        assert_eq!(iface.addresses().len(), 1);
        assert_eq!(iface.addresses()[0].expiration, 100);
    }

    #[test]
    fn add_remove_route_restores_initial_state() {
        let mut iface = Interface::new(mac());
        let dest = Ipv6Address([0xfe80_0000, 0, 0, 0]);
        let mask = RouteEntry::mask_for_len(64);
        iface
            .add_route(dest, mask, Ipv6Address::UNSPECIFIED, 0, 64, 1500)
            .unwrap();
        assert_eq!(iface.routes().len(), 1);
        iface.remove_route(&dest, &mask);
        assert_eq!(iface.routes().len(), 0);
    }

    #[test]
    fn longest_prefix_match_wins() {
        let mut iface = Interface::new(mac());
        let llmask = RouteEntry::mask_for_len(64);
        iface
            .add_route(
                Ipv6Address([0xfe80_0000, 0, 0, 0]),
                llmask,
                Ipv6Address::UNSPECIFIED,
                0,
                64,
                1500,
            )
            .unwrap();
        let specific = Ipv6Address([0xfe80_0000, 0, 0, 0x1234]);
        let specific_mask = RouteEntry::mask_for_len(128);
        iface
            .add_route(specific, specific_mask, Ipv6Address::UNSPECIFIED, 0, 64, 1500)
            .unwrap();
        let found = iface.get_route_for_addr(&specific).unwrap();
        assert_eq!(found.mask, specific_mask);
    }

    #[test]
    fn expiring_entries_evicted_but_permanent_entries_survive() {
        let mut iface = Interface::new(mac());
        let addr = Ipv6Address([0x2001_0db8, 0, 0, 1]);
        iface.add_addr(addr, 64, 10, AddrType::Global).unwrap();
        let ll = Ipv6Address::link_local_from_mac(&mac());
        iface.add_addr(ll, 64, 0, AddrType::LinkLocal).unwrap();
        iface.age(20);
        assert!(iface.get_addr(&addr, AddrType::Any, None).is_none());
        assert!(iface.get_addr(&ll, AddrType::Any, None).is_some());
    }
}
