//! Compile-time resource ceilings and protocol tunables.
//!
//! Kept in one place rather than scattered through the pipeline so the
//! bounds a deployment runs under are visible at a glance.

/// Maximum number of interface addresses (unicast + multicast) tracked at once.
pub const MAX_ADDRESSES: usize = 16;
/// Maximum number of routes in the routing table.
pub const MAX_ROUTES: usize = 8;
/// Maximum number of neighbor cache entries.
pub const MAX_NEIGHBORS: usize = 16;
/// Maximum number of open sockets.
pub const MAX_SOCKETS: usize = 16;
/// Maximum number of queue-entries (received/sent/child) a single socket may hold.
pub const SOCKET_QUEUE_DEPTH: usize = 5;

/// Hop limit used for Neighbor Discovery traffic (RFC 4861 requires 255).
pub const ND_HOP_LIMIT: u8 = 255;
/// Default hop limit for ordinary outgoing traffic.
pub const DEFAULT_HOP_LIMIT: u8 = 64;
/// Default MTU assumed until a Router Advertisement overrides it.
pub const DEFAULT_MTU: u32 = 1500;

/// Number of neighbor solicitations sent during Duplicate Address Detection.
pub const DUP_ADDR_DETECT_TRANSMITS: u32 = 1;
/// Interval between a DAD solicitation and the next retransmit or the
/// decision that the address is unique, in clock ticks (seconds).
pub const DAD_TIMEOUT_SECS: u64 = 1;
/// Eviction timeout for a neighbor entry created by an unsolicited NS that
/// never gets confirmed by a subsequent NA.
pub const NEW_NEIGHBOR_TIMEOUT: u64 = 5;
/// Reachable lifetime before a confirmed neighbor entry is marked stale.
pub const NEIGHBOR_TIMEOUT: u64 = 180;
/// How long a stale neighbor entry survives before removal.
pub const STALE_DURATION: u64 = 3;

/// Initial TCP retransmission timeout, in clock ticks (seconds).
pub const INITIAL_RTO: u64 = 2;
/// Ceiling on total time a segment may go unacknowledged before the
/// connection is aborted with RST.
pub const MAX_RETX_TIME: u64 = 60;
/// Fixed advertised TCP window; this stack has no congestion control.
pub const TCP_WINDOW: u16 = 1400;

/// Lowest ephemeral port handed out by `socket()`.
pub const EPHEMERAL_PORT_FLOOR: u16 = 49152;
/// Highest ephemeral port handed out by `socket()`.
pub const EPHEMERAL_PORT_CEILING: u16 = 65535;

/// Cap on the number of original-packet bytes echoed back in a
/// Destination-Unreachable or Time-Exceeded reply.
pub const ICMP_ERROR_QUOTE_MAX: usize = 1280 - 40 - 8;
