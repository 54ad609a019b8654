//! The Berkeley-style socket layer: socket table, port allocation,
//! per-socket queues, and the TCP state machine (§4.6, §4.7).
//!
//! Per §9's asymmetry note, sockets resolve interface addresses by value
//! on every call rather than caching a reference into [`crate::interface`].

use alloc::vec::Vec;

use crate::config::{
    EPHEMERAL_PORT_CEILING, EPHEMERAL_PORT_FLOOR, INITIAL_RTO, MAX_RETX_TIME, MAX_SOCKETS,
    SOCKET_QUEUE_DEPTH, TCP_WINDOW,
};
use crate::error::EsixError;
use crate::icmpv6;
use crate::interface::Interface;
use crate::ipv6::{self, Ipv6Address, NEXT_HEADER_TCP, NEXT_HEADER_UDP, SendOutcome};
use crate::tcp::{TcpFlags, TcpSegment};
use crate::udp::UdpDatagram;

/// Transport protocol a socket was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Dgram,
    Stream,
}

/// Socket lifecycle / TCP connection state (§4.6). UDP sockets only ever
/// occupy `Closed` (unbound/unconnected), `Reserved` (bound) and
/// `Established` (connected), reusing the same field per §3's data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Reserved,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    CloseWait,
    LastAck,
    TimeWait,
}

/// An opaque socket identifier, the index into the socket table's slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(pub usize);

/// A single queue-entry, as carried in a socket's ordered per-socket
/// queue (§3).
#[derive(Debug, Clone)]
pub enum QueueEntry {
    /// Data ready for `recv`/`recvfrom`.
    ReceivedPacket {
        data: Vec<u8>,
        from_addr: Ipv6Address,
        from_port: u16,
    },
    /// An unacknowledged TCP segment, retained for retransmission.
    SentPacket {
        seq: u32,
        data: Vec<u8>,
        send_time: u64,
    },
    /// A fully-established child connection awaiting `accept`.
    ChildSocket(SocketId),
}

/// A socket. UDP and TCP share this representation; fields unused by a
/// given protocol (e.g. `snd_nxt` for UDP) are simply left at their
/// initial value.
pub struct Socket {
    pub protocol: Protocol,
    pub local_addr: Ipv6Address,
    pub local_port: u16,
    pub remote_addr: Ipv6Address,
    pub remote_port: u16,
    pub state: State,
    pub iss: u32,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,
    pub retransmit_after: u64,
    pub backlog: usize,
    pub non_blocking: bool,
    queue: Vec<QueueEntry>,
}

impl Socket {
    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            local_addr: Ipv6Address::UNSPECIFIED,
            local_port: 0,
            remote_addr: Ipv6Address::UNSPECIFIED,
            remote_port: 0,
            state: State::Closed,
            iss: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            retransmit_after: 0,
            backlog: 0,
            non_blocking: false,
            queue: Vec::new(),
        }
    }

    pub fn queue(&self) -> &[QueueEntry] {
        &self.queue
    }

    fn push(&mut self, entry: QueueEntry) -> Result<(), EsixError> {
        if self.queue.len() >= SOCKET_QUEUE_DEPTH {
            return Err(EsixError::TableFull);
        }
        self.queue.push(entry);
        Ok(())
    }

    /// Pops the oldest entry matching `pred`, used to keep `recv`,
    /// `accept`, and retransmission bookkeeping from scanning past each
    /// other's queue-entry kinds.
    fn pop_matching(&mut self, pred: impl Fn(&QueueEntry) -> bool) -> Option<QueueEntry> {
        let idx = self.queue.iter().position(pred)?;
        Some(self.queue.remove(idx))
    }

    fn peek_matching(&self, pred: impl Fn(&QueueEntry) -> bool) -> Option<&QueueEntry> {
        self.queue.iter().find(|e| pred(e))
    }

    /// Removes sent-packets acknowledged by `ack` (§4.6 "retransmit sweep").
    fn ack_sent_packets(&mut self, ack: u32) {
        self.queue.retain(|e| match e {
            QueueEntry::SentPacket { seq, data, .. } => seq.wrapping_add(data.len() as u32) > ack,
            _ => true,
        });
    }

    fn clear_queue(&mut self) {
        self.queue.clear();
    }
}

/// The bounded socket table plus ephemeral port allocator.
pub struct SocketTable {
    slots: Vec<Option<Socket>>,
    next_ephemeral: u16,
}

impl SocketTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_ephemeral: EPHEMERAL_PORT_FLOOR,
        }
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|s| s.local_port == port && s.state != State::Closed)
    }

    fn allocate_ephemeral_port(&mut self) -> Result<u16, EsixError> {
        let start = self.next_ephemeral;
        loop {
            let candidate = self.next_ephemeral;
            self.next_ephemeral = if self.next_ephemeral >= EPHEMERAL_PORT_CEILING {
                EPHEMERAL_PORT_FLOOR
            } else {
                self.next_ephemeral + 1
            };
            if !self.port_in_use(candidate) {
                return Ok(candidate);
            }
            if self.next_ephemeral == start {
                return Err(EsixError::TableFull);
            }
        }
    }

    /// `socket()`: allocates the first free slot and an ephemeral port.
    pub fn create(&mut self, protocol: Protocol) -> Result<SocketId, EsixError> {
        let port = self.allocate_ephemeral_port()?;
        let mut sock = Socket::new(protocol);
        sock.local_port = port;
        sock.state = State::Reserved;
        sock.iss = initial_sequence_number(port);
        sock.snd_nxt = sock.iss;

        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[idx] = Some(sock);
            return Ok(SocketId(idx));
        }
        if self.slots.len() >= MAX_SOCKETS {
            return Err(EsixError::TableFull);
        }
        self.slots.push(Some(sock));
        Ok(SocketId(self.slots.len() - 1))
    }

    pub fn get(&self, id: SocketId) -> Option<&Socket> {
        self.slots.get(id.0)?.as_ref()
    }

    pub fn get_mut(&mut self, id: SocketId) -> Option<&mut Socket> {
        self.slots.get_mut(id.0)?.as_mut()
    }

    fn insert_child(&mut self, sock: Socket) -> Result<SocketId, EsixError> {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[idx] = Some(sock);
            return Ok(SocketId(idx));
        }
        if self.slots.len() >= MAX_SOCKETS {
            return Err(EsixError::TableFull);
        }
        self.slots.push(Some(sock));
        Ok(SocketId(self.slots.len() - 1))
    }

    /// `bind(socket, addr, len)`.
    pub fn bind(&mut self, id: SocketId, iface: &mut Interface, addr: Ipv6Address, port: u16) -> Result<(), EsixError> {
        if port != 0 && self.port_in_use(port) {
            return Err(EsixError::InvalidArgument);
        }
        if !addr.is_unspecified() && !iface.owns_addr(&addr) {
            return Err(EsixError::InvalidArgument);
        }
        let sock = self.get_mut(id).ok_or(EsixError::NotFound)?;
        if port != 0 {
            sock.local_port = port;
        }
        sock.local_addr = addr;
        Ok(())
    }

    /// `listen(socket, backlog)`.
    pub fn listen(&mut self, id: SocketId, backlog: usize) -> Result<(), EsixError> {
        let sock = self.get_mut(id).ok_or(EsixError::NotFound)?;
        if sock.state != State::Reserved {
            return Err(EsixError::InvalidArgument);
        }
        sock.state = State::Listen;
        sock.backlog = backlog;
        Ok(())
    }

    /// `accept(socket)`: pops the first `child-socket` entry.
    pub fn accept(&mut self, id: SocketId) -> Result<SocketId, EsixError> {
        let sock = self.get_mut(id).ok_or(EsixError::NotFound)?;
        if sock.state != State::Listen {
            return Err(EsixError::InvalidArgument);
        }
        match sock.pop_matching(|e| matches!(e, QueueEntry::ChildSocket(_))) {
            Some(QueueEntry::ChildSocket(child)) => Ok(child),
            _ => Err(EsixError::WouldBlock),
        }
    }

    /// `connect(socket, addr)`. For UDP, fixes the remote tuple and moves
    /// to `established` directly. For TCP, moves to `syn_sent` and emits a
    /// SYN; the caller polls `get(id).state` for `established`.
    pub fn connect(
        &mut self,
        id: SocketId,
        iface: &mut Interface,
        remote_addr: Ipv6Address,
        remote_port: u16,
        now: u64,
        egress: &mut Vec<Vec<u8>>,
    ) -> Result<(), EsixError> {
        let local_addr = iface.select_source(&remote_addr).ok_or(EsixError::NotFound)?;
        let sock = self.get_mut(id).ok_or(EsixError::NotFound)?;
        sock.remote_addr = remote_addr;
        sock.remote_port = remote_port;
        if sock.local_addr.is_unspecified() {
            sock.local_addr = local_addr;
        }

        match sock.protocol {
            Protocol::Dgram => {
                sock.state = State::Established;
                Ok(())
            }
            Protocol::Stream => {
                sock.state = State::SynSent;
                let (local_addr, local_port, seq) = (sock.local_addr, sock.local_port, sock.iss);
                let wire = TcpSegment::build(
                    &local_addr,
                    &remote_addr,
                    local_port,
                    remote_port,
                    seq,
                    0,
                    TcpFlags::SYN,
                    TCP_WINDOW,
                    &[],
                );
                ipv6::send_payload(iface, local_addr, remote_addr, NEXT_HEADER_TCP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);
                let sock = self.get_mut(id).unwrap();
                sock.snd_nxt = sock.snd_nxt.wrapping_add(1);
                sock.retransmit_after = now + INITIAL_RTO;
                Ok(())
            }
        }
    }

    /// `send`/`sendto`.
    pub fn send(
        &mut self,
        id: SocketId,
        iface: &mut Interface,
        dest: Option<(Ipv6Address, u16)>,
        data: &[u8],
        now: u64,
        egress: &mut Vec<Vec<u8>>,
    ) -> Result<usize, EsixError> {
        let sock = self.get_mut(id).ok_or(EsixError::NotFound)?;
        match sock.protocol {
            Protocol::Dgram => {
                let (remote_addr, remote_port) = match dest {
                    Some(d) => d,
                    None if sock.state == State::Established => (sock.remote_addr, sock.remote_port),
                    None => return Err(EsixError::InvalidArgument),
                };
                let local_addr = if sock.local_addr.is_unspecified() {
                    iface.select_source(&remote_addr).ok_or(EsixError::NotFound)?
                } else {
                    sock.local_addr
                };
                let local_port = sock.local_port;
                let wire = UdpDatagram::build(&local_addr, &remote_addr, local_port, remote_port, data);
                ipv6::send_payload(iface, local_addr, remote_addr, NEXT_HEADER_UDP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);
                Ok(data.len())
            }
            Protocol::Stream => {
                if sock.state != State::Established {
                    return Err(EsixError::InvalidArgument);
                }
                sock.push(QueueEntry::SentPacket {
                    seq: sock.snd_nxt,
                    data: data.to_vec(),
                    send_time: now,
                })?;
                let (local_addr, local_port, remote_addr, remote_port, seq, ack) =
                    (sock.local_addr, sock.local_port, sock.remote_addr, sock.remote_port, sock.snd_nxt, sock.rcv_nxt);
                let wire = TcpSegment::build(
                    &local_addr,
                    &remote_addr,
                    local_port,
                    remote_port,
                    seq,
                    ack,
                    TcpFlags::PSH | TcpFlags::ACK,
                    TCP_WINDOW,
                    data,
                );
                ipv6::send_payload(iface, local_addr, remote_addr, NEXT_HEADER_TCP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);
                let sock = self.get_mut(id).unwrap();
                sock.snd_nxt = sock.snd_nxt.wrapping_add(data.len() as u32);
                sock.retransmit_after = now + INITIAL_RTO;
                Ok(data.len())
            }
        }
    }

    /// `recv`/`recvfrom`. Pops (or, with `peek`, inspects) the first
    /// `received-packet` entry.
    pub fn recv(&mut self, id: SocketId, peek: bool) -> Result<(Vec<u8>, Ipv6Address, u16), EsixError> {
        let sock = self.get_mut(id).ok_or(EsixError::NotFound)?;
        if sock.state == State::Closed {
            return Err(EsixError::Closed);
        }
        if peek {
            return match sock.peek_matching(|e| matches!(e, QueueEntry::ReceivedPacket { .. })) {
                Some(QueueEntry::ReceivedPacket { data, from_addr, from_port }) => {
                    Ok((data.clone(), *from_addr, *from_port))
                }
                _ => Err(EsixError::WouldBlock),
            };
        }
        match sock.pop_matching(|e| matches!(e, QueueEntry::ReceivedPacket { .. })) {
            Some(QueueEntry::ReceivedPacket { data, from_addr, from_port }) => Ok((data, from_addr, from_port)),
            _ => Err(EsixError::WouldBlock),
        }
    }

    /// `close()`. Per §9.1 open-question (a), an established TCP socket is
    /// closed with an orderly FIN exchange, not an abortive RST.
    pub fn close(&mut self, id: SocketId, iface: &mut Interface, now: u64, egress: &mut Vec<Vec<u8>>) -> Result<(), EsixError> {
        let sock = self.get_mut(id).ok_or(EsixError::NotFound)?;
        match (sock.protocol, sock.state) {
            (Protocol::Dgram, _) => {
                sock.state = State::Closed;
                sock.clear_queue();
                self.slots[id.0] = None;
                Ok(())
            }
            (Protocol::Stream, State::Established) | (Protocol::Stream, State::SynReceived) => {
                let (local_addr, local_port, remote_addr, remote_port, seq, ack) =
                    (sock.local_addr, sock.local_port, sock.remote_addr, sock.remote_port, sock.snd_nxt, sock.rcv_nxt);
                let wire = TcpSegment::build(
                    &local_addr, &remote_addr, local_port, remote_port, seq, ack, TcpFlags::FIN | TcpFlags::ACK, TCP_WINDOW, &[],
                );
                ipv6::send_payload(iface, local_addr, remote_addr, NEXT_HEADER_TCP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);
                let sock = self.get_mut(id).unwrap();
                sock.snd_nxt = sock.snd_nxt.wrapping_add(1);
                sock.state = State::FinWait1;
                sock.retransmit_after = now + INITIAL_RTO;
                Ok(())
            }
            (Protocol::Stream, State::Listen) | (Protocol::Stream, State::Reserved) | (Protocol::Stream, State::Closed) => {
                sock.clear_queue();
                sock.state = State::Closed;
                self.slots[id.0] = None;
                Ok(())
            }
            (Protocol::Stream, _) => {
                // Already mid-close; let the state machine run to completion.
                Ok(())
            }
        }
    }

    /// `abort()`: the RST-sending escape hatch §9.1(a) reserves for a
    /// caller that explicitly wants the non-orderly close.
    pub fn abort(&mut self, id: SocketId, iface: &mut Interface, egress: &mut Vec<Vec<u8>>) -> Result<(), EsixError> {
        let sock = self.get_mut(id).ok_or(EsixError::NotFound)?;
        if sock.protocol == Protocol::Stream && sock.state != State::Closed {
            let (local_addr, local_port, remote_addr, remote_port, seq, ack) =
                (sock.local_addr, sock.local_port, sock.remote_addr, sock.remote_port, sock.snd_nxt, sock.rcv_nxt);
            let wire = TcpSegment::build(
                &local_addr, &remote_addr, local_port, remote_port, seq, ack, TcpFlags::RST | TcpFlags::ACK, TCP_WINDOW, &[],
            );
            ipv6::send_payload(iface, local_addr, remote_addr, NEXT_HEADER_TCP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);
        }
        sock.clear_queue();
        sock.state = State::Closed;
        self.slots[id.0] = None;
        Ok(())
    }

    /// Finds a UDP socket matching an incoming datagram's demux key
    /// (§4.5): exact match on connected sockets preferred over a wildcard
    /// listener.
    pub fn find_udp(&self, local_addr: Ipv6Address, local_port: u16, remote_addr: Ipv6Address, remote_port: u16) -> Option<SocketId> {
        let mut wildcard = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(s) = slot else { continue };
            if s.protocol != Protocol::Dgram || s.local_port != local_port {
                continue;
            }
            if !s.local_addr.is_unspecified() && s.local_addr != local_addr {
                continue;
            }
            let connected = s.state == State::Established;
            if connected && s.remote_addr == remote_addr && s.remote_port == remote_port {
                return Some(SocketId(idx));
            }
            if !connected {
                wildcard = Some(SocketId(idx));
            }
        }
        wildcard
    }

    /// Finds the TCP socket for a 4-tuple, falling back to a listener
    /// bound to the local port with a wildcard/matching address.
    pub fn find_tcp(&self, local_addr: Ipv6Address, local_port: u16, remote_addr: Ipv6Address, remote_port: u16) -> Option<SocketId> {
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(s) = slot else { continue };
            if s.protocol == Protocol::Stream
                && s.local_port == local_port
                && s.local_addr == local_addr
                && s.remote_addr == remote_addr
                && s.remote_port == remote_port
                && s.state != State::Listen
            {
                return Some(SocketId(idx));
            }
        }
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(s) = slot else { continue };
            if s.protocol == Protocol::Stream
                && s.state == State::Listen
                && s.local_port == local_port
                && (s.local_addr.is_unspecified() || s.local_addr == local_addr)
            {
                return Some(SocketId(idx));
            }
        }
        None
    }

    /// Delivers a UDP payload to a matched socket's receive queue.
    pub fn deliver_udp(&mut self, id: SocketId, data: Vec<u8>, from_addr: Ipv6Address, from_port: u16) -> Result<(), EsixError> {
        self.get_mut(id).ok_or(EsixError::NotFound)?.push(QueueEntry::ReceivedPacket { data, from_addr, from_port })
    }

    /// Processes an incoming TCP segment against the socket identified by
    /// `id` (already matched by [`find_tcp`]), implementing §4.6's state
    /// table. Returns reply wire bytes (if any) to transmit, and for a
    /// `SYN` on a listener, the newly-created child socket id.
    pub fn process_tcp_segment(
        &mut self,
        id: SocketId,
        iface: &mut Interface,
        remote_addr: Ipv6Address,
        seg: &TcpSegment,
        now: u64,
        egress: &mut Vec<Vec<u8>>,
    ) -> Result<Option<SocketId>, EsixError> {
        let sock = self.get_mut(id).ok_or(EsixError::NotFound)?;

        if seg.flags.contains(TcpFlags::RST) {
            sock.clear_queue();
            sock.state = State::Closed;
            return Ok(None);
        }

        match sock.state {
            State::Listen => {
                if seg.flags.contains(TcpFlags::SYN) {
                    let local_addr = sock.local_addr;
                    let local_port = sock.local_port;
                    let mut child = Socket::new(Protocol::Stream);
                    child.local_addr = if local_addr.is_unspecified() {
                        iface.select_source(&remote_addr).unwrap_or(local_addr)
                    } else {
                        local_addr
                    };
                    child.local_port = local_port;
                    child.remote_addr = remote_addr;
                    child.remote_port = seg.src_port;
                    child.rcv_nxt = seg.seq.wrapping_add(1);
                    child.iss = initial_sequence_number(local_port ^ seg.src_port);
                    child.snd_nxt = child.iss;
                    child.state = State::SynReceived;

                    let wire = TcpSegment::build(
                        &child.local_addr, &remote_addr, local_port, seg.src_port,
                        child.snd_nxt, child.rcv_nxt, TcpFlags::SYN | TcpFlags::ACK, TCP_WINDOW, &[],
                    );
                    ipv6::send_payload(iface, child.local_addr, remote_addr, NEXT_HEADER_TCP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);
                    child.snd_nxt = child.snd_nxt.wrapping_add(1);
                    child.retransmit_after = now + INITIAL_RTO;

                    let child_id = self.insert_child(child)?;
                    let parent = self.get_mut(id).ok_or(EsixError::NotFound)?;
                    match parent.push(QueueEntry::ChildSocket(child_id)) {
                        Ok(()) => Ok(Some(child_id)),
                        Err(e) => {
                            self.slots[child_id.0] = None;
                            Err(e)
                        }
                    }
                } else {
                    send_unsolicited_rst(iface, sock, remote_addr, seg, egress);
                    Ok(None)
                }
            }
            State::SynSent => {
                if seg.flags.contains(TcpFlags::SYN) && seg.flags.contains(TcpFlags::ACK) && seg.ack == sock.snd_nxt {
                    sock.rcv_nxt = seg.seq.wrapping_add(1);
                    sock.state = State::Established;
                    let (local_addr, local_port, remote_port, seq, ack) =
                        (sock.local_addr, sock.local_port, sock.remote_port, sock.snd_nxt, sock.rcv_nxt);
                    let wire = TcpSegment::build(&local_addr, &remote_addr, local_port, remote_port, seq, ack, TcpFlags::ACK, TCP_WINDOW, &[]);
                    ipv6::send_payload(iface, local_addr, remote_addr, NEXT_HEADER_TCP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);
                }
                Ok(None)
            }
            State::Established | State::SynReceived => {
                if sock.state == State::SynReceived && seg.flags.contains(TcpFlags::ACK) {
                    sock.state = State::Established;
                }
                if seg.flags.contains(TcpFlags::FIN) {
                    sock.rcv_nxt = seg.seq.wrapping_add(1);
                    sock.state = State::FinWait2;
                    let (local_addr, local_port, remote_port, seq, ack) =
                        (sock.local_addr, sock.local_port, sock.remote_port, sock.snd_nxt, sock.rcv_nxt);
                    let wire = TcpSegment::build(&local_addr, &remote_addr, local_port, remote_port, seq, ack, TcpFlags::FIN | TcpFlags::ACK, TCP_WINDOW, &[]);
                    ipv6::send_payload(iface, local_addr, remote_addr, NEXT_HEADER_TCP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);
                    let sock = self.get_mut(id).unwrap();
                    sock.snd_nxt = sock.snd_nxt.wrapping_add(1);
                    return Ok(None);
                }

                if seg.flags.contains(TcpFlags::ACK) {
                    sock.ack_sent_packets(seg.ack);
                }

                if seg.seq != sock.rcv_nxt && !seg.payload.is_empty() {
                    // Out-of-order segment: re-ACK the expected sequence.
                    let (local_addr, local_port, remote_port, seq, ack) =
                        (sock.local_addr, sock.local_port, sock.remote_port, sock.snd_nxt, sock.rcv_nxt);
                    let wire = TcpSegment::build(&local_addr, &remote_addr, local_port, remote_port, seq, ack, TcpFlags::ACK, TCP_WINDOW, &[]);
                    ipv6::send_payload(iface, local_addr, remote_addr, NEXT_HEADER_TCP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);
                    return Ok(None);
                }

                if !seg.payload.is_empty() {
                    sock.push(QueueEntry::ReceivedPacket {
                        data: seg.payload.clone(),
                        from_addr: remote_addr,
                        from_port: seg.src_port,
                    })?;
                    sock.rcv_nxt = sock.rcv_nxt.wrapping_add(seg.payload.len() as u32);
                    let (local_addr, local_port, remote_port, seq, ack) =
                        (sock.local_addr, sock.local_port, sock.remote_port, sock.snd_nxt, sock.rcv_nxt);
                    let wire = TcpSegment::build(&local_addr, &remote_addr, local_port, remote_port, seq, ack, TcpFlags::ACK, TCP_WINDOW, &[]);
                    ipv6::send_payload(iface, local_addr, remote_addr, NEXT_HEADER_TCP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);
                }
                Ok(None)
            }
            State::FinWait1 => {
                if seg.flags.contains(TcpFlags::ACK) {
                    sock.state = State::Closed;
                    sock.clear_queue();
                }
                Ok(None)
            }
            _ => {
                send_unsolicited_rst(iface, sock, remote_addr, seg, egress);
                Ok(None)
            }
        }
    }

    /// Periodic retransmission sweep (§4.6): abort connections whose
    /// oldest unacked segment has exceeded `MAX_RETX_TIME`; otherwise
    /// resend it and back off the next deadline quadratically.
    pub fn retransmit_sweep(&mut self, iface: &mut Interface, now: u64, egress: &mut Vec<Vec<u8>>) {
        for slot in self.slots.iter_mut() {
            let Some(sock) = slot else { continue };
            if sock.protocol != Protocol::Stream || sock.retransmit_after == 0 || sock.retransmit_after > now {
                continue;
            }
            let Some(QueueEntry::SentPacket { seq, data, send_time }) =
                sock.queue.iter().find(|e| matches!(e, QueueEntry::SentPacket { .. })).cloned()
            else {
                sock.retransmit_after = 0;
                continue;
            };

            if now.saturating_sub(send_time) > MAX_RETX_TIME {
                let (local_addr, local_port, remote_addr, remote_port, s, a) =
                    (sock.local_addr, sock.local_port, sock.remote_addr, sock.remote_port, sock.snd_nxt, sock.rcv_nxt);
                log::warn!("retransmission exhausted for {}:{}, aborting connection", remote_addr, remote_port);
                let wire = TcpSegment::build(&local_addr, &remote_addr, local_port, remote_port, s, a, TcpFlags::RST | TcpFlags::ACK, TCP_WINDOW, &[]);
                ipv6::send_payload(iface, local_addr, remote_addr, NEXT_HEADER_TCP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);
                sock.clear_queue();
                sock.state = State::Closed;
                continue;
            }

            let (local_addr, local_port, remote_addr, remote_port, ack) =
                (sock.local_addr, sock.local_port, sock.remote_addr, sock.remote_port, sock.rcv_nxt);
            let wire = TcpSegment::build(&local_addr, &remote_addr, local_port, remote_port, seq, ack, TcpFlags::PSH | TcpFlags::ACK, TCP_WINDOW, &data);
            ipv6::send_payload(iface, local_addr, remote_addr, NEXT_HEADER_TCP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);

            let elapsed = now.saturating_sub(send_time).max(1);
            sock.retransmit_after = now + elapsed.saturating_mul(elapsed);
        }
    }
}

fn send_unsolicited_rst(iface: &mut Interface, sock: &Socket, remote_addr: Ipv6Address, seg: &TcpSegment, egress: &mut Vec<Vec<u8>>) {
    let local_addr = if sock.local_addr.is_unspecified() {
        iface.select_source(&remote_addr).unwrap_or(sock.local_addr)
    } else {
        sock.local_addr
    };
    let wire = TcpSegment::build(
        &local_addr, &remote_addr, sock.local_port, seg.src_port, 0, seg.seq.wrapping_add(1), TcpFlags::RST | TcpFlags::ACK, TCP_WINDOW, &[],
    );
    ipv6::send_payload(iface, local_addr, remote_addr, NEXT_HEADER_TCP, crate::config::DEFAULT_HOP_LIMIT, wire, egress);
}

/// A simple ISN generator: distinct per (port, rough time) without the
/// random source this embedded-originated design normally lacks access
/// to; collisions only matter across immediate reconnects to the same
/// peer, which this single-interface host does not need to defend against
/// beyond what this already provides.
fn initial_sequence_number(seed: u16) -> u32 {
    (seed as u32).wrapping_mul(2_654_435_761).wrapping_add(1000)
}

/// Dispatches an unmatched datagram's destination-unreachable handling
/// and an unmatched TCP segment's RST, per §4.5/§4.6 ("unexpected segment
/// with no listener").
pub fn unreachable_reply_for_udp(iface: &mut Interface, dst_was_multicast: bool, src: Ipv6Address, original_packet: &[u8], egress: &mut Vec<Vec<u8>>) -> SendOutcome {
    if dst_was_multicast {
        return SendOutcome::NoRoute;
    }
    let Some(local_addr) = iface.select_source(&src) else {
        return SendOutcome::NoRoute;
    };
    let msg = icmpv6::build_dest_unreachable(icmpv6::unreach_code::PORT_UNREACHABLE, src, original_packet);
    let bytes = icmpv6::finish(msg.bytes, &local_addr, &src);
    ipv6::send_payload(iface, local_addr, src, crate::ipv6::NEXT_HEADER_ICMPV6, msg.hop_limit, bytes, egress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::MacAddress;
    use crate::ipv6::AddrType;

    fn iface_with_link_local() -> Interface {
        let mac = MacAddress::new([0x00, 0x80, 0xc5, 0x80, 0xc5, 0x3a]);
        let mut iface = Interface::new(mac);
        let ll = Ipv6Address::link_local_from_mac(&mac);
        iface.add_addr(ll, 64, 0, AddrType::LinkLocal).unwrap();
        iface.confirm_addr(&ll);
        let mask = crate::interface::RouteEntry::mask_for_len(64);
        iface.add_route(ll.masked(64), mask, Ipv6Address::UNSPECIFIED, 0, 64, 1500).unwrap();
        iface
    }

    #[test]
    fn udp_bind_and_echo_scenario() {
        let mut iface = iface_with_link_local();
        let mut table = SocketTable::new();
        let id = table.create(Protocol::Dgram).unwrap();
        table.bind(id, &mut iface, Ipv6Address::UNSPECIFIED, 5353).unwrap();

        let peer = Ipv6Address([0xfe80_0000, 0, 0, 0x1234]);
        let found = table.find_udp(iface.select_source(&peer).unwrap(), 5353, peer, 5).unwrap();
        assert_eq!(found, id);
        table.deliver_udp(found, alloc::vec![b'h', b'i'], peer, 5).unwrap();

        let (data, from_addr, from_port) = table.recv(id, false).unwrap();
        assert_eq!(data, b"hi");
        assert_eq!(from_addr, peer);
        assert_eq!(from_port, 5);
    }

    #[test]
    fn ephemeral_ports_skip_already_bound() {
        let mut table = SocketTable::new();
        let a = table.create(Protocol::Dgram).unwrap();
        let b = table.create(Protocol::Dgram).unwrap();
        assert_ne!(table.get(a).unwrap().local_port, table.get(b).unwrap().local_port);
    }

    #[test]
    fn close_on_established_tcp_sends_fin_not_rst() {
        let mut iface = iface_with_link_local();
        let mut table = SocketTable::new();
        let id = table.create(Protocol::Stream).unwrap();
        {
            let s = table.get_mut(id).unwrap();
            s.state = State::Established;
            s.local_addr = iface.select_source(&Ipv6Address([0xfe80_0000, 0, 0, 1])).unwrap();
            s.remote_addr = Ipv6Address([0xfe80_0000, 0, 0, 1]);
            s.remote_port = 80;
        }
        let mut egress = Vec::new();
        table.close(id, &mut iface, 0, &mut egress).unwrap();
        assert_eq!(egress.len(), 1);
        let frame = crate::ethernet::EthernetFrame::parse(&egress[0]).unwrap();
        let pkt = crate::ipv6::Ipv6Packet::parse(&frame.payload).unwrap();
        let seg = TcpSegment::parse(&pkt.payload).unwrap();
        assert!(seg.flags.contains(TcpFlags::FIN));
        assert!(!seg.flags.contains(TcpFlags::RST));
        assert_eq!(table.get(id).unwrap().state, State::FinWait1);
    }
}
