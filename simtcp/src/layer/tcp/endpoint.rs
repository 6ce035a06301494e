//! Contains the connection registry and the socket interface.
//!
//! Relevant material for reading:
//! Main TCP rfc (skip if confident): https://tools.ietf.org/html/rfc793
//! Errata and comments: https://tools.ietf.org/html/rfc1122#section-4.2
//!     Notably still assuming some good-faith on hosts
//! TCP congestion control: https://tools.ietf.org/html/rfc5681
//! Selective ACKs: https://tools.ietf.org/html/rfc2018
//! SACK based loss recovery: https://tools.ietf.org/html/rfc6675
//! RST handling specifically: https://www.snellman.net/blog/archive/2016-02-01-tcp-rst/
//!     OS comparison in particular
use std::collections::{HashMap, VecDeque};

use crate::time::{Expiration, Instant};
use crate::wire::{IpAddress, IpEcn, IpEndpoint, TcpChecksum, TcpFlags, TcpRepr, TcpSeqNumber};

use super::config::{Config, IsnMode};
use super::connection::{Acceptor, Connection, ForkRequest, Io, Outgoing, Signals};
use super::siphash::IsnGenerator;
use super::slots::{Key, SlotMap};
use super::socket::{Event, Result, RxStatus, SocketError};
use super::state::{ControlBlock, State};
use super::timer::{Scheduler, TimerKind};

/// The first port handed out for automatic binding, RFC 6335.
const EPHEMERAL_START: u16 = 49152;
const EPHEMERAL_COUNT: u32 = 65536 - EPHEMERAL_START as u32;

/// Handles TCP connection states.
///
/// Owns every connection, the table routing segments to them, the logical time scheduler and the
/// queues of outgoing segments and application events. Time only moves when the caller hands in a
/// segment with [`receive`] or asks for due events with [`advance`].
///
/// [`receive`]: #method.receive
/// [`advance`]: #method.advance
pub struct Endpoint {
    ports: HashMap<FourTuple, Key>,
    states: SlotMap<Slot>,
    addresses: Vec<IpAddress>,
    scheduler: Scheduler<Action>,
    outgoing: VecDeque<Transmit>,
    events: VecDeque<(Key, Event)>,
    isn: IsnGenerator,
    checksum: bool,
    now: Instant,
    next_port: u32,
}

/// The addresses of one connection, the key of the demultiplexer.
///
/// A listener has an unspecified remote and may also have an unspecified local address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FourTuple {
    /// The local address.
    pub local: IpAddress,
    /// The remote address.
    pub remote: IpAddress,
    /// The local port.
    pub local_port: u16,
    /// The remote port.
    pub remote_port: u16,
}

/// A connection slot.
///
/// Keeps the binding next to the connection so that releasing it never needs a table scan.
struct Slot {
    connection: Connection,
    binding: Option<FourTuple>,
}

/// Deferred work addressed to a connection.
#[derive(Debug)]
pub(crate) enum Action {
    /// A timer comes due, valid only while the token matches.
    Timer {
        kind: TimerKind,
        token: u64,
    },
    /// A fork completes the handshake its listener accepted.
    CompleteFork {
        listener: Key,
        local: IpEndpoint,
        peer: IpEndpoint,
        syn: TcpRepr,
    },
    /// Report a completed active open.
    ConnectionSucceeded,
}

/// A segment ready for the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transmit {
    /// The sending endpoint.
    pub src: IpEndpoint,
    /// The receiving endpoint.
    pub dst: IpEndpoint,
    /// The ECN codepoint for the IP header.
    pub ecn: IpEcn,
    /// The encoded segment.
    pub bytes: Vec<u8>,
}

impl FourTuple {
    fn new(local: IpEndpoint, remote: IpEndpoint) -> Self {
        FourTuple {
            local: local.addr,
            remote: remote.addr,
            local_port: local.port,
            remote_port: remote.port,
        }
    }
}

impl Endpoint {
    /// Create an endpoint without addresses.
    pub fn new(isn: IsnGenerator) -> Self {
        Endpoint {
            ports: HashMap::new(),
            states: SlotMap::new(),
            addresses: Vec::new(),
            scheduler: Scheduler::new(),
            outgoing: VecDeque::new(),
            events: VecDeque::new(),
            isn,
            checksum: true,
            now: Instant::from_millis(0),
            next_port: 0,
        }
    }

    /// Add a local address, making it available for binding and routing.
    pub fn add_address(&mut self, addr: IpAddress) {
        if !addr.is_unspecified() && !self.addresses.contains(&addr) {
            self.addresses.push(addr);
        }
    }

    /// The local addresses.
    pub fn addresses(&self) -> &[IpAddress] {
        &self.addresses
    }

    /// Choose whether checksums are computed and verified.
    ///
    /// With checksums off, segments are emitted with a zero checksum and never rejected.
    pub fn set_checksum(&mut self, checksum: bool) {
        self.checksum = checksum;
    }

    /// The logical time of the last processed event.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Create a new closed socket.
    pub fn open(&mut self, config: Config) -> Result<Key> {
        let connection = Connection::new(config)?;
        Ok(self.states.insert(Slot {
            connection,
            binding: None,
        }))
    }

    /// Bind to an ephemeral port on any local address.
    pub fn bind(&mut self, key: Key) -> Result<()> {
        self.bind_to(key, IpEndpoint::UNSPECIFIED)
    }

    /// Bind to a local endpoint.
    ///
    /// An unspecified address binds to all local addresses, port zero to an ephemeral port.
    pub fn bind_to(&mut self, key: Key, local: IpEndpoint) -> Result<()> {
        let slot = self.states.get(key).ok_or(SocketError::BadHandle)?;
        if slot.binding.is_some() || slot.connection.state() != State::Closed {
            return Err(SocketError::Invalid);
        }
        if !local.addr.is_unspecified() && !self.addresses.contains(&local.addr) {
            return Err(SocketError::AddrNotAvail);
        }

        let port = match local.port {
            0 => self.ephemeral_port(local.addr)?,
            port if self.port_in_use(local.addr, port) => return Err(SocketError::AddrInUse),
            port => port,
        };

        let local = IpEndpoint::new(local.addr, port);
        let tuple = FourTuple::new(local, IpEndpoint::UNSPECIFIED);
        self.ports.insert(tuple, key);
        if let Some(slot) = self.states.get_mut(key) {
            slot.binding = Some(tuple);
            slot.connection.bind(local, IpEndpoint::UNSPECIFIED);
        }
        net_debug!("{}: bound to {}", key, local);
        Ok(())
    }

    /// Open a connection to a remote endpoint.
    ///
    /// Binds first if necessary. The local address is the first one of the remote's family.
    pub fn connect(&mut self, key: Key, remote: IpEndpoint) -> Result<()> {
        if !remote.is_specified() {
            return Err(SocketError::Invalid);
        }
        if self.addresses.is_empty() {
            net_error!("{}: no local address configured", key);
            return Err(SocketError::NoRoute);
        }
        let bound = self.states.get(key).ok_or(SocketError::BadHandle)?.binding.is_some();
        if !bound {
            self.bind(key)?;
        }

        let slot = self.states.get(key).ok_or(SocketError::BadHandle)?;
        let old = slot.binding.ok_or(SocketError::Invalid)?;
        let addr = if old.local.is_unspecified() {
            self.addresses.iter()
                .copied()
                .find(|addr| addr.same_family(&remote.addr))
                .ok_or(SocketError::NoRoute)?
        } else {
            old.local
        };

        let local = IpEndpoint::new(addr, old.local_port);
        let tuple = FourTuple::new(local, remote);
        if self.ports.get(&tuple).map_or(false, |&owner| owner != key) {
            return Err(SocketError::AddrInUse);
        }
        self.rebind(key, old, tuple);

        let mode = match self.states.get_mut(key) {
            Some(slot) => {
                slot.connection.bind(local, remote);
                slot.connection.config().isn
            },
            None => return Err(SocketError::BadHandle),
        };
        let isn = self.isn_for(mode, tuple);

        net_info!("{}: connecting {} to {}", key, local, remote);
        self.dispatch(key, |connection, io| connection.connect(isn, io))
    }

    /// Accept connection requests.
    ///
    /// Binds to an ephemeral port if necessary. Every accepted request forks a new connection,
    /// announced by a `NewConnection` event.
    pub fn listen(&mut self, key: Key) -> Result<()> {
        let slot = self.states.get(key).ok_or(SocketError::BadHandle)?;
        if slot.connection.state() != State::Closed {
            return Err(SocketError::Invalid);
        }
        let bound = slot.binding.is_some();
        if !bound {
            self.bind(key)?;
        }
        self.dispatch(key, |connection, _| connection.listen())
    }

    /// Set the admission decision of a listener. `None` accepts everything.
    pub fn set_acceptor(&mut self, key: Key, acceptor: Option<Acceptor>) -> Result<()> {
        let slot = self.states.get_mut(key).ok_or(SocketError::BadHandle)?;
        slot.connection.set_acceptor(acceptor);
        Ok(())
    }

    /// Close the connection.
    ///
    /// Unread data resets the connection, unsent data is sent before the FIN.
    pub fn close(&mut self, key: Key) -> Result<()> {
        self.dispatch(key, |connection, io| connection.close(io))?;
        // A socket closed before it connected gives up its port.
        if let Some(slot) = self.states.get_mut(key) {
            if slot.connection.state() == State::Closed {
                if let Some(tuple) = slot.binding.take() {
                    Self::unbind(&mut self.ports, key, tuple);
                }
            }
        }
        Ok(())
    }

    /// Stop sending, the FIN follows the queued data.
    pub fn shutdown_send(&mut self, key: Key) -> Result<()> {
        self.dispatch(key, |connection, io| connection.shutdown_send(io))
    }

    /// Stop receiving. Data still arrives but is no longer announced.
    pub fn shutdown_recv(&mut self, key: Key) -> Result<()> {
        self.dispatch(key, |connection, _| connection.shutdown_recv())
    }

    /// Queue data for sending.
    ///
    /// Either all of the data is queued or none of it.
    pub fn send(&mut self, key: Key, data: &[u8]) -> Result<usize> {
        self.dispatch(key, |connection, io| connection.send(data, io))?
    }

    /// Receive up to `max` bytes of in-order data.
    ///
    /// Returns an empty buffer when nothing is available. In CLOSE_WAIT this marks the end of the
    /// stream.
    pub fn recv(&mut self, key: Key, max: usize) -> Result<Vec<u8>> {
        self.dispatch(key, |connection, io| connection.recv(max, io))
    }

    /// Free space in the send buffer.
    pub fn tx_available(&self, key: Key) -> Result<usize> {
        Ok(self.get(key)?.tx_available())
    }

    /// Data ready to be received.
    pub fn rx_available(&self, key: Key) -> Result<usize> {
        Ok(self.get(key)?.rx_available())
    }

    /// The bound local endpoint.
    pub fn local_endpoint(&self, key: Key) -> Result<IpEndpoint> {
        Ok(self.get(key)?.local())
    }

    /// The connected remote endpoint.
    pub fn peer_endpoint(&self, key: Key) -> Result<IpEndpoint> {
        let connection = self.get(key)?;
        match connection.state() {
            State::Closed | State::Listen => Err(SocketError::NotConn),
            _ => Ok(connection.peer()),
        }
    }

    /// The state of a connection.
    pub fn state(&self, key: Key) -> Result<State> {
        Ok(self.get(key)?.state())
    }

    /// The control block of a connection.
    pub fn control_block(&self, key: Key) -> Result<&ControlBlock> {
        Ok(self.get(key)?.control_block())
    }

    /// Inspect a connection.
    pub fn connection(&self, key: Key) -> Option<&Connection> {
        self.states.get(key).map(|slot| &slot.connection)
    }

    /// Change the segment size, only while closed.
    pub fn set_segment_size(&mut self, key: Key, size: u32) -> Result<()> {
        self.get_mut(key)?.set_segment_size(size)
    }

    /// Change the initial congestion window in segments, only while closed.
    pub fn set_initial_cwnd(&mut self, key: Key, segments: u32) -> Result<()> {
        self.get_mut(key)?.set_initial_cwnd(segments)
    }

    /// Change the initial slow start threshold, only while closed.
    pub fn set_initial_ssthresh(&mut self, key: Key, bytes: u32) -> Result<()> {
        self.get_mut(key)?.set_initial_ssthresh(bytes)
    }

    /// Change the maximum sizes of both buffers.
    pub fn set_buffer_sizes(&mut self, key: Key, snd_buf_size: u32, rcv_buf_size: u32) -> Result<()> {
        let connection = self.get_mut(key)?;
        connection.set_snd_buf_size(snd_buf_size);
        connection.set_rcv_buf_size(rcv_buf_size);
        Ok(())
    }

    /// Forget a socket.
    ///
    /// Releases its binding and turns every event still scheduled for it into a no-op. Returns
    /// whether the key referred to a socket, removing twice is harmless.
    pub fn remove(&mut self, key: Key) -> bool {
        match self.states.remove(key) {
            Some(slot) => {
                if let Some(tuple) = slot.binding {
                    Self::unbind(&mut self.ports, key, tuple);
                }
                net_debug!("{}: removed in {}", key, slot.connection.state());
                true
            },
            None => false,
        }
    }

    /// The number of sockets, including closed ones not yet removed.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Check if there are no sockets.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Process an incoming segment.
    ///
    /// `src` and `dst` are the addresses of the IP header, `ecn` its ECN codepoint.
    pub fn receive(&mut self, now: Instant, src: IpAddress, dst: IpAddress, bytes: &[u8], ecn: IpEcn) -> RxStatus {
        self.set_now(now);

        let checksum = if self.checksum {
            TcpChecksum::Manual { src_addr: src, dst_addr: dst }
        } else {
            TcpChecksum::Ignored
        };
        let segment = match TcpRepr::parse(bytes, checksum) {
            Ok(segment) => segment,
            Err(err) => {
                net_warn!("dropped segment from {}: {}", src, err);
                return RxStatus::Truncated;
            },
        };
        if !segment.checksum_ok {
            net_debug!("dropped segment from {}: checksum error", src);
            return RxStatus::ChecksumFailed;
        }

        let repr = &segment.repr;
        let local = IpEndpoint::new(dst, repr.dst_port);
        let peer = IpEndpoint::new(src, repr.src_port);
        let key = match self.lookup(local, peer) {
            Some(key) => key,
            None => return self.reply_reset(local, peer, repr, segment.payload.len()),
        };

        let payload = segment.payload;
        match self.dispatch(key, |connection, io| connection.arrives(repr, payload, local, peer, ecn, io)) {
            Ok(()) => RxStatus::Ok,
            Err(_) => RxStatus::NoEndpoint,
        }
    }

    /// Deliver every event due at or before `now`, in order.
    pub fn advance(&mut self, now: Instant) {
        while let Some((at, key, action)) = self.scheduler.pop_due(now) {
            self.set_now(at);
            match action {
                Action::Timer { kind, token } => {
                    // A removed connection has no timers.
                    let _ = self.dispatch(key, |connection, io| connection.on_timer(kind, token, io));
                },
                Action::CompleteFork { listener, local, peer, syn } => {
                    self.complete_fork(key, listener, local, peer, &syn);
                },
                Action::ConnectionSucceeded => {
                    let _ = self.dispatch(key, |connection, io| connection.connection_succeeded(io));
                },
            }
        }
        self.set_now(now);
    }

    /// When `advance` next has work to do.
    pub fn poll_at(&self) -> Expiration {
        self.scheduler.next_deadline()
    }

    /// Take the segments waiting to be sent, oldest first.
    pub fn transmit(&mut self) -> Vec<Transmit> {
        self.outgoing.drain(..).collect()
    }

    /// Take the pending application events, oldest first.
    pub fn events(&mut self) -> Vec<(Key, Event)> {
        self.events.drain(..).collect()
    }

    fn get(&self, key: Key) -> Result<&Connection> {
        self.connection(key).ok_or(SocketError::BadHandle)
    }

    fn get_mut(&mut self, key: Key) -> Result<&mut Connection> {
        self.states.get_mut(key)
            .map(|slot| &mut slot.connection)
            .ok_or(SocketError::BadHandle)
    }

    fn set_now(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
    }

    /// Run an operation on a connection and carry out its effects.
    fn dispatch<F, T>(&mut self, key: Key, op: F) -> Result<T>
        where F: FnOnce(&mut Connection, &mut Io) -> T
    {
        let slot = self.states.get_mut(key).ok_or(SocketError::BadHandle)?;
        let mut io = Io {
            now: self.now,
            key,
            scheduler: &mut self.scheduler,
            signals: Signals::default(),
        };
        let result = op(&mut slot.connection, &mut io);
        let signals = io.signals;
        self.apply(key, signals);
        Ok(result)
    }

    fn apply(&mut self, key: Key, signals: Signals) {
        let Signals { segments, events, deallocate, fork } = signals;

        for outgoing in segments {
            self.emit(outgoing);
        }
        self.events.extend(events.into_iter().map(|event| (key, event)));

        if deallocate {
            if let Some(slot) = self.states.get_mut(key) {
                if let Some(tuple) = slot.binding.take() {
                    net_debug!("{}: released {}:{}", key, tuple.local, tuple.local_port);
                    Self::unbind(&mut self.ports, key, tuple);
                }
            }
        }

        if let Some(request) = fork {
            self.fork(key, request);
        }
    }

    /// Copy a listener for an accepted request, the copy completes the handshake later.
    fn fork(&mut self, listener: Key, request: ForkRequest) {
        let connection = match self.states.get(listener) {
            Some(slot) => slot.connection.fork(),
            None => return,
        };
        let child = self.states.insert(Slot {
            connection,
            binding: None,
        });

        let ForkRequest { local, peer, syn } = request;
        net_debug!("{}: forked {} for {}", listener, child, peer);
        let action = Action::CompleteFork { listener, local, peer, syn };
        self.scheduler.schedule(self.now, child, action);
    }

    fn complete_fork(&mut self, child: Key, listener: Key, local: IpEndpoint, peer: IpEndpoint, syn: &TcpRepr) {
        let tuple = FourTuple::new(local, peer);
        if self.ports.contains_key(&tuple) {
            // A duplicate SYN forked twice, the first copy owns the tuple.
            net_debug!("{}: {} is connected already, dropping fork", child, peer);
            self.states.remove(child);
            return;
        }

        let isn = match self.states.get_mut(child) {
            Some(slot) => {
                slot.binding = Some(tuple);
                slot.connection.bind(local, peer);
                slot.connection.config().isn
            },
            None => return,
        };
        self.ports.insert(tuple, child);
        let isn = self.isn_for(isn, tuple);
        let _ = self.dispatch(child, |connection, io| connection.complete_fork(syn, listener, isn, io));
    }

    /// Find the connection for a segment, preferring an exact match over a listener.
    fn lookup(&self, local: IpEndpoint, peer: IpEndpoint) -> Option<Key> {
        let exact = FourTuple::new(local, peer);
        let listening = FourTuple::new(local, IpEndpoint::UNSPECIFIED);
        let wildcard = FourTuple::new(IpEndpoint::new(IpAddress::Unspecified, local.port), IpEndpoint::UNSPECIFIED);

        let key = [exact, listening, wildcard].iter()
            .filter_map(|tuple| self.ports.get(tuple))
            .next()
            .copied()?;
        // A bound but unconnected socket answers like no socket at all.
        match self.states.get(key) {
            Some(slot) if slot.connection.state() != State::Closed => Some(key),
            _ => None,
        }
    }

    /// Answer a segment that matched no connection, RFC 793 reset generation.
    fn reply_reset(&mut self, local: IpEndpoint, peer: IpEndpoint, repr: &TcpRepr, payload_len: usize) -> RxStatus {
        if repr.flags.rst() {
            return RxStatus::NoEndpoint;
        }

        let mut reply = TcpRepr::new(local.port, peer.port);
        if repr.flags.ack() {
            reply.flags = TcpFlags::RST;
            reply.seq_number = repr.ack_number;
        } else {
            reply.flags = TcpFlags::RST | TcpFlags::ACK;
            reply.seq_number = TcpSeqNumber(0);
            reply.ack_number = repr.seq_number + repr.sequence_len(payload_len);
        }
        net_debug!("no connection for {} > {}, resetting", peer, local);
        self.emit(Outgoing {
            local,
            peer,
            ecn: IpEcn::NotEct,
            repr: reply,
            payload: Vec::new(),
        });
        RxStatus::Reset
    }

    fn emit(&mut self, outgoing: Outgoing) {
        let Outgoing { local, peer, ecn, repr, payload } = outgoing;
        if local.addr.is_unspecified() {
            net_error!("no source address for segment to {}, dropped", peer);
            return;
        }

        let checksum = if self.checksum {
            TcpChecksum::Manual { src_addr: local.addr, dst_addr: peer.addr }
        } else {
            TcpChecksum::Ignored
        };
        self.outgoing.push_back(Transmit {
            src: local,
            dst: peer,
            ecn,
            bytes: repr.serialize(&payload, checksum),
        });
    }

    fn isn_for(&self, mode: IsnMode, tuple: FourTuple) -> TcpSeqNumber {
        match mode {
            IsnMode::Zero => TcpSeqNumber(0),
            IsnMode::Hashed => self.isn.get_isn(tuple, self.now),
        }
    }

    fn rebind(&mut self, key: Key, old: FourTuple, new: FourTuple) {
        Self::unbind(&mut self.ports, key, old);
        self.ports.insert(new, key);
        if let Some(slot) = self.states.get_mut(key) {
            slot.binding = Some(new);
        }
    }

    fn unbind(ports: &mut HashMap<FourTuple, Key>, key: Key, tuple: FourTuple) {
        if ports.get(&tuple) == Some(&key) {
            ports.remove(&tuple);
        }
    }

    fn port_in_use(&self, addr: IpAddress, port: u16) -> bool {
        self.ports.keys().any(|tuple| {
            tuple.local_port == port
                && (tuple.local == addr || tuple.local.is_unspecified() || addr.is_unspecified())
        })
    }

    fn ephemeral_port(&mut self, addr: IpAddress) -> Result<u16> {
        for _ in 0..EPHEMERAL_COUNT {
            let port = EPHEMERAL_START + (self.next_port % EPHEMERAL_COUNT) as u16;
            self.next_port = (self.next_port + 1) % EPHEMERAL_COUNT;
            if !self.port_in_use(addr, port) {
                return Ok(port);
            }
        }
        net_warn!("ephemeral ports exhausted");
        Err(SocketError::AddrNotAvail)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::new(IsnGenerator::from_std_hash())
    }
}
