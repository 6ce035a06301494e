//! The connection state machine.
//!
//! A [`Connection`] owns one control block, one estimator and strategy instance of each kind,
//! both buffers and its timers. It never talks to the endpoint directly. Every entry point gets an
//! [`Io`] that carries the logical time, the scheduler for arming timers and the [`Signals`]
//! collecting the effects: segments to send, application events, and requests that only the
//! endpoint can fulfill such as releasing the demultiplexer binding or forking a listener.
//!
//! Segment processing follows the classic split. Header fields that matter in every state (ECN
//! marks, options, the send window) are consumed first, then the segment is dispatched on the
//! state. Acknowledgement processing always completes before pending data is sent, so that a
//! window changed by the acknowledgement gates the transmission.
//!
//! [`Connection`]: struct.Connection.html
//! [`Io`]: struct.Io.html
//! [`Signals`]: struct.Signals.html
use std::collections::VecDeque;
use std::fmt;

use crate::time::{Duration, Expiration, Instant};
use crate::wire::{IpEcn, IpEndpoint, TcpFlags, TcpOption, TcpOptionKind, TcpRepr, TcpSeqNumber};
use crate::wire::tcp_option::{elapsed_from_ts_value, ts_value};

use super::config::{Config, EcnMode, MAX_BACKOFF};
use super::congestion::{congestion_ops, CongestionOps};
use super::endpoint::Action;
use super::io::{ReceiveBuffer, RxBuffer, SendBuffer, TxBuffer};
use super::recovery::{recovery_ops, RecoveryOps};
use super::rtt::{MeanDeviation, RttEstimator, RttHistory};
use super::slots::Key;
use super::socket::{Event, SocketError};
use super::state::{CaEvent, CongState, ControlBlock, EcnState, State};
use super::timer::{Scheduler, TimerKind, Timers};

const SYN_ACK: TcpFlags = TcpFlags(0x12);
const FIN_ACK: TcpFlags = TcpFlags(0x11);
const SYN_ECN: TcpFlags = TcpFlags(0xc2);
const SYN_ACK_ECE: TcpFlags = TcpFlags(0x52);
const ACK_ECE: TcpFlags = TcpFlags(0x50);

/// The largest window scale shift, RFC 7323.
const MAX_WINDOW_SHIFT: u8 = 14;

/// The context of one call into a connection.
pub(crate) struct Io<'a> {
    /// The logical time of the event being processed.
    pub(crate) now: Instant,
    /// The key of the connection, the address of its timer events.
    pub(crate) key: Key,
    pub(crate) scheduler: &'a mut Scheduler<Action>,
    pub(crate) signals: Signals,
}

/// Effects of processing an event that the endpoint must carry out.
#[derive(Debug, Default)]
pub(crate) struct Signals {
    /// Segments to put on the wire, in order.
    pub(crate) segments: Vec<Outgoing>,

    /// Notifications for the application.
    pub(crate) events: Vec<Event>,

    /// The connection gave up its binding in the demultiplexer.
    ///
    /// The connection itself stays until the application removes it.
    pub(crate) deallocate: bool,

    /// A listener accepted a connection request and wants a copy of itself to handle it.
    pub(crate) fork: Option<ForkRequest>,
}

/// A segment produced by a connection.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub(crate) local: IpEndpoint,
    pub(crate) peer: IpEndpoint,
    pub(crate) ecn: IpEcn,
    pub(crate) repr: TcpRepr,
    pub(crate) payload: Vec<u8>,
}

/// An accepted SYN, to be completed by a forked connection.
#[derive(Debug)]
pub(crate) struct ForkRequest {
    pub(crate) local: IpEndpoint,
    pub(crate) peer: IpEndpoint,
    pub(crate) syn: TcpRepr,
}

/// Admission decision of a listener, consulted for every connection request.
pub type Acceptor = Box<dyn FnMut(IpEndpoint) -> bool>;

/// One end of a connection.
pub struct Connection {
    state: State,
    config: Config,
    tcb: ControlBlock,
    rtt: Box<dyn RttEstimator>,
    congestion: Box<dyn CongestionOps>,
    recovery: Box<dyn RecoveryOps>,
    tx: Box<dyn SendBuffer>,
    rx: Box<dyn ReceiveBuffer>,
    timers: Timers,
    history: VecDeque<RttHistory>,

    local: IpEndpoint,
    peer: IpEndpoint,
    /// Whether the demultiplexer delivers segments to this connection.
    bound: bool,
    /// The listener this connection was forked from.
    listener: Option<Key>,
    acceptor: Option<Acceptor>,

    /// Flags of the empty segment the retransmission timer resends, `None` for data.
    retx_flags: Option<TcpFlags>,
    rto: Duration,
    persist_timeout: Duration,
    syn_count: u32,
    data_retries: u32,
    dup_ack_count: u32,
    del_ack_count: u32,
    bytes_acked_not_processed: u32,
    first_partial_ack: bool,

    /// The recovery point, `high_tx_mark` when loss was last detected.
    recover: TcpSeqNumber,
    /// Highest sequence number seen from the peer, for window updates.
    high_rx_mark: TcpSeqNumber,
    /// Highest acknowledgement seen from the peer.
    high_rx_ack_mark: TcpSeqNumber,
    /// Highest acknowledgement we sent.
    high_tx_ack: TcpSeqNumber,

    /// The send window in bytes, after scaling.
    rwnd: u32,
    /// The last receive window we advertised, before scaling.
    adv_wnd: u32,
    rcv_wnd_shift: u8,
    snd_wnd_shift: u8,
    window_scaling: bool,
    sack: bool,
    timestamps: bool,
    timestamp_to_echo: u32,

    ecn_echo_seq: Option<TcpSeqNumber>,
    ecn_ce_seq: Option<TcpSeqNumber>,
    ecn_cwr_seq: Option<TcpSeqNumber>,

    connected: bool,
    close_notified: bool,
    close_on_empty: bool,
    shutdown_send: bool,
    shutdown_recv: bool,
}

impl Connection {
    /// Create a closed connection.
    ///
    /// Fails if the configuration names an unknown congestion or recovery algorithm.
    pub(crate) fn new(config: Config) -> Result<Self, SocketError> {
        let congestion = congestion_ops(&config.congestion_ops).ok_or_else(|| {
            net_error!("unknown congestion algorithm {}", config.congestion_ops);
            SocketError::Invalid
        })?;
        let recovery = recovery_ops(&config.recovery_ops).ok_or_else(|| {
            net_error!("unknown recovery algorithm {}", config.recovery_ops);
            SocketError::Invalid
        })?;

        let mut tcb = ControlBlock::new(config.segment_size);
        tcb.initial_cwnd = config.initial_cwnd;
        tcb.initial_ssthresh = config.initial_ssthresh;
        tcb.ssthresh = config.initial_ssthresh;
        tcb.pacing = config.pacing;
        tcb.max_pacing_rate = config.max_pacing_rate;
        tcb.current_pacing_rate = config.max_pacing_rate;

        let mut tx = TxBuffer::new(config.snd_buf_size as usize, config.segment_size as usize);
        tx.set_dup_ack_thresh(config.retx_threshold);
        let rx = RxBuffer::new(config.rcv_buf_size as usize);
        let rtt = MeanDeviation::new(config.initial_rtt);
        let rto = rtt.rto(config.clock_granularity, config.min_rto);

        Ok(Connection {
            state: State::Closed,
            tcb,
            rtt: Box::new(rtt),
            congestion,
            recovery,
            tx: Box::new(tx),
            rx: Box::new(rx),
            timers: Timers::new(),
            history: VecDeque::new(),
            local: IpEndpoint::UNSPECIFIED,
            peer: IpEndpoint::UNSPECIFIED,
            bound: false,
            listener: None,
            acceptor: None,
            retx_flags: None,
            rto,
            persist_timeout: config.persist_timeout,
            syn_count: config.syn_retries,
            data_retries: config.data_retries,
            dup_ack_count: 0,
            del_ack_count: 0,
            bytes_acked_not_processed: 0,
            first_partial_ack: true,
            recover: TcpSeqNumber::default(),
            high_rx_mark: TcpSeqNumber::default(),
            high_rx_ack_mark: TcpSeqNumber::default(),
            high_tx_ack: TcpSeqNumber::default(),
            rwnd: 0,
            adv_wnd: 0,
            rcv_wnd_shift: 0,
            snd_wnd_shift: 0,
            window_scaling: config.window_scaling,
            sack: config.sack,
            timestamps: config.timestamps,
            timestamp_to_echo: 0,
            ecn_echo_seq: None,
            ecn_ce_seq: None,
            ecn_cwr_seq: None,
            connected: false,
            close_notified: false,
            close_on_empty: false,
            shutdown_send: false,
            shutdown_recv: false,
            config,
        })
    }

    /// A deep copy for a connection request accepted by a listener.
    ///
    /// Strategies, estimator and buffers are copied, never shared. Timers, the acceptor and the
    /// binding are not carried over.
    pub(crate) fn fork(&self) -> Self {
        Connection {
            state: self.state,
            config: self.config.clone(),
            tcb: self.tcb.clone(),
            rtt: self.rtt.fork(),
            congestion: self.congestion.fork(),
            recovery: self.recovery.fork(),
            tx: self.tx.fork(),
            rx: self.rx.fork(),
            timers: Timers::new(),
            history: self.history.clone(),
            local: self.local,
            peer: self.peer,
            bound: false,
            listener: None,
            acceptor: None,
            retx_flags: None,
            rto: self.rto,
            persist_timeout: self.persist_timeout,
            syn_count: self.syn_count,
            data_retries: self.data_retries,
            dup_ack_count: self.dup_ack_count,
            del_ack_count: self.del_ack_count,
            bytes_acked_not_processed: self.bytes_acked_not_processed,
            first_partial_ack: self.first_partial_ack,
            recover: self.recover,
            high_rx_mark: self.high_rx_mark,
            high_rx_ack_mark: self.high_rx_ack_mark,
            high_tx_ack: self.high_tx_ack,
            rwnd: self.rwnd,
            adv_wnd: self.adv_wnd,
            rcv_wnd_shift: self.rcv_wnd_shift,
            snd_wnd_shift: self.snd_wnd_shift,
            window_scaling: self.window_scaling,
            sack: self.sack,
            timestamps: self.timestamps,
            timestamp_to_echo: self.timestamp_to_echo,
            ecn_echo_seq: self.ecn_echo_seq,
            ecn_ce_seq: self.ecn_ce_seq,
            ecn_cwr_seq: self.ecn_cwr_seq,
            connected: self.connected,
            close_notified: self.close_notified,
            close_on_empty: self.close_on_empty,
            shutdown_send: self.shutdown_send,
            shutdown_recv: self.shutdown_recv,
        }
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The transmission control block.
    pub fn control_block(&self) -> &ControlBlock {
        &self.tcb
    }

    /// The retransmission timeout the next retransmission timer is armed with.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// The round trip time estimator.
    pub fn rtt(&self) -> &dyn RttEstimator {
        &*self.rtt
    }

    /// The send window offered by the peer, after scaling.
    pub fn send_window(&self) -> u32 {
        self.rwnd
    }

    /// The number of duplicate acknowledgements counted towards fast retransmit.
    pub fn dup_ack_count(&self) -> u32 {
        self.dup_ack_count
    }

    /// The first unacknowledged sequence number.
    pub fn head_sequence(&self) -> TcpSeqNumber {
        self.tx.head_sequence()
    }

    /// The next sequence number expected from the peer.
    pub fn next_rx_sequence(&self) -> TcpSeqNumber {
        self.rx.next_rx_sequence()
    }

    /// When a timer fires, if it is running.
    pub fn timer(&self, kind: TimerKind) -> Expiration {
        self.timers.expiry(kind)
    }

    /// The configuration the connection was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The local address, unspecified until bound.
    pub fn local(&self) -> IpEndpoint {
        self.local
    }

    /// The remote address, unspecified unless connected.
    pub fn peer(&self) -> IpEndpoint {
        self.peer
    }

    /// Attach the connection to its addresses in the demultiplexer.
    pub(crate) fn bind(&mut self, local: IpEndpoint, peer: IpEndpoint) {
        self.local = local;
        self.peer = peer;
        self.bound = true;
    }

    pub(crate) fn set_acceptor(&mut self, acceptor: Option<Acceptor>) {
        self.acceptor = acceptor;
    }

    pub(crate) fn set_segment_size(&mut self, size: u32) -> Result<(), SocketError> {
        if self.state != State::Closed || size == 0 {
            return Err(SocketError::Invalid);
        }
        self.config.segment_size = size;
        self.tcb.segment_size = size;
        self.tx.set_segment_size(size as usize);
        Ok(())
    }

    pub(crate) fn set_initial_cwnd(&mut self, segments: u32) -> Result<(), SocketError> {
        if self.state != State::Closed {
            return Err(SocketError::Invalid);
        }
        self.config.initial_cwnd = segments;
        self.tcb.initial_cwnd = segments;
        Ok(())
    }

    pub(crate) fn set_initial_ssthresh(&mut self, bytes: u32) -> Result<(), SocketError> {
        if self.state != State::Closed {
            return Err(SocketError::Invalid);
        }
        self.config.initial_ssthresh = bytes;
        self.tcb.initial_ssthresh = bytes;
        self.tcb.ssthresh = bytes;
        Ok(())
    }

    pub(crate) fn set_snd_buf_size(&mut self, size: u32) {
        self.config.snd_buf_size = size;
        self.tx.set_max_buffer_size(size as usize);
    }

    pub(crate) fn set_rcv_buf_size(&mut self, size: u32) {
        self.config.rcv_buf_size = size;
        self.rx.set_max_buffer_size(size as usize);
    }

    /// Free space in the send buffer.
    pub fn tx_available(&self) -> usize {
        self.tx.available()
    }

    /// Bytes ready to be received in order.
    pub fn rx_available(&self) -> usize {
        self.rx.available()
    }

    /// Open actively, with the initial sequence number chosen by the endpoint.
    pub(crate) fn connect(&mut self, isn: TcpSeqNumber, io: &mut Io) {
        self.rtt.reset();
        self.syn_count = self.config.syn_retries;
        self.data_retries = self.config.data_retries;
        if self.state == State::Closed || self.state == State::Listen {
            self.init_sequence(isn);
        }
        self.do_connect(io);
    }

    /// Start listening. The caller has checked the state.
    pub(crate) fn listen(&mut self) {
        self.set_state(State::Listen);
    }

    /// Complete a connection request on behalf of a listener.
    ///
    /// Runs on the fork, one scheduling step after the listener accepted the SYN.
    pub(crate) fn complete_fork(&mut self, syn: &TcpRepr, listener: Key, isn: TcpSeqNumber, io: &mut Io) {
        self.listener = Some(listener);
        self.set_state(State::SynReceived);
        self.syn_count = self.config.syn_retries;
        self.data_retries = self.config.data_retries;
        self.init_sequence(isn);
        self.process_syn_options(syn);
        self.rx.set_next_rx_sequence(syn.seq_number + 1);

        let ecn_requested = syn.flags.contains(TcpFlags::ECE | TcpFlags::CWR);
        if self.config.ecn_mode == EcnMode::ClassicEcn && ecn_requested {
            self.send_empty_packet(SYN_ACK_ECE, io);
            self.set_ecn_state(EcnState::Idle);
        } else {
            self.send_empty_packet(SYN_ACK, io);
            self.set_ecn_state(EcnState::Disabled);
        }
    }

    /// Notify the application of a successful active open, deferred from the handshake.
    pub(crate) fn connection_succeeded(&mut self, io: &mut Io) {
        if self.connected {
            io.signals.events.push(Event::ConnectionSucceeded);
        }
    }

    /// Process an incoming segment.
    ///
    /// `local` and `peer` are the addresses the segment was sent to and from.
    pub(crate) fn arrives(
        &mut self,
        repr: &TcpRepr,
        payload: &[u8],
        local: IpEndpoint,
        peer: IpEndpoint,
        ecn: IpEcn,
        io: &mut Io,
    ) {
        net_trace!("{} {} < {}: {} len {}", io.key, self.state, peer, repr, payload.len());

        if self.state == State::Listen {
            // Nothing of the header is consumed by a listener, the fork does that.
            return self.arrives_listen(repr, local, peer, io);
        }

        let seq = repr.seq_number;
        if self.tcb.ecn_state != EcnState::Disabled {
            if ecn == IpEcn::Ce && self.ecn_ce_seq.map_or(true, |ce| ce < seq) {
                net_info!("{}: congestion experienced at {}", io.key, seq);
                self.ecn_ce_seq = Some(seq);
                self.set_ecn_state(EcnState::CeReceived);
                self.congestion.cwnd_event(&mut self.tcb, CaEvent::EcnIsCe);
            } else if ecn != IpEcn::NotEct {
                self.congestion.cwnd_event(&mut self.tcb, CaEvent::EcnNoCe);
            }
        }

        if !payload.is_empty() && self.out_of_range(seq, seq + payload.len()) {
            net_debug!("{}: segment {}+{} outside the window", io.key, seq, payload.len());
            if !repr.flags.rst() {
                self.send_ack(io);
            }
            return;
        }

        if self.state == State::Established && !repr.flags.rst() && repr.flags.cwr() {
            match self.tcb.ecn_state {
                EcnState::Disabled | EcnState::CeReceived => {},
                _ => self.set_ecn_state(EcnState::Idle),
            }
        }

        if repr.flags.syn() {
            self.process_syn_options(repr);
            if repr.flags.ack() {
                self.estimate_rtt(repr, io.now);
                self.high_rx_ack_mark = repr.ack_number;
            }
        } else if repr.flags.ack() {
            if self.timestamps {
                match repr.option(TcpOptionKind::Timestamp) {
                    Some(&TcpOption::Timestamp { value, echo }) => {
                        self.process_timestamp(value, echo, seq);
                    },
                    // Not negotiated before the peer's SYN, and resets go through regardless.
                    _ if self.state == State::SynSent || repr.flags.rst() => {},
                    _ => {
                        net_warn!("{}: timestamps are on but the segment has none, discarded", io.key);
                        return;
                    },
                }
            }
            self.estimate_rtt(repr, io.now);
            self.update_window_size(repr);
        }

        if self.rwnd == 0 && !self.timers.is_running(TimerKind::Persist) && self.can_probe() {
            net_debug!("{}: zero window, probing", io.key);
            self.timers.cancel(TimerKind::Retransmit);
            let timeout = self.persist_timeout;
            self.arm(io, TimerKind::Persist, timeout);
        }

        match self.state {
            State::Closed => self.arrives_closed(repr, io),
            State::Listen => {},
            State::SynSent => self.arrives_syn_sent(repr, payload, io),
            State::SynReceived => self.arrives_syn_received(repr, payload, io),
            State::Established => self.arrives_established(repr, payload, io),
            State::CloseWait | State::FinWait1 | State::FinWait2 => self.arrives_wait(repr, payload, io),
            State::Closing => self.arrives_closing(repr, io),
            State::LastAck => self.arrives_last_ack(repr, payload, io),
            State::TimeWait => {},
        }

        if self.rwnd != 0 && self.timers.is_running(TimerKind::Persist) {
            net_debug!("{}: window opened", io.key);
            self.timers.cancel(TimerKind::Persist);
            self.send_pending_data(self.connected, io);
        }
    }

    /// Deliver a scheduled timer event. Events of cancelled or re-armed timers are ignored.
    pub(crate) fn on_timer(&mut self, kind: TimerKind, token: u64, io: &mut Io) {
        if self.timers.fire(kind, token) {
            self.timer_expired(kind, io);
        }
    }

    fn timer_expired(&mut self, kind: TimerKind, io: &mut Io) {
        net_trace!("{} {}: {:?} timer", io.key, self.state, kind);
        match kind {
            TimerKind::Retransmit => match self.retx_flags.take() {
                Some(flags) if flags.syn() => self.send_empty_packet(flags, io),
                _ => self.retransmit_timeout(io),
            },
            TimerKind::Persist => self.persist_expired(io),
            TimerKind::DelayedAck => self.delayed_ack_expired(io),
            TimerKind::LastAck => self.last_ack_expired(io),
            TimerKind::TimeWait => self.close_and_notify(io),
            TimerKind::Pacing | TimerKind::SendPending => {
                self.send_pending_data(self.connected, io);
            },
        }
    }

    /// Queue data for sending.
    pub(crate) fn send(&mut self, data: &[u8], io: &mut Io) -> Result<usize, SocketError> {
        match self.state {
            State::Established | State::SynSent | State::CloseWait => {},
            _ => return Err(SocketError::NotConn),
        }
        if self.shutdown_send {
            return Err(SocketError::Shutdown);
        }
        if !self.tx.add(data) {
            return Err(SocketError::MsgSize);
        }

        let open = self.state == State::Established || self.state == State::CloseWait;
        if open && self.available_window() > 0 && !self.timers.is_running(TimerKind::SendPending) {
            // Deferred so that the application may fill the buffer first.
            self.arm(io, TimerKind::SendPending, Duration::from_micros(0));
        }
        Ok(data.len())
    }

    /// Take received in-order data.
    ///
    /// An empty result in CLOSE_WAIT is the end of the stream.
    pub(crate) fn recv(&mut self, max: usize, io: &mut Io) -> Vec<u8> {
        if self.rx.available() == 0 {
            return Vec::new();
        }

        let data = self.rx.extract(max);
        let segment = self.tcb.segment_size;
        let window = self.receive_window();
        // RFC 1122 window update, the peer may be waiting for room.
        if self.state.has_receive_window() && self.adv_wnd < segment && window >= segment {
            self.send_ack(io);
        }
        data
    }

    /// Close by the application.
    pub(crate) fn close(&mut self, io: &mut Io) {
        if self.rx.size() != 0 {
            net_warn!("{}: unread data on close, sending reset", io.key);
            self.send_rst(io);
            return;
        }

        if self.tx.size_from_sequence(self.tcb.next_tx_sequence) > 0 {
            if !self.close_on_empty {
                self.close_on_empty = true;
                net_info!("{}: deferring close in {}", io.key, self.state);
            }
            return;
        }

        self.do_close(io);
    }

    /// The application has nothing more to send.
    pub(crate) fn shutdown_send(&mut self, io: &mut Io) {
        self.shutdown_send = true;
        self.close_on_empty = true;
        if self.tx.size() == 0 {
            self.fin_on_empty(io);
        }
    }

    /// The application reads no more.
    pub(crate) fn shutdown_recv(&mut self) {
        self.shutdown_recv = true;
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            net_debug!("{} {}: {} -> {}", self.local, self.peer, self.state, state);
        }
        self.state = state;
    }

    fn set_cong_state(&mut self, state: CongState) {
        if self.tcb.cong_state != state {
            net_debug!("{} {}: {} -> {}", self.local, self.peer, self.tcb.cong_state, state);
        }
        self.congestion.congestion_state_set(&mut self.tcb, state);
        self.tcb.cong_state = state;
    }

    fn set_ecn_state(&mut self, state: EcnState) {
        if self.tcb.ecn_state != state {
            net_debug!("{} {}: {} -> {}", self.local, self.peer, self.tcb.ecn_state, state);
        }
        self.tcb.ecn_state = state;
    }

    fn init_sequence(&mut self, isn: TcpSeqNumber) {
        self.tcb.next_tx_sequence = isn;
        self.tcb.high_tx_mark = isn;
        self.tcb.last_acked_seq = isn;
        self.tx.set_head_sequence(isn);
        self.recover = isn;
        self.high_tx_ack = TcpSeqNumber::default();
        self.history.clear();
    }

    fn arm(&mut self, io: &mut Io, kind: TimerKind, after: Duration) {
        let at = io.now + after;
        let token = self.timers.arm(kind, at);
        io.scheduler.schedule(at, io.key, Action::Timer { kind, token });
    }

    fn arm_retransmit(&mut self, io: &mut Io, after: Duration, flags: Option<TcpFlags>) {
        self.retx_flags = flags;
        self.arm(io, TimerKind::Retransmit, after);
    }

    fn notify(&mut self, event: Event, io: &mut Io) {
        net_trace!("{}: {:?}", io.key, event);
        io.signals.events.push(event);
    }

    fn notify_close(&mut self, event: Event, io: &mut Io) {
        if !self.close_notified {
            self.close_notified = true;
            self.notify(event, io);
        }
    }

    /// Give up the binding and all timers.
    fn deallocate(&mut self, io: &mut Io) {
        self.timers.cancel_all();
        if self.bound {
            self.bound = false;
            io.signals.deallocate = true;
        }
    }

    fn close_and_notify(&mut self, io: &mut Io) {
        self.notify_close(Event::NormalClose, io);
        self.set_state(State::Closed);
        self.deallocate(io);
    }

    fn send_rst(&mut self, io: &mut Io) {
        self.send_empty_packet(TcpFlags::RST, io);
        self.notify_close(Event::ErrorClose, io);
        self.set_state(State::Closed);
        self.deallocate(io);
    }

    /// Give up on a segment that has no place in the current state.
    fn abort(&mut self, flags: TcpFlags, io: &mut Io) {
        if flags.rst() {
            net_debug!("{}: reset by peer in {}", io.key, self.state);
            self.notify_close(Event::ErrorClose, io);
        } else {
            self.send_rst(io);
        }
        self.close_and_notify(io);
    }

    fn time_wait(&mut self, io: &mut Io) {
        self.set_state(State::TimeWait);
        self.timers.cancel_all();
        self.notify_close(Event::NormalClose, io);
        let linger = self.config.max_segment_lifetime * 2;
        self.arm(io, TimerKind::TimeWait, linger);
    }

    fn do_connect(&mut self, io: &mut Io) {
        match self.state {
            State::Closed | State::Listen | State::SynSent | State::LastAck | State::CloseWait => {
                let flags = match self.config.ecn_mode {
                    EcnMode::ClassicEcn => SYN_ECN,
                    EcnMode::NoEcn => TcpFlags::SYN,
                };
                self.send_empty_packet(flags, io);
                self.set_state(State::SynSent);
                self.set_ecn_state(EcnState::Disabled);
            },
            State::TimeWait => {},
            _ => {
                self.send_rst(io);
                self.close_and_notify(io);
            },
        }
    }

    fn do_close(&mut self, io: &mut Io) {
        match self.state {
            State::SynReceived | State::Established => {
                self.send_empty_packet(TcpFlags::FIN, io);
                self.set_state(State::FinWait1);
            },
            State::CloseWait => {
                self.send_empty_packet(FIN_ACK, io);
                self.set_state(State::LastAck);
            },
            State::SynSent | State::Closing => {
                self.send_rst(io);
                self.close_and_notify(io);
            },
            State::Listen | State::LastAck => self.close_and_notify(io),
            State::Closed | State::FinWait1 | State::FinWait2 | State::TimeWait => {},
        }
    }

    /// Send the FIN that waited for the send buffer to drain.
    fn fin_on_empty(&mut self, io: &mut Io) {
        match self.state {
            State::Established => {
                self.send_empty_packet(TcpFlags::FIN, io);
                self.set_state(State::FinWait1);
            },
            State::CloseWait => {
                self.send_empty_packet(TcpFlags::FIN, io);
                self.set_state(State::LastAck);
            },
            _ => {},
        }
    }

    /// Whether a segment falls outside of what the state accepts.
    fn out_of_range(&self, head: TcpSeqNumber, tail: TcpSeqNumber) -> bool {
        match self.state {
            State::Closed | State::Listen | State::SynSent | State::SynReceived => false,
            State::LastAck | State::Closing | State::CloseWait => head != self.rx.next_rx_sequence(),
            _ => tail < self.rx.next_rx_sequence() || self.rx.max_rx_sequence() <= head,
        }
    }

    /// Zero window probes make sense once the peer's window is known.
    fn can_probe(&self) -> bool {
        self.bound && self.state.has_receive_window() && self.state != State::TimeWait
    }

    fn process_syn_options(&mut self, syn: &TcpRepr) {
        self.rwnd = u32::from(syn.window_len);

        match syn.option(TcpOptionKind::WindowScale) {
            Some(&TcpOption::WindowScale(shift)) if self.window_scaling => {
                if shift > MAX_WINDOW_SHIFT {
                    net_warn!("window scale {} exceeds {}, capped", shift, MAX_WINDOW_SHIFT);
                }
                self.snd_wnd_shift = shift.min(MAX_WINDOW_SHIFT);
                // Our shift is announced with our SYN, compute it in case that is still to come.
                self.rcv_wnd_shift = self.window_shift();
            },
            _ => {
                self.window_scaling = false;
                self.snd_wnd_shift = 0;
                self.rcv_wnd_shift = 0;
            },
        }

        if !(self.sack && syn.has_option(TcpOptionKind::SackPermitted)) {
            self.sack = false;
        }

        match syn.option(TcpOptionKind::Timestamp) {
            Some(&TcpOption::Timestamp { value, echo }) if self.timestamps => {
                self.tcb.rcv_timestamp_value = value;
                self.tcb.rcv_timestamp_echo_reply = echo;
                // TS.Recent starts at the value of the SYN.
                self.timestamp_to_echo = value;
            },
            _ => self.timestamps = false,
        }

        if let Some(&TcpOption::MaxSegmentSize(mss)) = syn.option(TcpOptionKind::MaxSegmentSize) {
            let mss = u32::from(mss);
            if mss != 0 && mss < self.tcb.segment_size {
                net_debug!("peer segment size {} below ours", mss);
                self.tcb.segment_size = mss;
                self.tx.set_segment_size(mss as usize);
            }
        }

        self.tcb.initialize_windows();
    }

    fn process_timestamp(&mut self, value: u32, echo: u32, seq: TcpSeqNumber) {
        // Older than what we have, RFC 7323 PAWS lite.
        if (value.wrapping_sub(self.tcb.rcv_timestamp_value) as i32) < 0 {
            return;
        }
        self.tcb.rcv_timestamp_value = value;
        self.tcb.rcv_timestamp_echo_reply = echo;
        if seq == self.rx.next_rx_sequence() && seq <= self.high_tx_ack {
            self.timestamp_to_echo = value;
        }
    }

    /// The window scale shift to announce, derived from the receive buffer.
    fn window_shift(&self) -> u8 {
        let mut space = self.rx.max_buffer_size();
        let max = usize::from(self.config.max_window_size);
        let mut shift = 0;
        while space > max && shift < MAX_WINDOW_SHIFT {
            space >>= 1;
            shift += 1;
        }
        shift
    }

    /// The receive window in bytes.
    fn receive_window(&self) -> u32 {
        let window = self.rx.max_rx_sequence().saturating_sub(self.rx.next_rx_sequence());
        window as u32
    }

    /// The window field of the next segment.
    fn advertised_window(&mut self, scale: bool) -> u16 {
        let window = if self.rx.got_fin() {
            self.adv_wnd
        } else {
            self.receive_window()
        };
        self.adv_wnd = window;

        let mut field = if scale { window >> self.rcv_wnd_shift } else { window };
        let max = u32::from(self.config.max_window_size);
        if field > max {
            net_warn!("advertised window {} exceeds {}, capped", field, max);
            field = max;
        }
        field as u16
    }

    fn update_window_size(&mut self, repr: &TcpRepr) {
        let window = u32::from(repr.window_len) << self.snd_wnd_shift;
        if !self.state.has_receive_window() {
            self.rwnd = window;
            return;
        }

        let mut update = false;
        if repr.ack_number == self.high_rx_ack_mark && window > self.rwnd {
            update = true;
        }
        if repr.ack_number > self.high_rx_ack_mark {
            self.high_rx_ack_mark = repr.ack_number;
            update = true;
        }
        if repr.seq_number > self.high_rx_mark {
            self.high_rx_mark = repr.seq_number;
            update = true;
        }
        if update {
            self.rwnd = window;
        }
    }

    /// Take a round trip sample from an acknowledgement, Karn's algorithm.
    fn estimate_rtt(&mut self, repr: &TcpRepr, now: Instant) {
        let ack = repr.ack_number;
        let mut sample = None;
        if let Some(front) = self.history.front() {
            if !front.retx && ack >= front.seq + front.count as usize {
                sample = match repr.option(TcpOptionKind::Timestamp) {
                    Some(&TcpOption::Timestamp { echo, .. }) if self.timestamps && echo != 0 => {
                        Some(elapsed_from_ts_value(now, echo))
                    },
                    _ => Some(now - front.time),
                };
            }
        }

        while let Some(front) = self.history.front() {
            if front.seq + front.count as usize <= ack {
                self.history.pop_front();
            } else {
                break;
            }
        }

        if let Some(rtt) = sample.filter(|rtt| *rtt > Duration::from_micros(0)) {
            self.rtt.measurement(rtt);
            self.rto = self.rtt.rto(self.config.clock_granularity, self.config.min_rto);
            self.tcb.record_rtt(self.rtt.estimate());
        }
    }

    fn update_rtt_history(&mut self, seq: TcpSeqNumber, len: usize, retx: bool, now: Instant) {
        if !retx {
            self.history.push_back(RttHistory { seq, count: len as u32, time: now, retx: false });
            return;
        }

        let entry = self.history.iter_mut().find(|entry| {
            entry.seq == seq || (entry.seq <= seq && seq < entry.seq + entry.count as usize)
        });
        if let Some(entry) = entry {
            entry.retx = true;
            entry.count = ((seq + len) - entry.seq) as u32;
        }
    }

    fn bytes_in_flight(&mut self) -> u32 {
        let in_flight = self.tx.bytes_in_flight() as u32;
        self.tcb.bytes_in_flight = in_flight;
        in_flight
    }

    fn un_ack_data_count(&self) -> u32 {
        self.tcb.high_tx_mark.saturating_sub(self.tx.head_sequence()) as u32
    }

    fn available_window(&mut self) -> u32 {
        let window = self.rwnd.min(self.tcb.cwnd);
        window.saturating_sub(self.bytes_in_flight())
    }

    fn header(&self, flags: TcpFlags, seq: TcpSeqNumber) -> TcpRepr {
        let mut repr = TcpRepr::new(self.local.port, self.peer.port);
        repr.flags = flags;
        repr.seq_number = seq;
        repr.ack_number = self.rx.next_rx_sequence();
        repr
    }

    fn add_timestamp(&self, repr: &mut TcpRepr, now: Instant) {
        if self.timestamps {
            repr.push_option(TcpOption::Timestamp {
                value: ts_value(now),
                echo: self.timestamp_to_echo,
            });
        }
    }

    fn add_sack(&self, repr: &mut TcpRepr) {
        if !self.sack || self.rx.sack_list_len() == 0 {
            return;
        }
        let allowed = TcpOption::sack_blocks_allowed(repr.options_len());
        let blocks: Vec<_> = self.rx.sack_list().into_iter().take(allowed).collect();
        if !blocks.is_empty() {
            repr.push_option(TcpOption::Sack(blocks.into()));
        }
    }

    fn transmit(&mut self, repr: TcpRepr, payload: Vec<u8>, ecn: IpEcn, io: &mut Io) {
        net_trace!("{} {} > {}: {} len {}", io.key, self.local, self.peer, repr, payload.len());
        io.signals.segments.push(Outgoing {
            local: self.local,
            peer: self.peer,
            ecn,
            repr,
            payload,
        });
    }

    /// Send a segment without data.
    ///
    /// SYN segments count against the SYN retries and arm the retransmission timer with the
    /// exponentially backed off connection timeout.
    fn send_empty_packet(&mut self, mut flags: TcpFlags, io: &mut Io) {
        if !self.bound {
            net_warn!("{}: no endpoint to send {} from", io.key, flags);
            return;
        }

        let mut seq = self.tcb.next_tx_sequence;
        if flags.fin() {
            flags |= TcpFlags::ACK;
        } else if let State::FinWait1 | State::LastAck | State::Closing = self.state {
            // Our FIN was sent already.
            seq += 1;
        }

        let mut repr = self.header(flags, seq);
        self.add_timestamp(&mut repr, io.now);
        let mut rto = self.rto;

        if flags.syn() {
            if self.syn_count == 0 {
                net_debug!("{}: giving up after {} connection attempts", io.key, self.config.syn_retries);
                self.rtt.reset();
                let event = if self.state == State::SynSent {
                    Event::ConnectionFailed
                } else {
                    Event::ErrorClose
                };
                self.notify_close(event, io);
                self.set_state(State::Closed);
                self.deallocate(io);
                return;
            }

            if self.window_scaling {
                self.rcv_wnd_shift = self.window_shift();
                repr.push_option(TcpOption::WindowScale(self.rcv_wnd_shift));
            }
            if self.sack {
                repr.push_option(TcpOption::SackPermitted);
            }
            let mss = self.config.segment_size.min(u32::from(u16::max_value())) as u16;
            repr.push_option(TcpOption::MaxSegmentSize(mss));

            let attempt = self.config.syn_retries - self.syn_count;
            rto = self.config.connection_timeout * (1u32 << attempt.min(16));
            self.syn_count -= 1;
            let retx = attempt > 0;
            self.update_rtt_history(seq, 0, retx, io.now);
            repr.window_len = self.advertised_window(false);
        } else {
            repr.window_len = self.advertised_window(true);
        }

        if flags.ack() {
            self.timers.cancel(TimerKind::DelayedAck);
            self.del_ack_count = 0;
            if self.high_tx_ack < repr.ack_number {
                self.high_tx_ack = repr.ack_number;
            }
            self.add_sack(&mut repr);
        }

        self.transmit(repr, Vec::new(), IpEcn::NotEct, io);

        if !self.timers.is_running(TimerKind::Retransmit) && flags.intersects(TcpFlags::SYN | TcpFlags::FIN) {
            self.arm_retransmit(io, rto.min(MAX_BACKOFF), Some(flags));
        }
    }

    /// Acknowledge, echoing congestion marks when ECN asks for it.
    fn send_ack(&mut self, io: &mut Io) {
        match self.tcb.ecn_state {
            EcnState::CeReceived | EcnState::SendingEce => {
                self.send_empty_packet(ACK_ECE, io);
                self.set_ecn_state(EcnState::SendingEce);
            },
            _ => self.send_empty_packet(TcpFlags::ACK, io),
        }
    }

    /// Send one segment of data starting at `seq`, returns the payload length.
    fn send_data_packet(&mut self, seq: TcpSeqNumber, max: usize, with_ack: bool, io: &mut Io) -> usize {
        let is_retransmission = seq != self.tcb.high_tx_mark;
        let segment = self.tx.copy_from_sequence(max, seq);
        let len = segment.data.len();
        let remaining = self.tx.size_from_sequence(seq + len);

        if self.tcb.pacing && !self.timers.is_running(TimerKind::Pacing) {
            let gap = self.tcb.current_pacing_rate.bytes_tx_time(len as u32);
            self.arm(io, TimerKind::Pacing, gap);
        }

        let mut flags = if with_ack { TcpFlags::ACK } else { TcpFlags::NONE };
        if with_ack {
            self.timers.cancel(TimerKind::DelayedAck);
            self.del_ack_count = 0;
        }

        // Reduce once per window of data, RFC 3168 section 6.1.2.
        let reduce = match (self.ecn_echo_seq, self.ecn_cwr_seq) {
            (Some(echo), Some(cwr)) => echo > cwr,
            (Some(_), None) => true,
            _ => false,
        };
        if self.tcb.ecn_state == EcnState::EceReceived && reduce && !is_retransmission {
            let segment_size = self.tcb.segment_size;
            self.tcb.cwnd = (self.tcb.cwnd / 2).max(segment_size);
            self.tcb.ssthresh = self.tcb.cwnd;
            self.tcb.cwnd_infl = self.tcb.cwnd;
            flags |= TcpFlags::CWR;
            self.ecn_cwr_seq = Some(seq);
            self.set_ecn_state(EcnState::CwrSent);
            if self.tcb.cong_state == CongState::Open {
                self.set_cong_state(CongState::Cwr);
            }
        }

        if self.close_on_empty && remaining == 0 {
            flags |= TcpFlags::FIN;
            match self.state {
                State::Established => self.set_state(State::FinWait1),
                State::CloseWait => self.set_state(State::LastAck),
                _ => {},
            }
        }

        let mut repr = self.header(flags, seq);
        repr.window_len = self.advertised_window(true);
        self.add_timestamp(&mut repr, io.now);
        if with_ack {
            if self.high_tx_ack < repr.ack_number {
                self.high_tx_ack = repr.ack_number;
            }
            self.add_sack(&mut repr);
        }

        if !self.timers.is_running(TimerKind::Retransmit) {
            let rto = self.rto;
            self.arm_retransmit(io, rto, None);
        }

        let ecn = if self.tcb.ecn_state != EcnState::Disabled && len > 0 {
            IpEcn::Ect0
        } else {
            IpEcn::NotEct
        };
        self.transmit(repr, segment.data, ecn, io);
        self.update_rtt_history(seq, len, is_retransmission, io.now);

        if self.tcb.cong_state == CongState::Recovery {
            self.recovery.update_bytes_sent(len as u32);
        }

        let end = seq + len;
        if end > self.tcb.high_tx_mark {
            let fresh = end - self.tcb.high_tx_mark;
            self.notify(Event::DataSent(fresh), io);
            self.tcb.high_tx_mark = end;
        }
        len
    }

    /// Send as much as the windows allow, returns the number of segments sent.
    fn send_pending_data(&mut self, with_ack: bool, io: &mut Io) -> u32 {
        if self.tx.size() == 0 || !self.bound {
            return 0;
        }

        let segment_size = self.tcb.segment_size;
        let mut sent = 0;
        let mut window = self.available_window();
        while window > 0 {
            if self.tcb.pacing && self.timers.is_running(TimerKind::Pacing) {
                break;
            }
            // Our FIN is out, nothing to add.
            if self.tcb.cong_state == CongState::Open && self.state == State::FinWait1 {
                break;
            }

            let rule3 = self.sack && self.tcb.cong_state == CongState::Recovery;
            let next = match self.tx.next_seg(rule3) {
                Some(next) => next,
                None => break,
            };

            let available = self.tx.size_from_sequence(next) as u32;
            if available < window {
                let room = self.tx.available();
                if room > 0 {
                    self.notify(Event::SendReady(room), io);
                }
            }

            // Silly window avoidance, RFC 1122 4.2.3.4.
            if window < segment_size && available > window {
                break;
            }
            // Nagle.
            if !self.config.no_delay && self.un_ack_data_count() > 0 && available < segment_size {
                break;
            }

            if self.bytes_in_flight() == 0 {
                self.congestion.cwnd_event(&mut self.tcb, CaEvent::TxStart);
            }

            let size = window.min(segment_size) as usize;
            self.tcb.next_tx_sequence = next;
            let len = self.send_data_packet(next, size, with_ack, io);
            if len == 0 {
                break;
            }
            self.tcb.next_tx_sequence += len;
            sent += 1;

            if self.tcb.pacing {
                break;
            }
            window = self.available_window();
        }

        if sent > 0 {
            net_trace!("{}: sent {} segments, next {}", io.key, sent, self.tcb.next_tx_sequence);
        }
        sent
    }

    fn arrives_closed(&mut self, repr: &TcpRepr, io: &mut Io) {
        if !repr.flags.rst() {
            self.send_rst(io);
        }
    }

    fn arrives_listen(&mut self, repr: &TcpRepr, local: IpEndpoint, peer: IpEndpoint, io: &mut Io) {
        let flags = repr.flags & !(TcpFlags::PSH | TcpFlags::URG | TcpFlags::CWR | TcpFlags::ECE);
        if flags != TcpFlags::SYN {
            return;
        }

        let accepted = match self.acceptor.as_mut() {
            Some(acceptor) => acceptor(peer),
            None => true,
        };
        if !accepted {
            net_info!("{}: refused connection request from {}", local, peer);
            return;
        }

        net_info!("{}: accepted connection request from {}", local, peer);
        // Only the fork consumes the SYN, the listener stays untouched.
        io.signals.fork = Some(ForkRequest {
            local,
            peer,
            syn: repr.clone(),
        });
    }

    fn arrives_syn_sent(&mut self, repr: &TcpRepr, payload: &[u8], io: &mut Io) {
        let flags = repr.flags & !(TcpFlags::PSH | TcpFlags::URG);

        if flags.is_empty() {
            self.set_state(State::Established);
            self.connected = true;
            self.timers.cancel(TimerKind::Retransmit);
            self.del_ack_count = self.config.del_ack_max_count;
            self.received_data(repr, payload, io);
            io.scheduler.schedule(io.now, io.key, Action::ConnectionSucceeded);
        } else if flags == TcpFlags::ACK {
            net_debug!("{}: ignoring ACK without SYN", io.key);
        } else if flags.syn() && !flags.ack() {
            // Simultaneous open.
            self.set_state(State::SynReceived);
            self.syn_count = self.config.syn_retries;
            // Re-armed for the SYN+ACK.
            self.timers.cancel(TimerKind::Retransmit);
            self.rx.set_next_rx_sequence(repr.seq_number + 1);
            let ecn_requested = flags.contains(TcpFlags::ECE | TcpFlags::CWR);
            if self.config.ecn_mode == EcnMode::ClassicEcn && ecn_requested {
                self.send_empty_packet(SYN_ACK_ECE, io);
                self.set_ecn_state(EcnState::Idle);
            } else {
                self.send_empty_packet(SYN_ACK, io);
                self.set_ecn_state(EcnState::Disabled);
            }
        } else if flags.syn() && flags.ack() && self.tcb.next_tx_sequence + 1 == repr.ack_number {
            self.set_state(State::Established);
            self.connected = true;
            self.timers.cancel(TimerKind::Retransmit);
            self.rx.set_next_rx_sequence(repr.seq_number + 1);
            self.tcb.next_tx_sequence += 1;
            self.tcb.high_tx_mark = self.tcb.next_tx_sequence;
            self.tx.set_head_sequence(self.tcb.next_tx_sequence);
            self.high_rx_ack_mark = repr.ack_number;

            let ecn_agreed = (flags & (TcpFlags::CWR | TcpFlags::ECE)) == TcpFlags::ECE;
            if self.config.ecn_mode == EcnMode::ClassicEcn && ecn_agreed {
                self.set_ecn_state(EcnState::Idle);
            } else {
                self.set_ecn_state(EcnState::Disabled);
            }

            self.send_empty_packet(TcpFlags::ACK, io);
            self.send_pending_data(self.connected, io);
            io.scheduler.schedule(io.now, io.key, Action::ConnectionSucceeded);
            // Acknowledge the first data without delay.
            self.del_ack_count = self.config.del_ack_max_count;
        } else {
            self.notify_close(Event::ConnectionFailed, io);
            if !flags.rst() {
                self.send_rst(io);
            }
            self.close_and_notify(io);
        }
    }

    /// Synchronize the send side once our SYN is acknowledged.
    fn handshake_complete(&mut self, io: &mut Io) {
        self.set_state(State::Established);
        self.connected = true;
        self.timers.cancel(TimerKind::Retransmit);
        self.tcb.next_tx_sequence += 1;
        self.tcb.high_tx_mark = self.tcb.next_tx_sequence;
        self.tx.set_head_sequence(self.tcb.next_tx_sequence);
        self.del_ack_count = self.config.del_ack_max_count;
        match self.listener {
            Some(listener) => {
                let peer = self.peer;
                self.notify(Event::NewConnection { listener, peer }, io);
            },
            // Simultaneous open.
            None => io.scheduler.schedule(io.now, io.key, Action::ConnectionSucceeded),
        }
    }

    fn arrives_syn_received(&mut self, repr: &TcpRepr, payload: &[u8], io: &mut Io) {
        let flags = repr.flags & !(TcpFlags::PSH | TcpFlags::URG | TcpFlags::CWR | TcpFlags::ECE);
        let acks_syn = self.tcb.next_tx_sequence + 1 == repr.ack_number;

        if flags.is_empty() || (flags == TcpFlags::ACK && acks_syn) {
            self.handshake_complete(io);
            if flags.ack() {
                self.received_ack(repr, payload, io);
            } else if !payload.is_empty() {
                self.received_data(repr, payload, io);
            }
            let room = self.tx.available();
            if room > 0 {
                self.notify(Event::SendReady(room), io);
            }
        } else if flags == TcpFlags::SYN {
            // Our SYN+ACK was probably lost.
            self.rx.set_next_rx_sequence(repr.seq_number + 1);
            let resend = match (self.config.ecn_mode, self.tcb.ecn_state) {
                (EcnMode::ClassicEcn, state) if state != EcnState::Disabled => SYN_ACK_ECE,
                _ => SYN_ACK,
            };
            self.send_empty_packet(resend, io);
        } else if flags == SYN_ACK && acks_syn && self.listener.is_none() {
            // Both SYNs crossed, RFC 793 figure 8.
            self.handshake_complete(io);
            self.send_empty_packet(TcpFlags::ACK, io);
        } else if flags == TcpFlags::FIN || flags == FIN_ACK {
            if flags == FIN_ACK && repr.seq_number == self.rx.next_rx_sequence() && acks_syn {
                self.handshake_complete(io);
                self.peer_close(repr, payload, io);
            }
        } else {
            self.abort(flags, io);
        }
    }

    fn arrives_established(&mut self, repr: &TcpRepr, payload: &[u8], io: &mut Io) {
        let flags = repr.flags & !(TcpFlags::PSH | TcpFlags::URG | TcpFlags::CWR | TcpFlags::ECE);

        if flags == TcpFlags::ACK {
            if repr.ack_number < self.tx.head_sequence() {
                net_debug!("{}: ignored ACK {} below head {}", io.key, repr.ack_number, self.tx.head_sequence());
                return;
            }
            if repr.ack_number > self.tcb.high_tx_mark {
                net_warn!("{}: ACK {} beyond anything sent", io.key, repr.ack_number);
                self.send_ack(io);
                return;
            }
            self.received_ack(repr, payload, io);
        } else if flags == TcpFlags::SYN || flags == SYN_ACK {
            net_debug!("{}: ignoring duplicate SYN", io.key);
        } else if flags == TcpFlags::FIN || flags == FIN_ACK {
            let ack = repr.ack_number;
            if flags.ack() && self.tx.head_sequence() <= ack && ack <= self.tcb.high_tx_mark {
                // The acknowledgement is consumed here, the FIN and its data by the close.
                self.received_ack(repr, &[], io);
            }
            self.peer_close(repr, payload, io);
        } else if flags.is_empty() {
            self.received_data(repr, payload, io);
            if self.rx.finished() {
                self.peer_close(repr, payload, io);
            }
        } else {
            if !flags.rst() {
                net_warn!("{}: illegal flags {} in {}", io.key, flags, self.state);
            }
            self.abort(flags, io);
        }
    }

    fn arrives_wait(&mut self, repr: &TcpRepr, payload: &[u8], io: &mut Io) {
        let flags = repr.flags & !(TcpFlags::PSH | TcpFlags::URG | TcpFlags::CWR | TcpFlags::ECE);

        if !payload.is_empty() && !flags.intersects(TcpFlags::ACK | TcpFlags::FIN | TcpFlags::RST | TcpFlags::SYN) {
            self.received_data(repr, payload, io);
        } else if flags == TcpFlags::ACK {
            self.received_ack(repr, payload, io);
            let fin_acked = repr.ack_number == self.tcb.high_tx_mark + 1;
            if self.state == State::FinWait1 && self.tx.size() == 0 && fin_acked {
                self.timers.cancel(TimerKind::Retransmit);
                self.set_state(State::FinWait2);
            }
        } else if flags == TcpFlags::FIN || flags == FIN_ACK {
            self.rx.set_fin_sequence(repr.seq_number + payload.len());
            if flags.ack() {
                self.received_ack(repr, payload, io);
            } else if !payload.is_empty() {
                self.received_data(repr, payload, io);
            }
        } else if flags == TcpFlags::SYN || flags == SYN_ACK {
            return;
        } else {
            self.abort(flags, io);
            return;
        }

        let closing = self.state == State::FinWait1 || self.state == State::FinWait2;
        if closing && self.rx.finished() {
            if self.state == State::FinWait1 {
                self.set_state(State::Closing);
                let fin_acked = repr.ack_number == self.tcb.high_tx_mark + 1;
                if self.tx.size() == 0 && fin_acked {
                    self.time_wait(io);
                }
            } else {
                self.time_wait(io);
            }
            self.send_empty_packet(TcpFlags::ACK, io);
            if !self.shutdown_recv {
                self.notify(Event::DataReceived, io);
            }
        }
    }

    fn arrives_closing(&mut self, repr: &TcpRepr, io: &mut Io) {
        let flags = repr.flags & !(TcpFlags::PSH | TcpFlags::URG);
        if flags == TcpFlags::ACK {
            if repr.seq_number == self.rx.next_rx_sequence() {
                self.time_wait(io);
            }
            return;
        }

        // Both sides sent their FIN, anything but an ACK ends it.
        if flags == TcpFlags::FIN || flags == FIN_ACK {
            self.send_empty_packet(TcpFlags::ACK, io);
            self.close_and_notify(io);
        } else {
            self.abort(flags, io);
        }
    }

    fn arrives_last_ack(&mut self, repr: &TcpRepr, payload: &[u8], io: &mut Io) {
        let flags = repr.flags & !(TcpFlags::PSH | TcpFlags::URG);
        if flags.is_empty() {
            self.received_data(repr, payload, io);
        } else if flags == TcpFlags::ACK {
            let fin_acked = repr.ack_number == self.tcb.high_tx_mark + 1;
            if repr.seq_number == self.rx.next_rx_sequence() && fin_acked {
                self.close_and_notify(io);
            } else if repr.ack_number >= self.tx.head_sequence() && repr.ack_number <= self.tcb.high_tx_mark {
                // Still draining data sent before our FIN.
                self.received_ack(repr, payload, io);
            }
        } else if flags == TcpFlags::FIN {
            // The peer did not see our FIN+ACK.
            self.send_empty_packet(FIN_ACK, io);
        } else if flags == FIN_ACK {
            self.close_and_notify(io);
        } else {
            self.abort(flags, io);
        }
    }

    /// The peer sent a FIN, or data that completed the stream up to an earlier FIN.
    fn peer_close(&mut self, repr: &TcpRepr, payload: &[u8], io: &mut Io) {
        let seq = repr.seq_number;
        if seq < self.rx.next_rx_sequence() || seq > self.rx.max_rx_sequence() {
            return;
        }

        self.rx.set_fin_sequence(seq + payload.len());
        if !payload.is_empty() {
            self.received_data(repr, payload, io);
        }

        if !self.rx.finished() {
            // Data before the FIN is missing.
            return;
        }

        if self.state == State::FinWait1 {
            self.set_state(State::Closing);
            return;
        }

        self.do_peer_close(io);
    }

    fn do_peer_close(&mut self, io: &mut Io) {
        self.set_state(State::CloseWait);

        if !self.close_notified {
            // The application either shuts down its sending side or closes after its last send.
            self.notify_close(Event::NormalClose, io);
        }

        if self.shutdown_send {
            self.close(io);
        } else {
            self.send_empty_packet(TcpFlags::ACK, io);
        }

        if self.state == State::LastAck {
            let spread = self.config.clock_granularity.max(self.rtt.variation() * 4);
            let last_rto = self.rtt.estimate() + spread;
            self.arm(io, TimerKind::LastAck, last_rto);
        }
    }

    /// Put data into the receive buffer and acknowledge it.
    fn received_data(&mut self, repr: &TcpRepr, payload: &[u8], io: &mut Io) {
        let expected = self.rx.next_rx_sequence();
        if !self.rx.add(repr.seq_number, payload) {
            // Duplicate or no room.
            self.send_ack(io);
            return;
        }

        if expected < self.rx.next_rx_sequence() {
            if !self.shutdown_recv {
                self.notify(Event::DataReceived, io);
            }
            if self.close_notified {
                net_warn!("{}: data arrived after the close was notified", io.key);
            }
            if self.state == State::Established && self.rx.finished() && !repr.flags.fin() {
                // The segment filled the gap before an earlier FIN.
                self.do_peer_close(io);
                return;
            }
        }

        let out_of_order = self.rx.size() > self.rx.available();
        let skipped_ahead = self.rx.next_rx_sequence() > expected + payload.len();
        if out_of_order || skipped_ahead {
            // Duplicate acknowledgements and acknowledgements filling a hole are never delayed.
            self.congestion.cwnd_event(&mut self.tcb, CaEvent::NonDelayedAck);
            self.send_ack(io);
            return;
        }

        self.del_ack_count += 1;
        if self.del_ack_count >= self.config.del_ack_max_count {
            self.timers.cancel(TimerKind::DelayedAck);
            self.del_ack_count = 0;
            self.congestion.cwnd_event(&mut self.tcb, CaEvent::NonDelayedAck);
            self.send_ack(io);
        } else if !self.timers.is_running(TimerKind::DelayedAck) {
            let timeout = self.config.del_ack_timeout;
            self.arm(io, TimerKind::DelayedAck, timeout);
        }
    }

    /// Process the acknowledgement part of a segment, then its data, then send what is pending.
    fn received_ack(&mut self, repr: &TcpRepr, payload: &[u8], io: &mut Io) {
        let ack = repr.ack_number;
        let mut scoreboard_updated = false;
        if self.sack {
            if let Some(TcpOption::Sack(blocks)) = repr.option(TcpOptionKind::Sack) {
                scoreboard_updated = self.tx.update(blocks.blocks());
            }
        }

        let old_head = self.tx.head_sequence();
        if self.tcb.ecn_state != EcnState::Disabled && repr.flags.ece() {
            if self.ecn_echo_seq.map_or(true, |echo| echo < ack) {
                net_info!("{}: congestion echoed up to {}", io.key, ack);
                self.ecn_echo_seq = Some(ack);
                self.set_ecn_state(EcnState::EceReceived);
            }
        }

        self.tx.discard_up_to(ack);
        self.process_ack(ack, scoreboard_updated, old_head, io);

        if !payload.is_empty() {
            self.received_data(repr, payload, io);
        }

        self.send_pending_data(self.connected, io);

        if self.close_on_empty && self.tx.size() == 0 {
            self.fin_on_empty(io);
        }
    }

    fn process_ack(&mut self, ack: TcpSeqNumber, scoreboard_updated: bool, old_head: TcpSeqNumber, io: &mut Io) {
        self.tcb.last_acked_seq = ack;
        let segment_size = self.tcb.segment_size;
        let last_rtt = self.tcb.last_rtt;

        let is_dupack = if self.sack {
            scoreboard_updated
        } else {
            ack == old_head && ack < self.tcb.high_tx_mark
        };
        let old_dup_ack_count = self.dup_ack_count;
        if is_dupack {
            self.dup_ack(io);
        }

        if ack == old_head && ack == self.tcb.high_tx_mark {
            // Nothing outstanding, a window update or keep alive.
            return;
        } else if ack == old_head && ack > self.tcb.high_tx_mark {
            // Acknowledges our FIN.
            self.tcb.next_tx_sequence = ack;
            return;
        } else if ack == old_head {
            // One segment has left the network.
            self.congestion.pkts_acked(&mut self.tcb, 1, last_rtt);
            return;
        } else if ack < old_head {
            return;
        }

        let bytes_acked = (ack - old_head) as u32;
        let mut segs_acked = bytes_acked / segment_size;
        self.bytes_acked_not_processed += bytes_acked % segment_size;
        if self.bytes_acked_not_processed >= segment_size {
            segs_acked += 1;
            self.bytes_acked_not_processed -= segment_size;
        }

        if !is_dupack {
            self.dup_ack_count = 0;
        }

        let cong_state = self.tcb.cong_state;
        if cong_state == CongState::Recovery && ack < self.recover {
            // Partial acknowledgement, RFC 6582.
            if self.sack {
                self.tx.delete_retransmitted_flag_from_head();
            } else {
                self.tx.mark_head_as_lost();
            }
            self.do_retransmit(io);
            self.tcb.cwnd_infl = self.tcb.cwnd_infl.saturating_sub(bytes_acked);
            if segs_acked >= 1 {
                let sacked = self.tx.sacked() as u32;
                self.recovery.do_recovery(&mut self.tcb, bytes_acked, sacked);
            }
            self.congestion.pkts_acked(&mut self.tcb, 1, last_rtt);
            let reset_rto = self.first_partial_ack;
            self.new_ack(ack, reset_rto, io);
            self.first_partial_ack = false;
            return;
        }

        if cong_state == CongState::Loss && ack < self.recover {
            self.congestion.pkts_acked(&mut self.tcb, segs_acked, last_rtt);
            self.congestion.increase_window(&mut self.tcb, segs_acked);
            self.new_ack(ack, true, io);
            return;
        }

        let mut exited_recovery = false;
        match cong_state {
            CongState::Open => {
                self.congestion.pkts_acked(&mut self.tcb, segs_acked, last_rtt);
            },
            CongState::Disorder => {
                if segs_acked >= old_dup_ack_count {
                    let acked = segs_acked - old_dup_ack_count;
                    self.congestion.pkts_acked(&mut self.tcb, acked, last_rtt);
                }
                if !is_dupack {
                    self.set_cong_state(CongState::Open);
                }
            },
            CongState::Cwr => {
                self.congestion.pkts_acked(&mut self.tcb, segs_acked, last_rtt);
                if self.ecn_cwr_seq.map_or(true, |cwr| cwr < ack) {
                    self.congestion.cwnd_event(&mut self.tcb, CaEvent::CompleteCwr);
                    self.set_cong_state(CongState::Open);
                }
            },
            CongState::Recovery => {
                self.first_partial_ack = true;
                let segs = ack.saturating_sub(self.recover) as u32 / segment_size;
                self.congestion.pkts_acked(&mut self.tcb, segs, last_rtt);
                self.congestion.cwnd_event(&mut self.tcb, CaEvent::CompleteCwr);
                self.set_cong_state(CongState::Open);
                exited_recovery = true;
                self.dup_ack_count = 0;
            },
            CongState::Loss => {
                self.first_partial_ack = true;
                let segs = ack.saturating_sub(self.recover) as u32 / segment_size;
                self.congestion.pkts_acked(&mut self.tcb, segs, last_rtt);
                self.set_cong_state(CongState::Open);
            },
        }

        if exited_recovery {
            self.new_ack(ack, true, io);
            self.recovery.exit_recovery(&mut self.tcb);
        } else {
            self.congestion.increase_window(&mut self.tcb, segs_acked);
            self.tcb.cwnd_infl = self.tcb.cwnd;
            self.new_ack(ack, true, io);
        }
    }

    fn dup_ack(&mut self, io: &mut Io) {
        let cong_state = self.tcb.cong_state;
        if cong_state == CongState::Loss {
            return;
        }
        if cong_state != CongState::Recovery {
            self.dup_ack_count += 1;
        }
        if cong_state == CongState::Open {
            self.set_cong_state(CongState::Disorder);
        }

        match self.tcb.cong_state {
            CongState::Recovery => {
                if !self.sack {
                    self.tx.add_reno_sack();
                }
                let sacked = self.tx.sacked() as u32;
                self.recovery.do_recovery(&mut self.tcb, 0, sacked);
            },
            CongState::Disorder => {
                let probe = self.high_rx_ack_mark + self.tcb.segment_size as usize;
                if self.dup_ack_count == self.config.retx_threshold && self.high_rx_ack_mark >= self.recover {
                    self.enter_recovery(io);
                } else if self.tx.is_lost(probe) {
                    self.enter_recovery(io);
                } else if !self.sack && self.config.limited_transmit {
                    // RFC 3042, one new segment per duplicate acknowledgement.
                    self.tx.add_reno_sack();
                }
            },
            _ => {},
        }
    }

    fn enter_recovery(&mut self, io: &mut Io) {
        net_debug!("{}: fast retransmit after {} duplicate ACKs", io.key, self.dup_ack_count);
        if !self.sack {
            self.tx.add_reno_sack();
            self.tx.mark_head_as_lost();
        } else if !self.tx.is_lost(self.tx.head_sequence()) {
            self.tx.mark_head_as_lost();
        }

        self.recover = self.tcb.high_tx_mark;
        self.set_cong_state(CongState::Recovery);

        let in_flight = if self.sack {
            self.bytes_in_flight()
        } else {
            self.bytes_in_flight() + self.tcb.segment_size
        };
        self.tcb.ssthresh = self.congestion.ss_thresh(&self.tcb, in_flight);

        let un_acked = self.un_ack_data_count();
        let sacked = self.tx.sacked() as u32;
        let dup_ack_count = self.dup_ack_count;
        self.recovery.enter_recovery(&mut self.tcb, dup_ack_count, un_acked, sacked);

        self.do_retransmit(io);
    }

    /// Retransmit the first segment the scoreboard considers lost.
    fn do_retransmit(&mut self, io: &mut Io) {
        let seq = self.tx.next_seg(false).unwrap_or_else(|| self.tx.head_sequence());
        if self.tx.size_from_sequence(seq) == 0 {
            return;
        }
        let segment_size = self.tcb.segment_size as usize;
        let len = self.send_data_packet(seq, segment_size, true, io);
        if seq + len > self.tcb.next_tx_sequence {
            self.tcb.next_tx_sequence = seq + len;
        }
    }

    /// Bookkeeping for an acknowledgement that advanced the head.
    fn new_ack(&mut self, ack: TcpSeqNumber, reset_rto: bool, io: &mut Io) {
        self.data_retries = self.config.data_retries;

        if self.state != State::SynReceived && reset_rto {
            self.rto = self.rtt.rto(self.config.clock_granularity, self.config.min_rto);
            let rto = self.rto;
            self.arm_retransmit(io, rto, None);
        }

        let room = self.tx.available();
        if room > 0 {
            self.notify(Event::SendReady(room), io);
        }

        if ack > self.tcb.next_tx_sequence {
            self.tcb.next_tx_sequence = ack;
        }

        if self.tx.size() == 0 && self.state != State::FinWait1 && self.state != State::Closing {
            self.timers.cancel(TimerKind::Retransmit);
        }
    }

    fn retransmit_timeout(&mut self, io: &mut Io) {
        match self.state {
            State::Closed | State::TimeWait | State::Listen => return,
            State::SynSent => {
                if self.syn_count > 0 {
                    let flags = match self.config.ecn_mode {
                        EcnMode::ClassicEcn => SYN_ECN,
                        EcnMode::NoEcn => TcpFlags::SYN,
                    };
                    self.send_empty_packet(flags, io);
                    self.set_ecn_state(EcnState::Disabled);
                } else {
                    self.notify_close(Event::ConnectionFailed, io);
                    self.set_state(State::Closed);
                    self.deallocate(io);
                }
                return;
            },
            _ => {},
        }

        if self.data_retries == 0 {
            net_warn!("{}: retransmissions exhausted, giving up", io.key);
            self.notify_close(Event::ErrorClose, io);
            self.set_state(State::Closed);
            self.deallocate(io);
            return;
        }
        self.data_retries -= 1;

        if self.tx.size() == 0 {
            if let State::FinWait1 | State::Closing | State::LastAck = self.state {
                self.rto = (self.rto * 2).min(MAX_BACKOFF);
                self.send_empty_packet(TcpFlags::FIN, io);
            }
            return;
        }

        let in_flight_before = self.bytes_in_flight();
        let head_retransmitted = self.tx.is_head_retransmitted();
        net_debug!("{}: retransmission timeout, {} bytes in flight", io.key, in_flight_before);

        self.dup_ack_count = 0;
        if !self.sack {
            self.tx.reset_reno_sack();
        }
        self.tx.set_sent_list_lost(!self.sack);
        self.recover = self.tcb.high_tx_mark;
        self.rto = (self.rto * 2).min(MAX_BACKOFF);
        self.history.clear();

        if self.tcb.cong_state != CongState::Loss || !head_retransmitted {
            self.tcb.ssthresh = self.congestion.ss_thresh(&self.tcb, in_flight_before);
        }
        self.tcb.cwnd = self.tcb.segment_size;
        self.tcb.cwnd_infl = self.tcb.cwnd;
        self.congestion.cwnd_event(&mut self.tcb, CaEvent::Loss);
        self.set_cong_state(CongState::Loss);
        self.timers.cancel(TimerKind::Pacing);

        self.send_pending_data(self.connected, io);
    }

    fn persist_expired(&mut self, io: &mut Io) {
        self.persist_timeout = (self.persist_timeout * 2).min(MAX_BACKOFF);

        let seq = self.tcb.next_tx_sequence;
        let probe = self.tx.copy_from_sequence(1, seq);
        let mut repr = self.header(TcpFlags::NONE, seq);
        repr.window_len = self.advertised_window(true);
        self.add_timestamp(&mut repr, io.now);
        net_debug!("{}: zero window probe at {}", io.key, seq);
        self.transmit(repr, probe.data, IpEcn::NotEct, io);

        let timeout = self.persist_timeout;
        self.arm(io, TimerKind::Persist, timeout);
    }

    fn delayed_ack_expired(&mut self, io: &mut Io) {
        self.del_ack_count = 0;
        self.congestion.cwnd_event(&mut self.tcb, CaEvent::DelayedAck);
        self.send_ack(io);
    }

    fn last_ack_expired(&mut self, io: &mut Io) {
        if self.state == State::LastAck {
            net_debug!("{}: no ACK for our FIN, closing", io.key);
            self.close_and_notify(io);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("tcb", &self.tcb)
            .field("congestion", &self.congestion.name())
            .field("recovery", &self.recovery.name())
            .field("rto", &self.rto)
            .field("timers", &self.timers)
            .finish()
    }
}
