//! Tcp layer tests.
//!
//! Two endpoints are wired back to back by a small harness that moves the emitted segments from
//! one to the other and advances logical time to the next timer of either side. Segments can be
//! dropped or picked apart on the way, which is how losses, reordering and corruption are tested.
//! All connections start at sequence number zero unless a test says otherwise, so the expected
//! numbers can be written down directly.
use crate::time::{Duration, Expiration, Instant};
use crate::wire::{IpAddress, IpEcn, IpEndpoint, TcpChecksum, TcpFlags, TcpRepr, TcpSeqNumber};

use super::{
    CongState,
    Config,
    Endpoint,
    Event,
    IsnGenerator,
    IsnMode,
    RxStatus,
    SlotKey,
    State,
    TimerKind,
    Transmit,
    MAX_BACKOFF,
};

const A: IpAddress = IpAddress::v4(10, 0, 0, 1);
const B: IpAddress = IpAddress::v4(10, 0, 0, 2);
const PORT: u16 = 80;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> Config {
    Config::default().with_isn(IsnMode::Zero)
}

fn seq(n: i32) -> TcpSeqNumber {
    TcpSeqNumber(n)
}

fn server() -> IpEndpoint {
    IpEndpoint::new(B, PORT)
}

fn parse(transmit: &Transmit) -> (TcpRepr, Vec<u8>) {
    let segment = TcpRepr::parse(&transmit.bytes, TcpChecksum::Ignored)
        .expect("endpoints emit well formed segments");
    (segment.repr, segment.payload.to_vec())
}

fn with_payload(out: &[Transmit]) -> Vec<(TcpRepr, Vec<u8>)> {
    out.iter()
        .map(parse)
        .filter(|(_, payload)| !payload.is_empty())
        .collect()
}

/// Build a segment by hand, with a valid checksum.
fn craft(from: IpEndpoint, to: IpEndpoint, flags: TcpFlags, seq: TcpSeqNumber, ack: TcpSeqNumber, payload: &[u8])
    -> Transmit
{
    let mut repr = TcpRepr::new(from.port, to.port);
    repr.flags = flags;
    repr.seq_number = seq;
    repr.ack_number = ack;
    repr.window_len = 4096;
    let checksum = TcpChecksum::Manual { src_addr: from.addr, dst_addr: to.addr };
    Transmit {
        src: from,
        dst: to,
        ecn: IpEcn::NotEct,
        bytes: repr.serialize(payload, checksum),
    }
}

/// Which segments survive the network, given whether they were sent by `a`.
type Filter = Box<dyn FnMut(bool, &Transmit) -> bool>;

fn drop_all() -> Filter {
    Box::new(|_: bool, _: &Transmit| false)
}

/// Two endpoints and the wire between them.
struct Net {
    a: Endpoint,
    b: Endpoint,
    now: Instant,
    /// Everything `a` emitted, including dropped segments.
    a_sent: Vec<Transmit>,
    /// Everything `b` emitted, including dropped segments.
    b_sent: Vec<Transmit>,
    filter: Option<Filter>,
}

impl Net {
    fn new() -> Self {
        init_logger();
        let mut a = Endpoint::new(IsnGenerator::from_secret_key_bytes([0xa; 16]));
        a.add_address(A);
        let mut b = Endpoint::new(IsnGenerator::from_secret_key_bytes([0xb; 16]));
        b.add_address(B);
        Net {
            a,
            b,
            now: Instant::from_millis(0),
            a_sent: Vec::new(),
            b_sent: Vec::new(),
            filter: None,
        }
    }

    fn to_a(&mut self, transmit: &Transmit) -> RxStatus {
        self.a.receive(self.now, transmit.src.addr, transmit.dst.addr, &transmit.bytes, transmit.ecn)
    }

    fn to_b(&mut self, transmit: &Transmit) -> RxStatus {
        self.b.receive(self.now, transmit.src.addr, transmit.dst.addr, &transmit.bytes, transmit.ecn)
    }

    fn passes(&mut self, from_a: bool, transmit: &Transmit) -> bool {
        match self.filter.as_mut() {
            Some(filter) => filter(from_a, transmit),
            None => true,
        }
    }

    /// Fire what is due and move segments until both sides are quiet.
    fn exchange(&mut self) {
        loop {
            self.a.advance(self.now);
            self.b.advance(self.now);
            let from_a = self.a.transmit();
            let from_b = self.b.transmit();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }

            for transmit in &from_a {
                if self.passes(true, transmit) {
                    self.to_b(transmit);
                }
            }
            for transmit in &from_b {
                if self.passes(false, transmit) {
                    self.to_a(transmit);
                }
            }
            self.a_sent.extend(from_a);
            self.b_sent.extend(from_b);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let a: Option<Instant> = self.a.poll_at().into();
        let b: Option<Instant> = self.b.poll_at().into();
        match (a, b) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run the network, timers included, up to `deadline`.
    fn run_until(&mut self, deadline: Instant) {
        self.exchange();
        while let Some(at) = self.next_deadline().filter(|at| *at <= deadline) {
            self.now = self.now.max(at);
            self.exchange();
        }
        self.now = self.now.max(deadline);
        self.exchange();
    }

    fn run_for(&mut self, duration: Duration) {
        let deadline = self.now + duration;
        self.run_until(deadline);
    }
}

/// A client on `a`, a listener and its accepted connection on `b`.
struct Pair {
    net: Net,
    client: SlotKey,
    listener: SlotKey,
    child: SlotKey,
}

fn listener(net: &mut Net, config: Config) -> SlotKey {
    let listener = net.b.open(config).unwrap();
    net.b.bind_to(listener, server()).unwrap();
    net.b.listen(listener).unwrap();
    listener
}

fn accepted(events: &[(SlotKey, Event)], peer: IpEndpoint) -> Option<SlotKey> {
    events.iter().find_map(|&(key, event)| match event {
        Event::NewConnection { peer: from, .. } if from == peer => Some(key),
        _ => None,
    })
}

fn established_with(client_config: Config, server_config: Config) -> Pair {
    let mut net = Net::new();
    let listener = listener(&mut net, server_config);
    let client = net.a.open(client_config).unwrap();
    net.a.connect(client, server()).unwrap();
    net.exchange();

    let peer = net.a.local_endpoint(client).unwrap();
    let events = net.b.events();
    let child = accepted(&events, peer).expect("the listener accepts");
    assert!(net.a.events().contains(&(client, Event::ConnectionSucceeded)));
    net.a_sent.clear();
    net.b_sent.clear();
    Pair { net, client, listener, child }
}

fn established(config: Config) -> Pair {
    established_with(config.clone(), config)
}

#[test]
fn handshake() {
    let mut net = Net::new();
    let listener = listener(&mut net, Config::default());
    let client = net.a.open(Config::default()).unwrap();
    net.a.connect(client, server()).unwrap();
    assert_eq!(net.a.state(client), Ok(State::SynSent));
    net.exchange();

    let (syn, _) = parse(&net.a_sent[0]);
    let (syn_ack, _) = parse(&net.b_sent[0]);
    assert_eq!(syn.flags, TcpFlags::SYN);
    assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(syn_ack.ack_number, syn.seq_number + 1);
    let (ack, _) = parse(&net.a_sent[1]);
    assert_eq!(ack.flags, TcpFlags::ACK);
    assert_eq!(ack.ack_number, syn_ack.seq_number + 1);

    let peer = net.a.local_endpoint(client).unwrap();
    let child = accepted(&net.b.events(), peer).expect("the listener accepts");
    assert_eq!(net.a.state(client), Ok(State::Established));
    assert_eq!(net.b.state(child), Ok(State::Established));
    assert_eq!(net.b.state(listener), Ok(State::Listen));

    let client_cb = net.a.control_block(client).unwrap();
    let child_cb = net.b.control_block(child).unwrap();
    assert_eq!(client_cb.next_tx_sequence, syn.seq_number + 1);
    assert_eq!(child_cb.next_tx_sequence, syn_ack.seq_number + 1);
    assert_eq!(net.a.peer_endpoint(client), Ok(server()));
    assert_eq!(net.b.peer_endpoint(child), Ok(peer));
}

#[test]
fn two_segments() {
    let config = config().with_segment_size(500).with_initial_cwnd(2);
    let Pair { mut net, client, child, .. } = established(config);

    assert_eq!(net.a.send(client, &[7; 1000]), Ok(1000));
    net.a.advance(net.now);
    let out = net.a.transmit();
    let data = with_payload(&out);
    assert_eq!(data.len(), 2);
    assert_eq!(data[0].0.seq_number, seq(1));
    assert_eq!(data[0].1.len(), 500);
    assert_eq!(data[1].0.seq_number, seq(501));
    assert_eq!(data[1].1.len(), 500);

    for transmit in &out {
        assert_eq!(net.to_b(transmit), RxStatus::Ok);
    }
    net.run_for(Duration::from_secs(1));

    let connection = net.a.connection(client).unwrap();
    assert_eq!(connection.head_sequence(), seq(1001));
    assert_eq!(net.a.tx_available(client), Ok(131_072));
    assert_eq!(connection.timer(TimerKind::Retransmit), Expiration::Never);
    assert_eq!(net.b.recv(child, 2000), Ok(vec![7; 1000]));
}

#[test]
fn fast_retransmit() {
    let config = config()
        .with_segment_size(500)
        .with_initial_cwnd(10)
        .with_options(true, false, true);
    let Pair { mut net, client, .. } = established(config);

    net.a.send(client, &[1; 5000]).unwrap();
    net.a.advance(net.now);
    let out = net.a.transmit();
    assert_eq!(with_payload(&out).len(), 10);

    // The first segment is lost, the next three each cause a duplicate acknowledgement.
    let mut states = Vec::new();
    for transmit in &out[1..4] {
        net.to_b(transmit);
        let acks = net.b.transmit();
        assert_eq!(acks.len(), 1);
        assert_eq!(parse(&acks[0]).0.ack_number, seq(1));
        net.to_a(&acks[0]);
        states.push(net.a.control_block(client).unwrap().cong_state);
    }
    assert_eq!(states, [CongState::Disorder, CongState::Disorder, CongState::Recovery]);

    let segment_size = 500;
    // Six segments in the network plus the one the last duplicate reported as gone.
    let in_flight = 6*segment_size + segment_size;
    let cb = net.a.control_block(client).unwrap();
    assert_eq!(cb.ssthresh, (2*segment_size).max(in_flight / 2));
    assert_eq!(cb.cwnd, cb.ssthresh);
    assert_eq!(net.a.connection(client).unwrap().dup_ack_count(), 3);

    let retransmitted = with_payload(&net.a.transmit());
    assert_eq!(retransmitted.len(), 1);
    assert_eq!(retransmitted[0].0.seq_number, seq(1));
    assert_eq!(retransmitted[0].1.len(), 500);
}

#[test]
fn sack_recovery_completes() {
    let config = config().with_segment_size(500).with_initial_cwnd(10);
    let Pair { mut net, client, child, .. } = established(config);

    let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
    net.a.send(client, &data).unwrap();
    let mut dropped = false;
    net.filter = Some(Box::new(move |from_a: bool, transmit: &Transmit| {
        if !from_a || dropped || parse(transmit).1.is_empty() {
            return true;
        }
        dropped = true;
        false
    }));
    net.run_for(Duration::from_secs(5));

    assert_eq!(net.b.recv(child, 10_000), Ok(data));
    let cb = net.a.control_block(client).unwrap();
    assert_eq!(cb.cong_state, CongState::Open);
    assert!(cb.cwnd >= cb.segment_size);
    assert_eq!(net.a.connection(client).unwrap().head_sequence(), seq(5001));
}

#[test]
fn retransmission_timeout() {
    let config = config().with_segment_size(500).with_retries(6, 10);
    let Pair { mut net, client, .. } = established(config);

    net.a.send(client, &[3; 500]).unwrap();
    net.a.advance(net.now);
    assert_eq!(with_payload(&net.a.transmit()).len(), 1);

    let rto = net.a.connection(client).unwrap().rto();
    let at = match net.a.connection(client).unwrap().timer(TimerKind::Retransmit) {
        Expiration::When(at) => at,
        Expiration::Never => panic!("unacknowledged data without timer"),
    };
    net.a.advance(at);

    let resent = with_payload(&net.a.transmit());
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].0.seq_number, seq(1));

    let connection = net.a.connection(client).unwrap();
    let cb = connection.control_block();
    assert_eq!(cb.cwnd, 500);
    assert_eq!(cb.ssthresh, 1000);
    assert_eq!(cb.cong_state, CongState::Loss);
    assert_eq!(connection.rto(), rto*2);
    assert_eq!(connection.timer(TimerKind::Retransmit), Expiration::When(at + rto*2));

    // Backing off further saturates.
    for _ in 0..6 {
        let at: Option<Instant> = net.a.connection(client).unwrap().timer(TimerKind::Retransmit).into();
        net.a.advance(at.expect("still retransmitting"));
        let _ = net.a.transmit();
    }
    let connection = net.a.connection(client).unwrap();
    assert_eq!(connection.rto(), MAX_BACKOFF);
    assert_eq!(connection.control_block().cwnd, 500);
}

#[test]
fn data_retries_exhausted() {
    let config = config().with_retries(6, 2);
    let Pair { mut net, client, .. } = established(config);
    let _ = net.b.events();

    net.a.send(client, b"lost in transit").unwrap();
    net.filter = Some(drop_all());
    net.run_for(Duration::from_secs(120));

    // The first send and one retransmission per retry.
    assert_eq!(with_payload(&net.a_sent).len(), 3);
    assert_eq!(net.a.state(client), Ok(State::Closed));
    assert!(net.a.events().contains(&(client, Event::ErrorClose)));
    assert!(net.a.connection(client).map_or(false, |c| c.timer(TimerKind::Retransmit) == Expiration::Never));
}

#[test]
fn active_close() {
    let Pair { mut net, client, child, .. } = established(config());
    let _ = net.b.events();

    net.a.close(client).unwrap();
    assert_eq!(net.a.state(client), Ok(State::FinWait1));
    let out = net.a.transmit();
    assert_eq!(out.len(), 1);
    let (fin, _) = parse(&out[0]);
    assert!(fin.flags.fin());
    assert_eq!(fin.seq_number, seq(1));

    net.to_b(&out[0]);
    assert_eq!(net.b.state(child), Ok(State::CloseWait));
    assert!(net.b.events().contains(&(child, Event::NormalClose)));

    let acks = net.b.transmit();
    assert_eq!(acks.len(), 1);
    let (ack, _) = parse(&acks[0]);
    assert_eq!(ack.ack_number, seq(2));
    net.to_a(&acks[0]);
    assert_eq!(net.a.state(client), Ok(State::FinWait2));
    let connection = net.a.connection(client).unwrap();
    assert_eq!(connection.timer(TimerKind::Retransmit), Expiration::Never);

    // The FIN occupies one sequence number beyond the data.
    let cb = connection.control_block();
    assert_eq!(cb.high_tx_mark, seq(1));
    assert_eq!(cb.next_tx_sequence, seq(2));
    assert_eq!(connection.head_sequence(), seq(1));
}

#[test]
fn time_wait_expires() {
    let Pair { mut net, client, child, .. } = established(config());

    net.a.close(client).unwrap();
    net.exchange();
    net.b.close(child).unwrap();
    net.exchange();
    assert_eq!(net.b.state(child), Ok(State::Closed));
    assert_eq!(net.a.state(client), Ok(State::TimeWait));
    assert!(net.a.events().contains(&(client, Event::NormalClose)));

    let linger = config().max_segment_lifetime * 2;
    let expiry = net.now + linger;
    let timer = net.a.connection(client).unwrap().timer(TimerKind::TimeWait);
    assert_eq!(timer, Expiration::When(expiry));

    net.run_until(expiry - Duration::from_millis(1));
    assert_eq!(net.a.state(client), Ok(State::TimeWait));
    net.run_until(expiry);
    assert_eq!(net.a.state(client), Ok(State::Closed));

    // The four tuple is free again, a late segment finds nobody.
    let local = net.a.local_endpoint(client).unwrap();
    let late = craft(server(), local, TcpFlags::ACK, seq(2), seq(2), &[]);
    assert_eq!(net.to_a(&late), RxStatus::Reset);
}

#[test]
fn passive_close() {
    let Pair { mut net, client, child, .. } = established(config());
    let _ = net.a.events();

    net.b.close(child).unwrap();
    net.exchange();
    assert_eq!(net.a.state(client), Ok(State::CloseWait));
    assert_eq!(net.b.state(child), Ok(State::FinWait2));
    assert!(net.a.events().contains(&(client, Event::NormalClose)));

    net.a.close(client).unwrap();
    assert_eq!(net.a.state(client), Ok(State::LastAck));
    net.exchange();
    assert_eq!(net.a.state(client), Ok(State::Closed));
    assert_eq!(net.b.state(child), Ok(State::TimeWait));
}

#[test]
fn simultaneous_close() {
    let Pair { mut net, client, child, .. } = established(config());

    net.a.close(client).unwrap();
    net.b.close(child).unwrap();
    net.exchange();
    assert_eq!(net.a.state(client), Ok(State::TimeWait));
    assert_eq!(net.b.state(child), Ok(State::TimeWait));
}

#[test]
fn deferred_close_sends_data_first() {
    let config = config().with_segment_size(500);
    let Pair { mut net, client, child, .. } = established(config);

    net.a.send(client, &[9; 800]).unwrap();
    net.a.close(client).unwrap();
    net.run_for(Duration::from_secs(2));

    let fins = net.a_sent.iter().map(parse).filter(|(repr, _)| repr.flags.fin()).count();
    assert_eq!(fins, 1);
    assert_eq!(net.b.recv(child, 1000), Ok(vec![9; 800]));
    assert_eq!(net.a.state(client), Ok(State::FinWait2));
    assert_eq!(net.b.state(child), Ok(State::CloseWait));
}

#[test]
fn old_ack_changes_nothing() {
    let config = config().with_segment_size(500).with_initial_cwnd(2);
    let Pair { mut net, client, .. } = established(config);

    net.a.send(client, &[5; 1000]).unwrap();
    net.run_for(Duration::from_secs(1));
    let head = net.a.connection(client).unwrap().head_sequence();
    assert_eq!(head, seq(1001));

    let old = net.b_sent.iter()
        .find(|transmit| parse(transmit).0.ack_number == seq(501))
        .cloned()
        .expect("the first segment was acknowledged alone");

    let before = net.a.control_block(client).unwrap().clone();
    let _ = net.a.events();
    assert_eq!(net.to_a(&old), RxStatus::Ok);

    let connection = net.a.connection(client).unwrap();
    assert_eq!(connection.control_block(), &before);
    assert_eq!(connection.head_sequence(), head);
    assert_eq!(connection.dup_ack_count(), 0);
    assert!(net.a.transmit().is_empty());
    assert!(net.a.events().is_empty());
}

#[test]
fn delayed_ack() {
    let Pair { mut net, client, child, .. } = established(config());

    // The first data is acknowledged right away.
    net.a.send(client, &[1; 100]).unwrap();
    net.a.advance(net.now);
    for transmit in net.a.transmit() {
        net.to_b(&transmit);
    }
    assert_eq!(net.b.transmit().len(), 1);

    net.a.send(client, &[2; 100]).unwrap();
    net.a.advance(net.now);
    for transmit in net.a.transmit() {
        net.to_b(&transmit);
    }
    assert!(net.b.transmit().is_empty());

    let delay = config().del_ack_timeout;
    let timer = net.b.connection(child).unwrap().timer(TimerKind::DelayedAck);
    assert_eq!(timer, Expiration::When(net.now + delay));

    net.b.advance(net.now + delay);
    let acks = net.b.transmit();
    assert_eq!(acks.len(), 1);
    assert_eq!(parse(&acks[0]).0.ack_number, seq(201));
}

#[test]
fn zero_window_probe() {
    let client_config = config().with_segment_size(500).with_initial_cwnd(4);
    let server_config = client_config.clone().with_buffer_sizes(131_072, 1000);
    let Pair { mut net, client, child, .. } = established_with(client_config, server_config);

    let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    net.a.send(client, &data).unwrap();
    net.run_for(Duration::from_secs(1));

    let connection = net.a.connection(client).unwrap();
    assert_eq!(connection.send_window(), 0);
    let probe_at: Option<Instant> = connection.timer(TimerKind::Persist).into();
    let probe_at = probe_at.expect("probing the closed window");

    net.a_sent.clear();
    net.run_until(probe_at);
    let probes = with_payload(&net.a_sent);
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].0.seq_number, seq(1001));
    assert_eq!(probes[0].1.len(), 1);

    // Reading opens the window, the rest follows.
    assert_eq!(net.b.recv(child, 1000), Ok(data[..1000].to_vec()));
    net.run_for(Duration::from_secs(10));
    assert_eq!(net.b.recv(child, 1000), Ok(data[1000..].to_vec()));
    let connection = net.a.connection(client).unwrap();
    assert_eq!(connection.head_sequence(), seq(1501));
    assert_eq!(connection.timer(TimerKind::Persist), Expiration::Never);
}

#[test]
fn syn_retries_exhausted() {
    let mut net = Net::new();
    let client = net.a.open(config().with_retries(2, 6)).unwrap();
    net.a.connect(client, server()).unwrap();
    net.filter = Some(drop_all());
    net.run_for(Duration::from_secs(60));

    let syns: Vec<_> = net.a_sent.iter().map(parse).map(|(repr, _)| repr).collect();
    // Two attempts in total, the second one after 3 seconds, giving up 6 seconds later.
    assert_eq!(syns.len(), 2);
    assert!(syns.iter().all(|repr| repr.flags == TcpFlags::SYN && repr.seq_number == seq(0)));
    assert_eq!(net.a.state(client), Ok(State::Closed));
    assert_eq!(net.a.events(), vec![(client, Event::ConnectionFailed)]);
}

#[test]
fn refused_connection() {
    let mut net = Net::new();
    let client = net.a.open(config()).unwrap();
    net.a.connect(client, server()).unwrap();
    net.exchange();

    let (rst, _) = parse(&net.b_sent[0]);
    assert_eq!(rst.flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(rst.ack_number, seq(1));
    assert_eq!(net.a.state(client), Ok(State::Closed));
    assert_eq!(net.a.events(), vec![(client, Event::ConnectionFailed)]);
}

#[test]
fn no_endpoint() {
    let mut net = Net::new();
    let peer = IpEndpoint::new(A, 4000);

    let syn = craft(peer, server(), TcpFlags::SYN, seq(100), seq(0), &[]);
    assert_eq!(net.to_b(&syn), RxStatus::Reset);
    let (reply, _) = parse(&net.b.transmit()[0]);
    assert_eq!(reply.flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(reply.seq_number, seq(0));
    assert_eq!(reply.ack_number, seq(101));

    let data = craft(peer, server(), TcpFlags::ACK, seq(100), seq(555), b"hello");
    assert_eq!(net.to_b(&data), RxStatus::Reset);
    let (reply, _) = parse(&net.b.transmit()[0]);
    assert_eq!(reply.flags, TcpFlags::RST);
    assert_eq!(reply.seq_number, seq(555));

    let rst = craft(peer, server(), TcpFlags::RST, seq(100), seq(0), &[]);
    assert_eq!(net.to_b(&rst), RxStatus::NoEndpoint);
    assert!(net.b.transmit().is_empty());
}

#[test]
fn checksum_failure_changes_nothing() {
    let Pair { mut net, client, child, .. } = established(config());
    let _ = net.b.events();

    net.a.send(client, b"checksummed").unwrap();
    net.a.advance(net.now);
    let out = net.a.transmit();
    assert_eq!(out.len(), 1);

    let mut corrupt = out[0].clone();
    if let Some(last) = corrupt.bytes.last_mut() {
        *last ^= 0x20;
    }
    let before = net.b.control_block(child).unwrap().clone();
    assert_eq!(net.to_b(&corrupt), RxStatus::ChecksumFailed);
    assert_eq!(net.b.control_block(child).unwrap(), &before);
    assert_eq!(net.b.rx_available(child), Ok(0));
    assert!(net.b.transmit().is_empty());
    assert!(net.b.events().is_empty());

    assert_eq!(net.to_b(&out[0]), RxStatus::Ok);
    assert_eq!(net.b.recv(child, 100), Ok(b"checksummed".to_vec()));
}

#[test]
fn truncated_segment() {
    let mut net = Net::new();
    assert_eq!(net.b.receive(net.now, A, B, &[0; 7], IpEcn::NotEct), RxStatus::Truncated);
    assert!(net.b.transmit().is_empty());
}

#[test]
fn forks_are_independent() {
    let config = config().with_segment_size(500).with_initial_cwnd(4);
    let mut net = Net::new();
    let listener = listener(&mut net, config.clone());
    let first = net.a.open(config.clone()).unwrap();
    let second = net.a.open(config.clone()).unwrap();
    net.a.connect(first, server()).unwrap();
    net.a.connect(second, server()).unwrap();
    net.exchange();

    let events = net.b.events();
    let first_peer = net.a.local_endpoint(first).unwrap();
    let second_peer = net.a.local_endpoint(second).unwrap();
    assert_ne!(first_peer, second_peer);
    let one = accepted(&events, first_peer).expect("first accepted");
    let two = accepted(&events, second_peer).expect("second accepted");
    assert_ne!(one, two);
    assert_eq!(net.b.len(), 3);

    // Only the first connection loses its data.
    net.b.send(one, &[4; 500]).unwrap();
    net.b.advance(net.now);
    assert_eq!(with_payload(&net.b.transmit()).len(), 1);
    let at: Option<Instant> = net.b.connection(one).unwrap().timer(TimerKind::Retransmit).into();
    net.b.advance(at.expect("retransmission armed"));

    let lossy = net.b.control_block(one).unwrap();
    assert_eq!(lossy.cong_state, CongState::Loss);
    assert_eq!(lossy.cwnd, 500);

    let intact = net.b.control_block(two).unwrap();
    assert_eq!(intact.cong_state, CongState::Open);
    assert_eq!(intact.cwnd, 4*500);
    assert_eq!(net.b.connection(two).unwrap().timer(TimerKind::Retransmit), Expiration::Never);

    let parent = net.b.control_block(listener).unwrap();
    assert_eq!(parent.cong_state, CongState::Open);
    assert_eq!(net.b.state(listener), Ok(State::Listen));
}

#[test]
fn acceptor_refuses() {
    let mut net = Net::new();
    let listener = listener(&mut net, config());
    net.b.set_acceptor(listener, Some(Box::new(|peer: IpEndpoint| peer.port == 1))).unwrap();

    let client = net.a.open(config()).unwrap();
    net.a.connect(client, server()).unwrap();
    net.exchange();
    assert!(net.b_sent.is_empty());
    assert_eq!(net.b.len(), 1);
    assert_eq!(net.a.state(client), Ok(State::SynSent));
}

#[test]
fn simultaneous_open() {
    let mut net = Net::new();
    let left = net.a.open(config()).unwrap();
    let right = net.b.open(config()).unwrap();
    net.a.bind_to(left, IpEndpoint::new(A, 1000)).unwrap();
    net.b.bind_to(right, IpEndpoint::new(B, 2000)).unwrap();
    net.a.connect(left, IpEndpoint::new(B, 2000)).unwrap();
    net.b.connect(right, IpEndpoint::new(A, 1000)).unwrap();
    net.exchange();

    assert_eq!(net.a.state(left), Ok(State::Established));
    assert_eq!(net.b.state(right), Ok(State::Established));
    assert!(net.a.events().contains(&(left, Event::ConnectionSucceeded)));
    assert!(net.b.events().contains(&(right, Event::ConnectionSucceeded)));
}

#[test]
fn stale_timers_after_remove() {
    let mut net = Net::new();
    let client = net.a.open(config()).unwrap();
    net.a.connect(client, server()).unwrap();
    let _ = net.a.transmit();

    assert!(net.a.remove(client));
    assert!(!net.a.remove(client));
    assert_eq!(net.a.state(client), Err(super::SocketError::BadHandle));

    net.a.advance(Instant::from_secs(600));
    assert!(net.a.transmit().is_empty());
    assert!(net.a.events().is_empty());
    assert!(net.a.is_empty());

    // The port was released with the socket.
    let again = net.a.open(config()).unwrap();
    net.a.connect(again, server()).unwrap();
    assert_eq!(net.a.state(again), Ok(State::SynSent));
}

#[test]
fn unread_data_resets() {
    let Pair { mut net, client, child, .. } = established(config());
    net.a.send(client, b"unread").unwrap();
    net.exchange();
    let _ = net.a.events();

    net.b.close(child).unwrap();
    assert_eq!(net.b.state(child), Ok(State::Closed));
    assert!(net.b.events().contains(&(child, Event::ErrorClose)));

    let out = net.b.transmit();
    assert_eq!(out.len(), 1);
    assert!(parse(&out[0]).0.flags.rst());
    assert_eq!(net.to_a(&out[0]), RxStatus::Ok);
    assert_eq!(net.a.state(client), Ok(State::Closed));
    assert_eq!(net.a.events(), vec![(client, Event::ErrorClose)]);
}

/// Where a crafted segment goes to test a state.
struct Target {
    on_a: bool,
    local: IpEndpoint,
    peer: IpEndpoint,
    seq: TcpSeqNumber,
    ack: TcpSeqNumber,
}

fn target_of(net: &Net, on_a: bool, key: SlotKey) -> Target {
    let endpoint = if on_a { &net.a } else { &net.b };
    let connection = endpoint.connection(key).unwrap();
    Target {
        on_a,
        local: connection.local(),
        peer: connection.peer(),
        seq: connection.next_rx_sequence(),
        ack: connection.head_sequence(),
    }
}

/// Drive a fresh pair of endpoints into `state`, timestamps off so crafted segments are accepted.
fn fixture(state: State) -> (Net, Target) {
    let config = config().with_options(true, true, false);
    if let State::Listen | State::SynSent | State::SynReceived = state {
        let mut net = Net::new();
        let listener = listener(&mut net, config.clone());
        if state == State::Listen {
            let target = Target {
                on_a: false,
                local: server(),
                peer: IpEndpoint::new(A, 5555),
                seq: seq(77),
                ack: seq(0),
            };
            assert_eq!(net.b.state(listener), Ok(State::Listen));
            return (net, target);
        }

        let client = net.a.open(config).unwrap();
        net.a.connect(client, server()).unwrap();
        let syn = net.a.transmit();
        if state == State::SynSent {
            let target = target_of(&net, true, client);
            assert_eq!(net.a.state(client), Ok(State::SynSent));
            return (net, target);
        }

        net.to_b(&syn[0]);
        net.b.advance(net.now);
        assert_eq!(net.b.transmit().len(), 1);
        // The fork is not announced before the handshake completes, its numbers are known.
        let target = Target {
            on_a: false,
            local: server(),
            peer: net.a.local_endpoint(client).unwrap(),
            seq: seq(1),
            ack: seq(1),
        };
        return (net, target);
    }

    let Pair { mut net, client, child, .. } = established(config);
    match state {
        State::Established => {},
        State::FinWait1 => {
            net.a.close(client).unwrap();
            let _ = net.a.transmit();
        },
        State::FinWait2 | State::CloseWait => {
            net.a.close(client).unwrap();
            net.exchange();
        },
        State::LastAck => {
            net.a.close(client).unwrap();
            net.exchange();
            net.b.close(child).unwrap();
            let _ = net.b.transmit();
        },
        State::Closing => {
            net.a.close(client).unwrap();
            net.b.close(child).unwrap();
            let from_a = net.a.transmit();
            let from_b = net.b.transmit();
            net.to_b(&from_a[0]);
            net.to_a(&from_b[0]);
            let _ = net.a.transmit();
            let _ = net.b.transmit();
        },
        State::TimeWait => {
            net.a.close(client).unwrap();
            net.exchange();
            net.b.close(child).unwrap();
            let fin = net.b.transmit();
            net.to_a(&fin[0]);
            let _ = net.a.transmit();
        },
        State::Closed | State::Listen | State::SynSent | State::SynReceived => unreachable!(),
    }

    let on_a = match state {
        State::CloseWait | State::LastAck => false,
        _ => true,
    };
    let key = if on_a { client } else { child };
    let endpoint = if on_a { &net.a } else { &net.b };
    assert_eq!(endpoint.state(key), Ok(state));
    let target = target_of(&net, on_a, key);
    (net, target)
}

#[test]
fn every_state_handles_every_segment() {
    let states = [
        State::Listen,
        State::SynSent,
        State::SynReceived,
        State::Established,
        State::FinWait1,
        State::FinWait2,
        State::CloseWait,
        State::Closing,
        State::LastAck,
        State::TimeWait,
    ];
    let segments: [(TcpFlags, &[u8]); 8] = [
        (TcpFlags::SYN, &[]),
        (TcpFlags::SYN | TcpFlags::ACK, &[]),
        (TcpFlags::ACK, &[]),
        (TcpFlags::FIN, &[]),
        (TcpFlags::FIN | TcpFlags::ACK, &[]),
        (TcpFlags::RST, &[]),
        (TcpFlags::NONE, b"data"),
        (TcpFlags::SYN | TcpFlags::FIN, &[]),
    ];

    for &state in states.iter() {
        for &(flags, payload) in segments.iter() {
            let (mut net, target) = fixture(state);
            let segment = craft(target.peer, target.local, flags, target.seq, target.ack, payload);
            let status = if target.on_a { net.to_a(&segment) } else { net.to_b(&segment) };
            assert_eq!(status, RxStatus::Ok, "{} in {}", flags, state);

            // Whatever follows settles without surprises.
            net.run_for(Duration::from_secs(300));
            assert!(net.a.len() <= 3);
            assert!(net.b.len() <= 3);
        }
    }
}
