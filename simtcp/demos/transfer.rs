//! A bulk transfer over a simulated lossy link.
//!
//! Two endpoints are connected by a link with a fixed one-way delay that drops a share of the
//! segments it carries. A client sends a number of bytes to a listening server and closes, the
//! server echoes nothing and closes once the client finished. Prints the final congestion state
//! of the sender and the logical time the transfer took.
//!
//! Run with `RUST_LOG=simtcp=debug` to follow the connections.
use std::collections::VecDeque;
use structopt::StructOpt;

use simtcp::layer::tcp::{Config, Endpoint, Event, IsnGenerator, SlotKey, State, Transmit};
use simtcp::time::{Duration, Expiration, Instant};
use simtcp::wire::{IpAddress, IpEndpoint};

const CLIENT: IpAddress = IpAddress::v4(10, 0, 0, 1);
const SERVER: IpAddress = IpAddress::v4(10, 0, 0, 2);

fn main() {
    env_logger::init();
    let Options {
        bytes,
        loss,
        delay,
        seed,
        segment_size,
        congestion,
    } = Options::from_args();

    let config = Config::default()
        .with_segment_size(segment_size)
        .with_congestion_ops(&congestion);
    let server_at = IpEndpoint::new(SERVER, 5001);

    let mut client = Endpoint::new(IsnGenerator::from_secret_key_bytes(secret_key(seed)));
    client.add_address(CLIENT);
    let mut server = Endpoint::new(IsnGenerator::from_secret_key_bytes(secret_key(!seed)));
    server.add_address(SERVER);

    let listener = server.open(config.clone()).expect("open listener");
    server.bind_to(listener, server_at).expect("bind listener");
    server.listen(listener).expect("listen");

    let socket = client.open(config).expect("open client");
    client.connect(socket, server_at).expect("connect");

    let mut link = Link::new(Duration::from_millis(delay), loss, seed);
    let mut now = Instant::from_millis(0);
    let mut to_send = (0..bytes).map(|i| i as u8).collect::<VecDeque<u8>>();
    let mut received = 0usize;
    let mut accepted: Option<SlotKey> = None;
    let mut client_done = false;
    let mut server_done = false;

    while !(client_done && server_done) {
        for (key, event) in client.events() {
            match event {
                Event::ConnectionFailed | Event::ErrorClose => {
                    eprintln!("Client connection {:?} failed", key);
                    return;
                },
                Event::NormalClose => client_done = true,
                _ => (),
            }
        }
        for (key, event) in server.events() {
            match event {
                Event::NewConnection { peer, .. } => {
                    println!("Accepted {} at {}", peer, now);
                    accepted = Some(key);
                },
                Event::DataReceived => {
                    let data = server.recv(key, usize::max_value()).expect("read server");
                    received += data.len();
                },
                Event::NormalClose if Some(key) == accepted => {
                    server.close(key).expect("close server");
                    server_done = true;
                },
                Event::ErrorClose => {
                    eprintln!("Server connection {:?} reset", key);
                    return;
                },
                _ => (),
            }
        }

        let connected = client.state(socket) == Ok(State::Established);
        if !to_send.is_empty() && connected {
            let room = client.tx_available(socket).expect("client buffer");
            let chunk = to_send.drain(..room.min(to_send.len())).collect::<Vec<_>>();
            client.send(socket, &chunk).expect("write client");
            if to_send.is_empty() {
                client.close(socket).expect("close client");
            }
        }

        let mut busy = false;
        for transmit in client.transmit().into_iter().chain(server.transmit()) {
            link.push(now, transmit);
            busy = true;
        }

        while let Some(transmit) = link.pop(now) {
            let target = if transmit.dst.addr == SERVER { &mut server } else { &mut client };
            target.receive(now, transmit.src.addr, transmit.dst.addr, &transmit.bytes, transmit.ecn);
            busy = true;
        }

        // Answers to what was just delivered go out before time moves on.
        if busy {
            continue;
        }

        let next = [client.poll_at(), server.poll_at(), link.next_arrival()]
            .iter()
            .filter_map(|at| Option::<Instant>::from(*at))
            .min();
        match next {
            Some(at) => now = now.max(at),
            None if client_done && server_done => break,
            None => {
                eprintln!("Nothing left to do at {}", now);
                return;
            },
        }
        client.advance(now);
        server.advance(now);
    }

    let cb = client.control_block(socket).expect("client control block");
    println!("Transferred {} of {} bytes in {}", received, bytes, now);
    println!("Dropped {} of {} segments", link.dropped, link.carried);
    println!("Final cwnd {} ssthresh {} state {:?}", cb.cwnd, cb.ssthresh, cb.cong_state);
}

/// A link carrying both directions with a constant delay.
struct Link {
    delay: Duration,
    loss: f64,
    rng: u64,
    queue: VecDeque<(Instant, Transmit)>,
    carried: usize,
    dropped: usize,
}

impl Link {
    fn new(delay: Duration, loss: f64, seed: u64) -> Self {
        Link {
            delay,
            loss,
            rng: seed | 1,
            queue: VecDeque::new(),
            carried: 0,
            dropped: 0,
        }
    }

    fn push(&mut self, now: Instant, transmit: Transmit) {
        self.carried += 1;
        if self.next_uniform() < self.loss {
            self.dropped += 1;
            return;
        }
        self.queue.push_back((now + self.delay, transmit));
    }

    fn pop(&mut self, now: Instant) -> Option<Transmit> {
        match self.queue.front() {
            Some((at, _)) if *at <= now => self.queue.pop_front().map(|(_, transmit)| transmit),
            _ => None,
        }
    }

    fn next_arrival(&self) -> Expiration {
        match self.queue.front() {
            Some((at, _)) => Expiration::When(*at),
            None => Expiration::Never,
        }
    }

    /// Xorshift, good enough to pick drops reproducibly.
    fn next_uniform(&mut self) -> f64 {
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 7;
        self.rng ^= self.rng << 17;
        (self.rng >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn secret_key(seed: u64) -> [u8; 16] {
    let mut key = [0; 16];
    key[..8].copy_from_slice(&seed.to_le_bytes());
    key[8..].copy_from_slice(&seed.rotate_left(32).to_le_bytes());
    key
}

#[derive(StructOpt)]
struct Options {
    /// Number of bytes the client sends.
    #[structopt(long = "bytes", default_value = "1000000")]
    bytes: usize,
    /// Probability of dropping a segment on the link.
    #[structopt(long = "loss", default_value = "0.01")]
    loss: f64,
    /// One way delay in milliseconds.
    #[structopt(long = "delay", default_value = "20")]
    delay: u64,
    /// Seed of the link and the initial sequence numbers.
    #[structopt(long = "seed", default_value = "1")]
    seed: u64,
    #[structopt(long = "mss", default_value = "1460")]
    segment_size: u32,
    /// Name of the congestion control.
    #[structopt(long = "congestion", default_value = "NewReno")]
    congestion: String,
}
