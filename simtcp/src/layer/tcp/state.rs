//! The per connection control block shared with the congestion strategies.
use core::fmt;

use crate::time::Duration;
use crate::wire::TcpSeqNumber;

/// State enum of the statemachine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// No connection, the initial and the terminal state.
    Closed,

    /// A listening connection.
    ///
    /// Akin to an open server socket. Every accepted SYN forks a new connection while this one
    /// stays in `Listen`.
    Listen,

    /// An open connection request.
    SynSent,

    /// Connection request we intend to answer, waiting on ack.
    SynReceived,

    /// An open connection.
    Established,

    /// Other side closed its connection.
    CloseWait,

    /// Connection closed after other side closed its already.
    LastAck,

    /// Closed our side of the connection.
    FinWait1,

    /// Closing connection nicely, initiated by us and acknowledged.
    FinWait2,

    /// Closed both sides but we don't know the other knows.
    Closing,

    /// Both sides recognized connection as closed.
    TimeWait,
}

impl State {
    /// All states, in transition table order.
    pub const ALL: [State; 11] = [
        State::Closed, State::Listen, State::SynSent, State::SynReceived, State::Established,
        State::CloseWait, State::LastAck, State::FinWait1, State::FinWait2, State::Closing,
        State::TimeWait,
    ];

    /// Check if the state maintains a receive window for incoming data.
    pub fn has_receive_window(self) -> bool {
        match self {
            State::Closed | State::Listen | State::SynSent | State::SynReceived => false,
            _ => true,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN_SENT",
            State::SynReceived => "SYN_RCVD",
            State::Established => "ESTABLISHED",
            State::CloseWait => "CLOSE_WAIT",
            State::LastAck => "LAST_ACK",
            State::FinWait1 => "FIN_WAIT_1",
            State::FinWait2 => "FIN_WAIT_2",
            State::Closing => "CLOSING",
            State::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

/// The congestion sub-state of a sender, named as in Linux.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CongState {
    /// Normal state, no dubious events.
    Open,
    /// Duplicate acknowledgements or selective acknowledgements were received.
    Disorder,
    /// The congestion window was reduced due to an explicit congestion notification.
    Cwr,
    /// Fast recovery after a fast retransmit.
    Recovery,
    /// Recovery after a retransmission timeout.
    Loss,
}

impl fmt::Display for CongState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CongState::Open => "CA_OPEN",
            CongState::Disorder => "CA_DISORDER",
            CongState::Cwr => "CA_CWR",
            CongState::Recovery => "CA_RECOVERY",
            CongState::Loss => "CA_LOSS",
        };
        f.write_str(name)
    }
}

/// The explicit congestion notification state of a connection, RFC 3168.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EcnState {
    /// ECN was not negotiated.
    Disabled,
    /// Negotiated, nothing to signal.
    Idle,
    /// A congestion experienced mark was received from the IP layer.
    CeReceived,
    /// Echoing congestion to the peer until it reduces its window.
    SendingEce,
    /// The peer echoed congestion to us.
    EceReceived,
    /// We reduced our window and told the peer so.
    CwrSent,
}

impl fmt::Display for EcnState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            EcnState::Disabled => "ECN_DISABLED",
            EcnState::Idle => "ECN_IDLE",
            EcnState::CeReceived => "ECN_CE_RCVD",
            EcnState::SendingEce => "ECN_SENDING_ECE",
            EcnState::EceReceived => "ECN_ECE_RCVD",
            EcnState::CwrSent => "ECN_CWR_SENT",
        };
        f.write_str(name)
    }
}

/// Events reported to the congestion strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CaEvent {
    /// First transmission when no packet is in flight.
    TxStart,
    /// A congestion experienced mark was received.
    EcnIsCe,
    /// An ECN capable segment without mark was received.
    EcnNoCe,
    /// A non-delayed acknowledgement was sent.
    NonDelayedAck,
    /// A delayed acknowledgement was sent.
    DelayedAck,
    /// A retransmission timeout fired.
    Loss,
    /// The congestion window reduction finished.
    CompleteCwr,
}

/// A transmission rate in bits per second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DataRate {
    bits_per_sec: u64,
}

impl DataRate {
    /// Construct from bits per second.
    pub const fn from_bits_per_sec(bits_per_sec: u64) -> Self {
        DataRate { bits_per_sec }
    }

    /// Construct from gigabits per second.
    pub const fn from_gbps(gbps: u64) -> Self {
        DataRate { bits_per_sec: gbps * 1_000_000_000 }
    }

    /// The rate in bits per second.
    pub fn bits_per_sec(self) -> u64 {
        self.bits_per_sec
    }

    /// The time needed to put a number of bytes on the wire at this rate.
    ///
    /// A zero rate never finishes, which is reported as the longest representable duration.
    pub fn bytes_tx_time(self, bytes: u32) -> Duration {
        if self.bits_per_sec == 0 {
            return Duration::from_secs(u64::max_value());
        }
        let bits = u128::from(bytes) * 8;
        let nanos = bits * 1_000_000_000 / u128::from(self.bits_per_sec);
        Duration::from_nanos(nanos as u64)
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}bps", self.bits_per_sec)
    }
}

/// The transmission control block.
///
/// Holds everything congestion control and recovery strategies may inspect or modify. It is
/// owned by exactly one connection and copied, never shared, when a listener forks.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ControlBlock {
    /// The congestion window (cwnd) in bytes.
    pub cwnd: u32,

    /// The inflated congestion window, used by recovery when SACK is not available.
    pub cwnd_infl: u32,

    /// The slow start threshold (ssthresh) in bytes.
    pub ssthresh: u32,

    /// The initial congestion window in segments.
    pub initial_cwnd: u32,

    /// The initial slow start threshold in bytes.
    pub initial_ssthresh: u32,

    /// The sender maximum segment size (SMSS).
    ///
    /// The size does not include headers or options.
    pub segment_size: u32,

    /// The sequence number of the last acknowledgement processed.
    pub last_acked_seq: TcpSeqNumber,

    /// The congestion sub-state.
    pub cong_state: CongState,

    /// The explicit congestion notification state.
    pub ecn_state: EcnState,

    /// The highest sequence number ever transmitted.
    ///
    /// Covers data only. The FIN is not counted.
    pub high_tx_mark: TcpSeqNumber,

    /// The next sequence number to use for transmission.
    ///
    /// In RFC793 this is referred to as `SND.NXT`. At most `high_tx_mark` while data flows, and
    /// `high_tx_mark + 1` once our FIN was acknowledged.
    pub next_tx_sequence: TcpSeqNumber,

    /// The most recent timestamp value of the peer (`TS.Recent`).
    pub rcv_timestamp_value: u32,

    /// The most recent echo of our timestamp by the peer.
    pub rcv_timestamp_echo_reply: u32,

    /// Whether sent segments are spaced out at the pacing rate.
    pub pacing: bool,

    /// The upper bound of the pacing rate.
    pub max_pacing_rate: DataRate,

    /// The rate at which segments are currently paced.
    pub current_pacing_rate: DataRate,

    /// The smallest round trip time observed.
    pub min_rtt: Option<Duration>,

    /// The most recent round trip time sample.
    pub last_rtt: Option<Duration>,

    /// The bytes currently believed to be in the network.
    pub bytes_in_flight: u32,
}

impl ControlBlock {
    /// A control block before any connection setup.
    pub fn new(segment_size: u32) -> Self {
        ControlBlock {
            cwnd: 0,
            cwnd_infl: 0,
            ssthresh: u32::max_value(),
            initial_cwnd: 1,
            initial_ssthresh: u32::max_value(),
            segment_size,
            last_acked_seq: TcpSeqNumber::default(),
            cong_state: CongState::Open,
            ecn_state: EcnState::Disabled,
            high_tx_mark: TcpSeqNumber::default(),
            next_tx_sequence: TcpSeqNumber::default(),
            rcv_timestamp_value: 0,
            rcv_timestamp_echo_reply: 0,
            pacing: false,
            max_pacing_rate: DataRate::default(),
            current_pacing_rate: DataRate::default(),
            min_rtt: None,
            last_rtt: None,
            bytes_in_flight: 0,
        }
    }

    /// Set up the windows of a connection that just synchronized.
    pub fn initialize_windows(&mut self) {
        self.cwnd = self.initial_cwnd.saturating_mul(self.segment_size);
        self.cwnd_infl = self.cwnd;
        self.ssthresh = self.initial_ssthresh;
    }

    /// Record a round trip time sample.
    pub fn record_rtt(&mut self, rtt: Duration) {
        self.last_rtt = Some(rtt);
        self.min_rtt = Some(match self.min_rtt {
            Some(min) => min.min(rtt),
            None => rtt,
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn data_rate() {
        let rate = DataRate::from_bits_per_sec(8_000_000);
        assert_eq!(rate.bytes_tx_time(1000), Duration::from_millis(1));
        assert_eq!(DataRate::from_gbps(4).bytes_tx_time(500), Duration::from_nanos(1000));
    }

    #[test]
    fn windows() {
        let mut tcb = ControlBlock::new(500);
        tcb.initial_cwnd = 10;
        tcb.initial_ssthresh = 64_000;
        tcb.initialize_windows();
        assert_eq!(tcb.cwnd, 5000);
        assert_eq!(tcb.cwnd_infl, 5000);
        assert_eq!(tcb.ssthresh, 64_000);
    }

    #[test]
    fn min_rtt() {
        let mut tcb = ControlBlock::new(500);
        tcb.record_rtt(Duration::from_millis(30));
        tcb.record_rtt(Duration::from_millis(10));
        tcb.record_rtt(Duration::from_millis(20));
        assert_eq!(tcb.min_rtt, Some(Duration::from_millis(10)));
        assert_eq!(tcb.last_rtt, Some(Duration::from_millis(20)));
    }

    #[test]
    fn names() {
        assert_eq!(format!("{}", State::SynReceived), "SYN_RCVD");
        assert_eq!(format!("{}", CongState::Recovery), "CA_RECOVERY");
        assert_eq!(format!("{}", EcnState::CwrSent), "ECN_CWR_SENT");
    }
}
