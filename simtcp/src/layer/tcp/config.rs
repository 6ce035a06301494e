use crate::time::Duration;

use super::state::DataRate;

/// The explicit congestion notification mode of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EcnMode {
    /// Never negotiate ECN.
    NoEcn,
    /// Negotiate and react to ECN as in RFC 3168.
    ClassicEcn,
}

/// How initial sequence numbers are chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IsnMode {
    /// Every connection starts at sequence number zero.
    ///
    /// Deterministic and easy to follow in traces.
    Zero,
    /// Derive from the four tuple and logical time with the endpoint's keyed hash, RFC 6528.
    Hashed,
}

/// Resolved parameters of a connection.
///
/// Collects every tunable with the usual defaults. The values are consumed when a connection is
/// opened; a listener passes its configuration on to the connections it forks.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Config {
    /// Send buffer size in bytes.
    pub snd_buf_size: u32,
    /// Receive buffer size in bytes.
    pub rcv_buf_size: u32,
    /// The maximum segment size for sending, excluding headers.
    pub segment_size: u32,
    /// Slow start threshold of a new connection in bytes.
    pub initial_ssthresh: u32,
    /// Congestion window of a new connection in segments.
    pub initial_cwnd: u32,
    /// The retransmission timeout of SYN segments.
    pub connection_timeout: Duration,
    /// Number of SYN segments sent before giving up, the first one included.
    pub syn_retries: u32,
    /// Number of retransmissions on timeout before giving up, not counting the first send.
    pub data_retries: u32,
    /// Longest time to delay an acknowledgement.
    pub del_ack_timeout: Duration,
    /// Number of segments after which an acknowledgement is sent without delay.
    pub del_ack_max_count: u32,
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// The initial timeout of zero window probes.
    pub persist_timeout: Duration,
    /// The maximum segment lifetime. TIME_WAIT lasts twice this.
    pub max_segment_lifetime: Duration,
    /// Upper bound of the advertised window before scaling.
    pub max_window_size: u16,
    /// Negotiate window scaling, RFC 7323.
    pub window_scaling: bool,
    /// Negotiate selective acknowledgements, RFC 2018.
    pub sack: bool,
    /// Negotiate timestamps, RFC 7323.
    pub timestamps: bool,
    /// Lower bound of the retransmission timeout.
    pub min_rto: Duration,
    /// Clock granularity used in the retransmission timeout computation.
    pub clock_granularity: Duration,
    /// Duplicate acknowledgements needed for fast retransmit.
    pub retx_threshold: u32,
    /// Enable limited transmit, RFC 3042.
    pub limited_transmit: bool,
    /// Explicit congestion notification mode.
    pub ecn_mode: EcnMode,
    /// Space segments at the current pacing rate.
    pub pacing: bool,
    /// Upper bound of the pacing rate.
    pub max_pacing_rate: DataRate,
    /// Name of the congestion control algorithm, looked up in the registry.
    pub congestion_ops: String,
    /// Name of the recovery algorithm, looked up in the registry.
    pub recovery_ops: String,
    /// The round trip time assumed before the first sample.
    pub initial_rtt: Duration,
    /// How initial sequence numbers are chosen.
    pub isn: IsnMode,
}

/// The maximum retransmission timeout and zero window probe interval.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

impl Default for Config {
    fn default() -> Self {
        Config {
            snd_buf_size: 131_072,
            rcv_buf_size: 131_072,
            segment_size: 536,
            initial_ssthresh: u32::max_value(),
            initial_cwnd: 1,
            connection_timeout: Duration::from_secs(3),
            syn_retries: 6,
            data_retries: 6,
            del_ack_timeout: Duration::from_millis(200),
            del_ack_max_count: 2,
            no_delay: true,
            persist_timeout: Duration::from_secs(6),
            max_segment_lifetime: Duration::from_secs(120),
            max_window_size: 65535,
            window_scaling: true,
            sack: true,
            timestamps: true,
            min_rto: Duration::from_secs(1),
            clock_granularity: Duration::from_millis(1),
            retx_threshold: 3,
            limited_transmit: true,
            ecn_mode: EcnMode::NoEcn,
            pacing: false,
            max_pacing_rate: DataRate::from_gbps(4),
            congestion_ops: "NewReno".into(),
            recovery_ops: "ClassicRecovery".into(),
            initial_rtt: Duration::from_secs(1),
            isn: IsnMode::Hashed,
        }
    }
}

impl Config {
    /// Set the send and receive buffer sizes in bytes.
    pub fn with_buffer_sizes(self, snd_buf_size: u32, rcv_buf_size: u32) -> Self {
        Config { snd_buf_size, rcv_buf_size, ..self }
    }

    /// Set the sender maximum segment size.
    pub fn with_segment_size(self, segment_size: u32) -> Self {
        Config { segment_size, ..self }
    }

    /// Set the initial congestion window, in segments.
    pub fn with_initial_cwnd(self, initial_cwnd: u32) -> Self {
        Config { initial_cwnd, ..self }
    }

    /// Set the initial slow start threshold, in bytes.
    pub fn with_initial_ssthresh(self, initial_ssthresh: u32) -> Self {
        Config { initial_ssthresh, ..self }
    }

    /// Set the SYN attempts and the data retransmissions before giving up.
    pub fn with_retries(self, syn_retries: u32, data_retries: u32) -> Self {
        Config { syn_retries, data_retries, ..self }
    }

    /// Set the delayed acknowledgement timeout and the segments acknowledged at once.
    pub fn with_delayed_ack(self, del_ack_timeout: Duration, del_ack_max_count: u32) -> Self {
        Config { del_ack_timeout, del_ack_max_count, ..self }
    }

    /// Disable (`true`) or enable Nagle's algorithm.
    pub fn with_no_delay(self, no_delay: bool) -> Self {
        Config { no_delay, ..self }
    }

    /// Enable or disable window scaling, selective acknowledgements and timestamps.
    pub fn with_options(self, window_scaling: bool, sack: bool, timestamps: bool) -> Self {
        Config { window_scaling, sack, timestamps, ..self }
    }

    /// Set the lower bound of the retransmission timeout.
    pub fn with_min_rto(self, min_rto: Duration) -> Self {
        Config { min_rto, ..self }
    }

    /// Set the explicit congestion notification mode.
    pub fn with_ecn(self, ecn_mode: EcnMode) -> Self {
        Config { ecn_mode, ..self }
    }

    /// Enable pacing, never faster than `max_pacing_rate`.
    pub fn with_pacing(self, pacing: bool, max_pacing_rate: DataRate) -> Self {
        Config { pacing, max_pacing_rate, ..self }
    }

    /// Choose the congestion control by its registry name.
    pub fn with_congestion_ops(self, name: &str) -> Self {
        Config { congestion_ops: name.into(), ..self }
    }

    /// Choose the loss recovery by its registry name.
    pub fn with_recovery_ops(self, name: &str) -> Self {
        Config { recovery_ops: name.into(), ..self }
    }

    /// Set how initial sequence numbers are chosen.
    pub fn with_isn(self, isn: IsnMode) -> Self {
        Config { isn, ..self }
    }
}
