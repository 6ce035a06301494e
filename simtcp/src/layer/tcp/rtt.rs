//! Round trip time estimation, RFC 6298.
use crate::time::{Duration, Instant};
use crate::wire::TcpSeqNumber;

/// Produces a smoothed round trip time and its variation from samples.
pub trait RttEstimator {
    /// Account for a new sample.
    fn measurement(&mut self, rtt: Duration);

    /// The smoothed round trip time (SRTT).
    fn estimate(&self) -> Duration;

    /// The round trip time variation (RTTVAR).
    fn variation(&self) -> Duration;

    /// Number of samples accounted for since the last reset.
    fn samples(&self) -> u32;

    /// Forget all samples and go back to the initial estimate.
    fn reset(&mut self);

    /// Create an independent copy with the same internal state.
    fn fork(&self) -> Box<dyn RttEstimator>;

    /// The retransmission timeout derived from the estimate.
    ///
    /// `max(SRTT + max(G, 4*RTTVAR), min_rto)`.
    fn rto(&self, clock_granularity: Duration, min_rto: Duration) -> Duration {
        let spread = clock_granularity.max(self.variation() * 4);
        (self.estimate() + spread).max(min_rto)
    }
}

/// The classic mean deviation estimator with gains α = 1/8 and β = 1/4.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeanDeviation {
    initial: Duration,
    estimate: Duration,
    variation: Duration,
    samples: u32,
}

impl MeanDeviation {
    /// Shift of the smoothing gain α.
    const ALPHA_SHIFT: u32 = 3;
    /// Shift of the variation gain β.
    const BETA_SHIFT: u32 = 2;

    /// Create an estimator that assumes `initial` until the first sample.
    pub fn new(initial: Duration) -> Self {
        MeanDeviation {
            initial,
            estimate: initial,
            variation: Duration::from_secs(0),
            samples: 0,
        }
    }
}

fn nanos(duration: Duration) -> i128 {
    duration.as_nanos() as i128
}

fn from_nanos(nanos: i128) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}

impl RttEstimator for MeanDeviation {
    fn measurement(&mut self, rtt: Duration) {
        if self.samples == 0 {
            self.estimate = rtt;
            self.variation = rtt / 2;
        } else {
            let error = nanos(rtt) - nanos(self.estimate);
            let estimate = nanos(self.estimate) + (error >> Self::ALPHA_SHIFT);
            let deviation = error.abs() - nanos(self.variation);
            let variation = nanos(self.variation) + (deviation >> Self::BETA_SHIFT);
            self.estimate = from_nanos(estimate);
            self.variation = from_nanos(variation);
        }
        self.samples = self.samples.saturating_add(1);
    }

    fn estimate(&self) -> Duration {
        self.estimate
    }

    fn variation(&self) -> Duration {
        self.variation
    }

    fn samples(&self) -> u32 {
        self.samples
    }

    fn reset(&mut self) {
        *self = MeanDeviation::new(self.initial);
    }

    fn fork(&self) -> Box<dyn RttEstimator> {
        Box::new(*self)
    }
}

/// An entry of the transmission history used for round trip samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RttHistory {
    /// The first sequence number of the segment.
    pub seq: TcpSeqNumber,
    /// The payload length of the segment.
    pub count: u32,
    /// When the segment was sent.
    pub time: Instant,
    /// Whether the segment was ever retransmitted. Such entries never produce a sample.
    pub retx: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_sample() {
        let mut rtt = MeanDeviation::new(Duration::from_secs(1));
        assert_eq!(rtt.estimate(), Duration::from_secs(1));
        rtt.measurement(Duration::from_millis(100));
        assert_eq!(rtt.estimate(), Duration::from_millis(100));
        assert_eq!(rtt.variation(), Duration::from_millis(50));
        assert_eq!(rtt.samples(), 1);
    }

    #[test]
    fn smoothing() {
        let mut rtt = MeanDeviation::new(Duration::from_secs(1));
        rtt.measurement(Duration::from_millis(100));
        rtt.measurement(Duration::from_millis(180));
        // 100 + 80/8 and 50 + (80 - 50)/4.
        assert_eq!(rtt.estimate(), Duration::from_millis(110));
        assert_eq!(rtt.variation(), Duration::from_micros(57_500));
        rtt.measurement(Duration::from_millis(110));
        assert_eq!(rtt.estimate(), Duration::from_millis(110));
        assert_eq!(rtt.variation(), Duration::from_nanos(43_125_000));
    }

    #[test]
    fn rto_bounds() {
        let mut rtt = MeanDeviation::new(Duration::from_secs(1));
        rtt.measurement(Duration::from_millis(100));
        let granularity = Duration::from_millis(1);
        // 100 + 4*50 milliseconds.
        assert_eq!(rtt.rto(granularity, Duration::from_millis(200)), Duration::from_millis(300));
        assert_eq!(rtt.rto(granularity, Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn reset_and_fork() {
        let mut rtt = MeanDeviation::new(Duration::from_secs(1));
        rtt.measurement(Duration::from_millis(100));
        let forked = rtt.fork();
        rtt.reset();
        assert_eq!(rtt.samples(), 0);
        assert_eq!(rtt.estimate(), Duration::from_secs(1));
        assert_eq!(forked.samples(), 1);
        assert_eq!(forked.estimate(), Duration::from_millis(100));
    }
}
