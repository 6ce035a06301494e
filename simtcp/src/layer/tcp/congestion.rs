//! Congestion control strategies.
//!
//! A strategy is pure policy: it reads and writes the [`ControlBlock`] of the connection that
//! owns it but keeps no reference to the connection itself. Strategies are looked up by name with
//! [`congestion_ops`] and deep copied with [`CongestionOps::fork`] when a listener spawns a
//! connection, so siblings never share mutable state.
//!
//! [`ControlBlock`]: ../struct.ControlBlock.html
//! [`congestion_ops`]: fn.congestion_ops.html
//! [`CongestionOps::fork`]: trait.CongestionOps.html#tymethod.fork
use crate::time::Duration;

use super::state::{CaEvent, CongState, ControlBlock};

/// The interface of a congestion control algorithm.
pub trait CongestionOps {
    /// The registry name of the algorithm.
    fn name(&self) -> &'static str;

    /// The slow start threshold after a loss event.
    fn ss_thresh(&mut self, tcb: &ControlBlock, bytes_in_flight: u32) -> u32;

    /// Grow the congestion window for newly acknowledged segments.
    fn increase_window(&mut self, tcb: &mut ControlBlock, segments_acked: u32);

    /// Observe acknowledged segments and their round trip time.
    fn pkts_acked(&mut self, _tcb: &mut ControlBlock, _segments_acked: u32, _rtt: Option<Duration>) { }

    /// Observe a change of the congestion state.
    fn congestion_state_set(&mut self, _tcb: &mut ControlBlock, _new_state: CongState) { }

    /// Observe a congestion event.
    fn cwnd_event(&mut self, _tcb: &mut ControlBlock, _event: CaEvent) { }

    /// Create an independent copy with the same internal state.
    fn fork(&self) -> Box<dyn CongestionOps>;
}

/// The NewReno algorithm, RFC 5681 and RFC 6582.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NewReno {
    _private: (),
}

/// A fixed window that ignores congestion entirely.
///
/// Only useful to take congestion control out of the picture in experiments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Decongest {
    _private: (),
}

impl NewReno {
    /// A fresh instance, as registered under `"NewReno"`.
    pub fn new() -> Self {
        NewReno::default()
    }

    /// Grow by one segment per acknowledged segment.
    ///
    /// Returns the acknowledged segments not used for growth. Only one segment is counted per
    /// call, the rest carries over to congestion avoidance when the threshold was crossed.
    fn slow_start(&mut self, tcb: &mut ControlBlock, segments_acked: u32) -> u32 {
        if segments_acked >= 1 {
            tcb.cwnd = tcb.cwnd.saturating_add(tcb.segment_size);
            net_trace!("slow start, updated to cwnd {} ssthresh {}", tcb.cwnd, tcb.ssthresh);
            return segments_acked - 1;
        }
        0
    }

    /// Grow by roughly one segment per round trip.
    fn congestion_avoidance(&mut self, tcb: &mut ControlBlock, segments_acked: u32) {
        if segments_acked > 0 && tcb.cwnd > 0 {
            let seg = u64::from(tcb.segment_size);
            let adder = (seg * seg / u64::from(tcb.cwnd)).max(1);
            tcb.cwnd = tcb.cwnd.saturating_add(adder as u32);
            net_trace!("congestion avoidance, updated to cwnd {} ssthresh {}", tcb.cwnd, tcb.ssthresh);
        }
    }
}

impl CongestionOps for NewReno {
    fn name(&self) -> &'static str {
        "NewReno"
    }

    fn ss_thresh(&mut self, tcb: &ControlBlock, bytes_in_flight: u32) -> u32 {
        (2*tcb.segment_size).max(bytes_in_flight / 2)
    }

    fn increase_window(&mut self, tcb: &mut ControlBlock, mut segments_acked: u32) {
        if tcb.cwnd < tcb.ssthresh {
            segments_acked = self.slow_start(tcb, segments_acked);
        }

        if tcb.cwnd >= tcb.ssthresh {
            self.congestion_avoidance(tcb, segments_acked);
        }
    }

    fn fork(&self) -> Box<dyn CongestionOps> {
        Box::new(*self)
    }
}

impl Decongest {
    /// A fresh instance, as registered under `"Decongest"`.
    pub fn new() -> Self {
        Decongest::default()
    }

    /// The window used whenever the window would grow.
    pub const WINDOW: u32 = 100_000;
}

impl CongestionOps for Decongest {
    fn name(&self) -> &'static str {
        "Decongest"
    }

    fn ss_thresh(&mut self, tcb: &ControlBlock, bytes_in_flight: u32) -> u32 {
        (2*tcb.segment_size).max(bytes_in_flight / 2)
    }

    fn increase_window(&mut self, tcb: &mut ControlBlock, _: u32) {
        tcb.cwnd = Self::WINDOW;
    }

    fn fork(&self) -> Box<dyn CongestionOps> {
        Box::new(*self)
    }
}

/// Construct a congestion control algorithm by its registry name.
pub fn congestion_ops(name: &str) -> Option<Box<dyn CongestionOps>> {
    match name {
        "NewReno" => Some(Box::new(NewReno::new())),
        "Decongest" => Some(Box::new(Decongest::new())),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tcb(cwnd: u32, ssthresh: u32) -> ControlBlock {
        let mut tcb = ControlBlock::new(500);
        tcb.cwnd = cwnd;
        tcb.ssthresh = ssthresh;
        tcb
    }

    #[test]
    fn slow_start() {
        let mut reno = NewReno::new();
        let mut tcb = tcb(500, 10_000);
        reno.increase_window(&mut tcb, 1);
        assert_eq!(tcb.cwnd, 1000);
        // Only one segment counts in slow start, the rest goes nowhere below ssthresh.
        reno.increase_window(&mut tcb, 3);
        assert_eq!(tcb.cwnd, 1500);
    }

    #[test]
    fn crossing_into_avoidance() {
        let mut reno = NewReno::new();
        let mut tcb = tcb(1500, 2000);
        reno.increase_window(&mut tcb, 2);
        // 2000 after slow start, then 500*500/2000 = 125 of avoidance.
        assert_eq!(tcb.cwnd, 2125);
    }

    #[test]
    fn avoidance_grows_at_least_one_byte() {
        let mut reno = NewReno::new();
        let mut tcb = tcb(1_000_000, 500);
        reno.increase_window(&mut tcb, 1);
        assert_eq!(tcb.cwnd, 1_000_001);
        reno.increase_window(&mut tcb, 0);
        assert_eq!(tcb.cwnd, 1_000_001);
    }

    #[test]
    fn ss_thresh() {
        let mut reno = NewReno::new();
        let tcb = tcb(0, 0);
        assert_eq!(reno.ss_thresh(&tcb, 100), 1000);
        assert_eq!(reno.ss_thresh(&tcb, 10_000), 5000);
        let mut fixed = Decongest::new();
        assert_eq!(fixed.ss_thresh(&tcb, 10_000), 5000);
    }

    #[test]
    fn decongest_is_fixed() {
        let mut fixed = Decongest::new();
        let mut tcb = tcb(500, 1000);
        fixed.increase_window(&mut tcb, 1);
        assert_eq!(tcb.cwnd, Decongest::WINDOW);
    }

    #[test]
    fn registry() {
        assert_eq!(congestion_ops("NewReno").map(|ops| ops.name()), Some("NewReno"));
        assert_eq!(congestion_ops("Decongest").map(|ops| ops.name()), Some("Decongest"));
        assert!(congestion_ops("Cubic").is_none());
        let forked = congestion_ops("NewReno").map(|ops| ops.fork());
        assert_eq!(forked.map(|ops| ops.name()), Some("NewReno"));
    }
}
