//! Fast recovery strategies.
use super::state::ControlBlock;

/// The interface of a recovery algorithm.
///
/// Governs the congestion window while the sender is in fast recovery.
pub trait RecoveryOps {
    /// The registry name of the algorithm.
    fn name(&self) -> &'static str;

    /// Called exactly once when fast recovery is entered.
    fn enter_recovery(&mut self, tcb: &mut ControlBlock, dup_ack_count: u32,
        un_acked_count: u32, last_sacked_bytes: u32);

    /// Called for every acknowledgement received during fast recovery.
    fn do_recovery(&mut self, tcb: &mut ControlBlock, last_acked_bytes: u32, last_sacked_bytes: u32);

    /// Called exactly once when fast recovery is left.
    fn exit_recovery(&mut self, tcb: &mut ControlBlock);

    /// Observe bytes sent during recovery.
    fn update_bytes_sent(&mut self, _bytes_sent: u32) { }

    /// Create an independent copy with the same internal state.
    fn fork(&self) -> Box<dyn RecoveryOps>;
}

/// The NewReno window inflation, compatible with SACK.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ClassicRecovery {
    _private: (),
}

impl ClassicRecovery {
    /// A fresh instance, as registered under `"ClassicRecovery"`.
    pub fn new() -> Self {
        ClassicRecovery::default()
    }
}

impl RecoveryOps for ClassicRecovery {
    fn name(&self) -> &'static str {
        "ClassicRecovery"
    }

    fn enter_recovery(&mut self, tcb: &mut ControlBlock, dup_ack_count: u32, _: u32, _: u32) {
        tcb.cwnd = tcb.ssthresh;
        tcb.cwnd_infl = tcb.ssthresh
            .saturating_add(dup_ack_count.saturating_mul(tcb.segment_size));
    }

    fn do_recovery(&mut self, tcb: &mut ControlBlock, _: u32, _: u32) {
        tcb.cwnd_infl = tcb.cwnd_infl.saturating_add(tcb.segment_size);
    }

    fn exit_recovery(&mut self, tcb: &mut ControlBlock) {
        // RFC 6582, section 3.2 step 3 option 2. With SACK the window stays at ssthresh as well:
        // the acknowledgement arrived during recovery and must not grow the window.
        tcb.cwnd_infl = tcb.ssthresh;
    }

    fn fork(&self) -> Box<dyn RecoveryOps> {
        Box::new(*self)
    }
}

/// Construct a recovery algorithm by its registry name.
pub fn recovery_ops(name: &str) -> Option<Box<dyn RecoveryOps>> {
    match name {
        "ClassicRecovery" => Some(Box::new(ClassicRecovery::new())),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classic_inflation() {
        let mut recovery = ClassicRecovery::new();
        let mut tcb = ControlBlock::new(500);
        tcb.cwnd = 8000;
        tcb.ssthresh = 4000;

        recovery.enter_recovery(&mut tcb, 3, 16, 0);
        assert_eq!(tcb.cwnd, 4000);
        assert_eq!(tcb.cwnd_infl, 5500);

        recovery.do_recovery(&mut tcb, 0, 0);
        recovery.do_recovery(&mut tcb, 0, 0);
        assert_eq!(tcb.cwnd_infl, 6500);
        assert_eq!(tcb.cwnd, 4000);

        recovery.exit_recovery(&mut tcb);
        assert_eq!(tcb.cwnd_infl, 4000);
    }

    #[test]
    fn registry() {
        assert_eq!(recovery_ops("ClassicRecovery").map(|ops| ops.name()), Some("ClassicRecovery"));
        assert!(recovery_ops("Prr").is_none());
    }
}
