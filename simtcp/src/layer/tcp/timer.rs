//! Timers of connections and the logical time event queue.
//!
//! Every timer a connection can run has a slot in its [`Timers`]. Arming a timer hands out a fresh
//! token and enqueues an event carrying it into the endpoint's [`Scheduler`]. Re-arming or
//! cancelling only touches the slot: an event whose token no longer matches is discarded when it
//! comes due, so no timer can fire for a connection that was since removed or rescheduled.
//!
//! [`Timers`]: struct.Timers.html
//! [`Scheduler`]: struct.Scheduler.html
use core::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::time::{Expiration, Instant};

use super::slots::Key;

/// The different timers of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Retransmission of unacknowledged data or a SYN.
    Retransmit,
    /// Zero window probe.
    Persist,
    /// Send an acknowledgement that was held back.
    DelayedAck,
    /// Retransmission of our FIN after the peer closed first.
    LastAck,
    /// The end of TIME_WAIT.
    TimeWait,
    /// The pacing gap between two segments has elapsed.
    Pacing,
    /// Deferred attempt to transmit pending data.
    SendPending,
}

impl TimerKind {
    const COUNT: usize = 7;

    /// All timers.
    pub const ALL: [TimerKind; TimerKind::COUNT] = [
        TimerKind::Retransmit, TimerKind::Persist, TimerKind::DelayedAck, TimerKind::LastAck,
        TimerKind::TimeWait, TimerKind::Pacing, TimerKind::SendPending,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
struct Slot {
    token: u64,
    expires: Option<Instant>,
}

/// The timer slots of one connection.
///
/// Only the slot is authoritative, the scheduler may hold any number of outdated events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub(crate) struct Timers {
    slots: [Slot; TimerKind::COUNT],
    next_token: u64,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Timers::default()
    }

    /// Arm or re-arm a timer and return the token its event must carry.
    pub(crate) fn arm(&mut self, kind: TimerKind, expires: Instant) -> u64 {
        self.next_token += 1;
        self.slots[kind.slot()] = Slot {
            token: self.next_token,
            expires: Some(expires),
        };
        self.next_token
    }

    /// Stop a timer. Any event already scheduled for it becomes stale.
    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        self.slots[kind.slot()].expires = None;
    }

    pub(crate) fn cancel_all(&mut self) {
        for kind in TimerKind::ALL.iter() {
            self.cancel(*kind);
        }
    }

    /// Check if a timer is waiting to fire.
    pub(crate) fn is_running(&self, kind: TimerKind) -> bool {
        self.slots[kind.slot()].expires.is_some()
    }

    pub(crate) fn expiry(&self, kind: TimerKind) -> Expiration {
        self.slots[kind.slot()].expires.into()
    }

    /// Consume a due event.
    ///
    /// Returns `true` if the token is the current one, in which case the timer is no longer
    /// running afterwards. A stale token leaves the slot untouched.
    pub(crate) fn fire(&mut self, kind: TimerKind, token: u64) -> bool {
        let slot = &mut self.slots[kind.slot()];
        if slot.expires.is_some() && slot.token == token {
            slot.expires = None;
            true
        } else {
            false
        }
    }
}

struct Scheduled<A> {
    at: Instant,
    /// Insertion order, breaks ties between events at the same instant.
    seq: u64,
    key: Key,
    action: A,
}

impl<A> PartialEq for Scheduled<A> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<A> Eq for Scheduled<A> { }

impl<A> PartialOrd for Scheduled<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A> Ord for Scheduled<A> {
    // Reversed so that the max-heap pops the earliest event.
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A queue of actions addressed to connections, ordered by logical time.
///
/// Events at the same instant come out in the order they were scheduled.
pub(crate) struct Scheduler<A> {
    heap: BinaryHeap<Scheduled<A>>,
    seq: u64,
}

impl<A> Scheduler<A> {
    pub(crate) fn new() -> Self {
        Scheduler {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Enqueue an action for the connection at `key`.
    pub(crate) fn schedule(&mut self, at: Instant, key: Key, action: A) {
        self.seq += 1;
        self.heap.push(Scheduled {
            at,
            seq: self.seq,
            key,
            action,
        });
    }

    /// The instant of the earliest queued event.
    ///
    /// Stale events are included, so this may be earlier than strictly necessary but never later.
    pub(crate) fn next_deadline(&self) -> Expiration {
        self.heap.peek().map(|event| event.at).into()
    }

    /// Dequeue the earliest event that is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<(Instant, Key, A)> {
        if self.heap.peek()?.at > now {
            return None;
        }
        self.heap.pop().map(|event| (event.at, event.key, event.action))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.heap.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<A> Default for Scheduler<A> {
    fn default() -> Self {
        Scheduler::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use super::super::slots::SlotMap;

    #[test]
    fn rearm_invalidates() {
        let mut timers = Timers::new();
        let first = timers.arm(TimerKind::Retransmit, Instant::from_millis(10));
        let second = timers.arm(TimerKind::Retransmit, Instant::from_millis(20));
        assert!(timers.is_running(TimerKind::Retransmit));
        assert_eq!(timers.expiry(TimerKind::Retransmit), Expiration::When(Instant::from_millis(20)));

        assert!(!timers.fire(TimerKind::Retransmit, first));
        assert!(timers.is_running(TimerKind::Retransmit));
        assert!(timers.fire(TimerKind::Retransmit, second));
        assert!(!timers.is_running(TimerKind::Retransmit));
        assert!(!timers.fire(TimerKind::Retransmit, second));
    }

    #[test]
    fn cancel() {
        let mut timers = Timers::new();
        let token = timers.arm(TimerKind::Persist, Instant::from_millis(10));
        timers.arm(TimerKind::DelayedAck, Instant::from_millis(10));
        timers.cancel(TimerKind::Persist);
        assert!(!timers.fire(TimerKind::Persist, token));
        assert!(timers.is_running(TimerKind::DelayedAck));
        timers.cancel_all();
        assert!(TimerKind::ALL.iter().all(|&kind| !timers.is_running(kind)));
    }

    #[test]
    fn scheduler_order() {
        let mut keys = SlotMap::new();
        let a = keys.insert(());
        let b = keys.insert(());

        let mut scheduler = Scheduler::new();
        scheduler.schedule(Instant::from_millis(20), a, "late");
        scheduler.schedule(Instant::from_millis(10), b, "first");
        scheduler.schedule(Instant::from_millis(10), a, "second");
        assert_eq!(scheduler.next_deadline(), Expiration::When(Instant::from_millis(10)));

        assert!(scheduler.pop_due(Instant::from_millis(5)).is_none());
        let now = Instant::from_millis(15);
        assert_eq!(scheduler.pop_due(now).map(|(_, key, what)| (key, what)), Some((b, "first")));
        assert_eq!(scheduler.pop_due(now).map(|(_, key, what)| (key, what)), Some((a, "second")));
        assert!(scheduler.pop_due(now).is_none());
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.pop_due(Instant::from_millis(20)).map(|(at, _, _)| at),
            Some(Instant::from_millis(20)));
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.next_deadline(), Expiration::Never);
    }
}
