//! Provided implementations of the send and receive buffers.
//!
//! A connection only talks to its buffers through the [`SendBuffer`] and [`ReceiveBuffer`]
//! traits. The send buffer is more than a byte queue: it also holds the scoreboard of sent
//! segments that selective acknowledgements, loss detection and the choice of the next segment to
//! (re-)transmit work on, following the conservative loss recovery of RFC 6675.
//!
//! [`SendBuffer`]: trait.SendBuffer.html
//! [`ReceiveBuffer`]: trait.ReceiveBuffer.html
use std::collections::{BTreeMap, VecDeque};

use crate::wire::{SackBlock, TcpSeqNumber};

/// The sequence space of data waiting to be sent or acknowledged.
pub trait SendBuffer {
    /// Append application data. Returns `false` if it does not fit.
    fn add(&mut self, data: &[u8]) -> bool;

    /// The sequence number of the first unacknowledged byte.
    fn head_sequence(&self) -> TcpSeqNumber;

    /// Start the sequence space at `seq`, after the handshake synchronized it.
    fn set_head_sequence(&mut self, seq: TcpSeqNumber);

    /// Bytes in the buffer, sent or not.
    fn size(&self) -> usize;

    /// Bytes from `seq` up to the end of the buffered data.
    fn size_from_sequence(&self, seq: TcpSeqNumber) -> usize;

    /// Free space.
    fn available(&self) -> usize;

    /// Capacity in bytes.
    fn max_buffer_size(&self) -> usize;

    /// Change the capacity, data already queued is kept.
    fn set_max_buffer_size(&mut self, size: usize);

    /// The sender maximum segment size used by the loss heuristics.
    fn set_segment_size(&mut self, size: usize);

    /// The duplicate acknowledgement threshold used by the loss heuristics.
    fn set_dup_ack_thresh(&mut self, thresh: u32);

    /// Take at most `max` bytes starting at `seq` for transmission.
    ///
    /// The range is recorded on the scoreboard as sent, or as retransmitted when it was sent
    /// before.
    fn copy_from_sequence(&mut self, max: usize, seq: TcpSeqNumber) -> TxSegment;

    /// Drop everything before the cumulative acknowledgement `ack`.
    fn discard_up_to(&mut self, ack: TcpSeqNumber);

    /// Choose the next sequence number to send, RFC 6675 `NextSeg()`.
    ///
    /// Rule 3, retransmitting a segment not known to be lost, is only considered if
    /// `enable_rule3` is set.
    fn next_seg(&self, enable_rule3: bool) -> Option<TcpSeqNumber>;

    /// RFC 6675 `IsLost()` of the sent segment containing `seq`.
    fn is_lost(&self, seq: TcpSeqNumber) -> bool;

    /// Consider the first sent segment lost, regardless of the scoreboard.
    fn mark_head_as_lost(&mut self);

    /// Account a duplicate acknowledgement as one more segment having left the network.
    ///
    /// Emulates SACK information for peers that do not provide it.
    fn add_reno_sack(&mut self);

    /// Forget the emulated SACK information of `add_reno_sack`.
    fn reset_reno_sack(&mut self);

    /// Apply the blocks of a SACK option. Returns `true` if the scoreboard changed.
    fn update(&mut self, blocks: &[SackBlock]) -> bool;

    /// Bytes known to have been received by the peer out of order.
    fn sacked(&self) -> usize;

    /// RFC 6675 pipe, the bytes estimated to be in the network.
    fn bytes_in_flight(&self) -> usize;

    /// Mark all sent segments as lost after a timeout.
    ///
    /// With `reset_sack` the selective acknowledgement information is forgotten as well.
    fn set_sent_list_lost(&mut self, reset_sack: bool);

    /// Allow the first sent segment to be retransmitted again.
    fn delete_retransmitted_flag_from_head(&mut self);

    /// The first sent segment was retransmitted and not acknowledged since.
    fn is_head_retransmitted(&self) -> bool;

    /// Create an independent copy with the same content.
    fn fork(&self) -> Box<dyn SendBuffer>;
}

/// The sequence space of received data.
pub trait ReceiveBuffer {
    /// Store a segment's payload. Returns `false` if none of it was new and inside the window.
    fn add(&mut self, seq: TcpSeqNumber, payload: &[u8]) -> bool;

    /// The next expected in-order sequence number (`RCV.NXT`).
    fn next_rx_sequence(&self) -> TcpSeqNumber;

    /// Start the sequence space at `seq`.
    fn set_next_rx_sequence(&mut self, seq: TcpSeqNumber);

    /// The first sequence number beyond the window.
    fn max_rx_sequence(&self) -> TcpSeqNumber;

    /// Bytes stored, including those received out of order.
    fn size(&self) -> usize;

    /// Bytes that can be read by the application.
    fn available(&self) -> usize;

    /// Capacity in bytes, which bounds the window.
    fn max_buffer_size(&self) -> usize;

    /// Change the capacity.
    fn set_max_buffer_size(&mut self, size: usize);

    /// Read at most `max` in-order bytes.
    fn extract(&mut self, max: usize) -> Vec<u8>;

    /// All data up to and including the FIN was received.
    fn finished(&self) -> bool;

    /// The sequence number of the FIN is known.
    fn got_fin(&self) -> bool;

    /// Record the sequence number of the peer's FIN. Only the first call has an effect.
    fn set_fin_sequence(&mut self, seq: TcpSeqNumber);

    /// Blocks to report in a SACK option, the one containing the most recent segment first.
    fn sack_list(&self) -> Vec<SackBlock>;

    /// The number of blocks `sack_list` returns.
    fn sack_list_len(&self) -> usize;

    /// Create an independent copy with the same content.
    fn fork(&self) -> Box<dyn ReceiveBuffer>;
}

/// Data taken from a send buffer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxSegment {
    /// The first sequence number of the data.
    pub seq: TcpSeqNumber,
    /// The bytes to send, possibly less than requested.
    pub data: Vec<u8>,
    /// Some of the data was sent before.
    pub retransmission: bool,
}

/// One sent segment on the scoreboard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct SentItem {
    start: TcpSeqNumber,
    len: usize,
    sacked: bool,
    lost: bool,
    retrans: bool,
}

/// The reference send buffer.
///
/// Holds all unacknowledged and unsent bytes in one queue. Sent bytes are additionally tracked as
/// a list of segments, in the granularity in which they were first transmitted.
#[derive(Clone, Debug)]
pub struct TxBuffer {
    data: VecDeque<u8>,
    head: TcpSeqNumber,
    /// Contiguous from `head`, never longer than `data`.
    sent: VecDeque<SentItem>,
    max_size: usize,
    segment_size: usize,
    dup_ack_thresh: u32,
}

/// The reference receive buffer.
#[derive(Clone, Debug)]
pub struct RxBuffer {
    next: TcpSeqNumber,
    /// Anchor of the offsets used as keys of `out_of_order`, moved along with `next`.
    base: TcpSeqNumber,
    /// In-order data not yet read.
    data: VecDeque<u8>,
    out_of_order: BTreeMap<usize, Vec<u8>>,
    out_of_order_len: usize,
    max_size: usize,
    fin: Option<TcpSeqNumber>,
    sack: Vec<SackBlock>,
}

impl SentItem {
    fn new(start: TcpSeqNumber, len: usize) -> Self {
        SentItem {
            start,
            len,
            sacked: false,
            lost: false,
            retrans: false,
        }
    }

    fn end(&self) -> TcpSeqNumber {
        self.start + self.len
    }

    fn contains(&self, seq: TcpSeqNumber) -> bool {
        self.start <= seq && seq < self.end()
    }

    /// Contribution to the pipe.
    fn in_flight(&self) -> usize {
        if !self.sacked && (self.retrans || !self.lost) {
            self.len
        } else {
            0
        }
    }
}

impl TxBuffer {
    const DEFAULT_DUP_ACK_THRESH: u32 = 3;

    /// An empty buffer of `max_size` bytes.
    pub fn new(max_size: usize, segment_size: usize) -> Self {
        TxBuffer {
            data: VecDeque::new(),
            head: TcpSeqNumber::default(),
            sent: VecDeque::new(),
            max_size,
            segment_size,
            dup_ack_thresh: Self::DEFAULT_DUP_ACK_THRESH,
        }
    }

    fn tail(&self) -> TcpSeqNumber {
        self.head + self.data.len()
    }

    fn sent_end(&self) -> TcpSeqNumber {
        self.sent.back().map_or(self.head, SentItem::end)
    }

    /// Ensure that no sent item straddles `seq`.
    fn split_at(&mut self, seq: TcpSeqNumber) {
        let idx = match self.sent.iter().position(|item| item.start < seq && seq < item.end()) {
            Some(idx) => idx,
            None => return,
        };
        let first = seq - self.sent[idx].start;
        let mut second = self.sent[idx];
        second.start = seq;
        second.len -= first;
        self.sent[idx].len = first;
        self.sent.insert(idx + 1, second);
    }

    /// Sacked segments above the item, the input of the loss heuristic.
    fn lost_by_sacks(&self, sacked_segments: u32, sacked_bytes: usize) -> bool {
        sacked_segments >= self.dup_ack_thresh
            || sacked_bytes > (self.dup_ack_thresh.saturating_sub(1) as usize) * self.segment_size
    }

    /// Set the loss flag of every segment the scoreboard now considers lost.
    fn mark_lost_by_sacks(&mut self) {
        let mut sacked_segments = 0u32;
        let mut sacked_bytes = 0usize;
        for idx in (0..self.sent.len()).rev() {
            let item = self.sent[idx];
            if item.sacked {
                sacked_segments += 1;
                sacked_bytes += item.len;
            } else if !item.lost && self.lost_by_sacks(sacked_segments, sacked_bytes) {
                self.sent[idx].lost = true;
            }
        }
    }

    /// Bytes that were sent at least once.
    pub fn sent_size(&self) -> usize {
        self.sent.iter().map(|item| item.len).sum()
    }
}

impl SendBuffer for TxBuffer {
    fn add(&mut self, data: &[u8]) -> bool {
        if data.len() > self.available() {
            return false;
        }
        self.data.extend(data);
        true
    }

    fn head_sequence(&self) -> TcpSeqNumber {
        self.head
    }

    fn set_head_sequence(&mut self, seq: TcpSeqNumber) {
        if !self.sent.is_empty() {
            net_warn!("moving the head sequence of a buffer with sent data to {}", seq);
            self.sent.clear();
        }
        self.head = seq;
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn size_from_sequence(&self, seq: TcpSeqNumber) -> usize {
        if seq < self.head {
            return self.data.len();
        }
        self.tail().saturating_sub(seq)
    }

    fn available(&self) -> usize {
        self.max_size.saturating_sub(self.data.len())
    }

    fn max_buffer_size(&self) -> usize {
        self.max_size
    }

    fn set_max_buffer_size(&mut self, size: usize) {
        self.max_size = size;
    }

    fn set_segment_size(&mut self, size: usize) {
        self.segment_size = size;
    }

    fn set_dup_ack_thresh(&mut self, thresh: u32) {
        self.dup_ack_thresh = thresh;
    }

    fn copy_from_sequence(&mut self, max: usize, seq: TcpSeqNumber) -> TxSegment {
        if seq < self.head {
            net_warn!("requested data at {} before the head {}", seq, self.head);
            return TxSegment { seq, data: Vec::new(), retransmission: false };
        }

        let offset = seq - self.head;
        let len = max.min(self.data.len().saturating_sub(offset));
        let data: Vec<u8> = self.data.iter().skip(offset).take(len).copied().collect();
        let end = seq + len;
        let sent_end = self.sent_end();

        let mut retransmission = false;
        if len > 0 && seq < sent_end {
            retransmission = true;
            self.split_at(seq);
            self.split_at(end.min(sent_end));
            self.sent.iter_mut()
                .filter(|item| seq <= item.start && item.end() <= end)
                .for_each(|item| item.retrans = true);
        }

        if end > sent_end {
            self.sent.push_back(SentItem::new(sent_end, end - sent_end));
        }

        TxSegment { seq, data, retransmission }
    }

    fn discard_up_to(&mut self, ack: TcpSeqNumber) {
        if ack <= self.head {
            return;
        }

        let count = (ack - self.head).min(self.data.len());
        let head = self.head + count;
        self.data.drain(..count);
        self.split_at(head);
        while self.sent.front().map_or(false, |item| item.end() <= head) {
            self.sent.pop_front();
        }
        self.head = head;
    }

    fn next_seg(&self, enable_rule3: bool) -> Option<TcpSeqNumber> {
        let mut rule3 = None;
        for item in self.sent.iter().filter(|item| !item.sacked && !item.retrans) {
            // Rule 1, the lowest unsacked lost segment.
            if item.lost {
                return Some(item.start);
            }
            rule3 = rule3.or(Some(item.start));
        }

        // Rule 2, new data.
        let sent_end = self.sent_end();
        if self.size_from_sequence(sent_end) > 0 {
            return Some(sent_end);
        }

        if enable_rule3 {
            rule3
        } else {
            None
        }
    }

    fn is_lost(&self, seq: TcpSeqNumber) -> bool {
        let idx = match self.sent.iter().position(|item| item.contains(seq)) {
            Some(idx) => idx,
            None => return false,
        };
        let item = &self.sent[idx];
        if item.lost {
            return true;
        }
        if item.sacked {
            return false;
        }

        let above = self.sent.iter().skip(idx + 1).filter(|item| item.sacked);
        let (segments, bytes) = above.fold((0, 0), |(segments, bytes), item| {
            (segments + 1, bytes + item.len)
        });
        self.lost_by_sacks(segments, bytes)
    }

    fn mark_head_as_lost(&mut self) {
        if let Some(head) = self.sent.front_mut() {
            // A sacked head would have been cumulatively acknowledged, the peer reneged.
            head.sacked = false;
            head.retrans = false;
            head.lost = true;
        }
    }

    fn add_reno_sack(&mut self) {
        // The head itself is never sacked, it is what the duplicate acknowledgements ask for.
        if let Some(item) = self.sent.iter_mut().skip(1).find(|item| !item.sacked) {
            item.sacked = true;
        }
    }

    fn reset_reno_sack(&mut self) {
        self.sent.iter_mut().for_each(|item| item.sacked = false);
    }

    fn update(&mut self, blocks: &[SackBlock]) -> bool {
        let mut modified = false;
        for &(left, right) in blocks {
            if !(left < right) || right <= self.head {
                net_debug!("ignoring sack block [{};{}]", left, right);
                continue;
            }
            for item in self.sent.iter_mut() {
                if !item.sacked && left <= item.start && item.end() <= right {
                    item.sacked = true;
                    item.lost = false;
                    modified = true;
                }
            }
        }

        if modified {
            self.mark_lost_by_sacks();
        }
        modified
    }

    fn sacked(&self) -> usize {
        self.sent.iter().filter(|item| item.sacked).map(|item| item.len).sum()
    }

    fn bytes_in_flight(&self) -> usize {
        self.sent.iter().map(SentItem::in_flight).sum()
    }

    fn set_sent_list_lost(&mut self, reset_sack: bool) {
        for item in self.sent.iter_mut() {
            if reset_sack {
                item.sacked = false;
            }
            if !item.sacked {
                item.lost = true;
            }
            item.retrans = false;
        }
    }

    fn delete_retransmitted_flag_from_head(&mut self) {
        if let Some(head) = self.sent.front_mut() {
            head.retrans = false;
        }
    }

    fn is_head_retransmitted(&self) -> bool {
        self.sent.front().map_or(false, |head| head.retrans)
    }

    fn fork(&self) -> Box<dyn SendBuffer> {
        Box::new(self.clone())
    }
}

impl RxBuffer {
    /// The most blocks kept for SACK options.
    pub const MAX_SACK_BLOCKS: usize = 4;

    /// An empty buffer with a window of `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        RxBuffer {
            next: TcpSeqNumber::default(),
            base: TcpSeqNumber::default(),
            data: VecDeque::new(),
            out_of_order: BTreeMap::new(),
            out_of_order_len: 0,
            max_size,
            fin: None,
            sack: Vec::new(),
        }
    }

    fn offset(&self, seq: TcpSeqNumber) -> usize {
        seq - self.base
    }

    /// Store the parts of `bytes` not already present, returning their length.
    fn insert(&mut self, start: usize, bytes: &[u8]) -> usize {
        let end = start + bytes.len();
        let mut cursor = start;
        let mut gaps = Vec::new();
        for (&at, chunk) in self.out_of_order.range(..end) {
            let chunk_end = at + chunk.len();
            if chunk_end <= start {
                continue;
            }
            if at > cursor {
                gaps.push((cursor, at));
            }
            cursor = cursor.max(chunk_end);
        }
        if cursor < end {
            gaps.push((cursor, end));
        }

        let mut new = 0;
        for (from, to) in gaps {
            self.out_of_order.insert(from, bytes[from - start..to - start].to_vec());
            new += to - from;
        }
        self.out_of_order_len += new;
        new
    }

    /// Move contiguous data to the in-order queue.
    fn advance(&mut self) {
        loop {
            let offset = self.offset(self.next);
            let first = match self.out_of_order.keys().next() {
                Some(&first) if first <= offset => first,
                _ => break,
            };
            let chunk = match self.out_of_order.remove(&first) {
                Some(chunk) => chunk,
                None => break,
            };
            self.out_of_order_len -= chunk.len();
            let skip = offset - first;
            if chunk.len() > skip {
                self.next += chunk.len() - skip;
                self.data.extend(&chunk[skip..]);
            }
        }

        self.rebase();
        if self.fin == Some(self.next) {
            self.next += 1;
        }
    }

    /// Re-anchor offsets at the next expected byte.
    ///
    /// Offsets are relative to `base` and must stay within one window, otherwise the sequence
    /// distance overflows on long streams.
    fn rebase(&mut self) {
        let shift = self.next - self.base;
        if shift == 0 {
            return;
        }
        self.base = self.next;
        if !self.out_of_order.is_empty() {
            let chunks = core::mem::replace(&mut self.out_of_order, BTreeMap::new());
            self.out_of_order = chunks.into_iter()
                .map(|(at, chunk)| (at - shift, chunk))
                .collect();
        }
    }

    /// The contiguous out-of-order range containing `offset`.
    fn run_around(&self, offset: usize) -> Option<(usize, usize)> {
        let (&at, chunk) = self.out_of_order.range(..=offset).next_back()?;
        if at + chunk.len() <= offset {
            return None;
        }

        let mut start = at;
        for (&at, chunk) in self.out_of_order.range(..start).rev() {
            if at + chunk.len() != start {
                break;
            }
            start = at;
        }

        let mut end = at + chunk.len();
        for (&at, chunk) in self.out_of_order.range(end..) {
            if at != end {
                break;
            }
            end = at + chunk.len();
        }
        Some((start, end))
    }

    fn update_sack_list(&mut self, seq: TcpSeqNumber) {
        let (start, end) = match self.run_around(self.offset(seq)) {
            Some(run) => run,
            None => return,
        };
        let block = (self.base + start, self.base + end);
        self.sack.retain(|&(left, right)| right < block.0 || left > block.1);
        self.sack.insert(0, block);
        self.sack.truncate(Self::MAX_SACK_BLOCKS);
    }
}

impl ReceiveBuffer for RxBuffer {
    fn add(&mut self, seq: TcpSeqNumber, payload: &[u8]) -> bool {
        let mut head = seq;
        let mut tail = seq + payload.len();
        tail = tail.min(self.max_rx_sequence());
        if let Some(fin) = self.fin {
            tail = tail.min(fin);
        }
        head = head.max(self.next);
        if !(head < tail) {
            net_debug!("segment [{};{}) outside of window [{};{})",
                seq, seq + payload.len(), self.next, self.max_rx_sequence());
            return false;
        }

        let bytes = &payload[head - seq..tail - seq];
        let start = self.offset(head);
        if self.insert(start, bytes) == 0 {
            return false;
        }
        self.advance();

        if head > self.next {
            self.update_sack_list(head);
        }
        let next = self.next;
        self.sack.retain(|&(_, right)| right > next);
        true
    }

    fn next_rx_sequence(&self) -> TcpSeqNumber {
        self.next
    }

    fn set_next_rx_sequence(&mut self, seq: TcpSeqNumber) {
        self.next = seq;
        self.base = seq;
        self.out_of_order.clear();
        self.out_of_order_len = 0;
        self.sack.clear();
    }

    fn max_rx_sequence(&self) -> TcpSeqNumber {
        self.next + self.max_size.saturating_sub(self.data.len())
    }

    fn size(&self) -> usize {
        self.data.len() + self.out_of_order_len
    }

    fn available(&self) -> usize {
        self.data.len()
    }

    fn max_buffer_size(&self) -> usize {
        self.max_size
    }

    fn set_max_buffer_size(&mut self, size: usize) {
        self.max_size = size;
    }

    fn extract(&mut self, max: usize) -> Vec<u8> {
        let count = max.min(self.data.len());
        let (front, back) = self.data.as_slices();
        let split = count.min(front.len());
        let mut out = Vec::with_capacity(count);
        out.extend_from_slice(&front[..split]);
        out.extend_from_slice(&back[..count - split]);
        self.data.drain(..count);
        out
    }

    fn finished(&self) -> bool {
        self.fin.map_or(false, |fin| fin < self.next)
    }

    fn got_fin(&self) -> bool {
        self.fin.is_some()
    }

    fn set_fin_sequence(&mut self, seq: TcpSeqNumber) {
        if self.fin.is_some() {
            return;
        }
        self.fin = Some(seq);
        if self.next == seq {
            self.next += 1;
        }
    }

    fn sack_list(&self) -> Vec<SackBlock> {
        self.sack.clone()
    }

    fn sack_list_len(&self) -> usize {
        self.sack.len()
    }

    fn fork(&self) -> Box<dyn ReceiveBuffer> {
        Box::new(self.clone())
    }
}
