//! The option codec of the segment header.
//!
//! Every option is one variant of [`TcpOption`]; the [`Kind`] registry maps the kind byte on the
//! wire to the variant that decodes it. Kinds outside the registry are wrapped as
//! [`TcpOption::Unknown`] and forwarded unchanged instead of being dropped.
//!
//! [`TcpOption`]: enum.TcpOption.html
//! [`Kind`]: enum.Kind.html
//! [`TcpOption::Unknown`]: enum.TcpOption.html#variant.Unknown
use core::fmt;
use byteorder::{ByteOrder, NetworkEndian};

use crate::time::{Duration, Instant};
use super::{Error, Result};
use super::tcp::SeqNumber;

/// The maximum number of octets all options of one header may occupy.
pub const MAX_OPTIONS_LEN: usize = 40;

enum_with_unknown! {
    /// The kind byte of an option.
    pub doc enum Kind(u8) {
        /// End of option list.
        End = 0,
        /// Padding between options.
        NoOp = 1,
        /// Maximum segment size, RFC 793.
        MaxSegmentSize = 2,
        /// Window scale shift, RFC 7323.
        WindowScale = 3,
        /// Selective acknowledgements permitted, RFC 2018.
        SackPermitted = 4,
        /// Selective acknowledgement blocks, RFC 2018.
        Sack = 5,
        /// Timestamps, RFC 7323.
        Timestamp = 8,
    }
}

impl Kind {
    /// Query whether a kind byte belongs to one of the options we decode ourselves.
    ///
    /// `Unknown` is never known, even though it has a codec: it only wraps and preserves.
    pub fn is_known(kind: u8) -> bool {
        match Kind::from(kind) {
            Kind::Unknown(_) => false,
            _ => true,
        }
    }

    /// The fixed encoded size of the option kind, if it has one.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            Kind::End | Kind::NoOp => Some(1),
            Kind::MaxSegmentSize => Some(4),
            Kind::WindowScale => Some(3),
            Kind::SackPermitted => Some(2),
            Kind::Timestamp => Some(10),
            Kind::Sack | Kind::Unknown(_) => None,
        }
    }
}

/// Query whether a kind byte belongs to one of the options we decode ourselves.
pub fn is_kind_known(kind: u8) -> bool {
    Kind::is_known(kind)
}

/// A selectively acknowledged range of sequence space, `[left, right)`.
pub type SackBlock = (SeqNumber, SeqNumber);

/// The blocks of a selective acknowledgement option.
///
/// Blocks keep the order in which they were added; the first block is the one a receiver should
/// report first (the most recently changed one), so the list is never sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SackBlocks {
    blocks: Vec<SackBlock>,
}

impl SackBlocks {
    /// Create an empty block list.
    pub fn new() -> Self {
        SackBlocks::default()
    }

    /// Append a block at the end of the list.
    pub fn add_block(&mut self, block: SackBlock) {
        self.blocks.push(block);
    }

    /// Remove all blocks.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// The blocks, in insertion order.
    pub fn blocks(&self) -> &[SackBlock] {
        &self.blocks
    }

    /// The number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Query whether there are any blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl From<Vec<SackBlock>> for SackBlocks {
    fn from(blocks: Vec<SackBlock>) -> Self {
        SackBlocks { blocks }
    }
}

/// A representation of a single option.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum TcpOption {
    /// End of the option list, everything after is padding.
    End,
    /// One byte of padding.
    NoOp,
    /// The largest segment the sender is willing to receive.
    MaxSegmentSize(u16),
    /// The window scale shift of the sender.
    WindowScale(u8),
    /// The sender understands selective acknowledgements.
    SackPermitted,
    /// Selectively acknowledged blocks.
    Sack(SackBlocks),
    /// A timestamp and the echo of the most recent peer timestamp.
    Timestamp {
        /// `TSval`, the clock of the sender.
        value: u32,
        /// `TSecr`, the echoed peer clock.
        echo: u32,
    },
    /// An option whose kind we do not interpret, preserved raw.
    Unknown {
        /// The kind byte.
        kind: u8,
        /// The content following the kind and length bytes.
        data: Vec<u8>,
    },
}

impl TcpOption {
    /// Parse one option from the front of the buffer.
    ///
    /// Returns the remaining buffer after the option. A kind whose length byte disagrees with its
    /// registered size, or an unknown kind with a length outside `[2, 40]`, is `Malformed`.
    pub fn parse(buffer: &[u8]) -> Result<(&[u8], TcpOption)> {
        let kind = *buffer.get(0).ok_or(Error::Truncated)?;
        let (length, option) = match Kind::from(kind) {
            Kind::End => (1, TcpOption::End),
            Kind::NoOp => (1, TcpOption::NoOp),
            known => {
                let length = *buffer.get(1).ok_or(Error::Truncated)? as usize;
                if length < 2 {
                    net_warn!("option of kind {} with impossible length {}", kind, length);
                    return Err(Error::Malformed);
                }
                if let Some(fixed) = known.fixed_len() {
                    if fixed != length {
                        net_warn!("malformed option of kind {}: length {}", kind, length);
                        return Err(Error::Malformed);
                    }
                }
                let data = buffer.get(2..length).ok_or(Error::Truncated)?;
                let option = match known {
                    Kind::MaxSegmentSize =>
                        TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data)),
                    Kind::WindowScale =>
                        TcpOption::WindowScale(data[0]),
                    Kind::SackPermitted =>
                        TcpOption::SackPermitted,
                    Kind::Timestamp => TcpOption::Timestamp {
                        value: NetworkEndian::read_u32(&data[0..4]),
                        echo: NetworkEndian::read_u32(&data[4..8]),
                    },
                    Kind::Sack => {
                        if data.len() % 8 != 0 {
                            net_warn!("malformed sack option: length {}", length);
                            return Err(Error::Malformed);
                        }
                        let blocks = data.chunks(8)
                            .map(|block| (
                                SeqNumber(NetworkEndian::read_i32(&block[0..4])),
                                SeqNumber(NetworkEndian::read_i32(&block[4..8]))))
                            .collect::<Vec<_>>();
                        TcpOption::Sack(blocks.into())
                    },
                    Kind::Unknown(_) => {
                        if length > MAX_OPTIONS_LEN {
                            net_warn!("unknown option of kind {} with apparent size {}", kind, length);
                            return Err(Error::Malformed);
                        }
                        net_warn!("option kind {} unknown, preserving it", kind);
                        TcpOption::Unknown { kind, data: data.to_vec() }
                    },
                    Kind::End | Kind::NoOp => unreachable!(),
                };
                (length, option)
            }
        };
        Ok((&buffer[length..], option))
    }

    /// The kind of this option.
    pub fn kind(&self) -> Kind {
        match self {
            TcpOption::End => Kind::End,
            TcpOption::NoOp => Kind::NoOp,
            TcpOption::MaxSegmentSize(_) => Kind::MaxSegmentSize,
            TcpOption::WindowScale(_) => Kind::WindowScale,
            TcpOption::SackPermitted => Kind::SackPermitted,
            TcpOption::Sack(_) => Kind::Sack,
            TcpOption::Timestamp { .. } => Kind::Timestamp,
            TcpOption::Unknown { kind, .. } => Kind::Unknown(*kind),
        }
    }

    /// The number of octets the option occupies on the wire.
    pub fn buffer_len(&self) -> usize {
        match self {
            TcpOption::Sack(blocks) => 2 + 8*blocks.len(),
            TcpOption::Unknown { data, .. } => 2 + data.len(),
            other => other.kind().fixed_len().unwrap_or(0),
        }
    }

    /// Write the option to the front of the buffer and return the rest.
    ///
    /// # Panics
    /// This function panics if the buffer is shorter than `buffer_len`.
    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
        let length = self.buffer_len();
        buffer[0] = u8::from(self.kind());
        if length > 1 {
            buffer[1] = length as u8;
        }
        match self {
            TcpOption::End | TcpOption::NoOp | TcpOption::SackPermitted => (),
            TcpOption::MaxSegmentSize(value) =>
                NetworkEndian::write_u16(&mut buffer[2..4], *value),
            TcpOption::WindowScale(value) =>
                buffer[2] = *value,
            TcpOption::Timestamp { value, echo } => {
                NetworkEndian::write_u32(&mut buffer[2..6], *value);
                NetworkEndian::write_u32(&mut buffer[6..10], *echo);
            },
            TcpOption::Sack(blocks) => {
                for (i, (left, right)) in blocks.blocks().iter().enumerate() {
                    let pos = 2 + i*8;
                    NetworkEndian::write_i32(&mut buffer[pos..pos + 4], left.0);
                    NetworkEndian::write_i32(&mut buffer[pos + 4..pos + 8], right.0);
                }
            },
            TcpOption::Unknown { data, .. } =>
                buffer[2..length].copy_from_slice(data),
        }
        &mut buffer[length..]
    }

    /// Compute the number of SACK blocks that fit next to options of the given length.
    pub fn sack_blocks_allowed(options_len: usize) -> usize {
        MAX_OPTIONS_LEN.saturating_sub(options_len).saturating_sub(2) / 8
    }
}

impl fmt::Display for TcpOption {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TcpOption::End => write!(f, "EOL"),
            TcpOption::NoOp => write!(f, "NOP"),
            TcpOption::MaxSegmentSize(mss) => write!(f, "MSS:{}", mss),
            TcpOption::WindowScale(scale) => write!(f, "WS:{}", scale),
            TcpOption::SackPermitted => write!(f, "SACK_PERM"),
            TcpOption::Sack(blocks) => {
                write!(f, "SACK blocks: {},", blocks.len())?;
                for (left, right) in blocks.blocks() {
                    write!(f, "[{},{}]", left, right)?;
                }
                Ok(())
            },
            TcpOption::Timestamp { value, echo } => write!(f, "TS:{};{}", value, echo),
            TcpOption::Unknown { kind, data } => write!(f, "UNKNOWN({}):{} bytes", kind, data.len()),
        }
    }
}

/// The timestamp option clock value for a point in logical time.
///
/// The clock ticks in milliseconds and wraps at 2<sup>32</sup>.
pub(crate) fn ts_value(now: Instant) -> u32 {
    now.total_millis() as u64 as u32
}

/// Time elapsed since a timestamp echoed back to us.
///
/// An echo from the future (or one that wrapped) yields zero.
pub(crate) fn elapsed_from_ts_value(now: Instant, echo: u32) -> Duration {
    let now = ts_value(now);
    if now > echo {
        Duration::from_millis(u64::from(now - echo))
    } else {
        Duration::from_millis(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    macro_rules! assert_option_parses {
        ($opt:expr, $data:expr) => ({
            let opt = $opt;
            assert_eq!(TcpOption::parse($data), Ok((&[][..], opt.clone())));
            let buffer = &mut [0; 40][..opt.buffer_len()];
            assert_eq!(opt.emit(buffer), &mut []);
            assert_eq!(&*buffer, $data);
        })
    }

    #[test]
    fn options() {
        assert_option_parses!(TcpOption::End,
                              &[0x00]);
        assert_option_parses!(TcpOption::NoOp,
                              &[0x01]);
        assert_option_parses!(TcpOption::MaxSegmentSize(1500),
                              &[0x02, 0x04, 0x05, 0xdc]);
        assert_option_parses!(TcpOption::WindowScale(12),
                              &[0x03, 0x03, 0x0c]);
        assert_option_parses!(TcpOption::SackPermitted,
                              &[0x4, 0x02]);
        assert_option_parses!(TcpOption::Timestamp { value: 0x0102_0304, echo: 7 },
                              &[0x08, 0x0a,
                                0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x07]);
        assert_option_parses!(TcpOption::Sack(vec![(SeqNumber(500), SeqNumber(1500))].into()),
                              &[0x05, 0x0a,
                                0x00, 0x00, 0x01, 0xf4, 0x00, 0x00, 0x05, 0xdc]);
        assert_option_parses!(TcpOption::Sack(vec![
                                (SeqNumber(1500), SeqNumber(2500)),
                                (SeqNumber(875), SeqNumber(1225))].into()),
                              &[0x05, 0x12,
                                0x00, 0x00, 0x05, 0xdc, 0x00, 0x00, 0x09, 0xc4,
                                0x00, 0x00, 0x03, 0x6b, 0x00, 0x00, 0x04, 0xc9]);
        assert_option_parses!(TcpOption::Unknown { kind: 12, data: vec![1, 2, 3] },
                              &[0x0c, 0x05, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn malformed_options() {
        assert_eq!(TcpOption::parse(&[]),
                   Err(Error::Truncated));
        assert_eq!(TcpOption::parse(&[0xc]),
                   Err(Error::Truncated));
        assert_eq!(TcpOption::parse(&[0xc, 0x05, 0x01, 0x02]),
                   Err(Error::Truncated));
        assert_eq!(TcpOption::parse(&[0xc, 0x00]),
                   Err(Error::Malformed));
        assert_eq!(TcpOption::parse(&[0xc, 0x01]),
                   Err(Error::Malformed));
        assert_eq!(TcpOption::parse(&[0x2, 0x02]),
                   Err(Error::Malformed));
        assert_eq!(TcpOption::parse(&[0x3, 0x02]),
                   Err(Error::Malformed));
        assert_eq!(TcpOption::parse(&[0x8, 0x08, 0, 0, 0, 0, 0, 0]),
                   Err(Error::Malformed));
        assert_eq!(TcpOption::parse(&[0x5, 0x05, 0, 0, 0]),
                   Err(Error::Malformed));
    }

    #[test]
    fn unknown_option_too_long() {
        let mut bytes = [0u8; 42];
        bytes[0] = 0x22;
        bytes[1] = 41;
        assert_eq!(TcpOption::parse(&bytes), Err(Error::Malformed));
    }

    #[test]
    fn known_kinds() {
        for &kind in &[0u8, 1, 2, 3, 4, 5, 8] {
            assert!(is_kind_known(kind), "kind {}", kind);
        }
        for &kind in &[6u8, 7, 9, 30, 0xff] {
            assert!(!is_kind_known(kind), "kind {}", kind);
        }
    }

    #[test]
    fn sack_keeps_insertion_order() {
        let mut blocks = SackBlocks::new();
        blocks.add_block((SeqNumber(30), SeqNumber(40)));
        blocks.add_block((SeqNumber(10), SeqNumber(20)));
        assert_eq!(blocks.blocks()[0], (SeqNumber(30), SeqNumber(40)));
        assert_eq!(blocks.len(), 2);
        blocks.clear();
        assert!(blocks.is_empty());
    }

    #[test]
    fn sack_space() {
        assert_eq!(TcpOption::sack_blocks_allowed(0), 4);
        assert_eq!(TcpOption::sack_blocks_allowed(10), 3);
        assert_eq!(TcpOption::sack_blocks_allowed(40), 0);
    }

    #[test]
    fn timestamp_clock() {
        let now = Instant::from_millis(1500);
        assert_eq!(ts_value(now), 1500);
        assert_eq!(elapsed_from_ts_value(now, 1000), Duration::from_millis(500));
        assert_eq!(elapsed_from_ts_value(now, 2000), Duration::from_millis(0));
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", TcpOption::MaxSegmentSize(536)), "MSS:536");
        assert_eq!(format!("{}", TcpOption::Timestamp { value: 1, echo: 2 }), "TS:1;2");
        let sack = TcpOption::Sack(vec![(SeqNumber(1), SeqNumber(5))].into());
        assert_eq!(format!("{}", sack), "SACK blocks: 1,[1,5]");
    }
}
