//! The segment codec.
//!
//! The header extends the classic layout by three opaque 16-bit fields (the caravan fields)
//! directly after the ports. They are carried unchanged and never interpreted. The 4-bit data
//! offset counts the classic 20 octets plus options, so the header occupies six octets more on
//! the wire than the data offset states:
//!
//! ```text
//!  0      2      4      6      8      10            14            18     20     22     24     26
//! +------+------+------+------+------+-------------+-------------+------+------+------+------+---
//! | src  | dst  | ca id| ca bl| ca sz|   seq num   |   ack num   |off|fl| win  | csum | urg  | options
//! +------+------+------+------+------+-------------+-------------+------+------+------+------+---
//! ```
use core::{i32, ops, cmp, fmt};
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, IpAddress, IpProtocol, Result};
use super::ip::checksum;
use super::tcp_option::{Kind, TcpOption, MAX_OPTIONS_LEN};

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2<sup>32</sup>.
/// Sequence numbers do not have a discontiguity when compared pairwise across a signed overflow.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub i32);

impl SeqNumber {
    /// The later of two sequence numbers.
    pub fn max(self, other: SeqNumber) -> SeqNumber {
        if self > other { self } else { other }
    }

    /// The earlier of two sequence numbers.
    pub fn min(self, other: SeqNumber) -> SeqNumber {
        if self < other { self } else { other }
    }

    /// The distance from `earlier` up to `self`, or zero if `earlier` is in fact later.
    pub fn saturating_sub(self, earlier: SeqNumber) -> usize {
        if self > earlier { self - earlier } else { 0 }
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl From<u32> for SeqNumber {
    fn from(value: u32) -> Self {
        SeqNumber(value as i32)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to add to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_add(rhs as i32))
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to subtract to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_sub(rhs as i32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub for SeqNumber {
    type Output = usize;

    fn sub(self, rhs: SeqNumber) -> usize {
        let result = self.0.wrapping_sub(rhs.0);
        if result < 0 {
            panic!("attempt to subtract sequence numbers with underflow")
        }
        result as usize
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        self.0.wrapping_sub(other.0).partial_cmp(&0)
    }
}

/// A set of tcp flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Flags(pub u8);

impl Flags {
    /// No flags at all.
    pub const NONE: Flags = Flags(0x00);
    /// No more data from sender.
    pub const FIN: Flags = Flags(0x01);
    /// Synchronize sequence numbers.
    pub const SYN: Flags = Flags(0x02);
    /// Reset the connection.
    pub const RST: Flags = Flags(0x04);
    /// Push function.
    pub const PSH: Flags = Flags(0x08);
    /// Acknowledgment field significant.
    pub const ACK: Flags = Flags(0x10);
    /// Urgent pointer field significant.
    pub const URG: Flags = Flags(0x20);
    /// ECN echo, RFC 3168.
    pub const ECE: Flags = Flags(0x40);
    /// Congestion window reduced, RFC 3168.
    pub const CWR: Flags = Flags(0x80);

    const NAMES: [&'static str; 8] = ["FIN", "SYN", "RST", "PSH", "ACK", "URG", "ECE", "CWR"];

    /// Check if all flags of `other` are set.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if any flag of `other` is set.
    pub fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    /// Check if no flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check if FIN is set.
    pub fn fin(self) -> bool {
        self.contains(Flags::FIN)
    }

    /// Check if SYN is set.
    pub fn syn(self) -> bool {
        self.contains(Flags::SYN)
    }

    /// Check if RST is set.
    pub fn rst(self) -> bool {
        self.contains(Flags::RST)
    }

    /// Check if PSH is set.
    pub fn psh(self) -> bool {
        self.contains(Flags::PSH)
    }

    /// Check if ACK is set.
    pub fn ack(self) -> bool {
        self.contains(Flags::ACK)
    }

    /// Check if URG is set.
    pub fn urg(self) -> bool {
        self.contains(Flags::URG)
    }

    /// Check if ECE is set.
    pub fn ece(self) -> bool {
        self.contains(Flags::ECE)
    }

    /// Check if CWR is set.
    pub fn cwr(self) -> bool {
        self.contains(Flags::CWR)
    }

    /// Return the length of the control flags, in terms of sequence space.
    pub fn sequence_len(self) -> usize {
        usize::from(self.syn()) + usize::from(self.fin())
    }

    /// Render the set flags by their mnemonic, joined with `delimiter`.
    ///
    /// No flags at all renders as the empty string.
    pub fn to_string_with(self, delimiter: &str) -> String {
        let mut names = String::new();
        for (bit, name) in Self::NAMES.iter().enumerate() {
            if self.0 & (1 << bit) != 0 {
                if !names.is_empty() {
                    names.push_str(delimiter);
                }
                names.push_str(name);
            }
        }
        names
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl ops::Not for Flags {
    type Output = Flags;

    fn not(self) -> Flags {
        Flags(!self.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_string_with("|"))
    }
}

/// Render a flag byte by mnemonics, joined with `delimiter`.
pub fn flags_to_string(flags: u8, delimiter: &str) -> String {
    Flags(flags).to_string_with(delimiter)
}

mod field {
    #![allow(non_snake_case)]

    pub(crate) type Field = ::core::ops::Range<usize>;

    pub(crate) const SRC_PORT: Field = 0..2;
    pub(crate) const DST_PORT: Field = 2..4;
    pub(crate) const CARAVAN_ID: Field = 4..6;
    pub(crate) const CARAVAN_BLOCK: Field = 6..8;
    pub(crate) const CARAVAN_SIZE: Field = 8..10;
    pub(crate) const SEQ_NUM:  Field = 10..14;
    pub(crate) const ACK_NUM:  Field = 14..18;
    pub(crate) const FLAGS:    Field = 18..20;
    pub(crate) const WIN_SIZE: Field = 20..22;
    pub(crate) const CHECKSUM: Field = 22..24;
    pub(crate) const URGENT:   Field = 24..26;

    /// Octets on the wire not counted by the data offset.
    pub(crate) const CARAVAN_LEN: usize = CARAVAN_SIZE.end - CARAVAN_ID.start;

    pub(crate) fn OPTIONS(header_len: usize) -> Field {
        URGENT.end..header_len
    }
}

/// The length of the header without options, as it appears on the wire.
pub const HEADER_LEN: usize = field::URGENT.end;

/// The length of the header without options, as counted by the data offset.
pub(crate) const BASE_HEADER_LEN: usize = HEADER_LEN - field::CARAVAN_LEN;

/// The smallest permissible data offset, in words.
pub const MIN_DATA_OFFSET: u8 = (BASE_HEADER_LEN / 4) as u8;

/// The three opaque caravan fields.
///
/// Carried unchanged from decoding to encoding; the protocol entity does not interpret them.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct Caravan {
    /// Identifier of the caravan.
    pub id: u16,
    /// Identifier of the block within the caravan.
    pub block: u16,
    /// Size announced for the caravan.
    pub size: u16,
}

/// Abstraction for checksum behaviour.
///
/// The checksum requires calculating a pseudo header for the upper layer protocol consisting of
/// src and dst address.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Checksum {
    /// Always fill the checksum and check if it exists.
    Manual {
        src_addr: IpAddress,
        dst_addr: IpAddress,
    },

    /// Never inspect the checksum.
    ///
    /// This assumes that some layer below has already performed the necessary checks.
    Ignored,
}

impl Checksum {
    /// Check if a checksum should be calculated by the library.
    pub fn manual(self) -> bool {
        match self {
            Checksum::Manual { .. } => true,
            Checksum::Ignored => false,
        }
    }
}

/// A high-level representation of a segment header.
#[derive(Debug, PartialEq, Eq, Clone, Default, Hash)]
pub struct Repr {
    pub src_port:     u16,
    pub dst_port:     u16,
    pub caravan:      Caravan,
    pub seq_number:   SeqNumber,
    pub ack_number:   SeqNumber,
    pub flags:        Flags,
    pub window_len:   u16,
    pub urgent_at:    u16,
    options: Vec<TcpOption>,
    options_len: usize,
}

/// A decoded segment.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Segment<'a> {
    /// The decoded header.
    pub repr: Repr,
    /// The data following the header, located by the declared data offset.
    pub payload: &'a [u8],
    /// The number of octets consumed by the header.
    pub header_len: usize,
    /// Whether the checksum verified, always true when it was ignored.
    pub checksum_ok: bool,
}

impl Repr {
    /// A header between two ports with everything else zeroed.
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Repr {
            src_port,
            dst_port,
            ..Repr::default()
        }
    }

    /// Parse a segment and return a high-level representation with its payload.
    ///
    /// Option faults are not errors. A malformed option truncates the option list at that point,
    /// an `End` option turns the rest of the option space into padding. A data offset that does
    /// not agree with the decoded options is logged and otherwise ignored; the payload is always
    /// located by the declared offset.
    pub fn parse(bytes: &[u8], checksum: Checksum) -> Result<Segment<'_>> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }

        let word = NetworkEndian::read_u16(&bytes[field::FLAGS]);
        let data_offset = (word >> 12) as u8;
        if data_offset < MIN_DATA_OFFSET {
            return Err(Error::Malformed);
        }
        let header_len = usize::from(data_offset)*4 + field::CARAVAN_LEN;
        if bytes.len() < header_len {
            return Err(Error::Truncated);
        }

        let mut repr = Repr {
            src_port: NetworkEndian::read_u16(&bytes[field::SRC_PORT]),
            dst_port: NetworkEndian::read_u16(&bytes[field::DST_PORT]),
            caravan: Caravan {
                id: NetworkEndian::read_u16(&bytes[field::CARAVAN_ID]),
                block: NetworkEndian::read_u16(&bytes[field::CARAVAN_BLOCK]),
                size: NetworkEndian::read_u16(&bytes[field::CARAVAN_SIZE]),
            },
            seq_number: SeqNumber(NetworkEndian::read_i32(&bytes[field::SEQ_NUM])),
            ack_number: SeqNumber(NetworkEndian::read_i32(&bytes[field::ACK_NUM])),
            flags: Flags(word as u8),
            window_len: NetworkEndian::read_u16(&bytes[field::WIN_SIZE]),
            urgent_at: NetworkEndian::read_u16(&bytes[field::URGENT]),
            options: Vec::new(),
            options_len: 0,
        };

        let mut options = &bytes[field::OPTIONS(header_len)];
        if options.len() > MAX_OPTIONS_LEN {
            net_error!("illegal option length {}; options discarded", options.len());
            options = &[];
        }

        while !options.is_empty() {
            match TcpOption::parse(options) {
                Ok((_, TcpOption::End)) => break,
                Ok((rest, option)) => {
                    repr.options_len += option.buffer_len();
                    repr.options.push(option);
                    options = rest;
                },
                Err(err) => {
                    net_warn!("option did not decode ({}), dropping the rest of the list", err);
                    break;
                },
            }
        }

        if repr.data_offset() != data_offset {
            net_error!("mismatch between calculated data offset {} and header value {}",
                repr.data_offset(), data_offset);
        }

        let checksum_ok = match checksum {
            Checksum::Manual { src_addr, dst_addr } => {
                let sum = checksum::combine(&[
                    checksum::pseudo_header(&src_addr, &dst_addr, IpProtocol::Tcp, bytes.len() as u32),
                    checksum::data(bytes),
                ]);
                sum == !0
            },
            Checksum::Ignored => true,
        };

        Ok(Segment {
            repr,
            payload: &bytes[header_len..],
            header_len,
            checksum_ok,
        })
    }

    /// The options in the order they will be emitted.
    pub fn options(&self) -> &[TcpOption] {
        &self.options
    }

    /// Append an option.
    ///
    /// Returns `false` when the option kind is not one we know or when the option does not fit
    /// into the remaining option space. `End` is accepted but not stored, the list is terminated
    /// and padded automatically.
    pub fn push_option(&mut self, option: TcpOption) -> bool {
        let len = option.buffer_len();
        if self.options_len + len > MAX_OPTIONS_LEN {
            return false;
        }
        match option.kind() {
            Kind::Unknown(kind) => {
                net_warn!("the option kind {} is unknown", kind);
                false
            },
            Kind::End => true,
            _ => {
                self.options.push(option);
                self.options_len += len;
                true
            },
        }
    }

    /// Remove all options.
    pub fn clear_options(&mut self) {
        self.options.clear();
        self.options_len = 0;
    }

    /// Find the first option of a kind.
    pub fn option(&self, kind: Kind) -> Option<&TcpOption> {
        self.options.iter().find(|option| option.kind() == kind)
    }

    /// Check whether an option of the kind is present.
    pub fn has_option(&self, kind: Kind) -> bool {
        self.option(kind).is_some()
    }

    /// The octets occupied by options, excluding padding.
    pub fn options_len(&self) -> usize {
        self.options_len
    }

    /// The octets occupied by options including padding to a 4-octet boundary.
    pub fn padded_options_len(&self) -> usize {
        (self.options_len + 3) & !3
    }

    /// The value of the data offset field in 4-octet words.
    pub fn data_offset(&self) -> u8 {
        ((BASE_HEADER_LEN + self.padded_options_len()) / 4) as u8
    }

    /// Return the length of a header that will be emitted from this high-level representation.
    pub fn header_len(&self) -> usize {
        HEADER_LEN + self.padded_options_len()
    }

    /// Return the length of the segment with a payload, in terms of sequence space.
    pub fn sequence_len(&self, payload_len: usize) -> usize {
        payload_len + self.flags.sequence_len()
    }

    /// Emit the header into the front of a buffer that already holds the payload behind it.
    ///
    /// The checksum, if requested, covers the full buffer.
    ///
    /// # Panics
    /// This function panics if the buffer is shorter than `header_len`.
    pub fn emit(&self, buffer: &mut [u8], checksum: Checksum) {
        let header_len = self.header_len();
        NetworkEndian::write_u16(&mut buffer[field::SRC_PORT], self.src_port);
        NetworkEndian::write_u16(&mut buffer[field::DST_PORT], self.dst_port);
        NetworkEndian::write_u16(&mut buffer[field::CARAVAN_ID], self.caravan.id);
        NetworkEndian::write_u16(&mut buffer[field::CARAVAN_BLOCK], self.caravan.block);
        NetworkEndian::write_u16(&mut buffer[field::CARAVAN_SIZE], self.caravan.size);
        NetworkEndian::write_i32(&mut buffer[field::SEQ_NUM], self.seq_number.0);
        NetworkEndian::write_i32(&mut buffer[field::ACK_NUM], self.ack_number.0);
        // The reserved bits between offset and flags are always zero.
        let word = u16::from(self.data_offset()) << 12 | u16::from(self.flags.0);
        NetworkEndian::write_u16(&mut buffer[field::FLAGS], word);
        NetworkEndian::write_u16(&mut buffer[field::WIN_SIZE], self.window_len);
        NetworkEndian::write_u16(&mut buffer[field::CHECKSUM], 0);
        NetworkEndian::write_u16(&mut buffer[field::URGENT], self.urgent_at);

        {
            let mut options = &mut buffer[field::OPTIONS(header_len)];
            for option in &self.options {
                let tmp = options; options = option.emit(tmp);
            }
            // Pad with end of list octets.
            for octet in options.iter_mut() {
                *octet = u8::from(Kind::End);
            }
        }

        if let Checksum::Manual { src_addr, dst_addr } = checksum {
            let sum = !checksum::combine(&[
                checksum::pseudo_header(&src_addr, &dst_addr, IpProtocol::Tcp, buffer.len() as u32),
                checksum::data(buffer),
            ]);
            NetworkEndian::write_u16(&mut buffer[field::CHECKSUM], sum);
        }
    }

    /// Encode header and payload into a new buffer.
    pub fn serialize(&self, payload: &[u8], checksum: Checksum) -> Vec<u8> {
        let header_len = self.header_len();
        let mut buffer = vec![0; header_len + payload.len()];
        buffer[header_len..].copy_from_slice(payload);
        self.emit(&mut buffer, checksum);
        buffer
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} > {}", self.src_port, self.dst_port)?;
        if !self.flags.is_empty() {
            write!(f, " [{}]", self.flags)?;
        }
        write!(f, " Seq={} Ack={} Win={}", self.seq_number, self.ack_number, self.window_len)?;
        write!(f, " CA-ID={} CA-BL={} CA-SZ={}",
            self.caravan.id, self.caravan.block, self.caravan.size)?;
        for option in &self.options {
            write!(f, " {}", option)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::wire::{Ipv4Address, TcpOption, SackBlocks};
    use super::*;

    const SRC_ADDR: Ipv4Address = Ipv4Address([192, 168, 1, 1]);
    const DST_ADDR: Ipv4Address = Ipv4Address([192, 168, 1, 2]);

    fn manual() -> Checksum {
        Checksum::Manual { src_addr: SRC_ADDR.into(), dst_addr: DST_ADDR.into() }
    }

    static SEGMENT_BYTES: [u8; 34] =
        [0xbf, 0x00, 0x00, 0x50,
         0x00, 0x01, 0x00, 0x02,
         0x00, 0x03,
         0x01, 0x23, 0x45, 0x67,
         0x89, 0xab, 0xcd, 0xef,
         0x60, 0x18, 0x01, 0x23,
         0x0b, 0x14, 0x00, 0x00,
         0x02, 0x04, 0x05, 0xb4,
         0xaa, 0x00, 0x00, 0xff];

    static PAYLOAD_BYTES: [u8; 4] =
        [0xaa, 0x00, 0x00, 0xff];

    fn segment_repr() -> Repr {
        let mut repr = Repr::new(48896, 80);
        repr.caravan = Caravan { id: 1, block: 2, size: 3 };
        repr.seq_number = SeqNumber(0x01234567);
        repr.ack_number = SeqNumber(0x89abcdefu32 as i32);
        repr.flags = Flags::ACK | Flags::PSH;
        repr.window_len = 0x0123;
        assert!(repr.push_option(TcpOption::MaxSegmentSize(1460)));
        repr
    }

    #[test]
    fn deconstruct() {
        let segment = Repr::parse(&SEGMENT_BYTES[..], manual()).unwrap();
        assert!(segment.checksum_ok);
        assert_eq!(segment.header_len, 30);
        assert_eq!(segment.payload, &PAYLOAD_BYTES[..]);
        assert_eq!(segment.repr, segment_repr());
        assert_eq!(segment.repr.data_offset(), 6);
    }

    #[test]
    fn construct() {
        let bytes = segment_repr().serialize(&PAYLOAD_BYTES, manual());
        assert_eq!(&bytes[..], &SEGMENT_BYTES[..]);
    }

    #[test]
    fn wrong_checksum() {
        let mut bytes = SEGMENT_BYTES;
        bytes[33] ^= 0x01;
        let segment = Repr::parse(&bytes[..], manual()).unwrap();
        assert!(!segment.checksum_ok);
        let segment = Repr::parse(&bytes[..], Checksum::Ignored).unwrap();
        assert!(segment.checksum_ok);
    }

    #[test]
    fn checksum_ipv6() {
        let checksum = Checksum::Manual {
            src_addr: IpAddress::v6(0xfe80, 0, 0, 0, 0, 0, 0, 1),
            dst_addr: IpAddress::v6(0xfe80, 0, 0, 0, 0, 0, 0, 2),
        };
        let bytes = segment_repr().serialize(&PAYLOAD_BYTES, checksum);
        assert!(Repr::parse(&bytes, checksum).unwrap().checksum_ok);
        assert!(!Repr::parse(&bytes, manual()).unwrap().checksum_ok);
    }

    #[test]
    fn truncated() {
        assert_eq!(Repr::parse(&SEGMENT_BYTES[..25], Checksum::Ignored), Err(Error::Truncated));
        // The declared header extends beyond the data.
        assert_eq!(Repr::parse(&SEGMENT_BYTES[..29], Checksum::Ignored), Err(Error::Truncated));
    }

    #[test]
    fn impossible_offset() {
        let mut bytes = SEGMENT_BYTES;
        bytes[18] = 0x40;
        assert_eq!(Repr::parse(&bytes[..], Checksum::Ignored), Err(Error::Malformed));
    }

    #[test]
    fn end_of_list_discards_padding() {
        let mut repr = segment_repr();
        repr.clear_options();
        assert!(repr.push_option(TcpOption::MaxSegmentSize(1460)));
        assert!(repr.push_option(TcpOption::NoOp));
        let mut bytes = repr.serialize(&PAYLOAD_BYTES, Checksum::Ignored);
        // Offset of 7 words: MSS, NOP, then an end of list followed by garbage.
        assert_eq!(bytes[18] >> 4, 7);
        assert_eq!(&bytes[26..34], &[0x02, 0x04, 0x05, 0xb4, 0x01, 0x00, 0x00, 0x00]);
        bytes[32] = 0xff;
        bytes[33] = 0xff;
        let segment = Repr::parse(&bytes, Checksum::Ignored).unwrap();
        assert_eq!(segment.repr.options(), &[TcpOption::MaxSegmentSize(1460), TcpOption::NoOp]);
        assert_eq!(segment.payload, &PAYLOAD_BYTES[..]);
    }

    #[test]
    fn offset_mismatch_is_lenient() {
        // Declares 7 words while the options only justify 6. Logged, not rejected.
        let mut bytes = vec![0; 38];
        bytes[..26].copy_from_slice(&SEGMENT_BYTES[..26]);
        bytes[18] = 0x70;
        bytes[26..34].copy_from_slice(&[0x02, 0x04, 0x05, 0xb4, 0x00, 0xde, 0xad, 0x00]);
        bytes[34..].copy_from_slice(&PAYLOAD_BYTES);
        let segment = Repr::parse(&bytes, Checksum::Ignored).unwrap();
        assert_eq!(segment.repr.data_offset(), 6);
        assert_eq!(segment.header_len, 34);
        assert_eq!(segment.payload, &PAYLOAD_BYTES[..]);
    }

    #[test]
    fn malformed_option_truncates_list() {
        let mut bytes = vec![0; 34];
        bytes[..26].copy_from_slice(&SEGMENT_BYTES[..26]);
        bytes[18] = 0x70;
        // A no-op, then an MSS option claiming two octets, then a window scale.
        bytes[26..30].copy_from_slice(&[0x01, 0x02, 0x02, 0x03]);
        bytes[30..34].copy_from_slice(&[0x03, 0x0e, 0x01, 0x01]);
        let segment = Repr::parse(&bytes, Checksum::Ignored).unwrap();
        assert_eq!(segment.repr.options(), &[TcpOption::NoOp]);
        assert_eq!(segment.header_len, 34);
        assert!(segment.payload.is_empty());
    }

    #[test]
    fn option_budget() {
        let mut repr = Repr::new(1, 2);
        assert!(repr.push_option(TcpOption::Timestamp { value: 1, echo: 2 }));
        assert!(repr.push_option(TcpOption::WindowScale(7)));
        let blocks: SackBlocks = vec![
            (SeqNumber(0), SeqNumber(10)),
            (SeqNumber(20), SeqNumber(30)),
            (SeqNumber(40), SeqNumber(50)),
        ].into();
        // 13 + 26 octets still fit.
        assert!(repr.push_option(TcpOption::Sack(blocks.clone())));
        assert!(!repr.push_option(TcpOption::SackPermitted));
        assert!(!repr.push_option(TcpOption::Unknown { kind: 42, data: vec![] }));
        assert!(repr.push_option(TcpOption::End));
        assert_eq!(repr.options_len(), 39);
        assert_eq!(repr.padded_options_len(), 40);
        assert_eq!(repr.data_offset(), 15);
        assert_eq!(repr.header_len(), 66);
        assert!(repr.has_option(Kind::Sack));
        assert_eq!(repr.option(Kind::WindowScale), Some(&TcpOption::WindowScale(7)));
    }

    #[test]
    fn header_len_multiple_of_4() {
        let mut repr = Repr::new(1, 2);
        assert_eq!(repr.data_offset(), 5);
        for option in vec![
            TcpOption::WindowScale(0),
            TcpOption::SackPermitted,
            TcpOption::MaxSegmentSize(536),
            TcpOption::Timestamp { value: 0, echo: 0 },
        ] {
            assert!(repr.push_option(option));
            assert_eq!(repr.padded_options_len() % 4, 0);
            assert_eq!(usize::from(repr.data_offset())*4, 20 + repr.padded_options_len());
        }
    }

    #[test]
    fn reparse_preserves_fields() {
        let mut repr = segment_repr();
        repr.flags = Flags::SYN | Flags::ECE | Flags::CWR;
        repr.urgent_at = 7;
        assert!(repr.push_option(TcpOption::WindowScale(14)));
        assert!(repr.push_option(TcpOption::SackPermitted));
        let bytes = repr.serialize(&[], manual());
        let segment = Repr::parse(&bytes, manual()).unwrap();
        assert!(segment.checksum_ok);
        assert_eq!(segment.repr, repr);
    }

    #[test]
    fn sequence_numbers() {
        let max = SeqNumber(i32::MAX);
        assert!(max + 1 > max);
        assert_eq!((max + 1) - max, 1);
        assert_eq!(SeqNumber(5).max(SeqNumber(-5)), SeqNumber(5));
        assert_eq!(SeqNumber(-1).max(SeqNumber(1)), SeqNumber(1));
        assert_eq!(SeqNumber(1).saturating_sub(SeqNumber(3)), 0);
        assert_eq!(format!("{}", SeqNumber(-1)), "4294967295");
    }

    #[test]
    fn flag_names() {
        assert_eq!(flags_to_string(0, "|"), "");
        assert_eq!(flags_to_string(0x12, "|"), "SYN|ACK");
        assert_eq!((Flags::FIN | Flags::ACK | Flags::CWR).to_string_with(" "), "FIN ACK CWR");
        assert_eq!(format!("{}", Flags::RST), "RST");
        assert_eq!(Flags::SYN.sequence_len() + Flags::FIN.sequence_len(), 2);
    }

    #[test]
    fn display() {
        let repr = segment_repr();
        assert_eq!(format!("{}", repr),
            "48896 > 80 [PSH|ACK] Seq=19088743 Ack=2309737967 Win=291 CA-ID=1 CA-BL=2 CA-SZ=3 MSS:1460");
    }
}
