/*! Segment representation and the wire codecs.

The `wire` module deals with the segment *representation*. A header is decoded from a sequence of
octets into a [`TcpRepr`], a compact high-level representation which owns its option list, and is
emitted back from it. Payload data is never copied by decoding; [`TcpSegment`] borrows it from the
input.

Parsing never panics. Emitting panics only when the buffer is shorter than
[`TcpRepr::header_len`], which is always the case for buffers produced by
[`TcpRepr::serialize`].

# Examples

To emit a segment and parse it back:

```rust
use simtcp::wire::*;

let mut repr = TcpRepr::new(49152, 80);
repr.seq_number = TcpSeqNumber(1000);
repr.flags = TcpFlags::SYN;
assert!(repr.push_option(TcpOption::MaxSegmentSize(1460)));

let checksum = TcpChecksum::Manual {
    src_addr: IpAddress::v4(10, 0, 0, 1),
    dst_addr: IpAddress::v4(10, 0, 0, 2),
};
let bytes = repr.serialize(b"hello", checksum);
let segment = TcpRepr::parse(&bytes, checksum).expect("malformed segment");
assert!(segment.checksum_ok);
assert_eq!(segment.repr, repr);
assert_eq!(segment.payload, b"hello");
```

[`TcpRepr`]: struct.TcpRepr.html
[`TcpSegment`]: struct.TcpSegment.html
[`TcpRepr::header_len`]: struct.TcpRepr.html#method.header_len
[`TcpRepr::serialize`]: struct.TcpRepr.html#method.serialize
*/
// Most fields are self-explanatory given the RFC names.
#![allow(missing_docs)]

mod error;
pub(crate) mod ip;
pub(crate) mod tcp;
pub(crate) mod tcp_option;

pub use self::error::{
    Error,
    Result};

pub use self::ip::{
    Protocol as IpProtocol,
    Address as IpAddress,
    Endpoint as IpEndpoint,
    Ecn as IpEcn,
    Ipv4Address,
    Ipv6Address};

pub use self::tcp::{
    Caravan as TcpCaravan,
    Checksum as TcpChecksum,
    SeqNumber as TcpSeqNumber,
    Segment as TcpSegment,
    Repr as TcpRepr,
    Flags as TcpFlags,
    flags_to_string,
    HEADER_LEN as TCP_HEADER_LEN,
    MIN_DATA_OFFSET as TCP_MIN_DATA_OFFSET};

pub use self::tcp_option::{
    is_kind_known,
    Kind as TcpOptionKind,
    SackBlock,
    SackBlocks,
    TcpOption,
    MAX_OPTIONS_LEN as TCP_MAX_OPTIONS_LEN};
