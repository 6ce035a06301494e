//! The process logic of protocol layers.
//!
//! ## Layering
//!
//! Each protocol layer is split into two parts; the segment logic contained in `wire` and the
//! processing part in this module. An endpoint represents the local state of a protocol. This
//! state can be used to process segments of that layer. The state is open to modifications as part
//! of a user program while processing does not take place, similar to reconfiguration on the OS
//! level with utilities such as `ss` or `sysctl`.
//!
//! ## Receiving
//!
//! The layer below, usually a simulated IP layer, hands in the bytes of a segment together with
//! the addresses and the ECN codepoint of its header. The endpoint decodes the segment, finds the
//! connection it belongs to and lets the connection process it to completion.
//!
//! ## Sending
//!
//! Nothing is sent directly. Every segment a connection emits, whether it answers a received
//! segment, follows an application call or a timer, is queued in the endpoint and drained by the
//! layer below at its own pace.
pub mod tcp;
