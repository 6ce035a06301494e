//! A simulated TCP protocol entity for discrete event network simulation.
//!
//! ## Table of contents
//!
//! This is also a recommended reading order but feel free to skip ahead, each chapter tries to be
//! somewhat self-contained.
//!
//! 1. [Highlights](#highlights)
//! 2. [Design](#design-and-relevant-core-concepts)
//! 3. [The wire module](wire/index.html)
//!    1. [Examples](wire/index.html#examples)
//! 4. [The layers](layer/index.html)
//!    1. [Receiving](layer/index.html#receiving)
//!    1. [Sending](layer/index.html#sending)
//!    1. [The tcp layer](layer/tcp/index.html)
//! 5. [Logical time](time/index.html)
//!
//! ## Highlights
//!
//! The most interesting features in overview:
//!
//! * The full connection state machine with passive open by forking listeners
//! * Pluggable congestion control, loss recovery and round trip estimation
//! * SACK based loss recovery, window scaling, timestamps, ECN and pacing
//! * Fully deterministic: no clocks, no threads, no randomness unless seeded
//!
//! Segment encoding lives in `wire`, the protocol logic in `layer`. Large portions of the `wire`
//! module follow whitequark's [`smoltcp`].
//!
//! [`smoltcp`]: https://github.com/m-labs/smoltcp
//!
//! ## Design and relevant core concepts
//!
//! This library simulates the transport layer of a host. It does not touch a network itself:
//! segments come in as bytes with the addresses of their IP header, and the segments it produces
//! are queued as bytes for the caller to deliver. Between two endpoints the caller is the network,
//! free to delay, reorder, mark or drop.
//!
//! Time is logical. Every call that may trigger protocol activity takes the current
//! [`Instant`], and the endpoint reports when it next wants to be woken up. Two runs with the same
//! inputs and the same initial sequence number key produce identical outputs.
//!
//! [`Instant`]: time/struct.Instant.html
#![warn(missing_docs)]
#![warn(unreachable_pub)]

#[macro_use] mod macros;
pub mod layer;
pub mod time;
pub mod wire;
