//! The TCP layer abstraction.
//!
//! Offers a complete TCP protocol entity for a discrete event simulation. Some parts differ from
//! an operating system stack since nothing here ever blocks or looks at a clock: every input is
//! an event with a logical time, and every output is queued for the caller to pick up.
//!
//! The main difference to a plain codec is that many incoming events *require* soliciting an
//! answer such as an ACK for received data. Those answers are queued immediately while processing
//! the event. Dropping them is possible, as the network between two endpoints may, but starves
//! the remote of ACKs and window updates, leading to inefficient communication or even resets but
//! not catastrophic failure.
//!
//! ## Structure
//!
//! The main functionality of the [`Endpoint`] structure of this layer is storing the connection
//! states. To this end it utilizes one map of connection tuples to [`SlotKey`]s (which behave
//! similar to specialized file descriptors) and a slotmap of these indices to connections.
//!
//! [`Endpoint`]: struct.Endpoint.html
//! [`SlotKey`]: struct.SlotKey.html
//!
//! Each [`Connection`] owns a [`ControlBlock`] and one instance of each strategy: congestion
//! control ([`CongestionOps`]), loss recovery ([`RecoveryOps`]) and round trip time estimation
//! ([`RttEstimator`]). Strategies are looked up by name in a registry when the connection is
//! opened and deep copied when a listener forks, so no two connections ever share mutable state.
//! The byte streams live in a [`SendBuffer`] and a [`ReceiveBuffer`], whose reference
//! implementations also keep the selective acknowledgement scoreboard.
//!
//! [`Connection`]: struct.Connection.html
//! [`ControlBlock`]: struct.ControlBlock.html
//! [`CongestionOps`]: trait.CongestionOps.html
//! [`RecoveryOps`]: trait.RecoveryOps.html
//! [`RttEstimator`]: trait.RttEstimator.html
//! [`SendBuffer`]: io/trait.SendBuffer.html
//! [`ReceiveBuffer`]: io/trait.ReceiveBuffer.html
//!
//! Unlike standard stacks where state and user must be assumed to be in different protection
//! domains and which manage their state opaquely, it poses no problem for this library to allow
//! inspection of internal state. Tests and simulations read the control block at any point.
//!
//! ## Time and timers
//!
//! A connection runs up to seven timers: retransmission, zero window persist, delayed ACK, last
//! ACK, time wait, pacing and a deferred send. Arming a timer replaces its previous instance. The
//! endpoint keeps all of them in one queue, [`Endpoint::advance`] delivers what is due and
//! [`Endpoint::poll_at`] tells when to call it next. Events for connections that were removed, or
//! for timers that were re-armed or cancelled since, are dropped at delivery.
//!
//! [`Endpoint::advance`]: struct.Endpoint.html#method.advance
//! [`Endpoint::poll_at`]: struct.Endpoint.html#method.poll_at
//!
//! ## Creating a connection
//!
//! An active open binds the socket to a local address, picks an initial sequence number and sends
//! the SYN right away. The application learns the outcome from a `ConnectionSucceeded` or
//! `ConnectionFailed` event. Data queued while the handshake is in progress is sent together with
//! the final ACK.
//!
//! ## Accepting connections
//!
//! A listening socket is consulted for every SYN that matches no connection. If its acceptor
//! agrees, it is copied and the copy answers the SYN one scheduling step later while the listener
//! stays in LISTEN. The copy announces itself with a `NewConnection` event once the handshake
//! completes. The listener itself never consumes the SYN's options.
//!
//! ## Deviations
//!
//! An incoming segment in Closed state is answered with a reset unless it had RST set. Packets with
//! RST should *never* be answered with a packet with RST. RFC793 is clear about this [in section
//! Reset Generation](https://tools.ietf.org/html/rfc793#page-36):
//!
//! > 1.  If the connection does not exist (CLOSED) then a reset is sent in response to any
//! incoming segment except another reset.
//!
//! A socket that is bound but neither connected nor listening is indistinguishable from no socket.
//!
//! Data sent in a SYN is ignored. The last ACK of a passive close must acknowledge our FIN exactly,
//! any other acknowledgement in LAST_ACK is processed like in ESTABLISHED.
mod config;
mod congestion;
mod connection;
mod endpoint;
pub mod io;
mod recovery;
mod rtt;
mod slots;
mod socket;
mod state;
mod timer;

mod siphash;

#[cfg(test)]
mod tests;

pub use config::{
    Config,
    EcnMode,
    IsnMode,
    MAX_BACKOFF};

pub use congestion::{
    congestion_ops,
    CongestionOps,
    Decongest,
    NewReno};

pub use connection::{
    Acceptor,
    Connection};

pub use endpoint::{
    Endpoint,
    FourTuple,
    Transmit};

pub use recovery::{
    recovery_ops,
    ClassicRecovery,
    RecoveryOps};

pub use rtt::{
    MeanDeviation,
    RttEstimator,
    RttHistory};

pub use slots::Key as SlotKey;

pub use socket::{
    Event,
    Result,
    RxStatus,
    SocketError};

pub use state::{
    CaEvent,
    CongState,
    ControlBlock,
    DataRate,
    EcnState,
    State};

pub use timer::TimerKind;

// publically exposed for initialization.
pub use siphash::IsnGenerator;
