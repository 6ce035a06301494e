//! The application facing vocabulary of the socket interface.
//!
//! Applications drive connections through the methods of [`Endpoint`] and learn about progress
//! by draining [`Event`]s. Nothing here is a callback: an event describes something that already
//! happened and the application may react to it at its leisure, with the same logical time.
//!
//! [`Endpoint`]: struct.Endpoint.html
//! [`Event`]: enum.Event.html
use core::fmt;

use crate::wire::IpEndpoint;

use super::slots::Key;

/// The result of a socket operation.
pub type Result<T> = core::result::Result<T, SocketError>;

/// Errors of socket operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketError {
    /// No local address or port is available for binding.
    AddrNotAvail,

    /// The requested local endpoint is bound already.
    AddrInUse,

    /// The operation is not permitted in the current state, or with the given arguments.
    Invalid,

    /// The send buffer has no room for the data.
    ///
    /// Nothing was queued. Retry after a [`SendReady`] event.
    ///
    /// [`SendReady`]: enum.Event.html#variant.SendReady
    MsgSize,

    /// The sending side was shut down.
    Shutdown,

    /// The connection is not established.
    NotConn,

    /// The endpoint has no local address to reach the peer with.
    NoRoute,

    /// The key does not refer to an open socket.
    BadHandle,
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            SocketError::AddrNotAvail => "address not available",
            SocketError::AddrInUse => "address in use",
            SocketError::Invalid => "invalid operation",
            SocketError::MsgSize => "send buffer full",
            SocketError::Shutdown => "socket shut down",
            SocketError::NotConn => "not connected",
            SocketError::NoRoute => "no route to host",
            SocketError::BadHandle => "bad socket handle",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for SocketError {}

/// A notification for the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// An active open completed.
    ConnectionSucceeded,

    /// An active open was refused or timed out.
    ConnectionFailed,

    /// A listener accepted a connection, available under the key the event is addressed to.
    NewConnection {
        /// The listening socket that forked the connection.
        listener: Key,
        /// The remote end of the new connection.
        peer: IpEndpoint,
    },

    /// The connection closed in an orderly manner, or the peer finished sending.
    NormalClose,

    /// The connection was reset or gave up.
    ErrorClose,

    /// New data left for the first time, in bytes.
    DataSent(usize),

    /// Room in the send buffer, in bytes.
    SendReady(usize),

    /// In-order data arrived.
    DataReceived,
}

/// The outcome of handing a segment to the endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RxStatus {
    /// Delivered to a connection.
    Ok,

    /// The checksum did not match, the segment was dropped.
    ChecksumFailed,

    /// The segment could not be parsed.
    Truncated,

    /// No connection or listener matched, the segment was dropped.
    NoEndpoint,

    /// No connection matched and a reset was sent in reply.
    Reset,
}
