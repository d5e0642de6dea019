//! Endpoint types: TCP servers and clients, datagram sockets.

use std::io;
use std::os::unix::io::RawFd;

pub mod dgram;
pub mod tcp;

pub use self::dgram::{send_to, DgramCtx, MsgInfo, RawSocket, RecvMode, SendMode, SendResult, UdpSocket};
pub use self::tcp::client::{ClientCtx, TcpClient};
pub use self::tcp::server::{ServerCtx, TcpServer};

/// Identifies one accepted or outbound connection within its endpoint.
///
/// Stable for the connection's lifetime; after `DISCONNECT`/`CLOSED` the
/// id is dead and lookups through it return `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) RawFd);

impl ConnId {
    /// The underlying descriptor, for logging and correlation.
    pub fn fd(self) -> RawFd {
        self.0
    }
}

/// Identifies one listening socket within a [`TcpServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) RawFd);

impl ListenerId {
    pub fn fd(self) -> RawFd {
        self.0
    }
}

pub(crate) fn errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(0)
}

pub(crate) fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}
