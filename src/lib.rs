//! Callback-driven socket endpoints over a single-threaded readiness
//! reactor.
//!
//! netpoll hosts many sockets in one process with non-blocking, event
//! style semantics: endpoints register their descriptors with a shared
//! [`Handler`], user code attaches callbacks per event tag, and a blocking
//! [`poll`] call drives one round of readiness dispatch.
//!
//! # Endpoints
//!
//! * [`net::TcpServer`] — listeners plus accepted connections, with
//!   `LISTEN`/`ACCEPT`/`RECEIVE`/`DISCONNECT`/`CLOSED`/`ERROR` hooks.
//! * [`net::TcpClient`] — outbound connections, with
//!   `CONNECT`/`RECEIVE`/`CLOSED`/`ERROR` hooks.
//! * [`net::UdpSocket`] and [`net::RawSocket`] — datagram sockets with
//!   selectable receive/send calls and `BIND`/`RECVFROM`/`RECVMSG`/
//!   `CLOSED`/`ERROR` hooks.
//!
//! Endpoints sharing a [`Handler`] are polled together; callbacks run
//! synchronously on the polling thread, in registration order per round,
//! readable before writable per descriptor. A callback may mutate the
//! endpoint freely — close connections, open listeners, send — and the
//! running poll round ends cleanly when the registered set changes under
//! it.
//!
//! # Example
//!
//! ```no_run
//! use netpoll::net::TcpServer;
//! use netpoll::{Family, Flags};
//!
//! # fn main() -> std::io::Result<()> {
//! let server: TcpServer = TcpServer::new()?;
//! server.on_accept(Flags::DEFAULT, |_ctx, conn| {
//!     println!("+ {:?}", conn);
//! });
//! server.on_receive(Flags::DEFAULT, |ctx, conn, bytes| {
//!     ctx.send(conn, bytes); // echo
//! });
//! server.listen("127.0.0.1", 8000, Family::Ipv4)?;
//! loop {
//!     netpoll::poll(&server, None)?;
//! }
//! # }
//! ```
//!
//! Sending never blocks: bytes the kernel does not take immediately are
//! buffered per connection and flushed as the descriptor turns writable.
//! Buffers grow without bound by policy; bound them at the application
//! level.

#![deny(missing_debug_implementations)]

#[macro_use]
mod macros;

mod actions;
mod addr;
mod container;
mod interest;
mod reactor;
mod socket;
mod sys;

pub mod net;

pub use crate::actions::{ActionList, Flags, Snapshot};
pub use crate::addr::{Address, Family, ResolveError, MAX_RESOLVE_RETRIES};
pub use crate::interest::Interest;
pub use crate::reactor::{poll, Handler, Pollable};
pub use crate::socket::Socket;

/// # Features
///
/// * `log` (default): trace-level logging of reactor mutations and poll
///   rounds through the `log` crate.
/// * `force-poll`: use the portable `poll(2)` backend instead of the OS
///   default (epoll on Linux, kqueue on the BSDs and macOS).
/// * `force-select`: use the `select(2)` fallback backend, capped at
///   `FD_SETSIZE` descriptors. Takes precedence over `force-poll`.
pub mod features {}
