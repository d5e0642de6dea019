//! Backend readiness primitives.
//!
//! Each backend module exposes the same inherent API:
//!
//! ```ignore
//! impl Selector {
//!     fn new() -> io::Result<Selector>;
//!     fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;
//!     fn reregister(&mut self, fd: RawFd, interest: Option<Interest>) -> io::Result<()>;
//!     fn deregister(&mut self, fd: RawFd) -> io::Result<()>;
//!     fn select(
//!         &mut self,
//!         entries: &[(RawFd, Option<Interest>)],
//!         events: &mut Vec<Event>,
//!         timeout: Option<Duration>,
//!     ) -> io::Result<usize>;
//! }
//! ```
//!
//! The abstract contract: given the registered (fd, wanted-events) set,
//! block for at most the timeout and report each descriptor together with
//! its satisfied-events mask. The stateful backends (epoll, kqueue) keep a
//! kernel-side mirror updated through `register`/`reregister`/`deregister`;
//! the stateless ones (poll, select) rebuild their scan array from
//! `entries` on every call and treat the registration calls as validation
//! hooks only.

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use self::unix::{Event, Selector};

#[cfg(not(unix))]
compile_error!("netpoll only supports Unix-like targets");
