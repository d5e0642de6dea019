//! TCP endpoints.

pub mod client;
pub(crate) mod conn;
pub mod server;

/// Listen backlog handed to the OS, unless overridden per server.
pub(crate) const DEFAULT_BACKLOG: libc::c_int = 10;

/// Per-recv stack of bytes pulled from the kernel, unless overridden.
pub(crate) const DEFAULT_RECV_BUFFER_SIZE: usize = 4096;
