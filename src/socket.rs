use std::io;
use std::mem::{self, MaybeUninit};
use std::os::unix::io::RawFd;

use crate::addr::Address;
use crate::reactor::Handler;

/// Ownership cell over one socket descriptor plus its local [`Address`].
///
/// The descriptor is either `-1` (unopened or closed) or valid and owned
/// exclusively by this value. [`close`] transitions to `-1` exactly once;
/// closing again is a no-op. Dropping an open socket closes it and removes
/// it from the reactor.
///
/// A `Socket` does not register itself with the reactor: containers do
/// that, together with the owner handle readiness gets routed to.
///
/// [`close`]: Socket::close
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
    addr: Address,
    handler: Handler,
}

impl Socket {
    pub(crate) fn new(handler: Handler) -> Socket {
        Socket {
            fd: -1,
            addr: Address::new(),
            handler,
        }
    }

    /// Wraps an already-created descriptor (an accepted connection).
    pub(crate) fn from_fd(handler: Handler, fd: RawFd) -> Socket {
        Socket {
            fd,
            addr: Address::new(),
            handler,
        }
    }

    /// Creates the descriptor. On failure the socket stays at `-1` and the
    /// error is returned for the owner to surface through its `ERROR`
    /// action.
    pub fn open(&mut self, domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<()> {
        debug_assert_eq!(self.fd, -1, "opening an already open socket");
        self.fd = syscall!(socket(domain, ty, protocol))?;
        Ok(())
    }

    /// Removes the descriptor from the reactor and closes it. Idempotent.
    ///
    /// Emitting `CLOSED` is the owner's job, after this returns (and after
    /// which the descriptor is unusable, so hooks cannot do I/O on it).
    pub fn close(&mut self) {
        if self.fd == -1 {
            return;
        }
        self.handler.remove(self.fd);
        let _ = syscall!(close(self.fd));
        self.fd = -1;
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.fd != -1
    }

    /// The local address this socket binds or bound to.
    pub fn addr(&self) -> &Address {
        &self.addr
    }

    pub fn addr_mut(&mut self) -> &mut Address {
        &mut self.addr
    }

    /// Binds to the stored local address.
    pub fn bind(&self) -> io::Result<()> {
        syscall!(bind(self.fd, self.addr.as_sockaddr(), self.addr.len())).map(|_| ())
    }

    pub fn listen(&self, backlog: libc::c_int) -> io::Result<()> {
        syscall!(listen(self.fd, backlog)).map(|_| ())
    }

    /// Connects to the stored address. The address must have been set (by
    /// resolution or assignment) before calling this.
    pub fn connect(&self) -> io::Result<()> {
        syscall!(connect(self.fd, self.addr.as_sockaddr(), self.addr.len())).map(|_| ())
    }

    /// Accepts one pending connection, non-blocking. The returned
    /// descriptor is already in non-blocking mode.
    pub fn accept(&self) -> io::Result<(RawFd, Address)> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "illumos"))]
        let fd = syscall!(accept4(
            self.fd,
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;

        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "illumos")))]
        let fd = {
            let fd = syscall!(accept(
                self.fd,
                storage.as_mut_ptr() as *mut libc::sockaddr,
                &mut len,
            ))?;
            if let Err(e) = set_nonblocking(fd, true) {
                let _ = syscall!(close(fd));
                return Err(e);
            }
            fd
        };

        // SAFETY: accept wrote a valid address of `len` bytes.
        let peer = unsafe { Address::from_raw(storage.as_ptr() as *const libc::sockaddr, len) };
        Ok((fd, peer))
    }

    /// Refreshes the stored local address from `getsockname`, picking up
    /// kernel-assigned ports after an ephemeral bind.
    pub fn refresh_local_addr(&mut self) -> io::Result<()> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.fd,
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
        ))?;
        // SAFETY: getsockname wrote a valid address of `len` bytes.
        self.addr = unsafe { Address::from_raw(storage.as_ptr() as *const libc::sockaddr, len) };
        Ok(())
    }

    /// Flips this descriptor's read interest for the next poll rounds.
    pub fn set_want_read(&self, on: bool) {
        self.handler.set_want_read(self.fd, on);
    }

    /// Flips this descriptor's write interest for the next poll rounds.
    pub fn set_want_write(&self, on: bool) {
        self.handler.set_want_write(self.fd, on);
    }

    pub fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        set_nonblocking(self.fd, on)
    }

    pub fn set_reuseaddr(&self, on: bool) -> io::Result<()> {
        self.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, &(on as libc::c_int))
    }

    /// Thin typed `setsockopt` wrapper; `value` must be the exact type the
    /// option expects.
    pub fn set_option<T>(&self, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
        syscall!(setsockopt(
            self.fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    /// Thin typed `getsockopt` wrapper for plain-data option types.
    pub fn option<T: Copy>(&self, level: libc::c_int, name: libc::c_int) -> io::Result<T> {
        let mut value: MaybeUninit<T> = MaybeUninit::zeroed();
        let mut len = mem::size_of::<T>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd,
            level,
            name,
            value.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        ))?;
        // SAFETY: zero-initialised and the kernel wrote up to `len` bytes.
        Ok(unsafe { value.assume_init() })
    }

    pub(crate) fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    let flags = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    syscall!(fcntl(fd, libc::F_SETFL, flags)).map(|_| ())
}
