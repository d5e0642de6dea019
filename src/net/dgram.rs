use std::cell::RefCell;
use std::io;
use std::mem::{self, MaybeUninit};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::actions::{ActionList, Flags};
use crate::addr::{Address, Family};
use crate::net::errno;
use crate::reactor::{EventSink, Handler, Pollable};
use crate::socket::{set_nonblocking, Socket};

const DEFAULT_RECV_BUFFER_SIZE: usize = 4096;

/// Which receive call the readable path uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    /// `recv(2)`: bytes only, for connected datagram sockets.
    Recv,
    /// `recvmsg(2)`: bytes plus message metadata.
    RecvMsg,
    /// `recvfrom(2)`: bytes plus the source address. The default.
    RecvFrom,
}

/// Which send call [`DgramCtx::transmit`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// `send(2)`, for connected datagram sockets.
    Send,
    /// `sendmsg(2)`.
    SendMsg,
    /// `sendto(2)`. The default.
    SendTo,
}

/// Outcome of a datagram send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The whole datagram was handed to the kernel.
    Success,
    /// The send failed; `ERROR` carries the errno when an endpoint was
    /// involved.
    Error,
    /// The socket was not ready for writing (would block).
    Unavailable,
    /// The kernel took only this many bytes. Kernels rarely short-write
    /// datagrams; callers may treat this like `Error`.
    Incomplete(usize),
}

impl SendResult {
    pub fn is_success(self) -> bool {
        self == SendResult::Success
    }
}

/// A received message with its metadata, as reported by `recvmsg(2)`.
pub struct MsgInfo<'a> {
    /// Source address of the datagram.
    pub addr: Address,
    /// The payload.
    pub bytes: &'a [u8],
    /// Kernel message flags (`MSG_TRUNC` and friends).
    pub flags: libc::c_int,
}

type RecvFn<D> = dyn FnMut(&mut DgramCtx<D>, &[u8]);
type RecvFromFn<D> = dyn FnMut(&mut DgramCtx<D>, &Address, &[u8]);
type RecvMsgFn<D> = dyn FnMut(&mut DgramCtx<D>, &MsgInfo<'_>);
type BindFn<D> = dyn FnMut(&mut DgramCtx<D>, &Address);
type ClosedFn<D> = dyn FnMut(&mut DgramCtx<D>, &Address);
type ErrorFn<D> = dyn FnMut(&mut DgramCtx<D>, &'static str, i32);

struct DgramTable<D> {
    recv: ActionList<RecvFn<D>>,
    recvfrom: ActionList<RecvFromFn<D>>,
    recvmsg: ActionList<RecvMsgFn<D>>,
    bind: ActionList<BindFn<D>>,
    closed: ActionList<ClosedFn<D>>,
    error: ActionList<ErrorFn<D>>,
}

impl<D> DgramTable<D> {
    fn new() -> DgramTable<D> {
        DgramTable {
            recv: ActionList::new(),
            recvfrom: ActionList::new(),
            recvmsg: ActionList::new(),
            bind: ActionList::new(),
            closed: ActionList::new(),
            error: ActionList::new(),
        }
    }
}

/// A UDP socket endpoint.
///
/// One datagram socket plus its action table. `D` is user data kept with
/// the socket.
pub struct UdpSocket<D = ()> {
    handler: Handler,
    ctx: Rc<RefCell<DgramCtx<D>>>,
}

/// A raw socket endpoint: the same machinery as [`UdpSocket`] with the
/// socket type and protocol chosen by the caller.
pub struct RawSocket<D = ()> {
    handler: Handler,
    ctx: Rc<RefCell<DgramCtx<D>>>,
}

/// The mutable inside of a [`UdpSocket`] or [`RawSocket`], handed to its
/// callbacks.
pub struct DgramCtx<D = ()> {
    handler: Handler,
    this: Weak<RefCell<DgramCtx<D>>>,
    socket: Socket,
    data: D,
    table: DgramTable<D>,
    recv_mode: RecvMode,
    send_mode: SendMode,
    recv_buf: Vec<u8>,
    resolve_retries: usize,
}

macro_rules! dgram_handle_impl {
    ($handle: ident) => {
        impl<D: Default + 'static> $handle<D> {
            pub fn new() -> io::Result<$handle<D>> {
                Ok(Self::with_handler(Handler::new()?))
            }

            pub fn with_handler(handler: Handler) -> $handle<D> {
                let ctx = Rc::new(RefCell::new(DgramCtx {
                    handler: handler.clone(),
                    this: Weak::new(),
                    socket: Socket::new(handler.clone()),
                    data: D::default(),
                    table: DgramTable::new(),
                    recv_mode: RecvMode::RecvFrom,
                    send_mode: SendMode::SendTo,
                    recv_buf: vec![0; DEFAULT_RECV_BUFFER_SIZE],
                    resolve_retries: crate::addr::MAX_RESOLVE_RETRIES,
                }));
                ctx.borrow_mut().this = Rc::downgrade(&ctx);
                $handle { handler, ctx }
            }

            /// Resolves and binds; emits `BIND` on success. See
            /// [`DgramCtx::bind`].
            pub fn bind(&self, host: &str, port: u16, family: Family) -> io::Result<()> {
                self.ctx.borrow_mut().bind(host, port, family)
            }

            /// One `sendto` to `addr`. See [`DgramCtx::send_to`].
            pub fn send_to(&self, addr: &Address, bytes: &[u8]) -> SendResult {
                self.ctx.borrow_mut().send_to(addr, bytes, 0)
            }

            pub fn close(&self) {
                self.ctx.borrow_mut().close();
            }

            /// Runs `f` against the socket state, outside of any callback.
            pub fn with<R>(&self, f: impl FnOnce(&mut DgramCtx<D>) -> R) -> R {
                f(&mut self.ctx.borrow_mut())
            }

            /// Hook for the `recv(2)` receive path.
            pub fn on_recv(&self, flags: Flags, f: impl FnMut(&mut DgramCtx<D>, &[u8]) + 'static) {
                self.ctx.borrow_mut().table.recv.push(flags, Rc::new(RefCell::new(f)));
            }

            /// Hook for the `recvfrom(2)` receive path (the default mode).
            pub fn on_recvfrom(
                &self,
                flags: Flags,
                f: impl FnMut(&mut DgramCtx<D>, &Address, &[u8]) + 'static,
            ) {
                self.ctx.borrow_mut().table.recvfrom.push(flags, Rc::new(RefCell::new(f)));
            }

            /// Hook for the `recvmsg(2)` receive path.
            pub fn on_recvmsg(
                &self,
                flags: Flags,
                f: impl FnMut(&mut DgramCtx<D>, &MsgInfo<'_>) + 'static,
            ) {
                self.ctx.borrow_mut().table.recvmsg.push(flags, Rc::new(RefCell::new(f)));
            }

            /// Hook: the socket bound to an address.
            pub fn on_bind(&self, flags: Flags, f: impl FnMut(&mut DgramCtx<D>, &Address) + 'static) {
                self.ctx.borrow_mut().table.bind.push(flags, Rc::new(RefCell::new(f)));
            }

            /// Hook: the socket closed; receives the address it was bound
            /// to.
            pub fn on_closed(&self, flags: Flags, f: impl FnMut(&mut DgramCtx<D>, &Address) + 'static) {
                self.ctx.borrow_mut().table.closed.push(flags, Rc::new(RefCell::new(f)));
            }

            /// Hook: a syscall failed; receives the operation name and
            /// errno.
            pub fn on_error(
                &self,
                flags: Flags,
                f: impl FnMut(&mut DgramCtx<D>, &'static str, i32) + 'static,
            ) {
                self.ctx.borrow_mut().table.error.push(flags, Rc::new(RefCell::new(f)));
            }

            /// Selects the receive call used on readable readiness.
            pub fn set_recv_mode(&self, mode: RecvMode) {
                self.ctx.borrow_mut().recv_mode = mode;
            }

            /// Selects the send call used by [`DgramCtx::transmit`].
            pub fn set_send_mode(&self, mode: SendMode) {
                self.ctx.borrow_mut().send_mode = mode;
            }

            pub fn set_recv_buffer_size(&self, size: usize) {
                self.ctx.borrow_mut().recv_buf = vec![0; size.max(1)];
            }

            pub fn set_resolve_retries(&self, retries: usize) {
                self.ctx.borrow_mut().resolve_retries = retries.max(1);
            }

            /// The bound local address.
            pub fn local_addr(&self) -> Option<Address> {
                let ctx = self.ctx.borrow();
                ctx.socket.is_open().then(|| *ctx.socket.addr())
            }
        }

        impl<D: Default + 'static> Pollable for $handle<D> {
            fn handler(&self) -> &Handler {
                &self.handler
            }
        }
    };
}

dgram_handle_impl!(UdpSocket);
dgram_handle_impl!(RawSocket);

impl<D: Default + 'static> UdpSocket<D> {
    /// Creates the descriptor (`SOCK_DGRAM`) and registers it, without
    /// binding. `bind` does this implicitly.
    pub fn open(&self, family: Family) -> io::Result<()> {
        self.ctx.borrow_mut().open(family)
    }
}

impl<D: Default + 'static> RawSocket<D> {
    /// Creates a descriptor of an arbitrary domain/type/protocol and
    /// registers it.
    pub fn open(&self, domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<()> {
        self.ctx.borrow_mut().open_raw(domain, ty, protocol)
    }
}

impl<D: Default + 'static> DgramCtx<D> {
    fn sink(&self) -> Weak<RefCell<dyn EventSink>> {
        self.this.clone()
    }

    /// Creates a `SOCK_DGRAM` descriptor for `family` and registers it
    /// with the reactor. No-op when already open.
    pub fn open(&mut self, family: Family) -> io::Result<()> {
        self.open_raw(family.af(), libc::SOCK_DGRAM, 0)
    }

    pub(crate) fn open_raw(
        &mut self,
        domain: libc::c_int,
        ty: libc::c_int,
        protocol: libc::c_int,
    ) -> io::Result<()> {
        if self.socket.is_open() {
            return Ok(());
        }
        if let Err(e) = self.socket.open(domain, ty, protocol) {
            self.emit_error("socket", errno(&e));
            return Err(e);
        }
        if let Err(e) = self.handler.add(self.socket.fd(), self.sink()) {
            self.emit_error("register", errno(&e));
            self.socket.close();
            return Err(e);
        }
        Ok(())
    }

    /// Resolves `host`, overwrites the port, binds, and emits `BIND`.
    /// Opens the socket first when needed.
    pub fn bind(&mut self, host: &str, port: u16, family: Family) -> io::Result<()> {
        self.open(family)?;

        let addr = match Address::resolve_retrying(host, family, self.resolve_retries) {
            Ok(addr) => addr,
            Err(e) => {
                self.emit_error("getaddrinfo", 0);
                return Err(io::Error::new(io::ErrorKind::InvalidInput, e));
            }
        };
        *self.socket.addr_mut() = addr;
        if !self.socket.addr_mut().set_port(port) {
            self.emit_error("getaddrinfo", 0);
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        if let Err(e) = self.socket.bind() {
            self.emit_error("bind", errno(&e));
            return Err(e);
        }
        let _ = self.socket.refresh_local_addr();

        let addr = *self.socket.addr();
        self.emit_bind(&addr);
        Ok(())
    }

    /// One non-blocking `sendto`.
    pub fn send_to(&mut self, addr: &Address, bytes: &[u8], flags: libc::c_int) -> SendResult {
        if !self.socket.is_open() {
            let family = match addr.family() as libc::c_int {
                libc::AF_INET6 => Family::Ipv6,
                _ => Family::Ipv4,
            };
            if self.open(family).is_err() {
                return SendResult::Error;
            }
        }
        let res = syscall!(sendto(
            self.socket.fd(),
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
            flags | libc::MSG_DONTWAIT,
            addr.as_sockaddr(),
            addr.len(),
        ));
        self.send_outcome("sendto", res, bytes.len())
    }

    /// One non-blocking `send`, for connected sockets.
    pub fn send(&mut self, bytes: &[u8], flags: libc::c_int) -> SendResult {
        let res = syscall!(send(
            self.socket.fd(),
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
            flags | libc::MSG_DONTWAIT,
        ));
        self.send_outcome("send", res, bytes.len())
    }

    /// One non-blocking `sendmsg` to `addr`.
    pub fn send_msg(&mut self, addr: &Address, bytes: &[u8], flags: libc::c_int) -> SendResult {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        // SAFETY: all-zero msghdr is valid; pointers set below outlive the
        // call.
        let mut header: libc::msghdr = unsafe { mem::zeroed() };
        header.msg_name = addr.as_sockaddr() as *mut libc::c_void;
        header.msg_namelen = addr.len();
        header.msg_iov = &mut iov;
        header.msg_iovlen = 1;

        let res = syscall!(sendmsg(self.socket.fd(), &header, flags | libc::MSG_DONTWAIT));
        self.send_outcome("sendmsg", res, bytes.len())
    }

    /// Sends using whatever [`SendMode`] is configured.
    pub fn transmit(&mut self, addr: &Address, bytes: &[u8]) -> SendResult {
        match self.send_mode {
            SendMode::Send => self.send(bytes, 0),
            SendMode::SendMsg => self.send_msg(addr, bytes, 0),
            SendMode::SendTo => self.send_to(addr, bytes, 0),
        }
    }

    /// Closes the socket and emits `CLOSED` with the address it was bound
    /// to.
    pub fn close(&mut self) {
        if !self.socket.is_open() {
            return;
        }
        let addr = *self.socket.addr();
        self.socket.close();
        self.emit_closed(&addr);
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub fn local_addr(&self) -> &Address {
        self.socket.addr()
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// The underlying socket, for option tweaks (`setsockopt` and
    /// friends).
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    fn send_outcome(
        &mut self,
        op: &'static str,
        res: io::Result<libc::ssize_t>,
        wanted: usize,
    ) -> SendResult {
        match res {
            Ok(n) if (n as usize) < wanted => SendResult::Incomplete(n as usize),
            Ok(_) => SendResult::Success,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => SendResult::Unavailable,
            Err(e) => {
                self.emit_error(op, errno(&e));
                SendResult::Error
            }
        }
    }

    fn readable(&mut self) {
        match self.recv_mode {
            RecvMode::Recv => self.do_recv(),
            RecvMode::RecvMsg => self.do_recvmsg(),
            RecvMode::RecvFrom => self.do_recvfrom(),
        }
    }

    fn do_recv(&mut self) {
        let mut buf = mem::take(&mut self.recv_buf);
        let res = syscall!(recv(
            self.socket.fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        ));
        match res {
            Ok(n) => {
                let hooks = self.table.recv.snapshot();
                hooks.deliver(self, |cb, ctx| cb(ctx, &buf[..n as usize]));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.emit_error("recv", errno(&e)),
        }
        self.restore_buf(buf);
    }

    fn do_recvfrom(&mut self) {
        let mut buf = mem::take(&mut self.recv_buf);
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let res = syscall!(recvfrom(
            self.socket.fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
        ));
        match res {
            Ok(n) => {
                // SAFETY: recvfrom wrote a valid address of `len` bytes.
                let addr = unsafe { Address::from_raw(storage.as_ptr() as *const libc::sockaddr, len) };
                let hooks = self.table.recvfrom.snapshot();
                hooks.deliver(self, |cb, ctx| cb(ctx, &addr, &buf[..n as usize]));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.emit_error("recvfrom", errno(&e)),
        }
        self.restore_buf(buf);
    }

    fn do_recvmsg(&mut self) {
        let mut buf = mem::take(&mut self.recv_buf);
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: all-zero msghdr is valid; pointers set below outlive the
        // call.
        let mut header: libc::msghdr = unsafe { mem::zeroed() };
        header.msg_name = storage.as_mut_ptr() as *mut libc::c_void;
        header.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        header.msg_iov = &mut iov;
        header.msg_iovlen = 1;

        let res = syscall!(recvmsg(self.socket.fd(), &mut header, libc::MSG_DONTWAIT));
        match res {
            Ok(n) => {
                // SAFETY: recvmsg wrote a valid address of msg_namelen bytes.
                let addr = unsafe {
                    Address::from_raw(storage.as_ptr() as *const libc::sockaddr, header.msg_namelen)
                };
                let info = MsgInfo {
                    addr,
                    bytes: &buf[..n as usize],
                    flags: header.msg_flags,
                };
                let hooks = self.table.recvmsg.snapshot();
                hooks.deliver(self, |cb, ctx| cb(ctx, &info));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.emit_error("recvmsg", errno(&e)),
        }
        self.restore_buf(buf);
    }

    fn emit_bind(&mut self, addr: &Address) {
        let hooks = self.table.bind.snapshot();
        hooks.deliver(self, |cb, ctx| cb(ctx, addr));
    }

    fn emit_closed(&mut self, addr: &Address) {
        let hooks = self.table.closed.snapshot();
        hooks.deliver(self, |cb, ctx| cb(ctx, addr));
    }

    fn emit_error(&mut self, op: &'static str, err: i32) {
        let hooks = self.table.error.snapshot();
        hooks.deliver(self, |cb, ctx| cb(ctx, op, err));
    }

    fn restore_buf(&mut self, buf: Vec<u8>) {
        if self.recv_buf.is_empty() {
            self.recv_buf = buf;
        }
    }
}

impl<D> std::fmt::Debug for UdpSocket<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket").field("handler", &self.handler).finish()
    }
}

impl<D> std::fmt::Debug for RawSocket<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSocket").field("handler", &self.handler).finish()
    }
}

impl<D> std::fmt::Debug for DgramCtx<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DgramCtx").field("socket", &self.socket).finish()
    }
}

impl std::fmt::Debug for MsgInfo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgInfo")
            .field("addr", &self.addr)
            .field("len", &self.bytes.len())
            .field("flags", &self.flags)
            .finish()
    }
}

impl<D: Default + 'static> EventSink for DgramCtx<D> {
    fn on_readable(&mut self, _fd: RawFd) {
        self.readable();
    }

    fn on_writable(&mut self, _fd: RawFd) {}
}

/// Sends one datagram to `addr` over an ephemeral non-blocking socket.
///
/// The socket exists only for this call and is closed on every exit path.
/// Useful for fire-and-forget messages where keeping an endpoint around is
/// not worth it.
pub fn send_to(addr: &Address, bytes: &[u8]) -> SendResult {
    struct Ephemeral(RawFd);

    impl Drop for Ephemeral {
        fn drop(&mut self) {
            let _ = syscall!(close(self.0));
        }
    }

    let fd = match syscall!(socket(addr.family() as libc::c_int, libc::SOCK_DGRAM, 0)) {
        Ok(fd) => Ephemeral(fd),
        Err(_) => return SendResult::Error,
    };
    if set_nonblocking(fd.0, true).is_err() {
        return SendResult::Error;
    }

    let res = syscall!(sendto(
        fd.0,
        bytes.as_ptr() as *const libc::c_void,
        bytes.len(),
        libc::MSG_DONTWAIT,
        addr.as_sockaddr(),
        addr.len(),
    ));
    match res {
        Ok(n) if (n as usize) < bytes.len() => SendResult::Incomplete(n as usize),
        Ok(_) => SendResult::Success,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => SendResult::Unavailable,
        Err(_) => SendResult::Error,
    }
}
