use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::actions::{ActionList, Flags};
use crate::addr::{Address, Family};
use crate::container::Container;
use crate::net::tcp::conn::Connection;
use crate::net::tcp::DEFAULT_RECV_BUFFER_SIZE;
use crate::net::{errno, would_block, ConnId};
use crate::reactor::{EventSink, Handler, Pollable};
use crate::socket::Socket;

type ConnectFn<D> = dyn FnMut(&mut ClientCtx<D>, ConnId);
type ReceiveFn<D> = dyn FnMut(&mut ClientCtx<D>, ConnId, &[u8]);
type ClosedFn<D> = dyn FnMut(&mut ClientCtx<D>, ConnId);
type ErrorFn<D> = dyn FnMut(&mut ClientCtx<D>, &'static str, i32);

struct ClientTable<D> {
    connect: ActionList<ConnectFn<D>>,
    receive: ActionList<ReceiveFn<D>>,
    closed: ActionList<ClosedFn<D>>,
    error: ActionList<ErrorFn<D>>,
}

impl<D> ClientTable<D> {
    fn new() -> ClientTable<D> {
        ClientTable {
            connect: ActionList::new(),
            receive: ActionList::new(),
            closed: ActionList::new(),
            error: ActionList::new(),
        }
    }
}

struct Outbound<D> {
    conn: Connection,
    data: D,
    on_recv: ActionList<ReceiveFn<D>>,
    on_closed: ActionList<ClosedFn<D>>,
    on_error: ActionList<ErrorFn<D>>,
}

/// A TCP client: a set of outbound connections sharing one reactor.
///
/// `D` is user data mixed into every connection's state.
pub struct TcpClient<D = ()> {
    handler: Handler,
    ctx: Rc<RefCell<ClientCtx<D>>>,
}

/// The mutable inside of a [`TcpClient`], handed to its callbacks.
pub struct ClientCtx<D = ()> {
    handler: Handler,
    this: Weak<RefCell<ClientCtx<D>>>,
    conns: Container<Outbound<D>>,
    table: ClientTable<D>,
    recv_buf: Vec<u8>,
    resolve_retries: usize,
}

impl<D: Default + 'static> TcpClient<D> {
    pub fn new() -> io::Result<TcpClient<D>> {
        Ok(TcpClient::with_handler(Handler::new()?))
    }

    pub fn with_handler(handler: Handler) -> TcpClient<D> {
        let ctx = Rc::new(RefCell::new(ClientCtx {
            handler: handler.clone(),
            this: Weak::new(),
            conns: Container::new(),
            table: ClientTable::new(),
            recv_buf: vec![0; DEFAULT_RECV_BUFFER_SIZE],
            resolve_retries: crate::addr::MAX_RESOLVE_RETRIES,
        }));
        ctx.borrow_mut().this = Rc::downgrade(&ctx);
        TcpClient { handler, ctx }
    }

    /// Opens a connection to `host:port`. See [`ClientCtx::connect`].
    pub fn connect(&self, host: &str, port: u16, family: Family) -> io::Result<ConnId> {
        self.ctx.borrow_mut().connect(host, port, family)
    }

    /// Broadcasts `bytes` to every open connection; true when all writes
    /// were accepted or queued.
    pub fn send(&self, bytes: &[u8]) -> bool {
        self.ctx.borrow_mut().send(bytes)
    }

    /// Sends to one connection only.
    pub fn send_to_conn(&self, conn: ConnId, bytes: &[u8]) -> bool {
        self.ctx.borrow_mut().send_to_conn(conn, bytes)
    }

    pub fn close(&self) {
        self.ctx.borrow_mut().close();
    }

    /// Runs `f` against the client state, outside of any callback.
    pub fn with<R>(&self, f: impl FnOnce(&mut ClientCtx<D>) -> R) -> R {
        f(&mut self.ctx.borrow_mut())
    }

    /// Hook: a connection was established.
    pub fn on_connect(&self, flags: Flags, f: impl FnMut(&mut ClientCtx<D>, ConnId) + 'static) {
        self.ctx.borrow_mut().table.connect.push(flags, Rc::new(RefCell::new(f)));
    }

    /// Hook: bytes arrived on a connection.
    pub fn on_receive(&self, flags: Flags, f: impl FnMut(&mut ClientCtx<D>, ConnId, &[u8]) + 'static) {
        self.ctx.borrow_mut().table.receive.push(flags, Rc::new(RefCell::new(f)));
    }

    /// Hook: a connection closed (peer shutdown or local close).
    pub fn on_closed(&self, flags: Flags, f: impl FnMut(&mut ClientCtx<D>, ConnId) + 'static) {
        self.ctx.borrow_mut().table.closed.push(flags, Rc::new(RefCell::new(f)));
    }

    /// Hook: a syscall failed; receives the operation name and errno.
    pub fn on_error(&self, flags: Flags, f: impl FnMut(&mut ClientCtx<D>, &'static str, i32) + 'static) {
        self.ctx.borrow_mut().table.error.push(flags, Rc::new(RefCell::new(f)));
    }

    pub fn conn_count(&self) -> usize {
        self.ctx.borrow().conn_count()
    }

    pub fn set_recv_buffer_size(&self, size: usize) {
        self.ctx.borrow_mut().recv_buf = vec![0; size.max(1)];
    }

    pub fn set_resolve_retries(&self, retries: usize) {
        self.ctx.borrow_mut().resolve_retries = retries.max(1);
    }
}

impl<D: Default + 'static> Pollable for TcpClient<D> {
    fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl<D: Default + 'static> ClientCtx<D> {
    fn sink(&self) -> Weak<RefCell<dyn EventSink>> {
        self.this.clone()
    }

    /// Opens one connection: create, resolve, connect, register, then emit
    /// `CONNECT`. Any failing step closes the partial socket, emits
    /// `ERROR` with the failing operation's name, and returns the error.
    pub fn connect(&mut self, host: &str, port: u16, family: Family) -> io::Result<ConnId> {
        let mut socket = Socket::new(self.handler.clone());
        if let Err(e) = socket.open(family.af(), libc::SOCK_STREAM, 0) {
            self.emit_error("socket", errno(&e));
            return Err(e);
        }

        let addr = match Address::resolve_retrying(host, family, self.resolve_retries) {
            Ok(addr) => addr,
            Err(e) => {
                self.emit_error("getaddrinfo", 0);
                return Err(io::Error::new(io::ErrorKind::InvalidInput, e));
            }
        };
        *socket.addr_mut() = addr;
        if !socket.addr_mut().set_port(port) {
            self.emit_error("getaddrinfo", 0);
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        if let Err(e) = socket.connect() {
            self.emit_error("connect", errno(&e));
            return Err(e);
        }
        let fd = socket.fd();
        let peer = *socket.addr();

        let mut outbound = Outbound {
            conn: Connection::new(socket, peer),
            data: D::default(),
            on_recv: ActionList::new(),
            on_closed: ActionList::new(),
            on_error: ActionList::new(),
        };
        outbound.on_recv.push(
            Flags::DEFAULT,
            Rc::new(RefCell::new(|ctx: &mut Self, id: ConnId, bytes: &[u8]| {
                ctx.emit_receive(id, bytes)
            })),
        );
        outbound.on_closed.push(
            Flags::DEFAULT,
            Rc::new(RefCell::new(|ctx: &mut Self, id: ConnId| ctx.emit_closed(id))),
        );
        // Erasure is the last act of close; nothing may run after it.
        outbound.on_closed.push(
            Flags::QUEUE_END | Flags::STOP_AFTER,
            Rc::new(RefCell::new(|ctx: &mut Self, id: ConnId| {
                ctx.conns.remove(id.fd());
            })),
        );
        outbound.on_error.push(
            Flags::DEFAULT,
            Rc::new(RefCell::new(|ctx: &mut Self, op: &'static str, err: i32| {
                ctx.emit_error(op, err)
            })),
        );

        if self.conns.insert(fd, outbound).is_err() {
            self.emit_error("insert", 0);
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        if let Err(e) = self.handler.add(fd, self.sink()) {
            self.emit_error("register", errno(&e));
            self.conns.remove(fd);
            return Err(e);
        }

        let id = ConnId(fd);
        self.emit_connect(id);
        Ok(id)
    }

    /// Broadcasts to every open connection.
    pub fn send(&mut self, bytes: &[u8]) -> bool {
        let mut all = true;
        for fd in self.conns.fds() {
            all &= self.send_to_conn(ConnId(fd), bytes);
        }
        all
    }

    pub fn send_to_conn(&mut self, conn: ConnId, bytes: &[u8]) -> bool {
        let res = match self.conns.get_mut(conn.0) {
            None => return false,
            Some(outbound) => outbound.conn.send(bytes),
        };
        match res {
            Ok(()) => true,
            Err(e) => {
                self.conn_error(conn.0, "send", errno(&e));
                false
            }
        }
    }

    /// Closes one connection, emitting `CLOSED`.
    pub fn close_conn(&mut self, conn: ConnId) {
        let Some(outbound) = self.conns.get_mut(conn.0) else {
            return;
        };
        let hooks = outbound.on_closed.snapshot();
        outbound.conn.clear_buffer();
        outbound.conn.socket.close();
        hooks.deliver(self, |cb, ctx| cb(ctx, conn));
    }

    /// Closes every connection.
    pub fn close(&mut self) {
        while let Some(fd) = self.conns.first_fd() {
            self.close_conn(ConnId(fd));
        }
    }

    pub fn peer_addr(&self, conn: ConnId) -> Option<Address> {
        self.conns.get(conn.0).map(|c| c.conn.peer)
    }

    /// Bytes queued behind `conn`'s kernel send buffer.
    pub fn pending(&self, conn: ConnId) -> usize {
        self.conns.get(conn.0).map_or(0, |c| c.conn.pending())
    }

    pub fn data(&self, conn: ConnId) -> Option<&D> {
        self.conns.get(conn.0).map(|c| &c.data)
    }

    pub fn data_mut(&mut self, conn: ConnId) -> Option<&mut D> {
        self.conns.get_mut(conn.0).map(|c| &mut c.data)
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// A connection's underlying socket, for option tweaks.
    pub fn conn_socket(&self, conn: ConnId) -> Option<&Socket> {
        self.conns.get(conn.0).map(|c| &c.conn.socket)
    }

    fn conn_readable(&mut self, fd: RawFd) {
        let mut buf = mem::take(&mut self.recv_buf);
        let res = match self.conns.get_mut(fd) {
            None => {
                self.recv_buf = buf;
                return;
            }
            Some(outbound) => outbound.conn.recv(&mut buf),
        };
        match res {
            Ok(0) => {
                self.restore_buf(buf);
                self.close_conn(ConnId(fd));
            }
            Ok(n) => {
                if let Some(hooks) = self.conns.get(fd).map(|c| c.on_recv.snapshot()) {
                    hooks.deliver(self, |cb, ctx| cb(ctx, ConnId(fd), &buf[..n]));
                }
                self.restore_buf(buf);
            }
            Err(ref e) if would_block(e) => self.restore_buf(buf),
            Err(e) => {
                self.restore_buf(buf);
                self.conn_error(fd, "recv", errno(&e));
            }
        }
    }

    fn conn_writable(&mut self, fd: RawFd) {
        let res = match self.conns.get_mut(fd) {
            None => return,
            Some(outbound) => outbound.conn.flush(),
        };
        if let Err(e) = res {
            self.conn_error(fd, "send", errno(&e));
        }
    }

    fn conn_error(&mut self, fd: RawFd, op: &'static str, err: i32) {
        let Some(hooks) = self.conns.get(fd).map(|c| c.on_error.snapshot()) else {
            return;
        };
        hooks.deliver(self, |cb, ctx| cb(ctx, op, err));
    }

    fn emit_connect(&mut self, id: ConnId) {
        let hooks = self.table.connect.snapshot();
        hooks.deliver(self, |cb, ctx| cb(ctx, id));
    }

    fn emit_receive(&mut self, id: ConnId, bytes: &[u8]) {
        let hooks = self.table.receive.snapshot();
        hooks.deliver(self, |cb, ctx| cb(ctx, id, bytes));
    }

    fn emit_closed(&mut self, id: ConnId) {
        let hooks = self.table.closed.snapshot();
        hooks.deliver(self, |cb, ctx| cb(ctx, id));
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

impl<D> std::fmt::Debug for TcpClient<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient").field("handler", &self.handler).finish()
    }
}

impl<D> std::fmt::Debug for ClientCtx<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCtx").field("conns", &self.conns.len()).finish()
    }
}

impl<D: Default + 'static> EventSink for ClientCtx<D> {
    fn on_readable(&mut self, fd: RawFd) {
        self.conn_readable(fd);
    }

    fn on_writable(&mut self, fd: RawFd) {
        self.conn_writable(fd);
    }
}
