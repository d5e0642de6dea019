use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::actions::{ActionList, Flags};
use crate::addr::{Address, Family};
use crate::container::Container;
use crate::net::tcp::conn::Connection;
use crate::net::tcp::{DEFAULT_BACKLOG, DEFAULT_RECV_BUFFER_SIZE};
use crate::net::{errno, would_block, ConnId, ListenerId};
use crate::reactor::{EventSink, Handler, Pollable};
use crate::socket::Socket;

type ListenFn<LD, CD> = dyn FnMut(&mut ServerCtx<LD, CD>, ListenerId);
type AcceptFn<LD, CD> = dyn FnMut(&mut ServerCtx<LD, CD>, ConnId);
type ReceiveFn<LD, CD> = dyn FnMut(&mut ServerCtx<LD, CD>, ConnId, &[u8]);
type DisconnectFn<LD, CD> = dyn FnMut(&mut ServerCtx<LD, CD>, ConnId);
type ClosedFn<LD, CD> = dyn FnMut(&mut ServerCtx<LD, CD>, ListenerId);
type ErrorFn<LD, CD> = dyn FnMut(&mut ServerCtx<LD, CD>, &'static str, i32);

/// The server's action table: one ordered callback list per event tag.
struct ServerTable<LD, CD> {
    listen: ActionList<ListenFn<LD, CD>>,
    accept: ActionList<AcceptFn<LD, CD>>,
    receive: ActionList<ReceiveFn<LD, CD>>,
    disconnect: ActionList<DisconnectFn<LD, CD>>,
    closed: ActionList<ClosedFn<LD, CD>>,
    error: ActionList<ErrorFn<LD, CD>>,
}

impl<LD, CD> ServerTable<LD, CD> {
    fn new() -> ServerTable<LD, CD> {
        ServerTable {
            listen: ActionList::new(),
            accept: ActionList::new(),
            receive: ActionList::new(),
            disconnect: ActionList::new(),
            closed: ActionList::new(),
            error: ActionList::new(),
        }
    }
}

struct Listener<LD, CD> {
    socket: Socket,
    data: LD,
    on_closed: ActionList<ClosedFn<LD, CD>>,
}

struct Client<LD, CD> {
    conn: Connection,
    data: CD,
    on_recv: ActionList<ReceiveFn<LD, CD>>,
    on_closed: ActionList<DisconnectFn<LD, CD>>,
    on_error: ActionList<ErrorFn<LD, CD>>,
}

/// A TCP server: any number of listening sockets plus the connections
/// accepted from them, all driven by one reactor.
///
/// `LD` and `CD` are user data mixed into every listener and every
/// accepted connection; both default to `()`.
///
/// The handle registers callbacks and issues operations from outside the
/// event loop. Inside callbacks, the same operations are available on the
/// [`ServerCtx`] passed as the first argument — use that, not the handle.
///
/// # Examples
///
/// ```no_run
/// use netpoll::net::TcpServer;
/// use netpoll::{Family, Flags};
///
/// # fn main() -> std::io::Result<()> {
/// let server: TcpServer = TcpServer::new()?;
/// server.on_receive(Flags::DEFAULT, |ctx, conn, bytes| {
///     // Echo whatever arrives.
///     ctx.send(conn, bytes);
/// });
/// server.listen("127.0.0.1", 8000, Family::Ipv4)?;
/// loop {
///     netpoll::poll(&server, None)?;
/// }
/// # }
/// ```
pub struct TcpServer<LD = (), CD = ()> {
    handler: Handler,
    ctx: Rc<RefCell<ServerCtx<LD, CD>>>,
}

/// The mutable inside of a [`TcpServer`], handed to its callbacks.
pub struct ServerCtx<LD = (), CD = ()> {
    handler: Handler,
    this: Weak<RefCell<ServerCtx<LD, CD>>>,
    listeners: Container<Listener<LD, CD>>,
    clients: Container<Client<LD, CD>>,
    table: ServerTable<LD, CD>,
    backlog: libc::c_int,
    recv_buf: Vec<u8>,
    resolve_retries: usize,
}

impl<LD: Default + 'static, CD: Default + 'static> TcpServer<LD, CD> {
    /// A server with its own reactor.
    pub fn new() -> io::Result<TcpServer<LD, CD>> {
        Ok(TcpServer::with_handler(Handler::new()?))
    }

    /// A server sharing `handler` with other endpoints; one [`poll`] call
    /// then drives them all.
    ///
    /// [`poll`]: crate::poll
    pub fn with_handler(handler: Handler) -> TcpServer<LD, CD> {
        let ctx = Rc::new(RefCell::new(ServerCtx {
            handler: handler.clone(),
            this: Weak::new(),
            listeners: Container::new(),
            clients: Container::new(),
            table: ServerTable::new(),
            backlog: DEFAULT_BACKLOG,
            recv_buf: vec![0; DEFAULT_RECV_BUFFER_SIZE],
            resolve_retries: crate::addr::MAX_RESOLVE_RETRIES,
        }));
        ctx.borrow_mut().this = Rc::downgrade(&ctx);
        TcpServer { handler, ctx }
    }

    /// Starts listening on `host:port`. See [`ServerCtx::listen`].
    pub fn listen(&self, host: &str, port: u16, family: Family) -> io::Result<ListenerId> {
        self.ctx.borrow_mut().listen(host, port, family)
    }

    /// Sends to one connection. See [`ServerCtx::send`].
    pub fn send(&self, conn: ConnId, bytes: &[u8]) -> bool {
        self.ctx.borrow_mut().send(conn, bytes)
    }

    /// Closes every listener and every accepted connection.
    pub fn close(&self) {
        self.ctx.borrow_mut().close();
    }

    /// Runs `f` against the server state, outside of any callback.
    pub fn with<R>(&self, f: impl FnOnce(&mut ServerCtx<LD, CD>) -> R) -> R {
        f(&mut self.ctx.borrow_mut())
    }

    /// Hook: a listener came up.
    pub fn on_listen(&self, flags: Flags, f: impl FnMut(&mut ServerCtx<LD, CD>, ListenerId) + 'static) {
        self.ctx.borrow_mut().table.listen.push(flags, Rc::new(RefCell::new(f)));
    }

    /// Hook: a connection was accepted.
    pub fn on_accept(&self, flags: Flags, f: impl FnMut(&mut ServerCtx<LD, CD>, ConnId) + 'static) {
        self.ctx.borrow_mut().table.accept.push(flags, Rc::new(RefCell::new(f)));
    }

    /// Hook: bytes arrived on an accepted connection.
    pub fn on_receive(
        &self,
        flags: Flags,
        f: impl FnMut(&mut ServerCtx<LD, CD>, ConnId, &[u8]) + 'static,
    ) {
        self.ctx.borrow_mut().table.receive.push(flags, Rc::new(RefCell::new(f)));
    }

    /// Hook: an accepted connection went away (peer shutdown or local
    /// close).
    pub fn on_disconnect(
        &self,
        flags: Flags,
        f: impl FnMut(&mut ServerCtx<LD, CD>, ConnId) + 'static,
    ) {
        self.ctx.borrow_mut().table.disconnect.push(flags, Rc::new(RefCell::new(f)));
    }

    /// Hook: a listening socket closed.
    pub fn on_closed(&self, flags: Flags, f: impl FnMut(&mut ServerCtx<LD, CD>, ListenerId) + 'static) {
        self.ctx.borrow_mut().table.closed.push(flags, Rc::new(RefCell::new(f)));
    }

    /// Hook: a syscall failed; receives the operation name and errno.
    pub fn on_error(
        &self,
        flags: Flags,
        f: impl FnMut(&mut ServerCtx<LD, CD>, &'static str, i32) + 'static,
    ) {
        self.ctx.borrow_mut().table.error.push(flags, Rc::new(RefCell::new(f)));
    }

    pub fn listener_count(&self) -> usize {
        self.ctx.borrow().listener_count()
    }

    pub fn client_count(&self) -> usize {
        self.ctx.borrow().client_count()
    }

    /// Local address of a listener (with the kernel-assigned port after an
    /// ephemeral bind).
    pub fn local_addr(&self, listener: ListenerId) -> Option<Address> {
        self.ctx.borrow().local_addr(listener)
    }

    pub fn set_backlog(&self, backlog: u32) {
        self.ctx.borrow_mut().backlog = backlog as libc::c_int;
    }

    pub fn set_recv_buffer_size(&self, size: usize) {
        self.ctx.borrow_mut().recv_buf = vec![0; size.max(1)];
    }

    pub fn set_resolve_retries(&self, retries: usize) {
        self.ctx.borrow_mut().resolve_retries = retries.max(1);
    }
}

impl<LD: Default + 'static, CD: Default + 'static> Pollable for TcpServer<LD, CD> {
    fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl<LD: Default + 'static, CD: Default + 'static> ServerCtx<LD, CD> {
    fn sink(&self) -> Weak<RefCell<dyn EventSink>> {
        self.this.clone()
    }

    /// Brings up one listening socket: create, resolve, bind, listen,
    /// register, then emit `LISTEN`. Any failing step closes the partial
    /// listener, emits `ERROR` with the failing operation's name, and
    /// returns the error.
    pub fn listen(&mut self, host: &str, port: u16, family: Family) -> io::Result<ListenerId> {
        let mut socket = Socket::new(self.handler.clone());
        if let Err(e) = socket.open(family.af(), libc::SOCK_STREAM, 0) {
            self.emit_error("socket", errno(&e));
            return Err(e);
        }
        let _ = socket.set_reuseaddr(true);

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

        if let Err(e) = socket.bind() {
            self.emit_error("bind", errno(&e));
            return Err(e);
        }
        if let Err(e) = socket.listen(self.backlog) {
            self.emit_error("listen", errno(&e));
            return Err(e);
        }
        let _ = socket.refresh_local_addr();
        let fd = socket.fd();

        let mut listener = Listener {
            socket,
            data: LD::default(),
            on_closed: ActionList::new(),
        };
        listener.on_closed.push(
            Flags::DEFAULT,
            Rc::new(RefCell::new(|ctx: &mut Self, id: ListenerId| ctx.emit_closed(id))),
        );
        // Erasure is the last act of close; nothing may run after it.
        listener.on_closed.push(
            Flags::QUEUE_END | Flags::STOP_AFTER,
            Rc::new(RefCell::new(|ctx: &mut Self, id: ListenerId| {
                ctx.listeners.remove(id.fd());
            })),
        );

        if self.listeners.insert(fd, listener).is_err() {
            self.emit_error("insert", 0);
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        if let Err(e) = self.handler.add(fd, self.sink()) {
            self.emit_error("register", errno(&e));
            self.listeners.remove(fd);
            return Err(e);
        }

        let id = ListenerId(fd);
        self.emit_listen(id);
        Ok(id)
    }

    /// One non-blocking write to `conn`, queueing the remainder for
    /// writable readiness. Returns false when the connection is unknown or
    /// the write failed outright (`ERROR` fires in that case).
    pub fn send(&mut self, conn: ConnId, bytes: &[u8]) -> bool {
        let res = match self.clients.get_mut(conn.0) {
            None => return false,
            Some(client) => client.conn.send(bytes),
        };
        match res {
            Ok(()) => true,
            Err(e) => {
                self.client_error(conn.0, "send", errno(&e));
                false
            }
        }
    }

    /// Closes one accepted connection, emitting `DISCONNECT`.
    pub fn disconnect(&mut self, conn: ConnId) {
        self.close_client(conn.0);
    }

    /// Closes one listener, emitting `CLOSED`. Accepted connections stay.
    pub fn close_listener(&mut self, listener: ListenerId) {
        let Some(rec) = self.listeners.get_mut(listener.fd()) else {
            return;
        };
        let hooks = rec.on_closed.snapshot();
        rec.socket.close();
        hooks.deliver(self, |cb, ctx| cb(ctx, listener));
    }

    /// Closes both socket sets: first every accepted connection, then
    /// every listener. Each close self-erases, so this drains by always
    /// taking the first entry.
    pub fn close(&mut self) {
        while let Some(fd) = self.clients.first_fd() {
            self.close_client(fd);
        }
        while let Some(fd) = self.listeners.first_fd() {
            self.close_listener(ListenerId(fd));
        }
    }

    pub fn peer_addr(&self, conn: ConnId) -> Option<Address> {
        self.clients.get(conn.0).map(|c| c.conn.peer)
    }

    pub fn local_addr(&self, listener: ListenerId) -> Option<Address> {
        self.listeners.get(listener.fd()).map(|l| *l.socket.addr())
    }

    /// Bytes queued behind `conn`'s kernel send buffer.
    pub fn pending(&self, conn: ConnId) -> usize {
        self.clients.get(conn.0).map_or(0, |c| c.conn.pending())
    }

    pub fn data(&self, conn: ConnId) -> Option<&CD> {
        self.clients.get(conn.0).map(|c| &c.data)
    }

    pub fn data_mut(&mut self, conn: ConnId) -> Option<&mut CD> {
        self.clients.get_mut(conn.0).map(|c| &mut c.data)
    }

    pub fn listener_data(&self, listener: ListenerId) -> Option<&LD> {
        self.listeners.get(listener.fd()).map(|l| &l.data)
    }

    pub fn listener_data_mut(&mut self, listener: ListenerId) -> Option<&mut LD> {
        self.listeners.get_mut(listener.fd()).map(|l| &mut l.data)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// The listener's underlying socket, for option tweaks.
    pub fn listener_socket(&self, listener: ListenerId) -> Option<&Socket> {
        self.listeners.get(listener.fd()).map(|l| &l.socket)
    }

    /// An accepted connection's underlying socket, for option tweaks.
    pub fn conn_socket(&self, conn: ConnId) -> Option<&Socket> {
        self.clients.get(conn.0).map(|c| &c.conn.socket)
    }

    /// A listener became readable: accept one connection and wire it up.
    fn accept_from(&mut self, listener_fd: RawFd) {
        let accepted = match self.listeners.get(listener_fd) {
            None => return,
            Some(rec) => rec.socket.accept(),
        };
        let (fd, peer) = match accepted {
            Ok(pair) => pair,
            Err(ref e) if would_block(e) => return,
            Err(e) => {
                self.emit_error("accept", errno(&e));
                return;
            }
        };

        let socket = Socket::from_fd(self.handler.clone(), fd);
        let mut client = Client {
            conn: Connection::new(socket, peer),
            data: CD::default(),
            on_recv: ActionList::new(),
            on_closed: ActionList::new(),
            on_error: ActionList::new(),
        };
        client.on_recv.push(
            Flags::DEFAULT,
            Rc::new(RefCell::new(|ctx: &mut Self, id: ConnId, bytes: &[u8]| {
                ctx.emit_receive(id, bytes)
            })),
        );
        client.on_closed.push(
            Flags::DEFAULT,
            Rc::new(RefCell::new(|ctx: &mut Self, id: ConnId| ctx.emit_disconnect(id))),
        );
        client.on_closed.push(
            Flags::QUEUE_END | Flags::STOP_AFTER,
            Rc::new(RefCell::new(|ctx: &mut Self, id: ConnId| {
                ctx.clients.remove(id.fd());
            })),
        );
        client.on_error.push(
            Flags::DEFAULT,
            Rc::new(RefCell::new(|ctx: &mut Self, op: &'static str, err: i32| {
                ctx.emit_error(op, err)
            })),
        );

        if self.clients.insert(fd, client).is_err() {
            self.emit_error("insert", 0);
            return;
        }
        if let Err(e) = self.handler.add(fd, self.sink()) {
            self.emit_error("register", errno(&e));
            self.clients.remove(fd);
            return;
        }
        self.emit_accept(ConnId(fd));
    }

    /// One recv round for an accepted connection: bytes dispatch the
    /// connection's RECV hooks, zero closes, an error fires ERROR and
    /// leaves the connection open for the callback to decide.
    fn client_readable(&mut self, fd: RawFd) {
        let mut buf = mem::take(&mut self.recv_buf);
        let res = match self.clients.get_mut(fd) {
            None => {
                self.recv_buf = buf;
                return;
            }
            Some(client) => client.conn.recv(&mut buf),
        };
        match res {
            Ok(0) => {
                self.restore_buf(buf);
                self.close_client(fd);
            }
            Ok(n) => {
                if let Some(hooks) = self.clients.get(fd).map(|c| c.on_recv.snapshot()) {
                    hooks.deliver(self, |cb, ctx| cb(ctx, ConnId(fd), &buf[..n]));
                }
                self.restore_buf(buf);
            }
            Err(ref e) if would_block(e) => self.restore_buf(buf),
            Err(e) => {
                self.restore_buf(buf);
                self.client_error(fd, "recv", errno(&e));
            }
        }
    }

    fn client_writable(&mut self, fd: RawFd) {
        let res = match self.clients.get_mut(fd) {
            None => return,
            Some(client) => client.conn.flush(),
        };
        if let Err(e) = res {
            self.client_error(fd, "send", errno(&e));
        }
    }

    fn close_client(&mut self, fd: RawFd) {
        let Some(client) = self.clients.get_mut(fd) else {
            return;
        };
        let hooks = client.on_closed.snapshot();
        client.conn.clear_buffer();
        client.conn.socket.close();
        hooks.deliver(self, |cb, ctx| cb(ctx, ConnId(fd)));
    }

    fn client_error(&mut self, fd: RawFd, op: &'static str, err: i32) {
        let Some(hooks) = self.clients.get(fd).map(|c| c.on_error.snapshot()) else {
            return;
        };
        hooks.deliver(self, |cb, ctx| cb(ctx, op, err));
    }

    fn emit_listen(&mut self, id: ListenerId) {
        let hooks = self.table.listen.snapshot();
        hooks.deliver(self, |cb, ctx| cb(ctx, id));
    }

    fn emit_accept(&mut self, id: ConnId) {
        let hooks = self.table.accept.snapshot();
        hooks.deliver(self, |cb, ctx| cb(ctx, id));
    }

    fn emit_receive(&mut self, id: ConnId, bytes: &[u8]) {
        let hooks = self.table.receive.snapshot();
        hooks.deliver(self, |cb, ctx| cb(ctx, id, bytes));
    }

    fn emit_disconnect(&mut self, id: ConnId) {
        let hooks = self.table.disconnect.snapshot();
        hooks.deliver(self, |cb, ctx| cb(ctx, id));
    }

    fn emit_closed(&mut self, id: ListenerId) {
        let hooks = self.table.closed.snapshot();
        hooks.deliver(self, |cb, ctx| cb(ctx, id));
    }

    fn emit_error(&mut self, op: &'static str, err: i32) {
        let hooks = self.table.error.snapshot();
        hooks.deliver(self, |cb, ctx| cb(ctx, op, err));
    }

    fn restore_buf(&mut self, buf: Vec<u8>) {
        // A callback may have swapped in a resized buffer; keep theirs.
        if self.recv_buf.is_empty() {
            self.recv_buf = buf;
        }
    }
}

impl<LD, CD> std::fmt::Debug for TcpServer<LD, CD> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer").field("handler", &self.handler).finish()
    }
}

impl<LD, CD> std::fmt::Debug for ServerCtx<LD, CD> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCtx")
            .field("listeners", &self.listeners.len())
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl<LD: Default + 'static, CD: Default + 'static> EventSink for ServerCtx<LD, CD> {
    fn on_readable(&mut self, fd: RawFd) {
        if self.listeners.contains(fd) {
            self.accept_from(fd);
        } else if self.clients.contains(fd) {
            self.client_readable(fd);
        }
    }

    fn on_writable(&mut self, fd: RawFd) {
        self.client_writable(fd);
    }
}
