use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use rand::RngCore;

use netpoll::net::{ConnId, TcpClient, TcpServer};
use netpoll::{Family, Flags, Handler};

mod util;
use util::{init, poll_until};

#[test]
fn echo_round_trip() {
    init();

    let handler = Handler::new().unwrap();
    let server: TcpServer = TcpServer::with_handler(handler.clone());
    let client: TcpClient = TcpClient::with_handler(handler.clone());

    let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        server.on_accept(Flags::DEFAULT, move |_ctx, _conn| {
            log.borrow_mut().push("accept".to_owned());
        });
    }
    {
        let log = log.clone();
        server.on_receive(Flags::DEFAULT, move |ctx, conn, bytes| {
            log.borrow_mut()
                .push(format!("receive:{}", String::from_utf8_lossy(bytes)));
            assert!(ctx.send(conn, b"pong"));
        });
    }
    {
        let log = log.clone();
        server.on_disconnect(Flags::DEFAULT, move |_ctx, _conn| {
            log.borrow_mut().push("disconnect".to_owned());
        });
    }

    let listener = server.listen("127.0.0.1", 0, Family::Ipv4).unwrap();
    let port = server.local_addr(listener).unwrap().port().unwrap();
    assert_ne!(port, 0);

    let got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let got = got.clone();
        client.on_receive(Flags::DEFAULT, move |_ctx, _conn, bytes| {
            got.borrow_mut().extend_from_slice(bytes);
        });
    }

    let conn = client.connect("127.0.0.1", port, Family::Ipv4).unwrap();
    assert!(client.send(b"ping"));

    {
        let got = got.clone();
        poll_until(&handler, move || got.borrow().len() >= 4);
    }
    assert_eq!(&got.borrow()[..], b"pong");
    assert_eq!(server.client_count(), 1);

    client.with(|ctx| ctx.close_conn(conn));
    {
        let log = log.clone();
        poll_until(&handler, move || {
            log.borrow().iter().any(|entry| entry == "disconnect")
        });
    }

    let log = log.borrow();
    assert_eq!(log[0], "accept");
    assert_eq!(log[1], "receive:ping");
    assert_eq!(log[2], "disconnect");
    assert_eq!(server.client_count(), 0);
}

#[test]
fn multi_listener_counts() {
    init();

    let handler = Handler::new().unwrap();
    let server: TcpServer = TcpServer::with_handler(handler.clone());

    let mut ports = Vec::new();
    for _ in 0..5 {
        let listener = server.listen("127.0.0.1", 0, Family::Ipv4).unwrap();
        ports.push(server.local_addr(listener).unwrap().port().unwrap());
    }
    assert_eq!(server.listener_count(), 5);
    assert_eq!(handler.count(), 5);

    let accepted = Rc::new(Cell::new(0u32));
    {
        let accepted = accepted.clone();
        server.on_accept(Flags::DEFAULT, move |_ctx, _conn| {
            accepted.set(accepted.get() + 1);
        });
    }

    // A connection to any one port yields exactly one accept.
    let _stream = net::TcpStream::connect(("127.0.0.1", ports[2])).unwrap();
    {
        let accepted = accepted.clone();
        poll_until(&handler, move || accepted.get() == 1);
    }
    assert_eq!(accepted.get(), 1);
    assert_eq!(handler.count(), 5 + 1);
    assert_eq!(server.client_count(), 1);
}

#[test]
fn backpressure_drains_and_clears_write_interest() {
    init();

    const PAYLOAD: usize = 4 << 20;

    let handler = Handler::new().unwrap();
    let server: TcpServer = TcpServer::with_handler(handler.clone());

    let mut payload = vec![0u8; PAYLOAD];
    rand::rng().fill_bytes(&mut payload);

    let accepted: Rc<Cell<Option<ConnId>>> = Rc::new(Cell::new(None));
    {
        let accepted = accepted.clone();
        let payload = payload.clone();
        server.on_accept(Flags::DEFAULT, move |ctx, conn| {
            accepted.set(Some(conn));
            assert!(ctx.send(conn, &payload));
        });
    }

    let listener = server.listen("127.0.0.1", 0, Family::Ipv4).unwrap();
    let port = server.local_addr(listener).unwrap().port().unwrap();

    let reader = thread::spawn(move || {
        let mut stream = net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut buf = vec![0u8; PAYLOAD];
        let mut read = 0;
        while read < PAYLOAD {
            let n = stream.read(&mut buf[read..]).unwrap();
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        buf
    });

    {
        let accepted = accepted.clone();
        poll_until(&handler, move || accepted.get().is_some());
    }
    let conn = accepted.get().unwrap();

    // One send call cannot fit 4 MiB in the kernel buffer: the tail is
    // queued and write interest is on.
    assert!(server.with(|ctx| ctx.pending(conn)) > 0);
    assert!(handler.wants_write(conn.fd()));

    // Successive pollouts drain the queue as the peer reads.
    poll_until(&handler, || server.with(|ctx| ctx.pending(conn)) == 0);
    assert!(!handler.wants_write(conn.fd()));

    let received = reader.join().unwrap();
    assert_eq!(received.len(), PAYLOAD);
    assert_eq!(received, payload);
}

#[test]
fn zero_byte_send_never_queues() {
    init();

    let handler = Handler::new().unwrap();
    let server: TcpServer = TcpServer::with_handler(handler.clone());

    let accepted: Rc<Cell<Option<ConnId>>> = Rc::new(Cell::new(None));
    {
        let accepted = accepted.clone();
        server.on_accept(Flags::DEFAULT, move |_ctx, conn| accepted.set(Some(conn)));
    }

    let listener = server.listen("127.0.0.1", 0, Family::Ipv4).unwrap();
    let port = server.local_addr(listener).unwrap().port().unwrap();
    let _stream = net::TcpStream::connect(("127.0.0.1", port)).unwrap();

    {
        let accepted = accepted.clone();
        poll_until(&handler, move || accepted.get().is_some());
    }
    let conn = accepted.get().unwrap();

    assert!(server.send(conn, b""));
    assert_eq!(server.with(|ctx| ctx.pending(conn)), 0);
    assert!(!handler.wants_write(conn.fd()));
}

#[test]
fn listen_resolve_failure_leaves_reactor_untouched() {
    init();

    let handler = Handler::new().unwrap();
    let server: TcpServer = TcpServer::with_handler(handler.clone());

    let errors: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let errors = errors.clone();
        server.on_error(Flags::DEFAULT, move |_ctx, op, _errno| {
            errors.borrow_mut().push(op);
        });
    }

    let before = handler.count();
    assert!(server.listen("host.invalid.", 8000, Family::Ipv4).is_err());
    assert_eq!(errors.borrow()[..], ["getaddrinfo"]);
    assert_eq!(handler.count(), before);
    assert_eq!(server.listener_count(), 0);
}

#[test]
fn connect_refused_emits_error() {
    init();

    // Grab a port that is free right now.
    let port = {
        let probe = net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let client: TcpClient = TcpClient::new().unwrap();
    let errors: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let errors = errors.clone();
        client.on_error(Flags::DEFAULT, move |_ctx, op, _errno| {
            errors.borrow_mut().push(op);
        });
    }

    assert!(client.connect("127.0.0.1", port, Family::Ipv4).is_err());
    assert_eq!(errors.borrow()[..], ["connect"]);
    assert_eq!(client.conn_count(), 0);
}

#[test]
fn close_inside_receive_callback_is_epoch_safe() {
    init();

    let handler = Handler::new().unwrap();
    let server: TcpServer = TcpServer::with_handler(handler.clone());

    server.on_receive(Flags::DEFAULT, |ctx, _conn, _bytes| {
        // Tear the whole server down from inside dispatch.
        ctx.close();
    });

    let listener = server.listen("127.0.0.1", 0, Family::Ipv4).unwrap();
    let port = server.local_addr(listener).unwrap().port().unwrap();

    let mut stream = net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(b"x").unwrap();

    poll_until(&handler, || handler.count() == 0);
    assert_eq!(server.client_count(), 0);
    assert_eq!(server.listener_count(), 0);

    // The loop is over: an empty reactor polls out immediately.
    let start = Instant::now();
    let n = netpoll::poll(&handler, Some(Duration::ZERO)).unwrap();
    assert_eq!(n, 0);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn open_close_cycles_do_not_leak_registrations() {
    init();

    let handler = Handler::new().unwrap();
    let server: TcpServer = TcpServer::with_handler(handler.clone());

    for _ in 0..2 {
        let listener = server.listen("127.0.0.1", 0, Family::Ipv4).unwrap();
        assert_eq!(handler.count(), 1);
        server.with(|ctx| ctx.close_listener(listener));
        assert_eq!(handler.count(), 0);
        assert!(handler.is_empty());
    }
}

#[test]
fn epoch_increases_on_registration_changes() {
    init();

    let handler = Handler::new().unwrap();
    let server: TcpServer = TcpServer::with_handler(handler.clone());

    let e0 = handler.epoch();
    let listener = server.listen("127.0.0.1", 0, Family::Ipv4).unwrap();
    let e1 = handler.epoch();
    assert_ne!(e0, e1);
    server.with(|ctx| ctx.close_listener(listener));
    assert_ne!(handler.epoch(), e1);
}

#[test]
fn listen_and_connect_actions_fire_synchronously() {
    init();

    let handler = Handler::new().unwrap();
    let server: TcpServer = TcpServer::with_handler(handler.clone());
    let client: TcpClient = TcpClient::with_handler(handler.clone());

    let listened = Rc::new(Cell::new(false));
    {
        let listened = listened.clone();
        server.on_listen(Flags::DEFAULT, move |_ctx, _listener| listened.set(true));
    }
    let connected = Rc::new(Cell::new(false));
    {
        let connected = connected.clone();
        client.on_connect(Flags::DEFAULT, move |_ctx, _conn| connected.set(true));
    }

    let listener = server.listen("127.0.0.1", 0, Family::Ipv4).unwrap();
    assert!(listened.get());

    let port = server.local_addr(listener).unwrap().port().unwrap();
    client.connect("127.0.0.1", port, Family::Ipv4).unwrap();
    assert!(connected.get());
}

#[test]
fn server_disconnect_closes_the_client_side() {
    init();

    let handler = Handler::new().unwrap();
    let server: TcpServer = TcpServer::with_handler(handler.clone());
    let client: TcpClient = TcpClient::with_handler(handler.clone());

    // Kick every connection out as soon as it says anything.
    server.on_receive(Flags::DEFAULT, |ctx, conn, _bytes| ctx.disconnect(conn));

    let closed = Rc::new(Cell::new(false));
    {
        let closed = closed.clone();
        client.on_closed(Flags::DEFAULT, move |_ctx, _conn| closed.set(true));
    }

    let listener = server.listen("127.0.0.1", 0, Family::Ipv4).unwrap();
    let port = server.local_addr(listener).unwrap().port().unwrap();
    client.connect("127.0.0.1", port, Family::Ipv4).unwrap();
    assert!(client.send(b"bye"));

    {
        let closed = closed.clone();
        poll_until(&handler, move || closed.get());
    }
    assert_eq!(client.conn_count(), 0);
    assert_eq!(server.client_count(), 0);
}

#[test]
fn broadcast_reaches_every_connection() {
    init();

    let handler = Handler::new().unwrap();
    let server: TcpServer = TcpServer::with_handler(handler.clone());
    let client: TcpClient = TcpClient::with_handler(handler.clone());

    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let received = received.clone();
        server.on_receive(Flags::DEFAULT, move |_ctx, _conn, bytes| {
            received.borrow_mut().extend_from_slice(bytes);
        });
    }

    let listener = server.listen("127.0.0.1", 0, Family::Ipv4).unwrap();
    let port = server.local_addr(listener).unwrap().port().unwrap();

    client.connect("127.0.0.1", port, Family::Ipv4).unwrap();
    client.connect("127.0.0.1", port, Family::Ipv4).unwrap();
    assert_eq!(client.conn_count(), 2);

    assert!(client.send(b"hi"));
    {
        let received = received.clone();
        poll_until(&handler, move || received.borrow().len() >= 4);
    }
    assert_eq!(&received.borrow()[..], b"hihi");
}
