use std::cell::{Cell, RefCell};
use std::rc::Rc;

use netpoll::net::{send_to, RecvMode, SendResult, UdpSocket};
use netpoll::{Address, Family, Flags, Handler};

mod util;
use util::{init, poll_until};

#[test]
fn bind_emits_bind_action() {
    init();

    let handler = Handler::new().unwrap();
    let socket: UdpSocket = UdpSocket::with_handler(handler.clone());

    let bound: Rc<Cell<Option<u16>>> = Rc::new(Cell::new(None));
    {
        let bound = bound.clone();
        socket.on_bind(Flags::DEFAULT, move |_ctx, addr| {
            bound.set(addr.port());
        });
    }

    socket.bind("127.0.0.1", 0, Family::Ipv4).unwrap();
    let port = bound.get().expect("BIND did not fire");
    assert_ne!(port, 0);
    assert_eq!(socket.local_addr().unwrap().port(), Some(port));
    assert_eq!(handler.count(), 1);
}

#[test]
fn recvfrom_round_trip() {
    init();

    let handler = Handler::new().unwrap();
    let receiver: UdpSocket = UdpSocket::with_handler(handler.clone());
    let sender: UdpSocket = UdpSocket::with_handler(handler.clone());

    receiver.bind("127.0.0.1", 0, Family::Ipv4).unwrap();
    sender.bind("127.0.0.1", 0, Family::Ipv4).unwrap();
    let to = receiver.local_addr().unwrap();
    let sender_port = sender.local_addr().unwrap().port();

    let got: Rc<RefCell<Vec<(Option<u16>, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let got = got.clone();
        receiver.on_recvfrom(Flags::DEFAULT, move |_ctx, src, bytes| {
            got.borrow_mut().push((src.port(), bytes.to_vec()));
        });
    }

    assert_eq!(sender.send_to(&to, b"datagram"), SendResult::Success);
    {
        let got = got.clone();
        poll_until(&handler, move || !got.borrow().is_empty());
    }

    let got = got.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, sender_port);
    assert_eq!(got[0].1, b"datagram");
}

#[test]
fn recvmsg_mode_carries_metadata() {
    init();

    let handler = Handler::new().unwrap();
    let receiver: UdpSocket = UdpSocket::with_handler(handler.clone());
    receiver.set_recv_mode(RecvMode::RecvMsg);
    receiver.bind("127.0.0.1", 0, Family::Ipv4).unwrap();
    let to = receiver.local_addr().unwrap();

    let got: Rc<RefCell<Vec<(Option<u16>, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let got = got.clone();
        receiver.on_recvmsg(Flags::DEFAULT, move |_ctx, msg| {
            got.borrow_mut().push((msg.addr.port(), msg.bytes.to_vec()));
        });
    }

    assert_eq!(send_to(&to, b"meta"), SendResult::Success);
    {
        let got = got.clone();
        poll_until(&handler, move || !got.borrow().is_empty());
    }

    let got = got.borrow();
    assert_eq!(got[0].1, b"meta");
    assert!(got[0].0.is_some());
}

#[test]
fn one_shot_send_to() {
    init();

    let handler = Handler::new().unwrap();
    let receiver: UdpSocket = UdpSocket::with_handler(handler.clone());
    receiver.bind("127.0.0.1", 0, Family::Ipv4).unwrap();
    let to = receiver.local_addr().unwrap();

    let got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let got = got.clone();
        receiver.on_recvfrom(Flags::DEFAULT, move |_ctx, _src, bytes| {
            got.borrow_mut().extend_from_slice(bytes);
        });
    }

    assert_eq!(send_to(&to, b"fire-and-forget"), SendResult::Success);
    {
        let got = got.clone();
        poll_until(&handler, move || !got.borrow().is_empty());
    }
    assert_eq!(&got.borrow()[..], b"fire-and-forget");
}

#[test]
fn oversized_datagram_fails() {
    init();

    let addr = Address::resolve_with_port("127.0.0.1", 9, Family::Ipv4).unwrap();
    // Larger than any IPv4 UDP datagram can be.
    let huge = vec![0u8; 70_000];
    match send_to(&addr, &huge) {
        SendResult::Error => {}
        SendResult::Incomplete(n) => assert!(n < huge.len()),
        other => panic!("unexpected result for oversized datagram: {:?}", other),
    }
}

#[test]
fn zero_length_datagram_is_delivered() {
    init();

    let handler = Handler::new().unwrap();
    let receiver: UdpSocket = UdpSocket::with_handler(handler.clone());
    receiver.bind("127.0.0.1", 0, Family::Ipv4).unwrap();
    let to = receiver.local_addr().unwrap();

    let hits = Rc::new(Cell::new(0u32));
    {
        let hits = hits.clone();
        receiver.on_recvfrom(Flags::DEFAULT, move |_ctx, _src, bytes| {
            assert!(bytes.is_empty());
            hits.set(hits.get() + 1);
        });
    }

    assert_eq!(send_to(&to, b""), SendResult::Success);
    {
        let hits = hits.clone();
        poll_until(&handler, move || hits.get() == 1);
    }
}

#[test]
fn close_emits_closed_with_bound_address() {
    init();

    let handler = Handler::new().unwrap();
    let socket: UdpSocket = UdpSocket::with_handler(handler.clone());

    let closed: Rc<Cell<Option<u16>>> = Rc::new(Cell::new(None));
    {
        let closed = closed.clone();
        socket.on_closed(Flags::DEFAULT, move |_ctx, addr| {
            closed.set(addr.port());
        });
    }

    socket.bind("127.0.0.1", 0, Family::Ipv4).unwrap();
    let port = socket.local_addr().unwrap().port();
    assert_eq!(handler.count(), 1);

    socket.close();
    assert_eq!(closed.get(), port);
    assert_eq!(handler.count(), 0);

    // Closing again is a no-op.
    socket.close();
    assert_eq!(handler.count(), 0);
}

#[test]
fn open_close_open_close_reuses_cleanly() {
    init();

    let handler = Handler::new().unwrap();
    let socket: UdpSocket = UdpSocket::with_handler(handler.clone());

    socket.open(Family::Ipv4).unwrap();
    assert_eq!(handler.count(), 1);
    socket.close();
    assert_eq!(handler.count(), 0);
    socket.open(Family::Ipv4).unwrap();
    assert_eq!(handler.count(), 1);
    socket.close();
    assert_eq!(handler.count(), 0);
}
