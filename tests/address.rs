use std::net::SocketAddr;

use netpoll::{Address, Family};

#[test]
fn new_address_is_unspecified() {
    let addr = Address::new();
    assert_eq!(addr.family(), libc::AF_UNSPEC as libc::sa_family_t);
    assert!(addr.is_empty());
    assert!(addr.v4().is_none());
    assert!(addr.v6().is_none());
    assert!(addr.port().is_none());
    assert!(addr.ip_string().is_err());
}

#[test]
fn resolve_numeric_v4() {
    let addr = Address::resolve("127.0.0.1", Family::Ipv4).unwrap();
    assert!(addr.is_ipv4());
    assert_eq!(addr.ip_string().unwrap(), "127.0.0.1");
    // Numeric form re-resolves to the same address.
    let again = Address::resolve(&addr.ip_string().unwrap(), Family::Ipv4).unwrap();
    assert_eq!(addr.v4().unwrap().sin_addr.s_addr, again.v4().unwrap().sin_addr.s_addr);
}

#[test]
fn resolve_numeric_v6() {
    let addr = Address::resolve("::1", Family::Ipv6).unwrap();
    assert!(addr.is_ipv6());
    assert!(addr.v4().is_none());
    assert_eq!(addr.ip_string().unwrap(), "::1");
}

#[test]
fn resolve_with_port_sets_network_order() {
    let addr = Address::resolve_with_port("127.0.0.1", 8000, Family::Ipv4).unwrap();
    // The accessor converts back to host order.
    assert_eq!(addr.port(), Some(8000));
    assert_eq!(addr.v4().unwrap().sin_port, 8000u16.to_be());
}

#[test]
fn projection_is_family_checked() {
    let addr = Address::resolve("127.0.0.1", Family::Ipv4).unwrap();
    assert!(addr.v4().is_some());
    assert!(addr.v6().is_none());
    assert!(!addr.as_sockaddr().is_null());
}

#[test]
fn std_round_trip() {
    let std_addr: SocketAddr = "192.0.2.7:4242".parse().unwrap();
    let addr = Address::from_std(std_addr);
    assert_eq!(addr.port(), Some(4242));
    assert_eq!(addr.to_std(), Some(std_addr));

    let std6: SocketAddr = "[2001:db8::1]:80".parse().unwrap();
    let addr6 = Address::from_std(std6);
    assert!(addr6.is_ipv6());
    assert_eq!(addr6.to_std(), Some(std6));
}

#[test]
fn set_port_refuses_non_ip() {
    let mut addr = Address::new();
    assert!(!addr.set_port(80));
}

#[test]
fn unresolvable_name_fails() {
    // Either a permanent failure or retries exhausted, depending on the
    // resolver; never success.
    assert!(Address::resolve("host.invalid.", Family::Ipv4).is_err());
}

#[test]
fn reverse_lookup_of_loopback() {
    let addr = Address::resolve_with_port("127.0.0.1", 0, Family::Ipv4).unwrap();
    let name = Address::name_of(&addr).unwrap();
    assert!(!name.is_empty());
}
