use std::ffi::CString;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::raw::c_char;
use std::{fmt, mem, ptr};

/// Number of `getaddrinfo`/`getnameinfo` attempts before a transient
/// failure is reported as [`ResolveError::Unavailable`].
pub const MAX_RESOLVE_RETRIES: usize = 3;

/// Buffer size for reverse lookups; longer names fail with
/// [`ResolveError::NameTooBig`].
const HOSTNAME_BUFFER_SIZE: usize = 128;

const IP_BUFFER_SIZE: usize = 128;

// `libc` on this target does not declare `inet_ntop`; bind it directly
// since it is part of the platform's libc ABI.
extern "C" {
    fn inet_ntop(
        af: libc::c_int,
        src: *const libc::c_void,
        dst: *mut c_char,
        size: libc::socklen_t,
    ) -> *const c_char;
}

/// Address family selector for lookups and socket creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Unspec,
    Ipv4,
    Ipv6,
}

impl Family {
    pub(crate) fn af(self) -> libc::c_int {
        match self {
            Family::Unspec => libc::AF_UNSPEC,
            Family::Ipv4 => libc::AF_INET,
            Family::Ipv6 => libc::AF_INET6,
        }
    }
}

/// Name resolution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    /// Permanent lookup failure.
    Error,
    /// Transient failures exhausted the retry budget.
    Unavailable,
    /// The resolved address does not fit in the address storage.
    TooBig,
    /// The reverse-resolved name does not fit in the name buffer.
    NameTooBig,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ResolveError::Error => "permanent name resolution failure",
            ResolveError::Unavailable => "name resolution retries exhausted",
            ResolveError::TooBig => "resolved address exceeds storage",
            ResolveError::NameTooBig => "resolved name exceeds buffer",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ResolveError {}

/// A family-tagged socket address.
///
/// Owns enough storage for any address family the kernel can hand back
/// (`sockaddr_storage`). The family tag inside the blob is authoritative:
/// the typed projections [`v4`] and [`v6`] return `None` when it does not
/// match, while [`as_sockaddr`] always succeeds since every family can be
/// read through a plain `sockaddr`.
///
/// Ports are stored in network byte order; [`port`] and [`set_port`]
/// convert at the boundary.
///
/// [`v4`]: Address::v4
/// [`v6`]: Address::v6
/// [`as_sockaddr`]: Address::as_sockaddr
/// [`port`]: Address::port
/// [`set_port`]: Address::set_port
#[derive(Clone, Copy)]
pub struct Address {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl Address {
    /// A zeroed address of the `AF_UNSPEC` family.
    pub fn new() -> Address {
        Address {
            // SAFETY: all-zero is a valid sockaddr_storage.
            storage: unsafe { mem::zeroed() },
            len: 0,
        }
    }

    /// Copies an address out of a platform address structure.
    ///
    /// # Safety
    ///
    /// `addr` must point to at least `len` readable bytes of a valid
    /// socket address, and `len` must not exceed
    /// `size_of::<sockaddr_storage>()`.
    pub unsafe fn from_raw(addr: *const libc::sockaddr, len: libc::socklen_t) -> Address {
        debug_assert!(len as usize <= mem::size_of::<libc::sockaddr_storage>());
        let mut out = Address::new();
        ptr::copy_nonoverlapping(addr as *const u8, &mut out.storage as *mut _ as *mut u8, len as usize);
        out.len = len;
        out
    }

    /// Converts from a standard library socket address.
    pub fn from_std(addr: SocketAddr) -> Address {
        let mut out = Address::new();
        match addr {
            SocketAddr::V4(v4) => {
                // SAFETY: sockaddr_in fits in sockaddr_storage.
                let sin = unsafe { &mut *(&mut out.storage as *mut _ as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                out.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
                #[cfg(any(
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd",
                ))]
                {
                    sin.sin_len = out.len as u8;
                }
            }
            SocketAddr::V6(v6) => {
                // SAFETY: sockaddr_in6 fits in sockaddr_storage.
                let sin6 = unsafe { &mut *(&mut out.storage as *mut _ as *mut libc::sockaddr_in6) };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();
                out.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
                #[cfg(any(
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd",
                ))]
                {
                    sin6.sin6_len = out.len as u8;
                }
            }
        }
        out
    }

    /// Converts to a standard library socket address, if this is an IP
    /// address.
    pub fn to_std(&self) -> Option<SocketAddr> {
        if let Some(sin) = self.v4() {
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            return Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))));
        }
        if let Some(sin6) = self.v6() {
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            return Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )));
        }
        None
    }

    /// Forward-resolves `host` for `family` with the default retry budget.
    pub fn resolve(host: &str, family: Family) -> Result<Address, ResolveError> {
        Address::resolve_retrying(host, family, MAX_RESOLVE_RETRIES)
    }

    /// Forward-resolves `host`, retrying transient (`EAI_AGAIN`) failures
    /// up to `retries` times before giving up with
    /// [`ResolveError::Unavailable`].
    pub fn resolve_retrying(
        host: &str,
        family: Family,
        retries: usize,
    ) -> Result<Address, ResolveError> {
        let host = CString::new(host).map_err(|_| ResolveError::Error)?;
        // SAFETY: all-zero addrinfo is a valid hints value.
        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = family.af();

        let mut res: *mut libc::addrinfo = ptr::null_mut();
        let mut attempts = retries.max(1);
        loop {
            let err = unsafe { libc::getaddrinfo(host.as_ptr(), ptr::null(), &hints, &mut res) };
            if err == 0 {
                break;
            }
            if err != libc::EAI_AGAIN {
                return Err(ResolveError::Error);
            }
            attempts -= 1;
            if attempts == 0 {
                return Err(ResolveError::Unavailable);
            }
        }

        let guard = AddrInfoGuard(res);
        let info = match unsafe { guard.0.as_ref() } {
            Some(info) => info,
            None => return Err(ResolveError::Unavailable),
        };
        if info.ai_addrlen as usize > mem::size_of::<libc::sockaddr_storage>() {
            return Err(ResolveError::TooBig);
        }
        // SAFETY: getaddrinfo returned this (addr, len) pair.
        Ok(unsafe { Address::from_raw(info.ai_addr, info.ai_addrlen) })
    }

    /// Forward-resolves `host` and overwrites the port field.
    ///
    /// Fails with [`ResolveError::Error`] when the resolved address is not
    /// IPv4 or IPv6, since no other family has a port to set.
    pub fn resolve_with_port(
        host: &str,
        port: u16,
        family: Family,
    ) -> Result<Address, ResolveError> {
        let mut addr = Address::resolve(host, family)?;
        if !addr.set_port(port) {
            return Err(ResolveError::Error);
        }
        Ok(addr)
    }

    /// Reverse-resolves an address into a host name, with the same retry
    /// discipline as [`resolve`].
    ///
    /// [`resolve`]: Address::resolve
    pub fn name_of(addr: &Address) -> Result<String, ResolveError> {
        let mut buf = [0 as c_char; HOSTNAME_BUFFER_SIZE];
        let mut attempts = MAX_RESOLVE_RETRIES;
        loop {
            let err = unsafe {
                libc::getnameinfo(
                    addr.as_sockaddr(),
                    addr.len,
                    buf.as_mut_ptr(),
                    HOSTNAME_BUFFER_SIZE as libc::socklen_t,
                    ptr::null_mut(),
                    0,
                    0,
                )
            };
            if err == 0 {
                break;
            }
            #[cfg(not(target_os = "openbsd"))]
            if err == libc::EAI_OVERFLOW {
                return Err(ResolveError::NameTooBig);
            }
            if err != libc::EAI_AGAIN {
                return Err(ResolveError::Error);
            }
            attempts -= 1;
            if attempts == 0 {
                return Err(ResolveError::Unavailable);
            }
        }
        let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }

    /// Formats the numeric IP of this address.
    ///
    /// Fails for non-IP families.
    pub fn ip_string(&self) -> Result<String, ResolveError> {
        let mut buf = [0 as c_char; IP_BUFFER_SIZE];
        let src: *const libc::c_void = if let Some(sin) = self.v4() {
            &sin.sin_addr as *const _ as *const _
        } else if let Some(sin6) = self.v6() {
            &sin6.sin6_addr as *const _ as *const _
        } else {
            return Err(ResolveError::Error);
        };
        let res = unsafe {
            inet_ntop(
                self.family() as libc::c_int,
                src,
                buf.as_mut_ptr(),
                IP_BUFFER_SIZE as libc::socklen_t,
            )
        };
        if res.is_null() {
            return Err(ResolveError::Error);
        }
        let ip = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
        Ok(ip.to_string_lossy().into_owned())
    }

    /// The raw address family tag stored in the blob.
    pub fn family(&self) -> libc::sa_family_t {
        self.storage.ss_family
    }

    pub fn is_ipv4(&self) -> bool {
        self.family() == libc::AF_INET as libc::sa_family_t
    }

    pub fn is_ipv6(&self) -> bool {
        self.family() == libc::AF_INET6 as libc::sa_family_t
    }

    /// Length in bytes of the stored address.
    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The port in host byte order; `None` for non-IP families.
    pub fn port(&self) -> Option<u16> {
        if let Some(sin) = self.v4() {
            Some(u16::from_be(sin.sin_port))
        } else {
            self.v6().map(|sin6| u16::from_be(sin6.sin6_port))
        }
    }

    /// Overwrites the port field; returns false for non-IP families.
    pub fn set_port(&mut self, port: u16) -> bool {
        let family = self.family();
        if family == libc::AF_INET as libc::sa_family_t {
            // SAFETY: family tag says the blob is a sockaddr_in.
            let sin = unsafe { &mut *(&mut self.storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_port = port.to_be();
            true
        } else if family == libc::AF_INET6 as libc::sa_family_t {
            // SAFETY: family tag says the blob is a sockaddr_in6.
            let sin6 = unsafe { &mut *(&mut self.storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_port = port.to_be();
            true
        } else {
            false
        }
    }

    /// Typed projection; `None` when the family tag is not `AF_INET`.
    pub fn v4(&self) -> Option<&libc::sockaddr_in> {
        if self.is_ipv4() {
            // SAFETY: family tag checked.
            Some(unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in) })
        } else {
            None
        }
    }

    /// Typed projection; `None` when the family tag is not `AF_INET6`.
    pub fn v6(&self) -> Option<&libc::sockaddr_in6> {
        if self.is_ipv6() {
            // SAFETY: family tag checked.
            Some(unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in6) })
        } else {
            None
        }
    }

    /// The universal projection, valid for every family. Incoherent
    /// contents are the callee's problem (`bind`, `getnameinfo` and
    /// friends report their own errors).
    pub fn as_sockaddr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }
}

impl Default for Address {
    fn default() -> Address {
        Address::new()
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Address) -> bool {
        if self.len != other.len {
            return false;
        }
        let a = unsafe {
            std::slice::from_raw_parts(&self.storage as *const _ as *const u8, self.len as usize)
        };
        let b = unsafe {
            std::slice::from_raw_parts(&other.storage as *const _ as *const u8, other.len as usize)
        };
        a == b
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ip_string(), self.port()) {
            (Ok(ip), Some(port)) if self.is_ipv6() => write!(f, "[{}]:{}", ip, port),
            (Ok(ip), Some(port)) => write!(f, "{}:{}", ip, port),
            _ => write!(f, "Address(family={})", self.family()),
        }
    }
}

struct AddrInfoGuard(*mut libc::addrinfo);

impl Drop for AddrInfoGuard {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { libc::freeaddrinfo(self.0) }
        }
    }
}
