use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::sys::unix::{millis, Event};
use crate::Interest;

// POLLRDHUP is not available everywhere this backend can be forced on.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "illumos"))]
const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLRDHUP;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "illumos")))]
const READ_EVENTS: libc::c_short = libc::POLLIN;

const WRITE_EVENTS: libc::c_short = libc::POLLOUT;

/// `poll(2)` based selector.
///
/// Stateless with respect to the kernel: the `pollfd` array is rebuilt from
/// the reactor's interest list on every call, which keeps the scan in
/// registration order for free.
#[derive(Debug)]
pub(crate) struct Selector {
    poll_fds: Vec<libc::pollfd>,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        Ok(Selector {
            poll_fds: Vec::new(),
        })
    }

    pub(crate) fn register(&mut self, _fd: RawFd, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    pub(crate) fn reregister(&mut self, _fd: RawFd, _interest: Option<Interest>) -> io::Result<()> {
        Ok(())
    }

    pub(crate) fn deregister(&mut self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    pub(crate) fn select(
        &mut self,
        entries: &[(RawFd, Option<Interest>)],
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        events.clear();
        self.poll_fds.clear();
        for &(fd, interest) in entries {
            self.poll_fds.push(libc::pollfd {
                fd,
                events: interest_to_poll(interest),
                revents: 0,
            });
        }

        let n_events = loop {
            let res = syscall!(poll(
                self.poll_fds.as_mut_ptr(),
                self.poll_fds.len() as libc::nfds_t,
                millis(timeout),
            ));
            match res {
                Ok(n) => break n as usize,
                // poll returns EAGAIN if we can retry it.
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => continue,
                Err(e) => return Err(e),
            }
        };

        if n_events > 0 {
            for poll_fd in self.poll_fds.iter() {
                if poll_fd.revents == 0 {
                    continue;
                }
                events.push(Event {
                    fd: poll_fd.fd,
                    readable: poll_fd.revents
                        & (READ_EVENTS | libc::POLLPRI | libc::POLLHUP | libc::POLLERR)
                        != 0,
                    writable: poll_fd.revents & WRITE_EVENTS != 0,
                });
                if events.len() == n_events {
                    break;
                }
            }
        }
        Ok(n_events)
    }
}

fn interest_to_poll(interest: Option<Interest>) -> libc::c_short {
    let mut kind = 0;

    if let Some(interest) = interest {
        if interest.is_readable() {
            kind |= READ_EVENTS;
        }

        if interest.is_writable() {
            kind |= WRITE_EVENTS;
        }
    }

    kind
}
