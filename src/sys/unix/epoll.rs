use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::sys::unix::{millis, Event};
use crate::Interest;

/// Maximum events drained from the kernel per wait.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
    buf: Vec<libc::epoll_event>,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector {
            ep,
            buf: Vec::with_capacity(EVENT_CAPACITY),
        })
    }

    pub(crate) fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(Some(interest)),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }

    pub(crate) fn select(
        &mut self,
        _entries: &[(RawFd, Option<Interest>)],
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        events.clear();
        self.buf.clear();
        let n_events = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.buf.as_mut_ptr(),
            self.buf.capacity() as i32,
            millis(timeout),
        ))?;
        // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
        unsafe { self.buf.set_len(n_events as usize) };

        for ev in self.buf.iter() {
            let kind = ev.events as libc::c_int;
            events.push(Event {
                fd: ev.u64 as RawFd,
                readable: kind & (EPOLLIN | EPOLLPRI | EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0,
                writable: kind & EPOLLOUT != 0,
            });
        }
        Ok(n_events as usize)
    }
}

fn interest_to_epoll(interest: Option<Interest>) -> u32 {
    // Level-triggered on purpose: want-read/want-write bits are cleared by
    // the owning sockets once they have drained, not by the kernel.
    let mut kind = 0;

    if let Some(interest) = interest {
        if interest.is_readable() {
            kind = kind | EPOLLIN | EPOLLRDHUP;
        }

        if interest.is_writable() {
            kind |= EPOLLOUT;
        }
    }

    kind as u32
}
