use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::sys::unix::Event;
use crate::Interest;

/// Maximum events drained from the kernel per wait.
const EVENT_CAPACITY: usize = 1024;

// Type of the `filter` field of `kevent`, which NetBSD declares differently.
#[cfg(not(target_os = "netbsd"))]
type Filter = libc::c_short;
#[cfg(target_os = "netbsd")]
type Filter = u32;

#[cfg(not(target_os = "netbsd"))]
type KqFlags = libc::c_ushort;
#[cfg(target_os = "netbsd")]
type KqFlags = u32;

#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
    buf: Vec<libc::kevent>,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        let kq = unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) };
        syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector {
            kq,
            buf: Vec::with_capacity(EVENT_CAPACITY),
        })
    }

    pub(crate) fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.update(fd, Some(interest))
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
        self.update(fd, interest)
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.update(fd, None)
    }

    /// Reconcile both filters for `fd` with the wanted interest. Deleting a
    /// filter that was never added reports `ENOENT`, which is fine.
    fn update(&mut self, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
        let readable = interest.map_or(false, Interest::is_readable);
        let writable = interest.map_or(false, Interest::is_writable);

        let mut changes = [
            kevent(fd, libc::EVFILT_READ as Filter, flag_for(readable)),
            kevent(fd, libc::EVFILT_WRITE as Filter, flag_for(writable)),
        ];

        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as _,
            changes.as_mut_ptr(),
            changes.len() as _,
            ptr::null(),
        ))?;

        for change in changes.iter() {
            if (change.flags & libc::EV_ERROR as KqFlags) != 0
                && change.data != 0
                && change.data != libc::ENOENT as _
            {
                return Err(io::Error::from_raw_os_error(change.data as i32));
            }
        }
        Ok(())
    }

    pub(crate) fn select(
        &mut self,
        _entries: &[(RawFd, Option<Interest>)],
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        events.clear();
        self.buf.clear();

        let timespec = timeout.map(|to| libc::timespec {
            tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            // `Duration::subsec_nanos` is guaranteed to be less than a second.
            tv_nsec: to.subsec_nanos() as _,
        });
        let timespec = timespec
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        let n_events = syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            self.buf.as_mut_ptr(),
            self.buf.capacity() as _,
            timespec,
        ))?;
        // SAFETY: `kevent` ensures that `n_events` are assigned.
        unsafe { self.buf.set_len(n_events as usize) };

        for ev in self.buf.iter() {
            let eof = (ev.flags & libc::EV_EOF as KqFlags) != 0;
            events.push(Event {
                fd: ev.ident as RawFd,
                readable: ev.filter == libc::EVFILT_READ as Filter || eof,
                writable: ev.filter == libc::EVFILT_WRITE as Filter,
            });
        }
        Ok(n_events as usize)
    }
}

fn flag_for(wanted: bool) -> KqFlags {
    if wanted {
        (libc::EV_ADD | libc::EV_ENABLE | libc::EV_RECEIPT) as KqFlags
    } else {
        (libc::EV_DELETE | libc::EV_RECEIPT) as KqFlags
    }
}

fn kevent(fd: RawFd, filter: Filter, flags: KqFlags) -> libc::kevent {
    // SAFETY: all fields are valid when zeroed.
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as libc::uintptr_t;
    ev.filter = filter;
    ev.flags = flags;
    ev
}
