use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use crate::sys::unix::Event;
use crate::Interest;

/// `select(2)` fallback selector.
///
/// Capped at `FD_SETSIZE` descriptors; registering anything at or above
/// that limit is refused up front rather than corrupting the fd sets.
#[derive(Debug)]
pub(crate) struct Selector {}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        Ok(Selector {})
    }

    pub(crate) fn register(&mut self, fd: RawFd, _interest: Interest) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file descriptor above FD_SETSIZE",
            ));
        }
        Ok(())
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, _interest: Option<Interest>) -> io::Result<()> {
        self.register(fd, Interest::READABLE)
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

        let mut read_set = zeroed_fd_set();
        let mut write_set = zeroed_fd_set();
        let mut error_set = zeroed_fd_set();
        let mut max_fd: RawFd = -1;

        for &(fd, interest) in entries {
            let Some(interest) = interest else { continue };
            // SAFETY: `register` refused anything at or above FD_SETSIZE.
            unsafe {
                if interest.is_readable() {
                    libc::FD_SET(fd, &mut read_set);
                }
                if interest.is_writable() {
                    libc::FD_SET(fd, &mut write_set);
                }
                libc::FD_SET(fd, &mut error_set);
            }
            max_fd = max_fd.max(fd);
        }

        let mut timeval = timeout.map(|to| libc::timeval {
            tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_usec: to.subsec_micros() as libc::suseconds_t,
        });
        let timeval = timeval
            .as_mut()
            .map(|tv| tv as *mut libc::timeval)
            .unwrap_or(ptr::null_mut());

        let n_events = syscall!(select(
            max_fd + 1,
            &mut read_set,
            &mut write_set,
            &mut error_set,
            timeval,
        ))? as usize;

        if n_events > 0 {
            for &(fd, interest) in entries {
                if interest.is_none() {
                    continue;
                }
                // SAFETY: same bound as above.
                let (readable, writable, errored) = unsafe {
                    (
                        libc::FD_ISSET(fd, &read_set),
                        libc::FD_ISSET(fd, &write_set),
                        libc::FD_ISSET(fd, &error_set),
                    )
                };
                if readable || writable || errored {
                    events.push(Event {
                        fd,
                        readable: readable || errored,
                        writable,
                    });
                }
            }
        }
        Ok(events.len())
    }
}

fn zeroed_fd_set() -> libc::fd_set {
    let mut set = MaybeUninit::<libc::fd_set>::uninit();
    // SAFETY: FD_ZERO initialises the whole set.
    unsafe {
        libc::FD_ZERO(set.as_mut_ptr());
        set.assume_init()
    }
}
