use std::cell::RefCell;
use std::io;
use std::num::Wrapping;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::sys;
use crate::Interest;

/// Something the reactor can hand readiness to: the endpoint core owning a
/// registered descriptor.
pub(crate) trait EventSink {
    fn on_readable(&mut self, fd: RawFd);
    fn on_writable(&mut self, fd: RawFd);
}

pub(crate) type SinkRef = Weak<RefCell<dyn EventSink>>;

/// One registered descriptor: the fd, what it currently wants, and a
/// non-owning handle to the socket's owner. A single record per fd — the
/// wanted-events mask and the owner can never fall out of step.
struct Registration {
    fd: RawFd,
    interest: Option<Interest>,
    owner: SinkRef,
}

struct ReadyEntry {
    fd: RawFd,
    readable: bool,
    writable: bool,
    owner: SinkRef,
}

struct Reactor {
    selector: sys::Selector,
    /// Registration order is dispatch order.
    entries: Vec<Registration>,
    /// Bumped on every add and remove so a poll round can detect that a
    /// callback invalidated its iteration state.
    epoch: Wrapping<u16>,
    /// Scratch buffers reused across poll rounds.
    interests: Vec<(RawFd, Option<Interest>)>,
    events: Vec<sys::Event>,
}

impl Reactor {
    fn position(&self, fd: RawFd) -> Option<usize> {
        self.entries.iter().position(|e| e.fd == fd)
    }

    fn add(&mut self, fd: RawFd, owner: SinkRef) -> io::Result<()> {
        if self.position(fd).is_some() {
            // Double registration is rejected without an error; the first
            // owner keeps the slot.
            warn_log!("fd {} already registered, ignoring", fd);
            return Ok(());
        }
        self.selector.register(fd, Interest::READABLE)?;
        self.entries.push(Registration {
            fd,
            interest: Some(Interest::READABLE),
            owner,
        });
        self.epoch += 1;
        trace!("registered fd {} ({} total)", fd, self.entries.len());
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) {
        let Some(at) = self.position(fd) else { return };
        self.entries.remove(at);
        self.epoch += 1;
        // The selector may have lost the fd already (closed before
        // deregistration is fine for every backend we drive).
        let _ = self.selector.deregister(fd);
        trace!("deregistered fd {} ({} total)", fd, self.entries.len());
    }

    fn set_interest(&mut self, fd: RawFd, flip: Interest, on: bool) {
        let Some(at) = self.position(fd) else { return };
        let entry = &mut self.entries[at];
        entry.interest = match (entry.interest, on) {
            (Some(cur), true) => Some(cur | flip),
            (Some(cur), false) => cur.remove(flip),
            (None, true) => Some(flip),
            (None, false) => None,
        };
        let _ = self.selector.reregister(fd, entry.interest);
    }

    fn select(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEntry>> {
        self.interests.clear();
        for e in &self.entries {
            self.interests.push((e.fd, e.interest));
        }
        let mut events = std::mem::take(&mut self.events);
        let res = self.selector.select(&self.interests, &mut events, timeout);

        // Fold per-backend events into registration order; some backends
        // report one readiness class per event.
        let mut ready = Vec::new();
        if res.is_ok() {
            for e in &self.entries {
                let mut readable = false;
                let mut writable = false;
                for ev in events.iter().filter(|ev| ev.fd == e.fd) {
                    readable |= ev.readable;
                    writable |= ev.writable;
                }
                if readable || writable {
                    ready.push(ReadyEntry {
                        fd: e.fd,
                        readable,
                        writable,
                        owner: e.owner.clone(),
                    });
                }
            }
        }
        self.events = events;
        res.map(|_| ready)
    }
}

/// Handle to a readiness reactor shared by a graph of endpoints.
///
/// A `Handler` is a cheap clone; every clone drives the same interest set.
/// Endpoints created with the same handler are polled together: one call
/// to [`poll`] serves all of them.
///
/// All dispatch is single-threaded and synchronous. Callbacks run on the
/// polling call stack; a callback that closes sockets (its own or a
/// sibling's) ends the current round cleanly instead of touching stale
/// state. Do not call [`poll`] from inside a callback of the entity being
/// polled.
#[derive(Clone)]
pub struct Handler {
    inner: Rc<RefCell<Reactor>>,
}

impl Handler {
    pub fn new() -> io::Result<Handler> {
        Ok(Handler {
            inner: Rc::new(RefCell::new(Reactor {
                selector: sys::Selector::new()?,
                entries: Vec::new(),
                epoch: Wrapping(0),
                interests: Vec::new(),
                events: Vec::new(),
            })),
        })
    }

    /// Number of registered descriptors.
    pub fn count(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// The mutation counter for the interest set. Strictly for
    /// introspection: it increases (wrapping) whenever a descriptor is
    /// added or removed.
    pub fn epoch(&self) -> u16 {
        self.inner.borrow().epoch.0
    }

    pub(crate) fn add(&self, fd: RawFd, owner: SinkRef) -> io::Result<()> {
        self.inner.borrow_mut().add(fd, owner)
    }

    pub(crate) fn remove(&self, fd: RawFd) {
        self.inner.borrow_mut().remove(fd);
    }

    pub(crate) fn set_want_read(&self, fd: RawFd, on: bool) {
        self.inner.borrow_mut().set_interest(fd, Interest::READABLE, on);
    }

    pub(crate) fn set_want_write(&self, fd: RawFd, on: bool) {
        self.inner.borrow_mut().set_interest(fd, Interest::WRITABLE, on);
    }

    /// Whether `fd`'s registration currently includes write interest.
    /// Introspection only, mostly useful for asserting the send-buffer ⇔
    /// write-interest invariant in tests.
    pub fn wants_write(&self, fd: RawFd) -> bool {
        let inner = self.inner.borrow();
        inner
            .position(fd)
            .and_then(|at| inner.entries[at].interest)
            .map_or(false, Interest::is_writable)
    }

    /// Runs one poll round: waits up to `timeout` for readiness, then
    /// walks ready descriptors in registration order, dispatching readable
    /// before writable for each.
    ///
    /// `None` blocks until at least one descriptor is ready; a zero
    /// timeout makes this a non-blocking check.
    ///
    /// Returns the number of descriptors the OS reported ready. Errors
    /// from the readiness primitive surface here; per-descriptor I/O
    /// errors do not — they are delivered through the owning endpoint's
    /// `ERROR` action.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let ready = self.inner.borrow_mut().select(timeout)?;
        let n = ready.len();
        let epoch = self.epoch();
        trace!("poll round: {} ready", n);

        for entry in ready {
            // A callback may have unregistered this fd in the meantime.
            if self.epoch() != epoch {
                break;
            }
            let Some(owner) = entry.owner.upgrade() else { continue };
            if entry.readable {
                owner.borrow_mut().on_readable(entry.fd);
                if self.epoch() != epoch {
                    break;
                }
            }
            if entry.writable {
                owner.borrow_mut().on_writable(entry.fd);
                if self.epoch() != epoch {
                    break;
                }
            }
        }
        Ok(n)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("count", &self.count())
            .field("epoch", &self.epoch())
            .finish()
    }
}

/// Anything holding a [`Handler`]: endpoints, or the handler itself.
pub trait Pollable {
    fn handler(&self) -> &Handler;
}

impl Pollable for Handler {
    fn handler(&self) -> &Handler {
        self
    }
}

/// Polls whatever `entity`'s handler manages. See [`Handler::poll`].
pub fn poll<P: Pollable + ?Sized>(entity: &P, timeout: Option<Duration>) -> io::Result<usize> {
    entity.handler().poll(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordSink {
        readable: Vec<RawFd>,
    }

    impl EventSink for RecordSink {
        fn on_readable(&mut self, fd: RawFd) {
            self.readable.push(fd);
        }

        fn on_writable(&mut self, _fd: RawFd) {}
    }

    struct Pipe(RawFd, RawFd);

    impl Pipe {
        fn new() -> Pipe {
            let mut fds = [0; 2];
            syscall!(pipe(fds.as_mut_ptr())).unwrap();
            Pipe(fds[0], fds[1])
        }

        fn wake(&self) {
            syscall!(write(self.1, b"!".as_ptr() as *const libc::c_void, 1)).unwrap();
        }
    }

    impl Drop for Pipe {
        fn drop(&mut self) {
            let _ = syscall!(close(self.0));
            let _ = syscall!(close(self.1));
        }
    }

    fn sink() -> Rc<RefCell<RecordSink>> {
        Rc::new(RefCell::new(RecordSink::default()))
    }

    #[test]
    fn registration_bookkeeping() {
        let handler = Handler::new().unwrap();
        let pipe = Pipe::new();
        let sink = sink();
        let owner: Rc<RefCell<dyn EventSink>> = sink.clone();

        assert!(handler.is_empty());
        handler.add(pipe.0, Rc::downgrade(&owner)).unwrap();
        assert_eq!(handler.count(), 1);
        let epoch = handler.epoch();

        // A duplicate registration is rejected silently.
        handler.add(pipe.0, Rc::downgrade(&owner)).unwrap();
        assert_eq!(handler.count(), 1);
        assert_eq!(handler.epoch(), epoch);

        handler.remove(pipe.0);
        assert_eq!(handler.count(), 0);
        assert_ne!(handler.epoch(), epoch);

        // Removing an absent fd is a no-op.
        let epoch = handler.epoch();
        handler.remove(pipe.0);
        assert_eq!(handler.epoch(), epoch);
    }

    #[test]
    fn readable_dispatch_reaches_the_owner() {
        let handler = Handler::new().unwrap();
        let pipe = Pipe::new();
        let sink = sink();
        let owner: Rc<RefCell<dyn EventSink>> = sink.clone();
        handler.add(pipe.0, Rc::downgrade(&owner)).unwrap();

        pipe.wake();
        let n = handler.poll(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(n, 1);
        assert_eq!(sink.borrow().readable, [pipe.0]);
    }

    #[test]
    fn zero_timeout_polls_out_promptly() {
        let handler = Handler::new().unwrap();
        let pipe = Pipe::new();
        let sink = sink();
        let owner: Rc<RefCell<dyn EventSink>> = sink.clone();
        handler.add(pipe.0, Rc::downgrade(&owner)).unwrap();

        let start = Instant::now();
        let n = handler.poll(Some(Duration::ZERO)).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn dead_owner_is_skipped() {
        let handler = Handler::new().unwrap();
        let pipe = Pipe::new();
        {
            let sink = sink();
            let owner: Rc<RefCell<dyn EventSink>> = sink;
            handler.add(pipe.0, Rc::downgrade(&owner)).unwrap();
        }
        pipe.wake();
        // The owner is gone; the round completes without dispatching.
        handler.poll(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(handler.count(), 1);
    }
}
