use std::os::unix::io::RawFd;
use std::time::Duration;

#[cfg(feature = "force-select")]
mod select;
#[cfg(feature = "force-select")]
pub(crate) use self::select::Selector;

#[cfg(all(not(feature = "force-select"), feature = "force-poll"))]
mod poll;
#[cfg(all(not(feature = "force-select"), feature = "force-poll"))]
pub(crate) use self::poll::Selector;

#[cfg(all(
    not(feature = "force-select"),
    not(feature = "force-poll"),
    any(target_os = "linux", target_os = "android", target_os = "illumos")
))]
mod epoll;
#[cfg(all(
    not(feature = "force-select"),
    not(feature = "force-poll"),
    any(target_os = "linux", target_os = "android", target_os = "illumos")
))]
pub(crate) use self::epoll::Selector;

#[cfg(all(
    not(feature = "force-select"),
    not(feature = "force-poll"),
    any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    )
))]
mod kqueue;
#[cfg(all(
    not(feature = "force-select"),
    not(feature = "force-poll"),
    any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    )
))]
pub(crate) use self::kqueue::Selector;

/// A satisfied-readiness report for one descriptor.
///
/// Error and hang-up conditions are folded into `readable` so the owning
/// socket observes them through its read path (`recv` returning zero or an
/// error) instead of through a separate channel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub(crate) fd: RawFd,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// Convert a timeout to milliseconds the way the C interfaces want it:
/// `-1` blocks, `0` polls, sub-millisecond durations round up so they do
/// not accidentally turn into a non-blocking call.
pub(crate) fn millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(to) => to
            .checked_add(Duration::from_nanos(999_999))
            .unwrap_or(to)
            .as_millis()
            .min(libc::c_int::MAX as u128) as libc::c_int,
    }
}
