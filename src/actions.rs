//! Ordered callback lists with per-callback flags.
//!
//! Every endpoint binds a fixed set of action tags (`RECEIVE`, `ACCEPT`,
//! `ERROR`, …) to one [`ActionList`] each; registering a callback appends
//! it to the list for its tag and dispatching an action walks the list in
//! order. [`Flags`] tune a single callback's position and behavior.
//!
//! Dispatch operates on a [`Snapshot`] taken before the first callback
//! runs, so a callback adding further callbacks (or tearing down the
//! socket the list belongs to) never invalidates the running iteration.

use std::cell::RefCell;
use std::rc::Rc;
use std::{fmt, ops};

/// Per-callback behavior flags.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    /// Ordered after previously added non-tail callbacks.
    pub const DEFAULT: Flags = Flags(0);
    /// Callback is retained in the list but not invoked.
    pub const SKIP: Flags = Flags(0b001);
    /// After invoking this callback, end the dispatch. Use when the
    /// callback may destroy the object the dispatch is running for.
    pub const STOP_AFTER: Flags = Flags(0b010);
    /// Keep this callback at the tail of the list: callbacks added later
    /// without this flag are placed *before* all tail callbacks.
    pub const QUEUE_END: Flags = Flags(0b100);

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Flags::SKIP) {
            names.push("SKIP");
        }
        if self.contains(Flags::STOP_AFTER) {
            names.push("STOP_AFTER");
        }
        if self.contains(Flags::QUEUE_END) {
            names.push("QUEUE_END");
        }
        if names.is_empty() {
            names.push("DEFAULT");
        }
        f.write_str(&names.join(" | "))
    }
}

struct Hook<F: ?Sized> {
    flags: Flags,
    cb: Rc<RefCell<F>>,
}

impl<F: ?Sized> Clone for Hook<F> {
    fn clone(&self) -> Hook<F> {
        Hook {
            flags: self.flags,
            cb: self.cb.clone(),
        }
    }
}

/// One action tag's callback list.
///
/// Two regions: the default region first, the [`QUEUE_END`] tail second.
/// Insertion order is preserved within each region.
///
/// [`QUEUE_END`]: Flags::QUEUE_END
pub struct ActionList<F: ?Sized> {
    hooks: Vec<Hook<F>>,
    /// Index of the first tail callback.
    tail_at: usize,
}

impl<F: ?Sized> ActionList<F> {
    pub fn new() -> ActionList<F> {
        ActionList {
            hooks: Vec::new(),
            tail_at: 0,
        }
    }

    /// Appends a callback. `QUEUE_END` callbacks go to the physical tail;
    /// everything else is placed before the tail region.
    pub fn push(&mut self, flags: Flags, cb: Rc<RefCell<F>>) {
        let hook = Hook { flags, cb };
        if flags.contains(Flags::QUEUE_END) {
            self.hooks.push(hook);
        } else {
            self.hooks.insert(self.tail_at, hook);
            self.tail_at += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Captures the current list for dispatch. The snapshot holds its own
    /// references, so the list (and whatever owns it) is free to change
    /// while the snapshot is delivered.
    pub fn snapshot(&self) -> Snapshot<F> {
        Snapshot {
            hooks: self.hooks.clone(),
        }
    }
}

impl<F: ?Sized> Default for ActionList<F> {
    fn default() -> ActionList<F> {
        ActionList::new()
    }
}

impl<F: ?Sized> fmt::Debug for ActionList<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionList")
            .field("len", &self.hooks.len())
            .field("tail_at", &self.tail_at)
            .finish()
    }
}

/// A dispatch-time copy of an [`ActionList`].
pub struct Snapshot<F: ?Sized> {
    hooks: Vec<Hook<F>>,
}

impl<F: ?Sized> fmt::Debug for Snapshot<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("len", &self.hooks.len()).finish()
    }
}

impl<F: ?Sized> Snapshot<F> {
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Invokes the captured callbacks in order, applying flag semantics:
    /// `SKIP` callbacks are passed over, a `STOP_AFTER` callback ends the
    /// dispatch immediately after returning, without touching any later
    /// callback or the list itself.
    ///
    /// `call` receives each callback plus `ctx`; re-entering the very
    /// callback that is currently executing panics.
    pub fn deliver<C: ?Sized>(&self, ctx: &mut C, mut call: impl FnMut(&mut F, &mut C)) {
        for hook in &self.hooks {
            if hook.flags.contains(Flags::SKIP) {
                continue;
            }
            call(&mut *hook.cb.borrow_mut(), ctx);
            if hook.flags.contains(Flags::STOP_AFTER) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type List = ActionList<dyn FnMut(&mut Vec<&'static str>)>;

    fn push(list: &mut List, flags: Flags, tag: &'static str) {
        list.push(flags, Rc::new(RefCell::new(move |out: &mut Vec<&'static str>| out.push(tag))));
    }

    fn run(list: &List) -> Vec<&'static str> {
        let mut out = Vec::new();
        list.snapshot().deliver(&mut out, |cb, out| cb(out));
        out
    }

    #[test]
    fn tail_region_stays_last() {
        let mut list = List::new();
        push(&mut list, Flags::QUEUE_END, "tail");
        push(&mut list, Flags::DEFAULT, "first");
        push(&mut list, Flags::DEFAULT, "second");
        assert_eq!(run(&list), ["first", "second", "tail"]);
    }

    #[test]
    fn stop_after_suppresses_tail() {
        let mut list = List::new();
        push(&mut list, Flags::QUEUE_END, "tail");
        push(&mut list, Flags::STOP_AFTER, "stop");
        assert_eq!(run(&list), ["stop"]);
    }

    #[test]
    fn skip_is_retained_but_silent() {
        let mut list = List::new();
        push(&mut list, Flags::SKIP, "skipped");
        push(&mut list, Flags::DEFAULT, "ran");
        assert_eq!(list.len(), 2);
        assert_eq!(run(&list), ["ran"]);
    }
}
