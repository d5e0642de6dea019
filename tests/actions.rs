use std::cell::RefCell;
use std::rc::Rc;

use netpoll::{ActionList, Flags};

/// A list whose callbacks can reach both an event log and the list
/// itself, to exercise mutation during dispatch.
struct World {
    list: ActionList<Callback>,
    log: Vec<&'static str>,
}

type Callback = dyn FnMut(&mut World);

fn push(world: &mut World, flags: Flags, tag: &'static str) {
    world
        .list
        .push(flags, Rc::new(RefCell::new(move |w: &mut World| w.log.push(tag))));
}

fn dispatch(world: &mut World) {
    let snapshot = world.list.snapshot();
    snapshot.deliver(world, |cb, w| cb(w));
}

fn world() -> World {
    World {
        list: ActionList::new(),
        log: Vec::new(),
    }
}

#[test]
fn insertion_order_is_dispatch_order() {
    let mut w = world();
    push(&mut w, Flags::DEFAULT, "a");
    push(&mut w, Flags::DEFAULT, "b");
    push(&mut w, Flags::DEFAULT, "c");
    dispatch(&mut w);
    assert_eq!(w.log, ["a", "b", "c"]);
}

#[test]
fn default_added_after_tail_still_runs_first() {
    let mut w = world();
    push(&mut w, Flags::QUEUE_END, "tail");
    push(&mut w, Flags::DEFAULT, "default");
    dispatch(&mut w);
    assert_eq!(w.log, ["default", "tail"]);
}

#[test]
fn tail_region_preserves_its_own_order() {
    let mut w = world();
    push(&mut w, Flags::QUEUE_END, "tail-1");
    push(&mut w, Flags::DEFAULT, "a");
    push(&mut w, Flags::QUEUE_END, "tail-2");
    push(&mut w, Flags::DEFAULT, "b");
    dispatch(&mut w);
    assert_eq!(w.log, ["a", "b", "tail-1", "tail-2"]);
}

#[test]
fn stop_after_ends_the_dispatch() {
    let mut w = world();
    push(&mut w, Flags::QUEUE_END, "tail");
    push(&mut w, Flags::DEFAULT, "first");
    push(&mut w, Flags::STOP_AFTER, "stop");
    push(&mut w, Flags::DEFAULT, "late");
    dispatch(&mut w);
    // Nothing after the STOP_AFTER callback fires, tail included.
    assert_eq!(w.log, ["first", "stop"]);
}

#[test]
fn skip_is_retained_but_not_invoked() {
    let mut w = world();
    push(&mut w, Flags::SKIP, "skipped");
    push(&mut w, Flags::DEFAULT, "ran");
    dispatch(&mut w);
    assert_eq!(w.log, ["ran"]);
    assert_eq!(w.list.len(), 2);
}

#[test]
fn adding_during_dispatch_does_not_invalidate_the_round() {
    let mut w = world();
    w.list.push(
        Flags::DEFAULT,
        Rc::new(RefCell::new(|w: &mut World| {
            w.log.push("outer");
            push(w, Flags::DEFAULT, "added");
        })),
    );
    dispatch(&mut w);
    // The callback added mid-dispatch runs on the next dispatch only.
    assert_eq!(w.log, ["outer"]);
    dispatch(&mut w);
    assert_eq!(w.log, ["outer", "outer", "added"]);
}

#[test]
fn empty_dispatch_is_a_no_op() {
    let mut w = world();
    dispatch(&mut w);
    assert!(w.log.is_empty());
    assert!(w.list.is_empty());
}
