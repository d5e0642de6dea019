// Not all functions are used by all tests.
#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

use netpoll::Pollable;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Polls `entity` until `done` returns true, failing the test if that
/// takes longer than ten seconds.
pub fn poll_until(entity: &impl Pollable, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for condition"
        );
        netpoll::poll(entity, Some(Duration::from_millis(100))).expect("poll failed");
    }
}
