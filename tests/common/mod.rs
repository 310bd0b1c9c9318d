//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use pedlbrd::net::{Arg, MemoryTransport, NetAddress, NetMessage};
use std::time::{Duration, Instant};

/// Default wait for engine-side effects
pub fn test_timeout() -> Duration {
    Duration::from_secs(3)
}

/// Address the test client sends commands from
pub fn client() -> NetAddress {
    NetAddress::new("127.0.0.1", 9300)
}

/// Poll `cond` until it holds or `timeout` elapses
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Messages sent to `path`, without their destinations
pub fn messages(transport: &MemoryTransport, path: &str) -> Vec<NetMessage> {
    transport
        .sent_to_path(path)
        .into_iter()
        .map(|(_, msg)| msg)
        .collect()
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f32, b: f32, epsilon: f32) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// Float argument at `index`
pub fn float_arg(msg: &NetMessage, index: usize) -> f32 {
    msg.args
        .get(index)
        .and_then(Arg::as_float)
        .unwrap_or_else(|| panic!("no float at {} in {:?}", index, msg))
}
