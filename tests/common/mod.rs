#![allow(dead_code)]

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gpiomux::MockGpioBackend;

pub const CHIP0: &str = "/dev/gpiochip0";
pub const CHIP1: &str = "/dev/gpiochip1";

pub fn mock_backend() -> Arc<MockGpioBackend> {
    Arc::new(
        MockGpioBackend::default()
            .with_chip(CHIP0, "pinctrl-bcm2711")
            .with_chip(CHIP1, "raspberrypi-exp-gpio"),
    )
}

/// Polls `cond` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Writes one record the way an external client does: open, write, close.
pub fn send(path: &Path, bytes: &[u8]) {
    let mut fifo = OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open fifo for writing");
    fifo.write_all(bytes).expect("write record");
}
