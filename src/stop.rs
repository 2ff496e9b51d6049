use std::io::{PipeReader, PipeWriter, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::warn;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;

use crate::error::AppError;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Outcome of waiting on a descriptor alongside a [`StopSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Ready,
    Stopped,
}

struct StopInner {
    stopped: AtomicBool,
    reader: PipeReader,
    writer: Mutex<PipeWriter>,
}

/// Cooperative stop flag paired with a pipe, so that a thread blocked in
/// `poll` observes the stop without waiting for other I/O. Once raised it
/// stays raised.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl StopSignal {
    pub fn new() -> Result<Self, AppError> {
        let (reader, writer) =
            std::io::pipe().map_err(|e| AppError::Gpio(format!("stop pipe: {e}")))?;
        Ok(Self {
            inner: Arc::new(StopInner {
                stopped: AtomicBool::new(false),
                reader,
                writer: Mutex::new(writer),
            }),
        })
    }

    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // never drained: the read end stays readable for every later poll
        if let Err(e) = self.inner.writer.lock().write_all(&[1]) {
            warn!("stop signal: {e}");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.inner.reader.as_fd()
    }

    /// Blocks until `fd` is readable (or hung up) or the signal is raised.
    pub fn wait_readable(&self, fd: BorrowedFd<'_>) -> Result<Wake, AppError> {
        loop {
            if self.is_stopped() {
                return Ok(Wake::Stopped);
            }
            let mut fds = [
                PollFd::new(self.fd(), PollFlags::POLLIN),
                PollFd::new(fd, PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(AppError::Gpio(format!("poll: {e}"))),
            }
            if is_signaled(&fds[0]) || self.is_stopped() {
                return Ok(Wake::Stopped);
            }
            if is_signaled(&fds[1]) {
                return Ok(Wake::Ready);
            }
        }
    }

    /// Sleeps for `timeout` unless stopped first. Returns whether the signal
    /// is raised.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_stopped() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            let mut fds = [PollFd::new(self.fd(), PollFlags::POLLIN)];
            match poll(&mut fds, poll_timeout(left)) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    warn!("stop signal poll: {e}");
                    thread::sleep(left);
                }
            }
        }
        self.is_stopped()
    }
}

fn poll_timeout(timeout: Duration) -> PollTimeout {
    i32::try_from(timeout.as_millis())
        .ok()
        .and_then(|ms| PollTimeout::try_from(ms).ok())
        .unwrap_or(PollTimeout::MAX)
}

pub(crate) fn is_signaled(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| !r.is_empty())
}

/// Joins a worker, giving up after `timeout`. A worker that outlives the
/// timeout is left detached; everything it touches is kept alive by its own
/// `Arc`s.
pub fn join_with_timeout(
    handle: JoinHandle<()>,
    timeout: Duration,
    name: &str,
) -> Result<(), AppError> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(AppError::Shutdown(format!(
                "{name} did not exit within {} ms",
                timeout.as_millis()
            )));
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
    handle
        .join()
        .map_err(|_| AppError::Shutdown(format!("{name} panicked")))
}
