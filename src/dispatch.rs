use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::error::AppError;
use crate::gpio::{EdgeEvent, GpioContext, LineId};
use crate::registry::LineEntry;
use crate::stop::{StopSignal, is_signaled, join_with_timeout};

const DISPATCH_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const DISPATCH_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of one wait cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Number of ready lines whose edge was read and dispatched.
    Serviced(usize),
    Stopped,
}

/// Waits across every input line of a context and runs the handler chain of
/// each line that has an edge pending.
pub struct Dispatcher {
    ctx: Arc<GpioContext>,
    stop: StopSignal,
    dropped: Vec<LineId>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<GpioContext>) -> Result<Self, AppError> {
        Ok(Self {
            ctx,
            stop: StopSignal::new()?,
            dropped: Vec::new(),
        })
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Blocks until at least one line is ready or the dispatcher is stopped,
    /// then reads exactly one edge from every ready line.
    pub fn dispatch_once(&mut self) -> Result<Cycle, AppError> {
        let ctx = Arc::clone(&self.ctx);
        let lines: Vec<(&LineEntry, RawFd)> = ctx
            .input_lines()
            .filter(|line| !self.dropped.contains(&line.id()))
            .filter_map(|line| line.event_fd().map(|fd| (line, fd)))
            .collect();

        let mut fds = Vec::with_capacity(lines.len() + 1);
        fds.push(PollFd::new(self.stop.fd(), PollFlags::POLLIN));
        for &(_, raw) in &lines {
            // SAFETY: the descriptor belongs to a line requested from the
            // backend and stays open until the context releases it on drop;
            // `ctx` is held for the whole cycle.
            let fd = unsafe { BorrowedFd::borrow_raw(raw) };
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Cycle::Serviced(0)),
            Err(e) => return Err(AppError::Gpio(format!("poll: {e}"))),
        }
        if is_signaled(&fds[0]) || self.stop.is_stopped() {
            return Ok(Cycle::Stopped);
        }

        let ready: Vec<PollFlags> = fds[1..]
            .iter()
            .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
            .collect();
        drop(fds);

        let mut serviced = 0;
        for (&(line, _), revents) in lines.iter().zip(ready) {
            if revents.contains(PollFlags::POLLIN) {
                match ctx.backend().read_edge(line.handle()) {
                    Ok(edge) => {
                        let event = EdgeEvent {
                            chip_id: line.chip_id(),
                            line_id: line.id(),
                            offset: line.offset(),
                            edge: edge.kind,
                            timestamp_ms: edge.timestamp.as_millis() as u64,
                        };
                        line.dispatch(&event);
                        serviced += 1;
                    }
                    Err(e) => error!("dispatch: read edge on line {}: {e}", line.id()),
                }
            } else if revents
                .intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
            {
                error!(
                    "dispatch: line {} reported {revents:?}, no longer monitored",
                    line.id()
                );
                self.dropped.push(line.id());
            }
        }
        Ok(Cycle::Serviced(serviced))
    }

    pub fn run(mut self) {
        debug!(
            "dispatcher: monitoring {} lines",
            self.ctx.input_lines().count()
        );
        loop {
            match self.dispatch_once() {
                Ok(Cycle::Stopped) => break,
                Ok(Cycle::Serviced(_)) => {}
                Err(e) => {
                    error!("dispatcher: {e}");
                    if self.stop.sleep(DISPATCH_ERROR_BACKOFF) {
                        break;
                    }
                }
            }
        }
        debug!("dispatcher: stopped");
    }

    pub fn spawn(self) -> Result<DispatcherHandle, AppError> {
        let stop = self.stop_signal();
        let thread = thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || self.run())
            .map_err(|e| AppError::Gpio(format!("spawn dispatcher: {e}")))?;
        Ok(DispatcherHandle {
            stop,
            thread: Some(thread),
        })
    }
}

pub struct DispatcherHandle {
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(&mut self, timeout: Duration) -> Result<(), AppError> {
        self.stop.stop();
        match self.thread.take() {
            Some(thread) => join_with_timeout(thread, timeout, "dispatcher"),
            None => Ok(()),
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop(DISPATCH_STOP_TIMEOUT) {
            warn!("{e}");
        }
    }
}
