pub mod scan;

use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, ErrorKind, Read};
use std::os::fd::AsFd;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use nix::libc;
use nix::sys::stat::Mode;
use parking_lot::Mutex;

use crate::actuator::Actuator;
use crate::error::AppError;
use crate::gpio::{ChipId, GpioContext, LineId};
use crate::stop::{StopSignal, Wake, join_with_timeout};

pub use scan::{RAW_RECORD_SIZE, RawEdgeRecord, RawScan, Scan, SimpleScan, scanner};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(200);
const IMPORT_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const FIFO_MODE: u32 = 0o666;

/// The output line an import source drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportTarget {
    pub chip_id: ChipId,
    pub line_id: LineId,
    pub offset: u32,
}

impl ImportTarget {
    pub fn resolve(ctx: &GpioContext, line_id: LineId) -> Result<Self, AppError> {
        match ctx.line(line_id) {
            Some(line) if line.is_output() => Ok(Self {
                chip_id: line.chip_id(),
                line_id,
                offset: line.offset(),
            }),
            _ => Err(AppError::LineNotFound(line_id)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    Stopped,
    Listening,
    Exchanging,
}

/// Named pipe feeding edges into one output line, served by its own worker.
pub struct ImportSource {
    path: PathBuf,
    target: ImportTarget,
    state: Arc<Mutex<ImportState>>,
    stop: StopSignal,
    worker: Option<JoinHandle<()>>,
}

impl ImportSource {
    /// Creates the pipe at `path` (replacing any existing file) and starts
    /// listening on it.
    pub fn create(
        path: impl Into<PathBuf>,
        scan: Box<dyn Scan>,
        line_id: LineId,
        actuator: Actuator,
        settle_delay: Duration,
    ) -> Result<Self, AppError> {
        let path = path.into();
        let target = ImportTarget::resolve(actuator.context(), line_id)?;
        debug!("import: import {}", path.display());
        create_fifo(&path)?;

        let stop = StopSignal::new()?;
        let state = Arc::new(Mutex::new(ImportState::Listening));
        let worker = ImportWorker {
            path: path.clone(),
            scan,
            target,
            actuator,
            settle_delay,
            stop: stop.clone(),
            state: state.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("import {}", path.display()))
            .spawn(move || worker.run());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                remove_fifo(&path);
                return Err(AppError::TransportOpen(format!("spawn worker: {e}")));
            }
        };

        Ok(Self {
            path,
            target,
            state,
            stop,
            worker: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn target(&self) -> ImportTarget {
        self.target
    }

    pub fn state(&self) -> ImportState {
        *self.state.lock()
    }

    /// Stops the worker, waits up to `timeout` for it and removes the pipe.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), AppError> {
        self.stop.stop();
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let name = format!("import {}", self.path.display());
        let joined = join_with_timeout(worker, timeout, &name);
        remove_fifo(&self.path);
        joined
    }
}

impl Drop for ImportSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop(IMPORT_STOP_TIMEOUT) {
            warn!("{e}");
        }
    }
}

fn create_fifo(path: &Path) -> Result<(), AppError> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(AppError::TransportOpen(format!(
                "unlink {}: {e}",
                path.display()
            )));
        }
    }
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(FIFO_MODE as libc::mode_t))
        .map_err(|e| AppError::TransportOpen(format!("mkfifo {}: {e}", path.display())))?;
    // mkfifo is subject to the umask
    fs::set_permissions(path, Permissions::from_mode(FIFO_MODE))
        .map_err(|e| AppError::TransportOpen(format!("chmod {}: {e}", path.display())))
}

fn remove_fifo(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != ErrorKind::NotFound
    {
        warn!("import: remove {}: {e}", path.display());
    }
}

struct ImportWorker {
    path: PathBuf,
    scan: Box<dyn Scan>,
    target: ImportTarget,
    actuator: Actuator,
    settle_delay: Duration,
    stop: StopSignal,
    state: Arc<Mutex<ImportState>>,
}

impl ImportWorker {
    fn run(self) {
        while !self.stop.is_stopped() {
            self.set_state(ImportState::Listening);
            match self.accept() {
                Ok(Some(transport)) => {
                    self.set_state(ImportState::Exchanging);
                    self.exchange(transport);
                }
                Ok(None) => break,
                Err(e) => error!("import: {e}"),
            }
            // writers closing fast may otherwise see the pipe reopened under them
            if self.stop.sleep(self.settle_delay) {
                break;
            }
        }
        self.set_state(ImportState::Stopped);
        debug!("import: {} stopped", self.path.display());
    }

    fn set_state(&self, state: ImportState) {
        *self.state.lock() = state;
    }

    /// Waits for a writer. The pipe is opened non-blocking so the wait can
    /// also watch the stop signal; `None` means the source was stopped.
    fn accept(&self) -> Result<Option<FifoTransport<'_>>, AppError> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| AppError::TransportOpen(format!("{}: {e}", self.path.display())))?;

        match self.stop.wait_readable(file.as_fd())? {
            Wake::Ready => Ok(Some(FifoTransport {
                file,
                stop: &self.stop,
            })),
            Wake::Stopped => Ok(None),
        }
    }

    /// Decodes one event, closes the pipe, then drives the target. Closing
    /// first means the next writer always meets a freshly opened pipe.
    fn exchange(&self, mut transport: FifoTransport<'_>) {
        debug!("import: new fifo client on {}", self.path.display());
        let scanned = self.scan.scan(&mut transport, self.target);
        drop(transport);

        let result = scanned.and_then(|event| self.actuator.apply(&event));
        if let Err(e) = result {
            error!("import: {}: {e}", self.path.display());
        }
    }
}

/// Reading side of an accepted pipe. Reads wait for data alongside the stop
/// signal instead of blocking in `read`.
struct FifoTransport<'a> {
    file: File,
    stop: &'a StopSignal,
}

impl Read for FifoTransport<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.file.read(buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    match self.stop.wait_readable(self.file.as_fd()) {
                        Ok(Wake::Ready) => continue,
                        Ok(Wake::Stopped) => return Err(io::Error::other("import stopped")),
                        Err(e) => return Err(io::Error::other(e.to_string())),
                    }
                }
                other => return other,
            }
        }
    }
}
