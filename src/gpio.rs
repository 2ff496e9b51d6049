use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::error::AppError;
use crate::handler::EdgeHandler;
use crate::registry::{ChipRegistry, LineEntry, LineKind, LineRegistry};

pub type ChipId = u32;
pub type LineId = u32;

/// Backend-owned token for an open chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChipHandle(pub u32);

/// Backend-owned token for a requested line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Rising,
    Falling,
}

impl EdgeKind {
    /// Output level an imported edge drives its target to.
    pub fn level(self) -> bool {
        matches!(self, EdgeKind::Rising)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::Rising => "rising",
            EdgeKind::Falling => "falling",
        }
    }
}

/// One edge as read from a line's wait descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeEdge {
    pub kind: EdgeKind,
    pub timestamp: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeEvent {
    pub chip_id: ChipId,
    pub line_id: LineId,
    pub offset: u32,
    pub edge: EdgeKind,
    pub timestamp_ms: u64,
}

/// The native line-controller library. Implementations only perform the
/// calls; sequencing and caching of their results lives in [`GpioContext`].
pub trait GpioBackend: Send + Sync {
    fn open_chip(&self, path: &str) -> Result<ChipHandle, AppError>;
    fn chip_label(&self, chip: ChipHandle) -> Result<String, AppError>;
    /// Current consumer of a line, `None` when the line is free.
    fn line_consumer(&self, chip: ChipHandle, offset: u32) -> Result<Option<String>, AppError>;
    fn request_edges(&self, chip: ChipHandle, offset: u32) -> Result<LineHandle, AppError>;
    fn request_output(
        &self,
        chip: ChipHandle,
        offset: u32,
        initial: bool,
    ) -> Result<LineHandle, AppError>;
    fn event_fd(&self, line: LineHandle) -> Result<RawFd, AppError>;
    fn read_edge(&self, line: LineHandle) -> Result<NativeEdge, AppError>;
    fn set_value(&self, line: LineHandle, value: bool) -> Result<(), AppError>;
    fn release_line(&self, line: LineHandle);
    fn close_chip(&self, chip: ChipHandle);
}

/// Chips, lines and handlers of one monitor instance.
///
/// Populated through `&mut self` during setup, then shared behind `Arc` with
/// the dispatcher and the actuators. Dropping it releases every line and
/// then closes every chip.
pub struct GpioContext {
    backend: Arc<dyn GpioBackend>,
    chips: ChipRegistry,
    lines: LineRegistry,
}

impl GpioContext {
    pub fn new(backend: Arc<dyn GpioBackend>) -> Self {
        Self {
            backend,
            chips: ChipRegistry::default(),
            lines: LineRegistry::default(),
        }
    }

    pub fn backend(&self) -> &dyn GpioBackend {
        self.backend.as_ref()
    }

    pub fn open_chip(&mut self, path: &str) -> Result<ChipId, AppError> {
        let handle = self.backend.open_chip(path)?;
        self.add_chip(handle)
    }

    /// Registers an open chip, deduplicated by label. The handle is owned by
    /// the context from here on: a duplicate or unlabeled chip is closed.
    pub fn add_chip(&mut self, handle: ChipHandle) -> Result<ChipId, AppError> {
        let label = match self.backend.chip_label(handle) {
            Ok(label) => label,
            Err(e) => {
                self.backend.close_chip(handle);
                return Err(AppError::ChipLabel(e.to_string()));
            }
        };

        if let Some(id) = self.chips.find(&label) {
            debug!("chip {label} already registered as {id}");
            self.backend.close_chip(handle);
            return Ok(id);
        }

        let id = self.chips.insert(label, handle);
        debug!("chip {} registered as {id}", self.chips.label(id).unwrap_or_default());
        Ok(id)
    }

    /// Requests a line for both-edges monitoring.
    pub fn request_line(&mut self, chip_id: ChipId, offset: u32) -> Result<LineId, AppError> {
        let chip = self.claimable(chip_id, offset)?;

        let line = self
            .backend
            .request_edges(chip, offset)
            .map_err(|e| AppError::LineRequest(format!("line {offset}: {e}")))?;
        let fd = match self.backend.event_fd(line) {
            Ok(fd) => fd,
            Err(e) => {
                self.backend.release_line(line);
                return Err(AppError::LineConfig(format!("line {offset}: {e}")));
            }
        };

        let id = self.lines.insert(chip_id, offset, line, LineKind::input(fd));
        debug!("line {offset} of chip {chip_id} monitored as {id}");
        Ok(id)
    }

    pub fn request_output(
        &mut self,
        chip_id: ChipId,
        offset: u32,
        initial: bool,
    ) -> Result<LineId, AppError> {
        let chip = self.claimable(chip_id, offset)?;

        let line = self
            .backend
            .request_output(chip, offset, initial)
            .map_err(|e| AppError::LineRequest(format!("line {offset}: {e}")))?;

        let id = self.lines.insert(chip_id, offset, line, LineKind::output());
        debug!("line {offset} of chip {chip_id} driven as output {id}");
        Ok(id)
    }

    /// Adds a handler in front of the line's chain.
    pub fn add_handler<H: EdgeHandler + 'static>(
        &mut self,
        line_id: LineId,
        handler: H,
    ) -> Result<(), AppError> {
        let chain = self
            .lines
            .get_mut(line_id)
            .and_then(LineEntry::handlers_mut)
            .ok_or(AppError::LineNotFound(line_id))?;
        chain.prepend(Box::new(handler));
        Ok(())
    }

    pub fn chip_count(&self) -> usize {
        self.chips.len()
    }

    pub fn chip_label(&self, chip_id: ChipId) -> Option<&str> {
        self.chips.label(chip_id)
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn line(&self, line_id: LineId) -> Option<&LineEntry> {
        self.lines.get(line_id)
    }

    pub fn input_lines(&self) -> impl Iterator<Item = &LineEntry> {
        self.lines.iter().filter(|line| line.is_input())
    }

    fn claimable(&self, chip_id: ChipId, offset: u32) -> Result<ChipHandle, AppError> {
        let chip = self
            .chips
            .handle(chip_id)
            .ok_or(AppError::ChipNotFound(chip_id))?;

        let consumer = self
            .backend
            .line_consumer(chip, offset)
            .map_err(|e| AppError::LineRequest(format!("line {offset}: {e}")))?;
        match consumer {
            Some(consumer) => Err(AppError::LineBusy { offset, consumer }),
            None => Ok(chip),
        }
    }
}

impl Drop for GpioContext {
    fn drop(&mut self) {
        for line in self.lines.drain() {
            self.backend.release_line(line.handle());
        }
        for chip in self.chips.drain() {
            self.backend.close_chip(chip);
        }
    }
}
