use std::collections::{HashMap, HashSet};
use std::io::{PipeReader, PipeWriter, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::AppError;
use crate::gpio::{ChipHandle, EdgeKind, GpioBackend, LineHandle, NativeEdge};

const MOCK_CONSUMER: &str = env!("CARGO_PKG_NAME");
const RISING_RECORD: u8 = b'r';
const FALLING_RECORD: u8 = b'f';

/// In-process line controller. Unknown chip paths open as a chip labeled
/// with its path. Edge lines are backed by a pipe, so waiting on them works
/// like on hardware.
#[derive(Default)]
pub struct MockGpioBackend {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    chips: HashMap<String, MockChip>, // keyed by chip path
    open_chips: HashMap<ChipHandle, String>,
    lines: HashMap<LineHandle, MockLine>,
    next_handle: u32,
    opened: usize,
    requested: usize,
    closes: HashMap<ChipHandle, usize>,
    releases: HashMap<LineHandle, usize>,
}

struct MockChip {
    label: Option<String>,
    consumers: HashMap<u32, String>,
    values: HashMap<u32, bool>,
    failing_requests: HashSet<u32>,
    missing_event_fd: HashSet<u32>,
}

impl MockChip {
    fn new(label: Option<String>) -> Self {
        Self {
            label,
            consumers: HashMap::new(),
            values: HashMap::new(),
            failing_requests: HashSet::new(),
            missing_event_fd: HashSet::new(),
        }
    }
}

struct MockLine {
    chip: String,
    offset: u32,
    events: Option<(PipeReader, PipeWriter)>,
}

impl MockState {
    fn next_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn chip_of(&mut self, chip: ChipHandle) -> Result<&mut MockChip, AppError> {
        let path = self
            .open_chips
            .get(&chip)
            .ok_or_else(|| AppError::Gpio(format!("chip handle {} not open", chip.0)))?;
        self.chips
            .get_mut(path)
            .ok_or_else(|| AppError::Gpio(format!("no chip at {path}")))
    }

    fn line_of(&self, line: LineHandle) -> Result<&MockLine, AppError> {
        self.lines
            .get(&line)
            .ok_or_else(|| AppError::Gpio(format!("line handle {} not requested", line.0)))
    }

    fn find_line(&self, path: &str, offset: u32) -> Option<&MockLine> {
        self.lines
            .values()
            .find(|line| line.chip == path && line.offset == offset)
    }

    fn claim(&mut self, chip: ChipHandle, offset: u32) -> Result<String, AppError> {
        let path = self
            .open_chips
            .get(&chip)
            .cloned()
            .ok_or_else(|| AppError::Gpio(format!("chip handle {} not open", chip.0)))?;
        let mock_chip = self.chip_of(chip)?;
        if mock_chip.failing_requests.contains(&offset) {
            return Err(AppError::Gpio(format!("request line {offset} refused")));
        }
        if let Some(consumer) = mock_chip.consumers.get(&offset) {
            return Err(AppError::Gpio(format!("line {offset} busy ({consumer})")));
        }
        mock_chip
            .consumers
            .insert(offset, MOCK_CONSUMER.to_string());
        Ok(path)
    }
}

impl MockGpioBackend {
    pub fn with_chip(self, path: &str, label: &str) -> Self {
        self.add_chip(path, Some(label));
        self
    }

    /// Registers a chip; `None` makes its label unreadable.
    pub fn add_chip(&self, path: &str, label: Option<&str>) {
        self.lock()
            .chips
            .insert(path.to_string(), MockChip::new(label.map(str::to_string)));
    }

    /// Marks a line as held by another process.
    pub fn set_consumer(&self, path: &str, offset: u32, consumer: &str) {
        if let Some(chip) = self.lock().chips.get_mut(path) {
            chip.consumers.insert(offset, consumer.to_string());
        }
    }

    pub fn fail_requests(&self, path: &str, offset: u32) {
        if let Some(chip) = self.lock().chips.get_mut(path) {
            chip.failing_requests.insert(offset);
        }
    }

    pub fn fail_event_fd(&self, path: &str, offset: u32) {
        if let Some(chip) = self.lock().chips.get_mut(path) {
            chip.missing_event_fd.insert(offset);
        }
    }

    /// Queues one edge on a monitored line.
    pub fn inject_edge(&self, path: &str, offset: u32, edge: EdgeKind) -> Result<(), AppError> {
        let record = match edge {
            EdgeKind::Rising => RISING_RECORD,
            EdgeKind::Falling => FALLING_RECORD,
        };
        self.inject_record(path, offset, record)
    }

    /// Queues a record the line cannot decode.
    pub fn inject_garbage(&self, path: &str, offset: u32) -> Result<(), AppError> {
        self.inject_record(path, offset, b'?')
    }

    /// Current output level of a line, `None` if never driven.
    pub fn value(&self, path: &str, offset: u32) -> Option<bool> {
        self.lock()
            .chips
            .get(path)
            .and_then(|chip| chip.values.get(&offset).copied())
    }

    pub fn opened_chips(&self) -> usize {
        self.lock().opened
    }

    pub fn requested_lines(&self) -> usize {
        self.lock().requested
    }

    pub fn chip_closes(&self) -> HashMap<ChipHandle, usize> {
        self.lock().closes.clone()
    }

    pub fn line_releases(&self) -> HashMap<LineHandle, usize> {
        self.lock().releases.clone()
    }

    fn inject_record(&self, path: &str, offset: u32, record: u8) -> Result<(), AppError> {
        let state = self.lock();
        let line = state
            .find_line(path, offset)
            .ok_or_else(|| AppError::Gpio(format!("line {offset} of {path} not requested")))?;
        let (_, writer) = line
            .events
            .as_ref()
            .ok_or_else(|| AppError::Gpio(format!("line {offset} of {path} is an output")))?;
        (&*writer)
            .write_all(&[record])
            .map_err(|e| AppError::Gpio(format!("inject edge: {e}")))
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // a panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GpioBackend for MockGpioBackend {
    fn open_chip(&self, path: &str) -> Result<ChipHandle, AppError> {
        let mut state = self.lock();
        state
            .chips
            .entry(path.to_string())
            .or_insert_with(|| MockChip::new(Some(path.to_string())));
        let handle = ChipHandle(state.next_handle());
        state.open_chips.insert(handle, path.to_string());
        state.opened += 1;
        Ok(handle)
    }

    fn chip_label(&self, chip: ChipHandle) -> Result<String, AppError> {
        let mut state = self.lock();
        state
            .chip_of(chip)?
            .label
            .clone()
            .ok_or_else(|| AppError::Gpio(format!("chip handle {} has no label", chip.0)))
    }

    fn line_consumer(&self, chip: ChipHandle, offset: u32) -> Result<Option<String>, AppError> {
        let mut state = self.lock();
        Ok(state.chip_of(chip)?.consumers.get(&offset).cloned())
    }

    fn request_edges(&self, chip: ChipHandle, offset: u32) -> Result<LineHandle, AppError> {
        let mut state = self.lock();
        let path = state.claim(chip, offset)?;
        let events =
            std::io::pipe().map_err(|e| AppError::Gpio(format!("edge pipe: {e}")))?;
        let handle = LineHandle(state.next_handle());
        state.lines.insert(
            handle,
            MockLine {
                chip: path,
                offset,
                events: Some(events),
            },
        );
        state.requested += 1;
        Ok(handle)
    }

    fn request_output(
        &self,
        chip: ChipHandle,
        offset: u32,
        initial: bool,
    ) -> Result<LineHandle, AppError> {
        let mut state = self.lock();
        let path = state.claim(chip, offset)?;
        state.chip_of(chip)?.values.insert(offset, initial);
        let handle = LineHandle(state.next_handle());
        state.lines.insert(
            handle,
            MockLine {
                chip: path,
                offset,
                events: None,
            },
        );
        state.requested += 1;
        Ok(handle)
    }

    fn event_fd(&self, line: LineHandle) -> Result<RawFd, AppError> {
        let state = self.lock();
        let mock_line = state.line_of(line)?;
        let missing = state
            .chips
            .get(&mock_line.chip)
            .is_some_and(|chip| chip.missing_event_fd.contains(&mock_line.offset));
        match &mock_line.events {
            Some((reader, _)) if !missing => Ok(reader.as_raw_fd()),
            _ => Err(AppError::Gpio(format!(
                "line {} has no event descriptor",
                mock_line.offset
            ))),
        }
    }

    fn read_edge(&self, line: LineHandle) -> Result<NativeEdge, AppError> {
        let mut reader = {
            let state = self.lock();
            let (reader, _) = state
                .line_of(line)?
                .events
                .as_ref()
                .ok_or_else(|| AppError::Gpio(format!("line handle {} is an output", line.0)))?;
            reader
                .try_clone()
                .map_err(|e| AppError::Gpio(format!("edge pipe: {e}")))?
        };

        let mut record = [0u8; 1];
        reader
            .read_exact(&mut record)
            .map_err(|e| AppError::Gpio(format!("read edge: {e}")))?;
        let kind = match record[0] {
            RISING_RECORD => EdgeKind::Rising,
            FALLING_RECORD => EdgeKind::Falling,
            other => {
                return Err(AppError::Gpio(format!(
                    "malformed edge record {other:#04x}"
                )));
            }
        };
        Ok(NativeEdge {
            kind,
            timestamp: epoch(),
        })
    }

    fn set_value(&self, line: LineHandle, value: bool) -> Result<(), AppError> {
        let mut state = self.lock();
        let mock_line = state.line_of(line)?;
        if mock_line.events.is_some() {
            return Err(AppError::Gpio(format!(
                "line {} is not an output",
                mock_line.offset
            )));
        }
        let (path, offset) = (mock_line.chip.clone(), mock_line.offset);
        if let Some(chip) = state.chips.get_mut(&path) {
            chip.values.insert(offset, value);
        }
        Ok(())
    }

    fn release_line(&self, line: LineHandle) {
        let mut state = self.lock();
        *state.releases.entry(line).or_default() += 1;
        if let Some(mock_line) = state.lines.remove(&line)
            && let Some(chip) = state.chips.get_mut(&mock_line.chip)
        {
            chip.consumers.remove(&mock_line.offset);
        }
    }

    fn close_chip(&self, chip: ChipHandle) {
        let mut state = self.lock();
        *state.closes.entry(chip).or_default() += 1;
        state.open_chips.remove(&chip);
    }
}

fn epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}
