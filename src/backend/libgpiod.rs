use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::AppError;
use crate::gpio::{ChipHandle, EdgeKind, GpioBackend, LineHandle, NativeEdge};

// one edge per read keeps every line's queue in the kernel between cycles
const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 1;

pub struct LibgpiodBackend {
    chips: RwLock<FxHashMap<ChipHandle, Arc<GpiodChip>>>,
    lines: RwLock<FxHashMap<LineHandle, Arc<GpiodLine>>>,
    next_handle: AtomicU32,
}

/// An open chip, held until `close_chip`.
struct GpiodChip {
    path: PathBuf,
    chip: Mutex<Chip>,
}

struct GpiodLine {
    offset: u32,
    request: FairMutex<request::Request>,
    buffer: Mutex<request::Buffer>,
}

impl LibgpiodBackend {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            chips: RwLock::new(FxHashMap::default()),
            lines: RwLock::new(FxHashMap::default()),
            next_handle: AtomicU32::new(0),
        })
    }

    fn next_handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn chip(&self, chip: ChipHandle) -> Result<Arc<GpiodChip>, AppError> {
        self.chips
            .read()
            .get(&chip)
            .cloned()
            .ok_or_else(|| AppError::Gpio(format!("chip handle {} not open", chip.0)))
    }

    fn line(&self, line: LineHandle) -> Result<Arc<GpiodLine>, AppError> {
        self.lines
            .read()
            .get(&line)
            .cloned()
            .ok_or_else(|| AppError::Gpio(format!("line handle {} not requested", line.0)))
    }

    fn request(
        &self,
        chip: ChipHandle,
        offset: u32,
        settings: line::Settings,
    ) -> Result<LineHandle, AppError> {
        let chip = self.chip(chip)?;

        let mut line_cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        line_cfg
            .add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;

        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;
        let request = chip
            .chip
            .lock()
            .request_lines(Some(&req_cfg), &line_cfg)
            .map_err(|e| {
                AppError::Gpio(format!("request lines on {}: {e}", chip.path.display()))
            })?;
        let buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| AppError::Gpio(format!("event buffer: {e}")))?;

        let handle = LineHandle(self.next_handle());
        self.lines.write().insert(
            handle,
            Arc::new(GpiodLine {
                offset,
                request: FairMutex::new(request),
                buffer: Mutex::new(buffer),
            }),
        );
        Ok(handle)
    }
}

impl GpioBackend for LibgpiodBackend {
    fn open_chip(&self, path: &str) -> Result<ChipHandle, AppError> {
        let p = PathBuf::from(path);
        let chip = Chip::open(&p).map_err(|e| AppError::Gpio(format!("open chip {path}: {e}")))?;

        let handle = ChipHandle(self.next_handle());
        self.chips.write().insert(
            handle,
            Arc::new(GpiodChip {
                path: p,
                chip: Mutex::new(chip),
            }),
        );
        Ok(handle)
    }

    fn chip_label(&self, chip: ChipHandle) -> Result<String, AppError> {
        let info = self
            .chip(chip)?
            .chip
            .lock()
            .info()
            .map_err(|e| AppError::Gpio(format!("chip info: {e}")))?;
        info.label()
            .map(str::to_string)
            .map_err(|e| AppError::Gpio(format!("chip label: {e}")))
    }

    fn line_consumer(&self, chip: ChipHandle, offset: u32) -> Result<Option<String>, AppError> {
        let info = self
            .chip(chip)?
            .chip
            .lock()
            .line_info(offset)
            .map_err(|e| AppError::Gpio(format!("line info {offset}: {e}")))?;
        if !info.is_used() {
            return Ok(None);
        }
        Ok(Some(
            info.consumer()
                .map(str::to_string)
                .unwrap_or_else(|_| "kernel".to_string()),
        ))
    }

    fn request_edges(&self, chip: ChipHandle, offset: u32) -> Result<LineHandle, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;
        ls.set_direction(line::Direction::Input)
            .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
        ls.set_edge_detection(Some(line::Edge::Both))
            .map_err(|e| AppError::Gpio(format!("set edge detection: {e}")))?;
        ls.set_event_clock(EventClock::Realtime)
            .map_err(|e| AppError::Gpio(format!("set event clock: {e}")))?;
        self.request(chip, offset, ls)
    }

    fn request_output(
        &self,
        chip: ChipHandle,
        offset: u32,
        initial: bool,
    ) -> Result<LineHandle, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;
        ls.set_direction(line::Direction::Output)
            .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
        ls.set_output_value(level(initial))
            .map_err(|e| AppError::Gpio(format!("set output value: {e}")))?;
        self.request(chip, offset, ls)
    }

    fn event_fd(&self, line: LineHandle) -> Result<RawFd, AppError> {
        let slot = self.line(line)?;
        let fd = slot.request.lock().as_raw_fd();
        if fd < 0 {
            return Err(AppError::Gpio(format!(
                "line {} has no event descriptor",
                slot.offset
            )));
        }
        Ok(fd)
    }

    fn read_edge(&self, line: LineHandle) -> Result<NativeEdge, AppError> {
        let slot = self.line(line)?;
        let mut buffer = slot.buffer.lock();
        let req = slot.request.lock();

        let mut events = req
            .read_edge_events(&mut buffer)
            .map_err(|e| AppError::Gpio(format!("read edge events: {e}")))?;
        let evt = events
            .next()
            .ok_or_else(|| AppError::Gpio(format!("no edge pending on line {}", slot.offset)))?
            .map_err(|e| AppError::Gpio(format!("edge event: {e}")))?;
        let kind = match evt.event_type() {
            Ok(line::EdgeKind::Rising) => EdgeKind::Rising,
            Ok(line::EdgeKind::Falling) => EdgeKind::Falling,
            Err(e) => return Err(AppError::Gpio(format!("edge event type: {e}"))),
        };
        Ok(NativeEdge {
            kind,
            timestamp: evt.timestamp(),
        })
    }

    fn set_value(&self, line: LineHandle, value: bool) -> Result<(), AppError> {
        let slot = self.line(line)?;
        slot.request
            .lock()
            .set_value(slot.offset, level(value))
            .map_err(|e| AppError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }

    fn release_line(&self, line: LineHandle) {
        // dropping the request releases the line
        self.lines.write().remove(&line);
    }

    fn close_chip(&self, chip: ChipHandle) {
        // dropping the last reference closes the chip descriptor
        self.chips.write().remove(&chip);
    }
}

fn level(value: bool) -> line::Value {
    if value {
        line::Value::Active
    } else {
        line::Value::InActive
    }
}
