use std::os::fd::RawFd;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::gpio::{ChipHandle, ChipId, EdgeEvent, LineHandle, LineId};
use crate::handler::HandlerChain;

struct ChipEntry {
    label: String,
    handle: ChipHandle,
}

/// Open chips addressed by id, with a label index for deduplication.
#[derive(Default)]
pub struct ChipRegistry {
    chips: Vec<ChipEntry>, // indexed by chip id
    by_label: FxHashMap<String, ChipId>,
}

impl ChipRegistry {
    pub fn find(&self, label: &str) -> Option<ChipId> {
        self.by_label.get(label).copied()
    }

    pub fn insert(&mut self, label: String, handle: ChipHandle) -> ChipId {
        let id = self.chips.len() as ChipId;
        self.by_label.insert(label.clone(), id);
        self.chips.push(ChipEntry { label, handle });
        id
    }

    pub fn handle(&self, id: ChipId) -> Option<ChipHandle> {
        self.chips.get(id as usize).map(|chip| chip.handle)
    }

    pub fn label(&self, id: ChipId) -> Option<&str> {
        self.chips.get(id as usize).map(|chip| chip.label.as_str())
    }

    pub fn len(&self) -> usize {
        self.chips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chips.is_empty()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = ChipHandle> + '_ {
        self.by_label.clear();
        self.chips.drain(..).map(|chip| chip.handle)
    }
}

pub enum LineKind {
    Input { fd: RawFd, handlers: HandlerChain },
    /// Serializes actuation from concurrent import sources.
    Output { lock: Mutex<()> },
}

impl LineKind {
    pub(crate) fn input(fd: RawFd) -> Self {
        LineKind::Input {
            fd,
            handlers: HandlerChain::default(),
        }
    }

    pub(crate) fn output() -> Self {
        LineKind::Output {
            lock: Mutex::new(()),
        }
    }
}

pub struct LineEntry {
    id: LineId,
    chip_id: ChipId,
    offset: u32,
    handle: LineHandle,
    kind: LineKind,
}

impl LineEntry {
    pub fn id(&self) -> LineId {
        self.id
    }

    pub fn chip_id(&self) -> ChipId {
        self.chip_id
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn handle(&self) -> LineHandle {
        self.handle
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, LineKind::Input { .. })
    }

    pub fn is_output(&self) -> bool {
        matches!(self.kind, LineKind::Output { .. })
    }

    pub fn event_fd(&self) -> Option<RawFd> {
        match &self.kind {
            LineKind::Input { fd, .. } => Some(*fd),
            LineKind::Output { .. } => None,
        }
    }

    pub fn handlers(&self) -> Option<&HandlerChain> {
        match &self.kind {
            LineKind::Input { handlers, .. } => Some(handlers),
            LineKind::Output { .. } => None,
        }
    }

    pub(crate) fn handlers_mut(&mut self) -> Option<&mut HandlerChain> {
        match &mut self.kind {
            LineKind::Input { handlers, .. } => Some(handlers),
            LineKind::Output { .. } => None,
        }
    }

    pub(crate) fn output_lock(&self) -> Option<&Mutex<()>> {
        match &self.kind {
            LineKind::Output { lock } => Some(lock),
            LineKind::Input { .. } => None,
        }
    }

    pub(crate) fn dispatch(&self, event: &EdgeEvent) {
        if let Some(handlers) = self.handlers() {
            handlers.dispatch(event);
        }
    }
}

/// Requested lines addressed by id. Ids are handed out in request order and
/// never reused while the registry lives.
#[derive(Default)]
pub struct LineRegistry {
    lines: Vec<LineEntry>, // indexed by line id
}

impl LineRegistry {
    pub fn insert(
        &mut self,
        chip_id: ChipId,
        offset: u32,
        handle: LineHandle,
        kind: LineKind,
    ) -> LineId {
        let id = self.lines.len() as LineId;
        self.lines.push(LineEntry {
            id,
            chip_id,
            offset,
            handle,
            kind,
        });
        id
    }

    pub fn get(&self, id: LineId) -> Option<&LineEntry> {
        self.lines.get(id as usize)
    }

    pub fn get_mut(&mut self, id: LineId) -> Option<&mut LineEntry> {
        self.lines.get_mut(id as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LineEntry> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = LineEntry> + '_ {
        self.lines.drain(..)
    }
}
