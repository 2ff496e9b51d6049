use std::collections::VecDeque;
use std::process::{Child, Command};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::gpio::{EdgeEvent, LineId};

/// Callback bound to one monitored line, invoked on the dispatch thread.
pub trait EdgeHandler: Send + Sync {
    fn handle(&self, event: &EdgeEvent);
}

impl<F> EdgeHandler for F
where
    F: Fn(&EdgeEvent) + Send + Sync,
{
    fn handle(&self, event: &EdgeEvent) {
        self(event)
    }
}

/// Handlers of one line, most recently registered first.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<Box<dyn EdgeHandler>>, // registration order, walked backwards
}

impl HandlerChain {
    pub fn prepend(&mut self, handler: Box<dyn EdgeHandler>) {
        self.handlers.push(handler);
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn EdgeHandler> {
        self.handlers.iter().rev().map(|h| &**h)
    }

    pub fn dispatch(&self, event: &EdgeEvent) {
        for handler in self.iter() {
            handler.handle(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub struct LogHandler;

impl EdgeHandler for LogHandler {
    fn handle(&self, event: &EdgeEvent) {
        info!(
            "chip {} line {} (id {}): {} edge at {} ms",
            event.chip_id,
            event.offset,
            event.line_id,
            event.edge.as_str(),
            event.timestamp_ms
        );
    }
}

/// Bounded in-memory history of the last edges seen on each line.
pub struct HistoryHandler {
    history: RwLock<FxHashMap<LineId, VecDeque<EdgeEvent>>>,
    capacity: usize,
}

impl HistoryHandler {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: RwLock::new(FxHashMap::default()),
            capacity,
        }
    }

    pub fn record(&self, event: &EdgeEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.write();
        let events = history.entry(event.line_id).or_default();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }

    /// Oldest first; `limit` keeps only the most recent entries.
    pub fn events(&self, line_id: LineId, limit: Option<usize>) -> Vec<EdgeEvent> {
        let history = self.history.read();
        let Some(events) = history.get(&line_id) else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |lim| events.len().saturating_sub(lim));
        events.iter().skip(skip).cloned().collect()
    }

    pub fn last_event(&self, line_id: LineId) -> Option<EdgeEvent> {
        self.history
            .read()
            .get(&line_id)
            .and_then(|events| events.back().cloned())
    }
}

impl EdgeHandler for HistoryHandler {
    fn handle(&self, event: &EdgeEvent) {
        self.record(event);
    }
}

/// Runs a command per edge as `<command> <chip id> <offset> <rising|falling>`.
pub struct ExecHandler {
    command: String,
    children: Mutex<Vec<Child>>,
}

impl ExecHandler {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            children: Mutex::new(Vec::new()),
        }
    }

    /// Collects finished children, returns how many are still running.
    pub fn reap_finished(&self) -> usize {
        let mut children = self.children.lock();
        Self::reap(&mut children);
        children.len()
    }

    fn reap(children: &mut Vec<Child>) {
        children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    warn!("exec: child {} exited with {status}", child.id());
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("exec: wait child {}: {e}", child.id());
                false
            }
        });
    }
}

impl Drop for ExecHandler {
    fn drop(&mut self) {
        let children = self.children.get_mut();
        Self::reap(children);
        if !children.is_empty() {
            debug!("exec: {} left {} children running", self.command, children.len());
        }
    }
}

impl EdgeHandler for ExecHandler {
    fn handle(&self, event: &EdgeEvent) {
        let mut children = self.children.lock();
        Self::reap(&mut children);

        let spawned = Command::new(&self.command)
            .arg(event.chip_id.to_string())
            .arg(event.offset.to_string())
            .arg(event.edge.as_str())
            .spawn();
        match spawned {
            Ok(child) => children.push(child),
            Err(e) => error!("exec: {}: {e}", self.command),
        }
    }
}
