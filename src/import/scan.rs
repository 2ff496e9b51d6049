use std::io::Read;
use std::mem::{offset_of, size_of};
use std::time::Duration;

use log::debug;
use nix::libc;

use crate::config::ImportFormat;
use crate::error::AppError;
use crate::gpio::{EdgeEvent, EdgeKind};
use crate::import::ImportTarget;

const LINE_EVENT_RISING_EDGE: libc::c_int = 1;
const LINE_EVENT_FALLING_EDGE: libc::c_int = 2;

/// Decodes one event from an accepted transport. The transport never names
/// a line, the event is addressed to `target`.
pub trait Scan: Send + Sync {
    fn scan(
        &self,
        transport: &mut dyn Read,
        target: ImportTarget,
    ) -> Result<EdgeEvent, AppError>;
}

pub fn scanner(format: ImportFormat) -> Box<dyn Scan> {
    match format {
        ImportFormat::Raw => Box::new(RawScan),
        ImportFormat::Simple => Box::new(SimpleScan),
    }
}

/// Host-layout edge event record as produced by the line-controller library.
/// Only meaningful between processes on the same host and architecture.
#[repr(C)]
pub struct RawEdgeRecord {
    pub ts: libc::timespec,
    pub event_type: libc::c_int,
}

pub const RAW_RECORD_SIZE: usize = size_of::<RawEdgeRecord>();

const SEC_OFFSET: usize = offset_of!(RawEdgeRecord, ts.tv_sec);
const NSEC_OFFSET: usize = offset_of!(RawEdgeRecord, ts.tv_nsec);
const TYPE_OFFSET: usize = offset_of!(RawEdgeRecord, event_type);

impl RawEdgeRecord {
    pub fn encode(edge: EdgeKind, timestamp: Duration) -> [u8; RAW_RECORD_SIZE] {
        let event_type = match edge {
            EdgeKind::Rising => LINE_EVENT_RISING_EDGE,
            EdgeKind::Falling => LINE_EVENT_FALLING_EDGE,
        };
        let sec = timestamp.as_secs() as libc::time_t;
        let nsec = timestamp.subsec_nanos() as libc::c_long;

        let mut buf = [0u8; RAW_RECORD_SIZE];
        put(&mut buf, SEC_OFFSET, &sec.to_ne_bytes());
        put(&mut buf, NSEC_OFFSET, &nsec.to_ne_bytes());
        put(&mut buf, TYPE_OFFSET, &event_type.to_ne_bytes());
        buf
    }

    /// Anything but a rising edge type decodes as falling.
    pub fn decode(buf: &[u8; RAW_RECORD_SIZE]) -> (EdgeKind, Duration) {
        let sec = libc::time_t::from_ne_bytes(field(buf, SEC_OFFSET));
        let nsec = libc::c_long::from_ne_bytes(field(buf, NSEC_OFFSET));
        let event_type = libc::c_int::from_ne_bytes(field(buf, TYPE_OFFSET));

        let edge = if event_type == LINE_EVENT_RISING_EDGE {
            EdgeKind::Rising
        } else {
            EdgeKind::Falling
        };
        let timestamp = Duration::new(sec.max(0) as u64, nsec.clamp(0, 999_999_999) as u32);
        (edge, timestamp)
    }
}

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn field<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

fn event_for(target: ImportTarget, edge: EdgeKind, timestamp: Duration) -> EdgeEvent {
    EdgeEvent {
        chip_id: target.chip_id,
        line_id: target.line_id,
        offset: target.offset,
        edge,
        timestamp_ms: timestamp.as_millis() as u64,
    }
}

pub struct RawScan;

impl Scan for RawScan {
    fn scan(
        &self,
        transport: &mut dyn Read,
        target: ImportTarget,
    ) -> Result<EdgeEvent, AppError> {
        let mut buf = [0u8; RAW_RECORD_SIZE];
        transport
            .read_exact(&mut buf)
            .map_err(|e| AppError::ScanRead(format!("raw record: {e}")))?;
        let (edge, timestamp) = RawEdgeRecord::decode(&buf);
        debug!("scan raw {}", edge.as_str());
        Ok(event_for(target, edge, timestamp))
    }
}

/// Two bytes: `'1'` for a rising edge, anything else for falling, then one
/// byte of padding.
pub struct SimpleScan;

impl Scan for SimpleScan {
    fn scan(
        &self,
        transport: &mut dyn Read,
        target: ImportTarget,
    ) -> Result<EdgeEvent, AppError> {
        let mut buf = [0u8; 2];
        transport
            .read_exact(&mut buf)
            .map_err(|e| AppError::ScanRead(format!("simple record: {e}")))?;
        debug!("scan {}", char::from(buf[0]));

        let edge = if buf[0] == b'1' {
            EdgeKind::Rising
        } else {
            EdgeKind::Falling
        };
        Ok(event_for(target, edge, Duration::ZERO))
    }
}
