mod common;

use std::fs;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gpiomux::import::{RawScan, SimpleScan};
use gpiomux::{
    Actuator, AppError, EdgeKind, GpioContext, ImportSource, ImportState, LineId, MockGpioBackend,
    RawEdgeRecord,
};

use common::{CHIP0, mock_backend, send, wait_until};

const SETTLE: Duration = Duration::from_millis(10);
const WAIT: Duration = Duration::from_secs(2);
const LED: u32 = 2;

fn output_context(backend: &Arc<MockGpioBackend>) -> (Actuator, LineId, LineId) {
    let mut ctx = GpioContext::new(backend.clone());
    let chip = ctx.open_chip(CHIP0).unwrap();
    let input = ctx.request_line(chip, 3).unwrap();
    let output = ctx.request_output(chip, LED, false).unwrap();
    (Actuator::new(Arc::new(ctx)), output, input)
}

fn led_is(backend: &MockGpioBackend, level: bool) -> bool {
    wait_until(WAIT, || backend.value(CHIP0, LED) == Some(level))
}

#[test]
fn simple_records_drive_the_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("led");
    let backend = mock_backend();
    let (actuator, output, _) = output_context(&backend);

    let mut source =
        ImportSource::create(&path, Box::new(SimpleScan), output, actuator, SETTLE).unwrap();
    assert_eq!(source.target().offset, LED);

    send(&path, b"1\n");
    assert!(led_is(&backend, true));
    send(&path, b"0\n");
    assert!(led_is(&backend, false));
    send(&path, b"1 ");
    assert!(led_is(&backend, true));
    send(&path, b"x\n");
    assert!(led_is(&backend, false));

    source.stop(WAIT).unwrap();
}

#[test]
fn raw_records_drive_the_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("led.raw");
    let backend = mock_backend();
    let (actuator, output, _) = output_context(&backend);

    let mut source =
        ImportSource::create(&path, Box::new(RawScan), output, actuator, SETTLE).unwrap();

    send(
        &path,
        &RawEdgeRecord::encode(EdgeKind::Rising, Duration::from_secs(1_700_000_000)),
    );
    assert!(led_is(&backend, true));
    send(
        &path,
        &RawEdgeRecord::encode(EdgeKind::Falling, Duration::from_secs(1_700_000_001)),
    );
    assert!(led_is(&backend, false));

    source.stop(WAIT).unwrap();
}

#[test]
fn short_record_is_dropped_and_source_keeps_listening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("led");
    let backend = mock_backend();
    let (actuator, output, _) = output_context(&backend);

    let mut source =
        ImportSource::create(&path, Box::new(SimpleScan), output, actuator, SETTLE).unwrap();

    send(&path, b"1");
    send(&path, b"1\n");
    assert!(led_is(&backend, true));

    source.stop(WAIT).unwrap();
}

#[test]
fn idle_source_stops_promptly_and_removes_pipe() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idle");
    let backend = mock_backend();
    let (actuator, output, _) = output_context(&backend);

    let mut source =
        ImportSource::create(&path, Box::new(SimpleScan), output, actuator, SETTLE).unwrap();
    assert!(wait_until(WAIT, || source.state() == ImportState::Listening));

    let started = Instant::now();
    source.stop(Duration::from_secs(1)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(source.state(), ImportState::Stopped);
    assert!(!path.exists());
}

#[test]
fn pipe_replaces_existing_file_with_open_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale");
    fs::write(&path, b"left over").unwrap();
    let backend = mock_backend();
    let (actuator, output, _) = output_context(&backend);

    let source =
        ImportSource::create(&path, Box::new(SimpleScan), output, actuator, SETTLE).unwrap();

    let meta = fs::metadata(source.path()).unwrap();
    assert!(meta.file_type().is_fifo());
    assert_eq!(meta.permissions().mode() & 0o777, 0o666);
}

#[test]
fn source_must_target_an_output_line() {
    let dir = tempfile::tempdir().unwrap();
    let backend = mock_backend();
    let (actuator, _, input) = output_context(&backend);

    let err = ImportSource::create(
        dir.path().join("in"),
        Box::new(SimpleScan),
        input,
        actuator.clone(),
        SETTLE,
    )
    .err()
    .unwrap();
    assert!(matches!(err, AppError::LineNotFound(id) if id == input));

    let err = ImportSource::create(
        dir.path().join("none"),
        Box::new(SimpleScan),
        99,
        actuator,
        SETTLE,
    )
    .err()
    .unwrap();
    assert!(matches!(err, AppError::LineNotFound(99)));
}

#[test]
fn actuator_rejects_lines_not_configured_as_output() {
    let backend = mock_backend();
    let (actuator, output, input) = output_context(&backend);

    assert!(matches!(
        actuator.set_output(input, true),
        Err(AppError::LineNotFound(id)) if id == input
    ));
    assert!(matches!(
        actuator.set_output(7, true),
        Err(AppError::LineNotFound(7))
    ));

    actuator.set_output(output, true).unwrap();
    assert_eq!(backend.value(CHIP0, LED), Some(true));
}

#[test]
fn two_sources_share_one_output() {
    let dir = tempfile::tempdir().unwrap();
    let on = dir.path().join("on");
    let off = dir.path().join("off");
    let backend = mock_backend();
    let (actuator, output, _) = output_context(&backend);

    let mut raw =
        ImportSource::create(&on, Box::new(RawScan), output, actuator.clone(), SETTLE).unwrap();
    let mut simple =
        ImportSource::create(&off, Box::new(SimpleScan), output, actuator, SETTLE).unwrap();

    send(&on, &RawEdgeRecord::encode(EdgeKind::Rising, Duration::ZERO));
    assert!(led_is(&backend, true));
    send(&off, b"0\n");
    assert!(led_is(&backend, false));

    raw.stop(WAIT).unwrap();
    simple.stop(WAIT).unwrap();
}
