mod common;

use std::sync::Arc;

use gpiomux::{AppError, EdgeEvent, GpioBackend, GpioContext};

use common::{CHIP0, CHIP1, mock_backend};

#[test]
fn same_label_yields_same_chip_id() {
    let backend = mock_backend();
    backend.add_chip("/dev/gpiochip-alias", Some("pinctrl-bcm2711"));
    let mut ctx = GpioContext::new(backend.clone());

    let first = ctx.open_chip(CHIP0).unwrap();
    let second = ctx.open_chip("/dev/gpiochip-alias").unwrap();

    assert_eq!(first, second);
    assert_eq!(ctx.chip_count(), 1);
    assert_eq!(ctx.chip_label(first), Some("pinctrl-bcm2711"));
    // the duplicate handle is closed right away, the registered one is kept
    assert_eq!(backend.chip_closes().len(), 1);
}

#[test]
fn chip_ids_count_up_from_zero() {
    let backend = mock_backend();
    let mut ctx = GpioContext::new(backend);

    assert_eq!(ctx.open_chip(CHIP0).unwrap(), 0);
    assert_eq!(ctx.open_chip(CHIP1).unwrap(), 1);
    assert_eq!(ctx.open_chip(CHIP0).unwrap(), 0);
    assert_eq!(ctx.chip_count(), 2);
}

#[test]
fn unlabeled_chip_is_rejected_and_closed() {
    let backend = mock_backend();
    backend.add_chip("/dev/gpiochip9", None);
    let mut ctx = GpioContext::new(backend.clone());

    let err = ctx.open_chip("/dev/gpiochip9").unwrap_err();
    assert!(matches!(err, AppError::ChipLabel(_)));
    assert_eq!(ctx.chip_count(), 0);
    assert_eq!(backend.chip_closes().values().sum::<usize>(), 1);
}

#[test]
fn add_chip_takes_existing_handle() {
    let backend = mock_backend();
    let handle = backend.open_chip(CHIP1).unwrap();
    let mut ctx = GpioContext::new(backend.clone());

    let id = ctx.add_chip(handle).unwrap();
    assert_eq!(ctx.chip_label(id), Some("raspberrypi-exp-gpio"));
}

#[test]
fn request_on_unknown_chip_fails() {
    let mut ctx = GpioContext::new(mock_backend());

    let err = ctx.request_line(3, 4).unwrap_err();
    assert!(matches!(err, AppError::ChipNotFound(3)));
}

#[test]
fn busy_line_is_rejected() {
    let backend = mock_backend();
    backend.set_consumer(CHIP0, 17, "sysfs");
    let mut ctx = GpioContext::new(backend.clone());
    let chip = ctx.open_chip(CHIP0).unwrap();

    let err = ctx.request_line(chip, 17).unwrap_err();
    match err {
        AppError::LineBusy { offset, consumer } => {
            assert_eq!(offset, 17);
            assert_eq!(consumer, "sysfs");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(ctx.line_count(), 0);
    assert_eq!(backend.requested_lines(), 0);
}

#[test]
fn line_held_by_this_process_is_not_shared() {
    let backend = mock_backend();
    let mut ctx = GpioContext::new(backend);
    let chip = ctx.open_chip(CHIP0).unwrap();

    ctx.request_line(chip, 5).unwrap();
    let err = ctx.request_output(chip, 5, false).unwrap_err();
    assert!(matches!(err, AppError::LineBusy { offset: 5, .. }));
    assert_eq!(ctx.line_count(), 1);
}

#[test]
fn native_request_failure_is_line_request_error() {
    let backend = mock_backend();
    backend.fail_requests(CHIP0, 6);
    let mut ctx = GpioContext::new(backend);
    let chip = ctx.open_chip(CHIP0).unwrap();

    let err = ctx.request_line(chip, 6).unwrap_err();
    assert!(matches!(err, AppError::LineRequest(_)));
    assert_eq!(ctx.line_count(), 0);
}

#[test]
fn missing_wait_descriptor_releases_line() {
    let backend = mock_backend();
    backend.fail_event_fd(CHIP0, 7);
    let mut ctx = GpioContext::new(backend.clone());
    let chip = ctx.open_chip(CHIP0).unwrap();

    let err = ctx.request_line(chip, 7).unwrap_err();
    assert!(matches!(err, AppError::LineConfig(_)));
    assert_eq!(ctx.line_count(), 0);
    assert_eq!(backend.line_releases().values().sum::<usize>(), 1);

    // released, so a second attempt is not reported busy
    let err = ctx.request_line(chip, 7).unwrap_err();
    assert!(matches!(err, AppError::LineConfig(_)));
}

#[test]
fn line_ids_are_dense_and_skip_failures() {
    let backend = mock_backend();
    backend.set_consumer(CHIP1, 2, "kernel");
    let mut ctx = GpioContext::new(backend);
    let chip0 = ctx.open_chip(CHIP0).unwrap();
    let chip1 = ctx.open_chip(CHIP1).unwrap();

    assert_eq!(ctx.request_line(chip0, 3).unwrap(), 0);
    assert!(ctx.request_line(chip1, 2).is_err());
    assert_eq!(ctx.request_output(chip1, 4, true).unwrap(), 1);
    assert_eq!(ctx.request_line(chip0, 9).unwrap(), 2);

    let output = ctx.line(1).unwrap();
    assert!(output.is_output());
    assert_eq!((output.chip_id(), output.offset()), (chip1, 4));
}

#[test]
fn handlers_attach_only_to_input_lines() {
    let backend = mock_backend();
    let mut ctx = GpioContext::new(backend);
    let chip = ctx.open_chip(CHIP0).unwrap();
    let input = ctx.request_line(chip, 3).unwrap();
    let output = ctx.request_output(chip, 4, false).unwrap();

    ctx.add_handler(input, |_: &EdgeEvent| {}).unwrap();
    ctx.add_handler(input, |_: &EdgeEvent| {}).unwrap();
    assert_eq!(ctx.line(input).unwrap().handlers().unwrap().len(), 2);

    let err = ctx.add_handler(output, |_: &EdgeEvent| {}).unwrap_err();
    assert!(matches!(err, AppError::LineNotFound(id) if id == output));
    let err = ctx.add_handler(42, |_: &EdgeEvent| {}).unwrap_err();
    assert!(matches!(err, AppError::LineNotFound(42)));
}

#[test]
fn teardown_releases_lines_and_closes_chips_once() {
    let backend = mock_backend();
    {
        let mut ctx = GpioContext::new(backend.clone());
        let chip0 = ctx.open_chip(CHIP0).unwrap();
        let chip1 = ctx.open_chip(CHIP1).unwrap();
        ctx.request_line(chip0, 3).unwrap();
        ctx.request_line(chip0, 4).unwrap();
        ctx.request_line(chip1, 1).unwrap();
        ctx.request_output(chip1, 2, false).unwrap();
        ctx.add_handler(0, |_: &EdgeEvent| {}).unwrap();

        let shared = Arc::new(ctx);
        let _other = shared.clone();
    }

    let releases = backend.line_releases();
    assert_eq!(releases.len(), backend.requested_lines());
    assert_eq!(releases.len(), 4);
    assert!(releases.values().all(|&n| n == 1));

    let closes = backend.chip_closes();
    assert_eq!(closes.len(), backend.opened_chips());
    assert_eq!(closes.len(), 2);
    assert!(closes.values().all(|&n| n == 1));
}

#[test]
fn handler_state_is_dropped_with_its_line() {
    let backend = mock_backend();
    let token = Arc::new(());
    {
        let mut ctx = GpioContext::new(backend);
        let chip = ctx.open_chip(CHIP0).unwrap();
        let line = ctx.request_line(chip, 3).unwrap();
        let held = token.clone();
        ctx.add_handler(line, move |_: &EdgeEvent| {
            let _ = &held;
        })
        .unwrap();
        assert_eq!(Arc::strong_count(&token), 2);
    }
    assert_eq!(Arc::strong_count(&token), 1);
}
