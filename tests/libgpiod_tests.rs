//! Runs against a real chip (for example one created with gpio-sim) named by
//! `GPIOMUX_TEST_CHIP`; without it every test returns early.
#![cfg(feature = "hardware-gpio")]

use gpiomux::{GpioBackend, LibgpiodBackend};

fn test_chip() -> Option<String> {
    std::env::var("GPIOMUX_TEST_CHIP").ok()
}

#[test]
fn chip_stays_open_until_closed() {
    let Some(path) = test_chip() else {
        return;
    };
    let backend = LibgpiodBackend::new().unwrap();

    let chip = backend.open_chip(&path).unwrap();
    let label = backend.chip_label(chip).unwrap();
    assert_eq!(backend.chip_label(chip).unwrap(), label);

    backend.close_chip(chip);
    assert!(backend.chip_label(chip).is_err());
}

#[test]
fn output_request_goes_through_the_open_chip() {
    let Some(path) = test_chip() else {
        return;
    };
    let backend = LibgpiodBackend::new().unwrap();
    let chip = backend.open_chip(&path).unwrap();

    assert_eq!(backend.line_consumer(chip, 0).unwrap(), None);
    let line = backend.request_output(chip, 0, true).unwrap();
    assert_eq!(
        backend.line_consumer(chip, 0).unwrap().as_deref(),
        Some(env!("CARGO_PKG_NAME"))
    );
    backend.set_value(line, false).unwrap();

    backend.release_line(line);
    backend.close_chip(chip);
}
