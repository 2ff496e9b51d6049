use std::sync::Arc;

use crate::error::AppError;
use crate::gpio::GpioBackend;

#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::LibgpiodBackend;
pub use mock::MockGpioBackend;

/// Backend selected at build time: libgpiod with `hardware-gpio`, the
/// in-process mock otherwise.
pub fn default_backend() -> Result<Arc<dyn GpioBackend>, AppError> {
    #[cfg(feature = "hardware-gpio")]
    {
        Ok(Arc::new(LibgpiodBackend::new()?))
    }
    #[cfg(not(feature = "hardware-gpio"))]
    {
        log::warn!("built without hardware-gpio, using the mock backend");
        Ok(Arc::new(MockGpioBackend::default()))
    }
}
