use std::sync::Arc;

use log::debug;

use crate::error::AppError;
use crate::gpio::{EdgeEvent, GpioContext, LineId};

/// Drives output lines of a shared context.
#[derive(Clone)]
pub struct Actuator {
    ctx: Arc<GpioContext>,
}

impl Actuator {
    pub fn new(ctx: Arc<GpioContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<GpioContext> {
        &self.ctx
    }

    pub fn set_output(&self, line_id: LineId, level: bool) -> Result<(), AppError> {
        let line = self
            .ctx
            .line(line_id)
            .ok_or(AppError::LineNotFound(line_id))?;
        let lock = line.output_lock().ok_or(AppError::LineNotFound(line_id))?;

        let _guard = lock.lock();
        self.ctx.backend().set_value(line.handle(), level)?;
        debug!("output {line_id} set to {}", u8::from(level));
        Ok(())
    }

    /// Asserts the event's line on a rising edge, deasserts it otherwise.
    pub fn apply(&self, event: &EdgeEvent) -> Result<(), AppError> {
        self.set_output(event.line_id, event.edge.level())
    }
}
