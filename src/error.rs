use thiserror::Error;

use crate::gpio::{ChipId, LineId};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Chip label unavailable: {0}")]
    ChipLabel(String),
    #[error("Chip not found: {0}")]
    ChipNotFound(ChipId),
    #[error("Line {offset} already used by {consumer}")]
    LineBusy { offset: u32, consumer: String },
    #[error("Line request failed: {0}")]
    LineRequest(String),
    #[error("Line configuration error: {0}")]
    LineConfig(String),
    #[error("Line not found: {0}")]
    LineNotFound(LineId),
    #[error("Transport open failed: {0}")]
    TransportOpen(String),
    #[error("Scan read failed: {0}")]
    ScanRead(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}
