pub mod actuator;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gpio;
pub mod handler;
pub mod import;
pub mod monitor;
pub mod registry;
pub mod stop;

pub use actuator::Actuator;
pub use config::{AppConfig, ImportConfig, ImportFormat, InputConfig, OutputConfig};
pub use dispatch::{Cycle, Dispatcher, DispatcherHandle};
pub use error::AppError;
pub use gpio::{
    ChipHandle, ChipId, EdgeEvent, EdgeKind, GpioBackend, GpioContext, LineHandle, LineId,
    NativeEdge,
};
pub use handler::{EdgeHandler, ExecHandler, HandlerChain, HistoryHandler, LogHandler};
pub use import::{ImportSource, ImportState, ImportTarget, RawEdgeRecord, Scan};
pub use monitor::Monitor;
pub use stop::{StopSignal, Wake, join_with_timeout};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
