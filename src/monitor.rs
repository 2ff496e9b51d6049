use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use rustc_hash::FxHashMap;

use crate::actuator::Actuator;
use crate::config::{AppConfig, ImportConfig, InputConfig, OutputConfig};
use crate::dispatch::{Dispatcher, DispatcherHandle};
use crate::error::AppError;
use crate::gpio::{ChipId, EdgeEvent, GpioBackend, GpioContext, LineId};
use crate::handler::{ExecHandler, HistoryHandler, LogHandler};
use crate::import::{ImportSource, scanner};

/// A running configuration: the shared context, its dispatcher thread and
/// one worker per import source.
pub struct Monitor {
    ctx: Arc<GpioContext>,
    history: Arc<HistoryHandler>,
    inputs: Vec<LineId>,
    outputs: FxHashMap<String, LineId>,
    imports: Vec<ImportSource>,
    dispatcher: DispatcherHandle,
    shutdown_timeout: Duration,
}

impl Monitor {
    /// Sets up every configured line and import source and starts
    /// dispatching. Entries that fail are logged and left out.
    pub fn start(config: &AppConfig, backend: Arc<dyn GpioBackend>) -> Result<Self, AppError> {
        let mut ctx = GpioContext::new(backend);
        let mut chips: FxHashMap<String, ChipId> = FxHashMap::default();
        let history = Arc::new(HistoryHandler::new(config.event_history_capacity));

        let mut inputs = Vec::new();
        for input in &config.inputs {
            match Self::setup_input(&mut ctx, &mut chips, input, &history) {
                Ok(id) => inputs.push(id),
                Err(e) => error!("setup: input {} line {}: {e}", input.chip, input.line),
            }
        }

        let mut names: Vec<&String> = config.outputs.keys().collect();
        names.sort();
        let mut outputs = FxHashMap::default();
        for name in names {
            let output = &config.outputs[name];
            match Self::setup_output(&mut ctx, &mut chips, output) {
                Ok(id) => {
                    outputs.insert(name.clone(), id);
                }
                Err(e) => error!("setup: output {name}: {e}"),
            }
        }

        let ctx = Arc::new(ctx);
        let actuator = Actuator::new(ctx.clone());
        let settle_delay = Duration::from_millis(config.settle_delay_ms);

        let mut imports = Vec::new();
        for import in &config.imports {
            match Self::setup_import(import, &outputs, &actuator, settle_delay) {
                Ok(source) => imports.push(source),
                Err(e) => error!("setup: import {}: {e}", import.url),
            }
        }

        let dispatcher = Dispatcher::new(ctx.clone())?.spawn()?;
        info!(
            "monitoring {} lines on {} chips, {} outputs, {} import sources",
            inputs.len(),
            ctx.chip_count(),
            outputs.len(),
            imports.len()
        );

        Ok(Self {
            ctx,
            history,
            inputs,
            outputs,
            imports,
            dispatcher,
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        })
    }

    fn chip(
        ctx: &mut GpioContext,
        chips: &mut FxHashMap<String, ChipId>,
        path: &str,
    ) -> Result<ChipId, AppError> {
        if let Some(id) = chips.get(path) {
            return Ok(*id);
        }
        let id = ctx.open_chip(path)?;
        chips.insert(path.to_string(), id);
        Ok(id)
    }

    fn setup_input(
        ctx: &mut GpioContext,
        chips: &mut FxHashMap<String, ChipId>,
        input: &InputConfig,
        history: &Arc<HistoryHandler>,
    ) -> Result<LineId, AppError> {
        let chip_id = Self::chip(ctx, chips, &input.chip)?;
        let line_id = ctx.request_line(chip_id, input.line)?;

        let history = history.clone();
        ctx.add_handler(line_id, move |event: &EdgeEvent| history.record(event))?;
        ctx.add_handler(line_id, LogHandler)?;
        if let Some(command) = &input.exec {
            ctx.add_handler(line_id, ExecHandler::new(command.clone()))?;
        }
        Ok(line_id)
    }

    fn setup_output(
        ctx: &mut GpioContext,
        chips: &mut FxHashMap<String, ChipId>,
        output: &OutputConfig,
    ) -> Result<LineId, AppError> {
        let chip_id = Self::chip(ctx, chips, &output.chip)?;
        ctx.request_output(chip_id, output.line, output.initial)
    }

    fn setup_import(
        import: &ImportConfig,
        outputs: &FxHashMap<String, LineId>,
        actuator: &Actuator,
        settle_delay: Duration,
    ) -> Result<ImportSource, AppError> {
        let path = import.fifo_path()?;
        let line_id = *outputs.get(&import.output).ok_or_else(|| {
            AppError::Config(format!("output {} is not available", import.output))
        })?;
        ImportSource::create(
            path,
            scanner(import.format),
            line_id,
            actuator.clone(),
            settle_delay,
        )
    }

    pub fn context(&self) -> &Arc<GpioContext> {
        &self.ctx
    }

    pub fn history(&self) -> &HistoryHandler {
        &self.history
    }

    pub fn input_lines(&self) -> &[LineId] {
        &self.inputs
    }

    pub fn output_line(&self, name: &str) -> Option<LineId> {
        self.outputs.get(name).copied()
    }

    pub fn import_sources(&self) -> &[ImportSource] {
        &self.imports
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatcher.is_running()
    }

    /// Stops the import sources, then the dispatcher, then releases the
    /// context. Every worker is asked to stop even if an earlier one fails
    /// to exit in time; the first such failure is returned.
    pub fn shutdown(mut self) -> Result<(), AppError> {
        let mut result = Ok(());
        for source in &mut self.imports {
            if let Err(e) = source.stop(self.shutdown_timeout) {
                error!("shutdown: {e}");
                result = result.and(Err(e));
            }
        }
        if let Err(e) = self.dispatcher.stop(self.shutdown_timeout) {
            error!("shutdown: {e}");
            result = result.and(Err(e));
        }
        result
    }
}
