use std::{fs, path::Path, path::PathBuf};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

const FIFO_SCHEME: &str = "fifo://";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InputConfig {
    pub chip: String,
    pub line: u32,
    #[serde(default)]
    pub exec: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    pub chip: String,
    pub line: u32,
    #[serde(default)]
    pub initial: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ImportFormat {
    Raw,
    Simple,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ImportConfig {
    pub url: String,
    pub format: ImportFormat,
    /// Name of the entry in `outputs` driven by this source.
    pub output: String,
}

impl ImportConfig {
    /// Filesystem path of the named pipe behind a `fifo://` url.
    pub fn fifo_path(&self) -> Result<PathBuf, AppError> {
        match self.url.strip_prefix(FIFO_SCHEME) {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Err(AppError::Config(format!(
                "unsupported import url {}, expected {FIFO_SCHEME}<path>",
                self.url
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    #[serde(default)]
    pub outputs: FxHashMap<String, OutputConfig>,
    #[serde(default)]
    pub imports: Vec<ImportConfig>,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_event_history_capacity() -> usize {
    32
}

fn default_settle_delay_ms() -> u64 {
    200
}

fn default_shutdown_timeout_ms() -> u64 {
    2000
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        for import in &self.imports {
            import.fifo_path()?;
            if !self.outputs.contains_key(&import.output) {
                return Err(AppError::Config(format!(
                    "import {} refers to unknown output {}",
                    import.url, import.output
                )));
            }
        }
        Ok(())
    }
}
