use log::{error, info};

use gpiomux::backend::default_backend;
use gpiomux::{AppConfig, AppError, Monitor};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), AppError> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GPIOMUX_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load_from_file(&config_path)?;
    info!("loaded {config_path}");

    let monitor = Monitor::start(&config, default_backend()?)?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {e}");
    }
    info!("Shutting down...");

    monitor.shutdown()
}
