use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use txframe::config::Config;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        read_timeout_secs = config.read_timeout_secs,
        shutdown_log = %config.shutdown_log.display(),
        "Starting txframe server"
    );

    if let Err(err) = txframe::app::run(&config) {
        error!(code = err.code(), error = %err, "Server stopped with an error");
        return Err(err.into());
    }
    Ok(())
}
