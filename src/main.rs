use plotline::{Config, Server};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;
use tracing_subscriber::EnvFilter;

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
        workers = config.workers,
        event_capacity = config.event_capacity,
        plots = config.plots.len(),
        "Starting plotline server"
    );

    // Before any thread exists, so every thread sees the handlers
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    let server = Server::new(config.workers, config.event_capacity)?;
    for plot in &config.plots {
        let addr = server.add_plot(plot.constructor(), plot.port)?;
        info!(port = addr.port(), stages = plot.stages.len(), "Serving plot");
    }

    if let Some(signal) = signals.forever().next() {
        info!(signal, "Shutdown requested");
    }

    server.shutdown();
    Ok(())
}
