mod config;
mod main_lib;

use config::Config;
use main_lib::{build_coordinator, init_tracing, run_simulation};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing();
    let (coordinator, collaborators) = build_coordinator(&config)?;
    coordinator.on_application_foreground();

    tokio::select! {
        result = run_simulation(&config, &coordinator, &collaborators) => result?,
        _ = tokio::time::sleep(config.run_for) => {
            tracing::warn!("Simulation did not finish within {:?}", config.run_for);
        }
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
    }

    coordinator.on_application_shutdown();
    tracing::info!(stats = ?coordinator.stats(), "Shut down");
    Ok(())
}
