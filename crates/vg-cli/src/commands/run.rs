use anyhow::Result;
use vg_core::Config;
use vg_daemon::Orchestrator;

/// Run the daemon until interrupted.
pub async fn run(config: Config) -> Result<()> {
    let orchestrator = Orchestrator::build(config).await?;
    orchestrator.run().await
}
