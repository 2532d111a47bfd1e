use anyhow::Result;
use vg_core::Config;
use vg_daemon::Orchestrator;

/// One probe-and-analyze cycle.
pub async fn run(config: Config) -> Result<()> {
    let orchestrator = Orchestrator::build(config).await?;
    let report = orchestrator.run_once().await?;

    if report.admitted.is_empty() {
        println!("No new trigger events.");
    } else {
        println!("Trigger events ({}):", report.admitted.len());
        for event in &report.admitted {
            println!("  [{}] {} {}: {}", event.severity, event.kind, event.subject, event.reason);
        }
    }

    println!("\nAnalysis:\n{}", report.analysis);
    if report.actions_proposed > 0 {
        println!(
            "\n{} action(s) proposed; see `vg approve list` for anything queued.",
            report.actions_proposed
        );
    }
    Ok(())
}
