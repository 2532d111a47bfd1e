use anyhow::{bail, Result};
use vg_core::Config;
use vg_daemon::notifier::{HttpNotifier, NotifySink, Priority};

/// Send a one-off notification through the configured sink.
pub async fn run(config: Config, title: &str, body: &str, priority: Option<&str>) -> Result<()> {
    let priority = match priority.unwrap_or("medium") {
        "low" => Priority::Low,
        "medium" => Priority::Medium,
        "high" => Priority::High,
        other => bail!("unknown priority: {other} (expected low, medium, or high)"),
    };

    let notifier = HttpNotifier::new(&config.notify);
    if notifier.notify(title, body, priority).await {
        println!("Notification sent.");
    } else {
        println!("Notification not delivered (sink disabled or unreachable).");
    }
    Ok(())
}
