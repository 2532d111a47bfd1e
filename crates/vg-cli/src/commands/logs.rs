use anyhow::{bail, Result};
use vg_core::Config;
use vg_daemon::logs::tail;
use vg_daemon::queue::journal_path;

/// Print the tail of a structured log stream.
pub async fn run(config: Config, stream: &str, lines: usize) -> Result<()> {
    let state_dir = config.state_dir();
    let path = match stream {
        "actions" => state_dir.join("actions.jsonl"),
        "decisions" => state_dir.join("decisions.jsonl"),
        "queue" => journal_path(&state_dir),
        other => bail!("unknown log stream: {other} (expected actions, decisions, or queue)"),
    };

    let records = tail(&path, lines)?;
    if records.is_empty() {
        println!("No records in {stream}.");
        return Ok(());
    }
    for record in records {
        println!("{record}");
    }
    Ok(())
}
