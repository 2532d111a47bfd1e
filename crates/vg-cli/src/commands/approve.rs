use anyhow::Result;
use vg_core::Config;
use vg_core::types::QueueStatus;

use crate::ApproveAction;

/// Approval-queue operations: list, approve, reject, discuss.
pub async fn run(config: Config, action: Option<ApproveAction>) -> Result<()> {
    let executor = super::standalone_executor(&config)?;

    match action.unwrap_or(ApproveAction::List) {
        ApproveAction::List => {
            let queued = executor.list_queue().await;
            let pending: Vec<_> = queued
                .iter()
                .filter(|q| q.status == QueueStatus::Pending)
                .collect();
            if pending.is_empty() {
                println!("No pending actions.");
                return Ok(());
            }
            println!("Pending actions ({}):", pending.len());
            for item in pending {
                println!(
                    "\n[{}] {} ({}, risk {}) queued {}",
                    item.queue_id,
                    item.action.subject,
                    item.action.kind,
                    item.action.risk,
                    item.queued_at.format("%Y-%m-%d %H:%M:%S"),
                );
                if !item.action.description.is_empty() {
                    println!("    {}", item.action.description);
                }
                for command in &item.action.commands {
                    println!("    $ {command}");
                }
                if !item.action.rationale.is_empty() {
                    println!("    rationale: {}", item.action.rationale);
                }
                for note in &item.notes {
                    println!("    note: {note}");
                }
            }
        }
        ApproveAction::Approve { id } => {
            let outcome = executor.approve(id).await?;
            if outcome.success {
                println!("[{id}] executed successfully.");
            } else {
                println!(
                    "[{id}] failed: {}",
                    outcome.error.as_deref().unwrap_or("see output"),
                );
            }
            if !outcome.output.is_empty() {
                println!("{}", outcome.output);
            }
        }
        ApproveAction::Reject { id } => {
            executor.reject(id).await?;
            println!("[{id}] rejected.");
        }
        ApproveAction::Discuss { id, note } => {
            let note = note.join(" ");
            executor.discuss(id, &note).await?;
            println!("[{id}] note recorded.");
        }
    }
    Ok(())
}
