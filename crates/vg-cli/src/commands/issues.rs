use std::sync::Arc;

use anyhow::{bail, Context, Result};
use uuid::Uuid;
use vg_core::types::{Issue, Severity};
use vg_core::Config;
use vg_daemon::issues::IssueTracker;
use vg_stores::{SemanticStore, SqliteSemanticStore};

use crate::IssueAction;

/// Issue operations: list, show, create, resolve, close.
pub async fn run(config: Config, action: Option<IssueAction>) -> Result<()> {
    let store: Arc<dyn SemanticStore> = Arc::new(
        SqliteSemanticStore::new(config.state_dir().join("semantic.db"))
            .await
            .context("opening semantic store")?,
    );
    let host = config.hostname();
    let tracker = IssueTracker::new(Arc::clone(&store), host.clone());

    match action.unwrap_or(IssueAction::List) {
        IssueAction::List => {
            let issues = store.list_issues(Some(&host), None).await?;
            if issues.is_empty() {
                println!("No issues tracked.");
                return Ok(());
            }
            for issue in issues {
                println!(
                    "{}  [{}] [{}] {}: {}",
                    issue.id,
                    issue.status,
                    issue.severity,
                    issue.subject,
                    issue.title,
                );
            }
        }
        IssueAction::Show { id } => {
            let id = parse_id(&id)?;
            let Some(issue) = store.get_issue(id).await? else {
                bail!("no issue with id {id}");
            };
            print_issue(&issue);
        }
        IssueAction::Create { title, severity } => {
            let severity = parse_severity(&severity)?;
            let mut issue = Issue::new(host, "operator", title, severity);
            issue.description = "opened manually".into();
            store.upsert_issue(&issue).await?;
            println!("Issue {} opened.", issue.id);
        }
        IssueAction::Resolve { id, resolution } => {
            let id = parse_id(&id)?;
            let resolution = if resolution.is_empty() {
                "resolved by operator".to_string()
            } else {
                resolution.join(" ")
            };
            if tracker.resolve(id, &resolution).await? {
                println!("Issue {id} resolved.");
            } else {
                bail!("no issue with id {id}");
            }
        }
        IssueAction::Close { id } => {
            let id = parse_id(&id)?;
            if tracker.close(id).await? {
                println!("Issue {id} closed.");
            } else {
                bail!("issue {id} is missing or not resolved yet");
            }
        }
    }
    Ok(())
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("invalid issue id: {raw}"))
}

fn parse_severity(raw: &str) -> Result<Severity> {
    match raw {
        "info" => Ok(Severity::Info),
        "warning" => Ok(Severity::Warning),
        "critical" => Ok(Severity::Critical),
        other => bail!("unknown severity: {other} (expected info, warning, or critical)"),
    }
}

fn print_issue(issue: &Issue) {
    println!("Issue {}", issue.id);
    println!("  host:     {}", issue.host);
    println!("  subject:  {}", issue.subject);
    println!("  title:    {}", issue.title);
    println!("  severity: {}", issue.severity);
    println!("  status:   {}", issue.status);
    println!("  opened:   {}", issue.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  updated:  {}", issue.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if !issue.description.is_empty() {
        println!("  {}", issue.description);
    }
    if !issue.investigations.is_empty() {
        println!("  timeline:");
        for note in &issue.investigations {
            println!("    {} {}", note.timestamp.format("%m-%d %H:%M"), note.text);
        }
    }
    if !issue.actions.is_empty() {
        println!("  actions:");
        for note in &issue.actions {
            println!("    {} {}", note.timestamp.format("%m-%d %H:%M"), note.text);
        }
    }
    if let Some(resolution) = &issue.resolution {
        println!("  resolution: {resolution}");
    }
}
