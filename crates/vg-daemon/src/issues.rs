//! The issue tracker: correlates trigger events and action outcomes into
//! long-lived issue records persisted through the semantic store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use vg_core::types::{ActionOutcome, Issue, IssueNote, IssueStatus, TriggerEvent};
use vg_stores::{Result, SemanticStore};

pub struct IssueTracker {
    store: Arc<dyn SemanticStore>,
    host: String,
    /// A resolved issue blocks re-opening for the same subject this long.
    reopen_cooldown: Duration,
}

impl IssueTracker {
    pub fn new(store: Arc<dyn SemanticStore>, host: impl Into<String>) -> Self {
        Self {
            store,
            host: host.into(),
            reopen_cooldown: Duration::hours(24),
        }
    }

    #[cfg(test)]
    fn with_reopen_cooldown(mut self, cooldown: Duration) -> Self {
        self.reopen_cooldown = cooldown;
        self
    }

    /// Correlate an admitted trigger event: append to the timeline of an
    /// open issue for `(host, subject)`, or create one. Returns the issue
    /// id, or `None` when creation was suppressed by the reopen cooldown.
    pub async fn record_event(&self, event: &TriggerEvent) -> Result<Option<Uuid>> {
        if let Some(mut issue) = self.open_issue_for(&event.subject).await? {
            issue.severity = issue.severity.max(event.severity);
            issue
                .investigations
                .push(IssueNote::now(format!("[{}] {}", event.fingerprint, event.reason)));
            issue.updated_at = Utc::now();
            let id = issue.id;
            self.store.upsert_issue(&issue).await?;
            debug!(issue = %id, subject = %event.subject, "event appended to issue");
            return Ok(Some(id));
        }

        if self.in_reopen_cooldown(&event.subject).await? {
            debug!(subject = %event.subject, "issue creation suppressed by reopen cooldown");
            return Ok(None);
        }

        let mut issue = Issue::new(
            self.host.clone(),
            event.subject.clone(),
            event.reason.clone(),
            event.severity,
        );
        issue.description = format!("first seen via {} ({})", event.kind, event.fingerprint);
        let id = issue.id;
        self.store.upsert_issue(&issue).await?;
        info!(issue = %id, subject = %event.subject, severity = %event.severity, "issue opened");
        Ok(Some(id))
    }

    /// Attach an action outcome to the most recent issue for its subject.
    pub async fn record_outcome(&self, outcome: &ActionOutcome) -> Result<()> {
        let Some(mut issue) = self.latest_issue_for(&outcome.subject).await? else {
            return Ok(());
        };
        issue.actions.push(IssueNote::now(format!(
            "{} {}: {}",
            outcome.kind,
            if outcome.success { "succeeded" } else { "failed" },
            outcome
                .error
                .as_deref()
                .unwrap_or_else(|| outcome.output.lines().next().unwrap_or("")),
        )));
        issue.updated_at = Utc::now();
        if issue.status == IssueStatus::Open {
            issue.status = IssueStatus::Investigating;
        }
        self.store.upsert_issue(&issue).await
    }

    /// Resolve the open issue for a subject (e.g. the service recovered).
    pub async fn resolve_subject(&self, subject: &str, resolution: &str) -> Result<bool> {
        let Some(mut issue) = self.open_issue_for(subject).await? else {
            return Ok(false);
        };
        issue.status = IssueStatus::Resolved;
        issue.resolution = Some(resolution.to_string());
        issue.updated_at = Utc::now();
        info!(issue = %issue.id, subject = %subject, "issue resolved");
        self.store.upsert_issue(&issue).await?;
        Ok(true)
    }

    pub async fn resolve(&self, id: Uuid, resolution: &str) -> Result<bool> {
        let Some(mut issue) = self.store.get_issue(id).await? else {
            return Ok(false);
        };
        issue.status = IssueStatus::Resolved;
        issue.resolution = Some(resolution.to_string());
        issue.updated_at = Utc::now();
        self.store.upsert_issue(&issue).await?;
        Ok(true)
    }

    /// Close a resolved issue. Closed issues stay queryable for similarity
    /// search.
    pub async fn close(&self, id: Uuid) -> Result<bool> {
        let Some(mut issue) = self.store.get_issue(id).await? else {
            return Ok(false);
        };
        if issue.status != IssueStatus::Resolved {
            return Ok(false);
        }
        issue.status = IssueStatus::Closed;
        issue.updated_at = Utc::now();
        self.store.upsert_issue(&issue).await?;
        Ok(true)
    }

    async fn open_issue_for(&self, subject: &str) -> Result<Option<Issue>> {
        let issues = self.store.list_issues(Some(&self.host), None).await?;
        Ok(issues.into_iter().find(|i| {
            i.subject == subject
                && matches!(i.status, IssueStatus::Open | IssueStatus::Investigating)
        }))
    }

    async fn latest_issue_for(&self, subject: &str) -> Result<Option<Issue>> {
        let issues = self.store.list_issues(Some(&self.host), None).await?;
        // list_issues orders by updated_at descending already.
        Ok(issues.into_iter().find(|i| i.subject == subject))
    }

    async fn in_reopen_cooldown(&self, subject: &str) -> Result<bool> {
        let cutoff = Utc::now() - self.reopen_cooldown;
        let resolved = self
            .store
            .list_issues(Some(&self.host), Some(IssueStatus::Resolved))
            .await?;
        Ok(resolved
            .iter()
            .any(|i| i.subject == subject && i.updated_at > cutoff))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vg_core::types::{ActionKind, Severity, TriggerKind};
    use vg_stores::SqliteSemanticStore;

    async fn tracker() -> (Arc<SqliteSemanticStore>, IssueTracker) {
        let store = Arc::new(SqliteSemanticStore::new_in_memory().await.unwrap());
        let tracker = IssueTracker::new(Arc::clone(&store) as Arc<dyn SemanticStore>, "macha");
        (store, tracker)
    }

    fn event(subject: &str) -> TriggerEvent {
        TriggerEvent::new(
            TriggerKind::ServiceState,
            Severity::Warning,
            subject,
            format!("service {subject} is failed"),
        )
    }

    #[tokio::test]
    async fn first_event_opens_issue_second_appends() {
        let (store, tracker) = tracker().await;

        let first = tracker.record_event(&event("nginx")).await.unwrap().unwrap();
        let second = tracker.record_event(&event("nginx")).await.unwrap().unwrap();
        assert_eq!(first, second);

        let issues = store.list_issues(Some("macha"), None).await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].investigations.len(), 1);
    }

    #[tokio::test]
    async fn different_subjects_get_distinct_issues() {
        let (store, tracker) = tracker().await;
        tracker.record_event(&event("nginx")).await.unwrap();
        tracker.record_event(&event("redis")).await.unwrap();

        let issues = store.list_issues(Some("macha"), None).await.unwrap();
        assert_eq!(issues.len(), 2);
    }

    #[tokio::test]
    async fn appended_event_raises_severity() {
        let (store, tracker) = tracker().await;
        tracker.record_event(&event("nginx")).await.unwrap();

        let critical = TriggerEvent::new(
            TriggerKind::ServiceState,
            Severity::Critical,
            "nginx",
            "service nginx is failed repeatedly",
        );
        tracker.record_event(&critical).await.unwrap();

        let issues = store.list_issues(Some("macha"), None).await.unwrap();
        assert_eq!(issues[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn outcome_attaches_to_issue_and_starts_investigating() {
        let (store, tracker) = tracker().await;
        tracker.record_event(&event("nginx")).await.unwrap();

        let outcome = ActionOutcome {
            action_id: Uuid::new_v4(),
            subject: "nginx".into(),
            kind: ActionKind::ServiceRestart,
            success: true,
            output: "restarted".into(),
            error: None,
            completed_at: Utc::now(),
        };
        tracker.record_outcome(&outcome).await.unwrap();

        let issues = store.list_issues(Some("macha"), None).await.unwrap();
        assert_eq!(issues[0].actions.len(), 1);
        assert_eq!(issues[0].status, IssueStatus::Investigating);
    }

    #[tokio::test]
    async fn resolve_subject_then_cooldown_blocks_reopen() {
        let (store, tracker) = tracker().await;
        tracker.record_event(&event("nginx")).await.unwrap();
        assert!(tracker
            .resolve_subject("nginx", "service recovered on its own")
            .await
            .unwrap());

        // Within the cooldown: no new issue for the same subject.
        let suppressed = tracker.record_event(&event("nginx")).await.unwrap();
        assert!(suppressed.is_none());
        let issues = store.list_issues(Some("macha"), None).await.unwrap();
        assert_eq!(issues.len(), 1);
    }

    #[tokio::test]
    async fn reopen_allowed_after_cooldown() {
        let store = Arc::new(SqliteSemanticStore::new_in_memory().await.unwrap());
        let tracker = IssueTracker::new(Arc::clone(&store) as Arc<dyn SemanticStore>, "macha")
            .with_reopen_cooldown(Duration::zero());

        tracker.record_event(&event("nginx")).await.unwrap();
        tracker.resolve_subject("nginx", "recovered").await.unwrap();

        let reopened = tracker.record_event(&event("nginx")).await.unwrap();
        assert!(reopened.is_some());
        let issues = store.list_issues(Some("macha"), None).await.unwrap();
        assert_eq!(issues.len(), 2);
    }

    #[tokio::test]
    async fn close_requires_resolved() {
        let (_store, tracker) = tracker().await;
        let id = tracker.record_event(&event("nginx")).await.unwrap().unwrap();

        assert!(!tracker.close(id).await.unwrap());
        tracker.resolve(id, "fixed").await.unwrap();
        assert!(tracker.close(id).await.unwrap());
    }
}
