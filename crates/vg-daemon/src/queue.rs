//! The persisted approval queue.
//!
//! Deferred actions park here until an operator resolves them. Every
//! mutation is appended to a JSON-Lines journal (the audit trail) and the
//! full state is rewritten atomically to a snapshot file for O(1) restore.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use vg_core::types::{ProposedAction, QueueStatus, QueuedAction};

const SNAPSHOT_FILE: &str = "approval_queue.json";
const JOURNAL_FILE: &str = "approval_queue.jsonl";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queued action not found: {0}")]
    NotFound(u64),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: QueueStatus, to: QueueStatus },
    #[error("a pending action for {0} is already queued")]
    Duplicate(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

// ---------------------------------------------------------------------------
// Persistence shapes
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct QueueSnapshot {
    next_id: u64,
    items: Vec<QueuedAction>,
}

#[derive(Serialize)]
struct JournalRecord<'a> {
    at: chrono::DateTime<Utc>,
    event: &'a str,
    item: &'a QueuedAction,
}

// ---------------------------------------------------------------------------
// ApprovalQueue
// ---------------------------------------------------------------------------

pub struct ApprovalQueue {
    state_dir: PathBuf,
    next_id: u64,
    items: Vec<QueuedAction>,
}

impl ApprovalQueue {
    /// Restore from the snapshot file, or start empty.
    pub fn load(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)?;

        let snapshot_path = state_dir.join(SNAPSHOT_FILE);
        let (next_id, items) = if snapshot_path.exists() {
            let text = std::fs::read_to_string(&snapshot_path)?;
            let snapshot: QueueSnapshot = serde_json::from_str(&text)?;
            (snapshot.next_id, snapshot.items)
        } else {
            (1, Vec::new())
        };

        if !items.is_empty() {
            info!(items = items.len(), "approval queue restored");
        }
        Ok(Self {
            state_dir,
            next_id,
            items,
        })
    }

    pub fn list(&self) -> &[QueuedAction] {
        &self.items
    }

    pub fn get(&self, id: u64) -> Option<&QueuedAction> {
        self.items.iter().find(|q| q.queue_id == id)
    }

    /// Open (non-terminal) entries.
    pub fn pending_depth(&self) -> usize {
        self.items
            .iter()
            .filter(|q| !q.status.is_terminal())
            .count()
    }

    /// Park an action. A pending entry with the same subject and kind is
    /// treated as a duplicate and not queued again.
    pub fn enqueue(&mut self, action: ProposedAction) -> Result<u64> {
        if let Some(existing) = self.items.iter().find(|q| {
            q.status == QueueStatus::Pending
                && q.action.subject == action.subject
                && q.action.kind == action.kind
        }) {
            debug!(
                queue_id = existing.queue_id,
                subject = %action.subject,
                "duplicate pending action suppressed"
            );
            return Err(QueueError::Duplicate(action.subject));
        }

        let id = self.next_id;
        self.next_id += 1;
        let item = QueuedAction {
            queue_id: id,
            action,
            queued_at: Utc::now(),
            status: QueueStatus::Pending,
            resolved_at: None,
            notes: Vec::new(),
        };
        self.journal("queued", &item)?;
        self.items.push(item);
        self.persist()?;
        Ok(id)
    }

    /// Approve a pending entry. Returns a copy of the action for the
    /// executor to run; the entry stays `approved` until
    /// [`mark_finished`](Self::mark_finished) records the result.
    pub fn approve(&mut self, id: u64) -> Result<ProposedAction> {
        let action = {
            let item = self.transition(id, QueueStatus::Approved)?;
            item.action.clone()
        };
        self.persist()?;
        Ok(action)
    }

    /// Reject a pending entry. Terminal.
    pub fn reject(&mut self, id: u64) -> Result<()> {
        self.transition(id, QueueStatus::Rejected)?;
        self.persist()
    }

    /// Record the execution result of an approved entry.
    pub fn mark_finished(&mut self, id: u64, success: bool) -> Result<()> {
        let status = if success {
            QueueStatus::Executed
        } else {
            QueueStatus::Failed
        };
        self.transition(id, status)?;
        self.persist()
    }

    /// Attach an operator note to an entry (`approve discuss`).
    pub fn discuss(&mut self, id: u64, note: impl Into<String>) -> Result<()> {
        let item = self
            .items
            .iter_mut()
            .find(|q| q.queue_id == id)
            .ok_or(QueueError::NotFound(id))?;
        item.notes.push(note.into());
        let item = item.clone();
        self.journal("discussed", &item)?;
        self.persist()
    }

    fn transition(&mut self, id: u64, to: QueueStatus) -> Result<&QueuedAction> {
        let idx = self
            .items
            .iter()
            .position(|q| q.queue_id == id)
            .ok_or(QueueError::NotFound(id))?;
        let from = self.items[idx].status;
        if !from.can_transition_to(to) {
            return Err(QueueError::InvalidTransition { from, to });
        }
        self.items[idx].status = to;
        if to.is_terminal() {
            self.items[idx].resolved_at = Some(Utc::now());
        }
        let item = self.items[idx].clone();
        self.journal(&to.to_string(), &item)?;
        info!(queue_id = id, status = %to, subject = %item.action.subject, "queue transition");
        Ok(&self.items[idx])
    }

    fn journal(&self, event: &str, item: &QueuedAction) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.state_dir.join(JOURNAL_FILE))?;
        let record = JournalRecord {
            at: Utc::now(),
            event,
            item,
        };
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        Ok(())
    }

    /// Rewrite the snapshot atomically: write a temp file, then rename.
    fn persist(&self) -> Result<()> {
        let snapshot = QueueSnapshot {
            next_id: self.next_id,
            items: self.items.clone(),
        };
        let path = self.state_dir.join(SNAPSHOT_FILE);
        let tmp = self.state_dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Path of the journal file under a state directory (for `vg logs`).
pub fn journal_path(state_dir: &Path) -> PathBuf {
    state_dir.join(JOURNAL_FILE)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vg_core::types::{ActionKind, ActionOrigin, RiskLevel};

    fn action(subject: &str, kind: ActionKind) -> ProposedAction {
        let mut a = ProposedAction::new(subject, kind, RiskLevel::Medium, ActionOrigin::Review);
        a.commands = vec![format!("systemctl restart {subject}")];
        a
    }

    fn queue() -> (tempfile::TempDir, ApprovalQueue) {
        let dir = tempfile::tempdir().unwrap();
        let q = ApprovalQueue::load(dir.path()).unwrap();
        (dir, q)
    }

    #[test]
    fn enqueue_assigns_monotonic_ids() {
        let (_dir, mut q) = queue();
        let a = q.enqueue(action("nginx", ActionKind::ServiceRestart)).unwrap();
        let b = q.enqueue(action("redis", ActionKind::ServiceRestart)).unwrap();
        assert!(b > a);
        assert_eq!(q.pending_depth(), 2);
    }

    #[test]
    fn duplicate_pending_action_is_suppressed() {
        let (_dir, mut q) = queue();
        q.enqueue(action("nginx", ActionKind::ServiceRestart)).unwrap();
        let err = q
            .enqueue(action("nginx", ActionKind::ServiceRestart))
            .unwrap_err();
        assert!(matches!(err, QueueError::Duplicate(_)));

        // Same subject, different kind is a different action.
        assert!(q.enqueue(action("nginx", ActionKind::Investigation)).is_ok());
    }

    #[test]
    fn resolved_entry_allows_requeue_of_same_subject() {
        let (_dir, mut q) = queue();
        let id = q.enqueue(action("nginx", ActionKind::ServiceRestart)).unwrap();
        q.reject(id).unwrap();
        assert!(q.enqueue(action("nginx", ActionKind::ServiceRestart)).is_ok());
    }

    #[test]
    fn approve_then_finish_walks_the_state_machine() {
        let (_dir, mut q) = queue();
        let id = q.enqueue(action("nginx", ActionKind::ServiceRestart)).unwrap();

        let approved = q.approve(id).unwrap();
        assert_eq!(approved.subject, "nginx");
        assert_eq!(q.get(id).unwrap().status, QueueStatus::Approved);

        q.mark_finished(id, true).unwrap();
        let item = q.get(id).unwrap();
        assert_eq!(item.status, QueueStatus::Executed);
        assert!(item.resolved_at.is_some());
    }

    #[test]
    fn terminal_states_are_never_revisited() {
        let (_dir, mut q) = queue();
        let id = q.enqueue(action("nginx", ActionKind::ServiceRestart)).unwrap();
        q.reject(id).unwrap();

        assert!(matches!(
            q.approve(id),
            Err(QueueError::InvalidTransition { .. })
        ));
        assert!(matches!(
            q.reject(id),
            Err(QueueError::InvalidTransition { .. })
        ));
        assert!(matches!(
            q.mark_finished(id, true),
            Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn pending_cannot_jump_to_executed() {
        let (_dir, mut q) = queue();
        let id = q.enqueue(action("nginx", ActionKind::ServiceRestart)).unwrap();
        assert!(matches!(
            q.mark_finished(id, true),
            Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn unknown_id_is_not_found() {
        let (_dir, mut q) = queue();
        assert!(matches!(q.approve(99), Err(QueueError::NotFound(99))));
    }

    #[test]
    fn queue_survives_restart_with_identical_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let (first_id, second_id, before);
        {
            let mut q = ApprovalQueue::load(dir.path()).unwrap();
            first_id = q.enqueue(action("nginx", ActionKind::ServiceRestart)).unwrap();
            second_id = q.enqueue(action("/var/log", ActionKind::Cleanup)).unwrap();
            before = serde_json::to_string(q.list()).unwrap();
        }

        let q = ApprovalQueue::load(dir.path()).unwrap();
        assert_eq!(q.list().len(), 2);
        assert_eq!(q.list()[0].queue_id, first_id);
        assert_eq!(q.list()[1].queue_id, second_id);
        assert_eq!(serde_json::to_string(q.list()).unwrap(), before);

        // Ids keep counting from where they left off.
        let mut q = q;
        let third = q.enqueue(action("redis", ActionKind::ServiceRestart)).unwrap();
        assert!(third > second_id);
    }

    #[test]
    fn journal_records_every_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = ApprovalQueue::load(dir.path()).unwrap();
        let id = q.enqueue(action("nginx", ActionKind::ServiceRestart)).unwrap();
        q.discuss(id, "why restart and not reload?").unwrap();
        q.approve(id).unwrap();
        q.mark_finished(id, false).unwrap();

        let journal = std::fs::read_to_string(journal_path(dir.path())).unwrap();
        let events: Vec<String> = journal
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        assert_eq!(events, vec!["queued", "discussed", "approved", "failed"]);
    }

    #[test]
    fn discuss_attaches_notes() {
        let (_dir, mut q) = queue();
        let id = q.enqueue(action("nginx", ActionKind::ServiceRestart)).unwrap();
        q.discuss(id, "looks safe to me").unwrap();
        assert_eq!(q.get(id).unwrap().notes, vec!["looks safe to me"]);
    }
}
