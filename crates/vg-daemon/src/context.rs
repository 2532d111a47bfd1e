//! The token-budgeted context window.
//!
//! A bounded sequence of [`ContextEntry`] values with a hard token budget.
//! Admissions that would breach the budget force compression first:
//! coalesce runs of identical fingerprints, summarize old entries through
//! the small model, then drop oldest-first. The window runs behind a
//! single-writer mailbox; producers suspend until their entry is admitted
//! and readers get point-in-time values.

use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vg_core::tokens;
use vg_core::types::{ActivityReport, ContextEntry, EntryBody};
use vg_intelligence::llm::{ChatMessage, TierClient};
use vg_stores::{Aggregate, MetricsStore};

/// How long an activity report stays usable in prompts.
const ACTIVITY_FRESHNESS_MINUTES: i64 = 15;
/// Window covered by the assembled metrics table.
const METRICS_TABLE_MINUTES: i64 = 15;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context actor is gone")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ContextError>;

// ---------------------------------------------------------------------------
// Stats & snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub compressions: u64,
    pub entries_coalesced: u64,
    pub entries_summarized: u64,
    pub entries_dropped: u64,
    pub tokens_saved: u64,
}

/// Point-in-time serializable state, written on shutdown and periodically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub saved_at: DateTime<Utc>,
    pub total_tokens: usize,
    pub entries: Vec<ContextEntry>,
    pub stats: CompressionStats,
}

pub fn save_snapshot(path: &Path, snapshot: &ContextSnapshot) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<Option<ContextSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

// ---------------------------------------------------------------------------
// ContextWindow
// ---------------------------------------------------------------------------

pub struct ContextWindow {
    budget: usize,
    soft_age: Duration,
    summary_target: usize,
    entries: VecDeque<ContextEntry>,
    total_tokens: usize,
    stats: CompressionStats,
}

impl ContextWindow {
    /// Create a window seeded with its pinned system header.
    pub fn new(budget: usize, soft_age_s: u64, summary_target: usize, header: ContextEntry) -> Self {
        let mut window = Self {
            budget,
            soft_age: Duration::seconds(soft_age_s as i64),
            summary_target,
            entries: VecDeque::new(),
            total_tokens: 0,
            stats: CompressionStats::default(),
        };
        window.push(header);
        window
    }

    /// Rebuild from a snapshot, under the current configuration.
    pub fn restore(
        budget: usize,
        soft_age_s: u64,
        summary_target: usize,
        snapshot: ContextSnapshot,
    ) -> Self {
        let total_tokens = snapshot.entries.iter().map(|e| e.token_count).sum();
        Self {
            budget,
            soft_age: Duration::seconds(soft_age_s as i64),
            summary_target,
            entries: snapshot.entries.into(),
            total_tokens,
            stats: snapshot.stats,
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CompressionStats {
        self.stats
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            saved_at: Utc::now(),
            total_tokens: self.total_tokens,
            entries: self.entries.iter().cloned().collect(),
            stats: self.stats,
        }
    }

    fn push(&mut self, entry: ContextEntry) {
        self.total_tokens += entry.token_count;
        self.entries.push_back(entry);
    }

    /// Admit an entry, compressing first when it would breach the budget.
    /// The budget invariant holds on return.
    pub async fn admit(&mut self, mut entry: ContextEntry, summarizer: Option<&TierClient>) {
        let header_tokens = self.entries.front().map(|e| e.token_count).unwrap_or(0);

        // An entry that can never fit is truncated with a marker.
        if header_tokens + entry.token_count > self.budget {
            let room = self.budget.saturating_sub(header_tokens + 8);
            let truncated = tokens::truncate_to(&entry.render(), room);
            let timestamp = entry.timestamp;
            entry = ContextEntry::new(EntryBody::Summary {
                text: truncated,
                coalesced: 1,
            });
            entry.timestamp = timestamp;
        }

        if self.total_tokens + entry.token_count > self.budget {
            self.compress(entry.token_count, summarizer).await;
        }

        // Last resort: protected entries may be squatting on the budget.
        // Shrink the incoming entry to whatever room is left rather than
        // breach the invariant.
        let room = self.budget.saturating_sub(self.total_tokens);
        if entry.token_count > room {
            let timestamp = entry.timestamp;
            let truncated = tokens::truncate_to(&entry.render(), room.saturating_sub(8));
            entry = ContextEntry::new(EntryBody::Summary {
                text: truncated,
                coalesced: 1,
            });
            entry.timestamp = timestamp;
            if entry.token_count > room {
                warn!("entry dropped: context window exhausted by protected entries");
                return;
            }
        }

        self.push(entry);
        debug_assert!(self.total_tokens <= self.budget);
    }

    /// Multi-stage compression until `incoming` more tokens fit.
    async fn compress(&mut self, incoming: usize, summarizer: Option<&TierClient>) {
        self.stats.compressions += 1;
        let before = self.total_tokens;

        self.coalesce_runs();
        if self.total_tokens + incoming <= self.budget {
            self.stats.tokens_saved += before.saturating_sub(self.total_tokens) as u64;
            return;
        }

        if let Some(tier) = summarizer {
            if !self.summarize_old(tier).await {
                debug!("summary stage made no progress, falling back to eviction");
            }
        }

        // Final stage: oldest-first eviction of compressible entries.
        while self.total_tokens + incoming > self.budget {
            if !self.drop_oldest_compressible() {
                warn!("context window cannot free enough tokens; keeping protected entries");
                break;
            }
        }
        self.stats.tokens_saved += before.saturating_sub(self.total_tokens) as u64;
    }

    /// Stage 1: collapse consecutive entries sharing a fingerprint into a
    /// single "Nx reason between t0 and t1" summary.
    fn coalesce_runs(&mut self) {
        let mut rebuilt: VecDeque<ContextEntry> = VecDeque::with_capacity(self.entries.len());
        let mut run: Vec<ContextEntry> = Vec::new();

        let flush = |run: &mut Vec<ContextEntry>,
                     rebuilt: &mut VecDeque<ContextEntry>,
                     stats: &mut CompressionStats| {
            if run.len() > 1 {
                let first = &run[0];
                let last = &run[run.len() - 1];
                let reason = match &first.body {
                    EntryBody::Trigger(ev) => ev.reason.clone(),
                    _ => first.render(),
                };
                let mut summary = ContextEntry::new(EntryBody::Summary {
                    text: format!(
                        "{reason} between {} and {}",
                        first.timestamp.format("%H:%M:%S"),
                        last.timestamp.format("%H:%M:%S"),
                    ),
                    coalesced: run.len() as u32,
                });
                summary.timestamp = last.timestamp;
                stats.entries_coalesced += run.len() as u64;
                rebuilt.push_back(summary);
            } else {
                rebuilt.extend(run.drain(..));
            }
            run.clear();
        };

        for entry in self.entries.drain(..) {
            let same_run = match (run.last().and_then(|e| e.fingerprint()), entry.fingerprint()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            };
            if !same_run {
                flush(&mut run, &mut rebuilt, &mut self.stats);
            }
            run.push(entry);
        }
        flush(&mut run, &mut rebuilt, &mut self.stats);

        self.entries = rebuilt;
        self.total_tokens = self.entries.iter().map(|e| e.token_count).sum();
    }

    /// Stage 2: replace entries older than the soft-age threshold with one
    /// fixed-length summary from the small model. Returns false when there
    /// was nothing to do or the model call failed (callers fall back to
    /// eviction).
    async fn summarize_old(&mut self, tier: &TierClient) -> bool {
        let cutoff = Utc::now() - self.soft_age;
        let protected_meta = self.latest_meta_index();

        let old: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(idx, e)| {
                *idx != 0
                    && Some(*idx) != protected_meta
                    && e.timestamp < cutoff
                    && e.compressible()
                    && !matches!(e.body, EntryBody::Summary { .. })
            })
            .map(|(idx, _)| idx)
            .collect();
        if old.is_empty() {
            return false;
        }

        let mut joined = String::new();
        for idx in &old {
            joined.push_str(&self.entries[*idx].render());
            joined.push('\n');
        }
        let prompt = format!(
            "Summarize the following monitoring events in at most {} tokens. Keep service names, counts, and time ranges.\n\n{}",
            self.summary_target,
            tokens::truncate_to(&joined, 4096),
        );

        let summary_text = match tier.complete(vec![ChatMessage::user(prompt)]).await {
            Ok(text) => tokens::truncate_to(text.trim(), self.summary_target),
            Err(e) => {
                warn!(error = %e, "compression summarizer failed");
                return false;
            }
        };

        let newest = self.entries[old[old.len() - 1]].timestamp;
        let mut summary = ContextEntry::new(EntryBody::Summary {
            text: summary_text,
            coalesced: old.len() as u32,
        });
        summary.timestamp = newest;

        let first_idx = old[0];
        for idx in old.iter().rev() {
            self.entries.remove(*idx);
        }
        self.entries.insert(first_idx.min(self.entries.len()), summary);
        self.stats.entries_summarized += old.len() as u64;
        self.total_tokens = self.entries.iter().map(|e| e.token_count).sum();
        true
    }

    /// Stage 3: drop the oldest compressible entry, never the header and
    /// never the most recent meta analysis. Returns false when nothing can
    /// be dropped.
    fn drop_oldest_compressible(&mut self) -> bool {
        let protected_meta = self.latest_meta_index();
        let victim = self
            .entries
            .iter()
            .enumerate()
            .position(|(idx, e)| idx != 0 && Some(idx) != protected_meta && e.compressible());
        match victim.and_then(|idx| self.entries.remove(idx)) {
            Some(removed) => {
                self.total_tokens -= removed.token_count;
                self.stats.entries_dropped += 1;
                true
            }
            None => false,
        }
    }

    fn latest_meta_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|e| matches!(e.body, EntryBody::MetaAnalysis { .. }))
    }

    /// Assemble a prompt of at most `budget` tokens: system header, recent
    /// metrics table, fresh activity report, then entries newest-first.
    pub fn assemble(
        &self,
        budget: usize,
        metrics_table: Option<&str>,
        activity: Option<&ActivityReport>,
    ) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut spent = 0usize;

        // Per-part estimates plus one token per separator over-count the
        // joined string, so the sum bounds the real total.
        let mut try_add = |parts: &mut Vec<String>, spent: &mut usize, text: String| -> bool {
            let cost = tokens::estimate(&text) + 1;
            if *spent + cost > budget {
                return false;
            }
            *spent += cost;
            parts.push(text);
            true
        };

        if let Some(header) = self.entries.front() {
            try_add(&mut parts, &mut spent, header.render());
        }
        if let Some(table) = metrics_table {
            try_add(&mut parts, &mut spent, table.to_string());
        }
        if let Some(report) = activity {
            let age = Utc::now() - report.collected_at;
            if age < Duration::minutes(ACTIVITY_FRESHNESS_MINUTES) {
                try_add(&mut parts, &mut spent, report.render());
            }
        }

        let mut events: Vec<String> = vec!["Recent events (newest first):".to_string()];
        let mut events_cost = tokens::estimate(&events[0]) + 1;
        for entry in self.entries.iter().rev() {
            if matches!(entry.body, EntryBody::SystemHeader { .. }) {
                continue;
            }
            let text = entry.render();
            let cost = tokens::estimate(&text) + 1;
            if spent + events_cost + cost > budget {
                break;
            }
            events_cost += cost;
            events.push(text);
        }
        if events.len() > 1 && spent + events_cost <= budget {
            parts.push(events.join("\n"));
        }

        let prompt = parts.join("\n\n");
        debug_assert!(tokens::estimate(&prompt) <= budget);
        prompt
    }
}

// ---------------------------------------------------------------------------
// Metrics table formatting
// ---------------------------------------------------------------------------

/// Render bucketed series into the prompt's metrics table.
pub fn format_metrics_table(series: &[(String, Vec<(DateTime<Utc>, f64)>)]) -> Option<String> {
    if series.iter().all(|(_, points)| points.is_empty()) {
        return None;
    }
    let mut lines = vec![format!(
        "Recent metrics (last {METRICS_TABLE_MINUTES} min, 1-min buckets):"
    )];
    for (name, points) in series {
        if points.is_empty() {
            continue;
        }
        let values: Vec<String> = points.iter().map(|(_, v)| format!("{v:.1}")).collect();
        lines.push(format!("  {name}: {}", values.join(" ")));
    }
    Some(lines.join("\n"))
}

// ---------------------------------------------------------------------------
// Context actor
// ---------------------------------------------------------------------------

enum ContextCommand {
    Admit(ContextEntry, oneshot::Sender<()>),
    Assemble {
        budget: usize,
        reply: oneshot::Sender<String>,
    },
    Snapshot(oneshot::Sender<ContextSnapshot>),
    SetActivity(ActivityReport),
}

/// Cheap-to-clone handle to the single-writer context actor.
#[derive(Clone)]
pub struct ContextHandle {
    tx: mpsc::Sender<ContextCommand>,
}

impl ContextHandle {
    /// Submit an entry and suspend until it has been admitted.
    pub async fn admit(&self, entry: ContextEntry) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(ContextCommand::Admit(entry, ack_tx))
            .await
            .map_err(|_| ContextError::Closed)?;
        ack_rx.await.map_err(|_| ContextError::Closed)
    }

    /// Assemble a prompt from a point-in-time snapshot of the window.
    pub async fn assemble(&self, budget: usize) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ContextCommand::Assemble {
                budget,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ContextError::Closed)?;
        reply_rx.await.map_err(|_| ContextError::Closed)
    }

    pub async fn snapshot(&self) -> Result<ContextSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ContextCommand::Snapshot(reply_tx))
            .await
            .map_err(|_| ContextError::Closed)?;
        reply_rx.await.map_err(|_| ContextError::Closed)
    }

    pub async fn set_activity(&self, report: ActivityReport) -> Result<()> {
        self.tx
            .send(ContextCommand::SetActivity(report))
            .await
            .map_err(|_| ContextError::Closed)
    }
}

/// Spawn the single-writer actor owning the window. The task finishes (and
/// yields the window back for a final snapshot) when every handle is gone.
pub fn spawn_context(
    mut window: ContextWindow,
    summarizer: Option<TierClient>,
    metrics: Option<std::sync::Arc<dyn MetricsStore>>,
    host: String,
) -> (ContextHandle, JoinHandle<ContextWindow>) {
    let (tx, mut rx) = mpsc::channel::<ContextCommand>(64);
    let handle = ContextHandle { tx };

    let task = tokio::spawn(async move {
        let mut activity: Option<ActivityReport> = None;
        while let Some(command) = rx.recv().await {
            match command {
                ContextCommand::Admit(entry, ack) => {
                    window.admit(entry, summarizer.as_ref()).await;
                    let _ = ack.send(());
                }
                ContextCommand::Assemble { budget, reply } => {
                    let table = match &metrics {
                        Some(store) => fetch_metrics_table(store.as_ref(), &host).await,
                        None => None,
                    };
                    let _ = reply.send(window.assemble(
                        budget,
                        table.as_deref(),
                        activity.as_ref(),
                    ));
                }
                ContextCommand::Snapshot(reply) => {
                    let _ = reply.send(window.snapshot());
                }
                ContextCommand::SetActivity(report) => {
                    activity = Some(report);
                }
            }
        }
        info!(
            entries = window.len(),
            tokens = window.total_tokens(),
            "context actor stopped"
        );
        window
    });

    (handle, task)
}

async fn fetch_metrics_table(store: &dyn MetricsStore, host: &str) -> Option<String> {
    let to = Utc::now();
    let from = to - Duration::minutes(METRICS_TABLE_MINUTES);
    let mut series = Vec::new();
    for name in ["cpu_pct", "memory_pct", "root_fs_pct", "load1"] {
        match store
            .aggregate(name, host, from, to, Duration::minutes(1), Aggregate::Avg)
            .await
        {
            Ok(points) => series.push((name.to_string(), points)),
            Err(e) => {
                warn!(metric = name, error = %e, "metrics table query failed");
            }
        }
    }
    format_metrics_table(&series)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vg_core::types::{
        ActionOutcome, ActionKind, AutonomyLevel, IoStats, NetStats, Severity, TriggerEvent,
        TriggerKind,
    };
    use vg_intelligence::llm::MockLlm;

    fn header() -> ContextEntry {
        ContextEntry::new(EntryBody::SystemHeader {
            host: "macha".into(),
            autonomy: AutonomyLevel::Suggest,
        })
    }

    fn trigger_entry(subject: &str, reason: &str) -> ContextEntry {
        ContextEntry::new(EntryBody::Trigger(TriggerEvent::new(
            TriggerKind::LogPattern,
            Severity::Warning,
            subject,
            reason,
        )))
    }

    fn window(budget: usize) -> ContextWindow {
        ContextWindow::new(budget, 3600, 96, header())
    }

    #[tokio::test]
    async fn budget_invariant_holds_under_pressure() {
        let mut w = window(600);
        for i in 0..200 {
            w.admit(
                trigger_entry(&format!("svc{i}"), &format!("service svc{i} misbehaving badly")),
                None,
            )
            .await;
            assert!(w.total_tokens() <= 600, "over budget after entry {i}");
        }
        // Header survived all of it.
        assert!(matches!(
            w.entries.front().unwrap().body,
            EntryBody::SystemHeader { .. }
        ));
    }

    #[tokio::test]
    async fn entry_exactly_at_budget_is_admitted_without_compression() {
        let mut w = window(10_000);
        let entry = trigger_entry("nginx", "failed");
        let fill = 10_000 - w.total_tokens() - entry.token_count;

        // Fill to exactly (budget - entry) with one synthetic entry.
        let mut filler = ContextEntry::new(EntryBody::Summary {
            text: "x".into(),
            coalesced: 1,
        });
        filler.token_count = fill;
        w.push(filler);

        w.admit(entry, None).await;
        assert_eq!(w.total_tokens(), 10_000);
        assert_eq!(w.stats().compressions, 0);
    }

    #[tokio::test]
    async fn coalesce_collapses_identical_fingerprints() {
        let mut w = window(100_000);
        for _ in 0..5 {
            w.admit(trigger_entry("cpu_pct", "cpu high"), None).await;
        }
        w.coalesce_runs();

        // header + one summary
        assert_eq!(w.len(), 2);
        match &w.entries[1].body {
            EntryBody::Summary { text, coalesced } => {
                assert_eq!(*coalesced, 5);
                assert!(text.contains("cpu high between"));
            }
            other => panic!("expected summary, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn compression_coalesces_before_dropping() {
        // Budget small enough that 30 identical warnings cannot coexist.
        let mut w = window(400);
        for _ in 0..30 {
            w.admit(trigger_entry("cpu_pct", "cpu usage high"), None).await;
        }
        assert!(w.total_tokens() <= 400);
        assert!(w.stats().entries_coalesced > 0);
        // Identical events collapsed instead of 29 drops.
        assert!(w.len() < 31);
    }

    #[tokio::test]
    async fn oversized_entry_is_truncated_with_marker() {
        let mut w = window(300);
        let huge = ContextEntry::new(EntryBody::MetaAnalysis {
            escalation_reason: "x".into(),
            analysis: "word ".repeat(2000),
        });
        w.admit(huge, None).await;

        assert!(w.total_tokens() <= 300);
        let last = w.entries.back().unwrap();
        match &last.body {
            EntryBody::Summary { text, .. } => assert!(text.contains("[truncated]")),
            other => panic!("expected truncated summary, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn summarizer_compresses_old_entries() {
        let mock = Arc::new(MockLlm::new().with_response("3 warnings on nginx overnight"));
        let tier = TierClient::new(mock, "small", 128, std::time::Duration::from_secs(5), 0);

        let mut w = window(100_000);
        for i in 0..3 {
            w.admit(trigger_entry(&format!("svc{i}"), "warning state"), None).await;
        }
        // Age them past the soft threshold.
        for entry in w.entries.iter_mut().skip(1) {
            entry.timestamp = Utc::now() - Duration::hours(2);
        }

        assert!(w.summarize_old(&tier).await);
        assert_eq!(w.len(), 2); // header + summary
        match &w.entries[1].body {
            EntryBody::Summary { text, coalesced } => {
                assert_eq!(*coalesced, 3);
                assert!(text.contains("nginx overnight"));
            }
            other => panic!("expected summary, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn summarizer_failure_falls_back_to_eviction() {
        let mock = Arc::new(
            MockLlm::new().with_error(vg_intelligence::llm::LlmError::Timeout),
        );
        let tier = TierClient::new(mock, "small", 128, std::time::Duration::from_secs(5), 0);

        let mut w = window(400);
        for i in 0..20 {
            let mut entry = trigger_entry(&format!("svc{i}"), "distinct warning message here");
            entry.timestamp = Utc::now() - Duration::hours(2);
            w.admit(entry, Some(&tier)).await;
        }
        // Never deadlocks, never over budget.
        assert!(w.total_tokens() <= 400);
        assert!(w.stats().entries_dropped > 0);
    }

    #[tokio::test]
    async fn latest_meta_analysis_survives_compression() {
        let mut w = window(500);
        let meta = ContextEntry::new(EntryBody::MetaAnalysis {
            escalation_reason: "multi-service failure".into(),
            analysis: "root cause: disk controller".into(),
        });
        w.admit(meta, None).await;
        for i in 0..50 {
            w.admit(trigger_entry(&format!("svc{i}"), "noise entry"), None).await;
        }
        assert!(w.total_tokens() <= 500);
        assert!(w.latest_meta_index().is_some());
    }

    #[tokio::test]
    async fn assemble_respects_reasoner_budget() {
        let mut w = window(100_000);
        for i in 0..100 {
            w.admit(
                trigger_entry(&format!("svc{i}"), "something fairly long happened to this service"),
                None,
            )
            .await;
        }
        for budget in [50, 200, 1000] {
            let prompt = w.assemble(budget, None, None);
            assert!(
                tokens::estimate(&prompt) <= budget,
                "assembled prompt over budget {budget}"
            );
        }
    }

    #[tokio::test]
    async fn assemble_orders_newest_first_and_includes_sections() {
        let mut w = window(100_000);
        w.admit(trigger_entry("old-svc", "old event"), None).await;
        w.admit(trigger_entry("new-svc", "new event"), None).await;

        let activity = ActivityReport {
            collected_at: Utc::now(),
            cpu_pct: 12.0,
            mem_pct: 50.0,
            io_stats: IoStats::default(),
            net_stats: NetStats::default(),
        };
        let table = "Recent metrics (last 15 min, 1-min buckets):\n  cpu_pct: 10.0 12.0";
        let prompt = w.assemble(4000, Some(table), Some(&activity));

        assert!(prompt.contains("vigil"));
        assert!(prompt.contains("Recent metrics"));
        assert!(prompt.contains("Activity"));
        let new_pos = prompt.find("new-svc").unwrap();
        let old_pos = prompt.find("old-svc").unwrap();
        assert!(new_pos < old_pos, "newest entry should come first");
    }

    #[tokio::test]
    async fn stale_activity_is_omitted() {
        let w = window(10_000);
        let stale = ActivityReport {
            collected_at: Utc::now() - Duration::minutes(30),
            cpu_pct: 12.0,
            mem_pct: 50.0,
            io_stats: IoStats::default(),
            net_stats: NetStats::default(),
        };
        let prompt = w.assemble(4000, None, Some(&stale));
        assert!(!prompt.contains("Activity"));
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip_is_identical() {
        let mut w = window(10_000);
        w.admit(trigger_entry("nginx", "failed"), None).await;
        w.admit(
            ContextEntry::new(EntryBody::ActionOutcome(ActionOutcome {
                action_id: uuid::Uuid::new_v4(),
                subject: "nginx".into(),
                kind: ActionKind::ServiceRestart,
                success: true,
                output: "restarted".into(),
                error: None,
                completed_at: Utc::now(),
            })),
            None,
        )
        .await;

        let snap = w.snapshot();
        let restored = ContextWindow::restore(10_000, 3600, 96, snap.clone());
        let snap2 = restored.snapshot();

        assert_eq!(
            serde_json::to_string(&snap.entries).unwrap(),
            serde_json::to_string(&snap2.entries).unwrap()
        );
        assert_eq!(snap.total_tokens, snap2.total_tokens);
        assert_eq!(snap.stats, snap2.stats);
    }

    #[tokio::test]
    async fn snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");

        let mut w = window(10_000);
        w.admit(trigger_entry("nginx", "failed"), None).await;
        let snap = w.snapshot();
        save_snapshot(&path, &snap).unwrap();

        let loaded = load_snapshot(&path).unwrap().unwrap();
        assert_eq!(
            serde_json::to_string(&snap.entries).unwrap(),
            serde_json::to_string(&loaded.entries).unwrap()
        );

        assert!(load_snapshot(&dir.path().join("missing.json")).unwrap().is_none());
    }

    #[tokio::test]
    async fn actor_serializes_admissions_and_snapshots() {
        let w = window(50_000);
        let (handle, task) = spawn_context(w, None, None, "macha".into());

        // Concurrent producers.
        let mut joins = Vec::new();
        for i in 0..10 {
            let h = handle.clone();
            joins.push(tokio::spawn(async move {
                h.admit(trigger_entry(&format!("svc{i}"), "event")).await
            }));
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.entries.len(), 11); // header + 10

        let prompt = handle.assemble(2000).await.unwrap();
        assert!(prompt.contains("Recent events"));

        drop(handle);
        let final_window = task.await.unwrap();
        assert_eq!(final_window.len(), 11);
    }

    #[test]
    fn metrics_table_formats_series() {
        let now = Utc::now();
        let table = format_metrics_table(&[
            ("cpu_pct".into(), vec![(now, 10.0), (now, 12.5)]),
            ("load1".into(), vec![]),
        ])
        .unwrap();
        assert!(table.contains("cpu_pct: 10.0 12.5"));
        assert!(!table.contains("load1"));

        assert!(format_metrics_table(&[("cpu_pct".into(), vec![])]).is_none());
    }
}
