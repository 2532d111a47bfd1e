//! Component lifetimes and wiring.
//!
//! Independent workers run concurrently: the trigger timer, the review
//! timer (skip-if-busy), the meta escalation worker and the executor's
//! action worker on bounded channels, plus a snapshot timer. All shared
//! state flows through the context actor, the executor, and the stores;
//! shutdown drains each worker cooperatively.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use vg_core::config::Config;
use vg_core::shutdown::ShutdownSignal;
use vg_core::types::{ContextEntry, EntryBody, ProposedAction, Severity, TriggerEvent};
use vg_intelligence::llm::{HttpLlmClient, TierClient};
use vg_intelligence::meta::MetaReasoner;
use vg_intelligence::review::{EscalationGate, EscalationRequest, ReviewOutcome, ReviewReasoner};
use vg_stores::{MetricsStore, SemanticStore, SqliteMetricsStore, SqliteSemanticStore, SystemRecord};

use crate::activity::{ActivitySource, SarActivitySource};
use crate::context::{
    load_snapshot, save_snapshot, spawn_context, ContextHandle, ContextWindow,
};
use crate::executor::{Executor, ShellRunner, SubmitOutcome};
use crate::issues::IssueTracker;
use crate::journal::ShellJournalReader;
use crate::logs::JsonlLog;
use crate::notifier::{HttpNotifier, NotifySink, Priority};
use crate::probe::{ProcMetricProbe, ServiceProbe, SystemctlProbe};
use crate::queue::ApprovalQueue;
use crate::trigger::TriggerLoop;

const CONTEXT_SNAPSHOT_FILE: &str = "context_snapshot.json";
const ESCALATION_CHANNEL_DEPTH: usize = 8;
const ACTION_CHANNEL_DEPTH: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Shared worker context
// ---------------------------------------------------------------------------

/// The handles every worker needs.
#[derive(Clone)]
struct Shared {
    context: ContextHandle,
    executor: Arc<Executor>,
    issues: Arc<IssueTracker>,
    notifier: Arc<dyn NotifySink>,
    decisions_log: JsonlLog,
    shutdown: ShutdownSignal,
}

/// Route one proposed action through the executor and record the result
/// everywhere it belongs.
async fn dispatch_action(shared: &Shared, action: ProposedAction) {
    let subject = action.subject.clone();
    match shared.executor.submit(action).await {
        SubmitOutcome::Executed(outcome) => {
            if let Err(e) = shared.issues.record_outcome(&outcome).await {
                warn!(error = %e, "issue outcome record failed");
            }
            if let Err(e) = shared
                .context
                .admit(ContextEntry::new(EntryBody::ActionOutcome(outcome)))
                .await
            {
                warn!(error = %e, "context admit failed for action outcome");
            }
        }
        SubmitOutcome::Queued(id) => {
            info!(queue_id = id, subject = %subject, "action queued for approval");
            shared
                .notifier
                .notify(
                    "vigil: action awaiting approval",
                    &format!("[{id}] {subject}: review with `vg approve list`"),
                    Priority::Medium,
                )
                .await;
        }
        SubmitOutcome::Duplicate => {
            info!(subject = %subject, "duplicate proposal suppressed");
        }
        SubmitOutcome::Rejected { reason } => {
            shared
                .notifier
                .notify("vigil: action rejected by policy", &reason, Priority::High)
                .await;
        }
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn trigger_worker(
    mut trigger: TriggerLoop,
    metrics: Arc<dyn MetricsStore>,
    activity: Arc<dyn ActivitySource>,
    shared: Shared,
    interval_s: u64,
    retention_days: u32,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_s));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // consume the immediate first tick

    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut last_eviction = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = trigger.tick(metrics.as_ref()).await;

                for event in &report.admitted {
                    if let Err(e) = shared.issues.record_event(event).await {
                        warn!(error = %e, "issue record failed");
                    }
                    if event.severity == Severity::Critical {
                        shared
                            .notifier
                            .notify("vigil: critical trigger", &event.reason, Priority::High)
                            .await;
                    }
                    if let Err(e) = shared
                        .context
                        .admit(ContextEntry::new(EntryBody::Trigger(event.clone())))
                        .await
                    {
                        warn!(error = %e, "context admit failed");
                    }
                }

                for service in &report.recovered {
                    match shared
                        .issues
                        .resolve_subject(service, "service observed active again")
                        .await
                    {
                        Ok(true) => info!(service = %service, "issue auto-resolved"),
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "auto-resolve failed"),
                    }
                }

                // Best-effort activity refresh rides the trigger cadence.
                if let Ok(Some(activity_report)) = activity.collect().await {
                    let _ = shared.context.set_activity(activity_report).await;
                }

                // Retention enforcement, hourly.
                if last_eviction.elapsed() >= Duration::from_secs(3600) {
                    last_eviction = tokio::time::Instant::now();
                    match metrics
                        .evict_older_than(chrono::Duration::days(retention_days as i64))
                        .await
                    {
                        Ok(removed) if removed > 0 => {
                            info!(removed, "metric samples evicted past retention")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "metric eviction failed"),
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    shared.shutdown.confirm_drained();
    info!("trigger worker drained");
}

async fn review_worker(
    mut review: ReviewReasoner,
    mut gate: EscalationGate,
    action_tx: mpsc::Sender<ProposedAction>,
    escalation_tx: mpsc::Sender<EscalationRequest>,
    shared: Shared,
    interval_s: u64,
    prompt_budget: usize,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_s));
    // A cycle that overruns its interval drops the missed ticks instead of
    // queueing them.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut shutdown_rx = shared.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let prompt = match shared.context.assemble(prompt_budget).await {
                    Ok(prompt) => prompt,
                    Err(e) => {
                        warn!(error = %e, "context assembly failed, skipping cycle");
                        continue;
                    }
                };
                let outcome = match review.run(&prompt).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(error = %e, "review cycle failed");
                        continue;
                    }
                };
                handle_review_outcome(&shared, &mut gate, &action_tx, &escalation_tx, outcome).await;
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    shared.shutdown.confirm_drained();
    info!("review worker drained");
}

async fn handle_review_outcome(
    shared: &Shared,
    gate: &mut EscalationGate,
    action_tx: &mpsc::Sender<ProposedAction>,
    escalation_tx: &mpsc::Sender<EscalationRequest>,
    outcome: ReviewOutcome,
) {
    let issues_found = outcome.issues.len();
    let actions_proposed = outcome.actions.len();
    if let Err(e) = shared.decisions_log.append(&serde_json::json!({
        "at": Utc::now(),
        "tier": "review",
        "status": outcome.status.to_string(),
        "assessment": outcome.assessment.clone(),
        "issues": outcome.issues,
        "actions": actions_proposed,
        "escalate": outcome.escalate,
    })) {
        warn!(error = %e, "decisions log append failed");
    }

    // Deposit actions on the executor's channel in declared order; a full
    // channel suspends this producer rather than dropping work.
    for action in outcome.actions {
        if action_tx.send(action).await.is_err() {
            warn!("executor channel closed, dropping remaining actions");
            break;
        }
    }

    if outcome.escalate {
        match gate.admit(&outcome.escalation_reason) {
            Some(request) => {
                if escalation_tx.try_send(request).is_err() {
                    warn!("escalation channel full, dropping request");
                }
            }
            None => info!("escalation suppressed within cooldown"),
        }
    }

    let summary = ContextEntry::new(EntryBody::ReviewSummary {
        status: outcome.status.to_string(),
        assessment: outcome.assessment,
        issues_found,
        actions_proposed,
        escalated: outcome.escalate,
    });
    if let Err(e) = shared.context.admit(summary).await {
        warn!(error = %e, "context admit failed for review summary");
    }
}

async fn meta_worker(
    mut meta: MetaReasoner,
    mut escalation_rx: mpsc::Receiver<EscalationRequest>,
    action_tx: mpsc::Sender<ProposedAction>,
    semantic: Arc<dyn SemanticStore>,
    shared: Shared,
    prompt_budget: usize,
    history_k: usize,
) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            request = escalation_rx.recv() => {
                let Some(request) = request else { break };
                handle_escalation(
                    &mut meta,
                    &request,
                    &action_tx,
                    semantic.as_ref(),
                    &shared,
                    prompt_budget,
                    history_k,
                )
                .await;
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    shared.shutdown.confirm_drained();
    info!("meta worker drained");
}

async fn handle_escalation(
    meta: &mut MetaReasoner,
    request: &EscalationRequest,
    action_tx: &mpsc::Sender<ProposedAction>,
    semantic: &dyn SemanticStore,
    shared: &Shared,
    prompt_budget: usize,
    history_k: usize,
) {
    let prompt = match shared.context.assemble(prompt_budget).await {
        Ok(prompt) => prompt,
        Err(e) => {
            warn!(error = %e, "context assembly failed for escalation");
            return;
        }
    };
    let history = semantic
        .query_issues(&request.reason, history_k)
        .await
        .unwrap_or_default();
    let knowledge = semantic
        .query_knowledge(&request.reason, history_k)
        .await
        .unwrap_or_default();

    let outcome = match meta
        .analyze(&request.reason, &prompt, &history, &knowledge)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "meta analysis failed");
            return;
        }
    };

    if let Err(e) = shared.decisions_log.append(&serde_json::json!({
        "at": Utc::now(),
        "tier": "meta",
        "reason": request.reason,
        "actions": outcome.actions.len(),
        "analysis": outcome.analysis,
    })) {
        warn!(error = %e, "decisions log append failed");
    }

    for action in outcome.actions {
        if action_tx.send(action).await.is_err() {
            warn!("executor channel closed, dropping remaining actions");
            break;
        }
    }

    let entry = ContextEntry::new(EntryBody::MetaAnalysis {
        escalation_reason: request.reason.clone(),
        analysis: outcome.analysis,
    });
    if let Err(e) = shared.context.admit(entry).await {
        warn!(error = %e, "context admit failed for meta analysis");
    }

    shared
        .notifier
        .notify(
            "vigil: meta analysis complete",
            &format!("escalation: {}", request.reason),
            Priority::High,
        )
        .await;
}

/// The executor's own scheduler: actions arrive on a bounded channel and
/// run strictly in arrival order.
async fn action_worker(mut action_rx: mpsc::Receiver<ProposedAction>, shared: Shared) {
    while let Some(action) = action_rx.recv().await {
        dispatch_action(&shared, action).await;
    }
    shared.shutdown.confirm_drained();
    info!("action worker drained");
}

async fn snapshot_worker(shared: Shared, path: PathBuf, interval_minutes: u64) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(interval_minutes.max(1) * 60));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut shutdown_rx = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match shared.context.snapshot().await {
                    Ok(snapshot) => {
                        if let Err(e) = save_snapshot(&path, &snapshot) {
                            warn!(error = %e, "context snapshot write failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "context snapshot failed"),
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    shared.shutdown.confirm_drained();
    info!("snapshot worker drained");
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: Config,
    host: String,
    shared: Shared,
    metrics: Arc<dyn MetricsStore>,
    semantic: Arc<dyn SemanticStore>,
    trigger: TriggerLoop,
    review: ReviewReasoner,
    gate: EscalationGate,
    meta: MetaReasoner,
    activity: Arc<dyn ActivitySource>,
    context_task: tokio::task::JoinHandle<ContextWindow>,
    snapshot_path: PathBuf,
}

impl Orchestrator {
    /// Build every component from configuration, restoring persisted state.
    pub async fn build(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let host = config.hostname();
        let state_dir = config.state_dir();
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("creating state dir {}", state_dir.display()))?;

        // Stores.
        let metrics: Arc<dyn MetricsStore> = Arc::new(
            SqliteMetricsStore::new(&config.metrics.db_path)
                .await
                .context("opening metrics store")?,
        );
        let semantic: Arc<dyn SemanticStore> = Arc::new(
            SqliteSemanticStore::new(state_dir.join("semantic.db"))
                .await
                .context("opening semantic store")?,
        );

        // Tier clients.
        let trigger_tier = TierClient::new(
            Arc::new(HttpLlmClient::new(&config.triggers.backend_url)),
            &config.triggers.model,
            256,
            Duration::from_secs(config.triggers.timeout_s),
            1,
        );
        let review_tier = TierClient::new(
            Arc::new(HttpLlmClient::new(&config.review.backend_url)),
            &config.review.model,
            2048,
            Duration::from_secs(config.review.timeout_s),
            2,
        );
        let meta_tier = TierClient::new(
            Arc::new(HttpLlmClient::new(&config.meta.backend_url)),
            &config.meta.model,
            8192,
            Duration::from_secs(config.meta.timeout_s),
            2,
        );

        // Context window: restore the snapshot when one exists.
        let snapshot_path = state_dir.join(CONTEXT_SNAPSHOT_FILE);
        let window = match load_snapshot(&snapshot_path) {
            Ok(Some(snapshot)) => {
                info!(entries = snapshot.entries.len(), "context window restored");
                ContextWindow::restore(
                    config.context.budget_tokens,
                    config.context.soft_age_s,
                    config.context.summary_target_tokens,
                    snapshot,
                )
            }
            Ok(None) => ContextWindow::new(
                config.context.budget_tokens,
                config.context.soft_age_s,
                config.context.summary_target_tokens,
                ContextEntry::new(EntryBody::SystemHeader {
                    host: host.clone(),
                    autonomy: config.executor.autonomy_level,
                }),
            ),
            Err(e) => {
                warn!(error = %e, "context snapshot unreadable, starting fresh");
                ContextWindow::new(
                    config.context.budget_tokens,
                    config.context.soft_age_s,
                    config.context.summary_target_tokens,
                    ContextEntry::new(EntryBody::SystemHeader {
                        host: host.clone(),
                        autonomy: config.executor.autonomy_level,
                    }),
                )
            }
        };
        let (context, context_task) = spawn_context(
            window,
            Some(trigger_tier.clone()),
            Some(Arc::clone(&metrics)),
            host.clone(),
        );

        // Executor over the restored queue.
        let service_probe: Arc<dyn ServiceProbe> = Arc::new(SystemctlProbe);
        let queue = ApprovalQueue::load(&state_dir).context("restoring approval queue")?;
        let executor = Arc::new(Executor::new(
            config.executor.autonomy_level,
            config.executor.protected_services.clone(),
            Duration::from_secs(config.executor.action_timeout_s),
            config.executor.queue_pause_depth,
            Arc::new(ShellRunner),
            Arc::clone(&service_probe),
            &state_dir,
            queue,
        ));

        let issues = Arc::new(IssueTracker::new(Arc::clone(&semantic), host.clone()));
        let notifier: Arc<dyn NotifySink> = Arc::new(HttpNotifier::new(&config.notify));

        // Register ourselves in the system registry.
        let record = SystemRecord {
            hostname: host.clone(),
            system_type: "host".into(),
            services: config.triggers.critical_services.clone(),
            capabilities: vec!["monitoring".into(), "remediation".into()],
            registered_at: Utc::now(),
        };
        if let Err(e) = semantic.upsert_system(&record).await {
            warn!(error = %e, "system registration failed");
        }

        let trigger = TriggerLoop::new(
            config.triggers.clone(),
            host.clone(),
            Arc::new(ProcMetricProbe::new()),
            service_probe,
            Box::new(ShellJournalReader::new()),
            Some(trigger_tier),
        );

        let shared = Shared {
            context,
            executor,
            issues,
            notifier,
            decisions_log: JsonlLog::new(state_dir.join("decisions.jsonl")),
            shutdown: ShutdownSignal::new(),
        };

        Ok(Self {
            host,
            shared,
            metrics,
            semantic,
            trigger,
            review: ReviewReasoner::new(review_tier),
            gate: EscalationGate::new(chrono::Duration::seconds(
                config.review.escalation_cooldown_s as i64,
            )),
            meta: MetaReasoner::new(meta_tier),
            activity: Arc::new(SarActivitySource),
            context_task,
            snapshot_path,
            config,
        })
    }

    /// Run until ctrl-c (or SIGTERM via the caller), then drain and
    /// snapshot.
    pub async fn run(self) -> Result<()> {
        info!(
            host = %self.host,
            autonomy = %self.config.executor.autonomy_level,
            trigger_interval_s = self.config.triggers.interval_s,
            review_interval_s = self.config.review.interval_s,
            "vigil daemon starting"
        );

        let (escalation_tx, escalation_rx) = mpsc::channel(ESCALATION_CHANNEL_DEPTH);
        let (action_tx, action_rx) = mpsc::channel(ACTION_CHANNEL_DEPTH);

        let trigger_handle = tokio::spawn(trigger_worker(
            self.trigger,
            Arc::clone(&self.metrics),
            Arc::clone(&self.activity),
            self.shared.clone(),
            self.config.triggers.interval_s,
            self.config.metrics.retention_days,
        ));
        let review_handle = tokio::spawn(review_worker(
            self.review,
            self.gate,
            action_tx.clone(),
            escalation_tx,
            self.shared.clone(),
            self.config.review.interval_s,
            self.config.review.context_tokens,
        ));
        let meta_handle = tokio::spawn(meta_worker(
            self.meta,
            escalation_rx,
            action_tx,
            Arc::clone(&self.semantic),
            self.shared.clone(),
            self.config.meta.context_tokens,
            self.config.meta.history_k,
        ));
        let action_handle = tokio::spawn(action_worker(action_rx, self.shared.clone()));
        let snapshot_handle = tokio::spawn(snapshot_worker(
            self.shared.clone(),
            self.snapshot_path.clone(),
            self.config.context.snapshot_interval_minutes,
        ));

        let mut shutdown = self.shared.shutdown.clone();
        tokio::signal::ctrl_c()
            .await
            .context("listening for ctrl-c")?;
        info!("interrupt received, shutting down");
        shutdown.trigger();

        if !shutdown.wait_for_drain(5, SHUTDOWN_GRACE).await {
            warn!("forcing shutdown after grace period");
        }
        for handle in [
            trigger_handle,
            review_handle,
            meta_handle,
            action_handle,
            snapshot_handle,
        ] {
            handle.abort();
        }

        // Final snapshot before the actor goes away.
        match self.shared.context.snapshot().await {
            Ok(snapshot) => {
                if let Err(e) = save_snapshot(&self.snapshot_path, &snapshot) {
                    warn!(error = %e, "final context snapshot failed");
                }
            }
            Err(e) => warn!(error = %e, "final context snapshot failed"),
        }
        drop(self.shared);
        let _ = self.context_task.await;

        info!("vigil daemon stopped");
        Ok(())
    }

    /// One-shot check: a single trigger tick followed by a meta analysis
    /// of the resulting context (`vg check`).
    pub async fn run_once(mut self) -> Result<CheckReport> {
        let tick = self.trigger.tick(self.metrics.as_ref()).await;
        let mut admitted = Vec::new();
        for event in &tick.admitted {
            if let Err(e) = self.shared.issues.record_event(event).await {
                warn!(error = %e, "issue record failed");
            }
            let _ = self
                .shared
                .context
                .admit(ContextEntry::new(EntryBody::Trigger(event.clone())))
                .await;
            admitted.push(event.clone());
        }

        let prompt = self
            .shared
            .context
            .assemble(self.config.meta.context_tokens)
            .await
            .context("assembling context")?;

        let history = self
            .semantic
            .query_issues("current host state", self.config.meta.history_k)
            .await
            .unwrap_or_default();
        let outcome = self
            .meta
            .analyze("operator-requested check", &prompt, &history, &[])
            .await
            .context("meta analysis")?;

        for action in outcome.actions.clone() {
            dispatch_action(&self.shared, action).await;
        }

        Ok(CheckReport {
            admitted,
            analysis: outcome.analysis,
            actions_proposed: outcome.actions.len(),
        })
    }
}

/// Result of `vg check`.
pub struct CheckReport {
    pub admitted: Vec<TriggerEvent>,
    pub analysis: String,
    pub actions_proposed: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::spawn_context;
    use crate::executor::MockRunner;
    use crate::journal::MockJournal;
    use crate::notifier::MemorySink;
    use crate::probe::{MockMetricProbe, MockServiceProbe, SystemSnapshot};
    use vg_core::config::TriggerConfig;
    use vg_core::types::{ActionKind, AutonomyLevel, IssueStatus};
    use vg_intelligence::llm::MockLlm;
    use vg_stores::SqliteSemanticStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        shared: Shared,
        trigger: TriggerLoop,
        review: ReviewReasoner,
        gate: EscalationGate,
        meta: MetaReasoner,
        semantic: Arc<dyn SemanticStore>,
        metrics: Arc<dyn MetricsStore>,
        runner: Arc<MockRunner>,
        probe: Arc<MockServiceProbe>,
        sink: Arc<MemorySink>,
    }

    async fn fixture(
        autonomy: AutonomyLevel,
        review_reply: &str,
        meta_reply: &str,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let metrics: Arc<dyn MetricsStore> =
            Arc::new(vg_stores::SqliteMetricsStore::new_in_memory().await.unwrap());
        let semantic: Arc<dyn SemanticStore> =
            Arc::new(SqliteSemanticStore::new_in_memory().await.unwrap());

        let probe = Arc::new(MockServiceProbe::new().with_state("nginx", "failed"));
        let runner = Arc::new(MockRunner::new());
        let sink = Arc::new(MemorySink::new());

        let window = ContextWindow::new(
            50_000,
            3600,
            96,
            ContextEntry::new(EntryBody::SystemHeader {
                host: "macha".into(),
                autonomy,
            }),
        );
        let (context, _task) = spawn_context(window, None, Some(Arc::clone(&metrics)), "macha".into());

        let queue = ApprovalQueue::load(dir.path()).unwrap();
        let executor = Arc::new(Executor::new(
            autonomy,
            vg_core::config::ExecutorConfig::default().protected_services,
            Duration::from_secs(30),
            25,
            Arc::clone(&runner) as _,
            Arc::clone(&probe) as _,
            dir.path(),
            queue,
        ));
        let issues = Arc::new(IssueTracker::new(Arc::clone(&semantic), "macha"));

        let mut trigger_config = TriggerConfig::default();
        trigger_config.critical_services = vec!["nginx".into()];
        trigger_config.use_trigger_model = false;
        let trigger = TriggerLoop::new(
            trigger_config,
            "macha",
            Arc::new(MockMetricProbe::new(SystemSnapshot {
                cpu_pct: 10.0,
                mem_pct: 40.0,
                load1: 0.5,
                cores: 8,
                disk_pct: 50.0,
            })),
            Arc::clone(&probe) as _,
            Box::new(MockJournal::new()),
            None,
        );

        let review_mock = Arc::new(MockLlm::new().with_response(review_reply));
        let review = ReviewReasoner::new(TierClient::new(
            review_mock,
            "review",
            2048,
            Duration::from_secs(5),
            0,
        ));
        let meta_mock = Arc::new(MockLlm::new().with_response(meta_reply));
        let meta = MetaReasoner::new(TierClient::new(
            meta_mock,
            "meta",
            4096,
            Duration::from_secs(5),
            0,
        ));

        let shared = Shared {
            context,
            executor,
            issues,
            notifier: Arc::clone(&sink) as Arc<dyn NotifySink>,
            decisions_log: JsonlLog::new(dir.path().join("decisions.jsonl")),
            shutdown: ShutdownSignal::new(),
        };

        Fixture {
            _dir: dir,
            shared,
            trigger,
            review,
            gate: EscalationGate::new(chrono::Duration::minutes(10)),
            meta,
            semantic,
            metrics,
            runner,
            probe,
            sink,
        }
    }

    const RESTART_REPLY: &str = r#"{
        "status": "attention_needed",
        "assessment": "nginx failed and needs a restart",
        "issues": [{"severity": "warning", "category": "service", "description": "nginx down"}],
        "actions": [{
            "subject": "nginx",
            "description": "restart the failed unit",
            "action_kind": "service_restart",
            "commands": ["systemctl restart nginx"],
            "risk": "low",
            "rationale": "clean restart expected",
            "rollback_plan": null
        }],
        "escalate": false,
        "escalation_reason": ""
    }"#;

    const ESCALATE_REPLY: &str = r#"{
        "status": "critical",
        "assessment": "several services are degrading at once",
        "issues": [],
        "actions": [],
        "escalate": true,
        "escalation_reason": "multi-service failure"
    }"#;

    const STOP_SSHD_REPLY: &str = r#"{
        "status": "attention_needed",
        "assessment": "misguided advice",
        "issues": [],
        "actions": [{
            "subject": "sshd",
            "description": "stop sshd",
            "action_kind": "service_restart",
            "commands": ["systemctl stop sshd"],
            "risk": "low",
            "rationale": "",
            "rollback_plan": null
        }],
        "escalate": false,
        "escalation_reason": ""
    }"#;

    #[tokio::test]
    async fn failed_service_is_restarted_under_auto_safe() {
        let mut fx = fixture(AutonomyLevel::AutoSafe, RESTART_REPLY, "analysis").await;

        // Tick: the failed service becomes a trigger event + issue.
        let tick = fx.trigger.tick(fx.metrics.as_ref()).await;
        assert_eq!(tick.admitted.len(), 1);
        for event in &tick.admitted {
            fx.shared.issues.record_event(event).await.unwrap();
            fx.shared
                .context
                .admit(ContextEntry::new(EntryBody::Trigger(event.clone())))
                .await
                .unwrap();
        }

        // Review cycle proposes the restart; dispatch executes it.
        let prompt = fx.shared.context.assemble(8_000).await.unwrap();
        assert!(prompt.contains("nginx"));
        let outcome = fx.review.run(&prompt).await.unwrap();
        let (action_tx, mut action_rx) = mpsc::channel(8);
        let (escalation_tx, _escalation_rx) = mpsc::channel(4);
        handle_review_outcome(&fx.shared, &mut fx.gate, &action_tx, &escalation_tx, outcome).await;
        while let Ok(action) = action_rx.try_recv() {
            dispatch_action(&fx.shared, action).await;
        }

        assert_eq!(fx.runner.calls(), vec!["systemctl restart nginx"]);

        // The outcome landed in the context window and on the issue.
        let snapshot = fx.shared.context.snapshot().await.unwrap();
        assert!(snapshot
            .entries
            .iter()
            .any(|e| matches!(e.body, EntryBody::ActionOutcome(_))));
        assert!(snapshot
            .entries
            .iter()
            .any(|e| matches!(e.body, EntryBody::ReviewSummary { .. })));

        let issues = fx.semantic.list_issues(Some("macha"), None).await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].actions.len(), 1);

        // Next tick observes recovery and the issue resolves.
        fx.probe.set_state("nginx", "active");
        let tick = fx.trigger.tick(fx.metrics.as_ref()).await;
        assert_eq!(tick.recovered, vec!["nginx".to_string()]);
        fx.shared
            .issues
            .resolve_subject("nginx", "service observed active again")
            .await
            .unwrap();
        let issues = fx.semantic.list_issues(Some("macha"), None).await.unwrap();
        assert_eq!(issues[0].status, IssueStatus::Resolved);
    }

    #[tokio::test]
    async fn protected_stop_is_rejected_and_notified() {
        let mut fx = fixture(AutonomyLevel::AutoFull, STOP_SSHD_REPLY, "analysis").await;

        let outcome = fx.review.run("context").await.unwrap();
        let (action_tx, mut action_rx) = mpsc::channel(8);
        let (escalation_tx, _escalation_rx) = mpsc::channel(4);
        handle_review_outcome(&fx.shared, &mut fx.gate, &action_tx, &escalation_tx, outcome).await;
        while let Ok(action) = action_rx.try_recv() {
            dispatch_action(&fx.shared, action).await;
        }

        // Nothing executed, nothing queued, high-priority notification sent.
        assert!(fx.runner.calls().is_empty());
        assert!(fx.shared.executor.list_queue().await.is_empty());
        let sent = fx.sink.sent();
        assert!(sent
            .iter()
            .any(|(title, _, prio)| title.contains("rejected") && *prio == Priority::High));
    }

    #[tokio::test]
    async fn escalation_reaches_meta_once_within_cooldown() {
        let mut fx = fixture(AutonomyLevel::Suggest, ESCALATE_REPLY, "deep analysis").await;
        let (action_tx, _action_rx) = mpsc::channel(8);
        let (escalation_tx, mut escalation_rx) = mpsc::channel(4);

        let outcome = fx.review.run("context").await.unwrap();
        handle_review_outcome(&fx.shared, &mut fx.gate, &action_tx, &escalation_tx, outcome).await;

        let request = escalation_rx.try_recv().expect("escalation should be enqueued");
        assert_eq!(request.reason, "multi-service failure");

        handle_escalation(
            &mut fx.meta,
            &request,
            &action_tx,
            fx.semantic.as_ref(),
            &fx.shared,
            8_000,
            3,
        )
        .await;

        let snapshot = fx.shared.context.snapshot().await.unwrap();
        assert!(snapshot
            .entries
            .iter()
            .any(|e| matches!(e.body, EntryBody::MetaAnalysis { .. })));

        // A second identical escalation within the cooldown is suppressed.
        let review_mock = Arc::new(MockLlm::new().with_response(ESCALATE_REPLY));
        let mut review2 = ReviewReasoner::new(TierClient::new(
            review_mock,
            "review",
            2048,
            Duration::from_secs(5),
            0,
        ));
        let outcome = review2.run("context").await.unwrap();
        handle_review_outcome(&fx.shared, &mut fx.gate, &action_tx, &escalation_tx, outcome).await;
        assert!(escalation_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn meta_actions_flow_through_the_gate() {
        let meta_reply = "Root cause found.\n```action\n{\"subject\": \"nginx\", \"description\": \"restart\", \"action_kind\": \"service_restart\", \"commands\": [\"systemctl restart nginx\"], \"risk\": \"low\", \"rationale\": \"\", \"rollback_plan\": null}\n```";
        let mut fx = fixture(AutonomyLevel::Suggest, ESCALATE_REPLY, meta_reply).await;

        let request = EscalationRequest {
            key: "x".into(),
            reason: "x".into(),
            requested_at: Utc::now(),
        };
        let (action_tx, mut action_rx) = mpsc::channel(8);
        handle_escalation(
            &mut fx.meta,
            &request,
            &action_tx,
            fx.semantic.as_ref(),
            &fx.shared,
            8_000,
            3,
        )
        .await;
        while let Ok(action) = action_rx.try_recv() {
            dispatch_action(&fx.shared, action).await;
        }

        // Suggest level: the meta action is queued, not executed.
        assert!(fx.runner.calls().is_empty());
        let queued = fx.shared.executor.list_queue().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action.kind, ActionKind::ServiceRestart);
    }
}
