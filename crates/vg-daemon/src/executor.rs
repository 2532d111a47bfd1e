//! Policy-gated action execution.
//!
//! Every proposed action flows through the same pipeline: protected-service
//! policy check, autonomy gate (with queue-depth backpressure), then either
//! immediate execution or the approval queue. Outcomes are appended to the
//! actions log; context and issue recording belong to the caller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use vg_core::types::{
    ActionKind, ActionOutcome, AutonomyLevel, ProposedAction, QueuedAction, RiskLevel,
};

use crate::logs::JsonlLog;
use crate::probe::ServiceProbe;
use crate::queue::{ApprovalQueue, QueueError};

/// Verbs that must never be combined with a protected service.
const DESTRUCTIVE_VERBS: &[&str] = &["stop", "disable", "mask", "kill"];

/// Read-only commands an investigation action may run.
const INVESTIGATION_ALLOWLIST: &[&str] = &[
    "journalctl",
    "systemctl status",
    "df",
    "free",
    "ps",
    "ss",
    "netstat",
    "ip",
    "du",
    "uptime",
    "dmesg",
];

/// Cleanup commands considered safe to run unattended.
const CLEANUP_ALLOWLIST: &[&str] = &[
    "journalctl --vacuum",
    "nix-collect-garbage",
    "apt-get clean",
    "dnf clean",
    "pacman -Sc",
    "docker system prune",
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;

// ---------------------------------------------------------------------------
// Policy check
// ---------------------------------------------------------------------------

/// Reject any command that names a protected service together with a
/// destructive verb. Matching is token-exact so `restart sshd` passes
/// while `stop sshd` and `disable sshd.service` do not.
pub fn policy_check(action: &ProposedAction, protected: &[String]) -> std::result::Result<(), String> {
    for command in &action.commands {
        let tokens: Vec<String> = command
            .split_whitespace()
            .map(|t| t.trim_end_matches(".service").to_lowercase())
            .collect();
        let has_verb = tokens
            .iter()
            .any(|t| DESTRUCTIVE_VERBS.contains(&t.as_str()));
        if !has_verb {
            continue;
        }
        if let Some(service) = protected
            .iter()
            .find(|svc| tokens.iter().any(|t| t == &svc.to_lowercase()))
        {
            return Err(format!(
                "command touches protected service {service} destructively: {command}"
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Autonomy gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Execute,
    Queue,
}

/// The four-level gate from the policy table. Backpressure is applied on
/// top of this by the executor itself.
pub fn autonomy_gate(risk: RiskLevel, level: AutonomyLevel) -> GateDecision {
    match level {
        AutonomyLevel::Observe | AutonomyLevel::Suggest => GateDecision::Queue,
        AutonomyLevel::AutoSafe => {
            if risk == RiskLevel::Low {
                GateDecision::Execute
            } else {
                GateDecision::Queue
            }
        }
        AutonomyLevel::AutoFull => {
            if risk <= RiskLevel::Medium {
                GateDecision::Execute
            } else {
                GateDecision::Queue
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Command runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("spawn failed: {0}")]
    Spawn(String),
}

/// Seam for shell execution, mockable in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration)
        -> std::result::Result<CommandOutput, RunError>;
}

/// Runs commands through `sh -c` with a hard timeout.
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> std::result::Result<CommandOutput, RunError> {
        let future = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| RunError::Timeout(timeout))?
            .map_err(|e| RunError::Spawn(e.to_string()))?;
        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Scripted runner for tests: records calls, returns per-command results,
/// defaults to success.
#[derive(Default)]
pub struct MockRunner {
    calls: std::sync::Mutex<Vec<String>>,
    failures: std::sync::Mutex<Vec<String>>,
    timeouts: std::sync::Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure(self, command: &str) -> Self {
        self.failures.lock().unwrap().push(command.to_string());
        self
    }

    pub fn with_timeout(self, command: &str) -> Self {
        self.timeouts.lock().unwrap().push(command.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> std::result::Result<CommandOutput, RunError> {
        self.calls.lock().unwrap().push(command.to_string());
        if self.timeouts.lock().unwrap().iter().any(|c| c == command) {
            return Err(RunError::Timeout(timeout));
        }
        let fails = self.failures.lock().unwrap().iter().any(|c| c == command);
        Ok(CommandOutput {
            success: !fails,
            exit_code: Some(if fails { 1 } else { 0 }),
            stdout: format!("ran: {command}"),
            stderr: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Result of submitting an action to the gate.
#[derive(Debug)]
pub enum SubmitOutcome {
    Executed(ActionOutcome),
    Queued(u64),
    /// A matching pending entry already exists.
    Duplicate,
    /// Policy violation. Terminal for the action.
    Rejected { reason: String },
}

pub struct Executor {
    autonomy: AutonomyLevel,
    protected: Vec<String>,
    timeout: Duration,
    queue_pause_depth: usize,
    runner: Arc<dyn CommandRunner>,
    service_probe: Arc<dyn ServiceProbe>,
    state_dir: PathBuf,
    queue: Mutex<ApprovalQueue>,
    actions_log: JsonlLog,
}

impl Executor {
    pub fn new(
        autonomy: AutonomyLevel,
        protected: Vec<String>,
        timeout: Duration,
        queue_pause_depth: usize,
        runner: Arc<dyn CommandRunner>,
        service_probe: Arc<dyn ServiceProbe>,
        state_dir: impl Into<PathBuf>,
        queue: ApprovalQueue,
    ) -> Self {
        let state_dir = state_dir.into();
        let actions_log = JsonlLog::new(state_dir.join("actions.jsonl"));
        Self {
            autonomy,
            protected,
            timeout,
            queue_pause_depth,
            runner,
            service_probe,
            state_dir,
            queue: Mutex::new(queue),
            actions_log,
        }
    }

    pub fn autonomy(&self) -> AutonomyLevel {
        self.autonomy
    }

    /// Gate and (maybe) run a proposed action.
    pub async fn submit(&self, action: ProposedAction) -> SubmitOutcome {
        if let Err(reason) = policy_check(&action, &self.protected) {
            warn!(subject = %action.subject, %reason, "action rejected by policy");
            self.log_event("policy_rejected", &action, Some(&reason));
            return SubmitOutcome::Rejected { reason };
        }

        // Backpressure: a deep queue pauses all auto-execution.
        let paused = {
            let queue = self.queue.lock().await;
            queue.pending_depth() >= self.queue_pause_depth
        };
        let decision = if paused {
            warn!(subject = %action.subject, "queue depth exceeded, forcing pending");
            GateDecision::Queue
        } else {
            autonomy_gate(action.risk, self.autonomy)
        };

        match decision {
            GateDecision::Execute => {
                let outcome = self.execute(&action).await;
                SubmitOutcome::Executed(outcome)
            }
            GateDecision::Queue => {
                let mut queue = self.queue.lock().await;
                match queue.enqueue(action) {
                    Ok(id) => SubmitOutcome::Queued(id),
                    Err(QueueError::Duplicate(_)) => SubmitOutcome::Duplicate,
                    Err(e) => {
                        warn!(error = %e, "failed to queue action");
                        SubmitOutcome::Rejected {
                            reason: format!("queue error: {e}"),
                        }
                    }
                }
            }
        }
    }

    /// Approve a queued action: re-validate its target, execute, and record
    /// the terminal status.
    pub async fn approve(&self, id: u64) -> Result<ActionOutcome> {
        let action = {
            let mut queue = self.queue.lock().await;
            queue.approve(id)?
        };
        // The queue lock is released before any command runs.

        let outcome = match self.revalidate(&action).await {
            Ok(()) => self.execute(&action).await,
            Err(reason) => {
                warn!(subject = %action.subject, %reason, "approved action failed re-validation");
                let outcome = ActionOutcome {
                    action_id: action.id,
                    subject: action.subject.clone(),
                    kind: action.kind,
                    success: false,
                    output: String::new(),
                    error: Some(reason),
                    completed_at: Utc::now(),
                };
                self.log_outcome(&outcome);
                outcome
            }
        };

        let mut queue = self.queue.lock().await;
        queue.mark_finished(id, outcome.success)?;
        Ok(outcome)
    }

    pub async fn reject(&self, id: u64) -> Result<()> {
        let mut queue = self.queue.lock().await;
        queue.reject(id)?;
        Ok(())
    }

    pub async fn discuss(&self, id: u64, note: &str) -> Result<()> {
        let mut queue = self.queue.lock().await;
        queue.discuss(id, note)?;
        Ok(())
    }

    pub async fn list_queue(&self) -> Vec<QueuedAction> {
        self.queue.lock().await.list().to_vec()
    }

    pub async fn pending_depth(&self) -> usize {
        self.queue.lock().await.pending_depth()
    }

    /// A queued action's target may be gone by approval time; check before
    /// executing rather than running blind.
    async fn revalidate(&self, action: &ProposedAction) -> std::result::Result<(), String> {
        if action.kind != ActionKind::ServiceRestart {
            return Ok(());
        }
        match self.service_probe.unit_exists(&action.subject).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!(
                "target unit {} no longer present",
                action.subject
            )),
            // Probe trouble is not grounds to block an approved action.
            Err(e) => {
                warn!(error = %e, "re-validation probe failed, proceeding");
                Ok(())
            }
        }
    }

    /// Run an already-gated action and record its outcome.
    async fn execute(&self, action: &ProposedAction) -> ActionOutcome {
        info!(
            subject = %action.subject,
            kind = %action.kind,
            risk = %action.risk,
            "executing action"
        );
        let (success, output, error) = match action.kind {
            ActionKind::ServiceRestart => self.run_commands(&action.commands, None).await,
            ActionKind::Cleanup => {
                self.run_commands(&action.commands, Some(CLEANUP_ALLOWLIST)).await
            }
            ActionKind::Investigation => {
                self.run_commands(&action.commands, Some(INVESTIGATION_ALLOWLIST))
                    .await
            }
            ActionKind::ConfigChange => self.write_patch_suggestion(action),
            ActionKind::Rebuild => self.run_rebuild(&action.commands).await,
        };

        let outcome = ActionOutcome {
            action_id: action.id,
            subject: action.subject.clone(),
            kind: action.kind,
            success,
            output,
            error,
            completed_at: Utc::now(),
        };
        self.log_outcome(&outcome);
        outcome
    }

    /// Run commands sequentially. With an allowlist, commands that do not
    /// match any prefix are skipped and noted. Success means every command
    /// that ran succeeded and at least one ran.
    async fn run_commands(
        &self,
        commands: &[String],
        allowlist: Option<&[&str]>,
    ) -> (bool, String, Option<String>) {
        let mut lines = Vec::new();
        let mut ran = 0usize;
        let mut all_ok = true;

        for command in commands {
            if let Some(prefixes) = allowlist {
                if !prefixes.iter().any(|p| command.starts_with(p)) {
                    lines.push(format!("skipped (not allow-listed): {command}"));
                    continue;
                }
            }
            ran += 1;
            match self.runner.run(command, self.timeout).await {
                Ok(output) => {
                    lines.push(format!("$ {command}"));
                    if !output.stdout.is_empty() {
                        lines.push(output.stdout.trim_end().to_string());
                    }
                    if !output.stderr.is_empty() {
                        lines.push(output.stderr.trim_end().to_string());
                    }
                    if !output.success {
                        all_ok = false;
                        lines.push(format!(
                            "exit status {}",
                            output.exit_code.unwrap_or(-1)
                        ));
                    }
                }
                Err(e) => {
                    all_ok = false;
                    lines.push(format!("$ {command}"));
                    lines.push(e.to_string());
                }
            }
        }

        let success = all_ok && ran > 0;
        let error = (!success).then(|| {
            if ran == 0 {
                "no runnable commands".to_string()
            } else {
                "one or more commands failed".to_string()
            }
        });
        (success, lines.join("\n"), error)
    }

    /// Rebuilds rehearse first: commands[0] is the dry-run, the rest apply.
    /// A failed dry-run aborts without touching system state.
    async fn run_rebuild(&self, commands: &[String]) -> (bool, String, Option<String>) {
        let Some((dry_run, apply)) = commands.split_first() else {
            return (false, String::new(), Some("rebuild has no commands".into()));
        };
        if apply.is_empty() {
            return (
                false,
                String::new(),
                Some("rebuild requires a dry-run command followed by apply commands".into()),
            );
        }

        match self.runner.run(dry_run, self.timeout).await {
            Ok(output) if output.success => {}
            Ok(output) => {
                return (
                    false,
                    format!("$ {dry_run}\n{}\n{}", output.stdout.trim_end(), output.stderr.trim_end()),
                    Some("dry-run failed, rebuild aborted".into()),
                );
            }
            Err(e) => {
                return (
                    false,
                    format!("$ {dry_run}\n{e}"),
                    Some("dry-run failed, rebuild aborted".into()),
                );
            }
        }

        let (success, output, error) = self.run_commands(apply, None).await;
        (
            success,
            format!("$ {dry_run}\ndry-run ok\n{output}"),
            error,
        )
    }

    /// Config changes are never applied directly; a patch suggestion is
    /// written for operator review.
    fn write_patch_suggestion(&self, action: &ProposedAction) -> (bool, String, Option<String>) {
        let dir = self.state_dir.join("patches");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            return (false, String::new(), Some(e.to_string()));
        }
        let path = dir.join(format!("patch-{}.txt", action.id));
        let body = format!(
            "Suggested change for {}:\n\n{}\n\nRationale: {}\nRollback: {}\n",
            action.subject,
            action.description,
            action.rationale,
            action.rollback_plan.as_deref().unwrap_or("none provided"),
        );
        match std::fs::write(&path, body) {
            Ok(()) => (
                true,
                format!("patch suggestion written to {} for manual review", path.display()),
                None,
            ),
            Err(e) => (false, String::new(), Some(e.to_string())),
        }
    }

    fn log_outcome(&self, outcome: &ActionOutcome) {
        if let Err(e) = self.actions_log.append(outcome) {
            warn!(error = %e, "actions log append failed");
        }
    }

    fn log_event(&self, event: &str, action: &ProposedAction, detail: Option<&str>) {
        let record = serde_json::json!({
            "at": Utc::now(),
            "event": event,
            "action": action,
            "detail": detail,
        });
        if let Err(e) = self.actions_log.append(&record) {
            warn!(error = %e, "actions log append failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
