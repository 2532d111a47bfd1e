use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tokens;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Severity of a trigger event or issue.
///
/// Ordering is semantic: `Info < Warning < Critical`, so severity upgrades
/// can be expressed with `max`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger events
// ---------------------------------------------------------------------------

/// What kind of probe produced a trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    LogPattern,
    MetricThreshold,
    ServiceState,
    Classifier,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::LogPattern => write!(f, "log_pattern"),
            TriggerKind::MetricThreshold => write!(f, "metric_threshold"),
            TriggerKind::ServiceState => write!(f, "service_state"),
            TriggerKind::Classifier => write!(f, "classifier"),
        }
    }
}

/// Stable deduplication key for trigger events.
///
/// Derived from `(kind, subject, severity)`; two events with the same
/// fingerprint describe the same condition and are debounced against each
/// other. Kept human-readable so it doubles as a correlation key in logs
/// and issue records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(kind: TriggerKind, subject: &str, severity: Severity) -> Self {
        Self(format!("{kind}:{subject}:{severity}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable event produced by the trigger loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: TriggerKind,
    pub severity: Severity,
    /// Service name, metric name, or log-rule identifier.
    pub subject: String,
    pub reason: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub fingerprint: Fingerprint,
}

impl TriggerEvent {
    pub fn new(
        kind: TriggerKind,
        severity: Severity,
        subject: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let subject = subject.into();
        let fingerprint = Fingerprint::new(kind, &subject, severity);
        Self {
            timestamp: Utc::now(),
            kind,
            severity,
            subject,
            reason: reason.into(),
            metadata: BTreeMap::new(),
            fingerprint,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Upgrade severity in place, recomputing the fingerprint.
    /// Downgrades are ignored: the original severity is a floor.
    pub fn upgrade_severity(&mut self, severity: Severity) {
        if severity > self.severity {
            self.severity = severity;
            self.fingerprint = Fingerprint::new(self.kind, &self.subject, self.severity);
        }
    }
}

// ---------------------------------------------------------------------------
// Metric samples
// ---------------------------------------------------------------------------

/// A single time-series sample. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl MetricSample {
    pub fn new(host: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            host: host.into(),
            name: name.into(),
            value,
            unit: String::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Activity reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IoStats {
    pub read_kb_s: f64,
    pub write_kb_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NetStats {
    pub rx_kb_s: f64,
    pub tx_kb_s: f64,
}

/// Parsed system-activity dump covering the recent past.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityReport {
    pub collected_at: DateTime<Utc>,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub io_stats: IoStats,
    pub net_stats: NetStats,
}

impl ActivityReport {
    pub fn render(&self) -> String {
        format!(
            "Activity (as of {}): cpu {:.1}%, mem {:.1}%, io {:.0}/{:.0} kB/s r/w, net {:.0}/{:.0} kB/s rx/tx",
            self.collected_at.format("%H:%M:%S"),
            self.cpu_pct,
            self.mem_pct,
            self.io_stats.read_kb_s,
            self.io_stats.write_kb_s,
            self.net_stats.rx_kb_s,
            self.net_stats.tx_kb_s,
        )
    }
}

// ---------------------------------------------------------------------------
// Context entries
// ---------------------------------------------------------------------------

/// Payload of a context-window entry.
// Tagged "entry" rather than "kind": Trigger and ActionOutcome payloads
// carry their own `kind` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum EntryBody {
    /// Identity block pinned at the head of every assembled prompt.
    SystemHeader {
        host: String,
        autonomy: AutonomyLevel,
    },
    Trigger(TriggerEvent),
    MetricSummary { text: String },
    Activity(ActivityReport),
    ReviewSummary {
        status: String,
        assessment: String,
        issues_found: usize,
        actions_proposed: usize,
        escalated: bool,
    },
    MetaAnalysis {
        escalation_reason: String,
        analysis: String,
    },
    ActionOutcome(ActionOutcome),
    /// Product of compression: either a coalesced run of identical
    /// fingerprints or an LLM/rule summary of older entries.
    Summary { text: String, coalesced: u32 },
}

/// One element of the context window. The token count is computed once at
/// construction and never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
    pub body: EntryBody,
}

impl ContextEntry {
    pub fn new(body: EntryBody) -> Self {
        let mut entry = Self {
            timestamp: Utc::now(),
            token_count: 0,
            body,
        };
        entry.token_count = tokens::estimate(&entry.render());
        entry
    }

    /// System headers are pinned; everything else may be compressed or
    /// dropped. The *latest* meta analysis is additionally protected, but
    /// that is positional and enforced by the window itself.
    pub fn compressible(&self) -> bool {
        !matches!(self.body, EntryBody::SystemHeader { .. })
    }

    /// Fingerprint used for coalescing runs of identical trigger entries.
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match &self.body {
            EntryBody::Trigger(ev) => Some(&ev.fingerprint),
            _ => None,
        }
    }

    /// Render the entry as prompt text.
    pub fn render(&self) -> String {
        let ts = self.timestamp.format("%Y-%m-%d %H:%M:%S");
        match &self.body {
            EntryBody::SystemHeader { host, autonomy } => format!(
                "=== vigil: autonomous host monitor ===\nHost: {host}\nAutonomy: {autonomy}"
            ),
            EntryBody::Trigger(ev) => format!(
                "[{ts}] [{}] {} {}: {}",
                ev.kind, ev.severity, ev.subject, ev.reason
            ),
            EntryBody::MetricSummary { text } => format!("[{ts}] metrics:\n{text}"),
            EntryBody::Activity(report) => format!("[{ts}] {}", report.render()),
            EntryBody::ReviewSummary {
                status,
                assessment,
                issues_found,
                actions_proposed,
                escalated,
            } => format!(
                "[{ts}] review: status={status} issues={issues_found} actions={actions_proposed} escalated={escalated}\n{assessment}"
            ),
            EntryBody::MetaAnalysis {
                escalation_reason,
                analysis,
            } => format!("[{ts}] meta analysis ({escalation_reason}):\n{analysis}"),
            EntryBody::ActionOutcome(outcome) => format!(
                "[{ts}] action {} on {}: {}\n{}",
                outcome.kind,
                outcome.subject,
                if outcome.success { "succeeded" } else { "failed" },
                outcome.output,
            ),
            EntryBody::Summary { text, coalesced } => {
                if *coalesced > 1 {
                    format!("[{ts}] {coalesced}x {text}")
                } else {
                    format!("[{ts}] {text}")
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ServiceRestart,
    Cleanup,
    Investigation,
    ConfigChange,
    Rebuild,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::ServiceRestart => write!(f, "service_restart"),
            ActionKind::Cleanup => write!(f, "cleanup"),
            ActionKind::Investigation => write!(f, "investigation"),
            ActionKind::ConfigChange => write!(f, "config_change"),
            ActionKind::Rebuild => write!(f, "rebuild"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// Which tier proposed an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOrigin {
    Review,
    Meta,
    User,
}

/// An action proposed by a reasoner (or the operator), not yet gated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub id: Uuid,
    pub subject: String,
    pub description: String,
    pub kind: ActionKind,
    pub commands: Vec<String>,
    pub risk: RiskLevel,
    pub rationale: String,
    #[serde(default)]
    pub rollback_plan: Option<String>,
    pub origin: ActionOrigin,
}

impl ProposedAction {
    pub fn new(
        subject: impl Into<String>,
        kind: ActionKind,
        risk: RiskLevel,
        origin: ActionOrigin,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            description: String::new(),
            kind,
            commands: Vec::new(),
            risk,
            rationale: String::new(),
            rollback_plan: None,
            origin,
        }
    }
}

/// Result of executing (or failing to execute) an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action_id: Uuid,
    pub subject: String,
    pub kind: ActionKind,
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Approval queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
}

impl QueueStatus {
    /// `pending -> approved -> {executed, failed}` and `pending -> rejected`.
    /// Terminal states are never revisited.
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        matches!(
            (self, next),
            (QueueStatus::Pending, QueueStatus::Approved)
                | (QueueStatus::Pending, QueueStatus::Rejected)
                | (QueueStatus::Approved, QueueStatus::Executed)
                | (QueueStatus::Approved, QueueStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Rejected | QueueStatus::Executed | QueueStatus::Failed
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStatus::Pending => write!(f, "pending"),
            QueueStatus::Approved => write!(f, "approved"),
            QueueStatus::Rejected => write!(f, "rejected"),
            QueueStatus::Executed => write!(f, "executed"),
            QueueStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A proposed action parked in the approval queue. Persisted across
/// restarts until it reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    /// Monotonic queue id, assigned by the queue itself.
    pub queue_id: u64,
    pub action: ProposedAction,
    pub queued_at: DateTime<Utc>,
    pub status: QueueStatus,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator notes attached via `approve discuss`.
    #[serde(default)]
    pub notes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Investigating,
    Resolved,
    Closed,
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueStatus::Open => write!(f, "open"),
            IssueStatus::Investigating => write!(f, "investigating"),
            IssueStatus::Resolved => write!(f, "resolved"),
            IssueStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Timestamped note on an issue timeline (an investigation or an action).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueNote {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl IssueNote {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}

/// Long-lived record correlating trigger events and actions for one
/// `(host, subject)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub host: String,
    /// Correlation key: service name, metric name, or rule id.
    pub subject: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub investigations: Vec<IssueNote>,
    #[serde(default)]
    pub actions: Vec<IssueNote>,
    #[serde(default)]
    pub resolution: Option<String>,
}

impl Issue {
    pub fn new(
        host: impl Into<String>,
        subject: impl Into<String>,
        title: impl Into<String>,
        severity: Severity,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            host: host.into(),
            subject: subject.into(),
            title: title.into(),
            description: String::new(),
            severity,
            status: IssueStatus::Open,
            created_at: now,
            updated_at: now,
            investigations: Vec::new(),
            actions: Vec::new(),
            resolution: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Autonomy levels
// ---------------------------------------------------------------------------

/// Executor policy mode controlling whether proposed actions auto-execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    Observe,
    Suggest,
    AutoSafe,
    AutoFull,
}

impl fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutonomyLevel::Observe => write!(f, "observe"),
            AutonomyLevel::Suggest => write!(f, "suggest"),
            AutonomyLevel::AutoSafe => write!(f, "auto_safe"),
            AutonomyLevel::AutoFull => write!(f, "auto_full"),
        }
    }
}

impl FromStr for AutonomyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observe" => Ok(AutonomyLevel::Observe),
            "suggest" => Ok(AutonomyLevel::Suggest),
            "auto_safe" | "auto-safe" => Ok(AutonomyLevel::AutoSafe),
            "auto_full" | "auto-full" => Ok(AutonomyLevel::AutoFull),
            other => Err(format!("unknown autonomy level: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
