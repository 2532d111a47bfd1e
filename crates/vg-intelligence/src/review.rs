//! Medium-tier review reasoner.
//!
//! Runs on a fixed cadence over a prompt-sized context slice, produces a
//! structured health assessment, proposes actions, and decides whether to
//! escalate to the large tier.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vg_core::types::{ActionKind, ActionOrigin, ProposedAction, RiskLevel, Severity};

use crate::llm::{ChatMessage, LlmError, TierClient};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("llm: {0}")]
    Llm(#[from] LlmError),
    /// Both the original reply and the reinforced retry failed to parse.
    /// The cycle is dropped.
    #[error("unparseable reply after retry: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ReviewError>;

// ---------------------------------------------------------------------------
// Output schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    AttentionNeeded,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::AttentionNeeded => write!(f, "attention_needed"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: Severity,
    pub category: String,
    pub description: String,
}

/// Parsed result of one review cycle.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub status: HealthStatus,
    pub assessment: String,
    pub issues: Vec<ReviewIssue>,
    pub actions: Vec<ProposedAction>,
    pub escalate: bool,
    pub escalation_reason: String,
}

// Wire shape the model is instructed to emit. Converted to domain types
// after validation; unknown action kinds or risks fail the parse.
#[derive(Deserialize)]
struct WireOutcome {
    status: HealthStatus,
    #[serde(default)]
    assessment: String,
    #[serde(default)]
    issues: Vec<ReviewIssue>,
    #[serde(default)]
    actions: Vec<WireAction>,
    #[serde(default)]
    escalate: bool,
    #[serde(default)]
    escalation_reason: String,
}

#[derive(Deserialize)]
pub(crate) struct WireAction {
    subject: String,
    #[serde(default)]
    description: String,
    action_kind: ActionKind,
    #[serde(default)]
    commands: Vec<String>,
    risk: RiskLevel,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    rollback_plan: Option<String>,
}

impl WireAction {
    pub(crate) fn into_proposed(self, origin: ActionOrigin) -> ProposedAction {
        ProposedAction {
            id: Uuid::new_v4(),
            subject: self.subject,
            description: self.description,
            kind: self.action_kind,
            commands: self.commands,
            risk: self.risk,
            rationale: self.rationale,
            rollback_plan: self.rollback_plan,
            origin,
        }
    }
}

/// Pull the outermost JSON object out of a reply that may wrap it in prose
/// or code fences.
pub(crate) fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

const REVIEW_INSTRUCTION: &str = r#"You are the continuous review tier of an autonomous host monitor. Analyze the system context below and reply with ONLY a JSON object, no prose, matching this schema:

{
  "status": "healthy" | "attention_needed" | "critical",
  "assessment": "one-paragraph summary of system health",
  "issues": [
    {"severity": "info" | "warning" | "critical", "category": "service|resource|security|performance|other", "description": "what is wrong"}
  ],
  "actions": [
    {
      "subject": "service or component name",
      "description": "what to do",
      "action_kind": "service_restart" | "cleanup" | "investigation" | "config_change" | "rebuild",
      "commands": ["shell command", "..."],
      "risk": "low" | "medium" | "high",
      "rationale": "why this helps",
      "rollback_plan": "how to undo, or null"
    }
  ],
  "escalate": true | false,
  "escalation_reason": "why the senior tier is needed, empty if not escalating"
}

Only propose actions you are confident about. Prefer investigation over change when uncertain. Escalate when the situation spans multiple services, has an unclear root cause, or needs high-risk changes."#;

const REINFORCED_PREFIX: &str = "Your previous reply was not valid JSON matching the schema. Reply again with ONLY the JSON object, with no explanation and no markdown fences.\n\n";

// ---------------------------------------------------------------------------
// ReviewReasoner
// ---------------------------------------------------------------------------

/// Per-process counters, surfaced through the structured logs.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReviewStats {
    pub cycles: u64,
    pub parse_retries: u64,
    pub dropped_cycles: u64,
    pub actions_proposed: u64,
    pub escalations: u64,
}

pub struct ReviewReasoner {
    tier: TierClient,
    stats: ReviewStats,
}

impl ReviewReasoner {
    pub fn new(tier: TierClient) -> Self {
        Self {
            tier,
            stats: ReviewStats::default(),
        }
    }

    pub fn stats(&self) -> ReviewStats {
        self.stats
    }

    /// Run one review cycle over an assembled context prompt.
    ///
    /// A malformed reply is retried once with a reinforced instruction; a
    /// second failure returns `ReviewError::Parse` and the caller drops the
    /// cycle.
    pub async fn run(&mut self, context: &str) -> Result<ReviewOutcome> {
        self.stats.cycles += 1;

        let reply = self
            .tier
            .complete(vec![
                ChatMessage::system(REVIEW_INSTRUCTION),
                ChatMessage::user(context.to_string()),
            ])
            .await?;

        let outcome = match Self::parse(&reply) {
            Ok(outcome) => outcome,
            Err(first_err) => {
                self.stats.parse_retries += 1;
                debug!(error = %first_err, "review reply unparseable, retrying reinforced");
                let retry = self
                    .tier
                    .complete(vec![
                        ChatMessage::system(format!("{REINFORCED_PREFIX}{REVIEW_INSTRUCTION}")),
                        ChatMessage::user(context.to_string()),
                    ])
                    .await?;
                Self::parse(&retry).map_err(|e| {
                    self.stats.dropped_cycles += 1;
                    warn!(error = %e, "review cycle dropped after reinforced retry");
                    ReviewError::Parse(e)
                })?
            }
        };

        self.stats.actions_proposed += outcome.actions.len() as u64;
        if outcome.escalate {
            self.stats.escalations += 1;
        }
        info!(
            status = %outcome.status,
            issues = outcome.issues.len(),
            actions = outcome.actions.len(),
            escalate = outcome.escalate,
            "review cycle complete"
        );
        Ok(outcome)
    }

    fn parse(reply: &str) -> std::result::Result<ReviewOutcome, String> {
        let json = extract_json(reply).ok_or_else(|| "no JSON object in reply".to_string())?;
        let wire: WireOutcome = serde_json::from_str(json).map_err(|e| e.to_string())?;
        Ok(ReviewOutcome {
            status: wire.status,
            assessment: wire.assessment,
            issues: wire.issues,
            actions: wire
                .actions
                .into_iter()
                .map(|a| a.into_proposed(ActionOrigin::Review))
                .collect(),
            escalate: wire.escalate,
            escalation_reason: wire.escalation_reason,
        })
    }
}

// ---------------------------------------------------------------------------
// Escalation gate
// ---------------------------------------------------------------------------

/// Escalation request deposited on the meta tier's channel.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationRequest {
    /// Debounce key derived from the escalation reason.
    pub key: String,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

/// Debounces escalations so the review tier cannot oscillate the large
/// model. Suppression is keyed on the normalized escalation reason.
pub struct EscalationGate {
    cooldown: Duration,
    last_fired: HashMap<String, DateTime<Utc>>,
}

impl EscalationGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fired: HashMap::new(),
        }
    }

    fn normalize(reason: &str) -> String {
        reason.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Admit or suppress an escalation. Admission records the firing time.
    pub fn admit(&mut self, reason: &str) -> Option<EscalationRequest> {
        let key = Self::normalize(reason);
        let now = Utc::now();
        if let Some(last) = self.last_fired.get(&key) {
            if now - *last < self.cooldown {
                debug!(key = %key, "escalation suppressed within cooldown");
                return None;
            }
        }
        self.last_fired.insert(key.clone(), now);
        Some(EscalationRequest {
            key,
            reason: reason.to_string(),
            requested_at: now,
        })
    }

    #[cfg(test)]
    fn backdate(&mut self, reason: &str, by: Duration) {
        let key = Self::normalize(reason);
        if let Some(ts) = self.last_fired.get_mut(&key) {
            *ts -= by;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    fn tier(mock: Arc<MockLlm>) -> TierClient {
        TierClient::new(mock, "qwen3:4b", 1024, StdDuration::from_secs(5), 0)
    }

    const HEALTHY_REPLY: &str = r#"{"status": "healthy", "assessment": "nominal", "issues": [], "actions": [], "escalate": false, "escalation_reason": ""}"#;

    const RESTART_REPLY: &str = r#"{
        "status": "attention_needed",
        "assessment": "nginx is down",
        "issues": [{"severity": "warning", "category": "service", "description": "nginx failed"}],
        "actions": [{
            "subject": "nginx",
            "description": "restart the failed unit",
            "action_kind": "service_restart",
            "commands": ["systemctl restart nginx"],
            "risk": "low",
            "rationale": "unit exited cleanly before",
            "rollback_plan": null
        }],
        "escalate": false,
        "escalation_reason": ""
    }"#;

    #[tokio::test]
    async fn parses_healthy_cycle() {
        let mock = Arc::new(MockLlm::new().with_response(HEALTHY_REPLY));
        let mut reasoner = ReviewReasoner::new(tier(mock));

        let outcome = reasoner.run("context").await.unwrap();
        assert_eq!(outcome.status, HealthStatus::Healthy);
        assert!(outcome.actions.is_empty());
        assert!(!outcome.escalate);
        assert_eq!(reasoner.stats().cycles, 1);
    }

    #[tokio::test]
    async fn parses_actions_with_review_origin() {
        let mock = Arc::new(MockLlm::new().with_response(RESTART_REPLY));
        let mut reasoner = ReviewReasoner::new(tier(mock));

        let outcome = reasoner.run("context").await.unwrap();
        assert_eq!(outcome.actions.len(), 1);
        let action = &outcome.actions[0];
        assert_eq!(action.kind, ActionKind::ServiceRestart);
        assert_eq!(action.risk, RiskLevel::Low);
        assert_eq!(action.origin, ActionOrigin::Review);
        assert_eq!(action.commands, vec!["systemctl restart nginx"]);
    }

    #[tokio::test]
    async fn json_wrapped_in_prose_still_parses() {
        let wrapped = format!("Here is my analysis:\n```json\n{HEALTHY_REPLY}\n```\nDone.");
        let mock = Arc::new(MockLlm::new().with_response(wrapped));
        let mut reasoner = ReviewReasoner::new(tier(mock));
        assert!(reasoner.run("context").await.is_ok());
    }

    #[tokio::test]
    async fn retries_once_with_reinforced_instruction() {
        let mock = Arc::new(
            MockLlm::new()
                .with_response("I think everything looks fine!")
                .with_response(HEALTHY_REPLY),
        );
        let mut reasoner = ReviewReasoner::new(tier(mock.clone()));

        let outcome = reasoner.run("context").await.unwrap();
        assert_eq!(outcome.status, HealthStatus::Healthy);
        assert_eq!(reasoner.stats().parse_retries, 1);

        let captured = mock.captured();
        assert_eq!(captured.len(), 2);
        assert!(captured[1].messages[0].content.starts_with(REINFORCED_PREFIX));
    }

    #[tokio::test]
    async fn second_parse_failure_drops_cycle() {
        let mock = Arc::new(
            MockLlm::new()
                .with_response("nope")
                .with_response("still nope"),
        );
        let mut reasoner = ReviewReasoner::new(tier(mock));

        let err = reasoner.run("context").await.unwrap_err();
        assert!(matches!(err, ReviewError::Parse(_)));
        assert_eq!(reasoner.stats().dropped_cycles, 1);
    }

    #[tokio::test]
    async fn identical_context_yields_identical_actions() {
        // Deterministic backend => idempotent cycles (modulo fresh ids).
        let mock = Arc::new(
            MockLlm::new()
                .with_response(RESTART_REPLY)
                .with_response(RESTART_REPLY),
        );
        let mut reasoner = ReviewReasoner::new(tier(mock));

        let a = reasoner.run("same context").await.unwrap();
        let b = reasoner.run("same context").await.unwrap();
        assert_eq!(a.actions.len(), b.actions.len());
        assert_eq!(a.actions[0].subject, b.actions[0].subject);
        assert_eq!(a.actions[0].commands, b.actions[0].commands);
        assert_eq!(a.actions[0].risk, b.actions[0].risk);
    }

    #[test]
    fn escalation_gate_suppresses_within_cooldown() {
        let mut gate = EscalationGate::new(Duration::minutes(10));
        assert!(gate.admit("multi-service failure").is_some());
        assert!(gate.admit("multi-service failure").is_none());
        // Case/whitespace variations hit the same key.
        assert!(gate.admit("  Multi-Service   FAILURE ").is_none());
        // A different reason is its own key.
        assert!(gate.admit("disk exhaustion on /").is_some());
    }

    #[test]
    fn escalation_gate_readmits_after_cooldown() {
        let mut gate = EscalationGate::new(Duration::minutes(10));
        assert!(gate.admit("multi-service failure").is_some());
        gate.backdate("multi-service failure", Duration::minutes(11));
        assert!(gate.admit("multi-service failure").is_some());
    }
}
