//! Large-tier meta reasoner.
//!
//! Invoked only on escalation, operator `check`, or chat, never on a
//! timer. Gets the biggest context slice plus historical issues and
//! knowledge from the semantic store, reasons free-form, and may emit
//! structured action blocks.

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use vg_core::types::{ActionOrigin, Issue, ProposedAction};
use vg_stores::KnowledgeEntry;

use crate::llm::{ChatMessage, LlmError, TierClient};
use crate::review::WireAction;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("llm: {0}")]
    Llm(#[from] LlmError),
}

pub type Result<T> = std::result::Result<T, MetaError>;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one meta invocation: free-form analysis plus any structured
/// actions found in it.
#[derive(Debug, Clone)]
pub struct MetaOutcome {
    pub analysis: String,
    pub actions: Vec<ProposedAction>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetaStats {
    pub analyses: u64,
    pub actions_proposed: u64,
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

const META_INSTRUCTION: &str = r#"You are the senior tier of an autonomous host monitor, consulted only for escalations and operator questions. Reason freely: identify the root cause, judge blast radius, and recommend both immediate remediation and longer-term prevention.

When you want an action taken, emit it as a fenced code block tagged `action` containing exactly one JSON object:

```action
{
  "subject": "component",
  "description": "what to do",
  "action_kind": "service_restart" | "cleanup" | "investigation" | "config_change" | "rebuild",
  "commands": ["shell command"],
  "risk": "low" | "medium" | "high",
  "rationale": "why",
  "rollback_plan": "how to undo, or null"
}
```

Everything outside action blocks is treated as analysis for the operator. Be honest about uncertainty; an investigation action beats a guessed fix."#;

// ---------------------------------------------------------------------------
// MetaReasoner
// ---------------------------------------------------------------------------

pub struct MetaReasoner {
    tier: TierClient,
    stats: MetaStats,
}

impl MetaReasoner {
    pub fn new(tier: TierClient) -> Self {
        Self {
            tier,
            stats: MetaStats::default(),
        }
    }

    pub fn stats(&self) -> MetaStats {
        self.stats
    }

    /// Deep analysis of an escalated (or operator-requested) situation.
    pub async fn analyze(
        &mut self,
        reason: &str,
        context: &str,
        history: &[Issue],
        knowledge: &[KnowledgeEntry],
    ) -> Result<MetaOutcome> {
        self.stats.analyses += 1;

        let prompt = Self::build_prompt(reason, context, history, knowledge);
        let reply = self
            .tier
            .complete(vec![
                ChatMessage::system(META_INSTRUCTION),
                ChatMessage::user(prompt),
            ])
            .await?;

        let actions = Self::extract_actions(&reply);
        self.stats.actions_proposed += actions.len() as u64;
        info!(
            reason = %reason,
            reply_chars = reply.len(),
            actions = actions.len(),
            "meta analysis complete"
        );

        Ok(MetaOutcome {
            analysis: reply,
            actions,
        })
    }

    fn build_prompt(
        reason: &str,
        context: &str,
        history: &[Issue],
        knowledge: &[KnowledgeEntry],
    ) -> String {
        let mut sections = vec![format!("ESCALATION REASON: {reason}")];

        if !history.is_empty() {
            let mut lines = vec!["SIMILAR PAST ISSUES:".to_string()];
            for issue in history {
                lines.push(format!(
                    "- [{}] {} ({}): {}",
                    issue.status,
                    issue.title,
                    issue.subject,
                    issue
                        .resolution
                        .as_deref()
                        .unwrap_or("no resolution recorded"),
                ));
            }
            sections.push(lines.join("\n"));
        }

        if !knowledge.is_empty() {
            let mut lines = vec!["RELEVANT KNOWLEDGE:".to_string()];
            for entry in knowledge {
                lines.push(format!("- {}: {}", entry.topic, entry.content));
            }
            sections.push(lines.join("\n"));
        }

        sections.push(format!("CURRENT SYSTEM CONTEXT:\n{context}"));
        sections.join("\n\n")
    }

    /// Scan fenced blocks for parseable action objects. Blocks that fail
    /// to parse are left in the analysis text untouched.
    fn extract_actions(reply: &str) -> Vec<ProposedAction> {
        let mut actions = Vec::new();
        let mut rest = reply;
        while let Some(open) = rest.find("```") {
            let after_open = &rest[open + 3..];
            let Some(close) = after_open.find("```") else {
                break;
            };
            let block = &after_open[..close];
            // Strip a language tag (`action`, `json`) off the first line.
            let body = match block.find('\n') {
                Some(nl) => &block[nl + 1..],
                None => block,
            };
            match serde_json::from_str::<WireAction>(body.trim()) {
                Ok(wire) => actions.push(wire.into_proposed(ActionOrigin::Meta)),
                Err(e) => {
                    if block.trim_start().starts_with("action") {
                        warn!(error = %e, "action block failed to parse, leaving as analysis");
                    }
                }
            }
            rest = &after_open[close + 3..];
        }
        actions
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
