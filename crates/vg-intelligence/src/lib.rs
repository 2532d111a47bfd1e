//! LLM plumbing and the two reasoning tiers that sit on top of it.
//!
//! The reasoners are deliberately I/O-free at their seams: they take an
//! assembled prompt and return a structured outcome. Routing the outcome
//! (executor, context window, escalation channel) belongs to the daemon.

pub mod chat;
pub mod llm;
pub mod meta;
pub mod review;

pub use llm::{ChatMessage, LlmClient, LlmError, MockLlm, Role, TierClient};
pub use meta::{MetaOutcome, MetaReasoner};
pub use review::{EscalationGate, EscalationRequest, ReviewOutcome, ReviewReasoner};
