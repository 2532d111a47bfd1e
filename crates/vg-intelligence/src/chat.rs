//! Interactive sessions with the large tier.
//!
//! Session history lives outside the global context window: each session
//! keeps its own message log, and every turn is composed as
//! system-header + history + user turn.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::llm::{ChatMessage, TierClient};
use crate::meta::Result;

/// One interactive conversation with the meta tier.
pub struct ChatSession {
    tier: TierClient,
    /// System header describing the host; pinned as the first message.
    header: String,
    history: Vec<ChatMessage>,
    started_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(tier: TierClient, header: impl Into<String>) -> Self {
        Self {
            tier,
            header: header.into(),
            history: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Send a user turn and record both sides in the session log.
    pub async fn send(&mut self, user_text: &str) -> Result<String> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(self.header.clone()));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(user_text));

        let reply = self.tier.complete(messages).await?;
        debug!(turns = self.history.len() / 2 + 1, "chat turn complete");

        self.history.push(ChatMessage::user(user_text));
        self.history.push(ChatMessage::assistant(reply.clone()));
        Ok(reply)
    }
}

/// One-shot question without a session (`vg ask`).
pub async fn ask_once(tier: &TierClient, header: &str, question: &str) -> Result<String> {
    let reply = tier
        .complete(vec![
            ChatMessage::system(header.to_string()),
            ChatMessage::user(question.to_string()),
        ])
        .await?;
    Ok(reply)
}
