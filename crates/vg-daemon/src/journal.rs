//! Journal access and the ordered log-pattern rule set.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use vg_core::types::Severity;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journalctl failed: {0}")]
    Command(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, JournalError>;

// ---------------------------------------------------------------------------
// JournalLine
// ---------------------------------------------------------------------------

/// One parsed journal record.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalLine {
    pub timestamp: DateTime<Utc>,
    pub unit: String,
    /// syslog priority, 0 (emerg) .. 7 (debug)
    pub priority: u8,
    pub message: String,
}

impl JournalLine {
    pub fn new(unit: impl Into<String>, priority: u8, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            unit: unit.into(),
            priority,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// JournalReader trait
// ---------------------------------------------------------------------------

/// Reads the journal delta since the previous call.
#[async_trait]
pub trait JournalReader: Send + Sync {
    async fn read_delta(&mut self) -> Result<Vec<JournalLine>>;
}

// ---------------------------------------------------------------------------
// ShellJournalReader
// ---------------------------------------------------------------------------

/// Reads via `journalctl --output=json`, tracking the cursor between calls.
pub struct ShellJournalReader {
    cursor: Option<String>,
    batch_limit: usize,
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(rename = "MESSAGE")]
    message: Option<String>,
    #[serde(rename = "SYSLOG_IDENTIFIER")]
    syslog_identifier: Option<String>,
    #[serde(rename = "_SYSTEMD_UNIT")]
    systemd_unit: Option<String>,
    #[serde(rename = "PRIORITY")]
    priority: Option<String>,
    #[serde(rename = "__CURSOR")]
    cursor: Option<String>,
    #[serde(rename = "__REALTIME_TIMESTAMP")]
    realtime: Option<String>,
}

impl ShellJournalReader {
    pub fn new() -> Self {
        Self {
            cursor: None,
            batch_limit: 500,
        }
    }

    /// Parse `journalctl --output=json` output, returning lines and the
    /// cursor of the last entry.
    fn parse_output(stdout: &str) -> (Vec<JournalLine>, Option<String>) {
        let mut lines = Vec::new();
        let mut last_cursor = None;
        for raw_line in stdout.lines() {
            let raw_line = raw_line.trim();
            if raw_line.is_empty() {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<RawEntry>(raw_line) else {
                continue;
            };
            if entry.cursor.is_some() {
                last_cursor = entry.cursor.clone();
            }
            let timestamp = entry
                .realtime
                .as_deref()
                .and_then(|us| us.parse::<i64>().ok())
                .and_then(|us| Utc.timestamp_micros(us).single())
                .unwrap_or_else(Utc::now);
            lines.push(JournalLine {
                timestamp,
                unit: entry
                    .systemd_unit
                    .or(entry.syslog_identifier)
                    .unwrap_or_default(),
                priority: entry
                    .priority
                    .as_deref()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(6),
                message: entry.message.unwrap_or_default(),
            });
        }
        (lines, last_cursor)
    }
}

impl Default for ShellJournalReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JournalReader for ShellJournalReader {
    async fn read_delta(&mut self) -> Result<Vec<JournalLine>> {
        let mut cmd = tokio::process::Command::new("journalctl");
        cmd.arg("-n")
            .arg(self.batch_limit.to_string())
            .arg("--output=json")
            .arg("--no-pager");
        match &self.cursor {
            Some(cursor) => {
                cmd.arg("--after-cursor").arg(cursor);
            }
            None => {
                // First read: bound the lookback instead of replaying history.
                cmd.arg("--since").arg("-5min");
            }
        }

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(JournalError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (lines, last_cursor) = Self::parse_output(&stdout);
        if last_cursor.is_some() {
            self.cursor = last_cursor;
        }
        debug!(count = lines.len(), "journal delta read");
        Ok(lines)
    }
}

// ---------------------------------------------------------------------------
// Log rules
// ---------------------------------------------------------------------------

/// One ordered pattern rule. The first matching rule wins.
pub struct LogRule {
    pub id: &'static str,
    pub pattern: Regex,
    pub severity: Severity,
    /// Use the emitting unit as the event subject instead of the rule id.
    pub subject_from_unit: bool,
}

impl LogRule {
    fn new(id: &'static str, pattern: &str, severity: Severity, subject_from_unit: bool) -> Self {
        Self {
            id,
            pattern: Regex::new(&format!("(?i){pattern}")).expect("static rule pattern"),
            severity,
            subject_from_unit,
        }
    }

    pub fn matches(&self, line: &JournalLine) -> bool {
        self.pattern.is_match(&line.message)
    }

    pub fn subject(&self, line: &JournalLine) -> String {
        if self.subject_from_unit && !line.unit.is_empty() {
            line.unit.trim_end_matches(".service").to_string()
        } else {
            self.id.to_string()
        }
    }
}

/// The built-in rule set, most severe first.
pub fn default_rules() -> Vec<LogRule> {
    vec![
        LogRule::new("kernel_panic", r"kernel:.*panic", Severity::Critical, false),
        LogRule::new("oom", r"out of memory", Severity::Critical, false),
        LogRule::new("segfault", r"segfault", Severity::Warning, false),
        LogRule::new("service_start", r"failed to start", Severity::Warning, true),
        LogRule::new("unit_failed", r"\bFAILED\b", Severity::Warning, true),
        LogRule::new("auth_error", r"error.*authentication", Severity::Warning, false),
        LogRule::new("conn_refused", r"connection refused", Severity::Info, false),
        LogRule::new("timeout", r"timeout", Severity::Info, false),
    ]
}

// ---------------------------------------------------------------------------
// MockJournal
// ---------------------------------------------------------------------------

/// Scripted journal for tests: each `read_delta` pops the next batch.
pub struct MockJournal {
    batches: std::collections::VecDeque<Result<Vec<JournalLine>>>,
}

impl MockJournal {
    pub fn new() -> Self {
        Self {
            batches: std::collections::VecDeque::new(),
        }
    }

    pub fn with_batch(mut self, lines: Vec<JournalLine>) -> Self {
        self.batches.push_back(Ok(lines));
        self
    }

    pub fn with_error(mut self) -> Self {
        self.batches
            .push_back(Err(JournalError::Command("mock failure".into())));
        self
    }
}

impl Default for MockJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JournalReader for MockJournal {
    async fn read_delta(&mut self) -> Result<Vec<JournalLine>> {
        self.batches.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_journalctl_json_output() {
        let stdout = concat!(
            r#"{"MESSAGE":"Failed to start nginx.service","_SYSTEMD_UNIT":"nginx.service","PRIORITY":"3","__CURSOR":"c1","__REALTIME_TIMESTAMP":"1700000000000000"}"#,
            "\n",
            r#"{"MESSAGE":"plain line","SYSLOG_IDENTIFIER":"kernel","__CURSOR":"c2"}"#,
            "\n",
            "not json at all\n",
        );
        let (lines, cursor) = ShellJournalReader::parse_output(stdout);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].unit, "nginx.service");
        assert_eq!(lines[0].priority, 3);
        assert_eq!(lines[1].unit, "kernel");
        assert_eq!(lines[1].priority, 6);
        assert_eq!(cursor.as_deref(), Some("c2"));
    }

    #[test]
    fn rules_match_case_insensitively_in_order() {
        let rules = default_rules();
        let line = JournalLine::new("kernel", 2, "kernel: PANIC - not syncing");
        let hit = rules.iter().find(|r| r.matches(&line)).unwrap();
        assert_eq!(hit.id, "kernel_panic");
        assert_eq!(hit.severity, Severity::Critical);
    }

    #[test]
    fn failed_to_start_uses_unit_subject() {
        let rules = default_rules();
        let line = JournalLine::new("nginx.service", 3, "Failed to start A high performance web server.");
        let hit = rules.iter().find(|r| r.matches(&line)).unwrap();
        assert_eq!(hit.id, "service_start");
        assert_eq!(hit.subject(&line), "nginx");
    }

    #[test]
    fn unit_failed_requires_whole_word() {
        let rules = default_rules();
        let rule = rules.iter().find(|r| r.id == "unit_failed").unwrap();
        assert!(rule.matches(&JournalLine::new("u", 3, "Unit entered FAILED state")));
        // Mid-word occurrences do not count.
        assert!(!rule.matches(&JournalLine::new("u", 6, "prefailedz")));
    }

    #[test]
    fn no_rule_matches_quiet_line() {
        let rules = default_rules();
        let line = JournalLine::new("cron", 6, "session opened for user root");
        assert!(rules.iter().all(|r| !r.matches(&line)));
    }

    #[tokio::test]
    async fn mock_journal_pops_batches_then_empties() {
        let mut journal = MockJournal::new()
            .with_batch(vec![JournalLine::new("a", 6, "one")])
            .with_error();

        assert_eq!(journal.read_delta().await.unwrap().len(), 1);
        assert!(journal.read_delta().await.is_err());
        assert!(journal.read_delta().await.unwrap().is_empty());
    }
}
