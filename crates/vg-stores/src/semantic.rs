use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use vg_core::types::{Issue, IssueStatus};

use crate::Result;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A piece of operational knowledge (how an issue class was fixed, what a
/// service depends on, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: Uuid,
    pub topic: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    pub fn new(topic: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            content: content.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Registry entry for a host this daemon knows about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemRecord {
    pub hostname: String,
    pub system_type: String,
    pub services: Vec<String>,
    pub capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// SemanticStore trait
// ---------------------------------------------------------------------------

/// Persistence and similarity queries for issues, knowledge, and the
/// system registry.
#[async_trait]
pub trait SemanticStore: Send + Sync {
    async fn upsert_issue(&self, issue: &Issue) -> Result<()>;
    async fn get_issue(&self, id: Uuid) -> Result<Option<Issue>>;
    /// Issues ranked by keyword similarity to `text`, best first.
    /// Closed issues are included; history is the point of the query.
    async fn query_issues(&self, text: &str, k: usize) -> Result<Vec<Issue>>;
    async fn list_issues(
        &self,
        host: Option<&str>,
        status: Option<IssueStatus>,
    ) -> Result<Vec<Issue>>;

    async fn upsert_knowledge(&self, entry: &KnowledgeEntry) -> Result<()>;
    async fn query_knowledge(&self, text: &str, k: usize) -> Result<Vec<KnowledgeEntry>>;

    async fn upsert_system(&self, record: &SystemRecord) -> Result<()>;
    async fn list_systems(&self) -> Result<Vec<SystemRecord>>;
}

// ---------------------------------------------------------------------------
// Keyword similarity
// ---------------------------------------------------------------------------

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "is", "are", "was", "were", "be", "been", "have", "has", "had",
];

fn keywords(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1 && !STOPWORDS.contains(w))
        .map(String::from)
        .collect()
}

/// Jaccard similarity over stopword-filtered keywords. 0.0 when either
/// side has none.
pub fn keyword_score(a: &str, b: &str) -> f64 {
    let (wa, wb) = (keywords(a), keywords(b));
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    let intersection = wa.intersection(&wb).count();
    let union = wa.union(&wb).count();
    intersection as f64 / union as f64
}

fn rank_by_score<T>(mut scored: Vec<(f64, T)>, k: usize) -> Vec<T> {
    scored.retain(|(score, _)| *score > 0.0);
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(k).map(|(_, item)| item).collect()
}

// ---------------------------------------------------------------------------
// SqliteSemanticStore
// ---------------------------------------------------------------------------

/// SQLite-backed semantic adapter. Documents are stored as JSON with a few
/// indexed columns for filtering; similarity ranking happens in process.
pub struct SqliteSemanticStore {
    conn: Connection,
}

impl SqliteSemanticStore {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS issues (
                        id         TEXT PRIMARY KEY,
                        host       TEXT NOT NULL,
                        subject    TEXT NOT NULL,
                        status     TEXT NOT NULL,
                        updated_at TEXT NOT NULL,
                        doc        TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_issues_host_status
                        ON issues (host, status);

                    CREATE TABLE IF NOT EXISTS knowledge (
                        id         TEXT PRIMARY KEY,
                        topic      TEXT NOT NULL,
                        doc        TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS systems (
                        hostname   TEXT PRIMARY KEY,
                        doc        TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn all_issue_docs(&self) -> Result<Vec<String>> {
        let docs = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT doc FROM issues ORDER BY updated_at DESC")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await?;
        Ok(docs)
    }
}

#[async_trait]
impl SemanticStore for SqliteSemanticStore {
    async fn upsert_issue(&self, issue: &Issue) -> Result<()> {
        let id = issue.id.to_string();
        let host = issue.host.clone();
        let subject = issue.subject.clone();
        let status = issue.status.to_string();
        let updated_at = issue.updated_at.to_rfc3339();
        let doc = serde_json::to_string(issue)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO issues (id, host, subject, status, updated_at, doc)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                        host=excluded.host, subject=excluded.subject,
                        status=excluded.status, updated_at=excluded.updated_at,
                        doc=excluded.doc",
                    rusqlite::params![id, host, subject, status, updated_at, doc],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_issue(&self, id: Uuid) -> Result<Option<Issue>> {
        let id = id.to_string();
        let doc = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT doc FROM issues WHERE id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    async fn query_issues(&self, text: &str, k: usize) -> Result<Vec<Issue>> {
        let mut scored = Vec::new();
        for doc in self.all_issue_docs().await? {
            let issue: Issue = serde_json::from_str(&doc)?;
            let haystack = format!("{} {} {}", issue.title, issue.description, issue.subject);
            scored.push((keyword_score(text, &haystack), issue));
        }
        Ok(rank_by_score(scored, k))
    }

    async fn list_issues(
        &self,
        host: Option<&str>,
        status: Option<IssueStatus>,
    ) -> Result<Vec<Issue>> {
        let host = host.map(String::from);
        let status = status.map(|s| s.to_string());
        let docs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT doc FROM issues
                     WHERE (?1 IS NULL OR host = ?1)
                       AND (?2 IS NULL OR status = ?2)
                     ORDER BY updated_at DESC",
                )?;
                let mut rows = stmt.query(rusqlite::params![host, status])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await?;

        docs.iter()
            .map(|doc| serde_json::from_str(doc).map_err(Into::into))
            .collect()
    }

    async fn upsert_knowledge(&self, entry: &KnowledgeEntry) -> Result<()> {
        let id = entry.id.to_string();
        let topic = entry.topic.clone();
        let doc = serde_json::to_string(entry)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO knowledge (id, topic, doc) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET topic=excluded.topic, doc=excluded.doc",
                    rusqlite::params![id, topic, doc],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn query_knowledge(&self, text: &str, k: usize) -> Result<Vec<KnowledgeEntry>> {
        let docs = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT doc FROM knowledge")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await?;

        let mut scored = Vec::new();
        for doc in docs {
            let entry: KnowledgeEntry = serde_json::from_str(&doc)?;
            let haystack = format!("{} {}", entry.topic, entry.content);
            scored.push((keyword_score(text, &haystack), entry));
        }
        Ok(rank_by_score(scored, k))
    }

    async fn upsert_system(&self, record: &SystemRecord) -> Result<()> {
        let hostname = record.hostname.clone();
        let doc = serde_json::to_string(record)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO systems (hostname, doc) VALUES (?1, ?2)
                     ON CONFLICT(hostname) DO UPDATE SET doc=excluded.doc",
                    rusqlite::params![hostname, doc],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_systems(&self) -> Result<Vec<SystemRecord>> {
        let docs = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT doc FROM systems ORDER BY hostname ASC")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await?;

        docs.iter()
            .map(|doc| serde_json::from_str(doc).map_err(Into::into))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vg_core::types::Severity;

    #[test]
    fn keyword_score_ignores_stopwords() {
        assert_eq!(keyword_score("the a an of", "the of and"), 0.0);
        let score = keyword_score(
            "nginx service failed to start",
            "failed start of nginx service",
        );
        assert!(score > 0.7, "score was {score}");
    }

    #[test]
    fn keyword_score_zero_for_disjoint_text() {
        assert_eq!(keyword_score("disk pressure", "kernel panic"), 0.0);
    }

    #[tokio::test]
    async fn issue_upsert_and_get_round_trip() {
        let store = SqliteSemanticStore::new_in_memory().await.unwrap();
        let mut issue = Issue::new("macha", "nginx", "nginx failed", Severity::Warning);
        issue.description = "service entered failed state".into();
        store.upsert_issue(&issue).await.unwrap();

        let back = store.get_issue(issue.id).await.unwrap().unwrap();
        assert_eq!(back, issue);

        // Update in place keeps a single row.
        issue.status = IssueStatus::Resolved;
        store.upsert_issue(&issue).await.unwrap();
        let all = store.list_issues(None, None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, IssueStatus::Resolved);
    }

    #[tokio::test]
    async fn list_issues_filters_by_host_and_status() {
        let store = SqliteSemanticStore::new_in_memory().await.unwrap();
        store
            .upsert_issue(&Issue::new("macha", "nginx", "nginx down", Severity::Warning))
            .await
            .unwrap();
        let mut resolved = Issue::new("macha", "cpu_pct", "cpu pressure", Severity::Info);
        resolved.status = IssueStatus::Resolved;
        store.upsert_issue(&resolved).await.unwrap();
        store
            .upsert_issue(&Issue::new("rhiannon", "sshd", "sshd flapping", Severity::Critical))
            .await
            .unwrap();

        let open_macha = store
            .list_issues(Some("macha"), Some(IssueStatus::Open))
            .await
            .unwrap();
        assert_eq!(open_macha.len(), 1);
        assert_eq!(open_macha[0].subject, "nginx");

        let all_macha = store.list_issues(Some("macha"), None).await.unwrap();
        assert_eq!(all_macha.len(), 2);
    }

    #[tokio::test]
    async fn query_issues_ranks_by_similarity() {
        let store = SqliteSemanticStore::new_in_memory().await.unwrap();
        store
            .upsert_issue(&Issue::new(
                "macha",
                "nginx",
                "nginx service failed to start",
                Severity::Warning,
            ))
            .await
            .unwrap();
        store
            .upsert_issue(&Issue::new(
                "macha",
                "root_fs",
                "disk usage above threshold",
                Severity::Warning,
            ))
            .await
            .unwrap();

        let hits = store.query_issues("nginx failed", 5).await.unwrap();
        assert_eq!(hits[0].subject, "nginx");

        let none = store.query_issues("zebra stampede", 5).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn knowledge_round_trip_and_query() {
        let store = SqliteSemanticStore::new_in_memory().await.unwrap();
        store
            .upsert_knowledge(&KnowledgeEntry::new(
                "nginx restarts",
                "nginx recovers cleanly from systemctl restart",
            ))
            .await
            .unwrap();

        let hits = store.query_knowledge("restart nginx", 3).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].topic, "nginx restarts");
    }

    #[tokio::test]
    async fn systems_registry_upserts_by_hostname() {
        let store = SqliteSemanticStore::new_in_memory().await.unwrap();
        let record = SystemRecord {
            hostname: "macha".into(),
            system_type: "workstation".into(),
            services: vec!["nginx".into()],
            capabilities: vec!["ai-inference".into()],
            registered_at: Utc::now(),
        };
        store.upsert_system(&record).await.unwrap();
        store.upsert_system(&record).await.unwrap();

        let systems = store.list_systems().await.unwrap();
        assert_eq!(systems.len(), 1);
        assert_eq!(systems[0].hostname, "macha");
    }
}
