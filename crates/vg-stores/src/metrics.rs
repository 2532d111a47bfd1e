use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio_rusqlite::Connection;

use vg_core::types::MetricSample;

use crate::Result;

// ---------------------------------------------------------------------------
// MetricsStore trait
// ---------------------------------------------------------------------------

/// Aggregation function for windowed reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Avg,
    Max,
    Min,
}

impl Aggregate {
    fn sql(&self) -> &'static str {
        match self {
            Aggregate::Avg => "AVG(value)",
            Aggregate::Max => "MAX(value)",
            Aggregate::Min => "MIN(value)",
        }
    }
}

/// Append-only writes and windowed reads of time-series samples.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn insert_sample(&self, sample: &MetricSample) -> Result<()>;

    /// All samples for `(name, host)` in `[from, to]`, oldest first.
    async fn query_range(
        &self,
        name: &str,
        host: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>>;

    /// Bucketed aggregate over `[from, to]` with the given step.
    /// Returns `(bucket_start, value)` pairs, oldest first.
    async fn aggregate(
        &self,
        name: &str,
        host: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: Duration,
        agg: Aggregate,
    ) -> Result<Vec<(DateTime<Utc>, f64)>>;

    /// Most recent sample per metric name for a host.
    async fn latest(&self, host: &str) -> Result<Vec<MetricSample>>;

    /// Drop samples older than the retention horizon. Returns rows removed.
    async fn evict_older_than(&self, retention: Duration) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// SqliteMetricsStore
// ---------------------------------------------------------------------------

/// SQLite-backed metrics adapter.
pub struct SqliteMetricsStore {
    conn: Connection,
}

impl SqliteMetricsStore {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// A purely in-memory store, for tests.
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

                    CREATE TABLE IF NOT EXISTS samples (
                        ts    INTEGER NOT NULL,
                        host  TEXT NOT NULL,
                        name  TEXT NOT NULL,
                        value REAL NOT NULL,
                        unit  TEXT NOT NULL DEFAULT '',
                        tags  TEXT NOT NULL DEFAULT '{}'
                    );

                    CREATE INDEX IF NOT EXISTS idx_samples_series
                        ON samples (host, name, ts DESC);
                    CREATE INDEX IF NOT EXISTS idx_samples_ts
                        ON samples (ts);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for SqliteMetricsStore {
    async fn insert_sample(&self, sample: &MetricSample) -> Result<()> {
        let ts = sample.timestamp.timestamp();
        let host = sample.host.clone();
        let name = sample.name.clone();
        let value = sample.value;
        let unit = sample.unit.clone();
        let tags = serde_json::to_string(&sample.tags)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO samples (ts, host, name, value, unit, tags)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![ts, host, name, value, unit, tags],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn query_range(
        &self,
        name: &str,
        host: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        let name = name.to_string();
        let host = host.to_string();
        let (from_ts, to_ts) = (from.timestamp(), to.timestamp());

        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT ts, host, name, value, unit, tags FROM samples
                     WHERE name = ?1 AND host = ?2 AND ts >= ?3 AND ts <= ?4
                     ORDER BY ts ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![name, host, from_ts, to_ts])?;
                let mut out: Vec<(i64, String, String, f64, String, String)> = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ));
                }
                Ok(out)
            })
            .await?;

        rows.into_iter().map(row_to_sample).collect()
    }

    async fn aggregate(
        &self,
        name: &str,
        host: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: Duration,
        agg: Aggregate,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let name = name.to_string();
        let host = host.to_string();
        let (from_ts, to_ts) = (from.timestamp(), to.timestamp());
        let step_s = step.num_seconds().max(1);
        let sql = format!(
            "SELECT (ts / ?5) * ?5 AS bucket, {} FROM samples
             WHERE name = ?1 AND host = ?2 AND ts >= ?3 AND ts <= ?4
             GROUP BY bucket ORDER BY bucket ASC",
            agg.sql()
        );

        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows =
                    stmt.query(rusqlite::params![name, host, from_ts, to_ts, step_s])?;
                let mut out: Vec<(i64, f64)> = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get(0)?, row.get(1)?));
                }
                Ok(out)
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(ts, v)| Utc.timestamp_opt(ts, 0).single().map(|t| (t, v)))
            .collect())
    }

    async fn latest(&self, host: &str) -> Result<Vec<MetricSample>> {
        let host = host.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.ts, s.host, s.name, s.value, s.unit, s.tags
                     FROM samples s
                     JOIN (SELECT name, MAX(ts) AS max_ts FROM samples
                           WHERE host = ?1 GROUP BY name) latest
                       ON s.name = latest.name AND s.ts = latest.max_ts
                     WHERE s.host = ?1
                     ORDER BY s.name ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![host])?;
                let mut out: Vec<(i64, String, String, f64, String, String)> = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ));
                }
                Ok(out)
            })
            .await?;

        rows.into_iter().map(row_to_sample).collect()
    }

    async fn evict_older_than(&self, retention: Duration) -> Result<u64> {
        let cutoff = (Utc::now() - retention).timestamp();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM samples WHERE ts < ?1",
                    rusqlite::params![cutoff],
                )?;
                Ok(n as u64)
            })
            .await?;
        Ok(removed)
    }
}

fn row_to_sample(row: (i64, String, String, f64, String, String)) -> Result<MetricSample> {
    let (ts, host, name, value, unit, tags) = row;
    Ok(MetricSample {
        timestamp: Utc
            .timestamp_opt(ts, 0)
            .single()
            .unwrap_or_else(Utc::now),
        host,
        name,
        value,
        unit,
        tags: serde_json::from_str(&tags)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
