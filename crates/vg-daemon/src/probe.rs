//! Local system probes behind mockable seams.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unparseable probe output: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ProbeError>;

// ---------------------------------------------------------------------------
// Metric probe
// ---------------------------------------------------------------------------

/// Point-in-time host metrics gathered by one probe pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemSnapshot {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    /// 1-minute load average.
    pub load1: f64,
    pub cores: usize,
    /// Root filesystem usage.
    pub disk_pct: f64,
}

#[async_trait]
pub trait MetricProbe: Send + Sync {
    async fn sample(&self) -> Result<SystemSnapshot>;
}

/// Reads `/proc` and `df` directly. CPU utilisation is a delta between
/// consecutive samples, so the first call reports 0%.
pub struct ProcMetricProbe {
    last_cpu: Mutex<Option<(u64, u64)>>,
}

impl ProcMetricProbe {
    pub fn new() -> Self {
        Self {
            last_cpu: Mutex::new(None),
        }
    }

    /// First line of /proc/stat -> (idle_ticks, total_ticks).
    fn parse_proc_stat(text: &str) -> Result<(u64, u64)> {
        let line = text
            .lines()
            .next()
            .ok_or_else(|| ProbeError::Parse("empty /proc/stat".into()))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 4 {
            return Err(ProbeError::Parse(format!("short cpu line: {line}")));
        }
        // idle + iowait when present
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        Ok((idle, total))
    }

    fn count_cores(stat: &str) -> usize {
        stat.lines()
            .filter(|l| {
                l.starts_with("cpu") && l.as_bytes().get(3).is_some_and(|b| b.is_ascii_digit())
            })
            .count()
            .max(1)
    }

    /// MemTotal / MemAvailable from /proc/meminfo -> used percent.
    fn parse_meminfo(text: &str) -> Result<f64> {
        let mut total = None;
        let mut available = None;
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("MemTotal:") => total = parts.next().and_then(|v| v.parse::<f64>().ok()),
                Some("MemAvailable:") => {
                    available = parts.next().and_then(|v| v.parse::<f64>().ok())
                }
                _ => {}
            }
        }
        match (total, available) {
            (Some(total), Some(available)) if total > 0.0 => {
                Ok(((total - available) / total) * 100.0)
            }
            _ => Err(ProbeError::Parse("meminfo missing fields".into())),
        }
    }

    fn parse_loadavg(text: &str) -> Result<f64> {
        text.split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProbeError::Parse("bad /proc/loadavg".into()))
    }

    /// `df --output=pcent /` -> usage percent.
    fn parse_df(text: &str) -> Result<f64> {
        text.lines()
            .skip(1)
            .find_map(|l| l.trim().trim_end_matches('%').parse().ok())
            .ok_or_else(|| ProbeError::Parse("bad df output".into()))
    }
}

impl Default for ProcMetricProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricProbe for ProcMetricProbe {
    async fn sample(&self) -> Result<SystemSnapshot> {
        let stat = tokio::fs::read_to_string("/proc/stat").await?;
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await?;
        let loadavg = tokio::fs::read_to_string("/proc/loadavg").await?;

        let (idle, total) = Self::parse_proc_stat(&stat)?;
        let cpu_pct = {
            let mut last = self.last_cpu.lock().unwrap();
            let pct = match *last {
                Some((last_idle, last_total)) if total > last_total => {
                    let total_delta = total - last_total;
                    let idle_delta = idle.saturating_sub(last_idle).min(total_delta);
                    (total_delta - idle_delta) as f64 / total_delta as f64 * 100.0
                }
                _ => 0.0,
            };
            *last = Some((idle, total));
            pct
        };

        let df = tokio::process::Command::new("df")
            .args(["--output=pcent", "/"])
            .output()
            .await?;
        let disk_pct = Self::parse_df(&String::from_utf8_lossy(&df.stdout))?;

        let snapshot = SystemSnapshot {
            cpu_pct,
            mem_pct: Self::parse_meminfo(&meminfo)?,
            load1: Self::parse_loadavg(&loadavg)?,
            cores: Self::count_cores(&stat),
            disk_pct,
        };
        debug!(?snapshot, "metric probe sampled");
        Ok(snapshot)
    }
}

/// Fixed snapshot for tests.
pub struct MockMetricProbe {
    snapshot: Mutex<Result<SystemSnapshot>>,
}

impl MockMetricProbe {
    pub fn new(snapshot: SystemSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Ok(snapshot)),
        }
    }

    pub fn failing() -> Self {
        Self {
            snapshot: Mutex::new(Err(ProbeError::Parse("mock probe down".into()))),
        }
    }

    pub fn set(&self, snapshot: SystemSnapshot) {
        *self.snapshot.lock().unwrap() = Ok(snapshot);
    }
}

#[async_trait]
impl MetricProbe for MockMetricProbe {
    async fn sample(&self) -> Result<SystemSnapshot> {
        match &*self.snapshot.lock().unwrap() {
            Ok(s) => Ok(*s),
            Err(_) => Err(ProbeError::Parse("mock probe down".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Service probe
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ServiceProbe: Send + Sync {
    /// systemd active state: "active", "inactive", "failed", ...
    async fn active_state(&self, unit: &str) -> Result<String>;
    /// Whether the unit exists at all on this host.
    async fn unit_exists(&self, unit: &str) -> Result<bool>;
}

/// Shells out to systemctl.
pub struct SystemctlProbe;

#[async_trait]
impl ServiceProbe for SystemctlProbe {
    async fn active_state(&self, unit: &str) -> Result<String> {
        let output = tokio::process::Command::new("systemctl")
            .args(["is-active", unit])
            .output()
            .await?;
        // is-active exits non-zero for anything but "active"; stdout still
        // carries the state word.
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn unit_exists(&self, unit: &str) -> Result<bool> {
        let output = tokio::process::Command::new("systemctl")
            .args(["list-unit-files", &format!("{unit}.service")])
            .output()
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).contains(&format!("{unit}.service")))
    }
}

/// Scripted service states for tests. Unknown units do not exist.
pub struct MockServiceProbe {
    states: Mutex<HashMap<String, String>>,
}

impl MockServiceProbe {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_state(self, unit: &str, state: &str) -> Self {
        self.set_state(unit, state);
        self
    }

    pub fn set_state(&self, unit: &str, state: &str) {
        self.states
            .lock()
            .unwrap()
            .insert(unit.to_string(), state.to_string());
    }

    pub fn remove(&self, unit: &str) {
        self.states.lock().unwrap().remove(unit);
    }
}

impl Default for MockServiceProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceProbe for MockServiceProbe {
    async fn active_state(&self, unit: &str) -> Result<String> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(unit)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()))
    }

    async fn unit_exists(&self, unit: &str) -> Result<bool> {
        Ok(self.states.lock().unwrap().contains_key(unit))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_stat_parses_idle_and_total() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\ncpu1 50 0 25 400 25 0 0 0 0 0\n";
        let (idle, total) = ProcMetricProbe::parse_proc_stat(stat).unwrap();
        assert_eq!(idle, 850);
        assert_eq!(total, 1000);
        assert_eq!(ProcMetricProbe::count_cores(stat), 2);
    }

    #[test]
    fn meminfo_computes_used_percent() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        let pct = ProcMetricProbe::parse_meminfo(meminfo).unwrap();
        assert!((pct - 75.0).abs() < 0.01);
    }

    #[test]
    fn loadavg_takes_first_field() {
        assert_eq!(
            ProcMetricProbe::parse_loadavg("1.42 0.98 0.75 2/345 6789\n").unwrap(),
            1.42
        );
    }

    #[test]
    fn df_pcent_parses() {
        assert_eq!(
            ProcMetricProbe::parse_df("Use%\n 87%\n").unwrap(),
            87.0
        );
        assert!(ProcMetricProbe::parse_df("garbage").is_err());
    }

    #[tokio::test]
    async fn mock_service_probe_tracks_states() {
        let probe = MockServiceProbe::new().with_state("nginx", "failed");
        assert!(probe.unit_exists("nginx").await.unwrap());
        assert!(!probe.unit_exists("mysql").await.unwrap());
        assert_eq!(probe.active_state("nginx").await.unwrap(), "failed");

        probe.set_state("nginx", "active");
        assert_eq!(probe.active_state("nginx").await.unwrap(), "active");
    }
}
