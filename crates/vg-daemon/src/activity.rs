//! System-activity reports from sar-style text dumps.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use vg_core::types::{ActivityReport, IoStats, NetStats};

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ActivityError>;

// ---------------------------------------------------------------------------
// ActivitySource trait
// ---------------------------------------------------------------------------

/// Produces periodic activity reports. A host without the underlying data
/// source simply yields `None` and the context section is omitted.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn collect(&self) -> Result<Option<ActivityReport>>;
}

// ---------------------------------------------------------------------------
// SarActivitySource
// ---------------------------------------------------------------------------

/// Collects from the sysstat `sar` tool.
pub struct SarActivitySource;

impl SarActivitySource {
    async fn run_sar(args: &[&str]) -> Option<String> {
        let output = tokio::process::Command::new("sar")
            .args(args)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `sar -u`: Average line, %idle in the last column -> busy percent.
    fn parse_cpu(text: &str) -> Option<f64> {
        let avg = text.lines().find(|l| l.starts_with("Average"))?;
        let idle: f64 = avg.split_whitespace().last()?.parse().ok()?;
        Some((100.0 - idle).clamp(0.0, 100.0))
    }

    /// `sar -r`: %memused column (by header position).
    fn parse_mem(text: &str) -> Option<f64> {
        let header = text.lines().find(|l| l.contains("%memused"))?;
        let col = header
            .split_whitespace()
            .position(|f| f == "%memused")?;
        let avg = text.lines().find(|l| l.starts_with("Average"))?;
        avg.split_whitespace().nth(col)?.parse().ok()
    }

    /// `sar -b`: bread/s and bwrtn/s columns, 512-byte blocks -> kB/s.
    fn parse_io(text: &str) -> Option<IoStats> {
        let header = text
            .lines()
            .find(|l| l.contains("bread/s") && l.contains("bwrtn/s"))?;
        let cols: Vec<&str> = header.split_whitespace().collect();
        let read_col = cols.iter().position(|f| *f == "bread/s")?;
        let write_col = cols.iter().position(|f| *f == "bwrtn/s")?;
        let avg: Vec<&str> = text
            .lines()
            .find(|l| l.starts_with("Average"))?
            .split_whitespace()
            .collect();
        Some(IoStats {
            read_kb_s: avg.get(read_col)?.parse::<f64>().ok()? / 2.0,
            write_kb_s: avg.get(write_col)?.parse::<f64>().ok()? / 2.0,
        })
    }

    /// `sar -n DEV`: rxkB/s + txkB/s summed over non-loopback interfaces.
    fn parse_net(text: &str) -> Option<NetStats> {
        let header = text
            .lines()
            .find(|l| l.contains("rxkB/s") && l.contains("txkB/s"))?;
        let cols: Vec<&str> = header.split_whitespace().collect();
        let iface_col = cols.iter().position(|f| *f == "IFACE")?;
        let rx_col = cols.iter().position(|f| *f == "rxkB/s")?;
        let tx_col = cols.iter().position(|f| *f == "txkB/s")?;

        let mut stats = NetStats::default();
        let mut seen = false;
        for line in text.lines().filter(|l| l.starts_with("Average")) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let Some(iface) = fields.get(iface_col) else {
                continue;
            };
            if *iface == "lo" || *iface == "IFACE" {
                continue;
            }
            let (Some(rx), Some(tx)) = (fields.get(rx_col), fields.get(tx_col)) else {
                continue;
            };
            let (Ok(rx), Ok(tx)) = (rx.parse::<f64>(), tx.parse::<f64>()) else {
                continue;
            };
            stats.rx_kb_s += rx;
            stats.tx_kb_s += tx;
            seen = true;
        }
        seen.then_some(stats)
    }
}

#[async_trait]
impl ActivitySource for SarActivitySource {
    async fn collect(&self) -> Result<Option<ActivityReport>> {
        // One-second single-interval samples; sar missing means no report.
        let Some(cpu_text) = Self::run_sar(&["-u", "1", "1"]).await else {
            debug!("sar unavailable, skipping activity report");
            return Ok(None);
        };
        let Some(cpu_pct) = Self::parse_cpu(&cpu_text) else {
            return Ok(None);
        };

        let mem_pct = match Self::run_sar(&["-r", "1", "1"]).await {
            Some(text) => Self::parse_mem(&text).unwrap_or(0.0),
            None => 0.0,
        };
        let io_stats = match Self::run_sar(&["-b", "1", "1"]).await {
            Some(text) => Self::parse_io(&text).unwrap_or_default(),
            None => IoStats::default(),
        };
        let net_stats = match Self::run_sar(&["-n", "DEV", "1", "1"]).await {
            Some(text) => Self::parse_net(&text).unwrap_or_default(),
            None => NetStats::default(),
        };

        Ok(Some(ActivityReport {
            collected_at: Utc::now(),
            cpu_pct,
            mem_pct,
            io_stats,
            net_stats,
        }))
    }
}

/// Fixed report (or none) for tests.
pub struct MockActivitySource(pub Option<ActivityReport>);

#[async_trait]
impl ActivitySource for MockActivitySource {
    async fn collect(&self) -> Result<Option<ActivityReport>> {
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAR_U: &str = "\
Linux 6.6.0 (macha) \t01/02/26 \t_x86_64_\t(8 CPU)

12:00:01        CPU     %user     %nice   %system   %iowait    %steal     %idle
12:00:02        all      12.50      0.00      3.20      0.80      0.00     83.50
Average:        all      12.50      0.00      3.20      0.80      0.00     83.50
";

    const SAR_R: &str = "\
12:00:01    kbmemfree   kbavail kbmemused  %memused kbbuffers  kbcached
Average:      2048000   4096000  12288000     75.00    102400   3072000
";

    const SAR_B: &str = "\
12:00:01          tps      rtps      wtps   bread/s   bwrtn/s
Average:        42.00     10.00     32.00    800.00   1600.00
";

    const SAR_N: &str = "\
12:00:01        IFACE   rxpck/s   txpck/s    rxkB/s    txkB/s   rxcmp/s   txcmp/s  rxmcst/s
Average:           lo      1.00      1.00      0.10      0.10      0.00      0.00      0.00
Average:         eth0    100.00     80.00    512.00    256.00      0.00      0.00      0.00
Average:        wlan0     10.00      5.00     64.00     32.00      0.00      0.00      0.00
";

    #[test]
    fn cpu_busy_is_complement_of_idle() {
        let cpu = SarActivitySource::parse_cpu(SAR_U).unwrap();
        assert!((cpu - 16.5).abs() < 0.01);
    }

    #[test]
    fn mem_reads_memused_column() {
        assert_eq!(SarActivitySource::parse_mem(SAR_R).unwrap(), 75.0);
    }

    #[test]
    fn io_converts_blocks_to_kb() {
        let io = SarActivitySource::parse_io(SAR_B).unwrap();
        assert_eq!(io.read_kb_s, 400.0);
        assert_eq!(io.write_kb_s, 800.0);
    }

    #[test]
    fn net_sums_non_loopback_interfaces() {
        let net = SarActivitySource::parse_net(SAR_N).unwrap();
        assert_eq!(net.rx_kb_s, 576.0);
        assert_eq!(net.tx_kb_s, 288.0);
    }

    #[test]
    fn missing_columns_yield_none() {
        assert!(SarActivitySource::parse_cpu("no average here").is_none());
        assert!(SarActivitySource::parse_mem(SAR_U).is_none());
        assert!(SarActivitySource::parse_net(SAR_B).is_none());
    }

    #[tokio::test]
    async fn mock_source_yields_configured_report() {
        let report = ActivityReport {
            collected_at: Utc::now(),
            cpu_pct: 20.0,
            mem_pct: 60.0,
            io_stats: IoStats::default(),
            net_stats: NetStats::default(),
        };
        let source = MockActivitySource(Some(report.clone()));
        assert_eq!(source.collect().await.unwrap(), Some(report));

        let absent = MockActivitySource(None);
        assert_eq!(absent.collect().await.unwrap(), None);
    }
}
