//! Append-only JSON-Lines logs (decisions, actions) and tail reads for
//! the `vg logs` subcommand.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// One append-only JSONL stream.
#[derive(Clone)]
pub struct JsonlLog {
    path: PathBuf,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, record: &T) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{line}")
    }
}

/// Last `n` lines of a JSONL stream; missing files read as empty.
pub fn tail(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_tail_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlLog::new(dir.path().join("decisions.jsonl"));

        for i in 0..5 {
            log.append(&serde_json::json!({"cycle": i})).unwrap();
        }

        let last_two = tail(log.path(), 2).unwrap();
        assert_eq!(last_two.len(), 2);
        assert!(last_two[1].contains("\"cycle\":4"));
    }

    #[test]
    fn tail_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(tail(&dir.path().join("nope.jsonl"), 10).unwrap().is_empty());
    }

    #[test]
    fn append_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlLog::new(dir.path().join("nested/dir/actions.jsonl"));
        log.append(&serde_json::json!({"ok": true})).unwrap();
        assert_eq!(tail(log.path(), 10).unwrap().len(), 1);
    }
}
