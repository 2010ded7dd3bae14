//! Time measures of an offload run, appended as JSON lines.

use crate::error::{OffloadError, Result};
use crate::transport::ReadySignal;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// One measured event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeMeasure {
    /// Session setup: client-side preparation plus the server's ready signal.
    Session {
        module: String,
        setup_micros: i64,
        optimize_micros: i64,
        init_micros: i64,
    },
    /// A single call through a decision site.
    Call {
        function: String,
        path: String,
        score: u64,
        bytes: u64,
        /// Server execution time; absent for local calls.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        exec_micros: Option<i64>,
        call_micros: i64,
    },
}

impl TimeMeasure {
    pub fn session(module: &str, setup_micros: i64, ready: ReadySignal) -> Self {
        TimeMeasure::Session {
            module: module.to_string(),
            setup_micros,
            optimize_micros: ready.optimize_micros,
            init_micros: ready.init_micros,
        }
    }
}

/// Append-only log of time measures.
pub struct TimeMeasureLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TimeMeasureLog {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| OffloadError::Io {
                message: format!("Failed to open time log {}", path.display()),
                source: e,
            })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, measure: &TimeMeasure) -> Result<()> {
        serde_json::to_writer(&mut self.writer, measure)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Read back every measure stored in `path`.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<TimeMeasure>> {
        let file = File::open(path.as_ref())?;
        let mut measures = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            measures.push(serde_json::from_str(&line)?);
        }
        Ok(measures)
    }
}

impl Drop for TimeMeasureLog {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_appends_json_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("times.jsonl");

        {
            let mut log = TimeMeasureLog::open(&path).unwrap();
            log.record(&TimeMeasure::session(
                "kernels",
                120,
                ReadySignal {
                    optimize_micros: 40,
                    init_micros: 3,
                },
            ))
            .unwrap();
            log.record(&TimeMeasure::Call {
                function: "add".into(),
                path: "local".into(),
                score: 0,
                bytes: 12,
                exec_micros: None,
                call_micros: 1,
            })
            .unwrap();
        }
        {
            let mut log = TimeMeasureLog::open(&path).unwrap();
            log.record(&TimeMeasure::Call {
                function: "add".into(),
                path: "remote".into(),
                score: 100,
                bytes: 12,
                exec_micros: Some(2),
                call_micros: 90,
            })
            .unwrap();
            log.flush().unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().next().unwrap().contains("\"kind\":\"session\""));
        assert!(!text.lines().nth(1).unwrap().contains("exec_micros"));

        let measures = TimeMeasureLog::read_all(&path).unwrap();
        assert_eq!(measures.len(), 3);
        assert!(matches!(
            &measures[2],
            TimeMeasure::Call { exec_micros: Some(2), .. }
        ));
    }
}
