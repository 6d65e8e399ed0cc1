//! Out-of-band log of rows that failed validation.
//!
//! Rejected rows always go to the `debtflow::rejected_rows` tracing target.
//! With a reject directory configured they are also appended as NDJSON to
//! `<dir>/<fileName>.rejected.ndjson`.

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const REJECTED_ROWS_TARGET: &str = "debtflow::rejected_rows";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedRow {
    pub file_name: String,
    /// 1-based line in the source file, header included
    pub line: u64,
    pub reason: String,
    pub raw: String,
}

/// Writes one JSON object per line
pub struct NdjsonWriter<W: Write> {
    writer: W,
}

impl<W: Write> NdjsonWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write<T: Serialize>(&mut self, entry: &T) -> std::io::Result<()> {
        let json = serde_json::to_string(entry).map_err(std::io::Error::from)?;
        writeln!(self.writer, "{}", json)
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RejectLog {
    dir: Option<PathBuf>,
}

impl RejectLog {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn path_for(&self, file_name: &str) -> Option<PathBuf> {
        let base = Path::new(file_name).file_name()?.to_string_lossy().into_owned();
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.rejected.ndjson", base)))
    }

    /// Record rejected rows of one file. Failing to write the file is logged, never propagated.
    pub fn record(&self, file_name: &str, rows: &[RejectedRow]) {
        if rows.is_empty() {
            return;
        }
        for row in rows {
            tracing::warn!(
                target: REJECTED_ROWS_TARGET,
                file_name = %row.file_name,
                line = row.line,
                reason = %row.reason,
                "Rejected row"
            );
        }

        let Some(path) = self.path_for(file_name) else {
            return;
        };
        if let Err(e) = Self::append(&path, rows) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write reject log");
        }
    }

    fn append(path: &Path, rows: &[RejectedRow]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = NdjsonWriter::new(BufWriter::new(file));
        for row in rows {
            writer.write(row)?;
        }
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(line: u64) -> RejectedRow {
        RejectedRow {
            file_name: "debts.csv".to_string(),
            line,
            reason: "missing field 'email'".to_string(),
            raw: "Ana,111,,10,2024-01-01".to_string(),
        }
    }

    #[test]
    fn test_appends_ndjson_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = RejectLog::new(Some(dir.path().to_path_buf()));

        log.record("debts.csv", &[rejected(2)]);
        log.record("debts.csv", &[rejected(5)]);

        let path = dir.path().join("debts.csv.rejected.ndjson");
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["fileName"], "debts.csv");
        assert_eq!(lines[1]["line"], 5);
    }

    #[test]
    fn test_file_name_cannot_escape_reject_dir() {
        let log = RejectLog::new(Some(PathBuf::from("/var/rejects")));
        assert_eq!(
            log.path_for("../../etc/passwd"),
            Some(PathBuf::from("/var/rejects/passwd.rejected.ndjson"))
        );
        assert_eq!(RejectLog::default().path_for("debts.csv"), None);
    }
}
