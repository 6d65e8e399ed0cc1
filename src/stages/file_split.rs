//! File split stage: CSV file in, bounded chunk events out.

use async_trait::async_trait;
use std::fs::File;
use std::io::Read;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::pipeline::{Publisher, Route, Stage, StageError};
use crate::stages::events::{ChunkEvent, FileReadyEvent, Row};
use crate::stages::rejects::{RejectLog, RejectedRow};
use crate::stages::validation::RawRow;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Chunks waiting between the reader thread and the publisher
const CHUNK_BUFFER: usize = 4;

/// Stable per source row: the same file and line always give the same id
pub fn debt_id_for(file_id: Uuid, line: u64) -> Uuid {
    Uuid::new_v5(&file_id, line.to_string().as_bytes())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitStats {
    pub rows: u64,
    pub valid: u64,
    pub rejected: u64,
    pub chunks: u64,
}

/// Read CSV rows, validate them and hand full chunks to `emit` as they fill up.
///
/// Invalid rows are written to `rejects` and skipped. The final partial chunk is
/// emitted when the input ends. Errors from `emit` abort the split.
pub fn split_rows<R, F>(
    input: R,
    file_id: Uuid,
    file_name: &str,
    chunk_size: usize,
    rejects: &RejectLog,
    mut emit: F,
) -> Result<SplitStats, StageError>
where
    R: Read,
    F: FnMut(Vec<Row>) -> Result<(), StageError>,
{
    let chunk_size = chunk_size.max(1);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    let headers = reader.headers()?.clone();

    let mut stats = SplitStats::default();
    let mut chunk = Vec::with_capacity(chunk_size);
    let mut rejected = Vec::new();

    for result in reader.records() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                if let csv::ErrorKind::Utf8 { pos, err } = e.kind() {
                    stats.rows += 1;
                    rejected.push(RejectedRow {
                        file_name: file_name.to_string(),
                        line: pos.as_ref().map(|p| p.line()).unwrap_or(0),
                        reason: format!("invalid UTF-8: {}", err),
                        raw: String::new(),
                    });
                    continue;
                }
                return Err(e.into());
            }
        };
        stats.rows += 1;
        let line = record.position().map(|p| p.line()).unwrap_or(stats.rows + 1);

        let mut raw = RawRow::from_record(&headers, &record);
        raw.debt_id = None;
        match raw.validate(Some(debt_id_for(file_id, line))) {
            Ok(row) => {
                stats.valid += 1;
                chunk.push(row);
                if chunk.len() == chunk_size {
                    emit(std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size)))?;
                    stats.chunks += 1;
                }
            }
            Err(reason) => rejected.push(RejectedRow {
                file_name: file_name.to_string(),
                line,
                reason: reason.to_string(),
                raw: record.iter().collect::<Vec<_>>().join(","),
            }),
        }

        if rejected.len() >= chunk_size {
            stats.rejected += rejected.len() as u64;
            rejects.record(file_name, &rejected);
            rejected.clear();
        }
    }

    if !chunk.is_empty() {
        emit(chunk)?;
        stats.chunks += 1;
    }
    stats.rejected += rejected.len() as u64;
    rejects.record(file_name, &rejected);

    Ok(stats)
}

pub struct FileSplitStage {
    publisher: Publisher,
    chunk_route: Route,
    chunk_size: usize,
    rejects: RejectLog,
}

impl FileSplitStage {
    pub fn new(publisher: Publisher, chunk_route: Route, chunk_size: usize, rejects: RejectLog) -> Self {
        Self {
            publisher,
            chunk_route,
            chunk_size,
            rejects,
        }
    }
}

#[async_trait]
impl Stage for FileSplitStage {
    type Message = FileReadyEvent;

    fn name(&self) -> &str {
        "file-split"
    }

    async fn handle(&self, event: FileReadyEvent) -> Result<(), StageError> {
        if event.file_path.trim().is_empty() {
            return Err(StageError::InvalidEvent("filePath is empty".to_string()));
        }
        tracing::info!(file_id = %event.file_id, file_name = %event.file_name, "Splitting file");

        let (sender, mut receiver) = mpsc::channel::<Vec<Row>>(CHUNK_BUFFER);
        let file_id = event.file_id;
        let file_path = event.file_path.clone();
        let file_name = event.file_name.clone();
        let chunk_size = self.chunk_size;
        let rejects = self.rejects.clone();

        let reader = tokio::task::spawn_blocking(move || {
            let file = File::open(&file_path)?;
            split_rows(file, file_id, &file_name, chunk_size, &rejects, |chunk| {
                sender.blocking_send(chunk).map_err(|_| {
                    StageError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "chunk publisher stopped",
                    ))
                })
            })
        });

        while let Some(chunk) = receiver.recv().await {
            let size = chunk.len();
            self.publisher
                .publish(&self.chunk_route, &ChunkEvent { file_id, chunk })
                .await?;
            tracing::debug!(file_id = %file_id, rows = size, "Published chunk");
        }

        let stats = reader
            .await
            .map_err(|e| StageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))??;

        tracing::info!(
            file_id = %file_id,
            file_name = %event.file_name,
            rows = stats.rows,
            valid = stats.valid,
            rejected = stats.rejected,
            chunks = stats.chunks,
            "File split complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const CSV: &str = "name,governmentId,email,debtAmount,debtDueDate,debtId\n\
        Ana,111,ana@example.com,10.00,2024-01-01,ignored\n\
        Bia,222,not-an-email,20.00,2024-01-02,\n\
        Caio,333,caio@example.com,30.00,2024-01-03,\n\
        Davi,444,davi@example.com,40.00,2024-01-04,\n\
        Eva,555,eva@example.com,50.00,2024-01-05,\n";

    fn split(input: &str, chunk_size: usize, rejects: &RejectLog) -> (Vec<Vec<Row>>, SplitStats) {
        let mut chunks = Vec::new();
        let stats = split_rows(input.as_bytes(), Uuid::nil(), "debts.csv", chunk_size, rejects, |c| {
            chunks.push(c);
            Ok(())
        })
        .unwrap();
        (chunks, stats)
    }

    #[test]
    fn test_chunks_cover_every_valid_row_once() {
        let (chunks, stats) = split(CSV, 2, &RejectLog::default());

        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2]);
        assert_eq!(stats, SplitStats { rows: 5, valid: 4, rejected: 1, chunks: 2 });

        let ids: HashSet<Uuid> = chunks.iter().flatten().map(|r| r.debt_id).collect();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_debt_ids_are_assigned_from_file_and_line() {
        let (first, _) = split(CSV, 10, &RejectLog::default());
        let (second, _) = split(CSV, 3, &RejectLog::default());

        let first: Vec<Uuid> = first.into_iter().flatten().map(|r| r.debt_id).collect();
        let second: Vec<Uuid> = second.into_iter().flatten().map(|r| r.debt_id).collect();
        assert_eq!(first, second);
        assert_eq!(first[0], debt_id_for(Uuid::nil(), 2));
        assert_ne!(debt_id_for(Uuid::nil(), 2), debt_id_for(Uuid::new_v4(), 2));
    }

    #[test]
    fn test_rejected_rows_are_logged_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let log = RejectLog::new(Some(dir.path().to_path_buf()));
        split(CSV, 2, &log);

        let contents = std::fs::read_to_string(dir.path().join("debts.csv.rejected.ndjson")).unwrap();
        let entry: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(entry["line"], 3);
        assert!(entry["reason"].as_str().unwrap().contains("email"));
    }

    #[test]
    fn test_header_only_file_emits_nothing() {
        let (chunks, stats) = split("name,governmentId,email,debtAmount,debtDueDate\n", 2, &RejectLog::default());
        assert!(chunks.is_empty());
        assert_eq!(stats.chunks, 0);
    }

    #[tokio::test]
    async fn test_missing_file_fails_the_message() {
        use crate::broker::{Broker, MemoryBroker};

        let broker = MemoryBroker::new();
        let publisher = Publisher::new(broker.open_channel().await.unwrap());
        let stage = FileSplitStage::new(publisher, Route::new("chunk_exchange", "chunk.process"), 2, RejectLog::default());

        let err = stage
            .handle(FileReadyEvent {
                file_id: Uuid::new_v4(),
                file_path: "/definitely/not/here.csv".to_string(),
                file_name: "here.csv".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Io(_)));
    }
}
