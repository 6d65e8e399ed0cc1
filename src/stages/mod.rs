//! Pipeline stages and their canonical topology.

pub mod chunk_ingest;
pub mod document;
pub mod events;
pub mod file_split;
pub mod notification;
pub mod rejects;
pub mod validation;

use std::fmt;
use std::str::FromStr;

use crate::pipeline::QueueTopology;

pub use chunk_ingest::ChunkIngestStage;
pub use document::DocumentStage;
pub use events::{ChunkEvent, DocumentRequest, FileReadyEvent, NotificationEvent, RawChunkEvent, Row};
pub use file_split::FileSplitStage;
pub use notification::NotificationStage;
pub use rejects::RejectLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    FileSplit,
    ChunkIngest,
    DocumentGeneration,
    Notification,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::FileSplit,
        StageKind::ChunkIngest,
        StageKind::DocumentGeneration,
        StageKind::Notification,
    ];

    /// (queue, exchange, routing key)
    fn names(self) -> (&'static str, &'static str, &'static str) {
        match self {
            StageKind::FileSplit => ("file_processing_queue", "file_exchange", "file.process"),
            StageKind::ChunkIngest => ("chunk_processing_queue", "chunk_exchange", "chunk.process"),
            StageKind::DocumentGeneration => {
                ("document_generation_queue", "document_exchange", "document.generate")
            }
            StageKind::Notification => ("notification_queue", "notification_exchange", "notification.send"),
        }
    }

    pub fn topology(self, retry_delay_ms: u64) -> QueueTopology {
        let (queue, exchange, routing_key) = self.names();
        QueueTopology::new(queue, exchange, routing_key, retry_delay_ms)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::FileSplit => "file-split",
            StageKind::ChunkIngest => "chunk-ingest",
            StageKind::DocumentGeneration => "document",
            StageKind::Notification => "notification",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}
