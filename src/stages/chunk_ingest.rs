//! Chunk ingest stage: re-validate rows, upsert users and debts, request documents.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::persistence::{DebtStore, UpsertBatch};
use crate::pipeline::{Publisher, Route, Stage, StageError};
use crate::stages::events::{DocumentRequest, RawChunkEvent, Row};
use crate::stages::rejects::{RejectedRow, REJECTED_ROWS_TARGET};
use crate::stages::validation::RawRow;

/// Valid rows of a chunk, partitioned for the store
#[derive(Debug, Default)]
pub struct PreparedChunk {
    pub batch: UpsertBatch,
    pub rows: Vec<Row>,
    pub rejected: Vec<RejectedRow>,
}

/// Validate every row and build the upsert batch; users are deduplicated by government id
pub fn prepare_chunk(event: &RawChunkEvent) -> PreparedChunk {
    let file_name = event.file_id.to_string();
    let mut users = IndexMap::new();
    let mut prepared = PreparedChunk::default();

    for (index, value) in event.chunk.iter().enumerate() {
        let row = RawRow::validate_value(value).and_then(|row| {
            let debt = row.to_debt(event.file_id)?;
            Ok((row, debt))
        });
        match row {
            Ok((row, debt)) => {
                users
                    .entry(row.government_id.clone())
                    .or_insert_with(|| row.to_user());
                prepared.batch.debts.push(debt);
                prepared.rows.push(row);
            }
            Err(reason) => prepared.rejected.push(RejectedRow {
                file_name: file_name.clone(),
                line: index as u64 + 1,
                reason: reason.to_string(),
                raw: value.to_string(),
            }),
        }
    }

    prepared.batch.users = users.into_values().collect();
    prepared
}

pub struct ChunkIngestStage {
    store: Arc<dyn DebtStore>,
    publisher: Option<Publisher>,
    document_route: Route,
}

impl ChunkIngestStage {
    /// Without a publisher the stage ends after persisting
    pub fn new(store: Arc<dyn DebtStore>, publisher: Option<Publisher>, document_route: Route) -> Self {
        Self {
            store,
            publisher,
            document_route,
        }
    }
}

#[async_trait]
impl Stage for ChunkIngestStage {
    type Message = RawChunkEvent;

    fn name(&self) -> &str {
        "chunk-ingest"
    }

    async fn handle(&self, event: RawChunkEvent) -> Result<(), StageError> {
        let file_id: Uuid = event.file_id;
        let prepared = prepare_chunk(&event);

        for rejected in &prepared.rejected {
            tracing::warn!(
                target: REJECTED_ROWS_TARGET,
                file_id = %file_id,
                index = rejected.line,
                reason = %rejected.reason,
                "Dropped invalid chunk row"
            );
        }

        if prepared.rows.is_empty() {
            tracing::warn!(file_id = %file_id, rows = event.chunk.len(), "No valid rows in chunk");
            return Ok(());
        }

        let summary = self.store.upsert_batch(&prepared.batch).await?;
        tracing::info!(
            file_id = %file_id,
            valid = prepared.rows.len(),
            rejected = prepared.rejected.len(),
            users_inserted = summary.users_inserted,
            debts_inserted = summary.debts_inserted,
            "Chunk persisted"
        );

        // Every persisted debt is requested, not only fresh inserts, so a redelivery
        // after a partial publish still reaches document generation
        if let Some(publisher) = &self.publisher {
            for row in &prepared.rows {
                publisher
                    .publish(
                        &self.document_route,
                        &DocumentRequest {
                            user_id: row.government_id.clone(),
                            debt_id: row.debt_id,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
