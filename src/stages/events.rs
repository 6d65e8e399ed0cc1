//! Messages exchanged between stages.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Published by the ingress once an uploaded file is on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReadyEvent {
    pub file_id: Uuid,
    pub file_path: String,
    pub file_name: String,
}

/// A validated debt row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub name: String,
    pub government_id: String,
    pub email: String,
    pub debt_amount: f64,
    /// `YYYY-MM-DD`
    pub debt_due_date: String,
    pub debt_id: Uuid,
}

/// Bounded unit of work produced by the file split stage
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEvent {
    pub file_id: Uuid,
    pub chunk: Vec<Row>,
}

/// Chunk as received by the chunk ingest stage.
///
/// Rows stay untyped so one malformed row cannot fail the whole message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChunkEvent {
    pub file_id: Uuid,
    pub chunk: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRequest {
    /// Government id of the debtor
    pub user_id: String,
    pub debt_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub user_id: String,
    pub document_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_ready_wire_format() {
        let event: FileReadyEvent = serde_json::from_str(
            r#"{"fileId":"5f0c3a8e-8f43-4a57-9d2e-3a7f7b1d2c11","filePath":"/tmp/x_debts.csv","fileName":"debts.csv"}"#,
        )
        .unwrap();
        assert_eq!(event.file_name, "debts.csv");
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let result = serde_json::from_str::<DocumentRequest>(r#"{"userId":"123"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_chunk_rows_use_camel_case() {
        let event = ChunkEvent {
            file_id: Uuid::nil(),
            chunk: vec![Row {
                name: "Ana".to_string(),
                government_id: "111".to_string(),
                email: "ana@example.com".to_string(),
                debt_amount: 12.5,
                debt_due_date: "2024-05-01".to_string(),
                debt_id: Uuid::nil(),
            }],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["chunk"][0]["governmentId"], "111");
        assert_eq!(value["chunk"][0]["debtDueDate"], "2024-05-01");

        let raw: RawChunkEvent = serde_json::from_value(value).unwrap();
        assert_eq!(raw.chunk.len(), 1);
    }
}
