//! Persistence collaborator.
//!
//! Stores users, debts and billing documents. Every write is insert-or-ignore
//! on a natural key so redelivered messages are harmless.

pub mod database;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use std::fmt;
use uuid::Uuid;

pub use database::{Database, DatabaseConfig};
pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    pub name: String,
    pub government_id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDebt {
    pub debt_id: Uuid,
    pub government_id: String,
    pub file_id: Uuid,
    pub amount: f64,
    pub due_date: NaiveDate,
}

/// Users and debts written together in one transaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertBatch {
    pub users: Vec<NewUser>,
    pub debts: Vec<NewDebt>,
}

impl UpsertBatch {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.debts.is_empty()
    }
}

/// Rows actually inserted; conflicts are skipped silently
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub users_inserted: usize,
    pub debts_inserted: usize,
}

/// Billing document as seen right after `insert_document`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: Uuid,
    /// False when the document already existed for this debt
    pub created: bool,
    pub notified: bool,
}

/// Result of claiming the notification of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationClaim {
    /// This caller flipped the document to notified and owns the delivery
    Claimed,
    AlreadyNotified,
    UnknownDocument,
}

#[derive(Debug)]
pub enum PersistenceError {
    /// No connection could be checked out of the pool
    Pool(String),
    Query(String),
    /// The blocking database task died
    Task(String),
    /// Injected by test doubles
    Unavailable(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Pool(msg) => write!(f, "Connection pool error: {}", msg),
            PersistenceError::Query(msg) => write!(f, "Query failed: {}", msg),
            PersistenceError::Task(msg) => write!(f, "Database task failed: {}", msg),
            PersistenceError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<diesel::result::Error> for PersistenceError {
    fn from(err: diesel::result::Error) -> Self {
        PersistenceError::Query(err.to_string())
    }
}

impl From<r2d2::Error> for PersistenceError {
    fn from(err: r2d2::Error) -> Self {
        PersistenceError::Pool(err.to_string())
    }
}

impl From<tokio::task::JoinError> for PersistenceError {
    fn from(err: tokio::task::JoinError) -> Self {
        PersistenceError::Task(err.to_string())
    }
}

/// Users and debts
#[async_trait]
pub trait DebtStore: Send + Sync {
    /// Insert users then debts in one transaction, ignoring rows whose key already exists
    async fn upsert_batch(&self, batch: &UpsertBatch) -> Result<UpsertSummary, PersistenceError>;

    /// Round-trip a trivial query
    async fn ping(&self) -> Result<(), PersistenceError>;
}

/// Billing document records
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Document for `debt_id`, creating it if this is the first request
    async fn insert_document(&self, government_id: &str, debt_id: Uuid) -> Result<DocumentRecord, PersistenceError>;

    /// Mark a document notified; only the first caller gets [`NotificationClaim::Claimed`]
    async fn mark_notified(&self, document_id: Uuid) -> Result<NotificationClaim, PersistenceError>;
}
