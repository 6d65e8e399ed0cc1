//! In-memory store with the same insert-or-ignore semantics as [`super::PgStore`].

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::persistence::{
    DebtStore, DocumentRecord, DocumentStore, NewDebt, NewUser, NotificationClaim, PersistenceError,
    UpsertBatch, UpsertSummary,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: Uuid,
    pub debt_id: Uuid,
    pub government_id: String,
    pub notified: bool,
}

#[derive(Default)]
struct Tables {
    users: IndexMap<String, NewUser>,
    debts: IndexMap<Uuid, NewDebt>,
    documents: HashMap<Uuid, StoredDocument>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    failing: AtomicBool,
    batch_writes: AtomicUsize,
    notifications: AtomicUsize,
}

/// Cloneable handle; clones share the same tables
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful `upsert_batch` calls that reached the tables
    pub fn batch_writes(&self) -> usize {
        self.inner.batch_writes.load(Ordering::SeqCst)
    }

    /// Number of notification claims that flipped a document to notified
    pub fn notifications(&self) -> usize {
        self.inner.notifications.load(Ordering::SeqCst)
    }

    pub fn users(&self) -> Vec<NewUser> {
        self.tables().users.values().cloned().collect()
    }

    pub fn debts(&self) -> Vec<NewDebt> {
        self.tables().debts.values().cloned().collect()
    }

    pub fn documents(&self) -> Vec<StoredDocument> {
        self.tables().documents.values().cloned().collect()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.inner.failing.load(Ordering::SeqCst) {
            Err(PersistenceError::Unavailable("memory store set to fail".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DebtStore for MemoryStore {
    async fn upsert_batch(&self, batch: &UpsertBatch) -> Result<UpsertSummary, PersistenceError> {
        self.check()?;
        if batch.is_empty() {
            return Ok(UpsertSummary::default());
        }

        let mut tables = self.tables();
        // Foreign key check happens before any write so a failed batch leaves nothing behind
        for debt in &batch.debts {
            let known = tables.users.contains_key(&debt.government_id)
                || batch.users.iter().any(|u| u.government_id == debt.government_id);
            if !known {
                return Err(PersistenceError::Query(format!(
                    "debt {} references unknown user {}",
                    debt.debt_id, debt.government_id
                )));
            }
        }

        let mut summary = UpsertSummary::default();
        for user in &batch.users {
            if !tables.users.contains_key(&user.government_id) {
                tables.users.insert(user.government_id.clone(), user.clone());
                summary.users_inserted += 1;
            }
        }
        for debt in &batch.debts {
            if !tables.debts.contains_key(&debt.debt_id) {
                tables.debts.insert(debt.debt_id, debt.clone());
                summary.debts_inserted += 1;
            }
        }
        self.inner.batch_writes.fetch_add(1, Ordering::SeqCst);
        Ok(summary)
    }

    async fn ping(&self) -> Result<(), PersistenceError> {
        self.check()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_document(&self, government_id: &str, debt_id: Uuid) -> Result<DocumentRecord, PersistenceError> {
        self.check()?;
        let mut tables = self.tables();
        if let Some(existing) = tables.documents.values().find(|d| d.debt_id == debt_id) {
            return Ok(DocumentRecord {
                id: existing.id,
                created: false,
                notified: existing.notified,
            });
        }
        let id = Uuid::new_v4();
        tables.documents.insert(
            id,
            StoredDocument {
                id,
                debt_id,
                government_id: government_id.to_string(),
                notified: false,
            },
        );
        Ok(DocumentRecord {
            id,
            created: true,
            notified: false,
        })
    }

    async fn mark_notified(&self, document_id: Uuid) -> Result<NotificationClaim, PersistenceError> {
        self.check()?;
        match self.tables().documents.get_mut(&document_id) {
            Some(document) if document.notified => Ok(NotificationClaim::AlreadyNotified),
            Some(document) => {
                document.notified = true;
                self.inner.notifications.fetch_add(1, Ordering::SeqCst);
                Ok(NotificationClaim::Claimed)
            }
            None => Ok(NotificationClaim::UnknownDocument),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn batch() -> UpsertBatch {
        UpsertBatch {
            users: vec![NewUser {
                name: "Ana".to_string(),
                government_id: "111".to_string(),
                email: "ana@example.com".to_string(),
            }],
            debts: vec![NewDebt {
                debt_id: Uuid::new_v4(),
                government_id: "111".to_string(),
                file_id: Uuid::new_v4(),
                amount: 10.5,
                due_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            }],
        }
    }

    #[tokio::test]
    async fn test_repeated_batch_inserts_nothing_new() {
        let store = MemoryStore::new();
        let batch = batch();

        let first = store.upsert_batch(&batch).await.unwrap();
        let second = store.upsert_batch(&batch).await.unwrap();

        assert_eq!(first, UpsertSummary { users_inserted: 1, debts_inserted: 1 });
        assert_eq!(second, UpsertSummary::default());
        assert_eq!(store.users().len(), 1);
        assert_eq!(store.debts().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_user_rolls_back_whole_batch() {
        let store = MemoryStore::new();
        let mut batch = batch();
        batch.users.clear();

        assert!(store.upsert_batch(&batch).await.is_err());
        assert!(store.debts().is_empty());
        assert_eq!(store.batch_writes(), 0);
    }

    #[tokio::test]
    async fn test_document_is_created_once_per_debt() {
        let store = MemoryStore::new();
        let debt_id = Uuid::new_v4();

        let first = store.insert_document("111", debt_id).await.unwrap();
        let again = store.insert_document("111", debt_id).await.unwrap();
        assert!(first.created);
        assert!(!again.created);
        assert_eq!(first.id, again.id);

        assert_eq!(store.mark_notified(first.id).await.unwrap(), NotificationClaim::Claimed);
        assert_eq!(
            store.mark_notified(Uuid::new_v4()).await.unwrap(),
            NotificationClaim::UnknownDocument
        );
        assert!(store.documents()[0].notified);
    }

    #[tokio::test]
    async fn test_notification_is_claimed_once() {
        let store = MemoryStore::new();
        let document = store.insert_document("111", Uuid::new_v4()).await.unwrap();

        assert_eq!(store.mark_notified(document.id).await.unwrap(), NotificationClaim::Claimed);
        assert_eq!(
            store.mark_notified(document.id).await.unwrap(),
            NotificationClaim::AlreadyNotified
        );
        assert_eq!(store.notifications(), 1);

        let reread = store.insert_document("111", store.documents()[0].debt_id).await.unwrap();
        assert!(reread.notified);
    }
}
