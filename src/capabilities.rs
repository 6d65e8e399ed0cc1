//! Document generation and notification capabilities.
//!
//! Stages only see these traits. The defaults record billing documents in the
//! persistence layer and log notifications instead of sending email or SMS.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::persistence::{DocumentRecord, DocumentStore, NotificationClaim, PersistenceError};

#[derive(Debug)]
pub enum CapabilityError {
    /// A required input was empty
    MissingField(&'static str),
    /// The referenced document does not exist
    UnknownDocument(Uuid),
    Persistence(PersistenceError),
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityError::MissingField(field) => write!(f, "Missing required field '{}'", field),
            CapabilityError::UnknownDocument(id) => write!(f, "Unknown document {}", id),
            CapabilityError::Persistence(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CapabilityError {}

impl From<PersistenceError> for CapabilityError {
    fn from(err: PersistenceError) -> Self {
        CapabilityError::Persistence(err)
    }
}

#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    async fn generate_document(&self, user_id: &str, debt_id: Uuid) -> Result<DocumentRecord, CapabilityError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Notifying twice about the same document must not reach the user twice
    async fn notify(&self, user_id: &str, document_id: Uuid) -> Result<(), CapabilityError>;
}

/// Records one billing document per debt
pub struct BillingDocumentGenerator {
    store: Arc<dyn DocumentStore>,
}

impl BillingDocumentGenerator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DocumentGenerator for BillingDocumentGenerator {
    async fn generate_document(&self, user_id: &str, debt_id: Uuid) -> Result<DocumentRecord, CapabilityError> {
        if user_id.trim().is_empty() {
            return Err(CapabilityError::MissingField("userId"));
        }
        if debt_id.is_nil() {
            return Err(CapabilityError::MissingField("debtId"));
        }
        let document = self.store.insert_document(user_id, debt_id).await?;
        if document.created {
            tracing::info!(user_id, %debt_id, document_id = %document.id, "Billing document generated");
        } else {
            tracing::debug!(user_id, %debt_id, document_id = %document.id, "Billing document already exists");
        }
        Ok(document)
    }
}

/// Logs the notification once per document and marks it notified
pub struct LogNotifier {
    store: Arc<dyn DocumentStore>,
}

impl LogNotifier {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: &str, document_id: Uuid) -> Result<(), CapabilityError> {
        if user_id.trim().is_empty() {
            return Err(CapabilityError::MissingField("userId"));
        }
        if document_id.is_nil() {
            return Err(CapabilityError::MissingField("documentId"));
        }
        match self.store.mark_notified(document_id).await? {
            NotificationClaim::Claimed => {
                tracing::info!(user_id, %document_id, "User notified about billing document");
                Ok(())
            }
            NotificationClaim::AlreadyNotified => {
                tracing::debug!(user_id, %document_id, "Document already notified, skipping");
                Ok(())
            }
            NotificationClaim::UnknownDocument => Err(CapabilityError::UnknownDocument(document_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    #[tokio::test]
    async fn test_generate_then_notify() {
        let store = MemoryStore::new();
        let generator = BillingDocumentGenerator::new(Arc::new(store.clone()));
        let notifier = LogNotifier::new(Arc::new(store.clone()));

        let document = generator.generate_document("123", Uuid::new_v4()).await.unwrap();
        notifier.notify("123", document.id).await.unwrap();

        assert!(store.documents()[0].notified);
    }

    #[tokio::test]
    async fn test_repeated_notification_reaches_user_once() {
        let store = MemoryStore::new();
        let generator = BillingDocumentGenerator::new(Arc::new(store.clone()));
        let notifier = LogNotifier::new(Arc::new(store.clone()));
        let debt_id = Uuid::new_v4();

        let first = generator.generate_document("123", debt_id).await.unwrap();
        notifier.notify("123", first.id).await.unwrap();
        let second = generator.generate_document("123", debt_id).await.unwrap();
        notifier.notify("123", second.id).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.notified);
        assert_eq!(store.notifications(), 1);
    }

    #[tokio::test]
    async fn test_missing_fields_fail_fast() {
        let store = Arc::new(MemoryStore::new());
        let generator = BillingDocumentGenerator::new(store.clone());
        let notifier = LogNotifier::new(store);

        assert!(matches!(
            generator.generate_document(" ", Uuid::new_v4()).await,
            Err(CapabilityError::MissingField("userId"))
        ));
        assert!(matches!(
            generator.generate_document("123", Uuid::nil()).await,
            Err(CapabilityError::MissingField("debtId"))
        ));
        assert!(matches!(
            notifier.notify("123", Uuid::new_v4()).await,
            Err(CapabilityError::UnknownDocument(_))
        ));
    }
}
