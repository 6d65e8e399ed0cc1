use async_trait::async_trait;
use std::sync::Arc;

use crate::capabilities::DocumentGenerator;
use crate::pipeline::{Publisher, Route, Stage, StageError};
use crate::stages::events::{DocumentRequest, NotificationEvent};

/// Generates the billing document for a debt, then asks for the user to be notified
pub struct DocumentStage {
    generator: Arc<dyn DocumentGenerator>,
    publisher: Publisher,
    notification_route: Route,
}

impl DocumentStage {
    pub fn new(generator: Arc<dyn DocumentGenerator>, publisher: Publisher, notification_route: Route) -> Self {
        Self {
            generator,
            publisher,
            notification_route,
        }
    }
}

#[async_trait]
impl Stage for DocumentStage {
    type Message = DocumentRequest;

    fn name(&self) -> &str {
        "document"
    }

    async fn handle(&self, request: DocumentRequest) -> Result<(), StageError> {
        let document = self
            .generator
            .generate_document(&request.user_id, request.debt_id)
            .await?;
        if document.notified {
            tracing::debug!(debt_id = %request.debt_id, document_id = %document.id, "Document already notified");
            return Ok(());
        }

        self.publisher
            .publish(
                &self.notification_route,
                &NotificationEvent {
                    user_id: request.user_id,
                    document_id: document.id,
                },
            )
            .await?;
        Ok(())
    }
}
