use async_trait::async_trait;
use std::sync::Arc;

use crate::capabilities::Notifier;
use crate::pipeline::{Stage, StageError};
use crate::stages::events::NotificationEvent;

pub struct NotificationStage {
    notifier: Arc<dyn Notifier>,
}

impl NotificationStage {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl Stage for NotificationStage {
    type Message = NotificationEvent;

    fn name(&self) -> &str {
        "notification"
    }

    async fn handle(&self, event: NotificationEvent) -> Result<(), StageError> {
        self.notifier.notify(&event.user_id, event.document_id).await?;
        Ok(())
    }
}
