use std::sync::Arc;

use helpdesk_storage::{ConversationId, ConversationPatch, Gateway};
use tokio::task::JoinHandle;

/// Clears a conversation's unread counter. Failures are logged and swallowed.
#[derive(Clone)]
pub struct ReadStateTracker {
    gateway: Arc<dyn Gateway>,
}

impl ReadStateTracker {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    /// Returns whether the write landed.
    pub async fn mark_read(&self, conversation_id: ConversationId) -> bool {
        match self
            .gateway
            .update_conversation(conversation_id, ConversationPatch::mark_read())
            .await
        {
            Ok(()) => {
                tracing::debug!(conversation_id = %conversation_id, "conversation marked read");
                true
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    stage = error.stage(),
                    "failed to mark conversation read: {}",
                    error
                );
                false
            }
        }
    }

    /// Fire-and-forget variant; the caller never waits on it.
    pub fn spawn_mark_read(&self, conversation_id: ConversationId) -> JoinHandle<bool> {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.mark_read(conversation_id).await })
    }
}
