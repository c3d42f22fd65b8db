use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::OptionExt;

use super::error::{ConflictSnafu, NotFoundSnafu, StorageResult};
use super::feed::{FeedHub, FeedSubscription};
use super::ids::{ConversationId, MessageId, SubscriptionId, UserId};
use super::types::{
    ConversationPatch, ConversationRecord, ConversationStatus, FeedEvent, MessageOrder,
    MessageRecord, NewConversation, NewMessage,
};
use super::{BoxFuture, ChangeFeed, ConversationStore, MessageStore};

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, ConversationRecord>,
    // Unordered; every read sorts.
    messages: HashMap<MessageId, MessageRecord>,
    last_timestamp_millis: u64,
}

impl MemoryState {
    fn next_timestamp(&mut self) -> u64 {
        let next = unix_timestamp_millis().max(self.last_timestamp_millis.saturating_add(1));
        self.last_timestamp_millis = next;
        next
    }
}

/// Process-local gateway with the same contract as the hosted store.
#[derive(Debug)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
    feed: FeedHub,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new(FeedHub::default())
    }
}

impl MemoryGateway {
    pub fn new(feed: FeedHub) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            feed,
        }
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        Self::new(FeedHub::new(capacity))
    }

    pub fn feed(&self) -> &FeedHub {
        &self.feed
    }

    /// Simulates a transport outage on the change feed.
    pub fn disconnect_feed(&self) -> usize {
        self.feed.disconnect_all()
    }

    /// Stores an already-persisted row verbatim, without publishing it.
    ///
    /// Used to seed history imported from elsewhere.
    pub fn import_message(&self, record: MessageRecord) -> StorageResult<()> {
        let mut state = self.state();
        state
            .conversations
            .get(&record.conversation_id)
            .context(NotFoundSnafu {
                stage: "memory-import-message-conversation",
                entity: "conversation",
                id: record.conversation_id.to_string(),
            })?;

        if state.messages.contains_key(&record.id) {
            return ConflictSnafu {
                stage: "memory-import-message-duplicate",
                entity: "message",
                details: format!("message '{}' already exists", record.id),
            }
            .fail();
        }

        state.last_timestamp_millis = state
            .last_timestamp_millis
            .max(record.created_at_unix_millis);
        state.messages.insert(record.id, record);
        Ok(())
    }

    pub fn conversations_for_user(&self, user_id: UserId) -> Vec<ConversationRecord> {
        let mut conversations = self
            .state()
            .conversations
            .values()
            .filter(|conversation| conversation.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        conversations.sort_by_key(|conversation| conversation.created_at_unix_millis);
        conversations
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConversationStore for MemoryGateway {
    fn find_open_conversation<'a>(
        &'a self,
        user_id: UserId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            Ok(self
                .state()
                .conversations
                .values()
                .find(|conversation| conversation.user_id == user_id && conversation.status.is_open())
                .cloned())
        })
    }

    fn get_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move { Ok(self.state().conversations.get(&conversation_id).cloned()) })
    }

    fn create_conversation<'a>(
        &'a self,
        input: NewConversation,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let mut state = self.state();
            let already_open = state
                .conversations
                .values()
                .any(|conversation| conversation.user_id == input.user_id && conversation.status.is_open());
            if already_open {
                return ConflictSnafu {
                    stage: "memory-conversation-create-open-exists",
                    entity: "conversation",
                    details: format!("user '{}' already has an open conversation", input.user_id),
                }
                .fail();
            }

            let now = state.next_timestamp();
            let record = ConversationRecord {
                id: ConversationId::new_v7(),
                user_id: input.user_id,
                user_display_name: input.user_display_name,
                status: ConversationStatus::Open,
                unread_count: 0,
                created_at_unix_millis: now,
                updated_at_unix_millis: now,
            };
            state.conversations.insert(record.id, record.clone());
            Ok(record)
        })
    }

    fn update_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state();
            let now = state.next_timestamp();
            let conversation = state
                .conversations
                .get_mut(&conversation_id)
                .context(NotFoundSnafu {
                    stage: "memory-conversation-update-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;

            if let Some(status) = patch.status {
                conversation.status = status;
            }
            if let Some(unread_count) = patch.unread_count {
                conversation.unread_count = unread_count;
            }
            conversation.updated_at_unix_millis = now;
            Ok(())
        })
    }
}

impl MessageStore for MemoryGateway {
    fn insert_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut state = self.state();
            let now = state.next_timestamp();
            let counts_as_unread = input.counts_as_unread();
            let conversation = state
                .conversations
                .get_mut(&conversation_id)
                .context(NotFoundSnafu {
                    stage: "memory-message-insert-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;
            if counts_as_unread {
                conversation.unread_count = conversation.unread_count.saturating_add(1);
            }
            conversation.updated_at_unix_millis = now;

            let record = MessageRecord {
                id: MessageId::new_v7(),
                conversation_id,
                sender_kind: input.sender_kind,
                sender_id: input.sender_id,
                sender_name: input.sender_name,
                sender_avatar: input.sender_avatar,
                body: input.body,
                created_at_unix_millis: now,
            };
            state.messages.insert(record.id, record.clone());

            // Published under the state lock so feed order matches timestamp order.
            self.feed.publish(FeedEvent::MessageInserted(record.clone()));
            Ok(record)
        })
    }

    fn list_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
        order: MessageOrder,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let mut messages = self
                .state()
                .messages
                .values()
                .filter(|message| message.conversation_id == conversation_id)
                .cloned()
                .collect::<Vec<_>>();

            match order {
                MessageOrder::CreatedAscending => {
                    messages.sort_by(|left, right| left.chronological_cmp(right))
                }
                MessageOrder::CreatedDescending => {
                    messages.sort_by(|left, right| right.chronological_cmp(left))
                }
            }
            Ok(messages)
        })
    }
}

impl ChangeFeed for MemoryGateway {
    fn subscribe_message_inserts<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<FeedSubscription>> {
        Box::pin(async move { Ok(self.feed.subscribe(conversation_id)) })
    }

    fn unsubscribe(&self, subscription_id: SubscriptionId) {
        self.feed.unsubscribe(subscription_id);
    }
}

fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
