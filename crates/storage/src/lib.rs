pub mod error;
pub mod feed;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use error::{StorageError, StorageResult};
pub use feed::{DEFAULT_FEED_CAPACITY, FeedHub, FeedSubscription};
pub use ids::{ConversationId, MessageId, SubscriptionId, UserId};
pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;
pub use types::{
    ConversationPatch, ConversationRecord, ConversationStatus, FeedEvent, MessageOrder,
    MessageRecord, NewConversation, NewMessage, SYSTEM_SENDER_NAME, SenderKind,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ConversationStore: Send + Sync {
    /// Single-row lookup by owner and `open` status.
    fn find_open_conversation<'a>(
        &'a self,
        user_id: UserId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>>;
    fn get_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>>;
    /// Inserts an `open` conversation with a zero unread counter.
    fn create_conversation<'a>(
        &'a self,
        input: NewConversation,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>>;
    fn update_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, StorageResult<()>>;
}

pub trait MessageStore: Send + Sync {
    /// Persists a message and returns it with its server-assigned id and timestamp.
    fn insert_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;
    fn list_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
        order: MessageOrder,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;
}

pub trait ChangeFeed: Send + Sync {
    /// Opens an insert feed filtered to one conversation.
    fn subscribe_message_inserts<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<FeedSubscription>>;
    /// Tears a subscription down immediately; safe to call twice.
    fn unsubscribe(&self, subscription_id: SubscriptionId);
}

pub trait Gateway: ConversationStore + MessageStore + ChangeFeed {}

impl<T> Gateway for T where T: ConversationStore + MessageStore + ChangeFeed {}
