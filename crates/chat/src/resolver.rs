use std::sync::Arc;

use helpdesk_storage::{
    ConversationRecord, Gateway, MessageRecord, NewConversation, NewMessage, StorageError, UserId,
};
use snafu::{ResultExt, ensure};

use crate::error::{ChatResult, MissingViewerSnafu, ResolveConversationSnafu};
use crate::settings::GreetingSettings;

/// The signed-in person looking at the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl Viewer {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub conversation: ConversationRecord,
    /// True only when this call minted the conversation.
    pub created: bool,
    pub greeting: Option<MessageRecord>,
}

/// Finds or creates the single open conversation for a viewer.
pub struct ConversationResolver {
    gateway: Arc<dyn Gateway>,
    greeting: GreetingSettings,
}

impl ConversationResolver {
    pub fn new(gateway: Arc<dyn Gateway>, greeting: GreetingSettings) -> Self {
        Self { gateway, greeting }
    }

    pub async fn resolve(&self, viewer: &Viewer) -> ChatResult<Resolution> {
        ensure!(
            !viewer.user_id.is_nil(),
            MissingViewerSnafu {
                stage: "resolve-validate-viewer",
            }
        );

        if let Some(conversation) = self.find_open(viewer, "resolve-find-open").await? {
            tracing::debug!(conversation_id = %conversation.id, user_id = %viewer.user_id, "reusing open conversation");
            return Ok(Resolution {
                conversation,
                created: false,
                greeting: None,
            });
        }

        let created = self
            .gateway
            .create_conversation(NewConversation {
                user_id: viewer.user_id,
                user_display_name: viewer.display_name.clone(),
            })
            .await;

        let conversation = match created {
            Ok(conversation) => conversation,
            // Another tab won the find-then-create race; adopt its conversation.
            Err(StorageError::Conflict { .. }) => {
                if let Some(conversation) = self.find_open(viewer, "resolve-find-after-conflict").await? {
                    return Ok(Resolution {
                        conversation,
                        created: false,
                        greeting: None,
                    });
                }
                self.gateway
                    .create_conversation(NewConversation {
                        user_id: viewer.user_id,
                        user_display_name: viewer.display_name.clone(),
                    })
                    .await
                    .context(ResolveConversationSnafu {
                        stage: "resolve-create-retry",
                        user_id: viewer.user_id.to_string(),
                    })?
            }
            Err(source) => {
                return Err(source).context(ResolveConversationSnafu {
                    stage: "resolve-create",
                    user_id: viewer.user_id.to_string(),
                });
            }
        };

        tracing::info!(conversation_id = %conversation.id, user_id = %viewer.user_id, "created support conversation");
        let greeting = self.send_greeting(&conversation, viewer).await;

        Ok(Resolution {
            conversation,
            created: true,
            greeting,
        })
    }

    async fn find_open(
        &self,
        viewer: &Viewer,
        stage: &'static str,
    ) -> ChatResult<Option<ConversationRecord>> {
        self.gateway
            .find_open_conversation(viewer.user_id)
            .await
            .context(ResolveConversationSnafu {
                stage,
                user_id: viewer.user_id.to_string(),
            })
    }

    // Failures are logged, not returned.
    async fn send_greeting(
        &self,
        conversation: &ConversationRecord,
        viewer: &Viewer,
    ) -> Option<MessageRecord> {
        let greeting = NewMessage::from_system(
            self.greeting.sender_name.clone(),
            self.greeting.render(&viewer.display_name),
        );

        match self.gateway.insert_message(conversation.id, greeting).await {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    stage = error.stage(),
                    "failed to send greeting: {}",
                    error
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use helpdesk_storage::{
        BoxFuture, ChangeFeed, ConversationId, ConversationPatch, ConversationStore,
        FeedSubscription, MemoryGateway, MessageOrder, MessageStore, SenderKind, StorageResult,
        SubscriptionId,
    };

    use super::*;
    use crate::error::ChatError;

    fn resolver(gateway: &Arc<MemoryGateway>) -> ConversationResolver {
        ConversationResolver::new(gateway.clone(), GreetingSettings::default())
    }

    /// Answers the first `stale_finds` open-conversation lookups with `None`, as a
    /// replica would before another tab's insert reaches it.
    #[derive(Default)]
    struct LaggingGateway {
        inner: MemoryGateway,
        stale_finds: AtomicUsize,
        creates: AtomicUsize,
    }

    impl ConversationStore for LaggingGateway {
        fn find_open_conversation<'a>(
            &'a self,
            user_id: UserId,
        ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
            let stale = self
                .stale_finds
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if stale {
                return Box::pin(async { Ok::<Option<ConversationRecord>, StorageError>(None) });
            }
            self.inner.find_open_conversation(user_id)
        }

        fn get_conversation<'a>(
            &'a self,
            conversation_id: ConversationId,
        ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
            self.inner.get_conversation(conversation_id)
        }

        fn create_conversation<'a>(
            &'a self,
            input: NewConversation,
        ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.inner.create_conversation(input)
        }

        fn update_conversation<'a>(
            &'a self,
            conversation_id: ConversationId,
            patch: ConversationPatch,
        ) -> BoxFuture<'a, StorageResult<()>> {
            self.inner.update_conversation(conversation_id, patch)
        }
    }

    impl MessageStore for LaggingGateway {
        fn insert_message<'a>(
            &'a self,
            conversation_id: ConversationId,
            input: NewMessage,
        ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
            self.inner.insert_message(conversation_id, input)
        }

        fn list_messages<'a>(
            &'a self,
            conversation_id: ConversationId,
            order: MessageOrder,
        ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
            self.inner.list_messages(conversation_id, order)
        }
    }

    impl ChangeFeed for LaggingGateway {
        fn subscribe_message_inserts<'a>(
            &'a self,
            conversation_id: ConversationId,
        ) -> BoxFuture<'a, StorageResult<FeedSubscription>> {
            self.inner.subscribe_message_inserts(conversation_id)
        }

        fn unsubscribe(&self, subscription_id: SubscriptionId) {
            self.inner.unsubscribe(subscription_id)
        }
    }

    async fn lagging_gateway_with_open_conversation(
        viewer: &Viewer,
        stale_finds: usize,
    ) -> (Arc<LaggingGateway>, ConversationRecord) {
        let gateway = Arc::new(LaggingGateway::default());
        let existing = gateway
            .inner
            .create_conversation(NewConversation {
                user_id: viewer.user_id,
                user_display_name: viewer.display_name.clone(),
            })
            .await
            .unwrap();
        gateway.stale_finds.store(stale_finds, Ordering::SeqCst);
        (gateway, existing)
    }

    #[tokio::test]
    async fn lost_create_race_adopts_the_winning_conversation() {
        let viewer = Viewer::new(UserId::new_v7(), "Ada");
        let (gateway, existing) = lagging_gateway_with_open_conversation(&viewer, 1).await;
        let resolver = ConversationResolver::new(gateway.clone(), GreetingSettings::default());

        let resolution = resolver.resolve(&viewer).await.unwrap();

        assert_eq!(resolution.conversation, existing);
        assert!(!resolution.created);
        assert_eq!(resolution.greeting, None);
        assert_eq!(gateway.creates.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.inner.conversations_for_user(viewer.user_id).len(), 1);
        let messages = gateway
            .list_messages(existing.id, MessageOrder::CreatedAscending)
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn conflict_that_stays_invisible_fails_on_the_retry() {
        let viewer = Viewer::new(UserId::new_v7(), "Ada");
        let (gateway, _) = lagging_gateway_with_open_conversation(&viewer, 2).await;
        let resolver = ConversationResolver::new(gateway.clone(), GreetingSettings::default());

        let error = resolver.resolve(&viewer).await.unwrap_err();

        assert!(matches!(
            error,
            ChatError::ResolveConversation {
                stage: "resolve-create-retry",
                source: StorageError::Conflict { .. },
                ..
            }
        ));
        assert_eq!(gateway.creates.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.inner.conversations_for_user(viewer.user_id).len(), 1);
    }

    #[tokio::test]
    async fn repeated_opens_share_one_conversation() {
        let gateway = Arc::new(MemoryGateway::default());
        let resolver = resolver(&gateway);
        let viewer = Viewer::new(UserId::new_v7(), "Ada");

        let first = resolver.resolve(&viewer).await.unwrap();
        assert!(first.created);

        for _ in 0..5 {
            let again = resolver.resolve(&viewer).await.unwrap();
            assert!(!again.created);
            assert_eq!(again.conversation.id, first.conversation.id);
        }
        assert_eq!(gateway.conversations_for_user(viewer.user_id).len(), 1);
    }

    #[tokio::test]
    async fn greeting_is_sent_once_from_the_system_sender() {
        let gateway = Arc::new(MemoryGateway::default());
        let resolver = resolver(&gateway);
        let viewer = Viewer::new(UserId::new_v7(), "Ada");

        let first = resolver.resolve(&viewer).await.unwrap();
        let greeting = first.greeting.unwrap();
        assert_eq!(greeting.sender_kind, SenderKind::Support);
        assert_eq!(greeting.sender_id, None);
        assert!(greeting.body.contains("Ada"));

        let again = resolver.resolve(&viewer).await.unwrap();
        assert!(again.greeting.is_none());

        let messages = gateway
            .list_messages(first.conversation.id, MessageOrder::CreatedAscending)
            .await
            .unwrap();
        assert_eq!(messages, vec![greeting]);
    }

    #[tokio::test]
    async fn nil_user_is_rejected_before_touching_storage() {
        let gateway = Arc::new(MemoryGateway::default());
        let resolver = resolver(&gateway);
        let viewer = Viewer::new(UserId::new(uuid::Uuid::nil()), "Nobody");

        let error = resolver.resolve(&viewer).await.unwrap_err();
        assert!(matches!(error, ChatError::MissingViewer { .. }));
        assert!(gateway.conversations_for_user(viewer.user_id).is_empty());
    }

    #[tokio::test]
    async fn different_users_get_different_conversations() {
        let gateway = Arc::new(MemoryGateway::default());
        let resolver = resolver(&gateway);

        let ada = resolver
            .resolve(&Viewer::new(UserId::new_v7(), "Ada"))
            .await
            .unwrap();
        let grace = resolver
            .resolve(&Viewer::new(UserId::new_v7(), "Grace"))
            .await
            .unwrap();

        assert_ne!(ada.conversation.id, grace.conversation.id);
        assert!(ada.created && grace.created);
    }
}
