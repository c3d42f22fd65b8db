use std::sync::Arc;

use helpdesk_storage::{
    ConversationId, ConversationRecord, FeedEvent, FeedSubscription, Gateway, MessageOrder,
    MessageRecord, NewMessage, SubscriptionId, UserId,
};
use snafu::ResultExt;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

use crate::error::{
    ChatResult, FeedLostSnafu, InvalidTransitionSnafu, LoadMessagesSnafu,
    NotReadySnafu, SendMessageSnafu, SubscribeSnafu,
};
use crate::read_state::ReadStateTracker;
use crate::reconciler::{LiveReconciler, ReconcileOutcome};
use crate::resolver::{ConversationResolver, Viewer};
use crate::settings::ChatSettings;
use crate::timeline::MessageTimeline;

/// Lifecycle of the chat view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChatState {
    #[default]
    Closed,
    Initializing {
        user_id: UserId,
    },
    Ready {
        conversation_id: ConversationId,
    },
    Error {
        user_id: UserId,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTransition {
    BeginOpen(UserId),
    Opened(ConversationId),
    Failed(String),
    Close,
}

/// Rejection reason for illegal chat transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTransitionRejection {
    AlreadyInitializing { active: UserId, attempted: UserId },
    AlreadyReady { conversation_id: ConversationId },
    NotInitializing,
}

pub type ChatTransitionResult = Result<ChatState, ChatTransitionRejection>;

impl ChatState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::Ready { conversation_id } => Some(*conversation_id),
            Self::Closed | Self::Initializing { .. } | Self::Error { .. } => None,
        }
    }

    /// Applies one transition deterministically.
    ///
    /// `Closed` and `Error` may begin a new open; only `Initializing` may settle into
    /// `Ready` or `Error`. `Close` is accepted from every state.
    pub fn apply(&self, transition: ChatTransition) -> ChatTransitionResult {
        match transition {
            ChatTransition::BeginOpen(user_id) => self.apply_begin_open(user_id),
            ChatTransition::Opened(conversation_id) => self.apply_opened(conversation_id),
            ChatTransition::Failed(message) => self.apply_failed(message),
            ChatTransition::Close => Ok(Self::Closed),
        }
    }

    fn apply_begin_open(&self, user_id: UserId) -> ChatTransitionResult {
        match self {
            Self::Initializing { user_id: active } if *active != user_id => {
                Err(ChatTransitionRejection::AlreadyInitializing {
                    active: *active,
                    attempted: user_id,
                })
            }
            Self::Initializing { .. } => Ok(self.clone()),
            Self::Ready { conversation_id } => Err(ChatTransitionRejection::AlreadyReady {
                conversation_id: *conversation_id,
            }),
            Self::Closed | Self::Error { .. } => Ok(Self::Initializing { user_id }),
        }
    }

    fn apply_opened(&self, conversation_id: ConversationId) -> ChatTransitionResult {
        match self {
            Self::Initializing { .. } => Ok(Self::Ready { conversation_id }),
            Self::Closed | Self::Ready { .. } | Self::Error { .. } => {
                Err(ChatTransitionRejection::NotInitializing)
            }
        }
    }

    fn apply_failed(&self, message: String) -> ChatTransitionResult {
        match self {
            Self::Initializing { user_id } => Ok(Self::Error {
                user_id: *user_id,
                message,
            }),
            Self::Closed | Self::Ready { .. } | Self::Error { .. } => {
                Err(ChatTransitionRejection::NotInitializing)
            }
        }
    }
}

/// Health of the live insert feed for the open conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedStatus {
    #[default]
    Inactive,
    Live,
    Disconnected,
    Reconnecting {
        attempt: u32,
    },
    /// Reconnection gave up; the timeline no longer receives live rows.
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComposeState {
    pub draft: String,
    pub sending: bool,
    pub last_send_error: Option<String>,
}

struct ActiveConversation {
    viewer: Viewer,
    conversation: ConversationRecord,
    reconciler: LiveReconciler,
    subscription: Option<FeedSubscription>,
}

/// One viewer's support chat: owns the timeline, the feed subscription and the
/// compose box for the conversation currently on screen.
///
/// Must be driven from inside a tokio runtime; read-state writes are spawned.
pub struct ChatSession {
    gateway: Arc<dyn Gateway>,
    settings: Arc<ChatSettings>,
    resolver: ConversationResolver,
    read_state: ReadStateTracker,
    state: ChatState,
    active: Option<ActiveConversation>,
    timeline: MessageTimeline,
    feed_status: FeedStatus,
    compose: ComposeState,
    pending_reads: Vec<JoinHandle<bool>>,
}

impl ChatSession {
    pub fn new(gateway: Arc<dyn Gateway>, settings: Arc<ChatSettings>) -> Self {
        Self {
            resolver: ConversationResolver::new(gateway.clone(), settings.greeting.clone()),
            read_state: ReadStateTracker::new(gateway.clone()),
            gateway,
            settings,
            state: ChatState::Closed,
            active: None,
            timeline: MessageTimeline::new(),
            feed_status: FeedStatus::Inactive,
            compose: ComposeState::default(),
            pending_reads: Vec::new(),
        }
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn feed_status(&self) -> FeedStatus {
        self.feed_status
    }

    pub fn timeline(&self) -> &MessageTimeline {
        &self.timeline
    }

    pub fn messages(&self) -> &[MessageRecord] {
        self.timeline.messages()
    }

    pub fn conversation(&self) -> Option<&ConversationRecord> {
        self.active.as_ref().map(|active| &active.conversation)
    }

    pub fn viewer(&self) -> Option<&Viewer> {
        self.active.as_ref().map(|active| &active.viewer)
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.active
            .as_ref()
            .and_then(|active| active.subscription.as_ref())
            .map(FeedSubscription::id)
    }

    pub fn compose(&self) -> &ComposeState {
        &self.compose
    }

    pub fn draft(&self) -> &str {
        &self.compose.draft
    }

    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.compose.draft = draft.into();
    }

    pub fn is_sending(&self) -> bool {
        self.compose.sending
    }

    /// Resolves the viewer's conversation, loads its history and goes live.
    ///
    /// Any previously open conversation is torn down first. On failure the session
    /// lands in [`ChatState::Error`] holding no conversation data.
    pub async fn open(&mut self, viewer: Viewer) -> ChatResult<()> {
        if self.state != ChatState::Closed {
            self.close();
        }
        self.transition("open-begin", ChatTransition::BeginOpen(viewer.user_id))?;

        match self.initialize(viewer).await {
            Ok(conversation_id) => {
                self.transition("open-ready", ChatTransition::Opened(conversation_id))?;
                tracing::info!(
                    conversation_id = %conversation_id,
                    messages = self.timeline.len(),
                    "support chat ready"
                );
                Ok(())
            }
            Err(error) => {
                tracing::warn!("support chat initialization failed: {}", error);
                self.release_feed();
                self.active = None;
                self.timeline.clear();
                self.transition("open-failed", ChatTransition::Failed(error.to_string()))?;
                Err(error)
            }
        }
    }

    async fn initialize(&mut self, viewer: Viewer) -> ChatResult<ConversationId> {
        let resolution = self.resolver.resolve(&viewer).await?;
        let conversation_id = resolution.conversation.id;

        let rows = self
            .gateway
            .list_messages(conversation_id, MessageOrder::CreatedAscending)
            .await
            .context(LoadMessagesSnafu {
                stage: "open-load-messages",
                conversation_id: conversation_id.to_string(),
            })?;
        self.timeline.replace_all(conversation_id, rows);

        self.schedule_mark_read(conversation_id);

        let subscription = self
            .gateway
            .subscribe_message_inserts(conversation_id)
            .await
            .context(SubscribeSnafu {
                stage: "open-subscribe",
                conversation_id: conversation_id.to_string(),
            })?;
        tracing::debug!(
            conversation_id = %conversation_id,
            subscription_id = %subscription.id(),
            "subscribed to message inserts"
        );

        self.active = Some(ActiveConversation {
            reconciler: LiveReconciler::new(viewer.user_id, self.settings.insertion_order),
            viewer,
            conversation: resolution.conversation,
            subscription: Some(subscription),
        });
        self.feed_status = FeedStatus::Live;
        Ok(conversation_id)
    }

    /// Tears the conversation down. The feed is released before this returns.
    pub fn close(&mut self) {
        self.release_feed();
        if let Some(active) = self.active.take() {
            tracing::debug!(conversation_id = %active.conversation.id, "support chat closed");
        }
        self.timeline.clear();
        self.compose = ComposeState::default();
        // In-flight read-state writes are detached, not aborted.
        self.pending_reads.clear();
        self.state = ChatState::Closed;
    }

    /// Sends the trimmed draft. Blank drafts are ignored and yield `Ok(None)`.
    ///
    /// Only the gateway-confirmed row is appended. On failure the draft and the
    /// timeline are left untouched and the error is kept in `last_send_error`.
    pub async fn send_draft(&mut self) -> ChatResult<Option<MessageRecord>> {
        let Some(conversation_id) = self.state.conversation_id() else {
            return NotReadySnafu {
                stage: "send-check-ready",
            }
            .fail();
        };
        let Some(viewer) = self.active.as_ref().map(|active| active.viewer.clone()) else {
            return NotReadySnafu {
                stage: "send-check-viewer",
            }
            .fail();
        };

        let body = self.compose.draft.trim().to_string();
        if body.is_empty() {
            return Ok(None);
        }

        self.compose.sending = true;
        let result = self
            .gateway
            .insert_message(
                conversation_id,
                NewMessage::from_user(viewer.user_id, viewer.display_name, viewer.avatar, body),
            )
            .await;
        self.compose.sending = false;

        match result {
            Ok(record) => {
                self.timeline.append_confirmed(record.clone());
                self.compose.draft.clear();
                self.compose.last_send_error = None;
                Ok(Some(record))
            }
            Err(source) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    stage = source.stage(),
                    "failed to send message: {}",
                    source
                );
                self.compose.last_send_error = Some(source.to_string());
                Err(source).context(SendMessageSnafu {
                    stage: "send-insert-message",
                    conversation_id: conversation_id.to_string(),
                })
            }
        }
    }

    /// Waits for the next feed event and merges it.
    ///
    /// Returns `Ok(None)` when the feed dropped and was re-established instead; the
    /// rows missed meanwhile are already merged by then.
    pub async fn next_feed_event(&mut self) -> ChatResult<Option<ReconcileOutcome>> {
        if self.feed_status == FeedStatus::Lost {
            return self.feed_lost("feed-next-lost");
        }
        let Some(active) = self.active.as_mut() else {
            return NotReadySnafu {
                stage: "feed-next-check-ready",
            }
            .fail();
        };
        let reconciler = active.reconciler;
        let conversation_id = active.conversation.id;
        let Some(subscription) = active.subscription.as_mut() else {
            return self.reconnect().await.map(|_| None);
        };

        match subscription.recv().await {
            Some(event) => Ok(Some(self.merge_event(reconciler, conversation_id, event))),
            None => {
                self.mark_disconnected();
                self.reconnect().await.map(|_| None)
            }
        }
    }

    /// Merges every event already queued without waiting.
    ///
    /// A closed channel is recorded as [`FeedStatus::Disconnected`]; the caller
    /// decides when to [`reconnect`](Self::reconnect).
    pub fn drain_feed(&mut self) -> Vec<ReconcileOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let Some(active) = self.active.as_mut() else {
                break;
            };
            let reconciler = active.reconciler;
            let conversation_id = active.conversation.id;
            let Some(subscription) = active.subscription.as_mut() else {
                break;
            };

            match subscription.try_recv() {
                Ok(event) => outcomes.push(self.merge_event(reconciler, conversation_id, event)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.mark_disconnected();
                    break;
                }
            }
        }
        outcomes
    }

    /// Re-establishes the feed, then re-fetches history and merges whatever the gap
    /// swallowed. Returns how many rows were healed.
    ///
    /// The first attempt runs immediately; later attempts back off exponentially.
    pub async fn reconnect(&mut self) -> ChatResult<usize> {
        let (conversation_id, reconciler) = match (&self.state, self.active.as_mut()) {
            (ChatState::Ready { conversation_id }, Some(active)) => {
                if let Some(stale) = active.subscription.take() {
                    self.gateway.unsubscribe(stale.id());
                }
                (*conversation_id, active.reconciler)
            }
            _ => {
                return NotReadySnafu {
                    stage: "reconnect-check-ready",
                }
                .fail();
            }
        };

        let policy = self.settings.reconnect.clone();
        for attempt in 1..=policy.max_attempts {
            self.feed_status = FeedStatus::Reconnecting { attempt };
            if attempt > 1 {
                tokio::time::sleep(policy.backoff_for(attempt - 1)).await;
            }

            match self.resubscribe_and_heal(conversation_id, reconciler).await {
                Ok(healed) => {
                    self.feed_status = FeedStatus::Live;
                    tracing::info!(conversation_id = %conversation_id, attempt, healed, "live updates restored");
                    return Ok(healed);
                }
                Err(error) => {
                    tracing::warn!(conversation_id = %conversation_id, attempt, "reconnect attempt failed: {}", error);
                }
            }
        }

        self.feed_status = FeedStatus::Lost;
        tracing::error!(conversation_id = %conversation_id, attempts = policy.max_attempts, "giving up on live updates");
        self.feed_lost("reconnect-exhausted")
    }

    async fn resubscribe_and_heal(
        &mut self,
        conversation_id: ConversationId,
        reconciler: LiveReconciler,
    ) -> ChatResult<usize> {
        // Subscribe before re-fetching so nothing lands between the two.
        let subscription = self
            .gateway
            .subscribe_message_inserts(conversation_id)
            .await
            .context(SubscribeSnafu {
                stage: "reconnect-subscribe",
                conversation_id: conversation_id.to_string(),
            })?;

        let rows = match self
            .gateway
            .list_messages(conversation_id, MessageOrder::CreatedAscending)
            .await
        {
            Ok(rows) => rows,
            Err(source) => {
                self.gateway.unsubscribe(subscription.id());
                return Err(source).context(LoadMessagesSnafu {
                    stage: "reconnect-refetch",
                    conversation_id: conversation_id.to_string(),
                });
            }
        };

        let healed = reconciler.heal(&mut self.timeline, rows);
        if let Some(active) = self.active.as_mut() {
            active.subscription = Some(subscription);
        }
        if healed > 0 && self.settings.mark_read_on_live_message {
            self.schedule_mark_read(conversation_id);
        }
        Ok(healed)
    }

    /// Waits for every scheduled read-state write; returns how many landed.
    pub async fn settle_read_state(&mut self) -> usize {
        let mut landed = 0;
        for handle in self.pending_reads.drain(..) {
            if matches!(handle.await, Ok(true)) {
                landed += 1;
            }
        }
        landed
    }

    fn merge_event(
        &mut self,
        reconciler: LiveReconciler,
        conversation_id: ConversationId,
        event: FeedEvent,
    ) -> ReconcileOutcome {
        let outcome = reconciler.reconcile(&mut self.timeline, event);
        if outcome.is_merged() && self.settings.mark_read_on_live_message {
            self.schedule_mark_read(conversation_id);
        }
        outcome
    }

    fn schedule_mark_read(&mut self, conversation_id: ConversationId) {
        self.pending_reads.retain(|handle| !handle.is_finished());
        self.pending_reads
            .push(self.read_state.spawn_mark_read(conversation_id));
    }

    fn mark_disconnected(&mut self) {
        if let Some(active) = self.active.as_mut() {
            if let Some(subscription) = active.subscription.take() {
                self.gateway.unsubscribe(subscription.id());
                tracing::warn!(
                    conversation_id = %active.conversation.id,
                    subscription_id = %subscription.id(),
                    "live feed disconnected"
                );
            }
        }
        self.feed_status = FeedStatus::Disconnected;
    }

    fn release_feed(&mut self) {
        if let Some(subscription) = self
            .active
            .as_mut()
            .and_then(|active| active.subscription.take())
        {
            self.gateway.unsubscribe(subscription.id());
        }
        self.feed_status = FeedStatus::Inactive;
    }

    fn transition(&mut self, stage: &'static str, transition: ChatTransition) -> ChatResult<()> {
        match self.state.apply(transition) {
            Ok(next) => {
                self.state = next;
                Ok(())
            }
            Err(rejection) => InvalidTransitionSnafu { stage, rejection }.fail(),
        }
    }

    fn feed_lost<T>(&self, stage: &'static str) -> ChatResult<T> {
        FeedLostSnafu {
            stage,
            conversation_id: self
                .state
                .conversation_id()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            attempts: self.settings.reconnect.max_attempts,
        }
        .fail()
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.release_feed();
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("state", &self.state)
            .field("feed_status", &self.feed_status)
            .field("messages", &self.timeline.len())
            .field("compose", &self.compose)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use helpdesk_storage::{
        BoxFuture, ChangeFeed, ConversationPatch, ConversationStore, MemoryGateway, MessageStore,
        NewConversation, StorageError, StorageResult,
    };

    use super::*;
    use crate::error::ChatError;
    use crate::settings::ReconnectSettings;

    /// Memory gateway with switchable failure points.
    #[derive(Default)]
    struct FlakyGateway {
        inner: MemoryGateway,
        fail_list: AtomicBool,
        fail_insert: AtomicBool,
        fail_subscribe: AtomicBool,
    }

    fn injected(stage: &'static str) -> StorageError {
        StorageError::InvariantViolation {
            stage,
            details: "injected failure".to_string(),
        }
    }

    impl ConversationStore for FlakyGateway {
        fn find_open_conversation<'a>(
            &'a self,
            user_id: UserId,
        ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
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

    impl MessageStore for FlakyGateway {
        fn insert_message<'a>(
            &'a self,
            conversation_id: ConversationId,
            input: NewMessage,
        ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
            if self.fail_insert.load(Ordering::SeqCst) {
                return Box::pin(async { Err::<MessageRecord, _>(injected("flaky-insert")) });
            }
            self.inner.insert_message(conversation_id, input)
        }

        fn list_messages<'a>(
            &'a self,
            conversation_id: ConversationId,
            order: MessageOrder,
        ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
            if self.fail_list.load(Ordering::SeqCst) {
                return Box::pin(async { Err::<Vec<MessageRecord>, _>(injected("flaky-list")) });
            }
            self.inner.list_messages(conversation_id, order)
        }
    }

    impl ChangeFeed for FlakyGateway {
        fn subscribe_message_inserts<'a>(
            &'a self,
            conversation_id: ConversationId,
        ) -> BoxFuture<'a, StorageResult<FeedSubscription>> {
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Box::pin(async { Err::<FeedSubscription, _>(injected("flaky-subscribe")) });
            }
            self.inner.subscribe_message_inserts(conversation_id)
        }

        fn unsubscribe(&self, subscription_id: SubscriptionId) {
            self.inner.unsubscribe(subscription_id)
        }
    }

    fn fast_settings() -> Arc<ChatSettings> {
        Arc::new(ChatSettings {
            reconnect: ReconnectSettings {
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
                max_attempts: 3,
            },
            ..ChatSettings::default()
        })
    }

    fn session(gateway: &Arc<FlakyGateway>) -> ChatSession {
        ChatSession::new(gateway.clone(), fast_settings())
    }

    fn ada() -> Viewer {
        Viewer::new(UserId::new_v7(), "Ada")
    }

    #[test]
    fn state_machine_accepts_the_open_lifecycle() {
        let user_id = UserId::new_v7();
        let conversation_id = ConversationId::new_v7();

        let initializing = ChatState::Closed
            .apply(ChatTransition::BeginOpen(user_id))
            .unwrap();
        assert_eq!(initializing, ChatState::Initializing { user_id });

        let ready = initializing
            .apply(ChatTransition::Opened(conversation_id))
            .unwrap();
        assert_eq!(ready, ChatState::Ready { conversation_id });
        assert_eq!(ready.apply(ChatTransition::Close).unwrap(), ChatState::Closed);
    }

    #[test]
    fn state_machine_rejects_illegal_moves() {
        let user_id = UserId::new_v7();
        let conversation_id = ConversationId::new_v7();
        let ready = ChatState::Ready { conversation_id };

        assert_eq!(
            ready.apply(ChatTransition::BeginOpen(user_id)),
            Err(ChatTransitionRejection::AlreadyReady { conversation_id })
        );
        assert_eq!(
            ChatState::Closed.apply(ChatTransition::Opened(conversation_id)),
            Err(ChatTransitionRejection::NotInitializing)
        );
        assert_eq!(
            ready.apply(ChatTransition::Failed("late".to_string())),
            Err(ChatTransitionRejection::NotInitializing)
        );

        let other = UserId::new_v7();
        assert_eq!(
            ChatState::Initializing { user_id }.apply(ChatTransition::BeginOpen(other)),
            Err(ChatTransitionRejection::AlreadyInitializing {
                active: user_id,
                attempted: other,
            })
        );
    }

    #[test]
    fn error_state_can_retry_or_close() {
        let user_id = UserId::new_v7();
        let error = ChatState::Initializing { user_id }
            .apply(ChatTransition::Failed("boom".to_string()))
            .unwrap();
        assert_eq!(
            error,
            ChatState::Error {
                user_id,
                message: "boom".to_string(),
            }
        );

        assert_eq!(
            error.apply(ChatTransition::BeginOpen(user_id)).unwrap(),
            ChatState::Initializing { user_id }
        );
        assert_eq!(error.apply(ChatTransition::Close).unwrap(), ChatState::Closed);
    }

    #[tokio::test]
    async fn open_loads_history_and_goes_live() {
        let gateway = Arc::new(FlakyGateway::default());
        let mut session = session(&gateway);

        session.open(ada()).await.unwrap();

        assert!(session.state().is_ready());
        assert_eq!(session.feed_status(), FeedStatus::Live);
        assert_eq!(session.messages().len(), 1);
        assert!(session.subscription_id().is_some());
        assert_eq!(gateway.inner.feed().total_subscribers(), 1);
    }

    #[tokio::test]
    async fn initialization_failure_lands_in_error() {
        let gateway = Arc::new(FlakyGateway::default());
        gateway.fail_list.store(true, Ordering::SeqCst);
        let mut session = session(&gateway);
        let viewer = ada();

        let error = session.open(viewer.clone()).await.unwrap_err();

        assert!(matches!(error, ChatError::LoadMessages { .. }));
        assert!(matches!(
            session.state(),
            ChatState::Error { user_id, .. } if *user_id == viewer.user_id
        ));
        assert!(session.messages().is_empty());
        assert_eq!(gateway.inner.feed().total_subscribers(), 0);

        gateway.fail_list.store(false, Ordering::SeqCst);
        session.open(viewer).await.unwrap();
        assert!(session.state().is_ready());
    }

    #[tokio::test]
    async fn subscribe_failure_reports_error_without_feed() {
        let gateway = Arc::new(FlakyGateway::default());
        gateway.fail_subscribe.store(true, Ordering::SeqCst);
        let mut session = session(&gateway);

        let error = session.open(ada()).await.unwrap_err();

        assert!(matches!(error, ChatError::Subscribe { .. }));
        assert_eq!(session.feed_status(), FeedStatus::Inactive);
        assert!(session.conversation().is_none());
    }

    #[tokio::test]
    async fn send_failure_keeps_draft_and_timeline() {
        let gateway = Arc::new(FlakyGateway::default());
        let mut session = session(&gateway);
        session.open(ada()).await.unwrap();
        let before = session.messages().to_vec();

        gateway.fail_insert.store(true, Ordering::SeqCst);
        session.set_draft("Hello");
        let error = session.send_draft().await.unwrap_err();

        assert!(matches!(error, ChatError::SendMessage { .. }));
        assert_eq!(session.draft(), "Hello");
        assert_eq!(session.messages(), before.as_slice());
        assert!(session.compose().last_send_error.is_some());
        assert!(!session.is_sending());

        gateway.fail_insert.store(false, Ordering::SeqCst);
        let sent = session.send_draft().await.unwrap().unwrap();
        assert_eq!(sent.body, "Hello");
        assert_eq!(session.draft(), "");
        assert!(session.compose().last_send_error.is_none());
    }

    #[tokio::test]
    async fn blank_draft_is_not_sent() {
        let gateway = Arc::new(FlakyGateway::default());
        let mut session = session(&gateway);
        session.open(ada()).await.unwrap();

        session.set_draft("   \n");
        assert_eq!(session.send_draft().await.unwrap(), None);
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn sending_requires_an_open_conversation() {
        let gateway = Arc::new(FlakyGateway::default());
        let mut session = session(&gateway);
        session.set_draft("Hello");

        let error = session.send_draft().await.unwrap_err();
        assert!(matches!(error, ChatError::NotReady { .. }));
    }

    #[tokio::test]
    async fn own_feed_row_is_not_duplicated() {
        let gateway = Arc::new(FlakyGateway::default());
        let mut session = session(&gateway);
        session.open(ada()).await.unwrap();

        session.set_draft("Hello");
        session.send_draft().await.unwrap();
        let outcomes = session.drain_feed();

        assert_eq!(outcomes, vec![ReconcileOutcome::DiscardedSelf]);
        assert_eq!(session.messages().len(), 2);
    }

    #[tokio::test]
    async fn dropped_feed_reconnects_and_heals() {
        let gateway = Arc::new(FlakyGateway::default());
        let mut session = session(&gateway);
        session.open(ada()).await.unwrap();
        let conversation_id = session.conversation().unwrap().id;

        gateway.inner.disconnect_feed();
        let missed = gateway
            .insert_message(
                conversation_id,
                NewMessage::from_support(UserId::new_v7(), "Grace", "Still there?"),
            )
            .await
            .unwrap();

        assert!(session.drain_feed().is_empty());
        assert_eq!(session.feed_status(), FeedStatus::Disconnected);

        let healed = session.reconnect().await.unwrap();
        assert_eq!(healed, 1);
        assert_eq!(session.feed_status(), FeedStatus::Live);
        assert_eq!(session.messages().last(), Some(&missed));

        let live = gateway
            .insert_message(
                conversation_id,
                NewMessage::from_support(UserId::new_v7(), "Grace", "Back online"),
            )
            .await
            .unwrap();
        let outcome = session.next_feed_event().await.unwrap();
        assert_eq!(outcome, Some(ReconcileOutcome::Appended));
        assert_eq!(session.messages().last(), Some(&live));
    }

    #[tokio::test]
    async fn first_reconnect_attempt_does_not_wait() {
        let gateway = Arc::new(FlakyGateway::default());
        let settings = Arc::new(ChatSettings {
            reconnect: ReconnectSettings {
                initial_backoff_ms: 60_000,
                max_backoff_ms: 60_000,
                max_attempts: 3,
            },
            ..ChatSettings::default()
        });
        let mut session = ChatSession::new(gateway.clone(), settings);
        session.open(ada()).await.unwrap();

        gateway.inner.disconnect_feed();
        let healed = tokio::time::timeout(Duration::from_secs(5), session.reconnect())
            .await
            .expect("first attempt must not sleep through the backoff")
            .unwrap();

        assert_eq!(healed, 0);
        assert_eq!(session.feed_status(), FeedStatus::Live);
        assert_eq!(gateway.inner.feed().total_subscribers(), 1);
    }

    #[tokio::test]
    async fn exhausted_reconnect_reports_lost_feed() {
        let gateway = Arc::new(FlakyGateway::default());
        let mut session = session(&gateway);
        session.open(ada()).await.unwrap();

        gateway.fail_subscribe.store(true, Ordering::SeqCst);
        gateway.inner.disconnect_feed();
        let error = session.next_feed_event().await.unwrap_err();

        assert!(matches!(error, ChatError::FeedLost { attempts: 3, .. }));
        assert_eq!(session.feed_status(), FeedStatus::Lost);
        assert!(session.state().is_ready());

        let again = session.next_feed_event().await.unwrap_err();
        assert!(matches!(again, ChatError::FeedLost { .. }));
    }

    #[tokio::test]
    async fn close_releases_the_subscription_immediately() {
        let gateway = Arc::new(FlakyGateway::default());
        let mut session = session(&gateway);
        session.open(ada()).await.unwrap();
        session.set_draft("unsent");

        session.close();

        assert_eq!(session.state(), &ChatState::Closed);
        assert_eq!(session.feed_status(), FeedStatus::Inactive);
        assert!(session.messages().is_empty());
        assert_eq!(session.draft(), "");
        assert_eq!(gateway.inner.feed().total_subscribers(), 0);
    }

    #[tokio::test]
    async fn dropping_the_session_unsubscribes() {
        let gateway = Arc::new(FlakyGateway::default());
        {
            let mut session = session(&gateway);
            session.open(ada()).await.unwrap();
            assert_eq!(gateway.inner.feed().total_subscribers(), 1);
        }
        assert_eq!(gateway.inner.feed().total_subscribers(), 0);
    }

    #[tokio::test]
    async fn live_remote_message_clears_unread() {
        let gateway = Arc::new(FlakyGateway::default());
        let mut session = session(&gateway);
        session.open(ada()).await.unwrap();
        session.settle_read_state().await;
        let conversation_id = session.conversation().unwrap().id;

        gateway
            .insert_message(
                conversation_id,
                NewMessage::from_support(UserId::new_v7(), "Grace", "Hi Ada"),
            )
            .await
            .unwrap();
        session.next_feed_event().await.unwrap();
        assert_eq!(session.settle_read_state().await, 1);

        let stored = gateway
            .get_conversation(conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.unread_count, 0);
    }
}
