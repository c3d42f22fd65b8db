use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use super::ids::{ConversationId, SubscriptionId};
use super::types::FeedEvent;

pub const DEFAULT_FEED_CAPACITY: usize = 64;

/// Receiving half of one conversation-scoped insert feed.
///
/// The channel closing (`recv` yielding `None`) means the subscription was dropped
/// by the hub: unsubscribed, disconnected, or evicted for falling behind.
#[derive(Debug)]
pub struct FeedSubscription {
    id: SubscriptionId,
    conversation_id: ConversationId,
    events: mpsc::Receiver<FeedEvent>,
}

impl FeedSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Result<FeedEvent, TryRecvError> {
        self.events.try_recv()
    }
}

#[derive(Debug)]
struct Subscriber {
    conversation_id: ConversationId,
    sender: mpsc::Sender<FeedEvent>,
}

/// Fan-out point for row-insert notifications, filtered by conversation.
#[derive(Debug)]
pub struct FeedHub {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl FeedHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, conversation_id: ConversationId) -> FeedSubscription {
        let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, events) = mpsc::channel(self.capacity);
        self.subscribers().insert(
            id,
            Subscriber {
                conversation_id,
                sender,
            },
        );
        tracing::debug!(subscription_id = %id, conversation_id = %conversation_id, "feed subscription opened");

        FeedSubscription {
            id,
            conversation_id,
            events,
        }
    }

    /// Removes a subscription; its receiver observes a closed channel afterwards.
    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        let removed = self.subscribers().remove(&subscription_id).is_some();
        if removed {
            tracing::debug!(subscription_id = %subscription_id, "feed subscription closed");
        }
        removed
    }

    /// Delivers an event to every subscriber of its conversation and returns the
    /// number of queues it landed in.
    pub fn publish(&self, event: FeedEvent) -> usize {
        let conversation_id = event.conversation_id();
        let mut subscribers = self.subscribers();
        let mut delivered = 0_usize;
        let mut evicted = Vec::new();

        for (id, subscriber) in subscribers.iter() {
            if subscriber.conversation_id != conversation_id {
                continue;
            }

            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                // Lagging consumer: drop it so it resubscribes and re-fetches.
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscription_id = %id, conversation_id = %conversation_id, "feed subscriber lagged, evicting");
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => evicted.push(*id),
            }
        }

        for id in evicted {
            subscribers.remove(&id);
        }

        delivered
    }

    /// Drops every subscription, as a transport outage would.
    pub fn disconnect_all(&self) -> usize {
        let mut subscribers = self.subscribers();
        let dropped = subscribers.len();
        subscribers.clear();
        if dropped > 0 {
            tracing::info!(dropped, "feed hub disconnected all subscribers");
        }
        dropped
    }

    pub fn subscriber_count(&self, conversation_id: ConversationId) -> usize {
        self.subscribers()
            .values()
            .filter(|subscriber| subscriber.conversation_id == conversation_id)
            .count()
    }

    pub fn total_subscribers(&self) -> usize {
        self.subscribers().len()
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
