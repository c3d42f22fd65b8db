use helpdesk_storage::{FeedEvent, MessageRecord, UserId};

use crate::timeline::{InsertionOrder, MergeOutcome, MessageTimeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileOutcome {
    /// The viewer's own row; it already arrived through the confirmed-send path.
    DiscardedSelf,
    Duplicate,
    ForeignConversation,
    Appended,
    Inserted { index: usize },
}

impl ReconcileOutcome {
    pub fn is_merged(self) -> bool {
        matches!(self, Self::Appended | Self::Inserted { .. })
    }
}

impl From<MergeOutcome> for ReconcileOutcome {
    fn from(outcome: MergeOutcome) -> Self {
        match outcome {
            MergeOutcome::Appended => Self::Appended,
            MergeOutcome::Inserted { index } => Self::Inserted { index },
            MergeOutcome::Duplicate => Self::Duplicate,
            MergeOutcome::ForeignConversation => Self::ForeignConversation,
        }
    }
}

/// Merges live insert events into the timeline exactly once.
#[derive(Debug, Clone, Copy)]
pub struct LiveReconciler {
    viewer_id: UserId,
    order: InsertionOrder,
}

impl LiveReconciler {
    pub fn new(viewer_id: UserId, order: InsertionOrder) -> Self {
        Self { viewer_id, order }
    }

    pub fn reconcile(&self, timeline: &mut MessageTimeline, event: FeedEvent) -> ReconcileOutcome {
        match event {
            FeedEvent::MessageInserted(record) => self.reconcile_insert(timeline, record),
        }
    }

    fn reconcile_insert(&self, timeline: &mut MessageTimeline, record: MessageRecord) -> ReconcileOutcome {
        if record.sender_id == Some(self.viewer_id) {
            tracing::trace!(message_id = %record.id, "discarding self-originated feed row");
            return ReconcileOutcome::DiscardedSelf;
        }

        let message_id = record.id;
        let outcome = ReconcileOutcome::from(timeline.merge(record, self.order));
        if outcome == ReconcileOutcome::ForeignConversation {
            tracing::warn!(message_id = %message_id, "feed delivered a row for another conversation");
        }
        outcome
    }

    /// Merges rows from a re-fetch after a feed gap and returns how many were missing.
    ///
    /// Missing rows are older than anything delivered since the gap closed, so they
    /// always go to their timestamp position regardless of the live policy.
    pub fn heal(&self, timeline: &mut MessageTimeline, rows: Vec<MessageRecord>) -> usize {
        rows.into_iter()
            .map(|row| timeline.merge(row, InsertionOrder::ByTimestamp))
            .filter(|outcome| outcome.is_merged())
            .count()
    }
}
