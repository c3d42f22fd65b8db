use std::cmp::Ordering;
use std::collections::HashSet;

use helpdesk_storage::{ConversationId, MessageId, MessageRecord};
use serde::{Deserialize, Serialize};

/// Where a live row lands when it is merged into the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertionOrder {
    /// Trust the feed to deliver in creation order and append at the tail.
    #[default]
    TailAppend,
    /// Place each row at its `(created_at, id)` position, tolerating reordered delivery.
    ByTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeOutcome {
    Appended,
    Inserted { index: usize },
    Duplicate,
    ForeignConversation,
}

impl MergeOutcome {
    pub fn is_merged(self) -> bool {
        matches!(self, Self::Appended | Self::Inserted { .. })
    }
}

/// Ordered, identity-unique messages of the one conversation being viewed.
#[derive(Debug, Default)]
pub struct MessageTimeline {
    conversation_id: Option<ConversationId>,
    messages: Vec<MessageRecord>,
    known_ids: HashSet<MessageId>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.known_ids.contains(&message_id)
    }

    /// Installs a bulk fetch, discarding whatever the timeline held before.
    ///
    /// Rows are kept in the order given; callers request ascending order from the
    /// gateway. Rows for other conversations and repeated ids are dropped.
    pub fn replace_all(&mut self, conversation_id: ConversationId, rows: Vec<MessageRecord>) -> usize {
        self.clear();
        self.conversation_id = Some(conversation_id);

        let fetched = rows.len();
        for row in rows {
            if row.conversation_id != conversation_id || !self.known_ids.insert(row.id) {
                continue;
            }
            self.messages.push(row);
        }

        let skipped = fetched - self.messages.len();
        if skipped > 0 {
            tracing::warn!(conversation_id = %conversation_id, skipped, "bulk load contained foreign or duplicate rows");
        }
        self.messages.len()
    }

    /// Appends a row the gateway has confirmed as written by this viewer.
    pub fn append_confirmed(&mut self, record: MessageRecord) -> MergeOutcome {
        self.merge(record, InsertionOrder::TailAppend)
    }

    pub fn merge(&mut self, record: MessageRecord, order: InsertionOrder) -> MergeOutcome {
        if self.conversation_id != Some(record.conversation_id) {
            return MergeOutcome::ForeignConversation;
        }
        if self.known_ids.contains(&record.id) {
            return MergeOutcome::Duplicate;
        }

        let index = match order {
            InsertionOrder::TailAppend => self.messages.len(),
            InsertionOrder::ByTimestamp => self
                .messages
                .partition_point(|existing| existing.chronological_cmp(&record) != Ordering::Greater),
        };

        self.known_ids.insert(record.id);
        if index == self.messages.len() {
            self.messages.push(record);
            MergeOutcome::Appended
        } else {
            self.messages.insert(index, record);
            MergeOutcome::Inserted { index }
        }
    }

    pub fn clear(&mut self) {
        self.conversation_id = None;
        self.messages.clear();
        self.known_ids.clear();
    }
}
