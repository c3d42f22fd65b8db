use std::cmp::Ordering;

use super::ids::{ConversationId, MessageId, UserId};

/// Display name used for automated messages that have no human sender.
pub const SYSTEM_SENDER_NAME: &str = "Support Team";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationStatus {
    Open,
    Resolved,
    Closed,
}

impl ConversationStatus {
    /// Only `Open` accepts new traffic; every other status is terminal here.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Which side of the support desk authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderKind {
    User,
    Support,
}

impl SenderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Support => "support",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "support" => Some(Self::Support),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub user_id: UserId,
    pub user_display_name: String,
    pub status: ConversationStatus,
    pub unread_count: u32,
    pub created_at_unix_millis: u64,
    pub updated_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub user_id: UserId,
    pub user_display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationPatch {
    pub status: Option<ConversationStatus>,
    pub unread_count: Option<u32>,
}

impl ConversationPatch {
    pub fn mark_read() -> Self {
        Self {
            unread_count: Some(0),
            ..Self::default()
        }
    }

    pub fn with_status(status: ConversationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_kind: SenderKind,
    /// `None` for the reserved system sender.
    pub sender_id: Option<UserId>,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub body: String,
    pub created_at_unix_millis: u64,
}

impl MessageRecord {
    /// Total order used everywhere messages are sorted: creation time, then id.
    ///
    /// Message ids are UUIDv7, so the tie-break follows mint order for rows that
    /// share a millisecond.
    pub fn chronological_cmp(&self, other: &Self) -> Ordering {
        self.created_at_unix_millis
            .cmp(&other.created_at_unix_millis)
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_kind: SenderKind,
    pub sender_id: Option<UserId>,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub body: String,
}

impl NewMessage {
    pub fn from_user(
        user_id: UserId,
        sender_name: impl Into<String>,
        sender_avatar: Option<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender_kind: SenderKind::User,
            sender_id: Some(user_id),
            sender_name: sender_name.into(),
            sender_avatar,
            body: body.into(),
        }
    }

    pub fn from_support(
        agent_id: UserId,
        sender_name: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender_kind: SenderKind::Support,
            sender_id: Some(agent_id),
            sender_name: sender_name.into(),
            sender_avatar: None,
            body: body.into(),
        }
    }

    /// Automated message attributed to the reserved system sender.
    pub fn from_system(sender_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender_kind: SenderKind::Support,
            sender_id: None,
            sender_name: sender_name.into(),
            sender_avatar: None,
            body: body.into(),
        }
    }

    /// Inbound support traffic counts toward the owner's unread counter.
    pub fn counts_as_unread(&self) -> bool {
        matches!(self.sender_kind, SenderKind::Support)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageOrder {
    #[default]
    CreatedAscending,
    CreatedDescending,
}

/// Row-level change notification delivered through a feed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    MessageInserted(MessageRecord),
}

impl FeedEvent {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::MessageInserted(record) => record.conversation_id,
        }
    }
}
