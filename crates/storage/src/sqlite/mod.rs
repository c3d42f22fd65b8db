use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::Mutex;

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::feed::{FeedHub, FeedSubscription};
use super::ids::{ConversationId, MessageId, SubscriptionId, UserId};
use super::types::{
    ConversationPatch, ConversationRecord, ConversationStatus, FeedEvent, MessageOrder,
    MessageRecord, NewConversation, NewMessage, SenderKind,
};
use super::{BoxFuture, ChangeFeed, ConversationStore, MessageStore};

const CONVERSATION_COLUMNS: &str =
    "id, user_id, user_display_name, status, unread_count, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_kind, sender_id, sender_name, sender_avatar, body, created_at";

/// Durable gateway backed by SQLite.
///
/// The change feed covers writes made through this gateway instance, which is the
/// whole write path when the process owns the database file.
#[derive(Debug)]
pub struct SqliteGateway {
    pool: SqlitePool,
    feed: FeedHub,
    last_timestamp_millis: AtomicU64,
    // Held from timestamp to publish so the feed sees inserts in creation order.
    insert_lock: Mutex<()>,
}

impl SqliteGateway {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        Self::open_with_feed(database_location, FeedHub::default()).await
    }

    pub async fn open_with_feed(database_location: &str, feed: FeedHub) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One long-lived connection: keeps `:memory:` databases alive and serializes writers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "sqlite gateway ready");
        Ok(Self {
            pool,
            feed,
            last_timestamp_millis: AtomicU64::new(0),
            insert_lock: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn feed(&self) -> &FeedHub {
        &self.feed
    }

    fn next_timestamp(&self) -> u64 {
        let now = unix_timestamp_millis();
        let previous = match self.last_timestamp_millis.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |last| Some(now.max(last.saturating_add(1))),
        ) {
            Ok(previous) | Err(previous) => previous,
        };
        now.max(previous.saturating_add(1))
    }
}

impl ConversationStore for SqliteGateway {
    fn find_open_conversation<'a>(
        &'a self,
        user_id: UserId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ConversationRow>(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE user_id = ? AND status = 'open' LIMIT 1"
            ))
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-find-open-query",
            })?;

            row.map(conversation_row_to_record).transpose()
        })
    }

    fn get_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ConversationRow>(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
            ))
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-get-query",
            })?;

            row.map(conversation_row_to_record).transpose()
        })
    }

    fn create_conversation<'a>(
        &'a self,
        input: NewConversation,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let conversation_id = ConversationId::new_v7();
            let now = self.next_timestamp();
            let now_sql = u64_to_i64(now, "conversation-create-timestamp")?;

            let insert_result = sqlx::query(
                "INSERT INTO conversations (id, user_id, user_display_name, status, unread_count, created_at, updated_at) VALUES (?, ?, ?, 'open', 0, ?, ?)",
            )
            .bind(conversation_id.to_string())
            .bind(input.user_id.to_string())
            .bind(input.user_display_name.clone())
            .bind(now_sql)
            .bind(now_sql)
            .execute(&self.pool)
            .await;

            match insert_result {
                Ok(_) => {}
                Err(error) if is_unique_violation(&error) => {
                    return ConflictSnafu {
                        stage: "conversation-create-open-exists",
                        entity: "conversation",
                        details: format!(
                            "user '{}' already has an open conversation",
                            input.user_id
                        ),
                    }
                    .fail();
                }
                Err(source) => {
                    return Err(StorageError::SqliteQuery {
                        stage: "conversation-create-insert",
                        source,
                    });
                }
            }

            Ok(ConversationRecord {
                id: conversation_id,
                user_id: input.user_id,
                user_display_name: input.user_display_name,
                status: ConversationStatus::Open,
                unread_count: 0,
                created_at_unix_millis: now,
                updated_at_unix_millis: now,
            })
        })
    }

    fn update_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let now = u64_to_i64(self.next_timestamp(), "conversation-update-timestamp")?;
            let update_result = sqlx::query(
                "UPDATE conversations SET status = COALESCE(?, status), unread_count = COALESCE(?, unread_count), updated_at = ? WHERE id = ?",
            )
            .bind(patch.status.map(ConversationStatus::as_str))
            .bind(patch.unread_count.map(i64::from))
            .bind(now)
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await;

            let update_result = match update_result {
                Ok(result) => result,
                Err(error) if is_unique_violation(&error) => {
                    return ConflictSnafu {
                        stage: "conversation-update-reopen",
                        entity: "conversation",
                        details: format!(
                            "conversation '{conversation_id}' cannot reopen while another is open"
                        ),
                    }
                    .fail();
                }
                Err(source) => {
                    return Err(StorageError::SqliteQuery {
                        stage: "conversation-update-apply",
                        source,
                    });
                }
            };

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-update-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }
}

impl MessageStore for SqliteGateway {
    fn insert_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let _insert_guard = self.insert_lock.lock().await;
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-insert-begin",
            })?;

            let message_id = MessageId::new_v7();
            let now = self.next_timestamp();
            let now_sql = u64_to_i64(now, "message-insert-timestamp")?;

            let touched = sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
                .bind(now_sql)
                .bind(conversation_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-insert-touch-conversation",
                })?;
            if touched.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-insert-conversation-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            // The unread counter is bumped by the `messages_support_bumps_unread` trigger.
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, sender_kind, sender_id, sender_name, sender_avatar, body, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(conversation_id.to_string())
            .bind(input.sender_kind.as_str())
            .bind(input.sender_id.map(|sender_id| sender_id.to_string()))
            .bind(input.sender_name.clone())
            .bind(input.sender_avatar.clone())
            .bind(input.body.clone())
            .bind(now_sql)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-insert-row",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-insert-commit",
            })?;

            let record = MessageRecord {
                id: message_id,
                conversation_id,
                sender_kind: input.sender_kind,
                sender_id: input.sender_id,
                sender_name: input.sender_name,
                sender_avatar: input.sender_avatar,
                body: input.body,
                created_at_unix_millis: now,
            };
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
            let direction = match order {
                MessageOrder::CreatedAscending => "ASC",
                MessageOrder::CreatedDescending => "DESC",
            };
            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY created_at {direction}, id {direction}"
            ))
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

impl ChangeFeed for SqliteGateway {
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

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    user_id: String,
    user_display_name: String,
    status: String,
    unread_count: i64,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    sender_kind: String,
    sender_id: Option<String>,
    sender_name: String,
    sender_avatar: Option<String>,
    body: String,
    created_at: i64,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    let status = ConversationStatus::parse(&row.status).context(InvariantViolationSnafu {
        stage: "conversation-row-status",
        details: format!("unknown conversation status '{}'", row.status),
    })?;

    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        user_id: UserId::parse(&row.user_id)?,
        user_display_name: row.user_display_name,
        status,
        unread_count: i64_to_u32(row.unread_count, "conversation-row-unread-count")?,
        created_at_unix_millis: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    let sender_kind = SenderKind::parse(&row.sender_kind).context(InvariantViolationSnafu {
        stage: "message-row-sender-kind",
        details: format!("unknown sender kind '{}'", row.sender_kind),
    })?;

    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        sender_kind,
        sender_id: row.sender_id.as_deref().map(UserId::parse).transpose()?,
        sender_name: row.sender_name,
        sender_avatar: row.sender_avatar,
        body: row.body,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|database_error| database_error.is_unique_violation())
}

fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn i64_to_u32(value: i64, stage: &'static str) -> StorageResult<u32> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("sqlite integer '{value}' cannot map to u32"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
