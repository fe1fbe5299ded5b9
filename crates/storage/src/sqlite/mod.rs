use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, DecodeJsonSnafu, EncodeJsonSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, MessageId, UserId};
use super::types::{
    CommittedTurn, ConversationRecord, CreditAccount, CreditEditOutcome, DEFAULT_PROJECT_NAME,
    HistoryState, MessageRecord, NewConversation, NewMessage, ProjectSnapshot, SubscriptionStatus,
    TaskKind,
};
use super::{
    BoxFuture, ConversationStore, CreditEdit, CreditStore, HistoryEdit, MessageStore, TurnCommit,
    unix_timestamp_seconds,
};

/// SQLite-backed store.
///
/// The pool holds exactly one connection, so every transaction below owns the
/// database until it commits or rolls back. That is what makes `edit_history`,
/// `commit_turn` and `edit_credit_account` behave as locking read-modify-write
/// operations.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
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

        // In-memory databases vanish with their connection, so it must never be recycled.
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

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite storage opened");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, user_id, name, history_json, position, current_json, created_at, updated_at FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-get-select",
        })?;

        row.map(conversation_row_to_record).transpose()
    }
}

impl ConversationStore for SqliteStorage {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let conversation_id = ConversationId::new_v7();
            let name = input
                .name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string());
            let history = HistoryState::default();
            let now = unix_timestamp_seconds();

            sqlx::query(
                "INSERT INTO conversations (id, user_id, name, history_json, position, current_json, created_at, updated_at) VALUES (?, ?, ?, ?, NULL, ?, ?, ?)",
            )
            .bind(conversation_id.to_string())
            .bind(input.user_id.0)
            .bind(name.clone())
            .bind(encode_json(&history.snapshots, "conversation-create-history", "history")?)
            .bind(encode_json(&history.current, "conversation-create-current", "snapshot")?)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            Ok(ConversationRecord {
                id: conversation_id,
                user_id: input.user_id,
                name,
                history,
                created_at_unix_seconds: i64_to_u64(now, "conversation-create-created-at")?,
                updated_at_unix_seconds: i64_to_u64(now, "conversation-create-updated-at")?,
            })
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(self.load_conversation(conversation_id))
    }

    fn list_conversations(
        &self,
        user_id: UserId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, user_id, name, history_json, position, current_json, created_at, updated_at FROM conversations WHERE user_id = ? ORDER BY updated_at DESC, id DESC",
            )
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-select",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }

    fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        name: String,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE conversations SET name = ?, updated_at = ? WHERE id = ?")
                .bind(name)
                .bind(unix_timestamp_seconds())
                .bind(conversation_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-rename-update",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-rename-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }
            Ok(())
        })
    }

    fn edit_history(
        &self,
        conversation_id: ConversationId,
        edit: HistoryEdit,
    ) -> BoxFuture<'_, StorageResult<HistoryState>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "history-edit-begin",
            })?;

            let mut state = select_history(&mut tx, conversation_id).await?;
            edit(&mut state);
            write_history(&mut tx, conversation_id, &state).await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "history-edit-commit",
            })?;

            Ok(state)
        })
    }

    fn commit_turn(
        &self,
        conversation_id: ConversationId,
        commit: TurnCommit,
    ) -> BoxFuture<'_, StorageResult<CommittedTurn>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "turn-commit-begin",
            })?;

            let mut history = select_history(&mut tx, conversation_id).await?;
            if let Some(edit) = commit.history {
                edit(&mut history);
                write_history(&mut tx, conversation_id, &history).await?;
            }
            let message = insert_message(&mut tx, conversation_id, commit.message).await?;
            if let Some(name) = commit.rename {
                sqlx::query("UPDATE conversations SET name = ? WHERE id = ?")
                    .bind(name)
                    .bind(conversation_id.to_string())
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "turn-commit-rename",
                    })?;
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "turn-commit-commit",
            })?;

            Ok(CommittedTurn { history, message })
        })
    }
}

impl MessageStore for SqliteStorage {
    fn add_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-add-begin",
            })?;
            let record = insert_message(&mut tx, conversation_id, input).await?;
            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-add-commit",
            })?;
            Ok(record)
        })
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, conversation_id, seq, user_text, assistant_text, snapshot_json, task, created_at FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, seq ASC",
            )
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-select",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn count_user_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let count = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ? AND TRIM(user_text) != ''",
            )
            .bind(conversation_id.to_string())
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-count-user",
            })?;

            i64_to_u64(count, "message-count-user-value")
        })
    }
}

impl CreditStore for SqliteStorage {
    fn get_credit_account(
        &self,
        user_id: UserId,
    ) -> BoxFuture<'_, StorageResult<Option<CreditAccount>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, CreditRow>(
                "SELECT user_id, status, daily_tokens_available, total_tokens_remaining FROM credit_accounts WHERE user_id = ?",
            )
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "credit-get-select",
            })?;

            Ok(row.map(credit_row_to_account))
        })
    }

    fn put_credit_account(&self, account: CreditAccount) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO credit_accounts (user_id, status, daily_tokens_available, total_tokens_remaining, updated_at) VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT (user_id) DO UPDATE SET status = excluded.status, daily_tokens_available = excluded.daily_tokens_available, total_tokens_remaining = excluded.total_tokens_remaining, updated_at = excluded.updated_at",
            )
            .bind(account.user_id.0)
            .bind(account.status.as_str())
            .bind(account.daily_tokens_available)
            .bind(account.total_tokens_remaining)
            .bind(unix_timestamp_seconds())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "credit-put-upsert",
            })?;
            Ok(())
        })
    }

    fn edit_credit_account(
        &self,
        user_id: UserId,
        edit: CreditEdit,
    ) -> BoxFuture<'_, StorageResult<CreditEditOutcome>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "credit-edit-begin",
            })?;

            let row = sqlx::query_as::<_, CreditRow>(
                "SELECT user_id, status, daily_tokens_available, total_tokens_remaining FROM credit_accounts WHERE user_id = ?",
            )
            .bind(user_id.0)
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "credit-edit-select",
            })?;

            let Some(row) = row else {
                return Ok(CreditEditOutcome::Missing);
            };
            let before = credit_row_to_account(row);
            let Some(balance) = edit(&before) else {
                return Ok(CreditEditOutcome::Refused(before));
            };

            sqlx::query(
                "UPDATE credit_accounts SET daily_tokens_available = ?, total_tokens_remaining = ?, updated_at = ? WHERE user_id = ?",
            )
            .bind(balance.daily_tokens_available)
            .bind(balance.total_tokens_remaining)
            .bind(unix_timestamp_seconds())
            .bind(user_id.0)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "credit-edit-update",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "credit-edit-commit",
            })?;

            let after = CreditAccount {
                daily_tokens_available: Some(balance.daily_tokens_available),
                total_tokens_remaining: Some(balance.total_tokens_remaining),
                ..before.clone()
            };
            Ok(CreditEditOutcome::Applied { before, after })
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    user_id: i64,
    name: String,
    history_json: String,
    position: Option<i64>,
    current_json: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct HistoryRow {
    history_json: String,
    position: Option<i64>,
    current_json: String,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    seq: i64,
    user_text: String,
    assistant_text: String,
    snapshot_json: Option<String>,
    task: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct CreditRow {
    user_id: i64,
    status: String,
    daily_tokens_available: Option<i64>,
    total_tokens_remaining: Option<i64>,
}

async fn select_history(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
) -> StorageResult<HistoryState> {
    let row = sqlx::query_as::<_, HistoryRow>(
        "SELECT history_json, position, current_json FROM conversations WHERE id = ?",
    )
    .bind(conversation_id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .context(SqliteQuerySnafu {
        stage: "history-select",
    })?
    .context(NotFoundSnafu {
        stage: "history-select-missing",
        entity: "conversation",
        id: conversation_id.to_string(),
    })?;

    history_row_to_state(row)
}

async fn write_history(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
    state: &HistoryState,
) -> StorageResult<()> {
    let position = state
        .position
        .map(|value| usize_to_i64(value, "history-write-position"))
        .transpose()?;
    sqlx::query(
        "UPDATE conversations SET history_json = ?, position = ?, current_json = ?, updated_at = ? WHERE id = ?",
    )
    .bind(encode_json(&state.snapshots, "history-write-encode-history", "history")?)
    .bind(position)
    .bind(encode_json(&state.current, "history-write-encode-current", "snapshot")?)
    .bind(unix_timestamp_seconds())
    .bind(conversation_id.to_string())
    .execute(&mut *conn)
    .await
    .context(SqliteQuerySnafu {
        stage: "history-write-update",
    })?;
    Ok(())
}

async fn insert_message(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
    input: NewMessage,
) -> StorageResult<MessageRecord> {
    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM conversations WHERE id = ?")
        .bind(conversation_id.to_string())
        .fetch_one(&mut *conn)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-add-conversation-exists",
        })?;
    if exists == 0 {
        return NotFoundSnafu {
            stage: "message-add-conversation-missing",
            entity: "conversation",
            id: conversation_id.to_string(),
        }
        .fail();
    }

    let seq = sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?",
    )
    .bind(conversation_id.to_string())
    .fetch_one(&mut *conn)
    .await
    .context(SqliteQuerySnafu {
        stage: "message-add-next-seq",
    })?;

    let message_id = MessageId::new_v7();
    let now = unix_timestamp_seconds();
    let snapshot_json = input
        .snapshot
        .as_ref()
        .map(|snapshot| encode_json(snapshot, "message-add-encode-snapshot", "snapshot"))
        .transpose()?;

    sqlx::query(
        "INSERT INTO messages (id, conversation_id, seq, user_text, assistant_text, snapshot_json, task, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(message_id.to_string())
    .bind(conversation_id.to_string())
    .bind(seq)
    .bind(input.user_text.clone())
    .bind(input.assistant_text.clone())
    .bind(snapshot_json)
    .bind(input.task.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await
    .context(SqliteQuerySnafu {
        stage: "message-add-insert",
    })?;

    sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(conversation_id.to_string())
        .execute(&mut *conn)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-add-touch-conversation",
        })?;

    Ok(MessageRecord {
        id: message_id,
        conversation_id,
        seq: i64_to_u64(seq, "message-add-seq")?,
        user_text: input.user_text,
        assistant_text: input.assistant_text,
        snapshot: input.snapshot,
        task: input.task,
        created_at_unix_seconds: i64_to_u64(now, "message-add-created-at")?,
    })
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        user_id: UserId(row.user_id),
        name: row.name,
        history: history_row_to_state(HistoryRow {
            history_json: row.history_json,
            position: row.position,
            current_json: row.current_json,
        })?,
        created_at_unix_seconds: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn history_row_to_state(row: HistoryRow) -> StorageResult<HistoryState> {
    Ok(HistoryState {
        snapshots: decode_json(&row.history_json, "history-row-snapshots", "history")?,
        position: row
            .position
            .map(|value| i64_to_usize(value, "history-row-position"))
            .transpose()?,
        current: decode_json(&row.current_json, "history-row-current", "snapshot")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        user_text: row.user_text,
        assistant_text: row.assistant_text,
        snapshot: row
            .snapshot_json
            .as_deref()
            .map(|raw| decode_json::<ProjectSnapshot>(raw, "message-row-snapshot", "snapshot"))
            .transpose()?,
        task: TaskKind::parse(&row.task)?,
        created_at_unix_seconds: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn credit_row_to_account(row: CreditRow) -> CreditAccount {
    CreditAccount {
        user_id: UserId(row.user_id),
        status: SubscriptionStatus::parse(&row.status),
        daily_tokens_available: row.daily_tokens_available,
        total_tokens_remaining: row.total_tokens_remaining,
    }
}

fn encode_json<T: serde::Serialize>(
    value: &T,
    stage: &'static str,
    entity: &'static str,
) -> StorageResult<String> {
    serde_json::to_string(value).context(EncodeJsonSnafu { stage, entity })
}

fn decode_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    stage: &'static str,
    entity: &'static str,
) -> StorageResult<T> {
    serde_json::from_str(raw).context(DecodeJsonSnafu { stage, entity })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn i64_to_usize(value: i64, stage: &'static str) -> StorageResult<usize> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("sqlite integer '{value}' cannot map to usize"),
        })
}

fn usize_to_i64(value: usize, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("usize '{value}' cannot map to sqlite i64"),
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
