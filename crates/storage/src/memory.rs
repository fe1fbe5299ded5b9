//! Process-local store used by tests and the QA runner.
//!
//! Each conversation and credit row sits behind its own async mutex, so a
//! read-modify-write on one row never waits on another row. The outer maps are
//! guarded by short synchronous locks that are never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use snafu::OptionExt;
use tokio::sync::Mutex as RowLock;

use super::error::{NotFoundSnafu, StorageResult};
use super::ids::{ConversationId, MessageId, UserId};
use super::types::{
    CommittedTurn, ConversationRecord, CreditAccount, CreditEditOutcome, DEFAULT_PROJECT_NAME,
    HistoryState, MessageRecord, NewConversation, NewMessage,
};
use super::{
    BoxFuture, ConversationStore, CreditEdit, CreditStore, HistoryEdit, MessageStore, TurnCommit,
    unix_timestamp_seconds,
};

#[derive(Default)]
pub struct MemoryStorage {
    conversations: Mutex<HashMap<ConversationId, Arc<RowLock<ConversationRecord>>>>,
    messages: Mutex<Vec<MessageRecord>>,
    credits: Mutex<HashMap<UserId, Arc<RowLock<CreditAccount>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn conversation_row(
        &self,
        conversation_id: ConversationId,
    ) -> Option<Arc<RowLock<ConversationRecord>>> {
        lock(&self.conversations).get(&conversation_id).cloned()
    }

    fn credit_row(&self, user_id: UserId) -> Option<Arc<RowLock<CreditAccount>>> {
        lock(&self.credits).get(&user_id).cloned()
    }

    fn push_message(&self, conversation_id: ConversationId, input: NewMessage) -> MessageRecord {
        let mut messages = lock(&self.messages);
        let seq = messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .count() as u64
            + 1;
        let record = MessageRecord {
            id: MessageId::new_v7(),
            conversation_id,
            seq,
            user_text: input.user_text,
            assistant_text: input.assistant_text,
            snapshot: input.snapshot,
            task: input.task,
            created_at_unix_seconds: now_u64(),
        };
        messages.push(record.clone());
        record
    }
}

impl ConversationStore for MemoryStorage {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let now = now_u64();
            let record = ConversationRecord {
                id: ConversationId::new_v7(),
                user_id: input.user_id,
                name: input
                    .name
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string()),
                history: HistoryState::default(),
                created_at_unix_seconds: now,
                updated_at_unix_seconds: now,
            };
            lock(&self.conversations).insert(record.id, Arc::new(RowLock::new(record.clone())));
            Ok(record)
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let Some(row) = self.conversation_row(conversation_id) else {
                return Ok(None);
            };
            let record = row.lock().await.clone();
            Ok(Some(record))
        })
    }

    fn list_conversations(
        &self,
        user_id: UserId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = lock(&self.conversations).values().cloned().collect::<Vec<_>>();
            let mut records = Vec::new();
            for row in rows {
                let record = row.lock().await;
                if record.user_id == user_id {
                    records.push(record.clone());
                }
            }
            records.sort_by(|left, right| {
                right
                    .updated_at_unix_seconds
                    .cmp(&left.updated_at_unix_seconds)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(records)
        })
    }

    fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        name: String,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let row = self.conversation_row(conversation_id).context(NotFoundSnafu {
                stage: "memory-rename-conversation",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;
            let mut record = row.lock().await;
            record.name = name;
            record.updated_at_unix_seconds = now_u64();
            Ok(())
        })
    }

    fn edit_history(
        &self,
        conversation_id: ConversationId,
        edit: HistoryEdit,
    ) -> BoxFuture<'_, StorageResult<HistoryState>> {
        Box::pin(async move {
            let row = self.conversation_row(conversation_id).context(NotFoundSnafu {
                stage: "memory-edit-history",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;
            let mut record = row.lock().await;
            edit(&mut record.history);
            record.updated_at_unix_seconds = now_u64();
            Ok(record.history.clone())
        })
    }

    fn commit_turn(
        &self,
        conversation_id: ConversationId,
        commit: TurnCommit,
    ) -> BoxFuture<'_, StorageResult<CommittedTurn>> {
        Box::pin(async move {
            let row = self.conversation_row(conversation_id).context(NotFoundSnafu {
                stage: "memory-commit-turn",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;
            let mut record = row.lock().await;
            if let Some(edit) = commit.history {
                edit(&mut record.history);
            }
            if let Some(name) = commit.rename {
                record.name = name;
            }
            record.updated_at_unix_seconds = now_u64();
            let message = self.push_message(conversation_id, commit.message);
            Ok(CommittedTurn {
                history: record.history.clone(),
                message,
            })
        })
    }
}

impl MessageStore for MemoryStorage {
    fn add_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            self.conversation_row(conversation_id).context(NotFoundSnafu {
                stage: "memory-add-message",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;
            Ok(self.push_message(conversation_id, input))
        })
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let mut records = lock(&self.messages)
                .iter()
                .filter(|message| message.conversation_id == conversation_id)
                .cloned()
                .collect::<Vec<_>>();
            records.sort_by_key(|message| (message.created_at_unix_seconds, message.seq));
            Ok(records)
        })
    }

    fn count_user_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let count = lock(&self.messages)
                .iter()
                .filter(|message| {
                    message.conversation_id == conversation_id
                        && !message.user_text.trim().is_empty()
                })
                .count();
            Ok(count as u64)
        })
    }
}

impl CreditStore for MemoryStorage {
    fn get_credit_account(
        &self,
        user_id: UserId,
    ) -> BoxFuture<'_, StorageResult<Option<CreditAccount>>> {
        Box::pin(async move {
            let Some(row) = self.credit_row(user_id) else {
                return Ok(None);
            };
            let account = row.lock().await.clone();
            Ok(Some(account))
        })
    }

    fn put_credit_account(&self, account: CreditAccount) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            match self.credit_row(account.user_id) {
                Some(row) => *row.lock().await = account,
                None => {
                    lock(&self.credits)
                        .entry(account.user_id)
                        .or_insert_with(|| Arc::new(RowLock::new(account)));
                }
            }
            Ok(())
        })
    }

    fn edit_credit_account(
        &self,
        user_id: UserId,
        edit: CreditEdit,
    ) -> BoxFuture<'_, StorageResult<CreditEditOutcome>> {
        Box::pin(async move {
            let Some(row) = self.credit_row(user_id) else {
                return Ok(CreditEditOutcome::Missing);
            };
            let mut account = row.lock().await;
            let before = account.clone();
            let Some(balance) = edit(&before) else {
                return Ok(CreditEditOutcome::Refused(before));
            };
            account.daily_tokens_available = Some(balance.daily_tokens_available);
            account.total_tokens_remaining = Some(balance.total_tokens_remaining);
            Ok(CreditEditOutcome::Applied {
                before,
                after: account.clone(),
            })
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_u64() -> u64 {
    u64::try_from(unix_timestamp_seconds()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CreditBalance, ProjectSnapshot, SubscriptionStatus, TaskKind};

    fn account(daily: Option<i64>, total: Option<i64>) -> CreditAccount {
        CreditAccount {
            user_id: UserId(7),
            status: SubscriptionStatus::Active,
            daily_tokens_available: daily,
            total_tokens_remaining: total,
        }
    }

    #[tokio::test]
    async fn new_conversation_starts_with_empty_history() {
        let store = MemoryStorage::new();
        let created = store
            .create_conversation(NewConversation {
                user_id: UserId(1),
                name: None,
            })
            .await
            .unwrap();
        assert_eq!(created.name, DEFAULT_PROJECT_NAME);
        assert_eq!(created.history, HistoryState::default());

        let fetched = store.get_conversation(created.id).await.unwrap();
        assert_eq!(fetched, Some(created));
    }

    #[tokio::test]
    async fn edit_history_persists_the_edited_state() {
        let store = MemoryStorage::new();
        let created = store
            .create_conversation(NewConversation {
                user_id: UserId(1),
                name: Some("shop".to_string()),
            })
            .await
            .unwrap();
        let snapshot = ProjectSnapshot::from_files([("index.html", "<html></html>")]);
        let pushed = snapshot.clone();
        let state = store
            .edit_history(
                created.id,
                Box::new(move |history: &mut HistoryState| {
                    history.snapshots.push(pushed.clone());
                    history.position = Some(0);
                    history.current = pushed;
                }),
            )
            .await
            .unwrap();
        assert_eq!(state.current, snapshot);

        let reloaded = store.get_conversation(created.id).await.unwrap().unwrap();
        assert_eq!(reloaded.history, state);
    }

    #[tokio::test]
    async fn edit_history_on_unknown_conversation_is_not_found() {
        let store = MemoryStorage::new();
        let result = store
            .edit_history(ConversationId::new_v7(), Box::new(|_: &mut HistoryState| {}))
            .await;
        assert!(matches!(
            result,
            Err(crate::StorageError::NotFound { entity: "conversation", .. })
        ));
    }

    #[tokio::test]
    async fn commit_turn_writes_history_message_and_name_together() {
        let store = MemoryStorage::new();
        let created = store
            .create_conversation(NewConversation {
                user_id: UserId(1),
                name: None,
            })
            .await
            .unwrap();
        let snapshot = ProjectSnapshot::from_files([("index.html", "<p>hi</p>")]);
        let pushed = snapshot.clone();
        let committed = store
            .commit_turn(
                created.id,
                TurnCommit {
                    message: NewMessage {
                        user_text: "build it".to_string(),
                        assistant_text: "built".to_string(),
                        snapshot: Some(snapshot.clone()),
                        task: TaskKind::Generation,
                    },
                    history: Some(Box::new(move |history: &mut HistoryState| {
                        history.snapshots.push(pushed.clone());
                        history.position = Some(0);
                        history.current = pushed;
                    })),
                    rename: Some("Greeter".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(committed.message.seq, 1);
        assert_eq!(committed.history.current, snapshot);

        let reloaded = store.get_conversation(created.id).await.unwrap().unwrap();
        assert_eq!(reloaded.name, "Greeter");
        assert_eq!(reloaded.history, committed.history);
        assert_eq!(store.list_messages(created.id).await.unwrap(), vec![committed.message]);
    }

    #[tokio::test]
    async fn commit_turn_on_unknown_conversation_writes_nothing() {
        let store = MemoryStorage::new();
        let missing = ConversationId::new_v7();
        let result = store
            .commit_turn(
                missing,
                TurnCommit {
                    message: NewMessage {
                        user_text: "hi".to_string(),
                        assistant_text: "hello".to_string(),
                        snapshot: None,
                        task: TaskKind::Conversation,
                    },
                    history: None,
                    rename: None,
                },
            )
            .await;
        assert!(matches!(result, Err(crate::StorageError::NotFound { .. })));
        assert!(store.list_messages(missing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn messages_are_listed_in_insertion_order() {
        let store = MemoryStorage::new();
        let conversation = store
            .create_conversation(NewConversation {
                user_id: UserId(1),
                name: None,
            })
            .await
            .unwrap();
        for text in ["first", "", "third"] {
            store
                .add_message(
                    conversation.id,
                    NewMessage {
                        user_text: text.to_string(),
                        assistant_text: "ok".to_string(),
                        snapshot: None,
                        task: TaskKind::Conversation,
                    },
                )
                .await
                .unwrap();
        }

        let messages = store.list_messages(conversation.id).await.unwrap();
        let seqs = messages.iter().map(|message| message.seq).collect::<Vec<_>>();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(store.count_user_messages(conversation.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn refused_credit_edit_leaves_row_untouched() {
        let store = MemoryStorage::new();
        store.put_credit_account(account(Some(50), Some(100))).await.unwrap();

        let outcome = store
            .edit_credit_account(UserId(7), Box::new(|_: &CreditAccount| None))
            .await
            .unwrap();
        assert_eq!(outcome, CreditEditOutcome::Refused(account(Some(50), Some(100))));

        let outcome = store
            .edit_credit_account(
                UserId(7),
                Box::new(|_: &CreditAccount| {
                    Some(CreditBalance {
                        daily_tokens_available: 40,
                        total_tokens_remaining: 100,
                    })
                }),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CreditEditOutcome::Applied {
                before: account(Some(50), Some(100)),
                after: account(Some(40), Some(100)),
            }
        );
        assert_eq!(
            store
                .edit_credit_account(UserId(99), Box::new(|_: &CreditAccount| None))
                .await
                .unwrap(),
            CreditEditOutcome::Missing
        );
    }
}
