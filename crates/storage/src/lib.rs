use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId, UserId};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    CommittedTurn, ConversationRecord, CreditAccount, CreditBalance, CreditEditOutcome,
    DEFAULT_PROJECT_NAME, HistoryState, MessageRecord, NewConversation, NewMessage, ProjectSnapshot,
    SubscriptionStatus, TaskKind,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Synchronous edit applied to a conversation's history while its row is locked.
pub type HistoryEdit = Box<dyn FnOnce(&mut HistoryState) + Send>;

/// Terminal writes of one turn: the history edit, the message and the new
/// conversation name land together or not at all.
pub struct TurnCommit {
    pub message: NewMessage,
    pub history: Option<HistoryEdit>,
    pub rename: Option<String>,
}

/// Decides the new balance for a locked credit row; `None` leaves the row untouched.
pub type CreditEdit = Box<dyn FnOnce(&CreditAccount) -> Option<CreditBalance> + Send>;

pub trait ConversationStore: Send + Sync {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>>;
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>>;
    fn list_conversations(
        &self,
        user_id: UserId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;
    fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        name: String,
    ) -> BoxFuture<'_, StorageResult<()>>;
    /// Reads the history, applies `edit` and writes it back as one atomic step.
    fn edit_history(
        &self,
        conversation_id: ConversationId,
        edit: HistoryEdit,
    ) -> BoxFuture<'_, StorageResult<HistoryState>>;
    /// Applies every write of `commit` in one atomic step.
    fn commit_turn(
        &self,
        conversation_id: ConversationId,
        commit: TurnCommit,
    ) -> BoxFuture<'_, StorageResult<CommittedTurn>>;
}

pub trait MessageStore: Send + Sync {
    fn add_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
    fn count_user_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<u64>>;
}

pub trait CreditStore: Send + Sync {
    fn get_credit_account(
        &self,
        user_id: UserId,
    ) -> BoxFuture<'_, StorageResult<Option<CreditAccount>>>;
    fn put_credit_account(&self, account: CreditAccount) -> BoxFuture<'_, StorageResult<()>>;
    /// Locking read of the user's credit row followed by the update `edit` decides on.
    fn edit_credit_account(
        &self,
        user_id: UserId,
        edit: CreditEdit,
    ) -> BoxFuture<'_, StorageResult<CreditEditOutcome>>;
}

pub trait Storage: ConversationStore + MessageStore + CreditStore {}

impl<T> Storage for T where T: ConversationStore + MessageStore + CreditStore {}

pub(crate) fn unix_timestamp_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}
