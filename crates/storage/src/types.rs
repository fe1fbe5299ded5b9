use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{InvariantViolationSnafu, StorageResult};
use super::ids::{ConversationId, MessageId, UserId};

/// Name given to conversations before the first turn suggests a better one.
pub const DEFAULT_PROJECT_NAME: &str = "New Project";

/// One complete generated project: file paths mapped to full file contents.
///
/// Keys other than the known metadata are preserved verbatim in `extra` so that a
/// snapshot written by an agent survives a store round trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProjectSnapshot {
    pub fn from_files<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            files: files
                .into_iter()
                .map(|(path, content)| (path.into(), content.into()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.project_name.is_none()
            && self.framework.is_none()
            && self.extra.is_empty()
    }
}

/// Bounded snapshot list plus the pointer undo/redo move along.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryState {
    pub snapshots: Vec<ProjectSnapshot>,
    pub position: Option<usize>,
    pub current: ProjectSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub user_id: UserId,
    pub name: String,
    pub history: HistoryState,
    pub created_at_unix_seconds: u64,
    pub updated_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub user_id: UserId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Generation,
    Modification,
    ErrorResolution,
    Conversation,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        Self::Generation,
        Self::Modification,
        Self::ErrorResolution,
        Self::Conversation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Modification => "modification",
            Self::ErrorResolution => "error_resolution",
            Self::Conversation => "conversation",
        }
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        match raw {
            "generation" => Ok(Self::Generation),
            "modification" => Ok(Self::Modification),
            "error_resolution" => Ok(Self::ErrorResolution),
            "conversation" => Ok(Self::Conversation),
            other => InvariantViolationSnafu {
                stage: "task-kind-parse",
                details: format!("unknown task kind '{other}'"),
            }
            .fail(),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub seq: u64,
    pub user_text: String,
    pub assistant_text: String,
    pub snapshot: Option<ProjectSnapshot>,
    pub task: TaskKind,
    pub created_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub user_text: String,
    pub assistant_text: String,
    pub snapshot: Option<ProjectSnapshot>,
    pub task: TaskKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTurn {
    pub history: HistoryState,
    pub message: MessageRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    Other(String),
}

impl SubscriptionStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::Other(raw) => raw,
        }
    }

    pub fn allows_usage(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditAccount {
    pub user_id: UserId,
    pub status: SubscriptionStatus,
    pub daily_tokens_available: Option<i64>,
    pub total_tokens_remaining: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditBalance {
    pub daily_tokens_available: i64,
    pub total_tokens_remaining: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditEditOutcome {
    Missing,
    Refused(CreditAccount),
    Applied {
        before: CreditAccount,
        after: CreditAccount,
    },
}
