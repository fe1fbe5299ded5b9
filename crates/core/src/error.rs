use loom_llm::AgentError;
use loom_storage::{StorageError, UserId};
use snafu::Snafu;

use crate::extract::ExtractionFailure;

pub type PipelineResult<T> = Result<T, PipelineError>;
pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PipelineError {
    #[snafu(display("precondition missing on `{stage}`: {details}"))]
    PreconditionMissing {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("structured output could not be extracted on `{stage}`: {source}"))]
    Extraction {
        stage: &'static str,
        source: ExtractionFailure,
    },
    #[snafu(display("agent '{agent}' could not be invoked on `{stage}`: {source}"))]
    AgentInvoke {
        stage: &'static str,
        agent: String,
        source: AgentError,
    },
    #[snafu(display("agent '{agent}' failed mid-stream on `{stage}`: {message}"))]
    AgentStream {
        stage: &'static str,
        agent: String,
        message: String,
    },
    #[snafu(display("run was cancelled on `{stage}`"))]
    Cancelled { stage: &'static str },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("conversation {conversation_id} does not exist"))]
    ConversationMissing {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("user {user_id} may not start a turn: {reason}"))]
    AccessRefused {
        stage: &'static str,
        user_id: UserId,
        reason: String,
    },
    #[snafu(display("illegal run transition on `{stage}`: {details}"))]
    InvalidTransition {
        stage: &'static str,
        details: String,
    },
}

impl PipelineError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::PreconditionMissing { stage, .. }
            | Self::Extraction { stage, .. }
            | Self::AgentInvoke { stage, .. }
            | Self::AgentStream { stage, .. }
            | Self::Cancelled { stage }
            | Self::Storage { stage, .. }
            | Self::ConversationMissing { stage, .. }
            | Self::AccessRefused { stage, .. }
            | Self::InvalidTransition { stage, .. } => *stage,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Counting or reservation failed. Never fatal to a run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BillingError {
    #[snafu(display("token counting failed on `{stage}`: {source}"))]
    TokenCount {
        stage: &'static str,
        source: AgentError,
    },
    #[snafu(display("credit store failed on `{stage}`: {source}"))]
    CreditStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("user {user_id} has no credit account"))]
    AccountMissing {
        stage: &'static str,
        user_id: UserId,
    },
    #[snafu(display("reservation of {amount} refused for user {user_id}"))]
    ReservationRefused {
        stage: &'static str,
        user_id: UserId,
        amount: u64,
    },
}
