//! Bounded undo/redo history of project snapshots.
//!
//! The transitions are plain functions over [`HistoryState`]; [`HistoryEngine`]
//! runs them inside the store's atomic `edit_history` so concurrent callers on
//! one conversation never interleave a read-modify-write.

use std::sync::Arc;

use loom_storage::{ConversationId, HistoryEdit, HistoryState, ProjectSnapshot, Storage};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

use crate::error::{ConversationMissingSnafu, PipelineResult, StorageSnafu};

pub const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStatus {
    pub can_undo: bool,
    pub can_redo: bool,
    pub position: Option<usize>,
    pub total: usize,
}

/// Pushes `snapshot`, evicts the oldest entries beyond `limit` and moves the
/// position one step forward from where it was, clamped to the last index.
///
/// The step is taken from the pre-append position, so after an undo the
/// position lands on the entry after it rather than on the new tail.
pub fn append(state: &mut HistoryState, snapshot: ProjectSnapshot, limit: usize) {
    let limit = limit.max(1);
    state.snapshots.push(snapshot.clone());
    if state.snapshots.len() > limit {
        let excess = state.snapshots.len() - limit;
        state.snapshots.drain(..excess);
    }
    let last = state.snapshots.len() - 1;
    state.position = Some(state.position.map_or(0, |position| position + 1).min(last));
    state.current = snapshot;
}

pub fn undo(state: &mut HistoryState) -> ProjectSnapshot {
    move_to(state, |index, _| index.saturating_sub(1))
}

pub fn redo(state: &mut HistoryState) -> ProjectSnapshot {
    move_to(state, |index, last| (index + 1).min(last))
}

pub fn status(state: &HistoryState) -> HistoryStatus {
    let total = state.snapshots.len();
    let position = state.position;
    HistoryStatus {
        can_undo: position.is_some_and(|position| position > 0),
        can_redo: position.is_some_and(|position| position + 1 < total),
        position,
        total,
    }
}

/// Empty history is a no-op that yields the default snapshot. A stored
/// position outside the list is read as the last index.
fn move_to(state: &mut HistoryState, step: impl FnOnce(usize, usize) -> usize) -> ProjectSnapshot {
    let Some(last) = state.snapshots.len().checked_sub(1) else {
        return ProjectSnapshot::default();
    };
    let index = state
        .position
        .filter(|position| *position <= last)
        .unwrap_or(last);
    let target = step(index, last);
    state.position = Some(target);
    state.current = state.snapshots[target].clone();
    state.current.clone()
}

#[derive(Clone)]
pub struct HistoryEngine {
    store: Arc<dyn Storage>,
    limit: usize,
}

impl HistoryEngine {
    pub fn new(store: Arc<dyn Storage>, limit: usize) -> Self {
        Self {
            store,
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The append transition as a store edit, for callers that commit it
    /// together with other writes.
    pub fn append_edit(&self, snapshot: ProjectSnapshot) -> HistoryEdit {
        let limit = self.limit;
        Box::new(move |state: &mut HistoryState| append(state, snapshot, limit))
    }

    pub async fn append(
        &self,
        conversation_id: ConversationId,
        snapshot: ProjectSnapshot,
    ) -> PipelineResult<HistoryState> {
        let state = self
            .store
            .edit_history(conversation_id, self.append_edit(snapshot))
            .await
            .context(StorageSnafu {
                stage: "history-append",
            })?;
        tracing::debug!(
            conversation_id = %conversation_id,
            position = ?state.position,
            total = state.snapshots.len(),
            "snapshot appended"
        );
        Ok(state)
    }

    pub async fn undo(&self, conversation_id: ConversationId) -> PipelineResult<ProjectSnapshot> {
        let state = self
            .store
            .edit_history(
                conversation_id,
                Box::new(|state: &mut HistoryState| {
                    undo(state);
                }),
            )
            .await
            .context(StorageSnafu {
                stage: "history-undo",
            })?;
        Ok(state.current)
    }

    pub async fn redo(&self, conversation_id: ConversationId) -> PipelineResult<ProjectSnapshot> {
        let state = self
            .store
            .edit_history(
                conversation_id,
                Box::new(|state: &mut HistoryState| {
                    redo(state);
                }),
            )
            .await
            .context(StorageSnafu {
                stage: "history-redo",
            })?;
        Ok(state.current)
    }

    pub async fn status(&self, conversation_id: ConversationId) -> PipelineResult<HistoryStatus> {
        Ok(status(&self.load(conversation_id).await?))
    }

    pub async fn current(
        &self,
        conversation_id: ConversationId,
    ) -> PipelineResult<ProjectSnapshot> {
        Ok(self.load(conversation_id).await?.current)
    }

    async fn load(&self, conversation_id: ConversationId) -> PipelineResult<HistoryState> {
        let record = self
            .store
            .get_conversation(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "history-load",
            })?
            .context(ConversationMissingSnafu {
                stage: "history-load",
                conversation_id: conversation_id.to_string(),
            })?;
        Ok(record.history)
    }
}
