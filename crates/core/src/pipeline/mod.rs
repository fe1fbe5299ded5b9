//! Task pipelines and the orchestrator that routes turns into them.

mod context;
mod conversation;
mod error_resolution;
mod events;
mod generation;
mod modification;
mod orchestrator;
mod state;

#[cfg(test)]
mod tests;

use loom_storage::ProjectSnapshot;
use serde_json::{Map, Value};

use crate::credits::BillableTurn;

pub use context::PipelineContext;
pub use error_resolution::{ErrorAnalysis, error_file_order, structure_view};
pub use events::{
    BillingStatus, CompletePayload, ErrorPayload, EventSink, PipelineEvent, strip_markup_fences,
};
pub use generation::normalize_project;
pub use modification::{FileSelection, modification_targets};
pub use orchestrator::{
    ConversationGuard, ConversationLocks, Orchestrator, TurnHandle, TurnOutcome, TurnRequest,
    parse_project_name, replay_history,
};
pub use state::{RunStage, RunState, RunTransition, RunTransitionRejection, stage_plan};

/// What a pipeline hands back for the shared persist and bill stages.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub assistant_text: String,
    pub snapshot: Option<ProjectSnapshot>,
    pub billable: Option<BillableTurn>,
}

pub(crate) fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// A list of strings under `key`; a lone string counts as a one-item list.
pub(crate) fn string_list(value: &Value, key: &str) -> Vec<String> {
    match value.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(item)) if !item.trim().is_empty() => vec![item.trim().to_string()],
        _ => Vec::new(),
    }
}

/// File content as text; structured content is kept as its JSON rendering.
pub(crate) fn file_content(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn file_map(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn project_json(snapshot: &ProjectSnapshot) -> Value {
    serde_json::to_value(snapshot).unwrap_or_default()
}
