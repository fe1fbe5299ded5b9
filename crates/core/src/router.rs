use loom_llm::{AgentDescriptor, AgentMessage, AgentRequest, AgentRunner};
use loom_storage::TaskKind;
use tokio_util::sync::CancellationToken;

use crate::aggregate::aggregate;
use crate::error::{PipelineError, PipelineResult};
use crate::extract::extract_object;

/// Substring fallback, checked in order. Every legacy compound tag comes
/// before the bare names, so `error_resolution` wins over a stray
/// `generation` elsewhere in the reply.
const FALLBACK_PRECEDENCE: [(&str, TaskKind); 9] = [
    ("code_generation", TaskKind::Generation),
    ("error_resolution", TaskKind::ErrorResolution),
    ("code_change", TaskKind::Modification),
    ("code_continuation", TaskKind::Generation),
    ("code_conversation", TaskKind::Conversation),
    ("error-resolution", TaskKind::ErrorResolution),
    ("generation", TaskKind::Generation),
    ("modification", TaskKind::Modification),
    ("conversation", TaskKind::Conversation),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationMethod {
    Structured,
    /// The reply was not a `{"task": ...}` object with a known tag.
    Fallback,
    /// The classification agent could not be run at all.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub task: TaskKind,
    pub method: ClassificationMethod,
}

pub fn parse_tag(raw: &str) -> Option<TaskKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "generation" | "code_generation" | "code_continuation" => Some(TaskKind::Generation),
        "modification" | "code_change" => Some(TaskKind::Modification),
        "error_resolution" | "error-resolution" => Some(TaskKind::ErrorResolution),
        "conversation" | "code_conversation" => Some(TaskKind::Conversation),
        _ => None,
    }
}

/// Total, deterministic interpretation of a classifier reply.
pub fn classify_reply(reply: &str) -> Classification {
    let structured = extract_object(reply).ok().and_then(|extracted| {
        extracted
            .value
            .get("task")
            .and_then(|task| task.as_str())
            .and_then(parse_tag)
    });
    if let Some(task) = structured {
        return Classification {
            task,
            method: ClassificationMethod::Structured,
        };
    }

    let lowered = reply.to_ascii_lowercase();
    let task = FALLBACK_PRECEDENCE
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map_or(TaskKind::Conversation, |(_, task)| *task);
    tracing::warn!(task = %task, "classification ambiguous, substring fallback engaged");
    Classification {
        task,
        method: ClassificationMethod::Fallback,
    }
}

/// Pipeline actually run for a tag, given whether a snapshot exists.
pub fn dispatch(task: TaskKind, has_snapshot: bool) -> TaskKind {
    match (task, has_snapshot) {
        (TaskKind::Conversation, _) => TaskKind::Conversation,
        (_, false) => TaskKind::Generation,
        (TaskKind::ErrorResolution, true) => TaskKind::ErrorResolution,
        (TaskKind::Generation | TaskKind::Modification, true) => TaskKind::Modification,
    }
}

/// Runs the classification agent over the replayed history plus the new turn.
///
/// Agent failures degrade to `generation`; only cancellation is propagated.
pub async fn classify(
    runner: &dyn AgentRunner,
    agent: AgentDescriptor,
    history: &[AgentMessage],
    utterance: &str,
    cancel: &CancellationToken,
) -> PipelineResult<Classification> {
    let mut turns = history.to_vec();
    turns.push(AgentMessage::user(utterance));

    match aggregate(runner, AgentRequest::new(agent, turns), cancel, |_| {}).await {
        Ok(aggregated) => Ok(classify_reply(&aggregated.text)),
        Err(error @ PipelineError::Cancelled { .. }) => Err(error),
        Err(error) => {
            tracing::warn!(error = %error, "classifier unavailable, defaulting to generation");
            Ok(Classification {
                task: TaskKind::Generation,
                method: ClassificationMethod::Unavailable,
            })
        }
    }
}
