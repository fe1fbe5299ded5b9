use loom_storage::ProjectSnapshot;
use serde_json::Value;
use snafu::ResultExt;

use super::state::RunStage;
use super::{PipelineContext, PipelineOutcome};
use crate::agents::AgentRole;
use crate::credits::BillableTurn;
use crate::error::{ExtractionSnafu, PipelineResult};
use crate::extract::{ExtractionFailure, clean_markers};

/// Manifest file names that models truncate, with their canonical form.
const KEY_CORRECTIONS: [(&str, &str); 1] = [("package.", "package.json")];

pub(super) async fn run(ctx: &mut PipelineContext<'_>) -> PipelineResult<PipelineOutcome> {
    ctx.enter(RunStage::Plan)?;
    let plan = match ctx.collect(AgentRole::Planner, ctx.history_with_input()).await {
        Ok(plan) => Some(clean_markers(&plan))
            .filter(|plan| !plan.is_empty())
            .unwrap_or_else(|| fallback_plan(&ctx.user_input)),
        Err(error) if error.is_cancelled() => return Err(error),
        Err(error) => {
            tracing::warn!(error = %error, "planner failed, continuing with a minimal plan");
            fallback_plan(&ctx.user_input)
        }
    };

    ctx.enter(RunStage::Summarize)?;
    let summary_input = format!(
        "Detect the language of the User Input: {} \n\n Convert this Project Plan to detected language: \n\n{plan}",
        ctx.user_input
    );
    let summary = ctx
        .stream_message(AgentRole::Summarizer, summary_input)
        .await?;

    ctx.enter(RunStage::Generate)?;
    let generator_input = format!(
        "Based on this project plan, only generate the React project:\n\n{plan}\n\nUser Request: {} \n\n Only generate the spefic features requested by the user. Not include any extra features.",
        ctx.user_input
    );
    let raw = ctx
        .stream_json(AgentRole::Generator, generator_input.clone())
        .await?;
    let extracted = ctx.extract(&raw, "generation-extract")?;

    ctx.enter(RunStage::Normalize)?;
    let project = normalize_project(extracted.value).context(ExtractionSnafu {
        stage: "generation-normalize",
    })?;
    tracing::info!(
        conversation_id = %ctx.conversation_id,
        files = project.files.len(),
        "project generated"
    );

    let assistant = serde_json::to_string_pretty(&project).unwrap_or_default();
    Ok(PipelineOutcome {
        assistant_text: summary,
        snapshot: Some(project),
        billable: Some(BillableTurn {
            system: ctx.instructions(AgentRole::Generator),
            user: generator_input,
            assistant,
        }),
    })
}

fn fallback_plan(input: &str) -> String {
    format!("Project plan for: {input}")
}

/// Turns the generator's object into a snapshot, correcting truncated
/// manifest names. A project without files is rejected.
pub fn normalize_project(value: Value) -> Result<ProjectSnapshot, ExtractionFailure> {
    let rendered = value.to_string();
    let mut project: ProjectSnapshot = serde_json::from_value(value)
        .map_err(|_| ExtractionFailure::with_preview(&rendered))?;

    for (wrong, canonical) in KEY_CORRECTIONS {
        if project.files.contains_key(canonical) {
            continue;
        }
        if let Some(content) = project.files.remove(wrong) {
            project.files.insert(canonical.to_string(), content);
        }
    }

    if project.files.is_empty() {
        return Err(ExtractionFailure::with_preview(&rendered));
    }
    Ok(project)
}
