use super::events::strip_markup_fences;
use super::state::RunStage;
use super::{PipelineContext, PipelineOutcome};
use crate::agents::AgentRole;
use crate::error::PipelineResult;

/// One streamed reply over the replayed chat. No snapshot, nothing to bill.
pub(super) async fn run(ctx: &mut PipelineContext<'_>) -> PipelineResult<PipelineOutcome> {
    ctx.enter(RunStage::Respond)?;
    let reply = ctx
        .stream_message(AgentRole::Conversation, ctx.history_with_input())
        .await?;

    Ok(PipelineOutcome {
        assistant_text: strip_markup_fences(&reply).trim().to_string(),
        snapshot: None,
        billable: None,
    })
}
