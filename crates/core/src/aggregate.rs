//! Pull-based consumption of one agent stream.

use loom_llm::{AgentEvent, AgentRequest, AgentRunner, AgentStreamHandle, TokenUsage};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentInvokeSnafu, AgentStreamSnafu, CancelledSnafu, PipelineResult};

/// Fragments that carry no content of their own once trimmed.
pub const NOISE_MARKERS: [&str; 3] = ["```json", "```", "json"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregated {
    pub text: String,
    pub usage: TokenUsage,
}

pub fn is_noise(fragment: &str) -> bool {
    let trimmed = fragment.trim();
    NOISE_MARKERS.contains(&trimmed)
}

/// Invokes the agent and drains its stream in arrival order.
///
/// Non-noise fragments are appended to the result and handed to `forward`
/// unchanged. A mid-stream error discards the accumulated text. Cancelling
/// `cancel` stops the upstream worker and fails with `Cancelled`.
pub async fn aggregate<F>(
    runner: &dyn AgentRunner,
    request: AgentRequest,
    cancel: &CancellationToken,
    mut forward: F,
) -> PipelineResult<Aggregated>
where
    F: FnMut(&str) + Send,
{
    let agent = request.agent.name.clone();
    if cancel.is_cancelled() {
        return CancelledSnafu {
            stage: "aggregate-before-invoke",
        }
        .fail();
    }

    let AgentStreamHandle { mut stream, worker } =
        runner.invoke(request).context(AgentInvokeSnafu {
            stage: "aggregate-invoke",
            agent: agent.clone(),
        })?;
    tokio::spawn(worker);

    let mut aggregated = Aggregated::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            event = stream.recv() => Some(event),
        };
        let Some(event) = next else {
            stream.cancel();
            tracing::info!(agent = %agent, "agent stream cancelled by caller");
            return CancelledSnafu {
                stage: "aggregate-stream",
            }
            .fail();
        };

        match event {
            Some(AgentEvent::Fragment(fragment)) => {
                if let Some(usage) = fragment.usage {
                    aggregated.usage.accumulate(usage);
                }
                if fragment.text.is_empty() || is_noise(&fragment.text) {
                    continue;
                }
                forward(&fragment.text);
                aggregated.text.push_str(&fragment.text);
            }
            Some(AgentEvent::Error(message)) => {
                tracing::warn!(agent = %agent, error = %message, "agent stream failed");
                return AgentStreamSnafu {
                    stage: "aggregate-stream",
                    agent,
                    message,
                }
                .fail();
            }
            Some(AgentEvent::Done) | None => break,
        }
    }

    tracing::debug!(
        agent = %agent,
        chars = aggregated.text.len(),
        tokens = aggregated.usage.total(),
        "agent stream aggregated"
    );
    Ok(aggregated)
}
