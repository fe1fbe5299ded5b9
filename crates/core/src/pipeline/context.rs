use loom_llm::{AgentInput, AgentMessage, AgentRequest, AgentRunner};
use loom_storage::{ConversationId, ProjectSnapshot, TaskKind};
use serde_json::Value;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use super::events::EventSink;
use super::state::{RunStage, RunState, RunTransition, stage_plan};
use crate::aggregate::aggregate;
use crate::agents::{AgentCatalog, AgentRole};
use crate::error::{ExtractionSnafu, InvalidTransitionSnafu, PipelineResult};
use crate::extract::{Extracted, extract_object};

/// Per-run state threaded through every stage of one pipeline.
pub struct PipelineContext<'a> {
    runner: &'a dyn AgentRunner,
    agents: &'a AgentCatalog,
    pub conversation_id: ConversationId,
    pub user_input: String,
    /// Active snapshot the run started from. Never mutated in place.
    pub snapshot: ProjectSnapshot,
    pub history: Vec<AgentMessage>,
    pub events: EventSink,
    pub cancel: CancellationToken,
    task: TaskKind,
    state: RunState,
}

impl<'a> PipelineContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: &'a dyn AgentRunner,
        agents: &'a AgentCatalog,
        conversation_id: ConversationId,
        task: TaskKind,
        user_input: String,
        snapshot: ProjectSnapshot,
        history: Vec<AgentMessage>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            agents,
            conversation_id,
            user_input,
            snapshot,
            history,
            events,
            cancel,
            task,
            state: RunState::Pending,
        }
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn enter(&mut self, stage: RunStage) -> PipelineResult<()> {
        self.transition(RunTransition::Enter(stage))?;
        tracing::info!(
            conversation_id = %self.conversation_id,
            task = %self.task,
            stage = %stage,
            "entering stage"
        );
        Ok(())
    }

    pub fn complete(&mut self) -> PipelineResult<()> {
        self.transition(RunTransition::Complete)
    }

    /// Marks the run failed. A run that already finished stays as it was.
    pub fn fail(&mut self) {
        if let Ok(next) = self.state.apply(stage_plan(self.task), RunTransition::Fail) {
            self.state = next;
        }
    }

    fn transition(&mut self, transition: RunTransition) -> PipelineResult<()> {
        match self.state.apply(stage_plan(self.task), transition) {
            Ok(next) => {
                self.state = next;
                Ok(())
            }
            Err(rejection) => InvalidTransitionSnafu {
                stage: "pipeline-transition",
                details: rejection.to_string(),
            }
            .fail(),
        }
    }

    pub fn instructions(&self, role: AgentRole) -> String {
        self.agents.instructions(role)
    }

    /// The replayed history followed by the current user turn.
    pub fn history_with_input(&self) -> Vec<AgentMessage> {
        let mut turns = self.history.clone();
        turns.push(AgentMessage::user(self.user_input.clone()));
        turns
    }

    /// Runs an agent without forwarding anything to the caller.
    pub async fn collect(
        &self,
        role: AgentRole,
        input: impl Into<AgentInput>,
    ) -> PipelineResult<String> {
        let request = AgentRequest::new(self.agents.descriptor(role), input);
        let aggregated = aggregate(self.runner, request, &self.cancel, |_| {}).await?;
        Ok(aggregated.text)
    }

    /// Runs an agent and forwards each fragment as a chat message.
    pub async fn stream_message(
        &self,
        role: AgentRole,
        input: impl Into<AgentInput>,
    ) -> PipelineResult<String> {
        let request = AgentRequest::new(self.agents.descriptor(role), input);
        let events = &self.events;
        let aggregated = aggregate(self.runner, request, &self.cancel, |fragment| {
            events.message(fragment)
        })
        .await?;
        Ok(aggregated.text)
    }

    /// Runs an agent and forwards each fragment as a raw JSON text chunk.
    pub async fn stream_json(
        &self,
        role: AgentRole,
        input: impl Into<AgentInput>,
    ) -> PipelineResult<String> {
        let request = AgentRequest::new(self.agents.descriptor(role), input);
        let events = &self.events;
        let aggregated = aggregate(self.runner, request, &self.cancel, |fragment| {
            events.json_chunk(Value::String(fragment.to_string()))
        })
        .await?;
        Ok(aggregated.text)
    }

    /// Extracts a JSON object, warning the caller when it had to be rebuilt
    /// from truncated output.
    pub fn extract(&self, text: &str, stage: &'static str) -> PipelineResult<Extracted> {
        let extracted = extract_object(text).context(ExtractionSnafu { stage })?;
        if extracted.is_partial() {
            self.events.warning(format!(
                "Output of `{stage}` was truncated and has been reconstructed"
            ));
        }
        Ok(extracted)
    }
}
