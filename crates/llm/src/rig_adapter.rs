use futures::StreamExt;
use rig::completion::{CompletionModel, GetTokenUsage, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::agent::{
    AgentError, AgentEvent, AgentFragment, AgentMessage, AgentRequest, AgentResult, AgentRunner,
    AgentStreamHandle, AgentWorker, CompletionsFailedSnafu, EmptyInputSnafu, HttpClientSnafu,
    MissingApiKeySnafu, ProviderConfig, Role, TokenUsage, make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

pub struct RigAgentRunner {
    config: ProviderConfig,
}

impl RigAgentRunner {
    pub fn new(config: ProviderConfig) -> AgentResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-runner-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> AgentResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.base_url.is_empty() {
            builder = builder.base_url(config.base_url.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &AgentMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(instructions: &str, messages: &[AgentMessage]) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if !instructions.trim().is_empty() {
            preamble_parts.push(instructions.to_string());
        }

        // Rig exposes a single preamble field, so system turns are folded into it.
        for message in messages {
            if matches!(message.role, Role::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: AgentRequest,
    ) -> AgentResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let agent = request.agent;
        let model = client.completion_model(agent.model_id.clone());
        let turns = request.input.into_messages();

        let mut messages = turns
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                agent = %agent.name,
                model_id = %agent.model_id,
                total_message_count = turns.len(),
                "cannot open stream because no user/assistant turns remain after filtering"
            );
            return EmptyInputSnafu {
                stage: "open-stream-pop-prompt",
                agent: agent.name,
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(&agent.instructions, &turns) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = agent.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = agent.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn emit_error_event(event_tx: &mpsc::UnboundedSender<AgentEvent>, error: AgentError) {
        let _ = event_tx.send(AgentEvent::Error(error.to_string()));
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<AgentEvent>
    where
        R: Clone + Unpin + GetTokenUsage,
    {
        let fragment = match item {
            StreamedAssistantContent::Text(text) => AgentFragment::text(text.text),
            StreamedAssistantContent::Final(response) => {
                let usage = response.token_usage()?;
                AgentFragment::usage(TokenUsage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                })
            }
            StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. } => return None,
        };

        Some(AgentEvent::Fragment(fragment))
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: AgentRequest,
        event_tx: mpsc::UnboundedSender<AgentEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let agent_name = request.agent.name.clone();
        let model_id = request.agent.model_id.clone();
        let mut stream = match Self::open_stream(&config, request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    agent = %agent_name,
                    provider_id = %config.provider_id,
                    model_id = %model_id,
                    error = %error,
                    "failed to open agent stream"
                );
                Self::emit_error_event(&event_tx, error);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(agent = %agent_name, "agent stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                agent = %agent_name,
                                error = %source,
                                "agent stream emitted an error chunk"
                            );
                            let error = AgentError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(AgentEvent::Done);
        }
    }
}

impl AgentRunner for RigAgentRunner {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn invoke(&self, request: AgentRequest) -> AgentResult<AgentStreamHandle> {
        ensure!(
            !request.input.is_empty(),
            EmptyInputSnafu {
                stage: "invoke",
                agent: request.agent.name.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(&request.agent.name);
        let worker: AgentWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(AgentStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_requires_api_key() {
        let result = RigAgentRunner::new(ProviderConfig::new("openai", "  ", ""));
        assert!(matches!(result, Err(AgentError::MissingApiKey { .. })));
    }

    #[test]
    fn preamble_merges_instructions_and_system_turns() {
        let turns = vec![
            AgentMessage::new(Role::System, "answer in json"),
            AgentMessage::user("hello"),
        ];
        let preamble = RigAgentRunner::merged_preamble("you plan projects", &turns);
        assert_eq!(
            preamble.as_deref(),
            Some("you plan projects\n\nanswer in json")
        );
        assert_eq!(RigAgentRunner::merged_preamble(" ", &[]), None);
    }

    #[test]
    fn system_turns_are_not_sent_as_chat_messages() {
        let system = AgentMessage::new(Role::System, "rules");
        assert!(RigAgentRunner::to_rig_message(&system).is_none());
        assert!(RigAgentRunner::to_rig_message(&AgentMessage::user("hi")).is_some());
    }
}
