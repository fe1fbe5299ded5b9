use std::sync::Arc;

mod agent;
mod rig_adapter;
mod scripted;
mod token_count;

pub use agent::{
    AgentDescriptor, AgentError, AgentEvent, AgentEventStream, AgentFragment, AgentInput,
    AgentMessage, AgentRequest, AgentResult, AgentRunner, AgentStreamHandle, AgentWorker,
    BoxFuture, ProviderConfig, Role, TokenUsage,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigAgentRunner};
pub use scripted::{SCRIPTED_PROVIDER_ID, ScriptedAgentRunner, ScriptedReply, ScriptedTokenCounter};
pub use token_count::{
    ANTHROPIC_PROVIDER_ID, AnthropicTokenCounter, DEFAULT_COUNT_TOKENS_BASE_URL,
    TokenCountRequest, TokenCounter,
};

pub fn create_agent_runner(mut config: ProviderConfig) -> AgentResult<Arc<dyn AgentRunner>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigAgentRunner::new(config)?))
        }
        _ => Err(AgentError::UnsupportedProvider {
            stage: "create-agent-runner",
            provider_id: config.provider_id,
        }),
    }
}
