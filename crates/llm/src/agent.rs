use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub base_url: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            base_url: base_url.into().trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: Role,
    pub content: String,
}

impl AgentMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Static description of one agent: which model runs it and with which instructions.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentDescriptor {
    pub name: String,
    pub model_id: String,
    pub instructions: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_id: model_id.into(),
            instructions: String::new(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// What an agent is run with: a single text prompt or an ordered list of turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentInput {
    Text(String),
    Conversation(Vec<AgentMessage>),
}

impl AgentInput {
    pub fn into_messages(self) -> Vec<AgentMessage> {
        match self {
            Self::Text(text) => vec![AgentMessage::user(text)],
            Self::Conversation(messages) => messages,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Conversation(messages) => messages.is_empty(),
        }
    }
}

impl From<String> for AgentInput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for AgentInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<AgentMessage>> for AgentInput {
    fn from(value: Vec<AgentMessage>) -> Self {
        Self::Conversation(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub agent: AgentDescriptor,
    pub input: AgentInput,
}

impl AgentRequest {
    pub fn new(agent: AgentDescriptor, input: impl Into<AgentInput>) -> Self {
        Self {
            agent,
            input: input.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn accumulate(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// Canonical shape every provider item is normalized into before reaching the core.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentFragment {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl AgentFragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    pub fn usage(usage: TokenUsage) -> Self {
        Self {
            text: String::new(),
            usage: Some(usage),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Fragment(AgentFragment),
    Done,
    Error(String),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type AgentWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AgentError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("agent '{agent}' was invoked with an empty input"))]
    EmptyInput {
        stage: &'static str,
        agent: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("token count request failed on `{stage}`, {source}"))]
    TokenCountRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("token count endpoint returned status {status}: {body}"))]
    TokenCountStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("scripted agent '{agent}' has no reply queued"))]
    ScriptExhausted {
        stage: &'static str,
        agent: String,
    },
    #[snafu(display("scripted failure on `{stage}`: {message}"))]
    Scripted {
        stage: &'static str,
        message: String,
    },
}

pub struct AgentEventStream {
    agent: String,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct AgentStreamHandle {
    pub stream: AgentEventStream,
    pub worker: AgentWorker,
}

impl AgentEventStream {
    pub(crate) fn new(
        agent: String,
        events: mpsc::UnboundedReceiver<AgentEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            agent,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        self.events.try_recv().ok()
    }

    /// Signals the worker to stop pulling from the provider. Returns false when
    /// the worker already finished or the stream was cancelled before.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for AgentEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Runs an agent with an input and yields its output as a lazy fragment stream.
pub trait AgentRunner: Send + Sync {
    fn id(&self) -> &str;
    fn invoke(&self, request: AgentRequest) -> AgentResult<AgentStreamHandle>;
}

pub(crate) fn make_event_stream(
    agent: &str,
) -> (
    mpsc::UnboundedSender<AgentEvent>,
    AgentEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        AgentEventStream::new(agent.to_string(), event_rx, cancel_tx),
        cancel_rx,
    )
}
