use loom_storage::TaskKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MARKUP_FENCES: [&str; 2] = ["```html", "```"];

/// One event on the caller-facing stream. Each run ends with exactly one
/// `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PipelineEvent {
    Message(String),
    JsonChunk(Value),
    Warning(String),
    Error(ErrorPayload),
    Complete(CompletePayload),
}

impl PipelineEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Complete(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePayload {
    pub task: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub billing: BillingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BillingStatus {
    Billed { tokens: u64, credits: u64 },
    Skipped { reason: String },
    NotBillable,
}

/// Sending half of the caller stream. A closed receiver counts as a caller
/// disconnect and cancels the run.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PipelineEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<PipelineEvent>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    pub fn channel(cancel: CancellationToken) -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, cancel), rx)
    }

    /// Resolves once the caller has dropped the receiving half.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    pub fn emit(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() && !self.cancel.is_cancelled() {
            tracing::info!("event receiver dropped, cancelling run");
            self.cancel.cancel();
        }
    }

    /// Forwards chat-visible text with markup fences removed; blank text is
    /// not forwarded.
    pub fn message(&self, fragment: &str) {
        let text = strip_markup_fences(fragment);
        if !text.trim().is_empty() {
            self.emit(PipelineEvent::Message(text));
        }
    }

    pub fn json_chunk(&self, value: Value) {
        self.emit(PipelineEvent::JsonChunk(value));
    }

    pub fn warning(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::warn!(warning = %text, "pipeline warning");
        self.emit(PipelineEvent::Warning(text));
    }
}

pub fn strip_markup_fences(text: &str) -> String {
    MARKUP_FENCES
        .iter()
        .fold(text.to_string(), |acc, fence| acc.replace(fence, ""))
}
