//! Deterministic stand-ins for the agent runner and token counter.
//!
//! Replies are queued per agent name and replayed in order, which keeps pipeline
//! runs reproducible in tests and in the QA runner.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};

use super::agent::{
    AgentEvent, AgentFragment, AgentRequest, AgentResult, AgentRunner, AgentStreamHandle,
    AgentWorker, BoxFuture, ScriptExhaustedSnafu, ScriptedSnafu, TokenUsage, make_event_stream,
};
use super::token_count::{TokenCountRequest, TokenCounter};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScriptEnding {
    Done,
    Fail(String),
    Stall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedReply {
    fragments: Vec<String>,
    usage: Option<TokenUsage>,
    ending: ScriptEnding,
    refuse_invoke: bool,
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::fragments([text.into()])
    }

    pub fn fragments<I, T>(fragments: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            usage: None,
            ending: ScriptEnding::Done,
            refuse_invoke: false,
        }
    }

    /// Invocation itself fails before any stream is opened.
    pub fn refused() -> Self {
        Self {
            refuse_invoke: true,
            ..Self::fragments(Vec::<String>::new())
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Emits the fragments, then an error event instead of `Done`.
    pub fn failing_after(mut self, message: impl Into<String>) -> Self {
        self.ending = ScriptEnding::Fail(message.into());
        self
    }

    /// Emits the fragments, then waits until the stream is cancelled.
    pub fn stalling(mut self) -> Self {
        self.ending = ScriptEnding::Stall;
        self
    }
}

#[derive(Default)]
pub struct ScriptedAgentRunner {
    replies: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, agent: impl Into<String>, reply: ScriptedReply) -> &Self {
        lock(&self.replies)
            .entry(agent.into())
            .or_default()
            .push_back(reply);
        self
    }

    /// Every request received so far, in invocation order.
    pub fn requests(&self) -> Vec<AgentRequest> {
        lock(&self.requests).clone()
    }

    pub fn requests_for(&self, agent: &str) -> Vec<AgentRequest> {
        lock(&self.requests)
            .iter()
            .filter(|request| request.agent.name == agent)
            .cloned()
            .collect()
    }

    pub fn pending_replies(&self) -> usize {
        lock(&self.replies).values().map(VecDeque::len).sum()
    }

    async fn run_script(
        reply: ScriptedReply,
        event_tx: mpsc::UnboundedSender<AgentEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for fragment in reply.fragments {
            if cancel_rx.try_recv().is_ok() {
                return;
            }
            if event_tx
                .send(AgentEvent::Fragment(AgentFragment::text(fragment)))
                .is_err()
            {
                return;
            }
            tokio::task::yield_now().await;
        }

        match reply.ending {
            ScriptEnding::Done => {
                if let Some(usage) = reply.usage {
                    let _ = event_tx.send(AgentEvent::Fragment(AgentFragment::usage(usage)));
                }
                let _ = event_tx.send(AgentEvent::Done);
            }
            ScriptEnding::Fail(message) => {
                let _ = event_tx.send(AgentEvent::Error(message));
            }
            ScriptEnding::Stall => {
                let _ = cancel_rx.await;
            }
        }
    }
}

impl AgentRunner for ScriptedAgentRunner {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn invoke(&self, request: AgentRequest) -> AgentResult<AgentStreamHandle> {
        let agent = request.agent.name.clone();
        lock(&self.requests).push(request);

        let reply = lock(&self.replies)
            .get_mut(&agent)
            .and_then(VecDeque::pop_front);
        let Some(reply) = reply else {
            return ScriptExhaustedSnafu {
                stage: "scripted-invoke",
                agent,
            }
            .fail();
        };
        if reply.refuse_invoke {
            return ScriptedSnafu {
                stage: "scripted-invoke",
                message: format!("agent '{agent}' refused the request"),
            }
            .fail();
        }

        let (event_tx, stream, cancel_rx) = make_event_stream(&agent);
        let worker: AgentWorker = Box::pin(Self::run_script(reply, event_tx, cancel_rx));
        Ok(AgentStreamHandle { stream, worker })
    }
}

/// Token counter returning a fixed count, or failing on every call.
pub struct ScriptedTokenCounter {
    tokens: Option<u64>,
    requests: Mutex<Vec<TokenCountRequest>>,
}

impl ScriptedTokenCounter {
    pub fn fixed(tokens: u64) -> Self {
        Self {
            tokens: Some(tokens),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            tokens: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<TokenCountRequest> {
        lock(&self.requests).clone()
    }
}

impl TokenCounter for ScriptedTokenCounter {
    fn count<'a>(&'a self, request: TokenCountRequest) -> BoxFuture<'a, AgentResult<u64>> {
        Box::pin(async move {
            lock(&self.requests).push(request);
            match self.tokens {
                Some(tokens) => Ok(tokens),
                None => ScriptedSnafu {
                    stage: "scripted-count",
                    message: "token counting is unavailable".to_string(),
                }
                .fail(),
            }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
