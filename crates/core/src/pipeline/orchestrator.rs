//! Turn entry point: access check, routing, the task pipeline, then the shared
//! persist and bill stages.
//!
//! Turns on one conversation are serialized by [`ConversationLocks`]; turns on
//! different conversations run independently. Nothing is written until the
//! pipeline has produced its outcome, so failed or cancelled runs leave the
//! conversation untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use loom_llm::{AgentMessage, AgentRequest, AgentRunner};
use loom_storage::{
    ConversationId, ConversationRecord, DEFAULT_PROJECT_NAME, MessageRecord, NewConversation,
    NewMessage, ProjectSnapshot, Storage, TaskKind, TurnCommit, UserId,
};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::{Mutex as TurnLock, OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{BillingStatus, CompletePayload, ErrorPayload, EventSink, PipelineEvent};
use super::state::RunStage;
use super::{
    PipelineContext, PipelineOutcome, conversation, error_resolution, generation, modification,
    string_field,
};
use crate::aggregate::aggregate;
use crate::agents::{AgentCatalog, AgentRole};
use crate::credits::{BillableTurn, CreditLedger};
use crate::error::{
    AccessRefusedSnafu, CancelledSnafu, ConversationMissingSnafu, PipelineResult,
    PreconditionMissingSnafu, StorageSnafu,
};
use crate::extract::{clean_markers, extract_object};
use crate::history::{HistoryEngine, HistoryStatus};
use crate::router;
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub input: String,
}

impl TurnRequest {
    pub fn new(conversation_id: ConversationId, user_id: UserId, input: impl Into<String>) -> Self {
        Self {
            conversation_id,
            user_id,
            input: input.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub task: TaskKind,
    pub message: MessageRecord,
    pub snapshot: Option<ProjectSnapshot>,
    /// Set on the first turn of a conversation.
    pub project_name: Option<String>,
    pub billing: BillingStatus,
}

/// Caller side of a running turn. Dropping `events` cancels the run.
pub struct TurnHandle {
    pub events: mpsc::UnboundedReceiver<PipelineEvent>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<PipelineResult<TurnOutcome>>,
}

impl TurnHandle {
    /// Receives events up to and including the terminal one.
    pub async fn collect_events(&mut self) -> Vec<PipelineEvent> {
        let mut collected = Vec::new();
        while let Some(event) = self.events.recv().await {
            let terminal = event.is_terminal();
            collected.push(event);
            if terminal {
                break;
            }
        }
        collected
    }
}

/// One async lock per conversation, created on first use and dropped again
/// once nobody holds or waits on it.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<ConversationId, Arc<TurnLock<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, conversation_id: ConversationId) -> ConversationGuard<'_> {
        let lock = Arc::clone(lock_map(&self.locks).entry(conversation_id).or_default());
        ConversationGuard {
            locks: self,
            conversation_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        lock_map(&self.locks).len()
    }
}

pub struct ConversationGuard<'a> {
    locks: &'a ConversationLocks,
    conversation_id: ConversationId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConversationGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_map(&self.locks.locks);
        let idle = locks
            .get(&self.conversation_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.conversation_id);
        }
    }
}

fn lock_map<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Orchestrator {
    runner: Arc<dyn AgentRunner>,
    store: Arc<dyn Storage>,
    history: HistoryEngine,
    ledger: CreditLedger,
    agents: AgentCatalog,
    locks: ConversationLocks,
}

impl Orchestrator {
    pub fn new(
        runner: Arc<dyn AgentRunner>,
        store: Arc<dyn Storage>,
        ledger: CreditLedger,
        agents: AgentCatalog,
        history_limit: usize,
    ) -> Self {
        Self {
            runner,
            history: HistoryEngine::new(Arc::clone(&store), history_limit),
            store,
            ledger,
            agents,
            locks: ConversationLocks::new(),
        }
    }

    pub fn from_settings(
        settings: &Settings,
        runner: Arc<dyn AgentRunner>,
        store: Arc<dyn Storage>,
    ) -> Self {
        let ledger = CreditLedger::new(
            Arc::clone(&store),
            settings.token_counter(),
            settings.low_credit_notifier(),
            settings.billing_policy(),
        );
        Self::new(
            runner,
            store,
            ledger,
            settings.agent_catalog(),
            settings.history_limit,
        )
    }

    pub fn history(&self) -> &HistoryEngine {
        &self.history
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub async fn create_conversation(
        &self,
        user_id: UserId,
        name: Option<String>,
    ) -> PipelineResult<ConversationRecord> {
        let record = self
            .store
            .create_conversation(NewConversation { user_id, name })
            .await
            .context(StorageSnafu {
                stage: "orchestrator-create-conversation",
            })?;
        tracing::info!(conversation_id = %record.id, user_id = %user_id, "conversation created");
        Ok(record)
    }

    pub async fn list_conversations(
        &self,
        user_id: UserId,
    ) -> PipelineResult<Vec<ConversationRecord>> {
        self.store
            .list_conversations(user_id)
            .await
            .context(StorageSnafu {
                stage: "orchestrator-list-conversations",
            })
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> PipelineResult<ConversationRecord> {
        self.store
            .get_conversation(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "orchestrator-get-conversation",
            })?
            .context(ConversationMissingSnafu {
                stage: "orchestrator-get-conversation",
                conversation_id: conversation_id.to_string(),
            })
    }

    pub async fn messages(
        &self,
        conversation_id: ConversationId,
    ) -> PipelineResult<Vec<MessageRecord>> {
        self.store
            .list_messages(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "orchestrator-list-messages",
            })
    }

    pub async fn current_snapshot(
        &self,
        conversation_id: ConversationId,
    ) -> PipelineResult<ProjectSnapshot> {
        self.history.current(conversation_id).await
    }

    pub async fn history_status(
        &self,
        conversation_id: ConversationId,
    ) -> PipelineResult<HistoryStatus> {
        self.history.status(conversation_id).await
    }

    /// Waits for any in-flight turn on the conversation before moving back.
    pub async fn undo(&self, conversation_id: ConversationId) -> PipelineResult<ProjectSnapshot> {
        let _turn = self.locks.acquire(conversation_id).await;
        self.history.undo(conversation_id).await
    }

    pub async fn redo(&self, conversation_id: ConversationId) -> PipelineResult<ProjectSnapshot> {
        let _turn = self.locks.acquire(conversation_id).await;
        self.history.redo(conversation_id).await
    }

    /// Spawns the turn and hands back its event stream. The worker always
    /// emits exactly one `complete` or `error` event.
    pub fn start_turn(self: &Arc<Self>, request: TurnRequest) -> TurnHandle {
        let cancel = CancellationToken::new();
        let (events, receiver) = EventSink::channel(cancel.clone());
        let orchestrator = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let watch = events.clone();
            let run = orchestrator.handle_turn(request, events, token.clone());
            tokio::pin!(run);
            tokio::select! {
                biased;
                result = &mut run => result,
                _ = watch.closed() => {
                    tracing::info!("caller disconnected, cancelling turn");
                    token.cancel();
                    run.await
                }
            }
        });
        TurnHandle {
            events: receiver,
            cancel,
            join,
        }
    }

    /// Runs one turn to its terminal event on the caller's task.
    pub async fn handle_turn(
        &self,
        request: TurnRequest,
        events: EventSink,
        cancel: CancellationToken,
    ) -> PipelineResult<TurnOutcome> {
        let conversation_id = request.conversation_id;
        let _turn = self.locks.acquire(conversation_id).await;

        let result = self.run_turn(request, &events, &cancel).await;
        match &result {
            Ok(outcome) => {
                tracing::info!(
                    conversation_id = %conversation_id,
                    task = %outcome.task,
                    billing = ?outcome.billing,
                    "turn completed"
                );
                events.emit(PipelineEvent::Complete(CompletePayload {
                    task: outcome.task,
                    project_name: outcome.project_name.clone(),
                    billing: outcome.billing.clone(),
                }));
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    stage = error.stage(),
                    error = %error,
                    "turn failed"
                );
                events.emit(PipelineEvent::Error(ErrorPayload {
                    stage: error.stage().to_string(),
                    message: error.to_string(),
                }));
            }
        }
        result
    }

    async fn run_turn(
        &self,
        request: TurnRequest,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> PipelineResult<TurnOutcome> {
        let TurnRequest {
            conversation_id,
            user_id,
            input,
        } = request;
        let input = input.trim().to_string();
        ensure!(
            !input.is_empty(),
            PreconditionMissingSnafu {
                stage: "turn-input",
                details: "the message is empty",
            }
        );

        self.ledger.check_access(user_id).await?;
        let conversation = self.conversation(conversation_id).await?;
        ensure!(
            conversation.user_id == user_id,
            AccessRefusedSnafu {
                stage: "turn-ownership",
                user_id,
                reason: "conversation belongs to another user",
            }
        );

        let history = replay_history(&self.messages(conversation_id).await?);
        let user_messages = self
            .store
            .count_user_messages(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "turn-count-messages",
            })?;
        let project_name = if user_messages == 0 {
            Some(self.suggest_name(&input, cancel).await?)
        } else {
            None
        };

        let classification = router::classify(
            self.runner.as_ref(),
            self.agents.descriptor(AgentRole::Router),
            &history,
            &input,
            cancel,
        )
        .await?;
        let snapshot = conversation.history.current;
        let task = router::dispatch(classification.task, !snapshot.is_empty());
        tracing::info!(
            conversation_id = %conversation_id,
            classified = %classification.task,
            method = ?classification.method,
            task = %task,
            "turn routed"
        );

        let mut ctx = PipelineContext::new(
            self.runner.as_ref(),
            &self.agents,
            conversation_id,
            task,
            input,
            snapshot,
            history,
            events.clone(),
            cancel.clone(),
        );
        match self.drive(&mut ctx, user_id, project_name).await {
            Ok(outcome) => {
                ctx.complete()?;
                Ok(outcome)
            }
            Err(error) => {
                ctx.fail();
                Err(error)
            }
        }
    }

    async fn drive(
        &self,
        ctx: &mut PipelineContext<'_>,
        user_id: UserId,
        project_name: Option<String>,
    ) -> PipelineResult<TurnOutcome> {
        let outcome = match ctx.task() {
            TaskKind::Generation => generation::run(ctx).await?,
            TaskKind::Modification => modification::run(ctx).await?,
            TaskKind::ErrorResolution => error_resolution::run(ctx).await?,
            TaskKind::Conversation => conversation::run(ctx).await?,
        };
        ensure!(
            !ctx.cancel.is_cancelled(),
            CancelledSnafu {
                stage: "turn-before-persist",
            }
        );

        ctx.enter(RunStage::Persist)?;
        let message = self.persist(ctx, &outcome, project_name.as_deref()).await?;

        let billing = match outcome.billable {
            Some(turn) => {
                ctx.enter(RunStage::Bill)?;
                self.bill(ctx.conversation_id, user_id, turn).await
            }
            None => BillingStatus::NotBillable,
        };

        Ok(TurnOutcome {
            task: ctx.task(),
            message,
            snapshot: outcome.snapshot,
            project_name,
            billing,
        })
    }

    /// History append, message and first-turn name go through one store commit.
    async fn persist(
        &self,
        ctx: &PipelineContext<'_>,
        outcome: &PipelineOutcome,
        project_name: Option<&str>,
    ) -> PipelineResult<MessageRecord> {
        let conversation_id = ctx.conversation_id;
        let commit = TurnCommit {
            message: NewMessage {
                user_text: ctx.user_input.clone(),
                assistant_text: outcome.assistant_text.clone(),
                snapshot: outcome.snapshot.clone(),
                task: ctx.task(),
            },
            history: outcome
                .snapshot
                .clone()
                .map(|snapshot| self.history.append_edit(snapshot)),
            rename: project_name.map(str::to_string),
        };
        let committed = self
            .store
            .commit_turn(conversation_id, commit)
            .await
            .context(StorageSnafu {
                stage: "turn-persist",
            })?;
        tracing::debug!(
            conversation_id = %conversation_id,
            seq = committed.message.seq,
            position = ?committed.history.position,
            total = committed.history.snapshots.len(),
            "turn persisted"
        );
        Ok(committed.message)
    }

    async fn bill(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        turn: BillableTurn,
    ) -> BillingStatus {
        match self.ledger.bill(user_id, turn).await {
            Ok(receipt) => {
                tracing::info!(
                    conversation_id = %conversation_id,
                    user_id = %user_id,
                    tokens = receipt.tokens,
                    credits = receipt.credits,
                    "turn billed"
                );
                BillingStatus::Billed {
                    tokens: receipt.tokens,
                    credits: receipt.credits,
                }
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    user_id = %user_id,
                    error = %error,
                    "billing skipped"
                );
                BillingStatus::Skipped {
                    reason: error.to_string(),
                }
            }
        }
    }

    async fn suggest_name(
        &self,
        input: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let request = AgentRequest::new(self.agents.descriptor(AgentRole::Namer), input);
        match aggregate(self.runner.as_ref(), request, cancel, |_| {}).await {
            Ok(aggregated) => Ok(parse_project_name(&aggregated.text)),
            Err(error) if error.is_cancelled() => Err(error),
            Err(error) => {
                tracing::warn!(error = %error, "naming agent failed, using the default name");
                Ok(DEFAULT_PROJECT_NAME.to_string())
            }
        }
    }
}

/// Project name from a naming reply: the `project_name` field of a JSON
/// object, else the cleaned reply text, else the default name.
pub fn parse_project_name(reply: &str) -> String {
    let cleaned = clean_markers(reply);
    let name = match extract_object(&cleaned) {
        Ok(extracted) => string_field(&extracted.value, "project_name"),
        Err(_) => Some(cleaned.trim_matches('"').trim().to_string())
            .filter(|name| !name.is_empty()),
    };
    name.unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string())
}

/// Stored turns as alternating user/assistant messages in sequence order.
pub fn replay_history(messages: &[MessageRecord]) -> Vec<AgentMessage> {
    let mut ordered = messages.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|message| message.seq);

    let mut turns = Vec::with_capacity(ordered.len() * 2);
    for message in ordered {
        if !message.user_text.trim().is_empty() {
            turns.push(AgentMessage::user(message.user_text.clone()));
        }
        if !message.assistant_text.trim().is_empty() {
            turns.push(AgentMessage::assistant(message.assistant_text.clone()));
        }
    }
    turns
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, user: &str, assistant: &str) -> MessageRecord {
        MessageRecord {
            id: loom_storage::MessageId::new_v7(),
            conversation_id: ConversationId::new_v7(),
            seq,
            user_text: user.to_string(),
            assistant_text: assistant.to_string(),
            snapshot: None,
            task: TaskKind::Conversation,
            created_at_unix_seconds: seq,
        }
    }

    #[test]
    fn project_name_comes_from_object_or_text() {
        assert_eq!(
            parse_project_name("```json\n{\"project_name\": \"Todo Board\"}\n```"),
            "Todo Board"
        );
        assert_eq!(parse_project_name("json Weather App"), "Weather App");
        assert_eq!(parse_project_name("  \"Recipe Box\" "), "Recipe Box");
        assert_eq!(parse_project_name("```"), DEFAULT_PROJECT_NAME);
        assert_eq!(parse_project_name("{\"title\": \"x\"}"), DEFAULT_PROJECT_NAME);
    }

    #[test]
    fn history_replays_in_sequence_and_skips_empty_text() {
        let messages = vec![record(2, "second", ""), record(1, "first", "reply")];
        assert_eq!(
            replay_history(&messages),
            vec![
                AgentMessage::user("first"),
                AgentMessage::assistant("reply"),
                AgentMessage::user("second"),
            ]
        );
    }

    #[tokio::test]
    async fn conversation_locks_serialize_one_conversation() {
        let locks = ConversationLocks::new();
        let first = ConversationId::new_v7();
        let second = ConversationId::new_v7();

        let held = locks.acquire(first).await;
        let other = locks.acquire(second).await;
        drop(other);

        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            locks.acquire(first),
        )
        .await;
        assert!(waiting.is_err());

        drop(held);
        let reacquired = locks.acquire(first).await;
        assert_eq!(locks.tracked(), 1);
        drop(reacquired);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn lock_entry_survives_while_a_waiter_is_queued() {
        let locks = Arc::new(ConversationLocks::new());
        let conversation_id = ConversationId::new_v7();

        let held = locks.acquire(conversation_id).await;
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire(conversation_id).await;
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        drop(held);
        assert_eq!(locks.tracked(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.tracked(), 0);
    }
}
