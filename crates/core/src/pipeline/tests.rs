use std::sync::Arc;

use loom_llm::{
    AgentInput, AgentMessage, ScriptedAgentRunner, ScriptedReply, ScriptedTokenCounter,
    create_agent_runner,
};
use loom_storage::{
    BoxFuture, CommittedTurn, ConversationId, ConversationRecord, ConversationStore, CreditAccount,
    CreditEdit, CreditEditOutcome, CreditStore, DEFAULT_PROJECT_NAME, HistoryEdit, HistoryState,
    MemoryStorage, MessageRecord, MessageStore, NewConversation, NewMessage, ProjectSnapshot,
    StorageError, StorageResult, SubscriptionStatus, TaskKind, TurnCommit, UserId,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::agents::{AgentCatalog, AgentRole};
use crate::credits::{BillingPolicy, CreditLedger, LoggingNotifier, Rounding};
use crate::error::PipelineError;
use crate::settings::Settings;

const USER: UserId = UserId(7);

struct Harness {
    runner: Arc<ScriptedAgentRunner>,
    store: Arc<MemoryStorage>,
    counter: Arc<ScriptedTokenCounter>,
    orchestrator: Arc<Orchestrator>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_counter(ScriptedTokenCounter::fixed(700)).await
    }

    async fn with_counter(counter: ScriptedTokenCounter) -> Self {
        let runner = Arc::new(ScriptedAgentRunner::new());
        let store = Arc::new(MemoryStorage::new());
        let counter = Arc::new(counter);
        store
            .put_credit_account(account(USER, SubscriptionStatus::Active))
            .await
            .unwrap();
        let ledger = CreditLedger::new(
            store.clone(),
            counter.clone(),
            Arc::new(LoggingNotifier),
            BillingPolicy::default(),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            runner.clone(),
            store.clone(),
            ledger,
            AgentCatalog::default(),
            20,
        ));
        Self {
            runner,
            store,
            counter,
            orchestrator,
        }
    }

    fn script(&self, role: AgentRole, reply: ScriptedReply) -> &Self {
        self.runner.push(role.as_str(), reply);
        self
    }

    fn reply(&self, role: AgentRole, text: &str) -> &Self {
        self.script(role, ScriptedReply::text(text))
    }

    async fn conversation(&self) -> ConversationId {
        self.orchestrator
            .create_conversation(USER, None)
            .await
            .unwrap()
            .id
    }

    /// A conversation that already has one turn and the given project.
    async fn conversation_with(&self, snapshot: ProjectSnapshot) -> ConversationId {
        let conversation_id = self.conversation().await;
        self.orchestrator
            .history()
            .append(conversation_id, snapshot.clone())
            .await
            .unwrap();
        self.store
            .add_message(
                conversation_id,
                NewMessage {
                    user_text: "build it".to_string(),
                    assistant_text: "built".to_string(),
                    snapshot: Some(snapshot),
                    task: TaskKind::Generation,
                },
            )
            .await
            .unwrap();
        conversation_id
    }

    async fn turn(
        &self,
        conversation_id: ConversationId,
        input: &str,
    ) -> (Vec<PipelineEvent>, Result<TurnOutcome, PipelineError>) {
        let mut handle = self
            .orchestrator
            .start_turn(TurnRequest::new(conversation_id, USER, input));
        let events = handle.collect_events().await;
        let result = handle.join.await.unwrap();
        (events, result)
    }

    async fn daily_credits(&self) -> Option<i64> {
        self.store
            .get_credit_account(USER)
            .await
            .unwrap()
            .and_then(|account| account.daily_tokens_available)
    }

    fn script_generation(&self) {
        self.reply(AgentRole::Planner, "1. list\n2. add button")
            .reply(AgentRole::Summarizer, "Building a todo board")
            .script(
                AgentRole::Generator,
                ScriptedReply::fragments([
                    "```json\n{\"project_name\": \"todo\", \"files\": {\"package.\": \"{}\", ",
                    "\"src/App.jsx\": \"app\"}}\n```",
                ]),
            );
    }
}

fn account(user_id: UserId, status: SubscriptionStatus) -> CreditAccount {
    CreditAccount {
        user_id,
        status,
        daily_tokens_available: Some(100),
        total_tokens_remaining: Some(1000),
    }
}

fn project() -> ProjectSnapshot {
    ProjectSnapshot::from_files([
        ("index.html", "<div id=\"root\"></div>"),
        ("src/App.jsx", "original app"),
        ("src/main.jsx", "import App from './App'"),
        ("vite.config.js", "export default {}"),
    ])
}

fn text_input(input: &AgentInput) -> &str {
    match input {
        AgentInput::Text(text) => text,
        AgentInput::Conversation(_) => panic!("expected a text input"),
    }
}

fn error_stage(events: &[PipelineEvent]) -> Option<&str> {
    match events.last() {
        Some(PipelineEvent::Error(payload)) => Some(payload.stage.as_str()),
        _ => None,
    }
}

#[tokio::test]
async fn generation_turn_streams_persists_names_and_bills() {
    let harness = Harness::new().await;
    let conversation_id = harness.conversation().await;
    harness
        .reply(AgentRole::Namer, "```json\n{\"project_name\": \"Todo Board\"}\n```")
        .reply(AgentRole::Router, "{\"task\": \"generation\"}");
    harness.script_generation();

    let (events, result) = harness.turn(conversation_id, "Build a todo app").await;
    let outcome = result.unwrap();

    assert_eq!(events[0], PipelineEvent::Message("Building a todo board".to_string()));
    assert!(matches!(events[1], PipelineEvent::JsonChunk(Value::String(_))));
    assert_eq!(
        events.last(),
        Some(&PipelineEvent::Complete(CompletePayload {
            task: TaskKind::Generation,
            project_name: Some("Todo Board".to_string()),
            billing: BillingStatus::Billed {
                tokens: 700,
                credits: 2,
            },
        }))
    );
    assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);

    let current = harness.orchestrator.current_snapshot(conversation_id).await.unwrap();
    assert_eq!(current.files.get("package.json").map(String::as_str), Some("{}"));
    assert!(!current.files.contains_key("package."));
    assert_eq!(outcome.snapshot, Some(current));

    let conversation = harness.orchestrator.conversation(conversation_id).await.unwrap();
    assert_eq!(conversation.name, "Todo Board");
    let messages = harness.orchestrator.messages(conversation_id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].task, TaskKind::Generation);
    assert_eq!(messages[0].assistant_text, "Building a todo board");

    assert_eq!(harness.daily_credits().await, Some(98));
    let counted = harness.counter.requests();
    assert_eq!(counted.len(), 1);
    assert_eq!(
        counted[0].system,
        AgentCatalog::default().instructions(AgentRole::Generator)
    );
    assert_eq!(harness.runner.pending_replies(), 0);
}

#[tokio::test]
async fn modification_turn_sends_only_named_files_and_warns_on_missing_ones() {
    let harness = Harness::new().await;
    let conversation_id = harness.conversation_with(project()).await;
    let modifier_raw = "{\"src/App.jsx\": \"app v2\", \"src/Header.jsx\": \"header\"}";
    harness
        .reply(AgentRole::Router, "{\"task\": \"modification\"}")
        .reply(AgentRole::ProgressSummarizer, "Adding a header")
        .reply(
            AgentRole::FileFinder,
            "{\"files_to_modify\": [\"src/App.jsx\", \"src/Missing.jsx\"], \"new_files_to_create\": [\"src/Header.jsx\"], \"summary\": \"add header\"}",
        )
        .reply(AgentRole::Modifier, modifier_raw);

    let (events, result) = harness.turn(conversation_id, "Add a header").await;
    let outcome = result.unwrap();

    assert_eq!(events[0], PipelineEvent::Message("Adding a header".to_string()));
    assert_eq!(
        events[1],
        PipelineEvent::Warning("File not found in project: src/Missing.jsx".to_string())
    );
    assert!(matches!(events[2], PipelineEvent::JsonChunk(Value::Object(_))));
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::Complete(CompletePayload {
            task: TaskKind::Modification,
            project_name: None,
            ..
        }))
    ));

    let modifier_requests = harness.runner.requests_for(AgentRole::Modifier.as_str());
    let sent: Value = serde_json::from_str(text_input(&modifier_requests[0].input)).unwrap();
    let sent_files = sent["files"].as_object().unwrap();
    assert_eq!(sent_files.len(), 2);
    assert_eq!(sent_files["src/App.jsx"], "original app");
    assert_eq!(sent_files["src/Header.jsx"], "");
    assert_eq!(sent["summary"], "add header");

    let current = outcome.snapshot.unwrap();
    assert_eq!(current.files["src/App.jsx"], "app v2");
    assert_eq!(current.files["src/Header.jsx"], "header");
    assert_eq!(current.files["index.html"], "<div id=\"root\"></div>");

    let counted = harness.counter.requests();
    assert_eq!(counted[0].messages[1], AgentMessage::assistant(modifier_raw));
    assert!(harness.runner.requests_for(AgentRole::Namer.as_str()).is_empty());

    let status = harness.orchestrator.history_status(conversation_id).await.unwrap();
    assert_eq!(status.total, 2);
    assert_eq!(status.position, Some(1));
}

#[tokio::test]
async fn error_resolution_turn_uses_structure_view_and_skips_unknown_fixes() {
    let harness = Harness::new().await;
    let conversation_id = harness.conversation_with(project()).await;
    harness
        .reply(AgentRole::Router, "{\"task\": \"error_resolution\"}")
        .reply(AgentRole::ProgressSummarizer, "Fixing the import")
        .reply(
            AgentRole::ErrorFinder,
            "```json\n{\"primary_error_file\": \"src/main.jsx\", \"affected_files\": [\"src/App.jsx\"], \"dependency_chain\": {\"config_files\": [\"vite.config.js\", \"tsconfig.json\"]}, \"error_type\": \"import\"}\n```",
        )
        .reply(
            AgentRole::ErrorResolver,
            "{\"src/App.jsx\": \"fixed app\", \"src/Ghost.jsx\": \"boo\"}",
        );

    let (events, result) = harness.turn(conversation_id, "App.jsx fails to import").await;
    let outcome = result.unwrap();

    let warnings = events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::Warning(text) => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        warnings,
        vec![
            "File not found: tsconfig.json",
            "File path not in project: src/Ghost.jsx"
        ]
    );

    let finder_requests = harness.runner.requests_for(AgentRole::ErrorFinder.as_str());
    assert!(!text_input(&finder_requests[0].input).contains("original app"));

    let resolver_requests = harness.runner.requests_for(AgentRole::ErrorResolver.as_str());
    let sent: Value = serde_json::from_str(text_input(&resolver_requests[0].input)).unwrap();
    let fetched = sent["affected_files"]
        .as_object()
        .unwrap()
        .keys()
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(fetched.len(), 3);
    assert_eq!(sent["error_type"], "import");

    let current = outcome.snapshot.unwrap();
    assert_eq!(current.files["src/App.jsx"], "fixed app");
    assert!(!current.files.contains_key("src/Ghost.jsx"));
    assert_eq!(outcome.task, TaskKind::ErrorResolution);
}

#[tokio::test]
async fn conversation_turn_strips_fences_and_is_not_billed() {
    let harness = Harness::new().await;
    let conversation_id = harness.conversation().await;
    harness
        .reply(AgentRole::Namer, "Chat Helper")
        .reply(AgentRole::Router, "{\"task\": \"conversation\"}")
        .script(
            AgentRole::Conversation,
            ScriptedReply::fragments(["```html", "Hello ", "there```"]),
        );

    let (events, result) = harness.turn(conversation_id, "hi").await;
    let outcome = result.unwrap();

    assert_eq!(
        events,
        vec![
            PipelineEvent::Message("Hello ".to_string()),
            PipelineEvent::Message("there".to_string()),
            PipelineEvent::Complete(CompletePayload {
                task: TaskKind::Conversation,
                project_name: Some("Chat Helper".to_string()),
                billing: BillingStatus::NotBillable,
            }),
        ]
    );
    assert_eq!(outcome.message.assistant_text, "Hello there");
    assert!(outcome.message.snapshot.is_none());
    assert_eq!(harness.daily_credits().await, Some(100));
    assert!(harness.counter.requests().is_empty());

    let status = harness.orchestrator.history_status(conversation_id).await.unwrap();
    assert_eq!(status.total, 0);
}

#[tokio::test]
async fn refused_turns_end_with_a_single_error_event() {
    let harness = Harness::new().await;
    let conversation_id = harness.conversation().await;

    let (events, result) = harness.turn(conversation_id, "   ").await;
    assert_eq!(events.len(), 1);
    assert_eq!(error_stage(&events), Some("turn-input"));
    assert!(matches!(result, Err(PipelineError::PreconditionMissing { .. })));

    harness
        .store
        .put_credit_account(account(USER, SubscriptionStatus::parse("canceled")))
        .await
        .unwrap();
    let (events, result) = harness.turn(conversation_id, "Build a todo app").await;
    assert_eq!(events.len(), 1);
    assert_eq!(error_stage(&events), Some("ledger-check-access"));
    assert!(matches!(result, Err(PipelineError::AccessRefused { .. })));
    assert!(harness.runner.requests().is_empty());
}

#[tokio::test]
async fn conversations_of_other_users_are_refused() {
    let harness = Harness::new().await;
    let stranger = UserId(8);
    harness
        .store
        .put_credit_account(account(stranger, SubscriptionStatus::Trialing))
        .await
        .unwrap();
    let conversation_id = harness.conversation().await;

    let mut handle = harness
        .orchestrator
        .start_turn(TurnRequest::new(conversation_id, stranger, "hello"));
    let events = handle.collect_events().await;
    assert_eq!(error_stage(&events), Some("turn-ownership"));
    assert!(handle.join.await.unwrap().is_err());
}

#[tokio::test]
async fn extraction_failure_persists_nothing() {
    let harness = Harness::new().await;
    let conversation_id = harness.conversation().await;
    harness
        .reply(AgentRole::Namer, "Todo Board")
        .reply(AgentRole::Router, "{\"task\": \"generation\"}")
        .reply(AgentRole::Planner, "plan")
        .reply(AgentRole::Summarizer, "Working on it")
        .reply(AgentRole::Generator, "I cannot produce that project");

    let (events, result) = harness.turn(conversation_id, "Build a todo app").await;

    assert_eq!(error_stage(&events), Some("generation-extract"));
    assert!(matches!(result, Err(PipelineError::Extraction { .. })));
    assert!(harness.orchestrator.messages(conversation_id).await.unwrap().is_empty());
    let conversation = harness.orchestrator.conversation(conversation_id).await.unwrap();
    assert_eq!(conversation.name, DEFAULT_PROJECT_NAME);
    assert!(conversation.history.snapshots.is_empty());
    assert_eq!(harness.daily_credits().await, Some(100));
}

#[tokio::test]
async fn cancelled_turn_stops_the_stream_and_persists_nothing() {
    let harness = Harness::new().await;
    let conversation_id = harness.conversation().await;
    harness
        .reply(AgentRole::Namer, "Todo Board")
        .reply(AgentRole::Router, "{\"task\": \"generation\"}")
        .reply(AgentRole::Planner, "plan")
        .script(
            AgentRole::Summarizer,
            ScriptedReply::fragments(["Working"]).stalling(),
        );

    let mut handle = harness
        .orchestrator
        .start_turn(TurnRequest::new(conversation_id, USER, "Build a todo app"));
    assert_eq!(
        handle.events.recv().await,
        Some(PipelineEvent::Message("Working".to_string()))
    );
    handle.cancel.cancel();

    let rest = handle.collect_events().await;
    assert!(matches!(rest.last(), Some(PipelineEvent::Error(_))));
    let error = handle.join.await.unwrap().unwrap_err();
    assert!(error.is_cancelled());

    assert!(harness.runner.requests_for(AgentRole::Generator.as_str()).is_empty());
    assert!(harness.orchestrator.messages(conversation_id).await.unwrap().is_empty());
    let conversation = harness.orchestrator.conversation(conversation_id).await.unwrap();
    assert_eq!(conversation.name, DEFAULT_PROJECT_NAME);
    assert_eq!(harness.daily_credits().await, Some(100));
}

#[tokio::test]
async fn dropping_the_event_receiver_cancels_the_turn() {
    let harness = Harness::new().await;
    let conversation_id = harness.conversation_with(project()).await;
    harness
        .reply(AgentRole::Router, "{\"task\": \"modification\"}")
        .script(
            AgentRole::ProgressSummarizer,
            ScriptedReply::fragments(["Looking"]).stalling(),
        );

    let TurnHandle {
        mut events, join, ..
    } = harness
        .orchestrator
        .start_turn(TurnRequest::new(conversation_id, USER, "Add a footer"));
    assert_eq!(
        events.recv().await,
        Some(PipelineEvent::Message("Looking".to_string()))
    );
    drop(events);

    let error = join.await.unwrap().unwrap_err();
    assert!(error.is_cancelled());
    assert_eq!(
        harness.orchestrator.messages(conversation_id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn billing_failure_still_completes_the_turn() {
    let harness = Harness::with_counter(ScriptedTokenCounter::failing()).await;
    let conversation_id = harness.conversation().await;
    // No router reply is queued: an unavailable classifier routes to generation.
    harness.reply(AgentRole::Namer, "Todo Board");
    harness.script_generation();

    let (events, result) = harness.turn(conversation_id, "Build a todo app").await;
    let outcome = result.unwrap();

    assert_eq!(outcome.task, TaskKind::Generation);
    assert!(matches!(outcome.billing, BillingStatus::Skipped { .. }));
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::Complete(CompletePayload {
            billing: BillingStatus::Skipped { .. },
            ..
        }))
    ));
    assert_eq!(harness.orchestrator.messages(conversation_id).await.unwrap().len(), 1);
    assert_eq!(harness.daily_credits().await, Some(100));
}

#[tokio::test]
async fn undo_and_redo_follow_successive_turns() {
    let harness = Harness::new().await;
    let conversation_id = harness.conversation().await;
    harness
        .reply(AgentRole::Namer, "Todo Board")
        .reply(AgentRole::Router, "{\"task\": \"generation\"}");
    harness.script_generation();
    let (_, first) = harness.turn(conversation_id, "Build a todo app").await;
    let generated = first.unwrap().snapshot.unwrap();

    harness
        .reply(AgentRole::Router, "{\"task\": \"generation\"}")
        .reply(AgentRole::ProgressSummarizer, "Renaming")
        .reply(AgentRole::FileFinder, "{\"files_to_modify\": [\"src/App.jsx\"]}")
        .reply(AgentRole::Modifier, "{\"src/App.jsx\": \"renamed app\"}");
    let (_, second) = harness.turn(conversation_id, "Rename the app").await;
    let second = second.unwrap();
    assert_eq!(second.task, TaskKind::Modification);
    let modified = second.snapshot.unwrap();

    let router_requests = harness.runner.requests_for(AgentRole::Router.as_str());
    assert_eq!(
        router_requests[1].input.clone().into_messages().len(),
        3,
        "second routing sees the replayed first turn"
    );
    assert_eq!(harness.runner.requests_for(AgentRole::Namer.as_str()).len(), 1);

    let undone = harness.orchestrator.undo(conversation_id).await.unwrap();
    assert_eq!(undone, generated);
    assert_eq!(harness.orchestrator.undo(conversation_id).await.unwrap(), generated);
    let redone = harness.orchestrator.redo(conversation_id).await.unwrap();
    assert_eq!(redone, modified);

    let status = harness.orchestrator.history_status(conversation_id).await.unwrap();
    assert!(status.can_undo);
    assert!(!status.can_redo);
}

#[tokio::test]
async fn pipelines_refuse_to_run_without_a_project() {
    let runner = ScriptedAgentRunner::new();
    let agents = AgentCatalog::default();
    let cancel = CancellationToken::new();
    let (events, _receiver) = EventSink::channel(cancel.clone());
    let mut ctx = PipelineContext::new(
        &runner,
        &agents,
        ConversationId::new_v7(),
        TaskKind::Modification,
        "change the title".to_string(),
        ProjectSnapshot::default(),
        Vec::new(),
        events,
        cancel,
    );

    let error = modification::run(&mut ctx).await.unwrap_err();
    assert!(matches!(error, PipelineError::PreconditionMissing { .. }));
    assert!(runner.requests().is_empty());
    assert_eq!(ctx.state(), RunState::Pending);
}

/// Memory store whose turn commit always fails, leaving every row untouched.
struct CommitRefusingStore(MemoryStorage);

impl ConversationStore for CommitRefusingStore {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        self.0.create_conversation(input)
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        self.0.get_conversation(conversation_id)
    }

    fn list_conversations(
        &self,
        user_id: UserId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        self.0.list_conversations(user_id)
    }

    fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        name: String,
    ) -> BoxFuture<'_, StorageResult<()>> {
        self.0.rename_conversation(conversation_id, name)
    }

    fn edit_history(
        &self,
        conversation_id: ConversationId,
        edit: HistoryEdit,
    ) -> BoxFuture<'_, StorageResult<HistoryState>> {
        self.0.edit_history(conversation_id, edit)
    }

    fn commit_turn(
        &self,
        _conversation_id: ConversationId,
        _commit: TurnCommit,
    ) -> BoxFuture<'_, StorageResult<CommittedTurn>> {
        Box::pin(async {
            Err(StorageError::InvariantViolation {
                stage: "message-add-insert",
                details: "message table unavailable".to_string(),
            })
        })
    }
}

impl MessageStore for CommitRefusingStore {
    fn add_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        self.0.add_message(conversation_id, input)
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        self.0.list_messages(conversation_id)
    }

    fn count_user_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        self.0.count_user_messages(conversation_id)
    }
}

impl CreditStore for CommitRefusingStore {
    fn get_credit_account(
        &self,
        user_id: UserId,
    ) -> BoxFuture<'_, StorageResult<Option<CreditAccount>>> {
        self.0.get_credit_account(user_id)
    }

    fn put_credit_account(&self, account: CreditAccount) -> BoxFuture<'_, StorageResult<()>> {
        self.0.put_credit_account(account)
    }

    fn edit_credit_account(
        &self,
        user_id: UserId,
        edit: CreditEdit,
    ) -> BoxFuture<'_, StorageResult<CreditEditOutcome>> {
        self.0.edit_credit_account(user_id, edit)
    }
}

#[tokio::test]
async fn failed_commit_leaves_history_messages_and_name_untouched() {
    let runner = Arc::new(ScriptedAgentRunner::new());
    let store = Arc::new(CommitRefusingStore(MemoryStorage::new()));
    store
        .put_credit_account(account(USER, SubscriptionStatus::Active))
        .await
        .unwrap();
    let ledger = CreditLedger::new(
        store.clone(),
        Arc::new(ScriptedTokenCounter::fixed(700)),
        Arc::new(LoggingNotifier),
        BillingPolicy::default(),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        runner.clone(),
        store.clone(),
        ledger,
        AgentCatalog::default(),
        20,
    ));
    let conversation_id = orchestrator.create_conversation(USER, None).await.unwrap().id;
    for (role, text) in [
        (AgentRole::Namer, "Todo Board"),
        (AgentRole::Router, "{\"task\": \"generation\"}"),
        (AgentRole::Planner, "plan"),
        (AgentRole::Summarizer, "Building"),
        (AgentRole::Generator, "{\"files\": {\"src/App.jsx\": \"app\"}}"),
    ] {
        runner.push(role.as_str(), ScriptedReply::text(text));
    }

    let mut handle = orchestrator.start_turn(TurnRequest::new(conversation_id, USER, "Build it"));
    let events = handle.collect_events().await;
    let result = handle.join.await.unwrap();

    assert_eq!(error_stage(&events), Some("turn-persist"));
    assert!(matches!(result, Err(PipelineError::Storage { .. })));
    let conversation = orchestrator.conversation(conversation_id).await.unwrap();
    assert_eq!(conversation.name, DEFAULT_PROJECT_NAME);
    assert_eq!(conversation.history, HistoryState::default());
    assert!(orchestrator.messages(conversation_id).await.unwrap().is_empty());
    let credits = store.get_credit_account(USER).await.unwrap().unwrap();
    assert_eq!(credits.daily_tokens_available, Some(100));
}

#[tokio::test]
async fn concurrent_turns_on_one_conversation_run_one_after_the_other() {
    let harness = Harness::new().await;
    let conversation_id = harness.conversation().await;
    harness
        .reply(AgentRole::Namer, "Todo Board")
        .reply(AgentRole::Router, "{\"task\": \"generation\"}")
        .reply(AgentRole::Router, "{\"task\": \"modification\"}")
        .reply(AgentRole::ProgressSummarizer, "Renaming")
        .reply(AgentRole::FileFinder, "{\"files_to_modify\": [\"src/App.jsx\"]}")
        .reply(AgentRole::Modifier, "{\"src/App.jsx\": \"renamed app\"}");
    harness.script_generation();

    let ((_, first), (_, second)) = tokio::join!(
        harness.turn(conversation_id, "Build a todo app"),
        harness.turn(conversation_id, "Rename the app"),
    );
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|outcome| outcome.message.seq);
    let tasks = outcomes.iter().map(|outcome| outcome.task).collect::<Vec<_>>();
    assert_eq!(tasks, vec![TaskKind::Generation, TaskKind::Modification]);
    assert_eq!(outcomes[0].project_name.as_deref(), Some("Todo Board"));
    assert_eq!(outcomes[1].project_name, None);

    let conversation = harness.orchestrator.conversation(conversation_id).await.unwrap();
    let snapshots = outcomes
        .iter()
        .map(|outcome| outcome.snapshot.clone().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(conversation.history.snapshots, snapshots);
    assert_eq!(conversation.history.position, Some(1));
    assert_eq!(conversation.history.current, snapshots[1]);
    assert_eq!(snapshots[1].files["src/App.jsx"], "renamed app");

    let seqs = harness
        .orchestrator
        .messages(conversation_id)
        .await
        .unwrap()
        .iter()
        .map(|message| message.seq)
        .collect::<Vec<_>>();
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(harness.runner.requests_for(AgentRole::Namer.as_str()).len(), 1);
    assert_eq!(harness.daily_credits().await, Some(96));
    assert_eq!(harness.runner.pending_replies(), 0);
}

#[tokio::test]
async fn planner_markup_is_cleaned_before_it_reaches_later_agents() {
    let harness = Harness::new().await;
    let conversation_id = harness.conversation().await;
    harness
        .reply(AgentRole::Namer, "Todo Board")
        .reply(AgentRole::Router, "{\"task\": \"generation\"}")
        .reply(AgentRole::Planner, "```json\n1. list\n2. add button\n```")
        .reply(AgentRole::Summarizer, "Building")
        .reply(AgentRole::Generator, "{\"files\": {\"src/App.jsx\": \"app\"}}");

    let (_, result) = harness.turn(conversation_id, "Build a todo app").await;
    result.unwrap();

    for role in [AgentRole::Summarizer, AgentRole::Generator] {
        let requests = harness.runner.requests_for(role.as_str());
        let input = text_input(&requests[0].input);
        assert!(input.contains("1. list\n2. add button"), "{input}");
        assert!(!input.contains("```"), "{input}");
    }
}

#[tokio::test]
async fn orchestrator_built_from_settings_uses_configured_policy_and_counter() {
    let mut settings = Settings::default();
    settings.history_limit = 2;
    settings.billing.rounding = Rounding::Floor;
    let settings = settings.normalized();

    assert!(create_agent_runner(settings.provider_config()).is_err());
    let mut keyed = settings.clone();
    keyed.provider.api_key = "sk-test".to_string();
    assert!(create_agent_runner(keyed.provider_config()).is_ok());

    let runner = Arc::new(ScriptedAgentRunner::new());
    let store = Arc::new(MemoryStorage::new());
    store
        .put_credit_account(account(USER, SubscriptionStatus::Active))
        .await
        .unwrap();
    let orchestrator = Arc::new(Orchestrator::from_settings(
        &settings,
        runner.clone(),
        store.clone(),
    ));
    assert_eq!(orchestrator.history().limit(), 2);
    assert_eq!(orchestrator.ledger().policy(), &settings.billing_policy());

    let conversation_id = orchestrator.create_conversation(USER, None).await.unwrap().id;
    runner.push(AgentRole::Namer.as_str(), ScriptedReply::text("Todo Board"));
    runner.push(
        AgentRole::Router.as_str(),
        ScriptedReply::text("{\"task\": \"generation\"}"),
    );
    runner.push(AgentRole::Planner.as_str(), ScriptedReply::text("plan"));
    runner.push(AgentRole::Summarizer.as_str(), ScriptedReply::text("Building"));
    runner.push(
        AgentRole::Generator.as_str(),
        ScriptedReply::text("{\"files\": {\"src/App.jsx\": \"app\"}}"),
    );

    let mut handle = orchestrator.start_turn(TurnRequest::new(conversation_id, USER, "Build it"));
    handle.collect_events().await;
    let outcome = handle.join.await.unwrap().unwrap();

    // The default token counter has no API key, so billing is skipped.
    assert!(matches!(outcome.billing, BillingStatus::Skipped { .. }));
    let credits = store.get_credit_account(USER).await.unwrap().unwrap();
    assert_eq!(credits.daily_tokens_available, Some(100));
    assert_eq!(
        orchestrator.conversation(conversation_id).await.unwrap().name,
        "Todo Board"
    );
}
