use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use loom_core::agents::{AgentCatalog, AgentRole};
use loom_core::credits::{BillingPolicy, CreditLedger, LoggingNotifier};
use loom_core::history::DEFAULT_HISTORY_LIMIT;
use loom_core::pipeline::{BillingStatus, Orchestrator, PipelineEvent, TurnOutcome, TurnRequest};
use loom_core::{BillingError, PipelineError, Settings, SettingsStore};
use loom_llm::{
    AgentError, AgentRunner, ScriptedAgentRunner, ScriptedReply, ScriptedTokenCounter,
    create_agent_runner,
};
use loom_storage::{
    ConversationId, CreditAccount, MemoryStorage, NewMessage, ProjectSnapshot, SqliteStorage,
    Storage, StorageError, SubscriptionStatus, TaskKind, UserId,
};

const QA_USER: UserId = UserId(1);
const BILLED_TOKENS: u64 = 700;
const GENERATED_PROJECT: &str = "```json\n{\"project_name\": \"kanban\", \"files\": {\"package.\": \"{}\", \"src/App.jsx\": \"board\"}}\n```";

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenarios: Vec<Scenario>,
    db_path: Option<String>,
    settings_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    Generation,
    Modification,
    ErrorResolution,
    Conversation,
    UndoRedo,
    Cancellation,
    CreditReserve,
    Wiring,
}

impl Scenario {
    const ALL: [Scenario; 8] = [
        Self::Generation,
        Self::Modification,
        Self::ErrorResolution,
        Self::Conversation,
        Self::UndoRedo,
        Self::Cancellation,
        Self::CreditReserve,
        Self::Wiring,
    ];

    fn parse(raw: &str) -> Option<Vec<Self>> {
        let scenario = match raw {
            "generation" => Self::Generation,
            "modification" => Self::Modification,
            "error_resolution" => Self::ErrorResolution,
            "conversation" => Self::Conversation,
            "undo_redo" => Self::UndoRedo,
            "cancellation" => Self::Cancellation,
            "credit_reserve" => Self::CreditReserve,
            "wiring" => Self::Wiring,
            "all" => return Some(Self::ALL.to_vec()),
            _ => return None,
        };
        Some(vec![scenario])
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Modification => "modification",
            Self::ErrorResolution => "error_resolution",
            Self::Conversation => "conversation",
            Self::UndoRedo => "undo_redo",
            Self::Cancellation => "cancellation",
            Self::CreditReserve => "credit_reserve",
            Self::Wiring => "wiring",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage setup failed: {source}"))]
    StorageSetup {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("agent provider setup failed: {source}"))]
    Provider {
        stage: &'static str,
        source: AgentError,
    },
    #[snafu(display("pipeline failed on `{stage}`: {source}"))]
    Pipeline {
        stage: &'static str,
        source: PipelineError,
    },
    #[snafu(display("billing failed on `{stage}`: {source}"))]
    Billing {
        stage: &'static str,
        source: BillingError,
    },
    #[snafu(display("turn task panicked or was aborted: {source}"))]
    TurnJoin {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }
    if let Some(settings_path) = args.settings_path.as_deref() {
        println!("settings_path={}", settings_path.display());
    }

    let mut failed = Vec::new();
    for scenario in &args.scenarios {
        println!("scenario={}", scenario.name());
        match run_scenario(*scenario, &args).await {
            Ok(()) => println!("{}=PASS", scenario.name()),
            Err(error) => {
                println!("{}=FAIL", scenario.name());
                eprintln!("{}_error={error}", scenario.name());
                failed.push(scenario.name());
            }
        }
    }

    ensure!(
        failed.is_empty(),
        ScenarioFailedSnafu {
            stage: "run-scenarios",
            scenario: "all",
            reason: format!("failing scenarios: {}", failed.join(", ")),
        }
    );
    println!("runner_ok=true");
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenarios = None;
    let mut db_path = None;
    let mut settings_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;
                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenarios = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            "--settings" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-settings-value",
                    arg: "--settings",
                })?;
                settings_path = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenarios: scenarios.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
        settings_path,
    })
}

async fn run_scenario(scenario: Scenario, args: &RunnerArgs) -> RunnerResult<()> {
    let fixture = Fixture::open(args.db_path.as_deref()).await?;
    match scenario {
        Scenario::Generation => run_generation(&fixture).await,
        Scenario::Modification => run_modification(&fixture).await,
        Scenario::ErrorResolution => run_error_resolution(&fixture).await,
        Scenario::Conversation => run_conversation(&fixture).await,
        Scenario::UndoRedo => run_undo_redo(&fixture).await,
        Scenario::Cancellation => run_cancellation(&fixture).await,
        Scenario::CreditReserve => run_credit_reserve(&fixture).await,
        Scenario::Wiring => run_wiring(&fixture, args.settings_path.as_deref()).await,
    }
}

/// Scripted runner and a seeded store, in memory unless `--db` names a file.
struct Fixture {
    runner: Arc<ScriptedAgentRunner>,
    store: Arc<dyn Storage>,
    orchestrator: Arc<Orchestrator>,
}

impl Fixture {
    async fn open(db_path: Option<&str>) -> RunnerResult<Self> {
        let store: Arc<dyn Storage> = match db_path {
            Some(path) => Arc::new(SqliteStorage::open(path).await.context(StorageSetupSnafu {
                stage: "fixture-open-sqlite",
            })?),
            None => Arc::new(MemoryStorage::new()),
        };
        store
            .put_credit_account(qa_account(Some(100), Some(1000)))
            .await
            .context(StorageSetupSnafu {
                stage: "fixture-seed-credits",
            })?;

        let runner = Arc::new(ScriptedAgentRunner::new());
        let ledger = CreditLedger::new(
            Arc::clone(&store),
            Arc::new(ScriptedTokenCounter::fixed(BILLED_TOKENS)),
            Arc::new(LoggingNotifier),
            BillingPolicy::default(),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            runner.clone(),
            Arc::clone(&store),
            ledger,
            AgentCatalog::default(),
            DEFAULT_HISTORY_LIMIT,
        ));
        Ok(Self {
            runner,
            store,
            orchestrator,
        })
    }

    fn reply(&self, role: AgentRole, text: &str) -> &Self {
        self.runner.push(role.as_str(), ScriptedReply::text(text));
        self
    }

    async fn conversation(&self) -> RunnerResult<ConversationId> {
        let record = self
            .orchestrator
            .create_conversation(QA_USER, None)
            .await
            .context(PipelineSnafu {
                stage: "fixture-create-conversation",
            })?;
        Ok(record.id)
    }

    async fn seeded_conversation(&self, snapshot: ProjectSnapshot) -> RunnerResult<ConversationId> {
        let conversation_id = self.conversation().await?;
        self.orchestrator
            .history()
            .append(conversation_id, snapshot.clone())
            .await
            .context(PipelineSnafu {
                stage: "fixture-seed-history",
            })?;
        self.store
            .add_message(
                conversation_id,
                NewMessage {
                    user_text: "build a kanban board".to_string(),
                    assistant_text: "done".to_string(),
                    snapshot: Some(snapshot),
                    task: TaskKind::Generation,
                },
            )
            .await
            .context(StorageSetupSnafu {
                stage: "fixture-seed-message",
            })?;
        Ok(conversation_id)
    }

    async fn turn(
        &self,
        conversation_id: ConversationId,
        input: &str,
    ) -> RunnerResult<(Vec<PipelineEvent>, TurnOutcome)> {
        let mut handle = self
            .orchestrator
            .start_turn(TurnRequest::new(conversation_id, QA_USER, input));
        let events = handle.collect_events().await;
        let outcome = handle
            .join
            .await
            .context(TurnJoinSnafu { stage: "turn-join" })?
            .context(PipelineSnafu { stage: "turn-run" })?;
        Ok((events, outcome))
    }
}

fn qa_account(daily: Option<i64>, total: Option<i64>) -> CreditAccount {
    CreditAccount {
        user_id: QA_USER,
        status: SubscriptionStatus::Active,
        daily_tokens_available: daily,
        total_tokens_remaining: total,
    }
}

fn qa_project() -> ProjectSnapshot {
    ProjectSnapshot::from_files([
        ("index.html", "<div id=\"root\"></div>"),
        ("src/App.jsx", "board"),
        ("vite.config.js", "export default {}"),
    ])
}

fn warning_count(events: &[PipelineEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, PipelineEvent::Warning(_)))
        .count()
}

async fn run_generation(fixture: &Fixture) -> RunnerResult<()> {
    let conversation_id = fixture.conversation().await?;
    fixture
        .reply(AgentRole::Namer, "{\"project_name\": \"QA Board\"}")
        .reply(AgentRole::Router, "{\"task\": \"generation\"}")
        .reply(AgentRole::Planner, "1. columns\n2. cards")
        .reply(AgentRole::Summarizer, "Building the board")
        .reply(AgentRole::Generator, GENERATED_PROJECT);

    let (events, outcome) = fixture.turn(conversation_id, "Build a kanban board").await?;
    let files = outcome
        .snapshot
        .as_ref()
        .map(|snapshot| snapshot.files.keys().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    println!("generation_files={}", files.join(","));
    println!("generation_billing={:?}", outcome.billing);
    println!("generation_events={}", events.len());

    ensure!(
        outcome.task == TaskKind::Generation && files.contains(&"package.json".to_string()),
        ScenarioFailedSnafu {
            stage: "scenario-generation",
            scenario: "generation",
            reason: "generated project is missing the corrected manifest",
        }
    );
    ensure!(
        outcome.project_name.as_deref() == Some("QA Board"),
        ScenarioFailedSnafu {
            stage: "scenario-generation",
            scenario: "generation",
            reason: format!("unexpected project name {:?}", outcome.project_name),
        }
    );
    ensure!(
        matches!(outcome.billing, BillingStatus::Billed { .. }),
        ScenarioFailedSnafu {
            stage: "scenario-generation",
            scenario: "generation",
            reason: "turn was not billed",
        }
    );
    Ok(())
}

async fn run_modification(fixture: &Fixture) -> RunnerResult<()> {
    let conversation_id = fixture.seeded_conversation(qa_project()).await?;
    fixture
        .reply(AgentRole::Router, "{\"task\": \"modification\"}")
        .reply(AgentRole::ProgressSummarizer, "Adding a column")
        .reply(
            AgentRole::FileFinder,
            "{\"files_to_modify\": [\"src/App.jsx\", \"src/Gone.jsx\"]}",
        )
        .reply(AgentRole::Modifier, "{\"src/App.jsx\": \"board with column\"}");

    let (events, outcome) = fixture.turn(conversation_id, "Add a done column").await?;
    let app = outcome
        .snapshot
        .as_ref()
        .and_then(|snapshot| snapshot.files.get("src/App.jsx").cloned())
        .unwrap_or_default();
    println!("modification_warnings={}", warning_count(&events));
    println!("modification_app={app}");

    ensure!(
        outcome.task == TaskKind::Modification
            && app == "board with column"
            && warning_count(&events) == 1,
        ScenarioFailedSnafu {
            stage: "scenario-modification",
            scenario: "modification",
            reason: "modified file or missing-file warning not observed",
        }
    );
    Ok(())
}

async fn run_error_resolution(fixture: &Fixture) -> RunnerResult<()> {
    let conversation_id = fixture.seeded_conversation(qa_project()).await?;
    fixture
        .reply(AgentRole::Router, "{\"task\": \"error_resolution\"}")
        .reply(AgentRole::ProgressSummarizer, "Fixing the build")
        .reply(
            AgentRole::ErrorFinder,
            "{\"affected_files\": [\"src/App.jsx\"], \"dependency_chain\": {\"config_files\": [\"vite.config.js\"]}}",
        )
        .reply(AgentRole::ErrorResolver, "{\"src/App.jsx\": \"fixed board\"}");

    let (events, outcome) = fixture
        .turn(conversation_id, "vite fails: cannot resolve ./Board")
        .await?;
    let app = outcome
        .snapshot
        .as_ref()
        .and_then(|snapshot| snapshot.files.get("src/App.jsx").cloned())
        .unwrap_or_default();
    println!("error_resolution_warnings={}", warning_count(&events));
    println!("error_resolution_app={app}");

    ensure!(
        outcome.task == TaskKind::ErrorResolution && app == "fixed board",
        ScenarioFailedSnafu {
            stage: "scenario-error-resolution",
            scenario: "error_resolution",
            reason: "resolved file was not merged",
        }
    );
    Ok(())
}

async fn run_conversation(fixture: &Fixture) -> RunnerResult<()> {
    let conversation_id = fixture.conversation().await?;
    fixture
        .reply(AgentRole::Namer, "QA Chat")
        .reply(AgentRole::Router, "{\"task\": \"conversation\"}")
        .reply(AgentRole::Conversation, "```html<p>Hi there</p>```");

    let (events, outcome) = fixture.turn(conversation_id, "hello").await?;
    println!("conversation_reply={}", outcome.message.assistant_text);
    println!("conversation_events={}", events.len());

    ensure!(
        outcome.billing == BillingStatus::NotBillable
            && outcome.snapshot.is_none()
            && outcome.message.assistant_text == "<p>Hi there</p>",
        ScenarioFailedSnafu {
            stage: "scenario-conversation",
            scenario: "conversation",
            reason: "conversation reply was billed, kept fences or produced a snapshot",
        }
    );
    Ok(())
}

async fn run_undo_redo(fixture: &Fixture) -> RunnerResult<()> {
    let original = qa_project();
    let conversation_id = fixture.seeded_conversation(original.clone()).await?;
    fixture
        .reply(AgentRole::Router, "{\"task\": \"modification\"}")
        .reply(AgentRole::ProgressSummarizer, "Renaming")
        .reply(AgentRole::FileFinder, "{\"files_to_modify\": [\"src/App.jsx\"]}")
        .reply(AgentRole::Modifier, "{\"src/App.jsx\": \"renamed board\"}");
    let (_, outcome) = fixture.turn(conversation_id, "Rename the board").await?;
    let modified = outcome.snapshot.unwrap_or_default();

    let orchestrator = &fixture.orchestrator;
    let undone = orchestrator
        .undo(conversation_id)
        .await
        .context(PipelineSnafu { stage: "scenario-undo" })?;
    let undone_again = orchestrator
        .undo(conversation_id)
        .await
        .context(PipelineSnafu { stage: "scenario-undo" })?;
    let redone = orchestrator
        .redo(conversation_id)
        .await
        .context(PipelineSnafu { stage: "scenario-redo" })?;
    let status = orchestrator
        .history_status(conversation_id)
        .await
        .context(PipelineSnafu {
            stage: "scenario-status",
        })?;
    println!("undo_redo_status={status:?}");

    ensure!(
        undone == original && undone_again == original && redone == modified,
        ScenarioFailedSnafu {
            stage: "scenario-undo-redo",
            scenario: "undo_redo",
            reason: "undo/redo did not move between the two snapshots",
        }
    );
    ensure!(
        status.can_undo && !status.can_redo && status.total == 2,
        ScenarioFailedSnafu {
            stage: "scenario-undo-redo",
            scenario: "undo_redo",
            reason: format!("unexpected status {status:?}"),
        }
    );
    Ok(())
}

async fn run_cancellation(fixture: &Fixture) -> RunnerResult<()> {
    let conversation_id = fixture.seeded_conversation(qa_project()).await?;
    fixture.reply(AgentRole::Router, "{\"task\": \"modification\"}");
    fixture.runner.push(
        AgentRole::ProgressSummarizer.as_str(),
        ScriptedReply::fragments(["Looking at the board"]).stalling(),
    );

    let mut handle = fixture
        .orchestrator
        .start_turn(TurnRequest::new(conversation_id, QA_USER, "Add a footer"));
    let first = handle.events.recv().await;
    handle.cancel.cancel();
    let rest = handle.collect_events().await;
    let result = handle
        .join
        .await
        .context(TurnJoinSnafu { stage: "turn-join" })?;
    let messages = fixture
        .orchestrator
        .messages(conversation_id)
        .await
        .context(PipelineSnafu {
            stage: "scenario-cancellation-messages",
        })?;
    println!("cancellation_first_event={first:?}");
    println!("cancellation_messages={}", messages.len());

    let cancelled = matches!(&result, Err(error) if error.is_cancelled());
    ensure!(
        cancelled && messages.len() == 1 && matches!(rest.last(), Some(PipelineEvent::Error(_))),
        ScenarioFailedSnafu {
            stage: "scenario-cancellation",
            scenario: "cancellation",
            reason: "cancelled turn persisted output or did not report an error",
        }
    );
    Ok(())
}

async fn run_credit_reserve(fixture: &Fixture) -> RunnerResult<()> {
    fixture
        .store
        .put_credit_account(qa_account(Some(20), Some(30)))
        .await
        .context(StorageSetupSnafu {
            stage: "scenario-credit-reserve-seed",
        })?;

    let ledger = fixture.orchestrator.ledger();
    let reservations = join_all((0..12).map(|_| ledger.reserve(QA_USER, 5))).await;
    for reservation in reservations {
        reservation.context(BillingSnafu {
            stage: "scenario-credit-reserve",
        })?;
    }

    let account = fixture
        .store
        .get_credit_account(QA_USER)
        .await
        .context(StorageSetupSnafu {
            stage: "scenario-credit-reserve-read",
        })?;
    let daily = account.as_ref().and_then(|account| account.daily_tokens_available);
    let total = account.as_ref().and_then(|account| account.total_tokens_remaining);
    println!("credit_reserve_daily={daily:?}");
    println!("credit_reserve_total={total:?}");

    ensure!(
        daily == Some(0) && total == Some(0),
        ScenarioFailedSnafu {
            stage: "scenario-credit-reserve",
            scenario: "credit_reserve",
            reason: "concurrent reservations did not drain daily then total down to zero",
        }
    );
    Ok(())
}

/// Builds the orchestrator the way a host would: settings file, provider
/// runner and the settings-derived ledger, catalog and history limit.
async fn run_wiring(fixture: &Fixture, settings_path: Option<&Path>) -> RunnerResult<()> {
    let settings_store = match settings_path {
        Some(path) => SettingsStore::new(path.to_path_buf()),
        None => SettingsStore::load(),
    };
    let settings: Arc<Settings> = settings_store.settings();
    println!("wiring_config_path={}", settings_store.config_path().display());

    let scripted = Arc::new(ScriptedAgentRunner::new());
    let runner: Arc<dyn AgentRunner> = if settings.provider.api_key.is_empty() {
        println!("wiring_note=no provider api key configured, using the scripted runner");
        scripted.clone()
    } else {
        create_agent_runner(settings.provider_config()).context(ProviderSnafu {
            stage: "wiring-create-runner",
        })?
    };
    println!("wiring_runner={}", runner.id());

    let orchestrator = Arc::new(Orchestrator::from_settings(
        &settings,
        runner,
        Arc::clone(&fixture.store),
    ));
    let limit = orchestrator.history().limit();
    println!("wiring_history_limit={limit}");
    println!("wiring_billing_model={}", orchestrator.ledger().policy().model);
    ensure!(
        limit == settings.history_limit
            && orchestrator.ledger().policy() == &settings.billing_policy(),
        ScenarioFailedSnafu {
            stage: "scenario-wiring",
            scenario: "wiring",
            reason: "orchestrator does not carry the configured limit and billing policy",
        }
    );

    let conversation_id = orchestrator
        .create_conversation(QA_USER, Some("Wiring Check".to_string()))
        .await
        .context(PipelineSnafu {
            stage: "scenario-wiring-conversation",
        })?
        .id;
    println!("wiring_conversation={conversation_id}");
    if !settings.provider.api_key.is_empty() {
        return Ok(());
    }

    scripted.push(AgentRole::Namer.as_str(), ScriptedReply::text("Wiring Check"));
    scripted.push(
        AgentRole::Router.as_str(),
        ScriptedReply::text("{\"task\": \"conversation\"}"),
    );
    scripted.push(AgentRole::Conversation.as_str(), ScriptedReply::text("Wired up"));
    let mut handle =
        orchestrator.start_turn(TurnRequest::new(conversation_id, QA_USER, "are you there?"));
    handle.collect_events().await;
    let outcome = handle
        .join
        .await
        .context(TurnJoinSnafu { stage: "turn-join" })?
        .context(PipelineSnafu { stage: "turn-run" })?;
    println!("wiring_reply={}", outcome.message.assistant_text);
    ensure!(
        outcome.message.assistant_text == "Wired up",
        ScenarioFailedSnafu {
            stage: "scenario-wiring",
            scenario: "wiring",
            reason: "settings-built orchestrator did not complete a turn",
        }
    );
    Ok(())
}
