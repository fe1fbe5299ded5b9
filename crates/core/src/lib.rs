//! Orchestration core: routes a user turn into a task pipeline, turns noisy
//! agent output into structured projects, keeps an undoable snapshot history per
//! conversation and bills each turn against the user's credit quota.

pub mod agents;
pub mod aggregate;
pub mod credits;
pub mod error;
pub mod extract;
pub mod history;
pub mod pipeline;
pub mod router;
pub mod settings;

pub use agents::{AgentCatalog, AgentProfile, AgentRole, default_agent_profiles};
pub use aggregate::{Aggregated, NOISE_MARKERS, aggregate, is_noise};
pub use credits::{
    BillableTurn, BillingPolicy, BillingReceipt, CreditLedger, HttpNotifier, LoggingNotifier,
    LowCreditNotice, LowCreditNotifier, Rounding, credits_for, plan_reservation,
    reservation_amount,
};
pub use error::{BillingError, BillingResult, PipelineError, PipelineResult};
pub use extract::{
    ExtractionFailure, ExtractionStrategy, Extracted, clean_markers, extract, extract_object,
};
pub use history::{DEFAULT_HISTORY_LIMIT, HistoryEngine, HistoryStatus};
pub use pipeline::{
    BillingStatus, CompletePayload, ErrorPayload, EventSink, Orchestrator, PipelineEvent,
    TurnHandle, TurnOutcome, TurnRequest,
};
pub use router::{Classification, ClassificationMethod, classify, dispatch};
pub use settings::{Settings, SettingsError, SettingsStore};
