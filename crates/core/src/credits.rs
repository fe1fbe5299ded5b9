//! Token counting, credit conversion and quota reservation.

use std::sync::Arc;

use loom_llm::{AgentMessage, BoxFuture, TokenCountRequest, TokenCounter};
use loom_storage::{CreditAccount, CreditBalance, CreditEditOutcome, Storage, UserId};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

use crate::error::{
    AccessRefusedSnafu, AccountMissingSnafu, BillingResult, CreditStoreSnafu, PipelineResult,
    ReservationRefusedSnafu, StorageSnafu, TokenCountSnafu,
};

pub const DEFAULT_TOKENS_PER_CREDIT: f64 = 350.0;
pub const DEFAULT_LOW_CREDIT_THRESHOLD: i64 = 10;
pub const DEFAULT_BILLING_MODEL: &str = "claude-sonnet-4-20250514";

const ROUND_SCALE: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rounding {
    #[default]
    Ceil,
    Floor,
    /// Four decimal places.
    Round,
}

/// Converts a token count into credits. A non-positive rate falls back to
/// [`DEFAULT_TOKENS_PER_CREDIT`].
pub fn credits_for(tokens: u64, tokens_per_credit: f64, rounding: Rounding) -> f64 {
    let rate = if tokens_per_credit > 0.0 {
        tokens_per_credit
    } else {
        DEFAULT_TOKENS_PER_CREDIT
    };
    let raw = tokens as f64 / rate;
    match rounding {
        Rounding::Ceil => raw.ceil(),
        Rounding::Floor => raw.floor(),
        Rounding::Round => (raw * ROUND_SCALE).round() / ROUND_SCALE,
    }
}

/// Whole amount reserved for a credit value; never negative.
pub fn reservation_amount(credits: f64) -> u64 {
    credits.max(0.0).trunc() as u64
}

/// Balance after reserving `amount`, or `None` when the account may not be
/// charged. Daily tokens drain first and the remainder comes out of the total.
/// A drawn field is floored at zero but never ends above its stored value, so a
/// negative balance stays as it is.
pub fn plan_reservation(account: &CreditAccount, amount: u64) -> Option<CreditBalance> {
    if !account.status.allows_usage() {
        return None;
    }
    let daily = account.daily_tokens_available?;
    let total = account.total_tokens_remaining?;

    let amount = i64::try_from(amount).unwrap_or(i64::MAX);
    let from_daily = amount.min(daily.max(0));
    let remainder = amount - from_daily;
    Some(CreditBalance {
        daily_tokens_available: draw_down(daily, from_daily),
        total_tokens_remaining: draw_down(total, remainder),
    })
}

fn draw_down(current: i64, draw: i64) -> i64 {
    current.min(current.saturating_sub(draw).max(0))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingPolicy {
    pub model: String,
    pub tokens_per_credit: f64,
    pub rounding: Rounding,
    pub low_credit_threshold: i64,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            model: DEFAULT_BILLING_MODEL.to_string(),
            tokens_per_credit: DEFAULT_TOKENS_PER_CREDIT,
            rounding: Rounding::default(),
            low_credit_threshold: DEFAULT_LOW_CREDIT_THRESHOLD,
        }
    }
}

/// Texts counted for one billable turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillableTurn {
    pub system: String,
    pub user: String,
    pub assistant: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingReceipt {
    pub tokens: u64,
    pub credits: u64,
    pub balance: CreditBalance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowCreditNotice {
    pub user_id: i64,
    pub daily_tokens_available: i64,
    pub threshold: i64,
}

pub trait LowCreditNotifier: Send + Sync {
    fn notify(&self, notice: LowCreditNotice) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

impl LowCreditNotifier for LoggingNotifier {
    fn notify(&self, notice: LowCreditNotice) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::warn!(
                user_id = notice.user_id,
                daily_tokens_available = notice.daily_tokens_available,
                threshold = notice.threshold,
                "user is running low on credits"
            );
        })
    }
}

/// Posts the notice as JSON to a configured endpoint. Failures are logged.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl LowCreditNotifier for HttpNotifier {
    fn notify(&self, notice: LowCreditNotice) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let response = self.client.post(&self.url).json(&notice).send().await;
            match response {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(user_id = notice.user_id, "low credit notification sent");
                }
                Ok(response) => {
                    tracing::warn!(
                        user_id = notice.user_id,
                        status = response.status().as_u16(),
                        "low credit notification rejected"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        user_id = notice.user_id,
                        error = %error,
                        "low credit notification failed"
                    );
                }
            }
        })
    }
}

pub struct CreditLedger {
    store: Arc<dyn Storage>,
    counter: Arc<dyn TokenCounter>,
    notifier: Arc<dyn LowCreditNotifier>,
    policy: BillingPolicy,
}

impl CreditLedger {
    pub fn new(
        store: Arc<dyn Storage>,
        counter: Arc<dyn TokenCounter>,
        notifier: Arc<dyn LowCreditNotifier>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            counter,
            notifier,
            policy,
        }
    }

    pub fn policy(&self) -> &BillingPolicy {
        &self.policy
    }

    pub async fn count_tokens(
        &self,
        model: &str,
        system: &str,
        messages: Vec<AgentMessage>,
    ) -> BillingResult<u64> {
        self.counter
            .count(TokenCountRequest::new(model, system, messages))
            .await
            .context(TokenCountSnafu {
                stage: "ledger-count-tokens",
            })
    }

    pub fn credits_for(&self, tokens: u64) -> f64 {
        credits_for(tokens, self.policy.tokens_per_credit, self.policy.rounding)
    }

    /// Debits `amount` from the user's quota under the row lock.
    pub async fn reserve(&self, user_id: UserId, amount: u64) -> BillingResult<CreditBalance> {
        let outcome = self
            .store
            .edit_credit_account(
                user_id,
                Box::new(move |account: &CreditAccount| plan_reservation(account, amount)),
            )
            .await
            .context(CreditStoreSnafu {
                stage: "ledger-reserve",
            })?;

        match outcome {
            CreditEditOutcome::Applied { after, .. } => {
                let balance = CreditBalance {
                    daily_tokens_available: after.daily_tokens_available.unwrap_or_default(),
                    total_tokens_remaining: after.total_tokens_remaining.unwrap_or_default(),
                };
                tracing::info!(
                    user_id = %user_id,
                    amount,
                    daily = balance.daily_tokens_available,
                    total = balance.total_tokens_remaining,
                    "credits reserved"
                );
                Ok(balance)
            }
            CreditEditOutcome::Refused(_) => ReservationRefusedSnafu {
                stage: "ledger-reserve",
                user_id,
                amount,
            }
            .fail(),
            CreditEditOutcome::Missing => AccountMissingSnafu {
                stage: "ledger-reserve",
                user_id,
            }
            .fail(),
        }
    }

    /// Counts the turn exactly, converts it to credits and reserves them.
    pub async fn bill(&self, user_id: UserId, turn: BillableTurn) -> BillingResult<BillingReceipt> {
        let messages = vec![
            AgentMessage::user(turn.user),
            AgentMessage::assistant(turn.assistant),
        ];
        let tokens = self
            .count_tokens(&self.policy.model, &turn.system, messages)
            .await?;
        let credits = reservation_amount(self.credits_for(tokens));
        let balance = self.reserve(user_id, credits).await?;
        Ok(BillingReceipt {
            tokens,
            credits,
            balance,
        })
    }

    /// Refuses turns for missing, inactive or exhausted accounts and fires a
    /// low-credit notice without waiting on it.
    pub async fn check_access(&self, user_id: UserId) -> PipelineResult<CreditAccount> {
        let account = self
            .store
            .get_credit_account(user_id)
            .await
            .context(StorageSnafu {
                stage: "ledger-check-access",
            })?
            .context(AccessRefusedSnafu {
                stage: "ledger-check-access",
                user_id,
                reason: "no subscription",
            })?;

        snafu::ensure!(
            account.status.allows_usage(),
            AccessRefusedSnafu {
                stage: "ledger-check-access",
                user_id,
                reason: format!("subscription is {}", account.status.as_str()),
            }
        );
        snafu::ensure!(
            account.daily_tokens_available != Some(0),
            AccessRefusedSnafu {
                stage: "ledger-check-access",
                user_id,
                reason: "daily credits are exhausted",
            }
        );

        let low_daily = account
            .daily_tokens_available
            .filter(|daily| *daily <= self.policy.low_credit_threshold);
        if let Some(daily) = low_daily {
            let notifier = Arc::clone(&self.notifier);
            let notice = LowCreditNotice {
                user_id: user_id.0,
                daily_tokens_available: daily,
                threshold: self.policy.low_credit_threshold,
            };
            tokio::spawn(async move { notifier.notify(notice).await });
        }

        Ok(account)
    }
}
