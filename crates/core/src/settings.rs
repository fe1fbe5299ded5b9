use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use loom_llm::{
    AnthropicTokenCounter, DEFAULT_COUNT_TOKENS_BASE_URL, ProviderConfig, RIG_OPENAI_PROVIDER_ID,
    TokenCounter,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::agents::{AgentCatalog, AgentProfile, default_agent_profiles};
use crate::credits::{
    BillingPolicy, DEFAULT_BILLING_MODEL, DEFAULT_LOW_CREDIT_THRESHOLD, DEFAULT_TOKENS_PER_CREDIT,
    HttpNotifier, LoggingNotifier, LowCreditNotifier, Rounding,
};
use crate::history::DEFAULT_HISTORY_LIMIT;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://loom.db";
pub const SETTINGS_DIRECTORY_NAME: &str = "loom";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "LOOM_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub base_url: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            base_url: default_endpoint(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounterSettings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_count_tokens_base_url")]
    pub base_url: String,
    #[serde(default = "default_billing_model")]
    pub model: String,
}

impl Default for TokenCounterSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_count_tokens_base_url(),
            model: default_billing_model(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingSettings {
    #[serde(default = "default_tokens_per_credit")]
    pub tokens_per_credit: f64,
    #[serde(default)]
    pub rounding: Rounding,
    #[serde(default = "default_low_credit_threshold")]
    pub low_credit_threshold: i64,
    #[serde(default)]
    pub notifications_url: Option<String>,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            tokens_per_credit: DEFAULT_TOKENS_PER_CREDIT,
            rounding: Rounding::default(),
            low_credit_threshold: DEFAULT_LOW_CREDIT_THRESHOLD,
            notifications_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub token_counter: TokenCounterSettings,
    #[serde(default)]
    pub billing: BillingSettings,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_agent_profiles")]
    pub agents: BTreeMap<String, AgentProfile>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: ProviderSettings::default(),
            token_counter: TokenCounterSettings::default(),
            billing: BillingSettings::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            database_url: default_database_url(),
            agents: default_agent_profiles(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.provider.provider_id = non_blank_or(&self.provider.provider_id, default_provider_id);
        self.provider.api_key = self.provider.api_key.trim().to_string();
        self.provider.base_url = non_blank_or(&self.provider.base_url, default_endpoint);
        self.token_counter.api_key = self.token_counter.api_key.trim().to_string();
        self.token_counter.base_url =
            non_blank_or(&self.token_counter.base_url, default_count_tokens_base_url);
        self.token_counter.model = non_blank_or(&self.token_counter.model, default_billing_model);
        if self.billing.tokens_per_credit <= 0.0 || !self.billing.tokens_per_credit.is_finite() {
            self.billing.tokens_per_credit = DEFAULT_TOKENS_PER_CREDIT;
        }
        self.billing.notifications_url = self
            .billing
            .notifications_url
            .take()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        self.history_limit = self.history_limit.max(1);
        self.database_url = non_blank_or(&self.database_url, default_database_url);
        self
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(
            &self.provider.provider_id,
            &self.provider.api_key,
            &self.provider.base_url,
        )
    }

    pub fn billing_policy(&self) -> BillingPolicy {
        BillingPolicy {
            model: self.token_counter.model.clone(),
            tokens_per_credit: self.billing.tokens_per_credit,
            rounding: self.billing.rounding,
            low_credit_threshold: self.billing.low_credit_threshold,
        }
    }

    pub fn agent_catalog(&self) -> AgentCatalog {
        AgentCatalog::new(self.agents.clone())
    }

    pub fn token_counter(&self) -> Arc<dyn TokenCounter> {
        Arc::new(AnthropicTokenCounter::new(
            &self.token_counter.api_key,
            &self.token_counter.base_url,
        ))
    }

    pub fn low_credit_notifier(&self) -> Arc<dyn LowCreditNotifier> {
        match &self.billing.notifications_url {
            Some(url) => Arc::new(HttpNotifier::new(url)),
            None => Arc::new(LoggingNotifier),
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".loom"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_layers(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_layers(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults and environment", path);
        }

        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to read settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: &str, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    RIG_OPENAI_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_count_tokens_base_url() -> String {
    DEFAULT_COUNT_TOKENS_BASE_URL.to_string()
}

fn default_billing_model() -> String {
    DEFAULT_BILLING_MODEL.to_string()
}

fn default_tokens_per_credit() -> f64 {
    DEFAULT_TOKENS_PER_CREDIT
}

fn default_low_credit_threshold() -> i64 {
    DEFAULT_LOW_CREDIT_THRESHOLD
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}
