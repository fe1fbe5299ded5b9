use std::collections::BTreeMap;
use std::fmt;

use loom_llm::AgentDescriptor;
use serde::{Deserialize, Serialize};

pub const DEFAULT_AGENT_MODEL: &str = "gpt-4o-mini";

/// Every agent the pipelines call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Router,
    Namer,
    Planner,
    Summarizer,
    Generator,
    ProgressSummarizer,
    FileFinder,
    Modifier,
    ErrorFinder,
    ErrorResolver,
    Conversation,
}

impl AgentRole {
    pub const ALL: [AgentRole; 11] = [
        Self::Router,
        Self::Namer,
        Self::Planner,
        Self::Summarizer,
        Self::Generator,
        Self::ProgressSummarizer,
        Self::FileFinder,
        Self::Modifier,
        Self::ErrorFinder,
        Self::ErrorResolver,
        Self::Conversation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Namer => "namer",
            Self::Planner => "planner",
            Self::Summarizer => "summarizer",
            Self::Generator => "generator",
            Self::ProgressSummarizer => "progress_summarizer",
            Self::FileFinder => "file_finder",
            Self::Modifier => "modifier",
            Self::ErrorFinder => "error_finder",
            Self::ErrorResolver => "error_resolver",
            Self::Conversation => "conversation",
        }
    }

    fn default_instructions(self) -> &'static str {
        match self {
            Self::Router => {
                "Classify the request. Reply only with {\"task\": \"generation\" | \"modification\" | \"error_resolution\" | \"conversation\"}."
            }
            Self::Namer => "Suggest a short project name. Reply only with {\"project_name\": \"...\"}.",
            Self::Planner => "Write a concise implementation plan for the requested web project.",
            Self::Summarizer => "Explain the plan to the user in their language, briefly.",
            Self::Generator => {
                "Generate the complete React project as JSON: {\"project_name\", \"framework\", \"files\": {path: content}}."
            }
            Self::ProgressSummarizer => "Tell the user in one or two sentences what you are about to change.",
            Self::FileFinder => {
                "Given {project, query}, reply with JSON: files_to_modify, new_files_to_create, related_files_to_update, summary."
            }
            Self::Modifier => "Apply the change. Reply only with a JSON object mapping file path to full new content.",
            Self::ErrorFinder => {
                "Given {error_description, project_structure}, reply with JSON: primary_error_file, affected_files, fix_priority, dependency_chain, error_type, root_cause_analysis."
            }
            Self::ErrorResolver => "Fix the error. Reply only with a JSON object mapping file path to full fixed content.",
            Self::Conversation => "Answer the user about their project. Do not wrap the reply in code fences.",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl AgentProfile {
    pub fn for_role(role: AgentRole) -> Self {
        Self {
            model: default_model(),
            instructions: role.default_instructions().to_string(),
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Profiles keyed by [`AgentRole::as_str`].
pub fn default_agent_profiles() -> BTreeMap<String, AgentProfile> {
    AgentRole::ALL
        .into_iter()
        .map(|role| (role.as_str().to_string(), AgentProfile::for_role(role)))
        .collect()
}

/// Resolves roles to the descriptors handed to the agent runner.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCatalog {
    profiles: BTreeMap<String, AgentProfile>,
}

impl Default for AgentCatalog {
    fn default() -> Self {
        Self::new(default_agent_profiles())
    }
}

impl AgentCatalog {
    pub fn new(profiles: BTreeMap<String, AgentProfile>) -> Self {
        Self { profiles }
    }

    pub fn profile(&self, role: AgentRole) -> AgentProfile {
        let mut profile = self
            .profiles
            .get(role.as_str())
            .cloned()
            .unwrap_or_else(|| AgentProfile::for_role(role));
        if profile.model.trim().is_empty() {
            profile.model = default_model();
        }
        if profile.instructions.trim().is_empty() {
            profile.instructions = role.default_instructions().to_string();
        }
        profile
    }

    pub fn instructions(&self, role: AgentRole) -> String {
        self.profile(role).instructions
    }

    pub fn descriptor(&self, role: AgentRole) -> AgentDescriptor {
        let profile = self.profile(role);
        let mut descriptor = AgentDescriptor::new(role.as_str(), profile.model)
            .with_instructions(profile.instructions);
        if let Some(temperature) = profile.temperature {
            descriptor = descriptor.with_temperature(temperature);
        }
        if let Some(max_tokens) = profile.max_tokens {
            descriptor = descriptor.with_max_tokens(max_tokens);
        }
        descriptor
    }
}

fn default_model() -> String {
    DEFAULT_AGENT_MODEL.to_string()
}
