use loom_storage::ProjectSnapshot;
use serde_json::{Map, Value, json};
use snafu::ensure;

use super::state::RunStage;
use super::{
    PipelineContext, PipelineOutcome, file_content, file_map, project_json, string_field,
    string_list,
};
use crate::agents::AgentRole;
use crate::credits::BillableTurn;
use crate::error::{PipelineResult, PreconditionMissingSnafu};

const UNKNOWN_ERROR_TYPE: &str = "unknown";
const NO_ANALYSIS: &str = "No analysis";

/// Diagnosis returned by the error finder agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorAnalysis {
    pub primary_error_file: Option<String>,
    pub affected_files: Vec<String>,
    pub fix_priority: Vec<String>,
    pub config_files: Vec<String>,
    pub imported_by: Vec<String>,
    pub error_type: String,
    pub root_cause_analysis: String,
}

impl ErrorAnalysis {
    pub fn from_value(value: &Value) -> Self {
        let affected_files = string_list(value, "affected_files");
        let fix_priority = match string_list(value, "fix_priority") {
            priority if priority.is_empty() => affected_files.clone(),
            priority => priority,
        };
        let chain = value.get("dependency_chain").cloned().unwrap_or_default();
        Self {
            primary_error_file: string_field(value, "primary_error_file"),
            affected_files,
            fix_priority,
            config_files: string_list(&chain, "config_files"),
            imported_by: string_list(&chain, "imported_by"),
            error_type: string_field(value, "error_type")
                .unwrap_or_else(|| UNKNOWN_ERROR_TYPE.to_string()),
            root_cause_analysis: string_field(value, "root_cause_analysis")
                .or_else(|| string_field(value, "analysis"))
                .unwrap_or_else(|| NO_ANALYSIS.to_string()),
        }
    }
}

/// Files to fetch, in order: the affected files with the primary file in
/// front, then configuration files, then importers. No path appears twice.
pub fn error_file_order(analysis: &ErrorAnalysis) -> Vec<String> {
    let mut order = Vec::new();
    for path in &analysis.affected_files {
        push_unique(&mut order, path);
    }
    let missing_primary = analysis
        .primary_error_file
        .as_ref()
        .filter(|primary| !order.contains(*primary));
    if let Some(primary) = missing_primary {
        order.insert(0, primary.clone());
    }
    for path in analysis.config_files.iter().chain(&analysis.imported_by) {
        push_unique(&mut order, path);
    }
    order
}

fn push_unique(order: &mut Vec<String>, path: &str) {
    if !order.iter().any(|existing| existing == path) {
        order.push(path.to_string());
    }
}

/// Project view with every file's content blanked.
pub fn structure_view(snapshot: &ProjectSnapshot) -> Value {
    let files = snapshot
        .files
        .keys()
        .map(|path| (path.clone(), Value::String(String::new())))
        .collect::<Map<_, _>>();
    json!({
        "run": {"dev": "vite", "build": "vite build", "preview": "vite preview"},
        "files": files,
        "framework": snapshot.framework,
        "project_name": snapshot.project_name,
    })
}

pub(super) async fn run(ctx: &mut PipelineContext<'_>) -> PipelineResult<PipelineOutcome> {
    ensure!(
        !ctx.snapshot.is_empty(),
        PreconditionMissingSnafu {
            stage: "error-resolution-precondition",
            details: "there is no project to repair",
        }
    );

    ctx.enter(RunStage::Summarize)?;
    let progress = ctx
        .stream_message(AgentRole::ProgressSummarizer, ctx.user_input.clone())
        .await?;

    ctx.enter(RunStage::FindFiles)?;
    let finder_input = json!({
        "error_description": ctx.user_input,
        "project_structure": structure_view(&ctx.snapshot),
    })
    .to_string();
    let finder_raw = ctx.collect(AgentRole::ErrorFinder, finder_input).await?;
    let found = ctx.extract(&finder_raw, "error-find-files")?;
    let analysis = ErrorAnalysis::from_value(&found.value);

    ctx.enter(RunStage::FetchFiles)?;
    let mut affected = Map::new();
    for path in error_file_order(&analysis) {
        match ctx.snapshot.files.get(&path) {
            Some(content) => {
                affected.insert(path, Value::String(content.clone()));
            }
            None => ctx.events.warning(format!("File not found: {path}")),
        }
    }
    tracing::info!(
        conversation_id = %ctx.conversation_id,
        error_type = %analysis.error_type,
        files = affected.len(),
        "error context assembled"
    );

    ctx.enter(RunStage::Resolve)?;
    let resolver_input = json!({
        "error_description": ctx.user_input,
        "error_type": analysis.error_type,
        "root_cause_analysis": analysis.root_cause_analysis,
        "primary_error_file": analysis.primary_error_file,
        "fix_priority": analysis.fix_priority,
        "affected_files": affected,
    })
    .to_string();
    let resolver_raw = ctx
        .collect(AgentRole::ErrorResolver, resolver_input.clone())
        .await?;
    let fixed = file_map(&ctx.extract(&resolver_raw, "error-resolve")?.value);

    ctx.enter(RunStage::Merge)?;
    let mut project = ctx.snapshot.clone();
    for (path, content) in &fixed {
        if project.files.contains_key(path) {
            project.files.insert(path.clone(), file_content(content));
        } else {
            ctx.events.warning(format!("File path not in project: {path}"));
        }
    }
    ctx.events.json_chunk(project_json(&project));

    Ok(PipelineOutcome {
        assistant_text: progress,
        snapshot: Some(project),
        billable: Some(BillableTurn {
            system: ctx.instructions(AgentRole::ErrorResolver),
            user: resolver_input,
            assistant: resolver_raw,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_order_appends_config_then_importers() {
        let analysis = ErrorAnalysis::from_value(&json!({
            "affected_files": ["X"],
            "dependency_chain": {"config_files": ["Y"], "imported_by": ["Z"]}
        }));
        assert_eq!(error_file_order(&analysis), vec!["X", "Y", "Z"]);
    }

    #[test]
    fn primary_file_goes_first_and_duplicates_are_skipped() {
        let analysis = ErrorAnalysis::from_value(&json!({
            "primary_error_file": "src/main.jsx",
            "affected_files": ["src/App.jsx"],
            "dependency_chain": {
                "config_files": ["vite.config.js", "src/App.jsx"],
                "imported_by": ["src/main.jsx", "index.html"]
            }
        }));
        assert_eq!(
            error_file_order(&analysis),
            vec!["src/main.jsx", "src/App.jsx", "vite.config.js", "index.html"]
        );
    }

    #[test]
    fn analysis_defaults() {
        let analysis = ErrorAnalysis::from_value(&json!({
            "affected_files": ["a.js", "b.js"],
            "analysis": "missing import"
        }));
        assert_eq!(analysis.fix_priority, vec!["a.js", "b.js"]);
        assert_eq!(analysis.error_type, UNKNOWN_ERROR_TYPE);
        assert_eq!(analysis.root_cause_analysis, "missing import");

        let empty = ErrorAnalysis::from_value(&json!({}));
        assert_eq!(empty.root_cause_analysis, NO_ANALYSIS);
        assert!(empty.primary_error_file.is_none());
    }

    #[test]
    fn structure_view_blanks_contents() {
        let mut snapshot = ProjectSnapshot::from_files([("src/App.jsx", "secret body")]);
        snapshot.framework = Some("react".to_string());
        let view = structure_view(&snapshot);
        assert_eq!(view["files"], json!({"src/App.jsx": ""}));
        assert_eq!(view["run"]["build"], "vite build");
        assert_eq!(view["framework"], "react");
        assert!(view["project_name"].is_null());
    }
}
