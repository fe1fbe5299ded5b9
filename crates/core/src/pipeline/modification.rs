use std::collections::BTreeMap;

use loom_storage::ProjectSnapshot;
use serde_json::{Value, json};
use snafu::ensure;

use super::state::RunStage;
use super::{
    PipelineContext, PipelineOutcome, file_content, file_map, project_json, string_field,
    string_list,
};
use crate::agents::AgentRole;
use crate::credits::BillableTurn;
use crate::error::{PipelineResult, PreconditionMissingSnafu};

/// Files the finder agent named for one change request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSelection {
    pub files_to_modify: Vec<String>,
    pub new_files_to_create: Vec<String>,
    pub related_files_to_update: Vec<String>,
    pub summary: String,
}

impl FileSelection {
    pub fn from_value(value: &Value) -> Self {
        Self {
            files_to_modify: string_list(value, "files_to_modify"),
            new_files_to_create: string_list(value, "new_files_to_create"),
            related_files_to_update: string_list(value, "related_files_to_update"),
            summary: string_field(value, "summary").unwrap_or_default(),
        }
    }
}

/// The minimal file subset handed to the modifier, plus a warning for each
/// named file the project does not contain. New files start empty.
pub fn modification_targets(
    snapshot: &ProjectSnapshot,
    selection: &FileSelection,
) -> (BTreeMap<String, String>, Vec<String>) {
    let mut targets = BTreeMap::new();
    let mut warnings = Vec::new();

    for path in &selection.files_to_modify {
        match snapshot.files.get(path) {
            Some(content) => {
                targets.insert(path.clone(), content.clone());
            }
            None => warnings.push(format!("File not found in project: {path}")),
        }
    }
    for path in &selection.new_files_to_create {
        targets.entry(path.clone()).or_default();
    }
    for path in &selection.related_files_to_update {
        match snapshot.files.get(path) {
            Some(content) => {
                targets
                    .entry(path.clone())
                    .or_insert_with(|| content.clone());
            }
            None => warnings.push(format!("File not found in project: {path}")),
        }
    }

    (targets, warnings)
}

pub(super) async fn run(ctx: &mut PipelineContext<'_>) -> PipelineResult<PipelineOutcome> {
    ensure!(
        !ctx.snapshot.is_empty(),
        PreconditionMissingSnafu {
            stage: "modification-precondition",
            details: "there is no project to modify",
        }
    );

    ctx.enter(RunStage::Summarize)?;
    let progress = ctx
        .stream_message(AgentRole::ProgressSummarizer, ctx.user_input.clone())
        .await?;

    ctx.enter(RunStage::FindFiles)?;
    let finder_input = json!({
        "project": project_json(&ctx.snapshot),
        "query": ctx.user_input,
    })
    .to_string();
    let finder_raw = ctx.collect(AgentRole::FileFinder, finder_input).await?;
    let found = ctx.extract(&finder_raw, "modification-find-files")?;
    let selection = FileSelection::from_value(&found.value);

    ctx.enter(RunStage::FetchFiles)?;
    let (targets, warnings) = modification_targets(&ctx.snapshot, &selection);
    for warning in warnings {
        ctx.events.warning(warning);
    }
    tracing::info!(
        conversation_id = %ctx.conversation_id,
        targets = targets.len(),
        "modification targets assembled"
    );

    ctx.enter(RunStage::Modify)?;
    let modifier_input = json!({
        "files": targets,
        "query": ctx.user_input,
        "summary": selection.summary,
    })
    .to_string();
    let modifier_raw = ctx.collect(AgentRole::Modifier, modifier_input).await?;
    let updated = file_map(&ctx.extract(&modifier_raw, "modification-modify")?.value);

    ctx.enter(RunStage::Merge)?;
    let mut project = ctx.snapshot.clone();
    for (path, content) in &updated {
        project.files.insert(path.clone(), file_content(content));
    }
    ctx.events.json_chunk(project_json(&project));

    Ok(PipelineOutcome {
        assistant_text: progress,
        snapshot: Some(project),
        billable: Some(BillableTurn {
            system: ctx.instructions(AgentRole::Modifier),
            user: ctx.user_input.clone(),
            assistant: modifier_raw,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_hold_only_named_files_with_new_files_empty() {
        let snapshot = ProjectSnapshot::from_files([("A", "alpha"), ("B", "beta")]);
        let selection = FileSelection {
            files_to_modify: vec!["A".to_string()],
            new_files_to_create: vec!["C".to_string()],
            ..FileSelection::default()
        };

        let (targets, warnings) = modification_targets(&snapshot, &selection);
        let expected = BTreeMap::from([
            ("A".to_string(), "alpha".to_string()),
            ("C".to_string(), String::new()),
        ]);
        assert_eq!(targets, expected);
        assert!(warnings.is_empty());
    }

    #[test]
    fn unknown_files_become_warnings() {
        let snapshot = ProjectSnapshot::from_files([("A", "alpha"), ("B", "beta")]);
        let selection = FileSelection {
            files_to_modify: vec!["Z".to_string()],
            related_files_to_update: vec!["B".to_string(), "Y".to_string()],
            ..FileSelection::default()
        };

        let (targets, warnings) = modification_targets(&snapshot, &selection);
        assert_eq!(targets.keys().collect::<Vec<_>>(), vec!["B"]);
        assert_eq!(
            warnings,
            vec![
                "File not found in project: Z".to_string(),
                "File not found in project: Y".to_string(),
            ]
        );
    }

    #[test]
    fn selection_tolerates_loose_shapes() {
        let selection = FileSelection::from_value(&json!({
            "files_to_modify": "src/App.jsx",
            "new_files_to_create": ["", "src/New.jsx", 3],
            "summary": "  add a button  "
        }));
        assert_eq!(selection.files_to_modify, vec!["src/App.jsx"]);
        assert_eq!(selection.new_files_to_create, vec!["src/New.jsx"]);
        assert!(selection.related_files_to_update.is_empty());
        assert_eq!(selection.summary, "add a button");
    }
}
