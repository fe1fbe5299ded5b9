use std::fmt;

use loom_storage::TaskKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStage {
    Plan,
    Summarize,
    Generate,
    Normalize,
    FindFiles,
    FetchFiles,
    Modify,
    Resolve,
    Merge,
    Respond,
    Persist,
    Bill,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Summarize => "summarize",
            Self::Generate => "generate",
            Self::Normalize => "normalize",
            Self::FindFiles => "find-files",
            Self::FetchFiles => "fetch-files",
            Self::Modify => "modify",
            Self::Resolve => "resolve",
            Self::Merge => "merge",
            Self::Respond => "respond",
            Self::Persist => "persist",
            Self::Bill => "bill",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Fixed stage order of each pipeline.
pub fn stage_plan(task: TaskKind) -> &'static [RunStage] {
    use RunStage::*;
    match task {
        TaskKind::Generation => &[Plan, Summarize, Generate, Normalize, Persist, Bill],
        TaskKind::Modification => &[Summarize, FindFiles, FetchFiles, Modify, Merge, Persist, Bill],
        TaskKind::ErrorResolution => {
            &[Summarize, FindFiles, FetchFiles, Resolve, Merge, Persist, Bill]
        }
        TaskKind::Conversation => &[Respond, Persist],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Pending,
    Running(RunStage),
    Completed,
    /// `None` when the run failed before entering its first stage.
    Failed(Option<RunStage>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTransition {
    Enter(RunStage),
    Complete,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTransitionRejection {
    OutOfOrder {
        current: Option<RunStage>,
        attempted: RunStage,
    },
    Unfinished {
        current: Option<RunStage>,
    },
    AlreadyFinished(RunState),
}

impl fmt::Display for RunTransitionRejection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfOrder { current, attempted } => {
                write!(formatter, "cannot enter {attempted} after {current:?}")
            }
            Self::Unfinished { current } => {
                write!(formatter, "cannot complete while at {current:?}")
            }
            Self::AlreadyFinished(state) => write!(formatter, "run already finished as {state:?}"),
        }
    }
}

pub type RunTransitionResult = Result<RunState, RunTransitionRejection>;

impl RunState {
    pub fn current_stage(&self) -> Option<RunStage> {
        match self {
            Self::Running(stage) => Some(*stage),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    /// Next state under `plan`. Stages are entered strictly in plan order and
    /// a run completes only from its last stage.
    pub fn apply(&self, plan: &[RunStage], transition: RunTransition) -> RunTransitionResult {
        if self.is_finished() {
            return Err(RunTransitionRejection::AlreadyFinished(*self));
        }
        match transition {
            RunTransition::Enter(stage) => self.apply_enter(plan, stage),
            RunTransition::Complete => self.apply_complete(plan),
            RunTransition::Fail => Ok(Self::Failed(self.current_stage())),
        }
    }

    fn apply_enter(&self, plan: &[RunStage], stage: RunStage) -> RunTransitionResult {
        let expected = match self.current_stage() {
            None => plan.first(),
            Some(current) => plan
                .iter()
                .position(|candidate| *candidate == current)
                .and_then(|index| plan.get(index + 1)),
        };
        if expected == Some(&stage) {
            Ok(Self::Running(stage))
        } else {
            Err(RunTransitionRejection::OutOfOrder {
                current: self.current_stage(),
                attempted: stage,
            })
        }
    }

    fn apply_complete(&self, plan: &[RunStage]) -> RunTransitionResult {
        match self.current_stage() {
            Some(current) if plan.last() == Some(&current) => Ok(Self::Completed),
            current => Err(RunTransitionRejection::Unfinished { current }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_follow_the_plan() {
        let plan = stage_plan(TaskKind::Conversation);
        let state = RunState::Pending
            .apply(plan, RunTransition::Enter(RunStage::Respond))
            .unwrap();
        let state = state
            .apply(plan, RunTransition::Enter(RunStage::Persist))
            .unwrap();
        assert_eq!(state.apply(plan, RunTransition::Complete), Ok(RunState::Completed));
    }

    #[test]
    fn skipping_a_stage_is_rejected() {
        let plan = stage_plan(TaskKind::Modification);
        let state = RunState::Pending
            .apply(plan, RunTransition::Enter(RunStage::Summarize))
            .unwrap();
        assert_eq!(
            state.apply(plan, RunTransition::Enter(RunStage::Modify)),
            Err(RunTransitionRejection::OutOfOrder {
                current: Some(RunStage::Summarize),
                attempted: RunStage::Modify,
            })
        );
        assert_eq!(
            state.apply(plan, RunTransition::Complete),
            Err(RunTransitionRejection::Unfinished {
                current: Some(RunStage::Summarize),
            })
        );
    }

    #[test]
    fn finished_runs_accept_nothing() {
        let plan = stage_plan(TaskKind::Generation);
        let failed = RunState::Pending.apply(plan, RunTransition::Fail).unwrap();
        assert_eq!(failed, RunState::Failed(None));
        assert!(matches!(
            failed.apply(plan, RunTransition::Enter(RunStage::Plan)),
            Err(RunTransitionRejection::AlreadyFinished(_))
        ));
    }

    #[test]
    fn every_plan_ends_with_persistence() {
        for task in TaskKind::ALL {
            let plan = stage_plan(task);
            assert!(plan.contains(&RunStage::Persist), "{task}");
            assert!(!plan.is_empty());
        }
    }
}
