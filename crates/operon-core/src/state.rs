//! Pipeline and stage state enumerations
//!
//! The pipeline state set is fixed by the product domain: stage types and
//! transition targets are not user-definable. `allowed_transitions` is the
//! single source of truth for which edges exist; the engine's pure state
//! machine builds on top of it and never produces a state outside this
//! enumeration.

use serde::{Deserialize, Serialize};

/// Current position of a pipeline in its stage sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    RequirementsInput,
    PlanGeneration,
    HumanReview,
    AdversarialReview,
    ContextPrep,
    ParallelExecution,
    Testing,
    CodeReview,
    GitIntegration,
    EvolutionCapture,
    ClaudeMdEvolution,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl PipelineState {
    /// States a pipeline may legally move to from this one
    pub fn allowed_transitions(&self) -> &'static [PipelineState] {
        use PipelineState::*;
        match self {
            RequirementsInput => &[PlanGeneration, Failed, Cancelled, Paused],
            PlanGeneration => &[HumanReview, Failed, Cancelled, Paused],
            HumanReview => &[
                AdversarialReview,
                ContextPrep,
                PlanGeneration,
                Failed,
                Cancelled,
                Paused,
            ],
            AdversarialReview => &[ContextPrep, PlanGeneration, Failed, Cancelled, Paused],
            ContextPrep => &[ParallelExecution, Failed, Cancelled, Paused],
            ParallelExecution => &[Testing, Failed, Cancelled, Paused],
            Testing => &[CodeReview, Failed, Cancelled, Paused],
            CodeReview => &[GitIntegration, Failed, Cancelled, Paused],
            GitIntegration => &[EvolutionCapture, Failed, Cancelled, Paused],
            EvolutionCapture => &[ClaudeMdEvolution, Failed, Cancelled, Paused],
            ClaudeMdEvolution => &[Completed, Failed, Cancelled, Paused],
            // Paused resumes into any working state
            Paused => &[
                RequirementsInput,
                PlanGeneration,
                HumanReview,
                AdversarialReview,
                ContextPrep,
                ParallelExecution,
                Testing,
                CodeReview,
                GitIntegration,
                EvolutionCapture,
                ClaudeMdEvolution,
                Failed,
                Cancelled,
            ],
            Completed | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: PipelineState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// Terminal states are historical records; nothing moves out of them
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Actively progressing (not terminal, not paused)
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && !matches!(self, Self::Paused)
    }

    /// Waiting on a human decision rather than on agent work
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::HumanReview)
    }

    /// Eligible for crash recovery or pause-resume
    pub fn can_resume(&self) -> bool {
        !self.is_terminal()
    }

    /// The stage kind launched when a pipeline enters this state
    pub fn stage_kind(&self) -> Option<StageKind> {
        match self {
            Self::PlanGeneration => Some(StageKind::PlanGeneration),
            Self::HumanReview => Some(StageKind::HumanReview),
            Self::AdversarialReview => Some(StageKind::AdversarialReview),
            Self::ContextPrep => Some(StageKind::ContextPrep),
            Self::ParallelExecution => Some(StageKind::ParallelExecution),
            Self::Testing => Some(StageKind::Testing),
            Self::CodeReview => Some(StageKind::CodeReview),
            Self::GitIntegration => Some(StageKind::GitIntegration),
            Self::EvolutionCapture => Some(StageKind::EvolutionCapture),
            Self::ClaudeMdEvolution => Some(StageKind::ClaudeMdEvolution),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RequirementsInput => "requirements_input",
            Self::PlanGeneration => "plan_generation",
            Self::HumanReview => "human_review",
            Self::AdversarialReview => "adversarial_review",
            Self::ContextPrep => "context_prep",
            Self::ParallelExecution => "parallel_execution",
            Self::Testing => "testing",
            Self::CodeReview => "code_review",
            Self::GitIntegration => "git_integration",
            Self::EvolutionCapture => "evolution_capture",
            Self::ClaudeMdEvolution => "claude_md_evolution",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for PipelineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requirements_input" => Ok(Self::RequirementsInput),
            "plan_generation" => Ok(Self::PlanGeneration),
            "human_review" => Ok(Self::HumanReview),
            "adversarial_review" => Ok(Self::AdversarialReview),
            "context_prep" => Ok(Self::ContextPrep),
            "parallel_execution" => Ok(Self::ParallelExecution),
            "testing" => Ok(Self::Testing),
            "code_review" => Ok(Self::CodeReview),
            "git_integration" => Ok(Self::GitIntegration),
            "evolution_capture" => Ok(Self::EvolutionCapture),
            "claude_md_evolution" => Ok(Self::ClaudeMdEvolution),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Invalid pipeline state: {}", s)),
        }
    }
}

/// Stage type: one per working pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    PlanGeneration,
    HumanReview,
    AdversarialReview,
    ContextPrep,
    ParallelExecution,
    Testing,
    CodeReview,
    GitIntegration,
    EvolutionCapture,
    ClaudeMdEvolution,
}

impl StageKind {
    /// The pipeline state a stage of this kind runs under
    pub fn pipeline_state(&self) -> PipelineState {
        match self {
            Self::PlanGeneration => PipelineState::PlanGeneration,
            Self::HumanReview => PipelineState::HumanReview,
            Self::AdversarialReview => PipelineState::AdversarialReview,
            Self::ContextPrep => PipelineState::ContextPrep,
            Self::ParallelExecution => PipelineState::ParallelExecution,
            Self::Testing => PipelineState::Testing,
            Self::CodeReview => PipelineState::CodeReview,
            Self::GitIntegration => PipelineState::GitIntegration,
            Self::EvolutionCapture => PipelineState::EvolutionCapture,
            Self::ClaudeMdEvolution => PipelineState::ClaudeMdEvolution,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pipeline_state())
    }
}

/// Lifecycle of one stage occurrence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_edges_exist() {
        use PipelineState::*;
        let order = [
            RequirementsInput,
            PlanGeneration,
            HumanReview,
            ContextPrep,
            ParallelExecution,
            Testing,
            CodeReview,
            GitIntegration,
            EvolutionCapture,
            ClaudeMdEvolution,
            Completed,
        ];
        for pair in order.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "missing edge {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_review_loop_edges() {
        assert!(PipelineState::HumanReview.can_transition_to(PipelineState::AdversarialReview));
        assert!(PipelineState::HumanReview.can_transition_to(PipelineState::PlanGeneration));
        assert!(PipelineState::AdversarialReview.can_transition_to(PipelineState::PlanGeneration));
        assert!(PipelineState::AdversarialReview.can_transition_to(PipelineState::ContextPrep));
    }

    #[test]
    fn test_terminal_states_have_no_edges() {
        assert!(PipelineState::Completed.allowed_transitions().is_empty());
        assert!(PipelineState::Failed.allowed_transitions().is_empty());
        assert!(PipelineState::Cancelled.allowed_transitions().is_empty());
        assert!(PipelineState::Completed.is_terminal());
        assert!(!PipelineState::Paused.is_terminal());
    }

    #[test]
    fn test_no_skipping_stages() {
        assert!(!PipelineState::PlanGeneration.can_transition_to(PipelineState::Testing));
        assert!(!PipelineState::ContextPrep.can_transition_to(PipelineState::Completed));
        assert!(!PipelineState::RequirementsInput.can_transition_to(PipelineState::HumanReview));
    }

    #[test]
    fn test_pause_and_resume_edges() {
        assert!(PipelineState::Testing.can_transition_to(PipelineState::Paused));
        assert!(PipelineState::Paused.can_transition_to(PipelineState::Testing));
        assert!(PipelineState::Paused.can_transition_to(PipelineState::Cancelled));
        assert!(!PipelineState::Paused.can_transition_to(PipelineState::Completed));
        assert!(PipelineState::Paused.can_resume());
    }

    #[test]
    fn test_display_round_trip() {
        let all = [
            PipelineState::RequirementsInput,
            PipelineState::PlanGeneration,
            PipelineState::HumanReview,
            PipelineState::AdversarialReview,
            PipelineState::ContextPrep,
            PipelineState::ParallelExecution,
            PipelineState::Testing,
            PipelineState::CodeReview,
            PipelineState::GitIntegration,
            PipelineState::EvolutionCapture,
            PipelineState::ClaudeMdEvolution,
            PipelineState::Completed,
            PipelineState::Failed,
            PipelineState::Cancelled,
            PipelineState::Paused,
        ];
        for state in all {
            let parsed: PipelineState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("warming_up".parse::<PipelineState>().is_err());
    }

    #[test]
    fn test_stage_kind_mapping() {
        assert_eq!(
            PipelineState::Testing.stage_kind(),
            Some(StageKind::Testing)
        );
        assert_eq!(PipelineState::Completed.stage_kind(), None);
        assert_eq!(PipelineState::Paused.stage_kind(), None);
        assert_eq!(
            StageKind::GitIntegration.pipeline_state(),
            PipelineState::GitIntegration
        );
    }

    #[test]
    fn test_requires_human() {
        assert!(PipelineState::HumanReview.requires_human());
        assert!(!PipelineState::Testing.requires_human());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&PipelineState::ClaudeMdEvolution).unwrap();
        assert_eq!(json, "\"claude_md_evolution\"");
        let back: PipelineState = serde_json::from_str("\"parallel_execution\"").unwrap();
        assert_eq!(back, PipelineState::ParallelExecution);
    }
}
