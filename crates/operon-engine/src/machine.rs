//! Pure pipeline state machine.
//!
//! `transition` maps (state, event) to (next state, actions) and nothing
//! else: no I/O, no persistence, no clocks. The engine feeds it events
//! and performs the returned actions in order. Unmatched pairs absorb:
//! the state is returned unchanged with no actions, so a duplicate or
//! stale event replayed after crash recovery can never corrupt a
//! pipeline or push it outside the fixed state enumeration.

use operon_core::{PipelineState, PlanId, StageKind};

/// Everything that can happen to a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Requirements accepted; begin planning
    Start,
    /// Planning run produced a plan version awaiting review
    PlanReady { plan_id: PlanId, version: u32 },
    ReviewApproved { adversarial_enabled: bool },
    ReviewEdited { feedback: String },
    ReviewRejected,
    AdversarialApproved,
    AdversarialChangesRequested { feedback: String },
    ContextReady,
    ExecutionFinished,
    TestingPassed,
    CodeReviewFinished,
    IntegrationFinished { all_merged: bool },
    EvolutionCaptured,
    ClaudeMdUpdated,
    /// A stage exhausted its retries or failed fatally
    StageFailed { error: String },
    /// Budget ceiling crossed; fatal by policy
    OverBudget { detail: String },
    Paused,
    Resumed { target: PipelineState },
    Cancelled,
}

/// Side effects the engine must perform after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    /// Open a stage row and dispatch its work
    StartStage(StageKind),
    /// Announce the latest plan and wait for a human decision
    RequestPlanReview,
    /// Human asked for changes: bump the replan counter, carry feedback
    RevisePlanFromHuman { feedback: String },
    /// Adversarial reviewer asked for changes
    RevisePlanFromAdversarial { feedback: String },
    /// Terminate every live agent subprocess of this pipeline
    KillActiveRuns,
    /// Force-resolve all pending gates of this pipeline
    ExpireGates,
    /// Persist the failure cause and mark the running stage failed
    RecordFailure { error: String },
    /// Remember where we paused so resume can return there
    RecordPause { from: PipelineState },
    /// Some tasks were skipped during integration; note it
    FlagPartialIntegration,
    NotifyCompletion,
}

/// Computes the next state and required actions for one event.
pub fn transition(state: PipelineState, event: &EngineEvent) -> (PipelineState, Vec<EngineAction>) {
    use EngineAction as A;
    use EngineEvent as E;
    use PipelineState as S;

    // Terminal states are historical records; they absorb everything.
    if state.is_terminal() {
        return (state, vec![]);
    }

    match (state, event) {
        // Cross-cutting events first: these apply in any live state.
        (s, E::OverBudget { detail }) if s.is_active() => (
            S::Failed,
            vec![
                A::KillActiveRuns,
                A::ExpireGates,
                A::RecordFailure {
                    error: format!("Budget exceeded: {}", detail),
                },
            ],
        ),
        (s, E::StageFailed { error }) if s.is_active() => (
            S::Failed,
            vec![
                A::KillActiveRuns,
                A::ExpireGates,
                A::RecordFailure {
                    error: error.clone(),
                },
            ],
        ),
        (s, E::Cancelled) => (S::Cancelled, vec![A::KillActiveRuns, A::ExpireGates]),
        (s, E::Paused) if s.is_active() => (
            S::Paused,
            vec![A::KillActiveRuns, A::RecordPause { from: s }],
        ),

        // The stage sequence.
        (S::RequirementsInput, E::Start) => (
            S::PlanGeneration,
            vec![A::StartStage(StageKind::PlanGeneration)],
        ),
        (S::PlanGeneration, E::PlanReady { .. }) => (S::HumanReview, vec![A::RequestPlanReview]),
        (
            S::HumanReview,
            E::ReviewApproved {
                adversarial_enabled: true,
            },
        ) => (
            S::AdversarialReview,
            vec![A::StartStage(StageKind::AdversarialReview)],
        ),
        (
            S::HumanReview,
            E::ReviewApproved {
                adversarial_enabled: false,
            },
        ) => (S::ContextPrep, vec![A::StartStage(StageKind::ContextPrep)]),
        (S::HumanReview, E::ReviewEdited { feedback }) => (
            S::PlanGeneration,
            vec![
                A::RevisePlanFromHuman {
                    feedback: feedback.clone(),
                },
                A::StartStage(StageKind::PlanGeneration),
            ],
        ),
        (S::HumanReview, E::ReviewRejected) => {
            (S::Cancelled, vec![A::KillActiveRuns, A::ExpireGates])
        }
        (S::AdversarialReview, E::AdversarialApproved) => {
            (S::ContextPrep, vec![A::StartStage(StageKind::ContextPrep)])
        }
        (S::AdversarialReview, E::AdversarialChangesRequested { feedback }) => (
            S::PlanGeneration,
            vec![
                A::RevisePlanFromAdversarial {
                    feedback: feedback.clone(),
                },
                A::StartStage(StageKind::PlanGeneration),
            ],
        ),
        (S::ContextPrep, E::ContextReady) => (
            S::ParallelExecution,
            vec![A::StartStage(StageKind::ParallelExecution)],
        ),
        (S::ParallelExecution, E::ExecutionFinished) => {
            (S::Testing, vec![A::StartStage(StageKind::Testing)])
        }
        (S::Testing, E::TestingPassed) => {
            (S::CodeReview, vec![A::StartStage(StageKind::CodeReview)])
        }
        (S::CodeReview, E::CodeReviewFinished) => (
            S::GitIntegration,
            vec![A::StartStage(StageKind::GitIntegration)],
        ),
        (S::GitIntegration, E::IntegrationFinished { all_merged }) => {
            let mut actions = Vec::new();
            if !all_merged {
                actions.push(A::FlagPartialIntegration);
            }
            actions.push(A::StartStage(StageKind::EvolutionCapture));
            (S::EvolutionCapture, actions)
        }
        (S::EvolutionCapture, E::EvolutionCaptured) => (
            S::ClaudeMdEvolution,
            vec![A::StartStage(StageKind::ClaudeMdEvolution)],
        ),
        (S::ClaudeMdEvolution, E::ClaudeMdUpdated) => (S::Completed, vec![A::NotifyCompletion]),

        // Resume re-enters the recorded state and restarts its work.
        (S::Paused, E::Resumed { target }) if S::Paused.can_transition_to(*target) => {
            let actions = match target.stage_kind() {
                Some(StageKind::HumanReview) => vec![A::RequestPlanReview],
                Some(kind) => vec![A::StartStage(kind)],
                None => vec![],
            };
            (*target, actions)
        }

        // Anything else is a stale or duplicate event: absorb.
        (s, _) => (s, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EngineAction as A;
    use EngineEvent as E;
    use PipelineState as S;

    fn plan_ready() -> E {
        E::PlanReady {
            plan_id: "plan-1".to_string(),
            version: 1,
        }
    }

    #[test]
    fn test_happy_path_to_completion() {
        let steps: Vec<(S, E, S)> = vec![
            (S::RequirementsInput, E::Start, S::PlanGeneration),
            (S::PlanGeneration, plan_ready(), S::HumanReview),
            (
                S::HumanReview,
                E::ReviewApproved {
                    adversarial_enabled: true,
                },
                S::AdversarialReview,
            ),
            (S::AdversarialReview, E::AdversarialApproved, S::ContextPrep),
            (S::ContextPrep, E::ContextReady, S::ParallelExecution),
            (S::ParallelExecution, E::ExecutionFinished, S::Testing),
            (S::Testing, E::TestingPassed, S::CodeReview),
            (S::CodeReview, E::CodeReviewFinished, S::GitIntegration),
            (
                S::GitIntegration,
                E::IntegrationFinished { all_merged: true },
                S::EvolutionCapture,
            ),
            (
                S::EvolutionCapture,
                E::EvolutionCaptured,
                S::ClaudeMdEvolution,
            ),
            (S::ClaudeMdEvolution, E::ClaudeMdUpdated, S::Completed),
        ];
        for (from, event, expected) in steps {
            let (next, _) = transition(from, &event);
            assert_eq!(next, expected, "{:?} on {:?}", from, event);
            assert!(
                from.can_transition_to(next),
                "machine produced a forbidden edge {} -> {}",
                from,
                next
            );
        }
    }

    #[test]
    fn test_approval_skips_adversarial_when_disabled() {
        let (next, actions) = transition(
            S::HumanReview,
            &E::ReviewApproved {
                adversarial_enabled: false,
            },
        );
        assert_eq!(next, S::ContextPrep);
        assert_eq!(actions, vec![A::StartStage(StageKind::ContextPrep)]);
    }

    #[test]
    fn test_edit_returns_to_planning_with_feedback() {
        let (next, actions) = transition(
            S::HumanReview,
            &E::ReviewEdited {
                feedback: "add pagination".to_string(),
            },
        );
        assert_eq!(next, S::PlanGeneration);
        assert_eq!(
            actions[0],
            A::RevisePlanFromHuman {
                feedback: "add pagination".to_string()
            }
        );
        assert_eq!(actions[1], A::StartStage(StageKind::PlanGeneration));
    }

    #[test]
    fn test_reject_cancels_and_cleans_up() {
        let (next, actions) = transition(S::HumanReview, &E::ReviewRejected);
        assert_eq!(next, S::Cancelled);
        assert!(actions.contains(&A::KillActiveRuns));
        assert!(actions.contains(&A::ExpireGates));
    }

    #[test]
    fn test_adversarial_changes_loop_back_to_planning() {
        let (next, actions) = transition(
            S::AdversarialReview,
            &E::AdversarialChangesRequested {
                feedback: "tighten error handling".to_string(),
            },
        );
        assert_eq!(next, S::PlanGeneration);
        assert!(matches!(
            &actions[0],
            A::RevisePlanFromAdversarial { feedback } if feedback == "tighten error handling"
        ));
    }

    #[test]
    fn test_partial_integration_is_flagged() {
        let (next, actions) =
            transition(S::GitIntegration, &E::IntegrationFinished { all_merged: false });
        assert_eq!(next, S::EvolutionCapture);
        assert_eq!(actions[0], A::FlagPartialIntegration);
        assert_eq!(actions[1], A::StartStage(StageKind::EvolutionCapture));
    }

    #[test]
    fn test_over_budget_fails_from_any_active_state() {
        for state in [
            S::PlanGeneration,
            S::ParallelExecution,
            S::Testing,
            S::GitIntegration,
        ] {
            let (next, actions) = transition(
                state,
                &E::OverBudget {
                    detail: "12.00 > 10.00".to_string(),
                },
            );
            assert_eq!(next, S::Failed, "from {:?}", state);
            assert!(actions.contains(&A::KillActiveRuns));
            assert!(matches!(
                actions.last(),
                Some(A::RecordFailure { error }) if error.contains("Budget exceeded")
            ));
        }
    }

    #[test]
    fn test_stage_failure_records_the_cause() {
        let (next, actions) = transition(
            S::Testing,
            &E::StageFailed {
                error: "testing timed out after 3 attempts".to_string(),
            },
        );
        assert_eq!(next, S::Failed);
        assert!(matches!(
            actions.last(),
            Some(A::RecordFailure { error }) if error.contains("timed out")
        ));
    }

    #[test]
    fn test_pause_records_origin_and_kills_runs() {
        let (next, actions) = transition(S::ParallelExecution, &E::Paused);
        assert_eq!(next, S::Paused);
        assert_eq!(actions[0], A::KillActiveRuns);
        assert_eq!(
            actions[1],
            A::RecordPause {
                from: S::ParallelExecution
            }
        );
    }

    #[test]
    fn test_resume_restarts_the_paused_stage() {
        let (next, actions) = transition(
            S::Paused,
            &E::Resumed {
                target: S::Testing,
            },
        );
        assert_eq!(next, S::Testing);
        assert_eq!(actions, vec![A::StartStage(StageKind::Testing)]);
    }

    #[test]
    fn test_resume_into_review_reasks_for_the_decision() {
        let (next, actions) = transition(
            S::Paused,
            &E::Resumed {
                target: S::HumanReview,
            },
        );
        assert_eq!(next, S::HumanReview);
        assert_eq!(actions, vec![A::RequestPlanReview]);
    }

    #[test]
    fn test_resume_to_forbidden_target_absorbs() {
        let (next, actions) = transition(
            S::Paused,
            &E::Resumed {
                target: S::Completed,
            },
        );
        assert_eq!(next, S::Paused);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_cancel_works_from_paused() {
        let (next, actions) = transition(S::Paused, &E::Cancelled);
        assert_eq!(next, S::Cancelled);
        assert!(actions.contains(&A::ExpireGates));
    }

    #[test]
    fn test_terminal_states_absorb_everything() {
        let events = [
            E::Start,
            plan_ready(),
            E::Cancelled,
            E::Paused,
            E::StageFailed {
                error: "late".to_string(),
            },
            E::OverBudget {
                detail: "late".to_string(),
            },
        ];
        for state in [S::Completed, S::Failed, S::Cancelled] {
            for event in &events {
                let (next, actions) = transition(state, event);
                assert_eq!(next, state, "{:?} must absorb {:?}", state, event);
                assert!(actions.is_empty());
            }
        }
    }

    #[test]
    fn test_stale_events_absorb_without_actions() {
        // Duplicate completion event from a previous stage
        let (next, actions) = transition(S::Testing, &E::ExecutionFinished);
        assert_eq!(next, S::Testing);
        assert!(actions.is_empty());

        // Review decisions outside review
        let (next, _) = transition(
            S::ParallelExecution,
            &E::ReviewApproved {
                adversarial_enabled: true,
            },
        );
        assert_eq!(next, S::ParallelExecution);
    }

    #[test]
    fn test_every_transition_stays_inside_the_enumeration() {
        // A sweep across all state/event pairs: whatever comes out must
        // be either the same state or an allowed edge.
        let states = [
            S::RequirementsInput,
            S::PlanGeneration,
            S::HumanReview,
            S::AdversarialReview,
            S::ContextPrep,
            S::ParallelExecution,
            S::Testing,
            S::CodeReview,
            S::GitIntegration,
            S::EvolutionCapture,
            S::ClaudeMdEvolution,
            S::Completed,
            S::Failed,
            S::Cancelled,
            S::Paused,
        ];
        let events = [
            E::Start,
            plan_ready(),
            E::ReviewApproved {
                adversarial_enabled: true,
            },
            E::ReviewEdited {
                feedback: "f".to_string(),
            },
            E::ReviewRejected,
            E::AdversarialApproved,
            E::AdversarialChangesRequested {
                feedback: "f".to_string(),
            },
            E::ContextReady,
            E::ExecutionFinished,
            E::TestingPassed,
            E::CodeReviewFinished,
            E::IntegrationFinished { all_merged: true },
            E::EvolutionCaptured,
            E::ClaudeMdUpdated,
            E::StageFailed {
                error: "e".to_string(),
            },
            E::OverBudget {
                detail: "d".to_string(),
            },
            E::Paused,
            E::Resumed { target: S::Testing },
            E::Cancelled,
        ];
        for state in states {
            for event in &events {
                let (next, _) = transition(state, event);
                assert!(
                    next == state || state.can_transition_to(next),
                    "illegal edge {} -> {} on {:?}",
                    state,
                    next,
                    event
                );
            }
        }
    }
}
