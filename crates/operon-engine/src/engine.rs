//! The pipeline engine: one durable loop around a pure transition table.
//!
//! [`PipelineEngine::run`] advances a pipeline one stage at a time. Each
//! iteration checks the budget, executes the stage for the current state
//! under the supervisor, maps the outcome to an [`EngineEvent`] and
//! applies it through [`transition`]. The loop parks at human review and
//! stops on terminal states; everything else is crash-recoverable
//! because each step is persisted before it is acted on: review
//! decisions land on the plan row before the transition fires, worktrees
//! carry deterministic names so a half-built context is adopted rather
//! than rebuilt, and every stage attempt gets its own row.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use operon_agent::{AgentSpawner, PermissionMode, SpawnSpec};
use operon_core::{
    EventBus, EvolutionKind, EvolutionLog, Intervention, MemoryEntry, MemoryKind, MemoryLayer,
    ModelPerformance, OperonConfig, OperonError, Pipeline, PipelineEvent, PipelineId,
    PipelineState, Plan, PlanDecision, PlannedTask, Result, Stage, StageKind, StageState,
    StateStore, Task, TaskState,
};
use operon_gate::{GateManager, EXPIRED_ANSWER};
use operon_git::{
    branch_for_task, GitExecutor, MergeAttempt, MergeOps, WorktreeInfo, WorktreeManager,
};
use operon_ledger::CostLedger;
use tracing::{debug, error, info, instrument, warn};

use crate::machine::{transition, EngineAction, EngineEvent};
use crate::merge::MergeCoordinator;
use crate::prompts;
use crate::recovery;
use crate::skills::assign_skills;
use crate::stages::{tail_excerpt, RunOutcome, StageRunner};
use crate::supervisor::StageSupervisor;

/// Worktree title for the pipeline's own CLAUDE.md update.
const CLAUDE_MD_TITLE: &str = "claude md update";

/// Characters of transcript kept as a task's result summary.
const SUMMARY_CHARS: usize = 2000;

/// Characters of retrospective transcript kept as a memory entry.
const MEMORY_CHARS: usize = 4000;

/// Map plan-declared task sizing onto a model tier.
fn tier_for_complexity(complexity: &str) -> &'static str {
    match complexity {
        "simple" => "economical",
        "complex" => "most_capable",
        _ => "balanced",
    }
}

/// Flag models that failed more than half of at least three recorded
/// runs. Text only; routing config is never changed automatically.
fn routing_recommendation(records: &[ModelPerformance]) -> Option<String> {
    let mut by_model: BTreeMap<&str, (u32, u32)> = BTreeMap::new();
    for record in records {
        let entry = by_model.entry(record.model.as_str()).or_default();
        entry.1 += 1;
        if !record.success {
            entry.0 += 1;
        }
    }

    let lines: Vec<String> = by_model
        .iter()
        .filter(|(_, (failures, total))| *total >= 3 && failures * 2 > *total)
        .map(|(model, (failures, total))| {
            format!(
                "{} failed {}/{} recorded runs; route its task tier to a stronger model",
                model, failures, total
            )
        })
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Owns every collaborator and drives pipelines through their stages.
pub struct PipelineEngine<E, A>
where
    E: GitExecutor + Clone + 'static,
    A: AgentSpawner + 'static,
{
    store: Arc<StateStore>,
    config: OperonConfig,
    bus: EventBus,
    gates: Arc<GateManager>,
    ledger: Arc<CostLedger>,
    runner: Arc<StageRunner<A>>,
    agents: Arc<A>,
    executor: E,
    worktrees: WorktreeManager<E>,
    merges: MergeCoordinator<E, A>,
    supervisor: StageSupervisor,
}

impl<E, A> PipelineEngine<E, A>
where
    E: GitExecutor + Clone + 'static,
    A: AgentSpawner + 'static,
{
    pub fn new(
        store: Arc<StateStore>,
        config: OperonConfig,
        bus: EventBus,
        gates: Arc<GateManager>,
        executor: E,
        agents: Arc<A>,
    ) -> Self {
        let ledger = Arc::new(CostLedger::new(store.clone(), bus.clone()));
        let runner = Arc::new(StageRunner::new(
            agents.clone(),
            store.clone(),
            ledger.clone(),
            bus.clone(),
        ));
        let merges = MergeCoordinator::new(
            executor.clone(),
            runner.clone(),
            store.clone(),
            gates.clone(),
            bus.clone(),
            config.merge.clone(),
        );
        let supervisor = StageSupervisor::from_config(&config.limits, gates.hold_counter());
        let worktrees = WorktreeManager::new(executor.clone());
        Self {
            store,
            config,
            bus,
            gates,
            ledger,
            runner,
            agents,
            executor,
            worktrees,
            merges,
            supervisor,
        }
    }

    pub fn store(&self) -> Arc<StateStore> {
        self.store.clone()
    }

    pub fn gates(&self) -> Arc<GateManager> {
        self.gates.clone()
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn config(&self) -> &OperonConfig {
        &self.config
    }

    /// Create a pipeline row for `requirements` under `project_id`.
    ///
    /// The row starts in `requirements_input` and is not driven until
    /// [`run`](Self::run) is called.
    #[instrument(skip(self, requirements))]
    pub async fn submit(&self, project_id: &str, requirements: &str) -> Result<Pipeline> {
        let project = self.store.load_project(project_id).await?;
        let mut pipeline = Pipeline::new(project.id.clone(), requirements);
        if let Some(model) = &project.default_model {
            pipeline = pipeline.with_model(model.clone());
        }
        self.store.save_pipeline(&pipeline).await?;
        info!(pipeline_id = %pipeline.id, project = %project.name, "Pipeline submitted");
        Ok(pipeline)
    }

    /// Drive the pipeline forward until it parks at human review or
    /// reaches a terminal state.
    ///
    /// Safe to call on a pipeline in any state: terminal and paused rows
    /// return untouched, and a review decision persisted before a crash
    /// is replayed instead of asked for again.
    #[instrument(skip(self))]
    pub async fn run(&self, pipeline_id: &str) -> Result<Pipeline> {
        let mut pipeline = self.store.load_pipeline(pipeline_id).await?;
        let mut applied_any = false;

        if pipeline.state == PipelineState::RequirementsInput {
            pipeline = self.apply(pipeline_id, EngineEvent::Start).await?;
            applied_any = true;
        }

        loop {
            if pipeline.state.is_terminal() || pipeline.state == PipelineState::Paused {
                return Ok(pipeline);
            }

            if pipeline.state == PipelineState::HumanReview {
                let plan = self.store.latest_plan(pipeline_id).await?;
                let Some(decision) = plan.as_ref().and_then(|p| p.decision) else {
                    // Re-announce only when entering an already-parked
                    // pipeline; the transition into review announced once.
                    if !applied_any {
                        self.announce_pending_review(&pipeline).await?;
                    }
                    return Ok(pipeline);
                };
                let feedback = plan.and_then(|p| p.human_feedback);
                let event = self.review_event(&pipeline, decision, feedback).await?;
                pipeline = self.apply(pipeline_id, event).await?;
                applied_any = true;
                continue;
            }

            let status = self.ledger.check(pipeline_id).await?;
            if !status.within_budget {
                let detail = format!(
                    "${:.2} spent of ${:.2} budget",
                    status.total_cost_usd, status.max_budget_usd
                );
                pipeline = self
                    .apply(pipeline_id, EngineEvent::OverBudget { detail })
                    .await?;
                applied_any = true;
                continue;
            }

            let event = match self.drive_stage(&pipeline).await {
                Ok(event) => event,
                Err(OperonError::BudgetExceeded(detail)) => EngineEvent::OverBudget { detail },
                Err(err) => EngineEvent::StageFailed {
                    error: err.to_string(),
                },
            };
            pipeline = self.apply(pipeline_id, event).await?;
            applied_any = true;
        }
    }

    /// Record a human review decision and advance the pipeline.
    ///
    /// The decision is persisted on the plan row before the transition
    /// fires, so a crash in between is replayed by [`run`](Self::run).
    /// The caller drives the pipeline afterwards; this only applies the
    /// resulting event.
    #[instrument(skip(self, feedback))]
    pub async fn handle_plan_review(
        &self,
        pipeline_id: &str,
        decision: PlanDecision,
        feedback: Option<String>,
    ) -> Result<Pipeline> {
        let pipeline = self.store.load_pipeline(pipeline_id).await?;
        if pipeline.state != PipelineState::HumanReview {
            return Err(OperonError::InvalidState(format!(
                "Pipeline {} is in {}, not awaiting review",
                pipeline_id, pipeline.state
            )));
        }
        let mut plan = self.store.latest_plan(pipeline_id).await?.ok_or_else(|| {
            OperonError::EntityNotFound(format!("No plan for pipeline {}", pipeline_id))
        })?;
        if plan.decision.is_some() {
            return Err(OperonError::GateAlreadyResolved(plan.id.clone()));
        }

        plan.decision = Some(decision);
        if decision == PlanDecision::Edit {
            plan.human_feedback = feedback.clone();
        }
        self.store.save_plan(&plan).await?;
        info!(pipeline_id, ?decision, version = plan.version, "Review decision recorded");

        let event = self.review_event(&pipeline, decision, feedback).await?;
        self.apply(pipeline_id, event).await
    }

    /// Park an active pipeline, killing its runs. Open gates stay
    /// pending so their answers survive the pause.
    #[instrument(skip(self))]
    pub async fn pause(&self, pipeline_id: &str) -> Result<Pipeline> {
        let pipeline = self.store.load_pipeline(pipeline_id).await?;
        if !pipeline.state.is_active() {
            return Err(OperonError::InvalidState(format!(
                "Cannot pause pipeline in state {}",
                pipeline.state
            )));
        }
        self.apply(pipeline_id, EngineEvent::Paused).await
    }

    /// Wake a paused pipeline into the state it was paused from, then
    /// drive it.
    #[instrument(skip(self))]
    pub async fn resume(&self, pipeline_id: &str) -> Result<Pipeline> {
        let pipeline = self.store.load_pipeline(pipeline_id).await?;
        if pipeline.state.is_terminal() {
            return Err(OperonError::InvalidState(format!(
                "Cannot resume pipeline in state {}",
                pipeline.state
            )));
        }
        if pipeline.state != PipelineState::Paused {
            return self.run(pipeline_id).await;
        }

        let target = pipeline
            .paused_from_state
            .unwrap_or(PipelineState::RequirementsInput);
        let mut resumed = self
            .apply(pipeline_id, EngineEvent::Resumed { target })
            .await?;
        if resumed.state == PipelineState::Paused {
            return Err(OperonError::InvalidState(format!(
                "Pipeline {} could not resume into {}",
                pipeline_id, target
            )));
        }
        resumed.paused_from_state = None;
        resumed.touch();
        self.store.save_pipeline(&resumed).await?;
        self.bus.emit(PipelineEvent::PipelineResumed {
            pipeline_id: pipeline_id.to_string(),
            reentry_count: resumed.reentry_count,
        });
        info!(pipeline_id, %target, "Pipeline resumed");
        self.run(pipeline_id).await
    }

    /// Cancel a pipeline. Active runs are killed before the row goes
    /// terminal so nothing keeps spending afterwards.
    #[instrument(skip(self))]
    pub async fn cancel(&self, pipeline_id: &str) -> Result<Pipeline> {
        let pipeline = self.store.load_pipeline(pipeline_id).await?;
        if pipeline.state.is_terminal() {
            return Err(OperonError::InvalidState(format!(
                "Pipeline {} is already {}",
                pipeline_id, pipeline.state
            )));
        }
        let killed = self.runner.kill_pipeline_runs(pipeline_id).await;
        if killed > 0 {
            info!(pipeline_id, killed, "Killed active runs before cancellation");
        }
        self.apply(pipeline_id, EngineEvent::Cancelled).await
    }

    /// Kill one agent run by id. Returns whether a run was signalled.
    pub async fn kill_run(&self, run_id: &str) -> bool {
        self.agents.kill(run_id).await
    }

    /// Resume every unfinished pipeline after a process restart,
    /// staggered so the first agent spawns don't land at once. Paused
    /// pipelines get their reentry recorded but stay paused.
    #[instrument(skip(self))]
    pub async fn recover_all(self: &Arc<Self>) -> Result<Vec<PipelineId>> {
        let ids = recovery::scan_unfinished(&self.store).await?;
        for (index, pipeline_id) in ids.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.process.resume_stagger_ms))
                    .await;
            }
            let mut pipeline = self.store.load_pipeline(pipeline_id).await?;
            pipeline.reentry_count += 1;
            pipeline.touch();
            self.store.save_pipeline(&pipeline).await?;
            self.bus.emit(PipelineEvent::PipelineResumed {
                pipeline_id: pipeline_id.clone(),
                reentry_count: pipeline.reentry_count,
            });
            info!(
                pipeline_id = %pipeline_id,
                reentry = pipeline.reentry_count,
                state = %pipeline.state,
                "Recovering pipeline"
            );

            let engine = Arc::clone(self);
            let id = pipeline_id.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.run(&id).await {
                    error!(pipeline_id = %id, %err, "Recovered pipeline run failed");
                }
            });
        }
        Ok(ids)
    }

    /// Apply one event through the transition table and perform the
    /// actions it produces. Returns the pipeline as persisted afterwards.
    #[instrument(skip(self, event))]
    pub async fn apply(&self, pipeline_id: &str, event: EngineEvent) -> Result<Pipeline> {
        let pipeline = self.store.load_pipeline(pipeline_id).await?;
        let from = pipeline.state;
        let (next, actions) = transition(from, &event);

        if next != from {
            let mut updated = pipeline;
            updated.state = next;
            updated.touch();
            self.store.save_pipeline(&updated).await?;
            self.bus.emit(PipelineEvent::StateChanged {
                pipeline_id: pipeline_id.to_string(),
                from,
                to: next,
            });
            info!(pipeline_id, %from, to = %next, "Pipeline state advanced");
        } else if actions.is_empty() {
            debug!(pipeline_id, state = %from, event = ?event, "Event absorbed");
        }

        for action in actions {
            self.perform(pipeline_id, &action).await?;
        }
        self.store.load_pipeline(pipeline_id).await
    }

    async fn perform(&self, pipeline_id: &str, action: &EngineAction) -> Result<()> {
        match action {
            EngineAction::StartStage(kind) => {
                // The run loop launches stages; the action only records intent.
                debug!(pipeline_id, %kind, "Stage queued by transition");
            }
            EngineAction::RequestPlanReview => {
                let pipeline = self.store.load_pipeline(pipeline_id).await?;
                self.announce_pending_review(&pipeline).await?;
            }
            EngineAction::RevisePlanFromHuman { feedback } => {
                self.prepare_replan(pipeline_id, Some(feedback.clone()), None)
                    .await?;
            }
            EngineAction::RevisePlanFromAdversarial { feedback } => {
                self.prepare_replan(pipeline_id, None, Some(feedback.clone()))
                    .await?;
            }
            EngineAction::KillActiveRuns => {
                let killed = self.runner.kill_pipeline_runs(pipeline_id).await;
                if killed > 0 {
                    info!(pipeline_id, killed, "Killed active runs");
                }
            }
            EngineAction::ExpireGates => {
                let expired = self.gates.expire_for_pipeline(pipeline_id).await?;
                if expired > 0 {
                    info!(pipeline_id, expired, "Expired open gates");
                }
            }
            EngineAction::RecordFailure { error } => {
                let mut pipeline = self.store.load_pipeline(pipeline_id).await?;
                pipeline.fail(error.clone());
                self.store.save_pipeline(&pipeline).await?;
                self.close_running_stages(pipeline_id, error).await?;
            }
            EngineAction::RecordPause { from } => {
                let mut pipeline = self.store.load_pipeline(pipeline_id).await?;
                pipeline.paused_from_state = Some(*from);
                pipeline.touch();
                self.store.save_pipeline(&pipeline).await?;
            }
            EngineAction::FlagPartialIntegration => {
                self.bus.emit(PipelineEvent::Notification {
                    pipeline_id: Some(pipeline_id.to_string()),
                    message: "Some task branches were skipped during integration".to_string(),
                });
            }
            EngineAction::NotifyCompletion => {
                self.bus.emit(PipelineEvent::Notification {
                    pipeline_id: Some(pipeline_id.to_string()),
                    message: "Pipeline completed".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Map a review decision onto its engine event, escalating an edit
    /// past the replan limit to a blocking intervention.
    async fn review_event(
        &self,
        pipeline: &Pipeline,
        decision: PlanDecision,
        feedback: Option<String>,
    ) -> Result<EngineEvent> {
        let approve = EngineEvent::ReviewApproved {
            adversarial_enabled: self.config.adversarial_review,
        };
        Ok(match decision {
            PlanDecision::Approve => approve,
            PlanDecision::Edit => {
                if pipeline.replan_count >= self.config.limits.replan_limit {
                    self.escalate_replan_limit(
                        pipeline,
                        feedback.as_deref().unwrap_or("(none)"),
                        approve,
                    )
                    .await?
                } else {
                    EngineEvent::ReviewEdited {
                        feedback: feedback.unwrap_or_default(),
                    }
                }
            }
            PlanDecision::Reject => EngineEvent::ReviewRejected,
        })
    }

    /// The replan loop is exhausted; ask a human whether to proceed with
    /// the current plan or stop. Parks until the intervention resolves.
    async fn escalate_replan_limit(
        &self,
        pipeline: &Pipeline,
        feedback: &str,
        approve: EngineEvent,
    ) -> Result<EngineEvent> {
        warn!(
            pipeline_id = %pipeline.id,
            replan_count = pipeline.replan_count,
            "Replan limit reached; escalating to a blocking intervention"
        );
        let question = format!(
            "Replan limit of {} reached. Answer 'proceed' to continue with the current plan \
             or anything else to cancel the pipeline.",
            self.config.limits.replan_limit
        );
        let intervention = Intervention::new(pipeline.id.clone(), question)
            .with_context(format!("Latest review feedback:\n{}", feedback));
        let response = self.gates.request_intervention(intervention).await?;

        if response == EXPIRED_ANSWER {
            return Err(OperonError::ReplanLimit(format!(
                "escalation expired for pipeline {}",
                pipeline.id
            )));
        }
        if response.trim().eq_ignore_ascii_case("proceed") {
            info!(pipeline_id = %pipeline.id, "Operator chose to proceed with the current plan");
            Ok(approve)
        } else {
            info!(pipeline_id = %pipeline.id, "Operator declined to proceed; cancelling");
            Ok(EngineEvent::Cancelled)
        }
    }

    async fn announce_pending_review(&self, pipeline: &Pipeline) -> Result<()> {
        if let Some(plan) = self.store.latest_plan(&pipeline.id).await? {
            self.bus.emit(PipelineEvent::PlanAwaitingReview {
                pipeline_id: pipeline.id.clone(),
                plan_id: plan.id.clone(),
                version: plan.version,
            });
        }
        Ok(())
    }

    /// Bump the replan counter and stash the feedback on the latest plan
    /// so the next plan_generation run can read it.
    async fn prepare_replan(
        &self,
        pipeline_id: &str,
        human: Option<String>,
        adversarial: Option<String>,
    ) -> Result<()> {
        let mut pipeline = self.store.load_pipeline(pipeline_id).await?;
        pipeline.replan_count += 1;
        pipeline.touch();
        self.store.save_pipeline(&pipeline).await?;

        if let Some(mut plan) = self.store.latest_plan(pipeline_id).await? {
            if human.is_some() {
                plan.human_feedback = human;
            }
            if adversarial.is_some() {
                plan.adversarial_feedback = adversarial;
            }
            self.store.save_plan(&plan).await?;
        }
        Ok(())
    }

    async fn close_running_stages(&self, pipeline_id: &str, error: &str) -> Result<()> {
        for mut stage in self.store.list_stages_for_pipeline(pipeline_id).await? {
            if stage.state == StageState::Running {
                stage.fail(error);
                self.store.save_stage(&stage).await?;
            }
        }
        Ok(())
    }

    /// Run the stage for the pipeline's current state under the
    /// supervisor and map its outcome to the next event.
    async fn drive_stage(&self, pipeline: &Pipeline) -> Result<EngineEvent> {
        let Some(kind) = pipeline.state.stage_kind() else {
            return Err(OperonError::InvalidState(format!(
                "No stage to run in state {}",
                pipeline.state
            )));
        };
        let label = kind.to_string();
        self.supervisor
            .supervise(&label, |attempt| {
                self.stage_attempt(pipeline, kind, attempt).boxed()
            })
            .await
    }

    /// One supervised attempt: open a stage row, execute, settle the row.
    async fn stage_attempt(
        &self,
        pipeline: &Pipeline,
        kind: StageKind,
        attempt: u32,
    ) -> Result<EngineEvent> {
        if attempt > 1 {
            self.reset_interrupted_work(&pipeline.id).await?;
        }

        let mut stage = Stage::new(pipeline.id.clone(), kind).with_attempt(attempt - 1);
        stage.start();
        self.store.save_stage(&stage).await?;
        self.bus.emit(PipelineEvent::StageStarted {
            pipeline_id: pipeline.id.clone(),
            kind,
            attempt: stage.attempt,
        });

        match self.execute_stage(pipeline, &stage).await {
            Ok(event) => {
                stage.complete();
                self.store.save_stage(&stage).await?;
                self.bus.emit(PipelineEvent::StageCompleted {
                    pipeline_id: pipeline.id.clone(),
                    kind,
                });
                Ok(event)
            }
            Err(err) => {
                stage.fail(err.to_string());
                self.store.save_stage(&stage).await?;
                self.bus.emit(PipelineEvent::StageFailed {
                    pipeline_id: pipeline.id.clone(),
                    kind,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// A timed-out attempt leaves rows mid-flight: runs still
    /// registered, stage rows open, tasks marked running. Settle them
    /// before the next attempt starts.
    async fn reset_interrupted_work(&self, pipeline_id: &str) -> Result<()> {
        let killed = self.runner.kill_pipeline_runs(pipeline_id).await;
        if killed > 0 {
            info!(pipeline_id, killed, "Killed runs left over from the previous attempt");
        }
        for mut stage in self.store.list_stages_for_pipeline(pipeline_id).await? {
            if stage.state == StageState::Running {
                stage.fail("Attempt abandoned after timeout or failure");
                self.store.save_stage(&stage).await?;
            }
        }
        for mut task in self.store.list_tasks_for_pipeline(pipeline_id).await? {
            if task.state == TaskState::Running {
                task.state = TaskState::Pending;
                task.touch();
                self.store.save_task(&task).await?;
            }
        }
        Ok(())
    }

    async fn execute_stage(&self, pipeline: &Pipeline, stage: &Stage) -> Result<EngineEvent> {
        match stage.kind {
            StageKind::PlanGeneration => self.plan_stage(pipeline).await,
            StageKind::AdversarialReview => self.adversarial_stage(pipeline).await,
            StageKind::ContextPrep => self.context_prep_stage(pipeline, stage).await,
            StageKind::ParallelExecution => self.execution_stage(pipeline).await,
            StageKind::Testing => self.testing_stage(pipeline).await,
            StageKind::CodeReview => self.code_review_stage(pipeline).await,
            StageKind::GitIntegration => self.integration_stage(pipeline).await,
            StageKind::EvolutionCapture => self.evolution_stage(pipeline).await,
            StageKind::ClaudeMdEvolution => self.claude_md_stage(pipeline).await,
            StageKind::HumanReview => Err(OperonError::InvalidState(
                "Human review is gate-driven, not stage-driven".to_string(),
            )),
        }
    }

    /// Generate (or regenerate) the plan and park it for review.
    async fn plan_stage(&self, pipeline: &Pipeline) -> Result<EngineEvent> {
        let previous = self.store.latest_plan(&pipeline.id).await?;
        let version = previous.as_ref().map(|p| p.version + 1).unwrap_or(1);
        let human_feedback = previous.as_ref().and_then(|p| p.human_feedback.clone());
        let adversarial_feedback = previous.as_ref().and_then(|p| p.adversarial_feedback.clone());

        let memory = self.store.list_memory(&pipeline.project_id, None).await?;
        let prompt = prompts::plan_prompt(
            &pipeline.requirements,
            human_feedback.as_deref(),
            adversarial_feedback.as_deref(),
            &memory,
        );

        let model = self.model_for(pipeline, "most_capable");
        let spec = SpawnSpec::new(prompt, self.repo_root().clone())
            .with_model(&model)
            .with_permission_mode(PermissionMode::Plan);
        let spec = self.apply_turn_limit(spec);
        let outcome = self
            .runner
            .run_expecting_success(&pipeline.id, None, &model, spec)
            .await?;

        let tasks = match prompts::parse_planned_tasks(&outcome.transcript) {
            Some(tasks) if !tasks.is_empty() => tasks,
            _ => {
                warn!(
                    pipeline_id = %pipeline.id,
                    "No parseable task breakdown in the plan; falling back to one catch-all task"
                );
                vec![PlannedTask {
                    title: "Implement the requirements".to_string(),
                    role: "general engineer".to_string(),
                    prompt: pipeline.requirements.clone(),
                    skills: Vec::new(),
                    depends_on: Vec::new(),
                    complexity: "standard".to_string(),
                }]
            }
        };

        let plan = Plan::new(pipeline.id.clone(), version, outcome.transcript).with_tasks(tasks);
        self.store.save_plan(&plan).await?;
        info!(pipeline_id = %pipeline.id, version, plan_id = %plan.id, "Plan generated");

        Ok(EngineEvent::PlanReady {
            plan_id: plan.id.clone(),
            version,
        })
    }

    /// Second-model critique of the approved plan. A clean verdict moves
    /// on; findings trigger a replan until the limit forces escalation.
    async fn adversarial_stage(&self, pipeline: &Pipeline) -> Result<EngineEvent> {
        let plan = self.store.latest_plan(&pipeline.id).await?.ok_or_else(|| {
            OperonError::EntityNotFound(format!("No plan to review for pipeline {}", pipeline.id))
        })?;

        let model = self.model_for(pipeline, "balanced");
        let spec = SpawnSpec::new(
            prompts::adversarial_prompt(&plan.content),
            self.repo_root().clone(),
        )
        .with_model(&model)
        .with_permission_mode(PermissionMode::Plan);
        let spec = self.apply_turn_limit(spec);
        let outcome = self
            .runner
            .run_expecting_success(&pipeline.id, None, &model, spec)
            .await?;

        match prompts::parse_adversarial_feedback(&outcome.transcript) {
            Some(feedback) => {
                if pipeline.replan_count >= self.config.limits.replan_limit {
                    let approve = EngineEvent::AdversarialApproved;
                    self.escalate_replan_limit(pipeline, &feedback, approve).await
                } else {
                    Ok(EngineEvent::AdversarialChangesRequested { feedback })
                }
            }
            None => Ok(EngineEvent::AdversarialApproved),
        }
    }

    /// Materialize plan tasks as rows and give each an isolated
    /// worktree. Idempotent: existing rows and worktrees are adopted,
    /// which is what a crash-resumed pipeline needs.
    async fn context_prep_stage(&self, pipeline: &Pipeline, stage: &Stage) -> Result<EngineEvent> {
        let plan = self.store.latest_plan(&pipeline.id).await?.ok_or_else(|| {
            OperonError::EntityNotFound(format!("No plan for pipeline {}", pipeline.id))
        })?;

        let mut tasks = self.store.list_tasks_for_pipeline(&pipeline.id).await?;
        if tasks.is_empty() {
            for planned in &plan.tasks {
                let mut skills = planned.skills.clone();
                if skills.is_empty() {
                    skills = assign_skills(
                        &format!("{} {}", planned.role, planned.prompt),
                        &self.config.skill_rules,
                    );
                }
                let task = Task::new(
                    pipeline.id.clone(),
                    stage.id.clone(),
                    planned.title.clone(),
                    planned.role.clone(),
                    planned.prompt.clone(),
                )
                .with_skills(skills)
                .with_complexity(planned.complexity.clone())
                .with_depends_on(planned.depends_on.clone());
                self.store.save_task(&task).await?;
                tasks.push(task);
            }
            info!(pipeline_id = %pipeline.id, count = tasks.len(), "Task rows created from plan");
        }

        let project = self.store.load_project(&pipeline.project_id).await?;
        for task in &mut tasks {
            if task.worktree_path.is_some() {
                continue;
            }
            let info = self
                .provision_worktree(&task.id, &task.title, &project.base_branch)
                .await?;
            task.worktree_path = Some(info.path);
            task.branch = Some(info.branch);
            task.touch();
            self.store.save_task(task).await?;
        }

        Ok(EngineEvent::ContextReady)
    }

    /// Create a task worktree, adopting one left behind by a crash.
    async fn provision_worktree(
        &self,
        task_id: &str,
        title: &str,
        base_branch: &str,
    ) -> Result<WorktreeInfo> {
        match self.worktrees.create(task_id, title, base_branch).await {
            Ok(info) => Ok(info),
            Err(err) => {
                let expected = self.worktrees.path_for_task(task_id, title);
                let existing = self.worktrees.list().await.unwrap_or_default();
                if existing.contains(&expected) {
                    debug!(
                        task_id,
                        path = %expected.display(),
                        "Adopting worktree from an earlier attempt"
                    );
                    Ok(WorktreeInfo {
                        task_id: task_id.to_string(),
                        path: expected,
                        branch: branch_for_task(task_id, title),
                    })
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Run every not-yet-completed task in dependency waves, bounded by
    /// the concurrency limit. Any task failure fails the stage so the
    /// supervisor retries only what is left.
    async fn execution_stage(&self, pipeline: &Pipeline) -> Result<EngineEvent> {
        let limit = self.config.limits.max_concurrent_tasks.max(1);
        loop {
            let tasks = self.store.list_tasks_for_pipeline(&pipeline.id).await?;
            let done: BTreeSet<String> = tasks
                .iter()
                .filter(|t| t.state == TaskState::Completed)
                .map(|t| t.title.clone())
                .collect();
            // Between waves nothing is genuinely running, so a Running
            // row here is work a dead process left behind; it gets
            // re-dispatched along with pending and failed tasks.
            let pending: Vec<Task> = tasks
                .into_iter()
                .filter(|t| t.state != TaskState::Completed)
                .collect();
            if pending.is_empty() {
                return Ok(EngineEvent::ExecutionFinished);
            }

            let wave: Vec<Task> = pending
                .iter()
                .filter(|t| t.depends_on.iter().all(|dep| done.contains(dep)))
                .cloned()
                .collect();
            if wave.is_empty() {
                let blocked: Vec<String> = pending.iter().map(|t| t.title.clone()).collect();
                return Err(OperonError::InvalidState(format!(
                    "Unsatisfiable task dependencies: {}",
                    blocked.join(", ")
                )));
            }

            debug!(pipeline_id = %pipeline.id, wave = wave.len(), "Dispatching task wave");
            let results: Vec<Result<()>> = stream::iter(wave)
                .map(|task| self.run_task(pipeline, task))
                .buffer_unordered(limit)
                .collect()
                .await;
            for result in results {
                result?;
            }
        }
    }

    #[instrument(skip(self, pipeline, task), fields(task_id = %task.id, title = %task.title))]
    async fn run_task(&self, pipeline: &Pipeline, mut task: Task) -> Result<()> {
        let status = self.ledger.check(&pipeline.id).await?;
        if !status.within_budget {
            return Err(OperonError::BudgetExceeded(format!(
                "${:.2} spent of ${:.2} budget",
                status.total_cost_usd, status.max_budget_usd
            )));
        }

        let cwd = task.worktree_path.clone().ok_or_else(|| {
            OperonError::InvalidState(format!("Task '{}' has no worktree", task.title))
        })?;

        task.state = TaskState::Running;
        task.touch();
        self.store.save_task(&task).await?;
        self.emit_task_state(&task);

        let memory = self.store.list_memory(&pipeline.project_id, None).await?;
        let tier = tier_for_complexity(&task.complexity);
        let model = self.model_for(pipeline, tier);
        let spec = SpawnSpec::new(prompts::task_prompt(&task, &memory), cwd)
            .with_model(&model)
            .with_permission_mode(PermissionMode::BypassPermissions)
            .with_skills(task.skills.clone());
        let spec = self.apply_turn_limit(spec);

        let outcome = self
            .runner
            .run_agent(&pipeline.id, Some(&task.id), &model, spec)
            .await?;
        self.record_task_performance(&task, &outcome).await;

        if outcome.succeeded() {
            task.state = TaskState::Completed;
            task.result_summary = Some(tail_excerpt(&outcome.transcript, SUMMARY_CHARS));
            task.touch();
            self.store.save_task(&task).await?;
            self.emit_task_state(&task);
            info!("Task completed");
            Ok(())
        } else {
            task.state = TaskState::Failed;
            task.touch();
            self.store.save_task(&task).await?;
            self.emit_task_state(&task);
            Err(OperonError::AgentFailed(format!(
                "Task '{}' exited with code {}",
                task.title, outcome.exit_code
            )))
        }
    }

    fn emit_task_state(&self, task: &Task) {
        self.bus.emit(PipelineEvent::TaskStateChanged {
            pipeline_id: task.pipeline_id.clone(),
            task_id: task.id.clone(),
            state: task.state,
        });
    }

    /// Record the run outcome for model-routing statistics. Failures
    /// here never fail the task.
    async fn record_task_performance(&self, task: &Task, outcome: &RunOutcome) {
        let run = match self.store.load_run(&outcome.run_id).await {
            Ok(run) => run,
            Err(err) => {
                warn!(run_id = %outcome.run_id, %err, "Run row missing; skipping performance record");
                return;
            }
        };
        let duration_ms = run
            .completed_at
            .map(|done| (done - run.started_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let record = ModelPerformance {
            task_kind: task.role.clone(),
            complexity: task.complexity.clone(),
            model: run.model.clone(),
            success: outcome.succeeded(),
            input_tokens: run.input_tokens,
            output_tokens: run.output_tokens,
            duration_ms,
            recorded_at: Utc::now(),
        };
        if let Err(err) = self.store.append_model_performance(&record).await {
            warn!(%err, "Could not append model performance record");
        }
    }

    /// One run over all completed task working copies, fixing failures
    /// in place.
    async fn testing_stage(&self, pipeline: &Pipeline) -> Result<EngineEvent> {
        let tasks = self.completed_worktree_tasks(&pipeline.id).await?;
        if tasks.is_empty() {
            info!(pipeline_id = %pipeline.id, "No completed task worktrees; skipping test run");
            return Ok(EngineEvent::TestingPassed);
        }

        let model = self.model_for(pipeline, "economical");
        let spec = SpawnSpec::new(prompts::testing_prompt(&tasks), self.repo_root().clone())
            .with_model(&model)
            .with_permission_mode(PermissionMode::BypassPermissions);
        let spec = self.apply_turn_limit(spec);
        self.runner
            .run_expecting_success(&pipeline.id, None, &model, spec)
            .await?;
        Ok(EngineEvent::TestingPassed)
    }

    /// Review every task branch's diff, fixing real defects in place.
    async fn code_review_stage(&self, pipeline: &Pipeline) -> Result<EngineEvent> {
        let tasks = self.completed_worktree_tasks(&pipeline.id).await?;
        if tasks.is_empty() {
            info!(pipeline_id = %pipeline.id, "No completed task worktrees; skipping code review");
            return Ok(EngineEvent::CodeReviewFinished);
        }

        let model = self.model_for(pipeline, "most_capable");
        let spec = SpawnSpec::new(prompts::code_review_prompt(&tasks), self.repo_root().clone())
            .with_model(&model)
            .with_permission_mode(PermissionMode::BypassPermissions);
        let spec = self.apply_turn_limit(spec);
        self.runner
            .run_expecting_success(&pipeline.id, None, &model, spec)
            .await?;
        Ok(EngineEvent::CodeReviewFinished)
    }

    async fn completed_worktree_tasks(&self, pipeline_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .store
            .list_tasks_for_pipeline(pipeline_id)
            .await?
            .into_iter()
            .filter(|t| t.state == TaskState::Completed && t.worktree_path.is_some())
            .collect())
    }

    async fn integration_stage(&self, pipeline: &Pipeline) -> Result<EngineEvent> {
        let report = self.merges.merge_all(&pipeline.id).await?;
        Ok(EngineEvent::IntegrationFinished {
            all_merged: report.all_merged,
        })
    }

    /// Distill run statistics into durable memory and, when the numbers
    /// support one, a model-routing recommendation.
    async fn evolution_stage(&self, pipeline: &Pipeline) -> Result<EngineEvent> {
        let runs = self.store.list_runs_for_pipeline(&pipeline.id).await?;
        let tasks = self.store.list_tasks_for_pipeline(&pipeline.id).await?;
        let titles: BTreeMap<&str, &str> = tasks
            .iter()
            .map(|t| (t.id.as_str(), t.title.as_str()))
            .collect();

        let stats_lines: Vec<String> = runs
            .iter()
            .map(|run| {
                let label = run
                    .task_id
                    .as_deref()
                    .and_then(|id| titles.get(id).copied())
                    .unwrap_or("pipeline stage");
                let exit = run
                    .exit_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!(
                    "{}: model={} exit={} cost=${:.4} tokens={}/{}",
                    label, run.model, exit, run.cost_usd, run.input_tokens, run.output_tokens
                )
            })
            .collect();

        let status = self.ledger.check(&pipeline.id).await?;
        let model = self.model_for(pipeline, "economical");
        let spec = SpawnSpec::new(
            prompts::evolution_prompt(&stats_lines, status.total_cost_usd),
            self.repo_root().clone(),
        )
        .with_model(&model)
        .with_permission_mode(PermissionMode::Plan);
        let spec = self.apply_turn_limit(spec);

        match self.runner.run_agent(&pipeline.id, None, &model, spec).await {
            Ok(outcome) if outcome.succeeded() && !outcome.transcript.trim().is_empty() => {
                let entry = MemoryEntry::new(
                    pipeline.project_id.clone(),
                    MemoryLayer::L2,
                    MemoryKind::Discovery,
                    tail_excerpt(&outcome.transcript, MEMORY_CHARS),
                )
                .with_pipeline(pipeline.id.clone());
                self.store.save_memory(&entry).await?;
                info!(pipeline_id = %pipeline.id, "Retrospective distilled into project memory");
            }
            Ok(_) => {
                warn!(pipeline_id = %pipeline.id, "Retrospective run produced nothing usable");
            }
            Err(err) => {
                warn!(pipeline_id = %pipeline.id, %err, "Retrospective run failed; continuing");
            }
        }

        let records = self.store.load_model_performance().await?;
        if let Some(description) = routing_recommendation(&records) {
            let previous = serde_json::to_string(&self.config.models)?;
            let log = EvolutionLog::new(
                pipeline.project_id.clone(),
                EvolutionKind::ModelRouting,
                description,
                previous,
            )
            .with_pipeline(pipeline.id.clone());
            self.store.save_evolution(&log).await?;
            info!(pipeline_id = %pipeline.id, "Model-routing recommendation recorded");
        }

        Ok(EngineEvent::EvolutionCaptured)
    }

    /// Fold pipeline learnings back into the repository's CLAUDE.md via
    /// a dedicated self-update worktree, merged like a task branch. The
    /// update is best-effort: a failed run or a conflicted merge drops
    /// it without failing the pipeline.
    async fn claude_md_stage(&self, pipeline: &Pipeline) -> Result<EngineEvent> {
        let learnings: Vec<String> = self
            .store
            .list_memory(&pipeline.project_id, Some(MemoryLayer::L2))
            .await?
            .into_iter()
            .filter(|m| m.pipeline_id.as_deref() == Some(pipeline.id.as_str()))
            .map(|m| m.content)
            .collect();
        if learnings.is_empty() {
            info!(pipeline_id = %pipeline.id, "No learnings captured; skipping CLAUDE.md update");
            return Ok(EngineEvent::ClaudeMdUpdated);
        }

        let project = self.store.load_project(&pipeline.project_id).await?;
        let worktree = match &pipeline.self_update_worktree {
            Some(path) => WorktreeInfo {
                task_id: pipeline.id.clone(),
                path: path.clone(),
                branch: branch_for_task(&pipeline.id, CLAUDE_MD_TITLE),
            },
            None => {
                let info = self
                    .provision_worktree(&pipeline.id, CLAUDE_MD_TITLE, &project.base_branch)
                    .await?;
                let mut pipeline = pipeline.clone();
                pipeline.self_update_worktree = Some(info.path.clone());
                pipeline.touch();
                self.store.save_pipeline(&pipeline).await?;
                info
            }
        };

        let model = self.model_for(pipeline, "economical");
        let spec = SpawnSpec::new(
            prompts::claude_md_prompt(&pipeline.requirements, &learnings.join("\n\n")),
            worktree.path.clone(),
        )
        .with_model(&model)
        .with_permission_mode(PermissionMode::BypassPermissions);
        let spec = self.apply_turn_limit(spec);

        let mut merged = false;
        match self.runner.run_agent(&pipeline.id, None, &model, spec).await {
            Ok(outcome) if outcome.succeeded() => {
                let merge = MergeOps::new(self.executor.clone());
                match merge
                    .merge_no_ff(&worktree.branch, "Update CLAUDE.md with pipeline learnings")
                    .await
                {
                    Ok(MergeAttempt::Clean) => merged = true,
                    Ok(MergeAttempt::Conflicted { files }) => {
                        warn!(
                            pipeline_id = %pipeline.id,
                            conflicts = files.len(),
                            "CLAUDE.md update conflicted; dropping it"
                        );
                        if let Err(err) = merge.abort_merge().await {
                            warn!(%err, "Could not abort conflicted CLAUDE.md merge");
                        }
                    }
                    Err(err) => {
                        warn!(pipeline_id = %pipeline.id, %err, "CLAUDE.md merge failed; dropping it");
                    }
                }
            }
            Ok(_) => {
                warn!(pipeline_id = %pipeline.id, "CLAUDE.md update run failed; dropping it");
            }
            Err(err) => {
                warn!(pipeline_id = %pipeline.id, %err, "CLAUDE.md update run failed; dropping it");
            }
        }

        self.worktrees.remove(&worktree.path).await;

        // Reload before writing: the run above moved the cost totals.
        let mut pipeline = self.store.load_pipeline(&pipeline.id).await?;
        pipeline.self_update_worktree = None;
        pipeline.self_update_merged = merged;
        pipeline.touch();
        self.store.save_pipeline(&pipeline).await?;

        if merged {
            let log = EvolutionLog::new(
                pipeline.project_id.clone(),
                EvolutionKind::ClaudeMd,
                "Merged CLAUDE.md update distilled from pipeline learnings",
                worktree.branch.clone(),
            )
            .with_pipeline(pipeline.id.clone());
            self.store.save_evolution(&log).await?;
        } else {
            self.bus.emit(PipelineEvent::Notification {
                pipeline_id: Some(pipeline.id.clone()),
                message: "CLAUDE.md self-update was not merged".to_string(),
            });
        }

        Ok(EngineEvent::ClaudeMdUpdated)
    }

    /// Tier-routed model id, overridden by a pipeline-wide model pin.
    fn model_for(&self, pipeline: &Pipeline, tier: &str) -> String {
        pipeline
            .current_model
            .clone()
            .unwrap_or_else(|| self.config.model_for_tier(tier).to_string())
    }

    fn apply_turn_limit(&self, spec: SpawnSpec) -> SpawnSpec {
        match self.config.limits.max_turns {
            Some(turns) => spec.with_max_turns(turns),
            None => spec,
        }
    }

    fn repo_root(&self) -> &std::path::PathBuf {
        self.executor.repo_root()
    }
}
