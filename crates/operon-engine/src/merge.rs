//! Merge coordination for completed tasks.
//!
//! Task branches merge back strictly in task order, one at a time,
//! because every merge mutates the shared integration checkout. A
//! conflict walks down three tiers: clean merge, one constrained
//! automated resolution run, then a blocking human intervention whose
//! answer is `resolved` or `skip`. The task's worktree is removed
//! whatever the outcome; its branch is deleted once merged but kept
//! when skipped, so the operator can still inspect the orphaned work.

use std::path::PathBuf;
use std::sync::Arc;

use operon_agent::{AgentSpawner, PermissionMode, SpawnSpec};
use operon_core::{
    EventBus, Intervention, MergeConfig, MergeStatus, PipelineEvent, Result, StateStore, Task,
    TaskId, TaskState,
};
use operon_gate::GateManager;
use operon_git::{BranchManager, GitExecutor, MergeAttempt, MergeOps, WorktreeManager};
use tracing::{debug, info, instrument, warn};

use crate::prompts::conflict_resolution_prompt;
use crate::stages::StageRunner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMergeResult {
    pub task_id: TaskId,
    pub status: MergeStatus,
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub results: Vec<TaskMergeResult>,
    /// False as soon as any task was skipped
    pub all_merged: bool,
}

pub struct MergeCoordinator<E: GitExecutor, A: AgentSpawner> {
    merge: MergeOps<E>,
    worktrees: WorktreeManager<E>,
    branches: BranchManager<E>,
    repo_root: PathBuf,
    runner: Arc<StageRunner<A>>,
    store: Arc<StateStore>,
    gates: Arc<GateManager>,
    bus: EventBus,
    config: MergeConfig,
}

impl<E: GitExecutor + Clone, A: AgentSpawner> MergeCoordinator<E, A> {
    pub fn new(
        executor: E,
        runner: Arc<StageRunner<A>>,
        store: Arc<StateStore>,
        gates: Arc<GateManager>,
        bus: EventBus,
        config: MergeConfig,
    ) -> Self {
        let repo_root = executor.repo_root().clone();
        Self {
            merge: MergeOps::new(executor.clone()),
            worktrees: WorktreeManager::new(executor.clone()),
            branches: BranchManager::new(executor),
            repo_root,
            runner,
            store,
            gates,
            bus,
            config,
        }
    }

    /// Merges every completed task of a pipeline back, sequentially.
    ///
    /// Tasks whose merge already settled (a crashed earlier pass) keep
    /// their recorded status and are not re-merged.
    #[instrument(skip(self))]
    pub async fn merge_all(&self, pipeline_id: &str) -> Result<MergeReport> {
        let tasks = self.store.list_tasks_for_pipeline(pipeline_id).await?;
        let mut results = Vec::new();

        for mut task in tasks {
            if task.state != TaskState::Completed {
                continue;
            }
            if let Some(status) = task.merge_status {
                debug!(task_id = %task.id, %status, "Merge already settled, keeping status");
                results.push(TaskMergeResult {
                    task_id: task.id.clone(),
                    status,
                });
                continue;
            }
            let Some(branch) = task.branch.clone() else {
                debug!(task_id = %task.id, "Task has no branch, nothing to merge");
                continue;
            };

            let outcome = self.merge_one(&task, &branch).await;

            // Tier outcome or not, the worktree goes away now
            if let Some(path) = task.worktree_path.take() {
                self.worktrees.remove(&path).await;
            }
            let status = outcome?;

            if status != MergeStatus::Skipped {
                if let Err(err) = self.branches.delete_branch(&branch).await {
                    warn!(task_id = %task.id, %err, "Merged branch was not deleted");
                }
            }

            task.merge_status = Some(status);
            task.touch();
            self.store.save_task(&task).await?;
            self.bus.emit(PipelineEvent::MergeTaskFinished {
                pipeline_id: pipeline_id.to_string(),
                task_id: task.id.clone(),
                status,
            });
            info!(task_id = %task.id, %status, "Task merge finished");
            results.push(TaskMergeResult {
                task_id: task.id,
                status,
            });
        }

        let all_merged = results.iter().all(|r| r.status != MergeStatus::Skipped);
        Ok(MergeReport {
            results,
            all_merged,
        })
    }

    async fn merge_one(&self, task: &Task, branch: &str) -> Result<MergeStatus> {
        let message = format!("Merge task: {}", task.title);
        match self.merge.merge_no_ff(branch, &message).await? {
            MergeAttempt::Clean => Ok(MergeStatus::Merged),
            MergeAttempt::Conflicted { files } => self.resolve_conflict(task, branch, files).await,
        }
    }

    /// Tier two and three: one automated resolution run, then a human.
    async fn resolve_conflict(
        &self,
        task: &Task,
        branch: &str,
        files: Vec<String>,
    ) -> Result<MergeStatus> {
        info!(
            task_id = %task.id,
            conflicts = files.len(),
            "Merge conflict, attempting automated resolution"
        );

        let diff = self.merge.diff_excerpt(self.config.diff_excerpt_lines).await?;
        let spec = SpawnSpec::new(
            conflict_resolution_prompt(branch, &files, &diff),
            self.repo_root.clone(),
        )
        .with_model(self.config.resolution_model.clone())
        .with_permission_mode(PermissionMode::BypassPermissions)
        .with_max_turns(self.config.resolution_max_turns);

        // The human tier is next either way, so a failed run is only logged
        if let Err(err) = self
            .runner
            .run_agent(
                &task.pipeline_id,
                Some(&task.id),
                &self.config.resolution_model,
                spec,
            )
            .await
        {
            warn!(task_id = %task.id, error = %err, "Automated resolution run failed");
        }

        let remaining = self.merge.conflicted_files().await?;
        if remaining.is_empty() {
            self.merge
                .commit_all(&format!("Resolve conflicts: {}", task.title))
                .await?;
            return Ok(MergeStatus::AutoResolved);
        }

        let diff = self.merge.diff_excerpt(self.config.diff_excerpt_lines).await?;
        let intervention = Intervention::new(
            &task.pipeline_id,
            format!(
                "Merge conflict in task '{}' was not resolved automatically. \
                 Answer 'resolved' if you fixed the tree by hand, or 'skip' to abort this merge.",
                task.title
            ),
        )
        .with_task(&task.id)
        .with_context(format!(
            "Conflicted files:\n{}\n\nDiff excerpt:\n{}",
            remaining.join("\n"),
            diff
        ));

        let answer = self.gates.request_intervention(intervention).await?;
        if answer.trim().eq_ignore_ascii_case("resolved") {
            self.merge
                .commit_all(&format!("Resolve conflicts: {}", task.title))
                .await?;
            Ok(MergeStatus::ManuallyResolved)
        } else {
            // skip, an expired gate, or anything unrecognized aborts
            self.merge.abort_merge().await?;
            Ok(MergeStatus::Skipped)
        }
    }
}
