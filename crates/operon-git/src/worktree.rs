//! Worktree lifecycle for parallel task isolation
//!
//! Each task gets its own worktree and branch, both named deterministically
//! from the task id so a crashed pipeline re-derives the same locations on
//! resume. Creation failures are typed errors; removal is best-effort and
//! only logged.

use std::path::PathBuf;

use operon_core::{OperonError, Result, TaskId};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::command::GitExecutor;

/// Directory under the repo root that holds task worktrees
const WORKTREE_DIR: &str = ".operon/worktrees";

/// An isolated working copy bound to one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch: String,
}

/// Stable 8-hex-character suffix derived from a task id
pub fn task_hash(task_id: &str) -> String {
    let digest = Sha256::digest(task_id.as_bytes());
    hex::encode(&digest[..4])
}

/// Lowercase, dash-separated prefix derived from a task title
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
        if slug.len() >= 24 {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

/// Branch name for a task: `operon/{slug}-{hash8}`
pub fn branch_for_task(task_id: &str, title: &str) -> String {
    format!("operon/{}-{}", slugify(title), task_hash(task_id))
}

/// Manager for worktree operations
pub struct WorktreeManager<E: GitExecutor> {
    executor: E,
}

impl<E: GitExecutor> WorktreeManager<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    /// Deterministic worktree location for a task
    pub fn path_for_task(&self, task_id: &str, title: &str) -> PathBuf {
        self.executor
            .repo_root()
            .join(WORKTREE_DIR)
            .join(format!("{}-{}", slugify(title), task_hash(task_id)))
    }

    /// Create a worktree and branch for a task off `base_branch`
    ///
    /// Executes: `git worktree add -b {branch} {path} {base_branch}`
    #[instrument(skip(self, title))]
    pub async fn create(
        &self,
        task_id: &str,
        title: &str,
        base_branch: &str,
    ) -> Result<WorktreeInfo> {
        let branch = branch_for_task(task_id, title);
        let path = self.path_for_task(task_id, title);
        let path_str = path.to_string_lossy().to_string();

        debug!("Creating worktree {} on branch {}", path_str, branch);

        let output = self
            .executor
            .exec(&["worktree", "add", "-b", &branch, &path_str, base_branch])
            .await?;

        if !output.success {
            return Err(OperonError::GitWorktree(format!(
                "Failed to create worktree for task {}: {}",
                task_id,
                output.stderr.trim()
            )));
        }

        Ok(WorktreeInfo {
            task_id: task_id.to_string(),
            path,
            branch,
        })
    }

    /// Remove a worktree, best effort
    ///
    /// Executes: `git worktree remove --force {path}`, falls back to
    /// `git worktree prune` plus direct directory removal. Never fails the
    /// caller; a stuck worktree is logged and left for manual cleanup.
    #[instrument(skip(self))]
    pub async fn remove(&self, path: &PathBuf) {
        let path_str = path.to_string_lossy().to_string();
        debug!("Removing worktree {}", path_str);

        match self
            .executor
            .exec(&["worktree", "remove", "--force", &path_str])
            .await
        {
            Ok(output) if output.success => return,
            Ok(output) => {
                warn!(
                    "git worktree remove failed for {}: {}",
                    path_str,
                    output.stderr.trim()
                );
            }
            Err(e) => {
                warn!("git worktree remove errored for {}: {}", path_str, e);
            }
        }

        if let Err(e) = self.executor.exec(&["worktree", "prune"]).await {
            warn!("git worktree prune errored: {}", e);
        }
        std::fs::remove_dir_all(path).ok();
    }

    /// Paths of all registered worktrees
    ///
    /// Executes: `git worktree list --porcelain`
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let output = self
            .executor
            .exec(&["worktree", "list", "--porcelain"])
            .await?;

        if !output.success {
            return Err(OperonError::GitWorktree(format!(
                "Failed to list worktrees: {}",
                output.stderr.trim()
            )));
        }

        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }
}
