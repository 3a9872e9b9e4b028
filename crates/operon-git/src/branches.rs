//! Branch operations for task isolation
//!
//! All verbs shell out through the `GitExecutor` trait. Failures carry the
//! underlying git message in a typed error; nothing is swallowed here.

use operon_core::{OperonError, Result};
use tracing::{debug, instrument};

use crate::command::GitExecutor;

/// Manager for branch operations
pub struct BranchManager<E: GitExecutor> {
    executor: E,
}

impl<E: GitExecutor> BranchManager<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Create a branch at `start_point` (or HEAD when `None`)
    ///
    /// Executes: `git branch {name} [{start_point}]`
    #[instrument(skip(self))]
    pub async fn create_branch(&self, name: &str, start_point: Option<&str>) -> Result<()> {
        debug!("Creating branch {}", name);

        let output = match start_point {
            Some(start) => self.executor.exec(&["branch", name, start]).await?,
            None => self.executor.exec(&["branch", name]).await?,
        };

        if !output.success {
            return Err(OperonError::GitBranch(format!(
                "Failed to create branch {}: {}",
                name,
                output.stderr.trim()
            )));
        }

        Ok(())
    }

    /// Delete a branch regardless of merge status
    ///
    /// Executes: `git branch -D {name}`
    #[instrument(skip(self))]
    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        debug!("Deleting branch {}", name);

        let output = self.executor.exec(&["branch", "-D", name]).await?;

        if !output.success {
            return Err(OperonError::GitBranch(format!(
                "Failed to delete branch {}: {}",
                name,
                output.stderr.trim()
            )));
        }

        Ok(())
    }

    /// Whether a local branch exists
    ///
    /// Executes: `git rev-parse --verify refs/heads/{name}`
    pub async fn branch_exists(&self, name: &str) -> Result<bool> {
        let refname = format!("refs/heads/{}", name);
        let output = self
            .executor
            .exec(&["rev-parse", "--verify", "--quiet", &refname])
            .await?;
        Ok(output.success)
    }

    /// All local branch names
    ///
    /// Executes: `git branch --format=%(refname:short)`
    pub async fn list_branches(&self) -> Result<Vec<String>> {
        let output = self
            .executor
            .exec(&["branch", "--format=%(refname:short)"])
            .await?;

        if !output.success {
            return Err(OperonError::GitBranch(format!(
                "Failed to list branches: {}",
                output.stderr.trim()
            )));
        }

        Ok(output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Name of the currently checked-out branch
    ///
    /// Executes: `git branch --show-current`
    pub async fn current_branch(&self) -> Result<String> {
        let output = self.executor.exec(&["branch", "--show-current"]).await?;

        if !output.success {
            return Err(OperonError::GitBranch(format!(
                "Failed to read current branch: {}",
                output.stderr.trim()
            )));
        }

        Ok(output.stdout.trim().to_string())
    }
}
