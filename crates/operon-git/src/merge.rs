//! Low-level merge operations
//!
//! These verbs mutate the integration checkout at the repo root; the merge
//! coordinator in the engine crate sequences them per pipeline. Conflicts
//! here are data, not errors: `merge_no_ff` reports them as an outcome.

use operon_core::{OperonError, Result};
use tracing::{debug, instrument};

use crate::command::GitExecutor;

/// Outcome of one merge attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    /// Merge committed cleanly
    Clean,
    /// Merge stopped on conflicts; the working tree holds conflict markers
    Conflicted { files: Vec<String> },
}

/// Merge verbs over the integration checkout
pub struct MergeOps<E: GitExecutor> {
    executor: E,
}

impl<E: GitExecutor> MergeOps<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    /// Attempt a no-fast-forward merge of `branch`
    ///
    /// Executes: `git merge --no-ff {branch} -m {message}`
    #[instrument(skip(self, message))]
    pub async fn merge_no_ff(&self, branch: &str, message: &str) -> Result<MergeAttempt> {
        debug!("Merging {} (no-ff)", branch);

        let output = self
            .executor
            .exec(&["merge", "--no-ff", branch, "-m", message])
            .await?;

        if output.success {
            return Ok(MergeAttempt::Clean);
        }

        let files = self.conflicted_files().await?;
        if files.is_empty() {
            // Failed for some reason other than conflicts
            return Err(OperonError::GitCommand(format!(
                "Merge of {} failed: {}",
                branch,
                output.stderr.trim()
            )));
        }

        Ok(MergeAttempt::Conflicted { files })
    }

    /// Paths currently in the unmerged state
    ///
    /// Executes: `git diff --name-only --diff-filter=U`
    pub async fn conflicted_files(&self) -> Result<Vec<String>> {
        let output = self
            .executor
            .exec(&["diff", "--name-only", "--diff-filter=U"])
            .await?;

        Ok(output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Abort the in-progress merge and restore the pre-merge tree
    ///
    /// Executes: `git merge --abort`
    #[instrument(skip(self))]
    pub async fn abort_merge(&self) -> Result<()> {
        let output = self.executor.exec(&["merge", "--abort"]).await?;

        if !output.success {
            return Err(OperonError::GitCommand(format!(
                "Failed to abort merge: {}",
                output.stderr.trim()
            )));
        }

        Ok(())
    }

    /// Stage everything and commit, completing a resolved merge
    ///
    /// Executes: `git add -A` then `git commit -m {message}`. A commit that
    /// finds nothing to do (the resolver already committed) is not an error.
    #[instrument(skip(self, message))]
    pub async fn commit_all(&self, message: &str) -> Result<()> {
        let add = self.executor.exec(&["add", "-A"]).await?;
        if !add.success {
            return Err(OperonError::GitCommand(format!(
                "Failed to stage resolution: {}",
                add.stderr.trim()
            )));
        }

        let commit = self.executor.exec(&["commit", "-m", message]).await?;
        if !commit.success {
            let text = format!("{}{}", commit.stdout, commit.stderr);
            if text.contains("nothing to commit") {
                debug!("Nothing to commit; resolution was already committed");
                return Ok(());
            }
            return Err(OperonError::GitCommand(format!(
                "Failed to commit resolution: {}",
                commit.stderr.trim()
            )));
        }

        Ok(())
    }

    /// Current diff, truncated to at most `max_lines` lines
    ///
    /// Executes: `git diff`
    pub async fn diff_excerpt(&self, max_lines: usize) -> Result<String> {
        let output = self.executor.exec(&["diff"]).await?;

        let mut lines: Vec<&str> = output.stdout.lines().collect();
        if lines.len() > max_lines {
            lines.truncate(max_lines);
            let mut excerpt = lines.join("\n");
            excerpt.push_str("\n... (diff truncated)");
            Ok(excerpt)
        } else {
            Ok(lines.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{GitOutput, MockGitExecutor};

    #[tokio::test]
    async fn test_clean_merge() {
        let executor = MockGitExecutor::new().with_response(
            "merge --no-ff operon/task-a-11112222 -m Merge task: a",
            GitOutput::ok("Merge made by the 'ort' strategy.\n"),
        );
        let ops = MergeOps::new(executor);

        let outcome = ops
            .merge_no_ff("operon/task-a-11112222", "Merge task: a")
            .await
            .unwrap();
        assert_eq!(outcome, MergeAttempt::Clean);
    }

    #[tokio::test]
    async fn test_conflicted_merge_lists_files() {
        let executor = MockGitExecutor::new()
            .with_response(
                "merge --no-ff operon/task-b-33334444 -m Merge task: b",
                GitOutput::err("CONFLICT (content): Merge conflict in src/api.rs"),
            )
            .with_response(
                "diff --name-only --diff-filter=U",
                GitOutput::ok("src/api.rs\nsrc/db.rs\n"),
            );
        let ops = MergeOps::new(executor);

        let outcome = ops
            .merge_no_ff("operon/task-b-33334444", "Merge task: b")
            .await
            .unwrap();
        match outcome {
            MergeAttempt::Conflicted { files } => {
                assert_eq!(files, vec!["src/api.rs", "src/db.rs"]);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_conflict_failure_is_error() {
        let executor = MockGitExecutor::new()
            .with_response(
                "merge --no-ff ghost -m Merge task: ghost",
                GitOutput::err("merge: ghost - not something we can merge"),
            )
            .with_response("diff --name-only --diff-filter=U", GitOutput::ok(""));
        let ops = MergeOps::new(executor);

        let err = ops
            .merge_no_ff("ghost", "Merge task: ghost")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not something we can merge"));
    }

    #[tokio::test]
    async fn test_commit_all_tolerates_nothing_to_commit() {
        let executor = MockGitExecutor::new()
            .with_response("add -A", GitOutput::ok(""))
            .with_response(
                "commit -m Resolve conflicts",
                GitOutput::err("nothing to commit, working tree clean"),
            );
        let ops = MergeOps::new(executor);

        ops.commit_all("Resolve conflicts").await.unwrap();
    }

    #[tokio::test]
    async fn test_diff_excerpt_truncates() {
        let long_diff: String = (0..300)
            .map(|i| format!("+line {}\n", i))
            .collect();
        let executor = MockGitExecutor::new().with_response("diff", GitOutput::ok(long_diff));
        let ops = MergeOps::new(executor);

        let excerpt = ops.diff_excerpt(50).await.unwrap();
        assert_eq!(excerpt.lines().count(), 51);
        assert!(excerpt.ends_with("... (diff truncated)"));
    }
}
