//! Git command execution abstraction

use async_trait::async_trait;
use operon_core::{OperonError, Result};
use std::path::PathBuf;
use std::process::Output;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Output from a git command
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
        }
    }

    pub fn err(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        }
    }
}

impl From<Output> for GitOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

/// Trait for executing git commands (allows mocking in tests)
#[async_trait]
pub trait GitExecutor: Send + Sync {
    /// Execute a git command with the given arguments
    async fn exec(&self, args: &[&str]) -> Result<GitOutput>;

    /// Execute a git command from a specific working directory
    ///
    /// Worktree checkouts need this; most callers use `exec`, which runs
    /// from the repository root.
    async fn exec_in(&self, cwd: &PathBuf, args: &[&str]) -> Result<GitOutput>;

    /// Get the repository root
    fn repo_root(&self) -> &PathBuf;
}

/// Real git command executor
#[derive(Clone)]
pub struct GitCommand {
    repo_root: PathBuf,
}

impl GitCommand {
    /// Create a new git command executor for the given repository
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Auto-detect repository root from current directory
    pub async fn detect() -> Result<Self> {
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .await
            .map_err(|e| OperonError::GitCommand(format!("Failed to run git rev-parse: {}", e)))?;

        if !output.status.success() {
            return Err(OperonError::GitCommand(
                "Not in a git repository".to_string(),
            ));
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self::new(root))
    }

    async fn run(&self, cwd: &PathBuf, args: &[&str]) -> Result<GitOutput> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| OperonError::GitCommand(format!("Failed to execute git: {}", e)))?;

        let git_output = GitOutput::from(output);

        if !git_output.success {
            debug!("Git command failed: {}", git_output.stderr.trim());
        }

        Ok(git_output)
    }
}

#[async_trait]
impl GitExecutor for GitCommand {
    #[instrument(skip(self), fields(repo = %self.repo_root.display()))]
    async fn exec(&self, args: &[&str]) -> Result<GitOutput> {
        debug!("Executing git {:?}", args);
        self.run(&self.repo_root.clone(), args).await
    }

    async fn exec_in(&self, cwd: &PathBuf, args: &[&str]) -> Result<GitOutput> {
        debug!("Executing git {:?} in {}", args, cwd.display());
        self.run(cwd, args).await
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

/// Mock git executor for testing
///
/// Responses are keyed by the joined argument string. A key may carry a
/// sequence of outputs; calls consume the sequence in order and the last
/// output repeats once the sequence is exhausted. All invocations are
/// recorded for assertion.
#[derive(Clone)]
pub struct MockGitExecutor {
    repo_root: PathBuf,
    responses: Arc<Mutex<std::collections::HashMap<String, Vec<GitOutput>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    lenient: bool,
}

impl Default for MockGitExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGitExecutor {
    pub fn new() -> Self {
        Self {
            repo_root: PathBuf::from("/mock/repo"),
            responses: Arc::new(Mutex::new(std::collections::HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            lenient: false,
        }
    }

    /// Unregistered commands succeed with empty output instead of
    /// erroring. Registered responses still apply.
    pub fn lenient(mut self) -> Self {
        self.lenient = true;
        self
    }

    pub fn with_response(self, command: &str, output: GitOutput) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), vec![output]);
        self
    }

    /// Queue several outputs for the same command, consumed in order
    pub fn with_response_sequence(self, command: &str, outputs: Vec<GitOutput>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), outputs);
        self
    }

    /// Every command executed so far, as joined argument strings
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    fn next_response(&self, key: &str) -> Result<GitOutput> {
        self.calls.lock().unwrap().push(key.to_string());

        let mut responses = self.responses.lock().unwrap();
        let Some(outputs) = responses.get_mut(key) else {
            if self.lenient {
                return Ok(GitOutput::ok(""));
            }
            return Err(OperonError::GitCommand(format!(
                "No mock response for: {}",
                key
            )));
        };

        if outputs.len() > 1 {
            Ok(outputs.remove(0))
        } else {
            outputs
                .first()
                .cloned()
                .ok_or_else(|| OperonError::GitCommand(format!("No mock response for: {}", key)))
        }
    }
}

#[async_trait]
impl GitExecutor for MockGitExecutor {
    async fn exec(&self, args: &[&str]) -> Result<GitOutput> {
        self.next_response(&args.join(" "))
    }

    async fn exec_in(&self, _cwd: &PathBuf, args: &[&str]) -> Result<GitOutput> {
        self.next_response(&args.join(" "))
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_executor() {
        let executor = MockGitExecutor::new()
            .with_response("branch --show-current", GitOutput::ok("main\n"));

        let output = executor.exec(&["branch", "--show-current"]).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "main\n");
    }

    #[tokio::test]
    async fn test_mock_unknown_command_errors() {
        let executor = MockGitExecutor::new();
        let err = executor.exec(&["status"]).await.unwrap_err();
        assert!(err.to_string().contains("No mock response"));
    }

    #[tokio::test]
    async fn test_lenient_mock_accepts_unknown_commands() {
        let executor = MockGitExecutor::new()
            .lenient()
            .with_response("branch --show-current", GitOutput::ok("main\n"));

        let unknown = executor.exec(&["status"]).await.unwrap();
        assert!(unknown.success);
        assert_eq!(unknown.stdout, "");

        // Registered responses still win
        let known = executor.exec(&["branch", "--show-current"]).await.unwrap();
        assert_eq!(known.stdout, "main\n");
    }

    #[tokio::test]
    async fn test_mock_sequence_consumed_in_order() {
        let executor = MockGitExecutor::new().with_response_sequence(
            "diff --name-only --diff-filter=U",
            vec![GitOutput::ok("src/api.rs\n"), GitOutput::ok("")],
        );

        let first = executor
            .exec(&["diff", "--name-only", "--diff-filter=U"])
            .await
            .unwrap();
        assert_eq!(first.stdout, "src/api.rs\n");

        let second = executor
            .exec(&["diff", "--name-only", "--diff-filter=U"])
            .await
            .unwrap();
        assert_eq!(second.stdout, "");

        // Last response repeats
        let third = executor
            .exec(&["diff", "--name-only", "--diff-filter=U"])
            .await
            .unwrap();
        assert_eq!(third.stdout, "");
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let executor = MockGitExecutor::new()
            .with_response("worktree prune", GitOutput::ok(""));
        executor.exec(&["worktree", "prune"]).await.unwrap();
        executor.exec(&["worktree", "prune"]).await.unwrap();

        assert_eq!(executor.call_count("worktree prune"), 2);
        assert_eq!(executor.calls().len(), 2);
    }
}
