//! Unified error types for Operon

use thiserror::Error;

/// Unified error type for all Operon operations
#[derive(Error, Debug)]
pub enum OperonError {
    // Git errors
    #[error("Git command failed: {0}")]
    GitCommand(String),

    #[error("Git branch error: {0}")]
    GitBranch(String),

    #[error("Git worktree error: {0}")]
    GitWorktree(String),

    // Agent process errors
    #[error("Agent spawn failed: {0}")]
    AgentSpawn(String),

    #[error("Agent run failed: {0}")]
    AgentFailed(String),

    // Engine errors
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Invalid pipeline state: {0}")]
    InvalidState(String),

    #[error("Stage timed out: {0}")]
    StageTimeout(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Replan limit reached: {0}")]
    ReplanLimit(String),

    // Human gate errors
    #[error("Gate request not found: {0}")]
    GateNotFound(String),

    #[error("Gate already resolved: {0}")]
    GateAlreadyResolved(String),

    #[error("Gate channel closed: {0}")]
    GateClosed(String),

    // Storage errors
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using OperonError
pub type Result<T> = std::result::Result<T, OperonError>;
