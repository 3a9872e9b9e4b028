//! # operon-git
//!
//! Git integration layer for Operon orchestration.
//!
//! This crate provides:
//! - Git command execution abstraction (real and mock)
//! - Branch management for task isolation
//! - Worktree lifecycle with deterministic naming
//! - Low-level merge verbs for the merge coordinator

#![allow(dead_code)]

mod branches;
mod command;
mod merge;
mod worktree;

pub use branches::BranchManager;
pub use command::{GitCommand, GitExecutor, GitOutput, MockGitExecutor};
pub use merge::{MergeAttempt, MergeOps};
pub use worktree::{branch_for_task, slugify, task_hash, WorktreeInfo, WorktreeManager};
