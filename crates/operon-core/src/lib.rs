//! # operon-core
//!
//! Core types for the Operon pipeline orchestration system.
//!
//! Operon drives autonomous multi-agent development runs the way a
//! bacterial operon drives gene expression: one promoter (the pipeline
//! engine) transcribes an ordered cluster of stages as a single unit,
//! with repressors (human gates, budget ceilings, timeouts) able to halt
//! transcription at defined points.
//!
//! ## Core Paradigm
//!
//! - Pipelines are durable rows advanced by a fixed state machine
//! - Tasks are isolated in git worktrees and merged back sequentially
//! - Agent work happens in external subprocesses streaming NDJSON
//! - Humans are first-class: blocking gates park futures, never threads
//! - Every entity write goes through the state store (write-through)

#![allow(dead_code)]

mod config;
mod error;
mod events;
mod state;
mod store;
mod types;

pub use config::{
    LimitConfig, MergeConfig, ModelConfig, OperonConfig, ProcessConfig, SkillRule,
};
pub use error::{OperonError, Result};
pub use events::{EventBus, PipelineEvent};
pub use state::{PipelineState, StageKind, StageState};
pub use store::StateStore;
pub use types::*;
