//! # operon-engine
//!
//! The orchestration engine: the state machine and the loop that drives
//! pipelines through it.
//!
//! - **machine**: pure transition table from (state, event) to
//!   (next state, actions), with no I/O
//! - **engine**: the durable loop owning stores, gates, ledger, git and
//!   agent runs; parks at human review, recovers after crashes
//! - **supervisor**: per-stage timeouts and bounded retry, with the
//!   clock suspended while a blocking gate is parked
//! - **stages**: one agent run per stage, streamed and cost-accounted
//! - **merge**: serial no-ff integration of task branches with
//!   agent-driven conflict resolution and a human fallback
//! - **prompts**: prompt builders and transcript parsers for every stage
//! - **recovery**: startup scan for pipelines to resume

#![allow(dead_code)]

mod engine;
mod machine;
mod merge;
mod prompts;
mod recovery;
mod skills;
mod stages;
mod supervisor;

pub use engine::PipelineEngine;
pub use machine::{transition, EngineAction, EngineEvent};
pub use merge::{MergeCoordinator, MergeReport, TaskMergeResult};
pub use prompts::{
    parse_adversarial_feedback, parse_planned_tasks, CHANGES_REQUESTED_MARKER,
};
pub use recovery::scan_unfinished;
pub use skills::assign_skills;
pub use stages::{tail_excerpt, RunOutcome, StageRunner};
pub use supervisor::StageSupervisor;
