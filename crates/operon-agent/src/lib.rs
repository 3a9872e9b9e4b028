//! # operon-agent
//!
//! Runs AI agent subprocesses for the pipeline engine:
//!
//! - **Spawning**: launches the agent CLI in non-interactive streaming
//!   mode with the prompt on stdin
//! - **Demultiplexing**: turns the NDJSON output stream into typed
//!   chunks, tolerating partial reads and garbage lines
//! - **Lifecycle**: active-run registry, graceful-then-forceful kill,
//!   guaranteed terminal `Done` chunk per run
//!
//! The [`AgentSpawner`] trait is the seam the engine works against;
//! [`MockAgentSpawner`] replays scripted streams in tests.

#![allow(dead_code)]

mod runner;
mod stream;
mod types;

pub use runner::{build_agent_args, AgentRunner, AgentSpawner, MockAgentSpawner, RunHandle};
pub use stream::{demux_line, StreamDemux};
pub use types::{PermissionMode, RunStats, SpawnSpec};
