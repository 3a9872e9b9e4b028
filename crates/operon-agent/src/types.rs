//! Spawn specifications and run bookkeeping types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Permission posture handed to the agent CLI.
///
/// Rendered with the exact casing the binary expects on its
/// `--permission-mode` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "acceptEdits" | "accept-edits" => Ok(PermissionMode::AcceptEdits),
            "bypassPermissions" | "bypass-permissions" => Ok(PermissionMode::BypassPermissions),
            "plan" => Ok(PermissionMode::Plan),
            _ => Err(format!("Unknown permission mode: {}", s)),
        }
    }
}

/// Everything needed to launch one agent subprocess.
///
/// The prompt is delivered over stdin; the rest becomes command-line
/// flags. Optional fields are omitted from the invocation entirely
/// rather than passed empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub prompt: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub skills: Vec<String>,
    pub max_turns: Option<u32>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
}

impl SpawnSpec {
    pub fn new(prompt: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            cwd: cwd.into(),
            model: None,
            permission_mode: None,
            skills: Vec::new(),
            max_turns: None,
            system_prompt: None,
            append_system_prompt: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = Some(mode);
        self
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_append_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.append_system_prompt = Some(prompt.into());
        self
    }
}

/// Counters accumulated while a run is alive, frozen when it exits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub event_count: u64,
    pub exit_code: Option<i32>,
}
