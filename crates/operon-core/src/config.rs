//! Configuration management for Operon
//!
//! This module provides the repository-level configuration consumed by the
//! engine and supervisor: model tiers, budget and timeout limits, process
//! settings, merge-resolution settings, and the skill rule table.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// Repository-level Operon configuration
///
/// Loaded from `.operon/config.toml` in the repo root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperonConfig {
    /// Model selection per tier
    #[serde(default)]
    pub models: ModelConfig,

    /// Budget, timeout and concurrency limits
    #[serde(default)]
    pub limits: LimitConfig,

    /// Agent subprocess settings
    #[serde(default)]
    pub process: ProcessConfig,

    /// Merge conflict resolution settings
    #[serde(default)]
    pub merge: MergeConfig,

    /// Run the adversarial review stage after plan approval
    #[serde(default = "default_adversarial_review")]
    pub adversarial_review: bool,

    /// Ordered skill-matching rules
    #[serde(default = "default_skill_rules")]
    pub skill_rules: Vec<SkillRule>,
}

/// Model names per routing tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_economical_model")]
    pub economical: String,

    #[serde(default = "default_balanced_model")]
    pub balanced: String,

    #[serde(default = "default_most_capable_model")]
    pub most_capable: String,
}

/// Budget, timeout and concurrency limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Default budget ceiling in USD for projects that set none
    #[serde(default = "default_max_budget")]
    pub max_budget_usd: f64,

    /// Wall-clock limit per stage attempt, in seconds
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,

    /// Retries per stage before the pipeline fails
    #[serde(default = "default_stage_retries")]
    pub stage_retry_limit: u32,

    /// plan_generation re-entries before escalating to an intervention
    #[serde(default = "default_replan_limit")]
    pub replan_limit: u32,

    /// Concurrent tasks during parallel execution
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Turn budget passed to agent runs
    #[serde(default)]
    pub max_turns: Option<u32>,
}

/// Agent subprocess settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Agent CLI binary name
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,

    /// Grace window between terminate and forceful kill, in milliseconds
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Delay between crash-recovery resumes, in milliseconds
    #[serde(default = "default_resume_stagger_ms")]
    pub resume_stagger_ms: u64,
}

/// Merge conflict resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Model for the automated resolution run (kept cheap on purpose)
    #[serde(default = "default_economical_model")]
    pub resolution_model: String,

    /// Turn budget for the automated resolution run
    #[serde(default = "default_resolution_max_turns")]
    pub resolution_max_turns: u32,

    /// Maximum diff lines included in an escalated intervention
    #[serde(default = "default_diff_excerpt_lines")]
    pub diff_excerpt_lines: usize,
}

/// One ordered skill-matching rule
///
/// `pattern` is matched as a substring against a task's role and prompt;
/// matching rules contribute their skills in order, de-duplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRule {
    pub pattern: String,
    pub skills: Vec<String>,
}

// Default value providers
fn default_economical_model() -> String {
    "claude-haiku-4".to_string()
}

fn default_balanced_model() -> String {
    "claude-sonnet-4".to_string()
}

fn default_most_capable_model() -> String {
    "claude-opus-4".to_string()
}

fn default_max_budget() -> f64 {
    25.0
}

fn default_stage_timeout() -> u64 {
    900
}

fn default_stage_retries() -> u32 {
    2
}

fn default_replan_limit() -> u32 {
    3
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_agent_binary() -> String {
    "claude".to_string()
}

fn default_kill_grace_ms() -> u64 {
    5000
}

fn default_resume_stagger_ms() -> u64 {
    2000
}

fn default_resolution_max_turns() -> u32 {
    10
}

fn default_adversarial_review() -> bool {
    true
}

fn default_diff_excerpt_lines() -> usize {
    200
}

fn default_skill_rules() -> Vec<SkillRule> {
    vec![
        SkillRule {
            pattern: "frontend".to_string(),
            skills: vec!["react".to_string(), "css".to_string()],
        },
        SkillRule {
            pattern: "backend".to_string(),
            skills: vec!["api-design".to_string(), "database".to_string()],
        },
        SkillRule {
            pattern: "test".to_string(),
            skills: vec!["testing".to_string()],
        },
        SkillRule {
            pattern: "migration".to_string(),
            skills: vec!["database".to_string()],
        },
        SkillRule {
            pattern: "docs".to_string(),
            skills: vec!["technical-writing".to_string()],
        },
    ]
}

impl OperonConfig {
    /// Load configuration from `.operon/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".operon/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&content).map_err(|e| {
                crate::OperonError::Config(format!("Failed to parse config file: {}", e))
            })?)
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.operon/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<()> {
        let config_dir = repo_root.join(".operon");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let config = Self::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| crate::OperonError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Model name for a tier keyword, falling back to balanced
    pub fn model_for_tier(&self, tier: &str) -> &str {
        match tier {
            "economical" => &self.models.economical,
            "most_capable" => &self.models.most_capable,
            _ => &self.models.balanced,
        }
    }
}

impl Default for OperonConfig {
    fn default() -> Self {
        Self {
            models: ModelConfig::default(),
            limits: LimitConfig::default(),
            process: ProcessConfig::default(),
            merge: MergeConfig::default(),
            adversarial_review: default_adversarial_review(),
            skill_rules: default_skill_rules(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            economical: default_economical_model(),
            balanced: default_balanced_model(),
            most_capable: default_most_capable_model(),
        }
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_budget_usd: default_max_budget(),
            stage_timeout_secs: default_stage_timeout(),
            stage_retry_limit: default_stage_retries(),
            replan_limit: default_replan_limit(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_turns: None,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            agent_binary: default_agent_binary(),
            kill_grace_ms: default_kill_grace_ms(),
            resume_stagger_ms: default_resume_stagger_ms(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            resolution_model: default_economical_model(),
            resolution_max_turns: default_resolution_max_turns(),
            diff_excerpt_lines: default_diff_excerpt_lines(),
        }
    }
}
