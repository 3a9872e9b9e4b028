//! Core type definitions for Operon pipelines
//!
//! Every durable entity the engine writes through the state store lives
//! here, together with the small enums that describe their lifecycles.
//! Ids are plain UUID strings; relationships are by-id references.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{PipelineState, StageKind, StageState};

/// Project identifier (UUID string)
pub type ProjectId = String;

/// Pipeline identifier (UUID string)
pub type PipelineId = String;

/// Stage identifier (UUID string)
pub type StageId = String;

/// Task identifier (UUID string)
pub type TaskId = String;

/// Plan identifier (UUID string)
pub type PlanId = String;

/// Agent run identifier (UUID string)
pub type RunId = String;

/// Intervention identifier (UUID string)
pub type InterventionId = String;

/// Consultation identifier (UUID string)
pub type ConsultationId = String;

/// Generate a fresh entity id
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Task execution state within the parallel-execution stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of merging one task branch back into the integration branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    /// Clean no-fast-forward merge
    Merged,
    /// Conflicted, resolved by the automated resolution run
    AutoResolved,
    /// Conflicted, fixed out-of-band by a human and committed
    ManuallyResolved,
    /// Conflicted, human chose to abort the merge
    Skipped,
}

impl std::fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Merged => write!(f, "merged"),
            Self::AutoResolved => write!(f, "auto_resolved"),
            Self::ManuallyResolved => write!(f, "manually_resolved"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Human decision on a generated plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanDecision {
    Approve,
    Edit,
    Reject,
}

impl std::str::FromStr for PlanDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" | "approved" => Ok(Self::Approve),
            "edit" | "edited" => Ok(Self::Edit),
            "reject" | "rejected" => Ok(Self::Reject),
            _ => Err(format!("Invalid plan decision: {}", s)),
        }
    }
}

/// Intervention lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    #[default]
    Pending,
    Resolved,
}

/// Consultation lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationStatus {
    #[default]
    Pending,
    Answered,
    Expired,
}

/// Memory retention layer
///
/// L1 entries are run-scoped decisions, L2 survive a pipeline, L3 are
/// project-lifetime knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLayer {
    L1,
    L2,
    L3,
}

impl std::fmt::Display for MemoryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::L1 => write!(f, "l1"),
            Self::L2 => write!(f, "l2"),
            Self::L3 => write!(f, "l3"),
        }
    }
}

/// What kind of knowledge a memory entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Decision,
    Discovery,
    Error,
    Pattern,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decision => write!(f, "decision"),
            Self::Discovery => write!(f, "discovery"),
            Self::Error => write!(f, "error"),
            Self::Pattern => write!(f, "pattern"),
        }
    }
}

/// Category of applied evolution change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionKind {
    Config,
    ModelRouting,
    ClaudeMd,
}

/// A project: one repository the system runs pipelines against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Root of the git repository pipelines operate on
    pub repo_path: PathBuf,
    /// Branch task branches are merged back into
    pub base_branch: String,
    /// Budget ceiling for a single pipeline, in USD
    pub max_budget_usd: f64,
    pub default_model: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            repo_path: repo_path.into(),
            base_branch: "main".to_string(),
            max_budget_usd: 25.0,
            default_model: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_base_branch(mut self, branch: impl Into<String>) -> Self {
        self.base_branch = branch.into();
        self
    }

    pub fn with_budget(mut self, max_budget_usd: f64) -> Self {
        self.max_budget_usd = max_budget_usd;
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

/// One end-to-end orchestration run, from requirements to a terminal state
///
/// Pipelines are historical records: they are mutated by the engine as
/// the run advances and are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub project_id: ProjectId,
    /// The natural-language requirement this run implements
    pub requirements: String,
    pub state: PipelineState,
    pub total_cost_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Cost broken down by model tier name
    #[serde(default)]
    pub cost_by_tier: BTreeMap<String, f64>,
    pub current_model: Option<String>,
    /// Worktree used when the pipeline modifies its own configuration
    pub self_update_worktree: Option<PathBuf>,
    #[serde(default)]
    pub self_update_merged: bool,
    /// Set while paused; names the state to resume into
    pub paused_from_state: Option<PipelineState>,
    /// Incremented each time crash recovery re-enters this pipeline
    #[serde(default)]
    pub reentry_count: u32,
    /// Number of plan_generation re-entries so far
    #[serde(default)]
    pub replan_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(project_id: impl Into<ProjectId>, requirements: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            project_id: project_id.into(),
            requirements: requirements.into(),
            state: PipelineState::RequirementsInput,
            total_cost_usd: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            cost_by_tier: BTreeMap::new(),
            current_model: None,
            self_update_worktree: None,
            self_update_merged: false,
            paused_from_state: None,
            reentry_count: 0,
            replan_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.current_model = Some(model.into());
        self
    }

    /// Record a terminal failure cause
    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = PipelineState::Failed;
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One occurrence of a stage within a pipeline
///
/// A stage kind can recur across replans; each occurrence gets its own row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub pipeline_id: PipelineId,
    pub kind: StageKind,
    pub state: StageState,
    /// Retry attempt this occurrence represents (0 = first try)
    #[serde(default)]
    pub attempt: u32,
    pub quality_gate: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Stage {
    pub fn new(pipeline_id: impl Into<PipelineId>, kind: StageKind) -> Self {
        Self {
            id: new_id(),
            pipeline_id: pipeline_id.into(),
            kind,
            state: StageState::Pending,
            attempt: 0,
            quality_gate: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn start(&mut self) {
        self.state = StageState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.state = StageState::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = StageState::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }
}

/// One unit of agent work inside the parallel-execution stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub pipeline_id: PipelineId,
    pub stage_id: StageId,
    pub title: String,
    /// Agent role, e.g. "backend" or "frontend"
    pub role: String,
    pub prompt: String,
    #[serde(default)]
    pub skills: Vec<String>,
    /// Rough sizing carried over from the plan, drives model routing
    #[serde(default = "default_complexity")]
    pub complexity: String,
    pub state: TaskState,
    pub worktree_path: Option<PathBuf>,
    pub branch: Option<String>,
    /// Titles of tasks that must complete before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub merge_status: Option<MergeStatus>,
    pub result_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        pipeline_id: impl Into<PipelineId>,
        stage_id: impl Into<StageId>,
        title: impl Into<String>,
        role: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            pipeline_id: pipeline_id.into(),
            stage_id: stage_id.into(),
            title: title.into(),
            role: role.into(),
            prompt: prompt.into(),
            skills: Vec::new(),
            complexity: default_complexity(),
            state: TaskState::Pending,
            worktree_path: None,
            branch: None,
            depends_on: Vec::new(),
            merge_status: None,
            result_summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_complexity(mut self, complexity: impl Into<String>) -> Self {
        self.complexity = complexity.into();
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One task in a plan's structured breakdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub title: String,
    pub role: String,
    pub prompt: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Rough sizing used for model-routing statistics
    #[serde(default = "default_complexity")]
    pub complexity: String,
}

fn default_complexity() -> String {
    "standard".to_string()
}

/// A versioned execution plan for one pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub pipeline_id: PipelineId,
    /// Starts at 1; increments on every replan
    pub version: u32,
    /// Full plan text as markdown
    pub content: String,
    /// Structured task breakdown parsed from the plan
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
    pub decision: Option<PlanDecision>,
    pub human_feedback: Option<String>,
    pub adversarial_feedback: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(pipeline_id: impl Into<PipelineId>, version: u32, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            pipeline_id: pipeline_id.into(),
            version,
            content: content.into(),
            tasks: Vec::new(),
            decision: None,
            human_feedback: None,
            adversarial_feedback: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<PlannedTask>) -> Self {
        self.tasks = tasks;
        self
    }
}

/// One spawned agent subprocess and its recorded stats
///
/// A task may accumulate several of these across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: RunId,
    pub pipeline_id: PipelineId,
    pub task_id: Option<TaskId>,
    pub model: String,
    pub pid: Option<u32>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub exit_code: Option<i32>,
    /// Number of stream events the demultiplexer produced for this run
    pub event_count: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentRun {
    pub fn new(pipeline_id: impl Into<PipelineId>, model: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            pipeline_id: pipeline_id.into(),
            task_id: None,
            model: model.into(),
            pid: None,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            exit_code: None,
            event_count: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// A blocking human question raised by the engine or a collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub id: InterventionId,
    pub pipeline_id: PipelineId,
    pub task_id: Option<TaskId>,
    pub question: String,
    /// Free-form context shown to the operator (conflict lists, diffs)
    pub context: String,
    pub status: InterventionStatus,
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Intervention {
    pub fn new(pipeline_id: impl Into<PipelineId>, question: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            pipeline_id: pipeline_id.into(),
            task_id: None,
            question: question.into(),
            context: String::new(),
            status: InterventionStatus::Pending,
            response: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

/// A human question that may be non-blocking (fire-and-forget) or blocking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consultation {
    pub id: ConsultationId,
    pub pipeline_id: PipelineId,
    pub task_id: Option<TaskId>,
    pub question: String,
    pub context: String,
    /// Blocking consultations park the caller like an intervention
    pub blocking: bool,
    pub status: ConsultationStatus,
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

impl Consultation {
    pub fn new(pipeline_id: impl Into<PipelineId>, question: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            pipeline_id: pipeline_id.into(),
            task_id: None,
            question: question.into(),
            context: String::new(),
            blocking: false,
            status: ConsultationStatus::Pending,
            response: None,
            created_at: Utc::now(),
            answered_at: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }
}

/// A layered memory entry feeding context into later agent runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub project_id: ProjectId,
    pub pipeline_id: Option<PipelineId>,
    pub task_id: Option<TaskId>,
    pub layer: MemoryLayer,
    pub kind: MemoryKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(
        project_id: impl Into<ProjectId>,
        layer: MemoryLayer,
        kind: MemoryKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            project_id: project_id.into(),
            pipeline_id: None,
            task_id: None,
            layer,
            kind,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_pipeline(mut self, pipeline_id: impl Into<PipelineId>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// A minimal tool plugin an agent produced mid-run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedTool {
    pub id: String,
    pub pipeline_id: PipelineId,
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl GeneratedTool {
    pub fn new(
        pipeline_id: impl Into<PipelineId>,
        task_id: impl Into<TaskId>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            pipeline_id: pipeline_id.into(),
            task_id: task_id.into(),
            name: name.into(),
            description: String::new(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Outcome of one agent run, recorded for model-routing statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub task_kind: String,
    pub complexity: String,
    pub model: String,
    pub success: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// A project-level applied change with rollback support
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionLog {
    pub id: String,
    pub project_id: ProjectId,
    pub pipeline_id: Option<PipelineId>,
    pub kind: EvolutionKind,
    pub description: String,
    /// Previous values, stored so the change can be rolled back
    pub previous: String,
    #[serde(default)]
    pub rolled_back: bool,
    pub created_at: DateTime<Utc>,
}

impl EvolutionLog {
    pub fn new(
        project_id: impl Into<ProjectId>,
        kind: EvolutionKind,
        description: impl Into<String>,
        previous: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            project_id: project_id.into(),
            pipeline_id: None,
            kind,
            description: description.into(),
            previous: previous.into(),
            rolled_back: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_pipeline(mut self, pipeline_id: impl Into<PipelineId>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }
}

/// One typed chunk demultiplexed from an agent's output stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamChunk {
    AssistantText { text: String },
    AssistantThinking { text: String },
    ToolUse { name: String, input: serde_json::Value },
    ToolResult { ok: bool, content: Option<String> },
    /// Cumulative usage for the run so far
    CostUpdate {
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    },
    Error { message: String },
    Done { exit_code: i32 },
}
