//! Write-through JSON state store
//!
//! One JSON document per entity instance under `.operon/state/`, plus an
//! append-only NDJSON log for model-performance records. The engine writes
//! through on every mutation; there is no cache layer. Pipelines are never
//! deleted; terminal rows are the historical record.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::debug;

use crate::types::{
    AgentRun, Consultation, ConsultationStatus, EvolutionLog, GeneratedTool, Intervention,
    InterventionStatus, MemoryEntry, MemoryLayer, ModelPerformance, Pipeline, Plan, Project,
    Stage, Task,
};
use crate::{OperonError, Result};

const PROJECTS: &str = "projects";
const PIPELINES: &str = "pipelines";
const STAGES: &str = "stages";
const TASKS: &str = "tasks";
const PLANS: &str = "plans";
const RUNS: &str = "runs";
const INTERVENTIONS: &str = "interventions";
const CONSULTATIONS: &str = "consultations";
const MEMORY: &str = "memory";
const TOOLS: &str = "tools";
const EVOLUTION: &str = "evolution";

/// Durable store for all Operon entities
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Create a store rooted at `root` (typically `.operon/state`).
    /// Directories are created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn write_doc<T: Serialize>(&self, kind: &str, id: &str, value: &T) -> Result<()> {
        let dir = self.root.join(kind);
        fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{}.json", id));
        let tmp = dir.join(format!("{}.json.tmp", id));
        let content = serde_json::to_vec_pretty(value)?;

        // Write-then-rename keeps readers from seeing a torn document
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_doc<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Result<T> {
        let path = self.root.join(kind).join(format!("{}.json", id));
        if !path.exists() {
            return Err(OperonError::EntityNotFound(format!("{}/{}", kind, id)));
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn list_docs<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let dir = self.root.join(kind);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut docs = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<T>(&content) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    debug!("Skipping unreadable document {}: {}", path.display(), e);
                }
            }
        }
        Ok(docs)
    }

    // Projects

    pub async fn save_project(&self, project: &Project) -> Result<()> {
        self.write_doc(PROJECTS, &project.id, project).await
    }

    pub async fn load_project(&self, id: &str) -> Result<Project> {
        self.read_doc(PROJECTS, id).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut projects: Vec<Project> = self.list_docs(PROJECTS).await?;
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }

    // Pipelines

    pub async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        self.write_doc(PIPELINES, &pipeline.id, pipeline).await
    }

    pub async fn load_pipeline(&self, id: &str) -> Result<Pipeline> {
        self.read_doc(PIPELINES, id)
            .await
            .map_err(|e| match e {
                OperonError::EntityNotFound(_) => OperonError::PipelineNotFound(id.to_string()),
                other => other,
            })
    }

    pub async fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        let mut pipelines: Vec<Pipeline> = self.list_docs(PIPELINES).await?;
        pipelines.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pipelines)
    }

    /// Pipelines left in a non-terminal state, oldest first.
    /// This is the crash-recovery scan set.
    pub async fn list_unfinished_pipelines(&self) -> Result<Vec<Pipeline>> {
        let pipelines = self.list_pipelines().await?;
        Ok(pipelines
            .into_iter()
            .filter(|p| p.state.can_resume())
            .collect())
    }

    // Stages

    pub async fn save_stage(&self, stage: &Stage) -> Result<()> {
        self.write_doc(STAGES, &stage.id, stage).await
    }

    pub async fn list_stages_for_pipeline(&self, pipeline_id: &str) -> Result<Vec<Stage>> {
        let mut stages: Vec<Stage> = self.list_docs(STAGES).await?;
        stages.retain(|s| s.pipeline_id == pipeline_id);
        stages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(stages)
    }

    // Tasks

    pub async fn save_task(&self, task: &Task) -> Result<()> {
        self.write_doc(TASKS, &task.id, task).await
    }

    pub async fn load_task(&self, id: &str) -> Result<Task> {
        self.read_doc(TASKS, id).await
    }

    pub async fn list_tasks_for_pipeline(&self, pipeline_id: &str) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.list_docs(TASKS).await?;
        tasks.retain(|t| t.pipeline_id == pipeline_id);
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    // Plans

    pub async fn save_plan(&self, plan: &Plan) -> Result<()> {
        self.write_doc(PLANS, &plan.id, plan).await
    }

    pub async fn load_plan(&self, id: &str) -> Result<Plan> {
        self.read_doc(PLANS, id).await
    }

    /// Highest-version plan for a pipeline, if any
    pub async fn latest_plan(&self, pipeline_id: &str) -> Result<Option<Plan>> {
        let mut plans: Vec<Plan> = self.list_docs(PLANS).await?;
        plans.retain(|p| p.pipeline_id == pipeline_id);
        plans.sort_by_key(|p| p.version);
        Ok(plans.pop())
    }

    // Agent runs

    pub async fn save_run(&self, run: &AgentRun) -> Result<()> {
        self.write_doc(RUNS, &run.id, run).await
    }

    pub async fn load_run(&self, id: &str) -> Result<AgentRun> {
        self.read_doc(RUNS, id).await
    }

    pub async fn list_runs_for_pipeline(&self, pipeline_id: &str) -> Result<Vec<AgentRun>> {
        let mut runs: Vec<AgentRun> = self.list_docs(RUNS).await?;
        runs.retain(|r| r.pipeline_id == pipeline_id);
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }

    // Interventions

    pub async fn save_intervention(&self, intervention: &Intervention) -> Result<()> {
        self.write_doc(INTERVENTIONS, &intervention.id, intervention)
            .await
    }

    pub async fn load_intervention(&self, id: &str) -> Result<Intervention> {
        self.read_doc(INTERVENTIONS, id).await
    }

    pub async fn list_pending_interventions(&self, pipeline_id: &str) -> Result<Vec<Intervention>> {
        let mut interventions: Vec<Intervention> = self.list_docs(INTERVENTIONS).await?;
        interventions.retain(|i| {
            i.pipeline_id == pipeline_id && i.status == InterventionStatus::Pending
        });
        interventions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(interventions)
    }

    // Consultations

    pub async fn save_consultation(&self, consultation: &Consultation) -> Result<()> {
        self.write_doc(CONSULTATIONS, &consultation.id, consultation)
            .await
    }

    pub async fn load_consultation(&self, id: &str) -> Result<Consultation> {
        self.read_doc(CONSULTATIONS, id).await
    }

    pub async fn list_pending_consultations(&self, pipeline_id: &str) -> Result<Vec<Consultation>> {
        let mut consultations: Vec<Consultation> = self.list_docs(CONSULTATIONS).await?;
        consultations.retain(|c| {
            c.pipeline_id == pipeline_id && c.status == ConsultationStatus::Pending
        });
        consultations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(consultations)
    }

    // Memory

    pub async fn save_memory(&self, entry: &MemoryEntry) -> Result<()> {
        self.write_doc(MEMORY, &entry.id, entry).await
    }

    /// Memory entries for a project, optionally restricted to one layer
    pub async fn list_memory(
        &self,
        project_id: &str,
        layer: Option<MemoryLayer>,
    ) -> Result<Vec<MemoryEntry>> {
        let mut entries: Vec<MemoryEntry> = self.list_docs(MEMORY).await?;
        entries.retain(|m| m.project_id == project_id);
        if let Some(layer) = layer {
            entries.retain(|m| m.layer == layer);
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    // Generated tools

    pub async fn save_tool(&self, tool: &GeneratedTool) -> Result<()> {
        self.write_doc(TOOLS, &tool.id, tool).await
    }

    pub async fn list_tools_for_pipeline(&self, pipeline_id: &str) -> Result<Vec<GeneratedTool>> {
        let mut tools: Vec<GeneratedTool> = self.list_docs(TOOLS).await?;
        tools.retain(|t| t.pipeline_id == pipeline_id);
        Ok(tools)
    }

    // Evolution log

    pub async fn save_evolution(&self, entry: &EvolutionLog) -> Result<()> {
        self.write_doc(EVOLUTION, &entry.id, entry).await
    }

    pub async fn list_evolution_for_project(&self, project_id: &str) -> Result<Vec<EvolutionLog>> {
        let mut entries: Vec<EvolutionLog> = self.list_docs(EVOLUTION).await?;
        entries.retain(|e| e.project_id == project_id);
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    /// Flag an evolution entry as rolled back, exactly once
    pub async fn mark_evolution_rolled_back(&self, id: &str) -> Result<EvolutionLog> {
        let mut entry: EvolutionLog = self.read_doc(EVOLUTION, id).await?;
        if entry.rolled_back {
            return Err(OperonError::Storage(format!(
                "Evolution entry already rolled back: {}",
                id
            )));
        }
        entry.rolled_back = true;
        self.write_doc(EVOLUTION, &id.to_string(), &entry).await?;
        Ok(entry)
    }

    // Model performance (append-only NDJSON)

    pub async fn append_model_performance(&self, record: &ModelPerformance) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let path = self.root.join("model_performance.ndjson");
        let line = serde_json::to_string(record)?;

        use tokio::io::AsyncWriteExt;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn load_model_performance(&self) -> Result<Vec<ModelPerformance>> {
        let path = self.root.join("model_performance.ndjson");
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path).await?;
        let mut records = Vec::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ModelPerformance>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    debug!("Skipping unreadable performance line: {}", e);
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PipelineState;
    use crate::types::{EvolutionKind, MemoryKind};
    use chrono::Utc;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_pipeline_round_trip() {
        let (_dir, store) = store();
        let pipeline = Pipeline::new("proj-1", "Add search");
        store.save_pipeline(&pipeline).await.unwrap();

        let loaded = store.load_pipeline(&pipeline.id).await.unwrap();
        assert_eq!(loaded.id, pipeline.id);
        assert_eq!(loaded.requirements, "Add search");
        assert_eq!(loaded.state, PipelineState::RequirementsInput);
    }

    #[tokio::test]
    async fn test_load_missing_pipeline_is_typed() {
        let (_dir, store) = store();
        let err = store.load_pipeline("nope").await.unwrap_err();
        assert!(matches!(err, OperonError::PipelineNotFound(_)));
    }

    #[tokio::test]
    async fn test_unfinished_filter_excludes_terminal() {
        let (_dir, store) = store();

        let mut done = Pipeline::new("proj-1", "a");
        done.state = PipelineState::Completed;
        let mut failed = Pipeline::new("proj-1", "b");
        failed.state = PipelineState::Failed;
        let mut running = Pipeline::new("proj-1", "c");
        running.state = PipelineState::Testing;
        let paused = {
            let mut p = Pipeline::new("proj-1", "d");
            p.state = PipelineState::Paused;
            p
        };

        for p in [&done, &failed, &running, &paused] {
            store.save_pipeline(p).await.unwrap();
        }

        let unfinished = store.list_unfinished_pipelines().await.unwrap();
        let ids: Vec<_> = unfinished.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(unfinished.len(), 2);
        assert!(ids.contains(&running.id.as_str()));
        assert!(ids.contains(&paused.id.as_str()));
    }

    #[tokio::test]
    async fn test_latest_plan_picks_highest_version() {
        let (_dir, store) = store();
        let v1 = Plan::new("pipe-1", 1, "plan v1");
        let v2 = Plan::new("pipe-1", 2, "plan v2");
        let other = Plan::new("pipe-2", 9, "unrelated");
        for plan in [&v1, &v2, &other] {
            store.save_plan(plan).await.unwrap();
        }

        let latest = store.latest_plan("pipe-1").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.content, "plan v2");

        assert!(store.latest_plan("pipe-3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_runs_filtered_by_pipeline() {
        let (_dir, store) = store();
        let run_a = AgentRun::new("pipe-1", "claude-sonnet-4");
        let run_b = AgentRun::new("pipe-1", "claude-haiku-4");
        let run_c = AgentRun::new("pipe-2", "claude-sonnet-4");
        for run in [&run_a, &run_b, &run_c] {
            store.save_run(run).await.unwrap();
        }

        let runs = store.list_runs_for_pipeline("pipe-1").await.unwrap();
        assert_eq!(runs.len(), 2);
    }

    #[tokio::test]
    async fn test_tools_filtered_by_pipeline() {
        let (_dir, store) = store();
        let ours = GeneratedTool::new("pipe-1", "task-1", "lint-check", "#!/bin/sh\nexit 0\n");
        let other = GeneratedTool::new("pipe-2", "task-9", "schema-dump", "select 1;");
        for tool in [&ours, &other] {
            store.save_tool(tool).await.unwrap();
        }

        let tools = store.list_tools_for_pipeline("pipe-1").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "lint-check");
        assert_eq!(tools[0].task_id, "task-1");
    }

    #[tokio::test]
    async fn test_pending_consultation_filter() {
        let (_dir, store) = store();
        let pending = Consultation::new("pipe-1", "Which db?");
        let mut answered = Consultation::new("pipe-1", "Which cache?");
        answered.status = ConsultationStatus::Answered;
        let other = Consultation::new("pipe-2", "Which queue?");
        for c in [&pending, &answered, &other] {
            store.save_consultation(c).await.unwrap();
        }

        let found = store.list_pending_consultations("pipe-1").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, pending.id);
    }

    #[tokio::test]
    async fn test_memory_layer_filter() {
        let (_dir, store) = store();
        let l1 = MemoryEntry::new("proj-1", MemoryLayer::L1, MemoryKind::Decision, "use oauth");
        let l3 = MemoryEntry::new("proj-1", MemoryLayer::L3, MemoryKind::Pattern, "retry flaky");
        for m in [&l1, &l3] {
            store.save_memory(m).await.unwrap();
        }

        let decisions = store
            .list_memory("proj-1", Some(MemoryLayer::L1))
            .await
            .unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].content, "use oauth");

        let all = store.list_memory("proj-1", None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_evolution_rollback_guard() {
        let (_dir, store) = store();
        let entry = EvolutionLog::new("proj-1", EvolutionKind::Config, "bump timeout", "900");
        store.save_evolution(&entry).await.unwrap();

        let rolled = store.mark_evolution_rolled_back(&entry.id).await.unwrap();
        assert!(rolled.rolled_back);

        let err = store.mark_evolution_rolled_back(&entry.id).await.unwrap_err();
        assert!(err.to_string().contains("already rolled back"));
    }

    #[tokio::test]
    async fn test_model_performance_append_and_load() {
        let (_dir, store) = store();
        let record = ModelPerformance {
            task_kind: "backend".to_string(),
            complexity: "standard".to_string(),
            model: "claude-sonnet-4".to_string(),
            success: true,
            input_tokens: 1000,
            output_tokens: 500,
            duration_ms: 4200,
            recorded_at: Utc::now(),
        };
        store.append_model_performance(&record).await.unwrap();
        store.append_model_performance(&record).await.unwrap();

        let loaded = store.load_model_performance().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].model, "claude-sonnet-4");
    }

    #[tokio::test]
    async fn test_garbage_lines_are_skipped() {
        let (_dir, store) = store();
        let record = ModelPerformance {
            task_kind: "test".to_string(),
            complexity: "standard".to_string(),
            model: "claude-haiku-4".to_string(),
            success: false,
            input_tokens: 10,
            output_tokens: 5,
            duration_ms: 100,
            recorded_at: Utc::now(),
        };
        store.append_model_performance(&record).await.unwrap();

        // Corrupt the log with a partial line
        let path = store.root().join("model_performance.ndjson");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"task_kind\": \"trunc");
        std::fs::write(&path, content).unwrap();

        let loaded = store.load_model_performance().await.unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
