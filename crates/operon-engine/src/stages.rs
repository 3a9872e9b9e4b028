//! Agent execution on behalf of stages.
//!
//! `StageRunner` owns the run lifecycle a stage cares about: persist the
//! run row, spawn, re-broadcast every chunk, settle stats through the
//! cost ledger when the process exits.

use std::sync::Arc;

use chrono::Utc;
use operon_agent::{AgentSpawner, SpawnSpec};
use operon_core::{
    AgentRun, EventBus, OperonError, PipelineEvent, Result, RunId, StateStore, StreamChunk,
};
use operon_ledger::CostLedger;
use tracing::{debug, info, instrument, warn};

/// What one finished agent run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    /// Concatenated assistant text, newline-joined
    pub transcript: String,
    pub exit_code: i32,
    pub cost_usd: f64,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct StageRunner<A: AgentSpawner> {
    agents: Arc<A>,
    store: Arc<StateStore>,
    ledger: Arc<CostLedger>,
    bus: EventBus,
}

impl<A: AgentSpawner> StageRunner<A> {
    pub fn new(
        agents: Arc<A>,
        store: Arc<StateStore>,
        ledger: Arc<CostLedger>,
        bus: EventBus,
    ) -> Self {
        Self {
            agents,
            store,
            ledger,
            bus,
        }
    }

    /// Spawns one agent and drains it to completion.
    ///
    /// The run row is saved before the spawn so a crash mid-run still
    /// leaves an accountable record. Chunks are re-broadcast on the bus
    /// as they arrive; the final stats land through the ledger.
    #[instrument(skip(self, spec))]
    pub async fn run_agent(
        &self,
        pipeline_id: &str,
        task_id: Option<&str>,
        model: &str,
        spec: SpawnSpec,
    ) -> Result<RunOutcome> {
        let mut run = AgentRun::new(pipeline_id, model);
        if let Some(task_id) = task_id {
            run = run.with_task(task_id);
        }
        self.store.save_run(&run).await?;

        let mut handle = self.agents.spawn(&run.id, spec).await?;
        run.pid = handle.pid;
        self.store.save_run(&run).await?;
        debug!(run_id = %run.id, pid = ?run.pid, "Agent run started");

        let mut transcript = String::new();
        let mut exit_code = -1;
        while let Some(chunk) = handle.chunks.recv().await {
            run.event_count += 1;
            match &chunk {
                StreamChunk::AssistantText { text } => {
                    transcript.push_str(text);
                    transcript.push('\n');
                }
                StreamChunk::CostUpdate {
                    input_tokens,
                    output_tokens,
                    cost_usd,
                } => {
                    run.input_tokens += input_tokens;
                    run.output_tokens += output_tokens;
                    run.cost_usd += cost_usd;
                }
                StreamChunk::Done { exit_code: code } => {
                    exit_code = *code;
                }
                StreamChunk::Error { message } => {
                    warn!(run_id = %run.id, "Agent error event: {}", message);
                }
                _ => {}
            }
            self.bus.emit(PipelineEvent::Chunk {
                pipeline_id: pipeline_id.to_string(),
                run_id: run.id.clone(),
                chunk,
            });
        }

        run.exit_code = Some(exit_code);
        run.completed_at = Some(Utc::now());
        self.ledger.record_run(&run).await?;
        info!(
            run_id = %run.id,
            exit_code,
            cost_usd = run.cost_usd,
            events = run.event_count,
            "Agent run settled"
        );

        Ok(RunOutcome {
            run_id: run.id,
            transcript,
            exit_code,
            cost_usd: run.cost_usd,
        })
    }

    /// Like [`Self::run_agent`], but a non-zero exit becomes a typed
    /// error so the supervisor can treat it as retryable.
    pub async fn run_expecting_success(
        &self,
        pipeline_id: &str,
        task_id: Option<&str>,
        model: &str,
        spec: SpawnSpec,
    ) -> Result<RunOutcome> {
        let outcome = self.run_agent(pipeline_id, task_id, model, spec).await?;
        if !outcome.succeeded() {
            return Err(OperonError::AgentFailed(format!(
                "run {} exited with code {}",
                outcome.run_id, outcome.exit_code
            )));
        }
        Ok(outcome)
    }

    /// Terminates every live run belonging to one pipeline. Unknown or
    /// already-finished runs are skipped. Returns the kill count.
    pub async fn kill_pipeline_runs(&self, pipeline_id: &str) -> usize {
        let mut killed = 0;
        for run_id in self.agents.active_runs().await {
            let owns = match self.store.load_run(&run_id).await {
                Ok(run) => run.pipeline_id == pipeline_id,
                Err(_) => false,
            };
            if owns && self.agents.kill(&run_id).await {
                killed += 1;
            }
        }
        if killed > 0 {
            info!(pipeline_id, killed, "Killed active agent runs");
        }
        killed
    }
}

/// Last `max_chars` characters of a transcript, used for task result
/// summaries.
pub fn tail_excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    let start = trimmed
        .char_indices()
        .nth(count - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("...{}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use operon_agent::MockAgentSpawner;
    use operon_core::{Pipeline, Project};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<StateStore>,
        bus: EventBus,
        pipeline: Pipeline,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));
        let bus = EventBus::default();
        let project = Project::new("demo", "/tmp/demo").with_budget(50.0);
        store.save_project(&project).await.unwrap();
        let pipeline = Pipeline::new(project.id.clone(), "reqs");
        store.save_pipeline(&pipeline).await.unwrap();
        Fixture {
            _dir: dir,
            store,
            bus,
            pipeline,
        }
    }

    fn runner(f: &Fixture, agents: MockAgentSpawner) -> StageRunner<MockAgentSpawner> {
        let ledger = Arc::new(CostLedger::new(Arc::clone(&f.store), f.bus.clone()));
        StageRunner::new(Arc::new(agents), Arc::clone(&f.store), ledger, f.bus.clone())
    }

    async fn wait_for_active(agents: &MockAgentSpawner, n: usize) {
        for _ in 0..400 {
            if agents.active_runs().await.len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never saw {} active runs", n);
    }

    #[tokio::test]
    async fn test_run_settles_stats_into_store_and_ledger() {
        let f = fixture().await;
        let agents = MockAgentSpawner::new()
            .with_script(vec![
                StreamChunk::AssistantText {
                    text: "working on it".to_string(),
                },
                StreamChunk::CostUpdate {
                    input_tokens: 100,
                    output_tokens: 40,
                    cost_usd: 0.25,
                },
                StreamChunk::Done { exit_code: 0 },
            ])
            .await;
        let runner = runner(&f, agents);

        let outcome = runner
            .run_agent(&f.pipeline.id, None, "claude-sonnet-4", SpawnSpec::new("go", "/tmp"))
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert!(outcome.transcript.contains("working on it"));
        assert!((outcome.cost_usd - 0.25).abs() < 1e-9);

        let run = f.store.load_run(&outcome.run_id).await.unwrap();
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.input_tokens, 100);
        assert_eq!(run.event_count, 3);
        assert!(run.completed_at.is_some());

        let pipeline = f.store.load_pipeline(&f.pipeline.id).await.unwrap();
        assert!((pipeline.total_cost_usd - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_chunks_are_rebroadcast_in_order() {
        let f = fixture().await;
        let mut rx = f.bus.subscribe();
        let agents = MockAgentSpawner::new()
            .with_script(vec![
                StreamChunk::AssistantText {
                    text: "a".to_string(),
                },
                StreamChunk::Done { exit_code: 0 },
            ])
            .await;
        let runner = runner(&f, agents);
        runner
            .run_agent(&f.pipeline.id, None, "claude-haiku-4", SpawnSpec::new("go", "/tmp"))
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::Chunk { chunk, .. } = event {
                chunks.push(chunk);
            }
        }
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[0], StreamChunk::AssistantText { .. }));
        assert!(matches!(chunks[1], StreamChunk::Done { exit_code: 0 }));
    }

    #[tokio::test]
    async fn test_nonzero_exit_maps_to_typed_error() {
        let f = fixture().await;
        let agents = MockAgentSpawner::new()
            .with_script(vec![StreamChunk::Done { exit_code: 2 }])
            .await;
        let runner = runner(&f, agents);

        let err = runner
            .run_expecting_success(&f.pipeline.id, None, "claude-sonnet-4", SpawnSpec::new("go", "/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, OperonError::AgentFailed(_)));
    }

    #[tokio::test]
    async fn test_kill_pipeline_runs_spares_other_pipelines() {
        let f = fixture().await;
        let other = Pipeline::new(f.pipeline.project_id.clone(), "other");
        f.store.save_pipeline(&other).await.unwrap();

        // Two hanging scripts: no Done, so both runs stay active
        let agents = MockAgentSpawner::new()
            .with_script(vec![StreamChunk::AssistantText {
                text: "busy".to_string(),
            }])
            .await
            .with_script(vec![StreamChunk::AssistantText {
                text: "busy".to_string(),
            }])
            .await;
        let runner = Arc::new(runner(&f, agents.clone()));

        let r1 = Arc::clone(&runner);
        let p1 = f.pipeline.id.clone();
        let own = tokio::spawn(async move {
            r1.run_agent(&p1, None, "claude-sonnet-4", SpawnSpec::new("go", "/tmp"))
                .await
        });
        wait_for_active(&agents, 1).await;

        let r2 = Arc::clone(&runner);
        let p2 = other.id.clone();
        let foreign = tokio::spawn(async move {
            r2.run_agent(&p2, None, "claude-sonnet-4", SpawnSpec::new("go", "/tmp"))
                .await
        });
        wait_for_active(&agents, 2).await;

        let killed = runner.kill_pipeline_runs(&f.pipeline.id).await;
        assert_eq!(killed, 1);

        let outcome = own.await.unwrap().unwrap();
        assert_eq!(outcome.exit_code, 130);
        assert_eq!(agents.active_runs().await.len(), 1);

        runner.kill_pipeline_runs(&other.id).await;
        foreign.await.unwrap().unwrap();
    }

    #[test]
    fn test_tail_excerpt_keeps_short_text_and_trims_long() {
        assert_eq!(tail_excerpt("  short  ", 20), "short");
        let long = "x".repeat(30);
        let tail = tail_excerpt(&long, 10);
        assert_eq!(tail, format!("...{}", "x".repeat(10)));
    }
}
