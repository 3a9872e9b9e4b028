//! Pipeline cost accounting.
//!
//! The ledger never keeps a running total of its own. It recomputes
//! pipeline cost from the persisted run rows on every aggregation, so
//! repeating an aggregation after a crash or partial write can only
//! converge on the same numbers, never double-count.

use std::collections::BTreeMap;
use std::sync::Arc;

use operon_core::{AgentRun, EventBus, Pipeline, PipelineEvent, Result, StateStore};
use tracing::{debug, instrument, warn};

use crate::tiers::tier_for_model;

/// Snapshot of where a pipeline stands against its project budget.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetStatus {
    pub total_cost_usd: f64,
    pub max_budget_usd: f64,
    /// Budget left, clamped at zero once overspent.
    pub remaining_usd: f64,
    pub within_budget: bool,
}

impl BudgetStatus {
    pub fn new(total_cost_usd: f64, max_budget_usd: f64) -> Self {
        Self {
            total_cost_usd,
            max_budget_usd,
            remaining_usd: (max_budget_usd - total_cost_usd).max(0.0),
            within_budget: total_cost_usd <= max_budget_usd,
        }
    }
}

pub struct CostLedger {
    store: Arc<StateStore>,
    bus: EventBus,
}

impl CostLedger {
    pub fn new(store: Arc<StateStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Persists a run row and folds its cost into the pipeline totals.
    pub async fn record_run(&self, run: &AgentRun) -> Result<BudgetStatus> {
        self.store.save_run(run).await?;
        self.aggregate(&run.pipeline_id).await
    }

    /// Recomputes the pipeline's cost totals and per-tier breakdown
    /// from all of its run rows, writes them back, and reports budget
    /// standing. Safe to call any number of times.
    #[instrument(skip(self))]
    pub async fn aggregate(&self, pipeline_id: &str) -> Result<BudgetStatus> {
        let mut pipeline = self.store.load_pipeline(pipeline_id).await?;
        let runs = self.store.list_runs_for_pipeline(pipeline_id).await?;

        let mut total_cost = 0.0;
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        let mut by_tier: BTreeMap<String, f64> = BTreeMap::new();
        for run in &runs {
            total_cost += run.cost_usd;
            input_tokens += run.input_tokens;
            output_tokens += run.output_tokens;
            *by_tier
                .entry(tier_for_model(&run.model).to_string())
                .or_insert(0.0) += run.cost_usd;
        }

        pipeline.total_cost_usd = total_cost;
        pipeline.total_input_tokens = input_tokens;
        pipeline.total_output_tokens = output_tokens;
        pipeline.cost_by_tier = by_tier;
        pipeline.touch();
        self.store.save_pipeline(&pipeline).await?;

        let status = self.status_for(&pipeline).await?;
        debug!(
            total_cost_usd = status.total_cost_usd,
            remaining_usd = status.remaining_usd,
            within_budget = status.within_budget,
            runs = runs.len(),
            "Aggregated pipeline cost"
        );
        self.bus.emit(PipelineEvent::BudgetUpdated {
            pipeline_id: pipeline_id.to_string(),
            total_cost_usd: status.total_cost_usd,
            remaining_usd: status.remaining_usd,
            within_budget: status.within_budget,
        });
        if !status.within_budget {
            warn!(
                total_cost_usd = status.total_cost_usd,
                max_budget_usd = status.max_budget_usd,
                "Pipeline is over budget"
            );
        }
        Ok(status)
    }

    /// Budget standing from the already-persisted totals, without
    /// touching any rows.
    pub async fn status_for(&self, pipeline: &Pipeline) -> Result<BudgetStatus> {
        let project = self.store.load_project(&pipeline.project_id).await?;
        Ok(BudgetStatus::new(
            pipeline.total_cost_usd,
            project.max_budget_usd,
        ))
    }

    /// Current standing for a pipeline id; loads, never writes.
    pub async fn check(&self, pipeline_id: &str) -> Result<BudgetStatus> {
        let pipeline = self.store.load_pipeline(pipeline_id).await?;
        self.status_for(&pipeline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use operon_core::Project;
    use tempfile::TempDir;

    async fn fixture(max_budget_usd: f64) -> (TempDir, CostLedger, Arc<StateStore>, Pipeline) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));
        let project = Project::new("demo", "/tmp/demo").with_budget(max_budget_usd);
        store.save_project(&project).await.unwrap();
        let pipeline = Pipeline::new(project.id.clone(), "req");
        store.save_pipeline(&pipeline).await.unwrap();
        let ledger = CostLedger::new(Arc::clone(&store), EventBus::default());
        (dir, ledger, store, pipeline)
    }

    fn run(pipeline_id: &str, model: &str, cost: f64) -> AgentRun {
        let mut run = AgentRun::new(pipeline_id, model);
        run.cost_usd = cost;
        run.input_tokens = 1_000;
        run.output_tokens = 500;
        run
    }

    #[tokio::test]
    async fn test_spend_over_budget_flips_within_and_clamps_remaining() {
        let (_dir, ledger, _store, pipeline) = fixture(10.0).await;

        let status = ledger
            .record_run(&run(&pipeline.id, "claude-sonnet-4", 7.0))
            .await
            .unwrap();
        assert!(status.within_budget);
        assert!((status.remaining_usd - 3.0).abs() < 1e-9);

        let status = ledger
            .record_run(&run(&pipeline.id, "claude-sonnet-4", 5.0))
            .await
            .unwrap();
        assert!(!status.within_budget);
        assert!((status.total_cost_usd - 12.0).abs() < 1e-9);
        assert_eq!(status.remaining_usd, 0.0);
    }

    #[tokio::test]
    async fn test_spend_exactly_at_budget_is_within() {
        let (_dir, ledger, _store, pipeline) = fixture(10.0).await;
        let status = ledger
            .record_run(&run(&pipeline.id, "claude-sonnet-4", 10.0))
            .await
            .unwrap();
        assert!(status.within_budget);
        assert_eq!(status.remaining_usd, 0.0);
    }

    #[tokio::test]
    async fn test_aggregation_is_idempotent() {
        let (_dir, ledger, store, pipeline) = fixture(25.0).await;
        ledger
            .record_run(&run(&pipeline.id, "claude-opus-4", 2.5))
            .await
            .unwrap();

        let first = ledger.aggregate(&pipeline.id).await.unwrap();
        let second = ledger.aggregate(&pipeline.id).await.unwrap();
        assert_eq!(first, second);

        let stored = store.load_pipeline(&pipeline.id).await.unwrap();
        assert!((stored.total_cost_usd - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_costs_break_down_by_tier() {
        let (_dir, ledger, store, pipeline) = fixture(25.0).await;
        ledger
            .record_run(&run(&pipeline.id, "claude-haiku-4", 0.5))
            .await
            .unwrap();
        ledger
            .record_run(&run(&pipeline.id, "claude-sonnet-4", 2.0))
            .await
            .unwrap();
        ledger
            .record_run(&run(&pipeline.id, "claude-opus-4", 4.0))
            .await
            .unwrap();

        let stored = store.load_pipeline(&pipeline.id).await.unwrap();
        assert!((stored.cost_by_tier["economical"] - 0.5).abs() < 1e-9);
        assert!((stored.cost_by_tier["balanced"] - 2.0).abs() < 1e-9);
        assert!((stored.cost_by_tier["most_capable"] - 4.0).abs() < 1e-9);
        assert_eq!(stored.total_input_tokens, 3_000);
    }

    #[tokio::test]
    async fn test_budget_update_events_are_emitted() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let project = Project::new("demo", "/tmp/demo").with_budget(1.0);
        store.save_project(&project).await.unwrap();
        let pipeline = Pipeline::new(project.id.clone(), "req");
        store.save_pipeline(&pipeline).await.unwrap();

        let ledger = CostLedger::new(Arc::clone(&store), bus);
        ledger
            .record_run(&run(&pipeline.id, "claude-sonnet-4", 2.0))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            PipelineEvent::BudgetUpdated {
                within_budget,
                remaining_usd,
                ..
            } => {
                assert!(!within_budget);
                assert_eq!(remaining_usd, 0.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
