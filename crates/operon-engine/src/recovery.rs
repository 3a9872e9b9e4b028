//! Crash-recovery scan.
//!
//! On process start the engine resumes every pipeline left in a
//! non-terminal state. `PipelineEngine::recover_all` staggers the
//! launches with a fixed delay so a restart never spawns a herd of
//! subprocesses at once. No reentry bound is enforced here; runaway
//! pipelines are the supervisor's and replan limit's problem.

use operon_core::{PipelineId, Result, StateStore};
use tracing::info;

/// Ids of pipelines needing resumption, oldest first.
pub async fn scan_unfinished(store: &StateStore) -> Result<Vec<PipelineId>> {
    let ids: Vec<PipelineId> = store
        .list_unfinished_pipelines()
        .await?
        .into_iter()
        .map(|p| p.id)
        .collect();
    if !ids.is_empty() {
        info!(count = ids.len(), "Unfinished pipelines found for recovery");
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use operon_core::{Pipeline, PipelineState};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_scan_returns_only_unfinished_oldest_first() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let base = Utc::now();

        let mut seed = |state: PipelineState, offset_ms: i64| {
            let mut p = Pipeline::new("proj-1", "reqs");
            p.state = state;
            p.created_at = base + Duration::milliseconds(offset_ms);
            p
        };

        let young = seed(PipelineState::Testing, 30);
        let old = seed(PipelineState::ParallelExecution, 10);
        let paused = seed(PipelineState::Paused, 20);
        let done = seed(PipelineState::Completed, 0);
        let failed = seed(PipelineState::Failed, 5);
        for p in [&young, &old, &paused, &done, &failed] {
            store.save_pipeline(p).await.unwrap();
        }

        let ids = scan_unfinished(&store).await.unwrap();
        assert_eq!(ids, vec![old.id, paused.id, young.id]);
    }

    #[tokio::test]
    async fn test_scan_of_empty_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        assert!(scan_unfinished(&store).await.unwrap().is_empty());
    }
}
