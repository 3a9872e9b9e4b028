//! Outbound event fan-out
//!
//! One broadcast channel per process carries every observable update
//! (pipeline/stage/task/plan changes, stream chunks, gate lifecycle,
//! budget updates). Emitting is fire-and-forget: a send with no
//! subscribers is not an error and never blocks protocol progress.

use tokio::sync::broadcast;

use crate::state::{PipelineState, StageKind};
use crate::types::{
    ConsultationId, InterventionId, MergeStatus, PipelineId, PlanId, RunId, StreamChunk, TaskId,
    TaskState,
};

/// Everything observers (dashboards, the CLI) can subscribe to
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged {
        pipeline_id: PipelineId,
        from: PipelineState,
        to: PipelineState,
    },
    StageStarted {
        pipeline_id: PipelineId,
        kind: StageKind,
        attempt: u32,
    },
    StageCompleted {
        pipeline_id: PipelineId,
        kind: StageKind,
    },
    StageFailed {
        pipeline_id: PipelineId,
        kind: StageKind,
        error: String,
    },
    TaskStateChanged {
        pipeline_id: PipelineId,
        task_id: TaskId,
        state: TaskState,
    },
    PlanAwaitingReview {
        pipeline_id: PipelineId,
        plan_id: PlanId,
        version: u32,
    },
    /// One demultiplexed chunk from a live agent run
    Chunk {
        pipeline_id: PipelineId,
        run_id: RunId,
        chunk: StreamChunk,
    },
    InterventionRequested {
        pipeline_id: PipelineId,
        intervention_id: InterventionId,
        question: String,
    },
    InterventionResolved {
        pipeline_id: PipelineId,
        intervention_id: InterventionId,
    },
    ConsultationRequested {
        pipeline_id: PipelineId,
        consultation_id: ConsultationId,
        blocking: bool,
        question: String,
    },
    ConsultationAnswered {
        pipeline_id: PipelineId,
        consultation_id: ConsultationId,
    },
    ConsultationExpired {
        pipeline_id: PipelineId,
        consultation_id: ConsultationId,
    },
    BudgetUpdated {
        pipeline_id: PipelineId,
        total_cost_usd: f64,
        remaining_usd: f64,
        within_budget: bool,
    },
    MergeTaskFinished {
        pipeline_id: PipelineId,
        task_id: TaskId,
        status: MergeStatus,
    },
    PipelineResumed {
        pipeline_id: PipelineId,
        reentry_count: u32,
    },
    Notification {
        pipeline_id: Option<PipelineId>,
        message: String,
    },
}

/// Single-producer-per-event, multi-consumer broadcast bus
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to whoever is listening. Never blocks, never fails.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
