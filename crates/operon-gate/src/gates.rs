//! Intervention and consultation gates.
//!
//! An *intervention* parks the pipeline until a human responds. A
//! *consultation* asks without stopping anything, unless raised as a
//! *block*, which parks the calling stage like an intervention does.
//! Every gate is persisted before it parks, so pending questions
//! survive a crash and show up in status listings after restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use operon_core::{
    Consultation, ConsultationId, ConsultationStatus, EventBus, Intervention, InterventionId,
    InterventionStatus, MemoryEntry, MemoryKind, MemoryLayer, OperonError, PipelineEvent,
    PipelineId, Result, StateStore,
};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, instrument};

use crate::hold::HoldCounter;

/// Sentinel answer delivered to parked callers when their pipeline's
/// gates are expired (cancellation, shutdown).
pub const EXPIRED_ANSWER: &str = "expired";

struct ParkedGate {
    pipeline_id: PipelineId,
    tx: oneshot::Sender<String>,
}

/// Single point of contact for every human question a pipeline asks.
pub struct GateManager {
    store: Arc<StateStore>,
    bus: EventBus,
    parked_interventions: Mutex<HashMap<InterventionId, ParkedGate>>,
    parked_blocks: Mutex<HashMap<ConsultationId, ParkedGate>>,
    holds: HoldCounter,
}

impl GateManager {
    pub fn new(store: Arc<StateStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            parked_interventions: Mutex::new(HashMap::new()),
            parked_blocks: Mutex::new(HashMap::new()),
            holds: HoldCounter::new(),
        }
    }

    /// Counter the supervisor consults to suspend stage timeouts while
    /// a blocking gate is parked.
    pub fn hold_counter(&self) -> HoldCounter {
        self.holds.clone()
    }

    /// Number of callers currently parked on a gate.
    pub async fn parked_count(&self) -> usize {
        self.parked_interventions.lock().await.len() + self.parked_blocks.lock().await.len()
    }

    /// Raises a blocking intervention and parks until a human resolves
    /// it. The record is persisted before parking. Returns the
    /// operator's response, or [`EXPIRED_ANSWER`] if the pipeline's
    /// gates were expired while waiting.
    #[instrument(skip(self, intervention), fields(intervention_id = %intervention.id))]
    pub async fn request_intervention(&self, intervention: Intervention) -> Result<String> {
        let id = intervention.id.clone();
        let pipeline_id = intervention.pipeline_id.clone();
        self.store.save_intervention(&intervention).await?;

        let (tx, rx) = oneshot::channel();
        self.parked_interventions.lock().await.insert(
            id.clone(),
            ParkedGate {
                pipeline_id: pipeline_id.clone(),
                tx,
            },
        );
        self.bus.emit(PipelineEvent::InterventionRequested {
            pipeline_id,
            intervention_id: id.clone(),
            question: intervention.question.clone(),
        });
        info!(question = %intervention.question, "Intervention raised; waiting for operator");

        let _hold = self.holds.hold();
        rx.await.map_err(|_| OperonError::GateClosed(id))
    }

    /// Resolves a pending intervention with the operator's response.
    ///
    /// Exactly-once: a second resolution attempt is rejected, so two
    /// operators cannot both steer the same question.
    pub async fn resolve_intervention(&self, id: &str, response: &str) -> Result<Intervention> {
        let mut intervention = match self.store.load_intervention(id).await {
            Ok(i) => i,
            Err(OperonError::EntityNotFound(_)) => {
                return Err(OperonError::GateNotFound(id.to_string()))
            }
            Err(err) => return Err(err),
        };
        if intervention.status == InterventionStatus::Resolved {
            return Err(OperonError::GateAlreadyResolved(id.to_string()));
        }

        intervention.status = InterventionStatus::Resolved;
        intervention.response = Some(response.to_string());
        intervention.resolved_at = Some(Utc::now());
        self.store.save_intervention(&intervention).await?;

        if let Some(parked) = self.parked_interventions.lock().await.remove(id) {
            // The caller may have been cancelled; a dead receiver is fine.
            let _ = parked.tx.send(response.to_string());
        }
        self.bus.emit(PipelineEvent::InterventionResolved {
            pipeline_id: intervention.pipeline_id.clone(),
            intervention_id: intervention.id.clone(),
        });
        info!(intervention_id = %intervention.id, "Intervention resolved");
        Ok(intervention)
    }

    /// Asks a non-blocking question and returns its id immediately.
    pub async fn request_consultation(&self, consultation: Consultation) -> Result<ConsultationId> {
        let mut consultation = consultation;
        consultation.blocking = false;
        self.store.save_consultation(&consultation).await?;
        self.bus.emit(PipelineEvent::ConsultationRequested {
            pipeline_id: consultation.pipeline_id.clone(),
            consultation_id: consultation.id.clone(),
            blocking: false,
            question: consultation.question.clone(),
        });
        debug!(consultation_id = %consultation.id, "Consultation filed");
        Ok(consultation.id)
    }

    /// Asks a blocking question mid-stage and parks until answered.
    /// The stage clock is held for the whole park.
    #[instrument(skip(self, consultation), fields(consultation_id = %consultation.id))]
    pub async fn request_block(&self, consultation: Consultation) -> Result<String> {
        let consultation = consultation.blocking();
        let id = consultation.id.clone();
        let pipeline_id = consultation.pipeline_id.clone();
        self.store.save_consultation(&consultation).await?;

        let (tx, rx) = oneshot::channel();
        self.parked_blocks.lock().await.insert(
            id.clone(),
            ParkedGate {
                pipeline_id: pipeline_id.clone(),
                tx,
            },
        );
        self.bus.emit(PipelineEvent::ConsultationRequested {
            pipeline_id,
            consultation_id: id.clone(),
            blocking: true,
            question: consultation.question.clone(),
        });
        info!(question = %consultation.question, "Blocking consultation raised");

        let _hold = self.holds.hold();
        rx.await.map_err(|_| OperonError::GateClosed(id))
    }

    /// Answers a consultation. The question/answer pair is captured as
    /// an L1 decision memory so later runs in the project see it. A
    /// parked blocking caller is released with the answer.
    pub async fn answer_consultation(&self, id: &str, response: &str) -> Result<Consultation> {
        let mut consultation = match self.store.load_consultation(id).await {
            Ok(c) => c,
            Err(OperonError::EntityNotFound(_)) => {
                return Err(OperonError::GateNotFound(id.to_string()))
            }
            Err(err) => return Err(err),
        };
        match consultation.status {
            ConsultationStatus::Answered => {
                return Err(OperonError::GateAlreadyResolved(id.to_string()))
            }
            ConsultationStatus::Expired => return Err(OperonError::GateClosed(id.to_string())),
            ConsultationStatus::Pending => {}
        }

        consultation.status = ConsultationStatus::Answered;
        consultation.response = Some(response.to_string());
        consultation.answered_at = Some(Utc::now());
        self.store.save_consultation(&consultation).await?;
        self.record_decision(&consultation, response).await?;

        if let Some(parked) = self.parked_blocks.lock().await.remove(id) {
            let _ = parked.tx.send(response.to_string());
        }
        self.bus.emit(PipelineEvent::ConsultationAnswered {
            pipeline_id: consultation.pipeline_id.clone(),
            consultation_id: consultation.id.clone(),
        });
        info!(consultation_id = %consultation.id, "Consultation answered");
        Ok(consultation)
    }

    async fn record_decision(&self, consultation: &Consultation, response: &str) -> Result<()> {
        let pipeline = self.store.load_pipeline(&consultation.pipeline_id).await?;
        let mut entry = MemoryEntry::new(
            pipeline.project_id,
            MemoryLayer::L1,
            MemoryKind::Decision,
            format!("Q: {}\nA: {}", consultation.question, response),
        )
        .with_pipeline(consultation.pipeline_id.clone());
        if let Some(task_id) = &consultation.task_id {
            entry = entry.with_task(task_id.clone());
        }
        self.store.save_memory(&entry).await
    }

    /// Expires every pending gate of one pipeline: records are marked,
    /// parked callers receive [`EXPIRED_ANSWER`], and nothing stays
    /// parked. Returns how many gates were expired.
    #[instrument(skip(self))]
    pub async fn expire_for_pipeline(&self, pipeline_id: &str) -> Result<usize> {
        let mut expired = 0;

        for mut intervention in self.store.list_pending_interventions(pipeline_id).await? {
            intervention.status = InterventionStatus::Resolved;
            intervention.response = Some(EXPIRED_ANSWER.to_string());
            intervention.resolved_at = Some(Utc::now());
            self.store.save_intervention(&intervention).await?;
            self.bus.emit(PipelineEvent::InterventionResolved {
                pipeline_id: pipeline_id.to_string(),
                intervention_id: intervention.id.clone(),
            });
            expired += 1;
        }
        for mut consultation in self.store.list_pending_consultations(pipeline_id).await? {
            consultation.status = ConsultationStatus::Expired;
            consultation.answered_at = Some(Utc::now());
            self.store.save_consultation(&consultation).await?;
            self.bus.emit(PipelineEvent::ConsultationExpired {
                pipeline_id: pipeline_id.to_string(),
                consultation_id: consultation.id.clone(),
            });
            expired += 1;
        }

        release_parked(&self.parked_interventions, pipeline_id).await;
        release_parked(&self.parked_blocks, pipeline_id).await;

        info!(pipeline_id, expired, "Expired pending gates");
        Ok(expired)
    }
}

async fn release_parked(map: &Mutex<HashMap<String, ParkedGate>>, pipeline_id: &str) {
    let mut map = map.lock().await;
    let ids: Vec<String> = map
        .iter()
        .filter(|(_, gate)| gate.pipeline_id == pipeline_id)
        .map(|(id, _)| id.clone())
        .collect();
    for id in ids {
        if let Some(gate) = map.remove(&id) {
            let _ = gate.tx.send(EXPIRED_ANSWER.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use operon_core::{Pipeline, Project};
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager() -> (TempDir, Arc<GateManager>, Arc<StateStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));
        let gates = Arc::new(GateManager::new(Arc::clone(&store), EventBus::default()));
        (dir, gates, store)
    }

    async fn wait_for_parked(gates: &GateManager, count: usize) {
        for _ in 0..400 {
            if gates.parked_count().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never reached {} parked gates", count);
    }

    #[tokio::test]
    async fn test_intervention_parks_until_resolved() {
        let (_dir, gates, store) = manager();
        let intervention = Intervention::new("pipe-1", "Merge conflict in auth.rs");
        let id = intervention.id.clone();

        let parked = {
            let gates = Arc::clone(&gates);
            tokio::spawn(async move { gates.request_intervention(intervention).await })
        };
        wait_for_parked(&gates, 1).await;
        assert_eq!(gates.hold_counter().held(), 1);

        gates.resolve_intervention(&id, "skip").await.unwrap();
        let answer = parked.await.unwrap().unwrap();
        assert_eq!(answer, "skip");
        assert_eq!(gates.hold_counter().held(), 0);

        let record = store.load_intervention(&id).await.unwrap();
        assert_eq!(record.status, InterventionStatus::Resolved);
        assert_eq!(record.response.as_deref(), Some("skip"));
    }

    #[tokio::test]
    async fn test_second_resolution_is_rejected() {
        let (_dir, gates, store) = manager();
        let intervention = Intervention::new("pipe-1", "Proceed?");
        let id = intervention.id.clone();
        store.save_intervention(&intervention).await.unwrap();

        gates.resolve_intervention(&id, "yes").await.unwrap();
        let err = gates.resolve_intervention(&id, "no").await.unwrap_err();
        assert!(matches!(err, OperonError::GateAlreadyResolved(_)));

        // First answer stands
        let record = store.load_intervention(&id).await.unwrap();
        assert_eq!(record.response.as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn test_resolving_unknown_gate_fails() {
        let (_dir, gates, _store) = manager();
        let err = gates.resolve_intervention("ghost", "yes").await.unwrap_err();
        assert!(matches!(err, OperonError::GateNotFound(_)));
    }

    #[tokio::test]
    async fn test_consultation_answer_is_captured_as_decision_memory() {
        let (_dir, gates, store) = manager();
        let project = Project::new("demo", "/tmp/demo");
        store.save_project(&project).await.unwrap();
        let pipeline = Pipeline::new(project.id.clone(), "build the thing");
        store.save_pipeline(&pipeline).await.unwrap();

        let consultation = Consultation::new(pipeline.id.clone(), "Which auth scheme?");
        let id = gates.request_consultation(consultation).await.unwrap();
        // Non-blocking: nothing parked, clock untouched
        assert_eq!(gates.parked_count().await, 0);
        assert_eq!(gates.hold_counter().held(), 0);

        gates.answer_consultation(&id, "OAuth with PKCE").await.unwrap();

        let memory = store
            .list_memory(&project.id, Some(MemoryLayer::L1))
            .await
            .unwrap();
        assert_eq!(memory.len(), 1);
        assert_eq!(memory[0].kind, MemoryKind::Decision);
        assert!(memory[0].content.contains("Which auth scheme?"));
        assert!(memory[0].content.contains("OAuth with PKCE"));
        assert_eq!(memory[0].pipeline_id.as_deref(), Some(pipeline.id.as_str()));
    }

    #[tokio::test]
    async fn test_block_parks_and_holds_the_clock() {
        let (_dir, gates, store) = manager();
        let project = Project::new("demo", "/tmp/demo");
        store.save_project(&project).await.unwrap();
        let pipeline = Pipeline::new(project.id.clone(), "req");
        store.save_pipeline(&pipeline).await.unwrap();

        let consultation = Consultation::new(pipeline.id.clone(), "Schema migration safe?");
        let id = consultation.id.clone();
        let parked = {
            let gates = Arc::clone(&gates);
            tokio::spawn(async move { gates.request_block(consultation).await })
        };
        wait_for_parked(&gates, 1).await;
        assert_eq!(gates.hold_counter().held(), 1);

        gates.answer_consultation(&id, "yes, applied").await.unwrap();
        assert_eq!(parked.await.unwrap().unwrap(), "yes, applied");
        assert_eq!(gates.hold_counter().held(), 0);

        let record = store.load_consultation(&id).await.unwrap();
        assert_eq!(record.status, ConsultationStatus::Answered);
        assert!(record.blocking);
    }

    #[tokio::test]
    async fn test_expire_releases_every_parked_gate() {
        let (_dir, gates, store) = manager();
        let intervention = Intervention::new("pipe-1", "stuck");
        let block = Consultation::new("pipe-1", "also stuck");
        let intervention_id = intervention.id.clone();
        let block_id = block.id.clone();

        let parked_intervention = {
            let gates = Arc::clone(&gates);
            tokio::spawn(async move { gates.request_intervention(intervention).await })
        };
        let parked_block = {
            let gates = Arc::clone(&gates);
            tokio::spawn(async move { gates.request_block(block).await })
        };
        wait_for_parked(&gates, 2).await;

        let expired = gates.expire_for_pipeline("pipe-1").await.unwrap();
        assert_eq!(expired, 2);
        assert_eq!(parked_intervention.await.unwrap().unwrap(), EXPIRED_ANSWER);
        assert_eq!(parked_block.await.unwrap().unwrap(), EXPIRED_ANSWER);
        assert_eq!(gates.parked_count().await, 0);
        assert_eq!(gates.hold_counter().held(), 0);

        let record = store.load_intervention(&intervention_id).await.unwrap();
        assert_eq!(record.status, InterventionStatus::Resolved);
        assert_eq!(record.response.as_deref(), Some(EXPIRED_ANSWER));
        let record = store.load_consultation(&block_id).await.unwrap();
        assert_eq!(record.status, ConsultationStatus::Expired);
    }

    #[tokio::test]
    async fn test_expire_only_touches_the_target_pipeline() {
        let (_dir, gates, _store) = manager();
        let other = Intervention::new("pipe-2", "unrelated");
        let other_id = other.id.clone();
        let parked = {
            let gates = Arc::clone(&gates);
            tokio::spawn(async move { gates.request_intervention(other).await })
        };
        wait_for_parked(&gates, 1).await;

        let expired = gates.expire_for_pipeline("pipe-1").await.unwrap();
        assert_eq!(expired, 0);
        assert_eq!(gates.parked_count().await, 1);

        gates.resolve_intervention(&other_id, "ok").await.unwrap();
        assert_eq!(parked.await.unwrap().unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_answering_expired_consultation_fails() {
        let (_dir, gates, store) = manager();
        let consultation = Consultation::new("pipe-1", "too late");
        let id = consultation.id.clone();
        store.save_consultation(&consultation).await.unwrap();

        gates.expire_for_pipeline("pipe-1").await.unwrap();
        let err = gates.answer_consultation(&id, "answer").await.unwrap_err();
        assert!(matches!(err, OperonError::GateClosed(_)));
    }
}
