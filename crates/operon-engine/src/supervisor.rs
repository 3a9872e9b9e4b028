//! Self-healing stage supervisor.
//!
//! Every stage attempt runs under a wall-clock limit. Timeouts and
//! agent-side failures are retried up to the configured limit before
//! the error escalates to the engine; other errors escalate at once.
//! Time spent parked on a human gate never counts against the clock:
//! the supervisor ticks in small slices and only accrues slices during
//! which no hold was active.

use std::time::Duration;

use futures::future::BoxFuture;
use operon_core::{LimitConfig, OperonError, Result};
use operon_gate::HoldCounter;
use tracing::{error, info, warn};

pub struct StageSupervisor {
    timeout: Duration,
    retry_limit: u32,
    holds: HoldCounter,
}

fn is_retryable(err: &OperonError) -> bool {
    matches!(
        err,
        OperonError::StageTimeout(_) | OperonError::AgentSpawn(_) | OperonError::AgentFailed(_)
    )
}

impl StageSupervisor {
    pub fn new(timeout: Duration, retry_limit: u32, holds: HoldCounter) -> Self {
        Self {
            timeout,
            retry_limit,
            holds,
        }
    }

    pub fn from_config(limits: &LimitConfig, holds: HoldCounter) -> Self {
        Self::new(
            Duration::from_secs(limits.stage_timeout_secs),
            limits.stage_retry_limit,
            holds,
        )
    }

    /// Drives one stage to success or final failure.
    ///
    /// `attempt` builds a fresh future per try and receives the
    /// 1-based attempt number so the stage can record it.
    pub async fn supervise<'a, T, F>(&self, label: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> BoxFuture<'a, Result<T>>,
    {
        let mut attempt_no = 0u32;
        loop {
            attempt_no += 1;
            match self.bounded(label, attempt(attempt_no)).await {
                Ok(value) => {
                    if attempt_no > 1 {
                        info!(label, attempt = attempt_no, "Stage recovered after retry");
                    }
                    return Ok(value);
                }
                Err(err) if is_retryable(&err) && attempt_no <= self.retry_limit => {
                    warn!(label, attempt = attempt_no, error = %err, "Stage attempt failed, retrying");
                }
                Err(err) => {
                    error!(label, attempts = attempt_no, error = %err, "Stage failed");
                    return Err(err);
                }
            }
        }
    }

    /// Awaits a future under the stage clock. The clock only advances
    /// while no gate hold is active, so waiting on a human is free.
    async fn bounded<'a, T>(&self, label: &str, mut fut: BoxFuture<'a, Result<T>>) -> Result<T> {
        let tick = (self.timeout / 10).clamp(Duration::from_millis(10), Duration::from_millis(100));
        let mut elapsed = Duration::ZERO;
        loop {
            match tokio::time::timeout(tick, &mut fut).await {
                Ok(result) => return result,
                Err(_) => {
                    if self.holds.held() == 0 {
                        elapsed += tick;
                        if elapsed >= self.timeout {
                            return Err(OperonError::StageTimeout(format!(
                                "{} exceeded {:?}",
                                label, self.timeout
                            )));
                        }
                    }
                }
            }
        }
    }
}
