//! Per-job step execution: creation/recovery, retry with exponential
//! backoff, timeout enforcement and cancellation.
//!
//! One [`StepManager`] exists per in-flight job run. It owns the set of
//! step names executed in this run, bounds concurrent callbacks with a
//! semaphore, and persists every outcome through the store so a later run
//! of the same job can resume idempotently.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::action::{RetryConfig, StepOptions, StepsConfig};
use crate::error::{
    is_cancel, is_non_retriable, ActionCancelError, JobInactiveError, NonRetriableError,
    SerializedError, StepAlreadyExecutedError, StepTimeoutError,
};
use crate::job::{StepParams, StepStatus};
use crate::store::Store;

/// Context passed to a step callback.
///
/// The signal is a child of the action's cancellation scope plus the
/// step's own timeout; callbacks are expected to honour it at their
/// suspension points.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub signal: CancellationToken,
}

/// Registry and dispatcher for one job run's steps.
pub struct StepManager {
    job_id: Uuid,
    store: Arc<dyn Store>,
    config: StepsConfig,
    /// Action-scope cancellation; step signals are children of it.
    signal: CancellationToken,
    semaphore: Semaphore,
    executed: Mutex<HashSet<String>>,
    inflight: AtomicUsize,
    drained: Notify,
}

impl StepManager {
    pub fn new(
        job_id: Uuid,
        store: Arc<dyn Store>,
        config: StepsConfig,
        signal: CancellationToken,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            job_id,
            store,
            config,
            signal,
            semaphore: Semaphore::new(concurrency),
            executed: Mutex::new(HashSet::new()),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Execute a named step: create or recover its record, run the
    /// callback under timeout/cancellation, apply the retry policy, and
    /// persist the outcome.
    pub async fn run_step<T, F, Fut>(
        &self,
        name: &str,
        options: StepOptions,
        f: F,
    ) -> Result<T, anyhow::Error>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(StepContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send,
    {
        // An active run must not replay a step name.
        {
            let mut executed = self
                .executed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !executed.insert(name.to_string()) {
                return Err(anyhow::Error::new(StepAlreadyExecutedError {
                    name: name.to_string(),
                }));
            }
        }

        let _inflight = InflightGuard::enter(self);
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(anyhow::Error::new)?;

        let expire = options.expire.unwrap_or(self.config.expire);
        let retry = options.retry.unwrap_or_else(|| self.config.retry.clone());

        let row = self
            .store
            .create_or_recover_job_step(StepParams {
                job_id: self.job_id,
                name: name.to_string(),
                timeout_ms: expire.as_millis() as i64,
                retries_limit: retry.limit as i32,
            })
            .await?;

        let Some(row) = row else {
            return Err(anyhow::Error::new(JobInactiveError {
                job_id: self.job_id,
            }));
        };

        match row.status {
            StepStatus::Completed => {
                // The step already ran in a previous life of this job.
                debug!(job_id = %self.job_id, step = %name, "replaying completed step output");
                let output = row.output.unwrap_or(serde_json::Value::Null);
                return serde_json::from_value(output).map_err(|e| {
                    anyhow::Error::new(NonRetriableError::with_source(
                        format!("stored output of step '{name}' no longer matches its type"),
                        e,
                    ))
                });
            }
            StepStatus::Failed | StepStatus::Cancelled => {
                // The previous run reached a terminal failure; the handler
                // cannot re-enter the step.
                let stored = row
                    .error
                    .as_ref()
                    .and_then(SerializedError::from_value)
                    .unwrap_or_else(|| {
                        SerializedError::new("Error", "step previously reached a terminal failure")
                    });
                return Err(anyhow::Error::new(NonRetriableError::with_source(
                    format!(
                        "step '{name}' already finished as {}",
                        row.status.as_str()
                    ),
                    stored,
                )));
            }
            StepStatus::Active => {}
        }

        self.attempt_loop(row.id, name, expire, retry, f).await
    }

    async fn attempt_loop<T, F, Fut>(
        &self,
        step_id: Uuid,
        name: &str,
        expire: std::time::Duration,
        retry: RetryConfig,
        f: F,
    ) -> Result<T, anyhow::Error>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(StepContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send,
    {
        let mut attempt: u32 = 0;
        loop {
            let step_signal = self.signal.child_token();
            let outcome = {
                let fut = f(StepContext {
                    signal: step_signal.clone(),
                });
                tokio::select! {
                    res = fut => res,
                    _ = self.signal.cancelled() => Err(anyhow::Error::new(ActionCancelError)),
                    _ = tokio::time::sleep(expire) => {
                        step_signal.cancel();
                        Err(anyhow::Error::new(StepTimeoutError {
                            step: name.to_string(),
                            timeout_ms: expire.as_millis() as i64,
                        }))
                    }
                }
            };

            match outcome {
                Ok(value) => {
                    let raw = serde_json::to_value(&value)?;
                    if !self.store.complete_job_step(step_id, raw).await? {
                        // The job lost its lease meanwhile; the run's
                        // outcome is decided elsewhere.
                        debug!(job_id = %self.job_id, step = %name, "step completion ignored, job no longer active");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if is_cancel(&err) || self.signal.is_cancelled() {
                        if let Err(e) = self.store.cancel_job_step(step_id).await {
                            warn!(job_id = %self.job_id, step = %name, error = %e, "failed to persist step cancellation");
                        }
                        return if is_cancel(&err) {
                            Err(err)
                        } else {
                            Err(err.context(ActionCancelError))
                        };
                    }

                    if is_non_retriable(&err) || attempt >= retry.limit {
                        self.store
                            .fail_job_step(step_id, SerializedError::from_error(&err))
                            .await?;
                        return Err(err);
                    }

                    let delay = retry.delay_for(attempt);
                    debug!(
                        job_id = %self.job_id,
                        step = %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "step attempt failed, backing off"
                    );
                    self.store
                        .delay_job_step(
                            step_id,
                            SerializedError::from_error(&err),
                            delay.as_millis() as i64,
                        )
                        .await?;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.signal.cancelled() => {
                            if let Err(e) = self.store.cancel_job_step(step_id).await {
                                warn!(job_id = %self.job_id, step = %name, error = %e, "failed to persist step cancellation");
                            }
                            return Err(anyhow::Error::new(ActionCancelError));
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Block until no step callback is in flight.
    pub async fn drain(&self) {
        loop {
            if self.inflight.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.drained.notified();
            if self.inflight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for StepManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepManager")
            .field("job_id", &self.job_id)
            .field("inflight", &self.inflight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// RAII guard so the in-flight count drops even when a callback panics.
struct InflightGuard<'a> {
    manager: &'a StepManager,
}

impl<'a> InflightGuard<'a> {
    fn enter(manager: &'a StepManager) -> Self {
        manager.inflight.fetch_add(1, Ordering::AcqRel);
        Self { manager }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.manager.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.manager.drained.notify_waiters();
        }
    }
}
