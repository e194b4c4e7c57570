//! One execution of an action handler against a claimed job.
//!
//! The run races handler completion against a cancellation scope fed by
//! two sources: an explicit `cancel()` and the job-level timeout. Once the
//! scope fires the outcome is determined; the handler task keeps running
//! until its step callbacks observe the abort, and the step manager is
//! drained before the run is considered done so in-flight step writes
//! settle.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::action::{Action, ActionContext};
use crate::error::{
    is_cancel, ActionCancelError, ActionTimeoutError, SerializedError,
};
use crate::job::Job;
use crate::steps::StepManager;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishReason {
    Cancelled,
    TimedOut,
}

/// A single job run owned by an [`crate::manager::ActionManager`].
pub struct ActionJob<V> {
    job: Job,
    action: Arc<Action<V>>,
    store: Arc<dyn Store>,
    var: V,
    client_id: String,
    signal: CancellationToken,
    steps: Arc<StepManager>,
    reason: OnceLock<FinishReason>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl<V> ActionJob<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        job: Job,
        action: Arc<Action<V>>,
        var: V,
        store: Arc<dyn Store>,
        client_id: String,
    ) -> Self {
        let signal = CancellationToken::new();
        let steps = Arc::new(StepManager::new(
            job.id,
            Arc::clone(&store),
            action.steps_config().clone(),
            signal.clone(),
        ));
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            job,
            action,
            store,
            var,
            client_id,
            signal,
            steps,
            reason: OnceLock::new(),
            done_tx,
            done_rx,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    /// Abort the run. In-flight steps observe the abort through their
    /// child signals and finalise as `cancelled`.
    pub fn cancel(&self) {
        let _ = self.reason.set(FinishReason::Cancelled);
        self.signal.cancel();
    }

    /// Resolves once the run has written its terminal status and drained
    /// its steps.
    pub async fn wait_for_done(&self) {
        let mut rx = self.done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Execute the handler and record the terminal status.
    ///
    /// The returned error is for the caller's logging only; the job's
    /// outcome is already persisted when this resolves.
    pub async fn run(&self) -> Result<(), anyhow::Error> {
        let timeout = Duration::from_millis(self.job.timeout_ms.max(1) as u64);
        let ctx = ActionContext {
            job_id: self.job.id,
            group_key: self.job.group_key.clone(),
            input: self.job.input.clone(),
            var: self.var.clone(),
            steps: Arc::clone(&self.steps),
            signal: self.signal.clone(),
        };

        let mut handler = tokio::spawn(self.action.invoke(ctx));

        let outcome: Result<serde_json::Value, anyhow::Error> = tokio::select! {
            res = &mut handler => match res {
                Ok(result) => result,
                Err(join_err) => Err(anyhow::anyhow!("handler task aborted: {join_err}")),
            },
            _ = self.signal.cancelled() => {
                match self.reason.get() {
                    Some(FinishReason::TimedOut) => Err(anyhow::Error::new(ActionTimeoutError {
                        timeout_ms: self.job.timeout_ms,
                    })),
                    _ => Err(anyhow::Error::new(ActionCancelError)),
                }
            }
            _ = tokio::time::sleep(timeout) => {
                let _ = self.reason.set(FinishReason::TimedOut);
                self.signal.cancel();
                Err(anyhow::Error::new(ActionTimeoutError {
                    timeout_ms: self.job.timeout_ms,
                }))
            }
        };

        let result = self.finalise(outcome).await;

        // In-flight step writes settle before the run reports done.
        self.steps.drain().await;
        let _ = self.done_tx.send(true);
        result
    }

    async fn finalise(
        &self,
        outcome: Result<serde_json::Value, anyhow::Error>,
    ) -> Result<(), anyhow::Error> {
        match outcome {
            Ok(value) => match self.action.validate_output(value) {
                Ok(output) => {
                    let recorded = self
                        .store
                        .complete_job(self.job.id, &self.client_id, output)
                        .await?;
                    if !recorded {
                        // Concurrently cancelled or expired; the run
                        // becomes a best-effort no-op.
                        debug!(
                            job_id = %self.job.id,
                            action = %self.job.action_name,
                            "completion ignored, job no longer owned"
                        );
                    }
                    Ok(())
                }
                Err(validation) => {
                    let err = anyhow::Error::new(validation);
                    self.store
                        .fail_job(
                            self.job.id,
                            &self.client_id,
                            SerializedError::from_error(&err),
                        )
                        .await?;
                    Err(err)
                }
            },
            Err(err) if is_cancel(&err) => {
                if !self.store.cancel_job(self.job.id).await? {
                    debug!(
                        job_id = %self.job.id,
                        action = %self.job.action_name,
                        "cancellation already recorded"
                    );
                }
                Err(err)
            }
            Err(err) => {
                warn!(
                    job_id = %self.job.id,
                    action = %self.job.action_name,
                    error = %err,
                    "job run failed"
                );
                self.store
                    .fail_job(
                        self.job.id,
                        &self.client_id,
                        SerializedError::from_error(&err),
                    )
                    .await?;
                Err(err)
            }
        }
    }
}

impl<V> std::fmt::Debug for ActionJob<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionJob")
            .field("job_id", &self.job.id)
            .field("action", &self.job.action_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, NewJob};
    use crate::memory::MemoryStore;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct In {
        #[serde(default)]
        n: i64,
    }

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct Out {
        ok: bool,
    }

    async fn claimed_job(store: &Arc<MemoryStore>, action: &Action<()>, timeout_ms: i64) -> Job {
        let store: Arc<dyn Store> = Arc::clone(store) as Arc<dyn Store>;
        store
            .create_job(NewJob {
                action_name: action.name().to_string(),
                group_key: "@default".into(),
                input: serde_json::json!({ "n": 1 }),
                timeout_ms,
                checksum: action.checksum().to_string(),
                concurrency_limit: 10,
            })
            .await
            .unwrap();
        let mut jobs = store
            .fetch("client-1", 1, &[action.name().to_string()])
            .await
            .unwrap();
        jobs.remove(0)
    }

    #[tokio::test]
    async fn successful_run_completes_the_job() {
        let store = Arc::new(MemoryStore::new());
        let action = Arc::new(
            Action::<()>::builder("noop")
                .handler(|_ctx, _input: In| async move { Ok(Out { ok: true }) })
                .unwrap(),
        );
        let job = claimed_job(&store, &action, 60_000).await;
        let run = ActionJob::new(
            job.clone(),
            action,
            (),
            Arc::clone(&store) as Arc<dyn Store>,
            "client-1".into(),
        );
        run.run().await.unwrap();

        let stored = store.get_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.output, Some(serde_json::json!({ "ok": true })));
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn failing_handler_fails_the_job() {
        let store = Arc::new(MemoryStore::new());
        let action = Arc::new(
            Action::<()>::builder("broken")
                .handler(|_ctx, _input: In| async move {
                    Err::<Out, _>(anyhow::anyhow!("did not work"))
                })
                .unwrap(),
        );
        let job = claimed_job(&store, &action, 60_000).await;
        let run = ActionJob::new(
            job.clone(),
            action,
            (),
            Arc::clone(&store) as Arc<dyn Store>,
            "client-1".into(),
        );
        assert!(run.run().await.is_err());

        let stored = store.get_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_details().unwrap().message, "did not work");
    }

    #[tokio::test]
    async fn timeout_fails_the_job_with_action_timeout() {
        let store = Arc::new(MemoryStore::new());
        let action = Arc::new(
            Action::<()>::builder("sleepy")
                .handler(|ctx, _input: In| async move {
                    // Honour the signal the way a well-behaved handler does.
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(Out { ok: true }),
                        _ = ctx.signal().cancelled() => Err(anyhow::Error::new(ActionCancelError)),
                    }
                })
                .unwrap(),
        );
        let job = claimed_job(&store, &action, 50).await;
        let run = ActionJob::new(
            job.clone(),
            action,
            (),
            Arc::clone(&store) as Arc<dyn Store>,
            "client-1".into(),
        );
        let err = run.run().await.unwrap_err();
        assert!(err.downcast_ref::<ActionTimeoutError>().is_some());

        let stored = store.get_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_details().unwrap().name, "ActionTimeoutError");
    }

    #[tokio::test]
    async fn cancel_finalises_as_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let action = Arc::new(
            Action::<()>::builder("cancellable")
                .handler(|ctx, _input: In| async move {
                    ctx.signal().cancelled().await;
                    Err::<Out, anyhow::Error>(anyhow::Error::new(ActionCancelError))
                })
                .unwrap(),
        );
        let job = claimed_job(&store, &action, 60_000).await;
        let run = Arc::new(ActionJob::new(
            job.clone(),
            action,
            (),
            Arc::clone(&store) as Arc<dyn Store>,
            "client-1".into(),
        ));

        let runner = Arc::clone(&run);
        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        run.cancel();
        let result = task.await.unwrap();
        assert!(result.is_err());

        let stored = store.get_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }
}
