//! Bounded worker pool for one action.
//!
//! Claimed jobs are handed to an [`ActionManager`] which schedules an
//! [`ActionJob`] per job, capped by the client's per-action concurrency
//! limit. The pool tracks in-flight runs so cancellation can reach them
//! without a store round-trip.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::action::Action;
use crate::action_job::ActionJob;
use crate::job::Job;
use crate::store::Store;

pub struct ActionManager<V> {
    action: Arc<Action<V>>,
    store: Arc<dyn Store>,
    var: V,
    client_id: String,
    semaphore: Arc<Semaphore>,
    running: Arc<DashMap<Uuid, Arc<ActionJob<V>>>>,
    stopped: Arc<AtomicBool>,
}

impl<V> ActionManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        action: Arc<Action<V>>,
        store: Arc<dyn Store>,
        var: V,
        client_id: String,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            action,
            store,
            var,
            client_id,
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            running: Arc::new(DashMap::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Schedule one claimed job for execution.
    pub fn push(&self, job: Job) {
        if self.stopped.load(Ordering::Acquire) {
            warn!(
                job_id = %job.id,
                action = %self.action.name(),
                "manager is stopped, dropping claimed job"
            );
            return;
        }

        let run = Arc::new(ActionJob::new(
            job,
            Arc::clone(&self.action),
            self.var.clone(),
            Arc::clone(&self.store),
            self.client_id.clone(),
        ));
        let job_id = run.job_id();
        self.running.insert(job_id, Arc::clone(&run));

        let semaphore = Arc::clone(&self.semaphore);
        let running = Arc::clone(&self.running);
        let action_name = self.action.name().to_string();
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    running.remove(&job_id);
                    return;
                }
            };
            let span = tracing::info_span!("job_run", job_id = %job_id, action = %action_name);
            if let Err(e) = run.run().instrument(span).await {
                debug!(job_id = %job_id, action = %action_name, error = %e, "job run finished with error");
            }
            running.remove(&job_id);
        });
    }

    /// Abort an in-flight run. Returns whether the job was held here.
    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        match self.running.get(&job_id) {
            Some(run) => {
                run.cancel();
                true
            }
            None => false,
        }
    }

    /// Abort every in-flight run.
    pub fn abort_all(&self) {
        for entry in self.running.iter() {
            entry.value().cancel();
        }
    }

    /// Number of runs currently scheduled or executing.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Stop the pool: refuse new work, abort in-flight runs, and wait for
    /// every run to record its outcome and drain its steps.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.abort_all();
        while !self.running.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl<V> std::fmt::Debug for ActionManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionManager")
            .field("action", &self.action.name())
            .field("in_flight", &self.running.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionCancelError;
    use crate::job::{JobStatus, NewJob};
    use crate::memory::MemoryStore;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct In {}

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct Out {
        ok: bool,
    }

    async fn claim_one(store: &Arc<MemoryStore>, action: &Action<()>) -> Job {
        let store: Arc<dyn Store> = Arc::clone(store) as Arc<dyn Store>;
        store
            .create_job(NewJob {
                action_name: action.name().to_string(),
                group_key: "@default".into(),
                input: serde_json::json!({}),
                timeout_ms: 60_000,
                checksum: action.checksum().to_string(),
                concurrency_limit: 100,
            })
            .await
            .unwrap();
        store
            .fetch("client-1", 1, &[action.name().to_string()])
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn pushed_jobs_execute_and_clear() {
        let store = Arc::new(MemoryStore::new());
        let action = Arc::new(
            Action::<()>::builder("noop")
                .handler(|_ctx, _in: In| async move { Ok(Out { ok: true }) })
                .unwrap(),
        );
        let manager = ActionManager::new(
            Arc::clone(&action),
            Arc::clone(&store) as Arc<dyn Store>,
            (),
            "client-1".into(),
            4,
        );

        let job = claim_one(&store, &action).await;
        let job_id = job.id;
        manager.push(job);

        // Wait for the run to complete and deregister.
        for _ in 0..100 {
            if manager.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.in_flight(), 0);

        let stored = store.get_job_by_id(job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn pool_respects_the_concurrency_cap() {
        let store = Arc::new(MemoryStore::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let concurrent_in = Arc::clone(&concurrent);
        let peak_in = Arc::clone(&peak);

        let action = Arc::new(
            Action::<()>::builder("slow")
                .handler(move |_ctx, _in: In| {
                    let concurrent = Arc::clone(&concurrent_in);
                    let peak = Arc::clone(&peak_in);
                    async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok(Out { ok: true })
                    }
                })
                .unwrap(),
        );

        let manager = ActionManager::new(
            Arc::clone(&action),
            Arc::clone(&store) as Arc<dyn Store>,
            (),
            "client-1".into(),
            2,
        );

        for _ in 0..5 {
            let job = claim_one(&store, &action).await;
            manager.push(job);
        }
        for _ in 0..200 {
            if manager.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.in_flight(), 0);
        assert!(peak.load(Ordering::SeqCst) <= 2, "pool cap exceeded");
    }

    #[tokio::test]
    async fn cancel_job_reaches_in_flight_runs() {
        let store = Arc::new(MemoryStore::new());
        let action = Arc::new(
            Action::<()>::builder("waits")
                .handler(|ctx, _in: In| async move {
                    ctx.signal().cancelled().await;
                    Err::<Out, _>(anyhow::Error::new(ActionCancelError))
                })
                .unwrap(),
        );
        let manager = ActionManager::new(
            Arc::clone(&action),
            Arc::clone(&store) as Arc<dyn Store>,
            (),
            "client-1".into(),
            4,
        );

        let job = claim_one(&store, &action).await;
        let job_id = job.id;
        manager.push(job);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(manager.cancel_job(job_id));
        assert!(!manager.cancel_job(Uuid::new_v4()));

        for _ in 0..100 {
            if manager.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stored = store.get_job_by_id(job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn stop_aborts_and_drains() {
        let store = Arc::new(MemoryStore::new());
        let action = Arc::new(
            Action::<()>::builder("hangs")
                .handler(|ctx, _in: In| async move {
                    ctx.signal().cancelled().await;
                    Err::<Out, _>(anyhow::Error::new(ActionCancelError))
                })
                .unwrap(),
        );
        let manager = ActionManager::new(
            Arc::clone(&action),
            Arc::clone(&store) as Arc<dyn Store>,
            (),
            "client-1".into(),
            4,
        );

        let job = claim_one(&store, &action).await;
        let job_id = job.id;
        manager.push(job);
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.stop().await;
        assert_eq!(manager.in_flight(), 0);

        let stored = store.get_job_by_id(job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);

        // New work is refused after stop.
        let job = claim_one(&store, &action).await;
        manager.push(job);
        assert_eq!(manager.in_flight(), 0);
    }
}
