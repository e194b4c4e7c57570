//! End-to-end scenarios driving real clients over the shared in-memory
//! store: enqueue, sync, execute, retry, cancel, recover.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ActionCancelError, NonRetriableError};
use crate::job::{JobStatus, Pagination, StepStatus};
use crate::store::Store;
use crate::testing::{eventually, memory_store};
use crate::{Action, Client, ClientConfig, RetryConfig, SyncPattern, WaitOptions};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct Empty {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct Okay {
    ok: bool,
}

fn fast_config(id: &str) -> ClientConfig {
    ClientConfig {
        id: id.to_string(),
        pull_interval: Duration::from_millis(100),
        process_timeout: Duration::from_millis(200),
        ..ClientConfig::default()
    }
}

fn quick_retry() -> RetryConfig {
    RetryConfig {
        limit: 3,
        factor: 2.0,
        min_timeout: Duration::from_millis(10),
        max_timeout: Duration::from_millis(100),
    }
}

fn wait_opts(secs: u64) -> WaitOptions {
    WaitOptions {
        timeout: Some(Duration::from_secs(secs)),
        signal: None,
    }
}

#[tokio::test]
async fn happy_path_completes_with_output() {
    let store = memory_store();
    let action = Action::<()>::builder("noop")
        .expire(Duration::from_millis(60_000))
        .step_expire(Duration::from_millis(10_000))
        .handler(|_ctx, _in: Empty| async move { Ok(Okay { ok: true }) })
        .unwrap();

    let client = Client::builder(store as Arc<dyn Store>)
        .config(fast_config("s1-client"))
        .action(action)
        .build()
        .unwrap();
    client.start().await.unwrap();

    let job_id = client.run_action("noop", Empty {}).await.unwrap();
    let job = client
        .wait_for_job(job_id, wait_opts(3))
        .await
        .expect("job reaches a terminal status");

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.output, Some(serde_json::json!({ "ok": true })));
    assert!(job.finished_at.is_some());

    client.stop().await.unwrap();
}

#[tokio::test]
async fn group_admission_caps_parallel_claims() {
    let store = memory_store();
    let action = Action::<()>::builder("grouped")
        .group_key(|_| "g1".to_string())
        .group_concurrency(|_| 2)
        .handler(|_ctx, _in: Empty| async move { Ok(Okay { ok: true }) })
        .unwrap();

    let client = Client::builder(Arc::clone(&store) as Arc<dyn Store>)
        .config(ClientConfig {
            sync_pattern: SyncPattern::Disabled,
            ..fast_config("s2-client")
        })
        .action(action)
        .build()
        .unwrap();

    for _ in 0..3 {
        client.run_action("grouped", Empty {}).await.unwrap();
    }

    let first = store
        .fetch("s2-client", 10, &["grouped".to_string()])
        .await
        .unwrap();
    assert_eq!(first.len(), 2);

    // Nothing completed: the group has no headroom left.
    let second = store
        .fetch("s2-client", 10, &["grouped".to_string()])
        .await
        .unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn non_retriable_step_fails_job_after_one_attempt() {
    let store = memory_store();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_handler = Arc::clone(&calls);

    let action = Action::<()>::builder("fatal")
        .step_retry(quick_retry())
        .handler(move |ctx, _in: Empty| {
            let calls = Arc::clone(&calls_handler);
            async move {
                let _: i64 = ctx
                    .step("only", move |_step| {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err::<i64, _>(anyhow::Error::new(NonRetriableError::new("stop")))
                        }
                    })
                    .await?;
                Ok(Okay { ok: true })
            }
        })
        .unwrap();

    let client = Client::builder(Arc::clone(&store) as Arc<dyn Store>)
        .config(fast_config("s3-client"))
        .action(action)
        .build()
        .unwrap();
    client.start().await.unwrap();

    let job_id = client.run_action("fatal", Empty {}).await.unwrap();
    let job = client
        .wait_for_job(job_id, wait_opts(3))
        .await
        .expect("job reaches a terminal status");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let steps = store
        .get_job_steps(job_id, Pagination::default(), None)
        .await
        .unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert_eq!(steps[0].retries_count, 0);
    assert!(steps[0].failed_attempts().is_empty());

    client.stop().await.unwrap();
}

#[tokio::test]
async fn retriable_step_backs_off_then_completes() {
    let store = memory_store();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_handler = Arc::clone(&calls);

    let action = Action::<()>::builder("flaky")
        .step_retry(quick_retry())
        .handler(move |ctx, _in: Empty| {
            let calls = Arc::clone(&calls_handler);
            async move {
                let n: i64 = ctx
                    .step("persistent", move |_step| {
                        let calls = Arc::clone(&calls);
                        async move {
                            let attempt = calls.fetch_add(1, Ordering::SeqCst);
                            if attempt < 2 {
                                anyhow::bail!("transient failure {attempt}");
                            }
                            Ok(7)
                        }
                    })
                    .await?;
                Ok(Okay { ok: n == 7 })
            }
        })
        .unwrap();

    let client = Client::builder(Arc::clone(&store) as Arc<dyn Store>)
        .config(fast_config("s4-client"))
        .action(action)
        .build()
        .unwrap();
    client.start().await.unwrap();

    let job_id = client.run_action("flaky", Empty {}).await.unwrap();
    let job = client
        .wait_for_job(job_id, wait_opts(3))
        .await
        .expect("job reaches a terminal status");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let steps = store
        .get_job_steps(job_id, Pagination::default(), None)
        .await
        .unwrap();
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[0].retries_count, 2);
    assert_eq!(steps[0].failed_attempts().len(), 2);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn cancellation_mid_step_cancels_job_and_step() {
    let store = memory_store();
    let observed_abort = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&observed_abort);

    let action = Action::<()>::builder("sleepy")
        .handler(move |ctx, _in: Empty| {
            let observed = Arc::clone(&observed);
            async move {
                let _: i64 = ctx
                    .step("nap", move |step| {
                        let observed = Arc::clone(&observed);
                        async move {
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_millis(500)) => Ok(1),
                                _ = step.signal.cancelled() => {
                                    observed.store(true, Ordering::SeqCst);
                                    Err(anyhow::Error::new(ActionCancelError))
                                }
                            }
                        }
                    })
                    .await?;
                Ok(Okay { ok: true })
            }
        })
        .unwrap();

    let client = Client::builder(Arc::clone(&store) as Arc<dyn Store>)
        .config(fast_config("s5-client"))
        .action(action)
        .build()
        .unwrap();
    client.start().await.unwrap();

    let job_id = client.run_action("sleepy", Empty {}).await.unwrap();

    // Cancel once the step is demonstrably in flight.
    let step_started = {
        let store = Arc::clone(&store);
        eventually(Duration::from_secs(2), move || {
            let store = Arc::clone(&store);
            async move {
                !store
                    .get_job_steps(job_id, Pagination::default(), None)
                    .await
                    .unwrap()
                    .is_empty()
            }
        })
        .await
    };
    assert!(step_started, "step never started");

    assert!(client.cancel_job(job_id).await.unwrap());

    let job = client
        .wait_for_job(job_id, wait_opts(3))
        .await
        .expect("job reaches a terminal status");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(observed_abort.load(Ordering::SeqCst), "callback missed the abort");

    let steps = store
        .get_job_steps(job_id, Pagination::default(), None)
        .await
        .unwrap();
    assert_eq!(steps[0].status, StepStatus::Cancelled);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn crash_recovery_reclaims_foreign_leases() {
    let store = memory_store();
    let action = Action::<()>::builder("recoverable")
        .handler(|_ctx, _in: Empty| async move { Ok(Okay { ok: true }) })
        .unwrap();

    let survivor = Client::builder(Arc::clone(&store) as Arc<dyn Store>)
        .config(ClientConfig {
            multi_process_mode: true,
            process_timeout: Duration::from_millis(150),
            ..fast_config("client-b")
        })
        .action(action)
        .build()
        .unwrap();

    // Producer side works before start(); enqueue and let a doomed worker
    // claim the job, then never come back.
    let job_id = survivor.run_action("recoverable", Empty {}).await.unwrap();
    let claimed = store
        .fetch("client-a", 10, &["recoverable".to_string()])
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].client_id.as_deref(), Some("client-a"));

    // Startup recovery pings client-a; nobody answers within the process
    // timeout, so its lease is reclaimed and the job re-admitted here.
    survivor.start().await.unwrap();

    let job = survivor
        .wait_for_job(job_id, wait_opts(5))
        .await
        .expect("job reaches a terminal status");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.output, Some(serde_json::json!({ "ok": true })));

    survivor.stop().await.unwrap();
}

#[tokio::test]
async fn live_workers_keep_their_leases_during_recovery() {
    let store = memory_store();
    let make_action = || {
        Action::<()>::builder("shared")
            .handler(|ctx, _in: Empty| async move {
                // Runs until cancelled so the lease stays active.
                ctx.signal().cancelled().await;
                Err::<Okay, _>(anyhow::Error::new(ActionCancelError))
            })
            .unwrap()
    };

    let holder = Client::builder(Arc::clone(&store) as Arc<dyn Store>)
        .config(ClientConfig {
            multi_process_mode: true,
            ..fast_config("holder")
        })
        .action(make_action())
        .build()
        .unwrap();
    holder.start().await.unwrap();

    let job_id = holder.run_action("shared", Empty {}).await.unwrap();
    let claimed = {
        let store = Arc::clone(&store);
        eventually(Duration::from_secs(2), move || {
            let store = Arc::clone(&store);
            async move {
                store.get_job_status(job_id).await.unwrap() == Some(JobStatus::Active)
            }
        })
        .await
    };
    assert!(claimed, "holder never claimed the job");

    // A second live client probes the holder, which answers the ping, so
    // the active lease survives recovery.
    let prober = Client::builder(Arc::clone(&store) as Arc<dyn Store>)
        .config(ClientConfig {
            multi_process_mode: true,
            process_timeout: Duration::from_millis(500),
            sync_pattern: SyncPattern::Disabled,
            ..fast_config("prober")
        })
        .action(make_action())
        .build()
        .unwrap();
    prober.start().await.unwrap();

    assert_eq!(
        store.get_job_status(job_id).await.unwrap(),
        Some(JobStatus::Active)
    );

    holder.stop().await.unwrap();
    prober.stop().await.unwrap();
}

#[tokio::test]
async fn retry_job_creates_one_sibling_at_a_time() {
    let store = memory_store();
    let action = Action::<()>::builder("retryable")
        .handler(|_ctx, _in: Empty| async move { Ok(Okay { ok: true }) })
        .unwrap();

    let client = Client::builder(Arc::clone(&store) as Arc<dyn Store>)
        .config(ClientConfig {
            sync_pattern: SyncPattern::Disabled,
            ..fast_config("retry-client")
        })
        .action(action)
        .build()
        .unwrap();

    let job_id = client.run_action("retryable", Empty {}).await.unwrap();
    store
        .fetch("retry-client", 1, &["retryable".to_string()])
        .await
        .unwrap();
    store
        .fail_job(
            job_id,
            "retry-client",
            crate::SerializedError::new("Error", "boom"),
        )
        .await
        .unwrap();

    let retried = client.retry_job(job_id).await.unwrap();
    assert!(retried.is_some());
    assert!(client.retry_job(job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn wait_for_job_times_out_and_resolves_on_stop() {
    let store = memory_store();
    let action = Action::<()>::builder("parked")
        .handler(|_ctx, _in: Empty| async move { Ok(Okay { ok: true }) })
        .unwrap();

    let client = Client::builder(Arc::clone(&store) as Arc<dyn Store>)
        .config(ClientConfig {
            sync_pattern: SyncPattern::Disabled,
            ..fast_config("wait-client")
        })
        .action(action)
        .build()
        .unwrap();
    client.start().await.unwrap();

    // Nothing executes jobs: the wait must hit its timeout.
    let job_id = client.run_action("parked", Empty {}).await.unwrap();
    let waited = client
        .wait_for_job(
            job_id,
            WaitOptions {
                timeout: Some(Duration::from_millis(100)),
                signal: None,
            },
        )
        .await;
    assert!(waited.is_none());

    // A parked wait resolves `None` when the client stops.
    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_for_job(job_id, WaitOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.stop().await.unwrap();
    assert!(waiter.await.unwrap().is_none());
}

#[tokio::test]
async fn stored_input_round_trips_structurally() {
    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct Rich {
        name: String,
        count: i64,
        tags: Vec<String>,
        nested: Inner,
    }

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct Inner {
        flag: bool,
    }

    let store = memory_store();
    let action = Action::<()>::builder("typed")
        .handler(|_ctx, _in: Rich| async move { Ok(Okay { ok: true }) })
        .unwrap();

    let client = Client::builder(Arc::clone(&store) as Arc<dyn Store>)
        .config(ClientConfig {
            sync_pattern: SyncPattern::Disabled,
            ..fast_config("roundtrip-client")
        })
        .action(action)
        .build()
        .unwrap();

    let input = Rich {
        name: "mirror".into(),
        count: 3,
        tags: vec!["a".into(), "b".into()],
        nested: Inner { flag: true },
    };
    let expected = serde_json::to_value(&input).unwrap();

    let job_id = client.run_action("typed", input).await.unwrap();
    let job = client.get_job_by_id(job_id).await.unwrap().unwrap();
    assert_eq!(job.input, expected);
}
