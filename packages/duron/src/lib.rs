//! # Duron
//!
//! A durable, type-safe job queue engine backed by a relational store.
//! Producers enqueue *jobs* that target named *actions*; worker processes
//! claim jobs, execute their handlers, and record step-level progress for
//! resumability and observability.
//!
//! ## Guarantees
//!
//! - **At-least-once jobs**: a claimed job whose worker dies is recovered
//!   and re-admitted; handlers may run more than once.
//! - **At-most-once step effects within a run**: steps are keyed by
//!   `(job_id, name)`; a step that completed in a previous life of the job
//!   replays its stored output instead of executing again.
//! - **Group-aware admission**: at most `concurrency_limit` jobs of one
//!   `(action, group)` pair are active at a time, enforced at claim time
//!   under parallel workers.
//!
//! ## Architecture
//!
//! ```text
//! producer ──run_action()──► Client ──create_job──► Store (Postgres)
//!                              │                      │
//!                              │◄── job-available ────┘  (LISTEN/NOTIFY)
//!                              ▼ fetch (pull / push)
//!                        ActionManager  (bounded pool per action)
//!                              │ push
//!                              ▼
//!                          ActionJob  (timeout + cancellation scope)
//!                              │ handler(ctx)
//!                              ▼
//!                         StepManager ──step records──► Store
//!                         (retry, backoff, recovery)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use duron::{Action, Client, PgStore};
//! use schemars::JsonSchema;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize, JsonSchema)]
//! struct Input { url: String }
//!
//! #[derive(Serialize, Deserialize, JsonSchema)]
//! struct Output { bytes: usize }
//!
//! let store = Arc::new(PgStore::connect(&database_url).await?);
//! let client = Client::builder(store)
//!     .action(Action::builder("mirror").handler(|ctx, input: Input| async move {
//!         let body: String = ctx
//!             .step("download", |step| async move {
//!                 download(&input.url, step.signal).await
//!             })
//!             .await?;
//!         Ok(Output { bytes: body.len() })
//!     })?)
//!     .build()?;
//!
//! client.start().await?;
//! let job_id = client.run_action("mirror", Input { url }).await?;
//! let job = client.wait_for_job(job_id, Default::default()).await;
//! ```

mod action;
mod action_job;
mod client;
mod error;
mod job;
mod manager;
mod notifier;
mod postgres;
mod schema;
mod steps;
mod store;

// In-memory store and fixtures for tests and downstream test suites.
#[cfg(any(test, feature = "testing"))]
pub mod memory;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// End-to-end scenarios over the in-memory store (test-only).
#[cfg(test)]
mod scenario_tests;

pub use action::{
    Action, ActionBuilder, ActionContext, ActionMetadata, GroupContext, RetryConfig, StepOptions,
    StepsConfig, DEFAULT_GROUP_KEY, DEFAULT_JOB_EXPIRE, DEFAULT_STEP_CONCURRENCY,
    DEFAULT_STEP_EXPIRE,
};
pub use action_job::ActionJob;
pub use client::{Client, ClientBuilder, ClientConfig, SyncPattern, WaitOptions};
pub use error::{
    ActionCancelError, ActionTimeoutError, DuronError, JobInactiveError, NonRetriableError,
    SerializedError, StepAlreadyExecutedError, StepTimeoutError, StoreError, ValidationError,
};
pub use job::{
    ActionOverview, FailedAttempt, GetJobsOptions, Job, JobFilters, JobSortField, JobStatus,
    JobStep, NewJob, Pagination, SortOrder, StatusCounts, StepParams, StepRow, StepStatus,
};
pub use manager::ActionManager;
pub use notifier::{Notification, Notifier};
pub use postgres::PgStore;
pub use schema::SchemaCodec;
pub use steps::{StepContext, StepManager};
pub use store::Store;
