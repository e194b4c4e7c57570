//! The logical store contract.
//!
//! The engine depends on a persistence module exposing atomic state
//! transitions on jobs and steps, the fetch-and-admit claim, orphan
//! recovery, observability queries, and a pub/sub channel. Two
//! implementations ship with the crate:
//!
//! - [`crate::postgres::PgStore`] — the production dialect: row-level
//!   locks (`FOR UPDATE SKIP LOCKED`), transactional multi-statement work
//!   for fetch and retry, and `LISTEN`/`NOTIFY` on the same pool.
//! - `MemoryStore` (behind the `testing` feature) — the same logical
//!   contract over in-process state, used by the engine's own tests.

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{SerializedError, StoreError};
use crate::job::{
    ActionOverview, GetJobsOptions, Job, JobFilters, JobStatus, JobStep, NewJob, Pagination,
    StepParams, StepRow, StepStatus,
};
use crate::notifier::Notification;

/// Durable persistence of jobs and steps.
///
/// # Atomicity
///
/// Every mutation is guarded by the status columns: a transition that does
/// not hold (wrong status, wrong owner, expired lease) is a silent no-op
/// returning `false`, never an error. Concurrent admitters must not admit
/// past a group's concurrency limit; concurrent retriers must not produce
/// two non-terminal siblings of the same job.
#[async_trait]
pub trait Store: Send + Sync {
    /// Start background machinery (e.g. the notification listener).
    async fn start(&self) -> Result<(), StoreError>;

    /// Stop background machinery. Idempotent.
    async fn stop(&self) -> Result<(), StoreError>;

    /// Apply schema migrations. A no-op for stores without a schema.
    async fn migrate(&self) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Job transitions
    // ------------------------------------------------------------------

    /// Insert a `created` job and emit `job-available`.
    async fn create_job(&self, new: NewJob) -> Result<Uuid, StoreError>;

    /// Complete an `active` job owned by `client_id` whose lease has not
    /// expired. Emits `job-status-changed` on success.
    async fn complete_job(
        &self,
        job_id: Uuid,
        client_id: &str,
        output: serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Fail an `active` job owned by `client_id`. Emits `job-status-changed`.
    async fn fail_job(
        &self,
        job_id: Uuid,
        client_id: &str,
        error: SerializedError,
    ) -> Result<bool, StoreError>;

    /// Cancel a job from `created` or `active`. Emits `job-status-changed`.
    async fn cancel_job(&self, job_id: Uuid) -> Result<bool, StoreError>;

    /// Re-enqueue a terminal job.
    ///
    /// Atomically: if a non-terminal sibling already exists for the same
    /// `(action_name, group_key, checksum, input)` tuple, returns `None`.
    /// Otherwise inserts a new `created` job copying the source's identity,
    /// picking `concurrency_limit` from the most recently created job in
    /// the group whose lease has not expired (falling back to the
    /// source's). Emits `job-available`.
    async fn retry_job(&self, job_id: Uuid) -> Result<Option<Uuid>, StoreError>;

    /// Delete a non-`active` job, cascading its steps.
    async fn delete_job(&self, job_id: Uuid) -> Result<bool, StoreError>;

    /// Bulk-delete matching jobs, always excluding `active` ones.
    async fn delete_jobs(&self, filters: JobFilters) -> Result<u64, StoreError>;

    // ------------------------------------------------------------------
    // Fetch and recovery
    // ------------------------------------------------------------------

    /// Atomically claim up to `batch` `created` jobs for `client_id`,
    /// respecting per-`(group_key, action_name)` concurrency admission.
    ///
    /// A group's effective limit is the `concurrency_limit` of its most
    /// recently created non-expired job; the limit stored on each claimed
    /// job is re-verified at write time, which is the authoritative check
    /// under parallel fetchers. Only jobs for `action_names` are claimed.
    /// Rows locked by a concurrent admitter are skipped, never waited on.
    async fn fetch(
        &self,
        client_id: &str,
        batch: i64,
        action_names: &[String],
    ) -> Result<Vec<Job>, StoreError>;

    /// Distinct `client_id`s holding `active` jobs, excluding `exclude`.
    async fn active_client_ids(&self, exclude: &str) -> Result<Vec<String>, StoreError>;

    /// Reset `active` jobs leased by `suspects` back to `created`,
    /// clearing lease and result fields. Steps of jobs whose `checksum`
    /// is not in `known_checksums` are deleted (the action code changed;
    /// the step history is no longer trustworthy). Locked rows are
    /// skipped. Returns the number of jobs reset.
    async fn reset_orphaned_jobs(
        &self,
        suspects: &[String],
        known_checksums: &[String],
    ) -> Result<u64, StoreError>;

    // ------------------------------------------------------------------
    // Step transitions
    // ------------------------------------------------------------------

    /// Create a step row, or hand back the existing one.
    ///
    /// - Absent row: insert as `active`, `is_new = true`.
    /// - Existing terminal row: returned unchanged (recovery short-circuit).
    /// - Existing `active` row (in flight when a worker died): reset in
    ///   place — fresh lease, zeroed retries, cleared history.
    ///
    /// Returns `None` without writing when the owning job is not `active`
    /// or its lease has expired.
    async fn create_or_recover_job_step(
        &self,
        params: StepParams,
    ) -> Result<Option<StepRow>, StoreError>;

    /// Complete an `active` step of an `active` job. Emits
    /// `step-status-changed`.
    async fn complete_job_step(
        &self,
        step_id: Uuid,
        output: serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Fail an `active` step of an `active` job. Emits `step-status-changed`.
    async fn fail_job_step(
        &self,
        step_id: Uuid,
        error: SerializedError,
    ) -> Result<bool, StoreError>;

    /// Cancel an `active` step. Unlike the other step transitions the
    /// owning job may already be `cancelled` (the job row is finalised
    /// before in-flight steps observe the abort). Emits
    /// `step-status-changed`.
    async fn cancel_job_step(&self, step_id: Uuid) -> Result<bool, StoreError>;

    /// Record a failed attempt that will be retried after `delay_ms`.
    ///
    /// Increments `retries_count`, appends to `history_failed_attempts`
    /// keyed by a millisecond time slot, and extends `expires_at` by
    /// `timeout_ms + delay_ms` so a backing-off step is not mistaken for a
    /// crash. Emits `step-delayed`.
    async fn delay_job_step(
        &self,
        step_id: Uuid,
        error: SerializedError,
        delay_ms: i64,
    ) -> Result<bool, StoreError>;

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn get_jobs(&self, opts: GetJobsOptions) -> Result<Vec<Job>, StoreError>;

    /// Steps of one job, outputs omitted for bandwidth. `search` filters
    /// by step name substring.
    async fn get_job_steps(
        &self,
        job_id: Uuid,
        pagination: Pagination,
        search: Option<&str>,
    ) -> Result<Vec<JobStep>, StoreError>;

    async fn get_job_step_by_id(&self, step_id: Uuid) -> Result<Option<JobStep>, StoreError>;

    async fn get_job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, StoreError>;

    async fn get_job_step_status(&self, step_id: Uuid)
        -> Result<Option<StepStatus>, StoreError>;

    /// Per-action count-by-status and most recent creation time.
    async fn get_actions(&self) -> Result<Vec<ActionOverview>, StoreError>;

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    /// Publish a notification on the channel.
    async fn publish(&self, notification: Notification) -> Result<(), StoreError>;

    /// Subscribe to the channel. Events published before subscription are
    /// not delivered.
    fn subscribe(&self) -> broadcast::Receiver<Notification>;
}
