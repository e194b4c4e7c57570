//! PostgreSQL store: the production dialect of the logical contract.
//!
//! Concurrency rests on three mechanisms:
//!
//! - `FOR UPDATE SKIP LOCKED` row acquisition, so parallel admitters and
//!   recoverers skip contended rows instead of queueing on them.
//! - Status-guarded single-statement updates: a transition whose guard no
//!   longer holds updates zero rows and reports `false`.
//! - A write-time re-verification in the fetch statement that checks each
//!   admitted job against its own stored `concurrency_limit`, closing the
//!   window between headroom computation and the write.
//!
//! Notifications ride `LISTEN`/`NOTIFY` on one channel carrying
//! `{topic, payload}` JSON; a background task relays them onto a local
//! broadcast channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::{QueryBuilder, Row};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{SerializedError, StoreError};
use crate::job::{
    ActionOverview, GetJobsOptions, Job, JobFilters, JobStatus, JobStep, NewJob, Pagination,
    SortOrder, StatusCounts, StepParams, StepRow, StepStatus,
};
use crate::notifier::Notification;
use crate::store::Store;

const DEFAULT_CHANNEL: &str = "duron_events";
const LOCAL_CHANNEL_CAPACITY: usize = 1024;

const JOB_COLUMNS: &str = "id, action_name, group_key, status, checksum, input, output, error, \
     timeout_ms, expires_at, started_at, finished_at, client_id, concurrency_limit, \
     created_at, updated_at";

const STEP_COLUMNS: &str = "id, job_id, name, status, output, error, started_at, finished_at, \
     timeout_ms, expires_at, retries_limit, retries_count, delayed_ms, \
     history_failed_attempts, created_at, updated_at";

/// Envelope for the NOTIFY payload.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    topic: String,
    payload: serde_json::Value,
}

/// PostgreSQL-backed [`Store`].
pub struct PgStore {
    pool: PgPool,
    channel: String,
    local: broadcast::Sender<Notification>,
    listener: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        let (local, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        Self {
            pool,
            channel: DEFAULT_CHANNEL.to_string(),
            local,
            listener: tokio::sync::Mutex::new(None),
        }
    }

    /// Connect a fresh pool and wrap it.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fire a notification; failures are logged, never propagated, so a
    /// full payload or dropped connection cannot fail the mutation that
    /// produced the event.
    async fn emit(&self, notification: Notification) {
        if let Err(e) = self.publish_inner(&notification).await {
            warn!(topic = %notification.topic(), error = %e, "failed to publish notification");
        }
    }

    async fn publish_inner(&self, notification: &Notification) -> Result<(), StoreError> {
        let (topic, payload) = notification.to_wire();
        let envelope = serde_json::to_string(&WireEnvelope { topic, payload })?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(envelope)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    /// Spawn the LISTEN relay. Idempotent.
    async fn start(&self) -> Result<(), StoreError> {
        let mut guard = self.listener.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;

        let local = self.local.clone();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = listener.recv() => match received {
                        Ok(message) => {
                            match serde_json::from_str::<WireEnvelope>(message.payload()) {
                                Ok(wire) => {
                                    if let Some(event) =
                                        Notification::from_wire(&wire.topic, &wire.payload)
                                    {
                                        let _ = local.send(event);
                                    }
                                }
                                Err(e) => {
                                    debug!(error = %e, "ignoring malformed notification payload");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "notification listener error, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });

        *guard = Some((shutdown, handle));
        Ok(())
    }

    async fn stop(&self) -> Result<(), StoreError> {
        if let Some((shutdown, handle)) = self.listener.lock().await.take() {
            shutdown.cancel();
            let _ = handle.await;
        }
        Ok(())
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn create_job(&self, new: NewJob) -> Result<Uuid, StoreError> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (id, action_name, group_key, status, checksum, input,
                              timeout_ms, concurrency_limit)
            VALUES ($1, $2, $3, 'created', $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.action_name)
        .bind(&new.group_key)
        .bind(&new.checksum)
        .bind(&new.input)
        .bind(new.timeout_ms.max(1))
        .bind(new.concurrency_limit.max(1))
        .fetch_one(&self.pool)
        .await?;

        self.emit(Notification::JobAvailable { job_id: id }).await;
        Ok(id)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        client_id: &str,
        output: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                output = $3,
                client_id = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'active'
              AND client_id = $2
              AND expires_at > NOW()
            "#,
        )
        .bind(job_id)
        .bind(client_id)
        .bind(&output)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }
        self.emit(Notification::JobStatusChanged {
            job_id,
            status: JobStatus::Completed,
            client_id: Some(client_id.to_string()),
        })
        .await;
        Ok(true)
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        client_id: &str,
        error: SerializedError,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error = $3,
                client_id = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'active'
              AND client_id = $2
            "#,
        )
        .bind(job_id)
        .bind(client_id)
        .bind(error.to_value())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }
        self.emit(Notification::JobStatusChanged {
            job_id,
            status: JobStatus::Failed,
            client_id: Some(client_id.to_string()),
        })
        .await;
        Ok(true)
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let owner: Option<Option<String>> = sqlx::query_scalar(
            r#"
            WITH target AS (
                SELECT id, client_id
                FROM jobs
                WHERE id = $1 AND status IN ('created', 'active')
                FOR UPDATE
            )
            UPDATE jobs
            SET status = 'cancelled',
                client_id = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            FROM target
            WHERE jobs.id = target.id
            RETURNING target.client_id
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(owner) = owner else {
            return Ok(false);
        };
        self.emit(Notification::JobStatusChanged {
            job_id,
            status: JobStatus::Cancelled,
            client_id: owner,
        })
        .await;
        Ok(true)
    }

    async fn retry_job(&self, job_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let source: Option<Job> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE id = $1 AND status IN ('completed', 'failed', 'cancelled') \
             FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(source) = source else {
            tx.rollback().await?;
            return Ok(None);
        };

        // At most one non-terminal sibling per identity tuple; this is
        // what makes concurrent retries of the same job collapse to one.
        let sibling: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE action_name = $1
              AND group_key = $2
              AND checksum = $3
              AND input = $4
              AND status IN ('created', 'active')
            LIMIT 1
            "#,
        )
        .bind(&source.action_name)
        .bind(&source.group_key)
        .bind(&source.checksum)
        .bind(&source.input)
        .fetch_optional(&mut *tx)
        .await?;

        if sibling.is_some() {
            tx.rollback().await?;
            return Ok(None);
        }

        let group_limit: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT concurrency_limit FROM jobs
            WHERE action_name = $1
              AND group_key = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(&source.action_name)
        .bind(&source.group_key)
        .fetch_optional(&mut *tx)
        .await?;

        let new_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (id, action_name, group_key, status, checksum, input,
                              timeout_ms, concurrency_limit)
            VALUES ($1, $2, $3, 'created', $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&source.action_name)
        .bind(&source.group_key)
        .bind(&source.checksum)
        .bind(&source.input)
        .bind(source.timeout_ms)
        .bind(group_limit.unwrap_or(source.concurrency_limit))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        self.emit(Notification::JobAvailable { job_id: new_id }).await;
        Ok(Some(new_id))
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM jobs WHERE id = $1 AND status <> 'active'")
            .bind(job_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn delete_jobs(&self, filters: JobFilters) -> Result<u64, StoreError> {
        let mut query = QueryBuilder::new("DELETE FROM jobs WHERE status <> 'active'");
        if !filters.ids.is_empty() {
            query.push(" AND id = ANY(");
            query.push_bind(filters.ids);
            query.push(")");
        }
        if !filters.statuses.is_empty() {
            query.push(" AND status = ANY(");
            query.push_bind(filters.statuses);
            query.push(")");
        }
        if !filters.action_names.is_empty() {
            query.push(" AND action_name = ANY(");
            query.push_bind(filters.action_names);
            query.push(")");
        }
        if !filters.group_keys.is_empty() {
            query.push(" AND group_key = ANY(");
            query.push_bind(filters.group_keys);
            query.push(")");
        }
        let deleted = query.build().execute(&self.pool).await?.rows_affected();
        Ok(deleted)
    }

    async fn fetch(
        &self,
        client_id: &str,
        batch: i64,
        action_names: &[String],
    ) -> Result<Vec<Job>, StoreError> {
        if batch <= 0 || action_names.is_empty() {
            return Ok(Vec::new());
        }

        // One statement, one snapshot: lock candidates skip-locked, rank
        // them inside each pair's headroom, cap globally, then re-verify
        // per admitted job against its own stored limit.
        let mut jobs: Vec<Job> = sqlx::query_as(&format!(
            r#"
            WITH eligible AS (
                SELECT g.group_key, g.action_name,
                       (SELECT l.concurrency_limit
                          FROM jobs l
                         WHERE l.group_key = g.group_key
                           AND l.action_name = g.action_name
                           AND (l.expires_at IS NULL OR l.expires_at > NOW())
                         ORDER BY l.created_at DESC, l.id DESC
                         LIMIT 1) AS group_limit,
                       (SELECT COUNT(*)
                          FROM jobs a
                         WHERE a.group_key = g.group_key
                           AND a.action_name = g.action_name
                           AND a.status = 'active') AS active_count
                  FROM (SELECT DISTINCT group_key, action_name
                          FROM jobs
                         WHERE status = 'created'
                           AND action_name = ANY($2)) g
            ),
            locked AS (
                SELECT j.id, j.group_key, j.action_name, j.created_at,
                       e.group_limit - e.active_count AS headroom
                  FROM jobs j
                  JOIN eligible e
                    ON e.group_key = j.group_key
                   AND e.action_name = j.action_name
                 WHERE j.status = 'created'
                   AND e.active_count < e.group_limit
                 ORDER BY j.created_at ASC, j.id ASC
                   FOR UPDATE OF j SKIP LOCKED
            ),
            ranked AS (
                SELECT id, created_at, headroom,
                       ROW_NUMBER() OVER (PARTITION BY group_key, action_name
                                          ORDER BY created_at ASC, id ASC) AS pair_rank
                  FROM locked
            ),
            picked AS (
                SELECT id FROM ranked
                 WHERE pair_rank <= headroom
                 ORDER BY created_at ASC, id ASC
                 LIMIT $3
            )
            UPDATE jobs
               SET status = 'active',
                   client_id = $1,
                   started_at = NOW(),
                   expires_at = NOW() + (jobs.timeout_ms::text || ' milliseconds')::interval,
                   updated_at = NOW()
             WHERE jobs.id IN (SELECT id FROM picked)
               AND (SELECT COUNT(*)
                      FROM jobs a
                     WHERE a.group_key = jobs.group_key
                       AND a.action_name = jobs.action_name
                       AND a.status = 'active') < jobs.concurrency_limit
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(client_id)
        .bind(action_names)
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING order is unspecified; admission order is contractual.
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn active_client_ids(&self, exclude: &str) -> Result<Vec<String>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT client_id FROM jobs
            WHERE status = 'active'
              AND client_id IS NOT NULL
              AND client_id <> $1
            ORDER BY client_id
            "#,
        )
        .bind(exclude)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn reset_orphaned_jobs(
        &self,
        suspects: &[String],
        known_checksums: &[String],
    ) -> Result<u64, StoreError> {
        if suspects.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        let orphaned: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, checksum FROM jobs
            WHERE status = 'active' AND client_id = ANY($1)
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(suspects)
        .fetch_all(&mut *tx)
        .await?;

        if orphaned.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let ids: Vec<Uuid> = orphaned.iter().map(|(id, _)| *id).collect();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'created',
                client_id = NULL,
                started_at = NULL,
                expires_at = NULL,
                finished_at = NULL,
                output = NULL,
                error = NULL,
                updated_at = NOW()
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        // The action code changed for these jobs; their step history is
        // no longer trustworthy.
        let stale: Vec<Uuid> = orphaned
            .iter()
            .filter(|(_, checksum)| !known_checksums.contains(checksum))
            .map(|(id, _)| *id)
            .collect();
        if !stale.is_empty() {
            sqlx::query("DELETE FROM job_steps WHERE job_id = ANY($1)")
                .bind(&stale)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(orphaned.len() as u64)
    }

    async fn create_or_recover_job_step(
        &self,
        params: StepParams,
    ) -> Result<Option<StepRow>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let job: Option<(JobStatus, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT status, expires_at FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(params.job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let job_alive = matches!(
            job,
            Some((JobStatus::Active, Some(expires_at))) if expires_at > Utc::now()
        );
        if !job_alive {
            tx.rollback().await?;
            return Ok(None);
        }

        let existing: Option<JobStep> = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM job_steps \
             WHERE job_id = $1 AND name = $2 FOR UPDATE"
        ))
        .bind(params.job_id)
        .bind(&params.name)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match existing {
            Some(step) if step.status.is_terminal() => {
                tx.commit().await?;
                return Ok(Some(StepRow {
                    id: step.id,
                    status: step.status,
                    retries_limit: step.retries_limit,
                    retries_count: step.retries_count,
                    timeout_ms: step.timeout_ms,
                    output: step.output,
                    error: step.error,
                    is_new: false,
                }));
            }
            Some(step) => {
                // In flight when its worker died: reset in place.
                let reset: JobStep = sqlx::query_as(&format!(
                    r#"
                    UPDATE job_steps
                    SET status = 'active',
                        timeout_ms = $2,
                        retries_limit = $3,
                        retries_count = 0,
                        delayed_ms = NULL,
                        history_failed_attempts = '{{}}'::jsonb,
                        started_at = NOW(),
                        expires_at = NOW() + ($2::text || ' milliseconds')::interval,
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING {STEP_COLUMNS}
                    "#
                ))
                .bind(step.id)
                .bind(params.timeout_ms)
                .bind(params.retries_limit)
                .fetch_one(&mut *tx)
                .await?;
                StepRow {
                    id: reset.id,
                    status: reset.status,
                    retries_limit: reset.retries_limit,
                    retries_count: reset.retries_count,
                    timeout_ms: reset.timeout_ms,
                    output: None,
                    error: None,
                    is_new: false,
                }
            }
            None => {
                let inserted: JobStep = sqlx::query_as(&format!(
                    r#"
                    INSERT INTO job_steps (id, job_id, name, status, timeout_ms,
                                           expires_at, retries_limit, started_at)
                    VALUES ($1, $2, $3, 'active', $4,
                            NOW() + ($4::text || ' milliseconds')::interval, $5, NOW())
                    RETURNING {STEP_COLUMNS}
                    "#
                ))
                .bind(Uuid::new_v4())
                .bind(params.job_id)
                .bind(&params.name)
                .bind(params.timeout_ms)
                .bind(params.retries_limit)
                .fetch_one(&mut *tx)
                .await?;
                StepRow {
                    id: inserted.id,
                    status: inserted.status,
                    retries_limit: inserted.retries_limit,
                    retries_count: inserted.retries_count,
                    timeout_ms: inserted.timeout_ms,
                    output: None,
                    error: None,
                    is_new: true,
                }
            }
        };

        tx.commit().await?;
        Ok(Some(row))
    }

    async fn complete_job_step(
        &self,
        step_id: Uuid,
        output: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let row: Option<(Uuid, Option<String>)> = sqlx::query_as(
            r#"
            WITH target AS (
                SELECT s.id, s.job_id, j.client_id
                  FROM job_steps s
                  JOIN jobs j ON j.id = s.job_id
                 WHERE s.id = $1 AND s.status = 'active' AND j.status = 'active'
                   FOR UPDATE OF s
            )
            UPDATE job_steps
               SET status = 'completed',
                   output = $2,
                   finished_at = NOW(),
                   updated_at = NOW()
              FROM target
             WHERE job_steps.id = target.id
            RETURNING target.job_id, target.client_id
            "#,
        )
        .bind(step_id)
        .bind(&output)
        .fetch_optional(&self.pool)
        .await?;

        let Some((job_id, client_id)) = row else {
            return Ok(false);
        };
        self.emit(Notification::StepStatusChanged {
            job_id,
            step_id,
            status: StepStatus::Completed,
            error: None,
            client_id,
        })
        .await;
        Ok(true)
    }

    async fn fail_job_step(
        &self,
        step_id: Uuid,
        error: SerializedError,
    ) -> Result<bool, StoreError> {
        let row: Option<(Uuid, Option<String>)> = sqlx::query_as(
            r#"
            WITH target AS (
                SELECT s.id, s.job_id, j.client_id
                  FROM job_steps s
                  JOIN jobs j ON j.id = s.job_id
                 WHERE s.id = $1 AND s.status = 'active' AND j.status = 'active'
                   FOR UPDATE OF s
            )
            UPDATE job_steps
               SET status = 'failed',
                   error = $2,
                   finished_at = NOW(),
                   updated_at = NOW()
              FROM target
             WHERE job_steps.id = target.id
            RETURNING target.job_id, target.client_id
            "#,
        )
        .bind(step_id)
        .bind(error.to_value())
        .fetch_optional(&self.pool)
        .await?;

        let Some((job_id, client_id)) = row else {
            return Ok(false);
        };
        self.emit(Notification::StepStatusChanged {
            job_id,
            step_id,
            status: StepStatus::Failed,
            error: Some(error),
            client_id,
        })
        .await;
        Ok(true)
    }

    async fn cancel_job_step(&self, step_id: Uuid) -> Result<bool, StoreError> {
        // The job row is finalised before in-flight steps observe the
        // abort, so `cancelled` jobs still accept step cancellation.
        let row: Option<(Uuid, Option<String>)> = sqlx::query_as(
            r#"
            WITH target AS (
                SELECT s.id, s.job_id, j.client_id
                  FROM job_steps s
                  JOIN jobs j ON j.id = s.job_id
                 WHERE s.id = $1
                   AND s.status = 'active'
                   AND j.status IN ('active', 'cancelled')
                   FOR UPDATE OF s
            )
            UPDATE job_steps
               SET status = 'cancelled',
                   finished_at = NOW(),
                   updated_at = NOW()
              FROM target
             WHERE job_steps.id = target.id
            RETURNING target.job_id, target.client_id
            "#,
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((job_id, client_id)) = row else {
            return Ok(false);
        };
        self.emit(Notification::StepStatusChanged {
            job_id,
            step_id,
            status: StepStatus::Cancelled,
            error: None,
            client_id,
        })
        .await;
        Ok(true)
    }

    async fn delay_job_step(
        &self,
        step_id: Uuid,
        error: SerializedError,
        delay_ms: i64,
    ) -> Result<bool, StoreError> {
        let slot = Utc::now().timestamp_millis().to_string();
        let entry = serde_json::json!({
            "failed_at": Utc::now(),
            "error": error.to_value(),
            "delayed_ms": delay_ms,
        });

        let row: Option<(Uuid, Option<String>)> = sqlx::query_as(
            r#"
            WITH target AS (
                SELECT s.id, s.job_id, j.client_id
                  FROM job_steps s
                  JOIN jobs j ON j.id = s.job_id
                 WHERE s.id = $1 AND s.status = 'active' AND j.status = 'active'
                   FOR UPDATE OF s
            )
            UPDATE job_steps
               SET retries_count = job_steps.retries_count + 1,
                   delayed_ms = $2,
                   history_failed_attempts =
                       job_steps.history_failed_attempts || jsonb_build_object($3::text, $4::jsonb),
                   expires_at = COALESCE(job_steps.expires_at, NOW())
                       + ((job_steps.timeout_ms + $2)::text || ' milliseconds')::interval,
                   updated_at = NOW()
              FROM target
             WHERE job_steps.id = target.id
            RETURNING target.job_id, target.client_id
            "#,
        )
        .bind(step_id)
        .bind(delay_ms)
        .bind(&slot)
        .bind(&entry)
        .fetch_optional(&self.pool)
        .await?;

        let Some((job_id, client_id)) = row else {
            return Ok(false);
        };
        self.emit(Notification::StepDelayed {
            job_id,
            step_id,
            delayed_ms: delay_ms,
            error,
            client_id,
        })
        .await;
        Ok(true)
    }

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn get_jobs(&self, opts: GetJobsOptions) -> Result<Vec<Job>, StoreError> {
        let mut query = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE TRUE"));
        if !opts.filters.ids.is_empty() {
            query.push(" AND id = ANY(");
            query.push_bind(opts.filters.ids);
            query.push(")");
        }
        if !opts.filters.statuses.is_empty() {
            query.push(" AND status = ANY(");
            query.push_bind(opts.filters.statuses);
            query.push(")");
        }
        if !opts.filters.action_names.is_empty() {
            query.push(" AND action_name = ANY(");
            query.push_bind(opts.filters.action_names);
            query.push(")");
        }
        if !opts.filters.group_keys.is_empty() {
            query.push(" AND group_key = ANY(");
            query.push_bind(opts.filters.group_keys);
            query.push(")");
        }

        let direction = match opts.sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        query.push(format!(
            " ORDER BY {} {direction}, id {direction}",
            opts.sort_field.column()
        ));
        query.push(" LIMIT ");
        query.push_bind(opts.pagination.limit.max(0));
        query.push(" OFFSET ");
        query.push_bind(opts.pagination.offset.max(0));

        let jobs = query.build_query_as::<Job>().fetch_all(&self.pool).await?;
        Ok(jobs)
    }

    async fn get_job_steps(
        &self,
        job_id: Uuid,
        pagination: Pagination,
        search: Option<&str>,
    ) -> Result<Vec<JobStep>, StoreError> {
        // Step outputs can be large; listings omit them.
        let steps = sqlx::query_as(
            r#"
            SELECT id, job_id, name, status, NULL::jsonb AS output, error,
                   started_at, finished_at, timeout_ms, expires_at,
                   retries_limit, retries_count, delayed_ms,
                   history_failed_attempts, created_at, updated_at
              FROM job_steps
             WHERE job_id = $1
               AND ($2::text IS NULL OR name ILIKE '%' || $2 || '%')
             ORDER BY created_at ASC, id ASC
             LIMIT $3 OFFSET $4
            "#,
        )
        .bind(job_id)
        .bind(search)
        .bind(pagination.limit.max(0))
        .bind(pagination.offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(steps)
    }

    async fn get_job_step_by_id(&self, step_id: Uuid) -> Result<Option<JobStep>, StoreError> {
        let step = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM job_steps WHERE id = $1"
        ))
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(step)
    }

    async fn get_job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, StoreError> {
        let status = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status)
    }

    async fn get_job_step_status(
        &self,
        step_id: Uuid,
    ) -> Result<Option<StepStatus>, StoreError> {
        let status = sqlx::query_scalar("SELECT status FROM job_steps WHERE id = $1")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status)
    }

    async fn get_actions(&self) -> Result<Vec<ActionOverview>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT action_name,
                   COUNT(*) FILTER (WHERE status = 'created')   AS created,
                   COUNT(*) FILTER (WHERE status = 'active')    AS active,
                   COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                   COUNT(*) FILTER (WHERE status = 'failed')    AS failed,
                   COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                   MAX(created_at) AS last_created_at
              FROM jobs
             GROUP BY action_name
             ORDER BY action_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ActionOverview {
                action_name: row.get("action_name"),
                counts: StatusCounts {
                    created: row.get("created"),
                    active: row.get("active"),
                    completed: row.get("completed"),
                    failed: row.get("failed"),
                    cancelled: row.get("cancelled"),
                },
                last_created_at: row.get("last_created_at"),
            })
            .collect())
    }

    async fn publish(&self, notification: Notification) -> Result<(), StoreError> {
        self.publish_inner(&notification).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.local.subscribe()
    }
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
