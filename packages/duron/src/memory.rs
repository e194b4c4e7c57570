//! In-memory store implementing the same logical contract as the
//! Postgres dialect.
//!
//! Single-process only: one mutex is the admission critical section, so
//! the concurrency invariants hold trivially while the state transitions
//! stay bit-for-bit compatible with the SQL implementation. Used by the
//! engine's own tests and exported to downstream crates behind the
//! `testing` feature.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{SerializedError, StoreError};
use crate::job::{
    ActionOverview, FailedAttempt, GetJobsOptions, Job, JobFilters, JobSortField, JobStatus,
    JobStep, NewJob, Pagination, SortOrder, StatusCounts, StepParams, StepRow, StepStatus,
};
use crate::notifier::Notification;
use crate::store::Store;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    steps: HashMap<Uuid, JobStep>,
}

/// In-process [`Store`]. Cheap to share: clone the `Arc` around it.
pub struct MemoryStore {
    state: Mutex<State>,
    bus: broadcast::Sender<Notification>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, notification: Notification) {
        let _ = self.bus.send(notification);
    }

    /// The effective admission limit of a `(group_key, action_name)`
    /// pair: the `concurrency_limit` of its most recently created job
    /// whose lease has not expired.
    fn group_limit(state: &State, group_key: &str, action_name: &str, now: DateTime<Utc>) -> Option<i32> {
        state
            .jobs
            .values()
            .filter(|j| {
                j.group_key == group_key
                    && j.action_name == action_name
                    && j.expires_at.map_or(true, |t| t > now)
            })
            .max_by_key(|j| (j.created_at, j.id))
            .map(|j| j.concurrency_limit)
    }

    fn active_count(state: &State, group_key: &str, action_name: &str) -> i64 {
        state
            .jobs
            .values()
            .filter(|j| {
                j.group_key == group_key
                    && j.action_name == action_name
                    && j.status == JobStatus::Active
            })
            .count() as i64
    }

    fn step_by_name(state: &State, job_id: Uuid, name: &str) -> Option<Uuid> {
        state
            .steps
            .values()
            .find(|s| s.job_id == job_id && s.name == name)
            .map(|s| s.id)
    }

    fn matches(job: &Job, filters: &JobFilters) -> bool {
        (filters.ids.is_empty() || filters.ids.contains(&job.id))
            && (filters.statuses.is_empty() || filters.statuses.contains(&job.status))
            && (filters.action_names.is_empty()
                || filters.action_names.contains(&job.action_name))
            && (filters.group_keys.is_empty() || filters.group_keys.contains(&job.group_key))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn start(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_job(&self, new: NewJob) -> Result<Uuid, StoreError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            action_name: new.action_name,
            group_key: new.group_key,
            status: JobStatus::Created,
            checksum: new.checksum,
            input: new.input,
            output: None,
            error: None,
            timeout_ms: new.timeout_ms.max(1),
            expires_at: None,
            started_at: None,
            finished_at: None,
            client_id: None,
            concurrency_limit: new.concurrency_limit.max(1),
            created_at: now,
            updated_at: now,
        };
        let id = job.id;
        self.lock().jobs.insert(id, job);
        self.emit(Notification::JobAvailable { job_id: id });
        Ok(id)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        client_id: &str,
        output: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let owner = {
            let mut state = self.lock();
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return Ok(false);
            };
            let owned = job.status == JobStatus::Active
                && job.client_id.as_deref() == Some(client_id)
                && job.expires_at.map_or(false, |t| t > now);
            if !owned {
                return Ok(false);
            }
            let owner = job.client_id.take();
            job.status = JobStatus::Completed;
            job.output = Some(output);
            job.finished_at = Some(now);
            job.updated_at = now;
            owner
        };
        self.emit(Notification::JobStatusChanged {
            job_id,
            status: JobStatus::Completed,
            client_id: owner,
        });
        Ok(true)
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        client_id: &str,
        error: SerializedError,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let owner = {
            let mut state = self.lock();
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return Ok(false);
            };
            let owned =
                job.status == JobStatus::Active && job.client_id.as_deref() == Some(client_id);
            if !owned {
                return Ok(false);
            }
            let owner = job.client_id.take();
            job.status = JobStatus::Failed;
            job.error = Some(error.to_value());
            job.finished_at = Some(now);
            job.updated_at = now;
            owner
        };
        self.emit(Notification::JobStatusChanged {
            job_id,
            status: JobStatus::Failed,
            client_id: owner,
        });
        Ok(true)
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let now = Utc::now();
        let owner = {
            let mut state = self.lock();
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return Ok(false);
            };
            if !matches!(job.status, JobStatus::Created | JobStatus::Active) {
                return Ok(false);
            }
            let owner = job.client_id.take();
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(now);
            job.updated_at = now;
            owner
        };
        self.emit(Notification::JobStatusChanged {
            job_id,
            status: JobStatus::Cancelled,
            client_id: owner,
        });
        Ok(true)
    }

    async fn retry_job(&self, job_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let now = Utc::now();
        let new_id = {
            let mut state = self.lock();
            let Some(source) = state.jobs.get(&job_id).cloned() else {
                return Ok(None);
            };
            if !source.is_terminal() {
                return Ok(None);
            }

            // At most one non-terminal sibling per identity tuple.
            let duplicate = state.jobs.values().any(|j| {
                !j.is_terminal()
                    && j.action_name == source.action_name
                    && j.group_key == source.group_key
                    && j.checksum == source.checksum
                    && j.input == source.input
            });
            if duplicate {
                return Ok(None);
            }

            let limit =
                Self::group_limit(&state, &source.group_key, &source.action_name, now)
                    .unwrap_or(source.concurrency_limit);

            let job = Job {
                id: Uuid::new_v4(),
                action_name: source.action_name,
                group_key: source.group_key,
                status: JobStatus::Created,
                checksum: source.checksum,
                input: source.input,
                output: None,
                error: None,
                timeout_ms: source.timeout_ms,
                expires_at: None,
                started_at: None,
                finished_at: None,
                client_id: None,
                concurrency_limit: limit,
                created_at: now,
                updated_at: now,
            };
            let id = job.id;
            state.jobs.insert(id, job);
            id
        };
        self.emit(Notification::JobAvailable { job_id: new_id });
        Ok(Some(new_id))
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.jobs.get(&job_id) {
            Some(job) if job.status != JobStatus::Active => {
                state.jobs.remove(&job_id);
                state.steps.retain(|_, s| s.job_id != job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_jobs(&self, filters: JobFilters) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let doomed: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.status != JobStatus::Active && Self::matches(j, &filters))
            .map(|j| j.id)
            .collect();
        for id in &doomed {
            state.jobs.remove(id);
            state.steps.retain(|_, s| s.job_id != *id);
        }
        Ok(doomed.len() as u64)
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
        let now = Utc::now();
        let mut state = self.lock();

        // Distinct pairs holding created jobs for the caller's actions.
        let pairs: HashSet<(String, String)> = state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Created && action_names.contains(&j.action_name)
            })
            .map(|j| (j.group_key.clone(), j.action_name.clone()))
            .collect();

        // Headroom ranking per eligible pair.
        let mut selected: Vec<(DateTime<Utc>, Uuid)> = Vec::new();
        for (group_key, action_name) in pairs {
            let Some(limit) = Self::group_limit(&state, &group_key, &action_name, now) else {
                continue;
            };
            let headroom = limit as i64 - Self::active_count(&state, &group_key, &action_name);
            if headroom <= 0 {
                continue;
            }
            let mut candidates: Vec<(DateTime<Utc>, Uuid)> = state
                .jobs
                .values()
                .filter(|j| {
                    j.status == JobStatus::Created
                        && j.group_key == group_key
                        && j.action_name == action_name
                })
                .map(|j| (j.created_at, j.id))
                .collect();
            candidates.sort();
            selected.extend(candidates.into_iter().take(headroom as usize));
        }

        // Global admission order, capped to the batch.
        selected.sort();
        selected.truncate(batch as usize);

        // The write-time check against each job's own stored limit is
        // authoritative; counts grow as earlier picks are admitted.
        let mut claimed = Vec::new();
        for (_, id) in selected {
            let Some(job) = state.jobs.get(&id).cloned() else {
                continue;
            };
            let active_now = Self::active_count(&state, &job.group_key, &job.action_name);
            if active_now >= job.concurrency_limit as i64 {
                continue;
            }
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Active;
                job.started_at = Some(now);
                job.expires_at = Some(now + ChronoDuration::milliseconds(job.timeout_ms));
                job.client_id = Some(client_id.to_string());
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn active_client_ids(&self, exclude: &str) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        let mut ids: Vec<String> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Active)
            .filter_map(|j| j.client_id.clone())
            .filter(|cid| cid != exclude)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn reset_orphaned_jobs(
        &self,
        suspects: &[String],
        known_checksums: &[String],
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut state = self.lock();
        let orphaned: Vec<(Uuid, String)> = state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Active
                    && j.client_id
                        .as_ref()
                        .map_or(false, |cid| suspects.contains(cid))
            })
            .map(|j| (j.id, j.checksum.clone()))
            .collect();

        for (id, checksum) in &orphaned {
            if let Some(job) = state.jobs.get_mut(id) {
                job.status = JobStatus::Created;
                job.started_at = None;
                job.expires_at = None;
                job.finished_at = None;
                job.output = None;
                job.error = None;
                job.client_id = None;
                job.updated_at = now;
            }
            // The action code changed; its step history is untrustworthy.
            if !known_checksums.contains(checksum) {
                state.steps.retain(|_, s| s.job_id != *id);
            }
        }
        Ok(orphaned.len() as u64)
    }

    async fn create_or_recover_job_step(
        &self,
        params: StepParams,
    ) -> Result<Option<StepRow>, StoreError> {
        let now = Utc::now();
        let mut state = self.lock();

        let job_alive = state.jobs.get(&params.job_id).map_or(false, |job| {
            job.status == JobStatus::Active && job.expires_at.map_or(false, |t| t > now)
        });
        if !job_alive {
            return Ok(None);
        }

        if let Some(step_id) = Self::step_by_name(&state, params.job_id, &params.name) {
            let step = state
                .steps
                .get_mut(&step_id)
                .ok_or(StoreError::NotRunning)?;
            if step.status.is_terminal() {
                return Ok(Some(StepRow {
                    id: step.id,
                    status: step.status,
                    retries_limit: step.retries_limit,
                    retries_count: step.retries_count,
                    timeout_ms: step.timeout_ms,
                    output: step.output.clone(),
                    error: step.error.clone(),
                    is_new: false,
                }));
            }
            // In flight when a worker died: reset in place.
            step.timeout_ms = params.timeout_ms;
            step.retries_limit = params.retries_limit;
            step.retries_count = 0;
            step.delayed_ms = None;
            step.history_failed_attempts = serde_json::json!({});
            step.started_at = Some(now);
            step.expires_at = Some(now + ChronoDuration::milliseconds(params.timeout_ms));
            step.status = StepStatus::Active;
            step.updated_at = now;
            return Ok(Some(StepRow {
                id: step.id,
                status: StepStatus::Active,
                retries_limit: step.retries_limit,
                retries_count: 0,
                timeout_ms: step.timeout_ms,
                output: None,
                error: None,
                is_new: false,
            }));
        }

        let step = JobStep {
            id: Uuid::new_v4(),
            job_id: params.job_id,
            name: params.name,
            status: StepStatus::Active,
            output: None,
            error: None,
            started_at: Some(now),
            finished_at: None,
            timeout_ms: params.timeout_ms,
            expires_at: Some(now + ChronoDuration::milliseconds(params.timeout_ms)),
            retries_limit: params.retries_limit,
            retries_count: 0,
            delayed_ms: None,
            history_failed_attempts: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        let row = StepRow {
            id: step.id,
            status: StepStatus::Active,
            retries_limit: step.retries_limit,
            retries_count: 0,
            timeout_ms: step.timeout_ms,
            output: None,
            error: None,
            is_new: true,
        };
        state.steps.insert(step.id, step);
        Ok(Some(row))
    }

    async fn complete_job_step(
        &self,
        step_id: Uuid,
        output: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let notification = {
            let mut state = self.lock();
            let Some(step) = state.steps.get(&step_id) else {
                return Ok(false);
            };
            let job_id = step.job_id;
            let job_active = state
                .jobs
                .get(&job_id)
                .map_or(false, |j| j.status == JobStatus::Active);
            let client_id = state.jobs.get(&job_id).and_then(|j| j.client_id.clone());
            if !(step.status == StepStatus::Active && job_active) {
                return Ok(false);
            }
            let step = state.steps.get_mut(&step_id).ok_or(StoreError::NotRunning)?;
            step.status = StepStatus::Completed;
            step.output = Some(output);
            step.finished_at = Some(now);
            step.updated_at = now;
            Notification::StepStatusChanged {
                job_id,
                step_id,
                status: StepStatus::Completed,
                error: None,
                client_id,
            }
        };
        self.emit(notification);
        Ok(true)
    }

    async fn fail_job_step(
        &self,
        step_id: Uuid,
        error: SerializedError,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let notification = {
            let mut state = self.lock();
            let Some(step) = state.steps.get(&step_id) else {
                return Ok(false);
            };
            let job_id = step.job_id;
            let job_active = state
                .jobs
                .get(&job_id)
                .map_or(false, |j| j.status == JobStatus::Active);
            let client_id = state.jobs.get(&job_id).and_then(|j| j.client_id.clone());
            if !(step.status == StepStatus::Active && job_active) {
                return Ok(false);
            }
            let step = state.steps.get_mut(&step_id).ok_or(StoreError::NotRunning)?;
            step.status = StepStatus::Failed;
            step.error = Some(error.to_value());
            step.finished_at = Some(now);
            step.updated_at = now;
            Notification::StepStatusChanged {
                job_id,
                step_id,
                status: StepStatus::Failed,
                error: Some(error),
                client_id,
            }
        };
        self.emit(notification);
        Ok(true)
    }

    async fn cancel_job_step(&self, step_id: Uuid) -> Result<bool, StoreError> {
        let now = Utc::now();
        let notification = {
            let mut state = self.lock();
            let Some(step) = state.steps.get(&step_id) else {
                return Ok(false);
            };
            let job_id = step.job_id;
            // The job row is finalised before in-flight steps observe the
            // abort, so `cancelled` jobs still accept step cancellation.
            let job_ok = state.jobs.get(&job_id).map_or(false, |j| {
                matches!(j.status, JobStatus::Active | JobStatus::Cancelled)
            });
            let client_id = state.jobs.get(&job_id).and_then(|j| j.client_id.clone());
            if !(step.status == StepStatus::Active && job_ok) {
                return Ok(false);
            }
            let step = state.steps.get_mut(&step_id).ok_or(StoreError::NotRunning)?;
            step.status = StepStatus::Cancelled;
            step.finished_at = Some(now);
            step.updated_at = now;
            Notification::StepStatusChanged {
                job_id,
                step_id,
                status: StepStatus::Cancelled,
                error: None,
                client_id,
            }
        };
        self.emit(notification);
        Ok(true)
    }

    async fn delay_job_step(
        &self,
        step_id: Uuid,
        error: SerializedError,
        delay_ms: i64,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let notification = {
            let mut state = self.lock();
            let Some(step) = state.steps.get(&step_id) else {
                return Ok(false);
            };
            let job_id = step.job_id;
            let job_active = state
                .jobs
                .get(&job_id)
                .map_or(false, |j| j.status == JobStatus::Active);
            let client_id = state.jobs.get(&job_id).and_then(|j| j.client_id.clone());
            if !(step.status == StepStatus::Active && job_active) {
                return Ok(false);
            }
            let step = state.steps.get_mut(&step_id).ok_or(StoreError::NotRunning)?;
            step.retries_count += 1;
            step.delayed_ms = Some(delay_ms);

            let mut history: BTreeMap<String, FailedAttempt> =
                serde_json::from_value(step.history_failed_attempts.clone()).unwrap_or_default();
            history.insert(
                now.timestamp_millis().to_string(),
                FailedAttempt {
                    failed_at: now,
                    error: error.clone(),
                    delayed_ms: delay_ms,
                },
            );
            step.history_failed_attempts =
                serde_json::to_value(history).unwrap_or(serde_json::json!({}));

            // Extend the lease so a backing-off step is not mistaken for
            // a crash.
            let extension = ChronoDuration::milliseconds(step.timeout_ms + delay_ms);
            step.expires_at = Some(step.expires_at.unwrap_or(now) + extension);
            step.updated_at = now;
            Notification::StepDelayed {
                job_id,
                step_id,
                delayed_ms: delay_ms,
                error,
                client_id,
            }
        };
        self.emit(notification);
        Ok(true)
    }

    async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn get_jobs(&self, opts: GetJobsOptions) -> Result<Vec<Job>, StoreError> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| Self::matches(j, &opts.filters))
            .cloned()
            .collect();

        jobs.sort_by(|a, b| {
            let key = |j: &Job| match opts.sort_field {
                JobSortField::CreatedAt => (Some(j.created_at), j.id),
                JobSortField::UpdatedAt => (Some(j.updated_at), j.id),
                JobSortField::FinishedAt => (j.finished_at, j.id),
            };
            let ordering = key(a).cmp(&key(b));
            match opts.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let offset = opts.pagination.offset.max(0) as usize;
        let limit = opts.pagination.limit.max(0) as usize;
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_job_steps(
        &self,
        job_id: Uuid,
        pagination: Pagination,
        search: Option<&str>,
    ) -> Result<Vec<JobStep>, StoreError> {
        let state = self.lock();
        let mut steps: Vec<JobStep> = state
            .steps
            .values()
            .filter(|s| s.job_id == job_id)
            .filter(|s| search.map_or(true, |needle| s.name.contains(needle)))
            .cloned()
            .map(|mut s| {
                // Outputs are omitted from listings for bandwidth.
                s.output = None;
                s
            })
            .collect();
        steps.sort_by_key(|s| (s.created_at, s.id));

        let offset = pagination.offset.max(0) as usize;
        let limit = pagination.limit.max(0) as usize;
        Ok(steps.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_job_step_by_id(&self, step_id: Uuid) -> Result<Option<JobStep>, StoreError> {
        Ok(self.lock().steps.get(&step_id).cloned())
    }

    async fn get_job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, StoreError> {
        Ok(self.lock().jobs.get(&job_id).map(|j| j.status))
    }

    async fn get_job_step_status(
        &self,
        step_id: Uuid,
    ) -> Result<Option<StepStatus>, StoreError> {
        Ok(self.lock().steps.get(&step_id).map(|s| s.status))
    }

    async fn get_actions(&self) -> Result<Vec<ActionOverview>, StoreError> {
        let state = self.lock();
        let mut by_action: BTreeMap<String, ActionOverview> = BTreeMap::new();
        for job in state.jobs.values() {
            let entry = by_action
                .entry(job.action_name.clone())
                .or_insert_with(|| ActionOverview {
                    action_name: job.action_name.clone(),
                    counts: StatusCounts::default(),
                    last_created_at: None,
                });
            match job.status {
                JobStatus::Created => entry.counts.created += 1,
                JobStatus::Active => entry.counts.active += 1,
                JobStatus::Completed => entry.counts.completed += 1,
                JobStatus::Failed => entry.counts.failed += 1,
                JobStatus::Cancelled => entry.counts.cancelled += 1,
            }
            if entry.last_created_at.map_or(true, |t| job.created_at > t) {
                entry.last_created_at = Some(job.created_at);
            }
        }
        Ok(by_action.into_values().collect())
    }

    async fn publish(&self, notification: Notification) -> Result<(), StoreError> {
        self.emit(notification);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_job(action: &str, group: &str, limit: i32) -> NewJob {
        NewJob {
            action_name: action.to_string(),
            group_key: group.to_string(),
            input: serde_json::json!({}),
            timeout_ms: 60_000,
            checksum: "sum".to_string(),
            concurrency_limit: limit,
        }
    }

    fn names(actions: &[&str]) -> Vec<String> {
        actions.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn created_jobs_have_no_lease_fields() {
        let store = MemoryStore::new();
        let id = store.create_job(new_job("a", "g", 10)).await.unwrap();
        let job = store.get_job_by_id(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert!(job.started_at.is_none());
        assert!(job.expires_at.is_none());
        assert!(job.client_id.is_none());
    }

    #[tokio::test]
    async fn fetch_claims_and_leases() {
        let store = MemoryStore::new();
        let id = store.create_job(new_job("a", "g", 10)).await.unwrap();

        let jobs = store.fetch("w1", 10, &names(&["a"])).await.unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.client_id.as_deref(), Some("w1"));
        let (started, expires) = (job.started_at.unwrap(), job.expires_at.unwrap());
        assert_eq!(expires, started + ChronoDuration::milliseconds(job.timeout_ms));
    }

    #[tokio::test]
    async fn fetch_respects_group_concurrency() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.create_job(new_job("a", "g1", 2)).await.unwrap();
        }

        let first = store.fetch("w1", 10, &names(&["a"])).await.unwrap();
        assert_eq!(first.len(), 2);

        // No completions: a second fetch admits nothing.
        let second = store.fetch("w1", 10, &names(&["a"])).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn fetch_orders_by_creation_within_group() {
        let store = MemoryStore::new();
        let first = store.create_job(new_job("a", "g", 1)).await.unwrap();
        let _second = store.create_job(new_job("a", "g", 1)).await.unwrap();

        let jobs = store.fetch("w1", 10, &names(&["a"])).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, first);
    }

    #[tokio::test]
    async fn latest_job_reshapes_the_group_limit() {
        let store = MemoryStore::new();
        store.create_job(new_job("a", "g", 1)).await.unwrap();
        store.create_job(new_job("a", "g", 1)).await.unwrap();
        // The newest enqueue raises the limit for the whole group.
        store.create_job(new_job("a", "g", 3)).await.unwrap();

        let jobs = store.fetch("w1", 10, &names(&["a"])).await.unwrap();
        assert_eq!(jobs.len(), 3);
    }

    #[tokio::test]
    async fn fetch_ignores_unknown_actions() {
        let store = MemoryStore::new();
        store.create_job(new_job("other", "g", 5)).await.unwrap();
        let jobs = store.fetch("w1", 10, &names(&["a"])).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn complete_requires_ownership() {
        let store = MemoryStore::new();
        let id = store.create_job(new_job("a", "g", 10)).await.unwrap();
        store.fetch("w1", 1, &names(&["a"])).await.unwrap();

        assert!(!store
            .complete_job(id, "intruder", serde_json::json!({}))
            .await
            .unwrap());
        assert!(store
            .complete_job(id, "w1", serde_json::json!({ "ok": true }))
            .await
            .unwrap());

        let job = store.get_job_by_id(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.finished_at.is_some());
        assert!(job.client_id.is_none());

        // Terminal rows accept no further transitions.
        assert!(!store.cancel_job(id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_works_from_created_and_active() {
        let store = MemoryStore::new();
        let created = store.create_job(new_job("a", "g", 10)).await.unwrap();
        assert!(store.cancel_job(created).await.unwrap());

        let active = store.create_job(new_job("a", "g", 10)).await.unwrap();
        store.fetch("w1", 1, &names(&["a"])).await.unwrap();
        assert!(store.cancel_job(active).await.unwrap());
        let job = store.get_job_by_id(active).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn retry_duplicates_are_suppressed() {
        let store = MemoryStore::new();
        let id = store.create_job(new_job("a", "g", 10)).await.unwrap();
        store.fetch("w1", 1, &names(&["a"])).await.unwrap();
        store
            .fail_job(id, "w1", SerializedError::new("Error", "boom"))
            .await
            .unwrap();

        let retried = store.retry_job(id).await.unwrap();
        assert!(retried.is_some());
        // The first retry's sibling is still non-terminal.
        assert!(store.retry_job(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_rejects_non_terminal_sources() {
        let store = MemoryStore::new();
        let id = store.create_job(new_job("a", "g", 10)).await.unwrap();
        assert!(store.retry_job(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_spares_active_jobs() {
        let store = MemoryStore::new();
        let id = store.create_job(new_job("a", "g", 10)).await.unwrap();
        store.fetch("w1", 1, &names(&["a"])).await.unwrap();
        assert!(!store.delete_job(id).await.unwrap());

        store
            .complete_job(id, "w1", serde_json::json!({}))
            .await
            .unwrap();
        assert!(store.delete_job(id).await.unwrap());
        assert!(store.get_job_by_id(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_jobs_filters_and_excludes_active() {
        let store = MemoryStore::new();
        let a = store.create_job(new_job("a", "g", 10)).await.unwrap();
        let _b = store.create_job(new_job("b", "g", 10)).await.unwrap();
        let c = store.create_job(new_job("a", "g2", 10)).await.unwrap();
        store.fetch("w1", 1, &names(&["a"])).await.unwrap(); // claims `a`

        let deleted = store
            .delete_jobs(JobFilters {
                action_names: vec!["a".to_string()],
                ..JobFilters::default()
            })
            .await
            .unwrap();
        // `a` is active and spared; only `c` matches.
        assert_eq!(deleted, 1);
        assert!(store.get_job_by_id(a).await.unwrap().is_some());
        assert!(store.get_job_by_id(c).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_orphaned_jobs_recovers_suspects() {
        let store = MemoryStore::new();
        let id = store.create_job(new_job("a", "g", 10)).await.unwrap();
        store.fetch("dead", 1, &names(&["a"])).await.unwrap();
        store
            .create_or_recover_job_step(StepParams {
                job_id: id,
                name: "s1".into(),
                timeout_ms: 1000,
                retries_limit: 3,
            })
            .await
            .unwrap()
            .unwrap();

        // Same checksum: job reset, steps kept.
        let count = store
            .reset_orphaned_jobs(&["dead".to_string()], &["sum".to_string()])
            .await
            .unwrap();
        assert_eq!(count, 1);
        let job = store.get_job_by_id(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert!(job.client_id.is_none());
        assert!(job.started_at.is_none());
        assert_eq!(
            store
                .get_job_steps(id, Pagination::default(), None)
                .await
                .unwrap()
                .len(),
            1
        );

        // Unknown checksum: step history dropped too.
        store.fetch("dead", 1, &names(&["a"])).await.unwrap();
        let count = store
            .reset_orphaned_jobs(&["dead".to_string()], &["different".to_string()])
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(store
            .get_job_steps(id, Pagination::default(), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn step_lifecycle_and_delay_extend_lease() {
        let store = MemoryStore::new();
        let job_id = store.create_job(new_job("a", "g", 10)).await.unwrap();
        store.fetch("w1", 1, &names(&["a"])).await.unwrap();

        let row = store
            .create_or_recover_job_step(StepParams {
                job_id,
                name: "s1".into(),
                timeout_ms: 1000,
                retries_limit: 3,
            })
            .await
            .unwrap()
            .unwrap();
        assert!(row.is_new);
        assert_eq!(row.status, StepStatus::Active);

        let before = store
            .get_job_step_by_id(row.id)
            .await
            .unwrap()
            .unwrap()
            .expires_at
            .unwrap();

        assert!(store
            .delay_job_step(row.id, SerializedError::new("Error", "flaky"), 50)
            .await
            .unwrap());
        let step = store.get_job_step_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(step.retries_count, 1);
        assert_eq!(step.delayed_ms, Some(50));
        assert_eq!(step.failed_attempts().len(), 1);
        assert_eq!(
            step.expires_at.unwrap(),
            before + ChronoDuration::milliseconds(1000 + 50)
        );

        assert!(store
            .complete_job_step(row.id, serde_json::json!({ "n": 1 }))
            .await
            .unwrap());
        assert_eq!(
            store.get_job_step_status(row.id).await.unwrap(),
            Some(StepStatus::Completed)
        );
        // Terminal steps accept no further transitions.
        assert!(!store
            .fail_job_step(row.id, SerializedError::new("Error", "late"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn step_recovery_resets_active_rows_and_keeps_terminal_rows() {
        let store = MemoryStore::new();
        let job_id = store.create_job(new_job("a", "g", 10)).await.unwrap();
        store.fetch("w1", 1, &names(&["a"])).await.unwrap();

        let params = StepParams {
            job_id,
            name: "s1".into(),
            timeout_ms: 1000,
            retries_limit: 3,
        };
        let row = store
            .create_or_recover_job_step(params.clone())
            .await
            .unwrap()
            .unwrap();
        store
            .delay_job_step(row.id, SerializedError::new("Error", "flaky"), 10)
            .await
            .unwrap();

        // Second encounter while still active: reset in place.
        let recovered = store
            .create_or_recover_job_step(params.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recovered.id, row.id);
        assert!(!recovered.is_new);
        assert_eq!(recovered.retries_count, 0);
        let step = store.get_job_step_by_id(row.id).await.unwrap().unwrap();
        assert!(step.failed_attempts().is_empty());
        assert!(step.delayed_ms.is_none());

        // Terminal rows come back unchanged.
        store
            .complete_job_step(row.id, serde_json::json!({ "done": true }))
            .await
            .unwrap();
        let replay = store
            .create_or_recover_job_step(params)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replay.status, StepStatus::Completed);
        assert_eq!(replay.output, Some(serde_json::json!({ "done": true })));
    }

    #[tokio::test]
    async fn steps_need_an_active_unexpired_job() {
        let store = MemoryStore::new();
        let job_id = store.create_job(new_job("a", "g", 10)).await.unwrap();

        // Job not yet active.
        let row = store
            .create_or_recover_job_step(StepParams {
                job_id,
                name: "s1".into(),
                timeout_ms: 1000,
                retries_limit: 3,
            })
            .await
            .unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn notifications_flow_on_mutations() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        let id = store.create_job(new_job("a", "g", 10)).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            Notification::JobAvailable { job_id: id }
        );

        store.fetch("w1", 1, &names(&["a"])).await.unwrap();
        store
            .complete_job(id, "w1", serde_json::json!({}))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            Notification::JobStatusChanged { job_id, status, .. } => {
                assert_eq!(job_id, id);
                assert_eq!(status, JobStatus::Completed);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_actions_aggregates_counts() {
        let store = MemoryStore::new();
        store.create_job(new_job("a", "g", 10)).await.unwrap();
        store.create_job(new_job("a", "g", 10)).await.unwrap();
        store.create_job(new_job("b", "g", 10)).await.unwrap();
        store.fetch("w1", 1, &names(&["a"])).await.unwrap();

        let overview = store.get_actions().await.unwrap();
        assert_eq!(overview.len(), 2);
        let a = overview.iter().find(|o| o.action_name == "a").unwrap();
        assert_eq!(a.counts.active, 1);
        assert_eq!(a.counts.created, 1);
        assert!(a.last_created_at.is_some());
    }

    #[tokio::test]
    async fn concurrent_fetchers_never_over_admit() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..20 {
            store.create_job(new_job("a", "g", 3)).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let store: &dyn Store = store.as_ref();
                store
                    .fetch(&format!("w{i}"), 10, &["a".to_string()])
                    .await
                    .unwrap()
                    .len()
            }));
        }
        let total: usize = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .sum();
        assert!(total <= 3, "admitted {total} past a limit of 3");
    }
}
