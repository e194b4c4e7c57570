//! Job and step models plus the query/filter types used by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::SerializedError;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Created,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses admit no further mutation except deletion.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_step_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Active => "active",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

// ============================================================================
// Job model
// ============================================================================

/// One scheduled execution of an action.
///
/// While `active` the row is leased to the worker identified by `client_id`
/// and the lease expires at `expires_at = started_at + timeout_ms`.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub action_name: String,
    pub group_key: String,
    pub status: JobStatus,
    pub checksum: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub timeout_ms: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub client_id: Option<String>,
    pub concurrency_limit: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Parse the stored failure, if any.
    pub fn error_details(&self) -> Option<SerializedError> {
        self.error.as_ref().and_then(SerializedError::from_value)
    }
}

/// Parameters for inserting a new `created` job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub action_name: String,
    pub group_key: String,
    pub input: serde_json::Value,
    pub timeout_ms: i64,
    pub checksum: String,
    pub concurrency_limit: i32,
}

// ============================================================================
// Step model
// ============================================================================

/// A named, retryable, timeout-bound unit inside a job's handler.
///
/// Keyed by `(job_id, name)` so a re-run of the job after a crash resumes
/// idempotently: completed steps replay their stored output instead of
/// executing again.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobStep {
    pub id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub timeout_ms: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub retries_limit: i32,
    pub retries_count: i32,
    pub delayed_ms: Option<i64>,
    pub history_failed_attempts: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStep {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn error_details(&self) -> Option<SerializedError> {
        self.error.as_ref().and_then(SerializedError::from_value)
    }

    /// Parse the failure history map, keyed by millisecond time slots.
    pub fn failed_attempts(&self) -> BTreeMap<String, FailedAttempt> {
        serde_json::from_value(self.history_failed_attempts.clone()).unwrap_or_default()
    }
}

/// One entry in a step's failure history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub failed_at: DateTime<Utc>,
    pub error: SerializedError,
    pub delayed_ms: i64,
}

/// Parameters for [`crate::store::Store::create_or_recover_job_step`].
#[derive(Debug, Clone)]
pub struct StepParams {
    pub job_id: Uuid,
    pub name: String,
    pub timeout_ms: i64,
    pub retries_limit: i32,
}

/// The row handed back to the step machinery on create-or-recover.
#[derive(Debug, Clone)]
pub struct StepRow {
    pub id: Uuid,
    pub status: StepStatus,
    pub retries_limit: i32,
    pub retries_count: i32,
    pub timeout_ms: i64,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    /// True when this call inserted the row (first encounter of the name).
    pub is_new: bool,
}

// ============================================================================
// Queries
// ============================================================================

/// Offset/limit pagination for list queries.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: i64,
    pub limit: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobSortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    FinishedAt,
}

impl JobSortField {
    pub fn column(&self) -> &'static str {
        match self {
            JobSortField::CreatedAt => "created_at",
            JobSortField::UpdatedAt => "updated_at",
            JobSortField::FinishedAt => "finished_at",
        }
    }
}

/// Filters for job list queries and bulk deletion.
#[derive(Debug, Clone, Default)]
pub struct JobFilters {
    pub ids: Vec<Uuid>,
    pub statuses: Vec<JobStatus>,
    pub action_names: Vec<String>,
    pub group_keys: Vec<String>,
}

impl JobFilters {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
            && self.statuses.is_empty()
            && self.action_names.is_empty()
            && self.group_keys.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetJobsOptions {
    pub pagination: Pagination,
    pub filters: JobFilters,
    pub sort_field: JobSortField,
    pub sort_order: SortOrder,
}

/// Count of jobs by status for one action, plus the latest creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub created: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

/// Aggregate row returned by `get_actions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOverview {
    pub action_name: String,
    pub counts: StatusCounts,
    pub last_created_at: Option<DateTime<Utc>>,
}
