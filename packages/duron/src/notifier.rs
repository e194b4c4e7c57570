//! Topic-keyed pub/sub layered on the store.
//!
//! Delivery is best-effort and at-least-once to local subscribers. Nothing
//! in the engine depends on a notification arriving: the periodic pull loop
//! converges on the same state, so a lost message only costs latency.
//!
//! Topics:
//!
//! | topic                 | meaning                                  |
//! |-----------------------|------------------------------------------|
//! | `job-available`       | a `created` job was inserted             |
//! | `job-status-changed`  | a job reached a new status               |
//! | `step-status-changed` | a step reached a new status              |
//! | `step-delayed`        | a step failed and was scheduled to retry |
//! | `ping-<client-id>`    | liveness probe addressed to one client   |
//! | `pong-<client-id>`    | liveness reply addressed to one client   |

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{SerializedError, StoreError};
use crate::job::{JobStatus, StepStatus};
use crate::store::Store;

const TOPIC_JOB_AVAILABLE: &str = "job-available";
const TOPIC_JOB_STATUS_CHANGED: &str = "job-status-changed";
const TOPIC_STEP_STATUS_CHANGED: &str = "step-status-changed";
const TOPIC_STEP_DELAYED: &str = "step-delayed";
const TOPIC_PING_PREFIX: &str = "ping-";
const TOPIC_PONG_PREFIX: &str = "pong-";

/// An event on the engine's pub/sub channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    JobAvailable {
        job_id: Uuid,
    },
    JobStatusChanged {
        job_id: Uuid,
        status: JobStatus,
        client_id: Option<String>,
    },
    StepStatusChanged {
        job_id: Uuid,
        step_id: Uuid,
        status: StepStatus,
        error: Option<SerializedError>,
        client_id: Option<String>,
    },
    StepDelayed {
        job_id: Uuid,
        step_id: Uuid,
        delayed_ms: i64,
        error: SerializedError,
        client_id: Option<String>,
    },
    /// Liveness probe; `client_id` addresses the receiver, `from` the sender.
    Ping {
        client_id: String,
        from: String,
    },
    /// Liveness reply; `client_id` addresses the receiver, `from` the sender.
    Pong {
        client_id: String,
        from: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct JobAvailablePayload {
    job_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
struct JobStatusPayload {
    job_id: Uuid,
    status: JobStatus,
    #[serde(default)]
    client_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepStatusPayload {
    job_id: Uuid,
    step_id: Uuid,
    status: StepStatus,
    #[serde(default)]
    error: Option<SerializedError>,
    #[serde(default)]
    client_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepDelayedPayload {
    job_id: Uuid,
    step_id: Uuid,
    delayed_ms: i64,
    error: SerializedError,
    #[serde(default)]
    client_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LivenessPayload {
    from: String,
}

impl Notification {
    /// The wire topic string for this notification.
    pub fn topic(&self) -> String {
        match self {
            Notification::JobAvailable { .. } => TOPIC_JOB_AVAILABLE.to_string(),
            Notification::JobStatusChanged { .. } => TOPIC_JOB_STATUS_CHANGED.to_string(),
            Notification::StepStatusChanged { .. } => TOPIC_STEP_STATUS_CHANGED.to_string(),
            Notification::StepDelayed { .. } => TOPIC_STEP_DELAYED.to_string(),
            Notification::Ping { client_id, .. } => format!("{TOPIC_PING_PREFIX}{client_id}"),
            Notification::Pong { client_id, .. } => format!("{TOPIC_PONG_PREFIX}{client_id}"),
        }
    }

    /// Encode as `(topic, payload)` for the store channel.
    pub fn to_wire(&self) -> (String, serde_json::Value) {
        let payload = match self {
            Notification::JobAvailable { job_id } => {
                serde_json::to_value(JobAvailablePayload { job_id: *job_id })
            }
            Notification::JobStatusChanged {
                job_id,
                status,
                client_id,
            } => serde_json::to_value(JobStatusPayload {
                job_id: *job_id,
                status: *status,
                client_id: client_id.clone(),
            }),
            Notification::StepStatusChanged {
                job_id,
                step_id,
                status,
                error,
                client_id,
            } => serde_json::to_value(StepStatusPayload {
                job_id: *job_id,
                step_id: *step_id,
                status: *status,
                error: error.clone(),
                client_id: client_id.clone(),
            }),
            Notification::StepDelayed {
                job_id,
                step_id,
                delayed_ms,
                error,
                client_id,
            } => serde_json::to_value(StepDelayedPayload {
                job_id: *job_id,
                step_id: *step_id,
                delayed_ms: *delayed_ms,
                error: error.clone(),
                client_id: client_id.clone(),
            }),
            Notification::Ping { from, .. } | Notification::Pong { from, .. } => {
                serde_json::to_value(LivenessPayload { from: from.clone() })
            }
        };
        (self.topic(), payload.unwrap_or(serde_json::Value::Null))
    }

    /// Decode a `(topic, payload)` pair. Unknown topics yield `None`.
    pub fn from_wire(topic: &str, payload: &serde_json::Value) -> Option<Self> {
        match topic {
            TOPIC_JOB_AVAILABLE => {
                let p: JobAvailablePayload = serde_json::from_value(payload.clone()).ok()?;
                Some(Notification::JobAvailable { job_id: p.job_id })
            }
            TOPIC_JOB_STATUS_CHANGED => {
                let p: JobStatusPayload = serde_json::from_value(payload.clone()).ok()?;
                Some(Notification::JobStatusChanged {
                    job_id: p.job_id,
                    status: p.status,
                    client_id: p.client_id,
                })
            }
            TOPIC_STEP_STATUS_CHANGED => {
                let p: StepStatusPayload = serde_json::from_value(payload.clone()).ok()?;
                Some(Notification::StepStatusChanged {
                    job_id: p.job_id,
                    step_id: p.step_id,
                    status: p.status,
                    error: p.error,
                    client_id: p.client_id,
                })
            }
            TOPIC_STEP_DELAYED => {
                let p: StepDelayedPayload = serde_json::from_value(payload.clone()).ok()?;
                Some(Notification::StepDelayed {
                    job_id: p.job_id,
                    step_id: p.step_id,
                    delayed_ms: p.delayed_ms,
                    error: p.error,
                    client_id: p.client_id,
                })
            }
            other => {
                let p: LivenessPayload = serde_json::from_value(payload.clone()).ok()?;
                if let Some(target) = other.strip_prefix(TOPIC_PING_PREFIX) {
                    Some(Notification::Ping {
                        client_id: target.to_string(),
                        from: p.from,
                    })
                } else {
                    other.strip_prefix(TOPIC_PONG_PREFIX).map(|target| {
                        Notification::Pong {
                            client_id: target.to_string(),
                            from: p.from,
                        }
                    })
                }
            }
        }
    }
}

/// Typed facade over the store's pub/sub primitives.
#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn Store>,
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Subscribe to every notification on the channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.store.subscribe()
    }

    /// Probe another client for liveness.
    pub async fn ping(&self, target: &str, from: &str) -> Result<(), StoreError> {
        self.store
            .publish(Notification::Ping {
                client_id: target.to_string(),
                from: from.to_string(),
            })
            .await
    }

    /// Answer a liveness probe.
    pub async fn pong(&self, target: &str, from: &str) -> Result<(), StoreError> {
        self.store
            .publish(Notification::Pong {
                client_id: target.to_string(),
                from: from.to_string(),
            })
            .await
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}
