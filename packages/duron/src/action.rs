//! Action definitions: named, schema-validated handlers plus their
//! execution policy (timeouts, step retry, group admission).

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DuronError, ValidationError};
use crate::schema::SchemaCodec;
use crate::steps::{StepContext, StepManager};

/// Default job timeout.
pub const DEFAULT_JOB_EXPIRE: Duration = Duration::from_millis(900_000);
/// Default step timeout.
pub const DEFAULT_STEP_EXPIRE: Duration = Duration::from_millis(300_000);
/// Default number of concurrent step callbacks per job.
pub const DEFAULT_STEP_CONCURRENCY: usize = 10;
/// Group key used when an action does not define one.
pub const DEFAULT_GROUP_KEY: &str = "@default";

// ============================================================================
// Configuration
// ============================================================================

/// Exponential backoff policy for step retries.
///
/// The delay for attempt `n` (zero-based) is
/// `min(max_timeout, min_timeout * factor^n)`, not randomised.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Additional attempts after the first; total attempts = `limit + 1`.
    pub limit: u32,
    pub factor: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: 4,
            factor: 2.0,
            min_timeout: Duration::from_millis(1000),
            max_timeout: Duration::from_millis(30_000),
        }
    }
}

impl RetryConfig {
    /// Backoff delay for the given zero-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.min_timeout.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = raw.min(self.max_timeout.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Step execution policy for an action.
#[derive(Debug, Clone)]
pub struct StepsConfig {
    /// Concurrent step callbacks per job run.
    pub concurrency: usize,
    pub retry: RetryConfig,
    /// Step timeout, measured from step start.
    pub expire: Duration,
}

impl Default for StepsConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_STEP_CONCURRENCY,
            retry: RetryConfig::default(),
            expire: DEFAULT_STEP_EXPIRE,
        }
    }
}

/// Per-call overrides for one step; unset fields fall back to the
/// action's [`StepsConfig`].
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub expire: Option<Duration>,
    pub retry: Option<RetryConfig>,
}

/// Context handed to group-key and group-concurrency resolvers.
#[derive(Debug, Clone)]
pub struct GroupContext {
    /// The validated input of the job being enqueued.
    pub input: serde_json::Value,
}

type GroupKeyFn = Arc<dyn Fn(&GroupContext) -> String + Send + Sync>;
type GroupConcurrencyFn = Arc<dyn Fn(&GroupContext) -> i32 + Send + Sync>;

pub(crate) type HandlerResult = Result<serde_json::Value, anyhow::Error>;
type ErasedHandler<V> =
    Arc<dyn Fn(ActionContext<V>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

// ============================================================================
// Action
// ============================================================================

/// A registered action: identity, policy, schemas and the erased handler.
///
/// Build one with [`Action::builder`]; the typed handler is erased at
/// construction so the engine stores a uniform shape.
#[derive(Clone)]
pub struct Action<V> {
    name: String,
    version: Option<String>,
    checksum: String,
    /// Job timeout, measured from admission.
    expire: Duration,
    steps: StepsConfig,
    group_key: Option<GroupKeyFn>,
    group_concurrency: Option<GroupConcurrencyFn>,
    input: SchemaCodec,
    output: Option<SchemaCodec>,
    handler: ErasedHandler<V>,
}

impl<V> Action<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(name: impl Into<String>) -> ActionBuilder<V> {
        ActionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Content hash of the action identity, stored on every job to drive
    /// recovery and retry identity.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn expire(&self) -> Duration {
        self.expire
    }

    pub fn steps_config(&self) -> &StepsConfig {
        &self.steps
    }

    /// Resolve the group key for an enqueue, defaulting to `"@default"`.
    pub fn resolve_group_key(&self, ctx: &GroupContext) -> String {
        match &self.group_key {
            Some(f) => f(ctx),
            None => DEFAULT_GROUP_KEY.to_string(),
        }
    }

    /// Resolve the group concurrency limit, if the action defines one.
    pub fn resolve_group_concurrency(&self, ctx: &GroupContext) -> Option<i32> {
        self.group_concurrency.as_ref().map(|f| f(ctx))
    }

    pub fn validate_input(
        &self,
        value: &serde_json::Value,
    ) -> Result<serde_json::Value, ValidationError> {
        self.input.validate(value)
    }

    /// Validate the handler's return value when an output schema is
    /// declared; passes the value through untouched otherwise.
    pub fn validate_output(
        &self,
        value: serde_json::Value,
    ) -> Result<serde_json::Value, ValidationError> {
        match &self.output {
            Some(codec) => codec.validate(&value),
            None => Ok(value),
        }
    }

    /// The deterministic mock input sampled from the input schema.
    pub fn mock_input(&self) -> &serde_json::Value {
        self.input.mock()
    }

    pub(crate) fn invoke(&self, ctx: ActionContext<V>) -> BoxFuture<'static, HandlerResult> {
        (self.handler)(ctx)
    }
}

impl<V> std::fmt::Debug for Action<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

/// Metadata surfaced by `get_actions_metadata`.
#[derive(Debug, Clone, Serialize)]
pub struct ActionMetadata {
    pub name: String,
    pub version: Option<String>,
    pub checksum: String,
    pub mock_input: serde_json::Value,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Action`]; finished by [`ActionBuilder::handler`], which
/// fixes the input/output shapes.
pub struct ActionBuilder<V> {
    name: String,
    version: Option<String>,
    expire: Duration,
    steps: StepsConfig,
    group_key: Option<GroupKeyFn>,
    group_concurrency: Option<GroupConcurrencyFn>,
    _var: std::marker::PhantomData<V>,
}

impl<V> ActionBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            expire: DEFAULT_JOB_EXPIRE,
            steps: StepsConfig::default(),
            group_key: None,
            group_concurrency: None,
            _var: std::marker::PhantomData,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Job timeout, measured from admission.
    pub fn expire(mut self, expire: Duration) -> Self {
        self.expire = expire;
        self
    }

    pub fn steps(mut self, steps: StepsConfig) -> Self {
        self.steps = steps;
        self
    }

    pub fn step_retry(mut self, retry: RetryConfig) -> Self {
        self.steps.retry = retry;
        self
    }

    pub fn step_expire(mut self, expire: Duration) -> Self {
        self.steps.expire = expire;
        self
    }

    pub fn step_concurrency(mut self, concurrency: usize) -> Self {
        self.steps.concurrency = concurrency.max(1);
        self
    }

    /// Route jobs of this action into groups; admission concurrency is
    /// scoped per group.
    pub fn group_key(mut self, f: impl Fn(&GroupContext) -> String + Send + Sync + 'static) -> Self {
        self.group_key = Some(Arc::new(f));
        self
    }

    /// Admission limit per group, overriding the client default.
    pub fn group_concurrency(
        mut self,
        f: impl Fn(&GroupContext) -> i32 + Send + Sync + 'static,
    ) -> Self {
        self.group_concurrency = Some(Arc::new(f));
        self
    }

    /// Finish the action with a typed handler.
    ///
    /// The input shape must describe a JSON object. The output shape is
    /// validated on completion when it describes an object; otherwise the
    /// handler's serialised return value is stored as-is.
    pub fn handler<I, O, F, Fut>(self, f: F) -> Result<Action<V>, DuronError>
    where
        I: Serialize + DeserializeOwned + JsonSchema + Send + 'static,
        O: Serialize + DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(ActionContext<V>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, anyhow::Error>> + Send + 'static,
    {
        let input = SchemaCodec::of::<I>();
        if !input.describes_object() {
            return Err(DuronError::InvalidAction {
                action: self.name,
                message: "input schema must describe an object".to_string(),
            });
        }
        let output = {
            let codec = SchemaCodec::of::<O>();
            codec.describes_object().then_some(codec)
        };

        let checksum = action_checksum(&self.name, self.version.as_deref());
        let f = Arc::new(f);
        let handler: ErasedHandler<V> = Arc::new(move |ctx: ActionContext<V>| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let input: I = serde_json::from_value(ctx.input.clone()).map_err(|e| {
                    anyhow::Error::new(ValidationError::new(format!("input: {e}")))
                })?;
                let output = f(ctx, input).await?;
                serde_json::to_value(output)
                    .map_err(|e| anyhow::Error::new(ValidationError::new(format!("output: {e}"))))
            })
        });

        Ok(Action {
            name: self.name,
            version: self.version,
            checksum,
            expire: self.expire,
            steps: self.steps,
            group_key: self.group_key,
            group_concurrency: self.group_concurrency,
            input,
            output,
            handler,
        })
    }
}

/// SHA-256 over the action identity.
pub(crate) fn action_checksum(name: &str, version: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(version.unwrap_or("").as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ============================================================================
// Handler context
// ============================================================================

/// Context passed to an action handler for one job run.
pub struct ActionContext<V> {
    pub job_id: Uuid,
    pub group_key: String,
    /// The validated, coerced input as stored on the job.
    pub input: serde_json::Value,
    /// The caller-supplied variable bag.
    pub var: V,
    pub(crate) steps: Arc<StepManager>,
    pub(crate) signal: CancellationToken,
}

impl<V> ActionContext<V> {
    /// The run's cancellation signal; fires on `cancel_job` and on job
    /// timeout. Long computations between steps should observe it.
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    /// Run a named step with the action's default step options.
    ///
    /// Steps are the unit of resumability: a step that completed in a
    /// previous run of the same job replays its stored output without
    /// invoking the callback. Names must be stable per logical step and
    /// unique within a run.
    pub async fn step<T, F, Fut>(&self, name: &str, f: F) -> Result<T, anyhow::Error>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(StepContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send,
    {
        self.steps.run_step(name, StepOptions::default(), f).await
    }

    /// Run a named step with per-call timeout/retry overrides.
    pub async fn step_with<T, F, Fut>(
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
        self.steps.run_step(name, options, f).await
    }
}

impl<V: Clone> Clone for ActionContext<V> {
    fn clone(&self) -> Self {
        Self {
            job_id: self.job_id,
            group_key: self.group_key.clone(),
            input: self.input.clone(),
            var: self.var.clone(),
            steps: Arc::clone(&self.steps),
            signal: self.signal.clone(),
        }
    }
}
