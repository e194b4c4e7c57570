//! The outward engine object.
//!
//! A [`Client`] owns the sync loops that discover work (periodic pull,
//! push via notifications, or both), the per-action worker pools, and the
//! producer API: enqueue, cancel, retry, delete, queries and
//! `wait_for_job`. Multiple clients across processes coordinate only
//! through the store and its notification channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{Action, ActionMetadata, GroupContext};
use crate::error::{DuronError, ValidationError};
use crate::job::{
    ActionOverview, GetJobsOptions, Job, JobFilters, JobStatus, JobStep, NewJob, Pagination,
    StepStatus,
};
use crate::manager::ActionManager;
use crate::notifier::{Notification, Notifier};
use crate::store::Store;

/// Job-discovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPattern {
    /// Periodic `fetch` on a timer.
    Pull,
    /// `fetch` on every `job-available` notification.
    Push,
    /// Both loops; push cuts latency, pull guarantees convergence.
    #[default]
    Hybrid,
    /// No job discovery; the client is producer/observer only.
    Disabled,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Stable identity of this worker across the fleet; used as the job
    /// lease owner and in the liveness ping/pong topics.
    pub id: String,
    pub sync_pattern: SyncPattern,
    /// Delay between pull attempts.
    pub pull_interval: Duration,
    /// Max jobs claimed per fetch.
    pub batch_size: i64,
    /// Worker-pool size per action.
    pub action_concurrency_limit: usize,
    /// Default group admission limit when the action does not override.
    pub group_concurrency_limit: i32,
    /// Run schema migrations on `start`.
    pub migrate_on_start: bool,
    /// Run orphan recovery on `start` when actions are registered.
    pub recover_jobs_on_start: bool,
    /// Probe foreign lease holders before recovering their jobs.
    pub multi_process_mode: bool,
    /// Deadline for liveness replies.
    pub process_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: format!("client-{}", Uuid::new_v4()),
            sync_pattern: SyncPattern::default(),
            pull_interval: Duration::from_millis(5000),
            batch_size: 10,
            action_concurrency_limit: 100,
            group_concurrency_limit: 10,
            migrate_on_start: true,
            recover_jobs_on_start: true,
            multi_process_mode: false,
            process_timeout: Duration::from_millis(5000),
        }
    }
}

impl ClientConfig {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Options for [`Client::wait_for_job`].
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    pub timeout: Option<Duration>,
    pub signal: Option<CancellationToken>,
}

struct Lifecycle {
    started: bool,
    shutdown: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

struct ClientInner<V> {
    config: ClientConfig,
    store: Arc<dyn Store>,
    notifier: Notifier,
    var: V,
    actions: HashMap<String, Arc<Action<V>>>,
    managers: HashMap<String, Arc<ActionManager<V>>>,
    action_names: Vec<String>,
    waiters: Mutex<HashMap<Uuid, Vec<oneshot::Sender<Option<Job>>>>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

/// The engine's orchestration surface. Cheap to clone.
pub struct Client<V = ()> {
    inner: Arc<ClientInner<V>>,
}

impl<V> Clone for Client<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Client<()> {
    /// Builder for a client with no variable bag.
    pub fn builder(store: Arc<dyn Store>) -> ClientBuilder<()> {
        ClientBuilder::new(store, ())
    }
}

impl<V> Client<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Builder for a client whose handlers receive `var` as `ctx.var`.
    pub fn builder_with_variables(store: Arc<dyn Store>, var: V) -> ClientBuilder<V> {
        ClientBuilder::new(store, var)
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the store, optionally migrate and recover, and install the
    /// configured sync loops. Idempotent; concurrent starts serialise.
    pub async fn start(&self) -> Result<(), DuronError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.started {
            return Ok(());
        }

        self.inner.store.start().await?;
        if self.inner.config.migrate_on_start {
            self.inner.store.migrate().await?;
        }

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(liveness_responder(
            Arc::clone(&self.inner),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(waiter_listener(
            Arc::clone(&self.inner),
            shutdown.clone(),
        )));

        if !self.inner.actions.is_empty() && self.inner.config.recover_jobs_on_start {
            if let Err(e) = self.inner.recover_jobs().await {
                warn!(client_id = %self.inner.config.id, error = %e, "startup recovery failed");
            }
        }

        match self.inner.config.sync_pattern {
            SyncPattern::Pull => {
                tasks.push(tokio::spawn(pull_loop(
                    Arc::clone(&self.inner),
                    shutdown.clone(),
                )));
            }
            SyncPattern::Push => {
                tasks.push(tokio::spawn(push_loop(
                    Arc::clone(&self.inner),
                    shutdown.clone(),
                )));
            }
            SyncPattern::Hybrid => {
                tasks.push(tokio::spawn(pull_loop(
                    Arc::clone(&self.inner),
                    shutdown.clone(),
                )));
                tasks.push(tokio::spawn(push_loop(
                    Arc::clone(&self.inner),
                    shutdown.clone(),
                )));
            }
            SyncPattern::Disabled => {}
        }

        info!(
            client_id = %self.inner.config.id,
            sync_pattern = ?self.inner.config.sync_pattern,
            actions = self.inner.actions.len(),
            "client started"
        );

        lifecycle.shutdown = Some(shutdown);
        lifecycle.tasks = tasks;
        lifecycle.started = true;
        Ok(())
    }

    /// Stop sync loops, resolve pending waiters with `None`, stop every
    /// action pool (aborting and draining in-flight runs), then stop the
    /// store. Idempotent.
    pub async fn stop(&self) -> Result<(), DuronError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !lifecycle.started {
            return Ok(());
        }

        if let Some(shutdown) = lifecycle.shutdown.take() {
            shutdown.cancel();
        }
        for task in lifecycle.tasks.drain(..) {
            let _ = task.await;
        }

        self.inner.resolve_all_waiters(None);

        for manager in self.inner.managers.values() {
            manager.stop().await;
        }
        self.inner.store.stop().await?;
        lifecycle.started = false;

        info!(client_id = %self.inner.config.id, "client stopped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Producer API
    // ------------------------------------------------------------------

    /// Validate `input` against the action's schema, resolve the group
    /// key and admission limit, and insert a `created` job.
    pub async fn run_action(
        &self,
        name: &str,
        input: impl serde::Serialize,
    ) -> Result<Uuid, DuronError> {
        let action = self
            .inner
            .actions
            .get(name)
            .ok_or_else(|| DuronError::UnknownAction(name.to_string()))?;

        let raw = serde_json::to_value(input).map_err(|e| DuronError::InvalidInput {
            action: name.to_string(),
            source: ValidationError::new(e.to_string()),
        })?;
        let input = action
            .validate_input(&raw)
            .map_err(|source| DuronError::InvalidInput {
                action: name.to_string(),
                source,
            })?;

        let group_ctx = GroupContext {
            input: input.clone(),
        };
        let group_key = action.resolve_group_key(&group_ctx);
        let concurrency_limit = action
            .resolve_group_concurrency(&group_ctx)
            .unwrap_or(self.inner.config.group_concurrency_limit)
            .max(1);

        let job_id = self
            .inner
            .store
            .create_job(NewJob {
                action_name: name.to_string(),
                group_key,
                input,
                timeout_ms: action.expire().as_millis() as i64,
                checksum: action.checksum().to_string(),
                concurrency_limit,
            })
            .await?;

        debug!(client_id = %self.inner.config.id, job_id = %job_id, action = %name, "job enqueued");
        Ok(job_id)
    }

    /// Cancel a job. A job held by a local pool is aborted in place with
    /// no store round-trip for its status; otherwise the store row is
    /// cancelled directly.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool, DuronError> {
        for manager in self.inner.managers.values() {
            if manager.cancel_job(job_id) {
                return Ok(true);
            }
        }
        Ok(self.inner.store.cancel_job(job_id).await?)
    }

    /// Re-enqueue a terminal job; `None` when a non-terminal sibling
    /// already exists.
    pub async fn retry_job(&self, job_id: Uuid) -> Result<Option<Uuid>, DuronError> {
        Ok(self.inner.store.retry_job(job_id).await?)
    }

    pub async fn delete_job(&self, job_id: Uuid) -> Result<bool, DuronError> {
        Ok(self.inner.store.delete_job(job_id).await?)
    }

    pub async fn delete_jobs(&self, filters: JobFilters) -> Result<u64, DuronError> {
        Ok(self.inner.store.delete_jobs(filters).await?)
    }

    /// Recover jobs orphaned by dead workers: this client's own stale
    /// leases always, foreign leases when their owner misses the liveness
    /// deadline (or unconditionally outside multi-process mode).
    pub async fn recover_jobs(&self) -> Result<u64, DuronError> {
        self.inner.recover_jobs().await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>, DuronError> {
        Ok(self.inner.store.get_job_by_id(job_id).await?)
    }

    pub async fn get_jobs(&self, opts: GetJobsOptions) -> Result<Vec<Job>, DuronError> {
        Ok(self.inner.store.get_jobs(opts).await?)
    }

    pub async fn get_job_steps(
        &self,
        job_id: Uuid,
        pagination: Pagination,
        search: Option<&str>,
    ) -> Result<Vec<JobStep>, DuronError> {
        Ok(self.inner.store.get_job_steps(job_id, pagination, search).await?)
    }

    pub async fn get_job_step_by_id(&self, step_id: Uuid) -> Result<Option<JobStep>, DuronError> {
        Ok(self.inner.store.get_job_step_by_id(step_id).await?)
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, DuronError> {
        Ok(self.inner.store.get_job_status(job_id).await?)
    }

    pub async fn get_job_step_status(
        &self,
        step_id: Uuid,
    ) -> Result<Option<StepStatus>, DuronError> {
        Ok(self.inner.store.get_job_step_status(step_id).await?)
    }

    pub async fn get_actions(&self) -> Result<Vec<ActionOverview>, DuronError> {
        Ok(self.inner.store.get_actions().await?)
    }

    /// Registered actions with their deterministic mock inputs.
    pub fn get_actions_metadata(&self) -> Vec<ActionMetadata> {
        let mut metadata: Vec<ActionMetadata> = self
            .inner
            .actions
            .values()
            .map(|action| ActionMetadata {
                name: action.name().to_string(),
                version: action.version().map(str::to_string),
                checksum: action.checksum().to_string(),
                mock_input: action.mock_input().clone(),
            })
            .collect();
        metadata.sort_by(|a, b| a.name.cmp(&b.name));
        metadata
    }

    /// Wait until a job reaches a terminal status.
    ///
    /// Resolves immediately when the stored status is already terminal.
    /// Never fails: timeout, abort signal, or client stop resolve `None`.
    pub async fn wait_for_job(&self, job_id: Uuid, opts: WaitOptions) -> Option<Job> {
        match self.inner.store.get_job_by_id(job_id).await {
            Ok(Some(job)) if job.is_terminal() => return Some(job),
            Ok(_) => {}
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "wait_for_job lookup failed");
                return None;
            }
        }

        let (tx, rx) = oneshot::channel();
        self.inner.park_waiter(job_id, tx);

        // Close the race between the status check and parking: the job
        // may have finished in between and the notification already gone.
        if let Ok(Some(job)) = self.inner.store.get_job_by_id(job_id).await {
            if job.is_terminal() {
                self.inner.resolve_waiters(job_id, Some(job.clone()));
            }
        }

        let timeout = async {
            match opts.timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        let aborted = async {
            match &opts.signal {
                Some(signal) => signal.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = rx => result.unwrap_or(None),
            _ = timeout => None,
            _ = aborted => None,
        }
    }
}

impl<V> std::fmt::Debug for Client<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.config.id)
            .field("actions", &self.inner.action_names)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct ClientBuilder<V> {
    store: Arc<dyn Store>,
    config: ClientConfig,
    var: V,
    actions: Vec<Action<V>>,
}

impl<V> ClientBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn new(store: Arc<dyn Store>, var: V) -> Self {
        Self {
            store,
            config: ClientConfig::default(),
            var,
            actions: Vec::new(),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn action(mut self, action: Action<V>) -> Self {
        self.actions.push(action);
        self
    }

    pub fn build(self) -> Result<Client<V>, DuronError> {
        let mut actions = HashMap::new();
        for action in self.actions {
            let name = action.name().to_string();
            if actions.insert(name.clone(), Arc::new(action)).is_some() {
                return Err(DuronError::ActionAlreadyRegistered(name));
            }
        }

        let managers: HashMap<String, Arc<ActionManager<V>>> = actions
            .iter()
            .map(|(name, action)| {
                (
                    name.clone(),
                    Arc::new(ActionManager::new(
                        Arc::clone(action),
                        Arc::clone(&self.store),
                        self.var.clone(),
                        self.config.id.clone(),
                        self.config.action_concurrency_limit,
                    )),
                )
            })
            .collect();

        let mut action_names: Vec<String> = actions.keys().cloned().collect();
        action_names.sort();

        Ok(Client {
            inner: Arc::new(ClientInner {
                notifier: Notifier::new(Arc::clone(&self.store)),
                store: self.store,
                config: self.config,
                var: self.var,
                actions,
                managers,
                action_names,
                waiters: Mutex::new(HashMap::new()),
                lifecycle: tokio::sync::Mutex::new(Lifecycle {
                    started: false,
                    shutdown: None,
                    tasks: Vec::new(),
                }),
            }),
        })
    }
}

// ============================================================================
// Inner plumbing
// ============================================================================

impl<V> ClientInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn fetch_and_dispatch(&self, batch: i64) -> Result<usize, DuronError> {
        if self.action_names.is_empty() {
            return Ok(0);
        }
        let jobs = self
            .store
            .fetch(&self.config.id, batch, &self.action_names)
            .await?;
        let count = jobs.len();
        for job in jobs {
            match self.managers.get(&job.action_name) {
                Some(manager) => manager.push(job),
                None => warn!(
                    job_id = %job.id,
                    action = %job.action_name,
                    "claimed job for unregistered action"
                ),
            }
        }
        Ok(count)
    }

    async fn recover_jobs(&self) -> Result<u64, DuronError> {
        let known: Vec<String> = self
            .actions
            .values()
            .map(|a| a.checksum().to_string())
            .collect();

        let mut suspects = vec![self.config.id.clone()];
        let foreign = self.store.active_client_ids(&self.config.id).await?;

        if !foreign.is_empty() {
            if self.config.multi_process_mode {
                let responded = self.probe_liveness(&foreign).await?;
                suspects.extend(
                    foreign
                        .into_iter()
                        .filter(|cid| !responded.contains(cid)),
                );
            } else {
                suspects.extend(foreign);
            }
        }

        let count = self.store.reset_orphaned_jobs(&suspects, &known).await?;
        if count > 0 {
            info!(
                client_id = %self.config.id,
                count,
                "reset orphaned jobs to created"
            );
        }
        Ok(count)
    }

    /// Ping each foreign lease holder and collect replies until the
    /// process deadline. Non-responders are presumed dead.
    async fn probe_liveness(&self, foreign: &[String]) -> Result<HashSet<String>, DuronError> {
        let mut rx = self.store.subscribe();
        for cid in foreign {
            self.notifier.ping(cid, &self.config.id).await?;
        }

        let deadline = tokio::time::Instant::now() + self.config.process_timeout;
        let expected: HashSet<&String> = foreign.iter().collect();
        let mut responded = HashSet::new();

        while responded.len() < expected.len() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => break,
                Ok(Ok(Notification::Pong { client_id, from })) if client_id == self.config.id => {
                    if expected.contains(&from) {
                        responded.insert(from);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
            }
        }
        Ok(responded)
    }

    fn park_waiter(&self, job_id: Uuid, tx: oneshot::Sender<Option<Job>>) {
        let mut waiters = self
            .waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        waiters.entry(job_id).or_default().push(tx);
    }

    fn has_waiters(&self, job_id: Uuid) -> bool {
        let waiters = self
            .waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        waiters.contains_key(&job_id)
    }

    fn resolve_waiters(&self, job_id: Uuid, job: Option<Job>) {
        let senders = {
            let mut waiters = self
                .waiters
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            waiters.remove(&job_id)
        };
        if let Some(senders) = senders {
            for tx in senders {
                let _ = tx.send(job.clone());
            }
        }
    }

    fn resolve_all_waiters(&self, job: Option<Job>) {
        let drained: Vec<_> = {
            let mut waiters = self
                .waiters
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            waiters.drain().collect()
        };
        for (_, senders) in drained {
            for tx in senders {
                let _ = tx.send(job.clone());
            }
        }
    }
}

/// Periodic fetch; errors are logged, never fatal to the loop.
async fn pull_loop<V>(inner: Arc<ClientInner<V>>, shutdown: CancellationToken)
where
    V: Clone + Send + Sync + 'static,
{
    loop {
        match inner.fetch_and_dispatch(inner.config.batch_size).await {
            Ok(count) if count > 0 => {
                debug!(client_id = %inner.config.id, count, "pull claimed jobs");
            }
            Ok(_) => {}
            Err(e) => {
                error!(client_id = %inner.config.id, error = %e, "pull sync failed");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(inner.config.pull_interval) => {}
        }
    }
}

/// Fetch a single job whenever one is announced.
async fn push_loop<V>(inner: Arc<ClientInner<V>>, shutdown: CancellationToken)
where
    V: Clone + Send + Sync + 'static,
{
    let mut rx = inner.store.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Ok(Notification::JobAvailable { .. }) => {
                    if let Err(e) = inner.fetch_and_dispatch(1).await {
                        error!(client_id = %inner.config.id, error = %e, "push sync failed");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(client_id = %inner.config.id, skipped, "push listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Resolve parked `wait_for_job` calls when their job goes terminal.
async fn waiter_listener<V>(inner: Arc<ClientInner<V>>, shutdown: CancellationToken)
where
    V: Clone + Send + Sync + 'static,
{
    let mut rx = inner.store.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Ok(Notification::JobStatusChanged { job_id, status, .. }) if status.is_terminal() => {
                    if !inner.has_waiters(job_id) {
                        continue;
                    }
                    // One fetch resolves every parked waiter for this id.
                    let job = match inner.store.get_job_by_id(job_id).await {
                        Ok(job) => job,
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "failed to load finished job");
                            None
                        }
                    };
                    inner.resolve_waiters(job_id, job);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Answer liveness probes addressed to this client.
async fn liveness_responder<V>(inner: Arc<ClientInner<V>>, shutdown: CancellationToken)
where
    V: Clone + Send + Sync + 'static,
{
    let mut rx = inner.store.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Ok(Notification::Ping { client_id, from }) if client_id == inner.config.id => {
                    if let Err(e) = inner.notifier.pong(&from, &inner.config.id).await {
                        warn!(client_id = %inner.config.id, error = %e, "failed to answer ping");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
