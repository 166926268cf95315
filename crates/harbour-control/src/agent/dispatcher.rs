//! Agent job dispatcher and reconciler.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ControlError, ControlResult, EntityKind};
use crate::records::AgentJobRecord;
use crate::registry::CapacityRegistry;
use crate::store::ControlStore;
use crate::types::{AgentJobId, JobStatus, JobTarget, JobType, TargetKind};

use super::{AgentClient, AgentError, DeliveryRequest, JobOutcome, RemoteStatus};

/// Stored in place of secret payload values.
pub const REDACTED: &str = "********";

/// Receives delivery and completion events for jobs of one target kind.
#[async_trait]
pub trait JobCompletionHandler: Send + Sync {
    /// The agent accepted the job.
    async fn job_delivered(&self, job: &AgentJobRecord) -> ControlResult<()>;

    /// The job reached its final outcome.
    async fn job_completed(&self, job: &AgentJobRecord, outcome: &JobOutcome)
        -> ControlResult<()>;
}

/// A job to submit.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Job ID, generated up front so the owner can claim its entity first.
    pub id: AgentJobId,
    /// Remote operation.
    pub job_type: JobType,
    /// Hostname of the server or proxy server that runs the job.
    pub host: String,
    /// Agent endpoint path.
    pub path: String,
    /// HTTP method.
    pub method: String,
    /// Job payload.
    pub payload: serde_json::Value,
    /// Payload fields delivered to the agent but never stored.
    pub secrets: serde_json::Map<String, serde_json::Value>,
    /// Named file blobs.
    pub files: BTreeMap<String, String>,
    /// Entity whose transition the job gates.
    pub target: JobTarget,
}

impl JobRequest {
    /// Create a `POST` request with an empty payload.
    pub fn new(
        job_type: JobType,
        target: JobTarget,
        host: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: AgentJobId::generate(),
            job_type,
            host: host.into(),
            path: path.into(),
            method: "POST".to_owned(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
            secrets: serde_json::Map::new(),
            files: BTreeMap::new(),
            target,
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Add a secret payload field.
    #[must_use]
    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    /// Attach a named file.
    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }

    /// Set the HTTP method.
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Payload as stored: secret fields replaced by [`REDACTED`].
    fn stored_payload(&self) -> serde_json::Value {
        let mut payload = self.payload.clone();
        if let serde_json::Value::Object(ref mut map) = payload {
            for key in self.secrets.keys() {
                map.insert(key.clone(), serde_json::Value::String(REDACTED.to_owned()));
            }
        }
        payload
    }
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Job ID.
    pub id: AgentJobId,
    /// Status after the first delivery attempt.
    pub status: JobStatus,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Open jobs examined.
    pub checked: usize,
    /// Undelivered jobs accepted on this pass.
    pub delivered: usize,
    /// Jobs that reached success or failure.
    pub finished: usize,
    /// Jobs that passed their deadline.
    pub timed_out: usize,
}

/// Records agent jobs, delivers them and tracks their outcomes.
pub struct JobDispatcher {
    store: Arc<dyn ControlStore>,
    registry: Arc<CapacityRegistry>,
    client: Arc<dyn AgentClient>,
    job_timeout: Duration,
    poll_interval: Duration,
    handlers: RwLock<HashMap<TargetKind, Weak<dyn JobCompletionHandler>>>,
    secrets: Mutex<HashMap<AgentJobId, serde_json::Map<String, serde_json::Value>>>,
}

impl JobDispatcher {
    /// Create a new dispatcher.
    pub fn new(
        store: Arc<dyn ControlStore>,
        registry: Arc<CapacityRegistry>,
        client: Arc<dyn AgentClient>,
        job_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            client,
            job_timeout,
            poll_interval,
            handlers: RwLock::new(HashMap::new()),
            secrets: Mutex::new(HashMap::new()),
        }
    }

    /// Register the completion handler for a target kind.
    ///
    /// Only a weak reference is kept; the owner keeps the handler alive.
    pub fn register_handler<H>(&self, kind: TargetKind, handler: &Arc<H>) -> ControlResult<()>
    where
        H: JobCompletionHandler + 'static,
    {
        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn JobCompletionHandler> = weak;
        self.handlers
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?
            .insert(kind, weak);
        Ok(())
    }

    fn handler_for(&self, kind: TargetKind) -> Option<Arc<dyn JobCompletionHandler>> {
        self.handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(&kind).and_then(Weak::upgrade))
    }

    /// Record a job and attempt its first delivery.
    ///
    /// Never waits for the remote operation. A rejected job is failed
    /// immediately; an unreachable agent leaves the job undelivered for the
    /// reconciler to retry.
    pub async fn submit(&self, request: JobRequest) -> ControlResult<JobHandle> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.job_timeout)
            .map_err(|e| ControlError::Config(format!("job timeout out of range: {e}")))?;

        let record = AgentJobRecord {
            id: request.id.clone(),
            job_type: request.job_type,
            host: request.host.clone(),
            path: request.path.clone(),
            method: request.method.clone(),
            payload: request.stored_payload(),
            files: request.files.clone(),
            target: request.target.clone(),
            remote_id: None,
            status: JobStatus::Undelivered,
            attempts: 0,
            error: None,
            output: None,
            deadline: now + timeout,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_job(&record).await?;

        info!(
            job_id = %record.id,
            job_type = %record.job_type,
            host = %record.host,
            target = %record.target,
            "agent job submitted"
        );

        let delivered = match self.hold_secrets(&record.id, request.secrets) {
            Ok(()) => self.deliver(&record).await,
            Err(e) => Err(e),
        };
        let status = match delivered {
            Ok(status) => status,
            Err(e) => {
                self.abandon(&record.id, &e).await;
                return Err(e);
            }
        };
        Ok(JobHandle {
            id: record.id,
            status,
        })
    }

    fn hold_secrets(
        &self,
        id: &AgentJobId,
        secrets: serde_json::Map<String, serde_json::Value>,
    ) -> ControlResult<()> {
        if !secrets.is_empty() {
            self.secrets
                .lock()
                .map_err(|_| ControlError::internal("lock poisoned"))?
                .insert(id.clone(), secrets);
        }
        Ok(())
    }

    /// Close a job whose submission failed part way.
    ///
    /// The caller reports the error to the owner, so no handler runs. The
    /// job is failed so the reconciler never delivers it later.
    async fn abandon(&self, id: &AgentJobId, cause: &ControlError) {
        if let Ok(mut secrets) = self.secrets.lock() {
            secrets.remove(id);
        }
        let reason = format!("submission failed: {cause}");
        match self
            .store
            .finish_job(id, JobStatus::Failure, None, Some(&reason))
            .await
        {
            Ok(true) => warn!(job_id = %id, error = %cause, "agent job abandoned"),
            Ok(false) => {}
            Err(e) => error!(job_id = %id, error = %e, "failed to abandon agent job"),
        }
    }

    /// Attempt delivery of an undelivered job, returning its new status.
    async fn deliver(&self, job: &AgentJobRecord) -> ControlResult<JobStatus> {
        let address = match self.registry.agent_address(&job.host).await {
            Ok(address) => address,
            Err(ControlError::NotFound { .. }) => {
                let outcome = JobOutcome::Undeliverable(format!("unknown agent host: {}", job.host));
                self.complete(job, outcome).await?;
                return Ok(JobStatus::Failure);
            }
            Err(e) => return Err(e),
        };

        let Some(data) = self.delivery_payload(job)? else {
            let outcome = JobOutcome::Undeliverable(
                "secret payload fields were lost before delivery".to_owned(),
            );
            self.complete(job, outcome).await?;
            return Ok(JobStatus::Failure);
        };

        let request = DeliveryRequest {
            job_id: job.id.clone(),
            job_type: job.job_type,
            address,
            path: job.path.clone(),
            method: job.method.clone(),
            data,
            files: job.files.clone(),
        };

        match self.client.submit(&request).await {
            Ok(remote_id) => {
                self.registry.record_reachability(&job.host, true).await?;
                if !self.store.mark_job_delivered(&job.id, &remote_id).await? {
                    debug!(job_id = %job.id, "job already left undelivered state");
                    return self.current_status(&job.id).await;
                }

                info!(job_id = %job.id, remote_id = %remote_id, "agent job delivered");
                let delivered = self.load(&job.id).await?;
                if let Some(handler) = self.handler_for(job.target.kind()) {
                    if let Err(e) = handler.job_delivered(&delivered).await {
                        error!(job_id = %job.id, error = %e, "delivery handler failed");
                    }
                }
                Ok(JobStatus::Delivered)
            }
            Err(AgentError::Rejected(reason)) => {
                warn!(job_id = %job.id, reason = %reason, "agent rejected job");
                let outcome = JobOutcome::Undeliverable(AgentError::Rejected(reason).to_string());
                self.complete(job, outcome).await?;
                Ok(JobStatus::Failure)
            }
            Err(e) => {
                warn!(job_id = %job.id, host = %job.host, error = %e, "agent job not delivered");
                self.registry.record_reachability(&job.host, false).await?;
                self.store.record_job_attempt(&job.id, &e.to_string()).await?;
                Ok(JobStatus::Undelivered)
            }
        }
    }

    /// The payload handed to the agent, secrets restored.
    ///
    /// `None` when the stored payload carries redacted fields whose values
    /// are no longer held, as after a restart.
    fn delivery_payload(&self, job: &AgentJobRecord) -> ControlResult<Option<serde_json::Value>> {
        let secrets = self
            .secrets
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let mut data = job.payload.clone();
        if let serde_json::Value::Object(ref mut map) = data {
            let held = secrets.get(&job.id);
            for (key, value) in map.iter_mut() {
                if value.as_str() != Some(REDACTED) {
                    continue;
                }
                match held.and_then(|s| s.get(key)) {
                    Some(secret) => *value = secret.clone(),
                    None => return Ok(None),
                }
            }
        }
        Ok(Some(data))
    }

    /// Record a job's final outcome and notify its owner.
    ///
    /// Returns false when the job already had an outcome.
    async fn complete(&self, job: &AgentJobRecord, outcome: JobOutcome) -> ControlResult<bool> {
        let (output, error) = match outcome {
            JobOutcome::Success(ref output) => (output.as_ref(), None),
            JobOutcome::Failure(ref msg) | JobOutcome::Undeliverable(ref msg) => {
                (None, Some(msg.as_str()))
            }
            JobOutcome::Timeout => (None, Some("no outcome before the job deadline")),
        };

        if !self
            .store
            .finish_job(&job.id, outcome.status(), output, error)
            .await?
        {
            warn!(job_id = %job.id, status = %outcome.status(), "ignoring outcome for finished job");
            return Ok(false);
        }

        if let Ok(mut secrets) = self.secrets.lock() {
            secrets.remove(&job.id);
        }

        match outcome {
            JobOutcome::Success(_) => {
                info!(job_id = %job.id, job_type = %job.job_type, "agent job succeeded");
            }
            JobOutcome::Failure(ref msg) => {
                error!(job_id = %job.id, job_type = %job.job_type, error = %msg, "agent job failed");
            }
            JobOutcome::Undeliverable(ref msg) => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    error = %msg,
                    "agent job undeliverable"
                );
            }
            JobOutcome::Timeout => {
                error!(job_id = %job.id, job_type = %job.job_type, "agent job timed out");
            }
        }

        let finished = self.load(&job.id).await?;
        match self.handler_for(job.target.kind()) {
            Some(handler) => {
                if let Err(e) = handler.job_completed(&finished, &outcome).await {
                    error!(job_id = %job.id, error = %e, "completion handler failed");
                }
            }
            None => warn!(
                job_id = %job.id,
                target = %job.target,
                "no completion handler registered"
            ),
        }

        Ok(true)
    }

    async fn load(&self, id: &AgentJobId) -> ControlResult<AgentJobRecord> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| ControlError::not_found(EntityKind::AgentJob, id))
    }

    async fn current_status(&self, id: &AgentJobId) -> ControlResult<JobStatus> {
        Ok(self.load(id).await?.status)
    }

    /// Get a job.
    pub async fn job(&self, id: &AgentJobId) -> ControlResult<AgentJobRecord> {
        self.load(id).await
    }

    /// Record an outcome pushed by an agent.
    ///
    /// Returns false when the job already had an outcome; late callbacks
    /// are ignored.
    pub async fn record_outcome(
        &self,
        id: &AgentJobId,
        status: RemoteStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> ControlResult<bool> {
        let job = self.load(id).await?;

        let outcome = match status {
            RemoteStatus::Success => JobOutcome::Success(output),
            RemoteStatus::Failure => {
                JobOutcome::Failure(error.unwrap_or_else(|| "agent reported failure".to_owned()))
            }
            RemoteStatus::Pending | RemoteStatus::Running => {
                return Err(ControlError::validation(
                    "callback must carry a final status",
                ))
            }
        };

        if job.status.is_terminal() {
            warn!(job_id = %id, status = %job.status, "ignoring callback for finished job");
            return Ok(false);
        }

        self.complete(&job, outcome).await
    }

    /// Run one reconciliation pass over every open job.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> ControlResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for job in self.store.list_open_jobs().await? {
            report.checked += 1;

            if now >= job.deadline {
                if self.complete(&job, JobOutcome::Timeout).await? {
                    report.timed_out += 1;
                }
                continue;
            }

            match job.status {
                JobStatus::Undelivered => match self.deliver(&job).await? {
                    JobStatus::Delivered => report.delivered += 1,
                    JobStatus::Failure => report.finished += 1,
                    _ => {}
                },
                JobStatus::Delivered => {
                    if self.poll(&job).await? {
                        report.finished += 1;
                    }
                }
                _ => {}
            }
        }

        if report.checked > 0 {
            debug!(
                checked = report.checked,
                delivered = report.delivered,
                finished = report.finished,
                timed_out = report.timed_out,
                "reconciliation pass complete"
            );
        }

        Ok(report)
    }

    /// Ask the agent about a delivered job. Returns true if it finished.
    async fn poll(&self, job: &AgentJobRecord) -> ControlResult<bool> {
        let Some(ref remote_id) = job.remote_id else {
            return Ok(false);
        };

        let address = self.registry.agent_address(&job.host).await?;
        let remote = match self.client.query_status(&address, remote_id).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "job status query failed");
                return Ok(false);
            }
        };

        let outcome = match remote.status {
            RemoteStatus::Success => JobOutcome::Success(remote.output),
            RemoteStatus::Failure => JobOutcome::Failure(
                remote
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_owned()),
            ),
            RemoteStatus::Pending | RemoteStatus::Running => return Ok(false),
        };

        self.complete(job, outcome).await
    }

    /// Run the reconciler until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval = ?self.poll_interval, "job reconciler started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_at(Utc::now()).await {
                        error!(error = %e, "reconciliation pass failed");
                    }
                }
            }
        }

        info!("job reconciler stopped");
    }
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("job_timeout", &self.job_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
