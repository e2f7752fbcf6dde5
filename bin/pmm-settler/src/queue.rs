//! Durable-queue seam between asynchronous settlement stages.
//!
//! The contract the orchestrators rely on is small: at-least-once delivery,
//! optional per-job delay, and caller-controlled dedup ids. Any broker with
//! those semantics can implement `JobQueue`; `MemoryJobQueue` is the
//! in-process implementation used by the daemon and the tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use settler_models::QueueName;
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("No worker registered for queue {}", queue.as_str()))]
    QueueNotRegistered { queue: QueueName },

    #[snafu(display("Worker channel closed for queue {}", queue.as_str()))]
    ChannelClosed { queue: QueueName },
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Default)]
pub struct EnqueueOpts {
    /// Hold the job back for this long before it becomes visible to the
    /// worker.
    pub delay: Option<Duration>,
    /// Dedup key: while a job with this id is pending, further enqueues with
    /// the same id are dropped.
    pub job_id: Option<String>,
}

impl EnqueueOpts {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn with_job_id(job_id: String) -> Self {
        Self {
            job_id: Some(job_id),
            ..Default::default()
        }
    }
}

/// What a stage handler decided about a job. The worker loop owns the
/// requeue/drop/escalate policy; handlers never throw to signal control flow.
#[derive(Debug)]
pub enum StageOutcome {
    Done,
    /// Job is irrelevant (wrong owner, stale state, expired). Dropped.
    Skip { reason: String },
    /// Transient failure: requeue this payload after `delay`.
    Retry {
        payload: serde_json::Value,
        delay: Duration,
    },
    /// Unrecoverable for this job; surfaced for operator intervention.
    Fatal { reason: String },
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn queue(&self) -> QueueName;
    async fn handle(&self, payload: serde_json::Value) -> StageOutcome;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        opts: EnqueueOpts,
    ) -> Result<()>;
}

struct Job {
    payload: serde_json::Value,
    job_id: Option<String>,
}

/// In-process queue: one unbounded channel and one sequential worker per
/// queue name, delayed jobs parked on a timer task.
pub struct MemoryJobQueue {
    senders: DashMap<QueueName, mpsc::UnboundedSender<Job>>,
    pending_job_ids: DashMap<String, ()>,
}

impl MemoryJobQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: DashMap::new(),
            pending_job_ids: DashMap::new(),
        })
    }

    /// Spawn the worker loop for `handler`'s queue. Must be called once per
    /// queue before anything is enqueued to it.
    pub fn register_worker(
        self: &Arc<Self>,
        handler: Arc<dyn JobHandler>,
        join_set: &mut JoinSet<crate::Result<()>>,
    ) {
        let queue = handler.queue();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        self.senders.insert(queue, tx);

        let this = Arc::clone(self);
        join_set.spawn(async move {
            info!(queue = queue.as_str(), "queue worker started");
            while let Some(job) = rx.recv().await {
                // The job is no longer pending once we start processing it;
                // a redelivery enqueued from here on is a fresh job.
                if let Some(job_id) = &job.job_id {
                    this.pending_job_ids.remove(job_id);
                }

                let outcome = handler.handle(job.payload).await;
                match outcome {
                    StageOutcome::Done => {
                        counter!("settler_jobs_done", "queue" => queue.as_str()).increment(1);
                    }
                    StageOutcome::Skip { reason } => {
                        debug!(queue = queue.as_str(), reason, "job skipped");
                        counter!("settler_jobs_skipped", "queue" => queue.as_str()).increment(1);
                    }
                    StageOutcome::Retry { payload, delay } => {
                        warn!(queue = queue.as_str(), ?delay, "job scheduled for retry");
                        counter!("settler_jobs_retried", "queue" => queue.as_str()).increment(1);
                        if let Err(e) = this
                            .enqueue(queue, payload, EnqueueOpts::delayed(delay))
                            .await
                        {
                            error!(queue = queue.as_str(), error = %e, "failed to requeue job");
                        }
                    }
                    StageOutcome::Fatal { reason } => {
                        error!(queue = queue.as_str(), reason, "job failed fatally");
                        counter!("settler_jobs_fatal", "queue" => queue.as_str()).increment(1);
                    }
                }
            }
            info!(queue = queue.as_str(), "queue worker stopped");
            Ok(())
        });
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        opts: EnqueueOpts,
    ) -> Result<()> {
        if let Some(job_id) = &opts.job_id {
            if self
                .pending_job_ids
                .insert(job_id.clone(), ())
                .is_some()
            {
                debug!(queue = queue.as_str(), job_id, "duplicate job id, dropping enqueue");
                return Ok(());
            }
        }

        let sender = self
            .senders
            .get(&queue)
            .map(|s| s.clone())
            .ok_or(QueueError::QueueNotRegistered { queue })?;

        let job = Job {
            payload,
            job_id: opts.job_id,
        };

        match opts.delay {
            Some(delay) if !delay.is_zero() => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // Receiver gone means the process is shutting down.
                    let _ = sender.send(job);
                });
                Ok(())
            }
            _ => sender
                .send(job)
                .map_err(|_| QueueError::ChannelClosed { queue }),
        }
    }
}
