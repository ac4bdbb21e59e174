use std::{fmt, sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{JobProcessor, LeaseSettings, WorkerSettings};
use crate::{
    error::CaptureError,
    limiter::{Admission, StartLimiter},
    queue::{
        DequeueRequest, JobId, JobLease, JobQueue, JobState, LeaseRenewal,
        STALLED_FAILURE_REASON,
    },
    results::{ResultRecord, ResultStore},
};

struct Shared {
    queue: Arc<dyn JobQueue>,
    results: Arc<dyn ResultStore>,
    limiter: Arc<dyn StartLimiter>,
    processor: JobProcessor,
    settings: WorkerSettings,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    shutdown_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("settings", &self.shared.settings)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        results: Arc<dyn ResultStore>,
        limiter: Arc<dyn StartLimiter>,
        processor: JobProcessor,
        settings: WorkerSettings,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                results,
                limiter,
                processor,
                settings,
            }),
            shutdown_token,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker loops and the stalled-job housekeeper.
    pub async fn start(&self) {
        let group = format!("worker-{}", std::process::id());
        let concurrency = self.shared.settings.concurrency.max(1);
        info!(concurrency, "starting capture workers");

        let mut handles = self.handles.lock().await;
        for i in 0..concurrency {
            let worker_id = format!("{group}-w{i}");
            let shared = Arc::clone(&self.shared);
            let shutdown = self.shutdown_token.clone();
            handles.push(tokio::spawn(worker_loop(shared, worker_id, shutdown)));
        }
        handles.push(tokio::spawn(housekeeper_loop(
            Arc::clone(&self.shared),
            self.shutdown_token.clone(),
        )));
    }

    /// Stops taking new jobs and waits for in-flight ones to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of capture workers");
        self.shutdown_token.cancel();
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("worker task ended abnormally: {err}");
            }
        }
    }
}

async fn idle(shutdown: &CancellationToken, delay: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: String, shutdown: CancellationToken) {
    let poll = shared.settings.poll_interval;
    let lease_ttl = chrono::Duration::from_std(shared.settings.lease.lock_duration)
        .unwrap_or_else(|_| chrono::Duration::seconds(120));

    loop {
        if shutdown.is_cancelled() {
            info!("Worker {} shutting down", worker_id);
            break;
        }

        let permit = match shared.limiter.acquire().await {
            Ok(Admission::Granted(permit)) => permit,
            Ok(Admission::Delayed(wait)) => {
                trace!(worker = %worker_id, ?wait, "start limit reached");
                idle(&shutdown, wait).await;
                continue;
            }
            Err(err) => {
                warn!(worker = %worker_id, "start limiter unavailable: {err}");
                idle(&shutdown, poll).await;
                continue;
            }
        };

        let dequeue = DequeueRequest {
            worker_id: worker_id.clone(),
            lease_ttl,
        };
        match shared.queue.dequeue(dequeue).await {
            Ok(Some(lease)) => {
                debug!(
                    worker = %worker_id,
                    job = %lease.job_id(),
                    attempt = lease.job.attempts,
                    "job claimed"
                );
                run_job(&shared, lease).await;
            }
            Ok(None) => {
                let _ = shared.limiter.release(permit).await;
                idle(&shutdown, poll).await;
            }
            Err(err) => {
                let _ = shared.limiter.release(permit).await;
                error!(worker = %worker_id, "dequeue error: {err}");
                idle(&shutdown, poll).await;
            }
        }
    }
}

/// Signals between a running job and its lease renewer.
#[derive(Clone, Debug, Default)]
struct LeaseSignals {
    /// Set by the job once processing is over.
    finished: CancellationToken,
    /// Set by the renewer once the lease can no longer be trusted.
    lost: CancellationToken,
}

/// Keeps a lease alive until the job finishes. Cancels `signals.lost` when
/// the queue reports the lease gone, or when renewals keep failing until
/// the last confirmed expiry is within the guard.
fn spawn_renewer(
    queue: Arc<dyn JobQueue>,
    lease: &JobLease,
    settings: LeaseSettings,
    signals: LeaseSignals,
) -> JoinHandle<()> {
    let job_id = lease.job_id().clone();
    let lease_id = lease.lease_id;
    let worker_id = lease.lease_owner.clone();
    let extend_by = chrono::Duration::from_std(settings.lock_duration)
        .unwrap_or_else(|_| chrono::Duration::seconds(120));
    let guard = settings.expiry_guard();
    let mut confirmed_expiry = lease.expires_at;
    let mut failing = false;

    tokio::spawn(async move {
        loop {
            let remaining = (confirmed_expiry - chrono::Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if remaining <= guard {
                warn!(job = %job_id, "lease expiring without renewal, abandoning job");
                signals.lost.cancel();
                break;
            }
            let usable = remaining - guard;
            let sleep_dur = if failing {
                (usable / 2).max(Duration::from_millis(5))
            } else {
                settings.renew_delay(remaining)
            }
            .min(usable);

            tokio::select! {
                _ = tokio::time::sleep(sleep_dur) => {},
                _ = signals.finished.cancelled() => break,
            }

            match queue
                .renew(LeaseRenewal {
                    job_id: job_id.clone(),
                    lease_id,
                    worker_id: worker_id.clone(),
                    extend_by,
                })
                .await
            {
                Ok(updated) => {
                    confirmed_expiry = updated.expires_at;
                    failing = false;
                    trace!(job = %job_id, renewals = updated.renewals, "lease renewed");
                }
                Err(CaptureError::NotFound(_) | CaptureError::LockLost(_)) => {
                    warn!(job = %job_id, "lease lost while processing");
                    signals.lost.cancel();
                    break;
                }
                Err(err) => {
                    warn!(job = %job_id, "lease renew failed: {err}");
                    failing = true;
                }
            }
        }
    })
}

async fn run_job(shared: &Arc<Shared>, lease: JobLease) {
    let job_id = lease.job_id().clone();
    let lease_id = lease.lease_id;
    let signals = LeaseSignals::default();

    let renewer = spawn_renewer(
        Arc::clone(&shared.queue),
        &lease,
        shared.settings.lease,
        signals.clone(),
    );

    // Runs as its own task so a panic fails the job instead of the worker.
    let work = tokio::spawn({
        let shared = Arc::clone(shared);
        let lost = signals.lost.clone();
        async move { shared.processor.process(&lease.job, &lost).await }
    });
    let joined = work.await;

    signals.finished.cancel();
    if let Err(err) = renewer.await {
        warn!(job = %job_id, "lease renewer ended abnormally: {err}");
    }

    if signals.lost.is_cancelled() {
        warn!(job = %job_id, "lease lost, outcome discarded");
        return;
    }

    let outcome = joined.unwrap_or_else(|err| {
        error!(job = %job_id, "capture task ended abnormally: {err}");
        Err(CaptureError::CaptureEngine("capture task crashed".into()))
    });

    match outcome {
        Ok(record) => {
            match shared.queue.complete(&job_id, lease_id, &record).await {
                Ok(()) => {
                    record_result(shared, &job_id, &record).await;
                    info!(job = %job_id, source = ?record.source, "job completed");
                }
                Err(CaptureError::NotFound(_) | CaptureError::LockLost(_)) => {
                    warn!(job = %job_id, "lease lost before completion, result discarded");
                }
                Err(err) => warn!(job = %job_id, "queue complete error: {err}"),
            }
        }
        Err(err) => {
            let message = err.public_message();
            match shared
                .queue
                .fail(&job_id, lease_id, &message, err.is_retryable())
                .await
            {
                Ok(JobState::Failed) => {
                    warn!(job = %job_id, "job failed: {err}");
                    record_result(shared, &job_id, &ResultRecord::error(message)).await;
                }
                Ok(state) => {
                    info!(job = %job_id, %state, "job will be retried: {err}");
                }
                Err(queue_err) => {
                    error!(job = %job_id, "queue fail error: {queue_err}");
                }
            }
        }
    }
}

async fn record_result(shared: &Shared, job_id: &JobId, record: &ResultRecord) {
    if let Err(err) = shared
        .results
        .put(job_id, record, shared.settings.result_ttl)
        .await
    {
        error!(job = %job_id, "failed to write result record: {err}");
    }
}

async fn housekeeper_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let interval = shared.settings.stalled_interval;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Housekeeper shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                match shared.queue.scan_stalled().await {
                    Ok(scan) => {
                        for id in &scan.recovered {
                            info!(job = %id, "stalled job returned to queue");
                        }
                        for id in &scan.failed {
                            record_result(
                                &shared,
                                id,
                                &ResultRecord::error(STALLED_FAILURE_REASON),
                            )
                            .await;
                        }
                    }
                    Err(err) => warn!("housekeeper scan_stalled error: {err}"),
                }
            }
        }
    }
}
