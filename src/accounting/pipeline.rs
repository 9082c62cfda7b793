//! Bounded queue drained by a fixed worker pool.
//!
//! Enqueue never waits: when the queue is full the task is dropped and
//! counted. Workers deduct from the ledger with bounded retries, then append
//! the usage-log record.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{AccountingSink, AccountingTask, EnqueueOutcome};
use crate::config::RuntimeConfig;
use crate::models::ModelRouter;
use crate::observability::GatewayMetrics;
use crate::quota::{DeductOutcome, Deduction, QuotaLedger};
use crate::resilience::{ExponentialBackoff, RetryConfig};
use crate::store::{UsageLogRecord, UsageLogStore};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub capacity: usize,
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 1024,
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            workers: runtime.pipeline_workers,
            capacity: runtime.queue_capacity,
            retry: RetryConfig::new(runtime.accounting_max_attempts, ExponentialBackoff::store_write()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks completed between the start of shutdown and the last worker exiting.
    pub drained: u64,
    /// Tasks left in the queue or interrupted when the grace period ran out.
    pub abandoned: u64,
}

struct Shared {
    ledger: Arc<QuotaLedger>,
    router: Arc<ModelRouter>,
    usage_log: Arc<dyn UsageLogStore>,
    metrics: Arc<GatewayMetrics>,
    retry: RetryConfig,
    rx: tokio::sync::Mutex<mpsc::Receiver<AccountingTask>>,
    processed: AtomicU64,
    interrupted: AtomicU64,
}

pub struct AccountingPipeline {
    tx: Mutex<Option<mpsc::Sender<AccountingTask>>>,
    shared: Arc<Shared>,
    tracker: TaskTracker,
    stop: CancellationToken,
    capacity: usize,
}

impl AccountingPipeline {
    /// Spawns the worker pool on the current runtime.
    pub fn start(
        config: PipelineConfig,
        ledger: Arc<QuotaLedger>,
        router: Arc<ModelRouter>,
        usage_log: Arc<dyn UsageLogStore>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let capacity = config.capacity.max(1);
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        let shared = Arc::new(Shared {
            ledger,
            router,
            usage_log,
            metrics,
            retry: config.retry,
            rx: tokio::sync::Mutex::new(rx),
            processed: AtomicU64::new(0),
            interrupted: AtomicU64::new(0),
        });
        shared.metrics.accounting_queue_capacity.set(capacity as i64);

        let tracker = TaskTracker::new();
        let stop = CancellationToken::new();
        for worker in 0..workers {
            tracker.spawn(run_worker(worker, shared.clone(), stop.clone()));
        }
        tracker.close();

        tracing::info!(workers, capacity, "Accounting pipeline started");

        Self {
            tx: Mutex::new(Some(tx)),
            shared,
            tracker,
            stop,
            capacity,
        }
    }

    pub fn enqueue(&self, task: AccountingTask) -> EnqueueOutcome {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(sender) = sender else {
            tracing::warn!(session_id = %task.session_id, "Accounting pipeline closed; task rejected");
            return EnqueueOutcome::Closed;
        };

        let metrics = &self.shared.metrics;
        match sender.try_send(task) {
            Ok(()) => {
                metrics.accounting_enqueued.inc();
                metrics
                    .accounting_queue_depth
                    .set((self.capacity - sender.capacity()) as i64);
                EnqueueOutcome::Enqueued
            }
            Err(TrySendError::Full(task)) => {
                metrics.accounting_dropped.inc();
                tracing::warn!(
                    session_id = %task.session_id,
                    user_id = %task.user_id,
                    raw_tokens = task.raw_tokens,
                    capacity = self.capacity,
                    "Accounting queue full; dropping task"
                );
                EnqueueOutcome::Dropped
            }
            Err(TrySendError::Closed(task)) => {
                tracing::warn!(session_id = %task.session_id, "Accounting pipeline closed; task rejected");
                EnqueueOutcome::Closed
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.shared.metrics
    }

    /// Stops accepting tasks and drains the queue within `grace`.
    ///
    /// Whatever is still queued or mid-flight when the grace period ends is
    /// abandoned and reported.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let before = self.shared.processed.load(Ordering::Acquire);
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let timed_out = tokio::time::timeout(grace, self.tracker.wait()).await.is_err();
        let mut abandoned = 0;
        if timed_out {
            self.stop.cancel();
            self.tracker.wait().await;
            let mut rx = self.shared.rx.lock().await;
            while rx.try_recv().is_ok() {
                abandoned += 1;
            }
            abandoned += self.shared.interrupted.load(Ordering::Acquire);
        }

        let report = ShutdownReport {
            drained: self.shared.processed.load(Ordering::Acquire) - before,
            abandoned,
        };
        self.shared.metrics.accounting_abandoned.add(abandoned);
        self.shared.metrics.accounting_queue_depth.set(0);
        tracing::info!(
            drained = report.drained,
            abandoned = report.abandoned,
            timed_out,
            "Accounting pipeline stopped"
        );
        report
    }
}

impl AccountingSink for AccountingPipeline {
    fn submit(&self, task: AccountingTask) -> EnqueueOutcome {
        self.enqueue(task)
    }
}

async fn run_worker(worker: usize, shared: Arc<Shared>, stop: CancellationToken) {
    loop {
        let next = {
            let mut rx = shared.rx.lock().await;
            let task = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                task = rx.recv() => task,
            };
            shared.metrics.accounting_queue_depth.set(rx.len() as i64);
            task
        };
        let Some(task) = next else {
            break;
        };

        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                tracing::warn!(worker, session_id = %task.session_id, "Accounting task interrupted by shutdown");
                shared.interrupted.fetch_add(1, Ordering::AcqRel);
                break;
            }
            _ = process(&shared, &task) => {
                shared.processed.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
    tracing::debug!(worker, "Accounting worker exited");
}

async fn process(shared: &Shared, task: &AccountingTask) {
    let Some(tier) = shared.router.tier(&task.tier) else {
        shared.metrics.accounting_abandoned.inc();
        tracing::error!(
            session_id = %task.session_id,
            tier = %task.tier,
            "No configuration for tier; accounting task abandoned"
        );
        return;
    };

    let plan_tokens = task.plan_tokens();
    let deduction = Deduction {
        key: task.session_id,
        user_id: task.user_id.clone(),
        pool: task.pool,
        plan_tokens,
    };

    // Charged slots summed over attempts; a retry sees earlier ones as duplicates.
    let charged = AtomicUsize::new(0);
    let outcome = {
        let (tier, deduction, charged) = (&tier, &deduction, &charged);
        shared
            .retry
            .run("quota_deduct", |_| async move {
                let result = shared.ledger.deduct(tier, deduction).await;
                let slots = match &result {
                    Ok(DeductOutcome::Applied { slots }) => *slots,
                    Ok(DeductOutcome::Duplicate) => 0,
                    Err(e) => e.applied,
                };
                charged.fetch_add(slots, Ordering::AcqRel);
                result
            })
            .await
    };
    let charged = charged.into_inner();

    match outcome {
        Ok(DeductOutcome::Applied { .. }) => {
            shared.metrics.accounting_applied.inc();
            tracing::debug!(
                session_id = %task.session_id,
                user_id = %task.user_id,
                plan_tokens,
                slots = charged,
                "Deduction applied"
            );
        }
        Ok(DeductOutcome::Duplicate) => {
            shared.metrics.accounting_duplicate.inc();
            tracing::info!(session_id = %task.session_id, "Deduction already applied; skipping");
            return;
        }
        Err(e) if charged > 0 => {
            shared.metrics.accounting_abandoned.inc();
            tracing::error!(
                session_id = %task.session_id,
                user_id = %task.user_id,
                plan_tokens,
                charged,
                error = %e,
                "Deduction only partly applied after retries; logging charged usage"
            );
        }
        Err(e) => {
            shared.metrics.accounting_abandoned.inc();
            tracing::error!(
                session_id = %task.session_id,
                user_id = %task.user_id,
                plan_tokens,
                error = %e,
                "Deduction failed after retries; abandoning"
            );
            return;
        }
    }

    let record = UsageLogRecord {
        session_id: task.session_id,
        user_id: task.user_id.clone(),
        tier: task.tier.clone(),
        endpoint: task.endpoint.clone(),
        canonical_model: task.canonical_model.clone(),
        provider: task.provider.clone(),
        raw_tokens: task.raw_tokens,
        multiplier: task.multiplier.value(),
        plan_tokens,
        outcome: task.outcome,
        recorded_at: task.finished_at,
    };
    if let Err(e) = shared
        .retry
        .run("usage_log_append", |_| shared.usage_log.append(&record))
        .await
    {
        tracing::error!(session_id = %task.session_id, error = %e, "Usage log append failed");
    }
}
