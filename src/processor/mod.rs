//! Background delivery: one driver loop running inbound and outbound cycles
//! against the durable queue.

pub mod inbound;
pub mod outbound;

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::Notify;

use crate::config::{Config, ProcessorConfig, RetentionConfig};
use crate::db::{QueueMessage, QueueStore};
use crate::error::QueueResult;
use crate::handlers::InboundRouter;
use crate::metrics::{Outcome, QueueMetrics};
use crate::transport::Transport;

pub use inbound::InboundProcessor;
pub use outbound::OutboundProcessor;

/// Run a blocking store call off the async runtime.
pub(crate) async fn blocking<T, F>(store: &Arc<QueueStore>, f: F) -> Result<T>
where
    F: FnOnce(&QueueStore) -> QueueResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    let value = tokio::task::spawn_blocking(move || f(&store))
        .await
        .context("Queue store task panicked")??;
    Ok(value)
}

/// `mark_failed` plus bookkeeping. Reports whether the row went back to
/// PENDING or ended FAILED, judged from the snapshot taken at dequeue.
pub(crate) async fn record_failure(
    store: &Arc<QueueStore>,
    metrics: &QueueMetrics,
    message: &QueueMessage,
    reason: &str,
    retry: bool,
) -> Result<Outcome> {
    let id = message.message_id.clone();
    let error = reason.to_string();
    if !blocking(store, move |s| s.mark_failed(&id, Some(&error), retry)).await? {
        tracing::debug!("Message {} no longer pending, failure not recorded", message.message_id);
        return Ok(Outcome::Skipped);
    }

    let outcome = if retry && message.retry_count + 1 < message.max_retries {
        Outcome::Retried
    } else {
        Outcome::Failed
    };
    metrics.record(message.direction, outcome);
    Ok(outcome)
}

/// What one cycle did, for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub expired: usize,
    pub stuck_reset: usize,
    pub purged: usize,
    pub completed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unacknowledged: usize,
    pub cleaned: usize,
}

impl CycleReport {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Sent => self.sent += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Purged => self.purged += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

impl AddAssign for CycleReport {
    fn add_assign(&mut self, other: Self) {
        self.expired += other.expired;
        self.stuck_reset += other.stuck_reset;
        self.purged += other.purged;
        self.completed += other.completed;
        self.sent += other.sent;
        self.retried += other.retried;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.unacknowledged += other.unacknowledged;
        self.cleaned += other.cleaned;
    }
}

// ── Driver ──────────────────────────────────────────────────────

const STOPPED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;

/// Returns the driver to STOPPED when the run loop ends, including when the
/// `start` future is dropped mid-cycle.
struct StopOnDrop<'a>(&'a AtomicU8);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(STOPPED, Ordering::Release);
        tracing::info!("Message processor stopped");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Stopped,
    Running,
    /// Stop requested; the in-flight cycle is finishing.
    Stopping,
}

/// Owns the background loop. Share it behind an `Arc`: one task awaits
/// [`MessageProcessor::start`], anything else may call [`MessageProcessor::stop`].
pub struct MessageProcessor {
    store: Arc<QueueStore>,
    inbound: InboundProcessor,
    outbound: OutboundProcessor,
    config: ProcessorConfig,
    retention: RetentionConfig,
    metrics: QueueMetrics,
    state: AtomicU8,
    wake: Notify,
    last_cleanup: Mutex<Option<Instant>>,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<QueueStore>,
        router: Arc<dyn InboundRouter>,
        transport: Arc<dyn Transport>,
        config: &Config,
        metrics: QueueMetrics,
    ) -> Self {
        Self {
            inbound: InboundProcessor::new(
                store.clone(),
                router,
                config.processor.clone(),
                config.retention.inbound_expiry_secs,
                metrics.clone(),
            ),
            outbound: OutboundProcessor::new(
                store.clone(),
                transport,
                config.processor.clone(),
                metrics.clone(),
            ),
            store,
            config: config.processor.clone(),
            retention: config.retention.clone(),
            metrics,
            state: AtomicU8::new(STOPPED),
            wake: Notify::new(),
            last_cleanup: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ProcessorState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => ProcessorState::Running,
            STOPPING => ProcessorState::Stopping,
            _ => ProcessorState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessorState::Running
    }

    pub fn inbound(&self) -> &InboundProcessor {
        &self.inbound
    }

    pub fn outbound(&self) -> &OutboundProcessor {
        &self.outbound
    }

    /// Run cycles until [`stop`](Self::stop) is called. Returns `false`
    /// immediately, without starting a second loop, unless the processor was STOPPED.
    pub async fn start(&self) -> bool {
        if self
            .state
            .compare_exchange(STOPPED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Message processor already running, start ignored");
            return false;
        }
        let _stopped = StopOnDrop(&self.state);

        let interval = self.config.cycle_interval();
        tracing::info!("Message processor started (interval {}ms)", interval.as_millis());

        while self.state.load(Ordering::Acquire) == RUNNING {
            let started = Instant::now();
            let result = self.run_cycle().await;
            self.metrics
                .observe_cycle(started.elapsed().as_secs_f64(), result.is_err());

            match result {
                Ok(report) if !report.is_idle() => tracing::debug!("Cycle finished: {report:?}"),
                Ok(_) => {}
                Err(e) => tracing::error!("Message processing cycle failed: {e:#}"),
            }

            if self.state.load(Ordering::Acquire) != RUNNING {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = self.wake.notified() => {},
            }
        }
        true
    }

    /// Ask the loop to exit after the current cycle. Returns `false` if it
    /// was not running.
    pub fn stop(&self) -> bool {
        let requested = self
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if requested {
            tracing::info!("Message processor stopping");
            self.wake.notify_one();
        }
        requested
    }

    /// One full cycle: inbound, outbound, ack timeouts, retention, gauges.
    ///
    /// A failing phase does not skip the ones after it; the first error is
    /// returned once all phases have run.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let mut first_error: Option<anyhow::Error> = None;

        match self.inbound.process_pending_messages().await {
            Ok(r) => report += r,
            Err(e) => {
                first_error.get_or_insert(e.context("inbound phase failed"));
            }
        }
        match self.outbound.process_outbound_messages().await {
            Ok(r) => report += r,
            Err(e) => {
                first_error.get_or_insert(e.context("outbound phase failed"));
            }
        }

        let timeout = self.config.unacknowledged_timeout_secs;
        match blocking(&self.store, move |s| s.retry_unacknowledged_messages(timeout)).await {
            Ok(n) => report.unacknowledged = n,
            Err(e) => {
                first_error.get_or_insert(e.context("ack timeout phase failed"));
            }
        }

        if self.cleanup_due() {
            let days = self.retention.cleanup_after_days;
            let keep_failed = self.retention.keep_failed;
            match blocking(&self.store, move |s| s.cleanup_old_messages(days, keep_failed)).await {
                Ok(n) => {
                    report.cleaned = n;
                    self.metrics.record_purged(n);
                }
                Err(e) => {
                    first_error.get_or_insert(e.context("cleanup phase failed"));
                }
            }
        }

        match blocking(&self.store, |s| s.get_queue_stats(None, None)).await {
            Ok(stats) => self.metrics.set_depth(&stats),
            Err(e) => tracing::warn!("Failed to refresh queue depth: {e:#}"),
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn cleanup_due(&self) -> bool {
        let every = Duration::from_secs(self.retention.cleanup_interval_secs);
        let mut last = self.last_cleanup.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if at.elapsed() < every => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}
