//! Prometheus metrics for the queue and the processing driver.

use anyhow::{Context, Result};
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::db::{Direction, MessageStatus, QueueStats};

/// Cycle latency buckets (seconds).
const CYCLE_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Terminal result of one processing attempt, as counted in
/// `fleetq_messages_processed_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Sent,
    Retried,
    Failed,
    Purged,
    Skipped,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Sent => "sent",
            Self::Retried => "retried",
            Self::Failed => "failed",
            Self::Purged => "purged",
            Self::Skipped => "skipped",
        }
    }
}

/// All queue metrics, registered on a private registry so several stores
/// (and tests) can coexist in one process.
#[derive(Clone)]
pub struct QueueMetrics {
    registry: Registry,
    pub messages_processed_total: CounterVec,
    pub queue_depth: IntGaugeVec,
    pub cycle_duration_seconds: Histogram,
    pub cycle_errors_total: IntCounter,
    pub purged_total: IntCounter,
}

impl QueueMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages_processed_total = CounterVec::new(
            Opts::new(
                "fleetq_messages_processed_total",
                "Processing attempts by direction and outcome",
            ),
            &["direction", "outcome"],
        )
        .context("Failed to create messages_processed_total")?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("fleetq_queue_depth", "Queue rows by status"),
            &["status"],
        )
        .context("Failed to create queue_depth")?;
        let cycle_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "fleetq_cycle_duration_seconds",
                "Duration of one processing cycle in seconds",
            )
            .buckets(CYCLE_BUCKETS.to_vec()),
        )
        .context("Failed to create cycle_duration_seconds")?;
        let cycle_errors_total = IntCounter::new(
            "fleetq_cycle_errors_total",
            "Processing cycles that ended in an error",
        )
        .context("Failed to create cycle_errors_total")?;
        let purged_total = IntCounter::new(
            "fleetq_purged_total",
            "Rows removed by host purges and retention cleanup",
        )
        .context("Failed to create purged_total")?;

        registry.register(Box::new(messages_processed_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(cycle_duration_seconds.clone()))?;
        registry.register(Box::new(cycle_errors_total.clone()))?;
        registry.register(Box::new(purged_total.clone()))?;

        Ok(Self {
            registry,
            messages_processed_total,
            queue_depth,
            cycle_duration_seconds,
            cycle_errors_total,
            purged_total,
        })
    }

    pub fn record(&self, direction: Direction, outcome: Outcome) {
        self.messages_processed_total
            .with_label_values(&[direction.as_str(), outcome.as_str()])
            .inc();
    }

    pub fn record_purged(&self, rows: usize) {
        self.purged_total.inc_by(rows as u64);
    }

    pub fn observe_cycle(&self, seconds: f64, failed: bool) {
        self.cycle_duration_seconds.observe(seconds);
        if failed {
            self.cycle_errors_total.inc();
        }
    }

    pub fn set_depth(&self, stats: &QueueStats) {
        for status in MessageStatus::ALL {
            self.queue_depth
                .with_label_values(&[status.as_str()])
                .set(stats.count(status) as i64);
        }
        self.queue_depth
            .with_label_values(&["expired"])
            .set(stats.expired as i64);
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output was not UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_with_labels() {
        let metrics = QueueMetrics::new().unwrap();
        metrics.record(Direction::Outbound, Outcome::Sent);
        metrics.record(Direction::Outbound, Outcome::Sent);
        metrics.record_purged(5);
        metrics.observe_cycle(0.02, true);

        let text = metrics.render().unwrap();
        assert!(text.contains(
            r#"fleetq_messages_processed_total{direction="outbound",outcome="sent"} 2"#
        ));
        assert!(text.contains("fleetq_purged_total 5"));
        assert!(text.contains("fleetq_cycle_errors_total 1"));
    }

    #[test]
    fn depth_tracks_stats() {
        let metrics = QueueMetrics::new().unwrap();
        let stats = QueueStats {
            pending: 3,
            failed: 1,
            expired: 2,
            total: 6,
            ..QueueStats::default()
        };
        metrics.set_depth(&stats);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"fleetq_queue_depth{status="pending"} 3"#));
        assert!(text.contains(r#"fleetq_queue_depth{status="failed"} 1"#));
        assert!(text.contains(r#"fleetq_queue_depth{status="expired"} 2"#));
    }

    #[test]
    fn instances_are_independent() {
        let a = QueueMetrics::new().unwrap();
        let b = QueueMetrics::new().unwrap();
        a.record_purged(1);
        assert!(b.render().unwrap().contains("fleetq_purged_total 0"));
    }
}
