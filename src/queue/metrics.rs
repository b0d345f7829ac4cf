//! Counters and health scoring for the write queue.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Point-in-time queue metrics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    /// Operations waiting for a worker.
    pub depth: usize,
    pub in_flight: usize,
    pub workers: usize,
    pub total_submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Submissions refused because the queue was full.
    pub rejected: u64,
    /// Transient failures that were retried.
    pub retries: u64,
    pub avg_processing_ms: f64,
    pub max_processing_ms: u64,
    pub accepting: bool,
    pub uptime_secs: u64,
}

impl QueueMetrics {
    /// Failed share of finished operations, 0 when nothing has finished.
    pub fn failure_rate(&self) -> f64 {
        let finished = self.succeeded + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.failed as f64 / finished as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    /// 0–100, higher is better.
    pub score: u8,
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub metrics: QueueMetrics,
}

/// Thresholds used by [`assess`].
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub depth_warning: usize,
    pub max_depth: usize,
}

/// Failure-rate scoring needs a minimum sample.
const MIN_FINISHED_FOR_RATE: u64 = 10;
const SLOW_OPERATION_MS: f64 = 1000.0;

/// Derive a 0–100 score and human-readable issues from a snapshot.
pub fn assess(metrics: QueueMetrics, thresholds: HealthThresholds) -> QueueHealth {
    let mut score: i32 = 100;
    let mut issues = Vec::new();

    if !metrics.accepting {
        score -= 50;
        issues.push("queue is shut down and not accepting writes".to_string());
    }

    let saturation_mark = thresholds.max_depth.saturating_mul(9) / 10;
    if thresholds.max_depth > 0 && metrics.depth >= saturation_mark.max(1) {
        score -= 40;
        issues.push(format!(
            "queue depth {} is near the limit of {}",
            metrics.depth, thresholds.max_depth
        ));
    } else if metrics.depth > thresholds.depth_warning {
        score -= 20;
        issues.push(format!(
            "queue depth {} exceeds warning threshold {}",
            metrics.depth, thresholds.depth_warning
        ));
    }

    if metrics.succeeded + metrics.failed >= MIN_FINISHED_FOR_RATE {
        let rate = metrics.failure_rate();
        if rate > 0.20 {
            score -= 40;
            issues.push(format!("failure rate {:.1}% is high", rate * 100.0));
        } else if rate > 0.05 {
            score -= 20;
            issues.push(format!("failure rate {:.1}% is elevated", rate * 100.0));
        }
    }

    if metrics.avg_processing_ms > SLOW_OPERATION_MS {
        score -= 10;
        issues.push(format!(
            "average processing time {:.0}ms is slow",
            metrics.avg_processing_ms
        ));
    }

    let score = score.clamp(0, 100) as u8;
    let status = match score {
        80..=100 => HealthStatus::Healthy,
        50..=79 => HealthStatus::Degraded,
        _ => HealthStatus::Unhealthy,
    };
    QueueHealth {
        score,
        status,
        issues,
        metrics,
    }
}

/// Running totals kept under the queue lock.
#[derive(Debug)]
pub(crate) struct Counters {
    started: Instant,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub retries: u64,
    total_processing: Duration,
    max_processing: Duration,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            submitted: 0,
            succeeded: 0,
            failed: 0,
            rejected: 0,
            retries: 0,
            total_processing: Duration::ZERO,
            max_processing: Duration::ZERO,
        }
    }

    pub fn record_finished(&mut self, elapsed: Duration, ok: bool) {
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.total_processing += elapsed;
        self.max_processing = self.max_processing.max(elapsed);
    }

    pub fn snapshot(&self, depth: usize, in_flight: usize, workers: usize, accepting: bool) -> QueueMetrics {
        let finished = self.succeeded + self.failed;
        let avg_processing_ms = if finished == 0 {
            0.0
        } else {
            self.total_processing.as_secs_f64() * 1000.0 / finished as f64
        };
        QueueMetrics {
            depth,
            in_flight,
            workers,
            total_submitted: self.submitted,
            succeeded: self.succeeded,
            failed: self.failed,
            rejected: self.rejected,
            retries: self.retries,
            avg_processing_ms,
            max_processing_ms: self.max_processing.as_millis() as u64,
            accepting,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}
