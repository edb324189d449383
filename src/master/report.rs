//! End-of-batch summary.
//!
//! Emitted by the dispatcher every time the completed counter catches up with
//! the received counter: how work spread across the workers, how far the
//! spread sits from an even split, and how long the whole batch took.

use chrono::{DateTime, Utc};
use log::info;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerShare {
    pub label: String,
    pub assigned: u64,
    pub share_pct: f64,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub completed: u64,
    pub shares: Vec<WorkerShare>,
    /// Even split every worker would get, in percent.
    pub ideal_share_pct: f64,
    /// Largest absolute distance of any worker's share from the even split.
    pub balancing_deviation_pct: f64,
    /// First job received to last result handled.
    pub wall_clock: Option<chrono::Duration>,
    pub mean_latency: Option<Duration>,
}

impl BatchReport {
    pub fn build(
        completed: u64,
        assigned_per_worker: Vec<(String, u64)>,
        first_job_at: Option<DateTime<Utc>>,
        last_event_at: Option<DateTime<Utc>>,
        job_latencies: &[Duration],
    ) -> Self {
        let total_assigned: u64 = assigned_per_worker.iter().map(|(_, n)| n).sum();
        let worker_count = assigned_per_worker.len();
        let ideal_share_pct = if worker_count > 0 {
            100.0 / worker_count as f64
        } else {
            0.0
        };

        let shares: Vec<WorkerShare> = assigned_per_worker
            .into_iter()
            .map(|(label, assigned)| WorkerShare {
                label,
                assigned,
                share_pct: if total_assigned > 0 {
                    assigned as f64 * 100.0 / total_assigned as f64
                } else {
                    0.0
                },
            })
            .collect();

        let balancing_deviation_pct = shares
            .iter()
            .map(|s| (s.share_pct - ideal_share_pct).abs())
            .fold(0.0, f64::max);

        let wall_clock = match (first_job_at, last_event_at) {
            (Some(first), Some(last)) => Some(last - first),
            _ => None,
        };

        let mean_latency = if job_latencies.is_empty() {
            None
        } else {
            Some(job_latencies.iter().sum::<Duration>() / job_latencies.len() as u32)
        };

        Self {
            completed,
            shares,
            ideal_share_pct,
            balancing_deviation_pct,
            wall_clock,
            mean_latency,
        }
    }

    pub fn log(&self) {
        info!("📊 ===== BATCH COMPLETE: {} job(s) =====", self.completed);
        for share in &self.shares {
            info!(
                "📊   {} handled {} job(s) ({:.1}%)",
                share.label, share.assigned, share.share_pct
            );
        }
        info!(
            "📊   Balancing deviation: {:.1}% (ideal share {:.1}%)",
            self.balancing_deviation_pct, self.ideal_share_pct
        );
        if let Some(span) = self.wall_clock {
            info!(
                "📊   Wall clock: {:.3}s",
                span.num_milliseconds() as f64 / 1000.0
            );
        }
        if let Some(latency) = self.mean_latency {
            info!("📊   Mean per-job latency: {:.3}s", latency.as_secs_f64());
        }
    }
}
