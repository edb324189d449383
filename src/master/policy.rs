//! Worker-selection policies.
//!
//! The dispatcher materializes the free workers in registry order and asks
//! the policy to pick one. Which policy runs is fixed at deploy time through
//! the master's config file, never per request.

use serde::{Deserialize, Serialize};

use super::dispatcher::WorkerRecord;

/// The round-robin counter wraps back to zero once it exceeds this.
const ROUND_ROBIN_WRAP: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Rotate over the free workers in registry order.
    RoundRobin,
    /// Pick the free worker with the smallest average processing time.
    /// Workers that have completed nothing yet win over all tested workers.
    MinAvgTime,
}

impl SelectionPolicy {
    /// Pick one worker from `free` (registry order), or nothing.
    ///
    /// `rr_counter` is the shared round-robin cursor; it lives with the rest
    /// of the dispatch state so selection and busy-marking stay one critical
    /// section.
    pub fn pick<'a>(
        &self,
        free: &[&'a WorkerRecord],
        rr_counter: &mut u64,
    ) -> Option<&'a WorkerRecord> {
        if free.is_empty() {
            return None;
        }
        match self {
            SelectionPolicy::RoundRobin => {
                let index = (*rr_counter as usize) % free.len();
                *rr_counter += 1;
                if *rr_counter > ROUND_ROBIN_WRAP {
                    *rr_counter = 0;
                }
                Some(free[index])
            }
            SelectionPolicy::MinAvgTime => {
                let mut best = free[0];
                let mut best_time = expected_time(best);
                for &candidate in &free[1..] {
                    let time = expected_time(candidate);
                    if time < best_time {
                        best = candidate;
                        best_time = time;
                    }
                }
                Some(best)
            }
        }
    }
}

/// Untested workers sort below every measured average.
fn expected_time(worker: &WorkerRecord) -> f64 {
    if worker.stats.tasks_completed == 0 {
        f64::NEG_INFINITY
    } else {
        worker.stats.average_processing_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::messages::SlaveStatistics;
    use chrono::Utc;
    use uuid::Uuid;

    fn worker(port: u16, tasks_completed: u64, average: f64) -> WorkerRecord {
        WorkerRecord {
            id: Uuid::new_v4(),
            ip: "127.0.0.1".to_string(),
            port,
            registered_at: Utc::now(),
            stats: SlaveStatistics {
                port,
                tasks_completed,
                total_processing_time: average * tasks_completed as f64,
                average_processing_time: average,
            },
        }
    }

    #[test]
    fn test_round_robin_alternates_over_two_workers() {
        let w1 = worker(9101, 0, 0.0);
        let w2 = worker(9102, 0, 0.0);
        let free = vec![&w1, &w2];
        let mut counter = 0u64;

        let picks: Vec<u16> = (0..6)
            .map(|_| {
                SelectionPolicy::RoundRobin
                    .pick(&free, &mut counter)
                    .unwrap()
                    .port
            })
            .collect();
        assert_eq!(picks, vec![9101, 9102, 9101, 9102, 9101, 9102]);
    }

    #[test]
    fn test_round_robin_distributes_evenly() {
        let workers: Vec<WorkerRecord> = (0..4).map(|i| worker(9100 + i, 0, 0.0)).collect();
        let free: Vec<&WorkerRecord> = workers.iter().collect();
        let mut counter = 0u64;

        let mut counts = std::collections::HashMap::new();
        for _ in 0..40 {
            let picked = SelectionPolicy::RoundRobin.pick(&free, &mut counter).unwrap();
            *counts.entry(picked.port).or_insert(0u32) += 1;
        }
        for w in &workers {
            assert_eq!(counts[&w.port], 10);
        }
    }

    #[test]
    fn test_round_robin_counter_wraps() {
        let w1 = worker(9101, 0, 0.0);
        let free = vec![&w1];
        let mut counter = 1_000_000;
        SelectionPolicy::RoundRobin.pick(&free, &mut counter).unwrap();
        assert_eq!(counter, 0);
    }

    #[test]
    fn test_min_avg_prefers_untested_then_fastest() {
        let w1 = worker(9101, 1, 5.0);
        let mut w3 = worker(9103, 0, 0.0);
        let w2 = worker(9102, 1, 2.0);
        let mut counter = 0u64;

        // W3 has completed nothing, so it outranks both measured workers.
        {
            let free = vec![&w1, &w2, &w3];
            let picked = SelectionPolicy::MinAvgTime.pick(&free, &mut counter).unwrap();
            assert_eq!(picked.port, 9103);
        }

        // Once W3 has a measurement (4.0s), W2's 2.0s average wins.
        w3.stats.tasks_completed = 1;
        w3.stats.average_processing_time = 4.0;
        let free = vec![&w1, &w2, &w3];
        let picked = SelectionPolicy::MinAvgTime.pick(&free, &mut counter).unwrap();
        assert_eq!(picked.port, 9102);
    }

    #[test]
    fn test_min_avg_ties_break_by_registry_order() {
        let w1 = worker(9101, 2, 3.0);
        let w2 = worker(9102, 5, 3.0);
        let free = vec![&w1, &w2];
        let mut counter = 0u64;
        let picked = SelectionPolicy::MinAvgTime.pick(&free, &mut counter).unwrap();
        assert_eq!(picked.port, 9101);
    }

    #[test]
    fn test_empty_free_set_yields_nothing() {
        let mut counter = 7u64;
        assert!(SelectionPolicy::RoundRobin.pick(&[], &mut counter).is_none());
        assert!(SelectionPolicy::MinAvgTime.pick(&[], &mut counter).is_none());
        assert_eq!(counter, 7);
    }
}
