//! Request counters and response-time samples.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use crate::llm::EngineStatus;

/// Number of response-time samples kept for the average.
pub const RESPONSE_TIME_SAMPLES: usize = 100;

pub struct MetricsCollector {
    started: Instant,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    active_tasks: AtomicU64,
    /// Seconds
    response_times: Mutex<VecDeque<f64>>,
}

/// Point-in-time view served by `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub server_status: &'static str,
    pub uptime_seconds: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub active_tasks: u64,
    pub average_response_time_ms: f64,
    pub success_rate: f64,
    pub llm_status: BTreeMap<String, EngineStatus>,
    pub queue_length: usize,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            active_tasks: AtomicU64::new(0),
            response_times: Mutex::new(VecDeque::with_capacity(RESPONSE_TIME_SAMPLES)),
        }
    }

    pub fn increment_total_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_successful_requests(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed_requests(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        self.active_tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Never drops below zero.
    pub fn task_finished(&self) {
        let _ = self
            .active_tasks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn add_response_time(&self, seconds: f64) {
        if !seconds.is_finite() || seconds < 0.0 {
            return;
        }
        let mut samples = match self.response_times.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if samples.len() == RESPONSE_TIME_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(seconds);
    }

    pub fn active_tasks(&self) -> u64 {
        self.active_tasks.load(Ordering::Relaxed)
    }

    pub fn snapshot(
        &self,
        llm_status: BTreeMap<String, EngineStatus>,
        queue_length: usize,
    ) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let average = {
            let samples = match self.response_times.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<f64>() / samples.len() as f64
            }
        };

        MetricsSnapshot {
            server_status: "online",
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            total_requests: total,
            successful_requests: successful,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            active_tasks: self.active_tasks(),
            average_response_time_ms: average * 1000.0,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            llm_status,
            queue_length,
        }
    }
}

/// Seconds since the Unix epoch, as carried in `start_time`.
pub fn epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
