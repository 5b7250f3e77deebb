//! Metrics module for the ABR orchestrator
//!
//! Provides the job, system and counter metrics served on `/metrics`,
//! with JSON serialization support.

use crate::jobs::{now_ms, JobInfo};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub job_id: String,
    pub source_key: String,
    pub state: String,
    pub pid: Option<u32>,
    pub uptime_secs: u64,
    pub renditions: usize,
    pub last_error: Option<String>,
}

impl JobMetrics {
    pub fn from_info(info: &JobInfo, now_ms: u64) -> Self {
        Self {
            job_id: info.job_id.clone(),
            source_key: info.source_key.clone(),
            state: info.state.as_str().to_string(),
            pid: info.pid,
            uptime_secs: info
                .started_at_ms
                .map(|started| now_ms.saturating_sub(started) / 1000)
                .unwrap_or(0),
            renditions: info.renditions.len(),
            last_error: info.last_error.clone(),
        }
    }
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Lifetime counters, updated lock-free by the Job Manager and Reconciler
#[derive(Debug, Default)]
pub struct Counters {
    pub jobs_started: AtomicU64,
    pub jobs_stopped: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub spawn_failures: AtomicU64,
    pub poll_cycles: AtomicU64,
    pub poll_failures: AtomicU64,
    pub sources_seen: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_stopped: self.jobs_stopped.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            spawn_failures: self.spawn_failures.load(Ordering::Relaxed),
            poll_cycles: self.poll_cycles.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            sources_seen: self.sources_seen.load(Ordering::Relaxed),
        }
    }
}

pub type SharedCounters = Arc<Counters>;

/// Point-in-time copy of [`Counters`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub jobs_started: u64,
    pub jobs_stopped: u64,
    pub jobs_failed: u64,
    pub spawn_failures: u64,
    pub poll_cycles: u64,
    pub poll_failures: u64,
    /// Sources reported as publishing by the last successful poll
    pub sources_seen: u64,
}

/// Complete metrics snapshot including jobs, system and counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub active_jobs: usize,
    pub counters: CounterSnapshot,
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Build a snapshot from the current job table, counters and system state
pub fn build_snapshot(jobs: &[JobInfo], counters: &Counters, system: SystemMetrics) -> MetricsSnapshot {
    let now = now_ms();
    MetricsSnapshot {
        timestamp_unix_ms: now as i64,
        jobs: jobs.iter().map(|info| JobMetrics::from_info(info, now)).collect(),
        system,
        active_jobs: jobs.iter().filter(|info| info.state.is_active()).count(),
        counters: counters.snapshot(),
    }
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
