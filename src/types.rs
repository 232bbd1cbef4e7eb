use crate::config::ExecutorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// High-level label for a time window within a test, used to annotate
/// time-series buckets and phase-change history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Warmup,
    RampUp,
    Steady,
    RampDown,
    Cooldown,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Warmup => "warmup",
            Phase::RampUp => "ramp_up",
            Phase::Steady => "steady",
            Phase::RampDown => "ramp_down",
            Phase::Cooldown => "cooldown",
            Phase::Done => "done",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Phase::Init => 0,
            Phase::Warmup => 1,
            Phase::RampUp => 2,
            Phase::Steady => 3,
            Phase::RampDown => 4,
            Phase::Cooldown => 5,
            Phase::Done => 6,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Init,
            1 => Phase::Warmup,
            2 => Phase::RampUp,
            3 => Phase::Steady,
            4 => Phase::RampDown,
            5 => Phase::Cooldown,
            _ => Phase::Done,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a virtual user.
///
/// Transitions are monotone along Idle↔Running → Stopping → Stopped; once
/// Stopped, no further iterations may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VuState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl VuState {
    pub(crate) fn from_u8(v: u8) -> VuState {
        match v {
            0 => VuState::Idle,
            1 => VuState::Running,
            2 => VuState::Stopping,
            _ => VuState::Stopped,
        }
    }

    /// True once a stop has been requested or completed.
    pub fn is_stopping_or_stopped(&self) -> bool {
        matches!(self, VuState::Stopping | VuState::Stopped)
    }
}

/// One entry in the metrics engine's phase-change history.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseChange {
    pub phase: Phase,
    pub at: DateTime<Utc>,
    /// Cumulative request count at the moment of the transition.
    pub total_requests: u64,
}

/// Latency distribution summary, all values in microseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub stddev_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Read-only view of the metrics engine at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub bytes_received: u64,

    /// Reported throughput: the steady-state value when one is available,
    /// otherwise the overall rate.
    pub requests_per_sec: f64,
    pub overall_rps: f64,
    pub steady_state_rps: Option<f64>,
    pub error_rate: f64,

    pub latency: LatencyStats,

    pub active_vus: u32,
    pub phase: Phase,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
    pub taken_at: DateTime<Utc>,
}

/// Snapshot emitted at one bucket-interval boundary.
#[derive(Debug, Clone, Serialize)]
pub struct TimeBucket {
    pub timestamp: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,

    // Cumulative totals at the boundary.
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub bytes_received: u64,

    // Interval-local deltas against the previous bucket.
    pub interval_requests: u64,
    pub interval_rps: f64,
    pub interval_error_rate: f64,

    // Latency percentiles for the run so far, microseconds.
    pub latency_min_us: u64,
    pub latency_max_us: u64,
    pub latency_p50_us: u64,
    pub latency_p90_us: u64,
    pub latency_p95_us: u64,
    pub latency_p99_us: u64,

    pub active_vus: u32,
    pub phase: Phase,
}

/// Read-only executor progress view exposed to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    #[serde(with = "humantime_serde")]
    pub total_duration: Duration,
    pub active_vus: u32,
    pub target_vus: u32,
    pub iterations: u64,
    pub stage_index: Option<usize>,
    pub stage_name: Option<String>,
    pub current_rate: f64,
    pub target_rate: f64,
}

/// Outcome of evaluating one threshold expression.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdResult {
    /// Metric family the expression was attached to, e.g. `http_req_duration`.
    pub metric: String,
    pub expression: String,
    pub passed: bool,
    /// Observed value rendered for display.
    pub value: String,
    pub message: Option<String>,
}

/// Per-scenario outcome inside a [`TestResult`].
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: String,
    pub executor: ExecutorKind,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub iterations: u64,
    pub active_vus: u32,
    pub metrics: MetricsSnapshot,
    pub request_stats: HashMap<String, LatencyStats>,
    pub error: Option<String>,
}

/// Final result record handed to reporting collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub scenarios: Vec<ScenarioResult>,
    /// Metrics aggregated across every scenario.
    pub metrics: MetricsSnapshot,
    pub time_series: Vec<TimeBucket>,
    pub thresholds: Vec<ThresholdResult>,
    pub passed: bool,
    pub error: Option<String>,
}
