//! HTTP load-generation and performance-measurement engine.
//!
//! A test is a set of named scenarios, each pairing a templated request
//! sequence with one of six load-shaping executors (closed models driving a
//! fixed or ramping VU fleet, open models pacing iterations through a leaky
//! bucket, and iteration-quota variants). Latency, throughput, and error
//! statistics aggregate in an HDR-histogram metrics engine that also emits a
//! per-interval time-series; thresholds turn the final snapshot into a
//! pass/fail verdict.
//!
//! Configuration parsing, report rendering, and CLI surfaces live in
//! consuming crates; this crate exposes the typed [`TestConfig`] input and
//! [`TestResult`] output records.

pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod template;
pub mod types;

pub use config::{
    ExecutionOptions, ExecutorKind, ExtractConfig, ExtractSource, GlobalSettings, HttpMethod,
    PacingConfig, PacingKind, RequestConfig, ScenarioConfig, StageConfig, TestConfig,
    parse_duration,
};
pub use engine::{
    Engine, Executor, LeakyBucket, MetricsConfig, MetricsEngine, TimeBucketStore, VirtualUser,
    VuScheduler, evaluate_thresholds,
};
pub use error::{Error, Result};
pub use types::{
    ExecutorStats, LatencyStats, MetricsSnapshot, Phase, PhaseChange, ScenarioResult, TestResult,
    ThresholdResult, TimeBucket, VuState,
};
