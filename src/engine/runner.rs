use crate::config::{GlobalSettings, ScenarioConfig, TestConfig};
use crate::engine::executor::Executor;
use crate::engine::metrics::{MetricsConfig, MetricsEngine, new_histogram, stats_from};
use crate::engine::scheduler::VuScheduler;
use crate::engine::thresholds::evaluate_thresholds;
use crate::error::Result;
use crate::types::{MetricsSnapshot, Phase, ScenarioResult, TestResult, TimeBucket};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Composes scenarios into a test run: one scheduler, executor, and metrics
/// engine per scenario, an aggregated snapshot across them, and threshold
/// evaluation at the end.
///
/// Construction is the single place configuration errors surface; `run`
/// itself always yields a `TestResult`, partial when cancelled.
#[derive(Debug)]
pub struct Engine {
    config: Arc<TestConfig>,
    settings: Arc<GlobalSettings>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(mut config: TestConfig) -> Result<Self> {
        config.validate()?;
        let settings = Arc::new(config.settings.clone());
        Ok(Self {
            config: Arc::new(config),
            settings,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancelling this token stops every scenario; the engine returns the
    /// partial result collected so far.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self) -> TestResult {
        let started_at = Utc::now();
        let started = Instant::now();
        tracing::info!(
            name = %self.config.name,
            scenarios = self.config.scenarios.len(),
            sequential = self.config.options.sequential,
            "test starting"
        );

        let mut runs: Vec<(ScenarioResult, Arc<MetricsEngine>)> = Vec::new();
        let mut engine_error: Option<String> = None;

        if self.config.options.sequential {
            for (name, scenario) in &self.config.scenarios {
                runs.push(
                    run_scenario(
                        name.clone(),
                        Arc::new(scenario.clone()),
                        self.settings.clone(),
                        self.cancel.clone(),
                    )
                    .await,
                );
            }
        } else {
            let mut handles = Vec::new();
            for (name, scenario) in &self.config.scenarios {
                handles.push(tokio::spawn(run_scenario(
                    name.clone(),
                    Arc::new(scenario.clone()),
                    self.settings.clone(),
                    self.cancel.clone(),
                )));
            }
            for handle in handles {
                match handle.await {
                    Ok(run) => runs.push(run),
                    Err(err) => {
                        tracing::error!(error = %err, "scenario task failed");
                        engine_error = Some(format!("scenario task failed: {err}"));
                    }
                }
            }
        }

        let duration = started.elapsed();
        let metrics = aggregate_snapshot(&runs, started_at, duration);

        let mut time_series: Vec<TimeBucket> = runs
            .iter()
            .flat_map(|(_, engine)| engine.time_series())
            .collect();
        time_series.sort_by_key(|bucket| bucket.timestamp);

        let thresholds = evaluate_thresholds(&self.config.thresholds, &metrics);
        let scenario_error = runs
            .iter()
            .find_map(|(result, _)| result.error.clone());
        let passed = thresholds.iter().all(|t| t.passed)
            && scenario_error.is_none()
            && engine_error.is_none();

        tracing::info!(
            total_requests = metrics.total_requests,
            error_rate = metrics.error_rate,
            passed,
            "test finished"
        );

        TestResult {
            name: self.config.name.clone(),
            description: self.config.description.clone(),
            started_at,
            ended_at: Utc::now(),
            duration,
            scenarios: runs.into_iter().map(|(result, _)| result).collect(),
            metrics,
            time_series,
            thresholds,
            passed,
            error: engine_error.or(scenario_error),
        }
    }
}

async fn run_scenario(
    name: String,
    scenario: Arc<ScenarioConfig>,
    settings: Arc<GlobalSettings>,
    cancel: CancellationToken,
) -> (ScenarioResult, Arc<MetricsEngine>) {
    let started = Instant::now();
    let metrics = MetricsEngine::new(MetricsConfig::default());
    metrics.start();

    let mut error = None;
    let mut iterations = 0;
    let mut active_vus = 0;

    match VuScheduler::new(scenario.clone(), settings, metrics.clone()) {
        Ok(scheduler) => {
            let scheduler = Arc::new(scheduler);
            match Executor::new(scenario.clone()) {
                Ok(executor) => {
                    tracing::info!(
                        scenario = %name,
                        executor = %executor.kind(),
                        "scenario starting"
                    );
                    if let Err(err) = executor
                        .run(&cancel, scheduler.clone(), metrics.clone())
                        .await
                        && !err.is_graceful()
                    {
                        error = Some(err.to_string());
                    }
                }
                Err(err) => error = Some(err.to_string()),
            }
            scheduler.shutdown(scenario.graceful_stop).await;
            iterations = scheduler.iterations();
            active_vus = scheduler.active_vu_count();
        }
        Err(err) => error = Some(err.to_string()),
    }

    metrics.set_phase(Phase::Done);
    metrics.stop().await;

    if let Some(msg) = &error {
        tracing::error!(scenario = %name, error = %msg, "scenario failed");
    }

    let result = ScenarioResult {
        name,
        executor: scenario.executor,
        duration: started.elapsed(),
        iterations,
        active_vus,
        metrics: metrics.snapshot(),
        request_stats: metrics.request_stats(),
        error,
    };
    (result, metrics)
}

/// Merge the scenario engines into one snapshot: histograms via hdrhistogram
/// addition, counters by summation. A single-scenario test reports that
/// scenario's snapshot unchanged.
fn aggregate_snapshot(
    runs: &[(ScenarioResult, Arc<MetricsEngine>)],
    started_at: chrono::DateTime<Utc>,
    elapsed: Duration,
) -> MetricsSnapshot {
    if let [(_, engine)] = runs {
        return engine.snapshot();
    }

    let mut histogram = new_histogram(&MetricsConfig::default());
    let mut total_requests = 0u64;
    let mut successful = 0u64;
    let mut failed = 0u64;
    let mut bytes_received = 0u64;
    for (_, engine) in runs {
        engine.merge_histogram_into(&mut histogram);
        total_requests += engine.total_requests();
        successful += engine.successful();
        failed += engine.failed();
        bytes_received += engine.bytes_received();
    }

    let overall_rps = if elapsed.as_secs_f64() > 0.0 {
        total_requests as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    let error_rate = if total_requests > 0 {
        failed as f64 / total_requests as f64
    } else {
        0.0
    };

    MetricsSnapshot {
        total_requests,
        successful,
        failed,
        bytes_received,
        requests_per_sec: overall_rps,
        overall_rps,
        steady_state_rps: None,
        error_rate,
        latency: stats_from(&histogram),
        active_vus: 0,
        phase: Phase::Done,
        elapsed,
        started_at,
        taken_at: Utc::now(),
    }
}
