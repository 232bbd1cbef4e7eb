mod constant_arrival;
mod constant_vus;
mod iterations;
mod ramping_arrival;
mod ramping_vus;

pub use constant_arrival::ConstantArrivalRateExecutor;
pub use constant_vus::ConstantVusExecutor;
pub use iterations::{PerVuIterationsExecutor, SharedIterationsExecutor};
pub use ramping_arrival::RampingArrivalRateExecutor;
pub use ramping_vus::RampingVusExecutor;

use crate::config::{ExecutorKind, ScenarioConfig, StageConfig};
use crate::engine::metrics::MetricsEngine;
use crate::engine::scheduler::VuScheduler;
use crate::error::Result;
use crate::types::{ExecutorStats, Phase};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Cadence of ramping control loops and gauge refreshes.
pub(crate) const CONTROL_TICK: Duration = Duration::from_millis(100);

/// Load-shaping strategy over a scenario. A tagged variant so the factory
/// can map configuration tags onto constructors while callers program
/// against one capability set.
pub enum Executor {
    ConstantVus(ConstantVusExecutor),
    RampingVus(RampingVusExecutor),
    ConstantArrivalRate(ConstantArrivalRateExecutor),
    RampingArrivalRate(RampingArrivalRateExecutor),
    SharedIterations(SharedIterationsExecutor),
    PerVuIterations(PerVuIterationsExecutor),
}

impl Executor {
    /// Factory: validate the scenario's executor configuration, apply
    /// defaults, and construct the matching variant.
    pub fn new(scenario: Arc<ScenarioConfig>) -> Result<Executor> {
        Ok(match scenario.executor {
            ExecutorKind::ConstantVus => {
                Executor::ConstantVus(ConstantVusExecutor::new(scenario)?)
            }
            ExecutorKind::RampingVus => {
                Executor::RampingVus(RampingVusExecutor::new(scenario)?)
            }
            ExecutorKind::ConstantArrivalRate => {
                Executor::ConstantArrivalRate(ConstantArrivalRateExecutor::new(scenario)?)
            }
            ExecutorKind::RampingArrivalRate => {
                Executor::RampingArrivalRate(RampingArrivalRateExecutor::new(scenario)?)
            }
            ExecutorKind::SharedIterations => {
                Executor::SharedIterations(SharedIterationsExecutor::new(scenario)?)
            }
            ExecutorKind::PerVuIterations => {
                Executor::PerVuIterations(PerVuIterationsExecutor::new(scenario)?)
            }
        })
    }

    pub fn kind(&self) -> ExecutorKind {
        match self {
            Executor::ConstantVus(_) => ExecutorKind::ConstantVus,
            Executor::RampingVus(_) => ExecutorKind::RampingVus,
            Executor::ConstantArrivalRate(_) => ExecutorKind::ConstantArrivalRate,
            Executor::RampingArrivalRate(_) => ExecutorKind::RampingArrivalRate,
            Executor::SharedIterations(_) => ExecutorKind::SharedIterations,
            Executor::PerVuIterations(_) => ExecutorKind::PerVuIterations,
        }
    }

    /// Drive the load shape until the configured duration elapses, the
    /// context is cancelled, or `stop` is invoked. Sets the metrics phase to
    /// Done on exit.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        scheduler: Arc<VuScheduler>,
        metrics: Arc<MetricsEngine>,
    ) -> Result<()> {
        match self {
            Executor::ConstantVus(e) => e.run(ctx, scheduler, metrics).await,
            Executor::RampingVus(e) => e.run(ctx, scheduler, metrics).await,
            Executor::ConstantArrivalRate(e) => e.run(ctx, scheduler, metrics).await,
            Executor::RampingArrivalRate(e) => e.run(ctx, scheduler, metrics).await,
            Executor::SharedIterations(e) => e.run(ctx, scheduler, metrics).await,
            Executor::PerVuIterations(e) => e.run(ctx, scheduler, metrics).await,
        }
    }

    /// 0.0 before the run starts, within [0, 1] while it runs, 1.0 after.
    pub fn progress(&self) -> f64 {
        match self {
            Executor::ConstantVus(e) => e.state().time_progress(),
            Executor::RampingVus(e) => e.state().time_progress(),
            Executor::ConstantArrivalRate(e) => e.state().time_progress(),
            Executor::RampingArrivalRate(e) => e.state().time_progress(),
            Executor::SharedIterations(e) => e.progress(),
            Executor::PerVuIterations(e) => e.progress(),
        }
    }

    pub fn active_vus(&self) -> u32 {
        self.state().active_vus()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.state().stats()
    }

    /// Trigger cancellation and wait for a graceful shutdown, bounded by the
    /// scenario's graceful-stop window.
    pub async fn stop(&self) {
        self.state().stop().await;
    }

    fn state(&self) -> &ExecutorState {
        match self {
            Executor::ConstantVus(e) => e.state(),
            Executor::RampingVus(e) => e.state(),
            Executor::ConstantArrivalRate(e) => e.state(),
            Executor::RampingArrivalRate(e) => e.state(),
            Executor::SharedIterations(e) => e.state(),
            Executor::PerVuIterations(e) => e.state(),
        }
    }
}

/// Runtime state common to every executor variant.
pub(crate) struct ExecutorState {
    total_duration: Duration,
    graceful_stop: Duration,
    started: Mutex<Option<(Instant, DateTime<Utc>)>>,
    iterations: AtomicU64,
    active_vus: AtomicU32,
    target_vus: AtomicU32,
    stage: Mutex<(Option<usize>, Option<String>)>,
    rates: Mutex<(f64, f64)>,
    finished: AtomicBool,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl ExecutorState {
    pub(crate) fn new(total_duration: Duration, graceful_stop: Duration) -> Self {
        Self {
            total_duration,
            graceful_stop,
            started: Mutex::new(None),
            iterations: AtomicU64::new(0),
            active_vus: AtomicU32::new(0),
            target_vus: AtomicU32::new(0),
            stage: Mutex::new((None, None)),
            rates: Mutex::new((0.0, 0.0)),
            finished: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    pub(crate) fn mark_started(&self) {
        let mut started = self.started.lock().unwrap();
        if started.is_none() {
            *started = Some((Instant::now(), Utc::now()));
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started
            .lock()
            .unwrap()
            .map(|(at, _)| at.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Time-based progress; iteration-quota executors compute their own.
    pub(crate) fn time_progress(&self) -> f64 {
        if self.finished.load(Ordering::SeqCst) {
            return 1.0;
        }
        if self.started.lock().unwrap().is_none() {
            return 0.0;
        }
        if self.total_duration.is_zero() {
            return 1.0;
        }
        (self.elapsed().as_secs_f64() / self.total_duration.as_secs_f64()).min(1.0)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub(crate) fn set_iterations(&self, n: u64) {
        self.iterations.store(n, Ordering::Relaxed);
    }

    pub(crate) fn active_vus(&self) -> u32 {
        self.active_vus.load(Ordering::Relaxed)
    }

    pub(crate) fn set_active_vus(&self, n: u32) {
        self.active_vus.store(n, Ordering::Relaxed);
    }

    pub(crate) fn set_target_vus(&self, n: u32) {
        self.target_vus.store(n, Ordering::Relaxed);
    }

    pub(crate) fn set_stage(&self, index: usize, name: Option<String>) {
        *self.stage.lock().unwrap() = (Some(index), name);
    }

    pub(crate) fn set_rates(&self, current: f64, target: f64) {
        *self.rates.lock().unwrap() = (current, target);
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark the run complete and release anyone blocked in `stop`.
    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.done.cancel();
    }

    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(self.graceful_stop, self.done.cancelled()).await;
    }

    pub(crate) fn stats(&self) -> ExecutorStats {
        let started_at = self.started.lock().unwrap().map(|(_, at)| at);
        let (stage_index, stage_name) = self.stage.lock().unwrap().clone();
        let (current_rate, target_rate) = *self.rates.lock().unwrap();
        ExecutorStats {
            started_at,
            elapsed: self.elapsed(),
            total_duration: self.total_duration,
            active_vus: self.active_vus(),
            target_vus: self.target_vus.load(Ordering::Relaxed),
            iterations: self.iterations(),
            stage_index,
            stage_name,
            current_rate,
            target_rate,
        }
    }
}

/// Derive a run-scoped token that also fires when the parent context is
/// cancelled. The forwarder exits once the run finishes.
pub(crate) fn run_token(state: &ExecutorState, ctx: &CancellationToken) -> CancellationToken {
    let token = state.cancel.child_token();
    let parent = ctx.clone();
    let child = token.clone();
    let until = state.done.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = parent.cancelled() => child.cancel(),
            _ = until.cancelled() => {}
        }
    });
    token
}

/// Common run epilogue: stop every VU, wait out the graceful window, settle
/// the gauges, and flip the phase to Done.
pub(crate) async fn finish_run(
    state: &ExecutorState,
    scheduler: &VuScheduler,
    metrics: &MetricsEngine,
    graceful_stop: Duration,
) {
    scheduler.stop_all_vus();
    let missed = scheduler.wait_for_all_vus(graceful_stop).await;
    if missed > 0 {
        tracing::warn!(missed, "vus abandoned after the graceful window");
    }
    state.set_iterations(scheduler.iterations());
    state.set_active_vus(scheduler.active_vu_count());
    metrics.set_active_vus(scheduler.active_vu_count());
    metrics.set_phase(Phase::Done);
    state.finish();
}

/// Locate the stage containing `elapsed`, with the previous stage's target
/// and the fraction of the current stage already covered.
pub(crate) struct StagePoint<'a> {
    pub index: usize,
    pub stage: &'a StageConfig,
    pub prev_target: f64,
    pub frac: f64,
}

pub(crate) fn stage_at(stages: &[StageConfig], elapsed: Duration) -> Option<StagePoint<'_>> {
    let mut offset = Duration::ZERO;
    let mut prev_target = 0.0;
    for (index, stage) in stages.iter().enumerate() {
        let end = offset + stage.duration;
        if elapsed < end {
            let frac = (elapsed - offset).as_secs_f64() / stage.duration.as_secs_f64();
            return Some(StagePoint {
                index,
                stage,
                prev_target,
                frac,
            });
        }
        prev_target = stage.target;
        offset = end;
    }
    None
}

pub(crate) fn interpolate(prev: f64, target: f64, frac: f64) -> f64 {
    prev + (target - prev) * frac.clamp(0.0, 1.0)
}

/// Phase label for a stage: rising targets ramp up, flat targets hold
/// steady, falling targets ramp down.
pub(crate) fn stage_phase(prev_target: f64, target: f64) -> Phase {
    if target > prev_target {
        Phase::RampUp
    } else if target < prev_target {
        Phase::RampDown
    } else {
        Phase::Steady
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages(specs: &[(u64, f64)]) -> Vec<StageConfig> {
        specs
            .iter()
            .map(|(secs, target)| StageConfig {
                duration: Duration::from_secs(*secs),
                target: *target,
                name: None,
            })
            .collect()
    }

    #[test]
    fn stage_at_finds_stage_and_fraction() {
        let stages = stages(&[(10, 5.0), (10, 5.0), (10, 0.0)]);
        let point = stage_at(&stages, Duration::from_secs(5)).unwrap();
        assert_eq!(point.index, 0);
        assert_eq!(point.prev_target, 0.0);
        assert!((point.frac - 0.5).abs() < 1e-9);

        let point = stage_at(&stages, Duration::from_secs(25)).unwrap();
        assert_eq!(point.index, 2);
        assert_eq!(point.prev_target, 5.0);

        assert!(stage_at(&stages, Duration::from_secs(30)).is_none());
    }

    #[test]
    fn interpolate_is_linear_and_clamped() {
        assert_eq!(interpolate(0.0, 10.0, 0.5), 5.0);
        assert_eq!(interpolate(10.0, 0.0, 0.25), 7.5);
        assert_eq!(interpolate(0.0, 10.0, 2.0), 10.0);
        assert_eq!(interpolate(0.0, 10.0, -1.0), 0.0);
    }

    #[test]
    fn stage_phase_follows_target_direction() {
        assert_eq!(stage_phase(0.0, 5.0), Phase::RampUp);
        assert_eq!(stage_phase(5.0, 5.0), Phase::Steady);
        assert_eq!(stage_phase(5.0, 0.0), Phase::RampDown);
    }

    #[test]
    fn progress_is_zero_before_start_and_one_after_finish() {
        let state = ExecutorState::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(state.time_progress(), 0.0);
        state.mark_started();
        let mid = state.time_progress();
        assert!((0.0..1.0).contains(&mid));
        state.finish();
        assert_eq!(state.time_progress(), 1.0);
    }

    #[tokio::test]
    async fn stop_returns_once_finished() {
        let state = Arc::new(ExecutorState::new(
            Duration::from_secs(10),
            Duration::from_secs(5),
        ));
        let stopper = {
            let state = state.clone();
            tokio::spawn(async move { state.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(state.cancel_token().is_cancelled());
        state.finish();
        stopper.await.unwrap();
    }

    #[test]
    fn factory_maps_every_tag() {
        use crate::config::RequestConfig;
        let base = ScenarioConfig {
            requests: vec![RequestConfig {
                url: "http://localhost/".to_string(),
                ..Default::default()
            }],
            rate: 5.0,
            iterations: 10,
            stages: stages(&[(1, 2.0)]),
            ..Default::default()
        };
        for kind in [
            ExecutorKind::ConstantVus,
            ExecutorKind::RampingVus,
            ExecutorKind::ConstantArrivalRate,
            ExecutorKind::RampingArrivalRate,
            ExecutorKind::SharedIterations,
            ExecutorKind::PerVuIterations,
        ] {
            let mut scenario = base.clone();
            scenario.executor = kind;
            let executor = Executor::new(Arc::new(scenario)).unwrap();
            assert_eq!(executor.kind(), kind);
            assert_eq!(executor.progress(), 0.0);
        }
    }
}
