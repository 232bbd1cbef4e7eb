use crate::config::ScenarioConfig;
use crate::engine::executor::{CONTROL_TICK, ExecutorState, finish_run, run_token};
use crate::engine::metrics::MetricsEngine;
use crate::engine::scheduler::VuScheduler;
use crate::error::Result;
use crate::types::Phase;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Closed model with a total iteration quota shared by the whole VU fleet.
/// The run ends when the quota is consumed, the duration bound elapses, or
/// the context fires.
pub struct SharedIterationsExecutor {
    scenario: Arc<ScenarioConfig>,
    state: ExecutorState,
    quota: u64,
}

impl SharedIterationsExecutor {
    pub fn new(scenario: Arc<ScenarioConfig>) -> Result<Self> {
        let quota = scenario.iterations.max(1);
        let state = ExecutorState::new(scenario.duration, scenario.graceful_stop);
        Ok(Self {
            scenario,
            state,
            quota,
        })
    }

    pub(crate) fn state(&self) -> &ExecutorState {
        &self.state
    }

    /// Iteration-based progress: completed over quota.
    pub fn progress(&self) -> f64 {
        if self.state.is_finished() {
            return 1.0;
        }
        (self.state.iterations() as f64 / self.quota as f64).min(1.0)
    }

    pub async fn run(
        &self,
        ctx: &CancellationToken,
        scheduler: Arc<VuScheduler>,
        metrics: Arc<MetricsEngine>,
    ) -> Result<()> {
        self.state.mark_started();
        let token = run_token(&self.state, ctx);

        metrics.set_phase(Phase::Steady);
        self.state.set_target_vus(self.scenario.vus);

        tracing::info!(
            vus = self.scenario.vus,
            iterations = self.quota,
            "shared-iterations executor starting"
        );

        let claimed = Arc::new(AtomicU64::new(0));
        let mut workers = Vec::with_capacity(self.scenario.vus as usize);
        for _ in 0..self.scenario.vus {
            let vu = scheduler.spawn_vu()?;
            let scheduler = scheduler.clone();
            let token = token.clone();
            let claimed = claimed.clone();
            let pacing = self.scenario.pacing.clone();
            let quota = self.quota;
            workers.push(tokio::spawn(async move {
                loop {
                    if token.is_cancelled() || vu.state().is_stopping_or_stopped() {
                        break;
                    }
                    if claimed.fetch_add(1, Ordering::SeqCst) >= quota {
                        break;
                    }
                    match vu.run_iteration(&token).await {
                        Ok(()) => scheduler.add_iteration(),
                        Err(_) => break,
                    }
                    let delay = pacing.delay();
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => break,
                        }
                    }
                }
                vu.mark_stopped();
            }));
        }
        metrics.set_active_vus(scheduler.active_vu_count());

        drive_workers(&self.state, &scheduler, &metrics, &token, self.scenario.duration, workers)
            .await;

        tracing::info!(
            iterations = scheduler.iterations(),
            "shared-iterations executor finished"
        );
        finish_run(&self.state, &scheduler, &metrics, self.scenario.graceful_stop).await;
        Ok(())
    }
}

/// Closed model where every VU performs exactly `iterations` iterations,
/// bounded by the scenario duration.
pub struct PerVuIterationsExecutor {
    scenario: Arc<ScenarioConfig>,
    state: ExecutorState,
    per_vu: u64,
}

impl PerVuIterationsExecutor {
    pub fn new(scenario: Arc<ScenarioConfig>) -> Result<Self> {
        let per_vu = scenario.iterations.max(1);
        let state = ExecutorState::new(scenario.duration, scenario.graceful_stop);
        Ok(Self {
            scenario,
            state,
            per_vu,
        })
    }

    pub(crate) fn state(&self) -> &ExecutorState {
        &self.state
    }

    pub fn progress(&self) -> f64 {
        if self.state.is_finished() {
            return 1.0;
        }
        let total = self.per_vu * self.scenario.vus as u64;
        (self.state.iterations() as f64 / total as f64).min(1.0)
    }

    pub async fn run(
        &self,
        ctx: &CancellationToken,
        scheduler: Arc<VuScheduler>,
        metrics: Arc<MetricsEngine>,
    ) -> Result<()> {
        self.state.mark_started();
        let token = run_token(&self.state, ctx);

        metrics.set_phase(Phase::Steady);
        self.state.set_target_vus(self.scenario.vus);

        tracing::info!(
            vus = self.scenario.vus,
            iterations_per_vu = self.per_vu,
            "per-vu-iterations executor starting"
        );

        let mut workers = Vec::with_capacity(self.scenario.vus as usize);
        for _ in 0..self.scenario.vus {
            let vu = scheduler.spawn_vu()?;
            let scheduler = scheduler.clone();
            let token = token.clone();
            let pacing = self.scenario.pacing.clone();
            let per_vu = self.per_vu;
            workers.push(tokio::spawn(async move {
                for _ in 0..per_vu {
                    if token.is_cancelled() || vu.state().is_stopping_or_stopped() {
                        break;
                    }
                    match vu.run_iteration(&token).await {
                        Ok(()) => scheduler.add_iteration(),
                        Err(_) => break,
                    }
                    let delay = pacing.delay();
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => break,
                        }
                    }
                }
                vu.mark_stopped();
            }));
        }
        metrics.set_active_vus(scheduler.active_vu_count());

        drive_workers(&self.state, &scheduler, &metrics, &token, self.scenario.duration, workers)
            .await;

        tracing::info!(
            iterations = scheduler.iterations(),
            "per-vu-iterations executor finished"
        );
        finish_run(&self.state, &scheduler, &metrics, self.scenario.graceful_stop).await;
        Ok(())
    }
}

/// Wait for the worker fleet, bounded by the max duration and cancellation,
/// refreshing gauges on every control tick.
async fn drive_workers(
    state: &ExecutorState,
    scheduler: &VuScheduler,
    metrics: &MetricsEngine,
    token: &CancellationToken,
    max_duration: std::time::Duration,
    workers: Vec<tokio::task::JoinHandle<()>>,
) {
    let deadline = tokio::time::Instant::now() + max_duration;
    let mut join_all = Box::pin(async move {
        for worker in workers {
            let _ = worker.await;
        }
    });
    let mut tick = tokio::time::interval(CONTROL_TICK);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = &mut join_all => break,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::info!("max duration reached before the iteration quota");
                break;
            }
            _ = token.cancelled() => break,
            _ = tick.tick() => {
                let active = scheduler.active_vu_count();
                state.set_active_vus(active);
                state.set_iterations(scheduler.iterations());
                metrics.set_active_vus(active);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorKind, GlobalSettings, RequestConfig};
    use crate::engine::metrics::MetricsConfig;
    use std::time::Duration;

    fn scenario(kind: ExecutorKind, vus: u32, iterations: u64) -> Arc<ScenarioConfig> {
        Arc::new(ScenarioConfig {
            executor: kind,
            vus,
            iterations,
            duration: Duration::from_secs(10),
            graceful_stop: Duration::from_secs(2),
            requests: vec![RequestConfig {
                name: "step".to_string(),
                url: "http://127.0.0.1:9/".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn shared_quota_is_consumed_exactly_once() {
        let scenario = scenario(ExecutorKind::SharedIterations, 3, 10);
        let metrics = MetricsEngine::new(MetricsConfig::default());
        let scheduler = Arc::new(
            VuScheduler::new(
                scenario.clone(),
                Arc::new(GlobalSettings::default()),
                metrics.clone(),
            )
            .unwrap(),
        );

        let executor = SharedIterationsExecutor::new(scenario).unwrap();
        executor
            .run(&CancellationToken::new(), scheduler.clone(), metrics.clone())
            .await
            .unwrap();

        assert_eq!(scheduler.iterations(), 10);
        assert_eq!(metrics.total_requests(), 10);
        assert_eq!(executor.progress(), 1.0);
    }

    #[tokio::test]
    async fn per_vu_quota_multiplies_by_fleet_size() {
        let scenario = scenario(ExecutorKind::PerVuIterations, 2, 3);
        let metrics = MetricsEngine::new(MetricsConfig::default());
        let scheduler = Arc::new(
            VuScheduler::new(
                scenario.clone(),
                Arc::new(GlobalSettings::default()),
                metrics.clone(),
            )
            .unwrap(),
        );

        let executor = PerVuIterationsExecutor::new(scenario).unwrap();
        executor
            .run(&CancellationToken::new(), scheduler.clone(), metrics.clone())
            .await
            .unwrap();

        assert_eq!(scheduler.iterations(), 6);
        assert_eq!(metrics.total_requests(), 6);
    }
}
