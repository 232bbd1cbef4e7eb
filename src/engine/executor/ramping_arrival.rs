use crate::config::ScenarioConfig;
use crate::engine::bucket::{LeakyBucket, MIN_RATE};
use crate::engine::executor::{
    CONTROL_TICK, ExecutorState, finish_run, interpolate, run_token, stage_at, stage_phase,
};
use crate::engine::metrics::MetricsEngine;
use crate::engine::scheduler::VuScheduler;
use crate::engine::vu::VirtualUser;
use crate::error::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// Open model with stages: the same VU pool as constant-arrival-rate, plus a
/// controller that retunes the leaky bucket every control tick.
///
/// The first stage runs at its own target rate (no implicit ramp from zero);
/// stage `i >= 1` interpolates from stage `i-1`'s target over its duration.
pub struct RampingArrivalRateExecutor {
    scenario: Arc<ScenarioConfig>,
    state: Arc<ExecutorState>,
    pre_allocated_vus: u32,
    max_vus: u32,
}

impl RampingArrivalRateExecutor {
    pub fn new(scenario: Arc<ScenarioConfig>) -> Result<Self> {
        let pre_allocated_vus = scenario.pre_allocated_vus.max(1);
        let max_vus = scenario.max_vus.max(pre_allocated_vus);
        let state = Arc::new(ExecutorState::new(
            scenario.total_duration(),
            scenario.graceful_stop,
        ));
        Ok(Self {
            scenario,
            state,
            pre_allocated_vus,
            max_vus,
        })
    }

    pub(crate) fn state(&self) -> &ExecutorState {
        &self.state
    }

    pub async fn run(
        &self,
        ctx: &CancellationToken,
        scheduler: Arc<VuScheduler>,
        metrics: Arc<MetricsEngine>,
    ) -> Result<()> {
        self.state.mark_started();
        let token = run_token(&self.state, ctx);
        let total = self.scenario.total_duration();

        let initial_rate = self
            .scenario
            .stages
            .first()
            .map(|s| s.target)
            .unwrap_or(MIN_RATE)
            .max(MIN_RATE);
        self.state.set_rates(initial_rate, initial_rate);
        self.state.set_target_vus(self.max_vus);

        tracing::info!(
            stages = self.scenario.stages.len(),
            initial_rate,
            max_vus = self.max_vus,
            total = ?total,
            "ramping-arrival-rate executor starting"
        );

        let bucket = Arc::new(LeakyBucket::new(initial_rate));
        let controller = spawn_rate_controller(
            self.scenario.stages.clone(),
            bucket.clone(),
            token.clone(),
            metrics.clone(),
            self.state.clone(),
            total,
        );

        let (pool_tx, mut pool_rx) = mpsc::channel::<Arc<VirtualUser>>(self.max_vus as usize);
        for _ in 0..self.pre_allocated_vus {
            let vu = scheduler.spawn_vu()?;
            let _ = pool_tx.try_send(vu);
        }
        let mut spawned = self.pre_allocated_vus;

        let started = Instant::now();
        while started.elapsed() < total {
            if bucket.wait(&token).await.is_err() {
                break;
            }

            let vu = match pool_rx.try_recv() {
                Ok(vu) => Some(vu),
                Err(TryRecvError::Empty) => {
                    if spawned < self.max_vus {
                        spawned += 1;
                        Some(scheduler.spawn_vu()?)
                    } else {
                        tokio::select! {
                            vu = pool_rx.recv() => vu,
                            _ = token.cancelled() => break,
                        }
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };
            let Some(vu) = vu else { break };
            if vu.state().is_stopping_or_stopped() {
                continue;
            }

            let scheduler_task = scheduler.clone();
            let token_task = token.clone();
            let pool_tx_task = pool_tx.clone();
            tokio::spawn(async move {
                if vu.run_iteration(&token_task).await.is_ok() {
                    scheduler_task.add_iteration();
                }
                // Return the VU to the pool only while it is still usable.
                if !vu.state().is_stopping_or_stopped() {
                    let _ = pool_tx_task.send(vu).await;
                }
            });

            let active = scheduler.active_vu_count();
            self.state.set_active_vus(active);
            self.state.set_iterations(scheduler.iterations());
            metrics.set_active_vus(active);
        }

        controller.abort();
        let _ = controller.await;

        tracing::info!(
            iterations = scheduler.iterations(),
            spawned,
            "ramping-arrival-rate executor finished"
        );
        finish_run(&self.state, &scheduler, &metrics, self.scenario.graceful_stop).await;
        Ok(())
    }
}

/// Every control tick, interpolate the target rate for the current stage and
/// retune the bucket.
fn spawn_rate_controller(
    stages: Vec<crate::config::StageConfig>,
    bucket: Arc<LeakyBucket>,
    token: CancellationToken,
    metrics: Arc<MetricsEngine>,
    state: Arc<ExecutorState>,
    total: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut tick = tokio::time::interval(CONTROL_TICK);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = token.cancelled() => break,
            }
            let elapsed = started.elapsed();
            if elapsed >= total {
                break;
            }
            if let Some((point, rate)) = rate_at(&stages, elapsed) {
                bucket.set_rate(rate);
                metrics.set_phase(stage_phase(point.prev_target, point.stage.target));
                state.set_stage(point.index, point.stage.name.clone());
                state.set_rates(rate, point.stage.target.max(MIN_RATE));
            }
        }
    })
}

/// Rate for an elapsed offset into the stage list. The first stage holds its
/// own target for its whole duration; later stages interpolate from the
/// previous stage's target. Always floored to [`MIN_RATE`].
fn rate_at(
    stages: &[crate::config::StageConfig],
    elapsed: Duration,
) -> Option<(crate::engine::executor::StagePoint<'_>, f64)> {
    let point = stage_at(stages, elapsed)?;
    let rate = if point.index == 0 {
        point.stage.target
    } else {
        interpolate(point.prev_target, point.stage.target, point.frac)
    };
    Some((point, rate.max(MIN_RATE)))
}
