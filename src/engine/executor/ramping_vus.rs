use crate::config::ScenarioConfig;
use crate::engine::executor::{
    CONTROL_TICK, ExecutorState, finish_run, interpolate, run_token, stage_at, stage_phase,
};
use crate::engine::metrics::MetricsEngine;
use crate::engine::scheduler::VuScheduler;
use crate::error::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Closed model with stages: every control tick the VU pool is scaled to a
/// linear interpolation between the previous stage's target and the current
/// one's.
pub struct RampingVusExecutor {
    scenario: Arc<ScenarioConfig>,
    state: ExecutorState,
}

impl RampingVusExecutor {
    pub fn new(scenario: Arc<ScenarioConfig>) -> Result<Self> {
        let state = ExecutorState::new(scenario.total_duration(), scenario.graceful_stop);
        Ok(Self { scenario, state })
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
        let started = Instant::now();

        tracing::info!(
            stages = self.scenario.stages.len(),
            total = ?total,
            "ramping-vus executor starting"
        );

        let mut tick = tokio::time::interval(CONTROL_TICK);
        tick.tick().await;
        loop {
            let elapsed = started.elapsed();
            if elapsed >= total || token.is_cancelled() {
                break;
            }

            if let Some(point) = stage_at(&self.scenario.stages, elapsed) {
                let target =
                    interpolate(point.prev_target, point.stage.target, point.frac).round();
                let target = target.max(0.0) as u32;

                scheduler.scale_vus(target, &mut |vu| {
                    let scheduler = scheduler.clone();
                    let token = token.clone();
                    let pacing = self.scenario.pacing.clone();
                    tokio::spawn(async move {
                        scheduler.run_vu(&token, vu, &pacing).await;
                    });
                })?;

                metrics.set_phase(stage_phase(point.prev_target, point.stage.target));
                self.state.set_stage(point.index, point.stage.name.clone());
                self.state.set_target_vus(target);
            }

            let active = scheduler.active_vu_count();
            self.state.set_active_vus(active);
            self.state.set_iterations(scheduler.iterations());
            metrics.set_active_vus(active);

            tokio::select! {
                _ = tick.tick() => {}
                _ = token.cancelled() => break,
            }
        }

        tracing::info!(
            iterations = scheduler.iterations(),
            "ramping-vus executor finished"
        );
        finish_run(&self.state, &scheduler, &metrics, self.scenario.graceful_stop).await;
        Ok(())
    }
}
