use crate::config::ScenarioConfig;
use crate::engine::executor::{CONTROL_TICK, ExecutorState, finish_run, run_token};
use crate::engine::metrics::MetricsEngine;
use crate::engine::scheduler::VuScheduler;
use crate::error::Result;
use crate::types::Phase;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Closed model: a fixed fleet of VUs, each looping iterations for the whole
/// duration. Iteration rate follows response time.
pub struct ConstantVusExecutor {
    scenario: Arc<ScenarioConfig>,
    state: ExecutorState,
}

impl ConstantVusExecutor {
    pub fn new(scenario: Arc<ScenarioConfig>) -> Result<Self> {
        let state = ExecutorState::new(scenario.duration, scenario.graceful_stop);
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

        metrics.set_phase(Phase::Steady);
        self.state.set_target_vus(self.scenario.vus);

        tracing::info!(
            vus = self.scenario.vus,
            duration = ?self.scenario.duration,
            "constant-vus executor starting"
        );

        scheduler.scale_vus(self.scenario.vus, &mut |vu| {
            let scheduler = scheduler.clone();
            let token = token.clone();
            let pacing = self.scenario.pacing.clone();
            tokio::spawn(async move {
                scheduler.run_vu(&token, vu, &pacing).await;
            });
        })?;
        metrics.set_active_vus(scheduler.active_vu_count());

        let deadline = tokio::time::Instant::now() + self.scenario.duration;
        let mut tick = tokio::time::interval(CONTROL_TICK);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    let active = scheduler.active_vu_count();
                    self.state.set_active_vus(active);
                    self.state.set_iterations(scheduler.iterations());
                    metrics.set_active_vus(active);
                }
            }
        }

        tracing::info!(
            iterations = scheduler.iterations(),
            "constant-vus executor finished"
        );
        finish_run(&self.state, &scheduler, &metrics, self.scenario.graceful_stop).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GlobalSettings, RequestConfig};
    use crate::engine::metrics::MetricsConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn run_spawns_vus_and_finishes_done() {
        let scenario = Arc::new(ScenarioConfig {
            vus: 2,
            duration: Duration::from_millis(150),
            graceful_stop: Duration::from_secs(2),
            requests: vec![RequestConfig {
                name: "step".to_string(),
                // Connection refused; iterations complete as failures.
                url: "http://127.0.0.1:9/".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let metrics = MetricsEngine::new(MetricsConfig::default());
        let scheduler = Arc::new(
            VuScheduler::new(
                scenario.clone(),
                Arc::new(GlobalSettings::default()),
                metrics.clone(),
            )
            .unwrap(),
        );

        let executor = ConstantVusExecutor::new(scenario).unwrap();
        executor
            .run(&CancellationToken::new(), scheduler.clone(), metrics.clone())
            .await
            .unwrap();

        assert_eq!(metrics.phase(), Phase::Done);
        assert!(scheduler.iterations() > 0);
        assert_eq!(scheduler.active_vu_count(), 0);
        assert!(executor.state().is_finished());
        assert_eq!(executor.state().time_progress(), 1.0);
    }
}
