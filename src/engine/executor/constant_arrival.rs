use crate::config::ScenarioConfig;
use crate::engine::bucket::LeakyBucket;
use crate::engine::executor::{ExecutorState, finish_run, run_token};
use crate::engine::metrics::MetricsEngine;
use crate::engine::scheduler::VuScheduler;
use crate::engine::vu::VirtualUser;
use crate::error::Result;
use crate::types::Phase;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// Open model: iterations start at a fixed arrival rate regardless of
/// response time, each one running on a VU borrowed from a pool that grows
/// lazily up to `max_vus`.
pub struct ConstantArrivalRateExecutor {
    scenario: Arc<ScenarioConfig>,
    state: ExecutorState,
    pre_allocated_vus: u32,
    max_vus: u32,
}

impl ConstantArrivalRateExecutor {
    pub fn new(scenario: Arc<ScenarioConfig>) -> Result<Self> {
        let pre_allocated_vus = scenario.pre_allocated_vus.max(1);
        let max_vus = scenario.max_vus.max(pre_allocated_vus);
        let state = ExecutorState::new(scenario.duration, scenario.graceful_stop);
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

        metrics.set_phase(Phase::Steady);
        self.state.set_target_vus(self.max_vus);
        self.state.set_rates(self.scenario.rate, self.scenario.rate);

        tracing::info!(
            rate = self.scenario.rate,
            pre_allocated = self.pre_allocated_vus,
            max_vus = self.max_vus,
            duration = ?self.scenario.duration,
            "constant-arrival-rate executor starting"
        );

        let bucket = LeakyBucket::new(self.scenario.rate);
        let (pool_tx, mut pool_rx) = mpsc::channel::<Arc<VirtualUser>>(self.max_vus as usize);
        for _ in 0..self.pre_allocated_vus {
            let vu = scheduler.spawn_vu()?;
            let _ = pool_tx.try_send(vu);
        }
        let mut spawned = self.pre_allocated_vus;

        let started = Instant::now();
        while started.elapsed() < self.scenario.duration {
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

        tracing::info!(
            iterations = scheduler.iterations(),
            spawned,
            "constant-arrival-rate executor finished"
        );
        finish_run(&self.state, &scheduler, &metrics, self.scenario.graceful_stop).await;
        Ok(())
    }
}
