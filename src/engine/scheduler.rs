use crate::config::{GlobalSettings, PacingConfig, ScenarioConfig};
use crate::engine::metrics::MetricsEngine;
use crate::engine::vu::VirtualUser;
use crate::error::Result;
use crate::http::build_client;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Spawns and pools virtual users for one scenario, sharing a single HTTP
/// transport across them (or handing each VU a fresh client when configured
/// for isolation).
///
/// The registry is the authority on VU lifetime: `active_vu_count` equals the
/// number of registry entries whose state is not Stopped.
pub struct VuScheduler {
    scenario: Arc<ScenarioConfig>,
    settings: Arc<GlobalSettings>,
    metrics: Arc<MetricsEngine>,
    shared_client: Client,
    vus: RwLock<HashMap<u64, Arc<VirtualUser>>>,
    next_id: AtomicU64,
    iterations: AtomicU64,
    shutdown: CancellationToken,
}

impl VuScheduler {
    pub fn new(
        scenario: Arc<ScenarioConfig>,
        settings: Arc<GlobalSettings>,
        metrics: Arc<MetricsEngine>,
    ) -> Result<Self> {
        let shared_client = build_client(&settings)?;
        Ok(Self {
            scenario,
            settings,
            metrics,
            shared_client,
            vus: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            iterations: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Allocate the next id, construct and register a VU, and return it.
    pub fn spawn_vu(&self) -> Result<Arc<VirtualUser>> {
        let client = if self.settings.use_shared_client {
            self.shared_client.clone()
        } else {
            build_client(&self.settings)?
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let vu = Arc::new(VirtualUser::new(
            id,
            self.scenario.clone(),
            self.settings.clone(),
            client,
            self.metrics.clone(),
        ));
        self.vus.write().unwrap().insert(id, vu.clone());
        tracing::debug!(vu = id, "spawned");
        Ok(vu)
    }

    pub fn get_vu(&self, id: u64) -> Option<Arc<VirtualUser>> {
        self.vus.read().unwrap().get(&id).cloned()
    }

    /// Snapshot of the non-Stopped VUs.
    pub fn active_vus(&self) -> Vec<Arc<VirtualUser>> {
        self.vus
            .read()
            .unwrap()
            .values()
            .filter(|vu| vu.state() != crate::types::VuState::Stopped)
            .cloned()
            .collect()
    }

    pub fn active_vu_count(&self) -> u32 {
        self.active_vus().len() as u32
    }

    /// Request stop on one VU. False when the id is unknown.
    pub fn stop_vu(&self, id: u64) -> bool {
        match self.get_vu(id) {
            Some(vu) => {
                vu.request_stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all_vus(&self) {
        for vu in self.vus.read().unwrap().values() {
            vu.request_stop();
        }
    }

    /// Mark a VU Stopped and delete it from the registry.
    pub fn remove_vu(&self, id: u64) {
        if let Some(vu) = self.vus.write().unwrap().remove(&id) {
            vu.mark_stopped();
        }
    }

    /// Wait for every registered VU to reach Stopped; returns the count that
    /// missed the deadline.
    pub async fn wait_for_all_vus(&self, timeout: Duration) -> u32 {
        let deadline = Instant::now() + timeout;
        let vus: Vec<_> = self.vus.read().unwrap().values().cloned().collect();
        let mut missed = 0u32;
        for vu in vus {
            let left = deadline.saturating_duration_since(Instant::now());
            if !vu.wait_for_stop(left).await {
                missed += 1;
            }
        }
        missed
    }

    /// Closed-model VU loop: iterate until the context, the scheduler
    /// shutdown, or the VU's own stop fires, pacing between iterations. The
    /// VU is marked Stopped on exit.
    pub async fn run_vu(
        &self,
        ctx: &CancellationToken,
        vu: Arc<VirtualUser>,
        pacing: &PacingConfig,
    ) {
        loop {
            if ctx.is_cancelled()
                || self.shutdown.is_cancelled()
                || vu.state().is_stopping_or_stopped()
            {
                break;
            }
            match vu.run_iteration(ctx).await {
                Ok(()) => {
                    self.iterations.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => break,
            }
            let delay = pacing.delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancelled() => break,
                    _ = self.shutdown.cancelled() => break,
                }
            }
        }
        vu.mark_stopped();
        tracing::debug!(vu = vu.id(), "vu loop stopped");
    }

    /// Adjust the active VU count to `target`: spawn and hand new VUs to
    /// `on_spawn` (the caller launches their task), or request stop on the
    /// newest excess VUs. Idempotent.
    pub fn scale_vus(
        &self,
        target: u32,
        on_spawn: &mut dyn FnMut(Arc<VirtualUser>),
    ) -> Result<()> {
        let active = self.active_vus();
        let current = active.len() as u32;
        if current < target {
            for _ in current..target {
                let vu = self.spawn_vu()?;
                on_spawn(vu);
            }
        } else if current > target {
            let mut excess = active;
            excess.sort_by_key(|vu| std::cmp::Reverse(vu.id()));
            for vu in excess.into_iter().take((current - target) as usize) {
                vu.request_stop();
            }
        }
        Ok(())
    }

    /// Total completed iterations across all VUs of this scheduler.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub(crate) fn add_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Broadcast shutdown, request stop on every VU, and wait bounded.
    /// Returns the count of VUs that missed the graceful window. Idle
    /// transport connections close when the last client clone drops.
    pub async fn shutdown(&self, timeout: Duration) -> u32 {
        self.shutdown.cancel();
        self.stop_all_vus();
        let missed = self.wait_for_all_vus(timeout).await;
        if missed > 0 {
            tracing::warn!(missed, "vus did not stop within the shutdown window");
        }
        missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PacingKind, RequestConfig};
    use crate::engine::metrics::MetricsConfig;
    use crate::types::VuState;

    fn make_scheduler() -> VuScheduler {
        let scenario = Arc::new(ScenarioConfig {
            requests: vec![RequestConfig {
                name: "step".to_string(),
                // Nothing listens here; iterations fail fast but complete.
                url: "http://127.0.0.1:9/".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        VuScheduler::new(
            scenario,
            Arc::new(GlobalSettings::default()),
            MetricsEngine::new(MetricsConfig::default()),
        )
        .unwrap()
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let scheduler = make_scheduler();
        let a = scheduler.spawn_vu().unwrap();
        let b = scheduler.spawn_vu().unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert!(scheduler.get_vu(1).is_some());
        assert!(scheduler.get_vu(99).is_none());
    }

    #[test]
    fn active_count_excludes_stopped() {
        let scheduler = make_scheduler();
        let a = scheduler.spawn_vu().unwrap();
        scheduler.spawn_vu().unwrap();
        assert_eq!(scheduler.active_vu_count(), 2);
        a.mark_stopped();
        assert_eq!(scheduler.active_vu_count(), 1);
        // Stopping still counts as active.
        scheduler.stop_vu(2);
        assert_eq!(scheduler.active_vu_count(), 1);
    }

    #[test]
    fn remove_vu_marks_stopped_and_deregisters() {
        let scheduler = make_scheduler();
        let vu = scheduler.spawn_vu().unwrap();
        scheduler.remove_vu(vu.id());
        assert_eq!(vu.state(), VuState::Stopped);
        assert!(scheduler.get_vu(vu.id()).is_none());
    }

    #[test]
    fn scale_up_spawns_and_reports_each_vu() {
        let scheduler = make_scheduler();
        let mut seen = Vec::new();
        scheduler
            .scale_vus(3, &mut |vu| seen.push(vu.id()))
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(scheduler.active_vu_count(), 3);
        // Idempotent at the same target.
        scheduler
            .scale_vus(3, &mut |_| panic!("no spawn expected"))
            .unwrap();
    }

    #[test]
    fn scale_down_stops_newest_vus_first() {
        let scheduler = make_scheduler();
        scheduler.scale_vus(3, &mut |_| {}).unwrap();
        scheduler.scale_vus(1, &mut |_| {}).unwrap();
        assert_eq!(scheduler.get_vu(1).unwrap().state(), VuState::Idle);
        assert_eq!(scheduler.get_vu(2).unwrap().state(), VuState::Stopping);
        assert_eq!(scheduler.get_vu(3).unwrap().state(), VuState::Stopping);
    }

    #[tokio::test]
    async fn wait_for_all_reports_stragglers() {
        let scheduler = make_scheduler();
        let a = scheduler.spawn_vu().unwrap();
        scheduler.spawn_vu().unwrap();
        a.mark_stopped();
        let missed = scheduler.wait_for_all_vus(Duration::from_millis(20)).await;
        assert_eq!(missed, 1);
    }

    #[tokio::test]
    async fn run_vu_loops_until_cancelled_and_marks_stopped() {
        let scheduler = Arc::new(make_scheduler());
        let vu = scheduler.spawn_vu().unwrap();
        let ctx = CancellationToken::new();
        let pacing = PacingConfig {
            kind: PacingKind::Constant,
            duration: Some(Duration::from_millis(5)),
            ..Default::default()
        };

        let handle = {
            let scheduler = scheduler.clone();
            let vu = vu.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { scheduler.run_vu(&ctx, vu, &pacing).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        ctx.cancel();
        handle.await.unwrap();

        assert_eq!(vu.state(), VuState::Stopped);
        assert!(scheduler.iterations() > 0);
    }

    #[tokio::test]
    async fn shutdown_stops_everything_within_the_window() {
        let scheduler = Arc::new(make_scheduler());
        for _ in 0..3 {
            let vu = scheduler.spawn_vu().unwrap();
            let scheduler = scheduler.clone();
            let ctx = scheduler.shutdown_token();
            tokio::spawn(async move {
                scheduler.run_vu(&ctx, vu, &PacingConfig::default()).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        let missed = scheduler.shutdown(Duration::from_secs(2)).await;
        assert_eq!(missed, 0);
        assert!(
            scheduler
                .active_vus()
                .iter()
                .all(|vu| vu.state() == VuState::Stopped),
            "no vu may remain running after shutdown"
        );
    }
}
