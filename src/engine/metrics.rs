use crate::engine::timeseries::{BucketObservation, TimeBucketStore};
use crate::types::{LatencyStats, MetricsSnapshot, Phase, PhaseChange, TimeBucket};
use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Cadence of the background time-series emitter.
    pub bucket_interval: Duration,
    /// FIFO retention limit of the time-series store.
    pub max_buckets: usize,
    /// Histogram range in microseconds; samples are clamped into it.
    pub histogram_low_us: u64,
    pub histogram_high_us: u64,
    pub significant_figures: u8,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bucket_interval: Duration::from_secs(1),
            max_buckets: 3600,
            histogram_low_us: 1,
            histogram_high_us: 3_600_000_000,
            significant_figures: 3,
        }
    }
}

/// Concurrent aggregator over HDR-histogram latency data plus a continuously
/// emitted time-series of per-interval buckets.
///
/// Writers go through a mutex (global histogram), a write-locked map
/// (per-request histograms), and atomics (counters, gauge, phase). The
/// emitter is a single background task; `stop` cancels it, waits for it, and
/// flushes one final bucket.
pub struct MetricsEngine {
    cfg: MetricsConfig,
    started: Mutex<(Instant, DateTime<Utc>)>,
    histogram: Mutex<Histogram<u64>>,
    per_request: RwLock<HashMap<String, Histogram<u64>>>,
    total_requests: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    bytes_received: AtomicU64,
    active_vus: AtomicU32,
    phase: AtomicU8,
    phase_history: Mutex<Vec<PhaseChange>>,
    store: TimeBucketStore,
    emitter: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl MetricsEngine {
    pub fn new(cfg: MetricsConfig) -> Arc<Self> {
        let histogram = new_histogram(&cfg);
        let store = TimeBucketStore::new(cfg.max_buckets);
        Arc::new(Self {
            cfg,
            started: Mutex::new((Instant::now(), Utc::now())),
            histogram: Mutex::new(histogram),
            per_request: RwLock::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            active_vus: AtomicU32::new(0),
            phase: AtomicU8::new(Phase::Init.as_u8()),
            phase_history: Mutex::new(Vec::new()),
            store,
            emitter: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// Spawn the background bucket emitter. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.emitter.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let engine = Arc::clone(self);
        let cancel = self.cancel.lock().unwrap().clone();
        *guard = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(engine.cfg.bucket_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of an interval completes immediately.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        engine.emit_bucket();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }));
    }

    /// Cancel the emitter, wait for it, then flush one final bucket.
    pub async fn stop(&self) {
        self.cancel.lock().unwrap().cancel();
        let handle = self.emitter.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.emit_bucket();
    }

    /// Record one request sample. The duration is clamped into the histogram
    /// range; a non-empty request name also records into that request's
    /// lazily created histogram.
    pub fn record_latency(&self, latency: Duration, request_name: &str, success: bool, bytes: u64) {
        let us = (latency.as_micros() as u64)
            .clamp(self.cfg.histogram_low_us, self.cfg.histogram_high_us);

        {
            let mut histogram = self.histogram.lock().unwrap();
            let _ = histogram.record(us);
        }
        if !request_name.is_empty() {
            let mut map = self.per_request.write().unwrap();
            let histogram = map
                .entry(request_name.to_string())
                .or_insert_with(|| new_histogram(&self.cfg));
            let _ = histogram.record(us);
        }

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Transition the phase, appending to the change history iff it changed.
    pub fn set_phase(&self, phase: Phase) {
        let prev = self.phase.swap(phase.as_u8(), Ordering::SeqCst);
        if prev != phase.as_u8() {
            self.phase_history.lock().unwrap().push(PhaseChange {
                phase,
                at: Utc::now(),
                total_requests: self.total_requests.load(Ordering::Relaxed),
            });
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn phase_history(&self) -> Vec<PhaseChange> {
        self.phase_history.lock().unwrap().clone()
    }

    pub fn set_active_vus(&self, n: u32) {
        self.active_vus.store(n, Ordering::Relaxed);
    }

    pub fn active_vus(&self) -> u32 {
        self.active_vus.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn successful(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started.lock().unwrap().1
    }

    pub fn elapsed(&self) -> Duration {
        self.started.lock().unwrap().0.elapsed()
    }

    /// Read-only view of the current state. The reported `requests_per_sec`
    /// is the steady-state rate when one is available, otherwise the overall
    /// rate.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (started_i, started_t) = *self.started.lock().unwrap();
        let elapsed = started_i.elapsed();
        let total = self.total_requests();
        let failed = self.failed();

        let overall_rps = if elapsed.as_secs_f64() > 0.0 {
            total as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let steady_state_rps = self.store.steady_state_rps();
        let error_rate = if total > 0 {
            failed as f64 / total as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            total_requests: total,
            successful: self.successful(),
            failed,
            bytes_received: self.bytes_received(),
            requests_per_sec: steady_state_rps.unwrap_or(overall_rps),
            overall_rps,
            steady_state_rps,
            error_rate,
            latency: stats_from(&self.histogram.lock().unwrap()),
            active_vus: self.active_vus(),
            phase: self.phase(),
            elapsed,
            started_at: started_t,
            taken_at: Utc::now(),
        }
    }

    /// Copy of the retained time-series buckets in order.
    pub fn time_series(&self) -> Vec<TimeBucket> {
        self.store.snapshot()
    }

    /// Latency stats per request name.
    pub fn request_stats(&self) -> HashMap<String, LatencyStats> {
        let map = self.per_request.read().unwrap();
        map.iter()
            .map(|(name, histogram)| (name.clone(), stats_from(histogram)))
            .collect()
    }

    /// Fold this engine's global histogram into `target`, for cross-scenario
    /// aggregation.
    pub fn merge_histogram_into(&self, target: &mut Histogram<u64>) {
        let histogram = self.histogram.lock().unwrap();
        let _ = target.add(&*histogram);
    }

    /// Re-initialise every field to the post-construction state. The emitter
    /// is stopped without a final flush; `start` may be called again.
    pub async fn reset(&self) {
        self.cancel.lock().unwrap().cancel();
        let handle = self.emitter.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.cancel.lock().unwrap() = CancellationToken::new();

        *self.histogram.lock().unwrap() = new_histogram(&self.cfg);
        self.per_request.write().unwrap().clear();
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.active_vus.store(0, Ordering::Relaxed);
        self.phase.store(Phase::Init.as_u8(), Ordering::SeqCst);
        self.phase_history.lock().unwrap().clear();
        self.store.reset();
        *self.started.lock().unwrap() = (Instant::now(), Utc::now());
    }

    fn emit_bucket(&self) {
        let (started_i, _) = *self.started.lock().unwrap();
        let latency = stats_from(&self.histogram.lock().unwrap());
        self.store.create_bucket(BucketObservation {
            timestamp: Utc::now(),
            elapsed: started_i.elapsed(),
            total_requests: self.total_requests(),
            successful: self.successful(),
            failed: self.failed(),
            bytes_received: self.bytes_received(),
            latency_min_us: latency.min_us,
            latency_max_us: latency.max_us,
            latency_p50_us: latency.p50_us,
            latency_p90_us: latency.p90_us,
            latency_p95_us: latency.p95_us,
            latency_p99_us: latency.p99_us,
            active_vus: self.active_vus(),
            phase: self.phase(),
        });
    }
}

pub(crate) fn new_histogram(cfg: &MetricsConfig) -> Histogram<u64> {
    Histogram::new_with_bounds(
        cfg.histogram_low_us.max(1),
        cfg.histogram_high_us,
        cfg.significant_figures,
    )
    .expect("histogram bounds")
}

pub(crate) fn stats_from(histogram: &Histogram<u64>) -> LatencyStats {
    LatencyStats {
        count: histogram.len(),
        min_us: histogram.min(),
        max_us: histogram.max(),
        mean_us: histogram.mean(),
        stddev_us: histogram.stdev(),
        p50_us: histogram.value_at_percentile(50.0),
        p90_us: histogram.value_at_percentile(90.0),
        p95_us: histogram.value_at_percentile(95.0),
        p99_us: histogram.value_at_percentile(99.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cfg() -> MetricsConfig {
        MetricsConfig {
            bucket_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[test]
    fn totals_split_into_success_and_failure() {
        let engine = MetricsEngine::new(MetricsConfig::default());
        engine.record_latency(Duration::from_millis(5), "a", true, 100);
        engine.record_latency(Duration::from_millis(7), "a", false, 0);
        engine.record_latency(Duration::from_millis(9), "b", true, 50);

        assert_eq!(engine.total_requests(), 3);
        assert_eq!(engine.successful() + engine.failed(), engine.total_requests());
        assert_eq!(engine.bytes_received(), 150);
    }

    #[test]
    fn latency_is_clamped_into_histogram_range() {
        let engine = MetricsEngine::new(MetricsConfig::default());
        engine.record_latency(Duration::from_secs(7200), "", true, 0);
        let snapshot = engine.snapshot();
        assert!(snapshot.latency.max_us <= 3_700_000_000);
        assert_eq!(snapshot.latency.count, 1);
    }

    #[test]
    fn per_request_histograms_are_lazy_and_skip_empty_names() {
        let engine = MetricsEngine::new(MetricsConfig::default());
        engine.record_latency(Duration::from_millis(1), "", true, 0);
        assert!(engine.request_stats().is_empty());
        engine.record_latency(Duration::from_millis(2), "login", true, 0);
        engine.record_latency(Duration::from_millis(4), "login", true, 0);
        let stats = engine.request_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats["login"].count, 2);
    }

    #[test]
    fn min_never_exceeds_max_in_snapshot() {
        let engine = MetricsEngine::new(MetricsConfig::default());
        for ms in [3u64, 14, 2, 90, 41] {
            engine.record_latency(Duration::from_millis(ms), "", true, 0);
        }
        let latency = engine.snapshot().latency;
        assert!(latency.min_us <= latency.p50_us);
        assert!(latency.p50_us <= latency.p99_us);
        assert!(latency.p99_us <= latency.max_us);
    }

    #[test]
    fn phase_history_records_only_real_transitions() {
        let engine = MetricsEngine::new(MetricsConfig::default());
        engine.set_phase(Phase::Steady);
        engine.set_phase(Phase::Steady);
        engine.set_phase(Phase::Done);
        let history = engine.phase_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].phase, Phase::Steady);
        assert_eq!(history[1].phase, Phase::Done);
    }

    #[test]
    fn p99_tracks_a_known_distribution() {
        let engine = MetricsEngine::new(MetricsConfig::default());
        // 10_000 samples: 1..=10_000 µs; true p99 is 9_900 µs.
        for us in 1..=10_000u64 {
            engine.record_latency(Duration::from_micros(us), "", true, 0);
        }
        let p99 = engine.snapshot().latency.p99_us as f64;
        assert!((p99 - 9_900.0).abs() / 9_900.0 < 0.01, "p99 was {p99}");
    }

    #[tokio::test]
    async fn emitter_produces_buckets_and_stop_flushes_one_more() {
        let engine = MetricsEngine::new(fast_cfg());
        engine.start();
        engine.record_latency(Duration::from_millis(2), "a", true, 10);
        tokio::time::sleep(Duration::from_millis(70)).await;
        engine.stop().await;

        let series = engine.time_series();
        assert!(series.len() >= 2, "expected >= 2 buckets, got {}", series.len());
        let last = series.last().unwrap();
        assert_eq!(last.total_requests, 1);
    }

    #[tokio::test]
    async fn snapshot_prefers_steady_state_rps() {
        let engine = MetricsEngine::new(fast_cfg());
        engine.set_phase(Phase::Steady);
        for _ in 0..4 {
            engine.record_latency(Duration::from_millis(1), "", true, 0);
            tokio::time::sleep(Duration::from_millis(5)).await;
            engine.emit_bucket();
        }
        let snapshot = engine.snapshot();
        let steady = snapshot.steady_state_rps.expect("steady-state rps");
        assert_eq!(snapshot.requests_per_sec, steady);
    }

    #[tokio::test]
    async fn reset_returns_to_post_construction_state() {
        let engine = MetricsEngine::new(fast_cfg());
        engine.start();
        engine.record_latency(Duration::from_millis(2), "a", true, 10);
        engine.set_phase(Phase::Steady);
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.reset().await;

        assert_eq!(engine.total_requests(), 0);
        assert_eq!(engine.phase(), Phase::Init);
        assert!(engine.phase_history().is_empty());
        assert!(engine.time_series().is_empty());
        assert!(engine.request_stats().is_empty());

        // The engine is usable again after a reset.
        engine.start();
        engine.record_latency(Duration::from_millis(1), "b", true, 1);
        engine.stop().await;
        assert_eq!(engine.total_requests(), 1);
        assert!(!engine.time_series().is_empty());
    }
}
