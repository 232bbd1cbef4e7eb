use crate::types::{Phase, TimeBucket};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Cumulative observation handed to [`TimeBucketStore::create_bucket`] at an
/// interval boundary. Interval-local deltas are derived inside the store.
#[derive(Debug, Clone)]
pub struct BucketObservation {
    pub timestamp: DateTime<Utc>,
    pub elapsed: Duration,
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub bytes_received: u64,
    pub latency_min_us: u64,
    pub latency_max_us: u64,
    pub latency_p50_us: u64,
    pub latency_p90_us: u64,
    pub latency_p95_us: u64,
    pub latency_p99_us: u64,
    pub active_vus: u32,
    pub phase: Phase,
}

/// FIFO-bounded store of per-interval buckets.
pub struct TimeBucketStore {
    max_buckets: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    buckets: VecDeque<TimeBucket>,
    prev: Option<PrevMark>,
}

struct PrevMark {
    elapsed: Duration,
    total_requests: u64,
    failed: u64,
}

impl TimeBucketStore {
    pub fn new(max_buckets: usize) -> Self {
        Self {
            max_buckets: max_buckets.max(1),
            inner: Mutex::new(Inner {
                buckets: VecDeque::new(),
                prev: None,
            }),
        }
    }

    /// Append a bucket, computing interval deltas against the previous one.
    /// The oldest bucket is dropped once the store is full.
    pub fn create_bucket(&self, obs: BucketObservation) -> TimeBucket {
        let mut inner = self.inner.lock().unwrap();

        let (prev_elapsed, prev_total, prev_failed) = match &inner.prev {
            Some(mark) => (mark.elapsed, mark.total_requests, mark.failed),
            None => (Duration::ZERO, 0, 0),
        };

        let interval_secs = obs.elapsed.saturating_sub(prev_elapsed).as_secs_f64();
        let interval_requests = obs.total_requests.saturating_sub(prev_total);
        let interval_failed = obs.failed.saturating_sub(prev_failed);
        let interval_rps = if interval_secs > 0.0 {
            interval_requests as f64 / interval_secs
        } else {
            0.0
        };
        let interval_error_rate = if interval_requests > 0 {
            interval_failed as f64 / interval_requests as f64
        } else {
            0.0
        };

        let bucket = TimeBucket {
            timestamp: obs.timestamp,
            elapsed: obs.elapsed,
            total_requests: obs.total_requests,
            successful: obs.successful,
            failed: obs.failed,
            bytes_received: obs.bytes_received,
            interval_requests,
            interval_rps,
            interval_error_rate,
            latency_min_us: obs.latency_min_us,
            latency_max_us: obs.latency_max_us,
            latency_p50_us: obs.latency_p50_us,
            latency_p90_us: obs.latency_p90_us,
            latency_p95_us: obs.latency_p95_us,
            latency_p99_us: obs.latency_p99_us,
            active_vus: obs.active_vus,
            phase: obs.phase,
        };

        inner.prev = Some(PrevMark {
            elapsed: obs.elapsed,
            total_requests: obs.total_requests,
            failed: obs.failed,
        });
        if inner.buckets.len() == self.max_buckets {
            inner.buckets.pop_front();
        }
        inner.buckets.push_back(bucket.clone());
        bucket
    }

    /// Copy of the retained buckets in order.
    pub fn snapshot(&self) -> Vec<TimeBucket> {
        self.inner.lock().unwrap().buckets.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Throughput averaged over the stable window: buckets tagged Steady,
    /// excluding the first and last of them. Defined only when at least
    /// three Steady buckets exist.
    pub fn steady_state_rps(&self) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        let steady: Vec<f64> = inner
            .buckets
            .iter()
            .filter(|b| b.phase == Phase::Steady)
            .map(|b| b.interval_rps)
            .collect();
        if steady.len() < 3 {
            return None;
        }
        let window = &steady[1..steady.len() - 1];
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.buckets.clear();
        inner.prev = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(elapsed_secs: u64, total: u64, failed: u64, phase: Phase) -> BucketObservation {
        BucketObservation {
            timestamp: Utc::now(),
            elapsed: Duration::from_secs(elapsed_secs),
            total_requests: total,
            successful: total - failed,
            failed,
            bytes_received: total * 100,
            latency_min_us: 1_000,
            latency_max_us: 9_000,
            latency_p50_us: 2_000,
            latency_p90_us: 5_000,
            latency_p95_us: 6_000,
            latency_p99_us: 8_000,
            active_vus: 2,
            phase,
        }
    }

    #[test]
    fn first_bucket_deltas_count_from_zero() {
        let store = TimeBucketStore::new(10);
        let bucket = store.create_bucket(obs(1, 50, 5, Phase::Steady));
        assert_eq!(bucket.interval_requests, 50);
        assert!((bucket.interval_rps - 50.0).abs() < 1e-9);
        assert!((bucket.interval_error_rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn interval_deltas_use_previous_bucket() {
        let store = TimeBucketStore::new(10);
        store.create_bucket(obs(1, 50, 0, Phase::Steady));
        let bucket = store.create_bucket(obs(3, 150, 10, Phase::Steady));
        assert_eq!(bucket.interval_requests, 100);
        assert!((bucket.interval_rps - 50.0).abs() < 1e-9);
        assert!((bucket.interval_error_rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn empty_interval_has_zero_rates() {
        let store = TimeBucketStore::new(10);
        store.create_bucket(obs(1, 50, 0, Phase::Steady));
        let bucket = store.create_bucket(obs(2, 50, 0, Phase::Steady));
        assert_eq!(bucket.interval_requests, 0);
        assert_eq!(bucket.interval_rps, 0.0);
        assert_eq!(bucket.interval_error_rate, 0.0);
    }

    #[test]
    fn fifo_retention_drops_oldest() {
        let store = TimeBucketStore::new(3);
        for i in 1..=5 {
            store.create_bucket(obs(i, i * 10, 0, Phase::Steady));
        }
        let buckets = store.snapshot();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].total_requests, 30);
        assert_eq!(buckets[2].total_requests, 50);
    }

    #[test]
    fn steady_state_needs_three_steady_buckets() {
        let store = TimeBucketStore::new(10);
        store.create_bucket(obs(1, 10, 0, Phase::RampUp));
        store.create_bucket(obs(2, 30, 0, Phase::Steady));
        store.create_bucket(obs(3, 50, 0, Phase::Steady));
        assert!(store.steady_state_rps().is_none());
    }

    #[test]
    fn steady_state_excludes_first_and_last_steady_bucket() {
        let store = TimeBucketStore::new(10);
        store.create_bucket(obs(1, 5, 0, Phase::RampUp));
        // Steady buckets with interval rates 10, 40, 60, 5; the window keeps
        // the middle two.
        store.create_bucket(obs(2, 15, 0, Phase::Steady));
        store.create_bucket(obs(3, 55, 0, Phase::Steady));
        store.create_bucket(obs(4, 115, 0, Phase::Steady));
        store.create_bucket(obs(5, 120, 0, Phase::Steady));
        let rps = store.steady_state_rps().unwrap();
        assert!((rps - 50.0).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_buckets_and_delta_base() {
        let store = TimeBucketStore::new(10);
        store.create_bucket(obs(1, 100, 0, Phase::Steady));
        store.reset();
        assert!(store.is_empty());
        let bucket = store.create_bucket(obs(1, 20, 0, Phase::Steady));
        assert_eq!(bucket.interval_requests, 20);
    }
}
