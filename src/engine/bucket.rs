use crate::error::{Error, Result};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Floor applied to every rate so the interval stays finite.
pub const MIN_RATE: f64 = 0.01;

/// Paces open-model iterations at an adjustable rate without letting credit
/// accumulated under a previous rate turn into a burst.
///
/// The emission rule is `next = max(now, last_emit + interval)`; `last_emit`
/// always stores the returned value, so it never lags behind `now` and a
/// rate change can hand out at most one interval of prior budget.
pub struct LeakyBucket {
    inner: Mutex<Inner>,
}

struct Inner {
    rate: f64,
    interval: Duration,
    last_emit: Option<Instant>,
    emitted: u64,
}

/// Observational view of the bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketStats {
    pub rate: f64,
    pub interval: Duration,
    pub emitted: u64,
}

impl LeakyBucket {
    pub fn new(rate: f64) -> Self {
        let rate = rate.max(MIN_RATE);
        Self {
            inner: Mutex::new(Inner {
                rate,
                interval: interval_for(rate),
                last_emit: None,
                emitted: 0,
            }),
        }
    }

    /// Compute the next emission time, record it, and return it. Never
    /// earlier than `last emission + interval` and never earlier than now.
    pub fn next(&self) -> Instant {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let at = match inner.last_emit {
            Some(last) => (last + inner.interval).max(now),
            None => now,
        };
        inner.last_emit = Some(at);
        inner.emitted += 1;
        at
    }

    /// Sleep until the next emission or fail with `Cancelled`.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let at = self.next();
        tokio::select! {
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => Ok(()),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Update the target rate. `last_emit` is clamped forward to now so the
    /// next emission lands no earlier than `now + 1/rate`.
    pub fn set_rate(&self, rate: f64) {
        let rate = rate.max(MIN_RATE);
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.rate = rate;
        inner.interval = interval_for(rate);
        inner.last_emit = Some(match inner.last_emit {
            Some(last) => last.max(now),
            None => now,
        });
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().unwrap().rate
    }

    pub fn stats(&self) -> BucketStats {
        let inner = self.inner.lock().unwrap();
        BucketStats {
            rate: inner.rate,
            interval: inner.interval,
            emitted: inner.emitted,
        }
    }
}

fn interval_for(rate: f64) -> Duration {
    Duration::from_secs_f64(1.0 / rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_emission_is_immediate() {
        let bucket = LeakyBucket::new(10.0);
        let before = Instant::now();
        let at = bucket.next();
        assert!(at >= before);
        assert!(at <= Instant::now() + Duration::from_millis(5));
    }

    #[test]
    fn sequential_emissions_are_spaced_by_interval() {
        let bucket = LeakyBucket::new(100.0);
        let a = bucket.next();
        let b = bucket.next();
        let c = bucket.next();
        assert!(b >= a + Duration::from_millis(10));
        assert!(c >= b + Duration::from_millis(10));
    }

    #[test]
    fn rate_change_takes_effect_on_next_emission() {
        let bucket = LeakyBucket::new(1000.0);
        bucket.next();
        bucket.set_rate(10.0);
        let now = Instant::now();
        let at = bucket.next();
        assert!(at >= now + Duration::from_millis(90));
    }

    #[test]
    fn raising_the_rate_does_not_burst() {
        // Low rate first, so the bucket would "owe" a long interval, then a
        // rate increase. The next emission must still respect the new
        // interval from now, not fire immediately off stale credit.
        let bucket = LeakyBucket::new(0.5);
        bucket.next();
        std::thread::sleep(Duration::from_millis(20));
        bucket.set_rate(100.0);
        let now = Instant::now();
        let at = bucket.next();
        assert!(at >= now + Duration::from_millis(8));
        assert!(at <= now + Duration::from_millis(50));
    }

    #[test]
    fn rate_is_floored() {
        let bucket = LeakyBucket::new(0.0);
        assert!(bucket.rate() >= MIN_RATE);
        bucket.set_rate(-1.0);
        assert!(bucket.rate() >= MIN_RATE);
    }

    #[test]
    fn stats_counts_emissions() {
        let bucket = LeakyBucket::new(50.0);
        bucket.next();
        bucket.next();
        let stats = bucket.stats();
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.interval, Duration::from_secs_f64(1.0 / 50.0));
    }

    #[tokio::test]
    async fn wait_fails_with_cancelled() {
        let bucket = LeakyBucket::new(0.1);
        bucket.next();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = bucket.wait(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
