use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Bytes per second each worker may transfer, shared by all workers and
/// adjustable while they run. Zero means unlimited.
#[derive(Debug, Clone, Default)]
pub struct BandwidthLimit(Arc<AtomicU64>);

impl BandwidthLimit {
    pub fn new(limit: Option<u64>) -> Self {
        Self(Arc::new(AtomicU64::new(limit.unwrap_or(0))))
    }

    pub fn set(&self, limit: Option<u64>) {
        self.0.store(limit.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Relaxed) {
            0 => None,
            limit => Some(limit),
        }
    }
}

/// Token bucket of one worker. Tokens are bytes; the bucket holds at most one
/// second worth of them and may go into debt, which is paid back by sleeping.
#[derive(Debug)]
struct TokenBucket {
    limit: BandwidthLimit,
    rate: u64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub(crate) fn new(limit: BandwidthLimit) -> Self {
        let rate = limit.get().unwrap_or(0);
        Self {
            limit,
            rate,
            tokens: rate as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let rate = self.limit.get().unwrap_or(0);
        if rate != self.rate {
            // reconfigured: start over with a full bucket at the new rate
            self.rate = rate;
            self.tokens = rate as f64;
        } else {
            let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate as f64).min(rate as f64);
        }
        self.last_refill = now;
    }

    /// Takes `bytes` tokens and returns how long to wait before the next
    /// transfer may start.
    fn take(&mut self, bytes: u64, now: Instant) -> Duration {
        self.refill(now);
        if self.rate == 0 {
            return Duration::ZERO;
        }
        self.tokens -= bytes as f64;
        if self.tokens >= 0. {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate as f64)
        }
    }

}

/// Cloneable handle on a worker's bucket. The transport takes tokens as body
/// chunks arrive; whatever it did not account for is settled once the
/// segment is complete.
#[derive(Debug, Clone)]
pub struct Throttle(Arc<ThrottleState>);

#[derive(Debug)]
struct ThrottleState {
    bucket: Mutex<TokenBucket>,
    consumed: AtomicU64,
}

impl Throttle {
    pub(crate) fn new(limit: BandwidthLimit) -> Self {
        Self(Arc::new(ThrottleState {
            bucket: Mutex::new(TokenBucket::new(limit)),
            consumed: AtomicU64::new(0),
        }))
    }

    /// Accounts for `bytes` just received, sleeping while the worker is above
    /// its limit.
    pub async fn consume(&self, bytes: u64) -> Duration {
        let wait = self.0.bucket.lock().take(bytes, Instant::now());
        self.0.consumed.fetch_add(bytes, Ordering::Relaxed);
        if !wait.is_zero() {
            tracing::debug!("Throttled, waiting {wait:?}");
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Starts accounting for a new segment.
    pub(crate) fn reset(&self) {
        self.0.consumed.store(0, Ordering::Relaxed);
    }

    /// Takes the part of a `total` byte segment not yet consumed chunk by
    /// chunk.
    pub(crate) async fn settle(&self, total: u64) -> Duration {
        let consumed = self.0.consumed.swap(0, Ordering::Relaxed);
        match total.saturating_sub(consumed) {
            0 => Duration::ZERO,
            rest => {
                let wait = self.consume(rest).await;
                self.0.consumed.store(0, Ordering::Relaxed);
                wait
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited() {
        let mut bucket = TokenBucket::new(BandwidthLimit::new(None));
        assert_eq!(bucket.take(u64::MAX / 2, Instant::now()), Duration::ZERO);
    }

    #[test]
    fn test_debt_is_paid_by_waiting() {
        let limit = BandwidthLimit::new(Some(1000));
        let mut bucket = TokenBucket::new(limit);
        let now = Instant::now();

        // one second of burst is free
        assert_eq!(bucket.take(1000, now), Duration::ZERO);
        // 500 bytes over the limit take half a second
        let wait = bucket.take(500, now);
        assert!((wait.as_secs_f64() - 0.5).abs() < 1e-6);
        // after a second the debt is paid and half a bucket refilled
        let wait = bucket.take(400, now + Duration::from_secs(1));
        assert_eq!(wait, Duration::ZERO);
    }

    #[test]
    fn test_reconfigure() {
        let limit = BandwidthLimit::new(Some(100));
        let mut bucket = TokenBucket::new(limit.clone());
        let now = Instant::now();
        assert!(!bucket.take(1000, now).is_zero());

        limit.set(None);
        assert!(bucket.take(1000, now).is_zero());

        limit.set(Some(10_000));
        assert!(bucket.take(1000, now).is_zero());
        assert_eq!(limit.get(), Some(10_000));
    }

    #[tokio::test]
    async fn test_chunks_are_paced_as_they_arrive() {
        let throttle = Throttle::new(BandwidthLimit::new(Some(10_000)));
        throttle.reset();

        // the first second of burst is free, every later chunk waits
        assert!(throttle.consume(10_000).await.is_zero());
        let wait = throttle.consume(1000).await;
        assert!(wait >= Duration::from_millis(80), "{wait:?}");

        // chunks already paid for are not charged again
        assert!(throttle.settle(11_000).await.is_zero());
    }

    #[tokio::test]
    async fn test_settle_charges_what_the_transport_did_not() {
        let throttle = Throttle::new(BandwidthLimit::new(Some(10_000)));
        throttle.reset();
        assert!(throttle.settle(10_000).await.is_zero());
        assert!(!throttle.settle(1000).await.is_zero());
    }
}
