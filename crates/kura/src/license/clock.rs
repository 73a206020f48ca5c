use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use url::Url;

use crate::{
    error::{KuraError, KuraResult},
    util::transport::{FetchRequest, Transport},
};

/// Time source license expiry is checked against.
pub trait SecureClock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// A trusted timestamp pinned to a monotonic instant. Changing the wall clock
/// after anchoring does not move this clock.
#[derive(Debug)]
pub struct AnchoredClock {
    anchor: RwLock<(DateTime<Utc>, Instant)>,
}

impl AnchoredClock {
    pub fn new(trusted: DateTime<Utc>) -> Self {
        Self {
            anchor: RwLock::new((trusted, Instant::now())),
        }
    }

    /// Anchors to the system time once, at construction.
    pub fn system() -> Self {
        Self::new(Utc::now())
    }

    pub fn anchor(&self, trusted: DateTime<Utc>) {
        *self.anchor.write() = (trusted, Instant::now());
    }

    fn set_time(&self, remote_now: DateTime<Utc>, before_request: Instant, after_request: Instant) {
        // the server produced its timestamp around the middle of the exchange
        let rtt = after_request.duration_since(before_request);
        let half = TimeDelta::from_std(rtt / 2).unwrap_or(TimeDelta::zero());
        let server_now = remote_now + half;
        *self.anchor.write() = (server_now, after_request);
        tracing::info!(
            rtt_milliseconds = rtt.as_millis() as u64,
            "Secure clock anchored to {server_now}"
        );
    }

    /// Re-anchors from the `Date` header of a response from `url`.
    pub async fn sync(&self, transport: &dyn Transport, url: &Url) -> KuraResult<()> {
        let before = Instant::now();
        let response = transport.fetch(FetchRequest::get(url.clone())).await?;
        let after = Instant::now();
        let remote_now = response.date.ok_or_else(|| {
            KuraError::ConfigError(format!("time source {url} sent no Date header"))
        })?;
        self.set_time(remote_now, before, after);
        Ok(())
    }
}

impl SecureClock for AnchoredClock {
    fn now(&self) -> DateTime<Utc> {
        let (trusted, instant) = *self.anchor.read();
        trusted + TimeDelta::from_std(instant.elapsed()).unwrap_or(TimeDelta::zero())
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, delta: TimeDelta) {
        *self.now.lock() += delta;
    }
}

impl SecureClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_anchored_clock_moves_monotonically() {
        let trusted = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = AnchoredClock::new(trusted);
        std::thread::sleep(Duration::from_millis(20));
        let now = clock.now();
        assert!(now >= trusted + TimeDelta::milliseconds(20));
        assert!(now < trusted + TimeDelta::seconds(5));
    }

    #[test]
    fn test_rtt_compensation() {
        let clock = AnchoredClock::system();
        let remote = DateTime::parse_from_rfc3339("2030-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let after = Instant::now();
        let before = after - Duration::from_millis(400);
        clock.set_time(remote, before, after);
        let now = clock.now();
        assert!(now >= remote + TimeDelta::milliseconds(200));
        assert!(now < remote + TimeDelta::seconds(5));
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(TimeDelta::hours(2));
        assert_eq!(clock.now(), start + TimeDelta::hours(2));
    }
}
