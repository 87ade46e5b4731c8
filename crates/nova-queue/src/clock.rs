use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Abstract clock so the timer wheel, aggregators, and delay managers can be
/// driven deterministically in tests instead of depending on wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    fn sleep(&self, dur: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Wall-clock implementation backed by `tokio::time`.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, dur: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(dur))
    }
}

/// Manually-advanced clock for unit tests of time-sensitive components
/// (aggregator windows, timer wheel ticks, delay-manager overshoot math).
#[derive(Debug, Clone)]
pub struct FakeClock {
    millis: Arc<AtomicI64>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    pub fn advance(&self, dur: Duration) {
        self.millis
            .fetch_add(dur.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn sleep(&self, _dur: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        // Tests drive time explicitly via `advance`; sleeping under a fake
        // clock would otherwise hang forever waiting for wall-clock time.
        Box::pin(std::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_deterministically() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        assert_eq!(clock.now().timestamp_millis(), start.timestamp_millis());
        clock.advance(Duration::from_secs(5));
        assert_eq!(
            clock.now().timestamp_millis(),
            start.timestamp_millis() + 5_000
        );
    }
}
