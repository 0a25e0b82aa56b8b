//! Tick service: clock, periodic callbacks and tick-counted waits for keepalive and backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Default tick rate.
pub const TICKS_PER_SECOND: u32 = 20;

pub type TickCallback = Arc<dyn Fn() + Send + Sync>;

/// Clock and timers injected into both engines.
#[async_trait::async_trait]
pub trait TickService: Send + Sync + 'static {
    /// Monotonic milliseconds since the service started.
    fn now(&self) -> u64;

    /// Length of one tick.
    fn tick(&self) -> Duration;

    /// Run `callback` every `interval` until the registration is stopped or dropped.
    fn register(&self, interval: Duration, callback: TickCallback) -> TickRegistration;

    /// Resolve after `n` ticks.
    async fn wait_ticks(&self, n: u32);
}

/// Handle to a registered callback. Stops it on `stop()` or drop.
#[derive(Debug)]
pub struct TickRegistration {
    handle: Option<JoinHandle<()>>,
}

impl TickRegistration {
    pub fn from_task(handle: JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TickRegistration {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `TickService` on `tokio::time`. Must be used inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioTicks {
    started: Instant,
    tick: Duration,
}

impl TokioTicks {
    pub fn new(ticks_per_second: u32) -> Self {
        Self {
            started: Instant::now(),
            tick: Duration::from_secs(1) / ticks_per_second.max(1),
        }
    }

    pub fn shared(ticks_per_second: u32) -> Arc<dyn TickService> {
        Arc::new(Self::new(ticks_per_second))
    }
}

impl Default for TokioTicks {
    fn default() -> Self {
        Self::new(TICKS_PER_SECOND)
    }
}

#[async_trait::async_trait]
impl TickService for TokioTicks {
    fn now(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn tick(&self) -> Duration {
        self.tick
    }

    fn register(&self, interval: Duration, callback: TickCallback) -> TickRegistration {
        let period = interval.max(Duration::from_millis(1));
        TickRegistration::from_task(tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                callback();
            }
        }))
    }

    async fn wait_ticks(&self, n: u32) {
        tokio::time::sleep(self.tick * n).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn wait_ticks_advances_clock() {
        let ticks = TokioTicks::new(100);
        let before = ticks.now();
        ticks.wait_ticks(5).await;
        assert!(ticks.now() >= before + 50);
    }

    #[tokio::test]
    async fn registration_stops_on_drop() {
        let ticks = TokioTicks::new(100);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let reg = ticks.register(
            Duration::from_millis(10),
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tokio::time::sleep(Duration::from_millis(55)).await;
        drop(reg);
        tokio::task::yield_now().await;
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
