#[cfg(test)]
use std::sync::{Arc, Mutex};
#[cfg(test)]
use tokio::sync::Notify;
#[cfg(test)]
use tokio::time::Duration;
use tokio::time::Instant;

/// Source of monotonic time for the domain and its timer tasks. Tests swap in a clock that only
/// moves when told to.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
struct ManualTime {
    now: Mutex<Instant>,
    moved: Notify,
}

#[cfg(test)]
pub(crate) fn mocked_clock() -> (MockClock, MockClockController) {
    let time = Arc::new(ManualTime {
        now: Mutex::new(Instant::now()),
        moved: Notify::new(),
    });

    (MockClock { time: time.clone() }, MockClockController { time })
}

#[cfg(test)]
#[derive(Clone)]
pub(crate) struct MockClock {
    time: Arc<ManualTime>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.time.now.lock().unwrap()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        loop {
            // Registered before the check, so an advance in between is not missed.
            let moved = self.time.moved.notified();
            if self.now() >= deadline {
                return;
            }
            moved.await;
        }
    }
}

#[cfg(test)]
pub(crate) struct MockClockController {
    time: Arc<ManualTime>,
}

#[cfg(test)]
impl MockClockController {
    /// Sleepers whose deadline is now due wake up. Advance one interval at a time to observe
    /// every tick of a periodic task.
    pub(crate) fn advance(&mut self, duration: Duration) {
        *self.time.now.lock().unwrap() += duration;
        self.time.moved.notify_waiters();
    }
}
