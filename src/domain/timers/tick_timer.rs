use crate::actor;
use crate::domain::timers::stop_signal;
use crate::domain::timers::time::{Clock, RealClock};
use tokio::time::{Duration, Instant};

/// Periodic nudge that lets the domain re-poll quorum and retry fence attempts whose delay or
/// backoff ran out. The task stops when the handle is dropped.
pub(crate) struct TickTimerHandle {
    _to_drop: stop_signal::Stopper,
}

struct TickTimerTask<C: Clock> {
    interval: Duration,
    actor_client: actor::WeakActorClient,
    clock: C,
    stop_check: stop_signal::StopCheck,
    // Fixed schedule from creation, so late wake-ups do not drift.
    next_wake: Instant,
}

impl TickTimerHandle {
    pub(crate) fn spawn_timer_task(interval: Duration, actor_client: actor::WeakActorClient) -> Self {
        let (task, handle) = TickTimerTask::new(interval, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> TickTimerTask<C> {
    fn new(interval: Duration, actor_client: actor::WeakActorClient, clock: C) -> (Self, TickTimerHandle) {
        let (stopper, stop_check) = stop_signal::new();

        let task = TickTimerTask {
            interval,
            actor_client,
            next_wake: clock.now(),
            clock,
            stop_check,
        };
        let handle = TickTimerHandle { _to_drop: stopper };

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            self.next_wake += self.interval;
            self.clock.sleep_until(self.next_wake).await;

            if self.stop_check.should_stop() {
                return;
            }
            if self.actor_client.tick().await.is_err() {
                // Actor has exited.
                return;
            }
        }
    }
}
