mod override_watcher;
mod stop_signal;
#[cfg(test)]
mod test_utils;
mod tick_timer;
mod time;

pub(crate) use override_watcher::OverrideWatcherHandle;
pub(crate) use tick_timer::TickTimerHandle;
pub(crate) use time::Clock;
pub(crate) use time::RealClock;

#[cfg(test)]
pub(crate) use time::{mocked_clock, MockClock, MockClockController};
