use std::convert::TryFrom;
use std::path::PathBuf;
use tokio::time::Duration;

pub const DEFAULT_OVERRIDE_PATH: &str = "/var/run/cluster/fenced_override";

#[derive(Clone, Debug, Default)]
pub struct FenceOptions {
    /// Compatibility with the old libgroup based daemons. Only the native mode is supported.
    pub groupd_compat: Option<bool>,
    /// Skip fencing nodes that were already gone when the domain formed.
    pub clean_start: Option<bool>,
    pub post_join_delay: Option<Duration>,
    pub post_fail_delay: Option<Duration>,
    pub override_time: Option<Duration>,
    pub override_path: Option<PathBuf>,
    pub tick_interval: Option<Duration>,
    pub override_poll_interval: Option<Duration>,
    pub retry_min_backoff: Option<Duration>,
    pub retry_max_backoff: Option<Duration>,
    pub actor_queue_depth: Option<usize>,
}

#[derive(Clone, Debug)]
pub(super) struct FenceOptionsValidated {
    pub clean_start: bool,
    pub post_join_delay: Duration,
    pub post_fail_delay: Duration,
    pub override_time: Duration,
    pub override_path: PathBuf,
    pub tick_interval: Duration,
    pub override_poll_interval: Duration,
    pub retry_min_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub actor_queue_depth: usize,
}

impl FenceOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.retry_min_backoff > self.retry_max_backoff {
            return Err("Retry minimum backoff must not exceed the maximum backoff");
        }
        if self.retry_min_backoff == Duration::from_millis(0) {
            return Err("Retry minimum backoff must be greater than zero");
        }
        if self.tick_interval == Duration::from_millis(0) {
            return Err("Tick interval must be greater than zero");
        }
        if self.override_poll_interval == Duration::from_millis(0) {
            return Err("Override poll interval must be greater than zero");
        }
        if self.actor_queue_depth == 0 {
            return Err("Actor queue depth must be greater than zero");
        }

        Ok(())
    }
}

impl TryFrom<FenceOptions> for FenceOptionsValidated {
    type Error = &'static str;

    fn try_from(options: FenceOptions) -> Result<Self, Self::Error> {
        if options.groupd_compat.unwrap_or(false) {
            return Err("libgroup compatibility mode is not supported");
        }

        let values = FenceOptionsValidated {
            clean_start: options.clean_start.unwrap_or(false),
            post_join_delay: options.post_join_delay.unwrap_or(Duration::from_secs(6)),
            post_fail_delay: options.post_fail_delay.unwrap_or(Duration::from_secs(0)),
            override_time: options.override_time.unwrap_or(Duration::from_secs(3)),
            override_path: options
                .override_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OVERRIDE_PATH)),
            tick_interval: options.tick_interval.unwrap_or(Duration::from_secs(1)),
            override_poll_interval: options.override_poll_interval.unwrap_or(Duration::from_secs(1)),
            retry_min_backoff: options.retry_min_backoff.unwrap_or(Duration::from_secs(1)),
            retry_max_backoff: options.retry_max_backoff.unwrap_or(Duration::from_secs(60)),
            actor_queue_depth: options.actor_queue_depth.unwrap_or(64),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = FenceOptionsValidated::try_from(FenceOptions::default()).unwrap();
        assert!(!options.clean_start);
        assert_eq!(options.post_join_delay, Duration::from_secs(6));
        assert_eq!(options.post_fail_delay, Duration::from_secs(0));
        assert_eq!(options.override_time, Duration::from_secs(3));
        assert_eq!(options.override_path, PathBuf::from("/var/run/cluster/fenced_override"));
        assert_eq!(options.retry_max_backoff, Duration::from_secs(60));
        assert_eq!(options.actor_queue_depth, 64);
    }

    #[test]
    fn groupd_compat_is_rejected() {
        let options = FenceOptions {
            groupd_compat: Some(true),
            ..FenceOptions::default()
        };
        assert!(FenceOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let options = FenceOptions {
            retry_min_backoff: Some(Duration::from_secs(10)),
            retry_max_backoff: Some(Duration::from_secs(5)),
            ..FenceOptions::default()
        };
        assert!(FenceOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let options = FenceOptions {
            tick_interval: Some(Duration::from_secs(0)),
            ..FenceOptions::default()
        };
        assert!(FenceOptionsValidated::try_from(options).is_err());

        let options = FenceOptions {
            actor_queue_depth: Some(0),
            ..FenceOptions::default()
        };
        assert!(FenceOptionsValidated::try_from(options).is_err());
    }
}
