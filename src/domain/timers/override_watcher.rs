use crate::actor;
use crate::domain::timers::stop_signal;
use crate::domain::timers::time::{Clock, RealClock};
use crate::domain::NodeId;
use std::io;
use std::path::{Path, PathBuf};
use tokio::time::{Duration, Instant};

/// Watches the override file. An administrator who has manually isolated a node writes its id
/// there (whitespace separated ids are fine); every id read is handed to the domain once and the
/// file is removed.
pub(crate) struct OverrideWatcherHandle {
    _to_drop: stop_signal::Stopper,
}

struct OverrideWatcherTask<C: Clock> {
    logger: slog::Logger,
    path: PathBuf,
    interval: Duration,
    actor_client: actor::WeakActorClient,
    clock: C,
    stop_check: stop_signal::StopCheck,
    // Fixed schedule from creation, so late wake-ups do not drift.
    next_wake: Instant,
}

impl OverrideWatcherHandle {
    pub(crate) fn spawn_watcher_task(
        logger: slog::Logger,
        path: PathBuf,
        interval: Duration,
        actor_client: actor::WeakActorClient,
    ) -> Self {
        let (task, handle) = OverrideWatcherTask::new(logger, path, interval, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> OverrideWatcherTask<C> {
    fn new(
        logger: slog::Logger,
        path: PathBuf,
        interval: Duration,
        actor_client: actor::WeakActorClient,
        clock: C,
    ) -> (Self, OverrideWatcherHandle) {
        let (stopper, stop_check) = stop_signal::new();

        let task = OverrideWatcherTask {
            logger,
            path,
            interval,
            actor_client,
            next_wake: clock.now(),
            clock,
            stop_check,
        };
        let handle = OverrideWatcherHandle { _to_drop: stopper };

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            self.next_wake += self.interval;
            self.clock.sleep_until(self.next_wake).await;
            if self.stop_check.should_stop() {
                return;
            }

            let contents = match consume_override_file(&self.path).await {
                Ok(Some(contents)) => contents,
                Ok(None) => continue,
                Err(e) => {
                    slog::warn!(self.logger, "Failed to read override file {:?}: {}", self.path, e);
                    continue;
                }
            };

            let (victims, invalid) = parse_override(&contents);
            for token in invalid {
                slog::warn!(self.logger, "Ignoring invalid node id {:?} in override file", token);
            }
            for victim in victims {
                slog::info!(self.logger, "Override requested for node {}", victim);
                if self.actor_client.override_signal(victim).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn consume_override_file(path: &Path) -> io::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            tokio::fs::remove_file(path).await?;
            Ok(Some(contents))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn parse_override(contents: &str) -> (Vec<NodeId>, Vec<String>) {
    let mut victims = Vec::new();
    let mut invalid = Vec::new();
    for token in contents.split_whitespace() {
        match token.parse::<u32>() {
            Ok(id) if id != 0 => victims.push(NodeId::new(id)),
            _ => invalid.push(token.to_string()),
        }
    }
    (victims, invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::domain::timers::test_utils::ActorProbe;
    use crate::domain::timers::time;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn temp_override_path() -> PathBuf {
        std::env::temp_dir().join(format!(
            "fenced_override_test_{}_{}",
            std::process::id(),
            rand::random::<u32>()
        ))
    }

    #[test]
    fn parses_ids_and_reports_garbage() {
        let (victims, invalid) = parse_override("3\n 5  abc 0\n");
        assert_eq!(victims, vec![NodeId::new(3), NodeId::new(5)]);
        assert_eq!(invalid, vec!["abc".to_string(), "0".to_string()]);
    }

    #[tokio::test]
    async fn override_file_is_consumed_once() {
        // -- setup --
        let interval = Duration::from_millis(100);
        let path = temp_override_path();
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = ActorProbe::new(rx);
        let (mock_clock, mut mock_clock_controller) = time::mocked_clock();

        let (task, _handle) = OverrideWatcherTask::new(
            test_logger(),
            path.clone(),
            interval,
            strong_actor_client.weak(),
            mock_clock,
        );
        tokio::task::spawn(task.run());

        // -- execute & verify --
        // Nothing to read yet.
        mock_clock_controller.advance(interval);
        actor.expect_quiet().await;

        std::fs::write(&path, "3 4\n").unwrap();
        mock_clock_controller.advance(interval);
        actor.expect_override(NodeId::new(3)).await;
        actor.expect_override(NodeId::new(4)).await;
        assert!(!path.exists());

        mock_clock_controller.advance(interval);
        actor.expect_quiet().await;
    }

    #[tokio::test]
    async fn override_watcher_handle_drop() {
        let interval = Duration::from_millis(100);
        let path = temp_override_path();
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = ActorProbe::new(rx);
        let (mock_clock, mut mock_clock_controller) = time::mocked_clock();

        let (task, handle) = OverrideWatcherTask::new(
            test_logger(),
            path.clone(),
            interval,
            strong_actor_client.weak(),
            mock_clock,
        );
        let task_join_handle = tokio::task::spawn(task.run());
        drop(handle);

        std::fs::write(&path, "3\n").unwrap();
        mock_clock_controller.advance(interval);
        task_join_handle.await.unwrap();
        actor.expect_quiet().await;

        // Left untouched for whoever runs next.
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();
    }
}
