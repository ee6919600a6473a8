use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Held by a timer handle. Dropping it closes the channel, which the paired task notices at its
/// next wake-up.
pub(crate) struct Stopper {
    _closed_on_drop: oneshot::Sender<()>,
}

pub(super) struct StopCheck {
    closed: oneshot::Receiver<()>,
}

impl StopCheck {
    pub(super) fn should_stop(&mut self) -> bool {
        matches!(self.closed.try_recv(), Err(TryRecvError::Closed))
    }
}

pub(super) fn new() -> (Stopper, StopCheck) {
    let (tx, rx) = oneshot::channel();
    (Stopper { _closed_on_drop: tx }, StopCheck { closed: rx })
}
