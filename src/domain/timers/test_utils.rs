use crate::actor::Event;
use crate::domain::NodeId;
use tokio::sync::mpsc;
use tokio::time::Duration;

/// Stands in for the domain actor: reads what a timer task sends to the actor queue.
pub(super) struct ActorProbe {
    rx: mpsc::Receiver<Event>,
}

impl ActorProbe {
    pub(super) fn new(rx: mpsc::Receiver<Event>) -> Self {
        ActorProbe { rx }
    }

    async fn next_event(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Timed out waiting for an actor event")
            .expect("Actor queue closed")
    }

    pub(super) async fn expect_tick(&mut self) {
        match self.next_event().await {
            Event::Tick => {}
            event => panic!("Expected tick, got {:?}", event),
        }
    }

    pub(super) async fn expect_override(&mut self, expected: NodeId) {
        match self.next_event().await {
            Event::Override(victim) => assert_eq!(victim, expected),
            event => panic!("Expected override of {}, got {:?}", expected, event),
        }
    }

    /// Nothing arrives within a short grace period. A closed queue counts as quiet.
    pub(super) async fn expect_quiet(&mut self) {
        if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(10), self.rx.recv()).await {
            panic!("Expected no event, got {:?}", event);
        }
    }
}
