use crate::cluster::{AgentError, ClusterDirectory, FenceAgent};
use crate::domain::NodeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Clone, Debug)]
struct ConfiguredNode {
    name: String,
    member: bool,
}

#[derive(Debug)]
struct DirectoryState {
    nodes: BTreeMap<NodeId, ConfiguredNode>,
    quorate: bool,
}

/// Cluster manager stand-in whose quorum and membership are set by hand.
#[derive(Clone)]
pub struct InMemoryDirectory {
    inner: Arc<Mutex<DirectoryState>>,
}

impl InMemoryDirectory {
    /// Every node starts as a quorate cluster member, named `node<id>`.
    pub fn with_nodes(ids: &[u32]) -> Self {
        let nodes = ids
            .iter()
            .map(|id| {
                let config = ConfiguredNode {
                    name: format!("node{}", id),
                    member: true,
                };
                (NodeId::new(*id), config)
            })
            .collect();
        InMemoryDirectory {
            inner: Arc::new(Mutex::new(DirectoryState { nodes, quorate: true })),
        }
    }

    pub fn add_node(&self, node_id: NodeId, name: &str, member: bool) {
        let config = ConfiguredNode {
            name: name.to_string(),
            member,
        };
        self.lock().nodes.insert(node_id, config);
    }

    pub fn set_member(&self, node_id: NodeId, member: bool) {
        if let Some(node) = self.lock().nodes.get_mut(&node_id) {
            node.member = member;
        }
    }

    pub fn set_quorate(&self, quorate: bool) {
        self.lock().quorate = quorate;
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ClusterDirectory for InMemoryDirectory {
    fn quorate(&self) -> bool {
        self.lock().quorate
    }

    fn node_name(&self, node_id: NodeId) -> String {
        self.lock()
            .nodes
            .get(&node_id)
            .map(|node| node.name.clone())
            .unwrap_or_else(|| format!("node{}", node_id))
    }

    fn is_member(&self, node_id: NodeId) -> bool {
        self.lock().nodes.get(&node_id).map(|node| node.member).unwrap_or(false)
    }

    fn configured_nodes(&self) -> Vec<NodeId> {
        self.lock().nodes.keys().copied().collect()
    }
}

#[derive(Debug, Default)]
struct AgentState {
    calls: Vec<NodeId>,
    failures: HashMap<NodeId, u32>,
}

/// Fence agent that records every call and succeeds unless told otherwise.
#[derive(Clone)]
pub struct InMemoryFenceAgent {
    inner: Arc<Mutex<AgentState>>,
    paused_tx: Arc<watch::Sender<bool>>,
    paused_rx: watch::Receiver<bool>,
}

impl Default for InMemoryFenceAgent {
    fn default() -> Self {
        let (paused_tx, paused_rx) = watch::channel(false);
        InMemoryFenceAgent {
            inner: Arc::default(),
            paused_tx: Arc::new(paused_tx),
            paused_rx,
        }
    }
}

impl InMemoryFenceAgent {
    pub fn new() -> Self {
        InMemoryFenceAgent::default()
    }

    /// The next `times` calls for `victim` fail.
    pub fn fail_next(&self, victim: NodeId, times: u32) {
        self.lock().failures.insert(victim, times);
    }

    /// Calls started while paused block until `resume()`.
    pub fn pause(&self) {
        let _ = self.paused_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.paused_tx.send(false);
    }

    pub fn calls(&self) -> Vec<NodeId> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, victim: NodeId) -> usize {
        self.lock().calls.iter().filter(|call| **call == victim).count()
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl FenceAgent for InMemoryFenceAgent {
    async fn fence(&self, victim: NodeId, _victim_name: &str) -> Result<(), AgentError> {
        self.lock().calls.push(victim);

        let mut paused = self.paused_rx.clone();
        loop {
            let is_paused = *paused.borrow();
            if !is_paused || paused.changed().await.is_err() {
                break;
            }
        }

        let mut state = self.lock();
        match state.failures.get_mut(&victim) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(AgentError::Failed(format!("injected failure for node {}", victim)))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[test]
    fn directory_tracks_quorum_and_members() {
        let directory = InMemoryDirectory::with_nodes(&[1, 2]);
        directory.add_node(NodeId::new(7), "spare", false);

        assert!(directory.quorate());
        assert_eq!(directory.node_name(NodeId::new(2)), "node2");
        assert_eq!(directory.node_name(NodeId::new(7)), "spare");
        assert_eq!(
            directory.configured_nodes(),
            vec![NodeId::new(1), NodeId::new(2), NodeId::new(7)]
        );
        assert!(!directory.is_member(NodeId::new(7)));

        directory.set_quorate(false);
        directory.set_member(NodeId::new(7), true);
        assert!(!directory.quorate());
        assert!(directory.is_member(NodeId::new(7)));
    }

    #[tokio::test]
    async fn agent_fails_as_told_then_succeeds() {
        let agent = InMemoryFenceAgent::new();
        let victim = NodeId::new(3);
        agent.fail_next(victim, 2);

        assert!(agent.fence(victim, "node3").await.is_err());
        assert!(agent.fence(victim, "node3").await.is_err());
        assert!(agent.fence(victim, "node3").await.is_ok());
        assert_eq!(agent.calls_for(victim), 3);
    }

    #[tokio::test]
    async fn paused_agent_blocks_until_resumed() {
        let agent = InMemoryFenceAgent::new();
        agent.pause();

        let task_agent = agent.clone();
        let call = tokio::spawn(async move { task_agent.fence(NodeId::new(3), "node3").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!call.is_finished());
        assert_eq!(agent.calls(), vec![NodeId::new(3)]);

        agent.resume();
        assert!(call.await.unwrap().is_ok());
    }
}
