use crate::domain::NodeId;
use crate::group::{GroupEvent, GroupReceiver, GroupSender, GroupTransport, MembershipEvent, TransportError};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

// A single lock around every group gives all members one total order of views and messages,
// which is the virtual synchrony the domain relies on.
//
// To run across processes, put a real group communication system behind `GroupTransport`.
#[derive(Clone, Default)]
pub struct InMemoryGroupHub {
    inner: Arc<Mutex<HashMap<String, GroupMembers>>>,
}

#[derive(Default)]
struct GroupMembers {
    members: BTreeMap<NodeId, mpsc::UnboundedSender<GroupEvent>>,
}

impl GroupMembers {
    fn view(&self, joined: BTreeSet<NodeId>, left: BTreeSet<NodeId>) -> GroupEvent {
        GroupEvent::Membership(MembershipEvent {
            members: self.members.keys().copied().collect(),
            joined,
            left,
        })
    }

    fn deliver(&self, event: &GroupEvent) {
        for tx in self.members.values() {
            // Receivers that were dropped have stopped listening.
            let _ = tx.send(event.clone());
        }
    }
}

impl InMemoryGroupHub {
    pub fn new() -> Self {
        InMemoryGroupHub::default()
    }

    pub fn join_node(
        &self,
        group: &str,
        node_id: NodeId,
    ) -> Result<(InMemorySender, InMemoryReceiver), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut groups = self.lock();
        let members = groups.entry(group.to_string()).or_default();
        if members.members.contains_key(&node_id) {
            return Err(TransportError::AlreadyJoined {
                group: group.to_string(),
                node: node_id,
            });
        }
        members.members.insert(node_id, tx);
        let view = members.view(std::iter::once(node_id).collect(), BTreeSet::new());
        members.deliver(&view);

        let sender = InMemorySender {
            hub: self.clone(),
            group: group.to_string(),
            node_id,
        };
        let receiver = InMemoryReceiver { receiver: rx };
        Ok((sender, receiver))
    }

    /// Simulates a crash: the node disappears from the group without leaving cleanly.
    pub fn fail_node(&self, group: &str, node_id: NodeId) -> Result<(), TransportError> {
        self.remove(group, node_id, false)
    }

    pub fn members(&self, group: &str) -> BTreeSet<NodeId> {
        self.lock()
            .get(group)
            .map(|members| members.members.keys().copied().collect())
            .unwrap_or_default()
    }

    fn remove(&self, group: &str, node_id: NodeId, clean: bool) -> Result<(), TransportError> {
        let mut groups = self.lock();
        let members = match groups.get_mut(group) {
            Some(members) => members,
            None => return Err(not_member(group, node_id)),
        };
        let removed_tx = match members.members.remove(&node_id) {
            Some(tx) => tx,
            None => return Err(not_member(group, node_id)),
        };

        let left = if clean {
            std::iter::once(node_id).collect()
        } else {
            BTreeSet::new()
        };
        let view = members.view(BTreeSet::new(), left);
        members.deliver(&view);
        if clean {
            // The leaver sees itself leave, then its receiver ends.
            let _ = removed_tx.send(view);
        }

        if members.members.is_empty() {
            groups.remove(group);
        }
        Ok(())
    }

    fn broadcast(&self, group: &str, sender: NodeId, payload: Bytes) -> Result<(), TransportError> {
        let groups = self.lock();
        match groups.get(group) {
            Some(members) if members.members.contains_key(&sender) => {
                members.deliver(&GroupEvent::Message { sender, payload });
                Ok(())
            }
            _ => Err(not_member(group, sender)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, GroupMembers>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn not_member(group: &str, node_id: NodeId) -> TransportError {
    TransportError::NotMember {
        group: group.to_string(),
        node: node_id,
    }
}

impl GroupTransport for InMemoryGroupHub {
    fn join(
        &self,
        group: &str,
        node_id: NodeId,
    ) -> Result<(Box<dyn GroupSender>, Box<dyn GroupReceiver>), TransportError> {
        let (sender, receiver) = self.join_node(group, node_id)?;
        Ok((Box::new(sender), Box::new(receiver)))
    }
}

pub struct InMemorySender {
    hub: InMemoryGroupHub,
    group: String,
    node_id: NodeId,
}

impl GroupSender for InMemorySender {
    fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.hub.broadcast(&self.group, self.node_id, payload)
    }

    fn leave(&self) -> Result<(), TransportError> {
        self.hub.remove(&self.group, self.node_id, true)
    }
}

pub struct InMemoryReceiver {
    receiver: mpsc::UnboundedReceiver<GroupEvent>,
}

impl InMemoryReceiver {
    /// Non-blocking variant of `next()`.
    pub fn try_next(&mut self) -> Option<GroupEvent> {
        self.receiver.try_recv().ok()
    }
}

#[async_trait::async_trait]
impl GroupReceiver for InMemoryReceiver {
    async fn next(&mut self) -> Option<GroupEvent> {
        self.receiver.recv().await
    }
}
