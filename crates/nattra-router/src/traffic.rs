//! Traffic tracker
//!
//! Per-destination FIFO queues of application messages waiting for a
//! connection attempt, and the header rewrite applied to messages that
//! travel over an established connection.

use crate::message::{AppMessage, Connection};
use nattra_core::{Datagram, MappingPolicy, NodeId, Payload, PeerAddress};
use std::collections::{HashMap, HashSet, VecDeque};

/// Pending message queues
#[derive(Debug)]
pub struct TrafficTracker {
    queues: HashMap<NodeId, VecDeque<AppMessage>>,
    max_pending: usize,
    warned_mapping: HashSet<NodeId>,
}

impl TrafficTracker {
    /// Create a tracker buffering at most `max_pending` messages per node
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_pending,
            warned_mapping: HashSet::new(),
        }
    }

    /// Buffer a message; returns it back if the queue is full
    pub fn enqueue(&mut self, msg: AppMessage) -> Result<usize, AppMessage> {
        let queue = self.queues.entry(msg.dst.id()).or_default();
        if queue.len() >= self.max_pending {
            return Err(msg);
        }
        queue.push_back(msg);
        Ok(queue.len())
    }

    /// True if a queue exists for `id`
    #[must_use]
    pub fn has_queue(&self, id: NodeId) -> bool {
        self.queues.contains_key(&id)
    }

    /// Number of messages buffered for `id`
    #[must_use]
    pub fn queued(&self, id: NodeId) -> usize {
        self.queues.get(&id).map_or(0, VecDeque::len)
    }

    /// Remove and return the queue for `id`, oldest first
    pub fn take(&mut self, id: NodeId) -> VecDeque<AppMessage> {
        self.queues.remove(&id).unwrap_or_default()
    }

    /// Datagram carrying `msg` over `connection`
    ///
    /// The header is rewritten to the connection's address pair. A node whose
    /// own mapping is not endpoint independent may reach the peer through a
    /// different public mapping than the one the connection was opened with;
    /// this is reported once per destination and the rewrite still applies.
    pub fn rewrite(
        &mut self,
        self_peer: &PeerAddress,
        connection: &Connection,
        msg: AppMessage,
    ) -> Datagram {
        let mapping = self_peer.nat.behavior().map(|b| b.mapping);
        if let Some(mapping) = mapping {
            if mapping != MappingPolicy::EndpointIndependent
                && self.warned_mapping.insert(connection.remote_id())
            {
                tracing::warn!(
                    "Rewriting traffic to {} with {:?} mapping, delivery is best effort",
                    connection.remote,
                    mapping
                );
            }
        }

        Datagram::new(
            connection.local,
            connection.remote,
            Payload::Application(msg.payload),
        )
    }

    /// Datagram carrying `msg` with its header untouched
    #[must_use]
    pub fn passthrough(msg: AppMessage) -> Datagram {
        Datagram::new(msg.src, msg.dst.base, Payload::Application(msg.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nattra_core::{
        Address, AllocationPolicy, FilteringPolicy, NatBehavior, NatDescriptor,
    };

    fn addr(s: &str, id: u64) -> Address {
        Address::new(s.parse().unwrap(), NodeId(id))
    }

    fn msg(dst: u64, payload: &[u8]) -> AppMessage {
        AppMessage::udp(
            addr("10.0.0.1:4000", 1),
            PeerAddress::new(addr("10.0.0.2:4000", dst), NatDescriptor::Open),
            payload.to_vec(),
        )
    }

    #[test]
    fn test_fifo_queue() {
        let mut t = TrafficTracker::new(8);
        t.enqueue(msg(2, b"m1")).unwrap();
        t.enqueue(msg(2, b"m2")).unwrap();
        assert_eq!(t.enqueue(msg(2, b"m3")), Ok(3));

        let drained: Vec<Vec<u8>> = t.take(NodeId(2)).into_iter().map(|m| m.payload).collect();
        assert_eq!(drained, vec![b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()]);
        assert!(!t.has_queue(NodeId(2)));
    }

    #[test]
    fn test_queue_bound() {
        let mut t = TrafficTracker::new(1);
        t.enqueue(msg(2, b"m1")).unwrap();
        assert!(t.enqueue(msg(2, b"m2")).is_err());
        assert_eq!(t.queued(NodeId(2)), 1);
    }

    #[test]
    fn test_rewrite_uses_connection_pair() {
        let mut t = TrafficTracker::new(8);
        let me = PeerAddress::new(
            addr("10.0.0.1:4000", 1),
            NatDescriptor::Nated(NatBehavior::new(
                MappingPolicy::PortDependent,
                AllocationPolicy::Random,
                FilteringPolicy::PortDependent,
            )),
        );
        let connection = Connection {
            local: addr("10.0.0.1:4000", 1),
            remote: addr("203.0.113.2:6100", 2),
            initiator: true,
        };

        let d = t.rewrite(&me, &connection, msg(2, b"hi"));
        assert_eq!(d.src, connection.local);
        assert_eq!(d.dst, connection.remote);
        assert_eq!(d.payload, Payload::Application(b"hi".to_vec()));

        // warned once, still rewritten
        t.rewrite(&me, &connection, msg(2, b"again"));
        assert_eq!(t.warned_mapping.len(), 1);
    }
}
