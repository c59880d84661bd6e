// Client-server and server-server networking. The core never opens a socket
// itself (the wire transport is an external collaborator); this
// crate only defines the envelope that crosses node boundaries and the
// `Transport` trait real transports implement. [`InMemoryTransport`] is a
// reference implementation used by tests and by single-process clusters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};

use beehive_base::{err, BeeId, Epoch, Result, TraceId, TypeTag};

/// A Realm is a single, coherent, distributed cluster. It is composed of a
/// set of Nodes, each of which has a unique NodeID.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeID(pub i64);

/// A message as it crosses a node boundary: the application payload plus
/// the routing metadata the receiving node needs to dispatch it (or to
/// detect that its own routing information is stale).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct WireMessage {
    pub src: NodeID,
    pub dst: NodeID,
    pub type_tag: TypeTag,
    pub payload: Vec<u8>,
    pub from_bee_id: Option<BeeId>,
    /// The emitting bee's per-bee emit sequence, carried alongside
    /// `from_bee_id` so a receiver can key per-`(source_bee, dest_bee)`
    /// FIFO delivery on the same `(bee_id, sequence)` pair the source
    /// assigned (see `beehive_app::Message::emitted_by`).
    pub from_seq: Option<u64>,
    pub trace_id: TraceId,
    /// The bee the sender believes owns this message's cells, and the
    /// epoch it last observed for that ownership. The receiver compares
    /// this against its own registry to detect `NotLeader`/`EpochStale`.
    pub target_bee: Option<BeeId>,
    pub target_epoch: Option<Epoch>,
}

pub fn encode_wire(msg: &WireMessage) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(msg)?)
}

pub fn decode_wire(buf: &[u8]) -> Result<WireMessage> {
    Ok(rmp_serde::from_slice(buf)?)
}

/// Point-to-point message delivery between nodes. The core consumes this;
/// it never implements a real transport.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_node(&self) -> NodeID;
    async fn send(&self, msg: WireMessage) -> Result<()>;
    /// Returns `None` once the transport has been shut down and will never
    /// produce another message.
    async fn recv(&self) -> Option<WireMessage>;
}

/// Shared switchboard backing a set of in-process [`InMemoryTransport`]
/// handles. Generalizes the lineage's per-node `IOQueues` (a pair of
/// `VecDeque`s keyed by peer) into a multi-node, async-aware registry: every
/// registered node gets an mpsc channel, and `send` looks up the
/// destination's sender the way the lineage's `Node::send_msg` pushed onto
/// an `outgoing` queue keyed by destination.
#[derive(Default)]
pub struct InMemorySwitchboard {
    nodes: RwLock<HashMap<NodeID, mpsc::UnboundedSender<WireMessage>>>,
}

impl InMemorySwitchboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a node and returns its transport handle. Re-registering an
    /// already-known node replaces its inbox (modeling a node restart).
    pub async fn register(self: &Arc<Self>, node: NodeID) -> InMemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.write().await.insert(node, tx);
        InMemoryTransport {
            switchboard: self.clone(),
            node,
            inbox: Mutex::new(rx),
        }
    }

    pub async fn unregister(&self, node: NodeID) {
        self.nodes.write().await.remove(&node);
    }
}

pub struct InMemoryTransport {
    switchboard: Arc<InMemorySwitchboard>,
    node: NodeID,
    inbox: Mutex<mpsc::UnboundedReceiver<WireMessage>>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn local_node(&self) -> NodeID {
        self.node
    }

    async fn send(&self, msg: WireMessage) -> Result<()> {
        let nodes = self.switchboard.nodes.read().await;
        match nodes.get(&msg.dst) {
            Some(tx) => tx
                .send(msg)
                .map_err(|_| err("destination node's inbox is closed")),
            None => Err(err("unknown destination node")),
        }
    }

    async fn recv(&self) -> Option<WireMessage> {
        let mut rx = self.inbox.lock().await;
        rx.recv().await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn msg(src: i64, dst: i64, payload: &str) -> WireMessage {
        WireMessage {
            src: NodeID(src),
            dst: NodeID(dst),
            type_tag: TypeTag::from("hello"),
            payload: payload.as_bytes().to_vec(),
            from_bee_id: None,
            from_seq: None,
            trace_id: TraceId(0),
            target_bee: None,
            target_epoch: None,
        }
    }

    #[test]
    fn wire_round_trip() {
        let m = msg(1, 2, "A");
        let bytes = encode_wire(&m).unwrap();
        let back = decode_wire(&bytes).unwrap();
        assert_eq!(m, back);
    }

    #[tokio::test]
    async fn delivers_point_to_point() {
        let sw = InMemorySwitchboard::new();
        let a = sw.register(NodeID(1)).await;
        let b = sw.register(NodeID(2)).await;

        a.send(msg(1, 2, "A")).await.unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got.payload, b"A");
        assert_eq!(got.src, NodeID(1));
    }

    #[tokio::test]
    async fn unknown_destination_errors() {
        let sw = InMemorySwitchboard::new();
        let a = sw.register(NodeID(1)).await;
        assert!(a.send(msg(1, 99, "X")).await.is_err());
    }
}
