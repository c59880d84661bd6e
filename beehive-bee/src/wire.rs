use serde::{Deserialize, Serialize};

use beehive_app::Message;
use beehive_base::Cell;
use beehive_net::NodeID;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BeeEntryKind {
    Transaction = 0,
    Control = 1,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WriteOp {
    Put(Cell, Vec<u8>),
    Del(Cell),
}

/// One committed handler invocation. `message_seq` is the
/// monotone per-bee sequence the executor assigns at proposal time; it is
/// what the dedup window tracks, not the message's own id, so that
/// redelivery of the same message under a different trace id is still
/// recognized as a replay of an already-applied transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub message_seq: u64,
    pub reads: Vec<(Cell, Option<u64>)>,
    pub writes: Vec<WriteOp>,
    pub emits: Vec<Message>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ControlEntry {
    Quiesce,
    Unquiesce,
    AddFollower(NodeID),
    RemoveFollower(NodeID),
    /// A cell newly bound to this bee by a registry transfer.
    CellAdd(Cell),
    SnapshotMarker,
}
