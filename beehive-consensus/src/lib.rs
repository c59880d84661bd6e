// The consensus wrapper. The real consensus algorithm — Raft, Paxos, or
// otherwise — is an external collaborator this crate never implements; it
// only pins down the `ConsensusGroup` contract every colony (in
// `beehive-bee`) drives uniformly, the on-disk framing for log entries and
// snapshots, and a single-node reference implementation used by tests.

mod framing;
mod group;
mod local;

pub use framing::{
    decode_entry, decode_snapshot, encode_entry, encode_snapshot, FramedEntry, Snapshot,
};
pub use group::{CommittedEntry, ConsensusGroup, GroupRole, LogIndex, MemberId, Term};
pub use local::LocalConsensusGroup;
