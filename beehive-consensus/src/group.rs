// The wrapper contract around whatever real consensus algorithm a
// deployment plugs in. This crate treats the algorithm itself
// as an external collaborator and a black box: it only pins down the shape
// every implementation must expose so the rest of the engine (registry,
// colony manager, router) can drive it uniformly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use beehive_base::Result;

use crate::framing::Snapshot;

pub type Term = u64;
pub type LogIndex = u64;

/// An entry this group has committed, handed to the application layer in
/// commit order. `kind` is opaque to this crate; callers agree on its
/// meaning (see `beehive-bee` for the entry kinds a colony actually uses).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommittedEntry {
    pub term: Term,
    pub index: LogIndex,
    pub kind: u8,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GroupRole {
    Leader,
    Follower,
    Candidate,
}

/// One member of a consensus group's configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MemberId(pub u64);

/// The replicated-log primitive a colony sits on top of. Every cell's
/// colony is backed by exactly one `ConsensusGroup`; the registry's own
/// mapping table is itself replicated through one of these groups.
///
/// Implementations decide internally how entries are persisted and how
/// elections happen; this crate does not mandate an algorithm. What it
/// requires: `propose` only returns `Ok` once the entry is durably
/// committed and has been or will be delivered via `committed()`, in the
/// same order, on every member.
#[async_trait]
pub trait ConsensusGroup: Send + Sync {
    /// Proposes an opaque entry. Returns the committed `(term, index)` once
    /// a majority has durably accepted it. Returns an error if this member
    /// is not (or is no longer) the leader — callers should treat that as a
    /// routing hint, not a fatal failure.
    async fn propose(&self, kind: u8, payload: Vec<u8>) -> Result<(Term, LogIndex)>;

    /// A linearizable read barrier: returns the index such that every entry
    /// up to and including it is guaranteed committed and locally
    /// observable, without itself appending to the log.
    async fn read_index(&self) -> Result<LogIndex>;

    /// Attempts to hand leadership to `target`. Best-effort: a successful
    /// return means the transfer was initiated, not that it completed.
    async fn transfer_leadership(&self, target: MemberId) -> Result<()>;

    async fn add_member(&self, member: MemberId) -> Result<()>;
    async fn remove_member(&self, member: MemberId) -> Result<()>;

    /// Installs a snapshot, short-circuiting log replay for members that
    /// fall too far behind.
    async fn snapshot_install(&self, snapshot: Snapshot) -> Result<()>;

    fn role(&self) -> GroupRole;
    fn current_term(&self) -> Term;

    /// Subscribes to the stream of entries as they commit, in commit order.
    /// Every subscriber receives the full sequence from the point of
    /// subscription, including entries proposed elsewhere. A slow
    /// subscriber that falls behind the broadcast's retained window
    /// observes `RecvError::Lagged` and should fall back to
    /// `snapshot_install`.
    fn committed(&self) -> broadcast::Receiver<CommittedEntry>;
}
