// The bee state machine and the colony manager that maintains its replica
// set.
//
// A `Bee` wraps one colony's `ConsensusGroup` the same way `CellRegistry`
// wraps the cluster group: committed entries are applied by a single
// background task, and callers that proposed an entry wait for its
// `(index, outcome)` on a broadcast channel keyed by index. The difference
// from the registry is the entry vocabulary (`TransactionEntry`/
// `ControlEntry` instead of claim/transfer/release) and that reads never
// suspend: dictionary reads are served in-memory and never block on consensus.

mod colony;
mod state;
mod wire;

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use beehive_base::{BeeId, Cell};
use beehive_consensus::{decode_snapshot, encode_snapshot, ConsensusGroup, LogIndex, Snapshot};

pub use colony::{Colony, ColonyManager, RepairAction};
pub use state::ApplyOutcome;
use state::BeeState;
pub use wire::{BeeEntryKind, ControlEntry, TransactionEntry, WriteOp};

const APPLIED_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
struct Applied {
    index: LogIndex,
    outcome: ApplyOutcome,
}

/// The per-bee replicated state machine driving one colony's consensus
/// group. Exclusively owned and mutated by committed entries; the executor
/// (`beehive-exec`) is the only caller that proposes transactions, but
/// `get` is exposed directly since reads never suspend.
pub struct Bee {
    id: BeeId,
    group: Arc<dyn ConsensusGroup>,
    state: Arc<RwLock<BeeState>>,
    applied_tx: broadcast::Sender<Applied>,
}

impl Bee {
    /// Constructs a bee over `group` and spawns the task applying its
    /// committed stream. `group` must be the dedicated consensus group for
    /// this bee's colony, not the cluster group.
    pub fn new(id: BeeId, group: Arc<dyn ConsensusGroup>) -> Arc<Self> {
        let (applied_tx, _rx) = broadcast::channel(APPLIED_CHANNEL_CAPACITY);
        let bee = Arc::new(Bee {
            id,
            group,
            state: Arc::new(RwLock::new(BeeState::new())),
            applied_tx,
        });
        bee.clone().spawn_apply_loop();
        bee
    }

    pub fn id(&self) -> BeeId {
        self.id
    }

    fn spawn_apply_loop(self: Arc<Self>) {
        let mut committed = self.group.committed();
        tokio::spawn(async move {
            loop {
                let entry = match committed.recv().await {
                    Ok(entry) => entry,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(bee_id = self.id.0, skipped = n, "bee apply loop lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let outcome = {
                    let mut state = self.state.write().await;
                    if entry.kind == BeeEntryKind::Transaction as u8 {
                        let txn: TransactionEntry = rmp_serde::from_slice(&entry.payload)
                            .expect("well-formed transaction entry");
                        state.apply_transaction(txn)
                    } else if entry.kind == BeeEntryKind::Control as u8 {
                        let ctrl: ControlEntry = rmp_serde::from_slice(&entry.payload)
                            .expect("well-formed control entry");
                        state.apply_control(ctrl)
                    } else {
                        panic!("bee applier received unknown entry kind {}", entry.kind)
                    }
                };
                info!(bee_id = self.id.0, index = entry.index, "bee applied entry");
                let _ = self.applied_tx.send(Applied {
                    index: entry.index,
                    outcome,
                });
            }
        });
    }

    /// A purely local, non-suspending read. Reflects the latest
    /// applied entry, which may lag a concurrently in-flight proposal.
    pub async fn get(&self, cell: &Cell) -> Option<(Vec<u8>, u64)> {
        self.state.read().await.get(cell)
    }

    pub async fn owned_cells(&self) -> std::collections::BTreeSet<Cell> {
        self.state.read().await.owned_cells().clone()
    }

    /// A full copy of the dictionary's current values. The snapshot itself
    /// is cheap and taken once per handler invocation so `rcv` reads a
    /// single consistent view for its whole run.
    pub async fn snapshot_values(&self) -> std::collections::BTreeMap<Cell, (Vec<u8>, u64)> {
        self.state.read().await.snapshot_values()
    }

    pub async fn is_quiesced(&self) -> bool {
        self.state.read().await.is_quiesced()
    }

    /// Proposes a transaction entry and awaits its applied outcome. Emits
    /// are released to the router only after the entry is committed. The
    /// caller (the executor) is responsible for turning `TransactionAborted`
    /// into a bounded retry.
    pub async fn propose_transaction(&self, entry: TransactionEntry) -> beehive_base::Result<ApplyOutcome> {
        let mut rx = self.applied_tx.subscribe();
        let payload = rmp_serde::to_vec(&entry).expect("TransactionEntry always encodes");
        let (_term, index) = self.group.propose(BeeEntryKind::Transaction as u8, payload).await?;
        Ok(wait_for(&mut rx, index).await)
    }

    pub async fn propose_control(&self, entry: ControlEntry) -> beehive_base::Result<()> {
        let mut rx = self.applied_tx.subscribe();
        let payload = rmp_serde::to_vec(&entry).expect("ControlEntry always encodes");
        let (_term, index) = self.group.propose(BeeEntryKind::Control as u8, payload).await?;
        wait_for(&mut rx, index).await;
        Ok(())
    }

    /// Serializes `(cells, per-cell versions, dedup window, outstanding
    /// emit sequence)` as a `beehive_consensus::Snapshot` tagged with the
    /// group's current committed index/term.
    pub async fn snapshot(&self) -> beehive_base::Result<Vec<u8>> {
        let index = self.group.read_index().await?;
        let term = self.group.current_term();
        let state = self.state.read().await.serialize();
        Ok(encode_snapshot(&Snapshot { index, term, state }))
    }

    pub async fn install_snapshot(&self, bytes: &[u8]) -> beehive_base::Result<()> {
        let snapshot = decode_snapshot(bytes)?;
        self.state.write().await.install(&snapshot.state)?;
        self.group.snapshot_install(snapshot).await
    }
}

async fn wait_for(rx: &mut broadcast::Receiver<Applied>, index: LogIndex) -> ApplyOutcome {
    loop {
        match rx.recv().await {
            Ok(entry) if entry.index == index => return entry.outcome,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                panic!("bee apply loop exited while a proposal was still pending")
            }
        }
    }
}
