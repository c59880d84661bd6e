// The cell registry. A replicated mapping `cell -> (bee_id, epoch)` plus
// the reverse index `bee_id -> cells`, mutated only by entries committed
// through the cluster consensus group and read locally against the latest
// applied state.

mod state;
mod wire;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use beehive_base::{BeeId, Cell, Epoch};
use beehive_consensus::{ConsensusGroup, LogIndex};

pub use state::Resolution;
use state::RegistryState;
use wire::{ClaimRequest, EntryKind, ReleaseRequest, TransferRequest};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegistryError {
    /// `claim` lost: some of the requested cells are already owned. Carries
    /// the current owner of each conflicting cell so the caller can
    /// re-route via `lookup` without another round trip.
    Conflict(BTreeMap<BeeId, Vec<Cell>>),
    /// `transfer`/`release` named a cell or bee that does not match the
    /// registry's current state.
    NotOwned(String),
    /// The proposal never committed (not leader, transport failure, ...).
    Proposal(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Conflict(_) => write!(f, "registry: conflicting claim"),
            RegistryError::NotOwned(s) => write!(f, "registry: not owned: {s}"),
            RegistryError::Proposal(s) => write!(f, "registry: proposal failed: {s}"),
        }
    }
}
impl std::error::Error for RegistryError {}

/// One outcome of applying a single registry entry, delivered to whichever
/// caller proposed it (if any — entries proposed by other nodes are
/// applied the same way but have no local waiter).
#[derive(Clone, Debug)]
enum Outcome {
    Claimed(BeeId),
    Conflict(BTreeMap<BeeId, Vec<Cell>>),
    Transferred(Epoch),
    NotOwned(String),
    Released,
}

#[derive(Clone)]
struct AppliedEntry {
    index: LogIndex,
    outcome: Outcome,
}

pub struct CellRegistry {
    group: Arc<dyn ConsensusGroup>,
    state: Arc<RwLock<RegistryState>>,
    applied_tx: broadcast::Sender<AppliedEntry>,
}

const APPLIED_CHANNEL_CAPACITY: usize = 1024;

impl CellRegistry {
    /// Constructs a registry over `group` and spawns the task that applies
    /// its committed stream. The task runs for the lifetime of the returned
    /// `Arc` plus however long any clone of it is alive, since it holds a
    /// subscription, not an owning reference, to `group`.
    pub fn new(group: Arc<dyn ConsensusGroup>) -> Arc<Self> {
        let (applied_tx, _rx) = broadcast::channel(APPLIED_CHANNEL_CAPACITY);
        let registry = Arc::new(CellRegistry {
            group: group.clone(),
            state: Arc::new(RwLock::new(RegistryState::new())),
            applied_tx,
        });
        registry.clone().spawn_apply_loop();
        registry
    }

    fn spawn_apply_loop(self: Arc<Self>) {
        let mut committed = self.group.committed();
        tokio::spawn(async move {
            loop {
                let entry = match committed.recv().await {
                    Ok(entry) => entry,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "registry apply loop lagged, entries skipped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let outcome = {
                    let mut state = self.state.write().await;
                    apply_one(&mut state, entry.kind, &entry.payload)
                };
                info!(index = entry.index, "registry applied entry");
                let _ = self.applied_tx.send(AppliedEntry {
                    index: entry.index,
                    outcome,
                });
            }
        });
    }

    /// Purely local read against the latest applied state.
    pub async fn lookup(&self, cells: &[Cell]) -> Resolution {
        self.state.read().await.lookup(cells)
    }

    pub async fn claim(&self, cells: Vec<Cell>) -> Result<BeeId, RegistryError> {
        let mut applied_rx = self.applied_tx.subscribe();
        let payload =
            rmp_serde::to_vec(&ClaimRequest { cells }).expect("ClaimRequest always encodes");
        let (_term, index) = self
            .group
            .propose(EntryKind::Claim as u8, payload)
            .await
            .map_err(|e| RegistryError::Proposal(e.to_string()))?;
        match wait_for(&mut applied_rx, index).await {
            Outcome::Claimed(bee_id) => Ok(bee_id),
            Outcome::Conflict(split) => Err(RegistryError::Conflict(split)),
            other => unreachable!("claim entry applied to unexpected outcome: {other:?}"),
        }
    }

    pub async fn transfer(
        &self,
        cells: Vec<Cell>,
        from: BeeId,
        to: BeeId,
    ) -> Result<Epoch, RegistryError> {
        let mut applied_rx = self.applied_tx.subscribe();
        let payload = rmp_serde::to_vec(&TransferRequest { cells, from, to })
            .expect("TransferRequest always encodes");
        let (_term, index) = self
            .group
            .propose(EntryKind::Transfer as u8, payload)
            .await
            .map_err(|e| RegistryError::Proposal(e.to_string()))?;
        match wait_for(&mut applied_rx, index).await {
            Outcome::Transferred(epoch) => Ok(epoch),
            Outcome::NotOwned(s) => Err(RegistryError::NotOwned(s)),
            other => unreachable!("transfer entry applied to unexpected outcome: {other:?}"),
        }
    }

    pub async fn release(&self, bee_id: BeeId) -> Result<(), RegistryError> {
        let mut applied_rx = self.applied_tx.subscribe();
        let payload =
            rmp_serde::to_vec(&ReleaseRequest { bee_id }).expect("ReleaseRequest always encodes");
        let (_term, index) = self
            .group
            .propose(EntryKind::Release as u8, payload)
            .await
            .map_err(|e| RegistryError::Proposal(e.to_string()))?;
        match wait_for(&mut applied_rx, index).await {
            Outcome::Released => Ok(()),
            other => unreachable!("release entry applied to unexpected outcome: {other:?}"),
        }
    }
}

async fn wait_for(rx: &mut broadcast::Receiver<AppliedEntry>, index: LogIndex) -> Outcome {
    loop {
        match rx.recv().await {
            Ok(entry) if entry.index == index => return entry.outcome,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                panic!("registry apply loop exited while a proposal was still pending")
            }
        }
    }
}

fn apply_one(state: &mut RegistryState, kind: u8, payload: &[u8]) -> Outcome {
    if kind == EntryKind::Claim as u8 {
        let req: ClaimRequest = rmp_serde::from_slice(payload).expect("well-formed claim entry");
        match state.claim(req.cells) {
            Ok(bee_id) => Outcome::Claimed(bee_id),
            Err(split) => Outcome::Conflict(split),
        }
    } else if kind == EntryKind::Transfer as u8 {
        let req: TransferRequest =
            rmp_serde::from_slice(payload).expect("well-formed transfer entry");
        match state.transfer(req.cells, req.from, req.to) {
            Ok(epoch) => Outcome::Transferred(epoch),
            Err(msg) => Outcome::NotOwned(msg),
        }
    } else if kind == EntryKind::Release as u8 {
        let req: ReleaseRequest =
            rmp_serde::from_slice(payload).expect("well-formed release entry");
        state.release(req.bee_id);
        Outcome::Released
    } else {
        panic!("registry applier received unknown entry kind {kind}")
    }
}
