use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use beehive_app::Message;
use beehive_base::{Cell, DedupWindow};
use beehive_net::NodeID;

use crate::wire::{ControlEntry, TransactionEntry, WriteOp};

#[derive(Clone, Debug)]
pub enum ApplyOutcome {
    TransactionCommitted {
        message_seq: u64,
        emits: Vec<(u64, Message)>,
    },
    /// `message_seq` had already been applied (the executor retried a
    /// proposal whose commit it never observed). No writes or emits
    /// happen a second time.
    AlreadyApplied { message_seq: u64 },
    TransactionAborted { message_seq: u64, reason: String },
    ControlApplied,
}

/// The per-bee replicated dictionary. Pure and synchronous: every method
/// is a deterministic function of its inputs and the current state, so
/// that replaying the same committed entries from the same starting
/// snapshot always reaches the same state.
#[derive(Default)]
pub struct BeeState {
    values: BTreeMap<Cell, (Vec<u8>, u64)>,
    owned_cells: BTreeSet<Cell>,
    followers: BTreeSet<NodeID>,
    dedup: DedupWindow,
    next_emit_seq: u64,
    quiesced: bool,
}

impl BeeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cell: &Cell) -> Option<(Vec<u8>, u64)> {
        self.values.get(cell).cloned()
    }

    pub fn owned_cells(&self) -> &BTreeSet<Cell> {
        &self.owned_cells
    }

    pub fn is_quiesced(&self) -> bool {
        self.quiesced
    }

    /// A full copy of the dictionary's current values, used by the
    /// executor to build a transaction's read-side view without holding
    /// the state lock for the duration of a (possibly slow) `rcv` call.
    pub fn snapshot_values(&self) -> BTreeMap<Cell, (Vec<u8>, u64)> {
        self.values.clone()
    }

    pub fn apply_transaction(&mut self, entry: TransactionEntry) -> ApplyOutcome {
        if self.dedup.check_and_record(entry.message_seq) {
            return ApplyOutcome::AlreadyApplied {
                message_seq: entry.message_seq,
            };
        }

        for (cell, expected_version) in &entry.reads {
            let actual_version = self.values.get(cell).map(|(_, v)| *v);
            if actual_version != *expected_version {
                return ApplyOutcome::TransactionAborted {
                    message_seq: entry.message_seq,
                    reason: format!("read set invalidated for cell {cell:?}"),
                };
            }
        }

        for op in entry.writes {
            match op {
                WriteOp::Put(cell, value) => {
                    let version = self.values.get(&cell).map(|(_, v)| v + 1).unwrap_or(1);
                    self.values.insert(cell, (value, version));
                }
                WriteOp::Del(cell) => {
                    self.values.remove(&cell);
                }
            }
        }

        let mut emits = Vec::with_capacity(entry.emits.len());
        for msg in entry.emits {
            let seq = self.next_emit_seq;
            self.next_emit_seq += 1;
            emits.push((seq, msg));
        }

        ApplyOutcome::TransactionCommitted {
            message_seq: entry.message_seq,
            emits,
        }
    }

    pub fn apply_control(&mut self, entry: ControlEntry) -> ApplyOutcome {
        match entry {
            ControlEntry::Quiesce => self.quiesced = true,
            ControlEntry::Unquiesce => self.quiesced = false,
            ControlEntry::AddFollower(node) => {
                self.followers.insert(node);
            }
            ControlEntry::RemoveFollower(node) => {
                self.followers.remove(&node);
            }
            ControlEntry::CellAdd(cell) => {
                self.owned_cells.insert(cell);
            }
            ControlEntry::SnapshotMarker => {}
        }
        ApplyOutcome::ControlApplied
    }

    pub fn followers(&self) -> &BTreeSet<NodeID> {
        &self.followers
    }
}

#[derive(Serialize, Deserialize)]
struct SerializedState {
    values: Vec<(Cell, Vec<u8>, u64)>,
    owned_cells: Vec<Cell>,
    followers: Vec<NodeID>,
    dedup: DedupWindow,
    next_emit_seq: u64,
    quiesced: bool,
}

impl BeeState {
    /// Serializes `(cells, per-cell versions, dedup window, outstanding
    /// emit sequence)` as a flat byte buffer suitable for
    /// wrapping in a [`beehive_consensus::Snapshot`].
    pub fn serialize(&self) -> Vec<u8> {
        let serialized = SerializedState {
            values: self
                .values
                .iter()
                .map(|(c, (v, ver))| (c.clone(), v.clone(), *ver))
                .collect(),
            owned_cells: self.owned_cells.iter().cloned().collect(),
            followers: self.followers.iter().cloned().collect(),
            dedup: self.dedup.clone(),
            next_emit_seq: self.next_emit_seq,
            quiesced: self.quiesced,
        };
        rmp_serde::to_vec(&serialized).expect("bee state always encodes")
    }

    pub fn install(&mut self, bytes: &[u8]) -> beehive_base::Result<()> {
        let serialized: SerializedState = rmp_serde::from_slice(bytes)?;
        self.values = serialized
            .values
            .into_iter()
            .map(|(c, v, ver)| (c, (v, ver)))
            .collect();
        self.owned_cells = serialized.owned_cells.into_iter().collect();
        self.followers = serialized.followers.into_iter().collect();
        self.dedup = serialized.dedup;
        self.next_emit_seq = serialized.next_emit_seq;
        self.quiesced = serialized.quiesced;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cell(key: &str) -> Cell {
        Cell::new("d", key.as_bytes().to_vec())
    }

    #[test]
    fn first_write_creates_version_one() {
        let mut state = BeeState::new();
        let outcome = state.apply_transaction(TransactionEntry {
            message_seq: 0,
            reads: vec![],
            writes: vec![WriteOp::Put(cell("k"), b"v".to_vec())],
            emits: vec![],
        });
        assert!(matches!(outcome, ApplyOutcome::TransactionCommitted { .. }));
        assert_eq!(state.get(&cell("k")), Some((b"v".to_vec(), 1)));
    }

    #[test]
    fn stale_read_set_aborts_without_mutating() {
        let mut state = BeeState::new();
        state.apply_transaction(TransactionEntry {
            message_seq: 0,
            reads: vec![],
            writes: vec![WriteOp::Put(cell("k"), b"v1".to_vec())],
            emits: vec![],
        });

        let outcome = state.apply_transaction(TransactionEntry {
            message_seq: 1,
            reads: vec![(cell("k"), Some(0))], // stale: actual version is 1
            writes: vec![WriteOp::Put(cell("k"), b"v2".to_vec())],
            emits: vec![],
        });
        assert!(matches!(outcome, ApplyOutcome::TransactionAborted { .. }));
        assert_eq!(state.get(&cell("k")), Some((b"v1".to_vec(), 1)));
    }

    #[test]
    fn duplicate_message_seq_is_not_reapplied() {
        let mut state = BeeState::new();
        let entry = TransactionEntry {
            message_seq: 7,
            reads: vec![],
            writes: vec![WriteOp::Put(cell("k"), b"v".to_vec())],
            emits: vec![],
        };
        state.apply_transaction(entry.clone());
        let outcome = state.apply_transaction(entry);
        assert!(matches!(outcome, ApplyOutcome::AlreadyApplied { message_seq: 7 }));
        // Still version 1, not re-incremented.
        assert_eq!(state.get(&cell("k")), Some((b"v".to_vec(), 1)));
    }

    #[test]
    fn snapshot_round_trip_preserves_state() {
        let mut state = BeeState::new();
        state.apply_transaction(TransactionEntry {
            message_seq: 0,
            reads: vec![],
            writes: vec![WriteOp::Put(cell("k"), b"v".to_vec())],
            emits: vec![],
        });
        state.apply_control(ControlEntry::CellAdd(cell("k")));

        let bytes = state.serialize();
        let mut restored = BeeState::new();
        restored.install(&bytes).unwrap();

        assert_eq!(restored.get(&cell("k")), Some((b"v".to_vec(), 1)));
        assert!(restored.owned_cells().contains(&cell("k")));
        // Replaying the same message_seq against the restored state is
        // recognized as a duplicate, same as it would be on the original.
        let outcome = restored.apply_transaction(TransactionEntry {
            message_seq: 0,
            reads: vec![],
            writes: vec![],
            emits: vec![],
        });
        assert!(matches!(outcome, ApplyOutcome::AlreadyApplied { .. }));
    }
}
