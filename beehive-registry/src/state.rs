use std::collections::{BTreeMap, BTreeSet};

use beehive_base::{BeeId, Cell, Epoch};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Resolution {
    AllSame(BeeId),
    Split(BTreeMap<BeeId, Vec<Cell>>),
    Unowned(Vec<Cell>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct RegistryEntry {
    bee_id: BeeId,
    epoch: Epoch,
}

/// The registry's applied state: purely synchronous, deterministic
/// transitions over committed entries. No I/O, no async — the caller
/// drives this from the consensus group's applied stream.
pub struct RegistryState {
    cells: BTreeMap<Cell, RegistryEntry>,
    by_bee: BTreeMap<BeeId, BTreeSet<Cell>>,
    next_bee_id: u64,
}

impl RegistryState {
    pub fn new() -> Self {
        RegistryState {
            cells: BTreeMap::new(),
            by_bee: BTreeMap::new(),
            next_bee_id: 1,
        }
    }

    pub fn lookup(&self, cells: &[Cell]) -> Resolution {
        let mut owners: BTreeMap<BeeId, Vec<Cell>> = BTreeMap::new();
        let mut unowned = Vec::new();
        for c in cells {
            match self.cells.get(c) {
                Some(entry) => owners.entry(entry.bee_id).or_default().push(c.clone()),
                None => unowned.push(c.clone()),
            }
        }
        if !unowned.is_empty() && owners.is_empty() {
            return Resolution::Unowned(unowned);
        }
        if unowned.is_empty() && owners.len() == 1 {
            let (&bee_id, _) = owners.iter().next().unwrap();
            return Resolution::AllSame(bee_id);
        }
        // Either two-or-more distinct owners, or a mix of owned and
        // unowned cells: either way this cannot be served by one existing
        // bee without a prior claim, so it is a split.
        Resolution::Split(owners)
    }

    /// Applies a claim. On success, every cell is bound to a freshly
    /// allocated bee at epoch 0. On conflict, returns the current owners of
    /// whichever requested cells are already owned.
    pub fn claim(&mut self, cells: Vec<Cell>) -> Result<BeeId, BTreeMap<BeeId, Vec<Cell>>> {
        let mut conflicts: BTreeMap<BeeId, Vec<Cell>> = BTreeMap::new();
        for c in &cells {
            if let Some(entry) = self.cells.get(c) {
                conflicts.entry(entry.bee_id).or_default().push(c.clone());
            }
        }
        if !conflicts.is_empty() {
            return Err(conflicts);
        }

        let bee_id = BeeId(self.next_bee_id);
        self.next_bee_id += 1;

        let mut owned = BTreeSet::new();
        for c in cells {
            self.cells.insert(
                c.clone(),
                RegistryEntry {
                    bee_id,
                    epoch: Epoch(0),
                },
            );
            owned.insert(c);
        }
        self.by_bee.insert(bee_id, owned);
        Ok(bee_id)
    }

    /// Applies a transfer: every named cell must currently be owned by
    /// `from`. On success, every cell's epoch is bumped and rebound to
    /// `to`; returns the new epoch (uniform across the transferred set).
    pub fn transfer(
        &mut self,
        cells: Vec<Cell>,
        from: BeeId,
        to: BeeId,
    ) -> Result<Epoch, String> {
        for c in &cells {
            match self.cells.get(c) {
                Some(entry) if entry.bee_id == from => {}
                Some(entry) => {
                    return Err(format!(
                        "cell not owned by expected bee: owned by {:?}, expected {from:?}",
                        entry.bee_id
                    ))
                }
                None => return Err("cell has no owner to transfer from".to_string()),
            }
        }

        let new_epoch = cells
            .iter()
            .filter_map(|c| self.cells.get(c).map(|e| e.epoch.0))
            .max()
            .map(|e| Epoch(e + 1))
            .unwrap_or(Epoch(1));

        for c in cells {
            self.cells.insert(
                c.clone(),
                RegistryEntry {
                    bee_id: to,
                    epoch: new_epoch,
                },
            );
            if let Some(set) = self.by_bee.get_mut(&from) {
                set.remove(&c);
            }
            self.by_bee.entry(to).or_default().insert(c);
        }
        Ok(new_epoch)
    }

    /// Applies a release: removes every cell owned by `bee_id`.
    pub fn release(&mut self, bee_id: BeeId) {
        if let Some(cells) = self.by_bee.remove(&bee_id) {
            for c in cells {
                self.cells.remove(&c);
            }
        }
    }
}
