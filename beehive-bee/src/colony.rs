// The colony manager. A colony is the replica set backing one bee: for a
// bee with replication factor `r`, `r` nodes run the bee's state machine
// through a dedicated consensus group, with exactly one replica acting as
// leader.
//
// This module tracks colony membership only; it does not itself run a
// consensus group (that is `beehive-consensus`) and does not itself decide
// *which* nodes to prefer beyond the simple "avoid already-loaded nodes"
// heuristic. The harder placement optimization lives in `beehive-failover`
// and calls back into this manager.

use std::collections::{BTreeMap, BTreeSet};

use beehive_base::BeeId;
use beehive_net::NodeID;

/// One bee's replica set. `leader` is a cached belief, not an authority:
/// the consensus group backing the colony is the actual source of truth
/// for who currently holds leadership: the consensus wrapper elects a new
/// leader among survivors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Colony {
    pub bee_id: BeeId,
    pub leader: NodeID,
    pub followers: BTreeSet<NodeID>,
    pub replication_factor: u32,
}

impl Colony {
    pub fn members(&self) -> impl Iterator<Item = NodeID> + '_ {
        std::iter::once(self.leader).chain(self.followers.iter().copied())
    }

    pub fn has_member(&self, node: NodeID) -> bool {
        self.leader == node || self.followers.contains(&node)
    }
}

/// What a colony manager decided to do about a lost node, for the caller
/// (the failover controller) to carry out against the cluster group and
/// cell registry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RepairAction {
    /// The lost node was a follower; replace it with `replacement`.
    ReplaceFollower {
        bee_id: BeeId,
        lost: NodeID,
        replacement: NodeID,
    },
    /// The lost node was the leader; the consensus group will elect one of
    /// `survivors` (the colony manager does not pick which). The caller
    /// should re-announce the new leader to the cell registry once the
    /// consensus group reports it, bumping the cells' epoch.
    AwaitNewLeader { bee_id: BeeId, survivors: Vec<NodeID> },
    /// More than `r/2` replicas are down: the bee has lost quorum and its
    /// cells are unavailable until an operator forces recovery.
    Stalled { bee_id: BeeId },
}

/// Per-node colony load, used by the "prefer nodes without existing
/// colonies for this application" placement hint.
#[derive(Default)]
struct NodeLoad {
    colonies: BTreeSet<BeeId>,
}

/// Tracks colony membership for every bee on this node's view of the
/// cluster. One instance per node; its own state is not itself replicated —
/// it is derived from the cluster group's committed membership entries, the
/// same way the cell registry derives its state from committed claims.
#[derive(Default)]
pub struct ColonyManager {
    colonies: BTreeMap<BeeId, Colony>,
    load: BTreeMap<NodeID, NodeLoad>,
}

impl ColonyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn colony(&self, bee_id: BeeId) -> Option<&Colony> {
        self.colonies.get(&bee_id)
    }

    /// Chooses `replication_factor` nodes for a new bee: `candidate` first
    /// (the node that proposed the claim — a hint used by placement on
    /// success), then peers ordered by fewest
    /// existing colonies for this node, breaking ties by `NodeID` for
    /// determinism.
    pub fn place_new_colony(
        &mut self,
        bee_id: BeeId,
        candidate: NodeID,
        replication_factor: u32,
        live_nodes: &[NodeID],
    ) -> Colony {
        let mut ordered: Vec<NodeID> = live_nodes
            .iter()
            .copied()
            .filter(|n| *n != candidate)
            .collect();
        ordered.sort_by_key(|n| (self.load.get(n).map(|l| l.colonies.len()).unwrap_or(0), n.0));

        let mut followers = BTreeSet::new();
        for n in ordered.into_iter().take(replication_factor.saturating_sub(1) as usize) {
            followers.insert(n);
        }

        let colony = Colony {
            bee_id,
            leader: candidate,
            followers,
            replication_factor,
        };
        self.record_membership(&colony);
        self.colonies.insert(bee_id, colony.clone());
        colony
    }

    /// Installs a colony directly (used when replaying cluster-group
    /// entries authored by a different node, or on snapshot install).
    pub fn install_colony(&mut self, colony: Colony) {
        self.record_membership(&colony);
        self.colonies.insert(colony.bee_id, colony);
    }

    fn record_membership(&mut self, colony: &Colony) {
        for node in colony.members() {
            self.load.entry(node).or_default().colonies.insert(colony.bee_id);
        }
    }

    /// A live node was re-announced as leader of `bee_id` (after election or
    /// after a registry-visible epoch bump). Updates the cached belief.
    pub fn note_new_leader(&mut self, bee_id: BeeId, leader: NodeID) {
        if let Some(colony) = self.colonies.get_mut(&bee_id) {
            if colony.leader != leader {
                self.load.entry(colony.leader).and_modify(|l| {
                    l.colonies.remove(&bee_id);
                });
                colony.followers.remove(&leader);
                colony.followers.insert(colony.leader);
                colony.leader = leader;
                self.load.entry(leader).or_default().colonies.insert(bee_id);
            }
        }
    }

    /// A live node accepted a replacement follower slot.
    pub fn note_replacement_follower(&mut self, bee_id: BeeId, lost: NodeID, replacement: NodeID) {
        if let Some(colony) = self.colonies.get_mut(&bee_id) {
            colony.followers.remove(&lost);
            colony.followers.insert(replacement);
            self.load.entry(replacement).or_default().colonies.insert(bee_id);
        }
    }

    /// Computes the repair action every colony containing `node` needs,
    /// given the current set of live nodes to draw replacements from (spec
    /// §4.G's node-loss handling).
    pub fn node_lost(&self, node: NodeID, live_nodes: &[NodeID]) -> Vec<RepairAction> {
        let mut actions = Vec::new();
        for colony in self.colonies.values() {
            if !colony.has_member(node) {
                continue;
            }
            let down = 1; // this function handles one lost node at a time
            let quorum_needed = colony.replication_factor as usize / 2 + 1;
            let remaining = colony.replication_factor as usize - down;
            if remaining < quorum_needed {
                actions.push(RepairAction::Stalled { bee_id: colony.bee_id });
                continue;
            }
            if colony.leader == node {
                let survivors: Vec<NodeID> = colony.followers.iter().copied().collect();
                actions.push(RepairAction::AwaitNewLeader {
                    bee_id: colony.bee_id,
                    survivors,
                });
            } else {
                let in_use: BTreeSet<NodeID> = colony.members().collect();
                if let Some(&replacement) = live_nodes.iter().find(|n| !in_use.contains(n)) {
                    actions.push(RepairAction::ReplaceFollower {
                        bee_id: colony.bee_id,
                        lost: node,
                        replacement,
                    });
                } else {
                    // No spare node to replace onto; one replica short but
                    // still above quorum, so not stalled, just under-
                    // replicated until capacity frees up.
                }
            }
        }
        actions
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn n(i: i64) -> NodeID {
        NodeID(i)
    }

    #[test]
    fn places_candidate_as_leader_and_fills_followers() {
        let mut mgr = ColonyManager::new();
        let colony = mgr.place_new_colony(BeeId(1), n(1), 3, &[n(1), n(2), n(3), n(4)]);
        assert_eq!(colony.leader, n(1));
        assert_eq!(colony.followers.len(), 2);
        assert!(!colony.followers.contains(&n(1)));
    }

    #[test]
    fn prefers_least_loaded_nodes_for_followers() {
        let mut mgr = ColonyManager::new();
        mgr.place_new_colony(BeeId(1), n(2), 2, &[n(1), n(2), n(3)]);
        // n(2) now has one colony; a new bee candidated on n(1) should
        // prefer n(3) (zero colonies) over n(2) (one colony) for its
        // follower.
        let colony = mgr.place_new_colony(BeeId(2), n(1), 2, &[n(1), n(2), n(3)]);
        assert!(colony.followers.contains(&n(3)));
    }

    #[test]
    fn leader_loss_reports_await_new_leader() {
        let mut mgr = ColonyManager::new();
        mgr.place_new_colony(BeeId(1), n(1), 3, &[n(1), n(2), n(3)]);
        let actions = mgr.node_lost(n(1), &[n(2), n(3), n(4)]);
        assert_eq!(
            actions,
            vec![RepairAction::AwaitNewLeader {
                bee_id: BeeId(1),
                survivors: vec![n(2), n(3)],
            }]
        );
    }

    #[test]
    fn follower_loss_reports_replacement() {
        let mut mgr = ColonyManager::new();
        mgr.place_new_colony(BeeId(1), n(1), 3, &[n(1), n(2), n(3)]);
        let actions = mgr.node_lost(n(2), &[n(1), n(2), n(3), n(4)]);
        assert_eq!(
            actions,
            vec![RepairAction::ReplaceFollower {
                bee_id: BeeId(1),
                lost: n(2),
                replacement: n(4),
            }]
        );
    }

    #[test]
    fn quorum_loss_reports_stalled() {
        let mut mgr = ColonyManager::new();
        // r=3 means losing 2 of 3 stalls it; simulate by using r=1 (quorum=1,
        // any loss stalls).
        mgr.place_new_colony(BeeId(1), n(1), 1, &[n(1)]);
        let actions = mgr.node_lost(n(1), &[]);
        assert_eq!(actions, vec![RepairAction::Stalled { bee_id: BeeId(1) }]);
    }
}
