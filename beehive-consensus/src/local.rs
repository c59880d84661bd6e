// A single-node reference `ConsensusGroup`: everything proposed commits
// immediately, since there is only ever one voter. Stands in for a real
// multi-node algorithm in tests and single-node deployments; never used to
// claim the engine tolerates node failure on its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use beehive_base::{err, Result};

use crate::framing::Snapshot;
use crate::group::{CommittedEntry, ConsensusGroup, GroupRole, LogIndex, MemberId, Term};

const CHANNEL_CAPACITY: usize = 1024;

pub struct LocalConsensusGroup {
    term: AtomicU64,
    next_index: AtomicU64,
    tx: broadcast::Sender<CommittedEntry>,
    last_snapshot: Mutex<Option<Snapshot>>,
}

impl LocalConsensusGroup {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        LocalConsensusGroup {
            term: AtomicU64::new(1),
            next_index: AtomicU64::new(1),
            tx,
            last_snapshot: Mutex::new(None),
        }
    }

    pub fn last_snapshot(&self) -> Option<Snapshot> {
        self.last_snapshot.lock().unwrap().clone()
    }
}

impl Default for LocalConsensusGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsensusGroup for LocalConsensusGroup {
    async fn propose(&self, kind: u8, payload: Vec<u8>) -> Result<(Term, LogIndex)> {
        let term = self.term.load(Ordering::SeqCst);
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let entry = CommittedEntry {
            term,
            index,
            kind,
            payload,
        };
        // No subscribers is not an error: it just means nobody is watching
        // this group's commit stream yet.
        let _ = self.tx.send(entry);
        Ok((term, index))
    }

    async fn read_index(&self) -> Result<LogIndex> {
        Ok(self.next_index.load(Ordering::SeqCst).saturating_sub(1))
    }

    async fn transfer_leadership(&self, _target: MemberId) -> Result<()> {
        Err(err("single-member group has no one to transfer leadership to"))
    }

    async fn add_member(&self, _member: MemberId) -> Result<()> {
        Err(err("LocalConsensusGroup does not support membership changes"))
    }

    async fn remove_member(&self, _member: MemberId) -> Result<()> {
        Err(err("LocalConsensusGroup does not support membership changes"))
    }

    async fn snapshot_install(&self, snapshot: Snapshot) -> Result<()> {
        let mut guard = self.last_snapshot.lock().unwrap();
        self.next_index
            .fetch_max(snapshot.index + 1, Ordering::SeqCst);
        self.term.fetch_max(snapshot.term, Ordering::SeqCst);
        *guard = Some(snapshot);
        Ok(())
    }

    fn role(&self) -> GroupRole {
        GroupRole::Leader
    }

    fn current_term(&self) -> Term {
        self.term.load(Ordering::SeqCst)
    }

    fn committed(&self) -> broadcast::Receiver<CommittedEntry> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn propose_commits_immediately_and_broadcasts() {
        let group = LocalConsensusGroup::new();
        let mut sub = group.committed();

        let (term, index) = group.propose(1, b"hello".to_vec()).await.unwrap();
        assert_eq!((term, index), (1, 1));

        let committed = sub.recv().await.unwrap();
        assert_eq!(committed.index, 1);
        assert_eq!(committed.payload, b"hello");
    }

    #[tokio::test]
    async fn read_index_tracks_last_committed() {
        let group = LocalConsensusGroup::new();
        assert_eq!(group.read_index().await.unwrap(), 0);
        group.propose(0, vec![]).await.unwrap();
        group.propose(0, vec![]).await.unwrap();
        assert_eq!(group.read_index().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn snapshot_install_advances_index_and_term() {
        let group = LocalConsensusGroup::new();
        group
            .snapshot_install(Snapshot {
                index: 50,
                term: 4,
                state: vec![],
            })
            .await
            .unwrap();
        assert_eq!(group.current_term(), 4);
        assert_eq!(group.read_index().await.unwrap(), 50);

        let (_, next) = group.propose(0, vec![]).await.unwrap();
        assert_eq!(next, 51);
    }

    #[tokio::test]
    async fn single_member_group_rejects_reconfiguration() {
        let group = LocalConsensusGroup::new();
        assert!(group.transfer_leadership(MemberId(2)).await.is_err());
        assert!(group.add_member(MemberId(2)).await.is_err());
        assert!(group.remove_member(MemberId(2)).await.is_err());
    }
}
