// Copyright 2023-2025 The Ledger Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Storage for one page: ties the object store and the commit graph
//! together and exposes journals, snapshots and sync bookkeeping.
//!
//! Every page starts from the same deterministic root commit (empty tree,
//! generation zero), so commit histories of the same page on different
//! devices are never disjoint.

use std::sync::Arc;
use std::sync::Mutex;

use futures::channel::mpsc;

use crate::btree;
use crate::commit::Commit;
use crate::commit::CommitId;
use crate::commit_graph::CommitGraph;
use crate::commit_graph::CommitGraphError;
use crate::db::Db;
use crate::db::WriteBatch;
use crate::environment::Environment;
use crate::journal::Journal;
use crate::object_id::ObjectId as _;
use crate::object_id::id_type;
use crate::object_store::ObjectStore;
use crate::page_db::PageDb;
use crate::piece::ChangeSource;
use crate::piece::ObjectIdentifier;
use crate::snapshot::Snapshot;
use crate::status::Status;
use crate::status::StatusResult;

id_type!(
    /// Client-chosen identifier of a page.
    pub PageId
);

const INTERESTED_PEER_PREFIX: &[u8] = b"interested/";

/// Notification that commits were applied to the page.
#[derive(Clone, Debug)]
pub struct CommitEvent {
    /// The applied commits, in application order.
    pub commits: Vec<Commit>,
    /// Where they came from.
    pub source: ChangeSource,
}

/// Storage engine for a single page.
#[derive(Debug)]
pub struct PageStorage {
    environment: Environment,
    page_id: PageId,
    store: Arc<ObjectStore>,
    graph: CommitGraph,
    commit_listeners: Mutex<Vec<mpsc::UnboundedSender<CommitEvent>>>,
}

impl PageStorage {
    /// Opens (initializing if needed) page storage over `db`.
    pub fn new(
        environment: Environment,
        page_id: PageId,
        db: Arc<dyn Db>,
    ) -> StatusResult<Self> {
        let page_db = Arc::new(PageDb::new(db));
        // Chunking is keyed per page; the page id is the seed material.
        let store = Arc::new(ObjectStore::new(
            page_db,
            page_id.as_bytes(),
            environment.gc_policy(),
        ));
        let graph = CommitGraph::new(store.clone());
        let storage = Self {
            environment,
            page_id,
            store,
            graph,
            commit_listeners: Mutex::new(vec![]),
        };
        storage.init_root_commit()?;
        Ok(storage)
    }

    // The root commit is derived from constants, so every device computes
    // the same id. It never needs to be uploaded.
    fn init_root_commit(&self) -> StatusResult<()> {
        if !self.graph.head_ids()?.is_empty() {
            return Ok(());
        }
        let root = btree::write_empty_root(&self.store)?;
        let root_digest = root.digest().clone();
        let commit = Commit::build(root, vec![], 0, 0)?;
        self.graph
            .add_commit_from_local(&commit)
            .map_err(Status::from)?;
        self.graph.mark_commit_synced(commit.id())?;
        self.store.mark_piece_synced(&root_digest)?;
        tracing::debug!(page = %self.page_id, id = %commit.id(), "initialized page root commit");
        Ok(())
    }

    /// The page's identifier.
    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    /// The environment this page runs in.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// The page's object store.
    pub fn objects(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// The page's commit graph.
    pub fn graph(&self) -> &CommitGraph {
        &self.graph
    }

    /// Ids of the current heads, sorted by id.
    pub fn head_ids(&self) -> StatusResult<Vec<CommitId>> {
        self.graph.head_ids()
    }

    /// The current heads as commits.
    pub fn head_commits(&self) -> StatusResult<Vec<Commit>> {
        self.graph.head_commits()
    }

    /// The head a client currently observes: the one with the highest
    /// (generation, id). With a single head this is simply that head.
    pub fn latest_head(&self) -> StatusResult<Commit> {
        let mut heads = self.head_commits()?;
        heads.sort_by_key(|commit| (commit.generation(), commit.id().clone()));
        heads
            .pop()
            .ok_or_else(|| Status::IllegalState("page has no head".to_string()))
    }

    /// Starts a journal on top of the latest head.
    pub fn new_journal(&self) -> StatusResult<Journal> {
        Ok(Journal::new(self.store.clone(), self.latest_head()?))
    }

    /// Commits a journal, producing a new local commit. Returns `None`
    /// (and creates nothing) when the journal does not change the page
    /// contents.
    pub fn commit_journal(&self, journal: Journal) -> StatusResult<Option<Commit>> {
        let (base, start_root, changes) = journal.into_parts()?;
        let new_root = btree::apply_changes(&self.store, &start_root, &changes)?;
        if new_root.digest() == base.root().digest() {
            return Ok(None);
        }
        let commit = Commit::build(
            new_root,
            vec![base.id().clone()],
            base.generation() + 1,
            self.environment.now_millis(),
        )?;
        self.graph
            .add_commit_from_local(&commit)
            .map_err(Status::from)?;
        self.notify_listeners(vec![commit.clone()], ChangeSource::Local);
        self.store.collect_garbage()?;
        Ok(Some(commit))
    }

    /// Adds a merge commit for `parents` with the given root. Used by the
    /// merger; the timestamp is the parents' maximum so that the same merge
    /// performed anywhere yields the same commit id.
    pub fn add_merge_commit(
        &self,
        root: ObjectIdentifier,
        parents: [&Commit; 2],
    ) -> StatusResult<Commit> {
        let generation = parents.iter().map(|p| p.generation()).max().unwrap() + 1;
        let timestamp = parents
            .iter()
            .map(|p| p.timestamp_millis())
            .max()
            .unwrap();
        let commit = Commit::build(
            root,
            parents.iter().map(|p| p.id().clone()).collect(),
            generation,
            timestamp,
        )?;
        self.graph
            .add_commit_from_local(&commit)
            .map_err(Status::from)?;
        self.notify_listeners(vec![commit.clone()], ChangeSource::Local);
        self.store.collect_garbage()?;
        Ok(commit)
    }

    /// Applies a batch of serialized commits received from sync. Returns
    /// the commits actually applied (duplicates are skipped).
    pub fn add_commits_from_sync(
        &self,
        batch: Vec<(CommitId, Vec<u8>)>,
        source: ChangeSource,
    ) -> Result<Vec<Commit>, CommitGraphError> {
        let commits = batch
            .iter()
            .map(|(id, bytes)| Commit::from_bytes_with_id(id, bytes, self.store.factory()))
            .collect::<StatusResult<Vec<_>>>()?;
        let applied = self.graph.add_commits_from_sync(commits, source)?;
        if !applied.is_empty() {
            self.notify_listeners(applied.clone(), source);
        }
        self.store.collect_garbage()?;
        Ok(applied)
    }

    /// A read view pinned to `commit`, restricted to `prefix`.
    pub fn snapshot_at(&self, commit_id: &CommitId, prefix: Vec<u8>) -> StatusResult<Snapshot> {
        let commit = self.graph.get_commit(commit_id)?;
        Ok(Snapshot::new(self.store.clone(), commit, prefix))
    }

    /// Subscribes to commit applications. Events are buffered until the
    /// receiver drains them; a dropped receiver unsubscribes.
    pub fn subscribe_commits(&self) -> mpsc::UnboundedReceiver<CommitEvent> {
        let (sender, receiver) = mpsc::unbounded();
        self.commit_listeners.lock().unwrap().push(sender);
        receiver
    }

    fn notify_listeners(&self, commits: Vec<Commit>, source: ChangeSource) {
        let event = CommitEvent { commits, source };
        let mut listeners = self.commit_listeners.lock().unwrap();
        listeners.retain(|listener| listener.unbounded_send(event.clone()).is_ok());
    }

    // --- sync bookkeeping passthroughs ---

    /// Commits not yet acknowledged by the cloud, in generation order.
    pub fn unsynced_commits(&self) -> StatusResult<Vec<Commit>> {
        self.graph.unsynced_commits()
    }

    /// Marks a commit as uploaded.
    pub fn mark_commit_synced(&self, id: &CommitId) -> StatusResult<()> {
        self.graph.mark_commit_synced(id)
    }

    /// Translates a cloud-side commit reference to the local commit id.
    pub fn commit_id_from_remote_id(&self, remote_id: &[u8]) -> StatusResult<CommitId> {
        self.graph.commit_id_from_remote_id(remote_id)
    }

    /// Persists `peer` as interested in this page. Must complete before the
    /// peer's watch request is answered.
    pub fn mark_synced_to_peer(&self, peer: &[u8]) -> StatusResult<()> {
        let mut key = INTERESTED_PEER_PREFIX.to_vec();
        key.extend_from_slice(peer);
        let mut batch = WriteBatch::new();
        self.store.page_db().set_sync_metadata(&mut batch, &key, b"");
        self.store.page_db().write(batch)
    }

    /// Removes `peer` from the interested set.
    pub fn forget_peer(&self, peer: &[u8]) -> StatusResult<()> {
        let mut key = INTERESTED_PEER_PREFIX.to_vec();
        key.extend_from_slice(peer);
        let mut batch = WriteBatch::new();
        self.store.page_db().delete_sync_metadata(&mut batch, &key);
        self.store.page_db().write(batch)
    }

    /// The peers that registered interest in this page.
    pub fn interested_peers(&self) -> StatusResult<Vec<Vec<u8>>> {
        Ok(self
            .store
            .page_db()
            .sync_metadata_by_prefix(INTERESTED_PEER_PREFIX)?
            .into_iter()
            .map(|(key, _)| key[INTERESTED_PEER_PREFIX.len()..].to_vec())
            .collect())
    }

    /// Runs an eager garbage collection round.
    pub fn collect_garbage(&self) -> StatusResult<()> {
        self.store.collect_garbage()
    }
}

impl From<CommitGraphError> for Status {
    fn from(err: CommitGraphError) -> Self {
        match err {
            CommitGraphError::BadState => {
                Self::IllegalState("commit parents are not current heads".to_string())
            }
            CommitGraphError::IncompleteGraph { missing } => Self::InternalNotFound(format!(
                "{} ancestor commits are missing",
                missing.len()
            )),
            CommitGraphError::Status(status) => status,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::FutureExt as _;
    use futures::StreamExt as _;

    use super::*;
    use crate::btree::KeyPriority;
    use crate::memory_db::MemoryDb;

    fn new_page() -> PageStorage {
        let environment = Environment::builder().clock(|| 1000).build();
        PageStorage::new(
            environment,
            PageId::from_bytes(b"test-page-id-0001"),
            Arc::new(MemoryDb::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_init_creates_deterministic_root_commit() {
        let a = new_page();
        let b = new_page();
        assert_eq!(a.head_ids().unwrap(), b.head_ids().unwrap());
        assert_eq!(a.head_ids().unwrap().len(), 1);
        // The root commit is never part of the upload backlog.
        assert!(a.unsynced_commits().unwrap().is_empty());
    }

    #[test]
    fn test_commit_journal_advances_head() {
        let page = new_page();
        let mut journal = page.new_journal().unwrap();
        journal.put(b"hello".to_vec(), b"world", KeyPriority::Eager).unwrap();
        let commit = page.commit_journal(journal).unwrap().unwrap();

        assert_eq!(page.head_ids().unwrap(), vec![commit.id().clone()]);
        let snapshot = page.snapshot_at(commit.id(), vec![]).unwrap();
        assert_eq!(snapshot.get(b"hello").unwrap(), b"world");
        assert_eq!(page.unsynced_commits().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_journal_creates_no_commit() {
        let page = new_page();
        let head_before = page.head_ids().unwrap();

        let journal = page.new_journal().unwrap();
        assert!(page.commit_journal(journal).unwrap().is_none());

        // put followed by delete of the same key is also a no-op commit.
        let mut journal = page.new_journal().unwrap();
        journal.put(b"k".to_vec(), b"v", KeyPriority::Eager).unwrap();
        journal.delete(b"k".to_vec());
        assert!(page.commit_journal(journal).unwrap().is_none());

        assert_eq!(page.head_ids().unwrap(), head_before);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_commits() {
        let page = new_page();
        let mut journal = page.new_journal().unwrap();
        journal.put(b"k".to_vec(), b"v1", KeyPriority::Eager).unwrap();
        let first = page.commit_journal(journal).unwrap().unwrap();
        let snapshot = page.snapshot_at(first.id(), vec![]).unwrap();

        let mut journal = page.new_journal().unwrap();
        journal.put(b"k".to_vec(), b"v2", KeyPriority::Eager).unwrap();
        page.commit_journal(journal).unwrap().unwrap();

        assert_eq!(snapshot.get(b"k").unwrap(), b"v1");
    }

    #[test]
    fn test_commit_events_are_broadcast() {
        let page = new_page();
        let mut events = page.subscribe_commits();

        let mut journal = page.new_journal().unwrap();
        journal.put(b"k".to_vec(), b"v", KeyPriority::Eager).unwrap();
        let commit = page.commit_journal(journal).unwrap().unwrap();

        let event = events.next().now_or_never().flatten().unwrap();
        assert_eq!(event.source, ChangeSource::Local);
        assert_eq!(event.commits.len(), 1);
        assert_eq!(event.commits[0].id(), commit.id());
    }

    #[test]
    fn test_sync_commits_round_trip_between_pages() {
        let source_page = new_page();
        let mut journal = source_page.new_journal().unwrap();
        journal.put(b"k".to_vec(), b"v", KeyPriority::Eager).unwrap();
        let commit = source_page.commit_journal(journal).unwrap().unwrap();

        // Ship the commit and the pieces it needs to a fresh device.
        let target_page = new_page();
        for digest in source_page.objects().unsynced_pieces().unwrap() {
            let bytes = source_page
                .objects()
                .read_piece_bytes(&digest)
                .unwrap();
            target_page
                .objects()
                .add_received_piece(&digest, &bytes, true)
                .unwrap();
        }
        let applied = target_page
            .add_commits_from_sync(
                vec![(commit.id().clone(), commit.encode())],
                ChangeSource::Cloud,
            )
            .unwrap();
        assert_eq!(applied.len(), 1);

        let snapshot = target_page.snapshot_at(commit.id(), vec![]).unwrap();
        assert_eq!(snapshot.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn test_interested_peers_round_trip() {
        let page = new_page();
        assert!(page.interested_peers().unwrap().is_empty());

        page.mark_synced_to_peer(b"device-a").unwrap();
        page.mark_synced_to_peer(b"device-b").unwrap();
        assert_eq!(
            page.interested_peers().unwrap(),
            vec![b"device-a".to_vec(), b"device-b".to_vec()]
        );

        page.forget_peer(b"device-a").unwrap();
        assert_eq!(page.interested_peers().unwrap(), vec![b"device-b".to_vec()]);
    }

    #[test]
    fn test_latest_head_prefers_higher_generation() {
        let page = new_page();
        let mut journal = page.new_journal().unwrap();
        journal.put(b"k".to_vec(), b"v", KeyPriority::Eager).unwrap();
        let commit = page.commit_journal(journal).unwrap().unwrap();
        assert_eq!(page.latest_head().unwrap().id(), commit.id());
    }

    #[test]
    fn test_add_merge_commit_requires_head_parents() {
        let page = new_page();
        let root_head = page.latest_head().unwrap();
        let mut journal = page.new_journal().unwrap();
        journal.put(b"k".to_vec(), b"v", KeyPriority::Eager).unwrap();
        let head = page.commit_journal(journal).unwrap().unwrap();

        // The old root commit is no longer a head.
        let result = page.add_merge_commit(head.root().clone(), [&head, &root_head]);
        assert_matches!(result, Err(Status::IllegalState(_)));
    }
}
