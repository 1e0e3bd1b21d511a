// Copyright 2024-2025 The Ledger Authors
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

//! The client-facing page surface and the per-ledger page multiplexer.
//!
//! A [`Page`] wraps page storage with implicit/explicit transactions,
//! snapshots, watchers and conflict resolution. A [`LedgerManager`] hands
//! out pages on demand and owns their lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt as _;

use crate::btree::KeyPriority;
use crate::db::Db;
use crate::environment::Environment;
use crate::journal::Journal;
use crate::merger::ConflictResolutionWaitResult;
use crate::merger::MergePolicy;
use crate::merger::Merger;
use crate::page_communicator::PageCommunicator;
use crate::page_storage::PageId;
use crate::page_storage::PageStorage;
use crate::piece::ObjectIdentifier;
use crate::snapshot::Snapshot;
use crate::status::Status;
use crate::status::StatusResult;
use crate::watcher::PageWatcher;
use crate::watcher::WatcherId;
use crate::watcher::WatcherRegistry;

/// A client handle on one page.
pub struct Page {
    storage: Arc<PageStorage>,
    watchers: WatcherRegistry,
    merger: Merger,
    transaction: Option<Journal>,
    communicator: Option<Arc<PageCommunicator>>,
}

impl Page {
    /// Wraps `storage` with the client surface.
    pub fn new(storage: Arc<PageStorage>, policy: MergePolicy) -> Self {
        Self {
            storage,
            watchers: WatcherRegistry::new(),
            merger: Merger::new(policy),
            transaction: None,
            communicator: None,
        }
    }

    /// The underlying storage, shared with the sync engines.
    pub fn storage(&self) -> &Arc<PageStorage> {
        &self.storage
    }

    /// Routes on-demand fetches of absent values through the mesh.
    pub fn set_communicator(&mut self, communicator: Arc<PageCommunicator>) {
        self.communicator = Some(communicator);
    }

    /// Replaces the conflict resolution policy.
    pub fn set_merge_policy(&mut self, policy: MergePolicy) {
        self.merger.set_policy(policy);
    }

    async fn apply_or_stage<F>(&mut self, op: F) -> StatusResult<()>
    where
        F: FnOnce(&mut Journal) -> StatusResult<()>,
    {
        if let Some(journal) = self.transaction.as_mut() {
            return op(journal);
        }
        let mut journal = self.storage.new_journal()?;
        op(&mut journal)?;
        self.storage.commit_journal(journal)?;
        self.settle().await
    }

    /// Inserts or replaces `key` with an eagerly synchronized value.
    pub async fn put(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: &[u8],
    ) -> StatusResult<()> {
        self.put_with_priority(key, value, KeyPriority::Eager).await
    }

    /// Inserts or replaces `key` with the given priority.
    pub async fn put_with_priority(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: &[u8],
        priority: KeyPriority,
    ) -> StatusResult<()> {
        let key = key.into();
        self.apply_or_stage(move |journal| journal.put(key, value, priority))
            .await
    }

    /// Inserts or replaces `key` with an already-created reference.
    pub async fn put_reference(
        &mut self,
        key: impl Into<Vec<u8>>,
        reference: ObjectIdentifier,
        priority: KeyPriority,
    ) -> StatusResult<()> {
        let key = key.into();
        self.apply_or_stage(move |journal| journal.put_reference(key, reference, priority))
            .await
    }

    /// Removes `key`.
    pub async fn delete(&mut self, key: impl Into<Vec<u8>>) -> StatusResult<()> {
        let key = key.into();
        self.apply_or_stage(move |journal| {
            journal.delete(key);
            Ok(())
        })
        .await
    }

    /// Removes every entry.
    pub async fn clear(&mut self) -> StatusResult<()> {
        self.apply_or_stage(|journal| {
            journal.clear();
            Ok(())
        })
        .await
    }

    /// Opens an explicit transaction. Fails if one is already open.
    pub fn start_transaction(&mut self) -> StatusResult<()> {
        if self.transaction.is_some() {
            return Err(Status::IllegalState(
                "a transaction is already in progress".to_string(),
            ));
        }
        self.transaction = Some(self.storage.new_journal()?);
        Ok(())
    }

    /// Commits the open transaction.
    pub async fn commit(&mut self) -> StatusResult<()> {
        let Some(journal) = self.transaction.take() else {
            return Err(Status::IllegalState(
                "no transaction in progress".to_string(),
            ));
        };
        self.storage.commit_journal(journal)?;
        self.settle().await
    }

    /// Discards the open transaction. The page is unchanged and no watcher
    /// event is produced.
    pub fn rollback(&mut self) -> StatusResult<()> {
        if self.transaction.take().is_none() {
            return Err(Status::IllegalState(
                "no transaction in progress".to_string(),
            ));
        }
        // Values written by the journal lose their last live reference here
        // and are collected on the next GC round.
        self.storage.collect_garbage()
    }

    /// Whether an explicit transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Merges divergent heads and delivers pending watcher notifications.
    /// Called after every commit and after sync applies remote commits.
    pub async fn settle(&mut self) -> StatusResult<()> {
        self.merger.resolve_conflicts(&self.storage).await?;
        let head = self.storage.latest_head()?;
        self.watchers
            .deliver_pending(self.storage.objects(), &head)
            .await?;
        self.storage.collect_garbage()
    }

    /// Returns a snapshot of the page at its (merged) head, optionally
    /// registering a watcher baselined at the same state.
    pub async fn get_snapshot(
        &mut self,
        prefix: impl Into<Vec<u8>>,
        watcher: Option<Box<dyn PageWatcher>>,
    ) -> StatusResult<Snapshot> {
        // Waiting on the merger here gives the client the implicit merged
        // head rather than an arbitrary branch.
        self.merger.resolve_conflicts(&self.storage).await?;
        let prefix = prefix.into();
        let head = self.storage.latest_head()?;
        let snapshot = self.storage.snapshot_at(head.id(), prefix.clone())?;
        if let Some(watcher) = watcher {
            self.watchers.register(prefix, watcher, head);
        }
        Ok(snapshot)
    }

    /// Unregisters a watcher registered through [`Self::get_snapshot`].
    pub fn remove_watcher(&mut self, id: WatcherId) {
        self.watchers.unregister(id);
    }

    /// Completes when the page has a single head and no resolver session
    /// outstanding.
    pub async fn wait_for_conflict_resolution(
        &mut self,
    ) -> StatusResult<ConflictResolutionWaitResult> {
        self.merger.resolve_conflicts(&self.storage).await
    }

    /// Stores `data` and returns a reference for later
    /// [`Self::put_reference`] calls.
    pub fn create_reference_from_buffer(&self, data: &[u8]) -> StatusResult<ObjectIdentifier> {
        self.storage
            .objects()
            .add_piece(data, crate::piece::ChangeSource::Local)
    }

    /// Streams `declared_size` bytes from `source` into a reference. A
    /// stream whose actual size differs from the declaration is rejected.
    pub async fn create_reference_from_stream(
        &self,
        declared_size: u64,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> StatusResult<ObjectIdentifier> {
        let mut data = vec![];
        source
            .read_to_end(&mut data)
            .await
            .map_err(|err| Status::io("reference stream", err))?;
        if data.len() as u64 != declared_size {
            return Err(Status::IllegalState(format!(
                "reference stream carried {} bytes but declared {declared_size}",
                data.len()
            )));
        }
        self.create_reference_from_buffer(&data)
    }

    /// Reads `key` at the current head, fetching the value from peers if
    /// it is not present locally.
    pub async fn fetch(&mut self, key: &[u8]) -> StatusResult<Vec<u8>> {
        let head = self.storage.latest_head()?;
        let snapshot = self.storage.snapshot_at(head.id(), vec![])?;
        match snapshot.get(key) {
            Err(Status::NeedsFetch) => {
                let (identifier, _priority) = snapshot.value_identifier(key)?;
                let Some(communicator) = &self.communicator else {
                    return Err(Status::NeedsFetch);
                };
                communicator
                    .fetch_object_graph(identifier.digest().clone())
                    .await?;
                snapshot.get(key)
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Page")
            .field("page_id", self.storage.page_id())
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

/// Opens the key/value store backing a page.
pub trait DbFactory: Send + Sync {
    /// Opens (creating if needed) the store for `page_id`.
    fn open_db(&self, page_id: &PageId) -> StatusResult<Arc<dyn Db>>;
}

/// Multiplexes the pages of one ledger.
pub struct LedgerManager {
    environment: Environment,
    db_factory: Arc<dyn DbFactory>,
    policy: MergePolicy,
    pages: HashMap<PageId, Page>,
}

impl LedgerManager {
    /// Creates a manager producing pages from `db_factory`.
    pub fn new(
        environment: Environment,
        db_factory: Arc<dyn DbFactory>,
        policy: MergePolicy,
    ) -> Self {
        Self {
            environment,
            db_factory,
            policy,
            pages: HashMap::new(),
        }
    }

    /// Returns the page for `page_id`, opening it on first access.
    pub fn get_page(&mut self, page_id: &PageId) -> StatusResult<&mut Page> {
        if !self.pages.contains_key(page_id) {
            let db = self.db_factory.open_db(page_id)?;
            let storage = Arc::new(PageStorage::new(
                self.environment.clone(),
                page_id.clone(),
                db,
            )?);
            self.pages
                .insert(page_id.clone(), Page::new(storage, self.policy.clone()));
        }
        Ok(self.pages.get_mut(page_id).unwrap())
    }

    /// The ids of the currently open pages.
    pub fn open_page_ids(&self) -> Vec<PageId> {
        self.pages.keys().cloned().collect()
    }

    /// Closes one page, releasing its watchers and queued callbacks.
    pub fn close_page(&mut self, page_id: &PageId) {
        self.pages.remove(page_id);
    }

    /// Disconnects every page client. Used on cloud erasure.
    pub fn disconnect_all(&mut self) {
        self.pages.clear();
    }

    /// Sets the conflict resolution policy for future and currently open
    /// pages.
    pub fn set_merge_policy(&mut self, policy: MergePolicy) {
        self.policy = policy.clone();
        for page in self.pages.values_mut() {
            page.set_merge_policy(policy.clone());
        }
    }
}

impl std::fmt::Debug for LedgerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("LedgerManager")
            .field("open_pages", &self.pages.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pollster::FutureExt as _;

    use super::*;
    use crate::memory_db::MemoryDbFactory;

    fn new_manager() -> LedgerManager {
        LedgerManager::new(
            Environment::builder().clock(|| 42).build(),
            Arc::new(MemoryDbFactory::new()),
            MergePolicy::LastOneWins,
        )
    }

    fn page_id(name: &[u8]) -> PageId {
        PageId::from_bytes(name)
    }

    #[test]
    fn test_put_get_round_trip() {
        let mut manager = new_manager();
        let page = manager.get_page(&page_id(b"page-1")).unwrap();
        page.put(b"hello".to_vec(), b"world").block_on().unwrap();

        let snapshot = page.get_snapshot(vec![], None).block_on().unwrap();
        assert_eq!(snapshot.get(b"hello").unwrap(), b"world");
    }

    #[test]
    fn test_transaction_visibility() {
        let mut manager = new_manager();
        let page = manager.get_page(&page_id(b"page-1")).unwrap();
        page.put(b"before".to_vec(), b"1").block_on().unwrap();

        page.start_transaction().unwrap();
        page.put(b"inside".to_vec(), b"2").block_on().unwrap();

        // Not visible until commit.
        let snapshot = page.get_snapshot(vec![], None).block_on().unwrap();
        assert_matches!(snapshot.get(b"inside"), Err(Status::KeyNotFound));

        page.commit().block_on().unwrap();
        let snapshot = page.get_snapshot(vec![], None).block_on().unwrap();
        assert_eq!(snapshot.get(b"inside").unwrap(), b"2");
    }

    #[test]
    fn test_rollback_leaves_page_unchanged() {
        let mut manager = new_manager();
        let page = manager.get_page(&page_id(b"page-1")).unwrap();
        page.put(b"keep".to_vec(), b"1").block_on().unwrap();
        let head_before = page.storage().head_ids().unwrap();

        page.start_transaction().unwrap();
        page.put(b"lost".to_vec(), b"2").block_on().unwrap();
        page.rollback().unwrap();

        assert_eq!(page.storage().head_ids().unwrap(), head_before);
        let snapshot = page.get_snapshot(vec![], None).block_on().unwrap();
        assert_matches!(snapshot.get(b"lost"), Err(Status::KeyNotFound));
    }

    #[test]
    fn test_transaction_state_errors() {
        let mut manager = new_manager();
        let page = manager.get_page(&page_id(b"page-1")).unwrap();

        assert_matches!(page.commit().block_on(), Err(Status::IllegalState(_)));
        assert_matches!(page.rollback(), Err(Status::IllegalState(_)));

        page.start_transaction().unwrap();
        assert_matches!(page.start_transaction(), Err(Status::IllegalState(_)));
        page.rollback().unwrap();
        // commit after rollback is illegal again.
        assert_matches!(page.commit().block_on(), Err(Status::IllegalState(_)));
    }

    #[test]
    fn test_clear_inside_transaction_semantics() {
        let mut manager = new_manager();
        let page = manager.get_page(&page_id(b"page-1")).unwrap();
        page.put(b"committed".to_vec(), b"1").block_on().unwrap();

        page.start_transaction().unwrap();
        page.put(b"early".to_vec(), b"2").block_on().unwrap();
        page.clear().block_on().unwrap();
        page.put(b"late".to_vec(), b"3").block_on().unwrap();
        page.commit().block_on().unwrap();

        let snapshot = page.get_snapshot(vec![], None).block_on().unwrap();
        assert_matches!(snapshot.get(b"committed"), Err(Status::KeyNotFound));
        assert_matches!(snapshot.get(b"early"), Err(Status::KeyNotFound));
        assert_eq!(snapshot.get(b"late").unwrap(), b"3");
    }

    #[test]
    fn test_clear_then_get_is_key_not_found() {
        let mut manager = new_manager();
        let page = manager.get_page(&page_id(b"page-1")).unwrap();
        page.put(b"k".to_vec(), b"v").block_on().unwrap();
        page.clear().block_on().unwrap();

        let snapshot = page.get_snapshot(vec![], None).block_on().unwrap();
        assert_matches!(snapshot.get(b"k"), Err(Status::KeyNotFound));
    }

    #[test]
    fn test_reference_round_trip() {
        let mut manager = new_manager();
        let page = manager.get_page(&page_id(b"page-1")).unwrap();
        let reference = page.create_reference_from_buffer(b"payload").unwrap();
        page.put_reference(b"k".to_vec(), reference, KeyPriority::Lazy)
            .block_on()
            .unwrap();

        let snapshot = page.get_snapshot(vec![], None).block_on().unwrap();
        assert_eq!(snapshot.get(b"k").unwrap(), b"payload");
    }

    #[test]
    fn test_reference_from_stream_size_mismatch() {
        let manager_page = || -> StatusResult<ObjectIdentifier> {
            let mut manager = new_manager();
            let page = manager.get_page(&page_id(b"page-1")).unwrap();
            let mut source = std::io::Cursor::new(b"12345".to_vec());
            page.create_reference_from_stream(3, &mut source).block_on()
        };
        assert_matches!(manager_page(), Err(Status::IllegalState(_)));
    }

    #[test]
    fn test_pages_are_independent() {
        let mut manager = new_manager();
        manager
            .get_page(&page_id(b"page-a"))
            .unwrap()
            .put(b"k".to_vec(), b"a")
            .block_on()
            .unwrap();
        manager
            .get_page(&page_id(b"page-b"))
            .unwrap()
            .put(b"k".to_vec(), b"b")
            .block_on()
            .unwrap();

        let snapshot = manager
            .get_page(&page_id(b"page-a"))
            .unwrap()
            .get_snapshot(vec![], None)
            .block_on()
            .unwrap();
        assert_eq!(snapshot.get(b"k").unwrap(), b"a");
    }

    #[test]
    fn test_page_persists_across_close_and_reopen() {
        let mut manager = new_manager();
        manager
            .get_page(&page_id(b"page-a"))
            .unwrap()
            .put(b"k".to_vec(), b"v")
            .block_on()
            .unwrap();
        manager.close_page(&page_id(b"page-a"));
        assert!(manager.open_page_ids().is_empty());

        let snapshot = manager
            .get_page(&page_id(b"page-a"))
            .unwrap()
            .get_snapshot(vec![], None)
            .block_on()
            .unwrap();
        assert_eq!(snapshot.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn test_wait_for_conflict_resolution_single_head() {
        let mut manager = new_manager();
        let page = manager.get_page(&page_id(b"page-1")).unwrap();
        page.put(b"k".to_vec(), b"v").block_on().unwrap();
        assert_eq!(
            page.wait_for_conflict_resolution().block_on().unwrap(),
            ConflictResolutionWaitResult::NoConflicts
        );
    }
}
