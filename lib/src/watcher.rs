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

//! Page watchers: prefix-scoped change notifications with aggregation.
//!
//! A watcher acknowledges a delivery by returning from `on_change`; the
//! next delivery is not dispatched before that. Changes that accumulate
//! between deliveries are aggregated: the watcher sees one delivery
//! carrying the final value per touched key, not one delivery per commit.

use async_trait::async_trait;

use crate::btree;
use crate::btree::KeyPriority;
use crate::commit::Commit;
use crate::object_store::ObjectStore;
use crate::snapshot::INLINE_DATA_BUDGET;
use crate::snapshot::MAX_INLINE_VALUE_SIZE;
use crate::status::StatusResult;

/// Pagination marker of one `on_change` delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultState {
    /// The delivery carries the whole change.
    Completed,
    /// The delivery opens or continues a paginated change.
    PartialStarted,
    /// The delivery closes a paginated change.
    PartialCompleted,
}

/// One changed entry inside a [`PageChange`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedEntry {
    /// The key.
    pub key: Vec<u8>,
    /// The new value, or `None` when it is too large to inline or not
    /// present locally.
    pub value: Option<Vec<u8>>,
    /// The entry's priority.
    pub priority: KeyPriority,
}

/// The key-sorted delta delivered to a watcher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageChange {
    /// Timestamp of the commit the delivery advances to.
    pub timestamp_millis: i64,
    /// Inserted or modified entries, sorted by key.
    pub changed_entries: Vec<ChangedEntry>,
    /// Removed keys, sorted.
    pub deleted_keys: Vec<Vec<u8>>,
}

/// Receiver of page change notifications.
#[async_trait]
pub trait PageWatcher: Send {
    /// Delivers one (possibly partial) change. Returning acknowledges the
    /// delivery and allows the next one.
    async fn on_change(&mut self, change: PageChange, result_state: ResultState);
}

/// Identifier of a registered watcher, used to unregister it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatcherId(u64);

struct WatcherSlot {
    id: WatcherId,
    prefix: Vec<u8>,
    watcher: Box<dyn PageWatcher>,
    // The commit whose state was last acknowledged. Its root identifier
    // pins the old tree so the next diff can be computed.
    last_delivered: Commit,
}

/// The set of watchers registered on one page.
#[derive(Default)]
pub struct WatcherRegistry {
    slots: Vec<WatcherSlot>,
    next_id: u64,
}

impl WatcherRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a watcher observing keys under `prefix`, baselined at
    /// `at_commit` (the snapshot handed to the client alongside).
    pub fn register(
        &mut self,
        prefix: Vec<u8>,
        watcher: Box<dyn PageWatcher>,
        at_commit: Commit,
    ) -> WatcherId {
        let id = WatcherId(self.next_id);
        self.next_id += 1;
        self.slots.push(WatcherSlot {
            id,
            prefix,
            watcher,
            last_delivered: at_commit,
        });
        id
    }

    /// Removes a watcher. Pending deliveries for it are released.
    pub fn unregister(&mut self, id: WatcherId) {
        self.slots.retain(|slot| slot.id != id);
    }

    /// Drops all watchers, releasing queued callbacks.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Number of registered watchers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no watcher is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Delivers the delta from each watcher's acknowledged state to
    /// `target`, one aggregated change per watcher. Awaits each
    /// acknowledgement before updating the watcher's baseline.
    pub async fn deliver_pending(
        &mut self,
        store: &ObjectStore,
        target: &Commit,
    ) -> StatusResult<()> {
        for slot in &mut self.slots {
            if slot.last_delivered.id() == target.id() {
                continue;
            }
            let diff = btree::diff(store, slot.last_delivered.root(), target.root())?;
            let mut change = PageChange {
                timestamp_millis: target.timestamp_millis(),
                ..PageChange::default()
            };
            for entry_change in diff {
                if !entry_change.key().starts_with(&slot.prefix) {
                    continue;
                }
                match entry_change.target {
                    Some(entry) => {
                        let value = if store.has_piece(entry.value.digest())?
                            && store.object_size(&entry.value)? <= MAX_INLINE_VALUE_SIZE
                        {
                            Some(store.get_piece(&entry.value)?)
                        } else {
                            None
                        };
                        change.changed_entries.push(ChangedEntry {
                            key: entry.key,
                            value,
                            priority: entry.priority,
                        });
                    }
                    None => {
                        change
                            .deleted_keys
                            .push(entry_change.base.expect("one side present").key);
                    }
                }
            }
            if change.changed_entries.is_empty() && change.deleted_keys.is_empty() {
                slot.last_delivered = target.clone();
                continue;
            }

            let pages = paginate(change);
            let count = pages.len();
            for (index, page) in pages.into_iter().enumerate() {
                let result_state = if count == 1 {
                    ResultState::Completed
                } else if index + 1 == count {
                    ResultState::PartialCompleted
                } else {
                    ResultState::PartialStarted
                };
                slot.watcher.on_change(page, result_state).await;
            }
            slot.last_delivered = target.clone();
        }
        Ok(())
    }
}

// Splits a change into transport-budget-sized pages, preserving key order.
fn paginate(change: PageChange) -> Vec<PageChange> {
    let timestamp_millis = change.timestamp_millis;
    let mut pages = vec![];
    let mut current = PageChange {
        timestamp_millis,
        ..PageChange::default()
    };
    let mut budget = INLINE_DATA_BUDGET;

    let mut flush =
        |current: &mut PageChange, budget: &mut usize, pages: &mut Vec<PageChange>| {
            if !current.changed_entries.is_empty() || !current.deleted_keys.is_empty() {
                pages.push(std::mem::replace(
                    current,
                    PageChange {
                        timestamp_millis,
                        ..PageChange::default()
                    },
                ));
            }
            *budget = INLINE_DATA_BUDGET;
        };

    for entry in change.changed_entries {
        let cost = entry.key.len() + entry.value.as_ref().map_or(0, Vec::len) + 64;
        if cost > budget && !(current.changed_entries.is_empty() && current.deleted_keys.is_empty())
        {
            flush(&mut current, &mut budget, &mut pages);
        }
        budget = budget.saturating_sub(cost);
        current.changed_entries.push(entry);
    }
    for key in change.deleted_keys {
        let cost = key.len() + 64;
        if cost > budget && !(current.changed_entries.is_empty() && current.deleted_keys.is_empty())
        {
            flush(&mut current, &mut budget, &mut pages);
        }
        budget = budget.saturating_sub(cost);
        current.deleted_keys.push(key);
    }
    flush(&mut current, &mut budget, &mut pages);
    pages
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use pollster::FutureExt as _;

    use super::*;
    use crate::btree::TreeChange;
    use crate::btree::TreeOp;
    use crate::environment::GarbageCollectionPolicy;
    use crate::memory_db::MemoryDb;
    use crate::page_db::PageDb;
    use crate::piece::ChangeSource;
    use crate::piece::ObjectIdentifier;

    struct RecordingWatcher {
        deliveries: Arc<Mutex<Vec<(PageChange, ResultState)>>>,
    }

    #[async_trait]
    impl PageWatcher for RecordingWatcher {
        async fn on_change(&mut self, change: PageChange, result_state: ResultState) {
            self.deliveries.lock().unwrap().push((change, result_state));
        }
    }

    fn new_store() -> Arc<ObjectStore> {
        let db = Arc::new(PageDb::new(Arc::new(MemoryDb::new())));
        Arc::new(ObjectStore::new(
            db,
            b"watcher-tests",
            GarbageCollectionPolicy::Never,
        ))
    }

    fn commit_with(
        store: &Arc<ObjectStore>,
        base: Option<&Commit>,
        entries: &[(&[u8], Option<&[u8]>)],
    ) -> Commit {
        let start = match base {
            Some(commit) => commit.root().clone(),
            None => btree::write_empty_root(store).unwrap(),
        };
        let changes: Vec<TreeChange> = entries
            .iter()
            .map(|(key, value)| match value {
                Some(value) => {
                    let id: ObjectIdentifier =
                        store.add_piece(value, ChangeSource::Local).unwrap();
                    TreeChange {
                        key: key.to_vec(),
                        op: TreeOp::Put {
                            entry_id: btree::entry_id_for_insert(key, &id, KeyPriority::Eager),
                            value: id,
                            priority: KeyPriority::Eager,
                        },
                    }
                }
                None => TreeChange {
                    key: key.to_vec(),
                    op: TreeOp::Delete,
                },
            })
            .collect();
        let root = btree::apply_changes(store, &start, &changes).unwrap();
        let (generation, parents) = match base {
            Some(commit) => (commit.generation() + 1, vec![commit.id().clone()]),
            None => (0, vec![]),
        };
        Commit::build(root, parents, generation, generation as i64).unwrap()
    }

    #[test]
    fn test_single_delivery_with_changes_and_deletions() {
        let store = new_store();
        let base = commit_with(&store, None, &[(b"keep", Some(b"1")), (b"gone", Some(b"2"))]);
        let target = commit_with(
            &store,
            Some(&base),
            &[(b"added", Some(b"3")), (b"gone", None)],
        );

        let deliveries = Arc::new(Mutex::new(vec![]));
        let mut registry = WatcherRegistry::new();
        registry.register(
            vec![],
            Box::new(RecordingWatcher {
                deliveries: deliveries.clone(),
            }),
            base.clone(),
        );

        registry.deliver_pending(&store, &target).block_on().unwrap();

        let deliveries = deliveries.lock().unwrap();
        assert_eq!(deliveries.len(), 1);
        let (change, state) = &deliveries[0];
        assert_eq!(*state, ResultState::Completed);
        assert_eq!(change.changed_entries.len(), 1);
        assert_eq!(change.changed_entries[0].key, b"added".to_vec());
        assert_eq!(change.changed_entries[0].value, Some(b"3".to_vec()));
        assert_eq!(change.deleted_keys, vec![b"gone".to_vec()]);
    }

    #[test]
    fn test_aggregation_delivers_final_value_only() {
        let store = new_store();
        let base = commit_with(&store, None, &[]);
        // Three commits pile up before the next delivery.
        let c1 = commit_with(&store, Some(&base), &[(b"k", Some(b"v1"))]);
        let c2 = commit_with(&store, Some(&c1), &[(b"k", Some(b"v2"))]);
        let c3 = commit_with(&store, Some(&c2), &[(b"k", Some(b"v3")), (b"other", Some(b"x"))]);

        let deliveries = Arc::new(Mutex::new(vec![]));
        let mut registry = WatcherRegistry::new();
        registry.register(
            vec![],
            Box::new(RecordingWatcher {
                deliveries: deliveries.clone(),
            }),
            base.clone(),
        );

        registry.deliver_pending(&store, &c3).block_on().unwrap();

        let deliveries = deliveries.lock().unwrap();
        assert_eq!(deliveries.len(), 1);
        let (change, _) = &deliveries[0];
        assert_eq!(change.changed_entries.len(), 2);
        assert_eq!(change.changed_entries[0].key, b"k".to_vec());
        assert_eq!(change.changed_entries[0].value, Some(b"v3".to_vec()));
    }

    #[test]
    fn test_prefix_filtering() {
        let store = new_store();
        let base = commit_with(&store, None, &[]);
        let target = commit_with(
            &store,
            Some(&base),
            &[(b"app/x", Some(b"1")), (b"sys/y", Some(b"2"))],
        );

        let deliveries = Arc::new(Mutex::new(vec![]));
        let mut registry = WatcherRegistry::new();
        registry.register(
            b"app/".to_vec(),
            Box::new(RecordingWatcher {
                deliveries: deliveries.clone(),
            }),
            base.clone(),
        );

        registry.deliver_pending(&store, &target).block_on().unwrap();

        let deliveries = deliveries.lock().unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0.changed_entries.len(), 1);
        assert_eq!(deliveries[0].0.changed_entries[0].key, b"app/x".to_vec());
    }

    #[test]
    fn test_no_spurious_delivery_outside_prefix() {
        let store = new_store();
        let base = commit_with(&store, None, &[]);
        let target = commit_with(&store, Some(&base), &[(b"sys/y", Some(b"2"))]);

        let deliveries = Arc::new(Mutex::new(vec![]));
        let mut registry = WatcherRegistry::new();
        registry.register(
            b"app/".to_vec(),
            Box::new(RecordingWatcher {
                deliveries: deliveries.clone(),
            }),
            base.clone(),
        );

        registry.deliver_pending(&store, &target).block_on().unwrap();
        assert!(deliveries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_large_delta_is_paginated() {
        let store = new_store();
        let base = commit_with(&store, None, &[]);
        let payload = vec![9u8; 8 << 10];
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..20)
            .map(|i| (format!("key-{i:02}").into_bytes(), payload.clone()))
            .collect();
        let borrowed: Vec<(&[u8], Option<&[u8]>)> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), Some(v.as_slice())))
            .collect();
        let target = commit_with(&store, Some(&base), &borrowed);

        let deliveries = Arc::new(Mutex::new(vec![]));
        let mut registry = WatcherRegistry::new();
        registry.register(
            vec![],
            Box::new(RecordingWatcher {
                deliveries: deliveries.clone(),
            }),
            base.clone(),
        );

        registry.deliver_pending(&store, &target).block_on().unwrap();

        let deliveries = deliveries.lock().unwrap();
        assert!(deliveries.len() > 1);
        assert_eq!(deliveries[0].1, ResultState::PartialStarted);
        assert_eq!(
            deliveries.last().unwrap().1,
            ResultState::PartialCompleted
        );
        let total: usize = deliveries
            .iter()
            .map(|(change, _)| change.changed_entries.len())
            .sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn test_unregister_releases_watcher() {
        let store = new_store();
        let base = commit_with(&store, None, &[]);
        let target = commit_with(&store, Some(&base), &[(b"k", Some(b"v"))]);

        let deliveries = Arc::new(Mutex::new(vec![]));
        let mut registry = WatcherRegistry::new();
        let id = registry.register(
            vec![],
            Box::new(RecordingWatcher {
                deliveries: deliveries.clone(),
            }),
            base.clone(),
        );
        registry.unregister(id);
        assert!(registry.is_empty());

        registry.deliver_pending(&store, &target).block_on().unwrap();
        assert!(deliveries.lock().unwrap().is_empty());
    }
}
