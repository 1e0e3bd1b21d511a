// Copyright 2023-2024 The Ledger Authors
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

//! Write journals: the staging area between client mutations and a commit.
//!
//! A journal accumulates puts, deletes and clears on top of a base commit.
//! Values are written to the object store as soon as they are put (their
//! live identifiers keep them from being collected), but nothing becomes
//! visible until the journal is committed. Dropping a journal rolls it
//! back.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::btree;
use crate::btree::KeyPriority;
use crate::btree::TreeChange;
use crate::btree::TreeOp;
use crate::commit::Commit;
use crate::object_store::ObjectStore;
use crate::piece::ChangeSource;
use crate::piece::ObjectIdentifier;
use crate::status::Status;
use crate::status::StatusResult;

#[derive(Clone, Debug)]
enum JournalOp {
    Put {
        value: ObjectIdentifier,
        priority: KeyPriority,
    },
    Delete,
}

/// A set of staged mutations on top of a base commit.
#[derive(Debug)]
pub struct Journal {
    store: Arc<ObjectStore>,
    base: Commit,
    cleared: bool,
    ops: BTreeMap<Vec<u8>, JournalOp>,
}

impl Journal {
    pub(crate) fn new(store: Arc<ObjectStore>, base: Commit) -> Self {
        Self {
            store,
            base,
            cleared: false,
            ops: BTreeMap::new(),
        }
    }

    /// The commit this journal builds on.
    pub fn base(&self) -> &Commit {
        &self.base
    }

    /// Stages an insert/replace, writing the value to the object store
    /// immediately.
    pub fn put(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: &[u8],
        priority: KeyPriority,
    ) -> StatusResult<()> {
        let identifier = self.store.add_piece(value, ChangeSource::Local)?;
        self.put_reference(key, identifier, priority)
    }

    /// Stages an insert/replace of an already-stored value.
    pub fn put_reference(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: ObjectIdentifier,
        priority: KeyPriority,
    ) -> StatusResult<()> {
        if !self.store.has_piece(value.digest())? {
            return Err(Status::InternalNotFound(format!(
                "referenced object {} is not stored",
                value.digest()
            )));
        }
        self.ops
            .insert(key.into(), JournalOp::Put { value, priority });
        Ok(())
    }

    /// Stages a delete. Deleting an absent key commits to a no-op.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.insert(key.into(), JournalOp::Delete);
    }

    /// Discards every entry committed at the base plus all earlier staged
    /// puts. Puts staged after the clear persist.
    pub fn clear(&mut self) {
        self.cleared = true;
        self.ops.clear();
    }

    /// Whether committing this journal could change the page.
    pub fn is_empty(&self) -> bool {
        !self.cleared && self.ops.is_empty()
    }

    // Consumes the journal into the starting root and the key-sorted change
    // list to apply onto it.
    pub(crate) fn into_parts(self) -> StatusResult<(Commit, ObjectIdentifier, Vec<TreeChange>)> {
        let start_root = if self.cleared {
            btree::write_empty_root(&self.store)?
        } else {
            self.base.root().clone()
        };
        let changes = self
            .ops
            .into_iter()
            .map(|(key, op)| {
                let op = match op {
                    JournalOp::Put { value, priority } => TreeOp::Put {
                        entry_id: btree::entry_id_for_insert(&key, &value, priority),
                        value,
                        priority,
                    },
                    JournalOp::Delete => TreeOp::Delete,
                };
                TreeChange { key, op }
            })
            .collect();
        Ok((self.base, start_root, changes))
    }
}
