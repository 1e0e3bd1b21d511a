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

//! Immutable read views pinned to a single commit.
//!
//! A snapshot holds the commit's root identifier, whose live reference
//! keeps everything reachable from it safe from garbage collection for the
//! snapshot's lifetime. Concurrent page modifications never affect an
//! issued snapshot.

use std::ops::ControlFlow;
use std::sync::Arc;

use crate::btree;
use crate::btree::Entry;
use crate::btree::KeyPriority;
use crate::commit::Commit;
use crate::object_store::ObjectStore;
use crate::piece::ObjectIdentifier;
use crate::status::Status;
use crate::status::StatusResult;

/// Largest value returned inline by [`Snapshot::get_inline`].
pub const MAX_INLINE_VALUE_SIZE: u64 = 32 << 10;

/// Byte budget of one paginated [`Snapshot::get_keys`] /
/// [`Snapshot::get_entries`] response, mirroring the transport's inline-data
/// limit.
pub const INLINE_DATA_BUDGET: usize = 64 << 10;

// Accounting overhead per returned key or entry.
const PER_RESULT_OVERHEAD: usize = 48;

/// An entry as returned by [`Snapshot::get_entries`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineEntry {
    /// The key.
    pub key: Vec<u8>,
    /// The value bytes, or `None` when the value is not present locally
    /// (a LAZY value that has not been fetched).
    pub value: Option<Vec<u8>>,
    /// The entry's priority.
    pub priority: KeyPriority,
}

/// Opaque continuation token for paginated reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token(pub(crate) Vec<u8>);

impl Token {
    /// The token's opaque bytes, as carried over the client surface.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Reconstructs a token received from a client.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// A read-only view of one page at one commit, restricted to keys starting
/// with a prefix.
#[derive(Clone, Debug)]
pub struct Snapshot {
    store: Arc<ObjectStore>,
    commit: Commit,
    prefix: Vec<u8>,
}

impl Snapshot {
    pub(crate) fn new(store: Arc<ObjectStore>, commit: Commit, prefix: Vec<u8>) -> Self {
        Self {
            store,
            commit,
            prefix,
        }
    }

    /// The commit this snapshot is pinned to.
    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    /// The key prefix this snapshot is restricted to.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn entry(&self, key: &[u8]) -> StatusResult<Option<Entry>> {
        if !key.starts_with(&self.prefix) {
            return Ok(None);
        }
        btree::lookup(&self.store, self.commit.root(), key)
    }

    /// The stored identifier and priority for `key`, without reading the
    /// value. Used by fetch paths that retrieve missing LAZY values.
    pub fn value_identifier(&self, key: &[u8]) -> StatusResult<(ObjectIdentifier, KeyPriority)> {
        match self.entry(key)? {
            Some(entry) => Ok((entry.value, entry.priority)),
            None => Err(Status::KeyNotFound),
        }
    }

    /// Reads the value for `key`.
    ///
    /// A LAZY value that is not present locally yields
    /// [`Status::NeedsFetch`].
    pub fn get(&self, key: &[u8]) -> StatusResult<Vec<u8>> {
        let Some(entry) = self.entry(key)? else {
            return Err(Status::KeyNotFound);
        };
        if !self.store.has_piece(entry.value.digest())? {
            return match entry.priority {
                KeyPriority::Lazy => Err(Status::NeedsFetch),
                KeyPriority::Eager => Err(Status::InternalNotFound(format!(
                    "eager value for key is missing: {}",
                    entry.value.digest()
                ))),
            };
        }
        self.store.get_piece(&entry.value)
    }

    /// Like [`Self::get`], but fails with [`Status::ValueTooLarge`] instead
    /// of returning a value above [`MAX_INLINE_VALUE_SIZE`].
    pub fn get_inline(&self, key: &[u8]) -> StatusResult<Vec<u8>> {
        let Some(entry) = self.entry(key)? else {
            return Err(Status::KeyNotFound);
        };
        if !self.store.has_piece(entry.value.digest())? {
            return match entry.priority {
                KeyPriority::Lazy => Err(Status::NeedsFetch),
                KeyPriority::Eager => Err(Status::InternalNotFound(format!(
                    "eager value for key is missing: {}",
                    entry.value.digest()
                ))),
            };
        }
        let size = self.store.object_size(&entry.value)?;
        if size > MAX_INLINE_VALUE_SIZE {
            return Err(Status::ValueTooLarge {
                size,
                limit: MAX_INLINE_VALUE_SIZE,
            });
        }
        self.store.get_piece(&entry.value)
    }

    /// Reads a byte range of the value for `key`. A negative `offset`
    /// counts from the end of the value; `max_size == -1` means "to the
    /// end"; out-of-range offsets yield empty output.
    pub fn fetch_partial(&self, key: &[u8], offset: i64, max_size: i64) -> StatusResult<Vec<u8>> {
        let (identifier, priority) = self.value_identifier(key)?;
        if !self.store.has_piece(identifier.digest())? {
            return match priority {
                KeyPriority::Lazy => Err(Status::NeedsFetch),
                KeyPriority::Eager => Err(Status::InternalNotFound(format!(
                    "eager value for key is missing: {}",
                    identifier.digest()
                ))),
            };
        }
        self.store.get_object_part(&identifier, offset, max_size)
    }

    /// Keys in the snapshot starting from `start` (clamped to the prefix),
    /// paginated by the transport budget. A returned token continues the
    /// listing.
    pub fn get_keys(
        &self,
        start: &[u8],
        token: Option<&Token>,
    ) -> StatusResult<(Vec<Vec<u8>>, Option<Token>)> {
        let start = resume_point(&self.prefix, start, token);
        let mut keys: Vec<Vec<u8>> = vec![];
        let mut budget = INLINE_DATA_BUDGET;
        let mut next = None;
        let prefix = &self.prefix;
        btree::for_each_entry(&self.store, self.commit.root(), &start, &mut |entry| {
            if !entry.key.starts_with(prefix) {
                return ControlFlow::Break(());
            }
            let cost = entry.key.len() + PER_RESULT_OVERHEAD;
            if !keys.is_empty() && cost > budget {
                next = Some(Token(entry.key.clone()));
                return ControlFlow::Break(());
            }
            budget = budget.saturating_sub(cost);
            keys.push(entry.key.clone());
            ControlFlow::Continue(())
        })?;
        Ok((keys, next))
    }

    /// Entries in the snapshot starting from `start`, with values inlined,
    /// paginated by the transport budget.
    pub fn get_entries(
        &self,
        start: &[u8],
        token: Option<&Token>,
    ) -> StatusResult<(Vec<InlineEntry>, Option<Token>)> {
        let start = resume_point(&self.prefix, start, token);
        let mut collected: Vec<Entry> = vec![];
        let mut budget = INLINE_DATA_BUDGET;
        let mut next = None;
        let prefix = &self.prefix;
        btree::for_each_entry(&self.store, self.commit.root(), &start, &mut |entry| {
            if !entry.key.starts_with(prefix) {
                return ControlFlow::Break(());
            }
            let cost = entry.key.len() + PER_RESULT_OVERHEAD;
            if !collected.is_empty() && cost > budget {
                next = Some(Token(entry.key.clone()));
                return ControlFlow::Break(());
            }
            budget = budget.saturating_sub(cost);
            collected.push(entry.clone());
            ControlFlow::Continue(())
        })?;

        let mut entries = Vec::with_capacity(collected.len());
        let mut spent = 0usize;
        for (index, entry) in collected.iter().enumerate() {
            let value = if self.store.has_piece(entry.value.digest())? {
                let size = self.store.object_size(&entry.value)? as usize;
                if index > 0 && spent + size > INLINE_DATA_BUDGET {
                    // The values overflow the budget even though the keys
                    // fit; continue from this entry on the next call.
                    next = Some(Token(entry.key.clone()));
                    break;
                }
                spent += size;
                Some(self.store.get_piece(&entry.value)?)
            } else {
                None
            };
            entries.push(InlineEntry {
                key: entry.key.clone(),
                value,
                priority: entry.priority,
            });
        }
        Ok((entries, next))
    }
}

fn resume_point(prefix: &[u8], start: &[u8], token: Option<&Token>) -> Vec<u8> {
    let requested = match token {
        Some(token) => token.0.clone(),
        None => start.to_vec(),
    };
    if requested.as_slice() < prefix {
        prefix.to_vec()
    } else {
        requested
    }
}
