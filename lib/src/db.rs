// Copyright 2023 The Ledger Authors
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

//! The ordered key/value store interface page storage is built on.

use std::fmt::Debug;

use crate::status::StatusResult;

/// A single operation in a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or replace a row.
    Put {
        /// Row key.
        key: Vec<u8>,
        /// Row value.
        value: Vec<u8>,
    },
    /// Remove a row. Removing an absent row is not an error.
    Delete {
        /// Row key.
        key: Vec<u8>,
    },
}

/// An ordered list of row mutations applied atomically by [`Db::write`].
///
/// Later operations on the same key win.
#[derive(Default, Debug)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an insert/replace.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    /// Whether the batch contains no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Consumes the batch, yielding its operations in order.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    /// The queued operations.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Appends all operations of `other` after the current ones.
    pub fn append(&mut self, other: Self) {
        self.ops.extend(other.ops);
    }
}

/// An ordered key/value store.
///
/// One instance backs one page. Implementations must serialize writes; reads
/// may run concurrently with each other.
pub trait Db: Send + Sync + Debug {
    /// Reads a row, or `None` if the key is absent.
    fn get(&self, key: &[u8]) -> StatusResult<Option<Vec<u8>>>;

    /// Whether a row exists.
    fn has_key(&self, key: &[u8]) -> StatusResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Returns all rows whose key starts with `prefix`, sorted by key.
    fn get_by_prefix(&self, prefix: &[u8]) -> StatusResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies all operations of `batch` atomically.
    fn write(&self, batch: WriteBatch) -> StatusResult<()>;
}
