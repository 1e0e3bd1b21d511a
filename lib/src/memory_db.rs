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

//! An in-memory [`Db`] used by tests and by repositories that opt out of
//! persistence.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use crate::db::BatchOp;
use crate::db::Db;
use crate::db::WriteBatch;
use crate::ledger::DbFactory;
use crate::page_storage::PageId;
use crate::status::StatusResult;

/// A [`Db`] holding all rows in a `BTreeMap`.
#[derive(Default)]
pub struct MemoryDb {
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDb {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows, for tests.
    pub fn row_count(&self) -> usize {
        self.rows.read().unwrap().len()
    }
}

impl Debug for MemoryDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("MemoryDb")
            .field("rows", &self.row_count())
            .finish()
    }
}

impl Db for MemoryDb {
    fn get(&self, key: &[u8]) -> StatusResult<Option<Vec<u8>>> {
        Ok(self.rows.read().unwrap().get(key).cloned())
    }

    fn get_by_prefix(&self, prefix: &[u8]) -> StatusResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let rows = self.rows.read().unwrap();
        Ok(rows
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write(&self, batch: WriteBatch) -> StatusResult<()> {
        let mut rows = self.rows.write().unwrap();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    rows.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    rows.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// A [`DbFactory`] keeping every page's rows in memory. Reopening a page
/// yields the same store, so closing a page does not lose its data.
#[derive(Default)]
pub struct MemoryDbFactory {
    dbs: Mutex<HashMap<PageId, Arc<MemoryDb>>>,
}

impl MemoryDbFactory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Debug for MemoryDbFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("MemoryDbFactory")
            .field("pages", &self.dbs.lock().unwrap().len())
            .finish()
    }
}

impl DbFactory for MemoryDbFactory {
    fn open_db(&self, page_id: &PageId) -> StatusResult<Arc<dyn Db>> {
        let mut dbs = self.dbs.lock().unwrap();
        let db = dbs
            .entry(page_id.clone())
            .or_insert_with(|| Arc::new(MemoryDb::new()))
            .clone();
        Ok(db)
    }
}
