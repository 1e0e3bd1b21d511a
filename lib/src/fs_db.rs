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

//! An on-disk [`Db`] storing one file per row.
//!
//! Row keys are hex-encoded into file names, which keeps the directory
//! listing in row-key order after decoding. Writes go through a temporary
//! file in the repository staging directory and are moved into place, so a
//! row file is always either absent or complete.

use std::fmt;
use std::fmt::Debug;
use std::fs;
use std::io;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use crate::db::BatchOp;
use crate::db::Db;
use crate::db::WriteBatch;
use crate::file_util::persist_temp_file;
use crate::hex_util;
use crate::status::IoResultExt as _;
use crate::status::StatusResult;

/// A [`Db`] keeping each row in its own file under a page directory.
pub struct FsDb {
    dir: PathBuf,
    staging_dir: PathBuf,
    // Serializes batches. Readers go straight to the filesystem.
    write_lock: Mutex<()>,
}

impl FsDb {
    /// Opens (creating if needed) a store under `dir`, staging temporary
    /// files in `staging_dir`. Both directories' parents must exist.
    pub fn open(dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> StatusResult<Self> {
        let dir = dir.into();
        let staging_dir = staging_dir.into();
        crate::file_util::create_or_reuse_dir(&dir).context(&dir)?;
        crate::file_util::create_or_reuse_dir(&staging_dir).context(&staging_dir)?;
        Ok(Self {
            dir,
            staging_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn row_path(&self, key: &[u8]) -> PathBuf {
        self.dir.join(hex_util::encode_hex(key))
    }
}

impl Debug for FsDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("FsDb").field("dir", &self.dir).finish()
    }
}

impl Db for FsDb {
    fn get(&self, key: &[u8]) -> StatusResult<Option<Vec<u8>>> {
        let path = self.row_path(key);
        match fs::read(&path) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(&path),
        }
    }

    fn has_key(&self, key: &[u8]) -> StatusResult<bool> {
        Ok(self.row_path(key).is_file())
    }

    fn get_by_prefix(&self, prefix: &[u8]) -> StatusResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut rows = vec![];
        for entry in self.dir.read_dir().context(&self.dir)? {
            let entry = entry.context(&self.dir)?;
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(hex_util::decode_hex) else {
                // Not a row file (e.g. a leftover temporary); skip.
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            let value = fs::read(entry.path()).context(entry.path())?;
            rows.push((key, value));
        }
        rows.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(rows)
    }

    fn write(&self, batch: WriteBatch) -> StatusResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    let mut temp_file =
                        NamedTempFile::new_in(&self.staging_dir).context(&self.staging_dir)?;
                    temp_file.write_all(&value).context(temp_file.path())?;
                    let path = self.row_path(&key);
                    persist_temp_file(temp_file, &path).context(&path)?;
                }
                BatchOp::Delete { key } => {
                    let path = self.row_path(&key);
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err).context(&path),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_db(temp_dir: &tempfile::TempDir) -> FsDb {
        FsDb::open(
            temp_dir.path().join("db"),
            temp_dir.path().join("staging"),
        )
        .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = new_db(&temp_dir);

        let mut batch = WriteBatch::new();
        batch.put(b"heads/abc".to_vec(), b"".to_vec());
        batch.put(b"objects/1".to_vec(), b"piece".to_vec());
        db.write(batch).unwrap();

        assert_eq!(db.get(b"objects/1").unwrap(), Some(b"piece".to_vec()));
        assert_eq!(db.get(b"objects/2").unwrap(), None);
        assert!(db.has_key(b"heads/abc").unwrap());
    }

    #[test]
    fn test_prefix_scan_sorted() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = new_db(&temp_dir);

        let mut batch = WriteBatch::new();
        batch.put(b"c/2".to_vec(), b"two".to_vec());
        batch.put(b"c/1".to_vec(), b"one".to_vec());
        batch.put(b"d/1".to_vec(), b"other".to_vec());
        db.write(batch).unwrap();

        let rows = db.get_by_prefix(b"c/").unwrap();
        assert_eq!(
            rows,
            vec![
                (b"c/1".to_vec(), b"one".to_vec()),
                (b"c/2".to_vec(), b"two".to_vec()),
            ]
        );
    }

    #[test]
    fn test_delete_missing_row_is_ok() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = new_db(&temp_dir);
        let mut batch = WriteBatch::new();
        batch.delete(b"absent".to_vec());
        db.write(batch).unwrap();
    }

    #[test]
    fn test_reopen_preserves_rows() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let db = new_db(&temp_dir);
            let mut batch = WriteBatch::new();
            batch.put(b"k".to_vec(), b"v".to_vec());
            db.write(batch).unwrap();
        }
        let db = new_db(&temp_dir);
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
