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

//! Row-key encoding over the page's key/value store.
//!
//! One [`Db`] holds two logical namespaces: metadata (heads, unsynced sets,
//! reference counts, device clock, sync metadata) and objects (piece bytes
//! keyed by digest). All keyspace layout lives here; upper layers never
//! build row keys themselves.

use std::fmt::Debug;
use std::sync::Arc;

use prost::encoding::decode_varint;
use prost::encoding::encode_varint;

use crate::commit::CommitId;
use crate::db::Db;
use crate::db::WriteBatch;
use crate::object_id::ObjectId as _;
use crate::piece::ObjectDigest;
use crate::status::Status;
use crate::status::StatusResult;

const HEADS: &[u8] = b"heads/";
const COMMITS: &[u8] = b"commits/";
const OBJECTS: &[u8] = b"objects/";
const REFCOUNTS: &[u8] = b"refcounts/";
const UNSYNCED_COMMITS: &[u8] = b"unsynced_commits/";
const UNSYNCED_OBJECTS: &[u8] = b"unsynced_objects/";
const DEVICE_CLOCK: &[u8] = b"device_clock";
const SYNC_METADATA: &[u8] = b"sync_metadata/";

fn row_key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

fn encode_varint_value(value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    encode_varint(value, &mut buf);
    buf
}

fn decode_varint_value(mut bytes: &[u8]) -> StatusResult<u64> {
    decode_varint(&mut bytes)
        .map_err(|err| Status::DataIntegrity(format!("malformed varint row: {err}")))
}

/// Typed row access for a single page.
pub struct PageDb {
    db: Arc<dyn Db>,
}

impl PageDb {
    /// Wraps the page's key/value store.
    pub fn new(db: Arc<dyn Db>) -> Self {
        Self { db }
    }

    /// The underlying store.
    pub fn db(&self) -> &Arc<dyn Db> {
        &self.db
    }

    /// Applies a batch of row mutations atomically.
    pub fn write(&self, batch: WriteBatch) -> StatusResult<()> {
        self.db.write(batch)
    }

    // --- heads ---

    /// All current heads, sorted by id.
    pub fn heads(&self) -> StatusResult<Vec<CommitId>> {
        let rows = self.db.get_by_prefix(HEADS)?;
        rows.into_iter()
            .map(|(key, _)| {
                let digest = ObjectDigest::from_bytes(&key[HEADS.len()..])?;
                Ok(CommitId::new(digest.to_bytes()))
            })
            .collect()
    }

    /// Queues insertion of a head.
    pub fn insert_head(&self, batch: &mut WriteBatch, id: &CommitId) {
        batch.put(row_key(HEADS, id.as_bytes()), vec![]);
    }

    /// Queues removal of a head.
    pub fn remove_head(&self, batch: &mut WriteBatch, id: &CommitId) {
        batch.delete(row_key(HEADS, id.as_bytes()));
    }

    // --- commits ---

    /// Reads a stored commit body.
    pub fn commit_bytes(&self, id: &CommitId) -> StatusResult<Option<Vec<u8>>> {
        self.db.get(&row_key(COMMITS, id.as_bytes()))
    }

    /// Whether the commit is stored locally.
    pub fn has_commit(&self, id: &CommitId) -> StatusResult<bool> {
        self.db.has_key(&row_key(COMMITS, id.as_bytes()))
    }

    /// Queues storage of a commit body.
    pub fn put_commit(&self, batch: &mut WriteBatch, id: &CommitId, body: &[u8]) {
        batch.put(row_key(COMMITS, id.as_bytes()), body.to_vec());
    }

    // --- objects ---

    /// Reads stored piece bytes.
    pub fn object_bytes(&self, digest: &ObjectDigest) -> StatusResult<Option<Vec<u8>>> {
        self.db.get(&row_key(OBJECTS, digest.as_bytes()))
    }

    /// Whether the piece is stored locally.
    pub fn has_object(&self, digest: &ObjectDigest) -> StatusResult<bool> {
        self.db.has_key(&row_key(OBJECTS, digest.as_bytes()))
    }

    /// Queues storage of piece bytes.
    pub fn put_object(&self, batch: &mut WriteBatch, digest: &ObjectDigest, bytes: &[u8]) {
        batch.put(row_key(OBJECTS, digest.as_bytes()), bytes.to_vec());
    }

    /// Queues removal of piece bytes.
    pub fn delete_object(&self, batch: &mut WriteBatch, digest: &ObjectDigest) {
        batch.delete(row_key(OBJECTS, digest.as_bytes()));
    }

    // --- reference counts ---

    /// On-disk incoming-reference count of a piece.
    pub fn refcount(&self, digest: &ObjectDigest) -> StatusResult<u64> {
        match self.db.get(&row_key(REFCOUNTS, digest.as_bytes()))? {
            Some(bytes) => decode_varint_value(&bytes),
            None => Ok(0),
        }
    }

    /// Queues an update of a piece's reference count. A zero count deletes
    /// the row.
    pub fn set_refcount(&self, batch: &mut WriteBatch, digest: &ObjectDigest, count: u64) {
        let key = row_key(REFCOUNTS, digest.as_bytes());
        if count == 0 {
            batch.delete(key);
        } else {
            batch.put(key, encode_varint_value(count));
        }
    }

    // --- unsynced tracking ---

    /// Queues recording of a commit as not yet uploaded.
    pub fn mark_commit_unsynced(&self, batch: &mut WriteBatch, id: &CommitId, generation: u64) {
        batch.put(
            row_key(UNSYNCED_COMMITS, id.as_bytes()),
            encode_varint_value(generation),
        );
    }

    /// Queues removal of a commit from the unsynced set.
    pub fn mark_commit_synced(&self, batch: &mut WriteBatch, id: &CommitId) {
        batch.delete(row_key(UNSYNCED_COMMITS, id.as_bytes()));
    }

    /// Ids and generations of commits not yet uploaded, in generation order
    /// (ties broken by id).
    pub fn unsynced_commits(&self) -> StatusResult<Vec<(CommitId, u64)>> {
        let rows = self.db.get_by_prefix(UNSYNCED_COMMITS)?;
        let mut commits = rows
            .into_iter()
            .map(|(key, value)| {
                let digest = ObjectDigest::from_bytes(&key[UNSYNCED_COMMITS.len()..])?;
                Ok((CommitId::new(digest.to_bytes()), decode_varint_value(&value)?))
            })
            .collect::<StatusResult<Vec<_>>>()?;
        commits.sort_by(|(id_a, gen_a), (id_b, gen_b)| (gen_a, id_a).cmp(&(gen_b, id_b)));
        Ok(commits)
    }

    /// Queues recording of a piece as not yet uploaded.
    pub fn mark_object_unsynced(&self, batch: &mut WriteBatch, digest: &ObjectDigest) {
        batch.put(row_key(UNSYNCED_OBJECTS, digest.as_bytes()), vec![]);
    }

    /// Queues removal of a piece from the unsynced set.
    pub fn mark_object_synced(&self, batch: &mut WriteBatch, digest: &ObjectDigest) {
        batch.delete(row_key(UNSYNCED_OBJECTS, digest.as_bytes()));
    }

    /// Whether the piece has been acknowledged by the cloud.
    pub fn is_object_synced(&self, digest: &ObjectDigest) -> StatusResult<bool> {
        Ok(!self
            .db
            .has_key(&row_key(UNSYNCED_OBJECTS, digest.as_bytes()))?)
    }

    /// Digests of pieces not yet uploaded, sorted.
    pub fn unsynced_objects(&self) -> StatusResult<Vec<ObjectDigest>> {
        let rows = self.db.get_by_prefix(UNSYNCED_OBJECTS)?;
        rows.into_iter()
            .map(|(key, _)| ObjectDigest::from_bytes(&key[UNSYNCED_OBJECTS.len()..]))
            .collect()
    }

    // --- device clock ---

    /// The encoded device clock, if one was stored.
    pub fn clock_bytes(&self) -> StatusResult<Option<Vec<u8>>> {
        self.db.get(DEVICE_CLOCK)
    }

    /// Queues storage of the encoded device clock.
    pub fn set_clock_bytes(&self, batch: &mut WriteBatch, bytes: &[u8]) {
        batch.put(DEVICE_CLOCK.to_vec(), bytes.to_vec());
    }

    // --- sync metadata ---

    /// Reads an arbitrary sync metadata row.
    pub fn sync_metadata(&self, key: &[u8]) -> StatusResult<Option<Vec<u8>>> {
        self.db.get(&row_key(SYNC_METADATA, key))
    }

    /// Queues storage of an arbitrary sync metadata row.
    pub fn set_sync_metadata(&self, batch: &mut WriteBatch, key: &[u8], value: &[u8]) {
        batch.put(row_key(SYNC_METADATA, key), value.to_vec());
    }

    /// Queues removal of a sync metadata row.
    pub fn delete_sync_metadata(&self, batch: &mut WriteBatch, key: &[u8]) {
        batch.delete(row_key(SYNC_METADATA, key));
    }

    /// Sync metadata rows under `prefix`, with the prefix stripped.
    pub fn sync_metadata_by_prefix(
        &self,
        prefix: &[u8],
    ) -> StatusResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let full_prefix = row_key(SYNC_METADATA, prefix);
        let rows = self.db.get_by_prefix(&full_prefix)?;
        Ok(rows
            .into_iter()
            .map(|(key, value)| (key[SYNC_METADATA.len()..].to_vec(), value))
            .collect())
    }
}

impl Debug for PageDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("PageDb").field("db", &self.db).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDb;
    use crate::piece::PieceType;

    fn new_page_db() -> PageDb {
        PageDb::new(Arc::new(MemoryDb::new()))
    }

    fn commit_id(n: u8) -> CommitId {
        CommitId::new(ObjectDigest::compute(PieceType::Commit, &[n]).to_bytes())
    }

    fn digest(n: u8) -> ObjectDigest {
        ObjectDigest::compute(PieceType::InlineBlob, &[n])
    }

    #[test]
    fn test_heads_round_trip() {
        let db = new_page_db();
        assert_eq!(db.heads().unwrap(), vec![]);

        let (a, b) = (commit_id(1), commit_id(2));
        let mut batch = WriteBatch::new();
        db.insert_head(&mut batch, &a);
        db.insert_head(&mut batch, &b);
        db.write(batch).unwrap();

        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(db.heads().unwrap(), expected);

        let mut batch = WriteBatch::new();
        db.remove_head(&mut batch, &a);
        db.write(batch).unwrap();
        assert_eq!(db.heads().unwrap(), vec![b]);
    }

    #[test]
    fn test_refcount_varint_round_trip() {
        let db = new_page_db();
        let d = digest(1);
        assert_eq!(db.refcount(&d).unwrap(), 0);

        let mut batch = WriteBatch::new();
        db.set_refcount(&mut batch, &d, 300);
        db.write(batch).unwrap();
        assert_eq!(db.refcount(&d).unwrap(), 300);

        let mut batch = WriteBatch::new();
        db.set_refcount(&mut batch, &d, 0);
        db.write(batch).unwrap();
        assert_eq!(db.refcount(&d).unwrap(), 0);
        // A zero refcount leaves no row behind.
        assert!(!db.db().has_key(&row_key(REFCOUNTS, d.as_bytes())).unwrap());
    }

    #[test]
    fn test_unsynced_commits_generation_order() {
        let db = new_page_db();
        let mut batch = WriteBatch::new();
        db.mark_commit_unsynced(&mut batch, &commit_id(9), 3);
        db.mark_commit_unsynced(&mut batch, &commit_id(7), 1);
        db.mark_commit_unsynced(&mut batch, &commit_id(8), 2);
        db.write(batch).unwrap();

        let unsynced = db.unsynced_commits().unwrap();
        assert_eq!(
            unsynced.iter().map(|(_, g)| *g).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let mut batch = WriteBatch::new();
        db.mark_commit_synced(&mut batch, &commit_id(7));
        db.write(batch).unwrap();
        assert_eq!(db.unsynced_commits().unwrap().len(), 2);
    }

    #[test]
    fn test_object_sync_marks() {
        let db = new_page_db();
        let d = digest(2);
        // Absent from the unsynced set means synced.
        assert!(db.is_object_synced(&d).unwrap());

        let mut batch = WriteBatch::new();
        db.mark_object_unsynced(&mut batch, &d);
        db.write(batch).unwrap();
        assert!(!db.is_object_synced(&d).unwrap());
        assert_eq!(db.unsynced_objects().unwrap(), vec![d.clone()]);

        let mut batch = WriteBatch::new();
        db.mark_object_synced(&mut batch, &d);
        db.write(batch).unwrap();
        assert!(db.is_object_synced(&d).unwrap());
    }

    #[test]
    fn test_sync_metadata_prefix() {
        let db = new_page_db();
        let mut batch = WriteBatch::new();
        db.set_sync_metadata(&mut batch, b"interested/peer1", b"");
        db.set_sync_metadata(&mut batch, b"interested/peer2", b"");
        db.set_sync_metadata(&mut batch, b"cloud_position", b"token");
        db.write(batch).unwrap();

        let interested = db.sync_metadata_by_prefix(b"interested/").unwrap();
        assert_eq!(interested.len(), 2);
        assert_eq!(interested[0].0, b"interested/peer1".to_vec());
        assert_eq!(
            db.sync_metadata(b"cloud_position").unwrap(),
            Some(b"token".to_vec())
        );
    }
}
