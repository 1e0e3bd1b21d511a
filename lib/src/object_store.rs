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

//! Piece storage: chunked blobs, reference counts and garbage collection.
//!
//! The object store exclusively owns the on-disk piece bytes and their
//! reference counts. Values above the chunking threshold are split by a
//! content-defined, per-page-keyed algorithm into chunk pieces listed by an
//! index piece; recomposition is a depth-first concatenation.
//!
//! Two kinds of references keep a piece alive: on-disk counts (from commits
//! to tree roots, and from tree nodes to children and values) and live
//! references (outstanding [`ObjectIdentifier`]s, including those held by
//! snapshots). A piece is only deleted when it has neither kind and the
//! garbage collection policy permits deletion.

use std::collections::BTreeMap;
use std::sync::Arc;

use pollster::FutureExt as _;
use prost::Message as _;

use crate::btree;
use crate::chunking;
use crate::chunking::SplitPermutation;
use crate::db::WriteBatch;
use crate::environment::GarbageCollectionPolicy;
use crate::lru_cache::LruCache;
use crate::page_db::PageDb;
use crate::piece::ChangeSource;
use crate::piece::ObjectDigest;
use crate::piece::ObjectIdentifier;
use crate::piece::ObjectIdentifierFactory;
use crate::piece::PieceType;
use crate::protos;
use crate::status::Status;
use crate::status::StatusResult;

const PIECE_CACHE_CAPACITY: usize = 1000;

// Above this many children, blob indexes are stacked recursively.
const MAX_INDEX_CHILDREN: usize = 64;

/// Content-addressed piece storage for one page.
#[derive(Debug)]
pub struct ObjectStore {
    db: Arc<PageDb>,
    factory: ObjectIdentifierFactory,
    permutation: SplitPermutation,
    gc_policy: GarbageCollectionPolicy,
    cache: LruCache<ObjectDigest, Arc<Vec<u8>>, Status>,
}

impl ObjectStore {
    /// Creates a store over the page's rows. `chunking_seed` keys the
    /// content-defined chunking so that distinct pages split identical
    /// content differently.
    pub fn new(
        db: Arc<PageDb>,
        chunking_seed: &[u8],
        gc_policy: GarbageCollectionPolicy,
    ) -> Self {
        Self {
            db,
            factory: ObjectIdentifierFactory::new(),
            permutation: SplitPermutation::new(chunking_seed),
            gc_policy,
            cache: LruCache::new(PIECE_CACHE_CAPACITY),
        }
    }

    /// The factory producing live-tracked identifiers for this page.
    pub fn factory(&self) -> &ObjectIdentifierFactory {
        &self.factory
    }

    /// The page rows this store writes to.
    pub(crate) fn page_db(&self) -> &Arc<PageDb> {
        &self.db
    }

    /// Creates a tracked identifier for an already-known digest.
    pub fn make_identifier(&self, key_index: u32, digest: ObjectDigest) -> ObjectIdentifier {
        self.factory.make_identifier(key_index, digest)
    }

    fn source_starts_synced(source: ChangeSource) -> bool {
        match source {
            ChangeSource::Local => false,
            ChangeSource::Cloud => true,
            ChangeSource::P2p => false,
        }
    }

    /// Stores a value, chunking it if necessary, and returns the identifier
    /// of its root piece. Idempotent: re-adding existing content is a no-op.
    pub fn add_piece(
        &self,
        bytes: &[u8],
        source: ChangeSource,
    ) -> StatusResult<ObjectIdentifier> {
        self.add_piece_with_sync_status(bytes, source, Self::source_starts_synced(source))
    }

    /// Like [`Self::add_piece`], with the cloud-sync status carried
    /// explicitly (pieces received over p2p know whether the cloud has them).
    pub fn add_piece_with_sync_status(
        &self,
        bytes: &[u8],
        _source: ChangeSource,
        synced_to_cloud: bool,
    ) -> StatusResult<ObjectIdentifier> {
        if bytes.len() <= chunking::MAX_CHUNK_SIZE {
            return self.write_piece(PieceType::InlineBlob, bytes, synced_to_cloud, &[]);
        }

        // Chunk, then stack indexes until a single root remains.
        let mut children: Vec<protos::store::BlobChild> = vec![];
        for range in chunking::split(bytes, &self.permutation) {
            let chunk = &bytes[range.clone()];
            let id = self.write_piece(PieceType::InlineBlob, chunk, synced_to_cloud, &[])?;
            children.push(protos::store::BlobChild {
                digest: id.digest().to_bytes(),
                size: range.len() as u64,
            });
        }
        loop {
            if children.len() <= MAX_INDEX_CHILDREN {
                return self.write_index(children, synced_to_cloud);
            }
            let mut parents = vec![];
            for group in children.chunks(MAX_INDEX_CHILDREN) {
                let id = self.write_index(group.to_vec(), synced_to_cloud)?;
                parents.push(protos::store::BlobChild {
                    digest: id.digest().to_bytes(),
                    size: group.iter().map(|child| child.size).sum(),
                });
            }
            children = parents;
        }
    }

    fn write_index(
        &self,
        children: Vec<protos::store::BlobChild>,
        synced_to_cloud: bool,
    ) -> StatusResult<ObjectIdentifier> {
        let referenced = children
            .iter()
            .map(|child| ObjectDigest::from_bytes(&child.digest))
            .collect::<StatusResult<Vec<_>>>()?;
        let index = protos::store::BlobIndex { children };
        self.write_piece(
            PieceType::BlobRoot,
            &index.encode_to_vec(),
            synced_to_cloud,
            &referenced,
        )
    }

    /// Writes one piece and records its outgoing references. Used by the
    /// blob path above and by the b-tree when it persists nodes.
    pub(crate) fn write_piece(
        &self,
        piece_type: PieceType,
        bytes: &[u8],
        synced_to_cloud: bool,
        references: &[ObjectDigest],
    ) -> StatusResult<ObjectIdentifier> {
        let digest = ObjectDigest::compute(piece_type, bytes);
        let identifier = self.factory.make_identifier(0, digest.clone());
        if self.db.has_object(&digest)? {
            return Ok(identifier);
        }

        let mut batch = WriteBatch::new();
        self.db.put_object(&mut batch, &digest, bytes);
        if !synced_to_cloud {
            self.db.mark_object_unsynced(&mut batch, &digest);
        }
        self.stage_reference_deltas(&mut batch, references, 1)?;
        self.db.write(batch)?;
        Ok(identifier)
    }

    fn stage_reference_deltas(
        &self,
        batch: &mut WriteBatch,
        digests: &[ObjectDigest],
        delta: i64,
    ) -> StatusResult<()> {
        let mut deltas: BTreeMap<&ObjectDigest, i64> = BTreeMap::new();
        for digest in digests {
            *deltas.entry(digest).or_default() += delta;
        }
        for (digest, delta) in deltas {
            let current = i64::try_from(self.db.refcount(digest)?)
                .map_err(|_| Status::DataIntegrity(format!("refcount overflow for {digest}")))?;
            let next = current + delta;
            if next < 0 {
                tracing::error!(%digest, current, delta, "reference count would go negative");
                return Err(Status::DataIntegrity(format!(
                    "reference count inconsistency for {digest}"
                )));
            }
            self.db.set_refcount(batch, digest, next as u64);
        }
        Ok(())
    }

    /// Records additional incoming references (e.g. from a new commit to its
    /// root node). Written before the referencing record so that a crash in
    /// between leaks a count instead of dangling a reference.
    pub(crate) fn increment_references(&self, digests: &[ObjectDigest]) -> StatusResult<()> {
        if digests.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        self.stage_reference_deltas(&mut batch, digests, 1)?;
        self.db.write(batch)
    }

    /// Adopts a piece received from sync under its advertised digest,
    /// verifying the content first. The piece keeps its original type
    /// (chunk, index, tree node), and the references its body holds are
    /// recorded.
    pub fn add_received_piece(
        &self,
        digest: &ObjectDigest,
        bytes: &[u8],
        synced_to_cloud: bool,
    ) -> StatusResult<ObjectIdentifier> {
        if !digest.matches_content(bytes) {
            return Err(Status::DataIntegrity(format!(
                "received piece does not match its advertised digest {digest}"
            )));
        }
        let identifier = self.factory.make_identifier(0, digest.clone());
        if self.db.has_object(digest)? {
            return Ok(identifier);
        }
        let references = piece_references(digest.piece_type(), bytes)?;
        let mut batch = WriteBatch::new();
        self.db.put_object(&mut batch, digest, bytes);
        if !synced_to_cloud {
            self.db.mark_object_unsynced(&mut batch, digest);
        }
        self.stage_reference_deltas(&mut batch, &references, 1)?;
        self.db.write(batch)?;
        Ok(identifier)
    }

    /// Whether the piece bytes are present locally.
    pub fn has_piece(&self, digest: &ObjectDigest) -> StatusResult<bool> {
        self.db.has_object(digest)
    }

    /// Reads and digest-verifies one piece, through the LRU cache.
    pub(crate) fn read_piece_bytes(&self, digest: &ObjectDigest) -> StatusResult<Arc<Vec<u8>>> {
        let db = &self.db;
        self.cache
            .get(digest.clone(), |digest: ObjectDigest| async move {
                let Some(bytes) = db.object_bytes(&digest)? else {
                    return Err(Status::InternalNotFound(digest.hex()));
                };
                if !digest.matches_content(&bytes) {
                    tracing::error!(%digest, "stored piece does not match its digest");
                    return Err(Status::DataIntegrity(format!(
                        "piece {digest} fails digest verification"
                    )));
                }
                Ok(Arc::new(bytes))
            })
            .block_on()
    }

    /// Reads the full content addressed by `identifier`, recomposing chunked
    /// blobs.
    pub fn get_piece(&self, identifier: &ObjectIdentifier) -> StatusResult<Vec<u8>> {
        let digest = identifier.digest();
        match digest.piece_type() {
            PieceType::BlobRoot => {
                let mut out = vec![];
                self.read_blob_content(digest, &mut out)?;
                Ok(out)
            }
            _ => Ok(self.read_piece_bytes(digest)?.as_ref().clone()),
        }
    }

    fn read_blob_content(&self, digest: &ObjectDigest, out: &mut Vec<u8>) -> StatusResult<()> {
        let bytes = self.read_piece_bytes(digest)?;
        match digest.piece_type() {
            PieceType::BlobRoot => {
                for child in decode_index(&bytes)?.children {
                    let child_digest = ObjectDigest::from_bytes(&child.digest)?;
                    self.read_blob_content(&child_digest, out)?;
                }
                Ok(())
            }
            _ => {
                out.extend_from_slice(&bytes);
                Ok(())
            }
        }
    }

    /// Logical size in bytes of the content addressed by `identifier`.
    pub fn object_size(&self, identifier: &ObjectIdentifier) -> StatusResult<u64> {
        let digest = identifier.digest();
        let bytes = self.read_piece_bytes(digest)?;
        match digest.piece_type() {
            PieceType::BlobRoot => Ok(decode_index(&bytes)?
                .children
                .iter()
                .map(|child| child.size)
                .sum()),
            _ => Ok(bytes.len() as u64),
        }
    }

    /// Partial read with signed-offset semantics: a negative `offset` counts
    /// from the end, `max_size == -1` means "to the end", and out-of-range
    /// offsets yield empty output rather than an error.
    pub fn get_object_part(
        &self,
        identifier: &ObjectIdentifier,
        offset: i64,
        max_size: i64,
    ) -> StatusResult<Vec<u8>> {
        let size = i128::from(self.object_size(identifier)?);
        let offset = i128::from(offset);
        let start = if offset < 0 {
            (size + offset).max(0)
        } else {
            offset.min(size)
        };
        let len = if max_size < 0 {
            size - start
        } else {
            i128::from(max_size).min(size - start)
        };
        let mut out = Vec::with_capacity(len as usize);
        if len > 0 {
            self.read_piece_range(identifier.digest(), start as u64, len as u64, &mut out)?;
        }
        Ok(out)
    }

    fn read_piece_range(
        &self,
        digest: &ObjectDigest,
        skip: u64,
        take: u64,
        out: &mut Vec<u8>,
    ) -> StatusResult<()> {
        if take == 0 {
            return Ok(());
        }
        let bytes = self.read_piece_bytes(digest)?;
        match digest.piece_type() {
            PieceType::BlobRoot => {
                let mut remaining_skip = skip;
                let mut remaining_take = take;
                for child in decode_index(&bytes)?.children {
                    let child_digest = ObjectDigest::from_bytes(&child.digest)?;
                    if remaining_skip >= child.size {
                        remaining_skip -= child.size;
                        continue;
                    }
                    let available = child.size - remaining_skip;
                    let child_take = available.min(remaining_take);
                    self.read_piece_range(&child_digest, remaining_skip, child_take, out)?;
                    remaining_take -= child_take;
                    remaining_skip = 0;
                    if remaining_take == 0 {
                        break;
                    }
                }
                if remaining_take > 0 {
                    return Err(Status::DataIntegrity(format!(
                        "blob index {digest} is shorter than its declared size"
                    )));
                }
                Ok(())
            }
            _ => {
                let len = bytes.len() as u64;
                if skip + take > len {
                    return Err(Status::DataIntegrity(format!(
                        "chunk {digest} is shorter than its declared size"
                    )));
                }
                out.extend_from_slice(&bytes[skip as usize..(skip + take) as usize]);
                Ok(())
            }
        }
    }

    /// Flips a piece's provenance bit to synced.
    pub fn mark_piece_synced(&self, digest: &ObjectDigest) -> StatusResult<()> {
        let mut batch = WriteBatch::new();
        self.db.mark_object_synced(&mut batch, digest);
        self.db.write(batch)
    }

    /// Whether the cloud has acknowledged this piece.
    pub fn is_piece_synced(&self, digest: &ObjectDigest) -> StatusResult<bool> {
        self.db.is_object_synced(digest)
    }

    /// Digests of pieces awaiting upload.
    pub fn unsynced_pieces(&self) -> StatusResult<Vec<ObjectDigest>> {
        self.db.unsynced_objects()
    }

    /// Removes the piece iff it has no on-disk references, no live
    /// identifiers, and the GC policy allows deletion. References held by
    /// the deleted piece are released in cascade.
    pub fn delete_if_unreferenced(&self, digest: &ObjectDigest) -> StatusResult<bool> {
        if self.gc_policy == GarbageCollectionPolicy::Never {
            return Ok(false);
        }
        self.delete_if_eligible(digest)
    }

    fn delete_if_eligible(&self, digest: &ObjectDigest) -> StatusResult<bool> {
        if self.db.refcount(digest)? != 0 || self.factory.is_live(digest) {
            return Ok(false);
        }
        let Some(bytes) = self.db.object_bytes(digest)? else {
            return Ok(false);
        };
        let references = piece_references(digest.piece_type(), &bytes)?;

        let mut batch = WriteBatch::new();
        self.db.delete_object(&mut batch, digest);
        self.db.mark_object_synced(&mut batch, digest);
        self.db.write(batch)?;
        self.cache.remove(digest);
        tracing::debug!(%digest, "collected unreferenced piece");

        for child in references {
            let count = self.db.refcount(&child)?;
            if count == 0 {
                // Referential inconsistency: log and leave the child alone
                // rather than deleting through a bad count.
                tracing::error!(parent = %digest, %child, "reference count already zero");
                continue;
            }
            let mut batch = WriteBatch::new();
            self.db.set_refcount(&mut batch, &child, count - 1);
            self.db.write(batch)?;
            if count == 1 {
                self.delete_if_eligible(&child)?;
            }
        }
        Ok(true)
    }

    /// Runs a collection round over every digest whose last live identifier
    /// has been dropped since the previous round.
    pub fn collect_garbage(&self) -> StatusResult<()> {
        let expired = self.factory.take_expired();
        if self.gc_policy != GarbageCollectionPolicy::EagerLiveReferences {
            return Ok(());
        }
        for digest in expired {
            self.delete_if_unreferenced(&digest)?;
        }
        Ok(())
    }
}

fn decode_index(bytes: &[u8]) -> StatusResult<protos::store::BlobIndex> {
    protos::store::BlobIndex::decode(bytes)
        .map_err(|err| Status::DataIntegrity(format!("malformed blob index: {err}")))
}

// Outgoing references held by a piece's body.
pub(crate) fn piece_references(
    piece_type: PieceType,
    bytes: &[u8],
) -> StatusResult<Vec<ObjectDigest>> {
    match piece_type {
        PieceType::InlineBlob | PieceType::Commit => Ok(vec![]),
        PieceType::BlobRoot => decode_index(bytes)?
            .children
            .iter()
            .map(|child| ObjectDigest::from_bytes(&child.digest))
            .collect(),
        PieceType::TreeNodeInternal | PieceType::TreeNodeLeaf => btree::node_references(bytes),
    }
}
