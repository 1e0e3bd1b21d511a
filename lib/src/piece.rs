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

//! Content-addressed pieces and the identifiers that keep them alive.
//!
//! A piece is a byte range addressed by its [`ObjectDigest`]. Client values,
//! b-tree nodes and commit bodies are all stored as pieces. Identifiers
//! handed out to callers ([`ObjectIdentifier`]) carry a live-reference token;
//! dropping the last identifier for a digest reports the digest back to its
//! [`ObjectIdentifierFactory`] so that garbage collection can consider it.

use std::cmp::Ordering;
use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use blake2::Blake2b512;
use digest::Digest as _;

use crate::hex_util;
use crate::status::Status;
use crate::status::StatusResult;

/// Width of the hash part of a digest, in bytes.
pub const DIGEST_HASH_SIZE: usize = 32;

/// Total width of an encoded digest: one type tag byte plus the hash.
pub const DIGEST_SIZE: usize = DIGEST_HASH_SIZE + 1;

/// The kind of piece a digest refers to, encoded in the digest's first byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PieceType {
    /// A blob small enough to be stored as a single piece.
    InlineBlob,
    /// The root of a chunked blob; its body lists child digests.
    BlobRoot,
    /// An internal b-tree node.
    TreeNodeInternal,
    /// A leaf b-tree node.
    TreeNodeLeaf,
    /// A commit body.
    Commit,
}

impl PieceType {
    /// The tag byte stored as the first byte of the digest.
    pub fn tag(self) -> u8 {
        match self {
            Self::InlineBlob => 0,
            Self::BlobRoot => 1,
            Self::TreeNodeInternal => 2,
            Self::TreeNodeLeaf => 3,
            Self::Commit => 4,
        }
    }

    /// Decodes a tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::InlineBlob),
            1 => Some(Self::BlobRoot),
            2 => Some(Self::TreeNodeInternal),
            3 => Some(Self::TreeNodeLeaf),
            4 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// A fixed-width content-derived identifier of a stored piece.
///
/// Two pieces with the same byte content (and type) share the same digest.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct ObjectDigest(Vec<u8>);

impl ObjectDigest {
    /// Computes the digest of `content` as a piece of type `piece_type`.
    pub fn compute(piece_type: PieceType, content: &[u8]) -> Self {
        let mut hasher = Blake2b512::new();
        hasher.update([piece_type.tag()]);
        hasher.update(content);
        let hash = hasher.finalize();
        let mut bytes = Vec::with_capacity(DIGEST_SIZE);
        bytes.push(piece_type.tag());
        bytes.extend_from_slice(&hash[..DIGEST_HASH_SIZE]);
        Self(bytes)
    }

    /// Reconstructs a digest from its serialized bytes, validating shape and
    /// tag.
    pub fn from_bytes(bytes: &[u8]) -> StatusResult<Self> {
        if bytes.len() != DIGEST_SIZE {
            return Err(Status::DataIntegrity(format!(
                "digest has {} bytes, expected {DIGEST_SIZE}",
                bytes.len()
            )));
        }
        if PieceType::from_tag(bytes[0]).is_none() {
            return Err(Status::DataIntegrity(format!(
                "unknown digest type tag {}",
                bytes[0]
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    /// The piece type encoded in this digest.
    pub fn piece_type(&self) -> PieceType {
        PieceType::from_tag(self.0[0]).unwrap()
    }

    /// The serialized digest: tag byte followed by the hash.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Owned serialized digest bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.clone()
    }

    /// Hex representation, used in row keys and logging.
    pub fn hex(&self) -> String {
        hex_util::encode_hex(&self.0)
    }

    /// Checks that `content` hashes to this digest.
    pub fn matches_content(&self, content: &[u8]) -> bool {
        Self::compute(self.piece_type(), content) == *self
    }
}

impl Debug for ObjectDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("ObjectDigest").field(&self.hex()).finish()
    }
}

impl fmt::Display for ObjectDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.pad(&self.hex())
    }
}

/// Where a piece or commit came from. Recorded as provenance to drive
/// unsynced-work tracking and to avoid echoing peers' commits back at them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeSource {
    /// Created by a local client operation.
    Local,
    /// Downloaded from the cloud; already known to the cloud.
    Cloud,
    /// Received from a peer. Whether the cloud knows it is carried
    /// separately.
    P2p,
}

struct FactoryInner {
    // Live tokens by digest. A dead Weak means the last identifier was
    // dropped but the entry has not been cleaned up yet.
    live: std::collections::HashMap<ObjectDigest, Weak<LiveToken>>,
    // Digests whose last live identifier was dropped, awaiting a GC sweep.
    expired: Vec<ObjectDigest>,
}

/// Tracks which digests have outstanding [`ObjectIdentifier`]s.
///
/// The factory only observes liveness; deciding whether an expired digest
/// can actually be deleted (on-disk reference counts, GC policy) is the
/// object store's job.
pub struct ObjectIdentifierFactory {
    inner: Arc<Mutex<FactoryInner>>,
}

impl ObjectIdentifierFactory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FactoryInner {
                live: std::collections::HashMap::new(),
                expired: Vec::new(),
            })),
        }
    }

    /// Creates a tracked identifier for `digest`. Identifiers for the same
    /// digest share one live token.
    pub fn make_identifier(&self, key_index: u32, digest: ObjectDigest) -> ObjectIdentifier {
        let token = {
            let mut inner = self.inner.lock().unwrap();
            match inner.live.get(&digest).and_then(Weak::upgrade) {
                Some(token) => token,
                None => {
                    let token = Arc::new(LiveToken {
                        digest: digest.clone(),
                        factory: Arc::downgrade(&self.inner),
                    });
                    inner.live.insert(digest.clone(), Arc::downgrade(&token));
                    token
                }
            }
        };
        ObjectIdentifier {
            key_index,
            digest,
            token: Some(token),
        }
    }

    /// Whether any identifier for `digest` is still alive.
    pub fn is_live(&self, digest: &ObjectDigest) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .live
            .get(digest)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Number of digests with live identifiers.
    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .live
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Drains the digests whose last identifier was dropped since the
    /// previous call.
    pub fn take_expired(&self) -> Vec<ObjectDigest> {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.expired)
    }
}

impl Default for ObjectIdentifierFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ObjectIdentifierFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("ObjectIdentifierFactory")
            .field("live", &inner.live.len())
            .field("expired", &inner.expired.len())
            .finish()
    }
}

pub(crate) struct LiveToken {
    digest: ObjectDigest,
    factory: Weak<Mutex<FactoryInner>>,
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        let Some(inner) = self.factory.upgrade() else {
            return;
        };
        let mut inner = inner.lock().unwrap();
        // Only clean up our own map entry: a new token may already have been
        // created for the same digest between our refcount reaching zero and
        // this drop running.
        let stale = inner
            .live
            .get(&self.digest)
            .is_some_and(|weak| weak.as_ptr() == std::ptr::from_ref(self));
        if stale {
            inner.live.remove(&self.digest);
            inner.expired.push(self.digest.clone());
        }
    }
}

/// A shared handle on a stored piece: the digest plus the encryption key
/// generation (`key_index`) its ciphertext was written under.
///
/// Identifiers created through a factory keep the piece alive with respect to
/// eager garbage collection. Untracked identifiers (from the wire) carry no
/// such guarantee.
#[derive(Clone)]
pub struct ObjectIdentifier {
    key_index: u32,
    digest: ObjectDigest,
    token: Option<Arc<LiveToken>>,
}

impl ObjectIdentifier {
    /// Creates an identifier that does not pin the piece. Used for
    /// identifiers decoded from sync messages before the piece is adopted
    /// locally.
    pub fn untracked(key_index: u32, digest: ObjectDigest) -> Self {
        Self {
            key_index,
            digest,
            token: None,
        }
    }

    /// The encryption key generation for this piece's ciphertext.
    pub fn key_index(&self) -> u32 {
        self.key_index
    }

    /// The digest of the referenced piece.
    pub fn digest(&self) -> &ObjectDigest {
        &self.digest
    }

    /// Whether this identifier pins the piece against eager GC.
    pub fn is_tracked(&self) -> bool {
        self.token.is_some()
    }
}

impl PartialEq for ObjectIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.key_index == other.key_index && self.digest == other.digest
    }
}

impl Eq for ObjectIdentifier {}

impl PartialOrd for ObjectIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.key_index, &self.digest).cmp(&(other.key_index, &other.digest))
    }
}

impl Hash for ObjectIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_index.hash(state);
        self.digest.hash(state);
    }
}

impl Debug for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("ObjectIdentifier")
            .field("key_index", &self.key_index)
            .field("digest", &self.digest)
            .field("tracked", &self.is_tracked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_content_derived() {
        let a = ObjectDigest::compute(PieceType::InlineBlob, b"hello");
        let b = ObjectDigest::compute(PieceType::InlineBlob, b"hello");
        let c = ObjectDigest::compute(PieceType::InlineBlob, b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_bytes().len(), DIGEST_SIZE);
        assert_eq!(a.hex(), hex::encode(a.as_bytes()));
        assert!(a.matches_content(b"hello"));
        assert!(!a.matches_content(b"world"));
    }

    #[test]
    fn test_digest_type_tag_distinguishes() {
        let blob = ObjectDigest::compute(PieceType::InlineBlob, b"data");
        let node = ObjectDigest::compute(PieceType::TreeNodeLeaf, b"data");
        assert_ne!(blob, node);
        assert_eq!(blob.piece_type(), PieceType::InlineBlob);
        assert_eq!(node.piece_type(), PieceType::TreeNodeLeaf);
    }

    #[test]
    fn test_digest_from_bytes_rejects_garbage() {
        assert_matches::assert_matches!(
            ObjectDigest::from_bytes(b"short"),
            Err(Status::DataIntegrity(_))
        );
        let mut bytes = ObjectDigest::compute(PieceType::Commit, b"x").to_bytes();
        bytes[0] = 0xff;
        assert_matches::assert_matches!(
            ObjectDigest::from_bytes(&bytes),
            Err(Status::DataIntegrity(_))
        );
    }

    #[test]
    fn test_factory_tracks_liveness() {
        let factory = ObjectIdentifierFactory::new();
        let digest = ObjectDigest::compute(PieceType::InlineBlob, b"value");

        let id1 = factory.make_identifier(0, digest.clone());
        let id2 = factory.make_identifier(0, digest.clone());
        assert_eq!(id1, id2);
        assert!(factory.is_live(&digest));

        drop(id1);
        assert!(factory.is_live(&digest));
        assert_eq!(factory.take_expired(), vec![]);

        drop(id2);
        assert!(!factory.is_live(&digest));
        assert_eq!(factory.take_expired(), vec![digest.clone()]);
        // Draining is one-shot.
        assert_eq!(factory.take_expired(), vec![]);
    }

    #[test]
    fn test_factory_revival_after_drop() {
        let factory = ObjectIdentifierFactory::new();
        let digest = ObjectDigest::compute(PieceType::InlineBlob, b"value");

        drop(factory.make_identifier(0, digest.clone()));
        let _kept = factory.make_identifier(0, digest.clone());
        // The first drop expired the digest, but the new identifier keeps it
        // live again.
        assert_eq!(factory.take_expired(), vec![digest.clone()]);
        assert!(factory.is_live(&digest));
    }

    #[test]
    fn test_untracked_identifier() {
        let digest = ObjectDigest::compute(PieceType::BlobRoot, b"index");
        let id = ObjectIdentifier::untracked(3, digest.clone());
        assert!(!id.is_tracked());
        assert_eq!(id.key_index(), 3);
        assert_eq!(id.digest(), &digest);
    }
}
