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

//! Immutable commits.
//!
//! A commit ties a b-tree root to its parent commits. The id is derived from
//! the serialized body, so the same body always produces the same id on
//! every device.

use prost::Message as _;
use smallvec::SmallVec;

use crate::object_id::id_type;
use crate::object_id::ObjectId as _;
use crate::piece::ObjectDigest;
use crate::piece::ObjectIdentifier;
use crate::piece::ObjectIdentifierFactory;
use crate::piece::PieceType;
use crate::protos;
use crate::status::Status;
use crate::status::StatusResult;

id_type!(
    /// Content-derived identifier of a [`Commit`].
    pub CommitId
);

/// The maximum number of parents a commit can have. Merge commits always
/// have exactly two.
pub const MAX_PARENT_COUNT: usize = 2;

/// An immutable commit: a b-tree root, up to two parents, and ordering
/// metadata.
#[derive(Clone, PartialEq, Eq)]
pub struct Commit {
    id: CommitId,
    root: ObjectIdentifier,
    // At most two parents, so they live inline.
    parents: SmallVec<[CommitId; MAX_PARENT_COUNT]>,
    generation: u64,
    timestamp_millis: i64,
}

impl Commit {
    /// Assembles a commit from its parts, deriving the id from the encoded
    /// body.
    pub fn build(
        root: ObjectIdentifier,
        parents: Vec<CommitId>,
        generation: u64,
        timestamp_millis: i64,
    ) -> StatusResult<Self> {
        if parents.len() > MAX_PARENT_COUNT {
            return Err(Status::IllegalState(format!(
                "commit cannot have {} parents",
                parents.len()
            )));
        }
        let mut commit = Self {
            id: CommitId::new(vec![]),
            root,
            parents: SmallVec::from_vec(parents),
            generation,
            timestamp_millis,
        };
        commit.id = CommitId::new(
            ObjectDigest::compute(PieceType::Commit, &commit.encode()).to_bytes(),
        );
        Ok(commit)
    }

    /// Decodes a commit body, recomputing and validating its id.
    pub fn from_bytes(bytes: &[u8], factory: &ObjectIdentifierFactory) -> StatusResult<Self> {
        let proto = protos::store::Commit::decode(bytes)
            .map_err(|err| Status::DataIntegrity(format!("malformed commit body: {err}")))?;
        let root_proto = proto
            .root
            .ok_or_else(|| Status::DataIntegrity("commit body has no root".to_string()))?;
        let root_digest = ObjectDigest::from_bytes(&root_proto.digest)?;
        let root = factory.make_identifier(root_proto.key_index, root_digest);
        let parents = proto
            .parents
            .iter()
            .map(|bytes| ObjectDigest::from_bytes(bytes).map(|d| CommitId::new(d.to_bytes())))
            .collect::<StatusResult<Vec<_>>>()?;
        let commit = Self::build(root, parents, proto.generation, proto.timestamp_millis)?;
        if !commit.encode().eq(bytes) {
            // Re-encoding must reproduce the input exactly, otherwise the
            // derived id would not match the sender's.
            return Err(Status::DataIntegrity(
                "commit body does not round-trip".to_string(),
            ));
        }
        Ok(commit)
    }

    /// Decodes a commit body and checks it against the id it was advertised
    /// under.
    pub fn from_bytes_with_id(
        expected_id: &CommitId,
        bytes: &[u8],
        factory: &ObjectIdentifierFactory,
    ) -> StatusResult<Self> {
        let commit = Self::from_bytes(bytes, factory)?;
        if commit.id() != expected_id {
            return Err(Status::DataIntegrity(format!(
                "commit body hashes to {} but was advertised as {}",
                commit.id(),
                expected_id
            )));
        }
        Ok(commit)
    }

    /// Serializes the commit body. The id is derived from these bytes.
    pub fn encode(&self) -> Vec<u8> {
        let proto = protos::store::Commit {
            root: Some(protos::store::ObjectIdentifier {
                key_index: self.root.key_index(),
                digest: self.root.digest().to_bytes(),
            }),
            parents: self.parents.iter().map(|id| id.to_bytes()).collect(),
            generation: self.generation,
            timestamp_millis: self.timestamp_millis,
        };
        proto.encode_to_vec()
    }

    /// The commit id.
    pub fn id(&self) -> &CommitId {
        &self.id
    }

    /// Identifier of the b-tree root this commit pins.
    pub fn root(&self) -> &ObjectIdentifier {
        &self.root
    }

    /// Parent commit ids, in the order they were recorded.
    pub fn parents(&self) -> &[CommitId] {
        &self.parents
    }

    /// Distance from the root commit: `max(parent generations) + 1`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Creation time, milliseconds since the epoch. Merge commits use the
    /// maximum of their parents' timestamps so that convergent merges are
    /// byte-identical.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp_millis
    }

    /// Whether this commit has two parents.
    pub fn is_merge(&self) -> bool {
        self.parents.len() == 2
    }
}

impl std::fmt::Debug for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Commit")
            .field("id", &self.id)
            .field("parents", &self.parents)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn test_root(factory: &ObjectIdentifierFactory, content: &[u8]) -> ObjectIdentifier {
        factory.make_identifier(0, ObjectDigest::compute(PieceType::TreeNodeLeaf, content))
    }

    #[test]
    fn test_commit_id_is_deterministic() {
        let factory = ObjectIdentifierFactory::new();
        let root = test_root(&factory, b"node");
        let a = Commit::build(root.clone(), vec![], 0, 42).unwrap();
        let b = Commit::build(root.clone(), vec![], 0, 42).unwrap();
        assert_eq!(a.id(), b.id());

        let c = Commit::build(root, vec![], 0, 43).unwrap();
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_commit_round_trip() {
        let factory = ObjectIdentifierFactory::new();
        let root = test_root(&factory, b"node");
        let parent = Commit::build(root.clone(), vec![], 0, 1).unwrap();
        let commit =
            Commit::build(root, vec![parent.id().clone()], 1, 2).unwrap();

        let decoded = Commit::from_bytes(&commit.encode(), &factory).unwrap();
        assert_eq!(decoded, commit);
        assert_eq!(decoded.generation(), 1);
        assert_eq!(decoded.parents(), &[parent.id().clone()]);

        let decoded =
            Commit::from_bytes_with_id(commit.id(), &commit.encode(), &factory).unwrap();
        assert_eq!(&decoded, &commit);
    }

    #[test]
    fn test_commit_rejects_wrong_id() {
        let factory = ObjectIdentifierFactory::new();
        let root = test_root(&factory, b"node");
        let commit = Commit::build(root, vec![], 0, 1).unwrap();
        let bogus = CommitId::new(
            ObjectDigest::compute(PieceType::Commit, b"other").to_bytes(),
        );
        assert_matches!(
            Commit::from_bytes_with_id(&bogus, &commit.encode(), &factory),
            Err(Status::DataIntegrity(_))
        );
    }

    #[test]
    fn test_commit_rejects_three_parents() {
        let factory = ObjectIdentifierFactory::new();
        let root = test_root(&factory, b"node");
        let p: Vec<CommitId> = (0..3)
            .map(|i| {
                CommitId::new(
                    ObjectDigest::compute(PieceType::Commit, &[i]).to_bytes(),
                )
            })
            .collect();
        assert_matches!(
            Commit::build(root, p, 1, 0),
            Err(Status::IllegalState(_))
        );
    }

    #[test]
    fn test_commit_rejects_garbage() {
        let factory = ObjectIdentifierFactory::new();
        assert_matches!(
            Commit::from_bytes(b"not a commit", &factory),
            Err(Status::DataIntegrity(_))
        );
    }
}
