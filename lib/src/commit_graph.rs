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

//! The per-page commit graph: commit storage, the head set, ancestry
//! queries and unsynced bookkeeping.
//!
//! The head set is rewritten atomically with every commit application, so
//! it is an antichain at every quiescent point: no head is an ancestor of
//! another head.

use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

use crate::commit::Commit;
use crate::commit::CommitId;
use crate::db::WriteBatch;
use crate::object_id::ObjectId as _;
use crate::object_store::ObjectStore;
use crate::piece::ChangeSource;
use crate::status::Status;
use crate::status::StatusResult;

const REMOTE_ID_PREFIX: &[u8] = b"remote/";

/// Errors produced while extending the commit graph.
#[derive(Debug, Error)]
pub enum CommitGraphError {
    /// The commit's parents are not a subset of the current heads.
    #[error("commit parents are not a subset of the current heads")]
    BadState,
    /// A synced batch references ancestors that are not known locally. The
    /// batch is abandoned; the caller fetches the missing commits and
    /// retries.
    #[error("commit graph is incomplete: {} commits missing", missing.len())]
    IncompleteGraph {
        /// The unknown ancestor ids.
        missing: Vec<CommitId>,
    },
    /// Underlying storage failure.
    #[error(transparent)]
    Status(#[from] Status),
}

/// Lifecycle of one commit id within the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitState {
    /// Not known locally.
    Missing,
    /// An add is in progress; concurrent adds of the same id are no-ops.
    Adding,
    /// Stored, not yet acknowledged by the cloud.
    PresentUnsynced,
    /// Stored and acknowledged by the cloud. Terminal.
    PresentSynced,
}

/// Storage and bookkeeping for a page's commits.
#[derive(Debug)]
pub struct CommitGraph {
    store: Arc<ObjectStore>,
    adding: Mutex<HashSet<CommitId>>,
}

impl CommitGraph {
    /// Creates a graph over the page's object store.
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self {
            store,
            adding: Mutex::new(HashSet::new()),
        }
    }

    fn db(&self) -> &crate::page_db::PageDb {
        self.store.page_db()
    }

    /// Ids of the current heads, sorted.
    pub fn head_ids(&self) -> StatusResult<Vec<CommitId>> {
        self.db().heads()
    }

    /// The current heads as commits.
    pub fn head_commits(&self) -> StatusResult<Vec<Commit>> {
        self.head_ids()?
            .iter()
            .map(|id| self.get_commit(id))
            .collect()
    }

    /// Loads a stored commit.
    pub fn get_commit(&self, id: &CommitId) -> StatusResult<Commit> {
        let Some(bytes) = self.db().commit_bytes(id)? else {
            return Err(Status::InternalNotFound(format!("commit {id}")));
        };
        Commit::from_bytes_with_id(id, &bytes, self.store.factory())
    }

    /// Whether the commit is stored locally.
    pub fn has_commit(&self, id: &CommitId) -> StatusResult<bool> {
        self.db().has_commit(id)
    }

    /// The lifecycle state of `id`.
    pub fn commit_state(&self, id: &CommitId) -> StatusResult<CommitState> {
        if self.adding.lock().unwrap().contains(id) {
            return Ok(CommitState::Adding);
        }
        if !self.has_commit(id)? {
            return Ok(CommitState::Missing);
        }
        let unsynced = self
            .db()
            .unsynced_commits()?
            .iter()
            .any(|(unsynced_id, _)| unsynced_id == id);
        Ok(if unsynced {
            CommitState::PresentUnsynced
        } else {
            CommitState::PresentSynced
        })
    }

    /// Adds a locally created commit. The parents must be a subset of the
    /// current heads; the head set is rewritten atomically with the commit.
    /// Adding an already-present commit is a no-op.
    pub fn add_commit_from_local(&self, commit: &Commit) -> Result<(), CommitGraphError> {
        if self.has_commit(commit.id())? {
            return Ok(());
        }
        let heads: HashSet<CommitId> = self.head_ids()?.into_iter().collect();
        if !commit.parents().iter().all(|parent| heads.contains(parent)) {
            return Err(CommitGraphError::BadState);
        }
        self.apply_commit(commit, ChangeSource::Local)?;
        Ok(())
    }

    /// Parents of the batch that are neither stored locally nor included in
    /// the batch itself.
    pub fn missing_parents(&self, batch: &[Commit]) -> StatusResult<Vec<CommitId>> {
        let included: HashSet<&CommitId> = batch.iter().map(Commit::id).collect();
        let mut missing = BTreeSet::new();
        for commit in batch {
            for parent in commit.parents() {
                if !included.contains(parent) && !self.has_commit(parent)? {
                    missing.insert(parent.clone());
                }
            }
        }
        Ok(missing.into_iter().collect())
    }

    /// Applies a batch of commits received from sync, in generation order.
    ///
    /// Commits already present are skipped. If any ancestor is unknown the
    /// whole batch is abandoned with
    /// [`CommitGraphError::IncompleteGraph`]; nothing is applied. Returns
    /// the commits that were actually applied, in application order.
    pub fn add_commits_from_sync(
        &self,
        batch: Vec<Commit>,
        source: ChangeSource,
    ) -> Result<Vec<Commit>, CommitGraphError> {
        debug_assert!(source != ChangeSource::Local);
        let missing = self.missing_parents(&batch)?;
        if !missing.is_empty() {
            return Err(CommitGraphError::IncompleteGraph { missing });
        }

        let mut to_apply: Vec<Commit> = vec![];
        {
            let mut adding = self.adding.lock().unwrap();
            for commit in batch {
                if self.has_commit(commit.id())? || adding.contains(commit.id()) {
                    continue;
                }
                adding.insert(commit.id().clone());
                to_apply.push(commit);
            }
        }
        to_apply.sort_by_key(|commit| (commit.generation(), commit.id().clone()));

        let result = self.apply_sync_batch(&to_apply, source);
        {
            let mut adding = self.adding.lock().unwrap();
            for commit in &to_apply {
                adding.remove(commit.id());
            }
        }
        result?;
        Ok(to_apply)
    }

    fn apply_sync_batch(
        &self,
        commits: &[Commit],
        source: ChangeSource,
    ) -> Result<(), CommitGraphError> {
        for commit in commits {
            // Validate the advertised generation against the local parents.
            let mut expected = 0;
            for parent in commit.parents() {
                // Parents earlier in the batch have already been applied,
                // so every parent is loadable here.
                let parent_commit = self.get_commit(parent)?;
                expected = expected.max(parent_commit.generation() + 1);
            }
            if !commit.parents().is_empty() && commit.generation() != expected {
                return Err(CommitGraphError::Status(Status::DataIntegrity(format!(
                    "commit {} advertises generation {} but its parents imply {}",
                    commit.id(),
                    commit.generation(),
                    expected
                ))));
            }
            self.apply_commit(commit, source)?;
        }
        Ok(())
    }

    // Stores the commit and atomically rewrites the head set: the commit
    // becomes a head unless a child is already present, and its parents
    // stop being heads.
    fn apply_commit(&self, commit: &Commit, source: ChangeSource) -> StatusResult<()> {
        // Record the root reference first; a crash in between leaks a count
        // instead of leaving a commit with a collectable root.
        self.store
            .increment_references(std::slice::from_ref(commit.root().digest()))?;

        let heads: HashSet<CommitId> = self.head_ids()?.into_iter().collect();
        let mut batch = WriteBatch::new();
        self.db().put_commit(&mut batch, commit.id(), &commit.encode());
        self.db().insert_head(&mut batch, commit.id());
        for parent in commit.parents() {
            if heads.contains(parent) {
                self.db().remove_head(&mut batch, parent);
            }
        }
        match source {
            ChangeSource::Cloud => {}
            ChangeSource::Local | ChangeSource::P2p => {
                self.db()
                    .mark_commit_unsynced(&mut batch, commit.id(), commit.generation());
            }
        }
        self.db().write(batch)?;
        tracing::debug!(id = %commit.id(), generation = commit.generation(), ?source, "applied commit");
        Ok(())
    }

    /// Commits not yet acknowledged by the cloud, in generation order.
    pub fn unsynced_commits(&self) -> StatusResult<Vec<Commit>> {
        self.db()
            .unsynced_commits()?
            .iter()
            .map(|(id, _)| self.get_commit(id))
            .collect()
    }

    /// Marks a commit as acknowledged by the cloud. Terminal state.
    pub fn mark_commit_synced(&self, id: &CommitId) -> StatusResult<()> {
        let mut batch = WriteBatch::new();
        self.db().mark_commit_synced(&mut batch, id);
        self.db().write(batch)
    }

    /// Records the cloud-side ("remote") identifier of a local commit.
    pub fn record_remote_commit_id(
        &self,
        remote_id: &[u8],
        id: &CommitId,
    ) -> StatusResult<()> {
        let mut key = REMOTE_ID_PREFIX.to_vec();
        key.extend_from_slice(remote_id);
        let mut batch = WriteBatch::new();
        self.db().set_sync_metadata(&mut batch, &key, id.as_bytes());
        self.db().write(batch)
    }

    /// Translates a cloud-side commit reference back to the local id.
    pub fn commit_id_from_remote_id(&self, remote_id: &[u8]) -> StatusResult<CommitId> {
        let mut key = REMOTE_ID_PREFIX.to_vec();
        key.extend_from_slice(remote_id);
        if let Some(bytes) = self.db().sync_metadata(&key)? {
            return Ok(CommitId::new(bytes));
        }
        // Identity encoding: the remote id may simply be the commit id.
        let candidate = CommitId::new(remote_id.to_vec());
        if self.has_commit(&candidate)? {
            return Ok(candidate);
        }
        Err(Status::InternalNotFound(format!(
            "no local commit for remote id {}",
            crate::hex_util::encode_hex(remote_id)
        )))
    }

    /// Lowest common ancestor of two commits, or `None` for disjoint
    /// histories. When several lowest common ancestors exist, the one with
    /// the highest generation (ties broken by id) is returned.
    pub fn common_ancestor(
        &self,
        left: &CommitId,
        right: &CommitId,
    ) -> StatusResult<Option<Commit>> {
        // Walk both ancestor frontiers down by generation until they meet.
        let mut left_seen: HashSet<CommitId> = HashSet::new();
        let mut right_seen: HashSet<CommitId> = HashSet::new();
        let mut frontier: BTreeSet<(u64, CommitId, bool)> = BTreeSet::new();

        let left_commit = self.get_commit(left)?;
        let right_commit = self.get_commit(right)?;
        left_seen.insert(left.clone());
        right_seen.insert(right.clone());
        frontier.insert((left_commit.generation(), left.clone(), false));
        frontier.insert((right_commit.generation(), right.clone(), true));

        while let Some((_generation, id, from_right)) = frontier.pop_last() {
            if left_seen.contains(&id) && right_seen.contains(&id) {
                return Ok(Some(self.get_commit(&id)?));
            }
            let commit = self.get_commit(&id)?;
            for parent in commit.parents() {
                let seen = if from_right {
                    &mut right_seen
                } else {
                    &mut left_seen
                };
                seen.insert(parent.clone());
                let parent_commit = self.get_commit(parent)?;
                frontier.insert((parent_commit.generation(), parent.clone(), from_right));
            }
        }
        Ok(None)
    }
}
