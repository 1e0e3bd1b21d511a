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

//! Conflict resolution: collapsing divergent heads into merge commits.
//!
//! Whenever a page has more than one head, the merger picks the
//! lowest-generation pair (ties broken by id), computes the three-way
//! difference against the pair's common ancestor and produces a merge
//! commit according to the configured policy. The merge commit is a pure
//! function of the head pair and the policy, so devices performing the
//! same merge independently create the identical commit and converge
//! without further work.

use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use itertools::EitherOrBoth;
use itertools::Itertools as _;

use crate::backoff::ExponentialBackoff;
use crate::btree;
use crate::btree::Entry;
use crate::btree::KeyPriority;
use crate::btree::TreeChange;
use crate::btree::TreeOp;
use crate::commit::Commit;
use crate::page_storage::PageStorage;
use crate::piece::ChangeSource;
use crate::snapshot::Snapshot;
use crate::status::Status;
use crate::status::StatusResult;

// Consecutive resolver failures tolerated before the merge attempt is
// surfaced as an error.
const MAX_RESOLVER_ATTEMPTS: u32 = 3;

/// One key that differs between the two heads being merged.
#[derive(Clone, Debug)]
pub struct DiffEntry {
    /// The key.
    pub key: Vec<u8>,
    /// State at the common ancestor.
    pub base: Option<Entry>,
    /// State at the left (lower (generation, id)) head.
    pub left: Option<Entry>,
    /// State at the right (higher (generation, id)) head.
    pub right: Option<Entry>,
}

fn states_equal(a: &Option<Entry>, b: &Option<Entry>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.value == b.value && a.priority == b.priority,
        _ => false,
    }
}

impl DiffEntry {
    /// Whether the key was changed on both sides to different values.
    pub fn is_conflict(&self) -> bool {
        let changed_left = !states_equal(&self.base, &self.left);
        let changed_right = !states_equal(&self.base, &self.right);
        changed_left && changed_right && !states_equal(&self.left, &self.right)
    }
}

/// A resolver's decision for one key.
#[derive(Clone, Debug)]
pub struct MergedValue {
    /// The key being decided.
    pub key: Vec<u8>,
    /// The decision.
    pub source: MergedValueSource,
}

/// Where the merged value for a key comes from.
#[derive(Clone, Debug)]
pub enum MergedValueSource {
    /// Keep the left head's value.
    Left,
    /// Keep the right head's value.
    Right,
    /// Remove the key.
    Delete,
    /// Store a brand new value.
    New {
        /// The new value bytes.
        value: Vec<u8>,
        /// Priority of the new entry.
        priority: KeyPriority,
    },
}

/// A user-supplied conflict resolver.
///
/// The resolver sees three read-only snapshots (left, right and their
/// common ancestor, absent for disjoint histories) plus the key-sorted
/// entries routed to it by the policy, and returns its decisions. An error
/// discards all accumulated state; the merge is retried with a fresh
/// resolver instance after backoff.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Resolves the routed entries.
    async fn resolve(
        &mut self,
        left: &Snapshot,
        right: &Snapshot,
        ancestor: Option<&Snapshot>,
        routed: Vec<DiffEntry>,
    ) -> StatusResult<Vec<MergedValue>>;
}

/// Produces a fresh resolver for every merge attempt.
pub trait ConflictResolverFactory: Send + Sync {
    /// Creates a resolver instance.
    fn make_resolver(&self) -> Box<dyn ConflictResolver>;
}

/// How divergent heads are reconciled.
#[derive(Clone)]
pub enum MergePolicy {
    /// For each conflicting key, keep the value of the head with the
    /// greater (generation, id). Never consults a resolver.
    LastOneWins,
    /// Entries changed on only one side are taken from that side; only
    /// conflicting entries are routed to the resolver.
    AutomaticWithFallback(Arc<dyn ConflictResolverFactory>),
    /// All differing entries, conflicting or not, are routed to the
    /// resolver.
    Custom(Arc<dyn ConflictResolverFactory>),
}

impl Debug for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::LastOneWins => f.write_str("LastOneWins"),
            Self::AutomaticWithFallback(_) => f.write_str("AutomaticWithFallback"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Outcome of [`Merger::resolve_conflicts`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictResolutionWaitResult {
    /// The page already had a single head and no resolver session.
    NoConflicts,
    /// Divergent heads existed and were merged.
    ConflictsResolved,
}

type SleepFn = Box<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Drives merges for one page. At most one merge runs at a time; commits
/// arriving mid-merge are handled by the next round.
pub struct Merger {
    policy: MergePolicy,
    backoff: ExponentialBackoff,
    sleep: SleepFn,
    session_in_progress: bool,
}

impl Debug for Merger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("Merger")
            .field("policy", &self.policy)
            .field("session_in_progress", &self.session_in_progress)
            .finish_non_exhaustive()
    }
}

impl Merger {
    /// Creates a merger with the given policy.
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            policy,
            backoff: ExponentialBackoff::default(),
            sleep: Box::new(|_| futures::future::ready(()).boxed()),
            session_in_progress: false,
        }
    }

    /// Replaces the merge policy. Takes effect from the next merge.
    pub fn set_policy(&mut self, policy: MergePolicy) {
        self.policy = policy;
    }

    /// Overrides how retry delays are awaited. Tests install a recording
    /// sleeper; the default resolves immediately.
    pub fn set_sleep_fn(
        &mut self,
        sleep: impl Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) {
        self.sleep = Box::new(sleep);
    }

    /// Whether a resolver session is currently outstanding.
    pub fn session_in_progress(&self) -> bool {
        self.session_in_progress
    }

    /// Merges until the page has a single head. Returns whether any merge
    /// was performed.
    #[tracing::instrument(skip(self, storage))]
    pub async fn resolve_conflicts(
        &mut self,
        storage: &PageStorage,
    ) -> StatusResult<ConflictResolutionWaitResult> {
        let mut merged_any = false;
        loop {
            let mut heads = storage.head_commits()?;
            if heads.len() < 2 {
                break;
            }
            heads.sort_by_key(|commit| (commit.generation(), commit.id().clone()));
            let left = heads[0].clone();
            let right = heads[1].clone();
            self.session_in_progress = true;
            let result = self.merge_pair(storage, &left, &right).await;
            self.session_in_progress = false;
            result?;
            merged_any = true;
        }
        Ok(if merged_any {
            ConflictResolutionWaitResult::ConflictsResolved
        } else {
            ConflictResolutionWaitResult::NoConflicts
        })
    }

    async fn merge_pair(
        &mut self,
        storage: &PageStorage,
        left: &Commit,
        right: &Commit,
    ) -> StatusResult<()> {
        let store = storage.objects();
        let ancestor = storage.graph().common_ancestor(left.id(), right.id())?;
        let base_root = match &ancestor {
            Some(commit) => commit.root().clone(),
            None => btree::write_empty_root(store)?,
        };
        tracing::debug!(
            left = %left.id(),
            right = %right.id(),
            ancestor = ?ancestor.as_ref().map(Commit::id),
            "merging head pair"
        );

        let diff = three_way_diff(storage, &base_root, left, right)?;
        let decisions = match self.policy.clone() {
            MergePolicy::LastOneWins => last_one_wins_decisions(&diff),
            MergePolicy::AutomaticWithFallback(factory) => {
                let mut decisions: Vec<(Vec<u8>, Option<Entry>)> = vec![];
                for entry in diff.iter().filter(|entry| !entry.is_conflict()) {
                    // The side that changed wins without consulting the
                    // resolver.
                    let final_state = if states_equal(&entry.base, &entry.left) {
                        entry.right.clone()
                    } else {
                        entry.left.clone()
                    };
                    decisions.push((entry.key.clone(), final_state));
                }
                let conflicts: Vec<DiffEntry> =
                    diff.iter().filter(|e| e.is_conflict()).cloned().collect();
                if !conflicts.is_empty() {
                    let resolved = self
                        .run_resolver(storage, &factory, left, right, &ancestor, conflicts)
                        .await?;
                    decisions.extend(resolved);
                }
                decisions
            }
            MergePolicy::Custom(factory) => {
                self.run_resolver(storage, &factory, left, right, &ancestor, diff.clone())
                    .await?
            }
        };

        let mut changes: Vec<TreeChange> = vec![];
        for (key, final_state) in decisions {
            let current = btree::lookup(store, left.root(), &key)?;
            if states_equal(&current, &final_state)
                && current.as_ref().map(|e| &e.entry_id)
                    == final_state.as_ref().map(|e| &e.entry_id)
            {
                continue;
            }
            match final_state {
                None => changes.push(TreeChange {
                    key,
                    op: TreeOp::Delete,
                }),
                Some(entry) => changes.push(TreeChange {
                    key,
                    op: TreeOp::Put {
                        value: entry.value,
                        priority: entry.priority,
                        entry_id: entry.entry_id,
                    },
                }),
            }
        }
        changes.sort_by(|a, b| a.key.cmp(&b.key));

        let new_root = btree::apply_changes(store, left.root(), &changes)?;
        storage.add_merge_commit(new_root, [left, right])?;
        Ok(())
    }

    async fn run_resolver(
        &mut self,
        storage: &PageStorage,
        factory: &Arc<dyn ConflictResolverFactory>,
        left: &Commit,
        right: &Commit,
        ancestor: &Option<Commit>,
        routed: Vec<DiffEntry>,
    ) -> StatusResult<Vec<(Vec<u8>, Option<Entry>)>> {
        let left_snapshot = storage.snapshot_at(left.id(), vec![])?;
        let right_snapshot = storage.snapshot_at(right.id(), vec![])?;
        let ancestor_snapshot = match ancestor {
            Some(commit) => Some(storage.snapshot_at(commit.id(), vec![])?),
            None => None,
        };

        let mut attempt = 0;
        let merged_values = loop {
            let mut resolver = factory.make_resolver();
            match resolver
                .resolve(
                    &left_snapshot,
                    &right_snapshot,
                    ancestor_snapshot.as_ref(),
                    routed.clone(),
                )
                .await
            {
                Ok(values) => break values,
                Err(err) if attempt + 1 < MAX_RESOLVER_ATTEMPTS => {
                    attempt += 1;
                    let delay = self.backoff.get_next();
                    tracing::warn!(?err, ?delay, attempt, "conflict resolver failed, retrying");
                    (self.sleep)(delay).await;
                }
                Err(err) => return Err(err),
            }
        };
        self.backoff.reset();

        let store = storage.objects();
        let mut decisions = vec![];
        for merged in merged_values {
            let final_state = match merged.source {
                MergedValueSource::Left => btree::lookup(store, left.root(), &merged.key)?,
                MergedValueSource::Right => btree::lookup(store, right.root(), &merged.key)?,
                MergedValueSource::Delete => None,
                MergedValueSource::New { value, priority } => {
                    let identifier = store.add_piece(&value, ChangeSource::Local)?;
                    let entry_id = btree::entry_id_for_merge(
                        left.id(),
                        right.id(),
                        0,
                        &merged.key,
                        &identifier,
                        priority,
                    );
                    Some(Entry {
                        key: merged.key.clone(),
                        value: identifier,
                        priority,
                        entry_id,
                    })
                }
            };
            decisions.push((merged.key, final_state));
        }
        Ok(decisions)
    }
}

// Combines the two per-side diffs into a single key-sorted three-way diff.
// A key missing from one side's diff is unchanged there, i.e. its state is
// the base state.
fn three_way_diff(
    storage: &PageStorage,
    base_root: &crate::piece::ObjectIdentifier,
    left: &Commit,
    right: &Commit,
) -> StatusResult<Vec<DiffEntry>> {
    let store = storage.objects();
    let left_changes = btree::diff(store, base_root, left.root())?;
    let right_changes = btree::diff(store, base_root, right.root())?;

    let out = left_changes
        .into_iter()
        .merge_join_by(right_changes, |l, r| l.key().cmp(r.key()))
        .map(|merged| match merged {
            EitherOrBoth::Left(change) => DiffEntry {
                key: change.key().to_vec(),
                right: change.base.clone(),
                base: change.base,
                left: change.target,
            },
            EitherOrBoth::Right(change) => DiffEntry {
                key: change.key().to_vec(),
                left: change.base.clone(),
                base: change.base,
                right: change.target,
            },
            EitherOrBoth::Both(left_change, right_change) => DiffEntry {
                key: left_change.key().to_vec(),
                base: left_change.base,
                left: left_change.target,
                right: right_change.target,
            },
        })
        .collect();
    Ok(out)
}

fn last_one_wins_decisions(diff: &[DiffEntry]) -> Vec<(Vec<u8>, Option<Entry>)> {
    diff.iter()
        .map(|entry| {
            let final_state = if entry.is_conflict() {
                // The right head has the greater (generation, id).
                entry.right.clone()
            } else if states_equal(&entry.base, &entry.left) {
                entry.right.clone()
            } else {
                entry.left.clone()
            };
            (entry.key.clone(), final_state)
        })
        .collect()
}
