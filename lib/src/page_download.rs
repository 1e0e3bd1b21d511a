// Copyright 2024-2025 The Ledger Authors
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

//! The per-page download half of cloud sync.
//!
//! Download holds a resumable cursor into the page's cloud commit log.
//! Batches are fetched, verified, deduplicated against the local commit
//! graph and applied; the pieces reachable from each new commit (tree
//! nodes plus EAGER values) are fetched before the commits land, so
//! watchers fired by the application can read what changed.

use std::sync::Arc;

use futures::FutureExt as _;
use futures::StreamExt as _;
use futures::channel::mpsc;
use futures::future::BoxFuture;

use crate::backoff::ExponentialBackoff;
use crate::backoff::SleepFn;
use crate::backoff::immediate_sleep;
use crate::cloud_provider::CloudError;
use crate::cloud_provider::CloudWatcher;
use crate::cloud_provider::PageCloud;
use crate::cloud_provider::PositionToken;
use crate::cloud_provider::RemoteCommit;
use crate::commit::CommitId;
use crate::commit_graph::CommitGraphError;
use crate::db::WriteBatch;
use crate::page_storage::PageStorage;
use crate::piece::ChangeSource;
use crate::piece::ObjectDigest;
use crate::piece::PieceType;
use crate::status::Status;
use crate::status::StatusResult;

const POSITION_TOKEN_KEY: &[u8] = b"cloud_position";

/// Externally visible download state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadSyncState {
    /// Not yet started.
    NotStarted,
    /// Caught up with the cloud log.
    Idle,
    /// A fetch is queued.
    Pending,
    /// A batch is being fetched or applied.
    InProgress,
    /// A retryable failure occurred; a backoff retry is scheduled.
    TemporaryError,
    /// Download is permanently broken for this page.
    PermanentError,
}

// Forwards cloud log notifications into the download's channel.
struct WatcherAdapter {
    sender: mpsc::UnboundedSender<()>,
}

impl CloudWatcher for WatcherAdapter {
    fn on_new_commits(&self) {
        self.sender.unbounded_send(()).ok();
    }

    fn on_error(&self, error: &CloudError) {
        tracing::warn!(?error, "cloud watch interrupted");
        self.sender.unbounded_send(()).ok();
    }
}

/// Downloads the cloud commit log for one page.
pub struct PageDownload {
    storage: Arc<PageStorage>,
    page_cloud: Arc<dyn PageCloud>,
    backoff: ExponentialBackoff,
    sleep: SleepFn,
    state: DownloadSyncState,
    notifications: mpsc::UnboundedReceiver<()>,
    notification_sender: mpsc::UnboundedSender<()>,
}

impl PageDownload {
    /// Creates a download engine for `storage` against `page_cloud`.
    pub fn new(storage: Arc<PageStorage>, page_cloud: Arc<dyn PageCloud>) -> Self {
        let (notification_sender, notifications) = mpsc::unbounded();
        Self {
            storage,
            page_cloud,
            backoff: ExponentialBackoff::default(),
            sleep: immediate_sleep(),
            state: DownloadSyncState::NotStarted,
            notifications,
            notification_sender,
        }
    }

    /// The current state.
    pub fn state(&self) -> DownloadSyncState {
        self.state
    }

    /// Whether upload may proceed.
    pub fn is_idle(&self) -> bool {
        matches!(
            self.state,
            DownloadSyncState::Idle | DownloadSyncState::NotStarted
        )
    }

    /// Overrides how backoff delays are awaited.
    pub fn set_sleep_fn(&mut self, sleep: SleepFn) {
        self.sleep = sleep;
    }

    fn position_token(&self) -> StatusResult<Option<PositionToken>> {
        Ok(self
            .storage
            .objects()
            .page_db()
            .sync_metadata(POSITION_TOKEN_KEY)?
            .map(PositionToken))
    }

    fn store_position_token(&self, token: &PositionToken) -> StatusResult<()> {
        let db = self.storage.objects().page_db();
        let mut batch = WriteBatch::new();
        db.set_sync_metadata(&mut batch, POSITION_TOKEN_KEY, &token.0);
        db.write(batch)
    }

    /// Registers the cloud watcher and fetches the initial backlog.
    pub async fn start(&mut self) -> StatusResult<usize> {
        let token = self.position_token()?;
        let watcher = Arc::new(WatcherAdapter {
            sender: self.notification_sender.clone(),
        });
        if let Err(err) = self.page_cloud.set_watcher(token, watcher).await {
            // The log can still be polled; the watch is an optimization.
            tracing::warn!(?err, "failed to set cloud watcher");
        }
        self.fetch_backlog().await
    }

    /// Drains pending log-growth notifications, reporting whether any
    /// arrived since the last call.
    pub fn take_notifications(&mut self) -> bool {
        let mut notified = false;
        while let Some(Some(())) = self.notifications.next().now_or_never() {
            notified = true;
        }
        notified
    }

    /// Fetches and applies every batch behind the cursor. Returns the
    /// number of commits applied.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_backlog(&mut self) -> StatusResult<usize> {
        if self.state == DownloadSyncState::PermanentError {
            return Ok(0);
        }
        self.state = DownloadSyncState::Pending;
        let mut total_applied = 0;
        loop {
            self.state = DownloadSyncState::InProgress;
            let token = self.position_token()?;
            let (commits, next_token) = match self.page_cloud.get_commits(token).await {
                Ok(result) => result,
                Err(err) if err.is_retryable() => {
                    self.state = DownloadSyncState::TemporaryError;
                    let delay = self.backoff.get_next();
                    tracing::warn!(?err, ?delay, "commit log fetch failed, retrying");
                    (self.sleep)(delay).await;
                    continue;
                }
                Err(err) => {
                    tracing::error!(?err, "commit log fetch failed permanently");
                    self.state = DownloadSyncState::PermanentError;
                    return Err(Status::IllegalState(err.to_string()));
                }
            };
            if commits.is_empty() {
                self.backoff.reset();
                self.state = DownloadSyncState::Idle;
                return Ok(total_applied);
            }

            match self.apply_batch(&commits).await {
                Ok(applied) => {
                    total_applied += applied;
                    if let Some(token) = &next_token {
                        self.store_position_token(token)?;
                    }
                    self.backoff.reset();
                }
                Err(err) if err.is_retryable() => {
                    self.state = DownloadSyncState::TemporaryError;
                    let delay = self.backoff.get_next();
                    tracing::warn!(?err, ?delay, "batch application failed, retrying");
                    (self.sleep)(delay).await;
                    continue;
                }
                Err(err) => {
                    // Integrity failures from the cloud abort the batch; the
                    // cursor stays put so a corrected log can be retried.
                    tracing::error!(?err, "abandoning cloud batch");
                    self.state = DownloadSyncState::TemporaryError;
                    return Err(err);
                }
            }
        }
    }

    async fn apply_batch(&mut self, commits: &[RemoteCommit]) -> StatusResult<usize> {
        let mut batch: Vec<(CommitId, Vec<u8>)> = vec![];
        for remote in commits {
            let digest = ObjectDigest::from_bytes(&remote.id).map_err(|_| {
                Status::DataIntegrity("cloud commit id is not a valid digest".to_string())
            })?;
            if digest.piece_type() != PieceType::Commit {
                return Err(Status::DataIntegrity(
                    "cloud commit id has a non-commit type tag".to_string(),
                ));
            }
            let id = CommitId::new(digest.to_bytes());
            if self.storage.graph().has_commit(&id)? {
                continue;
            }
            batch.push((id, remote.data.clone()));
        }
        if batch.is_empty() {
            return Ok(0);
        }

        // Fetch the pieces each commit needs before it becomes visible.
        for (id, bytes) in &batch {
            let commit = crate::commit::Commit::from_bytes_with_id(
                id,
                bytes,
                self.storage.objects().factory(),
            )?;
            self.fetch_subtree(commit.root().digest().clone()).await?;
        }

        match self
            .storage
            .add_commits_from_sync(batch.clone(), ChangeSource::Cloud)
        {
            Ok(applied) => Ok(applied.len()),
            Err(CommitGraphError::IncompleteGraph { missing }) => {
                tracing::debug!(
                    missing = missing.len(),
                    "batch references unknown ancestors, fetching the full log"
                );
                self.fetch_missing_ancestors(batch).await
            }
            Err(CommitGraphError::BadState) => {
                Err(Status::IllegalState("sync applied to stale heads".to_string()))
            }
            Err(CommitGraphError::Status(status)) => Err(status),
        }
    }

    // Missing ancestors mean our cursor skipped part of the log (e.g. a
    // cloud-side compaction). Refetch from the beginning and apply the
    // union; a gap that persists aborts the batch for a later retry.
    async fn fetch_missing_ancestors(
        &mut self,
        mut batch: Vec<(CommitId, Vec<u8>)>,
    ) -> StatusResult<usize> {
        let (all_commits, _) = self
            .page_cloud
            .get_commits(None)
            .await
            .map_err(|err| Status::Network(err.to_string()))?;
        for remote in all_commits {
            let Ok(digest) = ObjectDigest::from_bytes(&remote.id) else {
                continue;
            };
            let id = CommitId::new(digest.to_bytes());
            if self.storage.graph().has_commit(&id)?
                || batch.iter().any(|(existing, _)| existing == &id)
            {
                continue;
            }
            let commit = crate::commit::Commit::from_bytes_with_id(
                &id,
                &remote.data,
                self.storage.objects().factory(),
            )?;
            self.fetch_subtree(commit.root().digest().clone()).await?;
            batch.push((id, remote.data));
        }
        match self.storage.add_commits_from_sync(batch, ChangeSource::Cloud) {
            Ok(applied) => Ok(applied.len()),
            Err(CommitGraphError::IncompleteGraph { missing }) => Err(Status::Network(format!(
                "commit graph still incomplete after full refetch: {} missing",
                missing.len()
            ))),
            Err(err) => Err(Status::from(err)),
        }
    }

    // Recursively fetches a piece and everything sync needs below it.
    fn fetch_subtree(&self, digest: ObjectDigest) -> BoxFuture<'_, StatusResult<()>> {
        async move {
            if self.storage.objects().has_piece(&digest)? {
                return Ok(());
            }
            let data = self
                .page_cloud
                .get_object(digest.to_bytes())
                .await
                .map_err(|err| match err {
                    CloudError::NotFound => {
                        Status::InternalNotFound(format!("cloud object {digest}"))
                    }
                    CloudError::Network(message) => Status::Network(message),
                    other => Status::Network(other.to_string()),
                })?;
            self.storage
                .objects()
                .add_received_piece(&digest, &data, true)?;

            match digest.piece_type() {
                PieceType::TreeNodeInternal | PieceType::TreeNodeLeaf => {
                    let (children, eager_values) = crate::btree::node_fetch_targets(&data)?;
                    for child in children {
                        self.fetch_subtree(child).await?;
                    }
                    for value in eager_values {
                        self.fetch_subtree(value).await?;
                    }
                }
                PieceType::BlobRoot => {
                    for child in
                        crate::object_store::piece_references(PieceType::BlobRoot, &data)?
                    {
                        self.fetch_subtree(child).await?;
                    }
                }
                PieceType::InlineBlob | PieceType::Commit => {}
            }
            Ok(())
        }
        .boxed()
    }
}

impl std::fmt::Debug for PageDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("PageDownload")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
