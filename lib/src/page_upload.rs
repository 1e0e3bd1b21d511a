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

//! The per-page upload half of cloud sync.
//!
//! Upload is a state machine driven by three triggers: a new local commit,
//! the download side becoming idle, and backoff expiry. It never uploads
//! while a download is in progress or while the page has divergent heads;
//! the merger must reduce the heads first. A batch is atomic at the cloud:
//! rejection of one commit fails the whole batch.

use std::sync::Arc;

use crate::backoff::ExponentialBackoff;
use crate::backoff::SleepFn;
use crate::backoff::immediate_sleep;
use crate::clock;
use crate::clock::DeviceId;
use crate::clock_pack;
use crate::cloud_provider::CloudError;
use crate::cloud_provider::PageCloud;
use crate::cloud_provider::RemoteCommit;
use crate::commit::Commit;
use crate::object_id::ObjectId as _;
use crate::page_storage::PageStorage;
use crate::piece::ChangeSource;
use crate::status::Status;
use crate::status::StatusResult;

/// Externally visible upload state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadSyncState {
    /// Not yet started.
    NotStarted,
    /// Performing initial setup.
    Setup,
    /// Nothing to upload.
    Idle,
    /// Work is queued.
    Pending,
    /// Blocked until the merger reduces the head set.
    WaitTooManyLocalHeads,
    /// Blocked until the current download completes.
    WaitRemoteDownload,
    /// A batch upload is in flight.
    InProgress,
    /// A retryable failure occurred; a backoff retry is scheduled.
    TemporaryError,
    /// Upload is permanently broken for this page.
    PermanentError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InternalState {
    // No commit pending upload.
    NoCommit,
    // Processing the known backlog.
    Processing,
    // Processing, and more commits arrived meanwhile.
    ProcessingNewCommit,
}

enum UploadError {
    Temporary(String),
    Permanent(String),
}

impl From<Status> for UploadError {
    fn from(status: Status) -> Self {
        Self::Permanent(status.to_string())
    }
}

fn classify(error: CloudError) -> UploadError {
    if error.is_retryable() {
        UploadError::Temporary(error.to_string())
    } else {
        UploadError::Permanent(error.to_string())
    }
}

/// Uploads unsynced commits and objects for one page.
pub struct PageUpload {
    storage: Arc<PageStorage>,
    page_cloud: Arc<dyn PageCloud>,
    device_id: DeviceId,
    backoff: ExponentialBackoff,
    sleep: SleepFn,
    external_state: UploadSyncState,
    internal_state: InternalState,
    download_idle: bool,
}

impl PageUpload {
    /// Creates an upload engine for `storage` against `page_cloud`.
    pub fn new(
        storage: Arc<PageStorage>,
        page_cloud: Arc<dyn PageCloud>,
        device_id: DeviceId,
    ) -> Self {
        Self {
            storage,
            page_cloud,
            device_id,
            backoff: ExponentialBackoff::default(),
            sleep: immediate_sleep(),
            external_state: UploadSyncState::NotStarted,
            internal_state: InternalState::NoCommit,
            download_idle: true,
        }
    }

    /// The current external state.
    pub fn state(&self) -> UploadSyncState {
        self.external_state
    }

    /// Overrides how backoff delays are awaited.
    pub fn set_sleep_fn(&mut self, sleep: SleepFn) {
        self.sleep = sleep;
    }

    /// Starts (or restarts) the upload process.
    pub fn start(&mut self) {
        if self.external_state == UploadSyncState::NotStarted {
            self.set_state(UploadSyncState::Setup);
        }
        self.next_state();
    }

    /// Records a change to the download side's idleness. Becoming idle
    /// unblocks an upload waiting on the download.
    pub fn set_download_idle(&mut self, idle: bool) {
        self.download_idle = idle;
        if idle && self.external_state == UploadSyncState::WaitRemoteDownload {
            self.next_state();
        }
    }

    /// Reacts to newly applied commits. Only locally created commits are
    /// upload work; echoes of synced commits are ignored.
    pub fn on_new_commits(&mut self, source: ChangeSource) {
        if source != ChangeSource::Local {
            return;
        }
        match self.external_state {
            UploadSyncState::NotStarted
            | UploadSyncState::TemporaryError
            | UploadSyncState::PermanentError => return,
            _ => {}
        }
        self.next_state();
    }

    /// Whether the machine has nothing actively running.
    pub fn is_paused(&self) -> bool {
        matches!(
            self.external_state,
            UploadSyncState::NotStarted
                | UploadSyncState::Idle
                | UploadSyncState::WaitTooManyLocalHeads
                | UploadSyncState::WaitRemoteDownload
                | UploadSyncState::TemporaryError
                | UploadSyncState::PermanentError
        )
    }

    fn next_state(&mut self) {
        self.internal_state = match self.internal_state {
            InternalState::NoCommit => InternalState::Processing,
            InternalState::Processing | InternalState::ProcessingNewCommit => {
                InternalState::ProcessingNewCommit
            }
        };
    }

    // Pops the internal ladder. Returns whether another processing round
    // is due.
    fn step_back(&mut self) -> bool {
        match self.internal_state {
            InternalState::NoCommit => false,
            InternalState::Processing => {
                self.internal_state = InternalState::NoCommit;
                if self.external_state == UploadSyncState::InProgress {
                    self.set_state(UploadSyncState::Idle);
                }
                false
            }
            InternalState::ProcessingNewCommit => {
                self.internal_state = InternalState::Processing;
                true
            }
        }
    }

    fn set_state(&mut self, state: UploadSyncState) {
        if state != self.external_state {
            tracing::debug!(page = %self.storage.page_id(), ?state, "upload state");
            self.external_state = state;
        }
    }

    /// Runs queued upload work until the machine pauses. Permanent errors
    /// leave the machine in [`UploadSyncState::PermanentError`] and
    /// surface as `Err`.
    pub async fn run(&mut self) -> StatusResult<()> {
        if self.external_state == UploadSyncState::NotStarted
            || self.external_state == UploadSyncState::PermanentError
        {
            return Ok(());
        }
        loop {
            if !matches!(
                self.internal_state,
                InternalState::Processing | InternalState::ProcessingNewCommit
            ) {
                return Ok(());
            }
            if !self.download_idle {
                self.set_state(UploadSyncState::WaitRemoteDownload);
                self.step_back();
                return Ok(());
            }
            self.set_state(UploadSyncState::Pending);

            let commits = self.storage.unsynced_commits()?;
            if commits.is_empty() {
                self.set_state(UploadSyncState::Idle);
                if self.step_back() {
                    continue;
                }
                return Ok(());
            }
            if self.storage.head_ids()?.len() > 1 {
                // Do not upload divergent histories; wait for the merger.
                self.set_state(UploadSyncState::WaitTooManyLocalHeads);
                self.step_back();
                return Ok(());
            }

            self.set_state(UploadSyncState::InProgress);
            match self.upload_batch(&commits).await {
                Ok(()) => {
                    self.backoff.reset();
                    self.update_clock().await;
                    if self.step_back() {
                        continue;
                    }
                    return Ok(());
                }
                Err(UploadError::Temporary(message)) => {
                    tracing::warn!(
                        page = %self.storage.page_id(),
                        %message,
                        "commit upload failed due to a connection error, retrying"
                    );
                    self.set_state(UploadSyncState::TemporaryError);
                    let delay = self.backoff.get_next();
                    (self.sleep)(delay).await;
                    self.set_state(UploadSyncState::Pending);
                    continue;
                }
                Err(UploadError::Permanent(message)) => {
                    tracing::error!(
                        page = %self.storage.page_id(),
                        %message,
                        "commit upload failed with a permanent error, stopping sync"
                    );
                    self.set_state(UploadSyncState::PermanentError);
                    return Err(Status::IllegalState(message));
                }
            }
        }
    }

    async fn upload_batch(&mut self, commits: &[Commit]) -> Result<(), UploadError> {
        // Objects first, so that the cloud never advertises a commit whose
        // pieces cannot be fetched.
        for digest in self.storage.objects().unsynced_pieces()? {
            let bytes = self.storage.objects().read_piece_bytes(&digest)?;
            self.page_cloud
                .add_object(digest.to_bytes(), bytes.as_ref().clone())
                .await
                .map_err(classify)?;
            self.storage.objects().mark_piece_synced(&digest)?;
        }

        let remote: Vec<RemoteCommit> = commits
            .iter()
            .map(|commit| RemoteCommit {
                id: commit.id().to_bytes(),
                data: commit.encode(),
            })
            .collect();
        self.page_cloud
            .add_commits(remote)
            .await
            .map_err(classify)?;

        for commit in commits {
            self.storage.mark_commit_synced(commit.id())?;
        }
        tracing::debug!(
            page = %self.storage.page_id(),
            count = commits.len(),
            "uploaded commit batch"
        );
        Ok(())
    }

    // Clock upload is advisory: failures are logged and the next
    // successful batch retries with the then-latest clock (latest wins).
    async fn update_clock(&mut self) {
        let result: StatusResult<Vec<u8>> = (|| {
            let head = self.storage.latest_head()?;
            let clock = clock::update_own_entry(
                self.storage.objects().page_db(),
                &self.device_id,
                &head,
            )?;
            Ok(clock_pack::encode_clock(&clock))
        })();
        match result {
            Ok(pack) => {
                if let Err(err) = self.page_cloud.update_clock(pack).await {
                    tracing::warn!(?err, "clock upload failed");
                }
            }
            Err(err) => tracing::warn!(?err, "clock encoding failed"),
        }
    }
}

impl std::fmt::Debug for PageUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("PageUpload")
            .field("external_state", &self.external_state)
            .field("internal_state", &self.internal_state)
            .field("download_idle", &self.download_idle)
            .finish_non_exhaustive()
    }
}
