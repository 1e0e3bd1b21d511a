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

//! The cloud backend interface consumed by synchronization.
//!
//! The cloud keeps, per page, an append-only commit log addressed by
//! opaque position tokens, plus an object map. A per-user device set holds
//! each device's fingerprint; its disappearance signals a cloud-side
//! erase.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::page_storage::PageId;

/// Errors reported by a cloud backend. Only [`CloudError::Network`] is
/// retryable; all other codes terminate the current operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CloudError {
    /// Authentication or authorization failed.
    #[error("cloud authentication failed")]
    Auth,
    /// The request was malformed.
    #[error("cloud rejected the request arguments")]
    Argument,
    /// The backend could not be reached. Retryable.
    #[error("cloud network error: {0}")]
    Network(String),
    /// The addressed entity does not exist.
    #[error("not found in the cloud")]
    NotFound,
    /// The backend failed internally.
    #[error("cloud server error: {0}")]
    Server(String),
    /// A payload could not be parsed.
    #[error("cloud payload failed to parse")]
    Parse,
    /// Unexpected local failure inside the provider.
    #[error("cloud provider internal error: {0}")]
    Internal(String),
}

impl CloudError {
    /// Whether retrying (after backoff) can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Result alias for cloud operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// A commit as stored in the cloud: an opaque remote id plus the encoded
/// body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCommit {
    /// Cloud-side commit identifier.
    pub id: Vec<u8>,
    /// Encoded commit body.
    pub data: Vec<u8>,
}

/// Opaque cursor into a page's commit log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionToken(
    /// The token bytes, meaningful only to the backend that issued them.
    pub Vec<u8>,
);

/// One entry of a [`DiffPack`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffPackEntry {
    /// Content-derived entry id.
    pub entry_id: Vec<u8>,
    /// Whether the entry is inserted or deleted relative to the base.
    pub deleted: bool,
    /// Encoded entry payload (key, object identifier, priority).
    pub payload: Vec<u8>,
}

/// A server-computed diff from one of the proposed bases to a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffPack {
    /// The base the server chose, as a remote commit id. Empty means the
    /// diff is from the empty page.
    pub base_remote_commit_id: Vec<u8>,
    /// The changed entries.
    pub entries: Vec<DiffPackEntry>,
}

/// Watcher notified when a page's cloud log grows.
pub trait CloudWatcher: Send + Sync {
    /// New entries were appended behind the watched position.
    fn on_new_commits(&self);
    /// The watch failed; the watcher is detached afterwards.
    fn on_error(&self, error: &CloudError);
}

/// Per-page cloud endpoint.
#[async_trait]
pub trait PageCloud: Send + Sync + Debug {
    /// Atomically appends a batch of commits. Rejection of any commit
    /// fails the whole batch.
    async fn add_commits(&self, commits: Vec<RemoteCommit>) -> CloudResult<()>;

    /// Reads the log from `min_token` (exclusive), returning the entries
    /// and the position after them.
    async fn get_commits(
        &self,
        min_token: Option<PositionToken>,
    ) -> CloudResult<(Vec<RemoteCommit>, Option<PositionToken>)>;

    /// Uploads one object.
    async fn add_object(&self, id: Vec<u8>, data: Vec<u8>) -> CloudResult<()>;

    /// Downloads one object.
    async fn get_object(&self, id: Vec<u8>) -> CloudResult<Vec<u8>>;

    /// Registers a watcher for log growth past `min_token`.
    async fn set_watcher(
        &self,
        min_token: Option<PositionToken>,
        watcher: Arc<dyn CloudWatcher>,
    ) -> CloudResult<()>;

    /// Asks the server for a diff of `commit_id` against one of
    /// `possible_bases`. Backends without diff support return
    /// [`CloudError::NotFound`]; callers fall back to object fetches.
    async fn get_diff(
        &self,
        commit_id: Vec<u8>,
        possible_bases: Vec<Vec<u8>>,
    ) -> CloudResult<DiffPack>;

    /// Merges this device's clock into the cloud clock and returns the
    /// merged pack.
    async fn update_clock(&self, clock_pack: Vec<u8>) -> CloudResult<Vec<u8>>;
}

/// Watcher over the per-user device set.
pub trait DeviceSetWatcher: Send + Sync {
    /// The device set disappeared or lost this device's fingerprint.
    fn on_cloud_erased(&self);
    /// The watch was interrupted by a network failure.
    fn on_network_error(&self);
}

/// The per-user set of device fingerprints.
#[async_trait]
pub trait DeviceSet: Send + Sync + Debug {
    /// Verifies the fingerprint is present. [`CloudError::NotFound`] means
    /// the cloud was erased since this device last synced.
    async fn check_fingerprint(&self, fingerprint: Vec<u8>) -> CloudResult<()>;

    /// Registers the fingerprint.
    async fn set_fingerprint(&self, fingerprint: Vec<u8>) -> CloudResult<()>;

    /// Watches the fingerprint for removal.
    async fn set_watcher(
        &self,
        fingerprint: Vec<u8>,
        watcher: Arc<dyn DeviceSetWatcher>,
    ) -> CloudResult<()>;

    /// Erases the whole device set (and with it, the user's cloud data).
    async fn erase(&self) -> CloudResult<()>;
}

/// Factory for the per-page and per-user cloud endpoints.
pub trait CloudProvider: Send + Sync + Debug {
    /// The user's device set.
    fn device_set(&self) -> Arc<dyn DeviceSet>;

    /// The endpoint for one page's log, namespaced by application id.
    fn page_cloud(&self, app_id: &[u8], page_id: &PageId) -> Arc<dyn PageCloud>;
}
