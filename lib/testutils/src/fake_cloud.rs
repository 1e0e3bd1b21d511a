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

//! An in-memory cloud backend shared by every "device" of a test.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use ledger_lib::cloud_provider::CloudError;
use ledger_lib::cloud_provider::CloudProvider;
use ledger_lib::cloud_provider::CloudResult;
use ledger_lib::cloud_provider::CloudWatcher;
use ledger_lib::cloud_provider::DeviceSet;
use ledger_lib::cloud_provider::DeviceSetWatcher;
use ledger_lib::cloud_provider::DiffPack;
use ledger_lib::cloud_provider::PageCloud;
use ledger_lib::cloud_provider::PositionToken;
use ledger_lib::cloud_provider::RemoteCommit;
use ledger_lib::page_storage::PageId;
use ledger_lib::object_id::ObjectId as _;

/// One page's cloud state: an append-only commit log plus an object map.
#[derive(Default)]
pub struct FakePageCloud {
    log: Mutex<Vec<RemoteCommit>>,
    seen_commit_ids: Mutex<HashSet<Vec<u8>>>,
    objects: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    watchers: Mutex<Vec<Arc<dyn CloudWatcher>>>,
    clock: Mutex<Option<Vec<u8>>>,
    // Number of upcoming requests that fail with a network error.
    failures_to_inject: AtomicUsize,
}

impl FakePageCloud {
    /// Makes the next `count` requests fail with a network error.
    pub fn inject_network_failures(&self, count: usize) {
        self.failures_to_inject.store(count, Ordering::SeqCst);
    }

    /// Number of commits in the log.
    pub fn commit_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    fn check_failure(&self) -> CloudResult<()> {
        let remaining = self
            .failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            });
        match remaining {
            Ok(_) => Err(CloudError::Network("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn parse_token(token: Option<PositionToken>) -> usize {
        token
            .and_then(|token| String::from_utf8(token.0).ok())
            .and_then(|token| token.parse().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PageCloud for FakePageCloud {
    async fn add_commits(&self, commits: Vec<RemoteCommit>) -> CloudResult<()> {
        self.check_failure()?;
        {
            let mut log = self.log.lock().unwrap();
            let mut seen = self.seen_commit_ids.lock().unwrap();
            for commit in commits {
                if seen.insert(commit.id.clone()) {
                    log.push(commit);
                }
            }
        }
        let watchers: Vec<_> = self.watchers.lock().unwrap().clone();
        for watcher in watchers {
            watcher.on_new_commits();
        }
        Ok(())
    }

    async fn get_commits(
        &self,
        min_token: Option<PositionToken>,
    ) -> CloudResult<(Vec<RemoteCommit>, Option<PositionToken>)> {
        self.check_failure()?;
        let start = Self::parse_token(min_token);
        let log = self.log.lock().unwrap();
        if start >= log.len() {
            return Ok((vec![], None));
        }
        let commits = log[start..].to_vec();
        let next = PositionToken(log.len().to_string().into_bytes());
        Ok((commits, Some(next)))
    }

    async fn add_object(&self, id: Vec<u8>, data: Vec<u8>) -> CloudResult<()> {
        self.check_failure()?;
        self.objects.lock().unwrap().insert(id, data);
        Ok(())
    }

    async fn get_object(&self, id: Vec<u8>) -> CloudResult<Vec<u8>> {
        self.check_failure()?;
        self.objects
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(CloudError::NotFound)
    }

    async fn set_watcher(
        &self,
        _min_token: Option<PositionToken>,
        watcher: Arc<dyn CloudWatcher>,
    ) -> CloudResult<()> {
        self.watchers.lock().unwrap().push(watcher);
        Ok(())
    }

    async fn get_diff(
        &self,
        _commit_id: Vec<u8>,
        _possible_bases: Vec<Vec<u8>>,
    ) -> CloudResult<DiffPack> {
        // This backend has no server-side diff support; clients fall back
        // to object fetches.
        Err(CloudError::NotFound)
    }

    async fn update_clock(&self, clock_pack: Vec<u8>) -> CloudResult<Vec<u8>> {
        self.check_failure()?;
        let mut clock = self.clock.lock().unwrap();
        *clock = Some(clock_pack.clone());
        Ok(clock_pack)
    }
}

impl std::fmt::Debug for FakePageCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("FakePageCloud")
            .field("commits", &self.commit_count())
            .field("objects", &self.object_count())
            .finish_non_exhaustive()
    }
}

type PageMap = Arc<Mutex<HashMap<(Vec<u8>, Vec<u8>), Arc<FakePageCloud>>>>;

/// The per-user device fingerprint set. Erasing it also wipes the user's
/// page data, as the real backend does.
#[derive(Default)]
pub struct FakeDeviceSet {
    fingerprints: Mutex<HashSet<Vec<u8>>>,
    watchers: Mutex<Vec<Arc<dyn DeviceSetWatcher>>>,
    pages: PageMap,
}

impl FakeDeviceSet {
    /// Fingerprints currently registered.
    pub fn fingerprint_count(&self) -> usize {
        self.fingerprints.lock().unwrap().len()
    }
}

#[async_trait]
impl DeviceSet for FakeDeviceSet {
    async fn check_fingerprint(&self, fingerprint: Vec<u8>) -> CloudResult<()> {
        if self.fingerprints.lock().unwrap().contains(&fingerprint) {
            Ok(())
        } else {
            Err(CloudError::NotFound)
        }
    }

    async fn set_fingerprint(&self, fingerprint: Vec<u8>) -> CloudResult<()> {
        self.fingerprints.lock().unwrap().insert(fingerprint);
        Ok(())
    }

    async fn set_watcher(
        &self,
        _fingerprint: Vec<u8>,
        watcher: Arc<dyn DeviceSetWatcher>,
    ) -> CloudResult<()> {
        self.watchers.lock().unwrap().push(watcher);
        Ok(())
    }

    async fn erase(&self) -> CloudResult<()> {
        self.fingerprints.lock().unwrap().clear();
        self.pages.lock().unwrap().clear();
        let watchers: Vec<_> = self.watchers.lock().unwrap().clone();
        for watcher in watchers {
            watcher.on_cloud_erased();
        }
        Ok(())
    }
}

impl std::fmt::Debug for FakeDeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("FakeDeviceSet")
            .field("fingerprints", &self.fingerprint_count())
            .finish_non_exhaustive()
    }
}

/// An in-memory [`CloudProvider`]. Share one instance between the
/// repositories of a test to simulate devices of the same user.
pub struct FakeCloudProvider {
    device_set: Arc<FakeDeviceSet>,
    pages: PageMap,
}

impl Default for FakeCloudProvider {
    fn default() -> Self {
        let pages: PageMap = Arc::default();
        let device_set = Arc::new(FakeDeviceSet {
            fingerprints: Mutex::default(),
            watchers: Mutex::default(),
            pages: pages.clone(),
        });
        Self { device_set, pages }
    }
}

impl FakeCloudProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The backing device set, for direct manipulation in tests.
    pub fn fake_device_set(&self) -> &Arc<FakeDeviceSet> {
        &self.device_set
    }

    /// The backing page state, for inspection in tests.
    pub fn fake_page_cloud(&self, app_id: &[u8], page_id: &PageId) -> Arc<FakePageCloud> {
        self.pages
            .lock()
            .unwrap()
            .entry((app_id.to_vec(), page_id.to_bytes()))
            .or_default()
            .clone()
    }
}

impl std::fmt::Debug for FakeCloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("FakeCloudProvider")
            .field("pages", &self.pages.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl CloudProvider for FakeCloudProvider {
    fn device_set(&self) -> Arc<dyn DeviceSet> {
        self.device_set.clone()
    }

    fn page_cloud(&self, app_id: &[u8], page_id: &PageId) -> Arc<dyn PageCloud> {
        self.fake_page_cloud(app_id, page_id)
    }
}
