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

//! A ledger repository: on-disk layout, device fingerprint, cloud/p2p
//! attachment and cloud-erase recovery.
//!
//! Layout under the repository root:
//!
//! ```text
//! <root>/staging/                      temporary files; survives erasure
//! <root>/<serialization-version>/      wiped on cloud erasure
//! <root>/<serialization-version>/fingerprint
//! <root>/<serialization-version>/<base64url(page-id)>/   one Db per page
//! ```

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use rand::RngCore as _;

use crate::clock::DeviceId;
use crate::cloud_provider::CloudError;
use crate::cloud_provider::CloudProvider;
use crate::cloud_provider::DeviceSetWatcher;
use crate::cloud_sync::PageSync;
use crate::db::Db;
use crate::environment::Environment;
use crate::fs_db::FsDb;
use crate::ledger::DbFactory;
use crate::ledger::LedgerManager;
use crate::ledger::Page;
use crate::merger::MergePolicy;
use crate::object_id::ObjectId as _;
use crate::p2p_provider::DeviceChange;
use crate::p2p_provider::P2pClientId;
use crate::p2p_provider::P2pProvider;
use crate::page_communicator::LedgerCommunicator;
use crate::page_storage::PageId;
use crate::status::IoResultExt as _;
use crate::status::Status;
use crate::status::StatusResult;

const STAGING_DIR: &str = "staging";
const FINGERPRINT_FILE: &str = "fingerprint";
const FINGERPRINT_SIZE: usize = 16;

const BASE64_URL: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

// Unpadded base64url, used for page directory names.
fn base64url_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        out.push(BASE64_URL[(n >> 18) as usize & 0x3f] as char);
        out.push(BASE64_URL[(n >> 12) as usize & 0x3f] as char);
        if chunk.len() > 1 {
            out.push(BASE64_URL[(n >> 6) as usize & 0x3f] as char);
        }
        if chunk.len() > 2 {
            out.push(BASE64_URL[n as usize & 0x3f] as char);
        }
    }
    out
}

#[derive(Debug)]
struct FsDbFactory {
    version_dir: PathBuf,
    staging_dir: PathBuf,
}

impl DbFactory for FsDbFactory {
    fn open_db(&self, page_id: &PageId) -> StatusResult<Arc<dyn Db>> {
        let dir = self
            .version_dir
            .join(base64url_encode(page_id.as_bytes()));
        Ok(Arc::new(FsDb::open(dir, self.staging_dir.clone())?))
    }
}

// Raises a flag when the cloud-side device set loses our fingerprint.
struct ErasureSignal {
    erased: Arc<AtomicBool>,
}

impl DeviceSetWatcher for ErasureSignal {
    fn on_cloud_erased(&self) {
        self.erased.store(true, Ordering::SeqCst);
    }

    fn on_network_error(&self) {
        // Transient; the watch resumes on the next sync attempt.
    }
}

/// A ledger repository rooted at one directory.
pub struct LedgerRepository {
    root: PathBuf,
    environment: Environment,
    app_id: Vec<u8>,
    manager: LedgerManager,
    fingerprint: Vec<u8>,
    fingerprint_registered: bool,
    cloud: Option<Arc<dyn CloudProvider>>,
    page_syncs: std::collections::HashMap<PageId, PageSync>,
    p2p: Option<Arc<LedgerCommunicator>>,
    erased: Arc<AtomicBool>,
}

impl LedgerRepository {
    /// Opens (creating if needed) the repository at `root`.
    pub fn open(
        root: impl Into<PathBuf>,
        environment: Environment,
        app_id: impl Into<Vec<u8>>,
    ) -> StatusResult<Self> {
        let root = root.into();
        crate::file_util::create_or_reuse_dir(&root).context(&root)?;
        let staging_dir = root.join(STAGING_DIR);
        crate::file_util::create_or_reuse_dir(&staging_dir).context(&staging_dir)?;
        let version_dir = root.join(environment.serialization_version());
        crate::file_util::create_or_reuse_dir(&version_dir).context(&version_dir)?;

        // The fingerprint file is only written once the cloud has
        // acknowledged it, so its presence distinguishes "registered
        // before" from "never synced".
        let (fingerprint, fingerprint_registered) = Self::load_fingerprint(&version_dir)?;
        let manager = LedgerManager::new(
            environment.clone(),
            Arc::new(FsDbFactory {
                version_dir,
                staging_dir,
            }),
            MergePolicy::LastOneWins,
        );
        Ok(Self {
            root,
            environment,
            app_id: app_id.into(),
            manager,
            fingerprint,
            fingerprint_registered,
            cloud: None,
            page_syncs: std::collections::HashMap::new(),
            p2p: None,
            erased: Arc::new(AtomicBool::new(false)),
        })
    }

    fn load_fingerprint(version_dir: &Path) -> StatusResult<(Vec<u8>, bool)> {
        let path = version_dir.join(FINGERPRINT_FILE);
        if path.is_file() {
            return Ok((fs::read(&path).context(&path)?, true));
        }
        let mut fingerprint = vec![0u8; FINGERPRINT_SIZE];
        rand::rng().fill_bytes(&mut fingerprint);
        Ok((fingerprint, false))
    }

    fn persist_fingerprint(&mut self) -> StatusResult<()> {
        let path = self.version_dir().join(FINGERPRINT_FILE);
        fs::write(&path, &self.fingerprint).context(&path)?;
        self.fingerprint_registered = true;
        Ok(())
    }

    /// This device's cloud fingerprint.
    pub fn fingerprint(&self) -> &[u8] {
        &self.fingerprint
    }

    /// The directory wiped on cloud erasure.
    pub fn version_dir(&self) -> PathBuf {
        self.root.join(self.environment.serialization_version())
    }

    /// The staging directory, retained across erasures.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// The page multiplexer.
    pub fn manager_mut(&mut self) -> &mut LedgerManager {
        &mut self.manager
    }

    /// Opens a page and, when a cloud or mesh is attached, wires up its
    /// sync engines.
    pub fn get_page(&mut self, page_id: &PageId) -> StatusResult<&mut Page> {
        let newly_opened = !self.manager.open_page_ids().contains(page_id);
        // Open through the manager first so the storage exists.
        let storage = self.manager.get_page(page_id)?.storage().clone();
        if newly_opened {
            if let Some(cloud) = &self.cloud {
                let page_cloud = cloud.page_cloud(&self.app_id, page_id);
                let device_id = DeviceId {
                    fingerprint: self.fingerprint.clone(),
                    epoch: 0,
                };
                self.page_syncs.insert(
                    page_id.clone(),
                    PageSync::new(storage.clone(), page_cloud, device_id),
                );
            }
            if let Some(p2p) = &self.p2p {
                let communicator = p2p.register_page(storage);
                self.manager
                    .get_page(page_id)?
                    .set_communicator(communicator);
            }
        }
        self.manager.get_page(page_id)
    }

    /// The sync engine of an open page, if cloud sync is attached.
    pub fn page_sync_mut(&mut self, page_id: &PageId) -> Option<&mut PageSync> {
        self.page_syncs.get_mut(page_id)
    }

    /// Attaches the cloud. Performs the fingerprint handshake: an absent
    /// fingerprint at first check means the cloud was erased since this
    /// repository last synced, and the local state is discarded.
    pub async fn attach_cloud(&mut self, provider: Arc<dyn CloudProvider>) -> StatusResult<()> {
        let device_set = provider.device_set();
        if self.fingerprint_registered {
            // This repository has synced before; the fingerprint must
            // still be in the cloud device set.
            match device_set.check_fingerprint(self.fingerprint.clone()).await {
                Ok(()) => {}
                Err(CloudError::NotFound) => {
                    tracing::warn!("cloud fingerprint not found, resetting local state");
                    self.wipe_local_state()?;
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(?err, "fingerprint check failed, staying offline");
                }
                Err(err) => {
                    return Err(Status::Network(err.to_string()));
                }
            }
        }
        if !self.fingerprint_registered {
            device_set
                .set_fingerprint(self.fingerprint.clone())
                .await
                .map_err(|err| Status::Network(err.to_string()))?;
            self.persist_fingerprint()?;
        }
        let watcher = Arc::new(ErasureSignal {
            erased: self.erased.clone(),
        });
        if let Err(err) = device_set
            .set_watcher(self.fingerprint.clone(), watcher)
            .await
        {
            tracing::warn!(?err, "device set watch failed");
        }
        self.cloud = Some(provider);
        Ok(())
    }

    /// Attaches a p2p mesh under this repository's namespace.
    pub fn attach_p2p(&mut self, provider: Arc<dyn P2pProvider>) -> Arc<LedgerCommunicator> {
        let communicator = Arc::new(LedgerCommunicator::new(provider, self.app_id.clone()));
        self.p2p = Some(communicator.clone());
        communicator
    }

    /// Forwards a mesh membership change to every open page.
    pub fn on_p2p_device_change(&self, device: &P2pClientId, change: DeviceChange) {
        if let Some(p2p) = &self.p2p {
            p2p.on_device_change(device, change);
        }
    }

    /// Whether a cloud erasure has been signalled and not yet processed.
    pub fn erasure_pending(&self) -> bool {
        self.erased.load(Ordering::SeqCst)
    }

    /// Runs one synchronization cycle over every open page: handles a
    /// pending cloud erasure, pumps cloud sync, exchanges queued p2p work
    /// and settles pages (merges + watcher deliveries).
    pub async fn sync_cycle(&mut self) -> StatusResult<()> {
        if self.erased.swap(false, Ordering::SeqCst) {
            self.handle_cloud_erasure().await?;
            return Ok(());
        }
        if let Some(p2p) = &self.p2p {
            p2p.process_queued_work().await?;
        }
        let page_ids = self.manager.open_page_ids();
        for page_id in &page_ids {
            if let Some(sync) = self.page_syncs.get_mut(page_id) {
                sync.pump().await?;
            }
            let page = self.manager.get_page(page_id)?;
            page.settle().await?;
            // Settling may create merge commits that need uploading.
            if let Some(sync) = self.page_syncs.get_mut(page_id) {
                sync.pump().await?;
            }
        }
        if let Some(p2p) = &self.p2p {
            p2p.process_queued_work().await?;
        }
        Ok(())
    }

    /// Starts cloud sync for every open page.
    pub async fn start_sync(&mut self) -> StatusResult<()> {
        for page_id in self.manager.open_page_ids() {
            if let Some(sync) = self.page_syncs.get_mut(&page_id) {
                sync.start().await?;
            }
            self.manager.get_page(&page_id)?.settle().await?;
        }
        Ok(())
    }

    // Discards everything under the serialization version directory (the
    // staging directory at the root survives), disconnects page clients
    // and prepares a fresh fingerprint. The process stays up; the next
    // page open starts from scratch.
    async fn handle_cloud_erasure(&mut self) -> StatusResult<()> {
        tracing::warn!(root = %self.root.display(), "cloud erased, wiping local state");
        self.wipe_local_state()?;
        if let Some(cloud) = &self.cloud {
            let device_set = cloud.device_set();
            match device_set.set_fingerprint(self.fingerprint.clone()).await {
                Ok(()) => {
                    self.persist_fingerprint()?;
                }
                Err(err) => tracing::warn!(?err, "fingerprint re-registration failed"),
            }
            let watcher = Arc::new(ErasureSignal {
                erased: self.erased.clone(),
            });
            if let Err(err) = device_set
                .set_watcher(self.fingerprint.clone(), watcher)
                .await
            {
                tracing::warn!(?err, "device set re-watch failed");
            }
        }
        Ok(())
    }

    fn wipe_local_state(&mut self) -> StatusResult<()> {
        self.manager.disconnect_all();
        self.page_syncs.clear();

        let version_dir = self.version_dir();
        crate::file_util::remove_dir_contents_except(&version_dir, &[STAGING_DIR])
            .context(&version_dir)?;
        let (fingerprint, registered) = Self::load_fingerprint(&version_dir)?;
        self.fingerprint = fingerprint;
        self.fingerprint_registered = registered;
        Ok(())
    }
}

impl std::fmt::Debug for LedgerRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("LedgerRepository")
            .field("root", &self.root)
            .field("open_pages", &self.manager.open_page_ids().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pollster::FutureExt as _;

    use super::*;

    #[test]
    fn test_base64url_encode() {
        assert_eq!(base64url_encode(b""), "");
        assert_eq!(base64url_encode(b"f"), "Zg");
        assert_eq!(base64url_encode(b"fo"), "Zm8");
        assert_eq!(base64url_encode(b"foo"), "Zm9v");
        assert_eq!(base64url_encode(b"foob"), "Zm9vYg");
        // The url-safe alphabet is used.
        assert_eq!(base64url_encode(&[0xfb, 0xff]), "-_8");
    }

    fn new_repository(temp_dir: &tempfile::TempDir) -> LedgerRepository {
        LedgerRepository::open(
            temp_dir.path().join("repo"),
            Environment::builder().clock(|| 7).build(),
            b"test-app".to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn test_disk_layout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut repository = new_repository(&temp_dir);

        let page_id = PageId::from_bytes(b"layout-test-page");
        let page = repository.get_page(&page_id).unwrap();
        page.put(b"k".to_vec(), b"v").block_on().unwrap();

        assert!(repository.staging_dir().is_dir());
        assert!(repository.version_dir().is_dir());
        let page_dir = repository
            .version_dir()
            .join(base64url_encode(page_id.as_bytes()));
        assert!(page_dir.is_dir());
        // The fingerprint is only persisted once the cloud acknowledges it.
        assert!(!repository.version_dir().join(FINGERPRINT_FILE).exists());
    }

    #[test]
    fn test_registered_fingerprint_is_loaded_on_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let version_dir = {
            let repository = new_repository(&temp_dir);
            assert_eq!(repository.fingerprint().len(), FINGERPRINT_SIZE);
            repository.version_dir()
        };
        // Simulate an earlier successful registration.
        fs::write(version_dir.join(FINGERPRINT_FILE), b"0123456789abcdef").unwrap();

        let repository = new_repository(&temp_dir);
        assert_eq!(repository.fingerprint(), b"0123456789abcdef");
    }

    #[test]
    fn test_unregistered_fingerprints_are_fresh_per_open() {
        let temp_dir = tempfile::tempdir().unwrap();
        let first = new_repository(&temp_dir).fingerprint().to_vec();
        let second = new_repository(&temp_dir).fingerprint().to_vec();
        assert_ne!(first, second);
    }

    #[test]
    fn test_page_data_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let page_id = PageId::from_bytes(b"persistent-page1");
        {
            let mut repository = new_repository(&temp_dir);
            let page = repository.get_page(&page_id).unwrap();
            page.put(b"k".to_vec(), b"v").block_on().unwrap();
        }
        let mut repository = new_repository(&temp_dir);
        let page = repository.get_page(&page_id).unwrap();
        let snapshot = page.get_snapshot(vec![], None).block_on().unwrap();
        assert_eq!(snapshot.get(b"k").unwrap(), b"v");
    }
}
