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

//! Shared fixtures for ledger-lib integration tests: an in-memory cloud
//! provider, an in-memory p2p mesh, and assorted helpers.

#![allow(missing_docs)]

pub mod fake_cloud;
pub mod fake_mesh;

use ledger_lib::environment::Environment;
use ledger_lib::page_storage::PageId;
use ledger_lib::repository::LedgerRepository;
use ledger_lib::status::StatusResult;
use pollster::FutureExt as _;
use tempfile::TempDir;

pub use self::fake_cloud::FakeCloudProvider;
pub use self::fake_mesh::FakeMesh;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("ledger-test-")
        .tempdir()
        .unwrap()
}

/// A deterministic test environment: fixed clock, sync enabled.
pub fn test_environment() -> Environment {
    Environment::builder().clock(|| 1_600_000_000_000).build()
}

pub fn page_id(name: &str) -> PageId {
    // Page ids are fixed-width in the wire protocol; pad the readable name.
    let mut bytes = name.as_bytes().to_vec();
    bytes.resize(16, b'_');
    PageId::new(bytes)
}

/// Opens a repository under `temp_dir` with the test environment.
pub fn open_repository(temp_dir: &TempDir, name: &str) -> LedgerRepository {
    LedgerRepository::open(
        temp_dir.path().join(name),
        test_environment(),
        b"test-app".to_vec(),
    )
    .unwrap()
}

/// Runs sync cycles over the given repositories until convergence has had
/// ample opportunity. Propagation in the fakes is synchronous, so a small
/// fixed number of alternating rounds is sufficient for any test scenario.
pub fn sync_until_quiescent(repositories: &mut [&mut LedgerRepository]) -> StatusResult<()> {
    for _ in 0..8 {
        for repository in &mut *repositories {
            repository.sync_cycle().block_on()?;
        }
    }
    Ok(())
}
