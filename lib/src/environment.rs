// Copyright 2024 The Ledger Authors
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

//! Process-wide configuration, threaded explicitly through constructors.
//!
//! There are no global singletons: everything that would traditionally be a
//! process-wide flag (GC policy, serialization version, whether sync is
//! enabled, the wall clock) lives in an [`Environment`] owned by the
//! repository and shared with every component it creates.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// When stored pieces may be deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GarbageCollectionPolicy {
    /// Never delete anything.
    Never,
    /// Delete a piece as soon as its on-disk reference count reaches zero
    /// and no live identifier or snapshot retains it.
    EagerLiveReferences,
    /// Only delete when the caller explicitly asks for a collection.
    OnDemand,
}

/// Shared configuration for a repository and all its pages.
#[derive(Clone)]
pub struct Environment {
    gc_policy: GarbageCollectionPolicy,
    sync_enabled: bool,
    verbose: u8,
    serialization_version: String,
    clock: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl Environment {
    /// Starts building an environment with default settings.
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    /// The garbage collection policy for all pages.
    pub fn gc_policy(&self) -> GarbageCollectionPolicy {
        self.gc_policy
    }

    /// Whether cloud and p2p synchronization are enabled.
    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    /// Diagnostic verbosity requested by the embedder.
    pub fn verbose(&self) -> u8 {
        self.verbose
    }

    /// Name of the on-disk serialization version directory.
    pub fn serialization_version(&self) -> &str {
        &self.serialization_version
    }

    /// Current time in milliseconds since the epoch, from the configured
    /// clock.
    pub fn now_millis(&self) -> i64 {
        (self.clock)()
    }
}

impl Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Environment")
            .field("gc_policy", &self.gc_policy)
            .field("sync_enabled", &self.sync_enabled)
            .field("verbose", &self.verbose)
            .field("serialization_version", &self.serialization_version)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Environment`].
pub struct EnvironmentBuilder {
    gc_policy: GarbageCollectionPolicy,
    sync_enabled: bool,
    verbose: u8,
    serialization_version: String,
    clock: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self {
            gc_policy: GarbageCollectionPolicy::EagerLiveReferences,
            sync_enabled: true,
            verbose: 0,
            serialization_version: SERIALIZATION_VERSION.to_string(),
            clock: Arc::new(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
                    .unwrap_or(0)
            }),
        }
    }
}

/// Current on-disk serialization version. Bumped on incompatible layout
/// changes; repositories with a different version directory are ignored.
pub const SERIALIZATION_VERSION: &str = "38";

impl EnvironmentBuilder {
    /// Sets the garbage collection policy.
    pub fn gc_policy(mut self, policy: GarbageCollectionPolicy) -> Self {
        self.gc_policy = policy;
        self
    }

    /// Enables or disables synchronization.
    pub fn sync_enabled(mut self, enabled: bool) -> Self {
        self.sync_enabled = enabled;
        self
    }

    /// Sets diagnostic verbosity.
    pub fn verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    /// Overrides the wall clock. Tests use this for deterministic commit
    /// timestamps.
    pub fn clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Finishes the build.
    pub fn build(self) -> Environment {
        Environment {
            gc_policy: self.gc_policy,
            sync_enabled: self.sync_enabled,
            verbose: self.verbose,
            serialization_version: self.serialization_version,
            clock: self.clock,
        }
    }
}
