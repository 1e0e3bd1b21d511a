// Copyright 2023 The Ledger Authors
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

//! The error taxonomy shared by all Ledger subsystems.

use std::io;
use std::path::Path;

use thiserror::Error;

/// Error kinds surfaced by storage, merging and synchronization.
///
/// The taxonomy is deliberately small: sync layers swallow
/// [`Status::Network`] with backoff, [`Status::DataIntegrity`] from local
/// storage is fatal for the affected page, and [`Status::Interrupted`]
/// represents caller-driven cancellation rather than a programming error.
#[derive(Debug, Error)]
pub enum Status {
    /// An object referenced internally (by digest or commit id) is absent
    /// from local storage. Not a client-visible key lookup failure.
    #[error("object not found: {0}")]
    InternalNotFound(String),
    /// The requested key does not exist in the page.
    #[error("key not found")]
    KeyNotFound,
    /// An inline read was attempted on a value larger than the inline limit.
    #[error("value of {size} bytes exceeds the inline limit of {limit} bytes")]
    ValueTooLarge {
        /// Actual size of the value.
        size: u64,
        /// The inline limit that was exceeded.
        limit: u64,
    },
    /// A remote endpoint (cloud or peer) could not be reached. Retryable.
    #[error("network error: {0}")]
    Network(String),
    /// The underlying key/value store failed.
    #[error("I/O error accessing {context}")]
    Io {
        /// What was being accessed.
        context: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// An invariant was violated. Indicates a bug in the caller or in Ledger.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// Stored or received bytes fail validation (digest mismatch, malformed
    /// encoding, unknown tag).
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
    /// The operation was cancelled by the caller going away.
    #[error("operation interrupted")]
    Interrupted,
    /// The requested page is not known to this repository.
    #[error("page not found")]
    PageNotFound,
    /// The value is LAZY and not present locally; it must be fetched first.
    #[error("value needs to be fetched")]
    NeedsFetch,
    /// The operation is not supported by this build.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl Clone for Status {
    fn clone(&self) -> Self {
        match self {
            Self::InternalNotFound(s) => Self::InternalNotFound(s.clone()),
            Self::KeyNotFound => Self::KeyNotFound,
            Self::ValueTooLarge { size, limit } => Self::ValueTooLarge {
                size: *size,
                limit: *limit,
            },
            Self::Network(s) => Self::Network(s.clone()),
            // io::Error does not implement Clone; preserve kind and message.
            Self::Io { context, source } => Self::Io {
                context: context.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
            Self::IllegalState(s) => Self::IllegalState(s.clone()),
            Self::DataIntegrity(s) => Self::DataIntegrity(s.clone()),
            Self::Interrupted => Self::Interrupted,
            Self::PageNotFound => Self::PageNotFound,
            Self::NeedsFetch => Self::NeedsFetch,
            Self::NotImplemented(s) => Self::NotImplemented(s),
        }
    }
}

impl Status {
    /// Wraps an I/O error with the path or row that was being accessed.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the failed operation may be retried (possibly after backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Whether the error makes the whole page unusable. Per-page fatal errors
    /// disconnect clients of the page but leave the process up.
    pub fn is_fatal_for_page(&self) -> bool {
        matches!(self, Self::DataIntegrity(_) | Self::Io { .. })
    }
}

/// Result alias used throughout Ledger.
pub type StatusResult<T> = Result<T, Status>;

/// Helper to attach the accessed path to `io::Result`s.
pub trait IoResultExt<T> {
    /// Converts the error into [`Status::Io`] with `path` as context.
    fn context(self, path: impl AsRef<Path>) -> StatusResult<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context(self, path: impl AsRef<Path>) -> StatusResult<T> {
        self.map_err(|error| Status::io(path.as_ref().display().to_string(), error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Status::Network("timeout".to_string()).is_retryable());
        assert!(!Status::KeyNotFound.is_retryable());
        assert!(!Status::Interrupted.is_retryable());
    }

    #[test]
    fn test_fatal_for_page() {
        assert!(Status::DataIntegrity("bad digest".to_string()).is_fatal_for_page());
        assert!(!Status::Network("offline".to_string()).is_fatal_for_page());
    }
}
