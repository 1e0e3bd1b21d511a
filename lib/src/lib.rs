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

//! Ledger is an offline-first, per-page key/value store. Each page is an
//! independently versioned key/value map backed by a content-addressed commit
//! graph; devices owned by the same user converge through cloud and
//! peer-to-peer synchronization, resolving concurrent writes with a pluggable
//! merge policy.

#![warn(missing_docs)]

pub mod backoff;
pub mod btree;
pub mod chunking;
pub mod clock;
pub mod clock_pack;
pub mod cloud_provider;
pub mod cloud_sync;
pub mod commit;
pub mod commit_graph;
pub mod db;
pub mod environment;
pub mod file_util;
pub mod fs_db;
pub mod hex_util;
pub mod journal;
pub mod ledger;
pub mod lru_cache;
pub mod memory_db;
pub mod merger;
pub mod object_id;
pub mod object_store;
pub mod p2p_provider;
pub mod page_communicator;
pub mod page_db;
pub mod page_download;
pub mod page_storage;
pub mod page_upload;
pub mod piece;
pub mod protos;
pub mod repository;
pub mod snapshot;
pub mod status;
pub mod watcher;
