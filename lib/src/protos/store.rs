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

//! Serialization schema for locally stored objects: commits, b-tree nodes
//! and chunked-blob indexes.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectIdentifier {
    #[prost(uint32, tag = "1")]
    pub key_index: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub digest: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TreeEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub key: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub value: ::core::option::Option<ObjectIdentifier>,
    #[prost(enumeration = "KeyPriority", tag = "3")]
    pub priority: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub entry_id: ::prost::alloc::vec::Vec<u8>,
}

/// A non-empty child subtree of a tree node. `position` is the child slot,
/// in `0..=entries.len()`; absent positions are empty subtrees.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChildPointer {
    #[prost(uint32, tag = "1")]
    pub position: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub digest: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TreeNode {
    #[prost(uint32, tag = "1")]
    pub level: u32,
    #[prost(message, repeated, tag = "2")]
    pub entries: ::prost::alloc::vec::Vec<TreeEntry>,
    #[prost(message, repeated, tag = "3")]
    pub children: ::prost::alloc::vec::Vec<ChildPointer>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Commit {
    #[prost(message, optional, tag = "1")]
    pub root: ::core::option::Option<ObjectIdentifier>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub parents: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(uint64, tag = "3")]
    pub generation: u64,
    #[prost(int64, tag = "4")]
    pub timestamp_millis: i64,
}

/// One child of a chunked blob: a piece (chunk or nested index) and the
/// size of the content it expands to.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlobChild {
    #[prost(bytes = "vec", tag = "1")]
    pub digest: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub size: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlobIndex {
    #[prost(message, repeated, tag = "1")]
    pub children: ::prost::alloc::vec::Vec<BlobChild>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum KeyPriority {
    Eager = 0,
    Lazy = 1,
}
