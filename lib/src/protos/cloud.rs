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

//! Schema for data exchanged with the cloud: the per-page device clock pack
//! and entry payloads carried in diffs.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClockEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub commit_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub generation: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TombstoneEntry {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeletionEntry {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceClock {
    #[prost(bytes = "vec", tag = "1")]
    pub fingerprint: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub epoch: u64,
    #[prost(oneof = "device_clock::Entry", tags = "3, 4, 5")]
    pub entry: ::core::option::Option<device_clock::Entry>,
}

/// Nested message and enum types in `DeviceClock`.
pub mod device_clock {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Entry {
        #[prost(message, tag = "3")]
        Live(super::ClockEntry),
        #[prost(message, tag = "4")]
        Tombstone(super::TombstoneEntry),
        #[prost(message, tag = "5")]
        Deletion(super::DeletionEntry),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Clock {
    #[prost(message, repeated, tag = "1")]
    pub devices: ::prost::alloc::vec::Vec<DeviceClock>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntryPayload {
    #[prost(bytes = "vec", tag = "1")]
    pub entry_name: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub object_identifier: ::core::option::Option<super::store::ObjectIdentifier>,
    #[prost(enumeration = "super::store::KeyPriority", tag = "3")]
    pub priority: i32,
}
