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

//! Peer-to-peer message schema. Every message is a tagged union; messages
//! with a missing required field or an unknown tag are dropped by the
//! decoder.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NamespacePageId {
    #[prost(bytes = "vec", tag = "1")]
    pub namespace_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub page_id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WatchStartRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WatchStopRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitRequest {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub commit_ids: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectRequest {
    #[prost(message, repeated, tag = "1")]
    pub object_ids: ::prost::alloc::vec::Vec<super::store::ObjectIdentifier>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(message, optional, tag = "1")]
    pub namespace_page: ::core::option::Option<NamespacePageId>,
    #[prost(oneof = "request::Message", tags = "2, 3, 4, 5")]
    pub message: ::core::option::Option<request::Message>,
}

/// Nested message and enum types in `Request`.
pub mod request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "2")]
        WatchStart(super::WatchStartRequest),
        #[prost(message, tag = "3")]
        WatchStop(super::WatchStopRequest),
        #[prost(message, tag = "4")]
        CommitRequest(super::CommitRequest),
        #[prost(message, tag = "5")]
        ObjectRequest(super::ObjectRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitResponse {
    #[prost(message, repeated, tag = "1")]
    pub commits: ::prost::alloc::vec::Vec<CommitEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectEntry {
    #[prost(message, optional, tag = "1")]
    pub id: ::core::option::Option<super::store::ObjectIdentifier>,
    #[prost(enumeration = "ObjectStatus", tag = "2")]
    pub status: i32,
    /// Absent when `status` is not `OK`.
    #[prost(bytes = "vec", optional, tag = "3")]
    pub data: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(enumeration = "ObjectSyncStatus", tag = "4")]
    pub sync_status: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectResponse {
    #[prost(message, repeated, tag = "1")]
    pub objects: ::prost::alloc::vec::Vec<ObjectEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(enumeration = "ResponseStatus", tag = "1")]
    pub status: i32,
    #[prost(message, optional, tag = "2")]
    pub namespace_page: ::core::option::Option<NamespacePageId>,
    #[prost(oneof = "response::Message", tags = "3, 4")]
    pub message: ::core::option::Option<response::Message>,
}

/// Nested message and enum types in `Response`.
pub mod response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "3")]
        CommitResponse(super::CommitResponse),
        #[prost(message, tag = "4")]
        ObjectResponse(super::ObjectResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(oneof = "envelope::Message", tags = "1, 2")]
    pub message: ::core::option::Option<envelope::Message>,
}

/// Nested message and enum types in `Envelope`.
pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Request(super::Request),
        #[prost(message, tag = "2")]
        Response(super::Response),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResponseStatus {
    Ok = 0,
    UnknownNamespace = 1,
    UnknownPage = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ObjectStatus {
    Ok = 0,
    UnknownObject = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ObjectSyncStatus {
    Unsynced = 0,
    SyncedToCloud = 1,
}
