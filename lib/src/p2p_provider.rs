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

//! The transport interface carrying peer-to-peer sync messages.
//!
//! The transport delivers length-framed messages between co-present
//! devices and reports devices joining and leaving the mesh. Message
//! content is opaque to it.

use std::fmt::Debug;

use crate::object_id::id_type;
use crate::object_id::ObjectId as _;
use crate::status::StatusResult;

id_type!(
    /// Opaque identifier of a device on the mesh.
    pub P2pClientId
);

/// A device appearing on or leaving the mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceChange {
    /// The device became reachable.
    New,
    /// The device left; outstanding exchanges with it must be abandoned.
    Deleted,
}

/// Outgoing half of the transport. Incoming messages and device changes
/// are pushed by the embedder into the communicator's `on_message` /
/// `on_device_change`.
pub trait P2pProvider: Send + Sync + Debug {
    /// This device's mesh identifier.
    fn local_id(&self) -> &P2pClientId;

    /// Sends one framed message to `device`.
    fn send_message(&self, device: &P2pClientId, data: Vec<u8>) -> StatusResult<()>;
}
