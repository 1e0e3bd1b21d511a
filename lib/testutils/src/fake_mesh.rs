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

//! An in-memory p2p mesh delivering messages synchronously between the
//! communicators of a test.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use ledger_lib::p2p_provider::DeviceChange;
use ledger_lib::p2p_provider::P2pClientId;
use ledger_lib::p2p_provider::P2pProvider;
use ledger_lib::page_communicator::LedgerCommunicator;
use ledger_lib::status::StatusResult;

/// The mesh: a registry of devices and their message handlers.
#[derive(Default)]
pub struct FakeMesh {
    handlers: Mutex<HashMap<P2pClientId, Arc<LedgerCommunicator>>>,
}

impl FakeMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates the provider for one device.
    pub fn provider(self: &Arc<Self>, name: &[u8]) -> Arc<MeshProvider> {
        Arc::new(MeshProvider {
            mesh: self.clone(),
            local: P2pClientId::from_bytes(name),
        })
    }

    /// Attaches a device's message handler to the mesh.
    pub fn register(&self, id: P2pClientId, communicator: Arc<LedgerCommunicator>) {
        self.handlers.lock().unwrap().insert(id, communicator);
    }

    /// Announces every registered device to every other one.
    pub fn announce_all(&self) {
        let handlers: Vec<(P2pClientId, Arc<LedgerCommunicator>)> = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, handler)| (id.clone(), handler.clone()))
            .collect();
        for (id, _) in &handlers {
            for (other_id, other_handler) in &handlers {
                if id != other_id {
                    other_handler.on_device_change(id, DeviceChange::New);
                }
            }
        }
    }

    /// Removes a device from the mesh, announcing the deletion to the
    /// remaining ones.
    pub fn disconnect(&self, id: &P2pClientId) {
        let remaining: Vec<Arc<LedgerCommunicator>> = {
            let mut handlers = self.handlers.lock().unwrap();
            handlers.remove(id);
            handlers.values().cloned().collect()
        };
        for handler in remaining {
            handler.on_device_change(id, DeviceChange::Deleted);
        }
    }
}

impl std::fmt::Debug for FakeMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("FakeMesh")
            .field("devices", &self.handlers.lock().unwrap().len())
            .finish()
    }
}

/// The outgoing transport half of one device.
#[derive(Debug)]
pub struct MeshProvider {
    mesh: Arc<FakeMesh>,
    local: P2pClientId,
}

impl P2pProvider for MeshProvider {
    fn local_id(&self) -> &P2pClientId {
        &self.local
    }

    fn send_message(&self, device: &P2pClientId, data: Vec<u8>) -> StatusResult<()> {
        // Synchronous delivery: the receiving communicator processes the
        // message (and may send replies) before this call returns.
        let handler = self.mesh.handlers.lock().unwrap().get(device).cloned();
        if let Some(handler) = handler {
            handler.on_message(&self.local, &data);
        }
        Ok(())
    }
}
