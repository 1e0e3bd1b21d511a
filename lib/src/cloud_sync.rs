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

//! Per-page cloud synchronization: wires the upload and download halves
//! together and reports their combined state.

use std::sync::Arc;

use futures::FutureExt as _;
use futures::StreamExt as _;
use futures::channel::mpsc;
use prost::Message as _;

use crate::btree::Entry;
use crate::btree::EntryId;
use crate::btree::KeyPriority;
use crate::clock::DeviceId;
use crate::cloud_provider::PageCloud;
use crate::object_id::ObjectId as _;
use crate::page_download::DownloadSyncState;
use crate::page_download::PageDownload;
use crate::page_storage::CommitEvent;
use crate::page_storage::PageStorage;
use crate::page_upload::PageUpload;
use crate::page_upload::UploadSyncState;
use crate::piece::ObjectDigest;
use crate::piece::ObjectIdentifier;
use crate::protos;
use crate::status::Status;
use crate::status::StatusResult;

/// Encodes one entry for transport in a server-side diff.
pub fn encode_entry_payload(entry: &Entry) -> Vec<u8> {
    let proto = protos::cloud::EntryPayload {
        entry_name: entry.key.clone(),
        object_identifier: Some(protos::store::ObjectIdentifier {
            key_index: entry.value.key_index(),
            digest: entry.value.digest().to_bytes(),
        }),
        priority: match entry.priority {
            KeyPriority::Eager => protos::store::KeyPriority::Eager as i32,
            KeyPriority::Lazy => protos::store::KeyPriority::Lazy as i32,
        },
    };
    proto.encode_to_vec()
}

/// Decodes an entry payload received in a diff. The entry id travels next
/// to the payload, not inside it.
pub fn decode_entry_payload(entry_id: &[u8], payload: &[u8]) -> StatusResult<Entry> {
    let proto = protos::cloud::EntryPayload::decode(payload)
        .map_err(|err| Status::DataIntegrity(format!("malformed entry payload: {err}")))?;
    let identifier = proto
        .object_identifier
        .ok_or_else(|| Status::DataIntegrity("entry payload has no object id".to_string()))?;
    let priority = match protos::store::KeyPriority::try_from(proto.priority) {
        Ok(protos::store::KeyPriority::Eager) => KeyPriority::Eager,
        Ok(protos::store::KeyPriority::Lazy) => KeyPriority::Lazy,
        Err(_) => {
            return Err(Status::DataIntegrity(format!(
                "unknown priority tag {}",
                proto.priority
            )));
        }
    };
    Ok(Entry {
        key: proto.entry_name,
        value: ObjectIdentifier::untracked(
            identifier.key_index,
            ObjectDigest::from_bytes(&identifier.digest)?,
        ),
        priority,
        entry_id: EntryId::from_bytes(entry_id),
    })
}

/// Observer of the page's (download, upload) state pair.
pub trait SyncStateWatcher: Send + Sync {
    /// Called whenever either state changes, and once at registration.
    fn on_sync_state_changed(&self, download: DownloadSyncState, upload: UploadSyncState);
}

/// Cloud synchronization for one page.
pub struct PageSync {
    upload: PageUpload,
    download: PageDownload,
    commit_events: mpsc::UnboundedReceiver<CommitEvent>,
    state_watcher: Option<Arc<dyn SyncStateWatcher>>,
    last_reported: Option<(DownloadSyncState, UploadSyncState)>,
}

impl PageSync {
    /// Creates the sync pair for `storage` against `page_cloud`,
    /// identifying this device as `device_id` in the page clock.
    pub fn new(
        storage: Arc<PageStorage>,
        page_cloud: Arc<dyn PageCloud>,
        device_id: DeviceId,
    ) -> Self {
        let commit_events = storage.subscribe_commits();
        Self {
            upload: PageUpload::new(storage.clone(), page_cloud.clone(), device_id),
            download: PageDownload::new(storage, page_cloud),
            commit_events,
            state_watcher: None,
            last_reported: None,
        }
    }

    /// Registers a state watcher, reporting the current state right away.
    pub fn set_state_watcher(&mut self, watcher: Arc<dyn SyncStateWatcher>) {
        watcher.on_sync_state_changed(self.download.state(), self.upload.state());
        self.last_reported = Some((self.download.state(), self.upload.state()));
        self.state_watcher = Some(watcher);
    }

    /// The current (download, upload) states.
    pub fn states(&self) -> (DownloadSyncState, UploadSyncState) {
        (self.download.state(), self.upload.state())
    }

    /// The upload half, for tests and tuning.
    pub fn upload_mut(&mut self) -> &mut PageUpload {
        &mut self.upload
    }

    /// The download half, for tests and tuning.
    pub fn download_mut(&mut self) -> &mut PageDownload {
        &mut self.download
    }

    /// Starts sync: registers the cloud watcher, fetches the backlog and
    /// uploads local work.
    pub async fn start(&mut self) -> StatusResult<()> {
        self.download.start().await?;
        self.upload.start();
        self.pump().await
    }

    /// Runs one convergence cycle: reacts to local commits and cloud
    /// notifications, then drives upload until it pauses.
    pub async fn pump(&mut self) -> StatusResult<()> {
        self.drain_commit_events();
        self.download.take_notifications();
        self.download.fetch_backlog().await?;
        self.drain_commit_events();
        self.upload.set_download_idle(self.download.is_idle());
        self.upload.run().await?;
        self.report_states();
        Ok(())
    }

    fn drain_commit_events(&mut self) {
        while let Some(Some(event)) = self.commit_events.next().now_or_never() {
            self.upload.on_new_commits(event.source);
        }
    }

    fn report_states(&mut self) {
        let states = self.states();
        if self.last_reported == Some(states) {
            return;
        }
        self.last_reported = Some(states);
        if let Some(watcher) = &self.state_watcher {
            watcher.on_sync_state_changed(states.0, states.1);
        }
    }
}

impl std::fmt::Debug for PageSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("PageSync")
            .field("download", &self.download)
            .field("upload", &self.upload)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::piece::PieceType;

    fn test_entry(priority: KeyPriority) -> Entry {
        let value = ObjectIdentifier::untracked(
            2,
            ObjectDigest::compute(PieceType::InlineBlob, b"payload"),
        );
        Entry {
            key: b"entry-key".to_vec(),
            entry_id: crate::btree::entry_id_for_insert(b"entry-key", &value, priority),
            value,
            priority,
        }
    }

    #[test]
    fn test_entry_payload_round_trip() {
        for priority in [KeyPriority::Eager, KeyPriority::Lazy] {
            let entry = test_entry(priority);
            let payload = encode_entry_payload(&entry);
            let decoded =
                decode_entry_payload(entry.entry_id.as_bytes(), &payload).unwrap();
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn test_entry_payload_rejects_missing_identifier() {
        let proto = protos::cloud::EntryPayload {
            entry_name: b"k".to_vec(),
            object_identifier: None,
            priority: 0,
        };
        assert_matches!(
            decode_entry_payload(b"id", &proto.encode_to_vec()),
            Err(Status::DataIntegrity(_))
        );
    }
}
