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

//! Peer-to-peer synchronization of one page, and the mesh-level
//! multiplexer routing messages to pages.
//!
//! Peers announce interest with `WatchStart`; interest is persisted before
//! it is acknowledged. Local commits are pushed to every interested peer;
//! missing objects are fetched by broadcasting a request and taking the
//! first successful reply.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use futures::FutureExt as _;
use futures::StreamExt as _;
use futures::channel::mpsc;
use futures::channel::oneshot;
use prost::Message as _;

use crate::commit::CommitId;
use crate::commit_graph::CommitGraphError;
use crate::object_id::ObjectId as _;
use crate::p2p_provider::DeviceChange;
use crate::p2p_provider::P2pClientId;
use crate::p2p_provider::P2pProvider;
use crate::page_storage::CommitEvent;
use crate::page_storage::PageStorage;
use crate::piece::ChangeSource;
use crate::piece::ObjectDigest;
use crate::protos::p2p as proto;
use crate::status::Status;
use crate::status::StatusResult;

type ObjectFetchResult = StatusResult<(Vec<u8>, bool)>;

struct PendingFetch {
    remaining: HashSet<P2pClientId>,
    senders: Vec<oneshot::Sender<ObjectFetchResult>>,
}

struct Inner {
    connected: HashSet<P2pClientId>,
    interested: HashSet<P2pClientId>,
    pending_objects: HashMap<ObjectDigest, PendingFetch>,
    // Digests of pieces referenced by commits received over p2p that are
    // not present locally yet.
    missing_pieces: Vec<ObjectDigest>,
    // Commits whose ancestors are still being backfilled. Retried whenever
    // more commits arrive.
    pending_commits: Vec<(CommitId, Vec<u8>)>,
}

/// Peer-to-peer sync endpoint for one page.
pub struct PageCommunicator {
    storage: Arc<PageStorage>,
    provider: Arc<dyn P2pProvider>,
    namespace_id: Vec<u8>,
    page_id_bytes: Vec<u8>,
    inner: Mutex<Inner>,
    commit_events: Mutex<mpsc::UnboundedReceiver<CommitEvent>>,
}

impl PageCommunicator {
    /// Creates the endpoint. Call [`Self::on_device_change`] to announce
    /// reachable peers.
    pub fn new(
        storage: Arc<PageStorage>,
        provider: Arc<dyn P2pProvider>,
        namespace_id: Vec<u8>,
    ) -> Self {
        let commit_events = storage.subscribe_commits();
        let page_id_bytes = storage.page_id().to_bytes();
        Self {
            storage,
            provider,
            namespace_id,
            page_id_bytes,
            inner: Mutex::new(Inner {
                connected: HashSet::new(),
                interested: HashSet::new(),
                pending_objects: HashMap::new(),
                missing_pieces: vec![],
                pending_commits: vec![],
            }),
            commit_events: Mutex::new(commit_events),
        }
    }

    fn namespace_page(&self) -> proto::NamespacePageId {
        proto::NamespacePageId {
            namespace_id: self.namespace_id.clone(),
            page_id: self.page_id_bytes.clone(),
        }
    }

    fn send_request(&self, to: &P2pClientId, message: proto::request::Message) {
        let envelope = proto::Envelope {
            message: Some(proto::envelope::Message::Request(proto::Request {
                namespace_page: Some(self.namespace_page()),
                message: Some(message),
            })),
        };
        if let Err(err) = self.provider.send_message(to, envelope.encode_to_vec()) {
            tracing::warn!(?err, peer = %to, "failed to send p2p request");
        }
    }

    fn send_response(&self, to: &P2pClientId, message: proto::response::Message) {
        let envelope = proto::Envelope {
            message: Some(proto::envelope::Message::Response(proto::Response {
                status: proto::ResponseStatus::Ok as i32,
                namespace_page: Some(self.namespace_page()),
                message: Some(message),
            })),
        };
        if let Err(err) = self.provider.send_message(to, envelope.encode_to_vec()) {
            tracing::warn!(?err, peer = %to, "failed to send p2p response");
        }
    }

    /// Reacts to mesh membership changes. Must be idempotent and safe to
    /// call from within other callbacks.
    pub fn on_device_change(&self, device: &P2pClientId, change: DeviceChange) {
        match change {
            DeviceChange::New => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if !inner.connected.insert(device.clone()) {
                        return;
                    }
                }
                self.send_request(
                    device,
                    proto::request::Message::WatchStart(proto::WatchStartRequest {}),
                );
            }
            DeviceChange::Deleted => {
                let resolutions = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.connected.remove(device);
                    inner.interested.remove(device);
                    abandon_peer(&mut inner, device)
                };
                if let Err(err) = self.storage.forget_peer(device.as_bytes()) {
                    tracing::warn!(?err, peer = %device, "failed to forget peer");
                }
                resolve_all(resolutions);
            }
        }
    }

    /// Handles a request routed to this page.
    pub fn handle_request(&self, from: &P2pClientId, message: proto::request::Message) {
        match message {
            proto::request::Message::WatchStart(_) => {
                // Persist the interest before acknowledging it with our
                // heads.
                if let Err(err) = self.storage.mark_synced_to_peer(from.as_bytes()) {
                    tracing::warn!(?err, peer = %from, "failed to persist peer interest");
                    return;
                }
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.connected.insert(from.clone());
                    inner.interested.insert(from.clone());
                }
                match self.storage.head_commits() {
                    Ok(heads) if heads.len() == 1 => {
                        let commits = heads
                            .iter()
                            .map(|commit| proto::CommitEntry {
                                id: commit.id().to_bytes(),
                                data: commit.encode(),
                            })
                            .collect();
                        self.send_response(
                            from,
                            proto::response::Message::CommitResponse(proto::CommitResponse {
                                commits,
                            }),
                        );
                    }
                    Ok(_) => {
                        // Divergent heads are not advertised; the peer will
                        // hear from us once the merger has run.
                    }
                    Err(err) => tracing::warn!(?err, "failed to read heads"),
                }
            }
            proto::request::Message::WatchStop(_) => {
                let resolutions = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.interested.remove(from);
                    abandon_peer(&mut inner, from)
                };
                if let Err(err) = self.storage.forget_peer(from.as_bytes()) {
                    tracing::warn!(?err, peer = %from, "failed to forget peer");
                }
                resolve_all(resolutions);
            }
            proto::request::Message::CommitRequest(request) => {
                let mut commits = vec![];
                for id_bytes in &request.commit_ids {
                    let id = CommitId::new(id_bytes.clone());
                    match self.storage.graph().get_commit(&id) {
                        Ok(commit) => commits.push(proto::CommitEntry {
                            id: commit.id().to_bytes(),
                            data: commit.encode(),
                        }),
                        Err(_) => {
                            // Unknown commits are simply omitted.
                        }
                    }
                }
                self.send_response(
                    from,
                    proto::response::Message::CommitResponse(proto::CommitResponse { commits }),
                );
            }
            proto::request::Message::ObjectRequest(request) => {
                let mut objects = vec![];
                for identifier in &request.object_ids {
                    objects.push(self.object_entry_for(identifier));
                }
                self.send_response(
                    from,
                    proto::response::Message::ObjectResponse(proto::ObjectResponse { objects }),
                );
            }
        }
    }

    fn object_entry_for(&self, identifier: &crate::protos::store::ObjectIdentifier) -> proto::ObjectEntry {
        let found = ObjectDigest::from_bytes(&identifier.digest)
            .ok()
            .and_then(|digest| {
                let bytes = self.storage.objects().read_piece_bytes(&digest).ok()?;
                let synced = self
                    .storage
                    .objects()
                    .is_piece_synced(&digest)
                    .unwrap_or(false);
                Some((bytes.as_ref().clone(), synced))
            });
        match found {
            Some((data, synced)) => proto::ObjectEntry {
                id: Some(identifier.clone()),
                status: proto::ObjectStatus::Ok as i32,
                data: Some(data),
                sync_status: if synced {
                    proto::ObjectSyncStatus::SyncedToCloud as i32
                } else {
                    proto::ObjectSyncStatus::Unsynced as i32
                },
            },
            None => proto::ObjectEntry {
                id: Some(identifier.clone()),
                status: proto::ObjectStatus::UnknownObject as i32,
                data: None,
                sync_status: proto::ObjectSyncStatus::Unsynced as i32,
            },
        }
    }

    /// Handles a response routed to this page.
    pub fn handle_response(
        &self,
        from: &P2pClientId,
        status: proto::ResponseStatus,
        message: Option<proto::response::Message>,
    ) {
        if status != proto::ResponseStatus::Ok {
            // The peer does not serve this page; it cannot answer anything
            // outstanding.
            let resolutions = {
                let mut inner = self.inner.lock().unwrap();
                abandon_peer(&mut inner, from)
            };
            resolve_all(resolutions);
            return;
        }
        match message {
            None => {}
            Some(proto::response::Message::CommitResponse(response)) => {
                self.handle_commit_response(from, response);
            }
            Some(proto::response::Message::ObjectResponse(response)) => {
                self.handle_object_response(from, response);
            }
        }
    }

    fn handle_commit_response(&self, from: &P2pClientId, response: proto::CommitResponse) {
        // Join the new commits with any stashed ones still waiting for
        // their ancestors, so the whole chain applies as soon as it is
        // complete.
        let batch: Vec<(CommitId, Vec<u8>)> = {
            let mut inner = self.inner.lock().unwrap();
            let mut batch = std::mem::take(&mut inner.pending_commits);
            for entry in response.commits {
                let id = CommitId::new(entry.id);
                if !batch.iter().any(|(existing, _)| existing == &id) {
                    batch.push((id, entry.data));
                }
            }
            batch
        };
        if batch.is_empty() {
            return;
        }
        match self
            .storage
            .add_commits_from_sync(batch.clone(), ChangeSource::P2p)
        {
            Ok(applied) => {
                let mut inner = self.inner.lock().unwrap();
                for commit in &applied {
                    inner.missing_pieces.push(commit.root().digest().clone());
                }
            }
            Err(CommitGraphError::IncompleteGraph { missing }) => {
                // Stash the batch and ask the sender for the ancestors we
                // lack; the reply re-enters here with the union.
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.pending_commits = batch;
                }
                self.send_request(
                    from,
                    proto::request::Message::CommitRequest(proto::CommitRequest {
                        commit_ids: missing.iter().map(|id| id.to_bytes()).collect(),
                    }),
                );
            }
            Err(err) => {
                tracing::warn!(?err, peer = %from, "failed to apply p2p commits");
            }
        }
    }

    fn handle_object_response(&self, from: &P2pClientId, response: proto::ObjectResponse) {
        for entry in response.objects {
            let Some(identifier) = &entry.id else {
                continue;
            };
            let Ok(digest) = ObjectDigest::from_bytes(&identifier.digest) else {
                continue;
            };
            let is_hit = entry.status == proto::ObjectStatus::Ok as i32;
            if is_hit {
                let Some(data) = entry.data else { continue };
                let synced =
                    entry.sync_status == proto::ObjectSyncStatus::SyncedToCloud as i32;
                let senders = {
                    let mut inner = self.inner.lock().unwrap();
                    match inner.pending_objects.remove(&digest) {
                        Some(pending) => pending.senders,
                        None => vec![],
                    }
                };
                match self.storage.objects().add_received_piece(&digest, &data, synced) {
                    Ok(_) => {
                        for sender in senders {
                            sender.send(Ok((data.clone(), synced))).ok();
                        }
                    }
                    Err(err) => {
                        tracing::warn!(?err, peer = %from, "peer sent a corrupt object");
                        for sender in senders {
                            sender.send(Err(err.clone())).ok();
                        }
                    }
                }
            } else {
                let resolution = {
                    let mut inner = self.inner.lock().unwrap();
                    let exhausted = match inner.pending_objects.get_mut(&digest) {
                        None => false,
                        Some(pending) => {
                            pending.remaining.remove(from);
                            pending.remaining.is_empty()
                        }
                    };
                    if exhausted {
                        inner
                            .pending_objects
                            .remove(&digest)
                            .map(|pending| pending.senders)
                    } else {
                        None
                    }
                };
                if let Some(senders) = resolution {
                    for sender in senders {
                        sender
                            .send(Err(Status::InternalNotFound(digest.hex())))
                            .ok();
                    }
                }
            }
        }
    }

    /// Fetches one piece from the mesh: the request is broadcast to all
    /// connected peers and the first successful reply wins. When every
    /// peer answers "unknown object" the result is
    /// [`Status::InternalNotFound`]. Returns the piece bytes and whether
    /// the cloud already has the piece.
    pub async fn get_object(&self, digest: &ObjectDigest) -> ObjectFetchResult {
        if let Ok(bytes) = self.storage.objects().read_piece_bytes(digest) {
            let synced = self.storage.objects().is_piece_synced(digest)?;
            return Ok((bytes.as_ref().clone(), synced));
        }

        let (sender, receiver) = oneshot::channel();
        let targets = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending_objects.contains_key(digest) {
                // Coalesce onto the in-flight broadcast.
                inner
                    .pending_objects
                    .get_mut(digest)
                    .unwrap()
                    .senders
                    .push(sender);
                None
            } else {
                let targets: Vec<P2pClientId> = inner.connected.iter().cloned().collect();
                if targets.is_empty() {
                    return Err(Status::InternalNotFound(digest.hex()));
                }
                inner.pending_objects.insert(
                    digest.clone(),
                    PendingFetch {
                        remaining: targets.iter().cloned().collect(),
                        senders: vec![sender],
                    },
                );
                Some(targets)
            }
        };
        if let Some(targets) = targets {
            let request = proto::request::Message::ObjectRequest(proto::ObjectRequest {
                object_ids: vec![crate::protos::store::ObjectIdentifier {
                    key_index: 0,
                    digest: digest.to_bytes(),
                }],
            });
            for target in &targets {
                self.send_request(target, request.clone());
            }
        }
        match receiver.await {
            Ok(result) => result,
            Err(oneshot::Canceled) => Err(Status::Interrupted),
        }
    }

    /// Fetches a piece and everything reachable from it (index children,
    /// tree children, eager values) from the mesh.
    pub fn fetch_object_graph(
        &self,
        digest: ObjectDigest,
    ) -> futures::future::BoxFuture<'_, StatusResult<()>> {
        async move {
            let already_present = self.storage.objects().has_piece(&digest)?;
            let bytes = if already_present {
                self.storage.objects().read_piece_bytes(&digest)?.as_ref().clone()
            } else {
                self.get_object(&digest).await?.0
            };
            match digest.piece_type() {
                crate::piece::PieceType::TreeNodeInternal
                | crate::piece::PieceType::TreeNodeLeaf => {
                    let (children, eager_values) = crate::btree::node_fetch_targets(&bytes)?;
                    for child in children {
                        self.fetch_object_graph(child).await?;
                    }
                    for value in eager_values {
                        self.fetch_object_graph(value).await?;
                    }
                }
                crate::piece::PieceType::BlobRoot => {
                    for child in crate::object_store::piece_references(
                        crate::piece::PieceType::BlobRoot,
                        &bytes,
                    )? {
                        self.fetch_object_graph(child).await?;
                    }
                }
                _ => {}
            }
            Ok(())
        }
        .boxed()
    }

    /// Pushes commits created locally to every interested peer, and
    /// returns the piece-fetch work queued by received commits.
    pub fn process_commit_events(&self) -> Vec<ObjectDigest> {
        let mut local_commits = vec![];
        {
            let mut receiver = self.commit_events.lock().unwrap();
            while let Some(Some(event)) = receiver.next().now_or_never() {
                // Only locally created commits are propagated; forwarding
                // synced commits would echo them around the mesh.
                if event.source == ChangeSource::Local {
                    local_commits.extend(event.commits);
                }
            }
        }
        if !local_commits.is_empty() {
            let interested: Vec<P2pClientId> = {
                let inner = self.inner.lock().unwrap();
                inner.interested.iter().cloned().collect()
            };
            let commits: Vec<proto::CommitEntry> = local_commits
                .iter()
                .map(|commit| proto::CommitEntry {
                    id: commit.id().to_bytes(),
                    data: commit.encode(),
                })
                .collect();
            for peer in interested {
                self.send_response(
                    &peer,
                    proto::response::Message::CommitResponse(proto::CommitResponse {
                        commits: commits.clone(),
                    }),
                );
            }
        }
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.missing_pieces)
    }

    /// Fetches all queued missing pieces from the mesh.
    pub async fn fetch_queued_pieces(&self) -> StatusResult<()> {
        let queued = self.process_commit_events();
        for digest in queued {
            self.fetch_object_graph(digest).await?;
        }
        Ok(())
    }

    /// Peers currently known to be interested in this page.
    pub fn interested_peer_count(&self) -> usize {
        self.inner.lock().unwrap().interested.len()
    }
}

fn abandon_peer(
    inner: &mut Inner,
    peer: &P2pClientId,
) -> Vec<Vec<oneshot::Sender<ObjectFetchResult>>> {
    let mut resolutions = vec![];
    let mut exhausted = vec![];
    for (digest, pending) in &mut inner.pending_objects {
        pending.remaining.remove(peer);
        if pending.remaining.is_empty() {
            exhausted.push(digest.clone());
        }
    }
    for digest in exhausted {
        if let Some(pending) = inner.pending_objects.remove(&digest) {
            resolutions.push(pending.senders);
        }
    }
    resolutions
}

fn resolve_all(resolutions: Vec<Vec<oneshot::Sender<ObjectFetchResult>>>) {
    for senders in resolutions {
        for sender in senders {
            sender
                .send(Err(Status::InternalNotFound(
                    "all peers are gone".to_string(),
                )))
                .ok();
        }
    }
}

impl std::fmt::Debug for PageCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("PageCommunicator")
            .field("connected", &inner.connected.len())
            .field("interested", &inner.interested.len())
            .field("pending_objects", &inner.pending_objects.len())
            .finish_non_exhaustive()
    }
}

/// Routes mesh messages to the pages of one repository namespace.
pub struct LedgerCommunicator {
    provider: Arc<dyn P2pProvider>,
    namespace_id: Vec<u8>,
    pages: Mutex<HashMap<Vec<u8>, Arc<PageCommunicator>>>,
}

impl LedgerCommunicator {
    /// Creates a multiplexer for `namespace_id`.
    pub fn new(provider: Arc<dyn P2pProvider>, namespace_id: Vec<u8>) -> Self {
        Self {
            provider,
            namespace_id,
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a page for p2p sync and returns its communicator.
    pub fn register_page(&self, storage: Arc<PageStorage>) -> Arc<PageCommunicator> {
        let communicator = Arc::new(PageCommunicator::new(
            storage.clone(),
            self.provider.clone(),
            self.namespace_id.clone(),
        ));
        self.pages
            .lock()
            .unwrap()
            .insert(storage.page_id().to_bytes(), communicator.clone());
        communicator
    }

    /// Stops serving a page.
    pub fn unregister_page(&self, page_id_bytes: &[u8]) {
        self.pages.lock().unwrap().remove(page_id_bytes);
    }

    /// Pushes queued local commits to interested peers and fetches the
    /// pieces referenced by commits received from them, on every page.
    pub async fn process_queued_work(&self) -> StatusResult<()> {
        let communicators: Vec<Arc<PageCommunicator>> =
            self.pages.lock().unwrap().values().cloned().collect();
        for communicator in communicators {
            communicator.fetch_queued_pieces().await?;
        }
        Ok(())
    }

    /// Fans a mesh membership change out to every page.
    pub fn on_device_change(&self, device: &P2pClientId, change: DeviceChange) {
        let communicators: Vec<Arc<PageCommunicator>> =
            self.pages.lock().unwrap().values().cloned().collect();
        for communicator in communicators {
            communicator.on_device_change(device, change);
        }
    }

    /// Routes one framed message from `from`. Malformed messages are
    /// dropped; requests for unknown namespaces or pages are answered with
    /// the corresponding error status and an empty body.
    pub fn on_message(&self, from: &P2pClientId, bytes: &[u8]) {
        let envelope = match proto::Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(?err, peer = %from, "dropping malformed p2p message");
                return;
            }
        };
        match envelope.message {
            None => {
                tracing::warn!(peer = %from, "dropping p2p message with no payload");
            }
            Some(proto::envelope::Message::Request(request)) => {
                let Some(namespace_page) = request.namespace_page else {
                    tracing::warn!(peer = %from, "dropping p2p request without page id");
                    return;
                };
                let Some(message) = request.message else {
                    tracing::warn!(peer = %from, "dropping p2p request without body");
                    return;
                };
                if namespace_page.namespace_id != self.namespace_id {
                    self.send_error_response(
                        from,
                        namespace_page,
                        proto::ResponseStatus::UnknownNamespace,
                    );
                    return;
                }
                let communicator = self
                    .pages
                    .lock()
                    .unwrap()
                    .get(&namespace_page.page_id)
                    .cloned();
                match communicator {
                    Some(communicator) => communicator.handle_request(from, message),
                    None => self.send_error_response(
                        from,
                        namespace_page,
                        proto::ResponseStatus::UnknownPage,
                    ),
                }
            }
            Some(proto::envelope::Message::Response(response)) => {
                let Some(namespace_page) = response.namespace_page else {
                    tracing::warn!(peer = %from, "dropping p2p response without page id");
                    return;
                };
                let Ok(status) = proto::ResponseStatus::try_from(response.status) else {
                    tracing::warn!(peer = %from, "dropping p2p response with unknown status");
                    return;
                };
                let communicator = self
                    .pages
                    .lock()
                    .unwrap()
                    .get(&namespace_page.page_id)
                    .cloned();
                if let Some(communicator) = communicator {
                    communicator.handle_response(from, status, response.message);
                }
            }
        }
    }

    fn send_error_response(
        &self,
        to: &P2pClientId,
        namespace_page: proto::NamespacePageId,
        status: proto::ResponseStatus,
    ) {
        let envelope = proto::Envelope {
            message: Some(proto::envelope::Message::Response(proto::Response {
                status: status as i32,
                namespace_page: Some(namespace_page),
                message: None,
            })),
        };
        if let Err(err) = self.provider.send_message(to, envelope.encode_to_vec()) {
            tracing::warn!(?err, peer = %to, "failed to send p2p error response");
        }
    }
}

impl std::fmt::Debug for LedgerCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("LedgerCommunicator")
            .field("pages", &self.pages.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}
