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

use assert_matches::assert_matches;
use ledger_lib::p2p_provider::P2pClientId;
use ledger_lib::p2p_provider::P2pProvider as _;
use ledger_lib::repository::LedgerRepository;
use ledger_lib::status::Status;
use pollster::FutureExt as _;
use testutils::FakeMesh;
use testutils::open_repository;
use testutils::page_id;
use testutils::sync_until_quiescent;

fn join_mesh(
    mesh: &std::sync::Arc<FakeMesh>,
    repository: &mut LedgerRepository,
    name: &[u8],
) -> P2pClientId {
    let provider = mesh.provider(name);
    let client_id = provider.local_id().clone();
    let communicator = repository.attach_p2p(provider);
    mesh.register(client_id.clone(), communicator);
    client_id
}

#[test]
fn test_commit_propagation_between_peers() {
    let temp_dir = testutils::new_temp_dir();
    let mesh = FakeMesh::new();
    let id = page_id("p2p-propagation");

    let mut device_a = open_repository(&temp_dir, "device-a");
    let mut device_b = open_repository(&temp_dir, "device-b");
    join_mesh(&mesh, &mut device_a, b"device-a");
    join_mesh(&mesh, &mut device_b, b"device-b");

    device_a.get_page(&id).unwrap();
    device_b.get_page(&id).unwrap();
    mesh.announce_all();

    device_a
        .get_page(&id)
        .unwrap()
        .put(b"shared".to_vec(), b"value")
        .block_on()
        .unwrap();
    sync_until_quiescent(&mut [&mut device_a, &mut device_b]).unwrap();

    let page = device_b.get_page(&id).unwrap();
    let snapshot = page.get_snapshot(vec![], None).block_on().unwrap();
    assert_eq!(snapshot.get(b"shared").unwrap(), b"value");
}

#[test]
fn test_late_joiner_requests_missing_ancestors() {
    let temp_dir = testutils::new_temp_dir();
    let mesh = FakeMesh::new();
    let id = page_id("p2p-backlog");

    let mut device_a = open_repository(&temp_dir, "device-a");
    join_mesh(&mesh, &mut device_a, b"device-a");
    {
        let page = device_a.get_page(&id).unwrap();
        // Several commits accumulate before any peer is around.
        for i in 0..5 {
            page.put(b"counter".to_vec(), i.to_string().as_bytes())
                .block_on()
                .unwrap();
        }
    }

    let mut device_b = open_repository(&temp_dir, "device-b");
    join_mesh(&mesh, &mut device_b, b"device-b");
    device_b.get_page(&id).unwrap();
    // The watch handshake advertises only the single head; the joiner
    // walks back through CommitRequests for the missing ancestors.
    mesh.announce_all();
    sync_until_quiescent(&mut [&mut device_a, &mut device_b]).unwrap();

    let page = device_b.get_page(&id).unwrap();
    assert_eq!(page.storage().head_ids().unwrap().len(), 1);
    let snapshot = page.get_snapshot(vec![], None).block_on().unwrap();
    assert_eq!(snapshot.get(b"counter").unwrap(), b"4");
}

#[test]
fn test_concurrent_edits_converge_over_p2p() {
    let temp_dir = testutils::new_temp_dir();
    let mesh = FakeMesh::new();
    let id = page_id("p2p-merge");

    let mut device_a = open_repository(&temp_dir, "device-a");
    let mut device_b = open_repository(&temp_dir, "device-b");
    join_mesh(&mesh, &mut device_a, b"device-a");
    join_mesh(&mesh, &mut device_b, b"device-b");
    device_a.get_page(&id).unwrap();
    device_b.get_page(&id).unwrap();
    mesh.announce_all();

    device_a
        .get_page(&id)
        .unwrap()
        .put(b"a".to_vec(), b"1")
        .block_on()
        .unwrap();
    device_b
        .get_page(&id)
        .unwrap()
        .put(b"b".to_vec(), b"2")
        .block_on()
        .unwrap();
    sync_until_quiescent(&mut [&mut device_a, &mut device_b]).unwrap();

    let heads_a = device_a.get_page(&id).unwrap().storage().head_ids().unwrap();
    let heads_b = device_b.get_page(&id).unwrap().storage().head_ids().unwrap();
    assert_eq!(heads_a.len(), 1);
    assert_eq!(heads_a, heads_b);
    for device in [&mut device_a, &mut device_b] {
        let snapshot = device
            .get_page(&id)
            .unwrap()
            .get_snapshot(vec![], None)
            .block_on()
            .unwrap();
        assert_eq!(snapshot.get(b"a").unwrap(), b"1");
        assert_eq!(snapshot.get(b"b").unwrap(), b"2");
    }
}

#[test]
fn test_get_object_with_peer_removal_mid_mesh() {
    let temp_dir = testutils::new_temp_dir();
    let mesh = FakeMesh::new();
    let id = page_id("p2p-objects");

    let mut device_a = open_repository(&temp_dir, "device-a");
    let mut device_b = open_repository(&temp_dir, "device-b");
    let mut device_c = open_repository(&temp_dir, "device-c");
    join_mesh(&mesh, &mut device_a, b"device-a");
    let b_id = join_mesh(&mesh, &mut device_b, b"device-b");
    join_mesh(&mesh, &mut device_c, b"device-c");
    device_a.get_page(&id).unwrap();
    device_b.get_page(&id).unwrap();
    device_c.get_page(&id).unwrap();
    mesh.announce_all();

    // Store a LAZY value only on C, then ask for it from A.
    let reference = device_c
        .get_page(&id)
        .unwrap()
        .create_reference_from_buffer(b"lazy-payload")
        .unwrap();
    device_c
        .get_page(&id)
        .unwrap()
        .put_reference(b"lazy".to_vec(), reference, ledger_lib::btree::KeyPriority::Lazy)
        .block_on()
        .unwrap();
    sync_until_quiescent(&mut [&mut device_a, &mut device_b, &mut device_c]).unwrap();

    // Remove B from the mesh; the mesh stays usable and A can still fetch
    // the value from C.
    mesh.disconnect(&b_id);
    let value = device_a
        .get_page(&id)
        .unwrap()
        .fetch(b"lazy")
        .block_on()
        .unwrap();
    assert_eq!(value, b"lazy-payload");

    // Removing the same device again is a no-op, and unknown keys still
    // answer normally.
    mesh.disconnect(&b_id);
    let result = device_a.get_page(&id).unwrap().fetch(b"never-put").block_on();
    assert_matches!(result, Err(Status::KeyNotFound));
}

#[test]
fn test_lazy_values_are_not_shipped_eagerly() {
    let temp_dir = testutils::new_temp_dir();
    let mesh = FakeMesh::new();
    let id = page_id("p2p-lazy");

    let mut device_a = open_repository(&temp_dir, "device-a");
    let mut device_b = open_repository(&temp_dir, "device-b");
    join_mesh(&mesh, &mut device_a, b"device-a");
    join_mesh(&mesh, &mut device_b, b"device-b");
    device_a.get_page(&id).unwrap();
    device_b.get_page(&id).unwrap();
    mesh.announce_all();

    let reference = device_a
        .get_page(&id)
        .unwrap()
        .create_reference_from_buffer(b"heavy")
        .unwrap();
    let digest = reference.digest().clone();
    device_a
        .get_page(&id)
        .unwrap()
        .put_reference(b"lazy".to_vec(), reference, ledger_lib::btree::KeyPriority::Lazy)
        .block_on()
        .unwrap();
    sync_until_quiescent(&mut [&mut device_a, &mut device_b]).unwrap();

    // The commit arrived but the LAZY value did not.
    let page_b = device_b.get_page(&id).unwrap();
    assert!(!page_b.storage().objects().has_piece(&digest).unwrap());
    let snapshot = page_b.get_snapshot(vec![], None).block_on().unwrap();
    assert_matches!(snapshot.get(b"lazy"), Err(Status::NeedsFetch));

    // Until it is fetched on demand.
    let value = page_b.fetch(b"lazy").block_on().unwrap();
    assert_eq!(value, b"heavy");
    assert!(page_b.storage().objects().has_piece(&digest).unwrap());
}
