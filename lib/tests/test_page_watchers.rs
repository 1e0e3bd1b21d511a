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

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use ledger_lib::watcher::PageChange;
use ledger_lib::watcher::PageWatcher;
use ledger_lib::watcher::ResultState;
use pollster::FutureExt as _;
use testutils::FakeCloudProvider;
use testutils::open_repository;
use testutils::page_id;
use testutils::sync_until_quiescent;

struct RecordingWatcher {
    deliveries: Arc<Mutex<Vec<(PageChange, ResultState)>>>,
}

#[async_trait]
impl PageWatcher for RecordingWatcher {
    async fn on_change(&mut self, change: PageChange, result_state: ResultState) {
        self.deliveries.lock().unwrap().push((change, result_state));
    }
}

#[test]
fn test_watcher_sees_local_commit() {
    let temp_dir = testutils::new_temp_dir();
    let mut repository = open_repository(&temp_dir, "device-a");
    let id = page_id("watcher-local");

    let deliveries = Arc::new(Mutex::new(vec![]));
    let page = repository.get_page(&id).unwrap();
    page.get_snapshot(
        vec![],
        Some(Box::new(RecordingWatcher {
            deliveries: deliveries.clone(),
        })),
    )
    .block_on()
    .unwrap();

    page.put(b"k".to_vec(), b"v").block_on().unwrap();

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    let (change, state) = &deliveries[0];
    assert_eq!(*state, ResultState::Completed);
    assert_eq!(change.changed_entries.len(), 1);
    assert_eq!(change.changed_entries[0].key, b"k".to_vec());
    assert_eq!(change.changed_entries[0].value, Some(b"v".to_vec()));
}

#[test]
fn test_transaction_delivers_one_aggregated_change() {
    let temp_dir = testutils::new_temp_dir();
    let mut repository = open_repository(&temp_dir, "device-a");
    let id = page_id("watcher-txn");

    let deliveries = Arc::new(Mutex::new(vec![]));
    let page = repository.get_page(&id).unwrap();
    page.get_snapshot(
        vec![],
        Some(Box::new(RecordingWatcher {
            deliveries: deliveries.clone(),
        })),
    )
    .block_on()
    .unwrap();

    page.start_transaction().unwrap();
    page.put(b"k".to_vec(), b"v1").block_on().unwrap();
    page.put(b"k".to_vec(), b"v2").block_on().unwrap();
    page.put(b"other".to_vec(), b"x").block_on().unwrap();
    page.commit().block_on().unwrap();

    // One delivery carrying the final value per touched key.
    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    let (change, _) = &deliveries[0];
    assert_eq!(change.changed_entries.len(), 2);
    assert_eq!(change.changed_entries[0].key, b"k".to_vec());
    assert_eq!(change.changed_entries[0].value, Some(b"v2".to_vec()));
    assert_eq!(change.changed_entries[1].key, b"other".to_vec());
}

#[test]
fn test_remote_burst_is_aggregated_per_delivery_cycle() {
    let temp_dir = testutils::new_temp_dir();
    let cloud = FakeCloudProvider::new();
    let id = page_id("watcher-remote");

    // Device A produces a burst of commits.
    let mut device_a = open_repository(&temp_dir, "device-a");
    device_a.attach_cloud(cloud.clone()).block_on().unwrap();
    {
        let page = device_a.get_page(&id).unwrap();
        for value in [b"v1".as_slice(), b"v2", b"v3"] {
            page.put(b"k".to_vec(), value).block_on().unwrap();
        }
    }
    device_a.start_sync().block_on().unwrap();
    sync_until_quiescent(&mut [&mut device_a]).unwrap();

    // Device B watches; the burst arrives in one sync batch and produces
    // one delivery with the final value.
    let mut device_b = open_repository(&temp_dir, "device-b");
    device_b.attach_cloud(cloud.clone()).block_on().unwrap();
    let deliveries = Arc::new(Mutex::new(vec![]));
    device_b
        .get_page(&id)
        .unwrap()
        .get_snapshot(
            vec![],
            Some(Box::new(RecordingWatcher {
                deliveries: deliveries.clone(),
            })),
        )
        .block_on()
        .unwrap();
    device_b.start_sync().block_on().unwrap();
    sync_until_quiescent(&mut [&mut device_b]).unwrap();

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    let (change, state) = &deliveries[0];
    assert_eq!(*state, ResultState::Completed);
    assert_eq!(change.changed_entries.len(), 1);
    assert_eq!(change.changed_entries[0].key, b"k".to_vec());
    assert_eq!(change.changed_entries[0].value, Some(b"v3".to_vec()));
}

#[test]
fn test_rollback_produces_no_watcher_event() {
    let temp_dir = testutils::new_temp_dir();
    let mut repository = open_repository(&temp_dir, "device-a");
    let id = page_id("watcher-rollback");

    let deliveries = Arc::new(Mutex::new(vec![]));
    let page = repository.get_page(&id).unwrap();
    page.get_snapshot(
        vec![],
        Some(Box::new(RecordingWatcher {
            deliveries: deliveries.clone(),
        })),
    )
    .block_on()
    .unwrap();

    page.start_transaction().unwrap();
    page.put(b"k".to_vec(), b"v").block_on().unwrap();
    page.rollback().unwrap();
    // Settle explicitly; nothing must be delivered.
    page.settle().block_on().unwrap();

    assert!(deliveries.lock().unwrap().is_empty());
}

#[test]
fn test_prefix_watcher_ignores_other_keys() {
    let temp_dir = testutils::new_temp_dir();
    let mut repository = open_repository(&temp_dir, "device-a");
    let id = page_id("watcher-prefix");

    let deliveries = Arc::new(Mutex::new(vec![]));
    let page = repository.get_page(&id).unwrap();
    page.get_snapshot(
        b"app/".to_vec(),
        Some(Box::new(RecordingWatcher {
            deliveries: deliveries.clone(),
        })),
    )
    .block_on()
    .unwrap();

    page.put(b"sys/ignored".to_vec(), b"x").block_on().unwrap();
    assert!(deliveries.lock().unwrap().is_empty());

    page.put(b"app/seen".to_vec(), b"y").block_on().unwrap();
    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0.changed_entries[0].key, b"app/seen".to_vec());
}

#[test]
fn test_watcher_sees_deletions() {
    let temp_dir = testutils::new_temp_dir();
    let mut repository = open_repository(&temp_dir, "device-a");
    let id = page_id("watcher-delete");

    let page = repository.get_page(&id).unwrap();
    page.put(b"doomed".to_vec(), b"v").block_on().unwrap();

    let deliveries = Arc::new(Mutex::new(vec![]));
    page.get_snapshot(
        vec![],
        Some(Box::new(RecordingWatcher {
            deliveries: deliveries.clone(),
        })),
    )
    .block_on()
    .unwrap();

    page.delete(b"doomed".to_vec()).block_on().unwrap();

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0.deleted_keys, vec![b"doomed".to_vec()]);
    assert!(deliveries[0].0.changed_entries.is_empty());
}
