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

use async_trait::async_trait;
use ledger_lib::merger::ConflictResolutionWaitResult;
use ledger_lib::merger::ConflictResolver;
use ledger_lib::merger::ConflictResolverFactory;
use ledger_lib::merger::DiffEntry;
use ledger_lib::merger::MergePolicy;
use ledger_lib::merger::MergedValue;
use ledger_lib::merger::MergedValueSource;
use ledger_lib::btree::KeyPriority;
use ledger_lib::snapshot::Snapshot;
use ledger_lib::status::StatusResult;
use pollster::FutureExt as _;
use testutils::FakeCloudProvider;
use testutils::open_repository;
use testutils::page_id;
use testutils::sync_until_quiescent;

#[test]
fn test_concurrent_merge_last_one_wins() {
    let temp_dir = testutils::new_temp_dir();
    let cloud = FakeCloudProvider::new();
    let id = page_id("low-merge");

    let mut device_a = open_repository(&temp_dir, "device-a");
    let mut device_b = open_repository(&temp_dir, "device-b");
    device_a.attach_cloud(cloud.clone()).block_on().unwrap();
    device_b.attach_cloud(cloud.clone()).block_on().unwrap();

    // Concurrent transactions on both devices before any sync.
    let c1 = {
        let page = device_a.get_page(&id).unwrap();
        page.start_transaction().unwrap();
        page.put(b"name".to_vec(), b"Alice").block_on().unwrap();
        page.put(b"city".to_vec(), b"Paris").block_on().unwrap();
        page.commit().block_on().unwrap();
        page.storage().latest_head().unwrap()
    };
    let c2 = {
        let page = device_b.get_page(&id).unwrap();
        page.start_transaction().unwrap();
        page.put(b"name".to_vec(), b"Bob").block_on().unwrap();
        page.put(b"phone".to_vec(), b"0123456789").block_on().unwrap();
        page.commit().block_on().unwrap();
        page.storage().latest_head().unwrap()
    };

    device_a.start_sync().block_on().unwrap();
    device_b.start_sync().block_on().unwrap();
    sync_until_quiescent(&mut [&mut device_a, &mut device_b]).unwrap();

    // Exactly one head on both devices, and it is the same head.
    let heads_a = device_a.get_page(&id).unwrap().storage().head_ids().unwrap();
    let heads_b = device_b.get_page(&id).unwrap().storage().head_ids().unwrap();
    assert_eq!(heads_a.len(), 1);
    assert_eq!(heads_a, heads_b);

    // One-side changes survive; the conflicting key goes to the head with
    // the greater (generation, id).
    let expected_name: &[u8] = if (c1.generation(), c1.id()) > (c2.generation(), c2.id()) {
        b"Alice"
    } else {
        b"Bob"
    };
    for device in [&mut device_a, &mut device_b] {
        let page = device.get_page(&id).unwrap();
        let snapshot = page.get_snapshot(vec![], None).block_on().unwrap();
        assert_eq!(snapshot.get(b"city").unwrap(), b"Paris");
        assert_eq!(snapshot.get(b"phone").unwrap(), b"0123456789");
        assert_eq!(snapshot.get(b"name").unwrap(), expected_name);
    }
}

// Merges concurrent numeric edits as (4 * left + right) / 3, a
// deliberately non-associative rule.
struct WeightedAverageResolver;

#[async_trait]
impl ConflictResolver for WeightedAverageResolver {
    async fn resolve(
        &mut self,
        left: &Snapshot,
        right: &Snapshot,
        _ancestor: Option<&Snapshot>,
        routed: Vec<DiffEntry>,
    ) -> StatusResult<Vec<MergedValue>> {
        let mut merged = vec![];
        for entry in routed {
            let left_value = left.get(&entry.key).ok();
            let right_value = right.get(&entry.key).ok();
            let source = match (left_value, right_value) {
                (Some(l), Some(r)) => {
                    let l: i64 = String::from_utf8(l).unwrap().parse().unwrap();
                    let r: i64 = String::from_utf8(r).unwrap().parse().unwrap();
                    MergedValueSource::New {
                        value: ((4 * l + r) / 3).to_string().into_bytes(),
                        priority: KeyPriority::Eager,
                    }
                }
                (Some(_), None) => MergedValueSource::Left,
                (None, _) => MergedValueSource::Right,
            };
            merged.push(MergedValue {
                key: entry.key,
                source,
            });
        }
        Ok(merged)
    }
}

struct WeightedAverageFactory;

impl ConflictResolverFactory for WeightedAverageFactory {
    fn make_resolver(&self) -> Box<dyn ConflictResolver> {
        Box::new(WeightedAverageResolver)
    }
}

#[test]
fn test_custom_resolver_three_devices_converge() {
    let temp_dir = testutils::new_temp_dir();
    let cloud = FakeCloudProvider::new();
    let id = page_id("custom-merge");
    let policy = MergePolicy::Custom(Arc::new(WeightedAverageFactory));

    let mut devices = vec![
        open_repository(&temp_dir, "device-a"),
        open_repository(&temp_dir, "device-b"),
        open_repository(&temp_dir, "device-c"),
    ];
    for (index, device) in devices.iter_mut().enumerate() {
        device.attach_cloud(cloud.clone()).block_on().unwrap();
        let page = device.get_page(&id).unwrap();
        page.set_merge_policy(policy.clone());
        let value = ((index + 1) * 10).to_string();
        page.put(b"v".to_vec(), value.as_bytes()).block_on().unwrap();
    }
    for device in &mut devices {
        device.start_sync().block_on().unwrap();
    }
    {
        let mut refs: Vec<&mut _> = devices.iter_mut().collect();
        sync_until_quiescent(&mut refs).unwrap();
    }

    // All devices display the same numeric value under a common single
    // head, and no conflict is outstanding.
    let mut heads = vec![];
    let mut values = vec![];
    for device in &mut devices {
        let page = device.get_page(&id).unwrap();
        assert_eq!(
            page.wait_for_conflict_resolution().block_on().unwrap(),
            ConflictResolutionWaitResult::NoConflicts
        );
        heads.push(page.storage().head_ids().unwrap());
        let snapshot = page.get_snapshot(vec![], None).block_on().unwrap();
        values.push(snapshot.get(b"v").unwrap());
    }
    assert_eq!(heads[0].len(), 1);
    assert_eq!(heads[0], heads[1]);
    assert_eq!(heads[1], heads[2]);
    assert_eq!(values[0], values[1]);
    assert_eq!(values[1], values[2]);
    // The result is numeric.
    let displayed: i64 = String::from_utf8(values[0].clone())
        .unwrap()
        .parse()
        .unwrap();
    assert!(displayed > 0);
}

#[test]
fn test_merge_commit_has_two_parents_and_max_generation() {
    let temp_dir = testutils::new_temp_dir();
    let cloud = FakeCloudProvider::new();
    let id = page_id("merge-shape");

    let mut device_a = open_repository(&temp_dir, "device-a");
    let mut device_b = open_repository(&temp_dir, "device-b");
    device_a.attach_cloud(cloud.clone()).block_on().unwrap();
    device_b.attach_cloud(cloud.clone()).block_on().unwrap();

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

    device_a.start_sync().block_on().unwrap();
    device_b.start_sync().block_on().unwrap();
    sync_until_quiescent(&mut [&mut device_a, &mut device_b]).unwrap();

    let page = device_a.get_page(&id).unwrap();
    let head = page.storage().latest_head().unwrap();
    assert!(head.is_merge());
    assert_eq!(head.parents().len(), 2);
    assert_eq!(head.generation(), 2);
}
