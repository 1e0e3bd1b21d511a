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

//! Encoding of the device clock for cloud transport.
//!
//! Cloud-side commit references are "remote" ids; decoding translates them
//! back to local commit ids through the page's remote-id mapping.

use crate::clock;
use crate::clock::Clock;
use crate::clock::DeviceClockEntry;
use crate::object_id::ObjectId as _;
use crate::page_storage::PageStorage;
use crate::status::Status;
use crate::status::StatusResult;

/// Encodes the clock for the cloud, translating local commit ids into
/// their remote encoding.
pub fn encode_clock(clock: &Clock) -> Vec<u8> {
    // The remote encoding of a commit id is the id itself: commit bodies
    // are opaque to the cloud and carry no key material worth hiding.
    clock::encode_clock_proto(clock)
}

/// Decodes a clock pack received from the cloud.
///
/// Live entries referencing commits this device cannot resolve are kept
/// with the translated id when known; unresolvable remote ids are a data
/// integrity problem on the sender's side and abort the decode.
pub fn decode_clock(storage: &PageStorage, pack: &[u8]) -> StatusResult<Clock> {
    let raw = clock::decode_clock_proto(pack)?;
    let mut clock = Clock::new();
    for (device, entry) in raw {
        let entry = match entry {
            DeviceClockEntry::Live { head, generation } => {
                let local = storage
                    .commit_id_from_remote_id(head.as_bytes())
                    .map_err(|_| {
                        Status::DataIntegrity(format!(
                            "clock references unknown remote commit {head}"
                        ))
                    })?;
                DeviceClockEntry::Live {
                    head: local,
                    generation,
                }
            }
            other => other,
        };
        clock.insert(device, entry);
    }
    Ok(clock)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::btree::KeyPriority;
    use crate::clock::DeviceId;
    use crate::environment::Environment;
    use crate::memory_db::MemoryDb;
    use crate::page_storage::PageId;

    fn new_page() -> PageStorage {
        PageStorage::new(
            Environment::builder().clock(|| 1).build(),
            PageId::from_bytes(b"clock-pack-page"),
            Arc::new(MemoryDb::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_pack_round_trip() {
        let page = new_page();
        let mut journal = page.new_journal().unwrap();
        journal.put(b"k".to_vec(), b"v", KeyPriority::Eager).unwrap();
        let commit = page.commit_journal(journal).unwrap().unwrap();

        let mut clock = Clock::new();
        clock.insert(
            DeviceId {
                fingerprint: b"self".to_vec(),
                epoch: 0,
            },
            DeviceClockEntry::Live {
                head: commit.id().clone(),
                generation: commit.generation(),
            },
        );
        clock.insert(
            DeviceId {
                fingerprint: b"gone".to_vec(),
                epoch: 3,
            },
            DeviceClockEntry::Tombstone,
        );

        let decoded = decode_clock(&page, &encode_clock(&clock)).unwrap();
        assert_eq!(decoded, clock);
    }

    #[test]
    fn test_unknown_remote_commit_is_integrity_error() {
        let page = new_page();
        let mut clock = Clock::new();
        clock.insert(
            DeviceId {
                fingerprint: b"other".to_vec(),
                epoch: 0,
            },
            DeviceClockEntry::Live {
                head: crate::commit::CommitId::new(b"never-seen".to_vec()),
                generation: 5,
            },
        );
        assert_matches::assert_matches!(
            decode_clock(&page, &encode_clock(&clock)),
            Err(Status::DataIntegrity(_))
        );
    }
}
