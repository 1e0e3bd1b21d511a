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

//! The per-page device clock.
//!
//! The clock maps every device that ever touched the page to what it has
//! observed: a live head, a tombstone (the device stopped using the page)
//! or a deletion marker. Cloud sync uses it to reason about which peers
//! have seen which commits.

use std::collections::BTreeMap;

use prost::Message as _;

use crate::commit::Commit;
use crate::commit::CommitId;
use crate::db::WriteBatch;
use crate::object_id::ObjectId as _;
use crate::page_db::PageDb;
use crate::protos;
use crate::status::Status;
use crate::status::StatusResult;

/// Identity of one device within a user's fleet.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId {
    /// The device's cloud fingerprint.
    pub fingerprint: Vec<u8>,
    /// Incremented when the device re-registers after an erase.
    pub epoch: u64,
}

/// What one device is known to have observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceClockEntry {
    /// The device's latest known head.
    Live {
        /// Head commit id.
        head: CommitId,
        /// The head's generation.
        generation: u64,
    },
    /// The device stopped using the page.
    Tombstone,
    /// The device's data for this page was deleted.
    Deletion,
}

/// The full per-page clock.
pub type Clock = BTreeMap<DeviceId, DeviceClockEntry>;

/// Reads the locally stored clock. An absent row is an empty clock.
pub fn read_clock(db: &PageDb) -> StatusResult<Clock> {
    match db.clock_bytes()? {
        None => Ok(Clock::new()),
        Some(bytes) => decode_clock_proto(&bytes),
    }
}

/// Persists the clock.
pub fn write_clock(db: &PageDb, clock: &Clock) -> StatusResult<()> {
    let mut batch = WriteBatch::new();
    db.set_clock_bytes(&mut batch, &encode_clock_proto(clock));
    db.write(batch)
}

/// Updates this device's entry to the given head and persists the clock.
pub fn update_own_entry(db: &PageDb, device: &DeviceId, head: &Commit) -> StatusResult<Clock> {
    let mut clock = read_clock(db)?;
    clock.insert(
        device.clone(),
        DeviceClockEntry::Live {
            head: head.id().clone(),
            generation: head.generation(),
        },
    );
    write_clock(db, &clock)?;
    Ok(clock)
}

pub(crate) fn encode_clock_proto(clock: &Clock) -> Vec<u8> {
    let proto = protos::cloud::Clock {
        devices: clock
            .iter()
            .map(|(device, entry)| protos::cloud::DeviceClock {
                fingerprint: device.fingerprint.clone(),
                epoch: device.epoch,
                entry: Some(match entry {
                    DeviceClockEntry::Live { head, generation } => {
                        protos::cloud::device_clock::Entry::Live(protos::cloud::ClockEntry {
                            commit_id: head.to_bytes(),
                            generation: *generation,
                        })
                    }
                    DeviceClockEntry::Tombstone => protos::cloud::device_clock::Entry::Tombstone(
                        protos::cloud::TombstoneEntry {},
                    ),
                    DeviceClockEntry::Deletion => protos::cloud::device_clock::Entry::Deletion(
                        protos::cloud::DeletionEntry {},
                    ),
                }),
            })
            .collect(),
    };
    proto.encode_to_vec()
}

pub(crate) fn decode_clock_proto(bytes: &[u8]) -> StatusResult<Clock> {
    let proto = protos::cloud::Clock::decode(bytes)
        .map_err(|err| Status::DataIntegrity(format!("malformed clock: {err}")))?;
    let mut clock = Clock::new();
    for device in proto.devices {
        if device.fingerprint.is_empty() {
            return Err(Status::DataIntegrity(
                "clock device entry has no fingerprint".to_string(),
            ));
        }
        let entry = match device.entry {
            None => {
                // Either a missing field or an unknown union tag from a
                // newer peer; both are integrity errors.
                return Err(Status::DataIntegrity(
                    "clock device entry has no or unknown entry tag".to_string(),
                ));
            }
            Some(protos::cloud::device_clock::Entry::Live(live)) => DeviceClockEntry::Live {
                head: CommitId::new(live.commit_id),
                generation: live.generation,
            },
            Some(protos::cloud::device_clock::Entry::Tombstone(_)) => DeviceClockEntry::Tombstone,
            Some(protos::cloud::device_clock::Entry::Deletion(_)) => DeviceClockEntry::Deletion,
        };
        clock.insert(
            DeviceId {
                fingerprint: device.fingerprint,
                epoch: device.epoch,
            },
            entry,
        );
    }
    Ok(clock)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory_db::MemoryDb;
    use crate::piece::ObjectDigest;
    use crate::piece::PieceType;

    fn commit_id(n: u8) -> CommitId {
        CommitId::new(ObjectDigest::compute(PieceType::Commit, &[n]).to_bytes())
    }

    #[test]
    fn test_clock_round_trip() {
        let clock: Clock = maplit::btreemap! {
            DeviceId {
                fingerprint: b"device-a".to_vec(),
                epoch: 0,
            } => DeviceClockEntry::Live {
                head: commit_id(1),
                generation: 7,
            },
            DeviceId {
                fingerprint: b"device-b".to_vec(),
                epoch: 2,
            } => DeviceClockEntry::Tombstone,
            DeviceId {
                fingerprint: b"device-c".to_vec(),
                epoch: 1,
            } => DeviceClockEntry::Deletion,
        };

        let decoded = decode_clock_proto(&encode_clock_proto(&clock)).unwrap();
        assert_eq!(decoded, clock);
    }

    #[test]
    fn test_clock_persistence() {
        let db = PageDb::new(Arc::new(MemoryDb::new()));
        assert_eq!(read_clock(&db).unwrap(), Clock::new());

        let device = DeviceId {
            fingerprint: b"self".to_vec(),
            epoch: 0,
        };
        let root = crate::commit::Commit::build(
            crate::piece::ObjectIdentifier::untracked(
                0,
                ObjectDigest::compute(PieceType::TreeNodeLeaf, b"root"),
            ),
            vec![],
            0,
            0,
        )
        .unwrap();
        let clock = update_own_entry(&db, &device, &root).unwrap();
        assert_eq!(read_clock(&db).unwrap(), clock);
        assert_eq!(clock.len(), 1);
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        use prost::Message as _;
        // Missing fingerprint.
        let proto = protos::cloud::Clock {
            devices: vec![protos::cloud::DeviceClock {
                fingerprint: vec![],
                epoch: 0,
                entry: Some(protos::cloud::device_clock::Entry::Tombstone(
                    protos::cloud::TombstoneEntry {},
                )),
            }],
        };
        assert_matches::assert_matches!(
            decode_clock_proto(&proto.encode_to_vec()),
            Err(Status::DataIntegrity(_))
        );

        // Missing entry tag.
        let proto = protos::cloud::Clock {
            devices: vec![protos::cloud::DeviceClock {
                fingerprint: b"device".to_vec(),
                epoch: 0,
                entry: None,
            }],
        };
        assert_matches::assert_matches!(
            decode_clock_proto(&proto.encode_to_vec()),
            Err(Status::DataIntegrity(_))
        );
    }
}
