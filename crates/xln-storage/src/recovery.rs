//! Snapshot-plus-WAL crash recovery.
//!
//! The WAL is the linearized record of consensus-relevant events: replica
//! registrations and committed entity frames. Recovery loads the newest
//! valid snapshot, verifies its root, then replays the WAL suffix; frames at
//! or below a replica's snapshot height are skipped, so replaying the full
//! log over any snapshot converges to the same state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use xln_core::{EntityFrame, Signer, XlnError};
use xln_crypto::{rlp_decode, rlp_encode, CodecError, RlpValue};
use xln_entity::EntityReplica;

use crate::snapshot::{replica_key, state_root, Snapshot, SnapshotStore};
use crate::wal::{self, Wal};

/// File name of the log inside a data directory.
pub const WAL_FILE: &str = "wal.log";

/// One consensus-relevant event in the WAL.
#[derive(Clone, Debug, PartialEq)]
pub enum WalRecord {
    /// A replica joined (carries its genesis configuration).
    InitReplica { replica: Box<EntityReplica> },
    /// An entity frame committed on a replica.
    CommitFrame {
        replica_key: String,
        frame: EntityFrame,
    },
}

impl WalRecord {
    pub fn to_rlp(&self) -> RlpValue {
        match self {
            WalRecord::InitReplica { replica } => {
                RlpValue::list(vec![RlpValue::uint(0), replica.to_rlp()])
            }
            WalRecord::CommitFrame { replica_key, frame } => RlpValue::list(vec![
                RlpValue::uint(1),
                RlpValue::str(replica_key),
                frame.to_rlp(),
            ]),
        }
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list()?;
        let tag = items
            .first()
            .ok_or(CodecError::WrongItemCount {
                expected: 1,
                found: 0,
            })?
            .as_uint()?;
        match tag {
            0 => {
                let items = value.as_list_of(2)?;
                Ok(WalRecord::InitReplica {
                    replica: Box::new(EntityReplica::from_rlp(&items[1])?),
                })
            }
            1 => {
                let items = value.as_list_of(3)?;
                Ok(WalRecord::CommitFrame {
                    replica_key: items[1].as_str()?.to_string(),
                    frame: EntityFrame::from_rlp(&items[2])?,
                })
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp_encode(&self.to_rlp())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, XlnError> {
        Ok(Self::from_rlp(&rlp_decode(bytes)?)?)
    }
}

/// The machine state recovery hands back to the host.
#[derive(Debug)]
pub struct RecoveredState {
    pub replicas: BTreeMap<String, EntityReplica>,
    /// Height of the snapshot recovery started from (0 = none).
    pub snapshot_height: u64,
    /// WAL entries replayed past the snapshot.
    pub replayed: u64,
    pub state_root: [u8; 32],
}

pub fn wal_path(dir: &Path) -> PathBuf {
    dir.join(WAL_FILE)
}

/// Recover from `dir`: newest valid snapshot plus the WAL suffix.
///
/// Integrity failures inside a loaded snapshot abort recovery; a torn WAL
/// tail is tolerated and simply ends the replay.
pub fn recover(dir: &Path, signer: &dyn Signer) -> Result<RecoveredState, XlnError> {
    let snapshots = SnapshotStore::new(dir)?;
    let (mut replicas, snapshot_height) = match snapshots.latest_valid()? {
        Some(Snapshot {
            height, replicas, ..
        }) => {
            info!(height, "recovering from snapshot");
            (replicas, height)
        }
        None => {
            info!("no snapshot found; replaying the full log");
            (BTreeMap::new(), 0)
        }
    };

    let mut replayed = 0u64;
    for entry in wal::read_all(wal_path(dir))? {
        match WalRecord::decode(&entry.payload)? {
            WalRecord::InitReplica { replica } => {
                let key = replica_key(&replica);
                replicas.entry(key).or_insert(*replica);
            }
            WalRecord::CommitFrame { replica_key, frame } => {
                let Some(replica) = replicas.get_mut(&replica_key) else {
                    warn!(key = %replica_key, "commit for unknown replica; skipping");
                    continue;
                };
                if frame.height <= replica.current_height {
                    continue; // already inside the snapshot
                }
                replica.handle_commit(&frame, signer)?;
                replayed += 1;
            }
        }
    }

    let state_root = state_root(&replicas);
    info!(
        snapshot_height,
        replayed,
        root = %hex::encode(state_root),
        "recovery complete"
    );
    Ok(RecoveredState {
        replicas,
        snapshot_height,
        replayed,
        state_root,
    })
}

/// Append a record to the log.
pub fn append_record(wal: &mut Wal, record: &WalRecord) -> Result<u64, XlnError> {
    wal.append(&record.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use xln_core::{EntityId, EntityTx, EntityTxKind, HashSigner, SignerId};
    use xln_entity::{EntityMessage, ValidatorInfo, ValidatorSet};

    const NOW: i64 = 1_700_000_000;

    fn single_validator_replica(name: &[u8]) -> EntityReplica {
        let mut vs = ValidatorSet::new();
        vs.add(ValidatorInfo {
            signer_id: SignerId::new(name.to_vec()),
            voting_power: 1,
        });
        EntityReplica::new(EntityId::new(name.to_vec()), SignerId::new(name.to_vec()), vs)
    }

    /// Commit one chat frame on a single-validator replica and return the
    /// committed frame.
    fn commit_chat(replica: &mut EntityReplica, nonce: u64, message: &str) -> EntityFrame {
        let signer_id = replica.signer_id.clone();
        replica
            .add_tx(EntityTx {
                from: signer_id.clone(),
                nonce,
                kind: EntityTxKind::Chat {
                    message: message.into(),
                },
            })
            .unwrap();
        let frame = match replica.propose(&HashSigner, NOW).unwrap().unwrap() {
            EntityMessage::Proposal { frame } => frame,
            other => panic!("unexpected {other:?}"),
        };
        let hash = frame.frame_hash();
        let own_sig = frame.signatures[&signer_id].clone();
        let out = replica
            .collect_precommit(frame.height, hash, &signer_id, &own_sig, &HashSigner)
            .unwrap();
        match out.message {
            Some(EntityMessage::Commit { frame }) => frame,
            other => panic!("expected commit, got {other:?}"),
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("xln_recovery_test_{name}"));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn wal_record_round_trip() {
        let replica = single_validator_replica(b"alice");
        let init = WalRecord::InitReplica {
            replica: Box::new(replica.clone()),
        };
        assert_eq!(WalRecord::decode(&init.encode()).unwrap(), init);
    }

    #[test]
    fn snapshot_plus_wal_suffix_reproduces_the_run() {
        let dir = temp_dir("crash");
        let snapshots = SnapshotStore::new(&dir).unwrap();
        let mut wal = Wal::open(wal_path(&dir)).unwrap();

        let mut replica = single_validator_replica(b"alice");
        append_record(
            &mut wal,
            &WalRecord::InitReplica {
                replica: Box::new(replica.clone()),
            },
        )
        .unwrap();
        let key = replica_key(&replica);

        // Process 7 frames; snapshot at height 5; "crash" after 7.
        for i in 1..=7u64 {
            let frame = commit_chat(&mut replica, i - 1, &format!("msg-{i}"));
            append_record(
                &mut wal,
                &WalRecord::CommitFrame {
                    replica_key: key.clone(),
                    frame,
                },
            )
            .unwrap();
            if i == 5 {
                let mut set = BTreeMap::new();
                set.insert(key.clone(), replica.clone());
                snapshots.write(5, NOW, &set).unwrap();
            }
        }
        let mut uninterrupted = BTreeMap::new();
        uninterrupted.insert(key.clone(), replica.clone());
        let expected_root = state_root(&uninterrupted);

        // Restart: snapshot 5 + WAL entries 6 and 7.
        let recovered = recover(&dir, &HashSigner).unwrap();
        assert_eq!(recovered.snapshot_height, 5);
        assert_eq!(recovered.replayed, 2);
        assert_eq!(recovered.state_root, expected_root);

        // Frame 8 continues normally on the recovered replica.
        let mut restored = recovered.replicas[&key].clone();
        assert_eq!(restored.current_height, 7);
        commit_chat(&mut restored, 7, "msg-8");
        assert_eq!(restored.current_height, 8);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn recovery_without_snapshot_replays_everything() {
        let dir = temp_dir("full_replay");
        let mut wal = Wal::open(wal_path(&dir)).unwrap();

        let mut replica = single_validator_replica(b"bob");
        append_record(
            &mut wal,
            &WalRecord::InitReplica {
                replica: Box::new(replica.clone()),
            },
        )
        .unwrap();
        let key = replica_key(&replica);
        for i in 1..=3u64 {
            let frame = commit_chat(&mut replica, i - 1, "x");
            append_record(
                &mut wal,
                &WalRecord::CommitFrame {
                    replica_key: key.clone(),
                    frame,
                },
            )
            .unwrap();
        }

        let recovered = recover(&dir, &HashSigner).unwrap();
        assert_eq!(recovered.snapshot_height, 0);
        assert_eq!(recovered.replayed, 3);
        assert_eq!(recovered.replicas[&key].state_hash(), replica.state_hash());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn replaying_twice_is_idempotent() {
        let dir = temp_dir("idempotent");
        let mut wal = Wal::open(wal_path(&dir)).unwrap();
        let mut replica = single_validator_replica(b"carol");
        append_record(
            &mut wal,
            &WalRecord::InitReplica {
                replica: Box::new(replica.clone()),
            },
        )
        .unwrap();
        let key = replica_key(&replica);
        let frame = commit_chat(&mut replica, 0, "once");
        append_record(
            &mut wal,
            &WalRecord::CommitFrame {
                replica_key: key.clone(),
                frame,
            },
        )
        .unwrap();

        let first = recover(&dir, &HashSigner).unwrap();
        let second = recover(&dir, &HashSigner).unwrap();
        assert_eq!(first.state_root, second.state_root);
        let _ = fs::remove_dir_all(&dir);
    }
}
