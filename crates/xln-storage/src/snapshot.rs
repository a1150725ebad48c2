//! RLP+Merkle snapshots of the full replica set.
//!
//! A snapshot is the canonical RLP list `[height, timestamp, stateRoot,
//! replicasRlp]`, where `replicasRlp` holds each replica's encoding in
//! sorted replica-key order and `stateRoot` is the Merkle root over the
//! keccak hashes of those encodings. Decoding always recomputes the root;
//! a mismatch is corruption, never silenced.
//!
//! Each binary `snapshot-<height>.rlp` has a sibling
//! `snapshot-<height>.debug.ss`, a human-readable dump that must never be
//! used for recovery.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use xln_core::{Timestamp, XlnError};
use xln_crypto::{keccak256, merkle_root, rlp_decode, rlp_encode, RlpValue};
use xln_entity::EntityReplica;

/// Stable identifier of a replica inside the snapshot ordering.
pub fn replica_key(replica: &EntityReplica) -> String {
    format!("{}:{}", replica.entity_id, replica.signer_id)
}

/// A decoded, root-verified snapshot.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub height: u64,
    pub timestamp: Timestamp,
    pub state_root: [u8; 32],
    pub replicas: BTreeMap<String, EntityReplica>,
}

/// Merkle root over the replica hashes in sorted-key order.
pub fn state_root(replicas: &BTreeMap<String, EntityReplica>) -> [u8; 32] {
    let hashes: Vec<[u8; 32]> = replicas
        .values()
        .map(|r| keccak256(&rlp_encode(&r.to_rlp())))
        .collect();
    merkle_root(&hashes)
}

/// Encode a snapshot to its canonical bytes.
pub fn encode_snapshot(
    height: u64,
    timestamp: Timestamp,
    replicas: &BTreeMap<String, EntityReplica>,
) -> Vec<u8> {
    let root = state_root(replicas);
    rlp_encode(&RlpValue::list(vec![
        RlpValue::uint(height as u128),
        RlpValue::int(timestamp as i128),
        RlpValue::bytes(root.to_vec()),
        RlpValue::list(replicas.values().map(|r| r.to_rlp()).collect()),
    ]))
}

/// Decode and verify a snapshot. The stored root must equal the root
/// recomputed from the embedded replicas.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, XlnError> {
    let value = rlp_decode(bytes)?;
    let items = value.as_list_of(4).map_err(XlnError::from)?;
    let root_bytes = items[2].as_bytes().map_err(XlnError::from)?;
    if root_bytes.len() != 32 {
        return Err(XlnError::Serialization("state root must be 32 bytes".into()));
    }
    let mut stored_root = [0u8; 32];
    stored_root.copy_from_slice(root_bytes);

    let mut replicas = BTreeMap::new();
    for r in items[3].as_list().map_err(XlnError::from)? {
        let replica = EntityReplica::from_rlp(r)?;
        replicas.insert(replica_key(&replica), replica);
    }

    let recomputed = state_root(&replicas);
    if recomputed != stored_root {
        return Err(XlnError::StateRootMismatch {
            expected: hex::encode(stored_root),
            got: hex::encode(recomputed),
        });
    }

    Ok(Snapshot {
        height: items[0].as_uint().map_err(XlnError::from)? as u64,
        timestamp: items[1].as_int().map_err(XlnError::from)? as Timestamp,
        state_root: stored_root,
        replicas,
    })
}

/// Is `height` a periodic snapshot point for the configured interval?
pub fn is_snapshot_height(height: u64, interval: u64) -> bool {
    interval > 0 && height > 0 && height % interval == 0
}

// ── SnapshotStore ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct DebugReplica {
    state_hash: String,
    entity_height: u64,
}

#[derive(Serialize)]
struct DebugDump {
    height: u64,
    timestamp: Timestamp,
    state_root: String,
    replicas: BTreeMap<String, DebugReplica>,
}

/// Directory of `snapshot-<height>.rlp` files plus their debug siblings.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, XlnError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| XlnError::Storage(format!("creating snapshot dir: {e}")))?;
        Ok(Self { dir })
    }

    fn path_for(&self, height: u64) -> PathBuf {
        self.dir.join(format!("snapshot-{height}.rlp"))
    }

    /// Write a snapshot atomically (temp file + rename) and its debug dump.
    pub fn write(
        &self,
        height: u64,
        timestamp: Timestamp,
        replicas: &BTreeMap<String, EntityReplica>,
    ) -> Result<PathBuf, XlnError> {
        let bytes = encode_snapshot(height, timestamp, replicas);
        let path = self.path_for(height);
        let tmp = path.with_extension("rlp.tmp");
        fs::write(&tmp, &bytes).map_err(|e| XlnError::Storage(format!("snapshot write: {e}")))?;
        fs::rename(&tmp, &path)
            .map_err(|e| XlnError::Storage(format!("snapshot rename: {e}")))?;

        let dump = DebugDump {
            height,
            timestamp,
            state_root: hex::encode(state_root(replicas)),
            replicas: replicas
                .iter()
                .map(|(k, r)| {
                    (
                        k.clone(),
                        DebugReplica {
                            state_hash: hex::encode(keccak256(&rlp_encode(&r.to_rlp()))),
                            entity_height: r.current_height,
                        },
                    )
                })
                .collect(),
        };
        let debug_path = self.dir.join(format!("snapshot-{height}.debug.ss"));
        let json = serde_json::to_string_pretty(&dump)
            .map_err(|e| XlnError::Serialization(e.to_string()))?;
        fs::write(&debug_path, json)
            .map_err(|e| XlnError::Storage(format!("debug dump write: {e}")))?;

        info!(height, path = %path.display(), "snapshot written");
        Ok(path)
    }

    pub fn read(&self, height: u64) -> Result<Snapshot, XlnError> {
        let bytes = fs::read(self.path_for(height))
            .map_err(|e| XlnError::Storage(format!("snapshot read: {e}")))?;
        decode_snapshot(&bytes)
    }

    /// All snapshot heights on disk, ascending.
    pub fn heights(&self) -> Result<Vec<u64>, XlnError> {
        let mut heights = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| XlnError::Storage(format!("listing snapshots: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| XlnError::Storage(e.to_string()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(h) = name
                .strip_prefix("snapshot-")
                .and_then(|rest| rest.strip_suffix(".rlp"))
                .and_then(|h| h.parse::<u64>().ok())
            {
                heights.push(h);
            }
        }
        heights.sort_unstable();
        Ok(heights)
    }

    /// The newest snapshot that decodes and verifies. Invalid trailing
    /// snapshots (torn writes, bad roots) are skipped with a warning.
    pub fn latest_valid(&self) -> Result<Option<Snapshot>, XlnError> {
        for height in self.heights()?.into_iter().rev() {
            match self.read(height) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => warn!(height, error = %e, "skipping invalid snapshot"),
            }
        }
        Ok(None)
    }

    /// Drop snapshots older than `height` (their WAL suffix supersedes them).
    pub fn gc_before(&self, height: u64) -> Result<usize, XlnError> {
        let mut removed = 0;
        for h in self.heights()? {
            if h < height {
                let _ = fs::remove_file(self.path_for(h));
                let _ = fs::remove_file(self.dir.join(format!("snapshot-{h}.debug.ss")));
                removed += 1;
            }
        }
        Ok(removed)
    }
}
