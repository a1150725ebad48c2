//! Persistence: the key-value seam, the append-only WAL, RLP+Merkle
//! snapshots, and deterministic crash recovery.

pub mod kv;
pub mod recovery;
pub mod snapshot;
pub mod wal;

pub use kv::{BatchOp, KvStore, MemoryStore, SledStore};
pub use recovery::{append_record, recover, wal_path, RecoveredState, WalRecord, WAL_FILE};
pub use snapshot::{
    decode_snapshot, encode_snapshot, is_snapshot_height, replica_key, state_root, Snapshot,
    SnapshotStore,
};
pub use wal::{read_all, verify_integrity, Wal, WalEntry};
