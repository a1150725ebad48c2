//! The key-value seam. The WAL and snapshots live in plain files (their
//! layout is part of the recovery contract); everything else a host wants to
//! persist goes through [`KvStore`], with a sled-backed implementation for
//! nodes and an in-memory one for tests.

use std::collections::BTreeMap;
use std::path::Path;

use xln_core::XlnError;

/// One operation inside an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Minimal key-value interface; durability semantics belong to the backend.
pub trait KvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, XlnError>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), XlnError>;
    fn delete(&mut self, key: &[u8]) -> Result<(), XlnError>;
    fn batch(&mut self, ops: Vec<BatchOp>) -> Result<(), XlnError>;
    /// Key-ordered scan of every entry whose key starts with `prefix`.
    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, XlnError>;
}

// ── SledStore ────────────────────────────────────────────────────────────────

/// Persistent store backed by sled (pure-Rust, no C dependencies).
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, XlnError> {
        let db = sled::open(path).map_err(|e| XlnError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    pub fn flush(&self) -> Result<(), XlnError> {
        self.db
            .flush()
            .map_err(|e| XlnError::Storage(e.to_string()))?;
        Ok(())
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, XlnError> {
        Ok(self
            .db
            .get(key)
            .map_err(|e| XlnError::Storage(e.to_string()))?
            .map(|v| v.to_vec()))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), XlnError> {
        self.db
            .insert(key, value)
            .map_err(|e| XlnError::Storage(e.to_string()))?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), XlnError> {
        self.db
            .remove(key)
            .map_err(|e| XlnError::Storage(e.to_string()))?;
        Ok(())
    }

    fn batch(&mut self, ops: Vec<BatchOp>) -> Result<(), XlnError> {
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => batch.insert(key, value),
                BatchOp::Delete { key } => batch.remove(key),
            }
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| XlnError::Storage(e.to_string()))?;
        Ok(())
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, XlnError> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| XlnError::Storage(e.to_string()))?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }
}

// ── MemoryStore ──────────────────────────────────────────────────────────────

/// In-memory store for tests and simulation.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, XlnError> {
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), XlnError> {
        self.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), XlnError> {
        self.map.remove(key);
        Ok(())
    }

    fn batch(&mut self, ops: Vec<BatchOp>) -> Result<(), XlnError> {
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    self.map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    self.map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, XlnError> {
        Ok(self
            .map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
