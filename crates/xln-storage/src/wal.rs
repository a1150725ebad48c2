//! Append-only write-ahead log.
//!
//! On-disk record layout, repeated until end of file:
//!
//! ```text
//! [ index: u64 BE ][ checksum: 32 bytes = sha256(payload) ][ len: u32 BE ][ payload ]
//! ```
//!
//! Readers stop cleanly at a torn tail: a truncated record or one whose
//! checksum fails terminates the scan and everything before it is returned.
//! Entries are never mutated or reordered.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use xln_core::XlnError;
use xln_crypto::sha256;

const HEADER_LEN: usize = 8 + 32 + 4;

/// One verified log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalEntry {
    pub index: u64,
    pub checksum: [u8; 32],
    pub payload: Vec<u8>,
}

/// Single-writer handle to the log file.
pub struct Wal {
    path: PathBuf,
    file: File,
    next_index: u64,
}

impl Wal {
    /// Open (or create) the log, scanning existing entries to find the next
    /// index. A torn tail is tolerated; appends continue after the last
    /// valid entry.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, XlnError> {
        let path = path.as_ref().to_path_buf();
        let entries = read_all(&path)?;
        let next_index = entries.len() as u64;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| XlnError::Storage(format!("opening wal: {e}")))?;
        Ok(Self {
            path,
            file,
            next_index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.next_index
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    /// Append one payload and flush it to disk. Returns the entry index.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64, XlnError> {
        let index = self.next_index;
        let checksum = sha256(payload);
        let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
        record.extend_from_slice(&index.to_be_bytes());
        record.extend_from_slice(&checksum);
        record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        record.extend_from_slice(payload);
        self.file
            .write_all(&record)
            .map_err(|e| XlnError::Storage(format!("wal append: {e}")))?;
        self.file
            .sync_data()
            .map_err(|e| XlnError::Storage(format!("wal sync: {e}")))?;
        self.next_index += 1;
        Ok(index)
    }
}

/// Read every valid entry, in order, stopping at the first torn or corrupt
/// record. A missing file is an empty log.
pub fn read_all<P: AsRef<Path>>(path: P) -> Result<Vec<WalEntry>, XlnError> {
    let mut bytes = Vec::new();
    match File::open(path.as_ref()) {
        Ok(mut f) => {
            f.read_to_end(&mut bytes)
                .map_err(|e| XlnError::Storage(format!("reading wal: {e}")))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(XlnError::Storage(format!("opening wal: {e}"))),
    }

    let mut entries = Vec::new();
    let mut offset = 0usize;
    while bytes.len() - offset >= HEADER_LEN {
        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&bytes[offset..offset + 8]);
        let index = u64::from_be_bytes(index_bytes);

        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&bytes[offset + 8..offset + 40]);

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[offset + 40..offset + 44]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        let start = offset + HEADER_LEN;
        if bytes.len() < start + len {
            warn!(index, "torn wal tail: truncated payload");
            break;
        }
        let payload = bytes[start..start + len].to_vec();
        if sha256(&payload) != checksum || index != entries.len() as u64 {
            warn!(index, "torn wal tail: checksum or index mismatch");
            break;
        }
        entries.push(WalEntry {
            index,
            checksum,
            payload,
        });
        offset = start + len;
    }
    Ok(entries)
}

/// Recompute every checksum; true iff the whole file is valid entries.
pub fn verify_integrity<P: AsRef<Path>>(path: P) -> Result<bool, XlnError> {
    let mut bytes = Vec::new();
    match File::open(path.as_ref()) {
        Ok(mut f) => {
            f.read_to_end(&mut bytes)
                .map_err(|e| XlnError::Storage(format!("reading wal: {e}")))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(XlnError::Storage(format!("opening wal: {e}"))),
    }
    let entries = read_all(path.as_ref())?;
    let consumed: usize = entries.iter().map(|e| HEADER_LEN + e.payload.len()).sum();
    Ok(consumed == bytes.len())
}
