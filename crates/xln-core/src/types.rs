use serde::{Deserialize, Serialize};
use std::fmt;

/// Signed token amount. i128 covers any realistic token supply with room to
/// spare; all mutation sites use checked arithmetic.
pub type Amount = i128;

/// Unix timestamp (seconds, UTC). Carried in frames, never read from a clock
/// inside consensus code.
pub type Timestamp = i64;

/// Frame height at either layer (monotonic, starts at 0).
pub type Height = u64;

// ── EntityId ─────────────────────────────────────────────────────────────────

/// Opaque entity identifier. The lexicographic order of the raw bytes decides
/// which side of a bilateral pair is "left".
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub Vec<u8>);

impl EntityId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self(hex::decode(s)?))
    }

    /// Canonical side selection: the smaller id is the left side of the pair.
    pub fn is_left_of(&self, other: &EntityId) -> bool {
        self < other
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Printable ids (tests, CLI fixtures) render as text, others as hex.
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => write!(f, "{s}"),
            _ => write!(f, "0x{}", self.to_hex()),
        }
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({self})")
    }
}

// ── SignerId ─────────────────────────────────────────────────────────────────

/// Opaque signer identifier inside a validator set. The core never holds key
/// material; it hands `SignerId`s to the external [`crate::signer::Signer`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignerId(pub Vec<u8>);

impl SignerId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => write!(f, "{s}"),
            _ => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerId({self})")
    }
}

// ── TokenId ──────────────────────────────────────────────────────────────────

/// Opaque token identifier. Sorted lexicographically wherever a canonical
/// token order is needed (frames, snapshots).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub Vec<u8>);

impl TokenId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Numeric token ids encode as the minimal big-endian byte string.
    pub fn number(n: u64) -> Self {
        let be = n.to_be_bytes();
        let first = be.iter().position(|&b| b != 0).unwrap_or(be.len());
        Self(be[first..].to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", hex::encode(&self.0))
    }
}

// ── Signature ────────────────────────────────────────────────────────────────

/// Opaque signature bytes produced by the external signer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}b)", self.0.len())
    }
}
