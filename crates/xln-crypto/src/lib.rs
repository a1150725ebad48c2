//! Deterministic hashing, canonical RLP, and Merkle commitments for XLN.
//!
//! Everything in this crate is pure: no I/O, no clocks, no randomness.
//! Both consensus layers hash exclusively through these functions, so any
//! change here is a hard fork.

pub mod codec;
pub mod hash;
pub mod merkle;

pub use codec::{rlp_decode, rlp_encode, CodecError, RlpValue};
pub use hash::{keccak256, sha256};
pub use merkle::{merkle_proof, merkle_root, verify_merkle_proof};

/// 32-byte digest used throughout both consensus layers.
pub type Digest = [u8; 32];
