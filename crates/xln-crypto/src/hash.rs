use sha2::{Digest as _, Sha256};
use sha3::Keccak256;

/// SHA-256 of arbitrary bytes → 32-byte array.
///
/// Used for WAL entry checksums and Merkle tree nodes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Keccak-256 of arbitrary bytes → 32-byte array.
///
/// Used for frame state hashes and per-replica state hashes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256(b"abc")[..4],
            [0xba, 0x78, 0x16, 0xbf],
        );
    }

    #[test]
    fn keccak256_empty() {
        // Keccak-256 of the empty string (the Ethereum empty hash).
        assert_eq!(
            keccak256(b"")[..4],
            [0xc5, 0xd2, 0x46, 0x01],
        );
    }

    #[test]
    fn digests_differ_between_algorithms() {
        assert_ne!(sha256(b"xln"), keccak256(b"xln"));
    }
}
