//! Binary Merkle tree over 32-byte digests.
//!
//! Odd levels are padded by duplicating the last element. The root of a
//! single leaf is that leaf; the root of the empty list is SHA-256 of the
//! empty string, so an empty snapshot still commits to something.

use crate::hash::sha256;

/// Compute the Merkle root of a list of digests.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return sha256(b"");
    }
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

/// Produce the sibling path for `index`, bottom-up.
///
/// Returns `None` if `index` is out of range. The proof contains one sibling
/// digest per tree level (duplicated-last padding included).
pub fn merkle_proof(leaves: &[[u8; 32]], index: usize) -> Option<Vec<[u8; 32]>> {
    if index >= leaves.len() {
        return None;
    }
    let mut proof = Vec::new();
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    let mut idx = index;
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        let sibling = idx ^ 1;
        proof.push(level[sibling]);
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
        idx /= 2;
    }
    Some(proof)
}

/// Verify a proof produced by [`merkle_proof`] for the leaf at `index`.
pub fn verify_merkle_proof(
    leaf: &[u8; 32],
    root: &[u8; 32],
    proof: &[[u8; 32]],
    index: usize,
) -> bool {
    let mut acc = *leaf;
    let mut idx = index;
    for sibling in proof {
        acc = if idx % 2 == 0 {
            hash_pair(&acc, sibling)
        } else {
            hash_pair(sibling, &acc)
        };
        idx /= 2;
    }
    acc == *root
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256(&buf)
}
