//! The signing seam. The core never holds private keys: it refers to signers
//! by [`SignerId`] and delegates to whatever implementation the host wires
//! in.

use xln_crypto::keccak256;

use crate::error::XlnError;
use crate::types::{Signature, SignerId};

/// External signing service.
pub trait Signer {
    fn sign(&self, signer: &SignerId, message: &[u8]) -> Result<Signature, XlnError>;
    fn verify(&self, signer: &SignerId, message: &[u8], signature: &Signature) -> bool;
}

/// Deterministic digest-keyed signer for tests and local simulation.
///
/// A signature is `keccak256(signer_id ‖ message)`, so anyone can forge one.
/// This is NOT a cryptographic signature scheme; production hosts must
/// provide a real [`Signer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HashSigner;

impl HashSigner {
    fn mac(signer: &SignerId, message: &[u8]) -> [u8; 32] {
        let mut buf = Vec::with_capacity(signer.as_bytes().len() + message.len());
        buf.extend_from_slice(signer.as_bytes());
        buf.extend_from_slice(message);
        keccak256(&buf)
    }
}

impl Signer for HashSigner {
    fn sign(&self, signer: &SignerId, message: &[u8]) -> Result<Signature, XlnError> {
        Ok(Signature(Self::mac(signer, message).to_vec()))
    }

    fn verify(&self, signer: &SignerId, message: &[u8], signature: &Signature) -> bool {
        signature.as_bytes() == Self::mac(signer, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let signer = SignerId::new(*b"alice");
        let sig = HashSigner.sign(&signer, b"frame").unwrap();
        assert!(HashSigner.verify(&signer, b"frame", &sig));
    }

    #[test]
    fn verify_rejects_wrong_message_and_wrong_signer() {
        let signer = SignerId::new(*b"alice");
        let sig = HashSigner.sign(&signer, b"frame").unwrap();
        assert!(!HashSigner.verify(&signer, b"other", &sig));
        assert!(!HashSigner.verify(&SignerId::new(*b"bob"), b"frame", &sig));
    }
}
