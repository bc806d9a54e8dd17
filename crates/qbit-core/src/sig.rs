//! Post-quantum signatures.
//!
//! qbit signs transactions with CRYSTALS-Dilithium at NIST security level 3.
//! This module is the only place the concrete scheme appears; swapping to the
//! level-5 parameter set only changes the size constants below.

use crystals_dilithium::dilithium3;

/// Public key size in bytes.
pub const PUBLIC_KEY_BYTES: usize = dilithium3::PUBLICKEYBYTES;

/// Secret key size in bytes.
pub const SECRET_KEY_BYTES: usize = dilithium3::SECRETKEYBYTES;

/// Detached signature size in bytes.
pub const SIGNATURE_BYTES: usize = dilithium3::SIGNBYTES;

/// A signing keypair. Key management is out of scope for the node core; this
/// exists for the template builder's fixtures and for tests.
pub struct Keypair {
    inner: dilithium3::Keypair,
}

impl Keypair {
    /// Generate a keypair, optionally from a deterministic seed.
    pub fn generate(seed: Option<&[u8]>) -> Self {
        Self {
            inner: dilithium3::Keypair::generate(seed),
        }
    }

    /// Public key bytes as pushed onto the script stack.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.inner.public.to_bytes().to_vec()
    }

    /// Detached signature over `msg`.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.inner.sign(msg).to_vec()
    }
}

/// Verify a detached signature. Wrong-sized keys or signatures simply fail.
pub fn verify(public_key: &[u8], msg: &[u8], signature: &[u8]) -> bool {
    if public_key.len() != PUBLIC_KEY_BYTES || signature.len() != SIGNATURE_BYTES {
        return false;
    }
    let pk = dilithium3::PublicKey::from_bytes(public_key);
    pk.verify(msg, signature)
}
