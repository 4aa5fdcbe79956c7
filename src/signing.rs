//! Ed25519 signing over raw bytes.
//!
//! The same key handling serves ledger entries, monitor configurations and
//! attestation records; callers decide what the bytes mean.

use crate::error::{NuError, NuResult};
use crate::types::sha256;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Private signing key paired with its public half.
#[derive(Clone)]
pub struct SigningIdentity {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl SigningIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restore from 32 secret key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = PublicKey {
            verifying_key: signing_key.verifying_key(),
        };
        Self {
            signing_key,
            public_key,
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        self.public_key.verify(message, signature)
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Public verification key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> NuResult<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)?;
        Ok(Self { verifying_key })
    }

    pub fn from_hex(s: &str) -> NuResult<Self> {
        let raw = hex::decode(s).map_err(|e| NuError::Signature {
            message: format!("public key is not hex: {}", e),
        })?;
        let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| NuError::Signature {
            message: format!("public key must be 32 bytes, got {}", raw.len()),
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Short identifier: first 8 bytes of SHA-256 over the key, hex encoded.
    pub fn fingerprint(&self) -> String {
        hex::encode(&sha256(self.verifying_key.as_bytes())[..8])
    }

    /// Strict verification; malformed signatures simply fail.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(sig) => self.verifying_key.verify(message, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Sign `message` with `identity`.
pub fn sign(message: &[u8], identity: &SigningIdentity) -> Vec<u8> {
    identity.sign(message)
}

/// Verify `signature` over `message` against `public_key`.
pub fn verify(message: &[u8], signature: &[u8], public_key: &PublicKey) -> bool {
    public_key.verify(message, signature)
}
