//! Signed attestation records for external audit.

use crate::error::{NuError, NuResult};
use crate::ledger::Ledger;
use crate::monitor::MonitorConfig;
use crate::signing::{PublicKey, SigningIdentity};
use crate::storage::StorageBackend;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const ATTESTATION_DOMAIN: &[u8] = b"nuaudit/attestation/v1";

/// `{ target_id, timestamp, hash, signature, verified }`, hashes and
/// signatures hex encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attestation {
    pub target_id: String,
    pub timestamp: u64,
    pub hash: String,
    pub signature: String,
    pub verified: bool,
}

impl Attestation {
    /// Sign `hash` for `target_id` at `timestamp`.
    pub fn create(
        target_id: String,
        hash: &[u8],
        timestamp: u64,
        identity: &SigningIdentity,
    ) -> Self {
        let hash = hex::encode(hash);
        let message = Self::signing_message(&target_id, timestamp, &hash);
        let signature = identity.sign(&message);
        let verified = identity.verify(&message, &signature);
        Self {
            target_id,
            timestamp,
            hash,
            signature: hex::encode(signature),
            verified,
        }
    }

    /// Bytes covered by the signature: domain tag, length-prefixed target id,
    /// big-endian timestamp, hex hash.
    pub fn signing_message(target_id: &str, timestamp: u64, hash_hex: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ATTESTATION_DOMAIN.len() + target_id.len() + 80);
        buf.extend_from_slice(ATTESTATION_DOMAIN);
        buf.extend_from_slice(&(target_id.len() as u32).to_be_bytes());
        buf.extend_from_slice(target_id.as_bytes());
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf.extend_from_slice(hash_hex.as_bytes());
        buf
    }

    /// Re-check the signature; ignores the stored `verified` flag.
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        let Ok(signature) = hex::decode(&self.signature) else {
            return false;
        };
        let message = Self::signing_message(&self.target_id, self.timestamp, &self.hash);
        public_key.verify(&message, &signature)
    }

    pub fn to_json(&self) -> NuResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Thread-safe signer and store of attestations keyed by target id.
#[derive(Debug, Clone)]
pub struct Attestor {
    identity: SigningIdentity,
    attestations: Arc<RwLock<HashMap<String, Attestation>>>,
}

impl Attestor {
    pub fn new(identity: SigningIdentity) -> Self {
        Self {
            identity,
            attestations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    /// Sign and store an attestation over `hash`, replacing any earlier one
    /// for the same target.
    pub fn attest(&self, target_id: &str, hash: &[u8]) -> NuResult<Attestation> {
        let attestation =
            Attestation::create(target_id.to_string(), hash, now_secs(), &self.identity);
        let mut attestations = self.attestations.write().map_err(|_| NuError::LockPoisoned {
            resource: "attestations".to_string(),
        })?;
        attestations.insert(target_id.to_string(), attestation.clone());
        debug!(target_id, hash = %attestation.hash, "stored attestation");
        Ok(attestation)
    }

    /// Attest the canonical hash of a monitor configuration.
    pub fn attest_config(&self, target_id: &str, config: &MonitorConfig) -> NuResult<Attestation> {
        self.attest(target_id, &config.content_hash()?)
    }

    /// Attest a ledger's current Merkle root.
    pub fn attest_ledger<B: StorageBackend>(
        &self,
        target_id: &str,
        ledger: &Ledger<B>,
    ) -> NuResult<Attestation> {
        self.attest(target_id, &ledger.get_root()?)
    }

    pub fn retrieve(&self, target_id: &str) -> NuResult<Attestation> {
        let attestations = self.attestations.read().map_err(|_| NuError::LockPoisoned {
            resource: "attestations".to_string(),
        })?;
        attestations
            .get(target_id)
            .cloned()
            .ok_or_else(|| NuError::NotFound {
                op_id: target_id.to_string(),
            })
    }

    pub fn contains(&self, target_id: &str) -> NuResult<bool> {
        let attestations = self.attestations.read().map_err(|_| NuError::LockPoisoned {
            resource: "attestations".to_string(),
        })?;
        Ok(attestations.contains_key(target_id))
    }

    /// Whether the stored attestation for `target_id` still verifies and
    /// covers exactly `hash`.
    pub fn validate(&self, target_id: &str, hash: &[u8]) -> NuResult<bool> {
        let attestation = self.retrieve(target_id)?;
        Ok(attestation.hash == hex::encode(hash) && attestation.verify(self.public_key()))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
