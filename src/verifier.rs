//! Standalone integrity verifier for exported ledger histories.

use crate::error::NuError;
use crate::merkle::{merkle_root, Hash};
use crate::signing::PublicKey;
use crate::types::LedgerEntry;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

/// Outcome of a full-history integrity check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrityReport {
    pub entry_count: usize,
    pub ordered: bool,
    pub causal_links_valid: bool,
    pub root_matches: bool,
    /// `None` when no public key was supplied.
    pub signatures_valid: Option<bool>,
    pub expected_root: String,
    pub computed_root: String,
    pub failures: Vec<String>,
    pub success: bool,
}

impl IntegrityReport {
    /// Report for a ledger whose entries could not be read at all.
    pub fn unreadable(reason: String) -> Self {
        Self {
            entry_count: 0,
            ordered: false,
            causal_links_valid: false,
            root_matches: false,
            signatures_valid: None,
            expected_root: String::new(),
            computed_root: String::new(),
            failures: vec![reason],
            success: false,
        }
    }
}

/// Re-derives ordering, parent links, the Merkle root and (optionally)
/// signatures from a sequence of entries.
#[derive(Debug, Clone, Default)]
pub struct LedgerVerifier {
    public_key: Option<PublicKey>,
}

impl LedgerVerifier {
    /// Verifier that skips signature checks.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_public_key(public_key: PublicKey) -> Self {
        Self {
            public_key: Some(public_key),
        }
    }

    /// Whether `entry`'s signature verifies over its content hash.
    pub fn verify_entry(&self, entry: &LedgerEntry, public_key: &PublicKey) -> bool {
        public_key.verify(&entry.content_hash(), entry.signature())
    }

    /// Check `entries` (in stored order) against a trusted root.
    pub fn verify_entries(&self, entries: &[LedgerEntry], expected_root: &Hash) -> IntegrityReport {
        let mut failures = Vec::new();
        let mut ordered = true;
        let mut causal_links_valid = true;
        let mut signatures_valid = self.public_key.map(|_| true);
        let mut seen = HashSet::with_capacity(entries.len());
        let mut leaves = Vec::with_capacity(entries.len());
        let mut previous: Option<u64> = None;

        for entry in entries {
            if let Some(prev) = previous {
                if entry.timestamp() <= prev {
                    ordered = false;
                    failures.push(
                        NuError::LedgerOrdering {
                            previous: prev,
                            next: entry.timestamp(),
                        }
                        .to_string(),
                    );
                }
            }
            previous = Some(entry.timestamp());

            if let Some(parent) = entry.parent_id() {
                if !seen.contains(&parent) {
                    causal_links_valid = false;
                    failures.push(integrity(format!(
                        "entry {} references parent {} that does not precede it",
                        entry.op_id(),
                        parent
                    )));
                }
            }
            if !seen.insert(entry.op_id()) {
                causal_links_valid = false;
                failures.push(integrity(format!("duplicate op_id {}", entry.op_id())));
            }

            if let Some(key) = &self.public_key {
                if !self.verify_entry(entry, key) {
                    signatures_valid = Some(false);
                    failures.push(integrity(format!(
                        "signature of entry {} (timestamp {}) does not verify",
                        entry.op_id(),
                        entry.timestamp()
                    )));
                }
            }

            leaves.push(entry.content_hash());
        }

        let computed = merkle_root(&leaves);
        let root_matches = &computed == expected_root;
        if !root_matches {
            failures.push(integrity(format!(
                "merkle root mismatch: expected {}, recomputed {}",
                hex::encode(expected_root),
                hex::encode(computed)
            )));
        }

        let success = failures.is_empty();
        for failure in &failures {
            warn!(%failure, "ledger integrity check failed");
        }

        IntegrityReport {
            entry_count: entries.len(),
            ordered,
            causal_links_valid,
            root_matches,
            signatures_valid,
            expected_root: hex::encode(expected_root),
            computed_root: hex::encode(computed),
            failures,
            success,
        }
    }

    /// Verify and return the report as JSON for external tooling.
    pub fn verify_entries_json(
        &self,
        entries: &[LedgerEntry],
        expected_root: &Hash,
    ) -> serde_json::Value {
        let report = self.verify_entries(entries, expected_root);
        serde_json::to_value(&report).unwrap_or_else(|_| {
            serde_json::json!({
                "entry_count": entries.len(),
                "success": false,
                "failures": ["failed to serialize integrity report"]
            })
        })
    }
}

fn integrity(reason: String) -> String {
    NuError::LedgerIntegrity { reason }.to_string()
}
