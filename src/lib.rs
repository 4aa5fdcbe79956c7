//! nuaudit - nominal/uncertainty arithmetic with a tamper-evident audit ledger.
//!
//! Kernel results flow through the rule-based [`Monitor`], which can append
//! every outcome to a signed, Merkle-backed [`Ledger`].

pub mod attestation;
pub mod dsl;
pub mod error;
pub mod kernel;
pub mod ledger;
pub mod merkle;
pub mod monitor;
pub mod signing;
pub mod storage;
pub mod types;
pub mod validator;
pub mod verifier;

pub use attestation::{Attestation, Attestor};
pub use dsl::RuleDsl;
pub use error::{NuError, NuResult};
pub use kernel::{add, catch, catch_with, compose, flip, multiply};
pub use ledger::{AppendRequest, Ledger};
pub use merkle::{merkle_root, Direction, MerkleProof, MerkleTree};
pub use monitor::{
    CheckOutcome, Event, Level, Logic, Monitor, MonitorConfig, MonitorStats, Rule, Violation,
};
pub use signing::{PublicKey, SigningIdentity};
pub use storage::{MemoryStorage, SqliteStorage, StorageBackend};
pub use types::{
    compute_content_hash, coverage_ratio, sha256, LedgerEntry, NuPair, Operation,
    ENTRY_ENCODING_VERSION,
};
pub use validator::{assert_invariants, validate};
pub use verifier::{IntegrityReport, LedgerVerifier};
