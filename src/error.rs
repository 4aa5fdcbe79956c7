//! Error types for nuaudit.

use std::fmt;

/// Unified error type for kernel, ledger, storage and monitor operations.
#[derive(Debug, Clone)]
pub enum NuError {
    /// A nominal/uncertainty pair failed validation
    InvariantViolation { operation: String, nominal: f64, uncertainty: f64 },
    /// Operation called outside its domain (e.g. compose with two exact inputs)
    Precondition { operation: String, message: String },
    /// Logical timestamps are not strictly increasing
    LedgerOrdering { previous: u64, next: u64 },
    /// Merkle root mismatch, bad signature or broken causal link
    LedgerIntegrity { reason: String },
    /// No entry with the given operation id
    NotFound { op_id: String },
    /// Parent reference does not name a previously appended entry
    InvalidParent { parent_id: String },
    /// Backend I/O failure
    Storage { backend: String, message: String },
    /// Key or signature material could not be decoded
    Signature { message: String },
    /// Malformed monitor configuration
    InvalidConfig { field: String, message: String },
    /// Rule DSL parse failure
    ParseError { source: String, message: String },
    /// Monitor raised a critical event with halting enabled
    Halted { operation: String, message: String },
    /// Serialization error
    Serialization { message: String },
    /// Lock acquisition failed (thread safety)
    LockPoisoned { resource: String },
}

impl fmt::Display for NuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvariantViolation { operation, nominal, uncertainty } => {
                write!(
                    f,
                    "invariant violated in '{}': nominal={}, uncertainty={}",
                    operation, nominal, uncertainty
                )
            }
            Self::Precondition { operation, message } => {
                write!(f, "precondition failed for '{}': {}", operation, message)
            }
            Self::LedgerOrdering { previous, next } => {
                write!(
                    f,
                    "ledger ordering violated: timestamp {} does not follow {}",
                    next, previous
                )
            }
            Self::LedgerIntegrity { reason } => {
                write!(f, "ledger integrity violated: {}", reason)
            }
            Self::NotFound { op_id } => {
                write!(f, "operation '{}' not found", op_id)
            }
            Self::InvalidParent { parent_id } => {
                write!(f, "parent '{}' is not a previously appended entry", parent_id)
            }
            Self::Storage { backend, message } => {
                write!(f, "{} storage error: {}", backend, message)
            }
            Self::Signature { message } => {
                write!(f, "signature error: {}", message)
            }
            Self::InvalidConfig { field, message } => {
                write!(f, "invalid monitor config '{}': {}", field, message)
            }
            Self::ParseError { source, message } => {
                write!(f, "parse error in '{}': {}", source, message)
            }
            Self::Halted { operation, message } => {
                write!(f, "monitor halted on '{}': {}", operation, message)
            }
            Self::Serialization { message } => {
                write!(f, "serialization error: {}", message)
            }
            Self::LockPoisoned { resource } => {
                write!(f, "lock poisoned for resource: {}", resource)
            }
        }
    }
}

impl std::error::Error for NuError {}

/// Result type alias for nuaudit operations.
pub type NuResult<T> = Result<T, NuError>;

impl From<serde_json::Error> for NuError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization { message: e.to_string() }
    }
}

impl From<rusqlite::Error> for NuError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage {
            backend: "sqlite".to_string(),
            message: e.to_string(),
        }
    }
}

impl From<ed25519_dalek::SignatureError> for NuError {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Self::Signature { message: e.to_string() }
    }
}

impl<T> From<std::sync::PoisonError<T>> for NuError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::LockPoisoned { resource: "ledger".to_string() }
    }
}
