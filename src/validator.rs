//! Invariant checks for nominal/uncertainty pairs.
//!
//! These checks are ordinary branches and never compile away in release
//! builds.

use crate::error::{NuError, NuResult};
use crate::types::NuPair;

/// `true` iff `u >= 0`, `n` is not NaN, and `n` is finite unless `u` is
/// infinite (total epistemic collapse).
pub fn validate(nominal: f64, uncertainty: f64) -> bool {
    uncertainty >= 0.0
        && !nominal.is_nan()
        && (nominal.is_finite() || uncertainty.is_infinite())
}

pub fn validate_pair(pair: &NuPair) -> bool {
    validate(pair.nominal, pair.uncertainty)
}

/// Like [`validate`], but reports failures as a typed error naming the
/// operation and the offending values.
pub fn assert_invariants(nominal: f64, uncertainty: f64, operation: &str) -> NuResult<()> {
    if validate(nominal, uncertainty) {
        Ok(())
    } else {
        Err(NuError::InvariantViolation {
            operation: operation.to_string(),
            nominal,
            uncertainty,
        })
    }
}

pub fn assert_pair(pair: &NuPair, operation: &str) -> NuResult<()> {
    assert_invariants(pair.nominal, pair.uncertainty, operation)
}
