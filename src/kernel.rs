//! Deterministic arithmetic over nominal/uncertainty pairs.
//!
//! All functions are pure. Inputs with negative uncertainty are a caller
//! contract violation: screen untrusted values with
//! [`crate::validator::assert_pair`] or recover with [`catch`].

use crate::error::{NuError, NuResult};
use crate::types::{NuPair, Operation};
use crate::validator;

/// Margin applied to the multiplication uncertainty. Fixed at compile time.
pub const MULTIPLY_MARGIN: f64 = 1.0;

/// `(n1 + n2, sqrt(u1² + u2²))`.
pub fn add(a: NuPair, b: NuPair) -> NuPair {
    NuPair::new(a.nominal + b.nominal, a.uncertainty.hypot(b.uncertainty))
}

/// `(n1 * n2, λ * sqrt((n1 u2)² + (n2 u1)² + (u1 u2)²))` with the cross term
/// kept for conservativeness.
pub fn multiply(a: NuPair, b: NuPair) -> NuPair {
    let spread = (a.nominal * b.uncertainty)
        .hypot(b.nominal * a.uncertainty)
        .hypot(a.uncertainty * b.uncertainty);
    NuPair::new(a.nominal * b.nominal, MULTIPLY_MARGIN * spread)
}

/// Inverse-variance weighted combination of two estimates.
///
/// The result uncertainty never exceeds `min(u1, u2)`. An exact input
/// (`u = 0`) dominates and is returned unchanged; an input with infinite
/// uncertainty carries no information and yields the other input. Fails when
/// both inputs are exact.
pub fn compose(a: NuPair, b: NuPair) -> NuResult<NuPair> {
    let (u1, u2) = (a.uncertainty, b.uncertainty);
    if u1 == 0.0 && u2 == 0.0 {
        return Err(NuError::Precondition {
            operation: Operation::Compose.as_str().to_string(),
            message: "at least one input must carry non-zero uncertainty".to_string(),
        });
    }
    if u1 == 0.0 {
        return Ok(a);
    }
    if u2 == 0.0 {
        return Ok(b);
    }
    if u1.is_infinite() {
        return Ok(b);
    }
    if u2.is_infinite() {
        return Ok(a);
    }

    // Scale by the larger margin so the squares cannot overflow.
    let scale = u1.max(u2);
    let (r1, r2) = (u1 / scale, u2 / scale);
    let (v1, v2) = (r1 * r1, r2 * r2);
    let nominal = (a.nominal * v2 + b.nominal * v1) / (v1 + v2);
    // u1 u2 / sqrt(u1² + u2²) == lo / sqrt(1 + (lo/hi)²)
    let (lo, hi) = if u1 <= u2 { (u1, u2) } else { (u2, u1) };
    let uncertainty = (lo / 1.0_f64.hypot(lo / hi)).min(lo);
    Ok(NuPair::new(nominal, uncertainty))
}

/// Returns `pair` if it is usable, else the collapse sentinel `(0, +inf)`.
pub fn catch(pair: NuPair) -> NuPair {
    catch_with(pair, 0.0)
}

/// Returns `pair` if it is usable, else `(default_nominal, +inf)`.
///
/// Usable means valid with a finite nominal: an already collapsed
/// `(±inf, +inf)` is replaced too, so the result is always safe to feed back
/// into the kernel. The fallback always carries infinite uncertainty.
pub fn catch_with(pair: NuPair, default_nominal: f64) -> NuPair {
    if validator::validate_pair(&pair) && pair.nominal.is_finite() {
        pair
    } else {
        NuPair::collapsed(default_nominal)
    }
}

/// `(-n, u)`. Exact, so `flip(flip(x)) == x` bit for bit.
pub fn flip(pair: NuPair) -> NuPair {
    NuPair::new(-pair.nominal, pair.uncertainty)
}

/// Dispatch a kernel operation by name with arity checking.
pub fn apply(operation: &Operation, inputs: &[NuPair]) -> NuResult<NuPair> {
    let precondition = |message: String| NuError::Precondition {
        operation: operation.as_str().to_string(),
        message,
    };

    match (operation, inputs) {
        (Operation::Add, [a, b]) => Ok(add(*a, *b)),
        (Operation::Multiply, [a, b]) => Ok(multiply(*a, *b)),
        (Operation::Compose, [a, b]) => compose(*a, *b),
        (Operation::Catch, [pair]) => Ok(catch(*pair)),
        (Operation::Flip, [pair]) => Ok(flip(*pair)),
        (Operation::Custom(_), _) => Err(precondition("not a kernel operation".to_string())),
        (op, _) => Err(precondition(format!(
            "expected {} inputs, got {}",
            op.arity().unwrap_or_default(),
            inputs.len()
        ))),
    }
}
