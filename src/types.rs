//! Core data types for nuaudit.

use crate::validator;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Version byte leading every canonical entry encoding. Changing the layout
/// below requires bumping this, or previously signed entries stop verifying.
pub const ENTRY_ENCODING_VERSION: u8 = 1;

const ENTRY_DOMAIN: &[u8] = b"nuaudit/ledger-entry";

/// A nominal value paired with a non-negative epistemic margin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NuPair {
    pub nominal: f64,
    pub uncertainty: f64,
}

impl NuPair {
    /// Total epistemic collapse around zero: `(0, +inf)`.
    pub const COLLAPSED: NuPair = NuPair {
        nominal: 0.0,
        uncertainty: f64::INFINITY,
    };

    pub const fn new(nominal: f64, uncertainty: f64) -> Self {
        Self { nominal, uncertainty }
    }

    /// An exact value with zero uncertainty.
    pub const fn exact(nominal: f64) -> Self {
        Self::new(nominal, 0.0)
    }

    /// The "no usable information" sentinel `(default_nominal, +inf)`.
    pub const fn collapsed(default_nominal: f64) -> Self {
        Self::new(default_nominal, f64::INFINITY)
    }

    pub fn is_valid(&self) -> bool {
        validator::validate(self.nominal, self.uncertainty)
    }

    pub fn is_collapsed(&self) -> bool {
        self.uncertainty == f64::INFINITY
    }

    /// Coverage ratio `uncertainty / |nominal|`, `+inf` when nominal is zero.
    pub fn coverage(&self) -> f64 {
        coverage_ratio(self.nominal, self.uncertainty)
    }

    pub fn lower(&self) -> f64 {
        self.nominal - self.uncertainty
    }

    pub fn upper(&self) -> f64 {
        self.nominal + self.uncertainty
    }

    /// Whether `value` lies inside `[nominal - u, nominal + u]`.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower() && value <= self.upper()
    }
}

impl From<(f64, f64)> for NuPair {
    fn from((nominal, uncertainty): (f64, f64)) -> Self {
        Self::new(nominal, uncertainty)
    }
}

impl From<NuPair> for (f64, f64) {
    fn from(pair: NuPair) -> Self {
        (pair.nominal, pair.uncertainty)
    }
}

impl std::fmt::Display for NuPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} ± {})", self.nominal, self.uncertainty)
    }
}

/// Coverage ratio with `|nominal| = 0` mapped to `+inf`.
pub fn coverage_ratio(nominal: f64, uncertainty: f64) -> f64 {
    let magnitude = nominal.abs();
    if magnitude == 0.0 {
        f64::INFINITY
    } else {
        uncertainty / magnitude
    }
}

/// Name of a logged operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Add,
    Multiply,
    Compose,
    Catch,
    Flip,
    /// Any operation outside the arithmetic kernel.
    Custom(String),
}

impl Operation {
    /// Parse a canonical operation name; anything else becomes `Custom`
    /// verbatim, so `parse(op.as_str())` always reproduces the same bytes.
    pub fn parse(s: &str) -> Self {
        match s {
            "add" => Self::Add,
            "multiply" => Self::Multiply,
            "compose" => Self::Compose,
            "catch" => Self::Catch,
            "flip" => Self::Flip,
            _ => Self::Custom(s.to_string()),
        }
    }

    /// Canonical string representation (part of the signed encoding).
    pub fn as_str(&self) -> &str {
        match self {
            Self::Add => "add",
            Self::Multiply => "multiply",
            Self::Compose => "compose",
            Self::Catch => "catch",
            Self::Flip => "flip",
            Self::Custom(name) => name.as_str(),
        }
    }

    /// Number of input pairs a kernel operation takes; `None` for custom ones.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Self::Add | Self::Multiply | Self::Compose => Some(2),
            Self::Catch | Self::Flip => Some(1),
            Self::Custom(_) => None,
        }
    }
}

impl From<&str> for Operation {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for Operation {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.as_str().to_string()
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One logged operation. Created only by the ledger; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    timestamp: u64,
    op_id: Uuid,
    parent_id: Option<Uuid>,
    operation: Operation,
    inputs: Vec<NuPair>,
    output: NuPair,
    coverage: f64,
    invariant_passed: bool,
    #[serde(with = "hex_bytes")]
    signature: Vec<u8>,
}

impl LedgerEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        timestamp: u64,
        op_id: Uuid,
        parent_id: Option<Uuid>,
        operation: Operation,
        inputs: Vec<NuPair>,
        output: NuPair,
        coverage: f64,
        invariant_passed: bool,
        signature: Vec<u8>,
    ) -> Self {
        Self {
            timestamp,
            op_id,
            parent_id,
            operation,
            inputs,
            output,
            coverage,
            invariant_passed,
            signature,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn op_id(&self) -> Uuid {
        self.op_id
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn inputs(&self) -> &[NuPair] {
        &self.inputs
    }

    pub fn output(&self) -> NuPair {
        self.output
    }

    pub fn coverage(&self) -> f64 {
        self.coverage
    }

    pub fn invariant_passed(&self) -> bool {
        self.invariant_passed
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Length-prefixed big-endian encoding of every field except the
    /// signature. Floats are encoded by bit pattern so that NaN and the
    /// infinities hash deterministically.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.inputs.len() * 16);
        buf.extend_from_slice(ENTRY_DOMAIN);
        buf.push(ENTRY_ENCODING_VERSION);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(self.op_id.as_bytes());
        match self.parent_id {
            Some(parent) => {
                buf.push(1);
                buf.extend_from_slice(parent.as_bytes());
            }
            None => buf.push(0),
        }
        let name = self.operation.as_str().as_bytes();
        buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&(self.inputs.len() as u32).to_be_bytes());
        for pair in &self.inputs {
            push_pair(&mut buf, pair);
        }
        push_pair(&mut buf, &self.output);
        buf.extend_from_slice(&self.coverage.to_bits().to_be_bytes());
        buf.push(u8::from(self.invariant_passed));
        buf
    }

    /// SHA-256 over `canonical_bytes`; the value that is signed and that
    /// becomes this entry's Merkle leaf.
    pub fn content_hash(&self) -> [u8; 32] {
        sha256(&self.canonical_bytes())
    }

    pub(crate) fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }
}

fn push_pair(buf: &mut Vec<u8>, pair: &NuPair) {
    buf.extend_from_slice(&pair.nominal.to_bits().to_be_bytes());
    buf.extend_from_slice(&pair.uncertainty.to_bits().to_be_bytes());
}

/// SHA-256 digest of raw bytes.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// SHA-256 over the canonical (sorted-key, compact) form of a JSON document.
pub fn content_digest(obj: &serde_json::Value) -> [u8; 32] {
    sha256(canonical_json(obj).as_bytes())
}

/// Compute a deterministic content-addressable hash for a JSON document.
pub fn compute_content_hash(obj: &serde_json::Value) -> String {
    hex::encode(content_digest(obj))
}

/// Produce canonical JSON with deterministic key ordering.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let pairs: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", pairs.join(","))
        }
        serde_json::Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        _ => serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()),
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
