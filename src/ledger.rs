//! Signed, Merkle-backed, append-only operation ledger.
//!
//! A single `RwLock` guards the backend, the Merkle accumulator, the logical
//! clock and the op_id index. Appends take the write lock, so concurrent
//! writers queue; reads share the read lock and never observe a half-applied
//! append.

use crate::attestation::Attestation;
use crate::error::{NuError, NuResult};
use crate::merkle::{Hash, MerkleProof, MerkleTree};
use crate::signing::{PublicKey, SigningIdentity};
use crate::storage::{MemoryStorage, StorageBackend};
use crate::types::{LedgerEntry, NuPair, Operation};
use crate::verifier::{IntegrityReport, LedgerVerifier};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything a caller supplies for one append.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendRequest {
    pub operation: Operation,
    pub inputs: Vec<NuPair>,
    pub output: NuPair,
    pub coverage: f64,
    pub invariant_passed: bool,
    pub parent_id: Option<Uuid>,
    /// Position of an earlier request in the same batch to use as parent.
    /// Only meaningful for [`Ledger::append_batch`]; overrides `parent_id`.
    pub batch_parent: Option<usize>,
}

impl AppendRequest {
    /// Request with coverage and invariant status derived from `output`.
    pub fn new(operation: impl Into<Operation>, inputs: Vec<NuPair>, output: NuPair) -> Self {
        Self {
            operation: operation.into(),
            inputs,
            coverage: output.coverage(),
            invariant_passed: output.is_valid(),
            output,
            parent_id: None,
            batch_parent: None,
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_batch_parent(mut self, position: usize) -> Self {
        self.batch_parent = Some(position);
        self
    }

    pub fn with_invariant_passed(mut self, passed: bool) -> Self {
        self.invariant_passed = passed;
        self
    }
}

struct LedgerState<B> {
    backend: B,
    merkle: MerkleTree,
    clock: u64,
    index: HashMap<Uuid, usize>,
}

impl<B> LedgerState<B> {
    fn commit(&mut self, entry: &LedgerEntry, hash: Hash) {
        self.index.insert(entry.op_id(), self.merkle.len());
        self.merkle.append(hash);
        self.clock = entry.timestamp();
    }
}

fn next_timestamp(after: u64) -> NuResult<u64> {
    after.checked_add(1).ok_or(NuError::LedgerOrdering {
        previous: after,
        next: after,
    })
}

/// Append-only ledger over a pluggable storage backend.
pub struct Ledger<B: StorageBackend = MemoryStorage> {
    identity: SigningIdentity,
    state: RwLock<LedgerState<B>>,
}

impl Ledger<MemoryStorage> {
    /// Volatile ledger with a freshly generated key.
    pub fn in_memory() -> Self {
        Self::in_memory_with(SigningIdentity::generate())
    }

    pub fn in_memory_with(identity: SigningIdentity) -> Self {
        Self {
            identity,
            state: RwLock::new(LedgerState {
                backend: MemoryStorage::new(),
                merkle: MerkleTree::new(),
                clock: 0,
                index: HashMap::new(),
            }),
        }
    }
}

impl<B: StorageBackend> Ledger<B> {
    /// Open a ledger over `backend`, rebuilding the Merkle accumulator, the
    /// clock and the index from whatever it already holds.
    pub fn open(backend: B, identity: SigningIdentity) -> NuResult<Self> {
        let entries = backend.get_all()?;
        let mut state = LedgerState {
            backend,
            merkle: MerkleTree::new(),
            clock: 0,
            index: HashMap::with_capacity(entries.len()),
        };
        for entry in &entries {
            if !state.merkle.is_empty() && entry.timestamp() <= state.clock {
                return Err(NuError::LedgerOrdering {
                    previous: state.clock,
                    next: entry.timestamp(),
                });
            }
            state.commit(entry, entry.content_hash());
        }
        info!(
            backend = state.backend.name(),
            entries = entries.len(),
            root = %hex::encode(state.merkle.root()),
            "opened ledger"
        );
        Ok(Self {
            identity,
            state: RwLock::new(state),
        })
    }

    fn read(&self) -> NuResult<RwLockReadGuard<'_, LedgerState<B>>> {
        self.state.read().map_err(|_| NuError::LockPoisoned {
            resource: "ledger".to_string(),
        })
    }

    fn write(&self) -> NuResult<RwLockWriteGuard<'_, LedgerState<B>>> {
        self.state.write().map_err(|_| NuError::LockPoisoned {
            resource: "ledger".to_string(),
        })
    }

    /// Build and sign an entry. Touches no ledger state.
    fn seal(&self, request: AppendRequest, timestamp: u64) -> (LedgerEntry, Hash) {
        let unsigned = LedgerEntry::from_parts(
            timestamp,
            Uuid::new_v4(),
            request.parent_id,
            request.operation,
            request.inputs,
            request.output,
            request.coverage,
            request.invariant_passed,
            Vec::new(),
        );
        let hash = unsigned.content_hash();
        let signature = self.identity.sign(&hash);
        (unsigned.with_signature(signature), hash)
    }

    /// Append one entry.
    ///
    /// The entry is persisted before any in-memory state advances, so a
    /// storage failure leaves clock, index and Merkle root untouched.
    pub fn append(&self, request: AppendRequest) -> NuResult<LedgerEntry> {
        let mut state = self.write()?;
        if let Some(position) = request.batch_parent {
            return Err(NuError::InvalidParent {
                parent_id: format!("batch request #{}", position),
            });
        }
        if let Some(parent) = request.parent_id {
            if !state.index.contains_key(&parent) {
                return Err(NuError::InvalidParent {
                    parent_id: parent.to_string(),
                });
            }
        }
        let timestamp = next_timestamp(state.clock)?;
        let (entry, hash) = self.seal(request, timestamp);

        state.backend.append(&entry)?;
        state.commit(&entry, hash);
        debug!(
            op_id = %entry.op_id(),
            timestamp,
            operation = %entry.operation(),
            passed = entry.invariant_passed(),
            "appended ledger entry"
        );
        Ok(entry)
    }

    /// Append several entries under one lock and one backend write.
    ///
    /// A request may name an earlier request of the same batch as its parent
    /// through `batch_parent`. Either every entry is stored or none is.
    pub fn append_batch(&self, requests: Vec<AppendRequest>) -> NuResult<Vec<LedgerEntry>> {
        let mut state = self.write()?;
        let mut sealed: Vec<(LedgerEntry, Hash)> = Vec::with_capacity(requests.len());
        let mut clock = state.clock;

        for (position, mut request) in requests.into_iter().enumerate() {
            if let Some(earlier) = request.batch_parent.take() {
                let parent = sealed.get(earlier).map(|(e, _)| e.op_id()).ok_or_else(|| {
                    NuError::InvalidParent {
                        parent_id: format!("batch request #{} (named by #{})", earlier, position),
                    }
                })?;
                request.parent_id = Some(parent);
            } else if let Some(parent) = request.parent_id {
                if !state.index.contains_key(&parent) {
                    return Err(NuError::InvalidParent {
                        parent_id: parent.to_string(),
                    });
                }
            }
            clock = next_timestamp(clock)?;
            let (entry, hash) = self.seal(request, clock);
            sealed.push((entry, hash));
        }

        let entries: Vec<LedgerEntry> = sealed.iter().map(|(e, _)| e.clone()).collect();
        state.backend.append_batch(&entries)?;
        for (entry, hash) in &sealed {
            state.commit(entry, *hash);
        }
        info!(count = entries.len(), clock, "appended ledger batch");
        Ok(entries)
    }

    pub fn get(&self, op_id: &Uuid) -> NuResult<Option<LedgerEntry>> {
        self.read()?.backend.get(op_id)
    }

    /// Copies of every entry in append order.
    pub fn entries(&self) -> NuResult<Vec<LedgerEntry>> {
        self.read()?.backend.get_all()
    }

    pub fn len(&self) -> NuResult<usize> {
        Ok(self.read()?.merkle.len())
    }

    pub fn is_empty(&self) -> NuResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Causal chain ending at `op_id`, root ancestor first.
    pub fn trace(&self, op_id: &Uuid) -> NuResult<Vec<LedgerEntry>> {
        let state = self.read()?;
        let mut current = state.backend.get(op_id)?.ok_or_else(|| NuError::NotFound {
            op_id: op_id.to_string(),
        })?;

        let limit = state.merkle.len();
        let mut chain = Vec::new();
        while let Some(parent) = current.parent_id() {
            if chain.len() >= limit {
                return Err(NuError::LedgerIntegrity {
                    reason: format!("causal chain from {} does not terminate", op_id),
                });
            }
            let next = state.backend.get(&parent)?.ok_or_else(|| NuError::LedgerIntegrity {
                reason: format!("entry {} references missing parent {}", current.op_id(), parent),
            })?;
            chain.push(current);
            current = next;
        }
        chain.push(current);
        chain.reverse();
        Ok(chain)
    }

    /// Current Merkle root.
    pub fn get_root(&self) -> NuResult<Hash> {
        Ok(self.read()?.merkle.root())
    }

    pub fn root_hex(&self) -> NuResult<String> {
        Ok(hex::encode(self.get_root()?))
    }

    /// Inclusion proof for the entry `op_id`.
    pub fn prove(&self, op_id: &Uuid) -> NuResult<MerkleProof> {
        let state = self.read()?;
        let index = state.index.get(op_id).ok_or_else(|| NuError::NotFound {
            op_id: op_id.to_string(),
        })?;
        state.merkle.generate_proof(*index)
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    /// Full-history check against this ledger's own public key.
    pub fn verify_integrity(&self) -> bool {
        self.verify_integrity_with(Some(self.public_key()))
    }

    /// Full-history check; signatures are only checked when a key is given.
    pub fn verify_integrity_with(&self, public_key: Option<&PublicKey>) -> bool {
        self.integrity_report(public_key).success
    }

    /// Recompute ordering, causal links, the Merkle root and optionally
    /// every signature from stored entries. Never fails; problems are listed
    /// in the report.
    pub fn integrity_report(&self, public_key: Option<&PublicKey>) -> IntegrityReport {
        let verifier = match public_key {
            Some(key) => LedgerVerifier::with_public_key(*key),
            None => LedgerVerifier::new(),
        };
        let snapshot = self
            .read()
            .and_then(|state| Ok((state.backend.get_all()?, state.merkle.root())));
        match snapshot {
            Ok((entries, root)) => verifier.verify_entries(&entries, &root),
            Err(e) => {
                warn!(error = %e, "integrity check could not read ledger");
                IntegrityReport::unreadable(e.to_string())
            }
        }
    }

    /// Signed attestation of the current root, stamped with wall-clock
    /// seconds.
    pub fn attest_root(&self) -> NuResult<Attestation> {
        let root = self.get_root()?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(Attestation::create(
            format!("ledger:{}", self.public_key().fingerprint()),
            &root,
            timestamp,
            &self.identity,
        ))
    }
}

impl<B: StorageBackend> std::fmt::Debug for Ledger<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("public_key", self.public_key())
            .finish_non_exhaustive()
    }
}
