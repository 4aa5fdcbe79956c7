//! Incremental binary Merkle tree over entry hashes.
//!
//! Node hash is `SHA-256(left || right)`. A level with an odd number of
//! nodes pairs its last node with itself. A single leaf is its own root and
//! the empty tree's root is `SHA-256("")`.

use crate::error::{NuError, NuResult};
use crate::types::sha256;
use serde::{Deserialize, Serialize};

pub type Hash = [u8; 32];

/// Side on which a sibling sits relative to the running hash.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
}

/// Inclusion proof for one leaf.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub leaf_hash: Hash,
    pub path: Vec<(Hash, Direction)>,
    pub root: Hash,
}

impl MerkleProof {
    /// Recompute the path from the leaf and compare with the recorded root.
    pub fn verify(&self) -> bool {
        self.verify_against(&self.root)
    }

    /// Verify against an externally trusted root.
    pub fn verify_against(&self, root: &Hash) -> bool {
        let computed = self
            .path
            .iter()
            .fold(self.leaf_hash, |acc, (sibling, side)| match side {
                Direction::Left => hash_pair(sibling, &acc),
                Direction::Right => hash_pair(&acc, sibling),
            });
        &computed == root
    }
}

/// Append-only Merkle accumulator keeping every level so proofs can be
/// produced without rehashing.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_leaves(leaves: &[Hash]) -> Self {
        let mut tree = Self::new();
        for leaf in leaves {
            tree.append(*leaf);
        }
        tree
    }

    pub fn len(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a leaf and refresh the nodes on its path. O(log n).
    pub fn append(&mut self, leaf: Hash) -> Hash {
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(leaf);

        let mut depth = 0;
        let mut index = self.levels[0].len() - 1;
        while self.levels[depth].len() > 1 {
            let level = &self.levels[depth];
            let left_index = index & !1;
            let left = level[left_index];
            let right = level.get(left_index + 1).copied().unwrap_or(left);
            let parent = hash_pair(&left, &right);

            if self.levels.len() == depth + 1 {
                self.levels.push(Vec::new());
            }
            let parent_index = index / 2;
            let next = &mut self.levels[depth + 1];
            if parent_index < next.len() {
                next[parent_index] = parent;
            } else {
                next.push(parent);
            }
            depth += 1;
            index = parent_index;
        }
        self.root()
    }

    /// Current root. O(1).
    pub fn root(&self) -> Hash {
        match self.levels.last() {
            Some(top) if !top.is_empty() => top[0],
            _ => empty_root(),
        }
    }

    pub fn leaf(&self, index: usize) -> Option<Hash> {
        self.levels.first().and_then(|leaves| leaves.get(index).copied())
    }

    /// Inclusion proof for the leaf at `index`. O(log n).
    pub fn generate_proof(&self, index: usize) -> NuResult<MerkleProof> {
        let leaf_hash = self.leaf(index).ok_or_else(|| NuError::NotFound {
            op_id: format!("merkle leaf #{}", index),
        })?;

        let mut path = Vec::with_capacity(self.levels.len());
        let mut position = index;
        for level in &self.levels {
            if level.len() <= 1 {
                break;
            }
            let (sibling, side) = if position % 2 == 0 {
                let sibling = level.get(position + 1).copied().unwrap_or(level[position]);
                (sibling, Direction::Right)
            } else {
                (level[position - 1], Direction::Left)
            };
            path.push((sibling, side));
            position /= 2;
        }

        Ok(MerkleProof {
            leaf_index: index,
            leaf_hash,
            path,
            root: self.root(),
        })
    }
}

/// Root of `leaves` computed level by level from scratch. Agrees with
/// [`MerkleTree::root`] for the same sequence.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return empty_root();
    }
    let mut level: Vec<Hash> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    level[0]
}

pub fn empty_root() -> Hash {
    sha256(&[])
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut concat = [0u8; 64];
    concat[..32].copy_from_slice(left);
    concat[32..].copy_from_slice(right);
    sha256(&concat)
}
