#![forbid(unsafe_code)]

//! RFC 6962 style Merkle tree hashing: `0x00` prefixed leaves, `0x01` prefixed
//! interior nodes, split at the largest power of two below the size.

use crate::canonical::{sha256, Hash32};

pub fn leaf_hash(data: &[u8]) -> Hash32 {
    let mut buf = Vec::with_capacity(1 + data.len());
    buf.push(0u8);
    buf.extend_from_slice(data);
    sha256(&buf)
}

pub fn node_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut buf = [0u8; 65];
    buf[0] = 1;
    buf[1..33].copy_from_slice(left);
    buf[33..65].copy_from_slice(right);
    sha256(&buf)
}

pub fn empty_root() -> Hash32 {
    sha256(b"")
}

fn largest_power_of_two_less_than(n: usize) -> usize {
    debug_assert!(n > 1);
    1usize << (usize::BITS - 1 - (n - 1).leading_zeros())
}

pub fn merkle_root(leaves: &[Hash32]) -> Hash32 {
    match leaves.len() {
        0 => empty_root(),
        1 => leaves[0],
        n => {
            let k = largest_power_of_two_less_than(n);
            node_hash(&merkle_root(&leaves[..k]), &merkle_root(&leaves[k..]))
        }
    }
}

/// Audit path for `leaf_index` in the tree over `leaves[..tree_size]`, bottom-up.
pub fn inclusion_proof(leaves: &[Hash32], leaf_index: usize, tree_size: usize) -> Option<Vec<Hash32>> {
    if tree_size == 0 || tree_size > leaves.len() || leaf_index >= tree_size {
        return None;
    }
    Some(inclusion_path(&leaves[..tree_size], leaf_index))
}

fn inclusion_path(leaves: &[Hash32], leaf_index: usize) -> Vec<Hash32> {
    if leaves.len() <= 1 {
        return Vec::new();
    }
    let k = largest_power_of_two_less_than(leaves.len());
    if leaf_index < k {
        let mut p = inclusion_path(&leaves[..k], leaf_index);
        p.push(merkle_root(&leaves[k..]));
        p
    } else {
        let mut p = inclusion_path(&leaves[k..], leaf_index - k);
        p.push(merkle_root(&leaves[..k]));
        p
    }
}

/// RFC 9162 §2.1.3.2 verification.
pub fn verify_inclusion(
    leaf: &Hash32,
    leaf_index: u64,
    tree_size: u64,
    audit_path: &[Hash32],
    root: &Hash32,
) -> bool {
    if tree_size == 0 || leaf_index >= tree_size {
        return false;
    }
    let mut fn_idx = leaf_index;
    let mut sn_idx = tree_size - 1;
    let mut hash = *leaf;
    for sibling in audit_path {
        if sn_idx == 0 {
            return false;
        }
        if fn_idx & 1 == 1 || fn_idx == sn_idx {
            hash = node_hash(sibling, &hash);
            if fn_idx & 1 == 0 {
                while fn_idx & 1 == 0 && fn_idx != 0 {
                    fn_idx >>= 1;
                    sn_idx >>= 1;
                }
            }
        } else {
            hash = node_hash(&hash, sibling);
        }
        fn_idx >>= 1;
        sn_idx >>= 1;
    }
    sn_idx == 0 && &hash == root
}

/// Incremental root: keeps one perfect-subtree root per set bit of the size,
/// so appends and root reads are O(log n).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleFrontier {
    peaks: Vec<(u32, Hash32)>,
    size: u64,
}

impl MerkleFrontier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn push(&mut self, leaf: Hash32) {
        let mut carry = (0u32, leaf);
        while let Some(&(height, left)) = self.peaks.last() {
            if height != carry.0 {
                break;
            }
            self.peaks.pop();
            carry = (height + 1, node_hash(&left, &carry.1));
        }
        self.peaks.push(carry);
        self.size += 1;
    }

    /// Audit path, bottom-up, for the leaf the next `push` will add. The left
    /// siblings of the rightmost leaf are exactly the current peaks.
    pub fn append_path(&self) -> Vec<Hash32> {
        self.peaks.iter().rev().map(|&(_, peak)| peak).collect()
    }

    pub fn root(&self) -> Hash32 {
        let mut iter = self.peaks.iter().rev();
        let Some(&(_, mut acc)) = iter.next() else {
            return empty_root();
        };
        for (_, peak) in iter {
            acc = node_hash(peak, &acc);
        }
        acc
    }
}
