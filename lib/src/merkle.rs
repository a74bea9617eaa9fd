//! Binary Merkle trees over 32-byte leaves, hashed with SHA-256 truncated
//! to 254 bits so every node is a valid field element on chain.

use alloy_primitives::B256;
use sha2::{Digest, Sha256};

use crate::primitives::{tree_height, LEAF_SIZE};
use crate::zerocomm::zero_comm;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MerkleError {
    #[error("leaf index {0} out of range for {1} leaves")]
    LeafOutOfRange(u64, u64),
    #[error("subroot layout is not aligned at level {0}, offset {1}")]
    MisalignedSubroot(u32, u64),
    #[error("no subroot covers leaf offset {0}")]
    UncoveredLeaf(u64),
}

/// Hash two nodes into their parent, clearing the two high bits of the
/// trailing byte (SHA2-254).
pub fn hash_pair(left: &B256, right: &B256) -> B256 {
    let mut hasher = Sha256::new();
    hasher.update(left.as_slice());
    hasher.update(right.as_slice());
    let mut out: [u8; 32] = hasher.finalize().into();
    out[31] &= 0x3f;
    B256::from(out)
}

/// A single possession proof: the challenged leaf and its sibling path up
/// to the piece root. The leaf's absolute index selects left/right at each
/// level during verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf: B256,
    pub path: Vec<B256>,
    pub index: u64,
}

impl MerkleProof {
    /// Recompute the root from the leaf and sibling path.
    pub fn compute_root(&self) -> B256 {
        let mut node = self.leaf;
        let mut index = self.index;
        for sibling in &self.path {
            node = if index & 1 == 1 {
                hash_pair(sibling, &node)
            } else {
                hash_pair(&node, sibling)
            };
            index >>= 1;
        }
        node
    }

    pub fn verify(&self, root: &B256) -> bool {
        self.compute_root() == *root
    }
}

/// A fully materialized tree, leaves up to root. Sized for subroots (at
/// most a few GiB of data), not whole sectors.
#[derive(Debug)]
pub struct MerkleTree {
    /// levels[0] = leaves, levels.last() = [root]
    levels: Vec<Vec<B256>>,
}

impl MerkleTree {
    /// Build from a power-of-two leaf slice.
    pub fn from_leaves(leaves: Vec<B256>) -> Self {
        debug_assert!(leaves.len().is_power_of_two());
        let mut levels = vec![leaves];
        while levels.last().unwrap().len() > 1 {
            let below = levels.last().unwrap();
            let mut level = Vec::with_capacity(below.len() / 2);
            for pair in below.chunks_exact(2) {
                level.push(hash_pair(&pair[0], &pair[1]));
            }
            levels.push(level);
        }
        Self { levels }
    }

    /// Build from raw bytes, zero-padding to `padded_leaves` (a power of
    /// two) 32-byte leaves.
    pub fn from_padded_bytes(data: &[u8], padded_leaves: u64) -> Self {
        let mut leaves = Vec::with_capacity(padded_leaves as usize);
        for chunk in data.chunks(LEAF_SIZE as usize) {
            let mut leaf = [0u8; 32];
            leaf[..chunk.len()].copy_from_slice(chunk);
            leaves.push(B256::from(leaf));
        }
        leaves.resize(padded_leaves as usize, B256::ZERO);
        Self::from_leaves(leaves)
    }

    pub fn root(&self) -> B256 {
        self.levels.last().unwrap()[0]
    }

    pub fn leaf_count(&self) -> u64 {
        self.levels[0].len() as u64
    }

    /// Leaf value plus sibling path from the leaf to this tree's root.
    pub fn proof(&self, index: u64) -> Result<MerkleProof, MerkleError> {
        let leaves = self.leaf_count();
        if index >= leaves {
            return Err(MerkleError::LeafOutOfRange(index, leaves));
        }
        let mut path = Vec::with_capacity(self.levels.len() - 1);
        let mut pos = index as usize;
        for level in &self.levels[..self.levels.len() - 1] {
            path.push(level[pos ^ 1]);
            pos >>= 1;
        }
        Ok(MerkleProof {
            leaf: self.levels[0][index as usize],
            path,
            index,
        })
    }
}

/// One subroot of a piece: a precomputed subtree root covering
/// `leaves` (a power of two) leaves starting at an aligned `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subroot {
    pub root: B256,
    pub offset: u64,
    pub leaves: u64,
}

impl Subroot {
    pub fn height(&self) -> u32 {
        tree_height(self.leaves)
    }

    pub fn contains(&self, leaf: u64) -> bool {
        leaf >= self.offset && leaf < self.offset + self.leaves
    }
}

/// The partial top tree over a piece's subroots. Nodes not covered by any
/// subroot are zero commitments; equal-level merges keep the lower offset
/// on the left.
#[derive(Debug)]
pub struct TopTree<'a> {
    subroots: &'a [Subroot],
    /// leaf count of the whole piece tree, power of two
    span: u64,
}

impl<'a> TopTree<'a> {
    /// `subroots` must be sorted by offset with power-of-two sizes aligned
    /// to their own size.
    pub fn new(subroots: &'a [Subroot]) -> Result<Self, MerkleError> {
        let end = subroots
            .last()
            .map(|s| s.offset + s.leaves)
            .unwrap_or(1)
            .max(1);
        for s in subroots {
            if !s.leaves.is_power_of_two() || s.offset % s.leaves != 0 {
                return Err(MerkleError::MisalignedSubroot(
                    s.leaves.trailing_zeros(),
                    s.offset,
                ));
            }
        }
        Ok(Self {
            subroots,
            span: end.next_power_of_two(),
        })
    }

    pub fn height(&self) -> u32 {
        tree_height(self.span)
    }

    /// Hash of the node at `level` whose subtree starts at leaf `start`.
    fn node(&self, level: u32, start: u64) -> Result<B256, MerkleError> {
        let width = 1u64 << level;
        if let Some(s) = self
            .subroots
            .iter()
            .find(|s| s.offset == start && s.leaves == width)
        {
            return Ok(s.root);
        }
        let data_end = self
            .subroots
            .last()
            .map(|s| s.offset + s.leaves)
            .unwrap_or(0);
        if start >= data_end {
            return Ok(zero_comm(level));
        }
        if level == 0 {
            // A leaf inside the data range must belong to some subroot.
            return Err(MerkleError::UncoveredLeaf(start));
        }
        let half = width / 2;
        let left = self.node(level - 1, start)?;
        let right = self.node(level - 1, start + half)?;
        Ok(hash_pair(&left, &right))
    }

    pub fn root(&self) -> Result<B256, MerkleError> {
        self.node(self.height(), 0)
    }

    /// Sibling path from the given subroot's node up to the piece root,
    /// to be appended to a within-subroot proof.
    pub fn path_from(&self, subroot: &Subroot) -> Result<Vec<B256>, MerkleError> {
        let mut path = Vec::new();
        let mut level = subroot.height();
        let mut start = subroot.offset;
        while level < self.height() {
            let width = 1u64 << level;
            let sibling_start = if (start / width) % 2 == 0 {
                start + width
            } else {
                start - width
            };
            path.push(self.node(level, sibling_start)?);
            start = (start / (width * 2)) * (width * 2);
            level += 1;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u64) -> Vec<B256> {
        (0..n)
            .map(|i| {
                let mut leaf = [0u8; 32];
                leaf[..8].copy_from_slice(&i.to_be_bytes());
                B256::from(leaf)
            })
            .collect()
    }

    #[test]
    fn single_leaf_tree() {
        let tree = MerkleTree::from_leaves(leaves(1));
        assert_eq!(tree.root(), tree.levels[0][0]);
        let proof = tree.proof(0).unwrap();
        assert!(proof.path.is_empty());
        assert!(proof.verify(&tree.root()));
    }

    #[test]
    fn proofs_verify_and_reject_tampering() {
        let tree = MerkleTree::from_leaves(leaves(16));
        let root = tree.root();
        for index in 0..16 {
            let mut proof = tree.proof(index).unwrap();
            assert!(proof.verify(&root), "leaf {index}");
            // Flip one bit of the leaf.
            let mut raw = proof.leaf.0;
            raw[0] ^= 0x01;
            proof.leaf = B256::from(raw);
            assert!(!proof.verify(&root), "tampered leaf {index}");
        }
    }

    #[test]
    fn proof_out_of_range() {
        let tree = MerkleTree::from_leaves(leaves(4));
        assert_eq!(tree.proof(4), Err(MerkleError::LeafOutOfRange(4, 4)));
    }

    #[test]
    fn padded_bytes_tree_pads_with_zeros() {
        let data = vec![0xaau8; 40]; // 2 leaves of data, second partial
        let tree = MerkleTree::from_padded_bytes(&data, 4);
        assert_eq!(tree.leaf_count(), 4);
        let mut second = [0u8; 32];
        second[..8].copy_from_slice(&[0xaa; 8]);
        assert_eq!(tree.levels[0][1], B256::from(second));
        assert_eq!(tree.levels[0][2], B256::ZERO);
        assert_eq!(tree.levels[0][3], B256::ZERO);
    }

    #[test]
    fn top_tree_matches_flat_tree() {
        // Two 4-leaf subroots followed by a 2-leaf subroot; piece spans 16
        // padded leaves, the tail filled with zero commitments.
        let all = leaves(10);
        let sub_a = MerkleTree::from_leaves(all[0..4].to_vec());
        let sub_b = MerkleTree::from_leaves(all[4..8].to_vec());
        let sub_c = MerkleTree::from_leaves(all[8..10].to_vec());
        let subroots = vec![
            Subroot {
                root: sub_a.root(),
                offset: 0,
                leaves: 4,
            },
            Subroot {
                root: sub_b.root(),
                offset: 4,
                leaves: 4,
            },
            Subroot {
                root: sub_c.root(),
                offset: 8,
                leaves: 2,
            },
        ];
        let top = TopTree::new(&subroots).unwrap();

        let mut flat = all.clone();
        flat.resize(16, B256::ZERO);
        let reference = MerkleTree::from_leaves(flat);
        assert_eq!(top.root().unwrap(), reference.root());
    }

    #[test]
    fn combined_proof_reaches_piece_root() {
        let all = leaves(12);
        let sub_a = MerkleTree::from_leaves(all[0..8].to_vec());
        let sub_b = MerkleTree::from_leaves(all[8..12].to_vec());
        let subroots = vec![
            Subroot {
                root: sub_a.root(),
                offset: 0,
                leaves: 8,
            },
            Subroot {
                root: sub_b.root(),
                offset: 8,
                leaves: 4,
            },
        ];
        let top = TopTree::new(&subroots).unwrap();
        let piece_root = top.root().unwrap();

        // Challenge leaf 9, inside the second subroot.
        let mut proof = sub_b.proof(1).unwrap();
        proof.index = 9;
        proof.path.extend(top.path_from(&subroots[1]).unwrap());
        assert!(proof.verify(&piece_root));
    }

    #[test]
    fn misaligned_subroot_rejected() {
        let subroots = vec![Subroot {
            root: B256::ZERO,
            offset: 2,
            leaves: 4,
        }];
        assert!(matches!(
            TopTree::new(&subroots),
            Err(MerkleError::MisalignedSubroot(2, 2))
        ));
    }
}
