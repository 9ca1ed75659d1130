//! Merkle tree arithmetic for v2 torrents.
//!
//! A v2 torrent hashes each file as a binary SHA-256 tree whose leaves are
//! the 16 KiB block hashes of the file. The leaf layer is padded to a power
//! of two; the pad value depends on the layer: block layers pad with the
//! all-zero hash, while the piece layer pads with the root of an all-zero
//! subtree covering one full piece (see [`merkle_pad`]).

use sha2::{Digest, Sha256};

use crate::Sha256Hash;

/// The number of leaves in the padded leaf layer for `n` real leaves: the
/// next power of two, and at least one.
pub fn merkle_num_leafs(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Computes the root over the given leaves, padded with the all-zero hash to
/// the next power of two.
pub fn merkle_root(leaves: &[Sha256Hash]) -> Sha256Hash {
    merkle_root_padded(leaves, merkle_num_leafs(leaves.len()), [0; 32])
}

/// Computes the root of a tree with `num_leafs` leaves, where the first
/// `leaves.len()` are given and the rest take the value `pad`.
///
/// # Panics
///
/// Panics if `num_leafs` is not a power of two or is smaller than the number
/// of given leaves.
pub fn merkle_root_padded(
    leaves: &[Sha256Hash],
    num_leafs: usize,
    pad: Sha256Hash,
) -> Sha256Hash {
    assert!(num_leafs.is_power_of_two());
    assert!(num_leafs >= leaves.len());

    let mut level: Vec<Sha256Hash> = leaves.to_vec();
    let mut pad = pad;
    let mut width = num_leafs;
    while width > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = if pair.len() == 2 { pair[1] } else { pad };
            next.push(combine(&pair[0], &right));
        }
        pad = combine(&pad, &pad);
        level = next;
        width /= 2;
    }
    // an entirely padded tree reduces to the accumulated pad value
    level.first().copied().unwrap_or(pad)
}

/// The pad hash for one layer above a subtree of `num_leafs` all-zero
/// leaves. The piece layer of a file uses
/// `merkle_pad(piece_length / BLOCK_LEN)` so that a partial tail piece
/// combines with the same value a fully zero piece would produce.
pub fn merkle_pad(mut num_leafs: usize) -> Sha256Hash {
    assert!(num_leafs.is_power_of_two());
    let mut hash: Sha256Hash = [0; 32];
    while num_leafs > 1 {
        hash = combine(&hash, &hash);
        num_leafs /= 2;
    }
    hash
}

fn combine(left: &Sha256Hash, right: &Sha256Hash) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(fill: u8) -> Sha256Hash {
        [fill; 32]
    }

    #[test]
    fn test_num_leafs() {
        assert_eq!(merkle_num_leafs(0), 1);
        assert_eq!(merkle_num_leafs(1), 1);
        assert_eq!(merkle_num_leafs(2), 2);
        assert_eq!(merkle_num_leafs(3), 4);
        assert_eq!(merkle_num_leafs(5), 8);
    }

    #[test]
    fn test_single_leaf_is_its_own_root() {
        assert_eq!(merkle_root(&[leaf(0xaa)]), leaf(0xaa));
    }

    #[test]
    fn test_two_leaves() {
        let expected = combine(&leaf(1), &leaf(2));
        assert_eq!(merkle_root(&[leaf(1), leaf(2)]), expected);
    }

    #[test]
    fn test_three_leaves_pad_with_zero() {
        let left = combine(&leaf(1), &leaf(2));
        let right = combine(&leaf(3), &leaf(0));
        assert_eq!(
            merkle_root(&[leaf(1), leaf(2), leaf(3)]),
            combine(&left, &right)
        );
    }

    #[test]
    fn test_pad_matches_zero_tree() {
        for &n in &[1usize, 2, 4, 8, 16] {
            assert_eq!(merkle_pad(n), merkle_root_padded(&[], n, [0; 32]));
        }
    }

    #[test]
    fn test_padded_tail_piece() {
        // a tree sized for 4 leaves where only 3 exist, padded with the
        // piece pad, must equal the explicit construction
        let pad = merkle_pad(1);
        let left = combine(&leaf(7), &leaf(8));
        let right = combine(&leaf(9), &pad);
        assert_eq!(
            merkle_root_padded(&[leaf(7), leaf(8), leaf(9)], 4, pad),
            combine(&left, &right)
        );
    }
}
