//! BLAKE2b hashing with domain-separated type tags, mirroring the teacher's
//! `crypto::Hash` (leaf/parent/root/key hashing), ported from `blake2-rfc` to `blake2`.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use byteorder::{BigEndian, WriteBytesExt};

use crate::tree::Node;

type Blake2b256 = Blake2b<U32>;

// https://en.wikipedia.org/wiki/Merkle_tree#Second_preimage_attack
const LEAF_TYPE: &[u8] = b"0";
const PARENT_TYPE: &[u8] = b"1";
const ROOT_TYPE: &[u8] = b"2";
const HYPERCORE: &[u8] = b"hypercore";

/// Hash a leaf block's bytes, domain-separated from parent/root hashes.
pub fn hash_leaf(data: &[u8]) -> [u8; 32] {
    let mut size = Vec::with_capacity(8);
    size.write_u64::<BigEndian>(data.len() as u64).unwrap();

    let mut hasher = Blake2b256::new();
    hasher.update(LEAF_TYPE);
    hasher.update(&size);
    hasher.update(data);
    hasher.finalize().into()
}

/// Combine two child hashes into their parent's hash.
pub fn hash_parent(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut size = Vec::with_capacity(8);
    size.write_u64::<BigEndian>(64).unwrap();

    let mut hasher = Blake2b256::new();
    hasher.update(PARENT_TYPE);
    hasher.update(&size);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Hash the current Merkle roots together. Used as the content signed at each fork/length,
/// and as the deterministic `treeHash(length)` value.
pub fn hash_roots(roots: &[Node]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(ROOT_TYPE);
    for node in roots {
        let mut position = Vec::with_capacity(8);
        position.write_u64::<BigEndian>(node.index).unwrap();
        let mut len = Vec::with_capacity(8);
        len.write_u64::<BigEndian>(node.byte_length).unwrap();
        hasher.update(node.hash);
        hasher.update(&position);
        hasher.update(&len);
    }
    hasher.finalize().into()
}

/// Derive a log's discovery key from its public key: a value any peer can compute to rendezvous
/// on, without revealing the public key to someone who doesn't already have it.
pub fn discovery_key(public_key: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(HYPERCORE);
    hasher.update(public_key);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_hash_is_deterministic() {
        assert_eq!(hash_leaf(b"hello"), hash_leaf(b"hello"));
        assert_ne!(hash_leaf(b"hello"), hash_leaf(b"world"));
    }

    #[test]
    fn discovery_key_does_not_leak_public_key() {
        let key = [7u8; 32];
        let dk = discovery_key(&key);
        assert_ne!(dk, key);
        assert_eq!(dk, discovery_key(&key));
    }
}
