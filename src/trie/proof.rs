//! Range proof verification.
//!
//! A range proof demonstrates that a batch of key/value pairs is exactly the
//! trie content inside `[first, last]`, using only the merkle paths of the
//! two boundary keys. The verifier rebuilds the root: subtrees hanging left
//! of `first`'s path and right of `last`'s path are grafted by hash, the
//! claimed range fills the middle, and the resulting hash must equal the
//! trie root. Everything is reconstructed from caller-supplied bytes, so all
//! failure modes are errors, never panics.
use crate::traits::NodeReader;
use crate::trie::node::{decode_node, DecodedNode, Nibbles, TrieError, EMPTY_ROOT};
use crate::trie::trie::MemTrie;
use alloy_primitives::{keccak256, B256};
use thiserror::Error;

/// Error type for range proof verification.
#[derive(Debug, Error)]
pub enum ProofError {
    /// The caller-supplied range is malformed (unordered or out-of-bound
    /// keys, mismatched lengths).
    #[error("invalid proof range: {0}")]
    InvalidRange(&'static str),
    /// A node on a boundary path is absent from the proof set.
    #[error("missing proof node {0}")]
    MissingNode(B256),
    /// A proof blob failed to decode or did not hash to its key.
    #[error("corrupt proof node: {0}")]
    Corrupt(String),
    /// The trie holds entries inside the range that the batch does not
    /// account for.
    #[error("unexpected entries inside the proven range")]
    UnexpectedContent,
    /// The reconstructed root does not match the trie root.
    #[error("range does not reproduce the trie root (have {have}, want {want})")]
    RootMismatch {
        /// Root reconstructed from proofs and batch.
        have: B256,
        /// Root the range was proven against.
        want: B256,
    },
}

impl From<TrieError> for ProofError {
    fn from(err: TrieError) -> Self {
        match err {
            TrieError::MissingNode(hash) => ProofError::MissingNode(hash),
            TrieError::IntoUnresolved => ProofError::UnexpectedContent,
            TrieError::Corrupt(msg) => ProofError::Corrupt(msg),
            TrieError::OutOfOrder => ProofError::InvalidRange("keys out of order"),
        }
    }
}

/// What a boundary-path walk learned about the trie.
struct EdgeWalk {
    /// Subtree hashes strictly left of the walked path: `(path, hash)`.
    left: Vec<(Nibbles, B256)>,
    /// Subtree hashes strictly right of the walked path.
    right: Vec<(Nibbles, B256)>,
    /// The leaf the walk terminated at, if any (its key may differ from the
    /// walked key).
    boundary: Option<(B256, Vec<u8>)>,
}

/// Resolves a proof node, verifying content addressing.
fn resolve_proof(proof: &dyn NodeReader, hash: &B256) -> Result<DecodedNode, ProofError> {
    let blob = proof.node(hash).ok_or(ProofError::MissingNode(*hash))?;
    if keccak256(&blob) != *hash {
        return Err(ProofError::Corrupt(format!(
            "proof blob does not hash to {hash}"
        )));
    }
    Ok(decode_node(&blob)?)
}

/// Walks the merkle path of `key` through the proof set, recording the
/// subtree hashes on both sides of the path.
fn walk_edge(proof: &dyn NodeReader, root: B256, key: &B256) -> Result<EdgeWalk, ProofError> {
    let mut walk = EdgeWalk {
        left: Vec::new(),
        right: Vec::new(),
        boundary: None,
    };
    let path = Nibbles::unpack(key);
    let mut prefix = Nibbles::default();
    let mut hash = root;
    loop {
        let depth = prefix.len();
        match resolve_proof(proof, &hash)? {
            DecodedNode::Empty => {
                if depth != 0 {
                    return Err(ProofError::Corrupt("interior empty node".into()));
                }
                break;
            }
            DecodedNode::Leaf { rest, value } => {
                if depth + rest.len() != 64 {
                    return Err(ProofError::Corrupt("leaf path length mismatch".into()));
                }
                walk.boundary = Some((prefix.concat(&rest).pack(), value));
                break;
            }
            DecodedNode::Branch { children } => {
                if depth >= 64 {
                    return Err(ProofError::Corrupt("branch chain exceeds key depth".into()));
                }
                let target = path[depth] as usize;
                for (i, child) in children.iter().enumerate() {
                    if let Some(child) = child {
                        if i < target {
                            walk.left.push((prefix.join(i as u8), *child));
                        } else if i > target {
                            walk.right.push((prefix.join(i as u8), *child));
                        }
                    }
                }
                match children[target] {
                    Some(child) => {
                        prefix.push(target as u8);
                        hash = child;
                    }
                    None => break,
                }
            }
        }
    }
    Ok(walk)
}

/// Verifies that `keys`/`vals` are exactly the content of the trie at `root`
/// within `[first, last]`, as demonstrated by the boundary proofs in `proof`.
///
/// Returns `Ok(has_more)` on success, where `has_more` indicates the trie
/// holds at least one key strictly greater than `last`. An empty batch must
/// pass `last = None` and proves the trie holds no key `>= first` at all.
pub fn verify_range_proof(
    root: B256,
    first: &B256,
    last: Option<&B256>,
    keys: &[B256],
    vals: &[Vec<u8>],
    proof: &dyn NodeReader,
) -> Result<bool, ProofError> {
    if keys.len() != vals.len() {
        return Err(ProofError::InvalidRange("key and value counts differ"));
    }
    for pair in keys.windows(2) {
        if pair[0] >= pair[1] {
            return Err(ProofError::InvalidRange("keys out of order"));
        }
    }
    let last = match (keys.is_empty(), last) {
        (true, None) => {
            // Empty range: the proof of `first` must show the trie holds
            // nothing at or after it.
            if root == *EMPTY_ROOT {
                return Ok(false);
            }
            let walk = walk_edge(proof, root, first)?;
            if !walk.right.is_empty() {
                return Err(ProofError::UnexpectedContent);
            }
            if let Some((key, _)) = walk.boundary {
                if key >= *first {
                    return Err(ProofError::UnexpectedContent);
                }
            }
            return Ok(false);
        }
        (true, Some(_)) => {
            return Err(ProofError::InvalidRange("empty range carries a last key"))
        }
        (false, None) => return Err(ProofError::InvalidRange("missing last key")),
        (false, Some(last)) => last,
    };
    if first > last {
        return Err(ProofError::InvalidRange("inverted range bounds"));
    }
    if keys[0] < *first || *keys.last().expect("keys non-empty") > *last {
        return Err(ProofError::InvalidRange("keys outside the range bounds"));
    }

    let first_walk = walk_edge(proof, root, first)?;
    let last_walk = walk_edge(proof, root, last)?;
    let mut has_more = !last_walk.right.is_empty();

    // Rebuild the trie: opaque subtrees outside the range, claimed entries
    // inside it.
    let mut rebuilt = MemTrie::new();
    for (path, hash) in &first_walk.left {
        rebuilt.insert_graft(path, *hash)?;
    }
    for (path, hash) in &last_walk.right {
        rebuilt.insert_graft(path, *hash)?;
    }
    if let Some((key, value)) = first_walk.boundary {
        if key < *first {
            rebuilt.insert(&key, value)?;
        }
    }
    if let Some((key, value)) = last_walk.boundary {
        if key > *last {
            rebuilt.insert(&key, value)?;
            has_more = true;
        }
    }
    for (key, value) in keys.iter().zip(vals) {
        rebuilt.insert(key, value.clone())?;
    }
    let have = rebuilt.hash();
    if have != root {
        return Err(ProofError::RootMismatch { have, want: root });
    }
    Ok(has_more)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_store::MemStore;
    use crate::trie::trie::Trie;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn fixture(n: usize, seed: u64) -> (MemStore, B256, Vec<(B256, Vec<u8>)>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut entries: Vec<(B256, Vec<u8>)> = (0..n)
            .map(|_| {
                let key = B256::from(rng.gen::<[u8; 32]>());
                let value: Vec<u8> = (0..rng.gen_range(1..32)).map(|_| rng.gen()).collect();
                (key, value)
            })
            .collect();
        entries.sort_by_key(|(k, _)| *k);
        entries.dedup_by_key(|(k, _)| *k);

        let store = MemStore::new();
        let mut trie = MemTrie::new();
        for (k, v) in &entries {
            trie.insert(k, v.clone()).unwrap();
        }
        let root = trie.commit(&store);
        (store, root, entries)
    }

    fn prove_bounds(store: &MemStore, root: B256, first: &B256, last: Option<&B256>) -> MemStore {
        let proof = MemStore::new();
        let trie = Trie::new(root, store).unwrap();
        trie.prove(first, &proof).unwrap();
        if let Some(last) = last {
            trie.prove(last, &proof).unwrap();
        }
        proof
    }

    #[test]
    fn whole_range_verifies() {
        let (store, root, entries) = fixture(256, 10);
        let keys: Vec<B256> = entries.iter().map(|(k, _)| *k).collect();
        let vals: Vec<Vec<u8>> = entries.iter().map(|(_, v)| v.clone()).collect();
        let first = B256::ZERO;
        let last = *keys.last().unwrap();
        let proof = prove_bounds(&store, root, &first, Some(&last));
        let more = verify_range_proof(root, &first, Some(&last), &keys, &vals, &proof).unwrap();
        assert!(!more);
    }

    #[test]
    fn chunked_ranges_verify_and_signal_more() {
        let (store, root, entries) = fixture(300, 11);
        let chunk = 64;
        let mut origin = B256::ZERO;
        let mut covered = 0;
        loop {
            let batch: Vec<_> = entries
                .iter()
                .filter(|(k, _)| *k >= origin)
                .take(chunk)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            let keys: Vec<B256> = batch.iter().map(|(k, _)| *k).collect();
            let vals: Vec<Vec<u8>> = batch.iter().map(|(_, v)| v.clone()).collect();
            let last = *keys.last().unwrap();
            let proof = prove_bounds(&store, root, &origin, Some(&last));
            let more =
                verify_range_proof(root, &origin, Some(&last), &keys, &vals, &proof).unwrap();
            covered += batch.len();
            assert_eq!(more, covered < entries.len());
            if !more {
                break;
            }
            // Next chunk starts just past the last proven key.
            let mut next = last;
            for byte in next.as_mut_slice().iter_mut().rev() {
                *byte = byte.wrapping_add(1);
                if *byte != 0 {
                    break;
                }
            }
            origin = next;
        }
        assert_eq!(covered, entries.len());
    }

    #[test]
    fn tampered_value_is_rejected() {
        let (store, root, entries) = fixture(128, 12);
        let keys: Vec<B256> = entries.iter().map(|(k, _)| *k).collect();
        let mut vals: Vec<Vec<u8>> = entries.iter().map(|(_, v)| v.clone()).collect();
        vals[7] = b"tampered".to_vec();
        let first = B256::ZERO;
        let last = *keys.last().unwrap();
        let proof = prove_bounds(&store, root, &first, Some(&last));
        assert!(matches!(
            verify_range_proof(root, &first, Some(&last), &keys, &vals, &proof),
            Err(ProofError::RootMismatch { .. })
        ));
    }

    #[test]
    fn dropped_entry_is_rejected() {
        let (store, root, entries) = fixture(128, 13);
        let mut keys: Vec<B256> = entries.iter().map(|(k, _)| *k).collect();
        let mut vals: Vec<Vec<u8>> = entries.iter().map(|(_, v)| v.clone()).collect();
        keys.remove(50);
        vals.remove(50);
        let first = B256::ZERO;
        let last = *keys.last().unwrap();
        let proof = prove_bounds(&store, root, &first, Some(&last));
        assert!(verify_range_proof(root, &first, Some(&last), &keys, &vals, &proof).is_err());
    }

    #[test]
    fn unordered_keys_are_rejected() {
        let (store, root, entries) = fixture(16, 14);
        let mut keys: Vec<B256> = entries.iter().map(|(k, _)| *k).collect();
        let vals: Vec<Vec<u8>> = entries.iter().map(|(_, v)| v.clone()).collect();
        keys.swap(3, 4);
        let first = B256::ZERO;
        let last = keys.iter().copied().max().unwrap();
        let proof = prove_bounds(&store, root, &first, Some(&last));
        assert!(matches!(
            verify_range_proof(root, &first, Some(&last), &keys, &vals, &proof),
            Err(ProofError::InvalidRange(_))
        ));
    }

    #[test]
    fn missing_proof_node_is_rejected() {
        let (store, root, entries) = fixture(128, 15);
        let keys: Vec<B256> = entries[..64].iter().map(|(k, _)| *k).collect();
        let vals: Vec<Vec<u8>> = entries[..64].iter().map(|(_, v)| v.clone()).collect();
        let first = B256::ZERO;
        let last = *keys.last().unwrap();
        // Provide only the left proof; the right boundary path is missing.
        let proof = prove_bounds(&store, root, &first, None);
        assert!(matches!(
            verify_range_proof(root, &first, Some(&last), &keys, &vals, &proof),
            Err(ProofError::MissingNode(_))
        ));
    }

    #[test]
    fn empty_range_proves_exhaustion() {
        let (store, root, entries) = fixture(64, 16);
        let beyond = B256::repeat_byte(0xff);
        let proof = prove_bounds(&store, root, &beyond, None);
        // Nothing at or after 0xff..ff.
        assert!(!verify_range_proof(root, &beyond, None, &[], &[], &proof).unwrap());

        // But claiming emptiness from the middle of the key space fails.
        let mid = entries[32].0;
        let proof = prove_bounds(&store, root, &mid, None);
        assert!(matches!(
            verify_range_proof(root, &mid, None, &[], &[], &proof),
            Err(ProofError::UnexpectedContent)
        ));
    }

    #[test]
    fn empty_trie_verifies_empty_range() {
        let store = MemStore::new();
        let trie = MemTrie::new();
        let root = trie.commit(&store);
        assert_eq!(root, *EMPTY_ROOT);
        let proof = prove_bounds(&store, root, &B256::ZERO, None);
        assert!(!verify_range_proof(root, &B256::ZERO, None, &[], &[], &proof).unwrap());
    }

    #[test]
    fn single_entry_range_verifies() {
        let (store, root, entries) = fixture(128, 17);
        let (key, value) = entries[40].clone();
        let proof = prove_bounds(&store, root, &key, Some(&key));
        let more = verify_range_proof(
            root,
            &key,
            Some(&key),
            &[key],
            std::slice::from_ref(&value),
            &proof,
        )
        .unwrap();
        assert!(more);
    }
}
