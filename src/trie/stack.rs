//! Incremental trie hasher fed with keys in ascending order.
//!
//! Used by the range prover's full-range special case: when the flat segment
//! spans the whole key space, the claimed content is hashed directly and the
//! root compared, no edge proofs needed.
use crate::trie::trie::MemTrie;
use crate::trie::TrieError;
use alloy_primitives::B256;

/// Sink receiving the committed node blobs when the trie is hashed.
pub type NodeSink<'a> = Box<dyn FnMut(B256, Vec<u8>) + 'a>;

/// A trie hasher that enforces strictly ascending insertion order.
pub struct StackTrie<'a> {
    trie: MemTrie,
    last: Option<B256>,
    sink: Option<NodeSink<'a>>,
}

impl<'a> StackTrie<'a> {
    /// Creates a stack trie; with a sink, hashing also emits every committed
    /// node blob.
    pub fn new(sink: Option<NodeSink<'a>>) -> Self {
        Self {
            trie: MemTrie::new(),
            last: None,
            sink,
        }
    }

    /// Adds the next key/value pair. Keys must arrive in strictly ascending
    /// order.
    pub fn update(&mut self, key: B256, value: Vec<u8>) -> Result<(), TrieError> {
        if let Some(last) = self.last {
            if key <= last {
                return Err(TrieError::OutOfOrder);
            }
        }
        self.trie.insert(&key, value)?;
        self.last = Some(key);
        Ok(())
    }

    /// Hashes everything fed so far, emitting node blobs to the sink if one
    /// was provided.
    pub fn hash(&mut self) -> B256 {
        match self.sink.as_mut() {
            Some(sink) => self.trie.hash_with(sink),
            None => self.trie.hash(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::EMPTY_ROOT;

    #[test]
    fn matches_the_regular_builder() {
        let keys: Vec<B256> = (0u8..32).map(B256::repeat_byte).collect();
        let mut reference = MemTrie::new();
        let mut stack = StackTrie::new(None);
        for key in &keys {
            reference.insert(key, key.as_slice()[..8].to_vec()).unwrap();
            stack.update(*key, key.as_slice()[..8].to_vec()).unwrap();
        }
        assert_eq!(stack.hash(), reference.hash());
    }

    #[test]
    fn rejects_unordered_keys() {
        let mut stack = StackTrie::new(None);
        stack.update(B256::repeat_byte(5), vec![1]).unwrap();
        assert!(matches!(
            stack.update(B256::repeat_byte(5), vec![1]),
            Err(TrieError::OutOfOrder)
        ));
        assert!(matches!(
            stack.update(B256::repeat_byte(4), vec![1]),
            Err(TrieError::OutOfOrder)
        ));
    }

    #[test]
    fn empty_stack_hashes_to_the_empty_root() {
        let mut stack = StackTrie::new(None);
        assert_eq!(stack.hash(), *EMPTY_ROOT);
    }

    #[test]
    fn sink_receives_all_committed_nodes() {
        let mut blobs: Vec<(B256, Vec<u8>)> = Vec::new();
        {
            let mut stack = StackTrie::new(Some(Box::new(|hash, blob| {
                blobs.push((hash, blob));
            })));
            for i in 0u8..8 {
                stack.update(B256::repeat_byte(i), vec![i]).unwrap();
            }
            stack.hash();
        }
        // One leaf per key plus at least the root branch.
        assert!(blobs.len() > 8);
        assert!(blobs
            .iter()
            .all(|(hash, blob)| *hash == alloy_primitives::keccak256(blob)));
    }
}
