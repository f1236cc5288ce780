//! Node model and stable binary encoding of the keccak-addressed trie.
//!
//! Keys are fixed 32-byte hashes (64 nibbles), so two node kinds suffice: a
//! leaf carrying the unconsumed tail of its key and a branch fanning out over
//! 16 children. There are no extension nodes; shared prefixes materialise as
//! chains of branches, and the canonical structure is a pure function of the
//! key set.
use alloy_primitives::{keccak256, B256};
use derive_more::{Deref, DerefMut};
use once_cell::sync::Lazy;
use thiserror::Error;

/// Encoding tag of the empty trie.
const TAG_EMPTY: u8 = 0x00;
/// Encoding tag of a leaf node.
const TAG_LEAF: u8 = 0x01;
/// Encoding tag of a branch node.
const TAG_BRANCH: u8 = 0x02;

/// Root hash of an empty trie: the hash of the empty-node encoding.
pub static EMPTY_ROOT: Lazy<B256> = Lazy::new(|| keccak256([TAG_EMPTY]));

/// Error type for trie operations.
#[derive(Debug, Error)]
pub enum TrieError {
    /// A referenced node could not be resolved from the node store.
    #[error("missing trie node {0}")]
    MissingNode(B256),
    /// A node blob failed to decode or did not hash to its key.
    #[error("corrupt trie node: {0}")]
    Corrupt(String),
    /// A key insertion descended into a subtree only known by hash.
    #[error("key descends into an unresolved subtree")]
    IntoUnresolved,
    /// Stack trie fed with keys out of ascending order.
    #[error("keys must be inserted in strictly ascending order")]
    OutOfOrder,
}

/// A key path expressed as nibbles, one `0..16` value per element.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Deref, DerefMut)]
pub struct Nibbles(pub Vec<u8>);

impl Nibbles {
    /// Unpacks a 32-byte key into its 64 nibbles.
    pub fn unpack(key: &B256) -> Self {
        let mut nibbles = Vec::with_capacity(64);
        for byte in key.as_slice() {
            nibbles.push(byte >> 4);
            nibbles.push(byte & 0x0f);
        }
        Self(nibbles)
    }

    /// Packs a full 64-nibble path back into its 32-byte key.
    ///
    /// # Panics
    /// Panics if the path does not hold exactly 64 nibbles.
    pub fn pack(&self) -> B256 {
        assert_eq!(self.len(), 64, "only full paths pack into a key");
        let mut key = B256::ZERO;
        for (i, pair) in self.chunks(2).enumerate() {
            key.as_mut_slice()[i] = (pair[0] << 4) | pair[1];
        }
        key
    }

    /// Returns a copy extended by one nibble.
    pub fn join(&self, nibble: u8) -> Self {
        let mut out = self.clone();
        out.push(nibble);
        out
    }

    /// Returns a copy extended by a whole tail.
    pub fn concat(&self, tail: &[u8]) -> Self {
        let mut out = self.clone();
        out.extend_from_slice(tail);
        out
    }

    /// Length of the longest common prefix with `other`.
    pub fn common_prefix_len(&self, other: &[u8]) -> usize {
        self.iter()
            .zip(other.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }
}

/// A node decoded from its stored blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedNode {
    /// The empty trie. Only valid as a root.
    Empty,
    /// A leaf holding the remaining nibbles of its key and the value.
    Leaf {
        /// Unconsumed key tail below this position.
        rest: Nibbles,
        /// The stored value.
        value: Vec<u8>,
    },
    /// A branch with up to 16 hashed children.
    Branch {
        /// Child hashes indexed by nibble.
        children: [Option<B256>; 16],
    },
}

/// Encodes an empty trie.
pub fn encode_empty() -> Vec<u8> {
    vec![TAG_EMPTY]
}

/// Encodes a leaf node.
pub fn encode_leaf(rest: &Nibbles, value: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(2 + rest.len() + value.len());
    blob.push(TAG_LEAF);
    blob.push(rest.len() as u8);
    blob.extend_from_slice(rest);
    blob.extend_from_slice(value);
    blob
}

/// Encodes a branch node: a 16-bit occupancy bitmap followed by the child
/// hashes of the set bits in ascending nibble order.
pub fn encode_branch(children: &[Option<B256>; 16]) -> Vec<u8> {
    let mut bitmap = 0u16;
    let mut count = 0usize;
    for (i, child) in children.iter().enumerate() {
        if child.is_some() {
            bitmap |= 1 << i;
            count += 1;
        }
    }
    let mut blob = Vec::with_capacity(3 + count * 32);
    blob.push(TAG_BRANCH);
    blob.extend_from_slice(&bitmap.to_be_bytes());
    for child in children.iter().flatten() {
        blob.extend_from_slice(child.as_slice());
    }
    blob
}

/// Decodes a node blob.
pub fn decode_node(blob: &[u8]) -> Result<DecodedNode, TrieError> {
    match blob.first() {
        Some(&TAG_EMPTY) if blob.len() == 1 => Ok(DecodedNode::Empty),
        Some(&TAG_LEAF) => {
            let rest_len = *blob
                .get(1)
                .ok_or_else(|| TrieError::Corrupt("truncated leaf header".into()))?
                as usize;
            if rest_len > 64 || blob.len() < 2 + rest_len {
                return Err(TrieError::Corrupt("truncated leaf path".into()));
            }
            let rest = Nibbles(blob[2..2 + rest_len].to_vec());
            if rest.iter().any(|n| *n > 0x0f) {
                return Err(TrieError::Corrupt("leaf path nibble out of range".into()));
            }
            Ok(DecodedNode::Leaf {
                rest,
                value: blob[2 + rest_len..].to_vec(),
            })
        }
        Some(&TAG_BRANCH) => {
            if blob.len() < 3 {
                return Err(TrieError::Corrupt("truncated branch header".into()));
            }
            let bitmap = u16::from_be_bytes([blob[1], blob[2]]);
            let expected = 3 + bitmap.count_ones() as usize * 32;
            if blob.len() != expected {
                return Err(TrieError::Corrupt("branch length mismatch".into()));
            }
            let mut children: [Option<B256>; 16] = Default::default();
            let mut offset = 3;
            for (i, child) in children.iter_mut().enumerate() {
                if bitmap & (1 << i) != 0 {
                    *child = Some(B256::from_slice(&blob[offset..offset + 32]));
                    offset += 32;
                }
            }
            Ok(DecodedNode::Branch { children })
        }
        _ => Err(TrieError::Corrupt("unknown node tag".into())),
    }
}
