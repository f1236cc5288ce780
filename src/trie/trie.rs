//! The in-memory trie builder and the read-only view over a node store.
//!
//! [`MemTrie`] owns its nodes and is insert-only; it backs test fixtures,
//! relay-cache construction and range-proof reconstruction (via grafted
//! subtrees known only by hash). [`Trie`] is the read-only counterpart used
//! against a persistent [`NodeReader`]: point lookups, merkle path proofs
//! and in-order leaf iteration from an arbitrary origin.
use crate::traits::{NodeReader, NodeWriter};
use crate::trie::node::{
    decode_node, encode_branch, encode_empty, encode_leaf, DecodedNode, Nibbles, TrieError,
    EMPTY_ROOT,
};
use alloy_primitives::{keccak256, B256};

/// A reference to a subtree inside [`MemTrie`].
#[derive(Clone, Debug)]
enum Link {
    /// No subtree.
    Empty,
    /// An owned, materialised node.
    Node(Box<MemNode>),
    /// A subtree known only by its hash (grafted from a proof).
    Hash(B256),
}

#[derive(Clone, Debug)]
enum MemNode {
    Leaf { rest: Nibbles, value: Vec<u8> },
    Branch { children: [Link; 16] },
}

fn empty_children() -> [Link; 16] {
    std::array::from_fn(|_| Link::Empty)
}

/// An owned, insert-only merkle trie over 32-byte keys.
#[derive(Debug, Default)]
pub struct MemTrie {
    root: Link,
}

impl Default for Link {
    fn default() -> Self {
        Link::Empty
    }
}

impl MemTrie {
    /// Creates an empty trie.
    pub fn new() -> Self {
        Self { root: Link::Empty }
    }

    /// Inserts or overwrites a key. Fails if the key's path crosses a
    /// subtree that is only known by hash.
    pub fn insert(&mut self, key: &B256, value: Vec<u8>) -> Result<(), TrieError> {
        let path = Nibbles::unpack(key);
        Self::insert_link(&mut self.root, &path, value)
    }

    fn insert_link(link: &mut Link, path: &[u8], value: Vec<u8>) -> Result<(), TrieError> {
        match link {
            Link::Empty => {
                *link = Link::Node(Box::new(MemNode::Leaf {
                    rest: Nibbles(path.to_vec()),
                    value,
                }));
                Ok(())
            }
            Link::Hash(_) => Err(TrieError::IntoUnresolved),
            Link::Node(node) => match node.as_mut() {
                MemNode::Leaf { rest, value: old } => {
                    if rest.0 == path {
                        *old = value;
                        return Ok(());
                    }
                    // Keys have equal length, so the divergence point exists.
                    let common = rest.common_prefix_len(path);
                    let (old_rest, old_value) = (rest.clone(), std::mem::take(old));

                    let mut children = empty_children();
                    children[old_rest[common] as usize] = Link::Node(Box::new(MemNode::Leaf {
                        rest: Nibbles(old_rest[common + 1..].to_vec()),
                        value: old_value,
                    }));
                    children[path[common] as usize] = Link::Node(Box::new(MemNode::Leaf {
                        rest: Nibbles(path[common + 1..].to_vec()),
                        value,
                    }));
                    let mut replacement = Link::Node(Box::new(MemNode::Branch { children }));
                    // Wrap one branch per shared nibble, innermost first.
                    for depth in (0..common).rev() {
                        let mut children = empty_children();
                        children[path[depth] as usize] = replacement;
                        replacement = Link::Node(Box::new(MemNode::Branch { children }));
                    }
                    *link = replacement;
                    Ok(())
                }
                MemNode::Branch { children } => {
                    Self::insert_link(&mut children[path[0] as usize], &path[1..], value)
                }
            },
        }
    }

    /// Grafts a subtree known only by hash at the given nibble path,
    /// materialising the branch skeleton above it. Fails if the position is
    /// already occupied.
    pub fn insert_graft(&mut self, path: &[u8], hash: B256) -> Result<(), TrieError> {
        Self::graft_link(&mut self.root, path, hash)
    }

    fn graft_link(link: &mut Link, path: &[u8], hash: B256) -> Result<(), TrieError> {
        if path.is_empty() {
            return match link {
                Link::Empty => {
                    *link = Link::Hash(hash);
                    Ok(())
                }
                _ => Err(TrieError::Corrupt(
                    "graft path conflicts with existing node".into(),
                )),
            };
        }
        match link {
            Link::Empty => {
                let mut children = empty_children();
                Self::graft_link(&mut children[path[0] as usize], &path[1..], hash)?;
                *link = Link::Node(Box::new(MemNode::Branch { children }));
                Ok(())
            }
            Link::Node(node) => match node.as_mut() {
                MemNode::Branch { children } => {
                    Self::graft_link(&mut children[path[0] as usize], &path[1..], hash)
                }
                MemNode::Leaf { .. } => Err(TrieError::Corrupt(
                    "graft path conflicts with existing node".into(),
                )),
            },
            Link::Hash(_) => Err(TrieError::Corrupt(
                "graft path conflicts with existing node".into(),
            )),
        }
    }

    /// Computes the root hash without committing anything.
    pub fn hash(&self) -> B256 {
        Self::hash_link(&self.root, &mut |_, _| {})
    }

    /// Computes the root hash, feeding every materialised node blob to the
    /// sink (grafted subtrees contribute their hash only).
    pub fn hash_with(&self, sink: &mut dyn FnMut(B256, Vec<u8>)) -> B256 {
        Self::hash_link(&self.root, sink)
    }

    /// Hashes the trie and writes every node blob into the store. The empty
    /// encoding is written too so the committed root always resolves.
    pub fn commit(&self, store: &dyn NodeWriter) -> B256 {
        let root = self.hash_with(&mut |hash, blob| store.insert_node(hash, blob));
        if matches!(self.root, Link::Empty) {
            store.insert_node(*EMPTY_ROOT, encode_empty());
        }
        root
    }

    fn hash_link(link: &Link, sink: &mut dyn FnMut(B256, Vec<u8>)) -> B256 {
        match link {
            Link::Empty => *EMPTY_ROOT,
            Link::Hash(hash) => *hash,
            Link::Node(node) => {
                let blob = match node.as_ref() {
                    MemNode::Leaf { rest, value } => encode_leaf(rest, value),
                    MemNode::Branch { children } => {
                        let mut hashed: [Option<B256>; 16] = Default::default();
                        for (i, child) in children.iter().enumerate() {
                            if !matches!(child, Link::Empty) {
                                hashed[i] = Some(Self::hash_link(child, sink));
                            }
                        }
                        encode_branch(&hashed)
                    }
                };
                let hash = keccak256(&blob);
                sink(hash, blob);
                hash
            }
        }
    }
}

/// Resolves a node blob from the store and verifies it hashes to its key.
pub(crate) fn resolve(reader: &dyn NodeReader, hash: &B256) -> Result<DecodedNode, TrieError> {
    let blob = reader
        .node(hash)
        .ok_or(TrieError::MissingNode(*hash))?;
    if keccak256(&blob) != *hash {
        return Err(TrieError::Corrupt(format!(
            "node blob does not hash to {hash}"
        )));
    }
    decode_node(&blob)
}

/// Read-only trie view over a node store.
pub struct Trie<'a> {
    root: B256,
    reader: &'a dyn NodeReader,
}

impl<'a> Trie<'a> {
    /// Opens the trie at `root`. Fails if the root node cannot be resolved.
    pub fn new(root: B256, reader: &'a dyn NodeReader) -> Result<Self, TrieError> {
        if root != *EMPTY_ROOT && reader.node(&root).is_none() {
            return Err(TrieError::MissingNode(root));
        }
        Ok(Self { root, reader })
    }

    /// The root this view was opened at.
    pub fn root(&self) -> B256 {
        self.root
    }

    /// Point lookup of a key's value.
    pub fn get(&self, key: &B256) -> Result<Option<Vec<u8>>, TrieError> {
        if self.root == *EMPTY_ROOT {
            return Ok(None);
        }
        let path = Nibbles::unpack(key);
        let mut hash = self.root;
        let mut depth = 0usize;
        loop {
            match resolve(self.reader, &hash)? {
                DecodedNode::Empty => {
                    return Err(TrieError::Corrupt("interior empty node".into()))
                }
                DecodedNode::Leaf { rest, value } => {
                    return Ok((rest.0 == path[depth..]).then_some(value));
                }
                DecodedNode::Branch { children } => {
                    match children[path[depth] as usize] {
                        Some(child) => {
                            hash = child;
                            depth += 1;
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Writes every node blob on the merkle path of `key` into `out`, keyed
    /// by hash. The path of an absent key proves its absence.
    pub fn prove(&self, key: &B256, out: &dyn NodeWriter) -> Result<(), TrieError> {
        if self.root == *EMPTY_ROOT {
            out.insert_node(*EMPTY_ROOT, encode_empty());
            return Ok(());
        }
        let path = Nibbles::unpack(key);
        let mut hash = self.root;
        let mut depth = 0usize;
        loop {
            let blob = self
                .reader
                .node(&hash)
                .ok_or(TrieError::MissingNode(hash))?;
            if keccak256(&blob) != hash {
                return Err(TrieError::Corrupt(format!(
                    "node blob does not hash to {hash}"
                )));
            }
            let node = decode_node(&blob)?;
            out.insert_node(hash, blob);
            match node {
                DecodedNode::Empty => {
                    return Err(TrieError::Corrupt("interior empty node".into()))
                }
                DecodedNode::Leaf { .. } => return Ok(()),
                DecodedNode::Branch { children } => {
                    match children[path[depth] as usize] {
                        Some(child) => {
                            hash = child;
                            depth += 1;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// In-order leaf iterator starting at the first key `>= origin`.
    pub fn iter_from(&self, origin: &B256) -> Result<TrieIter<'a>, TrieError> {
        let mut iter = TrieIter {
            reader: self.reader,
            stack: Vec::new(),
        };
        if self.root == *EMPTY_ROOT {
            return Ok(iter);
        }
        let origin_path = Nibbles::unpack(origin);
        let mut hash = self.root;
        let mut prefix = Nibbles::default();
        loop {
            let depth = prefix.len();
            match resolve(self.reader, &hash)? {
                DecodedNode::Empty => {
                    return Err(TrieError::Corrupt("interior empty node".into()))
                }
                DecodedNode::Leaf { rest, value } => {
                    if prefix.concat(&rest).pack() >= *origin {
                        iter.stack.push(Frame {
                            prefix,
                            node: DecodedNode::Leaf { rest, value },
                            next_child: 0,
                        });
                    }
                    break;
                }
                DecodedNode::Branch { children } => {
                    let target = origin_path[depth] as usize;
                    iter.stack.push(Frame {
                        prefix: prefix.clone(),
                        node: DecodedNode::Branch { children },
                        next_child: target + 1,
                    });
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
        Ok(iter)
    }
}

struct Frame {
    prefix: Nibbles,
    node: DecodedNode,
    next_child: usize,
}

/// Iterator over `(key, value)` leaves in ascending key order.
pub struct TrieIter<'a> {
    reader: &'a dyn NodeReader,
    stack: Vec<Frame>,
}

impl Iterator for TrieIter<'_> {
    type Item = Result<(B256, Vec<u8>), TrieError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.stack.last_mut()?;
            if let DecodedNode::Leaf { .. } = top.node {
                let frame = self.stack.pop().expect("frame present");
                let DecodedNode::Leaf { rest, value } = frame.node else {
                    unreachable!()
                };
                return Some(Ok((frame.prefix.concat(&rest).pack(), value)));
            }
            // Branch: advance to the next present child, or pop.
            let mut descend: Option<(usize, B256)> = None;
            if let DecodedNode::Branch { children } = &top.node {
                while top.next_child < 16 {
                    let index = top.next_child;
                    top.next_child += 1;
                    if let Some(child) = children[index] {
                        descend = Some((index, child));
                        break;
                    }
                }
            }
            let prefix = top.prefix.clone();
            match descend {
                Some((index, child)) => match resolve(self.reader, &child) {
                    Ok(DecodedNode::Empty) => {
                        self.stack.clear();
                        return Some(Err(TrieError::Corrupt("interior empty node".into())));
                    }
                    Ok(node) => self.stack.push(Frame {
                        prefix: prefix.join(index as u8),
                        node,
                        next_child: 0,
                    }),
                    Err(err) => {
                        self.stack.clear();
                        return Some(Err(err));
                    }
                },
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}
