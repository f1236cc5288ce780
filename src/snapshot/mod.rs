//! The layered snapshot stack.
//!
//! A single persistent [`DiskLayer`] sits at the bottom; every block applied
//! on top contributes an ephemeral [`DiffLayer`]. The [`SnapshotTree`]
//! indexes all live layers by the state root they belong to, builds new diff
//! layers, and flattens the bottom of the diff chain when it grows too tall.
//! Reads enter through any layer and descend toward disk.
use crate::account::Account;
use crate::traits::{KeyValueStore, NodeReader};
use alloy_primitives::B256;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub mod bloom;
pub mod diff_layer;
pub mod disk_layer;
pub mod generate;
pub mod relay;

pub use diff_layer::{AccountData, DiffLayer, StorageData};
pub use disk_layer::DiskLayer;
pub use generate::{generate_snapshot, resume_snapshot, GeneratorStats};
pub use relay::RelayCache;

/// Error type for snapshot reads and generation.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Read attempted on a layer that was flattened across. The caller must
    /// re-resolve its snapshot handle; the handle never recovers.
    #[error("snapshot layer is stale")]
    Stale,
    /// The requested region lies beyond the generator's progress marker and
    /// must be answered by the authoritative trie instead.
    #[error("state not covered by the snapshot yet")]
    NotCoveredYet,
    /// Generation observed a shutdown request.
    #[error("snapshot generation aborted")]
    Aborted,
    /// The authoritative trie could not be opened; fatal to the current
    /// generation pass.
    #[error("missing trie for root {0}")]
    MissingTrie(B256),
    /// A flat entry failed to decode as a slim account.
    #[error("corrupt account data: {0}")]
    CorruptAccount(String),
    /// Underlying store failure.
    #[error("store error: {0}")]
    Store(String),
    /// No layer is registered for the given root.
    #[error("unknown snapshot layer {0}")]
    UnknownLayer(B256),
    /// No parent layer is registered for the given root.
    #[error("unknown parent layer {0}")]
    UnknownParent(B256),
    /// A diff layer cannot sit on top of itself.
    #[error("snapshot cycle at root {0}")]
    Cycle(B256),
}

/// Capability shared by every snapshot layer.
pub trait Snapshot {
    /// Root hash of the state this snapshot covers.
    fn root(&self) -> B256;

    /// Whether the layer was invalidated by a flatten.
    fn stale(&self) -> bool;

    /// Slim account RLP for the given account hash; `None` means the account
    /// is known absent.
    fn account_rlp(&self, account_hash: &B256) -> Result<Option<Vec<u8>>, SnapshotError>;

    /// Raw storage slot value; `None` means the slot is known absent.
    fn storage(
        &self,
        account_hash: &B256,
        slot_hash: &B256,
    ) -> Result<Option<Vec<u8>>, SnapshotError>;

    /// Decoded account for the given account hash.
    fn account(&self, account_hash: &B256) -> Result<Option<Account>, SnapshotError> {
        match self.account_rlp(account_hash)? {
            None => Ok(None),
            Some(blob) => Account::from_slim_rlp(&blob)
                .map(Some)
                .map_err(|err| SnapshotError::CorruptAccount(err.to_string())),
        }
    }
}

/// A snapshot layer: either the persistent disk layer or an in-memory diff.
/// Reads dispatch on the tag.
#[derive(Debug)]
pub enum SnapshotLayer<S> {
    /// The persistent base layer.
    Disk(Arc<DiskLayer<S>>),
    /// An ephemeral modification layer.
    Diff(Arc<DiffLayer<S>>),
}

impl<S> Clone for SnapshotLayer<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Disk(disk) => Self::Disk(disk.clone()),
            Self::Diff(diff) => Self::Diff(diff.clone()),
        }
    }
}

impl<S: KeyValueStore + NodeReader> Snapshot for SnapshotLayer<S> {
    fn root(&self) -> B256 {
        match self {
            Self::Disk(disk) => disk.root(),
            Self::Diff(diff) => diff.root(),
        }
    }

    fn stale(&self) -> bool {
        match self {
            Self::Disk(disk) => disk.is_stale(),
            Self::Diff(diff) => diff.is_stale(),
        }
    }

    fn account_rlp(&self, account_hash: &B256) -> Result<Option<Vec<u8>>, SnapshotError> {
        match self {
            Self::Disk(disk) => disk.account_rlp(account_hash),
            Self::Diff(diff) => diff.account_rlp(account_hash),
        }
    }

    fn storage(
        &self,
        account_hash: &B256,
        slot_hash: &B256,
    ) -> Result<Option<Vec<u8>>, SnapshotError> {
        match self {
            Self::Disk(disk) => disk.storage(account_hash, slot_hash),
            Self::Diff(diff) => diff.storage(account_hash, slot_hash),
        }
    }
}

impl<S: KeyValueStore + NodeReader> Snapshot for DiskLayer<S> {
    fn root(&self) -> B256 {
        DiskLayer::root(self)
    }

    fn stale(&self) -> bool {
        self.is_stale()
    }

    fn account_rlp(&self, account_hash: &B256) -> Result<Option<Vec<u8>>, SnapshotError> {
        DiskLayer::account_rlp(self, account_hash)
    }

    fn storage(
        &self,
        account_hash: &B256,
        slot_hash: &B256,
    ) -> Result<Option<Vec<u8>>, SnapshotError> {
        DiskLayer::storage(self, account_hash, slot_hash)
    }
}

impl<S: KeyValueStore + NodeReader> Snapshot for DiffLayer<S> {
    fn root(&self) -> B256 {
        DiffLayer::root(self)
    }

    fn stale(&self) -> bool {
        self.is_stale()
    }

    fn account_rlp(&self, account_hash: &B256) -> Result<Option<Vec<u8>>, SnapshotError> {
        DiffLayer::account_rlp(self, account_hash)
    }

    fn storage(
        &self,
        account_hash: &B256,
        slot_hash: &B256,
    ) -> Result<Option<Vec<u8>>, SnapshotError> {
        DiffLayer::storage(self, account_hash, slot_hash)
    }
}

/// Tree of diff layers over the single disk layer, indexed by root hash.
pub struct SnapshotTree<S> {
    layers: RwLock<FxHashMap<B256, SnapshotLayer<S>>>,
    disk_root: RwLock<B256>,
}

impl<S: KeyValueStore + NodeReader> SnapshotTree<S> {
    /// Creates a tree rooted at the given disk layer.
    pub fn new(disk: Arc<DiskLayer<S>>) -> Self {
        let disk_root = disk.root();
        let mut layers = FxHashMap::default();
        layers.insert(disk_root, SnapshotLayer::Disk(disk));
        Self {
            layers: RwLock::new(layers),
            disk_root: RwLock::new(disk_root),
        }
    }

    /// Number of live layers, the disk layer included.
    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    /// Whether the tree holds no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.read().is_empty()
    }

    /// The layer registered for `root`, if any.
    pub fn snapshot(&self, root: &B256) -> Option<SnapshotLayer<S>> {
        self.layers.read().get(root).cloned()
    }

    /// The base disk layer.
    pub fn disk_layer(&self) -> Option<Arc<DiskLayer<S>>> {
        match self.layers.read().get(&*self.disk_root.read()) {
            Some(SnapshotLayer::Disk(disk)) => Some(disk.clone()),
            _ => None,
        }
    }

    /// Adds a new diff layer with the given modifications on top of the
    /// layer at `parent_root`.
    pub fn update(
        &self,
        parent_root: &B256,
        root: B256,
        accounts: AccountData,
        storage: StorageData,
    ) -> Result<(), SnapshotError> {
        if root == *parent_root {
            return Err(SnapshotError::Cycle(root));
        }
        let parent = self
            .snapshot(parent_root)
            .ok_or(SnapshotError::UnknownParent(*parent_root))?;
        let layer = DiffLayer::new(parent, root, accounts, storage);
        self.layers.write().insert(root, SnapshotLayer::Diff(layer));
        Ok(())
    }

    /// Caps the diff chain below `root` to at most `retain` layers,
    /// flattening the surplus bottom-up into a single aggregate diff.
    /// Layers flattened across become stale; sibling branches rooted in them
    /// are invalidated and dropped from the tree.
    pub fn cap(&self, root: &B256, retain: usize) -> Result<(), SnapshotError> {
        let layer = self
            .snapshot(root)
            .ok_or(SnapshotError::UnknownLayer(*root))?;
        let mut target = match layer {
            SnapshotLayer::Disk(_) => return Ok(()),
            SnapshotLayer::Diff(diff) => diff,
        };
        // Walk down to the deepest retained layer.
        for _ in 1..retain.max(1) {
            target = match target.parent() {
                SnapshotLayer::Diff(parent) => parent,
                SnapshotLayer::Disk(_) => return Ok(()),
            };
        }
        if matches!(target.parent(), SnapshotLayer::Disk(_)) {
            return Ok(());
        }
        // Record the ancestry that is about to be merged away.
        let mut doomed = Vec::new();
        let mut ancestor = target.parent();
        while let SnapshotLayer::Diff(diff) = ancestor {
            doomed.push(diff.root());
            ancestor = diff.parent();
        }
        let merged = match target.flatten() {
            SnapshotLayer::Diff(diff) => diff,
            SnapshotLayer::Disk(_) => unreachable!("flatten of a diff yields a diff"),
        };
        debug!(root = %merged.root(), merged = doomed.len(), "Flattened diff layers");

        let mut layers = self.layers.write();
        for root in &doomed {
            layers.remove(root);
        }
        layers.insert(merged.root(), SnapshotLayer::Diff(merged.clone()));
        // Re-point survivors that referenced the replaced layer; orphans on
        // dead side branches are dropped with their handles.
        let mut orphans = Vec::new();
        for (layer_root, layer) in layers.iter() {
            if let SnapshotLayer::Diff(diff) = layer {
                if let SnapshotLayer::Diff(parent) = diff.parent() {
                    if parent.root() == merged.root() && !Arc::ptr_eq(&parent, &merged) {
                        diff.set_parent(SnapshotLayer::Diff(merged.clone()));
                    } else if parent.is_stale() || doomed.contains(&parent.root()) {
                        orphans.push(*layer_root);
                    }
                }
            }
        }
        for root in orphans {
            layers.remove(&root);
        }
        Ok(())
    }
}
