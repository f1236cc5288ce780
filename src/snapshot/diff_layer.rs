//! In-memory diff layers.
//!
//! A diff layer is the set of account and storage modifications one block
//! made on top of its parent snapshot, acting as a journal of recent changes
//! that have not yet graduated into the disk layer. Point reads consult the
//! cumulative bloom filter first: a miss proves no in-memory layer holds the
//! key and the read goes straight to the disk origin.
use crate::snapshot::bloom::{account_bloom_hash, storage_bloom_hash, Bloom};
use crate::snapshot::disk_layer::DiskLayer;
use crate::snapshot::{SnapshotError, SnapshotLayer};
use crate::traits::{KeyValueStore, NodeReader};
use alloy_primitives::B256;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::trace;

/// Account modifications of one layer. An empty value is a deletion.
pub type AccountData = FxHashMap<B256, Vec<u8>>;

/// Storage modifications of one layer, keyed by account hash. A `None` inner
/// map means the account's entire storage was wiped; an empty slot value
/// deletes that slot.
pub type StorageData = FxHashMap<B256, Option<FxHashMap<B256, Vec<u8>>>>;

struct DiffInner<S> {
    /// Set when a child flattened into this layer; every later read fails.
    stale: bool,
    account_data: AccountData,
    storage_data: StorageData,
    /// Memoised sorted account list.
    account_list: Option<Vec<B256>>,
    /// Memoised sorted slot lists per account.
    storage_list: FxHashMap<B256, Arc<Vec<B256>>>,
    /// Bloom over this layer's own entries.
    diffed: Bloom,
    /// Bloom over this layer and every ancestor diff; only valid between
    /// `prepare` and `release`.
    cumulative: Option<Bloom>,
    /// Fast handle to the base disk layer for the bloom-miss path.
    origin: Option<Arc<DiskLayer<S>>>,
    /// Approximate memory use of this layer's data.
    memory: u64,
}

/// A collection of state modifications on top of a parent snapshot.
pub struct DiffLayer<S> {
    root: B256,
    /// Parent snapshot, re-pointed when intermediate layers are flattened.
    parent: RwLock<SnapshotLayer<S>>,
    inner: RwLock<DiffInner<S>>,
}

impl<S> std::fmt::Debug for DiffLayer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("DiffLayer")
            .field("root", &self.root)
            .field("stale", &inner.stale)
            .field("accounts", &inner.account_data.len())
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore + NodeReader> DiffLayer<S> {
    /// Creates a new diff layer on top of an existing snapshot, indexing the
    /// data into the layer's bloom filter.
    pub fn new(
        parent: SnapshotLayer<S>,
        root: B256,
        accounts: AccountData,
        storage: StorageData,
    ) -> Arc<Self> {
        let mut diffed = Bloom::new_layer_filter();
        let mut memory = 0u64;
        for (hash, data) in &accounts {
            diffed.add(account_bloom_hash(hash));
            memory += data.len() as u64 + 32;
        }
        for (account_hash, slots) in &storage {
            if let Some(slots) = slots {
                for (slot_hash, data) in slots {
                    diffed.add(storage_bloom_hash(account_hash, slot_hash));
                    memory += data.len() as u64 + 32;
                }
            }
        }
        Arc::new(Self {
            root,
            parent: RwLock::new(parent),
            inner: RwLock::new(DiffInner {
                stale: false,
                account_data: accounts,
                storage_data: storage,
                account_list: None,
                storage_list: FxHashMap::default(),
                diffed,
                cumulative: None,
                origin: None,
                memory,
            }),
        })
    }

    /// Root hash this layer's post-state belongs to.
    pub fn root(&self) -> B256 {
        self.root
    }

    /// Whether this layer was flattened across and is no longer readable.
    pub fn is_stale(&self) -> bool {
        self.inner.read().stale
    }

    /// Approximate memory held by this layer's data.
    pub fn memory(&self) -> u64 {
        self.inner.read().memory
    }

    /// The parent snapshot of this layer.
    pub fn parent(&self) -> SnapshotLayer<S> {
        self.parent.read().clone()
    }

    pub(crate) fn set_parent(&self, parent: SnapshotLayer<S>) {
        *self.parent.write() = parent;
    }

    /// Builds the cumulative bloom filter from this layer and all its diff
    /// ancestors and arms the bloom-miss fast path onto `origin`. The layer
    /// serves bloom-accelerated reads only between `prepare` and `release`.
    pub fn prepare(&self, origin: &Arc<DiskLayer<S>>) {
        let mut cumulative = self.inner.read().diffed.clone();
        let mut ancestor = self.parent();
        while let SnapshotLayer::Diff(diff) = ancestor {
            cumulative.union_in_place(&diff.inner.read().diffed);
            ancestor = diff.parent();
        }
        trace!(
            root = %self.root,
            error_rate = cumulative.error_rate(),
            "Prepared cumulative bloom filter"
        );
        let mut inner = self.inner.write();
        inner.cumulative = Some(cumulative);
        inner.origin = Some(origin.clone());
    }

    /// Drops the cumulative bloom filter.
    pub fn release(&self) {
        let mut inner = self.inner.write();
        inner.cumulative = None;
        inner.origin = None;
    }

    /// Creates a new layer on top of this one with the given modifications.
    pub fn update(
        self: &Arc<Self>,
        root: B256,
        accounts: AccountData,
        storage: StorageData,
    ) -> Arc<Self> {
        Self::new(SnapshotLayer::Diff(self.clone()), root, accounts, storage)
    }

    /// Retrieves the slim account RLP associated with `account_hash`.
    ///
    /// A bloom miss skips every in-memory layer and reads the disk origin
    /// directly; a hit (or an unprepared layer) walks the parent chain.
    pub fn account_rlp(&self, account_hash: &B256) -> Result<Option<Vec<u8>>, SnapshotError> {
        let origin = {
            let inner = self.inner.read();
            match (&inner.cumulative, &inner.origin) {
                (Some(cumulative), Some(origin))
                    if !cumulative.contains(account_bloom_hash(account_hash)) =>
                {
                    Some(origin.clone())
                }
                _ => None,
            }
        };
        match origin {
            Some(origin) => origin.account_rlp(account_hash),
            None => self.account_rlp_walk(account_hash),
        }
    }

    fn account_rlp_walk(&self, account_hash: &B256) -> Result<Option<Vec<u8>>, SnapshotError> {
        let parent = {
            let inner = self.inner.read();
            if inner.stale {
                return Err(SnapshotError::Stale);
            }
            // A present-but-empty entry is a deletion, which is a different
            // notion than an unknown account.
            if let Some(data) = inner.account_data.get(account_hash) {
                return Ok((!data.is_empty()).then(|| data.clone()));
            }
            self.parent.read().clone()
        };
        match parent {
            SnapshotLayer::Diff(diff) => diff.account_rlp_walk(account_hash),
            SnapshotLayer::Disk(disk) => disk.account_rlp(account_hash),
        }
    }

    /// Retrieves a raw storage slot value within an account.
    pub fn storage(
        &self,
        account_hash: &B256,
        slot_hash: &B256,
    ) -> Result<Option<Vec<u8>>, SnapshotError> {
        let origin = {
            let inner = self.inner.read();
            match (&inner.cumulative, &inner.origin) {
                (Some(cumulative), Some(origin))
                    if !cumulative.contains(storage_bloom_hash(account_hash, slot_hash)) =>
                {
                    Some(origin.clone())
                }
                _ => None,
            }
        };
        match origin {
            Some(origin) => origin.storage(account_hash, slot_hash),
            None => self.storage_walk(account_hash, slot_hash),
        }
    }

    fn storage_walk(
        &self,
        account_hash: &B256,
        slot_hash: &B256,
    ) -> Result<Option<Vec<u8>>, SnapshotError> {
        let parent = {
            let inner = self.inner.read();
            if inner.stale {
                return Err(SnapshotError::Stale);
            }
            match inner.storage_data.get(account_hash) {
                // Wiped storage: every slot is known absent.
                Some(None) => return Ok(None),
                Some(Some(slots)) => {
                    if let Some(data) = slots.get(slot_hash) {
                        return Ok((!data.is_empty()).then(|| data.clone()));
                    }
                }
                None => {}
            }
            self.parent.read().clone()
        };
        match parent {
            SnapshotLayer::Diff(diff) => diff.storage_walk(account_hash, slot_hash),
            SnapshotLayer::Disk(disk) => disk.storage(account_hash, slot_hash),
        }
    }

    /// Sorted list of all account hashes modified in this layer, memoised.
    pub fn account_list(&self) -> Vec<B256> {
        let mut inner = self.inner.write();
        if let Some(list) = &inner.account_list {
            return list.clone();
        }
        let mut list: Vec<B256> = inner.account_data.keys().copied().collect();
        list.sort_unstable();
        inner.account_list = Some(list.clone());
        list
    }

    /// Sorted list of the slot hashes modified in this layer for the given
    /// account, memoised.
    pub fn storage_list(&self, account_hash: &B256) -> Arc<Vec<B256>> {
        let mut inner = self.inner.write();
        if let Some(list) = inner.storage_list.get(account_hash) {
            return list.clone();
        }
        let mut list: Vec<B256> = match inner.storage_data.get(account_hash) {
            Some(Some(slots)) => slots.keys().copied().collect(),
            _ => Vec::new(),
        };
        list.sort_unstable();
        let list = Arc::new(list);
        inner.storage_list.insert(*account_hash, list.clone());
        list
    }

    /// Merges this layer into its parent, flattening the whole chain below
    /// into a single diff sitting on the disk layer. The parent is marked
    /// stale; the returned layer supplants both.
    ///
    /// # Panics
    /// Panics if the parent was already flattened into by another child;
    /// two children flattening into the same parent is a programming error.
    pub fn flatten(self: &Arc<Self>) -> SnapshotLayer<S> {
        // If the parent is the disk layer, this is the first diff in line.
        let parent = match self.parent() {
            SnapshotLayer::Disk(_) => return SnapshotLayer::Diff(self.clone()),
            SnapshotLayer::Diff(parent) => parent,
        };
        // Flatten the parent first; apart from corner cases this merges a
        // single layer, so there is no need to group flattens.
        let parent = match parent.flatten() {
            SnapshotLayer::Diff(parent) => parent,
            SnapshotLayer::Disk(_) => unreachable!("flatten of a diff yields a diff"),
        };

        let mut parent_inner = parent.inner.write();
        if parent_inner.stale {
            panic!("parent diff layer is stale");
        }
        parent_inner.stale = true;

        let self_inner = self.inner.read();
        let mut account_data = std::mem::take(&mut parent_inner.account_data);
        for (hash, data) in &self_inner.account_data {
            account_data.insert(*hash, data.clone());
        }
        let mut storage_data = std::mem::take(&mut parent_inner.storage_data);
        for (account_hash, slots) in &self_inner.storage_data {
            match (storage_data.get_mut(account_hash), slots) {
                // Both sides hold live slot maps: merge slot by slot.
                (Some(Some(existing)), Some(new_slots)) => {
                    for (slot_hash, data) in new_slots {
                        existing.insert(*slot_hash, data.clone());
                    }
                }
                // Storage absent or wiped on either side: overwrite blindly.
                _ => {
                    storage_data.insert(*account_hash, slots.clone());
                }
            }
        }

        let merged = Arc::new(Self {
            root: self.root,
            parent: RwLock::new(parent.parent()),
            inner: RwLock::new(DiffInner {
                stale: false,
                account_data,
                storage_data,
                account_list: None,
                storage_list: FxHashMap::default(),
                diffed: self_inner.diffed.clone(),
                cumulative: None,
                origin: parent_inner.origin.clone(),
                memory: parent_inner.memory + self_inner.memory,
            }),
        });
        SnapshotLayer::Diff(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_store::MemStore;
    use crate::snapshot::bloom::account_bloom_hash;

    fn disk() -> Arc<DiskLayer<MemStore>> {
        Arc::new(DiskLayer::new(
            Arc::new(MemStore::new()),
            B256::ZERO,
            1 << 20,
            None,
        ))
    }

    fn accounts(entries: &[(u8, &[u8])]) -> AccountData {
        entries
            .iter()
            .map(|(tag, data)| (B256::repeat_byte(*tag), data.to_vec()))
            .collect()
    }

    #[test]
    fn local_data_shadows_the_parent() {
        let base = SnapshotLayer::Disk(disk());
        let bottom = DiffLayer::new(
            base,
            B256::repeat_byte(1),
            accounts(&[(0xaa, b"old"), (0xbb, b"keep")]),
            StorageData::default(),
        );
        let top = bottom.update(
            B256::repeat_byte(2),
            accounts(&[(0xaa, b"new"), (0xcc, b"")]),
            StorageData::default(),
        );

        assert_eq!(
            top.account_rlp(&B256::repeat_byte(0xaa)).unwrap(),
            Some(b"new".to_vec())
        );
        assert_eq!(
            top.account_rlp(&B256::repeat_byte(0xbb)).unwrap(),
            Some(b"keep".to_vec())
        );
        // Tombstone in the top layer hides nothing below it.
        assert_eq!(top.account_rlp(&B256::repeat_byte(0xcc)).unwrap(), None);
        // Unknown everywhere.
        assert_eq!(top.account_rlp(&B256::repeat_byte(0xdd)).unwrap(), None);
    }

    #[test]
    fn wiped_storage_hides_parent_slots() {
        let base = SnapshotLayer::Disk(disk());
        let slot = B256::repeat_byte(0x01);
        let mut storage = StorageData::default();
        storage.insert(
            B256::repeat_byte(0xaa),
            Some([(slot, b"value".to_vec())].into_iter().collect()),
        );
        let bottom = DiffLayer::new(base, B256::repeat_byte(1), AccountData::default(), storage);

        let mut wipe = StorageData::default();
        wipe.insert(B256::repeat_byte(0xaa), None);
        let top = bottom.update(B256::repeat_byte(2), AccountData::default(), wipe);

        assert_eq!(
            bottom.storage(&B256::repeat_byte(0xaa), &slot).unwrap(),
            Some(b"value".to_vec())
        );
        assert_eq!(top.storage(&B256::repeat_byte(0xaa), &slot).unwrap(), None);
    }

    #[test]
    fn flatten_merges_and_marks_parent_stale() {
        let base = SnapshotLayer::Disk(disk());
        let bottom = DiffLayer::new(
            base,
            B256::repeat_byte(1),
            accounts(&[(0xaa, b"a0"), (0xbb, b"b0")]),
            StorageData::default(),
        );
        let mid = bottom.update(
            B256::repeat_byte(2),
            accounts(&[(0xaa, b"a1")]),
            StorageData::default(),
        );
        let top = mid.update(
            B256::repeat_byte(3),
            accounts(&[(0xcc, b"c2")]),
            StorageData::default(),
        );

        let merged = match top.flatten() {
            SnapshotLayer::Diff(diff) => diff,
            SnapshotLayer::Disk(_) => panic!("flatten lost the diff"),
        };
        assert_eq!(merged.root(), B256::repeat_byte(3));
        assert_eq!(
            merged.account_rlp(&B256::repeat_byte(0xaa)).unwrap(),
            Some(b"a1".to_vec())
        );
        assert_eq!(
            merged.account_rlp(&B256::repeat_byte(0xbb)).unwrap(),
            Some(b"b0".to_vec())
        );
        assert_eq!(
            merged.account_rlp(&B256::repeat_byte(0xcc)).unwrap(),
            Some(b"c2".to_vec())
        );
        // The merged layer sits directly on disk.
        assert!(matches!(merged.parent(), SnapshotLayer::Disk(_)));
        // Intermediate layers became stale and refuse reads forever.
        assert!(bottom.is_stale() && mid.is_stale());
        assert!(matches!(
            mid.account_rlp(&B256::repeat_byte(0xaa)),
            Err(SnapshotError::Stale)
        ));
    }

    #[test]
    fn flatten_merges_storage_slot_by_slot() {
        let base = SnapshotLayer::Disk(disk());
        let account = B256::repeat_byte(0xaa);
        let (s1, s2) = (B256::repeat_byte(1), B256::repeat_byte(2));

        let mut lower = StorageData::default();
        lower.insert(
            account,
            Some([(s1, b"one".to_vec())].into_iter().collect()),
        );
        let bottom = DiffLayer::new(base, B256::repeat_byte(1), AccountData::default(), lower);

        let mut upper = StorageData::default();
        upper.insert(
            account,
            Some([(s2, b"two".to_vec())].into_iter().collect()),
        );
        let top = bottom.update(B256::repeat_byte(2), AccountData::default(), upper);

        let merged = match top.flatten() {
            SnapshotLayer::Diff(diff) => diff,
            SnapshotLayer::Disk(_) => panic!("flatten lost the diff"),
        };
        assert_eq!(merged.storage(&account, &s1).unwrap(), Some(b"one".to_vec()));
        assert_eq!(merged.storage(&account, &s2).unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    #[should_panic(expected = "parent diff layer is stale")]
    fn double_flatten_into_the_same_parent_panics() {
        let base = SnapshotLayer::Disk(disk());
        let bottom = DiffLayer::new(
            base,
            B256::repeat_byte(1),
            accounts(&[(0xaa, b"a")]),
            StorageData::default(),
        );
        let child_a = bottom.update(
            B256::repeat_byte(2),
            AccountData::default(),
            StorageData::default(),
        );
        let child_b = bottom.update(
            B256::repeat_byte(3),
            AccountData::default(),
            StorageData::default(),
        );
        let _ = child_a.flatten();
        let _ = child_b.flatten();
    }

    #[test]
    fn bloom_miss_short_circuits_to_disk() {
        let store = Arc::new(MemStore::new());
        let absent = B256::repeat_byte(0x55);
        let disk = Arc::new(DiskLayer::new(store, B256::ZERO, 1 << 20, None));
        let layer = DiffLayer::new(
            SnapshotLayer::Disk(disk.clone()),
            B256::repeat_byte(1),
            accounts(&[(0xaa, b"data")]),
            StorageData::default(),
        );
        layer.prepare(&disk);

        // Every inserted key must report as maybe-present at the layer.
        assert!(layer
            .inner
            .read()
            .cumulative
            .as_ref()
            .unwrap()
            .contains(account_bloom_hash(&B256::repeat_byte(0xaa))));
        // Reads still resolve correctly either way.
        assert_eq!(
            layer.account_rlp(&B256::repeat_byte(0xaa)).unwrap(),
            Some(b"data".to_vec())
        );
        assert_eq!(layer.account_rlp(&absent).unwrap(), None);

        layer.release();
        assert!(layer.inner.read().cumulative.is_none());
        // Unprepared layers fall back to the plain walk.
        assert_eq!(
            layer.account_rlp(&B256::repeat_byte(0xaa)).unwrap(),
            Some(b"data".to_vec())
        );
    }

    #[test]
    fn cumulative_bloom_covers_all_ancestors() {
        let store = Arc::new(MemStore::new());
        let disk = Arc::new(DiskLayer::new(store, B256::ZERO, 1 << 20, None));
        let bottom = DiffLayer::new(
            SnapshotLayer::Disk(disk.clone()),
            B256::repeat_byte(1),
            accounts(&[(0x10, b"x")]),
            StorageData::default(),
        );
        let top = bottom.update(
            B256::repeat_byte(2),
            accounts(&[(0x20, b"y")]),
            StorageData::default(),
        );
        top.prepare(&disk);
        let inner = top.inner.read();
        let cumulative = inner.cumulative.as_ref().unwrap();
        assert!(cumulative.contains(account_bloom_hash(&B256::repeat_byte(0x10))));
        assert!(cumulative.contains(account_bloom_hash(&B256::repeat_byte(0x20))));
    }

    #[test]
    fn lists_are_sorted_and_memoised() {
        let base = SnapshotLayer::Disk(disk());
        let account = B256::repeat_byte(0xaa);
        let mut storage = StorageData::default();
        storage.insert(
            account,
            Some(
                [(B256::repeat_byte(9), vec![1]), (B256::repeat_byte(3), vec![2])]
                    .into_iter()
                    .collect(),
            ),
        );
        let layer = DiffLayer::new(
            base,
            B256::repeat_byte(1),
            accounts(&[(0x30, b"c"), (0x10, b"a"), (0x20, b"b")]),
            storage,
        );
        let list = layer.account_list();
        assert_eq!(
            list,
            vec![
                B256::repeat_byte(0x10),
                B256::repeat_byte(0x20),
                B256::repeat_byte(0x30)
            ]
        );
        assert_eq!(layer.account_list(), list);

        let slots = layer.storage_list(&account);
        assert_eq!(*slots, vec![B256::repeat_byte(3), B256::repeat_byte(9)]);
        // Unknown account yields an empty list.
        assert!(layer.storage_list(&B256::repeat_byte(0xbb)).is_empty());
    }
}
