//! Constants that determine the persisted snapshot layout and the tuning of
//! generation and diff-layer aggregation.
use alloy_primitives::B256;

/// Key under which the root hash of the current disk layer is persisted.
pub const SNAPSHOT_ROOT_KEY: &[u8] = b"SnapshotRoot";

/// Key under which the generator progress record is persisted.
pub const SNAPSHOT_GENERATOR_KEY: &[u8] = b"SnapshotGenerator";

/// Prefix of flat account entries: `SNAPSHOT_ACCOUNT_PREFIX || account_hash`.
pub const SNAPSHOT_ACCOUNT_PREFIX: &[u8] = b"a";

/// Prefix of flat storage entries:
/// `SNAPSHOT_STORAGE_PREFIX || account_hash || slot_hash`.
pub const SNAPSHOT_STORAGE_PREFIX: &[u8] = b"o";

/// Upper limit of the number of accounts involved in each range check. If the
/// value is too large the failure rate of range proofs increases, if it is
/// too small recovery of pre-existing flat data becomes inefficient.
pub const ACCOUNT_CHECK_RANGE: usize = 128;

/// Upper limit of the number of storage slots involved in each range check.
/// Same trade-off as [`ACCOUNT_CHECK_RANGE`].
pub const STORAGE_CHECK_RANGE: usize = 1024;

/// Maximum size of the bottom-most diff layer that aggregates the writes from
/// above until it is flushed downwards.
///
/// Note, bumping this up drastically increases the size of the bloom filters
/// carried by every diff layer.
pub const AGGREGATOR_MEMORY_LIMIT: u64 = 4 * 1024 * 1024;

/// Approximate number of items that end up in the aggregator layer before it
/// is flushed out. A plain account weighs around 14B (+hash), a storage slot
/// 32B (+hash), a deleted slot 0B (+hash). All in all the average entry is
/// about 47B; a smaller divisor keeps the estimate on the safe side.
pub const AGGREGATOR_ITEM_LIMIT: u64 = AGGREGATOR_MEMORY_LIMIT / 42;

/// Target false positive rate of the cumulative bloom filter when the
/// aggregator layer is at its fullest.
pub const BLOOM_TARGET_ERROR: f64 = 0.02;

/// Number of batched value bytes after which the generator flushes its write
/// batch and republishes the progress marker. A crash never loses more than
/// one batch of progress beyond the persisted marker.
pub const IDEAL_BATCH_SIZE: usize = 100 * 1024;

/// Builds the flat store key of an account entry.
pub fn account_snapshot_key(account_hash: &B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(SNAPSHOT_ACCOUNT_PREFIX.len() + 32);
    key.extend_from_slice(SNAPSHOT_ACCOUNT_PREFIX);
    key.extend_from_slice(account_hash.as_slice());
    key
}

/// Builds the flat store key of a storage slot entry.
pub fn storage_snapshot_key(account_hash: &B256, slot_hash: &B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(SNAPSHOT_STORAGE_PREFIX.len() + 64);
    key.extend_from_slice(SNAPSHOT_STORAGE_PREFIX);
    key.extend_from_slice(account_hash.as_slice());
    key.extend_from_slice(slot_hash.as_slice());
    key
}

/// Builds the prefix covering every storage slot of one account.
pub fn storage_snapshot_prefix(account_hash: &B256) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(SNAPSHOT_STORAGE_PREFIX.len() + 32);
    prefix.extend_from_slice(SNAPSHOT_STORAGE_PREFIX);
    prefix.extend_from_slice(account_hash.as_slice());
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        let account = B256::repeat_byte(0xab);
        let slot = B256::repeat_byte(0xcd);

        let akey = account_snapshot_key(&account);
        assert_eq!(akey.len(), 33);
        assert_eq!(akey[0], b'a');
        assert_eq!(&akey[1..], account.as_slice());

        let skey = storage_snapshot_key(&account, &slot);
        assert_eq!(skey.len(), 65);
        assert_eq!(skey[0], b'o');
        assert_eq!(&skey[1..33], account.as_slice());
        assert_eq!(&skey[33..], slot.as_slice());

        assert!(skey.starts_with(&storage_snapshot_prefix(&account)));
    }
}
