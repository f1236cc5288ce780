//! Background regeneration of the flat snapshot from the authoritative trie.
//!
//! The generator walks the account key space (and, per contract, the storage
//! key space) in bounded segments. For every segment it first asks the range
//! prover whether the pre-existing flat data already matches the trie; only
//! failed segments fall back to trie iteration, assisted by a relay cache
//! built from the collected batch. Progress is journalled with every batch
//! flush, so an interrupted run resumes exactly where it stopped.
use crate::account::{full_account_rlp, Account};
use crate::constant::{
    account_snapshot_key, storage_snapshot_key, storage_snapshot_prefix, ACCOUNT_CHECK_RANGE,
    IDEAL_BATCH_SIZE, SNAPSHOT_ACCOUNT_PREFIX, SNAPSHOT_GENERATOR_KEY, SNAPSHOT_ROOT_KEY,
    STORAGE_CHECK_RANGE,
};
use crate::snapshot::disk_layer::{AbortReply, DiskLayer};
use crate::snapshot::relay::RelayCache;
use crate::snapshot::SnapshotError;
use crate::traits::{KeyValueStore, NodeReader, WriteBatch};
use crate::trie::{verify_range_proof, ProofError, StackTrie, Trie, EMPTY_ROOT};
use alloy_primitives::{Bytes, B256, KECCAK256_EMPTY};
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};
use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// How often the generator reports progress while running.
const LOG_INTERVAL: Duration = Duration::from_secs(8);

/// Statistics gathered by the snapshot generator, returned through the abort
/// rendezvous and partially persisted with the progress journal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    /// Accounts indexed, generated or recovered.
    pub accounts: u64,
    /// Storage slots indexed, generated or recovered.
    pub slots: u64,
    /// Total bytes of flat data indexed.
    pub storage: u64,
    /// Accounts written from the trie.
    pub generated_accounts: u64,
    /// Accounts confirmed by range proofs.
    pub recovered_accounts: u64,
    /// Stale flat accounts deleted.
    pub wiped_accounts: u64,
    /// Account ranges that were entirely missing from the flat store.
    pub missall_accounts: u64,
    /// Storage slots written from the trie.
    pub generated_slots: u64,
    /// Storage slots confirmed by range proofs.
    pub recovered_slots: u64,
    /// Stale flat slots deleted.
    pub wiped_slots: u64,
    /// Storage ranges that were entirely missing from the flat store.
    pub missall_storage: u64,
    /// Range proofs that confirmed pre-existing flat data.
    pub proved_ranges: u64,
    /// Range proofs that failed and forced regeneration.
    pub failed_range_proofs: u64,
}

impl GeneratorStats {
    /// Emits a contextual progress log with the marker position split into
    /// its account and slot halves.
    fn log(&self, msg: &str, root: B256, marker: Option<&[u8]>) {
        match marker {
            Some(marker) if marker.len() == 64 => info!(
                %root,
                account = %hex::encode(&marker[..32]),
                at = %hex::encode(&marker[32..]),
                accounts = self.accounts,
                slots = self.slots,
                storage = self.storage,
                "{msg}"
            ),
            Some(marker) if marker.len() == 32 => info!(
                %root,
                at = %hex::encode(marker),
                accounts = self.accounts,
                slots = self.slots,
                storage = self.storage,
                "{msg}"
            ),
            _ => info!(
                %root,
                accounts = self.accounts,
                slots = self.slots,
                storage = self.storage,
                "{msg}"
            ),
        }
    }
}

/// Persisted generator progress record.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
struct JournalGenerator {
    /// Whether generation finished; `marker` is meaningless once set.
    done: bool,
    /// Resume position: empty, 32-byte account prefix or 64-byte
    /// account-and-slot prefix.
    marker: Bytes,
    accounts: u64,
    slots: u64,
    storage: u64,
}

fn progress_label(marker: Option<&[u8]>) -> String {
    match marker {
        None => "done".into(),
        Some([]) => "empty".into(),
        Some(marker) if marker.len() <= 32 => hex::encode(marker),
        Some(marker) => format!("{}:{}", hex::encode(&marker[..32]), hex::encode(&marker[32..])),
    }
}

/// Queues the generator progress record into the batch so it is persisted
/// atomically with the flat data it describes.
fn journal_progress(batch: &mut WriteBatch, marker: Option<&[u8]>, stats: &GeneratorStats) {
    let entry = JournalGenerator {
        done: marker.is_none(),
        marker: Bytes::copy_from_slice(marker.unwrap_or_default()),
        accounts: stats.accounts,
        slots: stats.slots,
        storage: stats.storage,
    };
    debug!(progress = %progress_label(marker), "Journalled generator progress");
    batch.put(SNAPSHOT_GENERATOR_KEY.to_vec(), alloy_rlp::encode(&entry));
}

fn store_err<E: fmt::Debug>(err: E) -> SnapshotError {
    SnapshotError::Store(format!("{err:?}"))
}

/// Lexicographic successor of a key; `None` once the key space overflows.
fn increase_key(key: &[u8]) -> Option<Vec<u8>> {
    let mut key = key.to_vec();
    for byte in key.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return Some(key);
        }
    }
    None
}

/// Deletes every flat entry under `prefix` whose key has the given length.
/// Runs its own batches, independent of the generator batch.
fn wipe_key_range<S: KeyValueStore>(
    db: &S,
    prefix: &[u8],
    key_len: usize,
) -> Result<u64, SnapshotError> {
    const WIPE_CHUNK: usize = 512;
    let mut wiped = 0u64;
    let mut origin: Vec<u8> = Vec::new();
    loop {
        let entries = db.entries(prefix, &origin, WIPE_CHUNK).map_err(store_err)?;
        if entries.is_empty() {
            return Ok(wiped);
        }
        let mut batch = WriteBatch::new();
        for (key, _) in &entries {
            if key.len() == key_len {
                batch.delete(key.clone());
                wiped += 1;
            }
        }
        db.write_batch(&batch).map_err(store_err)?;
        if entries.len() < WIPE_CHUNK {
            return Ok(wiped);
        }
        let (last, _) = entries.last().expect("entries non-empty");
        origin = last[prefix.len()..].to_vec();
        origin.push(0);
    }
}

/// The state segment kind being processed, for logging and statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RangeKind {
    Account,
    Storage,
}

impl RangeKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Storage => "storage",
        }
    }
}

/// Output of range proving, usable whether proving succeeded or not.
struct ProveOutcome {
    /// Keys of all flat elements iterated, even if proving failed.
    keys: Vec<B256>,
    /// Values of all flat elements iterated, converted where requested.
    vals: Vec<Vec<u8>>,
    /// The flat store holds more entries past this segment.
    disk_more: bool,
    /// The trie holds more entries past this segment (only meaningful for a
    /// successful proof).
    trie_more: bool,
    /// Why the segment is not valid, if it is not.
    proof_err: Option<ProofError>,
}

impl ProveOutcome {
    fn valid(&self) -> bool {
        self.proof_err.is_none()
    }

    /// Last iterated flat key, proving outcome notwithstanding.
    fn last(&self) -> Option<B256> {
        self.keys.last().copied()
    }
}

/// Collects up to `max` flat entries under `prefix` from `origin` and checks
/// them against the trie at `root` with a range proof. When the segment
/// covers the whole remaining key space, the batch is hashed with a stack
/// trie instead and no edge proofs are needed.
fn prove_range<S: KeyValueStore + NodeReader>(
    db: &S,
    root: B256,
    prefix: &[u8],
    kind: RangeKind,
    origin: Option<&[u8]>,
    max: usize,
    value_convert: Option<fn(&[u8]) -> Result<Vec<u8>, alloy_rlp::Error>>,
) -> Result<ProveOutcome, SnapshotError> {
    let mut keys: Vec<B256> = Vec::new();
    let mut vals: Vec<Vec<u8>> = Vec::new();
    let mut disk_more = false;

    let scan = db
        .entries(prefix, origin.unwrap_or_default(), max + 1)
        .map_err(store_err)?;
    for (key, value) in scan {
        if key.len() != prefix.len() + 32 {
            continue;
        }
        if keys.len() == max {
            disk_more = true;
            break;
        }
        keys.push(B256::from_slice(&key[prefix.len()..]));
        match value_convert {
            None => vals.push(value),
            Some(convert) => match convert(&value) {
                Ok(converted) => vals.push(converted),
                // The flat data is corrupt (invalid slim account). Keep the
                // original value so key and value counts stay aligned and
                // let the range proof fail: the trie fallback then heals the
                // entry. Do not abort here.
                Err(_) => vals.push(value),
            },
        }
    }

    // The flat state is exhausted from the very beginning: hash the entire
    // batch and compare roots directly.
    if origin.is_none() && !disk_more {
        let mut stack = StackTrie::new(None);
        let mut proof_err = None;
        for (key, value) in keys.iter().zip(&vals) {
            if let Err(err) = stack.update(*key, value.clone()) {
                proof_err = Some(ProofError::from(err));
                break;
            }
        }
        if proof_err.is_none() {
            let have = stack.hash();
            if have != root {
                proof_err = Some(ProofError::RootMismatch { have, want: root });
            }
        }
        return Ok(ProveOutcome {
            keys,
            vals,
            disk_more: false,
            trie_more: false,
            proof_err,
        });
    }

    // Chunked flat state: generate edge proofs for verification.
    let trie = Trie::new(root, db).map_err(|_| SnapshotError::MissingTrie(root))?;
    let origin_hash = origin
        .filter(|bytes| bytes.len() == 32)
        .map(B256::from_slice)
        .unwrap_or(B256::ZERO);
    let proof_db = crate::mem_store::MemStore::new();
    if let Err(err) = trie.prove(&origin_hash, &proof_db) {
        debug!(kind = kind.as_str(), origin = %origin_hash, %err, "Failed to prove range");
        return Ok(ProveOutcome {
            keys,
            vals,
            disk_more,
            trie_more: false,
            proof_err: Some(err.into()),
        });
    }
    if let Some(last) = keys.last() {
        if let Err(err) = trie.prove(last, &proof_db) {
            debug!(kind = kind.as_str(), last = %last, %err, "Failed to prove range");
            return Ok(ProveOutcome {
                keys,
                vals,
                disk_more,
                trie_more: false,
                proof_err: Some(err.into()),
            });
        }
    }
    let last = keys.last().copied();
    match verify_range_proof(root, &origin_hash, last.as_ref(), &keys, &vals, &proof_db) {
        Ok(trie_more) => Ok(ProveOutcome {
            keys,
            vals,
            disk_more,
            trie_more,
            proof_err: None,
        }),
        Err(err) => Ok(ProveOutcome {
            keys,
            vals,
            disk_more,
            trie_more: false,
            proof_err: Some(err),
        }),
    }
}

/// Per-element callback of [`generate_range`]. `delete` asks for the element
/// to be removed from the flat store; `write` asks for it to be (re)written
/// with `val`; neither means the element is already correct. Values are in
/// the canonical trie encoding, not the slim flat format.
type OnState<'a> = dyn FnMut(&[u8], &[u8], bool, bool) -> Result<(), SnapshotError> + 'a;

/// What one range step accomplished.
struct RangeOutcome {
    /// Both the flat store and the trie are exhausted past this segment.
    exhausted: bool,
    /// Last flat key involved, the resume point for the next segment.
    last: Option<B256>,
    /// The segment failed its range proof and was regenerated.
    proof_failed: bool,
    /// The flat store held nothing at all for this range.
    missall: bool,
}

/// Generates one state segment: either confirms the existing flat data via
/// range proof and skips regeneration, or iterates the trie to rebuild the
/// segment on demand, deleting stale flat entries along the way.
fn generate_range<S: KeyValueStore + NodeReader>(
    db: &S,
    root: B256,
    prefix: &[u8],
    kind: RangeKind,
    origin: Option<&[u8]>,
    max: usize,
    on_state: &mut OnState<'_>,
    value_convert: Option<fn(&[u8]) -> Result<Vec<u8>, alloy_rlp::Error>>,
) -> Result<RangeOutcome, SnapshotError> {
    let result = prove_range(db, root, prefix, kind, origin, max, value_convert)?;
    let last = result.last();

    if result.valid() {
        trace!(kind = kind.as_str(), last = ?last, "Proved state range");
        for (key, value) in result.keys.iter().zip(&result.vals) {
            on_state(key.as_slice(), value, false, false)?;
        }
        return Ok(RangeOutcome {
            exhausted: !result.disk_more && !result.trie_more,
            last,
            proof_failed: false,
            missall: false,
        });
    }
    trace!(
        kind = kind.as_str(),
        last = ?last,
        err = %result.proof_err.as_ref().expect("invalid outcome carries an error"),
        "Detected outdated state range"
    );
    // An entirely missing range: for storage this mostly means a duplicated
    // contract storage trie, track it separately to remove statistics noise.
    let missall = origin.is_none() && last.is_none();

    let origin_hash = origin
        .filter(|bytes| bytes.len() == 32)
        .map(B256::from_slice)
        .unwrap_or(B256::ZERO);

    // Use the collected flat batch as a primary node cache for the trie
    // iteration; correct segments mostly resolve from it.
    let trie_more = if result.keys.is_empty() {
        let trie = Trie::new(root, db).map_err(|_| SnapshotError::MissingTrie(root))?;
        regenerate_segment(&trie, kind, origin_hash, last, &result, on_state)?
    } else {
        let relay = RelayCache::from_batch(&result.keys, &result.vals, db);
        let trie = Trie::new(root, &relay).map_err(|_| SnapshotError::MissingTrie(root))?;
        regenerate_segment(&trie, kind, origin_hash, last, &result, on_state)?
    };

    Ok(RangeOutcome {
        exhausted: !trie_more && !result.disk_more,
        last,
        proof_failed: true,
        missall,
    })
}

/// Walks the trie from `origin` up to `last` (inclusive) in lockstep with
/// the collected flat batch, deleting flat entries missing from the trie and
/// (re)writing entries the trie disagrees on.
fn regenerate_segment(
    trie: &Trie<'_>,
    kind: RangeKind,
    origin_hash: B256,
    last: Option<B256>,
    result: &ProveOutcome,
    on_state: &mut OnState<'_>,
) -> Result<bool, SnapshotError> {
    let mut trie_more = false;
    let mut index = 0usize;
    let (mut created, mut updated, mut deleted, mut untouched) = (0u64, 0u64, 0u64, 0u64);

    for item in trie.iter_from(&origin_hash).map_err(store_err)? {
        let (trie_key, trie_val) = item.map_err(store_err)?;
        if let Some(last) = last {
            if trie_key > last {
                trie_more = true;
                break;
            }
        }
        let mut write = true;
        created += 1;
        while index < result.keys.len() {
            match result.keys[index].cmp(&trie_key) {
                std::cmp::Ordering::Less => {
                    // Flat entry with no trie counterpart: delete it.
                    on_state(result.keys[index].as_slice(), &[], false, true)?;
                    index += 1;
                    deleted += 1;
                    continue;
                }
                std::cmp::Ordering::Equal => {
                    // The flat entry can be kept or overwritten in place.
                    created -= 1;
                    write = result.vals[index] != trie_val;
                    if write {
                        updated += 1;
                    } else {
                        untouched += 1;
                    }
                    index += 1;
                }
                std::cmp::Ordering::Greater => {}
            }
            break;
        }
        on_state(trie_key.as_slice(), &trie_val, write, false)?;
    }
    // Delete all stale flat entries remaining beyond the trie content.
    while index < result.keys.len() {
        on_state(result.keys[index].as_slice(), &[], false, true)?;
        index += 1;
        deleted += 1;
    }
    debug!(
        kind = kind.as_str(),
        created, updated, untouched, deleted,
        "Regenerated state range"
    );
    Ok(trie_more)
}

/// Mutable context threaded through the generation callbacks: the pending
/// write batch, running statistics and the shutdown rendezvous.
struct GenContext {
    batch: WriteBatch,
    stats: GeneratorStats,
    abort: Option<AbortReply>,
    abort_rx: mpsc::Receiver<AbortReply>,
    logged: Instant,
    /// Account hash a resumed run is positioned inside, cleared after the
    /// first account is processed.
    acc_marker: Option<Vec<u8>>,
}

impl GenContext {
    /// Polls the shutdown rendezvous and flushes the batch once it exceeds
    /// its byte allowance or an abort was observed. The progress marker is
    /// journalled into the same batch and only published to the layer after
    /// the write succeeded, so persisted markers never run ahead of data.
    fn check_and_flush<S: KeyValueStore + NodeReader>(
        &mut self,
        dl: &DiskLayer<S>,
        current: &[u8],
    ) -> Result<(), SnapshotError> {
        if self.abort.is_none() {
            if let Ok(reply) = self.abort_rx.try_recv() {
                self.abort = Some(reply);
            }
        }
        if self.batch.value_size() > IDEAL_BATCH_SIZE || self.abort.is_some() {
            // Flush even an empty batch: recovered-only progress still moves
            // the marker forward.
            journal_progress(&mut self.batch, Some(current), &self.stats);
            dl.db().write_batch(&self.batch).map_err(store_err)?;
            self.batch.reset();
            dl.set_gen_marker(Some(current.to_vec()));
            if self.abort.is_some() {
                self.stats
                    .log("Aborting state snapshot generation", dl.root(), Some(current));
                return Err(SnapshotError::Aborted);
            }
        }
        if self.logged.elapsed() > LOG_INTERVAL {
            self.stats
                .log("Generating state snapshot", dl.root(), Some(current));
            self.logged = Instant::now();
        }
        Ok(())
    }

    fn record_outcome(&mut self, kind: RangeKind, outcome: &RangeOutcome) {
        if outcome.proof_failed {
            self.stats.failed_range_proofs += 1;
            if outcome.missall {
                match kind {
                    RangeKind::Account => self.stats.missall_accounts += 1,
                    RangeKind::Storage => self.stats.missall_storage += 1,
                }
            }
        } else {
            self.stats.proved_ranges += 1;
        }
    }
}

/// Account callback: decodes the trie account, writes or deletes its slim
/// flat entry and sweeps the contract storage space where needed.
fn on_account_impl<S: KeyValueStore + NodeReader>(
    dl: &Arc<DiskLayer<S>>,
    db: &S,
    ctx: &mut GenContext,
    key: &[u8],
    val: &[u8],
    write: bool,
    delete: bool,
) -> Result<(), SnapshotError> {
    let account_hash = B256::from_slice(key);
    if delete {
        ctx.batch.delete(account_snapshot_key(&account_hash));
        ctx.stats.wiped_accounts += 1;
        // Clear any dangling storage the deleted account left behind.
        let prefix = storage_snapshot_prefix(&account_hash);
        ctx.stats.wiped_slots += wipe_key_range(db, &prefix, prefix.len() + 32)?;
        return Ok(());
    }
    let account =
        Account::from_rlp(val).map_err(|err| SnapshotError::CorruptAccount(err.to_string()))?;
    let resumed_account = ctx.acc_marker.as_deref() == Some(key);

    // The account positioned inside a resumed run was already written by the
    // interrupted pass; everything else is written or recovered here.
    if !resumed_account {
        let data_len = if write {
            let data = account.slim_rlp();
            let len = data.len();
            ctx.batch.put(account_snapshot_key(&account_hash), data);
            ctx.stats.generated_accounts += 1;
            len
        } else {
            // Approximate the slim size from the canonical encoding, saving
            // a round of re-encoding.
            let mut len = val.len();
            if account.code_hash == KECCAK256_EMPTY {
                len -= 32;
            }
            if account.root == *EMPTY_ROOT {
                len -= 32;
            }
            ctx.stats.recovered_accounts += 1;
            len
        };
        ctx.stats.storage += (1 + 32 + data_len) as u64;
        ctx.stats.accounts += 1;
    }
    ctx.check_and_flush(dl.as_ref(), key)?;

    if account.root == *EMPTY_ROOT {
        // No storage trie, but stale flat slots from an earlier incarnation
        // of the account must still be cleared.
        let prefix = storage_snapshot_prefix(&account_hash);
        ctx.stats.wiped_slots += wipe_key_range(db, &prefix, prefix.len() + 32)?;
    } else {
        // Resume mid-account if the interrupted run stopped inside this
        // account's storage sweep.
        let mut store_origin: Option<Vec<u8>> = None;
        if resumed_account {
            if let Some(marker) = dl.gen_marker() {
                if marker.len() > 32 {
                    store_origin = Some(marker[32..].to_vec());
                }
            }
        }
        let prefix = storage_snapshot_prefix(&account_hash);
        loop {
            let outcome = generate_range(
                db,
                account.root,
                &prefix,
                RangeKind::Storage,
                store_origin.as_deref(),
                STORAGE_CHECK_RANGE,
                &mut |slot_key, slot_val, write, delete| {
                    on_storage_impl(dl, ctx, &account_hash, slot_key, slot_val, write, delete)
                },
                None,
            )?;
            ctx.record_outcome(RangeKind::Storage, &outcome);
            if outcome.exhausted {
                break;
            }
            match outcome.last.as_ref().and_then(|last| increase_key(last.as_slice())) {
                Some(next) => store_origin = Some(next),
                // The last slot sits at 0xff..ff, nothing follows.
                None => break,
            }
        }
    }
    // Some account processed, only the first one of a resumed run is
    // special.
    ctx.acc_marker = None;
    Ok(())
}

/// Storage callback: writes, keeps or deletes one flat slot entry.
fn on_storage_impl<S: KeyValueStore + NodeReader>(
    dl: &Arc<DiskLayer<S>>,
    ctx: &mut GenContext,
    account_hash: &B256,
    key: &[u8],
    val: &[u8],
    write: bool,
    delete: bool,
) -> Result<(), SnapshotError> {
    let slot_hash = B256::from_slice(key);
    if delete {
        ctx.batch.delete(storage_snapshot_key(account_hash, &slot_hash));
        ctx.stats.wiped_slots += 1;
        return Ok(());
    }
    if write {
        ctx.batch
            .put(storage_snapshot_key(account_hash, &slot_hash), val.to_vec());
        ctx.stats.generated_slots += 1;
    } else {
        ctx.stats.recovered_slots += 1;
    }
    ctx.stats.storage += (1 + 64 + val.len()) as u64;
    ctx.stats.slots += 1;

    let mut current = Vec::with_capacity(64);
    current.extend_from_slice(account_hash.as_slice());
    current.extend_from_slice(key);
    ctx.check_and_flush(dl.as_ref(), &current)
}

/// The background generation loop. Iterates the account trie and all nested
/// storage tries segment by segment until the key space is exhausted, then
/// parks on the abort rendezvous waiting to be collected. The final
/// statistics are both sent through the rendezvous and returned.
fn run<S: KeyValueStore + NodeReader + 'static>(
    dl: Arc<DiskLayer<S>>,
    abort_rx: mpsc::Receiver<AbortReply>,
    stats: GeneratorStats,
) -> GeneratorStats {
    let root = dl.root();
    let marker = dl.gen_marker().unwrap_or_default();
    // Resuming mid-keyspace restarts with a single-account range so the
    // interrupted account's storage sweep finishes first.
    let (acc_marker, mut account_range) = if marker.is_empty() {
        (None, ACCOUNT_CHECK_RANGE)
    } else {
        (Some(marker[..32].to_vec()), 1)
    };
    stats.log("Resuming state snapshot generation", root, Some(&marker));

    let db = dl.db().clone();
    let mut ctx = GenContext {
        batch: WriteBatch::new(),
        stats,
        abort: None,
        abort_rx,
        logged: Instant::now(),
        acc_marker: acc_marker.clone(),
    };
    let mut acc_origin = acc_marker;

    loop {
        let outcome = {
            let dl_ref = &dl;
            let ctx_ref = &mut ctx;
            generate_range(
                db.as_ref(),
                root,
                SNAPSHOT_ACCOUNT_PREFIX,
                RangeKind::Account,
                acc_origin.as_deref(),
                account_range,
                &mut |key, val, write, delete| {
                    on_account_impl(dl_ref, db.as_ref(), ctx_ref, key, val, write, delete)
                },
                Some(full_account_rlp),
            )
        };
        match outcome {
            Ok(outcome) => {
                ctx.record_outcome(RangeKind::Account, &outcome);
                if outcome.exhausted {
                    break;
                }
                match outcome.last.as_ref().and_then(|last| increase_key(last.as_slice())) {
                    Some(next) => acc_origin = Some(next),
                    // The last account sits at 0xff..ff, nothing follows.
                    None => break,
                }
                account_range = ACCOUNT_CHECK_RANGE;
            }
            Err(err) => {
                if !matches!(err, SnapshotError::Aborted) {
                    error!(%err, "State snapshot generation failed");
                }
                let GenContext {
                    abort,
                    abort_rx,
                    stats,
                    ..
                } = ctx;
                let reply = match abort {
                    Some(reply) => Some(reply),
                    None => {
                        // Interrupted by an internal error: hold position
                        // until someone comes to collect the statistics.
                        drop(dl);
                        abort_rx.recv().ok()
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(Some(stats.clone()));
                }
                return stats;
            }
        }
    }

    // Snapshot fully generated. Persist the terminal progress record even if
    // nothing else is pending, to mark the snapshot complete.
    journal_progress(&mut ctx.batch, None, &ctx.stats);
    if let Err(err) = db.write_batch(&ctx.batch).map_err(store_err) {
        error!(%err, "Failed to flush the final batch");
        let GenContext { abort, abort_rx, stats, .. } = ctx;
        let reply = match abort {
            Some(reply) => Some(reply),
            None => {
                drop(dl);
                abort_rx.recv().ok()
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(Some(stats.clone()));
        }
        return stats;
    }
    ctx.batch.reset();

    info!(
        accounts = ctx.stats.accounts,
        slots = ctx.stats.slots,
        storage = ctx.stats.storage,
        "Generated state snapshot"
    );
    dl.set_gen_marker(None);
    dl.gen_pending.close();

    // Someone will be looking for us, wait it out. Dropping the layer handle
    // first lets the rendezvous collapse once the layer itself is abandoned.
    let GenContext { abort, abort_rx, stats, .. } = ctx;
    drop(dl);
    let reply = match abort {
        Some(reply) => Some(reply),
        None => abort_rx.recv().ok(),
    };
    if let Some(reply) = reply {
        let _ = reply.send(None);
    }
    stats
}

fn spawn_generator<S: KeyValueStore + NodeReader + 'static>(
    dl: &Arc<DiskLayer<S>>,
    stats: GeneratorStats,
) {
    let (abort_tx, abort_rx) = mpsc::channel();
    *dl.gen_abort.lock() = Some(abort_tx);
    let layer = dl.clone();
    std::thread::Builder::new()
        .name("snapshot-generator".into())
        .spawn(move || {
            run(layer, abort_rx, stats);
        })
        .expect("failed to spawn the snapshot generator");
}

/// Regenerates a brand new snapshot based on the existing trie state at
/// `root`. The disk layer is returned immediately; generation continues in
/// the background until done.
pub fn generate_snapshot<S: KeyValueStore + NodeReader + 'static>(
    db: Arc<S>,
    root: B256,
    cache_bytes: usize,
) -> Result<Arc<DiskLayer<S>>, SnapshotError> {
    // Persist an initialized-but-empty marker before anything else so a
    // crash right here resumes from scratch instead of trusting stale data.
    let stats = GeneratorStats::default();
    let mut batch = WriteBatch::new();
    batch.put(SNAPSHOT_ROOT_KEY.to_vec(), root.as_slice().to_vec());
    journal_progress(&mut batch, Some(&[]), &stats);
    db.write_batch(&batch).map_err(store_err)?;

    let dl = Arc::new(DiskLayer::new(db, root, cache_bytes, Some(Vec::new())));
    spawn_generator(&dl, stats);
    debug!(%root, "Started snapshot generation");
    Ok(dl)
}

/// Rebuilds the disk layer from a persisted generator journal, resuming
/// background generation from the recorded marker if it did not finish.
pub fn resume_snapshot<S: KeyValueStore + NodeReader + 'static>(
    db: Arc<S>,
    root: B256,
    cache_bytes: usize,
) -> Result<Arc<DiskLayer<S>>, SnapshotError> {
    if let Some(persisted) = db.get(SNAPSHOT_ROOT_KEY).map_err(store_err)? {
        if persisted != root.as_slice() {
            return Err(SnapshotError::Store(format!(
                "persisted snapshot root {} does not match {root}",
                hex::encode(&persisted)
            )));
        }
    }
    let blob = db
        .get(SNAPSHOT_GENERATOR_KEY)
        .map_err(store_err)?
        .ok_or_else(|| SnapshotError::Store("no generator progress journalled".into()))?;
    let record = JournalGenerator::decode(&mut blob.as_slice())
        .map_err(|err| SnapshotError::Store(format!("corrupt generator journal: {err}")))?;

    let marker = (!record.done).then(|| record.marker.to_vec());
    let stats = GeneratorStats {
        accounts: record.accounts,
        slots: record.slots,
        storage: record.storage,
        ..GeneratorStats::default()
    };
    let generating = marker.is_some();
    let dl = Arc::new(DiskLayer::new(db, root, cache_bytes, marker));
    if generating {
        spawn_generator(&dl, stats);
        debug!(%root, "Resumed snapshot generation");
    }
    Ok(dl)
}
