//! Scoped journalling of state mutations.
//!
//! Transaction execution opens one scope per call frame with [`Journal::snapshot`]
//! and records the pre-image of every first change inside the scope. A scope
//! either reverts as a whole, restoring every pre-image in a fixed order, or
//! is discarded into its parent. The journal sits above a plain in-RAM
//! [`JournalState`] of state objects; [`JournaledState`] bundles the two and
//! keeps recording and mutation in lockstep.
//!
//! Invoking any change recorder with no open scope is a programming error
//! and panics, as does reverting to an unknown revision.
use alloy_primitives::{address, keccak256, Address, B256, U256, KECCAK256_EMPTY};
use rustc_hash::{FxHashMap, FxHashSet};

/// The RIPEMD precompile. Touching it keeps one extra dirty mark per touch,
/// preserving a consensus quirk from the original chain history.
const RIPEMD_ADDR: Address = address!("0000000000000000000000000000000000000003");

/// A log emitted during execution, tracked per transaction hash.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Log {
    /// Emitting contract.
    pub address: Address,
    /// Indexed topics.
    pub topics: Vec<B256>,
    /// Payload bytes.
    pub data: Vec<u8>,
}

/// An in-RAM state object: the journable account state plus its storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateObject {
    /// Account nonce.
    pub nonce: u64,
    /// Account balance.
    pub balance: U256,
    /// Hash of the account code.
    pub code_hash: B256,
    /// The code itself; `None` means not loaded, fetched on demand.
    pub code: Option<Vec<u8>>,
    /// Marked for destruction at the end of the transaction.
    pub destructed: bool,
    /// Dirty storage slots.
    pub storage: FxHashMap<B256, B256>,
}

impl Default for StateObject {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            code_hash: KECCAK256_EMPTY,
            code: None,
            destructed: false,
            storage: FxHashMap::default(),
        }
    }
}

/// The mutable in-RAM state the journal records against.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JournalState {
    /// Live state objects by address.
    pub objects: FxHashMap<Address, StateObject>,
    /// Addresses touched since the last commit.
    pub dirty_objects: FxHashSet<Address>,
    /// Gas refund counter.
    pub refund: u64,
    /// Logs per transaction hash.
    pub logs: FxHashMap<B256, Vec<Log>>,
    /// Total number of logs across all transactions.
    pub log_size: u64,
    /// Access list: warmed addresses.
    pub access_addresses: FxHashSet<Address>,
    /// Access list: warmed (address, slot) pairs.
    pub access_slots: FxHashSet<(Address, B256)>,
    /// Transient storage, cleared between transactions.
    pub transient: FxHashMap<(Address, B256), B256>,
}

/// The journable snapshot of an account: everything but the storage root,
/// plus the destruction flag. `code_hash == None` stands for the empty code
/// hash.
#[derive(Clone, Debug, PartialEq, Eq)]
struct JournalAccount {
    nonce: u64,
    balance: U256,
    code_hash: Option<B256>,
    destructed: bool,
}

/// All changes recorded within a single call scope. They are reverted as a
/// whole or committed as a whole, never partially.
#[derive(Debug)]
struct ScopedEntry {
    /// Pre-images of account changes; `None` records a creation, reverted by
    /// deleting the object.
    accounts: FxHashMap<Address, Option<JournalAccount>>,
    /// Refund value before the first change in this scope; -1 when the
    /// refund was not touched.
    refund: i64,
    /// Transaction hashes that gained a log in this scope, in order.
    logs: Vec<B256>,
    /// Addresses added to the access list in this scope.
    access_addresses: Vec<Address>,
    /// Slots added to the access list in this scope.
    access_slots: Vec<(Address, B256)>,
    /// First previous value per touched storage slot.
    storage: FxHashMap<Address, FxHashMap<B256, B256>>,
    /// First previous value per touched transient slot.
    transient: FxHashMap<Address, FxHashMap<B256, B256>>,
}

impl ScopedEntry {
    fn new() -> Self {
        Self {
            accounts: FxHashMap::default(),
            refund: -1,
            logs: Vec::new(),
            access_addresses: Vec::new(),
            access_slots: Vec::new(),
            storage: FxHashMap::default(),
            transient: FxHashMap::default(),
        }
    }

    /// Records an account pre-image unless the address was already recorded
    /// in this scope; the earliest pre-image is what a revert must restore.
    /// Returns whether the address was newly recorded.
    fn account_change(&mut self, addr: Address, account: Option<&StateObject>, destructed: bool) -> bool {
        if self.accounts.contains_key(&addr) {
            return false;
        }
        let snapshot = account.map(|obj| JournalAccount {
            nonce: obj.nonce,
            balance: obj.balance,
            code_hash: (obj.code_hash != KECCAK256_EMPTY).then_some(obj.code_hash),
            destructed,
        });
        self.accounts.insert(addr, snapshot);
        true
    }

    fn refund_change(&mut self, prev: u64) {
        if self.refund == -1 {
            // Refund can never exceed i64::MAX in practice, the sentinel is
            // safe.
            self.refund = prev as i64;
        }
    }

    fn set_state(&mut self, addr: Address, key: B256, prev: B256) {
        // Only the first previous value per slot and scope counts.
        self.storage
            .entry(addr)
            .or_default()
            .entry(key)
            .or_insert(prev);
    }

    fn set_transient_state(&mut self, addr: Address, key: B256, prev: B256) {
        self.transient
            .entry(addr)
            .or_default()
            .entry(key)
            .or_insert(prev);
    }

    /// Applies every recorded pre-image to the state. Order: refund,
    /// accounts, logs, access-list slots, access-list addresses, storage,
    /// transient storage.
    fn revert(&self, state: &mut JournalState, dirties: &mut FxHashMap<Address, i64>) {
        if self.refund != -1 {
            state.refund = self.refund as u64;
        }
        for (addr, data) in &self.accounts {
            match data {
                // Reverting a creation: the object vanishes again.
                None => {
                    state.objects.remove(addr);
                    state.dirty_objects.remove(addr);
                }
                Some(prev) => {
                    let obj = state
                        .objects
                        .get_mut(addr)
                        .expect("journalled account has a state object");
                    obj.nonce = prev.nonce;
                    // Dropping the cached code makes it reload on demand;
                    // avoid that unless the hash actually changed.
                    let target = prev.code_hash.unwrap_or(KECCAK256_EMPTY);
                    if obj.code_hash != target {
                        obj.code_hash = target;
                        obj.code = None;
                    }
                    obj.balance = prev.balance;
                    obj.destructed = prev.destructed;
                }
            }
            if let Some(count) = dirties.get_mut(addr) {
                *count -= 1;
                if *count == 0 {
                    dirties.remove(addr);
                }
            }
        }
        for tx_hash in &self.logs {
            if let Some(logs) = state.logs.get_mut(tx_hash) {
                if logs.len() == 1 {
                    state.logs.remove(tx_hash);
                } else {
                    logs.pop();
                }
            }
            state.log_size -= 1;
        }
        for (addr, slot) in &self.access_slots {
            state.access_slots.remove(&(*addr, *slot));
        }
        for addr in &self.access_addresses {
            state.access_addresses.remove(addr);
        }
        for (addr, changes) in &self.storage {
            let obj = state
                .objects
                .get_mut(addr)
                .expect("journalled storage has a state object");
            for (key, prev) in changes {
                obj.storage.insert(*key, *prev);
            }
        }
        for (addr, changes) in &self.transient {
            for (key, prev) in changes {
                state.transient.insert((*addr, *key), *prev);
            }
        }
    }

    /// Folds this scope into `parent`, keeping the parent's earlier
    /// pre-images. Returns the addresses whose account change collapsed into
    /// an existing parent record.
    fn merge_into(self, parent: &mut ScopedEntry) -> Vec<Address> {
        let mut collapsed = Vec::new();
        for (addr, data) in self.accounts {
            if parent.accounts.contains_key(&addr) {
                collapsed.push(addr);
            } else {
                parent.accounts.insert(addr, data);
            }
        }
        if parent.refund == -1 {
            parent.refund = self.refund;
        }
        parent.logs.extend(self.logs);
        parent.access_addresses.extend(self.access_addresses);
        parent.access_slots.extend(self.access_slots);
        for (addr, changes) in self.storage {
            let slot_map = parent.storage.entry(addr).or_default();
            for (key, prev) in changes {
                slot_map.entry(key).or_insert(prev);
            }
        }
        for (addr, changes) in self.transient {
            let slot_map = parent.transient.entry(addr).or_default();
            for (key, prev) in changes {
                slot_map.entry(key).or_insert(prev);
            }
        }
        collapsed
    }
}

/// Stack of per-call-scope change records with nested snapshot, revert and
/// discard.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<ScopedEntry>,
    /// Number of scopes that touched each address.
    dirties: FxHashMap<Address, i64>,
}

impl Journal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current scope depth.
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// How many scopes have touched the given address.
    pub fn dirty_count(&self, addr: &Address) -> i64 {
        self.dirties.get(addr).copied().unwrap_or(0)
    }

    /// Opens a new scope and returns its revision id.
    pub fn snapshot(&mut self) -> usize {
        let id = self.entries.len();
        self.entries.push(ScopedEntry::new());
        id
    }

    /// Reverts every change made since the revision was taken, popping the
    /// scopes top-down.
    ///
    /// # Panics
    /// Panics if `id` does not address a live revision.
    pub fn revert_to(&mut self, state: &mut JournalState, id: usize) {
        if id >= self.entries.len() {
            panic!("revision id {id} cannot be reverted");
        }
        while self.entries.len() > id {
            let entry = self.entries.pop().expect("checked depth");
            entry.revert(state, &mut self.dirties);
        }
    }

    /// Closes the scope opened at `id` without reverting, folding it and
    /// everything above into the enclosing scope. With `id == 0` the journal
    /// simply forgets its revert ability.
    ///
    /// # Panics
    /// Panics if `id` does not address a live revision.
    pub fn discard(&mut self, id: usize) {
        if id >= self.entries.len() {
            panic!("revision id {id} cannot be discarded");
        }
        let discarded: Vec<ScopedEntry> = self.entries.drain(id..).collect();
        match self.entries.last_mut() {
            Some(parent) => {
                for entry in discarded {
                    for addr in entry.merge_into(parent) {
                        if let Some(count) = self.dirties.get_mut(&addr) {
                            *count -= 1;
                            if *count == 0 {
                                self.dirties.remove(&addr);
                            }
                        }
                    }
                }
            }
            None => {
                // No enclosing scope: the changes stay applied, only the
                // ability to revert them is gone.
            }
        }
    }

    /// Clears the journal for reuse; the entry stack keeps its allocation.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.dirties = FxHashMap::default();
    }

    fn top(&mut self) -> &mut ScopedEntry {
        self.entries
            .last_mut()
            .expect("journal change recorded with no active scope")
    }

    fn account_change(&mut self, addr: Address, account: Option<&StateObject>, destructed: bool) {
        if self.top().account_change(addr, account, destructed) {
            *self.dirties.entry(addr).or_insert(0) += 1;
        }
    }

    /// Records a nonce change pre-image.
    pub fn journal_nonce_change(&mut self, addr: Address, account: &StateObject, destructed: bool) {
        self.account_change(addr, Some(account), destructed);
    }

    /// Records a balance change pre-image.
    pub fn journal_balance_change(&mut self, addr: Address, account: &StateObject, destructed: bool) {
        self.account_change(addr, Some(account), destructed);
    }

    /// Records a code change. It is implicit that the account was not
    /// destructed before.
    pub fn journal_set_code(&mut self, addr: Address, account: &StateObject) {
        self.account_change(addr, Some(account), false);
    }

    /// Records an account creation; reverting deletes the object again.
    pub fn journal_create(&mut self, addr: Address) {
        // Creating a destructed account is not possible, the flag is known
        // to be false.
        self.account_change(addr, None, false);
    }

    /// Records a destruction pre-image. Destructing an already destructed
    /// account is never journalled, so the previous flag is known false.
    pub fn journal_destruct(&mut self, addr: Address, account: &StateObject) {
        self.account_change(addr, Some(account), false);
    }

    /// Records a touch. The RIPEMD precompile keeps one extra dirty mark per
    /// touch.
    pub fn journal_touch(&mut self, addr: Address, account: &StateObject, destructed: bool) {
        self.account_change(addr, Some(account), destructed);
        if addr == RIPEMD_ADDR {
            // Explicitly put it in the dirty cache one extra time.
            *self.dirties.entry(addr).or_insert(0) += 1;
        }
    }

    /// Records that a log was appended for the given transaction.
    pub fn journal_log(&mut self, tx_hash: B256) {
        self.top().logs.push(tx_hash);
    }

    /// Records an access-list address addition.
    pub fn journal_access_list_add_account(&mut self, addr: Address) {
        self.top().access_addresses.push(addr);
    }

    /// Records an access-list slot addition.
    pub fn journal_access_list_add_slot(&mut self, addr: Address, slot: B256) {
        self.top().access_slots.push((addr, slot));
    }

    /// Records the previous value of a storage slot.
    pub fn journal_set_state(&mut self, addr: Address, key: B256, prev: B256) {
        self.top().set_state(addr, key, prev);
    }

    /// Records the previous value of a transient storage slot.
    pub fn journal_set_transient_state(&mut self, addr: Address, key: B256, prev: B256) {
        self.top().set_transient_state(addr, key, prev);
    }

    /// Records the refund counter before its first change in this scope.
    pub fn journal_refund(&mut self, prev: u64) {
        self.top().refund_change(prev);
    }
}

/// An in-RAM state with its journal, keeping every mutation recorded before
/// it is applied.
#[derive(Debug, Default)]
pub struct JournaledState {
    /// The live state objects and transaction side-state.
    pub state: JournalState,
    /// The change journal over `state`.
    pub journal: Journal,
}

impl JournaledState {
    /// Creates an empty journaled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new scope and returns its revision id.
    pub fn snapshot(&mut self) -> usize {
        self.journal.snapshot()
    }

    /// Reverts state and journal to the given revision.
    pub fn revert_to(&mut self, id: usize) {
        self.journal.revert_to(&mut self.state, id);
    }

    /// Closes the given revision without reverting.
    pub fn discard(&mut self, id: usize) {
        self.journal.discard(id);
    }

    /// Creates a fresh, empty account.
    pub fn create_account(&mut self, addr: Address) {
        self.journal.journal_create(addr);
        self.state.objects.insert(addr, StateObject::default());
        self.state.dirty_objects.insert(addr);
    }

    fn object_mut<'a>(objects: &'a mut FxHashMap<Address, StateObject>, addr: &Address) -> &'a mut StateObject {
        objects.get_mut(addr).expect("state object exists")
    }

    /// Sets the nonce of an existing account.
    pub fn set_nonce(&mut self, addr: Address, nonce: u64) {
        let obj = Self::object_mut(&mut self.state.objects, &addr);
        self.journal.journal_nonce_change(addr, obj, obj.destructed);
        obj.nonce = nonce;
    }

    /// Sets the balance of an existing account.
    pub fn set_balance(&mut self, addr: Address, balance: U256) {
        let obj = Self::object_mut(&mut self.state.objects, &addr);
        self.journal.journal_balance_change(addr, obj, obj.destructed);
        obj.balance = balance;
    }

    /// Installs code on an existing account.
    pub fn set_code(&mut self, addr: Address, code: Vec<u8>) {
        let obj = Self::object_mut(&mut self.state.objects, &addr);
        self.journal.journal_set_code(addr, obj);
        obj.code_hash = keccak256(&code);
        obj.code = Some(code);
    }

    /// Marks an account destructed and zeroes its balance.
    pub fn destruct(&mut self, addr: Address) {
        let obj = Self::object_mut(&mut self.state.objects, &addr);
        if obj.destructed {
            return;
        }
        self.journal.journal_destruct(addr, obj);
        obj.destructed = true;
        obj.balance = U256::ZERO;
    }

    /// Touches an account, marking it dirty without changing it.
    pub fn touch(&mut self, addr: Address) {
        let obj = Self::object_mut(&mut self.state.objects, &addr);
        self.journal.journal_touch(addr, obj, obj.destructed);
    }

    /// Appends a log under the given transaction hash.
    pub fn add_log(&mut self, tx_hash: B256, log: Log) {
        self.journal.journal_log(tx_hash);
        self.state.logs.entry(tx_hash).or_default().push(log);
        self.state.log_size += 1;
    }

    /// Warms an address in the access list.
    pub fn access_list_add_account(&mut self, addr: Address) {
        if self.state.access_addresses.insert(addr) {
            self.journal.journal_access_list_add_account(addr);
        }
    }

    /// Warms a slot (and its address) in the access list.
    pub fn access_list_add_slot(&mut self, addr: Address, slot: B256) {
        self.access_list_add_account(addr);
        if self.state.access_slots.insert((addr, slot)) {
            self.journal.journal_access_list_add_slot(addr, slot);
        }
    }

    /// Writes a storage slot of an existing account.
    pub fn set_state(&mut self, addr: Address, key: B256, value: B256) {
        let obj = Self::object_mut(&mut self.state.objects, &addr);
        let prev = obj.storage.get(&key).copied().unwrap_or_default();
        self.journal.journal_set_state(addr, key, prev);
        obj.storage.insert(key, value);
    }

    /// Writes a transient storage slot.
    pub fn set_transient_state(&mut self, addr: Address, key: B256, value: B256) {
        let prev = self
            .state
            .transient
            .get(&(addr, key))
            .copied()
            .unwrap_or_default();
        self.journal.journal_set_transient_state(addr, key, prev);
        self.state.transient.insert((addr, key), value);
    }

    /// Sets the refund counter.
    pub fn set_refund(&mut self, refund: u64) {
        self.journal.journal_refund(self.state.refund);
        self.state.refund = refund;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tag: u8) -> Address {
        Address::repeat_byte(tag)
    }

    #[test]
    fn nested_revert_restores_the_inner_revision() {
        let mut js = JournaledState::new();
        let a = addr(0x11);
        let outer = js.snapshot();
        js.create_account(a);
        js.set_nonce(a, 5);

        let inner = js.snapshot();
        js.set_nonce(a, 9);
        js.set_code(a, b"contract code".to_vec());
        js.revert_to(inner);

        let obj = &js.state.objects[&a];
        assert_eq!(obj.nonce, 5);
        assert_eq!(obj.code_hash, KECCAK256_EMPTY);
        assert!(obj.code.is_none());

        js.revert_to(outer);
        assert!(!js.state.objects.contains_key(&a));
    }

    #[test]
    fn revert_law_restores_the_state_bitwise() {
        let mut js = JournaledState::new();
        let (a, b) = (addr(0x21), addr(0x22));
        let tx = B256::repeat_byte(0x77);
        js.snapshot();
        js.create_account(a);
        js.set_balance(a, U256::from(1000u64));
        js.set_state(a, B256::repeat_byte(1), B256::repeat_byte(0xaa));
        js.set_refund(17);
        js.access_list_add_account(a);
        let before = js.state.clone();

        let id = js.snapshot();
        js.create_account(b);
        js.set_nonce(a, 42);
        js.set_balance(a, U256::from(5u64));
        js.set_code(b, vec![1, 2, 3]);
        js.set_state(a, B256::repeat_byte(1), B256::repeat_byte(0xbb));
        js.set_state(a, B256::repeat_byte(1), B256::repeat_byte(0xcc));
        js.set_state(a, B256::repeat_byte(2), B256::repeat_byte(0xdd));
        js.set_transient_state(a, B256::repeat_byte(3), B256::repeat_byte(0xee));
        js.set_refund(99);
        js.set_refund(100);
        js.add_log(tx, Log::default());
        js.add_log(tx, Log::default());
        js.access_list_add_slot(b, B256::repeat_byte(4));
        js.destruct(a);
        js.revert_to(id);

        // Slots first written inside the reverted scope restore their
        // previous (zero) value explicitly rather than disappearing.
        let mut expected = before;
        expected
            .transient
            .insert((a, B256::repeat_byte(3)), B256::ZERO);
        expected
            .objects
            .get_mut(&a)
            .unwrap()
            .storage
            .insert(B256::repeat_byte(2), B256::ZERO);
        assert_eq!(js.state, expected);
    }

    #[test]
    fn only_the_first_change_per_scope_is_recorded() {
        let mut js = JournaledState::new();
        let a = addr(0x31);
        js.snapshot();
        js.create_account(a);
        js.set_nonce(a, 1);

        let id = js.snapshot();
        js.set_nonce(a, 2);
        js.set_nonce(a, 3);
        js.set_balance(a, U256::from(9u64));
        assert_eq!(js.journal.dirty_count(&a), 2);
        js.revert_to(id);

        // The revert restored the scope entry's earliest pre-image.
        assert_eq!(js.state.objects[&a].nonce, 1);
        assert_eq!(js.journal.dirty_count(&a), 1);
    }

    #[test]
    fn ripemd_touch_counts_twice() {
        let mut js = JournaledState::new();
        js.snapshot();
        js.create_account(RIPEMD_ADDR);
        assert_eq!(js.journal.dirty_count(&RIPEMD_ADDR), 1);
        // The touch collapses into the creation record within the same
        // scope, but the ripe magic extra still counts.
        js.touch(RIPEMD_ADDR);
        assert_eq!(js.journal.dirty_count(&RIPEMD_ADDR), 2);
        // In a fresh scope the touch records again, twice.
        js.snapshot();
        js.touch(RIPEMD_ADDR);
        assert_eq!(js.journal.dirty_count(&RIPEMD_ADDR), 4);
    }

    #[test]
    fn log_revert_pops_per_transaction() {
        let mut js = JournaledState::new();
        let (t1, t2) = (B256::repeat_byte(1), B256::repeat_byte(2));
        js.snapshot();
        js.add_log(t1, Log::default());
        let id = js.snapshot();
        js.add_log(t1, Log::default());
        js.add_log(t2, Log::default());
        assert_eq!(js.state.log_size, 3);
        js.revert_to(id);
        assert_eq!(js.state.log_size, 1);
        assert_eq!(js.state.logs[&t1].len(), 1);
        assert!(!js.state.logs.contains_key(&t2));
    }

    #[test]
    fn discard_keeps_changes_but_collapses_scopes() {
        let mut js = JournaledState::new();
        let a = addr(0x41);
        let outer = js.snapshot();
        js.create_account(a);
        js.set_nonce(a, 1);

        let inner = js.snapshot();
        js.set_nonce(a, 2);
        js.discard(inner);

        // The change survives the discard and the address counts as touched
        // by one scope only.
        assert_eq!(js.state.objects[&a].nonce, 2);
        assert_eq!(js.journal.depth(), 1);
        assert_eq!(js.journal.dirty_count(&a), 1);

        // Reverting the outer scope now undoes everything at once.
        js.revert_to(outer);
        assert!(!js.state.objects.contains_key(&a));
        assert_eq!(js.journal.dirty_count(&a), 0);
    }

    #[test]
    fn refund_keeps_the_first_scope_value() {
        let mut js = JournaledState::new();
        js.snapshot();
        js.set_refund(7);
        let id = js.snapshot();
        js.set_refund(20);
        js.set_refund(30);
        js.revert_to(id);
        assert_eq!(js.state.refund, 7);
    }

    #[test]
    fn access_list_revert_removes_only_scope_additions() {
        let mut js = JournaledState::new();
        let (a, b) = (addr(0x51), addr(0x52));
        js.snapshot();
        js.access_list_add_slot(a, B256::repeat_byte(1));
        let id = js.snapshot();
        // Re-adding warm entries journals nothing.
        js.access_list_add_account(a);
        js.access_list_add_slot(a, B256::repeat_byte(1));
        js.access_list_add_slot(b, B256::repeat_byte(2));
        js.revert_to(id);

        assert!(js.state.access_addresses.contains(&a));
        assert!(js.state.access_slots.contains(&(a, B256::repeat_byte(1))));
        assert!(!js.state.access_addresses.contains(&b));
        assert!(!js.state.access_slots.contains(&(b, B256::repeat_byte(2))));
    }

    #[test]
    #[should_panic(expected = "cannot be reverted")]
    fn revert_to_unknown_revision_panics() {
        let mut js = JournaledState::new();
        js.snapshot();
        js.revert_to(3);
    }

    #[test]
    #[should_panic(expected = "no active scope")]
    fn recording_without_a_scope_panics() {
        let mut journal = Journal::new();
        journal.journal_log(B256::ZERO);
    }

    #[test]
    fn reset_clears_everything() {
        let mut js = JournaledState::new();
        let a = addr(0x61);
        js.snapshot();
        js.create_account(a);
        js.set_nonce(a, 3);
        js.journal.reset();
        assert_eq!(js.journal.depth(), 0);
        assert_eq!(js.journal.dirty_count(&a), 0);
        // State itself is untouched by a journal reset.
        assert_eq!(js.state.objects[&a].nonce, 3);
    }
}
