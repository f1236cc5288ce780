//! Flat state snapshots over a Merkle-trie state store.
//!
//! A trie gives authenticated state but makes every point lookup pay a node
//! traversal. This crate maintains a flat key/value projection of the trie
//! next to it, structured in three tightly coupled pieces:
//!
//! 1. **Snapshot generation** ([`snapshot::generate`]): a resumable
//!    background worker rebuilds the flat projection from the trie, using
//!    bounded range proofs to confirm pre-existing flat data cheaply and
//!    falling back to trie iteration only for segments that fail.
//! 2. **Layered diffs** ([`snapshot`]): a stack of bloom-summarised
//!    in-memory diff layers over the persistent disk layer, with fast point
//!    lookups, flattening and stale invalidation.
//! 3. **Scoped journalling** ([`journal`]): nested snapshot/revert of
//!    account, storage, log, access-list and refund changes for transaction
//!    execution.
//!
//! The ordered key/value store and the trie node store are consumed through
//! the traits in [`traits`]; [`mem_store::MemStore`] is the bundled
//! in-memory reference backend.
pub mod account;
pub mod constant;
pub mod journal;
pub mod mem_store;
pub mod snapshot;
pub mod traits;
pub mod trie;

pub use account::{full_account_rlp, slim_account_rlp, Account};
pub use journal::{Journal, JournaledState, JournalState};
pub use mem_store::MemStore;
pub use snapshot::{
    generate_snapshot, resume_snapshot, DiffLayer, DiskLayer, GeneratorStats, Snapshot,
    SnapshotError, SnapshotLayer, SnapshotTree,
};
pub use traits::{KeyValueStore, NodeReader, NodeWriter, WriteBatch};
