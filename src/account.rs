//! Account records and the slim/full RLP encodings persisted by the flat
//! snapshot.
//!
//! The flat store keeps accounts in a *slim* format which elides the storage
//! root when it equals the empty trie root and the code hash when it equals
//! the empty code hash. The trie keeps the *full* format. Conversion between
//! the two happens on the generator's hot path.
use crate::trie::EMPTY_ROOT;
use alloy_primitives::{Bytes, B256, U256, KECCAK256_EMPTY};
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};

/// An account as stored in the authoritative state trie.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Account {
    /// Account nonce.
    pub nonce: u64,
    /// Account balance.
    pub balance: U256,
    /// Root of the account's storage trie.
    pub root: B256,
    /// Hash of the account's bytecode.
    pub code_hash: B256,
}

/// The slim wire format: empty byte strings stand in for the canonical empty
/// storage root and code hash.
#[derive(RlpEncodable, RlpDecodable)]
struct SlimAccount {
    nonce: u64,
    balance: U256,
    root: Bytes,
    code_hash: Bytes,
}

impl Account {
    /// Creates an account with no storage and no code.
    pub fn empty() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            root: *EMPTY_ROOT,
            code_hash: KECCAK256_EMPTY,
        }
    }

    /// Decodes an account from its full RLP encoding.
    pub fn from_rlp(mut data: &[u8]) -> Result<Self, alloy_rlp::Error> {
        Self::decode(&mut data)
    }

    /// Encodes the account in the full format used by the state trie.
    pub fn full_rlp(&self) -> Vec<u8> {
        alloy_rlp::encode(self)
    }

    /// Encodes the account in the slim format used by the flat store.
    pub fn slim_rlp(&self) -> Vec<u8> {
        let slim = SlimAccount {
            nonce: self.nonce,
            balance: self.balance,
            root: if self.root == *EMPTY_ROOT {
                Bytes::new()
            } else {
                Bytes::copy_from_slice(self.root.as_slice())
            },
            code_hash: if self.code_hash == KECCAK256_EMPTY {
                Bytes::new()
            } else {
                Bytes::copy_from_slice(self.code_hash.as_slice())
            },
        };
        alloy_rlp::encode(&slim)
    }

    /// Decodes an account from the slim format, restoring the canonical empty
    /// root and code hash.
    pub fn from_slim_rlp(mut data: &[u8]) -> Result<Self, alloy_rlp::Error> {
        let slim = SlimAccount::decode(&mut data)?;
        let root = match slim.root.len() {
            0 => *EMPTY_ROOT,
            32 => B256::from_slice(&slim.root),
            _ => return Err(alloy_rlp::Error::UnexpectedLength),
        };
        let code_hash = match slim.code_hash.len() {
            0 => KECCAK256_EMPTY,
            32 => B256::from_slice(&slim.code_hash),
            _ => return Err(alloy_rlp::Error::UnexpectedLength),
        };
        Ok(Self {
            nonce: slim.nonce,
            balance: slim.balance,
            root,
            code_hash,
        })
    }
}

/// Converts a slim flat-store value into the full trie encoding.
///
/// Decode errors are propagated, not swallowed: the generator keeps the raw
/// bytes on failure so that the subsequent range proof rejects the segment
/// and the trie fallback heals the corrupt entry.
pub fn full_account_rlp(slim: &[u8]) -> Result<Vec<u8>, alloy_rlp::Error> {
    Ok(Account::from_slim_rlp(slim)?.full_rlp())
}

/// Converts a full trie encoding into the slim flat-store value.
pub fn slim_account_rlp(full: &[u8]) -> Result<Vec<u8>, alloy_rlp::Error> {
    Ok(Account::from_rlp(full)?.slim_rlp())
}
