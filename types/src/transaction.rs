// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use meridian_crypto::{sha512_half, Hash160, Hash256, HashPrefix};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A signed transaction as this layer sees it: an opaque signed blob plus the
/// fields the ledger pipeline routes on. Parsing and per-account apply rules
/// belong to the transaction engine, which is behind a trait.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    account: Hash160,
    account_seq: u32,
    #[serde(with = "serde_bytes")]
    raw: Vec<u8>,
    id: Hash256,
}

impl Transaction {
    pub fn new(account: Hash160, account_seq: u32, raw: Vec<u8>) -> Self {
        let id = sha512_half(HashPrefix::TxnId, &[&raw]);
        Self {
            account,
            account_seq,
            raw,
            id,
        }
    }

    /// Rebuilds a transaction from raw bytes received off a tree leaf; the
    /// account routing fields are recovered by the engine later.
    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self::new(Hash160::zero(), 0, raw)
    }

    pub fn id(&self) -> &Hash256 {
        &self.id
    }

    pub fn account(&self) -> &Hash160 {
        &self.account
    }

    pub fn account_seq(&self) -> u32 {
        self.account_seq
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_shared(self) -> Arc<Transaction> {
        Arc::new(self)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction(id={}, acct={}, seq={})",
            self.id, self.account, self.account_seq
        )
    }
}

/// Persisted status of a transaction relative to the ledger history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    /// Just received, not yet in any ledger.
    New,
    /// In the open or closing ledger.
    Active,
    /// In a validated ledger.
    Committed,
    /// Conflicted with an applied transaction; dropped.
    Conflicted,
    /// Held for a future ledger sequence.
    Held,
}

impl TxStatus {
    /// Single-character code used by the persisted transaction index.
    pub fn code(self) -> char {
        match self {
            TxStatus::New => 'N',
            TxStatus::Active => 'A',
            TxStatus::Committed => 'C',
            TxStatus::Conflicted => 'D',
            TxStatus::Held => 'H',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        Some(match c {
            'N' => TxStatus::New,
            'A' => TxStatus::Active,
            'C' => TxStatus::Committed,
            'D' => TxStatus::Conflicted,
            'H' => TxStatus::Held,
            _ => return None,
        })
    }
}

/// Outcome of one transaction-engine application attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// Applied; the ledger advanced.
    Success,
    /// Not applicable yet (for example a sequence gap); retry in a later pass.
    Retry,
    /// Definitively rejected; drop from the candidate set.
    Fail,
    /// Local policy rejection; drop without relay.
    Local,
}
