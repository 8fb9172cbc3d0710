// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use meridian_crypto::Hash256;
use meridian_types::Transaction;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A retry set ordered canonically: accounts permuted by a per-round salt,
/// then account sequence, then transaction ID. Every node replaying the same
/// failed set walks it in the same order, so multi-pass application
/// converges to the same ledger everywhere.
pub struct CanonicalTxSet {
    salt: Hash256,
    txs: BTreeMap<CanonicalKey, Arc<Transaction>>,
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CanonicalKey {
    salted_account: [u8; 20],
    account_seq: u32,
    txid: Hash256,
}

impl CanonicalTxSet {
    /// `salt` is normally the consensus set's root hash.
    pub fn new(salt: Hash256) -> Self {
        Self {
            salt,
            txs: BTreeMap::new(),
        }
    }

    /// Clears the set and re-keys it under a new salt.
    pub fn reset(&mut self, salt: Hash256) {
        self.salt = salt;
        self.txs.clear();
    }

    fn key(&self, tx: &Transaction) -> CanonicalKey {
        let mut salted = [0u8; 20];
        for (i, byte) in salted.iter_mut().enumerate() {
            *byte = tx.account().as_bytes()[i] ^ self.salt.as_bytes()[i];
        }
        CanonicalKey {
            salted_account: salted,
            account_seq: tx.account_seq(),
            txid: *tx.id(),
        }
    }

    pub fn insert(&mut self, tx: Arc<Transaction>) {
        self.txs.insert(self.key(&tx), tx);
    }

    pub fn remove(&mut self, tx: &Transaction) -> bool {
        self.txs.remove(&self.key(tx)).is_some()
    }

    /// The current canonical order. Application passes iterate a copy so
    /// they can remove entries as they go.
    pub fn transactions(&self) -> Vec<Arc<Transaction>> {
        self.txs.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_crypto::Hash160;

    fn tx(account: u8, seq: u32, body: u8) -> Arc<Transaction> {
        Arc::new(Transaction::new(
            Hash160::new([account; 20]),
            seq,
            vec![body],
        ))
    }

    #[test]
    fn per_account_sequence_order_is_preserved() {
        let mut set = CanonicalTxSet::new(Hash256::new([0x3C; 32]));
        set.insert(tx(1, 3, 10));
        set.insert(tx(1, 1, 11));
        set.insert(tx(1, 2, 12));
        let order: Vec<u32> = set
            .transactions()
            .iter()
            .map(|t| t.account_seq())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn salt_permutes_account_order() {
        let a = tx(1, 1, 1);
        let b = tx(0x81, 1, 2);
        let mut differs = false;
        // Some salt must flip the relative order of two distinct accounts.
        for salt_byte in 0..=0xFFu8 {
            let mut set = CanonicalTxSet::new(Hash256::new([salt_byte; 32]));
            set.insert(a.clone());
            set.insert(b.clone());
            let first = *set.transactions()[0].id();
            if first == *b.id() {
                differs = true;
                break;
            }
        }
        assert!(differs);
    }

    #[test]
    fn remove_and_reset() {
        let mut set = CanonicalTxSet::new(Hash256::zero());
        let t = tx(5, 1, 9);
        set.insert(t.clone());
        assert_eq!(set.len(), 1);
        assert!(set.remove(&t));
        assert!(set.is_empty());

        set.insert(t.clone());
        set.reset(Hash256::new([1; 32]));
        assert!(set.is_empty());
    }
}
