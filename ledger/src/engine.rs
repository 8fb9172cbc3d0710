// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{account_index, Ledger};
use meridian_shamap::{Item, LeafKind};
use meridian_types::{ApplyResult, Transaction};
use tracing::debug;

/// The transaction engine: per-account rules live behind this seam. The
/// consensus pipeline only needs `apply` as a function from a transaction
/// and a ledger to an outcome; everything about account semantics is the
/// implementation's business.
pub trait TransactionEngine: Send + Sync {
    /// Attempts to apply `tx` to `ledger`. `open_ledger` selects open-ledger
    /// rules (provisional application); `retry_assured` tells the engine a
    /// later pass will retry, so ordering failures should report
    /// [`ApplyResult::Retry`] rather than fail outright.
    fn apply(
        &self,
        tx: &Transaction,
        ledger: &mut Ledger,
        open_ledger: bool,
        retry_assured: bool,
    ) -> ApplyResult;
}

/// An engine with no account rules: every well-formed transaction applies,
/// bumping a per-account transaction counter in the state tree. Standalone
/// mode and the in-process network tests run on this.
#[derive(Debug, Default)]
pub struct AdmitAllEngine;

impl TransactionEngine for AdmitAllEngine {
    fn apply(
        &self,
        tx: &Transaction,
        ledger: &mut Ledger,
        _open_ledger: bool,
        _retry_assured: bool,
    ) -> ApplyResult {
        match ledger.record_transaction(tx, None) {
            Ok(true) => {}
            Ok(false) => return ApplyResult::Fail, // duplicate
            Err(err) => {
                debug!(target: "ledger", %err, "engine could not touch the ledger");
                return ApplyResult::Local;
            }
        }
        let index = account_index(tx.account());
        let next = match ledger.state_map().get(&index) {
            Ok(Some(existing)) => {
                let mut count = [0u8; 8];
                let data = existing.data();
                if data.len() == 8 {
                    count.copy_from_slice(data);
                }
                u64::from_be_bytes(count) + 1
            }
            _ => 1,
        };
        let item = Item::new(index, next.to_be_bytes().to_vec());
        let result = if next == 1 {
            ledger.state_map_mut().add(item, LeafKind::AccountState)
        } else {
            ledger.state_map_mut().update(item, LeafKind::AccountState)
        };
        match result {
            Ok(_) => ApplyResult::Success,
            Err(err) => {
                debug!(target: "ledger", %err, "state update failed");
                ApplyResult::Local
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_crypto::Hash160;
    use meridian_store::HashedObjectStore;
    use std::sync::Arc;

    #[test]
    fn admit_all_advances_state_and_rejects_duplicates() {
        let mut genesis = Ledger::genesis(Arc::new(HashedObjectStore::in_memory()));
        let mut open = Ledger::open_from(&mut genesis);
        let engine = AdmitAllEngine;
        let tx = Transaction::new(Hash160::new([4; 20]), 1, vec![1, 2]);

        assert_eq!(engine.apply(&tx, &mut open, true, false), ApplyResult::Success);
        assert!(open.has_transaction(tx.id()).unwrap());
        assert_eq!(engine.apply(&tx, &mut open, true, false), ApplyResult::Fail);

        let tx2 = Transaction::new(Hash160::new([4; 20]), 2, vec![3, 4]);
        assert_eq!(engine.apply(&tx2, &mut open, true, false), ApplyResult::Success);
        let state = open
            .state_map()
            .get(&account_index(&Hash160::new([4; 20])))
            .unwrap()
            .unwrap();
        assert_eq!(state.data(), &2u64.to_be_bytes());
    }
}
