// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! Collects signed validations and answers the questions consensus asks of
//! them: how many trusted validators signed a ledger, who has moved past
//! it, and which previous-ledger hash the trusted set currently favours.

use crate::{context::PeerId, timing::ConsensusConfig, unl::UniqueNodeList};
use meridian_crypto::Hash256;
use meridian_infallible::Mutex;
use meridian_ledger::LedgerMaster;
use meridian_types::{NetworkClock, Validation};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Durable sink for validations that fell out of the `current` index. The
/// production implementation writes the `Validations` table; tests record.
pub trait ValidationStore: Send + Sync {
    fn write_batch(&self, validations: &[Validation]);
}

struct Inner {
    /// Every validation ever seen, for counting and forensics.
    by_ledger: HashMap<Hash256, HashMap<PeerId, Validation>>,
    /// At most one current validation per peer.
    current: HashMap<PeerId, Validation>,
    /// Superseded validations awaiting asynchronous persistence.
    stale: Vec<Validation>,
}

pub struct ValidationCollection {
    clock: Arc<dyn NetworkClock>,
    unl: Arc<UniqueNodeList>,
    master: Arc<LedgerMaster>,
    store: Option<Arc<dyn ValidationStore>>,
    early_secs: u32,
    interval_secs: u32,
    inner: Mutex<Inner>,
}

impl ValidationCollection {
    pub fn new(
        clock: Arc<dyn NetworkClock>,
        unl: Arc<UniqueNodeList>,
        master: Arc<LedgerMaster>,
        store: Option<Arc<dyn ValidationStore>>,
        config: &ConsensusConfig,
    ) -> Self {
        Self {
            clock,
            unl,
            master,
            store,
            early_secs: config.validation_early_secs,
            interval_secs: config.validation_interval_secs,
            inner: Mutex::new(Inner {
                by_ledger: HashMap::new(),
                current: HashMap::new(),
                stale: Vec::new(),
            }),
        }
    }

    /// Ingests one validation. Returns whether it became the signer's
    /// current validation. Signature verification is the caller's job
    /// (bad signatures are dropped before they get here).
    pub fn add_validation(&self, mut validation: Validation, source: &str) -> bool {
        let signer = validation.node_id();
        let hash = *validation.ledger_hash();
        if self.unl.in_unl(validation.signer()) {
            validation.set_trusted();
        } else {
            debug!(
                target: "consensus",
                %signer, %hash, source,
                "validation from a node outside the trusted list"
            );
        }

        let now = self.clock.network_time();
        let mut is_current = validation.is_current(now, self.early_secs, self.interval_secs);
        if !is_current {
            warn!(
                target: "consensus",
                %signer, sign_time = validation.sign_time(), now,
                "stale validation received"
            );
        }

        let trusted = validation.is_trusted();
        {
            let inner = &mut *self.inner.lock();
            let set = inner.by_ledger.entry(hash).or_insert_with(HashMap::new);
            if set.contains_key(&signer) {
                return false;
            }
            set.insert(signer, validation.clone());

            if is_current {
                // Out-of-order arrivals never demote a newer record.
                let supersedes = match inner.current.get(&signer) {
                    None => Some(None),
                    Some(existing) if validation.sign_time() > existing.sign_time() => {
                        Some(Some(*existing.ledger_hash()))
                    }
                    Some(_) => None,
                };
                match supersedes {
                    Some(None) => {
                        inner.current.insert(signer, validation);
                    }
                    Some(Some(prev_hash)) => {
                        let mut newer = validation;
                        newer.set_prev_ledger_hash(prev_hash);
                        if let Some(old) = inner.current.insert(signer, newer) {
                            inner.stale.push(old);
                        }
                    }
                    None => {
                        is_current = false;
                    }
                }
            }
        }

        if trusted {
            let count = self.trusted_count(&hash);
            self.master.check_accept(&hash, count);
        }
        is_current
    }

    /// Trusted validations seen for `ledger_hash`, current or not.
    pub fn trusted_count(&self, ledger_hash: &Hash256) -> usize {
        self.inner
            .lock()
            .by_ledger
            .get(ledger_hash)
            .map_or(0, |set| set.values().filter(|v| v.is_trusted()).count())
    }

    /// Trusted nodes whose current validation supersedes `ledger_hash`,
    /// i.e. that have visibly moved past that ledger.
    pub fn nodes_after(&self, ledger_hash: &Hash256) -> usize {
        let inner = self.inner.lock();
        inner
            .current
            .values()
            .filter(|v| v.is_trusted() && v.is_prev_ledger(ledger_hash))
            .count()
    }

    /// The last-closed-ledger selector: per ledger hash, how many trusted
    /// current validations it holds and the highest node id among them (the
    /// deterministic tie-break). Validations for `prior` — the ledger we
    /// came from — are credited to `preferred` so the node never counts
    /// itself backwards.
    pub fn current_validations(
        &self,
        preferred: &Hash256,
        prior: Option<&Hash256>,
    ) -> HashMap<Hash256, (usize, PeerId)> {
        let now = self.clock.network_time();
        let cutoff_secs = self.early_secs;
        let mut out: HashMap<Hash256, (usize, PeerId)> = HashMap::new();

        let inner = &mut *self.inner.lock();
        let mut expired = Vec::new();
        inner.current.retain(|signer, validation| {
            if !validation.is_current(now, cutoff_secs, self.interval_secs) {
                expired.push(validation.clone());
                debug!(target: "consensus", %signer, "current validation expired");
                return false;
            }
            if !validation.is_trusted() {
                return true;
            }
            // Two guards against chasing our own chain: a validation that
            // moved just past `preferred` still supports it (don't jump
            // forward), and one for the ledger we came from counts for
            // where we are (don't jump back).
            let counted_hash = if validation.is_prev_ledger(preferred)
                || Some(validation.ledger_hash()) == prior
            {
                *preferred
            } else {
                *validation.ledger_hash()
            };
            let entry = out.entry(counted_hash).or_insert((0, PeerId::zero()));
            entry.0 += 1;
            let signer_id = validation.node_id();
            if signer_id > entry.1 {
                entry.1 = signer_id;
            }
            true
        });
        inner.stale.extend(expired);
        out
    }

    /// Live trusted validations, one per signer.
    pub fn current_trusted(&self) -> Vec<Validation> {
        let now = self.clock.network_time();
        self.inner
            .lock()
            .current
            .values()
            .filter(|v| v.is_trusted() && v.is_current(now, self.early_secs, self.interval_secs))
            .cloned()
            .collect()
    }

    /// Hands the stale backlog to the durable store. Runs on the disk job
    /// class; never on the consensus path.
    pub fn write_stale(&self) {
        let batch = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.stale)
        };
        if batch.is_empty() {
            return;
        }
        if let Some(store) = &self.store {
            store.write_batch(&batch);
        }
    }

    /// Moves everything current to stale and persists (shutdown path).
    pub fn flush(&self) {
        {
            let inner = &mut *self.inner.lock();
            let drained: Vec<Validation> = inner.current.drain().map(|(_, v)| v).collect();
            inner.stale.extend(drained);
        }
        self.write_stale();
    }

    pub fn stale_backlog(&self) -> usize {
        self.inner.lock().stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_crypto::NodeKeypair;
    use meridian_store::HashedObjectStore;
    use meridian_types::TestClock;
    use rand::{rngs::StdRng, SeedableRng};

    struct RecordingStore(Mutex<Vec<Validation>>);

    impl ValidationStore for RecordingStore {
        fn write_batch(&self, validations: &[Validation]) {
            self.0.lock().extend_from_slice(validations);
        }
    }

    struct Fixture {
        clock: Arc<TestClock>,
        unl: Arc<UniqueNodeList>,
        collection: ValidationCollection,
        written: Arc<RecordingStore>,
        keys: Vec<NodeKeypair>,
    }

    fn fixture(trusted: usize) -> Fixture {
        let clock = Arc::new(TestClock::new(10_000));
        let unl = Arc::new(UniqueNodeList::new(32));
        let master = Arc::new(LedgerMaster::new(
            Arc::new(HashedObjectStore::in_memory()),
            3,
        ));
        let written = Arc::new(RecordingStore(Mutex::new(Vec::new())));
        let mut rng = StdRng::seed_from_u64(99);
        let keys: Vec<NodeKeypair> = (0..trusted + 1)
            .map(|_| NodeKeypair::generate(&mut rng))
            .collect();
        for key in keys.iter().take(trusted) {
            unl.add_validator(key.public(), crate::unl::ValidatorSource::Config);
        }
        unl.rescore();
        let collection = ValidationCollection::new(
            clock.clone(),
            unl.clone(),
            master,
            Some(written.clone()),
            &ConsensusConfig::default(),
        );
        Fixture {
            clock,
            unl,
            collection,
            written,
            keys,
        }
    }

    fn validation(key: &NodeKeypair, hash: u8, seq: u32, sign_time: u32) -> Validation {
        let mut v = Validation::new(Hash256::new([hash; 32]), seq, sign_time, key.public(), true);
        v.sign(key);
        v
    }

    #[test]
    fn trusted_counting_and_duplicates() {
        let f = fixture(3);
        let hash = Hash256::new([1; 32]);
        for key in f.keys.iter().take(3) {
            assert!(f.collection.add_validation(validation(key, 1, 5, 10_000), "test"));
        }
        // The untrusted signer counts in by_ledger but not as trusted.
        f.collection
            .add_validation(validation(&f.keys[3], 1, 5, 10_000), "test");
        assert_eq!(f.collection.trusted_count(&hash), 3);

        // Duplicate (same signer, same ledger) is rejected.
        assert!(!f
            .collection
            .add_validation(validation(&f.keys[0], 1, 5, 10_001), "test"));
    }

    #[test]
    fn newer_validation_supersedes_and_stales_the_old() {
        let f = fixture(2);
        let key = &f.keys[0];
        assert!(f.collection.add_validation(validation(key, 1, 5, 10_000), "a"));
        assert!(f.collection.add_validation(validation(key, 2, 6, 10_010), "b"));
        assert_eq!(f.collection.stale_backlog(), 1);

        // The superseding validation records what it replaced.
        assert_eq!(f.collection.nodes_after(&Hash256::new([1; 32])), 1);

        f.collection.write_stale();
        assert_eq!(f.collection.stale_backlog(), 0);
        assert_eq!(f.written.0.lock().len(), 1);
    }

    #[test]
    fn out_of_order_arrival_does_not_demote_current() {
        let f = fixture(2);
        let key = &f.keys[0];
        assert!(f.collection.add_validation(validation(key, 2, 6, 10_010), "b"));
        // An earlier-signed validation arrives late: retained in by_ledger,
        // but never promoted to current.
        assert!(!f.collection.add_validation(validation(key, 1, 5, 10_000), "a"));
        assert_eq!(f.collection.trusted_count(&Hash256::new([1; 32])), 1);
        let current = f.collection.current_trusted();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].ledger_seq(), 6);
    }

    #[test]
    fn lcl_selector_counts_and_tiebreaks() {
        let f = fixture(3);
        let ledger_a = Hash256::new([0xA; 32]);
        let ledger_b = Hash256::new([0xB; 32]);
        f.collection.add_validation(validation(&f.keys[0], 0xA, 7, 10_000), "t");
        f.collection.add_validation(validation(&f.keys[1], 0xB, 7, 10_000), "t");
        f.collection.add_validation(validation(&f.keys[2], 0xB, 7, 10_000), "t");

        let counts = f.collection.current_validations(&ledger_a, None);
        assert_eq!(counts.get(&ledger_a).unwrap().0, 1);
        assert_eq!(counts.get(&ledger_b).unwrap().0, 2);
        let expected_max = f.keys[1].node_id().max(f.keys[2].node_id());
        assert_eq!(counts.get(&ledger_b).unwrap().1, expected_max);
    }

    #[test]
    fn expired_validations_fall_out_of_current() {
        let f = fixture(1);
        f.collection.add_validation(validation(&f.keys[0], 1, 5, 10_000), "t");
        // Advance past the early window; the record expires from current.
        f.clock.advance(200);
        let counts = f.collection.current_validations(&Hash256::zero(), None);
        assert!(counts.is_empty());
        assert_eq!(f.collection.stale_backlog(), 1);
        // UNL membership is unaffected.
        assert!(f.unl.in_unl(&f.keys[0].public()));
    }
}
