// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use meridian_crypto::{HalfSha512, Hash160, Hash256, HashPrefix, NodeKeypair, NodePublicKey,
                      SignatureBytes};
use serde::{Deserialize, Serialize};
use std::fmt;

const FLAG_FULL: u32 = 0x0000_0001;

/// A signed statement that a validator accepts a particular ledger.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    ledger_hash: Hash256,
    ledger_seq: u32,
    sign_time: u32,
    flags: u32,
    signer: NodePublicKey,
    signature: Option<SignatureBytes>,
    /// Set locally when a newer current validation supersedes this signer's
    /// previous one; not covered by the signature.
    #[serde(skip)]
    prev_ledger_hash: Option<Hash256>,
    /// Local trust flag, derived from the UNL on receipt.
    #[serde(skip)]
    trusted: bool,
}

impl Validation {
    /// `full` distinguishes a full validation (we proposed this round) from a
    /// partial one (we only observed).
    pub fn new(
        ledger_hash: Hash256,
        ledger_seq: u32,
        sign_time: u32,
        signer: NodePublicKey,
        full: bool,
    ) -> Self {
        Self {
            ledger_hash,
            ledger_seq,
            sign_time,
            flags: if full { FLAG_FULL } else { 0 },
            signer,
            signature: None,
            prev_ledger_hash: None,
            trusted: false,
        }
    }

    pub fn signing_hash(&self) -> Hash256 {
        let mut h = HalfSha512::new(HashPrefix::Validation);
        h.update(self.ledger_hash.as_bytes())
            .update(self.ledger_seq.to_be_bytes())
            .update(self.sign_time.to_be_bytes())
            .update(self.flags.to_be_bytes());
        h.finish()
    }

    pub fn sign(&mut self, keypair: &NodeKeypair) {
        debug_assert_eq!(keypair.public(), self.signer);
        self.signature = Some(keypair.sign(&self.signing_hash()));
    }

    pub fn verify_signature(&self) -> bool {
        match &self.signature {
            Some(sig) => self.signer.verify(&self.signing_hash(), sig).is_ok(),
            None => false,
        }
    }

    /// Current iff `sign_time` lies in `[now - early, now + interval)`: at
    /// most `early` seconds old, less than `interval` seconds future-dated.
    pub fn is_current(&self, now: u32, early_window: u32, validity_interval: u32) -> bool {
        self.sign_time.saturating_add(early_window) >= now
            && self.sign_time < now.saturating_add(validity_interval)
    }

    pub fn ledger_hash(&self) -> &Hash256 {
        &self.ledger_hash
    }

    pub fn ledger_seq(&self) -> u32 {
        self.ledger_seq
    }

    pub fn sign_time(&self) -> u32 {
        self.sign_time
    }

    pub fn is_full(&self) -> bool {
        self.flags & FLAG_FULL != 0
    }

    pub fn signer(&self) -> &NodePublicKey {
        &self.signer
    }

    pub fn node_id(&self) -> Hash160 {
        self.signer.node_id()
    }

    pub fn set_trusted(&mut self) {
        self.trusted = true;
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn set_prev_ledger_hash(&mut self, hash: Hash256) {
        self.prev_ledger_hash = Some(hash);
    }

    pub fn is_prev_ledger(&self, hash: &Hash256) -> bool {
        self.prev_ledger_hash.as_ref() == Some(hash)
    }
}

impl fmt::Debug for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Validation(ledger={}, seq={}, t={}, {})",
            self.ledger_hash,
            self.ledger_seq,
            self.sign_time,
            if self.is_full() { "full" } else { "partial" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn sign_verify_and_tamper() {
        let kp = NodeKeypair::generate(&mut StdRng::seed_from_u64(5));
        let mut v = Validation::new(Hash256::new([7; 32]), 12, 5000, kp.public(), true);
        v.sign(&kp);
        assert!(v.verify_signature());

        let mut forged = v.clone();
        forged.ledger_seq += 1;
        assert!(!forged.verify_signature());
    }

    #[test]
    fn currency_window() {
        let kp = NodeKeypair::generate(&mut StdRng::seed_from_u64(5));
        let v = Validation::new(Hash256::zero(), 1, 1000, kp.public(), true);
        // sign_time must lie in [now - early, now + interval).
        assert!(v.is_current(1000, 180, 300));
        assert!(v.is_current(1180, 180, 300));
        assert!(!v.is_current(1181, 180, 300));
        assert!(v.is_current(701, 180, 300));
        assert!(!v.is_current(700, 180, 300));
    }
}
