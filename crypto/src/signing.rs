// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! Ed25519 wrappers for validator identity.
//!
//! Signatures here always cover a domain-prefixed [`Hash256`] signing digest,
//! never raw message bytes; the digest construction lives with the signed
//! structure (proposal, validation, transaction) in `meridian-types`.

use crate::{
    hash::{sha512_half, HashPrefix},
    CryptoError, Hash160, Hash256,
};
use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt};

/// A validator's public identity, stored as raw key bytes so it can key maps
/// and cross serialization boundaries without a curve-point parse.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodePublicKey([u8; 32]);

impl NodePublicKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::WrongLength {
                kind: "NodePublicKey",
                expected: 32,
                got: bytes.len(),
            });
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The short identifier peers are indexed by: the high 160 bits of the
    /// domain-prefixed hash of the public key.
    pub fn node_id(&self) -> Hash160 {
        sha512_half(HashPrefix::TxnSign, &[&self.0]).to_hash160()
    }

    /// Verifies `signature` over the given signing digest.
    pub fn verify(
        &self,
        signing_hash: &Hash256,
        signature: &SignatureBytes,
    ) -> Result<(), CryptoError> {
        let key = PublicKey::from_bytes(&self.0).map_err(|_| CryptoError::MalformedKey)?;
        let sig =
            Signature::try_from(&signature.0[..]).map_err(|_| CryptoError::MalformedSignature)?;
        key.verify(signing_hash.as_bytes(), &sig)
            .map_err(|_| CryptoError::BadSignature)
    }
}

impl fmt::Display for NodePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePublicKey({})", hex::encode(self.0))
    }
}

/// A detached Ed25519 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBytes(#[serde(with = "serde_bytes_64")] [u8; 64]);

impl SignatureBytes {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 64 {
            return Err(CryptoError::WrongLength {
                kind: "SignatureBytes",
                expected: 64,
                got: bytes.len(),
            });
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({})", hex::encode(&self.0[..8]))
    }
}

// serde's array support stops at 32 elements; route the 64-byte signature
// through a byte buffer.
mod serde_bytes_64 {
    use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error> {
        serde_bytes::Bytes::new(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 64], D::Error> {
        let raw = serde_bytes::ByteBuf::deserialize(deserializer)?;
        if raw.len() != 64 {
            return Err(D::Error::custom("signature must be 64 bytes"));
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(&raw);
        Ok(out)
    }
}

/// A validator keypair. Private material never leaves this type.
pub struct NodeKeypair {
    keypair: Keypair,
}

impl NodeKeypair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            keypair: Keypair::generate(rng),
        }
    }

    pub fn public(&self) -> NodePublicKey {
        NodePublicKey(self.keypair.public.to_bytes())
    }

    pub fn node_id(&self) -> Hash160 {
        self.public().node_id()
    }

    pub fn sign(&self, signing_hash: &Hash256) -> SignatureBytes {
        let sig = self.keypair.sign(signing_hash.as_bytes());
        SignatureBytes(sig.to_bytes())
    }
}

impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKeypair({})", self.public())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn keypair(seed: u64) -> NodeKeypair {
        let mut rng = StdRng::seed_from_u64(seed);
        NodeKeypair::generate(&mut rng)
    }

    #[test]
    fn sign_verify_round_trip() {
        let kp = keypair(7);
        let digest = sha512_half(HashPrefix::Proposal, &[b"position"]);
        let sig = kp.sign(&digest);
        kp.public().verify(&digest, &sig).unwrap();
    }

    #[test]
    fn wrong_digest_rejected() {
        let kp = keypair(7);
        let digest = sha512_half(HashPrefix::Proposal, &[b"position"]);
        let other = sha512_half(HashPrefix::Proposal, &[b"different"]);
        let sig = kp.sign(&digest);
        assert!(kp.public().verify(&other, &sig).is_err());
    }

    #[test]
    fn wrong_key_rejected() {
        let kp = keypair(7);
        let imposter = keypair(8);
        let digest = sha512_half(HashPrefix::Validation, &[b"ledger"]);
        let sig = kp.sign(&digest);
        assert!(imposter.public().verify(&digest, &sig).is_err());
    }

    #[test]
    fn node_ids_are_stable_and_distinct() {
        let a = keypair(1);
        let b = keypair(2);
        assert_eq!(a.node_id(), a.public().node_id());
        assert_ne!(a.node_id(), b.node_id());
    }
}
