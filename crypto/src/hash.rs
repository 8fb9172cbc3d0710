// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-width hashes and the domain-prefixed SHA-512-half construction.

use crate::CryptoError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;

/// Domain separation prefix mixed into every hash computed on the network.
///
/// The byte values spell a three-letter mnemonic plus NUL and must never
/// change once deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HashPrefix {
    /// "TXN" — transaction (with signature) to give the transaction ID.
    TxnId = 0x5458_4E00,
    /// "SND" — transaction plus metadata, as stored in a transaction tree.
    TxnNode = 0x534E_4400,
    /// "MLN" — account-state leaf node.
    LeafNode = 0x4D4C_4E00,
    /// "MIN" — tree inner node.
    InnerNode = 0x4D49_4E00,
    /// "LWR" — ledger header, for the ledger hash.
    Ledger = 0x4C57_5200,
    /// "STX" — inner transaction, for signing.
    TxnSign = 0x5354_5800,
    /// "VAL" — validation, for signing.
    Validation = 0x5641_4C00,
    /// "PRP" — proposal, for signing.
    Proposal = 0x5052_5000,
}

impl HashPrefix {
    pub fn to_be_bytes(self) -> [u8; 4] {
        (self as u32).to_be_bytes()
    }
}

macro_rules! define_hash {
    ($name:ident, $size:expr, $kind:expr) => {
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name([u8; $size]);

        impl $name {
            pub const LENGTH: usize = $size;

            pub const fn new(bytes: [u8; $size]) -> Self {
                Self(bytes)
            }

            pub const fn zero() -> Self {
                Self([0; $size])
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn as_bytes(&self) -> &[u8; $size] {
                &self.0
            }

            pub fn to_vec(&self) -> Vec<u8> {
                self.0.to_vec()
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
                if bytes.len() != $size {
                    return Err(CryptoError::WrongLength {
                        kind: $kind,
                        expected: $size,
                        got: bytes.len(),
                    });
                }
                let mut out = [0u8; $size];
                out.copy_from_slice(bytes);
                Ok(Self(out))
            }

            pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
                let raw = hex::decode(s).map_err(|_| CryptoError::MalformedHex)?;
                Self::from_slice(&raw)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Full hex in debug output; truncation has cost us too many
                // hours chasing "identical" hashes.
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }
    };
}

define_hash!(Hash256, 32, "Hash256");
define_hash!(Hash160, 20, "Hash160");
define_hash!(Hash128, 16, "Hash128");

impl Hash256 {
    /// The `i`-th nibble of the hash, high nibble first. `i < 64`.
    pub fn nibble(&self, i: usize) -> u8 {
        let byte = self.0[i / 2];
        if i % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0F
        }
    }

    /// Sets the `i`-th nibble, high nibble first.
    pub fn set_nibble(&mut self, i: usize, value: u8) {
        debug_assert!(value <= 0x0F);
        let byte = &mut self.0[i / 2];
        if i % 2 == 0 {
            *byte = (*byte & 0x0F) | (value << 4);
        } else {
            *byte = (*byte & 0xF0) | value;
        }
    }

    /// Truncates to the high 160 bits.
    pub fn to_hash160(&self) -> Hash160 {
        let mut out = [0u8; 20];
        out.copy_from_slice(&self.0[..20]);
        Hash160::new(out)
    }
}

/// Incremental domain-prefixed hasher keeping the high 256 bits of SHA-512.
pub struct HalfSha512 {
    inner: Sha512,
}

impl HalfSha512 {
    pub fn new(prefix: HashPrefix) -> Self {
        let mut inner = Sha512::new();
        inner.update(prefix.to_be_bytes());
        Self { inner }
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        self.inner.update(data.as_ref());
        self
    }

    pub fn finish(self) -> Hash256 {
        let digest = self.inner.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest[..32]);
        Hash256::new(out)
    }
}

/// The high 256 bits of `SHA-512(prefix ‖ parts...)`.
pub fn sha512_half(prefix: HashPrefix, parts: &[&[u8]]) -> Hash256 {
    let mut hasher = HalfSha512::new(prefix);
    for part in parts {
        hasher.update(part);
    }
    hasher.finish()
}

/// The high 256 bits of `SHA-512(data)`, no prefix added. For content that
/// already carries its domain prefix, such as PREFIXED tree nodes going into
/// the object store.
pub fn content_hash(data: &[u8]) -> Hash256 {
    let digest = Sha512::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..32]);
    Hash256::new(out)
}
