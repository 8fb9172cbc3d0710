// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Hashing and signing primitives shared by every Meridian component.
//!
//! Everything that is hashed on this network goes through [`sha512_half`]
//! with a 4-byte domain prefix, so a transaction hash can never be confused
//! with a tree-node hash or a signing digest. The prefixes are wire-normative:
//! two nodes that disagree on any of them will never agree on anything else.

mod error;
pub mod hash;
pub mod signing;

pub use error::CryptoError;
pub use hash::{content_hash, sha512_half, HalfSha512, Hash128, Hash160, Hash256, HashPrefix};
pub use signing::{NodeKeypair, NodePublicKey, SignatureBytes};
