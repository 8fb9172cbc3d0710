// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use meridian_crypto::Hash256;
use std::fmt;

/// An entry stored in a map: an immutable `(tag, data)` pair. For
/// transactions the tag is the transaction ID, for account state the account
/// index. Updates replace the item wholesale.
#[derive(Clone, PartialEq, Eq)]
pub struct Item {
    tag: Hash256,
    data: Vec<u8>,
}

impl Item {
    pub fn new(tag: Hash256, data: Vec<u8>) -> Self {
        Self { tag, data }
    }

    pub fn tag(&self) -> &Hash256 {
        &self.tag
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Item({}, {} bytes)", self.tag, self.data.len())
    }
}
