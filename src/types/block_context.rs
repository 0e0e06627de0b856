/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that identify individual references to a block.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::{BlockId, BlockRefNonce, UserId};

/// Identifies one specific reference to a block: the user that created the block, the user that owns
/// this reference, and the nonce that tells this reference apart from every other reference to the same
/// block.
///
/// ## Writer
///
/// A reference whose writer is its creator is stored with no explicit writer, so that
/// `BlockContext::new(alice, None, nonce)` and `BlockContext::new(alice, Some(alice), nonce)` compare
/// equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct BlockContext {
    creator: UserId,
    writer: Option<UserId>,
    ref_nonce: BlockRefNonce,
}

impl BlockContext {
    /// Create a new `BlockContext`. A `writer` of `None` means the creator owns the reference.
    pub fn new(creator: UserId, writer: Option<UserId>, ref_nonce: BlockRefNonce) -> Self {
        let writer = writer.filter(|writer| *writer != creator);
        Self {
            creator,
            writer,
            ref_nonce,
        }
    }

    /// Create the context of a block's initial reference, the one implicitly created by `put`.
    pub fn first_reference(creator: UserId) -> Self {
        Self::new(creator, None, BlockRefNonce::ZERO)
    }

    /// Get the user that created the block.
    pub const fn creator(&self) -> UserId {
        self.creator
    }

    /// Get the user that owns this reference.
    pub fn writer(&self) -> UserId {
        self.writer.unwrap_or(self.creator)
    }

    /// Get the nonce of this reference.
    pub const fn ref_nonce(&self) -> BlockRefNonce {
        self.ref_nonce
    }
}

/// Lists of block contexts, grouped by the block they refer to. Used as the argument of the bulk
/// reference operations, `remove_block_references` and `archive_block_references`.
pub type ContextMap = BTreeMap<BlockId, Vec<BlockContext>>;

/// Number of references remaining to each block after a `remove_block_references` call.
pub type LiveCounts = BTreeMap<BlockId, usize>;
