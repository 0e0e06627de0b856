/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Reference counting for blocks.
//!
//! Every block is pointed at by one or more references, each identified by a [`BlockContext`]. The
//! references to a single block are tracked by [`BlockRefs`], and the references to every block of a TLF
//! by [`ReferenceTracker`]. Both types are pure data structures: persisting them is the job of their
//! users (the [block journal](super::block_journal) writes `BlockRefs` into its key-value store, the
//! [memory block server](crate::block_server::memory) keeps a `ReferenceTracker` per TLF).
//!
//! ## Counting rules
//!
//! |Operation|Effect|
//! |---|---|
//! |add|Registers a live reference. Adding an existing reference is a no-op.|
//! |remove|Deletes the reference. Removing an absent reference is a no-op.|
//! |archive|Flags an existing reference as archived. Archiving an absent reference is an error.|
//!
//! Archived references still count towards a block's reference count, but can no longer be used to
//! read the block. A block with no references left may be reclaimed by the remote store.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::block_server::BlockServerError;
use crate::types::{
    block_context::{BlockContext, ContextMap, LiveCounts},
    data_types::{BlockId, BlockRefNonce},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum RefStatus {
    Live,
    Archived,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct RefEntry {
    pub context: BlockContext,
    pub status: RefStatus,
}

/// The references to a single block, keyed by their nonce.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BlockRefs(BTreeMap<BlockRefNonce, RefEntry>);

impl BlockRefs {
    /// Create an empty `BlockRefs`.
    pub fn new() -> Self {
        BlockRefs(BTreeMap::new())
    }

    /// Number of references (live or archived) to the block.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate through every reference in nonce order.
    pub fn iter(&self) -> impl Iterator<Item = &RefEntry> {
        self.0.values()
    }

    /// Whether exactly `context` is a reference (live or archived) to the block.
    pub fn contains(&self, context: &BlockContext) -> bool {
        self.0
            .get(&context.ref_nonce())
            .is_some_and(|entry| entry.context == *context)
    }

    /// Whether exactly `context` is a non-archived reference to the block.
    pub fn has_non_archived_reference(&self, context: &BlockContext) -> bool {
        self.0
            .get(&context.ref_nonce())
            .is_some_and(|entry| entry.context == *context && entry.status == RefStatus::Live)
    }

    /// Whether any reference to the block is not archived.
    pub fn has_any_non_archived_reference(&self) -> bool {
        self.0.values().any(|entry| entry.status == RefStatus::Live)
    }

    /// Register `context` as a live reference. Does nothing if `context` is already a reference, and
    /// fails if its nonce is taken by a different context.
    pub fn add_reference(
        &mut self,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<(), BlockServerError> {
        match self.0.get(&context.ref_nonce()) {
            Some(existing) if existing.context == *context => Ok(()),
            Some(existing) => Err(BlockServerError::ContextMismatch {
                block: *block,
                existing: existing.context,
                given: *context,
            }),
            None => {
                self.0.insert(
                    context.ref_nonce(),
                    RefEntry {
                        context: *context,
                        status: RefStatus::Live,
                    },
                );
                Ok(())
            }
        }
    }

    /// Delete every reference in `contexts` that exists, and return the number of references left.
    pub fn remove_references(&mut self, contexts: &[BlockContext]) -> usize {
        for context in contexts {
            if self.contains(context) {
                self.0.remove(&context.ref_nonce());
            }
        }
        self.len()
    }

    /// Fail if any reference in `contexts` does not exist. Changes nothing.
    pub fn check_archivable(
        &self,
        block: &BlockId,
        contexts: &[BlockContext],
    ) -> Result<(), BlockServerError> {
        match contexts.iter().find(|context| !self.contains(context)) {
            Some(context) => Err(BlockServerError::ReferenceMissingForArchive {
                block: *block,
                context: *context,
            }),
            None => Ok(()),
        }
    }

    /// Flag every reference in `contexts` as archived. Either archives all of them or, if any does not
    /// exist, none of them.
    pub fn archive_references(
        &mut self,
        block: &BlockId,
        contexts: &[BlockContext],
    ) -> Result<(), BlockServerError> {
        self.check_archivable(block, contexts)?;
        for context in contexts {
            if let Some(entry) = self.0.get_mut(&context.ref_nonce()) {
                entry.status = RefStatus::Archived;
            }
        }
        Ok(())
    }
}

/// The references to every block of a TLF.
#[derive(Clone, Debug, Default)]
pub struct ReferenceTracker(BTreeMap<BlockId, BlockRefs>);

impl ReferenceTracker {
    pub fn new() -> Self {
        ReferenceTracker(BTreeMap::new())
    }

    /// Get the references to `block`, if it has any.
    pub fn refs(&self, block: &BlockId) -> Option<&BlockRefs> {
        self.0.get(block)
    }

    /// Whether `block` has at least one reference.
    pub fn knows(&self, block: &BlockId) -> bool {
        self.0.contains_key(block)
    }

    /// Register a live reference to `block`, creating the block's entry if needed.
    pub fn add_reference(
        &mut self,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<(), BlockServerError> {
        self.0
            .entry(*block)
            .or_default()
            .add_reference(block, context)
    }

    /// Remove the listed references, ignoring absent ones, and return the number of references left to
    /// every listed block. Blocks left with no references are forgotten.
    pub fn remove_references(&mut self, contexts: &ContextMap) -> LiveCounts {
        let mut live_counts = LiveCounts::new();
        for (block, block_contexts) in contexts {
            let count = match self.0.get_mut(block) {
                Some(refs) => refs.remove_references(block_contexts),
                None => 0,
            };
            if count == 0 {
                self.0.remove(block);
            }
            live_counts.insert(*block, count);
        }
        live_counts
    }

    /// Archive the listed references. Fails, changing nothing, if any of them does not exist.
    pub fn archive_references(&mut self, contexts: &ContextMap) -> Result<(), BlockServerError> {
        for (block, block_contexts) in contexts {
            match self.0.get(block) {
                Some(refs) => refs.check_archivable(block, block_contexts)?,
                None => BlockRefs::new().check_archivable(block, block_contexts)?,
            }
        }
        for (block, block_contexts) in contexts {
            if let Some(refs) = self.0.get_mut(block) {
                refs.archive_references(block, block_contexts)?;
            }
        }
        Ok(())
    }

    /// Whether exactly `context` is a non-archived reference to `block`.
    pub fn has_non_archived_reference(&self, block: &BlockId, context: &BlockContext) -> bool {
        self.0
            .get(block)
            .is_some_and(|refs| refs.has_non_archived_reference(context))
    }
}
