/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types stored in a TLF's journal.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    block_context::{BlockContext, ContextMap},
    data_types::{BlockCryptKeyServerHalf, BlockId, JournalOrdinal},
};

use super::references::BlockRefs;

/// A block-server operation accepted locally and waiting to be applied to the remote block server.
///
/// `Put` does not carry its payload: payloads are stored once per block, as a [`CachedBlock`], no
/// matter how many unflushed puts of the block the journal holds.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum BlockOp {
    Put {
        block: BlockId,
        context: BlockContext,
    },
    AddReference {
        block: BlockId,
        context: BlockContext,
    },
    RemoveReferences {
        contexts: ContextMap,
    },
    ArchiveReferences {
        contexts: ContextMap,
    },
}

impl BlockOp {
    /// Name of the kind of this operation, in PascalCase, for printing.
    pub fn kind(&self) -> &'static str {
        match self {
            BlockOp::Put { .. } => "Put",
            BlockOp::AddReference { .. } => "AddReference",
            BlockOp::RemoveReferences { .. } => "RemoveReferences",
            BlockOp::ArchiveReferences { .. } => "ArchiveReferences",
        }
    }

    /// The blocks whose references this operation changes.
    pub fn blocks(&self) -> Vec<BlockId> {
        match self {
            BlockOp::Put { block, .. } | BlockOp::AddReference { block, .. } => vec![*block],
            BlockOp::RemoveReferences { contexts } | BlockOp::ArchiveReferences { contexts } => {
                contexts.keys().copied().collect()
            }
        }
    }
}

/// One entry of a TLF's journal.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct JournalEntry {
    pub ordinal: JournalOrdinal,
    pub op: BlockOp,
}

/// Payload and key half of a block that has at least one unflushed `Put` entry.
#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CachedBlock {
    pub data: Vec<u8>,
    pub server_half: BlockCryptKeyServerHalf,

    /// Number of unflushed `Put` entries of this block. The cached block is deleted when the last of
    /// them is flushed.
    pub unflushed_puts: u64,
}

/// The references a block will have on the remote block server once every unflushed entry is applied.
///
/// The journal only keeps `PendingRefs` for blocks touched by at least one unflushed entry. For any
/// other block, the remote block server is authoritative.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct PendingRefs {
    pub refs: BlockRefs,

    /// Number of unflushed entries that change the references of this block.
    pub unflushed_ops: u64,
}
