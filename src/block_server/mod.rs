/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The block-server contract, shared by the remote block store and the journal that buffers writes to
//! it.
//!
//! A block server stores immutable, content-addressed blocks, grouped by [TLF](crate::types::data_types::TlfId),
//! and counts the references to each block. Every reference is identified by a
//! [`BlockContext`]. Blocks come into existence with [`put`](BlockServer::put), which also creates the
//! block's first reference; further references are created with
//! [`add_block_reference`](BlockServer::add_block_reference), flagged for reclamation with
//! [`archive_block_references`](BlockServer::archive_block_references), and deleted with
//! [`remove_block_references`](BlockServer::remove_block_references).
//!
//! ## Idempotency
//!
//! Implementations used as the delegate of a [journal server](crate::journal_server) receive every
//! journaled operation *at least once*. They must therefore accept re-applications of operations they
//! have already applied: re-putting a block with an existing context, re-adding an existing reference,
//! removing an absent reference, and re-archiving an archived reference must all succeed without
//! changing state.

use std::fmt::{self, Display, Formatter};

use crate::journal::pluggables::JournalIOError;
use crate::journal::references::BlockRefs;
use crate::types::{
    block_context::{BlockContext, ContextMap, LiveCounts},
    crypto_primitives::Crypto,
    data_types::{BlockCryptKeyServerHalf, BlockId, TlfId},
};

pub mod memory;

pub use memory::MemoryBlockServer;

/// Operations every block server provides. See the [module-level docs](self).
pub trait BlockServer: Send + Sync + 'static {
    /// Get the payload and key server half of `block`, provided `context` is a live, non-archived
    /// reference to it.
    fn get(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<(Vec<u8>, BlockCryptKeyServerHalf), BlockServerError>;

    /// Store `buf` as the payload of `block`, creating the reference identified by `context`. If the
    /// block is already stored, this is equivalent to adding `context` as a new reference.
    fn put(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
        buf: &[u8],
        server_half: BlockCryptKeyServerHalf,
    ) -> Result<(), BlockServerError>;

    /// Register `context` as a new reference to an already stored `block`.
    fn add_block_reference(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<(), BlockServerError>;

    /// Remove every listed reference, ignoring references that do not exist. Returns the number of
    /// references left to each listed block.
    fn remove_block_references(
        &self,
        tlf: TlfId,
        contexts: &ContextMap,
    ) -> Result<LiveCounts, BlockServerError>;

    /// Flag every listed reference as archived. Fails, changing nothing, if any listed reference does
    /// not exist.
    fn archive_block_references(
        &self,
        tlf: TlfId,
        contexts: &ContextMap,
    ) -> Result<(), BlockServerError>;

    /// Get every reference (live or archived) to `block`, or `None` if the block has no references.
    ///
    /// A journal asks its delegate for this before it changes the references of a block that none of
    /// its unflushed entries touch.
    fn block_references(
        &self,
        tlf: TlfId,
        block: &BlockId,
    ) -> Result<Option<BlockRefs>, BlockServerError>;

    /// Release the resources held by this block server.
    fn shutdown(&self);
}

/// Check that a `put` of `buf` as `block` under `context` is well-formed:
/// 1. `context` is a block's first reference: it uses the zero nonce and is owned by the creator.
/// 2. `block` is the content hash of `buf`.
pub fn validate_block_put(
    crypto: &dyn Crypto,
    block: &BlockId,
    context: &BlockContext,
    buf: &[u8],
) -> Result<(), BlockServerError> {
    let invalid = |reason| BlockServerError::InvalidPut {
        block: *block,
        reason,
    };
    if context.writer() != context.creator() {
        return Err(invalid(InvalidPutReason::WriterIsNotCreator));
    }
    if !context.ref_nonce().is_zero() {
        return Err(invalid(InvalidPutReason::NonZeroRefNonce));
    }
    if crypto.make_permanent_block_id(buf) != *block {
        return Err(invalid(InvalidPutReason::BlockIdMismatch));
    }
    Ok(())
}

/// Why a `put` was rejected before anything was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidPutReason {
    /// The context of a `put` must use the zero nonce.
    NonZeroRefNonce,

    /// The context of a `put` must be owned by the block's creator.
    WriterIsNotCreator,

    /// The block id is not the content hash of the payload.
    BlockIdMismatch,
}

/// Enumerates the different ways a call to any of [`BlockServer`]'s methods can fail.
#[derive(Debug)]
pub enum BlockServerError {
    /// The block has never been stored (or every reference to it has been removed).
    UnknownBlock { block: BlockId },

    /// The block exists, but `context` is not one of its live, non-archived references.
    ReferenceNotFound {
        block: BlockId,
        context: BlockContext,
    },

    /// A new reference was added to a block whose every reference is archived.
    BlockArchived { block: BlockId },

    /// A reference listed in `archive_block_references` does not exist.
    ReferenceMissingForArchive {
        block: BlockId,
        context: BlockContext,
    },

    /// See [`InvalidPutReason`].
    InvalidPut {
        block: BlockId,
        reason: InvalidPutReason,
    },

    /// A block was put again with a payload or key half different from the stored one.
    BlockDataMismatch { block: BlockId },

    /// A reference was added with a nonce that the block already uses for a different context.
    ContextMismatch {
        block: BlockId,
        existing: BlockContext,
        given: BlockContext,
    },

    /// The TLF's journal could not be read from or written to. The journal is unusable after this.
    JournalIo { tlf: TlfId, source: JournalIOError },

    /// A previous journal I/O failure made the TLF's journal unusable.
    JournalUnusable { tlf: TlfId },

    /// The TLF's journal is disabled but still holds unflushed entries.
    JournalDisabled { tlf: TlfId },

    /// The remote block server could not be reached, or failed in a way that is worth retrying.
    RemoteTransient { reason: String },

    /// The remote block server refused the operation, e.g., because permission was revoked.
    RemoteRejected { reason: String },

    /// The block server has been shut down.
    ShutDown,
}

impl BlockServerError {
    /// Whether the failed call may succeed if retried unchanged. The flush worker retries transient
    /// errors with backoff, and halts on every other error.
    pub fn is_transient(&self) -> bool {
        matches!(self, BlockServerError::RemoteTransient { .. })
    }
}

impl Display for BlockServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BlockServerError::UnknownBlock { block } => write!(f, "Unknown block {}", block),
            BlockServerError::ReferenceNotFound { block, context } => {
                write!(f, "No live reference {:?} to block {}", context, block)
            }
            BlockServerError::BlockArchived { block } => {
                write!(f, "Every reference to block {} is archived", block)
            }
            BlockServerError::ReferenceMissingForArchive { block, context } => write!(
                f,
                "Cannot archive missing reference {:?} to block {}",
                context, block
            ),
            BlockServerError::InvalidPut { block, reason } => {
                write!(f, "Invalid put of block {}: {:?}", block, reason)
            }
            BlockServerError::BlockDataMismatch { block } => {
                write!(f, "Block {} was put again with different data", block)
            }
            BlockServerError::ContextMismatch {
                block,
                existing,
                given,
            } => write!(
                f,
                "Reference {:?} to block {} conflicts with existing reference {:?}",
                given, block, existing
            ),
            BlockServerError::JournalIo { tlf, source } => {
                write!(f, "Journal I/O error in TLF {}: {}", tlf, source)
            }
            BlockServerError::JournalUnusable { tlf } => {
                write!(f, "Journal of TLF {} is unusable", tlf)
            }
            BlockServerError::JournalDisabled { tlf } => write!(
                f,
                "Journal of TLF {} is disabled with unflushed entries",
                tlf
            ),
            BlockServerError::RemoteTransient { reason } => {
                write!(f, "Transient remote error: {}", reason)
            }
            BlockServerError::RemoteRejected { reason } => {
                write!(f, "Remote rejected the operation: {}", reason)
            }
            BlockServerError::ShutDown => write!(f, "Block server is shut down"),
        }
    }
}
