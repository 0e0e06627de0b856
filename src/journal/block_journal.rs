/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The journal of a single TLF: the block-server contract implemented locally on top of a
//! [`JournalLog`], persisted [`PendingRefs`], and cached payloads.
//!
//! ## Write-ahead discipline
//!
//! Every mutating method computes all of its changes (the new journal entry, the reference-count
//! change, and for puts, the cached payload) into a single [`JournalWriteBatch`], and writes that batch
//! before returning. A method that returns `Ok` has therefore durably logged its operation, and a
//! method that returns `Err` has changed nothing.
//!
//! A failed write makes the journal *unusable*: every later call fails with
//! [`JournalUnusable`](BlockServerError::JournalUnusable) until the journal is reopened.
//!
//! ## Flushing
//!
//! The [flush worker](crate::journal_server::flush_worker) takes the oldest entry with
//! [`next_flush`](BlockJournal::next_flush), applies it to the remote block server, and then calls
//! [`complete_flush`](BlockJournal::complete_flush) to remove it from the log. A payload is dropped
//! once the last put of its block is flushed, and a block's pending references once the last entry
//! touching the block is flushed.
//!
//! ## Blocks without unflushed entries
//!
//! For a block that no unflushed entry touches, the remote block server is authoritative. Reads of
//! such a block are left to the remote block server, and a mutating call first fetches the block's
//! references from it with [`block_references`](BlockServer::block_references). Since no unflushed
//! entry touches the block, those references are exactly what the remote block server will hold when
//! the new entry is applied. If the remote block server cannot be reached, the call fails with its
//! error, except for puts, which assume the block is new.

use std::sync::Arc;

use crate::block_server::{validate_block_put, BlockServer, BlockServerError};
use crate::types::{
    block_context::{BlockContext, ContextMap, LiveCounts},
    crypto_primitives::Crypto,
    data_types::{BlockCryptKeyServerHalf, BlockId, JournalOrdinal, TlfId},
};

use super::{
    entry::{BlockOp, CachedBlock, JournalEntry, PendingRefs},
    journal_log::JournalLog,
    pluggables::{JournalIOError, KVGet, KVGetError, KVStore, Key},
    write_batch::JournalWriteBatch,
};

pub struct BlockJournal<K: KVStore> {
    tlf: TlfId,
    kv_store: K,
    crypto: Arc<dyn Crypto>,
    log: JournalLog,
    unflushed_bytes: u64,
    unusable: bool,
}

/// Result of a local [`get`](BlockJournal::get).
#[derive(Debug, PartialEq, Eq)]
pub enum LocalGet {
    /// The payload is still cached in the journal.
    Found(Vec<u8>, BlockCryptKeyServerHalf),

    /// `context` is a live reference according to the unflushed entries, but the payload has already
    /// been flushed. The remote block server may not know `context` yet.
    Flushed,

    /// No unflushed entry touches the block. The remote block server has to be asked.
    NotJournaled,
}

/// An entry that is ready to be applied to the remote block server.
#[derive(Clone)]
pub struct FlushItem {
    pub entry: JournalEntry,

    /// For `Put` entries, the payload and key half to put.
    pub payload: Option<(Vec<u8>, BlockCryptKeyServerHalf)>,
}

impl<K: KVStore> BlockJournal<K> {
    /// Open the journal of `tlf` in `kv_store`, creating it if it does not exist yet.
    pub fn open(tlf: TlfId, kv_store: K, crypto: Arc<dyn Crypto>) -> Result<Self, JournalIOError> {
        let mut kv_store = kv_store;
        super::register_domain(&mut kv_store, tlf)?;
        let log = JournalLog::open(&kv_store, tlf)?;

        let mut unflushed_bytes = 0;
        for entry in log.entries_from(&kv_store, log.earliest()) {
            if let BlockOp::Put { block, .. } = entry?.op {
                unflushed_bytes += cached_block_or_err(&kv_store, &tlf, &block)?.data.len() as u64;
            }
        }

        log::debug!(
            "Opened journal of TLF {} with {} unflushed entries",
            tlf,
            log.len()
        );
        Ok(BlockJournal {
            tlf,
            kv_store,
            crypto,
            log,
            unflushed_bytes,
            unusable: false,
        })
    }

    pub fn tlf(&self) -> TlfId {
        self.tlf
    }

    pub fn log(&self) -> &JournalLog {
        &self.log
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Total payload size of the unflushed puts.
    pub fn unflushed_bytes(&self) -> u64 {
        self.unflushed_bytes
    }

    /// Whether a journal I/O failure has made this journal unusable.
    pub fn is_unusable(&self) -> bool {
        self.unusable
    }

    /// Get the pending references of `block`, or `None` if no unflushed entry touches it.
    pub fn pending_refs(
        &mut self,
        block: &BlockId,
    ) -> Result<Option<PendingRefs>, BlockServerError> {
        self.check_usable()?;
        self.read(|kv, tlf| kv.pending_refs(tlf, block))
    }

    /* ↓↓↓ Block server operations ↓↓↓ */

    pub fn get(
        &mut self,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<LocalGet, BlockServerError> {
        self.check_usable()?;
        let Some(pending) = self.pending_refs(block)? else {
            return Ok(LocalGet::NotJournaled);
        };
        if !pending.refs.has_non_archived_reference(context) {
            return Err(BlockServerError::ReferenceNotFound {
                block: *block,
                context: *context,
            });
        }
        match self.read(|kv, tlf| kv.cached_block(tlf, block))? {
            Some(cached) => Ok(LocalGet::Found(cached.data, cached.server_half)),
            None => Ok(LocalGet::Flushed),
        }
    }

    pub fn put<R: BlockServer + ?Sized>(
        &mut self,
        remote: &R,
        block: &BlockId,
        context: &BlockContext,
        buf: &[u8],
        server_half: BlockCryptKeyServerHalf,
    ) -> Result<JournalEntry, BlockServerError> {
        self.check_usable()?;
        validate_block_put(self.crypto.as_ref(), block, context, buf)?;

        // A block being put is almost always new. If the remote block server cannot be reached, assume
        // it is, and leave any conflict to be reported when the put is flushed.
        let mut pending = match self.current_refs(remote, block) {
            Err(err) if err.is_transient() => PendingRefs::default(),
            result => result?,
        };
        let cached = match self.read(|kv, tlf| kv.cached_block(tlf, block))? {
            Some(cached) => {
                if cached.data != buf || cached.server_half != server_half {
                    return Err(BlockServerError::BlockDataMismatch { block: *block });
                }
                CachedBlock {
                    unflushed_puts: cached.unflushed_puts + 1,
                    ..cached
                }
            }
            None => CachedBlock {
                data: buf.to_vec(),
                server_half,
                unflushed_puts: 1,
            },
        };
        let refs = &mut pending.refs;
        if !refs.is_empty() && !refs.contains(context) && !refs.has_any_non_archived_reference() {
            return Err(BlockServerError::BlockArchived { block: *block });
        }
        refs.add_reference(block, context)?;
        pending.unflushed_ops += 1;

        let tlf = self.tlf;
        let entry = self.commit(
            BlockOp::Put {
                block: *block,
                context: *context,
            },
            |wb| {
                wb.set_pending_refs(&tlf, block, &pending)?;
                wb.set_cached_block(&tlf, block, &cached)?;
                Ok(())
            },
        )?;
        self.unflushed_bytes += buf.len() as u64;
        Ok(entry)
    }

    pub fn add_block_reference<R: BlockServer + ?Sized>(
        &mut self,
        remote: &R,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<JournalEntry, BlockServerError> {
        self.check_usable()?;
        let mut pending = self.current_refs(remote, block)?;
        let refs = &mut pending.refs;
        if refs.is_empty() {
            return Err(BlockServerError::UnknownBlock { block: *block });
        }
        if !refs.contains(context) && !refs.has_any_non_archived_reference() {
            return Err(BlockServerError::BlockArchived { block: *block });
        }
        refs.add_reference(block, context)?;
        pending.unflushed_ops += 1;

        let tlf = self.tlf;
        self.commit(
            BlockOp::AddReference {
                block: *block,
                context: *context,
            },
            |wb| Ok(wb.set_pending_refs(&tlf, block, &pending)?),
        )
    }

    pub fn remove_block_references<R: BlockServer + ?Sized>(
        &mut self,
        remote: &R,
        contexts: &ContextMap,
    ) -> Result<(LiveCounts, JournalEntry), BlockServerError> {
        self.check_usable()?;
        let mut live_counts = LiveCounts::new();
        let mut changed = Vec::new();
        for (block, block_contexts) in contexts {
            let mut pending = self.current_refs(remote, block)?;
            live_counts.insert(*block, pending.refs.remove_references(block_contexts));
            pending.unflushed_ops += 1;
            changed.push((*block, pending));
        }

        let tlf = self.tlf;
        let entry = self.commit(
            BlockOp::RemoveReferences {
                contexts: contexts.clone(),
            },
            |wb| {
                for (block, pending) in &changed {
                    wb.set_pending_refs(&tlf, block, pending)?;
                }
                Ok(())
            },
        )?;
        Ok((live_counts, entry))
    }

    pub fn archive_block_references<R: BlockServer + ?Sized>(
        &mut self,
        remote: &R,
        contexts: &ContextMap,
    ) -> Result<JournalEntry, BlockServerError> {
        self.check_usable()?;
        let mut changed = Vec::new();
        for (block, block_contexts) in contexts {
            let mut pending = self.current_refs(remote, block)?;
            pending.refs.archive_references(block, block_contexts)?;
            pending.unflushed_ops += 1;
            changed.push((*block, pending));
        }

        let tlf = self.tlf;
        self.commit(
            BlockOp::ArchiveReferences {
                contexts: contexts.clone(),
            },
            |wb| {
                for (block, pending) in &changed {
                    wb.set_pending_refs(&tlf, block, pending)?;
                }
                Ok(())
            },
        )
    }

    /* ↓↓↓ Flushing ↓↓↓ */

    /// Get the oldest unflushed entry, together with its payload if it is a put.
    pub fn next_flush(&mut self) -> Result<Option<FlushItem>, BlockServerError> {
        self.check_usable()?;
        let result = self.log.earliest_entry(&self.kv_store).map_err(JournalIOError::from);
        let Some(entry) = self.check_io(result)? else {
            return Ok(None);
        };
        let payload = match &entry.op {
            BlockOp::Put { block, .. } => {
                let cached = self.read(|kv, tlf| cached_block_or_err(kv, tlf, block))?;
                Some((cached.data, cached.server_half))
            }
            _ => None,
        };
        Ok(Some(FlushItem { entry, payload }))
    }

    /// Remove the entry at `ordinal`, which must be the oldest unflushed entry, after it has been
    /// applied to the remote block server.
    pub fn complete_flush(&mut self, ordinal: JournalOrdinal) -> Result<(), BlockServerError> {
        self.check_usable()?;
        if ordinal != self.log.earliest() || self.log.is_empty() {
            return Ok(());
        }
        let result = self.log.earliest_entry(&self.kv_store).map_err(JournalIOError::from);
        let Some(entry) = self.check_io(result)? else {
            return Ok(());
        };

        let tlf = self.tlf;
        let mut wb = JournalWriteBatch::new();
        let mut flushed_bytes = 0;
        let result = (|| -> Result<(), JournalIOError> {
            self.log.remove_up_to(&mut wb, ordinal)?;
            for block in entry.op.blocks() {
                match self.kv_store.pending_refs(&tlf, &block)? {
                    Some(pending) if pending.unflushed_ops > 1 => wb.set_pending_refs(
                        &tlf,
                        &block,
                        &PendingRefs {
                            unflushed_ops: pending.unflushed_ops - 1,
                            ..pending
                        },
                    )?,
                    _ => wb.delete_pending_refs(&tlf, &block),
                }
            }
            if let BlockOp::Put { block, .. } = &entry.op {
                let cached = cached_block_or_err(&self.kv_store, &tlf, block)?;
                flushed_bytes = cached.data.len() as u64;
                if cached.unflushed_puts <= 1 {
                    wb.delete_cached_block(&tlf, block);
                } else {
                    wb.set_cached_block(
                        &tlf,
                        block,
                        &CachedBlock {
                            unflushed_puts: cached.unflushed_puts - 1,
                            ..cached
                        },
                    )?;
                }
            }
            Ok(self.kv_store.write(wb.into_inner())?)
        })();
        self.check_io(result)?;

        self.log.removed_up_to(ordinal);
        self.unflushed_bytes = self.unflushed_bytes.saturating_sub(flushed_bytes);
        Ok(())
    }

    /* ↓↓↓ Helpers ↓↓↓ */

    fn check_usable(&self) -> Result<(), BlockServerError> {
        if self.unusable {
            return Err(BlockServerError::JournalUnusable { tlf: self.tlf });
        }
        Ok(())
    }

    /// Convert a journal I/O failure into a `BlockServerError`, marking the journal unusable.
    fn check_io<T>(&mut self, result: Result<T, JournalIOError>) -> Result<T, BlockServerError> {
        result.map_err(|err| {
            log::warn!("Journal of TLF {} is now unusable: {}", self.tlf, err);
            self.unusable = true;
            BlockServerError::JournalIo {
                tlf: self.tlf,
                source: err,
            }
        })
    }

    /// Get the references `block` will have once the journal is flushed: from the journal if an
    /// unflushed entry touches `block`, and from `remote` otherwise.
    fn current_refs<R: BlockServer + ?Sized>(
        &mut self,
        remote: &R,
        block: &BlockId,
    ) -> Result<PendingRefs, BlockServerError> {
        if let Some(pending) = self.pending_refs(block)? {
            return Ok(pending);
        }
        let refs = remote.block_references(self.tlf, block)?.unwrap_or_default();
        Ok(PendingRefs {
            refs,
            unflushed_ops: 0,
        })
    }

    fn read<T>(
        &mut self,
        f: impl FnOnce(&K, &TlfId) -> Result<T, KVGetError>,
    ) -> Result<T, BlockServerError> {
        let result = f(&self.kv_store, &self.tlf).map_err(JournalIOError::from);
        self.check_io(result)
    }

    /// Append `op` to the log and durably write it together with the changes `f` adds to the batch.
    fn commit(
        &mut self,
        op: BlockOp,
        f: impl FnOnce(&mut JournalWriteBatch<K::WriteBatch>) -> Result<(), JournalIOError>,
    ) -> Result<JournalEntry, BlockServerError> {
        let mut wb = JournalWriteBatch::new();
        let result = (|| -> Result<JournalEntry, JournalIOError> {
            let entry = self.log.append(&mut wb, op)?;
            f(&mut wb)?;
            self.kv_store.write(wb.into_inner())?;
            Ok(entry)
        })();
        let entry = self.check_io(result)?;
        self.log.appended(entry.ordinal);
        Ok(entry)
    }
}

fn cached_block_or_err<G: KVGet>(
    kv: &G,
    tlf: &TlfId,
    block: &BlockId,
) -> Result<CachedBlock, KVGetError> {
    kv.cached_block(tlf, block)?
        .ok_or(KVGetError::ValueExpectedButNotFound {
            key: Key::CachedBlock {
                tlf: *tlf,
                block: *block,
            },
        })
}
