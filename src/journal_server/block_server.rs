/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The block server that callers use while journaling is on.
//!
//! [`JournalBlockServer`] routes every call by TLF. Calls on a TLF with an enabled journal are served
//! by that journal: they return as soon as the operation is durably appended, and the TLF's flush
//! worker is woken to apply it to the delegate later. Calls on any other TLF go straight to the
//! delegate.
//!
//! A journaled call on a block that no unflushed entry touches asks the delegate for the block's
//! references first, while holding the journal's lock. That read cannot race with the flush worker,
//! because the worker only applies entries that touch other blocks, and cannot remove any entry until
//! the lock is released.

use std::sync::Arc;
use std::time::SystemTime;

use crate::block_server::{BlockServer, BlockServerError};
use crate::events::{AppendEntryEvent, Event};
use crate::journal::block_journal::{BlockJournal, LocalGet};
use crate::journal::entry::JournalEntry;
use crate::journal::pluggables::KVStore;
use crate::journal::references::{BlockRefs, RefStatus};
use crate::types::{
    block_context::{BlockContext, ContextMap, LiveCounts},
    data_types::{BlockCryptKeyServerHalf, BlockId, TlfId},
};

use super::flush_worker::WorkerCommand;
use super::tlf_journal::TlfJournal;
use super::Shared;

/// A [`BlockServer`] that journals the calls on journaled TLFs, and passes the rest through to the
/// delegate. Get one with [`JournalServer::block_server`](super::JournalServer::block_server).
pub struct JournalBlockServer<K: KVStore, D: BlockServer> {
    shared: Arc<Shared<K, D>>,
}

impl<K: KVStore, D: BlockServer> Clone for JournalBlockServer<K, D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: KVStore, D: BlockServer> JournalBlockServer<K, D> {
    pub(crate) fn new(shared: Arc<Shared<K, D>>) -> Self {
        Self { shared }
    }

    /// Get the journal that serves `tlf`, or `None` if calls on `tlf` go to the delegate.
    fn route(&self, tlf: TlfId) -> Result<Option<Arc<TlfJournal<K>>>, BlockServerError> {
        if self.shared.is_shut_down() {
            return Err(BlockServerError::ShutDown);
        }
        Ok(self.shared.journal(tlf))
    }

    /// Fetch a block whose payload has been flushed, but whose reference `context` may still be
    /// unflushed. If the delegate does not know `context` yet, read through any other live reference the
    /// delegate holds: the payload is the same for every reference.
    fn get_flushed(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<(Vec<u8>, BlockCryptKeyServerHalf), BlockServerError> {
        let delegate = &self.shared.delegate;
        match delegate.get(tlf, block, context) {
            Err(err @ BlockServerError::ReferenceNotFound { .. }) => {
                let readable = delegate.block_references(tlf, block)?.and_then(|refs| {
                    refs.iter()
                        .find(|entry| entry.status == RefStatus::Live)
                        .map(|entry| entry.context)
                });
                match readable {
                    Some(other) => delegate.get(tlf, block, &other),
                    None => Err(err),
                }
            }
            result => result,
        }
    }

    /// Run a mutating operation on `tlf_journal`, then announce the appended entry and wake the flush
    /// worker.
    fn append<T>(
        &self,
        tlf_journal: &TlfJournal<K>,
        op: impl FnOnce(&mut BlockJournal<K>, &D) -> Result<(T, JournalEntry), BlockServerError>,
    ) -> Result<T, BlockServerError> {
        let (value, entry) = {
            let mut state = tlf_journal.lock()?;
            if !state.enabled {
                return Err(BlockServerError::JournalDisabled {
                    tlf: tlf_journal.tlf(),
                });
            }
            op(&mut state.journal, self.shared.delegate.as_ref())?
        };

        Event::AppendEntry(AppendEntryEvent {
            timestamp: SystemTime::now(),
            tlf: tlf_journal.tlf(),
            ordinal: entry.ordinal,
            kind: entry.op.kind(),
        })
        .publish(&self.shared.event_publisher);
        tlf_journal.send(WorkerCommand::Wake);
        Ok(value)
    }
}

impl<K: KVStore, D: BlockServer> BlockServer for JournalBlockServer<K, D> {
    fn get(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<(Vec<u8>, BlockCryptKeyServerHalf), BlockServerError> {
        let Some(tlf_journal) = self.route(tlf)? else {
            return self.shared.delegate.get(tlf, block, context);
        };
        let local = {
            let mut state = tlf_journal.lock()?;
            if !state.enabled {
                return Err(BlockServerError::JournalDisabled { tlf });
            }
            state.journal.get(block, context)?
        };
        match local {
            LocalGet::Found(data, server_half) => Ok((data, server_half)),
            LocalGet::Flushed => self.get_flushed(tlf, block, context),
            LocalGet::NotJournaled => self.shared.delegate.get(tlf, block, context),
        }
    }

    fn put(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
        buf: &[u8],
        server_half: BlockCryptKeyServerHalf,
    ) -> Result<(), BlockServerError> {
        let Some(tlf_journal) = self.route(tlf)? else {
            return self.shared.delegate.put(tlf, block, context, buf, server_half);
        };
        self.append(&tlf_journal, |journal, delegate| {
            journal
                .put(delegate, block, context, buf, server_half)
                .map(|entry| ((), entry))
        })
    }

    fn add_block_reference(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<(), BlockServerError> {
        let Some(tlf_journal) = self.route(tlf)? else {
            return self.shared.delegate.add_block_reference(tlf, block, context);
        };
        self.append(&tlf_journal, |journal, delegate| {
            journal
                .add_block_reference(delegate, block, context)
                .map(|entry| ((), entry))
        })
    }

    fn remove_block_references(
        &self,
        tlf: TlfId,
        contexts: &ContextMap,
    ) -> Result<LiveCounts, BlockServerError> {
        let Some(tlf_journal) = self.route(tlf)? else {
            return self.shared.delegate.remove_block_references(tlf, contexts);
        };
        self.append(&tlf_journal, |journal, delegate| {
            journal.remove_block_references(delegate, contexts)
        })
    }

    fn archive_block_references(
        &self,
        tlf: TlfId,
        contexts: &ContextMap,
    ) -> Result<(), BlockServerError> {
        let Some(tlf_journal) = self.route(tlf)? else {
            return self.shared.delegate.archive_block_references(tlf, contexts);
        };
        self.append(&tlf_journal, |journal, delegate| {
            journal
                .archive_block_references(delegate, contexts)
                .map(|entry| ((), entry))
        })
    }

    /// The references the block will have once the journal of `tlf` is flushed.
    fn block_references(
        &self,
        tlf: TlfId,
        block: &BlockId,
    ) -> Result<Option<BlockRefs>, BlockServerError> {
        let Some(tlf_journal) = self.route(tlf)? else {
            return self.shared.delegate.block_references(tlf, block);
        };
        let mut state = tlf_journal.lock()?;
        if !state.enabled {
            return Err(BlockServerError::JournalDisabled { tlf });
        }
        match state.journal.pending_refs(block)? {
            Some(pending) if pending.refs.is_empty() => Ok(None),
            Some(pending) => Ok(Some(pending.refs)),
            None => self.shared.delegate.block_references(tlf, block),
        }
    }

    /// Stop every flush worker and shut the delegate down. Unflushed entries stay in the journals.
    fn shutdown(&self) {
        self.shared.shutdown();
    }
}
