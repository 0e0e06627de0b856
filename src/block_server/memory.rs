/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A volatile, in-memory [`BlockServer`] with the semantics of the authoritative remote block store.
//!
//! `MemoryBlockServer` reclaims a block's payload as soon as its last reference is removed. It accepts
//! re-applications of operations it has already applied (see [idempotency](super#idempotency)), so it
//! can serve as the delegate of a [journal server](crate::journal_server).

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::journal::references::{BlockRefs, ReferenceTracker};
use crate::types::{
    block_context::{BlockContext, ContextMap, LiveCounts},
    crypto_primitives::Crypto,
    data_types::{BlockCryptKeyServerHalf, BlockId, TlfId},
};

use super::{validate_block_put, BlockServer, BlockServerError};

#[derive(Default)]
struct TlfBlocks {
    data: BTreeMap<BlockId, (Vec<u8>, BlockCryptKeyServerHalf)>,
    refs: ReferenceTracker,
}

struct MemoryState {
    tlfs: HashMap<TlfId, TlfBlocks>,
    shut_down: bool,
}

/// An in-memory implementation of [`BlockServer`]. Clones share the same underlying storage.
#[derive(Clone)]
pub struct MemoryBlockServer {
    crypto: Arc<dyn Crypto>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBlockServer {
    /// Create a new, empty `MemoryBlockServer` that validates puts using `crypto`.
    pub fn new(crypto: Arc<dyn Crypto>) -> Self {
        MemoryBlockServer {
            crypto,
            state: Arc::new(Mutex::new(MemoryState {
                tlfs: HashMap::new(),
                shut_down: false,
            })),
        }
    }

    /// Whether the payload of `block` is stored in `tlf`.
    pub fn has_data(&self, tlf: TlfId, block: &BlockId) -> bool {
        self.state.lock().is_ok_and(|state| {
            state
                .tlfs
                .get(&tlf)
                .is_some_and(|blocks| blocks.data.contains_key(block))
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, BlockServerError> {
        let state = self
            .state
            .lock()
            .map_err(|_| BlockServerError::RemoteTransient {
                reason: String::from("memory block server lock poisoned"),
            })?;
        if state.shut_down {
            return Err(BlockServerError::ShutDown);
        }
        Ok(state)
    }
}

impl BlockServer for MemoryBlockServer {
    fn get(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<(Vec<u8>, BlockCryptKeyServerHalf), BlockServerError> {
        let state = self.lock()?;
        let blocks = state
            .tlfs
            .get(&tlf)
            .ok_or(BlockServerError::UnknownBlock { block: *block })?;
        let (buf, server_half) = blocks
            .data
            .get(block)
            .ok_or(BlockServerError::UnknownBlock { block: *block })?;
        if !blocks.refs.has_non_archived_reference(block, context) {
            return Err(BlockServerError::ReferenceNotFound {
                block: *block,
                context: *context,
            });
        }
        Ok((buf.clone(), *server_half))
    }

    fn put(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
        buf: &[u8],
        server_half: BlockCryptKeyServerHalf,
    ) -> Result<(), BlockServerError> {
        validate_block_put(self.crypto.as_ref(), block, context, buf)?;
        let mut state = self.lock()?;
        let blocks = state.tlfs.entry(tlf).or_default();
        match blocks.data.get(block) {
            Some((existing_buf, existing_half)) => {
                if existing_buf.as_slice() != buf || *existing_half != server_half {
                    return Err(BlockServerError::BlockDataMismatch { block: *block });
                }
                let refs = blocks.refs.refs(block).cloned().unwrap_or_default();
                if !refs.contains(context) && !refs.has_any_non_archived_reference() {
                    return Err(BlockServerError::BlockArchived { block: *block });
                }
            }
            None => {
                blocks.data.insert(*block, (buf.to_vec(), server_half));
            }
        }
        blocks.refs.add_reference(block, context)
    }

    fn add_block_reference(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<(), BlockServerError> {
        let mut state = self.lock()?;
        let blocks = state
            .tlfs
            .get_mut(&tlf)
            .ok_or(BlockServerError::UnknownBlock { block: *block })?;
        let refs = blocks
            .refs
            .refs(block)
            .ok_or(BlockServerError::UnknownBlock { block: *block })?;
        if refs.contains(context) {
            return Ok(());
        }
        if !refs.has_any_non_archived_reference() {
            return Err(BlockServerError::BlockArchived { block: *block });
        }
        blocks.refs.add_reference(block, context)
    }

    fn remove_block_references(
        &self,
        tlf: TlfId,
        contexts: &ContextMap,
    ) -> Result<LiveCounts, BlockServerError> {
        let mut state = self.lock()?;
        let blocks = state.tlfs.entry(tlf).or_default();
        let live_counts = blocks.refs.remove_references(contexts);
        for (block, count) in &live_counts {
            if *count == 0 {
                blocks.data.remove(block);
            }
        }
        Ok(live_counts)
    }

    fn archive_block_references(
        &self,
        tlf: TlfId,
        contexts: &ContextMap,
    ) -> Result<(), BlockServerError> {
        let mut state = self.lock()?;
        let blocks = state.tlfs.entry(tlf).or_default();
        blocks.refs.archive_references(contexts)
    }

    fn block_references(
        &self,
        tlf: TlfId,
        block: &BlockId,
    ) -> Result<Option<BlockRefs>, BlockServerError> {
        let state = self.lock()?;
        Ok(state
            .tlfs
            .get(&tlf)
            .and_then(|blocks| blocks.refs.refs(block).cloned()))
    }

    fn shutdown(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.shut_down = true;
        }
    }
}
