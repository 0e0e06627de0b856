/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Durable, per-TLF journals of block-server operations.
//!
//! A TLF's journal is made of:
//! 1. A [Journal Log](journal_log): the ordered sequence of operations accepted locally but not yet
//!    applied to the remote block server.
//! 2. [Reference counts](references) for the blocks the journal has seen.
//! 3. The payloads of blocks with unflushed puts.
//!
//! All three are stored in a user-provided [key-value store](pluggables), laid out as described in
//! [`variables`]. [`BlockJournal`](block_journal::BlockJournal) ties them together into a local
//! implementation of the block-server contract.

use crate::types::data_types::TlfId;

use self::{
    pluggables::{JournalIOError, KVStore},
    write_batch::JournalWriteBatch,
};

pub mod block_journal;

pub mod entry;

pub mod journal_log;

pub mod pluggables;

pub mod references;

pub mod variables;

pub mod write_batch;

/// Add `tlf` to the list of TLFs with a journal in `kv_store`, if it is not there yet.
pub(crate) fn register_domain<K: KVStore>(
    kv_store: &mut K,
    tlf: TlfId,
) -> Result<(), JournalIOError> {
    let mut domains = kv_store.journal_domains()?;
    if domains.contains(&tlf) {
        return Ok(());
    }
    domains.push(tlf);
    let mut wb = JournalWriteBatch::new();
    wb.set_journal_domains(&domains)?;
    Ok(kv_store.write(wb.into_inner())?)
}

/// Remove `tlf` from the list of TLFs with a journal in `kv_store`. Used once a TLF's journal has been
/// disabled with nothing left to flush.
pub(crate) fn unregister_domain<K: KVStore>(
    kv_store: &mut K,
    tlf: TlfId,
) -> Result<(), JournalIOError> {
    let mut domains = kv_store.journal_domains()?;
    if !domains.contains(&tlf) {
        return Ok(());
    }
    domains.retain(|domain| *domain != tlf);
    let mut wb = JournalWriteBatch::new();
    wb.set_journal_domains(&domains)?;
    Ok(kv_store.write(wb.into_inner())?)
}
