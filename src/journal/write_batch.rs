/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Typed setters over a [`WriteBatch`], which take care of forming keys and serializing values of the
//! [journal variables](super::variables).

use borsh::BorshSerialize;

use crate::types::data_types::{BlockId, JournalOrdinal, TlfId};

use super::{
    entry::{CachedBlock, JournalEntry, PendingRefs},
    pluggables::{Key, WriteBatch},
    variables::{self, concat, tlf_key},
};

pub struct JournalWriteBatch<W: WriteBatch>(pub(super) W);

impl<W: WriteBatch> JournalWriteBatch<W> {
    pub(crate) fn new() -> JournalWriteBatch<W> {
        JournalWriteBatch(W::new())
    }

    /// Get the underlying write batch, ready to be written into the key-value store.
    pub(crate) fn into_inner(self) -> W {
        self.0
    }

    /* ↓↓↓ Journal Domains ↓↓↓ */

    pub fn set_journal_domains(&mut self, tlfs: &Vec<TlfId>) -> Result<(), KVSetError> {
        self.set_value(&variables::JOURNAL_DOMAINS, tlfs, Key::JournalDomains)
    }

    /* ↓↓↓ Ordinals ↓↓↓ */

    pub fn set_earliest_ordinal(
        &mut self,
        tlf: &TlfId,
        ordinal: JournalOrdinal,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &tlf_key(tlf, &variables::EARLIEST_ORDINAL),
            &ordinal,
            Key::EarliestOrdinal { tlf: *tlf },
        )
    }

    pub fn set_next_ordinal(
        &mut self,
        tlf: &TlfId,
        ordinal: JournalOrdinal,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &tlf_key(tlf, &variables::NEXT_ORDINAL),
            &ordinal,
            Key::NextOrdinal { tlf: *tlf },
        )
    }

    /* ↓↓↓ Journal Entries ↓↓↓ */

    pub fn set_journal_entry(
        &mut self,
        tlf: &TlfId,
        entry: &JournalEntry,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &journal_entry_key(tlf, entry.ordinal),
            entry,
            Key::JournalEntry {
                tlf: *tlf,
                ordinal: entry.ordinal,
            },
        )
    }

    pub fn delete_journal_entry(&mut self, tlf: &TlfId, ordinal: JournalOrdinal) {
        self.0.delete(&journal_entry_key(tlf, ordinal))
    }

    /* ↓↓↓ Pending Refs ↓↓↓ */

    pub fn set_pending_refs(
        &mut self,
        tlf: &TlfId,
        block: &BlockId,
        pending: &PendingRefs,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &concat(&tlf_key(tlf, &variables::PENDING_REFS), &block.bytes()),
            pending,
            Key::PendingRefs {
                tlf: *tlf,
                block: *block,
            },
        )
    }

    pub fn delete_pending_refs(&mut self, tlf: &TlfId, block: &BlockId) {
        self.0
            .delete(&concat(&tlf_key(tlf, &variables::PENDING_REFS), &block.bytes()))
    }

    /* ↓↓↓ Cached Blocks ↓↓↓ */

    pub fn set_cached_block(
        &mut self,
        tlf: &TlfId,
        block: &BlockId,
        cached: &CachedBlock,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &concat(&tlf_key(tlf, &variables::CACHED_BLOCKS), &block.bytes()),
            cached,
            Key::CachedBlock {
                tlf: *tlf,
                block: *block,
            },
        )
    }

    pub fn delete_cached_block(&mut self, tlf: &TlfId, block: &BlockId) {
        self.0
            .delete(&concat(&tlf_key(tlf, &variables::CACHED_BLOCKS), &block.bytes()))
    }

    fn set_value<T: BorshSerialize>(
        &mut self,
        key: &[u8],
        value: &T,
        variable: Key,
    ) -> Result<(), KVSetError> {
        let bytes = value
            .try_to_vec()
            .map_err(|err| KVSetError::SerializeValueError {
                key: variable,
                source: err,
            })?;
        self.0.set(key, &bytes);
        Ok(())
    }
}

fn journal_entry_key(tlf: &TlfId, ordinal: JournalOrdinal) -> Vec<u8> {
    concat(
        &tlf_key(tlf, &variables::JOURNAL_ENTRIES),
        &ordinal.to_be_bytes(),
    )
}

/// Error when writing a key-value pair to the [write batch][JournalWriteBatch].
/// The error may arise when the value cannot be serialized, and hence cannot be
/// written to the write batch.
#[derive(Debug)]
pub enum KVSetError {
    SerializeValueError { key: Key, source: std::io::Error },
}
