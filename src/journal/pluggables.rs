//! Traits for pluggable journal persistence.
//!
//! The journal does not write files itself. Instead, it writes into a key-value store provided by the
//! library user, which decides the storage medium. The only requirement on the store is that a
//! successful [`write`](KVStore::write) of a [`WriteBatch`] is atomic and durable: once `write`
//! returns `Ok`, every change in the batch survives a process crash, and no change in a failed batch
//! is ever visible.
//!
//! Given a method to obtain the value for a given key in bytes, [`KVGet`] also provides methods to
//! obtain the [journal variables](super::variables) stored in the key-value store.

use std::fmt::{self, Display};

use borsh::BorshDeserialize;

use crate::types::data_types::{BlockId, JournalOrdinal, TlfId};

use super::{
    entry::{CachedBlock, JournalEntry, PendingRefs},
    variables::{self, concat, tlf_key},
    write_batch::KVSetError,
};

pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;

    fn write(&mut self, wb: Self::WriteBatch) -> std::io::Result<()>;
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /* ↓↓↓ Journal Domains ↓↓↓ */

    fn journal_domains(&self) -> Result<Vec<TlfId>, KVGetError> {
        get_value(self, &variables::JOURNAL_DOMAINS, Key::JournalDomains)
            .map(Option::unwrap_or_default)
    }

    /* ↓↓↓ Ordinals ↓↓↓ */

    fn earliest_ordinal(&self, tlf: &TlfId) -> Result<Option<JournalOrdinal>, KVGetError> {
        get_value(
            self,
            &tlf_key(tlf, &variables::EARLIEST_ORDINAL),
            Key::EarliestOrdinal { tlf: *tlf },
        )
    }

    fn next_ordinal(&self, tlf: &TlfId) -> Result<Option<JournalOrdinal>, KVGetError> {
        get_value(
            self,
            &tlf_key(tlf, &variables::NEXT_ORDINAL),
            Key::NextOrdinal { tlf: *tlf },
        )
    }

    /* ↓↓↓ Journal Entries ↓↓↓ */

    fn journal_entry(
        &self,
        tlf: &TlfId,
        ordinal: JournalOrdinal,
    ) -> Result<Option<JournalEntry>, KVGetError> {
        get_value(
            self,
            &concat(
                &tlf_key(tlf, &variables::JOURNAL_ENTRIES),
                &ordinal.to_be_bytes(),
            ),
            Key::JournalEntry {
                tlf: *tlf,
                ordinal,
            },
        )
    }

    /* ↓↓↓ Pending Refs ↓↓↓ */

    fn pending_refs(
        &self,
        tlf: &TlfId,
        block: &BlockId,
    ) -> Result<Option<PendingRefs>, KVGetError> {
        get_value(
            self,
            &concat(&tlf_key(tlf, &variables::PENDING_REFS), &block.bytes()),
            Key::PendingRefs {
                tlf: *tlf,
                block: *block,
            },
        )
    }

    /* ↓↓↓ Cached Blocks ↓↓↓ */

    fn cached_block(
        &self,
        tlf: &TlfId,
        block: &BlockId,
    ) -> Result<Option<CachedBlock>, KVGetError> {
        get_value(
            self,
            &concat(&tlf_key(tlf, &variables::CACHED_BLOCKS), &block.bytes()),
            Key::CachedBlock {
                tlf: *tlf,
                block: *block,
            },
        )
    }
}

fn get_value<G: KVGet + ?Sized, T: BorshDeserialize>(
    kv: &G,
    key: &[u8],
    variable: Key,
) -> Result<Option<T>, KVGetError> {
    match kv.get(key) {
        Some(bytes) => T::deserialize(&mut &*bytes)
            .map(Some)
            .map_err(|err| KVGetError::DeserializeValueError {
                key: variable,
                source: err,
            }),
        None => Ok(None),
    }
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// Error when trying to read a value corresponding to a given key from the [key value store][KVStore].
/// The error may arise in the following circumstances:
/// 1. The value corresponding to a given key cannot be deserialized into its expected type,
/// 2. The value corresponding to a given key cannot be found, even though the journal's invariants
///    say that it should exist.
#[derive(Debug)]
pub enum KVGetError {
    DeserializeValueError { key: Key, source: std::io::Error },
    ValueExpectedButNotFound { key: Key },
}

#[derive(Debug)]
pub enum Key {
    JournalDomains,
    EarliestOrdinal { tlf: TlfId },
    NextOrdinal { tlf: TlfId },
    JournalEntry { tlf: TlfId, ordinal: JournalOrdinal },
    PendingRefs { tlf: TlfId, block: BlockId },
    CachedBlock { tlf: TlfId, block: BlockId },
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::JournalDomains => write!(f, "Journal Domains"),
            Key::EarliestOrdinal { tlf } => write!(f, "Earliest Ordinal of TLF {}", tlf),
            Key::NextOrdinal { tlf } => write!(f, "Next Ordinal of TLF {}", tlf),
            Key::JournalEntry { tlf, ordinal } => {
                write!(f, "Journal Entry {} of TLF {}", ordinal, tlf)
            }
            Key::PendingRefs { tlf, block } => {
                write!(f, "Pending Refs for block {} of TLF {}", block, tlf)
            }
            Key::CachedBlock { tlf, block } => {
                write!(f, "Cached Block {} of TLF {}", block, tlf)
            }
        }
    }
}

/// Failure to read or durably write a journal. Fatal to the operation that hit it.
#[derive(Debug)]
pub enum JournalIOError {
    /// See [`KVGetError`].
    KVGetError(KVGetError),

    /// See [`KVSetError`].
    KVSetError(KVSetError),

    /// The key-value store failed to write a batch.
    WriteError(std::io::Error),
}

impl From<KVGetError> for JournalIOError {
    fn from(value: KVGetError) -> Self {
        JournalIOError::KVGetError(value)
    }
}

impl From<KVSetError> for JournalIOError {
    fn from(value: KVSetError) -> Self {
        JournalIOError::KVSetError(value)
    }
}

impl From<std::io::Error> for JournalIOError {
    fn from(value: std::io::Error) -> Self {
        JournalIOError::WriteError(value)
    }
}

impl Display for JournalIOError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalIOError::KVGetError(KVGetError::DeserializeValueError { key, source }) => {
                write!(f, "Cannot deserialize {}: {}", key, source)
            }
            JournalIOError::KVGetError(KVGetError::ValueExpectedButNotFound { key }) => {
                write!(f, "{} expected but not found", key)
            }
            JournalIOError::KVSetError(KVSetError::SerializeValueError { key, source }) => {
                write!(f, "Cannot serialize {}: {}", key, source)
            }
            JournalIOError::WriteError(err) => write!(f, "Write failed: {}", err),
        }
    }
}
