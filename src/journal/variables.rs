/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Byte-prefixes that specify where each journal variable is stored in the user-provided key-value
//! store.
//!
//! # List of State Variables
//!
//! ## Global
//!
//! |Variable|Type|Description|
//! |---|---|---|
//! |Journal Domains|[`Vec<TlfId>`](crate::types::data_types::TlfId)|Every TLF that has a journal in this store, in the order the journals were created. Read by [`enable_existing_journals`](crate::journal_server::JournalServer::enable_existing_journals).|
//!
//! ## Per TLF
//!
//! |Variable|Type|Description|
//! |---|---|---|
//! |Earliest Ordinal|[`JournalOrdinal`](crate::types::data_types::JournalOrdinal)|Ordinal of the oldest entry that has not been flushed yet.|
//! |Next Ordinal|[`JournalOrdinal`](crate::types::data_types::JournalOrdinal)|Ordinal that the next appended entry will get. The journal is empty iff this equals Earliest Ordinal.|
//! |Journal Entries|[`JournalOrdinal`](crate::types::data_types::JournalOrdinal) -> [`JournalEntry`](super::entry::JournalEntry)|Every unflushed entry.|
//! |Pending Refs|[`BlockId`](crate::types::data_types::BlockId) -> [`PendingRefs`](super::entry::PendingRefs)|The references of every block touched by at least one unflushed entry, as they will be once the journal is flushed.|
//! |Cached Blocks|[`BlockId`](crate::types::data_types::BlockId) -> [`CachedBlock`](super::entry::CachedBlock)|Payload and key half of every block with at least one unflushed put.|
//!
//! Pending Refs and Cached Blocks are deleted when the last entry that needs them is flushed, so an
//! empty journal stores no per-block variables at all.
//!
//! # Persistence of state variables
//!
//! Every variable is stored as a **Borsh-serialized value**. Global variables are stored at one-byte,
//! constant keys. Per-TLF variables are stored at keys formed by concatenating:
//! 1. The [`TLF_JOURNALS`] constant.
//! 2. The 16 bytes of the TLF id.
//! 3. The variable's constant.
//! 4. For mappings, the key of the mapping: the big-endian bytes of an ordinal, or the bytes of a
//!    block id.
//!
//! So every TLF's journal lives under its own key prefix, and journals of different TLFs never
//! share keys.

use crate::types::data_types::TlfId;

// Global variables
pub const JOURNAL_DOMAINS: [u8; 1] = [0];
pub const TLF_JOURNALS: [u8; 1] = [1];

// Per-TLF variables
pub const EARLIEST_ORDINAL: [u8; 1] = [0];
pub const NEXT_ORDINAL: [u8; 1] = [1];
pub const JOURNAL_ENTRIES: [u8; 1] = [2];
pub const PENDING_REFS: [u8; 1] = [3];
pub const CACHED_BLOCKS: [u8; 1] = [4];

/// Concatenate two byteslices into one vector.
pub fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}

/// Form the key of `variable` in the journal of `tlf`.
pub fn tlf_key(tlf: &TlfId, variable: &[u8]) -> Vec<u8> {
    concat(&concat(&TLF_JOURNALS, &tlf.bytes()), variable)
}
