/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The ordered, append-only log of a TLF's unflushed operations.
//!
//! `JournalLog` keeps the two ordinals that delimit the log in memory, and reads entries from the
//! key-value store on demand. Its mutating methods do not write anything themselves: they add their
//! changes to a [`JournalWriteBatch`] provided by the caller, so that an append can be committed in the
//! same atomic batch as the reference-count change it records. Once the batch has been durably written,
//! the caller confirms the change with [`appended`](JournalLog::appended) or
//! [`removed_up_to`](JournalLog::removed_up_to).

use crate::types::data_types::{JournalOrdinal, TlfId};

use super::{
    entry::{BlockOp, JournalEntry},
    pluggables::{JournalIOError, KVGet, KVGetError, Key, WriteBatch},
    write_batch::{JournalWriteBatch, KVSetError},
};

#[derive(Clone, Debug)]
pub struct JournalLog {
    tlf: TlfId,
    earliest: JournalOrdinal,
    next: JournalOrdinal,
}

impl JournalLog {
    /// Open the log of `tlf` stored in `kv`. A TLF that has never had a journal gets an empty log
    /// starting at [`JournalOrdinal::FIRST`].
    pub fn open<G: KVGet>(kv: &G, tlf: TlfId) -> Result<JournalLog, KVGetError> {
        let earliest = kv.earliest_ordinal(&tlf)?.unwrap_or(JournalOrdinal::FIRST);
        let next = kv.next_ordinal(&tlf)?.unwrap_or(earliest);
        Ok(JournalLog {
            tlf,
            earliest,
            next,
        })
    }

    /// Ordinal of the oldest unflushed entry. Equal to [`next`](Self::next) if the log is empty.
    pub fn earliest(&self) -> JournalOrdinal {
        self.earliest
    }

    /// Ordinal the next appended entry will get.
    pub fn next(&self) -> JournalOrdinal {
        self.next
    }

    pub fn len(&self) -> u64 {
        self.next - self.earliest
    }

    pub fn is_empty(&self) -> bool {
        self.earliest == self.next
    }

    /// Add an entry recording `op` to `wb`, and return it. The log is not extended until
    /// [`appended`](Self::appended) is called.
    pub fn append<W: WriteBatch>(
        &self,
        wb: &mut JournalWriteBatch<W>,
        op: BlockOp,
    ) -> Result<JournalEntry, KVSetError> {
        let entry = JournalEntry {
            ordinal: self.next,
            op,
        };
        wb.set_journal_entry(&self.tlf, &entry)?;
        wb.set_next_ordinal(&self.tlf, self.next + 1)?;
        Ok(entry)
    }

    /// Confirm that the batch containing the append of the entry at `ordinal` has been written.
    pub fn appended(&mut self, ordinal: JournalOrdinal) {
        self.next = ordinal + 1;
    }

    /// Read the oldest unflushed entry, if any.
    pub fn earliest_entry<G: KVGet>(&self, kv: &G) -> Result<Option<JournalEntry>, KVGetError> {
        if self.is_empty() {
            return Ok(None);
        }
        self.entry(kv, self.earliest).map(Some)
    }

    /// Iterate, in order, through the unflushed entries with ordinals greater than or equal to
    /// `from`. Iteration can be restarted from any ordinal, e.g., after a crash.
    pub fn entries_from<'a, G: KVGet>(
        &'a self,
        kv: &'a G,
        from: JournalOrdinal,
    ) -> impl Iterator<Item = Result<JournalEntry, JournalIOError>> + 'a {
        let start = from.max(self.earliest).int();
        (start..self.next.int())
            .map(move |ordinal| Ok(self.entry(kv, JournalOrdinal::new(ordinal))?))
    }

    /// Add the deletion of every entry up to and including `ordinal` to `wb`. The log is not shortened
    /// until [`removed_up_to`](Self::removed_up_to) is called.
    pub fn remove_up_to<W: WriteBatch>(
        &self,
        wb: &mut JournalWriteBatch<W>,
        ordinal: JournalOrdinal,
    ) -> Result<(), KVSetError> {
        let end = self.removal_end(ordinal);
        for removed in self.earliest.int()..end.int() {
            wb.delete_journal_entry(&self.tlf, JournalOrdinal::new(removed));
        }
        wb.set_earliest_ordinal(&self.tlf, end)
    }

    /// Confirm that the batch containing the removal of every entry up to and including `ordinal` has
    /// been written.
    pub fn removed_up_to(&mut self, ordinal: JournalOrdinal) {
        self.earliest = self.removal_end(ordinal);
    }

    fn removal_end(&self, ordinal: JournalOrdinal) -> JournalOrdinal {
        (ordinal + 1).min(self.next).max(self.earliest)
    }

    fn entry<G: KVGet>(&self, kv: &G, ordinal: JournalOrdinal) -> Result<JournalEntry, KVGetError> {
        kv.journal_entry(&self.tlf, ordinal)?
            .ok_or(KVGetError::ValueExpectedButNotFound {
                key: Key::JournalEntry {
                    tlf: self.tlf,
                    ordinal,
                },
            })
    }
}
