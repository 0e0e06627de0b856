/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of events emitted by a journal server, for event handling and logging.
//!
//! Note: an event for a given action indicates that the action has been completed.
//!
//! Events are the observability path of the journal server: errors hit while flushing are never
//! returned to the foreground call that created the flushed entry (that call already succeeded), so
//! they are reported as [`FlushRetry`](Event::FlushRetry) and [`FlushHalted`](Event::FlushHalted)
//! events instead, as well as through [`JournalStatus`](crate::journal_server::JournalStatus).

use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use crate::journal_server::flush_worker::WorkerState;
use crate::types::data_types::{JournalOrdinal, TlfId};

pub enum Event {
    // Journal lifecycle events.
    EnableJournal(EnableJournalEvent),
    DisableJournal(DisableJournalEvent),
    // Foreground events.
    AppendEntry(AppendEntryEvent),
    // Flush worker events.
    FlushEntry(FlushEntryEvent),
    FlushRetry(FlushRetryEvent),
    FlushHalted(FlushHaltedEvent),
    PauseWorker(PauseWorkerEvent),
    ResumeWorker(ResumeWorkerEvent),
}

impl Event {
    /// Send this event to the event bus, if there is one. Events are dropped if the event bus has
    /// already stopped.
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A TLF's journal was enabled, either freshly created or reopened with `unflushed_entries` left over.
pub struct EnableJournalEvent {
    pub timestamp: SystemTime,
    pub tlf: TlfId,
    pub unflushed_entries: u64,
    pub worker_state: WorkerState,
}

/// A TLF's journal was disabled. Its flush worker has stopped.
pub struct DisableJournalEvent {
    pub timestamp: SystemTime,
    pub tlf: TlfId,
    pub unflushed_entries: u64,
}

/// An operation was durably appended to a TLF's journal.
pub struct AppendEntryEvent {
    pub timestamp: SystemTime,
    pub tlf: TlfId,
    pub ordinal: JournalOrdinal,
    pub kind: &'static str,
}

/// An entry was applied to the delegate block server and removed from the journal.
pub struct FlushEntryEvent {
    pub timestamp: SystemTime,
    pub tlf: TlfId,
    pub ordinal: JournalOrdinal,
    pub kind: &'static str,
}

/// Applying an entry failed transiently. The worker will retry after `backoff`.
pub struct FlushRetryEvent {
    pub timestamp: SystemTime,
    pub tlf: TlfId,
    pub ordinal: JournalOrdinal,
    pub attempt: u32,
    pub backoff: Duration,
    pub error: String,
}

/// Flushing stopped because the delegate rejected an entry, or the journal became unusable. The
/// worker stays paused until it is resumed.
pub struct FlushHaltedEvent {
    pub timestamp: SystemTime,
    pub tlf: TlfId,
    pub ordinal: Option<JournalOrdinal>,
    pub error: String,
}

pub struct PauseWorkerEvent {
    pub timestamp: SystemTime,
    pub tlf: TlfId,
}

pub struct ResumeWorkerEvent {
    pub timestamp: SystemTime,
    pub tlf: TlfId,
}
