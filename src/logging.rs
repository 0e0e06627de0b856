/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the journal server's
//! [configuration](crate::journal_server::Configuration).
//!
//! The journal server logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least three values. The first three values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//! 3. The first seven characters of the Base64 encoding of the TLF id.
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [FlushEntry](crate::events::FlushEntryEvent) is printed:
//!
//! ```text
//! FlushEntry, 1701329264, AAAAAAA, 12, AddReference
//! ```
//!
//! In the snippet, the fourth value is the ordinal of the flushed entry, and the fifth its kind.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const ENABLE_JOURNAL: &str = "EnableJournal";
pub const DISABLE_JOURNAL: &str = "DisableJournal";
pub const APPEND_ENTRY: &str = "AppendEntry";
pub const FLUSH_ENTRY: &str = "FlushEntry";
pub const FLUSH_RETRY: &str = "FlushRetry";
pub const FLUSH_HALTED: &str = "FlushHalted";
pub const PAUSE_WORKER: &str = "PauseWorker";
pub const RESUME_WORKER: &str = "ResumeWorker";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for EnableJournalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |enable_journal_event: &EnableJournalEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}",
                ENABLE_JOURNAL,
                secs_since_unix_epoch(enable_journal_event.timestamp),
                first_seven_base64_chars(&enable_journal_event.tlf.bytes()),
                enable_journal_event.unflushed_entries,
                enable_journal_event.worker_state
            )
        };
        Box::new(logger)
    }
}

impl Logger for DisableJournalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |disable_journal_event: &DisableJournalEvent| {
            log::info!(
                "{}, {}, {}, {}",
                DISABLE_JOURNAL,
                secs_since_unix_epoch(disable_journal_event.timestamp),
                first_seven_base64_chars(&disable_journal_event.tlf.bytes()),
                disable_journal_event.unflushed_entries
            )
        };
        Box::new(logger)
    }
}

impl Logger for AppendEntryEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |append_entry_event: &AppendEntryEvent| {
            log::debug!(
                "{}, {}, {}, {}, {}",
                APPEND_ENTRY,
                secs_since_unix_epoch(append_entry_event.timestamp),
                first_seven_base64_chars(&append_entry_event.tlf.bytes()),
                append_entry_event.ordinal,
                append_entry_event.kind
            )
        };
        Box::new(logger)
    }
}

impl Logger for FlushEntryEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |flush_entry_event: &FlushEntryEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                FLUSH_ENTRY,
                secs_since_unix_epoch(flush_entry_event.timestamp),
                first_seven_base64_chars(&flush_entry_event.tlf.bytes()),
                flush_entry_event.ordinal,
                flush_entry_event.kind
            )
        };
        Box::new(logger)
    }
}

impl Logger for FlushRetryEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |flush_retry_event: &FlushRetryEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}, {}, {}",
                FLUSH_RETRY,
                secs_since_unix_epoch(flush_retry_event.timestamp),
                first_seven_base64_chars(&flush_retry_event.tlf.bytes()),
                flush_retry_event.ordinal,
                flush_retry_event.attempt,
                flush_retry_event.backoff.as_millis(),
                flush_retry_event.error
            )
        };
        Box::new(logger)
    }
}

impl Logger for FlushHaltedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |flush_halted_event: &FlushHaltedEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}",
                FLUSH_HALTED,
                secs_since_unix_epoch(flush_halted_event.timestamp),
                first_seven_base64_chars(&flush_halted_event.tlf.bytes()),
                flush_halted_event
                    .ordinal
                    .map_or(String::from("-"), |ordinal| ordinal.to_string()),
                flush_halted_event.error
            )
        };
        Box::new(logger)
    }
}

impl Logger for PauseWorkerEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |pause_worker_event: &PauseWorkerEvent| {
            log::info!(
                "{}, {}, {}",
                PAUSE_WORKER,
                secs_since_unix_epoch(pause_worker_event.timestamp),
                first_seven_base64_chars(&pause_worker_event.tlf.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ResumeWorkerEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |resume_worker_event: &ResumeWorkerEvent| {
            log::info!(
                "{}, {}, {}",
                RESUME_WORKER,
                secs_since_unix_epoch(resume_worker_event.timestamp),
                first_seven_base64_chars(&resume_worker_event.tlf.bytes())
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
