/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A TLF's [`BlockJournal`], shared between the foreground block-server calls and the TLF's flush
//! worker.
//!
//! All access to the journal goes through a per-TLF mutex. Foreground calls hold it for the duration
//! of one local operation. The flush worker holds it only to take the next entry and to remove that
//! entry after the delegate call, never during the delegate call itself. Every change the worker makes
//! is signalled on a condition variable, which [`wait_for_complete_flush`](TlfJournal::wait_for_complete_flush)
//! waits on.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::block_server::{BlockServer, BlockServerError};
use crate::events::Event;
use crate::journal::block_journal::{BlockJournal, FlushItem};
use crate::journal::pluggables::KVStore;
use crate::types::data_types::{JournalOrdinal, TlfId};

use super::flush_worker::{FlushWorker, FlushWorkerConfiguration, WorkerCommand, WorkerState};
use super::JournalServerError;

pub(crate) struct TlfJournal<K: KVStore> {
    tlf: TlfId,
    state: Mutex<JournalState<K>>,
    changed: Condvar,
    worker: Mutex<Option<WorkerHandle>>,
}

pub(crate) struct JournalState<K: KVStore> {
    pub(crate) journal: BlockJournal<K>,

    /// Whether new local operations are accepted. A disabled journal still in the registry has unflushed
    /// entries.
    pub(crate) enabled: bool,
    pub(crate) worker_state: WorkerState,

    /// The error that halted the flush worker, if any.
    pub(crate) flush_error: Option<String>,
}

struct WorkerHandle {
    commands: Sender<WorkerCommand>,
    thread: JoinHandle<()>,
}

/// A snapshot of a TLF's journal, returned by [`JournalServer::status`](super::JournalServer::status).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalStatus {
    pub tlf: TlfId,
    pub enabled: bool,
    pub worker_state: WorkerState,

    /// Ordinal of the oldest unflushed entry. Equal to `next_ordinal` if every entry is flushed.
    pub earliest_ordinal: JournalOrdinal,
    pub next_ordinal: JournalOrdinal,
    pub unflushed_entries: u64,
    pub unflushed_bytes: u64,
    pub flush_error: Option<String>,

    /// Whether a journal I/O error made the journal unusable.
    pub unusable: bool,
}

impl<K: KVStore> TlfJournal<K> {
    pub(crate) fn new(journal: BlockJournal<K>) -> Self {
        Self {
            tlf: journal.tlf(),
            state: Mutex::new(JournalState {
                journal,
                enabled: true,
                worker_state: WorkerState::Stopped,
                flush_error: None,
            }),
            changed: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn tlf(&self) -> TlfId {
        self.tlf
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, JournalState<K>>, BlockServerError> {
        self.state
            .lock()
            .map_err(|_| BlockServerError::JournalUnusable { tlf: self.tlf })
    }

    /* ↓↓↓ Worker control ↓↓↓ */

    /// Start a flush worker in `initial_state`. The previous worker, if any, must have been stopped.
    pub(crate) fn start_worker<D: BlockServer>(
        self: &Arc<Self>,
        delegate: Arc<D>,
        config: FlushWorkerConfiguration,
        initial_state: WorkerState,
        event_publisher: Option<Sender<Event>>,
    ) {
        self.set_worker_state(initial_state);
        let (commands, command_receiver) = mpsc::channel();
        let thread = FlushWorker::new(
            Arc::clone(self),
            delegate,
            config,
            initial_state,
            command_receiver,
            event_publisher,
        )
        .start();
        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(WorkerHandle { commands, thread });
        }
    }

    /// Send `command` to the flush worker, if one is running.
    pub(crate) fn send(&self, command: WorkerCommand) {
        if let Ok(worker) = self.worker.lock() {
            if let Some(worker) = worker.as_ref() {
                let _ = worker.commands.send(command);
            }
        }
    }

    /// Stop the flush worker and wait for its thread to return. An in-flight delegate call completes
    /// first.
    pub(crate) fn stop_worker(&self) {
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.commands.send(WorkerCommand::Stop);
            if handle.thread.join().is_err() {
                log::warn!("Flush worker of TLF {} panicked", self.tlf);
            }
        }
        self.set_worker_state(WorkerState::Stopped);
    }

    pub(crate) fn set_worker_state(&self, worker_state: WorkerState) {
        if let Ok(mut state) = self.state.lock() {
            state.worker_state = worker_state;
        }
        self.changed.notify_all();
    }

    /// Record that flushing stopped on `error`.
    pub(crate) fn halt(&self, error: String) {
        if let Ok(mut state) = self.state.lock() {
            state.worker_state = WorkerState::Paused;
            state.flush_error = Some(error);
        }
        self.changed.notify_all();
    }

    /* ↓↓↓ Flushing ↓↓↓ */

    pub(crate) fn next_flush(&self) -> Result<Option<FlushItem>, BlockServerError> {
        self.lock()?.journal.next_flush()
    }

    pub(crate) fn complete_flush(&self, ordinal: JournalOrdinal) -> Result<(), BlockServerError> {
        let result = self.lock()?.journal.complete_flush(ordinal);
        self.changed.notify_all();
        result
    }

    /// Block until every entry is flushed. Fails instead if flushing cannot make progress.
    pub(crate) fn wait_for_complete_flush(&self) -> Result<(), JournalServerError> {
        let tlf = self.tlf;
        let mut state = self
            .state
            .lock()
            .map_err(|_| JournalServerError::JournalUnusable { tlf })?;
        loop {
            if state.journal.is_empty() {
                return Ok(());
            }
            if state.journal.is_unusable() {
                return Err(JournalServerError::JournalUnusable { tlf });
            }
            if let Some(reason) = &state.flush_error {
                return Err(JournalServerError::FlushHalted {
                    tlf,
                    reason: reason.clone(),
                });
            }
            if !state.enabled {
                return Err(JournalServerError::NotEnabled { tlf });
            }
            if state.worker_state != WorkerState::Running {
                return Err(JournalServerError::WorkerPaused { tlf });
            }
            state = self
                .changed
                .wait(state)
                .map_err(|_| JournalServerError::JournalUnusable { tlf })?;
        }
    }

    pub(crate) fn status(&self) -> Result<JournalStatus, BlockServerError> {
        let state = self.lock()?;
        let log = state.journal.log();
        Ok(JournalStatus {
            tlf: self.tlf,
            enabled: state.enabled,
            worker_state: state.worker_state,
            earliest_ordinal: log.earliest(),
            next_ordinal: log.next(),
            unflushed_entries: log.len(),
            unflushed_bytes: state.journal.unflushed_bytes(),
            flush_error: state.flush_error.clone(),
            unusable: state.journal.is_unusable(),
        })
    }
}
