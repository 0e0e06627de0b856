/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The background thread that drains a TLF's journal into the delegate block server.
//!
//! ## State machine
//!
//! A flush worker is always in one of the [`WorkerState`]s:
//! - `Paused`: blocks waiting for a [`WorkerCommand`]. Nothing is flushed.
//! - `Running`: repeatedly takes the oldest unflushed entry, applies it to the delegate, and removes it
//!   from the journal. When the journal is empty, blocks waiting for a command; foreground calls send
//!   [`WorkerCommand::Wake`] after every append.
//! - `Stopped`: the thread has returned.
//!
//! Commands are only received between entries, so a `Pause` or `Stop` never interrupts an in-flight
//! delegate call: that call is allowed to complete (or fail), and its outcome is recorded before the
//! command takes effect.
//!
//! ## Failures
//!
//! [Transient](BlockServerError::is_transient) delegate errors are retried, with exponential backoff plus
//! random jitter, without removing the entry. The backoff wait itself can be cut short by a command.
//! Any other error halts the worker: it moves to `Paused` with the error recorded as the journal's
//! flush error, until it is resumed.

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{mpsc::Sender, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;

use crate::block_server::{BlockServer, BlockServerError};
use crate::events::*;
use crate::journal::block_journal::FlushItem;
use crate::journal::entry::BlockOp;
use crate::journal::pluggables::KVStore;
use crate::types::data_types::{JournalOrdinal, TlfId};

use super::tlf_journal::TlfJournal;

/// Observable state of a TLF's flush worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Paused,
    Running,
    Stopped,
}

/// Messages sent to a flush worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WorkerCommand {
    Pause,
    Resume,
    /// New entries were appended.
    Wake,
    Stop,
}

/// Parameters of the retry schedule for transient delegate errors.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FlushWorkerConfiguration {
    pub(crate) initial_backoff: Duration,
    pub(crate) max_backoff: Duration,
    pub(crate) jitter: Duration,
}

pub(crate) struct FlushWorker<K: KVStore, D: BlockServer> {
    tlf: TlfId,
    journal: Arc<TlfJournal<K>>,
    delegate: Arc<D>,
    config: FlushWorkerConfiguration,
    state: WorkerState,
    commands: Receiver<WorkerCommand>,
    event_publisher: Option<Sender<Event>>,
}

/// The outcome of one attempt to flush the oldest entry.
enum FlushOutcome {
    Flushed,
    Empty,
    Retry {
        ordinal: JournalOrdinal,
        error: BlockServerError,
    },
    Halt {
        ordinal: Option<JournalOrdinal>,
        error: String,
    },
}

impl<K: KVStore, D: BlockServer> FlushWorker<K, D> {
    pub(crate) fn new(
        journal: Arc<TlfJournal<K>>,
        delegate: Arc<D>,
        config: FlushWorkerConfiguration,
        initial_state: WorkerState,
        commands: Receiver<WorkerCommand>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            tlf: journal.tlf(),
            journal,
            delegate,
            config,
            state: initial_state,
            commands,
            event_publisher,
        }
    }

    pub(crate) fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || {
            self.run();
            self.journal.set_worker_state(WorkerState::Stopped);
            log::debug!("Flush worker of TLF {} stopped", self.tlf);
        })
    }

    fn run(&mut self) {
        let mut attempt: u32 = 0;
        loop {
            match self.state {
                WorkerState::Stopped => return,

                WorkerState::Paused => match self.commands.recv() {
                    Ok(command) => self.on_command(command),
                    Err(_) => return,
                },

                WorkerState::Running => {
                    match self.commands.try_recv() {
                        Ok(command) => {
                            self.on_command(command);
                            continue;
                        }
                        Err(TryRecvError::Empty) => (),
                        Err(TryRecvError::Disconnected) => return,
                    }

                    match self.flush_one() {
                        FlushOutcome::Flushed => attempt = 0,

                        FlushOutcome::Empty => match self.commands.recv() {
                            Ok(command) => self.on_command(command),
                            Err(_) => return,
                        },

                        FlushOutcome::Retry { ordinal, error } => {
                            attempt += 1;
                            let backoff = self.backoff(attempt);
                            Event::FlushRetry(FlushRetryEvent {
                                timestamp: SystemTime::now(),
                                tlf: self.tlf,
                                ordinal,
                                attempt,
                                backoff,
                                error: error.to_string(),
                            })
                            .publish(&self.event_publisher);

                            if !self.wait_backoff(backoff) {
                                return;
                            }
                        }

                        FlushOutcome::Halt { ordinal, error } => {
                            attempt = 0;
                            self.state = WorkerState::Paused;
                            self.journal.halt(error.clone());
                            Event::FlushHalted(FlushHaltedEvent {
                                timestamp: SystemTime::now(),
                                tlf: self.tlf,
                                ordinal,
                                error,
                            })
                            .publish(&self.event_publisher);
                        }
                    }
                }
            }
        }
    }

    fn on_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Pause if self.state == WorkerState::Running => {
                self.state = WorkerState::Paused;
                self.journal.set_worker_state(WorkerState::Paused);
                Event::PauseWorker(PauseWorkerEvent {
                    timestamp: SystemTime::now(),
                    tlf: self.tlf,
                })
                .publish(&self.event_publisher);
            }
            WorkerCommand::Resume if self.state == WorkerState::Paused => {
                self.state = WorkerState::Running;
                self.journal.set_worker_state(WorkerState::Running);
                Event::ResumeWorker(ResumeWorkerEvent {
                    timestamp: SystemTime::now(),
                    tlf: self.tlf,
                })
                .publish(&self.event_publisher);
            }
            WorkerCommand::Stop => self.state = WorkerState::Stopped,
            _ => (),
        }
    }

    /// Apply the oldest unflushed entry to the delegate, and remove it from the journal on success. The
    /// journal's lock is not held during the delegate call.
    fn flush_one(&mut self) -> FlushOutcome {
        let item = match self.journal.next_flush() {
            Ok(Some(item)) => item,
            Ok(None) => return FlushOutcome::Empty,
            Err(err) => {
                return FlushOutcome::Halt {
                    ordinal: None,
                    error: err.to_string(),
                }
            }
        };
        let ordinal = item.entry.ordinal;
        let kind = item.entry.op.kind();

        match apply(self.delegate.as_ref(), self.tlf, &item) {
            Ok(()) => (),
            Err(error) if error.is_transient() => return FlushOutcome::Retry { ordinal, error },
            Err(error) => {
                return FlushOutcome::Halt {
                    ordinal: Some(ordinal),
                    error: error.to_string(),
                }
            }
        }

        if let Err(err) = self.journal.complete_flush(ordinal) {
            return FlushOutcome::Halt {
                ordinal: Some(ordinal),
                error: err.to_string(),
            };
        }
        Event::FlushEntry(FlushEntryEvent {
            timestamp: SystemTime::now(),
            tlf: self.tlf,
            ordinal,
            kind,
        })
        .publish(&self.event_publisher);
        FlushOutcome::Flushed
    }

    /// Wait for `backoff` before retrying, returning early if a command other than `Wake` arrives.
    /// Returns false if the command channel was disconnected.
    fn wait_backoff(&mut self, backoff: Duration) -> bool {
        let deadline = Instant::now() + backoff;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            match self.commands.recv_timeout(deadline - now) {
                Ok(WorkerCommand::Wake) => (),
                Ok(command) => {
                    self.on_command(command);
                    return true;
                }
                Err(RecvTimeoutError::Timeout) => return true,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    /// Backoff before retry number `attempt` (starting at 1): the initial backoff, doubled on every
    /// further attempt up to the maximum, plus up to `jitter` of random delay.
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self
            .config
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_backoff);
        let jitter_millis = self.config.jitter.as_millis() as u64;
        if jitter_millis == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::thread_rng().gen_range(0, jitter_millis + 1))
    }
}

/// Apply a journaled operation to `delegate`.
fn apply<D: BlockServer + ?Sized>(
    delegate: &D,
    tlf: TlfId,
    item: &FlushItem,
) -> Result<(), BlockServerError> {
    match &item.entry.op {
        BlockOp::Put { block, context } => {
            let (data, server_half) =
                item.payload
                    .as_ref()
                    .ok_or_else(|| BlockServerError::UnknownBlock { block: *block })?;
            delegate.put(tlf, block, context, data, *server_half)
        }
        BlockOp::AddReference { block, context } => {
            delegate.add_block_reference(tlf, block, context)
        }
        BlockOp::RemoveReferences { contexts } => {
            delegate.remove_block_references(tlf, contexts).map(|_| ())
        }
        BlockOp::ArchiveReferences { contexts } => {
            delegate.archive_block_references(tlf, contexts)
        }
    }
}
