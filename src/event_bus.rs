/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives [events](crate::events) from the foreground and the flush workers, and
//! invokes the handlers registered for them.

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// How long the event bus blocks waiting for an event before checking for a shutdown signal.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct EventHandlers {
    pub(crate) enable_journal_handlers: Vec<HandlerPtr<EnableJournalEvent>>,
    pub(crate) disable_journal_handlers: Vec<HandlerPtr<DisableJournalEvent>>,
    pub(crate) append_entry_handlers: Vec<HandlerPtr<AppendEntryEvent>>,
    pub(crate) flush_entry_handlers: Vec<HandlerPtr<FlushEntryEvent>>,
    pub(crate) flush_retry_handlers: Vec<HandlerPtr<FlushRetryEvent>>,
    pub(crate) flush_halted_handlers: Vec<HandlerPtr<FlushHaltedEvent>>,
    pub(crate) pause_worker_handlers: Vec<HandlerPtr<PauseWorkerEvent>>,
    pub(crate) resume_worker_handlers: Vec<HandlerPtr<ResumeWorkerEvent>>,
}

impl EventHandlers {
    /// Collect the user-provided handlers, adding the default logging handler of every event type if
    /// `log_events` is set.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        enable_journal_handler: Option<HandlerPtr<EnableJournalEvent>>,
        disable_journal_handler: Option<HandlerPtr<DisableJournalEvent>>,
        append_entry_handler: Option<HandlerPtr<AppendEntryEvent>>,
        flush_entry_handler: Option<HandlerPtr<FlushEntryEvent>>,
        flush_retry_handler: Option<HandlerPtr<FlushRetryEvent>>,
        flush_halted_handler: Option<HandlerPtr<FlushHaltedEvent>>,
        pause_worker_handler: Option<HandlerPtr<PauseWorkerEvent>>,
        resume_worker_handler: Option<HandlerPtr<ResumeWorkerEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            enable_journal_handlers: handlers(log_events, enable_journal_handler),
            disable_journal_handlers: handlers(log_events, disable_journal_handler),
            append_entry_handlers: handlers(log_events, append_entry_handler),
            flush_entry_handlers: handlers(log_events, flush_entry_handler),
            flush_retry_handlers: handlers(log_events, flush_retry_handler),
            flush_halted_handlers: handlers(log_events, flush_halted_handler),
            pause_worker_handlers: handlers(log_events, pause_worker_handler),
            resume_worker_handlers: handlers(log_events, resume_worker_handler),
        }
    }

    /// Whether no handler at all is registered, in which case the event bus need not be started.
    pub(crate) fn is_empty(&self) -> bool {
        self.enable_journal_handlers.is_empty()
            && self.disable_journal_handlers.is_empty()
            && self.append_entry_handlers.is_empty()
            && self.flush_entry_handlers.is_empty()
            && self.flush_retry_handlers.is_empty()
            && self.flush_halted_handlers.is_empty()
            && self.pause_worker_handlers.is_empty()
            && self.resume_worker_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::EnableJournal(enable_journal_event) => self
                .enable_journal_handlers
                .iter()
                .for_each(|handler| handler(&enable_journal_event)),

            Event::DisableJournal(disable_journal_event) => self
                .disable_journal_handlers
                .iter()
                .for_each(|handler| handler(&disable_journal_event)),

            Event::AppendEntry(append_entry_event) => self
                .append_entry_handlers
                .iter()
                .for_each(|handler| handler(&append_entry_event)),

            Event::FlushEntry(flush_entry_event) => self
                .flush_entry_handlers
                .iter()
                .for_each(|handler| handler(&flush_entry_event)),

            Event::FlushRetry(flush_retry_event) => self
                .flush_retry_handlers
                .iter()
                .for_each(|handler| handler(&flush_retry_event)),

            Event::FlushHalted(flush_halted_event) => self
                .flush_halted_handlers
                .iter()
                .for_each(|handler| handler(&flush_halted_event)),

            Event::PauseWorker(pause_worker_event) => self
                .pause_worker_handlers
                .iter()
                .for_each(|handler| handler(&pause_worker_event)),

            Event::ResumeWorker(resume_worker_event) => self
                .resume_worker_handlers
                .iter()
                .for_each(|handler| handler(&resume_worker_event)),
        }
    }
}

fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(user_handler) = user_handler {
        handlers.push(user_handler);
    }
    handlers
}

/// Start the event bus thread. The thread runs until it receives a shutdown signal, after which it
/// fires the handlers of the events still queued and returns.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                while let Ok(event) = event_subscriber.try_recv() {
                    event_handlers.fire_handlers(event)
                }
                return;
            }
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(EVENT_POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
