/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The registry of per-TLF journals, and the control surface for turning journaling on and off.
//!
//! ## Starting a journal server
//!
//! A journal server is started from a [`JournalServerSpec`], which is built with the
//! [typed builder pattern](https://docs.rs/typed-builder/latest/typed_builder/):
//!
//! ```ignore
//! let journal_server = JournalServerSpec::builder()
//!     .kv_store(kv_store)
//!     .delegate(remote_block_server)
//!     .crypto(Arc::new(CryptoCommon::new()))
//!     .configuration(
//!         Configuration::builder()
//!             .log_events(true)
//!             .build()
//!     )
//!     .on_flush_halted(|event: &FlushHaltedEvent| alert(event.tlf, &event.error))
//!     .build()
//!     .start();
//!
//! journal_server.enable_existing_journals(InitialWorkerState::Paused)?;
//! let block_server = journal_server.block_server();
//! ```
//!
//! ## Lifecycle of a TLF's journal
//!
//! 1. [`enable`](JournalServer::enable) creates the journal of a TLF, or reopens the one left in the
//!    key-value store by a previous run, and starts its [flush worker](flush_worker), either paused or
//!    running. From then on, calls on the TLF made through [`block_server`](JournalServer::block_server)
//!    are journaled.
//! 2. [`pause_background_work`](JournalServer::pause_background_work) and
//!    [`resume_background_work`](JournalServer::resume_background_work) control the flush worker.
//! 3. [`disable`](JournalServer::disable) stops the flush worker. If the journal is empty, the TLF is
//!    forgotten and later calls on it go to the delegate. Otherwise the journal stays registered,
//!    rejecting calls with [`JournalDisabled`](BlockServerError::JournalDisabled), until it is enabled
//!    again, which resumes flushing from the oldest unflushed entry.
//!
//! Flush errors never reach the foreground calls whose entries fail to flush. They are reported
//! through [`status`](JournalServer::status), [`wait_for_complete_flush`](JournalServer::wait_for_complete_flush),
//! and the [events](crate::events).

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use typed_builder::TypedBuilder;

use crate::block_server::{BlockServer, BlockServerError};
use crate::event_bus::{start_event_bus, EventHandlers, HandlerPtr};
use crate::events::*;
use crate::journal::block_journal::BlockJournal;
use crate::journal::pluggables::{JournalIOError, KVGet, KVStore};
use crate::journal::unregister_domain;
use crate::types::{crypto_primitives::Crypto, data_types::TlfId};

use self::flush_worker::{FlushWorkerConfiguration, WorkerCommand, WorkerState};
use self::tlf_journal::TlfJournal;

pub mod block_server;

pub mod flush_worker;

pub mod tlf_journal;

pub use block_server::JournalBlockServer;
pub use tlf_journal::JournalStatus;

/// The state a TLF's flush worker starts in when its journal is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitialWorkerState {
    Paused,
    StartImmediately,
}

impl From<InitialWorkerState> for WorkerState {
    fn from(initial: InitialWorkerState) -> Self {
        match initial {
            InitialWorkerState::Paused => WorkerState::Paused,
            InitialWorkerState::StartImmediately => WorkerState::Running,
        }
    }
}

/// Tunable parameters of a journal server.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.log_events(...)`

    Optional:
    - `.flush_retry_initial_backoff(...)`
    - `.flush_retry_max_backoff(...)`
    - `.flush_retry_jitter(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Enable logging of events? Required."))]
    pub log_events: bool,
    #[builder(
        default = Duration::from_millis(100),
        setter(doc = "Set the wait before the first retry of a transiently failed flush. Optional, defaults to 100ms.")
    )]
    pub flush_retry_initial_backoff: Duration,
    #[builder(
        default = Duration::from_secs(10),
        setter(doc = "Set the cap on the wait between retries, which doubles after every failed retry. Optional, defaults to 10s.")
    )]
    pub flush_retry_max_backoff: Duration,
    #[builder(
        default = Duration::from_millis(50),
        setter(doc = "Set the maximum random delay added to every retry wait. Optional, defaults to 50ms.")
    )]
    pub flush_retry_jitter: Duration,
}

impl From<&Configuration> for FlushWorkerConfiguration {
    fn from(configuration: &Configuration) -> Self {
        FlushWorkerConfiguration {
            initial_backoff: configuration.flush_retry_initial_backoff,
            max_backoff: configuration.flush_retry_max_backoff,
            jitter: configuration.flush_retry_jitter,
        }
    }
}

/// Stores all parameters and trait implementations required to run a [JournalServer].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [JournalServerSpec]. On the builder call the following methods to construct a valid [JournalServerSpec].

    Required:
    - `.kv_store(...)`
    - `.delegate(...)`
    - `.crypto(...)`
    - `.configuration(...)`

    Optional:
    - `.on_enable_journal(...)`
    - `.on_disable_journal(...)`
    - `.on_append_entry(...)`
    - `.on_flush_entry(...)`
    - `.on_flush_retry(...)`
    - `.on_flush_halted(...)`
    - `.on_pause_worker(...)`
    - `.on_resume_worker(...)`
"))]
pub struct JournalServerSpec<K: KVStore, D: BlockServer> {
    // Required parameters
    #[builder(setter(doc = "Set the key-value store the journals are persisted in. The argument must implement the [KVStore](crate::journal::pluggables::KVStore) trait. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the remote block server that journaled operations are flushed to. The argument must implement the [BlockServer](crate::block_server::BlockServer) trait. Required."))]
    delegate: D,
    #[builder(setter(doc = "Set the cryptographic primitives used to validate puts. Required."))]
    crypto: Arc<dyn Crypto>,
    #[builder(setter(doc = "Set the [configuration](Configuration) of the journal server. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&EnableJournalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EnableJournalEvent>),
    doc = "Register a handler closure to be invoked after a TLF's journal is enabled. Optional."))]
    on_enable_journal: Option<HandlerPtr<EnableJournalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DisableJournalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DisableJournalEvent>),
    doc = "Register a handler closure to be invoked after a TLF's journal is disabled. Optional."))]
    on_disable_journal: Option<HandlerPtr<DisableJournalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&AppendEntryEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AppendEntryEvent>),
    doc = "Register a handler closure to be invoked after an operation is appended to a journal. Optional."))]
    on_append_entry: Option<HandlerPtr<AppendEntryEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FlushEntryEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FlushEntryEvent>),
    doc = "Register a handler closure to be invoked after a journal entry is flushed to the delegate. Optional."))]
    on_flush_entry: Option<HandlerPtr<FlushEntryEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FlushRetryEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FlushRetryEvent>),
    doc = "Register a handler closure to be invoked after flushing an entry fails transiently. Optional."))]
    on_flush_retry: Option<HandlerPtr<FlushRetryEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FlushHaltedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FlushHaltedEvent>),
    doc = "Register a handler closure to be invoked after flushing halts on an error. Optional."))]
    on_flush_halted: Option<HandlerPtr<FlushHaltedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PauseWorkerEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PauseWorkerEvent>),
    doc = "Register a handler closure to be invoked after a flush worker pauses. Optional."))]
    on_pause_worker: Option<HandlerPtr<PauseWorkerEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ResumeWorkerEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ResumeWorkerEvent>),
    doc = "Register a handler closure to be invoked after a flush worker resumes. Optional."))]
    on_resume_worker: Option<HandlerPtr<ResumeWorkerEvent>>,
}

impl<K: KVStore, D: BlockServer> JournalServerSpec<K, D> {
    /// Starts the event bus, and returns a [JournalServer] with no journal enabled yet.
    pub fn start(self) -> JournalServer<K, D> {
        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            self.on_enable_journal,
            self.on_disable_journal,
            self.on_append_entry,
            self.on_flush_entry,
            self.on_flush_retry,
            self.on_flush_halted,
            self.on_pause_worker,
            self.on_resume_worker,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let (event_bus, event_bus_shutdown) = match event_subscriber {
            Some(event_subscriber) => {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                let event_bus = start_event_bus(event_handlers, event_subscriber, shutdown_receiver);
                (Some(event_bus), Some(shutdown))
            }
            None => (None, None),
        };

        JournalServer {
            shared: Arc::new(Shared {
                kv_store: Mutex::new(self.kv_store),
                crypto: self.crypto,
                delegate: Arc::new(self.delegate),
                worker_config: FlushWorkerConfiguration::from(&self.configuration),
                journals: RwLock::new(HashMap::new()),
                event_publisher,
                shut_down: AtomicBool::new(false),
            }),
            event_bus,
            event_bus_shutdown,
        }
    }
}

/// State shared by a [JournalServer] and the [JournalBlockServer]s it hands out.
pub(crate) struct Shared<K: KVStore, D: BlockServer> {
    kv_store: Mutex<K>,
    crypto: Arc<dyn Crypto>,
    pub(crate) delegate: Arc<D>,
    worker_config: FlushWorkerConfiguration,
    journals: RwLock<HashMap<TlfId, Arc<TlfJournal<K>>>>,
    pub(crate) event_publisher: Option<Sender<Event>>,
    shut_down: AtomicBool,
}

impl<K: KVStore, D: BlockServer> Shared<K, D> {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Get the registered journal of `tlf`, enabled or not.
    pub(crate) fn journal(&self, tlf: TlfId) -> Option<Arc<TlfJournal<K>>> {
        self.journals.read().ok()?.get(&tlf).cloned()
    }

    fn journals(&self) -> Vec<Arc<TlfJournal<K>>> {
        self.journals
            .read()
            .map(|journals| journals.values().cloned().collect())
            .unwrap_or_default()
    }

    fn kv_store(&self) -> Result<K, JournalServerError> {
        self.kv_store
            .lock()
            .map(|kv_store| kv_store.clone())
            .map_err(|_| JournalServerError::ShutDown)
    }

    fn open_journal(&self, tlf: TlfId) -> Result<BlockJournal<K>, JournalServerError> {
        BlockJournal::open(tlf, self.kv_store()?, Arc::clone(&self.crypto))
            .map_err(|source| JournalServerError::JournalIo { tlf, source })
    }

    /// Stop every flush worker, then shut the delegate down. Does nothing after the first call.
    pub(crate) fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for tlf_journal in self.journals() {
            tlf_journal.stop_worker();
        }
        self.delegate.shutdown();
        log::debug!("Journal server shut down");
    }
}

/// A handle to a running journal server. When this value is dropped, every flush worker and the event
/// bus are stopped.
pub struct JournalServer<K: KVStore, D: BlockServer> {
    shared: Arc<Shared<K, D>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<K: KVStore, D: BlockServer> JournalServer<K, D> {
    /// Enable the journals of every TLF that has one in the key-value store, e.g., journals left over
    /// from before a restart. Returns the TLFs enabled.
    pub fn enable_existing_journals(
        &self,
        initial_worker_state: InitialWorkerState,
    ) -> Result<Vec<TlfId>, JournalServerError> {
        self.check_running()?;
        let domains = self
            .shared
            .kv_store()?
            .journal_domains()
            .map_err(|err| JournalServerError::ReadDomains {
                source: JournalIOError::from(err),
            })?;
        for tlf in &domains {
            self.enable(*tlf, initial_worker_state)?;
        }
        log::debug!("Enabled {} existing journals", domains.len());
        Ok(domains)
    }

    /// Start journaling the calls on `tlf`. Enabling an enabled journal does nothing.
    pub fn enable(
        &self,
        tlf: TlfId,
        initial_worker_state: InitialWorkerState,
    ) -> Result<(), JournalServerError> {
        self.check_running()?;
        let mut journals = self
            .shared
            .journals
            .write()
            .map_err(|_| JournalServerError::ShutDown)?;

        let tlf_journal = match journals.get(&tlf).cloned() {
            Some(existing) => {
                let mut state = existing.lock()?;
                if state.enabled {
                    return Ok(());
                }
                if state.journal.is_unusable() {
                    state.journal = self.shared.open_journal(tlf)?;
                }
                state.flush_error = None;
                state.enabled = true;
                drop(state);
                existing
            }
            None => {
                let tlf_journal = Arc::new(TlfJournal::new(self.shared.open_journal(tlf)?));
                journals.insert(tlf, Arc::clone(&tlf_journal));
                tlf_journal
            }
        };
        drop(journals);

        let worker_state = WorkerState::from(initial_worker_state);
        tlf_journal.start_worker(
            Arc::clone(&self.shared.delegate),
            self.shared.worker_config,
            worker_state,
            self.shared.event_publisher.clone(),
        );

        Event::EnableJournal(EnableJournalEvent {
            timestamp: SystemTime::now(),
            tlf,
            unflushed_entries: tlf_journal.status()?.unflushed_entries,
            worker_state,
        })
        .publish(&self.shared.event_publisher);
        Ok(())
    }

    /// Stop journaling the calls on `tlf`, after the flush worker finishes its in-flight call. Returns
    /// whether the journal was enabled.
    pub fn disable(&self, tlf: TlfId) -> Result<bool, JournalServerError> {
        self.check_running()?;
        let Some(tlf_journal) = self.shared.journal(tlf) else {
            return Ok(false);
        };
        tlf_journal.stop_worker();

        let mut journals = self
            .shared
            .journals
            .write()
            .map_err(|_| JournalServerError::ShutDown)?;
        let unflushed_entries = {
            let mut state = tlf_journal.lock()?;
            if !state.enabled {
                return Ok(false);
            }
            state.enabled = false;
            state.journal.log().len()
        };

        if unflushed_entries == 0 {
            journals.remove(&tlf);
            let mut kv_store = self.shared.kv_store()?;
            unregister_domain(&mut kv_store, tlf)
                .map_err(|source| JournalServerError::JournalIo { tlf, source })?;
        }
        drop(journals);

        Event::DisableJournal(DisableJournalEvent {
            timestamp: SystemTime::now(),
            tlf,
            unflushed_entries,
        })
        .publish(&self.shared.event_publisher);
        Ok(true)
    }

    /// Pause the flush worker of `tlf`. An in-flight delegate call completes first; the worker reports
    /// itself [`Paused`](WorkerState::Paused) once it has stopped.
    pub fn pause_background_work(&self, tlf: TlfId) -> Result<(), JournalServerError> {
        let tlf_journal = self.enabled_journal(tlf)?;
        tlf_journal.send(WorkerCommand::Pause);
        Ok(())
    }

    /// Resume the flush worker of `tlf`, clearing the error that halted it, if any. Flushing restarts
    /// from the oldest unflushed entry.
    pub fn resume_background_work(&self, tlf: TlfId) -> Result<(), JournalServerError> {
        let tlf_journal = self.enabled_journal(tlf)?;
        {
            let mut state = tlf_journal.lock()?;
            state.flush_error = None;
            state.worker_state = WorkerState::Running;
        }
        tlf_journal.send(WorkerCommand::Resume);
        Ok(())
    }

    /// Block until the journal of `tlf` is empty. Fails if the flush worker is paused, or stops making
    /// progress while waiting.
    pub fn wait_for_complete_flush(&self, tlf: TlfId) -> Result<(), JournalServerError> {
        let tlf_journal = self
            .shared
            .journal(tlf)
            .ok_or(JournalServerError::NotEnabled { tlf })?;
        tlf_journal.wait_for_complete_flush()
    }

    /// Get a snapshot of the journal of `tlf`.
    pub fn status(&self, tlf: TlfId) -> Result<JournalStatus, JournalServerError> {
        let tlf_journal = self
            .shared
            .journal(tlf)
            .ok_or(JournalServerError::NotEnabled { tlf })?;
        Ok(tlf_journal.status()?)
    }

    /// Get the TLFs whose journals are enabled.
    pub fn journaled_tlfs(&self) -> Vec<TlfId> {
        let mut tlfs: Vec<TlfId> = self
            .shared
            .journals()
            .iter()
            .filter(|tlf_journal| tlf_journal.lock().is_ok_and(|state| state.enabled))
            .map(|tlf_journal| tlf_journal.tlf())
            .collect();
        tlfs.sort();
        tlfs
    }

    /// Get the block server that journals the calls on journaled TLFs.
    pub fn block_server(&self) -> JournalBlockServer<K, D> {
        JournalBlockServer::new(Arc::clone(&self.shared))
    }

    /// Get the delegate block server, bypassing the journals.
    pub fn delegate(&self) -> Arc<D> {
        Arc::clone(&self.shared.delegate)
    }

    /// Stop every flush worker and the event bus, and shut the delegate down. Entries not flushed yet
    /// stay in the key-value store, to be flushed after [`enable_existing_journals`](Self::enable_existing_journals).
    pub fn shutdown(&mut self) {
        self.shared.shutdown();

        if let Some(event_bus_shutdown) = self.event_bus_shutdown.take() {
            let _ = event_bus_shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            if event_bus.join().is_err() {
                log::warn!("Event bus thread panicked");
            }
        }
    }

    fn check_running(&self) -> Result<(), JournalServerError> {
        if self.shared.is_shut_down() {
            return Err(JournalServerError::ShutDown);
        }
        Ok(())
    }

    fn enabled_journal(&self, tlf: TlfId) -> Result<Arc<TlfJournal<K>>, JournalServerError> {
        self.check_running()?;
        let tlf_journal = self
            .shared
            .journal(tlf)
            .ok_or(JournalServerError::NotEnabled { tlf })?;
        if !tlf_journal.lock()?.enabled {
            return Err(JournalServerError::NotEnabled { tlf });
        }
        Ok(tlf_journal)
    }
}

impl<K: KVStore, D: BlockServer> Drop for JournalServer<K, D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Errors returned by the control methods of a [JournalServer].
#[derive(Debug)]
pub enum JournalServerError {
    /// The TLF has no enabled journal.
    NotEnabled { tlf: TlfId },

    /// The TLF's flush worker is paused, so its journal will not be flushed.
    WorkerPaused { tlf: TlfId },

    /// Flushing the TLF's journal stopped on an error, and will not continue until resumed.
    FlushHalted { tlf: TlfId, reason: String },

    /// A journal I/O failure made the TLF's journal unusable.
    JournalUnusable { tlf: TlfId },

    /// The TLF's journal could not be read from or written to.
    JournalIo { tlf: TlfId, source: JournalIOError },

    /// The list of TLFs with a journal could not be read.
    ReadDomains { source: JournalIOError },

    /// Any other error from a journal.
    BlockServer(BlockServerError),

    /// The journal server has been shut down.
    ShutDown,
}

impl From<BlockServerError> for JournalServerError {
    fn from(err: BlockServerError) -> Self {
        match err {
            BlockServerError::JournalIo { tlf, source } => JournalServerError::JournalIo { tlf, source },
            BlockServerError::JournalUnusable { tlf } => JournalServerError::JournalUnusable { tlf },
            BlockServerError::ShutDown => JournalServerError::ShutDown,
            err => JournalServerError::BlockServer(err),
        }
    }
}

impl Display for JournalServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            JournalServerError::NotEnabled { tlf } => write!(f, "TLF {} has no enabled journal", tlf),
            JournalServerError::WorkerPaused { tlf } => {
                write!(f, "Flush worker of TLF {} is paused", tlf)
            }
            JournalServerError::FlushHalted { tlf, reason } => {
                write!(f, "Flushing TLF {} halted: {}", tlf, reason)
            }
            JournalServerError::JournalUnusable { tlf } => {
                write!(f, "Journal of TLF {} is unusable", tlf)
            }
            JournalServerError::JournalIo { tlf, source } => {
                write!(f, "Journal I/O error in TLF {}: {}", tlf, source)
            }
            JournalServerError::ReadDomains { source } => {
                write!(f, "Could not read the journaled TLFs: {}", source)
            }
            JournalServerError::BlockServer(err) => Display::fmt(err, f),
            JournalServerError::ShutDown => write!(f, "Journal server is shut down"),
        }
    }
}
