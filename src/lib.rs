/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A journaled write-buffering layer for content-addressed block servers.
//!
//! Calls made through a [`JournalBlockServer`](journal_server::JournalBlockServer) on a journaled TLF
//! return as soon as they are durably appended to the TLF's local journal. A background flush worker
//! per TLF then applies the journaled operations, in order and at least once, to the delegate (remote)
//! [`BlockServer`](block_server::BlockServer). Reads and reference counting behave the same before and
//! after the flush.
//!
//! Start with [`journal_server::JournalServerSpec`].

pub mod block_server;

pub mod events;

pub(crate) mod event_bus;

pub mod journal;

pub mod journal_server;

pub(crate) mod logging;

pub mod types;
