/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of the journaled block server.
//!
//! Other types, specific to single components, are defined next to those components, e.g.,
//! [`crate::journal::entry`].

pub mod block_context;

pub mod crypto_primitives;

pub mod data_types;
