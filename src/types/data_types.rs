/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::Add,
};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};

/// Content hash of a block's (encrypted) payload.
///
/// A `BlockId` is computed once, by [`Crypto::make_permanent_block_id`](super::crypto_primitives::Crypto::make_permanent_block_id),
/// and is then used as the primary key for both storing the block and counting references to it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct BlockId([u8; 32]);

impl BlockId {
    /// Create a new `BlockId` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `BlockId`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", STANDARD_NO_PAD.encode(self.0))
    }
}

impl Debug for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self)
    }
}

/// Distinguishes multiple independent references to the same [`BlockId`].
///
/// The reference implicitly created by the first `put` of a block always uses [`BlockRefNonce::ZERO`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct BlockRefNonce([u8; 8]);

impl BlockRefNonce {
    /// The reserved nonce of a block's initial reference.
    pub const ZERO: BlockRefNonce = BlockRefNonce([0; 8]);

    /// Create a new `BlockRefNonce` wrapping `bytes`.
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 8]` value of this `BlockRefNonce`.
    pub const fn bytes(&self) -> [u8; 8] {
        self.0
    }

    /// Whether this is the reserved [zero nonce](Self::ZERO).
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl Debug for BlockRefNonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "BlockRefNonce({})", STANDARD_NO_PAD.encode(self.0))
    }
}

/// Identifier of a user of the filesystem.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct UserId([u8; 16]);

impl UserId {
    /// Create a new `UserId` wrapping `bytes`.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 16]` value of this `UserId`.
    pub const fn bytes(&self) -> [u8; 16] {
        self.0
    }
}

impl Debug for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", STANDARD_NO_PAD.encode(self.0))
    }
}

/// Identifier of a top-level folder (TLF): a logical storage domain whose blocks are journaled
/// together.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct TlfId([u8; 16]);

impl TlfId {
    /// Create a new `TlfId` wrapping `bytes`.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 16]` value of this `TlfId`.
    pub const fn bytes(&self) -> [u8; 16] {
        self.0
    }
}

impl Display for TlfId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", STANDARD_NO_PAD.encode(self.0))
    }
}

impl Debug for TlfId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "TlfId({})", self)
    }
}

/// The server-held half of a block's encryption key.
///
/// The block server never interprets it; it stores it next to the block's payload and hands it back
/// on every successful `get`.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BlockCryptKeyServerHalf([u8; 32]);

impl BlockCryptKeyServerHalf {
    /// Create a new `BlockCryptKeyServerHalf` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `BlockCryptKeyServerHalf`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Debug for BlockCryptKeyServerHalf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        write!(f, "BlockCryptKeyServerHalf(..)")
    }
}

/// Sequence number of an entry in a TLF's journal.
///
/// Ordinals are assigned starting at [`JournalOrdinal::FIRST`] and increase by one for every appended
/// entry. They are never reused, even after the journal has been completely flushed.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct JournalOrdinal(u64);

impl JournalOrdinal {
    /// The ordinal assigned to the first entry ever appended to a journal.
    pub const FIRST: JournalOrdinal = JournalOrdinal(0);

    /// Create a new `JournalOrdinal` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `JournalOrdinal`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the big-endian representation of the inner value. Big-endian keeps the lexicographic order
    /// of keys equal to the numeric order of ordinals.
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl Display for JournalOrdinal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for JournalOrdinal {
    type Output = JournalOrdinal;
    fn add(self, rhs: u64) -> Self::Output {
        JournalOrdinal::new(self.0.add(rhs))
    }
}

impl std::ops::Sub<JournalOrdinal> for JournalOrdinal {
    type Output = u64;
    fn sub(self, rhs: JournalOrdinal) -> Self::Output {
        self.0 - rhs.0
    }
}
