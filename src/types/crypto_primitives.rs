/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives used by block servers.
//!
//! Computing block ids and generating key material is the job of an external collaborator, modelled
//! as the [`Crypto`] trait and passed into the [journal server](crate::journal_server) at
//! construction time. This module also provides [`CryptoCommon`], an implementation built on:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate.
//! 2. **Randomness**: provided by the operating system through [`rand_core::OsRng`].

use rand_core::{OsRng, RngCore};

use super::data_types::{BlockCryptKeyServerHalf, BlockId, BlockRefNonce};

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

/// Cryptographic operations a block server and its clients rely on.
pub trait Crypto: Send + Sync + 'static {
    /// Compute the permanent id of a block from its encoded, encrypted payload.
    fn make_permanent_block_id(&self, encoded_encrypted_data: &[u8]) -> BlockId;

    /// Generate a fresh server half of a block encryption key.
    fn make_random_block_crypt_key_server_half(
        &self,
    ) -> Result<BlockCryptKeyServerHalf, rand_core::Error>;

    /// Generate a fresh, non-zero reference nonce.
    fn make_block_ref_nonce(&self) -> Result<BlockRefNonce, rand_core::Error>;
}

/// Implementation of [`Crypto`] using SHA256 and the operating system's random number generator.
#[derive(Clone, Copy, Default)]
pub struct CryptoCommon;

impl CryptoCommon {
    pub fn new() -> Self {
        CryptoCommon
    }
}

impl Crypto for CryptoCommon {
    fn make_permanent_block_id(&self, encoded_encrypted_data: &[u8]) -> BlockId {
        let mut hasher = CryptoHasher::new();
        hasher.update(encoded_encrypted_data);
        BlockId::new(hasher.finalize().into())
    }

    fn make_random_block_crypt_key_server_half(
        &self,
    ) -> Result<BlockCryptKeyServerHalf, rand_core::Error> {
        let mut bytes = [0u8; 32];
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(BlockCryptKeyServerHalf::new(bytes))
    }

    fn make_block_ref_nonce(&self) -> Result<BlockRefNonce, rand_core::Error> {
        loop {
            let mut bytes = [0u8; 8];
            OsRng.try_fill_bytes(&mut bytes)?;
            let nonce = BlockRefNonce::new(bytes);
            if !nonce.is_zero() {
                return Ok(nonce);
            }
        }
    }
}
