//! Identities, blocks, and journal servers shared by the tests.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use block_journal_rs::{
    journal_server::{Configuration, JournalServer, JournalServerSpec},
    types::{
        block_context::{BlockContext, ContextMap},
        crypto_primitives::{Crypto, CryptoCommon},
        data_types::{BlockCryptKeyServerHalf, BlockId, BlockRefNonce, TlfId, UserId},
    },
};

use super::{delegate::TestDelegate, mem_db::MemDB};

pub(crate) fn crypto() -> Arc<dyn Crypto> {
    Arc::new(CryptoCommon::new())
}

pub(crate) fn tlf(n: u8) -> TlfId {
    TlfId::new([n; 16])
}

pub(crate) fn user(n: u8) -> UserId {
    UserId::new([n; 16])
}

/// A well-formed block: `id` is the content hash of `data`.
#[derive(Clone)]
pub(crate) struct TestBlock {
    pub(crate) id: BlockId,
    pub(crate) data: Vec<u8>,
    pub(crate) server_half: BlockCryptKeyServerHalf,
}

pub(crate) fn make_block(crypto: &dyn Crypto, data: &[u8]) -> TestBlock {
    TestBlock {
        id: crypto.make_permanent_block_id(data),
        data: data.to_vec(),
        server_half: crypto.make_random_block_crypt_key_server_half().unwrap(),
    }
}

/// A reference to a block created by `creator`, owned by `writer`, with every nonce byte set to `nonce`.
pub(crate) fn context(creator: UserId, writer: UserId, nonce: u8) -> BlockContext {
    BlockContext::new(creator, Some(writer), BlockRefNonce::new([nonce; 8]))
}

pub(crate) fn context_map(block: BlockId, contexts: &[BlockContext]) -> ContextMap {
    let mut map = ContextMap::new();
    map.insert(block, contexts.to_vec());
    map
}

/// Start a journal server with short retry backoffs, so that retries are observable in tests.
pub(crate) fn start_journal_server(
    kv_store: MemDB,
    delegate: TestDelegate,
) -> JournalServer<MemDB, TestDelegate> {
    let configuration = Configuration::builder()
        .log_events(true)
        .flush_retry_initial_backoff(Duration::from_millis(10))
        .flush_retry_max_backoff(Duration::from_millis(80))
        .flush_retry_jitter(Duration::from_millis(5))
        .build();

    JournalServerSpec::builder()
        .kv_store(kv_store)
        .delegate(delegate)
        .crypto(crypto())
        .configuration(configuration)
        .build()
        .start()
}

/// Poll `condition` until it holds, or `timeout` passes. Returns whether it held.
pub(crate) fn poll_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
