//! A delegate block server for tests: an in-memory remote block store that records the operations it
//! applies, and can be told to fail.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use block_journal_rs::{
    block_server::{BlockServer, BlockServerError, MemoryBlockServer},
    journal::{entry::BlockOp, references::BlockRefs},
    types::{
        block_context::{BlockContext, ContextMap, LiveCounts},
        crypto_primitives::Crypto,
        data_types::{BlockCryptKeyServerHalf, BlockId, TlfId},
    },
};

/// Wraps a [`MemoryBlockServer`]. Clones share the same storage, log, and failure switches.
#[derive(Clone)]
pub(crate) struct TestDelegate {
    inner: MemoryBlockServer,
    applied: Arc<Mutex<Vec<(TlfId, BlockOp)>>>,
    calls: Arc<AtomicUsize>,
    transient_failures: Arc<AtomicUsize>,
    rejecting: Arc<AtomicBool>,
    unreachable: Arc<AtomicBool>,
    call_delay: Duration,
}

impl TestDelegate {
    pub(crate) fn new(crypto: Arc<dyn Crypto>) -> TestDelegate {
        TestDelegate {
            inner: MemoryBlockServer::new(crypto),
            applied: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            transient_failures: Arc::new(AtomicUsize::new(0)),
            rejecting: Arc::new(AtomicBool::new(false)),
            unreachable: Arc::new(AtomicBool::new(false)),
            call_delay: Duration::ZERO,
        }
    }

    /// Make every mutating call take at least `call_delay`.
    pub(crate) fn with_call_delay(mut self, call_delay: Duration) -> TestDelegate {
        self.call_delay = call_delay;
        self
    }

    /// The underlying in-memory store, for inspecting remote state.
    pub(crate) fn remote(&self) -> &MemoryBlockServer {
        &self.inner
    }

    /// The operations successfully applied so far, in order.
    pub(crate) fn applied(&self) -> Vec<(TlfId, BlockOp)> {
        self.applied.lock().unwrap().clone()
    }

    /// Number of mutating calls received, including failed ones.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fail the next `n` mutating calls with a transient error.
    pub(crate) fn fail_transiently(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Reject every mutating call, as if permission had been revoked (or stop doing so).
    pub(crate) fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Fail every call, reads included, with a transient error (or stop doing so).
    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), BlockServerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BlockServerError::RemoteTransient {
                reason: String::from("network unreachable"),
            });
        }
        Ok(())
    }

    fn before_call(&self) -> Result<(), BlockServerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            thread::sleep(self.call_delay);
        }
        self.check_reachable()?;
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(BlockServerError::RemoteRejected {
                reason: String::from("permission denied"),
            });
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BlockServerError::RemoteTransient {
                reason: String::from("connection reset"),
            });
        }
        Ok(())
    }

    fn record(&self, tlf: TlfId, op: BlockOp) {
        self.applied.lock().unwrap().push((tlf, op));
    }
}

impl BlockServer for TestDelegate {
    fn get(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<(Vec<u8>, BlockCryptKeyServerHalf), BlockServerError> {
        self.check_reachable()?;
        self.inner.get(tlf, block, context)
    }

    fn put(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
        buf: &[u8],
        server_half: BlockCryptKeyServerHalf,
    ) -> Result<(), BlockServerError> {
        self.before_call()?;
        self.inner.put(tlf, block, context, buf, server_half)?;
        self.record(
            tlf,
            BlockOp::Put {
                block: *block,
                context: *context,
            },
        );
        Ok(())
    }

    fn add_block_reference(
        &self,
        tlf: TlfId,
        block: &BlockId,
        context: &BlockContext,
    ) -> Result<(), BlockServerError> {
        self.before_call()?;
        self.inner.add_block_reference(tlf, block, context)?;
        self.record(
            tlf,
            BlockOp::AddReference {
                block: *block,
                context: *context,
            },
        );
        Ok(())
    }

    fn remove_block_references(
        &self,
        tlf: TlfId,
        contexts: &ContextMap,
    ) -> Result<LiveCounts, BlockServerError> {
        self.before_call()?;
        let live_counts = self.inner.remove_block_references(tlf, contexts)?;
        self.record(
            tlf,
            BlockOp::RemoveReferences {
                contexts: contexts.clone(),
            },
        );
        Ok(live_counts)
    }

    fn archive_block_references(
        &self,
        tlf: TlfId,
        contexts: &ContextMap,
    ) -> Result<(), BlockServerError> {
        self.before_call()?;
        self.inner.archive_block_references(tlf, contexts)?;
        self.record(
            tlf,
            BlockOp::ArchiveReferences {
                contexts: contexts.clone(),
            },
        );
        Ok(())
    }

    fn block_references(
        &self,
        tlf: TlfId,
        block: &BlockId,
    ) -> Result<Option<BlockRefs>, BlockServerError> {
        self.check_reachable()?;
        self.inner.block_references(tlf, block)
    }

    fn shutdown(&self) {
        self.inner.shutdown()
    }
}
