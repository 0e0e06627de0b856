use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use block_journal_rs::{
    block_server::{BlockServer, BlockServerError, MemoryBlockServer},
    events::{FlushEntryEvent, FlushRetryEvent},
    journal::{entry::BlockOp, pluggables::KVGet},
    journal_server::{
        flush_worker::WorkerState, Configuration, InitialWorkerState, JournalServerError,
        JournalServerSpec,
    },
    types::{block_context::BlockContext, data_types::JournalOrdinal},
};
use log::LevelFilter;

mod common;

use common::{
    delegate::TestDelegate,
    fixtures::{context, context_map, crypto, make_block, poll_until, start_journal_server, tlf, user},
    logging::{log_with_context, setup_logger},
    mem_db::MemDB,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Tests that flushing a Put, an AddReference, and a RemoveReferences leaves the remote server in the
/// same state as applying the three operations to it directly.
#[test]
fn flush_ordering_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let delegate = TestDelegate::new(crypto.clone());
    let journal_server = start_journal_server(MemDB::new(), delegate.clone());
    let block_server = journal_server.block_server();
    let tlf = tlf(1);
    let alice = user(1);
    let block = make_block(crypto.as_ref(), b"flush me");
    let c1 = BlockContext::first_reference(alice);
    let c2 = context(alice, user(2), 2);

    // 1. Journal E1 (Put), E2 (AddReference), E3 (RemoveReferences).
    journal_server
        .enable(tlf, InitialWorkerState::StartImmediately)
        .unwrap();
    block_server
        .put(tlf, &block.id, &c1, &block.data, block.server_half)
        .unwrap();
    block_server.add_block_reference(tlf, &block.id, &c2).unwrap();
    let live_counts = block_server
        .remove_block_references(tlf, &context_map(block.id, &[c1]))
        .unwrap();
    assert_eq!(live_counts.get(&block.id), Some(&1));

    // 2. Flush everything.
    log_with_context(Some(tlf), "Waiting for the journal to be flushed.");
    journal_server.wait_for_complete_flush(tlf).unwrap();

    // 3. Apply the same operations directly to a fresh remote server.
    let direct = MemoryBlockServer::new(crypto.clone());
    direct
        .put(tlf, &block.id, &c1, &block.data, block.server_half)
        .unwrap();
    direct.add_block_reference(tlf, &block.id, &c2).unwrap();
    direct
        .remove_block_references(tlf, &context_map(block.id, &[c1]))
        .unwrap();

    // 4. Compare remote state.
    assert_eq!(
        delegate.remote().block_references(tlf, &block.id).unwrap(),
        direct.block_references(tlf, &block.id).unwrap()
    );
    assert_eq!(
        delegate.remote().has_data(tlf, &block.id),
        direct.has_data(tlf, &block.id)
    );
    let kinds: Vec<&str> = delegate.applied().iter().map(|(_, op)| op.kind()).collect();
    assert_eq!(kinds, vec!["Put", "AddReference", "RemoveReferences"]);

    // 5. The payload is no longer cached locally, so reads now go to the remote server.
    let status = journal_server.status(tlf).unwrap();
    assert_eq!(status.unflushed_entries, 0);
    assert_eq!(status.unflushed_bytes, 0);
    assert_eq!(
        block_server.get(tlf, &block.id, &c2).unwrap(),
        (block.data.clone(), block.server_half)
    );
    assert!(matches!(
        block_server.get(tlf, &block.id, &c1).unwrap_err(),
        BlockServerError::ReferenceNotFound { .. }
    ));
}

/// Tests that journaled operations survive a restart, are not flushed until the worker is resumed,
/// and are then flushed exactly once each, in order.
#[test]
fn crash_recovery_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let kv_store = MemDB::new();
    let tlf = tlf(2);
    let alice = user(1);
    let blocks: Vec<_> = (0..3u8)
        .map(|i| make_block(crypto.as_ref(), &[i; 64]))
        .collect();
    let c1 = BlockContext::first_reference(alice);
    let c2 = context(alice, alice, 2);

    // 1. Journal 5 operations with the worker paused, then "crash".
    let first_delegate = TestDelegate::new(crypto.clone());
    let mut expected = Vec::new();
    {
        let journal_server = start_journal_server(kv_store.clone(), first_delegate.clone());
        let block_server = journal_server.block_server();
        journal_server
            .enable(tlf, InitialWorkerState::Paused)
            .unwrap();
        for block in &blocks {
            block_server
                .put(tlf, &block.id, &c1, &block.data, block.server_half)
                .unwrap();
            expected.push(BlockOp::Put {
                block: block.id,
                context: c1,
            });
        }
        block_server
            .add_block_reference(tlf, &blocks[0].id, &c2)
            .unwrap();
        expected.push(BlockOp::AddReference {
            block: blocks[0].id,
            context: c2,
        });
        block_server
            .remove_block_references(tlf, &context_map(blocks[1].id, &[c1]))
            .unwrap();
        expected.push(BlockOp::RemoveReferences {
            contexts: context_map(blocks[1].id, &[c1]),
        });
    }
    assert_eq!(first_delegate.calls(), 0);

    // 2. Restart: the journal is found and reopened, paused.
    let delegate = TestDelegate::new(crypto.clone());
    let journal_server = start_journal_server(kv_store.clone(), delegate.clone());
    let enabled = journal_server
        .enable_existing_journals(InitialWorkerState::Paused)
        .unwrap();
    assert_eq!(enabled, vec![tlf]);
    let status = journal_server.status(tlf).unwrap();
    assert_eq!(status.worker_state, WorkerState::Paused);
    assert_eq!(status.earliest_ordinal, JournalOrdinal::FIRST);
    assert_eq!(status.next_ordinal, JournalOrdinal::new(5));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(delegate.calls(), 0);

    // 3. Unflushed payloads are still readable locally.
    assert_eq!(
        journal_server
            .block_server()
            .get(tlf, &blocks[2].id, &c1)
            .unwrap(),
        (blocks[2].data.clone(), blocks[2].server_half)
    );

    // 4. Resume: every entry is flushed exactly once, in order.
    journal_server.resume_background_work(tlf).unwrap();
    journal_server.wait_for_complete_flush(tlf).unwrap();
    let applied: Vec<BlockOp> = delegate.applied().into_iter().map(|(_, op)| op).collect();
    assert_eq!(applied, expected);
    assert_eq!(delegate.calls(), 5);
    let status = journal_server.status(tlf).unwrap();
    assert_eq!(status.earliest_ordinal, JournalOrdinal::new(5));
    assert_eq!(status.next_ordinal, JournalOrdinal::new(5));
}

/// Tests that pausing the worker in the middle of a flush lets the in-flight entry complete, and that
/// resuming completes the rest with no duplication and no loss.
#[test]
fn pause_resume_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let delegate = TestDelegate::new(crypto.clone()).with_call_delay(Duration::from_millis(30));
    let journal_server = start_journal_server(MemDB::new(), delegate.clone());
    let block_server = journal_server.block_server();
    let tlf = tlf(3);
    let c1 = BlockContext::first_reference(user(1));
    const N: u8 = 10;

    // 1. Journal N puts with the worker paused.
    journal_server
        .enable(tlf, InitialWorkerState::Paused)
        .unwrap();
    let mut expected = Vec::new();
    for i in 0..N {
        let block = make_block(crypto.as_ref(), &[i; 16]);
        block_server
            .put(tlf, &block.id, &c1, &block.data, block.server_half)
            .unwrap();
        expected.push(BlockOp::Put {
            block: block.id,
            context: c1,
        });
    }
    assert!(matches!(
        journal_server.wait_for_complete_flush(tlf).unwrap_err(),
        JournalServerError::WorkerPaused { .. }
    ));

    // 2. Resume, and pause again after a few entries. Waiting returns once the worker has finished the
    //    entry it was applying and reported itself paused.
    journal_server.resume_background_work(tlf).unwrap();
    assert!(poll_until(TIMEOUT, || delegate.applied().len() >= 3));
    journal_server.pause_background_work(tlf).unwrap();
    assert!(matches!(
        journal_server.wait_for_complete_flush(tlf).unwrap_err(),
        JournalServerError::WorkerPaused { .. }
    ));

    // 3. Nothing more is flushed while paused.
    let flushed = delegate.applied().len();
    let status = journal_server.status(tlf).unwrap();
    assert_eq!(status.worker_state, WorkerState::Paused);
    assert_eq!(status.earliest_ordinal.int(), flushed as u64);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(delegate.applied().len(), flushed);
    log_with_context(Some(tlf), &format!("Paused after {} entries.", flushed));

    // 4. Resume: the rest is flushed, with no duplication and no loss.
    journal_server.resume_background_work(tlf).unwrap();
    journal_server.wait_for_complete_flush(tlf).unwrap();
    let applied: Vec<BlockOp> = delegate.applied().into_iter().map(|(_, op)| op).collect();
    assert_eq!(applied, expected);
    assert_eq!(delegate.calls(), N as usize);
}

/// Tests that transient delegate errors are retried until the entry is flushed.
#[test]
fn transient_retry_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let delegate = TestDelegate::new(crypto.clone());
    let retries = Arc::new(AtomicUsize::new(0));
    let journal_server = {
        let retries = retries.clone();
        JournalServerSpec::builder()
            .kv_store(MemDB::new())
            .delegate(delegate.clone())
            .crypto(crypto.clone())
            .configuration(
                Configuration::builder()
                    .log_events(true)
                    .flush_retry_initial_backoff(Duration::from_millis(5))
                    .flush_retry_max_backoff(Duration::from_millis(20))
                    .flush_retry_jitter(Duration::ZERO)
                    .build(),
            )
            .on_flush_retry(move |event: &FlushRetryEvent| {
                assert_eq!(event.ordinal, JournalOrdinal::FIRST);
                retries.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .start()
    };
    let tlf = tlf(4);
    let block = make_block(crypto.as_ref(), b"retry me");
    let c1 = BlockContext::first_reference(user(1));

    // 1. The first three attempts fail transiently.
    delegate.fail_transiently(3);
    journal_server
        .enable(tlf, InitialWorkerState::StartImmediately)
        .unwrap();
    journal_server
        .block_server()
        .put(tlf, &block.id, &c1, &block.data, block.server_half)
        .unwrap();

    // 2. The fourth attempt succeeds.
    journal_server.wait_for_complete_flush(tlf).unwrap();
    assert_eq!(delegate.calls(), 4);
    assert_eq!(delegate.applied().len(), 1);
    assert!(poll_until(TIMEOUT, || retries.load(Ordering::SeqCst) == 3));
    assert!(journal_server.status(tlf).unwrap().flush_error.is_none());
}

/// Tests that a rejected flush halts the worker with an observable error, without affecting
/// foreground calls, until the worker is resumed.
#[test]
fn rejected_flush_halts_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let delegate = TestDelegate::new(crypto.clone());
    let journal_server = start_journal_server(MemDB::new(), delegate.clone());
    let block_server = journal_server.block_server();
    let tlf = tlf(5);
    let block = make_block(crypto.as_ref(), b"rejected");
    let c1 = BlockContext::first_reference(user(1));
    let c2 = context(user(1), user(1), 2);

    // 1. The delegate rejects the first entry: the worker halts.
    delegate.set_rejecting(true);
    journal_server
        .enable(tlf, InitialWorkerState::StartImmediately)
        .unwrap();
    block_server
        .put(tlf, &block.id, &c1, &block.data, block.server_half)
        .unwrap();
    assert!(poll_until(TIMEOUT, || journal_server
        .status(tlf)
        .unwrap()
        .flush_error
        .is_some()));
    let status = journal_server.status(tlf).unwrap();
    assert_eq!(status.worker_state, WorkerState::Paused);
    assert_eq!(status.unflushed_entries, 1);
    assert!(matches!(
        journal_server.wait_for_complete_flush(tlf).unwrap_err(),
        JournalServerError::FlushHalted { .. }
    ));

    // 2. Foreground calls keep succeeding.
    block_server.add_block_reference(tlf, &block.id, &c2).unwrap();
    assert_eq!(journal_server.status(tlf).unwrap().unflushed_entries, 2);
    let calls = delegate.calls();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(delegate.calls(), calls);

    // 3. Once the delegate accepts again, resuming flushes both entries.
    delegate.set_rejecting(false);
    journal_server.resume_background_work(tlf).unwrap();
    journal_server.wait_for_complete_flush(tlf).unwrap();
    let kinds: Vec<&str> = delegate.applied().iter().map(|(_, op)| op.kind()).collect();
    assert_eq!(kinds, vec!["Put", "AddReference"]);
    assert!(journal_server.status(tlf).unwrap().flush_error.is_none());
}

/// Tests disabling an empty journal (calls pass through afterwards) and a non-empty one (calls are
/// rejected until it is enabled again).
#[test]
fn disable_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let kv_store = MemDB::new();
    let delegate = TestDelegate::new(crypto.clone());
    let journal_server = start_journal_server(kv_store.clone(), delegate.clone());
    let block_server = journal_server.block_server();
    let flushed_tlf = tlf(6);
    let pending_tlf = tlf(7);
    let c1 = BlockContext::first_reference(user(1));
    let first = make_block(crypto.as_ref(), b"first");
    let second = make_block(crypto.as_ref(), b"second");

    // 1. Enable both TLFs.
    journal_server
        .enable(flushed_tlf, InitialWorkerState::StartImmediately)
        .unwrap();
    journal_server
        .enable(pending_tlf, InitialWorkerState::Paused)
        .unwrap();
    assert_eq!(journal_server.journaled_tlfs(), vec![flushed_tlf, pending_tlf]);
    assert_eq!(
        kv_store.journal_domains().unwrap(),
        vec![flushed_tlf, pending_tlf]
    );

    // 2. Disable a flushed journal: the TLF is forgotten, and calls go straight to the delegate.
    block_server
        .put(flushed_tlf, &first.id, &c1, &first.data, first.server_half)
        .unwrap();
    journal_server.wait_for_complete_flush(flushed_tlf).unwrap();
    assert!(journal_server.disable(flushed_tlf).unwrap());
    assert!(!journal_server.disable(flushed_tlf).unwrap());
    assert!(matches!(
        journal_server.status(flushed_tlf).unwrap_err(),
        JournalServerError::NotEnabled { .. }
    ));
    assert_eq!(kv_store.journal_domains().unwrap(), vec![pending_tlf]);
    block_server
        .put(flushed_tlf, &second.id, &c1, &second.data, second.server_half)
        .unwrap();
    assert_eq!(delegate.applied().len(), 2);

    // 3. Disable a journal with pending entries: it is kept, and rejects calls.
    block_server
        .put(pending_tlf, &first.id, &c1, &first.data, first.server_half)
        .unwrap();
    assert!(journal_server.disable(pending_tlf).unwrap());
    assert!(journal_server.journaled_tlfs().is_empty());
    let status = journal_server.status(pending_tlf).unwrap();
    assert!(!status.enabled);
    assert_eq!(status.unflushed_entries, 1);
    assert!(matches!(
        block_server.get(pending_tlf, &first.id, &c1).unwrap_err(),
        BlockServerError::JournalDisabled { .. }
    ));
    assert!(matches!(
        journal_server.resume_background_work(pending_tlf).unwrap_err(),
        JournalServerError::NotEnabled { .. }
    ));

    // 4. Enable it again: flushing resumes from the pending entry.
    journal_server
        .enable(pending_tlf, InitialWorkerState::StartImmediately)
        .unwrap();
    journal_server.wait_for_complete_flush(pending_tlf).unwrap();
    assert_eq!(delegate.applied().len(), 3);
    assert_eq!(delegate.applied()[2].0, pending_tlf);
}

/// Tests that calls on TLFs without a journal go straight to the delegate.
#[test]
fn pass_through_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let delegate = TestDelegate::new(crypto.clone());
    let journal_server = start_journal_server(MemDB::new(), delegate.clone());
    let block_server = journal_server.block_server();
    let tlf = tlf(8);
    let block = make_block(crypto.as_ref(), b"direct");
    let c1 = BlockContext::first_reference(user(1));

    block_server
        .put(tlf, &block.id, &c1, &block.data, block.server_half)
        .unwrap();
    assert_eq!(delegate.applied().len(), 1);
    assert!(matches!(
        block_server
            .add_block_reference(tlf, &make_block(crypto.as_ref(), b"unknown").id, &c1)
            .unwrap_err(),
        BlockServerError::UnknownBlock { .. }
    ));
    let live_counts = block_server
        .remove_block_references(tlf, &context_map(block.id, &[c1]))
        .unwrap();
    assert_eq!(live_counts.get(&block.id), Some(&0));
    assert!(!delegate.remote().has_data(tlf, &block.id));
}

/// Tests that a journal I/O error makes a TLF's journal unusable until it is disabled and enabled
/// again.
#[test]
fn journal_unusable_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let kv_store = MemDB::new();
    let delegate = TestDelegate::new(crypto.clone());
    let journal_server = start_journal_server(kv_store.clone(), delegate.clone());
    let block_server = journal_server.block_server();
    let tlf = tlf(9);
    let block = make_block(crypto.as_ref(), b"disk full");
    let c1 = BlockContext::first_reference(user(1));

    journal_server
        .enable(tlf, InitialWorkerState::Paused)
        .unwrap();

    // 1. The write fails, and the journal becomes unusable.
    kv_store.set_fail_writes(true);
    assert!(matches!(
        block_server
            .put(tlf, &block.id, &c1, &block.data, block.server_half)
            .unwrap_err(),
        BlockServerError::JournalIo { .. }
    ));
    kv_store.set_fail_writes(false);
    assert!(journal_server.status(tlf).unwrap().unusable);
    assert!(matches!(
        block_server
            .put(tlf, &block.id, &c1, &block.data, block.server_half)
            .unwrap_err(),
        BlockServerError::JournalUnusable { .. }
    ));

    // 2. Disable and enable again: the journal is usable.
    assert!(journal_server.disable(tlf).unwrap());
    journal_server
        .enable(tlf, InitialWorkerState::StartImmediately)
        .unwrap();
    block_server
        .put(tlf, &block.id, &c1, &block.data, block.server_half)
        .unwrap();
    journal_server.wait_for_complete_flush(tlf).unwrap();
    assert_eq!(delegate.applied().len(), 1);
}

/// Tests that flush events are emitted in ordinal order.
#[test]
fn flush_events_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let delegate = TestDelegate::new(crypto.clone());
    let flushed: Arc<Mutex<Vec<(JournalOrdinal, &'static str)>>> = Arc::new(Mutex::new(Vec::new()));
    let journal_server = {
        let flushed = flushed.clone();
        JournalServerSpec::builder()
            .kv_store(MemDB::new())
            .delegate(delegate.clone())
            .crypto(crypto.clone())
            .configuration(Configuration::builder().log_events(false).build())
            .on_flush_entry(move |event: &FlushEntryEvent| {
                flushed.lock().unwrap().push((event.ordinal, event.kind))
            })
            .build()
            .start()
    };
    let tlf = tlf(10);
    let block = make_block(crypto.as_ref(), b"observed");
    let c1 = BlockContext::first_reference(user(1));
    let c2 = context(user(1), user(1), 2);

    journal_server
        .enable(tlf, InitialWorkerState::StartImmediately)
        .unwrap();
    let block_server = journal_server.block_server();
    block_server
        .put(tlf, &block.id, &c1, &block.data, block.server_half)
        .unwrap();
    block_server.add_block_reference(tlf, &block.id, &c2).unwrap();
    block_server
        .archive_block_references(tlf, &context_map(block.id, &[c1]))
        .unwrap();
    journal_server.wait_for_complete_flush(tlf).unwrap();

    assert!(poll_until(TIMEOUT, || flushed.lock().unwrap().len() == 3));
    assert_eq!(
        *flushed.lock().unwrap(),
        vec![
            (JournalOrdinal::new(0), "Put"),
            (JournalOrdinal::new(1), "AddReference"),
            (JournalOrdinal::new(2), "ArchiveReferences"),
        ]
    );
}

/// Tests that after shutdown every call fails, and unflushed entries stay in the key-value store.
#[test]
fn shutdown_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let kv_store = MemDB::new();
    let delegate = TestDelegate::new(crypto.clone());
    let mut journal_server = start_journal_server(kv_store.clone(), delegate.clone());
    let block_server = journal_server.block_server();
    let tlf = tlf(11);
    let block = make_block(crypto.as_ref(), b"left behind");
    let c1 = BlockContext::first_reference(user(1));

    journal_server
        .enable(tlf, InitialWorkerState::Paused)
        .unwrap();
    block_server
        .put(tlf, &block.id, &c1, &block.data, block.server_half)
        .unwrap();

    journal_server.shutdown();
    assert!(matches!(
        block_server.get(tlf, &block.id, &c1).unwrap_err(),
        BlockServerError::ShutDown
    ));
    assert!(matches!(
        journal_server
            .enable(tlf, InitialWorkerState::Paused)
            .unwrap_err(),
        JournalServerError::ShutDown
    ));
    assert_eq!(delegate.calls(), 0);
    assert_eq!(kv_store.journal_domains().unwrap(), vec![tlf]);
    assert!(kv_store.len() > 0);
}

/// Tests that a journal re-enabled after calls passed through to the delegate sees the delegate's
/// current references, not what it knew before it was disabled.
#[test]
fn reenable_after_pass_through_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let kv_store = MemDB::new();
    let delegate = TestDelegate::new(crypto.clone());
    let journal_server = start_journal_server(kv_store.clone(), delegate.clone());
    let block_server = journal_server.block_server();
    let tlf = tlf(12);
    let alice = user(1);
    let block = make_block(crypto.as_ref(), b"outlives its journal");
    let c1 = BlockContext::first_reference(alice);
    let c2 = context(alice, alice, 2);
    let c3 = context(alice, alice, 3);
    let c4 = context(alice, alice, 4);

    // 1. Put through the journal, flush, and disable: the store keeps nothing about the block.
    journal_server
        .enable(tlf, InitialWorkerState::StartImmediately)
        .unwrap();
    block_server
        .put(tlf, &block.id, &c1, &block.data, block.server_half)
        .unwrap();
    journal_server.wait_for_complete_flush(tlf).unwrap();
    assert!(kv_store.pending_refs(&tlf, &block.id).unwrap().is_none());
    assert!(kv_store.cached_block(&tlf, &block.id).unwrap().is_none());
    assert!(journal_server.disable(tlf).unwrap());

    // 2. Add C2 while calls pass through, then enable again: C2 reads, and C3 can be journaled.
    block_server.add_block_reference(tlf, &block.id, &c2).unwrap();
    journal_server
        .enable(tlf, InitialWorkerState::StartImmediately)
        .unwrap();
    assert_eq!(
        block_server.get(tlf, &block.id, &c2).unwrap(),
        (block.data.clone(), block.server_half)
    );
    block_server.add_block_reference(tlf, &block.id, &c3).unwrap();
    journal_server.wait_for_complete_flush(tlf).unwrap();
    assert_eq!(
        delegate
            .remote()
            .block_references(tlf, &block.id)
            .unwrap()
            .map(|refs| refs.len()),
        Some(3)
    );

    // 3. Remove every reference while calls pass through, so the delegate reclaims the block. Once
    //    enabled again, the journal reports the block as unknown instead of journaling a doomed call.
    assert!(journal_server.disable(tlf).unwrap());
    let live_counts = block_server
        .remove_block_references(tlf, &context_map(block.id, &[c1, c2, c3]))
        .unwrap();
    assert_eq!(live_counts.get(&block.id), Some(&0));
    journal_server
        .enable(tlf, InitialWorkerState::StartImmediately)
        .unwrap();
    assert!(matches!(
        block_server
            .add_block_reference(tlf, &block.id, &c4)
            .unwrap_err(),
        BlockServerError::UnknownBlock { .. }
    ));
    assert!(block_server.get(tlf, &block.id, &c1).is_err());
    let status = journal_server.status(tlf).unwrap();
    assert_eq!(status.unflushed_entries, 0);
    assert!(status.flush_error.is_none());
}

/// Tests that appends from several threads racing with the flush worker are all flushed exactly once,
/// each thread's operations in the order that thread made them.
#[test]
fn concurrent_appends_test() {
    setup_logger(LevelFilter::Info);
    let crypto = crypto();
    let delegate = TestDelegate::new(crypto.clone()).with_call_delay(Duration::from_millis(1));
    let journal_server = start_journal_server(MemDB::new(), delegate.clone());
    let tlf = tlf(13);
    const THREADS: u8 = 4;
    const OPS_PER_THREAD: u8 = 8;

    // 1. Start the worker, then append from every thread at once.
    journal_server
        .enable(tlf, InitialWorkerState::StartImmediately)
        .unwrap();
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let block_server = journal_server.block_server();
            let crypto = crypto.clone();
            thread::spawn(move || {
                let owner = user(t + 1);
                let block = make_block(crypto.as_ref(), &[t; 32]);
                let c1 = BlockContext::first_reference(owner);
                block_server
                    .put(tlf, &block.id, &c1, &block.data, block.server_half)
                    .unwrap();
                let mut expected = vec![BlockOp::Put {
                    block: block.id,
                    context: c1,
                }];
                for nonce in 2..=OPS_PER_THREAD {
                    let c = context(owner, owner, nonce);
                    block_server.add_block_reference(tlf, &block.id, &c).unwrap();
                    expected.push(BlockOp::AddReference {
                        block: block.id,
                        context: c,
                    });
                }
                (block.id, expected)
            })
        })
        .collect();
    let expected: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    // 2. Every append is flushed exactly once.
    journal_server.wait_for_complete_flush(tlf).unwrap();
    let total = THREADS as usize * OPS_PER_THREAD as usize;
    assert_eq!(delegate.calls(), total);
    assert_eq!(delegate.applied().len(), total);
    let status = journal_server.status(tlf).unwrap();
    assert_eq!(status.next_ordinal.int(), total as u64);
    assert_eq!(status.unflushed_entries, 0);

    // 3. Each thread's operations reached the delegate in the thread's order.
    let applied: Vec<BlockOp> = delegate.applied().into_iter().map(|(_, op)| op).collect();
    for (block, thread_ops) in expected {
        let ops: Vec<BlockOp> = applied
            .iter()
            .filter(|op| op.blocks() == vec![block])
            .cloned()
            .collect();
        assert_eq!(ops, thread_ops);
    }
}

/// Tests that a paused worker keeps reporting itself running until its in-flight delegate call
/// completes.
#[test]
fn pause_during_apply_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let delegate = TestDelegate::new(crypto.clone()).with_call_delay(Duration::from_millis(500));
    let journal_server = start_journal_server(MemDB::new(), delegate.clone());
    let block_server = journal_server.block_server();
    let tlf = tlf(14);
    let c1 = BlockContext::first_reference(user(1));
    let first = make_block(crypto.as_ref(), b"in flight");
    let second = make_block(crypto.as_ref(), b"waits");

    // 1. Journal two puts, and pause while the first is being applied.
    journal_server
        .enable(tlf, InitialWorkerState::Paused)
        .unwrap();
    for block in [&first, &second] {
        block_server
            .put(tlf, &block.id, &c1, &block.data, block.server_half)
            .unwrap();
    }
    journal_server.resume_background_work(tlf).unwrap();
    assert!(poll_until(TIMEOUT, || delegate.calls() == 1));
    journal_server.pause_background_work(tlf).unwrap();
    assert_eq!(
        journal_server.status(tlf).unwrap().worker_state,
        WorkerState::Running
    );

    // 2. Waiting for the flush fails only once the worker has actually stopped.
    assert!(matches!(
        journal_server.wait_for_complete_flush(tlf).unwrap_err(),
        JournalServerError::WorkerPaused { .. }
    ));
    let status = journal_server.status(tlf).unwrap();
    assert_eq!(status.worker_state, WorkerState::Paused);
    assert_eq!(status.unflushed_entries, 1);
    assert_eq!(delegate.applied().len(), 1);
}

/// Tests that puts of new blocks are journaled while the delegate is unreachable, and that calls
/// needing the delegate's references fail with its error.
#[test]
fn unreachable_delegate_test() {
    setup_logger(LevelFilter::Debug);
    let crypto = crypto();
    let delegate = TestDelegate::new(crypto.clone());
    let journal_server = start_journal_server(MemDB::new(), delegate.clone());
    let block_server = journal_server.block_server();
    let tlf = tlf(15);
    let alice = user(1);
    let c1 = BlockContext::first_reference(alice);
    let c2 = context(alice, alice, 2);
    let flushed = make_block(crypto.as_ref(), b"flushed while online");
    let offline = make_block(crypto.as_ref(), b"put while offline");

    journal_server
        .enable(tlf, InitialWorkerState::StartImmediately)
        .unwrap();
    block_server
        .put(tlf, &flushed.id, &c1, &flushed.data, flushed.server_half)
        .unwrap();
    journal_server.wait_for_complete_flush(tlf).unwrap();
    journal_server.pause_background_work(tlf).unwrap();
    assert!(poll_until(TIMEOUT, || journal_server
        .status(tlf)
        .unwrap()
        .worker_state
        == WorkerState::Paused));

    // 1. Offline: a new block can be put and read back, but a flushed block cannot be referenced.
    delegate.set_unreachable(true);
    block_server
        .put(tlf, &offline.id, &c1, &offline.data, offline.server_half)
        .unwrap();
    assert_eq!(
        block_server.get(tlf, &offline.id, &c1).unwrap(),
        (offline.data.clone(), offline.server_half)
    );
    block_server.add_block_reference(tlf, &offline.id, &c2).unwrap();
    assert!(matches!(
        block_server
            .add_block_reference(tlf, &flushed.id, &c2)
            .unwrap_err(),
        BlockServerError::RemoteTransient { .. }
    ));
    assert_eq!(journal_server.status(tlf).unwrap().unflushed_entries, 2);

    // 2. Back online: the offline entries are flushed.
    delegate.set_unreachable(false);
    journal_server.resume_background_work(tlf).unwrap();
    journal_server.wait_for_complete_flush(tlf).unwrap();
    let kinds: Vec<&str> = delegate.applied().iter().map(|(_, op)| op.kind()).collect();
    assert_eq!(kinds, vec!["Put", "Put", "AddReference"]);
    assert!(delegate.remote().has_data(tlf, &offline.id));
}
