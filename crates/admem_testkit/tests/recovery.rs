//! Crash recovery and store failure tests.

use admem_core::{AllocError, ArenaHint, ArenaId, ArenaMetadata, Blob};
use admem_store::{MemoryStore, StoreAdapter};
use admem_testkit::prelude::*;
use std::sync::Arc;

fn faulty_blob() -> (Arc<FaultyStore>, TestBlob) {
    init_test_logging();
    let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new(
        TEST_BLOB_SIZE as usize,
    ))));
    let test_blob = TestBlob::with_store(faulty.clone(), TEST_BLOB_SIZE, test_config());
    (faulty, test_blob)
}

#[test]
fn crash_keeps_committed_and_forgets_outstanding() {
    let mut test_blob = TestBlob::memory();
    let a = commit_alloc(&test_blob, 128);
    let b = commit_alloc(&test_blob, 4096);
    commit_free(&test_blob, a).unwrap();
    let _pending = test_blob.reserve(ArenaHint::Any, 64).unwrap().unwrap();
    let before = durable_state(&test_blob).unwrap();

    let blob = test_blob.reopen();
    assert_eq!(durable_state(blob).unwrap(), before);
    assert_eq!(blob.allocated_bytes(), 4096);

    let info = blob.arena_info(ArenaId::new(0)).unwrap().unwrap();
    assert_eq!(info.outstanding, 0);
    assert_eq!(info.tentative, info.watermark);
    // The freed range is reusable after recovery.
    let r = blob.reserve(ArenaHint::Any, 128).unwrap().unwrap();
    assert_eq!(r.addr(), a);
    commit_free(blob, b).unwrap();
}

#[test]
fn crash_after_checkpoint_replays_only_tail() {
    let mut test_blob = TestBlob::memory();
    for _ in 0..5 {
        commit_alloc(&test_blob, 64);
    }
    test_blob.checkpoint().unwrap();
    for _ in 0..3 {
        commit_alloc(&test_blob, 64);
    }
    let before = durable_state(&test_blob).unwrap();

    let blob = test_blob.reopen();
    assert_eq!(blob.stats().wal_entries_replayed, 3);
    assert_eq!(durable_state(blob).unwrap(), before);
}

#[test]
fn clean_close_replays_nothing() {
    let mut test_blob = TestBlob::memory();
    commit_alloc(&test_blob, 64);
    let blob = test_blob.close_and_reopen();
    assert_eq!(blob.stats().wal_entries_replayed, 0);
    assert_eq!(blob.allocated_bytes(), 64);
}

#[test]
fn canceled_hole_below_watermark_is_reclaimed_on_reopen() {
    let mut test_blob = TestBlob::memory();
    let hole = test_blob.reserve(ArenaHint::Any, 256).unwrap().unwrap();
    let hole_addr = hole.addr();
    let kept = commit_alloc(&test_blob, 64);
    assert!(kept > hole_addr);
    test_blob.cancel(hole).unwrap();

    let blob = test_blob.reopen();
    let r = blob.reserve(ArenaHint::Any, 256).unwrap().unwrap();
    assert_eq!(r.addr(), hole_addr);
}

#[test]
fn failed_submit_leaves_no_trace() {
    let (faulty, mut test_blob) = faulty_blob();
    commit_alloc(&test_blob, 64);
    let before = durable_state(&test_blob).unwrap();

    let r = test_blob.reserve(ArenaHint::Any, 128).unwrap().unwrap();
    faulty.arm(Fault::SubmitWal);
    let mut tx = test_blob.begin().unwrap();
    tx.publish(&r).unwrap();
    let result = tx.commit();
    assert!(matches!(result, Err(AllocError::WalSubmit { .. })));
    assert_eq!(durable_state(&test_blob).unwrap(), before);
    assert_eq!(test_blob.allocated_bytes(), 64);

    // The reservation is outstanding again and can be retried.
    faulty.disarm(Fault::SubmitWal);
    let mut tx = test_blob.begin().unwrap();
    tx.publish(&r).unwrap();
    faulty.arm(Fault::SubmitWal);
    assert!(tx.commit().is_err());
    test_blob.cancel(r).unwrap();

    faulty.reset();
    let blob = test_blob.reopen();
    assert_eq!(durable_state(blob).unwrap(), before);
}

#[test]
fn failed_begin_reports_wal_reserve() {
    let (faulty, test_blob) = faulty_blob();
    faulty.arm(Fault::ReserveWalId);
    assert!(matches!(test_blob.begin(), Err(AllocError::WalReserve { .. })));
    assert_eq!(test_blob.open_transactions(), 0);

    faulty.disarm(Fault::ReserveWalId);
    commit_alloc(&test_blob, 8);
}

#[test]
fn failed_checkpoint_keeps_blob_open_and_wal_intact() {
    let (faulty, mut test_blob) = faulty_blob();
    commit_alloc(&test_blob, 64);
    commit_alloc(&test_blob, 64);

    faulty.arm(Fault::Write);
    assert!(matches!(
        test_blob.close(),
        Err(AllocError::StoreWrite { .. })
    ));
    assert!(test_blob.is_open());
    faulty.disarm(Fault::Write);

    faulty.arm(Fault::DiscardWal);
    assert!(test_blob.checkpoint().is_err());
    faulty.reset();

    let blob = test_blob.reopen();
    assert_eq!(blob.allocated_bytes(), 128);
}

#[test]
fn failed_header_read_fails_open() {
    let (faulty, mut test_blob) = faulty_blob();
    test_blob.crash();
    faulty.arm(Fault::Read);
    assert!(matches!(
        test_blob.try_reopen(),
        Err(AllocError::StoreRead { .. })
    ));
    faulty.reset();
    test_blob.reopen();
}

#[test]
fn create_discards_stale_wal() {
    let store = Arc::new(MemoryStore::new(TEST_BLOB_SIZE as usize));
    let id = store.reserve_wal_id().unwrap();
    store.submit_wal(id, b"left over from an earlier blob").unwrap();

    let blob = Blob::prepare_create(TEST_IDENTIFIER, TEST_BLOB_SIZE, test_config())
        .unwrap()
        .post_create(store.clone())
        .unwrap();
    assert_eq!(store.wal_len(), 0);
    drop(blob);

    let blob = Blob::prepare_open(TEST_IDENTIFIER)
        .unwrap()
        .post_open(store)
        .unwrap();
    assert_eq!(blob.allocated_bytes(), 0);
}

#[test]
fn torn_checkpoint_recovers_from_the_previous_header() {
    let (faulty, mut test_blob) = faulty_blob();
    for _ in 0..3 {
        commit_alloc(&test_blob, 64);
    }
    test_blob.checkpoint().unwrap();
    let tail = commit_alloc(&test_blob, 256);
    let before = durable_state(&test_blob).unwrap();

    // Arena 0's metadata block is written whole, the header slot tears.
    faulty.tear_write_after(1);
    assert!(matches!(
        test_blob.checkpoint(),
        Err(AllocError::StoreWrite { .. })
    ));
    faulty.reset();
    assert_eq!(test_blob.stats().checkpoints, 1);

    let blob = test_blob.reopen();
    assert_eq!(durable_state(blob).unwrap(), before);
    assert_eq!(blob.stats().wal_entries_replayed, 1);
    assert_eq!(blob.allocated_bytes(), 3 * 64 + 256);

    // The next checkpoint lands in the slot that tore.
    commit_free(blob, tail).unwrap();
    let before = durable_state(blob).unwrap();
    let blob = test_blob.close_and_reopen();
    assert_eq!(durable_state(blob).unwrap(), before);
    assert_eq!(blob.stats().wal_entries_replayed, 0);
}

#[test]
fn torn_metadata_write_keeps_the_previous_checkpoint() {
    let (faulty, mut test_blob) = faulty_blob();
    commit_alloc(&test_blob, 64);
    test_blob.checkpoint().unwrap();
    commit_alloc(&test_blob, 64);
    let before = durable_state(&test_blob).unwrap();

    faulty.tear_write_after(0);
    assert!(test_blob.checkpoint().is_err());
    faulty.reset();

    let blob = test_blob.reopen();
    assert_eq!(durable_state(blob).unwrap(), before);
    assert_eq!(blob.stats().wal_entries_replayed, 1);
}

#[test]
fn damaged_header_slot_falls_back_to_the_other() {
    let store = Arc::new(MemoryStore::new(TEST_BLOB_SIZE as usize));
    let mut test_blob = TestBlob::with_store(store.clone(), TEST_BLOB_SIZE, test_config());
    commit_alloc(&test_blob, 64);
    commit_alloc(&test_blob, 128);
    test_blob.crash();

    store.poke(40, &[0xFF]);
    let blob = test_blob.reopen();
    assert_eq!(blob.allocated_bytes(), 192);
    assert_eq!(blob.stats().wal_entries_replayed, 2);
}

#[test]
fn damaged_header_slots_fail_open() {
    let store = Arc::new(MemoryStore::new(TEST_BLOB_SIZE as usize));
    let mut test_blob = TestBlob::with_store(store.clone(), TEST_BLOB_SIZE, test_config());
    test_blob.close().unwrap();

    let slot = (test_config().header_size / 2) as usize;
    store.poke(40, &[0xFF]);
    store.poke(slot + 40, &[0xFF]);
    assert!(matches!(
        test_blob.try_reopen(),
        Err(AllocError::CorruptHeader { .. })
    ));
}

#[test]
fn damaged_metadata_block_fails_open() {
    let store = Arc::new(MemoryStore::new(TEST_BLOB_SIZE as usize));
    let mut test_blob = TestBlob::with_store(store.clone(), TEST_BLOB_SIZE, test_config());
    commit_alloc(&test_blob, 64);
    test_blob.close().unwrap();

    // Arena metadata blocks fill the end of the blob; arena 0 copy 0 is
    // the first of eight.
    let block = ArenaMetadata::block_size(1 << 20, 8) as usize;
    let first_block = TEST_BLOB_SIZE as usize - 8 * block;
    store.poke(first_block + 100, &[0xFF]);
    assert!(matches!(
        test_blob.try_reopen(),
        Err(AllocError::CorruptHeader { .. })
    ));
}

#[test]
fn many_allocations_still_checkpoint_and_trim_the_wal() {
    const PER_COMMIT: usize = 50;
    const COMMITS: usize = 60;

    let store = Arc::new(MemoryStore::new(TEST_BLOB_SIZE as usize));
    let mut test_blob = TestBlob::with_store(store.clone(), TEST_BLOB_SIZE, test_config());
    for _ in 0..COMMITS {
        let held: Vec<_> = (0..PER_COMMIT)
            .map(|_| test_blob.reserve(ArenaHint::Any, 8).unwrap().unwrap())
            .collect();
        let mut tx = test_blob.begin().unwrap();
        for r in &held {
            tx.publish(r).unwrap();
        }
        tx.commit().unwrap();
    }
    assert_eq!(store.wal_len(), COMMITS);

    test_blob.checkpoint().unwrap();
    assert!(test_blob.stats().checkpoints > 0);
    assert_eq!(store.wal_len(), 0);
    let before = durable_state(&test_blob).unwrap();

    let blob = test_blob.reopen();
    assert_eq!(durable_state(blob).unwrap(), before);
    assert_eq!(blob.stats().wal_entries_replayed, 0);
    assert_eq!(blob.allocated_bytes(), (PER_COMMIT * COMMITS * 8) as u64);
}

#[test]
fn file_store_survives_process_restart() {
    let mut test_blob = TestBlob::file();
    let a = commit_alloc(&test_blob, 512);
    let b = commit_alloc(&test_blob, 512);
    test_blob.checkpoint().unwrap();
    commit_free(&test_blob, a).unwrap();
    let before = durable_state(&test_blob).unwrap();

    let blob = test_blob.reload_from_disk();
    assert_eq!(durable_state(blob).unwrap(), before);
    assert_eq!(blob.stats().wal_entries_replayed, 1);
    commit_free(blob, b).unwrap();

    let blob = test_blob.reload_from_disk();
    assert_eq!(blob.allocated_bytes(), 0);
}
