#![allow(clippy::unwrap_used, clippy::similar_names, missing_docs)]

mod common;

use std::sync::Arc;

use common::{handle, Harness};
use metad::cache::dirent::{add_dirent, lookup_dirent, remove_dirent, rename_entry};
use metad::cache::entry::DIR_SLOT_COUNT;
use metad::cache::lifecycle::kill;
use metad::cache::{CacheError, CacheKey, Payload};

fn populated_dir(harness: &Harness, tag: &str, children: usize) -> Arc<metad::cache::CacheEntry> {
    let dir = harness.create_dir(tag);
    for i in 0..children {
        let child = harness.create_file(&format!("{tag}-child-{i}"), i as u64);
        add_dirent(
            &harness.client,
            &harness.table,
            &dir,
            &format!("child-{i}"),
            &child,
            &harness.ctx(),
        )
        .unwrap();
    }
    dir
}

#[test]
fn overflow_grows_a_continuation_chain_in_order() {
    let harness = Harness::with_pool(256, 512, 64);
    let children = DIR_SLOT_COUNT * 2 + 6;
    let dir = populated_dir(&harness, "big", children);

    for position in 1..=2u64 {
        let key = CacheKey::for_continuation(handle("big"), position);
        let segment = harness.table.lookup(&key).unwrap();
        let state = segment.lock();
        match &state.payload {
            Payload::DirectoryContinuation(data) => {
                assert_eq!(data.position, position);
                let head = data.head.upgrade().unwrap();
                assert!(Arc::ptr_eq(&head, &dir), "segments back-link to the head");
            }
            other => panic!("expected a continuation, got {:?}", other.entry_type()),
        }
    }

    let head_state = dir.lock();
    match &head_state.payload {
        Payload::DirectoryHead(data) => {
            assert_eq!(data.nb_cont, 2);
            assert_eq!(data.nb_active, DIR_SLOT_COUNT);
            assert!(data.first_cont.is_some());
            assert!(data.last_segment.is_some());
        }
        other => panic!("expected a head, got {:?}", other.entry_type()),
    }
}

#[test]
fn lookup_searches_the_whole_chain() {
    let harness = Harness::with_pool(256, 512, 64);
    let children = DIR_SLOT_COUNT + 10;
    let dir = populated_dir(&harness, "deep", children);

    // One from the head segment, one from the continuation.
    let early = lookup_dirent(&dir, "child-3").unwrap();
    assert_eq!(early.lock().payload.attributes().unwrap().size, 3);

    let late_index = DIR_SLOT_COUNT + 5;
    let late = lookup_dirent(&dir, &format!("child-{late_index}")).unwrap();
    assert_eq!(
        late.lock().payload.attributes().unwrap().size,
        late_index as u64
    );

    assert!(lookup_dirent(&dir, "no-such-name").is_none());
}

#[test]
fn removed_names_stop_resolving_and_slots_are_reused() {
    let harness = Harness::new();
    let dir = populated_dir(&harness, "small", 4);

    let removed = remove_dirent(&dir, "child-2").unwrap();
    assert_eq!(removed.lock().payload.attributes().unwrap().size, 2);
    assert!(lookup_dirent(&dir, "child-2").is_none());

    // The freed slot takes the next insertion; no continuation appears.
    let fresh = harness.create_file("late", 99);
    add_dirent(
        &harness.client,
        &harness.table,
        &dir,
        "late",
        &fresh,
        &harness.ctx(),
    )
    .unwrap();
    assert!(lookup_dirent(&dir, "late").is_some());
    assert!(harness
        .table
        .lookup(&CacheKey::for_continuation(handle("small"), 1))
        .is_none());
}

#[test]
fn remove_of_a_missing_name_is_not_found() {
    let harness = Harness::new();
    let dir = harness.create_dir("bare");
    assert_eq!(
        remove_dirent(&dir, "ghost").unwrap_err(),
        CacheError::NotFound
    );
}

#[test]
fn killing_a_child_invalidates_its_parent_slot() {
    let harness = Harness::new();
    let dir = harness.create_dir("home");
    let child = harness.create_file("doomed", 1);
    add_dirent(
        &harness.client,
        &harness.table,
        &dir,
        "doomed",
        &child,
        &harness.ctx(),
    )
    .unwrap();

    // Pretend a full listing was materialized; the kill must clear it.
    {
        let mut state = dir.lock();
        if let Payload::DirectoryHead(data) = &mut state.payload {
            data.has_been_readdir = true;
        }
    }

    kill(&harness.client, &harness.table, &child).unwrap();

    assert!(lookup_dirent(&dir, "doomed").is_none());
    let state = dir.lock();
    match &state.payload {
        Payload::DirectoryHead(data) => {
            assert_eq!(data.nb_active, 0);
            assert!(!data.has_been_readdir);
        }
        other => panic!("expected a head, got {:?}", other.entry_type()),
    }
}

#[test]
fn failed_rename_keeps_the_source_binding() {
    // Two dir blocks cover the two heads; growing a chain for the
    // destination has nothing left to draw from.
    let harness = Harness::with_pool(64, 128, 2);
    let src = harness.create_dir("origin");
    let dst = populated_dir(&harness, "crowded", DIR_SLOT_COUNT);
    let precious = harness.create_file("precious", 1);
    add_dirent(
        &harness.client,
        &harness.table,
        &src,
        "precious",
        &precious,
        &harness.ctx(),
    )
    .unwrap();

    let err = rename_entry(
        &harness.client,
        &harness.table,
        &src,
        "precious",
        &dst,
        "precious",
        &harness.ctx(),
    )
    .unwrap_err();
    assert!(matches!(err, CacheError::Allocation(_)));

    let survivor =
        lookup_dirent(&src, "precious").expect("source binding must survive a failed rename");
    assert!(Arc::ptr_eq(&survivor, &precious));
    assert!(lookup_dirent(&dst, "precious").is_none());
}

#[test]
fn killing_the_head_takes_the_chain_down_first() {
    let harness = Harness::with_pool(256, 512, 64);
    let free_dir_blocks = harness.pool.free_dir_blocks();
    let dir = populated_dir(&harness, "condemned", DIR_SLOT_COUNT + 8);

    kill(&harness.client, &harness.table, &dir).unwrap();

    assert!(harness
        .table
        .lookup(&CacheKey::start(handle("condemned")))
        .is_none());
    assert!(harness
        .table
        .lookup(&CacheKey::for_continuation(handle("condemned"), 1))
        .is_none());
    assert_eq!(harness.pool.free_dir_blocks(), free_dir_blocks);
}
