#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use common::p;
use docfs::fs::{InodeTable, ROOT_INO};
use docfs::path::ObjectPath;

#[test]
fn root_is_pinned_at_one() {
    let table = InodeTable::new();
    assert_eq!(table.path_of(ROOT_INO), Some(ObjectPath::root()));
    assert_eq!(table.lookup(&ObjectPath::root()), ROOT_INO);
    assert!(!table.forget(ROOT_INO, u64::MAX));
    assert_eq!(table.path_of(ROOT_INO), Some(ObjectPath::root()));
    assert_eq!(table.len(), 1);
}

#[test]
fn lookups_are_counted_and_forget_drops_the_mapping_at_zero() {
    let table = InodeTable::new();
    let docs = p("/docs");

    let ino = table.lookup(&docs);
    assert_eq!(table.lookup(&docs), ino);
    assert_eq!(table.lookup_count(ino), Some(2));

    assert!(!table.forget(ino, 1));
    assert_eq!(table.path_of(ino), Some(docs.clone()));
    assert!(table.forget(ino, 1));
    assert_eq!(table.path_of(ino), None);
    assert_eq!(table.lookup_count(ino), None);
}

#[test]
fn numbers_are_not_reused_after_forget() {
    let table = InodeTable::new();
    let a = p("/a");

    let first = table.lookup(&a);
    assert!(table.forget(first, 1));
    let second = table.lookup(&a);
    assert_ne!(first, second);
    assert!(second > first);
}

#[test]
fn listed_entries_never_leave_mappings_behind() {
    let table = InodeTable::new();
    let dir = p("/docs");

    let listed: Vec<_> = (0..3000)
        .map(|i| table.ino_for(&dir.join(&format!("child-{i}")).unwrap()))
        .collect();
    assert_eq!(table.len(), 1, "only a kernel lookup creates a mapping");
    assert!(listed.windows(2).all(|w| w[0] < w[1]), "listed numbers are distinct");

    let a = dir.join("child-0").unwrap();
    assert_eq!(table.path_of(listed[0]), None);
    let looked_up = table.lookup(&a);
    assert_ne!(looked_up, listed[0]);
    assert_eq!(table.ino_for(&a), looked_up, "mapped entries list with their number");
    assert_eq!(table.lookup_count(looked_up), Some(1));

    assert!(table.forget(looked_up, 1));
    assert_eq!(table.len(), 1);
}

#[test]
fn forgetting_unknown_inodes_is_harmless() {
    let table = InodeTable::new();
    assert!(!table.forget(999, 1));
    assert_eq!(table.len(), 1);
}
