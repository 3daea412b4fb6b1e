use super::*;
use crate::actions::CrAction;
use crate::block::EntryType;
use crate::crypto::{hash_bytes, UserId};
use crate::id::{BlockId, KeyGen};

fn ptr(n: u8) -> BlockPointer {
    BlockPointer::new_first(
        BlockId::new(hash_bytes([n])),
        KeyGen::FIRST_VALID,
        UserId::new_random(),
    )
}

fn update(a: u8, b: u8) -> BlockUpdate {
    BlockUpdate::new(ptr(a), ptr(b))
}

fn renamer() -> WriterDateConflictRenamer {
    WriterDateConflictRenamer::new("u2", chrono::Utc::now())
}

#[test]
fn test_all_updates_includes_op_specific_update() {
    let mut op = Op::create(update(1, 2), "f", EntryType::File);
    op.common_mut().add_update(ptr(3), ptr(4));
    let updates = op.all_updates();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1], update(1, 2));
}

#[test]
fn test_create_inverts_to_rm() {
    let op = Op::create(update(1, 2), "f", EntryType::Exec);
    match op.invert() {
        Op::Rm(rm) => {
            assert_eq!(rm.old_name, "f");
            assert_eq!(rm.removed_type, EntryType::Exec);
            assert_eq!(rm.dir, update(2, 1));
        }
        other => panic!("expected rm, got {}", other),
    }
}

#[test]
fn test_invert_is_an_involution_on_sync() {
    let mut op = Op::sync(update(1, 2));
    if let Op::Sync(sync) = &mut op {
        sync.add_write(0, 10);
        sync.add_truncate(5);
        sync.common.add_ref_block(ptr(5));
        sync.common.add_unref_block(ptr(6));
    }
    assert_eq!(op.invert().invert(), op);
}

#[test]
fn test_rename_invert_swaps_directions() {
    let op = Op::rename(update(1, 2), "old", Some(update(3, 4)), "new", ptr(5), EntryType::File);
    match op.invert() {
        Op::Rename(inv) => {
            assert_eq!(inv.old_name, "new");
            assert_eq!(inv.new_name, "old");
            assert_eq!(inv.old_dir, update(4, 3));
            assert_eq!(inv.new_dir, Some(update(2, 1)));
        }
        other => panic!("expected rename, got {}", other),
    }
}

#[test]
fn test_create_create_conflict_renames_unmerged_file() {
    let unmerged = Op::create(update(1, 2), "f", EntryType::File);
    let merged = Op::create(update(3, 4), "f", EntryType::File);
    match unmerged.check_conflict(&renamer(), &merged, false, "dir") {
        Some(CrAction::RenameUnmerged { from, to }) => {
            assert_eq!(from, "f");
            assert!(to.starts_with("f.conflict.u2."));
        }
        other => panic!("unexpected action {:?}", other),
    }
}

#[test]
fn test_create_create_conflict_keeps_unmerged_dir() {
    let unmerged = Op::create(update(1, 2), "d", EntryType::Dir);
    let merged = Op::create(update(3, 4), "d", EntryType::File);
    assert!(matches!(
        unmerged.check_conflict(&renamer(), &merged, false, "dir"),
        Some(CrAction::RenameMerged { .. })
    ));
}

#[test]
fn test_two_dir_creates_do_not_conflict() {
    let unmerged = Op::create(update(1, 2), "d", EntryType::Dir);
    let merged = Op::create(update(3, 4), "d", EntryType::Dir);
    assert_eq!(unmerged.check_conflict(&renamer(), &merged, false, "dir"), None);
}

#[test]
fn test_sync_sync_conflict_renames_unmerged_copy() {
    let unmerged = Op::sync(update(1, 2));
    let merged = Op::sync(update(3, 4));
    match unmerged.check_conflict(&renamer(), &merged, true, "b") {
        Some(CrAction::RenameUnmerged { from, to }) => {
            assert_eq!(from, "b");
            assert!(to.starts_with("b.conflict.u2."));
        }
        other => panic!("unexpected action {:?}", other),
    }
}

#[test]
fn test_unrelated_names_do_not_conflict() {
    let unmerged = Op::create(update(1, 2), "f", EntryType::File);
    let merged = Op::create(update(3, 4), "g", EntryType::File);
    assert_eq!(unmerged.check_conflict(&renamer(), &merged, false, "dir"), None);
}

#[test]
fn test_conflict_rename_format_is_rfc3339() {
    let ts = chrono::DateTime::parse_from_rfc3339("2016-03-14T09:26:53.589793238Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let renamer = WriterDateConflictRenamer::new("u2", ts);
    assert_eq!(
        renamer.conflict_rename("b"),
        "b.conflict.u2.2016-03-14T09:26:53.589793238Z"
    );
}
