use super::*;
use crate::error::VeilErrorExt;
use crate::server::MdServer;
use crate::test_utils::{
    CountingMdServer, GatedBlockServer, GatedMdServer, TestDevice, TestUniverse,
};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

async fn engine_for(
    universe: &TestUniverse,
    device: &TestDevice,
    name: &str,
) -> Arc<FolderEngine> {
    let config = universe.config_for(device);
    FolderEngine::new(config, universe.handle(name).await).await.unwrap()
}

async fn wait_for_rev(engine: &Arc<FolderEngine>, rev: u64) {
    let mut rx = engine.head_rev_receiver();
    tokio::time::timeout(WAIT, async {
        while rx.borrow_and_update().number() < rev {
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for revision {}", rev));
}

async fn wait_until_unstaged(engine: &Arc<FolderEngine>) {
    tokio::time::timeout(WAIT, async {
        while engine.status().await.staged {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("conflict resolution never completed");
}

#[tokio::test]
async fn test_create_write_sync_read_roundtrip() {
    let universe = TestUniverse::new();
    let alice = universe.add_user("alice");
    let engine = engine_for(&universe, &alice, "alice").await;

    let file = engine.create_file(engine.root(), "f", false).await.unwrap();
    engine.write(file, b"hi", 0).await.unwrap();

    // dirty reads see the unsynced bytes
    assert_eq!(engine.read(file, 0, 10).await.unwrap(), b"hi");
    assert!(engine.status().await.is_dirty());

    engine.sync(file).await.unwrap();
    assert!(!engine.status().await.is_dirty());
    assert_eq!(engine.read(file, 0, 10).await.unwrap(), b"hi");

    // a fresh engine (cold caches) reads the same bytes off the servers
    let fresh = engine_for(&universe, &alice, "alice").await;
    let (node, info) = fresh.lookup(fresh.root(), "f").await.unwrap();
    assert_eq!(info.size, 2);
    assert_eq!(fresh.read(node.unwrap(), 0, 10).await.unwrap(), b"hi");
}

#[tokio::test]
async fn test_multi_block_files_roundtrip() {
    let universe = TestUniverse::new();
    let alice = universe.add_user("alice");
    let engine = engine_for(&universe, &alice, "alice").await;

    // block size is 5 in the test config; this write spans three blocks
    let data: Vec<u8> = (1..=12).collect();
    let file = engine.create_file(engine.root(), "f", false).await.unwrap();
    engine.write(file, &data, 0).await.unwrap();
    engine.sync(file).await.unwrap();

    let fresh = engine_for(&universe, &alice, "alice").await;
    let (node, info) = fresh.lookup(fresh.root(), "f").await.unwrap();
    assert_eq!(info.size, 12);
    assert_eq!(fresh.read(node.unwrap(), 0, 64).await.unwrap(), data);
    // offset reads cross block boundaries
    assert_eq!(fresh.read(node.unwrap(), 4, 4).await.unwrap(), [5, 6, 7, 8]);
}

#[tokio::test]
async fn test_truncate_shrinks_and_extends() {
    let universe = TestUniverse::new();
    let alice = universe.add_user("alice");
    let engine = engine_for(&universe, &alice, "alice").await;

    let file = engine.create_file(engine.root(), "f", false).await.unwrap();
    engine.write(file, &(1..=12).collect::<Vec<u8>>(), 0).await.unwrap();
    engine.truncate(file, 7).await.unwrap();
    assert_eq!(engine.read(file, 0, 64).await.unwrap(), [1, 2, 3, 4, 5, 6, 7]);

    engine.truncate(file, 9).await.unwrap();
    assert_eq!(engine.read(file, 0, 64).await.unwrap(), [1, 2, 3, 4, 5, 6, 7, 0, 0]);

    engine.sync(file).await.unwrap();
    let fresh = engine_for(&universe, &alice, "alice").await;
    let (node, _) = fresh.lookup(fresh.root(), "f").await.unwrap();
    assert_eq!(fresh.read(node.unwrap(), 0, 64).await.unwrap(), [1, 2, 3, 4, 5, 6, 7, 0, 0]);
}

#[tokio::test]
async fn test_directory_tree_operations() {
    let universe = TestUniverse::new();
    let alice = universe.add_user("alice");
    let engine = engine_for(&universe, &alice, "alice").await;
    let root = engine.root();

    let dir = engine.create_dir(root, "d").await.unwrap();
    let file = engine.create_file(root, "f", false).await.unwrap();
    engine.create_link(root, "l", "f").await.unwrap();
    engine.write(file, b"data", 0).await.unwrap();
    engine.sync(file).await.unwrap();

    let mut names: Vec<String> =
        engine.children(root).await.unwrap().into_iter().map(|(n, _)| n).collect();
    names.sort();
    assert_eq!(names, ["d", "f", "l"]);

    let (sym_node, sym_info) = engine.lookup(root, "l").await.unwrap();
    assert!(sym_node.is_none());
    assert_eq!(sym_info.sym_path, "f");

    // move f into d under a new name
    engine.rename(root, "f", dir, "g").await.unwrap();
    assert!(engine.lookup(root, "f").await.is_err());
    let (moved, _) = engine.lookup(dir, "g").await.unwrap();
    assert_eq!(engine.read(moved.unwrap(), 0, 16).await.unwrap(), b"data");
    // the node survived the move
    assert_eq!(moved.unwrap(), file);

    engine.remove_file(dir, "g").await.unwrap();
    assert!(engine.lookup(dir, "g").await.is_err());

    // removing a non-empty directory fails, an empty one succeeds
    let sub = engine.create_dir(dir, "sub").await.unwrap();
    engine.create_file(sub, "x", false).await.unwrap();
    assert!(engine.remove_dir(dir, "sub").await.is_err());
    engine.remove_file(sub, "x").await.unwrap();
    engine.remove_dir(dir, "sub").await.unwrap();
}

#[tokio::test]
async fn test_reserved_names_are_rejected() {
    let universe = TestUniverse::new();
    let alice = universe.add_user("alice");
    let engine = engine_for(&universe, &alice, "alice").await;

    let err = engine.create_file(engine.root(), ".veil.status", false).await.unwrap_err();
    assert!(matches!(
        err.into_veil_error().unwrap(),
        crate::error::VeilError::DisallowedPrefix(..)
    ));

    engine.create_file(engine.root(), "ok", false).await.unwrap();
    let err = engine.create_file(engine.root(), "ok", false).await.unwrap_err();
    assert!(matches!(err.into_veil_error().unwrap(), crate::error::VeilError::NameExists(..)));
}

#[tokio::test]
async fn test_updates_propagate_between_devices() {
    let universe = TestUniverse::new();
    let u1 = universe.add_user("u1");
    let u2 = universe.add_user("u2");
    let e1 = engine_for(&universe, &u1, "u1,u2").await;
    let e2 = engine_for(&universe, &u2, "u1,u2").await;

    let file = e1.create_file(e1.root(), "shared", false).await.unwrap();
    e1.write(file, b"from u1", 0).await.unwrap();
    e1.sync(file).await.unwrap();
    let rev = e1.status().await.head_revision.number();

    wait_for_rev(&e2, rev).await;
    let (node, _) = e2.lookup(e2.root(), "shared").await.unwrap();
    assert_eq!(e2.read(node.unwrap(), 0, 64).await.unwrap(), b"from u1");
}

// concurrent cold reads dedupe into a single head fetch
#[tokio::test]
async fn test_concurrent_reads_share_one_head_fetch() {
    let universe = TestUniverse::new();
    let alice = universe.add_user("alice");

    let counting =
        CountingMdServer::new(Arc::new(universe.mdserver.logged_in_as(
            alice.uid(),
            alice.crypto.device_kid(),
        )) as Arc<dyn MdServer>);
    let counting_for_config = Arc::clone(&counting);
    let config = universe.config_for_with(&alice, move |_mdserver, bserver| {
        (counting_for_config as Arc<dyn MdServer>, bserver)
    });
    let engine = FolderEngine::new(config, universe.handle("alice").await).await.unwrap();

    let file = engine.create_file(engine.root(), "f", false).await.unwrap();
    engine.write(file, b"x", 0).await.unwrap();
    engine.sync(file).await.unwrap();

    let after_setup = counting.head_gets.load(std::sync::atomic::Ordering::SeqCst);

    // ten concurrent readers all resolve against the cached head
    let reads = (0..10).map(|_| engine.read(file, 0, 1));
    let results = futures::future::join_all(reads).await;
    for result in results {
        assert_eq!(result.unwrap(), b"x");
    }
    assert_eq!(
        counting.head_gets.load(std::sync::atomic::Ordering::SeqCst),
        after_setup,
        "reads must not refetch the head"
    );
}

// a read during a blocked sync sees the dirty bytes
#[tokio::test]
async fn test_read_during_sync() {
    let universe = TestUniverse::new();
    let alice = universe.add_user("alice");
    let gated = GatedMdServer::new(Arc::new(
        universe.mdserver.logged_in_as(alice.uid(), alice.crypto.device_kid()),
    ) as Arc<dyn MdServer>);
    let gated_for_config = Arc::clone(&gated);
    let config = universe.config_for_with(&alice, move |_mdserver, bserver| {
        (gated_for_config as Arc<dyn MdServer>, bserver)
    });
    let engine = FolderEngine::new(config, universe.handle("alice").await).await.unwrap();

    let file = engine.create_file(engine.root(), "f", false).await.unwrap();
    engine.write(file, &[0x01], 0).await.unwrap();

    let attempts_before = gated.put_attempts.load(std::sync::atomic::Ordering::SeqCst);
    gated.hold();
    let sync_task = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.sync(file).await })
    };
    gated.wait_for_attempts(attempts_before + 1).await;

    // the sync is frozen at the metadata server; reads still work
    assert_eq!(engine.read(file, 0, 1).await.unwrap(), [0x01]);

    gated.release_all();
    sync_task.await.unwrap().unwrap();
    assert_eq!(engine.read(file, 0, 1).await.unwrap(), [0x01]);
}

// writes during a blocked multi-block sync are deferred but
// immediately visible
#[tokio::test]
async fn test_write_during_sync_multi_block() {
    let universe = TestUniverse::new();
    let alice = universe.add_user("alice");
    let gated = GatedMdServer::new(Arc::new(
        universe.mdserver.logged_in_as(alice.uid(), alice.crypto.device_kid()),
    ) as Arc<dyn MdServer>);
    let gated_for_config = Arc::clone(&gated);
    let config = universe.config_for_with(&alice, move |_mdserver, bserver| {
        (gated_for_config as Arc<dyn MdServer>, bserver)
    });
    let engine = FolderEngine::new(config, universe.handle("alice").await).await.unwrap();

    let file = engine.create_file(engine.root(), "f", false).await.unwrap();
    engine.write(file, &(1..=10).collect::<Vec<u8>>(), 0).await.unwrap();
    engine.sync(file).await.unwrap();

    engine.write(file, &[11, 12], 0).await.unwrap();

    let attempts_before = gated.put_attempts.load(std::sync::atomic::Ordering::SeqCst);
    gated.hold();
    let sync_task = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.sync(file).await })
    };
    gated.wait_for_attempts(attempts_before + 1).await;

    // a write to a block the sync is not uploading, while it is blocked
    engine.write(file, &[20], 9).await.unwrap();
    assert_eq!(
        engine.read(file, 0, 10).await.unwrap(),
        [11, 12, 3, 4, 5, 6, 7, 8, 9, 20]
    );

    gated.release_all();
    sync_task.await.unwrap().unwrap();
    assert_eq!(
        engine.read(file, 0, 10).await.unwrap(),
        [11, 12, 3, 4, 5, 6, 7, 8, 9, 20]
    );

    // the deferred write syncs cleanly afterwards
    engine.sync(file).await.unwrap();
    assert!(!engine.status().await.is_dirty());
    let fresh = engine_for(&universe, &alice, "alice").await;
    let (node, _) = fresh.lookup(fresh.root(), "f").await.unwrap();
    assert_eq!(
        fresh.read(node.unwrap(), 0, 10).await.unwrap(),
        [11, 12, 3, 4, 5, 6, 7, 8, 9, 20]
    );
}

// cancelling a sync mid-fan-out uploads nothing further and
// leaves the file dirty with no new revision
#[tokio::test]
async fn test_parallel_put_cancellation() {
    let universe = TestUniverse::new();
    let alice = universe.add_user("alice");
    let gated = GatedBlockServer::new(Arc::clone(&universe.bserver) as Arc<dyn crate::server::BlockServer>);
    let gated_for_config = Arc::clone(&gated);
    let config = universe.config_for_with(&alice, move |mdserver, _bserver| {
        (mdserver, gated_for_config as Arc<dyn crate::server::BlockServer>)
    });
    let engine = FolderEngine::new(config, universe.handle("alice").await).await.unwrap();

    let file = engine.create_file(engine.root(), "f", false).await.unwrap();
    let blocks = 2 + crate::bops::MAX_PARALLEL_BLOCK_PUTS + 3;
    let data = vec![0x5a_u8; blocks * 5];
    engine.write(file, &data, 0).await.unwrap();

    let rev_before = engine.status().await.head_revision;
    let blocks_before = universe.bserver.num_blocks();

    gated.hold_after(2);
    let cancel = CancellationToken::new();
    let sync_task = {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.sync_cancellable(file, &cancel).await })
    };
    gated.wait_for_finished(2).await;
    cancel.cancel();

    let err = sync_task.await.unwrap().unwrap_err();
    assert!(err.is_cancelled_err());

    // exactly the two ungated puts landed
    assert_eq!(universe.bserver.num_blocks(), blocks_before + 2);
    // no new revision, and the file is still dirty locally
    let status = engine.status().await;
    assert_eq!(status.head_revision, rev_before);
    assert!(status.is_dirty());

    // with the gate released the retry goes through
    gated.release_all();
    engine.sync(file).await.unwrap();
    assert!(!engine.status().await.is_dirty());
    assert_eq!(engine.read(file, 0, data.len()).await.unwrap(), data);
}

// a conflicting writer stays staged on its own branch until
// it unstages, even across a restart
#[tokio::test]
async fn test_unmerged_after_restart() {
    let universe = TestUniverse::new();
    let u1 = universe.add_user("u1");
    let u2 = universe.add_user("u2");

    let e1 = engine_for(&universe, &u1, "u1,u2").await;
    let file1 = e1.create_file(e1.root(), "a", false).await.unwrap();
    let e2 = engine_for(&universe, &u2, "u1,u2").await;

    // isolate u1 before the fork
    e1.pause_updates();
    e1.set_cr_enabled(false);

    let (node2, _) = e2.lookup(e2.root(), "a").await.unwrap();
    let file2 = node2.unwrap();
    e2.write(file2, &[2], 0).await.unwrap();
    e2.sync(file2).await.unwrap();

    e1.write(file1, &[1], 0).await.unwrap();
    e1.sync(file1).await.unwrap();

    let s1 = e1.status().await;
    assert!(s1.staged);
    assert!(!s1.branch.is_null());
    assert_eq!(s1.head_writer, u1.uid());
    let s2 = e2.status().await;
    assert!(!s2.staged);
    assert_eq!(s2.head_writer, u2.uid());

    // restart both devices with fresh engines and cold caches
    let config1 = universe.config_for(&u1);
    config1.set_default_cr_enabled(false);
    let e1b = FolderEngine::new(config1, universe.handle("u1,u2").await).await.unwrap();
    let e2b = engine_for(&universe, &u2, "u1,u2").await;

    assert!(e1b.status().await.staged);
    let (n1, _) = e1b.lookup(e1b.root(), "a").await.unwrap();
    assert_eq!(e1b.read(n1.unwrap(), 0, 8).await.unwrap(), [1]);
    let (n2, _) = e2b.lookup(e2b.root(), "a").await.unwrap();
    assert_eq!(e2b.read(n2.unwrap(), 0, 8).await.unwrap(), [2]);

    // unstaging abandons u1's divergent write
    e1b.unstage().await.unwrap();
    let s1b = e1b.status().await;
    assert!(!s1b.staged);
    assert!(s1b.branch.is_null());
    assert_eq!(s1b.head_writer, u2.uid());

    let (n1, _) = e1b.lookup(e1b.root(), "a").await.unwrap();
    assert_eq!(e1b.read(n1.unwrap(), 0, 8).await.unwrap(), [2]);
    assert_eq!(e2b.read(n2.unwrap(), 0, 8).await.unwrap(), [2]);
}

// divergent writes to one file resolve by keeping both
// copies, the loser under a conflict name
#[tokio::test]
async fn test_cr_file_rename_on_conflict() {
    let universe = TestUniverse::new();
    let u1 = universe.add_user("u1");
    let u2 = universe.add_user("u2");

    let e1 = engine_for(&universe, &u1, "u1,u2").await;
    let dir1 = e1.create_dir(e1.root(), "a").await.unwrap();
    let file1 = e1.create_file(dir1, "b", false).await.unwrap();

    let e2 = engine_for(&universe, &u2, "u1,u2").await;
    let (dir2, _) = e2.lookup(e2.root(), "a").await.unwrap();
    let dir2 = dir2.unwrap();
    let (file2, _) = e2.lookup(dir2, "b").await.unwrap();
    let file2 = file2.unwrap();

    // u2 stops listening, then both sides write b
    e2.pause_updates();

    e1.write(file1, &[1, 2, 3, 4, 5], 0).await.unwrap();
    e1.sync(file1).await.unwrap();

    e2.write(file2, &[5, 4, 3, 2, 1], 0).await.unwrap();
    e2.sync(file2).await.unwrap();

    // u2 forked; conflict resolution brings it back
    wait_until_unstaged(&e2).await;
    e2.resume_updates();

    let resolved_rev = e2.status().await.head_revision.number();
    wait_for_rev(&e1, resolved_rev).await;

    let expected_conflict_prefix = "b.conflict.u2.";
    for engine in [&e1, &e2] {
        let (a_node, _) = engine.lookup(engine.root(), "a").await.unwrap();
        let mut names: Vec<String> = engine
            .children(a_node.unwrap())
            .await
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        assert_eq!(names.len(), 2, "expected both copies, got {:?}", names);
        assert_eq!(names[0], "b");
        assert!(
            names[1].starts_with(expected_conflict_prefix),
            "unexpected conflict name {}",
            names[1]
        );
    }

    // contents: the merged winner is u1's, the conflict copy is u2's
    let (a_node, _) = e2.lookup(e2.root(), "a").await.unwrap();
    let children = e2.children(a_node.unwrap()).await.unwrap();
    for (name, _) in children {
        let (node, _) = e2.lookup(a_node.unwrap(), &name).await.unwrap();
        let contents = e2.read(node.unwrap(), 0, 8).await.unwrap();
        if name == "b" {
            assert_eq!(contents, [1, 2, 3, 4, 5]);
        } else {
            assert_eq!(contents, [5, 4, 3, 2, 1]);
        }
    }
}

#[tokio::test]
async fn test_rekey_provisions_new_device() {
    let universe = TestUniverse::new();
    let alice = universe.add_user("alice");
    let engine = engine_for(&universe, &alice, "alice").await;
    let file = engine.create_file(engine.root(), "f", false).await.unwrap();
    engine.write(file, b"secret", 0).await.unwrap();
    engine.sync(file).await.unwrap();

    // a second device cannot read yet
    let second = universe.add_device(alice.uid());
    let config2 = universe.config_for(&second);
    let err = FolderEngine::new(config2, universe.handle("alice").await).await.unwrap_err();
    assert!(err.is_rekey_read_err());

    // the first device provisions it
    engine.rekey().await.unwrap();

    let e2 = engine_for(&universe, &second, "alice").await;
    let (node, _) = e2.lookup(e2.root(), "f").await.unwrap();
    assert_eq!(e2.read(node.unwrap(), 0, 16).await.unwrap(), b"secret");
}

#[tokio::test]
async fn test_shutdown_refuses_while_dirty() {
    let universe = TestUniverse::new();
    let alice = universe.add_user("alice");
    let engine = engine_for(&universe, &alice, "alice").await;
    let file = engine.create_file(engine.root(), "f", false).await.unwrap();
    engine.write(file, b"x", 0).await.unwrap();

    let err = engine.shutdown().await.unwrap_err();
    assert!(matches!(
        err.into_veil_error().unwrap(),
        crate::error::VeilError::DirtyWhileShutdown
    ));
}
