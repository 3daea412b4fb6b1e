use super::*;
use crate::block::{DirBlock, EntryType};
use crate::error::{VeilError, VeilErrorExt};
use crate::id::RefNonce;
use crate::md::RootMetadata;
use crate::test_utils::{GatedBlockServer, TestUniverse};

async fn fixture() -> (TestUniverse, Arc<crate::config::VeilConfig>, RootMetadata) {
    let universe = TestUniverse::new();
    let device = universe.add_user("alice");
    let config = universe.config_for(&device);
    let handle = universe.handle("alice").await;
    let mut md = RootMetadata::new(TlfId::new_random(false), &handle);
    config.kmgr().rekey(&mut md, &handle).await.unwrap();
    (universe, config, md)
}

fn file_block(contents: &[u8]) -> Block {
    Block::File(FileBlock { contents: contents.to_vec(), ..Default::default() })
}

#[tokio::test]
async fn test_ready_put_get_roundtrip() {
    let (_universe, config, md) = fixture().await;
    let bops = config.bops();
    let block = file_block(b"some file contents");

    let (id, plain_size, ready) = bops.ready(&md, &block).await.unwrap();
    assert!(plain_size > 0);
    assert!(ready.encoded_size() > 0);

    let ptr = BlockPointer::new_first(id, md.latest_key_gen(), config.uid());
    bops.put(md.tlf(), ptr, &ready).await.unwrap();

    let fetched = bops.get(&md, ptr).await.unwrap();
    assert_eq!(fetched, block);
}

#[tokio::test]
async fn test_get_verifies_ciphertext_hash() {
    let (universe, config, md) = fixture().await;
    let bops = config.bops();
    let block = file_block(b"contents");
    let (id, _plain, ready) = bops.ready(&md, &block).await.unwrap();

    // store the ciphertext under an unrelated id, bypassing the client
    let bogus = BlockId::new(hash_bytes(b"not the ciphertext"));
    let ptr = BlockPointer::new_first(bogus, md.latest_key_gen(), config.uid());
    universe
        .bserver
        .put(md.tlf(), bogus, ptr.into(), ready.sealed.clone(), ready.half)
        .await
        .unwrap();

    let err = bops.get(&md, ptr).await.unwrap_err();
    assert!(matches!(err.into_veil_error().unwrap(), VeilError::HashMismatch(..)));
    let _ = id;
}

#[tokio::test]
async fn test_blocks_are_unreadable_without_the_folder_key() {
    let (universe, config, md) = fixture().await;
    let block = file_block(b"secret bytes");
    let (id, _plain, ready) = config.bops().ready(&md, &block).await.unwrap();
    let ptr = BlockPointer::new_first(id, md.latest_key_gen(), config.uid());
    config.bops().put(md.tlf(), ptr, &ready).await.unwrap();

    // a different user with no bundle entry cannot open it
    let outsider = universe.add_user("eve");
    let outsider_config = universe.config_for(&outsider);
    let err = outsider_config.bops().get(&md, ptr).await.unwrap_err();
    assert!(err.is_rekey_read_err());
}

#[tokio::test]
async fn test_dir_blocks_roundtrip() {
    let (_universe, config, md) = fixture().await;
    let mut dir = DirBlock::default();
    dir.children.insert(
        "child".to_owned(),
        crate::block::DirEntry::new(
            crate::block::BlockInfo::default(),
            crate::block::EntryInfo::new(EntryType::File, 7),
        ),
    );
    let block = Block::Dir(dir);

    let (id, _plain, ready) = config.bops().ready(&md, &block).await.unwrap();
    let ptr = BlockPointer::new_first(id, md.latest_key_gen(), config.uid());
    config.bops().put(md.tlf(), ptr, &ready).await.unwrap();
    assert_eq!(config.bops().get(&md, ptr).await.unwrap(), block);
}

fn put_state_of(
    config: &crate::config::VeilConfig,
    md: &RootMetadata,
    readied: Vec<(BlockId, Block, ReadyBlockData)>,
) -> BlockPutState {
    let mut state = BlockPutState::new();
    for (id, block, ready) in readied {
        let ptr = BlockPointer::new_first(id, md.latest_key_gen(), config.uid());
        state.add_new_block(ptr, block, ready);
    }
    state
}

#[tokio::test]
async fn test_do_block_puts_uploads_everything() {
    let (universe, config, md) = fixture().await;
    let mut readied = Vec::new();
    for i in 0..25u8 {
        let block = file_block(&[i; 8]);
        let (id, _plain, ready) = config.bops().ready(&md, &block).await.unwrap();
        readied.push((id, block, ready));
    }
    let state = put_state_of(&config, &md, readied);

    let cancel = CancellationToken::new();
    let (recoverable, result) = config.bops().do_block_puts(&cancel, md.tlf(), &state).await;
    result.unwrap();
    assert!(recoverable.is_empty());
    assert_eq!(universe.bserver.num_blocks(), 25);
}

#[tokio::test]
async fn test_do_block_puts_collects_recoverable_failures() {
    let (universe, config, md) = fixture().await;

    let good = file_block(b"good");
    let (good_id, _plain, good_ready) = config.bops().ready(&md, &good).await.unwrap();

    // a dedup reference to a block that never made it to the server is
    // the canonical recoverable race
    let phantom = file_block(b"phantom");
    let (phantom_id, _plain, phantom_ready) =
        config.bops().ready(&md, &phantom).await.unwrap();
    let mut state = BlockPutState::new();
    state.add_new_block(
        BlockPointer::new_first(good_id, md.latest_key_gen(), config.uid()),
        good.clone(),
        good_ready,
    );
    let mut phantom_ptr = BlockPointer::new_first(phantom_id, md.latest_key_gen(), config.uid());
    phantom_ptr.ref_nonce = RefNonce::new_random();
    state.add_new_block(phantom_ptr, phantom.clone(), phantom_ready);

    let cancel = CancellationToken::new();
    let (recoverable, result) = config.bops().do_block_puts(&cancel, md.tlf(), &state).await;
    let err = result.unwrap_err();
    assert!(err.is_recoverable_block_err());
    assert_eq!(recoverable, vec![match phantom {
        Block::File(file) => file,
        Block::Dir(..) => unreachable!(),
    }]);
    assert!(cancel.is_cancelled());
    let _ = universe;
}

#[tokio::test]
async fn test_cancellation_stops_in_flight_and_queued_puts() {
    let universe = TestUniverse::new();
    let device = universe.add_user("alice");
    let gated = GatedBlockServer::new(Arc::clone(&universe.bserver) as Arc<dyn BlockServer>);
    let gated_for_config = Arc::clone(&gated);
    let config = universe.config_for_with(&device, move |mdserver, _bserver| {
        (mdserver, gated_for_config as Arc<dyn BlockServer>)
    });
    let handle = universe.handle("alice").await;
    let mut md = RootMetadata::new(TlfId::new_random(false), &handle);
    config.kmgr().rekey(&mut md, &handle).await.unwrap();
    gated.hold_after(2);

    let mut state = BlockPutState::new();
    for i in 0..(2 + MAX_PARALLEL_BLOCK_PUTS + 3) {
        let block = file_block(&[i as u8; 4]);
        let (id, _plain, ready) = config.bops().ready(&md, &block).await.unwrap();
        state.add_new_block(
            BlockPointer::new_first(id, md.latest_key_gen(), config.uid()),
            block,
            ready,
        );
    }

    let cancel = CancellationToken::new();
    let put_fut = config.bops().do_block_puts(&cancel, md.tlf(), &state);
    tokio::pin!(put_fut);

    // let the two free puts through and park the rest
    let cancel_task = {
        let cancel = cancel.clone();
        let gated = Arc::clone(&gated);
        tokio::spawn(async move {
            while gated.puts_finished.load(std::sync::atomic::Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
            cancel.cancel();
        })
    };

    let (_recoverable, result) = put_fut.await;
    cancel_task.await.unwrap();
    let err = result.unwrap_err();
    assert!(err.is_cancelled_err());

    // exactly the two ungated blocks landed; nothing further was picked up
    assert_eq!(universe.bserver.num_blocks(), 2);
}
