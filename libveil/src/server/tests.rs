use super::*;
use crate::crypto::{Crypto, SealedBytes, TlfCryptKey};
use crate::error::{VeilError, VeilErrorExt, VeilResultExt};
use crate::handle::TlfHandle;
use crate::id::{BlockId, BranchId, Revision, TlfId};
use crate::identity::LocalIdentity;
use crate::md::{MdFlags, RootMetadata, SignedMd};
use crate::crypto::hash_bytes;
use rustc_hash::FxHashMap;
use std::sync::Arc;

struct Fixture {
    identity: LocalIdentity,
    crypto: Crypto,
    handle: TlfHandle,
    mdserver: MdServerLocal,
    bserver: BlockServerLocal,
    key: TlfCryptKey,
}

async fn fixture() -> Fixture {
    let identity = LocalIdentity::new();
    let uid = identity.add_user("alice");
    let crypto = Crypto::new_random_device(uid);
    identity.add_device(uid, crypto.crypt_public_key(), crypto.verifying_key());
    let handle = TlfHandle::parse(&identity, "alice").await.unwrap();
    let store: Arc<dyn KvStore> = Arc::new(MemKv::new());
    let mdserver = MdServerLocal::new(Arc::clone(&store)).logged_in_as(uid, crypto.device_kid());
    let bserver = BlockServerLocal::new(store);
    Fixture { identity, crypto, handle, mdserver, bserver, key: TlfCryptKey::new_random() }
}

fn sign(fx: &Fixture, md: &mut RootMetadata) -> SignedMd {
    md.last_modifying_writer = fx.crypto.uid();
    md.last_modifying_user = fx.crypto.uid();
    md.seal_private_md(&fx.crypto, Some(fx.key)).unwrap();
    md.sign_writer_md(&fx.crypto).unwrap();
    md.to_signed(&fx.crypto).unwrap()
}

fn ctx(nonce_zero: bool) -> BlockContext {
    BlockContext {
        creator: crate::crypto::UserId::new_random(),
        writer: None,
        ref_nonce: if nonce_zero {
            crate::id::RefNonce::ZERO
        } else {
            crate::id::RefNonce::new_random()
        },
    }
}

fn sealed(bytes: &[u8]) -> SealedBytes {
    SealedBytes { nonce: [0; 24], data: bytes.to_vec() }
}

#[tokio::test]
async fn test_bserver_put_get_roundtrip() {
    let fx = fixture().await;
    let tlf = TlfId::new_random(false);
    let id = BlockId::new(hash_bytes(b"cipher"));
    let half = crate::crypto::BlockCryptKeyServerHalf::new_random();

    fx.bserver.put(tlf, id, ctx(true), sealed(b"cipher"), half).await.unwrap();
    let (data, got_half) = fx.bserver.get(tlf, id, ctx(true)).await.unwrap();
    assert_eq!(data, sealed(b"cipher"));
    assert_eq!(got_half, half);
    assert_eq!(fx.bserver.num_blocks(), 1);

    // put of the same id is idempotent and does not add a reference
    fx.bserver.put(tlf, id, ctx(true), sealed(b"cipher"), half).await.unwrap();
    assert_eq!(fx.bserver.num_live_refs(), 1);

    // nonzero nonce puts are rejected
    assert!(fx.bserver.put(tlf, id, ctx(false), sealed(b"cipher"), half).await.is_err());
}

#[tokio::test]
async fn test_bserver_reference_lifecycle() {
    let fx = fixture().await;
    let tlf = TlfId::new_random(false);
    let id = BlockId::new(hash_bytes(b"x"));
    let half = crate::crypto::BlockCryptKeyServerHalf::new_random();
    fx.bserver.put(tlf, id, ctx(true), sealed(b"x"), half).await.unwrap();

    let dedup = ctx(false);
    fx.bserver.add_reference(tlf, id, dedup).await.unwrap();
    assert_eq!(fx.bserver.num_live_refs(), 2);

    // archive the original reference; adding is still possible while the
    // dedup reference is live
    let mut archive = FxHashMap::default();
    archive.insert(id, vec![ctx(true)]);
    fx.bserver.archive_references(tlf, archive).await.unwrap();
    assert_eq!(fx.bserver.num_live_refs(), 1);

    let mut archive_rest = FxHashMap::default();
    archive_rest.insert(id, vec![dedup]);
    fx.bserver.archive_references(tlf, archive_rest).await.unwrap();
    let err = fx.bserver.add_reference(tlf, id, ctx(false)).await.unwrap_err();
    assert!(matches!(err.into_veil_error().unwrap(), VeilError::BlockArchived(..)));

    // removing every reference deletes the data but keeps the tombstone
    let mut remove = FxHashMap::default();
    remove.insert(id, vec![ctx(true), dedup]);
    fx.bserver.remove_references(tlf, remove).await.unwrap();
    assert_eq!(fx.bserver.num_blocks(), 0);
    let err = fx.bserver.get(tlf, id, ctx(true)).await.unwrap_err();
    assert!(matches!(err.into_veil_error().unwrap(), VeilError::BlockDeleted(..)));

    let missing = BlockId::new(hash_bytes(b"never-put"));
    let err = fx.bserver.get(tlf, missing, ctx(true)).await.unwrap_err();
    assert!(matches!(err.into_veil_error().unwrap(), VeilError::BlockNonExistent(..)));
}

#[tokio::test]
async fn test_mdserver_allocates_fresh_tlf_id() {
    let fx = fixture().await;
    let (tlf, md) = fx.mdserver.get_for_handle(&fx.handle, MdStatus::Merged).await.unwrap();
    assert!(md.is_none());
    assert!(tlf.is_valid());
    assert!(!tlf.is_public());

    // same handle resolves to the same id
    let (again, _) = fx.mdserver.get_for_handle(&fx.handle, MdStatus::Merged).await.unwrap();
    assert_eq!(again, tlf);
}

#[tokio::test]
async fn test_mdserver_put_and_conflicts() {
    let fx = fixture().await;
    let (tlf, _) = fx.mdserver.get_for_handle(&fx.handle, MdStatus::Merged).await.unwrap();

    let mut md1 = RootMetadata::new(tlf, &fx.handle);
    let signed1 = sign(&fx, &mut md1);
    let id1 = signed1.md_id();
    fx.mdserver.put(signed1).await.unwrap();

    // a second revision-1 put conflicts
    let mut dup = RootMetadata::new(tlf, &fx.handle);
    let err = fx.mdserver.put(sign(&fx, &mut dup)).await.unwrap_err();
    assert!(err.is_conflict_err());

    // a successor with the wrong prev root conflicts
    let mut bad_prev = md1.make_successor(crate::id::MdId::new(hash_bytes(b"bogus")));
    let err = fx.mdserver.put(sign(&fx, &mut bad_prev)).await.unwrap_err();
    assert!(matches!(err.into_veil_error().unwrap(), VeilError::ConflictPrevRoot));

    // the well-formed successor lands
    let mut md2 = md1.make_successor(id1);
    fx.mdserver.put(sign(&fx, &mut md2)).await.unwrap();

    let head = fx
        .mdserver
        .get_for_tlf(tlf, BranchId::NULL, MdStatus::Merged)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.decode().unwrap().revision, Revision::new(2));

    let range = fx
        .mdserver
        .get_range(tlf, BranchId::NULL, MdStatus::Merged, Revision::INITIAL, Revision::new(10))
        .await
        .unwrap();
    assert_eq!(range.len(), 2);
}

#[tokio::test]
async fn test_mdserver_rejects_non_writer() {
    let fx = fixture().await;
    let mallory = fx.identity.add_user("mallory");
    let mallory_crypto = Crypto::new_random_device(mallory);
    let (tlf, _) = fx.mdserver.get_for_handle(&fx.handle, MdStatus::Merged).await.unwrap();

    let mut md = RootMetadata::new(tlf, &fx.handle);
    md.last_modifying_writer = mallory;
    md.last_modifying_user = mallory;
    md.seal_private_md(&mallory_crypto, Some(fx.key)).unwrap();
    md.sign_writer_md(&mallory_crypto).unwrap();
    let signed = md.to_signed(&mallory_crypto).unwrap();

    let server = fx.mdserver.logged_in_as(mallory, mallory_crypto.device_kid());
    let err = server.put(signed).await.unwrap_err();
    assert!(matches!(err.into_veil_error().unwrap(), VeilError::Unauthorized));
}

#[tokio::test]
async fn test_mdserver_unmerged_branch_and_prune() {
    let fx = fixture().await;
    let (tlf, _) = fx.mdserver.get_for_handle(&fx.handle, MdStatus::Merged).await.unwrap();

    let mut md1 = RootMetadata::new(tlf, &fx.handle);
    let signed1 = sign(&fx, &mut md1);
    let id1 = signed1.md_id();
    fx.mdserver.put(signed1).await.unwrap();

    let bid = BranchId::new_random();
    let mut unmerged = md1.make_successor(id1);
    unmerged.writer_md.branch = bid;
    unmerged.flags.insert(MdFlags::UNMERGED);
    fx.mdserver.put(sign(&fx, &mut unmerged)).await.unwrap();

    // a null-branch unmerged query finds this device's branch
    let found = fx
        .mdserver
        .get_for_tlf(tlf, BranchId::NULL, MdStatus::Unmerged)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.decode().unwrap().branch(), bid);

    fx.mdserver.prune_branch(tlf, bid).await.unwrap();
    assert!(fx
        .mdserver
        .get_for_tlf(tlf, BranchId::NULL, MdStatus::Unmerged)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_mdserver_update_registration() {
    let fx = fixture().await;
    let (tlf, _) = fx.mdserver.get_for_handle(&fx.handle, MdStatus::Merged).await.unwrap();

    let signal = fx.mdserver.register_for_update(tlf, Revision::UNINITIALIZED).await.unwrap();

    let mut md1 = RootMetadata::new(tlf, &fx.handle);
    fx.mdserver.put(sign(&fx, &mut md1)).await.unwrap();
    signal.await.unwrap();

    // registering behind the head fires immediately
    let signal = fx.mdserver.register_for_update(tlf, Revision::UNINITIALIZED).await.unwrap();
    signal.await.unwrap();
}

#[tokio::test]
async fn test_kserver_release_rules() {
    let fx = fixture().await;
    let store: Arc<dyn KvStore> = Arc::new(MemKv::new());
    let uid = fx.crypto.uid();
    let kserver = KeyServerLocal::new(store).logged_in_as(uid);

    let half = crate::crypto::TlfCryptKeyServerHalf::new_random();
    let kid = fx.crypto.device_kid();
    kserver.put_server_halves(vec![(uid, kid, half)]).await.unwrap();

    let id = crate::crypto::ServerHalfId::derive(half, uid, kid).unwrap();
    let got = kserver.get_server_half(id, fx.crypto.crypt_public_key()).await.unwrap();
    assert_eq!(got, half);

    // another device of any user cannot fetch it
    let other = Crypto::new_random_device(uid);
    assert!(kserver.get_server_half(id, other.crypt_public_key()).await.is_err());

    kserver.delete_server_half(uid, kid, id).await.unwrap();
    assert!(kserver.get_server_half(id, fx.crypto.crypt_public_key()).await.is_err());
}
