use super::*;
use crate::block::{BlockInfo, BlockPointer, EntryType};
use crate::crypto::hash_bytes;
use crate::id::BlockId;
use crate::identity::LocalIdentity;
use crate::ops::Op;

async fn fixture() -> (Crypto, TlfHandle, RootMetadata) {
    let identity = LocalIdentity::new();
    let uid = identity.add_user("alice");
    let crypto = Crypto::new_random_device(uid);
    let handle = TlfHandle::parse(&identity, "alice").await.unwrap();
    let md = RootMetadata::new(TlfId::new_random(false), &handle);
    (crypto, handle, md)
}

fn ptr(n: u8) -> BlockPointer {
    BlockPointer::new_first(BlockId::new(hash_bytes([n])), KeyGen::FIRST_VALID, UserId::default())
}

fn info(n: u8, size: u32) -> BlockInfo {
    BlockInfo { ptr: ptr(n), encoded_size: size }
}

#[test]
fn test_md_flags_roundtrip() {
    let flags = MdFlags::UNMERGED | MdFlags::REKEY;
    let decoded: MdFlags = crate::codec::decode(&crate::codec::encode(&flags).unwrap()).unwrap();
    assert_eq!(decoded, flags);

    assert!(crate::codec::decode::<MdFlags>(&[0xff]).is_err());
}

#[tokio::test]
async fn test_successor_chain_validation() {
    let (crypto, _handle, mut md) = fixture().await;
    md.seal_private_md(&crypto, Some(TlfCryptKey::new_random())).unwrap();
    let signed = md.to_signed(&crypto).unwrap();
    let id = signed.md_id();

    let next = md.make_successor(id);
    assert_eq!(next.revision, Revision::new(2));
    next.is_valid_successor(id, &md).unwrap();

    // wrong prev id
    let err = next.is_valid_successor(MdId::new(hash_bytes(b"bogus")), &md).unwrap_err();
    assert!(format!("{}", err).contains("prev-root"));

    // skipped revision
    let mut skipped = next.make_successor(id);
    skipped.revision = Revision::new(9);
    assert!(skipped.is_valid_successor(id, &md).is_err());
}

#[tokio::test]
async fn test_successor_disk_usage_must_add_up() {
    let (crypto, _handle, mut md) = fixture().await;
    md.seal_private_md(&crypto, Some(TlfCryptKey::new_random())).unwrap();
    let id = md.to_signed(&crypto).unwrap().md_id();

    let mut next = md.make_successor(id);
    next.add_op(Op::sync(crate::ops::BlockUpdate::new(ptr(1), ptr(2))));
    next.add_ref_block(info(2, 100));
    next.is_valid_successor(id, &md).unwrap();

    next.writer_md.disk_usage += 7;
    assert!(next.is_valid_successor(id, &md).is_err());
}

#[tokio::test]
async fn test_ref_unref_accounting() {
    let (_crypto, _handle, mut md) = fixture().await;
    md.add_op(Op::sync(crate::ops::BlockUpdate::new(ptr(1), ptr(2))));
    md.add_ref_block(info(2, 100));
    md.add_unref_block(info(3, 40));
    md.add_update_block(info(4, 10), info(5, 25));
    // dirty unrefs are never charged
    md.add_unref_block(info(6, 0));

    assert_eq!(md.writer_md.ref_bytes, 125);
    assert_eq!(md.writer_md.unref_bytes, 80);
    assert_eq!(md.writer_md.disk_usage, 45);

    let common = md.data.changes.ops.last().unwrap().common();
    assert_eq!(common.refs.len(), 1);
    assert_eq!(common.unrefs.len(), 1);
    assert_eq!(common.updates.len(), 1);
}

#[tokio::test]
async fn test_private_md_seal_open_roundtrip() {
    let (crypto, _handle, mut md) = fixture().await;
    let key = TlfCryptKey::new_random();
    md.data.dir.entry.entry_type = EntryType::Dir;
    md.data.dir.entry.size = 123;
    let want = md.data.clone();

    md.seal_private_md(&crypto, Some(key)).unwrap();
    md.data = PrivateMetadata::default();
    md.open_private_md(&crypto, Some(key)).unwrap();
    assert_eq!(md.data, want);

    assert!(md.open_private_md(&crypto, Some(TlfCryptKey::new_random())).is_err());
}

#[tokio::test]
async fn test_signed_md_verification_and_identity() {
    let (crypto, _handle, mut md) = fixture().await;
    md.seal_private_md(&crypto, Some(TlfCryptKey::new_random())).unwrap();
    md.sign_writer_md(&crypto).unwrap();
    md.verify_writer_md().unwrap();

    let signed = md.to_signed(&crypto).unwrap();
    signed.verify().unwrap();

    // the id is a pure function of the bytes
    assert_eq!(signed.md_id(), signed.md_id());
    let mut tampered = signed.clone();
    tampered.md_bytes[0] ^= 1;
    assert_ne!(tampered.md_id(), signed.md_id());
    assert!(tampered.verify().is_err());

    let decoded = signed.decode().unwrap();
    assert_eq!(decoded.revision, md.revision);
    assert_eq!(decoded.writer_md.writers, md.writer_md.writers);
}

#[tokio::test]
async fn test_key_info_lookup() {
    let (crypto, _handle, mut md) = fixture().await;
    let uid = crypto.uid();
    let kid = crypto.device_kid();

    let ephemeral = crate::crypto::CryptPrivateKey::new_random();
    let key = TlfCryptKey::new_random();
    let server_half = crate::crypto::TlfCryptKeyServerHalf::new_random();
    let client_half = key.mask(server_half);

    let mut writers = TlfKeyBundle::default();
    let index = writers.add_ephemeral_key(ephemeral.public_key());
    let enc =
        Crypto::seal_client_half(&ephemeral, crypto.crypt_public_key(), client_half, index)
            .unwrap();
    writers.keys.entry(uid).or_default().insert(
        kid,
        TlfCryptKeyInfo {
            client_half: enc,
            server_half_id: ServerHalfId::derive(server_half, uid, kid).unwrap(),
        },
    );
    let key_gen = md.add_key_generation(writers, TlfKeyBundle::default());
    assert_eq!(key_gen, KeyGen::FIRST_VALID);
    assert_eq!(md.latest_key_gen(), KeyGen::FIRST_VALID);

    let (key_info, ephemeral_public) =
        md.key_info_for_device(key_gen, uid, kid).unwrap().unwrap();
    let opened = crypto.open_client_half(ephemeral_public, &key_info.client_half).unwrap();
    assert_eq!(TlfCryptKey::unmask(opened, server_half), key);

    assert!(md
        .key_info_for_device(key_gen, UserId::new_random(), kid)
        .unwrap()
        .is_none());
    assert!(md.key_info_for_device(KeyGen::new(2), uid, kid).is_err());
}
