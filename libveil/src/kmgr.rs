use crate::block::BlockPointer;
use crate::crypto::{
    Crypto, CryptPrivateKey, CryptPublicKey, DeviceKid, ServerHalfId, TlfCryptKey,
    TlfCryptKeyServerHalf, UserId,
};
use crate::error::{VeilError, VeilResult};
use crate::handle::TlfHandle;
use crate::id::KeyGen;
use crate::identity::IdentityService;
use crate::kcache::KeyCache;
use crate::md::{RootMetadata, TlfCryptKeyInfo, TlfKeyBundle};
use crate::server::KeyServer;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Derives, caches and rotates folder keys. Holds no folder state itself;
/// everything is looked up from the metadata revision passed in.
pub struct KeyManager {
    crypto: Arc<Crypto>,
    key_cache: Arc<KeyCache>,
    keyserver: Arc<dyn KeyServer>,
    identity: Arc<dyn IdentityService>,
}

/// Outcome of a rekey attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyResult {
    /// the metadata was modified and needs to be written back
    pub changed: bool,
    /// some users' devices still need keys this caller cannot provide;
    /// another device must finish the job
    pub incomplete: bool,
}

impl KeyManager {
    pub fn new(
        crypto: Arc<Crypto>,
        key_cache: Arc<KeyCache>,
        keyserver: Arc<dyn KeyServer>,
        identity: Arc<dyn IdentityService>,
    ) -> Self {
        Self { crypto, key_cache, keyserver, identity }
    }

    /// key protecting new blocks and metadata written against `md`
    pub async fn key_for_encryption(&self, md: &RootMetadata) -> VeilResult<Option<TlfCryptKey>> {
        self.key_for_generation(md, md.latest_key_gen()).await
    }

    /// `md_to_decrypt` names the generation; `md_with_keys` carries the
    /// bundles (they differ when reading pre-rekey history through a
    /// post-rekey head)
    pub async fn key_for_md_decryption(
        &self,
        md_to_decrypt: &RootMetadata,
        md_with_keys: &RootMetadata,
    ) -> VeilResult<Option<TlfCryptKey>> {
        self.key_for_generation(md_with_keys, md_to_decrypt.latest_key_gen()).await
    }

    pub async fn key_for_block_decryption(
        &self,
        md: &RootMetadata,
        ptr: BlockPointer,
    ) -> VeilResult<Option<TlfCryptKey>> {
        self.key_for_generation(md, ptr.key_gen).await
    }

    async fn key_for_generation(
        &self,
        md_with_keys: &RootMetadata,
        key_gen: KeyGen,
    ) -> VeilResult<Option<TlfCryptKey>> {
        if key_gen == KeyGen::PUBLIC {
            return Ok(None);
        }
        let tlf = md_with_keys.tlf();
        if let Some(key) = self.key_cache.get(tlf, key_gen) {
            return Ok(Some(key));
        }

        let uid = self.crypto.uid();
        let kid = self.crypto.device_kid();
        let (info, ephemeral) = md_with_keys
            .key_info_for_device(key_gen, uid, kid)?
            .ok_or_else(|| anyhow!(VeilError::RekeyRead(tlf.to_string())))?;

        let client_half = self.crypto.open_client_half(ephemeral, &info.client_half)?;
        let server_half = self
            .keyserver
            .get_server_half(info.server_half_id, self.crypto.crypt_public_key())
            .await?;
        let key = TlfCryptKey::unmask(client_half, server_half);
        self.key_cache.put(tlf, key_gen, key);
        Ok(Some(key))
    }

    /// Bring the folder's key bundles in line with current membership and
    /// device sets. See [`RekeyResult`] for the outcome; the caller is
    /// responsible for writing the modified metadata back.
    pub async fn rekey(&self, md: &mut RootMetadata, handle: &TlfHandle) -> VeilResult<RekeyResult> {
        trace!("KeyManager::rekey(tlf: {})", md.tlf());
        ensure!(!md.is_public(), "public folders have no keys to rotate");

        // usernames may have been reclaimed since the folder was made;
        // resolve the canonical name afresh and trust the result
        let handle = TlfHandle::parse(self.identity.as_ref(), handle.canonical_name()).await?;

        let writer_devices = self.current_devices(handle.writers()).await?;
        let reader_devices = self.current_devices(handle.readers()).await?;

        let uid = self.crypto.uid();
        let caller_is_writer = handle.is_writer(uid);

        if !md.is_initialized() {
            ensure!(caller_is_writer, VeilError::WriteAccess(uid.to_string(), handle.to_string()));
            self.install_new_generation(md, &writer_devices, &reader_devices).await?;
            return Ok(RekeyResult { changed: true, incomplete: false });
        }

        let latest = md.latest_key_gen();
        let (_, removed_writers) =
            diff_devices(&writer_devices, &md.writer_key_bundle(latest)?.keys);
        let (added_readers, removed_readers) =
            diff_devices(&reader_devices, &md.reader_key_bundle(latest)?.keys);

        // a promoted reader appears as wholly removed on the reader side
        // and wholly added on the writer side; promote before adding so
        // their existing generations move over instead of being re-sealed
        let promoted: Vec<UserId> = removed_readers
            .keys()
            .filter(|uid| writer_devices.contains_key(*uid))
            .copied()
            .collect();
        for &user in &promoted {
            for gen in latest.up_to_inclusive() {
                let index = (gen.number() - 1) as usize;
                let moved = md.reader_key_bundles[index].keys.remove(&user);
                if let Some(devices) = moved {
                    md.writer_md.writer_key_bundles[index].keys.insert(user, devices);
                }
            }
        }
        let (added_writers, _) =
            diff_devices(&writer_devices, &md.writer_key_bundle(latest)?.keys);
        let removed_readers: BTreeMap<_, _> = removed_readers
            .into_iter()
            .filter(|(uid, _)| !promoted.contains(uid))
            .collect();

        let any_removal = !removed_writers.is_empty() || !removed_readers.is_empty();
        let any_addition = !added_writers.is_empty() || !added_readers.is_empty();
        let membership_changed = md.writer_md.writers != handle.writers()
            || md.readers != handle.readers();
        if !any_removal && !any_addition {
            if membership_changed || !promoted.is_empty() {
                md.writer_md.writers = handle.writers().to_vec();
                md.readers = handle.readers().to_vec();
                return Ok(RekeyResult { changed: true, incomplete: false });
            }
            return Ok(RekeyResult { changed: false, incomplete: false });
        }

        if !caller_is_writer {
            // a reader may only provision its own additional devices
            ensure!(
                handle.is_reader(uid),
                VeilError::ReadAccess(uid.to_string(), handle.to_string())
            );
            let own_added: BTreeMap<UserId, BTreeMap<DeviceKid, CryptPublicKey>> =
                added_readers.iter().filter(|(u, _)| **u == uid).map(|(u, d)| (*u, d.clone())).collect();
            ensure!(!own_added.is_empty(), VeilError::RekeyRead(handle.to_string()));
            self.add_devices_to_generations(md, &own_added, false).await?;
            let incomplete = any_removal
                || added_writers.keys().any(|u| *u != uid)
                || added_readers.keys().any(|u| *u != uid);
            return Ok(RekeyResult { changed: true, incomplete });
        }

        if any_removal {
            // device loss invalidates every old generation going forward
            self.install_new_generation(md, &writer_devices, &reader_devices).await?;
            self.delete_halves_for_removed(md, &removed_writers, &removed_readers).await?;
        } else {
            self.add_devices_to_generations(md, &added_writers, true).await?;
            self.add_devices_to_generations(md, &added_readers, false).await?;
        }
        md.writer_md.writers = handle.writers().to_vec();
        md.readers = handle.readers().to_vec();

        Ok(RekeyResult { changed: true, incomplete: false })
    }

    async fn current_devices(
        &self,
        users: &[UserId],
    ) -> VeilResult<BTreeMap<UserId, BTreeMap<DeviceKid, CryptPublicKey>>> {
        let mut out = BTreeMap::new();
        for &uid in users {
            let mut devices = BTreeMap::new();
            for key in self.identity.crypt_public_keys(uid).await? {
                devices.insert(key.kid(), key);
            }
            out.insert(uid, devices);
        }
        Ok(out)
    }

    fn seal_half_for_devices(
        &self,
        key: TlfCryptKey,
        bundle: &mut TlfKeyBundle,
        ephemeral: &CryptPrivateKey,
        ephemeral_index: usize,
        devices: &BTreeMap<UserId, BTreeMap<DeviceKid, CryptPublicKey>>,
        halves_out: &mut Vec<(UserId, DeviceKid, TlfCryptKeyServerHalf)>,
    ) -> VeilResult<()> {
        for (&uid, device_keys) in devices {
            for (&kid, &public_key) in device_keys {
                let server_half = TlfCryptKeyServerHalf::new_random();
                let client_half = key.mask(server_half);
                let sealed =
                    Crypto::seal_client_half(ephemeral, public_key, client_half, ephemeral_index)?;
                bundle.keys.entry(uid).or_default().insert(
                    kid,
                    TlfCryptKeyInfo {
                        client_half: sealed,
                        server_half_id: ServerHalfId::derive(server_half, uid, kid)?,
                    },
                );
                halves_out.push((uid, kid, server_half));
            }
        }
        Ok(())
    }

    async fn install_new_generation(
        &self,
        md: &mut RootMetadata,
        writers: &BTreeMap<UserId, BTreeMap<DeviceKid, CryptPublicKey>>,
        readers: &BTreeMap<UserId, BTreeMap<DeviceKid, CryptPublicKey>>,
    ) -> VeilResult<()> {
        let key = TlfCryptKey::new_random();
        let ephemeral = CryptPrivateKey::new_random();
        let mut halves = Vec::new();

        let mut writer_bundle = TlfKeyBundle::default();
        let windex = writer_bundle.add_ephemeral_key(ephemeral.public_key());
        self.seal_half_for_devices(key, &mut writer_bundle, &ephemeral, windex, writers, &mut halves)?;

        let mut reader_bundle = TlfKeyBundle::default();
        let rindex = reader_bundle.add_ephemeral_key(ephemeral.public_key());
        self.seal_half_for_devices(key, &mut reader_bundle, &ephemeral, rindex, readers, &mut halves)?;

        self.keyserver.put_server_halves(halves).await?;
        let key_gen = md.add_key_generation(writer_bundle, reader_bundle);
        self.key_cache.put(md.tlf(), key_gen, key);
        debug!("installed key generation {} for {}", key_gen, md.tlf());
        Ok(())
    }

    /// give additional devices access to every existing generation
    async fn add_devices_to_generations(
        &self,
        md: &mut RootMetadata,
        devices: &BTreeMap<UserId, BTreeMap<DeviceKid, CryptPublicKey>>,
        writer_side: bool,
    ) -> VeilResult<()> {
        if devices.is_empty() {
            return Ok(());
        }
        let latest = md.latest_key_gen();
        let mut halves = Vec::new();
        for gen in latest.up_to_inclusive() {
            let key = self
                .key_for_generation(md, gen)
                .await?
                .ok_or_else(|| anyhow!("missing key for generation {}", gen))?;
            let ephemeral = CryptPrivateKey::new_random();
            let index = (gen.number() - 1) as usize;
            let bundle = if writer_side {
                &mut md.writer_md.writer_key_bundles[index]
            } else {
                &mut md.reader_key_bundles[index]
            };
            let eindex = bundle.add_ephemeral_key(ephemeral.public_key());
            self.seal_half_for_devices(key, bundle, &ephemeral, eindex, devices, &mut halves)?;
        }
        self.keyserver.put_server_halves(halves).await?;
        Ok(())
    }

    async fn delete_halves_for_removed(
        &self,
        md: &RootMetadata,
        removed_writers: &BTreeMap<UserId, BTreeSet<DeviceKid>>,
        removed_readers: &BTreeMap<UserId, BTreeSet<DeviceKid>>,
    ) -> VeilResult<()> {
        // the generation just installed excludes the removed devices, so
        // only earlier bundles can name them
        let latest = md.latest_key_gen();
        for gen in latest.up_to_inclusive().take((latest.number() - 1).max(0) as usize) {
            for (bundle, removed) in [
                (md.writer_key_bundle(gen)?, removed_writers),
                (md.reader_key_bundle(gen)?, removed_readers),
            ] {
                for (&uid, kids) in removed {
                    for &kid in kids {
                        if let Some(info) = bundle.key_info_for(uid, kid) {
                            self.keyserver
                                .delete_server_half(uid, kid, info.server_half_id)
                                .await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// devices present now but absent from the bundle, and vice versa (only
/// the kid is knowable for a revoked device)
fn diff_devices(
    current: &BTreeMap<UserId, BTreeMap<DeviceKid, CryptPublicKey>>,
    bundle: &crate::md::UserDeviceKeyInfoMap,
) -> (
    BTreeMap<UserId, BTreeMap<DeviceKid, CryptPublicKey>>,
    BTreeMap<UserId, BTreeSet<DeviceKid>>,
) {
    let mut added: BTreeMap<UserId, BTreeMap<DeviceKid, CryptPublicKey>> = BTreeMap::new();
    let mut removed: BTreeMap<UserId, BTreeSet<DeviceKid>> = BTreeMap::new();

    for (&uid, devices) in current {
        let known: BTreeSet<DeviceKid> =
            bundle.get(&uid).map(|m| m.keys().copied().collect()).unwrap_or_default();
        for (&kid, &key) in devices {
            if !known.contains(&kid) {
                added.entry(uid).or_default().insert(kid, key);
            }
        }
    }
    for (&uid, infos) in bundle {
        let current_kids: BTreeSet<DeviceKid> =
            current.get(&uid).map(|m| m.keys().copied().collect()).unwrap_or_default();
        for &kid in infos.keys() {
            if !current_kids.contains(&kid) {
                removed.entry(uid).or_default().insert(kid);
            }
        }
    }
    (added, removed)
}
