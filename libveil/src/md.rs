use crate::block::{BlockInfo, BlockPointer, DirEntry};
use crate::codec;
use crate::crypto::{
    Crypto, CryptPublicKey, DeviceKid, EncryptedClientHalf, SealedBytes, ServerHalfId, SigInfo,
    TlfCryptKey, UserId,
};
use crate::error::{VeilError, VeilResult};
use crate::handle::TlfHandle;
use crate::id::{BranchId, KeyGen, MdId, Revision, TlfId};
use crate::ops::Op;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

bitflags! {
    pub struct MdFlags: u8 {
        const UNMERGED = 1 << 0;
        const REKEY = 1 << 1;
        /// set when a revision reuses its predecessor's writer metadata
        /// verbatim (e.g. a reader-initiated rekey)
        const WRITER_METADATA_COPIED = 1 << 2;
    }
}

impl Serialize for MdFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for MdFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        MdFlags::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid md flags {:#x}", bits)))
    }
}

impl Default for MdFlags {
    fn default() -> Self {
        MdFlags::empty()
    }
}

/// What one device needs to recover the folder key of one generation: its
/// encrypted client half and where the matching server half lives.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct TlfCryptKeyInfo {
    pub client_half: EncryptedClientHalf,
    pub server_half_id: ServerHalfId,
}

pub type DeviceKeyInfoMap = BTreeMap<DeviceKid, TlfCryptKeyInfo>;
pub type UserDeviceKeyInfoMap = BTreeMap<UserId, DeviceKeyInfoMap>;

/// Per-generation key bundle for one side (writers or readers) of a
/// folder's membership.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct TlfKeyBundle {
    pub keys: UserDeviceKeyInfoMap,
    /// ephemeral public keys indexed by `EncryptedClientHalf::ephemeral_index`
    pub ephemeral_keys: Vec<CryptPublicKey>,
}

impl TlfKeyBundle {
    pub fn key_info_for(&self, uid: UserId, kid: DeviceKid) -> Option<&TlfCryptKeyInfo> {
        self.keys.get(&uid).and_then(|devices| devices.get(&kid))
    }

    pub fn add_ephemeral_key(&mut self, key: CryptPublicKey) -> usize {
        self.ephemeral_keys.push(key);
        self.ephemeral_keys.len() - 1
    }
}

/// The ordered list of ops a revision performs, embedded in the private
/// metadata unless its encoding grows past the embed threshold, in which
/// case it moves to its own block and only the pointer stays.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockChanges {
    pub ops: Vec<Op>,
    /// set iff the ops live in an external block
    pub info: Option<BlockInfo>,
}

impl BlockChanges {
    pub fn is_externalized(&self) -> bool {
        self.info.is_some()
    }

    pub fn encoded_len(&self) -> VeilResult<u64> {
        codec::encoded_len(&self.ops)
    }
}

/// The plaintext a folder's key protects: the root entry and the op log of
/// this revision.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct PrivateMetadata {
    pub dir: DirEntry,
    pub changes: BlockChanges,
}

/// The half of a revision signed by the writing device.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct WriterMetadata {
    pub tlf: TlfId,
    pub branch: BranchId,
    /// encoded [`SealedBytes`] for private folders, encoded
    /// [`PrivateMetadata`] for public ones
    pub serialized_private_md: Vec<u8>,
    pub writers: Vec<UserId>,
    pub unresolved_writers: Vec<String>,
    pub writer_key_bundles: Vec<TlfKeyBundle>,
    pub disk_usage: u64,
    pub ref_bytes: u64,
    pub unref_bytes: u64,
}

/// A single metadata revision. The serialized form is what gets signed and
/// hashed into successors' `prev_root`; the decrypted private metadata is
/// carried alongside in memory only.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct RootMetadata {
    pub writer_md: WriterMetadata,
    /// signature over the encoded writer metadata by the writer's device
    pub writer_sig: SigInfo,
    pub readers: Vec<UserId>,
    pub unresolved_readers: Vec<String>,
    pub reader_key_bundles: Vec<TlfKeyBundle>,
    pub flags: MdFlags,
    pub revision: Revision,
    pub prev_root: MdId,
    pub last_modifying_writer: UserId,
    pub last_modifying_user: UserId,
    /// nanoseconds since the epoch, set by the last modifying client
    pub timestamp: i64,

    /// decrypted private metadata; never serialized
    #[serde(skip)]
    pub data: PrivateMetadata,
}

impl RootMetadata {
    pub fn new(tlf: TlfId, handle: &TlfHandle) -> Self {
        Self {
            writer_md: WriterMetadata {
                tlf,
                branch: BranchId::NULL,
                serialized_private_md: Vec::new(),
                writers: handle.writers().to_vec(),
                unresolved_writers: Vec::new(),
                writer_key_bundles: Vec::new(),
                disk_usage: 0,
                ref_bytes: 0,
                unref_bytes: 0,
            },
            writer_sig: SigInfo::default(),
            readers: handle.readers().to_vec(),
            unresolved_readers: Vec::new(),
            reader_key_bundles: Vec::new(),
            flags: MdFlags::empty(),
            revision: Revision::INITIAL,
            prev_root: MdId::NULL,
            last_modifying_writer: UserId::default(),
            last_modifying_user: UserId::default(),
            timestamp: 0,
            data: PrivateMetadata::default(),
        }
    }

    #[inline]
    pub fn tlf(&self) -> TlfId {
        self.writer_md.tlf
    }

    #[inline]
    pub fn branch(&self) -> BranchId {
        self.writer_md.branch
    }

    #[inline]
    pub fn is_public(&self) -> bool {
        self.tlf().is_public()
    }

    #[inline]
    pub fn is_unmerged(&self) -> bool {
        self.flags.contains(MdFlags::UNMERGED)
    }

    #[inline]
    pub fn is_rekey(&self) -> bool {
        self.flags.contains(MdFlags::REKEY)
    }

    #[inline]
    pub fn is_writer_metadata_copied(&self) -> bool {
        self.flags.contains(MdFlags::WRITER_METADATA_COPIED)
    }

    pub fn is_initialized(&self) -> bool {
        self.latest_key_gen().is_valid()
    }

    /// the newest key generation this revision carries bundles for
    pub fn latest_key_gen(&self) -> KeyGen {
        if self.is_public() {
            KeyGen::PUBLIC
        } else {
            KeyGen::new(self.writer_md.writer_key_bundles.len() as i32)
        }
    }

    pub fn is_writer(&self, uid: UserId) -> bool {
        self.writer_md.writers.contains(&uid)
    }

    pub fn is_reader(&self, uid: UserId) -> bool {
        self.is_public() || self.is_writer(uid) || self.readers.contains(&uid)
    }

    fn bundle_index(key_gen: KeyGen) -> VeilResult<usize> {
        ensure!(
            key_gen.number() >= KeyGen::FIRST_VALID.number(),
            VeilError::KeyGenNotFound(key_gen)
        );
        Ok((key_gen.number() - 1) as usize)
    }

    pub fn writer_key_bundle(&self, key_gen: KeyGen) -> VeilResult<&TlfKeyBundle> {
        self.writer_md
            .writer_key_bundles
            .get(Self::bundle_index(key_gen)?)
            .ok_or_else(|| anyhow!(VeilError::KeyGenNotFound(key_gen)))
    }

    pub fn reader_key_bundle(&self, key_gen: KeyGen) -> VeilResult<&TlfKeyBundle> {
        self.reader_key_bundles
            .get(Self::bundle_index(key_gen)?)
            .ok_or_else(|| anyhow!(VeilError::KeyGenNotFound(key_gen)))
    }

    /// locate the key material one device needs for one generation,
    /// together with the ephemeral public key it was sealed against
    pub fn key_info_for_device(
        &self,
        key_gen: KeyGen,
        uid: UserId,
        kid: DeviceKid,
    ) -> VeilResult<Option<(TlfCryptKeyInfo, CryptPublicKey)>> {
        for bundle in [self.writer_key_bundle(key_gen)?, self.reader_key_bundle(key_gen)?] {
            if let Some(info) = bundle.key_info_for(uid, kid) {
                let ephemeral = *bundle
                    .ephemeral_keys
                    .get(info.client_half.ephemeral_index)
                    .ok_or_else(|| anyhow!("ephemeral key index out of range"))?;
                return Ok(Some((info.clone(), ephemeral)));
            }
        }
        Ok(None)
    }

    pub fn add_key_generation(&mut self, writers: TlfKeyBundle, readers: TlfKeyBundle) -> KeyGen {
        self.writer_md.writer_key_bundles.push(writers);
        self.reader_key_bundles.push(readers);
        self.latest_key_gen()
    }

    // ---- op/refcount bookkeeping during a write ----

    pub fn add_op(&mut self, op: Op) {
        self.data.changes.ops.push(op);
    }

    pub fn cur_op_mut(&mut self) -> &mut Op {
        self.data.changes.ops.last_mut().expect("no op started on this revision")
    }

    pub fn add_ref_block(&mut self, info: BlockInfo) {
        self.writer_md.ref_bytes += u64::from(info.encoded_size);
        self.writer_md.disk_usage += u64::from(info.encoded_size);
        self.cur_op_mut().common_mut().add_ref_block(info.ptr);
    }

    pub fn add_unref_block(&mut self, info: BlockInfo) {
        if info.encoded_size > 0 {
            self.writer_md.unref_bytes += u64::from(info.encoded_size);
            self.writer_md.disk_usage -= u64::from(info.encoded_size);
            self.cur_op_mut().common_mut().add_unref_block(info.ptr);
        }
    }

    pub fn add_update_block(&mut self, old: BlockInfo, new: BlockInfo) {
        if old.encoded_size > 0 {
            self.writer_md.ref_bytes += u64::from(new.encoded_size);
            self.writer_md.unref_bytes += u64::from(old.encoded_size);
            self.writer_md.disk_usage += u64::from(new.encoded_size);
            self.writer_md.disk_usage -= u64::from(old.encoded_size);
            let op = self.cur_op_mut();
            if !op.note_update(old.ptr, new.ptr) {
                op.common_mut().add_update(old.ptr, new.ptr);
            }
        } else {
            // first sync of a freshly created block: it was never charged,
            // so the rewrite reduces to a plain new reference
            self.writer_md.ref_bytes += u64::from(new.encoded_size);
            self.writer_md.disk_usage += u64::from(new.encoded_size);
            let op = self.cur_op_mut();
            op.note_update(old.ptr, new.ptr);
            op.common_mut().add_ref_block(new.ptr);
        }
    }

    /// Start the next revision from this one. Clears per-revision byte
    /// counters and the op log; key bundles and disk usage carry over.
    pub fn make_successor(&self, own_id: MdId) -> Self {
        let mut next = self.clone();
        next.revision = self.revision.next();
        next.prev_root = own_id;
        next.flags.remove(MdFlags::REKEY);
        next.flags.remove(MdFlags::WRITER_METADATA_COPIED);
        next.writer_md.ref_bytes = 0;
        next.writer_md.unref_bytes = 0;
        next.writer_md.serialized_private_md = Vec::new();
        next.writer_sig = SigInfo::default();
        next.data.changes = BlockChanges::default();
        next
    }

    /// Is `self` the revision that comes directly after `prev`?
    pub fn is_valid_successor(&self, prev_id: MdId, prev: &RootMetadata) -> VeilResult<()> {
        ensure!(
            self.tlf() == prev.tlf(),
            VeilError::MdMismatch(self.revision, "successor changes folder id".to_owned())
        );
        ensure!(
            self.revision == prev.revision.next(),
            VeilError::MdMismatch(
                self.revision,
                format!("revision {} does not follow {}", self.revision, prev.revision)
            )
        );
        ensure!(
            self.prev_root == prev_id,
            VeilError::MdMismatch(self.revision, "prev-root hash does not match".to_owned())
        );
        ensure!(
            self.writer_md.disk_usage + self.writer_md.unref_bytes
                == prev.writer_md.disk_usage + self.writer_md.ref_bytes,
            VeilError::MdMismatch(self.revision, "disk usage does not add up".to_owned())
        );
        Ok(())
    }

    // ---- private metadata encryption ----

    pub fn seal_private_md(&mut self, crypto: &Crypto, key: Option<TlfCryptKey>) -> VeilResult<()> {
        let plaintext = codec::encode(&self.data)?;
        self.writer_md.serialized_private_md = match key {
            None => {
                ensure!(self.is_public(), "refusing to store plaintext metadata in a private folder");
                plaintext
            }
            Some(key) => codec::encode(&crypto.seal_with_key(key, &plaintext)?)?,
        };
        Ok(())
    }

    pub fn open_private_md(&mut self, crypto: &Crypto, key: Option<TlfCryptKey>) -> VeilResult<()> {
        let bytes = &self.writer_md.serialized_private_md;
        ensure!(!bytes.is_empty(), "metadata revision has no private metadata");
        self.data = match key {
            None => codec::decode(bytes)?,
            Some(key) => {
                let sealed: SealedBytes = codec::decode(bytes)?;
                codec::decode(&crypto.open_with_key(key, &sealed)?)?
            }
        };
        Ok(())
    }

    /// can the local process read the folder contents of this revision?
    pub fn is_readable(&self) -> bool {
        self.is_public() || self.data.dir.ptr().is_valid()
    }

    // ---- signing ----

    pub fn sign_writer_md(&mut self, crypto: &Crypto) -> VeilResult<()> {
        let bytes = codec::encode(&self.writer_md)?;
        self.writer_sig = crypto.sign(&bytes);
        Ok(())
    }

    pub fn verify_writer_md(&self) -> VeilResult<()> {
        ensure!(!self.writer_sig.is_empty(), VeilError::BadSignature("unsigned writer metadata".into()));
        let bytes = codec::encode(&self.writer_md)?;
        self.writer_sig.verifying_key.verify(&bytes, &self.writer_sig)
    }

    pub fn to_signed(&self, crypto: &Crypto) -> VeilResult<SignedMd> {
        let md_bytes = codec::encode(self)?;
        let sig = crypto.sign(&md_bytes);
        Ok(SignedMd { md_bytes, sig })
    }
}

/// The wire form of a revision: the exact serialized metadata bytes plus
/// the whole-MD signature. Keeping the bytes verbatim keeps `md_id` stable
/// across decode/encode round trips.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct SignedMd {
    pub md_bytes: Vec<u8>,
    pub sig: SigInfo,
}

impl SignedMd {
    pub fn md_id(&self) -> MdId {
        MdId::new(crate::crypto::hash_bytes(&self.md_bytes))
    }

    pub fn decode(&self) -> VeilResult<RootMetadata> {
        codec::decode(&self.md_bytes)
    }

    pub fn verify(&self) -> VeilResult<()> {
        ensure!(!self.sig.is_empty(), VeilError::BadSignature("unsigned metadata".into()));
        self.sig.verifying_key.verify(&self.md_bytes, &self.sig)
    }
}

/// A decoded revision paired with its wire identity.
#[derive(Clone, Debug)]
pub struct MdWithId {
    pub md: RootMetadata,
    pub id: MdId,
}

#[cfg(test)]
mod tests;
