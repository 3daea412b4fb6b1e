use crate::codec;
use crate::crypto::{DeviceKid, UserId};
use crate::error::{VeilError, VeilResult};
use crate::handle::TlfHandle;
use crate::id::{BranchId, MdId, Revision, TlfId};
use crate::md::{RootMetadata, SignedMd};
use crate::server::kvstore::KvStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum MdStatus {
    Merged,
    Unmerged,
}

/// Fires once when the folder has a merged revision at or past the
/// registered threshold; consumers re-register after every signal.
pub type UpdateSignal = oneshot::Receiver<()>;

/// Linearizes metadata revisions. Never sees plaintext: it validates
/// signatures, chain shape and permissions, nothing else.
#[async_trait]
pub trait MdServer: Send + Sync {
    /// `None` metadata means the folder is brand new; the returned id is
    /// then freshly allocated and owned by the first writer to put to it.
    async fn get_for_handle(
        &self,
        handle: &TlfHandle,
        status: MdStatus,
    ) -> VeilResult<(TlfId, Option<SignedMd>)>;

    /// head of the given branch; a null branch with `Unmerged` status means
    /// "this device's unmerged branch, whichever it is"
    async fn get_for_tlf(
        &self,
        tlf: TlfId,
        branch: BranchId,
        status: MdStatus,
    ) -> VeilResult<Option<SignedMd>>;

    async fn get_range(
        &self,
        tlf: TlfId,
        branch: BranchId,
        status: MdStatus,
        start: Revision,
        stop: Revision,
    ) -> VeilResult<Vec<SignedMd>>;

    async fn put(&self, signed: SignedMd) -> VeilResult<()>;

    async fn prune_branch(&self, tlf: TlfId, branch: BranchId) -> VeilResult<()>;

    async fn register_for_update(&self, tlf: TlfId, curr: Revision) -> VeilResult<UpdateSignal>;
}

const HANDLE_TABLE: &str = "handles";
const MD_TABLE: &str = "md";
const REVISION_TABLE: &str = "revisions";

/// head pointers live at the revision-zero sentinel key
const HEAD_SENTINEL: Revision = Revision::UNINITIALIZED;

struct Waiter {
    tlf: TlfId,
    threshold: Revision,
    sender: oneshot::Sender<()>,
}

struct Inner {
    store: Arc<dyn KvStore>,
    waiters: Mutex<Vec<Waiter>>,
}

/// KV-backed metadata server. Cloning [`MdServerLocal::logged_in_as`]
/// binds the shared state to one device, the way a session would on a real
/// server.
#[derive(Clone)]
pub struct MdServerLocal {
    inner: Arc<Inner>,
    uid: UserId,
    kid: DeviceKid,
}

impl MdServerLocal {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            inner: Arc::new(Inner { store, waiters: Mutex::new(Vec::new()) }),
            uid: UserId::default(),
            kid: DeviceKid::from_public_key_bytes(&[]),
        }
    }

    pub fn logged_in_as(&self, uid: UserId, kid: DeviceKid) -> Self {
        Self { inner: Arc::clone(&self.inner), uid, kid }
    }

    fn revision_key(&self, tlf: TlfId, branch: BranchId, rev: Revision) -> Vec<u8> {
        let mut key = tlf.as_bytes().to_vec();
        if !branch.is_null() {
            // unmerged branches are namespaced per device
            key.extend_from_slice(self.kid.hash().as_bytes());
            key.extend_from_slice(branch.as_bytes());
        }
        key.extend_from_slice(&rev.number().to_be_bytes());
        key
    }

    fn unmerged_prefix(&self, tlf: TlfId) -> Vec<u8> {
        let mut key = tlf.as_bytes().to_vec();
        key.extend_from_slice(self.kid.hash().as_bytes());
        key
    }

    fn read_md_id(&self, key: &[u8]) -> VeilResult<Option<MdId>> {
        match self.inner.store.get(REVISION_TABLE, key)? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_signed(&self, id: MdId) -> VeilResult<SignedMd> {
        let bytes = self
            .inner
            .store
            .get(MD_TABLE, id.hash().as_bytes())?
            .ok_or_else(|| anyhow!("revision db points at missing md `{}`", id))?;
        codec::decode(&bytes)
    }

    /// this device's current unmerged branch for the folder, if any
    fn device_branch(&self, tlf: TlfId) -> VeilResult<Option<BranchId>> {
        let prefix = self.unmerged_prefix(tlf);
        let entries = self.inner.store.scan_prefix(REVISION_TABLE, &prefix)?;
        for (key, _) in entries {
            let rest = &key[prefix.len()..];
            if rest.len() == crate::id::BRANCH_ID_SIZE + 8 {
                let mut bid = [0u8; crate::id::BRANCH_ID_SIZE];
                bid.copy_from_slice(&rest[..crate::id::BRANCH_ID_SIZE]);
                return Ok(Some(BranchId::from_bytes(bid)));
            }
        }
        Ok(None)
    }

    fn head(&self, tlf: TlfId, branch: BranchId) -> VeilResult<Option<(MdId, RootMetadata)>> {
        let key = self.revision_key(tlf, branch, HEAD_SENTINEL);
        match self.read_md_id(&key)? {
            Some(id) => {
                let signed = self.read_signed(id)?;
                Ok(Some((id, signed.decode()?)))
            }
            None => Ok(None),
        }
    }

    fn check_write_access(&self, md: &RootMetadata, head: Option<&RootMetadata>) -> VeilResult<()> {
        let authority = head.unwrap_or(md);
        if authority.is_writer(self.uid) {
            return Ok(());
        }
        // readers may only push rekey revisions that copy writer metadata
        if authority.is_reader(self.uid) && md.is_rekey() && md.is_writer_metadata_copied() {
            return Ok(());
        }
        bail!(VeilError::Unauthorized)
    }

    fn fire_waiters(&self, tlf: TlfId, rev: Revision) {
        let mut waiters = self.inner.waiters.lock();
        let mut kept = Vec::with_capacity(waiters.len());
        for waiter in waiters.drain(..) {
            if waiter.tlf == tlf && rev >= waiter.threshold {
                let _ = waiter.sender.send(());
            } else {
                kept.push(waiter);
            }
        }
        *waiters = kept;
    }
}

#[async_trait]
impl MdServer for MdServerLocal {
    async fn get_for_handle(
        &self,
        handle: &TlfHandle,
        status: MdStatus,
    ) -> VeilResult<(TlfId, Option<SignedMd>)> {
        trace!("MdServerLocal::get_for_handle(handle: {}, status: {:?})", handle, status);
        let name = handle.canonical_name().as_bytes();
        match self.inner.store.get(HANDLE_TABLE, name)? {
            Some(bytes) => {
                let tlf: TlfId = codec::decode(&bytes)?;
                let signed = self.get_for_tlf(tlf, BranchId::NULL, status).await?;
                Ok((tlf, signed))
            }
            None => {
                let tlf = TlfId::new_random(handle.is_public());
                self.inner.store.put(HANDLE_TABLE, name, &codec::encode(&tlf)?)?;
                Ok((tlf, None))
            }
        }
    }

    async fn get_for_tlf(
        &self,
        tlf: TlfId,
        branch: BranchId,
        status: MdStatus,
    ) -> VeilResult<Option<SignedMd>> {
        let branch = match status {
            MdStatus::Merged => BranchId::NULL,
            MdStatus::Unmerged if branch.is_null() => match self.device_branch(tlf)? {
                Some(bid) => bid,
                None => return Ok(None),
            },
            MdStatus::Unmerged => branch,
        };
        match self.head(tlf, branch)? {
            Some((id, md)) => {
                ensure!(
                    md.is_reader(self.uid),
                    VeilError::ReadAccess(self.uid.to_string(), tlf.to_string())
                );
                Ok(Some(self.read_signed(id)?))
            }
            None => Ok(None),
        }
    }

    async fn get_range(
        &self,
        tlf: TlfId,
        branch: BranchId,
        status: MdStatus,
        start: Revision,
        stop: Revision,
    ) -> VeilResult<Vec<SignedMd>> {
        trace!(
            "MdServerLocal::get_range(tlf: {}, branch: {}, start: {}, stop: {})",
            tlf, branch, start, stop
        );
        let branch = match status {
            MdStatus::Merged => BranchId::NULL,
            MdStatus::Unmerged if branch.is_null() => match self.device_branch(tlf)? {
                Some(bid) => bid,
                None => return Ok(vec![]),
            },
            MdStatus::Unmerged => branch,
        };
        // scan rather than probe: an unmerged branch's revisions begin at
        // its branch point, which the caller does not necessarily know
        let mut prefix = tlf.as_bytes().to_vec();
        if !branch.is_null() {
            prefix.extend_from_slice(self.kid.hash().as_bytes());
            prefix.extend_from_slice(branch.as_bytes());
        }
        let mut out = Vec::new();
        for (key, value) in self.inner.store.scan_prefix(REVISION_TABLE, &prefix)? {
            let rest = &key[prefix.len()..];
            if rest.len() != 8 {
                continue;
            }
            let rev = Revision::new(u64::from_be_bytes(rest.try_into().unwrap()));
            if rev == HEAD_SENTINEL || rev < start || rev > stop {
                continue;
            }
            let id: MdId = codec::decode(&value)?;
            out.push(self.read_signed(id)?);
        }
        Ok(out)
    }

    async fn put(&self, signed: SignedMd) -> VeilResult<()> {
        signed.verify()?;
        let md = signed.decode()?;
        md.verify_writer_md()?;
        let tlf = md.tlf();
        let branch = md.branch();
        ensure!(
            md.is_unmerged() == !branch.is_null(),
            VeilError::ConditionFailed("unmerged flag does not match branch id".to_owned())
        );
        trace!("MdServerLocal::put(tlf: {}, branch: {}, rev: {})", tlf, branch, md.revision);

        let merged_head = self.head(tlf, BranchId::NULL)?;
        self.check_write_access(&md, merged_head.as_ref().map(|(_, head)| head))?;

        let branch_head =
            if branch.is_null() { merged_head } else { self.head(tlf, branch)? };
        match &branch_head {
            Some((head_id, head)) => {
                let expected = head.revision.next();
                ensure!(
                    md.revision == expected,
                    VeilError::ConflictRevision(expected, md.revision)
                );
                if branch.is_null() {
                    ensure!(md.prev_root == *head_id, VeilError::ConflictPrevRoot);
                    let expected_usage = (head.writer_md.disk_usage + md.writer_md.ref_bytes)
                        .saturating_sub(md.writer_md.unref_bytes);
                    ensure!(
                        md.writer_md.disk_usage == expected_usage,
                        VeilError::ConflictDiskUsage(expected_usage, md.writer_md.disk_usage)
                    );
                }
            }
            None if branch.is_null() => {
                ensure!(
                    md.revision == Revision::INITIAL,
                    VeilError::ConflictRevision(Revision::INITIAL, md.revision)
                );
            }
            // the first unmerged revision branches off an arbitrary point
            // of the merged chain; nothing to check against
            None => {}
        }

        let id = signed.md_id();
        self.inner.store.put(MD_TABLE, id.hash().as_bytes(), &codec::encode(&signed)?)?;
        let id_bytes = codec::encode(&id)?;
        self.inner
            .store
            .put(REVISION_TABLE, &self.revision_key(tlf, branch, md.revision), &id_bytes)?;
        self.inner
            .store
            .put(REVISION_TABLE, &self.revision_key(tlf, branch, HEAD_SENTINEL), &id_bytes)?;

        if branch.is_null() {
            self.fire_waiters(tlf, md.revision);
        }
        Ok(())
    }

    async fn prune_branch(&self, tlf: TlfId, branch: BranchId) -> VeilResult<()> {
        trace!("MdServerLocal::prune_branch(tlf: {}, branch: {})", tlf, branch);
        ensure!(!branch.is_null(), "cannot prune the merged branch");
        let mut prefix = self.unmerged_prefix(tlf);
        prefix.extend_from_slice(branch.as_bytes());
        for (key, _) in self.inner.store.scan_prefix(REVISION_TABLE, &prefix)? {
            self.inner.store.delete(REVISION_TABLE, &key)?;
        }
        Ok(())
    }

    async fn register_for_update(&self, tlf: TlfId, curr: Revision) -> VeilResult<UpdateSignal> {
        let (sender, receiver) = oneshot::channel();
        let head_rev = self.head(tlf, BranchId::NULL)?.map(|(_, md)| md.revision);
        if head_rev.map_or(false, |rev| rev >= curr.next()) {
            let _ = sender.send(());
        } else {
            self.inner.waiters.lock().push(Waiter { tlf, threshold: curr.next(), sender });
        }
        Ok(receiver)
    }
}
