use crate::crypto::Crypto;
use crate::error::{VeilError, VeilResult, VeilResultExt};
use crate::handle::TlfHandle;
use crate::id::{BranchId, MdId, Revision, TlfId};
use crate::identity::{IdentityService, KeyValidity};
use crate::kmgr::KeyManager;
use crate::md::{MdWithId, RootMetadata, SignedMd};
use crate::mdcache::MdCache;
use crate::server::{MdServer, MdStatus};
use std::sync::Arc;

/// The verified face of the metadata server: everything returned from here
/// has had its signatures, identity and chain shape checked, and its
/// private metadata decrypted when this device is able to.
pub struct MdOps {
    mdserver: Arc<dyn MdServer>,
    crypto: Arc<Crypto>,
    kmgr: Arc<KeyManager>,
    md_cache: Arc<MdCache>,
    identity: Arc<dyn IdentityService>,
}

impl MdOps {
    pub fn new(
        mdserver: Arc<dyn MdServer>,
        crypto: Arc<Crypto>,
        kmgr: Arc<KeyManager>,
        md_cache: Arc<MdCache>,
        identity: Arc<dyn IdentityService>,
    ) -> Self {
        Self { mdserver, crypto, kmgr, md_cache, identity }
    }

    async fn check_signer_key(
        &self,
        uid: crate::crypto::UserId,
        key: crate::crypto::VerifyingKey,
    ) -> VeilResult<()> {
        match self.identity.verifying_key_validity(uid, key).await? {
            KeyValidity::Valid => Ok(()),
            KeyValidity::Retired => {
                let name = self.identity.username(uid).await.unwrap_or_else(|_| uid.to_string());
                bail!(VeilError::WriterKeyRetired(name, format!("{:#}", key.kid())))
            }
            KeyValidity::Unknown => {
                bail!(VeilError::VerifyingKeyNotFound(format!("{:#}", key.kid())))
            }
        }
    }

    /// Full verification pipeline for one fetched revision.
    async fn verify_and_decode(
        &self,
        signed: SignedMd,
        tlf: TlfId,
        expected_branch: Option<BranchId>,
        handle: Option<&TlfHandle>,
    ) -> VeilResult<MdWithId> {
        signed.verify()?;
        let mut md = signed.decode()?;
        ensure!(md.tlf() == tlf, VeilError::WrongFolder(tlf, md.tlf()));
        if let Some(branch) = expected_branch {
            ensure!(
                md.branch() == branch,
                VeilError::MdMismatch(
                    md.revision,
                    format!("expected branch {}, got {}", branch, md.branch())
                )
            );
        }
        md.verify_writer_md()?;
        self.check_signer_key(md.last_modifying_writer, md.writer_sig.verifying_key).await?;
        self.check_signer_key(md.last_modifying_user, signed.sig.verifying_key).await?;

        if let Some(handle) = handle {
            // the name we resolved must be the name the signer wrote under
            ensure!(
                md.writer_md.writers == handle.writers() && md.readers == handle.readers(),
                VeilError::MdMismatch(
                    md.revision,
                    format!("folder membership does not match handle `{}`", handle)
                )
            );
        }

        let key = if md.is_public() {
            None
        } else {
            match self.kmgr.key_for_md_decryption(&md, &md).await {
                Ok(key) => key,
                // a valid reader pending rekey still gets the metadata,
                // just without its contents
                Err(err)
                    if err.is_rekey_read_err() && md.is_reader(self.crypto.uid()) =>
                {
                    warn!("metadata for {} unreadable until rekey", tlf);
                    return Ok(MdWithId { id: signed.md_id(), md });
                }
                Err(err) => return Err(err),
            }
        };
        md.open_private_md(&self.crypto, key)?;
        Ok(MdWithId { id: signed.md_id(), md })
    }

    pub async fn get_for_handle(
        &self,
        handle: &TlfHandle,
    ) -> VeilResult<(TlfId, Option<MdWithId>)> {
        trace!("MdOps::get_for_handle(handle: {})", handle);
        let (tlf, signed) = self.mdserver.get_for_handle(handle, MdStatus::Merged).await?;
        match signed {
            Some(signed) => {
                let md = self
                    .verify_and_decode(signed, tlf, Some(BranchId::NULL), Some(handle))
                    .await?;
                Ok((tlf, Some(md)))
            }
            None => Ok((tlf, None)),
        }
    }

    pub async fn get_for_tlf(
        &self,
        tlf: TlfId,
        branch: BranchId,
        status: MdStatus,
    ) -> VeilResult<Option<MdWithId>> {
        trace!("MdOps::get_for_tlf(tlf: {}, branch: {}, status: {:?})", tlf, branch, status);
        let expected_branch = match status {
            MdStatus::Merged => Some(BranchId::NULL),
            // a null-branch unmerged request means "whatever branch this
            // device has"; the result tells us which
            MdStatus::Unmerged if branch.is_null() => None,
            MdStatus::Unmerged => Some(branch),
        };
        match self.mdserver.get_for_tlf(tlf, branch, status).await? {
            Some(signed) => {
                Ok(Some(self.verify_and_decode(signed, tlf, expected_branch, None).await?))
            }
            None => Ok(None),
        }
    }

    /// Fetch `[start, stop]`, verifying every link of the chain: each
    /// revision must be its predecessor's valid successor.
    pub async fn get_range(
        &self,
        tlf: TlfId,
        branch: BranchId,
        status: MdStatus,
        start: Revision,
        stop: Revision,
    ) -> VeilResult<Vec<MdWithId>> {
        trace!("MdOps::get_range(tlf: {}, {}..={})", tlf, start, stop);
        let mut out: Vec<MdWithId> = Vec::new();

        // the cache can satisfy a prefix of the range
        let mut rev = start;
        if status == MdStatus::Merged {
            while rev <= stop {
                match self.md_cache.get(tlf, rev, branch) {
                    Some(md) => out.push(md),
                    None => break,
                }
                rev = rev.next();
            }
        }

        let fetched = if rev <= stop {
            self.mdserver.get_range(tlf, branch, status, rev, stop).await?
        } else {
            Vec::new()
        };
        let expected_branch = match status {
            MdStatus::Merged => Some(BranchId::NULL),
            MdStatus::Unmerged => None,
        };
        for signed in fetched {
            let md = self.verify_and_decode(signed, tlf, expected_branch, None).await?;
            if let Some(prev) = out.last() {
                md.md.is_valid_successor(prev.id, &prev.md)?;
            }
            if status == MdStatus::Merged {
                self.md_cache.put(md.clone());
            }
            out.push(md);
        }
        Ok(out)
    }

    /// Seal, sign and submit a revision; returns its id. Conflict kinds
    /// pass through untouched for the engine to recover from.
    pub async fn put(&self, md: &mut RootMetadata) -> VeilResult<MdId> {
        trace!("MdOps::put(tlf: {}, rev: {}, branch: {})", md.tlf(), md.revision, md.branch());
        md.last_modifying_user = self.crypto.uid();
        if !md.is_writer_metadata_copied() {
            md.last_modifying_writer = self.crypto.uid();
        }
        md.timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();

        if md.is_public() || !md.is_writer_metadata_copied() {
            let key = if md.is_public() {
                None
            } else {
                self.kmgr.key_for_encryption(md).await?
            };
            md.seal_private_md(&self.crypto, key)?;
            md.sign_writer_md(&self.crypto)?;
        }

        let signed = md.to_signed(&self.crypto)?;
        let id = signed.md_id();
        self.mdserver.put(signed).await?;
        self.md_cache.put(MdWithId { md: md.clone(), id });
        Ok(id)
    }

    pub async fn prune_branch(&self, tlf: TlfId, branch: BranchId) -> VeilResult<()> {
        self.mdserver.prune_branch(tlf, branch).await?;
        self.md_cache.delete_branch(tlf, branch);
        Ok(())
    }
}
