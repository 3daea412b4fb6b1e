use crate::block::BlockPointer;
use crate::codec;
use crate::crypto::{BlockCryptKeyServerHalf, SealedBytes, UserId};
use crate::error::{VeilError, VeilResult};
use crate::id::{BlockId, RefNonce, TlfId};
use crate::server::kvstore::KvStore;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything the block server needs to know about one reference besides
/// the block id itself.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BlockContext {
    pub creator: UserId,
    pub writer: Option<UserId>,
    pub ref_nonce: RefNonce,
}

impl From<BlockPointer> for BlockContext {
    fn from(ptr: BlockPointer) -> Self {
        Self { creator: ptr.creator, writer: ptr.writer, ref_nonce: ptr.ref_nonce }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub enum RefStatus {
    Live,
    Archived,
}

/// Stores opaque ciphertext blobs and their reference counts. Knows
/// nothing about plaintext or folder keys.
#[async_trait]
pub trait BlockServer: Send + Sync {
    async fn get(
        &self,
        tlf: TlfId,
        id: BlockId,
        ctx: BlockContext,
    ) -> VeilResult<(SealedBytes, BlockCryptKeyServerHalf)>;

    /// create the block and its first reference; `ctx.ref_nonce` must be
    /// zero. A second put of an existing block id succeeds without
    /// incrementing any count.
    async fn put(
        &self,
        tlf: TlfId,
        id: BlockId,
        ctx: BlockContext,
        data: SealedBytes,
        half: BlockCryptKeyServerHalf,
    ) -> VeilResult<()>;

    async fn add_reference(&self, tlf: TlfId, id: BlockId, ctx: BlockContext) -> VeilResult<()>;

    async fn remove_references(
        &self,
        tlf: TlfId,
        refs: FxHashMap<BlockId, Vec<BlockContext>>,
    ) -> VeilResult<()>;

    async fn archive_references(
        &self,
        tlf: TlfId,
        refs: FxHashMap<BlockId, Vec<BlockContext>>,
    ) -> VeilResult<()>;
}

#[derive(Serialize, Deserialize)]
struct BlockEntry {
    ciphertext: SealedBytes,
    half: BlockCryptKeyServerHalf,
    tlf: TlfId,
    refs: BTreeMap<RefNonce, RefStatus>,
}

/// KV-backed block server: one record per block id holding the ciphertext
/// and every reference's status. A record whose references have all been
/// removed stays behind as a tombstone so later puts of the same id can be
/// told apart from puts of brand-new blocks.
pub struct BlockServerLocal {
    store: Arc<dyn KvStore>,
}

const BLOCK_TABLE: &str = "blocks";

impl BlockServerLocal {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn read_entry(&self, id: BlockId) -> VeilResult<Option<BlockEntry>> {
        match self.store.get(BLOCK_TABLE, id.hash().as_bytes())? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_entry(&self, id: BlockId, entry: &BlockEntry) -> VeilResult<()> {
        self.store.put(BLOCK_TABLE, id.hash().as_bytes(), &codec::encode(entry)?)
    }

    fn require_entry(&self, id: BlockId) -> VeilResult<BlockEntry> {
        match self.read_entry(id)? {
            Some(entry) if entry.refs.is_empty() => bail!(VeilError::BlockDeleted(id)),
            Some(entry) => Ok(entry),
            None => bail!(VeilError::BlockNonExistent(id)),
        }
    }

    /// number of blocks still holding data; test observability
    pub fn num_blocks(&self) -> usize {
        self.store
            .scan_prefix(BLOCK_TABLE, &[])
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, v)| {
                        codec::decode::<BlockEntry>(v).map_or(false, |e| !e.refs.is_empty())
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// count of live (non-archived) references across all blocks
    pub fn num_live_refs(&self) -> usize {
        self.store
            .scan_prefix(BLOCK_TABLE, &[])
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(_, v)| codec::decode::<BlockEntry>(v).ok())
                    .map(|e| e.refs.values().filter(|&&s| s == RefStatus::Live).count())
                    .sum()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl BlockServer for BlockServerLocal {
    async fn get(
        &self,
        tlf: TlfId,
        id: BlockId,
        _ctx: BlockContext,
    ) -> VeilResult<(SealedBytes, BlockCryptKeyServerHalf)> {
        trace!("BlockServerLocal::get(id: {})", id);
        let entry = self.require_entry(id)?;
        ensure!(entry.tlf == tlf, VeilError::WrongFolder(entry.tlf, tlf));
        Ok((entry.ciphertext, entry.half))
    }

    async fn put(
        &self,
        tlf: TlfId,
        id: BlockId,
        ctx: BlockContext,
        data: SealedBytes,
        half: BlockCryptKeyServerHalf,
    ) -> VeilResult<()> {
        trace!("BlockServerLocal::put(id: {}, bytes: {})", id, data.data.len());
        ensure!(ctx.ref_nonce.is_zero(), "put requires a zero ref nonce");
        match self.read_entry(id)? {
            // idempotent: the same content was already put by someone; the
            // count is not incremented
            Some(entry) if !entry.refs.is_empty() => Ok(()),
            Some(_) => bail!(VeilError::BlockDeleted(id)),
            None => {
                let mut refs = BTreeMap::new();
                refs.insert(RefNonce::ZERO, RefStatus::Live);
                self.write_entry(id, &BlockEntry { ciphertext: data, half, tlf, refs })
            }
        }
    }

    async fn add_reference(&self, tlf: TlfId, id: BlockId, ctx: BlockContext) -> VeilResult<()> {
        trace!("BlockServerLocal::add_reference(id: {}, nonce: {})", id, ctx.ref_nonce);
        let mut entry = self.require_entry(id)?;
        ensure!(entry.tlf == tlf, VeilError::WrongFolder(entry.tlf, tlf));
        // a reference can only be added while some other reference is live
        ensure!(
            entry.refs.values().any(|&s| s == RefStatus::Live),
            VeilError::BlockArchived(id)
        );
        entry.refs.insert(ctx.ref_nonce, RefStatus::Live);
        self.write_entry(id, &entry)
    }

    async fn remove_references(
        &self,
        tlf: TlfId,
        refs: FxHashMap<BlockId, Vec<BlockContext>>,
    ) -> VeilResult<()> {
        for (id, contexts) in refs {
            let Some(mut entry) = self.read_entry(id)? else { continue };
            ensure!(entry.tlf == tlf, VeilError::WrongFolder(entry.tlf, tlf));
            for ctx in contexts {
                entry.refs.remove(&ctx.ref_nonce);
            }
            if entry.refs.is_empty() {
                // garbage collect the data, keep the tombstone
                entry.ciphertext = SealedBytes::default();
            }
            self.write_entry(id, &entry)?;
        }
        Ok(())
    }

    async fn archive_references(
        &self,
        tlf: TlfId,
        refs: FxHashMap<BlockId, Vec<BlockContext>>,
    ) -> VeilResult<()> {
        for (id, contexts) in refs {
            let mut entry = match self.read_entry(id)? {
                Some(entry) if !entry.refs.is_empty() => entry,
                Some(_) => bail!(VeilError::BlockDeleted(id)),
                None => bail!(VeilError::BlockNonExistent(id)),
            };
            ensure!(entry.tlf == tlf, VeilError::WrongFolder(entry.tlf, tlf));
            for ctx in contexts {
                if let Some(status) = entry.refs.get_mut(&ctx.ref_nonce) {
                    *status = RefStatus::Archived;
                }
            }
            self.write_entry(id, &entry)?;
        }
        Ok(())
    }
}
