use crate::block::{Block, BlockPointer, FileBlock};
use crate::codec;
use crate::crypto::{
    hash_bytes, BlockCryptKeyServerHalf, Crypto, SealedBytes, TlfCryptKey,
};
use crate::error::{VeilError, VeilResult, VeilResultExt};
use crate::id::{BlockId, TlfId};
use crate::kmgr::KeyManager;
use crate::md::RootMetadata;
use crate::server::BlockServer;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::io::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// cap on concurrent uploads within one sync
pub const MAX_PARALLEL_BLOCK_PUTS: usize = 10;

const PAYLOAD_RAW: u8 = 0;
const PAYLOAD_ZLIB: u8 = 1;

/// A block serialized, compressed and sealed, waiting to be uploaded.
#[derive(Clone, Debug)]
pub struct ReadyBlockData {
    pub sealed: SealedBytes,
    pub half: BlockCryptKeyServerHalf,
}

impl ReadyBlockData {
    /// ciphertext-plus-MAC size; what reference accounting charges
    pub fn encoded_size(&self) -> u32 {
        self.sealed.data.len() as u32
    }
}

#[derive(Clone, Debug)]
pub struct BlockPutEntry {
    pub ptr: BlockPointer,
    pub block: Block,
    pub ready: ReadyBlockData,
}

/// The ordered set of blocks one sync intends to upload.
#[derive(Clone, Debug, Default)]
pub struct BlockPutState {
    entries: Vec<BlockPutEntry>,
}

impl BlockPutState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_new_block(&mut self, ptr: BlockPointer, block: Block, ready: ReadyBlockData) {
        self.entries.push(BlockPutEntry { ptr, block, ready });
    }

    pub fn merge(&mut self, other: BlockPutState) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockPutEntry> {
        self.entries.iter()
    }

    /// drop entries whose blocks are in the recoverable set
    pub fn remove_file_blocks(&mut self, blocks: &[FileBlock]) {
        self.entries.retain(|entry| match &entry.block {
            Block::File(file) => !blocks.contains(file),
            Block::Dir(..) => true,
        });
    }
}

fn compress(data: &[u8]) -> VeilResult<Vec<u8>> {
    let mut out = vec![PAYLOAD_ZLIB];
    let mut encoder = ZlibEncoder::new(&mut out, Compression::default());
    encoder.write_all(data)?;
    encoder.finish()?;
    Ok(out)
}

fn decompress(payload: &[u8]) -> VeilResult<Vec<u8>> {
    match payload.split_first() {
        Some((&PAYLOAD_RAW, rest)) => Ok(rest.to_vec()),
        Some((&PAYLOAD_ZLIB, rest)) => {
            let mut out = Vec::new();
            ZlibDecoder::new(rest).read_to_end(&mut out)?;
            Ok(out)
        }
        _ => bail!("unknown block payload tag"),
    }
}

/// Readies, fetches and uploads blocks. Stateless aside from its service
/// handles; all folder context comes in through the metadata argument.
pub struct BlockOps {
    bserver: Arc<dyn BlockServer>,
    crypto: Arc<Crypto>,
    kmgr: Arc<KeyManager>,
    compress_blocks: bool,
}

impl BlockOps {
    pub fn new(
        bserver: Arc<dyn BlockServer>,
        crypto: Arc<Crypto>,
        kmgr: Arc<KeyManager>,
        compress_blocks: bool,
    ) -> Self {
        Self { bserver, crypto, kmgr, compress_blocks }
    }

    fn folder_key_or_public(key: Option<TlfCryptKey>) -> TlfCryptKey {
        // public folders seal under the well-known all-zero key; the MAC
        // still guards integrity
        key.unwrap_or_else(|| TlfCryptKey::new([0; crate::crypto::KEY_SIZE]))
    }

    /// Serialize, compress and seal a block under the newest folder key.
    /// The returned id is the hash of the ciphertext.
    pub async fn ready(
        &self,
        md: &RootMetadata,
        block: &Block,
    ) -> VeilResult<(BlockId, usize, ReadyBlockData)> {
        block.well_formed()?;
        let plaintext = codec::encode(block)?;
        let plain_size = plaintext.len();
        let payload = if self.compress_blocks {
            compress(&plaintext)?
        } else {
            let mut raw = vec![PAYLOAD_RAW];
            raw.extend_from_slice(&plaintext);
            raw
        };
        let key = Self::folder_key_or_public(self.kmgr.key_for_encryption(md).await?);
        let (sealed, half) = self.crypto.seal_block(key, &payload)?;
        let id = BlockId::new(hash_bytes(&sealed.data));
        trace!("BlockOps::ready(..) :: id = {}, plain = {}, encoded = {}", id, plain_size, sealed.data.len());
        Ok((id, plain_size, ReadyBlockData { sealed, half }))
    }

    /// Fetch and open a block, verifying the ciphertext hashes to the
    /// pointer's id before trusting it.
    pub async fn get(&self, md: &RootMetadata, ptr: BlockPointer) -> VeilResult<Block> {
        trace!("BlockOps::get(ptr: {})", ptr);
        let (sealed, half) = self.bserver.get(md.tlf(), ptr.id, ptr.into()).await?;
        let actual = BlockId::new(hash_bytes(&sealed.data));
        ensure!(actual == ptr.id, VeilError::HashMismatch(ptr.id, actual));

        let key = Self::folder_key_or_public(self.kmgr.key_for_block_decryption(md, ptr).await?);
        let payload = self.crypto.open_block(key, half, &sealed)?;
        let block: Block = codec::decode(&decompress(&payload)?)?;
        block.well_formed()?;
        Ok(block)
    }

    /// Upload one readied block: a first reference creates it, a dedup
    /// reference only bumps the count.
    pub async fn put(&self, tlf: TlfId, ptr: BlockPointer, ready: &ReadyBlockData) -> VeilResult<()> {
        if ptr.ref_nonce.is_zero() {
            self.bserver.put(tlf, ptr.id, ptr.into(), ready.sealed.clone(), ready.half).await
        } else {
            self.bserver.add_reference(tlf, ptr.id, ptr.into()).await
        }
    }

    /// Fan the put state out over up to [`MAX_PARALLEL_BLOCK_PUTS`]
    /// workers. The first failure cancels the shared token so in-flight
    /// workers abort and queued entries are never picked up. Non-indirect
    /// file blocks that failed recoverably are collected and returned so
    /// the caller can exclude them from the retry.
    pub async fn do_block_puts(
        &self,
        cancel: &CancellationToken,
        tlf: TlfId,
        state: &BlockPutState,
    ) -> (Vec<FileBlock>, VeilResult<()>) {
        let n = state.entries.len();
        if n == 0 {
            return (Vec::new(), Ok(()));
        }
        debug!("BlockOps::do_block_puts(n: {})", n);
        let next = AtomicUsize::new(0);
        let recoverable: Mutex<Vec<FileBlock>> = Mutex::new(Vec::new());
        let first_err: Mutex<Option<crate::error::VeilGenericError>> = Mutex::new(None);

        let worker = |_w: usize| async {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let i = next.fetch_add(1, Ordering::SeqCst);
                if i >= n {
                    break;
                }
                let entry = &state.entries[i];
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(anyhow!(VeilError::Cancelled)),
                    result = self.put(tlf, entry.ptr, &entry.ready) => result,
                };
                if let Err(err) = result {
                    if err.is_recoverable_block_err() {
                        if let Block::File(file) = &entry.block {
                            if !file.is_indirect {
                                recoverable.lock().push(file.clone());
                            }
                        }
                    }
                    first_err.lock().get_or_insert(err);
                    cancel.cancel();
                    break;
                }
            }
        };

        let workers = n.min(MAX_PARALLEL_BLOCK_PUTS);
        futures::future::join_all((0..workers).map(worker)).await;

        let err = first_err.into_inner();
        let recoverable = recoverable.into_inner();
        match err {
            Some(err) => (recoverable, Err(err)),
            None if cancel.is_cancelled() => (recoverable, Err(anyhow!(VeilError::Cancelled))),
            None => (recoverable, Ok(())),
        }
    }

    pub async fn delete(&self, tlf: TlfId, ptrs: &[BlockPointer]) -> VeilResult<()> {
        self.bserver.remove_references(tlf, group_by_id(ptrs)).await
    }

    pub async fn archive(&self, tlf: TlfId, ptrs: &[BlockPointer]) -> VeilResult<()> {
        if ptrs.is_empty() {
            return Ok(());
        }
        self.bserver.archive_references(tlf, group_by_id(ptrs)).await
    }
}

fn group_by_id(ptrs: &[BlockPointer]) -> FxHashMap<BlockId, Vec<crate::server::BlockContext>> {
    let mut map: FxHashMap<BlockId, Vec<crate::server::BlockContext>> = FxHashMap::default();
    for &ptr in ptrs {
        map.entry(ptr.id).or_default().push(ptr.into());
    }
    map
}

#[cfg(test)]
mod tests;
