use crate::crypto::UserId;
use crate::error::{VeilError, VeilResult};
use crate::id::{BlockId, BlockRef, DataVer, KeyGen, RefNonce};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// The stable handle to a block: its content id plus everything needed to
/// decrypt it and charge the right user for the reference.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BlockPointer {
    pub id: BlockId,
    pub key_gen: KeyGen,
    pub data_ver: DataVer,
    pub creator: UserId,
    /// charged for this reference when it is a dedup reference made by
    /// someone other than the creator
    pub writer: Option<UserId>,
    pub ref_nonce: RefNonce,
}

impl BlockPointer {
    pub fn new_first(id: BlockId, key_gen: KeyGen, creator: UserId) -> Self {
        Self { id, key_gen, data_ver: DataVer::FIRST, creator, writer: None, ref_nonce: RefNonce::ZERO }
    }

    /// a second reference to the same bytes under a fresh nonce
    pub fn dedup_ref(self, writer: UserId) -> Self {
        Self {
            writer: (writer != self.creator).then_some(writer),
            ref_nonce: RefNonce::new_random(),
            ..self
        }
    }

    #[inline]
    pub fn block_ref(self) -> BlockRef {
        BlockRef::new(self.id, self.ref_nonce)
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.id.is_valid() && self.key_gen.is_valid() && self.data_ver.is_valid()
    }

    /// the user charged for the bytes behind this reference
    pub fn charged_to(self) -> UserId {
        self.writer.unwrap_or(self.creator)
    }
}

impl Display for BlockPointer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.block_ref())
    }
}

/// A pointer plus the size of the encoded (compressed + sealed) block.
///
/// Size zero means the block is dirty and has never been readied; clean
/// blocks always know their encoded size.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BlockInfo {
    pub ptr: BlockPointer,
    pub encoded_size: u32,
}

impl BlockInfo {
    pub fn dirty(ptr: BlockPointer) -> Self {
        Self { ptr, encoded_size: 0 }
    }

    #[inline]
    pub fn is_dirty(self) -> bool {
        self.encoded_size == 0
    }
}

#[derive(
    PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum EntryType {
    File,
    Exec,
    Dir,
    Sym,
}

impl EntryType {
    #[inline]
    pub fn is_file(self) -> bool {
        matches!(self, EntryType::File | EntryType::Exec)
    }

    #[inline]
    pub fn is_dir(self) -> bool {
        matches!(self, EntryType::Dir)
    }
}

impl Default for EntryType {
    fn default() -> Self {
        EntryType::File
    }
}

impl Display for EntryType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::File => write!(f, "file"),
            EntryType::Exec => write!(f, "exec"),
            EntryType::Dir => write!(f, "dir"),
            EntryType::Sym => write!(f, "sym"),
        }
    }
}

/// What a directory records about a child besides where to find it.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct EntryInfo {
    pub entry_type: EntryType,
    pub size: u64,
    /// target path; only meaningful for symlinks
    pub sym_path: String,
    /// nanoseconds since the epoch
    pub mtime: i64,
    pub ctime: i64,
}

impl EntryInfo {
    pub fn new(entry_type: EntryType, now: i64) -> Self {
        Self { entry_type, size: 0, sym_path: String::new(), mtime: now, ctime: now }
    }
}

#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct DirEntry {
    pub info: BlockInfo,
    pub entry: EntryInfo,
}

impl DirEntry {
    pub fn new(info: BlockInfo, entry: EntryInfo) -> Self {
        Self { info, entry }
    }

    #[inline]
    pub fn ptr(&self) -> BlockPointer {
        self.info.ptr
    }
}

/// A child of an indirect file block: where the pointed-to block's data
/// begins within the file.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IndirectFilePtr {
    pub info: BlockInfo,
    pub off: u64,
}

/// The contents of a regular file, or, when indirect, an ordered run of
/// pointers into child blocks.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileBlock {
    pub contents: Vec<u8>,
    pub indirect_ptrs: Vec<IndirectFilePtr>,
    pub is_indirect: bool,
}

impl FileBlock {
    pub fn new_indirect(ptrs: Vec<IndirectFilePtr>) -> Self {
        Self { contents: Vec::new(), indirect_ptrs: ptrs, is_indirect: true }
    }

    pub fn well_formed(&self) -> VeilResult<()> {
        if self.is_indirect {
            ensure!(self.contents.is_empty(), "indirect file block carries direct contents");
            ensure!(
                self.indirect_ptrs.windows(2).all(|w| w[0].off < w[1].off),
                "indirect file pointers out of order"
            );
            ensure!(
                self.indirect_ptrs.first().map_or(true, |p| p.off == 0),
                "first indirect pointer must start at offset zero"
            );
        } else {
            ensure!(self.indirect_ptrs.is_empty(), "direct file block carries indirect pointers");
        }
        Ok(())
    }

    /// index of the child block holding byte `off`
    pub fn indirect_index_for(&self, off: u64) -> usize {
        debug_assert!(self.is_indirect);
        match self.indirect_ptrs.binary_search_by_key(&off, |p| p.off) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        }
    }
}

/// A directory's children. Directories are single-level: the indirect form
/// is planned but not yet written, and well-formedness rejects it.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct DirBlock {
    pub children: BTreeMap<String, DirEntry>,
    pub is_indirect: bool,
}

impl DirBlock {
    pub fn well_formed(&self) -> VeilResult<()> {
        ensure!(!self.is_indirect, "indirect directory blocks are not supported");
        Ok(())
    }
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub enum Block {
    File(FileBlock),
    Dir(DirBlock),
}

impl Block {
    pub fn empty_file() -> Self {
        Block::File(FileBlock::default())
    }

    pub fn empty_dir() -> Self {
        Block::Dir(DirBlock::default())
    }

    pub fn well_formed(&self) -> VeilResult<()> {
        match self {
            Block::File(file) => file.well_formed(),
            Block::Dir(dir) => dir.well_formed(),
        }
    }

    pub fn is_indirect(&self) -> bool {
        match self {
            Block::File(file) => file.is_indirect,
            Block::Dir(dir) => dir.is_indirect,
        }
    }

    pub fn as_file(&self) -> VeilResult<&FileBlock> {
        match self {
            Block::File(file) => Ok(file),
            Block::Dir(..) => Err(anyhow!(VeilError::InvalidPath)),
        }
    }

    pub fn as_file_mut(&mut self) -> VeilResult<&mut FileBlock> {
        match self {
            Block::File(file) => Ok(file),
            Block::Dir(..) => Err(anyhow!(VeilError::InvalidPath)),
        }
    }

    pub fn into_file(self) -> VeilResult<FileBlock> {
        match self {
            Block::File(file) => Ok(file),
            Block::Dir(..) => Err(anyhow!(VeilError::InvalidPath)),
        }
    }

    pub fn as_dir(&self) -> VeilResult<&DirBlock> {
        match self {
            Block::Dir(dir) => Ok(dir),
            Block::File(..) => Err(anyhow!(VeilError::InvalidPath)),
        }
    }

    pub fn as_dir_mut(&mut self) -> VeilResult<&mut DirBlock> {
        match self {
            Block::Dir(dir) => Ok(dir),
            Block::File(..) => Err(anyhow!(VeilError::InvalidPath)),
        }
    }

    pub fn into_dir(self) -> VeilResult<DirBlock> {
        match self {
            Block::Dir(dir) => Ok(dir),
            Block::File(..) => Err(anyhow!(VeilError::InvalidPath)),
        }
    }
}
