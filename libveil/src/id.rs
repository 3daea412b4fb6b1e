use crate::crypto::Hash256;
use crate::error::VeilGenericError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

pub const TLF_ID_SIZE: usize = 16;
pub const BRANCH_ID_SIZE: usize = 16;
pub const REF_NONCE_SIZE: usize = 8;

const TLF_ID_SUFFIX: u8 = 0x16;
const PUBLIC_TLF_ID_SUFFIX: u8 = 0x17;

/// Identifies a top-level folder. The last byte tags the folder as private
/// or public; the remaining bytes are random, allocated by the MD server on
/// the first write.
#[derive(PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TlfId([u8; TLF_ID_SIZE]);

impl TlfId {
    pub fn new_random(public: bool) -> Self {
        let mut bytes = [0u8; TLF_ID_SIZE];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..TLF_ID_SIZE - 1]);
        bytes[TLF_ID_SIZE - 1] = if public { PUBLIC_TLF_ID_SUFFIX } else { TLF_ID_SUFFIX };
        Self(bytes)
    }

    #[inline]
    pub fn is_public(self) -> bool {
        self.0[TLF_ID_SIZE - 1] == PUBLIC_TLF_ID_SUFFIX
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        matches!(self.0[TLF_ID_SIZE - 1], TLF_ID_SUFFIX | PUBLIC_TLF_ID_SUFFIX)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; TLF_ID_SIZE] {
        &self.0
    }
}

impl Display for TlfId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for TlfId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for TlfId {
    type Err = VeilGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        ensure!(bytes.len() == TLF_ID_SIZE, "tlf id must be {} bytes", TLF_ID_SIZE);
        let mut arr = [0u8; TLF_ID_SIZE];
        arr.copy_from_slice(&bytes);
        let id = Self(arr);
        ensure!(id.is_valid(), "tlf id has an invalid suffix byte");
        Ok(id)
    }
}

/// Labels an unmerged fork of a folder's revision chain. The merged chain
/// uses [`BranchId::NULL`].
#[derive(PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BranchId([u8; BRANCH_ID_SIZE]);

impl BranchId {
    pub const NULL: Self = Self([0; BRANCH_ID_SIZE]);

    pub fn new_random() -> Self {
        let mut bytes = [0u8; BRANCH_ID_SIZE];
        while bytes == [0; BRANCH_ID_SIZE] {
            rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        }
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; BRANCH_ID_SIZE]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; BRANCH_ID_SIZE] {
        &self.0
    }
}

impl Display for BranchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_null() { write!(f, "merged") } else { write!(f, "{}", hex::encode(self.0)) }
    }
}

impl Debug for BranchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

macro_rules! hash_id_type {
    ($(#[$outer:meta])* $name:ident) => {
        $(#[$outer])*
        #[derive(
            PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[repr(transparent)]
        pub struct $name(Hash256);

        impl $name {
            pub const NULL: Self = Self(Hash256::ZERO);

            #[inline]
            pub fn new(hash: Hash256) -> Self {
                Self(hash)
            }

            #[inline]
            pub fn hash(self) -> Hash256 {
                self.0
            }

            #[inline]
            pub fn is_null(self) -> bool {
                self.0.is_zero()
            }

            #[inline]
            pub fn is_valid(self) -> bool {
                !self.is_null()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self)
            }
        }

        impl FromStr for $name {
            type Err = VeilGenericError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Hash256::from_str(s).map(Self)
            }
        }
    };
}

hash_id_type! {
    /// Content address of a block: the hash of its ciphertext.
    BlockId
}

impl BlockId {
    /// placeholder id for a dirty block that has never been readied; it
    /// is replaced by the real content hash at sync time
    pub fn new_temporary() -> Self {
        let mut bytes = [0u8; crate::crypto::HASH_SIZE];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self(Hash256::new(bytes))
    }
}

hash_id_type! {
    /// The hash of a serialized signed metadata revision; successors carry
    /// their predecessor's `MdId` as `prev_root`.
    MdId
}

/// Monotonically increasing revision number of a folder's metadata chain.
#[derive(
    PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Revision(u64);

impl Revision {
    pub const UNINITIALIZED: Self = Self(0);
    pub const INITIAL: Self = Self(1);

    #[inline]
    pub fn new(rev: u64) -> Self {
        Self(rev)
    }

    #[inline]
    pub fn number(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[inline]
    pub fn prev(self) -> Self {
        debug_assert!(self.0 > 0);
        Self(self.0 - 1)
    }

    #[inline]
    pub fn is_initialized(self) -> bool {
        self.0 > 0
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Selects which symmetric folder key protects a block or metadata
/// revision. Public folders use [`KeyGen::PUBLIC`]; private folders start
/// at [`KeyGen::FIRST_VALID`] and bump on every device-removing rekey.
#[derive(
    PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct KeyGen(i32);

impl KeyGen {
    pub const FIRST_VALID: Self = Self(1);
    pub const PUBLIC: Self = Self(-1);
    pub const UNINITIALIZED: Self = Self(0);

    #[inline]
    pub fn new(gen: i32) -> Self {
        Self(gen)
    }

    #[inline]
    pub fn number(self) -> i32 {
        self.0
    }

    #[inline]
    pub fn next(self) -> Self {
        debug_assert!(self.0 >= 0);
        Self(self.0 + 1)
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self == Self::PUBLIC || self.0 >= Self::FIRST_VALID.0
    }

    /// iterate every valid generation up to and including `self`
    pub fn up_to_inclusive(self) -> impl Iterator<Item = KeyGen> {
        (Self::FIRST_VALID.0..=self.0).map(KeyGen)
    }
}

impl Default for KeyGen {
    fn default() -> Self {
        Self::UNINITIALIZED
    }
}

impl Display for KeyGen {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for KeyGen {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Version of the block wire format a pointer's data was written with.
#[derive(
    PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct DataVer(u32);

impl DataVer {
    pub const FIRST: Self = Self(1);

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 >= Self::FIRST.0
    }
}

impl Default for DataVer {
    fn default() -> Self {
        Self::FIRST
    }
}

impl Display for DataVer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for DataVer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Distinguishes multiple references to the same block contents. The first
/// reference uses [`RefNonce::ZERO`]; deduplicated references draw a random
/// nonce so they can be counted and removed independently.
#[derive(
    PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct RefNonce([u8; REF_NONCE_SIZE]);

impl RefNonce {
    pub const ZERO: Self = Self([0; REF_NONCE_SIZE]);

    pub fn new_random() -> Self {
        let mut bytes = [0u8; REF_NONCE_SIZE];
        while bytes == [0; REF_NONCE_SIZE] {
            rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        }
        Self(bytes)
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl Display for RefNonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for RefNonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A single countable reference to a block: the content id plus the nonce
/// distinguishing this reference from other references to the same bytes.
#[derive(
    PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Debug, Serialize, Deserialize,
)]
pub struct BlockRef {
    pub id: BlockId,
    pub nonce: RefNonce,
}

impl BlockRef {
    pub fn new(id: BlockId, nonce: RefNonce) -> Self {
        Self { id, nonce }
    }

    pub fn first(id: BlockId) -> Self {
        Self { id, nonce: RefNonce::ZERO }
    }
}

impl Display for BlockRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.nonce.is_zero() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}/{}", self.id, self.nonce)
        }
    }
}
