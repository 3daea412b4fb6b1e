use crate::id::{BlockId, BranchId, KeyGen, Revision, TlfId};
use std::fmt::{self, Display, Formatter};

pub type VeilResult<T> = Result<T, VeilGenericError>;
pub type VeilGenericError = anyhow::Error;

// usually we can just use anyhow for errors, but the engine drives retry and
// conflict handling off a handful of kinds it has to be able to match on
#[derive(Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub enum VeilError {
    // validation
    BadName(String),
    NameExists(String),
    NameTooLong(String, usize),
    DisallowedPrefix(String),
    WrongFolder(TlfId, TlfId),
    InvalidPath,
    // not found
    NoSuchName(String),
    BlockNotFound(BlockId),
    MdNotFound(TlfId, Revision, BranchId),
    HandleNotFound(String),
    // access
    ReadAccess(String, String),
    WriteAccess(String, String),
    // chain integrity
    MdMismatch(Revision, String),
    HashMismatch(BlockId, BlockId),
    BadSignature(String),
    /// the writer's key verified the MD but was already revoked at signing time
    WriterKeyRetired(String, String),
    VerifyingKeyNotFound(String),
    // server conflicts; all of these fork the engine onto an unmerged branch
    ConflictRevision(Revision, Revision),
    ConflictPrevRoot,
    ConflictDiskUsage(u64, u64),
    ConditionFailed(String),
    Unauthorized,
    // recoverable block races (another client archived/reused the block)
    BlockArchived(BlockId),
    BlockDeleted(BlockId),
    BlockNonExistent(BlockId),
    // rekey
    RekeyRead(String),
    RekeyIncomplete,
    KeyGenNotFound(KeyGen),
    // engine state
    MdUpdateApply(Revision, Revision),
    DirtyWhileShutdown,
    Cancelled,
}

pub trait VeilErrorExt {
    fn try_into_veil_error(self) -> VeilResult<VeilError>;
    fn into_veil_error(self) -> VeilResult<VeilError>;
    fn try_into_block_not_found_err(self) -> VeilResult<BlockId>;
    fn try_into_conflict_revision_err(self) -> VeilResult<(Revision, Revision)>;
    fn try_into_update_apply_err(self) -> VeilResult<(Revision, Revision)>;
}

impl VeilErrorExt for VeilGenericError {
    fn try_into_veil_error(self) -> VeilResult<VeilError> {
        match self.downcast::<VeilError>() {
            Ok(veil_error) => Ok(veil_error),
            Err(cast_failed_err) => Err(cast_failed_err),
        }
    }

    fn into_veil_error(self) -> VeilResult<VeilError> {
        self.downcast()
    }

    fn try_into_block_not_found_err(self) -> VeilResult<BlockId> {
        match self.try_into_veil_error()? {
            VeilError::BlockNotFound(id) => Ok(id),
            err => Err(anyhow!(err)),
        }
    }

    fn try_into_conflict_revision_err(self) -> VeilResult<(Revision, Revision)> {
        match self.try_into_veil_error()? {
            VeilError::ConflictRevision(expected, actual) => Ok((expected, actual)),
            err => Err(anyhow!(err)),
        }
    }

    fn try_into_update_apply_err(self) -> VeilResult<(Revision, Revision)> {
        match self.try_into_veil_error()? {
            VeilError::MdUpdateApply(expected, actual) => Ok((expected, actual)),
            err => Err(anyhow!(err)),
        }
    }
}

pub trait VeilResultExt {
    fn is_not_found_err(&self) -> bool;
    /// a conflict reported by the metadata server; always recovered by
    /// forking to an unmerged branch and scheduling conflict resolution
    fn is_conflict_err(&self) -> bool;
    /// a block put that raced with another client; recovered by retrying
    /// from MD successor creation
    fn is_recoverable_block_err(&self) -> bool;
    fn is_rekey_read_err(&self) -> bool;
    fn is_cancelled_err(&self) -> bool;
    fn is_fatal(&self) -> bool;
}

macro_rules! error_ext_is_method {
    ($method:ident) => {
        fn $method(&self) -> bool {
            match self {
                Ok(..) => false,
                Err(err) => err.$method(),
            }
        }
    };
}

impl<T> VeilResultExt for VeilResult<T> {
    error_ext_is_method!(is_not_found_err);

    error_ext_is_method!(is_conflict_err);

    error_ext_is_method!(is_recoverable_block_err);

    error_ext_is_method!(is_rekey_read_err);

    error_ext_is_method!(is_cancelled_err);

    error_ext_is_method!(is_fatal);
}

impl VeilResultExt for VeilGenericError {
    fn is_not_found_err(&self) -> bool {
        match self.downcast_ref::<VeilError>() {
            Some(err) => matches!(
                err,
                VeilError::NoSuchName(..)
                    | VeilError::BlockNotFound(..)
                    | VeilError::MdNotFound(..)
                    | VeilError::HandleNotFound(..)
            ),
            None => false,
        }
    }

    fn is_conflict_err(&self) -> bool {
        match self.downcast_ref::<VeilError>() {
            Some(err) => matches!(
                err,
                VeilError::ConflictRevision(..)
                    | VeilError::ConflictPrevRoot
                    | VeilError::ConflictDiskUsage(..)
                    | VeilError::ConditionFailed(..)
            ),
            None => false,
        }
    }

    fn is_recoverable_block_err(&self) -> bool {
        match self.downcast_ref::<VeilError>() {
            Some(err) => matches!(
                err,
                VeilError::BlockArchived(..)
                    | VeilError::BlockDeleted(..)
                    | VeilError::BlockNonExistent(..)
            ),
            None => false,
        }
    }

    fn is_rekey_read_err(&self) -> bool {
        matches!(self.downcast_ref::<VeilError>(), Some(VeilError::RekeyRead(..)))
    }

    fn is_cancelled_err(&self) -> bool {
        matches!(self.downcast_ref::<VeilError>(), Some(VeilError::Cancelled))
    }

    fn is_fatal(&self) -> bool {
        match self.downcast_ref::<VeilError>() {
            Some(err) => matches!(
                err,
                VeilError::MdMismatch(..)
                    | VeilError::HashMismatch(..)
                    | VeilError::BadSignature(..)
                    | VeilError::WriterKeyRetired(..)
            ),
            None => false,
        }
    }
}

impl std::error::Error for VeilError {
}

impl Display for VeilError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VeilError::BadName(name) => write!(f, "`{}` is not a valid folder entry name", name),
            VeilError::NameExists(name) => write!(f, "`{}` already exists", name),
            VeilError::NameTooLong(name, max) =>
                write!(f, "entry name `{}` exceeds the maximum length of {} bytes", name, max),
            VeilError::DisallowedPrefix(name) =>
                write!(f, "name `{}` uses a reserved prefix", name),
            VeilError::WrongFolder(expected, actual) =>
                write!(f, "expected folder `{}`, got `{}`", expected, actual),
            VeilError::InvalidPath => write!(f, "invalid path"),
            VeilError::NoSuchName(name) => write!(f, "`{}` does not exist", name),
            VeilError::BlockNotFound(id) => write!(f, "block `{}` not found", id),
            VeilError::MdNotFound(tlf, rev, bid) =>
                write!(f, "no metadata for folder `{}` at revision {} on branch `{}`", tlf, rev, bid),
            VeilError::HandleNotFound(handle) => write!(f, "no such folder `{}`", handle),
            VeilError::ReadAccess(user, tlf) =>
                write!(f, "{} does not have read access to folder `{}`", user, tlf),
            VeilError::WriteAccess(user, tlf) =>
                write!(f, "{} does not have write access to folder `{}`", user, tlf),
            VeilError::MdMismatch(rev, reason) =>
                write!(f, "metadata chain broken at revision {}: {}", rev, reason),
            VeilError::HashMismatch(expected, actual) =>
                write!(f, "block hash mismatch: expected `{}`, got `{}`", expected, actual),
            VeilError::BadSignature(reason) => write!(f, "signature verification failed: {}", reason),
            VeilError::WriterKeyRetired(user, kid) =>
                write!(f, "folder metadata signed by retired device key `{}` of {}", kid, user),
            VeilError::VerifyingKeyNotFound(kid) =>
                write!(f, "verifying key `{}` is not known to the identity service", kid),
            VeilError::ConflictRevision(expected, actual) =>
                write!(f, "revision conflict: server expected {}, put had {}", expected, actual),
            VeilError::ConflictPrevRoot => write!(f, "previous-root conflict on metadata put"),
            VeilError::ConflictDiskUsage(expected, actual) =>
                write!(f, "disk usage conflict: server expected {}, put had {}", expected, actual),
            VeilError::ConditionFailed(reason) => write!(f, "server condition failed: {}", reason),
            VeilError::Unauthorized => write!(f, "device is not authorized for this folder"),
            VeilError::BlockArchived(id) => write!(f, "block `{}` is already archived", id),
            VeilError::BlockDeleted(id) => write!(f, "block `{}` was deleted", id),
            VeilError::BlockNonExistent(id) =>
                write!(f, "block `{}` does not exist on the server", id),
            VeilError::RekeyRead(handle) =>
                write!(f, "this device cannot read folder `{}` until it is rekeyed", handle),
            VeilError::RekeyIncomplete =>
                write!(f, "rekey only partially applied; another device must finish it"),
            VeilError::KeyGenNotFound(keygen) =>
                write!(f, "folder metadata has no key generation {}", keygen),
            VeilError::MdUpdateApply(expected, actual) =>
                write!(f, "cannot apply revision {} on top of head {}", actual, expected),
            VeilError::DirtyWhileShutdown =>
                write!(f, "shutdown requested while dirty state remains unsynced"),
            VeilError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}
