use crate::crypto::UserId;
use crate::error::{VeilError, VeilResult};
use crate::identity::IdentityService;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// The pseudo-user marking a folder as publicly readable. It may only ever
/// be the folder's sole reader.
pub const PUBLIC_USER: &str = "public";

/// Child names under this prefix are reserved for the filesystem itself.
pub const RESERVED_PREFIX: &str = ".veil";

pub const MAX_NAME_LENGTH: usize = 255;

/// A folder handle: the canonical writer/reader sets that identify a TLF.
///
/// The canonical string form is the writer list comma-joined, optionally
/// followed by `#` and the reader list comma-joined, each side sorted
/// lexicographically. Assertions that did not resolve to a user keep their
/// textual form and take part in sorting like any other entry.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct TlfHandle {
    writers: Vec<UserId>,
    readers: Vec<UserId>,
    unresolved_writers: Vec<String>,
    unresolved_readers: Vec<String>,
    public: bool,
    canonical: String,
}

fn normalize_entry(entry: &str) -> VeilResult<String> {
    let entry = entry.trim().to_lowercase();
    ensure!(!entry.is_empty(), VeilError::BadName(entry.clone()));
    ensure!(
        entry.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@')),
        VeilError::BadName(entry)
    );
    ensure!(entry.matches('@').count() <= 1, VeilError::BadName(entry));
    Ok(entry)
}

fn split_side(side: &str) -> VeilResult<Vec<String>> {
    side.split(',').map(normalize_entry).collect::<VeilResult<Vec<_>>>().map(|mut entries| {
        entries.sort();
        entries.dedup();
        entries
    })
}

impl TlfHandle {
    /// Parse and resolve a handle string like `alice,bob#carol` or
    /// `alice,dan@twitter#public`.
    pub async fn parse(identity: &dyn IdentityService, name: &str) -> VeilResult<Self> {
        let (writer_side, reader_side) = match name.split_once('#') {
            Some((w, r)) => (w, Some(r)),
            None => (name, None),
        };

        let writer_entries = split_side(writer_side)?;
        ensure!(!writer_entries.is_empty(), VeilError::BadName(name.to_owned()));
        ensure!(
            !writer_entries.iter().any(|e| e == PUBLIC_USER),
            VeilError::BadName(name.to_owned())
        );

        let reader_entries = match reader_side {
            Some(side) => split_side(side)?,
            None => Vec::new(),
        };
        let public = reader_entries.iter().any(|e| e == PUBLIC_USER);
        // `public` must be the only reader
        ensure!(!public || reader_entries.len() == 1, VeilError::BadName(name.to_owned()));

        let mut this = Self {
            writers: Vec::new(),
            readers: Vec::new(),
            unresolved_writers: Vec::new(),
            unresolved_readers: Vec::new(),
            public,
            canonical: String::new(),
        };

        for entry in &writer_entries {
            match identity.resolve(entry).await {
                Ok(uid) => this.writers.push(uid),
                Err(..) if entry.contains('@') => this.unresolved_writers.push(entry.clone()),
                Err(err) => return Err(err),
            }
        }
        if !public {
            for entry in &reader_entries {
                match identity.resolve(entry).await {
                    Ok(uid) => this.readers.push(uid),
                    Err(..) if entry.contains('@') => this.unresolved_readers.push(entry.clone()),
                    Err(err) => return Err(err),
                }
            }
        }
        this.writers.sort();
        this.writers.dedup();
        this.readers.sort();
        this.readers.dedup();

        this.canonical = this.render_canonical(identity).await?;
        Ok(this)
    }

    async fn render_canonical(&self, identity: &dyn IdentityService) -> VeilResult<String> {
        let mut writer_names = Vec::with_capacity(self.writers.len());
        for &uid in &self.writers {
            writer_names.push(identity.username(uid).await?);
        }
        writer_names.extend(self.unresolved_writers.iter().cloned());
        writer_names.sort();

        let mut out = writer_names.iter().join(",");
        if self.public {
            out.push('#');
            out.push_str(PUBLIC_USER);
        } else if !self.readers.is_empty() || !self.unresolved_readers.is_empty() {
            let mut reader_names = Vec::with_capacity(self.readers.len());
            for &uid in &self.readers {
                reader_names.push(identity.username(uid).await?);
            }
            reader_names.extend(self.unresolved_readers.iter().cloned());
            reader_names.sort();
            out.push('#');
            out.push_str(&reader_names.iter().join(","));
        }
        Ok(out)
    }

    #[inline]
    pub fn is_public(&self) -> bool {
        self.public
    }

    #[inline]
    pub fn writers(&self) -> &[UserId] {
        &self.writers
    }

    #[inline]
    pub fn readers(&self) -> &[UserId] {
        &self.readers
    }

    pub fn is_writer(&self, uid: UserId) -> bool {
        self.writers.binary_search(&uid).is_ok()
    }

    pub fn is_reader(&self, uid: UserId) -> bool {
        self.public || self.is_writer(uid) || self.readers.binary_search(&uid).is_ok()
    }

    #[inline]
    pub fn canonical_name(&self) -> &str {
        &self.canonical
    }

    /// every user named by this handle, writers first
    pub fn all_users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.writers.iter().chain(self.readers.iter()).copied()
    }
}

impl Display for TlfHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical)
    }
}

/// Validate a child entry name at create/rename time.
pub fn check_entry_name(name: &str) -> VeilResult<()> {
    ensure!(!name.is_empty() && name != "." && name != "..", VeilError::BadName(name.to_owned()));
    ensure!(!name.contains('/'), VeilError::BadName(name.to_owned()));
    ensure!(
        name.len() <= MAX_NAME_LENGTH,
        VeilError::NameTooLong(name.to_owned(), MAX_NAME_LENGTH)
    );
    ensure!(!name.starts_with(RESERVED_PREFIX), VeilError::DisallowedPrefix(name.to_owned()));
    Ok(())
}
