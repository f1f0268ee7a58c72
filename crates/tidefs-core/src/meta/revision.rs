//! Folder metadata revisions.
//!
//! A revision is an immutable, content-addressed snapshot of one
//! folder-branch: the root block pointer plus the list of operations that
//! produced it from its predecessor. Revisions are created locally by the
//! sync engine or received from the metadata server, become immutable once
//! assigned a content hash, and are superseded (never mutated) by the next
//! revision.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::block::{BlockId, BlockPointer};
use crate::meta::ops::FolderOp;

/// Errors raised by revision construction and validation.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("metadata serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("revision {next} does not follow {prev}")]
    NonSequentialRevision {
        prev: RevisionNumber,
        next: RevisionNumber,
    },
    #[error("predecessor pointer {found:?} does not match head {expected}")]
    PrevRootMismatch {
        expected: MdId,
        found: Option<MdId>,
    },
    #[error("metadata belongs to folder {found}, expected {expected}")]
    FolderMismatch { expected: FolderId, found: FolderId },
    #[error("new handle {new} is not a valid resolution of {old}")]
    IncompatibleHandle { old: String, new: String },
}

/// Identifies one top-level folder.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FolderId(Uuid);

impl FolderId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..16])
    }
}

impl fmt::Debug for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Monotonic revision number within one branch.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug,
)]
pub struct RevisionNumber(pub u64);

impl RevisionNumber {
    /// The first revision of any folder.
    pub const INITIAL: RevisionNumber = RevisionNumber(1);

    pub fn next(self) -> RevisionNumber {
        RevisionNumber(self.0 + 1)
    }

    pub fn prev(self) -> Option<RevisionNumber> {
        if self.0 > 1 {
            Some(RevisionNumber(self.0 - 1))
        } else {
            None
        }
    }
}

impl fmt::Display for RevisionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a local divergent (unmerged) branch; the null id means the
/// merged mainline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId(Uuid);

impl BranchId {
    /// The mainline marker.
    pub const NULL: BranchId = BranchId(Uuid::nil());

    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "{}", &self.0.simple().to_string()[..16])
        }
    }
}

impl fmt::Debug for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Whether a revision sits on the canonical history or a local fork.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum MergedStatus {
    Merged,
    Unmerged(BranchId),
}

impl MergedStatus {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergedStatus::Merged)
    }

    pub fn branch_id(&self) -> BranchId {
        match self {
            MergedStatus::Merged => BranchId::NULL,
            MergedStatus::Unmerged(bid) => *bid,
        }
    }
}

/// Content hash identifying one immutable revision.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MdId([u8; 32]);

impl MdId {
    fn hash_of(data: &[u8]) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, data);
        let mut bytes = [0; 32];
        bytes.copy_from_slice(digest.as_ref());
        Self(bytes)
    }
}

impl fmt::Display for MdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for MdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Who may read and write a folder.
///
/// Members are user assertions; unresolved sets hold assertions that have
/// not yet been resolved to a user. Over time a handle may only become more
/// resolved, never less.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct FolderHandle {
    pub name: String,
    pub writers: BTreeSet<String>,
    pub readers: BTreeSet<String>,
    pub unresolved_writers: BTreeSet<String>,
    pub unresolved_readers: BTreeSet<String>,
}

impl FolderHandle {
    /// A private folder owned by `writers`.
    pub fn private(name: impl Into<String>, writers: &[&str]) -> Self {
        Self {
            name: name.into(),
            writers: writers.iter().map(|w| (*w).to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn is_writer(&self, user: &str) -> bool {
        self.writers.contains(user)
    }

    pub fn is_reader(&self, user: &str) -> bool {
        self.is_writer(user) || self.readers.contains(user)
    }

    /// Canonical display form: `writers#readers`, with unresolved
    /// assertions listed after the resolved members.
    pub fn canonical_name(&self) -> String {
        let join = |resolved: &BTreeSet<String>, unresolved: &BTreeSet<String>| {
            resolved
                .iter()
                .chain(unresolved.iter())
                .cloned()
                .collect::<Vec<_>>()
                .join(",")
        };
        let mut name = join(&self.writers, &self.unresolved_writers);
        let readers = join(&self.readers, &self.unresolved_readers);
        if !readers.is_empty() {
            name.push('#');
            name.push_str(&readers);
        }
        name
    }

    /// Whether `new` is this handle, or a strict refinement of it.
    ///
    /// A refinement keeps every resolved member and may only shrink the
    /// unresolved sets (assertions resolving into members). Anything else
    /// is a different folder and must be rejected.
    pub fn resolves_to(&self, new: &FolderHandle) -> bool {
        self.name == new.name
            && new.writers.is_superset(&self.writers)
            && new.readers.is_superset(&self.readers)
            && new.unresolved_writers.is_subset(&self.unresolved_writers)
            && new.unresolved_readers.is_subset(&self.unresolved_readers)
    }
}

impl fmt::Display for FolderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_name())
    }
}

/// A metadata revision under construction.
///
/// Mutable while the sync engine assembles it; frozen into an
/// [`ImmutableMd`] once its content hash is taken.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct RootMetadata {
    pub folder_id: FolderId,
    pub handle: FolderHandle,
    pub revision: RevisionNumber,
    pub prev_root: Option<MdId>,
    pub merged: MergedStatus,
    pub root_ptr: BlockPointer,
    pub disk_usage: u64,
    pub ops: Vec<FolderOp>,
    /// Set when a device without write keys asks members to rekey.
    pub rekey_requested: bool,
    /// Set on revisions whose writer metadata was copied forward without
    /// new user-visible changes (rekeys of old revisions).
    pub writer_metadata_copied: bool,
    /// Whether the current device holds keys able to decrypt this revision.
    pub readable: bool,
    pub last_writer: String,
}

impl RootMetadata {
    /// The very first revision of a new folder.
    pub fn make_initial(
        folder_id: FolderId,
        handle: FolderHandle,
        root_ptr: BlockPointer,
        writer: impl Into<String>,
    ) -> Self {
        Self {
            folder_id,
            handle,
            revision: RevisionNumber::INITIAL,
            prev_root: None,
            merged: MergedStatus::Merged,
            root_ptr,
            disk_usage: 0,
            ops: Vec::new(),
            rekey_requested: false,
            writer_metadata_copied: false,
            readable: true,
            last_writer: writer.into(),
        }
    }

    pub fn add_op(&mut self, op: FolderOp) {
        self.ops.push(op);
    }

    pub fn branch_id(&self) -> BranchId {
        self.merged.branch_id()
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    /// Content hash over the canonical encoding.
    pub fn md_id(&self) -> Result<MdId, MetadataError> {
        Ok(MdId::hash_of(&serde_json::to_vec(self)?))
    }
}

/// An immutable, content-addressed revision.
///
/// Cheap to clone; the payload is shared.
#[derive(Clone, Debug)]
pub struct ImmutableMd {
    md: Arc<RootMetadata>,
    md_id: MdId,
    /// Whether this revision has actually reached the metadata server, as
    /// opposed to only having been applied locally (journaled writes).
    put_to_server: bool,
    /// Local receive/creation time, unix nanoseconds.
    local_timestamp: i64,
}

impl ImmutableMd {
    pub fn make(
        md: RootMetadata,
        put_to_server: bool,
        local_timestamp: i64,
    ) -> Result<Self, MetadataError> {
        let md_id = md.md_id()?;
        Ok(Self {
            md: Arc::new(md),
            md_id,
            put_to_server,
            local_timestamp,
        })
    }

    pub fn md_id(&self) -> MdId {
        self.md_id
    }

    pub fn put_to_server(&self) -> bool {
        self.put_to_server
    }

    pub fn local_timestamp(&self) -> i64 {
        self.local_timestamp
    }

    pub fn revision(&self) -> RevisionNumber {
        self.md.revision
    }

    pub fn folder_id(&self) -> FolderId {
        self.md.folder_id
    }

    pub fn handle(&self) -> &FolderHandle {
        &self.md.handle
    }

    pub fn merged_status(&self) -> MergedStatus {
        self.md.merged
    }

    pub fn branch_id(&self) -> BranchId {
        self.md.branch_id()
    }

    pub fn root_ptr(&self) -> BlockPointer {
        self.md.root_ptr
    }

    pub fn ops(&self) -> &[FolderOp] {
        &self.md.ops
    }

    pub fn is_readable(&self) -> bool {
        self.md.readable
    }

    pub fn rekey_requested(&self) -> bool {
        self.md.rekey_requested
    }

    pub fn writer_metadata_copied(&self) -> bool {
        self.md.writer_metadata_copied
    }

    pub fn disk_usage(&self) -> u64 {
        self.md.disk_usage
    }

    /// The full payload, for re-deriving a successor.
    pub fn root_metadata(&self) -> &RootMetadata {
        &self.md
    }

    /// Check that `next` is a valid direct successor of this revision:
    /// same folder, next revision number, and a predecessor pointer
    /// matching this revision's identity exactly.
    pub fn check_valid_successor(&self, next: &RootMetadata) -> Result<(), MetadataError> {
        if next.folder_id != self.md.folder_id {
            return Err(MetadataError::FolderMismatch {
                expected: self.md.folder_id,
                found: next.folder_id,
            });
        }
        if next.prev_root != Some(self.md_id) {
            return Err(MetadataError::PrevRootMismatch {
                expected: self.md_id,
                found: next.prev_root,
            });
        }
        if next.revision != self.md.revision.next() {
            return Err(MetadataError::NonSequentialRevision {
                prev: self.md.revision,
                next: next.revision,
            });
        }
        Ok(())
    }

    /// Start a successor revision: next number, predecessor pointed at this
    /// revision, empty operation log, carried root/usage/handle.
    pub fn successor(&self, writer: impl Into<String>) -> RootMetadata {
        RootMetadata {
            folder_id: self.md.folder_id,
            handle: self.md.handle.clone(),
            revision: self.md.revision.next(),
            prev_root: Some(self.md_id),
            merged: self.md.merged,
            root_ptr: self.md.root_ptr,
            disk_usage: self.md.disk_usage,
            ops: Vec::new(),
            rekey_requested: false,
            writer_metadata_copied: false,
            readable: true,
            last_writer: writer.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle() -> FolderHandle {
        FolderHandle::private("alice,bob", &["alice", "bob"])
    }

    fn initial_md() -> ImmutableMd {
        let md = RootMetadata::make_initial(
            FolderId::new_random(),
            test_handle(),
            BlockPointer::temporary(),
            "alice",
        );
        ImmutableMd::make(md, true, 0).unwrap()
    }

    #[test]
    fn test_md_id_depends_on_content() {
        let head = initial_md();
        let mut succ = head.successor("alice");
        let id_a = succ.md_id().unwrap();
        succ.disk_usage += 1;
        let id_b = succ.md_id().unwrap();
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn test_valid_successor_accepted() {
        let head = initial_md();
        let succ = head.successor("bob");
        head.check_valid_successor(&succ).unwrap();
        assert_eq!(succ.revision, RevisionNumber(2));
        assert_eq!(succ.prev_root, Some(head.md_id()));
    }

    #[test]
    fn test_successor_with_wrong_prev_root_rejected() {
        let head = initial_md();
        let other = initial_md();
        let mut succ = head.successor("alice");
        succ.prev_root = Some(other.md_id());
        assert!(matches!(
            head.check_valid_successor(&succ),
            Err(MetadataError::PrevRootMismatch { .. })
        ));
    }

    #[test]
    fn test_successor_with_skipped_revision_rejected() {
        let head = initial_md();
        let mut succ = head.successor("alice");
        succ.revision = RevisionNumber(5);
        assert!(matches!(
            head.check_valid_successor(&succ),
            Err(MetadataError::NonSequentialRevision { .. })
        ));
    }

    #[test]
    fn test_successor_for_other_folder_rejected() {
        let head = initial_md();
        let mut succ = head.successor("alice");
        succ.folder_id = FolderId::new_random();
        assert!(matches!(
            head.check_valid_successor(&succ),
            Err(MetadataError::FolderMismatch { .. })
        ));
    }

    #[test]
    fn test_handle_resolution() {
        let mut old = test_handle();
        old.unresolved_writers.insert("carol@twitter".to_string());

        // Identity resolves.
        assert!(old.resolves_to(&old.clone()));

        // The assertion resolving into a member is a refinement.
        let mut resolved = old.clone();
        resolved.unresolved_writers.clear();
        resolved.writers.insert("carol".to_string());
        assert!(old.resolves_to(&resolved));

        // Losing a resolved writer is not.
        let mut lossy = old.clone();
        lossy.writers.remove("bob");
        assert!(!old.resolves_to(&lossy));

        // A renamed folder is a different folder.
        let mut renamed = old.clone();
        renamed.name = "alice,bob,carol".to_string();
        assert!(!old.resolves_to(&renamed));
    }

    #[test]
    fn test_canonical_name_includes_readers() {
        let mut handle = test_handle();
        handle.readers.insert("rita".to_string());
        assert_eq!(handle.canonical_name(), "alice,bob#rita");
    }

    #[test]
    fn test_branch_id_display() {
        assert_eq!(BranchId::NULL.to_string(), "null");
        assert!(!BranchId::new_random().is_null());
    }
}
