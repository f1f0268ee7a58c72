//! Error types crossing the collaborator boundary.

use thiserror::Error;

use crate::block::BlockPointer;
use crate::meta::{BranchId, FolderId, RevisionNumber};

/// Errors from the metadata server (or the journal fronting it).
///
/// The conflict variants form a closed set: every place the engine asks
/// "was this a conflict" goes through [`MdServerError::is_conflict`], so a
/// new conflict class cannot be special-cased in one spot and missed in
/// another.
#[derive(Error, Debug, Clone)]
pub enum MdServerError {
    /// The put lost a race: the server already has `current`.
    #[error("revision conflict: put {attempted}, server already at {current}")]
    RevisionConflict {
        attempted: RevisionNumber,
        current: RevisionNumber,
    },
    /// The predecessor pointer does not match the server's head.
    #[error("previous-root conflict for revision {attempted}")]
    PrevRootConflict { attempted: RevisionNumber },
    /// Disk-usage accounting disagrees with the server's.
    #[error("disk usage conflict: expected {expected}, found {found}")]
    DiskUsageConflict { expected: u64, found: u64 },
    /// A server-side precondition failed.
    #[error("server condition failed: {reason}")]
    ConditionFailed { reason: String },
    /// The folder id is mapped to a different handle on the server.
    #[error("folder mapping conflict for {folder}")]
    FolderMappingConflict { folder: FolderId },
    /// The local journal rejected the write.
    #[error("journal conflict: {reason}")]
    JournalConflict { reason: String },

    /// The server requires a newer metadata version than this client
    /// understands. Fatal for the update loop.
    #[error("unsupported metadata version: server requires {required}, client supports {supported}")]
    VersionSkew { required: u32, supported: u32 },
    /// The caller is not allowed to perform this operation.
    #[error("permission denied for {user}")]
    PermissionDenied { user: String },
    /// No such unmerged branch.
    #[error("unknown branch {branch} for folder {folder}")]
    UnknownBranch { folder: FolderId, branch: BranchId },
    /// The server could not be reached.
    #[error("metadata server unavailable: {0}")]
    Unavailable(String),
    /// The request timed out.
    #[error("metadata server timed out")]
    Timeout,
}

impl MdServerError {
    /// Whether this error is one of the closed conflict classes that the
    /// engine must absorb (by switching to an unmerged put or resyncing)
    /// rather than surface.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            MdServerError::RevisionConflict { .. }
                | MdServerError::PrevRootConflict { .. }
                | MdServerError::DiskUsageConflict { .. }
                | MdServerError::ConditionFailed { .. }
                | MdServerError::FolderMappingConflict { .. }
                | MdServerError::JournalConflict { .. }
        )
    }
}

/// Errors from the block server.
#[derive(Error, Debug, Clone)]
pub enum BlockServerError {
    #[error("block {ptr} does not exist")]
    NotFound { ptr: BlockPointer },
    #[error("block {ptr} could not be decoded")]
    Corrupt { ptr: BlockPointer },
    /// A failure the caller may tolerate when the block was only needed
    /// for best-effort accounting.
    #[error("recoverable block error: {reason}")]
    Recoverable { reason: String },
    #[error("block server unavailable: {0}")]
    Unavailable(String),
    #[error("block server timed out")]
    Timeout,
}

impl BlockServerError {
    /// Whether a removal-time fetch may treat this error as "the block is
    /// already gone" and keep going.
    pub fn is_recoverable_for_removal(&self) -> bool {
        matches!(
            self,
            BlockServerError::NotFound { .. } | BlockServerError::Recoverable { .. }
        )
    }
}

/// Errors from identity and key management.
#[derive(Error, Debug, Clone)]
pub enum KeyError {
    #[error("no active session")]
    NoSession,
    #[error("{user} has no keys for this folder")]
    NoAccess { user: String },
    #[error("key service unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the external conflict resolver.
#[derive(Error, Debug, Clone)]
pub enum ResolverError {
    #[error("conflict resolution failed: {0}")]
    Failed(String),
    #[error("conflict resolution wait cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_set_is_closed() {
        let conflicts = [
            MdServerError::RevisionConflict {
                attempted: RevisionNumber(3),
                current: RevisionNumber(4),
            },
            MdServerError::PrevRootConflict {
                attempted: RevisionNumber(3),
            },
            MdServerError::DiskUsageConflict {
                expected: 1,
                found: 2,
            },
            MdServerError::ConditionFailed {
                reason: "stale".into(),
            },
            MdServerError::FolderMappingConflict {
                folder: FolderId::new_random(),
            },
            MdServerError::JournalConflict {
                reason: "overlap".into(),
            },
        ];
        for err in conflicts {
            assert!(err.is_conflict(), "{err} should be a conflict");
        }

        let non_conflicts = [
            MdServerError::Timeout,
            MdServerError::Unavailable("down".into()),
            MdServerError::PermissionDenied {
                user: "mallory".into(),
            },
            MdServerError::VersionSkew {
                required: 9,
                supported: 3,
            },
        ];
        for err in non_conflicts {
            assert!(!err.is_conflict(), "{err} should not be a conflict");
        }
    }

    #[test]
    fn test_recoverable_block_errors() {
        assert!(BlockServerError::NotFound {
            ptr: BlockPointer::ZERO
        }
        .is_recoverable_for_removal());
        assert!(BlockServerError::Recoverable {
            reason: "archive in progress".into()
        }
        .is_recoverable_for_removal());
        assert!(!BlockServerError::Timeout.is_recoverable_for_removal());
    }
}
