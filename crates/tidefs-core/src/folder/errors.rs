//! Engine-level error taxonomy.
//!
//! Four families matter to callers:
//! - conflicts never surface raw; the engine absorbs them by switching to
//!   an unmerged put or by resyncing (see the retry wrapper);
//! - control-flow signals ([`EngineError::Unmerged`],
//!   [`EngineError::UnmergedSelfConflict`],
//!   [`EngineError::ExclusiveCreateRace`]) drive the retry wrapper and the
//!   registration loop rather than reporting failures;
//! - invariant violations abort the enclosing flow;
//! - everything else propagates unchanged.

use thiserror::Error;

use crate::block::BlockError;
use crate::meta::{MetadataError, OpInvertError, RevisionNumber};
use crate::server::{BlockServerError, KeyError, MdServerError, ResolverError};
use crate::sync::{CoalescingError, ContextError};

/// An error from a folder-branch engine operation.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("engine is shut down")]
    Shutdown,
    #[error("folder head has not been initialized")]
    NotInitialized,

    #[error("{user} is not a writer of {folder}")]
    WriteAccess { user: String, folder: String },
    #[error("{user} cannot read {folder}")]
    ReadAccess { user: String, folder: String },

    #[error("{name} already exists")]
    NameExists { name: String },
    #[error("{name} does not exist")]
    NoSuchEntry { name: String },
    #[error("{name} is not a directory")]
    NotADirectory { name: String },
    #[error("{name} is not a file")]
    NotAFile { name: String },
    #[error("directory {name} is not empty")]
    DirNotEmpty { name: String },
    #[error("node is no longer cached")]
    StaleNode,

    /// Local state has diverged onto an unmerged branch; the caller must
    /// wait for conflict resolution rather than apply merged updates.
    #[error("folder is on an unmerged branch")]
    Unmerged,
    /// An unmerged put conflicted with this device's own prior unmerged
    /// revision; the retry wrapper must force a resync before retrying.
    #[error("unmerged put conflicted with our own branch")]
    UnmergedSelfConflict(#[source] MdServerError),
    /// An exclusive create lost the publish race. Surfaced (after a
    /// fast-forward) instead of silently moving to an unmerged branch.
    #[error("exclusive create lost a race with another writer")]
    ExclusiveCreateRace,

    #[error("cannot apply remote updates to dirty local state")]
    NoUpdatesWhileDirty,
    #[error("operation not permitted while local state is dirty")]
    NotPermittedWhileDirty,
    #[error("cannot undo revision {rev}: head is {head}")]
    MdUpdateInvert {
        rev: RevisionNumber,
        head: RevisionNumber,
    },
    #[error("still on an unmerged branch after conflict resolution")]
    StillStagedAfterResolution,

    /// A fetch failed while offline and this folder is not configured for
    /// full local sync; upper layers should recommend enabling sync.
    #[error("{folder} is unavailable offline; enable full sync to keep it available")]
    OfflineUnsynced { folder: String },

    /// Engine-state corruption; aborts the enclosing flow.
    #[error("engine invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Op(#[from] OpInvertError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    MdServer(#[from] MdServerError),
    #[error(transparent)]
    BlockServer(#[from] BlockServerError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
}

impl From<ContextError> for EngineError {
    fn from(_: ContextError) -> Self {
        EngineError::Cancelled
    }
}

impl From<CoalescingError> for EngineError {
    fn from(_: CoalescingError) -> Self {
        EngineError::Cancelled
    }
}

impl EngineError {
    /// Whether the metadata-write retry wrapper should run the operation
    /// again rather than surface this error.
    pub fn is_retriable(&self) -> bool {
        match self {
            EngineError::ExclusiveCreateRace | EngineError::UnmergedSelfConflict(_) => true,
            EngineError::BlockServer(e) => e.is_recoverable_for_removal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockPointer;

    #[test]
    fn test_retriable_classification() {
        assert!(EngineError::ExclusiveCreateRace.is_retriable());
        assert!(EngineError::UnmergedSelfConflict(MdServerError::RevisionConflict {
            attempted: RevisionNumber(4),
            current: RevisionNumber(4),
        })
        .is_retriable());
        assert!(EngineError::BlockServer(BlockServerError::NotFound {
            ptr: BlockPointer::ZERO
        })
        .is_retriable());

        assert!(!EngineError::Cancelled.is_retriable());
        assert!(!EngineError::Unmerged.is_retriable());
        assert!(!EngineError::WriteAccess {
            user: "reader".into(),
            folder: "a,b".into()
        }
        .is_retriable());
    }
}
