//! External collaborators of the folder engine.
//!
//! The engine's outward surface is an internal API boundary, not a wire
//! protocol, but the contracts are exact: blocks are readied/put/fetched
//! through [`BlockServer`], revisions flow through [`MdServer`] (which may
//! be fronted by a local write-ahead journal reported on by
//! [`JournalStatus`]), divergence is handed to a [`ConflictResolver`], and
//! state changes fan out to [`Observer`]s. The engine persists nothing
//! itself; its in-memory state is rebuilt from these collaborators on
//! restart.

pub mod errors;
pub mod memory;

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::block::{Block, BlockId, BlockPointer, ReadiedBlock};
use crate::meta::{BranchId, FolderHandle, FolderId, ImmutableMd, RevisionNumber, RootMetadata, WriteRange};
use crate::node::NodeId;
use crate::sync::OpContext;

pub use errors::{BlockServerError, KeyError, MdServerError, ResolverError};

/// The key a device signs metadata writes with. Opaque to the engine.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct VerifyingKey(pub String);

/// The logged-in identity performing operations.
#[derive(Clone, Debug)]
pub struct Session {
    pub user: String,
    pub verifying_key: VerifyingKey,
}

/// A ping stream for remote updates: `Ok(())` means new revisions are
/// available above the registered point; an error ends the registration.
pub type UpdateReceiver = mpsc::Receiver<Result<(), MdServerError>>;

/// The metadata server (possibly fronted by a journal).
#[async_trait]
pub trait MdServer: Send + Sync {
    /// The current mainline head, if the folder exists.
    async fn get_for_folder(
        &self,
        ctx: &OpContext,
        id: FolderId,
    ) -> Result<Option<ImmutableMd>, MdServerError>;

    /// Merged revisions `start..=end` in ascending order (`end = None`
    /// means "through the current head").
    async fn get_range(
        &self,
        ctx: &OpContext,
        id: FolderId,
        start: RevisionNumber,
        end: Option<RevisionNumber>,
    ) -> Result<Vec<ImmutableMd>, MdServerError>;

    /// The newest revision of an unmerged branch.
    async fn get_unmerged_for_folder(
        &self,
        ctx: &OpContext,
        id: FolderId,
        branch: BranchId,
    ) -> Result<Option<ImmutableMd>, MdServerError>;

    /// Unmerged revisions `start..=end` of a branch, ascending.
    async fn get_unmerged_range(
        &self,
        ctx: &OpContext,
        id: FolderId,
        branch: BranchId,
        start: RevisionNumber,
        end: Option<RevisionNumber>,
    ) -> Result<Vec<ImmutableMd>, MdServerError>;

    /// Publish a merged revision. May fail with any of the closed conflict
    /// classes (see [`MdServerError::is_conflict`]).
    async fn put(
        &self,
        ctx: &OpContext,
        md: RootMetadata,
        key: &VerifyingKey,
    ) -> Result<ImmutableMd, MdServerError>;

    /// Publish a revision onto an unmerged branch.
    async fn put_unmerged(
        &self,
        ctx: &OpContext,
        md: RootMetadata,
        key: &VerifyingKey,
    ) -> Result<ImmutableMd, MdServerError>;

    /// Atomically publish a resolution of `branch` onto the mainline and
    /// drop the branch.
    async fn resolve_branch(
        &self,
        ctx: &OpContext,
        id: FolderId,
        branch: BranchId,
        blocks_to_delete: &[BlockPointer],
        md: RootMetadata,
        key: &VerifyingKey,
    ) -> Result<ImmutableMd, MdServerError>;

    /// Drop an unmerged branch that is no longer needed.
    async fn prune_branch(
        &self,
        ctx: &OpContext,
        id: FolderId,
        branch: BranchId,
    ) -> Result<(), MdServerError>;

    /// Register for pings about revisions newer than `since`.
    async fn register_for_updates(
        &self,
        ctx: &OpContext,
        id: FolderId,
        since: RevisionNumber,
    ) -> Result<UpdateReceiver, MdServerError>;

    /// Best-effort connectivity signal used by offline shortcuts.
    fn is_connected(&self) -> bool;
}

/// The content-addressed block store.
#[async_trait]
pub trait BlockServer: Send + Sync {
    /// Encode a block for upload and assign it a pointer.
    async fn ready(
        &self,
        ctx: &OpContext,
        id: FolderId,
        block: &Block,
    ) -> Result<(BlockPointer, ReadiedBlock), BlockServerError>;

    /// Upload a readied block.
    async fn put(
        &self,
        ctx: &OpContext,
        id: FolderId,
        ptr: BlockPointer,
        readied: ReadiedBlock,
    ) -> Result<(), BlockServerError>;

    /// Fetch and decode a block.
    async fn get(
        &self,
        ctx: &OpContext,
        id: FolderId,
        ptr: BlockPointer,
    ) -> Result<Block, BlockServerError>;

    /// Delete blocks (rollback of a failed revision). Missing blocks are
    /// not an error.
    async fn delete(
        &self,
        ctx: &OpContext,
        id: FolderId,
        ptrs: &[BlockPointer],
    ) -> Result<(), BlockServerError>;

    /// Whether a block is still sitting in a local journal rather than on
    /// the server.
    async fn is_unflushed(
        &self,
        ctx: &OpContext,
        id: FolderId,
        block: BlockId,
    ) -> Result<bool, BlockServerError>;
}

/// The external conflict-resolution service.
///
/// `resolve` is fire-and-continue: the resolver works in the background and
/// re-enters the engine through its finalize/unstage entry points.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Kick off resolution between the newest unmerged revision and the
    /// newest known merged revision (either may be unknown).
    fn resolve(&self, unmerged: Option<RevisionNumber>, merged: Option<RevisionNumber>);

    /// Wait for any in-flight resolution to finish.
    async fn wait(&self, ctx: &OpContext) -> Result<(), ResolverError>;

    /// Abort any in-flight resolution.
    fn force_cancel(&self);

    /// The engine switched unmerged branch ids; resolution bookkeeping
    /// must start over.
    fn begin_new_branch(&self);

    fn shutdown(&self);
}

/// Identity, session, and readability checks.
#[async_trait]
pub trait KeyAuthority: Send + Sync {
    async fn current_session(&self, ctx: &OpContext) -> Result<Session, KeyError>;

    /// Whether this device holds keys able to decrypt the given revision.
    async fn can_read(&self, ctx: &OpContext, md: &RootMetadata) -> Result<bool, KeyError>;
}

/// Journal status, present only when a local write-ahead journal fronts
/// the metadata server.
#[async_trait]
pub trait JournalStatus: Send + Sync {
    /// The newest merged revision known to have actually reached the
    /// server (the journal's predecessor), or `None` when the journal has
    /// flushed nothing yet.
    async fn predecessor_revision(
        &self,
        ctx: &OpContext,
    ) -> Result<Option<RevisionNumber>, MdServerError>;

    /// `(flushed_end, journal_end)`: the newest flushed revision and the
    /// newest revision still buffered locally. `None` when the journal is
    /// empty.
    async fn revisions(
        &self,
        ctx: &OpContext,
    ) -> Result<Option<(RevisionNumber, RevisionNumber)>, MdServerError>;

    /// Wait for everything buffered to reach the server.
    async fn wait_for_flush(&self, ctx: &OpContext) -> Result<(), MdServerError>;
}

/// An event originated by the engine for the external rekey state machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RekeyEvent {
    /// A remote revision carried an active rekey request.
    Needed { folder: FolderId },
    /// A remote revision confirmed no rekey is pending.
    NotNeeded { folder: FolderId },
    /// A local caller explicitly asked for a rekey.
    Requested { folder: FolderId },
}

/// Receives [`RekeyEvent`]s; the state machine itself lives elsewhere.
pub trait RekeyListener: Send + Sync {
    fn rekey_event(&self, event: RekeyEvent);
}

/// One batched change to a cached node, delivered to observers.
#[derive(Clone, Debug)]
pub struct NodeChange {
    pub node: NodeId,
    /// Child names whose entries changed, for directory nodes.
    pub dir_updated: Vec<String>,
    /// Byte ranges invalidated, for file nodes.
    pub file_updated: Vec<WriteRange>,
}

impl NodeChange {
    pub fn dir(node: NodeId, names: Vec<String>) -> Self {
        Self {
            node,
            dir_updated: names,
            file_updated: Vec::new(),
        }
    }

    pub fn file(node: NodeId, ranges: Vec<WriteRange>) -> Self {
        Self {
            node,
            dir_updated: Vec::new(),
            file_updated: ranges,
        }
    }
}

/// Receives engine state-change notifications, outside any engine lock.
pub trait Observer: Send + Sync {
    /// A batch of node changes plus coarser "these nodes are affected"
    /// invalidation ids.
    fn batch_changes(&self, changes: &[NodeChange], affected: &[NodeId]);

    /// The folder's handle resolved to a new name.
    fn handle_change(&self, new_handle: &FolderHandle);

    /// The folder became readable on this device (a rekey landed).
    fn became_readable(&self, handle: &FolderHandle);
}

/// Registration list for observers.
#[derive(Default)]
pub struct ObserverList {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn Observer>) {
        self.observers.write().unwrap().push(observer);
    }

    /// Remove a previously registered observer (by identity).
    pub fn unregister(&self, observer: &Arc<dyn Observer>) {
        self.observers
            .write()
            .unwrap()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    fn snapshot(&self) -> Vec<Arc<dyn Observer>> {
        self.observers.read().unwrap().clone()
    }

    pub fn batch_changes(&self, changes: &[NodeChange], affected: &[NodeId]) {
        for observer in self.snapshot() {
            observer.batch_changes(changes, affected);
        }
    }

    pub fn handle_change(&self, new_handle: &FolderHandle) {
        for observer in self.snapshot() {
            observer.handle_change(new_handle);
        }
    }

    pub fn became_readable(&self, handle: &FolderHandle) {
        for observer in self.snapshot() {
            observer.became_readable(handle);
        }
    }
}

impl fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverList")
            .field("len", &self.observers.read().unwrap().len())
            .finish()
    }
}

/// Time source, injectable for tests.
pub trait Clock: Send + Sync {
    /// Unix nanoseconds.
    fn now_unix_nanos(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_nanos(&self) -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
    }
}
