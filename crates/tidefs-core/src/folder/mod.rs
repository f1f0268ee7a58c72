//! The folder-branch operation engine.
//!
//! One [`FolderBranchEngine`] instance runs per folder-branch and is safe
//! for concurrent use within that folder. It turns staged filesystem
//! operations into immutable metadata revisions (the sync engine), applies
//! remote revisions in order (the update engine), and coordinates the
//! background loops that keep both running (the lifecycle coordinator).
//!
//! # Locks
//!
//! Four leveled locks, always taken in this order:
//!
//! 1. **writer lock** — held for the entirety of any operation that
//!    mutates folder metadata, so at most one revision is ever under
//!    construction. Protects the unmerged branch id and the staged
//!    operation buffer.
//! 2. **head lock** (rw) — protects the current head revision and the
//!    latest-merged watermark. Taken for the shortest possible span;
//!    remote-sync flows take it for writing only after all network access
//!    has finished.
//! 3. **block lock** (rw) — protects the dirty-block stage. Writes and
//!    truncates hold it for their whole (local) lifetime; fetches release
//!    it around the network call and retake it to cache the result.
//! 4. **sync lock** (rw) — protects root-block prefetch bookkeeping; the
//!    innermost level, never held across acquisition of the others.
//!
//! Violations of this order panic at the acquisition site (see
//! [`crate::sync::leveled`]).

pub mod buffer;
pub mod config;
pub mod errors;
pub mod head;
pub mod lifecycle;
pub mod sync_engine;
pub mod updates;
pub mod write_ops;

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::block::{Block, BlockPointer, BlockRef};
use crate::meta::{BranchId, FolderId, MdId, RevisionNumber};
use crate::node::NodeCache;
use crate::server::{
    BlockServer, Clock, ConflictResolver, JournalStatus, KeyAuthority, MdServer, Observer,
    ObserverList, RekeyEvent, RekeyListener,
};
use crate::sync::{LeveledMutex, LeveledRwLock, LockState, MutexLevel, OpContext, RepeatedWaitGroup};

pub use buffer::{BlockStage, CachedDirOp, DeferredWrite, OpBuffer, StageState};
pub use config::EngineConfig;
pub use errors::EngineError;
pub use head::{HeadState, HeadTrust};

pub(crate) const LOCK_WRITER: MutexLevel = MutexLevel(0);
pub(crate) const LOCK_HEAD: MutexLevel = MutexLevel(1);
pub(crate) const LOCK_BLOCK: MutexLevel = MutexLevel(2);
pub(crate) const LOCK_SYNC: MutexLevel = MutexLevel(3);

fn lock_level_name(level: MutexLevel) -> &'static str {
    match level.0 {
        0 => "writerLock",
        1 => "headLock",
        2 => "blockLock",
        3 => "syncLock",
        _ => "invalidLock",
    }
}

/// Every logical flow through the engine makes one of these near its top
/// and plumbs it through, so lock-order violations surface at runtime.
pub(crate) fn make_lock_state() -> LockState {
    LockState::new(lock_level_name)
}

/// Context tag: the engine instance an operation belongs to.
pub const CTX_ENGINE_ID: &str = "engine-id";
/// Context tag marking flows that originate from a background loop.
pub const CTX_BACKGROUND: &str = "background";

const CLEAN_BLOCK_CACHE_CAPACITY: u64 = 4096;

/// Name of a folder branch; the default branch is the merged mainline.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct BranchName(String);

impl BranchName {
    pub fn master() -> Self {
        Self("master".to_string())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn is_master(&self) -> bool {
        self.0 == "master"
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One folder plus the branch of it this engine follows.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FolderBranch {
    pub folder: FolderId,
    pub branch: BranchName,
}

impl FolderBranch {
    pub fn master(folder: FolderId) -> Self {
        Self {
            folder,
            branch: BranchName::master(),
        }
    }
}

/// External collaborators handed to the engine at construction.
#[derive(Clone)]
pub struct Services {
    pub md_server: Arc<dyn MdServer>,
    pub block_server: Arc<dyn BlockServer>,
    pub resolver: Arc<dyn ConflictResolver>,
    pub keys: Arc<dyn KeyAuthority>,
    pub rekey: Arc<dyn RekeyListener>,
    /// Present only when a local write-ahead journal fronts the metadata
    /// server.
    pub journal: Option<Arc<dyn JournalStatus>>,
    pub clock: Arc<dyn Clock>,
}

/// State protected by the writer lock.
#[derive(Debug)]
pub(crate) struct WriterState {
    /// Null while following the merged mainline; a specific id while this
    /// device has diverged onto a local branch.
    pub unmerged_bid: BranchId,
    pub ops: OpBuffer,
}

impl WriterState {
    fn new() -> Self {
        Self {
            unmerged_bid: BranchId::NULL,
            ops: OpBuffer::new(),
        }
    }

    pub fn is_unmerged(&self) -> bool {
        !self.unmerged_bid.is_null()
    }
}

/// An in-flight root-block prefetch (protected by the sync lock).
#[derive(Debug)]
pub(crate) struct RootFetch {
    pub md_id: MdId,
    pub done: watch::Receiver<bool>,
}

#[derive(Debug, Default)]
pub(crate) struct PrefetchState {
    pub root_fetch: Option<RootFetch>,
}

#[derive(Debug, Default)]
pub(crate) struct StatusKeeper {
    permanent_error: Mutex<Option<String>>,
}

impl StatusKeeper {
    pub fn set_permanent_error(&self, err: String) {
        *self.permanent_error.lock().unwrap() = Some(err);
    }

    pub fn permanent_error(&self) -> Option<String> {
        self.permanent_error.lock().unwrap().clone()
    }
}

/// Point-in-time summary of one folder-branch engine.
#[derive(Clone, Debug)]
pub struct FolderStatus {
    pub folder: FolderId,
    pub head_revision: Option<RevisionNumber>,
    pub unmerged_bid: BranchId,
    pub latest_merged_revision: Option<RevisionNumber>,
    pub dirty_file_count: usize,
    pub staged_op_count: usize,
    pub permanent_error: Option<String>,
}

/// The per-folder-branch operation engine.
///
/// Construct with [`FolderBranchEngine::new`] inside a tokio runtime (the
/// background flusher is spawned immediately; the update-registration loop
/// starts when the first head is set). Wrap-free sharing: the constructor
/// returns an `Arc` and all operations take `&self`.
pub struct FolderBranchEngine {
    pub(crate) services: Services,
    pub(crate) config: EngineConfig,
    folder: FolderBranch,
    engine_id: String,

    pub(crate) writer_lock: LeveledMutex<WriterState>,
    pub(crate) head_lock: LeveledRwLock<HeadState>,
    pub(crate) block_lock: LeveledRwLock<BlockStage>,
    pub(crate) sync_lock: LeveledRwLock<PrefetchState>,

    pub(crate) nodes: NodeCache,
    pub(crate) observers: ObserverList,
    pub(crate) clean_blocks: moka::sync::Cache<BlockRef, Arc<Block>>,
    pub(crate) latest_merged_rx: watch::Receiver<Option<RevisionNumber>>,

    /// Cancelled exactly once, at shutdown; every background flow is a
    /// child of this context.
    pub(crate) shutdown_ctx: OpContext,
    pub(crate) sync_needed_tx: mpsc::Sender<()>,
    pub(crate) force_sync_tx: mpsc::Sender<()>,
    pub(crate) update_pause_tx: mpsc::Sender<oneshot::Receiver<()>>,
    /// Held here until the registration loop starts and takes it.
    pub(crate) update_pause_rx: Mutex<Option<mpsc::Receiver<oneshot::Receiver<()>>>>,

    pub(crate) flusher_handle: Mutex<Option<JoinHandle<()>>>,
    pub(crate) registration_handle: Mutex<Option<JoinHandle<()>>>,
    /// Cancels the current update-registration flow without shutting the
    /// whole engine down (fatal server errors).
    pub(crate) cancel_updates: Mutex<Option<OpContext>>,

    pub(crate) edit_activity: RepeatedWaitGroup,
    pub(crate) branch_changes: RepeatedWaitGroup,
    pub(crate) archivals: RepeatedWaitGroup,

    pub(crate) status: StatusKeeper,
    self_ref: OnceLock<Weak<Self>>,
}

impl FolderBranchEngine {
    /// Build an engine for one folder-branch and start its background
    /// flusher. Must be called within a tokio runtime.
    pub fn new(folder: FolderBranch, services: Services, config: EngineConfig) -> Arc<Self> {
        let (head_state, latest_merged_rx) = HeadState::new();
        let (sync_needed_tx, sync_needed_rx) = mpsc::channel(1);
        let (force_sync_tx, force_sync_rx) = mpsc::channel(1);
        let (update_pause_tx, update_pause_rx) = mpsc::channel(1);

        let engine = Arc::new(Self {
            services,
            config,
            folder,
            engine_id: format!("{:08x}", rand::random::<u32>()),
            writer_lock: LeveledMutex::new(LOCK_WRITER, WriterState::new()),
            head_lock: LeveledRwLock::new(LOCK_HEAD, head_state),
            block_lock: LeveledRwLock::new(LOCK_BLOCK, BlockStage::new()),
            sync_lock: LeveledRwLock::new(LOCK_SYNC, PrefetchState::default()),
            nodes: NodeCache::new(),
            observers: ObserverList::new(),
            clean_blocks: moka::sync::Cache::new(CLEAN_BLOCK_CACHE_CAPACITY),
            latest_merged_rx,
            shutdown_ctx: OpContext::background().child(),
            sync_needed_tx,
            force_sync_tx,
            update_pause_tx,
            update_pause_rx: Mutex::new(Some(update_pause_rx)),
            flusher_handle: Mutex::new(None),
            registration_handle: Mutex::new(None),
            cancel_updates: Mutex::new(None),
            edit_activity: RepeatedWaitGroup::new(),
            branch_changes: RepeatedWaitGroup::new(),
            archivals: RepeatedWaitGroup::new(),
            status: StatusKeeper::default(),
            self_ref: OnceLock::new(),
        });
        engine
            .self_ref
            .set(Arc::downgrade(&engine))
            .expect("self_ref set twice");
        engine.spawn_background_flusher(sync_needed_rx, force_sync_rx);
        engine
    }

    pub fn id(&self) -> FolderId {
        self.folder.folder
    }

    pub fn folder_branch(&self) -> &FolderBranch {
        &self.folder
    }

    pub(crate) fn upgrade_self(&self) -> Option<Arc<Self>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    /// A child of `parent` tagged with this engine's id, one per public
    /// operation.
    pub(crate) fn new_ctx(&self, parent: &OpContext) -> OpContext {
        parent.child().with_value(CTX_ENGINE_ID, self.engine_id.clone())
    }

    /// A context for a background flow: dies with the engine, tagged as
    /// background.
    pub(crate) fn background_ctx(&self) -> OpContext {
        self.shutdown_ctx
            .child()
            .with_value(CTX_ENGINE_ID, self.engine_id.clone())
            .with_value(CTX_BACKGROUND, "1")
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown_ctx.is_cancelled()
    }

    pub(crate) fn check_running(&self) -> Result<(), EngineError> {
        if self.is_shut_down() {
            Err(EngineError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Wake the background flusher for a buffered write.
    pub(crate) fn signal_write(&self) {
        let _ = self.sync_needed_tx.try_send(());
    }

    /// Ask the background flusher to sync immediately.
    pub fn force_sync_signal(&self) {
        let _ = self.force_sync_tx.try_send(());
    }

    /// Pause the update loop; the returned sender unpauses it (dropping it
    /// unpauses too).
    pub fn pause_updates(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        if self.update_pause_tx.try_send(rx).is_err() {
            warn!("update loop pause channel full; pause request dropped");
        }
        tx
    }

    pub fn register_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.register(observer);
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn Observer>) {
        self.observers.unregister(observer);
    }

    /// Originate a rekey request for this folder into the external rekey
    /// state machine.
    pub fn request_rekey(&self) {
        self.services.rekey.rekey_event(RekeyEvent::Requested {
            folder: self.folder.folder,
        });
    }

    /// Fetch a block through the clean-block cache. Callers must not hold
    /// the block lock (the fetch may hit the network).
    pub(crate) async fn fetch_block(
        &self,
        ctx: &OpContext,
        ptr: BlockPointer,
    ) -> Result<Arc<Block>, EngineError> {
        if let Some(block) = self.clean_blocks.get(&ptr.bref()) {
            return Ok(block);
        }
        let block = self
            .services
            .block_server
            .get(ctx, self.folder.folder, ptr)
            .await?;
        let block = Arc::new(block);
        self.clean_blocks.insert(ptr.bref(), Arc::clone(&block));
        Ok(block)
    }

    /// Read a block, preferring the dirty copy. Takes (and releases) the
    /// block lock internally: on a cache miss the shared hold is dropped
    /// around the slow fetch rather than pinning other readers out.
    pub(crate) async fn block_for_reading(
        &self,
        ctx: &OpContext,
        lstate: &LockState,
        ptr: BlockPointer,
    ) -> Result<Arc<Block>, EngineError> {
        {
            let stage = self.block_lock.read(lstate).await;
            if let Some(block) = stage.block(ptr.bref()) {
                return Ok(Arc::new(block.clone()));
            }
        }
        self.fetch_block(ctx, ptr).await
    }

    /// Map fetch failures for reads: offline errors on folders without
    /// full local sync become the distinguished offline-unsynced error.
    pub(crate) fn transform_read_error(&self, err: EngineError) -> EngineError {
        if self.config.fully_synced {
            return err;
        }
        match &err {
            EngineError::BlockServer(
                crate::server::BlockServerError::Unavailable(_)
                | crate::server::BlockServerError::Timeout,
            )
            | EngineError::MdServer(
                crate::server::MdServerError::Unavailable(_)
                | crate::server::MdServerError::Timeout,
            ) => EngineError::OfflineUnsynced {
                folder: self.folder.folder.to_string(),
            },
            _ => err,
        }
    }

    /// Whether any buffered file write is outstanding.
    pub(crate) fn is_dirty<'a>(
        &'a self,
        lstate: &'a LockState,
    ) -> impl Future<Output = bool> + Send + use<'a> {
        async move {
            let stage = self.block_lock.read(lstate).await;
            stage.state() == StageState::Dirty
        }
    }

    /// Whether any buffered file write *or* staged operation is
    /// outstanding. Requires the writer lock (for the op buffer).
    pub(crate) async fn is_dirty_locked(&self, ws: &WriterState, lstate: &LockState) -> bool {
        !ws.ops.is_empty() || self.is_dirty(lstate).await
    }

    /// Current status snapshot.
    pub async fn status(&self, _ctx: &OpContext) -> FolderStatus {
        let lstate = make_lock_state();
        let ws = self.writer_lock.lock(&lstate).await;
        let (head_revision, latest_merged_revision) = {
            let hs = self.head_lock.read(&lstate).await;
            (
                hs.head.as_ref().map(crate::meta::ImmutableMd::revision),
                hs.latest_merged,
            )
        };
        let dirty_file_count = {
            let stage = self.block_lock.read(&lstate).await;
            stage.dirty_file_refs().len()
        };
        FolderStatus {
            folder: self.folder.folder,
            head_revision,
            unmerged_bid: ws.unmerged_bid,
            latest_merged_revision,
            dirty_file_count,
            staged_op_count: ws.ops.len(),
            permanent_error: self.status.permanent_error(),
        }
    }

    /// Subscribe to latest-merged watermark changes; `borrow_and_update`
    /// then `changed().await` gives "wait until it changes since I last
    /// observed it".
    pub fn latest_merged_watch(&self) -> watch::Receiver<Option<RevisionNumber>> {
        self.latest_merged_rx.clone()
    }
}

impl fmt::Debug for FolderBranchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FolderBranchEngine")
            .field("folder", &self.folder)
            .field("engine_id", &self.engine_id)
            .finish_non_exhaustive()
    }
}
