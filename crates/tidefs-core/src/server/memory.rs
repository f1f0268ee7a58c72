//! In-memory collaborator implementations.
//!
//! A metadata server and block server holding everything in process
//! memory, with the same conflict detection a real deployment performs.
//! These back the crate's own integration tests and are useful to
//! downstream crates for exercising engine behavior without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::block::{Block, BlockId, BlockPointer, ReadiedBlock};
use crate::meta::{
    BranchId, FolderId, ImmutableMd, MergedStatus, RevisionNumber, RootMetadata,
};
use crate::server::{
    BlockServer, BlockServerError, Clock, ConflictResolver, JournalStatus, KeyAuthority, KeyError,
    MdServer, MdServerError, RekeyEvent, RekeyListener, ResolverError, Session, SystemClock,
    UpdateReceiver, VerifyingKey,
};
use crate::sync::OpContext;

const UPDATE_CHANNEL_CAPACITY: usize = 8;

struct Subscriber {
    since: RevisionNumber,
    tx: mpsc::Sender<Result<(), MdServerError>>,
}

#[derive(Default)]
struct FolderRecord {
    merged: Vec<ImmutableMd>,
    branches: HashMap<BranchId, Vec<ImmutableMd>>,
    subscribers: Vec<Subscriber>,
}

impl FolderRecord {
    fn head(&self) -> Option<&ImmutableMd> {
        self.merged.last()
    }

    fn notify_subscribers(&mut self) {
        let head_rev = match self.head() {
            Some(head) => head.revision(),
            None => return,
        };
        self.subscribers.retain(|sub| {
            if head_rev <= sub.since {
                return true;
            }
            // Pings are edge triggers; a full channel already has one
            // pending, and a closed one means the listener went away.
            match sub.tx.try_send(Ok(())) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// An in-memory [`MdServer`] with real conflict detection.
pub struct MemoryMdServer {
    folders: DashMap<FolderId, Mutex<FolderRecord>>,
    connected: AtomicBool,
    put_calls: AtomicU64,
    clock: SystemClock,
}

impl Default for MemoryMdServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMdServer {
    pub fn new() -> Self {
        Self {
            folders: DashMap::new(),
            connected: AtomicBool::new(true),
            put_calls: AtomicU64::new(0),
            clock: SystemClock,
        }
    }

    /// Simulate losing/regaining the network.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Total successful or attempted put/put_unmerged calls, for tests
    /// asserting network quiescence.
    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Current mainline head of a folder.
    pub fn head(&self, id: FolderId) -> Option<ImmutableMd> {
        self.folders
            .get(&id)
            .and_then(|rec| rec.lock().unwrap().head().cloned())
    }

    /// Branch ids currently stored for a folder.
    pub fn branch_ids(&self, id: FolderId) -> Vec<BranchId> {
        self.folders.get(&id).map_or_else(Vec::new, |rec| {
            rec.lock().unwrap().branches.keys().copied().collect()
        })
    }

    fn check_offline(&self) -> Result<(), MdServerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MdServerError::Unavailable("simulated offline".to_string()))
        }
    }

    fn with_record<R>(
        &self,
        id: FolderId,
        f: impl FnOnce(&mut FolderRecord) -> R,
    ) -> R {
        let rec = self.folders.entry(id).or_default();
        let mut rec = rec.lock().unwrap();
        f(&mut rec)
    }

    fn validate_merged_put(
        rec: &FolderRecord,
        md: &RootMetadata,
    ) -> Result<(), MdServerError> {
        if !md.merged.is_merged() {
            return Err(MdServerError::ConditionFailed {
                reason: "unmerged metadata on the merged put path".to_string(),
            });
        }
        match rec.head() {
            None => {
                if md.revision != RevisionNumber::INITIAL || md.prev_root.is_some() {
                    return Err(MdServerError::ConditionFailed {
                        reason: format!(
                            "first revision must be {} with no predecessor, got {}",
                            RevisionNumber::INITIAL,
                            md.revision
                        ),
                    });
                }
            }
            Some(head) => {
                if md.revision <= head.revision() {
                    return Err(MdServerError::RevisionConflict {
                        attempted: md.revision,
                        current: head.revision(),
                    });
                }
                if md.revision != head.revision().next() {
                    return Err(MdServerError::ConditionFailed {
                        reason: format!(
                            "revision gap: {} after {}",
                            md.revision,
                            head.revision()
                        ),
                    });
                }
                if md.prev_root != Some(head.md_id()) {
                    return Err(MdServerError::PrevRootConflict {
                        attempted: md.revision,
                    });
                }
            }
        }
        Ok(())
    }

    fn freeze(&self, md: RootMetadata) -> Result<ImmutableMd, MdServerError> {
        ImmutableMd::make(md, true, self.clock.now_unix_nanos()).map_err(|e| {
            MdServerError::ConditionFailed {
                reason: format!("unencodable metadata: {e}"),
            }
        })
    }
}

#[async_trait]
impl MdServer for MemoryMdServer {
    async fn get_for_folder(
        &self,
        _ctx: &OpContext,
        id: FolderId,
    ) -> Result<Option<ImmutableMd>, MdServerError> {
        self.check_offline()?;
        Ok(self.head(id))
    }

    async fn get_range(
        &self,
        _ctx: &OpContext,
        id: FolderId,
        start: RevisionNumber,
        end: Option<RevisionNumber>,
    ) -> Result<Vec<ImmutableMd>, MdServerError> {
        self.check_offline()?;
        Ok(self.with_record(id, |rec| {
            rec.merged
                .iter()
                .filter(|md| {
                    md.revision() >= start && end.is_none_or(|end| md.revision() <= end)
                })
                .cloned()
                .collect()
        }))
    }

    async fn get_unmerged_for_folder(
        &self,
        _ctx: &OpContext,
        id: FolderId,
        branch: BranchId,
    ) -> Result<Option<ImmutableMd>, MdServerError> {
        self.check_offline()?;
        Ok(self.with_record(id, |rec| {
            rec.branches.get(&branch).and_then(|b| b.last().cloned())
        }))
    }

    async fn get_unmerged_range(
        &self,
        _ctx: &OpContext,
        id: FolderId,
        branch: BranchId,
        start: RevisionNumber,
        end: Option<RevisionNumber>,
    ) -> Result<Vec<ImmutableMd>, MdServerError> {
        self.check_offline()?;
        Ok(self.with_record(id, |rec| {
            rec.branches.get(&branch).map_or_else(Vec::new, |b| {
                b.iter()
                    .filter(|md| {
                        md.revision() >= start && end.is_none_or(|end| md.revision() <= end)
                    })
                    .cloned()
                    .collect()
            })
        }))
    }

    async fn put(
        &self,
        _ctx: &OpContext,
        md: RootMetadata,
        _key: &VerifyingKey,
    ) -> Result<ImmutableMd, MdServerError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_offline()?;
        let imd = self.freeze(md)?;
        self.with_record(imd.folder_id(), |rec| {
            Self::validate_merged_put(rec, imd.root_metadata())?;
            debug!(revision = %imd.revision(), "memory mdserver accepted merged put");
            rec.merged.push(imd.clone());
            rec.notify_subscribers();
            Ok(imd)
        })
    }

    async fn put_unmerged(
        &self,
        _ctx: &OpContext,
        md: RootMetadata,
        _key: &VerifyingKey,
    ) -> Result<ImmutableMd, MdServerError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_offline()?;
        let branch = match md.merged {
            MergedStatus::Unmerged(bid) => bid,
            MergedStatus::Merged => {
                return Err(MdServerError::ConditionFailed {
                    reason: "merged metadata on the unmerged put path".to_string(),
                })
            }
        };
        let imd = self.freeze(md)?;
        self.with_record(imd.folder_id(), |rec| {
            let revs = rec.branches.entry(branch).or_default();
            if let Some(last) = revs.last() {
                if imd.revision() <= last.revision() {
                    return Err(MdServerError::RevisionConflict {
                        attempted: imd.revision(),
                        current: last.revision(),
                    });
                }
            }
            debug!(
                revision = %imd.revision(),
                branch = %branch,
                "memory mdserver accepted unmerged put"
            );
            revs.push(imd.clone());
            Ok(imd)
        })
    }

    async fn resolve_branch(
        &self,
        _ctx: &OpContext,
        id: FolderId,
        branch: BranchId,
        _blocks_to_delete: &[BlockPointer],
        md: RootMetadata,
        _key: &VerifyingKey,
    ) -> Result<ImmutableMd, MdServerError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_offline()?;
        let imd = self.freeze(md)?;
        self.with_record(id, |rec| {
            if !rec.branches.contains_key(&branch) {
                return Err(MdServerError::UnknownBranch { folder: id, branch });
            }
            Self::validate_merged_put(rec, imd.root_metadata())?;
            rec.branches.remove(&branch);
            rec.merged.push(imd.clone());
            rec.notify_subscribers();
            Ok(imd)
        })
    }

    async fn prune_branch(
        &self,
        _ctx: &OpContext,
        id: FolderId,
        branch: BranchId,
    ) -> Result<(), MdServerError> {
        self.check_offline()?;
        self.with_record(id, |rec| {
            rec.branches.remove(&branch);
        });
        Ok(())
    }

    async fn register_for_updates(
        &self,
        _ctx: &OpContext,
        id: FolderId,
        since: RevisionNumber,
    ) -> Result<UpdateReceiver, MdServerError> {
        self.check_offline()?;
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        self.with_record(id, |rec| {
            let sub = Subscriber { since, tx };
            // Fire immediately if the head has already moved past the
            // registration point.
            if rec.head().is_some_and(|head| head.revision() > since) {
                let _ = sub.tx.try_send(Ok(()));
            }
            rec.subscribers.push(sub);
        });
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// An in-memory [`BlockServer`].
pub struct MemoryBlockServer {
    store: DashMap<BlockPointer, Vec<u8>>,
    next_nonce: AtomicU64,
    connected: AtomicBool,
    get_calls: AtomicU64,
    put_calls: AtomicU64,
}

impl Default for MemoryBlockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlockServer {
    pub fn new() -> Self {
        Self {
            store: DashMap::new(),
            next_nonce: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            get_calls: AtomicU64::new(0),
            put_calls: AtomicU64::new(0),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn block_count(&self) -> usize {
        self.store.len()
    }

    fn check_offline(&self) -> Result<(), BlockServerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BlockServerError::Unavailable(
                "simulated offline".to_string(),
            ))
        }
    }
}

#[async_trait]
impl BlockServer for MemoryBlockServer {
    async fn ready(
        &self,
        _ctx: &OpContext,
        _id: FolderId,
        block: &Block,
    ) -> Result<(BlockPointer, ReadiedBlock), BlockServerError> {
        let bytes = block.canonical_bytes().map_err(|e| {
            BlockServerError::Recoverable {
                reason: format!("unencodable block: {e}"),
            }
        })?;
        let ptr = BlockPointer::new(
            BlockId::hash_of(&bytes),
            self.next_nonce.fetch_add(1, Ordering::SeqCst),
        );
        Ok((ptr, ReadiedBlock { bytes }))
    }

    async fn put(
        &self,
        _ctx: &OpContext,
        _id: FolderId,
        ptr: BlockPointer,
        readied: ReadiedBlock,
    ) -> Result<(), BlockServerError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_offline()?;
        self.store.insert(ptr, readied.bytes);
        Ok(())
    }

    async fn get(
        &self,
        _ctx: &OpContext,
        _id: FolderId,
        ptr: BlockPointer,
    ) -> Result<Block, BlockServerError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check_offline()?;
        let bytes = self
            .store
            .get(&ptr)
            .ok_or(BlockServerError::NotFound { ptr })?;
        Block::decode(&bytes).map_err(|_| BlockServerError::Corrupt { ptr })
    }

    async fn delete(
        &self,
        _ctx: &OpContext,
        _id: FolderId,
        ptrs: &[BlockPointer],
    ) -> Result<(), BlockServerError> {
        self.check_offline()?;
        for ptr in ptrs {
            self.store.remove(ptr);
        }
        Ok(())
    }

    async fn is_unflushed(
        &self,
        _ctx: &OpContext,
        _id: FolderId,
        _block: BlockId,
    ) -> Result<bool, BlockServerError> {
        Ok(false)
    }
}

/// A [`KeyAuthority`] for a single fixed session.
pub struct LocalKeyAuthority {
    session: Session,
}

impl LocalKeyAuthority {
    pub fn new(user: impl Into<String>) -> Self {
        let user = user.into();
        let verifying_key = VerifyingKey(format!("{user}-device-key"));
        Self {
            session: Session {
                user,
                verifying_key,
            },
        }
    }
}

#[async_trait]
impl KeyAuthority for LocalKeyAuthority {
    async fn current_session(&self, _ctx: &OpContext) -> Result<Session, KeyError> {
        Ok(self.session.clone())
    }

    async fn can_read(&self, _ctx: &OpContext, md: &RootMetadata) -> Result<bool, KeyError> {
        Ok(md.is_readable())
    }
}

/// A [`ConflictResolver`] that records every trigger and resolves nothing.
#[derive(Default)]
pub struct RecordingResolver {
    triggers: Mutex<Vec<(Option<RevisionNumber>, Option<RevisionNumber>)>>,
    new_branches: AtomicU64,
}

impl RecordingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triggers(&self) -> Vec<(Option<RevisionNumber>, Option<RevisionNumber>)> {
        self.triggers.lock().unwrap().clone()
    }

    pub fn new_branch_count(&self) -> u64 {
        self.new_branches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConflictResolver for RecordingResolver {
    fn resolve(&self, unmerged: Option<RevisionNumber>, merged: Option<RevisionNumber>) {
        self.triggers.lock().unwrap().push((unmerged, merged));
    }

    async fn wait(&self, _ctx: &OpContext) -> Result<(), ResolverError> {
        Ok(())
    }

    fn force_cancel(&self) {}

    fn begin_new_branch(&self) {
        self.new_branches.fetch_add(1, Ordering::SeqCst);
    }

    fn shutdown(&self) {}
}

/// A [`RekeyListener`] that records every event.
#[derive(Default)]
pub struct RecordingRekeyListener {
    events: Mutex<Vec<RekeyEvent>>,
}

impl RecordingRekeyListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RekeyEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl RekeyListener for RecordingRekeyListener {
    fn rekey_event(&self, event: RekeyEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A [`JournalStatus`] with settable state, for journal-gating tests.
#[derive(Default)]
pub struct StaticJournalStatus {
    state: Mutex<Option<(RevisionNumber, RevisionNumber)>>,
    predecessor: Mutex<Option<RevisionNumber>>,
}

impl StaticJournalStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_revisions(&self, revs: Option<(RevisionNumber, RevisionNumber)>) {
        *self.state.lock().unwrap() = revs;
    }

    pub fn set_predecessor(&self, rev: Option<RevisionNumber>) {
        *self.predecessor.lock().unwrap() = rev;
    }
}

#[async_trait]
impl JournalStatus for StaticJournalStatus {
    async fn predecessor_revision(
        &self,
        _ctx: &OpContext,
    ) -> Result<Option<RevisionNumber>, MdServerError> {
        Ok(*self.predecessor.lock().unwrap())
    }

    async fn revisions(
        &self,
        _ctx: &OpContext,
    ) -> Result<Option<(RevisionNumber, RevisionNumber)>, MdServerError> {
        Ok(*self.state.lock().unwrap())
    }

    async fn wait_for_flush(&self, _ctx: &OpContext) -> Result<(), MdServerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::FolderHandle;

    fn ctx() -> OpContext {
        OpContext::background()
    }

    fn initial_md(folder: FolderId) -> RootMetadata {
        RootMetadata::make_initial(
            folder,
            FolderHandle::private("alice", &["alice"]),
            BlockPointer::temporary(),
            "alice",
        )
    }

    fn key() -> VerifyingKey {
        VerifyingKey("test-key".to_string())
    }

    #[tokio::test]
    async fn test_put_and_get_head() {
        let server = MemoryMdServer::new();
        let folder = FolderId::new_random();
        let imd = server.put(&ctx(), initial_md(folder), &key()).await.unwrap();
        assert_eq!(imd.revision(), RevisionNumber::INITIAL);
        assert!(imd.put_to_server());

        let head = server.get_for_folder(&ctx(), folder).await.unwrap().unwrap();
        assert_eq!(head.md_id(), imd.md_id());
    }

    #[tokio::test]
    async fn test_stale_put_conflicts() {
        let server = MemoryMdServer::new();
        let folder = FolderId::new_random();
        let base = server.put(&ctx(), initial_md(folder), &key()).await.unwrap();

        // Two successors race; the loser gets a revision conflict.
        let winner = base.successor("alice");
        let loser = base.successor("bob");
        server.put(&ctx(), winner, &key()).await.unwrap();
        let err = server.put(&ctx(), loser, &key()).await.unwrap_err();
        assert!(matches!(err, MdServerError::RevisionConflict { .. }));
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_wrong_prev_root_conflicts() {
        let server = MemoryMdServer::new();
        let folder = FolderId::new_random();
        let base = server.put(&ctx(), initial_md(folder), &key()).await.unwrap();

        let mut succ = base.successor("alice");
        succ.prev_root = None;
        let err = server.put(&ctx(), succ, &key()).await.unwrap_err();
        assert!(matches!(err, MdServerError::PrevRootConflict { .. }));
    }

    #[tokio::test]
    async fn test_unmerged_branch_lifecycle() {
        let server = MemoryMdServer::new();
        let folder = FolderId::new_random();
        let base = server.put(&ctx(), initial_md(folder), &key()).await.unwrap();

        let bid = BranchId::new_random();
        let mut unmerged = base.successor("alice");
        unmerged.merged = MergedStatus::Unmerged(bid);
        server.put_unmerged(&ctx(), unmerged, &key()).await.unwrap();
        assert_eq!(server.branch_ids(folder), vec![bid]);

        let newest = server
            .get_unmerged_for_folder(&ctx(), folder, bid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(newest.branch_id(), bid);

        server.prune_branch(&ctx(), folder, bid).await.unwrap();
        assert!(server.branch_ids(folder).is_empty());
    }

    #[tokio::test]
    async fn test_update_registration_pings() {
        let server = MemoryMdServer::new();
        let folder = FolderId::new_random();
        let base = server.put(&ctx(), initial_md(folder), &key()).await.unwrap();

        let mut rx = server
            .register_for_updates(&ctx(), folder, base.revision())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err(), "no ping before a newer revision");

        server.put(&ctx(), base.successor("bob"), &key()).await.unwrap();
        assert!(rx.recv().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_registration_behind_head_fires_immediately() {
        let server = MemoryMdServer::new();
        let folder = FolderId::new_random();
        server.put(&ctx(), initial_md(folder), &key()).await.unwrap();

        let mut rx = server
            .register_for_updates(&ctx(), folder, RevisionNumber(0))
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_offline_simulation() {
        let server = MemoryMdServer::new();
        let folder = FolderId::new_random();
        server.set_connected(false);
        assert!(!server.is_connected());
        let err = server.get_for_folder(&ctx(), folder).await.unwrap_err();
        assert!(matches!(err, MdServerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_block_round_trip() {
        let server = MemoryBlockServer::new();
        let folder = FolderId::new_random();
        let block = Block::empty_dir();

        let (ptr, readied) = server.ready(&ctx(), folder, &block).await.unwrap();
        server.put(&ctx(), folder, ptr, readied).await.unwrap();
        let fetched = server.get(&ctx(), folder, ptr).await.unwrap();
        assert_eq!(fetched, block);

        server.delete(&ctx(), folder, &[ptr]).await.unwrap();
        let err = server.get(&ctx(), folder, ptr).await.unwrap_err();
        assert!(err.is_recoverable_for_removal());
    }

    #[tokio::test]
    async fn test_ready_gives_distinct_nonces_for_same_content() {
        let server = MemoryBlockServer::new();
        let folder = FolderId::new_random();
        let block = Block::empty_dir();
        let (a, _) = server.ready(&ctx(), folder, &block).await.unwrap();
        let (b, _) = server.ready(&ctx(), folder, &block).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.ref_nonce, b.ref_nonce);
    }
}
