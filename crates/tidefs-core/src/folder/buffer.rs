//! Staging area between user operations and the sync engine.
//!
//! [`OpBuffer`] accumulates directory-mutating operations in order;
//! [`BlockStage`] holds the dirty block copies those operations (and file
//! writes) produced. Neither is independently thread-safe: the op buffer
//! lives under the writer lock and the block stage under the block lock,
//! per the engine's lock hierarchy.

use std::collections::{HashMap, HashSet};

use crate::block::{Block, BlockRef};
use crate::meta::{FolderOp, WriteRange};
use crate::node::NodeId;

/// A buffered, not-yet-synced directory operation and the nodes it
/// touches (parents first, then any created/target node).
#[derive(Clone, Debug)]
pub struct CachedDirOp {
    pub op: FolderOp,
    pub nodes: Vec<NodeId>,
}

/// Ordered buffer of staged directory operations.
///
/// Operations are replayed into the next revision in exactly the order
/// appended; a failed staged operation removes exactly the entries it
/// added via [`undo_last`](Self::undo_last).
#[derive(Debug, Default)]
pub struct OpBuffer {
    ops: Vec<CachedDirOp>,
}

impl OpBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: FolderOp, nodes: Vec<NodeId>) {
        self.ops.push(CachedDirOp { op, nodes });
    }

    /// Roll back the most recently staged operation.
    pub fn undo_last(&mut self) -> Option<CachedDirOp> {
        self.ops.pop()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CachedDirOp> {
        self.ops.iter()
    }

    /// Take every buffered operation, leaving the buffer empty. Called
    /// only after a successful sync.
    pub fn drain(&mut self) -> Vec<CachedDirOp> {
        std::mem::take(&mut self.ops)
    }
}

/// A write (or truncate) that arrived while its file was mid-sync;
/// re-applied against the file's new pointers once the sync publishes.
#[derive(Clone, Debug)]
pub struct DeferredWrite {
    pub node: NodeId,
    pub offset: u64,
    pub data: Vec<u8>,
    /// Truncate the file to `offset` instead of writing `data`.
    pub truncate: bool,
}

/// Whether any in-memory state is waiting to be synced.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StageState {
    Clean,
    Dirty,
}

/// Dirty-block staging for one folder-branch.
#[derive(Debug, Default)]
pub struct BlockStage {
    /// Dirty file blocks, by ref, with the owning node.
    dirty_files: HashMap<BlockRef, NodeId>,
    /// Dirty directory blocks, by ref, with the owning node.
    dirty_dirs: HashMap<BlockRef, NodeId>,
    /// The dirty copies themselves (files and directories).
    blocks: HashMap<BlockRef, Block>,
    /// Spans written per dirty file, for the revision's sync ops.
    staged_writes: HashMap<BlockRef, Vec<WriteRange>>,
    /// Writes deferred because their file was mid-sync.
    deferred_writes: Vec<DeferredWrite>,
    /// Files currently being flushed by the sync engine.
    sync_in_progress: HashSet<BlockRef>,
}

impl BlockStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clean/dirty is judged on file writes only: staged directory
    /// snapshots always travel with a buffered op, and the op buffer is
    /// what gates flows that must also exclude pending operations.
    pub fn state(&self) -> StageState {
        if self.dirty_files.is_empty() {
            StageState::Clean
        } else {
            StageState::Dirty
        }
    }

    pub fn mark_file_dirty(&mut self, bref: BlockRef, node: NodeId) {
        self.dirty_files.insert(bref, node);
    }

    pub fn mark_dir_dirty(&mut self, bref: BlockRef, node: NodeId) {
        self.dirty_dirs.insert(bref, node);
    }

    /// Snapshot of outstanding dirty file refs, for scheduling decisions.
    pub fn dirty_file_refs(&self) -> Vec<BlockRef> {
        self.dirty_files.keys().copied().collect()
    }

    /// Snapshot of outstanding dirty directory refs.
    pub fn dirty_dir_refs(&self) -> Vec<BlockRef> {
        self.dirty_dirs.keys().copied().collect()
    }

    pub fn dirty_node(&self, bref: BlockRef) -> Option<NodeId> {
        self.dirty_files
            .get(&bref)
            .or_else(|| self.dirty_dirs.get(&bref))
            .copied()
    }

    pub fn block(&self, bref: BlockRef) -> Option<&Block> {
        self.blocks.get(&bref)
    }

    pub fn block_mut(&mut self, bref: BlockRef) -> Option<&mut Block> {
        self.blocks.get_mut(&bref)
    }

    pub fn insert_block(&mut self, bref: BlockRef, block: Block) {
        self.blocks.insert(bref, block);
    }

    pub fn record_write(&mut self, bref: BlockRef, range: WriteRange) {
        self.staged_writes.entry(bref).or_default().push(range);
    }

    pub fn staged_writes(&self, bref: BlockRef) -> Vec<WriteRange> {
        self.staged_writes.get(&bref).cloned().unwrap_or_default()
    }

    pub fn defer_write(&mut self, write: DeferredWrite) {
        self.deferred_writes.push(write);
    }

    pub fn take_deferred_writes(&mut self) -> Vec<DeferredWrite> {
        std::mem::take(&mut self.deferred_writes)
    }

    pub fn begin_sync(&mut self, refs: &[BlockRef]) {
        self.sync_in_progress.extend(refs.iter().copied());
    }

    pub fn end_sync(&mut self) {
        self.sync_in_progress.clear();
    }

    pub fn is_syncing(&self, bref: BlockRef) -> bool {
        self.sync_in_progress.contains(&bref)
    }

    /// Drop all staged state for one block (an unlinked file, or a block
    /// that just synced).
    pub fn discard(&mut self, bref: BlockRef) {
        self.dirty_files.remove(&bref);
        self.dirty_dirs.remove(&bref);
        self.blocks.remove(&bref);
        self.staged_writes.remove(&bref);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockPointer, EntryType};
    use crate::meta::FolderOp;

    fn bref() -> BlockRef {
        BlockPointer::temporary().bref()
    }

    fn node_for_tests() -> NodeId {
        let cache = crate::node::NodeCache::new();
        cache.get_or_create_root(BlockPointer::temporary())
    }

    #[test]
    fn test_op_buffer_preserves_order() {
        let mut buffer = OpBuffer::new();
        let dir = BlockPointer::temporary();
        buffer.add(FolderOp::create("a", dir, EntryType::File), vec![]);
        buffer.add(FolderOp::create("b", dir, EntryType::File), vec![]);
        buffer.add(FolderOp::remove("a", dir, EntryType::File), vec![]);

        let kinds: Vec<_> = buffer.iter().map(|c| c.op.kind()).collect();
        assert_eq!(kinds, ["create", "create", "remove"]);

        let drained = buffer.drain();
        assert_eq!(drained.len(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_undo_last_removes_only_newest() {
        let mut buffer = OpBuffer::new();
        let dir = BlockPointer::temporary();
        buffer.add(FolderOp::create("a", dir, EntryType::File), vec![]);
        buffer.add(FolderOp::create("b", dir, EntryType::File), vec![]);

        let undone = buffer.undo_last().unwrap();
        match undone.op {
            FolderOp::Create { name, .. } => assert_eq!(name, "b"),
            other => panic!("unexpected op {other:?}"),
        }
        assert_eq!(buffer.len(), 1);

        buffer.undo_last();
        assert!(buffer.undo_last().is_none());
    }

    #[test]
    fn test_stage_state_tracks_dirty_sets() {
        let mut stage = BlockStage::new();
        assert_eq!(stage.state(), StageState::Clean);

        let r = bref();
        let node = node_for_tests();
        stage.mark_file_dirty(r, node);
        assert_eq!(stage.state(), StageState::Dirty);
        assert_eq!(stage.dirty_file_refs(), vec![r]);

        stage.discard(r);
        assert_eq!(stage.state(), StageState::Clean);
    }

    #[test]
    fn test_staged_writes_accumulate_per_ref() {
        let mut stage = BlockStage::new();
        let r = bref();
        stage.record_write(r, WriteRange { offset: 0, len: 10 });
        stage.record_write(r, WriteRange { offset: 10, len: 5 });
        assert_eq!(stage.staged_writes(r).len(), 2);
        assert!(stage.staged_writes(bref()).is_empty());
    }

    #[test]
    fn test_sync_in_progress_window() {
        let mut stage = BlockStage::new();
        let r = bref();
        assert!(!stage.is_syncing(r));
        stage.begin_sync(&[r]);
        assert!(stage.is_syncing(r));

        stage.defer_write(DeferredWrite {
            node: node_for_tests(),
            offset: 0,
            data: vec![1, 2, 3],
            truncate: false,
        });
        stage.end_sync();
        assert!(!stage.is_syncing(r));
        assert_eq!(stage.take_deferred_writes().len(), 1);
        assert!(stage.take_deferred_writes().is_empty());
    }
}
