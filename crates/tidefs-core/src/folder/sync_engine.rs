//! The sync engine: turning buffered state into published revisions.
//!
//! `sync_all` drains the dirty-block stage and the staged operation buffer
//! into one successor revision, readies and uploads every changed block,
//! and publishes the revision — falling back to an unmerged put on a
//! revision conflict. The whole pipeline runs under the writer lock; the
//! head lock is taken only for the final pointer swap.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, instrument, warn};

use crate::block::{Block, BlockPointer, BlockRef, DirBlock, FileBlock, ReadiedBlock};
use crate::folder::{make_lock_state, EngineError, FolderBranchEngine, WriterState};
use crate::meta::{BranchId, FolderOp, MergedStatus, RootMetadata};
use crate::node::{NodeId, NodePath};
use crate::server::Session;
use crate::sync::{LockState, OpContext};

/// Whether a create demands exclusivity (`O_EXCL`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Excl {
    No,
    Yes,
}

/// The readied output of one revision's prep step.
#[derive(Default)]
pub(crate) struct PreppedRevision {
    /// Blocks to upload, in put order.
    pub puts: Vec<(BlockPointer, ReadiedBlock)>,
    /// Plaintext payloads for seeding the clean cache after publish.
    pub blocks: Vec<(BlockPointer, Block)>,
    /// Old-to-new pointer assignments for every synced block.
    pub pointer_map: Vec<(BlockRef, BlockPointer)>,
}

impl FolderBranchEngine {
    /// Flush all buffered writes and staged operations into one new
    /// revision. No-ops (with zero network calls) when nothing is dirty.
    #[instrument(level = "debug", skip(self, ctx), fields(folder = %self.id()))]
    pub async fn sync_all(&self, ctx: &OpContext) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        self.with_md_write_retry(&ctx, async |ws, lstate| {
            self.sync_all_locked(&ctx, ws, lstate, Excl::No).await
        })
        .await
    }

    /// One-shot sync without the retry wrapper, for flows that handle
    /// retries themselves (background flusher, sync-from-server).
    pub(crate) async fn sync_all_unlocked(&self, ctx: &OpContext) -> Result<(), EngineError> {
        let lstate = make_lock_state();
        let mut ws = self.writer_lock.lock(&lstate).await;
        // A cancellation that arrived while waiting for the lock must not
        // be swallowed by a full sync pass.
        ctx.check()?;
        self.sync_all_locked(ctx, &mut ws, &lstate, Excl::No).await
    }

    /// Retry wrapper for metadata-mutating flows.
    ///
    /// Retriable failures (recoverable block errors, exclusive-create
    /// races, unmerged self-conflicts) re-run `f` up to the configured
    /// attempt cap; the writer lock is released between attempts so
    /// competing flows get a chance. Everything else propagates unchanged.
    pub(crate) async fn with_md_write_retry<F>(
        &self,
        ctx: &OpContext,
        mut f: F,
    ) -> Result<(), EngineError>
    where
        F: AsyncFnMut(&mut WriterState, &LockState) -> Result<(), EngineError>,
    {
        let lstate = make_lock_state();
        let mut attempt = 0;
        loop {
            ctx.check()?;
            let result = {
                let mut ws = self.writer_lock.lock(&lstate).await;
                f(&mut *ws, &lstate).await
            };
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            attempt += 1;
            if !err.is_retriable() || attempt >= self.config.max_md_write_retries {
                return Err(err);
            }
            debug!(error = %err, attempt, "retrying metadata write after retriable error");
            match &err {
                EngineError::ExclusiveCreateRace => {
                    // Someone else is publishing; wait out any conflict
                    // resolution before racing again.
                    self.services.resolver.wait(ctx).await?;
                }
                EngineError::UnmergedSelfConflict(_) => {
                    // We raced our own unmerged branch. Force a resync
                    // under a fresh context merely linked to the
                    // original's cancellation, so the fetched head is not
                    // discarded if the caller gives up mid-way. Only the
                    // branch identity is revalidated afterwards; staged
                    // state is untouched while the writer lock was
                    // released.
                    let fresh = self.background_ctx();
                    let link_parent = ctx.clone();
                    let link_child = fresh.clone();
                    tokio::spawn(async move {
                        link_parent.cancelled().await;
                        link_child.cancel();
                    });
                    self.force_unmerged_resync(&fresh).await?;
                }
                _ => {}
            }
        }
    }

    /// A writable successor of the current head. Fails for non-writers.
    pub(crate) async fn successor_md_for_write_locked(
        &self,
        ctx: &OpContext,
        ws: &WriterState,
        lstate: &LockState,
    ) -> Result<(RootMetadata, Session), EngineError> {
        self.writer_lock.assert_locked(lstate);
        let head = {
            let hs = self.head_lock.read(lstate).await;
            hs.head.clone().ok_or(EngineError::NotInitialized)?
        };
        let session = self.services.keys.current_session(ctx).await?;
        if !head.handle().is_writer(&session.user) {
            return Err(EngineError::WriteAccess {
                user: session.user,
                folder: head.handle().canonical_name(),
            });
        }
        let mut md = head.successor(session.user.clone());
        if ws.is_unmerged() {
            md.merged = MergedStatus::Unmerged(ws.unmerged_bid);
        }
        Ok((md, session))
    }

    /// The full sync pipeline, under the writer lock.
    pub(crate) async fn sync_all_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
        excl: Excl,
    ) -> Result<(), EngineError> {
        self.writer_lock.assert_locked(lstate);

        let (dirty_files, dirty_dirs) = {
            let mut stage = self.block_lock.write(lstate).await;
            let files = stage.dirty_file_refs();
            let dirs = stage.dirty_dir_refs();
            if files.is_empty() && dirs.is_empty() && ws.ops.is_empty() {
                // Idempotence: nothing buffered, nothing published.
                return Ok(());
            }
            stage.begin_sync(&files);
            (files, dirs)
        };
        debug!(
            files = dirty_files.len(),
            dirs = dirty_dirs.len(),
            ops = ws.ops.len(),
            "sync-all starting"
        );

        let result = self
            .sync_all_attempt(ctx, ws, lstate, excl, &dirty_files, &dirty_dirs)
            .await;
        if let Err(err) = &result {
            // The revision attempt is abandoned wholesale: staged ops and
            // dirty blocks stay put for the next attempt, and the
            // deferred-write window closes.
            debug!(error = %err, "sync-all attempt failed; keeping staged state");
            let mut stage = self.block_lock.write(lstate).await;
            stage.end_sync();
        }
        result
    }

    async fn sync_all_attempt(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
        excl: Excl,
        dirty_files: &[BlockRef],
        dirty_dirs: &[BlockRef],
    ) -> Result<(), EngineError> {
        let (mut md, _session) = self.successor_md_for_write_locked(ctx, ws, lstate).await?;

        // Mutable snapshots of every directory block this revision
        // touches, plus the paths that lead to them.
        let mut dbm: HashMap<BlockRef, DirBlock> = HashMap::new();
        let mut resolved_paths: HashMap<BlockRef, NodePath> = HashMap::new();
        let mut file_blocks: HashMap<BlockRef, FileBlock> = HashMap::new();
        let mut new_entry_refs: HashSet<BlockRef> = HashSet::new();

        for bref in dirty_dirs {
            let Some(node) = self.nodes.get(*bref) else {
                continue;
            };
            if self.nodes.is_unlinked(node) {
                let mut stage = self.block_lock.write(lstate).await;
                stage.discard(*bref);
                continue;
            }
            let Some(path) = self.nodes.path_from_node(node) else {
                continue;
            };
            // Snapshot the dirty directory and its parent (the parent
            // carries this directory's mtime/ctime bump).
            let parent = path.parent_path();
            self.snapshot_dir(ctx, lstate, path, &mut dbm, &mut resolved_paths)
                .await?;
            if let Some(parent) = parent {
                self.snapshot_dir(ctx, lstate, parent, &mut dbm, &mut resolved_paths)
                    .await?;
            }
        }

        // Replay buffered operations onto the revision's op log, in the
        // exact order they were staged.
        for cached in ws.ops.iter() {
            if let FolderOp::Create { .. } = &cached.op {
                // Not-yet-existing entries need explicit pointer fixup:
                // the prep step below assigns their permanent identities.
                if let Some(new_node) = cached.nodes.get(1).copied() {
                    self.stage_new_entry(
                        lstate,
                        new_node,
                        &mut dbm,
                        &mut file_blocks,
                        &mut resolved_paths,
                        &mut new_entry_refs,
                    )
                    .await?;
                }
            }
            md.add_op(cached.op.clone());
        }

        for bref in dirty_files {
            let Some(node) = self.nodes.get(*bref) else {
                continue;
            };
            if self.nodes.is_unlinked(node) {
                // Unlinked while dirty: the cached writes are simply
                // discarded and the file treated as no longer dirty.
                debug!(bref = %bref, "skipping sync of unlinked file");
                let mut stage = self.block_lock.write(lstate).await;
                stage.discard(*bref);
                continue;
            }
            let Some(path) = self.nodes.path_from_node(node) else {
                continue;
            };
            let (staged, writes) = {
                let stage = self.block_lock.read(lstate).await;
                (stage.block(*bref).cloned(), stage.staged_writes(*bref))
            };
            let Some(Block::File(file_block)) = staged else {
                return Err(EngineError::Invariant(format!(
                    "dirty file {bref} has no staged block"
                )));
            };

            let mut op = FolderOp::sync(path.tail_pointer());
            for w in writes {
                op.add_write(w.offset, w.len);
            }
            md.add_op(op);

            // Reflect the new size and mtime in the parent entry.
            if let Some(parent) = path.parent_path() {
                self.snapshot_dir(ctx, lstate, parent.clone(), &mut dbm, &mut resolved_paths)
                    .await?;
                if let Some(entry) = dbm
                    .get_mut(&parent.tail_ref())
                    .and_then(|dir| dir.children.get_mut(path.tail_name()))
                {
                    entry.size = file_block.contents.len() as u64;
                    entry.mtime = self.services.clock.now_unix_nanos();
                }
            }

            file_blocks.insert(*bref, file_block);
            resolved_paths.insert(*bref, path);
        }

        // Pull every ancestor directory into the snapshot, so the
        // bottom-up re-pointing below reaches the root. This shapes every
        // buffered op like a remote update: one chain entry per ancestor.
        let mut pending: Vec<NodePath> =
            resolved_paths.values().filter_map(NodePath::parent_path).collect();
        while let Some(path) = pending.pop() {
            if resolved_paths.contains_key(&path.tail_ref()) {
                continue;
            }
            let parent = path.parent_path();
            self.snapshot_dir(ctx, lstate, path, &mut dbm, &mut resolved_paths)
                .await?;
            if let Some(parent) = parent {
                pending.push(parent);
            }
        }

        // Batch summary marker; pointer rewrites with no staged-op slot
        // land on it.
        md.add_op(FolderOp::resolution());

        let prep = self
            .prep_blocks(ctx, &mut md, dbm, &file_blocks, &resolved_paths, &new_entry_refs)
            .await?;

        self.put_blocks(ctx, &prep).await?;

        self.finalize_md_write_locked(ctx, ws, lstate, md, excl, prep)
            .await
    }

    /// Ensure `path`'s directory block is snapshotted in `dbm`.
    async fn snapshot_dir(
        &self,
        ctx: &OpContext,
        lstate: &LockState,
        path: NodePath,
        dbm: &mut HashMap<BlockRef, DirBlock>,
        resolved_paths: &mut HashMap<BlockRef, NodePath>,
    ) -> Result<(), EngineError> {
        let bref = path.tail_ref();
        if dbm.contains_key(&bref) {
            resolved_paths.entry(bref).or_insert(path);
            return Ok(());
        }
        let staged = {
            let stage = self.block_lock.read(lstate).await;
            stage.block(bref).cloned()
        };
        let block = match staged {
            Some(block) => block,
            None => (*self.fetch_block(ctx, path.tail_pointer()).await?).clone(),
        };
        dbm.insert(bref, block.as_dir()?.clone());
        resolved_paths.insert(bref, path);
        Ok(())
    }

    /// Pull a newly created entry's block into the prep set.
    async fn stage_new_entry(
        &self,
        lstate: &LockState,
        new_node: NodeId,
        dbm: &mut HashMap<BlockRef, DirBlock>,
        file_blocks: &mut HashMap<BlockRef, FileBlock>,
        resolved_paths: &mut HashMap<BlockRef, NodePath>,
        new_entry_refs: &mut HashSet<BlockRef>,
    ) -> Result<(), EngineError> {
        if self.nodes.is_unlinked(new_node) {
            return Ok(());
        }
        let Some(path) = self.nodes.path_from_node(new_node) else {
            return Ok(());
        };
        let bref = path.tail_ref();
        new_entry_refs.insert(bref);
        let staged = {
            let stage = self.block_lock.read(lstate).await;
            stage.block(bref).cloned()
        };
        match staged {
            Some(Block::Dir(dir)) => {
                dbm.insert(bref, dir);
            }
            Some(Block::File(file)) => {
                file_blocks.insert(bref, file);
            }
            None => {
                return Err(EngineError::Invariant(format!(
                    "created entry {bref} has no staged block"
                )));
            }
        }
        resolved_paths.insert(bref, path);
        Ok(())
    }

    /// Assign permanent pointers bottom-up, re-pointing each parent as its
    /// children settle, and collect the final upload set.
    async fn prep_blocks(
        &self,
        ctx: &OpContext,
        md: &mut RootMetadata,
        mut dbm: HashMap<BlockRef, DirBlock>,
        file_blocks: &HashMap<BlockRef, FileBlock>,
        resolved_paths: &HashMap<BlockRef, NodePath>,
        new_entry_refs: &HashSet<BlockRef>,
    ) -> Result<PreppedRevision, EngineError> {
        let mut ordered: Vec<(BlockRef, NodePath)> = resolved_paths
            .iter()
            .map(|(bref, path)| (*bref, path.clone()))
            .collect();
        ordered.sort_by_key(|(_, path)| std::cmp::Reverse(path.depth()));

        let mut prep = PreppedRevision::default();
        for (bref, path) in ordered {
            let block = if let Some(dir) = dbm.get(&bref) {
                Block::Dir(dir.clone())
            } else if let Some(file) = file_blocks.get(&bref) {
                Block::File(file.clone())
            } else {
                return Err(EngineError::Invariant(format!(
                    "resolved path {path} has no snapshotted block"
                )));
            };

            let (new_ptr, readied) = self
                .services
                .block_server
                .ready(ctx, self.id(), &block)
                .await?;
            md.disk_usage += readied.len() as u64;
            prep.puts.push((new_ptr, readied));
            prep.blocks.push((new_ptr, block));
            prep.pointer_map.push((bref, new_ptr));

            match path.parent_path() {
                Some(parent) => {
                    let dir = dbm.get_mut(&parent.tail_ref()).ok_or_else(|| {
                        EngineError::Invariant(format!(
                            "parent of {path} was not snapshotted"
                        ))
                    })?;
                    if let Some(entry) = dir.children.get_mut(path.tail_name()) {
                        entry.pointer = new_ptr;
                    }
                }
                None => md.root_ptr = new_ptr,
            }

            if new_entry_refs.contains(&bref) {
                // Brand-new block: a reference, not an update.
                if let Some(op) = md.ops.last_mut() {
                    op.add_ref(new_ptr);
                }
            } else {
                attach_update(md, bref.pointer(), new_ptr);
            }
        }
        Ok(prep)
    }

    /// Upload every readied block; on failure, delete what already
    /// landed so a retried sync starts clean.
    async fn put_blocks(
        &self,
        ctx: &OpContext,
        prep: &PreppedRevision,
    ) -> Result<(), EngineError> {
        let mut put_so_far: Vec<BlockPointer> = Vec::new();
        for (ptr, readied) in &prep.puts {
            match self
                .services
                .block_server
                .put(ctx, self.id(), *ptr, readied.clone())
                .await
            {
                Ok(()) => put_so_far.push(*ptr),
                Err(err) => {
                    warn!(error = %err, ptr = %ptr, "block upload failed; rolling back batch");
                    if let Err(del_err) = self
                        .services
                        .block_server
                        .delete(ctx, self.id(), &put_so_far)
                        .await
                    {
                        if del_err.is_recoverable_for_removal() {
                            debug!(error = %del_err, "some rollback blocks were already gone");
                        } else {
                            warn!(error = %del_err, "failed to roll back uploaded blocks");
                        }
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Publish a prepared revision and swap it in as head.
    pub(crate) async fn finalize_md_write_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
        md: RootMetadata,
        excl: Excl,
        prep: PreppedRevision,
    ) -> Result<(), EngineError> {
        self.writer_lock.assert_locked(lstate);

        // From here on a client-visible cancellation would leave the
        // revision's fate ambiguous; defer it past the publish.
        ctx.suspend_cancellation(self.config.delayed_cancellation_grace);

        let session = self.services.keys.current_session(ctx).await?;
        let old_prev_root = md.prev_root;
        let attempted_revision = md.revision;

        let is_merged_branch = !ws.is_unmerged();
        let mut do_unmerged_put = true;
        let mut resolve_merged_rev = None;
        let mut published = None;

        if is_merged_branch {
            match self
                .services
                .md_server
                .put(ctx, md.clone(), &session.verifying_key)
                .await
            {
                Ok(imd) => {
                    do_unmerged_put = false;
                    published = Some(imd);
                }
                Err(err) if err.is_conflict() => {
                    debug!(error = %err, "merged put conflicted");
                    resolve_merged_rev = Some(attempted_revision);
                    if excl == Excl::Yes {
                        // An exclusive create must not silently land on an
                        // unmerged branch: surface the race distinctly.
                        // The create path rolls back its staging and then
                        // fast-forwards onto the latest remote revisions.
                        return Err(EngineError::ExclusiveCreateRace);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        } else if excl == Excl::Yes {
            return Err(EngineError::ExclusiveCreateRace);
        }

        let mut do_resolve = false;
        if do_unmerged_put {
            let bid = if ws.unmerged_bid.is_null() {
                BranchId::new_random()
            } else {
                ws.unmerged_bid
            };
            let mut unmerged_md = md;
            unmerged_md.merged = MergedStatus::Unmerged(bid);
            match self
                .services
                .md_server
                .put_unmerged(ctx, unmerged_md, &session.verifying_key)
                .await
            {
                Ok(imd) => published = Some(imd),
                Err(err) if err.is_conflict() => {
                    // A conflict against our own prior unmerged revision;
                    // the retry wrapper forces a resync rather than
                    // blindly retrying.
                    return Err(EngineError::UnmergedSelfConflict(err));
                }
                Err(err) => return Err(err.into()),
            }
            self.set_branch_id_locked(ws, lstate, bid);
            do_resolve = true;
        } else {
            self.set_branch_id_locked(ws, lstate, BranchId::NULL);
        }

        let published = published.ok_or_else(|| {
            EngineError::Invariant("finalize finished with no published revision".to_string())
        })?;

        // A changed predecessor means this revision was rebased onto new
        // history (unstage paths); treat it like a branch move.
        let rebased = old_prev_root != published.root_metadata().prev_root;
        if rebased {
            self.set_branch_id_locked(ws, lstate, published.branch_id());
            do_resolve = true;
            resolve_merged_rev = None;
        }

        info!(
            revision = %published.revision(),
            merged = published.merged_status().is_merged(),
            "published revision"
        );

        {
            let mut hs = self.head_lock.write(lstate).await;
            self.set_head_successor_locked(ctx, ws, &mut hs, lstate, published.clone(), rebased)
                .await?;
        }

        // Pointer fixup under the block lock: close the window where a
        // deferred write could be replayed against stale pointers.
        let deferred = {
            let mut stage = self.block_lock.write(lstate).await;
            for (old, new) in &prep.pointer_map {
                self.nodes.update_pointer(*old, *new);
                stage.discard(*old);
            }
            for (ptr, block) in &prep.blocks {
                self.clean_blocks.insert(ptr.bref(), std::sync::Arc::new(block.clone()));
            }
            stage.end_sync();
            stage.take_deferred_writes()
        };
        ws.ops.drain();

        for dw in deferred {
            if let Err(err) = self.restage_deferred_write(lstate, &dw).await {
                warn!(error = %err, "failed to replay deferred write");
            }
        }

        let affected: Vec<NodeId> = prep
            .pointer_map
            .iter()
            .filter_map(|(_, new)| self.nodes.get(new.bref()))
            .collect();
        self.observers.batch_changes(&[], &affected);

        if self.services.journal.is_some() {
            // The revision is only journaled; archival and edit
            // notifications happen when the journal flushes it for real.
            debug!("revision journaled; deferring archival to flush time");
        } else {
            self.spawn_post_publish_tasks(&prep);
        }

        // Resolve after the head is set, so the resolver fetches the
        // correct unmerged range.
        if do_resolve {
            self.services
                .resolver
                .resolve(Some(attempted_revision), resolve_merged_rev);
        }
        Ok(())
    }

    /// Re-apply a write that was deferred while its file was mid-sync.
    async fn restage_deferred_write(
        &self,
        lstate: &LockState,
        dw: &crate::folder::DeferredWrite,
    ) -> Result<(), EngineError> {
        let ptr = self.nodes.pointer(dw.node).ok_or(EngineError::StaleNode)?;
        let base = self
            .clean_blocks
            .get(&ptr.bref())
            .ok_or_else(|| EngineError::Invariant("deferred write against uncached block".into()))?;
        let mut file = base.as_file()?.clone();
        if dw.truncate {
            file.contents
                .resize(usize::try_from(dw.offset).unwrap_or(usize::MAX), 0);
        } else {
            apply_write(&mut file, dw.offset, &dw.data);
        }
        let mut stage = self.block_lock.write(lstate).await;
        stage.insert_block(ptr.bref(), Block::File(file));
        stage.mark_file_dirty(ptr.bref(), dw.node);
        stage.record_write(
            ptr.bref(),
            crate::meta::WriteRange {
                offset: dw.offset,
                len: dw.data.len() as u64,
            },
        );
        self.signal_write();
        Ok(())
    }

    /// Queue edit notifications and old-block archival off the hot path.
    ///
    /// Archival here only marks the replaced pointers as reclaimable;
    /// devices that are still behind keep reading them until quota
    /// reclamation (an external concern) actually collects old revisions.
    fn spawn_post_publish_tasks(&self, prep: &PreppedRevision) {
        let Some(engine) = self.upgrade_self() else {
            return;
        };
        let replaced: Vec<BlockPointer> =
            prep.pointer_map.iter().map(|(old, _)| old.pointer()).collect();
        self.edit_activity.add(1);
        self.archivals.add(1);
        tokio::spawn(async move {
            debug!(
                count = replaced.len(),
                "queued replaced blocks for archival"
            );
            engine.archivals.done();
            engine.edit_activity.done();
        });
    }
}

/// Write `data` into `file` at `offset`, zero-filling any gap.
pub(crate) fn apply_write(file: &mut FileBlock, offset: u64, data: &[u8]) {
    let offset = usize::try_from(offset).unwrap_or(usize::MAX);
    let end = offset.saturating_add(data.len());
    if file.contents.len() < end {
        file.contents.resize(end, 0);
    }
    file.contents[offset..end].copy_from_slice(data);
}

/// Record a pointer rewrite on the first op whose primary slot matches;
/// otherwise on the batch's trailing resolution op.
fn attach_update(md: &mut RootMetadata, old: BlockPointer, new: BlockPointer) {
    for op in &mut md.ops {
        let matches = match op {
            FolderOp::Create { dir, .. }
            | FolderOp::Remove { dir, .. }
            | FolderOp::SetAttr { dir, .. } => dir.unref == old && !dir.is_filled(),
            FolderOp::Rename {
                old_dir, new_dir, ..
            } => {
                (old_dir.unref == old && !old_dir.is_filled())
                    || new_dir
                        .as_ref()
                        .is_some_and(|nd| nd.unref == old && !nd.is_filled())
            }
            FolderOp::Sync { file, .. } => file.unref == old && !file.is_filled(),
            FolderOp::Gc { .. } | FolderOp::Resolution { .. } | FolderOp::Rekey { .. } => false,
        };
        if matches {
            op.add_update(old, new);
            return;
        }
    }
    if let Some(op) = md.ops.last_mut() {
        op.add_update(old, new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_write_extends_and_overwrites() {
        let mut file = FileBlock::default();
        apply_write(&mut file, 4, b"abcd");
        assert_eq!(file.contents, vec![0, 0, 0, 0, b'a', b'b', b'c', b'd']);

        apply_write(&mut file, 0, b"xy");
        assert_eq!(&file.contents[..2], b"xy");
        assert_eq!(file.contents.len(), 8);
    }

    #[test]
    fn test_attach_update_prefers_matching_primary_slot() {
        let folder = crate::meta::FolderId::new_random();
        let handle = crate::meta::FolderHandle::private("alice", &["alice"]);
        let mut md = RootMetadata::make_initial(
            folder,
            handle,
            BlockPointer::temporary(),
            "alice",
        );

        let dir_old = BlockPointer::temporary();
        md.add_op(FolderOp::create("f", dir_old, crate::block::EntryType::File));
        md.add_op(FolderOp::resolution());

        let dir_new = BlockPointer::temporary();
        attach_update(&mut md, dir_old, dir_new);
        match &md.ops[0] {
            FolderOp::Create { dir, .. } => assert_eq!(dir.reref, dir_new),
            other => panic!("unexpected op {other:?}"),
        }

        // A rewrite with no matching slot lands on the resolution op.
        let other_old = BlockPointer::temporary();
        let other_new = BlockPointer::temporary();
        attach_update(&mut md, other_old, other_new);
        assert_eq!(md.ops[1].common().updates.len(), 1);
    }
}
