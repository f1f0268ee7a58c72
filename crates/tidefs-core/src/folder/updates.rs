//! The update engine: applying (and undoing) remote revisions.
//!
//! Remote revisions arrive through polling or push pings and are applied
//! strictly in order, on clean local state only. Divergence — a batch of
//! merged revisions arriving while this device sits on an unmerged
//! branch — raises the conflict-resolution protocol instead of clobbering
//! local state. A long-offline device may fast-forward straight to the
//! current head instead of replaying every intermediate revision.

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::block::BlockPointer;
use crate::folder::sync_engine::{Excl, PreppedRevision};
use crate::folder::{
    make_lock_state, EngineError, FolderBranchEngine, RootFetch, StageState, WriterState,
};
use crate::meta::{BlockUpdate, BranchId, FolderOp, ImmutableMd, RevisionNumber, RootMetadata};
use crate::node::NodeId;
use crate::server::{NodeChange, RekeyEvent};
use crate::sync::{CoalescingContext, LockState, OpContext};

impl FolderBranchEngine {
    /// Apply a batch of merged revisions fetched from the server.
    pub async fn apply_updates(
        &self,
        ctx: &OpContext,
        rmds: &[ImmutableMd],
    ) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let lstate = make_lock_state();
        let mut ws = self.writer_lock.lock(&lstate).await;
        self.apply_updates_locked(&ctx, &mut ws, &lstate, rmds).await
    }

    /// Apply revisions in ascending order under the writer lock.
    ///
    /// Stops at the first revision that fails to apply; earlier revisions
    /// in the batch stay applied.
    pub(crate) async fn apply_updates_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
        rmds: &[ImmutableMd],
    ) -> Result<(), EngineError> {
        self.writer_lock.assert_locked(lstate);
        let Some(latest) = rmds.last().cloned() else {
            return Ok(());
        };

        if !ws.is_unmerged() {
            if let Some(journal) = &self.services.journal {
                if let Some((_, journal_end)) = journal.revisions(ctx).await? {
                    if latest.revision() > journal_end {
                        // We somehow fetched past what the journal knows;
                        // advance the merged watermark so we don't keep
                        // re-registering for the same updates.
                        let mut hs = self.head_lock.write(lstate).await;
                        hs.set_latest_merged(latest.revision(), false);
                    }
                    debug!("ignoring fetched revisions while the journal holds revisions");
                    return Ok(());
                }
            }
        }

        let mut changes: Vec<NodeChange> = Vec::new();
        let mut affected: Vec<NodeId> = Vec::new();
        let result = self
            .apply_updates_under_head_lock(ctx, ws, lstate, rmds, &latest, &mut changes, &mut affected)
            .await;

        // Revisions applied before a mid-batch failure stay applied, so
        // their notifications must go out either way (outside the locks).
        if !changes.is_empty() || !affected.is_empty() {
            self.observers.batch_changes(&changes, &affected);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_updates_under_head_lock(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
        rmds: &[ImmutableMd],
        latest: &ImmutableMd,
        changes: &mut Vec<NodeChange>,
        affected: &mut Vec<NodeId>,
    ) -> Result<(), EngineError> {
        let mut hs = self.head_lock.write(lstate).await;

        if ws.is_unmerged() {
            // Staged local changes: don't clobber them. Advance the
            // watermark only for revisions that genuinely landed, and let
            // resolution reconcile the rest.
            if !latest.put_to_server() {
                return Err(EngineError::Unmerged);
            }
            hs.set_latest_merged(latest.revision(), false);
            let unmerged_rev = hs.current_revision();
            self.services
                .resolver
                .resolve(unmerged_rev, Some(latest.revision()));
            return Err(EngineError::Unmerged);
        }

        if self.is_dirty_locked(ws, lstate).await {
            // The next sync will fork us anyway; make the caller flush
            // (or force a pre-sync) first.
            return Err(EngineError::NoUpdatesWhileDirty);
        }

        // Make sure the final revision's root block lands in the local
        // cache before these changes are exposed, so a subsequent offline
        // listing of the folder root can still succeed.
        self.kick_off_root_block_fetch(ctx, latest, lstate).await;

        let session = self.services.keys.current_session(ctx).await?;
        for (i, rmd) in rmds.iter().enumerate() {
            if hs
                .current_revision()
                .is_some_and(|curr| rmd.revision() <= curr)
            {
                // Already caught up past this one.
                continue;
            }
            if !self.services.keys.can_read(ctx, rmd.root_metadata()).await? {
                return Err(EngineError::ReadAccess {
                    user: session.user.clone(),
                    folder: rmd.handle().canonical_name(),
                });
            }
            if i == rmds.len() - 1 {
                self.wait_for_root_block_fetch(latest, lstate).await;
            }
            self.set_head_successor_locked(ctx, ws, &mut hs, lstate, rmd.clone(), false)
                .await?;

            if !rmd.writer_metadata_copied() {
                // Copied-forward writer metadata carries no new
                // user-visible changes.
                for op in rmd.ops() {
                    let op_changes = self.apply_op_locally(op);
                    affected.extend(op_changes.iter().map(|c| c.node));
                    changes.extend(op_changes);
                }
            }

            if rmd.rekey_requested() {
                self.services
                    .rekey
                    .rekey_event(RekeyEvent::Needed { folder: self.id() });
            } else {
                self.services
                    .rekey
                    .rekey_event(RekeyEvent::NotNeeded { folder: self.id() });
            }
        }
        Ok(())
    }

    /// Replay one operation's effect on the node table, returning the
    /// observer changes it implies.
    pub(crate) fn apply_op_locally(&self, op: &FolderOp) -> Vec<NodeChange> {
        for update in op.all_updates() {
            self.nodes.update_pointer(update.unref.bref(), update.reref);
        }

        let node_for = |update: &BlockUpdate| {
            let ptr = if update.is_filled() {
                update.reref
            } else {
                update.unref
            };
            self.nodes.get(ptr.bref())
        };

        let mut changes = Vec::new();
        match op {
            FolderOp::Create { name, dir, .. } => {
                if let Some(node) = node_for(dir) {
                    changes.push(NodeChange::dir(node, vec![name.clone()]));
                }
            }
            FolderOp::Remove { name, dir, .. } => {
                if let Some(node) = node_for(dir) {
                    changes.push(NodeChange::dir(node, vec![name.clone()]));
                }
                for unref in &op.common().unrefs {
                    if let Some(removed) = self.nodes.get(unref.bref()) {
                        self.nodes.unlink(removed);
                    }
                }
            }
            FolderOp::Rename {
                old_name,
                old_dir,
                new_name,
                new_dir,
                renamed,
                ..
            } => {
                if let Some(node) = node_for(old_dir) {
                    changes.push(NodeChange::dir(node, vec![old_name.clone()]));
                }
                let target_dir = new_dir.as_ref().unwrap_or(old_dir);
                let target_node = node_for(target_dir);
                if let Some(node) = target_node {
                    changes.push(NodeChange::dir(node, vec![new_name.clone()]));
                }
                if let (Some(renamed_node), Some(new_parent)) =
                    (self.nodes.get(renamed.bref()), target_node)
                {
                    self.nodes.rename(renamed_node, new_parent, new_name);
                }
            }
            FolderOp::Sync { file, writes, .. } => {
                if let Some(node) = node_for(file) {
                    changes.push(NodeChange::file(node, writes.clone()));
                }
            }
            FolderOp::SetAttr { name, dir, .. } => {
                if let Some(node) = node_for(dir) {
                    changes.push(NodeChange::dir(node, vec![name.clone()]));
                }
            }
            FolderOp::Gc { .. } | FolderOp::Resolution { .. } | FolderOp::Rekey { .. } => {}
        }
        changes
    }

    /// Replay a whole revision's ops, collecting changes and affected ids.
    pub(crate) fn collect_op_changes(
        &self,
        ops: &[FolderOp],
    ) -> (Vec<NodeChange>, Vec<NodeId>) {
        let mut changes = Vec::new();
        let mut affected = Vec::new();
        for op in ops {
            let op_changes = self.apply_op_locally(op);
            affected.extend(op_changes.iter().map(|c| c.node));
            changes.extend(op_changes);
        }
        (changes, affected)
    }

    /// Undo revisions in strict reverse order, walking the head backward
    /// one predecessor at a time.
    ///
    /// A revision that is neither the current head nor its immediate
    /// predecessor means engine state has diverged from assumptions and
    /// is a fatal invariant violation. Individual op-inversion failures
    /// are logged and skipped; observer state may be stale until handles
    /// are reopened.
    pub(crate) async fn undo_updates_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
        rmds: &[ImmutableMd],
    ) -> Result<(), EngineError> {
        self.writer_lock.assert_locked(lstate);

        let mut changes: Vec<NodeChange> = Vec::new();
        let mut affected: Vec<NodeId> = Vec::new();
        let result = async {
            let mut hs = self.head_lock.write(lstate).await;

            let dirty = {
                let stage = self.block_lock.read(lstate).await;
                stage.state() == StageState::Dirty
            };
            if dirty {
                return Err(EngineError::NotPermittedWhileDirty);
            }

            for rmd in rmds.iter().rev() {
                let curr = hs.current_revision().ok_or_else(|| {
                    EngineError::Invariant("undo with no head".to_string())
                })?;
                // Re-inverting the current revision is fine (its ops must
                // be undone); anything older than head-1 is not.
                if rmd.revision() != curr && Some(rmd.revision()) != curr.prev() {
                    return Err(EngineError::MdUpdateInvert {
                        rev: rmd.revision(),
                        head: curr,
                    });
                }
                if rmd.revision() < curr {
                    self.set_head_predecessor_locked(ctx, ws, &mut hs, lstate, rmd.clone())
                        .await?;
                }

                for op in rmd.ops().iter().rev() {
                    match op.invert() {
                        Ok(inverted) => {
                            let op_changes = self.apply_op_locally(&inverted);
                            affected.extend(op_changes.iter().map(|c| c.node));
                            changes.extend(op_changes);
                        }
                        Err(err) => {
                            warn!(
                                error = %err,
                                kind = op.kind(),
                                "could not invert op during undo; skipping. Open handles \
                                 may be stale until they are closed or the engine restarts"
                            );
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        if !changes.is_empty() || !affected.is_empty() {
            self.observers.batch_changes(&changes, &affected);
        }
        result
    }

    /// Fetch everything past the merged watermark and apply it.
    pub(crate) async fn get_and_apply_updates(&self, ctx: &OpContext) -> Result<(), EngineError> {
        let lstate = make_lock_state();
        let mut ws = self.writer_lock.lock(&lstate).await;
        self.get_and_apply_updates_locked(ctx, &mut ws, &lstate).await
    }

    pub(crate) async fn get_and_apply_updates_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
    ) -> Result<(), EngineError> {
        let start = {
            let hs = self.head_lock.read(lstate).await;
            hs.latest_merged
                .or_else(|| hs.current_revision())
                .map_or(RevisionNumber::INITIAL, RevisionNumber::next)
        };
        let rmds = self
            .services
            .md_server
            .get_range(ctx, self.id(), start, None)
            .await?;
        if rmds.is_empty() {
            return Ok(());
        }
        self.apply_updates_locked(ctx, ws, lstate, &rmds).await
    }

    /// Forced resync after an unmerged self-conflict: we can only be one
    /// revision behind our own branch, so fetch its newest revision and
    /// apply it as a successor.
    pub(crate) async fn force_unmerged_resync(&self, ctx: &OpContext) -> Result<(), EngineError> {
        debug!("fetching the newest unmerged head");
        let lstate = make_lock_state();
        let bid = {
            let ws = self.writer_lock.lock(&lstate).await;
            ws.unmerged_bid
        };
        if bid.is_null() {
            return Err(EngineError::Invariant(
                "forced resync without an unmerged branch".to_string(),
            ));
        }

        let md = self
            .services
            .md_server
            .get_unmerged_for_folder(ctx, self.id(), bid)
            .await?
            .ok_or_else(|| {
                EngineError::Invariant("no unmerged head found for our branch".to_string())
            })?;

        let mut ws = self.writer_lock.lock(&lstate).await;
        if ws.unmerged_bid != bid {
            // Resolution completed while we fetched; nothing to do.
            debug!("branch switched while fetching the unmerged head");
            return Ok(());
        }

        let collected = {
            let mut hs = self.head_lock.write(&lstate).await;
            if hs.head.as_ref().is_some_and(|h| h.md_id() == md.md_id()) {
                None
            } else {
                self.set_head_successor_locked(ctx, &mut ws, &mut hs, &lstate, md.clone(), false)
                    .await?;
                Some(self.collect_op_changes(md.ops()))
            }
        };
        if let Some((changes, affected)) = collected {
            self.observers.batch_changes(&changes, &affected);
        }
        Ok(())
    }

    /// The full unmerged range of `bid`, plus the merged revision the
    /// branch forked from.
    async fn get_unmerged_updates(
        &self,
        ctx: &OpContext,
        bid: BranchId,
    ) -> Result<(Option<RevisionNumber>, Vec<ImmutableMd>), EngineError> {
        let rmds = self
            .services
            .md_server
            .get_unmerged_range(ctx, self.id(), bid, RevisionNumber::INITIAL, None)
            .await?;
        let base = rmds.first().and_then(|r| r.revision().prev());
        Ok((base, rmds))
    }

    /// Undo every revision of the local unmerged branch and land back on
    /// the merged revision it forked from. Returns the block pointers the
    /// branch created (for the unstage revision's unref list).
    pub(crate) async fn undo_unmerged_updates_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
    ) -> Result<Vec<BlockPointer>, EngineError> {
        self.writer_lock.assert_locked(lstate);
        let bid = ws.unmerged_bid;
        let (base, unmerged) = self.get_unmerged_updates(ctx, bid).await?;
        self.undo_updates_locked(ctx, ws, lstate, &unmerged).await?;

        self.set_branch_id_locked(ws, lstate, BranchId::NULL);

        let base = base.ok_or_else(|| {
            EngineError::Invariant("unmerged branch has no merge base".to_string())
        })?;
        let base_md = self
            .services
            .md_server
            .get_range(ctx, self.id(), base, Some(base))
            .await?
            .pop()
            .ok_or_else(|| {
                EngineError::Invariant(format!("merge base revision {base} not on server"))
            })?;

        {
            let mut hs = self.head_lock.write(lstate).await;
            self.set_head_predecessor_locked(ctx, ws, &mut hs, lstate, base_md.clone())
                .await?;
            // Unstaging is the one case where the watermark may move
            // backward explicitly.
            hs.set_latest_merged(base_md.revision(), true);
        }

        // Everything the branch created (and that actually reached the
        // block server) gets unreferenced by the unstage revision.
        let mut created: Vec<BlockPointer> = Vec::new();
        for rmd in &unmerged {
            for op in rmd.ops() {
                for ptr in &op.common().refs {
                    if !ptr.is_zero() && !self.is_block_unflushed(ctx, *ptr).await? {
                        created.push(*ptr);
                    }
                }
                for update in op.all_updates() {
                    if !update.reref.is_zero()
                        && !self.is_block_unflushed(ctx, update.reref).await?
                    {
                        created.push(update.reref);
                    }
                }
            }
        }
        Ok(created)
    }

    async fn is_block_unflushed(
        &self,
        ctx: &OpContext,
        ptr: BlockPointer,
    ) -> Result<bool, EngineError> {
        Ok(self
            .services
            .block_server
            .is_unflushed(ctx, self.id(), ptr.id)
            .await?)
    }

    /// Undo the local branch, drop it on the server, catch up with the
    /// mainline, and publish a resolution marker unreferencing the
    /// branch's blocks.
    pub(crate) async fn unstage_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
    ) -> Result<(), EngineError> {
        let bid = ws.unmerged_bid;
        let created = self.undo_unmerged_updates_locked(ctx, ws, lstate).await?;
        self.services
            .md_server
            .prune_branch(ctx, self.id(), bid)
            .await?;

        // Now go forward in time.
        self.get_and_apply_updates_locked(ctx, ws, lstate).await?;

        let (mut md, _session) = self.successor_md_for_write_locked(ctx, ws, lstate).await?;
        let mut res_op = FolderOp::resolution();
        for ptr in created {
            res_op.add_unref(ptr);
        }
        md.add_op(res_op);

        self.finalize_md_write_locked(ctx, ws, lstate, md, Excl::No, PreppedRevision::default())
            .await
    }

    /// Throw away the local unmerged branch and rejoin the mainline.
    #[instrument(level = "info", skip(self, ctx), fields(folder = %self.id()))]
    pub async fn unstage_for_testing(&self, ctx: &OpContext) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        self.branch_changes.add(1);
        let result = self
            .with_md_write_retry(&ctx, async |ws, lstate| {
                if !ws.is_unmerged() {
                    return Ok(());
                }
                self.unstage_locked(&ctx, ws, lstate).await
            })
            .await;
        self.branch_changes.done();
        result
    }

    /// Resolution failed irrecoverably; fall back to discarding the local
    /// branch.
    pub async fn unstage_after_failed_resolution(
        &self,
        ctx: &OpContext,
    ) -> Result<(), EngineError> {
        warn!("conflict resolution failed; unstaging local changes");
        self.unstage_for_testing(ctx).await
    }

    /// Entry point for the external resolver: publish its merged result
    /// atomically with pruning the branch, and swap it in as head.
    #[instrument(level = "info", skip_all, fields(folder = %self.id(), revision = %md.revision))]
    pub async fn finalize_resolution(
        &self,
        ctx: &OpContext,
        md: RootMetadata,
        blocks_to_delete: &[BlockPointer],
    ) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        self.branch_changes.add(1);
        let result = self
            .finalize_resolution_inner(&ctx, md, blocks_to_delete)
            .await;
        self.branch_changes.done();
        result
    }

    async fn finalize_resolution_inner(
        &self,
        ctx: &OpContext,
        md: RootMetadata,
        blocks_to_delete: &[BlockPointer],
    ) -> Result<(), EngineError> {
        let lstate = make_lock_state();
        let mut ws = self.writer_lock.lock(&lstate).await;
        let bid = ws.unmerged_bid;
        if bid.is_null() {
            return Err(EngineError::Invariant(
                "resolution finalized while not on an unmerged branch".to_string(),
            ));
        }

        let session = self.services.keys.current_session(ctx).await?;
        let published = self
            .services
            .md_server
            .resolve_branch(
                ctx,
                self.id(),
                bid,
                blocks_to_delete,
                md,
                &session.verifying_key,
            )
            .await?;

        let (changes, affected) = {
            let mut hs = self.head_lock.write(&lstate).await;
            self.set_head_conflict_resolved_locked(ctx, &mut ws, &mut hs, &lstate, published.clone())
                .await?;
            self.collect_op_changes(published.ops())
        };
        self.set_branch_id_locked(&mut ws, &lstate, BranchId::NULL);
        info!(revision = %published.revision(), "conflict resolution finalized");

        self.observers.batch_changes(&changes, &affected);
        Ok(())
    }

    /// Start fetching a revision's root directory block into the local
    /// cache. The fetch survives the triggering request's cancellation:
    /// it stops only when both the request and the engine itself are done
    /// (coalesced cancellation).
    pub(crate) async fn kick_off_root_block_fetch(
        &self,
        ctx: &OpContext,
        md: &ImmutableMd,
        lstate: &LockState,
    ) {
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut prefetch = self.sync_lock.write(lstate).await;
            prefetch.root_fetch = Some(RootFetch {
                md_id: md.md_id(),
                done: done_rx,
            });
        }

        let owners = CoalescingContext::new(ctx);
        let _ = owners.add_context(&self.shutdown_ctx);

        let Some(engine) = self.upgrade_self() else {
            let _ = done_tx.send(true);
            return;
        };
        let root_ptr = md.root_ptr();
        let fetch_ctx = self.background_ctx();
        tokio::spawn(async move {
            tokio::select! {
                result = engine.fetch_block(&fetch_ctx, root_ptr) => {
                    if let Err(err) = result {
                        debug!(error = %err, "root block prefetch failed");
                    }
                }
                () = owners.done() => {
                    debug!("root block prefetch abandoned; all owners done");
                }
            }
            let _ = done_tx.send(true);
        });
    }

    /// Bounded wait for the in-flight root-block prefetch of `md`.
    pub(crate) async fn wait_for_root_block_fetch(&self, md: &ImmutableMd, lstate: &LockState) {
        let rx = {
            let prefetch = self.sync_lock.read(lstate).await;
            prefetch
                .root_fetch
                .as_ref()
                .filter(|f| f.md_id == md.md_id())
                .map(|f| f.done.clone())
        };
        let Some(mut rx) = rx else {
            return;
        };
        let wait = async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.config.background_task_timeout, wait)
            .await
            .is_err()
        {
            warn!("timed out waiting for the root block prefetch; proceeding without it");
        }
    }

    /// Jump straight to the current remote head if this device has been
    /// offline long enough, invalidating every cached node in one batch
    /// instead of replaying each intermediate revision.
    pub(crate) async fn maybe_fast_forward(
        &self,
        ctx: &OpContext,
        last_update: Instant,
        curr_update: Instant,
    ) -> Result<bool, EngineError> {
        if curr_update.duration_since(last_update) < self.config.fast_forward_time_thresh {
            return Ok(false);
        }

        debug!("checking the current head for possible fast-forwarding");
        let Some(curr_head) = self
            .services
            .md_server
            .get_for_folder(ctx, self.id())
            .await?
        else {
            return Ok(false);
        };

        let lstate = make_lock_state();
        let mut ws = self.writer_lock.lock(&lstate).await;
        if self.is_dirty_locked(&ws, &lstate).await {
            return Ok(false);
        }
        if let Some(journal) = &self.services.journal {
            // Mid-flush: a real remote divergence will surface as a
            // conflict later; don't jump over our own unflushed writes.
            if journal.revisions(ctx).await?.is_some() {
                return Ok(false);
            }
        }
        if ws.is_unmerged() {
            return Ok(false);
        }

        let invalidated = {
            let mut hs = self.head_lock.write(&lstate).await;
            let watermark = hs.latest_merged.map_or(0, |r| r.0);
            if curr_head.revision().0 < watermark + self.config.fast_forward_rev_thresh {
                // Few enough revisions missed; fetch them all instead.
                return Ok(false);
            }
            self.do_fast_forward_locked(ctx, &mut ws, &mut hs, &lstate, curr_head)
                .await?
        };
        self.observers.batch_changes(&[], &invalidated);
        Ok(true)
    }

    pub(crate) async fn do_fast_forward_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        hs: &mut super::HeadState,
        lstate: &LockState,
        curr_head: ImmutableMd,
    ) -> Result<Vec<NodeId>, EngineError> {
        info!(
            from = ?hs.latest_merged,
            to = %curr_head.revision(),
            "fast-forwarding"
        );
        let invalidated = self.nodes.invalidate_all();
        self.kick_off_root_block_fetch(ctx, &curr_head, lstate).await;
        self.wait_for_root_block_fetch(&curr_head, lstate).await;
        self.set_head_successor_locked(ctx, ws, hs, lstate, curr_head, true)
            .await?;
        Ok(invalidated)
    }

    /// Fast-forward unconditionally (no thresholds), as long as local
    /// state is clean and merged.
    pub async fn force_fast_forward(&self, ctx: &OpContext) -> Result<bool, EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let Some(curr_head) = self
            .services
            .md_server
            .get_for_folder(&ctx, self.id())
            .await?
        else {
            return Ok(false);
        };

        let lstate = make_lock_state();
        let mut ws = self.writer_lock.lock(&lstate).await;
        if self.is_dirty_locked(&ws, &lstate).await || ws.is_unmerged() {
            return Ok(false);
        }
        let invalidated = {
            let mut hs = self.head_lock.write(&lstate).await;
            if hs
                .head
                .as_ref()
                .is_some_and(|h| h.md_id() == curr_head.md_id())
            {
                return Ok(false);
            }
            self.do_fast_forward_locked(&ctx, &mut ws, &mut hs, &lstate, curr_head)
                .await?
        };
        self.observers.batch_changes(&[], &invalidated);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::folder::{
        make_lock_state, EngineConfig, FolderBranch, FolderBranchEngine, Services,
    };
    use crate::meta::{FolderHandle, FolderId};
    use crate::server::memory::{
        LocalKeyAuthority, MemoryBlockServer, MemoryMdServer, RecordingRekeyListener,
        RecordingResolver,
    };
    use crate::server::{MdServer, SystemClock};
    use crate::sync::OpContext;

    fn device(
        md: &Arc<MemoryMdServer>,
        blocks: &Arc<MemoryBlockServer>,
        folder: FolderId,
        user: &str,
    ) -> Arc<FolderBranchEngine> {
        let services = Services {
            md_server: md.clone(),
            block_server: blocks.clone(),
            resolver: Arc::new(RecordingResolver::new()),
            keys: Arc::new(LocalKeyAuthority::new(user)),
            rekey: Arc::new(RecordingRekeyListener::new()),
            journal: None,
            clock: Arc::new(SystemClock),
        };
        FolderBranchEngine::new(
            FolderBranch::master(folder),
            services,
            EngineConfig {
                flush_period: std::time::Duration::from_secs(5),
                ..EngineConfig::default()
            },
        )
    }

    /// Undoing N branch revisions and redoing the same N in original
    /// order reconstructs bit-identical head state.
    #[tokio::test]
    async fn test_undo_then_redo_restores_identical_head() {
        let md = Arc::new(MemoryMdServer::new());
        let blocks = Arc::new(MemoryBlockServer::new());
        let folder = FolderId::new_random();
        let ctx = OpContext::background();

        let alice = device(&md, &blocks, folder, "alice");
        let bob = device(&md, &blocks, folder, "bob");
        alice
            .initialize_new_folder(&ctx, FolderHandle::private("alice,bob", &["alice", "bob"]))
            .await
            .unwrap();
        let alice_root = alice.root_node(&ctx).await.unwrap();
        let bob_root = bob.root_node(&ctx).await.unwrap();
        let _unpause = bob.pause_updates();
        tokio::task::yield_now().await;

        alice
            .create_file(&ctx, alice_root, "kept", false, false)
            .await
            .unwrap();
        alice.sync_all(&ctx).await.unwrap();

        // Bob diverges onto a branch with two revisions.
        bob.create_file(&ctx, bob_root, "branch-1", false, false)
            .await
            .unwrap();
        bob.sync_all(&ctx).await.unwrap();
        bob.create_file(&ctx, bob_root, "branch-2", false, false)
            .await
            .unwrap();
        bob.sync_all(&ctx).await.unwrap();

        let head_before = bob.get_head(true).await.unwrap();
        let root_ptr_before = head_before.root_ptr();
        let bid = head_before.branch_id();
        assert!(!bid.is_null());

        let rmds = md
            .get_unmerged_range(&ctx, folder, bid, crate::meta::RevisionNumber::INITIAL, None)
            .await
            .unwrap();
        assert_eq!(rmds.len(), 2);

        let lstate = make_lock_state();
        let mut ws = bob.writer_lock.lock(&lstate).await;
        bob.undo_updates_locked(&ctx, &mut ws, &lstate, &rmds)
            .await
            .unwrap();

        // The head walked back to the oldest branch revision and the
        // branch files came out of the tree.
        {
            let hs = bob.head_lock.read(&lstate).await;
            assert_eq!(hs.current_revision(), Some(rmds[0].revision()));
        }

        // Redo the same revisions in original order.
        for rmd in &rmds {
            {
                let mut hs = bob.head_lock.write(&lstate).await;
                let caught_up = hs
                    .current_revision()
                    .is_some_and(|curr| rmd.revision() <= curr);
                if !caught_up {
                    bob.set_head_successor_locked(&ctx, &mut ws, &mut hs, &lstate, rmd.clone(), false)
                        .await
                        .unwrap();
                }
            }
            for op in rmd.ops() {
                bob.apply_op_locally(op);
            }
        }
        drop(ws);

        let head_after = bob.get_head(true).await.unwrap();
        assert_eq!(head_after.md_id(), head_before.md_id(), "head state must round-trip");
        assert_eq!(head_after.root_ptr(), root_ptr_before);
        // The root node follows the pointer back.
        assert!(bob.nodes.get(root_ptr_before.bref()).is_some());
    }
}
