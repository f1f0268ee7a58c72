//! Background loops and shutdown sequencing.
//!
//! Each loop is a task owning its channel endpoints, handed over at spawn
//! time; the engine keeps only the sending halves and the shutdown
//! context every loop selects on. The flusher starts with the engine; the
//! update-registration loop starts when the first head is set.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::block::BlockRef;
use crate::folder::{make_lock_state, EngineError, FolderBranchEngine};
use crate::meta::RevisionNumber;
use crate::server::{MdServerError, UpdateReceiver};
use crate::sync::{ContextError, OpContext, RepeatedWaitGroup};

/// Tolerance for draining best-effort background activity when the
/// network may be gone.
const DRAIN_TOLERANCE: Duration = Duration::from_millis(500);

impl FolderBranchEngine {
    pub(crate) fn spawn_background_flusher(
        self: &Arc<Self>,
        sync_needed_rx: mpsc::Receiver<()>,
        force_sync_rx: mpsc::Receiver<()>,
    ) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(background_flusher(weak, sync_needed_rx, force_sync_rx));
        *self.flusher_handle.lock().unwrap() = Some(handle);
    }

    /// Start the remote-update registration loop. Called exactly once,
    /// when the first head is set.
    pub(crate) fn spawn_update_registration(&self) {
        let Some(engine) = self.upgrade_self() else {
            return;
        };
        let Some(pause_rx) = engine.update_pause_rx.lock().unwrap().take() else {
            // Already running.
            return;
        };
        let ctx = engine.background_ctx();
        *engine.cancel_updates.lock().unwrap() = Some(ctx.clone());
        let weak = Arc::downgrade(&engine);
        let handle = tokio::spawn(register_and_wait_for_updates(weak, ctx, pause_rx));
        *engine.registration_handle.lock().unwrap() = Some(handle);
    }

    /// Register with the metadata server for revisions above the current
    /// merged watermark.
    pub(crate) async fn register_for_updates(
        &self,
        ctx: &OpContext,
    ) -> Result<UpdateReceiver, EngineError> {
        let since = self
            .latest_merged_revision()
            .await
            .unwrap_or(RevisionNumber(0));
        debug!(since = %since, "registering for updates");
        Ok(self
            .services
            .md_server
            .register_for_updates(ctx, self.id(), since)
            .await?)
    }

    /// Consume pings from one registration until the channel ends, an
    /// error arrives, or the context is cancelled.
    pub(crate) async fn wait_for_and_process_updates(
        &self,
        ctx: &OpContext,
        mut update_rx: UpdateReceiver,
        pause_rx: &mut mpsc::Receiver<oneshot::Receiver<()>>,
        last_update: &mut Instant,
    ) -> Result<(), EngineError> {
        debug!("waiting for updates");
        loop {
            // Biased so that cancellation and pause requests preempt a
            // ready update ping.
            tokio::select! {
                biased;
                () = ctx.cancelled() => return Err(EngineError::Cancelled),
                pause = pause_rx.recv() => match pause {
                    None => return Ok(()),
                    Some(unpause) => {
                        info!("updates paused");
                        let _ = unpause.await;
                        info!("updates unpaused");
                    }
                },
                msg = update_rx.recv() => match msg {
                    None => return Ok(()),
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(())) => {
                        debug!("got an update ping");
                        let now = Instant::now();
                        // Applying updates holds locks; bound how long.
                        let apply = async {
                            let fast_forwarded =
                                self.maybe_fast_forward(ctx, *last_update, now).await?;
                            if !fast_forwarded {
                                self.get_and_apply_updates(ctx).await?;
                            }
                            Ok::<(), EngineError>(())
                        };
                        match tokio::time::timeout(self.config.background_task_timeout, apply)
                            .await
                        {
                            Ok(Ok(())) => *last_update = now,
                            Ok(Err(err)) => return Err(err),
                            Err(_) => return Err(EngineError::MdServer(MdServerError::Timeout)),
                        }
                    }
                },
            }
        }
    }

    async fn backoff_sleep(&self, ctx: &OpContext, backoff: &mut Duration) {
        let jitter = backoff.mul_f64(rand::random::<f64>() * 0.2);
        let delay = *backoff + jitter;
        debug!(delay_ms = delay.as_millis() as u64, "backing off before re-registering");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = ctx.cancelled() => {}
        }
        *backoff = (*backoff * 2).min(self.config.register_backoff_ceiling);
    }

    /// Bring this device fully up to date with the mainline.
    ///
    /// Flushes any dirty local state first — remote updates are never
    /// applied on top of unflushed writes — then loops until the merged
    /// history is fully applied, waiting out conflict resolution if the
    /// folder is staged.
    #[instrument(level = "info", skip(self, ctx), fields(folder = %self.id()))]
    pub async fn sync_from_server(&self, ctx: &OpContext) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);

        self.sync_all_unlocked(&ctx).await?;

        if let Some(journal) = &self.services.journal {
            journal.wait_for_flush(&ctx).await?;
        }
        self.branch_changes.wait(&ctx).await?;

        if !self.services.md_server.is_connected() {
            debug!("not fetching new updates while offline");
            return Ok(());
        }

        loop {
            let unmerged = {
                let lstate = make_lock_state();
                let ws = self.writer_lock.lock(&lstate).await;
                ws.is_unmerged()
            };
            if unmerged {
                self.services.resolver.wait(&ctx).await?;
                let still_unmerged = {
                    let lstate = make_lock_state();
                    let ws = self.writer_lock.lock(&lstate).await;
                    ws.is_unmerged()
                };
                if still_unmerged {
                    return Err(EngineError::StillStagedAfterResolution);
                }
            }

            {
                let lstate = make_lock_state();
                let ws = self.writer_lock.lock(&lstate).await;
                if self.is_dirty_locked(&ws, &lstate).await {
                    // A concurrent writer snuck in after our flush.
                    return Err(EngineError::NotPermittedWhileDirty);
                }
            }

            if let Some(journal) = &self.services.journal {
                journal.wait_for_flush(&ctx).await?;
            }
            self.branch_changes.wait(&ctx).await?;

            match self.get_and_apply_updates(&ctx).await {
                Ok(()) => break,
                Err(EngineError::Unmerged) => continue,
                Err(err) => return Err(err),
            }
        }

        // Let in-flight notification/archival batches drain, tolerating a
        // wedged network.
        self.drain_waitgroup(&ctx, &self.edit_activity, "edit notifications")
            .await?;
        self.drain_waitgroup(&ctx, &self.archivals, "block archival")
            .await?;
        Ok(())
    }

    async fn drain_waitgroup(
        &self,
        ctx: &OpContext,
        wg: &RepeatedWaitGroup,
        what: &str,
    ) -> Result<(), EngineError> {
        match tokio::time::timeout(DRAIN_TOLERANCE, wg.wait(ctx)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(ContextError::Cancelled)) => Err(EngineError::Cancelled),
            Err(_) => {
                debug!(what, "timed out draining background activity");
                Ok(())
            }
        }
    }

    /// Stop every background loop and wait for them to finish.
    ///
    /// With `check_state_on_shutdown`, clean merged state is verified
    /// against the server before shutdown completes.
    #[instrument(level = "info", skip(self, ctx), fields(folder = %self.id()))]
    pub async fn shutdown(&self, ctx: &OpContext) -> Result<(), EngineError> {
        if self.is_shut_down() {
            return Ok(());
        }
        let ctx = self.new_ctx(ctx);

        if self.config.check_state_on_shutdown {
            let (dirty, unmerged) = {
                let lstate = make_lock_state();
                let ws = self.writer_lock.lock(&lstate).await;
                (self.is_dirty_locked(&ws, &lstate).await, ws.is_unmerged())
            };
            if dirty {
                debug!("skipping the shutdown state check due to dirty state");
            } else if unmerged {
                debug!("skipping the shutdown state check while staged");
            } else {
                self.sync_from_server(&ctx).await?;
                self.check_merged_state(&ctx).await?;
            }
        }

        self.drain_waitgroup(&ctx, &self.archivals, "block archival")
            .await?;

        self.shutdown_ctx.cancel();
        if let Some(updates_ctx) = self.cancel_updates.lock().unwrap().take() {
            updates_ctx.cancel();
        }
        self.services.resolver.shutdown();

        let registration = self.registration_handle.lock().unwrap().take();
        if let Some(handle) = registration {
            let _ = handle.await;
        }
        let flusher = self.flusher_handle.lock().unwrap().take();
        if let Some(handle) = flusher {
            let _ = handle.await;
        }

        // One more drain so nothing tracked outlives the engine.
        let drain_ctx = OpContext::background().child();
        for wg in [&self.edit_activity, &self.branch_changes, &self.archivals] {
            let _ = tokio::time::timeout(Duration::from_secs(1), wg.wait(&drain_ctx)).await;
        }
        info!("folder-branch engine shut down");
        Ok(())
    }

    /// Verify our idea of merged state against the server's.
    async fn check_merged_state(&self, ctx: &OpContext) -> Result<(), EngineError> {
        let server_head = self
            .services
            .md_server
            .get_for_folder(ctx, self.id())
            .await?;
        let local_head = self.get_head(true).await;
        match (&server_head, &local_head) {
            (None, None) => Ok(()),
            (Some(server), Some(local)) if server.md_id() == local.md_id() => Ok(()),
            _ => Err(EngineError::Invariant(format!(
                "merged state mismatch at shutdown: server at {:?}, local at {:?}",
                server_head.map(|m| m.revision()),
                local_head.map(|m| m.revision()),
            ))),
        }
    }
}

async fn register_and_wait_for_updates(
    weak: Weak<FolderBranchEngine>,
    ctx: OpContext,
    mut pause_rx: mpsc::Receiver<oneshot::Receiver<()>>,
) {
    let mut last_update = Instant::now();
    let mut backoff = {
        let Some(engine) = weak.upgrade() else { return };
        engine.config.register_backoff_floor
    };
    loop {
        if ctx.is_cancelled() {
            return;
        }
        let Some(engine) = weak.upgrade() else {
            return;
        };

        match engine.register_for_updates(&ctx).await {
            Ok(update_rx) => {
                backoff = engine.config.register_backoff_floor;
                match engine
                    .wait_for_and_process_updates(&ctx, update_rx, &mut pause_rx, &mut last_update)
                    .await
                {
                    // Channel ended; re-register right away.
                    Ok(()) => {}
                    // Local divergence: skip the backoff and go straight
                    // back to registration; resolution runs elsewhere.
                    Err(EngineError::Unmerged) => {
                        debug!("updates paused by an unmerged branch; re-registering");
                    }
                    Err(EngineError::Cancelled) => return,
                    Err(EngineError::MdServer(err @ MdServerError::VersionSkew { .. })) => {
                        // This client can no longer read new revisions;
                        // abandon updates for good.
                        warn!(error = %err, "abandoning updates: cannot read newest metadata");
                        engine.status.set_permanent_error(err.to_string());
                        ctx.cancel();
                        return;
                    }
                    Err(err) => {
                        debug!(error = %err, "error while processing updates");
                        engine.backoff_sleep(&ctx, &mut backoff).await;
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, "update registration failed");
                engine.backoff_sleep(&ctx, &mut backoff).await;
            }
        }
    }
}

async fn background_flusher(
    weak: Weak<FolderBranchEngine>,
    mut sync_needed_rx: mpsc::Receiver<()>,
    mut force_sync_rx: mpsc::Receiver<()>,
) {
    let mut prev_dirty: HashSet<BlockRef> = HashSet::new();
    let mut same_dirty_count: u32 = 0;
    let mut last_attempt_failed = false;
    loop {
        let Some(engine) = weak.upgrade() else {
            return;
        };
        if engine.is_shut_down() {
            return;
        }
        let shutdown = engine.shutdown_ctx.clone();

        let ops_count = {
            let lstate = make_lock_state();
            let ws = engine.writer_lock.lock(&lstate).await;
            ws.ops.len()
        };
        let batch_size = engine.config.dir_op_batch_size;
        let have_dirty = {
            let lstate = make_lock_state();
            engine.is_dirty(&lstate).await
        };
        // Dirty files left over from a failed attempt: retry promptly a
        // few times before going back to waiting on signals.
        let retry_now = have_dirty && last_attempt_failed && same_dirty_count < 10;

        if ops_count < batch_size && !retry_now {
            // Wait until we really have a write waiting.
            let mut batch_up = true;
            tokio::select! {
                _ = sync_needed_rx.recv() => {}
                _ = force_sync_rx.recv() => batch_up = false,
                () = shutdown.cancelled() => return,
            }

            if batch_up {
                // Batch further writes for one flush period, unless the
                // op buffer fills or a sync is forced first.
                let timer = tokio::time::sleep(engine.config.flush_period);
                tokio::pin!(timer);
                loop {
                    tokio::select! {
                        () = &mut timer => break,
                        _ = sync_needed_rx.recv() => {
                            let count = {
                                let lstate = make_lock_state();
                                let ws = engine.writer_lock.lock(&lstate).await;
                                ws.ops.len()
                            };
                            if count >= batch_size {
                                break;
                            }
                        }
                        _ = force_sync_rx.recv() => break,
                        () = shutdown.cancelled() => return,
                    }
                }
            }
        }

        let dirty: HashSet<BlockRef> = {
            let lstate = make_lock_state();
            let stage = engine.block_lock.read(&lstate).await;
            stage.dirty_file_refs().into_iter().collect()
        };
        let ops_count = {
            let lstate = make_lock_state();
            let ws = engine.writer_lock.lock(&lstate).await;
            ws.ops.len()
        };
        if dirty.is_empty() && ops_count == 0 {
            same_dirty_count = 0;
            continue;
        }

        // Livelock guard: if the upload path is wedged, keep retrying but
        // start complaining instead of spinning silently.
        if dirty == prev_dirty {
            same_dirty_count += 1;
        } else {
            same_dirty_count = 0;
        }
        prev_dirty = dirty.clone();
        if same_dirty_count >= engine.config.no_progress_warn_threshold {
            warn!(
                attempts = same_dirty_count,
                files = dirty.len(),
                "making no sync progress on dirty files"
            );
        }

        let ctx = engine.background_ctx();
        debug!(
            files = dirty.len(),
            ops = ops_count,
            "background sync triggered"
        );
        last_attempt_failed =
            match tokio::time::timeout(engine.config.background_task_timeout, engine.sync_all(&ctx))
                .await
            {
                Ok(Ok(())) => false,
                Ok(Err(err)) => {
                    warn!(error = %err, "background sync failed; will retry");
                    true
                }
                Err(_) => {
                    warn!("background sync timed out; will retry");
                    true
                }
            };
    }
}
