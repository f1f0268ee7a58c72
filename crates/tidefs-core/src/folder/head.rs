//! Head-revision state: which revision this engine trusts as current,
//! and the latest-merged watermark.

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::folder::{EngineError, FolderBranchEngine, WriterState};
use crate::meta::{BranchId, ImmutableMd, MergedStatus, MetadataError, RevisionNumber};
use crate::sync::{LockState, OpContext};

/// Whether the head arrived through a verified path.
///
/// Untrusted heads come from rekey notifications, fetched by folder id
/// without handle verification; they must be validated before the engine
/// relies on them, and a trusted head is never replaced by an untrusted
/// one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeadTrust {
    Untrusted,
    Trusted,
}

/// State protected by the head lock.
#[derive(Debug)]
pub struct HeadState {
    pub(crate) head: Option<ImmutableMd>,
    pub(crate) trust: HeadTrust,
    /// Highest revision known to exist on the mainline, independent of
    /// whether this device's head is that revision.
    pub(crate) latest_merged: Option<RevisionNumber>,
    latest_merged_tx: watch::Sender<Option<RevisionNumber>>,
}

impl HeadState {
    pub(crate) fn new() -> (Self, watch::Receiver<Option<RevisionNumber>>) {
        let (tx, rx) = watch::channel(None);
        (
            Self {
                head: None,
                trust: HeadTrust::Untrusted,
                latest_merged: None,
                latest_merged_tx: tx,
            },
            rx,
        )
    }

    pub(crate) fn current_revision(&self) -> Option<RevisionNumber> {
        self.head.as_ref().map(ImmutableMd::revision)
    }

    /// Advance (or, for unstaging, override) the latest-merged watermark
    /// and broadcast the change to waiters.
    pub(crate) fn set_latest_merged(&mut self, rev: RevisionNumber, allow_backward: bool) {
        match self.latest_merged {
            Some(current) if current >= rev && !allow_backward => {
                debug!(
                    current = %current,
                    new = %rev,
                    "latest merged revision is already newer; not updating"
                );
            }
            _ => {
                debug!(revision = %rev, "updated latest merged revision");
                self.latest_merged = Some(rev);
            }
        }
        // Rotate the signal even when the value stands, so "wait until it
        // changed since I observed it" wakes on every update pass.
        self.latest_merged_tx.send_replace(self.latest_merged);
    }
}

impl FolderBranchEngine {
    /// Read the current head. With `trust_required`, an untrusted head is
    /// reported as absent, signalling the caller to fetch and validate.
    pub async fn get_head(&self, trust_required: bool) -> Option<ImmutableMd> {
        let lstate = super::make_lock_state();
        let hs = self.head_lock.read(&lstate).await;
        match (&hs.head, hs.trust) {
            (Some(_), HeadTrust::Untrusted) if trust_required => None,
            (head, _) => head.clone(),
        }
    }

    /// The latest-merged watermark.
    pub async fn latest_merged_revision(&self) -> Option<RevisionNumber> {
        let lstate = super::make_lock_state();
        let hs = self.head_lock.read(&lstate).await;
        hs.latest_merged
    }

    /// Switch the unmerged branch id. Switching onto a fresh branch resets
    /// the resolver's bookkeeping.
    pub(crate) fn set_branch_id_locked(
        &self,
        ws: &mut WriterState,
        lstate: &LockState,
        bid: BranchId,
    ) {
        self.writer_lock.assert_locked(lstate);
        if ws.unmerged_bid == bid {
            return;
        }
        info!(old = %ws.unmerged_bid, new = %bid, "switching unmerged branch id");
        ws.unmerged_bid = bid;
        if !bid.is_null() {
            self.services.resolver.begin_new_branch();
        }
    }

    /// Set the head revision. Must hold the writer lock and an exclusive
    /// head lock.
    ///
    /// Validates the transition (first head, untrusted validation,
    /// identical-head rejection), applies the journal-aware
    /// latest-merged-watermark rules, fires the became-readable
    /// notification on an unreadable-to-readable transition, and starts
    /// the update-registration loop on the very first head.
    pub(crate) async fn set_head_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        hs: &mut HeadState,
        lstate: &LockState,
        md: ImmutableMd,
        trust: HeadTrust,
    ) -> Result<(), EngineError> {
        self.writer_lock.assert_locked(lstate);
        self.head_lock.assert_locked(lstate);

        let is_first = hs.head.is_none();
        let mut was_readable = false;
        if let Some(head) = &hs.head {
            assert!(
                trust == HeadTrust::Trusted,
                "trying to set an untrusted head over an existing head"
            );
            was_readable = head.is_readable();

            if hs.trust == HeadTrust::Untrusted {
                // Validating a head that arrived from a rekey
                // notification: the folder id must match what we were
                // constructed for.
                if md.folder_id() != self.id() {
                    return Err(EngineError::Metadata(MetadataError::FolderMismatch {
                        expected: self.id(),
                        found: md.folder_id(),
                    }));
                }
                hs.trust = HeadTrust::Trusted;
                if head.md_id() == md.md_id() {
                    // Same revision, now verified.
                    return Ok(());
                }
            }

            assert!(
                head.md_id() != md.md_id(),
                "re-putting the same metadata revision {}",
                md.md_id()
            );
        }

        debug!(revision = %md.revision(), trusted = ?trust, "setting head revision");

        if is_first && !md.merged_status().is_merged() {
            // Starting out on unmerged data: record the branch and kick
            // off conflict resolution right away.
            self.set_branch_id_locked(ws, lstate, md.branch_id());
            self.services.resolver.resolve(Some(md.revision()), None);
        } else if md.merged_status().is_merged() {
            match (&self.services.journal, md.put_to_server()) {
                (Some(journal), _) if is_first => {
                    // With a journal in front of the server, bootstrap the
                    // watermark from what has actually been flushed, not
                    // from a revision that may only exist locally.
                    match journal.predecessor_revision(ctx).await? {
                        Some(pred) => hs.set_latest_merged(pred, false),
                        None => debug!("journal has no flushed revisions; leaving watermark unset"),
                    }
                }
                (Some(_), false) => {
                    // Journaled write that hasn't reached the server yet;
                    // the flush callback advances the watermark later.
                }
                _ => hs.set_latest_merged(md.revision(), false),
            }
        }

        hs.head = Some(md.clone());
        if is_first && trust == HeadTrust::Trusted {
            hs.trust = HeadTrust::Trusted;
        }

        if is_first && self.folder_branch().branch.is_master() {
            self.spawn_update_registration();
        }

        if !was_readable && md.is_readable() {
            // A rekey may have just made this folder readable.
            self.observers.became_readable(md.handle());
        }
        Ok(())
    }

    /// First head for a brand-new folder created by this device.
    pub(crate) async fn set_initial_head_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        hs: &mut HeadState,
        lstate: &LockState,
        md: ImmutableMd,
    ) -> Result<(), EngineError> {
        if hs.head.is_some() {
            return Err(EngineError::Invariant(
                "unexpected existing head while setting a new initial head".to_string(),
            ));
        }
        if md.revision() != RevisionNumber::INITIAL {
            return Err(EngineError::Invariant(format!(
                "initial head has revision {}",
                md.revision()
            )));
        }
        self.set_head_locked(ctx, ws, hs, lstate, md, HeadTrust::Trusted)
            .await
    }

    /// First head fetched due to a user action and checked against the
    /// folder name.
    pub(crate) async fn set_initial_head_trusted_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        hs: &mut HeadState,
        lstate: &LockState,
        md: ImmutableMd,
    ) -> Result<(), EngineError> {
        if hs.head.is_some() {
            return Err(EngineError::Invariant(
                "unexpected existing head while setting the initial trusted head".to_string(),
            ));
        }
        self.set_head_locked(ctx, ws, hs, lstate, md, HeadTrust::Trusted)
            .await
    }

    /// Apply a successor head: an update from the server, or one we just
    /// published ourselves. With `rebased`, the successor check is skipped
    /// (fast-forward and branch moves).
    pub(crate) async fn set_head_successor_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        hs: &mut HeadState,
        lstate: &LockState,
        md: ImmutableMd,
        rebased: bool,
    ) -> Result<(), EngineError> {
        let Some(head) = hs.head.clone() else {
            // First contact with this folder's data (sync-from-server on
            // a fresh engine).
            return self
                .set_initial_head_trusted_locked(ctx, ws, hs, lstate, md)
                .await;
        };

        if !rebased {
            head.check_valid_successor(md.root_metadata())?;
        }

        // Handles may only become more resolved over time.
        let old_handle = head.handle().clone();
        let new_handle = md.handle().clone();
        if !old_handle.resolves_to(&new_handle) {
            warn!(
                old = %old_handle,
                new = %new_handle,
                "rejecting head with incompatible handle"
            );
            return Err(EngineError::Metadata(MetadataError::IncompatibleHandle {
                old: old_handle.canonical_name(),
                new: new_handle.canonical_name(),
            }));
        }

        self.set_head_locked(ctx, ws, hs, lstate, md, HeadTrust::Trusted)
            .await?;

        if old_handle.canonical_name() != new_handle.canonical_name() {
            debug!(
                old = %old_handle.canonical_name(),
                new = %new_handle.canonical_name(),
                "folder handle changed"
            );
            self.observers.handle_change(&new_handle);
        }
        Ok(())
    }

    /// Walk the head backward one revision while unstaging.
    pub(crate) async fn set_head_predecessor_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        hs: &mut HeadState,
        lstate: &LockState,
        md: ImmutableMd,
    ) -> Result<(), EngineError> {
        let Some(head) = hs.head.clone() else {
            return Err(EngineError::Invariant(
                "unexpected missing head while setting a predecessor".to_string(),
            ));
        };
        if head.revision() <= RevisionNumber::INITIAL {
            return Err(EngineError::Invariant(format!(
                "cannot walk back from revision {}",
                head.revision()
            )));
        }
        if head.merged_status().is_merged() {
            return Err(EngineError::Invariant(
                "predecessor head-set requires an unmerged head".to_string(),
            ));
        }

        // The current head must descend from the prospective predecessor.
        md.check_valid_successor(head.root_metadata())?;

        // No rekeying happens while unmerged, so the handles must match
        // exactly.
        if md.handle() != head.handle() {
            return Err(EngineError::Metadata(MetadataError::IncompatibleHandle {
                old: head.handle().canonical_name(),
                new: md.handle().canonical_name(),
            }));
        }

        self.set_head_locked(ctx, ws, hs, lstate, md, HeadTrust::Trusted)
            .await
    }

    /// Install the merged revision that resolved this folder's conflicts.
    pub(crate) async fn set_head_conflict_resolved_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        hs: &mut HeadState,
        lstate: &LockState,
        md: ImmutableMd,
    ) -> Result<(), EngineError> {
        let unmerged_head = hs
            .head
            .as_ref()
            .map(ImmutableMd::merged_status)
            .unwrap_or(MergedStatus::Merged);
        if unmerged_head.is_merged() {
            return Err(EngineError::Invariant(
                "conflict-resolved head-set requires an unmerged head".to_string(),
            ));
        }
        if !md.merged_status().is_merged() {
            return Err(EngineError::Invariant(
                "conflict resolution must produce a merged revision".to_string(),
            ));
        }
        self.set_head_locked(ctx, ws, hs, lstate, md, HeadTrust::Trusted)
            .await
    }
}
