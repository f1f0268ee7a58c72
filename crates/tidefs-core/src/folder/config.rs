//! Tunables for one folder-branch engine.

use std::time::Duration;

/// Engine thresholds and periods. `EngineConfig::default()` matches
/// production behavior; tests shrink the durations.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How long the background flusher waits after the first write signal
    /// before syncing, batching up subsequent writes.
    pub flush_period: Duration,
    /// Buffered directory-operation count that triggers an immediate
    /// background sync instead of waiting out the flush period.
    pub dir_op_batch_size: usize,
    /// Attempt cap for the metadata-write retry wrapper.
    pub max_md_write_retries: usize,
    /// Consecutive background flushes seeing an identical dirty-file set
    /// before the flusher starts warning about lack of progress.
    pub no_progress_warn_threshold: u32,
    /// Minimum quiet time before a remote update may be handled by
    /// fast-forwarding instead of replaying intermediate revisions.
    pub fast_forward_time_thresh: Duration,
    /// Minimum number of missed revisions before fast-forwarding.
    ///
    /// Fast-forward drops intermediate revisions' per-operation
    /// notifications in favor of one coarse invalidation; consumers that
    /// need per-revision fidelity should set this very high.
    pub fast_forward_rev_thresh: u64,
    /// Grace period during which a cancellation arriving mid-publish is
    /// deferred, so the caller never sees "cancelled" for a write that
    /// may have landed.
    pub delayed_cancellation_grace: Duration,
    /// Upper bound on any single background task (sync attempt, root
    /// block prefetch wait).
    pub background_task_timeout: Duration,
    /// Starting delay for update-registration retries.
    pub register_backoff_floor: Duration,
    /// Ceiling for update-registration retries.
    pub register_backoff_ceiling: Duration,
    /// Run a merged-state consistency pass before finishing shutdown.
    pub check_state_on_shutdown: bool,
    /// Whether this folder is configured for full local sync. Unsynced
    /// folders report offline fetch failures as a distinguished
    /// "offline and unsynced" error so upper layers can recommend
    /// enabling sync.
    pub fully_synced: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_period: Duration::from_secs(1),
            dir_op_batch_size: 100,
            max_md_write_retries: 10,
            no_progress_warn_threshold: 100,
            fast_forward_time_thresh: Duration::from_secs(15 * 60),
            fast_forward_rev_thresh: 50,
            delayed_cancellation_grace: Duration::from_secs(2),
            background_task_timeout: Duration::from_secs(60),
            register_backoff_floor: Duration::from_millis(500),
            register_backoff_ceiling: Duration::from_secs(5 * 60),
            check_state_on_shutdown: false,
            fully_synced: false,
        }
    }
}
