//! A wait group that can be reused across rounds of background work.
//!
//! The engine spawns short-lived background batches (edit notifications,
//! block archival, branch-change handling) and must be able to drain them
//! during shutdown or a sync-from-server. Unlike a one-shot barrier, the
//! counter here may go back up after reaching zero; `wait` observes the
//! moment the count is zero, whenever that is.

use std::sync::Arc;

use tokio::sync::watch;

use super::coalescing::{ContextError, OpContext};

/// Reusable counter with async zero-waiting.
#[derive(Debug, Clone)]
pub struct RepeatedWaitGroup {
    count: Arc<watch::Sender<i64>>,
}

impl Default for RepeatedWaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl RepeatedWaitGroup {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { count: Arc::new(tx) }
    }

    /// Add `n` outstanding tasks.
    pub fn add(&self, n: i64) {
        self.count.send_modify(|c| {
            *c += n;
            assert!(*c >= 0, "wait group count went negative: {c}");
        });
    }

    /// Mark one task complete. Panics if the count would go negative.
    pub fn done(&self) {
        self.add(-1);
    }

    /// Current outstanding count.
    pub fn pending(&self) -> i64 {
        *self.count.borrow()
    }

    /// Wait until the count reaches zero, or `ctx` is cancelled.
    pub async fn wait(&self, ctx: &OpContext) -> Result<(), ContextError> {
        let mut rx = self.count.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                () = ctx.cancelled() => return Err(ContextError::Cancelled),
            }
        }
    }
}
