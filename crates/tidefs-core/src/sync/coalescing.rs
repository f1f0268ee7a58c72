//! Cancellation contexts for engine operations.
//!
//! [`OpContext`] is the value plumbed through every engine operation: a
//! cancellation signal plus a small string tag map (operation ids, the
//! background-flow marker). Contexts form parent/child chains; cancelling a
//! parent cancels every descendant.
//!
//! [`CoalescingContext`] merges cancellation from *multiple* parents and
//! becomes done only once every added parent is done. Background work
//! spawned in reaction to one request (say, a root-block prefetch) must also
//! observe the folder's shutdown context; coalescing gives the correct
//! policy of "cancel only when all relevant owners have fired" rather than
//! "cancel on whichever fires first".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Error from context-sensitive waiting.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The context (or one of its ancestors) was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

/// Error from [`CoalescingContext::add_context`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalescingError {
    /// Every parent already finished; the coalescing context is done.
    #[error("coalescing context is already done")]
    Cancelled,
}

#[derive(Debug)]
struct OpContextInner {
    cancel_tx: watch::Sender<bool>,
    values: HashMap<&'static str, String>,
    parent: Option<OpContext>,
    /// Cancellation observed before this instant is deferred until it.
    suspend_until: Mutex<Option<Instant>>,
}

/// A cancellable, value-carrying context for one logical operation.
///
/// Cloning is cheap and shares the same cancellation state.
#[derive(Debug, Clone)]
pub struct OpContext {
    inner: Arc<OpContextInner>,
}

impl OpContext {
    fn make(parent: Option<OpContext>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(OpContextInner {
                cancel_tx,
                values: HashMap::new(),
                parent,
                suspend_until: Mutex::new(None),
            }),
        }
    }

    /// A root context that is never cancelled.
    pub fn background() -> Self {
        Self::make(None)
    }

    /// A child cancelled when either it or `self` is cancelled.
    pub fn child(&self) -> Self {
        Self::make(Some(self.clone()))
    }

    /// Attach a string tag, returning the modified context.
    ///
    /// Lookups fall back through the parent chain, so children inherit tags.
    pub fn with_value(self, key: &'static str, value: impl Into<String>) -> Self {
        let mut inner = OpContextInner {
            cancel_tx: self.inner.cancel_tx.clone(),
            values: self.inner.values.clone(),
            parent: self.inner.parent.clone(),
            suspend_until: Mutex::new(*self.inner.suspend_until.lock().unwrap()),
        };
        inner.values.insert(key, value.into());
        Self { inner: Arc::new(inner) }
    }

    /// Look up a tag on this context or the nearest ancestor carrying it.
    pub fn value(&self, key: &str) -> Option<String> {
        let mut cur = Some(self);
        while let Some(ctx) = cur {
            if let Some(v) = ctx.inner.values.get(key) {
                return Some(v.clone());
            }
            cur = ctx.inner.parent.as_ref();
        }
        None
    }

    /// Cancel this context and all its descendants.
    pub fn cancel(&self) {
        let _ = self.inner.cancel_tx.send(true);
    }

    /// Defer observable cancellation of this context for `grace`.
    ///
    /// Once a flow starts writing to the remote metadata store, a
    /// client-visible cancellation would leave the operation's effect
    /// ambiguous (the write may still land). Suspending turns the publish
    /// step into a critical section: cancellation is only reported after
    /// the grace period elapses or the flow completes on its own.
    pub fn suspend_cancellation(&self, grace: Duration) {
        let mut s = self.inner.suspend_until.lock().unwrap();
        *s = Some(Instant::now() + grace);
    }

    fn raw_cancelled(&self) -> bool {
        let mut cur = Some(self);
        while let Some(ctx) = cur {
            if *ctx.inner.cancel_tx.borrow() {
                return true;
            }
            cur = ctx.inner.parent.as_ref();
        }
        false
    }

    /// Whether cancellation is currently observable on this context.
    pub fn is_cancelled(&self) -> bool {
        if !self.raw_cancelled() {
            return false;
        }
        match *self.inner.suspend_until.lock().unwrap() {
            Some(deadline) => Instant::now() >= deadline,
            None => true,
        }
    }

    /// `Err(ContextError::Cancelled)` if cancellation is observable.
    pub fn check(&self) -> Result<(), ContextError> {
        if self.is_cancelled() {
            Err(ContextError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is observable. Pending forever on a
    /// never-cancelled chain.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + use<'_> {
        async move {
            // Wait for any link of the chain to flip, then honor a suspension.
            let mut rxs: Vec<watch::Receiver<bool>> = Vec::new();
            let mut cur = Some(self);
            while let Some(ctx) = cur {
                rxs.push(ctx.inner.cancel_tx.subscribe());
                cur = ctx.inner.parent.as_ref();
            }
            let waits = rxs
                .iter_mut()
                .map(|rx| Box::pin(async move { while !*rx.borrow_and_update() { if rx.changed().await.is_err() { std::future::pending::<()>().await; } } }))
                .collect::<Vec<_>>();
            futures::future::select_all(waits).await;

            let deadline = *self.inner.suspend_until.lock().unwrap();
            if let Some(deadline) = deadline {
                tokio::time::sleep_until(deadline).await;
            }
        }
    }
}

#[derive(Debug)]
struct CoalescingState {
    parents: Vec<OpContext>,
    live: usize,
    finished: bool,
}

#[derive(Debug)]
struct CoalescingInner {
    done_tx: watch::Sender<bool>,
    state: Mutex<CoalescingState>,
}

impl CoalescingInner {
    /// Idempotent: the done signal is sent at most once.
    fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        if state.finished {
            return;
        }
        state.finished = true;
        let _ = self.done_tx.send(true);
    }
}

/// A context that is done only once *all* of its parents are done.
#[derive(Debug, Clone)]
pub struct CoalescingContext {
    inner: Arc<CoalescingInner>,
}

impl CoalescingContext {
    /// Build from a first parent. More parents may be added later with
    /// [`add_context`](Self::add_context).
    pub fn new(parent: &OpContext) -> Self {
        let (done_tx, _) = watch::channel(false);
        let ctx = Self {
            inner: Arc::new(CoalescingInner {
                done_tx,
                state: Mutex::new(CoalescingState {
                    parents: Vec::new(),
                    live: 0,
                    finished: false,
                }),
            }),
        };
        ctx.add_context(parent)
            .expect("fresh coalescing context cannot be done");
        ctx
    }

    /// Add another parent whose completion this context must also wait for.
    ///
    /// Errors (and changes nothing) if every previous parent has already
    /// finished — the context is done and stays done.
    pub fn add_context(&self, parent: &OpContext) -> Result<(), CoalescingError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.finished {
                return Err(CoalescingError::Cancelled);
            }
            state.live += 1;
            state.parents.push(parent.clone());
        }
        let inner = Arc::clone(&self.inner);
        let parent = parent.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            let all_done = {
                let mut state = inner.state.lock().unwrap();
                state.live -= 1;
                state.live == 0
            };
            if all_done {
                inner.finish();
            }
        });
        Ok(())
    }

    /// Whether every parent has finished.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().unwrap().finished
    }

    /// Resolves once every parent has finished.
    pub async fn done(&self) {
        let mut rx = self.inner.done_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Look up a tag, falling back to the first parent that resolves it,
    /// in the order parents were added.
    pub fn value(&self, key: &str) -> Option<String> {
        let parents = self.inner.state.lock().unwrap().parents.clone();
        parents.iter().find_map(|p| p.value(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_child_sees_parent_cancellation() {
        let parent = OpContext::background().child();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        timeout(SHORT, child.cancelled()).await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_unaffected_by_child_cancellation() {
        let parent = OpContext::background().child();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_value_fallback_through_chain() {
        let parent = OpContext::background().with_value("op-id", "42");
        let child = parent.child().with_value("background", "1");
        assert_eq!(child.value("op-id").as_deref(), Some("42"));
        assert_eq!(child.value("background").as_deref(), Some("1"));
        assert_eq!(parent.value("background"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_cancellation_defers_observation() {
        let ctx = OpContext::background().child();
        ctx.suspend_cancellation(Duration::from_secs(5));
        ctx.cancel();
        assert!(!ctx.is_cancelled());
        assert!(ctx.check().is_ok());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.check(), Err(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn test_coalescing_not_done_while_any_parent_alive() {
        let a = OpContext::background().child();
        let b = OpContext::background().child();
        let coalesced = CoalescingContext::new(&a);
        coalesced.add_context(&b).unwrap();

        a.cancel();
        // Give the watcher a chance to run; b is still alive.
        tokio::task::yield_now().await;
        assert!(!coalesced.is_done());

        b.cancel();
        timeout(SHORT, coalesced.done()).await.unwrap();
        assert!(coalesced.is_done());
    }

    #[tokio::test]
    async fn test_coalescing_add_after_done_is_rejected() {
        let a = OpContext::background().child();
        let coalesced = CoalescingContext::new(&a);
        a.cancel();
        timeout(SHORT, coalesced.done()).await.unwrap();

        let late = OpContext::background().child();
        assert_eq!(
            coalesced.add_context(&late),
            Err(CoalescingError::Cancelled)
        );
        // And it stays done; the late parent is not tracked.
        assert!(coalesced.is_done());
    }

    #[tokio::test]
    async fn test_coalescing_done_is_idempotent() {
        let a = OpContext::background().child();
        let coalesced = CoalescingContext::new(&a);
        a.cancel();
        timeout(SHORT, coalesced.done()).await.unwrap();
        // Waiting again returns immediately instead of hanging.
        timeout(SHORT, coalesced.done()).await.unwrap();
    }

    #[tokio::test]
    async fn test_coalescing_value_uses_first_resolving_parent() {
        let a = OpContext::background().with_value("shared", "from-a");
        let b = OpContext::background()
            .with_value("shared", "from-b")
            .with_value("only-b", "yes");
        let coalesced = CoalescingContext::new(&a);
        coalesced.add_context(&b).unwrap();
        assert_eq!(coalesced.value("shared").as_deref(), Some("from-a"));
        assert_eq!(coalesced.value("only-b").as_deref(), Some("yes"));
        assert_eq!(coalesced.value("missing"), None);
    }
}
