//! Commit-gated side effects.
//!
//! A [`UnitOfWork`] is handed explicitly to whoever needs to defer work until
//! it commits. [`DeferredCommitQueue::run_after_commit`] attaches the work to
//! an active unit-of-work, or runs it on the spot when there is none.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;

use crate::error::SyncError;

/// Work to run once a unit-of-work commits.
pub type DeferredAction = BoxFuture<'static, Result<(), SyncError>>;

/// An attached action, already wrapped so it can neither fail nor panic.
pub type CommitHook = BoxFuture<'static, ()>;

/// A bounded sequence of mutations that either fully commits or fully aborts.
pub trait UnitOfWork: Send + Sync {
    fn is_active(&self) -> bool;

    /// Attach a hook to run after commit. Returns the hook back if the
    /// unit-of-work is no longer accepting hooks.
    fn on_commit(&self, hook: CommitHook) -> Result<(), CommitHook>;
}

/// How [`DeferredCommitQueue::run_after_commit`] disposed of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    /// Attached to the unit-of-work; runs after commit or never.
    Attached,
    /// Ran to completion before the call returned.
    RanInline,
}

#[derive(Debug, Default)]
struct QueueCounters {
    deferred: AtomicU64,
    inline: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of queue activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub deferred: u64,
    pub inline: u64,
    pub failed: u64,
}

/// Runs actions after the enclosing unit-of-work commits, isolating failures.
#[derive(Clone, Default)]
pub struct DeferredCommitQueue {
    counters: Arc<QueueCounters>,
}

impl DeferredCommitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `action` to `unit_of_work` if it is active, otherwise run it now.
    ///
    /// The action's error or panic is logged under `label` and never reaches
    /// the caller.
    pub async fn run_after_commit(
        &self,
        unit_of_work: Option<&dyn UnitOfWork>,
        label: &'static str,
        action: DeferredAction,
    ) -> Deferral {
        let hook = self.isolate(label, action);

        let hook = match unit_of_work {
            Some(uow) if uow.is_active() => match uow.on_commit(hook) {
                Ok(()) => {
                    self.counters.deferred.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(action = label, "deferred until commit");
                    return Deferral::Attached;
                }
                // Finished between the check and the attach.
                Err(hook) => hook,
            },
            _ => hook,
        };

        self.counters.inline.fetch_add(1, Ordering::Relaxed);
        hook.await;
        Deferral::RanInline
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            inline: self.counters.inline.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn isolate(&self, label: &'static str, action: DeferredAction) -> CommitHook {
        let counters = self.counters.clone();
        async move {
            match AssertUnwindSafe(action).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(action = label, %err, "deferred action failed");
                }
                Err(_) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(action = label, "deferred action panicked");
                }
            }
        }
        .boxed()
    }
}

enum ScopeState {
    Active(Vec<CommitHook>),
    Committed,
    Aborted,
}

/// In-process unit-of-work: collects hooks while active, runs them in
/// registration order on [`commit`](Self::commit), drops them on abort.
///
/// Dropping an active scope counts as an abort.
pub struct CommitScope {
    state: Mutex<ScopeState>,
}

impl Default for CommitScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitScope {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScopeState::Active(Vec::new())),
        }
    }

    /// Number of hooks waiting for commit.
    pub fn pending(&self) -> usize {
        match &*self.state.lock() {
            ScopeState::Active(hooks) => hooks.len(),
            _ => 0,
        }
    }

    /// Mark the scope committed and run every attached hook in order.
    /// Committing twice, or after an abort, does nothing.
    pub async fn commit(&self) {
        let hooks = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ScopeState::Committed) {
                ScopeState::Active(hooks) => hooks,
                other => {
                    *state = other;
                    return;
                }
            }
        };

        for hook in hooks {
            hook.await;
        }
    }

    /// Discard every attached hook without running it.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        let discarded = match &*state {
            ScopeState::Active(hooks) => hooks.len(),
            _ => return,
        };
        *state = ScopeState::Aborted;
        if discarded > 0 {
            tracing::debug!(discarded, "unit of work aborted");
        }
    }
}

impl UnitOfWork for CommitScope {
    fn is_active(&self) -> bool {
        matches!(&*self.state.lock(), ScopeState::Active(_))
    }

    fn on_commit(&self, hook: CommitHook) -> Result<(), CommitHook> {
        match &mut *self.state.lock() {
            ScopeState::Active(hooks) => {
                hooks.push(hook);
                Ok(())
            }
            _ => Err(hook),
        }
    }
}

impl Drop for CommitScope {
    fn drop(&mut self) {
        if let ScopeState::Active(hooks) = &*self.state.get_mut() {
            if !hooks.is_empty() {
                tracing::warn!(
                    discarded = hooks.len(),
                    "unit of work dropped without commit"
                );
            }
        }
    }
}
