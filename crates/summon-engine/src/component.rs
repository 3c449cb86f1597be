//! The component contract and per-component reconcile results

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject};

use summon_common::{Error, Result};

use crate::context::ComponentContext;
use crate::top::{ObjectKey, TopObject};

/// Deferred, replayable mutation of the top object's status
pub type StatusModifier<T> = Arc<dyn Fn(&mut T) -> Result<()> + Send + Sync>;

/// Outcome of one component step
pub struct ReconcileResult<T> {
    /// Re-enqueue promptly
    pub requeue: bool,
    /// Re-enqueue no sooner than this
    pub requeue_after: Option<Duration>,
    /// Status change to apply now and replay on conflict
    pub status_modifier: Option<StatusModifier<T>>,
}

impl<T> Default for ReconcileResult<T> {
    fn default() -> Self {
        Self {
            requeue: false,
            requeue_after: None,
            status_modifier: None,
        }
    }
}

impl<T> Clone for ReconcileResult<T> {
    fn clone(&self) -> Self {
        Self {
            requeue: self.requeue,
            requeue_after: self.requeue_after,
            status_modifier: self.status_modifier.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ReconcileResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileResult")
            .field("requeue", &self.requeue)
            .field("requeue_after", &self.requeue_after)
            .field("status_modifier", &self.status_modifier.is_some())
            .finish()
    }
}

impl<T> ReconcileResult<T> {
    /// Nothing further to do
    pub fn done() -> Self {
        Self::default()
    }

    /// Come back promptly
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            ..Self::default()
        }
    }

    /// Come back after `after`
    pub fn requeue_after(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
            ..Self::default()
        }
    }

    /// Only a status change
    pub fn modify(f: impl Fn(&mut T) -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            status_modifier: Some(Arc::new(f)),
            ..Self::default()
        }
    }

    /// Attach a status change
    pub fn with_modifier(mut self, f: impl Fn(&mut T) -> Result<()> + Send + Sync + 'static) -> Self {
        self.status_modifier = Some(Arc::new(f));
        self
    }

    /// Fold another result in: OR for `requeue`, smallest positive
    /// `requeue_after`. Modifiers are collected by the engine, not here.
    pub fn merge(&mut self, other: &ReconcileResult<T>) {
        self.requeue |= other.requeue;
        self.requeue_after = match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) if !b.is_zero() => Some(if a.is_zero() { b } else { a.min(b) }),
            (None, Some(b)) if !b.is_zero() => Some(b),
            (current, _) => current,
        };
    }
}

/// Computes which tops to wake for a change to an object they reference
/// without owning it
pub trait WatchMapper<T>: Send + Sync {
    /// `tops` is the engine's current view of every top object
    fn map(&self, obj: &DynamicObject, tops: &[Arc<T>]) -> Vec<ObjectKey>;
}

/// Reacts to a sibling component's failure
#[async_trait]
pub trait ReconcileErrorHandler<T: TopObject>: Send + Sync {
    /// Called once per failing tick, in component order
    async fn reconcile_error(
        &self,
        ctx: &mut ComponentContext<T>,
        err: &Error,
    ) -> Result<ReconcileResult<T>>;
}

/// One pluggable convergence step for a top kind
#[async_trait]
pub trait Component<T: TopObject>: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Kinds whose changes must wake the owning top
    fn watch_types(&self) -> Vec<ApiResource> {
        Vec::new()
    }

    /// Mapper for watches whose relation to the top is not ownership
    fn watch_mapper(&self) -> Option<&dyn WatchMapper<T>> {
        None
    }

    /// Handler invoked when any component of the tick fails
    fn error_handler(&self) -> Option<&dyn ReconcileErrorHandler<T>> {
        None
    }

    /// Gate; must not have side effects
    fn is_reconcilable(&self, ctx: &ComponentContext<T>) -> bool;

    /// One convergence step
    async fn reconcile(&self, ctx: &mut ComponentContext<T>) -> Result<ReconcileResult<T>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn after(secs: u64) -> Option<Duration> {
        Some(Duration::from_secs(secs))
    }

    #[rstest]
    #[case(None, None, None)]
    #[case(None, after(5), after(5))]
    #[case(after(5), None, after(5))]
    #[case(after(5), after(3), after(3))]
    #[case(after(3), after(5), after(3))]
    #[case(after(3), Some(Duration::ZERO), after(3))]
    #[case(Some(Duration::ZERO), after(7), after(7))]
    fn requeue_after_takes_smallest_positive(
        #[case] a: Option<Duration>,
        #[case] b: Option<Duration>,
        #[case] expected: Option<Duration>,
    ) {
        let mut acc = ReconcileResult::<()> {
            requeue_after: a,
            ..Default::default()
        };
        acc.merge(&ReconcileResult {
            requeue_after: b,
            ..Default::default()
        });
        assert_eq!(acc.requeue_after, expected);
    }

    #[test]
    fn requeue_is_ored() {
        let mut acc = ReconcileResult::<()>::done();
        acc.merge(&ReconcileResult::requeue());
        acc.merge(&ReconcileResult::done());
        assert!(acc.requeue);
    }
}
