use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use summon_common::crd::{PlatformPhase, SummonPlatform};
use summon_common::Error;
use summon_engine::{Component, ReconcileErrorHandler, ReconcileResult};
use tracing::debug;

use super::{Ctx, Outcome};
use crate::notification::NotificationEngine;

const SINK_RETRY: Duration = Duration::from_secs(30);

/// Announces deploys once `Ready` and failures once `Error`.
///
/// Also registered as an error handler so a failing sibling is announced in
/// the same tick it fails.
pub struct Notification {
    engine: Arc<NotificationEngine>,
}

impl Notification {
    /// Deliver through `engine`
    pub fn new(engine: Arc<NotificationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Component<SummonPlatform> for Notification {
    fn name(&self) -> &'static str {
        "notification"
    }

    fn error_handler(&self) -> Option<&dyn ReconcileErrorHandler<SummonPlatform>> {
        Some(self)
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        match ctx.top.phase() {
            PlatformPhase::Ready => {
                let delivery = ctx.guard(self.engine.notify_success(&ctx.top)).await?;
                let mut result = if delivery.incomplete {
                    ReconcileResult::requeue_after(SINK_RETRY)
                } else {
                    ReconcileResult::done()
                };
                if !delivery.is_empty() {
                    result = result.with_modifier(move |top: &mut SummonPlatform| {
                        delivery.apply(&mut top.status_mut().notification);
                        Ok(())
                    });
                }
                Ok(result)
            }
            PlatformPhase::Error => {
                let message = ctx.top.status_or_default().message;
                ctx.guard(self.engine.notify_error(&ctx.top, &message)).await?;
                Ok(ReconcileResult::done())
            }
            _ => Ok(ReconcileResult::done()),
        }
    }
}

#[async_trait]
impl ReconcileErrorHandler<SummonPlatform> for Notification {
    async fn reconcile_error(&self, ctx: &mut Ctx, err: &Error) -> Outcome {
        if !err.should_notify() {
            debug!(instance = %ctx.name(), error = %err, "error not notifiable");
            return Ok(ReconcileResult::done());
        }
        let message = err.to_string();
        ctx.guard(self.engine.notify_error(&ctx.top, &message)).await?;
        Ok(ReconcileResult::done())
    }
}
