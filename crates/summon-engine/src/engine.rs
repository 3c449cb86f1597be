//! The reconcile engine: a top kind bound to an ordered component list

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::controller::Action;
use kube::runtime::watcher::{self, Event};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Client, Resource};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use summon_common::clock::{SharedClock, SystemClock};
use summon_common::template::TemplateRenderer;
use summon_common::{flag_set, Error, Result, SKIP_RECONCILE_ANNOTATION};

use crate::client::{api_resource, from_dynamic, ClusterClient};
use crate::component::{Component, ReconcileResult, StatusModifier};
use crate::context::ComponentContext;
use crate::status::StatusWriter;
use crate::top::{ObjectKey, TopObject};

/// Delay used when a tick asked to be requeued without a duration
pub const PROMPT_REQUEUE: Duration = Duration::from_secs(2);

/// Delay before retrying a tick that failed with a transient error
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Delay before retrying a tick whose failure needs an outside fix,
/// such as an RBAC grant or an admission webhook change
pub const SLOW_ERROR_REQUEUE: Duration = Duration::from_secs(300);

/// Binds a top kind, its templates and an ordered component list
pub struct Engine<T: TopObject> {
    name: String,
    client: Arc<dyn ClusterClient>,
    renderer: Arc<TemplateRenderer>,
    clock: SharedClock,
    components: Vec<Arc<dyn Component<T>>>,
    enable_finalizers: bool,
    create_delete_only: bool,
}

/// Builder for [`Engine`]
pub struct EngineBuilder<T: TopObject> {
    engine: Engine<T>,
}

impl<T: TopObject> EngineBuilder<T> {
    /// Bundled templates components render from
    pub fn templates(mut self, renderer: Arc<TemplateRenderer>) -> Self {
        self.engine.renderer = renderer;
        self
    }

    /// Append a component; declaration order is dispatch order
    pub fn component(mut self, component: impl Component<T> + 'static) -> Self {
        self.engine.components.push(Arc::new(component));
        self
    }

    /// Time source
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.engine.clock = clock;
        self
    }

    /// Let components manage finalizers
    pub fn finalizers(mut self, enabled: bool) -> Self {
        self.engine.enable_finalizers = enabled;
        self
    }

    /// Only react to tops appearing or disappearing, never to updates
    pub fn create_delete_only(mut self) -> Self {
        self.engine.create_delete_only = true;
        self
    }

    /// Finish
    pub fn build(self) -> Engine<T> {
        self.engine
    }
}

impl<T: TopObject> Engine<T> {
    /// Start building an engine called `name`
    pub fn builder(name: impl Into<String>, client: Arc<dyn ClusterClient>) -> EngineBuilder<T> {
        EngineBuilder {
            engine: Engine {
                name: name.into(),
                client,
                renderer: Arc::new(TemplateRenderer::empty()),
                clock: Arc::new(SystemClock),
                components: Vec::new(),
                enable_finalizers: false,
                create_delete_only: false,
            },
        }
    }

    /// Engine name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Component names in dispatch order
    pub fn component_names(&self) -> Vec<&'static str> {
        self.components.iter().map(|c| c.name()).collect()
    }

    /// One tick for `key`.
    ///
    /// Components run in declared order after an up-front readiness filter.
    /// The first failure stops dispatch, is fanned out to every error
    /// handler and marked on the top's status. Status is written only when
    /// it differs from what was read at the start, and never after
    /// cancellation.
    #[instrument(skip(self, key, cancel), fields(engine = %self.name, key = %key))]
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: CancellationToken,
    ) -> Result<ReconcileResult<T>> {
        let ar = api_resource::<T>();
        let Some(obj) = self.client.get(&ar, &key.namespace, &key.name).await? else {
            debug!("top object gone, nothing to do");
            return Ok(ReconcileResult::done());
        };
        self.reconcile_object(from_dynamic(obj)?, cancel).await
    }

    /// One tick over an already fetched top, which may no longer exist in
    /// the cluster
    pub async fn reconcile_object(
        &self,
        top: T,
        cancel: CancellationToken,
    ) -> Result<ReconcileResult<T>> {
        let baseline = top.clone();

        if flag_set(top.meta().annotations.as_ref(), SKIP_RECONCILE_ANNOTATION) {
            info!("skip-reconcile annotation set, skipping");
            return Ok(ReconcileResult::done());
        }

        let mut ctx = ComponentContext::new(
            top,
            self.client.clone(),
            self.renderer.clone(),
            self.clock.clone(),
            cancel.clone(),
        )
        .with_finalizers(self.enable_finalizers);

        let ready: Vec<Arc<dyn Component<T>>> = self
            .components
            .iter()
            .filter(|c| c.is_reconcilable(&ctx))
            .cloned()
            .collect();

        let mut aggregate = ReconcileResult::done();
        let mut modifiers: Vec<StatusModifier<T>> = Vec::new();
        let mut failure: Option<Error> = None;

        for component in &ready {
            let outcome = match component.reconcile(&mut ctx).await {
                Ok(result) => absorb(&mut ctx, &mut aggregate, &mut modifiers, result),
                Err(e) => Err(e),
            };
            if let Err(err) = outcome {
                warn!(component = component.name(), error = %err, "component failed");
                self.fan_out_error(&mut ctx, &err, &mut aggregate, &mut modifiers)
                    .await;
                failure = Some(err);
                break;
            }
        }

        let error_message = failure.as_ref().map(|e| e.to_string());
        if T::HAS_STATUS {
            if let Some(message) = &error_message {
                ctx.top.set_error_status(message);
            }
            if cancel.is_cancelled() {
                debug!("tick cancelled, skipping status write");
            } else if ctx.top.top_status() != baseline.top_status() {
                let writer =
                    StatusWriter::new(&self.client, &modifiers, error_message.as_deref());
                if let Err(e) = writer.write(&ctx.top).await {
                    if failure.is_none() {
                        return Err(e);
                    }
                    error!(error = %e, "status write failed after component error");
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(aggregate),
        }
    }

    async fn fan_out_error(
        &self,
        ctx: &mut ComponentContext<T>,
        err: &Error,
        aggregate: &mut ReconcileResult<T>,
        modifiers: &mut Vec<StatusModifier<T>>,
    ) {
        for component in &self.components {
            let Some(handler) = component.error_handler() else {
                continue;
            };
            let outcome = match handler.reconcile_error(ctx, err).await {
                Ok(result) => absorb(ctx, aggregate, modifiers, result),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!(component = component.name(), error = %e, "error handler failed");
            }
        }
    }

    /// Run as a kube-runtime controller until shutdown.
    ///
    /// Keys received on `triggers` are reconciled as if their top changed.
    pub async fn run(
        self: Arc<Self>,
        client: Client,
        triggers: Option<mpsc::Receiver<ObjectKey>>,
        shutdown: CancellationToken,
    ) {
        if self.create_delete_only {
            self.run_create_delete_only(client, shutdown).await;
            return;
        }

        let tops: Api<T> = Api::all(client.clone());
        let mut controller = Controller::new(tops, watcher::Config::default());

        let mut owned: HashSet<(String, String)> = HashSet::new();
        for (idx, component) in self.components.iter().enumerate() {
            for ar in component.watch_types() {
                let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
                if component.watch_mapper().is_some() {
                    let store = controller.store();
                    let engine = self.clone();
                    controller = controller.watches_with(
                        api,
                        ar.clone(),
                        watcher::Config::default(),
                        move |obj: DynamicObject| {
                            let tops = store.state();
                            engine.components[idx]
                                .watch_mapper()
                                .map(|m| m.map(&obj, &tops))
                                .unwrap_or_default()
                                .into_iter()
                                .map(|key| key.to_object_ref::<T>())
                        },
                    );
                } else if owned.insert(kind_key(&ar)) {
                    controller = controller.owns_with(api, ar.clone(), watcher::Config::default());
                }
            }
        }

        if let Some(rx) = triggers {
            controller = controller
                .reconcile_on(ReceiverStream::new(rx).map(|key| key.to_object_ref::<T>()));
        }

        info!(engine = %self.name, components = self.components.len(), "starting controller");
        let name = self.name.clone();
        let stop = shutdown.clone().cancelled_owned();
        let ctx = Arc::new(ControllerContext {
            engine: self,
            shutdown,
        });
        controller
            .shutdown_on_signal()
            .graceful_shutdown_on(stop)
            .run(reconcile_top::<T>, error_policy::<T>, ctx)
            .for_each(|result| {
                let name = name.clone();
                async move {
                    match result {
                        Ok((obj, action)) => {
                            debug!(engine = %name, object = %obj.name, ?action, "reconciliation completed");
                        }
                        Err(e) => {
                            debug!(engine = %name, error = %e, "reconciliation error");
                        }
                    }
                }
            })
            .await;
        info!(engine = %name, "controller stopped");
    }

    async fn run_create_delete_only(self: Arc<Self>, client: Client, shutdown: CancellationToken) {
        let api: Api<T> = Api::all(client);
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        let mut stream = std::pin::pin!(stream);
        let mut seen: HashSet<ObjectKey> = HashSet::new();
        info!(engine = %self.name, "starting create/delete watcher");

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = stream.try_next() => event,
            };
            let trigger = match event {
                Ok(Some(Event::Apply(obj))) => {
                    let key = ObjectKey::of(&obj);
                    seen.insert(key.clone()).then_some(key)
                }
                Ok(Some(Event::Delete(obj))) => {
                    let key = ObjectKey::of(&obj);
                    seen.remove(&key);
                    // the deleted object's last state drives the tick, so the
                    // removal is seen even when nothing else is left
                    if let Err(e) = self.reconcile_object(obj, shutdown.child_token()).await {
                        warn!(engine = %self.name, key = %key, error = %e, "reconciliation failed");
                    }
                    None
                }
                Ok(Some(Event::Init)) => {
                    seen.clear();
                    None
                }
                Ok(Some(Event::InitApply(obj))) => {
                    seen.insert(ObjectKey::of(&obj));
                    None
                }
                Ok(Some(Event::InitDone)) => seen.iter().next().cloned(),
                Ok(None) => break,
                Err(e) => {
                    warn!(engine = %self.name, error = %e, "watch error");
                    None
                }
            };
            if let Some(key) = trigger {
                if let Err(e) = self.reconcile(&key, shutdown.child_token()).await {
                    warn!(engine = %self.name, key = %key, error = %e, "reconciliation failed");
                }
            }
        }
        info!(engine = %self.name, "create/delete watcher stopped");
    }
}

fn absorb<T: TopObject>(
    ctx: &mut ComponentContext<T>,
    aggregate: &mut ReconcileResult<T>,
    modifiers: &mut Vec<StatusModifier<T>>,
    result: ReconcileResult<T>,
) -> Result<()> {
    aggregate.merge(&result);
    if let Some(modifier) = result.status_modifier {
        modifier(&mut ctx.top)?;
        modifiers.push(modifier);
    }
    Ok(())
}

fn kind_key(ar: &ApiResource) -> (String, String) {
    (ar.group.clone(), ar.kind.clone())
}

struct ControllerContext<T: TopObject> {
    engine: Arc<Engine<T>>,
    shutdown: CancellationToken,
}

async fn reconcile_top<T: TopObject>(obj: Arc<T>, ctx: Arc<ControllerContext<T>>) -> Result<Action> {
    let key = ObjectKey::of(obj.as_ref());
    let result = ctx
        .engine
        .reconcile(&key, ctx.shutdown.child_token())
        .await?;
    Ok(to_action(&result))
}

fn error_policy<T: TopObject>(obj: Arc<T>, error: &Error, ctx: Arc<ControllerContext<T>>) -> Action {
    error!(
        engine = %ctx.engine.name,
        key = %ObjectKey::of(obj.as_ref()),
        error = %error,
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    error_action(error)
}

/// Controller action after a failed tick.
///
/// Only an invalid spec waits for the object to change; everything else
/// is retried, slowly when the error is not transient.
pub fn error_action(error: &Error) -> Action {
    match error {
        Error::Validation { .. } => Action::await_change(),
        e if e.is_retryable() => Action::requeue(ERROR_REQUEUE),
        _ => Action::requeue(SLOW_ERROR_REQUEUE),
    }
}

/// Controller action for a tick's aggregate result
pub fn to_action<T>(result: &ReconcileResult<T>) -> Action {
    match (result.requeue_after, result.requeue) {
        (Some(after), true) => Action::requeue(after.min(PROMPT_REQUEUE)),
        (Some(after), false) => Action::requeue(after),
        (None, true) => Action::requeue(PROMPT_REQUEUE),
        (None, false) => Action::await_change(),
    }
}
