//! Component-based reconcile engine
//!
//! An [`Engine`] binds one top kind to an ordered list of [`Component`]s.
//! Each tick fetches the top, filters components through their readiness
//! gates, dispatches them in order, merges their [`ReconcileResult`]s and
//! writes the top's status back with conflict replay.

#![deny(missing_docs)]

pub mod client;
pub mod component;
pub mod context;
pub mod engine;
pub mod status;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod top;

pub use client::{api_resource, from_dynamic, to_dynamic, ClusterClient, KubeClusterClient};
pub use component::{Component, ReconcileErrorHandler, ReconcileResult, StatusModifier, WatchMapper};
pub use context::{copy_desired, ChildObject, ComponentContext, Converged};
pub use engine::{Engine, EngineBuilder};
pub use top::{ObjectKey, TopObject};
