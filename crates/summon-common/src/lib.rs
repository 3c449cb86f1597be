//! Common types for the summon operator: CRDs, errors, templates, configuration

#![deny(missing_docs)]

pub mod clock;
pub mod config;
#[allow(missing_docs)]
pub mod crd;
pub mod error;
pub mod hash;
pub mod telemetry;
pub mod template;

pub use error::Error;

#[doc(hidden)]
pub use serde_json as __serde_json;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation on a top object that turns every reconcile into a no-op
pub const SKIP_RECONCILE_ANNOTATION: &str = "ridecell.io/skip-reconcile";

/// Annotation on a child object that elides external teardown
pub const SKIP_FINALIZER_ANNOTATION: &str = "ridecell.io/skip-finalizer";

/// Label carrying the deployment environment (dev, qa, uat, prod)
pub const ENVIRONMENT_LABEL: &str = "ridecell.io/environment";

/// Label carrying the cloud region
pub const REGION_LABEL: &str = "ridecell.io/region";

/// Label carrying the cloud provider, when not the default one
pub const CLOUD_LABEL: &str = "ridecell.io/cloud";

/// Field manager and user name reported to external systems
pub const OPERATOR_NAME: &str = "ridecell-operator";

/// Whether an annotation or label map holds `key == "true"`
pub fn flag_set(map: Option<&std::collections::BTreeMap<String, String>>, key: &str) -> bool {
    map.and_then(|m| m.get(key))
        .map(|v| v == "true")
        .unwrap_or(false)
}
