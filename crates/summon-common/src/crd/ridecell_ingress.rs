//! RidecellIngress CRD: an Ingress whose short hostnames are expanded

use k8s_openapi::api::networking::v1::{IngressBackend, IngressRule, IngressSpec, IngressTLS};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ChildPhase;

/// Ingress wrapper. Hostnames without a dot are expanded using the
/// `ridecell.io/environment`, `ridecell.io/region` and `ridecell.io/cloud`
/// labels before the child Ingress is converged.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "helpers.ridecell.io",
    version = "v1beta1",
    kind = "RidecellIngress",
    namespaced,
    status = "RidecellIngressStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RidecellIngressSpec {
    /// Ingress class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
    /// Backend for requests matching no rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<IngressBackend>,
    /// Host rules; hosts may be short
    #[serde(default)]
    pub rules: Vec<IngressRule>,
    /// TLS blocks; hosts may be short
    #[serde(default)]
    pub tls: Vec<IngressTLS>,
}

impl RidecellIngressSpec {
    /// Plain Ingress spec carrying the same fields
    pub fn to_ingress_spec(&self) -> IngressSpec {
        IngressSpec {
            ingress_class_name: self.ingress_class_name.clone(),
            default_backend: self.default_backend.clone(),
            rules: Some(self.rules.clone()),
            tls: Some(self.tls.clone()),
        }
    }
}

/// RidecellIngress status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RidecellIngressStatus {
    #[serde(default)]
    pub status: ChildPhase,
    #[serde(default)]
    pub message: String,
}
