//! EncryptedSecret CRD: KMS-encrypted values decrypted into a Secret

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ChildPhase;

/// Values encrypted with the cloud key-management service.
///
/// Each value is either a raw KMS ciphertext (base64) or a
/// `kmsv2:<data key>:<payload>` envelope. The controller writes a Secret of
/// the same name holding the plaintexts.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "secrets.ridecell.io",
    version = "v1beta1",
    kind = "EncryptedSecret",
    namespaced,
    status = "EncryptedSecretStatus",
    shortname = "encsecret"
)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedSecretSpec {
    /// Ciphertexts keyed by secret key
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// EncryptedSecret status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedSecretStatus {
    #[serde(default)]
    pub status: ChildPhase,
    #[serde(default)]
    pub message: String,
}
