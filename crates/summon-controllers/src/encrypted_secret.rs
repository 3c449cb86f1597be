//! EncryptedSecret: KMS-encrypted values decrypted into a plain Secret
//!
//! Two value formats are accepted:
//!
//! - a base64 KMS ciphertext, decrypted directly;
//! - `kmsv2:<data key>:<payload>`, where the data key is a base64 KMS
//!   ciphertext of a 32-byte secretbox key and the payload is the base64 of a
//!   24-byte nonce followed by the sealed box.
//!
//! Data keys are decrypted once per reconcile no matter how many values use
//! them. [`EMPTY_SENTINEL`] decodes to an empty value without touching KMS.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_kms::primitives::Blob;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::core::ApiResource;
use summon_common::crd::{ChildPhase, EncryptedSecret};
use summon_common::{Error, Result};
use summon_engine::{
    api_resource, copy_desired, ClusterClient, Component, ComponentContext, Engine, ReconcileResult,
};
use tracing::debug;

/// Value that decrypts to the empty string
pub const EMPTY_SENTINEL: &str = "__empty__";

const ENVELOPE_PREFIX: &str = "kmsv2:";
const NONCE_LEN: usize = 24;

/// Decrypts KMS ciphertexts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KmsDecrypter: Send + Sync {
    /// Plaintext of `ciphertext`
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// [`KmsDecrypter`] backed by AWS KMS
pub struct AwsKms {
    client: aws_sdk_kms::Client,
}

impl AwsKms {
    /// Client built from a loaded SDK config
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_kms::Client::new(config),
        }
    }
}

#[async_trait]
impl KmsDecrypter for AwsKms {
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let output = self
            .client
            .decrypt()
            .ciphertext_blob(Blob::new(ciphertext.to_vec()))
            .send()
            .await
            .map_err(|e| Error::internal_with_context("kms", e.into_service_error().to_string()))?;
        output
            .plaintext()
            .map(|p| p.as_ref().to_vec())
            .ok_or_else(|| Error::crypto("kms returned no plaintext"))
    }
}

fn decode(value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| Error::crypto(format!("invalid base64: {e}")))
}

/// Per-reconcile decryption state
struct Decryptor<'a> {
    kms: &'a dyn KmsDecrypter,
    data_keys: HashMap<String, Vec<u8>>,
}

impl<'a> Decryptor<'a> {
    fn new(kms: &'a dyn KmsDecrypter) -> Self {
        Self {
            kms,
            data_keys: HashMap::new(),
        }
    }

    async fn decrypt_value(&mut self, value: &str) -> Result<Vec<u8>> {
        if value == EMPTY_SENTINEL {
            return Ok(Vec::new());
        }
        match value.strip_prefix(ENVELOPE_PREFIX) {
            Some(envelope) => self.open_envelope(envelope).await,
            None => self.kms.decrypt(&decode(value)?).await,
        }
    }

    async fn open_envelope(&mut self, envelope: &str) -> Result<Vec<u8>> {
        let (wrapped_key, payload) = envelope
            .split_once(':')
            .ok_or_else(|| Error::crypto("envelope must be kmsv2:<key>:<payload>"))?;
        let key = self.data_key(wrapped_key).await?;
        let payload = decode(payload)?;
        if payload.len() < NONCE_LEN {
            return Err(Error::crypto("payload shorter than its nonce"));
        }
        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        let cipher = XSalsa20Poly1305::new_from_slice(&key)
            .map_err(|_| Error::crypto(format!("data key is {} bytes, want 32", key.len())))?;
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::crypto("secretbox authentication failed"))
    }

    async fn data_key(&mut self, wrapped: &str) -> Result<Vec<u8>> {
        if let Some(key) = self.data_keys.get(wrapped) {
            return Ok(key.clone());
        }
        let key = self.kms.decrypt(&decode(wrapped)?).await?;
        self.data_keys.insert(wrapped.to_string(), key.clone());
        Ok(key)
    }
}

/// Writes the decrypted Secret
pub struct DecryptSecret {
    kms: Arc<dyn KmsDecrypter>,
}

impl DecryptSecret {
    /// Component decrypting through `kms`
    pub fn new(kms: Arc<dyn KmsDecrypter>) -> Self {
        Self { kms }
    }
}

#[async_trait]
impl Component<EncryptedSecret> for DecryptSecret {
    fn name(&self) -> &'static str {
        "decrypt"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<Secret>()]
    }

    fn is_reconcilable(&self, _ctx: &ComponentContext<EncryptedSecret>) -> bool {
        true
    }

    async fn reconcile(
        &self,
        ctx: &mut ComponentContext<EncryptedSecret>,
    ) -> Result<ReconcileResult<EncryptedSecret>> {
        let mut decryptor = Decryptor::new(self.kms.as_ref());
        let mut data = BTreeMap::new();
        for (key, value) in &ctx.top.spec.data {
            let plain = ctx
                .guard(decryptor.decrypt_value(value))
                .await
                .map_err(|e| match e {
                    Error::Crypto { message } => Error::crypto(format!("{key}: {message}")),
                    other => other,
                })?;
            data.insert(key.clone(), ByteString(plain));
        }
        debug!(
            secret = %ctx.name(),
            values = data.len(),
            data_keys = decryptor.data_keys.len(),
            "decrypted values"
        );

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(ctx.name()),
                namespace: Some(ctx.namespace()),
                labels: ctx.top.metadata.labels.clone(),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        ctx.converge(secret, copy_desired).await?;

        Ok(ReconcileResult::modify(|top: &mut EncryptedSecret| {
            let status = top.status.get_or_insert_with(Default::default);
            status.status = ChildPhase::Ready;
            status.message = String::new();
            Ok(())
        }))
    }
}

/// EncryptedSecret engine
pub fn engine(client: Arc<dyn ClusterClient>, kms: Arc<dyn KmsDecrypter>) -> Engine<EncryptedSecret> {
    Engine::builder("encryptedsecret", client)
        .component(DecryptSecret::new(kms))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use summon_common::crd::EncryptedSecretSpec;
    use summon_engine::testing::MemoryCluster;
    use summon_engine::ObjectKey;
    use tokio_util::sync::CancellationToken;

    const DATA_KEY: [u8; 32] = [7u8; 32];

    fn seal(plaintext: &[u8], nonce_byte: u8) -> String {
        let cipher = XSalsa20Poly1305::new_from_slice(&DATA_KEY).unwrap();
        let nonce = [nonce_byte; NONCE_LEN];
        let mut payload = nonce.to_vec();
        payload.extend(cipher.encrypt(Nonce::from_slice(&nonce), plaintext).unwrap());
        format!(
            "kmsv2:{}:{}",
            STANDARD.encode(b"wrapped-key"),
            STANDARD.encode(payload)
        )
    }

    fn encrypted(data: &[(&str, String)]) -> EncryptedSecret {
        let mut es = EncryptedSecret::new(
            "foo-secrets",
            EncryptedSecretSpec {
                data: data.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            },
        );
        es.metadata.namespace = Some("summon-dev".into());
        es
    }

    async fn reconcile(cluster: &Arc<MemoryCluster>, kms: MockKmsDecrypter) -> Result<()> {
        engine(cluster.clone(), Arc::new(kms))
            .reconcile(&ObjectKey::new("summon-dev", "foo-secrets"), CancellationToken::new())
            .await
            .map(|_| ())
    }

    fn plaintexts(cluster: &MemoryCluster) -> BTreeMap<String, String> {
        let secret: Secret = cluster.fetch("summon-dev", "foo-secrets").unwrap();
        secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8(v.0).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn direct_ciphertext_is_decrypted_into_owned_secret() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert(&encrypted(&[("DB_PASSWORD", STANDARD.encode(b"cipher-a"))]));

        let mut kms = MockKmsDecrypter::new();
        kms.expect_decrypt()
            .withf(|c| c == b"cipher-a")
            .times(1)
            .returning(|_| Ok(b"hunter2".to_vec()));
        reconcile(&cluster, kms).await.unwrap();

        assert_eq!(plaintexts(&cluster)["DB_PASSWORD"], "hunter2");
        let secret: Secret = cluster.fetch("summon-dev", "foo-secrets").unwrap();
        let owner = &secret.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "EncryptedSecret");
        assert_eq!(owner.controller, Some(true));

        let es: EncryptedSecret = cluster.fetch("summon-dev", "foo-secrets").unwrap();
        assert_eq!(es.status.unwrap().status, ChildPhase::Ready);
    }

    #[tokio::test]
    async fn shared_data_key_is_decrypted_once() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert(&encrypted(&[
            ("A", seal(b"alpha", 1)),
            ("B", seal(b"bravo", 2)),
            ("C", seal(b"charlie", 3)),
        ]));

        let mut kms = MockKmsDecrypter::new();
        kms.expect_decrypt()
            .withf(|c| c == b"wrapped-key")
            .times(1)
            .returning(|_| Ok(DATA_KEY.to_vec()));
        reconcile(&cluster, kms).await.unwrap();

        let values = plaintexts(&cluster);
        assert_eq!(values["A"], "alpha");
        assert_eq!(values["B"], "bravo");
        assert_eq!(values["C"], "charlie");
    }

    #[tokio::test]
    async fn sentinel_decodes_to_empty_without_kms() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert(&encrypted(&[("OPTIONAL", EMPTY_SENTINEL.to_string())]));

        reconcile(&cluster, MockKmsDecrypter::new()).await.unwrap();

        assert_eq!(plaintexts(&cluster)["OPTIONAL"], "");
    }

    #[tokio::test]
    async fn tampered_payload_marks_error() {
        let cluster = Arc::new(MemoryCluster::new());
        let mut value = seal(b"alpha", 1);
        value.truncate(value.len() - 4);
        value.push_str("AAAA");
        cluster.insert(&encrypted(&[("A", value)]));

        let mut kms = MockKmsDecrypter::new();
        kms.expect_decrypt().returning(|_| Ok(DATA_KEY.to_vec()));
        let err = reconcile(&cluster, kms).await.unwrap_err();
        assert!(matches!(err, Error::Crypto { .. }));

        let es: EncryptedSecret = cluster.fetch("summon-dev", "foo-secrets").unwrap();
        let status = es.status.unwrap();
        assert_eq!(status.status, ChildPhase::Error);
        assert!(status.message.starts_with("crypto error: A:"));
        assert!(cluster.fetch::<Secret>("summon-dev", "foo-secrets").is_none());
    }

    #[tokio::test]
    async fn short_data_key_is_rejected() {
        let mut kms = MockKmsDecrypter::new();
        kms.expect_decrypt().returning(|_| Ok(vec![1, 2, 3]));
        let mut decryptor = Decryptor::new(&kms);
        let err = decryptor.decrypt_value(&seal(b"x", 1)).await.unwrap_err();
        assert!(err.to_string().contains("data key is 3 bytes"));
    }
}
