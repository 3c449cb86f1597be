//! Status write-back with modifier replay

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, warn};

use summon_common::{Error, Result};

use crate::client::{api_resource, from_dynamic, to_dynamic, ClusterClient};
use crate::component::StatusModifier;
use crate::top::TopObject;

/// Slow-path attempts before giving up
pub const MAX_STATUS_ATTEMPTS: u32 = 5;

/// Writes a top's status, replaying the tick's modifiers against a fresh
/// copy when the fast path loses a race.
pub struct StatusWriter<'a, T: TopObject> {
    client: &'a Arc<dyn ClusterClient>,
    modifiers: &'a [StatusModifier<T>],
    error_message: Option<&'a str>,
}

impl<'a, T: TopObject> StatusWriter<'a, T> {
    /// Writer replaying `modifiers`, then marking `error_message` if any
    pub fn new(
        client: &'a Arc<dyn ClusterClient>,
        modifiers: &'a [StatusModifier<T>],
        error_message: Option<&'a str>,
    ) -> Self {
        Self {
            client,
            modifiers,
            error_message,
        }
    }

    /// Write `top`'s status
    pub async fn write(&self, top: &T) -> Result<()> {
        let ar = api_resource::<T>();
        match self.client.replace_status(&ar, &to_dynamic(top)?).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(name = %top.name_any(), error = %e, "status fast path failed, replaying");
            }
            Err(e) => return Err(e),
        }
        self.replay(top).await
    }

    async fn replay(&self, top: &T) -> Result<()> {
        let ar = api_resource::<T>();
        let ns = top.namespace().unwrap_or_default();
        let name = top.name_any();
        let mut last_error = String::new();

        for attempt in 1..=MAX_STATUS_ATTEMPTS {
            let Some(fresh) = self.client.get(&ar, &ns, &name).await? else {
                return Ok(());
            };
            let mut fresh: T = from_dynamic(fresh)?;
            for modifier in self.modifiers {
                modifier(&mut fresh)?;
            }
            if let Some(message) = self.error_message {
                fresh.set_error_status(message);
            }
            let body = to_dynamic(&fresh)?;

            let result = match self.client.replace_status(&ar, &body).await {
                Err(e) if e.is_not_found() => self.client.replace(&ar, &body).await,
                other => other,
            };
            match result {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(name = %name, attempt, error = %e, "status update attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(Error::StatusUpdate {
            attempts: MAX_STATUS_ATTEMPTS,
            message: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use kube::core::ErrorResponse;
    use summon_common::crd::{PlatformPhase, SummonPlatform, SummonPlatformSpec};

    fn platform() -> SummonPlatform {
        let mut p = SummonPlatform::new("foo", SummonPlatformSpec::default());
        p.metadata.namespace = Some("ns".into());
        p.metadata.resource_version = Some("1".into());
        p
    }

    fn api_err(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: "x".into(),
                reason: "x".into(),
                code,
            }),
        }
    }

    fn set_deploying() -> StatusModifier<SummonPlatform> {
        Arc::new(|p: &mut SummonPlatform| {
            p.status_mut().status = PlatformPhase::Deploying;
            Ok(())
        })
    }

    #[tokio::test]
    async fn fast_path_writes_once() {
        let mut mock = MockClusterClient::new();
        mock.expect_replace_status()
            .times(1)
            .returning(|_, obj| Ok(obj.clone()));
        mock.expect_get().never();
        let client: Arc<dyn ClusterClient> = Arc::new(mock);
        let modifiers = vec![set_deploying()];
        StatusWriter::new(&client, &modifiers, None)
            .write(&platform())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn replay_stops_when_top_is_gone() {
        let mut mock = MockClusterClient::new();
        mock.expect_replace_status()
            .times(1)
            .returning(|_, _| Err(api_err(409)));
        mock.expect_get().times(1).returning(|_, _, _| Ok(None));
        let client: Arc<dyn ClusterClient> = Arc::new(mock);
        let modifiers = vec![set_deploying()];
        StatusWriter::new(&client, &modifiers, None)
            .write(&platform())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn replay_gives_up_after_five_attempts() {
        let mut mock = MockClusterClient::new();
        mock.expect_replace_status()
            .times(1 + MAX_STATUS_ATTEMPTS as usize)
            .returning(|_, _| Err(api_err(409)));
        mock.expect_get()
            .times(MAX_STATUS_ATTEMPTS as usize)
            .returning(|_, _, _| Ok(Some(to_dynamic(&platform()).unwrap())));
        let client: Arc<dyn ClusterClient> = Arc::new(mock);
        let modifiers = vec![set_deploying()];
        let err = StatusWriter::new(&client, &modifiers, None)
            .write(&platform())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too many failures"));
    }

    #[tokio::test]
    async fn missing_status_subresource_falls_back_to_update() {
        let mut mock = MockClusterClient::new();
        mock.expect_replace_status()
            .times(2)
            .returning(|_, _| Err(api_err(404)));
        mock.expect_get()
            .times(1)
            .returning(|_, _, _| Ok(Some(to_dynamic(&platform()).unwrap())));
        mock.expect_replace()
            .times(1)
            .withf(|_, obj| obj.data["status"]["status"] == "Error")
            .returning(|_, obj| Ok(obj.clone()));
        let client: Arc<dyn ClusterClient> = Arc::new(mock);
        let modifiers = vec![set_deploying()];
        StatusWriter::new(&client, &modifiers, Some("postgres: boom"))
            .write(&platform())
            .await
            .unwrap();
    }
}
