//! Cloud identities and storage for an instance

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::core::ApiResource;
use serde_json::json;
use summon_common::config::PlatformConfig;
use summon_common::crd::{ChildPhase, GcpServiceAccount, IAMUser, S3Bucket, SummonPlatform};
use summon_common::template::filters::dns_label;
use summon_common::{extras, Error, Result};
use summon_engine::{api_resource, copy_desired, Component, ReconcileResult};

use super::{child_name, ChildStatus, Ctx, Outcome};
use crate::templates;

/// Bucket serving collected static assets
pub(crate) fn static_bucket_name(top: &SummonPlatform) -> String {
    format!("ridecell-{}-static", top.metadata.name.as_deref().unwrap_or_default())
}

/// Operator-managed media-in-vehicle bucket
pub(crate) fn managed_miv_bucket_name(top: &SummonPlatform) -> String {
    format!("ridecell-{}-miv", top.metadata.name.as_deref().unwrap_or_default())
}

/// MIV bucket the instance uses, external or managed
pub(crate) fn miv_bucket_name(top: &SummonPlatform) -> String {
    if top.spec.miv.existing_bucket.is_empty() {
        managed_miv_bucket_name(top)
    } else {
        top.spec.miv.existing_bucket.clone()
    }
}

fn bucket_policy(bucket: &str) -> serde_json::Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": ["s3:ListBucket", "s3:GetObject", "s3:PutObject", "s3:DeleteObject"],
            "Resource": [format!("arn:aws:s3:::{bucket}"), format!("arn:aws:s3:::{bucket}/*")],
        }],
    })
}

/// Inline policies for the workload IAM user, keyed by policy name
pub(crate) fn inline_policies(top: &SummonPlatform) -> Result<BTreeMap<String, String>> {
    let mut policies = BTreeMap::new();
    policies.insert(
        "allow_s3".to_string(),
        serde_json::to_string(&bucket_policy(&static_bucket_name(top)))?,
    );
    policies.insert(
        "allow_s3_miv".to_string(),
        serde_json::to_string(&bucket_policy(&miv_bucket_name(top)))?,
    );
    if !top.spec.sqs_queue.is_empty() {
        let sqs = json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Action": ["sqs:SendMessage", "sqs:GetQueueUrl"],
                "Resource": format!("arn:aws:sqs:{}:*:{}", top.spec.sqs_region, top.spec.sqs_queue),
            }],
        });
        policies.insert("allow_sqs".to_string(), serde_json::to_string(&sqs)?);
    }
    Ok(policies)
}

/// IAM user whose credentials the workloads run with
pub struct IamUserComponent {
    config: Arc<PlatformConfig>,
}

impl IamUserComponent {
    /// IAM users bounded by the operator's permissions boundary
    pub fn new(config: Arc<PlatformConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Component<SummonPlatform> for IamUserComponent {
    fn name(&self) -> &'static str {
        "iam-user"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<IAMUser>()]
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let extra = extras! {
            "policies" => inline_policies(&ctx.top)?,
            "permissions_boundary_arn" => self.config.permissions_boundary_arn.clone(),
        };
        let user = ctx
            .create_or_update::<IAMUser, _>(templates::IAM_USER, Some(&extra), copy_desired)
            .await?
            .object;
        if user.child_phase() == ChildPhase::Error {
            return Err(Error::child_failed("iam user", user.child_message()));
        }
        Ok(ReconcileResult::done())
    }
}

/// Public-read bucket for static assets
pub struct StaticBucket;

#[async_trait]
impl Component<SummonPlatform> for StaticBucket {
    fn name(&self) -> &'static str {
        "s3-static"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<S3Bucket>()]
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let bucket = static_bucket_name(&ctx.top);
        let policy = json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": "PublicReadForGetBucketObjects",
                "Effect": "Allow",
                "Principal": "*",
                "Action": ["s3:GetObject"],
                "Resource": [format!("arn:aws:s3:::{bucket}/*")],
            }],
        });
        let extra = extras! {
            "purpose" => "static",
            "bucket_name" => bucket,
            "bucket_policy" => serde_json::to_string(&policy)?,
        };
        ctx.create_or_update::<S3Bucket, _>(templates::S3_BUCKET, Some(&extra), copy_desired)
            .await?;
        Ok(ReconcileResult::done())
    }
}

/// Media-in-vehicle bucket, operator-managed unless an existing one is named
pub struct MivBucket;

#[async_trait]
impl Component<SummonPlatform> for MivBucket {
    fn name(&self) -> &'static str {
        "s3-miv"
    }

    fn is_reconcilable(&self, _ctx: &Ctx) -> bool {
        true
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let bucket = if ctx.top.spec.miv.existing_bucket.is_empty() {
            let bucket = managed_miv_bucket_name(&ctx.top);
            let extra = extras! {
                "purpose" => "miv",
                "bucket_name" => bucket.clone(),
            };
            ctx.create_or_update::<S3Bucket, _>(templates::S3_BUCKET, Some(&extra), copy_desired)
                .await?;
            bucket
        } else {
            ctx.delete::<S3Bucket>(&child_name(&ctx.top, '-', "miv")).await?;
            ctx.top.spec.miv.existing_bucket.clone()
        };
        Ok(ReconcileResult::modify(move |top: &mut SummonPlatform| {
            top.status_mut().miv.bucket = bucket.clone();
            Ok(())
        }))
    }
}

/// Workload service account in GCP, for instances with a GCP project
pub struct GcpServiceAccountComponent;

#[async_trait]
impl Component<SummonPlatform> for GcpServiceAccountComponent {
    fn name(&self) -> &'static str {
        "gcp-service-account"
    }

    fn watch_types(&self) -> Vec<ApiResource> {
        vec![api_resource::<GcpServiceAccount>()]
    }

    fn is_reconcilable(&self, ctx: &Ctx) -> bool {
        !ctx.top.spec.gcp_project.is_empty()
    }

    async fn reconcile(&self, ctx: &mut Ctx) -> Outcome {
        let mut account_id = dns_label(&format!("summon-{}", ctx.name()));
        account_id.truncate(30);
        let extra = extras! { "account_id" => account_id.trim_end_matches('-') };
        let account = ctx
            .create_or_update::<GcpServiceAccount, _>(
                templates::GCP_SERVICE_ACCOUNT,
                Some(&extra),
                copy_desired,
            )
            .await?
            .object;
        if account.child_phase() == ChildPhase::Error {
            return Err(Error::child_failed("gcp service account", account.child_message()));
        }
        Ok(ReconcileResult::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use summon_common::crd::SummonPlatformSpec;

    fn platform(existing_miv: &str, sqs: &str) -> SummonPlatform {
        SummonPlatform::new(
            "foo",
            SummonPlatformSpec {
                sqs_queue: sqs.into(),
                sqs_region: "us-west-2".into(),
                miv: summon_common::crd::MivSpec {
                    existing_bucket: existing_miv.into(),
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn miv_bucket_prefers_existing() {
        assert_eq!(miv_bucket_name(&platform("", "")), "ridecell-foo-miv");
        assert_eq!(miv_bucket_name(&platform("legacy-miv", "")), "legacy-miv");
    }

    #[test]
    fn policies_cover_buckets_and_optional_queue() {
        let p = inline_policies(&platform("", "")).unwrap();
        assert_eq!(p.keys().collect::<Vec<_>>(), vec!["allow_s3", "allow_s3_miv"]);
        assert!(p["allow_s3"].contains("arn:aws:s3:::ridecell-foo-static/*"));

        let p = inline_policies(&platform("", "foo-events")).unwrap();
        assert!(p["allow_sqs"].contains("arn:aws:sqs:us-west-2:*:foo-events"));
    }
}
