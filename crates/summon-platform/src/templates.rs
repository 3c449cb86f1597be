//! Bundled child templates

use summon_common::template::{TemplateRenderer, TemplateSource};
use summon_common::Result;

/// Workload Deployment for one role
pub const DEPLOYMENT: &str = "deployment.yml.j2";
/// Workload StatefulSet for one role
pub const STATEFULSET: &str = "statefulset.yml.j2";
/// Service in front of one role
pub const SERVICE: &str = "service.yml.j2";
/// Public ingress for one role
pub const INGRESS: &str = "ingress.yml.j2";
/// Disruption budget for one role
pub const PDB: &str = "pdb.yml.j2";
/// Autoscaler for one role
pub const HPA: &str = "hpa.yml.j2";
/// Prometheus scrape target for one role
pub const SERVICE_MONITOR: &str = "servicemonitor.yml.j2";
/// Image pull credentials
pub const PULL_SECRET: &str = "pull_secret.yml.j2";
/// Database
pub const POSTGRES: &str = "postgres.yml.j2";
/// Broker vhost
pub const RABBITMQ: &str = "rabbitmq.yml.j2";
/// Workload IAM user
pub const IAM_USER: &str = "iam_user.yml.j2";
/// Storage bucket, parameterised by purpose
pub const S3_BUCKET: &str = "s3_bucket.yml.j2";
/// GCP service account
pub const GCP_SERVICE_ACCOUNT: &str = "gcp_service_account.yml.j2";
/// Mock car server tenant
pub const MOCK_CAR_SERVER_TENANT: &str = "mock_car_server_tenant.yml.j2";
/// Pre-migration snapshot
pub const RDS_SNAPSHOT: &str = "rds_snapshot.yml.j2";
/// Migration job
pub const MIGRATIONS: &str = "migrations.yml.j2";

const BUNDLE: &[TemplateSource] = &[
    (DEPLOYMENT, include_str!("../templates/deployment.yml.j2")),
    (STATEFULSET, include_str!("../templates/statefulset.yml.j2")),
    (SERVICE, include_str!("../templates/service.yml.j2")),
    (INGRESS, include_str!("../templates/ingress.yml.j2")),
    (PDB, include_str!("../templates/pdb.yml.j2")),
    (HPA, include_str!("../templates/hpa.yml.j2")),
    (SERVICE_MONITOR, include_str!("../templates/servicemonitor.yml.j2")),
    (PULL_SECRET, include_str!("../templates/pull_secret.yml.j2")),
    (POSTGRES, include_str!("../templates/postgres.yml.j2")),
    (RABBITMQ, include_str!("../templates/rabbitmq.yml.j2")),
    (IAM_USER, include_str!("../templates/iam_user.yml.j2")),
    (S3_BUCKET, include_str!("../templates/s3_bucket.yml.j2")),
    (GCP_SERVICE_ACCOUNT, include_str!("../templates/gcp_service_account.yml.j2")),
    (MOCK_CAR_SERVER_TENANT, include_str!("../templates/mock_car_server_tenant.yml.j2")),
    (RDS_SNAPSHOT, include_str!("../templates/rds_snapshot.yml.j2")),
    (MIGRATIONS, include_str!("../templates/migrations.yml.j2")),
];

/// Renderer over every bundled template
pub fn renderer() -> Result<TemplateRenderer> {
    TemplateRenderer::new(BUNDLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::networking::v1::Ingress;
    use summon_common::crd::{MigrationJob, SummonPlatform, SummonPlatformSpec};
    use summon_common::extras;

    fn platform() -> SummonPlatform {
        let mut p = SummonPlatform::new(
            "foo",
            SummonPlatformSpec {
                hostname: "foo.ridecell.us".into(),
                version: "1.2.3".into(),
                ..Default::default()
            },
        );
        p.metadata.namespace = Some("summon-dev".into());
        p
    }

    #[test]
    fn bundle_compiles() {
        let r = renderer().unwrap();
        for (id, _) in BUNDLE {
            assert!(r.has(id), "{id} missing");
        }
    }

    #[test]
    fn deployment_carries_role_labels_and_hashes() {
        let r = renderer().unwrap();
        let extra = extras! {
            "role" => "web",
            "replicas" => 2,
            "image" => "us.gcr.io/ridecell-1/summon:1.2.3",
            "command" => ["python", "-m", "twisted"],
            "port" => 8000,
            "mount_app" => true,
            "resources" => serde_json::json!({}),
            "annotations" => serde_json::json!({"summon.ridecell.io/configHash": "abc"}),
        };
        let d: Deployment = r.render(DEPLOYMENT, &platform(), Some(&extra)).unwrap();
        assert_eq!(d.metadata.name.as_deref(), Some("foo-web"));
        let spec = d.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let template = spec.template;
        let annotations = template.metadata.unwrap().annotations.unwrap();
        assert_eq!(annotations["summon.ridecell.io/configHash"], "abc");
        let pod = template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("us.gcr.io/ridecell-1/summon:1.2.3"));
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, "pull-secret");
        assert_eq!(pod.volumes.unwrap().len(), 2);
    }

    #[test]
    fn ingress_lists_every_host_under_one_tls_secret() {
        let r = renderer().unwrap();
        let extra = extras! {
            "role" => "web",
            "port" => 8000,
            "path" => "/",
            "hosts" => ["foo.ridecell.us", "foo.example.com"],
        };
        let ing: Ingress = r.render(INGRESS, &platform(), Some(&extra)).unwrap();
        let spec = ing.spec.unwrap();
        let tls = &spec.tls.unwrap()[0];
        assert_eq!(tls.secret_name.as_deref(), Some("foo-tls"));
        assert_eq!(tls.hosts.as_ref().unwrap().len(), 2);
        assert_eq!(spec.rules.unwrap().len(), 2);
    }

    #[test]
    fn migration_job_runs_command_through_shell() {
        let r = renderer().unwrap();
        let extra = extras! {
            "image" => "us.gcr.io/ridecell-1/summon:1.2.3",
            "command" => "python manage.py migrate --noinput",
        };
        let job: MigrationJob = r.render(MIGRATIONS, &platform(), Some(&extra)).unwrap();
        assert_eq!(job.spec.version, "1.2.3");
        let pod = job.spec.template.template.spec.unwrap();
        let command = pod.containers[0].command.clone().unwrap();
        assert_eq!(command, vec!["sh", "-c", "python manage.py migrate --noinput"]);
    }
}
