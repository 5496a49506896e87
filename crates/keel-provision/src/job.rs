//! Installer job generation
//!
//! The job is what correlates back to its attempt: the two labels are the
//! adoption protocol and the owner reference lets garbage collection remove
//! the job with the attempt.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use keel_common::crd::ClusterProvision;
use keel_common::{Error, CLUSTER_PROVISION_NAME_LABEL, JOB_TYPE_LABEL, JOB_TYPE_PROVISION};

use crate::observe::attempt_namespace;

/// Suffix appended to the attempt name to form the job name
pub const JOB_NAME_SUFFIX: &str = "-provision";

/// Longest value Kubernetes accepts for a label (and so for a job name)
pub(crate) const MAX_LABEL_VALUE_LEN: usize = 63;

/// Operator-level settings for the installer job
#[derive(Clone, Debug)]
pub struct InstallerSettings {
    /// Installer container image
    pub image: String,
    /// Image pull policy (Always, IfNotPresent, Never)
    pub image_pull_policy: Option<String>,
    /// Service account the installer runs as
    pub service_account: Option<String>,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            image: "ghcr.io/keel-dev/installer:latest".to_string(),
            image_pull_policy: None,
            service_account: None,
        }
    }
}

/// Hex digits of the attempt-name digest kept in shortened job names
const NAME_HASH_LEN: usize = 8;

/// Name of the job backing an attempt
///
/// Names too long to fit are shortened and tagged with a digest of the full
/// attempt name, so attempts sharing a long prefix still get distinct jobs.
pub fn job_name(attempt_name: &str) -> String {
    let max_prefix = MAX_LABEL_VALUE_LEN - JOB_NAME_SUFFIX.len();
    if attempt_name.len() <= max_prefix {
        return format!("{attempt_name}{JOB_NAME_SUFFIX}");
    }

    let mut hasher = Sha256::new();
    hasher.update(attempt_name.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    let keep = max_prefix - NAME_HASH_LEN - 1;
    let prefix = attempt_name
        .get(..keep)
        .unwrap_or(attempt_name)
        .trim_end_matches('-');
    format!("{prefix}-{}{JOB_NAME_SUFFIX}", &digest[..NAME_HASH_LEN])
}

/// Build the installer job for an attempt
pub fn build_installer_job(
    provision: &ClusterProvision,
    settings: &InstallerSettings,
) -> Result<Job, Error> {
    let name = provision.name_any();
    let namespace = attempt_namespace(provision)?;
    if name.len() > MAX_LABEL_VALUE_LEN {
        return Err(Error::validation_for(
            format!("{namespace}/{name}"),
            format!("name longer than {MAX_LABEL_VALUE_LEN} characters cannot be used as a label value"),
        ));
    }

    let labels = BTreeMap::from([
        (CLUSTER_PROVISION_NAME_LABEL.to_string(), name.clone()),
        (JOB_TYPE_LABEL.to_string(), JOB_TYPE_PROVISION.to_string()),
    ]);

    let env = vec![
        EnvVar {
            name: "CLUSTER_PROVISION_NAME".to_string(),
            value: Some(name.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "CLUSTER_PROVISION_NAMESPACE".to_string(),
            value: Some(namespace.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "CLUSTER_DEPLOYMENT_NAME".to_string(),
            value: Some(provision.spec.cluster_deployment.clone()),
            ..Default::default()
        },
    ];

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name(&name)),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            owner_references: provision.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: settings.service_account.clone(),
                    containers: vec![Container {
                        name: "installer".to_string(),
                        image: Some(settings.image.clone()),
                        image_pull_policy: settings.image_pull_policy.clone(),
                        env: Some(env),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
