//! Read-only view of the backing job and its pods
//!
//! "Not found" is a value here, not an error: the state machine branches on
//! it. Any other read failure propagates.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, warn};

use keel_common::crd::ClusterProvision;
use keel_common::{provision_job_selector, Error};

use crate::client::ProvisionClient;
use crate::job::MAX_LABEL_VALUE_LEN;

/// What the cluster currently holds for an attempt's backing job
#[derive(Clone, Debug)]
pub enum JobObservation {
    /// The attempt references a job and it exists
    Referenced(Job),
    /// The attempt references a job that no longer exists
    ReferencedMissing {
        /// Name the attempt points at
        name: String,
    },
    /// No reference yet, but a job carrying the attempt's labels exists
    Adoptable(Job),
    /// No reference and no labelled job
    Absent,
}

/// Execution state of a job, derived from its conditions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Still running or waiting to run
    Active,
    /// The `Complete` condition is True
    Complete,
    /// The `Failed` condition is True
    Failed,
}

/// Namespace of an attempt; every attempt is namespaced
pub fn attempt_namespace(provision: &ClusterProvision) -> Result<String, Error> {
    provision.namespace().ok_or_else(|| {
        Error::validation_for(provision.name_any(), "ClusterProvision has no namespace")
    })
}

/// Locate the backing job of an attempt
///
/// With a job reference the job is fetched directly; without one, jobs are
/// searched by the attempt-name and job-type labels so that a job created out
/// of band (or whose reference was never written) can be adopted.
pub async fn observe_job(
    client: &dyn ProvisionClient,
    provision: &ClusterProvision,
) -> Result<JobObservation, Error> {
    let namespace = attempt_namespace(provision)?;

    if let Some(name) = provision.job_ref_name() {
        return Ok(match client.get_job(&namespace, name).await? {
            Some(job) => JobObservation::Referenced(job),
            None => JobObservation::ReferencedMissing {
                name: name.to_string(),
            },
        });
    }

    let attempt = provision.name_any();
    if attempt.len() > MAX_LABEL_VALUE_LEN {
        // no job can carry this label value, and the API rejects the selector
        debug!(attempt = %attempt, "attempt name is not a valid label value");
        return Ok(JobObservation::Absent);
    }

    let selector = provision_job_selector(&attempt);
    let mut candidates = client.list_jobs(&namespace, &selector).await?;
    if candidates.len() > 1 {
        warn!(
            attempt = %attempt,
            namespace = %namespace,
            jobs = candidates.len(),
            "multiple provision jobs match attempt; adopting the oldest"
        );
    }
    candidates.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .cmp(&b.metadata.creation_timestamp.as_ref().map(|t| t.0))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });

    Ok(match candidates.into_iter().next() {
        Some(job) => {
            debug!(attempt = %attempt, job = %job.name_any(), "found adoptable job");
            JobObservation::Adoptable(job)
        }
        None => JobObservation::Absent,
    })
}

/// Label selector matching the pods of a job
///
/// Uses the job's own selector; falls back to the `job-name` label the job
/// controller puts on every pod.
pub fn pod_selector(job: &Job) -> String {
    let match_labels = job
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .and_then(|s| s.match_labels.as_ref())
        .filter(|labels| !labels.is_empty());

    match match_labels {
        Some(labels) => labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
        None => format!("job-name={}", job.name_any()),
    }
}

/// Pods belonging to a job
pub async fn observe_pods(
    client: &dyn ProvisionClient,
    namespace: &str,
    job: &Job,
) -> Result<Vec<Pod>, Error> {
    client.list_pods(namespace, &pod_selector(job)).await
}

fn job_condition(job: &Job, type_: &str) -> Option<(String, String)> {
    job.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_ && c.status == "True")
        .map(|c| {
            (
                c.reason.clone().unwrap_or_default(),
                c.message.clone().unwrap_or_default(),
            )
        })
}

/// Derive the execution state of a job from its conditions
pub fn job_state(job: &Job) -> JobState {
    if job_condition(job, "Complete").is_some() {
        JobState::Complete
    } else if job_condition(job, "Failed").is_some() {
        JobState::Failed
    } else {
        JobState::Active
    }
}

/// Reason and message of a job's `Failed` condition, if it has one
pub fn job_failure(job: &Job) -> Option<(String, String)> {
    job_condition(job, "Failed")
}

/// Phase of a pod, empty when the kubelet has not reported one
pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}
