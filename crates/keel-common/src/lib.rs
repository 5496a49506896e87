//! Common types for keel: the ClusterProvision CRD, conditions, errors and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod telemetry;

pub use error::Error;

/// Label on a backing job naming the ClusterProvision it belongs to
pub const CLUSTER_PROVISION_NAME_LABEL: &str = "keel.dev/cluster-provision";

/// Label on a backing job identifying what kind of job it is
pub const JOB_TYPE_LABEL: &str = "keel.dev/job-type";

/// Value of [`JOB_TYPE_LABEL`] for install jobs
pub const JOB_TYPE_PROVISION: &str = "provision";

/// Label selector matching every provision job (for watches)
pub const PROVISION_JOB_SELECTOR: &str = "keel.dev/job-type=provision";

/// Field manager used for all writes made by the operator
pub const FIELD_MANAGER: &str = "keel-provision-controller";

/// Build the label selector locating the job of a given attempt
pub fn provision_job_selector(attempt_name: &str) -> String {
    format!(
        "{}={},{}={}",
        CLUSTER_PROVISION_NAME_LABEL, attempt_name, JOB_TYPE_LABEL, JOB_TYPE_PROVISION
    )
}
